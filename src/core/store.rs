//! Policy store persistence
//!
//! The whole policy state is kept in one JSON document:
//!
//! ```json
//! { "version": 1, "checksum": "<sha256 hex>", "snapshot": { ... } }
//! ```
//!
//! The checksum covers the compact serialization of `snapshot`. Writes go
//! through [`crate::utils::write_atomic`].

use crate::core::error::{Result, StoreError};
use crate::core::group::Group;
use crate::core::instance::Instance;
use crate::core::machine::MachineRule;
use crate::core::rule::Rule;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;

pub const STORE_VERSION: u32 = 1;

/// Full policy state
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Snapshot {
    #[serde(default)]
    pub instances: Vec<Instance>,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub machine_rules: Vec<MachineRule>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    checksum: String,
    snapshot: serde_json::Value,
}

fn checksum_of(snapshot: &serde_json::Value) -> Result<String> {
    let canonical = serde_json::to_string(snapshot)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

impl Snapshot {
    /// Drops groups of unknown instances and rules of unknown groups.
    ///
    /// Order values are left as they are.
    pub fn prune_orphans(&mut self) {
        let instance_ids: HashSet<&str> = self.instances.iter().map(|i| i.id.as_str()).collect();
        let before = self.groups.len();
        self.groups
            .retain(|g| instance_ids.contains(g.instance_id.as_str()));
        if self.groups.len() != before {
            tracing::warn!(
                "Dropped {} groups referencing unknown instances",
                before - self.groups.len()
            );
        }

        let group_ids: HashSet<&str> = self.groups.iter().map(|g| g.id.as_str()).collect();
        let before = self.rules.len();
        self.rules.retain(|r| group_ids.contains(r.group_id.as_str()));
        if self.rules.len() != before {
            tracing::warn!(
                "Dropped {} rules referencing unknown groups",
                before - self.rules.len()
            );
        }
    }
}

/// Loads the store at `path`.
///
/// Returns `Ok(None)` if the file does not exist.
///
/// # Errors
///
/// Returns [`StoreError::VersionMismatch`] or [`StoreError::ChecksumMismatch`]
/// for a file this build cannot trust, or an I/O/JSON error.
///
/// # Async
/// Uses `tokio::fs` for non-blocking file I/O.
pub async fn load(path: &Path) -> Result<Option<Snapshot>> {
    if !tokio::fs::try_exists(path).await? {
        return Ok(None);
    }

    let json = tokio::fs::read_to_string(path).await?;
    let file: StoreFile = serde_json::from_str(&json)?;

    if file.version != STORE_VERSION {
        return Err(StoreError::VersionMismatch {
            found: file.version,
            expected: STORE_VERSION,
        }
        .into());
    }

    let actual = checksum_of(&file.snapshot)?;
    if actual != file.checksum {
        return Err(StoreError::ChecksumMismatch {
            expected: file.checksum,
            actual,
        }
        .into());
    }

    let mut snapshot: Snapshot = serde_json::from_value(file.snapshot)?;
    snapshot.prune_orphans();

    tracing::info!(
        "Loaded policy store: {} instances, {} groups, {} rules, {} machine rules",
        snapshot.instances.len(),
        snapshot.groups.len(),
        snapshot.rules.len(),
        snapshot.machine_rules.len()
    );
    Ok(Some(snapshot))
}

/// Saves `snapshot` to `path` atomically.
///
/// # Async
/// Uses `tokio::fs` for non-blocking file I/O.
pub async fn save(path: &Path, snapshot: &Snapshot) -> Result<()> {
    let value = serde_json::to_value(snapshot)?;
    let file = StoreFile {
        version: STORE_VERSION,
        checksum: checksum_of(&value)?,
        snapshot: value,
    };
    let json = serde_json::to_string_pretty(&file)?;
    crate::utils::write_atomic(path, json.as_bytes()).await?;
    tracing::debug!("Saved policy store to {}", path.display());
    Ok(())
}
