//! vpnpolicy - VPN gateway access policy engine
//!
//! Layered access control for a multi-tenant OpenVPN gateway: per-instance
//! default policy, per-group ordered ACL rules, and gateway-wide iptables
//! rules.
//!
//! # Architecture
//!
//! - [`core`] - Policy model, ordering, resolution, persistence and the engine
//! - [`api`] - JSON request/response command surface
//! - [`audit`] - Audit trail of policy changes and corruption alerts
//! - [`validators`] - Input validation and sanitization
//! - [`config`] - Configuration persistence
//! - [`utils`] - Utility functions (XDG directories, atomic writes)
//!
//! # Guarantees
//!
//! - Rule order in every scope is dense (`0..N`) after each operation
//! - Reorders must name the complete rule set of the scope
//! - Resolution fails closed on corrupted scopes
//! - SHA-256 store checksums
//! - Atomic file operations with secure permissions

#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod api;
pub mod audit;
pub mod config;
pub mod core;
pub mod utils;
pub mod validators;

pub use core::engine::{EngineOptions, PolicyEngine};
pub use core::error::{Error, Result};
