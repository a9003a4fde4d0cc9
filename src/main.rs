//! vpnpolicy - VPN gateway access policy engine
//!
//! Operator CLI over the persisted policy store.
//!
//! The CLI runs with offline collaborators: no address is allocated and
//! nothing is written to iptables. Enforcement is logged as a dry run, so
//! every command is safe to run on a live gateway.
//!
//! # Usage
//!
//! ```bash
//! vpnpolicy instances                       # List registered instances
//! vpnpolicy groups --instance office        # Groups of one instance
//! vpnpolicy rules office_developers         # Ordered ACL of a group
//! vpnpolicy machine-rules --by-bucket       # Machine rules per chain bucket
//! vpnpolicy preview --group office_developers
//! vpnpolicy resolve --instance office --client alice \
//!     --protocol tcp --destination 10.0.0.5 --port 22
//! vpnpolicy check                           # Verify dense ordering
//! vpnpolicy request create_rule.json        # Run a JSON command
//! ```

use clap::{Parser, Subcommand};
use shadow_rs::shadow;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use vpnpolicy::api;
use vpnpolicy::audit::AuditLog;
use vpnpolicy::config::{self, AppConfig};
use vpnpolicy::core::collaborators::{LoggingDriver, OfflineAllocator};
use vpnpolicy::core::error::StoreError;
use vpnpolicy::core::resolver::Flow;
use vpnpolicy::core::rule::Protocol;
use vpnpolicy::utils;
use vpnpolicy::validators;
use vpnpolicy::{EngineOptions, PolicyEngine};

shadow!(build);

#[derive(Parser)]
#[command(name = "vpnpolicy")]
#[command(about = "Access policy engine for multi-tenant VPN gateways", long_about = None)]
#[command(version = build::CLAP_LONG_VERSION)]
struct Cli {
    /// Policy store to use instead of the configured one
    #[arg(long, global = true, value_name = "PATH")]
    store: Option<PathBuf>,
    /// Log at DEBUG level
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered VPN instances
    Instances,
    /// List groups and their members
    Groups {
        /// Only groups of this instance
        #[arg(short, long, value_name = "ID")]
        instance: Option<String>,
    },
    /// Show a group's rules in evaluation order
    Rules {
        /// Group identifier (<instance>_<name>)
        group: String,
    },
    /// Show machine rules in global order
    MachineRules {
        /// Group by INPUT/OUTPUT/FORWARD/OTHER
        #[arg(long)]
        by_bucket: bool,
    },
    /// Print advisory iptables commands
    Preview {
        /// Preview a group's per-member rules instead of machine rules
        #[arg(short, long)]
        group: Option<String>,
    },
    /// Resolve the verdict for one flow
    Resolve {
        #[arg(long, value_name = "ID")]
        instance: String,
        #[arg(long, value_name = "NAME")]
        client: String,
        #[arg(long, default_value = "tcp")]
        protocol: String,
        #[arg(long, value_name = "IP")]
        destination: String,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Verify that every scope has dense rule ordering
    Check,
    /// Dispatch a JSON request document through the command surface
    Request {
        /// File holding one request object
        file: PathBuf,
    },
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    if let Some(mut log_path) = utils::get_state_dir() {
        log_path.push("vpnpolicy.log");
        if let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
        {
            tracing_subscriber::fmt()
                .with_max_level(level)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
            return;
        }
    }
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let _ = utils::ensure_dirs();
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn open_engine(store: Option<PathBuf>, config: &AppConfig) -> Result<PolicyEngine, Box<dyn std::error::Error>> {
    let path = store
        .or_else(|| config.resolved_store_path())
        .ok_or(StoreError::LocationUnavailable)?;

    let mut engine = PolicyEngine::open(
        &path,
        Arc::new(OfflineAllocator),
        Arc::new(LoggingDriver),
        EngineOptions::from(config),
    )
    .await?;

    if config.audit_enabled {
        match AuditLog::new() {
            Ok(audit) => engine = engine.with_audit(audit),
            Err(e) => tracing::warn!("Audit log disabled: {}", e),
        }
    }
    Ok(engine)
}

async fn handle_cli(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = config::load_config().await;
    let engine = open_engine(cli.store, &config).await?;

    match cli.command {
        Commands::Instances => {
            let instances = engine.get_instances().await?;
            if instances.is_empty() {
                println!("No instances registered.");
            }
            for i in instances {
                println!(
                    "{}  {}  {}/{}  subnet {}  {} tunnel  default {}",
                    i.id,
                    i.name,
                    i.port,
                    i.protocol,
                    i.subnet,
                    i.tunnel_mode,
                    i.firewall_default_policy
                );
            }
        }
        Commands::Groups { instance } => {
            for group in engine.get_groups(instance.as_deref()).await? {
                println!("{} ({}) - {} members", group.id, group.name, group.members.len());
                for member in &group.members {
                    let ip = member
                        .ip
                        .map_or_else(|| "-".to_string(), |ip| ip.to_string());
                    println!("    {:<24} {}", member.client_id, ip);
                }
            }
        }
        Commands::Rules { group } => {
            for rule in engine.get_rules(&group).await? {
                let port = rule.port.as_ref().map(ToString::to_string).unwrap_or_default();
                println!(
                    "{:>3}  {:<7} {:<5} {:<18} {:<12} {}",
                    rule.order,
                    rule.action,
                    rule.protocol,
                    rule.destination,
                    port,
                    utils::truncate_string(&rule.description, 40)
                );
            }
        }
        Commands::MachineRules { by_bucket } => {
            if by_bucket {
                for (bucket, rules) in engine.machine_rule_buckets().await? {
                    println!("{bucket}:");
                    for rule in rules {
                        println!("  {:>3}  {}", rule.order, rule.preview());
                    }
                }
            } else {
                for rule in engine.get_machine_rules().await? {
                    println!("{:>3}  {}", rule.order, rule.preview());
                }
            }
        }
        Commands::Preview { group } => {
            let lines = match group {
                Some(group) => engine.preview_group_rules(&group).await?,
                None => engine.preview_machine_rules().await?,
            };
            for line in lines {
                println!("{line}");
            }
        }
        Commands::Resolve {
            instance,
            client,
            protocol,
            destination,
            port,
        } => {
            let protocol: Protocol = protocol
                .parse()
                .map_err(|_| format!("unknown protocol '{protocol}'"))?;
            let destination = validators::parse_ipv4(&destination)?;
            let flow = Flow {
                protocol,
                destination,
                port,
            };
            let (resolution, failure) = engine.resolve_or_drop(&instance, &client, &flow).await;
            println!("{} ({})", resolution.verdict, resolution.source);
            if let Some(group) = resolution.group_id {
                println!("  group: {group}");
            }
            if let Some(rule) = resolution.matched_rule {
                println!("  rule:  {rule}");
            }
            if let Some(err) = failure {
                return Err(err.into());
            }
        }
        Commands::Check => {
            let reports = engine.check_integrity().await?;
            let mut broken = 0;
            for report in &reports {
                match report.problem {
                    Some(ref problem) => {
                        broken += 1;
                        println!("✗ {} ({} rules): {}", report.scope, report.rule_count, problem);
                    }
                    None => println!("✓ {} ({} rules)", report.scope, report.rule_count),
                }
            }
            if broken > 0 {
                return Err(format!("{broken} scopes need a full reorder").into());
            }
        }
        Commands::Request { file } => {
            let json = tokio::fs::read_to_string(&file).await?;
            let response = api::dispatch_json(&engine, &json).await;
            println!("{}", serde_json::to_string_pretty(&response)?);
            if !response.success {
                return Err("request failed".into());
            }
        }
    }
    Ok(())
}
