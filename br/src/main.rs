use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tokio_util::sync::CancellationToken;

use br::registry::HttpConnector;
use br::transport::{format_bytes, Transporter};
use br::{
    cleanup_backup, BackupConfig, BackupManifest, MappingPolicy, RestoreConfig,
    RestoreCoordinator, Settings, SnapshotCoordinator,
};

#[derive(Parser, Debug)]
#[command(name = "br", version, about = "Backup and restore a meta/storage cluster")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Maximum concurrent node calls or transfers per phase
    #[arg(long, global = true)]
    fan_out: Option<usize>,

    /// Per-call timeout in seconds
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Take a consistent backup of the cluster
    Backup {
        /// Backup config (YAML)
        #[arg(short, long)]
        config: PathBuf,

        /// Backup name; defaults to BACKUP_<utc timestamp>
        #[arg(long)]
        name: Option<String>,

        /// Skip storage nodes that cannot be reached and record a warning
        #[arg(long)]
        tolerate_unreachable_storage: bool,
    },

    /// Restore a published backup onto the cluster
    Restore {
        /// Restore config (YAML)
        #[arg(short, long)]
        config: PathBuf,

        #[arg(long, value_enum, default_value_t = Mapping::Positional)]
        mapping: Mapping,

        /// Explicit source-to-target address pair; implies explicit mapping
        #[arg(long = "map", value_name = "SRC=DST")]
        map: Vec<String>,
    },

    /// List published backups on a backend
    Show {
        /// Backend URL, e.g. local:///var/backups
        #[arg(long)]
        backend: String,
    },

    /// Drop leftovers of an interrupted backup
    Cleanup {
        /// Backup config (YAML)
        #[arg(short, long)]
        config: PathBuf,

        #[arg(long)]
        name: String,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Mapping {
    Positional,
    RoundRobin,
    Explicit,
}

fn mapping_policy(mapping: Mapping, pairs: &[String]) -> anyhow::Result<MappingPolicy> {
    if !pairs.is_empty() {
        return Ok(MappingPolicy::from_pairs(pairs)?);
    }
    match mapping {
        Mapping::Positional => Ok(MappingPolicy::Positional),
        Mapping::RoundRobin => Ok(MappingPolicy::RoundRobin),
        Mapping::Explicit => anyhow::bail!("--mapping explicit needs at least one --map SRC=DST"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut settings = Settings::from_env();
    if let Some(level) = args.log_level {
        settings.log_level = level;
    }
    if let Some(fan_out) = args.fan_out {
        settings.fan_out = fan_out.max(1);
    }
    if let Some(secs) = args.timeout_secs {
        settings.call_timeout = Duration::from_secs(secs);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| settings.log_level.as_str().into()),
        )
        .with_target(false)
        .init();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, aborting the run");
            on_signal.cancel();
        }
    });

    match args.command {
        Command::Backup {
            config,
            name,
            tolerate_unreachable_storage,
        } => {
            let config = BackupConfig::from_file(&config)?;
            settings.tolerate_unreachable_storage |= tolerate_unreachable_storage;
            let connector = Arc::new(HttpConnector::new(&settings)?);
            let coordinator = SnapshotCoordinator::new(connector, settings);
            let manifest = match name {
                Some(name) => coordinator.create_named_backup(&config, &name, &cancel).await?,
                None => coordinator.create_backup(&config, &cancel).await?,
            };
            println!(
                "Backup {} created: {} meta, {} storage nodes, {}",
                manifest.name,
                manifest.meta_nodes.len(),
                manifest.storage_nodes.len(),
                format_bytes(manifest.total_bytes())
            );
            for warning in &manifest.warnings {
                println!("warning: {}", warning);
            }
        }
        Command::Restore { config, mapping, map } => {
            let config = RestoreConfig::from_file(&config)?;
            let policy = mapping_policy(mapping, &map)?;
            let connector = Arc::new(HttpConnector::new(&settings)?);
            let report = RestoreCoordinator::new(connector, settings)
                .restore_backup(&config, &policy, &cancel)
                .await?;
            println!("Restored {}", report);
        }
        Command::Show { backend } => {
            let transporter = Transporter::open(&backend, &settings.transfer_options())?;
            transporter.backend().check().await?;
            let manifests = BackupManifest::list(transporter.backend()).await?;
            if manifests.is_empty() {
                println!("No backups on {}", backend);
            }
            for m in manifests {
                println!(
                    "{:<28} {}  spaces={:?} meta={} storage={} size={}",
                    m.name,
                    m.created_at.format("%Y-%m-%d %H:%M:%S"),
                    m.space_names,
                    m.meta_nodes.len(),
                    m.storage_nodes.len(),
                    format_bytes(m.total_bytes())
                );
            }
        }
        Command::Cleanup { config, name } => {
            let config = BackupConfig::from_file(&config)?;
            let connector = Arc::new(HttpConnector::new(&settings)?);
            let report = cleanup_backup(connector, &settings, &config, &name, &cancel).await?;
            println!("Cleaned {}", report);
        }
    }

    Ok(())
}
