use anyhow::Context as _;
use clap::Parser;
use log::{info, warn};
use mctd::config::Config;
use mctd::daemon::{Daemon, DaemonState};
use mctd::events::{self, Core};
use mctd::filter::MessageFilter;
use mctd::logstorage::LogStorageManager;
use mctd::offline_trace::OfflineTrace;
use mctd::protocol::{Id4, LogLevel, TraceStatus};
use mctd::registry::Registry;
use mctd::stats::Stats;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(name = "mctd")]
#[command(about = "MCT diagnostic log broker daemon")]
struct Args {
    /// Path to config file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Validate configuration and exit
    #[arg(long)]
    dry_run: bool,
}

/// Values restored from the persisted runtime configuration. It must be
/// applied before the application/context files since the ECU id scopes
/// those tables.
#[derive(Debug, Default)]
struct RuntimeDefaults {
    ecu_id: Option<String>,
    default_log_level: Option<i8>,
    default_trace_status: Option<i8>,
}

fn load_runtime_configuration(path: &Path) -> RuntimeDefaults {
    let mut defaults = RuntimeDefaults::default();
    let Ok(text) = std::fs::read_to_string(path) else {
        return defaults;
    };
    for line in text.lines() {
        let Some((key, value)) = line.split_once('=') else { continue };
        match key.trim() {
            "ECUId" => defaults.ecu_id = Some(value.trim().to_string()),
            "DefaultLogLevel" => defaults.default_log_level = value.trim().parse().ok(),
            "DefaultTraceStatus" => defaults.default_trace_status = value.trim().parse().ok(),
            other => warn!("unknown runtime configuration key '{other}'"),
        }
    }
    defaults
}

fn build_daemon(config: &Config) -> Daemon {
    let runtime = load_runtime_configuration(&config.runtime_cfg_path());

    let ecu_id = runtime.ecu_id.as_deref().unwrap_or(&config.daemon.ecu_id);
    let default_log_level = runtime
        .default_log_level
        .unwrap_or(config.defaults.context_log_level);
    let default_trace_status = runtime
        .default_trace_status
        .unwrap_or(config.defaults.context_trace_status);

    let mut daemon = Daemon::new(
        Id4::new(ecu_id),
        LogLevel::from_i8(default_log_level).unwrap_or(LogLevel::Info),
        TraceStatus::from_i8(default_trace_status).unwrap_or(TraceStatus::Off),
        config.defaults.force_context_ll_and_ts,
        config.ringbuffer.min_size,
        config.ringbuffer.max_size,
        config.ringbuffer.step_size,
    );
    daemon.send_serial_header = config.daemon.send_serial_header;
    daemon.timing_packets = config.daemon.timing_packets;
    daemon.allow_block_mode = config.daemon.allow_block_mode;
    daemon.maintain_logstorage_loglevel = config.logstorage.maintain_loglevel;

    if config.daemon.send_ecu_software_version {
        daemon.ecu_version = config
            .daemon
            .ecu_version_path
            .as_ref()
            .and_then(|path| std::fs::read_to_string(path).ok())
            .map(|s| s.trim().to_string());
    }
    daemon
}

fn build_registry(config: &Config, daemon: &Daemon) -> Registry {
    let mut registry = Registry::new(daemon.ecuid);
    match registry.applications_load(&config.application_cfg_path(), daemon.ecuid) {
        Ok(n) if n > 0 => info!("restored {n} persisted applications"),
        _ => {}
    }
    match registry.contexts_load(&config.context_cfg_path(), daemon.ecuid) {
        Ok(n) if n > 0 => info!("restored {n} persisted contexts"),
        _ => {}
    }
    registry
}

fn build_filter(config: &Config) -> anyhow::Result<MessageFilter> {
    match &config.filter.config_file {
        Some(path) => MessageFilter::load(path)
            .with_context(|| format!("invalid message filter configuration {}", path.display())),
        None => Ok(MessageFilter::disabled()),
    }
}

fn build_offline_trace(config: &Config) -> Option<OfflineTrace> {
    let dir = config.offline_trace.directory.clone()?;
    match OfflineTrace::new(
        dir.clone(),
        config.offline_trace.file_size,
        config.offline_trace.max_size,
        config.offline_trace.filename_timestamp_based,
    ) {
        Ok(trace) => {
            info!("offline trace enabled under {}", dir.display());
            Some(trace)
        }
        Err(err) => {
            warn!("offline trace disabled, cannot use {}: {err}", dir.display());
            None
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = Config::load(args.config.as_deref());

    let mut daemon = build_daemon(&config);
    let registry = build_registry(&config, &daemon);
    let filter = build_filter(&config)?;
    let storage = LogStorageManager::new(
        config.logstorage.max_devices,
        config.user_config(),
        config.logstorage.cache_size_kb * 1024,
    );
    let offline_trace = build_offline_trace(&config);

    if args.dry_run {
        println!("configuration ok (ecu {})", daemon.ecuid);
        return Ok(());
    }

    info!(
        "starting mctd (ecu {}, filter '{}')",
        daemon.ecuid,
        filter.current().name
    );
    daemon.change_state(DaemonState::Buffer);

    let (tx, rx) = mpsc::channel(2048);
    let stats = Arc::new(Stats::new());
    let mut core = Core::new(
        config, daemon, registry, filter, storage, offline_trace, stats, tx.clone(),
    );

    events::bind_ipc(&core.config, &tx)?;
    events::spawn_timers(&tx);
    core.attach_serial_client().await;
    core.connect_configured_storage().await;

    events::run(core, rx).await?;
    info!("mctd stopped");
    Ok(())
}
