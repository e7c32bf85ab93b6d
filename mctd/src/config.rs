//! Daemon configuration.
//!
//! Loaded from a TOML file; the path can be overridden with the
//! `MCTD_CONFIG` environment variable. A missing or unparsable file falls
//! back to defaults so the daemon always comes up.

use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "/etc/mct/mctd.toml";
const ENV_CONFIG_PATH: &str = "MCTD_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonSection,
    #[serde(default)]
    pub ringbuffer: RingbufferSection,
    #[serde(default)]
    pub tcp: TcpSection,
    #[serde(default)]
    pub serial: SerialSection,
    #[serde(default)]
    pub ipc: IpcSection,
    #[serde(default)]
    pub offline_trace: OfflineTraceSection,
    #[serde(default)]
    pub logstorage: LogstorageSection,
    #[serde(default)]
    pub filter: FilterSection,
    #[serde(default)]
    pub defaults: DefaultsSection,
    #[serde(default)]
    pub injection: InjectionSection,
}

impl Config {
    /// Load configuration; `override_path` (from the command line) wins
    /// over the `MCTD_CONFIG` environment variable.
    pub fn load(override_path: Option<&std::path::Path>) -> Self {
        let path = override_path
            .map(|p| p.to_path_buf())
            .or_else(|| std::env::var(ENV_CONFIG_PATH).ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        match fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => config,
                Err(err) => {
                    log::warn!("cannot parse {}: {err}; using defaults", path.display());
                    Config::default()
                }
            },
            Err(_) => Config::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DaemonSection {
    #[serde(default = "default_ecu_id")]
    pub ecu_id: String,
    #[serde(default)]
    pub send_serial_header: bool,
    #[serde(default)]
    pub timing_packets: bool,
    #[serde(default)]
    pub send_ecu_software_version: bool,
    #[serde(default)]
    pub ecu_version_path: Option<PathBuf>,
    #[serde(default)]
    pub send_timezone: bool,
    #[serde(default = "default_persistence_path")]
    pub persistence_path: PathBuf,
    #[serde(default)]
    pub allow_block_mode: bool,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            ecu_id: default_ecu_id(),
            send_serial_header: false,
            timing_packets: false,
            send_ecu_software_version: false,
            ecu_version_path: None,
            send_timezone: false,
            persistence_path: default_persistence_path(),
            allow_block_mode: false,
        }
    }
}

fn default_ecu_id() -> String {
    "ECU1".to_string()
}
fn default_persistence_path() -> PathBuf {
    PathBuf::from("/var/lib/mct")
}

#[derive(Debug, Deserialize, Clone)]
pub struct RingbufferSection {
    #[serde(default = "default_rb_min")]
    pub min_size: usize,
    #[serde(default = "default_rb_max")]
    pub max_size: usize,
    #[serde(default = "default_rb_step")]
    pub step_size: usize,
}

impl Default for RingbufferSection {
    fn default() -> Self {
        Self {
            min_size: default_rb_min(),
            max_size: default_rb_max(),
            step_size: default_rb_step(),
        }
    }
}

fn default_rb_min() -> usize {
    500_000
}
fn default_rb_max() -> usize {
    10_000_000
}
fn default_rb_step() -> usize {
    500_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct TcpSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub bind_addresses: Vec<String>,
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,
    /// Resynchronize to the serial header magic on inbound TCP data.
    #[serde(default)]
    pub sync_serial_header: bool,
}

impl Default for TcpSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_addresses: Vec::new(),
            send_timeout_secs: default_send_timeout(),
            sync_serial_header: false,
        }
    }
}

fn default_port() -> u16 {
    3490
}
fn default_send_timeout() -> u64 {
    4
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SerialSection {
    /// RS232 device for a serial viewer; unset disables the serial client.
    /// Line discipline setup happens outside the daemon.
    #[serde(default)]
    pub device: Option<PathBuf>,
    /// Resynchronize to the serial header magic on inbound serial data.
    #[serde(default)]
    pub sync_serial_header: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IpcSection {
    /// "socket" (default) or "fifo".
    #[serde(default = "default_ipc_mode")]
    pub mode: String,
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,
    #[serde(default = "default_control_socket")]
    pub control_socket_path: PathBuf,
    #[serde(default = "default_fifo_dir")]
    pub fifo_dir: PathBuf,
    #[serde(default)]
    pub fifo_size: Option<i32>,
    #[serde(default)]
    pub fifo_group: Option<String>,
}

impl Default for IpcSection {
    fn default() -> Self {
        Self {
            mode: default_ipc_mode(),
            socket_dir: default_socket_dir(),
            control_socket_path: default_control_socket(),
            fifo_dir: default_fifo_dir(),
            fifo_size: None,
            fifo_group: None,
        }
    }
}

impl IpcSection {
    pub fn use_fifo(&self) -> bool {
        self.mode.eq_ignore_ascii_case("fifo")
    }

    pub fn app_socket_path(&self) -> PathBuf {
        self.socket_dir.join("mct")
    }

    pub fn app_fifo_path(&self) -> PathBuf {
        self.fifo_dir.join("mct")
    }

    pub fn producer_pipe_dir(&self) -> PathBuf {
        self.fifo_dir.join("mctpipes")
    }
}

fn default_ipc_mode() -> String {
    "socket".to_string()
}
fn default_socket_dir() -> PathBuf {
    PathBuf::from("/tmp/mct")
}
fn default_control_socket() -> PathBuf {
    PathBuf::from("/tmp/mct/mct-ctrl.sock")
}
fn default_fifo_dir() -> PathBuf {
    PathBuf::from("/tmp/mctpipes")
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct OfflineTraceSection {
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_trace_file_size")]
    pub file_size: u64,
    #[serde(default = "default_trace_max_size")]
    pub max_size: u64,
    #[serde(default)]
    pub filename_timestamp_based: bool,
}

fn default_trace_file_size() -> u64 {
    1_000_000
}
fn default_trace_max_size() -> u64 {
    4_000_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogstorageSection {
    #[serde(default)]
    pub max_devices: usize,
    #[serde(default)]
    pub dir_path: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub timestamp: bool,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default = "default_max_counter")]
    pub max_counter: u32,
    #[serde(default)]
    pub optional_index: bool,
    #[serde(default = "default_cache_kb")]
    pub cache_size_kb: u64,
    #[serde(default = "default_true")]
    pub maintain_loglevel: bool,
}

impl Default for LogstorageSection {
    fn default() -> Self {
        Self {
            max_devices: 0,
            dir_path: None,
            timestamp: default_true(),
            delimiter: default_delimiter(),
            max_counter: default_max_counter(),
            optional_index: false,
            cache_size_kb: default_cache_kb(),
            maintain_loglevel: default_true(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_delimiter() -> char {
    '_'
}
fn default_max_counter() -> u32 {
    u32::MAX
}
fn default_cache_kb() -> u64 {
    30_000
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct FilterSection {
    #[serde(default)]
    pub config_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DefaultsSection {
    /// Log level pushed to contexts that register with DEFAULT.
    #[serde(default = "default_context_log_level")]
    pub context_log_level: i8,
    #[serde(default)]
    pub context_trace_status: i8,
    #[serde(default)]
    pub force_context_ll_and_ts: bool,
}

impl Default for DefaultsSection {
    fn default() -> Self {
        Self {
            context_log_level: default_context_log_level(),
            context_trace_status: 0,
            force_context_ll_and_ts: false,
        }
    }
}

fn default_context_log_level() -> i8 {
    crate::protocol::LogLevel::Info as i8
}

#[derive(Debug, Deserialize, Clone)]
pub struct InjectionSection {
    /// When false, all injection processing is suppressed.
    #[serde(default = "default_true")]
    pub mode: bool,
}

impl Default for InjectionSection {
    fn default() -> Self {
        Self { mode: default_true() }
    }
}

impl Config {
    pub fn user_config(&self) -> crate::logstorage::file::UserConfig {
        crate::logstorage::file::UserConfig {
            timestamp: self.logstorage.timestamp,
            delimiter: self.logstorage.delimiter,
            max_counter: self.logstorage.max_counter,
            counter_idx_len: 3,
            optional_counter: self.logstorage.optional_index,
        }
    }

    pub fn application_cfg_path(&self) -> PathBuf {
        self.daemon.persistence_path.join("mct-runtime-application.cfg")
    }

    pub fn context_cfg_path(&self) -> PathBuf {
        self.daemon.persistence_path.join("mct-runtime-context.cfg")
    }

    pub fn runtime_cfg_path(&self) -> PathBuf {
        self.daemon.persistence_path.join("mct-runtime-configuration.cfg")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn parse_config_defaults() {
        let toml = r#"[daemon]
ecu_id = "ECU7"
timing_packets = true
[tcp]
port = 3490
bind_addresses = ["127.0.0.1"]
sync_serial_header = true
[serial]
device = "/dev/ttyS0"
sync_serial_header = true
[ringbuffer]
min_size = 1000
[logstorage]
max_devices = 2
dir_path = "/mnt/storage"
[defaults]
context_log_level = 3
force_context_ll_and_ts = true
"#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert_eq!(cfg.daemon.ecu_id, "ECU7");
        assert!(cfg.daemon.timing_packets);
        assert_eq!(cfg.tcp.port, 3490);
        assert_eq!(cfg.tcp.bind_addresses, vec!["127.0.0.1"]);
        assert!(cfg.tcp.sync_serial_header);
        assert_eq!(
            cfg.serial.device.as_deref(),
            Some(std::path::Path::new("/dev/ttyS0"))
        );
        assert!(cfg.serial.sync_serial_header);
        assert_eq!(cfg.ringbuffer.min_size, 1000);
        assert_eq!(cfg.ringbuffer.max_size, 10_000_000);
        assert_eq!(cfg.logstorage.max_devices, 2);
        assert_eq!(cfg.defaults.context_log_level, 3);
        assert!(cfg.defaults.force_context_ll_and_ts);
        assert!(cfg.injection.mode);
        assert!(!cfg.ipc.use_fifo());
        assert_eq!(cfg.ipc.app_socket_path(), PathBuf::from("/tmp/mct/mct"));
    }

    #[test]
    fn env_override() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[daemon]\necu_id = \"ENVX\"").unwrap();
        std::env::set_var(ENV_CONFIG_PATH, file.path());
        let cfg = Config::load(None);
        assert_eq!(cfg.daemon.ecu_id, "ENVX");
        std::env::remove_var(ENV_CONFIG_PATH);
    }
}
