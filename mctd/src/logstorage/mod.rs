//! Offline logstorage engine.
//!
//! Each connected storage device carries its own `mct_logstorage.conf`.
//! Incoming messages are matched against per-filter key sets derived from
//! the configured application/context/ECU ids, then written through one of
//! two strategies: straight to rotated files (`ON_MSG`) or through a
//! per-filter cache drained by configured sync triggers.

pub mod cache;
pub mod config;
pub mod file;

use crate::codec::Message;
use crate::protocol::{Id4, LogLevel};
use config::*;
use file::UserConfig;
use log::{info, warn};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Consecutive error budget before a filter or device is given up on.
pub const MAX_ERRORS: u32 = 5;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no free logstorage device slot (max {0})")]
    NoFreeSlot(usize),
    #[error("logstorage device {0} is not connected")]
    NotConnected(String),
    #[error("device {0} exceeded its write error budget")]
    DeviceFailed(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub name: String,
    pub idx: u32,
}

/// Shared per-logical-filename rotation state; filters targeting the same
/// `File` observe the same newest file and wrap count.
#[derive(Debug, Clone, Default)]
pub struct NewestFileInfo {
    pub newest_file: Option<String>,
    pub wrap_id: u32,
}

#[derive(Debug, Default)]
pub struct FilterState {
    pub working_file_name: Option<String>,
    pub wrap_id: u32,
    pub records: Vec<FileRecord>,
    pub log: Option<std::fs::File>,
    pub current_offset: u64,
    pub skip: bool,
    pub cache: Option<cache::Cache>,
}

/// Cache quota shared by every device of the daemon.
#[derive(Debug)]
pub struct CacheAccounting {
    max: u64,
    used: u64,
}

impl CacheAccounting {
    pub fn new(max: u64) -> Self {
        CacheAccounting { max, used: 0 }
    }

    pub fn try_charge(&mut self, bytes: u64) -> bool {
        if self.used + bytes > self.max {
            return false;
        }
        self.used += bytes;
        true
    }

    pub fn refund(&mut self, bytes: u64) {
        self.used = self.used.saturating_sub(bytes);
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn max(&self) -> u64 {
        self.max
    }
}

#[derive(Debug)]
pub struct StorageFilter {
    pub keys: Vec<String>,
    pub config: FilterConfig,
    pub state: FilterState,
}

#[derive(Debug)]
pub struct StorageDevice {
    pub mount_point: PathBuf,
    pub filters: Vec<StorageFilter>,
    pub write_errors: u32,
    pub prepare_errors: u32,
    pub block_mode: Option<bool>,
    pub maintain_loglevel: Option<bool>,
    pub newest_files: HashMap<String, NewestFileInfo>,
}

/// Build lookup keys `"<ecu>:<apid>:<ctid>"` for one filter as the cross
/// product of its id lists; a `.*` component stays empty in the key.
pub fn create_keys(apids: &[String], ctids: &[String], ecuid: Option<&str>) -> Vec<String> {
    let ecu = ecuid.unwrap_or("");
    let all_wildcard = |ids: &[String]| ids.len() == 1 && ids[0] == ".*";

    if (apids.is_empty() && ctids.is_empty() && ecuid.is_some())
        || (all_wildcard(apids) && all_wildcard(ctids) && ecuid.is_some())
    {
        return vec![format!("{ecu}::")];
    }
    if apids.is_empty() || ctids.is_empty() {
        return Vec::new();
    }

    let mut keys = Vec::with_capacity(apids.len() * ctids.len());
    for apid in apids {
        for ctid in ctids {
            let key = if apid == ".*" {
                format!("{ecu}::{ctid}")
            } else if ctid == ".*" {
                format!("{ecu}:{apid}:")
            } else {
                format!("{ecu}:{apid}:{ctid}")
            };
            keys.push(key);
        }
    }
    keys
}

/// Break a lookup key back into its `(apid, ctid, ecuid)` components; empty
/// components come back as empty strings.
pub fn split_key(key: &str) -> (String, String, String) {
    let mut parts = key.splitn(3, ':');
    let ecu = parts.next().unwrap_or("").to_string();
    let apid = parts.next().unwrap_or("").to_string();
    let ctid = parts.next().unwrap_or("").to_string();
    (apid, ctid, ecu)
}

impl StorageDevice {
    fn load(mount_point: &Path) -> Result<StorageDevice, StorageError> {
        let config_path = mount_point.join(CONFIG_FILE_NAME);
        let ini = crate::iniconf::ConfigFile::load(&config_path)?;
        let parsed = parse_device_config(&ini);

        let mut device = StorageDevice {
            mount_point: mount_point.to_path_buf(),
            filters: Vec::new(),
            write_errors: 0,
            prepare_errors: 0,
            block_mode: parsed.general.block_mode,
            maintain_loglevel: parsed.general.maintain_loglevel,
            newest_files: HashMap::new(),
        };

        for filter in parsed.filters {
            let keys = create_keys(&filter.apids, &filter.ctids, filter.ecuid.as_deref());
            if keys.is_empty() {
                warn!("skipping filter without derivable keys (file {:?})", filter.file_name);
                continue;
            }
            if let Some(file_name) = &filter.file_name {
                device
                    .newest_files
                    .entry(file_name.clone())
                    .or_default();
            }
            device.filters.push(StorageFilter {
                keys,
                config: filter,
                state: FilterState::default(),
            });
        }

        info!(
            "logstorage device {} configured with {} filters",
            mount_point.display(),
            device.filters.len()
        );
        Ok(device)
    }

    /// Filter indices matching `(apid, ctid, ecuid)`, probed from the most
    /// specific key shape to the least specific one.
    pub fn get_config(&self, apid: Option<&str>, ctid: Option<&str>, ecuid: &str) -> Vec<usize> {
        let ecu: String = ecuid.chars().take(crate::protocol::ID_SIZE).collect();
        let mut found = Vec::new();

        let probe = |key: &str, found: &mut Vec<usize>| {
            for (idx, filter) in self.filters.iter().enumerate() {
                if filter.keys.iter().any(|k| k == key) && !found.contains(&idx) {
                    found.push(idx);
                }
            }
        };

        let (Some(apid), Some(ctid)) = (apid, ctid) else {
            probe(&format!("{ecu}::"), &mut found);
            return found;
        };
        let apid: String = apid.chars().take(crate::protocol::ID_SIZE).collect();
        let ctid: String = ctid.chars().take(crate::protocol::ID_SIZE).collect();

        let keys = [
            format!(":{apid}:"),
            format!("::{ctid}"),
            format!(":{apid}:{ctid}"),
            format!("{ecu}:{apid}:{ctid}"),
            format!("{ecu}:{apid}:"),
            format!("{ecu}::{ctid}"),
            format!("{ecu}::"),
        ];
        for key in &keys {
            probe(key, &mut found);
            if found.len() == self.filters.len() {
                break;
            }
        }
        found
    }

    /// Matching filters for an actual message: key match plus log level,
    /// ECU and exclusion admission.
    fn filter_message(
        &self,
        apid: Option<Id4>,
        ctid: Option<Id4>,
        ecuid: Id4,
        log_level: LogLevel,
    ) -> Vec<usize> {
        let candidates = self.get_config(
            apid.map(|id| id.as_str().to_owned()).as_deref(),
            ctid.map(|id| id.as_str().to_owned()).as_deref(),
            ecuid.as_str(),
        );

        candidates
            .into_iter()
            .filter(|&idx| {
                let config = &self.filters[idx].config;
                if log_level > config.log_level {
                    return false;
                }
                if let Some(cfg_ecu) = &config.ecuid {
                    if Id4::new(cfg_ecu) != ecuid {
                        return false;
                    }
                }
                let apid_excluded = apid
                    .map(|id| id_is_excluded(id, &config.excluded_apids))
                    .unwrap_or(false);
                let ctid_excluded = ctid
                    .map(|id| id_is_excluded(id, &config.excluded_ctids))
                    .unwrap_or(false);
                let drop = if !config.excluded_apids.is_empty() && !config.excluded_ctids.is_empty()
                {
                    apid_excluded && ctid_excluded
                } else {
                    apid_excluded || ctid_excluded
                };
                !drop
            })
            .collect()
    }

    /// Store one message in every matching filter. Returns whether the
    /// device exhausted its write error budget.
    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        uconfig: &UserConfig,
        accounting: &mut CacheAccounting,
        msg: &Message,
        ecuid: Id4,
        storage_hdr: &[u8],
        disable_nw: &mut bool,
        honor_disable_nw: bool,
    ) -> Result<(), StorageError> {
        let (apid, ctid, level) = match &msg.extended {
            Some(ext) => (
                Some(ext.apid),
                Some(ext.ctid),
                msg.log_level().unwrap_or(LogLevel::Verbose),
            ),
            // Non-verbose traffic carries no ids and is treated as VERBOSE.
            None => (None, None, LogLevel::Verbose),
        };

        let matches = self.filter_message(apid, ctid, ecuid, level);
        if matches.is_empty() {
            return Ok(());
        }

        let mount = self.mount_point.clone();
        for idx in matches {
            let filter = &mut self.filters[idx];
            let Some(file_name) = filter.config.file_name.clone() else {
                // Pure log-level control filter.
                continue;
            };

            if filter.config.disable_network {
                if honor_disable_nw {
                    *disable_nw = true;
                } else {
                    warn!("DisableNetwork is only honored on the first logstorage device");
                }
            }

            if filter.state.skip {
                continue;
            }

            let newest = self
                .newest_files
                .get_mut(&file_name)
                .expect("newest file record created at load time");

            let msg_size = (storage_hdr.len() + msg.header_raw.len() + msg.payload.len()) as u64;
            let prepared = if filter.config.is_on_msg() {
                file::prepare_on_msg(
                    &mut filter.state,
                    &filter.config,
                    uconfig,
                    &mount,
                    msg_size,
                    newest,
                )
            } else {
                cache::prepare_msg_cache(
                    &mut filter.state,
                    &filter.config,
                    uconfig,
                    newest,
                    accounting,
                )
            };

            if let Err(err) = prepared {
                self.prepare_errors += 1;
                if self.prepare_errors >= MAX_ERRORS {
                    filter.state.skip = true;
                    warn!(
                        "cannot prepare '{file_name}', skipping filter after {} attempts: {err}",
                        self.prepare_errors
                    );
                } else {
                    warn!("cannot prepare '{file_name}': {err}");
                }
                continue;
            }
            if filter.state.skip {
                continue;
            }

            if filter.config.is_on_msg() {
                if let Some(working) = &filter.state.working_file_name {
                    newest.newest_file = Some(working.clone());
                    newest.wrap_id = filter.state.wrap_id;
                }
            }

            let written = if filter.config.is_on_msg() {
                file::write_on_msg(&mut filter.state, storage_hdr, &msg.header_raw, &msg.payload)
            } else {
                cache::write_msg_cache(
                    &mut filter.state,
                    &filter.config,
                    uconfig,
                    &mount,
                    newest,
                    storage_hdr,
                    &msg.header_raw,
                    &msg.payload,
                )
            };

            match written {
                Ok(()) => {
                    if !filter.config.is_on_msg() {
                        if let Some(working) = &filter.state.working_file_name {
                            newest.newest_file = Some(working.clone());
                            newest.wrap_id = filter.state.wrap_id;
                        }
                    }
                }
                Err(err) => {
                    self.write_errors += 1;
                    warn!("cannot write '{file_name}': {err}");
                    if self.write_errors >= MAX_ERRORS {
                        return Err(StorageError::DeviceFailed(
                            self.mount_point.display().to_string(),
                        ));
                    }
                }
            }
        }

        Ok(())
    }

    /// Drain every filter cache for the given trigger.
    fn sync_caches(&mut self, uconfig: &UserConfig, status: u32) {
        let mount = self.mount_point.clone();
        for filter in &mut self.filters {
            let Some(file_name) = filter.config.file_name.clone() else {
                continue;
            };
            if filter.state.cache.is_none() {
                continue;
            }
            let newest = self
                .newest_files
                .get_mut(&file_name)
                .expect("newest file record created at load time");
            if let Err(err) = cache::sync_msg_cache(
                &mut filter.state,
                &filter.config,
                uconfig,
                &mount,
                status,
                newest,
            ) {
                warn!("cache sync failed for '{file_name}': {err}");
            }
        }
    }

    fn release(&mut self, uconfig: &UserConfig, accounting: &mut CacheAccounting, reason: u32) {
        self.sync_caches(uconfig, reason);
        for filter in &mut self.filters {
            if let Some(cache) = filter.state.cache.take() {
                accounting.refund(cache.size() + cache::FOOTER_CHARGE);
            }
            filter.state.log = None;
        }
    }
}

#[derive(Debug)]
pub struct LogStorageManager {
    devices: Vec<StorageDevice>,
    max_devices: usize,
    pub uconfig: UserConfig,
    pub accounting: CacheAccounting,
}

impl LogStorageManager {
    pub fn new(max_devices: usize, uconfig: UserConfig, cache_max: u64) -> Self {
        LogStorageManager {
            devices: Vec::new(),
            max_devices,
            uconfig,
            accounting: CacheAccounting::new(cache_max),
        }
    }

    pub fn devices(&self) -> &[StorageDevice] {
        &self.devices
    }

    pub fn device(&self, mount_point: &Path) -> Option<&StorageDevice> {
        self.devices.iter().find(|d| d.mount_point == mount_point)
    }

    /// Connect a device: (re)load its configuration file. A device already
    /// connected at the same mount point is disconnected first.
    pub fn device_connected(&mut self, mount_point: &Path) -> Result<&StorageDevice, StorageError> {
        if self.device(mount_point).is_some() {
            warn!("device already connected, reconnecting: {}", mount_point.display());
            self.device_disconnected(mount_point, SYNC_ON_DEVICE_DISCONNECT)?;
        }
        if self.devices.len() >= self.max_devices {
            return Err(StorageError::NoFreeSlot(self.max_devices));
        }
        let device = StorageDevice::load(mount_point)?;
        self.devices.push(device);
        Ok(self.devices.last().unwrap())
    }

    pub fn device_disconnected(
        &mut self,
        mount_point: &Path,
        reason: u32,
    ) -> Result<StorageDevice, StorageError> {
        let idx = self
            .devices
            .iter()
            .position(|d| d.mount_point == mount_point)
            .ok_or_else(|| StorageError::NotConnected(mount_point.display().to_string()))?;
        let mut device = self.devices.remove(idx);
        device.release(&self.uconfig, &mut self.accounting, reason);
        info!("logstorage device disconnected: {}", mount_point.display());
        Ok(device)
    }

    /// ON_DEMAND sync of all caches on one device.
    pub fn sync_device_caches(&mut self, mount_point: &Path) -> Result<(), StorageError> {
        let uconfig = self.uconfig.clone();
        let device = self
            .devices
            .iter_mut()
            .find(|d| d.mount_point == mount_point)
            .ok_or_else(|| StorageError::NotConnected(mount_point.display().to_string()))?;
        device.sync_caches(&uconfig, SYNC_ON_DEMAND);
        Ok(())
    }

    /// Daemon shutdown: drain ON_DAEMON_EXIT caches everywhere.
    pub fn shutdown(&mut self) {
        let uconfig = self.uconfig.clone();
        for device in &mut self.devices {
            device.sync_caches(&uconfig, SYNC_ON_DAEMON_EXIT);
        }
    }

    /// Write a message to all connected devices. Returns true when network
    /// routing of this message is vetoed by a first-device filter. A device
    /// that exhausts its error budget is disconnected.
    pub fn write_message(&mut self, msg: &Message, ecuid: Id4, storage_hdr: &[u8]) -> bool {
        let mut disable_nw = false;
        let uconfig = self.uconfig.clone();
        let mut failed: Vec<PathBuf> = Vec::new();

        for (idx, device) in self.devices.iter_mut().enumerate() {
            let result = device.write(
                &uconfig,
                &mut self.accounting,
                msg,
                ecuid,
                storage_hdr,
                &mut disable_nw,
                idx == 0,
            );
            if let Err(err) = result {
                warn!("{err}");
                failed.push(device.mount_point.clone());
            }
        }

        for mount in failed {
            let _ = self.device_disconnected(&mount, SYNC_ON_DEVICE_DISCONNECT);
        }
        disable_nw
    }

    /// Union of configured log levels for one context across all devices.
    pub fn get_loglevel(&self, apid: &str, ctid: &str, ecuid: &str) -> Option<LogLevel> {
        let mut result: Option<LogLevel> = None;
        for device in &self.devices {
            for idx in device.get_config(Some(apid), Some(ctid), ecuid) {
                let config = &device.filters[idx].config;
                if config.file_name.is_none() {
                    // Control filters dictate the level outright.
                    return Some(config.log_level);
                }
                result = Some(match result {
                    Some(current) => current.max(config.log_level),
                    None => config.log_level,
                });
            }
        }
        result
    }

    /// Highest configured level for a key on one device (used during
    /// connect-time log-level orchestration).
    pub fn get_loglevel_by_key(device: &StorageDevice, key: &str) -> Option<LogLevel> {
        let mut result: Option<LogLevel> = None;
        for filter in &device.filters {
            if filter.keys.iter().any(|k| k == key) {
                result = Some(match result {
                    Some(current) => current.max(filter.config.log_level),
                    None => filter.config.log_level,
                });
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ExtendedHeader, HeaderExtra};
    use crate::protocol::*;

    fn write_config(dir: &Path, body: &str) {
        std::fs::write(dir.join(CONFIG_FILE_NAME), body).unwrap();
    }

    fn log_msg(apid: &str, ctid: &str, level: LogLevel, payload: &[u8]) -> Message {
        Message::build(
            HTYP_PROTOCOL_VERSION1,
            0,
            HeaderExtra {
                ecu: Some(Id4::new("ECU1")),
                seid: None,
                tmsp: Some(1),
            },
            Some(ExtendedHeader {
                msin: make_msin(true, MSTP_LOG, level as i8 as u8),
                noar: 1,
                apid: Id4::new(apid),
                ctid: Id4::new(ctid),
            }),
            payload.to_vec(),
        )
        .unwrap()
    }

    #[test]
    fn key_creation_shapes() {
        let ids = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        assert_eq!(
            create_keys(&ids(&["A1", "A2"]), &ids(&[".*"]), None),
            vec![":A1:", ":A2:"]
        );
        assert_eq!(
            create_keys(&ids(&[".*"]), &ids(&["C1"]), Some("E1")),
            vec!["E1::C1"]
        );
        assert_eq!(
            create_keys(&ids(&[".*"]), &ids(&[".*"]), Some("E1")),
            vec!["E1::"]
        );
        assert_eq!(create_keys(&[], &[], Some("E1")), vec!["E1::"]);
        assert_eq!(
            create_keys(&ids(&["A1"]), &ids(&["C1", "C2"]), None),
            vec![":A1:C1", ":A1:C2"]
        );
        assert!(create_keys(&[], &ids(&["C1"]), None).is_empty());
    }

    #[test]
    fn split_key_shapes() {
        assert_eq!(split_key("E1:A1:C1"), ("A1".into(), "C1".into(), "E1".into()));
        assert_eq!(split_key(":A1:"), ("A1".into(), "".into(), "".into()));
        assert_eq!(split_key("E1::"), ("".into(), "".into(), "E1".into()));
        assert_eq!(split_key("::C1"), ("".into(), "C1".into(), "".into()));
    }

    #[test]
    fn device_connect_and_probe() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            "[FILTER1]\nLogAppName=APP1\nContextName=.*\nLogLevel=MCT_LOG_WARN\n\
             File=app\nFileSize=1024\nNOFiles=3\n\
             [FILTER2]\nLogAppName=.*\nContextName=CTX9\nLogLevel=MCT_LOG_INFO\n\
             File=ctx9\nFileSize=1024\nNOFiles=2\n",
        );
        let mut mgr = LogStorageManager::new(2, UserConfig::default(), 1 << 20);
        mgr.device_connected(dir.path()).unwrap();

        let device = mgr.device(dir.path()).unwrap();
        assert_eq!(device.filters.len(), 2);
        assert_eq!(device.get_config(Some("APP1"), Some("CTX1"), "ECU1"), vec![0]);
        assert_eq!(device.get_config(Some("XXXX"), Some("CTX9"), "ECU1"), vec![1]);
        assert_eq!(
            device.get_config(Some("APP1"), Some("CTX9"), "ECU1"),
            vec![0, 1]
        );
        assert!(device.get_config(Some("XXXX"), Some("YYYY"), "ECU1").is_empty());
    }

    #[test]
    fn level_filtering_and_write() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            "[FILTER1]\nLogAppName=APP1\nContextName=.*\nLogLevel=MCT_LOG_WARN\n\
             File=app\nFileSize=4096\nNOFiles=2\n",
        );
        let mut uc = UserConfig::default();
        uc.timestamp = false;
        uc.max_counter = 999;
        let mut mgr = LogStorageManager::new(1, uc, 1 << 20);
        mgr.device_connected(dir.path()).unwrap();

        let warn_msg = log_msg("APP1", "CTX1", LogLevel::Warn, b"stored");
        let debug_msg = log_msg("APP1", "CTX1", LogLevel::Debug, b"not stored");
        let hdr = crate::codec::storage_header_at(Id4::new("ECU1"), 1, 0);

        assert!(!mgr.write_message(&warn_msg, Id4::new("ECU1"), &hdr));
        assert!(!mgr.write_message(&debug_msg, Id4::new("ECU1"), &hdr));

        let data = std::fs::read(dir.path().join("app_001.mct")).unwrap();
        let expected = hdr.len() + warn_msg.header_raw.len() + warn_msg.payload.len();
        assert_eq!(data.len(), expected);
        assert_eq!(&data[..4], b"DLT\x01");
    }

    #[test]
    fn disable_network_only_on_first_device() {
        let dir1 = tempfile::tempdir().unwrap();
        let dir2 = tempfile::tempdir().unwrap();
        let body = "[FILTER1]\nLogAppName=APP1\nContextName=.*\nLogLevel=MCT_LOG_VERBOSE\n\
                    File=app\nFileSize=4096\nNOFiles=2\nDisableNetwork=ON\n";
        write_config(dir1.path(), body);
        write_config(dir2.path(), body);

        let mut uc = UserConfig::default();
        uc.timestamp = false;
        let mut mgr = LogStorageManager::new(2, uc, 1 << 20);
        mgr.device_connected(dir1.path()).unwrap();
        mgr.device_connected(dir2.path()).unwrap();

        let msg = log_msg("APP1", "CTX1", LogLevel::Info, b"x");
        let hdr = crate::codec::storage_header_at(Id4::new("ECU1"), 1, 0);
        assert!(mgr.write_message(&msg, Id4::new("ECU1"), &hdr));

        // Second device alone: its veto is a warning only.
        mgr.device_disconnected(dir1.path(), SYNC_ON_DEVICE_DISCONNECT)
            .unwrap();
        let veto = mgr.write_message(&msg, Id4::new("ECU1"), &hdr);
        assert!(veto); // now dir2 is the first device
    }

    #[test]
    fn excluded_ids_drop_messages() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            "[FILTER1]\nLogAppName=.*\nContextName=CTX1\nLogLevel=MCT_LOG_VERBOSE\n\
             ExcludedLogAppName=APPX\n\
             File=app\nFileSize=4096\nNOFiles=2\n",
        );
        let mut uc = UserConfig::default();
        uc.timestamp = false;
        let mut mgr = LogStorageManager::new(1, uc, 1 << 20);
        mgr.device_connected(dir.path()).unwrap();

        let hdr = crate::codec::storage_header_at(Id4::new("ECU1"), 1, 0);
        let kept = log_msg("APP1", "CTX1", LogLevel::Info, b"kept");
        let dropped = log_msg("APPX", "CTX1", LogLevel::Info, b"dropped");
        mgr.write_message(&kept, Id4::new("ECU1"), &hdr);
        mgr.write_message(&dropped, Id4::new("ECU1"), &hdr);

        let data = std::fs::read(dir.path().join("app_001.mct")).unwrap();
        let expected = hdr.len() + kept.header_raw.len() + kept.payload.len();
        assert_eq!(data.len(), expected);
    }

    #[test]
    fn loglevel_union_across_devices() {
        let dir1 = tempfile::tempdir().unwrap();
        let dir2 = tempfile::tempdir().unwrap();
        write_config(
            dir1.path(),
            "[FILTER1]\nLogAppName=APP1\nContextName=CTX1\nLogLevel=MCT_LOG_WARN\n\
             File=a\nFileSize=100\nNOFiles=1\n",
        );
        write_config(
            dir2.path(),
            "[FILTER1]\nLogAppName=APP1\nContextName=.*\nLogLevel=MCT_LOG_DEBUG\n\
             File=b\nFileSize=100\nNOFiles=1\n",
        );
        let mut mgr = LogStorageManager::new(2, UserConfig::default(), 1 << 20);
        mgr.device_connected(dir1.path()).unwrap();
        mgr.device_connected(dir2.path()).unwrap();

        assert_eq!(mgr.get_loglevel("APP1", "CTX1", "ECU1"), Some(LogLevel::Debug));
        assert_eq!(mgr.get_loglevel("APP1", "CTX2", "ECU1"), Some(LogLevel::Debug));
        assert_eq!(mgr.get_loglevel("APP2", "CTX2", "ECU1"), None);
    }

    #[test]
    fn missing_config_file_fails_connect() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = LogStorageManager::new(1, UserConfig::default(), 1 << 20);
        assert!(mgr.device_connected(dir.path()).is_err());
        assert!(mgr.devices().is_empty());
    }
}
