//! Per-device logstorage configuration (`mct_logstorage.conf`).
//!
//! Section grammar: an optional `[General]` plus any number of
//! `[FILTER<n>]`, `[NON-VERBOSE-STORAGE-FILTER<n>]` and
//! `[NON-VERBOSE-LOGLEVEL-CTRL<n>]` sections. Invalid sections are skipped;
//! the device still comes up with the remaining ones.

use crate::iniconf::{ConfigFile, Section};
use crate::protocol::{Id4, LogLevel, ID_SIZE};
use log::warn;
use thiserror::Error;

pub const CONFIG_FILE_NAME: &str = "mct_logstorage.conf";

/// Maximum entries accepted per id list.
pub const MAX_IDS: usize = 100;

pub const SECTION_FILTER: &str = "FILTER";
pub const SECTION_NONVERBOSE_STORAGE: &str = "NON-VERBOSE-STORAGE-FILTER";
pub const SECTION_NONVERBOSE_CONTROL: &str = "NON-VERBOSE-LOGLEVEL-CTRL";
pub const SECTION_GENERAL: &str = "GENERAL";

/* Sync strategy bits. ON_MSG is exclusive; the others combine. */
pub const SYNC_UNSET: u32 = 0;
pub const SYNC_ON_MSG: u32 = 1;
pub const SYNC_ON_DAEMON_EXIT: u32 = 1 << 1;
pub const SYNC_ON_DEMAND: u32 = 1 << 2;
pub const SYNC_ON_DEVICE_DISCONNECT: u32 = 1 << 3;
pub const SYNC_ON_SPECIFIC_SIZE: u32 = 1 << 4;
pub const SYNC_ON_FILE_SIZE: u32 = 1 << 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverwriteMode {
    #[default]
    DiscardOld,
    DiscardNew,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    /// `[FILTER<n>]`: verbose message storage.
    Verbose,
    /// `[NON-VERBOSE-STORAGE-FILTER<n>]`: stores non-verbose traffic by ECU.
    NonVerboseStorage,
    /// `[NON-VERBOSE-LOGLEVEL-CTRL<n>]`: log-level override only, no file.
    NonVerboseControl,
}

#[derive(Debug, Error)]
pub enum StorageConfigError {
    #[error("section [{0}]: {1}")]
    BadSection(String, String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct FilterConfig {
    pub kind: FilterKind,
    pub apids: Vec<String>,
    pub ctids: Vec<String>,
    pub excluded_apids: Vec<String>,
    pub excluded_ctids: Vec<String>,
    pub log_level: LogLevel,
    /// When set, a reset update is pushed to matching contexts on device
    /// disconnect.
    pub reset_log_level: Option<LogLevel>,
    /// Unset for pure log-level control filters.
    pub file_name: Option<String>,
    pub file_size: u64,
    pub num_files: u32,
    pub sync: u32,
    pub overwrite: OverwriteMode,
    pub ecuid: Option<String>,
    pub specific_size: u64,
    pub disable_network: bool,
}

impl FilterConfig {
    pub fn sync_is(&self, strategy: u32) -> bool {
        self.sync & strategy != 0
    }

    /// On-message (or unset) strategy writes straight to the file.
    pub fn is_on_msg(&self) -> bool {
        self.sync == SYNC_UNSET || self.sync == SYNC_ON_MSG
    }

    pub fn cache_size(&self) -> u64 {
        if self.sync_is(SYNC_ON_SPECIFIC_SIZE) {
            self.specific_size
        } else {
            self.file_size
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GeneralConfig {
    pub name: Option<String>,
    pub backend: Option<String>,
    pub block_mode: Option<bool>,
    pub maintain_loglevel: Option<bool>,
}

#[derive(Debug, Default)]
pub struct DeviceConfig {
    pub general: GeneralConfig,
    pub filters: Vec<FilterConfig>,
}

/// Parse a device configuration. Invalid filter sections are logged and
/// skipped (the daemon keeps running with the valid remainder).
pub fn parse_device_config(config: &ConfigFile) -> DeviceConfig {
    let mut device = DeviceConfig::default();

    for section in config.sections() {
        let name = section.name().to_ascii_uppercase();
        let result = if name.starts_with(SECTION_GENERAL) {
            parse_general(section, &mut device.general)
        } else if name.starts_with(SECTION_NONVERBOSE_STORAGE) {
            validate_section_name(&name, SECTION_NONVERBOSE_STORAGE)
                .and_then(|_| parse_filter(section, FilterKind::NonVerboseStorage))
                .map(|f| device.filters.push(f))
        } else if name.starts_with(SECTION_NONVERBOSE_CONTROL) {
            validate_section_name(&name, SECTION_NONVERBOSE_CONTROL)
                .and_then(|_| parse_filter(section, FilterKind::NonVerboseControl))
                .map(|f| device.filters.push(f))
        } else if name.starts_with(SECTION_FILTER) {
            validate_section_name(&name, SECTION_FILTER)
                .and_then(|_| parse_filter(section, FilterKind::Verbose))
                .map(|f| device.filters.push(f))
        } else {
            warn!("unknown logstorage section [{}]", section.name());
            Ok(())
        };

        if let Err(err) = result {
            warn!("skipping logstorage section: {err}");
        }
    }

    device
}

fn validate_section_name(name: &str, base: &str) -> Result<(), StorageConfigError> {
    let suffix = &name[base.len()..];
    if suffix.is_empty() || suffix.chars().any(|c| !c.is_ascii_digit()) {
        return Err(StorageConfigError::BadSection(
            name.into(),
            format!("expected [{base}<number>]"),
        ));
    }
    Ok(())
}

fn parse_general(
    section: &Section,
    general: &mut GeneralConfig,
) -> Result<(), StorageConfigError> {
    general.name = section.value("Name").map(str::to_string);
    general.backend = section.value("Backend").map(str::to_string);
    if let Some(value) = section.value("BlockMode") {
        general.block_mode = Some(parse_on_off(value).ok_or_else(|| {
            StorageConfigError::BadSection(section.name().into(), "bad BlockMode".into())
        })?);
    }
    if let Some(value) = section.value("MaintainLogstorageLogLevel") {
        general.maintain_loglevel = Some(parse_on_off(value).ok_or_else(|| {
            StorageConfigError::BadSection(
                section.name().into(),
                "bad MaintainLogstorageLogLevel".into(),
            )
        })?);
    }
    Ok(())
}

fn parse_on_off(value: &str) -> Option<bool> {
    match value.trim() {
        v if v.eq_ignore_ascii_case("ON") || v == "1" => Some(true),
        v if v.eq_ignore_ascii_case("OFF") || v == "0" => Some(false),
        _ => None,
    }
}

/// Split a comma list of ids, truncating each to 4 characters. `.*` stays
/// as the wildcard. Entries past `MAX_IDS` are ignored.
fn parse_id_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .take(MAX_IDS)
        .map(|t| {
            if t == ".*" {
                t.to_string()
            } else {
                t.chars().take(ID_SIZE).collect()
            }
        })
        .collect()
}

fn parse_filter(section: &Section, kind: FilterKind) -> Result<FilterConfig, StorageConfigError> {
    let bad = |what: String| StorageConfigError::BadSection(section.name().into(), what);

    let apids = section.value("LogAppName").map(parse_id_list).unwrap_or_default();
    let ctids = section.value("ContextName").map(parse_id_list).unwrap_or_default();
    let excluded_apids = section
        .value("ExcludedLogAppName")
        .map(parse_id_list)
        .unwrap_or_default();
    let excluded_ctids = section
        .value("ExcludedContextName")
        .map(parse_id_list)
        .unwrap_or_default();

    // Only one exclusion dimension may carry a list.
    if excluded_apids.len() > 1 && excluded_ctids.len() > 1 {
        return Err(bad("both exclusion lists are multi-valued".into()));
    }

    let ecuid = section.value("EcuID").map(|v| {
        let mut id = v.trim().to_string();
        id.truncate(ID_SIZE);
        id
    });

    match kind {
        FilterKind::Verbose => {
            if apids.is_empty() || ctids.is_empty() {
                return Err(bad("LogAppName and ContextName are required".into()));
            }
        }
        FilterKind::NonVerboseStorage | FilterKind::NonVerboseControl => {
            if ecuid.is_none() {
                return Err(bad("EcuID is required for non-verbose sections".into()));
            }
        }
    }

    let log_level = match section.value("LogLevel") {
        Some(value) => LogLevel::from_config_name(value)
            .ok_or_else(|| bad(format!("bad LogLevel '{value}'")))?,
        None if kind == FilterKind::NonVerboseStorage => LogLevel::Verbose,
        None => return Err(bad("missing LogLevel".into())),
    };

    let reset_log_level = match section.value("ResetLogLevel") {
        Some(value) => Some(
            LogLevel::from_config_name(value)
                .ok_or_else(|| bad(format!("bad ResetLogLevel '{value}'")))?,
        ),
        None => None,
    };

    let file_name = match section.value("File") {
        Some(value) => {
            if value.contains("..") {
                return Err(bad("File must not contain '..'".into()));
            }
            if value.is_empty() {
                return Err(bad("File is empty".into()));
            }
            Some(value.to_string())
        }
        None => None,
    };

    if kind != FilterKind::NonVerboseControl && file_name.is_none() {
        return Err(bad("missing File".into()));
    }

    let parse_positive = |key: &str| -> Result<Option<u64>, StorageConfigError> {
        match section.value(key) {
            Some(value) => {
                let n: u64 = value
                    .parse()
                    .map_err(|_| bad(format!("{key} is not a number")))?;
                if n == 0 {
                    return Err(bad(format!("{key} must be positive")));
                }
                Ok(Some(n))
            }
            None => Ok(None),
        }
    };

    let (file_size, num_files) = if file_name.is_some() {
        (
            parse_positive("FileSize")?.ok_or_else(|| bad("missing FileSize".into()))?,
            parse_positive("NOFiles")?.ok_or_else(|| bad("missing NOFiles".into()))? as u32,
        )
    } else {
        (0, 0)
    };

    let sync = parse_sync_behavior(section.value("SyncBehavior").unwrap_or(""))
        .map_err(|e| bad(e.into()))?;

    let specific_size = parse_positive("SpecificSize")?.unwrap_or(0);
    if sync & SYNC_ON_SPECIFIC_SIZE != 0 {
        if specific_size == 0 {
            return Err(bad("ON_SPECIFIC_SIZE requires SpecificSize".into()));
        }
        if specific_size > file_size {
            return Err(bad("SpecificSize exceeds FileSize".into()));
        }
        if sync & SYNC_ON_FILE_SIZE != 0 {
            return Err(bad("ON_SPECIFIC_SIZE and ON_FILE_SIZE cannot combine".into()));
        }
    }

    let overwrite = match section.value("OverwriteBehavior") {
        None => OverwriteMode::DiscardOld,
        Some(v) if v.eq_ignore_ascii_case("DISCARD_OLD") => OverwriteMode::DiscardOld,
        Some(v) if v.eq_ignore_ascii_case("DISCARD_NEW") => OverwriteMode::DiscardNew,
        Some(v) => return Err(bad(format!("bad OverwriteBehavior '{v}'"))),
    };

    let disable_network = match section.value("DisableNetwork") {
        None => false,
        Some(v) => parse_on_off(v).ok_or_else(|| bad(format!("bad DisableNetwork '{v}'")))?,
    };

    Ok(FilterConfig {
        kind,
        apids,
        ctids,
        excluded_apids,
        excluded_ctids,
        log_level,
        reset_log_level,
        file_name,
        file_size,
        num_files,
        sync,
        overwrite,
        ecuid,
        specific_size,
        disable_network,
    })
}

fn parse_sync_behavior(value: &str) -> Result<u32, &'static str> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(SYNC_ON_MSG);
    }
    let mut sync = SYNC_UNSET;
    for token in value.split(',') {
        match token.trim() {
            "ON_MSG" => return Ok(SYNC_ON_MSG),
            "ON_DAEMON_EXIT" => sync |= SYNC_ON_DAEMON_EXIT,
            "ON_DEMAND" => sync |= SYNC_ON_DEMAND,
            "ON_DEVICE_DISCONNECT" => sync |= SYNC_ON_DEVICE_DISCONNECT,
            "ON_SPECIFIC_SIZE" => sync |= SYNC_ON_SPECIFIC_SIZE,
            "ON_FILE_SIZE" => sync |= SYNC_ON_FILE_SIZE,
            other => {
                warn!("unknown sync behavior '{other}'");
                return Err("unknown SyncBehavior token");
            }
        }
    }
    if sync == SYNC_UNSET {
        sync = SYNC_ON_MSG;
    }
    Ok(sync)
}

/// Check an id against an exclusion list (exact 4-byte compare).
pub fn id_is_excluded(id: Id4, excluded: &[String]) -> bool {
    excluded.iter().any(|e| Id4::new(e) == id)
}
