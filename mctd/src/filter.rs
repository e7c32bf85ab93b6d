//! Runtime message filter engine.
//!
//! A filter level in `[0, FILTER_LEVEL_MAX]` selects exactly one running
//! configuration out of an ordered list that partitions the whole range.
//! The active configuration gates which connection kinds may exist, which
//! control services are honored, and which injections may pass.

use crate::connection::{ConnectionKind, CON_MASK_ALL, CON_MASK_MANDATORY};
use crate::iniconf::{ConfigFile, Section};
use crate::protocol::*;
use log::{info, warn};
use std::path::Path;
use thiserror::Error;

pub const FILTER_LEVEL_MIN: u32 = 0;
pub const FILTER_LEVEL_MAX: u32 = 100;

/// Name of the configuration synthesized when no filter section is given.
const MOST_CLOSED_FILTER_NAME: &str = "Customer";

const CLIENT_NONE: &str = "NONE";

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("filter level {0} is out of range")]
    LevelOutOfRange(u32),
    #[error("filter level {0} already defined")]
    DuplicateLevel(u32),
    #[error("filter section [{0}] is invalid: {1}")]
    BadSection(String, String),
    #[error("message filtering is not configured")]
    NotConfigured,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// 128-byte control service mask. The byte-split into a lower and an upper
/// band (selected by the `USER_SERVICE_ID` bit) is the persisted layout;
/// the accessors hide it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceIdMask {
    lower: [u8; 64],
    upper: [u8; 64],
}

impl Default for ServiceIdMask {
    fn default() -> Self {
        ServiceIdMask {
            lower: [0; 64],
            upper: [0; 64],
        }
    }
}

impl ServiceIdMask {
    pub fn all() -> Self {
        ServiceIdMask {
            lower: [0xff; 64],
            upper: [0xff; 64],
        }
    }

    fn slot(&self, id: u32) -> Option<(bool, usize, u8)> {
        if !is_control_id(id) {
            return None;
        }
        let upper = id & USER_SERVICE_ID != 0;
        let low = (id & 0xff) as usize;
        Some((upper, low >> 3, 1 << (low & 7)))
    }

    pub fn set(&mut self, id: u32) -> bool {
        match self.slot(id) {
            Some((true, byte, bit)) => {
                self.upper[byte] |= bit;
                true
            }
            Some((false, byte, bit)) => {
                self.lower[byte] |= bit;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: u32) -> bool {
        match self.slot(id) {
            Some((true, byte, bit)) => self.upper[byte] & bit != 0,
            Some((false, byte, bit)) => self.lower[byte] & bit != 0,
            None => false,
        }
    }

    pub fn as_bytes(&self) -> ([u8; 64], [u8; 64]) {
        (self.lower, self.upper)
    }
}

/// A named injection definition from the `[Injection<n>]` sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionConfig {
    pub name: String,
    pub apid: String,
    pub ctid: String,
    pub ecuid: String,
    pub service_ids: Vec<u32>,
}

/// Injection allowance of one filter configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Injections {
    All,
    None,
    Named(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct FilterConfiguration {
    pub name: String,
    pub level_min: u32,
    pub level_max: u32,
    pub client_mask: u32,
    pub ctrl_mask: ServiceIdMask,
    pub injections: Injections,
}

impl FilterConfiguration {
    fn most_closed(name: &str) -> Self {
        FilterConfiguration {
            name: name.to_string(),
            level_min: FILTER_LEVEL_MIN,
            level_max: FILTER_LEVEL_MAX,
            client_mask: CON_MASK_MANDATORY,
            ctrl_mask: ServiceIdMask::default(),
            injections: Injections::None,
        }
    }
}

#[derive(Debug)]
pub struct MessageFilter {
    pub name: Option<String>,
    pub backend: Option<String>,
    pub default_level: u32,
    configs: Vec<FilterConfiguration>,
    injection_defs: Vec<InjectionConfig>,
    current: usize,
    /// False when no filter file is configured: everything is allowed and
    /// the filter control services answer NOT_SUPPORTED.
    enabled: bool,
}

impl MessageFilter {
    /// Filtering disabled; all admission predicates pass.
    pub fn disabled() -> Self {
        let mut open = FilterConfiguration::most_closed("AllOpen");
        open.client_mask = CON_MASK_ALL;
        open.ctrl_mask = ServiceIdMask::all();
        open.injections = Injections::All;
        MessageFilter {
            name: None,
            backend: None,
            default_level: FILTER_LEVEL_MIN,
            configs: vec![open],
            injection_defs: Vec::new(),
            current: 0,
            enabled: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn load(path: &Path) -> Result<Self, FilterError> {
        let config = ConfigFile::load(path)?;
        Self::from_config(&config)
    }

    pub fn from_config(config: &ConfigFile) -> Result<Self, FilterError> {
        let mut filter = MessageFilter {
            name: None,
            backend: None,
            default_level: FILTER_LEVEL_MAX,
            configs: Vec::new(),
            injection_defs: Vec::new(),
            current: 0,
            enabled: true,
        };

        for section in config.sections() {
            let name = section.name().to_string();
            if name.contains("General") {
                filter.parse_general(section)?;
            } else if name.contains("Filter") {
                filter.parse_filter_section(section)?;
            } else if name.contains("Injection") {
                filter.parse_injection_section(section)?;
            } else {
                warn!("unknown filter configuration section: {name}");
            }
        }

        if filter.configs.is_empty() {
            warn!("no filter defined; adding a most closed filter named '{MOST_CLOSED_FILTER_NAME}'");
            filter
                .configs
                .push(FilterConfiguration::most_closed(MOST_CLOSED_FILTER_NAME));
        } else {
            // The last configuration always covers up to the range maximum.
            let last = filter.configs.last_mut().unwrap();
            if last.level_max < FILTER_LEVEL_MAX {
                warn!(
                    "stretching filter '{}' level range to {FILTER_LEVEL_MAX}",
                    last.name
                );
                last.level_max = FILTER_LEVEL_MAX;
            }
        }

        filter.current = filter
            .configs
            .iter()
            .position(|c| c.level_max >= filter.default_level)
            .ok_or(FilterError::LevelOutOfRange(filter.default_level))?;

        Ok(filter)
    }

    fn parse_general(&mut self, section: &Section) -> Result<(), FilterError> {
        self.name = section.value("Name").map(str::to_string);
        self.backend = section.value("Backend").map(str::to_string);
        let level = section.value("DefaultLevel").ok_or_else(|| {
            FilterError::BadSection(section.name().into(), "missing DefaultLevel".into())
        })?;
        let level: u32 = level.parse().map_err(|_| {
            FilterError::BadSection(section.name().into(), format!("bad DefaultLevel '{level}'"))
        })?;
        if level > FILTER_LEVEL_MAX {
            return Err(FilterError::LevelOutOfRange(level));
        }
        self.default_level = level;
        Ok(())
    }

    fn parse_filter_section(&mut self, section: &Section) -> Result<(), FilterError> {
        let bad = |what: &str| FilterError::BadSection(section.name().into(), what.into());

        let name = section.value("Name").ok_or_else(|| bad("missing Name"))?;
        if self.configs.iter().any(|c| c.name == name) {
            return Err(bad("section name already in use"));
        }

        let level = section.value("Level").ok_or_else(|| bad("missing Level"))?;
        let level_max: u32 = level
            .parse()
            .map_err(|_| bad("Level is not a number"))?;
        if level_max > FILTER_LEVEL_MAX {
            return Err(FilterError::LevelOutOfRange(level_max));
        }

        let clients = section.value("Clients").ok_or_else(|| bad("missing Clients"))?;
        let client_mask = parse_client_mask(clients);

        let ctrl = section
            .value("ControlMessages")
            .ok_or_else(|| bad("missing ControlMessages"))?;
        let ctrl_mask = parse_control_mask(ctrl);

        let inj = section
            .value("Injections")
            .ok_or_else(|| bad("missing Injections"))?;
        let injections = parse_injections(inj);

        self.insert_sorted(FilterConfiguration {
            name: name.to_string(),
            level_min: FILTER_LEVEL_MIN,
            level_max,
            client_mask,
            ctrl_mask,
            injections,
        })
    }

    /// Insert keeping ascending `level_max` order and re-deriving each
    /// `level_min` so the list partitions `[0, FILTER_LEVEL_MAX]`.
    fn insert_sorted(&mut self, conf: FilterConfiguration) -> Result<(), FilterError> {
        if self.configs.iter().any(|c| c.level_max == conf.level_max) {
            return Err(FilterError::DuplicateLevel(conf.level_max));
        }
        let pos = self
            .configs
            .iter()
            .position(|c| c.level_max > conf.level_max)
            .unwrap_or(self.configs.len());
        self.configs.insert(pos, conf);

        let mut min = FILTER_LEVEL_MIN;
        for config in &mut self.configs {
            config.level_min = min;
            min = config.level_max + 1;
        }
        Ok(())
    }

    fn parse_injection_section(&mut self, section: &Section) -> Result<(), FilterError> {
        let bad = |what: &str| FilterError::BadSection(section.name().into(), what.into());
        let name = section.value("Name").ok_or_else(|| bad("missing Name"))?;
        if self.injection_defs.iter().any(|i| i.name == name) {
            return Err(bad("injection name already in use"));
        }
        let apid = section.value("LogAppName").ok_or_else(|| bad("missing LogAppName"))?;
        let ctid = section.value("ContextName").ok_or_else(|| bad("missing ContextName"))?;
        let ecuid = section.value("NodeID").ok_or_else(|| bad("missing NodeID"))?;
        let ids = section.value("ServiceID").ok_or_else(|| bad("missing ServiceID"))?;

        let service_ids = ids
            .split(',')
            .filter_map(|tok| tok.trim().parse::<u32>().ok())
            .collect::<Vec<_>>();

        self.injection_defs.push(InjectionConfig {
            name: name.to_string(),
            apid: apid.to_string(),
            ctid: ctid.to_string(),
            ecuid: ecuid.to_string(),
            service_ids,
        });
        Ok(())
    }

    pub fn current(&self) -> &FilterConfiguration {
        &self.configs[self.current]
    }

    pub fn configurations(&self) -> &[FilterConfiguration] {
        &self.configs
    }

    pub fn injection_definitions(&self) -> &[InjectionConfig] {
        &self.injection_defs
    }

    /// Select the configuration covering `level`. The caller applies the
    /// connection activation side effects from the returned configuration.
    pub fn change_filter_level(&mut self, level: u32) -> Result<&FilterConfiguration, FilterError> {
        if !self.enabled {
            return Err(FilterError::NotConfigured);
        }
        if level > FILTER_LEVEL_MAX {
            return Err(FilterError::LevelOutOfRange(level));
        }
        let idx = self
            .configs
            .iter()
            .position(|c| c.level_max >= level)
            .ok_or(FilterError::LevelOutOfRange(level))?;
        self.current = idx;
        info!(
            "filter level {level}: configuration '{}' [{}..{}] active",
            self.configs[idx].name, self.configs[idx].level_min, self.configs[idx].level_max
        );
        Ok(&self.configs[idx])
    }

    pub fn is_connection_allowed(&self, kind: ConnectionKind) -> bool {
        self.current().client_mask & kind.mask() != 0
    }

    pub fn is_control_allowed(&self, service_id: u32) -> bool {
        if !self.enabled {
            return true;
        }
        self.current().ctrl_mask.get(service_id)
    }

    pub fn is_injection_allowed(&self, apid: Id4, ctid: Id4, ecuid: Id4, service_id: u32) -> bool {
        let names = match &self.current().injections {
            Injections::All => return true,
            Injections::None => return false,
            Injections::Named(names) => names,
        };

        for name in names {
            let Some(def) = self.injection_defs.iter().find(|d| &d.name == name) else {
                warn!("injection configuration '{name}' not found");
                continue;
            };
            if Id4::new(&def.apid) != apid
                || Id4::new(&def.ctid) != ctid
                || Id4::new(&def.ecuid) != ecuid
            {
                continue;
            }
            if def.service_ids.contains(&service_id) {
                return true;
            }
        }
        false
    }
}

fn parse_client_mask(value: &str) -> u32 {
    if value.starts_with('*') {
        return CON_MASK_ALL;
    }
    let mut mask = CON_MASK_MANDATORY;
    if value.eq_ignore_ascii_case(CLIENT_NONE) {
        return mask;
    }
    for token in value.split(',') {
        let token = token.trim();
        if token.eq_ignore_ascii_case("Serial") {
            mask |= ConnectionKind::ClientMsgSerial.mask();
        } else if token.eq_ignore_ascii_case("TCP") {
            mask |= ConnectionKind::ClientConnect.mask() | ConnectionKind::ClientMsgTcp.mask();
        } else if token.eq_ignore_ascii_case("Logstorage") {
            mask |= ConnectionKind::OfflineLogstorage.mask();
        } else if token.eq_ignore_ascii_case("Trace") {
            mask |= ConnectionKind::OfflineTrace.mask();
        } else {
            info!("ignoring unknown client type: {token}");
        }
    }
    mask
}

fn parse_control_mask(value: &str) -> ServiceIdMask {
    if value.starts_with('*') {
        return ServiceIdMask::all();
    }
    let mut mask = ServiceIdMask::default();
    if value.eq_ignore_ascii_case(CLIENT_NONE) {
        return mask;
    }
    for token in value.split(',') {
        let token = token.trim().trim_start_matches("0x");
        match u32::from_str_radix(token, 16) {
            Ok(id) if mask.set(id) => {}
            _ => warn!("ignoring invalid service ID: {token}"),
        }
    }
    mask
}

fn parse_injections(value: &str) -> Injections {
    if value.starts_with('*') {
        Injections::All
    } else if value.eq_ignore_ascii_case(CLIENT_NONE) {
        Injections::None
    } else {
        Injections::Named(
            value
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
        )
    }
}
