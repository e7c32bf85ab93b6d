//! Wire protocol constants shared by the codec, the control handler and the
//! producer-side user protocol.

use std::fmt;

/// Fixed width of application, context and ECU identifiers.
pub const ID_SIZE: usize = 4;

/// Serial framing magic prepended to messages on serial transports.
pub const SERIAL_HEADER: [u8; 4] = *b"DLS\x01";
/// Storage header magic; also the resync pattern for cached logstorage data.
pub const STORAGE_MAGIC: [u8; 4] = *b"DLT\x01";
/// User (producer IPC) framing magic.
pub const USER_HEADER: [u8; 4] = *b"DUH\x01";

/// A 4-byte ASCII tag, NUL padded. Used for APID, CTID and ECU id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Id4(pub [u8; ID_SIZE]);

impl Id4 {
    /// Build from a string, keeping the first four bytes. Empty input yields
    /// the empty id, which callers must treat as "unset".
    pub fn new(s: &str) -> Self {
        let mut id = [0u8; ID_SIZE];
        for (dst, src) in id.iter_mut().zip(s.bytes()) {
            *dst = src;
        }
        Id4(id)
    }

    pub fn from_bytes(raw: &[u8]) -> Self {
        let mut id = [0u8; ID_SIZE];
        for (dst, src) in id.iter_mut().zip(raw.iter()) {
            *dst = *src;
        }
        Id4(id)
    }

    pub fn is_empty(&self) -> bool {
        self.0[0] == 0
    }

    /// The `.*` wildcard used in logstorage filter configurations.
    pub fn is_wildcard(&self) -> bool {
        self.0.starts_with(b".*")
    }

    pub fn as_str(&self) -> &str {
        let end = self.0.iter().position(|b| *b == 0).unwrap_or(ID_SIZE);
        std::str::from_utf8(&self.0[..end]).unwrap_or("")
    }
}

impl fmt::Display for Id4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log levels as carried on the wire. `Default` is the sentinel meaning
/// "use the daemon default".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i8)]
pub enum LogLevel {
    Default = -1,
    Off = 0,
    Fatal = 1,
    Error = 2,
    Warn = 3,
    Info = 4,
    Debug = 5,
    Verbose = 6,
}

impl LogLevel {
    pub fn from_i8(value: i8) -> Option<LogLevel> {
        match value {
            -1 => Some(LogLevel::Default),
            0 => Some(LogLevel::Off),
            1 => Some(LogLevel::Fatal),
            2 => Some(LogLevel::Error),
            3 => Some(LogLevel::Warn),
            4 => Some(LogLevel::Info),
            5 => Some(LogLevel::Debug),
            6 => Some(LogLevel::Verbose),
            _ => None,
        }
    }

    /// Parse the `MCT_LOG_*` names used in logstorage configuration files.
    pub fn from_config_name(name: &str) -> Option<LogLevel> {
        match name.trim() {
            "MCT_LOG_OFF" => Some(LogLevel::Off),
            "MCT_LOG_FATAL" => Some(LogLevel::Fatal),
            "MCT_LOG_ERROR" => Some(LogLevel::Error),
            "MCT_LOG_WARN" => Some(LogLevel::Warn),
            "MCT_LOG_INFO" => Some(LogLevel::Info),
            "MCT_LOG_DEBUG" => Some(LogLevel::Debug),
            "MCT_LOG_VERBOSE" => Some(LogLevel::Verbose),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum TraceStatus {
    Default = -1,
    Off = 0,
    On = 1,
}

impl TraceStatus {
    pub fn from_i8(value: i8) -> Option<TraceStatus> {
        match value {
            -1 => Some(TraceStatus::Default),
            0 => Some(TraceStatus::Off),
            1 => Some(TraceStatus::On),
            _ => None,
        }
    }
}

/// Value producers send when they registered without an explicit level.
pub const LOG_LEVEL_NOT_SET: i8 = -2;

/* Standard header type bits. */
pub const HTYP_UEH: u8 = 0x01;
pub const HTYP_MSBF: u8 = 0x02;
pub const HTYP_WEID: u8 = 0x04;
pub const HTYP_WSID: u8 = 0x08;
pub const HTYP_WTMS: u8 = 0x10;
pub const HTYP_PROTOCOL_VERSION1: u8 = 0x20;

/* msin bit layout of the extended header. */
pub const MSIN_VERB: u8 = 0x01;
const MSIN_MSTP_SHIFT: u8 = 1;
const MSIN_MSTP_MASK: u8 = 0x0e;
const MSIN_MTIN_SHIFT: u8 = 4;
const MSIN_MTIN_MASK: u8 = 0xf0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Log,
    AppTrace,
    NwTrace,
    Control,
    Unknown(u8),
}

pub fn msin_message_type(msin: u8) -> MessageType {
    match (msin & MSIN_MSTP_MASK) >> MSIN_MSTP_SHIFT {
        0 => MessageType::Log,
        1 => MessageType::AppTrace,
        2 => MessageType::NwTrace,
        3 => MessageType::Control,
        other => MessageType::Unknown(other),
    }
}

/// Message type info nibble: log level for LOG, request/response for CONTROL.
pub fn msin_type_info(msin: u8) -> u8 {
    (msin & MSIN_MTIN_MASK) >> MSIN_MTIN_SHIFT
}

pub fn make_msin(verbose: bool, mstp: u8, mtin: u8) -> u8 {
    let mut msin = (mstp << MSIN_MSTP_SHIFT) & MSIN_MSTP_MASK;
    msin |= (mtin << MSIN_MTIN_SHIFT) & MSIN_MTIN_MASK;
    if verbose {
        msin |= MSIN_VERB;
    }
    msin
}

pub const MSTP_LOG: u8 = 0;
pub const MSTP_CONTROL: u8 = 3;
pub const MTIN_CONTROL_REQUEST: u8 = 1;
pub const MTIN_CONTROL_RESPONSE: u8 = 2;
pub const MTIN_CONTROL_TIME: u8 = 3;

/* Control service identifiers. */
pub const SERVICE_ID: u32 = 0x00;
pub const SERVICE_ID_SET_LOG_LEVEL: u32 = 0x01;
pub const SERVICE_ID_SET_TRACE_STATUS: u32 = 0x02;
pub const SERVICE_ID_GET_LOG_INFO: u32 = 0x03;
pub const SERVICE_ID_GET_DEFAULT_LOG_LEVEL: u32 = 0x04;
pub const SERVICE_ID_STORE_CONFIG: u32 = 0x05;
pub const SERVICE_ID_RESET_TO_FACTORY_DEFAULT: u32 = 0x06;
pub const SERVICE_ID_SET_MESSAGE_FILTERING: u32 = 0x0a;
pub const SERVICE_ID_SET_TIMING_PACKETS: u32 = 0x0b;
pub const SERVICE_ID_GET_LOCAL_TIME: u32 = 0x0c;
pub const SERVICE_ID_USE_ECU_ID: u32 = 0x0d;
pub const SERVICE_ID_USE_SESSION_ID: u32 = 0x0e;
pub const SERVICE_ID_USE_TIMESTAMP: u32 = 0x0f;
pub const SERVICE_ID_USE_EXTENDED_HEADER: u32 = 0x10;
pub const SERVICE_ID_SET_DEFAULT_LOG_LEVEL: u32 = 0x11;
pub const SERVICE_ID_SET_DEFAULT_TRACE_STATUS: u32 = 0x12;
pub const SERVICE_ID_GET_SOFTWARE_VERSION: u32 = 0x13;
pub const SERVICE_ID_MESSAGE_BUFFER_OVERFLOW: u32 = 0x14;
pub const SERVICE_ID_LAST_ENTRY: u32 = 0x15;

/* Daemon-specific service identifiers (upper band). */
pub const USER_SERVICE_ID: u32 = 0xf00;
pub const SERVICE_ID_UNREGISTER_CONTEXT: u32 = 0xf01;
pub const SERVICE_ID_CONNECTION_INFO: u32 = 0xf02;
pub const SERVICE_ID_TIMEZONE: u32 = 0xf03;
pub const SERVICE_ID_MARKER: u32 = 0xf04;
pub const SERVICE_ID_OFFLINE_LOGSTORAGE: u32 = 0xf05;
pub const SERVICE_ID_SET_BLOCK_MODE: u32 = 0xf06;
pub const SERVICE_ID_GET_BLOCK_MODE: u32 = 0xf07;
pub const SERVICE_ID_SET_FILTER_LEVEL: u32 = 0xf08;
pub const SERVICE_ID_GET_FILTER_STATUS: u32 = 0xf09;
pub const SERVICE_ID_SET_ALL_LOG_LEVEL: u32 = 0xf0a;
pub const SERVICE_ID_SET_ALL_TRACE_STATUS: u32 = 0xf0b;
pub const USER_SERVICE_ID_LAST_ENTRY: u32 = 0xf0c;

/// Identifiers at or above this value are software injections.
pub const INJECTION_MIN: u32 = 0xfff;

/// True for ids inside either valid control band.
pub fn is_control_id(id: u32) -> bool {
    (id > SERVICE_ID && id < SERVICE_ID_LAST_ENTRY)
        || (id > USER_SERVICE_ID && id < USER_SERVICE_ID_LAST_ENTRY)
}

pub fn is_injection_id(id: u32) -> bool {
    id >= INJECTION_MIN
}

/* Control response statuses. */
pub const RESPONSE_OK: u8 = 0;
pub const RESPONSE_NOT_SUPPORTED: u8 = 1;
pub const RESPONSE_ERROR: u8 = 2;
pub const RESPONSE_PERM_DENIED: u8 = 3;
pub const RESPONSE_NO_MATCHING_CONTEXT: u8 = 8;

/// Trailer of a GET_LOG_INFO response payload.
pub const GET_LOG_INFO_TRAILER: [u8; 4] = *b"remo";

/* Connection info statuses broadcast to clients. */
pub const CONNECTION_STATUS_DISCONNECTED: u8 = 1;
pub const CONNECTION_STATUS_CONNECTED: u8 = 2;

/* Block mode values pushed to producers. */
pub const BLOCK_MODE_NON_BLOCKING: i32 = 0;
pub const BLOCK_MODE_BLOCKING: i32 = 1;

/// Apid/ctid stamped on daemon-originated control messages.
pub const DAEMON_CTRL_APID: &str = "DA1";
pub const DAEMON_CTRL_CTID: &str = "DC1";
