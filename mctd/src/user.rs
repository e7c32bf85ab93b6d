//! Producer-side IPC protocol.
//!
//! Every frame on the producer transport is a fixed user header (magic +
//! message id) followed by a typed body. Integers are little-endian; the
//! transport never leaves the host.

use crate::codec::{Message, ReadOutcome};
use crate::protocol::{Id4, ID_SIZE, USER_HEADER};
use thiserror::Error;

pub const USER_HEADER_SIZE: usize = 8;

pub const USER_MSG_LOG: u32 = 1;
pub const USER_MSG_REGISTER_APPLICATION: u32 = 2;
pub const USER_MSG_UNREGISTER_APPLICATION: u32 = 3;
pub const USER_MSG_REGISTER_CONTEXT: u32 = 4;
pub const USER_MSG_UNREGISTER_CONTEXT: u32 = 5;
pub const USER_MSG_LOG_LEVEL: u32 = 6;
pub const USER_MSG_INJECTION: u32 = 7;
pub const USER_MSG_OVERFLOW: u32 = 8;
pub const USER_MSG_LOG_STATE: u32 = 9;
pub const USER_MSG_SET_BLOCK_MODE: u32 = 10;

/// Longest accepted description string in register messages.
const MAX_DESCRIPTION_LEN: usize = 1024;

#[derive(Debug, Error)]
pub enum UserProtocolError {
    #[error("bad user header magic")]
    BadMagic,
    #[error("unknown user message id {0}")]
    UnknownId(u32),
    #[error("user message body malformed: {0}")]
    Malformed(&'static str),
    #[error(transparent)]
    Codec(#[from] crate::codec::CodecError),
}

/// Messages a producer sends to the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserMessage {
    Log(Box<Message>),
    RegisterApplication {
        apid: Id4,
        pid: u32,
        description: String,
    },
    UnregisterApplication {
        apid: Id4,
        pid: u32,
    },
    RegisterContext {
        apid: Id4,
        ctid: Id4,
        log_level_pos: i32,
        log_level: i8,
        trace_status: i8,
        pid: u32,
        description: String,
    },
    UnregisterContext {
        apid: Id4,
        ctid: Id4,
        pid: u32,
    },
    Overflow {
        counter: u32,
        apid: Id4,
    },
}

/// Parse one frame from buffered bytes. `Ok(None)` means the frame is still
/// incomplete; the caller keeps the bytes.
pub fn parse_frame(buf: &[u8]) -> Result<Option<(UserMessage, usize)>, UserProtocolError> {
    if buf.len() < USER_HEADER_SIZE {
        return Ok(None);
    }
    if buf[..4] != USER_HEADER {
        return Err(UserProtocolError::BadMagic);
    }
    let id = u32::from_le_bytes(buf[4..8].try_into().unwrap());
    let body = &buf[USER_HEADER_SIZE..];

    match id {
        USER_MSG_LOG => match Message::parse(body, false)? {
            ReadOutcome::Message { msg, consumed } => Ok(Some((
                UserMessage::Log(msg),
                USER_HEADER_SIZE + consumed,
            ))),
            ReadOutcome::NeedMore => Ok(None),
            // Not produced without serial resync.
            ReadOutcome::Resync { .. } => {
                Err(UserProtocolError::Malformed("unexpected serial resync"))
            }
        },
        USER_MSG_REGISTER_APPLICATION => {
            const FIXED: usize = ID_SIZE + 4 + 4;
            let Some(fixed) = body.get(..FIXED) else {
                return Ok(None);
            };
            let apid = Id4::from_bytes(&fixed[..ID_SIZE]);
            let pid = u32::from_le_bytes(fixed[4..8].try_into().unwrap());
            let desc_len = u32::from_le_bytes(fixed[8..12].try_into().unwrap()) as usize;
            if desc_len > MAX_DESCRIPTION_LEN {
                return Err(UserProtocolError::Malformed("description too long"));
            }
            let Some(desc) = body.get(FIXED..FIXED + desc_len) else {
                return Ok(None);
            };
            Ok(Some((
                UserMessage::RegisterApplication {
                    apid,
                    pid,
                    description: String::from_utf8_lossy(desc).into_owned(),
                },
                USER_HEADER_SIZE + FIXED + desc_len,
            )))
        }
        USER_MSG_UNREGISTER_APPLICATION => {
            const FIXED: usize = ID_SIZE + 4;
            let Some(fixed) = body.get(..FIXED) else {
                return Ok(None);
            };
            Ok(Some((
                UserMessage::UnregisterApplication {
                    apid: Id4::from_bytes(&fixed[..ID_SIZE]),
                    pid: u32::from_le_bytes(fixed[4..8].try_into().unwrap()),
                },
                USER_HEADER_SIZE + FIXED,
            )))
        }
        USER_MSG_REGISTER_CONTEXT => {
            const FIXED: usize = 2 * ID_SIZE + 4 + 1 + 1 + 4 + 4;
            let Some(fixed) = body.get(..FIXED) else {
                return Ok(None);
            };
            let apid = Id4::from_bytes(&fixed[..ID_SIZE]);
            let ctid = Id4::from_bytes(&fixed[4..8]);
            let log_level_pos = i32::from_le_bytes(fixed[8..12].try_into().unwrap());
            let log_level = fixed[12] as i8;
            let trace_status = fixed[13] as i8;
            let pid = u32::from_le_bytes(fixed[14..18].try_into().unwrap());
            let desc_len = u32::from_le_bytes(fixed[18..22].try_into().unwrap()) as usize;
            if desc_len > MAX_DESCRIPTION_LEN {
                return Err(UserProtocolError::Malformed("description too long"));
            }
            let Some(desc) = body.get(FIXED..FIXED + desc_len) else {
                return Ok(None);
            };
            Ok(Some((
                UserMessage::RegisterContext {
                    apid,
                    ctid,
                    log_level_pos,
                    log_level,
                    trace_status,
                    pid,
                    description: String::from_utf8_lossy(desc).into_owned(),
                },
                USER_HEADER_SIZE + FIXED + desc_len,
            )))
        }
        USER_MSG_UNREGISTER_CONTEXT => {
            const FIXED: usize = 2 * ID_SIZE + 4;
            let Some(fixed) = body.get(..FIXED) else {
                return Ok(None);
            };
            Ok(Some((
                UserMessage::UnregisterContext {
                    apid: Id4::from_bytes(&fixed[..ID_SIZE]),
                    ctid: Id4::from_bytes(&fixed[4..8]),
                    pid: u32::from_le_bytes(fixed[8..12].try_into().unwrap()),
                },
                USER_HEADER_SIZE + FIXED,
            )))
        }
        USER_MSG_OVERFLOW => {
            const FIXED: usize = 4 + ID_SIZE;
            let Some(fixed) = body.get(..FIXED) else {
                return Ok(None);
            };
            Ok(Some((
                UserMessage::Overflow {
                    counter: u32::from_le_bytes(fixed[..4].try_into().unwrap()),
                    apid: Id4::from_bytes(&fixed[4..8]),
                },
                USER_HEADER_SIZE + FIXED,
            )))
        }
        other => Err(UserProtocolError::UnknownId(other)),
    }
}

fn header(id: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(USER_HEADER_SIZE + 16);
    out.extend_from_slice(&USER_HEADER);
    out.extend_from_slice(&id.to_le_bytes());
    out
}

/// Encode the daemon→producer log level push.
pub fn encode_log_level(log_level: u8, trace_status: u8, log_level_pos: i32) -> Vec<u8> {
    let mut out = header(USER_MSG_LOG_LEVEL);
    out.push(log_level);
    out.push(trace_status);
    out.extend_from_slice(&log_level_pos.to_le_bytes());
    out
}

/// Encode the daemon→producer connection state push.
pub fn encode_log_state(state: u8) -> Vec<u8> {
    let mut out = header(USER_MSG_LOG_STATE);
    out.push(state);
    out
}

/// Encode an injection forwarded to a producer context.
pub fn encode_injection(log_level_pos: i32, service_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = header(USER_MSG_INJECTION);
    out.extend_from_slice(&log_level_pos.to_le_bytes());
    out.extend_from_slice(&service_id.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Encode the daemon→producer block mode push.
pub fn encode_block_mode(block_mode: i32) -> Vec<u8> {
    let mut out = header(USER_MSG_SET_BLOCK_MODE);
    out.extend_from_slice(&block_mode.to_le_bytes());
    out
}

/// Encode a producer→daemon frame; used by tests and local tooling.
pub fn encode_register_application(apid: Id4, pid: u32, description: &str) -> Vec<u8> {
    let mut out = header(USER_MSG_REGISTER_APPLICATION);
    out.extend_from_slice(&apid.0);
    out.extend_from_slice(&pid.to_le_bytes());
    out.extend_from_slice(&(description.len() as u32).to_le_bytes());
    out.extend_from_slice(description.as_bytes());
    out
}

pub fn encode_register_context(
    apid: Id4,
    ctid: Id4,
    log_level_pos: i32,
    log_level: i8,
    trace_status: i8,
    pid: u32,
    description: &str,
) -> Vec<u8> {
    let mut out = header(USER_MSG_REGISTER_CONTEXT);
    out.extend_from_slice(&apid.0);
    out.extend_from_slice(&ctid.0);
    out.extend_from_slice(&log_level_pos.to_le_bytes());
    out.push(log_level as u8);
    out.push(trace_status as u8);
    out.extend_from_slice(&pid.to_le_bytes());
    out.extend_from_slice(&(description.len() as u32).to_le_bytes());
    out.extend_from_slice(description.as_bytes());
    out
}

pub fn encode_unregister_application(apid: Id4, pid: u32) -> Vec<u8> {
    let mut out = header(USER_MSG_UNREGISTER_APPLICATION);
    out.extend_from_slice(&apid.0);
    out.extend_from_slice(&pid.to_le_bytes());
    out
}

pub fn encode_unregister_context(apid: Id4, ctid: Id4, pid: u32) -> Vec<u8> {
    let mut out = header(USER_MSG_UNREGISTER_CONTEXT);
    out.extend_from_slice(&apid.0);
    out.extend_from_slice(&ctid.0);
    out.extend_from_slice(&pid.to_le_bytes());
    out
}

pub fn encode_log(msg: &Message) -> Vec<u8> {
    let mut out = header(USER_MSG_LOG);
    out.extend_from_slice(&msg.header_raw);
    out.extend_from_slice(&msg.payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::HeaderExtra;
    use crate::protocol::*;

    #[test]
    fn register_application_round_trip() {
        let wire = encode_register_application(Id4::new("APP1"), 42, "demo app");
        let (msg, consumed) = parse_frame(&wire).unwrap().unwrap();
        assert_eq!(consumed, wire.len());
        assert_eq!(
            msg,
            UserMessage::RegisterApplication {
                apid: Id4::new("APP1"),
                pid: 42,
                description: "demo app".into(),
            }
        );
    }

    #[test]
    fn register_context_round_trip() {
        let wire = encode_register_context(
            Id4::new("APP1"),
            Id4::new("CTX1"),
            3,
            LogLevel::Default as i8,
            TraceStatus::Default as i8,
            42,
            "ctx",
        );
        let (msg, _) = parse_frame(&wire).unwrap().unwrap();
        match msg {
            UserMessage::RegisterContext {
                apid,
                ctid,
                log_level_pos,
                log_level,
                trace_status,
                pid,
                description,
            } => {
                assert_eq!(apid, Id4::new("APP1"));
                assert_eq!(ctid, Id4::new("CTX1"));
                assert_eq!(log_level_pos, 3);
                assert_eq!(log_level, -1);
                assert_eq!(trace_status, -1);
                assert_eq!(pid, 42);
                assert_eq!(description, "ctx");
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn log_frame_round_trip() {
        let ext = crate::codec::ExtendedHeader {
            msin: make_msin(true, MSTP_LOG, LogLevel::Info as i8 as u8),
            noar: 1,
            apid: Id4::new("APP1"),
            ctid: Id4::new("CTX1"),
        };
        let msg = Message::build(
            HTYP_PROTOCOL_VERSION1,
            1,
            HeaderExtra::default(),
            Some(ext),
            b"hello".to_vec(),
        )
        .unwrap();
        let wire = encode_log(&msg);
        let (parsed, consumed) = parse_frame(&wire).unwrap().unwrap();
        assert_eq!(consumed, wire.len());
        match parsed {
            UserMessage::Log(m) => assert_eq!(*m, msg),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn partial_frames_wait_for_more() {
        let wire = encode_register_application(Id4::new("APP1"), 42, "demo");
        for cut in 0..wire.len() {
            assert!(parse_frame(&wire[..cut]).unwrap().is_none());
        }
    }

    #[test]
    fn bad_magic_is_an_error() {
        let wire = b"XXXX\x01\x00\x00\x00rest";
        assert!(matches!(
            parse_frame(wire),
            Err(UserProtocolError::BadMagic)
        ));
    }
}
