//! Framed message codec.
//!
//! A message on the wire is: optional serial header magic, the standard
//! header, extra header fields whose presence is flagged in `htyp`, an
//! optional extended header, then the payload. The daemon prepends a storage
//! header when persisting or forwarding to clients.

use crate::protocol::*;
use thiserror::Error;

pub const STORAGE_HEADER_SIZE: usize = 16;
pub const STANDARD_HEADER_SIZE: usize = 4;
pub const EXTENDED_HEADER_SIZE: usize = 10;

/// Maximum value of the standard header length field.
pub const MAX_MESSAGE_LEN: usize = u16::MAX as usize;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("message length field {0} is shorter than its headers")]
    LengthUnderflow(u16),
    #[error("message exceeds the 16-bit length field ({0} bytes)")]
    Oversized(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandardHeader {
    pub htyp: u8,
    pub mcnt: u8,
    pub len: u16,
}

impl StandardHeader {
    pub fn has_extended(&self) -> bool {
        self.htyp & HTYP_UEH != 0
    }

    pub fn payload_big_endian(&self) -> bool {
        self.htyp & HTYP_MSBF != 0
    }

    /// Size of the extra header portion encoded by the `htyp` flags.
    pub fn extra_size(&self) -> usize {
        let mut size = 0;
        if self.htyp & HTYP_WEID != 0 {
            size += ID_SIZE;
        }
        if self.htyp & HTYP_WSID != 0 {
            size += 4;
        }
        if self.htyp & HTYP_WTMS != 0 {
            size += 4;
        }
        size
    }
}

/// Extra header fields; `seid` and `tmsp` travel big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeaderExtra {
    pub ecu: Option<Id4>,
    pub seid: Option<u32>,
    pub tmsp: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendedHeader {
    pub msin: u8,
    pub noar: u8,
    pub apid: Id4,
    pub ctid: Id4,
}

impl ExtendedHeader {
    pub fn is_verbose(&self) -> bool {
        self.msin & MSIN_VERB != 0
    }
}

/// A parsed message. `header_raw` holds the bytes from the standard header
/// through the extended header exactly as they appeared (or were emitted),
/// so forwarding never re-serializes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub standard: StandardHeader,
    pub extra: HeaderExtra,
    pub extended: Option<ExtendedHeader>,
    pub header_raw: Vec<u8>,
    pub payload: Vec<u8>,
}

/// Outcome of a parse attempt over buffered bytes.
#[derive(Debug)]
pub enum ReadOutcome {
    /// A complete message; `consumed` covers resync skips, the serial
    /// header when present, headers and payload.
    Message { msg: Box<Message>, consumed: usize },
    /// A partial trailing message; keep the bytes and retry after more
    /// data arrives.
    NeedMore,
    /// Serial resync: no header magic in the buffered bytes. Drop `skip`
    /// bytes of garbage and wait for more; whatever follows them is a
    /// still-incomplete magic tail. Never a reason to drop the connection.
    Resync { skip: usize },
}

impl Message {
    /// Parse one message from `buf`. With `sync_to_serial` the parser first
    /// scans for the serial header magic and accounts skipped bytes in the
    /// consumed count.
    pub fn parse(buf: &[u8], sync_to_serial: bool) -> Result<ReadOutcome, CodecError> {
        let mut offset = 0;

        if sync_to_serial {
            match find_pattern(buf, &SERIAL_HEADER) {
                Some(pos) => offset = pos + SERIAL_HEADER.len(),
                None => {
                    // The magic may be arriving byte by byte: keep a tail
                    // that is still a prefix of it, discard the rest.
                    let keep = partial_suffix_len(buf, &SERIAL_HEADER);
                    let skip = buf.len() - keep;
                    return if skip == 0 {
                        Ok(ReadOutcome::NeedMore)
                    } else {
                        Ok(ReadOutcome::Resync { skip })
                    };
                }
            }
        } else if buf.len() >= SERIAL_HEADER.len() && buf[..SERIAL_HEADER.len()] == SERIAL_HEADER {
            // Tolerate a serial header on non-serial transports.
            offset = SERIAL_HEADER.len();
        }

        let body = &buf[offset..];
        if body.len() < STANDARD_HEADER_SIZE {
            return Ok(ReadOutcome::NeedMore);
        }

        let standard = StandardHeader {
            htyp: body[0],
            mcnt: body[1],
            len: u16::from_be_bytes([body[2], body[3]]),
        };

        let mut header_len = STANDARD_HEADER_SIZE + standard.extra_size();
        if standard.has_extended() {
            header_len += EXTENDED_HEADER_SIZE;
        }

        let total = standard.len as usize;
        if total < header_len {
            return Err(CodecError::LengthUnderflow(standard.len));
        }
        if body.len() < total {
            return Ok(ReadOutcome::NeedMore);
        }

        let mut pos = STANDARD_HEADER_SIZE;
        let mut extra = HeaderExtra::default();
        if standard.htyp & HTYP_WEID != 0 {
            extra.ecu = Some(Id4::from_bytes(&body[pos..pos + ID_SIZE]));
            pos += ID_SIZE;
        }
        if standard.htyp & HTYP_WSID != 0 {
            extra.seid = Some(u32::from_be_bytes(body[pos..pos + 4].try_into().unwrap()));
            pos += 4;
        }
        if standard.htyp & HTYP_WTMS != 0 {
            extra.tmsp = Some(u32::from_be_bytes(body[pos..pos + 4].try_into().unwrap()));
            pos += 4;
        }

        let extended = if standard.has_extended() {
            let ext = ExtendedHeader {
                msin: body[pos],
                noar: body[pos + 1],
                apid: Id4::from_bytes(&body[pos + 2..pos + 6]),
                ctid: Id4::from_bytes(&body[pos + 6..pos + 10]),
            };
            pos += EXTENDED_HEADER_SIZE;
            Some(ext)
        } else {
            None
        };

        let msg = Message {
            standard,
            extra,
            extended,
            header_raw: body[..pos].to_vec(),
            payload: body[pos..total].to_vec(),
        };

        Ok(ReadOutcome::Message {
            msg: Box::new(msg),
            consumed: offset + total,
        })
    }

    /// Build a message from parts, filling in the length field. Fails when
    /// the result would not fit the 16-bit length.
    pub fn build(
        htyp: u8,
        mcnt: u8,
        extra: HeaderExtra,
        extended: Option<ExtendedHeader>,
        payload: Vec<u8>,
    ) -> Result<Message, CodecError> {
        let mut header_raw = Vec::with_capacity(STANDARD_HEADER_SIZE + 18);
        let mut htyp = htyp;
        if extra.ecu.is_some() {
            htyp |= HTYP_WEID;
        }
        if extra.seid.is_some() {
            htyp |= HTYP_WSID;
        }
        if extra.tmsp.is_some() {
            htyp |= HTYP_WTMS;
        }
        if extended.is_some() {
            htyp |= HTYP_UEH;
        }

        header_raw.extend_from_slice(&[htyp, mcnt, 0, 0]);
        if let Some(ecu) = extra.ecu {
            header_raw.extend_from_slice(&ecu.0);
        }
        if let Some(seid) = extra.seid {
            header_raw.extend_from_slice(&seid.to_be_bytes());
        }
        if let Some(tmsp) = extra.tmsp {
            header_raw.extend_from_slice(&tmsp.to_be_bytes());
        }
        if let Some(ext) = &extended {
            header_raw.push(ext.msin);
            header_raw.push(ext.noar);
            header_raw.extend_from_slice(&ext.apid.0);
            header_raw.extend_from_slice(&ext.ctid.0);
        }

        let total = header_raw.len() + payload.len();
        if total > MAX_MESSAGE_LEN {
            return Err(CodecError::Oversized(total));
        }
        let len = total as u16;
        header_raw[2..4].copy_from_slice(&len.to_be_bytes());

        Ok(Message {
            standard: StandardHeader { htyp, mcnt, len },
            extra,
            extended,
            header_raw,
            payload,
        })
    }

    pub fn apid(&self) -> Id4 {
        self.extended.map(|e| e.apid).unwrap_or_default()
    }

    pub fn ctid(&self) -> Id4 {
        self.extended.map(|e| e.ctid).unwrap_or_default()
    }

    /// Log level for LOG messages; None for other message types.
    pub fn log_level(&self) -> Option<LogLevel> {
        let ext = self.extended.as_ref()?;
        match msin_message_type(ext.msin) {
            MessageType::Log => LogLevel::from_i8(msin_type_info(ext.msin) as i8),
            _ => None,
        }
    }

    /// Payload-endian aware u32 read, used for control service ids.
    pub fn payload_u32(&self, offset: usize) -> Option<u32> {
        let raw: [u8; 4] = self.payload.get(offset..offset + 4)?.try_into().ok()?;
        Some(if self.standard.payload_big_endian() {
            u32::from_be_bytes(raw)
        } else {
            u32::from_le_bytes(raw)
        })
    }
}

/// Storage header stamped by the daemon: magic, wall-clock seconds and
/// microseconds, ECU id.
pub fn storage_header(ecu: Id4) -> [u8; STORAGE_HEADER_SIZE] {
    let now = chrono::Utc::now();
    storage_header_at(ecu, now.timestamp() as u32, now.timestamp_subsec_micros() as i32)
}

pub fn storage_header_at(ecu: Id4, seconds: u32, microseconds: i32) -> [u8; STORAGE_HEADER_SIZE] {
    let mut hdr = [0u8; STORAGE_HEADER_SIZE];
    hdr[..4].copy_from_slice(&STORAGE_MAGIC);
    hdr[4..8].copy_from_slice(&seconds.to_le_bytes());
    hdr[8..12].copy_from_slice(&microseconds.to_le_bytes());
    hdr[12..16].copy_from_slice(&ecu.0);
    hdr
}

pub fn find_pattern(buf: &[u8], pattern: &[u8]) -> Option<usize> {
    if buf.len() < pattern.len() {
        return None;
    }
    (0..=buf.len() - pattern.len()).find(|&i| &buf[i..i + pattern.len()] == pattern)
}

/// Length of the longest buffer suffix that is a proper prefix of
/// `pattern` (an in-flight magic whose remaining bytes have not arrived).
fn partial_suffix_len(buf: &[u8], pattern: &[u8]) -> usize {
    let max = (pattern.len() - 1).min(buf.len());
    (1..=max)
        .rev()
        .find(|&len| buf[buf.len() - len..] == pattern[..len])
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(extra: HeaderExtra, extended: Option<ExtendedHeader>) -> Message {
        Message::build(HTYP_PROTOCOL_VERSION1, 7, extra, extended, vec![1, 2, 3, 4]).unwrap()
    }

    #[test]
    fn parse_emit_round_trip_all_flag_combinations() {
        let ecu_opts = [None, Some(Id4::new("ECU1"))];
        let seid_opts = [None, Some(0xdeadbeef_u32)];
        let tmsp_opts = [None, Some(123456_u32)];
        let ext_opts = [
            None,
            Some(ExtendedHeader {
                msin: make_msin(true, MSTP_LOG, LogLevel::Info as i8 as u8),
                noar: 2,
                apid: Id4::new("APP1"),
                ctid: Id4::new("CTX1"),
            }),
        ];

        for ecu in ecu_opts {
            for seid in seid_opts {
                for tmsp in tmsp_opts {
                    for ext in ext_opts {
                        let msg = sample(HeaderExtra { ecu, seid, tmsp }, ext);
                        let mut wire = msg.header_raw.clone();
                        wire.extend_from_slice(&msg.payload);
                        match Message::parse(&wire, false).unwrap() {
                            ReadOutcome::Message { msg: parsed, consumed } => {
                                assert_eq!(consumed, wire.len());
                                assert_eq!(*parsed, msg);
                            }
                            other => panic!("complete message not parsed: {other:?}"),
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn partial_message_is_kept() {
        let msg = sample(HeaderExtra::default(), None);
        let mut wire = msg.header_raw.clone();
        wire.extend_from_slice(&msg.payload);
        for cut in 0..wire.len() {
            assert!(matches!(
                Message::parse(&wire[..cut], false).unwrap(),
                ReadOutcome::NeedMore
            ));
        }
    }

    #[test]
    fn serial_resync_skips_garbage() {
        let msg = sample(HeaderExtra::default(), None);
        let mut wire = vec![0xaa, 0xbb, 0xcc];
        wire.extend_from_slice(&SERIAL_HEADER);
        let skip = wire.len();
        wire.extend_from_slice(&msg.header_raw);
        wire.extend_from_slice(&msg.payload);

        match Message::parse(&wire, true).unwrap() {
            ReadOutcome::Message { msg: parsed, consumed } => {
                assert_eq!(consumed, skip + parsed.standard.len as usize);
                assert_eq!(parsed.payload, msg.payload);
            }
            other => panic!("resync failed: {other:?}"),
        }
    }

    #[test]
    fn trailing_partial_magic_waits_for_more() {
        // A magic arriving byte by byte must never fail the stream.
        for cut in 1..SERIAL_HEADER.len() {
            assert!(matches!(
                Message::parse(&SERIAL_HEADER[..cut], true).unwrap(),
                ReadOutcome::NeedMore
            ));
        }

        // Garbage followed by the start of a magic: drop only the garbage.
        let mut wire = vec![0x11, 0x22, 0x33, 0x44, 0x55];
        wire.extend_from_slice(&SERIAL_HEADER[..2]);
        match Message::parse(&wire, true).unwrap() {
            ReadOutcome::Resync { skip } => assert_eq!(skip, 5),
            other => panic!("expected resync, got {other:?}"),
        }
    }

    #[test]
    fn garbage_without_magic_is_skipped_not_fatal() {
        let wire = [0x11u8, 0x22, 0x33, 0x44, 0x55, 0x66];
        match Message::parse(&wire, true).unwrap() {
            ReadOutcome::Resync { skip } => assert_eq!(skip, wire.len()),
            other => panic!("expected resync, got {other:?}"),
        }
    }

    #[test]
    fn resync_then_completion_yields_the_message() {
        let msg = sample(HeaderExtra::default(), None);
        // First read: garbage plus the first byte of the magic.
        let mut buffered = vec![0xde, 0xad, b'D'];
        let skip = match Message::parse(&buffered, true).unwrap() {
            ReadOutcome::Resync { skip } => skip,
            other => panic!("expected resync, got {other:?}"),
        };
        assert_eq!(skip, 2);
        buffered.drain(..skip);

        // Second read completes the magic and the frame.
        buffered.extend_from_slice(&SERIAL_HEADER[1..]);
        buffered.extend_from_slice(&msg.header_raw);
        buffered.extend_from_slice(&msg.payload);
        match Message::parse(&buffered, true).unwrap() {
            ReadOutcome::Message { msg: parsed, consumed } => {
                assert_eq!(consumed, buffered.len());
                assert_eq!(*parsed, msg);
            }
            other => panic!("expected a message, got {other:?}"),
        }
    }

    #[test]
    fn oversized_build_rejected() {
        let err = Message::build(
            HTYP_PROTOCOL_VERSION1,
            0,
            HeaderExtra::default(),
            None,
            vec![0; MAX_MESSAGE_LEN + 1],
        );
        assert!(matches!(err, Err(CodecError::Oversized(_))));
    }

    #[test]
    fn length_underflow_rejected() {
        // Claims UEH but the length only covers the standard header.
        let wire = [HTYP_UEH, 0, 0, 4, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        assert!(matches!(
            Message::parse(&wire, false),
            Err(CodecError::LengthUnderflow(4))
        ));
    }

    #[test]
    fn storage_header_layout() {
        let hdr = storage_header_at(Id4::new("ECU1"), 1000, 500);
        assert_eq!(&hdr[..4], b"DLT\x01");
        assert_eq!(u32::from_le_bytes(hdr[4..8].try_into().unwrap()), 1000);
        assert_eq!(&hdr[12..16], b"ECU1");
    }
}
