//! Typed client connections and fan-out send.
//!
//! The core task owns every client sink; reader tasks only hold the read
//! halves. Serial clients ride a pre-configured device, written to here
//! and read by their own reader task (line discipline setup happens
//! outside the daemon).

use crate::protocol::SERIAL_HEADER;
use std::io;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;

/// Connection kinds; the discriminant doubles as the bit position inside
/// the filter client mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ConnectionKind {
    ClientConnect = 0,
    ClientMsgTcp = 1,
    ClientMsgSerial = 2,
    AppConnect = 3,
    AppMsg = 4,
    ControlConnect = 5,
    ControlMsg = 6,
    OneSecTimer = 7,
    SixtySecTimer = 8,
    OfflineTrace = 9,
    OfflineLogstorage = 10,
}

impl ConnectionKind {
    pub const fn mask(self) -> u32 {
        1 << self as u32
    }
}

pub const CON_MASK_ALL: u32 = u32::MAX;

/// Connections every filter configuration permits, no matter how closed.
pub const CON_MASK_MANDATORY: u32 = ConnectionKind::AppConnect.mask()
    | ConnectionKind::AppMsg.mask()
    | ConnectionKind::ControlConnect.mask()
    | ConnectionKind::ControlMsg.mask()
    | ConnectionKind::OneSecTimer.mask()
    | ConnectionKind::SixtySecTimer.mask();

#[derive(Debug)]
pub enum ClientSink {
    Tcp(OwnedWriteHalf),
    Unix(tokio::net::unix::OwnedWriteHalf),
    Serial(tokio::fs::File),
}

#[derive(Debug)]
pub struct Client {
    pub id: u64,
    pub kind: ConnectionKind,
    pub sink: ClientSink,
    pub peer: String,
}

impl Client {
    /// Send one message as up to two spans, with the serial header magic
    /// prepended when the peer expects it. The whole write is bounded by
    /// `timeout`; timeouts surface as errors so the caller drops the client.
    pub async fn send_multiple(
        &mut self,
        data1: &[u8],
        data2: &[u8],
        serial_header: bool,
        timeout: Duration,
    ) -> io::Result<()> {
        let write = async {
            match &mut self.sink {
                ClientSink::Tcp(half) => {
                    if serial_header {
                        half.write_all(&SERIAL_HEADER).await?;
                    }
                    half.write_all(data1).await?;
                    half.write_all(data2).await?;
                    Ok(())
                }
                ClientSink::Unix(half) => {
                    if serial_header {
                        half.write_all(&SERIAL_HEADER).await?;
                    }
                    half.write_all(data1).await?;
                    half.write_all(data2).await?;
                    Ok(())
                }
                ClientSink::Serial(file) => {
                    if serial_header {
                        file.write_all(&SERIAL_HEADER).await?;
                    }
                    file.write_all(data1).await?;
                    file.write_all(data2).await?;
                    file.flush().await
                }
            }
        };
        match tokio::time::timeout(timeout, write).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "client send timed out",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_masks_are_distinct_bits() {
        let kinds = [
            ConnectionKind::ClientConnect,
            ConnectionKind::ClientMsgTcp,
            ConnectionKind::ClientMsgSerial,
            ConnectionKind::AppConnect,
            ConnectionKind::AppMsg,
            ConnectionKind::ControlConnect,
            ConnectionKind::ControlMsg,
            ConnectionKind::OneSecTimer,
            ConnectionKind::SixtySecTimer,
            ConnectionKind::OfflineTrace,
            ConnectionKind::OfflineLogstorage,
        ];
        let mut seen = 0u32;
        for kind in kinds {
            assert_eq!(seen & kind.mask(), 0);
            seen |= kind.mask();
        }
        assert_eq!(CON_MASK_MANDATORY & ConnectionKind::ClientMsgTcp.mask(), 0);
    }
}
