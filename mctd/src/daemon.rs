//! Core daemon state: logging state machine, defaults, ring buffer
//! ownership and overflow accounting.

use crate::protocol::*;
use crate::ringbuffer::RingBuffer;
use log::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    /// Startup, nothing routed yet.
    Init,
    /// No client attached; messages go to the ring buffer.
    Buffer,
    /// Ring buffer exhausted; new messages are dropped and counted.
    BufferFull,
    /// Client attached but the ring buffer still holds backlog.
    SendBuffer,
    /// Client attached, backlog drained; direct fan-out.
    SendDirect,
}

#[derive(Debug)]
pub struct Daemon {
    pub state: DaemonState,
    pub ecuid: Id4,
    pub default_log_level: LogLevel,
    pub default_trace_status: TraceStatus,
    pub force_ll_ts: bool,
    pub send_serial_header: bool,
    pub timing_packets: bool,
    pub overflow_counter: u32,
    overflow_announcements: u32,
    /// Whether any viewer client is attached; pushed to producers.
    pub connection_state: bool,
    pub ringbuffer: RingBuffer,
    pub ecu_version: Option<String>,
    pub block_mode: i32,
    pub allow_block_mode: bool,
    pub maintain_logstorage_loglevel: bool,
    message_counter: u8,
}

impl Daemon {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ecuid: Id4,
        default_log_level: LogLevel,
        default_trace_status: TraceStatus,
        force_ll_ts: bool,
        ringbuffer_min: usize,
        ringbuffer_max: usize,
        ringbuffer_step: usize,
    ) -> Self {
        Daemon {
            state: DaemonState::Init,
            ecuid,
            default_log_level,
            default_trace_status,
            force_ll_ts,
            send_serial_header: false,
            timing_packets: false,
            overflow_counter: 0,
            overflow_announcements: 0,
            connection_state: false,
            ringbuffer: RingBuffer::new(ringbuffer_min, ringbuffer_max, ringbuffer_step),
            ecu_version: None,
            block_mode: BLOCK_MODE_NON_BLOCKING,
            allow_block_mode: false,
            maintain_logstorage_loglevel: true,
            message_counter: 0,
        }
    }

    pub fn change_state(&mut self, new_state: DaemonState) {
        if self.state == new_state {
            return;
        }
        info!("daemon state {:?} -> {:?}", self.state, new_state);
        self.state = new_state;
    }

    /// Next standard-header message counter for daemon-originated messages.
    pub fn next_message_counter(&mut self) -> u8 {
        let counter = self.message_counter;
        self.message_counter = self.message_counter.wrapping_add(1);
        counter
    }

    /// Route decision for a message that was not delivered directly: store
    /// it in the ring buffer, flipping into BUFFER_FULL on overflow.
    /// Returns true when the message was stored.
    pub fn buffer_message(&mut self, d1: &[u8], d2: &[u8]) -> bool {
        if !matches!(
            self.state,
            DaemonState::Buffer | DaemonState::SendBuffer | DaemonState::BufferFull
        ) {
            return false;
        }

        if self.state != DaemonState::BufferFull
            && self.ringbuffer.push3(d1, d2, &[]).is_err()
        {
            self.change_state(DaemonState::BufferFull);
        }

        if self.state == DaemonState::BufferFull {
            self.overflow_counter += 1;
            if self.overflow_counter == 1 {
                warn!("ring buffer is full, messages will be discarded");
            }
            return false;
        }
        true
    }

    /// First client attached: drain the backlog first if there is one.
    pub fn on_first_client(&mut self) {
        self.connection_state = true;
        if self.ringbuffer.is_empty() {
            self.change_state(DaemonState::SendDirect);
        } else {
            self.change_state(DaemonState::SendBuffer);
        }
    }

    /// Last client detached. The daemon goes back to buffering unless an
    /// offline trace keeps consuming the stream.
    pub fn on_last_client(&mut self, offline_trace_active: bool) {
        self.connection_state = false;
        if !offline_trace_active {
            self.change_state(DaemonState::Buffer);
        }
    }

    /// One drain step is done; switch to direct send when the buffer ran dry.
    pub fn on_buffer_drained(&mut self) {
        if self.state == DaemonState::SendBuffer && self.ringbuffer.is_empty() {
            self.change_state(DaemonState::SendDirect);
        }
    }

    /// Whether an overflow notification should go out now; rate limited to
    /// one announcement per successful delivery.
    pub fn overflow_needs_announcement(&mut self) -> Option<u32> {
        if self.overflow_counter == 0 || !self.connection_state {
            return None;
        }
        if self.overflow_announcements > 0 {
            return None;
        }
        self.overflow_announcements += 1;
        Some(self.overflow_counter)
    }

    pub fn overflow_announced(&mut self) {
        warn!(
            "{} messages discarded while the buffer was full",
            self.overflow_counter
        );
        self.overflow_counter = 0;
        self.overflow_announcements = 0;
    }

    pub fn overflow_announcement_failed(&mut self) {
        self.overflow_announcements = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn daemon() -> Daemon {
        Daemon::new(
            Id4::new("ECU1"),
            LogLevel::Info,
            TraceStatus::Off,
            false,
            64,
            64,
            64,
        )
    }

    #[test]
    fn buffer_then_drain_transitions() {
        let mut d = daemon();
        d.change_state(DaemonState::Buffer);

        assert!(d.buffer_message(b"msg1", b""));
        assert!(d.buffer_message(b"msg2", b""));
        assert_eq!(d.ringbuffer.message_count(), 2);

        d.on_first_client();
        assert_eq!(d.state, DaemonState::SendBuffer);

        d.ringbuffer.remove();
        d.on_buffer_drained();
        assert_eq!(d.state, DaemonState::SendBuffer);
        d.ringbuffer.remove();
        d.on_buffer_drained();
        assert_eq!(d.state, DaemonState::SendDirect);

        d.on_last_client(false);
        assert_eq!(d.state, DaemonState::Buffer);
        assert!(!d.connection_state);
    }

    #[test]
    fn client_connect_with_empty_buffer_goes_direct() {
        let mut d = daemon();
        d.change_state(DaemonState::Buffer);
        d.on_first_client();
        assert_eq!(d.state, DaemonState::SendDirect);
        assert!(d.connection_state);
    }

    #[test]
    fn overflow_counts_and_announces_once() {
        let mut d = daemon();
        d.change_state(DaemonState::Buffer);

        let big = vec![0u8; 61]; // 61 + 4 overhead > 64
        assert!(!d.buffer_message(&big, b""));
        assert_eq!(d.state, DaemonState::BufferFull);
        assert_eq!(d.overflow_counter, 1);
        assert!(!d.buffer_message(b"x", b""));
        assert_eq!(d.overflow_counter, 2);

        // Not announced while no client is attached.
        assert!(d.overflow_needs_announcement().is_none());
        d.on_first_client();
        assert_eq!(d.overflow_needs_announcement(), Some(2));
        // No duplicate announcement while one is in flight.
        assert!(d.overflow_needs_announcement().is_none());
        d.overflow_announced();
        assert_eq!(d.overflow_counter, 0);
    }

    #[test]
    fn offline_trace_keeps_direct_state() {
        let mut d = daemon();
        d.change_state(DaemonState::Buffer);
        d.on_first_client();
        d.on_last_client(true);
        assert_eq!(d.state, DaemonState::SendDirect);
        assert!(!d.connection_state);
    }
}
