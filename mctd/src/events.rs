//! Event dispatch core.
//!
//! One task owns every piece of mutable daemon state; listener, reader,
//! timer and signal tasks only parse input and forward typed events over a
//! channel. This keeps the registry, the ring buffer, the filter engine and
//! the logstorage devices single-mutator.

use crate::codec::{storage_header, Message, ReadOutcome};
use crate::config::Config;
use crate::connection::{Client, ClientSink, ConnectionKind};
use crate::daemon::{Daemon, DaemonState};
use crate::filter::MessageFilter;
use crate::logstorage::LogStorageManager;
use crate::offline_trace::OfflineTrace;
use crate::protocol::*;
use crate::receiver::Receiver;
use crate::registry::{effective_levels, LinkId, Registry};
use crate::stats::Stats;
use crate::user::{self, UserMessage};
use anyhow::Context as _;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// A write handle to one producer.
#[derive(Debug)]
pub enum ProducerLink {
    Socket(tokio::net::unix::OwnedWriteHalf),
    Fifo(tokio::net::unix::pipe::Sender),
}

impl ProducerLink {
    pub async fn send(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        use tokio::io::AsyncWriteExt;
        let write = async {
            match self {
                ProducerLink::Socket(half) => half.write_all(bytes).await,
                ProducerLink::Fifo(pipe) => pipe.write_all(bytes).await,
            }
        };
        tokio::time::timeout(Duration::from_secs(1), write)
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "producer write"))?
    }
}

#[derive(Debug)]
pub enum Event {
    ProducerConnected { id: LinkId, link: ProducerLink },
    ProducerFrame { id: LinkId, frame: UserMessage },
    ProducerClosed { id: LinkId },
    ClientConnected { id: u64, kind: ConnectionKind, sink: ClientSink, peer: String },
    ControlFrame { id: u64, msg: Box<Message> },
    ClientClosed { id: u64 },
    Tick1s,
    Tick60s,
    Shutdown,
}

pub struct Core {
    pub config: Config,
    pub daemon: Daemon,
    pub registry: Registry,
    pub filter: MessageFilter,
    pub storage: LogStorageManager,
    pub offline_trace: Option<OfflineTrace>,
    pub stats: Arc<Stats>,
    pub clients: HashMap<u64, Client>,
    pub producers: HashMap<LinkId, ProducerLink>,
    tx: mpsc::Sender<Event>,
    tcp_listeners: Vec<JoinHandle<()>>,
    viewer_count: usize,
    /// Clients dropped mid-fan-out; their disconnect follow-ups run after
    /// the current event finishes (keeps the send path non-reentrant).
    dropped_clients: Vec<u64>,
    exiting: bool,
}

impl Core {
    pub fn new(
        config: Config,
        daemon: Daemon,
        registry: Registry,
        filter: MessageFilter,
        storage: LogStorageManager,
        offline_trace: Option<OfflineTrace>,
        stats: Arc<Stats>,
        tx: mpsc::Sender<Event>,
    ) -> Self {
        Core {
            config,
            daemon,
            registry,
            filter,
            storage,
            offline_trace,
            stats,
            clients: HashMap::new(),
            producers: HashMap::new(),
            tx,
            tcp_listeners: Vec::new(),
            viewer_count: 0,
            dropped_clients: Vec::new(),
            exiting: false,
        }
    }

    fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.config.tcp.send_timeout_secs.max(1))
    }

    /* ---------------- listener management ---------------- */

    /// Open the TCP listener on every configured bind address (or the
    /// wildcard address) and start accepting viewers. Failure is fatal:
    /// the daemon cannot serve its purpose without the main socket.
    pub async fn activate_tcp_listener(&mut self) -> anyhow::Result<()> {
        if !self.tcp_listeners.is_empty() {
            return Ok(());
        }
        let port = self.config.tcp.port;
        let mut addresses = self.config.tcp.bind_addresses.clone();
        if addresses.is_empty() {
            addresses.push("0.0.0.0".to_string());
        }
        let sync_serial = self.config.tcp.sync_serial_header;
        for address in addresses {
            let listener = TcpListener::bind((address.as_str(), port))
                .await
                .with_context(|| format!("cannot bind main socket {address}:{port}"))?;
            info!("listening for clients on {address}:{port}");
            let tx = self.tx.clone();
            self.tcp_listeners
                .push(tokio::spawn(accept_tcp(listener, tx, sync_serial)));
        }
        Ok(())
    }

    pub fn deactivate_tcp_listener(&mut self) {
        for handle in self.tcp_listeners.drain(..) {
            handle.abort();
        }
    }

    /// Attach the configured serial viewer device: the daemon fans out to
    /// it and reads control requests back from it, resynchronizing on the
    /// serial header magic when configured. Line discipline setup happens
    /// outside the daemon.
    pub async fn attach_serial_client(&mut self) {
        let Some(device) = self.config.serial.device.clone() else {
            return;
        };
        if !self.filter.is_connection_allowed(ConnectionKind::ClientMsgSerial) {
            info!("serial client denied by filter level");
            return;
        }
        let sync_serial = self.config.serial.sync_serial_header;
        let file = match tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&device)
            .await
        {
            Ok(file) => file,
            Err(err) => {
                warn!("serial device {} not attached: {err}", device.display());
                return;
            }
        };
        let reader = match file.try_clone().await {
            Ok(reader) => reader,
            Err(err) => {
                warn!("serial device {} not attached: {err}", device.display());
                return;
            }
        };
        let id = next_id();
        self.handle_client_connected(
            id,
            ConnectionKind::ClientMsgSerial,
            ClientSink::Serial(file),
            device.display().to_string(),
        )
        .await;
        tokio::spawn(client_reader(id, reader, self.tx.clone(), sync_serial));
    }

    /// Apply the current filter configuration to the main listener.
    pub async fn apply_filter_to_listener(&mut self) -> anyhow::Result<()> {
        if self.filter.is_connection_allowed(ConnectionKind::ClientConnect) {
            self.activate_tcp_listener().await
        } else {
            info!("client connections denied by filter level, closing listener");
            self.deactivate_tcp_listener();
            Ok(())
        }
    }

    /* ---------------- event dispatch ---------------- */

    pub async fn handle_event(&mut self, event: Event) {
        self.dispatch(event).await;
        // Disconnect follow-ups for clients dropped during fan-out.
        while let Some(id) = self.dropped_clients.pop() {
            self.client_disconnect_followup(id).await;
        }
    }

    async fn dispatch(&mut self, event: Event) {
        match event {
            Event::ProducerConnected { id, link } => {
                debug!("producer link {id} connected");
                self.producers.insert(id, link);
            }
            Event::ProducerFrame { id, frame } => self.handle_producer_frame(id, frame).await,
            Event::ProducerClosed { id } => {
                debug!("producer link {id} closed");
                self.producers.remove(&id);
                self.registry.invalidate_handle(self.daemon.ecuid, id);
            }
            Event::ClientConnected { id, kind, sink, peer } => {
                self.handle_client_connected(id, kind, sink, peer).await;
            }
            Event::ControlFrame { id, msg } => {
                self.stats.inc_control_request();
                self.process_control_message(id, msg).await;
            }
            Event::ClientClosed { id } => self.handle_client_closed(id).await,
            Event::Tick1s => self.handle_one_second_tick().await,
            Event::Tick60s => self.handle_sixty_second_tick().await,
            Event::Shutdown => {
                info!("shutting down");
                self.exiting = true;
                self.storage.shutdown();
                self.deactivate_tcp_listener();
            }
        }
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting
    }

    /* ---------------- producers ---------------- */

    async fn handle_producer_frame(&mut self, id: LinkId, frame: UserMessage) {
        let ecu = self.daemon.ecuid;
        match frame {
            UserMessage::RegisterApplication { apid, pid, description } => {
                if apid.is_empty() {
                    warn!("ignoring application registration with empty id");
                    return;
                }
                let (handle, owns) = self.producer_handle_for(id, pid).await;
                let closed = self
                    .registry
                    .application_add(apid, pid, &description, handle, owns, ecu)
                    .map(|(_, closed)| closed)
                    .unwrap_or_default();
                if let Some(old) = closed.0 {
                    self.producers.remove(&old);
                }
                info!("application {apid} registered (pid {pid})");
                self.user_send_log_state(apid).await;
                if self.daemon.allow_block_mode
                    && self.daemon.block_mode != BLOCK_MODE_NON_BLOCKING
                {
                    self.user_update_blockmode(Some(apid), self.daemon.block_mode).await;
                }
            }
            UserMessage::UnregisterApplication { apid, pid } => {
                info!("application {apid} unregistered (pid {pid})");
                let closed = self.registry.application_del(apid, ecu);
                if let Some(old) = closed.0 {
                    self.producers.remove(&old);
                }
            }
            UserMessage::RegisterContext {
                apid,
                ctid,
                log_level_pos,
                log_level,
                trace_status,
                pid,
                description,
            } => {
                if apid.is_empty() || ctid.is_empty() {
                    warn!("ignoring context registration with empty ids");
                    return;
                }
                if self.registry.application_find(apid, ecu).is_none() {
                    // Producers may register contexts before the application
                    // when racing; materialize the owner.
                    let (handle, owns) = self.producer_handle_for(id, pid).await;
                    self.registry.application_add(apid, pid, "", handle, owns, ecu);
                }
                let handle = self
                    .registry
                    .application_find(apid, ecu)
                    .and_then(|a| a.user_handle);
                let storage_level = if self.daemon.maintain_logstorage_loglevel {
                    self.storage
                        .get_loglevel(apid.as_str(), ctid.as_str(), ecu.as_str())
                } else {
                    None
                };
                let added = self
                    .registry
                    .context_add(
                        apid,
                        ctid,
                        log_level,
                        trace_status,
                        log_level_pos,
                        handle,
                        &description,
                        false,
                        ecu,
                    )
                    .is_some();
                if !added {
                    return;
                }
                if let Some(level) = storage_level {
                    if let Some(ctx) = self.registry.context_find_mut(apid, ctid, ecu) {
                        ctx.storage_log_level = level;
                    }
                }
                debug!("context {apid}:{ctid} registered");
                self.user_send_log_level(apid, ctid).await;
            }
            UserMessage::UnregisterContext { apid, ctid, pid } => {
                debug!("context {apid}:{ctid} unregistered (pid {pid})");
                self.registry.context_del(apid, ctid, ecu);
            }
            UserMessage::Overflow { counter, apid } => {
                warn!("producer {apid} reported {counter} lost messages");
            }
            UserMessage::Log(msg) => {
                self.stats.record_message();
                self.route_message(&msg, false).await;
                self.announce_overflow_if_needed().await;
            }
        }
    }

    /// Resolve the producer link for a registration: on socket transports
    /// the shared connection is the handle; on FIFO transports the daemon
    /// opens (and owns) a per-producer reply pipe.
    async fn producer_handle_for(&mut self, id: LinkId, pid: u32) -> (Option<LinkId>, bool) {
        if !self.config.ipc.use_fifo() {
            return (Some(id), false);
        }
        let path = self.config.ipc.producer_pipe_dir().join(format!("mct{pid}"));
        match tokio::net::unix::pipe::OpenOptions::new().open_sender(&path) {
            Ok(pipe) => {
                let link_id = next_id();
                self.producers.insert(link_id, ProducerLink::Fifo(pipe));
                (Some(link_id), true)
            }
            Err(err) => {
                warn!("cannot open reply pipe {}: {err}", path.display());
                (None, false)
            }
        }
    }

    /// Push bytes to a producer; a failed push invalidates the handle.
    pub async fn push_to_producer(&mut self, handle: Option<LinkId>, bytes: &[u8]) -> bool {
        let Some(id) = handle else { return false };
        let Some(link) = self.producers.get_mut(&id) else {
            return false;
        };
        match link.send(bytes).await {
            Ok(()) => true,
            Err(err) => {
                warn!("producer push failed, invalidating handle: {err}");
                self.producers.remove(&id);
                self.registry.invalidate_handle(self.daemon.ecuid, id);
                false
            }
        }
    }

    /// Push the effective levels of one context to its producer.
    pub async fn user_send_log_level(&mut self, apid: Id4, ctid: Id4) -> bool {
        let ecu = self.daemon.ecuid;
        let Some(ctx) = self.registry.context_find(apid, ctid, ecu) else {
            return false;
        };
        let (ll, ts) = effective_levels(
            ctx,
            self.daemon.default_log_level,
            self.daemon.default_trace_status,
            self.daemon.force_ll_ts,
        );
        let bytes = user::encode_log_level(ll as i8 as u8, ts as i8 as u8, ctx.log_level_pos);
        let handle = ctx.user_handle;
        self.push_to_producer(handle, &bytes).await
    }

    /// Push the client-attached state to one application.
    async fn user_send_log_state(&mut self, apid: Id4) -> bool {
        let state = self.daemon.connection_state as u8;
        let handle = self
            .registry
            .application_find(apid, self.daemon.ecuid)
            .and_then(|a| a.user_handle);
        self.push_to_producer(handle, &user::encode_log_state(state)).await
    }

    /// Push the client-attached state to every application.
    pub async fn user_send_all_log_state(&mut self) {
        let apids: Vec<Id4> = self
            .registry
            .find_users_list(self.daemon.ecuid)
            .map(|l| l.applications.iter().map(|a| a.apid).collect())
            .unwrap_or_default();
        for apid in apids {
            self.user_send_log_state(apid).await;
        }
    }

    /// Re-push levels to every context registered with DEFAULT.
    pub async fn user_send_default_update(&mut self) {
        let targets: Vec<(Id4, Id4)> = self
            .registry
            .find_users_list(self.daemon.ecuid)
            .map(|l| {
                l.contexts()
                    .filter(|c| {
                        c.log_level == LogLevel::Default || c.trace_status == TraceStatus::Default
                    })
                    .map(|c| (c.apid, c.ctid))
                    .collect()
            })
            .unwrap_or_default();
        for (apid, ctid) in targets {
            self.user_send_log_level(apid, ctid).await;
        }
    }

    /// Override the log level of every context and push the update.
    pub async fn user_send_all_log_level_update(&mut self, level: LogLevel) {
        let targets: Vec<(Id4, Id4)> = {
            let Some(list) = self.registry.find_users_list_mut(self.daemon.ecuid) else {
                return;
            };
            list.contexts_mut()
                .map(|c| {
                    c.log_level = level;
                    (c.apid, c.ctid)
                })
                .collect()
        };
        for (apid, ctid) in targets {
            self.user_send_log_level(apid, ctid).await;
        }
    }

    pub async fn user_send_all_trace_status_update(&mut self, status: TraceStatus) {
        let targets: Vec<(Id4, Id4)> = {
            let Some(list) = self.registry.find_users_list_mut(self.daemon.ecuid) else {
                return;
            };
            list.contexts_mut()
                .map(|c| {
                    c.trace_status = status;
                    (c.apid, c.ctid)
                })
                .collect()
        };
        for (apid, ctid) in targets {
            self.user_send_log_level(apid, ctid).await;
        }
    }

    /// Push a block mode change to one application or to all of them.
    pub async fn user_update_blockmode(&mut self, apid: Option<Id4>, mode: i32) {
        let targets: Vec<(Id4, Option<LinkId>)> = self
            .registry
            .find_users_list_mut(self.daemon.ecuid)
            .map(|l| {
                l.applications
                    .iter_mut()
                    .filter(|a| apid.is_none() || a.apid == apid.unwrap())
                    .map(|a| {
                        a.block_mode = mode;
                        (a.apid, a.user_handle)
                    })
                    .collect()
            })
            .unwrap_or_default();
        for (_, handle) in targets {
            self.push_to_producer(handle, &user::encode_block_mode(mode)).await;
        }
    }

    /* ---------------- clients ---------------- */

    async fn handle_client_connected(
        &mut self,
        id: u64,
        kind: ConnectionKind,
        sink: ClientSink,
        peer: String,
    ) {
        if matches!(kind, ConnectionKind::ClientMsgTcp | ConnectionKind::ClientMsgSerial)
            && !self.filter.is_connection_allowed(kind)
        {
            info!("client {peer} rejected by filter level");
            return;
        }
        info!("client connected: {peer}");
        self.clients.insert(id, Client { id, kind, sink, peer });

        if matches!(kind, ConnectionKind::ClientMsgTcp | ConnectionKind::ClientMsgSerial) {
            self.viewer_count += 1;
            if self.viewer_count == 1 {
                self.daemon.on_first_client();
                self.user_send_all_log_state().await;
            }
            self.send_connection_info(CONNECTION_STATUS_CONNECTED).await;
            if self.daemon.state == DaemonState::SendBuffer {
                self.drain_ring_buffer().await;
            }
            self.announce_overflow_if_needed().await;
        }
    }

    /// Synchronous half of a client teardown: bookkeeping and state
    /// transitions only. Returns whether the client was a viewer.
    fn drop_client(&mut self, id: u64) -> Option<bool> {
        let client = self.clients.remove(&id)?;
        info!("client disconnected: {}", client.peer);
        let was_viewer = matches!(
            client.kind,
            ConnectionKind::ClientMsgTcp | ConnectionKind::ClientMsgSerial
        );
        if was_viewer {
            self.viewer_count -= 1;
            if self.viewer_count == 0 {
                self.daemon.on_last_client(self.offline_trace.is_some());
            }
        }
        Some(was_viewer)
    }

    /// Asynchronous half of a viewer teardown: producer state pushes and
    /// the connection-info broadcast.
    async fn client_disconnect_followup(&mut self, _id: u64) {
        if self.viewer_count == 0 {
            self.user_send_all_log_state().await;
            if self.daemon.allow_block_mode {
                self.user_update_blockmode(None, BLOCK_MODE_NON_BLOCKING).await;
            }
        }
        self.send_connection_info(CONNECTION_STATUS_DISCONNECTED).await;
    }

    async fn handle_client_closed(&mut self, id: u64) {
        match self.drop_client(id) {
            Some(true) => self.client_disconnect_followup(id).await,
            _ => {}
        }
    }

    pub fn viewer_count(&self) -> usize {
        self.viewer_count
    }

    /* ---------------- message routing ---------------- */

    /// Route one complete message: offline trace, logstorage, then client
    /// fan-out or the ring buffer, per daemon state. `force` is the drain
    /// path: send-or-fail, no persistence, no buffering.
    pub async fn route_message(&mut self, msg: &Message, force: bool) -> bool {
        let ecu = msg.extra.ecu.unwrap_or(self.daemon.ecuid);
        let storage_hdr = storage_header(ecu);
        let mask = self.filter.current().client_mask;
        let mut disable_nw = false;

        if !force && self.daemon.state != DaemonState::SendBuffer {
            if mask & ConnectionKind::OfflineTrace.mask() != 0 {
                if let Some(trace) = self.offline_trace.as_mut() {
                    if let Err(err) =
                        trace.write(&[&storage_hdr, &msg.header_raw, &msg.payload])
                    {
                        warn!("offline trace write failed: {err}");
                    }
                }
            }
            if mask & ConnectionKind::OfflineLogstorage.mask() != 0
                && !self.storage.devices().is_empty()
            {
                disable_nw = self.storage.write_message(msg, ecu, &storage_hdr);
            }
        }

        let mut sent = false;
        let clients_allowed = mask
            & (ConnectionKind::ClientMsgTcp.mask() | ConnectionKind::ClientMsgSerial.mask())
            != 0;
        if clients_allowed
            && (force || self.daemon.state == DaemonState::SendDirect)
            && !disable_nw
        {
            sent = self.fan_out(&msg.header_raw, &msg.payload).await;
            if force {
                return sent;
            }
        }

        if !force {
            self.daemon.buffer_message(&msg.header_raw, &msg.payload);
            if self.daemon.state == DaemonState::BufferFull {
                self.stats.inc_buffer_overflow();
            }
        }
        sent
    }

    /// Send one message to every attached viewer allowed by the filter.
    /// Failed TCP clients are dropped. Returns whether anyone got it.
    async fn fan_out(&mut self, data1: &[u8], data2: &[u8]) -> bool {
        let mask = self.filter.current().client_mask;
        let serial_header = self.daemon.send_serial_header;
        let timeout = self.send_timeout();
        let mut sent = false;
        let mut failed: Vec<u64> = Vec::new();

        for client in self.clients.values_mut() {
            let allowed = match client.kind {
                ConnectionKind::ClientMsgTcp => mask & ConnectionKind::ClientMsgTcp.mask() != 0,
                ConnectionKind::ClientMsgSerial => {
                    mask & ConnectionKind::ClientMsgSerial.mask() != 0
                }
                _ => false,
            };
            if !allowed {
                continue;
            }
            match client.send_multiple(data1, data2, serial_header, timeout).await {
                Ok(()) => sent = true,
                Err(err) => {
                    warn!("send to client {} failed: {err}", client.peer);
                    self.stats.inc_client_send_failure();
                    if client.kind == ConnectionKind::ClientMsgTcp {
                        failed.push(client.id);
                    }
                }
            }
        }
        for id in failed {
            if self.drop_client(id) == Some(true) {
                self.dropped_clients.push(id);
            }
        }
        sent
    }

    /// Deliver buffered messages in FIFO order; a failed send leaves the
    /// message in place for the next round.
    pub async fn drain_ring_buffer(&mut self) {
        loop {
            let Some(record) = self.daemon.ringbuffer.front().map(|r| r.to_vec()) else {
                break;
            };
            if self.fan_out(&record, &[]).await {
                self.daemon.ringbuffer.remove();
            } else {
                break;
            }
        }
        self.daemon.on_buffer_drained();
    }

    /// Direct send to one connection, outside the state machine (control
    /// responses to the requesting socket).
    pub async fn send_to_connection(&mut self, id: u64, data1: &[u8], data2: &[u8]) -> bool {
        let serial_header = self.daemon.send_serial_header;
        let timeout = self.send_timeout();
        let Some(client) = self.clients.get_mut(&id) else {
            return false;
        };
        let result = client.send_multiple(data1, data2, serial_header, timeout).await;
        let kind = client.kind;
        let peer = client.peer.clone();
        match result {
            Ok(()) => true,
            Err(err) => {
                warn!("send to {peer} failed: {err}");
                if kind == ConnectionKind::ClientMsgTcp {
                    self.handle_client_closed(id).await;
                }
                false
            }
        }
    }

    async fn announce_overflow_if_needed(&mut self) {
        let Some(counter) = self.daemon.overflow_needs_announcement() else {
            return;
        };
        if self.send_overflow_notification(counter).await {
            self.daemon.overflow_announced();
        } else {
            self.daemon.overflow_announcement_failed();
        }
    }

    /* ---------------- timers ---------------- */

    async fn handle_one_second_tick(&mut self) {
        self.stats.rollup();
        match self.daemon.state {
            DaemonState::SendBuffer => self.drain_ring_buffer().await,
            DaemonState::BufferFull if self.viewer_count > 0 => {
                self.daemon.change_state(DaemonState::SendBuffer);
                self.drain_ring_buffer().await;
            }
            DaemonState::SendDirect if self.daemon.timing_packets => {
                self.send_timing_packet().await;
            }
            _ => {}
        }
    }

    async fn handle_sixty_second_tick(&mut self) {
        if self.config.daemon.send_ecu_software_version {
            self.send_ecu_version_announcement().await;
        }
        if self.config.daemon.send_timezone {
            self.send_timezone_message().await;
        }
        info!(
            "stats: msgs/s={} overflows={} send_failures={} uptime={}s",
            self.stats.messages_per_sec(),
            self.stats.buffer_overflows(),
            self.stats.client_send_failures(),
            self.stats.uptime_seconds()
        );
    }
}

/* ---------------- listener and reader tasks ---------------- */

async fn accept_tcp(listener: TcpListener, tx: mpsc::Sender<Event>, sync_serial: bool) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let _ = stream.set_nodelay(true);
                let (read, write) = stream.into_split();
                let id = next_id();
                if tx
                    .send(Event::ClientConnected {
                        id,
                        kind: ConnectionKind::ClientMsgTcp,
                        sink: ClientSink::Tcp(write),
                        peer: peer.to_string(),
                    })
                    .await
                    .is_err()
                {
                    return;
                }
                tokio::spawn(client_reader(id, read, tx.clone(), sync_serial));
            }
            Err(err) => {
                warn!("accept failed: {err}");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Read control messages from a viewer, serial or control connection.
/// With `sync_serial` the parser hunts for the serial header magic and
/// garbage between frames is skipped, never fatal.
async fn client_reader<R>(id: u64, mut read: R, tx: mpsc::Sender<Event>, sync_serial: bool)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut receiver = Receiver::default();
    let mut chunk = [0u8; 4096];
    'outer: loop {
        match read.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if !receiver.append(&chunk[..n]) {
                    warn!("connection {id} overflowed its receive buffer");
                    break;
                }
                loop {
                    match Message::parse(receiver.data(), sync_serial) {
                        Ok(ReadOutcome::Message { msg, consumed }) => {
                            receiver.consume(consumed);
                            if tx.send(Event::ControlFrame { id, msg }).await.is_err() {
                                break 'outer;
                            }
                        }
                        Ok(ReadOutcome::NeedMore) => break,
                        Ok(ReadOutcome::Resync { skip }) => {
                            receiver.consume(skip);
                            break;
                        }
                        Err(err) => {
                            warn!("dropping unparsable client data on {id}: {err}");
                            break 'outer;
                        }
                    }
                }
            }
        }
    }
    let _ = tx.send(Event::ClientClosed { id }).await;
}

/// Read user-protocol frames from one producer transport.
async fn producer_reader<R>(id: LinkId, mut read: R, tx: mpsc::Sender<Event>, is_fifo: bool)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut receiver = Receiver::default();
    let mut chunk = [0u8; 8192];
    'outer: loop {
        match read.read(&mut chunk).await {
            Ok(0) => {
                if is_fifo {
                    // All writers closed; the FIFO stays open for the next.
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
                break;
            }
            Err(_) => break,
            Ok(n) => {
                if !receiver.append(&chunk[..n]) {
                    warn!("producer {id} overflowed its receive buffer");
                    break;
                }
                loop {
                    match user::parse_frame(receiver.data()) {
                        Ok(Some((frame, consumed))) => {
                            receiver.consume(consumed);
                            if tx.send(Event::ProducerFrame { id, frame }).await.is_err() {
                                break 'outer;
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            warn!("dropping corrupt producer stream {id}: {err}");
                            if is_fifo {
                                // Resynchronize instead of abandoning the
                                // shared transport.
                                receiver.clear();
                                break;
                            }
                            break 'outer;
                        }
                    }
                }
            }
        }
    }
    let _ = tx.send(Event::ProducerClosed { id }).await;
}

async fn accept_producers(listener: UnixListener, tx: mpsc::Sender<Event>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let (read, write) = stream.into_split();
                let id = next_id();
                if tx
                    .send(Event::ProducerConnected {
                        id,
                        link: ProducerLink::Socket(write),
                    })
                    .await
                    .is_err()
                {
                    return;
                }
                tokio::spawn(producer_reader(id, read, tx.clone(), false));
            }
            Err(err) => {
                warn!("producer accept failed: {err}");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn accept_control(listener: UnixListener, tx: mpsc::Sender<Event>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let (read, write) = stream.into_split();
                let id = next_id();
                if tx
                    .send(Event::ClientConnected {
                        id,
                        kind: ConnectionKind::ControlMsg,
                        sink: ClientSink::Unix(write),
                        peer: "control".to_string(),
                    })
                    .await
                    .is_err()
                {
                    return;
                }
                tokio::spawn(client_reader(id, read, tx.clone(), false));
            }
            Err(err) => {
                warn!("control accept failed: {err}");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Bind the producer IPC endpoint (socket or FIFO) and the control socket,
/// apply the spec permission bits, and start the acceptor/reader tasks.
pub fn bind_ipc(config: &Config, tx: &mpsc::Sender<Event>) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let control_path = config.ipc.control_socket_path.clone();
    if let Some(parent) = control_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let _ = std::fs::remove_file(&control_path);
    let control = UnixListener::bind(&control_path)
        .with_context(|| format!("cannot bind control socket {}", control_path.display()))?;
    std::fs::set_permissions(&control_path, std::fs::Permissions::from_mode(0o660))?;
    tokio::spawn(accept_control(control, tx.clone()));
    info!("control socket at {}", control_path.display());

    if config.ipc.use_fifo() {
        let fifo_dir = config.ipc.fifo_dir.clone();
        std::fs::create_dir_all(&fifo_dir)?;
        std::fs::set_permissions(&fifo_dir, std::fs::Permissions::from_mode(0o3770))?;
        std::fs::create_dir_all(config.ipc.producer_pipe_dir())?;

        let fifo_path = config.ipc.app_fifo_path();
        create_fifo(&fifo_path, config.ipc.fifo_size)?;
        if let Some(group) = &config.ipc.fifo_group {
            match nix::unistd::Group::from_name(group) {
                Ok(Some(g)) => {
                    if let Err(err) = nix::unistd::chown(&fifo_path, None, Some(g.gid)) {
                        warn!("cannot set group '{group}' on daemon FIFO: {err}");
                    }
                }
                _ => warn!("unknown group '{group}' for daemon FIFO"),
            }
        }
        let pipe = tokio::net::unix::pipe::OpenOptions::new()
            .read_write(true)
            .open_receiver(&fifo_path)
            .with_context(|| format!("cannot open daemon FIFO {}", fifo_path.display()))?;
        let id = next_id();
        tokio::spawn(producer_reader(id, pipe, tx.clone(), true));
        info!("producer FIFO at {}", fifo_path.display());
    } else {
        let socket_path = config.ipc.app_socket_path();
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let _ = std::fs::remove_file(&socket_path);
        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("cannot bind app socket {}", socket_path.display()))?;
        std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o666))?;
        tokio::spawn(accept_producers(listener, tx.clone()));
        info!("producer socket at {}", socket_path.display());
    }

    Ok(())
}

fn create_fifo(path: &Path, fifo_size: Option<i32>) -> anyhow::Result<()> {
    use nix::sys::stat::Mode;
    let _ = std::fs::remove_file(path);
    nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IWGRP)
        .with_context(|| format!("cannot create FIFO {}", path.display()))?;
    if let Some(size) = fifo_size {
        let file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
        use std::os::fd::AsRawFd;
        let ret = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETPIPE_SZ, size) };
        if ret < 0 {
            warn!("cannot set FIFO size {size} on {}", path.display());
        }
    }
    Ok(())
}

/// Spawn the periodic timer and signal tasks feeding the core channel.
pub fn spawn_timers(tx: &mpsc::Sender<Event>) {
    let tick_tx = tx.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if tick_tx.send(Event::Tick1s).await.is_err() {
                break;
            }
        }
    });

    let tick_tx = tx.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Skip the immediate first tick.
        interval.tick().await;
        loop {
            interval.tick().await;
            if tick_tx.send(Event::Tick60s).await.is_err() {
                break;
            }
        }
    });

    let signal_tx = tx.clone();
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("signal handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("signal handler");
        let mut sighup = signal(SignalKind::hangup()).expect("signal handler");
        let mut sigquit = signal(SignalKind::quit()).expect("signal handler");
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
            _ = sighup.recv() => {}
            _ = sigquit.recv() => {}
        }
        let _ = signal_tx.send(Event::Shutdown).await;
    });
}

/// The core loop: the only place daemon state is mutated.
pub async fn run(mut core: Core, mut rx: mpsc::Receiver<Event>) -> anyhow::Result<()> {
    core.apply_filter_to_listener().await?;
    while let Some(event) = rx.recv().await {
        core.handle_event(event).await;
        if core.is_exiting() {
            break;
        }
    }
    Ok(())
}

pub fn fatal(err: anyhow::Error) -> ! {
    error!("fatal: {err:#}");
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ExtendedHeader, HeaderExtra};
    use crate::filter::MessageFilter;
    use crate::iniconf::ConfigFile;
    use crate::logstorage::LogStorageManager;
    use crate::registry::Registry;
    use tokio::net::{TcpListener, TcpStream, UnixStream};

    const ECU: Id4 = Id4(*b"ECU1");

    fn test_core(filter: MessageFilter) -> Core {
        let config = Config::default();
        let mut daemon = Daemon::new(
            ECU,
            LogLevel::Info,
            TraceStatus::Off,
            false,
            4096,
            4096,
            4096,
        );
        daemon.change_state(DaemonState::Buffer);
        let registry = Registry::new(ECU);
        let storage = LogStorageManager::new(0, Default::default(), 0);
        let (tx, _rx) = mpsc::channel(64);
        Core::new(
            config,
            daemon,
            registry,
            filter,
            storage,
            None,
            Arc::new(Stats::new()),
            tx,
        )
    }

    async fn attach_producer(core: &mut Core) -> (LinkId, UnixStream) {
        let (daemon_side, producer_side) = UnixStream::pair().unwrap();
        let (_read, write) = daemon_side.into_split();
        let id = next_id();
        core.handle_event(Event::ProducerConnected {
            id,
            link: ProducerLink::Socket(write),
        })
        .await;
        (id, producer_side)
    }

    async fn attach_tcp_client(core: &mut Core) -> TcpStream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let (_read, write) = server.into_split();
        core.handle_event(Event::ClientConnected {
            id: next_id(),
            kind: ConnectionKind::ClientMsgTcp,
            sink: ClientSink::Tcp(write),
            peer: "test-client".into(),
        })
        .await;
        client
    }

    async fn register_context(core: &mut Core, id: LinkId, apid: &str, ctid: &str, pos: i32) {
        core.handle_event(Event::ProducerFrame {
            id,
            frame: UserMessage::RegisterContext {
                apid: Id4::new(apid),
                ctid: Id4::new(ctid),
                log_level_pos: pos,
                log_level: LOG_LEVEL_NOT_SET,
                trace_status: LOG_LEVEL_NOT_SET,
                pid: 42,
                description: "ctx".into(),
            },
        })
        .await;
    }

    fn log_message(payload: &[u8]) -> Message {
        Message::build(
            HTYP_PROTOCOL_VERSION1,
            0,
            HeaderExtra::default(),
            Some(ExtendedHeader {
                msin: make_msin(true, MSTP_LOG, LogLevel::Info as i8 as u8),
                noar: 1,
                apid: Id4::new("APP1"),
                ctid: Id4::new("CTX1"),
            }),
            payload.to_vec(),
        )
        .unwrap()
    }

    fn control_request(payload: Vec<u8>, apid: &str, ctid: &str) -> Box<Message> {
        Box::new(
            Message::build(
                HTYP_PROTOCOL_VERSION1,
                0,
                HeaderExtra::default(),
                Some(ExtendedHeader {
                    msin: make_msin(false, MSTP_CONTROL, MTIN_CONTROL_REQUEST),
                    noar: 1,
                    apid: Id4::new(apid),
                    ctid: Id4::new(ctid),
                }),
                payload,
            )
            .unwrap(),
        )
    }

    /// Read complete messages from the client side until `want` arrived.
    async fn read_client_messages(stream: &mut TcpStream, want: usize) -> Vec<Message> {
        let mut receiver = Receiver::default();
        let mut out = Vec::new();
        let mut chunk = [0u8; 4096];
        while out.len() < want {
            let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut chunk))
                .await
                .expect("timed out waiting for client data")
                .unwrap();
            assert!(n > 0, "peer closed while waiting for messages");
            assert!(receiver.append(&chunk[..n]));
            loop {
                match Message::parse(receiver.data(), false).unwrap() {
                    ReadOutcome::Message { msg, consumed } => {
                        receiver.consume(consumed);
                        out.push(*msg);
                    }
                    ReadOutcome::NeedMore => break,
                    ReadOutcome::Resync { .. } => panic!("unexpected resync on TCP stream"),
                }
            }
        }
        out
    }

    #[tokio::test]
    async fn register_and_propagate_log_level() {
        let mut core = test_core(MessageFilter::disabled());
        let (id, mut producer) = attach_producer(&mut core).await;

        core.handle_event(Event::ProducerFrame {
            id,
            frame: UserMessage::RegisterApplication {
                apid: Id4::new("APP1"),
                pid: 42,
                description: "A".into(),
            },
        })
        .await;
        register_context(&mut core, id, "APP1", "CTX1", 0).await;

        let list = core.registry.find_users_list(ECU).unwrap();
        assert_eq!(list.applications.len(), 1);
        assert_eq!(list.num_contexts(), 1);

        // Registration pushes the connection state first, then the levels.
        let mut state_frame = [0u8; 9];
        producer.read_exact(&mut state_frame).await.unwrap();
        assert_eq!(&state_frame[..4], b"DUH\x01");
        assert_eq!(
            u32::from_le_bytes(state_frame[4..8].try_into().unwrap()),
            crate::user::USER_MSG_LOG_STATE
        );
        assert_eq!(state_frame[8], 0); // no client attached

        let mut level_frame = [0u8; 14];
        producer.read_exact(&mut level_frame).await.unwrap();
        assert_eq!(
            u32::from_le_bytes(level_frame[4..8].try_into().unwrap()),
            crate::user::USER_MSG_LOG_LEVEL
        );
        assert_eq!(level_frame[8] as i8, LogLevel::Info as i8);
        assert_eq!(level_frame[9] as i8, TraceStatus::Off as i8);
    }

    #[tokio::test]
    async fn buffer_then_drain_on_client_connect() {
        let mut core = test_core(MessageFilter::disabled());
        let (id, _producer) = attach_producer(&mut core).await;

        for i in 0..3u8 {
            let msg = log_message(&[b'm', b's', b'g', b'0' + i]);
            core.handle_event(Event::ProducerFrame {
                id,
                frame: UserMessage::Log(Box::new(msg)),
            })
            .await;
        }
        assert_eq!(core.daemon.ringbuffer.message_count(), 3);
        assert_eq!(core.daemon.state, DaemonState::Buffer);

        let mut client = attach_tcp_client(&mut core).await;
        assert_eq!(core.daemon.state, DaemonState::SendDirect);
        assert!(core.daemon.ringbuffer.is_empty());
        assert!(core.daemon.connection_state);

        // The three buffered logs arrive in order, then the broadcast
        // connection-info that was queued behind them.
        let msgs = read_client_messages(&mut client, 4).await;
        assert_eq!(msgs[0].payload, b"msg0");
        assert_eq!(msgs[1].payload, b"msg1");
        assert_eq!(msgs[2].payload, b"msg2");
        assert_eq!(msgs[3].payload_u32(0), Some(SERVICE_ID_CONNECTION_INFO));
    }

    #[tokio::test]
    async fn set_log_level_with_wildcard() {
        let mut core = test_core(MessageFilter::disabled());
        let mut client = attach_tcp_client(&mut core).await;
        let (id, _producer) = attach_producer(&mut core).await;

        core.handle_event(Event::ProducerFrame {
            id,
            frame: UserMessage::RegisterApplication {
                apid: Id4::new("APP1"),
                pid: 42,
                description: String::new(),
            },
        })
        .await;
        core.handle_event(Event::ProducerFrame {
            id,
            frame: UserMessage::RegisterApplication {
                apid: Id4::new("APP2"),
                pid: 43,
                description: String::new(),
            },
        })
        .await;
        register_context(&mut core, id, "APP1", "CTX1", 0).await;
        register_context(&mut core, id, "APP1", "CTX2", 1).await;
        register_context(&mut core, id, "APP2", "CTX1", 0).await;

        let mut payload = SERVICE_ID_SET_LOG_LEVEL.to_le_bytes().to_vec();
        payload.extend_from_slice(b"APP1");
        payload.extend_from_slice(&[0u8; 4]); // empty ctid matches all
        payload.push(LogLevel::Warn as i8 as u8);
        let request = control_request(payload, "XCLI", "XCTX");
        core.handle_event(Event::ControlFrame {
            id: client_id(&core),
            msg: request,
        })
        .await;

        let ctx1 = core.registry.context_find(Id4::new("APP1"), Id4::new("CTX1"), ECU).unwrap();
        let ctx2 = core.registry.context_find(Id4::new("APP1"), Id4::new("CTX2"), ECU).unwrap();
        let other = core.registry.context_find(Id4::new("APP2"), Id4::new("CTX1"), ECU).unwrap();
        assert_eq!(ctx1.log_level, LogLevel::Warn);
        assert_eq!(ctx2.log_level, LogLevel::Warn);
        assert_eq!(other.log_level, LogLevel::Default);

        // Connection info first, then the OK response.
        let msgs = read_client_messages(&mut client, 2).await;
        let response = &msgs[1];
        assert_eq!(response.payload_u32(0), Some(SERVICE_ID_SET_LOG_LEVEL));
        assert_eq!(response.payload[4], RESPONSE_OK);
        assert_eq!(response.apid(), Id4::new("XCLI"));
    }

    fn client_id(core: &Core) -> u64 {
        *core.clients.keys().next().unwrap()
    }

    #[tokio::test]
    async fn serial_reader_resyncs_and_delivers_control_frames() {
        use tokio::io::AsyncWriteExt as _;

        let (daemon_side, mut peer) = UnixStream::pair().unwrap();
        let (read, _write) = daemon_side.into_split();
        let (tx, mut rx) = mpsc::channel(16);
        let id = next_id();
        tokio::spawn(client_reader(id, read, tx, true));

        let request = control_request(
            SERVICE_ID_GET_SOFTWARE_VERSION.to_le_bytes().to_vec(),
            "XCLI",
            "XCTX",
        );

        // Garbage, then a fragmented serial header, then the frame.
        peer.write_all(&[0x5a, 0x5a, 0x5a]).await.unwrap();
        peer.write_all(&SERIAL_HEADER[..2]).await.unwrap();
        peer.write_all(&SERIAL_HEADER[2..]).await.unwrap();
        peer.write_all(&request.header_raw).await.unwrap();
        peer.write_all(&request.payload).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for the serial control frame")
            .unwrap();
        match event {
            Event::ControlFrame { id: from, msg } => {
                assert_eq!(from, id);
                assert_eq!(msg.payload_u32(0), Some(SERVICE_ID_GET_SOFTWARE_VERSION));
            }
            other => panic!("unexpected event {other:?}"),
        }

        // The garbage must not have torn the connection down: a second,
        // cleanly framed request still arrives.
        peer.write_all(&SERIAL_HEADER).await.unwrap();
        peer.write_all(&request.header_raw).await.unwrap();
        peer.write_all(&request.payload).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for the second frame")
            .unwrap();
        assert!(matches!(event, Event::ControlFrame { .. }));
    }

    #[tokio::test]
    async fn filter_gated_injection() {
        const FILTER_TEXT: &str = "\
[General]
DefaultLevel = 10
[Filter1]
Name = Locked
Level = 100
Clients = TCP
ControlMessages = *
Injections = DemoInjection
[Injection1]
Name = DemoInjection
LogAppName = APP1
ContextName = CTX1
NodeID = ECU1
ServiceID = 4096
";
        let filter = MessageFilter::from_config(&ConfigFile::parse(FILTER_TEXT)).unwrap();
        let mut core = test_core(filter);
        let mut client = attach_tcp_client(&mut core).await;
        let (id, mut producer) = attach_producer(&mut core).await;

        core.handle_event(Event::ProducerFrame {
            id,
            frame: UserMessage::RegisterApplication {
                apid: Id4::new("APP1"),
                pid: 42,
                description: String::new(),
            },
        })
        .await;
        register_context(&mut core, id, "APP1", "CTX1", 7).await;

        // Drain the registration pushes (log state + log level).
        let mut drained = [0u8; 9 + 14];
        producer.read_exact(&mut drained).await.unwrap();

        // Allowed injection is forwarded to the producer.
        let mut payload = 4096u32.to_le_bytes().to_vec();
        payload.extend_from_slice(&4u32.to_le_bytes());
        payload.extend_from_slice(b"data");
        let request = control_request(payload, "APP1", "CTX1");
        core.handle_event(Event::ControlFrame { id: client_id(&core), msg: request }).await;

        let mut frame = [0u8; 8 + 12 + 4];
        producer.read_exact(&mut frame).await.unwrap();
        assert_eq!(
            u32::from_le_bytes(frame[4..8].try_into().unwrap()),
            crate::user::USER_MSG_INJECTION
        );
        assert_eq!(i32::from_le_bytes(frame[8..12].try_into().unwrap()), 7);
        assert_eq!(u32::from_le_bytes(frame[12..16].try_into().unwrap()), 4096);
        assert_eq!(&frame[20..24], b"data");

        // A service id outside the whitelist is denied.
        let mut payload = 4097u32.to_le_bytes().to_vec();
        payload.extend_from_slice(&0u32.to_le_bytes());
        let request = control_request(payload, "APP1", "CTX1");
        core.handle_event(Event::ControlFrame { id: client_id(&core), msg: request }).await;

        let msgs = read_client_messages(&mut client, 2).await;
        let denied = msgs
            .iter()
            .find(|m| m.payload_u32(0) == Some(4097))
            .expect("expected a response for the denied injection");
        assert_eq!(denied.payload[4], RESPONSE_PERM_DENIED);
    }
}
