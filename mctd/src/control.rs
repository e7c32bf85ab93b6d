//! Control message handling.
//!
//! Requests arrive from viewer or control-socket connections, are gated by
//! the filter engine, dispatched by service id, and answered with control
//! responses on the requesting connection (broadcasts go through the normal
//! routing path and may end up buffered).

use crate::codec::{ExtendedHeader, HeaderExtra, Message};
use crate::events::Core;
use crate::logstorage::{split_key, StorageError};
use crate::protocol::*;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Instant;

/// Timestamps on daemon-originated messages are uptime in 0.1 ms units.
fn uptime_tmsp() -> u32 {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    (start.elapsed().as_micros() / 100) as u32
}

/// Does `id` match a control request pattern? Empty matches everything, a
/// trailing `*` matches by prefix, anything else is a 4-byte exact match.
fn pattern_matches(pattern: Id4, id: Id4) -> bool {
    if pattern.is_empty() {
        return true;
    }
    let pat = pattern.as_str();
    match pat.strip_suffix('*') {
        Some(prefix) => id.as_str().starts_with(prefix),
        None => pattern == id,
    }
}

impl Core {
    /// Build a control response message carrying `payload`.
    pub fn build_control_message(
        &mut self,
        mtin: u8,
        apid: Id4,
        ctid: Id4,
        payload: Vec<u8>,
    ) -> Option<Message> {
        let apid = if apid.is_empty() { Id4::new(DAEMON_CTRL_APID) } else { apid };
        let ctid = if ctid.is_empty() { Id4::new(DAEMON_CTRL_CTID) } else { ctid };
        let extended = ExtendedHeader {
            msin: make_msin(false, MSTP_CONTROL, mtin),
            noar: 1,
            apid,
            ctid,
        };
        let extra = HeaderExtra {
            ecu: Some(self.daemon.ecuid),
            seid: None,
            tmsp: Some(uptime_tmsp()),
        };
        match Message::build(
            HTYP_PROTOCOL_VERSION1,
            self.daemon.next_message_counter(),
            extra,
            Some(extended),
            payload,
        ) {
            Ok(msg) => Some(msg),
            Err(err) => {
                warn!("discarding oversized control message: {err}");
                None
            }
        }
    }

    /// Minimal `{service_id, status}` response to the requesting socket.
    async fn respond_status(&mut self, to: u64, request: &Message, service_id: u32, status: u8) {
        let mut payload = service_id.to_le_bytes().to_vec();
        payload.push(status);
        self.respond_payload(to, request, payload).await;
    }

    async fn respond_payload(&mut self, to: u64, request: &Message, payload: Vec<u8>) {
        let (apid, ctid) = (request.apid(), request.ctid());
        if let Some(msg) = self.build_control_message(MTIN_CONTROL_RESPONSE, apid, ctid, payload) {
            self.send_to_connection(to, &msg.header_raw, &msg.payload).await;
        }
    }

    /// Broadcast a daemon indication to all clients through the normal
    /// routing path (buffered when nobody listens).
    async fn broadcast_control(&mut self, payload: Vec<u8>) {
        if let Some(msg) =
            self.build_control_message(MTIN_CONTROL_RESPONSE, Id4::default(), Id4::default(), payload)
        {
            self.route_message(&msg, false).await;
        }
    }

    pub async fn send_connection_info(&mut self, state: u8) {
        let mut payload = SERVICE_ID_CONNECTION_INFO.to_le_bytes().to_vec();
        payload.push(RESPONSE_OK);
        payload.push(state);
        payload.extend_from_slice(&[0u8; ID_SIZE]);
        self.broadcast_control(payload).await;
    }

    pub async fn send_timezone_message(&mut self) {
        let offset = chrono::Local::now().offset().local_minus_utc();
        let mut payload = SERVICE_ID_TIMEZONE.to_le_bytes().to_vec();
        payload.push(RESPONSE_OK);
        payload.extend_from_slice(&offset.to_le_bytes());
        payload.push(0); // daylight saving flag not tracked
        self.broadcast_control(payload).await;
    }

    pub async fn send_ecu_version_announcement(&mut self) {
        let version = self
            .daemon
            .ecu_version
            .clone()
            .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());
        let mut payload = SERVICE_ID_GET_SOFTWARE_VERSION.to_le_bytes().to_vec();
        payload.push(RESPONSE_OK);
        payload.extend_from_slice(&(version.len() as u32).to_le_bytes());
        payload.extend_from_slice(version.as_bytes());
        self.broadcast_control(payload).await;
    }

    /// One-per-second time message while clients are attached.
    pub async fn send_timing_packet(&mut self) {
        if let Some(msg) =
            self.build_control_message(MTIN_CONTROL_TIME, Id4::default(), Id4::default(), Vec::new())
        {
            self.route_message(&msg, true).await;
        }
    }

    /// Overflow report; send-or-fail so the caller can retry later.
    pub async fn send_overflow_notification(&mut self, counter: u32) -> bool {
        let mut payload = SERVICE_ID_MESSAGE_BUFFER_OVERFLOW.to_le_bytes().to_vec();
        payload.push(RESPONSE_OK);
        payload.push(1); // overflow occurred
        payload.extend_from_slice(&counter.to_le_bytes());
        match self.build_control_message(MTIN_CONTROL_RESPONSE, Id4::default(), Id4::default(), payload)
        {
            Some(msg) => self.route_message(&msg, true).await,
            None => false,
        }
    }

    /* ---------------- request dispatch ---------------- */

    pub async fn process_control_message(&mut self, from: u64, msg: Box<Message>) {
        let Some(service_id) = msg.payload_u32(0) else {
            warn!("control message without service id");
            return;
        };

        if is_injection_id(service_id) {
            self.process_injection(from, &msg, service_id).await;
            return;
        }

        if !is_control_id(service_id) {
            self.respond_status(from, &msg, service_id, RESPONSE_NOT_SUPPORTED).await;
            return;
        }

        // A control-socket peer must always be able to steer the filter
        // level when no backend owns it, or it could lock itself out.
        let from_control_socket = self
            .clients
            .get(&from)
            .map(|c| c.kind == crate::connection::ConnectionKind::ControlMsg)
            .unwrap_or(false);
        let lockout_exempt = from_control_socket
            && self.filter.backend.is_none()
            && matches!(
                service_id,
                SERVICE_ID_SET_FILTER_LEVEL | SERVICE_ID_GET_FILTER_STATUS
            );

        if !lockout_exempt && !self.filter.is_control_allowed(service_id) {
            self.respond_status(from, &msg, service_id, RESPONSE_PERM_DENIED).await;
            return;
        }

        match service_id {
            SERVICE_ID_SET_LOG_LEVEL => self.on_set_log_level(from, &msg).await,
            SERVICE_ID_SET_TRACE_STATUS => self.on_set_trace_status(from, &msg).await,
            SERVICE_ID_GET_LOG_INFO => self.on_get_log_info(from, &msg).await,
            SERVICE_ID_GET_DEFAULT_LOG_LEVEL => {
                let mut payload = service_id.to_le_bytes().to_vec();
                payload.push(RESPONSE_OK);
                payload.push(self.daemon.default_log_level as i8 as u8);
                self.respond_payload(from, &msg, payload).await;
            }
            SERVICE_ID_SET_DEFAULT_LOG_LEVEL => self.on_set_default_log_level(from, &msg).await,
            SERVICE_ID_SET_DEFAULT_TRACE_STATUS => {
                self.on_set_default_trace_status(from, &msg).await;
            }
            SERVICE_ID_SET_ALL_LOG_LEVEL => self.on_set_all_log_level(from, &msg).await,
            SERVICE_ID_SET_ALL_TRACE_STATUS => self.on_set_all_trace_status(from, &msg).await,
            SERVICE_ID_SET_TIMING_PACKETS => {
                let on = msg.payload.get(4).copied().unwrap_or(0) != 0;
                self.daemon.timing_packets = on;
                info!("timing packets {}", if on { "enabled" } else { "disabled" });
                self.respond_status(from, &msg, service_id, RESPONSE_OK).await;
            }
            SERVICE_ID_GET_LOCAL_TIME => {
                // The response timestamp itself carries the local time.
                self.respond_status(from, &msg, service_id, RESPONSE_OK).await;
            }
            SERVICE_ID_STORE_CONFIG => self.on_store_config(from, &msg).await,
            SERVICE_ID_RESET_TO_FACTORY_DEFAULT => self.on_factory_reset(from, &msg).await,
            SERVICE_ID_GET_SOFTWARE_VERSION => {
                let version = self
                    .daemon
                    .ecu_version
                    .clone()
                    .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());
                let mut payload = service_id.to_le_bytes().to_vec();
                payload.push(RESPONSE_OK);
                payload.extend_from_slice(&(version.len() as u32).to_le_bytes());
                payload.extend_from_slice(version.as_bytes());
                self.respond_payload(from, &msg, payload).await;
            }
            SERVICE_ID_MESSAGE_BUFFER_OVERFLOW => {
                let counter = self.daemon.overflow_counter;
                let mut payload = service_id.to_le_bytes().to_vec();
                payload.push(RESPONSE_OK);
                payload.push((counter > 0) as u8);
                payload.extend_from_slice(&counter.to_le_bytes());
                self.respond_payload(from, &msg, payload).await;
            }
            SERVICE_ID_OFFLINE_LOGSTORAGE => self.on_offline_logstorage(from, &msg).await,
            SERVICE_ID_SET_FILTER_LEVEL => self.on_set_filter_level(from, &msg).await,
            SERVICE_ID_GET_FILTER_STATUS => self.on_get_filter_status(from, &msg).await,
            SERVICE_ID_SET_BLOCK_MODE => self.on_set_block_mode(from, &msg).await,
            SERVICE_ID_GET_BLOCK_MODE => {
                if self.daemon.allow_block_mode {
                    let mut payload = service_id.to_le_bytes().to_vec();
                    payload.push(RESPONSE_OK);
                    payload.extend_from_slice(&self.daemon.block_mode.to_le_bytes());
                    self.respond_payload(from, &msg, payload).await;
                } else {
                    self.respond_status(from, &msg, service_id, RESPONSE_NOT_SUPPORTED).await;
                }
            }
            other => {
                self.respond_status(from, &msg, other, RESPONSE_NOT_SUPPORTED).await;
            }
        }
    }

    /* ---------------- log level services ---------------- */

    async fn on_set_log_level(&mut self, from: u64, msg: &Message) {
        let Some(raw) = msg.payload.get(4..13) else {
            self.respond_status(from, msg, SERVICE_ID_SET_LOG_LEVEL, RESPONSE_ERROR).await;
            return;
        };
        let apid_pat = Id4::from_bytes(&raw[0..4]);
        let ctid_pat = Id4::from_bytes(&raw[4..8]);
        let Some(level) = LogLevel::from_i8(raw[8] as i8) else {
            self.respond_status(from, msg, SERVICE_ID_SET_LOG_LEVEL, RESPONSE_ERROR).await;
            return;
        };

        let targets = self.matching_contexts(apid_pat, ctid_pat);
        if targets.is_empty() {
            self.respond_status(from, msg, SERVICE_ID_SET_LOG_LEVEL, RESPONSE_ERROR).await;
            return;
        }
        for (apid, ctid) in targets {
            if let Some(ctx) = self.registry.context_find_mut(apid, ctid, self.daemon.ecuid) {
                ctx.log_level = level;
            }
            self.user_send_log_level(apid, ctid).await;
        }
        self.respond_status(from, msg, SERVICE_ID_SET_LOG_LEVEL, RESPONSE_OK).await;
    }

    async fn on_set_trace_status(&mut self, from: u64, msg: &Message) {
        let Some(raw) = msg.payload.get(4..13) else {
            self.respond_status(from, msg, SERVICE_ID_SET_TRACE_STATUS, RESPONSE_ERROR).await;
            return;
        };
        let apid_pat = Id4::from_bytes(&raw[0..4]);
        let ctid_pat = Id4::from_bytes(&raw[4..8]);
        let Some(status) = TraceStatus::from_i8(raw[8] as i8) else {
            self.respond_status(from, msg, SERVICE_ID_SET_TRACE_STATUS, RESPONSE_ERROR).await;
            return;
        };

        let targets = self.matching_contexts(apid_pat, ctid_pat);
        if targets.is_empty() {
            self.respond_status(from, msg, SERVICE_ID_SET_TRACE_STATUS, RESPONSE_ERROR).await;
            return;
        }
        for (apid, ctid) in targets {
            if let Some(ctx) = self.registry.context_find_mut(apid, ctid, self.daemon.ecuid) {
                ctx.trace_status = status;
            }
            self.user_send_log_level(apid, ctid).await;
        }
        self.respond_status(from, msg, SERVICE_ID_SET_TRACE_STATUS, RESPONSE_OK).await;
    }

    fn matching_contexts(&self, apid_pat: Id4, ctid_pat: Id4) -> Vec<(Id4, Id4)> {
        self.registry
            .find_users_list(self.daemon.ecuid)
            .map(|list| {
                list.contexts()
                    .filter(|c| pattern_matches(apid_pat, c.apid) && pattern_matches(ctid_pat, c.ctid))
                    .map(|c| (c.apid, c.ctid))
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn on_set_default_log_level(&mut self, from: u64, msg: &Message) {
        let Some(level) = msg.payload.get(4).and_then(|b| LogLevel::from_i8(*b as i8)) else {
            self.respond_status(from, msg, SERVICE_ID_SET_DEFAULT_LOG_LEVEL, RESPONSE_ERROR).await;
            return;
        };
        if level == LogLevel::Default {
            self.respond_status(from, msg, SERVICE_ID_SET_DEFAULT_LOG_LEVEL, RESPONSE_ERROR).await;
            return;
        }
        self.daemon.default_log_level = level;
        info!("default log level set to {level:?}");
        self.user_send_default_update().await;
        self.respond_status(from, msg, SERVICE_ID_SET_DEFAULT_LOG_LEVEL, RESPONSE_OK).await;
    }

    async fn on_set_default_trace_status(&mut self, from: u64, msg: &Message) {
        let Some(status) = msg.payload.get(4).and_then(|b| TraceStatus::from_i8(*b as i8)) else {
            self.respond_status(from, msg, SERVICE_ID_SET_DEFAULT_TRACE_STATUS, RESPONSE_ERROR)
                .await;
            return;
        };
        if status == TraceStatus::Default {
            self.respond_status(from, msg, SERVICE_ID_SET_DEFAULT_TRACE_STATUS, RESPONSE_ERROR)
                .await;
            return;
        }
        self.daemon.default_trace_status = status;
        self.user_send_default_update().await;
        self.respond_status(from, msg, SERVICE_ID_SET_DEFAULT_TRACE_STATUS, RESPONSE_OK).await;
    }

    async fn on_set_all_log_level(&mut self, from: u64, msg: &Message) {
        let Some(level) = msg.payload.get(4).and_then(|b| LogLevel::from_i8(*b as i8)) else {
            self.respond_status(from, msg, SERVICE_ID_SET_ALL_LOG_LEVEL, RESPONSE_ERROR).await;
            return;
        };
        self.user_send_all_log_level_update(level).await;
        self.respond_status(from, msg, SERVICE_ID_SET_ALL_LOG_LEVEL, RESPONSE_OK).await;
    }

    async fn on_set_all_trace_status(&mut self, from: u64, msg: &Message) {
        let Some(status) = msg.payload.get(4).and_then(|b| TraceStatus::from_i8(*b as i8)) else {
            self.respond_status(from, msg, SERVICE_ID_SET_ALL_TRACE_STATUS, RESPONSE_ERROR).await;
            return;
        };
        self.user_send_all_trace_status_update(status).await;
        self.respond_status(from, msg, SERVICE_ID_SET_ALL_TRACE_STATUS, RESPONSE_OK).await;
    }

    /* ---------------- log info ---------------- */

    async fn on_get_log_info(&mut self, from: u64, msg: &Message) {
        let (Some(&options), Some(apid_raw), Some(ctid_raw)) = (
            msg.payload.get(4),
            msg.payload.get(5..9),
            msg.payload.get(9..13),
        ) else {
            self.respond_status(from, msg, SERVICE_ID_GET_LOG_INFO, RESPONSE_ERROR).await;
            return;
        };
        if !(3..=7).contains(&options) {
            self.respond_status(from, msg, SERVICE_ID_GET_LOG_INFO, RESPONSE_ERROR).await;
            return;
        }
        let apid_pat = Id4::from_bytes(apid_raw);
        let ctid_pat = Id4::from_bytes(ctid_raw);

        let payload = self.encode_log_info(options, apid_pat, ctid_pat);
        self.respond_payload(from, msg, payload).await;
    }

    /// Encode the GET_LOG_INFO response tree. With no matching context the
    /// status byte is the no-match sentinel and the body is empty.
    fn encode_log_info(&self, options: u8, apid_pat: Id4, ctid_pat: Id4) -> Vec<u8> {
        let with_ll = matches!(options, 4 | 6 | 7);
        let with_ts = matches!(options, 5 | 6 | 7);
        let with_desc = options == 7;

        let mut apps: Vec<(Id4, String, Vec<(Id4, i8, i8, String)>)> = Vec::new();
        if let Some(list) = self.registry.find_users_list(self.daemon.ecuid) {
            for app in &list.applications {
                if !pattern_matches(apid_pat, app.apid) {
                    continue;
                }
                let contexts: Vec<(Id4, i8, i8, String)> = app
                    .contexts
                    .iter()
                    .filter(|c| pattern_matches(ctid_pat, c.ctid))
                    .map(|c| {
                        (
                            c.ctid,
                            c.log_level as i8,
                            c.trace_status as i8,
                            c.description.clone(),
                        )
                    })
                    .collect();
                if !contexts.is_empty() {
                    apps.push((app.apid, app.description.clone(), contexts));
                }
            }
        }

        let mut payload = SERVICE_ID_GET_LOG_INFO.to_le_bytes().to_vec();
        if apps.is_empty() {
            payload.push(RESPONSE_NO_MATCHING_CONTEXT);
            payload.extend_from_slice(&GET_LOG_INFO_TRAILER);
            return payload;
        }

        payload.push(options);
        payload.extend_from_slice(&(apps.len() as u16).to_le_bytes());
        for (apid, app_desc, contexts) in &apps {
            payload.extend_from_slice(&apid.0);
            payload.extend_from_slice(&(contexts.len() as u16).to_le_bytes());
            for (ctid, ll, ts, desc) in contexts {
                payload.extend_from_slice(&ctid.0);
                if with_ll {
                    payload.push(*ll as u8);
                }
                if with_ts {
                    payload.push(*ts as u8);
                }
                if with_desc {
                    payload.extend_from_slice(&(desc.len() as u16).to_le_bytes());
                    payload.extend_from_slice(desc.as_bytes());
                }
            }
            if with_desc {
                payload.extend_from_slice(&(app_desc.len() as u16).to_le_bytes());
                payload.extend_from_slice(app_desc.as_bytes());
            }
        }
        payload.extend_from_slice(&GET_LOG_INFO_TRAILER);
        payload
    }

    /* ---------------- persistence ---------------- */

    async fn on_store_config(&mut self, from: u64, msg: &Message) {
        let status = match self.store_runtime_configuration() {
            Ok(()) => RESPONSE_OK,
            Err(err) => {
                warn!("storing configuration failed, resetting to factory: {err}");
                self.delete_runtime_configuration();
                RESPONSE_ERROR
            }
        };
        self.respond_status(from, msg, SERVICE_ID_STORE_CONFIG, status).await;
    }

    fn store_runtime_configuration(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.config.daemon.persistence_path)?;
        let ecu = self.daemon.ecuid;
        self.registry
            .applications_save(&self.config.application_cfg_path(), ecu)?;
        self.registry.contexts_save(&self.config.context_cfg_path(), ecu)?;
        let runtime = format!(
            "ECUId={}\nDefaultLogLevel={}\nDefaultTraceStatus={}\n",
            ecu,
            self.daemon.default_log_level as i8,
            self.daemon.default_trace_status as i8
        );
        std::fs::write(self.config.runtime_cfg_path(), runtime)
    }

    fn delete_runtime_configuration(&self) {
        for path in [
            self.config.application_cfg_path(),
            self.config.context_cfg_path(),
            self.config.runtime_cfg_path(),
        ] {
            let _ = std::fs::remove_file(path);
        }
    }

    async fn on_factory_reset(&mut self, from: u64, msg: &Message) {
        self.delete_runtime_configuration();
        self.daemon.default_log_level = LogLevel::from_i8(self.config.defaults.context_log_level)
            .unwrap_or(LogLevel::Info);
        self.daemon.default_trace_status =
            TraceStatus::from_i8(self.config.defaults.context_trace_status)
                .unwrap_or(TraceStatus::Off);
        self.daemon.force_ll_ts = self.config.defaults.force_context_ll_and_ts;
        self.user_send_default_update().await;
        self.respond_status(from, msg, SERVICE_ID_RESET_TO_FACTORY_DEFAULT, RESPONSE_OK).await;
    }

    /* ---------------- block mode ---------------- */

    async fn on_set_block_mode(&mut self, from: u64, msg: &Message) {
        if !self.daemon.allow_block_mode {
            self.respond_status(from, msg, SERVICE_ID_SET_BLOCK_MODE, RESPONSE_NOT_SUPPORTED)
                .await;
            return;
        }
        let Some(raw) = msg.payload.get(4..8) else {
            self.respond_status(from, msg, SERVICE_ID_SET_BLOCK_MODE, RESPONSE_ERROR).await;
            return;
        };
        let mode = i32::from_le_bytes(raw.try_into().unwrap());
        if mode != BLOCK_MODE_NON_BLOCKING && mode != BLOCK_MODE_BLOCKING {
            self.respond_status(from, msg, SERVICE_ID_SET_BLOCK_MODE, RESPONSE_ERROR).await;
            return;
        }
        self.daemon.block_mode = mode;
        self.user_update_blockmode(None, mode).await;
        self.respond_status(from, msg, SERVICE_ID_SET_BLOCK_MODE, RESPONSE_OK).await;
    }

    /* ---------------- filter level ---------------- */

    async fn on_set_filter_level(&mut self, from: u64, msg: &Message) {
        if !self.filter.is_enabled() {
            self.respond_status(from, msg, SERVICE_ID_SET_FILTER_LEVEL, RESPONSE_NOT_SUPPORTED)
                .await;
            return;
        }
        let Some(level) = msg.payload_u32(4) else {
            self.respond_status(from, msg, SERVICE_ID_SET_FILTER_LEVEL, RESPONSE_ERROR).await;
            return;
        };
        match self.filter.change_filter_level(level) {
            Ok(_) => {
                if let Err(err) = self.apply_filter_to_listener().await {
                    // The daemon cannot run without its main socket.
                    crate::events::fatal(err);
                }
                self.respond_status(from, msg, SERVICE_ID_SET_FILTER_LEVEL, RESPONSE_OK).await;
            }
            Err(err) => {
                warn!("filter level change rejected: {err}");
                self.respond_status(from, msg, SERVICE_ID_SET_FILTER_LEVEL, RESPONSE_ERROR).await;
            }
        }
    }

    async fn on_get_filter_status(&mut self, from: u64, msg: &Message) {
        if !self.filter.is_enabled() {
            self.respond_status(from, msg, SERVICE_ID_GET_FILTER_STATUS, RESPONSE_NOT_SUPPORTED)
                .await;
            return;
        }
        let current = self.filter.current();
        let mut payload = SERVICE_ID_GET_FILTER_STATUS.to_le_bytes().to_vec();
        payload.push(RESPONSE_OK);
        payload.push(current.name.len().min(255) as u8);
        payload.extend_from_slice(&current.name.as_bytes()[..current.name.len().min(255)]);
        payload.extend_from_slice(&current.level_min.to_le_bytes());
        payload.extend_from_slice(&current.level_max.to_le_bytes());
        payload.extend_from_slice(&current.client_mask.to_le_bytes());
        let (lower, upper) = current.ctrl_mask.as_bytes();
        payload.extend_from_slice(&lower);
        payload.extend_from_slice(&upper);
        let injections: Vec<String> = match &current.injections {
            crate::filter::Injections::All => vec!["*".to_string()],
            crate::filter::Injections::None => Vec::new(),
            crate::filter::Injections::Named(names) => names.clone(),
        };
        let num: i32 = match &current.injections {
            crate::filter::Injections::All => -1,
            crate::filter::Injections::None => 0,
            crate::filter::Injections::Named(names) => names.len() as i32,
        };
        payload.extend_from_slice(&num.to_le_bytes());
        for name in injections {
            payload.push(name.len().min(255) as u8);
            payload.extend_from_slice(&name.as_bytes()[..name.len().min(255)]);
        }
        self.respond_payload(from, msg, payload).await;
    }

    /* ---------------- injections ---------------- */

    async fn process_injection(&mut self, from: u64, msg: &Message, service_id: u32) {
        if !self.config.injection.mode {
            self.respond_status(from, msg, service_id, RESPONSE_PERM_DENIED).await;
            return;
        }
        let (apid, ctid) = (msg.apid(), msg.ctid());
        if apid.is_empty() || ctid.is_empty() {
            self.respond_status(from, msg, service_id, RESPONSE_ERROR).await;
            return;
        }
        if !self
            .filter
            .is_injection_allowed(apid, ctid, self.daemon.ecuid, service_id)
        {
            self.respond_status(from, msg, service_id, RESPONSE_PERM_DENIED).await;
            return;
        }

        let Some(ctx) = self.registry.context_find(apid, ctid, self.daemon.ecuid) else {
            self.respond_status(from, msg, service_id, RESPONSE_ERROR).await;
            return;
        };
        let handle = ctx.user_handle;
        let log_level_pos = ctx.log_level_pos;

        // Payload after the service id: declared length, then the data.
        let data = match msg.payload.get(4..8) {
            Some(raw) => {
                let len = u32::from_le_bytes(raw.try_into().unwrap()) as usize;
                match msg.payload.get(8..8 + len) {
                    Some(data) => data.to_vec(),
                    None => {
                        self.respond_status(from, msg, service_id, RESPONSE_ERROR).await;
                        return;
                    }
                }
            }
            None => Vec::new(),
        };

        let frame = crate::user::encode_injection(log_level_pos, service_id, &data);
        if !self.push_to_producer(handle, &frame).await {
            self.respond_status(from, msg, service_id, RESPONSE_ERROR).await;
        }
    }

    /* ---------------- offline logstorage ---------------- */

    async fn on_offline_logstorage(&mut self, from: u64, msg: &Message) {
        let Some(&op) = msg.payload.get(4) else {
            self.respond_status(from, msg, SERVICE_ID_OFFLINE_LOGSTORAGE, RESPONSE_ERROR).await;
            return;
        };
        let path_raw = msg.payload.get(5..).unwrap_or(&[]);
        let end = path_raw.iter().position(|b| *b == 0).unwrap_or(path_raw.len());
        let mount = PathBuf::from(String::from_utf8_lossy(&path_raw[..end]).into_owned());
        if mount.as_os_str().is_empty() {
            self.respond_status(from, msg, SERVICE_ID_OFFLINE_LOGSTORAGE, RESPONSE_ERROR).await;
            return;
        }

        let status = match op {
            1 => self.logstorage_connect_device(&mount).await,
            0 => self.logstorage_disconnect_device(&mount).await,
            2 => match self.storage.sync_device_caches(&mount) {
                Ok(()) => RESPONSE_OK,
                Err(err) => {
                    warn!("{err}");
                    RESPONSE_ERROR
                }
            },
            _ => RESPONSE_ERROR,
        };
        self.respond_status(from, msg, SERVICE_ID_OFFLINE_LOGSTORAGE, status).await;
    }

    pub async fn logstorage_connect_device(&mut self, mount: &std::path::Path) -> u8 {
        let (maintain, block_mode) = match self.storage.device_connected(mount) {
            Ok(device) => (
                device
                    .maintain_loglevel
                    .unwrap_or(self.daemon.maintain_logstorage_loglevel),
                device.block_mode,
            ),
            Err(err) => {
                warn!("logstorage connect failed: {err}");
                return RESPONSE_ERROR;
            }
        };

        if maintain {
            self.logstorage_push_device_levels(mount).await;
        }
        if self.daemon.allow_block_mode && block_mode == Some(true) {
            self.daemon.block_mode = BLOCK_MODE_BLOCKING;
            self.user_update_blockmode(None, BLOCK_MODE_BLOCKING).await;
        }
        RESPONSE_OK
    }

    pub async fn logstorage_disconnect_device(&mut self, mount: &std::path::Path) -> u8 {
        // Collect the reset work before the device state is torn down.
        let resets: Vec<(String, Option<LogLevel>)> = match self.storage.device(mount) {
            Some(device) => device
                .filters
                .iter()
                .flat_map(|f| {
                    let reset = f.config.reset_log_level;
                    f.keys.iter().map(move |k| (k.clone(), reset))
                })
                .collect(),
            None => {
                warn!("logstorage disconnect: unknown device {}", mount.display());
                return RESPONSE_ERROR;
            }
        };
        let maintain = self
            .storage
            .device(mount)
            .and_then(|d| d.maintain_loglevel)
            .unwrap_or(self.daemon.maintain_logstorage_loglevel);

        if maintain {
            for (key, reset) in resets {
                self.logstorage_apply_key(&key, None, reset.is_some()).await;
            }
        }

        match self
            .storage
            .device_disconnected(mount, crate::logstorage::config::SYNC_ON_DEVICE_DISCONNECT)
        {
            Ok(_) => {}
            Err(StorageError::NotConnected(_)) => return RESPONSE_ERROR,
            Err(err) => {
                warn!("logstorage disconnect failed: {err}");
                return RESPONSE_ERROR;
            }
        }

        if maintain {
            // The union over the remaining devices must stay correct.
            let mounts: Vec<PathBuf> = self
                .storage
                .devices()
                .iter()
                .map(|d| d.mount_point.clone())
                .collect();
            for other in mounts {
                self.logstorage_push_device_levels(&other).await;
            }
        }

        if self.daemon.allow_block_mode && self.viewer_count() == 0 {
            self.daemon.block_mode = BLOCK_MODE_NON_BLOCKING;
            self.user_update_blockmode(None, BLOCK_MODE_NON_BLOCKING).await;
        }
        RESPONSE_OK
    }

    /// Push the storage-requested log level of every filter key of one
    /// device to the matching registered contexts.
    async fn logstorage_push_device_levels(&mut self, mount: &std::path::Path) {
        let work: Vec<(String, LogLevel)> = match self.storage.device(mount) {
            Some(device) => device
                .filters
                .iter()
                .flat_map(|f| f.keys.iter())
                .filter_map(|key| {
                    crate::logstorage::LogStorageManager::get_loglevel_by_key(
                        self.storage.device(mount).unwrap(),
                        key,
                    )
                    .map(|level| (key.clone(), level))
                })
                .collect(),
            None => return,
        };
        for (key, level) in work {
            self.logstorage_apply_key(&key, Some(level), false).await;
        }
    }

    /// Apply a storage level change (or reset) addressed by a filter key,
    /// resolving wildcard components against the registry.
    async fn logstorage_apply_key(&mut self, key: &str, level: Option<LogLevel>, send_reset: bool) {
        let (apid, ctid, ecu) = split_key(key);
        let ecu = if ecu.is_empty() {
            self.daemon.ecuid
        } else {
            Id4::new(&ecu)
        };
        if ecu != self.daemon.ecuid {
            // Passive-node forwarding is out of scope; local contexts only.
            return;
        }

        let targets: Vec<(Id4, Id4)> = {
            let Some(list) = self.registry.find_users_list(ecu) else { return };
            list.contexts()
                .filter(|c| {
                    let apid_match = apid.is_empty() || apid == ".*" || Id4::new(&apid) == c.apid;
                    let ctid_match = ctid.is_empty() || ctid == ".*" || Id4::new(&ctid) == c.ctid;
                    apid_match && ctid_match
                })
                .map(|c| (c.apid, c.ctid))
                .collect()
        };

        for (apid, ctid) in targets {
            let push = {
                let Some(ctx) = self.registry.context_find_mut(apid, ctid, ecu) else {
                    continue;
                };
                match level {
                    Some(new_level) => {
                        let old = ctx.storage_log_level;
                        if new_level > old {
                            ctx.storage_log_level = new_level;
                        }
                        // Only a raise needs to reach the producer.
                        ctx.storage_log_level > old
                    }
                    None => {
                        ctx.storage_log_level = LogLevel::Default;
                        send_reset
                    }
                }
            };
            if push {
                self.user_send_log_level(apid, ctid).await;
            }
        }
    }

    /// Startup-time device attachment from static configuration.
    pub async fn connect_configured_storage(&mut self) {
        let Some(dir) = self.config.logstorage.dir_path.clone() else {
            return;
        };
        if self.config.logstorage.max_devices == 0 {
            return;
        }
        if self.logstorage_connect_device(&dir).await != RESPONSE_OK {
            warn!("configured logstorage path not attached: {}", dir.display());
        }
    }
}
