//! Registered producer applications and contexts, grouped per ECU.
//!
//! Contexts are owned by their application. Producer transport handles are
//! opaque link ids; the event loop maps them to actual write halves, so the
//! registry never touches sockets itself. `application_del` and
//! `application_add` report which owned link the caller must close.

use crate::protocol::{Id4, LogLevel, TraceStatus, LOG_LEVEL_NOT_SET};
use log::{debug, warn};
use std::fmt::Write as _;
use std::io;
use std::path::Path;

pub type LinkId = u64;

#[derive(Debug, Clone)]
pub struct Application {
    pub apid: Id4,
    pub pid: u32,
    pub user_handle: Option<LinkId>,
    pub owns_user_handle: bool,
    pub description: String,
    pub block_mode: i32,
    pub contexts: Vec<Context>,
}

#[derive(Debug, Clone)]
pub struct Context {
    pub apid: Id4,
    pub ctid: Id4,
    pub log_level: LogLevel,
    pub trace_status: TraceStatus,
    pub log_level_pos: i32,
    pub user_handle: Option<LinkId>,
    pub description: String,
    pub storage_log_level: LogLevel,
    pub predefined: bool,
}

#[derive(Debug)]
pub struct UserList {
    pub ecu: Id4,
    pub applications: Vec<Application>,
}

impl UserList {
    pub fn num_contexts(&self) -> usize {
        self.applications.iter().map(|a| a.contexts.len()).sum()
    }

    pub fn contexts(&self) -> impl Iterator<Item = &Context> {
        self.applications.iter().flat_map(|a| a.contexts.iter())
    }

    pub fn contexts_mut(&mut self) -> impl Iterator<Item = &mut Context> {
        self.applications.iter_mut().flat_map(|a| a.contexts.iter_mut())
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    user_lists: Vec<UserList>,
}

/// Which owned producer link the caller has to close after a mutation.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ClosedLink(pub Option<LinkId>);

impl Registry {
    pub fn new(ecu: Id4) -> Self {
        Registry {
            user_lists: vec![UserList {
                ecu,
                applications: Vec::new(),
            }],
        }
    }

    pub fn find_users_list(&self, ecu: Id4) -> Option<&UserList> {
        self.user_lists.iter().find(|l| l.ecu == ecu)
    }

    pub fn find_users_list_mut(&mut self, ecu: Id4) -> Option<&mut UserList> {
        self.user_lists.iter_mut().find(|l| l.ecu == ecu)
    }

    /// Add or replace an application. An existing entry with a different pid
    /// is replaced; its owned link is handed back for closing.
    pub fn application_add(
        &mut self,
        apid: Id4,
        pid: u32,
        description: &str,
        user_handle: Option<LinkId>,
        owns_user_handle: bool,
        ecu: Id4,
    ) -> Option<(usize, ClosedLink)> {
        let list = self.find_users_list_mut(ecu)?;
        let mut closed = ClosedLink::default();

        if let Some(idx) = list.applications.iter().position(|a| a.apid == apid) {
            let app = &mut list.applications[idx];
            if app.pid != pid && app.pid != 0 {
                debug!("application {apid} registered again (pid {} -> {pid})", app.pid);
                if app.owns_user_handle {
                    closed.0 = app.user_handle;
                }
            }
            app.pid = pid;
            app.user_handle = user_handle;
            app.owns_user_handle = owns_user_handle;
            app.description = description.to_string();
            for ctx in &mut app.contexts {
                ctx.user_handle = user_handle;
            }
            return Some((idx, closed));
        }

        list.applications.push(Application {
            apid,
            pid,
            user_handle,
            owns_user_handle,
            description: description.to_string(),
            block_mode: crate::protocol::BLOCK_MODE_NON_BLOCKING,
            contexts: Vec::new(),
        });
        Some((list.applications.len() - 1, closed))
    }

    pub fn application_find(&self, apid: Id4, ecu: Id4) -> Option<&Application> {
        self.find_users_list(ecu)?
            .applications
            .iter()
            .find(|a| a.apid == apid)
    }

    pub fn application_find_mut(&mut self, apid: Id4, ecu: Id4) -> Option<&mut Application> {
        self.find_users_list_mut(ecu)?
            .applications
            .iter_mut()
            .find(|a| a.apid == apid)
    }

    /// Remove an application. Contexts marked `predefined` outlive their
    /// producer: the entry is kept as an unbound stub carrying only those.
    pub fn application_del(&mut self, apid: Id4, ecu: Id4) -> ClosedLink {
        let Some(list) = self.find_users_list_mut(ecu) else {
            return ClosedLink::default();
        };
        let Some(idx) = list.applications.iter().position(|a| a.apid == apid) else {
            return ClosedLink::default();
        };

        let app = &mut list.applications[idx];
        let closed = if app.owns_user_handle {
            ClosedLink(app.user_handle)
        } else {
            ClosedLink::default()
        };

        app.contexts.retain(|c| c.predefined);
        if app.contexts.is_empty() {
            list.applications.remove(idx);
        } else {
            app.pid = 0;
            app.user_handle = None;
            app.owns_user_handle = false;
            for ctx in &mut app.contexts {
                ctx.user_handle = None;
            }
        }
        closed
    }

    /// Add or update a context under its owning application.
    pub fn context_add(
        &mut self,
        apid: Id4,
        ctid: Id4,
        log_level: i8,
        trace_status: i8,
        log_level_pos: i32,
        user_handle: Option<LinkId>,
        description: &str,
        predefined: bool,
        ecu: Id4,
    ) -> Option<&mut Context> {
        let log_level = match log_level {
            LOG_LEVEL_NOT_SET => LogLevel::Default,
            other => match LogLevel::from_i8(other) {
                Some(level) => level,
                None => {
                    warn!("context {apid}:{ctid} registered with invalid log level {other}");
                    return None;
                }
            },
        };
        let trace_status = match trace_status {
            LOG_LEVEL_NOT_SET => TraceStatus::Default,
            other => match TraceStatus::from_i8(other) {
                Some(status) => status,
                None => {
                    warn!("context {apid}:{ctid} registered with invalid trace status {other}");
                    return None;
                }
            },
        };

        let app = self.application_find_mut(apid, ecu)?;
        if let Some(idx) = app.contexts.iter().position(|c| c.ctid == ctid) {
            let ctx = &mut app.contexts[idx];
            ctx.log_level = log_level;
            ctx.trace_status = trace_status;
            ctx.log_level_pos = log_level_pos;
            ctx.user_handle = user_handle;
            ctx.description = description.to_string();
            ctx.predefined |= predefined;
            return Some(ctx);
        }

        app.contexts.push(Context {
            apid,
            ctid,
            log_level,
            trace_status,
            log_level_pos,
            user_handle,
            description: description.to_string(),
            storage_log_level: LogLevel::Default,
            predefined,
        });
        app.contexts.last_mut()
    }

    pub fn context_del(&mut self, apid: Id4, ctid: Id4, ecu: Id4) -> bool {
        let Some(app) = self.application_find_mut(apid, ecu) else {
            return false;
        };
        let before = app.contexts.len();
        app.contexts.retain(|c| c.ctid != ctid);
        before != app.contexts.len()
    }

    pub fn context_find(&self, apid: Id4, ctid: Id4, ecu: Id4) -> Option<&Context> {
        self.application_find(apid, ecu)?
            .contexts
            .iter()
            .find(|c| c.ctid == ctid)
    }

    pub fn context_find_mut(&mut self, apid: Id4, ctid: Id4, ecu: Id4) -> Option<&mut Context> {
        self.application_find_mut(apid, ecu)?
            .contexts
            .iter_mut()
            .find(|c| c.ctid == ctid)
    }

    /// Detach every entry referencing `handle`. Used when a producer
    /// connection closes and its link id could be reassigned.
    pub fn invalidate_handle(&mut self, ecu: Id4, handle: LinkId) {
        let Some(list) = self.find_users_list_mut(ecu) else {
            return;
        };
        for app in &mut list.applications {
            if app.user_handle == Some(handle) {
                app.user_handle = None;
                app.owns_user_handle = false;
            }
            for ctx in &mut app.contexts {
                if ctx.user_handle == Some(handle) {
                    ctx.user_handle = None;
                }
            }
        }
    }

    pub fn clear(&mut self, ecu: Id4) {
        if let Some(list) = self.find_users_list_mut(ecu) {
            list.applications.clear();
        }
    }

    /* Persistence: line-oriented text files. */

    pub fn applications_save(&self, path: &Path, ecu: Id4) -> io::Result<()> {
        let Some(list) = self.find_users_list(ecu) else {
            return Ok(());
        };
        let mut out = String::new();
        for app in &list.applications {
            let _ = writeln!(out, "{}:{}:{}", app.apid, app.pid, app.description);
        }
        std::fs::write(path, out)
    }

    pub fn contexts_save(&self, path: &Path, ecu: Id4) -> io::Result<()> {
        let Some(list) = self.find_users_list(ecu) else {
            return Ok(());
        };
        let mut out = String::new();
        for ctx in list.contexts() {
            let _ = writeln!(
                out,
                "{}:{}:{}:{}:{}",
                ctx.apid,
                ctx.ctid,
                ctx.log_level as i8,
                ctx.trace_status as i8,
                ctx.description
            );
        }
        std::fs::write(path, out)
    }

    /// Load persisted applications; entries are created unbound.
    pub fn applications_load(&mut self, path: &Path, ecu: Id4) -> io::Result<usize> {
        let text = std::fs::read_to_string(path)?;
        let mut loaded = 0;
        for line in text.lines() {
            let mut parts = line.splitn(3, ':');
            let (Some(apid), Some(pid), Some(desc)) = (parts.next(), parts.next(), parts.next())
            else {
                warn!("skipping malformed application entry: {line}");
                continue;
            };
            let Ok(pid) = pid.parse::<u32>() else {
                warn!("skipping application entry with bad pid: {line}");
                continue;
            };
            if apid.is_empty() {
                continue;
            }
            self.application_add(Id4::new(apid), pid, desc, None, false, ecu);
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Load persisted contexts as `predefined`; unknown applications are
    /// materialized as unbound stubs first.
    pub fn contexts_load(&mut self, path: &Path, ecu: Id4) -> io::Result<usize> {
        let text = std::fs::read_to_string(path)?;
        let mut loaded = 0;
        for line in text.lines() {
            let mut parts = line.splitn(5, ':');
            let (Some(apid), Some(ctid), Some(ll), Some(ts), Some(desc)) = (
                parts.next(),
                parts.next(),
                parts.next(),
                parts.next(),
                parts.next(),
            ) else {
                warn!("skipping malformed context entry: {line}");
                continue;
            };
            let (Ok(ll), Ok(ts)) = (ll.parse::<i8>(), ts.parse::<i8>()) else {
                warn!("skipping context entry with bad levels: {line}");
                continue;
            };
            if apid.is_empty() || ctid.is_empty() {
                continue;
            }
            let apid = Id4::new(apid);
            if self.application_find(apid, ecu).is_none() {
                self.application_add(apid, 0, "", None, false, ecu);
            }
            if self
                .context_add(apid, Id4::new(ctid), ll, ts, -1, None, desc, true, ecu)
                .is_some()
            {
                loaded += 1;
            }
        }
        Ok(loaded)
    }
}

/// Resolve the levels pushed to a producer for one context: DEFAULT falls
/// back to the daemon default, the storage-requested level can only raise
/// the result, and the enforce clamp caps both at the configured defaults.
pub fn effective_levels(
    ctx: &Context,
    default_log_level: LogLevel,
    default_trace_status: TraceStatus,
    force_ll_ts: bool,
) -> (LogLevel, TraceStatus) {
    let mut ll = match ctx.log_level {
        LogLevel::Default => default_log_level,
        other => other,
    };
    if ctx.storage_log_level != LogLevel::Default && ctx.storage_log_level > ll {
        ll = ctx.storage_log_level;
    }
    let mut ts = match ctx.trace_status {
        TraceStatus::Default => default_trace_status,
        other => other,
    };
    if force_ll_ts {
        if ll > default_log_level {
            ll = default_log_level;
        }
        if ts == TraceStatus::On && default_trace_status == TraceStatus::Off {
            ts = TraceStatus::Off;
        }
    }
    (ll, ts)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ECU: Id4 = Id4(*b"ECU1");

    fn registry_with_app() -> Registry {
        let mut reg = Registry::new(ECU);
        reg.application_add(Id4::new("APP1"), 42, "app one", Some(7), false, ECU);
        reg
    }

    #[test]
    fn application_replace_reports_owned_link() {
        let mut reg = Registry::new(ECU);
        reg.application_add(Id4::new("APP1"), 42, "first", Some(7), true, ECU);
        let (_, closed) = reg
            .application_add(Id4::new("APP1"), 43, "second", Some(9), true, ECU)
            .unwrap();
        assert_eq!(closed, ClosedLink(Some(7)));
        let app = reg.application_find(Id4::new("APP1"), ECU).unwrap();
        assert_eq!(app.pid, 43);
        assert_eq!(app.description, "second");
    }

    #[test]
    fn context_add_resolves_not_set_and_rejects_garbage() {
        let mut reg = registry_with_app();
        let ctx = reg
            .context_add(
                Id4::new("APP1"),
                Id4::new("CTX1"),
                LOG_LEVEL_NOT_SET,
                LOG_LEVEL_NOT_SET,
                0,
                Some(7),
                "ctx",
                false,
                ECU,
            )
            .unwrap();
        assert_eq!(ctx.log_level, LogLevel::Default);
        assert_eq!(ctx.trace_status, TraceStatus::Default);

        assert!(reg
            .context_add(Id4::new("APP1"), Id4::new("BAD1"), 99, 0, 0, None, "", false, ECU)
            .is_none());
    }

    #[test]
    fn predefined_contexts_survive_unregister() {
        let mut reg = registry_with_app();
        reg.context_add(Id4::new("APP1"), Id4::new("CTX1"), 4, 0, 0, Some(7), "", false, ECU);
        reg.context_add(Id4::new("APP1"), Id4::new("CTX2"), 4, 0, 1, Some(7), "", true, ECU);
        reg.application_del(Id4::new("APP1"), ECU);
        let app = reg.application_find(Id4::new("APP1"), ECU).unwrap();
        assert_eq!(app.pid, 0);
        assert_eq!(app.contexts.len(), 1);
        assert_eq!(app.contexts[0].ctid, Id4::new("CTX2"));
        assert!(app.contexts[0].user_handle.is_none());
    }

    #[test]
    fn invalidate_handle_detaches_everything() {
        let mut reg = registry_with_app();
        reg.context_add(Id4::new("APP1"), Id4::new("CTX1"), 4, 0, 0, Some(7), "", false, ECU);
        reg.invalidate_handle(ECU, 7);
        let app = reg.application_find(Id4::new("APP1"), ECU).unwrap();
        assert!(app.user_handle.is_none());
        assert!(app.contexts[0].user_handle.is_none());
    }

    #[test]
    fn clear_drops_all_registrations() {
        let mut reg = registry_with_app();
        reg.context_add(Id4::new("APP1"), Id4::new("CTX1"), 4, 0, 0, Some(7), "", false, ECU);
        reg.clear(ECU);
        let list = reg.find_users_list(ECU).unwrap();
        assert!(list.applications.is_empty());
        assert_eq!(list.num_contexts(), 0);
    }

    #[test]
    fn effective_levels_resolution() {
        let mut ctx = Context {
            apid: Id4::new("APP1"),
            ctid: Id4::new("CTX1"),
            log_level: LogLevel::Default,
            trace_status: TraceStatus::Default,
            log_level_pos: 0,
            user_handle: None,
            description: String::new(),
            storage_log_level: LogLevel::Default,
            predefined: false,
        };

        // Scenario from the spec: DEFAULT registration against INFO default.
        let (ll, ts) = effective_levels(&ctx, LogLevel::Info, TraceStatus::Off, false);
        assert_eq!((ll, ts), (LogLevel::Info, TraceStatus::Off));

        // Storage-requested level raises the effective level.
        ctx.storage_log_level = LogLevel::Debug;
        let (ll, _) = effective_levels(&ctx, LogLevel::Info, TraceStatus::Off, false);
        assert_eq!(ll, LogLevel::Debug);

        // Enforce clamp caps at the daemon default.
        ctx.log_level = LogLevel::Verbose;
        ctx.storage_log_level = LogLevel::Default;
        let (ll, _) = effective_levels(&ctx, LogLevel::Warn, TraceStatus::Off, true);
        assert_eq!(ll, LogLevel::Warn);
    }

    #[test]
    fn persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let apps = dir.path().join("applications.cfg");
        let ctxs = dir.path().join("contexts.cfg");

        let mut reg = registry_with_app();
        reg.context_add(Id4::new("APP1"), Id4::new("CTX1"), 4, 0, 0, Some(7), "ctx one", false, ECU);
        reg.applications_save(&apps, ECU).unwrap();
        reg.contexts_save(&ctxs, ECU).unwrap();

        let mut restored = Registry::new(ECU);
        assert_eq!(restored.applications_load(&apps, ECU).unwrap(), 1);
        assert_eq!(restored.contexts_load(&ctxs, ECU).unwrap(), 1);
        let ctx = restored
            .context_find(Id4::new("APP1"), Id4::new("CTX1"), ECU)
            .unwrap();
        assert_eq!(ctx.log_level, LogLevel::Info);
        assert!(ctx.predefined);
        assert_eq!(ctx.description, "ctx one");
    }
}
