//! Cached write strategy.
//!
//! Messages accumulate in a per-filter cache and reach the rotation files
//! only when a configured sync trigger fires. Sync ranges are bounded by
//! the storage magic so a partially overwritten cache never emits torn
//! messages.

use super::config::*;
use super::file::{flush_and_sync, open_log_file, UserConfig};
use super::{CacheAccounting, FilterState, NewestFileInfo};
use crate::protocol::STORAGE_MAGIC;
use log::{debug, warn};
use std::io::{self, Write};
use std::path::Path;

/// Quota charge for the bookkeeping attached to each cache.
pub const FOOTER_CHARGE: u64 = 16;

#[derive(Debug)]
pub struct Cache {
    buf: Vec<u8>,
    pub offset: u64,
    pub wrap_around_cnt: u32,
    pub last_sync_offset: u64,
    pub end_sync_offset: u64,
}

impl Cache {
    fn new(size: u64) -> Self {
        Cache {
            buf: vec![0; size as usize],
            offset: 0,
            wrap_around_cnt: 0,
            last_sync_offset: 0,
            end_sync_offset: 0,
        }
    }

    pub fn size(&self) -> u64 {
        self.buf.len() as u64
    }

    fn reset(&mut self) {
        self.buf.fill(0);
        self.offset = 0;
        self.wrap_around_cnt = 0;
        self.last_sync_offset = 0;
        self.end_sync_offset = 0;
    }

    fn write_at(&mut self, at: u64, d1: &[u8], d2: &[u8], d3: &[u8]) {
        let mut pos = at as usize;
        for span in [d1, d2, d3] {
            self.buf[pos..pos + span.len()].copy_from_slice(span);
            pos += span.len();
        }
    }
}

/// Forward scan for the first storage magic inside `window`.
fn find_header(window: &[u8]) -> Option<usize> {
    crate::codec::find_pattern(window, &STORAGE_MAGIC)
}

/// Backward scan for the last storage magic inside `window`; the returned
/// position is a safe end for emission (a message boundary).
fn find_last_header(window: &[u8]) -> Option<usize> {
    if window.len() < STORAGE_MAGIC.len() {
        return None;
    }
    (0..=window.len() - STORAGE_MAGIC.len())
        .rev()
        .find(|&i| window[i..i + STORAGE_MAGIC.len()] == STORAGE_MAGIC)
}

/// Cached strategy: make sure the cache exists, charging the device-wide
/// quota, and follow the shared newest-file record.
pub fn prepare_msg_cache(
    state: &mut FilterState,
    config: &FilterConfig,
    _uconfig: &UserConfig,
    newest: &NewestFileInfo,
    accounting: &mut CacheAccounting,
) -> io::Result<()> {
    if let Some(newest_name) = &newest.newest_file {
        let stale = match &state.working_file_name {
            Some(working) => state.wrap_id != newest.wrap_id || working != newest_name,
            None => true,
        };
        if stale {
            state.working_file_name = Some(newest_name.clone());
            state.wrap_id = newest.wrap_id;
        }
    }

    if state.cache.is_some() {
        return Ok(());
    }

    let cache_size = config.cache_size();
    if !accounting.try_charge(cache_size + FOOTER_CHARGE) {
        return Err(io::Error::new(
            io::ErrorKind::OutOfMemory,
            format!(
                "logstorage cache quota exhausted ({}/{} bytes)",
                accounting.used(),
                accounting.max()
            ),
        ));
    }
    state.cache = Some(Cache::new(cache_size));
    Ok(())
}

/// Cached strategy write. Appends when the message fits, fires size-based
/// syncs at the boundary and wraps the cache for demand/exit strategies.
pub fn write_msg_cache(
    state: &mut FilterState,
    config: &FilterConfig,
    uconfig: &UserConfig,
    dev_path: &Path,
    newest: &mut NewestFileInfo,
    d1: &[u8],
    d2: &[u8],
    d3: &[u8],
) -> io::Result<()> {
    let msg_size = (d1.len() + d2.len() + d3.len()) as u64;
    let cache_size = {
        let cache = state
            .cache
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "cache not prepared"))?;
        cache.size()
    };
    let remain = cache_size - state.cache.as_ref().unwrap().offset;

    if msg_size <= remain {
        let cache = state.cache.as_mut().unwrap();
        let at = cache.offset;
        cache.offset += msg_size;
        if cache.wrap_around_cnt < 1 {
            cache.end_sync_offset = cache.offset;
        }
        cache.write_at(at, d1, d2, d3);
    }

    if msg_size >= remain {
        if msg_size > cache_size {
            warn!("message is larger than the logstorage cache, discarding");
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "message larger than cache",
            ));
        }

        if config.sync_is(SYNC_ON_FILE_SIZE) {
            sync_msg_cache(state, config, uconfig, dev_path, SYNC_ON_FILE_SIZE, newest)?;
        } else if config.sync_is(SYNC_ON_SPECIFIC_SIZE) {
            sync_msg_cache(state, config, uconfig, dev_path, SYNC_ON_SPECIFIC_SIZE, newest)?;
        } else if config.sync_is(SYNC_ON_DEMAND) || config.sync_is(SYNC_ON_DAEMON_EXIT) {
            state.cache.as_mut().unwrap().wrap_around_cnt += 1;
        }

        if msg_size > remain {
            let cache = state.cache.as_mut().unwrap();
            cache.end_sync_offset = cache.offset;
            cache.offset = msg_size;
            cache.write_at(0, d1, d2, d3);
        }
    }

    Ok(())
}

/// Emit cached data for `status` when that trigger is configured. The
/// emission order follows the wrap counter so older data leaves first.
pub fn sync_msg_cache(
    state: &mut FilterState,
    config: &FilterConfig,
    uconfig: &UserConfig,
    dev_path: &Path,
    status: u32,
    newest: &mut NewestFileInfo,
) -> io::Result<()> {
    if !config.sync_is(status) {
        return Ok(());
    }
    if state.cache.is_none() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            "cannot sync: cache not prepared",
        ));
    }

    let (wrap_cnt, offset, last_sync, end_sync) = {
        let cache = state.cache.as_ref().unwrap();
        (
            cache.wrap_around_cnt,
            cache.offset,
            cache.last_sync_offset,
            cache.end_sync_offset,
        )
    };

    if wrap_cnt < 1 {
        sync_to_file(state, config, uconfig, dev_path, last_sync, offset, newest)?;
    } else if wrap_cnt == 1 && offset < last_sync {
        sync_to_file(state, config, uconfig, dev_path, last_sync, end_sync, newest)?;
        state.cache.as_mut().unwrap().last_sync_offset = 0;
        sync_to_file(state, config, uconfig, dev_path, 0, offset, newest)?;
    } else {
        sync_to_file(state, config, uconfig, dev_path, offset, end_sync, newest)?;
        state.cache.as_mut().unwrap().last_sync_offset = 0;
        sync_to_file(state, config, uconfig, dev_path, 0, offset, newest)?;
    }

    // Size-triggered and on-demand syncs leave an empty cache behind;
    // shutdown-path syncs keep the bookkeeping for a possible next round.
    if matches!(status, SYNC_ON_SPECIFIC_SIZE | SYNC_ON_FILE_SIZE | SYNC_ON_DEMAND) {
        state.cache.as_mut().unwrap().reset();
    }
    if status == SYNC_ON_FILE_SIZE {
        state.log = None;
        state.current_offset = 0;
    }
    Ok(())
}

/// Write one contiguous cache range to the rotation files, splitting at a
/// rotation boundary when the current file cannot hold it all.
fn sync_to_file(
    state: &mut FilterState,
    config: &FilterConfig,
    uconfig: &UserConfig,
    dev_path: &Path,
    start_offset: u64,
    end_offset: u64,
    newest: &mut NewestFileInfo,
) -> io::Result<()> {
    if end_offset <= start_offset {
        return Ok(());
    }
    // The cache is detached while files rotate so the buffer can be read
    // without re-borrowing the filter state.
    let mut cache = state
        .cache
        .take()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "cache not prepared"))?;
    let result = sync_range(
        state,
        &mut cache,
        config,
        uconfig,
        dev_path,
        start_offset as usize,
        end_offset as usize,
        newest,
    );
    state.cache = Some(cache);
    result
}

#[allow(clippy::too_many_arguments)]
fn sync_range(
    state: &mut FilterState,
    cache: &mut Cache,
    config: &FilterConfig,
    uconfig: &UserConfig,
    dev_path: &Path,
    mut start: usize,
    end: usize,
    newest: &mut NewestFileInfo,
) -> io::Result<()> {
    let count = end - start;

    state.log = None;
    state.current_offset = 0;

    open_log_file(state, config, uconfig, dev_path, count as u64, true, true)?;
    if state.skip {
        return Ok(());
    }
    update_newest(state, newest);

    let remain = (config.file_size - state.current_offset) as usize;

    if count > remain {
        // Fill the remaining file space with whole messages only.
        let window = &cache.buf[start..start + remain];
        let emitted = match find_header(window) {
            Some(si) => match find_last_header(&window[si..]) {
                Some(0) | None => 0,
                Some(last) => {
                    let log = state.log.as_mut().unwrap();
                    log.write_all(&window[si..si + last])?;
                    flush_and_sync(log)?;
                    si + last
                }
            },
            None => 0,
        };
        state.log = None;
        state.current_offset = 0;
        if emitted > 0 {
            start += emitted;
            cache.last_sync_offset = start as u64;
        }
    }

    let window = &cache.buf[start..end];
    if let Some(si) = find_header(window) {
        let count = window.len() - si;
        if count > 0 {
            if state.log.is_none() {
                open_log_file(state, config, uconfig, dev_path, count as u64, true, false)?;
                if state.skip {
                    return Ok(());
                }
                update_newest(state, newest);
            }
            let log = state.log.as_mut().unwrap();
            log.write_all(&window[si..])?;
            flush_and_sync(log)?;
            state.current_offset += count as u64;
            cache.last_sync_offset = end as u64;
        }
    } else {
        debug!("no message boundary inside cache range {start}..{end}");
    }

    cache.wrap_around_cnt = 0;
    Ok(())
}

fn update_newest(state: &FilterState, newest: &mut NewestFileInfo) {
    if let Some(working) = &state.working_file_name {
        newest.newest_file = Some(working.clone());
        newest.wrap_id = state.wrap_id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logstorage::config::FilterKind;
    use crate::protocol::LogLevel;

    fn cached_filter(file_size: u64, sync: u32, specific: u64) -> FilterConfig {
        FilterConfig {
            kind: FilterKind::Verbose,
            apids: vec!["APP1".into()],
            ctids: vec![".*".into()],
            excluded_apids: Vec::new(),
            excluded_ctids: Vec::new(),
            log_level: LogLevel::Info,
            reset_log_level: None,
            file_name: Some("app".into()),
            file_size,
            num_files: 3,
            sync,
            overwrite: OverwriteMode::DiscardOld,
            ecuid: None,
            specific_size: specific,
            disable_network: false,
        }
    }

    fn uconfig() -> UserConfig {
        UserConfig {
            timestamp: false,
            delimiter: '_',
            max_counter: 999,
            counter_idx_len: 3,
            optional_counter: false,
        }
    }

    /// A fake stored message: storage magic plus payload.
    fn record(fill: u8, len: usize) -> Vec<u8> {
        let mut out = STORAGE_MAGIC.to_vec();
        out.extend(std::iter::repeat(fill).take(len - STORAGE_MAGIC.len()));
        out
    }

    #[test]
    fn quota_is_enforced_and_refunded() {
        let mut accounting = CacheAccounting::new(100);
        let cfg = cached_filter(60, SYNC_ON_DEMAND, 0);
        let mut state = FilterState::default();
        let newest = NewestFileInfo::default();

        prepare_msg_cache(&mut state, &cfg, &uconfig(), &newest, &mut accounting).unwrap();
        assert_eq!(accounting.used(), 60 + FOOTER_CHARGE);

        let mut second = FilterState::default();
        let err = prepare_msg_cache(&mut second, &cfg, &uconfig(), &newest, &mut accounting)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::OutOfMemory);

        accounting.refund(60 + FOOTER_CHARGE);
        assert_eq!(accounting.used(), 0);
    }

    #[test]
    fn on_demand_sync_writes_whole_messages() {
        let dir = tempfile::tempdir().unwrap();
        let mut accounting = CacheAccounting::new(10_000);
        let cfg = cached_filter(1000, SYNC_ON_DEMAND, 0);
        let uc = uconfig();
        let mut state = FilterState::default();
        let mut newest = NewestFileInfo::default();

        prepare_msg_cache(&mut state, &cfg, &uc, &newest, &mut accounting).unwrap();
        let msg = record(b'a', 100);
        for _ in 0..3 {
            write_msg_cache(&mut state, &cfg, &uc, dir.path(), &mut newest, &msg, b"", b"")
                .unwrap();
        }

        sync_msg_cache(&mut state, &cfg, &uc, dir.path(), SYNC_ON_DEMAND, &mut newest).unwrap();
        let written = std::fs::read(dir.path().join("app_001.mct")).unwrap();
        assert_eq!(written.len(), 300);
        assert_eq!(&written[..4], &STORAGE_MAGIC);
        // Nothing further to emit on a second sync.
        sync_msg_cache(&mut state, &cfg, &uc, dir.path(), SYNC_ON_DEMAND, &mut newest).unwrap();
        let written = std::fs::read(dir.path().join("app_001.mct")).unwrap();
        assert_eq!(written.len(), 300);
    }

    #[test]
    fn cache_wraps_and_keeps_quota_constant() {
        let dir = tempfile::tempdir().unwrap();
        let mut accounting = CacheAccounting::new(10_000);
        let cfg = cached_filter(250, SYNC_ON_DEMAND, 0);
        let uc = uconfig();
        let mut state = FilterState::default();
        let mut newest = NewestFileInfo::default();

        prepare_msg_cache(&mut state, &cfg, &uc, &newest, &mut accounting).unwrap();
        let before = accounting.used();
        let msg = record(b'x', 100);
        // Third write exceeds the 250-byte cache and wraps.
        for _ in 0..3 {
            write_msg_cache(&mut state, &cfg, &uc, dir.path(), &mut newest, &msg, b"", b"")
                .unwrap();
        }
        let cache = state.cache.as_ref().unwrap();
        assert_eq!(cache.wrap_around_cnt, 1);
        assert_eq!(cache.offset, 100);
        assert_eq!(accounting.used(), before);
    }

    #[test]
    fn oversized_message_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let mut accounting = CacheAccounting::new(10_000);
        let cfg = cached_filter(100, SYNC_ON_DEMAND, 0);
        let uc = uconfig();
        let mut state = FilterState::default();
        let mut newest = NewestFileInfo::default();

        prepare_msg_cache(&mut state, &cfg, &uc, &newest, &mut accounting).unwrap();
        let msg = record(b'z', 150);
        assert!(
            write_msg_cache(&mut state, &cfg, &uc, dir.path(), &mut newest, &msg, b"", b"")
                .is_err()
        );
    }

    #[test]
    fn on_demand_sync_leaves_an_empty_cache() {
        let dir = tempfile::tempdir().unwrap();
        let mut accounting = CacheAccounting::new(10_000);
        let cfg = cached_filter(1000, SYNC_ON_DEMAND, 0);
        let uc = uconfig();
        let mut state = FilterState::default();
        let mut newest = NewestFileInfo::default();

        prepare_msg_cache(&mut state, &cfg, &uc, &newest, &mut accounting).unwrap();
        let msg = record(b'q', 60);
        write_msg_cache(&mut state, &cfg, &uc, dir.path(), &mut newest, &msg, b"", b"").unwrap();
        sync_msg_cache(&mut state, &cfg, &uc, dir.path(), SYNC_ON_DEMAND, &mut newest).unwrap();
        let cache = state.cache.as_ref().unwrap();
        assert_eq!(cache.offset, 0);
        assert_eq!(cache.last_sync_offset, 0);
        assert_eq!(cache.wrap_around_cnt, 0);
        assert!(cache.buf.iter().all(|b| *b == 0));
    }
}
