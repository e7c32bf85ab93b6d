//! Log file naming, directory scanning and rotation.

use super::config::{FilterConfig, OverwriteMode};
use super::{FileRecord, FilterState, NewestFileInfo};
use log::{debug, info, warn};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;

pub const FILE_EXTENSION: &str = ".mct";

/// File naming policy, set once from the daemon configuration.
#[derive(Debug, Clone)]
pub struct UserConfig {
    pub timestamp: bool,
    pub delimiter: char,
    pub max_counter: u32,
    pub counter_idx_len: usize,
    /// Omit the index for single-file filters.
    pub optional_counter: bool,
}

impl Default for UserConfig {
    fn default() -> Self {
        UserConfig {
            timestamp: true,
            delimiter: '_',
            max_counter: u32::MAX,
            counter_idx_len: 3,
            optional_counter: false,
        }
    }
}

/// Assemble a log file name: `<name><delim><index>[<delim><timestamp>].mct`.
/// The index is omitted for single-file filters in optional-counter mode and
/// unpadded when no counter wrap is configured.
pub fn log_file_name(uconfig: &UserConfig, name: &str, num_files: u32, idx: u32) -> String {
    let mut out = String::from(name);

    if !(num_files == 1 && uconfig.optional_counter) {
        let width = if uconfig.max_counter == u32::MAX {
            0
        } else {
            uconfig.counter_idx_len
        };
        out.push(uconfig.delimiter);
        out.push_str(&format!("{idx:0width$}"));
    }

    if uconfig.timestamp {
        out.push(uconfig.delimiter);
        out.push_str(&chrono::Local::now().format("%Y%m%d-%H%M%S").to_string());
    }

    out.push_str(FILE_EXTENSION);
    out
}

/// Extract the rotation index from a file name produced by
/// [`log_file_name`]. `base` is the configured name without directories.
pub fn extract_index(uconfig: &UserConfig, file: &str, base: &str) -> Option<u32> {
    let rest = file.strip_prefix(base)?;
    let mut chars = rest.chars();
    if chars.next() != Some(uconfig.delimiter) {
        return None;
    }
    let digits: String = chars.as_str().chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

fn split_file_name(file_name: &str) -> (Option<&str>, &str) {
    match file_name.rsplit_once('/') {
        Some((dir, base)) => (Some(dir), base),
        None => (None, file_name),
    }
}

/// Scan the storage directory for files of this filter, in ascending index
/// order. When the observed maximum index equals the configured wrap
/// counter, the list is rearranged around the last gap so the rotation wrap
/// boundary is respected.
pub fn scan_directory(
    uconfig: &UserConfig,
    storage_path: &Path,
    config: &FilterConfig,
) -> io::Result<Vec<FileRecord>> {
    let file_name = config
        .file_name
        .as_deref()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "filter has no file name"))?;
    let (dir, base) = split_file_name(file_name);
    let scan_path = match dir {
        Some(d) => storage_path.join(d),
        None => storage_path.to_path_buf(),
    };

    let mut records = Vec::new();
    let entries = match std::fs::read_dir(&scan_path) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(records),
        Err(err) => return Err(err),
    };

    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(base) {
            continue;
        }

        let idx = if config.num_files == 1 && uconfig.optional_counter {
            // `<base>.mct` or `<base><delim><timestamp>.mct`
            let rest = &name[base.len()..];
            if rest.starts_with(FILE_EXTENSION)
                || (uconfig.timestamp && rest.starts_with(uconfig.delimiter))
            {
                1
            } else {
                continue;
            }
        } else {
            match extract_index(uconfig, name, base) {
                Some(idx) if idx > 0 => idx,
                _ => continue,
            }
        };

        let record_name = match dir {
            Some(d) => format!("{d}/{name}"),
            None => name.to_string(),
        };
        records.push(FileRecord {
            name: record_name,
            idx,
        });
    }

    records.sort_by_key(|r| r.idx);
    let max_idx = records.last().map(|r| r.idx).unwrap_or(0);
    if max_idx == uconfig.max_counter {
        rearrange_around_wrap(&mut records);
    }
    debug!(
        "scanned {} rotation files for '{}' under {}",
        records.len(),
        file_name,
        scan_path.display()
    );
    Ok(records)
}

/// Rotate the sorted record list so it starts after the last index gap:
/// with a wrapped sequence like `1,2,7,8` the oldest file is `7`, not `1`.
fn rearrange_around_wrap(records: &mut Vec<FileRecord>) {
    if records.len() < 2 || records[0].idx != 1 {
        return;
    }
    let gap = records
        .windows(2)
        .position(|w| w[1].idx - w[0].idx != 1)
        .map(|pos| pos + 1);
    if let Some(gap) = gap {
        records.rotate_left(gap);
    }
}

/// Open the rotation file able to take `msg_size` more bytes, rotating and
/// pruning as needed. Sets `state.skip` instead of opening when a
/// DISCARD_NEW filter has exhausted its file budget.
pub fn open_log_file(
    state: &mut FilterState,
    config: &FilterConfig,
    uconfig: &UserConfig,
    dev_path: &Path,
    msg_size: u64,
    update_required: bool,
    is_sync: bool,
) -> io::Result<()> {
    let file_name_cfg = config
        .file_name
        .as_deref()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "filter has no file name"))?;

    if state.records.is_empty() || update_required {
        state.records = scan_directory(uconfig, dev_path, config)?;
    }

    if state.records.is_empty() {
        let file_name = log_file_name(uconfig, file_name_cfg, config.num_files, 1);
        let abs = dev_path.join(&file_name);
        if let Some(parent) = abs.parent() {
            std::fs::create_dir_all(parent)?;
        }
        state.log = Some(OpenOptions::new().create(true).append(true).open(&abs)?);
        state.current_offset = 0;
        state.working_file_name = Some(file_name.clone());
        state.records.push(FileRecord { name: file_name, idx: 1 });
        return Ok(());
    }

    // The newest on disk is the working file unless a wrap already moved it.
    if state.wrap_id == 0 || state.working_file_name.is_none() {
        state.working_file_name = Some(state.records.last().unwrap().name.clone());
    }
    let working = state.working_file_name.clone().unwrap();
    let abs = dev_path.join(&working);

    if let Ok(meta) = std::fs::metadata(&abs) {
        let fits = if is_sync {
            meta.len() < config.file_size
        } else {
            meta.len() + msg_size <= config.file_size
        };
        if fits {
            state.log = Some(OpenOptions::new().create(true).append(true).open(&abs)?);
            state.current_offset = meta.len();
            return Ok(());
        }
    }

    // No space left in the working file: rotate.
    let (_, base) = split_file_name(file_name_cfg);
    let (_, working_base) = split_file_name(&working);
    let mut idx = if config.num_files == 1 && uconfig.optional_counter {
        1
    } else {
        extract_index(uconfig, working_base, base).unwrap_or_else(|| {
            warn!("cannot extract index from '{working}', restarting at 1");
            0
        })
    };

    if config.overwrite == OverwriteMode::DiscardNew && config.num_files == idx {
        info!("logstorage limit reached, stopping capture for filter '{file_name_cfg}'");
        state.skip = true;
        return Ok(());
    }

    idx += 1;
    if idx > uconfig.max_counter || idx == 0 {
        idx = 1;
        state.wrap_id += 1;
    }

    let file_name = log_file_name(uconfig, file_name_cfg, config.num_files, idx);
    let abs = dev_path.join(&file_name);
    state.working_file_name = Some(file_name.clone());

    // A wrap re-enters the rotation instead of growing it.
    if state.wrap_id > 0 && abs.exists() {
        std::fs::remove_file(&abs)?;
        state.records.retain(|r| r.name != file_name);
    }

    if let Some(parent) = abs.parent() {
        std::fs::create_dir_all(parent)?;
    }
    state.log = Some(
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&abs)?,
    );
    state.current_offset = 0;
    state.records.push(FileRecord { name: file_name, idx });

    if state.records.len() > config.num_files as usize
        && !(config.num_files == 1 && uconfig.optional_counter)
    {
        let oldest = state.records.remove(0);
        let path = dev_path.join(&oldest.name);
        debug!("removing oldest rotation file {}", path.display());
        if let Err(err) = std::fs::remove_file(&path) {
            warn!("cannot remove {}: {err}", path.display());
        }
    }

    Ok(())
}

/// Flush and persist file contents; filesystems without fsync are tolerated.
pub fn flush_and_sync(file: &mut std::fs::File) -> io::Result<()> {
    file.flush()?;
    match file.sync_all() {
        Ok(()) => Ok(()),
        Err(err) if err.raw_os_error() == Some(libc::ENOSYS) => Ok(()),
        Err(err) if err.raw_os_error() == Some(libc::EINVAL) => Ok(()),
        Err(err) => Err(err),
    }
}

/// ON_MSG strategy: make sure the working file can take the message,
/// following the shared newest-file record when other filters rotated it.
pub fn prepare_on_msg(
    state: &mut FilterState,
    config: &FilterConfig,
    uconfig: &UserConfig,
    dev_path: &Path,
    msg_size: u64,
    newest: &NewestFileInfo,
) -> io::Result<()> {
    if state.log.is_none() {
        if state.wrap_id < newest.wrap_id {
            state.wrap_id = newest.wrap_id;
            state.working_file_name = newest.newest_file.clone();
        }
        return open_log_file(state, config, uconfig, dev_path, msg_size, true, false);
    }

    let len = state.log.as_ref().unwrap().metadata()?.len();
    let rotated_elsewhere = match (&state.working_file_name, &newest.newest_file) {
        (Some(working), Some(newest_name)) => working != newest_name,
        _ => false,
    };

    if len + msg_size > config.file_size || rotated_elsewhere || state.wrap_id < newest.wrap_id {
        if config.is_on_msg() {
            let _ = flush_and_sync(state.log.as_mut().unwrap());
        }
        state.log = None;
        if state.wrap_id <= newest.wrap_id && newest.newest_file.is_some() {
            state.wrap_id = newest.wrap_id;
            state.working_file_name = newest.newest_file.clone();
        }
        return open_log_file(state, config, uconfig, dev_path, msg_size, true, false);
    }

    Ok(())
}

/// ON_MSG strategy: one combined write followed by flush and fsync.
pub fn write_on_msg(state: &mut FilterState, d1: &[u8], d2: &[u8], d3: &[u8]) -> io::Result<()> {
    let log = state
        .log
        .as_mut()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no open log file"))?;
    let mut combined = Vec::with_capacity(d1.len() + d2.len() + d3.len());
    combined.extend_from_slice(d1);
    combined.extend_from_slice(d2);
    combined.extend_from_slice(d3);
    log.write_all(&combined)?;
    flush_and_sync(log)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logstorage::config::{FilterKind, SYNC_ON_MSG};
    use crate::protocol::LogLevel;

    fn uconfig_plain() -> UserConfig {
        UserConfig {
            timestamp: false,
            delimiter: '_',
            max_counter: 999,
            counter_idx_len: 3,
            optional_counter: false,
        }
    }

    fn filter(file_name: &str, file_size: u64, num_files: u32) -> FilterConfig {
        FilterConfig {
            kind: FilterKind::Verbose,
            apids: vec!["APP1".into()],
            ctids: vec![".*".into()],
            excluded_apids: Vec::new(),
            excluded_ctids: Vec::new(),
            log_level: LogLevel::Info,
            reset_log_level: None,
            file_name: Some(file_name.into()),
            file_size,
            num_files,
            sync: SYNC_ON_MSG,
            overwrite: OverwriteMode::DiscardOld,
            ecuid: None,
            specific_size: 0,
            disable_network: false,
        }
    }

    #[test]
    fn file_name_forms() {
        let mut uc = uconfig_plain();
        assert_eq!(log_file_name(&uc, "app", 3, 1), "app_001.mct");
        assert_eq!(log_file_name(&uc, "app", 3, 42), "app_042.mct");

        uc.max_counter = u32::MAX;
        assert_eq!(log_file_name(&uc, "app", 3, 7), "app_7.mct");

        uc.optional_counter = true;
        assert_eq!(log_file_name(&uc, "app", 1, 1), "app.mct");
        // More than one file still carries the index.
        assert_eq!(log_file_name(&uc, "app", 2, 1), "app_1.mct");
    }

    #[test]
    fn index_extraction() {
        let uc = uconfig_plain();
        assert_eq!(extract_index(&uc, "app_001.mct", "app"), Some(1));
        assert_eq!(extract_index(&uc, "app_042.mct", "app"), Some(42));
        assert_eq!(extract_index(&uc, "other_001.mct", "app"), None);
        assert_eq!(extract_index(&uc, "app.mct", "app"), None);
    }

    #[test]
    fn rearrange_respects_wrap_boundary() {
        let rec = |idx: u32| FileRecord {
            name: format!("app_{idx:03}.mct"),
            idx,
        };
        let mut records = vec![rec(1), rec(2), rec(7), rec(8)];
        rearrange_around_wrap(&mut records);
        let order: Vec<u32> = records.iter().map(|r| r.idx).collect();
        assert_eq!(order, vec![7, 8, 1, 2]);

        // No gap: nothing to rearrange.
        let mut records = vec![rec(1), rec(2), rec(3)];
        rearrange_around_wrap(&mut records);
        let order: Vec<u32> = records.iter().map(|r| r.idx).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn rotation_discard_old() {
        let dir = tempfile::tempdir().unwrap();
        let uc = uconfig_plain();
        let cfg = filter("app", 1024, 3);
        let mut state = FilterState::default();
        let newest = NewestFileInfo::default();
        let msg = vec![0u8; 1024];

        // Each message fills one file; three writes fill the rotation.
        for _ in 0..3 {
            prepare_on_msg(&mut state, &cfg, &uc, dir.path(), msg.len() as u64, &newest).unwrap();
            write_on_msg(&mut state, &msg, b"", b"").unwrap();
        }

        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, vec!["app_001.mct", "app_002.mct", "app_003.mct"]);

        // The next write opens app_004 and unlinks the oldest.
        prepare_on_msg(&mut state, &cfg, &uc, dir.path(), msg.len() as u64, &newest).unwrap();
        write_on_msg(&mut state, &msg, b"", b"").unwrap();
        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, vec!["app_002.mct", "app_003.mct", "app_004.mct"]);
    }

    #[test]
    fn rotation_discard_new_sets_skip() {
        let dir = tempfile::tempdir().unwrap();
        let uc = uconfig_plain();
        let mut cfg = filter("app", 1024, 2);
        cfg.overwrite = OverwriteMode::DiscardNew;
        let mut state = FilterState::default();
        let newest = NewestFileInfo::default();
        let msg = vec![0u8; 1024];

        for _ in 0..2 {
            prepare_on_msg(&mut state, &cfg, &uc, dir.path(), msg.len() as u64, &newest).unwrap();
            assert!(!state.skip);
            write_on_msg(&mut state, &msg, b"", b"").unwrap();
        }

        prepare_on_msg(&mut state, &cfg, &uc, dir.path(), msg.len() as u64, &newest).unwrap();
        assert!(state.skip);
        let count = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(count, 2);
    }

    #[test]
    fn wrap_deletes_existing_target() {
        let dir = tempfile::tempdir().unwrap();
        let mut uc = uconfig_plain();
        uc.max_counter = 2;
        let cfg = filter("app", 8, 2);
        let mut state = FilterState::default();
        let newest = NewestFileInfo::default();
        let msg = vec![0u8; 8];

        // Fill files 1 and 2, then wrap back to 1.
        for _ in 0..3 {
            prepare_on_msg(&mut state, &cfg, &uc, dir.path(), msg.len() as u64, &newest).unwrap();
            write_on_msg(&mut state, &msg, b"", b"").unwrap();
        }
        assert_eq!(state.wrap_id, 1);
        assert_eq!(state.working_file_name.as_deref(), Some("app_001.mct"));
        // Still two files on disk; the wrap re-entered the rotation.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn subdirectory_file_names() {
        let dir = tempfile::tempdir().unwrap();
        let uc = uconfig_plain();
        let cfg = filter("logs/app", 1024, 2);
        let mut state = FilterState::default();
        let newest = NewestFileInfo::default();

        prepare_on_msg(&mut state, &cfg, &uc, dir.path(), 10, &newest).unwrap();
        write_on_msg(&mut state, b"0123456789", b"", b"").unwrap();
        assert!(dir.path().join("logs/app_001.mct").exists());
        assert_eq!(state.working_file_name.as_deref(), Some("logs/app_001.mct"));
    }
}
