//! Offline trace: a rotated on-disk copy of the client stream.
//!
//! Independent of logstorage devices; a fixed directory receives
//! size-rotated trace files, bounded by a total-size cap that prunes the
//! oldest files.

use log::{debug, warn};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;

const FILE_PREFIX: &str = "mct_offline_trace_";
const FILE_EXTENSION: &str = ".mct";

#[derive(Debug)]
pub struct OfflineTrace {
    dir: PathBuf,
    file_size: u64,
    max_size: u64,
    timestamp_based: bool,
    file: Option<File>,
    cur_size: u64,
    index: u32,
}

impl OfflineTrace {
    pub fn new(
        dir: PathBuf,
        file_size: u64,
        max_size: u64,
        timestamp_based: bool,
    ) -> io::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(OfflineTrace {
            dir,
            file_size,
            max_size,
            timestamp_based,
            file: None,
            cur_size: 0,
            index: 0,
        })
    }

    fn next_file_name(&mut self) -> String {
        if self.timestamp_based {
            format!(
                "{FILE_PREFIX}{}{FILE_EXTENSION}",
                chrono::Local::now().format("%Y%m%d-%H%M%S")
            )
        } else {
            self.index += 1;
            format!("{FILE_PREFIX}{:010}{FILE_EXTENSION}", self.index)
        }
    }

    /// Existing trace files, oldest first (by modification time).
    fn trace_files(&self) -> io::Result<Vec<(PathBuf, u64, std::time::SystemTime)>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(FILE_PREFIX) || !name.ends_with(FILE_EXTENSION) {
                continue;
            }
            let meta = entry.metadata()?;
            files.push((
                entry.path(),
                meta.len(),
                meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH),
            ));
        }
        files.sort_by_key(|(_, _, modified)| *modified);
        Ok(files)
    }

    /// Keep the directory under the total-size cap, oldest files first.
    fn enforce_max_size(&self, incoming: u64) -> io::Result<()> {
        if self.max_size == 0 {
            return Ok(());
        }
        let mut files = self.trace_files()?;
        let mut total: u64 = files.iter().map(|(_, size, _)| size).sum();
        while total + incoming > self.max_size && !files.is_empty() {
            let (path, size, _) = files.remove(0);
            debug!("pruning offline trace file {}", path.display());
            if let Err(err) = std::fs::remove_file(&path) {
                warn!("cannot prune {}: {err}", path.display());
                break;
            }
            total -= size;
        }
        Ok(())
    }

    pub fn write(&mut self, spans: &[&[u8]]) -> io::Result<()> {
        let size: u64 = spans.iter().map(|s| s.len() as u64).sum();

        if self.file.is_none() || self.cur_size + size > self.file_size {
            self.file = None;
            self.enforce_max_size(self.file_size.min(size))?;
            let name = self.next_file_name();
            let path = self.dir.join(name);
            self.file = Some(OpenOptions::new().create(true).append(true).open(&path)?);
            self.cur_size = 0;
        }

        let file = self.file.as_mut().unwrap();
        for span in spans {
            file.write_all(span)?;
        }
        file.flush()?;
        self.cur_size += size;
        Ok(())
    }
}
