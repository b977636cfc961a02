// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use crate::backend::{FileError, OpenFile, WriteCloser};
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Default, Clone)]
struct Record {
    data: String,
    opens: u32,
    closes: u32,
    flags: Option<(OFlag, Mode)>,
}

#[derive(Debug, Default)]
struct Shared {
    files: BTreeMap<PathBuf, Record>,
    fail_open: Option<FileError>,
    fail_write: Option<FileError>,
    fail_close: Option<FileError>,
}

/// File opener keeping written data in memory, per path.
#[derive(Debug, Default, Clone)]
pub struct MemFileOpener {
    shared: Arc<Mutex<Shared>>,
}

/// A file handed out by [`MemFileOpener`].
#[derive(Debug)]
pub struct MemFile {
    path: PathBuf,
    shared: Arc<Mutex<Shared>>,
    closed: bool,
}

impl MemFileOpener {
    pub fn new() -> MemFileOpener {
        MemFileOpener::default()
    }

    pub fn fail_open(&self, err: FileError) {
        self.shared.lock().fail_open = Some(err);
    }

    pub fn fail_write(&self, err: FileError) {
        self.shared.lock().fail_write = Some(err);
    }

    pub fn fail_close(&self, err: FileError) {
        self.shared.lock().fail_close = Some(err);
    }

    /// Everything written to `path` so far.
    pub fn contents(&self, path: impl AsRef<Path>) -> Option<String> {
        self.shared
            .lock()
            .files
            .get(path.as_ref())
            .map(|record| record.data.clone())
    }

    pub fn opens(&self, path: impl AsRef<Path>) -> u32 {
        self.shared
            .lock()
            .files
            .get(path.as_ref())
            .map_or(0, |record| record.opens)
    }

    /// Successful and failed closes alike.
    pub fn closes(&self, path: impl AsRef<Path>) -> u32 {
        self.shared
            .lock()
            .files
            .get(path.as_ref())
            .map_or(0, |record| record.closes)
    }

    /// Flags and mode of the last open of `path`.
    pub fn open_flags(&self, path: impl AsRef<Path>) -> Option<(OFlag, Mode)> {
        self.shared
            .lock()
            .files
            .get(path.as_ref())
            .and_then(|record| record.flags)
    }
}

impl OpenFile for MemFileOpener {
    type File = MemFile;

    fn open(&self, path: &Path, flags: OFlag, mode: Mode) -> Result<MemFile, FileError> {
        let mut shared = self.shared.lock();
        if let Some(err) = shared.fail_open.take() {
            return Err(err);
        }
        let record = shared.files.entry(path.to_path_buf()).or_default();
        record.opens += 1;
        record.flags = Some((flags, mode));
        if flags.contains(OFlag::O_TRUNC) {
            record.data.clear();
        }
        Ok(MemFile {
            path: path.to_path_buf(),
            shared: self.shared.clone(),
            closed: false,
        })
    }
}

impl WriteCloser for MemFile {
    fn write_str(&mut self, data: &str) -> Result<(), FileError> {
        if self.closed {
            return Err(FileError::Closed);
        }
        let mut shared = self.shared.lock();
        if let Some(err) = shared.fail_write.take() {
            return Err(err);
        }
        shared
            .files
            .entry(self.path.clone())
            .or_default()
            .data
            .push_str(data);
        Ok(())
    }

    fn close(&mut self) -> Result<(), FileError> {
        if self.closed {
            return Err(FileError::Closed);
        }
        self.closed = true;
        let mut shared = self.shared.lock();
        shared.files.entry(self.path.clone()).or_default().closes += 1;
        match shared.fail_close.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
