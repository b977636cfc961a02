// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use crate::backend::{FileError, OpenFile, WriteCloser};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use std::os::fd::OwnedFd;
use std::path::Path;

/// Opens files with `open(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsFileOpener;

/// A file descriptor opened by [`OsFileOpener`].
#[derive(Debug)]
pub struct OsFile {
    fd: Option<OwnedFd>,
}

impl OpenFile for OsFileOpener {
    type File = OsFile;

    fn open(&self, path: &Path, flags: OFlag, mode: Mode) -> Result<OsFile, FileError> {
        let fd = nix::fcntl::open(path, flags, mode)
            .map_err(|e| FileError::Open(format!("{}: {e}", path.display())))?;
        Ok(OsFile { fd: Some(fd) })
    }
}

impl WriteCloser for OsFile {
    fn write_str(&mut self, data: &str) -> Result<(), FileError> {
        let fd = self.fd.as_ref().ok_or(FileError::Closed)?;
        let bytes = data.as_bytes();
        let mut written = 0;
        while written < bytes.len() {
            match nix::unistd::write(fd, &bytes[written..]) {
                Ok(n) => written += n,
                Err(Errno::EINTR) => {}
                Err(e) => return Err(FileError::Write(e.to_string())),
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), FileError> {
        let fd = self.fd.take().ok_or(FileError::Closed)?;
        nix::unistd::close(fd).map_err(|e| FileError::Close(e.to_string()))
    }
}
