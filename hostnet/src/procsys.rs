// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Scoped writes to `/proc/sys`.

use crate::backend::{FileError, OpenFile, WriteCloser};
use crate::errors::NetworkError;
use net::interface::InterfaceName;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// Loose reverse path filtering: accept a packet if its source is reachable through any
/// interface.
pub const RP_FILTER_LOOSE: &str = "2";

/// Where the reverse path filter of `interface` lives.
#[must_use]
pub fn rp_filter_path(interface: &InterfaceName) -> PathBuf {
    Path::new("/proc/sys/net/ipv4/conf")
        .join(interface.as_ref())
        .join("rp_filter")
}

/// An open file which is closed exactly once.
///
/// The file is closed on drop unless [`ScopedFile::close`] already did.
/// Any use after the close is reported as [`NetworkError::ResourceLifecycle`].
pub struct ScopedFile<F: WriteCloser> {
    path: PathBuf,
    file: Option<F>,
}

impl<F: WriteCloser> ScopedFile<F> {
    /// # Errors
    ///
    /// [`NetworkError::ProcSys`] if the file cannot be opened.
    pub fn open<O>(opener: &O, path: &Path, flags: OFlag, mode: Mode) -> Result<Self, NetworkError>
    where
        O: OpenFile<File = F> + ?Sized,
    {
        let file = opener
            .open(path, flags, mode)
            .map_err(|source| NetworkError::ProcSys {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(ScopedFile {
            path: path.to_path_buf(),
            file: Some(file),
        })
    }

    fn lift(&self, source: FileError) -> NetworkError {
        match source {
            FileError::Closed => NetworkError::ResourceLifecycle {
                path: self.path.clone(),
            },
            source => NetworkError::ProcSys {
                path: self.path.clone(),
                source,
            },
        }
    }

    /// # Errors
    ///
    /// [`NetworkError::ResourceLifecycle`] after [`ScopedFile::close`],
    /// [`NetworkError::ProcSys`] if the write fails.
    pub fn write_str(&mut self, data: &str) -> Result<(), NetworkError> {
        let result = match self.file.as_mut() {
            Some(file) => file.write_str(data),
            None => Err(FileError::Closed),
        };
        result.map_err(|e| self.lift(e))
    }

    /// Release the file.
    ///
    /// The file counts as released even when closing it fails.
    ///
    /// # Errors
    ///
    /// [`NetworkError::ResourceLifecycle`] on a second close,
    /// [`NetworkError::ProcSys`] if the close fails.
    pub fn close(&mut self) -> Result<(), NetworkError> {
        let result = match self.file.take() {
            Some(mut file) => file.close(),
            None => Err(FileError::Closed),
        };
        result.map_err(|e| self.lift(e))
    }
}

impl<F: WriteCloser> Drop for ScopedFile<F> {
    fn drop(&mut self) {
        if let Some(mut file) = self.file.take() {
            if let Err(e) = file.close() {
                error!("failed to close {}: {e}", self.path.display());
            }
        }
    }
}

/// Switch `interface` to loose reverse path filtering.
///
/// Return traffic of node port connections can arrive on the primary interface while the
/// route back to the client points elsewhere; strict filtering would drop it.
///
/// # Errors
///
/// [`NetworkError::ProcSys`] if the file cannot be opened, written or closed.
/// A failed write wins over a failed close; the file is closed either way.
#[tracing::instrument(level = "debug", skip(opener))]
pub fn set_loose_rp_filter<O: OpenFile + ?Sized>(
    opener: &O,
    interface: &InterfaceName,
) -> Result<(), NetworkError> {
    let path = rp_filter_path(interface);
    let mut file = ScopedFile::open(opener, &path, OFlag::O_WRONLY, Mode::from_bits_truncate(0o644))?;
    let written = file.write_str(RP_FILTER_LOOSE);
    let closed = file.close();
    written?;
    closed?;
    info!("set {} to {RP_FILTER_LOOSE}", path.display());
    debug!("loose reverse path filtering active on {interface}");
    Ok(())
}

#[cfg(test)]
mod test {
    use crate::backend::{FileError, OpenFile};
    use crate::errors::NetworkError;
    use crate::procsys::{ScopedFile, rp_filter_path, set_loose_rp_filter};
    use crate::testing::MemFileOpener;
    use net::interface::InterfaceName;
    use nix::fcntl::OFlag;
    use nix::sys::stat::Mode;
    use std::path::Path;
    use tracing_test::traced_test;

    fn eth0() -> InterfaceName {
        InterfaceName::try_from("eth0").unwrap()
    }

    #[test]
    fn writes_loose_mode_and_closes_once() {
        let opener = MemFileOpener::new();
        set_loose_rp_filter(&opener, &eth0()).unwrap();
        let path = rp_filter_path(&eth0());
        assert_eq!(path, Path::new("/proc/sys/net/ipv4/conf/eth0/rp_filter"));
        assert_eq!(opener.contents(&path).as_deref(), Some("2"));
        assert_eq!(opener.opens(&path), 1);
        assert_eq!(opener.closes(&path), 1);
        assert_eq!(
            opener.open_flags(&path),
            Some((OFlag::O_WRONLY, Mode::from_bits_truncate(0o644)))
        );
    }

    #[test]
    fn write_failure_still_closes() {
        let opener = MemFileOpener::new();
        opener.fail_write(FileError::Write("no space left on device".into()));
        let err = set_loose_rp_filter(&opener, &eth0()).unwrap_err();
        assert!(matches!(
            err,
            NetworkError::ProcSys {
                source: FileError::Write(_),
                ..
            }
        ));
        assert_eq!(opener.closes(rp_filter_path(&eth0())), 1);
    }

    #[test]
    fn write_failure_wins_over_close_failure() {
        let opener = MemFileOpener::new();
        opener.fail_write(FileError::Write("io error".into()));
        opener.fail_close(FileError::Close("io error".into()));
        let err = set_loose_rp_filter(&opener, &eth0()).unwrap_err();
        assert!(matches!(
            err,
            NetworkError::ProcSys {
                source: FileError::Write(_),
                ..
            }
        ));
    }

    #[test]
    fn close_failure_is_fatal() {
        let opener = MemFileOpener::new();
        opener.fail_close(FileError::Close("io error".into()));
        let err = set_loose_rp_filter(&opener, &eth0()).unwrap_err();
        assert!(matches!(
            err,
            NetworkError::ProcSys {
                source: FileError::Close(_),
                ..
            }
        ));
    }

    #[test]
    fn open_failure_is_fatal() {
        let opener = MemFileOpener::new();
        opener.fail_open(FileError::Open("permission denied".into()));
        assert!(matches!(
            set_loose_rp_filter(&opener, &eth0()),
            Err(NetworkError::ProcSys {
                source: FileError::Open(_),
                ..
            })
        ));
        assert_eq!(opener.closes(rp_filter_path(&eth0())), 0);
    }

    #[test]
    fn use_after_close_is_a_lifecycle_error() {
        let opener = MemFileOpener::new();
        let path = Path::new("/proc/sys/net/ipv4/ip_forward");
        let mut file = ScopedFile::open(&opener, path, OFlag::O_WRONLY, Mode::empty()).unwrap();
        file.write_str("1").unwrap();
        file.close().unwrap();
        assert!(matches!(
            file.write_str("1"),
            Err(NetworkError::ResourceLifecycle { .. })
        ));
        assert!(matches!(
            file.close(),
            Err(NetworkError::ResourceLifecycle { .. })
        ));
        drop(file);
        assert_eq!(opener.closes(path), 1);
        assert_eq!(opener.contents(path).as_deref(), Some("1"));
    }

    #[test]
    #[traced_test]
    fn dropped_file_is_closed() {
        let opener = MemFileOpener::new();
        let path = Path::new("/proc/sys/net/ipv4/ip_forward");
        {
            let mut file =
                ScopedFile::open(&opener, path, OFlag::O_WRONLY, Mode::empty()).unwrap();
            file.write_str("1").unwrap();
        }
        assert_eq!(opener.closes(path), 1);

        opener.fail_close(FileError::Close("io error".into()));
        {
            let _file = ScopedFile::<<MemFileOpener as OpenFile>::File>::open(
                &opener,
                path,
                OFlag::O_WRONLY,
                Mode::empty(),
            )
            .unwrap();
        }
        assert_eq!(opener.closes(path), 2);
        assert!(logs_contain("failed to close /proc/sys/net/ipv4/ip_forward"));
    }
}
