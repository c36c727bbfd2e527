//! POSIX shared-memory object lifecycle: create/open, map, close, unlink.

use std::os::fd::AsRawFd;

use memmap2::{MmapMut, MmapOptions};
use rustix::fs::Mode;
use rustix::shm::{self, OFlags};

use framelink_foundation::TransportError;

/// One named block of shared memory, mapped read/write.
///
/// Created once by exactly one process (the creator); opened by every other
/// participant. `close()` only unmaps; `unlink()` destroys the OS object and
/// is only meaningful for the creator. Existing mappings in other processes
/// stay valid after an unlink, per POSIX.
#[derive(Debug)]
pub struct Segment {
    name: String,
    map: Option<MmapMut>,
    len: usize,
    created: bool,
}

impl Segment {
    /// Create the object, size it, and map it. If the object already exists
    /// the call degrades to opening it (idempotent bring-up after a restart);
    /// the caller is expected to validate the existing layout afterwards.
    pub fn create(name: &str, total_size: usize) -> Result<Self, TransportError> {
        match shm::open(
            name,
            OFlags::CREATE | OFlags::EXCL | OFlags::RDWR,
            Mode::from_raw_mode(0o666),
        ) {
            Ok(fd) => {
                if let Err(errno) = rustix::fs::ftruncate(&fd, total_size as u64) {
                    let _ = shm::unlink(name);
                    return Err(TransportError::TruncateFailed {
                        name: name.to_string(),
                        size: total_size,
                        source: errno.into(),
                    });
                }
                let map = Self::map_fd(name, &fd, total_size).inspect_err(|_| {
                    // Don't leave a half-created object behind.
                    let _ = shm::unlink(name);
                })?;
                tracing::info!(name, size = total_size, "created shared memory segment");
                Ok(Self {
                    name: name.to_string(),
                    map: Some(map),
                    len: total_size,
                    created: true,
                })
            }
            Err(rustix::io::Errno::EXIST) => {
                let segment = Self::open(name, total_size)?;
                tracing::info!(name, "opened existing shared memory segment");
                Ok(segment)
            }
            Err(errno) => Err(TransportError::OpenFailed {
                name: name.to_string(),
                source: errno.into(),
            }),
        }
    }

    /// Non-creating open+map, for consumers and late joiners.
    pub fn open(name: &str, total_size: usize) -> Result<Self, TransportError> {
        let fd = shm::open(name, OFlags::RDWR, Mode::empty()).map_err(|errno| {
            TransportError::OpenFailed {
                name: name.to_string(),
                source: errno.into(),
            }
        })?;

        let stat = rustix::fs::fstat(&fd).map_err(|errno| TransportError::OpenFailed {
            name: name.to_string(),
            source: errno.into(),
        })?;
        if (stat.st_size as u64) < total_size as u64 {
            return Err(TransportError::LayoutMismatch(format!(
                "object {name:?} is {} bytes, layout needs {total_size}",
                stat.st_size
            )));
        }

        let map = Self::map_fd(name, &fd, total_size)?;
        Ok(Self {
            name: name.to_string(),
            map: Some(map),
            len: total_size,
            created: false,
        })
    }

    fn map_fd(
        name: &str,
        fd: &impl AsRawFd,
        total_size: usize,
    ) -> Result<MmapMut, TransportError> {
        unsafe { MmapOptions::new().len(total_size).map_mut(fd) }.map_err(|source| {
            TransportError::MapFailed {
                name: name.to_string(),
                source,
            }
        })
    }

    /// Unmap. Idempotent; does not destroy the OS object.
    pub fn close(&mut self) {
        if self.map.take().is_some() {
            tracing::debug!(name = %self.name, "unmapped shared memory segment");
        }
    }

    /// Destroy the OS object. Safe while other processes still have it
    /// mapped; their mappings remain valid until they unmap.
    pub fn unlink(&self) -> Result<(), TransportError> {
        unlink_by_name(&self.name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether this process created the object (as opposed to opening an
    /// existing one).
    pub fn is_creator(&self) -> bool {
        self.created
    }

    pub fn is_mapped(&self) -> bool {
        self.map.is_some()
    }

    /// Base pointer of the mapping. The mapping is shared across processes;
    /// all access above this layer goes through the slot table's atomics and
    /// claim protocol.
    pub(crate) fn base_ptr(&self) -> Option<*mut u8> {
        self.map.as_ref().map(|m| m.as_ptr() as *mut u8)
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        self.close();
    }
}

/// Remove a shared memory object by name without mapping it. Used for crash
/// cleanup of stale segments before creating a fresh one.
pub fn unlink_by_name(name: &str) -> Result<(), TransportError> {
    shm::unlink(name).map_err(|errno| TransportError::UnlinkFailed {
        name: name.to_string(),
        source: errno.into(),
    })?;
    tracing::info!(name, "unlinked shared memory segment");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static NEXT_NAME: AtomicU32 = AtomicU32::new(0);

    fn unique_name() -> String {
        let id = NEXT_NAME.fetch_add(1, Ordering::Relaxed);
        format!("/framelink-seg-{}-{}", std::process::id(), id)
    }

    #[test]
    fn create_map_and_reopen_shares_bytes() {
        let name = unique_name();
        let mut creator = Segment::create(&name, 4096).unwrap();
        assert!(creator.is_creator());
        assert!(creator.is_mapped());
        assert_eq!(creator.len(), 4096);

        unsafe { *creator.base_ptr().unwrap() = 0xa5 };

        let opener = Segment::open(&name, 4096).unwrap();
        assert!(!opener.is_creator());
        assert_eq!(unsafe { *opener.base_ptr().unwrap() }, 0xa5);

        creator.unlink().unwrap();
        creator.close();
        assert!(!creator.is_mapped());
        creator.close();

        assert!(matches!(
            Segment::open(&name, 4096),
            Err(TransportError::OpenFailed { .. })
        ));
    }

    #[test]
    fn open_rejects_undersized_object() {
        let name = unique_name();
        let creator = Segment::create(&name, 1024).unwrap();
        let err = Segment::open(&name, 4096).unwrap_err();
        assert!(matches!(err, TransportError::LayoutMismatch(_)));
        creator.unlink().unwrap();
    }
}
