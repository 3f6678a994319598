//! Named POSIX shared memory holding exactly one I420 frame.
//!
//! The frame bytes live in `<name>`, the out-of-band metadata (publish
//! timestamp and sequence) in `<name>.meta`. Writers hold the in-process
//! mutex and an exclusive `flock` on the frame region for the whole write.
//! Publishing never waits for the lock; a busy slot is reported to the
//! caller, which retries on its own schedule.

use std::fs::File;
use std::sync::{Condvar, Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

use memmap2::{MmapMut, MmapOptions};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg, OFlag};
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use thiserror::Error;
use tracing::{debug, info};

use crate::source::{PlanarFrame, Timestamp};

/// timestamp (i64 LE, µs since epoch) followed by the publish sequence (u64 LE)
pub const META_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("shared memory name must not be empty")]
    EmptyName,
    #[error("cannot create a zero sized shared memory region")]
    ZeroSize,
    #[error("failed to open shared memory '{name}': {source}")]
    Open {
        name: String,
        #[source]
        source: Errno,
    },
    #[error("shared memory '{name}' already exists with {existing} bytes, {requested} requested")]
    SizeConflict {
        name: String,
        existing: u64,
        requested: usize,
    },
    #[error("frame of {actual} bytes does not fit the {expected} byte channel")]
    FrameSize { expected: usize, actual: usize },
    #[error("failed to lock shared memory: {0}")]
    Lock(Errno),
    #[error("shared memory stayed locked by another party for {0:?}")]
    Busy(Duration),
    #[error("shared memory state poisoned by a panicked writer")]
    Poisoned,
    #[error("shared memory I/O: {0}")]
    Io(#[from] std::io::Error),
}

struct Regions {
    data: MmapMut,
    meta: MmapMut,
}

impl Regions {
    fn timestamp(&self) -> Timestamp {
        Timestamp(i64::from_le_bytes(read8(&self.meta[..8])))
    }

    fn sequence(&self) -> u64 {
        u64::from_le_bytes(read8(&self.meta[8..16]))
    }
}

fn read8(bytes: &[u8]) -> [u8; 8] {
    let mut out = [0; 8];
    out.copy_from_slice(&bytes[..8]);
    out
}

/// Shared frame slot. The creating side owns the names and unlinks them on
/// drop; attached consumers only map them.
pub struct SharedFrameChannel {
    name: String,
    size: usize,
    owner: bool,
    regions: Mutex<Regions>,
    notified: Condvar,
    lock_file: File,
}

impl SharedFrameChannel {
    /// Create (or reopen a compatible) named region of `size` bytes
    pub fn create(name: &str, size: usize) -> Result<Self, ChannelError> {
        if size == 0 {
            return Err(ChannelError::ZeroSize);
        }
        let name = normalize(name)?;
        let (data, created) = create_region(&name, size)?;
        let meta = match create_region(&meta_name(&name), META_LEN) {
            Ok((meta, _)) => meta,
            Err(e) => {
                // Leave a region someone else created alone
                if created {
                    let _ = shm_unlink(name.as_str());
                }
                return Err(e);
            }
        };
        let channel = Self::map(name, size, data, meta, true)?;
        info!(
            "Created shared memory '{}' of size {}",
            channel.name, channel.size
        );
        Ok(channel)
    }

    /// Map a region some other party created
    pub fn attach(name: &str) -> Result<Self, ChannelError> {
        let name = normalize(name)?;
        let data = open_region(&name)?;
        let size = usize::try_from(data.metadata()?.len()).unwrap_or(0);
        if size == 0 {
            return Err(ChannelError::ZeroSize);
        }
        let meta = open_region(&meta_name(&name))?;
        Self::map(name, size, data, meta, false)
    }

    fn map(
        name: String,
        size: usize,
        data: File,
        meta: File,
        owner: bool,
    ) -> Result<Self, ChannelError> {
        // SAFETY: both files are shared memory objects sized above; the
        // mappings are only touched through `Regions` under the mutex.
        let data_map = unsafe { MmapOptions::new().len(size).map_mut(&data)? };
        let meta_map = unsafe { MmapOptions::new().len(META_LEN).map_mut(&meta)? };
        Ok(Self {
            name,
            size,
            owner,
            regions: Mutex::new(Regions {
                data: data_map,
                meta: meta_map,
            }),
            notified: Condvar::new(),
            lock_file: data,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Exclusive access to the slot; released when the guard drops.
    /// Blocks until every other holder lets go.
    pub fn acquire_exclusive(&self) -> Result<ExclusiveAccess<'_>, ChannelError> {
        let regions = self.regions.lock().map_err(|_| ChannelError::Poisoned)?;
        let flock = Flock::lock(self.lock_file.try_clone()?, FlockArg::LockExclusive)
            .map_err(|(_, errno)| ChannelError::Lock(errno))?;
        Ok(ExclusiveAccess {
            _flock: flock,
            regions,
        })
    }

    /// Like [`Self::acquire_exclusive`], but `None` while someone else
    /// holds the slot
    pub fn try_acquire_exclusive(&self) -> Result<Option<ExclusiveAccess<'_>>, ChannelError> {
        let regions = match self.regions.try_lock() {
            Ok(regions) => regions,
            Err(TryLockError::WouldBlock) => return Ok(None),
            Err(TryLockError::Poisoned(_)) => return Err(ChannelError::Poisoned),
        };
        match Flock::lock(self.lock_file.try_clone()?, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => Ok(Some(ExclusiveAccess {
                _flock: flock,
                regions,
            })),
            Err((_, Errno::EWOULDBLOCK)) => Ok(None),
            Err((_, errno)) => Err(ChannelError::Lock(errno)),
        }
    }

    /// Write `frame`, stamp it, then wake consumers. `None` if the slot is
    /// currently held elsewhere; nothing was written in that case.
    pub fn try_publish(&self, frame: &PlanarFrame) -> Result<Option<Published>, ChannelError> {
        if frame.len() != self.size {
            return Err(ChannelError::FrameSize {
                expected: self.size,
                actual: frame.len(),
            });
        }
        let published = {
            let Some(mut slot) = self.try_acquire_exclusive()? else {
                return Ok(None);
            };
            slot.bytes_mut().copy_from_slice(frame.as_bytes());
            let timestamp = Timestamp::now();
            slot.set_timestamp(timestamp);
            Published {
                sequence: slot.advance_sequence(),
                timestamp,
            }
        };
        self.notify();
        debug!("Published frame #{} at {}", published.sequence, published.timestamp);
        Ok(Some(published))
    }

    /// Wake consumers blocked in [`Self::wait_for_notification`]
    pub fn notify(&self) {
        self.notified.notify_all();
    }

    pub fn sequence(&self) -> Result<u64, ChannelError> {
        let regions = self.regions.lock().map_err(|_| ChannelError::Poisoned)?;
        Ok(regions.sequence())
    }

    /// Block until the publish sequence moves past `last_seen`. Works for
    /// attached consumers too, which only see the sequence change.
    pub fn wait_for_notification(
        &self,
        last_seen: u64,
        timeout: Duration,
    ) -> Result<Option<u64>, ChannelError> {
        let deadline = Instant::now() + timeout;
        let mut regions = self.regions.lock().map_err(|_| ChannelError::Poisoned)?;
        loop {
            let sequence = regions.sequence();
            if sequence > last_seen {
                return Ok(Some(sequence));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let slice = (deadline - now).min(Duration::from_millis(1));
            regions = self
                .notified
                .wait_timeout(regions, slice)
                .map_err(|_| ChannelError::Poisoned)?
                .0;
        }
    }

    /// Copy the current slot contents out under exclusive access
    pub fn read(&self, width: u32, height: u32) -> Result<(PlanarFrame, Timestamp), ChannelError> {
        let slot = self.acquire_exclusive()?;
        let frame = PlanarFrame::from_bytes(width, height, slot.bytes().to_vec()).map_err(|_| {
            ChannelError::FrameSize {
                expected: self.size,
                actual: width as usize * height as usize * 3 / 2,
            }
        })?;
        Ok((frame, slot.timestamp()))
    }
}

impl Drop for SharedFrameChannel {
    fn drop(&mut self) {
        if self.owner {
            for name in [self.name.clone(), meta_name(&self.name)] {
                if let Err(e) = shm_unlink(name.as_str()) {
                    debug!("Failed to unlink shared memory '{}': {}", name, e);
                }
            }
        }
    }
}

/// A frame that made it into the slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Published {
    pub sequence: u64,
    /// Taken once the bytes were in place
    pub timestamp: Timestamp,
}

/// Held while writing or reading the slot
pub struct ExclusiveAccess<'a> {
    _flock: Flock<File>,
    regions: MutexGuard<'a, Regions>,
}

impl ExclusiveAccess<'_> {
    pub fn bytes(&self) -> &[u8] {
        &self.regions.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.regions.data
    }

    pub fn timestamp(&self) -> Timestamp {
        self.regions.timestamp()
    }

    pub fn set_timestamp(&mut self, timestamp: Timestamp) {
        self.regions.meta[..8].copy_from_slice(&timestamp.as_micros().to_le_bytes());
    }

    fn advance_sequence(&mut self) -> u64 {
        let next = self.regions.sequence().wrapping_add(1);
        self.regions.meta[8..16].copy_from_slice(&next.to_le_bytes());
        next
    }
}

fn normalize(name: &str) -> Result<String, ChannelError> {
    let trimmed = name.trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(ChannelError::EmptyName);
    }
    Ok(format!("/{trimmed}"))
}

fn meta_name(name: &str) -> String {
    format!("{name}.meta")
}

const MODE: Mode = Mode::S_IRUSR
    .union(Mode::S_IWUSR)
    .union(Mode::S_IRGRP)
    .union(Mode::S_IWGRP);

fn open_region(name: &str) -> Result<File, ChannelError> {
    let fd = shm_open(name, OFlag::O_RDWR, MODE).map_err(|source| ChannelError::Open {
        name: name.to_string(),
        source,
    })?;
    Ok(File::from(fd))
}

/// Open `name` with `size` bytes, creating it if needed. The flag tells
/// whether this call created the region.
fn create_region(name: &str, size: usize) -> Result<(File, bool), ChannelError> {
    let (file, created) = match shm_open(name, OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR, MODE) {
        Ok(fd) => (File::from(fd), true),
        Err(Errno::EEXIST) => (open_region(name)?, false),
        Err(source) => {
            return Err(ChannelError::Open {
                name: name.to_string(),
                source,
            })
        }
    };

    let existing = file.metadata()?.len();
    if existing == 0 {
        if let Err(e) = file.set_len(size as u64) {
            if created {
                let _ = shm_unlink(name);
            }
            return Err(e.into());
        }
    } else if existing != size as u64 {
        return Err(ChannelError::SizeConflict {
            name: name.to_string(),
            existing,
            requested: size,
        });
    }
    Ok((file, created))
}
