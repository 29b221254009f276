//! Named POSIX shared-memory segment with grow-only resizing.
//!
//! The control channel only carries a length, so each side grows the segment on its
//! own when it writes a larger payload, and each side must notice growth made by the
//! peer before reading. Every access therefore starts by comparing the kernel object's
//! size with the local mapping and remapping when they differ.
//!
//! There is no locking on the segment itself. At most one process touches the bytes
//! at a time because the host and worker strictly alternate through the control
//! channel: whoever last received a token owns the segment until it sends one.
//!
//! Capacity never shrinks while connected; a peer may still be about to read bytes
//! beyond whatever size this side needs.

use std::ffi::c_void;
use std::fs::File;
use std::io;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap, shm_open, shm_unlink};
use nix::sys::stat::Mode;
use nix::unistd::{SysconfVar, sysconf};

use crate::error::{IpcError, ObjectKind, Result};

/// Lower bound for a freshly created segment, before page rounding.
pub const MIN_SEGMENT_SIZE: usize = 512;

const FALLBACK_PAGE_SIZE: usize = 4096;

/// The platform's mapping granularity.
pub fn page_size() -> usize {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as usize,
        _ => FALLBACK_PAGE_SIZE,
    }
}

/// Smallest multiple of `page` that is `>= len`, or `None` if that does not fit in `usize`.
pub fn round_up_to_page(len: usize, page: usize) -> Option<usize> {
    len.checked_next_multiple_of(page)
}

fn too_large(op: &'static str, name: &str, len: usize) -> IpcError {
    IpcError::io(
        op,
        name,
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{len} bytes cannot be rounded up to a whole page"),
        ),
    )
}

/// An owned `MAP_SHARED` view of the first `len` bytes of a segment.
///
/// Remapping never mutates a `Mapping`: a new one is created and the old one is
/// dropped, which unmaps it.
struct Mapping {
    ptr: NonNull<c_void>,
    len: NonZeroUsize,
}

// SAFETY: the mapping is plain shared memory owned by this value; nothing about it
// is tied to the thread that created it.
unsafe impl Send for Mapping {}

impl Mapping {
    fn new(file: &File, len: NonZeroUsize) -> io::Result<Self> {
        // SAFETY: we map a fresh region chosen by the kernel (no fixed address), so no
        // existing Rust allocation is aliased. The region stays valid until munmap in
        // unmap()/drop, and all access goes through slices bounded by `len`.
        let ptr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                file,
                0,
            )
        }?;
        Ok(Self { ptr, len })
    }

    fn len(&self) -> usize {
        self.len.get()
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr..ptr+len is a live mapping owned by self (see Mapping::new).
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().cast::<u8>(), self.len.get()) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as in as_slice; &mut self guarantees no other local borrow.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr().cast::<u8>(), self.len.get()) }
    }

    /// Unmap now, reporting failure instead of only logging it.
    fn unmap(self) -> io::Result<()> {
        let this = std::mem::ManuallyDrop::new(self);
        // SAFETY: the region was returned by mmap with this exact length and is not
        // referenced after this call; ManuallyDrop prevents a second munmap in drop.
        unsafe { munmap(this.ptr, this.len.get()) }.map_err(io::Error::from)
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: see Mapping::unmap.
        if let Err(e) = unsafe { munmap(self.ptr, self.len.get()) } {
            tracing::warn!(error = %e, "Failed to unmap shared memory");
        }
    }
}

/// State that only exists while connected.
struct Attached {
    name: String,
    file: File,
    /// Size of the kernel object as last observed or set by us.
    capacity: usize,
    mapping: Mapping,
}

impl Attached {
    fn object_size(&self, op: &'static str) -> Result<usize> {
        let len = self
            .file
            .metadata()
            .map_err(|e| IpcError::io(op, &self.name, e))?
            .len();
        usize::try_from(len).map_err(|_| {
            IpcError::io(
                op,
                &self.name,
                io::Error::new(io::ErrorKind::InvalidData, "segment size exceeds address space"),
            )
        })
    }

    /// Replace the mapping so it covers `size` bytes.
    fn remap(&mut self, op: &'static str, size: usize) -> Result<()> {
        let len = NonZeroUsize::new(size).ok_or_else(|| {
            IpcError::io(
                op,
                &self.name,
                io::Error::new(io::ErrorKind::UnexpectedEof, "segment has zero size"),
            )
        })?;
        let mapping = Mapping::new(&self.file, len).map_err(|e| IpcError::io(op, &self.name, e))?;
        tracing::debug!(
            name = %self.name,
            old_bytes = self.mapping.len(),
            new_bytes = size,
            "Shared memory remapped"
        );
        self.mapping = mapping;
        self.capacity = size;
        Ok(())
    }

    /// Bring the mapping in line with the kernel object after a peer resized it.
    ///
    /// Growth is adopted (rounded up to a page). An object found smaller than our
    /// capacity is grown back, so capacity never decreases.
    fn sync(&mut self, op: &'static str, page_size: usize) -> Result<()> {
        let size = self.object_size(op)?;
        if size == self.mapping.len() {
            return Ok(());
        }

        let target = round_up_to_page(size, page_size)
            .ok_or_else(|| too_large(op, &self.name, size))?
            .max(self.capacity);
        if target != size {
            if size < self.capacity {
                tracing::warn!(
                    name = %self.name,
                    bytes = size,
                    capacity = self.capacity,
                    "Shared memory shrank externally, restoring capacity"
                );
            }
            self.file
                .set_len(target as u64)
                .map_err(|e| IpcError::io(op, &self.name, e))?;
        }
        if target != self.mapping.len() {
            self.remap(op, target)?;
        }
        Ok(())
    }
}

/// Process-local handle on a named shared-memory segment.
pub struct SharedSegment {
    page_size: usize,
    min_size: usize,
    attached: Option<Attached>,
}

impl Default for SharedSegment {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedSegment {
    pub fn new() -> Self {
        Self::with_min_size(MIN_SEGMENT_SIZE)
    }

    pub fn with_min_size(min_size: usize) -> Self {
        Self {
            page_size: page_size(),
            min_size,
            attached: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.attached.is_some()
    }

    pub fn name(&self) -> Option<&str> {
        self.attached.as_ref().map(|a| a.name.as_str())
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Current capacity in bytes, 0 when disconnected.
    pub fn capacity(&self) -> usize {
        self.attached.as_ref().map_or(0, |a| a.capacity)
    }

    /// Bytes covered by the local mapping, 0 when disconnected.
    pub fn mapped_size(&self) -> usize {
        self.attached.as_ref().map_or(0, |a| a.mapping.len())
    }

    /// Open or create the segment and map it.
    ///
    /// On failure the handle stays disconnected.
    pub fn connect(&mut self, name: &str) -> Result<()> {
        if let Some(attached) = &self.attached {
            if attached.name == name {
                return Ok(());
            }
            return Err(IpcError::config(format!(
                "segment handle already connected to '{}'",
                attached.name
            )));
        }

        let initial = round_up_to_page(self.min_size.max(1), self.page_size).ok_or_else(|| {
            IpcError::config(format!(
                "minimum segment size {} cannot be rounded up to a whole page",
                self.min_size
            ))
        })?;

        let fd = shm_open(name, OFlag::O_CREAT | OFlag::O_RDWR, Mode::S_IRUSR | Mode::S_IWUSR)
            .map_err(|e| IpcError::resource(ObjectKind::Segment, name, e))?;
        let file = File::from(fd);

        let existing = file
            .metadata()
            .map_err(|e| IpcError::resource(ObjectKind::Segment, name, e))?
            .len();
        let rounded = usize::try_from(existing)
            .ok()
            .and_then(|len| round_up_to_page(len, self.page_size))
            .ok_or_else(|| {
                IpcError::resource(
                    ObjectKind::Segment,
                    name,
                    io::Error::new(io::ErrorKind::InvalidData, "segment size exceeds address space"),
                )
            })?;

        // Adopt a larger object left by a peer, rounded to a page; never shrink it.
        let capacity = rounded.max(initial);
        if existing != capacity as u64 {
            file.set_len(capacity as u64)
                .map_err(|e| IpcError::resource(ObjectKind::Segment, name, e))?;
        }

        let len = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        let mapping =
            Mapping::new(&file, len).map_err(|e| IpcError::resource(ObjectKind::Segment, name, e))?;

        tracing::info!(name, capacity, "Shared memory connected");
        self.attached = Some(Attached {
            name: name.to_string(),
            file,
            capacity,
            mapping,
        });
        Ok(())
    }

    fn attached_mut(&mut self, op: &'static str) -> Result<&mut Attached> {
        self.attached.as_mut().ok_or_else(|| {
            IpcError::io(
                op,
                "<disconnected>",
                io::Error::new(io::ErrorKind::NotConnected, "segment is not connected"),
            )
        })
    }

    /// Grow the segment so it holds at least `min_bytes`. Returns the new capacity.
    pub fn ensure_capacity(&mut self, min_bytes: usize) -> Result<usize> {
        let page_size = self.page_size;
        let attached = self.attached_mut("resize")?;
        attached.sync("resize", page_size)?;

        let required = round_up_to_page(min_bytes, page_size)
            .ok_or_else(|| too_large("resize", &attached.name, min_bytes))?;
        if required > attached.capacity {
            tracing::info!(
                name = %attached.name,
                from = attached.capacity,
                to = required,
                "Shared memory resize"
            );
            attached
                .file
                .set_len(required as u64)
                .map_err(|e| IpcError::io("resize", &attached.name, e))?;
            attached.remap("resize", required)?;
        }
        Ok(attached.capacity)
    }

    /// Overwrite the segment from offset 0 with `bytes`, growing it if needed.
    pub fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        self.ensure_capacity(bytes.len())?;
        let attached = self.attached_mut("write")?;
        attached.mapping.as_mut_slice()[..bytes.len()].copy_from_slice(bytes);
        tracing::debug!(name = %attached.name, bytes = bytes.len(), "Shared memory write");
        Ok(bytes.len())
    }

    /// Read exactly `length` bytes from offset 0.
    pub fn read(&mut self, length: usize) -> Result<Vec<u8>> {
        let page_size = self.page_size;
        let attached = self.attached_mut("read")?;
        attached.sync("read", page_size)?;

        let available = attached.mapping.len();
        if length > available {
            return Err(IpcError::io(
                "read",
                &attached.name,
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("requested {length} bytes but segment holds {available}"),
                ),
            ));
        }

        let payload = attached.mapping.as_slice()[..length].to_vec();
        tracing::debug!(name = %attached.name, bytes = length, "Shared memory read");
        Ok(payload)
    }

    /// Unmap and close; with `should_unlink` also remove the name from the system.
    ///
    /// Calling this on a disconnected handle succeeds without doing anything.
    pub fn disconnect(&mut self, should_unlink: bool) -> Result<()> {
        let Some(attached) = self.attached.take() else {
            return Ok(());
        };
        let Attached {
            name,
            file,
            mapping,
            ..
        } = attached;

        let unmapped = mapping
            .unmap()
            .map_err(|e| IpcError::io("unmap", &name, e));
        drop(file);

        let unlinked = if should_unlink {
            match shm_unlink(name.as_str()) {
                Ok(()) => Ok(()),
                Err(Errno::ENOENT) => {
                    tracing::debug!(name = %name, "Shared memory already unlinked");
                    Ok(())
                }
                Err(e) => Err(IpcError::io("unlink", &name, e)),
            }
        } else {
            Ok(())
        };

        tracing::info!(name = %name, unlink = should_unlink, "Shared memory disconnected");
        unmapped.and(unlinked)
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect(false) {
            tracing::warn!(error = %e, "Failed to release shared memory on drop");
        }
    }
}
