//! Shared memory regions (VMOs) and the per-device VMO table.
//!
//! A [`Vmo`] is an anonymous `MAP_SHARED` mapping. Clones share the same
//! mapping, which is how the data VMO of a session is handed to the device
//! driver without transferring ownership: the client, the session and the
//! driver each hold a handle and the mapping is unmapped when the last one
//! goes away.
//!
//! Every access is bounds-checked. The contents are shared with clients that
//! may rewrite them at any time, so they are only ever treated as bytes.

use std::fmt;
use std::num::NonZeroUsize;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, munmap};
use tracing::warn;

use crate::error::{Error, Result};

/// Maximum number of VMOs registered with one device.
pub const MAX_VMOS: usize = 32;

struct Mapping {
    base: NonNull<u8>,
    len: usize,
}

// Safety: The mapping is plain shared memory and only accessed through the
// bounds-checked copy routines on Vmo.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Drop for Mapping {
    fn drop(&mut self) {
        // Safety: base/len describe a mapping created by Vmo::create that is
        // no longer referenced by any handle.
        if let Err(e) = unsafe { munmap(self.base.cast(), self.len) } {
            warn!(error = %e, len = self.len, "Failed to unmap VMO");
        }
    }
}

/// Handle to a shared memory region.
#[derive(Clone)]
pub struct Vmo {
    mapping: Arc<Mapping>,
}

impl fmt::Debug for Vmo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vmo")
            .field("base", &self.mapping.base)
            .field("len", &self.mapping.len)
            .finish()
    }
}

impl Vmo {
    /// Create a zero-filled region of `size` bytes.
    pub fn create(size: usize) -> Result<Self> {
        let length = NonZeroUsize::new(size).ok_or(Error::InvalidArgs)?;
        // Safety: anonymous mapping with no address hint, nothing aliases it yet.
        let base = unsafe {
            mmap_anonymous(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )?
        };
        Ok(Self {
            mapping: Arc::new(Mapping {
                base: base.cast(),
                len: size,
            }),
        })
    }

    /// Size of the region in bytes.
    pub fn len(&self) -> usize {
        self.mapping.len
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.len == 0
    }

    /// Another handle to the same region.
    pub fn duplicate(&self) -> Vmo {
        self.clone()
    }

    /// Whether both handles refer to the same region.
    pub fn same_object(&self, other: &Vmo) -> bool {
        Arc::ptr_eq(&self.mapping, &other.mapping)
    }

    /// Validate `[offset, offset + len)` and return the start as usize.
    fn range(&self, offset: u64, len: usize) -> Result<usize> {
        let start = usize::try_from(offset).map_err(|_| Error::OutOfRange)?;
        let end = start.checked_add(len).ok_or(Error::OutOfRange)?;
        if end > self.mapping.len {
            return Err(Error::OutOfRange);
        }
        Ok(start)
    }

    /// Check that `[offset, offset + len)` lies inside the region.
    pub fn contains(&self, offset: u64, len: u64) -> bool {
        usize::try_from(len)
            .ok()
            .is_some_and(|len| self.range(offset, len).is_ok())
    }

    /// Copy bytes out of the region.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = self.range(offset, buf.len())?;
        // Safety: range checked above; the region outlives this call.
        unsafe {
            ptr::copy(
                self.mapping.base.as_ptr().add(start),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        Ok(())
    }

    /// Read `len` bytes into a new vector.
    pub fn read_vec(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read(offset, &mut buf)?;
        Ok(buf)
    }

    /// Copy bytes into the region.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let start = self.range(offset, data.len())?;
        // Safety: range checked above; the region outlives this call.
        unsafe {
            ptr::copy(
                data.as_ptr(),
                self.mapping.base.as_ptr().add(start),
                data.len(),
            );
        }
        Ok(())
    }

    /// Copy `len` bytes from `src` at `src_offset` into this region at
    /// `offset`. Both regions may be the same mapping.
    pub fn copy_from(&self, offset: u64, src: &Vmo, src_offset: u64, len: usize) -> Result<()> {
        let dst_start = self.range(offset, len)?;
        let src_start = src.range(src_offset, len)?;
        // Safety: both ranges checked above; ptr::copy tolerates overlap.
        unsafe {
            ptr::copy(
                src.mapping.base.as_ptr().add(src_start),
                self.mapping.base.as_ptr().add(dst_start),
                len,
            );
        }
        Ok(())
    }
}

/// Fixed-size table of VMOs addressed by small integer id.
pub struct VmoStore {
    slots: Vec<Option<Vmo>>,
    count: usize,
}

impl Default for VmoStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VmoStore {
    /// Create an empty store with [`MAX_VMOS`] slots.
    pub fn new() -> Self {
        Self::with_capacity(MAX_VMOS)
    }

    /// Create an empty store with `capacity` slots (at most 256).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.min(usize::from(u8::MAX) + 1);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            count: 0,
        }
    }

    /// Register a VMO, returning its id. Fails with `NoResources` when full.
    pub fn register(&mut self, vmo: Vmo) -> Result<u8> {
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(Error::NoResources)?;
        self.slots[index] = Some(vmo);
        self.count += 1;
        u8::try_from(index).map_err(|_| Error::NoResources)
    }

    /// Remove a VMO from the table, returning the stored handle.
    pub fn unregister(&mut self, id: u8) -> Result<Vmo> {
        let vmo = self
            .slots
            .get_mut(usize::from(id))
            .and_then(Option::take)
            .ok_or(Error::NotFound)?;
        self.count -= 1;
        Ok(vmo)
    }

    /// Look up a registered VMO.
    pub fn get(&self, id: u8) -> Option<&Vmo> {
        self.slots.get(usize::from(id)).and_then(Option::as_ref)
    }

    /// Number of registered VMOs.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}
