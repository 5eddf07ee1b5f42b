//! Growable record arena with a free list and optional mapped backing.
//!
//! Slot 0 is a permanent sentinel: it is created with the first real
//! allocation and never handed out, so a packed child value of 0 can mean
//! "empty". Freed indices go on a LIFO stack and are reused before the
//! array grows.

use crate::constants::ARENA_INITIAL_SLOTS;
use crate::errors::Error;
use crate::types::{Record, LEAF_TAG};
use log::debug;
use memmap2::Mmap;
use metrics::counter;
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Read-only view of records inside a mapped file.
pub struct MappedRegion<T> {
    map: Arc<Mmap>,
    offset: usize,
    len: usize,
    _marker: PhantomData<T>,
}

impl<T> Clone for MappedRegion<T> {
    fn clone(&self) -> Self {
        MappedRegion {
            map: Arc::clone(&self.map),
            offset: self.offset,
            len: self.len,
            _marker: PhantomData,
        }
    }
}

impl<T: Record> MappedRegion<T> {
    /// View `len` records at byte `offset`; `None` if out of bounds or misaligned.
    pub fn new(map: Arc<Mmap>, offset: usize, len: usize) -> Option<Self> {
        let bytes = len.checked_mul(size_of::<T>())?;
        let end = offset.checked_add(bytes)?;
        if end > map.len() {
            return None;
        }
        let addr = map.as_ptr() as usize + offset;
        if addr % align_of::<T>() != 0 {
            return None;
        }
        Some(MappedRegion {
            map,
            offset,
            len,
            _marker: PhantomData,
        })
    }

    pub fn as_slice(&self) -> &[T] {
        if self.len == 0 {
            return &[];
        }
        // SAFETY: bounds and alignment checked in `new`; `Record` types
        // accept any bit pattern and the map is never written through.
        unsafe {
            std::slice::from_raw_parts(self.map.as_ptr().add(self.offset) as *const T, self.len)
        }
    }
}

#[derive(Clone)]
pub enum Storage<T> {
    Owned(Vec<T>),
    Mapped(MappedRegion<T>),
}

#[derive(Clone)]
pub struct ArenaBuffer<T> {
    storage: Storage<T>,
    free: Vec<u32>,
    grew: bool,
}

impl<T: Record> Default for ArenaBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Record> ArenaBuffer<T> {
    pub fn new() -> Self {
        ArenaBuffer {
            storage: Storage::Owned(Vec::new()),
            free: Vec::new(),
            grew: false,
        }
    }

    pub fn from_vec(records: Vec<T>) -> Self {
        ArenaBuffer {
            storage: Storage::Owned(records),
            free: Vec::new(),
            grew: false,
        }
    }

    pub fn from_mapped(region: MappedRegion<T>) -> Self {
        ArenaBuffer {
            storage: Storage::Mapped(region),
            free: Vec::new(),
            grew: false,
        }
    }

    #[inline]
    pub fn as_slice(&self) -> &[T] {
        match &self.storage {
            Storage::Owned(v) => v,
            Storage::Mapped(m) => m.as_slice(),
        }
    }

    /// High-water mark: sentinel, live and freed slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slots in use, sentinel included.
    pub fn live(&self) -> usize {
        self.len() - self.free.len()
    }

    pub fn free_slots(&self) -> &[u32] {
        &self.free
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.storage, Storage::Mapped(_))
    }

    #[inline]
    pub fn get(&self, idx: u32) -> &T {
        &self.as_slice()[idx as usize]
    }

    #[inline]
    pub fn get_mut(&mut self, idx: u32) -> &mut T {
        &mut self.owned_mut()[idx as usize]
    }

    /// Clone mapped records into owned memory (copy-on-write).
    pub fn make_owned(&mut self) -> Result<(), Error> {
        if let Storage::Mapped(m) = &self.storage {
            let src = m.as_slice();
            let mut v = Vec::new();
            v.try_reserve_exact(src.len())?;
            v.extend_from_slice(src);
            debug!("[COW] cloned {} mapped records into owned memory", v.len());
            counter!("ipset_cow_clones_total").increment(1);
            self.storage = Storage::Owned(v);
        }
        Ok(())
    }

    pub(crate) fn owned_mut(&mut self) -> &mut Vec<T> {
        if let Storage::Mapped(m) = &self.storage {
            // Trees convert both arenas up front; this only runs if a
            // caller skipped that step.
            debug!("[COW] implicit clone of {} mapped records", m.len);
            self.storage = Storage::Owned(m.as_slice().to_vec());
        }
        match &mut self.storage {
            Storage::Owned(v) => v,
            Storage::Mapped(_) => unreachable!("storage converted above"),
        }
    }

    /// Hand out a zeroed slot, preferring the free list.
    pub fn alloc(&mut self) -> Result<NonZeroU32, Error> {
        if let Some(idx) = self.free.pop() {
            *self.get_mut(idx) = T::default();
            if let Some(nz) = NonZeroU32::new(idx) {
                return Ok(nz);
            }
            return Err(Error::Corrupt("sentinel slot on free list"));
        }
        let v = self.owned_mut();
        if v.is_empty() {
            v.try_reserve_exact(ARENA_INITIAL_SLOTS)?;
            v.push(T::default());
        }
        if v.len() as u64 >= LEAF_TAG as u64 {
            return Err(Error::Alloc);
        }
        let grew = if v.len() == v.capacity() {
            let extra = v.capacity().max(ARENA_INITIAL_SLOTS);
            v.try_reserve_exact(extra)?;
            true
        } else {
            false
        };
        let idx = v.len() as u32;
        v.push(T::default());
        self.grew |= grew;
        NonZeroU32::new(idx).ok_or(Error::Corrupt("sentinel slot allocated"))
    }

    /// Return `idx` to the free list; the array never shrinks here.
    pub fn free(&mut self, idx: NonZeroU32) {
        debug_assert!((idx.get() as usize) < self.len());
        self.free.push(idx.get());
    }

    /// Whether the array was reallocated since the last call.
    pub fn take_grew(&mut self) -> bool {
        std::mem::take(&mut self.grew)
    }

    /// Move the record at `from` into slot `to`.
    pub(crate) fn relocate(&mut self, from: u32, to: u32) {
        let v = self.owned_mut();
        v[to as usize] = v[from as usize];
    }

    /// Drop every slot at or above `len` and forget the free list.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.owned_mut().truncate(len);
        self.free.clear();
    }

    /// Replace the contents with `records`, which have no holes.
    pub(crate) fn replace(&mut self, records: Vec<T>) {
        self.storage = Storage::Owned(records);
        self.free.clear();
    }

    /// Release everything, mapped or not.
    pub fn reset(&mut self) {
        self.storage = Storage::Owned(Vec::new());
        self.free.clear();
        self.grew = false;
    }
}
