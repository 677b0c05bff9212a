// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
use super::{DescriptorEntry, DescriptorHandle, DescriptorKind, Error};
use crate::imp::{NativeBuffer, StorageMode};
use std::collections::VecDeque;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Inclusive `[min, max]` range of indices written since the last publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DirtyRange {
    min: u32,
    max: u32,
}

impl DirtyRange {
    pub(crate) const EMPTY: DirtyRange = DirtyRange { min: u32::MAX, max: 0 };

    pub(crate) fn is_empty(&self) -> bool {
        self.min > self.max
    }

    pub(crate) fn include(&mut self, index: u32) {
        self.min = self.min.min(index);
        self.max = self.max.max(index);
    }

    pub(crate) fn contains(&self, index: u32) -> bool {
        !self.is_empty() && self.min <= index && index <= self.max
    }

    pub(crate) fn take(&mut self) -> Option<RangeInclusive<u32>> {
        let taken = std::mem::replace(self, DirtyRange::EMPTY);
        (!taken.is_empty()).then(|| taken.min..=taken.max)
    }
}

/// Where writes land before the GPU sees them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeapMode {
    /// Straight into the CPU-visible table.
    Direct,
    /// Into a CPU shadow; the dirty range is blitted across at publish.
    Shadowed,
    /// Into (entry, index) side arrays; a compute pass scatters them at publish.
    Scatter,
}

/// Work handed to the publisher.
#[derive(Debug)]
pub(crate) enum Publish {
    Copy {
        first: u32,
        bytes: Vec<u8>,
    },
    Scatter {
        entries: Vec<u8>,
        indices: Vec<u8>,
        count: u32,
    },
}

#[derive(Debug)]
struct HeapState {
    free: VecDeque<u32>,
    peak: u32,
    dirty: DirtyRange,
    shadow: Vec<DescriptorEntry>,
    pending_entries: Vec<DescriptorEntry>,
    pending_indices: Vec<u32>,
    //only maintained when validating
    live: Vec<bool>,
}

/// A fixed-capacity descriptor table.
///
/// Reserve, free and update share one lock.  The high-water mark is mirrored in an atomic
/// so binding can read it without taking the lock.
#[derive(Debug)]
pub struct DescriptorHeap {
    kind: DescriptorKind,
    capacity: u32,
    mode: HeapMode,
    table: Arc<dyn NativeBuffer>,
    validate: bool,
    peak: AtomicU32,
    state: Mutex<HeapState>,
}

impl DescriptorHeap {
    pub(crate) fn new(kind: DescriptorKind, table: Arc<dyn NativeBuffer>, mode: HeapMode, validate: bool) -> Self {
        let capacity = (table.len() / DescriptorEntry::SIZE).min(u32::MAX as u64 - 1) as u32;
        if mode == HeapMode::Direct {
            assert!(table.contents().is_some(), "direct descriptor heaps need CPU-visible memory");
        }
        logwise::info_sync!(
            "descriptor heap {kind} created with {capacity} entries",
            kind = logwise::privacy::LogIt(&kind),
            capacity = capacity
        );
        DescriptorHeap {
            kind,
            capacity,
            mode,
            table,
            validate,
            peak: AtomicU32::new(0),
            state: Mutex::new(HeapState {
                free: VecDeque::new(),
                peak: 0,
                dirty: DirtyRange::EMPTY,
                shadow: Vec::new(),
                pending_entries: Vec::new(),
                pending_indices: Vec::new(),
                live: Vec::new(),
            }),
        }
    }

    pub fn kind(&self) -> DescriptorKind {
        self.kind
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of slots ever handed out.  Freed slots are recycled, not un-counted.
    pub fn peak(&self) -> u32 {
        self.peak.load(Ordering::Acquire)
    }

    pub fn free_slots(&self) -> usize {
        self.state.lock().unwrap().free.len()
    }

    pub fn is_dirty(&self) -> bool {
        !self.state.lock().unwrap().dirty.is_empty()
    }

    pub fn dirty_range(&self) -> Option<RangeInclusive<u32>> {
        let dirty = self.state.lock().unwrap().dirty;
        (!dirty.is_empty()).then(|| dirty.min..=dirty.max)
    }

    pub(crate) fn mode(&self) -> HeapMode {
        self.mode
    }

    pub(crate) fn table(&self) -> &Arc<dyn NativeBuffer> {
        &self.table
    }

    /// Reserve a slot, preferring the oldest freed index.
    pub fn try_reserve(&self) -> Result<DescriptorHandle, Error> {
        let mut state = self.state.lock().unwrap();
        let index = match state.free.pop_front() {
            Some(index) => index,
            None => {
                if state.peak + 1 >= self.capacity {
                    return Err(Error::HeapExhausted {
                        kind: self.kind,
                        capacity: self.capacity,
                    });
                }
                let index = state.peak;
                state.peak += 1;
                self.peak.store(state.peak, Ordering::Release);
                index
            }
        };
        if self.validate {
            let i = index as usize;
            if state.live.len() <= i {
                state.live.resize(i + 1, false);
            }
            state.live[i] = true;
        }
        Ok(DescriptorHandle::new(self.kind, index))
    }

    /// Reserve a slot.  Running out is a configuration error and panics.
    pub fn reserve(&self) -> DescriptorHandle {
        match self.try_reserve() {
            Ok(handle) => handle,
            Err(e) => panic!("{e}; raise the configured heap size"),
        }
    }

    fn check(&self, state: &HeapState, handle: DescriptorHandle, what: &str) {
        assert_eq!(handle.kind, self.kind, "{what}: {handle:?} used with the {:?} heap", self.kind);
        assert!(
            handle.index < state.peak,
            "{what}: {handle:?} was never reserved (peak {})",
            state.peak
        );
        if self.validate {
            assert!(
                state.live.get(handle.index as usize).copied().unwrap_or(false),
                "{what}: {handle:?} is not live"
            );
        }
    }

    /// Return a slot to the free list.  The entry's contents are left alone.
    pub fn free(&self, handle: DescriptorHandle) {
        let mut state = self.state.lock().unwrap();
        self.check(&state, handle, "free");
        if self.validate {
            state.live[handle.index as usize] = false;
        }
        state.free.push_back(handle.index);
    }

    pub fn update(&self, handle: DescriptorHandle, entry: DescriptorEntry) {
        let mut state = self.state.lock().unwrap();
        self.check(&state, handle, "update");
        let index = handle.index;
        match self.mode {
            HeapMode::Direct => self.write_table(index, &entry),
            HeapMode::Shadowed => {
                let i = index as usize;
                if state.shadow.len() <= i {
                    state.shadow.resize(i + 1, DescriptorEntry::default());
                }
                state.shadow[i] = entry;
            }
            HeapMode::Scatter => {
                state.pending_entries.push(entry);
                state.pending_indices.push(index);
            }
        }
        state.dirty.include(index);
    }

    fn write_table(&self, index: u32, entry: &DescriptorEntry) {
        let Some(contents) = self.table.contents() else {
            return;
        };
        let offset = index as u64 * DescriptorEntry::SIZE;
        let bytes = entry.to_bytes();
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), contents.as_ptr().add(offset as usize), bytes.len());
        }
        if self.table.storage_mode() == StorageMode::Managed {
            self.table.did_modify_range(offset..offset + DescriptorEntry::SIZE);
        }
    }

    /// Take whatever the next publish needs to move, resetting the dirty range.
    pub(crate) fn take_publish(&self) -> Option<Publish> {
        let mut state = self.state.lock().unwrap();
        let range = state.dirty.take()?;
        match self.mode {
            HeapMode::Direct => None,
            HeapMode::Shadowed => {
                let (first, last) = (*range.start() as usize, *range.end() as usize);
                let mut bytes = Vec::with_capacity((last - first + 1) * DescriptorEntry::SIZE as usize);
                for entry in &state.shadow[first..=last] {
                    bytes.extend_from_slice(&entry.to_bytes());
                }
                Some(Publish::Copy {
                    first: *range.start(),
                    bytes,
                })
            }
            HeapMode::Scatter => {
                let all_entries = std::mem::take(&mut state.pending_entries);
                let all_indices = std::mem::take(&mut state.pending_indices);
                //scatter threads run unordered, so only the last write to each index survives
                let mut seen = std::collections::HashSet::new();
                let mut entries = Vec::with_capacity(all_entries.len());
                let mut indices = Vec::with_capacity(all_indices.len());
                for (entry, index) in all_entries.into_iter().zip(all_indices).rev() {
                    if seen.insert(index) {
                        entries.push(entry);
                        indices.push(index);
                    }
                }
                let count = indices.len() as u32;
                Some(Publish::Scatter {
                    entries: entries.iter().flat_map(|e| e.to_bytes()).collect(),
                    indices: indices.iter().flat_map(|i| i.to_le_bytes()).collect(),
                    count,
                })
            }
        }
    }

    /// Read entries straight out of a CPU-visible table.
    pub(crate) fn read_direct(&self, count: u32) -> Option<Vec<DescriptorEntry>> {
        let contents = self.table.contents()?;
        let bytes = unsafe {
            std::slice::from_raw_parts(contents.as_ptr(), (count as u64 * DescriptorEntry::SIZE) as usize)
        };
        Some(
            bytes
                .chunks_exact(DescriptorEntry::SIZE as usize)
                .map(DescriptorEntry::from_bytes)
                .collect(),
        )
    }
}
