//! Physical frames with reference counts

use std::collections::BTreeSet;

use exo_sdk::memory::PAGE_SIZE;
use exo_sdk::PhysAddr;

/// Physical memory of the simulated machine
///
/// Frames below `reserved` hold the kernel image and are never handed out.
/// A frame is free exactly when it is on the free list; mapping a frame
/// takes a reference and unmapping drops it, and the last drop frees it.
pub(crate) struct FrameTable {
    data: Vec<Box<[u8]>>,
    refs: Vec<u32>,
    free: BTreeSet<usize>,
    reserved: usize,
}

impl FrameTable {
    pub(crate) fn new(count: usize, reserved: usize) -> Self {
        let data = (0..count)
            .map(|_| vec![0u8; PAGE_SIZE].into_boxed_slice())
            .collect();
        let mut refs = vec![0u32; count];
        for r in refs.iter_mut().take(reserved) {
            *r = 1;
        }

        Self {
            data,
            refs,
            free: (reserved..count).collect(),
            reserved,
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.data.len()
    }

    pub(crate) fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Take the lowest free frame, zeroed, with no references
    pub(crate) fn alloc(&mut self) -> Option<usize> {
        let frame = self.free.pop_first()?;
        self.data[frame].fill(0);
        Some(frame)
    }

    pub(crate) fn incref(&mut self, frame: usize) {
        self.refs[frame] += 1;
        self.free.remove(&frame);
    }

    /// True for frames holding the kernel image
    pub(crate) fn is_reserved(&self, frame: usize) -> bool {
        frame < self.reserved
    }

    /// Drop one reference; reserved frames keep theirs
    pub(crate) fn decref(&mut self, frame: usize) {
        if self.is_reserved(frame) {
            return;
        }
        let refs = &mut self.refs[frame];
        *refs = refs.saturating_sub(1);
        if *refs == 0 {
            self.free.insert(frame);
        }
    }

    /// Reference count of the frame holding `pa`, `None` past the end of memory
    pub(crate) fn refcount(&self, pa: PhysAddr) -> Option<u32> {
        self.refs.get(pa.ppn()).copied()
    }

    /// Frame index of `pa`, if it lies in physical memory
    pub(crate) fn index_of(&self, pa: PhysAddr) -> Option<usize> {
        (pa.ppn() < self.count()).then_some(pa.ppn())
    }

    pub(crate) fn bytes(&self, frame: usize) -> &[u8] {
        &self.data[frame]
    }

    pub(crate) fn bytes_mut(&mut self, frame: usize) -> &mut [u8] {
        &mut self.data[frame]
    }
}
