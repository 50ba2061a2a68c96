// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The collector core: allocation, tracing and reclamation.
//!
//! Two intrusive lists partition every cell the collector has ever
//! obtained from the OS. The live list holds allocated, not-yet-freed
//! cells; the free list holds cells awaiting reuse. `collect` clears all
//! mark bits, conservatively traces from the root set with the world
//! stopped, and then sweeps whatever stayed unmarked onto the free list.

use crate::arch::SpilledRegisters;
use crate::cell::Cell;
use crate::host::Host;
use crate::list::CellList;
use crate::os::AllocErr;
use crate::rootvec::RootVec;
use crate::{align_up, Address, BlkInfo, Word, WORD_SIZE};
use log::{debug, trace};
use std::cmp;
use std::ptr::{self, NonNull};

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum CollectorState {
    Ready,
    RootScanning,
    Marking,
    Sweeping,
}

/// Toggles for skipping collector phases, used to observe intermediate
/// heap states from tests. Unmarking always runs; the mark and sweep
/// phases run only when their flag is set.
pub struct DebugFlags {
    pub mark_phase: bool,
    pub sweep_phase: bool,
}

impl DebugFlags {
    pub fn new() -> Self {
        Self {
            mark_phase: true,
            sweep_phase: true,
        }
    }

    pub fn mark_phase(mut self, val: bool) -> Self {
        self.mark_phase = val;
        self
    }

    pub fn sweep_phase(mut self, val: bool) -> Self {
        self.sweep_phase = val;
        self
    }
}

impl Default for DebugFlags {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered root range `[from, to)`.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
struct AddrRange {
    from: Address,
    to: Address,
}

pub(crate) struct Collector {
    live: CellList,
    free: CellList,
    /// Registered single-word roots: each entry is itself a potential
    /// heap pointer.
    roots: RootVec<Address>,
    /// Registered root ranges, scanned word-by-word.
    ranges: RootVec<AddrRange>,
    /// Collections on allocation pressure run only when this is zero.
    /// Explicit `collect` calls ignore it.
    disabled: usize,
    /// Cells whose payloads still need a conservative scan. Kept across
    /// collections so its buffer is reused.
    worklist: Vec<NonNull<Cell>>,
    host: &'static dyn Host,
    pub(crate) debug_flags: DebugFlags,
    state: CollectorState,
}

// Cells and root buffers are only ever touched by the thread holding the
// collector lock in the facade.
unsafe impl Send for Collector {}

/// Restarts the mutators even if marking faults.
struct ResumeOnDrop {
    host: &'static dyn Host,
}

impl Drop for ResumeOnDrop {
    fn drop(&mut self) {
        self.host.thread_resume_all();
    }
}

impl Collector {
    /// No allocation happens here; the first cell is only obtained once
    /// the mutator asks for it.
    pub(crate) fn new(host: &'static dyn Host, debug_flags: DebugFlags) -> Self {
        Self {
            live: CellList::new(),
            free: CellList::new(),
            roots: RootVec::new(),
            ranges: RootVec::new(),
            disabled: 0,
            worklist: Vec::new(),
            host,
            debug_flags,
            state: CollectorState::Ready,
        }
    }

    /// Run finalizers for everything still live. Memory itself is left
    /// for the OS to reclaim at process exit.
    pub(crate) fn term(&mut self) {
        for cell in self.live.iter() {
            let (finalizer, payload) = unsafe {
                let c = cell.as_ref();
                (c.has_finalizer(), c.payload())
            };
            if finalizer {
                self.host.finalize(payload, false);
            }
        }
    }

    pub(crate) fn enable(&mut self) {
        debug_assert!(self.disabled > 0, "enable without a matching disable");
        self.disabled -= 1;
    }

    pub(crate) fn disable(&mut self) {
        self.disabled += 1;
    }

    fn enabled(&self) -> bool {
        self.disabled == 0
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    pub(crate) fn malloc(&mut self, size: usize, attr: u32) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }

        if let Some(cell) = self.free.pop_with_capacity(size) {
            return self.reuse(cell, size, attr);
        }

        if self.enabled() {
            self.collect();
            if let Some(cell) = self.free.pop_with_capacity(size) {
                return self.reuse(cell, size, attr);
            }
        }

        trace!("malloc: no reusable cell for {} bytes, asking the OS", size);
        match Cell::create(size, attr) {
            Ok(cell) => {
                self.live.link(cell);
                unsafe { cell.as_ref().payload() }
            }
            Err(AllocErr) => {
                self.host.on_out_of_memory();
                ptr::null_mut()
            }
        }
    }

    /// Put a cell picked off the free list back into service. Its
    /// `capacity` survives from the original allocation.
    fn reuse(&mut self, mut cell: NonNull<Cell>, size: usize, attr: u32) -> *mut u8 {
        unsafe { cell.as_mut().reset(size, attr) };
        self.live.link(cell);
        unsafe { cell.as_ref().payload() }
    }

    pub(crate) fn calloc(&mut self, size: usize, attr: u32) -> *mut u8 {
        let p = self.malloc(size, attr);
        if !p.is_null() {
            unsafe { ptr::write_bytes(p, 0, size) };
        }
        p
    }

    /// Resize `p` in place when its cell's capacity allows, otherwise
    /// allocate, copy and free the old cell (without finalization).
    ///
    /// The caller must still reference `p` across the call: growing can
    /// trigger a collection, and it is the conservative stack scan that
    /// keeps the old block alive through it.
    pub(crate) fn realloc(&mut self, p: *mut u8, size: usize, attr: u32) -> *mut u8 {
        if p.is_null() {
            return self.malloc(size, attr);
        }
        if size == 0 {
            self.free(p);
            return ptr::null_mut();
        }

        let found = self.live.find_by_payload(p);
        debug_assert!(
            found.is_some(),
            "realloc of a pointer the collector does not own"
        );
        let mut cell = match found {
            Some(c) => c,
            None => return ptr::null_mut(),
        };

        let (old_size, capacity) = unsafe {
            let c = cell.as_ref();
            (c.size(), c.capacity())
        };
        if capacity >= size {
            unsafe { cell.as_mut().set_size(size) };
            return p;
        }

        let new = self.malloc(size, attr);
        if new.is_null() {
            return ptr::null_mut();
        }
        unsafe { ptr::copy_nonoverlapping(p, new, cmp::min(old_size, size)) };
        self.free(p);
        new
    }

    /// Blocks never grow in place in this collector.
    pub(crate) fn extend(&mut self, _p: *mut u8, min: usize, max: usize) -> usize {
        debug_assert!(min <= max, "extend with min > max");
        0
    }

    /// Stock the free list with one cell of at least `size` bytes.
    /// Returns the bytes actually reserved, or 0 if the OS refused.
    pub(crate) fn reserve(&mut self, size: usize) -> usize {
        debug_assert!(size > 0, "reserve needs a positive size");
        match Cell::create(size, 0) {
            Ok(cell) => {
                let capacity = unsafe { cell.as_ref().capacity() };
                self.free.link(cell);
                debug!("reserved {} bytes ahead of use", capacity);
                capacity
            }
            Err(AllocErr) => {
                self.host.on_out_of_memory();
                0
            }
        }
    }

    /// Move a live cell to the free list. Finalizers do not run here:
    /// explicit deletion is the host runtime's own business.
    pub(crate) fn free(&mut self, p: *mut u8) {
        if p.is_null() {
            return;
        }
        let cell = self.live.pop_by_payload(p);
        debug_assert!(
            cell.is_some(),
            "free of a pointer the collector does not own"
        );
        if let Some(cell) = cell {
            self.free.link(cell);
        }
    }

    /// Hand every free cell back to the OS. Best-effort: a failing
    /// `raw_free` is ignored.
    pub(crate) fn minimize(&mut self) {
        let mut released = 0usize;
        while let Some(cell) = self.free.pop_front() {
            unsafe { Cell::destroy(cell) };
            released += 1;
        }
        debug!("minimize: returned {} cells to the OS", released);
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Payload base of the live cell containing `p`, or null. The only
    /// lookup that tolerates interior pointers.
    pub(crate) fn addr_of(&self, p: *mut u8) -> *mut u8 {
        match self.live.find_containing(p as Address) {
            Some(cell) => unsafe { cell.as_ref().payload() },
            None => ptr::null_mut(),
        }
    }

    /// Usable size of the live cell whose payload base is `p`, or 0.
    pub(crate) fn size_of(&self, p: *mut u8) -> usize {
        self.live
            .find_by_payload(p)
            .map(|c| unsafe { c.as_ref().capacity() })
            .unwrap_or(0)
    }

    pub(crate) fn query(&self, p: *mut u8) -> BlkInfo {
        match self.live.find_by_payload(p) {
            Some(cell) => {
                let c = unsafe { cell.as_ref() };
                BlkInfo {
                    base: c.payload(),
                    size: c.capacity(),
                    attr: c.attr(),
                }
            }
            None => BlkInfo::default(),
        }
    }

    pub(crate) fn get_attr(&self, p: *mut u8) -> u32 {
        self.live
            .find_by_payload(p)
            .map(|c| unsafe { c.as_ref().attr() })
            .unwrap_or(0)
    }

    pub(crate) fn set_attr(&mut self, p: *mut u8, mask: u32) -> u32 {
        self.live
            .find_by_payload(p)
            .map(|mut c| unsafe { c.as_mut().set_attr(mask) })
            .unwrap_or(0)
    }

    pub(crate) fn clear_attr(&mut self, p: *mut u8, mask: u32) -> u32 {
        self.live
            .find_by_payload(p)
            .map(|mut c| unsafe { c.as_mut().clear_attr(mask) })
            .unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Root registration
    // ------------------------------------------------------------------

    pub(crate) fn add_root(&mut self, p: *mut u8) {
        if self.roots.append(p as Address).is_err() {
            self.host.on_out_of_memory();
        }
    }

    /// Remove one occurrence; registering a root twice means removing it
    /// twice.
    pub(crate) fn remove_root(&mut self, p: *mut u8) {
        self.roots.remove_first_equal(p as Address);
    }

    /// Register `[p, p + size)` for scanning. Zero-length and overlapping
    /// ranges are accepted as-is.
    pub(crate) fn add_range(&mut self, p: *mut u8, size: usize) {
        let from = p as Address;
        let range = AddrRange {
            from,
            to: from + size,
        };
        if self.ranges.append(range).is_err() {
            self.host.on_out_of_memory();
        }
    }

    pub(crate) fn remove_range(&mut self, p: *mut u8) {
        let from = p as Address;
        self.ranges.remove_first(|r| r.from == from);
    }

    // ------------------------------------------------------------------
    // Collection
    // ------------------------------------------------------------------

    pub(crate) fn collect(&mut self) {
        debug_assert_eq!(self.state, CollectorState::Ready);
        debug!(
            "collect: {} live cells, {} free cells",
            self.live.len(),
            self.free.len()
        );

        self.unmark();

        if self.debug_flags.mark_phase {
            self.mark_all();
        }

        if self.debug_flags.sweep_phase {
            self.sweep();
        }

        self.state = CollectorState::Ready;
    }

    /// Drop every mark bit before root scanning begins; whatever stays
    /// unmarked afterwards is garbage.
    fn unmark(&mut self) {
        for mut cell in self.live.iter() {
            unsafe { cell.as_mut().set_marked(false) };
        }
    }

    /// The stop-the-world phase: park the register file on this stack
    /// frame, suspend the mutators, then trace from every root source.
    fn mark_all(&mut self) {
        self.state = CollectorState::RootScanning;

        // The register file is a root source like any other; spilling it
        // here puts it under the stack scan below.
        let spilled = SpilledRegisters::capture();
        let stack_top = spilled.stack_top();

        let host = self.host;
        host.thread_suspend_all();
        let resume = ResumeOnDrop { host };

        trace!("mark: scanning static data");
        host.scan_static_data(&mut |from, to| self.mark_range(from, to));

        trace!("mark: scanning thread stacks down to {:#x}", stack_top);
        host.thread_scan_all(&mut |from, to| self.mark_range(from, to), stack_top);

        self.state = CollectorState::Marking;

        trace!(
            "mark: {} registered roots, {} registered ranges",
            self.roots.len(),
            self.ranges.len()
        );
        for i in 0..self.roots.len() {
            let root = self.roots.get(i);
            self.mark(root);
        }
        for i in 0..self.ranges.len() {
            let AddrRange { from, to } = self.ranges.get(i);
            self.mark_range(from, to);
        }

        // Mutators restart before sweep; the spill slots unwind with this
        // frame.
        drop(resume);
        drop(spilled);
    }

    /// Treat `word` as a potential pointer and trace everything reachable
    /// from it.
    fn mark(&mut self, word: Word) {
        if self.mark_one(word) {
            self.trace_worklist();
        }
    }

    /// Mark the live cell `word` points into, if any. Interior pointers
    /// resolve; anything else is ignored. Returns whether the worklist
    /// gained an entry.
    fn mark_one(&mut self, word: Word) -> bool {
        let mut cell = match self.live.find_containing(word) {
            Some(c) => c,
            None => return false,
        };
        let c = unsafe { cell.as_mut() };
        if c.is_marked() {
            return false;
        }
        c.set_marked(true);
        if c.has_pointers() {
            self.worklist.push(cell);
            true
        } else {
            false
        }
    }

    /// Drain the worklist, conservatively scanning each pending cell's
    /// payload for more candidates. An explicit worklist in place of the
    /// naive recursion keeps deep object graphs off the native stack;
    /// the set of reachable cells is the same either way.
    fn trace_worklist(&mut self) {
        while let Some(cell) = self.worklist.pop() {
            for word in unsafe { cell.as_ref().words() } {
                self.mark_one(word);
            }
        }
    }

    /// Conservatively scan `[from, to)`: aligned words only, any sub-word
    /// tail is ignored.
    fn mark_range(&mut self, from: Address, to: Address) {
        let start = align_up(from, WORD_SIZE);
        if to.saturating_sub(start) < WORD_SIZE {
            return;
        }
        let end = start + ((to - start) / WORD_SIZE) * WORD_SIZE;
        for addr in (start..end).step_by(WORD_SIZE) {
            let word = unsafe { *(addr as *const Word) };
            self.mark(word);
        }
    }

    /// Move every unmarked live cell to the free list, finalizing the
    /// ones that asked for it. Runs with mutators resumed but the
    /// collector lock still held.
    fn sweep(&mut self) {
        self.state = CollectorState::Sweeping;
        let mut swept = 0usize;

        // Unlinking the yielded cell is safe: the iterator has already
        // captured its successor.
        for cell in self.live.iter() {
            let (marked, finalizer, payload) = unsafe {
                let c = cell.as_ref();
                (c.is_marked(), c.has_finalizer(), c.payload())
            };
            if marked {
                continue;
            }
            self.live.unlink(cell);
            if finalizer {
                self.host.finalize(payload, false);
            }
            self.free.link(cell);
            swept += 1;
        }

        debug!("sweep: reclaimed {} cells", swept);
    }

    #[cfg(test)]
    fn live_len(&self) -> usize {
        self.live.len()
    }

    #[cfg(test)]
    fn free_len(&self) -> usize {
        self.free.len()
    }
}
