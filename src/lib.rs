// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! `naivegc`: a conservative, stop-the-world, mark-and-sweep collector
//! for language runtimes.
//!
//! The collector hands out untyped blocks of memory and reclaims the
//! unreachable ones. Reachability is decided conservatively: registers,
//! thread stacks, static data and user-registered roots are scanned one
//! aligned word at a time, and every word that lands inside a live
//! payload keeps that payload (and, transitively, whatever its payload
//! points at) alive. It is deliberately simple rather than fast: all the
//! bookkeeping a production collector hides sits in plain view here.
//!
//! The embedding runtime supplies its half of the bargain by
//! implementing [`Host`] and installing it with [`init`]; after that the
//! entry points below behave like a C allocator with a safety net.
//!
//! ```no_run
//! use naivegc::Host;
//!
//! struct Runtime;
//!
//! impl Host for Runtime {
//!     fn on_out_of_memory(&self) {
//!         panic!("out of memory");
//!     }
//!     fn finalize(&self, _payload: *mut u8, _deterministic: bool) {}
//!     fn scan_static_data(&self, _scan: &mut dyn FnMut(usize, usize)) {}
//!     fn thread_init(&self) {}
//!     fn thread_suspend_all(&self) {}
//!     fn thread_resume_all(&self) {}
//!     fn thread_scan_all(&self, _scan: &mut dyn FnMut(usize, usize), _stack_top: usize) {}
//! }
//!
//! static RUNTIME: Runtime = Runtime;
//!
//! naivegc::init(&RUNTIME);
//! let p = naivegc::malloc(64, 0);
//! naivegc::add_root(p);
//! naivegc::collect();
//! assert!(naivegc::size_of(p) >= 64);
//! naivegc::term();
//! ```
//!
//! Every entry point is serialized on one in-process lock, so the
//! collector is safe to call from a multithreaded host but never runs
//! mutator-parallel. The lock is not reentrant: host callbacks (most
//! notably finalizers) must not call back into the collector.

#[macro_use]
mod extra_assert;

mod arch;
mod cell;
pub mod gc;
mod host;
mod list;
mod os;
mod rootvec;

pub use crate::arch::stack_grows_down;
pub use crate::cell::attr;
pub use crate::gc::DebugFlags;
pub use crate::host::Host;

use crate::gc::Collector;
use lazy_static::lazy_static;
use parking_lot::Mutex;

pub(crate) type Address = usize;
pub(crate) type Word = usize;

pub(crate) const WORD_SIZE: usize = std::mem::size_of::<usize>();

pub(crate) fn align_up(addr: usize, align: usize) -> usize {
    (addr + align - 1) & !(align - 1)
}

/// What the collector knows about one block, in the shape hosts consume.
/// Zeroed for pointers the collector does not own.
#[repr(C)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct BlkInfo {
    pub base: *mut u8,
    pub size: usize,
    pub attr: u32,
}

impl Default for BlkInfo {
    fn default() -> Self {
        BlkInfo {
            base: std::ptr::null_mut(),
            size: 0,
            attr: 0,
        }
    }
}

lazy_static! {
    /// The collector singleton. One lock serializes every entry point;
    /// it belongs to the collector alone and is independent of whatever
    /// lock the host uses for its own thread management.
    static ref COLLECTOR: Mutex<Option<Collector>> = Mutex::new(None);
}

fn with<R>(f: impl FnOnce(&mut Collector) -> R) -> R {
    let mut guard = COLLECTOR.lock();
    let collector = guard.as_mut().expect("collector entry point before init");
    f(collector)
}

/// Install the collector with the given host runtime. Must be the first
/// entry point called, exactly once.
pub fn init(host: &'static dyn Host) {
    let mut guard = COLLECTOR.lock();
    debug_assert!(guard.is_none(), "init called twice");
    *guard = Some(Collector::new(host, DebugFlags::new()));
    host.thread_init();
}

/// Tear the collector down, running the finalizer for every live cell
/// that asked for one. Memory is not reclaimed; the OS does that at
/// process exit. Must be the last entry point called.
pub fn term() {
    let mut guard = COLLECTOR.lock();
    let mut collector = guard.take().expect("term before init");
    collector.term();
}

/// Re-allow collections triggered by allocation pressure. Calls must
/// pair with [`disable`]; the counter underflowing is a bug.
pub fn enable() {
    with(|gc| gc.enable())
}

/// Suppress collections triggered by allocation pressure. Nests;
/// explicit [`collect`] calls still run.
pub fn disable() {
    with(|gc| gc.disable())
}

/// Run a full collection now, regardless of the enable counter.
pub fn collect() {
    with(|gc| gc.collect())
}

/// Return every free-list cell to the OS. Best-effort.
pub fn minimize() {
    with(|gc| gc.minimize())
}

/// Allocate `size` bytes tagged with `attr`. Null when `size` is zero or
/// the OS is exhausted.
pub fn malloc(size: usize, attr: u32) -> *mut u8 {
    with(|gc| gc.malloc(size, attr))
}

/// [`malloc`] with a zeroed payload.
pub fn calloc(size: usize, attr: u32) -> *mut u8 {
    with(|gc| gc.calloc(size, attr))
}

/// Resize the live block at `p`, in place when capacity allows. `p` must
/// be a payload base (or null, which allocates); the caller must keep
/// `p` referenced across the call.
pub fn realloc(p: *mut u8, size: usize, attr: u32) -> *mut u8 {
    with(|gc| gc.realloc(p, size, attr))
}

/// Grow a block in place by between `min` and `max` bytes. This engine
/// never can, so this always returns 0.
pub fn extend(p: *mut u8, min: usize, max: usize) -> usize {
    with(|gc| gc.extend(p, min, max))
}

/// Pre-allocate `size` bytes onto the free list. Returns the bytes
/// actually reserved, or 0 if the OS refused.
pub fn reserve(size: usize) -> usize {
    with(|gc| gc.reserve(size))
}

/// Move the live block at `p` to the free list without finalizing it.
/// Null is a no-op; anything that is not a live payload base is a bug.
pub fn free(p: *mut u8) {
    with(|gc| gc.free(p))
}

/// Payload base of the live block containing `p` (interior pointers
/// welcome), or null.
pub fn addr_of(p: *mut u8) -> *mut u8 {
    with(|gc| gc.addr_of(p))
}

/// Usable size of the live block whose payload base is `p`, or 0.
pub fn size_of(p: *mut u8) -> usize {
    with(|gc| gc.size_of(p))
}

/// Everything known about the live block whose payload base is `p`;
/// zeroed for anything else.
pub fn query(p: *mut u8) -> BlkInfo {
    with(|gc| gc.query(p))
}

/// Attribute bitmap of the live block at `p`, or 0.
pub fn get_attr(p: *mut u8) -> u32 {
    with(|gc| gc.get_attr(p))
}

/// OR `mask` into the block's attribute bitmap. Returns the bitmap
/// *after* the update (0 if `p` is unknown); callers have depended on
/// that behavior for long enough that it is contract.
pub fn set_attr(p: *mut u8, mask: u32) -> u32 {
    with(|gc| gc.set_attr(p, mask))
}

/// Clear `mask` from the block's attribute bitmap. Returns the bitmap
/// after the update, 0 if `p` is unknown.
pub fn clear_attr(p: *mut u8, mask: u32) -> u32 {
    with(|gc| gc.clear_attr(p, mask))
}

/// Register `p` itself as a root word scanned by every collection.
/// Duplicates accumulate.
pub fn add_root(p: *mut u8) {
    with(|gc| gc.add_root(p))
}

/// Remove one occurrence of `p` from the registered roots.
pub fn remove_root(p: *mut u8) {
    with(|gc| gc.remove_root(p))
}

/// Register the range `[p, p + size)` for word-by-word scanning in every
/// collection. No deduplication or overlap checking.
pub fn add_range(p: *mut u8, size: usize) {
    with(|gc| gc.add_range(p, size))
}

/// Remove the first registered range starting at `p`.
pub fn remove_range(p: *mut u8) {
    with(|gc| gc.remove_range(p))
}

/// Swap in a new set of [`DebugFlags`].
pub fn debug_flags(flags: DebugFlags) {
    with(|gc| gc.debug_flags = flags)
}
