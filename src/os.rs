// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Page-aligned raw memory straight from the operating system.
//!
//! Every byte the collector manages ultimately comes from here: cell
//! blocks, and the buffers behind the root registration vectors. The
//! collector itself must never be in this layer's dependency chain.

use cfg_if::cfg_if;
use std::ptr::NonNull;

/// The OS refused to hand out more memory.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) struct AllocErr;

pub(crate) const PAGE_SIZE: usize = 4096;

cfg_if! {
    if #[cfg(unix)] {
        /// Map `size` bytes (rounded up to whole pages) of zeroed,
        /// page-aligned anonymous memory.
        pub(crate) fn raw_alloc(size: usize) -> Result<NonNull<u8>, AllocErr> {
            debug_assert!(size > 0);
            unsafe {
                let addr = libc::mmap(
                    std::ptr::null_mut(),
                    crate::align_up(size, PAGE_SIZE),
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_ANON | libc::MAP_PRIVATE,
                    -1,
                    0,
                );
                if addr == libc::MAP_FAILED {
                    Err(AllocErr)
                } else {
                    NonNull::new(addr as *mut u8).ok_or(AllocErr)
                }
            }
        }

        /// Unmap a block previously returned by `raw_alloc` with the same
        /// `size`. The status is advisory; callers treat release as
        /// best-effort.
        pub(crate) fn raw_free(ptr: NonNull<u8>, size: usize) -> bool {
            unsafe {
                libc::munmap(
                    ptr.as_ptr() as *mut libc::c_void,
                    crate::align_up(size, PAGE_SIZE),
                ) == 0
            }
        }
    } else if #[cfg(windows)] {
        use winapi::um::memoryapi::{VirtualAlloc, VirtualFree};
        use winapi::um::winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE};

        pub(crate) fn raw_alloc(size: usize) -> Result<NonNull<u8>, AllocErr> {
            debug_assert!(size > 0);
            let addr = unsafe {
                VirtualAlloc(
                    std::ptr::null_mut(),
                    size,
                    MEM_COMMIT | MEM_RESERVE,
                    PAGE_READWRITE,
                )
            };
            NonNull::new(addr as *mut u8).ok_or(AllocErr)
        }

        pub(crate) fn raw_free(ptr: NonNull<u8>, _size: usize) -> bool {
            unsafe { VirtualFree(ptr.as_ptr() as *mut _, 0, MEM_RELEASE) != 0 }
        }
    } else {
        // No virtual-memory primitive we know about: fall back to the
        // platform heap. The heap hands out unaligned blocks, so
        // over-allocate by a page plus a word, align up to a page
        // boundary, and stash the heap's base pointer in the word after
        // the caller's `size` so `raw_free` can recover it.
        use std::alloc::{alloc, dealloc, Layout};

        const WORD: usize = std::mem::size_of::<usize>();

        fn trampoline_layout(size: usize) -> Layout {
            // WORD is a power of two and the padded size cannot overflow
            // for any size the collector asks for.
            unsafe { Layout::from_size_align_unchecked(size + PAGE_SIZE + WORD, WORD) }
        }

        pub(crate) fn raw_alloc(size: usize) -> Result<NonNull<u8>, AllocErr> {
            debug_assert!(size > 0);
            unsafe {
                let base = alloc(trampoline_layout(size));
                if base.is_null() {
                    return Err(AllocErr);
                }
                let aligned = (base as usize + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
                *((aligned + size) as *mut usize) = base as usize;
                Ok(NonNull::new_unchecked(aligned as *mut u8))
            }
        }

        pub(crate) fn raw_free(ptr: NonNull<u8>, size: usize) -> bool {
            unsafe {
                let base = *((ptr.as_ptr() as usize + size) as *const usize);
                dealloc(base as *mut u8, trampoline_layout(size));
            }
            true
        }
    }
}
