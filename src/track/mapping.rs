//! Raw mmap arithmetic backing the tracking allocator: carving an
//! aligned block out of an oversized anonymous mapping, and growing one
//! in place.

use std::os::raw::c_void;

use crate::ffi::{syscall, PAGE_SIZE};
use crate::probes;
use crate::track::TRACKING_ALIGNMENT;

fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

pub(crate) fn round_up_page(value: usize) -> usize {
    round_up(value.max(1), PAGE_SIZE)
}

/// Non-binding address hint for the allocation about to receive `id`:
/// spreads tracked blocks across the address space so unrelated
/// allocations don't keep landing near each other, which would make the
/// head/tail-slop trim below pointless. Not meant to be collision-free;
/// the kernel is always free to ignore it.
fn hint(id: u64) -> *mut c_void {
    let raw = id
        .wrapping_mul(17)
        .wrapping_mul(TRACKING_ALIGNMENT as u64)
        % (1u64 << 47);
    let page_aligned = raw - (raw % PAGE_SIZE as u64);
    page_aligned as *mut c_void
}

/// Maps a block of `rounded_size` bytes, aligned to `TRACKING_ALIGNMENT`,
/// by over-mapping `rounded_size + TRACKING_ALIGNMENT` bytes and trimming
/// the unaligned head and tail back off. Returns the aligned base
/// address, or null if the kernel couldn't satisfy the request.
pub(super) fn allocate_aligned(rounded_size: usize, id_hint: u64) -> *mut u8 {
    let padded = rounded_size + TRACKING_ALIGNMENT;

    let base = match syscall::anon_mmap(padded, hint(id_hint)) {
        Ok(base) => base,
        Err(err) => {
            probes::mmap_failed(
                rounded_size as u64,
                TRACKING_ALIGNMENT as u64,
                padded as u64,
                err.raw_os_error().unwrap_or(-1),
            );
            return std::ptr::null_mut();
        }
    };

    let base_addr = base as usize;
    let aligned_addr = round_up(base_addr, TRACKING_ALIGNMENT);
    let head_slop = aligned_addr - base_addr;
    let tail_slop = padded - head_slop - rounded_size;

    if head_slop > 0 {
        let _ = syscall::munmap(base, head_slop);
    }
    if tail_slop > 0 {
        let tail_ptr = unsafe { base.add(head_slop + rounded_size) };
        let _ = syscall::munmap(tail_ptr, tail_slop);
    }

    aligned_addr as *mut u8
}

/// Attempts to extend the mapping at `ptr + old_size` by `grow_by` bytes
/// without moving it. `MAP_FIXED_NOREPLACE` means this either lands
/// exactly where asked or fails outright; a mismatch can't happen, but
/// is unwound defensively if it ever did.
pub(super) fn grow_in_place(ptr: *mut u8, old_size: usize, grow_by: usize) -> bool {
    let grow_at = unsafe { ptr.add(old_size) } as *mut c_void;
    match syscall::anon_mmap_fixed_noreplace(grow_at, grow_by) {
        Ok(got) if got as *mut c_void == grow_at => true,
        Ok(got) => {
            let _ = syscall::munmap(got, grow_by);
            false
        }
        Err(_) => false,
    }
}

pub(super) fn shrink_in_place(ptr: *mut u8, new_size: usize, old_size: usize) -> bool {
    let freed = old_size - new_size;
    let tail = unsafe { ptr.add(new_size) };
    syscall::munmap(tail, freed).is_ok()
}
