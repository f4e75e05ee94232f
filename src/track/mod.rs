//! The tracking allocator: hands out aligned, individually-mmap'd
//! blocks for sampled allocations, and an address-indexed table that
//! turns "is this pointer one of ours" and "what do we know about it"
//! into an O(1) lookup instead of a scan.
//!
//! Every tracked block is aligned to [`TRACKING_ALIGNMENT`], so a
//! pointer's table slot is just `address / TRACKING_ALIGNMENT`. The
//! table spans the whole flat address space up front as one anonymous
//! mapping rather than growing on demand: the kernel demand-pages it, so
//! the reserved slots a process never touches cost no physical memory,
//! and the lookup path never has to handle a table resize.

mod mapping;

use std::mem::size_of;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;

pub(crate) use mapping::round_up_page;

/// Every tracked block is aligned to 1 GiB, matching spec's flat,
/// direct-mapped table design.
pub(crate) const TRACKING_ALIGNMENT: usize = 1 << 30;

/// Upper bound on the address space the table covers: 47 bits, the
/// default flat virtual address width on every 64-bit target this crate
/// supports. A pointer outside this range is never one of ours.
const ADDRESS_SPACE_MAX: usize = 1 << 47;

const TABLE_LEN: usize = ADDRESS_SPACE_MAX / TRACKING_ALIGNMENT;

struct Info {
    id: AtomicU64,
    /// Page-rounded size of the backing mapping: what `put`/`resize` need
    /// to know to unmap or grow/shrink the right number of bytes.
    mapped_size: AtomicUsize,
    /// The size the caller actually asked for. This, not `mapped_size`,
    /// is what `malloc`/`free`/`realloc` probes report, so a pointer's
    /// reported size only ever changes across an intervening resize.
    requested_size: AtomicUsize,
}

struct Tables {
    /// One slot per `TRACKING_ALIGNMENT`-sized region of the address
    /// space, holding that region's base address while it's a live
    /// tracked allocation, or 0 otherwise.
    primary: *mut AtomicUsize,
    info: *mut Info,
}

// Both tables are reserved once, for the life of the process, and every
// access goes through the table's own atomics; no external locking is
// ever required to share `Tables` across threads.
unsafe impl Send for Tables {}
unsafe impl Sync for Tables {}

static TABLES: OnceLock<Tables> = OnceLock::new();
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn tables() -> &'static Tables {
    TABLES.get_or_init(|| {
        let primary_bytes = TABLE_LEN * size_of::<AtomicUsize>();
        let info_bytes = TABLE_LEN * size_of::<Info>();
        let primary = crate::ffi::syscall::anon_mmap(primary_bytes, std::ptr::null_mut())
            .expect("failed to reserve the tracked-allocation table");
        let info = crate::ffi::syscall::anon_mmap(info_bytes, std::ptr::null_mut())
            .expect("failed to reserve the tracked-allocation info table");
        Tables {
            primary: primary as *mut AtomicUsize,
            info: info as *mut Info,
        }
    })
}

fn slot_index(addr: usize) -> Option<usize> {
    if addr == 0 || addr % TRACKING_ALIGNMENT != 0 || addr >= ADDRESS_SPACE_MAX {
        return None;
    }
    Some(addr / TRACKING_ALIGNMENT)
}

fn primary_slot(idx: usize) -> &'static AtomicUsize {
    unsafe { &*tables().primary.add(idx) }
}

fn info_slot(idx: usize) -> &'static Info {
    unsafe { &*tables().info.add(idx) }
}

/// Reports whether `ptr` is the base address of a currently-live tracked
/// allocation. Every other tracking operation assumes this has already
/// been checked.
#[inline(always)]
pub(crate) fn is_tracked(ptr: *mut u8) -> bool {
    let addr = ptr as usize;
    match slot_index(addr) {
        Some(idx) => primary_slot(idx).load(Ordering::Acquire) == addr,
        None => false,
    }
}

/// Maps a fresh tracked block able to hold `request` bytes and publishes
/// it into both tables. Returns `(ptr::null_mut(), 0)` if the kernel
/// couldn't satisfy the mapping; the caller is expected to treat that
/// like any other allocation failure.
pub(crate) fn get(request: usize) -> (*mut u8, u64) {
    let rounded = round_up_page(request);
    let id_hint = NEXT_ID.load(Ordering::Relaxed);
    let ptr = mapping::allocate_aligned(rounded, id_hint);
    if ptr.is_null() {
        return (std::ptr::null_mut(), 0);
    }

    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let idx = slot_index(ptr as usize).expect("mapping::allocate_aligned returned a misaligned pointer");

    info_slot(idx).mapped_size.store(rounded, Ordering::Relaxed);
    info_slot(idx).requested_size.store(request, Ordering::Relaxed);
    info_slot(idx).id.store(id, Ordering::Release);

    let previous = primary_slot(idx).swap(ptr as usize, Ordering::AcqRel);
    assert_eq!(
        previous, 0,
        "publishing a tracked allocation into an already-occupied table slot"
    );

    (ptr, id)
}

/// Looks up the `(id, requested_size)` recorded for a pointer already
/// known to be tracked: the size the caller asked for, the same number
/// `get`'s matching allocation probe reported, not the page-rounded
/// mapping size backing it. Panics if the pointer isn't tracked, since
/// that means the caller skipped `is_tracked` or the tables were
/// corrupted.
pub(crate) fn info(ptr: *mut u8) -> (u64, usize) {
    let addr = ptr as usize;
    let idx = slot_index(addr).expect("info() on an address outside the tracked address space");
    let observed = primary_slot(idx).load(Ordering::Acquire);
    assert_eq!(
        observed, addr,
        "info() on an address that is not a live tracked allocation"
    );
    let info = info_slot(idx);
    (
        info.id.load(Ordering::Acquire),
        info.requested_size.load(Ordering::Acquire),
    )
}

/// The true, page-rounded capacity backing an already-tracked pointer,
/// for `malloc_usable_size`: unlike `info`'s requested size, this is how
/// many bytes are actually safe to read or write through the pointer.
pub(crate) fn usable_size(ptr: *mut u8) -> usize {
    let addr = ptr as usize;
    let idx = slot_index(addr).expect("usable_size() on an address outside the tracked address space");
    let observed = primary_slot(idx).load(Ordering::Acquire);
    assert_eq!(
        observed, addr,
        "usable_size() on an address that is not a live tracked allocation"
    );
    info_slot(idx).mapped_size.load(Ordering::Acquire)
}

/// Resizes an already-tracked block to fit `request` bytes, shrinking or
/// growing in place. Returns `false` if growing in place wasn't
/// possible; the caller is responsible for falling back to a fresh
/// `get` + copy + `put`. Updates the requested size even when the
/// mapped size doesn't change (a resize within the same rounded page),
/// so a subsequent `info`/`free` reports the new request, not the one
/// this block was originally allocated with.
pub(crate) fn resize(ptr: *mut u8, request: usize) -> bool {
    let addr = ptr as usize;
    let idx = slot_index(addr).expect("resize() on an address outside the tracked address space");
    let info = info_slot(idx);
    let old_mapped = info.mapped_size.load(Ordering::Acquire);
    let new_mapped = round_up_page(request);

    let grew = if new_mapped == old_mapped {
        true
    } else if new_mapped < old_mapped {
        mapping::shrink_in_place(ptr, new_mapped, old_mapped)
    } else {
        mapping::grow_in_place(ptr, old_mapped, new_mapped - old_mapped)
    };

    if grew {
        info.mapped_size.store(new_mapped, Ordering::Release);
        info.requested_size.store(request, Ordering::Release);
    }
    grew
}

/// Releases a tracked block: clears the info entry's id before clearing
/// the primary table entry, so a concurrent reader racing this `free`
/// never observes a nonzero id alongside a table entry that no longer
/// matches it, then unmaps the backing memory.
pub(crate) fn put(ptr: *mut u8) {
    let addr = ptr as usize;
    let idx = slot_index(addr).expect("put() on an address outside the tracked address space");

    let observed = primary_slot(idx).load(Ordering::Acquire);
    assert_eq!(
        observed, addr,
        "free() of an address that is not a live tracked allocation"
    );

    let info = info_slot(idx);
    let size = info.mapped_size.load(Ordering::Acquire);
    let previous_id = info.id.swap(0, Ordering::Release);
    assert_ne!(previous_id, 0, "double free of a tracked allocation");

    let cleared = primary_slot(idx).compare_exchange(addr, 0, Ordering::AcqRel, Ordering::Acquire);
    assert!(
        cleared.is_ok(),
        "tracked allocation's table slot changed concurrently during free"
    );

    let _ = crate::ffi::syscall::munmap(ptr, size);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn get_then_is_tracked_then_put() {
        let (ptr, id) = get(128);
        assert!(!ptr.is_null());
        assert_ne!(id, 0);
        assert!(is_tracked(ptr));

        let (observed_id, observed_size) = info(ptr);
        assert_eq!(observed_id, id);
        assert_eq!(observed_size, 128);

        put(ptr);
        assert!(!is_tracked(ptr));
    }

    #[test]
    fn usable_size_is_page_rounded_unlike_requested_size() {
        let (ptr, _) = get(128);
        let (_, requested) = info(ptr);
        assert_eq!(requested, 128);
        assert_eq!(usable_size(ptr), round_up_page(128));
        put(ptr);
    }

    #[test]
    fn untracked_pointers_are_reported_as_such() {
        assert!(!is_tracked(std::ptr::null_mut()));
        assert!(!is_tracked(1 as *mut u8));
        assert!(!is_tracked(TRACKING_ALIGNMENT as *mut u8));
    }

    #[test]
    fn resize_shrinks_and_grows_in_place() {
        let (ptr, _) = get(8192);
        let (_, original_size) = info(ptr);
        assert_eq!(original_size, 8192);

        assert!(resize(ptr, 128));
        let (_, shrunk_size) = info(ptr);
        assert_eq!(shrunk_size, 128);

        assert!(resize(ptr, 8192));
        let (_, grown_size) = info(ptr);
        assert_eq!(grown_size, 8192);

        put(ptr);
    }

    #[test]
    fn resize_within_the_same_page_still_updates_the_requested_size() {
        let (ptr, _) = get(64);
        assert!(resize(ptr, 96));
        let (_, requested) = info(ptr);
        assert_eq!(requested, 96);
        put(ptr);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let (ptr, _) = get(64);
        put(ptr);
        put(ptr);
    }
}
