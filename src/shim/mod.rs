//! The interposed libc entry points themselves, and the bootstrap
//! dance that lets them run before the dynamic linker has finished
//! resolving what "the real `malloc`" even is.
//!
//! `dlsym` can itself allocate (glibc's lazy-binding path has done this
//! historically), and it runs the very first time any of these symbols
//! is reached - which, thanks to `LD_PRELOAD`, might be before the
//! host's `main` and before our own constructor has finished. Two flags
//! keep that safe: a per-thread `started` flag stops a thread from
//! recursing into discovery while it's already in the middle of it, and
//! a process-global `done` flag lets every other thread (and every
//! later call on this one) know the real symbols are ready to use.
//! Until `done` is set, any entry point whose base symbol isn't resolved
//! yet falls back to a safe no-op instead of blocking or crashing.

mod copy;

use std::cell::Cell;
use std::ffi::{c_void, CStr};
use std::mem::transmute;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::ffi::syscall;
use crate::track;
use crate::util::interpose;
use crate::{probes, sample};

static DISCOVERY_DONE: AtomicBool = AtomicBool::new(false);

thread_local! {
    static DISCOVERY_STARTED: Cell<bool> = const { Cell::new(false) };
}

static BASE_FREE: AtomicUsize = AtomicUsize::new(0);
static BASE_REALLOC: AtomicUsize = AtomicUsize::new(0);
static BASE_MALLOC: AtomicUsize = AtomicUsize::new(0);
static BASE_CALLOC: AtomicUsize = AtomicUsize::new(0);
static BASE_MALLOC_USABLE_SIZE: AtomicUsize = AtomicUsize::new(0);

type FreeFn = unsafe extern "C" fn(*mut c_void);
type ReallocFn = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;
type MallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
type CallocFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
type MallocUsableSizeFn = unsafe extern "C" fn(*mut c_void) -> usize;

fn discover(slot: &AtomicUsize, name: &CStr) {
    if slot.load(Ordering::Acquire) != 0 {
        return;
    }
    let resolved = syscall::dlsym_next(name);
    slot.store(resolved as usize, Ordering::Release);
}

/// Ensures the four core base symbols are resolved, unless this thread
/// is already in the middle of doing exactly that.
fn ensure_discovered() {
    if DISCOVERY_DONE.load(Ordering::Acquire) {
        return;
    }

    let already_started = DISCOVERY_STARTED.with(|cell| cell.replace(true));
    if already_started {
        return;
    }

    // Order matters: `free` must be wired up first so that if `realloc`
    // or `malloc`'s own lookup allocates and frees scratch memory on this
    // thread, that free lands on the real allocator instead of our own
    // dummy no-op (which is harmless for free, but only because free of
    // a genuinely-foreign pointer is itself a safe no-op here).
    discover(&BASE_FREE, c"free");
    discover(&BASE_REALLOC, c"realloc");
    discover(&BASE_MALLOC, c"malloc");
    discover(&BASE_CALLOC, c"calloc");

    DISCOVERY_DONE.store(true, Ordering::Release);
}

fn base_free() -> Option<FreeFn> {
    match BASE_FREE.load(Ordering::Acquire) {
        0 => None,
        addr => Some(unsafe { transmute::<usize, FreeFn>(addr) }),
    }
}

fn base_realloc() -> Option<ReallocFn> {
    match BASE_REALLOC.load(Ordering::Acquire) {
        0 => None,
        addr => Some(unsafe { transmute::<usize, ReallocFn>(addr) }),
    }
}

fn base_malloc() -> Option<MallocFn> {
    match BASE_MALLOC.load(Ordering::Acquire) {
        0 => None,
        addr => Some(unsafe { transmute::<usize, MallocFn>(addr) }),
    }
}

fn base_calloc() -> Option<CallocFn> {
    match BASE_CALLOC.load(Ordering::Acquire) {
        0 => None,
        addr => Some(unsafe { transmute::<usize, CallocFn>(addr) }),
    }
}

fn base_malloc_usable_size() -> Option<MallocUsableSizeFn> {
    // Not part of the core discovery order: nothing on the hot path
    // depends on this resolving before the first allocation, so it's
    // looked up independently and lazily on its own first use.
    if BASE_MALLOC_USABLE_SIZE.load(Ordering::Acquire) == 0 {
        discover(&BASE_MALLOC_USABLE_SIZE, c"malloc_usable_size");
    }
    match BASE_MALLOC_USABLE_SIZE.load(Ordering::Acquire) {
        0 => None,
        addr => Some(unsafe { transmute::<usize, MallocUsableSizeFn>(addr) }),
    }
}

fn sampled_malloc(size: usize) -> *mut c_void {
    let (ptr, id) = track::get(size);
    if id != 0 {
        probes::malloc(id, ptr as u64, size as u64);
    }
    ptr as *mut c_void
}

interpose! {
    fn malloc(size: usize) -> *mut c_void {
        if crate::util::likely(!sample::decide(size as u64)) {
            ensure_discovered();
            return match base_malloc() {
                Some(base) => base(size),
                None => std::ptr::null_mut(),
            };
        }
        sampled_malloc(size)
    }
}

interpose! {
    fn calloc(num: usize, size: usize) -> *mut c_void {
        let total = match num.checked_mul(size) {
            Some(total) => total,
            None => {
                probes::calloc_overflow(num as u64, size as u64);
                return std::ptr::null_mut();
            }
        };

        if crate::util::likely(!sample::decide(total as u64)) {
            ensure_discovered();
            return match base_calloc() {
                Some(base) => base(num, size),
                None => std::ptr::null_mut(),
            };
        }

        // The tracking allocator's backing memory is a fresh anonymous
        // mapping, which the kernel always hands back zero-filled, so
        // `calloc`'s zeroing contract is satisfied for free.
        let (ptr, id) = track::get(total);
        if id != 0 {
            let rounded_size = track::round_up_page(total);
            probes::calloc(num as u64, size as u64, id, ptr as u64, rounded_size as u64);
        }
        ptr as *mut c_void
    }
}

interpose! {
    fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
        realloc_impl(ptr, size)
    }
}

fn realloc_impl(ptr: *mut c_void, size: usize) -> *mut c_void {
    let was_tracked = !ptr.is_null() && track::is_tracked(ptr as *mut u8);

    if !sample::decide(size as u64) {
        if was_tracked {
            return transition_to_base(ptr as *mut u8, size);
        }
        ensure_discovered();
        return match base_realloc() {
            Some(base) => unsafe { base(ptr, size) },
            None => std::ptr::null_mut(),
        };
    }

    if ptr.is_null() {
        return sampled_malloc(size);
    }

    if was_tracked {
        realloc_tracked(ptr as *mut u8, size)
    } else {
        realloc_from_base(ptr, size)
    }
}

fn realloc_tracked(ptr: *mut u8, size: usize) -> *mut c_void {
    let (old_id, old_size) = track::info(ptr);

    if track::resize(ptr, size) {
        probes::realloc_from_tracked(old_id, ptr as u64, old_size as u64, old_id, ptr as u64, size as u64);
        return ptr as *mut c_void;
    }

    let (new_ptr, new_id) = track::get(size);
    if new_id == 0 {
        return std::ptr::null_mut();
    }
    let copy_len = old_size.min(size);
    unsafe { std::ptr::copy_nonoverlapping(ptr, new_ptr, copy_len) };
    track::put(ptr);
    probes::realloc_from_tracked(old_id, ptr as u64, old_size as u64, new_id, new_ptr as u64, size as u64);
    new_ptr as *mut c_void
}

fn realloc_from_base(old_ptr: *mut c_void, size: usize) -> *mut c_void {
    let (new_ptr, new_id) = track::get(size);
    if new_id == 0 {
        return std::ptr::null_mut();
    }
    let copied = copy::cross_mapping_copy(old_ptr as *const u8, new_ptr, size);
    probes::realloc(old_ptr as u64, copied as u64, new_id, new_ptr as u64, size as u64);

    ensure_discovered();
    if let Some(base) = base_free() {
        unsafe { base(old_ptr) };
    }
    new_ptr as *mut c_void
}

fn transition_to_base(ptr: *mut u8, size: usize) -> *mut c_void {
    ensure_discovered();
    let new_ptr = match base_malloc() {
        Some(base) => unsafe { base(size) },
        None => return std::ptr::null_mut(),
    };
    if new_ptr.is_null() {
        return std::ptr::null_mut();
    }

    let (old_id, old_size) = track::info(ptr);
    let copy_len = old_size.min(size);
    unsafe { std::ptr::copy_nonoverlapping(ptr, new_ptr as *mut u8, copy_len) };
    track::put(ptr);
    probes::realloc_to_regular(old_id, ptr as u64, old_size as u64, new_ptr as u64, size as u64);
    new_ptr
}

interpose! {
    fn free(ptr: *mut c_void) -> () {
        if ptr.is_null() {
            return;
        }
        if track::is_tracked(ptr as *mut u8) {
            let (id, size) = track::info(ptr as *mut u8);
            probes::free(id, ptr as u64, size as u64);
            track::put(ptr as *mut u8);
            return;
        }
        ensure_discovered();
        if let Some(base) = base_free() {
            base(ptr);
        }
    }
}

interpose! {
    fn reallocarray(ptr: *mut c_void, nmemb: usize, size: usize) -> *mut c_void {
        match nmemb.checked_mul(size) {
            Some(total) => realloc_impl(ptr, total),
            None => {
                *libc::__errno_location() = libc::ENOMEM;
                std::ptr::null_mut()
            }
        }
    }
}

interpose! {
    fn malloc_usable_size(ptr: *mut c_void) -> usize {
        if ptr.is_null() {
            return 0;
        }
        if track::is_tracked(ptr as *mut u8) {
            return track::usable_size(ptr as *mut u8);
        }
        match base_malloc_usable_size() {
            Some(base) => base(ptr),
            None => 0,
        }
    }
}
