//! USDT probe emission. These 8 tracepoints are the entire externally
//! observable surface `poireau` promises: out-of-process tooling
//! (`bpftrace`, `dtrace`-compatible consumers) attaches to them by name
//! under the `libpoireau` provider. Nothing inside this crate ever reads
//! them back.

#[usdt::provider]
mod libpoireau {
    fn malloc(id: u64, ptr: u64, size: u64) {}
    fn calloc(num: u64, size: u64, id: u64, ptr: u64, rounded_size: u64) {}
    fn calloc_overflow(num: u64, size: u64) {}
    fn realloc(old_ptr: u64, old_size: u64, new_id: u64, new_ptr: u64, new_size: u64) {}
    fn realloc_from_tracked(
        old_id: u64,
        old_ptr: u64,
        old_size: u64,
        new_id: u64,
        new_ptr: u64,
        new_size: u64,
    ) {
    }
    fn realloc_to_regular(old_id: u64, old_ptr: u64, old_size: u64, new_ptr: u64, new_size: u64) {}
    fn free(id: u64, ptr: u64, size: u64) {}
    fn mmap_failed(size: u64, alignment: u64, padded_size: u64, errno: i32) {}
}

pub(crate) fn malloc(id: u64, ptr: u64, size: u64) {
    libpoireau::malloc!(|| (id, ptr, size));
}

pub(crate) fn calloc(num: u64, size: u64, id: u64, ptr: u64, rounded_size: u64) {
    libpoireau::calloc!(|| (num, size, id, ptr, rounded_size));
}

pub(crate) fn calloc_overflow(num: u64, size: u64) {
    libpoireau::calloc_overflow!(|| (num, size));
}

pub(crate) fn realloc(old_ptr: u64, old_size: u64, new_id: u64, new_ptr: u64, new_size: u64) {
    libpoireau::realloc!(|| (old_ptr, old_size, new_id, new_ptr, new_size));
}

pub(crate) fn realloc_from_tracked(
    old_id: u64,
    old_ptr: u64,
    old_size: u64,
    new_id: u64,
    new_ptr: u64,
    new_size: u64,
) {
    libpoireau::realloc_from_tracked!(|| (old_id, old_ptr, old_size, new_id, new_ptr, new_size));
}

pub(crate) fn realloc_to_regular(
    old_id: u64,
    old_ptr: u64,
    old_size: u64,
    new_ptr: u64,
    new_size: u64,
) {
    libpoireau::realloc_to_regular!(|| (old_id, old_ptr, old_size, new_ptr, new_size));
}

pub(crate) fn free(id: u64, ptr: u64, size: u64) {
    libpoireau::free!(|| (id, ptr, size));
}

pub(crate) fn mmap_failed(size: u64, alignment: u64, padded_size: u64, errno: i32) {
    libpoireau::mmap_failed!(|| (size, alignment, padded_size, errno));
}

/// Registers the compiled-in probes with the kernel USDT machinery.
/// Called once from the crate's constructor; a registration failure
/// (e.g. on a kernel without USDT support compiled in) just means probes
/// silently never fire, not a reason to abort loading.
pub(crate) fn register() {
    if let Err(err) = usdt::register_probes() {
        log::warn!("poireau: failed to register USDT probes: {err}");
    }
}
