//! `poireau` samples a statistically unbiased subset of a process's heap
//! allocations by interposing on `malloc`/`calloc`/`realloc`/`free` and
//! routing sampled requests through an internal tracking allocator that
//! emits a USDT probe on every sampled allocate, resize, and free.
//!
//! Preload the `cdylib` artifact into a target process to start
//! sampling:
//!
//! ```sh
//! LD_PRELOAD=/path/to/libpoireau.so ./target
//! ```
//!
//! The mean sampling interval defaults to 32 MiB and is configurable
//! with `POIREAU_SAMPLE_PERIOD_BYTES` (see [`config`]); diagnostic
//! output can be suppressed with `POIREAU_QUIET`.
//!
//! This crate only reports *that* sampled events happened, over USDT; it
//! does not read its own probes back or aggregate anything itself. An
//! out-of-process consumer (`bpftrace`, or any USDT-aware tracer) does
//! that work.
//!
//! This crate only builds for Linux: the tracking allocator assumes
//! `MAP_FIXED_NOREPLACE`, `process_vm_readv`, and a flat address space
//! of at least 47 usable bits, none of which are portable assumptions.
#[cfg(not(target_os = "linux"))]
compile_error!("poireau only supports linux: its tracking allocator relies on MAP_FIXED_NOREPLACE and process_vm_readv");

mod config;
mod ffi;
mod probes;
mod sample;
mod shim;
mod track;
mod util;

/// Runs once, before the host process's own `main`, via the standard
/// ELF constructor mechanism (`ctor` wraps the
/// `#[used] #[link_section = ".init_array"]` boilerplate). Loads the
/// sample-period configuration and registers the USDT provider; neither
/// can safely happen lazily on the allocation hot path, since both touch
/// global state that every interposed entry point reads without
/// synchronization once initialization is done.
#[ctor::ctor]
fn init() {
    config::load();
    probes::register();
}
