pub mod syscall;

/// Page size used for rounding tracked-allocation requests. `poireau`
/// only supports architectures with a fixed 4 KiB base page size, which
/// covers every target `LD_PRELOAD` realistically runs on.
pub const PAGE_SIZE: usize = 4096;
