use std::ffi::CStr;
use std::io::{Error, Result};
use std::os::raw::c_void;

/// Reserves a fresh anonymous mapping, letting the kernel pick the
/// address. Used for the tracking allocator's backing tables and, with
/// `hint` non-null, for tracked-allocation blocks themselves.
pub fn anon_mmap(len: usize, hint: *mut c_void) -> Result<*mut u8> {
    let prot = libc::PROT_READ | libc::PROT_WRITE;
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
    let ptr = unsafe { libc::mmap(hint, len, prot, flags, -1, 0) };
    if ptr != libc::MAP_FAILED {
        Ok(ptr as *mut u8)
    } else {
        Err(Error::last_os_error())
    }
}

/// Kernel versions since 4.17 refuse to silently relocate a `MAP_FIXED`
/// request onto memory already in use; `libc` doesn't expose the flag on
/// every version it supports, so the numeric value is spelled out here.
/// <https://github.com/torvalds/linux/blob/v6.13/include/uapi/asm-generic/mman-common.h#L18>
const MAP_FIXED_NOREPLACE: i32 = 0x10_0000;

/// Extends a tracked allocation's mapping in place. Fails (without
/// touching any memory) if the kernel cannot honor `addr` exactly, which
/// the caller takes as "grow in place is not possible".
pub fn anon_mmap_fixed_noreplace(addr: *mut c_void, len: usize) -> Result<*mut u8> {
    let prot = libc::PROT_READ | libc::PROT_WRITE;
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | MAP_FIXED_NOREPLACE;
    let ptr = unsafe { libc::mmap(addr, len, prot, flags, -1, 0) };
    if ptr != libc::MAP_FAILED {
        Ok(ptr as *mut u8)
    } else {
        Err(Error::last_os_error())
    }
}

pub fn munmap(ptr: *mut u8, len: usize) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    let result = unsafe { libc::munmap(ptr as *mut c_void, len) };
    if result != -1 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

/// Fills `buf` from the kernel's CSPRNG, retrying across `EINTR`. Used
/// once per thread to seed the xoshiro256+ state on first use.
pub fn getrandom(buf: &mut [u8]) -> Result<()> {
    let mut filled = 0usize;
    while filled < buf.len() {
        let ret = unsafe {
            libc::syscall(
                libc::SYS_getrandom,
                buf.as_mut_ptr().add(filled) as *mut c_void,
                buf.len() - filled,
                0,
            )
        };
        if ret < 0 {
            let err = Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        filled += ret as usize;
    }
    Ok(())
}

/// Copies `len` bytes from `src` to `dst` in this process's own address
/// space via `process_vm_readv`, returning the number of bytes actually
/// transferred. Unlike a plain memory copy, a short or failing read past
/// the end of `src`'s real mapping is reported instead of segfaulting,
/// which is the whole reason `realloc`'s cross-mapping copy uses this
/// instead of `ptr::copy_nonoverlapping`.
pub fn process_vm_readv_self(src: *const u8, dst: *mut u8, len: usize) -> Result<usize> {
    let local = libc::iovec {
        iov_base: dst as *mut c_void,
        iov_len: len,
    };
    let remote = libc::iovec {
        iov_base: src as *mut c_void,
        iov_len: len,
    };
    let pid = unsafe { libc::getpid() };
    let n = unsafe { libc::process_vm_readv(pid, &local, 1, &remote, 1, 0) };
    if n >= 0 {
        Ok(n as usize)
    } else {
        Err(Error::last_os_error())
    }
}

/// Resolves `name` against the next definition of that symbol in the
/// dynamic linker's search order, i.e. the libc this process would have
/// called had `poireau` not been `LD_PRELOAD`ed. Returns a null pointer
/// if the symbol cannot be found.
pub fn dlsym_next(name: &CStr) -> *mut c_void {
    unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) }
}
