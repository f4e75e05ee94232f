//! Cross-mapping-safe copy used by `realloc` when moving data out of a
//! block whose true usable size the base allocator won't tell us: a
//! plain `ptr::copy_nonoverlapping` would read past the end of `src`'s
//! real mapping and segfault, so this goes through `process_vm_readv`
//! instead, which reports a short read rather than crashing.

use crate::ffi::{syscall, PAGE_SIZE};

/// Copies up to `len` bytes from `src` into `dst`, stopping at the first
/// short or failed read. Returns the number of bytes actually copied;
/// `dst` is the base of a fresh tracked allocation, so whatever wasn't
/// copied is already zero-filled by the kernel, not garbage.
pub(crate) fn cross_mapping_copy(src: *const u8, dst: *mut u8, len: usize) -> usize {
    if len == 0 {
        return 0;
    }

    let copied = syscall::process_vm_readv_self(src, dst, len).unwrap_or(0);
    if copied >= len {
        return len;
    }

    // The single big attempt already told us where it stopped; keep
    // going one page at a time from there instead of retrying the whole
    // thing, so a fault deep into a large block doesn't cost an O(len)
    // redo per page.
    let mut offset = copied;
    while offset < len {
        let chunk_start = src as usize + offset;
        let page_aligned = chunk_start - (chunk_start % PAGE_SIZE);
        let skew = chunk_start - page_aligned;
        let want = (PAGE_SIZE - skew).min(len - offset);

        let got = syscall::process_vm_readv_self(
            unsafe { src.add(offset) },
            unsafe { dst.add(offset) },
            want,
        )
        .unwrap_or(0);

        offset += got;
        if got < want {
            break;
        }
    }
    offset
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn copies_a_fully_readable_source() {
        let src = vec![0xABu8; 256];
        let mut dst = vec![0u8; 256];
        let copied = cross_mapping_copy(src.as_ptr(), dst.as_mut_ptr(), 256);
        assert_eq!(copied, 256);
        assert_eq!(dst, src);
    }

    #[test]
    fn zero_length_copy_is_a_no_op() {
        let src = [0u8; 8];
        let mut dst = [0u8; 8];
        assert_eq!(cross_mapping_copy(src.as_ptr(), dst.as_mut_ptr(), 0), 0);
    }
}
