use std::{fmt, io, ptr::NonNull};

pub const OS_PAGE_SIZE: usize = 4096;

/// Failure of an allocation request.
#[derive(Debug)]
pub enum AllocError {
    /// The platform refused to reserve more memory.
    ReserveFailed { requested: usize, source: io::Error },
    /// The request exceeds the per-object limit (the header stores the
    /// allocation size in 32 bits).
    TooLarge { requested: usize },
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::ReserveFailed { requested, source } => {
                write!(f, "failed to reserve {requested} bytes: {source}")
            }
            AllocError::TooLarge { requested } => {
                write!(f, "allocation of {requested} bytes exceeds the object size limit")
            }
        }
    }
}

impl std::error::Error for AllocError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AllocError::ReserveFailed { source, .. } => Some(source),
            AllocError::TooLarge { .. } => None,
        }
    }
}

/// Reserve `size` bytes of zeroed, page-aligned memory from the platform.
pub fn reserve(size: usize) -> Result<NonNull<u8>, AllocError> {
    // SAFETY: anonymous private mapping, no file descriptor involved
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(AllocError::ReserveFailed {
            requested: size,
            source: io::Error::last_os_error(),
        });
    }
    // SAFETY: mmap never returns null on success
    Ok(unsafe { NonNull::new_unchecked(addr.cast()) })
}

/// Return memory obtained from [`reserve`].
pub fn release(ptr: NonNull<u8>, size: usize) {
    // SAFETY: ptr/size come from a successful reserve call
    let rc = unsafe { libc::munmap(ptr.as_ptr().cast(), size) };
    debug_assert_eq!(rc, 0, "munmap failed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_returns_zeroed_writable_memory() {
        let size = 4 * OS_PAGE_SIZE;
        let ptr = reserve(size).expect("reserve");
        // SAFETY: freshly mapped region of `size` bytes
        unsafe {
            assert_eq!(*ptr.as_ptr(), 0);
            assert_eq!(*ptr.as_ptr().add(size - 1), 0);
            ptr.as_ptr().write_bytes(0xAB, size);
            assert_eq!(*ptr.as_ptr().add(size / 2), 0xAB);
        }
        release(ptr, size);
    }

    #[test]
    fn reserve_failure_is_reported() {
        // A mapping no machine can satisfy.
        let err = reserve(usize::MAX & !(OS_PAGE_SIZE - 1)).unwrap_err();
        match err {
            AllocError::ReserveFailed { requested, .. } => {
                assert!(requested > 0)
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
