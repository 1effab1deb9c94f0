use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use crate::core::TransportError;

/// Page alignment satisfies every host adapter's DMA alignment mask.
pub const DEFAULT_ALIGNMENT: usize = 4096;

/// Zeroed, aligned native transfer buffer handed to the OS for one command.
///
/// A buffer lives for one submission: it is allocated right before the
/// call and freed when dropped, which happens on every return path of the
/// submitting function. A zero-length buffer owns no allocation.
pub struct ScratchBuffer {
    ptr: Option<NonNull<u8>>,
    len: usize,
    layout: Layout,
}

impl ScratchBuffer {
    pub fn new(len: usize, alignment: usize) -> Result<Self, TransportError> {
        let invalid = || {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid scratch buffer layout: {len} bytes, {alignment} alignment"),
            ))
        };
        let capacity = len
            .checked_next_multiple_of(alignment.max(1))
            .ok_or_else(invalid)?;
        let layout = Layout::from_size_align(capacity.max(1), alignment).map_err(|_| invalid())?;

        if len == 0 {
            return Ok(Self {
                ptr: None,
                len,
                layout,
            });
        }

        // SAFETY: layout has a non-zero size.
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                format!("failed to allocate {capacity} byte scratch buffer"),
            ))
        })?;

        Ok(Self {
            ptr: Some(ptr),
            len,
            layout,
        })
    }

    #[inline]
    pub fn with_default_alignment(len: usize) -> Result<Self, TransportError> {
        Self::new(len, DEFAULT_ALIGNMENT)
    }

    /// A buffer pre-filled with `payload`, for data-out commands.
    pub fn from_payload(payload: &[u8]) -> Result<Self, TransportError> {
        let mut buf = Self::with_default_alignment(payload.len())?;
        buf.copy_from_slice(payload);
        Ok(buf)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn alignment(&self) -> usize {
        self.layout.align()
    }

    /// Pointer for the native call; null when the buffer is empty.
    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.map_or(std::ptr::null_mut(), NonNull::as_ptr)
    }

    /// Copies the first `len` transferred bytes out before the buffer is
    /// released.
    pub fn to_vec(&self, len: usize) -> Vec<u8> {
        self[..len.min(self.len)].to_vec()
    }
}

impl Drop for ScratchBuffer {
    fn drop(&mut self) {
        if let Some(ptr) = self.ptr.take() {
            // SAFETY: ptr was returned by alloc_zeroed with this layout.
            unsafe { dealloc(ptr.as_ptr(), self.layout) }
        }
    }
}

impl Deref for ScratchBuffer {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        match self.ptr {
            // SAFETY: ptr is valid for len initialized bytes.
            Some(ptr) => unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.len) },
            None => &[],
        }
    }
}

impl DerefMut for ScratchBuffer {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        match self.ptr {
            // SAFETY: ptr is valid for len initialized bytes and uniquely owned.
            Some(ptr) => unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), self.len) },
            None => &mut [],
        }
    }
}

// SAFETY: the buffer exclusively owns its allocation.
unsafe impl Send for ScratchBuffer {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_is_aligned_and_zeroed() {
        let mut buf = ScratchBuffer::with_default_alignment(1000).unwrap();
        assert_eq!(buf.len(), 1000);
        assert!((buf.as_mut_ptr() as usize).is_multiple_of(DEFAULT_ALIGNMENT));
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_empty_buffer_owns_nothing() {
        let mut buf = ScratchBuffer::with_default_alignment(0).unwrap();
        assert!(buf.is_empty());
        assert!(buf.as_mut_ptr().is_null());
        assert!(buf.to_vec(10).is_empty());
    }

    #[test]
    fn test_payload_copy_and_clipped_read_back() {
        let buf = ScratchBuffer::from_payload(&[1, 2, 3]).unwrap();
        assert_eq!(&buf[..], &[1, 2, 3]);
        assert_eq!(buf.to_vec(2), vec![1, 2]);
        assert_eq!(buf.to_vec(99), vec![1, 2, 3]);
    }

    #[test]
    fn test_non_power_of_two_alignment_is_error() {
        assert!(ScratchBuffer::new(64, 3).is_err());
    }
}
