// src/buffer.rs
//! Double-mapped circular byte buffer.
//!
//! A region of `2 * S` virtual bytes is backed by a single `S`-byte shared
//! memory object mapped twice, back to back. Any window of up to `S` bytes that
//! starts in `[0, S)` is therefore contiguous in virtual memory, so the parser
//! always sees the unread bytes as one slice and `read(2)` always gets one
//! writable slice, no matter where the ring currently wraps.

use crate::syscalls;
use std::io;
use std::ptr;

pub struct CircularBuffer {
    base: *mut u8,
    size: usize,
    head: usize,
    tail: usize,
}

// The mapping is owned exclusively by this value; it is only ever handed to
// the worker thread that owns the connection context.
unsafe impl Send for CircularBuffer {}

impl CircularBuffer {
    /// Maps a buffer of capacity `size`.
    ///
    /// `size` must be a positive multiple of the page size (`EINVAL`
    /// otherwise). Mapping failures surface as the OS error (`ENOMEM` in
    /// practice).
    pub fn new(size: usize) -> io::Result<Self> {
        let page = syscalls::page_size();
        if size == 0 || size % page != 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }

        let fd = syscalls::anonymous_shm()?;
        // From here on every early return must close `fd`.
        let result = unsafe { Self::map_twice(fd, size) };
        unsafe {
            libc::close(fd);
        }
        let base = result?;

        Ok(Self {
            base,
            size,
            head: 0,
            tail: 0,
        })
    }

    unsafe fn map_twice(fd: libc::c_int, size: usize) -> io::Result<*mut u8> {
        unsafe {
            if libc::ftruncate(fd, size as libc::off_t) < 0 {
                return Err(io::Error::last_os_error());
            }

            // Reserve 2*S of address space, then overlay both halves with the object.
            let reserve = libc::mmap(
                ptr::null_mut(),
                2 * size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            );
            if reserve == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }

            for half in 0..2 {
                let addr = (reserve as *mut u8).add(half * size) as *mut libc::c_void;
                let mapped = libc::mmap(
                    addr,
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED | libc::MAP_FIXED,
                    fd,
                    0,
                );
                if mapped == libc::MAP_FAILED || mapped != addr {
                    let err = io::Error::last_os_error();
                    libc::munmap(reserve, 2 * size);
                    return Err(err);
                }
            }

            Ok(reserve as *mut u8)
        }
    }

    /// Capacity `S` of the ring.
    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.size
    }

    /// Number of produced but not yet consumed bytes (`tail - head`).
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.tail - self.head
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    #[inline(always)]
    pub fn head(&self) -> usize {
        self.head
    }

    #[inline(always)]
    pub fn tail(&self) -> usize {
        self.tail
    }

    /// Contiguous view of `[head, tail)`.
    #[inline(always)]
    pub fn unconsumed(&self) -> &[u8] {
        // SAFETY: head < S and tail <= head + S, so the window lies inside the 2*S mapping.
        unsafe { std::slice::from_raw_parts(self.base.add(self.head), self.tail - self.head) }
    }

    /// Contiguous writable view of `[tail, head + S)`.
    #[inline(always)]
    pub fn remaining_mut(&mut self) -> &mut [u8] {
        let free = self.size - (self.tail - self.head);
        // SAFETY: tail + free = head + S < 2*S.
        unsafe { std::slice::from_raw_parts_mut(self.base.add(self.tail), free) }
    }

    /// Marks `n` bytes of the remaining view as filled.
    #[inline]
    pub fn produce(&mut self, n: usize) {
        assert!(
            n <= self.size - self.len(),
            "produce({n}) exceeds free capacity {}",
            self.size - self.len()
        );
        self.tail += n;
    }

    /// Releases `n` bytes from the front of the unconsumed view.
    ///
    /// Once `head` reaches the second mapping both cursors slide down by `S`;
    /// the bytes at those offsets are identical, so callers never observe it.
    #[inline]
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.len(), "consume({n}) exceeds unconsumed {}", self.len());
        self.head += n;
        if self.head >= self.size {
            self.head -= self.size;
            self.tail -= self.size;
        }
    }

    pub fn reset(&mut self) {
        self.head = 0;
        self.tail = 0;
    }
}

impl Drop for CircularBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, 2 * self.size);
        }
    }
}

impl std::fmt::Debug for CircularBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircularBuffer")
            .field("size", &self.size)
            .field("head", &self.head)
            .field("tail", &self.tail)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> usize {
        syscalls::page_size()
    }

    #[test]
    fn rejects_bad_sizes() {
        let err = CircularBuffer::new(0).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
        let err = CircularBuffer::new(page() + 1).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }

    #[test]
    fn starts_empty() {
        let mut cb = CircularBuffer::new(page()).unwrap();
        assert_eq!(cb.capacity(), page());
        assert!(cb.unconsumed().is_empty());
        assert_eq!(cb.remaining_mut().len(), page());
    }

    #[test]
    fn halves_alias_the_same_memory() {
        let size = page();
        let mut cb = CircularBuffer::new(size).unwrap();
        cb.remaining_mut()[0] = 0xAB;
        let mirrored = unsafe { *cb.base.add(size) };
        assert_eq!(mirrored, 0xAB);
    }

    #[test]
    fn fifo_across_the_seam() {
        let size = page();
        let mut cb = CircularBuffer::new(size).unwrap();

        // Move the cursors close to the seam.
        let skip = size - 3;
        cb.produce(skip);
        cb.consume(skip);

        let data = b"0123456789";
        cb.remaining_mut()[..data.len()].copy_from_slice(data);
        cb.produce(data.len());
        assert_eq!(cb.unconsumed(), data);
        assert_eq!(cb.len(), data.len());

        // Consuming past S slides both cursors without changing the content.
        cb.consume(4);
        assert!(cb.head() < size);
        assert_eq!(cb.unconsumed(), b"456789");
        assert_eq!(cb.remaining_mut().len(), size - 6);
    }

    #[test]
    fn slide_preserves_content_and_capacity() {
        let size = page();
        let mut cb = CircularBuffer::new(size).unwrap();
        let mut expected = Vec::new();
        let mut counter = 0u8;

        for round in 0..8 {
            let chunk = size / 3 + round;
            let free = cb.remaining_mut().len();
            let n = chunk.min(free);
            for b in cb.remaining_mut()[..n].iter_mut() {
                *b = counter;
                expected.push(counter);
                counter = counter.wrapping_add(1);
            }
            cb.produce(n);
            assert_eq!(cb.unconsumed(), &expected[..]);

            let drop_n = n / 2 + 1;
            let before = cb.unconsumed()[drop_n..].to_vec();
            cb.consume(drop_n);
            expected.drain(..drop_n);
            assert_eq!(cb.unconsumed(), &before[..]);
            assert_eq!(cb.len() + cb.remaining_mut().len(), size);
            assert!(cb.head() < size);
        }
    }

    #[test]
    fn reset_clears_cursors() {
        let mut cb = CircularBuffer::new(page()).unwrap();
        cb.produce(10);
        cb.consume(3);
        cb.reset();
        assert_eq!((cb.head(), cb.tail()), (0, 0));
        assert!(cb.is_empty());
    }

    #[test]
    #[should_panic]
    fn produce_past_capacity_panics() {
        let mut cb = CircularBuffer::new(page()).unwrap();
        cb.produce(page() + 1);
    }
}
