//! Growable byte buffer with explicit capacity discipline.
//!
//! `Buf` separates allocated capacity from used length so readers can fill
//! the tail in place. Fixed-capacity buffers refuse to grow; that is how
//! stream receive bounds are enforced.

use bitflags::bitflags;

use crate::Error;
use crate::util::clear_memory_secure;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BufFlags: u8 {
        /// Capacity set at construction is a hard bound.
        const FIXED_CAPACITY = 1 << 0;
        /// Wipe the backing storage on drop.
        const CLEAR_ON_FREE = 1 << 1;
    }
}

#[derive(Debug, Default)]
pub struct Buf {
    data: Vec<u8>,
    used: usize,
    flags: BufFlags,
}

impl Buf {
    /// Empty growable buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixed-capacity buffer; appends beyond `cap` fail with `NoSpace`.
    pub fn with_fixed_capacity(cap: usize) -> Self {
        Buf {
            data: vec![0; cap],
            used: 0,
            flags: BufFlags::FIXED_CAPACITY,
        }
    }

    pub fn with_flags(flags: BufFlags) -> Self {
        Buf {
            data: Vec::new(),
            used: 0,
            flags,
        }
    }

    pub fn flags(&self) -> BufFlags {
        self.flags
    }

    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.used]
    }

    /// Ensure at least `chunk` writable bytes past the used region and
    /// return the tail. Fails with `NoSpace` on a full fixed buffer; a
    /// partially full fixed buffer returns whatever room remains.
    pub fn reserve_tail(&mut self, chunk: usize) -> Result<&mut [u8], Error> {
        if self.used == self.data.len() {
            if self.flags.contains(BufFlags::FIXED_CAPACITY) {
                return Err(Error::NoSpace);
            }
            let grown = crate::util::checked_add(self.data.len(), chunk)?;
            self.data.resize(grown, 0);
        }
        Ok(&mut self.data[self.used..])
    }

    /// Mark `n` bytes written into the tail returned by [`reserve_tail`] as
    /// used.
    ///
    /// [`reserve_tail`]: Buf::reserve_tail
    pub fn commit(&mut self, n: usize) {
        debug_assert!(self.used + n <= self.data.len());
        self.used += n;
    }

    pub fn append(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.insert(self.used, bytes)
    }

    pub fn insert(&mut self, at: usize, bytes: &[u8]) -> Result<(), Error> {
        if at > self.used {
            return Err(Error::InvalidArgument);
        }
        let new_used = crate::util::checked_add(self.used, bytes.len())?;
        if new_used > self.data.len() {
            if self.flags.contains(BufFlags::FIXED_CAPACITY) {
                return Err(Error::NoSpace);
            }
            self.data.resize(new_used, 0);
        }
        self.data.copy_within(at..self.used, at + bytes.len());
        self.data[at..at + bytes.len()].copy_from_slice(bytes);
        self.used = new_used;
        Ok(())
    }

    /// Drop `n` bytes off the front, shifting the remainder down.
    pub fn remove_front(&mut self, n: usize) -> Result<(), Error> {
        if n > self.used {
            return Err(Error::InvalidArgument);
        }
        self.data.copy_within(n..self.used, 0);
        self.used -= n;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.used = 0;
    }
}

impl Drop for Buf {
    fn drop(&mut self) {
        if self.flags.contains(BufFlags::CLEAR_ON_FREE) {
            clear_memory_secure(&mut self.data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_remove_front() {
        let mut buf = Buf::new();
        buf.append(b"hello ").unwrap();
        buf.append(b"world").unwrap();
        assert_eq!(buf.as_slice(), b"hello world");
        buf.remove_front(6).unwrap();
        assert_eq!(buf.as_slice(), b"world");
        assert!(matches!(buf.remove_front(6), Err(Error::InvalidArgument)));
    }

    #[test]
    fn insert_shifts_tail() {
        let mut buf = Buf::new();
        buf.append(b"helloworld").unwrap();
        buf.insert(5, b", ").unwrap();
        assert_eq!(buf.as_slice(), b"hello, world");
        assert!(matches!(buf.insert(99, b"x"), Err(Error::InvalidArgument)));
    }

    #[test]
    fn fixed_capacity_is_a_hard_bound() {
        let mut buf = Buf::with_fixed_capacity(4);
        buf.append(b"abcd").unwrap();
        assert!(matches!(buf.append(b"e"), Err(Error::NoSpace)));
        assert!(matches!(buf.reserve_tail(1), Err(Error::NoSpace)));
        buf.remove_front(2).unwrap();
        buf.append(b"ef").unwrap();
        assert_eq!(buf.as_slice(), b"cdef");
    }

    #[test]
    fn reserve_tail_grows_and_commits() {
        let mut buf = Buf::new();
        let tail = buf.reserve_tail(8).unwrap();
        assert!(tail.len() >= 8);
        tail[..3].copy_from_slice(b"abc");
        buf.commit(3);
        assert_eq!(buf.as_slice(), b"abc");
        // partially full fixed buffer hands out the remaining room
        let mut fixed = Buf::with_fixed_capacity(4);
        fixed.append(b"ab").unwrap();
        assert_eq!(fixed.reserve_tail(16).unwrap().len(), 2);
    }
}
