//! Extranonce allocation.
//!
//! Each live session gets a distinct prefix for the top bytes of the nonce so
//! miners on the same job never search the same space. Values return to the
//! pool when the session ends.

use std::fmt;

use bitvec::prelude::*;
use parking_lot::Mutex;
use thiserror::Error;

/// Widest extranonce the bridge hands out, in bytes.
pub const MAX_EXTRANONCE_SIZE: usize = 3;

/// Every extranonce value of the configured width is in use.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("all {0} extranonce values are in use")]
pub struct ExtranonceError(pub usize);

/// A session's nonce prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extranonce {
    value: u32,
    size: usize,
}

impl Extranonce {
    /// The zero-width extranonce used when isolation is disabled.
    pub const EMPTY: Self = Self { value: 0, size: 0 };

    pub fn value(&self) -> u32 {
        self.value
    }

    /// Width in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Big-endian hex, two characters per byte.
    pub fn to_hex(&self) -> String {
        if self.size == 0 {
            return String::new();
        }
        format!("{:0width$x}", self.value, width = self.size * 2)
    }
}

impl fmt::Display for Extranonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

struct Slots {
    in_use: BitVec,
    cursor: usize,
}

/// Hands out unique extranonces of a fixed width.
pub struct ExtranonceAllocator {
    size: usize,
    slots: Mutex<Slots>,
}

impl ExtranonceAllocator {
    /// Create an allocator for `size`-byte values, clamped to
    /// [`MAX_EXTRANONCE_SIZE`].
    pub fn new(size: usize) -> Self {
        let size = size.min(MAX_EXTRANONCE_SIZE);
        let capacity = if size == 0 { 0 } else { 1usize << (8 * size) };
        Self {
            size,
            slots: Mutex::new(Slots {
                in_use: bitvec![0; capacity],
                cursor: 0,
            }),
        }
    }

    /// Width in bytes of the values handed out.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Take a free value.
    ///
    /// The search starts after the most recent allocation, so a value
    /// released a moment ago is the last to be handed out again.
    pub fn allocate(&self) -> Result<Extranonce, ExtranonceError> {
        if self.size == 0 {
            return Ok(Extranonce::EMPTY);
        }

        let mut slots = self.slots.lock();
        let capacity = slots.in_use.len();
        let cursor = slots.cursor;

        let free = slots.in_use[cursor..]
            .first_zero()
            .map(|i| cursor + i)
            .or_else(|| slots.in_use[..cursor].first_zero())
            .ok_or(ExtranonceError(capacity))?;

        slots.in_use.set(free, true);
        slots.cursor = (free + 1) % capacity;

        Ok(Extranonce {
            value: free as u32,
            size: self.size,
        })
    }

    /// Return a value to the pool.
    pub fn release(&self, extranonce: Extranonce) {
        if extranonce.size != self.size || self.size == 0 {
            return;
        }
        let mut slots = self.slots.lock();
        let index = extranonce.value as usize;
        if index < slots.in_use.len() {
            slots.in_use.set(index, false);
        }
    }

    /// Number of values currently handed out.
    pub fn in_use(&self) -> usize {
        self.slots.lock().in_use.count_ones()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_zero_width_is_always_empty() {
        let alloc = ExtranonceAllocator::new(0);
        for _ in 0..1000 {
            let e = alloc.allocate().unwrap();
            assert!(e.is_empty());
            assert_eq!(e.to_hex(), "");
        }
    }

    #[test]
    fn test_size_is_clamped() {
        assert_eq!(ExtranonceAllocator::new(7).size(), 3);
    }

    #[test]
    fn test_exhaustion_and_reuse() {
        let alloc = ExtranonceAllocator::new(1);
        let all: Vec<Extranonce> = (0..256).map(|_| alloc.allocate().unwrap()).collect();
        assert_eq!(all[0].value(), 0);
        assert_eq!(alloc.allocate(), Err(ExtranonceError(256)));

        alloc.release(all[17]);
        let again = alloc.allocate().unwrap();
        assert_eq!(again.value(), 17);
        assert_eq!(again.to_hex(), "11");
    }

    #[test]
    fn test_released_value_not_reused_immediately() {
        let alloc = ExtranonceAllocator::new(2);
        let first = alloc.allocate().unwrap();
        alloc.release(first);
        let second = alloc.allocate().unwrap();
        assert_ne!(first, second);
        assert_eq!(second.to_hex(), "0001");
    }

    #[test]
    fn test_concurrent_allocations_are_distinct() {
        let alloc = Arc::new(ExtranonceAllocator::new(2));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let alloc = alloc.clone();
                std::thread::spawn(move || {
                    (0..500)
                        .map(|_| alloc.allocate().unwrap().value())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for v in h.join().unwrap() {
                assert!(seen.insert(v), "duplicate extranonce {}", v);
            }
        }
        assert_eq!(alloc.in_use(), 4000);
    }
}
