// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Cyclic bitmap index allocator underlying the hardware object
//! namespaces (QP numbers, EQ numbers, tracked slave resources, ...).

use parking_lot::Mutex;

/// A cyclic bitmap allocator.
///
/// A set bit means "allocated". Allocation scans forward from a cursor
/// so indices are handed out round-robin, which keeps recently freed
/// indices out of circulation for as long as possible; freeing pulls the
/// cursor back so reuse is biased toward low indices. `top` is XORed
/// into every returned index, partitioning one physical table into
/// per-function logical windows.
pub struct ResourceBitmap {
    inner: Mutex<Inner>,
}

struct Inner {
    table: Vec<u64>,
    /// Scan cursor: the next allocation starts here.
    last: u32,
    top: u32,
    /// Effective range: bits at `max..` belong to the reserved top.
    max: u32,
    avail: u32,
}

impl ResourceBitmap {
    /// Creates an allocator for `num` indices (a power of two), with
    /// `reserved_bot` indices pre-allocated at the bottom and
    /// `reserved_top` excluded from the range entirely. `top` is XORed
    /// into returned indices.
    pub fn new(num: u32, top: u32, reserved_bot: u32, reserved_top: u32) -> Self {
        assert!(num.is_power_of_two());
        assert!(reserved_bot + reserved_top <= num);
        let mut inner = Inner {
            table: vec![0; (num as usize).div_ceil(64)],
            last: reserved_bot,
            top,
            max: num - reserved_top,
            avail: num - reserved_top - reserved_bot,
        };
        for i in 0..reserved_bot {
            inner.set(i);
        }
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Allocates one index.
    pub fn alloc(&self) -> Option<u32> {
        let mut inner = self.inner.lock();
        let start = inner.last;
        let max = inner.max;
        let obj = inner
            .find_zero(start, max)
            .or_else(|| inner.find_zero(0, max))?;
        inner.set(obj);
        inner.last = obj + 1;
        if inner.last >= inner.max {
            inner.last = 0;
        }
        inner.avail -= 1;
        Some(obj ^ inner.top)
    }

    /// Allocates `count` consecutive indices, the first aligned to
    /// `align` (a power of two).
    pub fn alloc_range(&self, count: u32, align: u32) -> Option<u32> {
        assert!(align.is_power_of_two());
        assert!(count > 0);
        let mut inner = self.inner.lock();
        let start = inner.last;
        let max = inner.max;
        let obj = inner
            .find_zero_area(start, max, count, align)
            .or_else(|| inner.find_zero_area(0, max, count, align))?;
        for i in obj..obj + count {
            inner.set(i);
        }
        inner.last = obj + count;
        if inner.last >= inner.max {
            inner.last = 0;
        }
        inner.avail -= count;
        Some(obj ^ inner.top)
    }

    /// Frees one index. Callers must not double-free.
    pub fn free(&self, index: u32) {
        self.free_range(index, 1);
    }

    /// Frees `count` consecutive indices starting at `index`.
    pub fn free_range(&self, index: u32, count: u32) {
        let mut inner = self.inner.lock();
        let obj = index ^ inner.top;
        for i in obj..obj + count {
            inner.clear(i);
        }
        // Bias reuse toward low indices.
        inner.last = inner.last.min(obj);
        inner.avail += count;
    }

    /// The number of currently allocatable indices.
    pub fn avail(&self) -> u32 {
        self.inner.lock().avail
    }
}

impl Inner {
    fn set(&mut self, bit: u32) {
        self.table[bit as usize / 64] |= 1 << (bit % 64);
    }

    fn clear(&mut self, bit: u32) {
        self.table[bit as usize / 64] &= !(1 << (bit % 64));
    }

    fn is_set(&self, bit: u32) -> bool {
        self.table[bit as usize / 64] & (1 << (bit % 64)) != 0
    }

    fn find_zero(&self, from: u32, to: u32) -> Option<u32> {
        (from..to).find(|&i| !self.is_set(i))
    }

    fn find_zero_area(&self, from: u32, to: u32, count: u32, align: u32) -> Option<u32> {
        let mut i = from.next_multiple_of(align);
        while i + count <= to {
            match (i..i + count).find(|&b| self.is_set(b)) {
                None => return Some(i),
                Some(busy) => i = (busy + 1).next_multiple_of(align),
            }
        }
        None
    }
}
