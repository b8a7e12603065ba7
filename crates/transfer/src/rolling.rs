//! Weak rolling checksum over a fixed-size window.
//!
//! rsync-style sums: `a = Σ x_i` and `b = Σ (n - i) x_i`, both taken
//! mod 2^16 and packed as `a | b << 16`. Sliding the window by one byte
//! is O(1).

/// Rolling checksum state for a window of `len` bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollingChecksum {
    a: u32,
    b: u32,
    len: u32,
}

impl RollingChecksum {
    /// Computes the checksum of a full window.
    pub fn new(window: &[u8]) -> Self {
        let len = window.len() as u32;
        let mut a: u32 = 0;
        let mut b: u32 = 0;
        for (i, &byte) in window.iter().enumerate() {
            a = a.wrapping_add(u32::from(byte));
            b = b.wrapping_add((len - i as u32).wrapping_mul(u32::from(byte)));
        }
        Self { a, b, len }
    }

    /// Slides the window: drops `out` from the front and appends `inp`.
    pub fn roll(&mut self, out: u8, inp: u8) {
        self.a = self
            .a
            .wrapping_sub(u32::from(out))
            .wrapping_add(u32::from(inp));
        self.b = self
            .b
            .wrapping_sub(self.len.wrapping_mul(u32::from(out)))
            .wrapping_add(self.a);
    }

    /// Packed 32-bit weak checksum.
    pub fn value(&self) -> u32 {
        (self.a & 0xFFFF) | ((self.b & 0xFFFF) << 16)
    }

    /// Window length this checksum covers.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Weak checksum of a whole block.
pub(crate) fn weak_checksum(block: &[u8]) -> u32 {
    RollingChecksum::new(block).value()
}
