//! 32-bit FNV-1a, the integrity hash of the file-transfer protocol.

/// Incremental FNV-1a hasher.
///
/// Offset basis `0x811c9dc5`, prime `0x01000193`. The unit re-reads a
/// finished transfer in fixed-size chunks and feeds them through `update`;
/// the hub computes the same hash before sending `file_transfer.end`.
#[derive(Debug, Clone, Copy)]
pub struct Fnv1a {
    state: u32,
}

const OFFSET_BASIS: u32 = 0x811c_9dc5;
const PRIME: u32 = 0x0100_0193;

impl Fnv1a {
    /// Fresh hasher at the offset basis.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: OFFSET_BASIS,
        }
    }

    /// Fold a chunk of bytes into the running hash.
    pub fn update(&mut self, data: &[u8]) {
        for &b in data {
            self.state ^= u32::from(b);
            self.state = self.state.wrapping_mul(PRIME);
        }
    }

    /// Current hash value.
    #[must_use]
    pub const fn finish(&self) -> u32 {
        self.state
    }

    /// Hash a complete byte slice in one call.
    #[must_use]
    pub fn hash(data: &[u8]) -> u32 {
        let mut h = Self::new();
        h.update(data);
        h.finish()
    }
}

impl Default for Fnv1a {
    fn default() -> Self {
        Self::new()
    }
}
