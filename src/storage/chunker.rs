//! Content-defined chunking with a gear rolling hash.
//!
//! Boundaries depend only on the bytes near them, so identical content in
//! different nodes (or at shifted positions) yields identical chunks, which
//! is what lets the chunk store deduplicate across nodes.

use crate::types::{CairnError, Result};

/// Hard ceiling on a single chunk.
pub const MAX_CHUNK_LEN: usize = 4096;

const fn gear_table() -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut state = 0x243F_6A88_85A3_08D3u64;
    let mut i = 0;
    while i < 256 {
        state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        table[i] = z ^ (z >> 31);
        i += 1;
    }
    table
}

static GEAR: [u64; 256] = gear_table();

/// Chunk size parameters.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChunkerConfig {
    /// No boundary is placed before this many bytes.
    pub min_len: usize,
    /// Boundary probability per byte is `2^-avg_bits` past `min_len`.
    pub avg_bits: u32,
    /// Forced boundary; never above [`MAX_CHUNK_LEN`].
    pub max_len: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            min_len: 512,
            avg_bits: 10,
            max_len: MAX_CHUNK_LEN,
        }
    }
}

impl ChunkerConfig {
    /// Checks `min_len <= avg_len <= max_len <= MAX_CHUNK_LEN`.
    pub fn validate(&self) -> Result<()> {
        if self.min_len == 0
            || self.min_len > self.max_len
            || self.max_len > MAX_CHUNK_LEN
            || !(1..=32).contains(&self.avg_bits)
        {
            return Err(CairnError::Invalid(format!(
                "chunker bounds are inconsistent: {self:?}"
            )));
        }
        Ok(())
    }

    fn mask(&self) -> u64 {
        // High bits of a shift-left gear hash carry the most history.
        ((1u64 << self.avg_bits) - 1) << (64 - self.avg_bits)
    }

    /// Length of the first chunk of `data`.
    pub fn cut_point(&self, data: &[u8]) -> usize {
        if data.len() <= self.min_len {
            return data.len();
        }
        let limit = data.len().min(self.max_len);
        let mask = self.mask();
        let mut hash = 0u64;
        for (i, &byte) in data.iter().enumerate().take(limit).skip(self.min_len) {
            hash = (hash << 1).wrapping_add(GEAR[byte as usize]);
            if hash & mask == 0 {
                return i + 1;
            }
        }
        limit
    }

    /// Splits `data` into content-defined chunks.
    pub fn split<'a>(&self, data: &'a [u8]) -> Chunks<'a> {
        Chunks {
            config: *self,
            rest: data,
        }
    }
}

/// Iterator over the chunks of a byte slice.
pub struct Chunks<'a> {
    config: ChunkerConfig,
    rest: &'a [u8],
}

impl<'a> Iterator for Chunks<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        let cut = self.config.cut_point(self.rest);
        let (head, tail) = self.rest.split_at(cut);
        self.rest = tail;
        Some(head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                (state >> 33) as u8
            })
            .collect()
    }

    #[test]
    fn empty_input_has_no_chunks() {
        assert_eq!(ChunkerConfig::default().split(&[]).count(), 0);
    }

    #[test]
    fn small_input_is_one_chunk() {
        let chunks: Vec<_> = ChunkerConfig::default().split(b"hello").collect();
        assert_eq!(chunks, vec![b"hello".as_slice()]);
    }

    #[test]
    fn boundaries_resynchronize_after_insert() {
        let config = ChunkerConfig::default();
        let original = pseudo_random(64 * 1024, 7);
        let mut shifted = vec![0xAA];
        shifted.extend_from_slice(&original);

        let a: HashSet<&[u8]> = config.split(&original).collect();
        let b: Vec<&[u8]> = config.split(&shifted).collect();
        let shared = b.iter().filter(|c| a.contains(*c)).count();
        assert!(
            shared * 2 >= b.len(),
            "only {shared} of {} chunks survived a one-byte insert",
            b.len()
        );
    }

    #[test]
    fn rejects_bad_config() {
        let mut config = ChunkerConfig::default();
        config.max_len = MAX_CHUNK_LEN + 1;
        assert!(config.validate().is_err());
        config = ChunkerConfig::default();
        config.min_len = 0;
        assert!(config.validate().is_err());
        assert!(ChunkerConfig::default().validate().is_ok());
    }

    proptest! {
        #[test]
        fn join_of_split_is_identity(data in prop::collection::vec(any::<u8>(), 0..20_000)) {
            let config = ChunkerConfig::default();
            let chunks: Vec<&[u8]> = config.split(&data).collect();
            prop_assert!(chunks.iter().all(|c| !c.is_empty() && c.len() <= MAX_CHUNK_LEN));
            prop_assert_eq!(chunks.concat(), data.clone());
            let again: Vec<&[u8]> = config.split(&data).collect();
            prop_assert_eq!(chunks, again);
        }
    }
}
