use crate::crypto::{Compression, CryptoSuite};

/// A chunk's keyring row (spec §3 Chunk / §4.2 Keyring): content address
/// (`tag`), content-derived symmetric key (`key`), the compression mode
/// chosen at encode time, and the on-disk slot length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMeta {
    pub tag: Vec<u8>,
    pub key: Vec<u8>,
    pub compression: Compression,
    pub length: u32,
}

impl ChunkMeta {
    pub fn validate(&self, suite: CryptoSuite) -> bool {
        self.tag.len() == suite.hashlen() && self.key.len() == suite.hashlen()
    }
}

/// A chunk index, `i` in spec §3, always `< N`.
pub type ChunkIndex = u64;
