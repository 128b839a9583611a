use std::str::FromStr;

use crate::error::{ErrorKind, PkError};

/// Crypto suite for a parcel. Only the canonical suite is defined (spec §3):
/// AES-128-CBC for encryption, SHA-1 for tag/key derivation, PKCS#5 padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CryptoSuite {
    AesSha1,
}

impl CryptoSuite {
    /// Length in bytes of a tag or key under this suite.
    pub fn hashlen(self) -> usize {
        match self {
            CryptoSuite::AesSha1 => 20,
        }
    }

    /// Cipher block size in bytes.
    pub fn block_size(self) -> usize {
        match self {
            CryptoSuite::AesSha1 => 16,
        }
    }

    pub fn as_cfg_str(self) -> &'static str {
        match self {
            CryptoSuite::AesSha1 => "aes-sha1",
        }
    }
}

impl FromStr for CryptoSuite {
    type Err = PkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aes-sha1" => Ok(CryptoSuite::AesSha1),
            other => Err(PkError::new(
                ErrorKind::InvalidArgument,
                format!("unknown crypto suite '{other}'"),
            )),
        }
    }
}

/// Compression algorithms a parcel may allow (spec §4.1). Order in a
/// parcel's `required_compress` set is a preference order: first match wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Compression {
    None,
    Zlib,
    Lzf,
    LzfStream,
    Lzma,
}

impl Compression {
    pub fn as_cfg_str(self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Zlib => "zlib",
            Compression::Lzf => "lzf",
            Compression::LzfStream => "lzf-stream",
            Compression::Lzma => "lzma",
        }
    }

    /// Numeric tag stored in the keyring/hoard `compression`/`crypto` columns.
    pub fn as_tag(self) -> i64 {
        match self {
            Compression::None => 0,
            Compression::Zlib => 1,
            Compression::Lzf => 2,
            Compression::LzfStream => 3,
            Compression::Lzma => 4,
        }
    }

    pub fn from_tag(tag: i64) -> Option<Self> {
        match tag {
            0 => Some(Compression::None),
            1 => Some(Compression::Zlib),
            2 => Some(Compression::Lzf),
            3 => Some(Compression::LzfStream),
            4 => Some(Compression::Lzma),
            _ => None,
        }
    }
}

impl FromStr for Compression {
    type Err = PkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Compression::None),
            "zlib" => Ok(Compression::Zlib),
            "lzf" => Ok(Compression::Lzf),
            "lzf-stream" => Ok(Compression::LzfStream),
            "lzma" => Ok(Compression::Lzma),
            other => Err(PkError::new(
                ErrorKind::InvalidArgument,
                format!("unknown compression '{other}'"),
            )),
        }
    }
}

/// Parses a comma-separated `COMPRESS` value (spec §6.1), preserving order
/// since order is the encode-time preference order.
pub fn parse_compress_set(s: &str) -> Result<Vec<Compression>, PkError> {
    s.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Compression::from_str)
        .collect()
}
