use std::collections::HashSet;
use std::path::Path;

use crate::crypto::{parse_compress_set, Compression, CryptoSuite};
use crate::error::{ErrorKind, PkError};

/// In-memory form of `parcel.cfg` (spec §6.1): a named logical image with a
/// stable UUID, geometry, crypto suite, and the compression set it permits.
#[derive(Debug, Clone)]
pub struct Parcel {
    pub version: u32,
    pub chunk_size: u32,
    pub num_chunks: u64,
    pub chunks_per_dir: u32,
    pub crypto: CryptoSuite,
    pub compress: Vec<Compression>,
    pub uuid: uuid::Uuid,
    pub server: String,
    pub user: String,
    pub name: String,
    pub rpath: String,
}

impl Parcel {
    /// Total logical size in bytes, `S` in spec §3. `parcel.cfg` only
    /// records `NUMCHUNKS`, not `S` itself, so this is `NUMCHUNKS *
    /// chunk_size` and the final chunk's unused tail is never tracked
    /// separately.
    pub fn logical_size(&self) -> u64 {
        self.num_chunks * self.chunk_size as u64
    }

    pub fn required_compress(&self) -> HashSet<Compression> {
        self.compress.iter().copied().collect()
    }

    pub fn verify_chunk_size(size: u32) -> Result<(), PkError> {
        if size < 512 || !size.is_power_of_two() {
            return Err(PkError::new(
                ErrorKind::InvalidArgument,
                format!("chunk size {size} must be a power of two >= 512"),
            ));
        }
        Ok(())
    }

    /// Parses a `KEY = VALUE`, line-oriented `parcel.cfg` (spec §6.1).
    /// Unknown keys are ignored; all of `VERSION`, `CHUNKSIZE`, `NUMCHUNKS`,
    /// `CHUNKSPERDIR`, `CRYPTO`, `COMPRESS`, `UUID`, `SERVER`, `USER`,
    /// `PARCEL`, `RPATH` are required.
    pub fn parse(data: &str) -> Result<Self, PkError> {
        let mut version = None;
        let mut chunk_size = None;
        let mut num_chunks = None;
        let mut chunks_per_dir = None;
        let mut crypto = None;
        let mut compress = None;
        let mut uuid = None;
        let mut server = None;
        let mut user = None;
        let mut name = None;
        let mut rpath = None;

        for (lineno, line) in data.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(PkError::new(
                    ErrorKind::BadFormat,
                    format!("parcel.cfg:{}: expected 'KEY = VALUE'", lineno + 1),
                ));
            };
            let key = key.trim();
            let value = value.trim();

            match key {
                "VERSION" => version = Some(parse_u32(key, value)?),
                "CHUNKSIZE" => chunk_size = Some(parse_u32(key, value)?),
                "NUMCHUNKS" => num_chunks = Some(parse_u64(key, value)?),
                "CHUNKSPERDIR" => chunks_per_dir = Some(parse_u32(key, value)?),
                "CRYPTO" => crypto = Some(value.parse::<CryptoSuite>()?),
                "COMPRESS" => compress = Some(parse_compress_set(value)?),
                "UUID" => {
                    uuid = Some(uuid::Uuid::parse_str(value).map_err(|e| {
                        PkError::new(ErrorKind::BadFormat, format!("bad UUID: {e}"))
                    })?)
                }
                "SERVER" => server = Some(value.to_string()),
                "USER" => user = Some(value.to_string()),
                "PARCEL" => name = Some(value.to_string()),
                "RPATH" => rpath = Some(value.to_string()),
                _ => { /* unknown keys ignored, per spec */ }
            }
        }

        let version = require(version, "VERSION")?;
        if !(3..=4).contains(&version) {
            return Err(PkError::new(
                ErrorKind::BadFormat,
                format!("unsupported parcel.cfg VERSION {version}"),
            ));
        }
        let chunk_size = require(chunk_size, "CHUNKSIZE")?;
        Self::verify_chunk_size(chunk_size)?;

        Ok(Parcel {
            version,
            chunk_size,
            num_chunks: require(num_chunks, "NUMCHUNKS")?,
            chunks_per_dir: require(chunks_per_dir, "CHUNKSPERDIR")?,
            crypto: require(crypto, "CRYPTO")?,
            compress: require(compress, "COMPRESS")?,
            uuid: require(uuid, "UUID")?,
            server: require(server, "SERVER")?,
            user: require(user, "USER")?,
            name: require(name, "PARCEL")?,
            rpath: require(rpath, "RPATH")?,
        })
    }

    pub fn load(path: &Path) -> Result<Self, PkError> {
        let data = std::fs::read_to_string(path)?;
        Self::parse(&data)
    }

    /// Number of chunks in the sub-directory at index `dir`, used when
    /// laying out `{prefix}/{dir:04}/{idx:04}` paths (spec §6.2).
    pub fn chunk_path_components(&self, index: u64) -> (u64, u64) {
        let d = self.chunks_per_dir as u64;
        (index / d, index % d)
    }
}

fn require<T>(value: Option<T>, key: &str) -> Result<T, PkError> {
    value.ok_or_else(|| PkError::new(ErrorKind::BadFormat, format!("missing key {key} in parcel.cfg")))
}

fn parse_u32(key: &str, value: &str) -> Result<u32, PkError> {
    value
        .parse()
        .map_err(|_| PkError::new(ErrorKind::BadFormat, format!("bad integer for {key}: {value}")))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, PkError> {
    value
        .parse()
        .map_err(|_| PkError::new(ErrorKind::BadFormat, format!("bad integer for {key}: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> String {
        "VERSION = 4\n\
         CHUNKSIZE = 131072\n\
         NUMCHUNKS = 10\n\
         CHUNKSPERDIR = 4096\n\
         CRYPTO = aes-sha1\n\
         COMPRESS = zlib,none\n\
         UUID = 4b6e34a1-6e1f-4f1a-9a2e-2a6c2a9b0a11\n\
         SERVER = example.org\n\
         USER = alice\n\
         PARCEL = demo\n\
         RPATH = /parcels/demo\n\
         UNKNOWNKEY = ignored\n"
            .to_string()
    }

    #[test]
    fn parses_required_keys_and_ignores_unknown() {
        let parcel = Parcel::parse(&sample()).unwrap();
        assert_eq!(parcel.chunk_size, 131072);
        assert_eq!(parcel.num_chunks, 10);
        assert_eq!(parcel.compress, vec![Compression::Zlib, Compression::None]);
        assert_eq!(parcel.chunk_path_components(4100), (1, 4));
    }

    #[test]
    fn rejects_bad_chunk_size() {
        let bad = sample().replace("CHUNKSIZE = 131072", "CHUNKSIZE = 131073");
        assert!(Parcel::parse(&bad).is_err());
    }

    #[test]
    fn rejects_missing_key() {
        let bad = sample().replace("UUID = 4b6e34a1-6e1f-4f1a-9a2e-2a6c2a9b0a11\n", "");
        assert!(Parcel::parse(&bad).is_err());
    }
}
