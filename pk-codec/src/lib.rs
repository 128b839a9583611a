//! Chunk encode/decode pipeline: compress, encrypt, hash (spec §4.1).
//!
//! `Codec::encode` turns a plaintext chunk into the ciphertext blob that
//! actually gets stored, plus the `(tag, key, compression)` triple the
//! keyring indexes it by. `Codec::decode` is its inverse. Determinism of
//! `encode` (same plaintext, same allowed-compression set ⇒ bit-identical
//! blob) is the invariant the whole store's deduplication rests on.

pub mod compress;

use openssl::symm::{Cipher, Crypter, Mode};
use openssl::hash::{hash, MessageDigest};

use pk_types::error::{ErrorKind, PkError};
use pk_types::{Compression, CryptoSuite};

pub struct EncodeResult {
    pub blob: Vec<u8>,
    pub tag: Vec<u8>,
    pub key: Vec<u8>,
    pub compression: Compression,
}

fn digest_for(suite: CryptoSuite) -> MessageDigest {
    match suite {
        CryptoSuite::AesSha1 => MessageDigest::sha1(),
    }
}

fn cipher_for(suite: CryptoSuite) -> Cipher {
    match suite {
        CryptoSuite::AesSha1 => Cipher::aes_128_cbc(),
    }
}

fn hash_suite(suite: CryptoSuite, data: &[u8]) -> Result<Vec<u8>, PkError> {
    hash(digest_for(suite), data)
        .map(|d| d.to_vec())
        .map_err(|e| PkError::new(ErrorKind::CallFail, format!("digest failed: {e}")))
}

/// Encrypts `payload` under `key` with a zero IV (spec §4.1 step 3: the
/// key is itself a function of the plaintext, so a fixed IV does not
/// weaken the scheme and lets identical plaintexts collapse to identical
/// ciphertext for dedup).
fn encrypt(suite: CryptoSuite, key: &[u8], payload: &[u8]) -> Result<Vec<u8>, PkError> {
    let cipher = cipher_for(suite);
    let iv = vec![0u8; cipher.block_size()];
    let mut crypter = Crypter::new(cipher, Mode::Encrypt, key, Some(&iv))
        .map_err(|e| PkError::new(ErrorKind::InvalidArgument, format!("crypter init: {e}")))?;
    crypter.pad(true);
    let mut out = vec![0u8; payload.len() + cipher.block_size()];
    let mut count = crypter
        .update(payload, &mut out)
        .map_err(|e| PkError::new(ErrorKind::CallFail, format!("encrypt update: {e}")))?;
    count += crypter
        .finalize(&mut out[count..])
        .map_err(|e| PkError::new(ErrorKind::CallFail, format!("encrypt finalize: {e}")))?;
    out.truncate(count);
    Ok(out)
}

/// Decrypts and manually validates PKCS#5 padding, since OpenSSL's own
/// padding check surfaces as a generic error and the spec requires a
/// dedicated `BAD_PADDING` kind (§4.1, §7).
fn decrypt(suite: CryptoSuite, key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, PkError> {
    let cipher = cipher_for(suite);
    let block = cipher.block_size();
    if ciphertext.is_empty() || ciphertext.len() % block != 0 {
        return Err(PkError::new(ErrorKind::BadFormat, "ciphertext not a multiple of block size"));
    }
    let iv = vec![0u8; block];
    let mut crypter = Crypter::new(cipher, Mode::Decrypt, key, Some(&iv))
        .map_err(|e| PkError::new(ErrorKind::InvalidArgument, format!("crypter init: {e}")))?;
    crypter.pad(false);
    let mut out = vec![0u8; ciphertext.len() + block];
    let mut count = crypter
        .update(ciphertext, &mut out)
        .map_err(|e| PkError::new(ErrorKind::CallFail, format!("decrypt update: {e}")))?;
    count += crypter
        .finalize(&mut out[count..])
        .map_err(|e| PkError::new(ErrorKind::CallFail, format!("decrypt finalize: {e}")))?;
    out.truncate(count);

    let pad_len = *out.last().ok_or_else(|| PkError::new(ErrorKind::BadPadding, "empty plaintext"))? as usize;
    if pad_len == 0 || pad_len > block || pad_len > out.len() {
        return Err(PkError::new(ErrorKind::BadPadding, "pad length out of range"));
    }
    let pad_start = out.len() - pad_len;
    if !out[pad_start..].iter().all(|&b| b as usize == pad_len) {
        return Err(PkError::new(ErrorKind::BadPadding, "pad bytes do not match pad length"));
    }
    out.truncate(pad_start);
    Ok(out)
}

/// Encodes `plaintext` per spec §4.1. `allowed` is tried in order;
/// the first candidate that saves at least one cipher block is kept,
/// else the pipeline falls back to `none`.
pub fn encode(
    plaintext: &[u8],
    allowed: &[Compression],
    suite: CryptoSuite,
) -> Result<EncodeResult, PkError> {
    if plaintext.is_empty() {
        return Err(PkError::new(ErrorKind::InvalidArgument, "cannot encode an empty chunk"));
    }
    let block = cipher_for(suite).block_size();
    let threshold = plaintext.len().saturating_sub(block);

    let mut chosen = Compression::None;
    let mut payload = plaintext.to_vec();
    for &candidate in allowed {
        if candidate == Compression::None {
            continue;
        }
        let candidate_bytes = compress::compress_all(candidate, plaintext)?;
        if candidate_bytes.len() < threshold {
            chosen = candidate;
            payload = candidate_bytes;
            break;
        }
    }

    let key = hash_suite(suite, &payload)?;
    let ciphertext = encrypt(suite, &key, &payload)?;
    let tag = hash_suite(suite, &ciphertext)?;

    Ok(EncodeResult {
        blob: ciphertext,
        tag,
        key,
        compression: chosen,
    })
}

/// Decodes a stored blob per spec §4.1. `expected_tag` is optional:
/// many callers skip it because the key-check below already catches
/// both wrong-key use and ciphertext corruption.
pub fn decode(
    blob: &[u8],
    expected_tag: Option<&[u8]>,
    key: &[u8],
    compression: Compression,
    expected_len: usize,
    suite: CryptoSuite,
) -> Result<Vec<u8>, PkError> {
    if let Some(expected_tag) = expected_tag {
        let actual_tag = hash_suite(suite, blob)?;
        if actual_tag != expected_tag {
            return Err(PkError::new(ErrorKind::TagMismatch, "blob tag does not match expected tag"));
        }
    }

    let payload = decrypt(suite, key, blob)?;
    let actual_key = hash_suite(suite, &payload)?;
    if actual_key != key {
        return Err(PkError::new(
            ErrorKind::KeyMismatch,
            "decrypted payload hash does not match key",
        ));
    }

    let plaintext = compress::decompress_all(compression, &payload, expected_len)?;
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lcg(seed: &mut u64) -> u8 {
        *seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (*seed >> 33) as u8
    }

    #[test]
    fn scenario_1_round_trip_known_pattern() {
        let plaintext: Vec<u8> = (0..131072u32).map(|i| (i % 256) as u8).collect();
        let first = encode(&plaintext, &[Compression::Zlib], CryptoSuite::AesSha1).unwrap();
        assert_eq!(first.compression, Compression::Zlib);
        assert_eq!(first.tag.len(), 20);
        assert_eq!(first.key.len(), 20);

        let decoded = decode(
            &first.blob,
            Some(&first.tag),
            &first.key,
            first.compression,
            plaintext.len(),
            CryptoSuite::AesSha1,
        )
        .unwrap();
        assert_eq!(decoded, plaintext);

        let second = encode(&plaintext, &[Compression::Zlib], CryptoSuite::AesSha1).unwrap();
        assert_eq!(second.tag, first.tag);
        assert_eq!(second.key, first.key);
        assert_eq!(second.blob, first.blob);
    }

    #[test]
    fn scenario_2_incompressible_fallback() {
        let mut seed = 42u64;
        let plaintext: Vec<u8> = (0..131072).map(|_| lcg(&mut seed)).collect();
        let result = encode(
            &plaintext,
            &[Compression::Zlib, Compression::None],
            CryptoSuite::AesSha1,
        )
        .unwrap();
        assert_eq!(result.compression, Compression::None);
        let pad = result.blob.len() - plaintext.len();
        assert!((1..=16).contains(&pad));
    }

    #[test]
    fn dedup_invariant_for_identical_chunks() {
        let plaintext = vec![0u8; 4096];
        let a = encode(&plaintext, &[Compression::Zlib], CryptoSuite::AesSha1).unwrap();
        let b = encode(&plaintext, &[Compression::Zlib], CryptoSuite::AesSha1).unwrap();
        assert_eq!(a.tag, b.tag);
        assert_eq!(a.key, b.key);
        assert_eq!(a.blob, b.blob);
    }

    #[test]
    fn decode_detects_key_mismatch() {
        let plaintext = vec![7u8; 1024];
        let encoded = encode(&plaintext, &[Compression::None], CryptoSuite::AesSha1).unwrap();
        let wrong_key = vec![1u8; encoded.key.len()];
        let err = decode(
            &encoded.blob,
            None,
            &wrong_key,
            encoded.compression,
            plaintext.len(),
            CryptoSuite::AesSha1,
        )
        .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::KeyMismatch | ErrorKind::BadPadding));
    }

    #[test]
    fn decode_detects_tag_mismatch() {
        let plaintext = vec![3u8; 2048];
        let mut encoded = encode(&plaintext, &[Compression::None], CryptoSuite::AesSha1).unwrap();
        encoded.tag[0] ^= 0xFF;
        let err = decode(
            &encoded.blob,
            Some(&encoded.tag),
            &encoded.key,
            encoded.compression,
            plaintext.len(),
            CryptoSuite::AesSha1,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TagMismatch);
    }
}
