//! Streaming compressor/decompressor abstraction (design note §9:
//! "coroutine-like control flow" reimplemented as an explicit `step`).
//!
//! Every compression mode exposes a narrow, non-blocking state machine:
//! `process` consumes as much of `input` as fits, producing as much
//! `output` as fits; `finalize` drains anything buffered internally.
//! Callers MUST drain `finalize`'s output (by calling it again with a
//! fresh buffer) until it reports completion.

pub mod lzf;
pub mod lzf_stream;
pub mod lzma;
pub mod none;
pub mod zlib;

use pk_types::error::{ErrorKind, PkError};
use pk_types::Compression;

/// Result of a single `process`/`finalize` step.
pub struct StepResult {
    pub consumed: usize,
    pub produced: usize,
}

pub trait StreamEncoder {
    /// Consumes a prefix of `input`, writes a prefix of `output`.
    fn process(&mut self, input: &[u8], output: &mut [u8]) -> Result<StepResult, PkError>;
    /// Flushes remaining buffered output. Returns `Ok(true)` once fully
    /// drained; `Err(BufferOverflow)` if `output` was too small to make
    /// progress (caller should retry with a bigger buffer, per spec §7).
    fn finalize(&mut self, output: &mut [u8]) -> Result<(usize, bool), PkError>;
}

pub trait StreamDecoder {
    fn process(&mut self, input: &[u8], output: &mut [u8]) -> Result<StepResult, PkError>;
    fn finalize(&mut self, output: &mut [u8]) -> Result<(usize, bool), PkError>;
}

pub fn make_encoder(kind: Compression) -> Box<dyn StreamEncoder> {
    match kind {
        Compression::None => Box::new(none::NoneCodec),
        Compression::Zlib => Box::new(zlib::ZlibEncoder::new()),
        Compression::Lzf => Box::new(lzf::LzfEncoder::new()),
        Compression::LzfStream => Box::new(lzf_stream::LzfStreamEncoder::new()),
        Compression::Lzma => Box::new(lzma::LzmaEncoder::new()),
    }
}

pub fn make_decoder(kind: Compression, expected_len: usize) -> Box<dyn StreamDecoder> {
    match kind {
        Compression::None => Box::new(none::NoneCodec),
        Compression::Zlib => Box::new(zlib::ZlibDecoder::new()),
        Compression::Lzf => Box::new(lzf::LzfDecoder::new(expected_len)),
        Compression::LzfStream => Box::new(lzf_stream::LzfStreamDecoder::new()),
        Compression::Lzma => Box::new(lzma::LzmaDecoder::new()),
    }
}

/// One-shot helper driving a [`StreamEncoder`] to completion over an
/// in-memory buffer, growing the output vector as needed.
pub fn compress_all(kind: Compression, input: &[u8]) -> Result<Vec<u8>, PkError> {
    let mut enc = make_encoder(kind);
    let mut out = Vec::with_capacity(input.len());
    let mut scratch = vec![0u8; 64 * 1024];
    let mut offset = 0;
    while offset < input.len() {
        let step = enc.process(&input[offset..], &mut scratch)?;
        out.extend_from_slice(&scratch[..step.produced]);
        offset += step.consumed;
        if step.consumed == 0 && step.produced == 0 {
            break;
        }
    }
    loop {
        let (produced, done) = enc.finalize(&mut scratch)?;
        out.extend_from_slice(&scratch[..produced]);
        if done {
            break;
        }
    }
    Ok(out)
}

/// One-shot helper driving a [`StreamDecoder`] to completion, failing with
/// `LENGTH_MISMATCH`-equivalent (`BadFormat`) if the result doesn't match
/// `expected_len`.
pub fn decompress_all(
    kind: Compression,
    input: &[u8],
    expected_len: usize,
) -> Result<Vec<u8>, PkError> {
    let mut dec = make_decoder(kind, expected_len);
    let mut out = Vec::with_capacity(expected_len);
    let mut scratch = vec![0u8; 64 * 1024];
    let mut offset = 0;
    while offset < input.len() {
        let step = dec.process(&input[offset..], &mut scratch)?;
        out.extend_from_slice(&scratch[..step.produced]);
        offset += step.consumed;
        if step.consumed == 0 && step.produced == 0 {
            break;
        }
    }
    loop {
        let (produced, done) = dec.finalize(&mut scratch)?;
        out.extend_from_slice(&scratch[..produced]);
        if done {
            break;
        }
    }
    if out.len() != expected_len {
        return Err(PkError::new(
            ErrorKind::BadFormat,
            format!(
                "decompressed length {} does not match expected {}",
                out.len(),
                expected_len
            ),
        ));
    }
    Ok(out)
}
