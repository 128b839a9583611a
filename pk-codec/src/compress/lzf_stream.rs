//! Framed LZF stream container (spec §6.4): a sequence of `ZV0`/`ZV1`
//! blocks followed by a `ZV\x30` + big-endian CRC-32 of the decompressed
//! bytes. Reimplemented as an explicit state machine (design note §9)
//! rather than the coroutine the original C uses.

use crc32fast::Hasher as Crc32;

use super::lzf::{compress_block, decompress_block};
use super::{StepResult, StreamDecoder, StreamEncoder};
use pk_types::error::{ErrorKind, PkError};

const MAX_BLOCK: usize = (1 << 16) - 1;

pub struct LzfStreamEncoder {
    buffer: Vec<u8>,
    crc: Crc32,
    pending_output: Vec<u8>,
    emitted_trailer: bool,
}

impl LzfStreamEncoder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            crc: Crc32::new(),
            pending_output: Vec::new(),
            emitted_trailer: false,
        }
    }

    fn emit_full_blocks(&mut self) {
        while self.buffer.len() >= MAX_BLOCK {
            let block: Vec<u8> = self.buffer.drain(..MAX_BLOCK).collect();
            self.emit_block(&block);
        }
    }

    fn emit_block(&mut self, block: &[u8]) {
        self.crc.update(block);
        let compressed = compress_block(block);
        if compressed.len() < block.len() {
            self.pending_output.extend_from_slice(b"ZV\x01");
            self.pending_output
                .extend_from_slice(&(compressed.len() as u16).to_be_bytes());
            self.pending_output
                .extend_from_slice(&(block.len() as u16).to_be_bytes());
            self.pending_output.extend_from_slice(&compressed);
        } else {
            self.pending_output.extend_from_slice(b"ZV\x00");
            self.pending_output
                .extend_from_slice(&(block.len() as u16).to_be_bytes());
            self.pending_output.extend_from_slice(block);
        }
    }

    fn drain_pending(&mut self, output: &mut [u8]) -> usize {
        let n = self.pending_output.len().min(output.len());
        output[..n].copy_from_slice(&self.pending_output[..n]);
        self.pending_output.drain(..n);
        n
    }
}

impl StreamEncoder for LzfStreamEncoder {
    fn process(&mut self, input: &[u8], output: &mut [u8]) -> Result<StepResult, PkError> {
        self.buffer.extend_from_slice(input);
        self.emit_full_blocks();
        let produced = self.drain_pending(output);
        Ok(StepResult {
            consumed: input.len(),
            produced,
        })
    }

    fn finalize(&mut self, output: &mut [u8]) -> Result<(usize, bool), PkError> {
        if !self.pending_output.is_empty() {
            let n = self.drain_pending(output);
            return Ok((n, false));
        }
        if !self.buffer.is_empty() {
            let block = std::mem::take(&mut self.buffer);
            self.emit_block(&block);
            let n = self.drain_pending(output);
            return Ok((n, false));
        }
        if !self.emitted_trailer {
            self.emitted_trailer = true;
            self.pending_output.extend_from_slice(b"ZV\x30");
            let crc = std::mem::replace(&mut self.crc, Crc32::new()).finalize();
            self.pending_output.extend_from_slice(&crc.to_be_bytes());
            let n = self.drain_pending(output);
            return Ok((n, self.pending_output.is_empty()));
        }
        Ok((0, true))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    WantHeader1,
    WantHeader2,
    WantHeader3,
    WantData,
    AtEof,
    DataError,
}

pub struct LzfStreamDecoder {
    state: DecodeState,
    header: Vec<u8>,
    block_kind: u8,
    csize: usize,
    usize_: usize,
    block_data: Vec<u8>,
    crc: Crc32,
    decoded_output: Vec<u8>,
}

impl LzfStreamDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::WantHeader1,
            header: Vec::new(),
            block_kind: 0,
            csize: 0,
            usize_: 0,
            block_data: Vec::new(),
            crc: Crc32::new(),
            decoded_output: Vec::new(),
        }
    }

    fn drain_decoded(&mut self, output: &mut [u8]) -> usize {
        let n = self.decoded_output.len().min(output.len());
        output[..n].copy_from_slice(&self.decoded_output[..n]);
        self.decoded_output.drain(..n);
        n
    }
}

impl StreamDecoder for LzfStreamDecoder {
    fn process(&mut self, mut input: &[u8], output: &mut [u8]) -> Result<StepResult, PkError> {
        let original_len = input.len();
        loop {
            match self.state {
                DecodeState::AtEof | DecodeState::DataError => break,
                DecodeState::WantHeader1 => {
                    let Some((&b, rest)) = input.split_first() else {
                        break;
                    };
                    input = rest;
                    if b == 0x00 {
                        self.state = DecodeState::AtEof;
                        break;
                    }
                    if b != b'Z' {
                        self.state = DecodeState::DataError;
                        return Err(PkError::new(ErrorKind::BadFormat, "lzf-stream: bad block tag"));
                    }
                    self.header.clear();
                    self.header.push(b);
                    self.state = DecodeState::WantHeader2;
                }
                DecodeState::WantHeader2 => {
                    // consume 'V' and the kind byte, then any fixed-size length fields
                    while self.header.len() < 3 {
                        let Some((&b, rest)) = input.split_first() else {
                            return Ok(StepResult {
                                consumed: original_len - input.len(),
                                produced: self.drain_decoded(output),
                            });
                        };
                        input = rest;
                        self.header.push(b);
                    }
                    self.block_kind = self.header[2];
                    self.state = DecodeState::WantHeader3;
                }
                DecodeState::WantHeader3 => {
                    let need = match self.block_kind {
                        0x00 => 2,
                        0x01 => 4,
                        0x30 => 4,
                        _ => {
                            self.state = DecodeState::DataError;
                            return Err(PkError::new(
                                ErrorKind::BadFormat,
                                "lzf-stream: unknown block kind",
                            ));
                        }
                    };
                    while self.header.len() < 3 + need {
                        let Some((&b, rest)) = input.split_first() else {
                            return Ok(StepResult {
                                consumed: original_len - input.len(),
                                produced: self.drain_decoded(output),
                            });
                        };
                        input = rest;
                        self.header.push(b);
                    }
                    match self.block_kind {
                        0x00 => {
                            self.usize_ =
                                u16::from_be_bytes([self.header[3], self.header[4]]) as usize;
                            self.csize = self.usize_;
                            self.block_data.clear();
                            self.state = DecodeState::WantData;
                        }
                        0x01 => {
                            self.csize =
                                u16::from_be_bytes([self.header[3], self.header[4]]) as usize;
                            self.usize_ =
                                u16::from_be_bytes([self.header[5], self.header[6]]) as usize;
                            self.block_data.clear();
                            self.state = DecodeState::WantData;
                        }
                        0x30 => {
                            let expected_crc = u32::from_be_bytes([
                                self.header[3],
                                self.header[4],
                                self.header[5],
                                self.header[6],
                            ]);
                            let actual = std::mem::replace(&mut self.crc, Crc32::new()).finalize();
                            if actual != expected_crc {
                                self.state = DecodeState::DataError;
                                return Err(PkError::new(
                                    ErrorKind::BadFormat,
                                    "lzf-stream: trailing CRC-32 mismatch",
                                ));
                            }
                            self.state = DecodeState::AtEof;
                        }
                        _ => unreachable!(),
                    }
                }
                DecodeState::WantData => {
                    let need = self.csize - self.block_data.len();
                    let take = need.min(input.len());
                    self.block_data.extend_from_slice(&input[..take]);
                    input = &input[take..];
                    if self.block_data.len() < self.csize {
                        return Ok(StepResult {
                            consumed: original_len - input.len(),
                            produced: self.drain_decoded(output),
                        });
                    }
                    let plain = if self.block_kind == 0x00 {
                        std::mem::take(&mut self.block_data)
                    } else {
                        decompress_block(&self.block_data, self.usize_)?
                    };
                    self.crc.update(&plain);
                    self.decoded_output.extend_from_slice(&plain);
                    self.state = DecodeState::WantHeader1;
                }
            }
        }
        Ok(StepResult {
            consumed: original_len - input.len(),
            produced: self.drain_decoded(output),
        })
    }

    fn finalize(&mut self, output: &mut [u8]) -> Result<(usize, bool), PkError> {
        if !self.decoded_output.is_empty() {
            let n = self.drain_decoded(output);
            return Ok((n, false));
        }
        match self.state {
            DecodeState::AtEof => Ok((0, true)),
            DecodeState::DataError => Err(PkError::new(ErrorKind::BadFormat, "lzf-stream: corrupt stream")),
            _ => Err(PkError::new(
                ErrorKind::BadFormat,
                "lzf-stream: truncated before trailing CRC block",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::{compress_all, decompress_all};
    use pk_types::Compression;

    #[test]
    fn round_trips_via_one_shot_helpers() {
        let input: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let compressed = compress_all(Compression::LzfStream, &input).unwrap();
        let decoded = decompress_all(Compression::LzfStream, &compressed, input.len()).unwrap();
        assert_eq!(decoded, input);
    }

    #[test]
    fn detects_corrupted_trailer_crc() {
        let input = b"hello world hello world hello world".to_vec();
        let mut compressed = compress_all(Compression::LzfStream, &input).unwrap();
        let last = compressed.len() - 1;
        compressed[last] ^= 0xFF;
        assert!(decompress_all(Compression::LzfStream, &compressed, input.len()).is_err());
    }
}
