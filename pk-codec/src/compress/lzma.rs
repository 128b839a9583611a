//! Streaming xz/lzma (spec §4.1 `lzma` mode), built on `xz2`'s raw
//! `Stream` bindings to liblzma so `process`/`finalize` map onto
//! `LZMA_RUN`/`LZMA_FINISH` directly, the same way `zlib.rs` maps onto
//! `flate2`'s low-level API.

use xz2::stream::{Action, Status, Stream};

use super::{StepResult, StreamDecoder, StreamEncoder};
use pk_types::error::{ErrorKind, PkError};

const PRESET: u32 = 6;

pub struct LzmaEncoder {
    inner: Stream,
}

impl LzmaEncoder {
    pub fn new() -> Self {
        Self {
            inner: Stream::new_easy_encoder(PRESET, xz2::stream::Check::Crc32)
                .expect("liblzma encoder init"),
        }
    }
}

impl StreamEncoder for LzmaEncoder {
    fn process(&mut self, input: &[u8], output: &mut [u8]) -> Result<StepResult, PkError> {
        let before_in = self.inner.total_in();
        let before_out = self.inner.total_out();
        self.inner
            .process(input, output, Action::Run)
            .map_err(|e| PkError::new(ErrorKind::BadFormat, format!("lzma compress error: {e}")))?;
        Ok(StepResult {
            consumed: (self.inner.total_in() - before_in) as usize,
            produced: (self.inner.total_out() - before_out) as usize,
        })
    }

    fn finalize(&mut self, output: &mut [u8]) -> Result<(usize, bool), PkError> {
        let before_out = self.inner.total_out();
        let status = self
            .inner
            .process(&[], output, Action::Finish)
            .map_err(|e| PkError::new(ErrorKind::BadFormat, format!("lzma finish error: {e}")))?;
        let produced = (self.inner.total_out() - before_out) as usize;
        match status {
            Status::StreamEnd => Ok((produced, true)),
            Status::Ok | Status::MemNeeded => {
                if produced == 0 {
                    Err(PkError::new(
                        ErrorKind::BufferOverflow,
                        "lzma finalize needs more output space",
                    ))
                } else {
                    Ok((produced, false))
                }
            }
            Status::GetCheck => Ok((produced, false)),
        }
    }
}

pub struct LzmaDecoder {
    inner: Stream,
}

impl LzmaDecoder {
    pub fn new() -> Self {
        Self {
            inner: Stream::new_stream_decoder(u64::MAX, 0).expect("liblzma decoder init"),
        }
    }
}

impl StreamDecoder for LzmaDecoder {
    fn process(&mut self, input: &[u8], output: &mut [u8]) -> Result<StepResult, PkError> {
        let before_in = self.inner.total_in();
        let before_out = self.inner.total_out();
        let status = self
            .inner
            .process(input, output, Action::Run)
            .map_err(|e| PkError::new(ErrorKind::BadFormat, format!("lzma decompress error: {e}")))?;
        if status == Status::MemNeeded {
            return Err(PkError::new(ErrorKind::BadFormat, "lzma: out of memory bound"));
        }
        Ok(StepResult {
            consumed: (self.inner.total_in() - before_in) as usize,
            produced: (self.inner.total_out() - before_out) as usize,
        })
    }

    fn finalize(&mut self, output: &mut [u8]) -> Result<(usize, bool), PkError> {
        let before_out = self.inner.total_out();
        let status = self
            .inner
            .process(&[], output, Action::Finish)
            .map_err(|e| PkError::new(ErrorKind::BadFormat, format!("lzma finish error: {e}")))?;
        let produced = (self.inner.total_out() - before_out) as usize;
        match status {
            Status::StreamEnd => Ok((produced, true)),
            _ => {
                if produced == 0 {
                    Err(PkError::new(ErrorKind::BadFormat, "lzma: truncated stream"))
                } else {
                    Ok((produced, false))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::{compress_all, decompress_all};
    use pk_types::Compression;

    #[test]
    fn round_trips_repetitive_data() {
        let input: Vec<u8> = b"lzma round trip test payload "
            .iter()
            .cycle()
            .take(50_000)
            .copied()
            .collect();
        let compressed = compress_all(Compression::Lzma, &input).unwrap();
        assert!(compressed.len() < input.len());
        let decoded = decompress_all(Compression::Lzma, &compressed, input.len()).unwrap();
        assert_eq!(decoded, input);
    }
}
