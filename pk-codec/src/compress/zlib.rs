use flate2::{Compress, Compression as Flate2Level, Decompress, FlushCompress, FlushDecompress, Status};

use super::{StepResult, StreamDecoder, StreamEncoder};
use pk_types::error::{ErrorKind, PkError};

/// Streaming zlib-framed deflate (spec §4.1 `zlib` mode). `flate2`'s
/// low-level `Compress`/`Decompress` already expose exactly the
/// caller-driven `process`/`finalize` shape the spec requires.
pub struct ZlibEncoder {
    inner: Compress,
}

impl ZlibEncoder {
    pub fn new() -> Self {
        Self {
            inner: Compress::new(Flate2Level::default(), true),
        }
    }
}

impl StreamEncoder for ZlibEncoder {
    fn process(&mut self, input: &[u8], output: &mut [u8]) -> Result<StepResult, PkError> {
        let before_in = self.inner.total_in();
        let before_out = self.inner.total_out();
        self.inner
            .compress(input, output, FlushCompress::None)
            .map_err(|e| PkError::new(ErrorKind::BadFormat, format!("zlib compress error: {e}")))?;
        Ok(StepResult {
            consumed: (self.inner.total_in() - before_in) as usize,
            produced: (self.inner.total_out() - before_out) as usize,
        })
    }

    fn finalize(&mut self, output: &mut [u8]) -> Result<(usize, bool), PkError> {
        let before_out = self.inner.total_out();
        let status = self
            .inner
            .compress(&[], output, FlushCompress::Finish)
            .map_err(|e| PkError::new(ErrorKind::BadFormat, format!("zlib finish error: {e}")))?;
        let produced = (self.inner.total_out() - before_out) as usize;
        match status {
            Status::StreamEnd => Ok((produced, true)),
            Status::Ok | Status::BufError => {
                if produced == 0 {
                    Err(PkError::new(
                        ErrorKind::BufferOverflow,
                        "zlib finalize needs more output space",
                    ))
                } else {
                    Ok((produced, false))
                }
            }
        }
    }
}

pub struct ZlibDecoder {
    inner: Decompress,
}

impl ZlibDecoder {
    pub fn new() -> Self {
        Self {
            inner: Decompress::new(true),
        }
    }
}

impl StreamDecoder for ZlibDecoder {
    fn process(&mut self, input: &[u8], output: &mut [u8]) -> Result<StepResult, PkError> {
        let before_in = self.inner.total_in();
        let before_out = self.inner.total_out();
        self.inner
            .decompress(input, output, FlushDecompress::None)
            .map_err(|e| PkError::new(ErrorKind::BadFormat, format!("zlib decompress error: {e}")))?;
        Ok(StepResult {
            consumed: (self.inner.total_in() - before_in) as usize,
            produced: (self.inner.total_out() - before_out) as usize,
        })
    }

    fn finalize(&mut self, output: &mut [u8]) -> Result<(usize, bool), PkError> {
        let before_out = self.inner.total_out();
        let status = self
            .inner
            .decompress(&[], output, FlushDecompress::Finish)
            .map_err(|e| PkError::new(ErrorKind::BadFormat, format!("zlib finish error: {e}")))?;
        let produced = (self.inner.total_out() - before_out) as usize;
        match status {
            Status::StreamEnd => Ok((produced, true)),
            Status::Ok | Status::BufError => {
                if produced == 0 {
                    Err(PkError::new(
                        ErrorKind::BufferOverflow,
                        "zlib finalize needs more output space",
                    ))
                } else {
                    Ok((produced, false))
                }
            }
        }
    }
}
