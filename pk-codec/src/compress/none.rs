use super::{StepResult, StreamDecoder, StreamEncoder};
use pk_types::error::PkError;

/// Identity "compressor": used when a chunk doesn't shrink enough to be
/// worth compressing (spec §4.1 tie-break) or when `none` is the only
/// allowed mode.
pub struct NoneCodec;

impl StreamEncoder for NoneCodec {
    fn process(&mut self, input: &[u8], output: &mut [u8]) -> Result<StepResult, PkError> {
        let n = input.len().min(output.len());
        output[..n].copy_from_slice(&input[..n]);
        Ok(StepResult {
            consumed: n,
            produced: n,
        })
    }

    fn finalize(&mut self, _output: &mut [u8]) -> Result<(usize, bool), PkError> {
        Ok((0, true))
    }
}

impl StreamDecoder for NoneCodec {
    fn process(&mut self, input: &[u8], output: &mut [u8]) -> Result<StepResult, PkError> {
        let n = input.len().min(output.len());
        output[..n].copy_from_slice(&input[..n]);
        Ok(StepResult {
            consumed: n,
            produced: n,
        })
    }

    fn finalize(&mut self, _output: &mut [u8]) -> Result<(usize, bool), PkError> {
        Ok((0, true))
    }
}
