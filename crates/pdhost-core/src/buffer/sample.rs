//! Named sample buffers and WAV clip decoding

use std::path::Path;

use hound::{SampleFormat, WavReader};

use crate::error::HostResult;

/// Samples destined for a named array inside a patch
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBuffer {
    pub name: String,
    pub samples: Vec<f32>,
}

impl SampleBuffer {
    pub fn new(name: &str, samples: impl Into<Vec<f32>>) -> Self {
        Self {
            name: name.to_string(),
            samples: samples.into(),
        }
    }

    /// Decode a WAV file, keeping channels interleaved
    ///
    /// Integer formats are normalised to [-1.0, 1.0]. A stereo clip of N
    /// frames yields 2N samples.
    pub fn from_wav(name: &str, path: &Path) -> HostResult<Self> {
        let mut reader = WavReader::open(path)?;
        let spec = reader.spec();

        let samples: Vec<f32> = match spec.sample_format {
            SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
            SampleFormat::Int => {
                // 1 << 31 overflows i32
                let max_value = if spec.bits_per_sample == 32 {
                    2_147_483_648.0_f32
                } else {
                    (1_i32 << (spec.bits_per_sample - 1)) as f32
                };
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / max_value))
                    .collect::<Result<_, _>>()?
            }
        };

        log::debug!(
            "Decoded {:?}: {} samples, {} channels, {} Hz",
            path,
            samples.len(),
            spec.channels,
            spec.sample_rate
        );

        Ok(Self {
            name: name.to_string(),
            samples,
        })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
