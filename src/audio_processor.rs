use std::fs::File;
use std::io::Cursor;
use std::path::Path;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use sha1::{Digest, Sha1};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecRegistry, DecoderOptions};
use symphonia::core::errors::Error;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::{Hint, Probe};
use symphonia::default;
use tracing::debug;

use crate::error::DecodeError;

/// Decoder adaptor: any container/codec symphonia understands comes out as
/// mono 16-bit PCM at 44.1 kHz, both as WAV bytes and as float samples.
pub struct AudioProcessor {
    codec_registry: &'static CodecRegistry,
    format_options: FormatOptions,
    metadata_options: MetadataOptions,
    probe: &'static Probe,
}

/// Output of one decode job. `wav_bytes` is the canonical re-encoding whose
/// SHA-1 (`file_hash`) is the deduplication key at ingestion.
pub struct DecodedAudio {
    pub samples: Vec<f64>,
    pub wav_bytes: Vec<u8>,
    pub file_hash: String,
}

impl AudioProcessor {
    pub const TARGET_SAMPLE_RATE: u32 = 44_100;

    pub fn new() -> Self {
        Self {
            codec_registry: default::get_codecs(),
            format_options: FormatOptions::default(),
            metadata_options: MetadataOptions::default(),
            probe: default::get_probe(),
        }
    }

    pub fn decode_file(&self, path: &Path) -> Result<DecodedAudio, DecodeError> {
        let file = File::open(path).map_err(|source| DecodeError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let (decoded, source_rate) = self.decode_to_mono(file)?;
        debug!(samples = decoded.len(), source_rate, "decoded audio to mono");

        let at_target = resample_linear(&decoded, source_rate, Self::TARGET_SAMPLE_RATE);
        let wav_bytes = encode_wav(&at_target)?;
        if wav_bytes.len() < 44 {
            return Err(DecodeError::ShortWav {
                len: wav_bytes.len(),
            });
        }

        let file_hash = hex::encode(Sha1::digest(&wav_bytes));
        let samples = parse_wav_samples(&wav_bytes)?;

        Ok(DecodedAudio {
            samples,
            wav_bytes,
            file_hash,
        })
    }

    fn decode_to_mono(&self, file: File) -> Result<(Vec<f32>, u32), DecodeError> {
        let source: Box<dyn MediaSource> = Box::new(file);
        let stream = MediaSourceStream::new(source, Default::default());

        let probed = self
            .probe
            .format(
                &Hint::new(),
                stream,
                &self.format_options,
                &self.metadata_options,
            )
            .map_err(|e| DecodeError::Probe(e.to_string()))?;
        let mut format = probed.format;

        let track = format.tracks().first().ok_or(DecodeError::NoTrack)?;
        let sample_rate = track.codec_params.sample_rate.ok_or(DecodeError::NoTrack)?;

        let mut decoder = self
            .codec_registry
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| DecodeError::Codec(e.to_string()))?;

        let mut samples = Vec::new();
        loop {
            let packet = match format.next_packet() {
                Ok(packet) => packet,
                // EOF
                Err(Error::IoError(_)) => break,
                Err(e) => return Err(DecodeError::Codec(e.to_string())),
            };

            let decoded = match decoder.decode(&packet) {
                Ok(decoded) => decoded,
                // A corrupt packet is skippable; the stream continues.
                Err(Error::DecodeError(_)) => continue,
                Err(e) => return Err(DecodeError::Codec(e.to_string())),
            };

            let channels = decoded.spec().channels.count();
            let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
            buf.copy_interleaved_ref(decoded);

            for frame in buf.samples().chunks_exact(channels) {
                samples.push(frame.iter().sum::<f32>() / channels as f32);
            }
        }

        Ok((samples, sample_rate))
    }
}

impl Default for AudioProcessor {
    fn default() -> Self {
        Self::new()
    }
}

/// Linear-interpolation resampler: every output sample is the lerp of the
/// two source samples its position falls between. Good enough for the
/// recognition bands; anything fancier belongs in the decoder itself.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let step = from_rate as f64 / to_rate as f64;
    let out_len = (samples.len() as f64 / step) as usize;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let left = pos as usize;
            match samples.get(left + 1) {
                Some(&right) => {
                    let t = (pos - left as f64) as f32;
                    samples[left] * (1.0 - t) + right * t
                }
                // Past the last pair, hold the final sample.
                None => samples[samples.len() - 1],
            }
        })
        .collect()
}

fn encode_wav(samples: &[f32]) -> Result<Vec<u8>, hound::Error> {
    let spec = WavSpec {
        channels: 1,
        sample_rate: AudioProcessor::TARGET_SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut bytes = Vec::new();
    let mut writer = WavWriter::new(Cursor::new(&mut bytes), spec)?;
    for &sample in samples {
        writer.write_sample((sample * i16::MAX as f32) as i16)?;
    }
    writer.finalize()?;
    Ok(bytes)
}

fn parse_wav_samples(bytes: &[u8]) -> Result<Vec<f64>, hound::Error> {
    let reader = WavReader::new(Cursor::new(bytes))?;
    reader
        .into_samples::<i16>()
        .map(|s| s.map(|s| s as f64 / i16::MAX as f64))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn write_test_wav(path: &Path, freq: f32, seconds: f32, sample_rate: u32) {
        let spec = WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec).unwrap();
        let n = (sample_rate as f32 * seconds) as usize;
        for i in 0..n {
            let sample = 0.5 * (2.0 * PI * freq * i as f32 / sample_rate as f32).sin();
            writer
                .write_sample((sample * i16::MAX as f32) as i16)
                .unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn decodes_a_wav_to_normalised_mono() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_test_wav(&path, 440.0, 1.0, 44_100);

        let decoded = AudioProcessor::new().decode_file(&path).unwrap();
        assert!((decoded.samples.len() as i64 - 44_100).unsigned_abs() < 16);
        assert!(decoded.samples.iter().all(|s| (-1.0..=1.0).contains(s)));
        assert!(decoded.wav_bytes.len() >= 44);
    }

    #[test]
    fn file_hash_is_stable_across_decodes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_test_wav(&path, 330.0, 0.5, 44_100);

        let processor = AudioProcessor::new();
        let first = processor.decode_file(&path).unwrap();
        let second = processor.decode_file(&path).unwrap();
        assert_eq!(first.file_hash, second.file_hash);
        assert_eq!(first.file_hash.len(), 40);
        assert!(first.file_hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn non_target_rates_are_resampled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone22k.wav");
        write_test_wav(&path, 440.0, 1.0, 22_050);

        let decoded = AudioProcessor::new().decode_file(&path).unwrap();
        // One second of audio at any source rate is one second at 44.1 kHz.
        assert!((decoded.samples.len() as i64 - 44_100).unsigned_abs() < 32);
    }

    #[test]
    fn unreadable_path_reports_io() {
        let result = AudioProcessor::new().decode_file(Path::new("/nonexistent/x.wav"));
        assert!(matches!(result, Err(DecodeError::Io { .. })));
    }

    #[test]
    fn resample_halves_at_double_rate() {
        let samples: Vec<f32> = (0..1000).map(|i| i as f32 / 1000.0).collect();
        let out = resample_linear(&samples, 88_200, 44_100);
        assert!((out.len() as i64 - 500).unsigned_abs() <= 1);
    }

    #[test]
    fn resample_is_identity_at_equal_rates() {
        let samples = vec![0.1_f32, 0.2, 0.3];
        assert_eq!(resample_linear(&samples, 44_100, 44_100), samples);
    }

    #[test]
    fn parsed_samples_recover_full_scale() {
        let bytes = encode_wav(&[1.0, -1.0, 0.0]).unwrap();
        let samples = parse_wav_samples(&bytes).unwrap();
        assert!((samples[0] - 1.0).abs() < 1e-3);
        assert!((samples[1] + 1.0).abs() < 1e-3);
        assert_eq!(samples[2], 0.0);
    }
}
