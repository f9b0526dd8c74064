//! Error types for the recognition pipeline and its collaborators.

use thiserror::Error;

/// Errors from the decoder adaptor.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unrecognised container format: {0}")]
    Probe(String),

    #[error("no decodable audio track in file")]
    NoTrack,

    #[error("codec error: {0}")]
    Codec(String),

    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),

    /// The re-encoded stream is shorter than a bare WAV header.
    #[error("decoded audio is truncated ({len} bytes)")]
    ShortWav { len: usize },
}

/// Errors from the STFT stage.
#[derive(Debug, Error)]
pub enum SpectrogramError {
    #[error("signal too short for one window ({have} samples, need {need})")]
    ShortSignal { have: usize, need: usize },

    #[error("fft produced a non-numeric result at frame {frame}")]
    Fft { frame: usize },
}

/// Errors from the fingerprint store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database connection failed: {0}")]
    Connection(#[from] diesel::ConnectionError),

    #[error("a song with file hash {0} already exists")]
    DuplicateSong(String),

    #[error("database error: {0}")]
    Query(#[from] diesel::result::Error),
}

/// Errors from the microphone capture driver.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no default input device available")]
    NoDevice,

    #[error("unsupported input sample format: {0}")]
    UnsupportedFormat(String),

    #[error("input stream error: {0}")]
    Stream(String),
}

/// Union of everything a recognition or ingestion job can fail with.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Spectrogram(#[from] SpectrogramError),

    #[error("only {have} peaks in window, need at least {need}")]
    NotEnoughPeaks { have: usize, need: usize },

    #[error("only {have} fingerprints in window, need at least {need}")]
    NotEnoughFingerprints { have: usize, need: usize },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Capture(#[from] CaptureError),
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("unsupported database type {0:?} (only \"mysql\" is recognised)")]
    UnsupportedBackend(String),
}
