use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Sender, after, bounded, tick};
use tracing::{debug, info, warn};

use crate::audio_processor::{AudioProcessor, resample_linear};
use crate::error::{CaptureError, PipelineError};
use crate::fingerprint;
use crate::matcher::{self, FingerprintIndex, Match, MatchTuning};
use crate::peaks;
use crate::spectrogram;

/// The capture ring holds at most this much audio; older samples evict.
pub const BUFFER_SECONDS: usize = 10;
/// Each recognition job reads the most recent window of this length.
const SNAPSHOT_SECONDS: usize = 5;
/// No job is dispatched before this much audio has accumulated.
const MIN_AUDIO_SECONDS: f32 = 3.0;

const RECOGNITION_TICK: Duration = Duration::from_secs(2);
const LISTEN_TIMEOUT: Duration = Duration::from_secs(30);

/// A candidate must clear this score for the loop to stop.
const STOP_SCORE: f64 = 0.3;

/// Early gates: below these the window cannot produce a credible match, so
/// the job never reaches the store.
const MIN_WINDOW_PEAKS: usize = 20;
const MIN_WINDOW_FINGERPRINTS: usize = 50;

/// How a listening session ended.
#[derive(Debug)]
pub enum ListenOutcome {
    Matched(Match),
    TimedOut,
    Interrupted,
}

/// Ring-bounded capture sink. Written only by the stream callback; readers
/// copy a snapshot out under the lock before doing any DSP.
pub struct CaptureBuffer {
    samples: VecDeque<f32>,
    capacity: usize,
    sample_rate: u32,
    peak_level: f32,
}

impl CaptureBuffer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            samples: VecDeque::new(),
            capacity: sample_rate as usize * BUFFER_SECONDS,
            sample_rate,
            peak_level: 0.0,
        }
    }

    pub fn push(&mut self, chunk: &[f32]) {
        for &sample in chunk {
            if self.samples.len() == self.capacity {
                self.samples.pop_front();
            }
            self.samples.push_back(sample);
            self.peak_level = self.peak_level.max(sample.abs());
        }
    }

    pub fn seconds(&self) -> f32 {
        self.samples.len() as f32 / self.sample_rate as f32
    }

    /// Copy of the most recent `seconds` of audio, oldest first.
    pub fn snapshot_last(&self, seconds: usize) -> Vec<f32> {
        let wanted = (self.sample_rate as usize * seconds).min(self.samples.len());
        let skip = self.samples.len() - wanted;
        self.samples.iter().skip(skip).copied().collect()
    }

    /// Running peak level since the last call.
    pub fn take_peak_level(&mut self) -> f32 {
        std::mem::replace(&mut self.peak_level, 0.0)
    }
}

struct Recorder {
    // Held for its side effect: dropping the stream stops capture.
    _stream: cpal::Stream,
    buffer: Arc<Mutex<CaptureBuffer>>,
    sample_rate: u32,
}

fn start_capture() -> Result<Recorder, CaptureError> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or(CaptureError::NoDevice)?;
    let config = device
        .default_input_config()
        .map_err(|e| CaptureError::Stream(e.to_string()))?;

    let sample_rate = config.sample_rate().0;
    let channels = config.channels() as usize;
    let buffer = Arc::new(Mutex::new(CaptureBuffer::new(sample_rate)));

    let stream = match config.sample_format() {
        cpal::SampleFormat::F32 => {
            let sink = Arc::clone(&buffer);
            device.build_input_stream(
                &config.clone().into(),
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    push_mono(&sink, data.chunks_exact(channels).map(mix_frame));
                },
                |err| warn!(%err, "input stream error"),
                None,
            )
        }
        cpal::SampleFormat::I16 => {
            let sink = Arc::clone(&buffer);
            device.build_input_stream(
                &config.clone().into(),
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let frames = data.chunks_exact(channels).map(|frame| {
                        mix_frame_iter(frame.iter().map(|&s| s as f32 / i16::MAX as f32))
                    });
                    push_mono(&sink, frames);
                },
                |err| warn!(%err, "input stream error"),
                None,
            )
        }
        other => return Err(CaptureError::UnsupportedFormat(format!("{other:?}"))),
    }
    .map_err(|e| CaptureError::Stream(e.to_string()))?;

    stream
        .play()
        .map_err(|e| CaptureError::Stream(e.to_string()))?;

    Ok(Recorder {
        _stream: stream,
        buffer,
        sample_rate,
    })
}

fn mix_frame(frame: &[f32]) -> f32 {
    frame.iter().sum::<f32>() / frame.len() as f32
}

fn mix_frame_iter(frame: impl Iterator<Item = f32>) -> f32 {
    let (sum, n) = frame.fold((0.0f32, 0usize), |(s, n), x| (s + x, n + 1));
    sum / n as f32
}

fn push_mono(sink: &Arc<Mutex<CaptureBuffer>>, frames: impl Iterator<Item = f32>) {
    // The callback stays cheap: mix, append, level. Everything else happens
    // on snapshot copies.
    let mono: Vec<f32> = frames.collect();
    let mut buf = sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    buf.push(&mono);
}

/// Runs the continuous-capture recognition loop until a confident match, a
/// 30-second timeout, or an interrupt. In-flight jobs at shutdown finish on
/// their own threads and their results are dropped with the channel.
pub fn listen<S>(index: Arc<Mutex<S>>) -> Result<ListenOutcome, PipelineError>
where
    S: FingerprintIndex + Send + 'static,
{
    let recorder = start_capture()?;
    info!(rate = recorder.sample_rate, "listening");

    let (signal_tx, signal_rx) = bounded::<()>(1);
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = signal_tx.try_send(());
    }) {
        warn!(%e, "interrupt handler unavailable");
    }

    let (match_tx, match_rx) = bounded::<Match>(1);
    let ticker = tick(RECOGNITION_TICK);
    let deadline = after(LISTEN_TIMEOUT);
    let job_running = Arc::new(AtomicBool::new(false));

    loop {
        crossbeam_channel::select! {
            recv(match_rx) -> msg => {
                if let Ok(m) = msg {
                    info!(song = %m.name, score = m.score, "confident match");
                    return Ok(ListenOutcome::Matched(m));
                }
            }
            recv(deadline) -> _ => {
                info!("no confident match within the time limit");
                return Ok(ListenOutcome::TimedOut);
            }
            recv(signal_rx) -> _ => {
                info!("interrupted");
                return Ok(ListenOutcome::Interrupted);
            }
            recv(ticker) -> _ => {
                dispatch_job(&recorder, &index, &job_running, &match_tx);
            }
        }
    }
}

fn dispatch_job<S>(
    recorder: &Recorder,
    index: &Arc<Mutex<S>>,
    job_running: &Arc<AtomicBool>,
    match_tx: &Sender<Match>,
) where
    S: FingerprintIndex + Send + 'static,
{
    let snapshot = {
        let mut buf = recorder
            .buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let seconds = buf.seconds();
        let level = buf.take_peak_level();
        debug!(seconds, level, "capture tick");

        if seconds < MIN_AUDIO_SECONDS {
            return;
        }
        // Overlapping dispatches are skipped rather than queued.
        if job_running.swap(true, Ordering::SeqCst) {
            debug!("previous recognition job still running, skipping tick");
            return;
        }
        buf.snapshot_last(SNAPSHOT_SECONDS)
    };

    let sample_rate = recorder.sample_rate;
    let index = Arc::clone(index);
    let flag = Arc::clone(job_running);
    let tx = match_tx.clone();

    thread::spawn(move || {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            recognize_window(&snapshot, sample_rate, index)
        }));
        match outcome {
            Ok(Ok(Some(m))) if m.score > STOP_SCORE => {
                // First confident match wins; a full slot means one already did.
                let _ = tx.try_send(m);
            }
            Ok(Ok(Some(m))) => debug!(score = m.score, "best candidate below stop score"),
            Ok(Ok(None)) => debug!("window produced no candidate"),
            Ok(Err(e)) => debug!(error = %e, "recognition attempt discarded"),
            Err(_) => warn!("recognition job panicked, loop continues"),
        }
        flag.store(false, Ordering::SeqCst);
    });
}

/// One recognition attempt over a snapshot of captured audio.
fn recognize_window<S: FingerprintIndex>(
    snapshot: &[f32],
    sample_rate: u32,
    mut index: Arc<Mutex<S>>,
) -> Result<Option<Match>, PipelineError> {
    let at_target = resample_linear(snapshot, sample_rate, AudioProcessor::TARGET_SAMPLE_RATE);
    let samples: Vec<f64> = at_target.iter().map(|&s| s as f64).collect();

    let grid = spectrogram::spectrogram(&samples)?;
    let constellation = peaks::pick_peaks(&grid, AudioProcessor::TARGET_SAMPLE_RATE);
    if constellation.len() < MIN_WINDOW_PEAKS {
        return Err(PipelineError::NotEnoughPeaks {
            have: constellation.len(),
            need: MIN_WINDOW_PEAKS,
        });
    }

    let mut tokens = fingerprint::encode(&constellation);
    if tokens.len() < MIN_WINDOW_FINGERPRINTS {
        return Err(PipelineError::NotEnoughFingerprints {
            have: tokens.len(),
            need: MIN_WINDOW_FINGERPRINTS,
        });
    }
    tokens.extend(fingerprint::encode_with_tolerance(&constellation));

    let query = matcher::query_map(&tokens);
    let matches = matcher::find_matches(&mut index, &query, &MatchTuning::microphone())?;
    Ok(matches.into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::matcher::{HashHit, SongInfo};

    const RATE: u32 = 44_100;

    struct EmptyIndex;

    impl FingerprintIndex for EmptyIndex {
        fn query_fingerprints(&mut self, _hashes: &[String]) -> Result<Vec<HashHit>, StoreError> {
            Ok(Vec::new())
        }

        fn song_info(&mut self, _song_id: u32) -> Result<Option<SongInfo>, StoreError> {
            Ok(None)
        }
    }

    #[test]
    fn buffer_never_exceeds_ten_seconds() {
        let mut buf = CaptureBuffer::new(RATE);
        let chunk = vec![0.1_f32; RATE as usize];
        for _ in 0..12 {
            buf.push(&chunk);
        }
        assert_eq!(buf.samples.len(), RATE as usize * BUFFER_SECONDS);
        assert!((buf.seconds() - BUFFER_SECONDS as f32).abs() < 1e-6);
    }

    #[test]
    fn snapshot_returns_the_most_recent_window() {
        let mut buf = CaptureBuffer::new(4);
        buf.push(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        // One second at rate four means the last four samples.
        assert_eq!(buf.snapshot_last(1), vec![5.0, 6.0, 7.0, 8.0]);
    }

    #[test]
    fn snapshot_of_a_short_buffer_takes_what_there_is() {
        let mut buf = CaptureBuffer::new(RATE);
        buf.push(&[0.5; 100]);
        assert_eq!(buf.snapshot_last(5).len(), 100);
    }

    #[test]
    fn eviction_drops_the_oldest_samples_first() {
        let mut buf = CaptureBuffer::new(1);
        // Capacity is ten samples at one hertz.
        buf.push(&(0..15).map(|i| i as f32).collect::<Vec<_>>());
        assert_eq!(buf.snapshot_last(10), (5..15).map(|i| i as f32).collect::<Vec<_>>());
    }

    #[test]
    fn peak_level_resets_when_taken() {
        let mut buf = CaptureBuffer::new(RATE);
        buf.push(&[0.1, -0.7, 0.3]);
        assert!((buf.take_peak_level() - 0.7).abs() < 1e-6);
        assert_eq!(buf.take_peak_level(), 0.0);
    }

    #[test]
    fn silence_fails_the_peak_gate() {
        let silence = vec![0.0_f32; RATE as usize * 5];
        let result = recognize_window(&silence, RATE, Arc::new(Mutex::new(EmptyIndex)));
        assert!(matches!(
            result,
            Err(PipelineError::NotEnoughPeaks { .. })
        ));
    }

    #[test]
    fn a_window_shorter_than_the_fft_fails_cleanly() {
        let blip = vec![0.5_f32; 128];
        let result = recognize_window(&blip, RATE, Arc::new(Mutex::new(EmptyIndex)));
        assert!(matches!(
            result,
            Err(PipelineError::Spectrogram(_))
        ));
    }
}
