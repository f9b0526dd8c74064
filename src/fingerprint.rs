use sha1::{Digest, Sha1};

use crate::peaks::Peak;

/// How many successor peaks each anchor may pair with.
pub const FAN_OUT: usize = 15;
pub const MIN_DELTA_MS: f64 = 0.0;
pub const MAX_DELTA_MS: f64 = 2000.0;

/// The tolerance encoder visits every fourth anchor.
const TOLERANCE_ANCHOR_STRIDE: usize = 4;
/// Hard cap on tolerance tokens per window; the encoder returns early on
/// hitting it, mid-anchor included.
const TOLERANCE_TOKEN_CAP: usize = 10_000;
/// Perturbed bins outside [0, TOLERANCE_MAX_BIN] are discarded.
const TOLERANCE_MAX_BIN: i64 = 2048;

/// One fingerprint token: the pair hash plus the anchor's absolute offset
/// in milliseconds from the start of the processed audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub hash: String,
    pub offset_ms: i64,
}

/// Lowercase hex SHA-1 over `"<anchor_bin>|<target_bin>|<delta_ms>"`.
///
/// The 40-character string is the interchange format; databases written by
/// different builds stay compatible as long as this function does.
pub fn pair_hash(anchor_bin: usize, target_bin: usize, delta_ms: i64) -> String {
    let mut hasher = Sha1::new();
    hasher.update(format!("{anchor_bin}|{target_bin}|{delta_ms}").as_bytes());
    hex::encode(hasher.finalize())
}

/// Pairs each anchor peak with up to `FAN_OUT` later peaks and hashes the
/// pairs. Peaks must already be in time order, as `pick_peaks` emits them.
pub fn encode(peaks: &[Peak]) -> Vec<Fingerprint> {
    let n = peaks.len();
    let mut tokens = Vec::new();

    for (i, anchor) in peaks.iter().enumerate() {
        for target in &peaks[(i + 1).min(n)..(i + FAN_OUT).min(n)] {
            let delta = target.time_ms - anchor.time_ms;
            if delta <= MIN_DELTA_MS || delta > MAX_DELTA_MS {
                continue;
            }
            tokens.push(Fingerprint {
                hash: pair_hash(anchor.freq_bin, target.freq_bin, delta as i64),
                offset_ms: anchor.time_ms as i64,
            });
        }
    }
    tokens
}

/// Variant for live capture: neighbouring-bin tokens that absorb the
/// spectral jitter a microphone adds. For every fourth anchor, each accepted
/// pair also emits the four (-1,0) (+1,0) (0,-1) (0,+1) bin perturbations.
/// The caller concatenates these with the base tokens.
pub fn encode_with_tolerance(peaks: &[Peak]) -> Vec<Fingerprint> {
    const JITTER: [(i64, i64); 4] = [(-1, 0), (1, 0), (0, -1), (0, 1)];

    let n = peaks.len();
    let mut tokens = Vec::new();

    let mut i = 0;
    while i < n {
        let anchor = &peaks[i];
        for target in &peaks[(i + 1).min(n)..(i + FAN_OUT).min(n)] {
            let delta = target.time_ms - anchor.time_ms;
            if delta <= MIN_DELTA_MS || delta > MAX_DELTA_MS {
                continue;
            }
            let delta_ms = delta as i64;
            let offset_ms = anchor.time_ms as i64;

            for (da, dt) in JITTER {
                let a = anchor.freq_bin as i64 + da;
                let t = target.freq_bin as i64 + dt;
                if !(0..=TOLERANCE_MAX_BIN).contains(&a) || !(0..=TOLERANCE_MAX_BIN).contains(&t) {
                    continue;
                }
                tokens.push(Fingerprint {
                    hash: pair_hash(a as usize, t as usize, delta_ms),
                    offset_ms,
                });
                if tokens.len() >= TOLERANCE_TOKEN_CAP {
                    return tokens;
                }
            }
        }
        i += TOLERANCE_ANCHOR_STRIDE;
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peak(time_ms: f64, freq_bin: usize) -> Peak {
        Peak {
            frame: 0,
            time_ms,
            freq_bin,
            magnitude: 1.0,
        }
    }

    #[test]
    fn hash_matches_published_digest() {
        assert_eq!(
            pair_hash(123, 456, 789),
            "55edacfdd455a9de649d0aa903569ebb79202426"
        );
        assert_eq!(
            pair_hash(10, 20, 500),
            "68a4afaa33252151d57a0d07ce37a2743ad1407e"
        );
    }

    #[test]
    fn hash_is_forty_lowercase_hex_chars() {
        let h = pair_hash(1, 2, 3);
        assert_eq!(h.len(), 40);
        assert!(
            h.chars()
                .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        );
    }

    #[test]
    fn simultaneous_peaks_never_pair() {
        let peaks = vec![peak(100.0, 10), peak(100.0, 20)];
        assert!(encode(&peaks).is_empty());
    }

    #[test]
    fn delta_upper_bound_is_inclusive() {
        let in_range = vec![peak(0.0, 10), peak(2000.0, 20)];
        assert_eq!(encode(&in_range).len(), 1);

        let out_of_range = vec![peak(0.0, 10), peak(2000.5, 20)];
        assert!(encode(&out_of_range).is_empty());
    }

    #[test]
    fn offset_is_the_truncated_anchor_time() {
        let peaks = vec![peak(123.9, 10), peak(500.2, 20)];
        let tokens = encode(&peaks);
        assert_eq!(tokens[0].offset_ms, 123);
        // Delta 376.3 ms truncates to 376 in the hash input.
        assert_eq!(tokens[0].hash, pair_hash(10, 20, 376));
    }

    #[test]
    fn anchors_reach_at_most_fan_minus_one_targets() {
        // Thirty peaks 10 ms apart: every pair is within the delta range,
        // so the first anchor's token count is bounded by the fan alone.
        let peaks: Vec<Peak> = (0..30).map(|i| peak(i as f64 * 10.0, 100 + i)).collect();
        let tokens = encode(&peaks);

        let first_anchor_tokens = tokens.iter().filter(|t| t.offset_ms == 0).count();
        assert_eq!(first_anchor_tokens, FAN_OUT - 1);
    }

    #[test]
    fn encoding_is_deterministic_and_order_preserving() {
        let peaks: Vec<Peak> = (0..25).map(|i| peak(i as f64 * 50.0, 40 + 3 * i)).collect();
        let a = encode(&peaks);
        let b = encode(&peaks);
        assert!(!a.is_empty());
        assert_eq!(a, b);

        let offsets: Vec<i64> = a.iter().map(|t| t.offset_ms).collect();
        let mut sorted = offsets.clone();
        sorted.sort();
        assert_eq!(offsets, sorted);
    }

    #[test]
    fn tolerance_strides_anchors_by_four() {
        // Five peaks: anchors 0 and 4 are visited, and only anchor 0 has
        // targets. Four accepted pairs, four jitter tokens each.
        let peaks: Vec<Peak> = (0..5).map(|i| peak(i as f64 * 10.0, 100 + i)).collect();
        let tokens = encode_with_tolerance(&peaks);
        assert_eq!(tokens.len(), 16);
        assert!(tokens.iter().all(|t| t.offset_ms == 0));
    }

    #[test]
    fn jitter_below_bin_zero_is_discarded() {
        let peaks = vec![peak(0.0, 0), peak(10.0, 100)];
        let tokens = encode_with_tolerance(&peaks);
        // The (-1, 0) variant on anchor bin 0 drops out; the other three stay.
        assert_eq!(tokens.len(), 3);
        assert!(tokens.iter().any(|t| t.hash == pair_hash(1, 100, 10)));
        assert!(tokens.iter().any(|t| t.hash == pair_hash(0, 99, 10)));
        assert!(tokens.iter().any(|t| t.hash == pair_hash(0, 101, 10)));
    }

    #[test]
    fn tolerance_output_caps_at_ten_thousand() {
        // 800 peaks, 10 ms apart: 200 anchors x 14 pairs x 4 jitters well
        // exceeds the cap.
        let peaks: Vec<Peak> = (0..800)
            .map(|i| peak(i as f64 * 10.0, 100 + (i % 64)))
            .collect();
        let tokens = encode_with_tolerance(&peaks);
        assert_eq!(tokens.len(), 10_000);
    }

    #[test]
    fn base_and_tolerance_tokens_share_the_hash_space() {
        let peaks = vec![peak(0.0, 50), peak(250.0, 80)];
        let base = encode(&peaks);
        let tolerance = encode_with_tolerance(&peaks);
        assert_eq!(base.len(), 1);
        assert_eq!(tolerance.len(), 4);
        // A one-bin-off observation of the same pair hits a tolerance token.
        assert!(tolerance.iter().any(|t| t.hash == pair_hash(51, 80, 250)));
        assert!(!tolerance.iter().any(|t| t.hash == base[0].hash));
    }
}
