use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::StoreError;
use crate::fingerprint::Fingerprint;

/// Hard upper bound on the number of hashes per store lookup. Keeps a single
/// query's work bounded and stays under backend placeholder limits.
pub const MAX_QUERY_BATCH: usize = 1000;
/// How many ranked matches a recognition returns at most.
pub const TOP_MATCHES: usize = 5;

/// Song metadata as the matcher needs it from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct SongInfo {
    pub id: u32,
    pub name: String,
    pub artist: String,
    /// False while an ingest is still writing fingerprints.
    pub fingerprinted: bool,
}

/// One fingerprint row coming back from a hash lookup.
#[derive(Debug, Clone)]
pub struct HashHit {
    pub hash: String,
    pub song_id: u32,
    pub offset_ms: i64,
}

/// What the matcher requires of a fingerprint store.
pub trait FingerprintIndex {
    fn query_fingerprints(&mut self, hashes: &[String]) -> Result<Vec<HashHit>, StoreError>;
    fn song_info(&mut self, song_id: u32) -> Result<Option<SongInfo>, StoreError>;
}

/// Shared-store variant: each call takes the lock for exactly one operation,
/// so concurrent recognition jobs never hold it across a whole match.
impl<S: FingerprintIndex> FingerprintIndex for Arc<Mutex<S>> {
    fn query_fingerprints(&mut self, hashes: &[String]) -> Result<Vec<HashHit>, StoreError> {
        let mut guard = self.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.query_fingerprints(hashes)
    }

    fn song_info(&mut self, song_id: u32) -> Result<Option<SongInfo>, StoreError> {
        let mut guard = self.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.song_info(song_id)
    }
}

/// The empirical scoring knobs, per input source.
#[derive(Debug, Clone)]
pub struct MatchTuning {
    /// Minimum raw hits before a song is considered at all.
    pub min_matches: usize,
    /// Divisor turning `peak_count * aligned_ratio` into a [0, 1] score.
    pub score_norm: f64,
    /// Scores at or below this are discarded.
    pub score_threshold: f64,
}

impl MatchTuning {
    pub fn file() -> Self {
        Self {
            min_matches: 5,
            score_norm: 100.0,
            score_threshold: 0.1,
        }
    }

    /// Microphone queries carry less signal, so every knob loosens.
    pub fn microphone() -> Self {
        Self {
            min_matches: 3,
            score_norm: 50.0,
            score_threshold: 0.05,
        }
    }
}

/// A ranked candidate. `offset_ms` is the position within the matched track
/// at which the query begins.
#[derive(Debug, Clone)]
pub struct Match {
    pub song_id: u32,
    pub name: String,
    pub artist: String,
    pub score: f64,
    pub offset_ms: i64,
}

/// Collapses fingerprint tokens into the hash -> anchor-offset map the
/// matcher consumes. The first offset seen for a hash wins.
pub fn query_map(tokens: &[Fingerprint]) -> HashMap<String, i64> {
    let mut map = HashMap::with_capacity(tokens.len());
    for token in tokens {
        map.entry(token.hash.clone()).or_insert(token.offset_ms);
    }
    map
}

/// Aligns query hashes against the store and ranks candidate songs.
///
/// A genuine match concentrates many `db_offset - query_offset` deltas in
/// one bucket; unrelated collisions scatter. The score rewards both the
/// absolute evidence (modal bucket size) and the tightness of alignment
/// (modal share of all hits for that song).
pub fn find_matches<S: FingerprintIndex>(
    index: &mut S,
    query: &HashMap<String, i64>,
    tuning: &MatchTuning,
) -> Result<Vec<Match>, StoreError> {
    let hashes: Vec<String> = query.keys().cloned().collect();

    let mut hits = Vec::new();
    for batch in hashes.chunks(MAX_QUERY_BATCH) {
        hits.extend(index.query_fingerprints(batch)?);
    }
    debug!(queried = hashes.len(), hits = hits.len(), "hash lookup done");

    // Delta histogram per song.
    let mut histograms: HashMap<u32, HashMap<i64, usize>> = HashMap::new();
    for hit in &hits {
        let Some(&query_offset) = query.get(&hit.hash) else {
            continue;
        };
        let delta = hit.offset_ms - query_offset;
        *histograms
            .entry(hit.song_id)
            .or_default()
            .entry(delta)
            .or_default() += 1;
    }

    let mut matches = Vec::new();
    for (song_id, histogram) in histograms {
        let total: usize = histogram.values().sum();
        if total < tuning.min_matches {
            continue;
        }

        // Modal delta; ties break toward the smaller delta.
        let Some((&modal_delta, &peak_count)) = histogram
            .iter()
            .max_by_key(|&(&delta, &count)| (count, Reverse(delta)))
        else {
            continue;
        };

        let aligned_ratio = peak_count as f64 / total as f64;
        let raw = peak_count as f64 * aligned_ratio;
        let score = (raw / tuning.score_norm).min(1.0);
        if score <= tuning.score_threshold {
            continue;
        }

        let Some(info) = index.song_info(song_id)? else {
            debug!(song_id, "hits for a song that no longer exists");
            continue;
        };
        // A half-written ingest can only produce a misleading score.
        if !info.fingerprinted {
            debug!(song_id, "song not fully ingested, skipping");
            continue;
        }
        matches.push(Match {
            song_id,
            name: info.name,
            artist: info.artist,
            score,
            offset_ms: modal_delta,
        });
    }

    matches.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    matches.truncate(TOP_MATCHES);
    Ok(matches)
}
