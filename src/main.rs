mod audio_processor;
mod config;
mod db;
mod error;
mod fingerprint;
mod matcher;
mod microphone;
mod peaks;
mod schema;
mod spectrogram;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::audio_processor::AudioProcessor;
use crate::db::connector::Db;
use crate::matcher::{Match, MatchTuning};
use crate::microphone::ListenOutcome;

#[derive(Parser, Debug)]
#[command(name = "luna")]
#[command(about = "Constellation-map audio recognition against a local fingerprint database")]
#[command(version)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "luna.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fingerprint an audio file into the database
    Ingest {
        file: PathBuf,
        /// Song title; defaults to the file stem
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        artist: Option<String>,
    },
    /// Recognise a pre-recorded audio file
    Recognize { file: PathBuf },
    /// Recognise from the default microphone
    Listen,
    /// List ingested songs
    List,
    /// Delete a song and its fingerprints by id
    Delete { song_id: u32 },
    /// Remove duplicate songs sharing a file hash
    Cleanup,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "luna=info".into()))
        .init();

    let args = Args::parse();
    let url = config::database_url(&args.config)?;
    let mut db = Db::connect(&url)?;
    db.setup()?;

    match args.command {
        Command::Ingest { file, name, artist } => ingest(&mut db, &file, name, artist),
        Command::Recognize { file } => recognize_file(&mut db, &file),
        Command::Listen => listen(db),
        Command::List => list(&mut db),
        Command::Delete { song_id } => delete(&mut db, song_id),
        Command::Cleanup => cleanup(&mut db),
    }
}

/// Decode, fingerprint and persist one file.
fn ingest(
    db: &mut Db,
    file: &Path,
    name: Option<String>,
    artist: Option<String>,
) -> anyhow::Result<()> {
    let name = name.unwrap_or_else(|| {
        file.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown".to_string())
    });
    let artist = artist.unwrap_or_else(|| "unknown".to_string());

    let fingerprinted = fingerprint_file(file)?;
    let tokens = &fingerprinted.tokens;

    let song_id = db.insert_song(&name, &artist, &fingerprinted.file_hash, tokens.len() as i32)?;
    db.insert_fingerprints(song_id, tokens)?;
    db.mark_fingerprinted(song_id)?;

    println!(
        "ingested '{name}' as song {song_id} ({} fingerprints)",
        tokens.len()
    );
    Ok(())
}

fn recognize_file(db: &mut Db, file: &Path) -> anyhow::Result<()> {
    let fingerprinted = fingerprint_file(file)?;
    let query = matcher::query_map(&fingerprinted.tokens);
    let matches = matcher::find_matches(db, &query, &MatchTuning::file())?;
    print_matches(&matches);
    Ok(())
}

struct FingerprintedFile {
    file_hash: String,
    tokens: Vec<fingerprint::Fingerprint>,
}

fn fingerprint_file(file: &Path) -> Result<FingerprintedFile, error::PipelineError> {
    let decoded = AudioProcessor::new().decode_file(file)?;
    let grid = spectrogram::spectrogram(&decoded.samples)?;
    let constellation = peaks::pick_peaks(&grid, AudioProcessor::TARGET_SAMPLE_RATE);
    let tokens = fingerprint::encode(&constellation);
    info!(
        file = %file.display(),
        peaks = constellation.len(),
        fingerprints = tokens.len(),
        "fingerprinted"
    );
    Ok(FingerprintedFile {
        file_hash: decoded.file_hash,
        tokens,
    })
}

fn listen(db: Db) -> anyhow::Result<()> {
    let shared = Arc::new(Mutex::new(db));
    match microphone::listen(shared)? {
        ListenOutcome::Matched(m) => print_matches(std::slice::from_ref(&m)),
        ListenOutcome::TimedOut => println!("no match within 30 seconds"),
        ListenOutcome::Interrupted => println!("interrupted"),
    }
    Ok(())
}

fn list(db: &mut Db) -> anyhow::Result<()> {
    let songs = db.list_songs()?;
    if songs.is_empty() {
        println!("no songs ingested");
        return Ok(());
    }
    for song in songs {
        println!(
            "{:>5}  {} - {}  [{} hashes, file {}, added {}]{}",
            song.id,
            song.artist,
            song.name,
            song.total_hashes,
            &song.file_hash[..8],
            song.date_created.format("%Y-%m-%d"),
            if song.fingerprinted {
                ""
            } else {
                " (incomplete)"
            }
        );
    }
    Ok(())
}

fn delete(db: &mut Db, song_id: u32) -> anyhow::Result<()> {
    if db.delete_song(song_id)? {
        println!("deleted song {song_id}");
        Ok(())
    } else {
        anyhow::bail!("no song with id {song_id}")
    }
}

fn cleanup(db: &mut Db) -> anyhow::Result<()> {
    let removed = db.cleanup()?;
    println!("removed {removed} duplicate song(s)");
    Ok(())
}

fn print_matches(matches: &[Match]) {
    if matches.is_empty() {
        println!("no match");
        return;
    }
    for (rank, m) in matches.iter().enumerate() {
        println!(
            "{}. {} - {}  score {:.2}  offset {:.1}s",
            rank + 1,
            m.artist,
            m.name,
            m.score,
            m.offset_ms as f64 / 1000.0
        );
    }
}
