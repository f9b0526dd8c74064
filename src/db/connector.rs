use std::collections::HashSet;

use diesel::mysql::MysqlConnection;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use tracing::{debug, info};

use crate::db::bindings::{FingerprintRow, NewSong, SongRow};
use crate::error::StoreError;
use crate::fingerprint::Fingerprint;
use crate::matcher::{FingerprintIndex, HashHit, SongInfo};

/// Rows per INSERT statement when bulk-writing fingerprints.
const INSERT_BATCH_SIZE: usize = 5_000;

diesel::define_sql_function! {
    fn last_insert_id() -> Unsigned<Bigint>;
}

const CREATE_SONGS: &str = "
    CREATE TABLE IF NOT EXISTS songs (
        id INT UNSIGNED AUTO_INCREMENT PRIMARY KEY,
        name VARCHAR(255) NOT NULL,
        artist VARCHAR(255) NOT NULL,
        file_hash CHAR(40) NOT NULL UNIQUE,
        fingerprinted BOOLEAN NOT NULL DEFAULT FALSE,
        total_hashes INT NOT NULL DEFAULT 0,
        date_created TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    )";

const CREATE_FINGERPRINTS: &str = "
    CREATE TABLE IF NOT EXISTS fingerprints (
        hash CHAR(40) NOT NULL,
        song_id INT UNSIGNED NOT NULL,
        offset_ms BIGINT NOT NULL,
        PRIMARY KEY (hash, song_id, offset_ms),
        KEY idx_fingerprints_hash (hash)
    )";

/// The fingerprint store, a process-wide resource acquired at startup.
pub struct Db {
    conn: MysqlConnection,
}

impl Db {
    pub fn connect(url: &str) -> Result<Self, StoreError> {
        let conn = MysqlConnection::establish(url)?;
        Ok(Self { conn })
    }

    /// Idempotent creation of the persistent tables.
    pub fn setup(&mut self) -> Result<(), StoreError> {
        diesel::sql_query(CREATE_SONGS).execute(&mut self.conn)?;
        diesel::sql_query(CREATE_FINGERPRINTS).execute(&mut self.conn)?;
        Ok(())
    }

    /// Registers a song. The file hash is the deduplication key; an existing
    /// one is a `DuplicateSong` error and writes nothing.
    pub fn insert_song(
        &mut self,
        name: &str,
        artist: &str,
        file_hash: &str,
        total_hashes: i32,
    ) -> Result<u32, StoreError> {
        use crate::schema::songs::dsl;

        let existing: Option<u32> = dsl::songs
            .filter(dsl::file_hash.eq(file_hash))
            .select(dsl::id)
            .first(&mut self.conn)
            .optional()?;
        if existing.is_some() {
            return Err(StoreError::DuplicateSong(file_hash.to_string()));
        }

        let row = NewSong {
            name,
            artist,
            file_hash,
            fingerprinted: false,
            total_hashes,
        };
        match diesel::insert_into(dsl::songs)
            .values(&row)
            .execute(&mut self.conn)
        {
            Ok(_) => {}
            // Lost the race against a concurrent ingest of the same file.
            Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
                return Err(StoreError::DuplicateSong(file_hash.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        let id: u64 = diesel::select(last_insert_id()).get_result(&mut self.conn)?;
        info!(song_id = id, name, "registered song");
        Ok(id as u32)
    }

    /// Bulk fingerprint write, chunked inside one transaction. Idempotent
    /// per (hash, song_id, offset_ms) triple.
    pub fn insert_fingerprints(
        &mut self,
        song_id: u32,
        tokens: &[Fingerprint],
    ) -> Result<usize, StoreError> {
        use crate::schema::fingerprints::dsl;

        let rows: Vec<FingerprintRow> = tokens
            .iter()
            .map(|t| FingerprintRow {
                hash: t.hash.clone(),
                song_id,
                offset_ms: t.offset_ms,
            })
            .collect();

        let inserted = self
            .conn
            .transaction::<usize, DieselError, _>(|conn| {
                let mut total = 0;
                for batch in rows.chunks(INSERT_BATCH_SIZE) {
                    total += diesel::insert_or_ignore_into(dsl::fingerprints)
                        .values(batch)
                        .execute(conn)?;
                }
                Ok(total)
            })?;

        debug!(song_id, inserted, of = tokens.len(), "wrote fingerprints");
        Ok(inserted)
    }

    pub fn mark_fingerprinted(&mut self, song_id: u32) -> Result<(), StoreError> {
        use crate::schema::songs::dsl;
        diesel::update(dsl::songs.filter(dsl::id.eq(song_id)))
            .set(dsl::fingerprinted.eq(true))
            .execute(&mut self.conn)?;
        Ok(())
    }

    /// Removes the song row and every fingerprint pointing at it. Returns
    /// whether the id existed.
    pub fn delete_song(&mut self, song_id: u32) -> Result<bool, StoreError> {
        use crate::schema::{fingerprints, songs};

        let removed = self.conn.transaction::<usize, DieselError, _>(|conn| {
            diesel::delete(fingerprints::dsl::fingerprints.filter(
                fingerprints::dsl::song_id.eq(song_id),
            ))
            .execute(conn)?;
            diesel::delete(songs::dsl::songs.filter(songs::dsl::id.eq(song_id))).execute(conn)
        })?;
        Ok(removed > 0)
    }

    pub fn get_song(&mut self, song_id: u32) -> Result<Option<SongInfo>, StoreError> {
        use crate::schema::songs::dsl;
        let row: Option<SongRow> = dsl::songs
            .filter(dsl::id.eq(song_id))
            .select(SongRow::as_select())
            .first(&mut self.conn)
            .optional()?;
        Ok(row.map(song_info))
    }

    pub fn list_songs(&mut self) -> Result<Vec<SongRow>, StoreError> {
        use crate::schema::songs::dsl;
        let rows = dsl::songs
            .select(SongRow::as_select())
            .order(dsl::id.asc())
            .load(&mut self.conn)?;
        Ok(rows)
    }

    /// Removes songs whose file_hash is duplicated, keeping the earliest id
    /// of each group, fingerprints included. Returns how many songs went.
    pub fn cleanup(&mut self) -> Result<usize, StoreError> {
        use crate::schema::{fingerprints, songs};

        let rows: Vec<(u32, String)> = songs::dsl::songs
            .select((songs::dsl::id, songs::dsl::file_hash))
            .order(songs::dsl::id.asc())
            .load(&mut self.conn)?;

        let mut seen = HashSet::new();
        let doomed: Vec<u32> = rows
            .into_iter()
            .filter_map(|(id, hash)| (!seen.insert(hash)).then_some(id))
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }

        self.conn.transaction::<_, DieselError, _>(|conn| {
            diesel::delete(
                fingerprints::dsl::fingerprints
                    .filter(fingerprints::dsl::song_id.eq_any(&doomed)),
            )
            .execute(conn)?;
            diesel::delete(songs::dsl::songs.filter(songs::dsl::id.eq_any(&doomed)))
                .execute(conn)?;
            Ok(())
        })?;

        info!(removed = doomed.len(), "cleaned up duplicate songs");
        Ok(doomed.len())
    }
}

impl FingerprintIndex for Db {
    fn query_fingerprints(&mut self, hashes: &[String]) -> Result<Vec<HashHit>, StoreError> {
        use crate::schema::fingerprints::dsl;

        if hashes.is_empty() {
            return Ok(Vec::new());
        }
        debug_assert!(hashes.len() <= crate::matcher::MAX_QUERY_BATCH);

        let rows: Vec<FingerprintRow> = dsl::fingerprints
            .filter(dsl::hash.eq_any(hashes))
            .select(FingerprintRow::as_select())
            .load(&mut self.conn)?;

        Ok(rows
            .into_iter()
            .map(|r| HashHit {
                hash: r.hash,
                song_id: r.song_id,
                offset_ms: r.offset_ms,
            })
            .collect())
    }

    fn song_info(&mut self, song_id: u32) -> Result<Option<SongInfo>, StoreError> {
        self.get_song(song_id)
    }
}

fn song_info(row: SongRow) -> SongInfo {
    SongInfo {
        id: row.id,
        name: row.name,
        artist: row.artist,
        fingerprinted: row.fingerprinted,
    }
}
