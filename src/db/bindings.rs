use chrono::NaiveDateTime;
use diesel::prelude::*;

#[derive(Queryable, Selectable, Debug)]
#[diesel(table_name = crate::schema::songs)]
#[diesel(check_for_backend(diesel::mysql::Mysql))]
pub struct SongRow {
    pub id: u32,
    pub name: String,
    pub artist: String,
    pub file_hash: String,
    pub fingerprinted: bool,
    pub total_hashes: i32,
    pub date_created: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = crate::schema::songs)]
pub struct NewSong<'a> {
    pub name: &'a str,
    pub artist: &'a str,
    pub file_hash: &'a str,
    pub fingerprinted: bool,
    pub total_hashes: i32,
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::fingerprints)]
#[diesel(check_for_backend(diesel::mysql::Mysql))]
pub struct FingerprintRow {
    pub hash: String,
    pub song_id: u32,
    pub offset_ms: i64,
}
