//! Tier-2 persistent store backed by SQLite.
//! Subtitle translations are partitioned by (movie, target language); movie
//! metadata drives age-based eviction; word translations are keyed by
//! (word, target language). All writes are upserts, so repeating one is safe.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{WordSource, WordTranslation};

/// Fixed source-language tag on every subtitle record.
pub const ORIGINAL_LANGUAGE: &str = "source";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationRecord {
    pub movie_name: String,
    pub original_language: String,
    pub target_language: String,
    /// Normalized key of the original line.
    pub original_text: String,
    pub translated_text: String,
}

impl TranslationRecord {
    pub fn new(movie_name: &str, target_language: &str, original_text: &str, translated_text: &str) -> Self {
        Self {
            movie_name: movie_name.to_string(),
            original_language: ORIGINAL_LANGUAGE.to_string(),
            target_language: target_language.to_string(),
            original_text: original_text.to_string(),
            translated_text: translated_text.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovieMetadata {
    pub movie_name: String,
    /// Whole days since the Unix epoch at last access.
    pub last_accessed_days: i64,
}

impl MovieMetadata {
    pub fn accessed_today(movie_name: &str) -> Self {
        Self {
            movie_name: movie_name.to_string(),
            last_accessed_days: today_days(),
        }
    }
}

#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    Corrupt(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Sqlite(e) => write!(f, "SQLite error: {e}"),
            StoreError::Corrupt(msg) => write!(f, "corrupt row: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e)
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS subtitles (
    movie_name TEXT NOT NULL,
    original_language TEXT NOT NULL,
    target_language TEXT NOT NULL,
    original_text TEXT NOT NULL,
    translated_text TEXT NOT NULL,
    PRIMARY KEY (movie_name, target_language, original_text)
);
CREATE TABLE IF NOT EXISTS movie_metadata (
    movie_name TEXT PRIMARY KEY,
    last_accessed_days INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS word_translations (
    word TEXT NOT NULL,
    target_language TEXT NOT NULL,
    translation TEXT NOT NULL,
    source TEXT NOT NULL,
    PRIMARY KEY (word, target_language)
);
";

const UPSERT_SUBTITLE: &str = "
INSERT INTO subtitles
    (movie_name, original_language, target_language, original_text, translated_text)
VALUES (?1, ?2, ?3, ?4, ?5)
ON CONFLICT (movie_name, target_language, original_text)
DO UPDATE SET translated_text = excluded.translated_text";

/// The process-wide store. Opened once and shared behind an `Arc`.
pub struct SubtitleStore {
    conn: Mutex<Connection>,
}

impl SubtitleStore {
    /// Open (or create) the database at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let store = Self::with_connection(conn)?;
        info!(path = %db_path.display(), "subtitle store opened");
        Ok(store)
    }

    /// In-memory database; nothing survives the process.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // --- subtitles ---

    pub fn save_subtitle(&self, record: &TranslationRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            UPSERT_SUBTITLE,
            params![
                record.movie_name,
                record.original_language,
                record.target_language,
                record.original_text,
                record.translated_text,
            ],
        )?;
        Ok(())
    }

    /// Upsert many records in one transaction.
    pub fn save_subtitles_batch(&self, records: &[TranslationRecord]) -> Result<usize, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(UPSERT_SUBTITLE)?;
            for record in records {
                stmt.execute(params![
                    record.movie_name,
                    record.original_language,
                    record.target_language,
                    record.original_text,
                    record.translated_text,
                ])?;
            }
        }
        tx.commit()?;
        debug!(count = records.len(), "subtitle batch saved");
        Ok(records.len())
    }

    pub fn get_subtitle(
        &self,
        movie_name: &str,
        target_language: &str,
        original_text: &str,
    ) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock();
        let found = conn
            .query_row(
                "SELECT translated_text FROM subtitles
                 WHERE movie_name = ?1 AND target_language = ?2 AND original_text = ?3",
                params![movie_name, target_language, original_text],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found)
    }

    pub fn load_subtitles_by_movie_name(
        &self,
        movie_name: &str,
        target_language: &str,
    ) -> Result<Vec<TranslationRecord>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT movie_name, original_language, target_language, original_text, translated_text
             FROM subtitles WHERE movie_name = ?1 AND target_language = ?2",
        )?;
        let rows = stmt.query_map(params![movie_name, target_language], |row| {
            Ok(TranslationRecord {
                movie_name: row.get(0)?,
                original_language: row.get(1)?,
                target_language: row.get(2)?,
                original_text: row.get(3)?,
                translated_text: row.get(4)?,
            })
        })?;
        let records = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn clear_subtitles_by_movie_name(&self, movie_name: &str) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM subtitles WHERE movie_name = ?1", params![movie_name])?;
        Ok(removed)
    }

    // --- movie metadata ---

    pub fn upsert_movie_metadata(&self, meta: &MovieMetadata) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO movie_metadata (movie_name, last_accessed_days) VALUES (?1, ?2)
             ON CONFLICT (movie_name) DO UPDATE SET last_accessed_days = excluded.last_accessed_days",
            params![meta.movie_name, meta.last_accessed_days],
        )?;
        Ok(())
    }

    pub fn get_movie_metadata(&self, movie_name: &str) -> Result<Option<MovieMetadata>, StoreError> {
        let conn = self.conn.lock();
        let found = conn
            .query_row(
                "SELECT movie_name, last_accessed_days FROM movie_metadata WHERE movie_name = ?1",
                params![movie_name],
                |row| {
                    Ok(MovieMetadata {
                        movie_name: row.get(0)?,
                        last_accessed_days: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(found)
    }

    pub fn get_all_movie_metadata(&self) -> Result<Vec<MovieMetadata>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT movie_name, last_accessed_days FROM movie_metadata")?;
        let rows = stmt.query_map([], |row| {
            Ok(MovieMetadata {
                movie_name: row.get(0)?,
                last_accessed_days: row.get(1)?,
            })
        })?;
        let all = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(all)
    }

    pub fn delete_movie_metadata(&self, movie_name: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM movie_metadata WHERE movie_name = ?1", params![movie_name])?;
        Ok(removed > 0)
    }

    /// Remove metadata and subtitle records of movies not accessed within
    /// `max_age_days`. Returns the names of the removed movies.
    pub fn cleanup_old_movie_data(&self, max_age_days: u32) -> Result<Vec<String>, StoreError> {
        self.cleanup_old_movie_data_at(max_age_days, today_days())
    }

    pub fn cleanup_old_movie_data_at(&self, max_age_days: u32, today: i64) -> Result<Vec<String>, StoreError> {
        let cutoff = today - i64::from(max_age_days);
        let stale: Vec<String> = self
            .get_all_movie_metadata()?
            .into_iter()
            .filter(|m| m.last_accessed_days < cutoff)
            .map(|m| m.movie_name)
            .collect();

        if stale.is_empty() {
            return Ok(stale);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for name in &stale {
            tx.execute("DELETE FROM subtitles WHERE movie_name = ?1", params![name])?;
            tx.execute("DELETE FROM movie_metadata WHERE movie_name = ?1", params![name])?;
        }
        tx.commit()?;
        info!(removed = stale.len(), max_age_days, "old movie data cleaned up");
        Ok(stale)
    }

    // --- word translations ---

    pub fn get_word_translation(
        &self,
        word: &str,
        target_language: &str,
    ) -> Result<Option<WordTranslation>, StoreError> {
        let conn = self.conn.lock();
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT translation, source FROM word_translations
                 WHERE word = ?1 AND target_language = ?2",
                params![word, target_language],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((translation, source)) => {
                let source = WordSource::parse(&source)
                    .ok_or_else(|| StoreError::Corrupt(format!("unknown word source {source:?}")))?;
                Ok(Some(WordTranslation {
                    word: word.to_string(),
                    target_language: target_language.to_string(),
                    translation,
                    source,
                }))
            }
        }
    }

    pub fn save_word_translation(&self, entry: &WordTranslation) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO word_translations (word, target_language, translation, source)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (word, target_language)
             DO UPDATE SET translation = excluded.translation, source = excluded.source",
            params![entry.word, entry.target_language, entry.translation, entry.source.as_str()],
        )?;
        Ok(())
    }

    pub fn delete_word_translation(&self, word: &str, target_language: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM word_translations WHERE word = ?1 AND target_language = ?2",
            params![word, target_language],
        )?;
        Ok(removed > 0)
    }

    pub fn clear_all_word_translations(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM word_translations", [])?;
        info!(removed, "word translations cleared");
        Ok(removed)
    }
}

/// Whole days since the Unix epoch.
pub fn today_days() -> i64 {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    (secs / 86_400) as i64
}
