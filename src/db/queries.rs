use super::models::{LibraryStats, ManualIdentification, MediaIdentity, SeriesState};
use super::{Database, DbError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

impl Database {
    /// Load one series document by its normalised key.
    pub fn load_series(&self, title_key: &str) -> Result<Option<SeriesState>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT state_json FROM series_state WHERE title_key = ?1",
                params![title_key],
                |row| row.get(0),
            )
            .optional()?;

        match json {
            Some(j) => serde_json::from_str(&j)
                .map(Some)
                .map_err(|source| DbError::Corrupt {
                    key: title_key.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }

    /// Insert or replace a series document. Runs in its own transaction so a
    /// failed write leaves the previous document in place.
    pub fn save_series(&self, title_key: &str, state: &SeriesState) -> Result<()> {
        let json = serde_json::to_string(state)?;
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO series_state (title_key, title, state_json, updated_at)
             VALUES (?1, ?2, ?3, datetime('now'))
             ON CONFLICT(title_key) DO UPDATE SET
                title = excluded.title,
                state_json = excluded.state_json,
                updated_at = datetime('now')",
            params![title_key, state.title, json],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Delete a series profile, learned patterns included. Returns whether a
    /// row was removed.
    pub fn delete_series(&self, title_key: &str) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM series_state WHERE title_key = ?1", params![title_key])?;
        Ok(n > 0)
    }

    pub fn series_keys(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT title_key FROM series_state ORDER BY title_key")?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(keys)
    }

    /// All readable series documents ordered by title. Corrupt documents are
    /// logged and skipped.
    pub fn list_series(&self) -> Result<Vec<SeriesState>> {
        let mut stmt = self
            .conn
            .prepare("SELECT title_key, state_json FROM series_state ORDER BY title")?;

        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut out = Vec::with_capacity(rows.len());
        for (key, json) in rows {
            match serde_json::from_str::<SeriesState>(&json) {
                Ok(s) => out.push(s),
                Err(e) => log::warn!("Skipping corrupt series document '{key}': {e}"),
            }
        }
        Ok(out)
    }

    pub fn get_manual_identification(&self, pattern: &str) -> Result<Option<ManualIdentification>> {
        let row: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT identity_json, created_at FROM manual_identifications WHERE pattern = ?1",
                params![pattern],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((json, created_at)) = row else {
            return Ok(None);
        };

        let identity: MediaIdentity =
            serde_json::from_str(&json).map_err(|source| DbError::Corrupt {
                key: pattern.to_string(),
                source,
            })?;

        Ok(Some(ManualIdentification {
            pattern: pattern.to_string(),
            identity,
            created_at: parse_sqlite_time(&created_at),
        }))
    }

    pub fn save_manual_identification(&self, pattern: &str, identity: &MediaIdentity) -> Result<()> {
        let json = serde_json::to_string(identity)?;
        self.conn.execute(
            "INSERT INTO manual_identifications (pattern, identity_json, created_at)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(pattern) DO UPDATE SET
                identity_json = excluded.identity_json",
            params![pattern, json],
        )?;
        Ok(())
    }

    pub fn stats(&self) -> Result<LibraryStats> {
        let series = self.list_series()?;
        let manual_identifications: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM manual_identifications", [], |r| r.get(0))?;

        Ok(LibraryStats {
            series: series.len() as i64,
            discs: series.iter().map(|s| s.processed_discs.len() as i64).sum(),
            episodes: series
                .iter()
                .flat_map(|s| s.season_episode_counts.values())
                .map(|&n| n as i64)
                .sum(),
            manual_identifications,
            learned_patterns: series.iter().map(|s| s.learned_patterns.len() as i64).sum(),
        })
    }
}

/// SQLite `datetime('now')` text ("YYYY-MM-DD HH:MM:SS", UTC).
pub(crate) fn parse_sqlite_time(s: &str) -> DateTime<Utc> {
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|n| n.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::MediaType;

    fn identity() -> MediaIdentity {
        MediaIdentity {
            title: "Demo Show".to_string(),
            year: Some(2004),
            external_id: Some(1234),
            media_type: MediaType::Series,
            match_confidence: 1.0,
        }
    }

    #[test]
    fn test_save_and_load_series() {
        let db = Database::open_in_memory().unwrap();
        let mut s = SeriesState::new("Demo Show");
        s.next_episode = 5;
        db.save_series("demo show", &s).unwrap();

        let loaded = db.load_series("demo show").unwrap().unwrap();
        assert_eq!(loaded, s);
        assert!(db.load_series("other").unwrap().is_none());
    }

    #[test]
    fn test_save_series_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let s = SeriesState::new("Demo Show");
        db.save_series("demo show", &s).unwrap();
        db.save_series("demo show", &s).unwrap();
        assert_eq!(db.list_series().unwrap().len(), 1);
    }

    #[test]
    fn test_corrupt_document_is_an_error_not_a_panic() {
        let db = Database::open_in_memory().unwrap();
        db.conn
            .execute(
                "INSERT INTO series_state (title_key, title, state_json) VALUES ('bad', 'Bad', '{nope')",
                [],
            )
            .unwrap();
        assert!(matches!(db.load_series("bad"), Err(DbError::Corrupt { .. })));
        assert!(db.list_series().unwrap().is_empty());
    }

    #[test]
    fn test_delete_series() {
        let db = Database::open_in_memory().unwrap();
        db.save_series("demo show", &SeriesState::new("Demo Show")).unwrap();
        assert!(db.delete_series("demo show").unwrap());
        assert!(!db.delete_series("demo show").unwrap());
    }

    #[test]
    fn test_manual_identification_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_manual_identification("disc name").unwrap().is_none());
        db.save_manual_identification("disc name", &identity()).unwrap();
        let m = db.get_manual_identification("disc name").unwrap().unwrap();
        assert_eq!(m.identity, identity());
        assert_eq!(m.pattern, "disc name");
    }

    #[test]
    fn test_stats_empty() {
        let db = Database::open_in_memory().unwrap();
        let stats = db.stats().unwrap();
        assert_eq!(stats.series, 0);
        assert_eq!(stats.manual_identifications, 0);
    }
}
