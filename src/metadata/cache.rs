//! On-disk cache of metadata lookups, kept in its own SQLite file so it can
//! be deleted without touching series state.

use rusqlite::{Connection, OptionalExtension, params};
use serde::de::DeserializeOwned;
use std::path::Path;

use super::{MetadataProvider, Result};
use crate::db::DbError;
use crate::db::models::{MediaIdentity, MediaType, SeasonDetails};
use crate::disc::label::normalize_title;

pub struct MetadataCache {
    conn: Connection,
}

impl MetadataCache {
    pub fn open(path: &Path) -> std::result::Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let cache = Self {
            conn: Connection::open(path)?,
        };
        cache.init()?;
        Ok(cache)
    }

    pub fn open_in_memory() -> std::result::Result<Self, DbError> {
        let cache = Self {
            conn: Connection::open_in_memory()?,
        };
        cache.init()?;
        Ok(cache)
    }

    fn init(&self) -> std::result::Result<(), DbError> {
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS search_cache (
                key         TEXT PRIMARY KEY,
                json        TEXT NOT NULL,
                fetched_at  TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS season_cache (
                external_id INTEGER NOT NULL,
                season      INTEGER NOT NULL,
                json        TEXT NOT NULL,
                fetched_at  TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (external_id, season)
            );
            ",
        )?;
        Ok(())
    }

    fn search_key(title: &str, kind: MediaType) -> String {
        format!("{}|{}", kind.label(), normalize_title(title))
    }

    pub fn get_search(
        &self,
        title: &str,
        kind: MediaType,
        ttl_days: u32,
    ) -> std::result::Result<Option<Vec<MediaIdentity>>, DbError> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT json FROM search_cache
                 WHERE key = ?1 AND fetched_at >= datetime('now', ?2)",
                params![Self::search_key(title, kind), age_modifier(ttl_days)],
                |row| row.get(0),
            )
            .optional()?;
        decode(json, title)
    }

    pub fn put_search(
        &self,
        title: &str,
        kind: MediaType,
        results: &[MediaIdentity],
    ) -> std::result::Result<(), DbError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO search_cache (key, json, fetched_at)
             VALUES (?1, ?2, datetime('now'))",
            params![Self::search_key(title, kind), serde_json::to_string(results)?],
        )?;
        Ok(())
    }

    pub fn get_season(
        &self,
        external_id: u64,
        season: u32,
        ttl_days: u32,
    ) -> std::result::Result<Option<SeasonDetails>, DbError> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT json FROM season_cache
                 WHERE external_id = ?1 AND season = ?2 AND fetched_at >= datetime('now', ?3)",
                params![external_id as i64, season, age_modifier(ttl_days)],
                |row| row.get(0),
            )
            .optional()?;
        decode(json, &format!("{external_id}/{season}"))
    }

    pub fn put_season(&self, details: &SeasonDetails) -> std::result::Result<(), DbError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO season_cache (external_id, season, json, fetched_at)
             VALUES (?1, ?2, ?3, datetime('now'))",
            params![
                details.external_id as i64,
                details.season,
                serde_json::to_string(details)?
            ],
        )?;
        Ok(())
    }

    /// Drop entries older than the TTL. Returns the number removed.
    pub fn prune(&self, ttl_days: u32) -> std::result::Result<usize, DbError> {
        let age = age_modifier(ttl_days);
        let a = self.conn.execute(
            "DELETE FROM search_cache WHERE fetched_at < datetime('now', ?1)",
            params![age],
        )?;
        let b = self.conn.execute(
            "DELETE FROM season_cache WHERE fetched_at < datetime('now', ?1)",
            params![age],
        )?;
        Ok(a + b)
    }
}

fn age_modifier(ttl_days: u32) -> String {
    format!("-{ttl_days} days")
}

fn decode<T: DeserializeOwned>(
    json: Option<String>,
    key: &str,
) -> std::result::Result<Option<T>, DbError> {
    json.map(|j| {
        serde_json::from_str(&j).map_err(|source| DbError::Corrupt {
            key: key.to_string(),
            source,
        })
    })
    .transpose()
}

/// Read-through cache in front of another provider. Cache failures are
/// logged and the inner provider is asked directly.
pub struct CachedMetadata<P> {
    inner: P,
    cache: MetadataCache,
    ttl_days: u32,
}

impl<P: MetadataProvider> CachedMetadata<P> {
    pub fn new(inner: P, cache: MetadataCache, ttl_days: u32) -> Self {
        Self {
            inner,
            cache,
            ttl_days,
        }
    }
}

impl<P: MetadataProvider> MetadataProvider for CachedMetadata<P> {
    fn search(&self, title: &str, kind: MediaType) -> Result<Vec<MediaIdentity>> {
        match self.cache.get_search(title, kind, self.ttl_days) {
            Ok(Some(hit)) => {
                log::debug!("Metadata cache hit for '{title}'");
                return Ok(hit);
            }
            Ok(None) => {}
            Err(e) => log::warn!("Metadata cache read failed for '{title}': {e}"),
        }

        let results = self.inner.search(title, kind)?;
        if let Err(e) = self.cache.put_search(title, kind, &results) {
            log::warn!("Could not cache search results for '{title}': {e}");
        }
        Ok(results)
    }

    fn season(&self, external_id: u64, season: u32) -> Result<Option<SeasonDetails>> {
        match self.cache.get_season(external_id, season, self.ttl_days) {
            Ok(Some(hit)) => return Ok(Some(hit)),
            Ok(None) => {}
            Err(e) => log::warn!("Metadata cache read failed for {external_id}/{season}: {e}"),
        }

        let details = self.inner.season(external_id, season)?;
        if let Some(d) = &details {
            if let Err(e) = self.cache.put_season(d) {
                log::warn!("Could not cache season {external_id}/{season}: {e}");
            }
        }
        Ok(details)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::EpisodeInfo;
    use std::cell::Cell;

    struct Counting {
        searches: Cell<u32>,
        seasons: Cell<u32>,
    }

    impl Counting {
        fn new() -> Self {
            Self {
                searches: Cell::new(0),
                seasons: Cell::new(0),
            }
        }
    }

    impl MetadataProvider for Counting {
        fn search(&self, title: &str, kind: MediaType) -> Result<Vec<MediaIdentity>> {
            self.searches.set(self.searches.get() + 1);
            Ok(vec![MediaIdentity {
                title: title.to_string(),
                year: Some(2004),
                external_id: Some(42),
                media_type: kind,
                match_confidence: 1.0,
            }])
        }

        fn season(&self, external_id: u64, season: u32) -> Result<Option<SeasonDetails>> {
            self.seasons.set(self.seasons.get() + 1);
            if season > 3 {
                return Ok(None);
            }
            Ok(Some(SeasonDetails {
                external_id,
                season,
                episodes: vec![EpisodeInfo {
                    number: 1,
                    title: "Pilot".to_string(),
                    runtime_min: Some(44),
                }],
            }))
        }
    }

    #[test]
    fn test_search_is_cached() {
        let cached = CachedMetadata::new(Counting::new(), MetadataCache::open_in_memory().unwrap(), 30);
        let a = cached.search("Demo Show", MediaType::Series).unwrap();
        let b = cached.search("DEMO_SHOW", MediaType::Series).unwrap();
        assert_eq!(a, b);
        assert_eq!(cached.inner.searches.get(), 1);

        // different kind is a different key
        cached.search("Demo Show", MediaType::Movie).unwrap();
        assert_eq!(cached.inner.searches.get(), 2);
    }

    #[test]
    fn test_season_cached_but_misses_are_not() {
        let cached = CachedMetadata::new(Counting::new(), MetadataCache::open_in_memory().unwrap(), 30);
        assert!(cached.season(42, 1).unwrap().is_some());
        assert!(cached.season(42, 1).unwrap().is_some());
        assert_eq!(cached.inner.seasons.get(), 1);

        assert!(cached.season(42, 9).unwrap().is_none());
        assert!(cached.season(42, 9).unwrap().is_none());
        assert_eq!(cached.inner.seasons.get(), 3);
    }

    #[test]
    fn test_expired_entries_are_ignored() {
        let cache = MetadataCache::open_in_memory().unwrap();
        cache.put_search("Demo Show", MediaType::Series, &[]).unwrap();
        cache
            .conn
            .execute("UPDATE search_cache SET fetched_at = datetime('now', '-40 days')", [])
            .unwrap();
        assert!(cache.get_search("Demo Show", MediaType::Series, 30).unwrap().is_none());
        assert!(cache.get_search("Demo Show", MediaType::Series, 60).unwrap().is_some());
        assert_eq!(cache.prune(30).unwrap(), 1);
    }

    #[test]
    fn test_broken_cache_falls_through() {
        let cache = MetadataCache::open_in_memory().unwrap();
        cache.conn.execute_batch("DROP TABLE search_cache").unwrap();
        let cached = CachedMetadata::new(Counting::new(), cache, 30);
        let r = cached.search("Demo Show", MediaType::Series).unwrap();
        assert_eq!(r.len(), 1);
    }
}
