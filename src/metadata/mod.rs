pub mod cache;
pub mod tmdb;

use thiserror::Error;

use crate::db::DbError;
use crate::db::models::{MediaIdentity, MediaType, SeasonDetails};
use crate::disc::label::normalize_title;

pub use cache::{CachedMetadata, MetadataCache};
pub use tmdb::Tmdb;

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("Metadata service not configured: {0}")]
    NotConfigured(String),
    #[error("HTTP request failed: {0}")]
    Http(String),
    #[error("Unexpected response: {0}")]
    Parse(String),
    #[error("Metadata cache error: {0}")]
    Cache(#[from] DbError),
}

pub type Result<T> = std::result::Result<T, MetadataError>;

/// Movie/series lookup service.
pub trait MetadataProvider {
    /// Candidates for a title, best match first. `MediaType::Unknown`
    /// searches both movies and series.
    fn search(&self, title: &str, kind: MediaType) -> Result<Vec<MediaIdentity>>;

    /// Episode list for one season, `None` when the service has no such
    /// season.
    fn season(&self, external_id: u64, season: u32) -> Result<Option<SeasonDetails>>;
}

impl<P: MetadataProvider + ?Sized> MetadataProvider for Box<P> {
    fn search(&self, title: &str, kind: MediaType) -> Result<Vec<MediaIdentity>> {
        (**self).search(title, kind)
    }

    fn season(&self, external_id: u64, season: u32) -> Result<Option<SeasonDetails>> {
        (**self).season(external_id, season)
    }
}

/// Used when no service is configured: every lookup is "not found".
#[derive(Debug, Default)]
pub struct Offline;

impl MetadataProvider for Offline {
    fn search(&self, _title: &str, _kind: MediaType) -> Result<Vec<MediaIdentity>> {
        Ok(Vec::new())
    }

    fn season(&self, _external_id: u64, _season: u32) -> Result<Option<SeasonDetails>> {
        Ok(None)
    }
}

/// How well a result title matches the searched title, 0.0–1.0.
/// Exact (normalised) match → 1.0, containment → 0.75, otherwise word
/// overlap scaled into 0.0–0.7.
pub fn match_confidence(query: &str, candidate: &str) -> f64 {
    let q = normalize_title(query);
    let c = normalize_title(candidate);
    if q.is_empty() || c.is_empty() {
        return 0.0;
    }
    if q == c {
        return 1.0;
    }
    if c.contains(&q) || q.contains(&c) {
        return 0.75;
    }

    let qw: std::collections::HashSet<&str> = q.split(' ').collect();
    let cw: std::collections::HashSet<&str> = c.split(' ').collect();
    let shared = qw.intersection(&cw).count() as f64;
    let total = qw.union(&cw).count() as f64;
    0.7 * shared / total
}

/// Sort candidates best match first.
pub(crate) fn rank(mut candidates: Vec<MediaIdentity>) -> Vec<MediaIdentity> {
    candidates.sort_by(|a, b| {
        b.match_confidence
            .partial_cmp(&a.match_confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates
}
