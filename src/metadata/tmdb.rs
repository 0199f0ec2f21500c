//! TMDB (The Movie Database) client.

use serde::Deserialize;

use super::{MetadataError, MetadataProvider, Result, match_confidence, rank};
use crate::db::models::{EpisodeInfo, MediaIdentity, MediaType, SeasonDetails};

const DEFAULT_BASE_URL: &str = "https://api.themoviedb.org/3";

/// Results kept per search.
const MAX_RESULTS: usize = 8;

#[derive(Debug, Deserialize)]
struct SearchResponse<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct TvResult {
    id: u64,
    name: String,
    first_air_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MovieResult {
    id: u64,
    title: String,
    release_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SeasonResponse {
    #[serde(default)]
    episodes: Vec<EpisodeResult>,
}

#[derive(Debug, Deserialize)]
struct EpisodeResult {
    episode_number: u32,
    #[serde(default)]
    name: String,
    runtime: Option<u32>,
}

pub struct Tmdb {
    api_key: String,
    base_url: String,
    language: String,
}

impl Tmdb {
    pub fn new(api_key: &str, base_url: Option<&str>, language: &str) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(MetadataError::NotConfigured("TMDB API key is empty".to_string()));
        }
        Ok(Self {
            api_key: api_key.trim().to_string(),
            base_url: base_url.unwrap_or(DEFAULT_BASE_URL).trim_end_matches('/').to_string(),
            language: language.to_string(),
        })
    }

    fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Option<T>> {
        let url = format!("{}{path}", self.base_url);
        log::debug!("Fetching {url}");

        let mut request = ureq::get(&url)
            .query("api_key", &self.api_key)
            .query("language", &self.language);
        for (k, v) in query {
            request = request.query(*k, *v);
        }

        match request.call() {
            Ok(mut response) => response
                .body_mut()
                .read_json::<T>()
                .map(Some)
                .map_err(|e| MetadataError::Parse(format!("{path}: {e}"))),
            Err(ureq::Error::StatusCode(404)) => Ok(None),
            Err(ureq::Error::StatusCode(401)) => Err(MetadataError::NotConfigured(
                "TMDB rejected the API key".to_string(),
            )),
            Err(e) => Err(MetadataError::Http(format!("{path}: {e}"))),
        }
    }

    fn search_tv(&self, title: &str) -> Result<Vec<MediaIdentity>> {
        let resp: Option<SearchResponse<TvResult>> =
            self.get_json("/search/tv", &[("query", title)])?;
        Ok(resp
            .map(|r| r.results)
            .unwrap_or_default()
            .into_iter()
            .take(MAX_RESULTS)
            .map(|r| MediaIdentity {
                match_confidence: match_confidence(title, &r.name),
                title: r.name,
                year: parse_year(r.first_air_date.as_deref()),
                external_id: Some(r.id),
                media_type: MediaType::Series,
            })
            .collect())
    }

    fn search_movie(&self, title: &str) -> Result<Vec<MediaIdentity>> {
        let resp: Option<SearchResponse<MovieResult>> =
            self.get_json("/search/movie", &[("query", title)])?;
        Ok(resp
            .map(|r| r.results)
            .unwrap_or_default()
            .into_iter()
            .take(MAX_RESULTS)
            .map(|r| MediaIdentity {
                match_confidence: match_confidence(title, &r.title),
                title: r.title,
                year: parse_year(r.release_date.as_deref()),
                external_id: Some(r.id),
                media_type: MediaType::Movie,
            })
            .collect())
    }
}

impl MetadataProvider for Tmdb {
    fn search(&self, title: &str, kind: MediaType) -> Result<Vec<MediaIdentity>> {
        let found = match kind {
            MediaType::Series => self.search_tv(title)?,
            MediaType::Movie => self.search_movie(title)?,
            MediaType::Unknown => {
                let mut all = self.search_tv(title)?;
                all.extend(self.search_movie(title)?);
                all
            }
        };
        Ok(rank(found))
    }

    fn season(&self, external_id: u64, season: u32) -> Result<Option<SeasonDetails>> {
        let resp: Option<SeasonResponse> =
            self.get_json(&format!("/tv/{external_id}/season/{season}"), &[])?;
        Ok(resp.map(|r| SeasonDetails {
            external_id,
            season,
            episodes: r
                .episodes
                .into_iter()
                .map(|e| EpisodeInfo {
                    number: e.episode_number,
                    title: e.name,
                    runtime_min: e.runtime,
                })
                .collect(),
        }))
    }
}

/// "2004-09-22" → 2004. TMDB sends "" for unknown dates.
fn parse_year(date: Option<&str>) -> Option<i32> {
    date.and_then(|d| d.get(..4)).and_then(|y| y.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_year() {
        assert_eq!(parse_year(Some("2004-09-22")), Some(2004));
        assert_eq!(parse_year(Some("")), None);
        assert_eq!(parse_year(None), None);
    }

    #[test]
    fn test_tv_search_deserialize() {
        let json = r#"{"page":1,"results":[{"id":1399,"name":"Demo Show","first_air_date":"2011-04-17","popularity":1.0}]}"#;
        let r: SearchResponse<TvResult> = serde_json::from_str(json).unwrap();
        assert_eq!(r.results.len(), 1);
        assert_eq!(r.results[0].id, 1399);
        assert_eq!(r.results[0].name, "Demo Show");
    }

    #[test]
    fn test_movie_search_without_date() {
        let json = r#"{"results":[{"id":7,"title":"Demo Movie"}]}"#;
        let r: SearchResponse<MovieResult> = serde_json::from_str(json).unwrap();
        assert!(r.results[0].release_date.is_none());
    }

    #[test]
    fn test_season_deserialize() {
        let json = r#"{"episodes":[{"episode_number":1,"name":"Pilot","runtime":44},{"episode_number":2}]}"#;
        let r: SeasonResponse = serde_json::from_str(json).unwrap();
        assert_eq!(r.episodes.len(), 2);
        assert_eq!(r.episodes[0].runtime, Some(44));
        assert_eq!(r.episodes[1].name, "");
    }

    #[test]
    fn test_empty_key_is_not_configured() {
        assert!(matches!(
            Tmdb::new("  ", None, "en-US"),
            Err(MetadataError::NotConfigured(_))
        ));
    }
}
