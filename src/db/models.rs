//! Persisted records. Everything here is stored as a JSON document, so every
//! field added after the first schema carries `#[serde(default)]` and older
//! documents keep loading.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a disc holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Movie,
    Series,
    #[default]
    Unknown,
}

impl MediaType {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Movie => "movie",
            Self::Series => "series",
            Self::Unknown => "unknown",
        }
    }
}

/// How the titles of a series disc are mapped to episodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortingStrategy {
    /// Titles map to episodes in disc order.
    #[default]
    TrackOrder,
    /// Every title is confirmed by the user; confirmations feed pattern learning.
    UserConfirmed,
}

impl SortingStrategy {
    pub fn label(&self) -> &'static str {
        match self {
            Self::TrackOrder => "track-order",
            Self::UserConfirmed => "user-confirmed",
        }
    }
}

/// Whether the user has been asked about auto-increment for a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AutoIncrementPreference {
    #[default]
    Unset,
    Approved,
    Declined,
}

/// Confirmed identity of a movie or series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaIdentity {
    pub title: String,
    #[serde(default)]
    pub year: Option<i32>,
    /// Id at the metadata service (TMDB), `None` for manual entries.
    #[serde(default)]
    pub external_id: Option<u64>,
    pub media_type: MediaType,
    /// How well the identity matched the search, 0.0–1.0.
    #[serde(default)]
    pub match_confidence: f64,
}

impl MediaIdentity {
    /// "Title (Year)" or just "Title".
    pub fn display_name(&self) -> String {
        match self.year {
            Some(y) => format!("{} ({y})", self.title),
            None => self.title.clone(),
        }
    }
}

/// Cached manual identification for a disc-name pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualIdentification {
    pub pattern: String,
    pub identity: MediaIdentity,
    pub created_at: DateTime<Utc>,
}

/// One user decision about one track, append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackSelectionPattern {
    pub track_id: u32,
    pub track_name: String,
    pub track_order_position: u32,
    pub suggested_episode: u32,
    pub selected_episode: u32,
    pub was_accepted: bool,
    pub selection_date: DateTime<Utc>,
    #[serde(default)]
    pub selection_reason: String,
}

/// A processed disc. Owned by its series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscRecord {
    pub disc_name: String,
    pub season: u32,
    pub disc_number: u32,
    pub starting_episode: u32,
    /// Physical rip units.
    pub track_count: u32,
    /// Logical episodes; exceeds `track_count` when tracks hold doubles.
    pub episode_count: u32,
    pub processed_date: DateTime<Utc>,
    /// Track position → episode numbers (two entries for a double).
    #[serde(default)]
    pub track_to_episode_mapping: BTreeMap<u32, Vec<u32>>,
    #[serde(default)]
    pub user_selections: Vec<TrackSelectionPattern>,
}

impl DiscRecord {
    /// Last episode number covered by this disc.
    pub fn last_episode(&self) -> u32 {
        self.starting_episode
            .saturating_add(self.episode_count.saturating_sub(1))
    }

    /// Same physical disc recorded for the same run of episodes.
    pub fn same_run(&self, other: &DiscRecord) -> bool {
        self.season == other.season
            && self.disc_number == other.disc_number
            && self.starting_episode == other.starting_episode
            && self.disc_name.eq_ignore_ascii_case(&other.disc_name)
    }

    /// Sequential mapping: each track takes the next episode, doubles take two.
    pub fn sequential_mapping(starting_episode: u32, spans: &[u32]) -> BTreeMap<u32, Vec<u32>> {
        let mut mapping = BTreeMap::new();
        let mut episode = starting_episode;
        for (pos, span) in spans.iter().enumerate() {
            let next = episode.saturating_add(*span);
            let episodes: Vec<u32> = (episode..next).collect();
            episode = next;
            mapping.insert(pos as u32, episodes);
        }
        mapping
    }
}

/// "The Nth time a disc with this title and track count showed up, it was
/// season/episode X".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscShapePattern {
    pub disc_title: String,
    pub track_count: u32,
    pub sequence_number: u32,
    pub assigned_season: u32,
    pub starting_episode: u32,
    pub episode_count: u32,
}

impl DiscShapePattern {
    pub fn matches(&self, disc_title: &str, track_count: u32) -> bool {
        self.track_count == track_count && self.disc_title.eq_ignore_ascii_case(disc_title)
    }
}

/// Learned position → episode mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackToEpisodeMapping {
    /// Zero-based.
    pub track_position: u32,
    pub episode_number: u32,
    pub confidence: f64,
    #[serde(default)]
    pub sample_count: u32,
}

/// Learned mappings for one series season.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeTrackPattern {
    pub series_title: String,
    pub season: u32,
    #[serde(default)]
    pub track_mappings: Vec<TrackToEpisodeMapping>,
    #[serde(default)]
    pub usage_count: u32,
    #[serde(default)]
    pub confidence_score: f64,
    pub last_used: DateTime<Utc>,
    pub created_date: DateTime<Utc>,
}

impl EpisodeTrackPattern {
    pub fn new(series_title: &str, season: u32) -> Self {
        let now = Utc::now();
        Self {
            series_title: series_title.to_string(),
            season,
            track_mappings: Vec::new(),
            usage_count: 0,
            confidence_score: 0.0,
            last_used: now,
            created_date: now,
        }
    }

    pub fn mapping(&self, position: u32) -> Option<&TrackToEpisodeMapping> {
        self.track_mappings.iter().find(|m| m.track_position == position)
    }
}

/// Continuity state for one series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesState {
    pub title: String,
    pub current_season: u32,
    pub next_episode: u32,
    pub next_disc_number: u32,
    #[serde(default)]
    pub processed_discs: Vec<DiscRecord>,
    #[serde(default)]
    pub auto_increment: bool,
    #[serde(default)]
    pub auto_increment_preference: AutoIncrementPreference,
    #[serde(default)]
    pub season_episode_counts: BTreeMap<u32, u32>,
    #[serde(default)]
    pub known_disc_patterns: Vec<DiscShapePattern>,
    #[serde(default)]
    pub learned_patterns: Vec<EpisodeTrackPattern>,
    #[serde(default)]
    pub sorting_strategy: SortingStrategy,
    #[serde(default)]
    pub identity: Option<MediaIdentity>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SeriesState {
    pub fn new(title: &str) -> Self {
        let now = Utc::now();
        Self {
            title: title.to_string(),
            current_season: 1,
            next_episode: 1,
            next_disc_number: 1,
            processed_discs: Vec::new(),
            auto_increment: false,
            auto_increment_preference: AutoIncrementPreference::Unset,
            season_episode_counts: BTreeMap::new(),
            known_disc_patterns: Vec::new(),
            learned_patterns: Vec::new(),
            sorting_strategy: SortingStrategy::default(),
            identity: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn learned_pattern(&self, season: u32) -> Option<&EpisodeTrackPattern> {
        self.learned_patterns.iter().find(|p| p.season == season)
    }

    /// Processed discs of one season, in processing order.
    pub fn discs_in_season(&self, season: u32) -> impl Iterator<Item = &DiscRecord> {
        self.processed_discs.iter().filter(move |d| d.season == season)
    }
}

/// Episode list of one season, cached from the metadata service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeasonDetails {
    pub external_id: u64,
    pub season: u32,
    pub episodes: Vec<EpisodeInfo>,
}

impl SeasonDetails {
    pub fn episode_title(&self, number: u32) -> Option<&str> {
        self.episodes
            .iter()
            .find(|e| e.number == number)
            .map(|e| e.title.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeInfo {
    pub number: u32,
    pub title: String,
    #[serde(default)]
    pub runtime_min: Option<u32>,
}

/// Store statistics.
#[derive(Debug)]
pub struct LibraryStats {
    pub series: i64,
    pub discs: i64,
    pub episodes: i64,
    pub manual_identifications: i64,
    pub learned_patterns: i64,
}
