//! Series continuity state: the per-series episode cursor, processed-disc
//! history and known disc shapes, plus the manual-identification cache.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::Utc;

use crate::db::models::{
    DiscRecord, DiscShapePattern, ManualIdentification, MediaIdentity, SeriesState,
};
use crate::db::{Database, DbError, Result};
use crate::disc::label::{ParsedDiscInfo, disc_name_pattern, normalize_title};
use crate::disc::RippedTrack;

/// How a proposed episode run was derived, strongest signal first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Same title and track count seen before; its run is reused verbatim.
    KnownShape { sequence_number: u32 },
    /// The label names a season other than the stored one.
    ExplicitSeason,
    /// Disc-number delta × per-disc episode count past the cursor.
    AutoIncrement { per_disc: u32, disc_delta: i64 },
    /// Start at the stored cursor.
    Sequential,
}

/// The label's season disagrees with the stored season.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeasonMismatch {
    pub parsed_season: u32,
    pub stored_season: u32,
}

/// Proposal for the next disc of a series.
#[derive(Debug, Clone, PartialEq)]
pub struct NextDiscInfo {
    pub record: DiscRecord,
    pub resolution: Resolution,
    pub mismatch: Option<SeasonMismatch>,
    /// Number of earlier occurrences of this disc shape.
    pub repeated_shape: Option<u32>,
    /// Episode count the known shape recorded, when this disc's tracks now
    /// add up to something else.
    pub previous_episode_count: Option<u32>,
}

impl SeriesState {
    /// Propose season, starting episode and episode count for a disc.
    ///
    /// Known disc shapes win over explicit label markers, which win over
    /// auto-increment arithmetic. A season mismatch is reported, never
    /// resolved here.
    pub fn compute_next_disc_info(
        &self,
        disc_name: &str,
        track_count: u32,
        parsed: Option<&ParsedDiscInfo>,
        use_auto_increment: bool,
        ripped_tracks: Option<&[RippedTrack]>,
    ) -> NextDiscInfo {
        let spans = track_spans(track_count, ripped_tracks);
        let counted_episodes: u32 = spans.iter().sum();

        let explicit_season = parsed.filter(|p| p.explicit_season).map(|p| p.season);
        let explicit_disc = parsed.filter(|p| p.explicit_disc).map(|p| p.disc_number);

        let mismatch = explicit_season
            .filter(|&s| s != self.current_season)
            .map(|parsed_season| SeasonMismatch {
                parsed_season,
                stored_season: self.current_season,
            });

        // 1. Identical disc shape seen before
        let occurrences = self
            .known_disc_patterns
            .iter()
            .filter(|p| p.matches(disc_name, track_count))
            .count() as u32;
        if let Some(shape) = self
            .known_disc_patterns
            .iter()
            .filter(|p| p.matches(disc_name, track_count))
            .max_by_key(|p| p.sequence_number)
        {
            let disc_number = explicit_disc
                .or_else(|| {
                    self.processed_discs
                        .iter()
                        .rev()
                        .find(|d| d.disc_name.eq_ignore_ascii_case(disc_name))
                        .map(|d| d.disc_number)
                })
                .unwrap_or(self.next_disc_number);
            let record = new_record(
                disc_name,
                shape.assigned_season,
                disc_number,
                shape.starting_episode,
                track_count,
                counted_episodes,
                &spans,
            );
            return NextDiscInfo {
                record,
                resolution: Resolution::KnownShape {
                    sequence_number: shape.sequence_number,
                },
                mismatch,
                repeated_shape: Some(occurrences),
                previous_episode_count: Some(shape.episode_count)
                    .filter(|&n| n != counted_episodes),
            };
        }

        let disc_number = explicit_disc.unwrap_or(self.next_disc_number);

        // 2. Label names a different season: propose it, flag it
        if let Some(m) = mismatch {
            let start = self
                .discs_in_season(m.parsed_season)
                .map(|d| d.last_episode().saturating_add(1))
                .max()
                .unwrap_or(1);
            let record = new_record(
                disc_name,
                m.parsed_season,
                disc_number,
                start,
                track_count,
                counted_episodes,
                &spans,
            );
            return NextDiscInfo {
                record,
                resolution: Resolution::ExplicitSeason,
                mismatch,
                repeated_shape: None,
                previous_episode_count: None,
            };
        }

        // 3. Cursor, optionally advanced by the disc-number delta
        let mut start = self.next_episode.max(1);
        let mut resolution = Resolution::Sequential;
        if use_auto_increment {
            let baseline = self
                .discs_in_season(self.current_season)
                .last()
                .map(|d| d.episode_count)
                .filter(|&n| n > 0);
            if let (Some(disc), Some(per_disc)) = (explicit_disc, baseline) {
                let disc_delta = disc as i64 - self.next_disc_number as i64;
                if disc_delta != 0 {
                    start = (self.next_episode as i64 + disc_delta * per_disc as i64)
                        .clamp(1, u32::MAX as i64) as u32;
                    resolution = Resolution::AutoIncrement {
                        per_disc,
                        disc_delta,
                    };
                }
            }
        }

        let record = new_record(
            disc_name,
            self.current_season,
            disc_number,
            start,
            track_count,
            counted_episodes,
            &spans,
        );
        NextDiscInfo {
            record,
            resolution,
            mismatch: None,
            repeated_shape: None,
            previous_episode_count: None,
        }
    }

    /// Record a finished disc: add it to the history (replacing an earlier
    /// rip of the same run), advance the cursor, refresh the season totals
    /// and remember the disc shape.
    ///
    /// `(current_season, next_episode)` only moves forward: a disc for a later
    /// season moves the season on, a disc for an earlier season leaves the
    /// cursor where it is.
    pub fn apply_update(
        &mut self,
        record: DiscRecord,
        actual_episode_count: u32,
        ripped_tracks: Option<&[RippedTrack]>,
        was_auto_increment: bool,
    ) {
        let mut record = record;
        record.episode_count = actual_episode_count;
        record.processed_date = Utc::now();
        let mapped: u32 = record
            .track_to_episode_mapping
            .values()
            .map(|e| e.len() as u32)
            .sum();
        if mapped != actual_episode_count {
            if let Some(tracks) = ripped_tracks {
                let spans: Vec<u32> = tracks.iter().map(RippedTrack::episode_span).collect();
                record.track_to_episode_mapping =
                    DiscRecord::sequential_mapping(record.starting_episode, &spans);
            }
        }

        let end = record.starting_episode.saturating_add(actual_episode_count);
        let after_disc = record.disc_number.saturating_add(1);
        if record.season == self.current_season {
            let advanced = end > self.next_episode;
            self.next_episode = self.next_episode.max(end);
            if was_auto_increment {
                self.next_disc_number = self.next_disc_number.max(after_disc);
            } else if advanced {
                self.next_disc_number = self.next_disc_number.saturating_add(1).max(after_disc);
            }
        } else if record.season > self.current_season {
            self.current_season = record.season;
            self.next_episode = end.max(1);
            self.next_disc_number = after_disc;
        } else {
            log::info!(
                "{}: disc '{}' recorded for earlier season {}, cursor stays at S{:02}E{:02}",
                self.title,
                record.disc_name,
                record.season,
                self.current_season,
                self.next_episode
            );
        }

        let sequence_number = self
            .known_disc_patterns
            .iter()
            .filter(|p| p.matches(&record.disc_name, record.track_count))
            .count() as u32
            + 1;
        let shape = DiscShapePattern {
            disc_title: record.disc_name.clone(),
            track_count: record.track_count,
            sequence_number,
            assigned_season: record.season,
            starting_episode: record.starting_episode,
            episode_count: actual_episode_count,
        };
        upsert_shape(&mut self.known_disc_patterns, shape);

        let season = record.season;
        log::debug!(
            "{}: recorded '{}' as S{:02}E{:02} ({} episodes, auto-increment: {})",
            self.title,
            record.disc_name,
            season,
            record.starting_episode,
            actual_episode_count,
            was_auto_increment
        );
        match self.processed_discs.iter_mut().find(|d| d.same_run(&record)) {
            Some(earlier) => {
                log::info!("{}: '{}' re-ripped, replacing its earlier record", self.title, record.disc_name);
                *earlier = record;
            }
            None => self.processed_discs.push(record),
        }
        self.refresh_season_count(season);
        self.updated_at = Utc::now();
    }

    /// Distinct episodes recorded for a season. Re-ripped discs don't count
    /// twice.
    fn refresh_season_count(&mut self, season: u32) {
        let episodes: BTreeSet<u32> = self
            .discs_in_season(season)
            .flat_map(|d| d.starting_episode..d.starting_episode.saturating_add(d.episode_count))
            .collect();
        self.season_episode_counts.insert(season, episodes.len() as u32);
    }
}

fn track_spans(track_count: u32, ripped_tracks: Option<&[RippedTrack]>) -> Vec<u32> {
    match ripped_tracks {
        Some(tracks) if !tracks.is_empty() => {
            let mut spans = vec![1; track_count.max(tracks.len() as u32) as usize];
            for t in tracks {
                if let Some(s) = spans.get_mut(t.position as usize) {
                    *s = t.episode_span();
                }
            }
            spans
        }
        _ => vec![1; track_count as usize],
    }
}

fn new_record(
    disc_name: &str,
    season: u32,
    disc_number: u32,
    starting_episode: u32,
    track_count: u32,
    episode_count: u32,
    spans: &[u32],
) -> DiscRecord {
    DiscRecord {
        disc_name: disc_name.to_string(),
        season,
        disc_number,
        starting_episode,
        track_count,
        episode_count,
        processed_date: Utc::now(),
        track_to_episode_mapping: DiscRecord::sequential_mapping(starting_episode, spans),
        user_selections: Vec::new(),
    }
}

fn upsert_shape(patterns: &mut Vec<DiscShapePattern>, shape: DiscShapePattern) {
    match patterns.iter_mut().find(|p| {
        p.matches(&shape.disc_title, shape.track_count) && p.sequence_number == shape.sequence_number
    }) {
        Some(existing) => *existing = shape,
        None => patterns.push(shape),
    }
}

/// In-memory state table backed by the database. Every mutation is
/// persisted before the in-memory copy changes, so a failed write leaves
/// both sides as they were.
pub struct SeriesStateStore {
    db: Database,
    table: HashMap<String, SeriesState>,
    quarantined: HashSet<String>,
}

impl SeriesStateStore {
    /// Load every series document. Unreadable documents are quarantined:
    /// they stay on disk untouched and their series can't be written.
    pub fn open(db: Database) -> Result<Self> {
        let mut table = HashMap::new();
        let mut quarantined = HashSet::new();

        for key in db.series_keys()? {
            match db.load_series(&key) {
                Ok(Some(state)) => {
                    table.insert(key, state);
                }
                Ok(None) => {}
                Err(DbError::Corrupt { key, source }) => {
                    log::warn!("Series state '{key}' is unreadable ({source}); leaving it untouched");
                    quarantined.insert(key);
                }
                Err(e) => return Err(e),
            }
        }

        log::debug!("Loaded {} series ({} quarantined)", table.len(), quarantined.len());
        Ok(Self {
            db,
            table,
            quarantined,
        })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Case-insensitive lookup; creates and persists a default state when
    /// the series is new.
    pub fn get_or_create(&mut self, title: &str) -> Result<&SeriesState> {
        let key = normalize_title(title);
        if self.quarantined.contains(&key) {
            return Err(DbError::Quarantined(title.to_string()));
        }
        if !self.table.contains_key(&key) {
            let state = SeriesState::new(title.trim());
            self.db.save_series(&key, &state)?;
            log::info!("Created series state for '{}'", state.title);
            self.table.insert(key.clone(), state);
        }
        Ok(&self.table[&key])
    }

    /// Lookup without creation.
    pub fn get_existing(&self, title: &str) -> Option<&SeriesState> {
        self.table.get(&normalize_title(title))
    }

    /// Persist a full state document and adopt it as the in-memory copy.
    pub fn save(&mut self, state: &SeriesState) -> Result<()> {
        let key = normalize_title(&state.title);
        if self.quarantined.contains(&key) {
            return Err(DbError::Quarantined(state.title.clone()));
        }
        self.db.save_series(&key, state)?;
        self.table.insert(key, state.clone());
        Ok(())
    }

    /// Clone, mutate, persist, swap.
    pub fn update_with<F>(&mut self, title: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut SeriesState),
    {
        let key = normalize_title(title);
        let mut state = self
            .table
            .get(&key)
            .cloned()
            .ok_or_else(|| DbError::UnknownSeries(title.to_string()))?;
        f(&mut state);
        state.updated_at = Utc::now();
        self.db.save_series(&key, &state)?;
        self.table.insert(key, state);
        Ok(())
    }

    /// Finalize a disc for a series; see [`SeriesState::apply_update`].
    pub fn apply_update(
        &mut self,
        title: &str,
        record: DiscRecord,
        actual_episode_count: u32,
        ripped_tracks: Option<&[RippedTrack]>,
        was_auto_increment: bool,
    ) -> Result<()> {
        self.update_with(title, |state| {
            state.apply_update(record, actual_episode_count, ripped_tracks, was_auto_increment)
        })
    }

    /// Delete a series profile and everything learned for it.
    pub fn remove(&mut self, title: &str) -> Result<bool> {
        let key = normalize_title(title);
        let removed = self.db.delete_series(&key)?;
        self.table.remove(&key);
        self.quarantined.remove(&key);
        Ok(removed)
    }

    /// All loaded series, ordered by title.
    pub fn list(&self) -> Vec<&SeriesState> {
        let mut all: Vec<&SeriesState> = self.table.values().collect();
        all.sort_by(|a, b| a.title.to_lowercase().cmp(&b.title.to_lowercase()));
        all
    }

    /// Cached identity for discs whose label matches the same pattern.
    pub fn manual_identification(&self, disc_name: &str) -> Result<Option<ManualIdentification>> {
        self.db.get_manual_identification(&disc_name_pattern(disc_name))
    }

    pub fn save_manual_identification(&self, disc_name: &str, identity: &MediaIdentity) -> Result<()> {
        let pattern = disc_name_pattern(disc_name);
        log::info!("Caching identity '{}' for disc pattern '{pattern}'", identity.display_name());
        self.db.save_manual_identification(&pattern, identity)
    }
}
