//! Per-disc orchestration: identify what a disc is, work out which episodes
//! it holds, and record the result once the disc has been ripped.
//!
//! ```text
//! identify ──► plan ──► (rip, organise) ──► finalize
//!    │           │                             │
//!    │           ├─ SeriesState::compute_next_disc_info
//!    │           ├─ Confirmer (anomalies, per-track choices)
//!    │           └─ PatternLearner::suggest_episode
//!    └─ manual-identification cache, MetadataProvider, Confirmer
//! ```
//!
//! A season mismatch always goes through the confirmer. Persistence errors
//! surface as `DbError` so the caller can leave the disc for the next poll;
//! learning and lookup failures are logged and ignored.

use chrono::Utc;

use crate::confirm::{
    Anomaly, Confirmer, DiscDecision, DiscProposal, IdentityDecision, TrackDecision, TrackPrompt,
};
use crate::db::Result;
use crate::db::models::{
    AutoIncrementPreference, DiscRecord, MediaIdentity, MediaType, SeasonDetails, SortingStrategy,
    TrackSelectionPattern,
};
use crate::disc::classify::{classify_media, double_candidates, main_feature};
use crate::disc::label::parse_disc_label;
use crate::disc::{DiscTitle, RippedTrack, ScannedDisc, episode_count, fit_episode_count};
use crate::learning::PatternLearner;
use crate::metadata::MetadataProvider;
use crate::state::{NextDiscInfo, Resolution, SeriesStateStore};

/// Tunables, filled from the application config.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Titles shorter than this are extras and never ripped.
    pub min_title_secs: u64,
    /// Duration ratio over the disc median that flags a double.
    pub double_length_ratio: f64,
    /// Metadata matches at or above this are taken without asking.
    pub min_match_confidence: f64,
    /// Sorting strategy given to newly created series.
    pub default_sorting: SortingStrategy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            min_title_secs: 10 * 60,
            double_length_ratio: 1.8,
            min_match_confidence: 0.85,
            default_sorting: SortingStrategy::TrackOrder,
        }
    }
}

/// Outcome of planning a disc.
#[derive(Debug, Clone, PartialEq)]
pub enum Planned {
    Ready(DiscPlan),
    Skipped(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiscPlan {
    pub disc_label: String,
    pub identity: MediaIdentity,
    pub kind: PlanKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlanKind {
    Movie { feature: DiscTitle },
    Series(SeriesPlan),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeriesPlan {
    /// Title of the series state this disc belongs to.
    pub series: String,
    pub record: DiscRecord,
    pub tracks: Vec<RippedTrack>,
    pub strategy: SortingStrategy,
    pub was_auto_increment: bool,
    pub anomalies: Vec<Anomaly>,
}

impl SeriesPlan {
    /// Episodes assigned to the track at `position`.
    pub fn episodes_for(&self, position: u32) -> &[u32] {
        self.record
            .track_to_episode_mapping
            .get(&position)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

impl DiscPlan {
    /// Titles to rip, in track order.
    pub fn titles(&self) -> Vec<DiscTitle> {
        match &self.kind {
            PlanKind::Movie { feature } => vec![feature.clone()],
            PlanKind::Series(s) => s.tracks.iter().map(|t| t.title.clone()).collect(),
        }
    }
}

pub struct ContinuityEngine {
    store: SeriesStateStore,
    learner: PatternLearner,
    settings: EngineSettings,
}

impl ContinuityEngine {
    pub fn new(store: SeriesStateStore, settings: EngineSettings) -> Self {
        Self {
            store,
            learner: PatternLearner::default(),
            settings,
        }
    }

    pub fn store(&self) -> &SeriesStateStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut SeriesStateStore {
        &mut self.store
    }

    pub fn learner(&self) -> &PatternLearner {
        &self.learner
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Work out what a disc is. Cached manual identifications win, then a
    /// confident metadata match, then the user. `None` means skip the disc.
    pub fn identify(
        &self,
        disc: &ScannedDisc,
        metadata: &dyn MetadataProvider,
        confirmer: &mut dyn Confirmer,
    ) -> Option<MediaIdentity> {
        match self.store.manual_identification(&disc.label) {
            Ok(Some(m)) => {
                log::info!("'{}' identified as {} (cached)", disc.label, m.identity.display_name());
                return Some(m.identity);
            }
            Ok(None) => {}
            Err(e) => log::warn!("Manual identification lookup failed for '{}': {e}", disc.label),
        }

        let parsed = parse_disc_label(&disc.label);
        let kind = classify_media(&parsed, &disc.titles);
        log::debug!(
            "'{}' parsed as '{}' S{} D{} ({})",
            disc.label,
            parsed.series_name,
            parsed.season,
            parsed.disc_number,
            kind.label()
        );

        let candidates = match metadata.search(&parsed.series_name, kind) {
            Ok(c) => c,
            Err(e) => {
                log::warn!("Metadata search for '{}' failed: {e}", parsed.series_name);
                Vec::new()
            }
        };

        if let Some(best) = candidates.first() {
            if best.match_confidence >= self.settings.min_match_confidence {
                log::info!(
                    "'{}' identified as {} ({:.0}% match)",
                    disc.label,
                    best.display_name(),
                    best.match_confidence * 100.0
                );
                return Some(best.clone());
            }
        }

        match confirmer.identify(&disc.label, &candidates) {
            IdentityDecision::Use(identity) => {
                if let Err(e) = self.store.save_manual_identification(&disc.label, &identity) {
                    log::warn!("Could not cache identification for '{}': {e}", disc.label);
                }
                Some(identity)
            }
            IdentityDecision::Skip => {
                log::info!("'{}' skipped at identification", disc.label);
                None
            }
        }
    }

    /// Decide what to rip from a disc and which episodes it holds.
    pub fn plan(
        &mut self,
        disc: &ScannedDisc,
        identity: &MediaIdentity,
        metadata: &dyn MetadataProvider,
        confirmer: &mut dyn Confirmer,
    ) -> Result<Planned> {
        match identity.media_type {
            MediaType::Movie => Ok(self.plan_movie(disc, identity)),
            MediaType::Series => self.plan_series(disc, identity, metadata, confirmer),
            MediaType::Unknown => match confirmer.choose_media_type(&disc.label, &disc.titles) {
                Some(kind @ (MediaType::Movie | MediaType::Series)) => {
                    let identity = MediaIdentity {
                        media_type: kind,
                        ..identity.clone()
                    };
                    self.plan(disc, &identity, metadata, confirmer)
                }
                Some(MediaType::Unknown) | None => Ok(Planned::Skipped(format!(
                    "media type of '{}' not chosen",
                    disc.label
                ))),
            },
        }
    }

    fn plan_movie(&self, disc: &ScannedDisc, identity: &MediaIdentity) -> Planned {
        let titles = disc.candidate_titles(self.settings.min_title_secs);
        match main_feature(&titles) {
            Some(i) => {
                let feature = titles[i].clone();
                log::info!(
                    "{}: main feature is title {} ({:.1} min)",
                    identity.display_name(),
                    feature.index,
                    feature.duration_min()
                );
                Planned::Ready(DiscPlan {
                    disc_label: disc.label.clone(),
                    identity: identity.clone(),
                    kind: PlanKind::Movie { feature },
                })
            }
            None => Planned::Skipped(format!("no feature-length title on '{}'", disc.label)),
        }
    }

    fn plan_series(
        &mut self,
        disc: &ScannedDisc,
        identity: &MediaIdentity,
        metadata: &dyn MetadataProvider,
        confirmer: &mut dyn Confirmer,
    ) -> Result<Planned> {
        let titles = disc.candidate_titles(self.settings.min_title_secs);
        if titles.is_empty() {
            return Ok(Planned::Skipped(format!(
                "no episode-length titles on '{}'",
                disc.label
            )));
        }

        self.ensure_series(identity)?;
        let Some(state) = self.store.get_existing(&identity.title) else {
            return Ok(Planned::Skipped(format!("no state for '{}'", identity.title)));
        };
        let series = state.title.clone();
        let strategy = state.sorting_strategy;
        let use_auto_increment = state.auto_increment
            && state.auto_increment_preference == AutoIncrementPreference::Approved;

        let mut tracks: Vec<RippedTrack> = titles
            .iter()
            .enumerate()
            .map(|(pos, t)| RippedTrack {
                title: t.clone(),
                position: pos as u32,
                is_double: false,
            })
            .collect();

        let doubles = double_candidates(&titles, self.settings.double_length_ratio);
        if !doubles.is_empty() {
            for pos in confirmer.confirm_doubles(&titles, &doubles) {
                if let Some(t) = tracks.get_mut(pos as usize) {
                    t.is_double = true;
                }
            }
        }

        let parsed = parse_disc_label(&disc.label);
        let NextDiscInfo {
            mut record,
            resolution,
            mismatch,
            repeated_shape,
            previous_episode_count,
        } = state.compute_next_disc_info(
            &disc.label,
            tracks.len() as u32,
            Some(&parsed),
            use_auto_increment,
            Some(&tracks),
        );

        let mut details = season_details(metadata, identity, record.season);

        let mut anomalies = Vec::new();
        if let Some(m) = mismatch {
            anomalies.push(Anomaly::SeasonMismatch {
                parsed_season: m.parsed_season,
                stored_season: m.stored_season,
            });
        }
        if let Some(occurrences) = repeated_shape {
            anomalies.push(Anomaly::RepeatedShape { occurrences });
        }
        if !doubles.is_empty() {
            anomalies.push(Anomaly::DoubleCandidates(doubles));
        }
        if let Some(previous) = previous_episode_count {
            anomalies.push(Anomaly::EpisodeCountChanged {
                previous,
                current: record.episode_count,
            });
        }
        if let Some(len) = season_length(details.as_ref()) {
            if record.last_episode() > len {
                anomalies.push(Anomaly::SeasonOverflow {
                    last_episode: record.last_episode(),
                    season_length: len,
                });
            }
        }

        let mut was_auto_increment = matches!(resolution, Resolution::AutoIncrement { .. });
        if !anomalies.is_empty() || !use_auto_increment {
            let proposal = DiscProposal {
                series: series.clone(),
                disc_name: disc.label.clone(),
                season: record.season,
                starting_episode: record.starting_episode,
                episode_count: record.episode_count,
                track_count: record.track_count,
                anomalies: anomalies.clone(),
            };
            match confirmer.confirm_disc(&proposal) {
                DiscDecision::Accept => {}
                DiscDecision::Override {
                    season,
                    starting_episode,
                    episode_count,
                } => {
                    log::info!(
                        "{series}: '{}' overridden to S{season:02}E{starting_episode:02} ({episode_count} episodes)",
                        disc.label
                    );
                    let fitted = fit_episode_count(&mut tracks, episode_count);
                    if fitted != episode_count {
                        log::warn!(
                            "{series}: {} track(s) can't hold {episode_count} episodes, using {fitted}",
                            tracks.len()
                        );
                    }
                    let spans: Vec<u32> = tracks.iter().map(RippedTrack::episode_span).collect();
                    if season != record.season {
                        details = season_details(metadata, identity, season);
                    }
                    record.season = season;
                    record.starting_episode = starting_episode;
                    record.episode_count = fitted;
                    record.track_to_episode_mapping =
                        DiscRecord::sequential_mapping(starting_episode, &spans);
                    was_auto_increment = false;
                }
                DiscDecision::Skip => {
                    return Ok(Planned::Skipped(format!("'{}' skipped by user", disc.label)));
                }
            }
        }

        match strategy {
            SortingStrategy::TrackOrder => {}
            SortingStrategy::UserConfirmed => {
                self.confirm_tracks(&series, &mut record, &mut tracks, details.as_ref(), confirmer);
            }
        }

        log::info!(
            "{series}: '{}' → S{:02}E{:02} ({} tracks, {} episodes, {:?})",
            disc.label,
            record.season,
            record.starting_episode,
            record.track_count,
            record.episode_count,
            resolution
        );

        Ok(Planned::Ready(DiscPlan {
            disc_label: disc.label.clone(),
            identity: identity.clone(),
            kind: PlanKind::Series(SeriesPlan {
                series,
                record,
                tracks,
                strategy,
                was_auto_increment,
                anomalies,
            }),
        }))
    }

    /// Create the series state on first sight and attach the identity.
    fn ensure_series(&mut self, identity: &MediaIdentity) -> Result<()> {
        let is_new = self.store.get_existing(&identity.title).is_none();
        let state = self.store.get_or_create(&identity.title)?;
        if !is_new && state.identity.is_some() {
            return Ok(());
        }
        let default_sorting = self.settings.default_sorting;
        self.store.update_with(&identity.title, |s| {
            if is_new {
                s.sorting_strategy = default_sorting;
            }
            s.identity = Some(identity.clone());
        })
    }

    /// Ask the user for every track, offering learned suggestions, and
    /// record each answer on the disc.
    fn confirm_tracks(
        &self,
        series: &str,
        record: &mut DiscRecord,
        tracks: &mut [RippedTrack],
        details: Option<&SeasonDetails>,
        confirmer: &mut dyn Confirmer,
    ) {
        let season = record.season;
        let mut next_fallback = record.starting_episode;

        for track in tracks.iter_mut() {
            let suggestion = self.learner.suggest_episode(
                &self.store,
                series,
                season,
                &record.disc_name,
                track.position,
                next_fallback,
            );
            let prompt = TrackPrompt {
                series: series.to_string(),
                season,
                position: track.position,
                title: track.title.clone(),
                suggestion,
                episode_title: details
                    .and_then(|d| d.episode_title(suggestion.episode))
                    .map(String::from),
            };
            let TrackDecision { episode, is_double } = confirmer.confirm_track(&prompt);

            track.is_double = is_double;
            next_fallback = episode.saturating_add(track.episode_span());
            let episodes: Vec<u32> = (episode..next_fallback).collect();
            record.track_to_episode_mapping.insert(track.position, episodes);

            self.learner.record_selection(
                SortingStrategy::UserConfirmed,
                record,
                TrackSelectionPattern {
                    track_id: track.title.index,
                    track_name: track.title.name.clone(),
                    track_order_position: track.position,
                    suggested_episode: suggestion.episode,
                    selected_episode: episode,
                    was_accepted: suggestion.episode == episode,
                    selection_date: Utc::now(),
                    selection_reason: if suggestion.is_learned() {
                        "learned".to_string()
                    } else {
                        "sequential".to_string()
                    },
                },
            );
        }

        record.episode_count = episode_count(tracks);
        if let Some(first) = record
            .track_to_episode_mapping
            .values()
            .flatten()
            .min()
            .copied()
        {
            record.starting_episode = first;
        }
    }

    /// Record a ripped disc: advance the series cursor, learn from the
    /// user's choices and, the first time round, ask about auto-increment.
    pub fn finalize(&mut self, plan: &DiscPlan, confirmer: &mut dyn Confirmer) -> Result<()> {
        let s = match &plan.kind {
            PlanKind::Movie { .. } => {
                log::info!("{}: movie done", plan.identity.display_name());
                return Ok(());
            }
            PlanKind::Series(s) => s,
        };

        self.store.apply_update(
            &s.series,
            s.record.clone(),
            s.record.episode_count,
            Some(&s.tracks),
            s.was_auto_increment,
        )?;

        self.learner.analyze_and_update(
            &mut self.store,
            &s.series,
            s.record.season,
            &s.record.disc_name,
            &s.record.user_selections,
        );

        let unset = self
            .store
            .get_existing(&s.series)
            .is_some_and(|st| st.auto_increment_preference == AutoIncrementPreference::Unset);
        if unset {
            let approved = confirmer.approve_auto_increment(&s.series);
            let result = self.store.update_with(&s.series, |st| {
                st.auto_increment = approved;
                st.auto_increment_preference = if approved {
                    AutoIncrementPreference::Approved
                } else {
                    AutoIncrementPreference::Declined
                };
            });
            if let Err(e) = result {
                log::warn!("{}: could not save auto-increment preference: {e}", s.series);
            }
        }

        if let Some(state) = self.store.get_existing(&s.series) {
            log::info!(
                "{}: next disc S{:02}E{:02} (disc {})",
                state.title,
                state.current_season,
                state.next_episode,
                state.next_disc_number
            );
        }
        Ok(())
    }
}

fn season_details(
    metadata: &dyn MetadataProvider,
    identity: &MediaIdentity,
    season: u32,
) -> Option<SeasonDetails> {
    let id = identity.external_id?;
    match metadata.season(id, season) {
        Ok(d) => d,
        Err(e) => {
            log::warn!("Season {season} of {} unavailable: {e}", identity.display_name());
            None
        }
    }
}

fn season_length(details: Option<&SeasonDetails>) -> Option<u32> {
    details
        .map(|d| d.episodes.iter().map(|e| e.number).max().unwrap_or(0))
        .filter(|&n| n > 0)
}
