//! Track → episode pattern learning for series ripped with the
//! user-confirmed sorting strategy.
//!
//! Every confirmed track is an observation for `(series, season, track
//! position)`. Observations that agree with the stored mapping push its
//! confidence toward 1.0, disagreements push it toward 0.0 and replace the
//! mapped episode. Suggestions are only surfaced once a position has enough
//! samples and the season's aggregate confidence clears the floor.
//!
//! Nothing in here fails hard: missing series, unreadable patterns and
//! persistence errors all degrade to "no suggestion" / "nothing learned".

use chrono::Utc;

use crate::db::models::{
    DiscRecord, EpisodeTrackPattern, SeriesState, SortingStrategy, TrackSelectionPattern,
    TrackToEpisodeMapping,
};
use crate::state::SeriesStateStore;

/// Aggregate confidence below which learned suggestions stay hidden.
pub const ACCEPTANCE_FLOOR: f64 = 0.7;

/// Observations needed at a position before its mapping is trusted.
pub const MIN_SAMPLES: u32 = 2;

/// Step of the moving-average nudge per observation.
pub const LEARNING_RATE: f64 = 0.25;

const INITIAL_ACCEPTED: f64 = 0.5;
const INITIAL_REJECTED: f64 = 0.4;

/// Episode proposed for a track. `confidence` is 0.0 for the fallback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Suggestion {
    pub episode: u32,
    pub confidence: f64,
}

impl Suggestion {
    pub fn fallback(episode: u32) -> Self {
        Self {
            episode,
            confidence: 0.0,
        }
    }

    pub fn is_learned(&self) -> bool {
        self.confidence > 0.0
    }
}

#[derive(Debug, Clone)]
pub struct PatternLearner {
    pub acceptance_floor: f64,
    pub min_samples: u32,
    pub learning_rate: f64,
}

impl Default for PatternLearner {
    fn default() -> Self {
        Self {
            acceptance_floor: ACCEPTANCE_FLOOR,
            min_samples: MIN_SAMPLES,
            learning_rate: LEARNING_RATE,
        }
    }
}

impl PatternLearner {
    /// Append a user decision to the disc being processed. Bookkeeping only;
    /// aggregates change in [`Self::analyze_and_update`].
    pub fn record_selection(
        &self,
        strategy: SortingStrategy,
        disc: &mut DiscRecord,
        selection: TrackSelectionPattern,
    ) {
        match strategy {
            SortingStrategy::TrackOrder => {}
            SortingStrategy::UserConfirmed => disc.user_selections.push(selection),
        }
    }

    /// Learned episode for a track position, or `(fallback, 0.0)`.
    pub fn suggest_episode(
        &self,
        store: &SeriesStateStore,
        series_title: &str,
        season: u32,
        disc_name: &str,
        track_position: u32,
        fallback_episode: u32,
    ) -> Suggestion {
        let Some(pattern) = self.usable_pattern(store, series_title, season) else {
            return Suggestion::fallback(fallback_episode);
        };

        if pattern.confidence_score < self.acceptance_floor {
            return Suggestion::fallback(fallback_episode);
        }

        match pattern.mapping(track_position) {
            Some(m) if m.sample_count >= self.min_samples => {
                log::debug!(
                    "{series_title} S{season:02} '{disc_name}' position {track_position}: learned E{:02} ({:.2})",
                    m.episode_number,
                    m.confidence
                );
                Suggestion {
                    episode: m.episode_number,
                    confidence: m.confidence,
                }
            }
            _ => Suggestion::fallback(fallback_episode),
        }
    }

    /// Fold a finished disc's selections into the season pattern and persist
    /// it. Returns whether anything was learned.
    pub fn analyze_and_update(
        &self,
        store: &mut SeriesStateStore,
        series_title: &str,
        season: u32,
        disc_name: &str,
        selections: &[TrackSelectionPattern],
    ) -> bool {
        if selections.is_empty() {
            return false;
        }
        let Some(state) = store.get_existing(series_title) else {
            log::debug!("No state for '{series_title}', skipping pattern learning");
            return false;
        };
        match state.sorting_strategy {
            SortingStrategy::TrackOrder => return false,
            SortingStrategy::UserConfirmed => {}
        }

        let mut pattern = match state.learned_pattern(season) {
            Some(p) if is_sane(p) => p.clone(),
            Some(_) => {
                log::warn!("Discarding unreadable pattern for {series_title} season {season}");
                EpisodeTrackPattern::new(&state.title, season)
            }
            None => EpisodeTrackPattern::new(&state.title, season),
        };
        self.absorb(&mut pattern, selections);

        let result = store.update_with(series_title, |s| {
            s.learned_patterns.retain(|p| p.season != season);
            s.learned_patterns.push(pattern);
        });
        match result {
            Ok(()) => {
                log::info!(
                    "Learned from {} selections on '{disc_name}' ({series_title} season {season})",
                    selections.len()
                );
                true
            }
            Err(e) => {
                log::warn!("Pattern learning skipped for '{disc_name}': {e}");
                false
            }
        }
    }

    /// Aggregate confidence of the season pattern, 0.0 when there is none.
    pub fn confidence(
        &self,
        store: &SeriesStateStore,
        series_title: &str,
        season: u32,
        _disc_name: &str,
    ) -> f64 {
        self.usable_pattern(store, series_title, season)
            .map(|p| p.confidence_score)
            .unwrap_or(0.0)
    }

    pub fn has_patterns(
        &self,
        store: &SeriesStateStore,
        series_title: &str,
        season: u32,
        _disc_name: &str,
    ) -> bool {
        self.usable_pattern(store, series_title, season)
            .is_some_and(|p| !p.track_mappings.is_empty())
    }

    /// Apply observations to a pattern in place.
    pub fn absorb(&self, pattern: &mut EpisodeTrackPattern, selections: &[TrackSelectionPattern]) {
        for sel in selections {
            let position = sel.track_order_position;
            match pattern
                .track_mappings
                .iter_mut()
                .find(|m| m.track_position == position)
            {
                Some(m) if m.episode_number == sel.selected_episode => {
                    m.confidence = (m.confidence + self.learning_rate * (1.0 - m.confidence)).min(1.0);
                    m.sample_count += 1;
                }
                Some(m) => {
                    m.confidence = (m.confidence - self.learning_rate * m.confidence).max(0.0);
                    m.episode_number = sel.selected_episode;
                    m.sample_count += 1;
                }
                None => pattern.track_mappings.push(TrackToEpisodeMapping {
                    track_position: position,
                    episode_number: sel.selected_episode,
                    confidence: if sel.was_accepted {
                        INITIAL_ACCEPTED
                    } else {
                        INITIAL_REJECTED
                    },
                    sample_count: 1,
                }),
            }
        }

        pattern.track_mappings.sort_by_key(|m| m.track_position);
        pattern.confidence_score = if pattern.track_mappings.is_empty() {
            0.0
        } else {
            pattern.track_mappings.iter().map(|m| m.confidence).sum::<f64>()
                / pattern.track_mappings.len() as f64
        };
        pattern.usage_count += 1;
        pattern.last_used = Utc::now();
    }

    fn usable_pattern<'s>(
        &self,
        store: &'s SeriesStateStore,
        series_title: &str,
        season: u32,
    ) -> Option<&'s EpisodeTrackPattern> {
        let state: &SeriesState = store.get_existing(series_title)?;
        match state.sorting_strategy {
            SortingStrategy::TrackOrder => None,
            SortingStrategy::UserConfirmed => state.learned_pattern(season).filter(|p| is_sane(p)),
        }
    }
}

fn is_sane(pattern: &EpisodeTrackPattern) -> bool {
    let valid = |c: f64| c.is_finite() && (0.0..=1.0).contains(&c);
    valid(pattern.confidence_score) && pattern.track_mappings.iter().all(|m| valid(m.confidence))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn selection(position: u32, suggested: u32, selected: u32) -> TrackSelectionPattern {
        TrackSelectionPattern {
            track_id: position,
            track_name: format!("Title {position}"),
            track_order_position: position,
            suggested_episode: suggested,
            selected_episode: selected,
            was_accepted: suggested == selected,
            selection_date: Utc::now(),
            selection_reason: String::new(),
        }
    }

    fn user_confirmed_store() -> SeriesStateStore {
        let mut store = SeriesStateStore::open(Database::open_in_memory().unwrap()).unwrap();
        store.get_or_create("Demo Show").unwrap();
        store
            .update_with("Demo Show", |s| s.sorting_strategy = SortingStrategy::UserConfirmed)
            .unwrap();
        store
    }

    #[test]
    fn test_three_acceptances_unlock_suggestion() {
        let learner = PatternLearner::default();
        let mut store = user_confirmed_store();

        for disc in ["DEMO_D1", "DEMO_D2", "DEMO_D3"] {
            let s = learner.suggest_episode(&store, "Demo Show", 1, disc, 0, 3);
            assert!(!s.is_learned());
            let sel = selection(0, s.episode, 3);
            assert!(learner.analyze_and_update(&mut store, "Demo Show", 1, disc, &[sel]));
        }

        assert!(learner.confidence(&store, "Demo Show", 1, "DEMO_D4") >= ACCEPTANCE_FLOOR);
        assert!(learner.has_patterns(&store, "Demo Show", 1, "DEMO_D4"));

        let s = learner.suggest_episode(&store, "Demo Show", 1, "DEMO_D4", 0, 99);
        assert!(s.is_learned());
        assert_eq!(s.episode, 3);
    }

    #[test]
    fn test_acceptances_converge_without_exceeding_one() {
        let learner = PatternLearner::default();
        let mut pattern = EpisodeTrackPattern::new("Demo Show", 1);
        learner.absorb(&mut pattern, &[selection(0, 3, 3)]);

        let mut last = pattern.mapping(0).unwrap().confidence;
        for _ in 0..20 {
            learner.absorb(&mut pattern, &[selection(0, 3, 3)]);
            let c = pattern.mapping(0).unwrap().confidence;
            assert!(c > last, "{c} should exceed {last}");
            assert!(c <= 1.0);
            last = c;
        }
        assert_eq!(pattern.mapping(0).unwrap().sample_count, 21);
    }

    #[test]
    fn test_rejection_lowers_confidence_and_remaps() {
        let learner = PatternLearner::default();
        let mut pattern = EpisodeTrackPattern::new("Demo Show", 1);
        for _ in 0..3 {
            learner.absorb(&mut pattern, &[selection(0, 3, 3)]);
        }
        let before = pattern.mapping(0).unwrap().confidence;
        let aggregate_before = pattern.confidence_score;

        learner.absorb(&mut pattern, &[selection(0, 3, 4)]);

        let m = pattern.mapping(0).unwrap();
        assert!(m.confidence < before);
        assert!(m.confidence >= 0.0);
        assert_eq!(m.episode_number, 4);
        assert!(pattern.confidence_score < aggregate_before);
    }

    #[test]
    fn test_single_sample_never_suggests() {
        let learner = PatternLearner::default();
        let mut store = user_confirmed_store();
        let mut pattern = EpisodeTrackPattern::new("Demo Show", 1);
        pattern.track_mappings.push(TrackToEpisodeMapping {
            track_position: 0,
            episode_number: 7,
            confidence: 1.0,
            sample_count: 1,
        });
        pattern.confidence_score = 1.0;
        store
            .update_with("Demo Show", |s| s.learned_patterns.push(pattern))
            .unwrap();

        let s = learner.suggest_episode(&store, "Demo Show", 1, "DEMO", 0, 2);
        assert_eq!(s, Suggestion::fallback(2));
    }

    #[test]
    fn test_low_aggregate_hides_suggestion() {
        let learner = PatternLearner::default();
        let mut store = user_confirmed_store();
        let mut pattern = EpisodeTrackPattern::new("Demo Show", 1);
        pattern.track_mappings.push(TrackToEpisodeMapping {
            track_position: 0,
            episode_number: 7,
            confidence: 0.6,
            sample_count: 5,
        });
        pattern.confidence_score = 0.6;
        store
            .update_with("Demo Show", |s| s.learned_patterns.push(pattern))
            .unwrap();

        assert!(!learner.suggest_episode(&store, "Demo Show", 1, "DEMO", 0, 2).is_learned());
    }

    #[test]
    fn test_track_order_series_is_a_no_op() {
        let learner = PatternLearner::default();
        let mut store = SeriesStateStore::open(Database::open_in_memory().unwrap()).unwrap();
        store.get_or_create("Demo Show").unwrap();

        assert!(!learner.analyze_and_update(&mut store, "Demo Show", 1, "DEMO", &[selection(0, 1, 1)]));
        assert_eq!(learner.confidence(&store, "Demo Show", 1, "DEMO"), 0.0);
        assert!(!learner.has_patterns(&store, "Demo Show", 1, "DEMO"));
        assert!(store.get_existing("Demo Show").unwrap().learned_patterns.is_empty());

        let mut disc = SeriesState::new("Demo Show")
            .compute_next_disc_info("DEMO", 1, None, false, None)
            .record;
        learner.record_selection(SortingStrategy::TrackOrder, &mut disc, selection(0, 1, 1));
        assert!(disc.user_selections.is_empty());
        learner.record_selection(SortingStrategy::UserConfirmed, &mut disc, selection(0, 1, 1));
        assert_eq!(disc.user_selections.len(), 1);
    }

    #[test]
    fn test_unknown_series_and_corrupt_pattern_degrade() {
        let learner = PatternLearner::default();
        let mut store = user_confirmed_store();
        assert_eq!(
            learner.suggest_episode(&store, "Nobody", 1, "X", 0, 4),
            Suggestion::fallback(4)
        );
        assert!(!learner.analyze_and_update(&mut store, "Nobody", 1, "X", &[selection(0, 1, 1)]));

        let mut pattern = EpisodeTrackPattern::new("Demo Show", 1);
        pattern.confidence_score = f64::NAN;
        store
            .update_with("Demo Show", |s| s.learned_patterns.push(pattern))
            .unwrap();
        assert_eq!(learner.confidence(&store, "Demo Show", 1, "X"), 0.0);

        // Learning replaces the unreadable pattern instead of failing
        assert!(learner.analyze_and_update(&mut store, "Demo Show", 1, "X", &[selection(0, 1, 1)]));
        assert_eq!(learner.confidence(&store, "Demo Show", 1, "X"), INITIAL_ACCEPTED);
    }

    #[test]
    fn test_persistence_failure_is_swallowed() {
        let learner = PatternLearner::default();
        let mut store = user_confirmed_store();
        store.database().conn.execute("DROP TABLE series_state", []).unwrap();
        assert!(!learner.analyze_and_update(&mut store, "Demo Show", 1, "X", &[selection(0, 1, 1)]));
        assert!(store.get_existing("Demo Show").unwrap().learned_patterns.is_empty());
    }
}
