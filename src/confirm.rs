//! Human-in-the-loop confirmation.
//!
//! The continuity engine calls a [`Confirmer`] whenever it can't decide on
//! its own. Calls block until the user answers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dialoguer::console::Term;
use dialoguer::{Confirm, Input, MultiSelect, Select};

use crate::db::models::{MediaIdentity, MediaType};
use crate::disc::DiscTitle;
use crate::learning::Suggestion;

/// Something about a proposed disc that needs a human to look at it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anomaly {
    /// The label names a different season than the series is on.
    SeasonMismatch { parsed_season: u32, stored_season: u32 },
    /// A disc with this exact title and track count was processed before.
    RepeatedShape { occurrences: u32 },
    /// Titles (by position) roughly twice as long as the others.
    DoubleCandidates(Vec<u32>),
    /// The proposed run ends past the season's known episode count.
    SeasonOverflow { last_episode: u32, season_length: u32 },
    /// A disc seen before covered a different number of episodes last time.
    EpisodeCountChanged { previous: u32, current: u32 },
}

impl std::fmt::Display for Anomaly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SeasonMismatch {
                parsed_season,
                stored_season,
            } => write!(
                f,
                "disc label says season {parsed_season}, series is on season {stored_season}"
            ),
            Self::RepeatedShape { occurrences } => {
                write!(f, "identical disc processed {occurrences} time(s) before")
            }
            Self::DoubleCandidates(positions) => {
                let list: Vec<String> = positions.iter().map(|p| (p + 1).to_string()).collect();
                write!(f, "possible double-length episodes at track(s) {}", list.join(", "))
            }
            Self::SeasonOverflow {
                last_episode,
                season_length,
            } => write!(
                f,
                "run ends at episode {last_episode} but the season has {season_length}"
            ),
            Self::EpisodeCountChanged { previous, current } => write!(
                f,
                "this disc held {previous} episode(s) last time, {current} now"
            ),
        }
    }
}

/// Proposed episode run for a series disc.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscProposal {
    pub series: String,
    pub disc_name: String,
    pub season: u32,
    pub starting_episode: u32,
    pub episode_count: u32,
    pub track_count: u32,
    pub anomalies: Vec<Anomaly>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscDecision {
    Accept,
    Override {
        season: u32,
        starting_episode: u32,
        episode_count: u32,
    },
    Skip,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IdentityDecision {
    Use(MediaIdentity),
    Skip,
}

/// One track of a user-confirmed disc.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackPrompt {
    pub series: String,
    pub season: u32,
    pub position: u32,
    pub title: DiscTitle,
    pub suggestion: Suggestion,
    pub episode_title: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackDecision {
    pub episode: u32,
    pub is_double: bool,
}

pub trait Confirmer {
    /// Pick the identity of a disc from search candidates (possibly none).
    fn identify(&mut self, disc_label: &str, candidates: &[MediaIdentity]) -> IdentityDecision;

    /// Movie or series? `None` skips the disc.
    fn choose_media_type(&mut self, disc_label: &str, titles: &[DiscTitle]) -> Option<MediaType>;

    fn confirm_disc(&mut self, proposal: &DiscProposal) -> DiscDecision;

    /// Returns the positions that really are doubles.
    fn confirm_doubles(&mut self, titles: &[DiscTitle], candidates: &[u32]) -> Vec<u32>;

    fn confirm_track(&mut self, prompt: &TrackPrompt) -> TrackDecision;

    /// Asked once per series.
    fn approve_auto_increment(&mut self, series: &str) -> bool;
}

/// Highest season or episode number accepted at a prompt.
pub const MAX_EPISODE: u32 = 9999;

/// Prompts on the terminal. Esc or `q` on a menu requests shutdown and
/// skips the current disc.
pub struct ConsoleConfirmer {
    term: Term,
    shutdown: Arc<AtomicBool>,
}

impl ConsoleConfirmer {
    pub fn new(shutdown: Arc<AtomicBool>) -> Self {
        Self {
            term: Term::stderr(),
            shutdown,
        }
    }

    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// `None` when the user backed out or the terminal is gone; both stop
    /// the watcher after the current disc.
    fn answered<T>(&self, result: dialoguer::Result<Option<T>>) -> Option<T> {
        match result {
            Ok(Some(v)) => Some(v),
            Ok(None) => {
                log::info!("Shutdown requested");
                self.shutdown.store(true, Ordering::SeqCst);
                None
            }
            Err(e) => {
                log::warn!("Confirmation prompt failed ({e}); requesting shutdown");
                self.shutdown.store(true, Ordering::SeqCst);
                None
            }
        }
    }

    fn say(&self, text: &str) {
        self.term.write_line(text).ok();
    }

    fn number(&self, prompt: &str, default: u32, min: u32, max: u32) -> Option<u32> {
        let result = Input::<u32>::new()
            .with_prompt(prompt)
            .default(default.clamp(min, max))
            .validate_with(|n: &u32| check_range(*n, min, max))
            .interact_text_on(&self.term);
        self.answered(result.map(Some))
    }

    fn manual_identity(&self) -> Option<MediaIdentity> {
        let title: String = self.answered(
            Input::new()
                .with_prompt("Title")
                .interact_text_on(&self.term)
                .map(Some),
        )?;
        let year: String = self.answered(
            Input::new()
                .with_prompt("Year (blank if unknown)")
                .allow_empty(true)
                .interact_text_on(&self.term)
                .map(Some),
        )?;
        let kind = self.answered(
            Select::new()
                .with_prompt("Kind")
                .items(&["Series", "Movie"])
                .default(0)
                .interact_on_opt(&self.term),
        )?;
        Some(MediaIdentity {
            title: title.trim().to_string(),
            year: year.trim().parse().ok(),
            external_id: None,
            media_type: if kind == 1 {
                MediaType::Movie
            } else {
                MediaType::Series
            },
            match_confidence: 1.0,
        })
    }
}

impl Confirmer for ConsoleConfirmer {
    fn identify(&mut self, disc_label: &str, candidates: &[MediaIdentity]) -> IdentityDecision {
        if self.stopping() {
            return IdentityDecision::Skip;
        }
        let items = identity_items(candidates);
        let choice = self.answered(
            Select::new()
                .with_prompt(format!("Identify disc '{disc_label}'"))
                .items(&items)
                .default(0)
                .interact_on_opt(&self.term),
        );
        match choice {
            Some(i) if i < candidates.len() => IdentityDecision::Use(candidates[i].clone()),
            Some(i) if i == candidates.len() => match self.manual_identity() {
                Some(identity) => IdentityDecision::Use(identity),
                None => IdentityDecision::Skip,
            },
            _ => IdentityDecision::Skip,
        }
    }

    fn choose_media_type(&mut self, disc_label: &str, titles: &[DiscTitle]) -> Option<MediaType> {
        if self.stopping() {
            return None;
        }
        self.say(&format!("Disc '{disc_label}' has {} title(s):", titles.len()));
        for t in titles {
            self.say(&format!("  #{:<3} {:>6.1} min  {}", t.index, t.duration_min(), t.name));
        }
        let choice = self.answered(
            Select::new()
                .with_prompt("What is on this disc?")
                .items(&["Series", "Movie", "Skip disc"])
                .default(0)
                .interact_on_opt(&self.term),
        )?;
        match choice {
            0 => Some(MediaType::Series),
            1 => Some(MediaType::Movie),
            _ => None,
        }
    }

    fn confirm_disc(&mut self, proposal: &DiscProposal) -> DiscDecision {
        if self.stopping() {
            return DiscDecision::Skip;
        }
        self.say(&proposal_summary(proposal));
        for a in &proposal.anomalies {
            self.say(&format!("  ! {a}"));
        }
        let choice = self.answered(
            Select::new()
                .items(&["Accept", "Override", "Skip disc"])
                .default(0)
                .interact_on_opt(&self.term),
        );
        match choice {
            Some(0) => DiscDecision::Accept,
            Some(1) => {
                let (min_count, max_count) = count_bounds(proposal.track_count);
                let Some(season) = self.number("Season", proposal.season, 1, MAX_EPISODE) else {
                    return DiscDecision::Skip;
                };
                let Some(starting_episode) =
                    self.number("Starting episode", proposal.starting_episode, 1, MAX_EPISODE)
                else {
                    return DiscDecision::Skip;
                };
                let Some(episode_count) =
                    self.number("Episode count", proposal.episode_count, min_count, max_count)
                else {
                    return DiscDecision::Skip;
                };
                DiscDecision::Override {
                    season,
                    starting_episode,
                    episode_count,
                }
            }
            _ => DiscDecision::Skip,
        }
    }

    fn confirm_doubles(&mut self, titles: &[DiscTitle], candidates: &[u32]) -> Vec<u32> {
        if self.stopping() {
            return Vec::new();
        }
        let items: Vec<String> = candidates
            .iter()
            .map(|&pos| match titles.get(pos as usize) {
                Some(t) => format!("track {} ({:.1} min)", pos + 1, t.duration_min()),
                None => format!("track {}", pos + 1),
            })
            .collect();
        let chosen = self.answered(
            MultiSelect::new()
                .with_prompt("Which tracks hold two episodes? (space toggles)")
                .items(&items)
                .defaults(&vec![true; items.len()])
                .interact_on_opt(&self.term),
        );
        chosen
            .map(|indexes| selected_positions(candidates, &indexes))
            .unwrap_or_default()
    }

    fn confirm_track(&mut self, prompt: &TrackPrompt) -> TrackDecision {
        let accept = TrackDecision {
            episode: prompt.suggestion.episode,
            is_double: false,
        };
        if self.stopping() {
            return accept;
        }
        self.say(&track_summary(prompt));
        let answer: Option<String> = self.answered(
            Input::new()
                .with_prompt("Episode (suffix d for a double)")
                .default(prompt.suggestion.episode.to_string())
                .validate_with(|a: &String| match parse_track_answer(a) {
                    Some(_) => Ok(()),
                    None => Err(format!("expected an episode number 1-{MAX_EPISODE}")),
                })
                .interact_text_on(&self.term)
                .map(Some),
        );
        answer
            .and_then(|a| parse_track_answer(&a))
            .unwrap_or(accept)
    }

    fn approve_auto_increment(&mut self, series: &str) -> bool {
        if self.stopping() {
            return false;
        }
        self.answered(
            Confirm::new()
                .with_prompt(format!(
                    "Number future discs of '{series}' automatically from the disc number?"
                ))
                .default(false)
                .interact_on_opt(&self.term),
        )
        .unwrap_or(false)
    }
}

/// Menu entries for [`Confirmer::identify`]: candidates, then manual entry,
/// then skip.
fn identity_items(candidates: &[MediaIdentity]) -> Vec<String> {
    let mut items: Vec<String> = candidates
        .iter()
        .map(|c| {
            format!(
                "{} [{}] ({:.0}% match)",
                c.display_name(),
                c.media_type.label(),
                c.match_confidence * 100.0
            )
        })
        .collect();
    items.push("Enter manually".to_string());
    items.push("Skip disc".to_string());
    items
}

fn proposal_summary(p: &DiscProposal) -> String {
    let last = p
        .starting_episode
        .saturating_add(p.episode_count.saturating_sub(1));
    format!(
        "{} '{}': {} track(s) → S{:02}E{:02}-E{:02}",
        p.series, p.disc_name, p.track_count, p.season, p.starting_episode, last
    )
}

fn track_summary(prompt: &TrackPrompt) -> String {
    let learned = if prompt.suggestion.is_learned() {
        format!(" (learned, {:.0}%)", prompt.suggestion.confidence * 100.0)
    } else {
        String::new()
    };
    let name = prompt
        .episode_title
        .as_deref()
        .map(|t| format!(" \"{t}\""))
        .unwrap_or_default();
    format!(
        "Track {} ({:.1} min) → S{:02}E{:02}{name}{learned}",
        prompt.position + 1,
        prompt.title.duration_min(),
        prompt.season,
        prompt.suggestion.episode
    )
}

/// Episode counts a disc can hold: every track once, up to every track
/// doubled.
fn count_bounds(track_count: u32) -> (u32, u32) {
    let min = track_count.max(1);
    (min, track_count.saturating_mul(2).max(min))
}

fn check_range(n: u32, min: u32, max: u32) -> Result<(), String> {
    if (min..=max).contains(&n) {
        Ok(())
    } else {
        Err(format!("expected a number from {min} to {max}"))
    }
}

/// Menu indexes → track positions.
fn selected_positions(candidates: &[u32], indexes: &[usize]) -> Vec<u32> {
    let mut positions: Vec<u32> = indexes
        .iter()
        .filter_map(|&i| candidates.get(i).copied())
        .collect();
    positions.sort_unstable();
    positions.dedup();
    positions
}

/// "7" → E07, "7d" → E07+E08.
fn parse_track_answer(answer: &str) -> Option<TrackDecision> {
    let answer = answer.trim();
    let (num, is_double) = match answer.strip_suffix(['d', 'D']) {
        Some(n) => (n.trim(), true),
        None => (answer, false),
    };
    num.parse::<u32>()
        .ok()
        .filter(|&e| check_range(e, 1, MAX_EPISODE).is_ok())
        .map(|episode| TrackDecision { episode, is_double })
}
