pub mod classify;
pub mod label;

use serde::{Deserialize, Serialize};

/// A physical drive as reported by the ripping program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Drive {
    pub index: u32,
    pub name: String,
    pub device: String,
    /// Label of the inserted disc, `None` when the drive is empty.
    pub disc_label: Option<String>,
}

/// One rippable title on a disc.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscTitle {
    /// Title index as used by the ripping program.
    pub index: u32,
    pub name: String,
    pub duration_secs: u64,
    pub size_bytes: u64,
    pub chapter_count: u32,
    /// File name the ripping program will write for this title.
    pub output_file: Option<String>,
}

impl DiscTitle {
    pub fn duration_min(&self) -> f64 {
        self.duration_secs as f64 / 60.0
    }
}

/// A scanned disc: the drive it sits in, its raw label and its titles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScannedDisc {
    pub drive: Drive,
    pub label: String,
    pub titles: Vec<DiscTitle>,
}

impl ScannedDisc {
    /// Titles at least `min_secs` long, in disc order. Shorter titles are
    /// extras, menus and recap clips.
    pub fn candidate_titles(&self, min_secs: u64) -> Vec<DiscTitle> {
        self.titles
            .iter()
            .filter(|t| t.duration_secs >= min_secs)
            .cloned()
            .collect()
    }
}

/// A title selected for ripping, with the double-episode flag set by the
/// confirmation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RippedTrack {
    pub title: DiscTitle,
    /// Zero-based position among the selected titles.
    pub position: u32,
    /// One physical track holding two sequential episodes.
    pub is_double: bool,
}

impl RippedTrack {
    pub fn episode_span(&self) -> u32 {
        if self.is_double { 2 } else { 1 }
    }
}

/// Number of logical episodes represented by a set of ripped tracks.
pub fn episode_count(tracks: &[RippedTrack]) -> u32 {
    tracks.iter().map(RippedTrack::episode_span).sum()
}

/// Mark or clear doubles until the tracks add up to `episodes`: the longest
/// tracks are doubled first, the shortest doubles cleared first. Returns the
/// count reached, which stops at what the tracks can hold (each track one or
/// two episodes).
pub fn fit_episode_count(tracks: &mut [RippedTrack], episodes: u32) -> u32 {
    let mut order: Vec<usize> = (0..tracks.len()).collect();
    order.sort_by_key(|&i| std::cmp::Reverse(tracks[i].title.duration_secs));

    let mut count = episode_count(tracks);
    for &i in &order {
        if count >= episodes {
            break;
        }
        if !tracks[i].is_double {
            tracks[i].is_double = true;
            count += 1;
        }
    }
    for &i in order.iter().rev() {
        if count <= episodes {
            break;
        }
        if tracks[i].is_double {
            tracks[i].is_double = false;
            count -= 1;
        }
    }
    count
}
