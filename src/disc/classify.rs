use super::DiscTitle;
use super::label::ParsedDiscInfo;
use crate::db::models::MediaType;

/// Titles at least this long are feature-length.
const FEATURE_MIN_SECS: u64 = 60 * 60;

/// Episode-length window for the series heuristic.
const EPISODE_MIN_SECS: u64 = 18 * 60;
const EPISODE_MAX_SECS: u64 = 65 * 60;

/// Guess whether a disc holds a movie or a run of series episodes.
///
/// Tiered, first match wins: explicit season/disc markers → a cluster of
/// similar episode-length titles → a single dominant feature → unknown.
pub fn classify_media(parsed: &ParsedDiscInfo, titles: &[DiscTitle]) -> MediaType {
    // Tier 1: label says so
    if parsed.explicit_season || parsed.explicit_disc {
        return MediaType::Series;
    }

    if titles.is_empty() {
        return MediaType::Unknown;
    }

    // Tier 2: three or more titles of similar episode length
    let episodic: Vec<u64> = titles
        .iter()
        .map(|t| t.duration_secs)
        .filter(|d| (EPISODE_MIN_SECS..=EPISODE_MAX_SECS).contains(d))
        .collect();
    if episodic.len() >= 3 {
        let med = median(&episodic);
        let similar = episodic
            .iter()
            .filter(|&&d| (d as f64 - med).abs() <= med * 0.35)
            .count();
        if similar >= 3 {
            return MediaType::Series;
        }
    }

    // Tier 3: exactly one feature-length title
    let features = titles
        .iter()
        .filter(|t| t.duration_secs >= FEATURE_MIN_SECS)
        .count();
    if features == 1 {
        return MediaType::Movie;
    }

    MediaType::Unknown
}

/// Positions of titles that look like two episodes on one track: at least
/// `ratio` times the median duration of the other titles on the disc.
pub fn double_candidates(titles: &[DiscTitle], ratio: f64) -> Vec<u32> {
    if titles.len() < 2 {
        return Vec::new();
    }

    let mut out = Vec::new();
    for (pos, title) in titles.iter().enumerate() {
        let others: Vec<u64> = titles
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != pos)
            .map(|(_, t)| t.duration_secs)
            .collect();
        let med = median(&others);
        if med > 0.0 && title.duration_secs as f64 >= med * ratio {
            out.push(pos as u32);
        }
    }
    out
}

/// Index of the longest title (main feature of a movie disc).
pub fn main_feature(titles: &[DiscTitle]) -> Option<usize> {
    titles
        .iter()
        .enumerate()
        .max_by_key(|(_, t)| (t.duration_secs, t.size_bytes))
        .map(|(i, _)| i)
}

fn median(values: &[u64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) as f64 / 2.0
    } else {
        sorted[mid] as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disc::label::parse_disc_label;

    fn title(index: u32, minutes: u64) -> DiscTitle {
        DiscTitle {
            index,
            name: format!("Title {index}"),
            duration_secs: minutes * 60,
            size_bytes: minutes * 30_000_000,
            chapter_count: 6,
            output_file: Some(format!("title_t{index:02}.mkv")),
        }
    }

    #[test]
    fn tier1_markers_mean_series() {
        let parsed = parse_disc_label("Demo_S1_D1");
        assert_eq!(classify_media(&parsed, &[title(0, 120)]), MediaType::Series);
    }

    #[test]
    fn tier2_episode_cluster_is_series() {
        let parsed = parse_disc_label("DEMO");
        let titles = vec![title(0, 22), title(1, 23), title(2, 22), title(3, 3)];
        assert_eq!(classify_media(&parsed, &titles), MediaType::Series);
    }

    #[test]
    fn tier3_single_feature_is_movie() {
        let parsed = parse_disc_label("BIG_MOVIE");
        let titles = vec![title(0, 118), title(1, 4), title(2, 2)];
        assert_eq!(classify_media(&parsed, &titles), MediaType::Movie);
    }

    #[test]
    fn ambiguous_disc_is_unknown() {
        let parsed = parse_disc_label("MYSTERY");
        let titles = vec![title(0, 95), title(1, 90)];
        assert_eq!(classify_media(&parsed, &titles), MediaType::Unknown);
        assert_eq!(classify_media(&parsed, &[]), MediaType::Unknown);
    }

    #[test]
    fn test_double_candidates() {
        let titles = vec![title(0, 22), title(1, 44), title(2, 23), title(3, 22)];
        assert_eq!(double_candidates(&titles, 1.8), vec![1]);
    }

    #[test]
    fn test_double_candidates_two_titles() {
        let titles = vec![title(0, 22), title(1, 44)];
        assert_eq!(double_candidates(&titles, 1.8), vec![1]);
        assert!(double_candidates(&titles[..1], 1.8).is_empty());
    }

    #[test]
    fn test_main_feature() {
        let titles = vec![title(0, 5), title(1, 118), title(2, 30)];
        assert_eq!(main_feature(&titles), Some(1));
        assert_eq!(main_feature(&[]), None);
    }
}
