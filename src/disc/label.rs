use regex::Regex;
use std::sync::LazyLock;

/// Best-effort (series, season, disc) triple extracted from a disc label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDiscInfo {
    pub series_name: String,
    pub season: u32,
    pub disc_number: u32,
    /// True when the label carried a season marker (`S2`, `Season_2`).
    pub explicit_season: bool,
    /// True when the label carried a disc marker (`D1`, `Disc_1`).
    pub explicit_disc: bool,
}

impl ParsedDiscInfo {
    fn bare(raw: &str) -> Self {
        Self {
            series_name: clean_name(raw),
            season: 1,
            disc_number: 1,
            explicit_season: false,
            explicit_disc: false,
        }
    }
}

// Pattern 1: season + disc markers
// e.g., Demo_S1_D2, Demo_Season_1_Disc_2, DEMO S01D02, Demo.S1.D2.BLURAY
static SEASON_DISC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?ix)
        ^(?P<name>.+?)[\s_.\-]+
        s(?:eason)?[\s_.\-]*(?P<season>\d{1,2})
        [\s_.\-]*
        d(?:is[ck])?[\s_.\-]*(?P<disc>\d{1,2})
        (?:[^0-9].*)?$",
    )
    .unwrap()
});

// Pattern 2: season marker only
// e.g., Demo_S2, Demo_Season_2_BLURAY
static SEASON_ONLY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?ix)
        ^(?P<name>.+?)[\s_.\-]+
        s(?:eason)?[\s_.\-]*(?P<season>\d{1,2})
        (?:[^0-9].*)?$",
    )
    .unwrap()
});

// Pattern 3: disc marker only
// e.g., Demo_D3, Demo_Disc_3
static DISC_ONLY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?ix)
        ^(?P<name>.+?)[\s_.\-]+
        d(?:is[ck])?[\s_.\-]*(?P<disc>\d{1,2})
        (?:[^0-9].*)?$",
    )
    .unwrap()
});

static SEPARATOR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\s_.\-]+").unwrap());

static DIGITS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());

/// Parse a raw disc label using a cascade of patterns. Never fails: anything
/// unrecognised is treated as a bare title on season 1, disc 1.
pub fn parse_disc_label(raw: &str) -> ParsedDiscInfo {
    let label = raw.trim();

    if let Some(caps) = SEASON_DISC_RE.captures(label) {
        let name = clean_name(caps.name("name").unwrap().as_str());
        if !name.is_empty() {
            return ParsedDiscInfo {
                series_name: name,
                season: parse_number(caps.name("season").unwrap().as_str(), 1),
                disc_number: parse_number(caps.name("disc").unwrap().as_str(), 1).max(1),
                explicit_season: true,
                explicit_disc: true,
            };
        }
    }

    if let Some(caps) = SEASON_ONLY_RE.captures(label) {
        let name = clean_name(caps.name("name").unwrap().as_str());
        if !name.is_empty() {
            return ParsedDiscInfo {
                series_name: name,
                season: parse_number(caps.name("season").unwrap().as_str(), 1),
                disc_number: 1,
                explicit_season: true,
                explicit_disc: false,
            };
        }
    }

    if let Some(caps) = DISC_ONLY_RE.captures(label) {
        let name = clean_name(caps.name("name").unwrap().as_str());
        if !name.is_empty() {
            return ParsedDiscInfo {
                series_name: name,
                season: 1,
                disc_number: parse_number(caps.name("disc").unwrap().as_str(), 1).max(1),
                explicit_season: false,
                explicit_disc: true,
            };
        }
    }

    ParsedDiscInfo::bare(label)
}

fn parse_number(s: &str, default: u32) -> u32 {
    s.parse().unwrap_or(default)
}

/// Replace `_` and `.` with spaces, collapse whitespace, trim stray dashes.
fn clean_name(s: &str) -> String {
    let replaced = s.replace(['_', '.'], " ");
    let collapsed = replaced.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.trim_matches(|c: char| c == '-' || c.is_whitespace()).to_string()
}

/// Key used for the series state table: case-folded, separators collapsed.
pub fn normalize_title(title: &str) -> String {
    SEPARATOR_RE
        .replace_all(&title.to_lowercase(), " ")
        .trim()
        .to_string()
}

/// Key used for the manual-identification cache. Digit runs are folded to
/// `#` so every disc of a set ("SHOW_S1_D1", "SHOW_S1_D2") shares one entry.
pub fn disc_name_pattern(raw: &str) -> String {
    let folded = normalize_title(raw);
    DIGITS_RE.replace_all(&folded, "#").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_markers() {
        let r = parse_disc_label("Demo_S1_D1");
        assert_eq!(r.series_name, "Demo");
        assert_eq!(r.season, 1);
        assert_eq!(r.disc_number, 1);
        assert!(r.explicit_season);
        assert!(r.explicit_disc);
    }

    #[test]
    fn test_spelled_out_markers() {
        let r = parse_disc_label("Demo_Show_Season_2_Disc_3");
        assert_eq!(r.series_name, "Demo Show");
        assert_eq!(r.season, 2);
        assert_eq!(r.disc_number, 3);
    }

    #[test]
    fn test_lowercase_and_padded() {
        let r = parse_disc_label("the_wire_s03d04");
        assert_eq!(r.series_name, "the wire");
        assert_eq!(r.season, 3);
        assert_eq!(r.disc_number, 4);
    }

    #[test]
    fn test_trailing_junk_after_disc() {
        let r = parse_disc_label("DEMO.S1.D2.BLURAY");
        assert_eq!(r.series_name, "DEMO");
        assert_eq!(r.season, 1);
        assert_eq!(r.disc_number, 2);
    }

    #[test]
    fn test_season_only() {
        let r = parse_disc_label("Demo_Season_4");
        assert_eq!(r.series_name, "Demo");
        assert_eq!(r.season, 4);
        assert_eq!(r.disc_number, 1);
        assert!(r.explicit_season);
        assert!(!r.explicit_disc);
    }

    #[test]
    fn test_disc_only() {
        let r = parse_disc_label("Demo_Disc_2");
        assert_eq!(r.series_name, "Demo");
        assert_eq!(r.season, 1);
        assert_eq!(r.disc_number, 2);
        assert!(!r.explicit_season);
        assert!(r.explicit_disc);
    }

    #[test]
    fn test_words_starting_with_marker_letters_are_not_markers() {
        // "Sopranos" and "DARK" start with s/d but have no number attached
        let r = parse_disc_label("THE_DARK_KNIGHT");
        assert_eq!(r.series_name, "THE DARK KNIGHT");
        assert!(!r.explicit_season);
        assert!(!r.explicit_disc);

        let r = parse_disc_label("The_Sopranos_S1_D1");
        assert_eq!(r.series_name, "The Sopranos");
        assert_eq!(r.season, 1);
    }

    #[test]
    fn test_bare_title_defaults() {
        let r = parse_disc_label("  Some.Movie_Title ");
        assert_eq!(r.series_name, "Some Movie Title");
        assert_eq!(r.season, 1);
        assert_eq!(r.disc_number, 1);
        assert!(!r.explicit_season);
        assert!(!r.explicit_disc);
    }

    #[test]
    fn test_three_digit_disc_is_not_a_marker() {
        let r = parse_disc_label("Demo_D123");
        assert!(!r.explicit_disc);
        assert_eq!(r.series_name, "Demo D123");
    }

    #[test]
    fn test_empty_label() {
        let r = parse_disc_label("");
        assert_eq!(r.series_name, "");
        assert_eq!(r.season, 1);
        assert_eq!(r.disc_number, 1);
    }

    #[test]
    fn test_normalize_title() {
        assert_eq!(normalize_title("Demo Show"), "demo show");
        assert_eq!(normalize_title("  DEMO_show "), "demo show");
        assert_eq!(normalize_title("demo.show"), "demo show");
    }

    #[test]
    fn test_disc_name_pattern_folds_numbers() {
        assert_eq!(disc_name_pattern("SHOW_S1_D1"), "show s# d#");
        assert_eq!(disc_name_pattern("show_s1_d2"), disc_name_pattern("SHOW_S1_D1"));
        assert_eq!(disc_name_pattern("DISC_NAME"), "disc name");
    }
}
