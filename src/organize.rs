//! Library layout and file moves.
//!
//! ```text
//! <library>/TV Shows/<Title> (<Year>)/Season 01/<Title> - S01E05.mkv
//! <library>/TV Shows/<Title> (<Year>)/Season 01/<Title> - S01E06-E07.mkv
//! <library>/Movies/<Title> (<Year>)/<Title> (<Year>).mkv
//! ```

use crate::db::models::MediaIdentity;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrganizeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Source file not found: {0}")]
    SourceNotFound(PathBuf),
    #[error("Refusing to overwrite {0}")]
    DestinationExists(PathBuf),
    #[error("No episodes given for {0}")]
    NoEpisodes(String),
}

pub type Result<T> = std::result::Result<T, OrganizeError>;

pub struct Organizer {
    library_dir: PathBuf,
}

impl Organizer {
    pub fn new(library_dir: impl Into<PathBuf>) -> Self {
        Self {
            library_dir: library_dir.into(),
        }
    }

    pub fn library_dir(&self) -> &Path {
        &self.library_dir
    }

    /// Destination of one series track. `episodes` holds one number, or two
    /// for a double.
    pub fn episode_path(
        &self,
        identity: &MediaIdentity,
        season: u32,
        episodes: &[u32],
    ) -> Result<PathBuf> {
        let (Some(first), Some(last)) = (episodes.first(), episodes.last()) else {
            return Err(OrganizeError::NoEpisodes(identity.title.clone()));
        };
        let title = sanitize(&identity.title);
        let episode_part = if first == last {
            format!("S{season:02}E{first:02}")
        } else {
            format!("S{season:02}E{first:02}-E{last:02}")
        };
        Ok(self
            .library_dir
            .join("TV Shows")
            .join(folder_name(identity))
            .join(format!("Season {season:02}"))
            .join(format!("{title} - {episode_part}.mkv")))
    }

    pub fn movie_path(&self, identity: &MediaIdentity) -> PathBuf {
        let folder = folder_name(identity);
        self.library_dir
            .join("Movies")
            .join(&folder)
            .join(format!("{folder}.mkv"))
    }

    /// Move `source` to `destination`, creating parent directories. An
    /// existing destination is never replaced.
    pub fn place(&self, source: &Path, destination: &Path) -> Result<()> {
        if !source.exists() {
            return Err(OrganizeError::SourceNotFound(source.to_path_buf()));
        }
        if destination.exists() {
            return Err(OrganizeError::DestinationExists(destination.to_path_buf()));
        }
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)?;
        }
        move_file(source, destination)?;
        log::info!("{} → {}", source.display(), destination.display());
        Ok(())
    }
}

/// "<Title> (<Year>)", or just the title when the year is unknown.
fn folder_name(identity: &MediaIdentity) -> String {
    let title = sanitize(&identity.title);
    match identity.year {
        Some(y) => format!("{title} ({y})"),
        None => title,
    }
}

/// Strip characters that are invalid on common filesystems and collapse
/// whitespace.
pub fn sanitize(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => ' ',
            c if c.is_control() => ' ',
            _ => c,
        })
        .collect();
    let collapsed = replaced.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim_end_matches('.').trim();
    if trimmed.is_empty() {
        "Unknown".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Rename, falling back to copy + remove across filesystems.
fn move_file(source: &Path, destination: &Path) -> std::io::Result<()> {
    match std::fs::rename(source, destination) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::CrossesDevices || e.raw_os_error() == Some(18) => {
            log::debug!("Cross-device move, copying {}", source.display());
            if let Err(e) = std::fs::copy(source, destination) {
                std::fs::remove_file(destination).ok();
                return Err(e);
            }
            std::fs::remove_file(source)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::MediaType;

    fn show() -> MediaIdentity {
        MediaIdentity {
            title: "Demo: The Show".to_string(),
            year: Some(2004),
            external_id: Some(1),
            media_type: MediaType::Series,
            match_confidence: 1.0,
        }
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("Demo: The Show"), "Demo The Show");
        assert_eq!(sanitize("What?  Now/Then."), "What Now Then");
        assert_eq!(sanitize("???"), "Unknown");
    }

    #[test]
    fn test_episode_paths() {
        let org = Organizer::new("/lib");
        assert_eq!(
            org.episode_path(&show(), 1, &[5]).unwrap(),
            PathBuf::from("/lib/TV Shows/Demo The Show (2004)/Season 01/Demo The Show - S01E05.mkv")
        );
        assert_eq!(
            org.episode_path(&show(), 2, &[6, 7]).unwrap(),
            PathBuf::from("/lib/TV Shows/Demo The Show (2004)/Season 02/Demo The Show - S02E06-E07.mkv")
        );
        assert!(matches!(
            org.episode_path(&show(), 1, &[]),
            Err(OrganizeError::NoEpisodes(_))
        ));
    }

    #[test]
    fn test_movie_path_without_year() {
        let org = Organizer::new("/lib");
        let movie = MediaIdentity {
            title: "Demo Movie".to_string(),
            year: None,
            external_id: None,
            media_type: MediaType::Movie,
            match_confidence: 1.0,
        };
        assert_eq!(
            org.movie_path(&movie),
            PathBuf::from("/lib/Movies/Demo Movie/Demo Movie.mkv")
        );
    }

    #[test]
    fn test_place_moves_and_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let org = Organizer::new(dir.path().join("lib"));
        let src = dir.path().join("title_t00.mkv");
        std::fs::write(&src, b"video").unwrap();

        let dest = org.episode_path(&show(), 1, &[1]).unwrap();
        org.place(&src, &dest).unwrap();
        assert!(!src.exists());
        assert_eq!(std::fs::read(&dest).unwrap(), b"video");

        std::fs::write(&src, b"other").unwrap();
        assert!(matches!(
            org.place(&src, &dest),
            Err(OrganizeError::DestinationExists(_))
        ));
        assert!(src.exists());
        assert_eq!(std::fs::read(&dest).unwrap(), b"video");
    }

    #[test]
    fn test_place_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let org = Organizer::new(dir.path());
        assert!(matches!(
            org.place(&dir.path().join("nope.mkv"), &dir.path().join("x.mkv")),
            Err(OrganizeError::SourceNotFound(_))
        ));
    }
}
