pub mod config;
pub mod confirm;
pub mod continuity;
pub mod db;
pub mod disc;
pub mod learning;
pub mod metadata;
pub mod organize;
pub mod ripper;
pub mod state;
pub mod watch;

/// Application name for XDG paths
pub const APP_NAME: &str = "ripshelf";
