use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ripshelf::config::AppConfig;
use ripshelf::confirm::ConsoleConfirmer;
use ripshelf::continuity::ContinuityEngine;
use ripshelf::db::Database;
use ripshelf::db::models::{SeriesState, SortingStrategy};
use ripshelf::metadata::{CachedMetadata, MetadataCache, MetadataProvider, Offline, Tmdb};
use ripshelf::organize::Organizer;
use ripshelf::ripper::MakeMkv;
use ripshelf::state::SeriesStateStore;
use ripshelf::watch::{DiscOutcome, SeriesLocks, Watcher, stop_on_signal};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "ripshelf", version, about = "Disc-by-disc ripping with series continuity")]
struct Cli {
    /// Path to the SQLite state database
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, ValueEnum)]
enum StrategyArg {
    TrackOrder,
    UserConfirmed,
}

impl From<StrategyArg> for SortingStrategy {
    fn from(s: StrategyArg) -> Self {
        match s {
            StrategyArg::TrackOrder => SortingStrategy::TrackOrder,
            StrategyArg::UserConfirmed => SortingStrategy::UserConfirmed,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the drives and process every disc that is inserted
    Watch {
        /// Library root (defaults to config library_dir)
        #[arg(long)]
        library: Option<PathBuf>,

        /// Seconds between drive polls
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Process the disc in one drive, then exit
    Rip {
        /// Drive index as reported by makemkvcon
        #[arg(short, long, default_value = "0")]
        drive: u32,

        /// Library root (defaults to config library_dir)
        #[arg(long)]
        library: Option<PathBuf>,
    },

    /// Show how a disc label is parsed
    Parse {
        /// Raw disc label
        label: String,
    },

    /// Inspect and manage series continuity state
    Series {
        #[command(subcommand)]
        action: SeriesAction,
    },

    /// Show learned track → episode patterns for a series season
    Patterns {
        /// Series title (case-insensitive)
        series: String,

        #[arg(short, long, default_value = "1")]
        season: u32,
    },

    /// Show state statistics
    Stats,
}

#[derive(Subcommand)]
enum SeriesAction {
    /// List every known series
    List,
    /// Show one series in detail
    Show { title: String },
    /// Forget a series: cursor, disc history and learned patterns
    Reset { title: String },
    /// Change how a series' tracks are mapped to episodes
    Strategy {
        title: String,
        #[arg(value_enum)]
        strategy: StrategyArg,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Load config file (optional, defaults if missing)
    let config = AppConfig::load();

    // Resolve database path: CLI > config > XDG default
    let db_path = cli
        .db_path
        .or(config.db_path.clone())
        .unwrap_or_else(ripshelf::config::default_db_path);
    log::info!("Database: {}", db_path.display());

    match cli.command {
        Commands::Parse { label } => {
            let parsed = ripshelf::disc::label::parse_disc_label(&label);
            println!("Label:    {label}");
            println!("Series:   {}", parsed.series_name);
            println!(
                "Season:   {}{}",
                parsed.season,
                if parsed.explicit_season { "" } else { " (default)" }
            );
            println!(
                "Disc:     {}{}",
                parsed.disc_number,
                if parsed.explicit_disc { "" } else { " (default)" }
            );
            println!("Pattern:  {}", ripshelf::disc::label::disc_name_pattern(&label));
        }

        Commands::Watch { library, interval } => {
            let shutdown = Arc::new(AtomicBool::new(false));
            stop_on_signal(shutdown.clone()).context("Failed to install signal handler")?;
            let mut watcher = build_watcher(&config, &db_path, library, interval, shutdown.clone())?;
            watcher.run(shutdown)?;
        }

        Commands::Rip { drive, library } => {
            let shutdown = Arc::new(AtomicBool::new(false));
            stop_on_signal(shutdown.clone()).context("Failed to install signal handler")?;
            let mut watcher = build_watcher(&config, &db_path, library, None, shutdown)?;
            match watcher.process_drive(drive)? {
                DiscOutcome::Done => println!("Done."),
                DiscOutcome::Skipped(reason) => println!("Skipped: {reason}"),
            }
        }

        Commands::Series { action } => {
            let mut store = open_store(&db_path)?;
            match action {
                SeriesAction::List => {
                    let all = store.list();
                    if all.is_empty() {
                        println!("No series yet.");
                    }
                    println!(
                        "{:<35} {:>6} {:>6} {:>5} {:>6}  {}",
                        "Series", "Season", "Next", "Discs", "Auto", "Strategy"
                    );
                    println!("{}", "-".repeat(80));
                    for s in all {
                        let title: String = if s.title.chars().count() > 35 {
                            format!("{}...", s.title.chars().take(32).collect::<String>())
                        } else {
                            s.title.clone()
                        };
                        println!(
                            "{:<35} {:>6} {:>6} {:>5} {:>6}  {}",
                            title,
                            s.current_season,
                            format!("E{:02}", s.next_episode),
                            s.processed_discs.len(),
                            if s.auto_increment { "yes" } else { "no" },
                            s.sorting_strategy.label()
                        );
                    }
                }
                SeriesAction::Show { title } => {
                    let state = store
                        .get_existing(&title)
                        .with_context(|| format!("No series named '{title}'"))?;
                    print_series(state);
                }
                SeriesAction::Reset { title } => {
                    if store.remove(&title).context("Failed to reset series")? {
                        println!("Forgot '{title}'.");
                    } else {
                        println!("No series named '{title}'.");
                    }
                }
                SeriesAction::Strategy { title, strategy } => {
                    let strategy = SortingStrategy::from(strategy);
                    store
                        .update_with(&title, |s| s.sorting_strategy = strategy)
                        .with_context(|| format!("Failed to update '{title}'"))?;
                    println!("'{title}' now uses {}.", strategy.label());
                }
            }
        }

        Commands::Patterns { series, season } => {
            let store = open_store(&db_path)?;
            let state = store
                .get_existing(&series)
                .with_context(|| format!("No series named '{series}'"))?;
            let learner = ripshelf::learning::PatternLearner::default();

            println!("{} season {season} ({})", state.title, state.sorting_strategy.label());
            match state.learned_pattern(season) {
                None => println!("Nothing learned yet."),
                Some(p) => {
                    let active = learner.has_patterns(&store, &series, season, "")
                        && p.confidence_score >= learner.acceptance_floor;
                    println!(
                        "Confidence {:.2} over {} disc(s), suggestions {}",
                        p.confidence_score,
                        p.usage_count,
                        if active { "active" } else { "not yet offered" }
                    );
                    println!();
                    println!("{:>6} {:>8} {:>10} {:>8}", "Track", "Episode", "Confidence", "Samples");
                    println!("{}", "-".repeat(36));
                    for m in &p.track_mappings {
                        println!(
                            "{:>6} {:>8} {:>10.2} {:>8}",
                            m.track_position + 1,
                            format!("E{:02}", m.episode_number),
                            m.confidence,
                            m.sample_count
                        );
                    }
                }
            }
        }

        Commands::Stats => {
            let db = Database::open(&db_path).context("Failed to open database")?;
            let stats = db.stats().context("Failed to read statistics")?;
            println!("Series:                  {}", stats.series);
            println!("Discs processed:         {}", stats.discs);
            println!("Episodes recorded:       {}", stats.episodes);
            println!("Learned season patterns: {}", stats.learned_patterns);
            println!("Manual identifications:  {}", stats.manual_identifications);
        }
    }

    Ok(())
}

fn open_store(db_path: &std::path::Path) -> Result<SeriesStateStore> {
    let db = Database::open(db_path).context("Failed to open database")?;
    SeriesStateStore::open(db).context("Failed to load series state")
}

/// TMDB behind the on-disk cache when a key is configured, offline otherwise.
fn build_metadata(config: &AppConfig) -> Result<Box<dyn MetadataProvider>> {
    let Some(key) = config.tmdb.api_key.as_deref() else {
        log::warn!("No TMDB API key configured; every disc will be identified by hand");
        return Ok(Box::new(Offline));
    };
    let tmdb = Tmdb::new(key, config.tmdb.base_url.as_deref(), &config.tmdb.language)?;

    let cache_path = config
        .cache_path
        .clone()
        .unwrap_or_else(ripshelf::config::default_cache_path);
    let cache = MetadataCache::open(&cache_path).context("Failed to open metadata cache")?;
    match cache.prune(config.cache_ttl_days) {
        Ok(n) if n > 0 => log::info!("Pruned {n} expired metadata cache entries"),
        Ok(_) => {}
        Err(e) => log::warn!("Could not prune metadata cache: {e}"),
    }
    Ok(Box::new(CachedMetadata::new(tmdb, cache, config.cache_ttl_days)))
}

type ConsoleWatcher = Watcher<MakeMkv, Box<dyn MetadataProvider>, ConsoleConfirmer>;

fn build_watcher(
    config: &AppConfig,
    db_path: &std::path::Path,
    library: Option<PathBuf>,
    interval: Option<u64>,
    shutdown: Arc<AtomicBool>,
) -> Result<ConsoleWatcher> {
    let store = open_store(db_path)?;
    let engine = ContinuityEngine::new(store, config.engine_settings());
    let library = library.unwrap_or_else(|| config.library_dir.clone());
    log::info!("Library: {}", library.display());

    Ok(Watcher::new(
        engine,
        MakeMkv::new(&config.makemkv.binary, config.makemkv.min_title_secs),
        build_metadata(config)?,
        ConsoleConfirmer::new(shutdown),
        Organizer::new(library),
        config.rip_dir.clone(),
        Duration::from_secs(interval.unwrap_or(config.poll_interval_secs).max(1)),
        SeriesLocks::default(),
    ))
}

/// Print one series' continuity state.
fn print_series(s: &SeriesState) {
    println!("{}", s.title);
    if let Some(id) = &s.identity {
        match id.external_id {
            Some(ext) => println!("  Identity:        {} (TMDB {ext})", id.display_name()),
            None => println!("  Identity:        {} (manual)", id.display_name()),
        }
    }
    println!("  Next:            S{:02}E{:02}, disc {}", s.current_season, s.next_episode, s.next_disc_number);
    println!("  Strategy:        {}", s.sorting_strategy.label());
    println!(
        "  Auto-increment:  {} ({:?})",
        if s.auto_increment { "on" } else { "off" },
        s.auto_increment_preference
    );
    for (season, count) in &s.season_episode_counts {
        println!("  Season {season:<2}       {count} episode(s) recorded");
    }
    println!("  Known discs:     {}", s.known_disc_patterns.len());

    if s.processed_discs.is_empty() {
        return;
    }
    println!();
    println!(
        "{:<30} {:>6} {:>4} {:>8} {:>6} {:>8}  {}",
        "Disc", "Season", "Disc", "Start", "Tracks", "Episodes", "Processed"
    );
    println!("{}", "-".repeat(90));
    for d in &s.processed_discs {
        println!(
            "{:<30} {:>6} {:>4} {:>8} {:>6} {:>8}  {}",
            d.disc_name,
            d.season,
            d.disc_number,
            format!("E{:02}", d.starting_episode),
            d.track_count,
            d.episode_count,
            d.processed_date.format("%Y-%m-%d %H:%M")
        );
    }
}
