//! Drive polling loop. One disc is processed end to end (identify, plan,
//! rip, organise, finalize, eject) before the next drive is looked at.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};

use crate::confirm::Confirmer;
use crate::continuity::{ContinuityEngine, PlanKind, Planned};
use crate::db::DbError;
use crate::disc::Drive;
use crate::disc::label::normalize_title;
use crate::metadata::MetadataProvider;
use crate::organize::{OrganizeError, Organizer, sanitize};
use crate::ripper::Ripper;

/// Consecutive persistence failures before the operator is alerted.
const ESCALATE_AFTER: u32 = 3;

/// One mutex per series, keyed by normalised title. Whoever mutates a
/// series' state holds its guard for the whole disc.
#[derive(Debug, Clone, Default)]
pub struct SeriesLocks {
    inner: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl SeriesLocks {
    pub fn get(&self, series_title: &str) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.entry(normalize_title(series_title))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscOutcome {
    Done,
    Skipped(String),
}

pub struct Watcher<R, M, C> {
    engine: ContinuityEngine,
    ripper: R,
    metadata: M,
    confirmer: C,
    organizer: Organizer,
    rip_dir: PathBuf,
    poll_interval: Duration,
    locks: SeriesLocks,
    /// Drive index → label of the disc already handled in it.
    handled: HashMap<u32, String>,
    persistence_failures: u32,
}

impl<R: Ripper, M: MetadataProvider, C: Confirmer> Watcher<R, M, C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: ContinuityEngine,
        ripper: R,
        metadata: M,
        confirmer: C,
        organizer: Organizer,
        rip_dir: PathBuf,
        poll_interval: Duration,
        locks: SeriesLocks,
    ) -> Self {
        Self {
            engine,
            ripper,
            metadata,
            confirmer,
            organizer,
            rip_dir,
            poll_interval,
            locks,
            handled: HashMap::new(),
            persistence_failures: 0,
        }
    }

    pub fn engine(&self) -> &ContinuityEngine {
        &self.engine
    }

    /// Poll until `shutdown` is set. The flag is only checked between discs.
    pub fn run(&mut self, shutdown: Arc<AtomicBool>) -> Result<()> {
        log::info!(
            "Watching drives every {}s (rips go to {})",
            self.poll_interval.as_secs(),
            self.rip_dir.display()
        );
        while !shutdown.load(Ordering::SeqCst) {
            if let Err(e) = self.poll_once(&shutdown) {
                log::error!("Poll failed: {e:#}");
            }

            // sleep in slices so shutdown isn't delayed by a whole interval
            let mut waited = Duration::ZERO;
            let slice = Duration::from_millis(250);
            while waited < self.poll_interval && !shutdown.load(Ordering::SeqCst) {
                std::thread::sleep(slice);
                waited += slice;
            }
        }
        log::info!("Shutting down");
        Ok(())
    }

    /// Examine every drive once. Returns the number of discs finished.
    pub fn poll_once(&mut self, shutdown: &AtomicBool) -> Result<usize> {
        let drives = self.ripper.drives().context("Failed to list drives")?;

        // a drive that emptied, or holds a different disc, is fair game again
        self.handled.retain(|index, label| {
            drives
                .iter()
                .any(|d| d.index == *index && d.disc_label.as_deref() == Some(label.as_str()))
        });

        let mut finished = 0;
        for drive in &drives {
            let Some(label) = drive.disc_label.clone() else {
                continue;
            };
            if self.handled.contains_key(&drive.index) {
                continue;
            }
            if shutdown.load(Ordering::SeqCst) {
                break;
            }

            log::info!("Disc '{label}' in {}", drive.device);
            match self.process_disc(drive) {
                Ok(DiscOutcome::Done) => {
                    self.persistence_failures = 0;
                    self.handled.insert(drive.index, label);
                    finished += 1;
                }
                Ok(DiscOutcome::Skipped(reason)) => {
                    log::info!("Skipped '{label}': {reason}");
                    self.handled.insert(drive.index, label);
                }
                Err(e) if e.downcast_ref::<DbError>().is_some() => {
                    self.persistence_failures += 1;
                    log::error!(
                        "Could not save state for '{label}', will retry next poll: {e:#}"
                    );
                    if self.persistence_failures >= ESCALATE_AFTER {
                        log::error!(
                            "State storage has failed {} times in a row. Check the database \
                             file and disk space; discs will stay in their drives until it recovers.",
                            self.persistence_failures
                        );
                    }
                }
                Err(e) => {
                    log::error!("Failed to process '{label}': {e:#}");
                    self.handled.insert(drive.index, label);
                }
            }
        }
        Ok(finished)
    }

    /// Process whatever disc is in one drive, ignoring the handled set.
    pub fn process_drive(&mut self, index: u32) -> Result<DiscOutcome> {
        let drives = self.ripper.drives().context("Failed to list drives")?;
        let drive = drives
            .into_iter()
            .find(|d| d.index == index)
            .with_context(|| format!("No drive with index {index}"))?;
        if drive.disc_label.is_none() {
            anyhow::bail!("Drive {index} ({}) is empty", drive.device);
        }
        self.process_disc(&drive)
    }

    /// Whether state persistence has failed often enough to need an operator.
    pub fn escalated(&self) -> bool {
        self.persistence_failures >= ESCALATE_AFTER
    }

    fn process_disc(&mut self, drive: &Drive) -> Result<DiscOutcome> {
        let disc = self
            .ripper
            .scan(drive)
            .with_context(|| format!("Failed to scan drive {}", drive.index))?;

        let Some(identity) = self.engine.identify(&disc, &self.metadata, &mut self.confirmer)
        else {
            return Ok(DiscOutcome::Skipped("not identified".to_string()));
        };

        let lock = self.locks.get(&identity.title);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let plan = match self
            .engine
            .plan(&disc, &identity, &self.metadata, &mut self.confirmer)?
        {
            Planned::Ready(plan) => plan,
            Planned::Skipped(reason) => return Ok(DiscOutcome::Skipped(reason)),
        };

        let out_dir = self.rip_dir.join(sanitize(&disc.label));
        let titles = plan.titles();
        let pb = ProgressBar::new(0);
        pb.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{bar:40.cyan/blue}] {percent}% ({eta}) {msg}",
            )
            .unwrap()
            .progress_chars("#>-"),
        );
        let files = self
            .ripper
            .rip(drive, &titles, &out_dir, &pb)
            .with_context(|| format!("Failed to rip '{}'", disc.label))?;

        for (position, file) in files.iter().enumerate() {
            let destination = match &plan.kind {
                PlanKind::Movie { .. } => self.organizer.movie_path(&plan.identity),
                PlanKind::Series(s) => self.organizer.episode_path(
                    &plan.identity,
                    s.record.season,
                    s.episodes_for(position as u32),
                )?,
            };
            match self.organizer.place(&file.path, &destination) {
                Ok(()) => {}
                Err(OrganizeError::DestinationExists(path)) => {
                    log::warn!(
                        "{} already exists, leaving {} in place",
                        path.display(),
                        file.path.display()
                    );
                }
                Err(e) => return Err(e).context("Failed to organise ripped files"),
            }
        }

        self.engine.finalize(&plan, &mut self.confirmer)?;

        if let Err(e) = self.ripper.eject(drive) {
            log::warn!("Could not eject {}: {e}", drive.device);
        }
        // only removes the directory when everything was moved out
        std::fs::remove_dir(&out_dir).ok();
        Ok(DiscOutcome::Done)
    }
}

/// Stop the watcher between discs on Ctrl-C or SIGTERM. A second signal
/// exits at once.
pub fn stop_on_signal(shutdown: Arc<AtomicBool>) -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    std::thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            runtime.block_on(async {
                loop {
                    if let Err(e) = interrupted().await {
                        log::error!("Signal handling unavailable: {e}");
                        return;
                    }
                    if request_stop(&shutdown) {
                        log::warn!("Interrupted again, exiting now");
                        std::process::exit(130);
                    }
                }
            })
        })?;
    Ok(())
}

#[cfg(unix)]
async fn interrupted() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => r,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn interrupted() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// Set the flag. Returns true when it was already set.
fn request_stop(shutdown: &AtomicBool) -> bool {
    let again = shutdown.swap(true, Ordering::SeqCst);
    if !again {
        log::warn!("Interrupted: stopping after the current disc (interrupt again to quit now)");
    }
    again
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirm::{
        DiscDecision, DiscProposal, IdentityDecision, TrackDecision, TrackPrompt,
    };
    use crate::continuity::EngineSettings;
    use crate::db::Database;
    use crate::db::models::{MediaIdentity, MediaType};
    use crate::disc::{DiscTitle, ScannedDisc};
    use crate::metadata::Offline;
    use crate::ripper::{self, RippedFile};
    use crate::state::SeriesStateStore;
    use std::cell::RefCell;
    use std::path::Path;

    struct FakeRipper {
        drives: RefCell<Vec<Drive>>,
        minutes: Vec<u64>,
        ejected: RefCell<Vec<u32>>,
        rips: RefCell<usize>,
    }

    impl FakeRipper {
        fn with_disc(label: &str, minutes: &[u64]) -> Self {
            Self {
                drives: RefCell::new(vec![Drive {
                    index: 0,
                    name: "BD".to_string(),
                    device: "/dev/sr0".to_string(),
                    disc_label: Some(label.to_string()),
                }]),
                minutes: minutes.to_vec(),
                ejected: RefCell::new(Vec::new()),
                rips: RefCell::new(0),
            }
        }
    }

    impl Ripper for FakeRipper {
        fn drives(&self) -> ripper::Result<Vec<Drive>> {
            Ok(self.drives.borrow().clone())
        }

        fn scan(&self, drive: &Drive) -> ripper::Result<ScannedDisc> {
            Ok(ScannedDisc {
                drive: drive.clone(),
                label: drive.disc_label.clone().unwrap_or_default(),
                titles: self
                    .minutes
                    .iter()
                    .enumerate()
                    .map(|(i, m)| DiscTitle {
                        index: i as u32,
                        name: format!("Title {i}"),
                        duration_secs: m * 60,
                        size_bytes: 0,
                        chapter_count: 0,
                        output_file: None,
                    })
                    .collect(),
            })
        }

        fn rip(
            &self,
            _drive: &Drive,
            titles: &[DiscTitle],
            out_dir: &Path,
            _progress: &ProgressBar,
        ) -> ripper::Result<Vec<RippedFile>> {
            *self.rips.borrow_mut() += 1;
            std::fs::create_dir_all(out_dir)?;
            let mut files = Vec::new();
            for t in titles {
                let path = out_dir.join(format!("title_t{:02}.mkv", t.index));
                std::fs::write(&path, b"mkv")?;
                files.push(RippedFile {
                    title_index: t.index,
                    path,
                    size_bytes: 3,
                });
            }
            Ok(files)
        }

        fn eject(&self, drive: &Drive) -> ripper::Result<()> {
            self.ejected.borrow_mut().push(drive.index);
            Ok(())
        }
    }

    /// Identifies everything as Demo Show and accepts every proposal.
    struct AcceptAll;

    impl Confirmer for AcceptAll {
        fn identify(&mut self, _label: &str, _candidates: &[MediaIdentity]) -> IdentityDecision {
            IdentityDecision::Use(MediaIdentity {
                title: "Demo Show".to_string(),
                year: Some(2004),
                external_id: None,
                media_type: MediaType::Series,
                match_confidence: 1.0,
            })
        }
        fn choose_media_type(&mut self, _label: &str, _titles: &[DiscTitle]) -> Option<MediaType> {
            Some(MediaType::Series)
        }
        fn confirm_disc(&mut self, _proposal: &DiscProposal) -> DiscDecision {
            DiscDecision::Accept
        }
        fn confirm_doubles(&mut self, _titles: &[DiscTitle], candidates: &[u32]) -> Vec<u32> {
            candidates.to_vec()
        }
        fn confirm_track(&mut self, prompt: &TrackPrompt) -> TrackDecision {
            TrackDecision {
                episode: prompt.suggestion.episode,
                is_double: false,
            }
        }
        fn approve_auto_increment(&mut self, _series: &str) -> bool {
            false
        }
    }

    fn watcher(dir: &Path, ripper: FakeRipper) -> Watcher<FakeRipper, Offline, AcceptAll> {
        let store = SeriesStateStore::open(Database::open_in_memory().unwrap()).unwrap();
        Watcher::new(
            ContinuityEngine::new(store, EngineSettings::default()),
            ripper,
            Offline,
            AcceptAll,
            Organizer::new(dir.join("library")),
            dir.join("rips"),
            Duration::from_secs(1),
            SeriesLocks::default(),
        )
    }

    #[test]
    fn test_series_locks_are_per_title() {
        let locks = SeriesLocks::default();
        let a = locks.get("Demo Show");
        let b = locks.get("DEMO_SHOW");
        let c = locks.get("Other Show");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));

        let _held = a.lock().unwrap();
        assert!(b.try_lock().is_err());
        assert!(c.try_lock().is_ok());
    }

    #[test]
    fn test_series_locks_serialize_threads() {
        let locks = SeriesLocks::default();
        let counter = Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let locks = locks.clone();
                let counter = counter.clone();
                std::thread::spawn(move || {
                    let lock = locks.get("Demo Show");
                    let _g = lock.lock().unwrap();
                    let mut v = counter.lock().unwrap();
                    v.push(i);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.lock().unwrap().len(), 4);
    }

    #[test]
    fn test_poll_processes_disc_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = watcher(dir.path(), FakeRipper::with_disc("Demo_S1_D1", &[44, 44, 2]));
        let shutdown = AtomicBool::new(false);

        assert_eq!(w.poll_once(&shutdown).unwrap(), 1);
        let season = dir.path().join("library/TV Shows/Demo Show (2004)/Season 01");
        assert!(season.join("Demo Show - S01E01.mkv").exists());
        assert!(season.join("Demo Show - S01E02.mkv").exists());
        assert_eq!(*w.ripper.ejected.borrow(), vec![0]);
        assert_eq!(
            w.engine().store().get_existing("Demo Show").unwrap().next_episode,
            3
        );

        // same disc still in the drive: ignored
        assert_eq!(w.poll_once(&shutdown).unwrap(), 0);
        assert_eq!(*w.ripper.rips.borrow(), 1);

        // drive empties, a new disc arrives
        w.ripper.drives.borrow_mut()[0].disc_label = None;
        w.poll_once(&shutdown).unwrap();
        w.ripper.drives.borrow_mut()[0].disc_label = Some("Demo_S1_D2".to_string());
        assert_eq!(w.poll_once(&shutdown).unwrap(), 1);
        assert!(season.join("Demo Show - S01E04.mkv").exists());
    }

    #[test]
    fn test_shutdown_checked_before_disc() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = watcher(dir.path(), FakeRipper::with_disc("Demo_S1_D1", &[44]));
        let shutdown = AtomicBool::new(true);
        assert_eq!(w.poll_once(&shutdown).unwrap(), 0);
        assert_eq!(*w.ripper.rips.borrow(), 0);
    }

    #[test]
    fn test_second_interrupt_is_reported() {
        let flag = AtomicBool::new(false);
        assert!(!request_stop(&flag));
        assert!(flag.load(Ordering::SeqCst));
        assert!(request_stop(&flag));
    }

    #[test]
    fn test_run_returns_once_stop_is_requested() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = watcher(dir.path(), FakeRipper::with_disc("Demo_S1_D1", &[44]));
        let shutdown = Arc::new(AtomicBool::new(false));
        request_stop(&shutdown);
        w.run(shutdown).unwrap();
        assert_eq!(*w.ripper.rips.borrow(), 0);
    }

    #[test]
    fn test_process_drive() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = watcher(dir.path(), FakeRipper::with_disc("Demo_S1_D1", &[44]));
        assert_eq!(w.process_drive(0).unwrap(), DiscOutcome::Done);
        assert!(w.process_drive(3).is_err());

        w.ripper.drives.borrow_mut()[0].disc_label = None;
        assert!(w.process_drive(0).is_err());
        assert_eq!(*w.ripper.rips.borrow(), 1);
    }

    #[test]
    fn test_persistence_failure_retries_and_escalates() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = watcher(dir.path(), FakeRipper::with_disc("Demo_S1_D1", &[44]));
        w.engine
            .store()
            .database()
            .conn
            .execute_batch("DROP TABLE series_state")
            .unwrap();
        let shutdown = AtomicBool::new(false);

        for _ in 0..ESCALATE_AFTER {
            assert_eq!(w.poll_once(&shutdown).unwrap(), 0);
        }
        assert!(w.escalated());
        assert!(w.handled.is_empty());
        assert!(w.ripper.ejected.borrow().is_empty());
    }
}
