//! Course orchestrator
//!
//! Every piece of concurrent work of a run (a sub-folder, a large file, an
//! announcement or homework branch) is a *unit* spawned on one shared
//! [`TaskTracker`]. Units never wait for each other; [`Archiver::run`] waits for
//! all of them at once, which is the barrier the record store flush relies on.
//!
//! A [`Semaphore`] bounds how many units run at the same time. A fatal record
//! store error in any unit cancels the run: units that have not started yet
//! return immediately and the error is handed back to the caller.

mod tree;

use std::{
    fmt,
    future::Future,
    path::{Path, PathBuf},
    pin::Pin,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use reqwest::Url;
use tokio::sync::Semaphore;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::{
    config::Config,
    db::{RecordStore, StoreError, StoreHandle},
    downloader::{DownloadOutcome, Downloader},
    portal::{Course, Session},
    sanitize::sanitize_filename,
    scrape::{self, ScrapeContext, ScrapeError},
};

/// Page suffix and local folder of each branch
const CLASS_FILES: (&str, &str) = ("/SinifDosyalari", "Sınıf Dosyaları");
const COURSE_FILES: (&str, &str) = ("/DersDosyalari", "Ders Dosyaları");
pub(crate) const ANNOUNCEMENTS: (&str, &str) = ("/Duyurular", "Duyurular");
pub(crate) const HOMEWORK: (&str, &str) = ("/Odevler", "Ödevler");

type UnitFuture = Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send>>;

/// A piece of work that runs on its own task with its own store handle
#[derive(Debug, Clone)]
enum Unit {
    /// Walk a listing page into `destination`
    Folder { url: Url, destination: PathBuf },
    /// Fetch a single (large) file into `destination`
    File { url: Url, destination: PathBuf },
    Announcements { course: Course, destination: PathBuf },
    Homework { course: Course, destination: PathBuf },
}

impl Unit {
    fn kind(&self) -> &'static str {
        match self {
            Unit::Folder { .. } => "folder",
            Unit::File { .. } => "file",
            Unit::Announcements { .. } => "announcements",
            Unit::Homework { .. } => "homework",
        }
    }
}

/// Counters shared by every unit of a run
#[derive(Debug, Default)]
pub struct RunCounters {
    written_new: AtomicUsize,
    renamed_conflict: AtomicUsize,
    skipped_identical: AtomicUsize,
    skipped_recorded: AtomicUsize,
    failed: AtomicUsize,
    artifacts: AtomicUsize,
    pages_failed: AtomicUsize,
}

impl RunCounters {
    pub fn record(&self, outcome: &DownloadOutcome) {
        let counter = match outcome {
            DownloadOutcome::WrittenNew(_) => &self.written_new,
            DownloadOutcome::RenamedConflict(_) => &self.renamed_conflict,
            DownloadOutcome::SkippedIdentical(_) => &self.skipped_identical,
            DownloadOutcome::SkippedAlreadyRecorded => &self.skipped_recorded,
            DownloadOutcome::Failed(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// A text or postback file written by a scraper
    pub fn record_artifact(&self) {
        self.artifacts.fetch_add(1, Ordering::Relaxed);
    }

    /// A listing or detail page that could not be fetched
    pub fn record_page_failure(&self) {
        self.pages_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RunSummary {
        RunSummary {
            written_new: self.written_new.load(Ordering::Relaxed),
            renamed_conflict: self.renamed_conflict.load(Ordering::Relaxed),
            skipped_identical: self.skipped_identical.load(Ordering::Relaxed),
            skipped_recorded: self.skipped_recorded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            artifacts: self.artifacts.load(Ordering::Relaxed),
            pages_failed: self.pages_failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub written_new: usize,
    pub renamed_conflict: usize,
    pub skipped_identical: usize,
    pub skipped_recorded: usize,
    pub failed: usize,
    pub artifacts: usize,
    pub pages_failed: usize,
}

impl RunSummary {
    /// Files this run put on disk
    pub fn writes(&self) -> usize {
        self.written_new + self.renamed_conflict + self.artifacts
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} new, {} renamed, {} identical, {} already recorded, {} failed, {} notes, {} unreachable pages",
            self.written_new,
            self.renamed_conflict,
            self.skipped_identical,
            self.skipped_recorded,
            self.failed,
            self.artifacts,
            self.pages_failed
        )
    }
}

/// Drives the archival of a set of courses. Cheap to clone; clones share the
/// task registry, the concurrency bound and the cancellation state.
#[derive(Clone)]
pub struct Archiver {
    config: Arc<Config>,
    session: Session,
    downloader: Downloader,
    tracker: TaskTracker,
    permits: Arc<Semaphore>,
    cancel_token: CancellationToken,
    fatal: Arc<Mutex<Option<StoreError>>>,
    counters: Arc<RunCounters>,
}

impl fmt::Debug for Archiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Archiver")
            .field("root", &self.config.archive_root())
            .field("units", &self.tracker.len())
            .field("cancelled", &self.cancel_token.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Archiver {
    pub fn new(config: Arc<Config>, session: Session, store: Arc<RecordStore>) -> Self {
        let cancel_token = CancellationToken::new();
        let downloader = Downloader::new(
            session.client().clone(),
            store,
            &config.fetch,
            cancel_token.clone(),
        );
        let permits = Arc::new(Semaphore::new(config.fetch.max_concurrency.max(1)));

        Self {
            config,
            session,
            downloader,
            tracker: TaskTracker::new(),
            permits,
            cancel_token,
            fatal: Arc::new(Mutex::new(None)),
            counters: Arc::new(RunCounters::default()),
        }
    }

    /// Archive every course and wait until all spawned work has finished.
    ///
    /// Returns the first fatal store error if one occurred; the caller must
    /// not flush the store in that case.
    pub async fn run(&self, courses: &[Course]) -> Result<RunSummary, StoreError> {
        for course in courses {
            if self.cancel_token.is_cancelled() {
                break;
            }
            self.archive_course(course).await;
        }

        self.tracker.close();
        self.tracker.wait().await;
        debug!("All units finished");

        if let Some(error) = self.fatal.lock()?.take() {
            return Err(error);
        }
        Ok(self.counters.snapshot())
    }

    /// Kick off the four branches of one course
    async fn archive_course(&self, course: &Course) {
        let course_dir = self.config.archive_root().join(course.folder_name());
        info!(course = %course, dir = ?course_dir, "Archiving course");

        for (suffix, folder) in [CLASS_FILES, COURSE_FILES] {
            let Some(destination) = branch_dir(&course_dir, folder).await else {
                continue;
            };
            match self.session.resolve(&course.page_link(suffix)) {
                Ok(url) => self.spawn_unit(Unit::Folder { url, destination }),
                Err(e) => warn!(course = %course, error = %e, "Invalid course link, skipping branch"),
            }
        }

        if let Some(destination) = branch_dir(&course_dir, ANNOUNCEMENTS.1).await {
            self.spawn_unit(Unit::Announcements {
                course: course.clone(),
                destination,
            });
        }
        if let Some(destination) = branch_dir(&course_dir, HOMEWORK.1).await {
            self.spawn_unit(Unit::Homework {
                course: course.clone(),
                destination,
            });
        }
    }

    fn spawn_unit(&self, unit: Unit) {
        if self.cancel_token.is_cancelled() {
            return;
        }

        let span = info_span!("unit", kind = unit.kind());
        let archiver = self.clone();
        self.tracker.spawn(
            async move {
                let permit = tokio::select! {
                    _ = archiver.cancel_token.cancelled() => return,
                    permit = archiver.permits.clone().acquire_owned() => permit,
                };
                let Ok(_permit) = permit else {
                    return;
                };
                if archiver.cancel_token.is_cancelled() {
                    return;
                }

                if let Err(e) = archiver.run_unit(unit).await {
                    archiver.abort(e);
                }
            }
            .instrument(span),
        );
    }

    /// Each unit opens its own store handle and drops it when done
    fn run_unit(&self, unit: Unit) -> UnitFuture {
        let archiver = self.clone();
        Box::pin(async move {
            let handle = archiver.downloader.store().handle()?;
            match unit {
                Unit::Folder { url, destination } => {
                    archiver.traverse(&url, &destination, &handle).await
                }
                Unit::File { url, destination } => {
                    let outcome = archiver
                        .downloader
                        .fetch_file(&url, &destination, &handle)
                        .await?;
                    archiver.counters.record(&outcome);
                    Ok(())
                }
                Unit::Announcements {
                    course,
                    destination,
                } => {
                    let ctx = archiver.scrape_context(&handle);
                    finish_scrape(scrape::archive_announcements(&ctx, &course, &destination).await)
                }
                Unit::Homework {
                    course,
                    destination,
                } => {
                    let ctx = archiver.scrape_context(&handle);
                    finish_scrape(scrape::archive_homework(&ctx, &course, &destination).await)
                }
            }
        })
    }

    fn scrape_context<'a>(&'a self, handle: &'a StoreHandle) -> ScrapeContext<'a> {
        ScrapeContext {
            session: &self.session,
            downloader: &self.downloader,
            handle,
            counters: &self.counters,
            debug_dir: &self.config.debug_dir,
            dump_pages: self.config.debug,
        }
    }

    /// Record the first fatal error and stop the run
    fn abort(&self, error: StoreError) {
        error!(error = %error, "Fatal record store error, cancelling the run");
        match self.fatal.lock() {
            Ok(mut fatal) => {
                fatal.get_or_insert(error);
            }
            Err(poisoned) => {
                poisoned.into_inner().get_or_insert(error);
            }
        }
        self.cancel_token.cancel();
    }
}

async fn branch_dir(course_dir: &Path, folder: &str) -> Option<PathBuf> {
    let destination = course_dir.join(sanitize_filename(folder));
    match tokio::fs::create_dir_all(&destination).await {
        Ok(()) => Some(destination),
        Err(e) => {
            error!(error = %e, dir = ?destination, "Failed to create course folder, skipping branch");
            None
        }
    }
}

/// Scraper failures stay inside their branch, except for store errors
fn finish_scrape(result: Result<(), ScrapeError>) -> Result<(), StoreError> {
    match result {
        Ok(()) => Ok(()),
        Err(ScrapeError::Store(e)) => Err(e),
        Err(e) => {
            warn!(error = %e, "Branch abandoned");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{db::FlushReport, test_support::MockPortal};

    const COURSE_DIR: &str = "BLG 223E (CRN 21345)";

    fn course() -> Course {
        Course {
            code: "BLG 223E".to_string(),
            name: "Data Structures".to_string(),
            crn: "21345".to_string(),
            link: "/Sinif/1".to_string(),
        }
    }

    fn listing(rows: &[(&str, &str, &str, &str)]) -> String {
        let rows: String = rows
            .iter()
            .map(|(icon, href, name, size)| {
                format!(r#"<tr><td><img src="/images/ds/{icon}"/> <a href="{href}">{name}</a></td><td>{size}</td></tr>"#)
            })
            .collect();
        format!(
            r#"<div class="dosyaSistemi"><table class="data"><tr><th>Ad</th><th>Boyut</th></tr>{rows}</table></div>"#
        )
    }

    /// Three levels of class files, mixed sizes, the deepest file answering slowly
    fn portal() -> MockPortal {
        let portal = MockPortal::default();
        portal.html(
            "/Sinif/1/SinifDosyalari",
            &listing(&[
                ("folder.png", "/Sinif/1/SinifDosyalari?g10", "Hafta 1", ""),
                ("pdf.png", "/Sinif/1/SinifDosyalari?g11", "syllabus.pdf", "300 KB"),
                ("mp4.png", "/Sinif/1/SinifDosyalari?g12", "lecture.mp4", "50 MB"),
            ]),
        );
        portal.html(
            "/Sinif/1/SinifDosyalari?g10",
            &listing(&[
                ("folder.png", "/Sinif/1/SinifDosyalari?g20", "Ekler", ""),
                ("pdf.png", "/Sinif/1/SinifDosyalari?g21", "week1.pdf", "1 MB"),
            ]),
        );
        portal.html(
            "/Sinif/1/SinifDosyalari?g20",
            &listing(&[("zip.png", "/Sinif/1/SinifDosyalari?g30", "deep.zip", "20 KB")]),
        );
        portal.file("/Sinif/1/SinifDosyalari?g11", "syllabus.pdf", b"syllabus");
        portal.file("/Sinif/1/SinifDosyalari?g12", "lecture.mp4", b"video");
        portal.file("/Sinif/1/SinifDosyalari?g21", "week1.pdf", b"week one");
        portal.file("/Sinif/1/SinifDosyalari?g30", "deep.zip", b"deep");
        portal.delayed("/Sinif/1/SinifDosyalari?g30", Duration::from_millis(300));

        portal.html("/Sinif/1/DersDosyalari", &listing(&[]));
        portal.html(
            "/Sinif/1/Duyurular",
            r#"<div id="ctl00_ContentPlaceHolder1_pnlDuyurular"><div class="col-md-12">
                 <h4>Welcome</h4><span class="text-muted">01.02.2024</span>
                 <div class="panel-body">First lecture on Monday.</div>
               </div></div>"#,
        );
        portal.html("/Sinif/1/Odevler", "<html><body>Ödev yok</body></html>");
        portal
    }

    async fn setup(portal: &MockPortal, root: &Path, force: bool) -> (Archiver, Arc<RecordStore>) {
        let base = portal.serve().await;
        let config = Arc::new(Config::for_tests(root, base.as_str()));
        let store = Arc::new(RecordStore::open(root, force).unwrap());
        let archiver = Archiver::new(config, Session::anonymous(base), store.clone());
        (archiver, store)
    }

    #[tokio::test]
    async fn test_run_waits_for_the_whole_tree_before_returning() {
        let portal = portal();
        let dir = tempfile::tempdir().unwrap();
        let (archiver, store) = setup(&portal, dir.path(), false).await;

        let summary = archiver.run(&[course()]).await.unwrap();

        let class_files = dir.path().join(COURSE_DIR).join("Sınıf Dosyaları");
        assert_eq!(
            std::fs::read(class_files.join("Hafta 1").join("Ekler").join("deep.zip")).unwrap(),
            b"deep"
        );
        assert!(class_files.join("lecture.mp4").exists());
        assert!(dir.path().join(COURSE_DIR).join("Ders Dosyaları").is_dir());
        assert!(
            dir.path()
                .join(COURSE_DIR)
                .join("Duyurular")
                .join("2024-02-01 - Welcome.txt")
                .exists()
        );

        assert_eq!(summary.written_new, 4);
        assert_eq!(summary.artifacts, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(store.pending_len(), 4);
        assert_eq!(store.flush().unwrap(), FlushReport { recorded: 4, missing: 0 });
    }

    #[tokio::test]
    async fn test_second_run_writes_nothing() {
        let portal = portal();
        let dir = tempfile::tempdir().unwrap();
        {
            let (archiver, store) = setup(&portal, dir.path(), false).await;
            archiver.run(&[course()]).await.unwrap();
            store.flush().unwrap();
        }

        let (archiver, store) = setup(&portal, dir.path(), false).await;
        let summary = archiver.run(&[course()]).await.unwrap();

        assert_eq!(summary.writes(), 0);
        assert_eq!(summary.skipped_recorded, 4);
        assert_eq!(portal.hits("/Sinif/1/SinifDosyalari?g30"), 1);
        assert_eq!(portal.hits("/Sinif/1/SinifDosyalari?g12"), 1);
        assert_eq!(store.flush().unwrap(), FlushReport::default());
    }

    #[tokio::test]
    async fn test_forced_rescan_downloads_again_without_duplicating() {
        let portal = portal();
        let dir = tempfile::tempdir().unwrap();
        {
            let (archiver, store) = setup(&portal, dir.path(), false).await;
            archiver.run(&[course()]).await.unwrap();
            store.flush().unwrap();
        }

        let (archiver, _store) = setup(&portal, dir.path(), true).await;
        let summary = archiver.run(&[course()]).await.unwrap();

        assert_eq!(summary.writes(), 0);
        assert_eq!(summary.skipped_identical, 4);
        assert_eq!(portal.hits("/Sinif/1/SinifDosyalari?g30"), 2);
        let class_files = dir.path().join(COURSE_DIR).join("Sınıf Dosyaları");
        assert!(!class_files.join("syllabus_yeni.pdf").exists());
    }

    #[tokio::test]
    async fn test_store_failure_cancels_the_run() {
        let portal = portal();
        let dir = tempfile::tempdir().unwrap();
        let (archiver, store) = setup(&portal, dir.path(), false).await;
        std::fs::remove_file(store.path()).unwrap();

        let result = archiver.run(&[course()]).await;

        assert!(matches!(result, Err(StoreError::Connect { .. })));
        assert!(archiver.cancel_token.is_cancelled());
        assert_eq!(archiver.counters.snapshot().written_new, 0);
    }
}
