//! Streaming ZIP archive of an arbitrary set of files and directories.
//!
//! A bounded job queue feeds a fixed pool of worker tasks. File jobs are
//! compressed into the archive under their hierarchy path; directory jobs are
//! listed and every child becomes a new job. Children that do not fit in the
//! queue are spilled to a local list drained by a background task, so a
//! worker never blocks on a full queue and memory never grows with the depth
//! of the tree.
//!
//! The archive is written in ZIP streaming mode (data descriptors, no seeks)
//! into a staging buffer that is flushed to the async sink after every write.
//! A failed sink write sets the shared cancellation flag: scanning stops
//! offering children, workers discard queued jobs without opening them, and
//! the pipeline goes straight to finalize-and-close.
//!
//! Termination is tracked by an outstanding-job counter covering queued,
//! spilled, in-flight and not-yet-seeded jobs. When it reaches zero the
//! queue is closed and the workers exit.

use std::collections::VecDeque;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::{debug, error, warn};
use zip::write::{SimpleFileOptions, StreamWriter};
use zip::{CompressionMethod, ZipWriter};

use crate::config::ArchiveConfig;

const FAILURE_HEADER: &str = "Those files could not be archived:";
const MAX_COMMENT: usize = u16::MAX as usize;

/// Pipeline tuning.
#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    pub queue_capacity: usize,
    pub workers: usize,
    pub chunk_size: usize,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            workers: 4,
            chunk_size: 32 * 1024,
        }
    }
}

impl From<&ArchiveConfig> for ArchiveOptions {
    fn from(config: &ArchiveConfig) -> Self {
        Self {
            queue_capacity: config.queue_capacity,
            workers: config.workers,
            chunk_size: config.chunk_size,
        }
    }
}

/// Outcome of one archive run.
#[derive(Debug, Clone, Default)]
pub struct ArchiveReport {
    /// Files fully written into the archive.
    pub entries: usize,
    /// Paths that could not be archived, in the order they were recorded.
    pub failures: Vec<String>,
    /// Jobs dropped without being processed after cancellation.
    pub skipped: usize,
    /// A write into the archive sink failed.
    pub cancelled: bool,
}

struct Job {
    path: PathBuf,
    /// Entry-name segments from the archive root, taken verbatim from
    /// directory entries.
    hierarchy: Vec<String>,
    is_dir: bool,
}

#[derive(Default)]
struct QueueState {
    jobs: VecDeque<Job>,
    outstanding: usize,
    closed: bool,
    failures: Vec<String>,
    skipped: usize,
}

/// Queue and failure list share one lock. The cancellation flag is read
/// without it.
struct Shared {
    state: Mutex<QueueState>,
    capacity: usize,
    cancelled: AtomicBool,
    job_ready: Notify,
    space_ready: Notify,
    entries: AtomicUsize,
}

impl Shared {
    fn new(capacity: usize, outstanding: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                outstanding,
                closed: outstanding == 0,
                ..QueueState::default()
            }),
            capacity: capacity.max(1),
            cancelled: AtomicBool::new(false),
            job_ready: Notify::new(),
            space_ready: Notify::new(),
            entries: AtomicUsize::new(0),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            debug!("archive cancelled");
        }
        self.space_ready.notify_waiters();
        self.job_ready.notify_waiters();
    }

    fn fail(&self, path: &Path, err: &dyn std::fmt::Display) {
        debug!(path = %path.display(), "not archived: {err}");
        self.state.lock().failures.push(path.display().to_string());
    }

    /// A job ended without being processed.
    fn skip(&self) {
        self.state.lock().skipped += 1;
        self.finish_one();
    }

    /// A job left the system. Closes the queue once nothing is outstanding.
    fn finish_one(&self) {
        let mut state = self.state.lock();
        state.outstanding -= 1;
        if state.outstanding == 0 {
            state.closed = true;
            drop(state);
            self.job_ready.notify_waiters();
        }
    }

    /// Count a new child job and queue it if there is room. Hands the job
    /// back when the queue is full; it stays counted as outstanding.
    fn offer(&self, job: Job) -> Result<(), Job> {
        let mut state = self.state.lock();
        state.outstanding += 1;
        if state.jobs.len() < self.capacity {
            state.jobs.push_back(job);
            drop(state);
            self.job_ready.notify_one();
            Ok(())
        } else {
            Err(job)
        }
    }

    /// Queue an already-counted job, waiting for space. Returns `false` if
    /// the run was cancelled first; the job is then dropped.
    async fn push_wait(&self, job: Job) -> bool {
        loop {
            let notified = self.space_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_cancelled() {
                return false;
            }
            {
                let mut state = self.state.lock();
                if state.jobs.len() < self.capacity {
                    state.jobs.push_back(job);
                    drop(state);
                    self.job_ready.notify_one();
                    return true;
                }
            }
            notified.await;
        }
    }

    /// Next job, or `None` once the queue is closed and empty.
    async fn pop(&self) -> Option<Job> {
        loop {
            let notified = self.job_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(job) = state.jobs.pop_front() {
                    drop(state);
                    self.space_ready.notify_one();
                    return Some(job);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }
}

/// In-memory target of the ZIP writer. Drained into the async sink after
/// every write.
#[derive(Clone, Default)]
struct Staging(Arc<Mutex<Vec<u8>>>);

impl Write for Staging {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

struct Archive<W> {
    zip: ZipWriter<StreamWriter<Staging>>,
    staging: Staging,
    sink: W,
}

impl<W: AsyncWrite + Unpin> Archive<W> {
    fn new(sink: W) -> Self {
        let staging = Staging::default();
        Self {
            zip: ZipWriter::new_stream(staging.clone()),
            staging,
            sink,
        }
    }

    async fn drain(&mut self) -> std::io::Result<()> {
        let pending = std::mem::take(&mut *self.staging.0.lock());
        if pending.is_empty() {
            return Ok(());
        }
        self.sink.write_all(&pending).await
    }

    /// Write the central directory (with the failure comment), then flush
    /// and close the sink. The sink is shut down even when earlier steps fail.
    async fn finalize(self, failures: &[String]) {
        let Archive {
            mut zip,
            staging,
            mut sink,
        } = self;
        if !failures.is_empty() {
            if let Err(e) = zip.set_comment(failure_comment(failures)) {
                warn!("archive comment rejected: {e}");
            }
        }
        if let Err(e) = zip.finish() {
            warn!("failed to finish archive: {e}");
        }
        let pending = std::mem::take(&mut *staging.0.lock());
        if !pending.is_empty() {
            if let Err(e) = sink.write_all(&pending).await {
                debug!("archive trailer not delivered: {e}");
            }
        }
        let _ = sink.flush().await;
        if let Err(e) = sink.shutdown().await {
            debug!("archive sink shutdown: {e}");
        }
    }
}

fn failure_comment(failures: &[String]) -> String {
    let mut comment = format!("{FAILURE_HEADER}\n{}", failures.join("\n"));
    if comment.len() > MAX_COMMENT {
        let mut cut = MAX_COMMENT;
        while !comment.is_char_boundary(cut) {
            cut -= 1;
        }
        comment.truncate(cut);
    }
    comment
}

/// Archive `paths` into `sink` as one ZIP stream.
///
/// Each input path becomes a top-level entry named after its last component;
/// directories contribute their whole subtree. Unreadable items are listed
/// in the archive comment and in the report. The sink is always shut down
/// before this returns.
pub async fn archive_paths<W>(paths: Vec<PathBuf>, sink: W, options: &ArchiveOptions) -> ArchiveReport
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let shared = Arc::new(Shared::new(options.queue_capacity, paths.len()));
    let archive = Arc::new(tokio::sync::Mutex::new(Archive::new(sink)));

    let mut head = paths;
    let tail = head.split_off(head.len().min(shared.capacity));
    for path in head {
        seed(&shared, path).await;
    }
    if !tail.is_empty() {
        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            for path in tail {
                seed(&shared, path).await;
            }
        });
    }

    let chunk_size = options.chunk_size.max(1);
    let workers: Vec<_> = (0..options.workers.max(1))
        .map(|_| {
            let shared = Arc::clone(&shared);
            let archive = Arc::clone(&archive);
            tokio::spawn(async move { work(&shared, &archive, chunk_size).await })
        })
        .collect();
    for worker in workers {
        if let Err(e) = worker.await {
            error!("archive worker failed: {e}");
        }
    }

    let (failures, skipped) = {
        let state = shared.state.lock();
        (state.failures.clone(), state.skipped)
    };
    match Arc::try_unwrap(archive) {
        Ok(archive) => archive.into_inner().finalize(&failures).await,
        Err(_) => error!("archive writer still shared after workers exited"),
    }

    ArchiveReport {
        entries: shared.entries.load(Ordering::SeqCst),
        failures,
        skipped,
        cancelled: shared.is_cancelled(),
    }
}

async fn seed(shared: &Arc<Shared>, path: PathBuf) {
    if shared.is_cancelled() {
        shared.skip();
        return;
    }
    match tokio::fs::metadata(&path).await {
        Ok(meta) => {
            let job = Job {
                hierarchy: vec![root_name(&path)],
                path,
                is_dir: meta.is_dir(),
            };
            if !shared.push_wait(job).await {
                shared.skip();
            }
        }
        Err(e) => {
            shared.fail(&path, &e);
            shared.finish_one();
        }
    }
}

fn root_name(path: &Path) -> String {
    path.file_name().map_or_else(
        || {
            let trimmed = path.to_string_lossy().trim_matches(['/', '\\']).to_string();
            if trimmed.is_empty() {
                "root".to_string()
            } else {
                trimmed
            }
        },
        |n| n.to_string_lossy().into_owned(),
    )
}

async fn work<W>(shared: &Arc<Shared>, archive: &tokio::sync::Mutex<Archive<W>>, chunk_size: usize)
where
    W: AsyncWrite + Unpin + Send,
{
    while let Some(job) = shared.pop().await {
        if shared.is_cancelled() {
            shared.skip();
            continue;
        }
        if job.is_dir {
            scan_dir(shared, job).await;
            shared.finish_one();
        } else {
            append_file(shared, archive, job, chunk_size).await;
        }
    }
}

async fn scan_dir(shared: &Arc<Shared>, job: Job) {
    let mut read_dir = match tokio::fs::read_dir(&job.path).await {
        Ok(rd) => rd,
        Err(e) => {
            shared.fail(&job.path, &e);
            return;
        }
    };

    let mut spill = Vec::new();
    while !shared.is_cancelled() {
        let entry = match read_dir.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                shared.fail(&job.path, &e);
                break;
            }
        };
        // file_type() does not follow symlinks; links are archived as files.
        let is_dir = match entry.file_type().await {
            Ok(t) => t.is_dir(),
            Err(e) => {
                shared.fail(&entry.path(), &e);
                continue;
            }
        };
        let mut hierarchy = job.hierarchy.clone();
        hierarchy.push(entry.file_name().to_string_lossy().into_owned());
        let child = Job {
            path: entry.path(),
            hierarchy,
            is_dir,
        };
        if let Err(child) = shared.offer(child) {
            spill.push(child);
        }
    }

    if !spill.is_empty() {
        debug!(path = %job.path.display(), spilled = spill.len(), "queue full, draining in background");
        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            for child in spill {
                if !shared.push_wait(child).await {
                    shared.skip();
                }
            }
        });
    }
}

/// Append one file. The archive lock is held from the cancellation check
/// through the last byte, so no file is opened once a sink failure has been
/// observed.
async fn append_file<W>(shared: &Shared, archive: &tokio::sync::Mutex<Archive<W>>, job: Job, chunk_size: usize)
where
    W: AsyncWrite + Unpin + Send,
{
    let mut archive = archive.lock().await;
    if shared.is_cancelled() {
        drop(archive);
        shared.skip();
        return;
    }
    append_locked(shared, &mut archive, &job, chunk_size).await;
    drop(archive);
    shared.finish_one();
}

async fn append_locked<W>(shared: &Shared, archive: &mut Archive<W>, job: &Job, chunk_size: usize)
where
    W: AsyncWrite + Unpin + Send,
{
    let mut file = match File::open(&job.path).await {
        Ok(f) => f,
        Err(e) => {
            shared.fail(&job.path, &e);
            return;
        }
    };
    let (large, mode) = match file.metadata().await {
        Ok(meta) => (meta.len() >= u64::from(u32::MAX), meta.permissions().mode()),
        Err(_) => (false, 0o644),
    };
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(mode)
        .large_file(large);
    if let Err(e) = archive.zip.start_file(job.hierarchy.join("/"), options) {
        shared.fail(&job.path, &e);
        return;
    }
    if let Err(e) = archive.drain().await {
        shared.fail(&job.path, &e);
        shared.cancel();
        return;
    }

    let mut buf = vec![0u8; chunk_size];
    loop {
        let n = match file.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                shared.fail(&job.path, &e);
                return;
            }
        };
        let written = match archive.zip.write_all(&buf[..n]) {
            Ok(()) => archive.drain().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            shared.fail(&job.path, &e);
            shared.cancel();
            return;
        }
    }
    shared.entries.fetch_add(1, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io::{Cursor, Read};
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::AsyncReadExt;

    async fn run(paths: Vec<PathBuf>, options: ArchiveOptions) -> (ArchiveReport, Vec<u8>) {
        let (mut rx, tx) = tokio::io::duplex(8 * 1024);
        let task = tokio::spawn(async move { archive_paths(paths, tx, &options).await });
        let mut bytes = Vec::new();
        rx.read_to_end(&mut bytes).await.unwrap();
        (task.await.unwrap(), bytes)
    }

    fn read_entry(zip: &mut zip::ZipArchive<Cursor<Vec<u8>>>, name: &str) -> Vec<u8> {
        let mut out = Vec::new();
        zip.by_name(name).unwrap().read_to_end(&mut out).unwrap();
        out
    }

    fn entry_names(zip: &zip::ZipArchive<Cursor<Vec<u8>>>) -> HashSet<String> {
        zip.file_names().map(|name| name.unwrap().into_owned()).collect()
    }

    /// Incompressible bytes so the archive outgrows the pipe buffer.
    fn noise(seed: u64, len: usize) -> Vec<u8> {
        let mut x = seed;
        (0..len)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                (x >> 24) as u8
            })
            .collect()
    }

    /// Sink that fails every write after `budget` bytes and records shutdown.
    struct FailingSink {
        budget: usize,
        shut: Arc<AtomicBool>,
    }

    impl AsyncWrite for FailingSink {
        fn poll_write(mut self: Pin<&mut Self>, _: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
            if self.budget == 0 {
                return Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()));
            }
            let n = buf.len().min(self.budget);
            self.budget -= n;
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            self.shut.store(true, Ordering::SeqCst);
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_files_are_archived_byte_exact() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Vec::new();
        let mut expected = Vec::new();
        for i in 0..12u32 {
            let path = dir.path().join(format!("f{i}.bin"));
            let data: Vec<u8> = (0..i * 5000).map(|b| (b % 253) as u8).collect();
            std::fs::write(&path, &data).unwrap();
            paths.push(path);
            expected.push((format!("f{i}.bin"), data));
        }

        let (report, bytes) = run(paths, ArchiveOptions::default()).await;
        assert_eq!(report.entries, 12);
        assert!(report.failures.is_empty());
        assert!(!report.cancelled);

        let mut zip = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(zip.len(), 12);
        for (name, data) in expected {
            assert_eq!(read_entry(&mut zip, &name), data, "{name}");
        }
        assert!(zip.comment().is_empty());
    }

    #[tokio::test]
    async fn test_directory_hierarchy_names() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("proj");
        std::fs::create_dir_all(root.join("src/deep")).unwrap();
        std::fs::write(root.join("README"), b"readme").unwrap();
        std::fs::write(root.join("src/main.rs"), b"fn main() {}").unwrap();
        std::fs::write(root.join("src/deep/x"), b"x").unwrap();

        let (report, bytes) = run(vec![root], ArchiveOptions::default()).await;
        assert_eq!(report.entries, 3);

        let mut zip = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        let names = entry_names(&zip);
        let want: HashSet<String> = ["proj/README", "proj/src/main.rs", "proj/src/deep/x"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(names, want);
        assert_eq!(read_entry(&mut zip, "proj/src/main.rs"), b"fn main() {}");
    }

    #[tokio::test]
    async fn test_two_hundred_inputs_processed_once() {
        let dir = tempfile::tempdir().unwrap();
        let paths: Vec<PathBuf> = (0..200)
            .map(|i| {
                let p = dir.path().join(format!("n{i:03}"));
                std::fs::write(&p, i.to_string()).unwrap();
                p
            })
            .collect();

        let (report, bytes) = run(paths, ArchiveOptions::default()).await;
        assert_eq!(report.entries, 200);
        assert_eq!(report.skipped, 0);

        let mut zip = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        let names = entry_names(&zip);
        assert_eq!(zip.len(), 200);
        assert_eq!(names.len(), 200);
        assert_eq!(read_entry(&mut zip, "n137"), b"137");
    }

    #[tokio::test]
    async fn test_spill_when_directory_exceeds_queue() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("many");
        std::fs::create_dir(&root).unwrap();
        for i in 0..200 {
            std::fs::write(root.join(format!("c{i}")), [i as u8]).unwrap();
        }
        let options = ArchiveOptions {
            queue_capacity: 8,
            workers: 3,
            chunk_size: 16,
        };

        let (report, bytes) = run(vec![root], options).await;
        assert_eq!(report.entries, 200);
        let zip = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        let names = entry_names(&zip);
        assert_eq!(names.len(), 200);
        assert!(names.contains("many/c199"));
    }

    #[tokio::test]
    async fn test_failures_listed_in_comment() {
        let dir = tempfile::tempdir().unwrap();
        let ok = dir.path().join("ok.txt");
        std::fs::write(&ok, b"fine").unwrap();
        let missing = dir.path().join("missing.txt");

        let (report, bytes) = run(vec![ok, missing.clone()], ArchiveOptions::default()).await;
        assert_eq!(report.entries, 1);
        assert_eq!(report.failures, vec![missing.display().to_string()]);

        let zip = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(zip.len(), 1);
        let comment = String::from_utf8(zip.comment().to_vec()).unwrap();
        assert_eq!(
            comment,
            format!("Those files could not be archived:\n{}", missing.display())
        );
    }

    #[tokio::test]
    async fn test_empty_input_is_valid_archive() {
        let (report, bytes) = run(Vec::new(), ArchiveOptions::default()).await;
        assert_eq!(report.entries, 0);
        let zip = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(zip.len(), 0);
    }

    #[tokio::test]
    async fn test_sink_failure_cancels_and_closes() {
        let dir = tempfile::tempdir().unwrap();
        let paths: Vec<PathBuf> = (0..150)
            .map(|i| {
                let p = dir.path().join(format!("f{i}"));
                std::fs::write(&p, vec![1u8; 4096]).unwrap();
                p
            })
            .collect();
        let shut = Arc::new(AtomicBool::new(false));
        let sink = FailingSink {
            budget: 0,
            shut: Arc::clone(&shut),
        };

        let report = archive_paths(paths, sink, &ArchiveOptions::default()).await;
        assert!(report.cancelled);
        assert_eq!(report.entries, 0);
        // Only the file whose write hit the broken sink was ever opened.
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.skipped, 149);
        assert!(shut.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_reader_dropped_midway_cancels() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("tree");
        std::fs::create_dir(&root).unwrap();
        for i in 0..40u64 {
            std::fs::write(root.join(format!("f{i}")), noise(i + 1, 20_000)).unwrap();
        }
        let (mut rx, tx) = tokio::io::duplex(1024);
        let task = tokio::spawn(async move { archive_paths(vec![root], tx, &ArchiveOptions::default()).await });
        let mut first = [0u8; 512];
        rx.read_exact(&mut first).await.unwrap();
        drop(rx);

        let report = task.await.unwrap();
        assert!(report.cancelled);
        assert!(!report.failures.is_empty());
        assert!(report.entries < 40);
    }

    #[test]
    fn test_failure_comment_is_bounded() {
        let failures: Vec<String> = (0..10_000).map(|i| format!("/very/long/path/{i}")).collect();
        let comment = failure_comment(&failures);
        assert!(comment.len() <= MAX_COMMENT);
        assert!(comment.starts_with("Those files could not be archived:\n/very/long/path/0\n"));
    }
}
