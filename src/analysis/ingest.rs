//! Live ingestion
//!
//! A background task feeds a [`LiveAnalysis`] while a scan runs and publishes
//! a fresh [`AnalysisSnapshot`] on a `watch` channel after every sample.
//! Readers poll the watch receiver on their own cadence; they never touch the
//! analysis state directly.
//!
//! Two sources are supported:
//!
//! - **direct**: samples arrive on an in-memory channel
//! - **file-tail**: the scan log is followed line by line with [`follow`]
//!
//! Both stop cooperatively through an [`AbortFlag`]: once it is set the task
//! consumes whatever is already available and then returns.

use crate::analysis::live::{AnalysisSnapshot, LiveAnalysis, PeakStats, Sample};
use crate::scan::abort::AbortFlag;
use crate::scan::log_file::LogLayout;
use futures::stream::{self, Stream, StreamExt};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// What an ingestion task consumed
#[derive(Debug)]
pub struct IngestOutcome {
    /// Final analysis state
    pub analysis: LiveAnalysis,
    /// `#` header lines seen in the scan log
    pub headers: Vec<String>,
    /// Samples consumed
    pub samples: usize,
    /// Why ingestion ended early, if it did
    pub error: Option<String>,
}

/// Handle to a running ingestion task
pub struct Ingestion {
    cancel: AbortFlag,
    snapshots: watch::Receiver<AnalysisSnapshot>,
    task: JoinHandle<IngestOutcome>,
}

impl Ingestion {
    /// Latest published snapshot
    pub fn snapshot(&self) -> AnalysisSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Sample count and raw-series statistics of the latest snapshot
    pub fn stats(&self) -> (usize, PeakStats) {
        let snapshot = self.snapshots.borrow();
        (snapshot.len(), snapshot.raw)
    }

    /// A receiver notified on every new snapshot
    pub fn subscribe(&self) -> watch::Receiver<AnalysisSnapshot> {
        self.snapshots.clone()
    }

    /// Ask the task to finish after draining what is already available
    pub fn cancel(&self) {
        self.cancel.set();
    }

    /// Cancel and wait for the task
    pub async fn finish(self) -> IngestOutcome {
        self.cancel.set();
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => IngestOutcome {
                analysis: LiveAnalysis::default(),
                headers: Vec::new(),
                samples: 0,
                error: Some(format!("ingestion task failed: {e}")),
            },
        }
    }
}

/// Consume samples from an in-memory channel.
///
/// The task ends when every sender is dropped, or when cancelled and the
/// channel holds nothing more.
pub fn spawn_direct(
    analysis: LiveAnalysis,
    mut samples: mpsc::UnboundedReceiver<Sample>,
    poll: Duration,
) -> Ingestion {
    let cancel = AbortFlag::new();
    let (tx, rx) = watch::channel(analysis.snapshot());
    let flag = cancel.clone();

    let task = tokio::spawn(async move {
        let mut analysis = analysis;
        let mut count = 0;
        loop {
            match tokio::time::timeout(poll, samples.recv()).await {
                Ok(Some(sample)) => {
                    analysis.push_sample(sample);
                    count += 1;
                    tx.send_replace(analysis.snapshot());
                }
                Ok(None) => break,
                Err(_) if flag.is_set() => {
                    while let Ok(sample) = samples.try_recv() {
                        analysis.push_sample(sample);
                        count += 1;
                    }
                    tx.send_replace(analysis.snapshot());
                    break;
                }
                Err(_) => {}
            }
        }
        debug!(samples = count, "direct ingestion finished");
        IngestOutcome {
            analysis,
            headers: Vec::new(),
            samples: count,
            error: None,
        }
    });

    Ingestion {
        cancel,
        snapshots: rx,
        task,
    }
}

struct Follower {
    reader: BufReader<File>,
    partial: String,
    cancel: AbortFlag,
    poll: Duration,
}

impl Follower {
    async fn next_line(&mut self) -> Option<io::Result<String>> {
        loop {
            let mut chunk = String::new();
            match self.reader.read_line(&mut chunk).await {
                Ok(0) => {
                    if self.cancel.is_set() {
                        if self.partial.is_empty() {
                            return None;
                        }
                        return Some(Ok(std::mem::take(&mut self.partial)));
                    }
                    tokio::time::sleep(self.poll).await;
                }
                Ok(_) => {
                    self.partial.push_str(&chunk);
                    if self.partial.ends_with('\n') {
                        let line = std::mem::take(&mut self.partial);
                        return Some(Ok(line.trim_end_matches(['\n', '\r']).to_string()));
                    }
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Follow a growing file, yielding complete lines as they are written.
///
/// EOF is never an error: the stream sleeps for `poll` and retries. A line
/// written in several pieces is yielded once it is complete. After `cancel`
/// is set the stream ends at the next EOF, yielding any trailing partial line
/// first.
pub fn follow(file: File, cancel: AbortFlag, poll: Duration) -> impl Stream<Item = io::Result<String>> {
    let follower = Follower {
        reader: BufReader::new(file),
        partial: String::new(),
        cancel,
        poll,
    };
    stream::unfold(follower, |mut f| async move {
        f.next_line().await.map(|line| (line, f))
    })
}

/// Tail a scan log.
///
/// Waits up to `startup_timeout` for the file to appear, then follows it
/// until cancelled.
pub fn spawn_file_tail(
    path: PathBuf,
    layout: LogLayout,
    analysis: LiveAnalysis,
    poll: Duration,
    startup_timeout: Duration,
) -> Ingestion {
    let cancel = AbortFlag::new();
    let (tx, rx) = watch::channel(analysis.snapshot());
    let flag = cancel.clone();

    let task = tokio::spawn(async move {
        let mut outcome = IngestOutcome {
            analysis,
            headers: Vec::new(),
            samples: 0,
            error: None,
        };

        let file = match open_when_ready(&path, &flag, poll, startup_timeout).await {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %path.display(), "scan log unavailable: {e}");
                outcome.error = Some(e.to_string());
                return outcome;
            }
        };

        let lines = follow(file, flag, poll);
        futures::pin_mut!(lines);
        while let Some(line) = lines.next().await {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!(path = %path.display(), "scan log read failed: {e}");
                    outcome.error = Some(e.to_string());
                    break;
                }
            };
            if line.starts_with('#') {
                outcome.headers.push(line);
                continue;
            }
            match layout.parse_line(&line) {
                Some(sample) => {
                    outcome.analysis.push_sample(sample);
                    outcome.samples += 1;
                    tx.send_replace(outcome.analysis.snapshot());
                }
                None if line.trim().is_empty() => {}
                None => debug!(line = %line, "skipping malformed scan log line"),
            }
        }
        debug!(samples = outcome.samples, "file-tail ingestion finished");
        outcome
    });

    Ingestion {
        cancel,
        snapshots: rx,
        task,
    }
}

async fn open_when_ready(
    path: &Path,
    cancel: &AbortFlag,
    poll: Duration,
    startup_timeout: Duration,
) -> io::Result<File> {
    let deadline = Instant::now() + startup_timeout;
    loop {
        match File::open(path).await {
            Ok(file) => return Ok(file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if cancel.is_set() || Instant::now() >= deadline {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("{} did not appear within {:?}", path.display(), startup_timeout),
                    ));
                }
                tokio::time::sleep(poll).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::live::AnalysisOptions;
    use crate::scan::params::ScanDim;
    use tokio::io::AsyncWriteExt;

    const POLL: Duration = Duration::from_millis(5);

    #[tokio::test]
    async fn test_follow_reassembles_partial_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.txt");
        let mut writer = tokio::fs::File::create(&path).await.unwrap();
        writer.write_all(b"# header\n1 2").await.unwrap();
        writer.flush().await.unwrap();

        let cancel = AbortFlag::new();
        let mut lines = Box::pin(follow(File::open(&path).await.unwrap(), cancel.clone(), POLL));
        assert_eq!(lines.next().await.unwrap().unwrap(), "# header");

        let reader = tokio::spawn(async move {
            let mut rest = Vec::new();
            while let Some(line) = lines.next().await {
                rest.push(line.unwrap());
            }
            rest
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        writer.write_all(b"0\n3 4").await.unwrap();
        writer.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.set();

        // The trailing partial line is delivered on cancel.
        assert_eq!(reader.await.unwrap(), vec!["1 20", "3 4"]);
    }

    #[tokio::test]
    async fn test_direct_ingestion_publishes_snapshots() {
        let (tx, rx) = mpsc::unbounded_channel();
        let ingestion = spawn_direct(LiveAnalysis::new(AnalysisOptions::default()), rx, POLL);
        let mut updates = ingestion.subscribe();

        tx.send(Sample::line(0.0, 1.0)).unwrap();
        updates.changed().await.unwrap();
        assert_eq!(updates.borrow().len(), 1);

        for i in 1..5 {
            tx.send(Sample::line(i as f64, 1.0 + i as f64)).unwrap();
        }
        drop(tx);
        let outcome = ingestion.finish().await;
        assert_eq!(outcome.samples, 5);
        assert_eq!(outcome.analysis.len(), 5);
    }

    #[tokio::test]
    async fn test_file_tail_collects_headers_and_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.txt");
        let layout = LogLayout {
            dim: ScanDim::OneD,
            ratio: false,
        };
        let ingestion = spawn_file_tail(
            path.clone(),
            layout,
            LiveAnalysis::new(AnalysisOptions::default()),
            POLL,
            Duration::from_secs(2),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut writer = tokio::fs::File::create(&path).await.unwrap();
        writer
            .write_all(b"# scan_id: test\n0 1\n0.5 3\nbad line\n1 2\n")
            .await
            .unwrap();
        writer.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let outcome = ingestion.finish().await;
        assert!(outcome.error.is_none());
        assert_eq!(outcome.headers, vec!["# scan_id: test"]);
        assert_eq!(outcome.samples, 3);
        assert_eq!(outcome.analysis.snapshot().y, vec![1.0, 3.0, 2.0]);
    }

    #[tokio::test]
    async fn test_file_tail_startup_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let ingestion = spawn_file_tail(
            dir.path().join("never.txt"),
            LogLayout {
                dim: ScanDim::OneD,
                ratio: false,
            },
            LiveAnalysis::default(),
            POLL,
            Duration::from_millis(30),
        );
        tokio::time::sleep(Duration::from_millis(60)).await;
        let outcome = ingestion.finish().await;
        assert!(outcome.error.is_some());
        assert_eq!(outcome.samples, 0);
    }
}
