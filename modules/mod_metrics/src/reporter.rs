use crate::MetricsCollector;
use chrono::{Local, NaiveDate};
use flux_traits::Stats;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Appends stats snapshots to `stats_YYYY-MM-DD.log` in a directory.
/// A new local date starts a new file; nothing is pruned.
#[derive(Debug, Clone)]
pub struct StatsReporter {
    dir: PathBuf,
}

impl StatsReporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("stats_{}.log", date.format("%Y-%m-%d")))
    }

    pub fn render(stats: &Stats) -> String {
        format!(
            "Active Connections: {}\nTotal Bytes: {}\nAverage Latency: {:.6}\n",
            stats.active_connections, stats.total_bytes, stats.average_latency_ms
        )
    }

    pub async fn append(&self, stats: &Stats, date: NaiveDate) -> io::Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_for(date))
            .await?;
        file.write_all(Self::render(stats).as_bytes()).await?;
        file.flush().await
    }

    /// Spawns the once-per-`interval` reporting loop. Persistence failures
    /// are logged and skipped; the loop only ends on cancellation.
    pub fn spawn(
        self,
        collector: Arc<MetricsCollector>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("StatsReporter: writing snapshots to {}", self.dir().display());
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let stats = collector.get_stats();
                        let today = Local::now().date_naive();
                        if let Err(e) = self.append(&stats, today).await {
                            error!("StatsReporter: failed to write {}: {}", self.file_for(today).display(), e);
                        }
                    }
                }
            }

            info!("StatsReporter: stopped.");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn renders_the_three_line_record() {
        let stats = Stats {
            active_connections: 3,
            total_connections: 9,
            total_bytes: 4096,
            packets_lost: 0,
            average_latency_ms: 12.5,
        };
        assert_eq!(
            StatsReporter::render(&stats),
            "Active Connections: 3\nTotal Bytes: 4096\nAverage Latency: 12.500000\n"
        );
    }

    #[tokio::test]
    async fn appends_and_rotates_by_date() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = StatsReporter::new(dir.path());
        assert_eq!(reporter.dir(), dir.path());
        let stats = Stats::default();

        reporter.append(&stats, date(2024, 3, 1)).await.unwrap();
        reporter.append(&stats, date(2024, 3, 1)).await.unwrap();
        reporter.append(&stats, date(2024, 3, 2)).await.unwrap();

        let first = std::fs::read_to_string(dir.path().join("stats_2024-03-01.log")).unwrap();
        let second = std::fs::read_to_string(dir.path().join("stats_2024-03-02.log")).unwrap();
        assert_eq!(first.matches("Active Connections:").count(), 2);
        assert_eq!(second.matches("Active Connections:").count(), 1);
    }

    #[tokio::test]
    async fn unwritable_directory_surfaces_as_error() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = StatsReporter::new(dir.path().join("missing").join("nested"));
        assert!(reporter.append(&Stats::default(), date(2024, 1, 1)).await.is_err());
    }

    #[tokio::test]
    async fn background_loop_writes_until_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let collector = Arc::new(MetricsCollector::new());
        collector.record_bytes(77);

        let cancel = CancellationToken::new();
        let reporter = StatsReporter::new(dir.path());
        let handle = reporter
            .clone()
            .spawn(collector, Duration::from_millis(20), cancel.clone());

        time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();
        handle.await.unwrap();

        let today = Local::now().date_naive();
        let written = std::fs::read_to_string(reporter.file_for(today)).unwrap();
        assert!(written.contains("Total Bytes: 77"));
    }

    #[tokio::test]
    async fn background_loop_survives_write_failures() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let handle = StatsReporter::new(dir.path().join("does-not-exist")).spawn(
            Arc::new(MetricsCollector::new()),
            Duration::from_millis(10),
            cancel.clone(),
        );

        time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());
        cancel.cancel();
        handle.await.unwrap();
    }
}
