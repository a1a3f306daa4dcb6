//! Interval statistics collection on the supervising thread
//!
//! The aggregator wakes every second, and at each reporting interval drains
//! the workers' latency record queues, folds the samples into interval and
//! overall summaries, polls counter deltas, and emits one row per worker to
//! the log and to the optional per-worker CSV files. Interval summaries reset
//! after every report; overall summaries run for the whole experiment and
//! feed the final [`RunSummary`].

use crate::config::{OutputConfig, Role};
use crate::error::Result;
use crate::stats::{ValueStatistics, WorkerStats};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

const STATS_HEADER: &str = "Time (epoch sec), Requests, Images, Updates, \
Update rate (msgs/sec), GenMsgs sent, GenMsgs received, Latency GenMsgs sent, \
Msgs sent, Statuses, Out-of-buffers, Update latency count, Update latency avg (usec), \
Update latency std dev (usec), Update latency max (usec), Update latency min (usec), \
GenMsg latency count, GenMsg latency avg (usec), GenMsg latency std dev (usec), \
GenMsg latency max (usec), GenMsg latency min (usec)";

/// Stream labels in the per-record latency log
const UPDATE_LABEL: &str = "Upd";
const GENERIC_LABEL: &str = "Gen";

struct WorkerView {
    stats: Arc<WorkerStats>,
    interval_update_latency: ValueStatistics,
    overall_update_latency: ValueStatistics,
    interval_generic_latency: ValueStatistics,
    overall_generic_latency: ValueStatistics,
    stats_writer: Option<BufWriter<File>>,
    latency_writer: Option<BufWriter<File>>,
}

impl WorkerView {
    /// Drain both record queues into the running summaries, logging each raw
    /// record when a latency file is configured
    fn drain_latency(&mut self) {
        let updates = self.stats.update_latency.drain();
        for record in &updates {
            let latency = record.latency_us();
            self.interval_update_latency.update(latency);
            self.overall_update_latency.update(latency);
            if let Some(w) = &mut self.latency_writer {
                let _ = writeln!(
                    w,
                    "{}, {}, {}, {}",
                    UPDATE_LABEL,
                    record.start_time,
                    record.end_time,
                    record.end_time - record.start_time
                );
            }
        }
        self.stats.update_latency.recycle(updates);

        let generics = self.stats.generic_latency.drain();
        for record in &generics {
            let latency = record.latency_us();
            self.interval_generic_latency.update(latency);
            self.overall_generic_latency.update(latency);
            if let Some(w) = &mut self.latency_writer {
                let _ = writeln!(
                    w,
                    "{}, {}, {}, {}",
                    GENERIC_LABEL,
                    record.start_time,
                    record.end_time,
                    record.end_time - record.start_time
                );
            }
        }
        self.stats.generic_latency.recycle(generics);

        if let Some(w) = &mut self.latency_writer {
            if let Err(e) = w.flush() {
                warn!(error = %e, "latency log write failed");
            }
        }
    }
}

/// Monitor-side collector over every worker's shared stats
pub struct StatsAggregator {
    views: Vec<WorkerView>,
    display_interval_stats: bool,
}

impl StatsAggregator {
    pub fn new(output: &OutputConfig, workers: &[Arc<WorkerStats>]) -> Result<Self> {
        let mut views = Vec::with_capacity(workers.len());
        for (index, stats) in workers.iter().enumerate() {
            let stats_writer = match &output.stats_file {
                Some(prefix) => Some(open_stats_csv(prefix, index)?),
                None => None,
            };
            let latency_writer = match &output.latency_file {
                Some(prefix) => Some(open_latency_csv(prefix, index)?),
                None => None,
            };
            views.push(WorkerView {
                stats: Arc::clone(stats),
                interval_update_latency: ValueStatistics::new(),
                overall_update_latency: ValueStatistics::new(),
                interval_generic_latency: ValueStatistics::new(),
                overall_generic_latency: ValueStatistics::new(),
                stats_writer,
                latency_writer,
            });
        }
        Ok(Self { views, display_interval_stats: output.display_interval_stats })
    }

    /// Second-granularity monitor loop. Reports every `write_interval`, stops
    /// when `run_time` expires or `stop_early` says the workers are done.
    pub fn run(
        &mut self,
        run_time: Duration,
        write_interval: Duration,
        stop_early: impl Fn() -> bool,
    ) {
        let end = Instant::now() + run_time;
        let write_secs = write_interval.as_secs().max(1);
        let mut runtime_sec = 0u64;
        let mut interval_sec = 0u64;
        loop {
            let wake = Instant::now() + Duration::from_secs(1);
            if interval_sec >= write_secs {
                self.collect_interval(runtime_sec, write_secs);
                interval_sec = 0;
            }
            if Instant::now() >= end {
                info!(seconds = run_time.as_secs(), "run time expired");
                break;
            }
            if stop_early() {
                info!("all workers stopped");
                break;
            }
            let now = Instant::now();
            if wake > now {
                std::thread::sleep(wake - now);
            }
            runtime_sec += 1;
            interval_sec += 1;
        }
    }

    /// One reporting pass: drain latency queues, poll counter deltas, emit
    /// rows, reset interval summaries
    pub fn collect_interval(&mut self, runtime_sec: u64, interval_secs: u64) {
        let epoch_sec = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        for (index, view) in self.views.iter_mut().enumerate() {
            view.drain_latency();

            let requests = view.stats.item_requests.poll_change();
            let images = view.stats.images.poll_change();
            let updates = view.stats.updates.poll_change();
            let generics_sent = view.stats.generics_sent.poll_change();
            let generics_received = view.stats.generics_received.poll_change();
            let latency_generics = view.stats.latency_generics_sent.poll_change();
            let msgs_sent = view.stats.msgs_sent.poll_change();
            let statuses = view.stats.statuses.poll_change();
            let out_of_buffers = view.stats.out_of_buffers.poll_change();
            let update_rate = updates / interval_secs;

            if let Some(w) = &mut view.stats_writer {
                let row = format!(
                    "{epoch_sec}, {requests}, {images}, {updates}, {update_rate}, \
                     {generics_sent}, {generics_received}, {latency_generics}, \
                     {msgs_sent}, {statuses}, {out_of_buffers}, {}, {:.1}, {:.1}, {:.1}, {:.1}, \
                     {}, {:.1}, {:.1}, {:.1}, {:.1}",
                    view.interval_update_latency.count(),
                    view.interval_update_latency.average(),
                    view.interval_update_latency.std_dev(),
                    stat_or_zero(&view.interval_update_latency, ValueStatistics::max),
                    stat_or_zero(&view.interval_update_latency, ValueStatistics::min),
                    view.interval_generic_latency.count(),
                    view.interval_generic_latency.average(),
                    view.interval_generic_latency.std_dev(),
                    stat_or_zero(&view.interval_generic_latency, ValueStatistics::max),
                    stat_or_zero(&view.interval_generic_latency, ValueStatistics::min),
                );
                if let Err(e) = writeln!(w, "{row}").and_then(|_| w.flush()) {
                    warn!(worker = index, error = %e, "stats file write failed");
                }
            }

            if self.display_interval_stats {
                info!(
                    second = runtime_sec,
                    worker = index,
                    requests,
                    images,
                    update_rate,
                    generics_sent,
                    generics_received,
                    "interval"
                );
                if view.interval_update_latency.count() > 0 {
                    info!(
                        worker = index,
                        count = view.interval_update_latency.count(),
                        avg_us = format_args!("{:.1}", view.interval_update_latency.average()),
                        std_dev_us = format_args!("{:.1}", view.interval_update_latency.std_dev()),
                        max_us = format_args!("{:.1}", view.interval_update_latency.max()),
                        min_us = format_args!("{:.1}", view.interval_update_latency.min()),
                        "update latency"
                    );
                }
                if view.interval_generic_latency.count() > 0 {
                    info!(
                        worker = index,
                        count = view.interval_generic_latency.count(),
                        avg_us = format_args!("{:.1}", view.interval_generic_latency.average()),
                        std_dev_us = format_args!("{:.1}", view.interval_generic_latency.std_dev()),
                        max_us = format_args!("{:.1}", view.interval_generic_latency.max()),
                        min_us = format_args!("{:.1}", view.interval_generic_latency.min()),
                        "generic latency"
                    );
                }
                if statuses > 0 {
                    info!(worker = index, statuses, "status messages received");
                }
                if out_of_buffers > 0 {
                    warn!(
                        worker = index,
                        count = out_of_buffers,
                        "bursts dropped for lack of output buffers"
                    );
                }
            }

            view.interval_update_latency.reset();
            view.interval_generic_latency.reset();
        }
    }

    /// Drain whatever is still queued and build the final run summary
    pub fn summarize(&mut self, experiment: &str, role: Role, run_seconds: u64) -> RunSummary {
        let mut workers = Vec::with_capacity(self.views.len());
        let mut totals = RunTotals::default();
        let mut total_update_latency = ValueStatistics::new();
        let mut total_generic_latency = ValueStatistics::new();

        for (index, view) in self.views.iter_mut().enumerate() {
            view.drain_latency();

            let stats = &view.stats;
            let images = stats.images.total();
            let image_retrieval = stats.image_window_us().map(|(start, end)| {
                let seconds = (end - start) as f64 / 1_000_000.0;
                ImageWindow {
                    images,
                    seconds,
                    images_per_sec: if seconds > 0.0 { images as f64 / seconds } else { 0.0 },
                }
            });

            totals.item_requests += stats.item_requests.total();
            totals.images += images;
            totals.updates += stats.updates.total();
            totals.generics_sent += stats.generics_sent.total();
            totals.generics_received += stats.generics_received.total();
            totals.msgs_sent += stats.msgs_sent.total();
            totals.statuses += stats.statuses.total();
            totals.out_of_buffers += stats.out_of_buffers.total();
            total_update_latency.merge(&view.overall_update_latency);
            total_generic_latency.merge(&view.overall_generic_latency);

            workers.push(WorkerSummary {
                worker: index,
                item_requests: stats.item_requests.total(),
                images,
                updates: stats.updates.total(),
                generics_sent: stats.generics_sent.total(),
                generics_received: stats.generics_received.total(),
                latency_generics_sent: stats.latency_generics_sent.total(),
                msgs_sent: stats.msgs_sent.total(),
                statuses: stats.statuses.total(),
                out_of_buffers: stats.out_of_buffers.total(),
                update_latency: latency_summary(&view.overall_update_latency),
                generic_latency: latency_summary(&view.overall_generic_latency),
                image_retrieval,
            });
        }

        totals.update_rate_per_sec =
            if run_seconds > 0 { totals.updates as f64 / run_seconds as f64 } else { 0.0 };
        totals.update_latency = latency_summary(&total_update_latency);
        totals.generic_latency = latency_summary(&total_generic_latency);

        RunSummary {
            experiment: experiment.to_string(),
            role: role.to_string(),
            run_seconds,
            workers,
            totals,
        }
    }
}

fn stat_or_zero(stats: &ValueStatistics, field: impl Fn(&ValueStatistics) -> f64) -> f64 {
    if stats.count() > 0 {
        field(stats)
    } else {
        0.0
    }
}

fn numbered_csv(prefix: &Path, index: usize) -> PathBuf {
    PathBuf::from(format!("{}{}.csv", prefix.display(), index + 1))
}

/// Create the file, along with any missing directories in the prefix
fn create_csv(path: PathBuf) -> Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(File::create(path)?)
}

fn open_stats_csv(prefix: &Path, index: usize) -> Result<BufWriter<File>> {
    let file = create_csv(numbered_csv(prefix, index))?;
    let mut writer = BufWriter::new(file);
    writeln!(writer, "{STATS_HEADER}")?;
    Ok(writer)
}

fn open_latency_csv(prefix: &Path, index: usize) -> Result<BufWriter<File>> {
    let file = create_csv(numbered_csv(prefix, index))?;
    Ok(BufWriter::new(file))
}

/// Final counts and latency summaries for one run, written as JSON when a
/// summary file is configured
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub experiment: String,
    pub role: String,
    pub run_seconds: u64,
    pub workers: Vec<WorkerSummary>,
    pub totals: RunTotals,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerSummary {
    pub worker: usize,
    pub item_requests: u64,
    pub images: u64,
    pub updates: u64,
    pub generics_sent: u64,
    pub generics_received: u64,
    pub latency_generics_sent: u64,
    pub msgs_sent: u64,
    pub statuses: u64,
    pub out_of_buffers: u64,
    pub update_latency: Option<LatencySummary>,
    pub generic_latency: Option<LatencySummary>,
    pub image_retrieval: Option<ImageWindow>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunTotals {
    pub item_requests: u64,
    pub images: u64,
    pub updates: u64,
    pub generics_sent: u64,
    pub generics_received: u64,
    pub msgs_sent: u64,
    pub statuses: u64,
    pub out_of_buffers: u64,
    pub update_rate_per_sec: f64,
    pub update_latency: Option<LatencySummary>,
    pub generic_latency: Option<LatencySummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencySummary {
    pub count: u64,
    pub average_us: f64,
    pub std_dev_us: f64,
    pub max_us: f64,
    pub min_us: f64,
}

fn latency_summary(stats: &ValueStatistics) -> Option<LatencySummary> {
    if stats.count() == 0 {
        return None;
    }
    Some(LatencySummary {
        count: stats.count(),
        average_us: stats.average(),
        std_dev_us: stats.std_dev(),
        max_us: stats.max(),
        min_us: stats.min(),
    })
}

/// Image retrieval window for one worker
#[derive(Debug, Clone, Serialize)]
pub struct ImageWindow {
    pub images: u64,
    pub seconds: f64,
    pub images_per_sec: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn output_with_files(dir: &Path) -> OutputConfig {
        OutputConfig {
            stats_file: Some(dir.join("stats")),
            latency_file: Some(dir.join("latency")),
            summary_file: None,
            display_interval_stats: false,
        }
    }

    #[test]
    fn test_interval_rows_and_reset() {
        let dir = tempfile::tempdir().unwrap();
        let stats = Arc::new(WorkerStats::new());
        let mut aggregator =
            StatsAggregator::new(&output_with_files(dir.path()), &[Arc::clone(&stats)]).unwrap();

        stats.updates.add(500);
        stats.msgs_sent.add(512);
        stats.update_latency.submit(100, 350, 1);
        stats.update_latency.submit(200, 300, 1);
        aggregator.collect_interval(5, 5);
        aggregator.collect_interval(10, 5);

        let latency = fs::read_to_string(dir.path().join("latency1.csv")).unwrap();
        assert!(latency.contains("Upd, 100, 350, 250"));
        assert!(latency.contains("Upd, 200, 300, 100"));

        let rows = fs::read_to_string(dir.path().join("stats1.csv")).unwrap();
        let lines: Vec<&str> = rows.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("Time (epoch sec)"));

        let first: Vec<&str> = lines[1].split(", ").collect();
        // updates, update rate, msgs sent, then the update-latency block
        assert_eq!(first[3], "500");
        assert_eq!(first[4], "100");
        assert_eq!(first[8], "512");
        assert_eq!(first[11], "2");
        assert_eq!(first[14], "250.0");
        assert_eq!(first[15], "100.0");

        // Second interval saw no new samples and no new counts
        let second: Vec<&str> = lines[2].split(", ").collect();
        assert_eq!(second[3], "0");
        assert_eq!(second[8], "0");
        assert_eq!(second[11], "0");

        // Records went back to the pool after collection
        assert_eq!(stats.update_latency.pool_len(), 2);
        assert_eq!(stats.update_latency.pending_len(), 0);
    }

    #[test]
    fn test_summary_merges_workers() {
        let worker_a = Arc::new(WorkerStats::new());
        let worker_b = Arc::new(WorkerStats::new());
        let output = OutputConfig::default();
        let mut aggregator = StatsAggregator::new(
            &output,
            &[Arc::clone(&worker_a), Arc::clone(&worker_b)],
        )
        .unwrap();

        worker_a.updates.add(100);
        worker_a.images.add(10);
        worker_a.msgs_sent.add(110);
        worker_a.update_latency.submit(0, 50, 1);
        worker_a.update_latency.submit(0, 150, 1);
        worker_b.updates.add(50);
        worker_b.images.add(5);
        worker_b.msgs_sent.add(55);
        worker_b.update_latency.submit(0, 100, 1);
        worker_b.record_image_start(1_000_000);
        worker_b.record_image_end(3_000_000);

        let summary = aggregator.summarize("bench", Role::Consumer, 10);
        assert_eq!(summary.role, "consumer");
        assert_eq!(summary.workers.len(), 2);
        assert_eq!(summary.totals.updates, 150);
        assert_eq!(summary.totals.images, 15);
        assert_eq!(summary.totals.msgs_sent, 165);
        assert_eq!(summary.workers[0].msgs_sent, 110);
        assert!((summary.totals.update_rate_per_sec - 15.0).abs() < 1e-9);

        let latency = summary.totals.update_latency.as_ref().unwrap();
        assert_eq!(latency.count, 3);
        assert!((latency.average_us - 100.0).abs() < 1e-9);
        assert!(summary.totals.generic_latency.is_none());

        let window = summary.workers[1].image_retrieval.as_ref().unwrap();
        assert!((window.seconds - 2.0).abs() < 1e-9);
        assert!((window.images_per_sec - 2.5).abs() < 1e-9);
        assert!(summary.workers[0].image_retrieval.is_none());
    }

    #[test]
    fn test_csv_prefixes_create_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let output = OutputConfig {
            stats_file: Some(dir.path().join("out").join("stats")),
            latency_file: Some(dir.path().join("out").join("latency")),
            summary_file: None,
            display_interval_stats: false,
        };
        let stats = Arc::new(WorkerStats::new());
        let mut aggregator = StatsAggregator::new(&output, &[Arc::clone(&stats)]).unwrap();
        aggregator.collect_interval(5, 5);

        assert!(dir.path().join("out").join("stats1.csv").exists());
        assert!(dir.path().join("out").join("latency1.csv").exists());
    }

    #[test]
    fn test_run_stops_early() {
        let output = OutputConfig::default();
        let mut aggregator = StatsAggregator::new(&output, &[]).unwrap();
        let started = Instant::now();
        aggregator.run(Duration::from_secs(60), Duration::from_secs(5), || true);
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
