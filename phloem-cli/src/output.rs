//! Run results output formatting

use anyhow::{Context, Result};
use phloem_core::stats::aggregator::LatencySummary;
use phloem_core::stats::RunSummary;
use std::fs;
use std::path::Path;

/// Print the final counts and latency figures on stdout
pub fn print_summary(summary: &RunSummary) {
    let totals = &summary.totals;

    println!("\n{}", "=".repeat(60));
    println!("Phloem Run Summary");
    println!("{}", "=".repeat(60));
    println!();
    println!("Experiment:        {}", summary.experiment);
    println!("Role:              {}", summary.role);
    println!("Run time:          {}s", summary.run_seconds);
    println!("Workers:           {}", summary.workers.len());
    println!();
    println!("Message counts:");
    println!("  Item requests:   {}", totals.item_requests);
    println!("  Images:          {}", totals.images);
    println!("  Updates:         {} ({:.2}/s)", totals.updates, totals.update_rate_per_sec);
    println!("  Generics sent:   {}", totals.generics_sent);
    println!("  Generics recv:   {}", totals.generics_received);
    println!("  Msgs sent:       {}", totals.msgs_sent);
    println!("  Statuses:        {}", totals.statuses);
    println!("  Out of buffers:  {}", totals.out_of_buffers);

    if let Some(latency) = &totals.update_latency {
        println!();
        println!("Update latency (microseconds):");
        print_latency(latency);
    }
    if let Some(latency) = &totals.generic_latency {
        println!();
        println!("Generic latency (microseconds):");
        print_latency(latency);
    }
    for worker in &summary.workers {
        if let Some(window) = &worker.image_retrieval {
            println!();
            println!(
                "Worker {} image retrieval: {} images in {:.3}s ({:.0}/s)",
                worker.worker, window.images, window.seconds, window.images_per_sec
            );
        }
    }
    println!();
    println!("{}", "=".repeat(60));
}

fn print_latency(latency: &LatencySummary) {
    println!("  Samples:         {}", latency.count);
    println!("  Average:         {:.2}", latency.average_us);
    println!("  Std dev:         {:.2}", latency.std_dev_us);
    println!("  Min:             {:.2}", latency.min_us);
    println!("  Max:             {:.2}", latency.max_us);
}

/// Write the summary as JSON, creating any missing directories in the path
pub fn write_summary(path: &Path, summary: &RunSummary) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create output directory: {}", parent.display())
            })?;
        }
    }
    let json = serde_json::to_string_pretty(summary)?;
    fs::write(path, json).with_context(|| format!("Failed to write summary: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use phloem_core::config::{OutputConfig, Role};
    use phloem_core::stats::{StatsAggregator, WorkerStats};
    use std::sync::Arc;

    fn sample_summary() -> RunSummary {
        let stats = Arc::new(WorkerStats::new());
        stats.updates.add(42);
        let mut aggregator =
            StatsAggregator::new(&OutputConfig::default(), &[Arc::clone(&stats)]).unwrap();
        aggregator.summarize("smoke", Role::Provider, 2)
    }

    #[test]
    fn test_write_summary_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results").join("run-summary.json");
        write_summary(&path, &sample_summary()).unwrap();

        let json = fs::read_to_string(&path).unwrap();
        assert!(json.contains("\"experiment\": \"smoke\""));
        assert!(json.contains("\"updates\": 42"));
    }

    #[test]
    fn test_write_summary_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.json");
        fs::write(&path, "stale").unwrap();
        write_summary(&path, &sample_summary()).unwrap();

        let json = fs::read_to_string(&path).unwrap();
        assert!(json.contains("\"role\": \"provider\""));
    }
}
