use super::LatencySummary;
use crate::runner::{ReadReport, RunReport, WriteReport};
use std::fmt;
use std::time::Duration;

const RULE: &str = "═══════════════════════════════════════════════════════════";

fn per_sec(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}

/// Formats run results for the terminal
pub struct ResultsReporter;

impl ResultsReporter {
    pub fn print_summary(report: &RunReport, latencies: &[LatencySummary]) {
        println!("\n{}", RULE);
        println!("  Page store benchmark: {}", report.mode);
        println!("{}", RULE);
        println!();

        if let Some(write) = &report.write {
            Self::print_write(write);
        }
        if let Some(read) = &report.read {
            Self::print_read(read);
        }

        for latency in latencies.iter().filter(|l| l.total() > 0) {
            Self::print_latency(latency);
        }

        println!("{}", RULE);
    }

    fn print_write(write: &WriteReport) {
        println!("Write loop:");
        println!("   Duration:      {:.2}s", write.elapsed.as_secs_f64());
        println!("   Pages written: {}", write.pages_written);
        match write.last_version {
            Some(version) => println!("   Last version:  {}", version),
            None => println!("   Last version:  none"),
        }
        println!("   Throughput:    {:.0} pages/sec", write.throughput());
        println!();
    }

    fn print_read(read: &ReadReport) {
        println!("Read workers ({}):", read.workers);
        println!("   Duration:   {:.2}s", read.elapsed.as_secs_f64());
        println!("   Hits:       {}", read.hits);
        println!("   Misses:     {}", read.misses);
        println!("   Errors:     {}", read.errors);
        println!("   Throughput: {:.0} reads/sec", read.throughput());
        println!();
    }

    fn print_latency(latency: &LatencySummary) {
        println!(
            "Latency [{}] ({} ok, {} failed):",
            latency.op, latency.successes, latency.failures
        );
        println!("   Min:    {:>10} μs", latency.min_us);
        println!("   Mean:   {:>10.0} μs", latency.mean_us);
        println!("   P50:    {:>10} μs", latency.p50_us);
        println!("   P95:    {:>10} μs", latency.p95_us);
        println!("   P99:    {:>10} μs", latency.p99_us);
        println!("   P99.9:  {:>10} μs", latency.p999_us);
        println!("   Max:    {:>10} μs", latency.max_us);
        println!();
    }
}

impl WriteReport {
    pub fn throughput(&self) -> f64 {
        per_sec(self.pages_written, self.elapsed)
    }
}

impl ReadReport {
    pub fn total(&self) -> u64 {
        self.hits + self.misses + self.errors
    }

    pub fn throughput(&self) -> f64 {
        per_sec(self.total(), self.elapsed)
    }
}

impl fmt::Display for LatencySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - {} ops, P50: {} μs, P99: {} μs",
            self.op,
            self.total(),
            self.p50_us,
            self.p99_us
        )
    }
}
