use std::io::{self, Write};
use std::sync::Mutex;

use serde::Serialize;

use crate::converter::GodStatus;
use crate::events::{ProgressEvent, ProgressSink, Throttle};
use crate::library::LibrarySizes;
use crate::manifest::{MergeReport, UrlListReport};
use crate::scheduler::RunSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Text,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_run(result: &RunSummary) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_merge(result: &MergeReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_url_list(result: &UrlListReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_sizes(result: &LibrarySizes) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_god_status(result: &[GodStatus]) -> io::Result<()> {
        Self::print_json(&result)
    }

    pub fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

/// Prints pipeline events as plain lines. Percentages and routine status
/// lines are rate limited; urgent status lines always pass.
pub struct ConsoleReporter<W: Write> {
    out: W,
    throttle: Throttle,
    last_percent: Option<f32>,
}

impl ConsoleReporter<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> ConsoleReporter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            throttle: Throttle::default(),
            last_percent: None,
        }
    }

    pub fn handle(&mut self, event: &ProgressEvent) -> io::Result<()> {
        match event {
            ProgressEvent::Status(message) => {
                if self.throttle.allow_status(message) {
                    writeln!(self.out, "{message}")?;
                }
            }
            ProgressEvent::Progress(value) => {
                let finished = *value >= 100.0 && self.last_percent != Some(100.0);
                if finished || self.throttle.ready() {
                    self.last_percent = Some(*value);
                    writeln!(self.out, "[{value:5.1}%]")?;
                }
            }
        }
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Synchronous sink for commands that run on the main thread.
pub struct ConsoleSink {
    reporter: Mutex<ConsoleReporter<io::Stdout>>,
}

impl ConsoleSink {
    pub fn new() -> Self {
        Self {
            reporter: Mutex::new(ConsoleReporter::stdout()),
        }
    }
}

impl Default for ConsoleSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for ConsoleSink {
    fn event(&self, event: ProgressEvent) {
        let Ok(mut reporter) = self.reporter.lock() else {
            return;
        };
        if let Err(err) = reporter.handle(&event) {
            tracing::debug!("failed to print event: {err}");
        }
    }
}

pub fn print_sizes_text(sizes: &LibrarySizes) {
    for totals in &sizes.by_type {
        println!(
            "{:<12} {:>6} entries  {:>10.2} GB  ({} without size)",
            totals.link_type.as_str(),
            totals.count,
            totals.total_bytes as f64 / (1024.0 * 1024.0 * 1024.0),
            totals.missing_size
        );
    }
    println!("Total:       {:.2} GB", sizes.total_gb());
    println!(
        "Recommended free space: {:.2} GB",
        sizes.recommended_free_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    );
}

pub fn print_run_text(summary: &RunSummary) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let reset = "\x1b[0m";

    println!("{cyan}myriget summary{reset}");
    println!(
        "{green}complete: {} of {} ({} batches){reset}",
        summary.completed, summary.total, summary.batches
    );
    if summary.failed > 0 || summary.invalid_urls > 0 {
        println!(
            "{yellow}failed: {}  invalid urls: {}{reset}",
            summary.failed, summary.invalid_urls
        );
    }
    if summary.converted > 0 || summary.conversion_failures > 0 {
        println!(
            "{green}converted: {}{reset}  {yellow}conversion failures: {}{reset}",
            summary.converted, summary.conversion_failures
        );
    }
    if summary.cancelled {
        println!("{yellow}run was cancelled{reset}");
    }
}
