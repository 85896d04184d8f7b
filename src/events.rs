use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};

/// Everything the pipeline reports to its caller travels as one of these.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Status(String),
    Progress(f32),
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);

    fn status(&self, message: impl Into<String>)
    where
        Self: Sized,
    {
        self.event(ProgressEvent::Status(message.into()));
    }
}

/// Helpers usable on `&dyn ProgressSink`.
pub(crate) fn status(sink: &dyn ProgressSink, message: impl Into<String>) {
    let message = message.into();
    tracing::info!("{message}");
    sink.event(ProgressEvent::Status(message));
}

pub(crate) fn warn(sink: &dyn ProgressSink, message: impl Into<String>) {
    let message = message.into();
    tracing::warn!("{message}");
    sink.event(ProgressEvent::Status(message));
}

pub(crate) fn progress(sink: &dyn ProgressSink, percent: f32) {
    sink.event(ProgressEvent::Progress(percent.clamp(0.0, 100.0)));
}

/// Forwards events over a channel; the receiving side decides when to drain.
pub struct ChannelSink {
    tx: Mutex<Sender<ProgressEvent>>,
}

impl ChannelSink {
    pub fn new(tx: Sender<ProgressEvent>) -> Self {
        Self { tx: Mutex::new(tx) }
    }
}

impl ProgressSink for ChannelSink {
    fn event(&self, event: ProgressEvent) {
        if let Ok(tx) = self.tx.lock() {
            // A dropped receiver only means nobody is listening anymore.
            let _ = tx.send(event);
        }
    }
}

pub struct LogSink;

impl ProgressSink for LogSink {
    fn event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Status(message) => tracing::info!(target: "myriget::status", "{message}"),
            ProgressEvent::Progress(value) => {
                tracing::debug!(target: "myriget::progress", "{value:.1}%")
            }
        }
    }
}

pub struct NullSink;

impl ProgressSink for NullSink {
    fn event(&self, _event: ProgressEvent) {}
}

/// Collects events in memory; handy for embedding and tests.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().map(|guard| guard.clone()).unwrap_or_default()
    }

    pub fn statuses(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ProgressEvent::Status(message) => Some(message),
                ProgressEvent::Progress(_) => None,
            })
            .collect()
    }
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        if let Ok(mut guard) = self.events.lock() {
            guard.push(event);
        }
    }
}

const URGENT_MARKERS: [&str; 11] = [
    "error", "failed", "invalid", "missing", "success", "complete", "saved", "finished", "warning",
    "caution", "critical",
];

/// Whether a status line must bypass rate limiting.
pub fn is_urgent(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    URGENT_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Rate limiter for chatty per-chunk events.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

pub const DEFAULT_THROTTLE: Duration = Duration::from_millis(250);

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn ready_at(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    pub fn ready(&mut self) -> bool {
        self.ready_at(Instant::now())
    }

    /// Urgent messages always pass and do not consume the interval.
    pub fn allow_status(&mut self, message: &str) -> bool {
        is_urgent(message) || self.ready()
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new(DEFAULT_THROTTLE)
    }
}

/// Externally owned stop flag, checked between entries.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
