use log::info;
use serde_derive::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Probe counters, shared by the listener and every worker.
#[derive(Debug, Default)]
pub struct Stats {
    received: AtomicU64,
    dropped: AtomicU64,
    skipped: AtomicU64,
    rejected: AtomicU64,
    evicted: AtomicU64,
    exported: AtomicU64,
    export_errors: AtomicU64,
    latency_total_ns: AtomicU64,
    latency_max_ns: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    /// Packets read from the input
    Received,
    /// Packets of another protocol or a filtered topic
    Dropped,
    /// Packets that could not be turned into a record
    Skipped,
    /// New flows refused by a full table
    Rejected,
    /// Flows removed to make room
    Evicted,
    Exported,
    ExportErrors,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::Received => &self.received,
            Counter::Dropped => &self.dropped,
            Counter::Skipped => &self.skipped,
            Counter::Rejected => &self.rejected,
            Counter::Evicted => &self.evicted,
            Counter::Exported => &self.exported,
            Counter::ExportErrors => &self.export_errors,
        }
    }

    #[inline]
    pub fn incr(&self, counter: Counter) {
        self.counter(counter).fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self, counter: Counter) -> u64 {
        self.counter(counter).load(Ordering::Relaxed)
    }

    /// Time spent between a packet entering the flow table and its message leaving the socket.
    pub fn record_latency(&self, latency: Duration) {
        let ns = latency.as_nanos().min(u64::MAX as u128) as u64;
        self.latency_total_ns.fetch_add(ns, Ordering::Relaxed);
        self.latency_max_ns.fetch_max(ns, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let exported = self.get(Counter::Exported);
        let total = self.latency_total_ns.load(Ordering::Relaxed);

        StatsSnapshot {
            received: self.get(Counter::Received),
            dropped: self.get(Counter::Dropped),
            skipped: self.get(Counter::Skipped),
            rejected: self.get(Counter::Rejected),
            evicted: self.get(Counter::Evicted),
            exported,
            export_errors: self.get(Counter::ExportErrors),
            mean_latency_us: if exported == 0 { 0 } else { total / exported / 1_000 },
            max_latency_us: self.latency_max_ns.load(Ordering::Relaxed) / 1_000,
        }
    }

    pub fn log_summary(&self) {
        info!("Probe statistics: {}", self.snapshot());
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub dropped: u64,
    pub skipped: u64,
    pub rejected: u64,
    pub evicted: u64,
    pub exported: u64,
    pub export_errors: u64,
    pub mean_latency_us: u64,
    pub max_latency_us: u64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => Err(fmt::Error),
        }
    }
}
