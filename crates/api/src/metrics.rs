use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Process-wide request counters, reported by `/stats`
#[derive(Default)]
pub struct Metrics {
    total_requests: AtomicUsize,
    failed_requests: AtomicUsize,

    ingests: AtomicUsize,
    chunks_indexed: AtomicUsize,
    total_ingest_time_us: AtomicU64,

    rag_queries: AtomicUsize,
    total_rag_time_us: AtomicU64,

    streams_started: AtomicUsize,
    streams_completed: AtomicUsize,
    streams_failed: AtomicUsize,
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: usize,
    pub failed_requests: usize,
    pub ingests: usize,
    pub chunks_indexed: usize,
    pub avg_ingest_time_ms: f64,
    pub rag_queries: usize,
    pub avg_rag_time_ms: f64,
    pub streams_started: usize,
    pub streams_completed: usize,
    pub streams_failed: usize,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, success: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_ingest(&self, duration: Duration, chunks: usize) {
        self.ingests.fetch_add(1, Ordering::Relaxed);
        self.chunks_indexed.fetch_add(chunks, Ordering::Relaxed);
        self.total_ingest_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_rag(&self, duration: Duration) {
        self.rag_queries.fetch_add(1, Ordering::Relaxed);
        self.total_rag_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_stream_started(&self) {
        self.streams_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stream_finished(&self, success: bool) {
        let counter = if success {
            &self.streams_completed
        } else {
            &self.streams_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            ingests: self.ingests.load(Ordering::Relaxed),
            chunks_indexed: self.chunks_indexed.load(Ordering::Relaxed),
            avg_ingest_time_ms: avg_time_ms(&self.total_ingest_time_us, &self.ingests),
            rag_queries: self.rag_queries.load(Ordering::Relaxed),
            avg_rag_time_ms: avg_time_ms(&self.total_rag_time_us, &self.rag_queries),
            streams_started: self.streams_started.load(Ordering::Relaxed),
            streams_completed: self.streams_completed.load(Ordering::Relaxed),
            streams_failed: self.streams_failed.load(Ordering::Relaxed),
        }
    }
}

fn avg_time_ms(total_us: &AtomicU64, count: &AtomicUsize) -> f64 {
    let total = total_us.load(Ordering::Relaxed) as f64;
    let count = count.load(Ordering::Relaxed) as f64;
    if count > 0.0 {
        total / count / 1000.0
    } else {
        0.0
    }
}
