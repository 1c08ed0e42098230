#![forbid(unsafe_code)]

// Server metrics - atomic counters and a latency histogram, rendered in the
// Prometheus text exposition format on demand.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Histogram upper bounds in microseconds, paired with their `le` label
const LATENCY_BUCKETS: [(u64, &str); 10] = [
    (1_000, "0.001"),
    (5_000, "0.005"),
    (10_000, "0.01"),
    (25_000, "0.025"),
    (50_000, "0.05"),
    (100_000, "0.1"),
    (250_000, "0.25"),
    (500_000, "0.5"),
    (1_000_000, "1"),
    (5_000_000, "5"),
];

/// Monotonic counters exported as `lecture_sfu_<name>_total`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Connections,
    FramesReceived,
    FramesSent,
    Errors,
    RoomsCreated,
    LecturesEnded,
    Joins,
    Leaves,
    Evictions,
    ProducersCreated,
    ConsumersCreated,
}

impl Counter {
    const ALL: [Counter; 11] = [
        Counter::Connections,
        Counter::FramesReceived,
        Counter::FramesSent,
        Counter::Errors,
        Counter::RoomsCreated,
        Counter::LecturesEnded,
        Counter::Joins,
        Counter::Leaves,
        Counter::Evictions,
        Counter::ProducersCreated,
        Counter::ConsumersCreated,
    ];

    fn name(self) -> &'static str {
        match self {
            Counter::Connections => "connections",
            Counter::FramesReceived => "frames_received",
            Counter::FramesSent => "frames_sent",
            Counter::Errors => "errors",
            Counter::RoomsCreated => "rooms_created",
            Counter::LecturesEnded => "lectures_ended",
            Counter::Joins => "joins",
            Counter::Leaves => "leaves",
            Counter::Evictions => "evictions",
            Counter::ProducersCreated => "producers_created",
            Counter::ConsumersCreated => "consumers_created",
        }
    }

    fn help(self) -> &'static str {
        match self {
            Counter::Connections => "WebSocket connections accepted",
            Counter::FramesReceived => "Text frames received from clients",
            Counter::FramesSent => "Frames written to clients",
            Counter::Errors => "Rejected or failed client frames",
            Counter::RoomsCreated => "Lecture rooms opened",
            Counter::LecturesEnded => "Lecture rooms ended",
            Counter::Joins => "Peers admitted to a room",
            Counter::Leaves => "Non-host peers that left a live room",
            Counter::Evictions => "Peers replaced by a newer connection of the same user",
            Counter::ProducersCreated => "Producers created",
            Counter::ConsumersCreated => "Consumers created",
        }
    }
}

/// Cumulative histogram over [`LATENCY_BUCKETS`]
struct LatencyHistogram {
    buckets: [AtomicU64; 10],
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }

    fn observe(&self, duration: Duration) {
        let us = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.sum_us.fetch_add(us, Relaxed);
        self.count.fetch_add(1, Relaxed);
        for (bucket, (bound, _)) in self.buckets.iter().zip(LATENCY_BUCKETS) {
            if us <= bound {
                bucket.fetch_add(1, Relaxed);
            }
        }
    }

    fn render(&self, out: &mut String, name: &str, help: &str) {
        header(out, name, help, "histogram");
        for (bucket, (_, label)) in self.buckets.iter().zip(LATENCY_BUCKETS) {
            let _ = writeln!(out, "{name}_bucket{{le=\"{label}\"}} {}", bucket.load(Relaxed));
        }
        let count = self.count.load(Relaxed);
        let sum_us = self.sum_us.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let _ = writeln!(out, "{name}_sum {}.{:06}", sum_us / 1_000_000, sum_us % 1_000_000);
        let _ = writeln!(out, "{name}_count {count}");
    }
}

struct Inner {
    counters: [AtomicU64; 11],
    connections_active: AtomicU64,
    operation_latency: LatencyHistogram,
}

/// Process-wide metrics, cheap to clone
#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                counters: std::array::from_fn(|_| AtomicU64::new(0)),
                connections_active: AtomicU64::new(0),
                operation_latency: LatencyHistogram::new(),
            }),
        }
    }

    pub fn inc(&self, counter: Counter) {
        self.inner.counters[counter as usize].fetch_add(1, Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.inner.counters[counter as usize].load(Relaxed)
    }

    /// Counts an open connection until the guard is dropped
    pub fn connection_active_guard(&self) -> ConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn observe_operation(&self, duration: Duration) {
        self.inner.operation_latency.observe(duration);
    }

    /// Prometheus text. Room and peer gauges are read from the registry by
    /// the caller.
    pub fn render_prometheus(&self, rooms_active: usize, peers_active: usize) -> String {
        let mut out = String::with_capacity(4096);

        for counter in Counter::ALL {
            let name = format!("lecture_sfu_{}_total", counter.name());
            header(&mut out, &name, counter.help(), "counter");
            let _ = writeln!(out, "{name} {}", self.get(counter));
        }

        let gauges = [
            (
                "lecture_sfu_connections_active",
                "Open WebSocket connections",
                self.inner.connections_active.load(Relaxed),
            ),
            ("lecture_sfu_rooms_active", "Live lecture rooms", rooms_active as u64),
            ("lecture_sfu_peers_active", "Peers joined to a live room", peers_active as u64),
        ];
        for (name, help, value) in gauges {
            header(&mut out, name, help, "gauge");
            let _ = writeln!(out, "{name} {value}");
        }

        self.inner.operation_latency.render(
            &mut out,
            "lecture_sfu_operation_seconds",
            "Signaling operation handling latency",
        );
        out
    }
}

/// Decrements the active-connection gauge on drop
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

fn header(out: &mut String, name: &str, help: &str, kind: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_table_matches_discriminants() {
        for (i, counter) in Counter::ALL.iter().enumerate() {
            assert_eq!(*counter as usize, i);
        }
    }

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let h = LatencyHistogram::new();
        h.observe(Duration::from_micros(500));
        h.observe(Duration::from_millis(30));
        let mut out = String::new();
        h.render(&mut out, "op_seconds", "latency");
        assert!(out.contains("op_seconds_bucket{le=\"0.001\"} 1"));
        assert!(out.contains("op_seconds_bucket{le=\"0.025\"} 1"));
        assert!(out.contains("op_seconds_bucket{le=\"0.05\"} 2"));
        assert!(out.contains("op_seconds_bucket{le=\"+Inf\"} 2"));
        assert!(out.contains("op_seconds_sum 0.030500"));
    }

    #[test]
    fn test_render_and_guard() {
        let metrics = ServerMetrics::new();
        metrics.inc(Counter::RoomsCreated);
        metrics.inc(Counter::Evictions);
        metrics.inc(Counter::Evictions);
        let guard = metrics.connection_active_guard();

        let out = metrics.render_prometheus(1, 3);
        assert!(out.contains("# TYPE lecture_sfu_rooms_created_total counter"));
        assert!(out.contains("lecture_sfu_rooms_created_total 1"));
        assert!(out.contains("lecture_sfu_evictions_total 2"));
        assert!(out.contains("lecture_sfu_connections_active 1"));
        assert!(out.contains("lecture_sfu_peers_active 3"));

        drop(guard);
        assert!(metrics
            .render_prometheus(0, 0)
            .contains("lecture_sfu_connections_active 0"));
    }
}
