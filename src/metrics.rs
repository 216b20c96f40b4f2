#![forbid(unsafe_code)]

// Server metrics - lock-free counters and a Prometheus-compatible histogram.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Histogram bucket upper bounds in microseconds, with their Prometheus labels.
const BUCKETS: [(u64, &str); 10] = [
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

/// Cumulative histogram with fixed buckets.
struct Histogram {
    buckets: [AtomicU64; BUCKETS.len()],
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }

    fn observe(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.sum_us.fetch_add(us, Relaxed);
        self.count.fetch_add(1, Relaxed);
        for (bucket, (bound, _)) in self.buckets.iter().zip(BUCKETS.iter()) {
            if us <= *bound {
                bucket.fetch_add(1, Relaxed);
            }
        }
    }

    fn render(&self, name: &str, help: &str, out: &mut String) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");
        for (bucket, (_, label)) in self.buckets.iter().zip(BUCKETS.iter()) {
            let _ = writeln!(out, "{name}_bucket{{le=\"{label}\"}} {}", bucket.load(Relaxed));
        }
        let count = self.count.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let sum_us = self.sum_us.load(Relaxed);
        let _ = writeln!(out, "{name}_sum {}.{:06}", sum_us / 1_000_000, sum_us % 1_000_000);
        let _ = writeln!(out, "{name}_count {count}");
    }
}

/// Monotonic counters exposed at `/metrics`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Connections,
    AdmissionsRejected,
    MessagesReceived,
    MessagesSent,
    RequestErrors,
    RoomsCreated,
    RoomsEvicted,
    Joins,
    Leaves,
    ProducersCreated,
    ConsumersCreated,
    ChatMessages,
}

impl Counter {
    const ALL: [Counter; 12] = [
        Counter::Connections,
        Counter::AdmissionsRejected,
        Counter::MessagesReceived,
        Counter::MessagesSent,
        Counter::RequestErrors,
        Counter::RoomsCreated,
        Counter::RoomsEvicted,
        Counter::Joins,
        Counter::Leaves,
        Counter::ProducersCreated,
        Counter::ConsumersCreated,
        Counter::ChatMessages,
    ];

    fn name(self) -> &'static str {
        match self {
            Counter::Connections => "huddle_connections_total",
            Counter::AdmissionsRejected => "huddle_admissions_rejected_total",
            Counter::MessagesReceived => "huddle_messages_received_total",
            Counter::MessagesSent => "huddle_messages_sent_total",
            Counter::RequestErrors => "huddle_request_errors_total",
            Counter::RoomsCreated => "huddle_rooms_created_total",
            Counter::RoomsEvicted => "huddle_rooms_evicted_total",
            Counter::Joins => "huddle_joins_total",
            Counter::Leaves => "huddle_leaves_total",
            Counter::ProducersCreated => "huddle_producers_created_total",
            Counter::ConsumersCreated => "huddle_consumers_created_total",
            Counter::ChatMessages => "huddle_chat_messages_total",
        }
    }

    fn help(self) -> &'static str {
        match self {
            Counter::Connections => "Total WebSocket connections",
            Counter::AdmissionsRejected => "Connections refused after upgrade (room unavailable)",
            Counter::MessagesReceived => "Total frames received from clients",
            Counter::MessagesSent => "Total frames sent to clients",
            Counter::RequestErrors => "Requests answered with an error",
            Counter::RoomsCreated => "Total rooms created",
            Counter::RoomsEvicted => "Total rooms evicted",
            Counter::Joins => "Total room joins",
            Counter::Leaves => "Total room departures",
            Counter::ProducersCreated => "Total producers created",
            Counter::ConsumersCreated => "Total consumers created",
            Counter::ChatMessages => "Total chat messages delivered",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Server-wide metrics. Cheap to clone.
#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    counters: [AtomicU64; Counter::ALL.len()],
    connections_active: AtomicU64,
    request_handling: Histogram,
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
                request_handling: Histogram::new(),
            }),
        }
    }

    pub fn inc(&self, counter: Counter) {
        self.inner.counters[counter.index()].fetch_add(1, Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.inner.counters[counter.index()].load(Relaxed)
    }

    /// Increments the active-connection gauge; the returned guard decrements it on drop.
    pub fn connection_active_guard(&self) -> ConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn connections_active(&self) -> u64 {
        self.inner.connections_active.load(Relaxed)
    }

    pub fn observe_request_handling(&self, duration: Duration) {
        self.inner.request_handling.observe(duration);
    }

    /// Prometheus text exposition. Room and participant gauges are computed by the caller.
    pub fn render_prometheus(&self, rooms_active: usize, participants_active: usize) -> String {
        let mut out = String::with_capacity(4096);

        for counter in Counter::ALL {
            render_metric(&mut out, "counter", counter.name(), counter.help(), self.get(counter));
        }

        render_metric(
            &mut out,
            "gauge",
            "huddle_connections_active",
            "Currently active WebSocket connections",
            self.connections_active(),
        );
        render_metric(&mut out, "gauge", "huddle_rooms_active", "Currently active rooms", rooms_active as u64);
        render_metric(
            &mut out,
            "gauge",
            "huddle_participants_active",
            "Currently admitted participants",
            participants_active as u64,
        );

        self.inner.request_handling.render(
            "huddle_request_handling_seconds",
            "Signaling request handling latency in seconds",
            &mut out,
        );
        out
    }
}

/// Decrements `connections_active` on drop, including on panic unwinds.
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

fn render_metric(out: &mut String, kind: &str, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
    let _ = writeln!(out, "{name} {value}");
}
