//! Prometheus metrics
//!
//! A small in-process registry rendered in the Prometheus text exposition
//! format. Values live in atomics; label families sit behind a
//! `parking_lot::RwLock`. Handles are registered once, up front, through
//! [`STD_METRICS`].

use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// An `f64` stored bit-cast in an `AtomicU64`.
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn set(&self, val: f64) {
        self.0.store(val.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn inc(&self) {
        add_f64(&self.0, 1.0);
    }

    pub fn dec(&self) {
        add_f64(&self.0, -1.0);
    }
}

fn add_f64(cell: &AtomicU64, delta: f64) {
    let _ = cell.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
        Some((f64::from_bits(bits) + delta).to_bits())
    });
}

#[derive(Debug)]
pub struct Histogram {
    bounds: Vec<f64>,
    /// Cumulative; one slot per bound plus `+Inf`.
    buckets: Vec<AtomicU64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(bounds: Vec<f64>) -> Self {
        let buckets = (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            buckets,
            sum: AtomicU64::new(0.0_f64.to_bits()),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, val: f64) {
        for (bound, bucket) in self.bounds.iter().zip(&self.buckets) {
            if val <= *bound {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
        if let Some(inf) = self.buckets.last() {
            inf.fetch_add(1, Ordering::Relaxed);
        }
        add_f64(&self.sum, val);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> f64 {
        f64::from_bits(self.sum.load(Ordering::Relaxed))
    }
}

/// Counters keyed by the values of one label.
#[derive(Debug)]
pub struct CounterVec {
    label: &'static str,
    children: RwLock<BTreeMap<String, Arc<Counter>>>,
}

impl CounterVec {
    fn new(label: &'static str) -> Self {
        Self {
            label,
            children: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn with_label(&self, value: &str) -> Arc<Counter> {
        if let Some(counter) = self.children.read().get(value) {
            return Arc::clone(counter);
        }
        Arc::clone(
            self.children
                .write()
                .entry(value.to_string())
                .or_default(),
        )
    }

    pub fn inc(&self, value: &str) {
        self.with_label(value).inc();
    }

    pub fn get(&self, value: &str) -> u64 {
        self.children.read().get(value).map_or(0, |c| c.get())
    }
}

#[derive(Debug, Clone)]
enum Metric {
    Counter(Arc<Counter>),
    CounterVec(Arc<CounterVec>),
    Gauge(Arc<Gauge>),
    Histogram(Arc<Histogram>),
    Info {
        label: &'static str,
        value: String,
    },
}

impl Metric {
    fn type_name(&self) -> &'static str {
        match self {
            Metric::Counter(_) | Metric::CounterVec(_) => "counter",
            Metric::Gauge(_) | Metric::Info { .. } => "gauge",
            Metric::Histogram(_) => "histogram",
        }
    }
}

#[derive(Debug)]
struct Entry {
    name: &'static str,
    help: &'static str,
    metric: Metric,
}

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    entries: RwLock<Vec<Entry>>,
}

impl MetricsRegistry {
    fn push(&self, name: &'static str, help: &'static str, metric: Metric) {
        self.entries.write().push(Entry { name, help, metric });
    }

    pub fn counter(&self, name: &'static str, help: &'static str) -> Arc<Counter> {
        let counter = Arc::new(Counter::default());
        self.push(name, help, Metric::Counter(Arc::clone(&counter)));
        counter
    }

    pub fn counter_vec(
        &self,
        name: &'static str,
        help: &'static str,
        label: &'static str,
    ) -> Arc<CounterVec> {
        let family = Arc::new(CounterVec::new(label));
        self.push(name, help, Metric::CounterVec(Arc::clone(&family)));
        family
    }

    pub fn gauge(&self, name: &'static str, help: &'static str) -> Arc<Gauge> {
        let gauge = Arc::new(Gauge::default());
        self.push(name, help, Metric::Gauge(Arc::clone(&gauge)));
        gauge
    }

    pub fn histogram(
        &self,
        name: &'static str,
        help: &'static str,
        bounds: Vec<f64>,
    ) -> Arc<Histogram> {
        let histogram = Arc::new(Histogram::new(bounds));
        self.push(name, help, Metric::Histogram(Arc::clone(&histogram)));
        histogram
    }

    /// Constant `1` gauge carrying a single informational label.
    pub fn info(&self, name: &'static str, help: &'static str, label: &'static str, value: &str) {
        self.push(
            name,
            help,
            Metric::Info {
                label,
                value: value.to_string(),
            },
        );
    }

    pub fn render(&self) -> String {
        let entries = self.entries.read();
        let mut out = String::with_capacity(2048);
        for entry in entries.iter() {
            let name = entry.name;
            let _ = writeln!(out, "# HELP {} {}", name, entry.help);
            let _ = writeln!(out, "# TYPE {} {}", name, entry.metric.type_name());
            match &entry.metric {
                Metric::Counter(c) => {
                    let _ = writeln!(out, "{} {}", name, c.get());
                }
                Metric::CounterVec(family) => {
                    for (value, c) in family.children.read().iter() {
                        let _ = writeln!(
                            out,
                            "{}{{{}=\"{}\"}} {}",
                            name,
                            family.label,
                            escape_label_value(value),
                            c.get()
                        );
                    }
                }
                Metric::Gauge(g) => {
                    let _ = writeln!(out, "{} {}", name, format_number(g.get()));
                }
                Metric::Info { label, value } => {
                    let _ = writeln!(out, "{}{{{}=\"{}\"}} 1", name, label, escape_label_value(value));
                }
                Metric::Histogram(h) => render_histogram(&mut out, name, h),
            }
        }
        out
    }
}

fn render_histogram(out: &mut String, name: &str, h: &Histogram) {
    for (bound, bucket) in h.bounds.iter().zip(&h.buckets) {
        let _ = writeln!(
            out,
            "{}_bucket{{le=\"{}\"}} {}",
            name,
            format_number(*bound),
            bucket.load(Ordering::Relaxed)
        );
    }
    let inf = h.buckets.last().map_or(0, |b| b.load(Ordering::Relaxed));
    let _ = writeln!(out, "{}_bucket{{le=\"+Inf\"}} {}", name, inf);
    let _ = writeln!(out, "{}_sum {}", name, format_number(h.sum()));
    let _ = writeln!(out, "{}_count {}", name, h.count());
}

/// Integral values render without a trailing `.0`.
fn format_number(v: f64) -> String {
    if v.is_finite() && v == v.trunc() {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    }
}

fn escape_label_value(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

pub static METRICS: LazyLock<MetricsRegistry> = LazyLock::new(MetricsRegistry::default);

pub struct StandardMetrics {
    pub ws_connections_active: Arc<Gauge>,
    /// Inbound frames, by message type.
    pub ws_frames_total: Arc<CounterVec>,
    pub frames_dropped_total: Arc<CounterVec>,
    pub devices_online: Arc<Gauge>,
    /// Per-target dispatch outcome: `sent` or `skipped`.
    pub commands_total: Arc<CounterVec>,
    pub command_results_total: Arc<CounterVec>,
    pub command_duration_seconds: Arc<Histogram>,
    pub uptime_seconds: Arc<Gauge>,
}

pub static STD_METRICS: LazyLock<StandardMetrics> = LazyLock::new(|| register_standard(&METRICS));

fn register_standard(reg: &MetricsRegistry) -> StandardMetrics {
    reg.info(
        "fleetlink_build_info",
        "Build information",
        "version",
        env!("CARGO_PKG_VERSION"),
    );
    StandardMetrics {
        ws_connections_active: reg.gauge(
            "fleetlink_ws_connections_active",
            "Open WebSocket channels",
        ),
        ws_frames_total: reg.counter_vec(
            "fleetlink_ws_frames_total",
            "Inbound frames processed",
            "type",
        ),
        frames_dropped_total: reg.counter_vec(
            "fleetlink_frames_dropped_total",
            "Inbound frames dropped",
            "reason",
        ),
        devices_online: reg.gauge("fleetlink_devices_online", "Devices currently online"),
        commands_total: reg.counter_vec(
            "fleetlink_commands_total",
            "Command deliveries per target",
            "outcome",
        ),
        command_results_total: reg.counter_vec(
            "fleetlink_command_results_total",
            "Terminal command results",
            "status",
        ),
        command_duration_seconds: reg.histogram(
            "fleetlink_command_duration_seconds",
            "Time from dispatch to terminal result",
            vec![0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0],
        ),
        uptime_seconds: reg.gauge("fleetlink_uptime_seconds", "Server uptime in seconds"),
    }
}

pub async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        METRICS.render(),
    )
}
