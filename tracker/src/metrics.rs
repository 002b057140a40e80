use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref INGEST_TOTAL: Counter = Counter::with_opts(Opts::new(
        "tracker_ingest_total",
        "Total telemetry reports persisted"
    ))
    .unwrap();
    pub static ref INGEST_REJECTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "tracker_ingest_rejected_total",
        "Total reports rejected by validation or authorization"
    ))
    .unwrap();
    pub static ref STORAGE_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "tracker_storage_failures_total",
        "Total storage failures surfaced to producers"
    ))
    .unwrap();
    pub static ref DB_RETRIES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "tracker_db_retries_total",
        "Total retried database inserts after transient errors"
    ))
    .unwrap();
    pub static ref DELIVERIES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "tracker_deliveries_total",
        "Total messages queued to live subscribers"
    ))
    .unwrap();
    pub static ref DELIVERY_TIMEOUTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "tracker_delivery_timeouts_total",
        "Total deliveries abandoned after the delivery timeout"
    ))
    .unwrap();
    pub static ref DELIVERY_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "tracker_delivery_failures_total",
        "Total deliveries to closed or closing subscribers"
    ))
    .unwrap();
    pub static ref SUBSCRIBERS: Gauge = Gauge::with_opts(Opts::new(
        "tracker_subscribers",
        "Live subscriber connections"
    ))
    .unwrap();
    pub static ref INGEST_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "tracker_ingest_latency_seconds",
            "Time taken to persist and broadcast one report"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref PUBLISH_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "tracker_publish_latency_seconds",
            "Time taken to fan one record out to all subscribers"
        )
        .buckets(vec![
            0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
}

pub fn init_metrics() {
    REGISTRY.register(Box::new(INGEST_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(INGEST_REJECTED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(STORAGE_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY.register(Box::new(DB_RETRIES_TOTAL.clone())).unwrap();
    REGISTRY.register(Box::new(DELIVERIES_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(DELIVERY_TIMEOUTS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(DELIVERY_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY.register(Box::new(SUBSCRIBERS.clone())).unwrap();
    REGISTRY
        .register(Box::new(INGEST_LATENCY_SECONDS.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(PUBLISH_LATENCY_SECONDS.clone()))
        .unwrap();
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
