use std::sync::LazyLock;

use prometheus::{
    exponential_buckets,
    Histogram,
    HistogramOpts,
    HistogramTimer,
    IntCounter,
    Registry,
};

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// The pipeline's metric registry, for embedders that want to gather it.
pub fn registry() -> &'static Registry {
    &REGISTRY
}

static SERIES_COPY_SECONDS: LazyLock<Histogram> = LazyLock::new(|| {
    let histogram = Histogram::with_opts(
        HistogramOpts::new(
            "tsdbcopy_series_copy_seconds",
            "Time spent appending one series' window into a tenant block",
        )
        .buckets(vec![0.001, 0.002, 0.004, 0.008, 0.016, 0.064, 0.256, 1.024]),
    )
    .expect("valid histogram opts");
    REGISTRY
        .register(Box::new(histogram.clone()))
        .expect("register series copy histogram");
    histogram
});

static DB_FLUSH_SECONDS: LazyLock<Histogram> = LazyLock::new(|| {
    let histogram = Histogram::with_opts(HistogramOpts::new(
        "tsdbcopy_db_flush_seconds",
        "Time spent finalizing a tenant block",
    ))
    .expect("valid histogram opts");
    REGISTRY
        .register(Box::new(histogram.clone()))
        .expect("register flush histogram");
    histogram
});

static COMPACT_SECONDS: LazyLock<Histogram> = LazyLock::new(|| {
    let histogram = Histogram::with_opts(
        HistogramOpts::new(
            "tsdbcopy_compact_seconds",
            "Time spent merging one compaction job",
        )
        .buckets(exponential_buckets(0.01, 4.0, 8).expect("valid buckets")),
    )
    .expect("valid histogram opts");
    REGISTRY
        .register(Box::new(histogram.clone()))
        .expect("register compact histogram");
    histogram
});

static SAMPLES_COPIED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "tsdbcopy_samples_copied_total",
        "Samples committed across all tenants",
    )
    .expect("valid counter opts");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register samples counter");
    counter
});

pub fn series_copy_timer() -> HistogramTimer {
    SERIES_COPY_SECONDS.start_timer()
}

pub fn db_flush_timer() -> HistogramTimer {
    DB_FLUSH_SECONDS.start_timer()
}

pub fn compact_timer() -> HistogramTimer {
    COMPACT_SECONDS.start_timer()
}

pub fn log_samples_copied(count: u64) {
    SAMPLES_COPIED_TOTAL.inc_by(count);
}
