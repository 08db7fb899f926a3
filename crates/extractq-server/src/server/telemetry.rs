//! # Telemetry Features
//!
//! Structured logs are always written through `tracing-subscriber`. On top of
//! that the relay can export OpenTelemetry spans and metrics.
//!
//! ## Feature matrix
//!
//! - `tracing`: OpenTelemetry spans for every session (`session`) and every
//!   job (`job`).
//! - `metrics`: OpenTelemetry counters and histograms for sessions, jobs,
//!   cache hits, upstream fetches and rate-limit waits.
//! - `stdout`: Export whichever of the above is enabled to stdout.
//!
//! ## Span behavior
//!
//! - Events inside a span (`tracing::info!`, etc.) become span events in
//!   the exporter.
//! - Events outside of a span only show up in the log output.
//!
//! ## Metrics behavior
//!
//! The `increment_*`/`record_*` helpers below compile to no-ops when
//! `metrics` is disabled, so call sites never need a `cfg`.
//!
//! ## Example usage
//!
//! ```bash
//! cargo run --bin extractq-server --features tracing,metrics,stdout
//! ```

// Disallow using `stdout` without `tracing` or `metrics`
#[cfg(all(feature = "stdout", not(any(feature = "tracing", feature = "metrics"))))]
compile_error!(
    "The 'stdout' feature requires at least one of 'tracing' or 'metrics' to be enabled."
);

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry_sdk::Resource;
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry_semantic_conventions as semvcns;

#[cfg(feature = "tracing")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "tracing")]
use opentelemetry_sdk::propagation::TraceContextPropagator;
#[cfg(feature = "tracing")]
use opentelemetry_sdk::trace as sdktrace;

pub struct TelemetryProviders {
    #[cfg(feature = "tracing")]
    pub tracer_provider: sdktrace::SdkTracerProvider,
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes and shuts down every exporter. Errors are printed rather than
    /// logged since the subscriber may already be gone.
    pub fn shutdown(&self) {
        #[cfg(feature = "tracing")]
        {
            if let Err(err) = self.tracer_provider.force_flush() {
                eprintln!("Error flushing traces: {err:#?}");
            }
            if let Err(err) = self.tracer_provider.shutdown() {
                eprintln!("Error shutting down tracer: {err:#?}");
            }
        }

        #[cfg(feature = "metrics")]
        {
            if let Err(err) = self.meter_provider.force_flush() {
                eprintln!("Error flushing metrics: {err:#?}");
            }
            if let Err(err) = self.meter_provider.shutdown() {
                eprintln!("Error shutting down meter: {err:#?}");
            }
        }
    }
}

pub fn init_telemetry() -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "tracing")]
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    #[cfg(feature = "tracing")]
    let tracer_provider = init_tracer();

    #[cfg(feature = "metrics")]
    let meter_provider = init_metrics();

    #[cfg(any(feature = "metrics", feature = "tracing"))]
    let scope = InstrumentationScope::builder("extractq")
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semvcns::SCHEMA_URL)
        .build();

    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true),
        );

    #[cfg(feature = "tracing")]
    let registry = {
        opentelemetry::global::set_tracer_provider(tracer_provider.clone());
        registry.with(
            tracing_opentelemetry::layer()
                .with_tracer(tracer_provider.tracer_with_scope(scope.clone()))
                .with_error_records_to_exceptions(true),
        )
    };

    #[cfg(feature = "metrics")]
    let registry = {
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        let meter = opentelemetry::global::meter_with_scope(scope);
        init_metric_handles(meter);

        registry.with(tracing_opentelemetry::MetricsLayer::new(
            meter_provider.clone(),
        ))
    };

    registry.try_init()?;

    Ok(TelemetryProviders {
        #[cfg(feature = "tracing")]
        tracer_provider,
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

#[cfg(any(feature = "metrics", feature = "tracing"))]
fn resource() -> Resource {
    Resource::builder()
        .with_service_name("extractq")
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

#[cfg(feature = "metrics")]
fn init_metrics() -> sdkmetrics::SdkMeterProvider {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::MetricExporter;
        let exporter = MetricExporter::default();
        let reader = opentelemetry_sdk::metrics::PeriodicReader::builder(exporter)
            .with_interval(std::time::Duration::from_secs(5))
            .build();

        builder.with_reader(reader)
    };

    builder.build()
}

#[cfg(feature = "tracing")]
fn init_tracer() -> sdktrace::SdkTracerProvider {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::SpanExporter;
        let exporter = SpanExporter::default();
        let batch = sdktrace::BatchSpanProcessor::builder(exporter)
            .with_batch_config(
                sdktrace::BatchConfigBuilder::default()
                    .with_scheduled_delay(std::time::Duration::from_secs(5))
                    .with_max_queue_size(2048)
                    .build(),
            )
            .build();
        builder.with_span_processor(batch)
    };

    builder.build()
}

// Metric handles - only compiled when metrics feature is enabled
#[cfg(feature = "metrics")]
static SESSIONS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static SESSIONS_INFLIGHT: OnceLock<UpDownCounter<i64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static QUEUE_DEPTH: OnceLock<UpDownCounter<i64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static JOBS_FAILED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static JOB_DURATION_SECS: OnceLock<Histogram<f64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static CACHE_HITS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static UPSTREAM_FETCHES: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static UPSTREAM_WAIT_SECS: OnceLock<Histogram<f64>> = OnceLock::new();

#[cfg(feature = "metrics")]
fn init_metric_handles(meter: Meter) {
    let _ = SESSIONS.set(
        meter
            .u64_counter("sessions")
            .with_description("Accepted client connections")
            .build(),
    );

    let _ = SESSIONS_INFLIGHT.set(
        meter
            .i64_up_down_counter("sessions_inflight")
            .with_description("Open client connections")
            .build(),
    );

    let _ = QUEUE_DEPTH.set(
        meter
            .i64_up_down_counter("queue_depth")
            .with_description("Jobs waiting for the worker")
            .build(),
    );

    let _ = JOBS_FAILED.set(
        meter
            .u64_counter("jobs_failed")
            .with_description("Jobs that ended with an error")
            .build(),
    );

    let _ = JOB_DURATION_SECS.set(
        meter
            .f64_histogram("job_duration")
            .with_unit("s")
            .with_description("Time from dequeue to terminal event")
            .build(),
    );

    let _ = CACHE_HITS.set(
        meter
            .u64_counter("cache_hits")
            .with_description("Chunks served from the disk cache")
            .build(),
    );

    let _ = UPSTREAM_FETCHES.set(
        meter
            .u64_counter("upstream_fetches")
            .with_description("Queries sent to the upstream")
            .build(),
    );

    let _ = UPSTREAM_WAIT_SECS.set(
        meter
            .f64_histogram("upstream_wait")
            .with_unit("s")
            .with_description("Rate-limit backoff per wait")
            .build(),
    );
}

// Convenience functions that compile to no-ops when metrics are disabled
#[cfg(feature = "metrics")]
pub fn increment_sessions() {
    if let Some(counter) = SESSIONS.get() {
        counter.add(1, &[]);
    }
    if let Some(counter) = SESSIONS_INFLIGHT.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_sessions() {}

#[cfg(feature = "metrics")]
pub fn decrement_sessions_inflight() {
    if let Some(counter) = SESSIONS_INFLIGHT.get() {
        counter.add(-1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn decrement_sessions_inflight() {}

#[cfg(feature = "metrics")]
pub fn record_job_enqueued() {
    if let Some(counter) = QUEUE_DEPTH.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_job_enqueued() {}

#[cfg(feature = "metrics")]
pub fn record_job_dequeued() {
    if let Some(counter) = QUEUE_DEPTH.get() {
        counter.add(-1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_job_dequeued() {}

#[cfg(feature = "metrics")]
pub fn record_job_finished(duration_secs: f64, failed: bool) {
    if let Some(histogram) = JOB_DURATION_SECS.get() {
        histogram.record(duration_secs, &[KeyValue::new("failed", failed)]);
    }
    if failed {
        if let Some(counter) = JOBS_FAILED.get() {
            counter.add(1, &[]);
        }
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_job_finished(_duration_secs: f64, _failed: bool) {}

#[cfg(feature = "metrics")]
pub fn increment_cache_hits() {
    if let Some(counter) = CACHE_HITS.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_cache_hits() {}

#[cfg(feature = "metrics")]
pub fn increment_upstream_fetches() {
    if let Some(counter) = UPSTREAM_FETCHES.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_upstream_fetches() {}

#[cfg(feature = "metrics")]
pub fn record_upstream_wait(secs: f64) {
    if let Some(histogram) = UPSTREAM_WAIT_SECS.get() {
        histogram.record(secs, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_upstream_wait(_secs: f64) {}
