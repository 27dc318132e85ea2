//! Logs, spans and PSG metrics.
//!
//! Console logs go through `tracing_subscriber::fmt` and are always on. The
//! optional features add OpenTelemetry export on top:
//!
//! - `tracing`: spans (one per served request, see the handler) and events
//!   recorded inside them.
//! - `metrics`: the request and reply instruments described on
//!   [`PsgMetrics`].
//! - `honeycomb`, `stdout`: where the above are exported. Each needs
//!   `tracing` or `metrics`.
//!
//! The `record_*` functions are the only way the server reports metrics;
//! they compile to nothing without the `metrics` feature.

#[cfg(all(
    any(feature = "honeycomb", feature = "stdout"),
    not(any(feature = "tracing", feature = "metrics"))
))]
compile_error!("The 'honeycomb' and 'stdout' exporters require 'tracing' or 'metrics'.");

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(all(feature = "honeycomb", any(feature = "metrics", feature = "tracing")))]
use opentelemetry_otlp::{Compression, Protocol, WithExportConfig, WithTonicConfig};
#[cfg(all(feature = "honeycomb", feature = "metrics"))]
use opentelemetry_sdk::metrics::Temporality;
#[cfg(all(feature = "honeycomb", any(feature = "metrics", feature = "tracing")))]
use tonic::{metadata::MetadataMap, transport::ClientTlsConfig};

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

pub fn init_telemetry() -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "tracing")]
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    #[cfg(feature = "tracing")]
    let tracer_provider = init_tracer()?;

    #[cfg(feature = "metrics")]
    let meter_provider = init_metrics()?;

    #[cfg(any(feature = "metrics", feature = "tracing"))]
    let scope = InstrumentationScope::builder("psg")
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
                .with_file(true)
                .pretty(),
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
        let _ = METRICS.set(PsgMetrics::new(&opentelemetry::global::meter_with_scope(scope)));
        registry.with(tracing_opentelemetry::MetricsLayer::new(
            meter_provider.clone(),
        ))
    };

    registry.init();

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
        .with_service_name("psg")
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

/// OTLP/gRPC settings shared by the span and metric exporters, read from
/// `HONEYCOMB_API_KEY`, `HONEYCOMB_DATASET`, `HONEYCOMB_ENDPOINT` and
/// `HONEYCOMB_COMPRESSION`.
#[cfg(all(feature = "honeycomb", any(feature = "metrics", feature = "tracing")))]
struct Honeycomb {
    metadata: MetadataMap,
    endpoint: String,
    compression: Compression,
}

#[cfg(all(feature = "honeycomb", any(feature = "metrics", feature = "tracing")))]
impl Honeycomb {
    fn from_env() -> anyhow::Result<Self> {
        use anyhow::Context;
        use std::str::FromStr;

        let var = |name: &str| std::env::var(name).with_context(|| format!("missing `{name}`"));
        let mut metadata = MetadataMap::new();
        metadata.insert(
            "x-honeycomb-team",
            var("HONEYCOMB_API_KEY")?.parse().context("invalid API key")?,
        );
        metadata.insert(
            "x-honeycomb-dataset",
            var("HONEYCOMB_DATASET")?.parse().context("invalid dataset")?,
        );
        Ok(Self {
            metadata,
            endpoint: var("HONEYCOMB_ENDPOINT")?,
            compression: Compression::from_str(&var("HONEYCOMB_COMPRESSION")?.to_ascii_lowercase())?,
        })
    }
}

#[cfg(feature = "metrics")]
fn init_metrics() -> anyhow::Result<sdkmetrics::SdkMeterProvider> {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = builder.with_reader(
        sdkmetrics::PeriodicReader::builder(opentelemetry_stdout::MetricExporter::default())
            .with_interval(std::time::Duration::from_secs(5))
            .build(),
    );

    #[cfg(feature = "honeycomb")]
    let builder = {
        use anyhow::Context;

        let honeycomb = Honeycomb::from_env()?;
        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_tls_config(ClientTlsConfig::new().with_native_roots())
            .with_metadata(honeycomb.metadata)
            .with_timeout(std::time::Duration::from_secs(10))
            .with_compression(honeycomb.compression)
            .with_endpoint(honeycomb.endpoint)
            .with_protocol(Protocol::Grpc)
            .with_temporality(Temporality::Delta)
            .build()
            .context("failed to build metrics exporter")?;
        builder.with_periodic_exporter(exporter)
    };

    Ok(builder.build())
}

#[cfg(feature = "tracing")]
fn init_tracer() -> anyhow::Result<sdktrace::SdkTracerProvider> {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = builder.with_span_processor(batch(opentelemetry_stdout::SpanExporter::default()));

    #[cfg(feature = "honeycomb")]
    let builder = {
        use anyhow::Context;

        let honeycomb = Honeycomb::from_env()?;
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_tls_config(ClientTlsConfig::new().with_native_roots())
            .with_metadata(honeycomb.metadata)
            .with_timeout(std::time::Duration::from_secs(10))
            .with_compression(honeycomb.compression)
            .with_endpoint(honeycomb.endpoint)
            .with_protocol(Protocol::Grpc)
            .build()
            .context("failed to build tracer exporter")?;
        builder.with_span_processor(batch(exporter))
    };

    Ok(builder.build())
}

#[cfg(all(feature = "tracing", any(feature = "stdout", feature = "honeycomb")))]
fn batch(exporter: impl sdktrace::SpanExporter + 'static) -> sdktrace::BatchSpanProcessor {
    sdktrace::BatchSpanProcessor::builder(exporter)
        .with_batch_config(
            sdktrace::BatchConfigBuilder::default()
                .with_scheduled_delay(std::time::Duration::from_secs(5))
                .with_max_queue_size(2048)
                .build(),
        )
        .build()
}

/// Why a request never reached the dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rejection {
    /// Malformed query parameters (400).
    BadRequest,
    /// The server is shutting down (503).
    ShuttingDown,
}

#[cfg_attr(not(feature = "metrics"), allow(dead_code))]
impl Rejection {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BadRequest => "bad_request",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

/// How a dispatched request ended, as seen when its body goes away.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(not(feature = "metrics"), allow(dead_code))]
pub struct RequestOutcome {
    pub kind: &'static str,
    /// Aggregated PSG status of the reply.
    pub status: u16,
    /// The client dropped the connection before the reply completed.
    pub canceled: bool,
    pub duration_ms: f64,
    pub chunks: u64,
}

#[cfg_attr(not(feature = "metrics"), allow(dead_code))]
impl RequestOutcome {
    /// The `outcome` attribute: `canceled` or the status class of the reply.
    pub const fn label(&self) -> &'static str {
        if self.canceled {
            return "canceled";
        }
        match self.status {
            0..=299 => "ok",
            404 => "not_found",
            400..=499 => "client_error",
            _ => "server_error",
        }
    }
}

/// Instruments exported under the `psg` scope.
///
/// | name                      | kind      | attributes         |
/// | ------------------------- | --------- | ------------------ |
/// | `psg.requests`            | counter   | `kind`             |
/// | `psg.requests.rejected`   | counter   | `reason`           |
/// | `psg.requests.inflight`   | up/down   |                    |
/// | `psg.requests.finished`   | counter   | `kind`, `outcome`  |
/// | `psg.reply.duration`      | histogram | `kind`, `outcome`  |
/// | `psg.reply.chunks`        | histogram | `kind`             |
/// | `psg.processors.forced`   | counter   | `why`              |
#[cfg(feature = "metrics")]
pub struct PsgMetrics {
    requests: Counter<u64>,
    rejected: Counter<u64>,
    inflight: UpDownCounter<i64>,
    finished: Counter<u64>,
    duration_ms: Histogram<f64>,
    chunks: Histogram<u64>,
    forced: Counter<u64>,
}

#[cfg(feature = "metrics")]
static METRICS: OnceLock<PsgMetrics> = OnceLock::new();

#[cfg(feature = "metrics")]
impl PsgMetrics {
    fn new(meter: &Meter) -> Self {
        Self {
            requests: meter
                .u64_counter("psg.requests")
                .with_description("Decoded requests by kind")
                .build(),
            rejected: meter
                .u64_counter("psg.requests.rejected")
                .with_description("Requests answered before dispatch")
                .build(),
            inflight: meter
                .i64_up_down_counter("psg.requests.inflight")
                .with_description("Replies currently streaming")
                .build(),
            finished: meter
                .u64_counter("psg.requests.finished")
                .with_description("Dispatched requests by outcome")
                .build(),
            duration_ms: meter
                .f64_histogram("psg.reply.duration")
                .with_unit("ms")
                .with_description("Time from request creation to the end of the reply stream")
                .build(),
            chunks: meter
                .u64_histogram("psg.reply.chunks")
                .with_description("Logical chunks per reply")
                .build(),
            forced: meter
                .u64_counter("psg.processors.forced")
                .with_description("Processors finished by the server after a panic or the deadline")
                .build(),
        }
    }
}

#[cfg(feature = "metrics")]
fn with_metrics(f: impl FnOnce(&PsgMetrics)) {
    if let Some(metrics) = METRICS.get() {
        f(metrics);
    }
}

/// A request was decoded and is about to be dispatched.
pub fn record_request(_kind: &'static str) {
    #[cfg(feature = "metrics")]
    with_metrics(|m| m.requests.add(1, &[KeyValue::new("kind", _kind)]));
}

pub fn record_rejection(_reason: Rejection) {
    #[cfg(feature = "metrics")]
    with_metrics(|m| m.rejected.add(1, &[KeyValue::new("reason", _reason.as_str())]));
}

/// `delta` is +1 when a reply starts streaming and -1 when it ends.
pub fn record_inflight(_delta: i64) {
    #[cfg(feature = "metrics")]
    with_metrics(|m| m.inflight.add(_delta, &[]));
}

pub fn record_outcome(_outcome: &RequestOutcome) {
    #[cfg(feature = "metrics")]
    with_metrics(|m| {
        let attrs = [
            KeyValue::new("kind", _outcome.kind),
            KeyValue::new("outcome", _outcome.label()),
        ];
        m.finished.add(1, &attrs);
        m.duration_ms.record(_outcome.duration_ms, &attrs);
        m.chunks.record(_outcome.chunks, &attrs[..1]);
    });
}

/// `count` processors were finished on their behalf; `why` is `panic` or
/// `deadline`.
pub fn record_forced_finish(_why: &'static str, _count: u64) {
    #[cfg(feature = "metrics")]
    with_metrics(|m| m.forced.add(_count, &[KeyValue::new("why", _why)]));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(status: u16, canceled: bool) -> RequestOutcome {
        RequestOutcome {
            kind: "resolve",
            status,
            canceled,
            duration_ms: 1.0,
            chunks: 2,
        }
    }

    #[test]
    fn outcome_labels_follow_the_reply_status() {
        assert_eq!(outcome(200, false).label(), "ok");
        assert_eq!(outcome(404, false).label(), "not_found");
        assert_eq!(outcome(403, false).label(), "client_error");
        assert_eq!(outcome(500, false).label(), "server_error");
        assert_eq!(outcome(200, true).label(), "canceled");
    }

    #[test]
    fn recording_without_an_exporter_is_harmless() {
        record_request("resolve");
        record_rejection(Rejection::BadRequest);
        record_inflight(1);
        record_inflight(-1);
        record_outcome(&outcome(200, false));
        record_forced_finish("panic", 1);
    }
}
