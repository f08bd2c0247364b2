// OpenTelemetry setup - OTLP span export plus the production TraceSink
//
// Initialization happens exactly once at process startup. Attempting to
// initialize twice (tests, embedding setups) is benign: it logs at debug
// level and keeps the first configuration. Spans are exported by a batch
// processor on the Tokio runtime; an unreachable collector drops spans
// without ever affecting request handling.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use opentelemetry::global;
use opentelemetry::trace::{Span, SpanKind, Status, Tracer};
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig as _;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::Resource;
use tracing_subscriber::EnvFilter;

use super::{TraceSink, TraceSpan};

/// Instrumentation scope and service.name reported to the collector.
const SERVICE_NAME: &str = "ollatap";

static TRACER_INIT: AtomicBool = AtomicBool::new(false);

/// Install the fmt subscriber (stderr, RUST_LOG filter, default "info").
/// A subscriber installed earlier - e.g. by a test harness - wins silently.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Keeps the tracer provider alive; dropping it flushes remaining spans.
pub struct OtelGuard {
    provider: TracerProvider,
}

impl Drop for OtelGuard {
    fn drop(&mut self) {
        if let Err(err) = self.provider.shutdown() {
            tracing::debug!("tracer provider shutdown: {err:?}");
        }
    }
}

/// Set up the global tracer provider with an OTLP http exporter.
///
/// `endpoint` overrides the exporter's default collector address. Must be
/// called from within the Tokio runtime - the batch processor spawns its
/// export task immediately.
pub fn init_tracer(endpoint: Option<&str>) -> Result<Option<OtelGuard>> {
    if TRACER_INIT.swap(true, Ordering::SeqCst) {
        tracing::debug!("telemetry already initialized; keeping existing tracer");
        return Ok(None);
    }

    let mut builder = opentelemetry_otlp::SpanExporter::builder().with_http();
    if let Some(endpoint) = endpoint {
        builder = builder.with_endpoint(endpoint.to_string());
    }
    let exporter = builder.build().context("failed to build OTLP span exporter")?;

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_resource(Resource::new([
            KeyValue::new("service.name", SERVICE_NAME),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ]))
        .build();

    global::set_tracer_provider(provider.clone());

    Ok(Some(OtelGuard { provider }))
}

/// TraceSink backed by the globally registered tracer provider. Before
/// `init_tracer` runs this resolves to the no-op tracer, which is exactly
/// the fire-and-forget behavior the handlers rely on.
pub struct OtelSink {
    tracer: global::BoxedTracer,
}

impl OtelSink {
    pub fn new() -> Self {
        Self {
            tracer: global::tracer(SERVICE_NAME),
        }
    }
}

impl Default for OtelSink {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceSink for OtelSink {
    fn start_span(&self, name: &'static str) -> Box<dyn TraceSpan> {
        let span = self
            .tracer
            .span_builder(name)
            .with_kind(SpanKind::Server)
            .start(&self.tracer);
        Box::new(OtelSpan { span })
    }
}

struct OtelSpan {
    span: global::BoxedSpan,
}

impl TraceSpan for OtelSpan {
    fn set_str(&mut self, key: &'static str, value: String) {
        self.span.set_attribute(KeyValue::new(key, value));
    }

    fn set_i64(&mut self, key: &'static str, value: i64) {
        self.span.set_attribute(KeyValue::new(key, value));
    }

    fn set_f64(&mut self, key: &'static str, value: f64) {
        self.span.set_attribute(KeyValue::new(key, value));
    }

    fn set_error(&mut self, message: String) {
        self.span.set_status(Status::error(message));
    }

    fn end(&mut self) {
        self.span.end();
    }
}
