// Telemetry module - the trace-sink capability handed to request handlers
//
// Handlers never touch the OpenTelemetry globals directly. They receive a
// TraceSink, open one span per request, attach attributes, and end it. The
// production sink exports through OTLP (see otel.rs); tests swap in a
// recording sink and assert on the captured attributes.

pub mod otel;

/// Fixed span attribute names shared by both handler paths.
pub mod attrs {
    pub const PROMPT: &str = "gen_ai.prompt";
    pub const SYSTEM: &str = "gen_ai.system";
    pub const REQUEST_MODEL: &str = "gen_ai.request.model";
    pub const REQUEST_TEMPERATURE: &str = "gen_ai.request.temperature";
    pub const COMPLETION: &str = "gen_ai.completion";
    pub const USAGE_INPUT_TOKENS: &str = "gen_ai.usage.input_tokens";
    pub const USAGE_OUTPUT_TOKENS: &str = "gen_ai.usage.output_tokens";
    pub const USAGE_TOTAL_TOKENS: &str = "gen_ai.usage.total_tokens";
    pub const REQUEST_BODY: &str = "proxy.request.body";
    pub const RESPONSE_BODY: &str = "proxy.response.body";
    pub const TARGET_URL: &str = "http.target_url";
}

/// Capability for opening request-scoped spans.
///
/// Export is fire-and-forget: implementations must never surface telemetry
/// failures into the request path.
pub trait TraceSink: Send + Sync {
    fn start_span(&self, name: &'static str) -> Box<dyn TraceSpan>;
}

/// One span in flight. Attributes are write-once per key; `end` closes the
/// span and flushes it toward the exporter.
pub trait TraceSpan: Send {
    fn set_str(&mut self, key: &'static str, value: String);
    fn set_i64(&mut self, key: &'static str, value: i64);
    fn set_f64(&mut self, key: &'static str, value: f64);
    /// Mark the span as failed without ending it.
    fn set_error(&mut self, message: String);
    fn end(&mut self);
}

#[cfg(test)]
pub(crate) mod testing {
    use super::{TraceSink, TraceSpan};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq)]
    pub enum AttrValue {
        Str(String),
        I64(i64),
        F64(f64),
    }

    #[derive(Debug, Default)]
    pub struct RecordedSpan {
        pub name: &'static str,
        pub attrs: Vec<(&'static str, AttrValue)>,
        pub error: Option<String>,
        pub ended: bool,
    }

    impl RecordedSpan {
        pub fn str_attr(&self, key: &str) -> Option<&str> {
            self.attrs.iter().find_map(|(k, v)| match v {
                AttrValue::Str(s) if *k == key => Some(s.as_str()),
                _ => None,
            })
        }

        pub fn i64_attr(&self, key: &str) -> Option<i64> {
            self.attrs.iter().find_map(|(k, v)| match v {
                AttrValue::I64(n) if *k == key => Some(*n),
                _ => None,
            })
        }

        pub fn has_attr(&self, key: &str) -> bool {
            self.attrs.iter().any(|(k, _)| *k == key)
        }
    }

    /// Sink that captures spans in memory for assertions.
    #[derive(Clone, Default)]
    pub struct RecordingSink {
        pub spans: Arc<Mutex<Vec<RecordedSpan>>>,
    }

    impl RecordingSink {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl TraceSink for RecordingSink {
        fn start_span(&self, name: &'static str) -> Box<dyn TraceSpan> {
            let index = {
                let mut spans = self.spans.lock().unwrap();
                spans.push(RecordedSpan {
                    name,
                    ..RecordedSpan::default()
                });
                spans.len() - 1
            };
            Box::new(RecordingSpan {
                spans: self.spans.clone(),
                index,
            })
        }
    }

    struct RecordingSpan {
        spans: Arc<Mutex<Vec<RecordedSpan>>>,
        index: usize,
    }

    impl RecordingSpan {
        fn with_span(&self, f: impl FnOnce(&mut RecordedSpan)) {
            let mut spans = self.spans.lock().unwrap();
            f(&mut spans[self.index]);
        }
    }

    impl TraceSpan for RecordingSpan {
        fn set_str(&mut self, key: &'static str, value: String) {
            self.with_span(|span| span.attrs.push((key, AttrValue::Str(value))));
        }

        fn set_i64(&mut self, key: &'static str, value: i64) {
            self.with_span(|span| span.attrs.push((key, AttrValue::I64(value))));
        }

        fn set_f64(&mut self, key: &'static str, value: f64) {
            self.with_span(|span| span.attrs.push((key, AttrValue::F64(value))));
        }

        fn set_error(&mut self, message: String) {
            self.with_span(|span| span.error = Some(message));
        }

        fn end(&mut self) {
            self.with_span(|span| span.ended = true);
        }
    }
}
