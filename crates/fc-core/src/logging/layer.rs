//! Custom tracing layer for JSONL output.
//!
//! Each event becomes one [`LogEvent`] line. The tracing target is the event
//! name; a `worker` field on an enclosing span is lifted to the top level.

use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::Mutex;

use tracing::span::{Attributes, Id};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

use super::events::{Level, LogEvent};

/// Storage for span context data.
#[derive(Debug, Clone, Default)]
struct SpanContext {
    worker: Option<u64>,
}

/// A visitor that extracts field values from tracing events.
struct JsonFieldVisitor {
    fields: HashMap<String, serde_json::Value>,
    message: Option<String>,
}

impl JsonFieldVisitor {
    fn new() -> Self {
        JsonFieldVisitor {
            fields: HashMap::new(),
            message: None,
        }
    }

    fn insert(&mut self, field: &tracing::field::Field, value: serde_json::Value) {
        self.fields.insert(field.name().to_string(), value);
    }
}

impl tracing::field::Visit for JsonFieldVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.insert(field, serde_json::Value::String(value.to_string()));
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        let s = format!("{:?}", value);
        if field.name() == "message" {
            self.message = Some(s);
        } else {
            self.insert(field, serde_json::Value::String(s));
        }
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.insert(field, serde_json::Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.insert(field, serde_json::Value::Number(value.into()));
    }

    fn record_f64(&mut self, field: &tracing::field::Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.insert(field, serde_json::Value::Number(n));
        }
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.insert(field, serde_json::Value::Bool(value));
    }
}

struct SpanContextVisitor {
    context: SpanContext,
}

impl tracing::field::Visit for SpanContextVisitor {
    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        if field.name() == "worker" {
            self.context.worker = Some(value);
        }
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        if field.name() == "worker" && value >= 0 {
            self.context.worker = Some(value as u64);
        }
    }

    fn record_debug(&mut self, _field: &tracing::field::Field, _value: &dyn std::fmt::Debug) {}
}

/// JSONL tracing layer that outputs to stderr.
pub struct JsonlLayer<W = io::Stderr> {
    writer: Mutex<W>,
}

impl JsonlLayer<io::Stderr> {
    /// Create a new JSONL layer writing to stderr.
    pub fn stderr() -> Self {
        JsonlLayer {
            writer: Mutex::new(io::stderr()),
        }
    }
}

impl<W: Write> JsonlLayer<W> {
    /// Create a new JSONL layer with a custom writer.
    pub fn new(writer: W) -> Self {
        JsonlLayer {
            writer: Mutex::new(writer),
        }
    }
}

impl<S, W> Layer<S> for JsonlLayer<W>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: Write + 'static,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let mut visitor = SpanContextVisitor {
            context: SpanContext::default(),
        };
        attrs.record(&mut visitor);

        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(visitor.context);
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let worker = ctx.event_scope(event).and_then(|scope| {
            scope
                .filter_map(|span| span.extensions().get::<SpanContext>().and_then(|c| c.worker))
                .next()
        });

        let mut visitor = JsonFieldVisitor::new();
        event.record(&mut visitor);

        let level: Level = (*event.metadata().level()).into();
        let mut record = LogEvent::new(
            level,
            event.metadata().target(),
            visitor.message.unwrap_or_default(),
        );
        record.worker = worker;
        record.fields = visitor.fields;

        let line = record.to_jsonl();
        if let Ok(mut writer) = self.writer.lock() {
            let _ = writeln!(writer, "{}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::event_names;
    use std::sync::Arc;
    use tracing_subscriber::layer::SubscriberExt;

    struct BufWriter(Arc<Mutex<Vec<u8>>>);

    impl Write for BufWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture(f: impl FnOnce()) -> Vec<serde_json::Value> {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let layer = JsonlLayer::new(BufWriter(buffer.clone()));
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, f);

        let output = buffer.lock().unwrap();
        String::from_utf8_lossy(&output)
            .lines()
            .map(|l| serde_json::from_str(l).expect("valid JSON line"))
            .collect()
    }

    #[test]
    fn layer_uses_target_as_event_name() {
        let lines = capture(|| {
            tracing::info!(target: event_names::QUIRK_DETECTED, quirk = "no_user_xattr", "xattrs unusable");
        });
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["event"], "quirk.detected");
        assert_eq!(lines[0]["component"], "quirk");
        assert_eq!(lines[0]["level"], "info");
        assert_eq!(lines[0]["message"], "xattrs unusable");
        assert_eq!(lines[0]["fields"]["quirk"], "no_user_xattr");
    }

    #[test]
    fn layer_lifts_worker_from_span() {
        let lines = capture(|| {
            let _span = tracing::info_span!("worker", worker = 3u64).entered();
            tracing::warn!(target: event_names::IMPERSONATE_ROLLBACK, op = "setreuid", "rolled back");
        });
        assert_eq!(lines[0]["worker"], 3);
        assert_eq!(lines[0]["level"], "warn");
    }

    #[test]
    fn layer_records_typed_fields() {
        let lines = capture(|| {
            tracing::debug!(target: "test.fields", uid = 1235u32, ok = true, delta = -4i64, "typed");
        });
        assert_eq!(lines[0]["fields"]["uid"], 1235);
        assert_eq!(lines[0]["fields"]["ok"], true);
        assert_eq!(lines[0]["fields"]["delta"], -4);
        assert!(lines[0].get("component").is_none());
    }

    #[test]
    fn layer_output_has_timestamp() {
        let lines = capture(|| tracing::error!(target: event_names::IMPERSONATE_RESTORE_FAILED, "fatal"));
        assert!(lines[0]["ts"].is_string());
    }
}
