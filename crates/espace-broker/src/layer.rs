//! tracing layer that mirrors user-visible log records to the broker.

use std::fmt;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// One log record bound for the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct UserLogRecord {
    /// `<identifier>.log.<level>`.
    pub routing_key: String,
    /// JSON body: `@timestamp`, `message`, `levelname` plus all structured
    /// fields except the control fields `user_log` and `identifier`.
    pub body: Vec<u8>,
}

/// Layer that captures records tagged `user_log = true` carrying an
/// `identifier` field and queues them for publishing.
///
/// The layer never blocks the logging call site: records go into an
/// unbounded channel that a background task drains through the
/// [`crate::Publisher`].
pub struct UserLogLayer {
    sender: mpsc::UnboundedSender<UserLogRecord>,
}

impl UserLogLayer {
    /// The layer plus the receiving end for the forwarding task.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UserLogRecord>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl<S: Subscriber> Layer<S> for UserLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        if !visitor.user_log {
            return;
        }
        let Some(identifier) = visitor.identifier else {
            // A user log line without an identifier cannot be routed.
            return;
        };

        let level = level_name(*event.metadata().level());
        let mut body = visitor.fields;
        body.insert(
            "@timestamp".to_string(),
            Value::String(Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()),
        );
        body.insert("message".to_string(), Value::String(visitor.message));
        body.insert("levelname".to_string(), Value::String(level.to_string()));

        let Ok(body) = serde_json::to_vec(&Value::Object(body)) else {
            return;
        };
        let _ = self.sender.send(UserLogRecord {
            routing_key: format!("{identifier}.log.{level}"),
            body,
        });
    }
}

fn level_name(level: Level) -> &'static str {
    match level {
        Level::ERROR => "error",
        Level::WARN => "warning",
        Level::INFO => "info",
        Level::DEBUG => "debug",
        Level::TRACE => "trace",
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    user_log: bool,
    identifier: Option<String>,
    fields: Map<String, Value>,
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = format!("{value:?}"),
            "user_log" | "identifier" => {}
            name => {
                self.fields
                    .insert(name.to_string(), Value::String(format!("{value:?}")));
            }
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "identifier" => self.identifier = Some(value.to_string()),
            "user_log" => {}
            name => {
                self.fields
                    .insert(name.to_string(), Value::String(value.to_string()));
            }
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        match field.name() {
            "user_log" => self.user_log = value,
            name => {
                self.fields.insert(name.to_string(), Value::Bool(value));
            }
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.fields.insert(field.name().to_string(), value.into());
    }
}
