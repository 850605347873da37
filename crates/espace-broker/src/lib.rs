//! espace-broker — reliable publishing of user-visible log lines.
//!
//! Two halves: a confirm-based AMQP [`Publisher`] that serializes all
//! callers behind one mutex so at most one message is ever in flight, and a
//! [`UserLogLayer`] for `tracing` that picks out records tagged
//! `user_log = true` and forwards them to the broker with routing key
//! `<identifier>.log.<level>`.

mod layer;
mod publisher;

pub use layer::{UserLogLayer, UserLogRecord};
pub use publisher::{PublishError, Publisher, PublisherConfig};
