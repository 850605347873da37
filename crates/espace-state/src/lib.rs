//! espace-state — keyed blob store on top of the shared key-value database.
//!
//! Every record lives under its own key; a [`StoreHandle`] is bound to
//! exactly one key and supports read, write and delete. There is no
//! iteration and no multi-key transaction: the provider relies on per-key
//! single-writer discipline only.
//!
//! The store supports both an etcd backend and an in-memory backend
//! (the latter for testing).

mod error;
mod store;

pub use error::{StateError, StateResult};
pub use store::{StateStore, StoreHandle};
