//! Adapters behind the `heliora-core` trait seams.
//!
//! - [`storage`]: the sled-backed durable store plus an in-memory twin
//!   for tests.
//! - [`bus`]: the in-process single-partition message bus the services
//!   consume.
//! - [`kma`]: the upstream irradiance fetch/parse client.
//! - [`egress`]: outbound-URL validation applied before any fetch.

pub mod bus;
pub mod egress;
pub mod kma;
pub mod storage;

pub use bus::{MessageBus, Publisher, Record, Subscription};
pub use kma::{KmaClient, SampleSource};
pub use storage::{InMemoryStore, SledStore};
