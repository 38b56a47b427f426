//! 🧠 In-memory backends: a row store and a transport that both live entirely in RAM.
//!
//! ⚠️ These are for tests and the CLI host. If you're deploying this to prod, please
//! also deploy a therapist. And a database.
//!
//! Both types are `Clone` and share their state through an `Arc`, so a test can hand one
//! copy to the pipeline and keep another to peek at what arrived.

mod in_mem_storage;
mod in_mem_transport;

pub use in_mem_storage::InMemoryStorage;
pub use in_mem_transport::{ForwardedPayload, InMemoryTransport};
