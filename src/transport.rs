//! Transport trait pair and the bundled adapters.

pub mod memory;
pub mod rest;
pub mod traits;

pub use memory::MemoryTransport;
pub use rest::RestTransport;
pub use traits::{Markup, SharedTransport, Transport, TransportDyn};
