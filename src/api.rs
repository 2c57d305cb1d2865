//! Inbound HTTP API.

pub mod server;

pub use server::{ApiState, serve};
