//! Multi-protocol imposter host.
//!
//! Imposters are listeners that emulate or transparently forward `tcp`,
//! `http`, `https`, `smtp` or operator-defined protocols. A
//! Mountebank-compatible admin API creates and inspects them.

pub mod admin_api;
pub mod config;
pub mod imposter;
pub mod lifecycle;
pub mod protocol;
pub mod proxy;
pub mod server;

pub use config::ServerOptions;
pub use server::{Server, ServerHandle};
