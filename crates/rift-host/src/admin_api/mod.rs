//! Mountebank-compatible admin REST API.
//!
//! Creates, lists and deletes imposters, exposes recorded requests, and
//! receives request callbacks from out-of-process protocols. Connections
//! reach it through the admin listener's `ConnectionManager`.

mod handlers;
mod router;
mod server;
mod types;

pub use server::{AdminApi, AdminState};
