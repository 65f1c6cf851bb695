//! Mountebank-compatible imposter management for Rift.
//!
//! This module provides:
//! - `ImposterManager`: Lifecycle management for imposters
//! - `Imposter`: A running protocol server on one port plus its request log
//! - `ImposterConfig`: Configuration for creating imposters
//!
//! Each imposter binds its own port through the protocol it names.
//!
//! ## Module Structure
//!
//! - `types`: Configuration, response plan and errors
//! - `core`: Imposter and RequestLog
//! - `manager`: ImposterManager for lifecycle management

mod core;
mod manager;
mod types;

#[cfg(test)]
mod tests;

pub use core::{Imposter, RequestLog};
pub use manager::ImposterManager;
pub use types::{ImposterConfig, ImposterError, ResponsePlan, Stub};
