//! HTTP client for the flowload remote job service
//!
//! This crate provides the `reqwest` implementation of the engine's
//! `FlowService` contract:
//!
//! - [`HttpFlowService`]: one cookie-backed session per actor
//! - [`HttpServiceFactory`]: opens those sessions for the run controller
//! - [`ClientConfig`]: the `api` section of the configuration file
//!
//! Request bodies and response parsing live in `payload` and `parse` as pure
//! functions over JSON.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod parse;
pub mod payload;
mod service;

pub use config::{ClientConfig, ConfigValidationError};
pub use service::{HttpFlowService, HttpServiceFactory};
