// SPDX-License-Identifier: MIT

//! The conversation-flow engine
//!
//! - [`flow`] - graphs, expressions, node executors, runners and session stores
//! - [`engine`] - the session lifecycle callers drive through `advance`
//! - [`tools`] - tool registry and webhook tools
//! - [`server`] - HTTP surface

pub mod config;
pub mod engine;
pub mod error;
pub mod flow;
pub mod server;
pub mod tools;

pub use config::EngineConfig;
pub use engine::{AdvanceResponse, FlowEngine};
pub use error::{FailureCause, FailureKind, ParleyError};
