// SPDX-License-Identifier: MIT

//! parley-rs: a resumable conversation-flow execution engine.
//!
//! - [`adk`] holds the collaborator contracts the engine talks to (language
//!   model, tools, memory) and their error types.
//! - [`parley`] holds the engine itself: flow graphs, the expression language,
//!   node executors, the two routing strategies and the session lifecycle.

pub mod adk;
pub mod parley;
