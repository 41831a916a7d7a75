// SPDX-License-Identifier: MIT

//! Flow graphs and everything that walks them

pub mod condition;
pub mod graph;
pub mod loader;
pub mod nodes;
pub mod registry;
pub mod runner;
pub mod session;
pub mod state;
pub mod strategy;

pub use graph::{FlowDefinition, FlowGraph, GraphError};
pub use loader::{FlowCatalog, FlowLoader};
pub use nodes::{ExternalInput, NodeExecutor, Services};
pub use registry::ExecutorRegistry;
pub use session::{FileSessionStore, MemorySessionStore, Session, SessionMeta, SessionStore};
pub use state::{ExecutionContext, SessionStatus};
pub use strategy::Strategy;
