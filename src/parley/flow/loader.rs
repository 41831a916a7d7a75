// SPDX-License-Identifier: MIT

//! Flow loader - YAML/JSON file loading and parsing
//!
//! Every flow goes through [`FlowGraph::new`], so a loaded flow is always a
//! validated one.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use super::graph::{FlowDefinition, FlowGraph};
use crate::parley::error::ParleyError;

/// Validated flows by id
#[derive(Debug, Clone, Default)]
pub struct FlowCatalog {
    flows: BTreeMap<String, Arc<FlowGraph>>,
}

impl FlowCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a flow; a later flow with the same id replaces the earlier one
    pub fn insert(&mut self, graph: FlowGraph) -> Arc<FlowGraph> {
        let graph = Arc::new(graph);
        if let Some(old) = self.flows.insert(graph.id().to_string(), graph.clone()) {
            log::warn!("Flow '{}' loaded twice, keeping the last one", old.id());
        }
        graph
    }

    pub fn get(&self, flow_id: &str) -> Option<Arc<FlowGraph>> {
        self.flows.get(flow_id).cloned()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.flows.keys().map(String::as_str)
    }

    pub fn flows(&self) -> impl Iterator<Item = &Arc<FlowGraph>> {
        self.flows.values()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

/// Loads flow definitions from YAML or JSON files
pub struct FlowLoader;

impl FlowLoader {
    pub fn new() -> Self {
        Self
    }

    /// Load and validate a flow file; `.json` is read as JSON, anything else as YAML
    pub fn load_flow<P: AsRef<Path>>(&self, path: P) -> Result<FlowGraph, ParleyError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        let graph = if is_json {
            Self::parse_json(&content)?
        } else {
            Self::parse_yaml(&content)?
        };
        log::info!("Loaded flow '{}' from {}", graph.id(), path.display());
        Ok(graph)
    }

    /// Parse and validate a flow from a YAML string
    pub fn parse_yaml(content: &str) -> Result<FlowGraph, ParleyError> {
        let def: FlowDefinition = serde_yaml::from_str(content)?;
        Ok(FlowGraph::new(def)?)
    }

    /// Parse and validate a flow from a JSON string
    pub fn parse_json(content: &str) -> Result<FlowGraph, ParleyError> {
        let def: FlowDefinition = serde_json::from_str(content)?;
        Ok(FlowGraph::new(def)?)
    }

    /// Load every `.yaml`, `.yml` and `.json` file in `dir`
    ///
    /// One bad flow rejects the whole directory.
    pub fn load_dir<P: AsRef<Path>>(&self, dir: P) -> Result<FlowCatalog, ParleyError> {
        let mut paths: Vec<_> = fs::read_dir(dir.as_ref())?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_file()
                    && p.extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|e| matches!(e, "yaml" | "yml" | "json"))
            })
            .collect();
        paths.sort();

        let mut catalog = FlowCatalog::new();
        for path in paths {
            let graph = self.load_flow(&path).map_err(|e| {
                ParleyError::Config(format!("{}: {}", path.display(), e))
            })?;
            catalog.insert(graph);
        }
        Ok(catalog)
    }
}

impl Default for FlowLoader {
    fn default() -> Self {
        Self::new()
    }
}
