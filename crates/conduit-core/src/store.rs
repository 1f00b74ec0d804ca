use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{ConduitError, Result};
use crate::flow::Flow;
use crate::traits::FlowStore;

/// Flow definitions held in memory.
#[derive(Default)]
pub struct InMemoryFlowStore {
    flows: RwLock<HashMap<String, Arc<Flow>>>,
}

impl InMemoryFlowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, flow: Flow) {
        self.flows.write().insert(flow.id.clone(), Arc::new(flow));
    }

    pub fn with_flow(self, flow: Flow) -> Self {
        self.insert(flow);
        self
    }

    pub fn len(&self) -> usize {
        self.flows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.read().is_empty()
    }
}

impl FlowStore for InMemoryFlowStore {
    fn load(&self, flow_id: &str) -> BoxFuture<'_, Result<Arc<Flow>>> {
        let found = self.flows.read().get(flow_id).cloned();
        let flow_id = flow_id.to_string();
        Box::pin(async move { found.ok_or(ConduitError::FlowNotFound(flow_id)) })
    }
}

/// Flow definitions stored as `<dir>/<flow_id>.json`.
pub struct DirectoryFlowStore {
    dir: PathBuf,
}

impl DirectoryFlowStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, flow_id: &str) -> Option<PathBuf> {
        // Reject ids that would escape the directory.
        if flow_id.is_empty() || flow_id.contains(['/', '\\']) || flow_id.contains("..") {
            return None;
        }
        Some(self.dir.join(format!("{}.json", flow_id)))
    }
}

impl FlowStore for DirectoryFlowStore {
    fn load(&self, flow_id: &str) -> BoxFuture<'_, Result<Arc<Flow>>> {
        let flow_id = flow_id.to_string();
        Box::pin(async move {
            let path = self
                .path_for(&flow_id)
                .ok_or_else(|| ConduitError::FlowNotFound(flow_id.clone()))?;
            debug!(flow_id = %flow_id, path = %path.display(), "Loading flow definition");

            let content = match tokio::fs::read_to_string(&path).await {
                Ok(c) => c,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(ConduitError::FlowNotFound(flow_id));
                }
                Err(e) => return Err(e.into()),
            };

            let mut flow = Flow::from_json(&content).map_err(|e| ConduitError::FlowLoad {
                flow_id: flow_id.clone(),
                message: e.to_string(),
            })?;
            if flow.id.is_empty() {
                flow.id = flow_id;
            }
            Ok(Arc::new(flow))
        })
    }
}
