//! Plugin registry, hierarchy, pending requests and resource ledger.
//!
//! Plugins form a forest: every non-root plugin's parent is registered and
//! no plugin is its own ancestor. The store is plain data; the bus facade
//! wraps it in a lock.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::config::DEFAULT_MAX_PLUGIN_DEPTH;
use crate::error::PluginError;
use crate::message::CorrelationId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginRecord {
    pub plugin_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

impl PluginRecord {
    pub fn new(plugin_id: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            parent_id: None,
            metadata: Value::Null,
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Decides whether an allocation may proceed.
pub trait AdmissionPolicy: Send + Sync {
    fn admit(&self, owner_id: &str, current: u64, cost: u64) -> bool;
}

impl<F> AdmissionPolicy for F
where
    F: Fn(&str, u64, u64) -> bool + Send + Sync,
{
    fn admit(&self, owner_id: &str, current: u64, cost: u64) -> bool {
        self(owner_id, current, cost)
    }
}

/// Admits every allocation.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AdmissionPolicy for AllowAll {
    fn admit(&self, _owner_id: &str, _current: u64, _cost: u64) -> bool {
        true
    }
}

/// Per-owner ceiling on total allocated cost.
#[derive(Debug, Clone, Copy)]
pub struct QuotaPolicy {
    pub max_per_owner: u64,
}

impl QuotaPolicy {
    pub fn new(max_per_owner: u64) -> Self {
        Self { max_per_owner }
    }
}

impl AdmissionPolicy for QuotaPolicy {
    fn admit(&self, _owner_id: &str, current: u64, cost: u64) -> bool {
        current
            .checked_add(cost)
            .is_some_and(|total| total <= self.max_per_owner)
    }
}

struct PendingRequest {
    resolver: oneshot::Sender<Value>,
    created_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginStoreStats {
    pub plugin_count: usize,
    pub pending_requests: usize,
    pub resource_allocations: usize,
    pub max_depth: usize,
}

pub struct PluginStore {
    plugins: Vec<PluginRecord>,
    pending_requests: HashMap<CorrelationId, PendingRequest>,
    resource_cost: HashMap<String, u64>,
    max_depth: usize,
    admission: Arc<dyn AdmissionPolicy>,
}

impl Default for PluginStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PLUGIN_DEPTH)
    }
}

impl PluginStore {
    pub fn new(max_depth: usize) -> Self {
        Self {
            plugins: Vec::new(),
            pending_requests: HashMap::new(),
            resource_cost: HashMap::new(),
            max_depth,
            admission: Arc::new(AllowAll),
        }
    }

    pub fn with_admission_policy(mut self, policy: Arc<dyn AdmissionPolicy>) -> Self {
        self.admission = policy;
        self
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    // === Plugins ===

    pub fn add_plugin(&mut self, plugin: PluginRecord) -> Result<(), PluginError> {
        if self.get_plugin(&plugin.plugin_id).is_some() {
            return Err(PluginError::Duplicate(plugin.plugin_id));
        }
        let depth = match &plugin.parent_id {
            None => 0,
            Some(parent_id) => match self.depth_of(parent_id) {
                Some(parent_depth) => parent_depth + 1,
                None => {
                    return Err(PluginError::DanglingParent {
                        plugin_id: plugin.plugin_id,
                        parent_id: parent_id.clone(),
                    })
                }
            },
        };
        if depth > self.max_depth {
            return Err(PluginError::MaxDepthExceeded {
                plugin_id: plugin.plugin_id,
                depth,
                max_depth: self.max_depth,
            });
        }

        debug!(plugin_id = %plugin.plugin_id, parent_id = ?plugin.parent_id, depth, "Plugin added");
        self.plugins.push(plugin);
        Ok(())
    }

    /// Remove a plugin. Its children move up to its own parent.
    pub fn remove_plugin(&mut self, plugin_id: &str) -> Option<PluginRecord> {
        let index = self.plugins.iter().position(|p| p.plugin_id == plugin_id)?;
        let removed = self.plugins.remove(index);

        let mut promoted = 0;
        for child in self
            .plugins
            .iter_mut()
            .filter(|p| p.parent_id.as_deref() == Some(plugin_id))
        {
            child.parent_id = removed.parent_id.clone();
            promoted += 1;
        }

        debug!(plugin_id, promoted, "Plugin removed");
        Some(removed)
    }

    pub fn get_plugin(&self, plugin_id: &str) -> Option<&PluginRecord> {
        self.plugins.iter().find(|p| p.plugin_id == plugin_id)
    }

    pub fn get_all_plugins(&self) -> Vec<PluginRecord> {
        self.plugins.clone()
    }

    pub fn plugin_count(&self) -> usize {
        self.plugins.len()
    }

    // === Hierarchy ===

    pub fn get_children(&self, plugin_id: &str) -> Vec<&PluginRecord> {
        self.plugins
            .iter()
            .filter(|p| p.parent_id.as_deref() == Some(plugin_id))
            .collect()
    }

    pub fn get_parent(&self, plugin_id: &str) -> Option<&PluginRecord> {
        let parent_id = self.get_plugin(plugin_id)?.parent_id.as_deref()?;
        self.get_plugin(parent_id)
    }

    /// All transitive children, breadth-first.
    pub fn get_descendants(&self, plugin_id: &str) -> Vec<&PluginRecord> {
        let mut descendants = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&PluginRecord> = self.get_children(plugin_id).into();

        while let Some(current) = queue.pop_front() {
            if !seen.insert(current.plugin_id.as_str()) {
                continue;
            }
            descendants.push(current);
            queue.extend(self.get_children(&current.plugin_id));
        }
        descendants
    }

    /// Depth in the forest (roots are 0), or `None` if not registered.
    pub fn depth_of(&self, plugin_id: &str) -> Option<usize> {
        let mut current = self.get_plugin(plugin_id)?;
        let mut depth = 0;
        while let Some(parent_id) = current.parent_id.as_deref() {
            let Some(parent) = self.get_plugin(parent_id) else {
                break;
            };
            depth += 1;
            if depth > self.plugins.len() {
                break;
            }
            current = parent;
        }
        Some(depth)
    }

    pub fn has_valid_parent(&self, plugin: &PluginRecord) -> bool {
        match &plugin.parent_id {
            None => true,
            Some(parent_id) => self.get_plugin(parent_id).is_some(),
        }
    }

    pub fn would_create_circular_reference(&self, plugin_id: &str, new_parent_id: &str) -> bool {
        plugin_id == new_parent_id
            || self
                .get_descendants(plugin_id)
                .iter()
                .any(|p| p.plugin_id == new_parent_id)
    }

    /// Move a plugin under a new parent, or make it a root with `None`.
    pub fn reparent(&mut self, plugin_id: &str, new_parent_id: Option<&str>) -> Result<(), PluginError> {
        let current_depth = self
            .depth_of(plugin_id)
            .ok_or_else(|| PluginError::NotFound(plugin_id.to_string()))?;

        let new_depth = match new_parent_id {
            None => 0,
            Some(parent_id) => {
                let parent_depth = self.depth_of(parent_id).ok_or_else(|| PluginError::DanglingParent {
                    plugin_id: plugin_id.to_string(),
                    parent_id: parent_id.to_string(),
                })?;
                if self.would_create_circular_reference(plugin_id, parent_id) {
                    warn!(plugin_id, new_parent_id = parent_id, "Rejected circular reparent");
                    return Err(PluginError::CircularReference {
                        plugin_id: plugin_id.to_string(),
                        new_parent_id: parent_id.to_string(),
                    });
                }
                parent_depth + 1
            }
        };

        let subtree_height = self
            .get_descendants(plugin_id)
            .iter()
            .filter_map(|p| self.depth_of(&p.plugin_id))
            .map(|depth| depth - current_depth)
            .max()
            .unwrap_or(0);
        if new_depth + subtree_height > self.max_depth {
            return Err(PluginError::MaxDepthExceeded {
                plugin_id: plugin_id.to_string(),
                depth: new_depth + subtree_height,
                max_depth: self.max_depth,
            });
        }

        if let Some(plugin) = self.plugins.iter_mut().find(|p| p.plugin_id == plugin_id) {
            plugin.parent_id = new_parent_id.map(str::to_string);
        }
        debug!(plugin_id, new_parent_id = ?new_parent_id, "Plugin reparented");
        Ok(())
    }

    // === Pending requests ===

    pub fn add_pending_request(&mut self, correlation_id: CorrelationId, resolver: oneshot::Sender<Value>) {
        self.pending_requests.insert(
            correlation_id,
            PendingRequest {
                resolver,
                created_at: Instant::now(),
            },
        );
        debug!(correlation_id = %correlation_id, "Registered pending request");
    }

    /// Hand `result` to the waiting requester. Each entry resolves once;
    /// unknown or already-resolved ids return false.
    pub fn resolve_pending_request(&mut self, correlation_id: &CorrelationId, result: Value) -> bool {
        let Some(pending) = self.pending_requests.remove(correlation_id) else {
            debug!(correlation_id = %correlation_id, "Response for unknown or resolved correlation ID");
            return false;
        };

        let waited_ms = pending.created_at.elapsed().as_millis() as u64;
        match pending.resolver.send(result) {
            Ok(()) => {
                debug!(correlation_id = %correlation_id, waited_ms, "Resolved pending request");
                true
            }
            Err(_) => {
                debug!(correlation_id = %correlation_id, "Pending request receiver dropped");
                false
            }
        }
    }

    pub fn cancel_pending_request(&mut self, correlation_id: &CorrelationId) -> bool {
        self.pending_requests.remove(correlation_id).is_some()
    }

    pub fn is_pending(&self, correlation_id: &CorrelationId) -> bool {
        self.pending_requests.contains_key(correlation_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending_requests.len()
    }

    // === Resource ledger ===

    /// Add `cost` to the owner's usage and return the new total.
    pub fn allocate_resource(&mut self, owner_id: &str, cost: u64) -> Result<u64, PluginError> {
        let current = self.get_resource_usage(owner_id);
        if !self.admission.admit(owner_id, current, cost) {
            warn!(owner_id, cost, current, "Resource allocation rejected");
            return Err(PluginError::AdmissionRejected {
                owner_id: owner_id.to_string(),
                cost,
                current,
            });
        }
        let total = current.saturating_add(cost);
        self.resource_cost.insert(owner_id.to_string(), total);
        Ok(total)
    }

    /// Subtract `cost`, flooring at zero, and return the new total.
    /// An owner whose usage reaches zero leaves the ledger.
    pub fn release_resource(&mut self, owner_id: &str, cost: u64) -> u64 {
        let Some(current) = self.resource_cost.get_mut(owner_id) else {
            return 0;
        };
        *current = current.saturating_sub(cost);
        let total = *current;
        if total == 0 {
            self.resource_cost.remove(owner_id);
        }
        total
    }

    pub fn get_resource_usage(&self, owner_id: &str) -> u64 {
        self.resource_cost.get(owner_id).copied().unwrap_or(0)
    }

    pub fn stats(&self) -> PluginStoreStats {
        PluginStoreStats {
            plugin_count: self.plugins.len(),
            pending_requests: self.pending_requests.len(),
            resource_allocations: self.resource_cost.len(),
            max_depth: self.max_depth,
        }
    }

    /// Drop everything. Waiting requesters see their request dropped.
    pub fn clear(&mut self) {
        self.plugins.clear();
        self.pending_requests.clear();
        self.resource_cost.clear();
    }
}

impl std::fmt::Debug for PluginStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginStore")
            .field("stats", &self.stats())
            .finish()
    }
}
