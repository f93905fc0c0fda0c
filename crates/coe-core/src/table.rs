//! Authoritative mapping table
//!
//! Only the reconciliation loop mutates [`MappingTable`]. Readers get
//! copy-on-write snapshots through [`MappingView`], which is cheap to clone
//! and never blocks the loop.

use crate::error::{Error, Result};
use crate::model::{EndpointId, NetworkBinding, WorkloadEndpoint};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Reconciliation state of one entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingState {
    /// Known endpoint without a binding yet
    Pending { reason: String },
    /// Binding committed and matching the datastore
    Bound,
    /// Binding known to differ from the datastore; a verify is queued
    Stale,
    /// Endpoint could not be translated; waits for the next update
    Quarantined { reason: String },
    /// Write retries exhausted; waits for the next update
    Error { reason: String, attempts: u32 },
}

impl MappingState {
    pub fn name(&self) -> &'static str {
        match self {
            MappingState::Pending { .. } => "pending",
            MappingState::Bound => "bound",
            MappingState::Stale => "stale",
            MappingState::Quarantined { .. } => "quarantined",
            MappingState::Error { .. } => "error",
        }
    }

    /// Terminal states are left only on a new create/update
    pub fn is_parked(&self) -> bool {
        matches!(
            self,
            MappingState::Quarantined { .. } | MappingState::Error { .. }
        )
    }
}

impl fmt::Display for MappingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MappingState::Pending { reason } => write!(f, "pending ({})", reason),
            MappingState::Quarantined { reason } => write!(f, "quarantined ({})", reason),
            MappingState::Error { reason, attempts } => {
                write!(f, "error after {} attempts ({})", attempts, reason)
            }
            other => f.write_str(other.name()),
        }
    }
}

/// One endpoint and at most one binding
#[derive(Debug, Clone, PartialEq)]
pub struct MappingEntry {
    pub endpoint: WorkloadEndpoint,
    /// Expected binding (the last one committed, or the one being applied)
    pub binding: Option<NetworkBinding>,
    pub state: MappingState,
    /// Datastore version of the committed node
    pub version: Option<u64>,
    /// Last orchestration sequence number applied to this entry
    pub last_seq: Option<u64>,
    pub updated_at: DateTime<Utc>,
}

impl MappingEntry {
    pub fn new(endpoint: WorkloadEndpoint, state: MappingState) -> Self {
        Self {
            endpoint,
            binding: None,
            state,
            version: None,
            last_seq: None,
            updated_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &EndpointId {
        &self.endpoint.id
    }

    pub(crate) fn set_state(&mut self, state: MappingState) {
        self.state = state;
        self.updated_at = Utc::now();
    }
}

pub type TableSnapshot = Arc<BTreeMap<EndpointId, MappingEntry>>;

/// Mapping table owned by the reconciliation loop
#[derive(Debug)]
pub struct MappingTable {
    entries: BTreeMap<EndpointId, MappingEntry>,
    published: watch::Sender<TableSnapshot>,
}

impl MappingTable {
    pub fn new() -> Self {
        let (published, _) = watch::channel(Arc::new(BTreeMap::new()));
        Self {
            entries: BTreeMap::new(),
            published,
        }
    }

    pub fn get(&self, id: &EndpointId) -> Option<&MappingEntry> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &EndpointId) -> Option<&mut MappingEntry> {
        self.entries.get_mut(id)
    }

    pub fn insert(&mut self, entry: MappingEntry) -> Option<MappingEntry> {
        self.entries.insert(entry.id().clone(), entry)
    }

    pub fn remove(&mut self, id: &EndpointId) -> Option<MappingEntry> {
        self.entries.remove(id)
    }

    pub fn ids(&self) -> Vec<EndpointId> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Publish the current contents to every [`MappingView`]
    pub fn publish(&self) {
        self.published
            .send_replace(Arc::new(self.entries.clone()));
    }

    /// Read-only view following every `publish`
    pub fn view(&self) -> MappingView {
        MappingView {
            snapshots: self.published.subscribe(),
        }
    }
}

impl Default for MappingTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Query interface over the published mapping table
#[derive(Debug, Clone)]
pub struct MappingView {
    snapshots: watch::Receiver<TableSnapshot>,
}

impl MappingView {
    /// Latest published snapshot
    pub fn snapshot(&self) -> TableSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn entry(&self, id: &EndpointId) -> Option<MappingEntry> {
        self.snapshots.borrow().get(id).cloned()
    }

    /// Binding currently realized in the datastore for `id`
    ///
    /// # Errors
    ///
    /// `Error::NotFound` when the identity is unknown or has no committed
    /// binding (pending, quarantined, failed).
    pub fn current_binding(&self, id: &EndpointId) -> Result<NetworkBinding> {
        let snapshot = self.snapshots.borrow();
        let entry = snapshot
            .get(id)
            .ok_or_else(|| Error::not_found(format!("no mapping for {}", id)))?;

        match (&entry.state, &entry.binding) {
            (MappingState::Bound | MappingState::Stale, Some(binding)) => Ok(binding.clone()),
            (state, _) => Err(Error::not_found(format!("{} has no binding ({})", id, state))),
        }
    }

    /// Wait until the next `publish`
    pub async fn changed(&mut self) -> Result<()> {
        self.snapshots
            .changed()
            .await
            .map_err(|_| Error::Other("mapping table dropped".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NetworkType;

    fn binding(id: &EndpointId) -> NetworkBinding {
        NetworkBinding {
            endpoint: id.clone(),
            port_id: "p".to_string(),
            mac_address: None,
            node: None,
            ip_address: "10.0.0.5".parse().unwrap(),
            network_id: "n".to_string(),
            network_type: NetworkType::Flat,
            segmentation_id: 0,
            policies: Default::default(),
            node_info: None,
        }
    }

    #[test]
    fn view_sees_only_published_state() {
        let mut table = MappingTable::new();
        let view = table.view();
        let id = EndpointId::pod("a", "w1");

        table.insert(MappingEntry::new(
            WorkloadEndpoint::active(id.clone()),
            MappingState::Bound,
        ));
        assert!(view.entry(&id).is_none());

        table.publish();
        assert_eq!(view.entry(&id).unwrap().state, MappingState::Bound);
    }

    #[test]
    fn current_binding_requires_bound_entry() {
        let mut table = MappingTable::new();
        let view = table.view();
        let id = EndpointId::pod("a", "w1");

        assert!(matches!(view.current_binding(&id), Err(Error::NotFound(_))));

        let mut entry = MappingEntry::new(
            WorkloadEndpoint::active(id.clone()),
            MappingState::Pending {
                reason: "ip-address".to_string(),
            },
        );
        table.insert(entry.clone());
        table.publish();
        assert!(matches!(view.current_binding(&id), Err(Error::NotFound(_))));

        entry.binding = Some(binding(&id));
        entry.set_state(MappingState::Bound);
        table.insert(entry);
        table.publish();
        assert_eq!(view.current_binding(&id).unwrap().port_id, "p");
    }

    #[test]
    fn parked_states() {
        assert!(MappingState::Quarantined { reason: "x".into() }.is_parked());
        assert!(MappingState::Error { reason: "x".into(), attempts: 5 }.is_parked());
        assert!(!MappingState::Stale.is_parked());
    }
}
