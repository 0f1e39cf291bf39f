use std::collections::HashMap;

use agentmesh_core::{Error, Result};
use agentmesh_storage::{EventRecord, EventStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::event::{Event, EventMeta};

/// Folds events into a read model.
pub trait Projector {
    fn apply(&mut self, event: &EventRecord) -> Result<()>;
}

/// Rebuild `projector` from the aggregate's history. Returns the number of
/// events applied.
pub fn replay<P: Projector + ?Sized>(
    store: &dyn EventStore,
    tenant_id: &str,
    aggregate_id: &str,
    projector: &mut P,
) -> Result<usize> {
    let events = store.load_events(tenant_id, aggregate_id)?;
    for event in &events {
        projector.apply(event)?;
    }
    debug!(tenant_id = %tenant_id, aggregate_id = %aggregate_id, count = events.len(), "Replayed events");
    Ok(events.len())
}

/// An agent moved to a new status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatusChanged {
    #[serde(flatten)]
    pub meta: EventMeta,
    pub tenant_id: String,
    pub agent_id: String,
    pub status: String,
}

impl AgentStatusChanged {
    pub fn new(tenant_id: impl Into<String>, agent_id: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            meta: EventMeta::new(),
            tenant_id: tenant_id.into(),
            agent_id: agent_id.into(),
            status: status.into(),
        }
    }
}

impl Event for AgentStatusChanged {
    fn event_id(&self) -> &str {
        &self.meta.event_id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.meta.created_at
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub status: String,
    pub last_update: Option<DateTime<Utc>>,
}

impl AgentStatus {
    fn not_found() -> Self {
        Self {
            status: "not_found".to_string(),
            last_update: None,
        }
    }
}

/// Latest status per agent, keyed `tenant_id:agent_id`.
#[derive(Debug, Default)]
pub struct AgentStatusReadModel {
    statuses: HashMap<String, AgentStatus>,
}

impl AgentStatusReadModel {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(tenant_id: &str, agent_id: &str) -> String {
        format!("{}:{}", tenant_id, agent_id)
    }

    pub fn update_agent_status(
        &mut self,
        tenant_id: &str,
        agent_id: &str,
        status: &str,
        last_update: DateTime<Utc>,
    ) {
        self.statuses.insert(
            Self::key(tenant_id, agent_id),
            AgentStatus {
                status: status.to_string(),
                last_update: Some(last_update),
            },
        );
        info!(tenant_id = %tenant_id, agent_id = %agent_id, status = %status, "Agent status updated");
    }

    /// `not_found` for an agent with no recorded status.
    pub fn get_agent_status(&self, tenant_id: &str, agent_id: &str) -> AgentStatus {
        self.statuses
            .get(&Self::key(tenant_id, agent_id))
            .cloned()
            .unwrap_or_else(AgentStatus::not_found)
    }

    pub fn all(&self) -> &HashMap<String, AgentStatus> {
        &self.statuses
    }
}

impl Projector for AgentStatusReadModel {
    fn apply(&mut self, event: &EventRecord) -> Result<()> {
        if event.event_type != "AgentStatusChanged" {
            return Ok(());
        }
        let changed: AgentStatusChanged = serde_json::from_value(event.data.clone()).map_err(|e| {
            Error::Handler(format!("Malformed AgentStatusChanged {}: {}", event.event_id, e))
        })?;
        self.update_agent_status(
            &changed.tenant_id,
            &changed.agent_id,
            &changed.status,
            changed.meta.created_at,
        );
        Ok(())
    }
}
