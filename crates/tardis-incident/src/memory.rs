//! In-memory incident store keyed by incident id.

use tardis_types::{
    advance_timestamp, can_mutate, new_id, now, ActionStatus, AuditEntry, Evidence, Incident,
    IncidentError, IncidentFilter, IncidentPatch, IncidentStatus, IncidentStore, IncidentSummary,
    NewAction, NewEvidence, NewIncident, ResponseAction,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory implementation of IncidentStore.
/// Incidents are keyed by id; evidence and actions live inside their incident.
pub struct InMemoryIncidentStore {
    incidents: Arc<RwLock<HashMap<String, Incident>>>,
}

impl InMemoryIncidentStore {
    pub fn new() -> Self {
        Self {
            incidents: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn check_owner(incident: &Incident, actor: &str) -> Result<(), IncidentError> {
        if can_mutate(&incident.owner, actor) {
            Ok(())
        } else {
            Err(IncidentError::PermissionDenied(format!(
                "{} may not modify incident {}",
                actor, incident.id
            )))
        }
    }

    fn touch(incident: &mut Incident, entry: AuditEntry) {
        incident.updated_at = advance_timestamp(incident.updated_at);
        incident.timeline.push(entry);
    }
}

impl Default for InMemoryIncidentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl IncidentStore for InMemoryIncidentStore {
    async fn create_incident(
        &self,
        input: NewIncident,
        actor: &str,
    ) -> Result<Incident, IncidentError> {
        if input.title.trim().is_empty() {
            return Err(IncidentError::Invalid("title must not be empty".to_string()));
        }
        if input.owner.trim().is_empty() {
            return Err(IncidentError::Invalid("owner must not be empty".to_string()));
        }
        let ts = now();
        let incident = Incident {
            id: new_id(),
            title: input.title,
            description: input.description,
            severity: input.severity,
            status: IncidentStatus::Open,
            owner: input.owner,
            tags: input.tags,
            details: input.details,
            timeline: vec![AuditEntry::new("created", actor)],
            evidence: Vec::new(),
            actions: Vec::new(),
            created_at: ts,
            updated_at: ts,
            resolved_at: None,
        };
        self.incidents
            .write()
            .await
            .insert(incident.id.clone(), incident.clone());
        tracing::info!(id = %incident.id, severity = incident.severity.as_str(), "incident created");
        Ok(incident)
    }

    async fn get_incident(&self, id: &str) -> Result<Incident, IncidentError> {
        self.incidents
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| IncidentError::NotFound(id.to_string()))
    }

    async fn list_incidents(&self, filter: &IncidentFilter) -> Result<Vec<Incident>, IncidentError> {
        let guard = self.incidents.read().await;
        let mut out: Vec<Incident> = guard.values().filter(|i| filter.matches(i)).cloned().collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        let offset = filter.offset.unwrap_or(0);
        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(out.into_iter().skip(offset).take(limit).collect())
    }

    async fn update_incident(
        &self,
        id: &str,
        patch: IncidentPatch,
        actor: &str,
    ) -> Result<Incident, IncidentError> {
        let mut guard = self.incidents.write().await;
        let incident = guard
            .get_mut(id)
            .ok_or_else(|| IncidentError::NotFound(id.to_string()))?;
        Self::check_owner(incident, actor)?;

        let mut changed = Vec::new();
        if let Some(title) = patch.title {
            if title.trim().is_empty() {
                return Err(IncidentError::Invalid("title must not be empty".to_string()));
            }
            incident.title = title;
            changed.push("title");
        }
        if let Some(description) = patch.description {
            incident.description = description;
            changed.push("description");
        }
        if let Some(severity) = patch.severity {
            incident.severity = severity;
            changed.push("severity");
        }
        if let Some(tags) = patch.tags {
            incident.tags = tags;
            changed.push("tags");
        }
        if let Some(details) = patch.details {
            incident.details.extend(details);
            changed.push("details");
        }
        Self::touch(
            incident,
            AuditEntry::new("updated", actor).with_details(changed.join(",")),
        );
        Ok(incident.clone())
    }

    async fn update_status(
        &self,
        id: &str,
        status: IncidentStatus,
        actor: &str,
        note: Option<&str>,
    ) -> Result<Incident, IncidentError> {
        let mut guard = self.incidents.write().await;
        let incident = guard
            .get_mut(id)
            .ok_or_else(|| IncidentError::NotFound(id.to_string()))?;
        Self::check_owner(incident, actor)?;

        let old = incident.status;
        incident.status = status;
        if status.is_active() {
            incident.resolved_at = None;
        } else if incident.resolved_at.is_none() {
            incident.resolved_at = Some(now());
        }
        let mut entry = AuditEntry::new(format!("status:{}->{}", old, status), actor);
        if let Some(note) = note {
            entry = entry.with_details(note);
        }
        Self::touch(incident, entry);
        tracing::info!(id = %id, from = %old, to = %status, "incident status changed");
        Ok(incident.clone())
    }

    async fn add_evidence(
        &self,
        id: &str,
        input: NewEvidence,
        actor: &str,
    ) -> Result<Evidence, IncidentError> {
        if input.kind.trim().is_empty() {
            return Err(IncidentError::Invalid("evidence kind must not be empty".to_string()));
        }
        let mut guard = self.incidents.write().await;
        let incident = guard
            .get_mut(id)
            .ok_or_else(|| IncidentError::NotFound(id.to_string()))?;
        let evidence = Evidence {
            id: new_id(),
            kind: input.kind,
            description: input.description,
            data: input.data,
            collected_by: actor.to_string(),
            created_at: now(),
        };
        incident.evidence.push(evidence.clone());
        Self::touch(
            incident,
            AuditEntry::new("evidence_added", actor).with_details(evidence.id.clone()),
        );
        Ok(evidence)
    }

    async fn add_action(
        &self,
        id: &str,
        input: NewAction,
        actor: &str,
    ) -> Result<ResponseAction, IncidentError> {
        if input.action.trim().is_empty() {
            return Err(IncidentError::Invalid("action must not be empty".to_string()));
        }
        let mut guard = self.incidents.write().await;
        let incident = guard
            .get_mut(id)
            .ok_or_else(|| IncidentError::NotFound(id.to_string()))?;
        let ts = now();
        let action = ResponseAction {
            id: new_id(),
            action: input.action,
            assignee: input.assignee,
            status: ActionStatus::Pending,
            result: None,
            created_at: ts,
            updated_at: ts,
        };
        incident.actions.push(action.clone());
        Self::touch(
            incident,
            AuditEntry::new("action_added", actor).with_details(action.id.clone()),
        );
        Ok(action)
    }

    async fn update_action(
        &self,
        id: &str,
        action_id: &str,
        status: ActionStatus,
        result: Option<String>,
        actor: &str,
    ) -> Result<ResponseAction, IncidentError> {
        let mut guard = self.incidents.write().await;
        let incident = guard
            .get_mut(id)
            .ok_or_else(|| IncidentError::NotFound(id.to_string()))?;
        let action = incident
            .actions
            .iter_mut()
            .find(|a| a.id == action_id)
            .ok_or_else(|| IncidentError::NotFound(format!("action {} on {}", action_id, id)))?;
        let allowed = action.assignee.as_deref() == Some(actor) || can_mutate(&incident.owner, actor);
        if !allowed {
            return Err(IncidentError::PermissionDenied(format!(
                "{} may not update action {}",
                actor, action_id
            )));
        }
        action.status = status;
        if result.is_some() {
            action.result = result;
        }
        action.updated_at = advance_timestamp(action.updated_at);
        let updated = action.clone();
        Self::touch(
            incident,
            AuditEntry::new("action_updated", actor).with_details(action_id),
        );
        Ok(updated)
    }

    async fn delete_incident(&self, id: &str, actor: &str) -> Result<(), IncidentError> {
        let mut guard = self.incidents.write().await;
        let incident = guard
            .get(id)
            .ok_or_else(|| IncidentError::NotFound(id.to_string()))?;
        Self::check_owner(incident, actor)?;
        guard.remove(id);
        tracing::info!(id = %id, actor = %actor, "incident deleted");
        Ok(())
    }

    async fn summary(&self) -> Result<IncidentSummary, IncidentError> {
        let guard = self.incidents.read().await;
        let mut summary = IncidentSummary {
            total: guard.len(),
            ..Default::default()
        };
        for incident in guard.values() {
            if incident.status.is_active() {
                summary.active += 1;
            }
            *summary
                .by_status
                .entry(incident.status.as_str().to_string())
                .or_default() += 1;
            *summary
                .by_severity
                .entry(incident.severity.as_str().to_string())
                .or_default() += 1;
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tardis_types::{Severity, SYSTEM_ACTOR};

    fn new_incident(title: &str, owner: &str, severity: Severity) -> NewIncident {
        NewIncident {
            title: title.to_string(),
            description: "suspicious login burst".to_string(),
            severity,
            owner: owner.to_string(),
            tags: vec!["auth".to_string()],
            details: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn create_then_get_returns_same_fields() {
        let store = InMemoryIncidentStore::new();
        let a = store
            .create_incident(new_incident("A", "alice", Severity::High), "alice")
            .await
            .unwrap();
        let b = store
            .create_incident(new_incident("B", "alice", Severity::Low), "alice")
            .await
            .unwrap();
        assert_ne!(a.id, b.id);

        let got = store.get_incident(&a.id).await.unwrap();
        assert_eq!(got.title, "A");
        assert_eq!(got.severity, Severity::High);
        assert_eq!(got.status, IncidentStatus::Open);
        assert_eq!(got.owner, "alice");
        assert_eq!(got.timeline.len(), 1);
    }

    #[tokio::test]
    async fn empty_title_is_rejected() {
        let store = InMemoryIncidentStore::new();
        let err = store
            .create_incident(new_incident("  ", "alice", Severity::Low), "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, IncidentError::Invalid(_)));
    }

    #[tokio::test]
    async fn update_keeps_identity_and_advances_updated_at() {
        let store = InMemoryIncidentStore::new();
        let created = store
            .create_incident(new_incident("A", "alice", Severity::Low), "alice")
            .await
            .unwrap();
        let patch = IncidentPatch {
            severity: Some(Severity::Critical),
            ..Default::default()
        };
        let updated = store.update_incident(&created.id, patch, "alice").await.unwrap();
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.created_at, created.created_at);
        assert!(updated.updated_at > created.updated_at);
        assert_eq!(updated.severity, Severity::Critical);

        let again = store
            .update_status(&created.id, IncidentStatus::Investigating, "alice", None)
            .await
            .unwrap();
        assert!(again.updated_at > updated.updated_at);
    }

    #[tokio::test]
    async fn only_owner_or_system_may_mutate() {
        let store = InMemoryIncidentStore::new();
        let created = store
            .create_incident(new_incident("A", "alice", Severity::Low), "alice")
            .await
            .unwrap();
        let err = store
            .update_status(&created.id, IncidentStatus::Closed, "mallory", None)
            .await
            .unwrap_err();
        assert!(matches!(err, IncidentError::PermissionDenied(_)));

        let closed = store
            .update_status(&created.id, IncidentStatus::Closed, SYSTEM_ACTOR, Some("auto"))
            .await
            .unwrap();
        assert_eq!(closed.status, IncidentStatus::Closed);
        assert!(closed.resolved_at.is_some());
        let last = closed.timeline.last().unwrap();
        assert_eq!(last.action, "status:open->closed");
        assert_eq!(last.details.as_deref(), Some("auto"));
    }

    #[tokio::test]
    async fn any_status_transition_is_accepted() {
        let store = InMemoryIncidentStore::new();
        let created = store
            .create_incident(new_incident("A", "alice", Severity::Low), "alice")
            .await
            .unwrap();
        store
            .update_status(&created.id, IncidentStatus::Resolved, "alice", None)
            .await
            .unwrap();
        let reopened = store
            .update_status(&created.id, IncidentStatus::Open, "alice", None)
            .await
            .unwrap();
        assert_eq!(reopened.status, IncidentStatus::Open);
        assert!(reopened.resolved_at.is_none());
    }

    #[tokio::test]
    async fn delete_makes_get_fail() {
        let store = InMemoryIncidentStore::new();
        let created = store
            .create_incident(new_incident("A", "alice", Severity::Low), "alice")
            .await
            .unwrap();
        store.delete_incident(&created.id, "alice").await.unwrap();
        let err = store.get_incident(&created.id).await.unwrap_err();
        assert!(matches!(err, IncidentError::NotFound(_)));

        let next = store
            .create_incident(new_incident("A", "alice", Severity::Low), "alice")
            .await
            .unwrap();
        assert_ne!(next.id, created.id);
    }

    #[tokio::test]
    async fn filter_returns_exact_subset_newest_first() {
        let store = InMemoryIncidentStore::new();
        let mut high_ids = Vec::new();
        for i in 0..4 {
            let sev = if i % 2 == 0 { Severity::High } else { Severity::Low };
            let owner = if i < 2 { "alice" } else { "bob" };
            let inc = store
                .create_incident(new_incident(&format!("i{}", i), owner, sev), owner)
                .await
                .unwrap();
            if sev == Severity::High {
                high_ids.push(inc.id);
            }
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let high = store
            .list_incidents(&IncidentFilter {
                severity: Some(Severity::High),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(high.len(), 2);
        assert_eq!(high[0].id, high_ids[1]);
        assert_eq!(high[1].id, high_ids[0]);

        let bob = store
            .list_incidents(&IncidentFilter {
                owner: Some("bob".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(bob.len(), 2);
        assert!(bob.iter().all(|i| i.owner == "bob"));
        assert!(bob[0].created_at >= bob[1].created_at);

        let limited = store
            .list_incidents(&IncidentFilter {
                limit: Some(1),
                offset: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].title, "i2");
    }

    #[tokio::test]
    async fn evidence_and_actions_are_attached() {
        let store = InMemoryIncidentStore::new();
        let created = store
            .create_incident(new_incident("A", "alice", Severity::Medium), "alice")
            .await
            .unwrap();
        let ev = store
            .add_evidence(
                &created.id,
                NewEvidence {
                    kind: "log".to_string(),
                    description: "auth.log excerpt".to_string(),
                    data: HashMap::new(),
                },
                "analyst",
            )
            .await
            .unwrap();
        let action = store
            .add_action(
                &created.id,
                NewAction {
                    action: "rotate credentials".to_string(),
                    assignee: Some("bob".to_string()),
                },
                "alice",
            )
            .await
            .unwrap();
        let done = store
            .update_action(
                &created.id,
                &action.id,
                ActionStatus::Completed,
                Some("rotated".to_string()),
                "bob",
            )
            .await
            .unwrap();
        assert_eq!(done.status, ActionStatus::Completed);
        assert_eq!(done.result.as_deref(), Some("rotated"));

        let got = store.get_incident(&created.id).await.unwrap();
        assert_eq!(got.evidence.len(), 1);
        assert_eq!(got.evidence[0].id, ev.id);
        assert_eq!(got.evidence[0].collected_by, "analyst");
        assert_eq!(got.actions[0].status, ActionStatus::Completed);
        assert_eq!(got.timeline.len(), 4);
    }

    #[tokio::test]
    async fn summary_counts_by_status_and_severity() {
        let store = InMemoryIncidentStore::new();
        let a = store
            .create_incident(new_incident("A", "alice", Severity::High), "alice")
            .await
            .unwrap();
        store
            .create_incident(new_incident("B", "alice", Severity::High), "alice")
            .await
            .unwrap();
        store
            .update_status(&a.id, IncidentStatus::Resolved, "alice", None)
            .await
            .unwrap();
        let s = store.summary().await.unwrap();
        assert_eq!(s.total, 2);
        assert_eq!(s.active, 1);
        assert_eq!(s.by_status.get("resolved"), Some(&1));
        assert_eq!(s.by_status.get("open"), Some(&1));
        assert_eq!(s.by_severity.get("high"), Some(&2));
    }
}
