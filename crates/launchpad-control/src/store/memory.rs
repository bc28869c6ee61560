//! In-memory deployment store.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{ControlError, ControlResult};
use crate::state::can_transition;
use crate::types::{
    DeploymentId, DeploymentRecord, DeploymentStatus, Project, ProjectId, TransitionOutcome,
    User, UserId,
};

use super::{DeploymentFilter, DeploymentStore};

#[derive(Debug, Default)]
struct Tables {
    users: HashMap<String, User>,
    projects: HashMap<String, Project>,
    deployments: HashMap<String, DeploymentRecord>,
}

impl Tables {
    fn in_flight_other_than(&self, project_id: &ProjectId, id: &DeploymentId) -> bool {
        self.deployments
            .values()
            .any(|d| d.project_id == *project_id && d.id != *id && d.status.is_in_flight())
    }
}

/// In-memory deployment store.
///
/// All tables sit behind one lock, so the in-flight check and the insert in
/// [`DeploymentStore::create_deployment`] are atomic. Data is lost when the
/// process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> ControlResult<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))
    }

    fn write(&self) -> ControlResult<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))
    }
}

#[async_trait]
impl DeploymentStore for MemoryStore {
    async fn ping(&self) -> ControlResult<()> {
        self.read().map(|_| ())
    }

    async fn upsert_user(&self, email: &str) -> ControlResult<User> {
        let mut tables = self.write()?;
        let user = tables
            .users
            .entry(email.to_owned())
            .or_insert_with(|| User {
                id: UserId::generate(),
                email: email.to_owned(),
            });
        Ok(user.clone())
    }

    async fn insert_project(&self, project: &Project) -> ControlResult<()> {
        let mut tables = self.write()?;
        for existing in tables.projects.values() {
            if existing.name == project.name {
                return Err(ControlError::ProjectExists(project.name.clone()));
            }
            if existing.slug == project.slug {
                return Err(ControlError::SlugTaken(project.slug.clone()));
            }
        }
        tables
            .projects
            .insert(project.id.as_str().to_owned(), project.clone());
        Ok(())
    }

    async fn get_project(&self, id: &ProjectId) -> ControlResult<Option<Project>> {
        Ok(self.read()?.projects.get(id.as_str()).cloned())
    }

    async fn get_project_by_name(&self, name: &str) -> ControlResult<Option<Project>> {
        Ok(self
            .read()?
            .projects
            .values()
            .find(|p| p.name == name)
            .cloned())
    }

    async fn list_projects(&self, owner: Option<&UserId>) -> ControlResult<Vec<Project>> {
        let tables = self.read()?;
        let mut projects: Vec<_> = tables
            .projects
            .values()
            .filter(|p| owner.map_or(true, |o| p.owner_id.as_ref() == Some(o)))
            .cloned()
            .collect();
        projects.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(projects)
    }

    async fn claim_project(&self, id: &ProjectId, owner: &UserId) -> ControlResult<Project> {
        let mut tables = self.write()?;
        let project = tables
            .projects
            .get_mut(id.as_str())
            .ok_or_else(|| ControlError::ProjectNotFound(id.to_string()))?;
        if project.owner_id.is_none() {
            project.owner_id = Some(owner.clone());
        }
        Ok(project.clone())
    }

    async fn create_deployment(&self, record: &DeploymentRecord) -> ControlResult<()> {
        let mut tables = self.write()?;

        let key = record.id.as_str().to_owned();
        if tables.deployments.contains_key(&key) {
            return Err(ControlError::internal(format!(
                "deployment {key} already exists"
            )));
        }
        if tables.in_flight_other_than(&record.project_id, &record.id) {
            return Err(ControlError::DeploymentInFlight {
                project: record.project_id.to_string(),
            });
        }

        tables.deployments.insert(key, record.clone());
        Ok(())
    }

    async fn get_deployment(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>> {
        Ok(self.read()?.deployments.get(id.as_str()).cloned())
    }

    async fn list_deployments(
        &self,
        filter: &DeploymentFilter,
    ) -> ControlResult<Vec<DeploymentRecord>> {
        let tables = self.read()?;

        let mut results: Vec<_> = tables
            .deployments
            .values()
            .filter(|r| {
                filter.project_id.as_ref().map_or(true, |p| r.project_id == *p)
                    && filter.status.map_or(true, |s| r.status == s)
            })
            .cloned()
            .collect();

        results.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });

        let offset = filter.offset.unwrap_or(0) as usize;
        let limit = filter.limit.map_or(usize::MAX, |l| l as usize);
        Ok(results.into_iter().skip(offset).take(limit).collect())
    }

    async fn transition(
        &self,
        id: &DeploymentId,
        to: DeploymentStatus,
        error: Option<&str>,
    ) -> ControlResult<TransitionOutcome> {
        let mut tables = self.write()?;
        let record = tables
            .deployments
            .get_mut(id.as_str())
            .ok_or_else(|| ControlError::DeploymentNotFound(id.to_string()))?;

        let from = record.status;
        if !can_transition(from, to) {
            return Ok(TransitionOutcome::Unchanged { current: from });
        }

        record.status = to;
        if let Some(error) = error {
            record.error = Some(error.to_owned());
        }
        record.updated_at = Utc::now();
        Ok(TransitionOutcome::Applied { from, to })
    }

    async fn set_status(
        &self,
        id: &DeploymentId,
        status: DeploymentStatus,
    ) -> ControlResult<DeploymentRecord> {
        let mut tables = self.write()?;
        let project_id = tables
            .deployments
            .get(id.as_str())
            .map(|r| r.project_id.clone())
            .ok_or_else(|| ControlError::DeploymentNotFound(id.to_string()))?;

        if status.is_in_flight() && tables.in_flight_other_than(&project_id, id) {
            return Err(ControlError::DeploymentInFlight {
                project: project_id.to_string(),
            });
        }

        let record = tables
            .deployments
            .get_mut(id.as_str())
            .ok_or_else(|| ControlError::DeploymentNotFound(id.to_string()))?;
        record.status = status;
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn fail_stale(
        &self,
        cutoff: DateTime<Utc>,
        error: &str,
    ) -> ControlResult<Vec<DeploymentId>> {
        let mut tables = self.write()?;
        let now = Utc::now();
        let mut failed = Vec::new();

        for record in tables.deployments.values_mut() {
            if record.created_at < cutoff && can_transition(record.status, DeploymentStatus::Failed)
            {
                record.status = DeploymentStatus::Failed;
                record.error = Some(error.to_owned());
                record.updated_at = now;
                failed.push(record.id.clone());
            }
        }

        failed.sort();
        Ok(failed)
    }

    async fn count_by_status(&self) -> ControlResult<Vec<(DeploymentStatus, u64)>> {
        let tables = self.read()?;
        let mut counts: HashMap<DeploymentStatus, u64> = HashMap::new();
        for record in tables.deployments.values() {
            *counts.entry(record.status).or_default() += 1;
        }
        Ok(DeploymentStatus::ALL
            .into_iter()
            .filter_map(|s| counts.get(&s).map(|n| (s, *n)))
            .collect())
    }
}
