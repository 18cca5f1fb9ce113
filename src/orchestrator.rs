//! Lab instance lifecycle.
//!
//! The orchestrator keeps a table of tracked lab instances and is the only
//! writer of it. Runtime truth wins: `list` and `reconcile` fold what the
//! container runtime reports back into the table, marking instances whose
//! containers vanished or died as `error` and adopting managed containers the
//! table does not know about.
//!
//! Provisioning for one (user, classroom) pair is serialized by a keyed
//! async mutex. The first caller inserts a `provisioning` record and hands the
//! runtime work to a spawned task, so neither a second caller nor a client
//! disconnect can produce a duplicate or cancel the creation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::auth::{Action, AuthGate, Resource};
use crate::error::LabError;
use crate::notifier::{Event, InstanceEvent, Notifier};
use crate::roster::{Roster, RosterError};
use crate::runtime::{
    with_retry, ContainerRuntime, ContainerSpec, ContainerState, ListFilter, RetryPolicy, RuntimeContainer,
    RuntimeError, LABEL_CLASSROOM, LABEL_IMAGE, LABEL_MANAGED, LABEL_OWNER,
};
use crate::session::Session;

/// Prefix of every lab container name.
pub const INSTANCE_PREFIX: &str = "gns3lab-";

/// How long a removed container name stays excluded from adoption.
const REMOVED_RETENTION: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Provisioning,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl InstanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

/// A tracked lab container.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LabInstance {
    /// Container handle (the container name).
    pub id: String,
    pub owner: String,
    pub classroom: String,
    pub image: String,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
    pub last_healthy_at: Option<DateTime<Utc>>,
    /// `host:port` of the GNS3 web console.
    pub endpoint: Option<String>,
    pub error: Option<String>,
    /// Last owner activity, used for idle reclamation.
    #[serde(skip)]
    pub last_active: Instant,
    /// When `status` last changed. Runtime snapshots older than this are
    /// not applied to the record.
    #[serde(skip)]
    pub status_changed_at: Instant,
}

impl LabInstance {
    fn new(owner: &str, classroom: &str, image: &str) -> Self {
        Self {
            id: format!("{INSTANCE_PREFIX}{}", uuid::Uuid::new_v4().simple()),
            owner: owner.to_string(),
            classroom: classroom.to_string(),
            image: image.to_string(),
            status: InstanceStatus::Provisioning,
            created_at: Utc::now(),
            last_healthy_at: None,
            endpoint: None,
            error: None,
            last_active: Instant::now(),
            status_changed_at: Instant::now(),
        }
    }

    fn set_status(&mut self, status: InstanceStatus) {
        if self.status != status {
            self.status = status;
            self.status_changed_at = Instant::now();
        }
    }

    /// Rebuild a record from a managed container the table lost track of.
    fn adopt(container: &RuntimeContainer) -> Option<Self> {
        let owner = container.label(LABEL_OWNER)?;
        let classroom = container.label(LABEL_CLASSROOM)?;
        let mut instance = Self::new(owner, classroom, container.label(LABEL_IMAGE).unwrap_or_default());
        instance.id = container.name.clone();
        instance.set_status(InstanceStatus::Running);
        instance.apply(container, Utc::now());
        Some(instance)
    }

    /// Fold an observed container state into this record. Returns whether
    /// the status changed.
    fn apply(&mut self, container: &RuntimeContainer, now: DateTime<Utc>) -> bool {
        let before = self.status;
        if container.endpoint.is_some() {
            self.endpoint = container.endpoint.clone();
        }
        match (container.state, self.status) {
            // Teardown in progress owns the status.
            (_, InstanceStatus::Stopping) => {}
            (ContainerState::Running, _) => {
                self.set_status(InstanceStatus::Running);
                self.last_healthy_at = Some(now);
                self.error = None;
            }
            // Lab containers are only ever stopped on the way to removal, so
            // an exited or dead container was killed behind our back.
            (ContainerState::Exited | ContainerState::Dead, InstanceStatus::Provisioning | InstanceStatus::Running) => {
                self.set_status(InstanceStatus::Error);
                self.error = Some(format!("container {} exited unexpectedly", self.id));
            }
            _ => {}
        }
        self.status != before
    }

    fn is_live(&self) -> bool {
        matches!(self.status, InstanceStatus::Provisioning | InstanceStatus::Running)
    }
}

/// Client-supplied lab parameters.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabSpec {
    /// Container image; the configured default when absent.
    pub image: Option<String>,
    /// GNS3 project template to open on start.
    pub template: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Provisioned {
    pub instance: LabInstance,
    /// False when an existing or in-flight instance was returned.
    pub created: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    Terminated,
    /// Nothing tracked under that id; the container is already gone.
    AlreadyGone,
    /// A concurrent terminate is tearing it down.
    InProgress,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub checked: usize,
    pub marked_error: Vec<String>,
    pub adopted: Vec<String>,
    pub reclaimed: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub default_image: String,
    /// Images students may request; empty means only the default.
    pub allowed_images: Vec<String>,
    pub memory_mb: Option<u64>,
    /// Permit several live labs per (user, classroom).
    pub allow_multiple: bool,
    pub idle_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_image: "gns3/gns3server:latest".to_string(),
            allowed_images: Vec::new(),
            memory_mb: Some(2048),
            allow_multiple: false,
            idle_timeout: Duration::from_secs(2 * 60 * 60),
            retry: RetryPolicy::default(),
        }
    }
}

type ProvisionKey = (String, String);

pub struct Orchestrator {
    config: OrchestratorConfig,
    runtime: Arc<dyn ContainerRuntime>,
    roster: Arc<dyn Roster>,
    auth: AuthGate,
    notifier: Arc<Notifier>,
    instances: RwLock<HashMap<String, LabInstance>>,
    provision_locks: Mutex<HashMap<ProvisionKey, Arc<Mutex<()>>>>,
    /// Recently removed container names, kept so a runtime snapshot taken
    /// before the removal cannot resurrect them.
    removed: Mutex<HashMap<String, Instant>>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        runtime: Arc<dyn ContainerRuntime>,
        roster: Arc<dyn Roster>,
        auth: AuthGate,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            config,
            runtime,
            roster,
            auth,
            notifier,
            instances: RwLock::new(HashMap::new()),
            provision_locks: Mutex::new(HashMap::new()),
            removed: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, id: &str) -> Option<LabInstance> {
        self.instances.read().await.get(id).cloned()
    }

    /// Create (or return the existing) lab for the session's user in `classroom`.
    pub async fn provision(
        self: &Arc<Self>,
        session: &Session,
        classroom: &str,
        spec: LabSpec,
    ) -> Result<Provisioned, LabError> {
        let user = session.user_id.as_str();
        self.auth
            .require(session, Action::Provision, Resource::Classroom(classroom))
            .await?;
        self.validate_membership(user, classroom).await?;
        let image = self.resolve_image(&spec)?;

        let key = (user.to_string(), classroom.to_string());
        let lock = self.provision_lock(&key).await;
        let guard = lock.lock().await;

        let instance = match self.claim_slot(user, classroom, &image).await {
            Ok(Slot::Existing(instance)) => {
                drop(guard);
                self.release_provision_lock(&key, lock).await;
                info!(instance = %instance.id, %user, %classroom, "Returning existing lab");
                return Ok(Provisioned { instance, created: false });
            }
            Ok(Slot::Claimed(instance)) => instance,
            Err(err) => {
                drop(guard);
                self.release_provision_lock(&key, lock).await;
                return Err(err);
            }
        };

        let container = self.container_spec(&instance, &spec);
        let this = Arc::clone(self);
        let id = instance.id.clone();
        // Detached so a disconnecting caller cannot cancel the creation.
        let task = tokio::spawn(async move { this.finish_provisioning(&id, container).await });

        drop(guard);
        self.release_provision_lock(&key, lock).await;

        task.await
            .map_err(|e| LabError::Internal(format!("provisioning task failed: {e}")))?
    }

    /// Under the key lock: return the live instance for the key, or reclaim
    /// a dead one and insert a fresh `provisioning` record.
    async fn claim_slot(&self, user: &str, classroom: &str, image: &str) -> Result<Slot, LabError> {
        let stale = if self.config.allow_multiple {
            None
        } else {
            let mut instances = self.instances.write().await;
            let existing = instances
                .values_mut()
                .filter(|i| i.owner == user && i.classroom == classroom)
                .min_by_key(|i| !i.is_live());
            match existing {
                Some(i) if i.is_live() => {
                    i.last_active = Instant::now();
                    return Ok(Slot::Existing(i.clone()));
                }
                Some(i) if i.status == InstanceStatus::Stopping => {
                    return Err(LabError::ResourceConflict(format!(
                        "lab {} for {classroom} is being torn down",
                        i.id
                    )))
                }
                Some(i) => Some(i.id.clone()),
                None => None,
            }
        };

        if let Some(stale_id) = stale {
            info!(instance = %stale_id, %user, %classroom, "Reclaiming dead lab before reprovisioning");
            self.teardown(&stale_id).await?;
        }

        let instance = LabInstance::new(user, classroom, image);
        let mut instances = self.instances.write().await;
        instances.insert(instance.id.clone(), instance.clone());
        self.notifier
            .publish(Event::Instance(InstanceEvent::from_instance(&instance, false)))
            .await;
        info!(instance = %instance.id, %user, %classroom, %image, "Provisioning lab");
        Ok(Slot::Claimed(instance))
    }

    async fn finish_provisioning(&self, id: &str, spec: ContainerSpec) -> Result<Provisioned, LabError> {
        let runtime = &self.runtime;
        let result = with_retry(&self.config.retry, "create", || runtime.create(&spec)).await;

        let mut instances = self.instances.write().await;
        let Some(instance) = instances.get_mut(id) else {
            // Only teardown removes records and it refuses provisioning ones.
            error!(instance = %id, "Provisioned lab vanished from the table");
            return Err(LabError::NotFound(format!("lab {id}")));
        };

        match result {
            Ok(container) => {
                instance.apply(&container, Utc::now());
                if instance.status == InstanceStatus::Provisioning {
                    // Created but not yet reported running; the start succeeded.
                    instance.set_status(InstanceStatus::Running);
                    instance.last_healthy_at = Some(Utc::now());
                }
                let instance = instance.clone();
                self.notifier
                    .publish(Event::Instance(InstanceEvent::from_instance(&instance, false)))
                    .await;
                info!(instance = %id, endpoint = ?instance.endpoint, "Lab running");
                Ok(Provisioned { instance, created: true })
            }
            Err(err) => {
                instance.set_status(InstanceStatus::Error);
                instance.error = Some(err.to_string());
                let snapshot = instance.clone();
                self.notifier
                    .publish(Event::Instance(InstanceEvent::from_instance(&snapshot, false)))
                    .await;
                error!(instance = %id, error = %err, "Lab provisioning failed");
                Err(err.into())
            }
        }
    }

    /// The session user's labs, reconciled against the runtime first.
    pub async fn list(&self, session: &Session) -> Result<Vec<LabInstance>, LabError> {
        let user = session.user_id.as_str();
        self.auth.require(session, Action::ListOwn, Resource::User(user)).await?;
        self.list_owned(user).await
    }

    /// Unchecked variant for trusted callers.
    pub async fn list_owned(&self, user: &str) -> Result<Vec<LabInstance>, LabError> {
        let filter = ListFilter::Owner(user.to_string());
        self.refresh(&filter).await?;

        let mut instances = self.instances.write().await;
        let now = Instant::now();
        let mut owned: Vec<LabInstance> = instances
            .values_mut()
            .filter(|i| i.owner == user)
            .map(|i| {
                i.last_active = now;
                i.clone()
            })
            .collect();
        owned.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(owned)
    }

    /// Every lab in a classroom (instructor view).
    pub async fn list_classroom(&self, session: &Session, classroom: &str) -> Result<Vec<LabInstance>, LabError> {
        self.auth
            .require(session, Action::ListAll, Resource::Classroom(classroom))
            .await?;
        let filter = ListFilter::Classroom(classroom.to_string());
        self.refresh(&filter).await?;

        let instances = self.instances.read().await;
        let mut labs: Vec<LabInstance> = instances
            .values()
            .filter(|i| i.classroom == classroom)
            .cloned()
            .collect();
        labs.sort_by(|a, b| (&a.owner, a.created_at).cmp(&(&b.owner, b.created_at)));
        Ok(labs)
    }

    /// Stop and remove a lab. Repeating the call, or calling it for a lab
    /// that no longer exists, succeeds.
    pub async fn terminate(&self, session: &Session, id: &str) -> Result<TerminateOutcome, LabError> {
        let target = self.get(id).await;
        let Some(instance) = target else {
            return Ok(TerminateOutcome::AlreadyGone);
        };
        self.auth
            .require(
                session,
                Action::Terminate,
                Resource::Instance {
                    owner: &instance.owner,
                    classroom: &instance.classroom,
                },
            )
            .await?;
        info!(instance = %id, requester = %session.user_id, "Terminating lab");
        self.teardown(id).await
    }

    async fn teardown(&self, id: &str) -> Result<TerminateOutcome, LabError> {
        {
            let mut instances = self.instances.write().await;
            let Some(instance) = instances.get_mut(id) else {
                return Ok(TerminateOutcome::AlreadyGone);
            };
            match instance.status {
                InstanceStatus::Stopping => return Ok(TerminateOutcome::InProgress),
                InstanceStatus::Provisioning => {
                    return Err(LabError::ResourceConflict(format!("lab {id} is still provisioning")))
                }
                _ => {}
            }
            instance.set_status(InstanceStatus::Stopping);
            let snapshot = instance.clone();
            self.notifier
                .publish(Event::Instance(InstanceEvent::from_instance(&snapshot, false)))
                .await;
        }

        let runtime = &self.runtime;
        let stopped = with_retry(&self.config.retry, "stop", || runtime.stop(id)).await;
        let removed = match stopped {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {
                with_retry(&self.config.retry, "remove", || runtime.remove(id)).await
            }
            Err(err) => Err(err),
        };

        let mut instances = self.instances.write().await;
        match removed {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {
                self.removed.lock().await.insert(id.to_string(), Instant::now());
                if let Some(mut instance) = instances.remove(id) {
                    instance.set_status(InstanceStatus::Stopped);
                    self.notifier
                        .publish(Event::Instance(InstanceEvent::from_instance(&instance, true)))
                        .await;
                }
                info!(instance = %id, "Lab removed");
                Ok(TerminateOutcome::Terminated)
            }
            Err(err) => {
                if let Some(instance) = instances.get_mut(id) {
                    instance.set_status(InstanceStatus::Error);
                    instance.error = Some(format!("teardown failed: {err}"));
                    let snapshot = instance.clone();
                    self.notifier
                        .publish(Event::Instance(InstanceEvent::from_instance(&snapshot, false)))
                        .await;
                }
                error!(instance = %id, error = %err, "Lab teardown failed");
                Err(err.into())
            }
        }
    }

    /// Compare every tracked lab with the runtime, then reclaim idle and
    /// orphaned labs.
    pub async fn reconcile(&self) -> Result<ReconcileReport, LabError> {
        let mut report = self.refresh(&ListFilter::All).await?;

        let now = Instant::now();
        let candidates: Vec<(String, String, String, bool)> = {
            let instances = self.instances.read().await;
            instances
                .values()
                .filter(|i| i.status != InstanceStatus::Stopping && i.status != InstanceStatus::Provisioning)
                .map(|i| {
                    let idle = i.status == InstanceStatus::Running
                        && now.saturating_duration_since(i.last_active) >= self.config.idle_timeout;
                    (i.id.clone(), i.owner.clone(), i.classroom.clone(), idle)
                })
                .collect()
        };

        for (id, owner, classroom, idle) in candidates {
            let orphaned = match self.roster.membership(&owner, &classroom).await {
                Ok(_) => false,
                Err(RosterError::NotFound { .. }) => true,
                Err(err) => {
                    warn!(instance = %id, error = %err, "Roster unavailable, skipping orphan check");
                    false
                }
            };
            if !idle && !orphaned {
                continue;
            }
            if orphaned {
                self.mark_error(&id, format!("orphaned: {owner} is no longer in {classroom}")).await;
                report.marked_error.push(id.clone());
            }
            let reason = if orphaned { "orphaned" } else { "idle" };
            match self.teardown(&id).await {
                Ok(_) => {
                    info!(instance = %id, reason, "Reclaimed lab");
                    report.reclaimed.push(id);
                }
                Err(err) => warn!(instance = %id, reason, error = %err, "Failed to reclaim lab"),
            }
        }

        if !report.marked_error.is_empty() || !report.adopted.is_empty() || !report.reclaimed.is_empty() {
            info!(
                checked = report.checked,
                marked_error = report.marked_error.len(),
                adopted = report.adopted.len(),
                reclaimed = report.reclaimed.len(),
                "Reconciliation corrected drift"
            );
        }
        Ok(report)
    }

    /// Query the runtime for `filter` and fold the answer into the table.
    ///
    /// Records whose status changed after the runtime snapshot was requested
    /// are left alone, and containers removed by a teardown since then are
    /// never adopted.
    async fn refresh(&self, filter: &ListFilter) -> Result<ReconcileReport, LabError> {
        let runtime = &self.runtime;
        let snapshot_at = Instant::now();
        let observed = with_retry(&self.config.retry, "list", || runtime.list(filter)).await?;
        let mut by_name: HashMap<String, RuntimeContainer> =
            observed.into_iter().map(|c| (c.name.clone(), c)).collect();

        let now = Utc::now();
        let mut report = ReconcileReport::default();
        let mut instances = self.instances.write().await;
        let mut changed = Vec::new();

        for instance in instances
            .values_mut()
            .filter(|i| filter.matches(&i.owner, &i.classroom))
        {
            report.checked += 1;
            let seen = by_name.remove(&instance.id);
            if instance.status_changed_at > snapshot_at {
                continue;
            }
            match seen {
                Some(container) => {
                    if instance.apply(&container, now) {
                        if instance.status == InstanceStatus::Error {
                            report.marked_error.push(instance.id.clone());
                        }
                        changed.push(instance.clone());
                    }
                }
                // Provisioning records have no container yet; stopping ones are
                // expected to disappear.
                None if matches!(instance.status, InstanceStatus::Running | InstanceStatus::Stopped) => {
                    warn!(instance = %instance.id, owner = %instance.owner, "Tracked lab missing from runtime");
                    instance.set_status(InstanceStatus::Error);
                    instance.error = Some(format!("container {} missing from runtime", instance.id));
                    report.marked_error.push(instance.id.clone());
                    changed.push(instance.clone());
                }
                None => {}
            }
        }

        let mut removed = self.removed.lock().await;
        removed.retain(|_, at| at.elapsed() < REMOVED_RETENTION);
        for container in by_name.into_values() {
            if container.label(LABEL_MANAGED) != Some("true") {
                continue;
            }
            if removed.contains_key(&container.name) {
                debug!(container = %container.name, "Skipping container removed since the snapshot");
                continue;
            }
            match LabInstance::adopt(&container) {
                Some(instance) => {
                    info!(instance = %instance.id, owner = %instance.owner, "Adopted untracked lab container");
                    report.adopted.push(instance.id.clone());
                    changed.push(instance.clone());
                    instances.insert(instance.id.clone(), instance);
                }
                None => warn!(container = %container.name, "Managed container without owner labels"),
            }
        }
        drop(removed);

        for instance in &changed {
            self.notifier
                .publish(Event::Instance(InstanceEvent::from_instance(instance, false)))
                .await;
        }
        Ok(report)
    }

    async fn mark_error(&self, id: &str, reason: String) {
        let mut instances = self.instances.write().await;
        if let Some(instance) = instances.get_mut(id) {
            instance.set_status(InstanceStatus::Error);
            instance.error = Some(reason);
            let snapshot = instance.clone();
            self.notifier
                .publish(Event::Instance(InstanceEvent::from_instance(&snapshot, false)))
                .await;
        }
    }

    async fn validate_membership(&self, user: &str, classroom: &str) -> Result<(), LabError> {
        match self.roster.membership(user, classroom).await {
            Ok(_) => Ok(()),
            Err(RosterError::NotFound { .. }) => Err(LabError::NotFound(format!(
                "membership of {user} in classroom {classroom}"
            ))),
            Err(err) => Err(LabError::Unavailable(err.to_string())),
        }
    }

    fn resolve_image(&self, spec: &LabSpec) -> Result<String, LabError> {
        match spec.image.as_deref() {
            None => Ok(self.config.default_image.clone()),
            Some(image) if image == self.config.default_image => Ok(image.to_string()),
            Some(image) if self.config.allowed_images.iter().any(|i| i == image) => Ok(image.to_string()),
            Some(image) => Err(LabError::InvalidRequest(format!("image {image} is not allowed"))),
        }
    }

    fn container_spec(&self, instance: &LabInstance, spec: &LabSpec) -> ContainerSpec {
        let labels = HashMap::from([
            (LABEL_MANAGED.to_string(), "true".to_string()),
            (LABEL_OWNER.to_string(), instance.owner.clone()),
            (LABEL_CLASSROOM.to_string(), instance.classroom.clone()),
            (LABEL_IMAGE.to_string(), instance.image.clone()),
        ]);
        let mut env = HashMap::from([
            ("LAB_OWNER".to_string(), instance.owner.clone()),
            ("LAB_CLASSROOM".to_string(), instance.classroom.clone()),
        ]);
        if let Some(template) = &spec.template {
            env.insert("GNS3_PROJECT_TEMPLATE".to_string(), template.clone());
        }
        ContainerSpec {
            name: instance.id.clone(),
            image: instance.image.clone(),
            labels,
            env,
            memory_mb: self.config.memory_mb,
        }
    }

    async fn provision_lock(&self, key: &ProvisionKey) -> Arc<Mutex<()>> {
        let mut locks = self.provision_locks.lock().await;
        locks.entry(key.clone()).or_default().clone()
    }

    /// Drop the key's lock entry once no other caller holds or awaits it.
    async fn release_provision_lock(&self, key: &ProvisionKey, lock: Arc<Mutex<()>>) {
        let mut locks = self.provision_locks.lock().await;
        // One reference in the map, one here.
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(key);
        }
    }
}

enum Slot {
    Existing(LabInstance),
    Claimed(LabInstance),
}
