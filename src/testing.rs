//! In-process container runtime for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;

use crate::config::{ServeArgs, Settings};
use crate::roster::{ClassroomRole, StaticRoster};
use crate::runtime::{
    ContainerRuntime, ContainerSpec, ContainerState, ListFilter, RetryPolicy, RuntimeContainer, RuntimeError,
    LABEL_CLASSROOM, LABEL_MANAGED, LABEL_OWNER,
};
use crate::session::MemorySessionStore;
use crate::state::AppState;

#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<HashMap<String, RuntimeContainer>>,
    create_failures: Mutex<VecDeque<RuntimeError>>,
    stop_failure: Mutex<Option<RuntimeError>>,
    create_delay: Mutex<Option<Duration>>,
    list_delay: Mutex<Option<Duration>>,
    creates: AtomicU32,
    next_port: AtomicU32,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            next_port: AtomicU32::new(3080),
            ..Self::default()
        }
    }

    pub fn create_calls(&self) -> u32 {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = Some(delay);
    }

    /// Delay list answers. The snapshot is taken when the call starts, so a
    /// slow list reports containers as they were before the delay.
    pub fn set_list_delay(&self, delay: Duration) {
        *self.list_delay.lock().unwrap() = Some(delay);
    }

    /// Fail the next create call with `err`. Queued failures are used in order.
    pub fn fail_next(&self, err: RuntimeError) {
        self.create_failures.lock().unwrap().push_back(err);
    }

    /// Fail every stop call from now on.
    pub fn fail_stops(&self, err: RuntimeError) {
        *self.stop_failure.lock().unwrap() = Some(err);
    }

    /// Remove a container behind the orchestrator's back.
    pub fn kill(&self, name: &str) {
        self.containers.lock().unwrap().remove(name);
    }

    pub fn set_state(&self, name: &str, state: ContainerState) {
        if let Some(container) = self.containers.lock().unwrap().get_mut(name) {
            container.state = state;
        }
    }

    pub fn insert_managed(&self, name: &str, owner: &str, classroom: &str, state: ContainerState) {
        let labels = HashMap::from([
            (LABEL_MANAGED.to_string(), "true".to_string()),
            (LABEL_OWNER.to_string(), owner.to_string()),
            (LABEL_CLASSROOM.to_string(), classroom.to_string()),
        ]);
        let container = RuntimeContainer {
            name: name.to_string(),
            state,
            labels,
            endpoint: Some(self.endpoint()),
        };
        self.containers.lock().unwrap().insert(name.to_string(), container);
    }

    pub fn container_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.containers.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    fn endpoint(&self) -> String {
        format!("127.0.0.1:{}", self.next_port.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<RuntimeContainer, RuntimeError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let delay = *self.create_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.create_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let container = RuntimeContainer {
            name: spec.name.clone(),
            state: ContainerState::Running,
            labels: spec.labels.clone(),
            endpoint: Some(self.endpoint()),
        };
        self.containers
            .lock()
            .unwrap()
            .insert(spec.name.clone(), container.clone());
        Ok(container)
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<RuntimeContainer>, RuntimeError> {
        let snapshot: Vec<RuntimeContainer> = self
            .containers
            .lock()
            .unwrap()
            .values()
            .filter(|c| {
                c.label(LABEL_MANAGED) == Some("true")
                    && filter.matches(
                        c.label(LABEL_OWNER).unwrap_or_default(),
                        c.label(LABEL_CLASSROOM).unwrap_or_default(),
                    )
            })
            .cloned()
            .collect();
        let delay = *self.list_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(snapshot)
    }

    async fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        if let Some(err) = self.stop_failure.lock().unwrap().clone() {
            return Err(err);
        }
        match self.containers.lock().unwrap().get_mut(name) {
            Some(container) => {
                container.state = ContainerState::Exited;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(name.to_string())),
        }
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        match self.containers.lock().unwrap().remove(name) {
            Some(_) => Ok(()),
            None => Err(RuntimeError::NotFound(name.to_string())),
        }
    }
}

/// Default settings with fast runtime retries.
pub fn settings() -> Settings {
    #[derive(clap::Parser)]
    struct Cli {
        #[command(flatten)]
        serve: ServeArgs,
    }
    let mut settings = Cli::parse_from(["labgate"]).serve.settings();
    settings.orchestrator.retry = RetryPolicy {
        attempts: 3,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        call_timeout: Duration::from_secs(5),
    };
    settings
}

/// App state over a fake runtime and a CS101 roster: `prof` instructs,
/// `alice` and `bob` attend.
pub async fn app_state(settings: &Settings) -> (AppState, Arc<FakeRuntime>, Arc<StaticRoster>) {
    let runtime = Arc::new(FakeRuntime::new());
    let roster = Arc::new(StaticRoster::new());
    roster.enroll("alice", "CS101", ClassroomRole::Student).await;
    roster.enroll("bob", "CS101", ClassroomRole::Student).await;
    roster.enroll("prof", "CS101", ClassroomRole::Instructor).await;
    let store = Arc::new(MemorySessionStore::new(settings.session_ttl));
    let state = AppState::new(settings, store, runtime.clone(), roster.clone());
    (state, runtime, roster)
}
