//! espace-testing — scripted fakes for provider and API tests.
//!
//! `FakeExecutor` and `FakeEventRepository` let tests drive the checkout
//! coordinator and start supervisor through their failure and retry paths
//! without a cluster or an event repository.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use espace_core::ExecutorSpec;
use espace_events::{Event, EventData, EventError, EventMeta, EventRepository, EventResult};
use espace_runner::{
    Executor, ExecutorError, ExecutorResult, RunnerInspector, StartedWorkload,
};

/// Build an event with the given id and data name.
pub fn test_event(id: &str, name: &str) -> Event {
    Event {
        meta: EventMeta {
            id: id.to_string(),
            event_type: "EiffelTestSuiteStartedEvent".to_string(),
        },
        data: EventData {
            name: name.to_string(),
        },
        links: Vec::new(),
    }
}

#[derive(Default)]
struct FakeExecutorState {
    fail_start: Option<String>,
    block_wait_ready: bool,
    fail_wait_ready: Option<String>,
    alive: bool,
    alive_results: VecDeque<ExecutorResult<bool>>,
    fail_stop_for: Vec<String>,
    started: Vec<String>,
    stopped: Vec<String>,
    cancelled: Vec<String>,
}

/// Scripted in-memory executor backend.
pub struct FakeExecutor {
    state: Mutex<FakeExecutorState>,
}

impl Default for FakeExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeExecutorState {
                alive: true,
                ..FakeExecutorState::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeExecutorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn with_start_failure(self, reason: &str) -> Self {
        self.lock().fail_start = Some(reason.to_string());
        self
    }

    /// `wait_ready` never returns; the caller's deadline must fire.
    pub fn with_blocking_wait_ready(self) -> Self {
        self.lock().block_wait_ready = true;
        self
    }

    pub fn with_wait_ready_failure(self, reason: &str) -> Self {
        self.lock().fail_wait_ready = Some(reason.to_string());
        self
    }

    pub fn with_stop_failure_for(self, name: &str) -> Self {
        self.lock().fail_stop_for.push(name.to_string());
        self
    }

    /// Queue one scripted `alive` answer; once drained, `alive` falls back
    /// to the steady value.
    pub fn push_alive_result(&self, result: ExecutorResult<bool>) {
        self.lock().alive_results.push_back(result);
    }

    pub fn set_alive(&self, alive: bool) {
        self.lock().alive = alive;
    }

    pub fn started(&self) -> Vec<String> {
        self.lock().started.clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.lock().stopped.clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.lock().cancelled.clone()
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    fn name(&self) -> &str {
        "kubernetes"
    }

    async fn start(&self, spec: &ExecutorSpec) -> ExecutorResult<String> {
        let name = format!("etr-{}", spec.id);
        let mut state = self.lock();
        if let Some(reason) = &state.fail_start {
            return Err(ExecutorError::Cluster(reason.clone()));
        }
        state.started.push(name.clone());
        Ok(name)
    }

    async fn wait_ready(&self, name: &str) -> ExecutorResult<StartedWorkload> {
        let (block, failure) = {
            let state = self.lock();
            (state.block_wait_ready, state.fail_wait_ready.clone())
        };
        if block {
            std::future::pending::<()>().await;
        }
        if let Some(reason) = failure {
            return Err(ExecutorError::Cluster(reason));
        }
        Ok(StartedWorkload {
            build_id: name.to_string(),
            build_url: None,
        })
    }

    async fn alive(&self, _name: &str) -> ExecutorResult<bool> {
        let mut state = self.lock();
        match state.alive_results.pop_front() {
            Some(result) => result,
            None => Ok(state.alive),
        }
    }

    async fn stop(&self, name: &str) -> ExecutorResult<()> {
        let mut state = self.lock();
        if state.fail_stop_for.iter().any(|n| n == name) {
            return Err(ExecutorError::Cluster(format!("cannot stop {name}")));
        }
        state.stopped.push(name.to_string());
        Ok(())
    }

    async fn cancel(&self, name: &str) -> ExecutorResult<()> {
        self.lock().cancelled.push(name.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct FakeRepositoryState {
    environment: VecDeque<EventResult<Event>>,
    main_suite: VecDeque<EventResult<Event>>,
    sub_suite: VecDeque<EventResult<Event>>,
    environment_lookups: usize,
    main_suite_lookups: usize,
    sub_suite_lookups: usize,
}

/// Scripted event repository. Each lookup pops its queue; a drained queue
/// answers with a canned success event.
pub struct FakeEventRepository {
    state: Mutex<FakeRepositoryState>,
}

impl Default for FakeEventRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeEventRepository {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeRepositoryState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeRepositoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Answer the next `n` sub-suite lookups with `NotFound`.
    pub fn sub_suite_not_found(self, n: usize) -> Self {
        {
            let mut state = self.lock();
            for _ in 0..n {
                state.sub_suite.push_back(Err(EventError::NotFound));
            }
        }
        self
    }

    pub fn push_environment(&self, result: EventResult<Event>) {
        self.lock().environment.push_back(result);
    }

    pub fn push_sub_suite(&self, result: EventResult<Event>) {
        self.lock().sub_suite.push_back(result);
    }

    /// How many times each lookup ran: (environment, main suite, sub suite).
    pub fn lookups(&self) -> (usize, usize, usize) {
        let state = self.lock();
        (
            state.environment_lookups,
            state.main_suite_lookups,
            state.sub_suite_lookups,
        )
    }
}

#[async_trait]
impl EventRepository for FakeEventRepository {
    async fn environment_defined(&self, id: &str) -> EventResult<Event> {
        let mut state = self.lock();
        state.environment_lookups += 1;
        match state.environment.pop_front() {
            Some(result) => result,
            None => {
                let mut event = test_event(id, "sub suite 0");
                event.links.push(espace_events::EventLink {
                    link_type: "CONTEXT".to_string(),
                    target: "context-1".to_string(),
                });
                Ok(event)
            }
        }
    }

    async fn main_suite_started(&self, context_id: &str) -> EventResult<Event> {
        let mut state = self.lock();
        state.main_suite_lookups += 1;
        match state.main_suite.pop_front() {
            Some(result) => result,
            None => Ok(test_event(&format!("main-suite-{context_id}"), "main suite")),
        }
    }

    async fn sub_suite_started(&self, main_suite_id: &str, name: &str) -> EventResult<Event> {
        let mut state = self.lock();
        state.sub_suite_lookups += 1;
        match state.sub_suite.pop_front() {
            Some(result) => result,
            None => Ok(test_event(&format!("sub-suite-of-{main_suite_id}"), name)),
        }
    }
}

/// Scripted runner inspector for relay tests.
pub struct FakeInspector {
    finished: AtomicBool,
    ip: Mutex<Option<String>>,
}

impl FakeInspector {
    pub fn running(ip: &str) -> Self {
        Self {
            finished: AtomicBool::new(false),
            ip: Mutex::new(Some(ip.to_string())),
        }
    }

    pub fn finished() -> Self {
        Self {
            finished: AtomicBool::new(true),
            ip: Mutex::new(None),
        }
    }

    pub fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl RunnerInspector for FakeInspector {
    async fn is_finished(&self, _identifier: &str) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    async fn log_listener_ip(&self, identifier: &str) -> ExecutorResult<String> {
        self.ip
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| ExecutorError::NoPod(identifier.to_string()))
    }
}
