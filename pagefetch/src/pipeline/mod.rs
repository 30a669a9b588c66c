//! Download pipeline: priority scheduling over a bounded connection pool.
//!
//! One logical control flow dispatches tasks and delivers transport events;
//! nothing blocks the scheduler. Callers submit work with [`Pipeline::fetch`],
//! ferry transport events in with [`Pipeline::handle_event`], and tick the
//! scheduler with [`Pipeline::step`]. A task suspends either waiting for a
//! pool slot (`Queued`) or waiting for credentials (`AuthChallenge`).
//!
//! State machine per task:
//!
//! ```text
//! Queued -> Connecting -> Transferring -> Finished | Failed | Cancelled
//!    ^                         |
//!    +----- AuthChallenge <----+    (suspends until credentials arrive)
//! ```
//!
//! Terminal callbacks fire exactly once, at a scheduler step, with the
//! task's cache entry locked for the duration of the call - never
//! re-entrantly from inside `fetch` or `cancel`, so a callback that itself
//! schedules a new fetch cannot observe a torn entry.

mod queue;

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::auth::{self, AuthError, AuthManager, AuthScope, NonceCountMode};
use crate::cache::{CacheMode, CacheRegistry, EntryLock, RegistryConfig};
use crate::error::FetchError;
use crate::transport::{Transport, TransportEvent, TransportRequest};
use crate::uri::ResourceId;

use queue::FetchQueue;

// =============================================================================
// Identifiers, priorities, states
// =============================================================================

/// Opaque identifier of a download task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Scheduling priority; numerically higher dispatches first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(i32);

impl Priority {
    /// Background fetches (images off-screen, speculative loads).
    pub const LOW: Priority = Priority(0);
    /// The document the user asked for.
    pub const MAIN: Priority = Priority(100);
    /// Blocking the render right now.
    pub const HIGH: Priority = Priority(200);

    /// Custom level between or beyond the named ones.
    pub fn new(value: i32) -> Self {
        Self(value)
    }

    pub fn value(&self) -> i32 {
        self.0
    }
}

/// Lifecycle state of a download task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Connecting,
    Transferring,
    /// Suspended awaiting credentials; resumes into `Connecting`.
    AuthChallenge,
    Finished,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Failed | TaskState::Cancelled
        )
    }
}

/// Terminal result delivered to fetch callbacks.
#[derive(Debug)]
pub enum FetchOutcome {
    Finished,
    Failed(FetchError),
    /// Explicit cancellation; not an error, no user-facing message.
    Cancelled,
}

impl FetchOutcome {
    pub fn is_finished(&self) -> bool {
        matches!(self, FetchOutcome::Finished)
    }
}

/// Completion callback: receives the task's entry (locked for the duration
/// of the call) and the terminal outcome. Fires exactly once.
pub type FetchCallback = Box<dyn FnOnce(&EntryLock, &FetchOutcome)>;

/// Handle identifying one fetch request (one callback) on a task.
///
/// Several requests for the same identifier may share one underlying task;
/// each keeps its own handle and its own exactly-once callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FetchHandle {
    task: TaskId,
    waiter: u64,
}

impl FetchHandle {
    pub fn task_id(&self) -> TaskId {
        self.task
    }
}

/// Misuse of the pipeline API surface.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unknown task")]
    UnknownTask,

    #[error("task is not awaiting credentials")]
    NotSuspended,

    #[error(transparent)]
    Auth(#[from] AuthError),
}

// =============================================================================
// Configuration
// =============================================================================

/// Default per-host connection bound.
pub const DEFAULT_CONNECTIONS_PER_HOST: usize = 4;

/// Pipeline configuration.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Concurrent transport requests allowed per remote host.
    pub connections_per_host: usize,

    /// Cache registry settings.
    pub registry: RegistryConfig,

    /// Digest nonce-count policy.
    pub nonce_count_mode: NonceCountMode,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            connections_per_host: DEFAULT_CONNECTIONS_PER_HOST,
            registry: RegistryConfig::default(),
            nonce_count_mode: NonceCountMode::default(),
        }
    }
}

// =============================================================================
// Task bookkeeping
// =============================================================================

struct Waiter {
    id: u64,
    callback: Option<FetchCallback>,
    cancelled: bool,
}

struct DownloadTask {
    uri: ResourceId,
    priority: Priority,
    mode: CacheMode,
    state: TaskState,
    /// Kept locked for the task's whole life; released after the terminal
    /// callbacks return.
    entry_lock: EntryLock,
    waiters: Vec<Waiter>,
    auth_header: Option<String>,
    /// An authenticated retry already went out; the next challenge is a
    /// rejection, not an invitation.
    auth_attempted: bool,
    pending_scope: Option<AuthScope>,
    /// Terminal outcome decided but callbacks not yet delivered.
    pending_outcome: Option<FetchOutcome>,
}

enum EventAction {
    Nothing,
    Finish,
    Fail(FetchError),
    Auth(String),
}

// =============================================================================
// Pipeline
// =============================================================================

/// The download pipeline.
///
/// Owns the cache registry, the authentication manager, the priority queue,
/// and the per-host connection accounting. Generic over the [`Transport`]
/// that actually moves bytes.
pub struct Pipeline<T: Transport> {
    transport: T,
    registry: CacheRegistry,
    auth: AuthManager,
    config: PipelineConfig,
    queue: FetchQueue,
    tasks: HashMap<TaskId, DownloadTask>,
    /// In-flight transport task per indexed identifier (attach target).
    inflight: HashMap<ResourceId, TaskId>,
    active_per_host: HashMap<String, usize>,
    next_task: u64,
    next_waiter: u64,
}

impl<T: Transport> Pipeline<T> {
    pub fn new(transport: T, config: PipelineConfig) -> Self {
        Self {
            transport,
            registry: CacheRegistry::new(config.registry.clone()),
            auth: AuthManager::new(config.nonce_count_mode),
            config,
            queue: FetchQueue::new(),
            tasks: HashMap::new(),
            inflight: HashMap::new(),
            active_per_host: HashMap::new(),
            next_task: 0,
            next_waiter: 0,
        }
    }

    pub fn registry(&self) -> &CacheRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut CacheRegistry {
        &mut self.registry
    }

    pub fn auth_mut(&mut self) -> &mut AuthManager {
        &mut self.auth
    }

    /// True while any task (including undelivered terminals) exists.
    pub fn has_tasks(&self) -> bool {
        !self.tasks.is_empty()
    }

    pub fn task_state(&self, handle: &FetchHandle) -> Option<TaskState> {
        self.tasks.get(&handle.task).map(|t| t.state)
    }

    /// The auth scope a suspended task is waiting on, for prompting.
    pub fn pending_challenge(&self, handle: &FetchHandle) -> Option<AuthScope> {
        self.tasks
            .get(&handle.task)
            .filter(|t| t.state == TaskState::AuthChallenge)
            .and_then(|t| t.pending_scope.clone())
    }

    /// Requests a fetch. The callback fires exactly once, at a scheduler
    /// step, when the underlying task reaches a terminal state.
    ///
    /// Under `Normal` mode a complete cached entry satisfies the request
    /// without transport work, and a request for an identifier already in
    /// flight attaches to the existing task.
    pub fn fetch(
        &mut self,
        uri: ResourceId,
        priority: Priority,
        mode: CacheMode,
        callback: FetchCallback,
    ) -> FetchHandle {
        // Attach to in-flight work rather than duplicating transport.
        if matches!(mode, CacheMode::Normal | CacheMode::AlwaysCache) {
            if let Some(task_id) = self.inflight.get(&uri).copied() {
                if let Some(task) = self.tasks.get_mut(&task_id) {
                    let waiter = self.next_waiter;
                    self.next_waiter += 1;
                    task.waiters.push(Waiter {
                        id: waiter,
                        callback: Some(callback),
                        cancelled: false,
                    });
                    // An attached request lends the task its urgency.
                    let bumped = priority > task.priority;
                    if bumped {
                        task.priority = priority;
                    }
                    let requeue = bumped && task.state == TaskState::Queued;
                    debug!(uri = %uri, task = ?task_id, bumped, "attached to in-flight fetch");
                    if requeue {
                        self.queue.remove(task_id);
                        self.queue.push(task_id, priority);
                    }
                    return FetchHandle {
                        task: task_id,
                        waiter,
                    };
                }
            }
        }

        let (entry, reused) = self.registry.get_or_create(&uri, mode);
        let entry_lock = entry.lock();
        if reused && !entry.is_complete() {
            // Leftover from an earlier unfinished fetch that a lock holder
            // kept registered (no task is in flight for it, or the attach
            // path above would have taken it). Start from a blank slate.
            debug!(uri = %uri, "clearing leftover incomplete entry");
            entry_lock.reset();
        }
        let task_id = TaskId(self.next_task);
        self.next_task += 1;
        let waiter = self.next_waiter;
        self.next_waiter += 1;

        let mut task = DownloadTask {
            uri: uri.clone(),
            priority,
            mode,
            state: TaskState::Queued,
            entry_lock,
            waiters: vec![Waiter {
                id: waiter,
                callback: Some(callback),
                cancelled: false,
            }],
            auth_header: None,
            auth_attempted: false,
            pending_scope: None,
            pending_outcome: None,
        };

        if reused && entry.is_complete() {
            // Cache hit: no transport work, terminal at the next step.
            debug!(uri = %uri, task = ?task_id, "served from cache");
            task.state = TaskState::Finished;
            task.pending_outcome = Some(FetchOutcome::Finished);
            self.tasks.insert(task_id, task);
            return FetchHandle {
                task: task_id,
                waiter,
            };
        }

        if matches!(
            mode,
            CacheMode::Normal | CacheMode::AlwaysCache | CacheMode::ForceReload
        ) {
            self.inflight.insert(uri.clone(), task_id);
        }
        self.queue.push(task_id, priority);
        self.tasks.insert(task_id, task);
        info!(uri = %uri, task = ?task_id, priority = priority.value(), ?mode, "fetch queued");
        FetchHandle {
            task: task_id,
            waiter,
        }
    }

    /// Cancels one fetch request.
    ///
    /// The request's callback still fires (with `Cancelled`), at the next
    /// scheduler step. The underlying task is torn down only when every
    /// request sharing it has been cancelled; cancelling one attached
    /// request never disturbs the entry for the others.
    pub fn cancel(&mut self, handle: &FetchHandle) {
        let Some(task) = self.tasks.get_mut(&handle.task) else {
            return;
        };
        if task.state.is_terminal() {
            // Terminal transition already happened; its outcome stands.
            return;
        }
        let Some(waiter) = task.waiters.iter_mut().find(|w| w.id == handle.waiter) else {
            return;
        };
        if waiter.cancelled {
            return;
        }
        waiter.cancelled = true;
        let all_cancelled = task.waiters.iter().all(|w| w.cancelled);
        trace!(task = ?handle.task, waiter = handle.waiter, all_cancelled, "cancel requested");
        if all_cancelled {
            self.cancel_task(handle.task);
        }
    }

    fn cancel_task(&mut self, task_id: TaskId) {
        let Some(task) = self.tasks.get(&task_id) else {
            return;
        };
        let state = task.state;
        let host = task.uri.host().to_string();
        if state.is_terminal() {
            return;
        }
        match state {
            TaskState::Queued => {
                self.queue.remove(task_id);
            }
            TaskState::Connecting | TaskState::Transferring => {
                self.transport.cancel(task_id);
                self.release_slot(&host);
            }
            // Suspended tasks hold no pool slot and no transport resource.
            TaskState::AuthChallenge => {}
            _ => {}
        }
        if let Some(task) = self.tasks.get_mut(&task_id) {
            task.state = TaskState::Cancelled;
            task.pending_outcome = Some(FetchOutcome::Cancelled);
        }
        debug!(task = ?task_id, "task cancelled");
    }

    /// Delivers one transport event to its task, then runs a scheduler step.
    ///
    /// Events for unknown (already torn down) tasks are dropped.
    pub fn handle_event(&mut self, task_id: TaskId, event: TransportEvent) {
        let action = {
            let Some(task) = self.tasks.get_mut(&task_id) else {
                trace!(task = ?task_id, "event for unknown task dropped");
                return;
            };
            if task.state.is_terminal() {
                trace!(task = ?task_id, "event after terminal state dropped");
                return;
            }
            // A suspended task already gave up its pool slot; data from the
            // abandoned request must not complete the entry or release a
            // slot now held by another task. Only a failure is honored.
            if task.state == TaskState::AuthChallenge
                && !matches!(event, TransportEvent::Failed { .. })
            {
                trace!(task = ?task_id, "event for suspended task dropped");
                return;
            }
            match event {
                TransportEvent::Headers { head, content_type } => {
                    task.entry_lock.set_head(&head);
                    if let Some(ct) = content_type {
                        task.entry_lock.set_content_type(&ct);
                    }
                    task.state = TaskState::Transferring;
                    EventAction::Nothing
                }
                TransportEvent::Data { offset, bytes } => {
                    if task.state == TaskState::Connecting {
                        task.state = TaskState::Transferring;
                    }
                    match task.entry_lock.insert_fragment(offset, &bytes) {
                        Ok(()) => EventAction::Nothing,
                        Err(e) => EventAction::Fail(e.into()),
                    }
                }
                TransportEvent::Complete => EventAction::Finish,
                TransportEvent::Failed { error } => EventAction::Fail(error.into()),
                TransportEvent::AuthRequired { challenge } => EventAction::Auth(challenge),
            }
        };

        match action {
            EventAction::Nothing => {}
            EventAction::Finish => self.finish_task(task_id),
            EventAction::Fail(error) => self.fail_task(task_id, error, true),
            EventAction::Auth(challenge) => self.auth_challenge(task_id, challenge),
        }
        self.step();
    }

    /// Resumes a task suspended in `AuthChallenge` after credentials were
    /// recorded with [`AuthManager::set_credentials`].
    pub fn resume_auth(&mut self, handle: &FetchHandle) -> Result<(), PipelineError> {
        let (state, scope, path) = match self.tasks.get(&handle.task) {
            Some(t) => (t.state, t.pending_scope.clone(), t.uri.path().to_string()),
            None => return Err(PipelineError::UnknownTask),
        };
        if state != TaskState::AuthChallenge {
            return Err(PipelineError::NotSuspended);
        }
        let scope = scope.ok_or(PipelineError::NotSuspended)?;
        let header = self.auth.response_header(&scope, "GET", &path)?;
        self.requeue_with_auth(handle.task, header);
        self.step();
        Ok(())
    }

    /// Runs one scheduler step: delivers due callbacks, then dispatches
    /// queued tasks into free pool slots in priority order.
    pub fn step(&mut self) {
        self.deliver_cancelled_waiters();
        self.deliver_terminal();
        self.dispatch();
        // Dispatch can fail a task synchronously; don't sit on it.
        self.deliver_terminal();
    }

    // -------------------------------------------------------------------------
    // Event handling internals
    // -------------------------------------------------------------------------

    fn finish_task(&mut self, task_id: TaskId) {
        let (host, normalized) = {
            let Some(task) = self.tasks.get_mut(&task_id) else {
                return;
            };
            (task.uri.host().to_string(), task.entry_lock.normalize())
        };
        self.release_slot(&host);
        match normalized {
            Ok(()) => {
                if let Some(task) = self.tasks.get_mut(&task_id) {
                    task.entry_lock.set_complete(true);
                    task.state = TaskState::Finished;
                    task.pending_outcome = Some(FetchOutcome::Finished);
                    info!(task = ?task_id, uri = %task.uri, length = task.entry_lock.length(), "fetch complete");
                }
            }
            Err(e) => {
                // Slot already released; don't touch it again.
                if let Some(task) = self.tasks.get_mut(&task_id) {
                    task.state = TaskState::Failed;
                    task.pending_outcome = Some(FetchOutcome::Failed(e.into()));
                }
            }
        }
    }

    fn fail_task(&mut self, task_id: TaskId, error: FetchError, cancel_transport: bool) {
        let Some(task) = self.tasks.get(&task_id) else {
            return;
        };
        let state = task.state;
        let host = task.uri.host().to_string();
        match state {
            TaskState::Connecting | TaskState::Transferring => {
                if cancel_transport {
                    self.transport.cancel(task_id);
                }
                self.release_slot(&host);
            }
            TaskState::Queued => {
                self.queue.remove(task_id);
            }
            _ => {}
        }
        if let Some(task) = self.tasks.get_mut(&task_id) {
            warn!(task = ?task_id, uri = %task.uri, error = %error, "fetch failed");
            task.state = TaskState::Failed;
            task.pending_outcome = Some(FetchOutcome::Failed(error));
        }
    }

    fn auth_challenge(&mut self, task_id: TaskId, challenge: String) {
        let (uri, attempted) = {
            let Some(task) = self.tasks.get_mut(&task_id) else {
                return;
            };
            // The transport side of this request is over: the slot frees
            // and the task suspends before we decide what happens next.
            let uri = task.uri.clone();
            let attempted = task.auth_attempted;
            task.state = TaskState::AuthChallenge;
            (uri, attempted)
        };
        self.release_slot(uri.host());

        let parsed = match auth::parse_challenge(&challenge) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.fail_task(task_id, FetchError::Parse(e.to_string()), false);
                return;
            }
        };
        let scope = AuthScope::new(uri.host(), uri.port(), &parsed.realm);
        self.auth.record_challenge(&scope, &parsed);

        if attempted {
            // Our computed response was not accepted.
            self.fail_task(task_id, AuthError::Rejected.into(), false);
            return;
        }
        if self.auth.has_credentials(&scope) {
            match self.auth.response_header(&scope, "GET", uri.path()) {
                Ok(header) => {
                    if let Some(task) = self.tasks.get_mut(&task_id) {
                        task.pending_scope = Some(scope);
                    }
                    self.requeue_with_auth(task_id, header);
                }
                Err(e) => self.fail_task(task_id, e.into(), false),
            }
        } else {
            if let Some(task) = self.tasks.get_mut(&task_id) {
                task.pending_scope = Some(scope);
            }
            info!(task = ?task_id, uri = %uri, "fetch suspended awaiting credentials");
        }
    }

    fn requeue_with_auth(&mut self, task_id: TaskId, header: String) {
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return;
        };
        task.auth_header = Some(header);
        task.auth_attempted = true;
        task.state = TaskState::Queued;
        let priority = task.priority;
        self.queue.push(task_id, priority);
        debug!(task = ?task_id, "retrying with credentials attached");
    }

    // -------------------------------------------------------------------------
    // Scheduler internals
    // -------------------------------------------------------------------------

    fn deliver_cancelled_waiters(&mut self) {
        let due: Vec<(TaskId, u64)> = self
            .tasks
            .iter()
            .filter(|(_, t)| t.pending_outcome.is_none())
            .flat_map(|(id, t)| {
                t.waiters
                    .iter()
                    .filter(|w| w.cancelled && w.callback.is_some())
                    .map(|w| (*id, w.id))
                    .collect::<Vec<_>>()
            })
            .collect();
        for (task_id, waiter_id) in due {
            if let Some(task) = self.tasks.get_mut(&task_id) {
                let callback = task
                    .waiters
                    .iter_mut()
                    .find(|w| w.id == waiter_id)
                    .and_then(|w| w.callback.take());
                if let Some(callback) = callback {
                    callback(&task.entry_lock, &FetchOutcome::Cancelled);
                }
            }
        }
    }

    fn deliver_terminal(&mut self) {
        let mut due: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|(_, t)| t.pending_outcome.is_some())
            .map(|(id, _)| *id)
            .collect();
        due.sort();

        for task_id in due {
            let Some(mut task) = self.tasks.remove(&task_id) else {
                continue;
            };
            let Some(outcome) = task.pending_outcome.take() else {
                continue;
            };
            if self.inflight.get(&task.uri) == Some(&task_id) {
                self.inflight.remove(&task.uri);
            }
            debug!(task = ?task_id, uri = %task.uri, ?outcome, waiters = task.waiters.len(), "delivering terminal callbacks");

            for waiter in &mut task.waiters {
                let Some(callback) = waiter.callback.take() else {
                    continue;
                };
                if waiter.cancelled {
                    callback(&task.entry_lock, &FetchOutcome::Cancelled);
                } else {
                    callback(&task.entry_lock, &outcome);
                }
            }

            let uri = task.uri.clone();
            let mode = task.mode;
            // Release the task's own lock before registry cleanup so the
            // count reflects only external holders.
            drop(task);
            if !outcome.is_finished()
                && matches!(
                    mode,
                    CacheMode::Normal | CacheMode::AlwaysCache | CacheMode::ForceReload
                )
            {
                self.registry.discard_incomplete(&uri);
            }
        }
    }

    fn dispatch(&mut self) {
        let mut deferred = Vec::new();
        while let Some(fetch) = self.queue.pop() {
            let (host, request) = match self.tasks.get(&fetch.task) {
                Some(task) if task.state == TaskState::Queued => (
                    task.uri.host().to_string(),
                    TransportRequest {
                        uri: task.uri.clone(),
                        auth_header: task.auth_header.clone(),
                    },
                ),
                // Cancelled or superseded while queued; drop the queue entry.
                _ => continue,
            };

            let active = self.active_per_host.get(&host).copied().unwrap_or(0);
            if active >= self.config.connections_per_host {
                deferred.push(fetch);
                continue;
            }

            debug!(
                task = ?fetch.task,
                host = %host,
                priority = fetch.priority.value(),
                wait_ms = fetch.wait_time().as_millis() as u64,
                "dispatching fetch"
            );
            match self.transport.start(fetch.task, request) {
                Ok(()) => {
                    *self.active_per_host.entry(host).or_insert(0) += 1;
                    if let Some(task) = self.tasks.get_mut(&fetch.task) {
                        task.state = TaskState::Connecting;
                    }
                }
                Err(e) => {
                    warn!(task = ?fetch.task, error = %e, "transport refused to start");
                    if let Some(task) = self.tasks.get_mut(&fetch.task) {
                        task.state = TaskState::Failed;
                        task.pending_outcome = Some(FetchOutcome::Failed(e.into()));
                    }
                }
            }
        }
        for fetch in deferred {
            self.queue.requeue(fetch);
        }
    }

    fn release_slot(&mut self, host: &str) {
        if let Some(active) = self.active_per_host.get_mut(host) {
            *active = active.saturating_sub(1);
            if *active == 0 {
                self.active_per_host.remove(host);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
