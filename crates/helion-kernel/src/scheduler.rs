//! Background task scheduler.
//!
//! Each registered task owns an independent timer, but every handler
//! invocation serializes through one process-wide lock: the kernel never
//! runs two background jobs at once. Safety guards, checked in order on
//! every fire: paused flag, task enabled, user-activity defer, concurrency
//! lock, circuit breaker, and (for LLM tasks) the daily call budget.
//!
//! Three consecutive handler errors trip the breaker: the task is disabled
//! with reason `circuit-breaker` and stays down until an operator resets it.
//! State persists to `scheduler.json` after every run and every state
//! change, as a full-file atomic rewrite.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;

use crate::error::{KernelError, Result};
use crate::registry::atomic_write;

/// Breaker threshold: consecutive errors before auto-disable.
pub const CIRCUIT_BREAKER_THRESHOLD: u32 = 3;

/// Reason string recorded when the breaker trips.
pub const CIRCUIT_BREAKER_REASON: &str = "circuit-breaker";

/// Floor on effective intervals regardless of configuration.
pub const MIN_INTERVAL: Duration = Duration::from_secs(60);

/// History entries retained per task.
const HISTORY_LIMIT: usize = 20;

/// Scheduler-wide policy.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How long the kernel must be idle before background work runs.
    pub defer: Duration,
    /// Maximum LLM calls per task per day.
    pub daily_budget: u64,
    /// Free-form configuration handed to handlers.
    pub task_config: Value,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            defer: Duration::from_secs(5 * 60),
            daily_budget: 50,
            task_config: Value::Null,
        }
    }
}

/// What a handler reports back.
pub type TaskOutcome = std::result::Result<Value, String>;

/// A background task body.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run one iteration. `Ok(stats)` counts as success; `Err` feeds the
    /// circuit breaker.
    async fn run(&self, ctx: TaskContext) -> TaskOutcome;
}

/// Static description of a task.
#[derive(Clone)]
pub struct TaskDefinition {
    /// Stable identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// What the task does.
    pub description: String,
    /// Grouping label (maintenance, improvement, security, ...).
    pub category: String,
    /// Whether the daily LLM budget applies.
    pub requires_llm: bool,
    /// Interval used when enabling without an explicit one.
    pub default_interval: Duration,
    /// The body.
    pub handler: Arc<dyn TaskHandler>,
}

/// One history record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Unix seconds when the run finished.
    pub at: u64,
    /// Whether the handler succeeded.
    pub success: bool,
    /// Milliseconds spent in the handler.
    pub duration_ms: u64,
    /// Stats (success) or error text (failure).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

/// Persisted per-task state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    /// Whether the timer fires.
    pub enabled: bool,
    /// Effective interval in seconds.
    pub interval_secs: u64,
    /// Unix seconds of the last run, 0 when never.
    pub last_run: u64,
    /// Unix seconds of the next scheduled run.
    pub next_run: u64,
    /// Total runs.
    pub run_count: u64,
    /// Successful runs.
    pub success_count: u64,
    /// Failed runs.
    pub error_count: u64,
    /// Consecutive failures feeding the breaker.
    pub consecutive_errors: u32,
    /// Why the task is disabled, when it was disabled automatically.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_reason: Option<String>,
    /// LLM calls made today.
    pub llm_calls_today: u64,
    /// The day `llm_calls_today` counts, as `YYYY-MM-DD`.
    pub llm_calls_date: String,
    /// Stats from the last successful run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_result: Option<Value>,
    /// Error text from the last failed run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Bounded run history, newest first.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl TaskState {
    fn fresh(interval: Duration) -> Self {
        Self {
            enabled: false,
            interval_secs: interval.as_secs().max(MIN_INTERVAL.as_secs()),
            last_run: 0,
            next_run: 0,
            run_count: 0,
            success_count: 0,
            error_count: 0,
            consecutive_errors: 0,
            disabled_reason: None,
            llm_calls_today: 0,
            llm_calls_date: today(),
            last_result: None,
            last_error: None,
            history: Vec::new(),
        }
    }

    /// Reset the daily counter when the date rolled over.
    fn roll_budget_date(&mut self) {
        let today = today();
        if self.llm_calls_date != today {
            self.llm_calls_date = today;
            self.llm_calls_today = 0;
        }
    }
}

/// A task's definition joined with its live state, for API listings.
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    /// Task id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Category label.
    pub category: String,
    /// Whether the budget applies.
    pub requires_llm: bool,
    /// Live state.
    #[serde(flatten)]
    pub state: TaskState,
}

/// Remaining daily budget for one task.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetStatus {
    /// Calls made today.
    pub used: u64,
    /// The daily cap.
    pub limit: u64,
    /// Calls left today.
    pub remaining: u64,
}

/// Aggregate counters across all tasks.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateStats {
    /// Registered tasks.
    pub tasks: usize,
    /// Currently enabled tasks.
    pub enabled: usize,
    /// Total runs across tasks.
    pub total_runs: u64,
    /// Total successes.
    pub total_successes: u64,
    /// Total errors.
    pub total_errors: u64,
    /// Tasks currently tripped by the breaker.
    pub tripped: usize,
    /// LLM calls across tasks today.
    pub llm_calls_today: u64,
}

#[derive(Serialize, Deserialize, Default)]
struct PersistedState {
    tasks: HashMap<String, TaskState>,
    paused: bool,
}

struct Registered {
    def: TaskDefinition,
    state: TaskState,
}

struct SchedulerInner {
    path: PathBuf,
    config: SchedulerConfig,
    tasks: RwLock<HashMap<String, Registered>>,
    paused: AtomicBool,
    last_activity: AtomicU64,
    run_lock: tokio::sync::Mutex<()>,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

/// Handle passed to a running handler.
#[derive(Clone)]
pub struct TaskContext {
    inner: Arc<SchedulerInner>,
    task_id: String,
}

impl TaskContext {
    /// Free-form scheduler configuration.
    pub fn config(&self) -> Value {
        self.inner.config.task_config.clone()
    }

    /// Record one LLM call against today's budget.
    pub fn track_llm_call(&self) {
        let mut tasks = self.inner.tasks.write();
        if let Some(reg) = tasks.get_mut(&self.task_id) {
            reg.state.roll_budget_date();
            reg.state.llm_calls_today += 1;
        }
    }

    /// Calls left in today's budget.
    pub fn budget_remaining(&self) -> u64 {
        let mut tasks = self.inner.tasks.write();
        match tasks.get_mut(&self.task_id) {
            Some(reg) => {
                reg.state.roll_budget_date();
                self.inner
                    .config
                    .daily_budget
                    .saturating_sub(reg.state.llm_calls_today)
            }
            None => 0,
        }
    }
}

/// The scheduler. Clone-cheap; clones share state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Load persisted state from `<data_root>/scheduler.json`.
    pub fn load(data_root: &Path, config: SchedulerConfig) -> Self {
        let path = data_root.join("scheduler.json");
        let persisted: PersistedState = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(p) => p,
                Err(err) => {
                    tracing::warn!(%err, "corrupt scheduler.json, starting fresh");
                    PersistedState::default()
                }
            },
            Err(_) => PersistedState::default(),
        };

        let inner = Arc::new(SchedulerInner {
            path,
            config,
            tasks: RwLock::new(HashMap::new()),
            paused: AtomicBool::new(persisted.paused),
            last_activity: AtomicU64::new(0),
            run_lock: tokio::sync::Mutex::new(()),
            timers: Mutex::new(HashMap::new()),
        });

        // Stash restored states until their definitions register.
        let mut restored = inner.tasks.write();
        for (id, state) in persisted.tasks {
            restored.insert(
                id.clone(),
                Registered {
                    def: TaskDefinition {
                        id,
                        name: String::new(),
                        description: String::new(),
                        category: String::new(),
                        requires_llm: false,
                        default_interval: Duration::from_secs(state.interval_secs),
                        handler: Arc::new(UnregisteredHandler),
                    },
                    state,
                },
            );
        }
        drop(restored);

        Self { inner }
    }

    /// Register a task, adopting any persisted state for its id.
    pub fn register(&self, def: TaskDefinition) {
        let mut tasks = self.inner.tasks.write();
        match tasks.get_mut(&def.id) {
            Some(existing) => {
                tracing::debug!(id = %def.id, "task re-registered, state preserved");
                existing.def = def;
            }
            None => {
                let state = TaskState::fresh(def.default_interval);
                tasks.insert(def.id.clone(), Registered { def, state });
            }
        }
    }

    /// Enable a task, optionally overriding its interval, and arm its timer.
    pub fn enable(&self, id: &str, interval: Option<Duration>) -> Result<()> {
        {
            let mut tasks = self.inner.tasks.write();
            let reg = tasks.get_mut(id).ok_or_else(|| not_found(id))?;
            if let Some(interval) = interval {
                reg.state.interval_secs = interval.as_secs().max(MIN_INTERVAL.as_secs());
            }
            reg.state.enabled = true;
            reg.state.next_run = now_unix() + reg.state.interval_secs;
        }
        self.inner.persist();
        self.arm_timer(id);
        Ok(())
    }

    /// Disable a task and cancel its timer.
    pub fn disable(&self, id: &str) -> Result<()> {
        {
            let mut tasks = self.inner.tasks.write();
            let reg = tasks.get_mut(id).ok_or_else(|| not_found(id))?;
            reg.state.enabled = false;
        }
        if let Some(handle) = self.inner.timers.lock().remove(id) {
            handle.abort();
        }
        self.inner.persist();
        Ok(())
    }

    /// Run a task immediately, bypassing the timer and the activity defer
    /// but not the circuit breaker, the concurrency lock, or the budget.
    pub async fn run_now(&self, id: &str) -> Result<Value> {
        {
            let tasks = self.inner.tasks.read();
            let reg = tasks.get(id).ok_or_else(|| not_found(id))?;
            if reg.state.consecutive_errors >= CIRCUIT_BREAKER_THRESHOLD {
                return Err(KernelError::Conflict {
                    what: format!("task '{id}' tripped the circuit breaker"),
                });
            }
        }
        self.inner.clone().execute(id).await
    }

    /// Pause all timers. A running handler completes; nothing new starts.
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
        self.inner.persist();
    }

    /// Resume timers.
    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
        self.inner.persist();
    }

    /// Whether the scheduler is paused.
    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Clear a task's breaker state so it can run again.
    pub fn reset_circuit_breaker(&self, id: &str) -> Result<()> {
        {
            let mut tasks = self.inner.tasks.write();
            let reg = tasks.get_mut(id).ok_or_else(|| not_found(id))?;
            reg.state.consecutive_errors = 0;
            reg.state.disabled_reason = None;
        }
        self.inner.persist();
        Ok(())
    }

    /// Note user activity; background work defers while the user is active.
    pub fn record_activity(&self) {
        self.inner.last_activity.store(now_unix(), Ordering::Relaxed);
    }

    /// Remaining budget for a task.
    pub fn check_budget(&self, id: &str) -> Result<BudgetStatus> {
        let mut tasks = self.inner.tasks.write();
        let reg = tasks.get_mut(id).ok_or_else(|| not_found(id))?;
        reg.state.roll_budget_date();
        let used = reg.state.llm_calls_today;
        let limit = self.inner.config.daily_budget;
        Ok(BudgetStatus {
            used,
            limit,
            remaining: limit.saturating_sub(used),
        })
    }

    /// All tasks with their live state.
    pub fn get_all(&self) -> Vec<TaskView> {
        let tasks = self.inner.tasks.read();
        let mut views: Vec<TaskView> = tasks
            .values()
            .map(|reg| TaskView {
                id: reg.def.id.clone(),
                name: reg.def.name.clone(),
                description: reg.def.description.clone(),
                category: reg.def.category.clone(),
                requires_llm: reg.def.requires_llm,
                state: reg.state.clone(),
            })
            .collect();
        views.sort_by(|a, b| a.id.cmp(&b.id));
        views
    }

    /// One task's run history, newest first.
    pub fn history(&self, id: &str) -> Result<Vec<HistoryEntry>> {
        let tasks = self.inner.tasks.read();
        let reg = tasks.get(id).ok_or_else(|| not_found(id))?;
        Ok(reg.state.history.clone())
    }

    /// Aggregate counters.
    pub fn aggregate_stats(&self) -> AggregateStats {
        let tasks = self.inner.tasks.read();
        AggregateStats {
            tasks: tasks.len(),
            enabled: tasks.values().filter(|r| r.state.enabled).count(),
            total_runs: tasks.values().map(|r| r.state.run_count).sum(),
            total_successes: tasks.values().map(|r| r.state.success_count).sum(),
            total_errors: tasks.values().map(|r| r.state.error_count).sum(),
            tripped: tasks
                .values()
                .filter(|r| r.state.disabled_reason.as_deref() == Some(CIRCUIT_BREAKER_REASON))
                .count(),
            llm_calls_today: tasks.values().map(|r| r.state.llm_calls_today).sum(),
        }
    }

    /// Arm timers for every enabled task. Call once after registration.
    pub fn start(&self) {
        let ids: Vec<String> = {
            let tasks = self.inner.tasks.read();
            tasks
                .iter()
                .filter(|(_, r)| r.state.enabled)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in ids {
            self.arm_timer(&id);
        }
    }

    /// Persist current state. Called by the daemon on shutdown.
    pub fn persist(&self) {
        self.inner.persist();
    }

    fn arm_timer(&self, id: &str) {
        let mut timers = self.inner.timers.lock();
        if let Some(old) = timers.remove(id) {
            old.abort();
        }
        let inner = Arc::clone(&self.inner);
        let task_id = id.to_string();
        let handle = tokio::spawn(async move {
            loop {
                let delay = {
                    let tasks = inner.tasks.read();
                    let Some(reg) = tasks.get(&task_id) else { break };
                    if !reg.state.enabled {
                        break;
                    }
                    let now = now_unix();
                    Duration::from_secs(reg.state.next_run.saturating_sub(now).max(1))
                };
                tokio::time::sleep(delay).await;

                match inner.clone().tick(&task_id).await {
                    TickResult::Ran | TickResult::SkippedGuard => {}
                    TickResult::Stop => break,
                    TickResult::Busy => {
                        // Lock contention: retry shortly without moving next_run.
                        tokio::time::sleep(Duration::from_secs(30)).await;
                    }
                }
            }
        });
        timers.insert(id.to_string(), handle);
    }
}

enum TickResult {
    Ran,
    SkippedGuard,
    Busy,
    Stop,
}

impl SchedulerInner {
    /// One timer fire: walk the guard chain, then execute.
    async fn tick(self: Arc<Self>, id: &str) -> TickResult {
        // Guard 1: global pause.
        if self.paused.load(Ordering::SeqCst) {
            self.defer_next_run(id, MIN_INTERVAL);
            return TickResult::SkippedGuard;
        }

        // Guards 2 and 3.
        {
            let mut tasks = self.tasks.write();
            let Some(reg) = tasks.get_mut(id) else {
                return TickResult::Stop;
            };
            if !reg.state.enabled {
                return TickResult::Stop;
            }
            // Guard 3: user-activity defer.
            let idle = now_unix().saturating_sub(self.last_activity.load(Ordering::Relaxed));
            if idle < self.config.defer.as_secs() {
                reg.state.next_run = now_unix() + self.config.defer.as_secs();
                return TickResult::SkippedGuard;
            }
        }

        // Guard 4: process-wide concurrency lock. Checked before the breaker
        // and the budget: a contended fire retries without moving `next_run`
        // and without touching task state.
        let Ok(_guard) = self.run_lock.try_lock() else {
            return TickResult::Busy;
        };

        // Guards 5 and 6, holding the lock.
        {
            let mut tasks = self.tasks.write();
            let Some(reg) = tasks.get_mut(id) else {
                return TickResult::Stop;
            };
            // Guard 5: circuit breaker.
            if reg.state.consecutive_errors >= CIRCUIT_BREAKER_THRESHOLD {
                reg.state.enabled = false;
                reg.state.disabled_reason = Some(CIRCUIT_BREAKER_REASON.to_string());
                return TickResult::Stop;
            }
            // Guard 6: daily LLM budget.
            if reg.def.requires_llm {
                reg.state.roll_budget_date();
                if reg.state.llm_calls_today >= self.config.daily_budget {
                    tracing::debug!(id, "daily budget exhausted, deferring");
                    reg.state.next_run = now_unix() + reg.state.interval_secs;
                    return TickResult::SkippedGuard;
                }
            }
        }

        let _ = self.clone().run_locked(id).await;
        TickResult::Ran
    }

    /// Execute holding the lock (acquired here; `tick` uses try_lock first).
    async fn execute(self: Arc<Self>, id: &str) -> Result<Value> {
        let _guard = self.run_lock.lock().await;
        self.clone().run_locked(id).await
    }

    async fn run_locked(self: Arc<Self>, id: &str) -> Result<Value> {
        let handler = {
            let tasks = self.tasks.read();
            let reg = tasks.get(id).ok_or_else(|| not_found(id))?;
            Arc::clone(&reg.def.handler)
        };

        let ctx = TaskContext {
            inner: Arc::clone(&self),
            task_id: id.to_string(),
        };
        let started = Instant::now();
        tracing::debug!(id, "task starting");
        let outcome = handler.run(ctx).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let result = {
            let mut tasks = self.tasks.write();
            let reg = tasks.get_mut(id).ok_or_else(|| not_found(id))?;
            let state = &mut reg.state;
            state.run_count += 1;
            state.last_run = now_unix();
            state.next_run = state.last_run + state.interval_secs;

            let (entry, result) = match outcome {
                Ok(stats) => {
                    state.success_count += 1;
                    state.consecutive_errors = 0;
                    state.last_result = Some(stats.clone());
                    state.last_error = None;
                    let entry = HistoryEntry {
                        at: state.last_run,
                        success: true,
                        duration_ms,
                        detail: Some(stats.clone()),
                    };
                    (entry, Ok(stats))
                }
                Err(message) => {
                    state.error_count += 1;
                    state.consecutive_errors += 1;
                    state.last_error = Some(message.clone());
                    if state.consecutive_errors >= CIRCUIT_BREAKER_THRESHOLD {
                        state.enabled = false;
                        state.disabled_reason = Some(CIRCUIT_BREAKER_REASON.to_string());
                        tracing::warn!(id, "circuit breaker tripped, task disabled");
                    }
                    let entry = HistoryEntry {
                        at: state.last_run,
                        success: false,
                        duration_ms,
                        detail: Some(Value::String(message.clone())),
                    };
                    (entry, Err(KernelError::Internal(format!("task '{id}': {message}"))))
                }
            };
            state.history.insert(0, entry);
            state.history.truncate(HISTORY_LIMIT);
            result
        };

        self.persist();
        result
    }

    fn defer_next_run(&self, id: &str, by: Duration) {
        let mut tasks = self.tasks.write();
        if let Some(reg) = tasks.get_mut(id) {
            reg.state.next_run = now_unix() + by.as_secs();
        }
    }

    fn persist(&self) {
        let state = {
            let tasks = self.tasks.read();
            PersistedState {
                tasks: tasks
                    .iter()
                    .map(|(id, reg)| (id.clone(), reg.state.clone()))
                    .collect(),
                paused: self.paused.load(Ordering::SeqCst),
            }
        };
        match serde_json::to_vec_pretty(&state) {
            Ok(json) => {
                if let Err(err) = atomic_write(&self.path, &json) {
                    tracing::warn!(%err, "scheduler persist failed");
                }
            }
            Err(err) => tracing::warn!(%err, "scheduler serialize failed"),
        }
    }
}

/// Placeholder handler for states restored before their definition registers.
struct UnregisteredHandler;

#[async_trait]
impl TaskHandler for UnregisteredHandler {
    async fn run(&self, _ctx: TaskContext) -> TaskOutcome {
        Err("task has persisted state but no registered handler".to_string())
    }
}

fn not_found(id: &str) -> KernelError {
    KernelError::NotFound {
        what: format!("task {id}"),
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn today() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}
