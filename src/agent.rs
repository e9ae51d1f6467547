use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{info, warn};

use crate::action::{self, ActionType, ParsedAction, Point};
use crate::memory::{AgentMemory, Role};
use crate::planner::{PlanContext, TaskPlanner};
use crate::retry::{RetryCoordinator, RetryPolicy, RetryStats};
use crate::safety::{SafetyConfig, SafetyValidator};

// ========================= Errors =========================

#[derive(Debug, Error, Clone, Serialize, Deserialize)]
pub enum AgentError {
    #[error("vision error: {0}")]
    Vision(String),
    #[error("model error: {0}")]
    Model(String),
    #[error("execution error: {0}")]
    Execution(String),
    #[error("logger error: {0}")]
    Logger(String),
    #[error("could not determine next action")]
    NoAction,
    #[error("planner produced an empty plan for: {0}")]
    EmptyPlan(String),
    #[error("action blocked: {0}")]
    Blocked(String),
    #[error("confirmation denied or timed out")]
    ConfirmationDenied,
    #[error("agent is already running")]
    AlreadyRunning,
    #[error("exceeded maximum steps ({0})")]
    BudgetExceeded(usize),
    #[error("cancelled")]
    Aborted,
    #[error("{0}")]
    Other(String),
}

// ========================= Collaborator contracts =========================

/// Opaque handle to a captured screen, passed through to the model client
/// untouched. How it is encoded is the capture layer's concern.
#[derive(Clone, Debug)]
pub struct ScreenImage(pub String);

#[async_trait]
pub trait ScreenCapture: Send + Sync {
    async fn capture_screen(&self) -> Result<ScreenImage, AgentError>;
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Vision-prompted completion over a captured screen.
    async fn analyze(&self, image: &ScreenImage, prompt: &str) -> Result<String, AgentError>;
    /// Plain text completion.
    async fn complete(&self, prompt: &str) -> Result<String, AgentError>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub error: Option<String>,
    pub duration: Duration,
}

/// Device-control layer. Must serialize physical input itself and be safe to
/// call repeatedly under retry.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, action: &ParsedAction) -> Result<ExecutionOutcome, AgentError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    Success,
    Failed,
    Cancelled,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub action: String,
    pub details: Value,
    pub status: ActivityStatus,
    pub screenshot: Option<String>,
}

/// Append-only audit sink; never read back during a run.
#[async_trait]
pub trait ActivityLogger: Send + Sync {
    async fn log(&self, entry: ActivityEntry) -> Result<String, AgentError>;
}

// ========================= Outbound events =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentPhase {
    Thinking,
    Planning,
    Executing,
    Waiting,
    Completed,
    Error,
}

/// Events pushed to any listener (UI, logger). An explicit channel instead of
/// ambient global state; dropped receivers are ignored.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Update {
        phase: AgentPhase,
        message: String,
        progress: Option<u8>,
    },
    ActionPreview {
        id: String,
        action_type: ActionType,
        description: String,
        screenshot: Option<String>,
        coordinates: Option<Point>,
        requires_confirmation: bool,
    },
}

// ========================= Status & reports =========================

/// Externally observable orchestrator state, replaced wholesale at the start
/// of each `execute` call.
#[derive(Clone, Debug, Default, Serialize)]
pub struct AgentStatus {
    pub is_running: bool,
    pub current_task: Option<String>,
    pub current_step: usize,
    pub progress: u8,
    pub steps_completed: usize,
    pub total_steps: usize,
    pub started_at_ms: u128,
    pub errors: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Failed,
    Cancelled,
}

/// Summary of one `execute` run.
#[derive(Clone, Debug, Serialize)]
pub struct TaskReport {
    pub run_id: String,
    pub command: String,
    pub status: RunStatus,
    pub steps_completed: usize,
    pub errors: Vec<String>,
    pub error: Option<String>,
    #[serde(skip)]
    pub elapsed: Duration,
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub max_steps_per_task: usize,
    /// Fixed pause between iterations, letting UI state catch up and keeping
    /// the model/vision pipeline from being hammered.
    pub settle_delay: Duration,
    /// Expiry of the human confirmation gate; expiry means deny.
    pub confirmation_timeout: Duration,
    /// Per-action execution deadline, enforced by the executor collaborator.
    pub action_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps_per_task: 50,
            settle_delay: Duration::from_millis(500),
            confirmation_timeout: Duration::from_secs(30),
            action_timeout: Duration::from_secs(30),
        }
    }
}

const MEMORY_PROMPT_ENTRIES: usize = 10;

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

// ========================= Orchestrator =========================

/// The observe-plan-act state machine. One logical agent per instance;
/// `is_running` is the sole mutual-exclusion guard and a second `execute`
/// call is rejected, not queued. Cancellation is cooperative and observed at
/// the top of each iteration, never mid-action.
pub struct Agent<V, M, E, L>
where
    V: ScreenCapture,
    M: ModelClient + 'static,
    E: Executor,
    L: ActivityLogger,
{
    vision: V,
    model: Arc<M>,
    executor: E,
    logger: L,
    planner: TaskPlanner<M>,
    cfg: AgentConfig,
    safety: std::sync::Mutex<SafetyValidator>,
    retry: Mutex<RetryCoordinator>,
    memory: std::sync::Mutex<AgentMemory>,
    status: std::sync::Mutex<AgentStatus>,
    running: AtomicBool,
    abort: AtomicBool,
    pending_confirmation: Mutex<Option<oneshot::Sender<bool>>>,
    event_tx: Option<mpsc::UnboundedSender<AgentEvent>>,
}

impl<V, M, E, L> Agent<V, M, E, L>
where
    V: ScreenCapture,
    M: ModelClient + 'static,
    E: Executor,
    L: ActivityLogger,
{
    pub fn new(vision: V, model: Arc<M>, executor: E, logger: L) -> Self {
        Self {
            vision,
            planner: TaskPlanner::new(Arc::clone(&model)),
            model,
            executor,
            logger,
            cfg: AgentConfig::default(),
            safety: std::sync::Mutex::new(SafetyValidator::default()),
            retry: Mutex::new(RetryCoordinator::default()),
            memory: std::sync::Mutex::new(AgentMemory::new()),
            status: std::sync::Mutex::new(AgentStatus::default()),
            running: AtomicBool::new(false),
            abort: AtomicBool::new(false),
            pending_confirmation: Mutex::new(None),
            event_tx: None,
        }
    }

    pub fn with_config(mut self, cfg: AgentConfig) -> Self {
        self.cfg = cfg;
        self
    }

    pub fn with_safety_config(self, cfg: SafetyConfig) -> Self {
        self.update_safety_config(cfg);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = Mutex::new(RetryCoordinator::new(policy));
        self
    }

    pub fn with_event_sink(mut self, tx: mpsc::UnboundedSender<AgentEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    // ---- observable state ----

    pub fn status(&self) -> AgentStatus {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn retry_stats(&self) -> RetryStats {
        self.retry.lock().await.stats()
    }

    pub fn export_memory(&self) -> Value {
        self.memory.lock().unwrap_or_else(|e| e.into_inner()).export()
    }

    /// Replace the safety policy at runtime. Persisting it is the caller's
    /// concern.
    pub fn update_safety_config(&self, cfg: SafetyConfig) {
        self.safety
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .update_config(cfg);
    }

    // ---- control signals ----

    /// Request cooperative cancellation. Observed at the next loop head; an
    /// in-flight model or execution call is never interrupted. A no-op while
    /// no run is active, so the audit trail only records real cancellations.
    pub async fn stop(&self) {
        if !self.is_running() {
            return;
        }
        self.abort.store(true, Ordering::SeqCst);
        info!("stop requested");
        let _ = self
            .logger
            .log(ActivityEntry {
                action: "task.stop".to_string(),
                details: json!({"reason": "user requested cancellation"}),
                status: ActivityStatus::Cancelled,
                screenshot: None,
            })
            .await;
    }

    /// Resolve a pending confirmation gate. A no-op when nothing is waiting.
    pub async fn confirm_action(&self, granted: bool) {
        if let Some(tx) = self.pending_confirmation.lock().await.take() {
            let _ = tx.send(granted);
        }
    }

    // ---- main loop ----

    /// Run one command to completion. Fails immediately with
    /// [`AgentError::AlreadyRunning`] if a task is in flight; every other
    /// terminal condition is reported through the returned [`TaskReport`].
    pub async fn execute(&self, command: &str) -> Result<TaskReport, AgentError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AgentError::AlreadyRunning);
        }
        self.abort.store(false, Ordering::SeqCst);
        {
            let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
            *status = AgentStatus {
                is_running: true,
                current_task: Some(command.to_string()),
                started_at_ms: now_ms(),
                ..AgentStatus::default()
            };
        }

        let report = self.run_task(command).await;

        {
            let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
            status.is_running = false;
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(report)
    }

    async fn run_task(&self, command: &str) -> TaskReport {
        let run_id = nanoid!();
        let start = Instant::now();
        info!(run = %run_id, command, "task started");

        self.with_memory(|m| m.add_entry(Role::User, command, None));
        self.emit_update(AgentPhase::Planning, format!("Planning: {command}"), None);

        // The upfront plan sizes the progress estimate; the loop itself
        // replans every iteration from the live screen.
        let plan_context = self.plan_context();
        match self.planner.create_plan(command, &plan_context).await {
            Ok(plan) if plan.steps.is_empty() => {
                let error = AgentError::EmptyPlan(command.to_string()).to_string();
                return self
                    .finish(run_id, command, start, RunStatus::Failed, Some(error))
                    .await;
            }
            Ok(plan) => {
                let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
                status.total_steps = plan.steps.len();
            }
            Err(e) => {
                return self
                    .finish(run_id, command, start, RunStatus::Failed, Some(e.to_string()))
                    .await;
            }
        }

        for step in 0..self.cfg.max_steps_per_task {
            // Cooperative abort checkpoint; the only place cancellation is
            // observed.
            if self.abort.load(Ordering::SeqCst) {
                let error = AgentError::Aborted.to_string();
                return self
                    .finish(run_id, command, start, RunStatus::Cancelled, Some(error))
                    .await;
            }
            {
                let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
                status.current_step = step;
            }

            // Observe.
            self.emit_update(AgentPhase::Thinking, format!("Analyzing screen (step {step})"), None);
            let image = match self.vision.capture_screen().await {
                Ok(image) => image,
                Err(e) => {
                    return self
                        .finish(run_id, command, start, RunStatus::Failed, Some(e.to_string()))
                        .await;
                }
            };
            let analysis_raw = match self.model.analyze(&image, &Self::analysis_prompt(command)).await {
                Ok(raw) => raw,
                Err(e) => {
                    return self
                        .finish(run_id, command, start, RunStatus::Failed, Some(e.to_string()))
                        .await;
                }
            };
            let analysis = action::parse_analysis(&analysis_raw);
            self.with_memory(|m| {
                m.add_snapshot(
                    analysis.current_state.clone(),
                    analysis.visible_elements.first().cloned().unwrap_or_default(),
                )
            });

            if analysis.is_task_complete {
                return self.finish(run_id, command, start, RunStatus::Completed, None).await;
            }

            // Decide.
            let prompt = self.next_action_prompt(command, &analysis);
            let action_raw = match self.model.complete(&prompt).await {
                Ok(raw) => raw,
                Err(e) => {
                    return self
                        .finish(run_id, command, start, RunStatus::Failed, Some(e.to_string()))
                        .await;
                }
            };
            let parsed = match action::parse_action(&action_raw) {
                Some(parsed) => parsed,
                None => {
                    // Guessing at input is worse than failing.
                    let error = AgentError::NoAction.to_string();
                    return self
                        .finish(run_id, command, start, RunStatus::Failed, Some(error))
                        .await;
                }
            };

            // Gate.
            let validation = {
                let mut safety = self.safety.lock().unwrap_or_else(|e| e.into_inner());
                safety.validate_action(&parsed)
            };
            self.emit(AgentEvent::ActionPreview {
                id: nanoid!(),
                action_type: parsed.action_type,
                description: parsed.description.clone(),
                screenshot: Some(image.0.clone()),
                coordinates: parsed.coordinates,
                requires_confirmation: validation.requires_confirmation,
            });

            if !validation.allowed {
                let reason = validation.reason.unwrap_or_else(|| "blocked".to_string());
                warn!(step, %reason, "action blocked by safety policy");
                self.record_step_error(AgentError::Blocked(reason.clone()).to_string());
                self.log_activity(
                    &parsed.description,
                    json!({"step": step, "reason": reason}),
                    ActivityStatus::Failed,
                )
                .await;
                tokio::time::sleep(self.cfg.settle_delay).await;
                continue;
            }

            if validation.requires_confirmation {
                self.emit_update(
                    AgentPhase::Waiting,
                    format!("Waiting for confirmation: {}", parsed.description),
                    None,
                );
                if !self.wait_for_confirmation().await {
                    let error = AgentError::ConfirmationDenied.to_string();
                    return self
                        .finish(run_id, command, start, RunStatus::Cancelled, Some(error))
                        .await;
                }
            }

            // Act, with retry and a per-action-type circuit breaker.
            self.emit_update(AgentPhase::Executing, parsed.description.clone(), Some(self.progress()));
            let outcome = {
                let executor = &self.executor;
                let action_ref = &parsed;
                let mut retry = self.retry.lock().await;
                retry
                    .execute_with_circuit_breaker("execute_action", parsed.action_type.as_str(), || async move {
                        match executor.execute(action_ref).await {
                            Ok(outcome) if outcome.success => Ok(outcome),
                            Ok(outcome) => {
                                Err(outcome.error.unwrap_or_else(|| "execution failed".to_string()))
                            }
                            Err(e) => Err(e.to_string()),
                        }
                    })
                    .await
            };

            if outcome.success {
                {
                    let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
                    status.steps_completed += 1;
                    let total = status.total_steps.max(1);
                    status.progress = (status.steps_completed * 100 / total).min(99) as u8;
                }
                self.with_memory(|m| {
                    m.add_entry(
                        Role::Assistant,
                        format!("Executed: {}", parsed.description),
                        Some(json!({"attempts": outcome.attempts})),
                    )
                });
                self.log_activity(
                    &parsed.description,
                    json!({"step": step, "attempts": outcome.attempts}),
                    ActivityStatus::Success,
                )
                .await;
                info!(step, action = parsed.action_type.as_str(), attempts = outcome.attempts, "step executed");
            } else {
                // Exhausted retries are a step failure, not a task failure;
                // the next observation decides what to do about it.
                let message = outcome.error.unwrap_or_else(|| "execution failed".to_string());
                warn!(step, %message, "step failed after retries");
                self.record_step_error(message.clone());
                self.with_memory(|m| {
                    m.add_entry(Role::Assistant, format!("Failed: {} ({message})", parsed.description), None)
                });
                self.log_activity(
                    &parsed.description,
                    json!({"step": step, "error": message, "attempts": outcome.attempts}),
                    ActivityStatus::Failed,
                )
                .await;
            }

            tokio::time::sleep(self.cfg.settle_delay).await;
        }

        let error = AgentError::BudgetExceeded(self.cfg.max_steps_per_task).to_string();
        self.finish(run_id, command, start, RunStatus::Failed, Some(error)).await
    }

    async fn finish(
        &self,
        run_id: String,
        command: &str,
        start: Instant,
        status: RunStatus,
        error: Option<String>,
    ) -> TaskReport {
        let (steps_completed, errors) = {
            let s = self.status.lock().unwrap_or_else(|e| e.into_inner());
            (s.steps_completed, s.errors.clone())
        };
        let (activity_status, phase, message) = match status {
            RunStatus::Completed => (
                ActivityStatus::Success,
                AgentPhase::Completed,
                format!("Task completed: {command}"),
            ),
            RunStatus::Cancelled => (
                ActivityStatus::Cancelled,
                AgentPhase::Error,
                error.clone().unwrap_or_else(|| "cancelled".to_string()),
            ),
            RunStatus::Failed => (
                ActivityStatus::Failed,
                AgentPhase::Error,
                error.clone().unwrap_or_else(|| "failed".to_string()),
            ),
        };

        // Every terminal path writes an audit entry before surfacing.
        self.log_activity(
            command,
            json!({
                "run_id": run_id,
                "status": status,
                "steps_completed": steps_completed,
                "error": error,
            }),
            activity_status,
        )
        .await;

        if status == RunStatus::Completed {
            let mut s = self.status.lock().unwrap_or_else(|e| e.into_inner());
            s.progress = 100;
        }
        self.emit_update(phase, message.clone(), Some(self.progress()));
        self.with_memory(|m| m.add_entry(Role::Assistant, message, None));
        info!(run = %run_id, ?status, steps_completed, "task finished");

        TaskReport {
            run_id,
            command: command.to_string(),
            status,
            steps_completed,
            errors,
            error,
            elapsed: start.elapsed(),
        }
    }

    // ---- helpers ----

    /// Single pending-request confirmation slot; timeout means deny.
    async fn wait_for_confirmation(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        *self.pending_confirmation.lock().await = Some(tx);
        let granted = matches!(
            tokio::time::timeout(self.cfg.confirmation_timeout, rx).await,
            Ok(Ok(true))
        );
        *self.pending_confirmation.lock().await = None;
        granted
    }

    fn analysis_prompt(command: &str) -> String {
        format!(
            "You are operating a computer to accomplish: {command}\n\
             Describe the current screen. Respond with JSON: \
             {{\"isTaskComplete\": bool, \"currentState\": \"...\", \
             \"visibleElements\": [\"...\"], \"suggestions\": [\"...\"]}}"
        )
    }

    fn next_action_prompt(&self, command: &str, analysis: &action::ScreenAnalysis) -> String {
        let mut prompt = format!(
            "Task: {command}\nScreen state: {}\n",
            analysis.current_state
        );
        if !analysis.visible_elements.is_empty() {
            prompt.push_str(&format!("Visible: {}\n", analysis.visible_elements.join(", ")));
        }
        if !analysis.suggestions.is_empty() {
            prompt.push_str(&format!("Suggestions: {}\n", analysis.suggestions.join("; ")));
        }
        {
            let mut memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
            let recent = memory.recent(MEMORY_PROMPT_ENTRIES);
            if !recent.is_empty() {
                prompt.push_str("History:\n");
                for entry in recent {
                    prompt.push_str(&format!("- {}\n", entry.content));
                }
            }
        }
        prompt.push_str(
            "\nRespond with JSON for the single next action: \
             {\"type\": \"click|double-click|right-click|type|press|hotkey|scroll|wait|navigate|drag|hover\", \
             \"description\": \"...\", \"coordinates\": {\"x\": 0, \"y\": 0}, \"params\": {}}",
        );
        prompt
    }

    fn plan_context(&self) -> PlanContext {
        let mut memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
        let errors = self
            .status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .errors
            .clone();
        let screen_description = memory
            .snapshots()
            .last()
            .map(|s| s.screen_state.clone())
            .unwrap_or_default();
        let recent_actions = memory.recent(5).iter().map(|e| e.content.clone()).collect();
        PlanContext {
            screen_description,
            recent_actions,
            recent_errors: errors,
        }
    }

    fn progress(&self) -> u8 {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).progress
    }

    fn record_step_error(&self, message: String) {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        status.errors.push(message);
    }

    fn with_memory<R>(&self, f: impl FnOnce(&mut AgentMemory) -> R) -> R {
        let mut memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut memory)
    }

    async fn log_activity(&self, action: &str, details: Value, status: ActivityStatus) {
        // A broken audit sink must not take the agent down with it.
        if let Err(e) = self
            .logger
            .log(ActivityEntry {
                action: action.to_string(),
                details,
                status,
                screenshot: None,
            })
            .await
        {
            warn!(%e, "activity logger failed");
        }
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    fn emit_update(&self, phase: AgentPhase, message: String, progress: Option<u8>) {
        self.emit(AgentEvent::Update {
            phase,
            message,
            progress,
        });
    }
}

// ========================= Null collaborators =========================

/// Discards every entry. Useful for composition and tests, mirroring the
/// other null collaborators.
pub struct NullActivityLogger;

#[async_trait]
impl ActivityLogger for NullActivityLogger {
    async fn log(&self, _entry: ActivityEntry) -> Result<String, AgentError> {
        Ok(nanoid!())
    }
}

/// Succeeds instantly without touching any device.
pub struct NoopExecutor;

#[async_trait]
impl Executor for NoopExecutor {
    async fn execute(&self, _action: &ParsedAction) -> Result<ExecutionOutcome, AgentError> {
        Ok(ExecutionOutcome {
            success: true,
            error: None,
            duration: Duration::ZERO,
        })
    }
}

/// Always returns the same blank screen.
pub struct NoopScreenCapture;

#[async_trait]
impl ScreenCapture for NoopScreenCapture {
    async fn capture_screen(&self) -> Result<ScreenImage, AgentError> {
        Ok(ScreenImage("blank".to_string()))
    }
}
