pub mod action;
pub mod agent;
pub mod memory;
pub mod planner;
pub mod retry;
pub mod safety;

pub use action::{parse_action, parse_actions, parse_analysis, ActionType, ParsedAction, Point, ScreenAnalysis};
pub use agent::{
    ActivityEntry, ActivityLogger, ActivityStatus, Agent, AgentConfig, AgentError, AgentEvent,
    AgentPhase, AgentStatus, ExecutionOutcome, Executor, ModelClient, NoopExecutor,
    NoopScreenCapture, NullActivityLogger, RunStatus, ScreenCapture, ScreenImage, TaskReport,
};
pub use memory::{AgentMemory, ConversationEntry, MemorySnapshot, Role};
pub use planner::{PlanContext, PlanFeedback, Priority, Task, TaskPlanner, TaskStatus, TaskStep};
pub use retry::{RetryCoordinator, RetryPolicy, RetryResult, RetryStats};
pub use safety::{RiskLevel, SafetyConfig, SafetyValidation, SafetyValidator};
