use std::sync::Arc;

use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::action::structured_value;
use crate::agent::{AgentError, ModelClient};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskStep {
    pub id: String,
    pub description: String,
    #[serde(rename = "type")]
    pub step_type: String,
    pub params: Value,
    pub expected_outcome: String,
    pub fallback_actions: Vec<TaskStep>,
}

/// An ordered plan for one natural-language command.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub steps: Vec<TaskStep>,
    pub priority: Priority,
    pub estimated_duration_secs: u64,
    pub dependencies: Vec<String>,
    pub status: TaskStatus,
}

/// Working context embedded in the planning prompt. Bounded to the last five
/// actions and three errors so the prompt cannot grow without limit.
#[derive(Clone, Debug, Default)]
pub struct PlanContext {
    pub screen_description: String,
    pub recent_actions: Vec<String>,
    pub recent_errors: Vec<String>,
}

/// Feedback about a failed step, driving plan refinement.
#[derive(Clone, Debug)]
pub struct PlanFeedback {
    pub step_index: usize,
    pub error: Option<String>,
    pub observation: Option<String>,
}

const PROMPT_ACTIONS: usize = 5;
const PROMPT_ERRORS: usize = 3;

/// Builds planning prompts and turns model responses into ordered step
/// plans. The heavy lifting is the shared structured extraction in
/// [`crate::action`].
pub struct TaskPlanner<M: ModelClient> {
    model: Arc<M>,
}

impl<M: ModelClient> TaskPlanner<M> {
    pub fn new(model: Arc<M>) -> Self {
        Self { model }
    }

    /// Ask the model for an ordered plan. On a parse failure the task has
    /// zero steps; the caller must treat an empty plan as a planning
    /// failure, never as "nothing to do".
    pub async fn create_plan(&self, command: &str, context: &PlanContext) -> Result<Task, AgentError> {
        let prompt = Self::plan_prompt(command, context);
        let response = self.model.complete(&prompt).await?;
        let steps = parse_steps(&response);
        if steps.is_empty() {
            warn!(command, "model returned no parseable plan steps");
        } else {
            info!(command, steps = steps.len(), "plan created");
        }
        let mut task = Task {
            id: nanoid!(),
            description: command.to_string(),
            steps,
            priority: Priority::Medium,
            estimated_duration_secs: 0,
            dependencies: Vec::new(),
            status: TaskStatus::Pending,
        };
        task.estimated_duration_secs = Self::estimate_time(&task);
        Ok(task)
    }

    /// Replace everything from `feedback.step_index` onward with fresh steps
    /// from the model, preserving the already-executed prefix untouched. The
    /// past is not re-litigated.
    pub async fn refine_plan(&self, task: &Task, feedback: &PlanFeedback) -> Result<Task, AgentError> {
        let split = feedback.step_index.min(task.steps.len());
        let prompt = Self::refine_prompt(task, feedback, split);
        let response = self.model.complete(&prompt).await?;
        let replacement = parse_steps(&response);
        if replacement.is_empty() {
            warn!(task = %task.id, step = feedback.step_index, "refinement produced no steps");
        }

        let mut steps: Vec<TaskStep> = task.steps[..split].to_vec();
        steps.extend(replacement);
        let mut refined = Task {
            steps,
            ..task.clone()
        };
        refined.estimated_duration_secs = Self::estimate_time(&refined);
        Ok(refined)
    }

    /// Split a compound command on conjunctions. A heuristic pre-pass, not a
    /// substitute for model planning.
    pub fn decompose(command: &str) -> Vec<String> {
        let mut parts = vec![command.to_string()];
        for sep in [" and then ", ", then ", " then ", " and ", ", "] {
            parts = parts
                .into_iter()
                .flat_map(|p| p.split(sep).map(str::to_string).collect::<Vec<_>>())
                .collect();
        }
        parts
            .into_iter()
            .map(|p| p.trim().trim_end_matches('.').to_string())
            .filter(|p| !p.is_empty())
            .collect()
    }

    /// Sum of the fixed per-type cost table, in seconds. A heuristic, not a
    /// measurement.
    pub fn estimate_time(task: &Task) -> u64 {
        task.steps.iter().map(|s| step_cost(&s.step_type)).sum()
    }

    fn plan_prompt(command: &str, context: &PlanContext) -> String {
        let mut prompt = format!(
            "You are planning steps for a desktop automation agent.\n\
             Command: {command}\n\nCurrent screen: {}\n",
            context.screen_description
        );
        let actions = tail(&context.recent_actions, PROMPT_ACTIONS);
        if !actions.is_empty() {
            prompt.push_str("\nRecent actions:\n");
            for a in actions {
                prompt.push_str("- ");
                prompt.push_str(a);
                prompt.push('\n');
            }
        }
        let errors = tail(&context.recent_errors, PROMPT_ERRORS);
        if !errors.is_empty() {
            prompt.push_str("\nRecent errors:\n");
            for e in errors {
                prompt.push_str("- ");
                prompt.push_str(e);
                prompt.push('\n');
            }
        }
        prompt.push_str(
            "\nRespond with JSON: {\"steps\": [{\"description\": \"...\", \
             \"type\": \"click|type|press|hotkey|scroll|wait|navigate|drag|hover|verify|extract\", \
             \"params\": {}, \"expectedOutcome\": \"...\"}]}",
        );
        prompt
    }

    fn refine_prompt(task: &Task, feedback: &PlanFeedback, split: usize) -> String {
        let mut prompt = format!(
            "The plan for \"{}\" failed at step {}.\n",
            task.description, feedback.step_index
        );
        if let Some(step) = task.steps.get(feedback.step_index) {
            prompt.push_str(&format!("Failed step: {}\n", step.description));
        }
        if let Some(error) = &feedback.error {
            prompt.push_str(&format!("Error: {error}\n"));
        }
        if let Some(observation) = &feedback.observation {
            prompt.push_str(&format!("Observation: {observation}\n"));
        }
        if split > 0 {
            prompt.push_str("\nAlready executed (do not repeat):\n");
            for step in &task.steps[..split] {
                prompt.push_str("- ");
                prompt.push_str(&step.description);
                prompt.push('\n');
            }
        }
        prompt.push_str(
            "\nRespond with JSON {\"steps\": [...]} containing replacement steps \
             for everything from the failed step onward.",
        );
        prompt
    }
}

fn tail<T>(items: &[T], n: usize) -> &[T] {
    &items[items.len().saturating_sub(n)..]
}

fn step_cost(step_type: &str) -> u64 {
    match step_type {
        "navigate" => 3,
        "click" => 1,
        "type" => 2,
        "scroll" => 1,
        "wait" => 2,
        "verify" => 2,
        "extract" => 1,
        _ => 2,
    }
}

/// Decode `{"steps": [...]}` (or a bare array) into ordered steps.
/// Unparseable input yields an empty list.
fn parse_steps(raw: &str) -> Vec<TaskStep> {
    let Some(v) = structured_value(raw) else {
        return Vec::new();
    };
    let items = match &v {
        Value::Array(items) => items.clone(),
        Value::Object(obj) => obj
            .get("steps")
            .and_then(|s| s.as_array())
            .cloned()
            .unwrap_or_default(),
        _ => Vec::new(),
    };
    items.iter().filter_map(decode_step).collect()
}

fn decode_step(v: &Value) -> Option<TaskStep> {
    let obj = v.as_object()?;
    let description = obj.get("description")?.as_str()?.to_string();
    let step_type = obj
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or("click")
        .to_lowercase();
    let fallback_actions = obj
        .get("fallbackActions")
        .or_else(|| obj.get("fallback_actions"))
        .and_then(|f| f.as_array())
        .map(|items| items.iter().filter_map(decode_step).collect())
        .unwrap_or_default();
    Some(TaskStep {
        id: nanoid!(),
        description,
        step_type,
        params: obj.get("params").cloned().unwrap_or(Value::Null),
        expected_outcome: obj
            .get("expectedOutcome")
            .or_else(|| obj.get("expected_outcome"))
            .and_then(|e| e.as_str())
            .unwrap_or_default()
            .to_string(),
        fallback_actions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentError, ModelClient, ScreenImage};
    use async_trait::async_trait;
    use serde_json::json;

    /// Model stub that always answers with a canned completion.
    struct CannedModel(String);

    #[async_trait]
    impl ModelClient for CannedModel {
        async fn analyze(&self, _image: &ScreenImage, _prompt: &str) -> Result<String, AgentError> {
            Ok(self.0.clone())
        }
        async fn complete(&self, _prompt: &str) -> Result<String, AgentError> {
            Ok(self.0.clone())
        }
    }

    fn step(description: &str, step_type: &str) -> TaskStep {
        TaskStep {
            id: nanoid!(),
            description: description.to_string(),
            step_type: step_type.to_string(),
            params: Value::Null,
            expected_outcome: String::new(),
            fallback_actions: Vec::new(),
        }
    }

    #[tokio::test]
    async fn create_plan_parses_steps() {
        let plan_json = json!({
            "steps": [
                {"description": "Open Chrome", "type": "navigate", "params": {"app": "Chrome"}, "expectedOutcome": "browser visible"},
                {"description": "Click the search box", "type": "click"},
                {"description": "Type the query", "type": "type", "params": {"text": "weather"}}
            ]
        })
        .to_string();
        let planner = TaskPlanner::new(Arc::new(CannedModel(plan_json)));
        let task = planner
            .create_plan("Open Chrome and search for weather", &PlanContext::default())
            .await
            .unwrap();
        assert_eq!(task.steps.len(), 3);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.steps[0].step_type, "navigate");
        // navigate 3 + click 1 + type 2
        assert_eq!(task.estimated_duration_secs, 6);
    }

    #[tokio::test]
    async fn unparseable_plan_has_zero_steps() {
        let planner = TaskPlanner::new(Arc::new(CannedModel("no json here".to_string())));
        let task = planner
            .create_plan("do something", &PlanContext::default())
            .await
            .unwrap();
        assert!(task.steps.is_empty());
    }

    #[tokio::test]
    async fn refine_preserves_executed_prefix() {
        let replacement = json!({
            "steps": [{"description": "Click the retry button", "type": "click"}]
        })
        .to_string();
        let planner = TaskPlanner::new(Arc::new(CannedModel(replacement)));

        let task = Task {
            id: nanoid!(),
            description: "search".to_string(),
            steps: vec![step("open browser", "navigate"), step("old click", "click"), step("old type", "type")],
            priority: Priority::Medium,
            estimated_duration_secs: 6,
            dependencies: Vec::new(),
            status: TaskStatus::InProgress,
        };
        let prefix_id = task.steps[0].id.clone();

        let refined = planner
            .refine_plan(
                &task,
                &PlanFeedback {
                    step_index: 1,
                    error: Some("element not found".to_string()),
                    observation: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(refined.steps.len(), 2);
        assert_eq!(refined.steps[0].id, prefix_id);
        assert_eq!(refined.steps[1].description, "Click the retry button");
        assert_eq!(refined.estimated_duration_secs, 4);
    }

    #[test]
    fn decompose_splits_on_conjunctions() {
        let parts = TaskPlanner::<CannedModel>::decompose("Open Chrome and search for weather, then take a screenshot.");
        assert_eq!(
            parts,
            vec!["Open Chrome", "search for weather", "take a screenshot"]
        );
        assert_eq!(TaskPlanner::<CannedModel>::decompose("just one thing"), vec!["just one thing"]);
    }

    #[test]
    fn estimate_uses_cost_table() {
        let task = Task {
            id: nanoid!(),
            description: String::new(),
            steps: vec![
                step("a", "navigate"),
                step("b", "wait"),
                step("c", "extract"),
                step("d", "something-new"),
            ],
            priority: Priority::Low,
            estimated_duration_secs: 0,
            dependencies: Vec::new(),
            status: TaskStatus::Pending,
        };
        assert_eq!(TaskPlanner::<CannedModel>::estimate_time(&task), 8);
    }
}
