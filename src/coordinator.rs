//! Config-gated review points for an agent pipeline.
//!
//! Each gate either skips (returning an approval that says so) or builds a
//! [`Checkpoint`] from the node and asks the broker. Outcomes are passed back
//! untouched; in particular a timeout is never turned into an approval here.
use std::sync::Arc;

use hitl_protocol::ReviewOutcome;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::broker::{Checkpoint, ReviewBroker};

pub const PLAN_GENERATION_CHECKPOINT: &str = "PostInitialPlanGeneration";
pub const ATOMIZER_CHECKPOINT: &str = "PostAtomizerCheck";
pub const PRE_EXECUTION_CHECKPOINT: &str = "PreExecutionCheck";

const GOAL_PREVIEW_CHARS: usize = 100;

/// Which review points are switched on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckpointFlags {
    pub after_plan_generation: bool,
    pub after_atomizer: bool,
    pub before_execute: bool,
}

/// The parts of a pipeline task a reviewer gets to see.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskNode {
    pub task_id: String,
    pub goal: String,
    pub layer: u32,
    pub task_type: String,
    pub agent_name: Option<String>,
}

/// What the atomizer decided for a task.
#[derive(Debug, Clone, PartialEq)]
pub struct AtomizerReview {
    pub original_goal: String,
    pub updated_goal: String,
    pub is_atomic: bool,
    pub proposed_next_action: String,
    pub context_summary: String,
}

#[derive(Debug, Clone)]
pub struct CheckpointCoordinator {
    broker: Arc<ReviewBroker>,
    flags: CheckpointFlags,
}

impl CheckpointCoordinator {
    pub fn new(broker: Arc<ReviewBroker>, flags: CheckpointFlags) -> Self {
        info!(
            after_plan_generation = flags.after_plan_generation,
            after_atomizer = flags.after_atomizer,
            before_execute = flags.before_execute,
            "checkpoint coordinator ready"
        );
        Self { broker, flags }
    }

    pub fn flags(&self) -> CheckpointFlags {
        self.flags
    }

    /// Review the first plan of a root task. Only layer-0 nodes are gated.
    pub async fn review_plan_generation(
        &self,
        node: &TaskNode,
        plan: Value,
        context_summary: Option<String>,
        attempt: u32,
    ) -> ReviewOutcome {
        if !(self.flags.after_plan_generation && node.layer == 0) {
            return skipped("HITL for plan generation skipped by configuration or node layer.");
        }

        let context = format!(
            "Review initial plan for root task '{}'. Current Goal: {}",
            node.task_id, node.goal
        );
        let data = json!({
            "task_goal": node.goal,
            "proposed_plan": plan,
            "planner_input_summary": {
                "context_summary": context_summary,
            }
        });
        self.ask(node, PLAN_GENERATION_CHECKPOINT, context, data, attempt).await
    }

    pub async fn review_atomizer_output(
        &self,
        node: &TaskNode,
        review: AtomizerReview,
        attempt: u32,
    ) -> ReviewOutcome {
        if !self.flags.after_atomizer {
            return skipped("HITL for atomizer output skipped by configuration.");
        }

        let context = format!(
            "Review Atomizer output for task '{}'. Original goal: '{}...'. Proposed: '{}...'. Action: {}.",
            node.task_id,
            preview(&review.original_goal),
            preview(&review.updated_goal),
            review.proposed_next_action
        );
        let data = json!({
            "original_goal": review.original_goal,
            "updated_goal": review.updated_goal,
            "atomizer_decision_is_atomic": review.is_atomic,
            "proposed_next_action": review.proposed_next_action,
            "current_context_summary": review.context_summary,
        });
        self.ask(node, ATOMIZER_CHECKPOINT, context, data, attempt).await
    }

    pub async fn review_before_execution(
        &self,
        node: &TaskNode,
        context_summary: Option<String>,
        attempt: u32,
    ) -> ReviewOutcome {
        if !self.flags.before_execute {
            return skipped("HITL before execution skipped by configuration.");
        }

        let context = format!(
            "Review task before execution: '{}'. Agent: {}",
            node.goal,
            node.agent_name.as_deref().unwrap_or("Default Executor")
        );
        let data = json!({
            "task_id": node.task_id,
            "goal": node.goal,
            "task_type": node.task_type,
            "agent_name": node.agent_name,
            "input_context_summary": context_summary,
        });
        self.ask(node, PRE_EXECUTION_CHECKPOINT, context, data, attempt).await
    }

    async fn ask(
        &self,
        node: &TaskNode,
        checkpoint: &str,
        context: String,
        data: Value,
        attempt: u32,
    ) -> ReviewOutcome {
        let outcome = self
            .broker
            .review(
                Checkpoint::new(checkpoint, context)
                    .with_data(data)
                    .with_node(node.task_id.clone())
                    .with_attempt(attempt),
            )
            .await;

        match &outcome {
            ReviewOutcome::Approved { .. } | ReviewOutcome::TransportUnavailable { .. } => {
                info!(node = %node.task_id, checkpoint, "checkpoint approved")
            }
            ReviewOutcome::RequestModification { .. } => {
                info!(node = %node.task_id, checkpoint, "user requested modification")
            }
            ReviewOutcome::Aborted { .. } => {
                warn!(node = %node.task_id, checkpoint, "processing aborted by user")
            }
            ReviewOutcome::Timeout { message } | ReviewOutcome::Error { message } => {
                warn!(node = %node.task_id, checkpoint, "checkpoint not approved: {}", message)
            }
        }
        outcome
    }
}

fn skipped(message: &str) -> ReviewOutcome {
    ReviewOutcome::Approved {
        message: message.to_string(),
    }
}

fn preview(goal: &str) -> String {
    goal.chars().take(GOAL_PREVIEW_CHARS).collect()
}
