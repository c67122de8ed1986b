use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::debug;

use flowdeck_core::error::{FlowError, Result};
use flowdeck_core::traits::{LlmProvider, ToolExecutor};
use flowdeck_core::types::{ChatMessage, GenerateRequest, ToolRequest};

use crate::graph::node::{ActionStep, DecisionStep, DelayStep, LlmStep, StepNode, ToolStep};
use crate::graph::{resolve, resolve_deep, CompiledNode, ExecutionContext};

/// Runs a single Agent-graph node against the current context.
///
/// The executor only computes outputs; recording them is the agent engine's
/// job. Every failure comes back as an `Err`.
pub struct StepExecutor {
    llm: Arc<dyn LlmProvider>,
    tools: Arc<dyn ToolExecutor>,
    default_delay_ms: u64,
}

impl StepExecutor {
    pub fn new(llm: Arc<dyn LlmProvider>, tools: Arc<dyn ToolExecutor>) -> Self {
        Self {
            llm,
            tools,
            default_delay_ms: 1000,
        }
    }

    /// Sleep used by `delay` nodes that don't set `durationMs`.
    pub fn with_default_delay(mut self, delay_ms: u64) -> Self {
        self.default_delay_ms = delay_ms;
        self
    }

    pub async fn execute(
        &self,
        node: &CompiledNode<StepNode>,
        context: &ExecutionContext,
    ) -> Result<Value> {
        debug!(node_id = %node.id, node_type = %node.node_type, "Executing step");

        match &node.kind {
            StepNode::Trigger => Ok(json!({
                "triggered": true,
                "input": context.input(),
            })),
            StepNode::Llm(step) => self.run_llm(step, context).await,
            StepNode::Tool(step) => self.run_tool(step, context).await,
            StepNode::Decision(step) => Ok(decide(step, context)),
            StepNode::Action(step) => Ok(act(node, step)),
            StepNode::Transform => Ok(context.snapshot()),
            StepNode::Delay(step) => self.delay(step).await,
        }
    }

    async fn run_llm(&self, step: &LlmStep, context: &ExecutionContext) -> Result<Value> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = step.system_prompt.as_deref().filter(|s| !s.is_empty()) {
            messages.push(ChatMessage::system(resolve(system, context.as_value())));
        }

        let user = match step.prompt.as_deref() {
            Some(prompt) => resolve(prompt, context.as_value()),
            None => match context.input() {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
        };
        messages.push(ChatMessage::user(user));

        let request = GenerateRequest {
            messages,
            temperature: step.temperature,
            max_tokens: step.max_tokens,
        };
        let response = self.llm.generate(&step.provider_id, request).await?;

        Ok(json!({
            "result": response.text,
            "usage": response.usage,
        }))
    }

    async fn run_tool(&self, step: &ToolStep, context: &ExecutionContext) -> Result<Value> {
        let input = match &step.input {
            Some(template) => resolve_deep(template, context.as_value()),
            None => json!({}),
        };
        let request = ToolRequest {
            input,
            context: context.snapshot(),
        };

        let outcome = self.tools.execute_tool(&step.tool_id, request).await?;
        if !outcome.success {
            return Err(FlowError::ToolExecution {
                tool: step.tool_id.clone(),
                message: outcome
                    .error
                    .unwrap_or_else(|| "tool reported failure".to_string()),
            });
        }

        Ok(json!({
            "success": true,
            "result": outcome.output,
        }))
    }

    async fn delay(&self, step: &DelayStep) -> Result<Value> {
        let duration_ms = step.duration_ms.unwrap_or(self.default_delay_ms);
        tokio::time::sleep(Duration::from_millis(duration_ms)).await;
        Ok(json!({
            "delayed": true,
            "durationMs": duration_ms,
        }))
    }
}

/// Placeholder evaluator: true only for a literal `"true"` condition or an
/// input carrying `proceed: true`. Traversal does not branch on it.
fn decide(step: &DecisionStep, context: &ExecutionContext) -> Value {
    let decision = step.condition.trim() == "true"
        || context.input().get("proceed") == Some(&Value::Bool(true));
    json!({
        "decision": decision,
        "condition": step.condition,
    })
}

fn act(node: &CompiledNode<StepNode>, step: &ActionStep) -> Value {
    let name = step
        .action
        .clone()
        .filter(|a| !a.is_empty())
        .unwrap_or_else(|| node.label.clone());
    let message = step
        .message
        .clone()
        .unwrap_or_else(|| format!("Action '{}' executed", name));
    json!({
        "executed": true,
        "action": name,
        "message": message,
    })
}
