use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use flowdeck_core::config::ParallelJoinPolicy;

use super::edge::Branch;

/// Why a node definition could not be turned into a typed node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeParseError {
    UnknownType,
    InvalidConfig(String),
}

/// A closed set of node kinds for one graph level.
pub trait NodeKind: Sized + Send + Sync + 'static {
    /// The `type` string of this level's single entry node.
    const ENTRY_TYPE: &'static str;

    /// Build the typed node from its `type` and opaque `config`.
    fn parse(node_type: &str, config: &Value) -> Result<Self, NodeParseError>;
}

fn parse_config<T: DeserializeOwned>(config: &Value) -> Result<T, NodeParseError> {
    let config = if config.is_null() {
        Value::Object(Default::default())
    } else {
        config.clone()
    };
    serde_json::from_value(config).map_err(|e| NodeParseError::InvalidConfig(e.to_string()))
}

// ── Agent graph nodes ───────────────────────────────────────────

/// Node kinds of an Agent graph, executed by the step executor.
#[derive(Debug, Clone)]
pub enum StepNode {
    Trigger,
    Llm(LlmStep),
    Tool(ToolStep),
    Decision(DecisionStep),
    Action(ActionStep),
    Transform,
    Delay(DelayStep),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmStep {
    pub provider_id: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Template for the user message. Without it the raw input is sent.
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolStep {
    pub tool_id: String,
    #[serde(default)]
    pub input: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DecisionStep {
    #[serde(default)]
    pub condition: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActionStep {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelayStep {
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

impl NodeKind for StepNode {
    const ENTRY_TYPE: &'static str = "trigger";

    fn parse(node_type: &str, config: &Value) -> Result<Self, NodeParseError> {
        match node_type {
            "trigger" => Ok(Self::Trigger),
            "agent" | "agent-LLM" | "llm" => {
                let step: LlmStep = parse_config(config)?;
                if step.provider_id.trim().is_empty() {
                    return Err(NodeParseError::InvalidConfig(
                        "providerId must not be empty".into(),
                    ));
                }
                Ok(Self::Llm(step))
            }
            "tool" => {
                let step: ToolStep = parse_config(config)?;
                if step.tool_id.trim().is_empty() {
                    return Err(NodeParseError::InvalidConfig(
                        "toolId must not be empty".into(),
                    ));
                }
                Ok(Self::Tool(step))
            }
            "decision" => Ok(Self::Decision(parse_config(config)?)),
            "action" => Ok(Self::Action(parse_config(config)?)),
            "transform" => Ok(Self::Transform),
            "delay" => Ok(Self::Delay(parse_config(config)?)),
            _ => Err(NodeParseError::UnknownType),
        }
    }
}

// ── Scenario graph nodes ────────────────────────────────────────

/// Node kinds of a Scenario graph, executed by the scenario engine.
#[derive(Debug, Clone)]
pub enum ScenarioNode {
    Trigger,
    Agent(AgentCall),
    Decision(Vec<Branch>),
    Parallel(ParallelStep),
    Transform(TransformStrategy),
    End(EndStep),
}

/// Which Agent version a scenario node runs.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentTarget {
    /// The agent's newest active version, looked up at run time.
    Active(String),
    /// A specific version, regardless of activation.
    Pinned(String),
}

#[derive(Debug, Clone)]
pub struct AgentCall {
    pub target: AgentTarget,
    /// Input template; the scenario input is used when absent.
    pub input: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAgentCall {
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    agent_version_id: Option<String>,
    #[serde(default)]
    input: Option<Value>,
}

impl TryFrom<RawAgentCall> for AgentCall {
    type Error = NodeParseError;

    fn try_from(raw: RawAgentCall) -> Result<Self, Self::Error> {
        let target = match (raw.agent_version_id, raw.agent_id) {
            (Some(version_id), _) if !version_id.is_empty() => AgentTarget::Pinned(version_id),
            (_, Some(agent_id)) if !agent_id.is_empty() => AgentTarget::Active(agent_id),
            _ => {
                return Err(NodeParseError::InvalidConfig(
                    "agentId or agentVersionId is required".into(),
                ))
            }
        };
        Ok(Self {
            target,
            input: raw.input,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ParallelStep {
    pub agents: Vec<AgentCall>,
    /// Node-level override of the engine's default join policy.
    pub join_policy: Option<ParallelJoinPolicy>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawParallel {
    #[serde(default)]
    agents: Vec<RawAgentCall>,
    #[serde(default)]
    join_policy: Option<ParallelJoinPolicy>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransformStrategy {
    /// Copy the listed dotted paths into a flat object keyed by path.
    Select(Vec<String>),
    /// Build `{ new_key: value_at_path }`.
    Map(Vec<(String, String)>),
    PassThrough,
}

#[derive(Debug, Deserialize)]
struct RawTransform {
    #[serde(default)]
    strategy: Option<String>,
    #[serde(default)]
    fields: Vec<String>,
    #[serde(default)]
    mapping: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndStep {
    #[serde(default)]
    pub output: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawDecision {
    #[serde(default)]
    branches: Vec<Branch>,
}

impl NodeKind for ScenarioNode {
    const ENTRY_TYPE: &'static str = "scenario-trigger";

    fn parse(node_type: &str, config: &Value) -> Result<Self, NodeParseError> {
        match node_type {
            "scenario-trigger" => Ok(Self::Trigger),
            "scenario-agent" => {
                let raw: RawAgentCall = parse_config(config)?;
                Ok(Self::Agent(raw.try_into()?))
            }
            "scenario-decision" => {
                let raw: RawDecision = parse_config(config)?;
                Ok(Self::Decision(raw.branches))
            }
            "scenario-parallel" => {
                let raw: RawParallel = parse_config(config)?;
                let agents = raw
                    .agents
                    .into_iter()
                    .map(AgentCall::try_from)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self::Parallel(ParallelStep {
                    agents,
                    join_policy: raw.join_policy,
                }))
            }
            "scenario-transform" => {
                let raw: RawTransform = parse_config(config)?;
                let strategy = match raw.strategy.as_deref() {
                    Some("select") => TransformStrategy::Select(raw.fields),
                    Some("map") => {
                        let mut pairs = Vec::with_capacity(raw.mapping.len());
                        for (key, path) in raw.mapping {
                            let path = path.as_str().ok_or_else(|| {
                                NodeParseError::InvalidConfig(format!(
                                    "mapping.{} must be a path string",
                                    key
                                ))
                            })?;
                            pairs.push((key, path.to_string()));
                        }
                        TransformStrategy::Map(pairs)
                    }
                    _ => TransformStrategy::PassThrough,
                };
                Ok(Self::Transform(strategy))
            }
            "scenario-end" => Ok(Self::End(parse_config(config)?)),
            _ => Err(NodeParseError::UnknownType),
        }
    }
}
