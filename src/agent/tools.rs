//! Tools offered to coordinating workers and their typed inputs.
//!
//! The gateway validates every call against the schemas below; only then is
//! the input decoded into a [`CoordinatorAction`]. Workers never inspect raw
//! JSON.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::identifiers::WorkerKind;
use crate::error::AgentError;
use crate::llm::{Sanitizer, ToolDefinition, ToolUse};

/// `webSearch` tool name.
pub const WEB_SEARCH: &str = "webSearch";
/// `inferClaimsFromResources` tool name.
pub const INFER_CLAIMS_FROM_RESOURCES: &str = "inferClaimsFromResources";
/// `startResearchTasks` tool name.
pub const START_RESEARCH_TASKS: &str = "startResearchTasks";
/// `updatePlan` tool name.
pub const UPDATE_PLAN: &str = "updatePlan";
/// `requestHumanInput` tool name.
pub const REQUEST_HUMAN_INPUT: &str = "requestHumanInput";
/// `exploreLinks` tool name.
pub const EXPLORE_LINKS: &str = "exploreLinks";
/// `complete` tool name.
pub const COMPLETE: &str = "complete";
/// `terminate` tool name.
pub const TERMINATE: &str = "terminate";

/// A resource a link-follower should read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequest {
    /// Page to start from.
    pub url: String,
    /// What to look for there.
    pub goal: String,
}

/// A sub-goal for a sub-coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchTask {
    /// What the sub-coordinator should find out.
    pub goal: String,
    /// Why it helps the parent goal.
    pub explanation: String,
}

/// A link a link-follower wants to read next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkRequest {
    /// Link URL.
    pub url: String,
    /// Why it looks useful.
    pub explanation: String,
}

/// A validated tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorAction {
    /// Search the web.
    WebSearch {
        /// Query text.
        query: String,
        /// Why the search is needed.
        explanation: String,
    },
    /// Read resources with link-followers.
    InferClaimsFromResources {
        /// Resources, one follower each.
        resources: Vec<ResourceRequest>,
    },
    /// Delegate sub-goals to sub-coordinators.
    StartResearchTasks {
        /// Tasks, one sub-coordinator each.
        tasks: Vec<ResearchTask>,
    },
    /// Replace the plan.
    UpdatePlan {
        /// New plan.
        plan: String,
    },
    /// Ask the operator.
    RequestHumanInput {
        /// Question text.
        question: String,
    },
    /// Read links from visited pages.
    ExploreLinks {
        /// Links to read.
        links: Vec<LinkRequest>,
    },
    /// Finish successfully.
    Complete {
        /// Why the goal is met.
        explanation: String,
    },
    /// Give up.
    Terminate {
        /// Why the goal cannot be met.
        explanation: String,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryInput {
    query: String,
    #[serde(default)]
    explanation: String,
}

#[derive(Deserialize)]
struct ResourcesInput {
    resources: Vec<ResourceRequest>,
}

#[derive(Deserialize)]
struct TasksInput {
    tasks: Vec<ResearchTask>,
}

#[derive(Deserialize)]
struct PlanInput {
    plan: String,
}

#[derive(Deserialize)]
struct QuestionInput {
    question: String,
}

#[derive(Deserialize)]
struct LinksInput {
    links: Vec<LinkRequest>,
}

#[derive(Deserialize)]
struct ExplanationInput {
    #[serde(default)]
    explanation: String,
}

fn decode<T: for<'de> Deserialize<'de>>(tool_use: &ToolUse) -> Result<T, AgentError> {
    serde_json::from_value(tool_use.input.clone()).map_err(|e| AgentError::ToolInput {
        tool: tool_use.name.clone(),
        message: e.to_string(),
    })
}

impl CoordinatorAction {
    /// Decodes a gateway-validated tool call.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::ToolInput`] for unknown tools or inputs that do
    /// not decode.
    pub fn from_tool_use(tool_use: &ToolUse) -> Result<Self, AgentError> {
        Ok(match tool_use.name.as_str() {
            WEB_SEARCH => {
                let input: QueryInput = decode(tool_use)?;
                Self::WebSearch {
                    query: input.query,
                    explanation: input.explanation,
                }
            }
            INFER_CLAIMS_FROM_RESOURCES => Self::InferClaimsFromResources {
                resources: decode::<ResourcesInput>(tool_use)?.resources,
            },
            START_RESEARCH_TASKS => Self::StartResearchTasks {
                tasks: decode::<TasksInput>(tool_use)?.tasks,
            },
            UPDATE_PLAN => Self::UpdatePlan {
                plan: decode::<PlanInput>(tool_use)?.plan,
            },
            REQUEST_HUMAN_INPUT => Self::RequestHumanInput {
                question: decode::<QuestionInput>(tool_use)?.question,
            },
            EXPLORE_LINKS => Self::ExploreLinks {
                links: decode::<LinksInput>(tool_use)?.links,
            },
            COMPLETE => Self::Complete {
                explanation: decode::<ExplanationInput>(tool_use)?.explanation,
            },
            TERMINATE => Self::Terminate {
                explanation: decode::<ExplanationInput>(tool_use)?.explanation,
            },
            other => {
                return Err(AgentError::ToolInput {
                    tool: other.to_string(),
                    message: "not a coordination tool".to_string(),
                });
            }
        })
    }

    /// Tool name this action came from.
    #[must_use]
    pub const fn tool_name(&self) -> &'static str {
        match self {
            Self::WebSearch { .. } => WEB_SEARCH,
            Self::InferClaimsFromResources { .. } => INFER_CLAIMS_FROM_RESOURCES,
            Self::StartResearchTasks { .. } => START_RESEARCH_TASKS,
            Self::UpdatePlan { .. } => UPDATE_PLAN,
            Self::RequestHumanInput { .. } => REQUEST_HUMAN_INPUT,
            Self::ExploreLinks { .. } => EXPLORE_LINKS,
            Self::Complete { .. } => COMPLETE,
            Self::Terminate { .. } => TERMINATE,
        }
    }
}

/// Tools offered to a worker of `kind`.
///
/// `requestHumanInput` is only offered to the coordinator, and only when a
/// human channel exists.
#[must_use]
pub fn tools_for(kind: WorkerKind, human_available: bool, max_links: usize) -> Vec<ToolDefinition> {
    match kind {
        WorkerKind::Coordinator => {
            let mut tools = vec![
                web_search(),
                infer_claims_from_resources(),
                start_research_tasks(),
                update_plan(),
            ];
            if human_available {
                tools.push(request_human_input());
            }
            tools.extend([complete(), terminate()]);
            tools
        }
        WorkerKind::SubCoordinator => vec![
            web_search(),
            infer_claims_from_resources(),
            update_plan(),
            complete(),
            terminate(),
        ],
        WorkerKind::LinkFollower => vec![explore_links(max_links), complete(), terminate()],
    }
}

fn explanation_property() -> Value {
    json!({
        "type": "string",
        "description": "A brief explanation of why you are making this call."
    })
}

fn tool(name: &str, description: &str, schema: Value) -> ToolDefinition {
    ToolDefinition::new(name, description, schema).with_sanitizer(Sanitizer::common())
}

fn web_search() -> ToolDefinition {
    tool(
        WEB_SEARCH,
        "Search the web. Returns a list of URLs with short summaries. Use \
         inferClaimsFromResources afterwards to read the useful ones.",
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "minLength": 1, "description": "The search query."},
                "explanation": explanation_property()
            },
            "required": ["query", "explanation"]
        }),
    )
}

fn infer_claims_from_resources() -> ToolDefinition {
    tool(
        INFER_CLAIMS_FROM_RESOURCES,
        "Read web pages and extract entities and claims relevant to the goal. \
         Each resource is read by its own worker, which may follow links.",
        json!({
            "type": "object",
            "properties": {
                "resources": {
                    "type": "array",
                    "minItems": 1,
                    "items": {
                        "type": "object",
                        "properties": {
                            "url": {"type": "string", "minLength": 1},
                            "goal": {
                                "type": "string",
                                "description": "What information to look for on this resource."
                            }
                        },
                        "required": ["url", "goal"]
                    }
                },
                "explanation": explanation_property()
            },
            "required": ["resources", "explanation"]
        }),
    )
}

fn start_research_tasks() -> ToolDefinition {
    tool(
        START_RESEARCH_TASKS,
        "Delegate independent sub-goals to sub-coordinators that research them in \
         parallel. Use for goals that need several searches of their own.",
        json!({
            "type": "object",
            "properties": {
                "tasks": {
                    "type": "array",
                    "minItems": 1,
                    "items": {
                        "type": "object",
                        "properties": {
                            "goal": {"type": "string", "minLength": 1},
                            "explanation": {"type": "string"}
                        },
                        "required": ["goal", "explanation"]
                    }
                },
                "explanation": explanation_property()
            },
            "required": ["tasks", "explanation"]
        }),
    )
}

/// The `updatePlan` tool, also used alone during planning.
#[must_use]
pub fn update_plan() -> ToolDefinition {
    tool(
        UPDATE_PLAN,
        "Replace the research plan. Describe the steps still to take and the \
         order to take them in.",
        json!({
            "type": "object",
            "properties": {
                "plan": {"type": "string", "minLength": 1},
                "explanation": explanation_property()
            },
            "required": ["plan"]
        }),
    )
}

fn request_human_input() -> ToolDefinition {
    tool(
        REQUEST_HUMAN_INPUT,
        "Ask the person who started the research a question. Only use this when \
         the goal is ambiguous and the answer changes what to research.",
        json!({
            "type": "object",
            "properties": {
                "question": {"type": "string", "minLength": 1},
                "explanation": explanation_property()
            },
            "required": ["question"]
        }),
    )
}

fn explore_links(max_links: usize) -> ToolDefinition {
    tool(
        EXPLORE_LINKS,
        "Read linked pages that are likely to contain more information relevant \
         to the goal.",
        json!({
            "type": "object",
            "properties": {
                "links": {
                    "type": "array",
                    "minItems": 1,
                    "maxItems": max_links,
                    "items": {
                        "type": "object",
                        "properties": {
                            "url": {"type": "string", "minLength": 1},
                            "explanation": {"type": "string"}
                        },
                        "required": ["url", "explanation"]
                    }
                },
                "explanation": explanation_property()
            },
            "required": ["links"]
        }),
    )
}

fn complete() -> ToolDefinition {
    tool(
        COMPLETE,
        "Finish: the goal is met, or no further progress is possible with the \
         information found.",
        json!({
            "type": "object",
            "properties": {"explanation": explanation_property()},
            "required": ["explanation"]
        }),
    )
}

fn terminate() -> ToolDefinition {
    tool(
        TERMINATE,
        "Abandon the goal because it cannot be achieved. Prefer complete when any \
         useful information was found.",
        json!({
            "type": "object",
            "properties": {"explanation": explanation_property()},
            "required": ["explanation"]
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::schema::validate;
    use test_case::test_case;

    fn names(tools: &[ToolDefinition]) -> Vec<&str> {
        tools.iter().map(|t| t.name.as_str()).collect()
    }

    #[test_case(WorkerKind::Coordinator, true, &[WEB_SEARCH, INFER_CLAIMS_FROM_RESOURCES, START_RESEARCH_TASKS, UPDATE_PLAN, REQUEST_HUMAN_INPUT, COMPLETE, TERMINATE]; "coordinator with human")]
    #[test_case(WorkerKind::Coordinator, false, &[WEB_SEARCH, INFER_CLAIMS_FROM_RESOURCES, START_RESEARCH_TASKS, UPDATE_PLAN, COMPLETE, TERMINATE]; "coordinator without human")]
    #[test_case(WorkerKind::SubCoordinator, true, &[WEB_SEARCH, INFER_CLAIMS_FROM_RESOURCES, UPDATE_PLAN, COMPLETE, TERMINATE]; "sub-coordinator")]
    #[test_case(WorkerKind::LinkFollower, true, &[EXPLORE_LINKS, COMPLETE, TERMINATE]; "link-follower")]
    fn test_tool_vocabulary(kind: WorkerKind, human: bool, expected: &[&str]) {
        assert_eq!(names(&tools_for(kind, human, 5)), expected);
    }

    #[test]
    fn test_decode_actions() {
        let call = |name: &str, input: Value| ToolUse {
            id: "1".to_string(),
            name: name.to_string(),
            input,
        };
        let action = CoordinatorAction::from_tool_use(&call(
            WEB_SEARCH,
            json!({"query": "acme", "explanation": "find it"}),
        ));
        assert!(matches!(action, Ok(CoordinatorAction::WebSearch { ref query, .. }) if query == "acme"));

        let action = CoordinatorAction::from_tool_use(&call(
            START_RESEARCH_TASKS,
            json!({"tasks": [{"goal": "g", "explanation": "e"}], "explanation": "x"}),
        ));
        assert!(matches!(action, Ok(CoordinatorAction::StartResearchTasks { ref tasks }) if tasks.len() == 1));

        let action = CoordinatorAction::from_tool_use(&call(COMPLETE, json!({"explanation": "done"})));
        assert_eq!(action.map(|a| a.tool_name()).ok(), Some(COMPLETE));

        assert!(CoordinatorAction::from_tool_use(&call("browse", json!({}))).is_err());
    }

    #[test]
    fn test_explore_links_caps_link_count() {
        let tool = explore_links(2);
        let links = json!([
            {"url": "a", "explanation": ""},
            {"url": "b", "explanation": ""},
            {"url": "c", "explanation": ""}
        ]);
        assert!(validate(&json!({"links": links}), &tool).is_err());
        assert!(validate(&json!({"links": [{"url": "a", "explanation": ""}]}), &tool).is_ok());
    }

    #[test]
    fn test_schemas_reject_unknown_properties() {
        let tool = web_search();
        assert!(validate(&json!({"query": "q", "explanation": "e", "extra": 1}), &tool).is_err());
    }
}
