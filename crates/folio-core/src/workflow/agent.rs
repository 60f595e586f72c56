//! Agent port for LLM-calling collaborators.
//!
//! The engine never talks to a model directly. Stages call an [`Agent`]
//! with a prompt and the current error context; the only contract is that
//! failures come back as classifiable `StructuredError`s and successes
//! carry non-empty content. [`AgentUnitGenerator`] adapts any agent into
//! the unit generation contract.

use std::fmt::Write as _;
use std::future::Future;

use folio_types::context::ErrorContext;
use folio_types::error::{ErrorCode, StructuredError};
use serde::{Deserialize, Serialize};

use super::generation::{UnitDraft, UnitGenerator, UnitRequest};
use super::node::ExecutionMode;

/// Token accounting reported by an agent call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Result of one agent call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

/// An LLM-calling collaborator.
///
/// Uses RPITIT (return-position `impl Trait` in traits) for async methods.
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    fn execute(
        &self,
        prompt: &str,
        context: &ErrorContext,
    ) -> impl Future<Output = Result<AgentResponse, StructuredError>> + Send;
}

/// Call `agent`, rejecting blank content as a transient `empty_response`.
pub async fn execute_agent<A: Agent>(
    agent: &A,
    prompt: &str,
    context: &ErrorContext,
) -> Result<AgentResponse, StructuredError> {
    let response = agent
        .execute(prompt, context)
        .await
        .map_err(|e| e.with_context(context.clone().with_tool(agent.name())))?;

    if response.content.trim().is_empty() {
        tracing::warn!(agent = agent.name(), "agent returned empty content");
        return Err(
            StructuredError::tool(agent.name(), ErrorCode::EmptyResponse, "agent returned no content")
                .with_context(context.clone()),
        );
    }

    if let Some(usage) = response.usage {
        tracing::debug!(
            agent = agent.name(),
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "agent call completed"
        );
    }
    Ok(response)
}

/// Prompt for one unit. Dependency content is summarised to its opening.
pub fn unit_prompt(request: &UnitRequest) -> String {
    const EXCERPT_CHARS: usize = 600;

    let mut prompt = format!(
        "Write \"{}\" (unit {}), about {} words.\n",
        request.title, request.unit_number, request.target_size
    );
    match request.mode {
        ExecutionMode::Normal => {}
        ExecutionMode::Degraded => prompt.push_str("Keep the structure simple.\n"),
        ExecutionMode::ReducedComplexity => {
            prompt.push_str("Write a short, self-contained version with a plain structure.\n");
        }
    }
    for (unit_number, content) in &request.dependency_content {
        let excerpt: String = content.chars().take(EXCERPT_CHARS).collect();
        let _ = write!(prompt, "\nEarlier unit {unit_number}:\n{excerpt}\n");
    }
    prompt
}

/// Generates units by prompting an [`Agent`].
pub struct AgentUnitGenerator<A: Agent> {
    agent: A,
}

impl<A: Agent> AgentUnitGenerator<A> {
    pub fn new(agent: A) -> Self {
        Self { agent }
    }
}

impl<A: Agent + 'static> UnitGenerator for AgentUnitGenerator<A> {
    fn name(&self) -> &str {
        self.agent.name()
    }

    async fn generate(&self, request: &UnitRequest) -> Result<UnitDraft, StructuredError> {
        let context = ErrorContext::for_session(request.session_id.as_str())
            .with_operation("generate_unit")
            .with_extra("unitNumber", request.unit_number)
            .with_extra("mode", request.mode.as_str());
        let response = execute_agent(&self.agent, &unit_prompt(request), &context).await?;
        Ok(UnitDraft::new(response.content))
    }
}
