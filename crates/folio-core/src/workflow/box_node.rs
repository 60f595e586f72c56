//! BoxStageNode -- object-safe dynamic dispatch wrapper for StageNode.
//!
//! Same blanket-impl pattern as the other boxed ports:
//! 1. Define an object-safe `StageNodeDyn` trait with boxed futures
//! 2. Blanket-impl `StageNodeDyn` for all `T: StageNode`
//! 3. `BoxStageNode` wraps `Box<dyn StageNodeDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use folio_types::workflow::{Stage, WorkflowState};

use super::node::{NodeContext, NodeError, StageNode};

/// Object-safe version of [`StageNode`] with boxed futures.
pub trait StageNodeDyn: Send + Sync {
    fn name(&self) -> &str;

    fn stage(&self) -> Stage;

    fn validate(&self, state: &WorkflowState) -> bool;

    fn execute_node_boxed<'a>(
        &'a self,
        state: &'a WorkflowState,
        ctx: &'a NodeContext,
    ) -> Pin<Box<dyn Future<Output = Result<WorkflowState, NodeError>> + Send + 'a>>;
}

/// Blanket implementation: any `StageNode` automatically implements `StageNodeDyn`.
impl<T: StageNode> StageNodeDyn for T {
    fn name(&self) -> &str {
        StageNode::name(self)
    }

    fn stage(&self) -> Stage {
        StageNode::stage(self)
    }

    fn validate(&self, state: &WorkflowState) -> bool {
        StageNode::validate(self, state)
    }

    fn execute_node_boxed<'a>(
        &'a self,
        state: &'a WorkflowState,
        ctx: &'a NodeContext,
    ) -> Pin<Box<dyn Future<Output = Result<WorkflowState, NodeError>> + Send + 'a>> {
        Box::pin(self.execute_node(state, ctx))
    }
}

/// Type-erased stage node for the engine's stage registry.
///
/// Since `StageNode` uses RPITIT, it cannot be used as a trait object
/// directly. `BoxStageNode` implements `StageNode` itself by delegating to
/// the inner `StageNodeDyn` object, so the runner stays generic.
pub struct BoxStageNode {
    inner: Box<dyn StageNodeDyn>,
}

impl BoxStageNode {
    pub fn new<T: StageNode + 'static>(node: T) -> Self {
        Self { inner: Box::new(node) }
    }
}

impl StageNode for BoxStageNode {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn stage(&self) -> Stage {
        self.inner.stage()
    }

    fn validate(&self, state: &WorkflowState) -> bool {
        self.inner.validate(state)
    }

    fn execute_node(
        &self,
        state: &WorkflowState,
        ctx: &NodeContext,
    ) -> impl Future<Output = Result<WorkflowState, NodeError>> + Send {
        async move { self.inner.execute_node_boxed(state, ctx).await }
    }
}

impl std::fmt::Debug for BoxStageNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxStageNode")
            .field("name", &self.inner.name())
            .field("stage", &self.inner.stage())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::node::tests::ScriptedNode;
    use crate::workflow::node::{ExecutionMode, NodeRunner};
    use folio_types::config::EngineConfig;
    use folio_types::error::{ErrorCode, StructuredError};

    #[tokio::test]
    async fn boxed_node_delegates() {
        let boxed = BoxStageNode::new(ScriptedNode::new(Stage::Formatting, vec![Ok(())]));
        assert_eq!(StageNode::name(&boxed), "formatting");
        assert_eq!(StageNode::stage(&boxed), Stage::Formatting);

        let mut state = WorkflowState::new("s1");
        state.current_stage = Stage::Formatting;
        let ctx = NodeContext::new(&EngineConfig::default());

        let next = NodeRunner::new(2).execute(&boxed, &state, &ctx).await.unwrap();
        assert_eq!(next.artifacts["formatting"]["mode"], ExecutionMode::Normal.as_str());
        assert!(format!("{boxed:?}").contains("formatting"));
    }

    #[tokio::test]
    async fn boxed_node_failure_reaches_runner_recovery() {
        let failure = StructuredError::tool("typesetter", ErrorCode::ToolServer, "upstream returned 503");
        let boxed = BoxStageNode::new(ScriptedNode::new(Stage::Formatting, vec![Err(failure), Ok(())]));
        let mut state = WorkflowState::new("s1");
        state.current_stage = Stage::Formatting;
        let ctx = NodeContext::new(&EngineConfig::default());

        let recovered = NodeRunner::new(2).execute(&boxed, &state, &ctx).await.unwrap();
        assert_eq!(recovered.retry_count, 1);
        assert_eq!(recovered.artifacts["formatting"]["mode"], ExecutionMode::Degraded.as_str());
    }
}
