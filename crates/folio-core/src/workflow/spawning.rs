//! Unit spawning stage: turns the outline into an execution plan.

use folio_types::workflow::{SpawningMetadata, Stage, WorkflowState};

use super::node::{NodeContext, NodeError, StageNode};
use super::planner::build_execution_plan;
use super::state_machine::update_progress;

/// Stage node for [`Stage::UnitSpawning`].
///
/// Stores the plan in `spawning_metadata` and resets previously generated
/// units; the plan is consumed by the unit generation stage.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnitSpawningNode;

impl StageNode for UnitSpawningNode {
    fn name(&self) -> &str {
        "unit_spawning"
    }

    fn stage(&self) -> Stage {
        Stage::UnitSpawning
    }

    fn validate(&self, state: &WorkflowState) -> bool {
        state.current_stage == Stage::UnitSpawning && !state.outline.is_empty()
    }

    async fn execute_node(&self, state: &WorkflowState, _ctx: &NodeContext) -> Result<WorkflowState, NodeError> {
        let plan = build_execution_plan(&state.outline)?;

        tracing::info!(
            session_id = %state.session_id,
            units = plan.total_units,
            layers = plan.layers.len(),
            parallelism = plan.parallelism_factor,
            estimated_ms = plan.estimated_total_duration_ms,
            "execution plan built"
        );

        let node_ids = plan
            .layers
            .iter()
            .flatten()
            .map(|n| format!("unit-generation-{n}"))
            .collect();

        let mut next = state.clone();
        next.units.clear();
        next.progress.units_completed = 0;
        next.progress.total_units = u32::try_from(plan.total_units).unwrap_or(u32::MAX);
        next.spawning_metadata = Some(SpawningMetadata { plan, node_ids });
        Ok(update_progress(&next, 100))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_types::config::EngineConfig;
    use folio_types::error::ErrorCode;
    use folio_types::workflow::{UnitResult, UnitStatus, WorkUnit};

    use crate::workflow::node::NodeRunner;

    fn spawning_state(outline: Vec<WorkUnit>) -> WorkflowState {
        let mut state = WorkflowState::new("s1");
        state.current_stage = Stage::UnitSpawning;
        state.outline = outline;
        state
    }

    #[tokio::test]
    async fn stores_plan_and_node_ids() {
        let state = spawning_state(vec![
            WorkUnit::new(1, vec![]),
            WorkUnit::new(2, vec![]),
            WorkUnit::new(3, vec![1, 2]),
        ]);
        let ctx = NodeContext::new(&EngineConfig::default());
        let next = UnitSpawningNode.execute_node(&state, &ctx).await.unwrap();

        let metadata = next.spawning_metadata.unwrap();
        assert_eq!(metadata.plan.layers, vec![vec![1, 2], vec![3]]);
        assert_eq!(
            metadata.node_ids,
            vec!["unit-generation-1", "unit-generation-2", "unit-generation-3"]
        );
        assert_eq!(next.progress.total_units, 3);
        assert_eq!(next.progress.current_stage_progress, 100);
    }

    #[tokio::test]
    async fn clears_stale_units() {
        let mut state = spawning_state(vec![WorkUnit::new(1, vec![])]);
        state.record_unit(UnitResult {
            unit_number: 7,
            title: "Chapter 7".to_string(),
            content: "old".to_string(),
            word_count: 1,
            status: UnitStatus::Completed,
            error: None,
            attempts: 1,
        });

        let ctx = NodeContext::new(&EngineConfig::default());
        let next = UnitSpawningNode.execute_node(&state, &ctx).await.unwrap();
        assert!(next.units.is_empty());
        assert_eq!(next.progress.units_completed, 0);
    }

    #[tokio::test]
    async fn cycle_fails_without_recovery() {
        let state = spawning_state(vec![WorkUnit::new(1, vec![2]), WorkUnit::new(2, vec![1])]);
        let ctx = NodeContext::new(&EngineConfig::default());

        let err = NodeRunner::new(2).execute(&UnitSpawningNode, &state, &ctx).await.unwrap_err();
        assert_eq!(err.error.code, ErrorCode::CircularDependency);
        assert_eq!(err.state.unwrap().retry_count, 0);
    }

    #[test]
    fn empty_outline_is_rejected() {
        assert!(!UnitSpawningNode.validate(&spawning_state(Vec::new())));
    }
}
