//! Workflow event bus.
//!
//! Every node, the checkpoint manager and the engine share one bus per
//! engine. Subscribers either see every session's events through
//! [`EventBus::subscribe`], or follow a single session through
//! [`EventBus::subscribe_session`], which is what a status surface polls.
//! Publishing with nobody listening drops the event.

use folio_types::event::WorkflowEvent;
use folio_types::workflow::{Stage, WorkflowState};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    /// `capacity` is the per-subscriber backlog; slower readers lag.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receiver for every session's events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    /// Receiver that only yields events of `session_id`.
    pub fn subscribe_session(&self, session_id: impl Into<String>) -> SessionEvents {
        SessionEvents {
            session_id: session_id.into(),
            receiver: self.sender.subscribe(),
        }
    }

    pub fn publish(&self, event: WorkflowEvent) {
        // Err only means there are no receivers right now.
        let _ = self.sender.send(event);
    }

    /// Publish the progress currently recorded on `state`.
    pub fn publish_progress(&self, state: &WorkflowState) {
        self.publish(WorkflowEvent::ProgressUpdated {
            session_id: state.session_id.clone(),
            stage: state.current_stage,
            current_stage_progress: state.progress.current_stage_progress,
            overall_progress: state.progress.overall_progress,
        });
    }

    /// Publish a stage change of `state`'s session.
    pub fn publish_transition(&self, state: &WorkflowState, from: Stage) {
        self.publish(WorkflowEvent::StageTransition {
            session_id: state.session_id.clone(),
            from,
            to: state.current_stage,
        });
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

/// Events of one session, in publish order.
///
/// A reader that falls behind skips the overwritten events and keeps going;
/// progress events carry absolute values, so the next one is enough to
/// catch up.
#[derive(Debug)]
pub struct SessionEvents {
    session_id: String,
    receiver: broadcast::Receiver<WorkflowEvent>,
}

impl SessionEvents {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Next event of this session, or `None` once every bus handle is gone.
    pub async fn recv(&mut self) -> Option<WorkflowEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.session_id() == self.session_id => return Some(event),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(session_id = %self.session_id, skipped, "event subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Everything already queued for this session, without waiting.
    pub fn drain(&mut self) -> Vec<WorkflowEvent> {
        let mut events = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(event) if event.session_id() == self.session_id => events.push(event),
                Ok(_) => {}
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(session_id = %self.session_id, skipped, "event subscriber lagged");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return events,
            }
        }
    }

    /// Latest `(current_stage_progress, overall_progress)` queued for this session.
    pub fn latest_progress(&mut self) -> Option<(u8, u8)> {
        self.drain().into_iter().rev().find_map(|event| match event {
            WorkflowEvent::ProgressUpdated {
                current_stage_progress,
                overall_progress,
                ..
            } => Some((current_stage_progress, overall_progress)),
            _ => None,
        })
    }
}
