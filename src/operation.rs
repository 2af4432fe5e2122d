//! Per-stream operation lifecycle.
//!
//! Every active stream is tracked by an [`Operation`]: which interaction
//! model it runs, which side of it we are, and where it is in the
//! lifecycle. The state machine has the same shape for every model; only
//! the permitted transitions differ. The registry evicts an operation as
//! soon as it reaches a terminal state.

use crate::error::{RSocketError, Result};
use crate::frame::FrameType;

/// Lifecycle state of one logical stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    /// Request frame queued locally, not yet on the wire.
    Pending,
    /// Request frame sent/received; payloads may flow.
    Active,
    /// One direction has signaled completion; the other may still run.
    Completing,
    /// Final state: completed normally and evicted.
    Terminated,
    /// Final state: cancelled by either side.
    Cancelled,
    /// Final state: terminated by an error.
    Errored,
}

impl OperationState {
    /// Terminal states are never left.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationState::Terminated | OperationState::Cancelled | OperationState::Errored
        )
    }
}

/// The four interaction models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionModel {
    FireAndForget,
    RequestResponse,
    RequestStream,
    RequestChannel,
}

impl InteractionModel {
    /// The model opened by a request frame of the given type.
    pub fn from_frame_type(frame_type: FrameType) -> Option<InteractionModel> {
        Some(match frame_type {
            FrameType::RequestFnf => InteractionModel::FireAndForget,
            FrameType::RequestResponse => InteractionModel::RequestResponse,
            FrameType::RequestStream => InteractionModel::RequestStream,
            FrameType::RequestChannel => InteractionModel::RequestChannel,
            _ => return None,
        })
    }

    /// The request frame type that opens this model.
    pub fn frame_type(self) -> FrameType {
        match self {
            InteractionModel::FireAndForget => FrameType::RequestFnf,
            InteractionModel::RequestResponse => FrameType::RequestResponse,
            InteractionModel::RequestStream => FrameType::RequestStream,
            InteractionModel::RequestChannel => FrameType::RequestChannel,
        }
    }

    /// Only the channel keeps both directions open independently; for
    /// every other model one direction is closed from the start.
    pub fn is_bidirectional(self) -> bool {
        matches!(self, InteractionModel::RequestChannel)
    }
}

/// Which side of a stream this peer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Requester,
    Responder,
}

/// The live state of one logical stream.
#[derive(Debug)]
pub struct Operation {
    stream_id: u32,
    model: InteractionModel,
    role: Role,
    state: OperationState,
}

impl Operation {
    /// A fresh operation in `Pending`.
    pub fn new(stream_id: u32, model: InteractionModel, role: Role) -> Self {
        Self {
            stream_id,
            model,
            role,
            state: OperationState::Pending,
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn model(&self) -> InteractionModel {
        self.model
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> OperationState {
        self.state
    }

    /// `Pending -> Active`: the request frame went out / came in.
    pub fn activate(&mut self) -> Result<()> {
        self.transition(OperationState::Active)
    }

    /// `Active -> Completing`: one direction signaled completion.
    pub fn begin_completion(&mut self) -> Result<()> {
        if self.model == InteractionModel::FireAndForget {
            return Err(self.invalid("fire-and-forget has no completion phase"));
        }
        self.transition(OperationState::Completing)
    }

    /// Any live state `-> Terminated`: normal end of the stream.
    pub fn terminate(&mut self) -> Result<()> {
        self.transition(OperationState::Terminated)
    }

    /// `Pending | Active | Completing -> Cancelled`.
    pub fn cancel(&mut self) -> Result<()> {
        self.transition(OperationState::Cancelled)
    }

    /// `Pending | Active | Completing -> Errored`.
    pub fn fail(&mut self) -> Result<()> {
        self.transition(OperationState::Errored)
    }

    fn transition(&mut self, to: OperationState) -> Result<()> {
        let allowed = match (self.state, to) {
            (OperationState::Pending, OperationState::Active) => true,
            (OperationState::Active, OperationState::Completing) => true,
            // Terminal states are reachable from every live state;
            // fire-and-forget jumps straight from Pending to Terminated.
            (from, to) if !from.is_terminal() && to.is_terminal() => true,
            _ => false,
        };
        if !allowed {
            return Err(self.invalid(&format!("transition {:?} -> {to:?}", self.state)));
        }
        tracing::trace!(
            stream_id = self.stream_id,
            model = ?self.model,
            role = ?self.role,
            from = ?self.state,
            to = ?to,
            "operation transition"
        );
        self.state = to;
        Ok(())
    }

    fn invalid(&self, what: &str) -> RSocketError {
        RSocketError::ProtocolViolation(format!(
            "invalid {:?}/{:?} operation on stream {}: {what}",
            self.model, self.role, self.stream_id
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_lifecycle() {
        let mut op = Operation::new(1, InteractionModel::RequestStream, Role::Requester);
        assert_eq!(op.state(), OperationState::Pending);
        op.activate().unwrap();
        op.begin_completion().unwrap();
        op.terminate().unwrap();
        assert_eq!(op.state(), OperationState::Terminated);
        assert!(op.state().is_terminal());
    }

    #[test]
    fn test_fire_and_forget_terminates_immediately() {
        let mut op = Operation::new(3, InteractionModel::FireAndForget, Role::Requester);
        assert!(op.begin_completion().is_err());
        op.terminate().unwrap();
        assert_eq!(op.state(), OperationState::Terminated);
    }

    #[test]
    fn test_cancel_from_pending_and_active() {
        let mut op = Operation::new(5, InteractionModel::RequestResponse, Role::Requester);
        op.cancel().unwrap();
        assert_eq!(op.state(), OperationState::Cancelled);

        let mut op = Operation::new(7, InteractionModel::RequestResponse, Role::Requester);
        op.activate().unwrap();
        op.cancel().unwrap();
        assert_eq!(op.state(), OperationState::Cancelled);
    }

    #[test]
    fn test_error_from_active() {
        let mut op = Operation::new(9, InteractionModel::RequestChannel, Role::Responder);
        op.activate().unwrap();
        op.fail().unwrap();
        assert_eq!(op.state(), OperationState::Errored);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut op = Operation::new(11, InteractionModel::RequestStream, Role::Responder);
        op.activate().unwrap();
        op.cancel().unwrap();
        assert!(op.activate().is_err());
        assert!(op.terminate().is_err());
        assert!(op.fail().is_err());
        assert_eq!(op.state(), OperationState::Cancelled);
    }

    #[test]
    fn test_cannot_skip_pending() {
        let mut op = Operation::new(13, InteractionModel::RequestStream, Role::Requester);
        assert!(op.begin_completion().is_err());
        assert_eq!(op.state(), OperationState::Pending);
    }

    #[test]
    fn test_model_frame_type_mapping() {
        for model in [
            InteractionModel::FireAndForget,
            InteractionModel::RequestResponse,
            InteractionModel::RequestStream,
            InteractionModel::RequestChannel,
        ] {
            assert_eq!(
                InteractionModel::from_frame_type(model.frame_type()),
                Some(model)
            );
        }
        assert_eq!(InteractionModel::from_frame_type(FrameType::Payload), None);
        assert!(InteractionModel::RequestChannel.is_bidirectional());
        assert!(!InteractionModel::RequestStream.is_bidirectional());
    }
}
