mod attributor;
mod bandit;
mod engine;
mod linalg;
mod pending;
mod reward;

pub use attributor::{attribution_fault_snapshot, Attribution, RewardAttributor};
pub use bandit::{ArmScore, ArmUpdate, LinUcbSelector, Selection};
pub use engine::{DecisionEngine, MatchPath, SelectionDecision, SettleOutcome};
pub use pending::{EnqueueResult, PendingSelectionQueue};
pub use reward::{reward_function_for, FeeReward, RewardFunction, SizingReward};

/// Caller-side faults the HTTP layer maps to client errors, plus the attribution
/// consistency fault.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("context dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("context feature at index {index} is not finite")]
    NonFiniteFeature { index: usize },
    #[error("unknown arm: {0}")]
    UnknownArm(String),
    #[error("unknown policy family: {0}")]
    UnknownPolicyFamily(String),
    #[error("correlation id must not be empty")]
    EmptyCorrelationId,
    #[error("arm catalog is empty")]
    EmptyCatalog,
    #[error("no policy action record for resolved selection correlation_id={0}")]
    MissingActionRecord(String),
}

impl PolicyError {
    /// True when the request itself was invalid rather than the service state.
    pub fn is_caller_error(&self) -> bool {
        !matches!(self, Self::EmptyCatalog | Self::MissingActionRecord(_))
    }
}
