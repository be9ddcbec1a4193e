use thiserror::Error;

/// Sentinel-CP orchestration core errors, classified per the four error kinds in
/// the component design: validation, state-guard, gate/deadline, infrastructure.
#[derive(Debug, Error)]
pub enum SentinelError {
    /// Rejected at the boundary; no persistent state change.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A CAS transition lost the race, or was attempted from a disallowed state.
    #[error("invalid_state: {0}")]
    InvalidState(String),

    /// Planning resolved zero target nodes.
    #[error("no_target_nodes")]
    NoTargetNodes,

    /// Bundle referenced by a rollout is not `compiled`.
    #[error("bundle_not_compiled: bundle '{0}' is not compiled")]
    BundleNotCompiled(String),

    /// Bundle was revoked between planning and a step start.
    #[error("bundle_revoked: bundle '{0}' was revoked")]
    BundleRevoked(String),

    /// Approval gate rejections.
    #[error("self_approval: rollout creator cannot approve their own rollout")]
    SelfApproval,
    #[error("already_approved: actor already recorded an approval for this rollout")]
    AlreadyApproved,
    #[error("not_authorized: actor lacks the operator role")]
    NotAuthorized,
    #[error("comment_required: a rejection must include a comment")]
    CommentRequired,

    /// Gate / deadline business errors.
    #[error("max_unavailable_exceeded: {0} unavailable nodes exceed the tolerance")]
    MaxUnavailableExceeded(usize),
    #[error("deadline_exceeded: step did not complete within its progress deadline")]
    DeadlineExceeded,
    #[error("step_deadline_exceeded: rollout step {0} exceeded its progress deadline")]
    StepDeadlineExceeded(usize),

    /// Infrastructure / dependency failures. The queue re-delivers per the
    /// component's `max_attempts`; this variant does not itself carry retry state.
    #[error("store error: {0}")]
    Store(String),
    #[error("collaborator error: {0}")]
    Collaborator(String),
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("postgres error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

impl SentinelError {
    /// Stable error code surfaced on the HTTP API, per spec's error-code list.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::InvalidState(_) => "invalid_state",
            Self::NoTargetNodes => "no_target_nodes",
            Self::BundleNotCompiled(_) => "bundle_not_compiled",
            Self::BundleRevoked(_) => "bundle_revoked",
            Self::SelfApproval => "self_approval",
            Self::AlreadyApproved => "already_approved",
            Self::NotAuthorized => "not_authorized",
            Self::CommentRequired => "comment_required",
            Self::MaxUnavailableExceeded(_) => "max_unavailable_exceeded",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::StepDeadlineExceeded(_) => "step_deadline_exceeded",
            Self::Store(_) => "store_error",
            Self::Collaborator(_) => "collaborator_error",
            Self::Serialization(_) => "serialization_error",
            Self::Sqlx(_) => "store_error",
        }
    }
}
