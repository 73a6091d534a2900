use ulid::Ulid;

use crate::model::{format_bmi, Capability, Goal};

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(String),
    EntitlementDenied {
        member: Ulid,
        capability: Capability,
    },
    ScheduleConflict(Ulid),
    CapacityExceeded {
        class: Ulid,
        capacity: u32,
    },
    /// A storage-level uniqueness rule tripped after the overlap check passed.
    IntegrityViolation(String),
    Inactive(Ulid),
    InvalidTransition(&'static str),
    InvalidInput(String),
    InUse(Ulid),
    /// No routine template covers this goal at this BMI (hundredths).
    NoMatchingTemplate {
        goal: Goal,
        bmi: u32,
    },
    Forbidden(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Stable label used by the wire protocol and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::EntitlementDenied { .. } => "entitlement_denied",
            EngineError::ScheduleConflict(_) => "schedule_conflict",
            EngineError::CapacityExceeded { .. } => "capacity_exceeded",
            EngineError::IntegrityViolation(_) => "integrity_violation",
            EngineError::Inactive(_) => "inactive",
            EngineError::InvalidTransition(_) => "invalid_transition",
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::InUse(_) => "in_use",
            EngineError::NoMatchingTemplate { .. } => "no_matching_template",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "internal",
        }
    }

    /// Integrity violations are retryable conflicts; users see them as schedule conflicts.
    pub fn user_facing(self, resource: Ulid) -> Self {
        match self {
            EngineError::IntegrityViolation(_) => EngineError::ScheduleConflict(resource),
            other => other,
        }
    }

    /// Everything except log failures is an expected, user-recoverable outcome.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::WalError(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(what) => write!(f, "already exists: {what}"),
            EngineError::EntitlementDenied { member, capability } => {
                write!(f, "member {member} has no active plan allowing {capability}")
            }
            EngineError::ScheduleConflict(id) => write!(f, "schedule conflict with: {id}"),
            EngineError::CapacityExceeded { class, capacity } => {
                write!(f, "class {class} is full: all {capacity} seats taken")
            }
            EngineError::IntegrityViolation(msg) => write!(f, "integrity violation: {msg}"),
            EngineError::Inactive(id) => write!(f, "inactive: {id}"),
            EngineError::InvalidTransition(msg) => write!(f, "invalid transition: {msg}"),
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::InUse(id) => write!(f, "cannot delete {id}: still referenced"),
            EngineError::NoMatchingTemplate { goal, bmi } => write!(
                f,
                "no routine template for goal {goal:?} at BMI {}",
                format_bmi(*bmi)
            ),
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
