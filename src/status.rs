//! Run and attempt statuses and their classification predicates.
//!
//! Every status carries a fixed row in a lookup table of predicates
//! (final, failed, cancellable, crashable, freezable, restorable). The
//! lifecycle code consults these rows before every transition; no other
//! module decides what a status "means".

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    WaitingForDeploy,
    Executing,
    WaitingToResume,
    RetryingAfterFailure,
    CompletedSuccessfully,
    CompletedWithErrors,
    Crashed,
    SystemFailure,
    TimedOut,
    Canceled,
    Interrupted,
    Expired,
}

/// Status of a single execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    Pending,
    Executing,
    Paused,
    Completed,
    Failed,
    Canceled,
}

/// One row of the classification table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusClass {
    pub is_final: bool,
    pub is_failed: bool,
    pub cancellable: bool,
    pub crashable: bool,
    pub freezable: bool,
    pub restorable: bool,
}

impl StatusClass {
    const fn live(cancellable: bool, crashable: bool, freezable: bool, restorable: bool) -> Self {
        Self {
            is_final: false,
            is_failed: false,
            cancellable,
            crashable,
            freezable,
            restorable,
        }
    }

    const fn terminal(is_failed: bool) -> Self {
        Self {
            is_final: true,
            is_failed,
            cancellable: false,
            crashable: false,
            freezable: false,
            restorable: false,
        }
    }
}

// Indexed by `RunStatus as usize`; order must match the enum declaration.
const RUN_STATUS_TABLE: [StatusClass; 13] = [
    /* Pending */ StatusClass::live(true, false, false, false),
    /* WaitingForDeploy */ StatusClass::live(true, false, false, false),
    /* Executing */ StatusClass::live(true, true, true, false),
    /* WaitingToResume */ StatusClass::live(true, true, false, true),
    /* RetryingAfterFailure */ StatusClass::live(true, true, true, false),
    /* CompletedSuccessfully */ StatusClass::terminal(false),
    /* CompletedWithErrors */ StatusClass::terminal(true),
    /* Crashed */ StatusClass::terminal(true),
    /* SystemFailure */ StatusClass::terminal(true),
    /* TimedOut */ StatusClass::terminal(true),
    /* Canceled */ StatusClass::terminal(false),
    /* Interrupted */ StatusClass::terminal(true),
    /* Expired */ StatusClass::terminal(false),
];

// Indexed by `AttemptStatus as usize`.
const ATTEMPT_STATUS_TABLE: [StatusClass; 6] = [
    /* Pending */ StatusClass::live(true, true, false, false),
    /* Executing */ StatusClass::live(true, true, true, false),
    /* Paused */ StatusClass::live(true, true, false, true),
    /* Completed */ StatusClass::terminal(false),
    /* Failed */ StatusClass::terminal(true),
    /* Canceled */ StatusClass::terminal(false),
];

impl RunStatus {
    pub const ALL: [RunStatus; 13] = [
        RunStatus::Pending,
        RunStatus::WaitingForDeploy,
        RunStatus::Executing,
        RunStatus::WaitingToResume,
        RunStatus::RetryingAfterFailure,
        RunStatus::CompletedSuccessfully,
        RunStatus::CompletedWithErrors,
        RunStatus::Crashed,
        RunStatus::SystemFailure,
        RunStatus::TimedOut,
        RunStatus::Canceled,
        RunStatus::Interrupted,
        RunStatus::Expired,
    ];

    pub fn class(self) -> StatusClass {
        RUN_STATUS_TABLE[self as usize]
    }

    pub fn is_final(self) -> bool {
        self.class().is_final
    }

    pub fn is_failed(self) -> bool {
        self.class().is_failed
    }

    pub fn is_cancellable(self) -> bool {
        self.class().cancellable
    }

    pub fn is_crashable(self) -> bool {
        self.class().crashable
    }

    pub fn is_freezable(self) -> bool {
        self.class().freezable
    }

    pub fn is_restorable(self) -> bool {
        self.class().restorable
    }

    /// Statuses matching a predicate, in declaration order.
    pub fn matching(predicate: impl Fn(StatusClass) -> bool) -> Vec<RunStatus> {
        Self::ALL.into_iter().filter(|s| predicate(s.class())).collect()
    }

    /// All non-final statuses, used as the guard for finalizing writes.
    pub fn non_final() -> Vec<RunStatus> {
        Self::matching(|c| !c.is_final)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::WaitingForDeploy => "WAITING_FOR_DEPLOY",
            RunStatus::Executing => "EXECUTING",
            RunStatus::WaitingToResume => "WAITING_TO_RESUME",
            RunStatus::RetryingAfterFailure => "RETRYING_AFTER_FAILURE",
            RunStatus::CompletedSuccessfully => "COMPLETED_SUCCESSFULLY",
            RunStatus::CompletedWithErrors => "COMPLETED_WITH_ERRORS",
            RunStatus::Crashed => "CRASHED",
            RunStatus::SystemFailure => "SYSTEM_FAILURE",
            RunStatus::TimedOut => "TIMED_OUT",
            RunStatus::Canceled => "CANCELED",
            RunStatus::Interrupted => "INTERRUPTED",
            RunStatus::Expired => "EXPIRED",
        }
    }
}

impl AttemptStatus {
    pub const ALL: [AttemptStatus; 6] = [
        AttemptStatus::Pending,
        AttemptStatus::Executing,
        AttemptStatus::Paused,
        AttemptStatus::Completed,
        AttemptStatus::Failed,
        AttemptStatus::Canceled,
    ];

    pub fn class(self) -> StatusClass {
        ATTEMPT_STATUS_TABLE[self as usize]
    }

    pub fn is_final(self) -> bool {
        self.class().is_final
    }

    pub fn is_cancellable(self) -> bool {
        self.class().cancellable
    }

    pub fn is_crashable(self) -> bool {
        self.class().crashable
    }

    pub fn is_freezable(self) -> bool {
        self.class().freezable
    }

    pub fn is_restorable(self) -> bool {
        self.class().restorable
    }

    pub fn matching(predicate: impl Fn(StatusClass) -> bool) -> Vec<AttemptStatus> {
        Self::ALL.into_iter().filter(|s| predicate(s.class())).collect()
    }

    pub fn non_final() -> Vec<AttemptStatus> {
        Self::matching(|c| !c.is_final)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AttemptStatus::Pending => "PENDING",
            AttemptStatus::Executing => "EXECUTING",
            AttemptStatus::Paused => "PAUSED",
            AttemptStatus::Completed => "COMPLETED",
            AttemptStatus::Failed => "FAILED",
            AttemptStatus::Canceled => "CANCELED",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
