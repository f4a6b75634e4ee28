use serde::{Deserialize, Serialize};

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_SCRIPT_ERROR: i32 = 1;
pub const EXIT_EXECUTOR_CRASH: i32 = 2;
pub const EXIT_POLICY_FAILURE: i32 = 3;

/// Final classification of a run. The numeric exit codes are contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Worker emitted `run_complete` and the final flush succeeded.
    Success,
    /// Worker emitted `run_error`, or exited nonzero with no terminal event.
    ScriptError,
    /// Worker exited abnormally with no terminal event and no policy failure.
    ExecutorCrash,
    /// A policy flush, sink write, or artifact invariant failed fatally.
    PolicyFailure,
    /// Envelope `contract_version` inconsistent with the supervisor's.
    VersionMismatch,
}

impl RunOutcome {
    /// Process exit code for this outcome.
    pub fn exit_code(self) -> i32 {
        match self {
            RunOutcome::Success => EXIT_SUCCESS,
            RunOutcome::ScriptError => EXIT_SCRIPT_ERROR,
            RunOutcome::ExecutorCrash => EXIT_EXECUTOR_CRASH,
            RunOutcome::PolicyFailure | RunOutcome::VersionMismatch => EXIT_POLICY_FAILURE,
        }
    }

    /// Classification precedence when several outcomes apply. Higher wins.
    pub fn precedence(self) -> u8 {
        match self {
            RunOutcome::Success => 0,
            RunOutcome::ScriptError => 1,
            RunOutcome::ExecutorCrash => 2,
            RunOutcome::PolicyFailure => 3,
            RunOutcome::VersionMismatch => 4,
        }
    }

    /// Combine two applicable outcomes, keeping the higher-precedence one.
    pub fn merge(self, other: RunOutcome) -> RunOutcome {
        if other.precedence() > self.precedence() {
            other
        } else {
            self
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::ScriptError => "script_error",
            RunOutcome::ExecutorCrash => "executor_crash",
            RunOutcome::PolicyFailure => "policy_failure",
            RunOutcome::VersionMismatch => "version_mismatch",
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
