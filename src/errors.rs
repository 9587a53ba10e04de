//! Error taxonomy for the release-test core (Section 7 of the design).
//!
//! Every component wraps its root cause with component-level context rather
//! than inventing new variants per call site, so a test failure message
//! reads as a chain: `<component>: <cause>`.

use thiserror::Error;

/// Errors surfaced by the Desired-State Client (Section 4.B) and anything
/// built on top of it.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} '{name}' conflict: resource version mismatch, retry")]
    Conflict { kind: &'static str, name: String },

    #[error("transport error talking to the record store: {0}")]
    Transport(String),
}

/// Errors surfaced by the Remote-Exec Channel (Section 4.A).
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("transport error running '{command}' on {target}: {message}")]
    Transport {
        target: String,
        command: String,
        message: String,
    },

    #[error("command '{command}' on {target} exited {code}: {stderr}")]
    NonZeroExit {
        target: String,
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("command '{command}' on {target} cancelled")]
    Cancelled { target: String, command: String },
}

impl ExecError {
    /// Matches the spec's "transient transport error containing the marker
    /// `ssh:`" retry condition.
    pub fn is_transport(&self) -> bool {
        matches!(self, ExecError::Transport { .. })
    }
}

/// Errors from the Readiness Oracle (Section 4.C). `NotReady` is the
/// distinguished sentinel mentioned in Section 7: it surfaces as a test
/// failure listing the unready set, distinct from a transport failure.
#[derive(Error, Debug)]
pub enum ReadinessError {
    #[error("timed out after {0:?} waiting for readiness; not ready: {1:?}")]
    NotReady(std::time::Duration, Vec<String>),

    #[error("fleet is ready but not updated to the desired version: {0:?}")]
    ReadyButNotUpdated(Vec<String>),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the Connectivity Prober (Section 4.E).
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("unexpected reachability for {kind} {src} -> {dst}: predicted {predicted}, observed {observed}; output: {output}")]
    UnexpectedReachability {
        kind: &'static str,
        src: String,
        dst: String,
        predicted: bool,
        observed: bool,
        output: String,
    },

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("probe discovery failed for {0}: {1}")]
    Discovery(String, String),
}

/// Errors from the Test Runner (Section 4.H).
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("baseline setup failed before the first test: {0}")]
    SetupFailed(String),

    #[error("precondition not met: {0}")]
    PreconditionSkip(String),

    #[error("{body_err}; revert also failed: {revert_err}")]
    Joined {
        body_err: String,
        revert_err: String,
    },

    #[error(transparent)]
    Readiness(#[from] ReadinessError),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("{0}")]
    Other(String),
}

impl RunnerError {
    /// Joins a test body error with a revert error, per the "first revert
    /// failure only" rule in Section 7.
    pub fn join(body: RunnerError, revert: RunnerError) -> RunnerError {
        RunnerError::Joined {
            body_err: body.to_string(),
            revert_err: revert.to_string(),
        }
    }
}

pub type RunnerResult<T> = Result<T, RunnerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_ready_message_lists_unready_set() {
        let err = ReadinessError::NotReady(
            std::time::Duration::from_secs(600),
            vec!["leaf-01".into(), "leaf-02".into()],
        );
        let msg = err.to_string();
        assert!(msg.contains("leaf-01"));
        assert!(msg.contains("leaf-02"));
    }

    #[test]
    fn joined_error_keeps_both_messages() {
        let body = RunnerError::Other("probe mismatch".into());
        let revert = RunnerError::Other("port still down".into());
        let joined = RunnerError::join(body, revert);
        let msg = joined.to_string();
        assert!(msg.contains("probe mismatch"));
        assert!(msg.contains("port still down"));
    }

    #[test]
    fn exec_transport_error_is_retryable() {
        let err = ExecError::Transport {
            target: "server-01".into(),
            command: "ping".into(),
            message: "ssh: connect failed".into(),
        };
        assert!(err.is_transport());
    }
}
