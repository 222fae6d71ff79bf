//! Write-once record of the status a request was answered with.
//!
//! A tower service returns its response as a value, so a single stage can
//! never "write twice". The race this guards is between stages: the timeout
//! stage may give up on its spawned downstream task while that task is
//! finishing. Both sides try to [`ResponseCapture::record`] a status; the
//! first one wins and the loser backs off.
//!
//! The logging stage records the real outcome, the timeout stage claims
//! 504, the recovery stage claims 500.

use std::sync::OnceLock;

use axum::http::StatusCode;

#[derive(Debug, Default)]
pub struct ResponseCapture {
    status: OnceLock<StatusCode>,
}

impl ResponseCapture {
    /// Record `status` if nothing was recorded yet.
    ///
    /// Returns `true` when this call won; `false` when a status was already
    /// committed, in which case the recorded value is left untouched.
    pub fn record(&self, status: StatusCode) -> bool {
        self.status.set(status).is_ok()
    }

    /// The committed status, if any.
    pub fn status(&self) -> Option<StatusCode> {
        self.status.get().copied()
    }

    pub fn is_committed(&self) -> bool {
        self.status.get().is_some()
    }
}
