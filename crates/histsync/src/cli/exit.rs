//! Process exit statuses.
//!
//! Schedulers read these instead of parsing output.

use histsync::{RunOutcome, RunStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitStatus {
    /// Every file and tag succeeded
    Success = 0,

    /// Run failed outright, or startup/configuration error
    Fatal = 1,

    /// Run completed but some files or tags failed
    PartialFailure = 2,

    /// Another run holds the lock
    SkippedBusy = 3,
}

impl ExitStatus {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn for_outcome(outcome: &RunOutcome) -> Self {
        match outcome {
            RunOutcome::SkippedBusy => ExitStatus::SkippedBusy,
            RunOutcome::Completed(summary) => match summary.status {
                RunStatus::Success => ExitStatus::Success,
                RunStatus::PartialFailure => ExitStatus::PartialFailure,
                RunStatus::Failed => ExitStatus::Fatal,
            },
        }
    }
}

impl From<ExitStatus> for std::process::ExitCode {
    fn from(status: ExitStatus) -> Self {
        std::process::ExitCode::from(status.as_u8())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ExitStatus::Success.as_u8(), 0);
        assert_eq!(ExitStatus::Fatal.as_u8(), 1);
        assert_eq!(ExitStatus::PartialFailure.as_u8(), 2);
        assert_eq!(ExitStatus::SkippedBusy.as_u8(), 3);
        assert_eq!(
            ExitStatus::for_outcome(&RunOutcome::SkippedBusy),
            ExitStatus::SkippedBusy
        );
    }
}
