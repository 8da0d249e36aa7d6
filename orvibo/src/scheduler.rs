//! Boundary to the external facility that powers the plug off after a delay.
//!
//! The session layer never runs any timer itself.  It only asks the
//! environment (originally a serverless cron rule) to invoke power-off later,
//! and checks the confirmation identifier the environment hands back.

use thiserror::Error;

/// The external scheduler rejected or failed a request.
///
/// Always surfaced as a warning on the operation's report, never as a hard
/// failure: the power change itself already happened.
#[derive(Error, Debug)]
#[error("scheduler request failed: {0}")]
pub struct SchedulerError(pub String);

/// External time-triggered callback facility.
pub trait AutoOffScheduler {
    /// Requests one power-off invocation after the given delay, replacing any
    /// previously armed trigger.  Returns the identifier of the trigger rule,
    /// which the controller compares against its configured expectation.
    fn arm(&mut self, minutes_from_now: u32) -> Result<String, SchedulerError>;

    /// Cancels any pending trigger.  Disarming when nothing is armed is a
    /// no-op, not an error.
    fn disarm(&mut self) -> Result<(), SchedulerError>;
}

/// A scheduler that schedules nothing.
///
/// For hosts with no delayed-off facility, such as the `s20ctl` command line
/// tool.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopScheduler;

impl AutoOffScheduler for NoopScheduler {
    fn arm(&mut self, _minutes_from_now: u32) -> Result<String, SchedulerError> {
        Ok(String::new())
    }

    fn disarm(&mut self) -> Result<(), SchedulerError> {
        Ok(())
    }
}
