//! Stable exit codes for the executor CLI.

/// Command succeeded.
pub const OK: i32 = 0;
/// Command failed due to invalid input (bad tree document, unknown run, config error).
pub const INVALID: i32 = 1;
/// `advance` made no progress: the run's frontier was already fully routed
/// and no barrier is ready to release.
pub const NO_OP: i32 = 2;
/// The run ended in `failed` status as a result of this command.
pub const RUN_FAILED: i32 = 3;
