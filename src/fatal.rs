//! Process-terminating error boundary.
//!
//! Library code returns [`Result`]; callers that want the all-or-nothing
//! behavior of a fixed-membership cluster route results through here.

use crate::error::{RdsmError, Result};
use std::io::Write;

/// Unwrap `result` or terminate the process with status 1.
pub fn exit_on_error<T>(result: Result<T>) -> T {
    match result {
        Ok(v) => v,
        Err(e) => exit_with(&e),
    }
}

/// Log `err`, print it to stderr and exit with status 1.
pub fn exit_with(err: &RdsmError) -> ! {
    tracing::error!(error = %err, "fatal rdsm error");
    let mut stderr = std::io::stderr().lock();
    let _ = writeln!(stderr, "rdsm: fatal: {err}");
    let _ = stderr.flush();
    std::process::exit(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_passes_through() {
        assert_eq!(exit_on_error(Ok::<_, RdsmError>(7)), 7);
    }
}
