mod isolate;

pub use isolate::IsolateHost;

use std::process::Command;

use anyhow::{anyhow, bail, Result};

/// Which half of the judging pipeline an invocation belongs to. The
/// two modes differ only by the limits table below.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Compile,
    Execute,
}

pub(crate) struct PhaseLimits {
    pub fsize_kb: u32,
    /// `None` leaves the process count unrestricted
    pub processes: Option<u32>,
    pub open_files: u32,
    pub cpu_time_s: Option<u32>,
    pub wall_time_s: Option<u32>,
    pub memory_kb: Option<u32>,
}

impl Phase {
    pub(crate) fn limits(self) -> PhaseLimits {
        match self {
            Phase::Compile => PhaseLimits {
                fsize_kb: 5120,
                processes: None,
                open_files: 0,
                cpu_time_s: None,
                wall_time_s: None,
                memory_kb: None,
            },
            Phase::Execute => PhaseLimits {
                fsize_kb: 5120,
                processes: Some(100),
                open_files: 0,
                cpu_time_s: Some(1),
                wall_time_s: Some(2),
                memory_kb: Some(131072),
            },
        }
    }
}

/// Transport-level result of one isolate invocation.
#[derive(Debug)]
pub struct ExecOutcome {
    pub success: bool,
    /// stdout and stderr, merged
    pub output: String,
}

/// Compile succeeds only with a clean exit AND no "error:" in the
/// combined output; compilers exit zero on some diagnostics.
pub fn compile_succeeded(outcome: &ExecOutcome) -> bool {
    outcome.success && !outcome.output.contains("error:")
}

/// Initializes isolate boxes `[0, count)`. Boxes are a kernel-side
/// resource; the slot pool assumes every id it hands out is backed by
/// an initialized box.
pub fn provision_boxes(count: u32) -> Result<()> {
    for box_id in 0..count {
        // drop any leftover state from a previous run
        let _ = Command::new("isolate")
            .args(["--box-id", &box_id.to_string(), "--cleanup"])
            .output();

        let output = Command::new("isolate")
            .args(["--box-id", &box_id.to_string(), "--init"])
            .output()
            .map_err(|e| anyhow!("Failed to spawn isolate --init: {e}"))?;

        if !output.status.success() {
            bail!(
                "isolate --init failed for box {box_id}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
    }

    log::info!("Provisioned {count} sandbox boxes");
    Ok(())
}

pub fn cleanup_boxes(count: u32) {
    for box_id in 0..count {
        let out = Command::new("isolate")
            .args(["--box-id", &box_id.to_string(), "--cleanup"])
            .output();

        if out.is_ok_and(|c| c.status.success()) {
            log::info!("Sandbox box {box_id} cleaned up");
        } else {
            log::error!("Sandbox box {box_id} failed to clean up");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_fails_on_error_marker_despite_clean_exit() {
        let outcome = ExecOutcome {
            success: true,
            output: "cc1: warning: something\nmain.c:3:1: error: expected ';'".to_string(),
        };
        assert!(!compile_succeeded(&outcome));

        // the bare marker alone is enough
        let outcome = ExecOutcome {
            success: true,
            output: "error: ".to_string(),
        };
        assert!(!compile_succeeded(&outcome));
    }

    #[test]
    fn compile_fails_on_nonzero_exit() {
        let outcome = ExecOutcome {
            success: false,
            output: String::new(),
        };
        assert!(!compile_succeeded(&outcome));
    }

    #[test]
    fn compile_succeeds_on_clean_output() {
        let outcome = ExecOutcome {
            success: true,
            output: "warning: unused variable 'x'\n".to_string(),
        };
        assert!(compile_succeeded(&outcome));
    }

    #[test]
    fn error_marker_check_is_case_sensitive() {
        let outcome = ExecOutcome {
            success: true,
            output: "ERROR: loud but harmless".to_string(),
        };
        assert!(compile_succeeded(&outcome));
    }
}
