use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tokio::time;

use super::{ExecOutcome, Phase};

/// Invokes the isolate tool against a provisioned box. The host owns
/// argument construction; callers only pick the phase and the budget.
pub struct IsolateHost {
    /// Scratch directory holding the materialized question scripts;
    /// bind-mounted so `/bin/sh` can reach them from inside the box
    script_folder: PathBuf,
}

impl IsolateHost {
    pub fn new(script_folder: PathBuf) -> Self {
        Self { script_folder }
    }

    /// Runs `script` under the phase's limits inside box `box_id`,
    /// aborting when `budget` runs out. Never returns an error: any
    /// failure to run is an unsuccessful outcome with the cause as
    /// output.
    pub async fn run(
        &self,
        phase: Phase,
        box_id: u32,
        script: &Path,
        code_path: &Path,
        budget: Duration,
    ) -> ExecOutcome {
        let args = self.build_args(phase, box_id, script, code_path);
        log::debug!("isolate {}", args.join(" "));

        let mut command = Command::new("isolate");
        command.args(&args).kill_on_drop(true);

        match time::timeout(budget, command.output()).await {
            Err(_) => ExecOutcome {
                success: false,
                output: "judging deadline exceeded".to_string(),
            },
            Ok(Err(e)) => ExecOutcome {
                success: false,
                output: format!("failed to spawn isolate: {e}"),
            },
            Ok(Ok(output)) => {
                let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
                combined.push_str(&String::from_utf8_lossy(&output.stderr));
                ExecOutcome {
                    success: output.status.success(),
                    output: combined,
                }
            }
        }
    }

    fn build_args(
        &self,
        phase: Phase,
        box_id: u32,
        script: &Path,
        code_path: &Path,
    ) -> Vec<String> {
        let limits = phase.limits();

        let mut args = vec![
            format!("--box-id={box_id}"),
            format!("--fsize={}", limits.fsize_kb),
        ];

        // scripts are written by the host before compile, so only that
        // phase mounts the scratch folder writable
        match phase {
            Phase::Compile => args.push(format!("--dir={}:rw", self.script_folder.display())),
            Phase::Execute => args.push(format!("--dir={}", self.script_folder.display())),
        }

        args.push("--wait".to_string());
        match limits.processes {
            Some(n) => args.push(format!("--processes={n}")),
            None => args.push("--processes".to_string()),
        }
        args.push(format!("--open-files={}", limits.open_files));
        args.push("--env=PATH".to_string());
        args.push("--stderr-to-stdout".to_string());

        if let Some(t) = limits.cpu_time_s {
            args.push(format!("--time={t}"));
        }
        if let Some(t) = limits.wall_time_s {
            args.push(format!("--wall-time={t}"));
        }
        if let Some(m) = limits.memory_kb {
            args.push(format!("--mem={m}"));
        }

        args.push(format!("--chdir={}", code_path.display()));
        args.push(format!("--dir={}:rw", code_path.display()));
        args.push(format!("--env=CODE_PATH={}", code_path.display()));

        args.push("--run".to_string());
        args.push("--".to_string());
        args.push("/bin/sh".to_string());
        args.push(script.display().to_string());

        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> IsolateHost {
        IsolateHost::new(PathBuf::from("/srv/scripts"))
    }

    #[test]
    fn compile_args_leave_runtime_limits_off() {
        let args = host().build_args(
            Phase::Compile,
            3,
            Path::new("/srv/scripts/abc.sh"),
            Path::new("/srv/repos/alice/sol-q7/u1"),
        );

        assert!(args.contains(&"--box-id=3".to_string()));
        assert!(args.contains(&"--fsize=5120".to_string()));
        assert!(args.contains(&"--dir=/srv/scripts:rw".to_string()));
        assert!(args.contains(&"--processes".to_string()));
        assert!(args.contains(&"--open-files=0".to_string()));
        assert!(args.contains(&"--stderr-to-stdout".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--time=")));
        assert!(!args.iter().any(|a| a.starts_with("--wall-time=")));
        assert!(!args.iter().any(|a| a.starts_with("--mem=")));

        assert!(args.contains(&"--chdir=/srv/repos/alice/sol-q7/u1".to_string()));
        assert!(args.contains(&"--dir=/srv/repos/alice/sol-q7/u1:rw".to_string()));
        assert!(args.contains(&"--env=CODE_PATH=/srv/repos/alice/sol-q7/u1".to_string()));

        let tail = &args[args.len() - 3..];
        assert_eq!(tail, ["--", "/bin/sh", "/srv/scripts/abc.sh"]);
    }

    #[test]
    fn execute_args_apply_runtime_limits() {
        let args = host().build_args(
            Phase::Execute,
            0,
            Path::new("/srv/scripts/def.sh"),
            Path::new("/srv/repos/alice/sol-q7/u1"),
        );

        assert!(args.contains(&"--processes=100".to_string()));
        assert!(args.contains(&"--time=1".to_string()));
        assert!(args.contains(&"--wall-time=2".to_string()));
        assert!(args.contains(&"--mem=131072".to_string()));
        // scratch folder is read-only during execute
        assert!(args.contains(&"--dir=/srv/scripts".to_string()));
        assert!(!args.contains(&"--dir=/srv/scripts:rw".to_string()));
    }
}
