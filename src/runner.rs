use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tempfile::NamedTempFile;
use tokio::fs;

use crate::config::Config;
use crate::database::{self as db, JudgeStatus, TestScripts};
use crate::queue::{Job, JobQueue};
use crate::sandbox::{self, IsolateHost, Phase};
use crate::slots::SlotGuard;

/// Wall-clock budget covering compile, execute and harvest of one job.
const JOB_DEADLINE: Duration = Duration::from_secs(60);

/// Drives one submission from running to a terminal row. The slot is
/// released and the clone directory removed on every exit path.
pub async fn run_job(
    job: Job,
    slot: SlotGuard,
    db_pool: Arc<SqlitePool>,
    queue: Arc<JobQueue>,
    config: Arc<Config>,
) {
    // Script lookup happens before the job ties up anything else, so a
    // miss can requeue it untouched. This is the only requeue path
    // inside a runner.
    let scripts = match db::lookup_scripts(&db_pool, &job.question_clone_url).await {
        Ok(Some(scripts)) => scripts,
        Ok(None) => {
            log::warn!(
                "no test scripts yet for {}, requeueing submission {}",
                job.question_clone_url,
                job.submission_id
            );
            queue.push(job);
            return;
        }
        Err(e) => {
            log::warn!(
                "script lookup failed for {}, requeueing submission {}: {e}",
                job.question_clone_url,
                job.submission_id
            );
            queue.push(job);
            return;
        }
    };

    let submission_id = job.submission_id;
    let _code_dir = CodeDirGuard::new(job.code_path.clone());

    if let Err(e) = db::mark_running(&db_pool, submission_id).await {
        log::error!("failed to mark submission {submission_id} running: {e}");
    }

    let status = judge(&job, &slot, &scripts, &config).await;

    log::info!(
        "submission {submission_id} finished on box {} with score {}",
        slot.box_id(),
        status.score()
    );

    if let Err(e) = db::set_terminal(&db_pool, submission_id, &status).await {
        // the row stays at the running sentinel
        log::error!("failed to persist result for submission {submission_id}: {e}");
    }
}

async fn judge(job: &Job, slot: &SlotGuard, scripts: &TestScripts, config: &Config) -> JudgeStatus {
    let deadline = Instant::now() + JOB_DEADLINE;

    if let Err(e) = stage_artifacts(&job.code_path, &config.parser_path, &scripts.score_script).await
    {
        return JudgeStatus::InfraFail(format!("{e:#}"));
    }

    let host = IsolateHost::new(config.script_folder.clone());

    let compile_script =
        match write_script(&config.script_folder, scripts.compile_script.as_bytes()).await {
            Ok(script) => script,
            Err(e) => return JudgeStatus::InfraFail(format!("Failed to save script as file: {e}")),
        };
    let outcome = host
        .run(
            Phase::Compile,
            slot.box_id(),
            compile_script.path(),
            &job.code_path,
            remaining(deadline),
        )
        .await;
    drop(compile_script);

    if !sandbox::compile_succeeded(&outcome) {
        return JudgeStatus::CompileFail(outcome.output);
    }

    // the trailing rm keeps build artifacts out of the harvested tree
    let mut execute_body = scripts.execute_script.clone().into_bytes();
    execute_body.extend_from_slice(b"\nrm build -rf");
    let execute_script = match write_script(&config.script_folder, &execute_body).await {
        Ok(script) => script,
        Err(e) => return JudgeStatus::InfraFail(format!("Failed to save script as file: {e}")),
    };
    let outcome = host
        .run(
            Phase::Execute,
            slot.box_id(),
            execute_script.path(),
            &job.code_path,
            remaining(deadline),
        )
        .await;

    if !outcome.success {
        // not terminal by itself; harvest decides from what the
        // script left behind
        log::warn!(
            "execute phase failed for submission {}: {}",
            job.submission_id,
            outcome.output.trim()
        );
    }

    harvest(&job.code_path).await
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

/// Places the scoring toolchain next to the user's code: `utils/` with
/// the parser binary and the question's score sheet.
async fn stage_artifacts(code_path: &Path, parser_path: &Path, score_script: &str) -> Result<()> {
    let utils = code_path.join("utils");
    fs::create_dir_all(&utils)
        .await
        .context("Failed to create utils directory")?;

    let parser_name = parser_path
        .file_name()
        .context("parser path has no file name")?;
    fs::copy(parser_path, utils.join(parser_name))
        .await
        .context("Failed to copy score parser")?;

    fs::write(
        utils.join("score.json"),
        render_score_json(score_script.as_bytes()),
    )
    .await
    .context("Failed to write score.json")?;

    Ok(())
}

/// Pretty-prints the score blob when it parses as JSON; anything else
/// is passed through verbatim.
fn render_score_json(blob: &[u8]) -> Vec<u8> {
    match serde_json::from_slice::<serde_json::Value>(blob) {
        Ok(value) => serde_json::to_vec_pretty(&value).unwrap_or_else(|_| blob.to_vec()),
        Err(_) => blob.to_vec(),
    }
}

/// Reads the score and message the question's execute script wrote into
/// the code directory.
async fn harvest(code_path: &Path) -> JudgeStatus {
    let raw_score = match fs::read_to_string(code_path.join("score.txt")).await {
        Ok(raw) => raw,
        Err(e) => return JudgeStatus::InfraFail(format!("Failed to read score: {e}")),
    };
    let score = match raw_score.trim().parse::<f64>() {
        Ok(score) => score,
        Err(e) => return JudgeStatus::InfraFail(format!("Failed to parse score: {e}")),
    };

    let message = match fs::read_to_string(code_path.join("message.txt")).await {
        Ok(raw) => raw.trim().to_string(),
        Err(e) => return JudgeStatus::InfraFail(format!("Failed to read message: {e}")),
    };

    JudgeStatus::Success(score, message)
}

/// Materializes a question script for `/bin/sh` in the bind-mounted
/// scratch folder; the file disappears when the handle drops.
async fn write_script(dir: &Path, contents: &[u8]) -> std::io::Result<NamedTempFile> {
    fs::create_dir_all(dir).await?;
    let script = tempfile::Builder::new()
        .prefix("script-")
        .suffix(".sh")
        .tempfile_in(dir)?;
    fs::write(script.path(), contents).await?;
    // the box runs the interpreter under another uid
    script
        .as_file()
        .set_permissions(std::fs::Permissions::from_mode(0o644))?;
    Ok(script)
}

/// Removes the per-clone working copy when the runner exits.
struct CodeDirGuard {
    path: PathBuf,
}

impl CodeDirGuard {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Drop for CodeDirGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            log::warn!(
                "failed to remove code directory {}: {e}",
                self.path.display()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use uuid::Uuid;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("gradebox-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn valid_score_json_round_trips() {
        let blob = br#"{"groups":[{"name":"basic","weight": 40 }]}"#;
        let rendered = render_score_json(blob);

        let original: serde_json::Value = serde_json::from_slice(blob).unwrap();
        let reparsed: serde_json::Value = serde_json::from_slice(&rendered).unwrap();
        assert_eq!(original, reparsed);
        // pretty form is indented
        assert!(std::str::from_utf8(&rendered).unwrap().contains("\n  "));
    }

    #[test]
    fn invalid_score_json_is_written_verbatim() {
        let blob = b"not json { at all";
        assert_eq!(render_score_json(blob), blob.to_vec());
    }

    #[tokio::test]
    async fn stage_artifacts_copies_parser_and_score_sheet() {
        let dir = scratch_dir();
        let parser = dir.join("grp_parser");
        std::fs::write(&parser, b"#!/bin/sh\n").unwrap();
        let code = dir.join("code");
        std::fs::create_dir_all(&code).unwrap();

        stage_artifacts(&code, &parser, r#"{"total": 100}"#)
            .await
            .unwrap();

        assert!(code.join("utils/grp_parser").exists());
        let sheet = std::fs::read_to_string(code.join("utils/score.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&sheet).unwrap();
        assert_eq!(value["total"], 100);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn stage_artifacts_fails_without_parser() {
        let dir = scratch_dir();
        let code = dir.join("code");
        std::fs::create_dir_all(&code).unwrap();

        let err = stage_artifacts(&code, &dir.join("missing_parser"), "{}")
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("Failed to copy score parser"));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn harvest_trims_whitespace_around_the_score() {
        let dir = scratch_dir();
        std::fs::write(dir.join("score.txt"), "  85.5\n").unwrap();
        std::fs::write(dir.join("message.txt"), " OK \n").unwrap();

        assert_eq!(
            harvest(&dir).await,
            JudgeStatus::Success(85.5, "OK".to_string())
        );

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn harvest_reports_missing_score_file() {
        let dir = scratch_dir();

        match harvest(&dir).await {
            JudgeStatus::InfraFail(cause) => assert!(cause.contains("Failed to read score")),
            other => panic!("unexpected status: {other:?}"),
        }

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn harvest_reports_unparsable_score() {
        let dir = scratch_dir();
        std::fs::write(dir.join("score.txt"), "eighty five\n").unwrap();
        std::fs::write(dir.join("message.txt"), "OK\n").unwrap();

        match harvest(&dir).await {
            JudgeStatus::InfraFail(cause) => assert!(cause.contains("Failed to parse score")),
            other => panic!("unexpected status: {other:?}"),
        }

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn materialized_script_is_removed_on_drop() {
        let dir = scratch_dir();
        let script = write_script(&dir, b"echo hi\n").await.unwrap();
        let path = script.path().to_path_buf();
        assert!(path.exists());
        assert_eq!(path.extension().unwrap(), "sh");
        assert_eq!(std::fs::read(&path).unwrap(), b"echo hi\n");

        drop(script);
        assert!(!path.exists());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn code_dir_guard_removes_the_tree() {
        let dir = scratch_dir();
        let code = dir.join("code");
        std::fs::create_dir_all(code.join("sub")).unwrap();
        std::fs::write(code.join("sub/file"), b"x").unwrap();

        drop(CodeDirGuard::new(code.clone()));
        assert!(!code.exists());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
