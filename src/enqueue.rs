use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use sqlx::SqlitePool;
use tokio::fs;
use tokio::process::Command;
use tokio::task::JoinSet;

use crate::config::Config;
use crate::database::{self as db, JudgeStatus};
use crate::queue::{Job, JobQueue};

/// Admission failures the HTTP boundary maps to status codes.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("question not found or not active")]
    QuestionNotFound,
    #[error("no submission link for this user and question")]
    LinkNotFound,
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Queues a rescore of one user's solution. Returns as soon as the
/// waiting submission row exists; cloning and judging continue
/// asynchronously.
pub async fn enqueue_single(
    db_pool: &Arc<SqlitePool>,
    queue: &Arc<JobQueue>,
    config: &Arc<Config>,
    question_id: i64,
    user_id: i64,
) -> Result<(), EnqueueError> {
    let question = db::fetch_active_question(db_pool, question_id)
        .await?
        .ok_or(EnqueueError::QuestionNotFound)?;
    let link = db::fetch_link(db_pool, question_id, user_id)
        .await?
        .ok_or(EnqueueError::LinkNotFound)?;

    let submission_id = db::create_waiting(db_pool, link.id).await?;

    tokio::spawn(clone_and_enqueue(
        Arc::clone(db_pool),
        Arc::clone(queue),
        Arc::clone(config),
        question.clone_url,
        link.user_repo_path,
        submission_id,
    ));

    Ok(())
}

/// Queues a rescore for every submission link bound to the question.
/// Clones run in parallel; the call returns once all of them have been
/// attempted. Returns the number of submissions queued.
pub async fn enqueue_bulk(
    db_pool: &Arc<SqlitePool>,
    queue: &Arc<JobQueue>,
    config: &Arc<Config>,
    question_id: i64,
) -> Result<usize, EnqueueError> {
    let question = db::fetch_active_question(db_pool, question_id)
        .await?
        .ok_or(EnqueueError::QuestionNotFound)?;
    let links = db::fetch_links_for_question(db_pool, question_id).await?;

    let mut clones = JoinSet::new();
    for link in links {
        let submission_id = db::create_waiting(db_pool, link.id).await?;
        clones.spawn(clone_and_enqueue(
            Arc::clone(db_pool),
            Arc::clone(queue),
            Arc::clone(config),
            question.clone_url.clone(),
            link.user_repo_path,
            submission_id,
        ));
    }

    let count = clones.len();
    while clones.join_next().await.is_some() {}

    Ok(count)
}

/// Clones the user repo into a uuid-suffixed directory and hands the
/// job to the queue. A failed clone is terminal: the submission is
/// marked failed and nothing is enqueued.
async fn clone_and_enqueue(
    db_pool: Arc<SqlitePool>,
    queue: Arc<JobQueue>,
    config: Arc<Config>,
    question_clone_url: String,
    user_repo_path: String,
    submission_id: i64,
) {
    let code_path = config.clone_target(&user_repo_path);

    match clone_repo(&config.clone_url(&user_repo_path), &code_path).await {
        Ok(()) => {
            // scripts run in the box under another uid
            widen_permissions(&code_path).await;

            log::info!("submission {submission_id} cloned into {}", code_path.display());
            queue.push(Job {
                question_clone_url,
                code_path,
                submission_id,
            });
        }
        Err(e) => {
            log::error!("clone failed for submission {submission_id}: {e:#}");
            let _ = fs::remove_dir_all(&code_path).await;

            let status = JudgeStatus::InfraFail("Failed to clone repository".to_string());
            if let Err(e) = db::set_terminal(&db_pool, submission_id, &status).await {
                log::error!("failed to mark submission {submission_id} as clone failure: {e}");
            }
        }
    }
}

async fn clone_repo(url: &str, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .await
            .context("failed to create clone parent directory")?;
    }

    let output = Command::new("git")
        .arg("clone")
        .arg(url)
        .arg(target)
        .kill_on_drop(true)
        .output()
        .await
        .context("failed to spawn git")?;

    if !output.status.success() {
        bail!(
            "git clone exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(())
}

async fn widen_permissions(path: &Path) {
    if let Err(e) = fs::set_permissions(path, std::fs::Permissions::from_mode(0o777)).await {
        log::warn!("failed to chmod {}: {e}", path.display());
    }
}
