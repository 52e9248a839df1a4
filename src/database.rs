use std::fs;
use std::path::{Path, PathBuf};

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::create_timestamp;

const DATABASE_NAME: &str = "gradebox.sqlite3";

/// Internal judging status. The wire contract is a single REAL column
/// whose negative values encode phase and failure, so consumers that
/// only render a latest-status view need one field; internally the
/// status is kept as a variant and projected on write.
#[derive(Debug, Clone, PartialEq)]
pub enum JudgeStatus {
    /// Created by the enqueue path, not yet picked up
    Queued,
    /// Inside the judging pipeline
    Running,
    /// Clone, copy, read or database failure; the message carries the cause
    InfraFail(String),
    /// Compile exited non-zero or emitted "error:"; payload is the compiler output
    CompileFail(String),
    /// Parsed result from the question's own scripts
    Success(f64, String),
}

impl JudgeStatus {
    pub fn score(&self) -> f64 {
        match self {
            Self::Queued => -3.0,
            Self::Running => -1.0,
            Self::InfraFail(_) => -2.0,
            Self::CompileFail(_) => 0.0,
            Self::Success(score, _) => *score,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Queued => "Waiting for judging...".to_string(),
            Self::Running => "Judging...".to_string(),
            Self::InfraFail(cause) => cause.clone(),
            Self::CompileFail(output) => format!("Compilation Failed:\n{output}"),
            Self::Success(_, message) => message.clone(),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct Question {
    pub id: i64,
    pub clone_url: String,
    pub is_active: bool,
}

/// The question-authored compile/execute/score triplet.
#[derive(Debug, sqlx::FromRow)]
pub struct TestScripts {
    pub compile_script: String,
    pub execute_script: String,
    pub score_script: String,
}

#[derive(Debug, sqlx::FromRow)]
pub struct SubmissionLink {
    pub id: i64,
    pub user_id: i64,
    pub question_id: i64,
    pub user_repo_path: String,
}

#[derive(Debug, sqlx::FromRow)]
pub struct Submission {
    pub id: i64,
    pub link_id: i64,
    pub judge_time: String,
    pub score: f64,
    pub message: String,
}

pub fn get_db_path() -> Option<PathBuf> {
    use directories::ProjectDirs;

    let proj_dirs = ProjectDirs::from("", "", "gradebox")?;
    let data_dir = proj_dirs.data_local_dir();
    fs::create_dir_all(data_dir).ok()?;

    Some(data_dir.join(DATABASE_NAME))
}

pub async fn init_db(db_path: impl AsRef<Path>) -> sqlx::Result<SqlitePool> {
    let db_url = format!("sqlite://{}?mode=rwc", db_path.as_ref().display()); // rwc = read/write/create
    let db_pool = SqlitePoolOptions::new()
        .max_connections(2)
        .connect(&db_url)
        .await?;

    // PRAGMA statements cannot run inside a transaction
    for pragma_sql in &[
        "PRAGMA foreign_keys = ON;",
        "PRAGMA busy_timeout = 2000;",
        "PRAGMA journal_mode = WAL;",
        "PRAGMA synchronous = NORMAL;",
    ] {
        sqlx::query(pragma_sql).execute(&db_pool).await?;
    }

    let mut tx = db_pool.begin().await?;

    for sql in &[
        r"
        CREATE TABLE IF NOT EXISTS questions (
            id            INTEGER PRIMARY KEY,
            clone_url     TEXT    NOT NULL UNIQUE,
            is_active     INTEGER NOT NULL DEFAULT 1
        );",
        r"
        CREATE TABLE IF NOT EXISTS test_scripts (
            id              INTEGER PRIMARY KEY,
            question_id     INTEGER NOT NULL UNIQUE,
            compile_script  TEXT    NOT NULL,
            execute_script  TEXT    NOT NULL,
            score_script    TEXT    NOT NULL,
            FOREIGN KEY (question_id) REFERENCES questions (id)
        );",
        r"
        CREATE TABLE IF NOT EXISTS submission_links (
            id              INTEGER PRIMARY KEY,
            user_id         INTEGER NOT NULL,
            question_id     INTEGER NOT NULL,
            user_repo_path  TEXT    NOT NULL UNIQUE,
            FOREIGN KEY (question_id) REFERENCES questions (id)
        );",
        r"
        CREATE TABLE IF NOT EXISTS submissions (
            id          INTEGER PRIMARY KEY,
            link_id     INTEGER NOT NULL,
            judge_time  TEXT    NOT NULL,
            score       REAL    NOT NULL,
            message     TEXT    NOT NULL,
            FOREIGN KEY (link_id) REFERENCES submission_links (id)
        );",
        "CREATE INDEX IF NOT EXISTS idx_submissions_link ON submissions(link_id);",
    ] {
        sqlx::query(sql).execute(tx.as_mut()).await?;
    }

    tx.commit().await?;

    log::info!("Initialized database at {}", db_path.as_ref().display());

    Ok(db_pool)
}

pub fn remove_db(db_path: impl AsRef<Path>) {
    // WAL and SHM files might not exist; ignore errors
    let wal_path = format!("{}-wal", db_path.as_ref().display());
    let shm_path = format!("{}-shm", db_path.as_ref().display());
    let _ = fs::remove_file(wal_path);
    let _ = fs::remove_file(shm_path);

    if let Err(e) = fs::remove_file(&db_path) {
        log::warn!(
            "Unable to remove database at {}: {e}",
            db_path.as_ref().display()
        );
    } else {
        log::info!("Removed database at {}", db_path.as_ref().display());
    }
}

/// Creates the queued submission row for a link and returns its id.
pub async fn create_waiting(pool: &SqlitePool, link_id: i64) -> sqlx::Result<i64> {
    let status = JudgeStatus::Queued;
    let result = sqlx::query(
        r"
        INSERT INTO submissions (link_id, judge_time, score, message)
        VALUES (?, ?, ?, ?)
        ",
    )
    .bind(link_id)
    .bind(create_timestamp())
    .bind(status.score())
    .bind(status.message())
    .execute(pool)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Stamps the judge time and flips the row to the running sentinel.
pub async fn mark_running(pool: &SqlitePool, submission_id: i64) -> sqlx::Result<()> {
    let status = JudgeStatus::Running;
    sqlx::query(
        r"
        UPDATE submissions
        SET judge_time = ?, score = ?, message = ?
        WHERE id = ?
        ",
    )
    .bind(create_timestamp())
    .bind(status.score())
    .bind(status.message())
    .bind(submission_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Projects a terminal status onto the submission row. Called exactly
/// once per runner; earlier sentinels are never restored.
pub async fn set_terminal(
    pool: &SqlitePool,
    submission_id: i64,
    status: &JudgeStatus,
) -> sqlx::Result<()> {
    sqlx::query(
        r"
        UPDATE submissions
        SET score = ?, message = ?
        WHERE id = ?
        ",
    )
    .bind(status.score())
    .bind(status.message())
    .bind(submission_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Looks up the question's script triplet by the template repo's clone
/// URL. `None` usually means the scripts are not yet visible; callers
/// treat that as transient.
pub async fn lookup_scripts(
    pool: &SqlitePool,
    question_clone_url: &str,
) -> sqlx::Result<Option<TestScripts>> {
    sqlx::query_as::<_, TestScripts>(
        r"
        SELECT ts.compile_script, ts.execute_script, ts.score_script
        FROM test_scripts ts
        JOIN questions q ON ts.question_id = q.id
        WHERE q.clone_url = ?
        ",
    )
    .bind(question_clone_url)
    .fetch_optional(pool)
    .await
}

pub async fn fetch_active_question(
    pool: &SqlitePool,
    question_id: i64,
) -> sqlx::Result<Option<Question>> {
    sqlx::query_as::<_, Question>(
        r"
        SELECT id, clone_url, is_active
        FROM questions
        WHERE id = ? AND is_active = 1
        ",
    )
    .bind(question_id)
    .fetch_optional(pool)
    .await
}

pub async fn fetch_link(
    pool: &SqlitePool,
    question_id: i64,
    user_id: i64,
) -> sqlx::Result<Option<SubmissionLink>> {
    sqlx::query_as::<_, SubmissionLink>(
        r"
        SELECT id, user_id, question_id, user_repo_path
        FROM submission_links
        WHERE question_id = ? AND user_id = ?
        ",
    )
    .bind(question_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await
}

pub async fn fetch_links_for_question(
    pool: &SqlitePool,
    question_id: i64,
) -> sqlx::Result<Vec<SubmissionLink>> {
    sqlx::query_as::<_, SubmissionLink>(
        r"
        SELECT id, user_id, question_id, user_repo_path
        FROM submission_links
        WHERE question_id = ?
        ORDER BY id
        ",
    )
    .bind(question_id)
    .fetch_all(pool)
    .await
}

pub async fn fetch_submission(
    pool: &SqlitePool,
    submission_id: i64,
) -> sqlx::Result<Option<Submission>> {
    sqlx::query_as::<_, Submission>(
        r"
        SELECT id, link_id, judge_time, score, message
        FROM submissions
        WHERE id = ?
        ",
    )
    .bind(submission_id)
    .fetch_optional(pool)
    .await
}
