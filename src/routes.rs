use actix_web::error::{InternalError, JsonPayloadError, QueryPayloadError};
use actix_web::{get, post, web, HttpRequest, HttpResponse, Responder};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::config::Config;
use crate::database as db;
use crate::enqueue::{self, EnqueueError};
use crate::queue::JobQueue;
use crate::slots::SlotPool;

#[derive(Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub message: String,
}

impl ApiResponse {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct RescoreRequest {
    pub user_id: i64,
}

/// The read side of the sentinel contract: consumers get the raw
/// numeric code plus the diagnostic message.
#[derive(Serialize, Deserialize)]
pub struct SubmissionView {
    pub score: f64,
    pub message: String,
    pub judge_time: String,
}

#[derive(Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub queued: usize,
    pub free_slots: usize,
    pub capacity: usize,
}

pub fn json_error_handler(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = HttpResponse::BadRequest().json(ApiResponse::fail("Invalid request payload"));
    InternalError::from_response(err, response).into()
}

pub fn query_error_handler(err: QueryPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = HttpResponse::BadRequest().json(ApiResponse::fail("Invalid query parameters"));
    InternalError::from_response(err, response).into()
}

#[post("/api/score/{question_id}/rescore")]
pub async fn rescore_user_handler(
    path: web::Path<i64>,
    body: web::Json<RescoreRequest>,
    db_pool: web::Data<SqlitePool>,
    queue: web::Data<JobQueue>,
    config: web::Data<Config>,
) -> impl Responder {
    let question_id = path.into_inner();

    match enqueue::enqueue_single(
        &db_pool.into_inner(),
        &queue.into_inner(),
        &config.into_inner(),
        question_id,
        body.user_id,
    )
    .await
    {
        Ok(()) => HttpResponse::Ok().json(ApiResponse::ok("Re-scoring the question")),
        Err(EnqueueError::QuestionNotFound) => {
            HttpResponse::NotFound().json(ApiResponse::fail("Question not found"))
        }
        Err(EnqueueError::LinkNotFound) => {
            HttpResponse::NotFound().json(ApiResponse::fail("No submission link for this user"))
        }
        Err(EnqueueError::Db(e)) => {
            log::error!("rescore enqueue failed for question {question_id}: {e}");
            HttpResponse::ServiceUnavailable()
                .json(ApiResponse::fail("Failed to re-score the question"))
        }
    }
}

#[post("/api/score/admin/{question_id}/rescore")]
pub async fn rescore_question_handler(
    path: web::Path<i64>,
    db_pool: web::Data<SqlitePool>,
    queue: web::Data<JobQueue>,
    config: web::Data<Config>,
) -> impl Responder {
    let question_id = path.into_inner();

    match enqueue::enqueue_bulk(
        &db_pool.into_inner(),
        &queue.into_inner(),
        &config.into_inner(),
        question_id,
    )
    .await
    {
        Ok(count) => {
            HttpResponse::Ok().json(ApiResponse::ok(format!("Re-scoring {count} submissions")))
        }
        Err(EnqueueError::QuestionNotFound) => {
            HttpResponse::NotFound().json(ApiResponse::fail("Question not found"))
        }
        Err(EnqueueError::LinkNotFound) => {
            HttpResponse::NotFound().json(ApiResponse::fail("No submission links"))
        }
        Err(EnqueueError::Db(e)) => {
            log::error!("bulk rescore enqueue failed for question {question_id}: {e}");
            HttpResponse::ServiceUnavailable()
                .json(ApiResponse::fail("Failed to re-score the question"))
        }
    }
}

#[get("/api/score/submission/{submission_id}")]
pub async fn get_submission_handler(
    path: web::Path<i64>,
    db_pool: web::Data<SqlitePool>,
) -> impl Responder {
    let submission_id = path.into_inner();

    match db::fetch_submission(&db_pool, submission_id).await {
        Ok(Some(submission)) => HttpResponse::Ok().json(SubmissionView {
            score: submission.score,
            message: submission.message,
            judge_time: submission.judge_time,
        }),
        Ok(None) => HttpResponse::NotFound().json(ApiResponse::fail("Score not found")),
        Err(e) => {
            log::error!("failed to fetch submission {submission_id}: {e}");
            HttpResponse::ServiceUnavailable().json(ApiResponse::fail("Failed to get score"))
        }
    }
}

#[get("/api/status")]
pub async fn status_handler(
    queue: web::Data<JobQueue>,
    slots: web::Data<SlotPool>,
) -> impl Responder {
    HttpResponse::Ok().json(SchedulerStatus {
        queued: queue.len(),
        free_slots: slots.available(),
        capacity: slots.capacity(),
    })
}
