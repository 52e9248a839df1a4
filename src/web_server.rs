use std::sync::Arc;

use actix_web::{dev::Server, middleware, web, App, HttpServer};
use sqlx::SqlitePool;

use crate::config::Config;
use crate::queue::JobQueue;
use crate::routes::{
    get_submission_handler, json_error_handler, query_error_handler, rescore_question_handler,
    rescore_user_handler, status_handler,
};
use crate::slots::SlotPool;

pub fn build_server(
    config: Arc<Config>,
    db_pool: Arc<SqlitePool>,
    queue: Arc<JobQueue>,
    slots: Arc<SlotPool>,
) -> std::io::Result<Server> {
    let bind_address = config.bind_address.clone();
    let bind_port = config.bind_port;

    let db_pool = web::Data::from(db_pool);
    let queue = web::Data::from(queue);
    let slots = web::Data::from(slots);
    let config = web::Data::from(config);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(db_pool.clone())
            .app_data(queue.clone())
            .app_data(slots.clone())
            .app_data(config.clone())
            .app_data(web::JsonConfig::default().error_handler(json_error_handler))
            .app_data(web::QueryConfig::default().error_handler(query_error_handler))
            .wrap(middleware::Logger::default())
            .service(rescore_user_handler)
            .service(rescore_question_handler)
            .service(get_submission_handler)
            .service(status_handler)
    })
    .bind((bind_address, bind_port))?
    .run();

    Ok(server)
}
