use std::process::Command;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use gradebox::config::{CliArgs, Config};
use gradebox::database as db;
use gradebox::queue::JobQueue;
use gradebox::sandbox;
use gradebox::slots::SlotPool;
use gradebox::web_server::build_server;
use gradebox::worker::worker_loop;

/// Check if a command exists in the system PATH
fn check_command_exists(command: &str) -> bool {
    Command::new("which")
        .arg(command)
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Check if the current user is root and warn if so
fn check_running_user() {
    if std::env::var("USER").unwrap_or_default() == "root"
        || std::env::var("LOGNAME").unwrap_or_default() == "root"
        || unsafe { libc::getuid() } == 0
    {
        log::warn!("WARNING: Running as root user is not recommended for security reasons!");
        log::warn!("isolate should be installed setuid; run this service as an unprivileged user.");
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let cli = CliArgs::parse();
    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(log_level));

    if !check_command_exists("isolate") {
        log::error!("Required command 'isolate' not found. Please install the isolate sandbox.");
        std::process::exit(1);
    }
    if !check_command_exists("git") {
        log::error!("Required command 'git' not found. Please install Git.");
        std::process::exit(1);
    }
    check_running_user();

    let mut config = Config::from_env().unwrap_or_else(|e| {
        log::error!("Failed to read configuration: {e}");
        std::process::exit(1);
    });
    if let Some(n) = cli.sandboxes {
        config.sandbox_count = n;
    }
    if config.sandbox_count == 0 {
        log::error!("The sandbox pool capacity must not be 0");
        std::process::exit(1);
    }

    let db_path = db::get_db_path().unwrap_or_else(|| {
        log::error!("Failed to determine database path");
        std::process::exit(1);
    });
    if cli.flush_data {
        db::remove_db(&db_path);
    }
    let db_pool = db::init_db(&db_path).await.unwrap_or_else(|e| {
        log::error!("Failed to initialize database: {e}");
        std::process::exit(1);
    });

    sandbox::provision_boxes(config.sandbox_count).unwrap_or_else(|e| {
        log::error!("Failed to provision sandbox boxes: {e}");
        std::process::exit(1);
    });

    let sandbox_count = config.sandbox_count;
    let config = Arc::new(config);
    let db_pool = Arc::new(db_pool);
    let queue = Arc::new(JobQueue::new());
    let slots = SlotPool::new(sandbox_count);
    let shutdown_token = CancellationToken::new();

    // ======= PREPARATION END, EXECUTION START =======

    let mut worker = tokio::spawn(worker_loop(
        Arc::clone(&slots),
        Arc::clone(&queue),
        Arc::clone(&db_pool),
        Arc::clone(&config),
        shutdown_token.clone(),
    ));

    let server = build_server(
        Arc::clone(&config),
        Arc::clone(&db_pool),
        Arc::clone(&queue),
        Arc::clone(&slots),
    )
    .unwrap_or_else(|e| {
        log::error!("Failed to start web server: {e}");
        std::process::exit(1);
    });

    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        res_server = server_task => {
            log::error!("Server terminated unexpectedly: {res_server:?}");
        }
        res_worker = &mut worker => {
            log::error!("The worker loop terminated unexpectedly: {res_worker:?}");
        }
    }

    // 1. Shutdown actix-web server gracefully
    server_handle.stop(true).await;

    // 2. Signal the worker loop; in-flight runners finish under their
    //    own deadlines
    shutdown_token.cancel();
    log::info!("Shutdown signal sent to the worker loop, waiting for it to finish...");

    if !worker.is_finished() {
        if let Err(e) = worker.await {
            if e.is_panic() {
                log::error!("Worker loop panicked: {e:?}");
            } else {
                log::error!("Worker loop finished with error: {e:?}");
            }
        }
    }

    // 3. Return the kernel-side boxes
    sandbox::cleanup_boxes(sandbox_count);

    log::info!("Shutdown complete");
    Ok(())
}
