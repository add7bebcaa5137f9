use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use grader::config::{CliArgs, Config, DatabaseConfig};
use grader::database::{self as db, SqliteExerciseRepository};
use grader::exercise::{ConfigExerciseRepository, Exercise, ExerciseRepository};
use grader::grading::GradingOrchestrator;
use grader::queue::GradingQueue;
use grader::web_server::build_server;
use grader::worker::worker;

async fn open_repository(
    database: Option<DatabaseConfig>,
    exercises: Vec<Exercise>,
) -> anyhow::Result<Arc<dyn ExerciseRepository>> {
    let Some(database) = database else {
        log::info!("Serving {} exercises from the configuration", exercises.len());
        return Ok(Arc::new(ConfigExerciseRepository::new(exercises)));
    };

    let db_path = match database.path {
        Some(path) => path,
        None => db::get_db_path()?,
    };
    let pool = db::init_db(&db_path)
        .await
        .context("Failed to initialize database")?;
    if !exercises.is_empty() {
        db::seed_exercises(&pool, &exercises).await?;
    }
    Ok(Arc::new(SqliteExerciseRepository::new(pool)))
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let n_threads = cli.threads;

    if n_threads == 0 {
        bail!("The number of worker threads must not be 0");
    }

    let Config {
        server: server_config,
        sandbox: sandbox_config,
        database: database_config,
        exercises,
    } = cli.to_config().context("Failed to load configuration")?;

    let repository = open_repository(database_config, exercises).await?;
    let orchestrator = Arc::new(GradingOrchestrator::new(repository, sandbox_config));
    let queue = Arc::new(GradingQueue::new());
    let shutdown_token = CancellationToken::new();

    // ======= PREPARATION END, EXECUTION START =======

    let mut workers = JoinSet::new();
    for i in 1..=n_threads {
        workers.spawn(worker(
            i,
            orchestrator.clone(),
            queue.clone(),
            shutdown_token.clone(),
        ));
    }

    let server = build_server(server_config, queue).context("Failed to build server")?;

    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        res_server = server_task => {
            log::error!("Server terminated unexpectedly: {:?}", res_server);
        }
        Some(res_worker) = workers.join_next() => {
            log::error!("A worker terminated unexpectedly: {:?}", res_worker);
        }
    }

    // 1. Shutdown actix-web server gracefully
    server_handle.stop(true).await;

    // 2. Broadcast shutdown signal to workers
    shutdown_token.cancel();
    log::info!("Shutdown signal sent to workers, waiting for them to finish...");

    // 3. Wait until every worker terminates
    while let Some(res) = workers.join_next().await {
        match res {
            Ok(Err(e)) => log::error!("Worker finished with error: {e:#}"),
            Err(e) if e.is_panic() => log::error!("Worker handle panicked: {:?}", e),
            Err(e) => log::error!("Worker handle finished with error: {:?}", e),
            Ok(Ok(())) => {}
        }
    }

    log::info!("Shutdown complete");
    Ok(())
}
