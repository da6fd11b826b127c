//! Consume Redis-backed queues to run background jobs.
use std::future::ready;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use tracing::info;

use resque_common::failure::RedisFailureSink;
use resque_common::health::HealthRegistry;
use resque_common::metrics::{serve, setup_metrics_routes};
use resque_common::queue::{Queue, RedisQueue};
use resque_common::registry::{JobRegistry, Perform, PerformError};
use resque_common::store::{Client, RedisClient};
use resque_worker::child;
use resque_worker::config::Config;
use resque_worker::error::WorkerError;
use resque_worker::foreman::{CHILD_PAYLOAD_ENV, CHILD_WORKER_ENV};
use resque_worker::worker::Worker;

/// The built-in smoke-test job: logs its arguments and succeeds.
struct Echo {
    args: Vec<serde_json::Value>,
}

#[async_trait::async_trait]
impl Perform for Echo {
    async fn perform(&self) -> Result<(), PerformError> {
        info!(args = %serde_json::Value::from(self.args.clone()), "echo");
        Ok(())
    }
}

/// Deployments embedding this binary register their own classes here.
fn job_registry() -> Arc<JobRegistry> {
    let mut registry = JobRegistry::new();
    registry.register("Echo", |args| {
        Ok(Box::new(Echo {
            args: args.to_vec(),
        }))
    });
    Arc::new(registry)
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("Invalid configuration:");
    let store: Arc<dyn Client> = Arc::new(RedisClient::new(config.redis_url.clone()));
    let registry = job_registry();

    // A spawned job child performs exactly one payload and exits.
    if let Ok(payload) = std::env::var(CHILD_PAYLOAD_ENV) {
        let worker = Worker::new(store.clone(), Vec::new(), registry)
            .with_failure_sink(Arc::new(RedisFailureSink::new(store)));
        let worker = match std::env::var(CHILD_WORKER_ENV) {
            Ok(id) if !id.is_empty() => worker.with_id(id),
            _ => worker,
        };
        let code = child::run(&worker, &payload).await;
        std::process::exit(code);
    }

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness.register("worker".to_string(), time::Duration::seconds(60));

    let queues: Vec<Arc<dyn Queue>> = config
        .queue_names()
        .into_iter()
        .map(|name| -> Arc<dyn Queue> { Arc::new(RedisQueue::new(name, store.clone())) })
        .collect();
    let mut worker = Worker::new(store.clone(), queues, registry)
        .with_failure_sink(Arc::new(RedisFailureSink::new(store.clone())))
        .with_fork(config.fork_per_job)
        .with_interval(config.poll_interval.0)
        .with_liveness(worker_liveness);

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = setup_metrics_routes(router);
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    worker.work().await?;

    Ok(())
}

pub async fn index() -> &'static str {
    "resque worker"
}
