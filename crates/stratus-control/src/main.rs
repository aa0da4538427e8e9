mod args;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use stratus_backend::{Backend, MemoryBackend};
use stratus_balancer::{strategy::parse_strategy, sync::health_sync_loop, CircuitConfig, LoadBalancer};
use stratus_common::config::SECRET_REF_PREFIX;
use stratus_common::DeploymentConfig;
use stratus_control::{router, AdminState, DeploymentContext, ReleaseStages};
use stratus_pipeline::{LocalSourceFetcher, StaticSecretStore, TagImageBuilder};
use stratus_service::{autoscaler_loop, ManualMetric, MetricSource};
use stratus_topology::Blueprint;

use crate::args::{Args, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let otel = stratus_common::telemetry::init_tracing(
        "stratus",
        args.otlp_endpoint.as_deref(),
        args.otlp_token.as_deref(),
        &args.log_format,
    );

    let config = DeploymentConfig::from_json_file(&args.config)?;

    let result = match args.command {
        Command::Plan => plan(&config),
        Command::Up {
            listen_addr,
            routing_strategy,
            source_token,
            initial_utilization,
        } => {
            up(
                &config,
                &listen_addr,
                &routing_strategy,
                source_token.as_deref(),
                initial_utilization,
            )
            .await
        }
    };

    if let Some(provider) = otel {
        if let Err(e) = provider.shutdown() {
            eprintln!("failed to flush spans: {e}");
        }
    }
    result
}

fn plan(config: &DeploymentConfig) -> anyhow::Result<()> {
    let blueprint = Blueprint::compose(config)?;
    for (i, node) in blueprint.graph.creation_order().iter().enumerate() {
        let deps = node.depends_on.join(", ");
        println!("{:>2}. {:<20} {:<18} [{}]", i + 1, node.key, node.kind().to_string(), deps);
    }
    Ok(())
}

async fn up(
    config: &DeploymentConfig,
    listen_addr: &str,
    routing_strategy: &str,
    source_token: Option<&str>,
    initial_utilization: f64,
) -> anyhow::Result<()> {
    let strategy = parse_strategy(routing_strategy).map_err(anyhow::Error::msg)?;
    let balancer = LoadBalancer::with_strategy(strategy, CircuitConfig::from_env());

    let mut secrets = StaticSecretStore::new();
    match (
        config.source_credential.strip_prefix(SECRET_REF_PREFIX),
        source_token,
    ) {
        (Some(name), Some(token)) => secrets = secrets.with_secret(name, token),
        _ => warn!("source token not set, pipeline runs will fail at the source stage"),
    }

    let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
    let ctx = Arc::new(
        DeploymentContext::bring_up(
            config,
            backend.clone(),
            balancer.clone(),
            ReleaseStages {
                secrets: Arc::new(secrets),
                source: Arc::new(LocalSourceFetcher),
                builder: Arc::new(TagImageBuilder::new()),
            },
        )
        .await
        .context("bring-up failed")?,
    );

    let utilization = Arc::new(ManualMetric::new(initial_utilization));
    let source: Arc<dyn MetricSource> = utilization.clone();
    let autoscaler = tokio::spawn(autoscaler_loop(
        ctx.controller.clone(),
        source,
        Duration::from_secs(config.metric_poll_secs),
        ctx.service_metrics.clone(),
    ));

    let service = ctx.controller.name().to_string();
    let health = tokio::spawn({
        let backend = backend.clone();
        let balancer = balancer.clone();
        async move {
            if let Err(e) = health_sync_loop(backend, balancer, service).await {
                error!(error=%e, "health sync loop exited");
            }
        }
    });

    let app = router(AdminState {
        ctx: ctx.clone(),
        utilization,
    });
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;
    info!(addr = %listen_addr, "admin API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error=%e, "failed to listen for shutdown signal");
            }
            info!("shutdown requested");
        })
        .await?;

    autoscaler.abort();
    health.abort();
    ctx.teardown().await.context("teardown failed")?;
    Ok(())
}
