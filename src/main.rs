/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/main.rs
*
* This file is the main entry point for the Samsahai operator. It is
* responsible for setting up and running the controller manager, which hosts
* the reconciliation loops for every resource kind the operator drives.
*
* Architecture:
* 1.  **Settings**: loaded from the YAML file named by `SAMSAHAI_CONFIG` and
*     environment overrides. `--print-crds` prints the CRDs and exits.
* 2.  **Telemetry**: `tracing` with a JSON formatter and an OpenTelemetry
*     layer exporting spans to Jaeger.
* 3.  **Shared Context**: one `Context` over the live cluster, shared by every
*     controller behind an `Arc`.
* 4.  **Concurrent Execution**: the four controllers (`ActivePromotion`,
*     `PullRequestQueue`, `PullRequestTrigger`, `Queue`) and the `/metrics`
*     server run side by side under `tokio::join!`.
*
* SPDX-License-Identifier: Apache-2.0
*/

use anyhow::Context as _;
use futures::stream::StreamExt;
use kube::{Api, Client, CustomResourceExt};
use kube_runtime::controller::Config as ControllerConfig;
use kube_runtime::watcher::Config as WatcherConfig;
use kube_runtime::Controller;
use opentelemetry::global;
use prometheus::{Encoder, Registry, TextEncoder};
use samsahai_operator::context::Context;
use samsahai_operator::controllers::{
    active_promotion_controller, pull_request_queue_controller, pull_request_trigger_controller,
    queue_controller,
};
use samsahai_operator::crds::{
    ActivePromotion, ActivePromotionHistory, Config, PullRequestQueue, PullRequestQueueHistory, PullRequestTrigger,
    Queue, StableComponent, Team,
};
use samsahai_operator::metrics;
use samsahai_operator::settings::Settings;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use warp::http::StatusCode;
use warp::Filter;

/// Initializes the OpenTelemetry pipeline for Jaeger.
fn init_telemetry(service_name: &str) -> anyhow::Result<()> {
    let tracer = opentelemetry_jaeger::new_agent_pipeline()
        .with_service_name(service_name)
        .install_batch(opentelemetry_sdk::runtime::Tokio)
        .context("Failed to install the Jaeger pipeline")?;

    let telemetry = tracing_opentelemetry::layer().with_tracer(tracer);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().json();

    tracing_subscriber::registry()
        .with(filter)
        .with(telemetry)
        .with(fmt_layer)
        .try_init()
        .context("Failed to install the tracing subscriber")?;
    Ok(())
}

fn print_crds() -> anyhow::Result<()> {
    let crds = [
        ActivePromotion::crd(),
        ActivePromotionHistory::crd(),
        PullRequestQueue::crd(),
        PullRequestQueueHistory::crd(),
        PullRequestTrigger::crd(),
        Queue::crd(),
        StableComponent::crd(),
        Team::crd(),
        Config::crd(),
    ];
    for crd in &crds {
        print!("---\n{}", serde_yaml::to_string(crd)?);
    }
    Ok(())
}

/// Renders the metrics into the Prometheus text format.
async fn metrics_handler(registry: Arc<Registry>) -> Result<Box<dyn warp::Reply>, warp::Rejection> {
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        warn!(error = %e, "Failed to encode metrics.");
        return Ok(Box::new(StatusCode::INTERNAL_SERVER_ERROR));
    }
    let response = String::from_utf8_lossy(&buffer).into_owned();
    Ok(Box::new(warp::reply::with_header(
        response,
        "Content-Type",
        encoder.format_type(),
    )))
}

/// Runs the HTTP server to expose the /metrics endpoint.
async fn run_metrics_server(registry: Arc<Registry>, port: u16) {
    let metrics_route = warp::path("metrics")
        .and(warp::get())
        .and(warp::any().map(move || Arc::clone(&registry)))
        .and_then(metrics_handler);

    info!(port, "Starting metrics server.");
    warp::serve(metrics_route).run(([0, 0, 0, 0], port)).await;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::args().any(|a| a == "--print-crds") {
        return print_crds();
    }

    let settings = Settings::load()?;
    init_telemetry(&settings.service_name)?;
    info!("Telemetry initialized.");

    let client = Client::try_default()
        .await
        .context("Failed to create the Kubernetes client")?;
    let port = settings.metrics_port;
    let controller_config = ControllerConfig::default().concurrency(settings.workers);
    let context = Arc::new(Context::from_client(client.clone(), settings)?);

    let registry = Arc::new(metrics::create_and_register_metrics()?);
    info!("Custom metrics registered.");

    info!("Samsahai operator starting...");

    tokio::join!(
        run_metrics_server(registry, port),
        Controller::new(Api::<ActivePromotion>::all(client.clone()), WatcherConfig::default())
            .with_config(controller_config.clone())
            .run(
                active_promotion_controller::reconcile,
                active_promotion_controller::error_policy,
                context.clone(),
            )
            .for_each(|res| async move {
                match res {
                    Ok(o) => info!("Reconciled ActivePromotion: {:?}", o),
                    Err(e) => error!("ActivePromotion reconcile error: {}", e),
                }
            }),
        Controller::new(Api::<PullRequestQueue>::all(client.clone()), WatcherConfig::default())
            .with_config(controller_config.clone())
            .run(
                pull_request_queue_controller::reconcile,
                pull_request_queue_controller::error_policy,
                context.clone(),
            )
            .for_each(|res| async move {
                match res {
                    Ok(o) => info!("Reconciled PullRequestQueue: {:?}", o),
                    Err(e) => error!("PullRequestQueue reconcile error: {}", e),
                }
            }),
        Controller::new(Api::<PullRequestTrigger>::all(client.clone()), WatcherConfig::default())
            .with_config(controller_config.clone())
            .run(
                pull_request_trigger_controller::reconcile,
                pull_request_trigger_controller::error_policy,
                context.clone(),
            )
            .for_each(|res| async move {
                match res {
                    Ok(o) => info!("Reconciled PullRequestTrigger: {:?}", o),
                    Err(e) => error!("PullRequestTrigger reconcile error: {}", e),
                }
            }),
        Controller::new(Api::<Queue>::all(client), WatcherConfig::default())
            .with_config(controller_config)
            .run(queue_controller::reconcile, queue_controller::error_policy, context.clone())
            .for_each(|res| async move {
                match res {
                    Ok(o) => info!("Reconciled Queue: {:?}", o),
                    Err(e) => error!("Queue reconcile error: {}", e),
                }
            })
    );

    info!("Samsahai operator shutting down.");
    global::shutdown_tracer_provider();
    Ok(())
}
