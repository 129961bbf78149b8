/*
 * 5D Labs Agent Platform - Adaptive Learning Controller
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Learning Controller Service - Kubernetes controller for `LanguageAgent` CRDs
//!
//! This service adapts agent code over time by:
//! - Mining execution traces and failure events for learnable patterns
//! - Publishing versioned code artifacts and rolling them out with health checks
//! - Re-synthesizing crashing agents with bounded exponential backoff
//! - Providing health and metrics endpoints

use axum::{extract::State, response::Json, routing::get, Router};
use learning_controller::artifacts::ConfigMapArtifactStore;
use learning_controller::events::KubeEventPublisher;
use learning_controller::metrics::LearningMetrics;
use learning_controller::synthesis::{HttpSynthesizer, Synthesizer, UnavailableSynthesizer};
use learning_controller::tasks::config::{ControllerConfig, TelemetryBackend};
use learning_controller::tasks::{
    config_path_from_env, load_controller_config, run_learning_controller, types::Context,
};
use learning_controller::telemetry::{NoopTraceAdapter, SignozTraceAdapter, TraceAdapter};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer,
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const CONTROLLER_NAME: &str = "agent-controller";
const TRACE_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct AppState {
    metrics: Arc<LearningMetrics>,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,learning_controller=debug".into());

    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

fn build_synthesizer(config: &ControllerConfig) -> Arc<dyn Synthesizer> {
    let Some(endpoint) = config.synthesis.endpoint.as_deref() else {
        warn!("No synthesis endpoint configured, learned code will use fallback templates");
        return Arc::new(UnavailableSynthesizer);
    };

    match HttpSynthesizer::new(endpoint, Duration::from_secs(config.synthesis.timeout_seconds)) {
        Ok(synth) => {
            info!("Using synthesis service at {}", endpoint);
            Arc::new(synth)
        }
        Err(e) => {
            error!("Invalid synthesis configuration, falling back to templates: {}", e);
            Arc::new(UnavailableSynthesizer)
        }
    }
}

fn build_trace_adapter(config: &ControllerConfig) -> Arc<dyn TraceAdapter> {
    let telemetry = &config.telemetry;
    match (telemetry.backend, telemetry.endpoint.as_deref()) {
        (TelemetryBackend::Signoz, Some(endpoint)) => {
            let api_key = std::env::var(&telemetry.api_key_env).unwrap_or_else(|_| {
                warn!("{} is not set, querying SigNoz without an API key", telemetry.api_key_env);
                String::new()
            });
            match SignozTraceAdapter::new(endpoint, api_key, TRACE_QUERY_TIMEOUT) {
                Ok(adapter) => {
                    info!("Using SigNoz trace backend at {}", endpoint);
                    Arc::new(adapter)
                }
                Err(e) => {
                    error!("Failed to create SigNoz adapter, trace learning disabled: {}", e);
                    Arc::new(NoopTraceAdapter)
                }
            }
        }
        _ => {
            info!("No trace backend configured, trace-driven learning disabled");
            Arc::new(NoopTraceAdapter)
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    info!(
        "Starting 5D Labs Learning Controller v{}",
        env!("CARGO_PKG_VERSION")
    );

    // Initialize Kubernetes client and controller
    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let namespace =
        std::env::var("WATCH_NAMESPACE").unwrap_or_else(|_| client.default_namespace().to_string());
    let config = Arc::new(load_controller_config(&config_path_from_env())?);
    let metrics = Arc::new(LearningMetrics::default());

    let context = Arc::new(Context {
        client: client.clone(),
        namespace: namespace.clone(),
        config: config.clone(),
        synthesizer: build_synthesizer(&config),
        artifacts: Arc::new(ConfigMapArtifactStore::new(client.clone(), &namespace)),
        traces: build_trace_adapter(&config),
        events: Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME)),
        metrics: metrics.clone(),
    });

    // Start the controller in the background
    let controller_handle = tokio::spawn(async move {
        if let Err(e) = run_learning_controller(context).await {
            error!("Controller error: {}", e);
        }
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                        .on_request(DefaultOnRequest::new().level(Level::INFO))
                        .on_response(DefaultOnResponse::new().level(Level::INFO)),
                )
                .layer(CorsLayer::permissive())
                .layer(TimeoutLayer::new(Duration::from_secs(60))),
        )
        .with_state(AppState { metrics });

    let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
    info!("Controller HTTP server listening on 0.0.0.0:8080");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    controller_handle.abort();
    info!("Controller service stopped");

    Ok(())
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": CONTROLLER_NAME,
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check() -> Json<Value> {
    Json(json!({
        "status": "ready",
        "service": CONTROLLER_NAME,
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn metrics_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "service": CONTROLLER_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "learning": state.metrics.snapshot()
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
