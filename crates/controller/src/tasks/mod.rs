use crate::crds::LanguageAgent;
use crate::learning::reconcile_language_agent;
use futures::StreamExt;
use kube::api::ListParams;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Api, ResourceExt};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, Instrument};

pub mod config;
pub mod types;

// Re-export commonly used items
pub use config::ControllerConfig;
pub use types::{Context, Error, Result};

/// Default location of the mounted controller configuration
pub const DEFAULT_CONFIG_PATH: &str = "/config/config.yaml";

/// Environment variable overriding [`DEFAULT_CONFIG_PATH`]
pub const CONFIG_PATH_ENV: &str = "CONTROLLER_CONFIG_PATH";

/// Requeue delay after a failed reconcile
const ERROR_REQUEUE: Duration = Duration::from_secs(30);

/// Requeue delay once self-healing has given up on an agent
const EXHAUSTED_REQUEUE: Duration = Duration::from_secs(600);

/// Configuration file to load: the override when it points at an existing
/// file, otherwise the mounted default
pub fn config_path_from_env() -> String {
    std::env::var(CONFIG_PATH_ENV)
        .ok()
        .filter(|path| Path::new(path).exists())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
}

/// Load and validate the controller configuration, falling back to defaults
/// when the mounted file is missing or unreadable
pub fn load_controller_config(config_path: &str) -> Result<ControllerConfig> {
    debug!("Loading controller configuration from {}", config_path);

    let config = match ControllerConfig::from_mounted_file(config_path) {
        Ok(cfg) => {
            debug!("Successfully loaded controller configuration");
            cfg
        }
        Err(e) => {
            error!("Failed to load configuration, using defaults: {}", e);
            ControllerConfig::default()
        }
    };

    if let Err(validation_error) = config.validate() {
        error!("Configuration validation failed: {}", validation_error);
        return Err(Error::ConfigError(validation_error.to_string()));
    }
    debug!("Configuration validation passed");
    Ok(config)
}

/// Main entry point for the learning controller
#[instrument(skip(context), fields(namespace = %context.namespace))]
pub async fn run_learning_controller(context: Arc<Context>) -> Result<()> {
    let namespace = context.namespace.clone();
    info!("Starting learning controller in namespace: {}", namespace);

    let agents: Api<LanguageAgent> = Api::namespaced(context.client.clone(), &namespace);

    // Startup visibility: list existing agents the controller should observe
    match agents.list(&ListParams::default()).await {
        Ok(list) => {
            info!(
                "Controller startup: found {} LanguageAgent(s) in namespace {}",
                list.items.len(),
                namespace
            );
            for agent in &list.items {
                let phase = agent
                    .status
                    .as_ref()
                    .and_then(|s| s.phase.clone())
                    .unwrap_or_default();
                debug!("Existing LanguageAgent: name={}, phase='{}'", agent.name_any(), phase);
            }
        }
        Err(e) => {
            error!("Failed to list LanguageAgents at startup: {}", e);
        }
    }

    Controller::new(agents, Config::default().any_semantic())
        .run(reconcile_language_agent, error_policy, context)
        .for_each(|reconciliation_result| {
            let span = tracing::info_span!("learning_reconciliation_result");
            async move {
                match reconciliation_result {
                    Ok(agent) => {
                        info!(resource = ?agent, "LanguageAgent reconciliation successful");
                    }
                    Err(reconciliation_err) => {
                        error!(error = ?reconciliation_err, "LanguageAgent reconciliation error");
                    }
                }
            }
            .instrument(span)
        })
        .await;

    info!("Learning controller shutting down");
    Ok(())
}

/// Error policy: exhausted agents wait for a spec change or a long requeue,
/// everything else retries shortly
#[instrument(skip(_ctx), fields(agent = %_agent.name_any(), namespace = %_ctx.namespace))]
fn error_policy(_agent: Arc<LanguageAgent>, err: &Error, _ctx: Arc<Context>) -> Action {
    error_action(err)
}

fn error_action(err: &Error) -> Action {
    match err {
        Error::SelfHealingExhausted { attempts } => {
            info!(attempts, "Self-healing exhausted, waiting for manual intervention");
            Action::requeue(EXHAUSTED_REQUEUE)
        }
        other => {
            error!(error = ?other, "LanguageAgent reconciliation failed, requeueing");
            Action::requeue(ERROR_REQUEUE)
        }
    }
}
