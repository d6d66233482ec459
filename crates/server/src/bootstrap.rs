use std::path::PathBuf;
use std::sync::Arc;

use ganglion_agent::availability::{MonitorSettings, ServiceAvailabilityMonitor};
use ganglion_agent::builtin::{Delegate, Finish, Remember};
use ganglion_agent::http::HttpCompletionClient;
use ganglion_agent::llm::{LlmClient, LlmError, ServiceId};
use ganglion_agent::prompts::PromptError;
use ganglion_agent::runtime::{EngineSettings, ExecutionEngine};
use ganglion_agent::tools::{CapabilityRegistry, RegistryError};
use ganglion_core::config::{AppConfig, ConfigError, LoadOptions};
use ganglion_store::{FileSessionStore, SessionStore};
use thiserror::Error;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub engine: Arc<ExecutionEngine>,
    pub monitor: Arc<ServiceAvailabilityMonitor>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("could not prepare session store at `{path}`: {source}")]
    StoreRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{service} client setup failed: {source}")]
    Client {
        service: ServiceId,
        #[source]
        source: LlmError,
    },
    #[error("capability registry is invalid: {0}")]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Prompt(#[from] PromptError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let sessions_root = config.store.root_dir.join("sessions");
    tokio::fs::create_dir_all(&sessions_root)
        .await
        .map_err(|source| BootstrapError::StoreRoot { path: sessions_root.clone(), source })?;
    let store: Arc<dyn SessionStore> = Arc::new(FileSessionStore::new(&config.store.root_dir));
    info!(
        event_name = "system.bootstrap.store_ready",
        correlation_id = "bootstrap",
        root_dir = %config.store.root_dir.display(),
        "session store ready"
    );

    let reasoning = completion_client(ServiceId::Reasoning, &config)?;
    let negotiation = completion_client(ServiceId::Negotiation, &config)?;

    let registry = CapabilityRegistry::builder()
        .register(Finish::new())
        .register(Remember::new())
        .register(Delegate::new())
        .build()?;

    let monitor = Arc::new(
        ServiceAvailabilityMonitor::new(MonitorSettings::from_config(&config.monitor))
            .with_probe(ServiceId::Reasoning, reasoning.clone())
            .with_probe(ServiceId::Negotiation, negotiation.clone()),
    );

    let engine = ExecutionEngine::new(
        reasoning,
        negotiation,
        Arc::new(registry),
        store,
        monitor.clone(),
        EngineSettings::from_config(&config.engine),
    )?;
    info!(
        event_name = "system.bootstrap.engine_ready",
        correlation_id = "bootstrap",
        reasoning_provider = ?config.reasoning.provider,
        negotiation_provider = ?config.negotiation.provider,
        max_steps = config.engine.max_steps,
        "execution engine ready"
    );

    Ok(Application { config, engine: Arc::new(engine), monitor })
}

fn completion_client(
    service: ServiceId,
    config: &AppConfig,
) -> Result<Arc<dyn LlmClient>, BootstrapError> {
    let section = match service {
        ServiceId::Reasoning => &config.reasoning,
        ServiceId::Negotiation => &config.negotiation,
    };
    let client = HttpCompletionClient::from_config(section)
        .map_err(|source| BootstrapError::Client { service, source })?;
    Ok(Arc::new(client))
}
