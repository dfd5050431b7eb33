//! Composition root - builds the engine from configuration

use anyhow::Context;
use harbor_foundation::{AuditLogger, HarborConfig, Storage};
use harbor_task::{
    http_client, register_default_handlers, DockerRuntime, HandlerDeps, HandlerRegistry,
    ProxyUrl, Scheduler, SchedulerConfig, SqliteTaskStore, TaskLogSink, TaskService, Workspaces,
};
use std::sync::Arc;
use tracing::info;

/// Wired engine
pub struct App {
    pub service: Arc<TaskService>,
    pub scheduler: Arc<Scheduler>,
}

/// Handlers with the docker driver for `config`
pub fn build_registry(config: &HarborConfig) -> anyhow::Result<HandlerRegistry> {
    let runtime = DockerRuntime::connect(config.docker_host.as_deref())
        .context("Failed to connect to the container engine")?;
    let proxy = proxy(config)?;
    if let Some(proxy) = &proxy {
        info!(proxy = %proxy, "Task network traffic goes through proxy");
    }

    let deps = Arc::new(HandlerDeps {
        runtime: Arc::new(runtime),
        workspaces: Workspaces::new(config.workspaces_dir()),
        stacks_dir: config.stacks_dir(),
        export_dir: config.export_dir(),
        upload_dir: config.upload_dir(),
        max_download_bytes: config.max_upload_size_bytes(),
        http: http_client(proxy.as_ref()).context("Failed to build HTTP client")?,
        proxy,
    });

    let registry = register_default_handlers(HandlerRegistry::builder(), deps).build();
    registry.ensure_complete()?;
    Ok(registry)
}

/// Normalized `proxyUrl`, if configured
pub fn proxy(config: &HarborConfig) -> anyhow::Result<Option<ProxyUrl>> {
    match config.proxy_url() {
        Some(raw) => ProxyUrl::parse(raw).context("Invalid proxyUrl"),
        None => Ok(None),
    }
}

/// Open storage, start the pool and recover leftovers from a previous run
pub async fn start(config: &HarborConfig) -> anyhow::Result<App> {
    config.validate()?;
    config.ensure_dirs()?;

    let storage = Storage::open(&config.database_path()).context("Failed to open database")?;
    let store = Arc::new(SqliteTaskStore::new(storage.clone()));
    let audit = AuditLogger::new(storage);
    let logs = Arc::new(TaskLogSink::new(config.task_log_dir()));
    let registry = Arc::new(build_registry(config)?);

    let scheduler = Arc::new(Scheduler::start(
        SchedulerConfig {
            workers: config.workers(),
            max_queued: config.max_queued,
        },
        store.clone(),
        registry.clone(),
        logs.clone(),
        audit.clone(),
    ));
    let recovery = scheduler.recover().await?;
    info!(
        interrupted = recovery.interrupted.len(),
        requeued = recovery.requeued.len(),
        "Recovered tasks from previous run"
    );

    let service = Arc::new(TaskService::new(
        store,
        registry,
        scheduler.clone(),
        logs,
        audit,
        vec![config.export_dir(), config.upload_dir()],
    ));

    Ok(App { service, scheduler })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_is_normalized_from_config() {
        let config = HarborConfig {
            proxy_url: Some("10.1.1.1:8118".to_string()),
            ..Default::default()
        };
        assert_eq!(
            proxy(&config).unwrap().unwrap().as_str(),
            "http://10.1.1.1:8118"
        );

        let unset = HarborConfig::default();
        assert!(proxy(&unset).unwrap().is_none());

        let bad = HarborConfig {
            proxy_url: Some("ftp://10.1.1.1:21".to_string()),
            ..Default::default()
        };
        assert!(proxy(&bad).is_err());
    }
}
