#![allow(clippy::cognitive_complexity)]
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};

use config::DhcpConfig;
use corral_core::{
    DhcpHandler, Server,
    config::{
        cli::{self, Parser},
        trace,
    },
    reclaim::spawn_reclaim_task,
    tokio::{self, runtime::Builder, signal, task::JoinHandle},
    tracing::*,
};
use external_api::{ExternalApi, Health};
use lease_manager::{Allocator, sqlite::SqliteDb};
use tokio_util::sync::CancellationToken;

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() -> Result<()> {
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.corral_log)?;
    debug!(?config, ?trace_config);
    if let Err(err) = dotenv::dotenv() {
        debug!(?err, ".env file not loaded");
    }

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    // default num threads will be num logical CPUs
    // if we have a configured value here, set it
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    // build the runtime
    let rt = builder.build()?;

    rt.block_on(async move {
        match corral_core::tokio::spawn(async move { start(config).await }).await {
            Err(err) => error!(?err, "failed to start server"),
            Ok(Err(err)) => error!(?err, "exited with error"),
            Ok(_) => debug!("exiting..."),
        }
    });

    Ok(())
}

async fn start(config: cli::Config) -> Result<()> {
    debug!("parsing DHCP config");
    let dhcp_cfg = DhcpConfig::parse(&config.config_path)?;

    // cli/env override wins over the config file
    let database_url = config
        .database_url
        .clone()
        .unwrap_or_else(|| dhcp_cfg.db_file().to_owned());
    info!(?database_url, "using database at path");
    debug!("starting database");
    let store = Arc::new(SqliteDb::new(&database_url).await?);

    let allocator = Allocator::new(
        store.as_ref().clone(),
        dhcp_cfg.dynamic_range(),
        dhcp_cfg.lease_duration(),
        dhcp_cfg.grace_period(),
    );

    // external api for healthchecks & lease administration
    let api = ExternalApi::new(config.external_api, Arc::clone(&store));

    debug!("starting v4 server");
    if !config.is_default_port_v4() {
        info!(addr = %config.v4_addr, "binding a non-standard dhcpv4 port");
    }
    let server = Server::bind(config.v4_addr, DhcpHandler::new(dhcp_cfg, allocator))?;

    let token = CancellationToken::new();
    let reclaim_task =
        spawn_reclaim_task(Arc::clone(&store), config.reclaim_interval(), token.clone());
    let api_sender = api.sender();
    let api_guard = api.start(token.clone());
    let _shutdown = tokio::spawn(shutdown_signal(token.clone()));

    let v4_task = tokio::spawn(server.run(token.clone()));

    debug!("changing health to good after startup");
    api_sender
        .send(Health::Good)
        .await
        .context("error occurred in changing health status to Good")?;

    if let Err(err) = flatten(v4_task).await {
        let _ = api_sender.send(Health::Bad).await;
        token.cancel();
        return Err(err);
    }
    if let Err(err) = api_guard.await {
        error!(?err, "error waiting for web server API");
    }
    if let Err(err) = reclaim_task.await {
        error!(?err, "error waiting for lease reclamation task");
    }
    Ok(())
}

async fn flatten<T>(handle: JoinHandle<Result<T, anyhow::Error>>) -> Result<T, anyhow::Error> {
    match handle.await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(err)) => Err(err),
        Err(err) => Err(anyhow!(err)),
    }
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    let ret = signal::ctrl_c().await.map_err(|err| anyhow!(err));
    token.cancel();
    ret
}
