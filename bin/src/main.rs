#![allow(clippy::cognitive_complexity)]
use std::future::Future;

mod seed;
mod startup_health;

use config::LeaseKeeperConfig;
use ddns::DnsUpdater;
use external_api::{ExternalApi, Health};
use lease_manager::{Collaborators, LeaseManager, Pruner, Settings, watch};
use leasekeeper_core::{
    config::{
        cli::{self, Parser},
        trace,
    },
    metrics::{BACKGROUND_TASK_EXITS, BACKGROUND_TASKS},
    prelude::*,
    tokio::{self, runtime::Builder, signal, task::JoinHandle},
    tracing::info_span,
};
use provisioning::dry_run::{DryRunAccounts, DryRunDns, TracingMessenger};
use resource_store::{MemoryStore, ResourceStore};
use startup_health::verify_startup_subsystems;
use tracing_futures::Instrument;

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() -> Result<()> {
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.leasekeeper_log)?;
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
        match tokio::spawn(async move { start(config).await }).await {
            Err(err) => error!(?err, "failed to start server"),
            Ok(Err(err)) => error!(?err, "exited with error"),
            Ok(_) => debug!("exiting..."),
        }
    });

    Ok(())
}

async fn start(config: cli::Config) -> Result<()> {
    info!(instance_id = %config.instance_id, "using id");

    debug!("parsing leasekeeper config");
    let cfg = Arc::new(LeaseKeeperConfig::parse(&config.config_path)?);
    let settings = Settings::new(&cfg)?;

    let store = Arc::new(MemoryStore::new());
    seed::seed_store(store.as_ref(), &cfg).await?;

    let collaborators = collaborators(&cfg).await?;
    let (manager, worker) = LeaseManager::new(Arc::clone(&store), collaborators, settings);
    let namespace = cfg.namespace().to_owned();

    // start external api for healthchecks & the lifecycle operations
    let api = ExternalApi::new(
        config.external_api,
        Arc::clone(&cfg),
        Arc::clone(&manager.service),
    );

    let token = CancellationToken::new();
    let mut lease_watch = spawn_supervised(
        "lease reconciler",
        watch(
            Arc::clone(&store),
            Arc::clone(&manager.reconciler),
            namespace.clone(),
            token.clone(),
        ),
        token.clone(),
    );
    let mut pool_watch = spawn_supervised(
        "pool reconciler",
        watch(
            Arc::clone(&store),
            Arc::clone(&manager.pool_reconciler),
            namespace,
            token.clone(),
        ),
        token.clone(),
    );
    let mut provisioner = spawn_supervised(
        "provisioning worker",
        worker.run(token.clone()),
        token.clone(),
    );
    let mut prune_task = spawn_prune_task(
        Arc::clone(&manager.pruner),
        cfg.leases().prune_interval,
        token.clone(),
    );

    let api_sender = api.sender();
    let mut api_guard = api.start(token.clone());

    // Keep health BAD until all startup-critical tasks are confirmed running.
    if let Err(err) = verify_startup_subsystems(&mut [
        ("external API", &mut api_guard),
        ("lease reconciler", &mut lease_watch),
        ("pool reconciler", &mut pool_watch),
        ("provisioning worker", &mut provisioner),
        ("lease pruning", &mut prune_task),
    ])
    .await
    {
        let _ = api_sender.send(Health::Bad).await;
        token.cancel();
        return Err(err);
    }

    debug!("changing health to good after startup checks passed");
    api_sender
        .send(Health::Good)
        .await
        .context("error occurred in changing health status to Good")?;

    shutdown_signal(token.clone()).await?;
    info!("shutting down");
    let _ = api_sender.send(Health::Bad).await;

    for (name, task) in [
        ("external API", api_guard),
        ("lease reconciler", lease_watch),
        ("pool reconciler", pool_watch),
        ("provisioning worker", provisioner),
        ("lease pruning", prune_task),
    ] {
        if let Err(err) = task.await {
            error!(?err, "error waiting for {name}");
        }
    }
    Ok(())
}

/// DNS updates go to the configured server when there is one, accounts and
/// messages are logged until a backend is wired in.
async fn collaborators(cfg: &LeaseKeeperConfig) -> Result<Collaborators> {
    let dns: Arc<dyn provisioning::DnsRecords> = match cfg.dns() {
        Some(dns) => Arc::new(
            DnsUpdater::new(dns, cfg.provisioning().dns_ttl)
                .await
                .context("failed to start dns updater")?,
        ),
        None => {
            info!("no dns server configured, dns updates will only be logged");
            Arc::new(DryRunDns)
        }
    };
    Ok(Collaborators::new(
        Arc::new(DryRunAccounts),
        dns,
        Arc::new(TracingMessenger),
    ))
}

/// Spawn a task that should live until `token` is cancelled. Exiting any
/// earlier is counted and logged.
fn spawn_supervised<F>(name: &'static str, task: F, token: CancellationToken) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    BACKGROUND_TASKS.inc();
    tokio::spawn(
        async move {
            task.await;
            BACKGROUND_TASKS.dec();
            if !token.is_cancelled() {
                BACKGROUND_TASK_EXITS.inc();
                warn!("background task exited before shutdown");
            }
        }
        .instrument(info_span!("task", name)),
    )
}

fn spawn_prune_task<S: ResourceStore>(
    pruner: Arc<Pruner<S>>,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    let cancelled = token.clone();
    spawn_supervised(
        "lease pruning",
        async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => {
                        debug!("lease pruning task stopping");
                        return;
                    }
                    _ = ticker.tick() => {
                        let stats = pruner.sweep().await;
                        if stats.failed > 0 {
                            warn!(failed = stats.failed, pruned = stats.pruned, "lease pruning sweep had failures");
                        } else {
                            debug!(warned = stats.warned, pruned = stats.pruned, "lease pruning sweep completed");
                        }
                    }
                }
            }
        },
        token,
    )
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    let ret = signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c");
    token.cancel();
    ret
}
