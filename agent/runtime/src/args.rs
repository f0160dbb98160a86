use crate::{
    cache::{self, apiserver, Cache, Index},
    core::CacheEvent,
    enricher::{
        self,
        source::{CrictlCommand, Ctrinfo, StateFile},
        Enricher, EnricherMetrics, Reconciler, StandaloneCache,
    },
    export, ingest,
    k8s,
    pubsub::PubSub,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::{num::NonZeroUsize, path::PathBuf, sync::Arc};
use tokio::{task::JoinHandle, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "flowtag", about = "Attributes network flows to Kubernetes workloads")]
pub struct Args {
    #[clap(long, default_value = "flowtag=info,warn", env = "FLOWTAG_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Where identities come from: the Kubernetes API or the node's CNI state.
    #[clap(long, value_enum, default_value = "cluster")]
    mode: Mode,

    #[clap(long, env = "NODE_NAME")]
    node_name: Option<String>,

    /// Bounds both the enricher's input queue and its output buffer.
    #[clap(long, default_value = "1024")]
    enricher_capacity: NonZeroUsize,

    /// Seconds before an unrefreshed standalone entry expires.
    #[clap(long, default_value = "180")]
    standalone_ttl: u64,

    #[clap(long, default_value = "10")]
    reconcile_interval: u64,

    #[clap(long, default_value = "30")]
    sweep_interval: u64,

    /// How standalone mode discovers the pods running on this node.
    #[clap(long, value_enum, default_value = "crictl")]
    enrichment_mode: EnrichmentMode,

    #[clap(long, default_value = "crictl")]
    crictl_path: PathBuf,

    /// Seconds before a crictl invocation is killed.
    #[clap(long, default_value = "5")]
    crictl_timeout: u64,

    #[clap(long, default_value = "/var/run/azure-vnet.json")]
    state_file: PathBuf,

    /// Unix socket on which producers write flow events as JSON lines.
    #[clap(long)]
    flow_socket: Option<PathBuf>,

    /// Prints enriched events to stdout as JSON lines.
    #[clap(long)]
    stdout_export: bool,

    #[clap(long, default_value = "30")]
    apiserver_refresh: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    Cluster,
    Standalone,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum EnrichmentMode {
    /// Inspects pod sandboxes through the container runtime.
    Crictl,
    /// Reads the CNI plugin's state file.
    Statefile,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        match self.mode {
            Mode::Cluster => self.run_cluster().await,
            Mode::Standalone => self.run_standalone().await,
        }
    }

    async fn run_cluster(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            node_name,
            enricher_capacity,
            flow_socket,
            stdout_export,
            apiserver_refresh,
            ..
        } = self;

        let pubsub = PubSub::<CacheEvent>::shared(tokio::runtime::Handle::current());
        let cache = Cache::shared(pubsub.clone());
        let index = Index::shared(cache.clone());

        let mut prom = <Registry>::default();
        cache::metrics::register(
            prom.sub_registry_with_prefix("ownership_cache"),
            cache.clone(),
        );
        let enricher_metrics =
            EnricherMetrics::register(prom.sub_registry_with_prefix("enricher"));
        let enricher = Enricher::shared(cache.clone(), enricher_capacity, enricher_metrics);
        enricher::metrics::register_flow_rate(
            prom.sub_registry_with_prefix("enricher"),
            enricher.clone(),
        );
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        match node_name {
            Some(node) => info!(%node, "Starting in cluster mode"),
            None => info!("Starting in cluster mode"),
        }

        // Spawn resource watches.

        let pods = runtime.watch_all::<k8s::Pod>(watcher::Config::default());
        tokio::spawn(kubert::index::namespaced(index.clone(), pods).instrument(info_span!("pods")));

        let services = runtime.watch_all::<k8s::Service>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), services).instrument(info_span!("services")),
        );

        let nodes = runtime.watch_all::<k8s::Node>(watcher::Config::default());
        tokio::spawn(kubert::index::cluster(index.clone(), nodes).instrument(info_span!("nodes")));

        let namespaces = runtime.watch_all::<k8s::Namespace>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(index, namespaces).instrument(info_span!("namespaces")),
        );

        let token = CancellationToken::new();

        match api_server_resolver().await {
            Ok(resolver) => {
                let watcher = apiserver::Watcher::new(resolver, pubsub);
                tokio::spawn(
                    watcher
                        .run(token.clone(), Duration::from_secs(apiserver_refresh))
                        .instrument(info_span!("apiserver")),
                );
            }
            Err(error) => warn!(%error, "API server addresses will not be tracked"),
        }

        let tasks = spawn_pipeline(&enricher, flow_socket, stdout_export, token.clone())?;

        // Block the main thread on the shutdown signal. Once it fires, stop the pipeline and wait
        // for it to drain before exiting.
        let res = runtime.run().await;
        token.cancel();
        join(tasks).await;
        if res.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }

    async fn run_standalone(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            admin,
            node_name,
            enricher_capacity,
            standalone_ttl,
            reconcile_interval,
            sweep_interval,
            enrichment_mode,
            crictl_path,
            crictl_timeout,
            state_file,
            flow_socket,
            stdout_export,
            ..
        } = self;

        log_format.try_init(log_level)?;
        let (shutdown, _) = kubert::shutdown::sigint_or_sigterm()?;

        let cache = StandaloneCache::shared(Duration::from_secs(standalone_ttl));

        let mut prom = <Registry>::default();
        let enricher_metrics =
            EnricherMetrics::register(prom.sub_registry_with_prefix("enricher"));
        let enricher = Enricher::shared(cache.clone(), enricher_capacity, enricher_metrics);
        enricher::metrics::register_flow_rate(
            prom.sub_registry_with_prefix("enricher"),
            enricher.clone(),
        );
        enricher::metrics::register_standalone(
            prom.sub_registry_with_prefix("enricher"),
            cache.clone(),
        );

        let admin = admin
            .into_builder()
            .with_prometheus(prom)
            .bind()
            .context("failed to bind the admin server")?;
        admin.readiness().set(true);
        let _admin = admin.spawn();

        match node_name {
            Some(node) => info!(%node, ttl = ?cache.ttl(), "Starting in standalone mode"),
            None => info!(ttl = ?cache.ttl(), "Starting in standalone mode"),
        }

        let token = CancellationToken::new();
        let mut tasks = vec![cache.spawn_sweeper(token.clone(), Duration::from_secs(sweep_interval))];

        let reconcile_interval = Duration::from_secs(reconcile_interval);
        let reconciler = match enrichment_mode {
            EnrichmentMode::Crictl => {
                let crictl = CrictlCommand::new(crictl_path, Duration::from_secs(crictl_timeout));
                info!(timeout = ?crictl.timeout(), "Discovering pods with crictl");
                tokio::spawn(
                    Reconciler::new(Ctrinfo::new(crictl), cache)
                        .run(token.clone(), reconcile_interval)
                        .instrument(info_span!("reconciler")),
                )
            }
            EnrichmentMode::Statefile => {
                let source = StateFile::new(state_file);
                info!(path = %source.path().display(), "Discovering pods from the state file");
                tokio::spawn(
                    Reconciler::new(source, cache)
                        .run(token.clone(), reconcile_interval)
                        .instrument(info_span!("reconciler")),
                )
            }
        };
        tasks.push(reconciler);
        tasks.extend(spawn_pipeline(
            &enricher,
            flow_socket,
            stdout_export,
            token.clone(),
        )?);

        let res = shutdown.signaled().await;
        token.cancel();
        join(tasks).await;
        if res.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

/// Starts the enricher and its optional ingest and export tasks.
fn spawn_pipeline(
    enricher: &Arc<Enricher>,
    flow_socket: Option<PathBuf>,
    stdout_export: bool,
    token: CancellationToken,
) -> Result<Vec<JoinHandle<()>>> {
    let mut tasks = Vec::new();

    // Readers must subscribe before the worker starts so no event is missed.
    if stdout_export {
        let reader = enricher.export_reader();
        tasks.push(tokio::spawn(
            async move {
                if let Err(error) = export::json_lines(reader, tokio::io::stdout()).await {
                    warn!(%error, "Export failed");
                }
            }
            .instrument(info_span!("export")),
        ));
    }

    tasks.push(enricher.run(token.clone())?);

    if let Some(path) = flow_socket {
        let enricher = enricher.clone();
        tasks.push(tokio::spawn(
            async move {
                if let Err(error) = ingest::serve(&path, enricher, token).await {
                    warn!(%error, "Ingest failed");
                }
            }
            .instrument(info_span!("ingest")),
        ));
    }

    Ok(tasks)
}

async fn join(tasks: Vec<JoinHandle<()>>) {
    for task in tasks {
        if let Err(error) = task.await {
            warn!(%error, "Task failed");
        }
    }
}

/// Builds a resolver for the API server host named by the inferred client configuration.
async fn api_server_resolver() -> Result<apiserver::DnsResolver> {
    let config = kube::Config::infer()
        .await
        .context("failed to infer the client configuration")?;
    let url = &config.cluster_url;
    let Some(host) = url.host() else {
        bail!("cluster URL {url} has no host");
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port = match url.port_u16() {
        Some(port) => port,
        None if url.scheme_str() == Some("http") => 80,
        None => 443,
    };
    info!(%host, port, "Tracking API server addresses");
    Ok(apiserver::DnsResolver::new(host, port))
}

