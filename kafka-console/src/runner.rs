//! Tools for initializing the console in the final binary.
use crate::client::BrokerClientFactory;
use crate::config::Config;
use crate::observability::LogFilterHttpExporter;
use crate::outcome::Outcome;
use crate::resource::ResourceStore;
use crate::services::Services;
use anyhow::Context;
use anyhow::{Result, anyhow};
use clap::{Parser, crate_version};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::runtime::{self, Runtime};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::Layer;
use tracing_subscriber::fmt::format::DefaultFields;
use tracing_subscriber::fmt::format::Format;
use tracing_subscriber::fmt::format::Full;
use tracing_subscriber::fmt::format::Json;
use tracing_subscriber::fmt::format::JsonFields;
use tracing_subscriber::layer::Layered;
use tracing_subscriber::reload::Handle;
use tracing_subscriber::{EnvFilter, Registry};

#[derive(Parser, Clone)]
#[clap(version = crate_version!())]
struct ConfigOpts {
    #[clap(short, long, default_value = "config/config.yaml")]
    pub config_file: String,

    /// YAML list of kafka resources to register clusters from at startup
    #[clap(short, long)]
    pub resources_file: Option<String>,

    // Number of tokio worker threads.
    // By default uses the number of cores on the system.
    #[clap(long)]
    pub core_threads: Option<usize>,

    // 2,097,152 = 2 * 1024 * 1024 (2MiB)
    #[clap(long, default_value = "2097152")]
    pub stack_size: usize,

    #[arg(long, value_enum, default_value = "human")]
    pub log_format: LogFormat,
}

#[derive(clap::ValueEnum, Clone, Copy)]
enum LogFormat {
    Human,
    Json,
}

pub struct Console {
    runtime: Runtime,
    config: Config,
    resources: ResourceStore,
    tracing: TracingState,
    metrics: Option<(PrometheusHandle, SocketAddr)>,
}

impl Console {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let opts = ConfigOpts::parse();
        let log_format = opts.log_format;

        match Console::new_inner(opts) {
            Ok(x) => x,
            Err(err) => {
                // If initialization failed then we have no tokio runtime or tracing to use.
                // Create the simplest runtime + tracing so we can write out an `error!`, if even that fails then just panic.
                // Put it all in its own scope so we drop it (and therefore perform tracing log flushing) before we exit
                {
                    let rt = Runtime::new()
                        .context("Failed to create runtime while trying to report {err:?}")
                        .unwrap();
                    let _guard = rt.enter();
                    let _tracing_state = TracingState::new("error", log_format)
                        .context("Failed to create TracingState while trying to report {err:?}")
                        .unwrap();

                    tracing::error!("{:?}", err.context("Failed to start kafka console"));
                }
                std::process::exit(1);
            }
        }
    }

    fn new_inner(params: ConfigOpts) -> Result<Self> {
        let config = Config::from_file(&params.config_file)?;
        let resources = match &params.resources_file {
            Some(path) => ResourceStore::from_file(path)?,
            None => ResourceStore::default(),
        };
        let tracing = TracingState::new(config.main_log_level.as_str(), params.log_format)?;
        let runtime = Console::create_runtime(params.stack_size, params.core_threads)?;
        let metrics = Console::install_metrics_recorder(&config)?;

        Ok(Console {
            runtime,
            config,
            resources,
            tracing,
            metrics,
        })
    }

    /// The recorder has to be installed before any metric is recorded,
    /// the interface serving it is only started once the registry exists.
    fn install_metrics_recorder(config: &Config) -> Result<Option<(PrometheusHandle, SocketAddr)>> {
        let Some(observability_interface) = &config.observability_interface else {
            return Ok(None);
        };
        let socket: SocketAddr = observability_interface.parse().with_context(|| {
            format!("Invalid observability_interface {observability_interface}")
        })?;
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::set_global_recorder(recorder)?;
        Ok(Some((handle, socket)))
    }

    /// Runs the console until SIGINT or SIGTERM is received, permanently handing control of the application over to it.
    /// As such this method never returns.
    pub fn run_block(self) -> ! {
        let (trigger_shutdown_tx, trigger_shutdown_rx) = watch::channel(false);

        // We need to block on this part to ensure that we immediately register these signals.
        // Otherwise if we included signal creation in the below spawned task we would be at the mercy of whenever tokio decides to start running the task.
        let signals = self.runtime.block_on(async {
            Ok::<_, anyhow::Error>((
                signal(SignalKind::interrupt())?,
                signal(SignalKind::terminate())?,
            ))
        });

        let code = match signals {
            Ok((mut interrupt, mut terminate)) => {
                self.runtime.spawn(async move {
                    tokio::select! {
                        _ = interrupt.recv() => {
                            info!("received SIGINT");
                        },
                        _ = terminate.recv() => {
                            info!("received SIGTERM");
                        },
                    };

                    trigger_shutdown_tx.send(true).ok();
                });

                let observability = self
                    .metrics
                    .map(|(handle, socket)| (handle, socket, self.tracing.handle.clone()));
                match self.runtime.block_on(run(
                    self.config,
                    self.resources,
                    observability,
                    trigger_shutdown_rx,
                )) {
                    Ok(()) => {
                        info!("Kafka console was shutdown cleanly.");
                        0
                    }
                    Err(err) => {
                        error!("{:?}", err.context("Kafka console failed"));
                        1
                    }
                }
            }
            Err(err) => {
                error!("{:?}", err.context("Failed to register signal handlers"));
                1
            }
        };
        // Ensure tracing is flushed by dropping before exiting
        std::mem::drop(self.tracing);
        std::mem::drop(self.runtime);
        std::process::exit(code);
    }

    fn create_runtime(stack_size: usize, worker_threads: Option<usize>) -> Result<Runtime> {
        let mut runtime_builder = runtime::Builder::new_multi_thread();
        runtime_builder
            .enable_all()
            .thread_name("kafka-console-worker")
            .thread_stack_size(stack_size);
        if let Some(worker_threads) = worker_threads {
            runtime_builder.worker_threads(worker_threads);
        }
        runtime_builder
            .build()
            .context("Failed to create tokio runtime")
    }
}

struct TracingState {
    /// Once this is dropped tracing logs are ignored
    _guard: WorkerGuard,
    handle: ReloadHandle,
}

/// Returns a new `EnvFilter` by parsing each directive string, or an error if any directive is invalid.
/// The parsing is robust to formatting, but will reject the first invalid directive (e.g. bad log level).
fn try_parse_log_directives(directives: &[Option<&str>]) -> Result<EnvFilter> {
    let directives: Vec<Directive> = directives
        .iter()
        .flat_map(Option::as_deref)
        .flat_map(|s| s.split(','))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().map_err(|e| anyhow!("{}: {}", e, s)))
        .collect::<Result<_>>()?;

    let filter = directives
        .into_iter()
        .fold(EnvFilter::default(), |filter, directive| {
            filter.add_directive(directive)
        });

    Ok(filter)
}

impl TracingState {
    fn new(log_level: &str, format: LogFormat) -> Result<Self> {
        let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stdout());

        // Directives from the config file first, then RUST_LOG which takes priority.
        let overrides = env::var(EnvFilter::DEFAULT_ENV).ok();
        let env_filter = try_parse_log_directives(&[Some(log_level), overrides.as_deref()])?;

        let handle = match format {
            LogFormat::Json => {
                let builder = tracing_subscriber::fmt()
                    .json()
                    .with_writer(non_blocking)
                    .with_env_filter(env_filter)
                    .with_filter_reloading();
                let handle = ReloadHandle::Json(builder.reload_handle());
                builder.init();
                handle
            }
            LogFormat::Human => {
                let builder = tracing_subscriber::fmt()
                    .with_writer(non_blocking)
                    .with_env_filter(env_filter)
                    .with_filter_reloading();
                let handle = ReloadHandle::Human(builder.reload_handle());
                builder.init();
                handle
            }
        };

        // Panics are printed straight to stderr by default which would break json output.
        if let LogFormat::Json = format {
            crate::tracing_panic_handler::setup();
        }

        Ok(TracingState {
            _guard: guard,
            handle,
        })
    }
}

type Formatter<A, B> = Layered<Layer<Registry, A, Format<B>, NonBlocking>, Registry>;

#[derive(Clone)]
pub(crate) enum ReloadHandle {
    Json(Handle<EnvFilter, Formatter<JsonFields, Json>>),
    Human(Handle<EnvFilter, Formatter<DefaultFields, Full>>),
}

impl ReloadHandle {
    pub fn reload(&self, filter: EnvFilter) -> Result<()> {
        match self {
            ReloadHandle::Json(handle) => handle.reload(filter).map_err(|e| anyhow!(e)),
            ReloadHandle::Human(handle) => handle.reload(filter).map_err(|e| anyhow!(e)),
        }
    }
}

async fn run(
    config: Config,
    resources: ResourceStore,
    observability: Option<(PrometheusHandle, SocketAddr, ReloadHandle)>,
    mut trigger_shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    info!("Starting kafka console {}", crate_version!());
    info!(
        clusters = ?config.kafka.clusters.iter().map(|cluster| cluster.cluster_key()).collect::<Vec<_>>(),
        resources = resources.len(),
        registry = ?config.registry,
    );

    let factory = Arc::new(BrokerClientFactory::new(
        config.registry.client_construction_timeout(),
    ));
    let services = Services::start(&config, &resources, factory).await;

    if let Some((recorder_handle, socket, tracing_handle)) = observability {
        let exporter = LogFilterHttpExporter::new(
            recorder_handle,
            socket,
            tracing_handle,
            services.registry.clone(),
        );
        tokio::spawn(exporter.async_run());
    }

    trigger_shutdown_rx
        .wait_for(|shutdown| *shutdown)
        .await
        .context("Shutdown trigger was dropped")?;

    let report = services.shutdown().await?;
    let failures: Vec<&str> = report
        .iter()
        .filter(|(_, outcome)| matches!(outcome, Outcome::Failure(_)))
        .map(|(cluster_id, _)| cluster_id.as_str())
        .collect();
    if failures.is_empty() {
        Ok(())
    } else {
        Err(anyhow!(
            "Connections to clusters {failures:?} were not closed cleanly"
        ))
    }
}
