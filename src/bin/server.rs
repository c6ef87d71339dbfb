//! `machine-runtimed` — the node-local machine runtime daemon (spec §2, §6).
//!
//! Wires together the object store, resource manager, NUMA-aware reconciler,
//! and the gRPC/HTTP surfaces, then serves until a termination signal asks
//! it to drain and exit.

use clap::Parser;
use nexa_machine_runtime::config::{CliArgs, Config};
use nexa_machine_runtime::exec::{self, ExecTokens};
use nexa_machine_runtime::hypervisor::{HypervisorDriver, NullHypervisor};
use nexa_machine_runtime::machine::machine_create_strategy;
use nexa_machine_runtime::reconciler::{Reconciler, ReconcilerConfig};
use nexa_machine_runtime::resources::cpu::CpuSource;
use nexa_machine_runtime::resources::memory::MemorySource;
use nexa_machine_runtime::resources::hugepages::HugepagesSource;
use nexa_machine_runtime::resources::ResourceManager;
use nexa_machine_runtime::rpc::MachineRuntimeService;
use nexa_machine_runtime::store::Store;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// x86-64's standard 2MiB hugepage size; the on-disk class catalogue and CLI
/// surface only ever talk in page *counts* (spec §6.3), so the size itself
/// isn't a tunable.
const HUGEPAGE_SIZE_BYTES: i64 = 2 * 1024 * 1024;

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "machine-runtimed exited with an error");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run() -> anyhow::Result<()> {
    let cli = CliArgs::parse();
    let config = Config::load(cli)?;
    info!(listen = %config.listen.display(), root = %config.root.display(), "starting machine-runtimed");

    let store = Arc::new(
        Store::open(config.root.join("machines"), "Machine")
            .await?
            .with_create_strategy(Arc::new(machine_create_strategy)),
    );

    let resource_manager = Arc::new(build_resource_manager(&config, &store).await?);

    let hypervisor: Arc<dyn HypervisorDriver> = Arc::new(NullHypervisor::new(Vec::new()));
    let exec_tokens = ExecTokens::new();

    let cancel = CancellationToken::new();
    install_signal_handlers(cancel.clone());

    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        hypervisor.clone(),
        resource_manager.clone(),
        ReconcilerConfig {
            hugepage_size_bytes: HUGEPAGE_SIZE_BYTES,
            blocked_cpus: config.blocked_cpus.iter().copied().collect::<HashSet<u32>>(),
        },
    ));
    let reconciler_task = tokio::spawn({
        let reconciler = reconciler.clone();
        let cancel = cancel.clone();
        async move {
            if let Err(e) = reconciler.run(cancel).await {
                error!(error = %e, "reconciler loop exited with an error");
            }
        }
    });
    tokio::spawn({
        let resource_manager = resource_manager.clone();
        let cancel = cancel.clone();
        async move {
            cancel.cancelled().await;
            resource_manager.cancel();
        }
    });

    let grpc_service = MachineRuntimeService::new(
        store.clone(),
        resource_manager.clone(),
        exec_tokens.clone(),
        config.base_url.clone(),
    );
    let grpc_task = tokio::spawn(serve_grpc(config.listen.clone(), grpc_service, cancel.clone()));

    let http_addr = parse_http_addr(&config.base_url);
    let http_task = tokio::spawn(serve_http(http_addr, exec_tokens, cancel.clone()));

    grpc_task.await??;
    http_task.await??;
    reconciler_task.await?;

    info!("machine-runtimed shut down cleanly");
    Ok(())
}

async fn build_resource_manager(config: &Config, store: &Store<nexa_machine_runtime::machine::Machine>) -> anyhow::Result<ResourceManager> {
    let mgr = ResourceManager::new();
    mgr.configure()?;
    mgr.register_source(Box::new(CpuSource::new(config.overcommit_factor)))?;
    // `memory` and `hugepages` are alternate accountants for the same
    // `memory` resource name (spec §4.2); registering both would collide at
    // `initialise` (spec §4.3 "Incompatibility"), so the host picks one.
    if config.hugepages_backed {
        mgr.register_source(Box::new(HugepagesSource::new(HUGEPAGE_SIZE_BYTES, config.blocked_hugepages)))?;
    } else {
        mgr.register_source(Box::new(MemorySource::new(config.reserved_memory_bytes)))?;
    }
    #[cfg(feature = "sgx")]
    mgr.register_source(Box::new(nexa_machine_runtime::resources::sgx::SgxPerNumaSource::new()))?;

    mgr.set_classes(config.load_classes()?)?;

    let existing = store.list().await?;
    mgr.initialise(&existing)?;
    Ok(mgr)
}

/// A CLI flag/env var could name the socket in the future; today it's taken
/// verbatim from `base_url` the same way `Exec`'s streaming URL is built.
fn parse_http_addr(base_url: &str) -> SocketAddr {
    let without_scheme = base_url.split("://").nth(1).unwrap_or(base_url);
    without_scheme
        .parse()
        .or_else(|_| format!("0.0.0.0:{}", without_scheme.rsplit(':').next().unwrap_or("8080")).parse())
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8080)))
}

async fn serve_grpc(
    socket_path: std::path::PathBuf,
    service: MachineRuntimeService,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(&socket_path)?;
    info!(socket = %socket_path.display(), "gRPC surface listening");
    Server::builder()
        .add_service(service.into_server())
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), cancel.cancelled())
        .await?;
    Ok(())
}

async fn serve_http(addr: SocketAddr, exec_tokens: ExecTokens, cancel: CancellationToken) -> anyhow::Result<()> {
    let app = exec::router(exec_tokens);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP streaming surface listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

fn install_signal_handlers(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            let _ = tokio::signal::ctrl_c().await;
        };
        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => error!(error = %e, "failed to install SIGTERM handler"),
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("received SIGINT, shutting down"),
            _ = terminate => info!("received SIGTERM, shutting down"),
        }
        cancel.cancel();
    });
}
