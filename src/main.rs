//! Rightsizer control-plane shell.
//!
//! Thin wrapper around the library: loads configuration, wires the
//! collaborators together, runs the reconciliation scheduler and maps
//! failures to exit codes. Real orchestrator and metrics adaptors are
//! injected by embedding the library; the shell ships with the simulated
//! backends, which are enough to exercise configuration and policies end
//! to end.

use anyhow::Result;
use clap::Parser;
use rightsizer::audit::NdjsonFileSink;
use rightsizer::cluster::{ContainerInfo, FakeCluster, OwnerRef, PodPhase, PodSnapshot, NodeInfo};
use rightsizer::metrics::{provider_from_name, SimulatedMetricsProvider, SimulatedProfile};
use rightsizer::resources::{ResourceSpec, BYTES_PER_MIB};
use rightsizer::{
    AuditLog, ConfigManager, ErrorKind, HistoryStore, ReconcileScheduler, RightsizerError,
    WorkloadKind,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit code for configuration errors
const EXIT_CONFIG: u8 = 1;
/// Exit code for irrecoverable API errors
const EXIT_API: u8 = 2;
/// Exit code for leadership loss
const EXIT_LEADER_LOSS: u8 = 3;

#[derive(Debug, Parser)]
#[command(name = "rightsizer", about = "In-place workload rightsizing control plane")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "RIGHTSIZER_CONFIG")]
    config: Option<PathBuf>,

    /// Force dry-run regardless of the configured value
    #[arg(long)]
    dry_run: bool,

    /// Log filter, e.g. `info` or `rightsizer=debug`
    #[arg(long, env = "RIGHTSIZER_LOG", default_value = "info")]
    log: String,

    /// Seed the simulated cluster with demo workloads
    #[arg(long)]
    simulate: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let filter = EnvFilter::try_new(&args.log).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "rightsizer terminated");
            match err.downcast_ref::<RightsizerError>() {
                Some(RightsizerError::LeaderLost { .. }) => ExitCode::from(EXIT_LEADER_LOSS),
                Some(err) if err.kind() == ErrorKind::Fatal => ExitCode::from(EXIT_CONFIG),
                Some(_) => ExitCode::from(EXIT_API),
                None => ExitCode::from(EXIT_CONFIG),
            }
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let manager = Arc::new(match &args.config {
        Some(path) => ConfigManager::from_path(path)?,
        None => {
            info!("no configuration file given, using defaults");
            ConfigManager::from_config(Default::default())?
        }
    });
    if args.dry_run {
        let mut config = (*manager.current()).clone();
        config.dry_run = true;
        manager.handle().store(Arc::new(config));
        info!("dry-run forced from the command line");
    }
    let config = manager.current();

    let cluster = Arc::new(FakeCluster::new());
    let metrics: Arc<dyn rightsizer::MetricsProvider> = if args.simulate {
        let simulated = Arc::new(SimulatedMetricsProvider::new());
        seed_simulation(&cluster, &simulated);
        info!("simulated cluster seeded with demo workloads");
        simulated
    } else {
        info!(
            "running against the built-in simulated cluster; real orchestrator \
             adaptors are injected by embedding the library"
        );
        provider_from_name(&config.metrics.provider)?
    };

    let mut audit = AuditLog::new();
    if let Some(path) = &config.audit_log_path {
        audit.add_sink(Arc::new(NdjsonFileSink::open(path)?));
        info!(path = %path.display(), "audit log enabled");
    }
    let audit = Arc::new(audit);

    let history = Arc::new(HistoryStore::new(config.history_config()));
    let scheduler = ReconcileScheduler::new(
        manager.handle(),
        cluster,
        metrics,
        Arc::clone(&history),
        audit,
    )?;

    let cancel = CancellationToken::new();
    let prune_task = HistoryStore::spawn_prune_task(Arc::clone(&history), cancel.clone());
    let watcher_task = Arc::clone(&manager).spawn_watcher(cancel.clone());

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            warn!("could not listen for shutdown signal");
            return;
        }
        info!("shutdown signal received");
        shutdown.cancel();
    });

    let result = scheduler.run(cancel.clone()).await;
    cancel.cancel();
    let _ = prune_task.await;
    let _ = watcher_task.await;

    let counters = scheduler.counters();
    info!(
        ticks = counters.ticks,
        proposals = counters.proposals,
        applied = counters.applied,
        dry_runs = counters.dry_runs,
        skipped = counters.skipped,
        failed = counters.failed,
        "final counters"
    );
    result?;
    Ok(())
}

/// Seed a handful of pods with deliberately oversized allocations so a
/// `--simulate` run produces visible downscale decisions.
fn seed_simulation(cluster: &FakeCluster, metrics: &SimulatedMetricsProvider) {
    cluster.add_node(NodeInfo {
        name: "sim-node-1".into(),
        allocatable_cpu_milli: 16_000,
        allocatable_mem_bytes: 32 * 1024 * 1024 * 1024,
    });
    for i in 0..3 {
        let name = format!("demo-web-{}", i);
        cluster.add_pod(PodSnapshot {
            namespace: "default".into(),
            name: name.clone(),
            uid: format!("sim-uid-{}", i),
            node_name: Some("sim-node-1".into()),
            phase: PodPhase::Running,
            labels: HashMap::from([("app".to_string(), "demo-web".to_string())]),
            annotations: HashMap::new(),
            owner: Some(OwnerRef { kind: WorkloadKind::Deployment, name: "demo-web".into() }),
            containers: vec![ContainerInfo {
                name: "app".into(),
                resources: ResourceSpec::new(
                    1000,
                    2000,
                    1024 * BYTES_PER_MIB,
                    2048 * BYTES_PER_MIB,
                ),
                restart_count: 0,
            }],
            started_at: Some(chrono::Utc::now() - chrono::Duration::minutes(30)),
            resize_status: None,
        });
    }
    // the demo profiles use a fraction of the allocation
    for i in 0..3 {
        metrics.add_profile(SimulatedProfile {
            namespace: "default".into(),
            pod: format!("demo-web-{}", i),
            container: "app".into(),
            cpu_milli: 120,
            mem_bytes: 200 * BYTES_PER_MIB,
        });
    }
}
