//! Workload generator for exercising range migrations in-process.
//!
//! Writer clients hammer one collection through the catalog-routed client
//! path while migration drivers keep moving random ranges between shards,
//! occasionally interrupting them. At the end every acknowledged write must
//! be readable and every shard must agree with the catalog.

use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chunkmove::{
    u64_key, KeyRange, LocalCluster, MigrationConfig, MigrationState, RetryPolicy, ShardId,
};
use clap::{Parser, Subcommand};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::time;

const COLLECTION: &str = "workload";

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "chunkmove-workload")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
}

/// CLI options for running the workload.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// Number of shards in the cluster.
    #[arg(long, env = "CHUNKMOVE_SHARDS", default_value_t = 4)]
    shards: u64,

    /// Number of document ids; keys are `0..keys`.
    #[arg(long, env = "CHUNKMOVE_KEYS", default_value_t = 500)]
    keys: u64,

    /// Number of concurrent writer clients.
    #[arg(long, env = "CHUNKMOVE_CLIENTS", default_value_t = 8)]
    clients: u64,

    /// Number of concurrent migration drivers.
    #[arg(long, env = "CHUNKMOVE_DRIVERS", default_value_t = 2)]
    drivers: u64,

    /// Width of each migrated range, in ids.
    #[arg(long, env = "CHUNKMOVE_RANGE_WIDTH", default_value_t = 25)]
    range_width: u64,

    /// Percent of operations that are deletes (rest are upserts).
    #[arg(long, env = "CHUNKMOVE_DELETE_PCT", default_value_t = 10)]
    delete_pct: u8,

    /// Percent of migrations interrupted shortly after being requested.
    #[arg(long, env = "CHUNKMOVE_INTERRUPT_PCT", default_value_t = 20)]
    interrupt_pct: u8,

    /// Total runtime for the workload.
    #[arg(long, default_value = "10s")]
    duration: humantime::Duration,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Optional JSON file with migration settings. The flags below override it.
    #[arg(long, env = "CHUNKMOVE_CONFIG")]
    config: Option<PathBuf>,

    /// Maximum documents per clone batch.
    #[arg(long, env = "CHUNKMOVE_CLONE_BATCH_MAX_DOCS")]
    clone_batch_max_docs: Option<usize>,

    /// Soft byte cap per clone batch.
    #[arg(long, env = "CHUNKMOVE_CLONE_BATCH_MAX_BYTES")]
    clone_batch_max_bytes: Option<usize>,

    /// Transfer log bound; a migration that exceeds it aborts.
    #[arg(long, env = "CHUNKMOVE_XFER_LOG_MAX_ENTRIES")]
    xfer_log_max_entries: Option<usize>,

    /// Transfer log entries shipped per call.
    #[arg(long, env = "CHUNKMOVE_XFER_BATCH_MAX_ENTRIES")]
    xfer_batch_max_entries: Option<usize>,

    /// Longest a range may stay write-blocked for the final drain.
    #[arg(long, env = "CHUNKMOVE_FINAL_DRAIN_WINDOW")]
    final_drain_window: Option<humantime::Duration>,

    /// Deadline for the cloning phase (0s disables).
    #[arg(long, env = "CHUNKMOVE_CLONE_TIMEOUT")]
    clone_timeout: Option<humantime::Duration>,

    /// Deadline for catching up before the final drain (0s disables).
    #[arg(long, env = "CHUNKMOVE_CATCHUP_TIMEOUT")]
    catchup_timeout: Option<humantime::Duration>,

    /// Per-attempt deadline for catalog and recipient commits (0s disables).
    #[arg(long, env = "CHUNKMOVE_COMMIT_TIMEOUT")]
    commit_timeout: Option<humantime::Duration>,

    /// Pause between drains while a backlog remains.
    #[arg(long, env = "CHUNKMOVE_STEADY_POLL_INTERVAL")]
    steady_poll_interval: Option<humantime::Duration>,

    /// Delay before a donor deletes a range it gave away.
    #[arg(long, env = "CHUNKMOVE_RANGE_DELETION_DELAY")]
    range_deletion_delay: Option<humantime::Duration>,

    /// Idle time after which a recipient's incoming session may be displaced (0s never).
    #[arg(long, env = "CHUNKMOVE_RECIPIENT_IDLE_TIMEOUT")]
    recipient_idle_timeout: Option<humantime::Duration>,

    /// Finished migrations kept for status queries.
    #[arg(long, env = "CHUNKMOVE_STATUS_HISTORY")]
    status_history: Option<usize>,

    /// When true, any failed client write aborts the run.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    fail_fast: bool,

    /// Write the JSON summary to this path instead of stdout.
    #[arg(long)]
    out: Option<PathBuf>,
}

/// Outcome counts for one run.
#[derive(serde::Serialize, Debug, Default)]
struct Summary {
    seed: u64,
    shards: u64,
    keys: u64,
    duration_ms: u64,
    writes: u64,
    deletes: u64,
    write_errors: u64,
    requested: u64,
    committed: u64,
    interrupts_sent: u64,
    /// Request rejections and aborts, by error kind.
    rejected: BTreeMap<String, u64>,
    aborted: BTreeMap<String, u64>,
    final_routing: Vec<String>,
}

/// What one writer last got acknowledged per id. `None` means deleted.
type Acked = BTreeMap<u64, Option<Vec<u8>>>;

#[derive(Default)]
struct ClientStats {
    writes: u64,
    deletes: u64,
    errors: u64,
}

#[derive(Default)]
struct DriverStats {
    requested: u64,
    committed: u64,
    interrupts_sent: u64,
    rejected: BTreeMap<String, u64>,
    aborted: BTreeMap<String, u64>,
}

#[tokio::main]
/// Parse CLI args, initialize logging, and run the requested subcommand.
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chunkmove=warn,chunkmove_workload=info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Run(args) => run(args).await,
    }
}

impl RunArgs {
    /// Config file (or workload defaults) with command-line overrides applied.
    fn migration_config(&self) -> anyhow::Result<MigrationConfig> {
        let mut cfg = match &self.config {
            Some(path) => MigrationConfig::from_json_file(path)?,
            None => MigrationConfig {
                range_deletion_delay: Duration::from_millis(50),
                ..MigrationConfig::default()
            },
        };
        let duration = |d: &Option<humantime::Duration>| d.as_ref().map(|d| **d);
        if let Some(v) = self.clone_batch_max_docs {
            cfg.clone_batch_max_docs = v;
        }
        if let Some(v) = self.clone_batch_max_bytes {
            cfg.clone_batch_max_bytes = v;
        }
        if let Some(v) = self.xfer_log_max_entries {
            cfg.xfer_log_max_entries = v;
        }
        if let Some(v) = self.xfer_batch_max_entries {
            cfg.xfer_batch_max_entries = v;
        }
        if let Some(v) = duration(&self.final_drain_window) {
            cfg.final_drain_window = v;
        }
        if let Some(v) = duration(&self.clone_timeout) {
            cfg.clone_timeout = v;
        }
        if let Some(v) = duration(&self.catchup_timeout) {
            cfg.catchup_timeout = v;
        }
        if let Some(v) = duration(&self.commit_timeout) {
            cfg.commit_timeout = v;
        }
        if let Some(v) = duration(&self.steady_poll_interval) {
            cfg.steady_poll_interval = v;
        }
        if let Some(v) = duration(&self.range_deletion_delay) {
            cfg.range_deletion_delay = v;
        }
        if let Some(v) = duration(&self.recipient_idle_timeout) {
            cfg.recipient_idle_timeout = v;
        }
        if let Some(v) = self.status_history {
            cfg.status_history = v;
        }
        cfg.validate().context("invalid migration settings")?;
        Ok(cfg)
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.shards >= 2, "--shards must be >= 2");
    anyhow::ensure!(args.keys > 0, "--keys must be > 0");
    anyhow::ensure!(args.clients > 0, "--clients must be > 0");
    anyhow::ensure!(args.range_width > 0, "--range-width must be > 0");
    anyhow::ensure!(args.delete_pct <= 100, "--delete-pct must be <= 100");
    anyhow::ensure!(args.interrupt_pct <= 100, "--interrupt-pct must be <= 100");

    let cfg = args.migration_config()?;
    let seed = if args.seed == 0 {
        rand::thread_rng().gen()
    } else {
        args.seed
    };
    let duration: Duration = args.duration.into();

    let shard_ids: Vec<ShardId> = (1..=args.shards).collect();
    let cluster = Arc::new(LocalCluster::new(&shard_ids, cfg, RetryPolicy::default()));
    cluster
        .create_collection(COLLECTION, shard_ids[0])
        .context("create collection")?;
    for id in 0..args.keys {
        cluster
            .write(COLLECTION, u64_key(id), value(u64::MAX, id, 0))
            .await
            .context("seed write")?;
    }
    tracing::info!(
        seed,
        shards = args.shards,
        keys = args.keys,
        clients = args.clients,
        drivers = args.drivers,
        "workload starting"
    );

    let deadline = time::Instant::now() + duration;
    let mut clients = Vec::with_capacity(args.clients as usize);
    for client in 0..args.clients {
        let cluster = cluster.clone();
        let args = args.clone();
        // Mix the base seed with the client id for deterministic per-client RNG.
        let seed = seed ^ client.wrapping_mul(0x9e3779b97f4a7c15);
        clients.push(tokio::spawn(async move {
            run_client(cluster, client, args, seed, deadline).await
        }));
    }
    let mut drivers = Vec::with_capacity(args.drivers as usize);
    for driver in 0..args.drivers {
        let cluster = cluster.clone();
        let args = args.clone();
        let seed = seed ^ (driver + 1).wrapping_mul(0xbf58476d1ce4e5b9);
        drivers.push(tokio::spawn(async move {
            run_driver(cluster, args, seed, deadline).await
        }));
    }

    let mut summary = Summary {
        seed,
        shards: args.shards,
        keys: args.keys,
        duration_ms: duration.as_millis() as u64,
        ..Summary::default()
    };
    let mut expected = Acked::new();
    for task in clients {
        let (acked, stats) = task.await.context("client task panicked")??;
        expected.extend(acked);
        summary.writes += stats.writes;
        summary.deletes += stats.deletes;
        summary.write_errors += stats.errors;
    }
    for task in drivers {
        let stats = task.await.context("driver task panicked")?;
        summary.requested += stats.requested;
        summary.committed += stats.committed;
        summary.interrupts_sent += stats.interrupts_sent;
        merge_counts(&mut summary.rejected, stats.rejected);
        merge_counts(&mut summary.aborted, stats.aborted);
    }

    verify(&cluster, &expected).await?;
    summary.final_routing = cluster
        .catalog
        .routing(COLLECTION)
        .map(|routing| {
            routing
                .chunks
                .iter()
                .map(|chunk| format!("{} -> shard {}", chunk.range, chunk.owner))
                .collect()
        })
        .unwrap_or_default();

    let data = serde_json::to_vec_pretty(&summary).context("serialize summary")?;
    match &args.out {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create dir {}", parent.display()))?;
            }
            std::fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
            eprintln!("wrote summary: {}", path.display());
        }
        None => println!("{}", String::from_utf8_lossy(&data)),
    }
    Ok(())
}

fn value(client: u64, id: u64, seq: u64) -> Vec<u8> {
    format!("c{client}:{id}:{seq}").into_bytes()
}

fn merge_counts(into: &mut BTreeMap<String, u64>, from: BTreeMap<String, u64>) {
    for (kind, count) in from {
        *into.entry(kind).or_default() += count;
    }
}

/// Issue routed writes to this client's ids until the deadline.
async fn run_client(
    cluster: Arc<LocalCluster>,
    client: u64,
    args: RunArgs,
    seed: u64,
    deadline: time::Instant,
) -> anyhow::Result<(Acked, ClientStats)> {
    let mut rng = SmallRng::seed_from_u64(seed);
    let ids: Vec<u64> = (client..args.keys).step_by(args.clients as usize).collect();
    let mut acked = Acked::new();
    let mut stats = ClientStats::default();
    if ids.is_empty() {
        return Ok((acked, stats));
    }

    let mut seq = 0u64;
    while time::Instant::now() < deadline {
        seq += 1;
        let id = ids[rng.gen_range(0..ids.len())];
        let delete = rng.gen_range(0..100) < u32::from(args.delete_pct);
        let result = if delete {
            cluster.delete(COLLECTION, u64_key(id)).await.map(|_| None)
        } else {
            let body = value(client, id, seq);
            cluster
                .write(COLLECTION, u64_key(id), body.clone())
                .await
                .map(|_| Some(body))
        };
        match result {
            Ok(latest) => {
                if delete {
                    stats.deletes += 1;
                } else {
                    stats.writes += 1;
                }
                acked.insert(id, latest);
            }
            Err(err) => {
                stats.errors += 1;
                tracing::warn!(client, id, error = %err, "client write failed");
                if args.fail_fast {
                    anyhow::bail!("client {client} write to id {id} failed: {err}");
                }
            }
        }
        if seq % 64 == 0 {
            tokio::task::yield_now().await;
        }
    }
    Ok((acked, stats))
}

/// Keep moving random ranges to random shards until the deadline.
async fn run_driver(
    cluster: Arc<LocalCluster>,
    args: RunArgs,
    seed: u64,
    deadline: time::Instant,
) -> DriverStats {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut stats = DriverStats::default();
    let shard_ids = cluster.shard_ids();
    let slots = args.keys.div_ceil(args.range_width);

    while time::Instant::now() < deadline {
        let start = rng.gen_range(0..slots) * args.range_width;
        let range = KeyRange::u64s(start, start + args.range_width);
        let to = shard_ids[rng.gen_range(0..shard_ids.len())];

        stats.requested += 1;
        let handle = match cluster.request_migration(COLLECTION, range.clone(), to).await {
            Ok(handle) => handle,
            Err(err) => {
                *stats.rejected.entry(err.kind().to_string()).or_default() += 1;
                time::sleep(Duration::from_millis(rng.gen_range(1..5))).await;
                continue;
            }
        };

        if rng.gen_range(0..100) < u32::from(args.interrupt_pct) {
            time::sleep(Duration::from_millis(rng.gen_range(0..10))).await;
            if cluster.interrupt(handle.session_id()).is_ok() {
                stats.interrupts_sent += 1;
            }
        }

        match handle.wait().await {
            Ok(status) if status.state == MigrationState::Committed => {
                stats.committed += 1;
                tracing::info!(session_id = %status.session_id, range = %range, to, "migration committed");
            }
            Ok(status) => {
                let kind = status
                    .last_error
                    .as_ref()
                    .map_or("unknown", |err| err.kind());
                *stats.aborted.entry(kind.to_string()).or_default() += 1;
            }
            Err(err) => {
                tracing::error!(error = %err, "migration task failed");
                *stats.aborted.entry(err.kind().to_string()).or_default() += 1;
            }
        }
    }
    stats
}

/// Check every acknowledged write and the ownership layout.
async fn verify(cluster: &LocalCluster, expected: &Acked) -> anyhow::Result<()> {
    anyhow::ensure!(
        cluster.registry.is_empty(),
        "{} migrations still registered after the run",
        cluster.registry.len()
    );
    cluster
        .verify_ownership(COLLECTION)
        .context("shards disagree with the catalog")?;
    for (id, want) in expected {
        let got = cluster
            .read(COLLECTION, &u64_key(*id))
            .await
            .with_context(|| format!("read id {id}"))?;
        anyhow::ensure!(
            got == *want,
            "id {id}: expected {:?}, read {:?}",
            want.as_deref().map(String::from_utf8_lossy),
            got.as_deref().map(String::from_utf8_lossy)
        );
    }
    tracing::info!(checked = expected.len(), "all acknowledged writes readable");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_args(extra: &[&str]) -> RunArgs {
        let argv = ["chunkmove-workload", "run"].iter().chain(extra).copied();
        match Args::try_parse_from(argv).expect("parse args").cmd {
            Command::Run(args) => args,
        }
    }

    #[test]
    fn flags_override_migration_defaults() {
        let cfg = run_args(&[
            "--xfer-log-max-entries",
            "7",
            "--final-drain-window",
            "250ms",
            "--recipient-idle-timeout",
            "0s",
        ])
        .migration_config()
        .expect("config");
        assert_eq!(cfg.xfer_log_max_entries, 7);
        assert_eq!(cfg.final_drain_window, Duration::from_millis(250));
        assert_eq!(cfg.recipient_idle_timeout, Duration::ZERO);
        assert_eq!(cfg.range_deletion_delay, Duration::from_millis(50));
        assert_eq!(
            cfg.clone_batch_max_docs,
            MigrationConfig::default().clone_batch_max_docs
        );
    }

    #[test]
    fn invalid_overrides_are_rejected() {
        let err = run_args(&["--xfer-batch-max-entries", "0"])
            .migration_config()
            .expect_err("zero batch");
        assert!(format!("{err:#}").contains("xfer_batch_max_entries"));
    }
}
