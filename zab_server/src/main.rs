//! Zab server node executable.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use env_logger::Env;

use tokio::runtime::Builder;
use tokio::signal;

use zab::{
    parsed_config, pf_error, pf_info, pf_warn, LowestIdOracle, MemoryKv,
    ServerId, Zab, ZabConfig, ZabError,
};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// My server id, host:port; doubles as the peer-peer bind address.
    #[arg(short, long)]
    id: String,

    /// Comma-separated list of all ensemble members (including self).
    /// Example: '-s 10.0.0.1:7001,10.0.0.2:7001,10.0.0.3:7001'.
    #[arg(short, long, value_delimiter = ',')]
    servers: Vec<ServerId>,

    /// Path to the durable log directory.
    #[arg(short, long)]
    logdir: String,

    /// Heartbeat / election timeout in milliseconds.
    #[arg(short, long, default_value_t = 5000)]
    timeout: u64,

    /// Maximum proposals batched per log sync.
    #[arg(long, default_value_t = 1000)]
    sync_max_batch_size: usize,

    /// Snapshot self-triggering interval in seconds (0 disables).
    #[arg(long, default_value_t = 0)]
    snapshot_interval: u64,

    /// A member of an existing cluster to join through (for a server not
    /// listed in --servers).
    #[arg(long)]
    join_peer: Option<ServerId>,

    /// Optional TOML string overriding tuning knobs, e.g.
    /// 'timeout_ms = 2000'.
    #[arg(short, long)]
    config: Option<String>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments into an engine configuration.
    fn sanitize(&self) -> Result<ZabConfig, ZabError> {
        if self.threads < 2 {
            return Err(ZabError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )));
        }

        // tuning knobs come from defaults overridden by the TOML string;
        // identity always comes from the dedicated flags
        let mut config = parsed_config!(self.config.as_deref() => ZabConfig;
                                        timeout_ms, sync_max_batch_size,
                                        snapshot_interval_s)?;
        config.server_id = self.id.clone();
        config.servers = self.servers.clone();
        config.logdir = self.logdir.clone();
        config.join_peer = self.join_peer.clone();
        if self.timeout != 5000 {
            config.timeout_ms = self.timeout;
        }
        if self.sync_max_batch_size != 1000 {
            config.sync_max_batch_size = self.sync_max_batch_size;
        }
        if self.snapshot_interval != 0 {
            config.snapshot_interval_s = self.snapshot_interval;
        }

        config.validate()?;
        Ok(config)
    }
}

// Server node executable main entrance.
fn server_main() -> Result<(), ZabError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let config = args.sanitize()?;
    let id = config.server_id.clone();

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name(format!("tokio-worker-{}", id))
        .build()?;

    // enter tokio runtime, boot the participant, and run until removed
    // from the cluster or killed
    runtime.block_on(async move {
        let oracle = Arc::new(LowestIdOracle::new(if config.servers.is_empty()
        {
            vec![config.server_id.clone()]
        } else {
            config.servers.clone()
        })?);
        let state_machine = Arc::new(MemoryKv::new());
        let node = Zab::start(config, state_machine, oracle).await?;

        tokio::select! {
            result = node.wait() => result,
            _ = signal::ctrl_c() => {
                pf_info!(id; "interrupted, shutting down");
                Ok(())
            }
        }
    })
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_module_path(true)
        .format_target(false)
        .init();

    match server_main() {
        Ok(()) => ExitCode::from(0),
        Err(e @ ZabError::Corruption(_)) => {
            pf_error!("server"; "server_main exitted: {}", e);
            ExitCode::from(2)
        }
        Err(ZabError::LeftCluster) => {
            pf_warn!("server"; "removed from cluster by admin command");
            ExitCode::from(3)
        }
        Err(e) => {
            pf_error!("server"; "server_main exitted: {}", e);
            ExitCode::from(1)
        }
    }
}
