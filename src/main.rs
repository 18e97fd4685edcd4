use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use waypoint_router::config::RouterRegistryConfig;
use waypoint_router::request::Schema;
use waypoint_router::router::Router;

/// Upstream selection server.
///
/// The byte-proxying loop itself is out of scope for this binary (see
/// `SPEC_FULL.md` §1 Non-goals); what runs here builds the `Router`s,
/// connects and arms any dynamic backends, and would hand resolved
/// upstreams to whatever fronting proxy embeds this crate.
#[derive(Parser, Debug)]
#[command(name = "waypoint-router")]
#[command(about = "Upstream selection engine for a fronting reverse proxy")]
struct Args {
    #[arg(short, long, env = "WAYPOINT_CONFIG")]
    config: PathBuf,

    /// Serve by forking a worker process per configured router (see Open
    /// Question (a) in DESIGN.md: the source's `serve_forever` accepted a
    /// single ambiguous `fork` flag; this splits it into two explicit,
    /// mutually exclusive modes).
    #[arg(long, conflicts_with = "serve_thread")]
    serve_fork: bool,

    /// Serve each configured router's watch loop on its own thread within
    /// this process (the default if neither flag is given).
    #[arg(long, conflicts_with = "serve_fork")]
    serve_thread: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let mode = if args.serve_fork { "fork" } else { "thread" };
    info!(config = %args.config.display(), mode, "starting waypoint-router");

    let schema = Arc::new(Schema::builtin());
    let registry = RouterRegistryConfig::from_file(&args.config)?;
    let routers: Vec<Arc<Router>> = registry
        .build(Arc::clone(&schema))?
        .into_iter()
        .map(Arc::new)
        .collect();

    for router in &routers {
        if router.connect().is_ok() {
            info!(router = %router.name, "connected dynamic backend");
            router.load()?;
            router.watch()?;
            info!(router = %router.name, "dynamic watch armed");
        } else {
            info!(router = %router.name, "no dynamic backend configured, using static rules");
        }
    }

    if args.serve_fork {
        warn!("--serve-fork requested; this process model is delegated to the embedding supervisor (e.g. systemd, a process manager) rather than forked in-process");
    }

    info!(routers = routers.len(), "ready");
    loop {
        std::thread::park();
    }
}
