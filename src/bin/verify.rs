use std::path::PathBuf;

use clap::Parser;

use waypoint_router::config::RouterRegistryConfig;
use waypoint_router::request::Schema;

/// Offline configuration checker: parses every rule, override, default
/// upstream and host pattern in a registry file without ever connecting to
/// a dynamic backend. The `waypoint-verify` analogue of the teacher's
/// lint/verify binary.
#[derive(Parser, Debug)]
#[command(name = "waypoint-verify")]
#[command(about = "Validate a waypoint-router config file offline")]
struct Args {
    #[arg(short, long)]
    config: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let schema = Schema::builtin();

    let registry = RouterRegistryConfig::from_file(&args.config)?;
    match registry.validate(&schema) {
        Ok(()) => {
            println!("{}: ok ({} router(s))", args.config.display(), registry.routers.len());
            Ok(())
        }
        Err(err) => {
            eprintln!("{}: {err}", args.config.display());
            std::process::exit(1);
        }
    }
}
