//! lio-worker - Per-session privileged worker binary.
//!
//! Spawned by the gateway, never by hand: identity arrives as a bootstrap
//! record on stdin and the orchestrator's connection on a reserved file
//! descriptor. A worker that cannot read a well-formed bootstrap record
//! has no identity and exits non-zero immediately.
//!
//! The bootstrap record is consumed synchronously, before the tokio
//! runtime starts, so nothing else can race for stdin; the runtime is then
//! constructed manually and the dispatch loop runs to completion.

use std::io::Read;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use lio_core::Bootstrap;
use lio_worker::context::WorkerContext;
use lio_worker::dispatch::run_worker;
use lio_worker::handlers::default_registry;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lio-worker", version, about = "Per-session worker for the LIO bridge")]
struct Cli {
    /// Print this binary's own SHA-256 digest and exit.
    ///
    /// Packaging embeds the digest into the orchestrator at build time;
    /// this flag is how the build gets it.
    #[arg(long)]
    print_digest: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.print_digest {
        return match print_own_digest() {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("lio-worker: {err:#}");
                ExitCode::FAILURE
            },
        };
    }

    // Refuse to run with a malformed or foreign bootstrap: without it the
    // process does not know whose session it is.
    let bootstrap = match read_bootstrap(&mut std::io::stdin().lock()) {
        Ok(bootstrap) => bootstrap,
        Err(err) => {
            eprintln!("lio-worker: fatal: {err:#}");
            return ExitCode::FAILURE;
        },
    };

    init_tracing(bootstrap.verbose);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("lio-worker: fatal: {err:#}");
            return ExitCode::FAILURE;
        },
    };

    let ctx = WorkerContext::new(bootstrap);
    let registry = default_registry();
    match runtime.block_on(run_worker(ctx, registry)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("worker failed: {err:#}");
            ExitCode::FAILURE
        },
    }
}

fn read_bootstrap(reader: &mut impl Read) -> Result<Bootstrap> {
    Bootstrap::read_from(reader).context("reading bootstrap record from stdin")
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_own_digest() -> Result<()> {
    let exe = std::env::current_exe().context("resolving own executable path")?;
    let digest = lio_core::integrity::file_digest(&exe).context("hashing own executable")?;
    println!("{digest}");
    Ok(())
}
