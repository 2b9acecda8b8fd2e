//! veil, an X11 compositing manager.

mod backend;
mod config;
mod core;
mod damage;
mod events;
mod kernel;
mod paint;
mod preproc;
mod props;
mod redirect;
mod region;
mod rules;
mod session;
mod stack;
mod win;
mod xerror;

use std::path::PathBuf;

use anyhow::Result;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::session::{RunOutcome, Session};

fn usage() {
    println!("usage: veil [options]");
    println!();
    println!("  --config <path>      use this config file");
    println!("  --benchmark <n>      paint n frames, then exit");
    println!("  --monitor-repaint    highlight the repainted region");
    println!("  -h, --help           show this help");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "veil=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config_path: Option<PathBuf> = None;
    let mut benchmark: Option<u32> = None;
    let mut monitor_repaint = false;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config_path = args.next().map(PathBuf::from),
            "--benchmark" => benchmark = args.next().and_then(|v| v.parse().ok()),
            "--monitor-repaint" => monitor_repaint = true,
            "-h" | "--help" => {
                usage();
                return Ok(());
            }
            other => warn!("Ignoring unknown argument {:?}", other),
        }
    }

    info!("Starting veil {}", env!("CARGO_PKG_VERSION"));

    // SIGUSR1 tears the session down and builds a fresh one on the same
    // process; everything else exits the loop.
    loop {
        let mut config = Config::load(config_path.as_deref())?;
        if let Some(n) = benchmark {
            config.general.benchmark = n;
        }
        if monitor_repaint {
            config.general.monitor_repaint = true;
        }

        let mut session = Session::new(config)?;
        let outcome = session.run().await;
        session.destroy();
        match outcome? {
            RunOutcome::Quit => break,
            RunOutcome::Reset => {
                info!("Reinitializing session");
                continue;
            }
        }
    }

    Ok(())
}
