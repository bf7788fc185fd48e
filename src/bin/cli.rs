//! One-shot runner: queues events from stdin, dispatches everything pending
//! once and exits when the workers are done.
//!
//! ```text
//! echo nginx:1.27 | kobold-cli dockerhub
//! kobold-cli            # dispatch tasks already pending in the journal
//! ```
//!
//! Settings come from the same `KOBOLD_*` environment as the server, e.g.
//! `KOBOLD_SCHEDULER__HANDLER=print` or `KOBOLD_SCHEDULER__POOL_SIZE=2`.

use std::io::IsTerminal;
use std::process::ExitCode;

use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;

use kobold::app::{App, init_tracing};
use kobold::config::Settings;
use kobold::metrics::Metrics;

const USAGE: &str = "usage: kobold-cli [CHANNEL] < events";

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "run failed");
            eprintln!("kobold-cli: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::load()?;
    init_tracing(settings.log.format);

    let channel = std::env::args().nth(1);
    if channel.as_deref().is_some_and(|c| c.starts_with('-')) {
        return Err(USAGE.into());
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, cancelling");
            signal.cancel();
        }
    });

    let app = App::build(&settings, &shutdown, Metrics::noop())?;

    let piped = !std::io::stdin().is_terminal();
    match (channel, piped) {
        (Some(channel), true) => {
            let ids = app
                .pool
                .queue_lines(&channel, BufReader::new(tokio::io::stdin()))
                .await?;
            tracing::info!(channel = %channel, tasks = ids.len(), "queued events from stdin");
        }
        (Some(_), false) => tracing::warn!("stdin is a terminal, nothing queued"),
        (None, true) => return Err(USAGE.into()),
        (None, false) => {}
    }

    app.pool.dispatch().await?;
    app.pool.wait().await?;
    Ok(())
}
