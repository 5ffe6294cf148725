//! blob-transfer entry point.

use registry_blob_transfer::cli::{Args, Runner};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let args = Args::parse_args();

    let default_filter = if args.quiet {
        "error"
    } else if args.verbose {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .init();

    let runner = Runner::new(args);
    let cancel = runner.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("SIGINT received, cancelling transfers");
            cancel.cancel();
        }
    });

    if let Err(e) = runner.run().await {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}
