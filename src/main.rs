//! Stackform CLI: declarative infrastructure stacks.

use clap::Parser;
use stackform::cli::Cli;
use stackform::core::context::CancelToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "stackform=info",
        _ => "stackform=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupted: finishing in-flight operations");
            on_interrupt.cancel();
        }
    });

    if let Err(e) = stackform::cli::dispatch(cli.command, cancel).await {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
