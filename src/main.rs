// src/main.rs — rlm entry point

use clap::Parser;
use tokio_util::sync::CancellationToken;

use rlm::cli::Cli;
use rlm::core::cancel;
use rlm::infra::logger;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    logger::init_logging(if cli.verbose { "debug" } else { "warn" });

    let token = CancellationToken::new();
    let listener = cancel::install_interrupt_handler(token.clone());

    let code = rlm::cli::run::run(cli, token.clone()).await;
    token.cancel();
    let _ = listener.await;
    std::process::exit(code);
}
