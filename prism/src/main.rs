use args::Args;
use clap::Parser;
use config::{Config, SharedConfig};
use tokio_util::sync::CancellationToken;

mod args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)?;

    let listen_address = args.listen.unwrap_or_else(|| config.server.listen_address());
    let config_path = (!args.no_watch).then(|| args.config.clone());

    let shutdown_signal = CancellationToken::new();

    {
        let shutdown_signal = shutdown_signal.clone();

        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown_signal.cancel();
            }
        });
    }

    server::serve(server::ServeConfig {
        listen_address,
        config: SharedConfig::new(config),
        config_path,
        shutdown_signal,
        log_filter: args.log_filter,
        version: env!("CARGO_PKG_VERSION").to_string(),
        bound_addr_sender: None,
    })
    .await
}
