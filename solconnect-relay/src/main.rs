use clap::Parser;
use tracing_subscriber::EnvFilter;

use solconnect_relay::config::RelayConfig;
use solconnect_relay::server::Server;

/// Exit codes per the CLI surface: 0 graceful, 1 config error,
/// 2 bind failure, 3 fatal runtime error.
#[tokio::main]
async fn main() -> std::process::ExitCode {
    let json_logs = std::env::var("SOLCONNECT_RELAY_LOG_JSON").unwrap_or_default() == "1";
    let filter =
        EnvFilter::from_default_env().add_directive("solconnect_relay=info".parse().unwrap());
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = RelayConfig::parse();
    if let Err(e) = config.validate() {
        tracing::error!("configuration error: {e}");
        return std::process::ExitCode::from(1);
    }

    tracing::info!(listen = %config.listen, "starting solconnect-relay");
    let server = Server::new(config);
    match server.run().await {
        Ok(()) => std::process::ExitCode::from(0),
        Err(e) => {
            let message = e.to_string();
            tracing::error!("fatal error: {message}");
            if message.contains("failed to bind") {
                std::process::ExitCode::from(2)
            } else {
                std::process::ExitCode::from(3)
            }
        }
    }
}
