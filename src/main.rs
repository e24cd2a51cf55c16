use ollamamux::config::MuxConfig;
use ollamamux::router::CommandRouter;
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Log filter variable; stdout belongs to the backend, so logs go to stderr
const LOG_FILTER_VAR: &str = "OLLAMAMUX_LOG";
const DEFAULT_LOG_FILTER: &str = "ollamamux=warn";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(LOG_FILTER_VAR)
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args_os()
        .skip(1)
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();

    let code = match run(&args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("ollamamux: {}", e);
            1
        }
    };

    debug!(code, "Exiting");
    std::process::exit(code);
}

async fn run(args: &[String]) -> Result<i32, ollamamux::error::MuxError> {
    let config = Arc::new(MuxConfig::from_env()?);
    debug!(
        public = %config.hosts.public,
        execution = %config.hosts.execution,
        delegated = config.delegated_owner,
        "Configuration resolved"
    );
    CommandRouter::new(config).run(args).await
}
