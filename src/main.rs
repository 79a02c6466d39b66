use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{debug, info};

use xpctl::cli::{self, Cli, Command};
use xpctl::config::load_settings;
use xpctl::dispatcher::Dispatcher;
use xpctl::remote::XpipeClient;
use xpctl::session::SessionRegistry;
use xpctl::Result;

/// Overrides -v/-q when set
const LOG_VAR: &str = "XPCTL_LOG";

#[tokio::main]
async fn main() -> ExitCode {
    // .env may carry XPCTL_API_KEY / XPCTL_CONFIG, so load it before parsing
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_logging(&cli);

    let json = cli.wants_json();
    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            debug!("{:?}", e);
            eprintln!("{}", cli::render_error(&e, json));
            ExitCode::from(e.exit_code())
        }
    }
}

fn init_logging(cli: &Cli) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_env(LOG_VAR).unwrap_or_else(|_| EnvFilter::new(cli.log_filter()));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> Result<u8> {
    let settings = load_settings(cli.config.as_deref(), cli.api_url.as_deref(), |name| {
        std::env::var(name).ok()
    })?;
    info!("xpctl v{} using {}", env!("CARGO_PKG_VERSION"), settings.client.api_url);

    let client = XpipeClient::new(settings.client.clone(), settings.credential)?;
    let dispatcher = Dispatcher::new(
        Arc::new(client),
        Arc::new(SessionRegistry::new()),
        &settings.client,
    );

    cli::execute(cli.command.unwrap_or(Command::Console), &dispatcher).await
}
