use clap::Parser;
use minicat::{config::Config, ErrorReportValve, Exchange, Next, Pipeline, PipelineAdapter, Server, Valve};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "minicat", version)]
#[command(about = "Minimal HTTP/1.1 application server", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides the configuration file
    #[arg(short, long)]
    address: Option<SocketAddr>,
}

/// Greets with the request path, or echoes the form parameters for `/params`.
struct Greeting;

impl Valve for Greeting {
    fn invoke(&self, exchange: &mut Exchange<'_>, _: Next<'_>) -> anyhow::Result<()> {
        let body = match exchange.request().uri() {
            "/params" => {
                let mut pairs: Vec<String> = exchange
                    .parameters()?
                    .iter()
                    .map(|(name, value)| format!("{name}={value}"))
                    .collect();
                pairs.sort();
                pairs.join("\n")
            }
            "/" => "Hello from minicat!".to_owned(),
            _ => {
                exchange.response_mut().set_status(404u16);
                return Ok(());
            }
        };

        exchange
            .response_mut()
            .set_content_type("text/plain")
            .set_character_encoding("utf-8")
            .set_content_length(body.len() as u64);
        exchange.write_body(body.as_bytes())?;
        Ok(())
    }

    fn name(&self) -> &str {
        "Greeting"
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "minicat=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(address) = cli.address {
        config.server.address = address;
    }

    tracing::info!(
        address = %config.server.address,
        max_connections = config.server.max_connections,
        workers = config.server.worker_threads,
        "configuration loaded"
    );

    let mut pipeline = Pipeline::new();
    pipeline
        .set_basic(Arc::new(Greeting))
        .add_valve(Arc::new(ErrorReportValve));

    let handle = Server::builder()
        .config(config)
        .adapter(Arc::new(PipelineAdapter::new(pipeline)))
        .build()
        .launch()?;

    tracing::info!(address = %handle.local_addr(), "listening for connections");
    handle.join();
    Ok(())
}
