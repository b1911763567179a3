use clap::Parser as _;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt as _, util::SubscriberInitExt as _};

mod app;
mod cli;
mod server;

fn set_tracing_subscriber() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .try_init()?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = cli::Config::parse();
    set_tracing_subscriber()?;

    let app = app::App::new(&config)?;
    let router =
        server::router(app.service.clone(), &config.base_path);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!(
        addr = %config.bind_addr,
        base_path = %config.base_path,
        "serving wallet service api"
    );
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            drop(tokio::signal::ctrl_c().await);
            tracing::info!("shutting down");
        })
        .await?;
    drop(app);
    Ok(())
}
