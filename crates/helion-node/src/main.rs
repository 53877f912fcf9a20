//! Daemon entry point.

mod api;
mod config;
mod hostcall;
mod kernel;
mod tasks;

use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tracing::info;

use config::Args;
use kernel::Kernel;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let bind = format!("{}:{}", args.host, args.port);

    let kernel = Kernel::boot(args)?;
    let app = api::router(Arc::clone(&kernel));

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(%bind, data_dir = %kernel.args.data_dir.display(), "helion-node listening");

    // Background work starts only after the listener binds.
    kernel.start_background();

    let shutdown_kernel = Arc::clone(&kernel);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown_kernel.shutdown().await;
        })
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
