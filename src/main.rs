use std::net::SocketAddr;
use tracing::{error, info};

use cart_api::app::Application;
use cart_api::config;
use cart_api::handlers;

fn main() {
    if let Err(err) = run() {
        eprintln!("fatal: {err:#}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn run() -> anyhow::Result<()> {
    let config = config::load_config()?;
    config::init_tracing(&config.log_level, config.log_json);

    info!(
        service = %config.service_name,
        environment = %config.env_name,
        region = %config.aws_region,
        table = %config.dynamodb_table,
        bus = %config.eventbridge_bus_name,
        "starting"
    );

    let application = Application::build(config.clone()).await?;
    let router = handlers::router(application.state());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.app_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("draining shutdown hooks");
    if let Err(err) = application.shutdown(config.shutdown_timeout()).await {
        error!(error = %err, "shutdown finished with errors");
        return Err(err);
    }

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            error!("failed to install ctrl-c handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => error!(error = %err, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received ctrl-c"),
        () = terminate => info!("received SIGTERM"),
    }
}
