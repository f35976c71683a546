use crate::imagehandler::{EmbeddedPayloadFactory, ImageFileSystem, ImageRegistry, StreamFactory};
use crate::reconciler::ReconcileEngine;
use crate::secrets::KubeSecretSource;
use crate::state::ControllerContext;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod conditions;
mod config;
mod crd;
mod imagehandler;
mod reconciler;
mod retry;
mod secret_bytes;
mod secrets;
mod state;
mod webserver;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

static DEFAULT_CONFIG_PATH: &str = "/etc/image-customization-controller/config.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    info!(
        "Starting image-customization-controller {}",
        env!("CARGO_PKG_VERSION")
    );

    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = config::load_config(&config_path)?;

    let factory: Arc<dyn StreamFactory> = Arc::new(EmbeddedPayloadFactory::new(
        config.images.max_network_data_bytes,
    ));
    let registry = Arc::new(ImageRegistry::new(
        config.images.base_url.clone(),
        factory.clone(),
    ));
    let filesystem = Arc::new(ImageFileSystem::new(
        registry.clone(),
        factory,
        config.images.base_image_path.clone(),
    ));
    info!(
        "Serving images generated from {} at {}",
        config.images.base_image_path.display(),
        config.images.base_url
    );

    let client = reconciler::create_client().await?;
    let ctx = ControllerContext {
        kube_client: client.clone(),
        engine: ReconcileEngine::new(KubeSecretSource::new(client), registry),
    };

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let controller = tokio::spawn(reconciler::run(
        ctx,
        config.controller.namespace.clone(),
        shutdown.clone(),
    ));

    let app = webserver::create_app(filesystem);
    let addr = SocketAddr::new(config.webserver.bind_address, config.webserver.port);
    info!("Starting webserver on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    // the webserver can also stop on its own, take the controller down with it
    shutdown.cancel();
    controller.await?;
    info!("Shutdown complete");

    Ok(())
}

async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", err);
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!("Failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
    shutdown.cancel();
}
