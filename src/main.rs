use std::sync::Arc;

use okx_repeater::config::{self, Config};
use okx_repeater::filter::SequenceFilter;
use okx_repeater::upstream::{self, UpstreamEndpoint};
use okx_repeater::{broadcast, logging};
use tokio::signal;
use tokio_util::sync::CancellationToken;

fn main() -> anyhow::Result<()> {
    // rustls >= 0.23 requires an explicit CryptoProvider installation,
    // executed exactly once and as early as possible.
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls CryptoProvider");

    let config = config::load_config("config.json")?;
    logging::init(config.debug);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.threads)
        .enable_all()
        .build()?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> anyhow::Result<()> {
    let endpoints: Vec<UpstreamEndpoint> = config
        .okx_connections
        .iter()
        .map(|url| UpstreamEndpoint::parse(url))
        .collect::<Result<_, _>>()?;

    let bind_addr: std::net::SocketAddr =
        format!("{}:{}", config.repeater_server.host, config.repeater_server.port).parse()?;
    let server = broadcast::Server::bind(bind_addr).await?;
    let registry_handle = server.registry();
    log::info!("listening on {bind_addr}");

    let shutdown = CancellationToken::new();
    let filter = Arc::new(SequenceFilter::new());
    let subscription_message = config.subscription_message.to_string();
    let debug = config.debug;

    let mut handles = Vec::new();

    let server_shutdown = shutdown.clone();
    handles.push(tokio::spawn(async move {
        if let Err(err) = server.run(debug, server_shutdown).await {
            log::error!("broadcast server exited: {err}");
        }
    }));

    for endpoint in endpoints {
        let filter = filter.clone();
        let registry = registry_handle.clone();
        let subscription_message = subscription_message.clone();
        let upstream_shutdown = shutdown.clone();

        handles.push(tokio::spawn(async move {
            let on_frame = {
                let filter = filter.clone();
                move |frame: String| {
                    if filter.process(&frame, debug) {
                        registry.broadcast(frame);
                    }
                }
            };

            upstream::run(endpoint, subscription_message, debug, on_frame, upstream_shutdown).await;
        }));
    }

    wait_for_shutdown_signal().await;
    log::info!("shutdown signal received, stopping");
    shutdown.cancel();

    for handle in handles {
        let _ = handle.await;
    }

    log::info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("ctrl-c received");
        }
        _ = terminate_signal() => {
            log::info!("terminate signal received");
        }
    }
}

#[cfg(unix)]
async fn terminate_signal() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(_) => std::future::pending::<()>().await,
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await;
}
