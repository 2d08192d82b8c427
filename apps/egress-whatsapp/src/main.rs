//! WhatsApp egress service.
//!
//! Polls the store for outbound conversation messages waiting to be sent and hands
//! them to the Graph API.

use std::sync::Arc;

use anyhow::{Context, Result};
use gwb_core::platforms::whatsapp::{OutboundSender, ReqwestTransport};
use gwb_core::store::open_store;
use gwb_egress_whatsapp::{EgressConfig, EgressWorker};
use gwb_telemetry::install as init_telemetry;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    init_telemetry("egress-whatsapp")?;
    let config = EgressConfig::from_env()?;
    let store = open_store(&config.database)?;

    let transport = Arc::new(
        ReqwestTransport::new(config.graph_timeout).context("building graph client")?,
    );
    let sender = Arc::new(OutboundSender::new(
        store.clone(),
        transport,
        config.api_base.clone(),
    ));
    let worker = EgressWorker::new(
        store,
        sender,
        config.batch,
        config.mode,
        config.sender_name.clone(),
    );

    info!(
        poll_secs = config.poll_interval.as_secs(),
        batch = config.batch,
        mode = ?config.mode,
        "egress-whatsapp started"
    );
    worker.run(config.poll_interval, shutdown_signal()).await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "unable to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "unable to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
