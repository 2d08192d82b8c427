//! WhatsApp ingress service.
//!
//! ```text
//! Meta calls `/gateway/whatsapp/{token}/update`; verified messages are stored as
//! conversation messages and fire the configured hooks.
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use gwb_core::platforms::whatsapp::{
    AudioTranscoder, FfmpegTranscoder, GraphMediaFetcher, OutboundSender, PassthroughTranscoder,
    ReqwestTransport,
};
use gwb_core::store::open_store;
use gwb_core::{ActionRegistry, BridgeConfig};
use gwb_ingress_whatsapp::{DispatchSettings, Dispatcher, IngressConfig, Normalizer, router};
use gwb_telemetry::install as init_telemetry;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    init_telemetry("ingress-whatsapp")?;
    let config = IngressConfig::from_env()?;
    let store = open_store(&config.database)?;

    let actions = ActionRegistry::with_builtins();
    let bridge = match &config.bridge_config {
        Some(path) => {
            let bridge = BridgeConfig::load(path)?;
            bridge.validate(&actions)?;
            bridge.seed(store.as_ref()).await?;
            bridge
        }
        None => BridgeConfig::default(),
    };

    let transport = Arc::new(
        ReqwestTransport::new(config.graph_timeout).context("building graph client")?,
    );
    let fetcher = Arc::new(GraphMediaFetcher::new(
        transport.clone(),
        config.api_base.clone(),
    ));
    let transcoder: Arc<dyn AudioTranscoder> = match &config.ffmpeg {
        Some(binary) => Arc::new(FfmpegTranscoder::new(binary.clone())),
        None => Arc::new(PassthroughTranscoder),
    };
    let sender = Arc::new(OutboundSender::new(
        store.clone(),
        transport,
        config.api_base.clone(),
    ));
    let settings = DispatchSettings {
        identity: bridge.identity,
        dispatch: bridge.dispatch,
        actions,
    };
    let dispatcher = Dispatcher::new(
        store,
        Normalizer::new(fetcher, transcoder),
        sender,
        settings,
    );

    let app = router(Arc::new(dispatcher));
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    info!(addr = %config.bind, "ingress-whatsapp listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
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
    info!("shutting down");
}
