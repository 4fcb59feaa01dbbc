//! Node runtime: one `VoidCore` plus its transport and system handlers.

use anyhow::{Context, Result};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use void_bus::{BroadcastHub, BroadcastTransport, Transport, VoidCore, WebSocketTransport};

use crate::config::{NodeConfig, TransportKind};
use crate::handlers::{register_system_handlers, system, BootState};
use crate::metrics::PrometheusRecorder;

pub struct NodeRuntime {
    config: NodeConfig,
    core: Arc<VoidCore>,
    boot: Arc<BootState>,
    hub: BroadcastHub,
}

impl NodeRuntime {
    pub fn new(config: NodeConfig) -> Result<Self> {
        Self::with_hub(config, BroadcastHub::new())
    }

    /// Runtime joining broadcast groups on `hub`, so several runtimes in one
    /// process can share traffic.
    pub fn with_hub(config: NodeConfig, hub: BroadcastHub) -> Result<Self> {
        config.validate()?;
        let core = VoidCore::new(config.bus.clone())
            .context("Failed to create VoidCore")?
            .with_metrics_recorder(Arc::new(PrometheusRecorder));
        let core = Arc::new(core);
        let boot = register_system_handlers(&core);
        boot.record("system handlers registered");

        Ok(Self {
            config,
            core,
            boot,
            hub,
        })
    }

    pub fn core(&self) -> &Arc<VoidCore> {
        &self.core
    }

    pub fn boot_state(&self) -> &Arc<BootState> {
        &self.boot
    }

    /// Start the node.
    ///
    /// ## Startup Sequence
    ///
    /// 1. Initialize the default in-process transport
    /// 2. Swap in the configured transport, if any
    /// 3. Send `system.boot.ready`
    pub async fn start(&self) -> Result<()> {
        info!("===========================================");
        info!("  VoidCore Node v{}", env!("CARGO_PKG_VERSION"));
        info!("  Core: {}", self.core.core_id());
        info!("===========================================");

        self.core
            .initialize()
            .await
            .context("Failed to initialize transport")?;
        self.boot.record("transport initialized");

        if let Some(transport) = self.build_transport()? {
            let kind = transport.kind();
            self.core
                .set_transport(transport)
                .await
                .with_context(|| format!("Failed to switch to {kind} transport"))?;
            self.boot.record(format!("{kind} transport installed"));
        }

        let ack = self
            .core
            .send_intent(system::BOOT_READY, json!({"transport": self.config.transport.as_str()}))
            .await
            .context("Boot handshake failed")?;
        info!(
            transport = %self.config.transport,
            mode = %self.core.channel_mode(),
            status = %ack["status"],
            "Node ready"
        );
        Ok(())
    }

    fn build_transport(&self) -> Result<Option<Arc<dyn Transport>>> {
        let transport: Arc<dyn Transport> = match self.config.transport {
            TransportKind::InProcess => return Ok(None),
            TransportKind::WebSocket => {
                let ws = self
                    .config
                    .websocket
                    .clone()
                    .context("WebSocket transport selected without a URL")?;
                Arc::new(WebSocketTransport::new(ws).context("Invalid WebSocket configuration")?)
            }
            TransportKind::Broadcast => Arc::new(
                BroadcastTransport::new(self.hub.clone(), self.config.broadcast_group())
                    .with_handler_timeout(self.config.bus.handler_timeout()),
            ),
        };
        Ok(Some(transport))
    }

    pub async fn shutdown(&self) {
        info!(core_id = %self.core.core_id(), "Shutting down node");
        let pending = self.core.pending_request_count();
        if pending > 0 {
            warn!(pending, "Shutting down with unanswered requests");
        }
        self.core.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use void_bus::Message;

    #[tokio::test]
    async fn test_start_in_process() {
        let runtime = NodeRuntime::new(NodeConfig::default()).unwrap();
        runtime.start().await.unwrap();

        let status = runtime.boot_state().snapshot();
        assert!(status.is_boot_complete);
        assert_eq!(runtime.core().transport().kind(), "in-process");
    }

    #[tokio::test]
    async fn test_runtimes_share_broadcast_group() {
        let hub = BroadcastHub::new();
        let config = NodeConfig {
            transport: TransportKind::Broadcast,
            broadcast_group: Some("editor".into()),
            ..NodeConfig::default()
        };
        let a = NodeRuntime::with_hub(config.clone(), hub.clone()).unwrap();
        let b = NodeRuntime::with_hub(config, hub.clone()).unwrap();
        a.start().await.unwrap();
        b.start().await.unwrap();
        assert_eq!(hub.member_count("editor"), 2);

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        b.core()
            .subscribe("canvas.redraw", move |_msg| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
            .unwrap();

        let reached = a
            .core()
            .publish(Message::notice("canvas.redraw", json!(null)))
            .await
            .unwrap();
        assert_eq!(reached, 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unreachable_websocket_fails_start() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = NodeConfig {
            transport: TransportKind::WebSocket,
            websocket: Some(void_bus::WebSocketConfig::new(format!("ws://{addr}"))),
            ..NodeConfig::default()
        };
        let runtime = NodeRuntime::new(config).unwrap();

        assert!(runtime.start().await.is_err());
        assert_eq!(runtime.core().transport().kind(), "in-process");
    }
}
