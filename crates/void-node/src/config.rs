//! # Node Configuration
//!
//! Bus settings plus the choice of transport the node runs on.

use anyhow::{bail, Context, Result};
use std::env;
use std::fmt;
use std::str::FromStr;

use void_bus::{BusConfig, WebSocketConfig};

pub const DEFAULT_BROADCAST_GROUP: &str = "voidcore";

/// Which transport backend the node installs at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    #[default]
    InProcess,
    WebSocket,
    Broadcast,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProcess => "in-process",
            Self::WebSocket => "websocket",
            Self::Broadcast => "broadcast",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "in-process" | "inprocess" | "memory" => Ok(Self::InProcess),
            "websocket" | "ws" => Ok(Self::WebSocket),
            "broadcast" => Ok(Self::Broadcast),
            other => bail!("unknown transport {other:?} (expected in-process, websocket or broadcast)"),
        }
    }
}

/// Complete node configuration.
#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    pub bus: BusConfig,
    pub transport: TransportKind,
    /// Required for [`TransportKind::WebSocket`].
    pub websocket: Option<WebSocketConfig>,
    pub broadcast_group: Option<String>,
}

impl NodeConfig {
    /// Read configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `VOID_TRANSPORT`: `in-process`, `websocket` or `broadcast` (default: in-process)
    /// - `VOID_WS_URL`: WebSocket endpoint, required for `websocket`
    /// - `VOID_WS_MAX_RECONNECTS`: Reconnect attempts before giving up (default: 5)
    /// - `VOID_BROADCAST_GROUP`: Broadcast group name (default: voidcore)
    /// - plus every `VOID_*` variable read by [`BusConfig::from_env`]
    pub fn from_env() -> Result<Self> {
        let bus = BusConfig::from_env().context("Invalid bus configuration")?;
        let transport = match env::var("VOID_TRANSPORT") {
            Ok(value) => value.parse().context("Invalid VOID_TRANSPORT")?,
            Err(_) => TransportKind::default(),
        };

        let websocket = match env::var("VOID_WS_URL") {
            Ok(url) => {
                let mut ws = WebSocketConfig::new(url).with_handler_timeout(bus.handler_timeout());
                if let Ok(attempts) = env::var("VOID_WS_MAX_RECONNECTS") {
                    let attempts = attempts
                        .trim()
                        .parse()
                        .with_context(|| format!("Invalid VOID_WS_MAX_RECONNECTS {attempts:?}"))?;
                    ws = ws.with_max_reconnect_attempts(attempts);
                }
                Some(ws)
            }
            Err(_) => None,
        };

        let config = Self {
            bus,
            transport,
            websocket,
            broadcast_group: env::var("VOID_BROADCAST_GROUP").ok(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.bus.validate().context("Invalid bus configuration")?;
        match (self.transport, &self.websocket) {
            (TransportKind::WebSocket, None) => bail!("VOID_WS_URL is required for the websocket transport"),
            (_, Some(ws)) => ws.validate().context("Invalid WebSocket configuration")?,
            _ => {}
        }
        Ok(())
    }

    pub fn broadcast_group(&self) -> &str {
        self.broadcast_group
            .as_deref()
            .unwrap_or(DEFAULT_BROADCAST_GROUP)
    }
}
