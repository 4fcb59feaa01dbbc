//! `system.*` intents: boot lifecycle, plugin management, connections,
//! statistics and the Prometheus metrics dump.
//!
//! Handlers hold a `Weak<VoidCore>` so registering them never keeps the core
//! alive. Each returns a JSON object with a `status` field; invalid payloads
//! and refused plugin operations come back as errors.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, Weak};
use tracing::info;

use void_bus::message::now_millis;
use void_bus::{BoxError, IntentResult, Message, PluginError, PluginRecord, VoidCore};
use void_telemetry::metrics;

pub const BOOT_READY: &str = "system.boot.ready";
pub const BOOT_STATUS: &str = "system.boot.status";
pub const PLUGIN_CREATE: &str = "system.plugin.create";
pub const PLUGIN_DESTROY: &str = "system.plugin.destroy";
pub const PLUGIN_REPARENT: &str = "system.plugin.reparent";
pub const PLUGIN_LIST: &str = "system.plugin.list";
pub const CONNECT: &str = "system.connect";
pub const STATS: &str = "system.stats";
pub const METRICS: &str = "system.metrics";

/// Boot progress as reported by `system.boot.status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BootStatus {
    pub system_status: String,
    pub is_boot_complete: bool,
    pub boot_sequence: Vec<String>,
}

#[derive(Debug)]
pub struct BootState {
    inner: Mutex<BootStatus>,
}

impl Default for BootState {
    fn default() -> Self {
        Self {
            inner: Mutex::new(BootStatus {
                system_status: "booting".to_string(),
                is_boot_complete: false,
                boot_sequence: Vec::new(),
            }),
        }
    }
}

impl BootState {
    pub fn record(&self, step: impl Into<String>) {
        self.inner.lock().boot_sequence.push(step.into());
    }

    fn complete(&self) {
        let mut status = self.inner.lock();
        status.system_status = "ready".to_string();
        status.is_boot_complete = true;
        status.boot_sequence.push(format!("{BOOT_READY} acknowledged"));
    }

    pub fn snapshot(&self) -> BootStatus {
        self.inner.lock().clone()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatePlugin {
    plugin_id: String,
    #[serde(default)]
    parent_id: Option<String>,
    #[serde(default)]
    metadata: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DestroyPlugin {
    plugin_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReparentPlugin {
    plugin_id: String,
    #[serde(default)]
    new_parent: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Connect {
    source: String,
    target: String,
}

fn upgrade(core: &Weak<VoidCore>) -> Result<Arc<VoidCore>, BoxError> {
    core.upgrade().ok_or_else(|| "VoidCore has shut down".into())
}

fn parse<T: for<'de> Deserialize<'de>>(intent: &Message) -> Result<T, BoxError> {
    Ok(serde_json::from_value(intent.payload().clone())?)
}

fn sync_plugin_gauge(core: &VoidCore) {
    metrics::set_plugin_count(core.plugin_store_stats().plugin_count);
}

async fn boot_ready(core: Weak<VoidCore>, boot: Arc<BootState>) -> IntentResult {
    let core = upgrade(&core)?;
    boot.complete();
    core.publish(Message::notice("system.boot.completed", json!({"coreId": core.core_id()})))
        .await?;
    info!(core_id = %core.core_id(), "System boot ready acknowledged");
    Ok(json!({
        "status": "acknowledged",
        "coreId": core.core_id(),
        "timestamp": now_millis(),
    }))
}

async fn boot_status(boot: Arc<BootState>) -> IntentResult {
    let status = boot.snapshot();
    Ok(json!({
        "status": "success",
        "systemStatus": status.system_status,
        "isBootComplete": status.is_boot_complete,
        "bootSequence": status.boot_sequence,
    }))
}

async fn create_plugin(core: Weak<VoidCore>, intent: Arc<Message>) -> IntentResult {
    let core = upgrade(&core)?;
    let request: CreatePlugin = parse(&intent)?;
    let mut record = PluginRecord::new(&request.plugin_id).with_metadata(request.metadata);
    if let Some(parent_id) = &request.parent_id {
        record = record.with_parent(parent_id);
    }
    core.try_register_plugin(record)?;
    sync_plugin_gauge(&core);

    core.publish(Message::notice(
        "plugin.initialized",
        json!({"pluginId": request.plugin_id, "parentId": request.parent_id}),
    ))
    .await?;
    Ok(json!({"status": "created", "pluginId": request.plugin_id}))
}

async fn destroy_plugin(core: Weak<VoidCore>, intent: Arc<Message>) -> IntentResult {
    let core = upgrade(&core)?;
    let request: DestroyPlugin = parse(&intent)?;
    if !core.unregister_plugin(&request.plugin_id) {
        return Err(PluginError::NotFound(request.plugin_id).into());
    }
    sync_plugin_gauge(&core);

    core.publish(Message::notice("plugin.shutdown", json!({"pluginId": request.plugin_id})))
        .await?;
    Ok(json!({"status": "destroyed", "pluginId": request.plugin_id}))
}

async fn reparent_plugin(core: Weak<VoidCore>, intent: Arc<Message>) -> IntentResult {
    let core = upgrade(&core)?;
    let request: ReparentPlugin = parse(&intent)?;
    core.reparent_plugin(&request.plugin_id, request.new_parent.as_deref())?;
    Ok(json!({
        "status": "reparented",
        "pluginId": request.plugin_id,
        "newParent": request.new_parent,
    }))
}

async fn list_plugins(core: Weak<VoidCore>) -> IntentResult {
    let plugins = upgrade(&core)?.get_all_plugins();
    Ok(json!({
        "status": "success",
        "count": plugins.len(),
        "plugins": plugins,
    }))
}

async fn connect(core: Weak<VoidCore>, intent: Arc<Message>) -> IntentResult {
    let core = upgrade(&core)?;
    let request: Connect = parse(&intent)?;
    for plugin_id in [&request.source, &request.target] {
        if core.get_plugin(plugin_id).is_none() {
            return Err(PluginError::NotFound(plugin_id.clone()).into());
        }
    }

    core.publish(Message::notice(
        "system.connection.created",
        json!({"source": request.source, "target": request.target}),
    ))
    .await?;
    Ok(json!({
        "status": "connected",
        "source": request.source,
        "target": request.target,
        "timestamp": now_millis(),
    }))
}

async fn stats(core: Weak<VoidCore>) -> IntentResult {
    let stats = serde_json::to_value(upgrade(&core)?.stats())?;
    Ok(json!({"status": "success", "stats": stats}))
}

/// Prometheus text exposition of the process-wide registry.
async fn export_metrics() -> IntentResult {
    let text = void_telemetry::encode_metrics()?;
    Ok(json!({"status": "success", "format": "prometheus", "metrics": text}))
}

/// Register every `system.*` handler on `core`.
pub fn register_system_handlers(core: &Arc<VoidCore>) -> Arc<BootState> {
    let boot = Arc::new(BootState::default());

    let (weak, state) = (Arc::downgrade(core), boot.clone());
    core.register_intent_handler(BOOT_READY, move |_intent| boot_ready(weak.clone(), state.clone()));

    let state = boot.clone();
    core.register_intent_handler(BOOT_STATUS, move |_intent| boot_status(state.clone()));

    let weak = Arc::downgrade(core);
    core.register_intent_handler(PLUGIN_CREATE, move |intent| create_plugin(weak.clone(), intent));

    let weak = Arc::downgrade(core);
    core.register_intent_handler(PLUGIN_DESTROY, move |intent| destroy_plugin(weak.clone(), intent));

    let weak = Arc::downgrade(core);
    core.register_intent_handler(PLUGIN_REPARENT, move |intent| reparent_plugin(weak.clone(), intent));

    let weak = Arc::downgrade(core);
    core.register_intent_handler(PLUGIN_LIST, move |_intent| list_plugins(weak.clone()));

    let weak = Arc::downgrade(core);
    core.register_intent_handler(CONNECT, move |intent| connect(weak.clone(), intent));

    let weak = Arc::downgrade(core);
    core.register_intent_handler(STATS, move |_intent| stats(weak.clone()));

    core.register_intent_handler(METRICS, |_intent| export_metrics());

    boot
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use void_bus::{BusConfig, IntentError};

    fn setup() -> (Arc<VoidCore>, Arc<BootState>) {
        let core = Arc::new(VoidCore::new(BusConfig::default()).unwrap());
        let boot = register_system_handlers(&core);
        (core, boot)
    }

    #[tokio::test]
    async fn test_boot_ready_then_status() {
        let (core, boot) = setup();
        boot.record("handlers registered");

        let ack = core.send_intent(BOOT_READY, json!({})).await.unwrap();
        assert_eq!(ack["status"], "acknowledged");
        assert_eq!(ack["coreId"], json!(core.core_id()));

        let status = core.send_intent(BOOT_STATUS, json!({})).await.unwrap();
        assert_eq!(status["status"], "success");
        assert_eq!(status["isBootComplete"], true);
        assert_eq!(status["systemStatus"], "ready");
        assert_eq!(status["bootSequence"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_plugin_lifecycle() {
        let (core, _boot) = setup();
        let notices = Arc::new(AtomicUsize::new(0));
        for notice in ["plugin.initialized", "plugin.shutdown"] {
            let notices = notices.clone();
            core.subscribe(notice, move |_msg| {
                let notices = notices.clone();
                async move {
                    notices.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
            .unwrap();
        }

        core.send_intent(PLUGIN_CREATE, json!({"pluginId": "root"})).await.unwrap();
        core.send_intent(PLUGIN_CREATE, json!({"pluginId": "child", "parentId": "root"}))
            .await
            .unwrap();
        assert_eq!(core.get_parent("child").unwrap().plugin_id, "root");

        let list = core.send_intent(PLUGIN_LIST, json!({})).await.unwrap();
        assert_eq!(list["count"], 2);

        let destroyed = core
            .send_intent(PLUGIN_DESTROY, json!({"pluginId": "root"}))
            .await
            .unwrap();
        assert_eq!(destroyed["status"], "destroyed");
        assert!(core.get_plugin("child").unwrap().is_root());
        assert_eq!(notices.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_refused_operations_are_errors() {
        let (core, _boot) = setup();
        core.send_intent(PLUGIN_CREATE, json!({"pluginId": "a"})).await.unwrap();
        core.send_intent(PLUGIN_CREATE, json!({"pluginId": "b", "parentId": "a"}))
            .await
            .unwrap();

        let err = core
            .send_intent(PLUGIN_CREATE, json!({"pluginId": "a"}))
            .await
            .unwrap_err();
        assert!(matches!(
            err.handler_error().and_then(|e| e.downcast_ref::<PluginError>()),
            Some(PluginError::Duplicate(_))
        ));

        let err = core
            .send_intent(PLUGIN_REPARENT, json!({"pluginId": "a", "newParent": "b"}))
            .await
            .unwrap_err();
        assert!(matches!(
            err.handler_error().and_then(|e| e.downcast_ref::<PluginError>()),
            Some(PluginError::CircularReference { .. })
        ));

        let err = core
            .send_intent(PLUGIN_DESTROY, json!({"pluginId": "ghost"}))
            .await
            .unwrap_err();
        assert!(matches!(err, IntentError::Handler(_)));
    }

    #[tokio::test]
    async fn test_malformed_payload_rejected() {
        let (core, _boot) = setup();
        let err = core
            .send_intent(PLUGIN_CREATE, json!({"parentId": 7}))
            .await
            .unwrap_err();
        assert!(err
            .handler_error()
            .and_then(|e| e.downcast_ref::<serde_json::Error>())
            .is_some());
    }

    #[tokio::test]
    async fn test_connect_requires_registered_plugins() {
        let (core, _boot) = setup();
        core.send_intent(PLUGIN_CREATE, json!({"pluginId": "src"})).await.unwrap();
        core.send_intent(PLUGIN_CREATE, json!({"pluginId": "dst"})).await.unwrap();

        let connected = core
            .send_intent(CONNECT, json!({"source": "src", "target": "dst"}))
            .await
            .unwrap();
        assert_eq!(connected["status"], "connected");

        assert!(core
            .send_intent(CONNECT, json!({"source": "src", "target": "nowhere"}))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_stats_intent() {
        let (core, _boot) = setup();
        core.send_intent(PLUGIN_CREATE, json!({"pluginId": "p"})).await.unwrap();

        let result = core.send_intent(STATS, json!({})).await.unwrap();
        assert_eq!(result["stats"]["plugins"]["pluginCount"], 1);
        assert_eq!(result["stats"]["mode"], "single-channel");
    }

    #[tokio::test]
    async fn test_metrics_intent_exports_registry() {
        void_telemetry::register_metrics().unwrap();
        let (core, _boot) = setup();
        core.send_intent(PLUGIN_CREATE, json!({"pluginId": "m"})).await.unwrap();

        let result = core.send_intent(METRICS, json!({})).await.unwrap();
        assert_eq!(result["format"], "prometheus");
        let text = result["metrics"].as_str().unwrap();
        assert!(text.contains("void_plugins_registered"));
    }

    #[tokio::test]
    async fn test_handlers_do_not_keep_core_alive() {
        let (core, _boot) = setup();
        let weak = Arc::downgrade(&core);
        drop(core);
        assert!(weak.upgrade().is_none());
    }
}
