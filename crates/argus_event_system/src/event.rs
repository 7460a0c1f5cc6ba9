//! Core event model shared by every component of the platform.
//!
//! An [`Event`] is a self-contained record of something that happened:
//! an identity (message type, event id, domain and name), wall-clock
//! timestamps, a string key/value bundle for small parameters, an
//! optional structured JSON payload, and trace correlation fields.
//! Events are plain data and travel by value; pipeline routing state
//! rides along in an internal slot managed by the [`crate::pipeline`]
//! module.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::pipeline::PipelineRoute;

/// Milliseconds since the unix epoch.
pub fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Broad category an event belongs to. Routing tables are keyed by this
/// before any finer-grained matching happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageType {
    /// Unclassified; events start here until a producer tags them.
    None,
    Fault,
    Statistics,
    Raw,
    Sys,
    UserExperience,
    External,
    ExternalRemote,
    CrossPlatform,
    PluginMaintenance,
    /// Reserved range for plugin-private message types.
    Private(u16),
}

impl Default for MessageType {
    fn default() -> Self {
        MessageType::None
    }
}

/// Whether an event flows through a pipeline in order or is broadcast
/// to whoever registered interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ManageType {
    Ordered,
    #[default]
    Unordered,
}

/// Distributed trace correlation carried on every event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceInfo {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: String,
    pub trace_flag: i32,
}

impl TraceInfo {
    /// Fresh root span with a generated trace id.
    pub fn new_root() -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        TraceInfo {
            trace_id: id.clone(),
            span_id: id,
            parent_span_id: String::new(),
            trace_flag: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.trace_id.is_empty()
    }
}

/// A single platform event.
///
/// Identity fields are fixed at construction; everything else mutates
/// through accessors. The parameter bundle stores both plain strings
/// and stringified integers in the same map, so a value written with
/// [`Event::set_int_value`] is also visible through [`Event::value`].
#[derive(Debug, Clone)]
pub struct Event {
    message_type: MessageType,
    manage_type: ManageType,
    event_id: u32,
    create_time: u64,
    happen_time: u64,
    target_dispatch_time: u64,
    sender: String,
    domain: String,
    event_name: String,
    has_finished: bool,
    has_pending: bool,
    trace: TraceInfo,
    bundle: HashMap<String, String>,
    payload: serde_json::Value,
    pub(crate) route: Option<PipelineRoute>,
}

impl Event {
    pub fn new(sender: impl Into<String>, message_type: MessageType, event_id: u32) -> Self {
        let now = current_millis();
        Event {
            message_type,
            manage_type: ManageType::Unordered,
            event_id,
            create_time: now,
            happen_time: now,
            target_dispatch_time: 0,
            sender: sender.into(),
            domain: String::new(),
            event_name: String::new(),
            has_finished: false,
            has_pending: false,
            trace: TraceInfo::default(),
            bundle: HashMap::new(),
            payload: serde_json::Value::Null,
            route: None,
        }
    }

    /// Attaches the domain/name pair used for name-based listener matching.
    pub fn with_name(mut self, domain: impl Into<String>, event_name: impl Into<String>) -> Self {
        self.domain = domain.into();
        self.event_name = event_name.into();
        self
    }

    pub fn with_manage_type(mut self, manage_type: ManageType) -> Self {
        self.manage_type = manage_type;
        self
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn manage_type(&self) -> ManageType {
        self.manage_type
    }

    pub fn set_manage_type(&mut self, manage_type: ManageType) {
        self.manage_type = manage_type;
    }

    pub fn event_id(&self) -> u32 {
        self.event_id
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    /// `domain_eventName` composite used by substring interest matching.
    pub fn composite_name(&self) -> String {
        format!("{}_{}", self.domain, self.event_name)
    }

    pub fn create_time(&self) -> u64 {
        self.create_time
    }

    pub fn happen_time(&self) -> u64 {
        self.happen_time
    }

    pub fn set_happen_time(&mut self, millis: u64) {
        self.happen_time = millis;
    }

    pub fn target_dispatch_time(&self) -> u64 {
        self.target_dispatch_time
    }

    pub fn set_target_dispatch_time(&mut self, millis: u64) {
        self.target_dispatch_time = millis;
    }

    pub fn has_finished(&self) -> bool {
        self.has_finished
    }

    pub fn has_pending(&self) -> bool {
        self.has_pending
    }

    pub(crate) fn mark_pending(&mut self) {
        self.has_pending = true;
    }

    pub(crate) fn mark_finished(&mut self) {
        self.has_finished = true;
    }

    pub(crate) fn clear_progress(&mut self) {
        self.has_finished = false;
        self.has_pending = false;
    }

    pub fn trace(&self) -> &TraceInfo {
        &self.trace
    }

    pub fn set_trace(&mut self, trace: TraceInfo) {
        self.trace = trace;
    }

    /// Stores a string parameter, replacing any previous value.
    pub fn set_value(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.bundle.insert(key.into(), value.into());
    }

    /// Parameter lookup; missing keys read as the empty string.
    pub fn value(&self, key: &str) -> String {
        self.bundle.get(key).cloned().unwrap_or_default()
    }

    /// Stores an integer parameter in the shared bundle.
    pub fn set_int_value(&mut self, key: impl Into<String>, value: i64) {
        self.bundle.insert(key.into(), value.to_string());
    }

    /// Integer parameter lookup; missing or non-numeric keys read as -1.
    pub fn int_value(&self, key: &str) -> i64 {
        self.bundle
            .get(key)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(-1)
    }

    pub fn values(&self) -> &HashMap<String, String> {
        &self.bundle
    }

    /// Serializes `payload` into the structured JSON slot.
    pub fn set_payload<T: Serialize>(&mut self, payload: &T) -> Result<(), serde_json::Error> {
        self.payload = serde_json::to_value(payload)?;
        Ok(())
    }

    /// Deserializes the structured payload, if one was attached.
    pub fn payload<T: DeserializeOwned>(&self) -> Option<T> {
        if self.payload.is_null() {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }

    pub fn payload_value(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn is_pipeline_event(&self) -> bool {
        self.route.is_some()
    }
}

/// A unit that consumes events one at a time.
///
/// Handlers back pipeline processors and the per-plugin dispatch done
/// by work loops. `on_event` returns `false` to signal that delivery
/// should stop with the event parked at this handler.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &mut Event) -> bool;

    /// Admission check consulted before an event is routed this way.
    fn can_process_event(&self, _event: &Event) -> bool {
        true
    }

    /// Backpressure signal; `false` asks producers to hold off.
    fn can_process_more_events(&self) -> bool {
        true
    }

    fn handler_name(&self) -> &str {
        "anonymous"
    }
}
