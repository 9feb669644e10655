// ============================================================================
// MESSAGES
// ============================================================================
// Every message on the bus travels inside an `Envelope`. The payload is one
// `Message` variant, tagged on the wire by its `kind`:
//
//   cmd-*      requests (coordinator → agent, or any → coordinator)
//   ack-*      replies correlated by inst_id
//   notify-*   unsolicited agent → coordinator notices
//   data       instrumenter → aggregator values
// ============================================================================

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{MessageError, MessageResult};
use crate::metric::{FieldArity, Predicate, ReducedValue};
use crate::types::{InstId, Timestamp};
use crate::{FLEETSTAT_NAME, FLEETSTAT_VERSION};

// ----------------------------------------------------------------------------
// Envelope
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    /// Routing key replies should be sent to
    pub source: String,
    /// Hostname of the sender
    pub hostname: String,
    pub time: Timestamp,
    pub message: Message,
}

impl Envelope {
    pub fn new(source: impl Into<String>, hostname: impl Into<String>, message: Message) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            hostname: hostname.into(),
            time: Timestamp::now(),
            message,
        }
    }

    pub fn encode(&self) -> MessageResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode and validate a message from the wire. Missing fields and
    /// unknown kinds are reported as malformed.
    pub fn decode(raw: &str) -> MessageResult<Self> {
        let value: Value = serde_json::from_str(raw)?;
        let kind = value
            .get("message")
            .and_then(|m| m.get("kind"))
            .and_then(Value::as_str)
            .unwrap_or("<none>")
            .to_string();
        serde_json::from_value(value).map_err(|e| MessageError::malformed(kind, e.to_string()))
    }
}

// ----------------------------------------------------------------------------
// Message Kinds
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Message {
    #[serde(rename = "cmd-ping")]
    Ping,

    #[serde(rename = "ack-ping")]
    AckPing,

    #[serde(rename = "cmd-status")]
    Status,

    #[serde(rename = "ack-status")]
    AckStatus(StatusReport),

    #[serde(rename = "cmd-enable_instrumentation")]
    EnableInstrumentation {
        inst_id: InstId,
        /// Data-stream key values are published to
        inst_key: String,
        module: String,
        stat: String,
        #[serde(default)]
        predicate: Predicate,
        #[serde(default)]
        decomposition: Vec<String>,
    },

    #[serde(rename = "cmd-disable_instrumentation")]
    DisableInstrumentation { inst_id: InstId },

    #[serde(rename = "cmd-enable_aggregation")]
    EnableAggregation { inst_id: InstId, key: String },

    #[serde(rename = "cmd-disable_aggregation")]
    DisableAggregation { inst_id: InstId },

    #[serde(rename = "notify-instrumenter_online")]
    InstrumenterOnline {
        agent: AgentInfo,
        #[serde(default)]
        modules: BTreeMap<String, ModuleInfo>,
    },

    #[serde(rename = "notify-aggregator_online")]
    AggregatorOnline { agent: AgentInfo },

    #[serde(rename = "notify-log")]
    Log { message: String },

    #[serde(rename = "notify-instrumenter_error")]
    InstrumenterError {
        inst_id: InstId,
        error: String,
        status: AckStatus,
    },

    #[serde(rename = "ack-enable_instrumentation")]
    AckEnableInstrumentation {
        inst_id: InstId,
        status: AckStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "ack-disable_instrumentation")]
    AckDisableInstrumentation {
        inst_id: InstId,
        status: AckStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "ack-enable_aggregation")]
    AckEnableAggregation {
        inst_id: InstId,
        status: AckStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "ack-disable_aggregation")]
    AckDisableAggregation {
        inst_id: InstId,
        status: AckStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "data")]
    Data {
        inst_id: InstId,
        sampled_at: Timestamp,
        value: ReducedValue,
    },
}

impl Message {
    /// Wire name of this message kind
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Ping => "cmd-ping",
            Message::AckPing => "ack-ping",
            Message::Status => "cmd-status",
            Message::AckStatus(_) => "ack-status",
            Message::EnableInstrumentation { .. } => "cmd-enable_instrumentation",
            Message::DisableInstrumentation { .. } => "cmd-disable_instrumentation",
            Message::EnableAggregation { .. } => "cmd-enable_aggregation",
            Message::DisableAggregation { .. } => "cmd-disable_aggregation",
            Message::InstrumenterOnline { .. } => "notify-instrumenter_online",
            Message::AggregatorOnline { .. } => "notify-aggregator_online",
            Message::Log { .. } => "notify-log",
            Message::InstrumenterError { .. } => "notify-instrumenter_error",
            Message::AckEnableInstrumentation { .. } => "ack-enable_instrumentation",
            Message::AckDisableInstrumentation { .. } => "ack-disable_instrumentation",
            Message::AckEnableAggregation { .. } => "ack-enable_aggregation",
            Message::AckDisableAggregation { .. } => "ack-disable_aggregation",
            Message::Data { .. } => "data",
        }
    }

    /// Instrumentation this message refers to, if any
    pub fn inst_id(&self) -> Option<InstId> {
        match self {
            Message::EnableInstrumentation { inst_id, .. }
            | Message::DisableInstrumentation { inst_id }
            | Message::EnableAggregation { inst_id, .. }
            | Message::DisableAggregation { inst_id }
            | Message::InstrumenterError { inst_id, .. }
            | Message::AckEnableInstrumentation { inst_id, .. }
            | Message::AckDisableInstrumentation { inst_id, .. }
            | Message::AckEnableAggregation { inst_id, .. }
            | Message::AckDisableAggregation { inst_id, .. }
            | Message::Data { inst_id, .. } => Some(*inst_id),
            _ => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Ack Status
// ----------------------------------------------------------------------------

/// Status carried by acks and error notices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AckStatus {
    Enabled,
    Disabled,
    Other(String),
}

impl AckStatus {
    pub fn is_enabled(&self) -> bool {
        matches!(self, AckStatus::Enabled)
    }
}

impl From<String> for AckStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "enabled" => AckStatus::Enabled,
            "disabled" => AckStatus::Disabled,
            _ => AckStatus::Other(s),
        }
    }
}

impl From<AckStatus> for String {
    fn from(status: AckStatus) -> Self {
        match status {
            AckStatus::Enabled => "enabled".into(),
            AckStatus::Disabled => "disabled".into(),
            AckStatus::Other(s) => s,
        }
    }
}

impl Display for AckStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            AckStatus::Enabled => write!(f, "enabled"),
            AckStatus::Disabled => write!(f, "disabled"),
            AckStatus::Other(s) => write!(f, "{}", s),
        }
    }
}

// ----------------------------------------------------------------------------
// Agent & Catalog Payloads
// ----------------------------------------------------------------------------

/// Identification an agent sends when it comes online
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_name: String,
    pub agent_version: String,
    pub os_name: String,
    #[serde(default)]
    pub os_release: String,
}

impl AgentInfo {
    pub fn current(component: &str) -> Self {
        Self {
            agent_name: format!("{}-{}", FLEETSTAT_NAME, component),
            agent_version: FLEETSTAT_VERSION.to_string(),
            os_name: std::env::consts::OS.to_string(),
            os_release: std::env::consts::ARCH.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub label: String,
    #[serde(default)]
    pub stats: BTreeMap<String, StatInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatInfo {
    pub label: String,
    #[serde(rename = "type")]
    pub unit: String,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub label: String,
    #[serde(rename = "type")]
    pub arity: FieldArity,
}

// ----------------------------------------------------------------------------
// Status Report
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumenterStatus {
    pub hostname: String,
    pub nmetrics_avail: usize,
    pub ninsts: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatorStatus {
    pub hostname: String,
    pub ninsts: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatusReport {
    pub component: String,
    pub ninstrumentations: usize,
    pub instrumenters: Vec<InstrumenterStatus>,
    pub aggregators: Vec<AggregatorStatus>,
}
