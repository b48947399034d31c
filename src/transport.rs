//! Transport negotiation and event framing
//!
//! Decides whether a turn is answered with one JSON envelope or a typed
//! event sequence, and shapes the event sequence for the requested mode.

use crate::db::Usage;
use crate::state_machine::{DecisionKind, ErrorDetail, Interrupt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Output mode requested in the request body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    /// Incremental text deltas
    Full,
    /// Lifecycle events with the reply as one message
    Events,
    #[default]
    Off,
}

impl StreamMode {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamMode::Full => "full",
            StreamMode::Events => "events",
            StreamMode::Off => "off",
        }
    }
}

/// What the client said it accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptPreference {
    EventStream,
    Json,
}

impl AcceptPreference {
    pub fn as_str(self) -> &'static str {
        match self {
            AcceptPreference::EventStream => "text/event-stream",
            AcceptPreference::Json => "application/json",
        }
    }

    /// Read an `Accept` header value.
    ///
    /// `text/event-stream` wins only when it is ranked strictly above JSON;
    /// absent, wildcard or unparseable headers mean JSON.
    pub fn from_header(value: Option<&str>) -> Self {
        let Some(value) = value else {
            return AcceptPreference::Json;
        };
        let mut event_stream: Option<f32> = None;
        let mut json: Option<f32> = None;
        for range in value.split(',') {
            let mut parts = range.split(';');
            let media = parts.next().unwrap_or_default().trim().to_ascii_lowercase();
            let quality = parts
                .filter_map(|p| p.trim().strip_prefix("q="))
                .find_map(|q| q.trim().parse::<f32>().ok())
                .unwrap_or(1.0);
            let slot = match media.as_str() {
                "text/event-stream" => &mut event_stream,
                "application/json" | "application/*" | "*/*" => &mut json,
                _ => continue,
            };
            *slot = Some(slot.map_or(quality, |q| q.max(quality)));
        }
        match (event_stream, json) {
            (Some(es), Some(js)) if es > js => AcceptPreference::EventStream,
            (Some(es), None) if es > 0.0 => AcceptPreference::EventStream,
            _ => AcceptPreference::Json,
        }
    }
}

/// How text reaches the client on an event stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextDelivery {
    /// `turn.output_text.delta` events, no `turn.message`
    Deltas,
    /// A single `turn.message`, no deltas
    Message,
}

/// Negotiated response shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportPlan {
    Envelope,
    EventStream(TextDelivery),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("stream mode '{}' cannot be served as '{}'", .mode.as_str(), .accept.as_str())]
pub struct IncompatibleTransport {
    pub mode: StreamMode,
    pub accept: AcceptPreference,
}

/// Match the requested mode against the accept preference
pub fn negotiate(
    mode: StreamMode,
    accept: AcceptPreference,
) -> Result<TransportPlan, IncompatibleTransport> {
    match (accept, mode) {
        (AcceptPreference::Json, StreamMode::Off) => Ok(TransportPlan::Envelope),
        (AcceptPreference::EventStream, StreamMode::Full) => {
            Ok(TransportPlan::EventStream(TextDelivery::Deltas))
        }
        (AcceptPreference::EventStream, StreamMode::Events) => {
            Ok(TransportPlan::EventStream(TextDelivery::Message))
        }
        (AcceptPreference::Json, StreamMode::Full | StreamMode::Events)
        | (AcceptPreference::EventStream, StreamMode::Off) => {
            Err(IncompatibleTransport { mode, accept })
        }
    }
}

// ============================================================================
// Events
// ============================================================================

/// Events produced while a turn runs
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum TurnEvent {
    #[serde(rename = "turn.created")]
    Created {
        #[serde(skip_serializing_if = "Option::is_none")]
        previous_turn_id: Option<String>,
    },
    #[serde(rename = "turn.resumed")]
    Resumed {
        tool_call_id: String,
        decision: DecisionKind,
    },
    #[serde(rename = "turn.output_text.delta")]
    OutputTextDelta { delta: String },
    #[serde(rename = "turn.message")]
    Message { text: String },
    #[serde(rename = "turn.interrupted")]
    Interrupted { interrupt: Interrupt },
    #[serde(rename = "turn.completed")]
    Completed { usage: Usage },
    #[serde(rename = "turn.failed")]
    Failed { error: ErrorDetail },
}

impl TurnEvent {
    /// Wire name, also used as the SSE event name
    pub fn name(&self) -> &'static str {
        match self {
            TurnEvent::Created { .. } => "turn.created",
            TurnEvent::Resumed { .. } => "turn.resumed",
            TurnEvent::OutputTextDelta { .. } => "turn.output_text.delta",
            TurnEvent::Message { .. } => "turn.message",
            TurnEvent::Interrupted { .. } => "turn.interrupted",
            TurnEvent::Completed { .. } => "turn.completed",
            TurnEvent::Failed { .. } => "turn.failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TurnEvent::Interrupted { .. } | TurnEvent::Completed { .. } | TurnEvent::Failed { .. }
        )
    }
}

/// A self-contained event record as sent to the client
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    pub sequence_number: u64,
    pub turn_id: String,
    pub conversation_id: String,
    #[serde(flatten)]
    pub event: TurnEvent,
}

/// Turns a turn's raw events into numbered records for one text delivery
#[derive(Debug)]
pub struct EventFramer {
    delivery: TextDelivery,
    turn_id: String,
    conversation_id: String,
    saw_delta: bool,
    next_sequence: u64,
}

impl EventFramer {
    pub fn new(
        delivery: TextDelivery,
        turn_id: impl Into<String>,
        conversation_id: impl Into<String>,
    ) -> Self {
        Self {
            delivery,
            turn_id: turn_id.into(),
            conversation_id: conversation_id.into(),
            saw_delta: false,
            next_sequence: 0,
        }
    }

    /// Frame one raw event; `None` means it is not sent in this mode.
    ///
    /// In delta mode a reply that arrived without deltas (a cache hit, or a
    /// reasoner that does not stream) is sent as a single delta.
    pub fn frame(&mut self, event: TurnEvent) -> Option<EventRecord> {
        let event = match (self.delivery, event) {
            (TextDelivery::Message, TurnEvent::OutputTextDelta { .. }) => return None,
            (TextDelivery::Deltas, TurnEvent::OutputTextDelta { delta }) => {
                self.saw_delta = true;
                TurnEvent::OutputTextDelta { delta }
            }
            (TextDelivery::Deltas, TurnEvent::Message { text }) => {
                if std::mem::replace(&mut self.saw_delta, false) {
                    return None;
                }
                TurnEvent::OutputTextDelta { delta: text }
            }
            (_, other) => other,
        };
        let sequence_number = self.next_sequence;
        self.next_sequence += 1;
        Some(EventRecord {
            sequence_number,
            turn_id: self.turn_id.clone(),
            conversation_id: self.conversation_id.clone(),
            event,
        })
    }
}
