//! Wire protocol for the live endpoint
//!
//! Outbound messages are externally tagged JSON objects (`{"setup": ...}`,
//! `{"realtimeInput": ...}`, `{"toolResponse": ...}`). Inbound server messages
//! may carry several concerns at once; [`ServerMessage::into_inbound`] splits
//! them into the ordered [`InboundMessage`] sequence the processor consumes.

use base64::Engine as _;
use serde::{Deserialize, Serialize};

// -- Outbound ----------------------------------------------------------------

/// A message sent to the live endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    /// Session setup; always the first message on a new transport
    Setup(SetupMessage),
    /// One realtime input payload
    RealtimeInput(RealtimeInput),
    /// Acknowledgements for remote function calls
    ToolResponse(ToolResponse),
}

/// Session setup parameters
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupMessage {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDeclarations>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window_compression: Option<ContextWindowCompression>,
    pub session_resumption: SessionResumptionConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDeclarations {
    pub function_declarations: Vec<FunctionDeclaration>,
}

/// A function the model may call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
    /// `NON_BLOCKING` lets the conversation continue while the call runs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub behavior: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextWindowCompression {
    pub sliding_window: SlidingWindow,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SlidingWindow {}

/// Resumption request; `handle` is set only when continuing a prior session
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionResumptionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

/// One discrete realtime payload
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RealtimeInput {
    Audio(Blob),
    Text(String),
    Media(Blob),
}

/// Base64 payload with its mime type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub data: String,
    #[serde(default)]
    pub mime_type: String,
}

/// Text-only content (system instruction)
#[derive(Debug, Clone, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub function_responses: Vec<FunctionResponse>,
}

/// Acknowledgement for one function call
#[derive(Debug, Clone, Serialize)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: FunctionResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionResult {
    pub result: serde_json::Value,
    pub scheduling: Scheduling,
}

/// How the model should narrate a tool result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Scheduling {
    /// Do not narrate completion to the user
    Silent,
    WhenIdle,
    Interrupt,
}

impl FunctionResponse {
    /// Build a silent acknowledgement for a dispatched call
    #[must_use]
    pub fn silent(call: &ToolCallRecord, result: serde_json::Value) -> Self {
        Self {
            id: call.id.clone(),
            name: call.name.clone(),
            response: FunctionResult {
                result,
                scheduling: Scheduling::Silent,
            },
        }
    }
}

// -- Inbound -----------------------------------------------------------------

/// A raw message from the live endpoint
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub tool_call: Option<ToolCallMessage>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
    #[serde(default)]
    pub session_resumption_update: Option<SessionResumptionUpdate>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default)]
    pub inline_data: Option<Blob>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallMessage {
    #[serde(default)]
    pub function_calls: Vec<FunctionCall>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResumptionUpdate {
    #[serde(default)]
    pub resumable: bool,
    #[serde(default)]
    pub new_handle: Option<String>,
}

/// A remote function-call request
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub args: serde_json::Value,
}

/// One classified inbound event, consumed in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// New resumption handle (last write wins)
    ResumptionUpdate(String),
    /// Remote end will close soon
    GoAway(Option<String>),
    /// User barged in; queued assistant audio must be discarded
    Interrupted,
    /// Decoded PCM16 bytes of assistant audio
    AudioFragment(Vec<u8>),
    /// Text part of a model turn
    ModelText(String),
    /// End of the current model turn
    TurnComplete,
    /// One or more function calls, in receipt order
    ToolCall(Vec<ToolCallRecord>),
}

impl ServerMessage {
    /// Parse a server message from a JSON text or binary frame
    ///
    /// # Errors
    ///
    /// Returns error if the payload is not a JSON object
    pub fn from_slice(bytes: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Whether the endpoint acknowledged session setup
    #[must_use]
    pub const fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Split into classified inbound messages, preserving wire order
    ///
    /// Audio parts whose payload is not valid base64 are logged and dropped.
    #[must_use]
    pub fn into_inbound(self) -> Vec<InboundMessage> {
        let mut out = Vec::new();

        if let Some(update) = self.session_resumption_update {
            match update.new_handle {
                Some(handle) if update.resumable && !handle.is_empty() => {
                    out.push(InboundMessage::ResumptionUpdate(handle));
                }
                _ => tracing::trace!("non-resumable session update"),
            }
        }

        if let Some(go_away) = self.go_away {
            out.push(InboundMessage::GoAway(go_away.time_left));
        }

        if let Some(tool_call) = self.tool_call {
            let calls: Vec<ToolCallRecord> = tool_call
                .function_calls
                .into_iter()
                .map(|c| ToolCallRecord {
                    id: c.id,
                    name: c.name,
                    args: c.args,
                })
                .collect();
            if !calls.is_empty() {
                out.push(InboundMessage::ToolCall(calls));
            }
        }

        if let Some(content) = self.server_content {
            if content.interrupted {
                out.push(InboundMessage::Interrupted);
            }

            for part in content.model_turn.map(|t| t.parts).unwrap_or_default() {
                if let Some(blob) = part.inline_data {
                    match base64::engine::general_purpose::STANDARD.decode(&blob.data) {
                        Ok(bytes) => out.push(InboundMessage::AudioFragment(bytes)),
                        Err(e) => {
                            tracing::warn!(error = %e, "dropping undecodable audio part");
                        }
                    }
                }
                if let Some(text) = part.text {
                    out.push(InboundMessage::ModelText(text));
                }
            }

            if content.turn_complete {
                out.push(InboundMessage::TurnComplete);
            }
        }

        out
    }
}
