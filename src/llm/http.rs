//! Thin HTTP bindings for the two selectable conversation-model providers.
//!
//! The two wire formats differ in envelope only; both are mapped onto the
//! provider-neutral [`ChatRequest`]/[`ChatResponse`] types. Anything beyond
//! envelope translation (retry policy, tool semantics, prompt construction)
//! lives with the callers.

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::warn;

use crate::config::{AppConfig, LlmProviderKind};
use crate::error::{AccordResult, AgentError, TransportError};
use crate::llm::{ChatMessage, ChatRequest, ChatResponse, ContentBlock, LlmProvider, StopReason};

const PROVIDER_A_URL: &str = "https://api.provider-a.example/v1/messages";
const PROVIDER_B_URL: &str = "https://api.provider-b.example/v1/chat/completions";

pub struct HttpLlmProvider {
    client: reqwest::Client,
    kind: LlmProviderKind,
    api_key: String,
    model: String,
}

impl HttpLlmProvider {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            kind: config.llm_provider,
            api_key: config.llm_api_key.clone(),
            model: config.llm_model.clone(),
        }
    }

    fn encode(&self, request: &ChatRequest) -> Value {
        match self.kind {
            // Provider A: system prompt as a top-level field, content blocks
            // pass through structurally.
            LlmProviderKind::A => json!({
                "model": self.model,
                "max_tokens": request.max_tokens,
                "system": request.system,
                "messages": request.messages,
                "tools": request.tools,
            }),
            // Provider B: system prompt travels as the first message, tool
            // calls ride on assistant messages, tool results are `tool`-role
            // messages, and tools are wrapped in a function envelope.
            LlmProviderKind::B => {
                let mut messages = vec![json!({"role": "system", "content": request.system})];
                for message in &request.messages {
                    messages.extend(encode_message_b(message));
                }
                json!({
                    "model": self.model,
                    "max_tokens": request.max_tokens,
                    "messages": messages,
                    "tools": request.tools.iter().map(|t| json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.input_schema,
                        },
                    })).collect::<Vec<_>>(),
                })
            }
        }
    }

    fn decode(&self, body: Value) -> AccordResult<ChatResponse> {
        match self.kind {
            LlmProviderKind::A => decode_a(body),
            LlmProviderKind::B => decode_b(body),
        }
    }

    fn endpoint(&self) -> &'static str {
        match self.kind {
            LlmProviderKind::A => PROVIDER_A_URL,
            LlmProviderKind::B => PROVIDER_B_URL,
        }
    }
}

#[async_trait]
impl LlmProvider for HttpLlmProvider {
    async fn complete(&self, request: ChatRequest) -> AccordResult<ChatResponse> {
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&self.encode(&request))
            .send()
            .await
            .map_err(TransportError::Http)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Provider(format!("{status}: {body}")).into());
        }

        let body: Value = response.json().await.map_err(TransportError::Http)?;
        self.decode(body)
    }
}

// ================================================================================================
// Provider A envelope
// ================================================================================================

fn decode_a(body: Value) -> AccordResult<ChatResponse> {
    let content: Vec<ContentBlock> =
        serde_json::from_value(body.get("content").cloned().unwrap_or(Value::Array(vec![])))
            .map_err(TransportError::Json)?;
    let stop_reason = match body.get("stop_reason").and_then(Value::as_str) {
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens") => StopReason::MaxTokens,
        _ => StopReason::EndTurn,
    };
    Ok(ChatResponse {
        content,
        stop_reason,
    })
}

// ================================================================================================
// Provider B envelope
// ================================================================================================

/// Flatten one neutral message into Provider B wire messages. A message
/// mixing text and tool use becomes one assistant message carrying both;
/// each tool result becomes its own `tool`-role message.
fn encode_message_b(message: &ChatMessage) -> Vec<Value> {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    let mut out = Vec::new();

    for block in &message.content {
        match block {
            ContentBlock::Text { text: t } => {
                if !text.is_empty() {
                    text.push('\n');
                }
                text.push_str(t);
            }
            ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(json!({
                    "id": id,
                    "type": "function",
                    "function": {
                        "name": name,
                        "arguments": input.to_string(),
                    },
                }));
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => {
                out.push(json!({
                    "role": "tool",
                    "tool_call_id": tool_use_id,
                    "content": content,
                }));
            }
        }
    }

    if !text.is_empty() || !tool_calls.is_empty() {
        let mut wire = Map::new();
        wire.insert("role".to_string(), json!(message.role));
        wire.insert("content".to_string(), json!(text));
        if !tool_calls.is_empty() {
            wire.insert("tool_calls".to_string(), Value::Array(tool_calls));
        }
        // Text-and-calls precede results chronologically.
        out.insert(0, Value::Object(wire));
    }
    out
}

/// Read the `choices[0]` envelope: `message.content` as a text block,
/// `message.tool_calls[]` as tool-use blocks (their `function.arguments`
/// arrive as a JSON string), `finish_reason` as the stop reason.
fn decode_b(body: Value) -> AccordResult<ChatResponse> {
    let choice = body
        .pointer("/choices/0")
        .ok_or_else(|| TransportError::Stream("completion carried no choices".to_string()))?;
    let message = choice.get("message").cloned().unwrap_or(Value::Null);

    let mut content = Vec::new();
    if let Some(text) = message.get("content").and_then(Value::as_str) {
        if !text.is_empty() {
            content.push(ContentBlock::Text {
                text: text.to_string(),
            });
        }
    }

    if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
        for call in calls {
            let id = call
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let name = call
                .pointer("/function/name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let raw_args = call
                .pointer("/function/arguments")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let input = if raw_args.trim().is_empty() {
                Value::Object(Map::new())
            } else {
                serde_json::from_str(raw_args).unwrap_or_else(|err| {
                    warn!(tool = %name, %err, "tool call arguments are not valid JSON; passing empty object");
                    Value::Object(Map::new())
                })
            };
            content.push(ContentBlock::ToolUse { id, name, input });
        }
    }

    let stop_reason = match choice.get("finish_reason").and_then(Value::as_str) {
        Some("tool_calls") => StopReason::ToolUse,
        Some("length") => StopReason::MaxTokens,
        _ => StopReason::EndTurn,
    };
    Ok(ChatResponse {
        content,
        stop_reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Role;

    #[test]
    fn provider_a_content_passes_through() {
        let body = json!({
            "content": [
                {"type": "text", "text": "thinking"},
                {"type": "tool_use", "id": "c1", "name": "analyze_and_propose",
                 "input": {"summary": "job"}},
            ],
            "stop_reason": "tool_use",
        });
        let response = decode_a(body).unwrap();
        assert_eq!(response.stop_reason, StopReason::ToolUse);
        assert_eq!(response.content.len(), 2);
    }

    #[test]
    fn provider_b_choices_envelope_decodes() {
        let body = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": "on it",
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {
                            "name": "evaluate_proposal",
                            "arguments": "{\"negotiationId\": \"neg_1\", \"decision\": \"accept\"}",
                        },
                    }],
                },
                "finish_reason": "tool_calls",
            }],
        });
        let response = decode_b(body).unwrap();
        assert_eq!(response.stop_reason, StopReason::ToolUse);

        let mut uses = response.tool_uses();
        let (id, name, input) = uses.next().unwrap();
        assert_eq!(id, "call_1");
        assert_eq!(name, "evaluate_proposal");
        assert_eq!(input["decision"], "accept");
    }

    #[test]
    fn provider_b_malformed_arguments_fall_back_to_empty_object() {
        let body = json!({
            "choices": [{
                "message": {
                    "content": "",
                    "tool_calls": [{
                        "id": "call_1",
                        "function": {"name": "check_balance", "arguments": "not json"},
                    }],
                },
                "finish_reason": "tool_calls",
            }],
        });
        let response = decode_b(body).unwrap();
        let (_, _, input) = response.tool_uses().next().unwrap();
        assert_eq!(input, &Value::Object(Map::new()));
    }

    #[test]
    fn provider_b_plain_completion_is_end_turn() {
        let body = json!({
            "choices": [{
                "message": {"role": "assistant", "content": "all done"},
                "finish_reason": "stop",
            }],
        });
        let response = decode_b(body).unwrap();
        assert_eq!(response.stop_reason, StopReason::EndTurn);
        assert_eq!(response.text(), "all done");
    }

    #[test]
    fn provider_b_empty_choices_is_an_error() {
        assert!(decode_b(json!({"choices": []})).is_err());
    }

    #[test]
    fn tool_results_become_tool_role_messages() {
        let message = ChatMessage::tool_results(vec![
            ContentBlock::ToolResult {
                tool_use_id: "call_1".to_string(),
                content: "done".to_string(),
                is_error: false,
            },
            ContentBlock::ToolResult {
                tool_use_id: "call_2".to_string(),
                content: "Error: nope".to_string(),
                is_error: true,
            },
        ]);
        let wire = encode_message_b(&message);
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[0]["role"], "tool");
        assert_eq!(wire[0]["tool_call_id"], "call_1");
        assert_eq!(wire[1]["tool_call_id"], "call_2");
    }

    #[test]
    fn assistant_text_and_calls_share_one_message() {
        let message = ChatMessage {
            role: Role::Assistant,
            content: vec![
                ContentBlock::Text {
                    text: "placing the hold".to_string(),
                },
                ContentBlock::ToolUse {
                    id: "call_1".to_string(),
                    name: "create_escrow_hold".to_string(),
                    input: json!({"amount": 5000}),
                },
            ],
        };
        let wire = encode_message_b(&message);
        assert_eq!(wire.len(), 1);
        assert_eq!(wire[0]["role"], "assistant");
        assert_eq!(wire[0]["content"], "placing the hold");
        assert_eq!(wire[0]["tool_calls"][0]["function"]["name"], "create_escrow_hold");
    }
}
