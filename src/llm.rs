//! Streaming chat-completions client for the NPC subsystem.
//!
//! Requests go to an OpenAI-compatible chat endpoint with `stream: true`;
//! the server-sent-event response is parsed into a typed stream of
//! [`StreamEvent`]s that the owning NPC consumes directly.

use futures_util::StreamExt;
use log::debug;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;

/// Receive timeout between SSE events before the stream is abandoned.
const EVENT_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Chat history types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub call_id: String,
    pub name: String,
    pub arguments: String,
}

/// One message in an NPC's bounded history.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
    /// Set on `Tool` turns: which call this is the result of.
    pub tool_call_id: String,
    pub tool_call_name: String,
    /// Set on `Assistant` turns that invoked tools.
    pub tool_calls: Vec<ToolCall>,
}

impl ChatTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: String::new(),
            tool_call_name: String::new(),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_result(call: &ToolCall, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: call.call_id.clone(),
            tool_call_name: call.name.clone(),
            tool_calls: Vec::new(),
        }
    }

    fn to_json(&self) -> Value {
        let mut v = json!({
            "role": self.role,
            "content": self.content,
        });
        if self.role == Role::Tool {
            v["tool_call_id"] = json!(self.tool_call_id);
            v["name"] = json!(self.tool_call_name);
        }
        if !self.tool_calls.is_empty() {
            v["tool_calls"] = Value::Array(
                self.tool_calls
                    .iter()
                    .map(|c| {
                        json!({
                            "id": c.call_id,
                            "type": "function",
                            "function": { "name": c.name, "arguments": c.arguments },
                        })
                    })
                    .collect(),
            );
        }
        v
    }
}

// ---------------------------------------------------------------------------
// Stream events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A streamed piece of assistant text.
    Delta(String),
    /// A completed tool call (flushed before `Done`).
    ToolCall(ToolCall),
    /// End of the response stream.
    Done,
    /// The stream failed; the worker retries or gives up.
    Error(String),
}

// ---------------------------------------------------------------------------
// Endpoint config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LlmEndpoint {
    pub url: String,
    pub api_key: String,
    pub model: String,
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// POST one streaming chat request and pump its SSE events into `tx`.
///
/// Always terminates with exactly one `Done` or `Error` event.
pub async fn stream_chat(
    client: &reqwest::Client,
    endpoint: &LlmEndpoint,
    system_prompt: &str,
    history: &[ChatTurn],
    tools: &Value,
    tx: mpsc::Sender<StreamEvent>,
) {
    let result = stream_chat_inner(client, endpoint, system_prompt, history, tools, &tx).await;
    let terminal = match result {
        Ok(()) => StreamEvent::Done,
        Err(e) => StreamEvent::Error(e.to_string()),
    };
    let _ = tx.send(terminal).await;
}

async fn stream_chat_inner(
    client: &reqwest::Client,
    endpoint: &LlmEndpoint,
    system_prompt: &str,
    history: &[ChatTurn],
    tools: &Value,
    tx: &mpsc::Sender<StreamEvent>,
) -> anyhow::Result<()> {
    let mut messages = vec![json!({ "role": "system", "content": system_prompt })];
    messages.extend(history.iter().map(|t| t.to_json()));

    let body = json!({
        "model": endpoint.model,
        "messages": messages,
        "stream": true,
        "tools": tools,
    });

    let response = client
        .post(&endpoint.url)
        .bearer_auth(&endpoint.api_key)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(serde_json::to_string(&body)?)
        .send()
        .await?
        .error_for_status()?;

    let mut stream = response.bytes_stream();
    let mut line_buf = String::new();
    // Tool calls stream in pieces keyed by index; flushed before Done.
    let mut partial_tool_calls: BTreeMap<u64, ToolCall> = BTreeMap::new();

    loop {
        let piece = match tokio::time::timeout(EVENT_TIMEOUT, stream.next()).await {
            Ok(Some(piece)) => piece?,
            Ok(None) => break, // connection closed without [DONE]
            Err(_) => anyhow::bail!("timed out waiting for stream event"),
        };
        line_buf.push_str(&String::from_utf8_lossy(&piece));

        while let Some(newline) = line_buf.find('\n') {
            let line: String = line_buf.drain(..=newline).collect();
            let line = line.trim();
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                flush_tool_calls(&mut partial_tool_calls, tx).await;
                return Ok(());
            }
            match serde_json::from_str::<Value>(data) {
                Ok(event) => handle_data_event(&event, &mut partial_tool_calls, tx).await,
                Err(e) => debug!("unparseable SSE data event: {}", e),
            }
        }
    }

    flush_tool_calls(&mut partial_tool_calls, tx).await;
    Ok(())
}

async fn handle_data_event(
    event: &Value,
    partial_tool_calls: &mut BTreeMap<u64, ToolCall>,
    tx: &mpsc::Sender<StreamEvent>,
) {
    let delta = &event["choices"][0]["delta"];

    if let Some(content) = delta["content"].as_str() {
        if !content.is_empty() {
            let _ = tx.send(StreamEvent::Delta(content.to_string())).await;
        }
    }

    if let Some(calls) = delta["tool_calls"].as_array() {
        for call in calls {
            let index = call["index"].as_u64().unwrap_or(0);
            let entry = partial_tool_calls.entry(index).or_insert_with(|| ToolCall {
                call_id: String::new(),
                name: String::new(),
                arguments: String::new(),
            });
            if let Some(id) = call["id"].as_str() {
                entry.call_id.push_str(id);
            }
            if let Some(name) = call["function"]["name"].as_str() {
                entry.name.push_str(name);
            }
            if let Some(args) = call["function"]["arguments"].as_str() {
                entry.arguments.push_str(args);
            }
        }
    }
}

async fn flush_tool_calls(
    partial_tool_calls: &mut BTreeMap<u64, ToolCall>,
    tx: &mpsc::Sender<StreamEvent>,
) {
    for (_, call) in std::mem::take(partial_tool_calls) {
        if !call.name.is_empty() {
            let _ = tx.send(StreamEvent::ToolCall(call)).await;
        }
    }
}
