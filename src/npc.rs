//! NPC chat subsystem: language-model-driven avatars that greet, converse
//! and gesture.
//!
//! One manager task routes [`NpcEvent`]s to per-NPC workers.  Each worker
//! owns its conversation history, its observer bookkeeping and (while a
//! response is streaming) one HTTPS connection to the model endpoint.
//! Workers kill themselves after 120 s without activity; the manager
//! re-spins a worker on the next trigger.

use crate::llm::{self, ChatTurn, LlmEndpoint, Role, StreamEvent, ToolCall};
use crate::protocol;
use crate::server::{NpcEvent, Server};
use crate::types::Uid;
use log::{debug, info, warn};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

/// An observer must look at / stand near the NPC this long before it opens
/// a conversation.
const ATTEND_BEFORE_GREETING: Duration = Duration::from_millis(1500);

/// Streamed text sits this long with no further deltas before complete
/// sentences are flushed as chat.
const SENTENCE_FLUSH_SILENCE: Duration = Duration::from_millis(300);

/// A worker with no chat and no server responses for this long shuts down.
const WORKER_IDLE_KILL: Duration = Duration::from_secs(120);

/// A repeating gesture loop is stopped this long after it started.
const REPEATING_GESTURE_STOP: Duration = Duration::from_secs(3);

const MAX_HISTORY_MESSAGES: usize = 50;

const STREAM_RETRIES: u32 = 3;
const STREAM_RETRY_BACKOFF: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Sentence accumulation
// ---------------------------------------------------------------------------

/// Collects streamed text and hands out complete sentences.
///
/// A sentence is complete at `.`, `?`, `!`, `\n` or `\r`.  Incomplete tail
/// text stays buffered (whitespace included) until a later delta completes
/// it or the stream finishes.
#[derive(Debug, Default)]
pub struct SentenceAccumulator {
    buf: String,
}

impl SentenceAccumulator {
    pub fn push(&mut self, delta: &str) {
        self.buf.push_str(delta);
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn is_terminator(c: char) -> bool {
        matches!(c, '.' | '?' | '!' | '\n' | '\r')
    }

    /// Drain every complete sentence, leaving the unterminated tail.
    pub fn take_complete_sentences(&mut self) -> Vec<String> {
        let mut sentences = Vec::new();
        let mut start = 0;
        for (i, c) in self.buf.char_indices() {
            if Self::is_terminator(c) {
                let end = i + c.len_utf8();
                let sentence = &self.buf[start..end];
                if !sentence.trim().is_empty() {
                    sentences.push(sentence.to_string());
                }
                start = end;
            }
        }
        self.buf.drain(..start);
        sentences
    }

    /// Drain everything, terminated or not (stream finished).
    pub fn take_rest(&mut self) -> Option<String> {
        if self.buf.trim().is_empty() {
            self.buf.clear();
            return None;
        }
        Some(std::mem::take(&mut self.buf))
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Spawn a bot avatar into a world.  Returns its UID.
pub fn spawn_bot_avatar(
    server: &Arc<Server>,
    world_name: &str,
    name: &str,
    pos: glam::DVec3,
) -> Uid {
    let (uid, frame) = {
        let mut state = server.state.lock();
        let uid = state.alloc_avatar_uid();
        let world = state.world_entry(world_name);
        let mut avatar = crate::avatar::Avatar::new(uid, crate::types::UserId::INVALID, name);
        avatar.pos = pos;
        avatar.is_bot = true;
        let frame = protocol::avatar_created_frame(&avatar);
        world.avatars.insert(uid, avatar);
        (uid, frame)
    };
    server.broadcast_to_world(world_name, &frame, None);
    info!("spawned bot avatar '{}' ({}) in world '{}'", name, uid, world_name);
    uid
}

pub async fn run(
    server: Arc<Server>,
    mut events: mpsc::UnboundedReceiver<NpcEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let Some(endpoint) = endpoint_from_credentials(&server) else {
        info!("no llm_api_key credential; NPC chat subsystem inactive");
        return;
    };

    let mut workers: HashMap<(String, Uid), mpsc::UnboundedSender<NpcEvent>> = HashMap::new();

    loop {
        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => return,
            },
            _ = shutdown.changed() => return,
        };

        let key = (event_world(&event).to_string(), event_bot(&event));
        let delivered = workers
            .get(&key)
            .map(|tx| tx.send(event.clone()).is_ok())
            .unwrap_or(false);
        if !delivered {
            // Worker is gone (idle-killed) or never existed: re-spin it.
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(event);
            let worker = NpcWorker::new(server.clone(), key.0.clone(), key.1, endpoint.clone());
            tokio::spawn(worker.run(rx));
            workers.insert(key, tx);
        }
    }
}

fn endpoint_from_credentials(server: &Arc<Server>) -> Option<LlmEndpoint> {
    let api_key = server.credential("llm_api_key")?;
    Some(LlmEndpoint {
        url: server
            .credential("llm_api_url")
            .unwrap_or_else(|| "https://api.openai.com/v1/chat/completions".to_string()),
        api_key,
        model: server
            .credential("llm_model")
            .unwrap_or_else(|| "gpt-4o-mini".to_string()),
    })
}

fn event_world(event: &NpcEvent) -> &str {
    match event {
        NpcEvent::ChatHeard { world_name, .. }
        | NpcEvent::UserMovedNear { world_name, .. }
        | NpcEvent::UserMovedAway { world_name, .. } => world_name,
    }
}

fn event_bot(event: &NpcEvent) -> Uid {
    match event {
        NpcEvent::ChatHeard { bot_uid, .. }
        | NpcEvent::UserMovedNear { bot_uid, .. }
        | NpcEvent::UserMovedAway { bot_uid, .. } => *bot_uid,
    }
}

// ---------------------------------------------------------------------------
// Per-NPC worker
// ---------------------------------------------------------------------------

struct ObserverInfo {
    near_since: Instant,
    conversing: bool,
    greeted: bool,
}

struct NpcWorker {
    server: Arc<Server>,
    world_name: String,
    bot_uid: Uid,
    bot_name: String,
    endpoint: LlmEndpoint,
    client: reqwest::Client,

    history: VecDeque<ChatTurn>,
    observers: HashMap<String, ObserverInfo>,

    accumulator: SentenceAccumulator,
    last_delta_time: Option<Instant>,
    assistant_text: String,
    assistant_tool_calls: Vec<ToolCall>,

    stream_rx: Option<mpsc::Receiver<StreamEvent>>,
    stream_retries: u32,
    /// A request should go out as soon as no stream is in flight.
    request_pending: bool,

    repeating_gesture_started: Option<Instant>,
    last_activity: Instant,
}

impl NpcWorker {
    fn new(server: Arc<Server>, world_name: String, bot_uid: Uid, endpoint: LlmEndpoint) -> Self {
        let bot_name = {
            let state = server.state.lock();
            state
                .world(&world_name)
                .and_then(|w| w.avatars.get(&bot_uid))
                .map(|a| a.name.clone())
                .unwrap_or_else(|| "NPC".to_string())
        };
        Self {
            server,
            world_name,
            bot_uid,
            bot_name,
            endpoint,
            client: reqwest::Client::new(),
            history: VecDeque::new(),
            observers: HashMap::new(),
            accumulator: SentenceAccumulator::default(),
            last_delta_time: None,
            assistant_text: String::new(),
            assistant_tool_calls: Vec::new(),
            stream_rx: None,
            stream_retries: 0,
            request_pending: false,
            repeating_gesture_started: None,
            last_activity: Instant::now(),
        }
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<NpcEvent>) {
        debug!("NPC worker for '{}' starting", self.bot_name);
        let mut tick = tokio::time::interval(Duration::from_millis(100));

        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event),
                        None => break, // manager dropped us
                    }
                }
                stream_event = recv_stream(&mut self.stream_rx) => {
                    self.handle_stream_event(stream_event).await;
                }
                _ = tick.tick() => {
                    self.handle_tick();
                }
            }

            if self.request_pending && self.stream_rx.is_none() {
                self.request_pending = false;
                self.start_stream();
            }
            if self.stream_rx.is_none()
                && self.last_activity.elapsed() >= WORKER_IDLE_KILL
            {
                debug!("NPC worker for '{}' idle, shutting down", self.bot_name);
                break;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Triggers
    // -----------------------------------------------------------------------

    fn handle_event(&mut self, event: NpcEvent) {
        self.last_activity = Instant::now();
        match event {
            NpcEvent::UserMovedNear { user_name, .. } => {
                self.observers
                    .entry(user_name)
                    .or_insert_with(|| ObserverInfo {
                        near_since: Instant::now(),
                        conversing: false,
                        greeted: false,
                    });
            }
            NpcEvent::UserMovedAway { user_name, .. } => {
                if let Some(info) = self.observers.remove(&user_name) {
                    if info.conversing {
                        // Triggers a goodbye from the model.
                        self.history.push_back(ChatTurn::new(
                            Role::User,
                            format!("{} moved away from you.", user_name),
                        ));
                        self.trim_history();
                        self.request_pending = true;
                    }
                }
            }
            NpcEvent::ChatHeard { speaker_name, body, .. } => {
                let conversing = self
                    .observers
                    .get(&speaker_name)
                    .map(|o| o.conversing)
                    .unwrap_or(false);
                if conversing {
                    self.history
                        .push_back(ChatTurn::new(Role::User, format!("{}: {}", speaker_name, body)));
                    self.trim_history();
                    self.request_pending = true;
                }
            }
        }
    }

    fn handle_tick(&mut self) {
        // Open conversations with observers who have attended long enough.
        let mut greet: Vec<String> = Vec::new();
        for (name, info) in self.observers.iter_mut() {
            if !info.conversing
                && !info.greeted
                && info.near_since.elapsed() >= ATTEND_BEFORE_GREETING
            {
                info.conversing = true;
                info.greeted = true;
                greet.push(name.clone());
            }
        }
        for name in greet {
            self.history
                .push_back(ChatTurn::new(Role::User, format!("{} is standing nearby.", name)));
            self.trim_history();
            self.request_pending = true;
            self.last_activity = Instant::now();
        }

        // Flush complete sentences after 300 ms of stream silence.
        if let Some(t) = self.last_delta_time {
            if t.elapsed() >= SENTENCE_FLUSH_SILENCE {
                self.flush_complete_sentences();
                self.last_delta_time = None;
            }
        }

        // Stop a repeating gesture loop after 3 s.
        if let Some(started) = self.repeating_gesture_started {
            if started.elapsed() >= REPEATING_GESTURE_STOP {
                self.repeating_gesture_started = None;
                self.server.broadcast_to_world(
                    &self.world_name,
                    &protocol::avatar_stop_gesture_frame(self.bot_uid),
                    None,
                );
            }
        }
    }

    // -----------------------------------------------------------------------
    // Streaming
    // -----------------------------------------------------------------------

    fn start_stream(&mut self) {
        let (tx, rx) = mpsc::channel(64);
        self.stream_rx = Some(rx);
        self.assistant_text.clear();
        self.assistant_tool_calls.clear();

        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let system_prompt = self.system_prompt();
        let history: Vec<ChatTurn> = self.history.iter().cloned().collect();
        let tools = tools_json();
        tokio::spawn(async move {
            llm::stream_chat(&client, &endpoint, &system_prompt, &history, &tools, tx).await;
        });
    }

    async fn handle_stream_event(&mut self, event: StreamEvent) {
        self.last_activity = Instant::now();
        match event {
            StreamEvent::Delta(text) => {
                self.accumulator.push(&text);
                self.assistant_text.push_str(&text);
                self.last_delta_time = Some(Instant::now());
            }
            StreamEvent::ToolCall(call) => {
                self.perform_tool_call(&call);
                self.assistant_tool_calls.push(call);
            }
            StreamEvent::Done => {
                // Flush whatever text is left, then record the full
                // assistant message (tool calls included) in history.
                self.flush_complete_sentences();
                if let Some(rest) = self.accumulator.take_rest() {
                    self.broadcast_chat(&rest);
                }
                self.last_delta_time = None;
                if !self.assistant_text.is_empty() || !self.assistant_tool_calls.is_empty() {
                    let mut turn = ChatTurn::new(Role::Assistant, self.assistant_text.clone());
                    turn.tool_calls = self.assistant_tool_calls.clone();
                    self.history.push_back(turn);
                    self.trim_history();
                }
                self.stream_rx = None;
                self.stream_retries = 0;
            }
            StreamEvent::Error(e) => {
                self.stream_rx = None;
                if self.stream_retries < STREAM_RETRIES {
                    self.stream_retries += 1;
                    warn!(
                        "NPC '{}' stream failed (attempt {}): {}",
                        self.bot_name, self.stream_retries, e
                    );
                    tokio::time::sleep(STREAM_RETRY_BACKOFF).await;
                    self.request_pending = true;
                } else {
                    warn!("NPC '{}' stream abandoned: {}", self.bot_name, e);
                    self.stream_retries = 0;
                }
            }
        }
    }

    fn perform_tool_call(&mut self, call: &ToolCall) {
        let gesture = match call.name.as_str() {
            "perform_wave_gesture" => Some("Wave"),
            "perform_bow_gesture" => Some("Bow"),
            other => {
                debug!("NPC '{}': unknown tool call '{}'", self.bot_name, other);
                None
            }
        };
        if let Some(gesture) = gesture {
            self.server.broadcast_to_world(
                &self.world_name,
                &protocol::avatar_gesture_frame(self.bot_uid, gesture),
                None,
            );
            self.repeating_gesture_started = Some(Instant::now());
            self.history
                .push_back(ChatTurn::tool_result(call, "Done."));
            self.trim_history();
            // The model gets the tool result and continues the turn.
            self.request_pending = true;
        }
    }

    // -----------------------------------------------------------------------
    // Output
    // -----------------------------------------------------------------------

    fn flush_complete_sentences(&mut self) {
        for sentence in self.accumulator.take_complete_sentences() {
            self.broadcast_chat(&sentence);
        }
    }

    fn broadcast_chat(&self, body: &str) {
        self.server.broadcast_to_world(
            &self.world_name,
            &protocol::chat_message_frame(self.bot_uid, &self.bot_name, body),
            None,
        );
    }

    fn trim_history(&mut self) {
        while self.history.len() > MAX_HISTORY_MESSAGES {
            self.history.pop_front();
        }
    }

    fn system_prompt(&self) -> String {
        format!(
            "You are {}, a friendly character in a 3D virtual world. \
             Keep replies short and conversational. \
             Greet people who approach you and say goodbye when they leave. \
             Use your gesture tools when it fits.",
            self.bot_name
        )
    }
}

async fn recv_stream(rx: &mut Option<mpsc::Receiver<StreamEvent>>) -> StreamEvent {
    match rx {
        Some(rx) => match rx.recv().await {
            Some(event) => event,
            None => StreamEvent::Done, // sender dropped; treat as end
        },
        None => std::future::pending().await,
    }
}

fn tools_json() -> Value {
    json!([
        {
            "type": "function",
            "function": {
                "name": "perform_wave_gesture",
                "description": "Wave at the person you are talking to.",
                "parameters": { "type": "object", "properties": {} }
            }
        },
        {
            "type": "function",
            "function": {
                "name": "perform_bow_gesture",
                "description": "Bow to the person you are talking to.",
                "parameters": { "type": "object", "properties": {} }
            }
        }
    ])
}
