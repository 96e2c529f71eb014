//! Server-sent events client polyfill.
//!
//! The wire parser is incremental and byte-oriented: chunks may split lines,
//! UTF-8 sequences, or a CRLF pair at any byte, and the resulting event
//! sequence is identical to parsing the whole stream at once. Sessions run
//! on the shared runtime and deliver signals through the reactor; guest
//! callbacks run on the context thread.

use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;

use crossbeam_channel::Sender;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tonbridge_core::{GuestError, GuestFunctionRef, GuestValue, ScriptContext};
use tracing::{debug, warn};

use crate::marshal;
use crate::reactor::NativeEvent;
use crate::sync_cell::SyncCell;

/// One dispatched event frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SseEvent {
    /// Event type; `message` when the frame carried no `event` field.
    pub event: String,
    /// Data lines joined with `\n`.
    pub data: String,
    /// Last event id in effect when the frame was dispatched.
    pub last_event_id: String,
}

/// Incremental parser for the `text/event-stream` format.
#[derive(Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    data: Vec<String>,
    event: Option<String>,
    last_event_id: String,
    retry_ms: Option<u64>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id carried by the most recent `id` field, sticky across frames.
    pub fn last_event_id(&self) -> &str {
        &self.last_event_id
    }

    /// Server-requested reconnection delay, when one was sent.
    pub fn retry_ms(&self) -> Option<u64> {
        self.retry_ms
    }

    /// Consume a chunk and return the events it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        let mut i = 0;
        while i < self.buffer.len() {
            match self.buffer[i] {
                b'\n' => {
                    lines.push(String::from_utf8_lossy(&self.buffer[start..i]).into_owned());
                    i += 1;
                    start = i;
                }
                b'\r' => {
                    // A trailing CR might be the first half of a CRLF split
                    // across chunks; hold it until the next byte arrives.
                    if i + 1 == self.buffer.len() {
                        break;
                    }
                    lines.push(String::from_utf8_lossy(&self.buffer[start..i]).into_owned());
                    i += if self.buffer[i + 1] == b'\n' { 2 } else { 1 };
                    start = i;
                }
                _ => i += 1,
            }
        }
        self.buffer.drain(..start);

        let mut events = Vec::new();
        for line in lines {
            self.process_line(&line, &mut events);
        }
        events
    }

    /// Flush at end of stream. A held trailing CR was a complete line
    /// terminator after all; an unterminated partial line is discarded.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if self.buffer.last() == Some(&b'\r') {
            self.buffer.pop();
            let line = String::from_utf8_lossy(&self.buffer).into_owned();
            self.buffer.clear();
            self.process_line(&line, &mut events);
        }
        events
    }

    fn process_line(&mut self, line: &str, events: &mut Vec<SseEvent>) {
        if line.is_empty() {
            self.dispatch(events);
            return;
        }
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "data" => self.data.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            // An id containing NUL is ignored entirely.
            "id" if !value.contains('\0') => self.last_event_id = value.to_string(),
            "id" => {}
            "retry" => {
                if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
                    self.retry_ms = value.parse().ok();
                }
            }
            _ => {}
        }
    }

    fn dispatch(&mut self, events: &mut Vec<SseEvent>) {
        let event = self.event.take();
        if self.data.is_empty() {
            return;
        }
        events.push(SseEvent {
            event: event.unwrap_or_else(|| "message".to_string()),
            data: std::mem::take(&mut self.data).join("\n"),
            last_event_id: self.last_event_id.clone(),
        });
    }
}

/// Signal from a background stream session to the context thread.
pub enum SseSignal {
    Open,
    Event(SseEvent),
    Error(String),
    Closed,
}

/// Connection options accepted from guest code.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SseOptions {
    pub headers: HashMap<String, String>,
    /// Sent as the `Last-Event-ID` header so the server can resume.
    pub last_event_id: Option<String>,
}

struct Session {
    on_message: GuestFunctionRef,
    on_open: Option<GuestFunctionRef>,
    on_error: Option<GuestFunctionRef>,
    on_close: Option<GuestFunctionRef>,
    task: Option<AbortHandle>,
}

/// Guest callbacks for one session.
pub struct SessionCallbacks {
    pub on_message: GuestFunctionRef,
    pub on_open: Option<GuestFunctionRef>,
    pub on_error: Option<GuestFunctionRef>,
    pub on_close: Option<GuestFunctionRef>,
}

/// Per-context SSE session table.
pub struct SseClient {
    ctx: Rc<dyn ScriptContext>,
    http: reqwest::Client,
    sessions: SyncCell<HashMap<u64, Session>>,
    next_id: Cell<u64>,
    events: Sender<NativeEvent>,
    runtime: Handle,
}

impl SseClient {
    pub fn new(
        ctx: Rc<dyn ScriptContext>,
        http: reqwest::Client,
        events: Sender<NativeEvent>,
        runtime: Handle,
    ) -> Rc<Self> {
        Rc::new(Self {
            ctx,
            http,
            sessions: SyncCell::default(),
            next_id: Cell::new(1),
            events,
            runtime,
        })
    }

    pub fn active_count(&self) -> usize {
        self.sessions.with(|sessions| sessions.len())
    }

    /// Open a stream. Returns the session id; signals arrive through the
    /// reactor and are delivered via [`SseClient::handle`].
    pub fn open(&self, url: String, options: SseOptions, callbacks: SessionCallbacks) -> u64 {
        let id = self.register(callbacks);
        let tx = self.events.clone();
        let http = self.http.clone();
        let task = self
            .runtime
            .spawn(run_stream(http, url, options, id, tx))
            .abort_handle();
        self.sessions.with(|sessions| match sessions.get_mut(&id) {
            Some(session) => session.task = Some(task),
            None => task.abort(),
        });
        debug!(session = id, "event stream opened");
        id
    }

    fn register(&self, callbacks: SessionCallbacks) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.sessions.with(|sessions| {
            sessions.insert(
                id,
                Session {
                    on_message: callbacks.on_message,
                    on_open: callbacks.on_open,
                    on_error: callbacks.on_error,
                    on_close: callbacks.on_close,
                    task: None,
                },
            );
        });
        id
    }

    /// Close a session from the native side. Unknown ids are ignored.
    pub fn close(&self, id: u64) {
        let removed = self.sessions.with(|sessions| sessions.remove(&id));
        if let Some(session) = removed {
            if let Some(task) = session.task {
                task.abort();
            }
            debug!(session = id, "event stream closed");
        }
    }

    pub fn close_all(&self) {
        let sessions = self.sessions.with(std::mem::take);
        for (_, session) in sessions {
            if let Some(task) = session.task {
                task.abort();
            }
        }
    }

    /// Deliver a routed signal to its session's callbacks. Signals for
    /// closed sessions are stale and dropped.
    ///
    /// `Error` and `Closed` are both terminal: the session is removed
    /// before its callback runs, so a session sees at most one of them.
    pub fn handle(&self, id: u64, signal: SseSignal) {
        let callback = self.sessions.with(|sessions| {
            let session = sessions.get(&id)?;
            match &signal {
                SseSignal::Open => session.on_open.clone(),
                SseSignal::Event(_) => Some(session.on_message.clone()),
                SseSignal::Error(_) => sessions.remove(&id).and_then(|s| s.on_error),
                SseSignal::Closed => sessions.remove(&id).and_then(|s| s.on_close),
            }
        });
        let Some(callback) = callback else {
            return;
        };

        let arg = match signal {
            SseSignal::Open | SseSignal::Closed => GuestValue::Undefined,
            SseSignal::Event(event) => match marshal::encode(&*self.ctx, &event) {
                Ok(value) => value,
                Err(err) => {
                    warn!(session = id, error = %err, "event not encodable");
                    return;
                }
            },
            SseSignal::Error(message) => GuestValue::String(message),
        };
        if let Err(err) = callback.call(GuestValue::Undefined, &[arg]) {
            warn!(session = id, error = %err, "stream callback failed");
        }
    }
}

async fn run_stream(
    http: reqwest::Client,
    url: String,
    options: SseOptions,
    session: u64,
    tx: Sender<NativeEvent>,
) {
    let send = |signal: SseSignal| tx.send(NativeEvent::Sse { session, signal }).is_ok();

    let mut request = http.get(&url).header("accept", "text/event-stream");
    for (name, value) in &options.headers {
        request = request.header(name, value);
    }
    if let Some(id) = &options.last_event_id {
        request = request.header("last-event-id", id);
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            send(SseSignal::Error(e.to_string()));
            return;
        }
    };
    if !response.status().is_success() {
        send(SseSignal::Error(format!(
            "event stream responded with status {}",
            response.status()
        )));
        return;
    }

    if !send(SseSignal::Open) {
        return;
    }

    let mut parser = SseParser::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                for event in parser.feed(&bytes) {
                    if !send(SseSignal::Event(event)) {
                        return;
                    }
                }
            }
            Err(e) => {
                send(SseSignal::Error(e.to_string()));
                return;
            }
        }
    }
    for event in parser.finish() {
        if !send(SseSignal::Event(event)) {
            return;
        }
    }
    send(SseSignal::Closed);
}

/// Install `connectEventSource` and `closeEventSource` on the context.
pub fn install(ctx: &Rc<dyn ScriptContext>, client: Rc<SseClient>) {
    let global = ctx.global();

    {
        let client = client.clone();
        let connect = ctx.create_function(
            "connectEventSource",
            Rc::new(move |args| {
                let url = match args.first().and_then(GuestValue::as_str) {
                    Some(url) => url.to_string(),
                    None => {
                        return Err(GuestError::type_error(
                            "connectEventSource url must be a string",
                        ));
                    }
                };
                let handlers = match args.get(1).and_then(GuestValue::as_object) {
                    Some(handlers) => handlers.clone(),
                    None => {
                        return Err(GuestError::type_error(
                            "connectEventSource handlers must be an object",
                        ));
                    }
                };
                let handler = |name: &str| {
                    handlers
                        .get_member(name)
                        .and_then(|v| v.as_function().cloned())
                };
                let on_message = handler("onMessage").ok_or_else(|| {
                    GuestError::type_error("connectEventSource requires an onMessage function")
                })?;
                let options: SseOptions =
                    marshal::decode_opt(args.get(2).unwrap_or(&GuestValue::Undefined))
                        .map_err(|e| GuestError::type_error(format!("stream options: {e}")))?
                        .unwrap_or_default();

                let id = client.open(
                    url,
                    options,
                    SessionCallbacks {
                        on_message,
                        on_open: handler("onOpen"),
                        on_error: handler("onError"),
                        on_close: handler("onClose"),
                    },
                );
                Ok(GuestValue::Number(id as f64))
            }),
        );
        global.set_member("connectEventSource", GuestValue::Function(connect));
    }

    {
        let close = ctx.create_function(
            "closeEventSource",
            Rc::new(move |args| {
                if let Some(id) = args.first().and_then(GuestValue::as_f64) {
                    client.close(id as u64);
                }
                Ok(GuestValue::Undefined)
            }),
        );
        global.set_member("closeEventSource", GuestValue::Function(close));
    }
}
