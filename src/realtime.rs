use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{ApiClient, ApiError, DirectMessage};

// Capacity 1 is the closest tokio gets to an unbuffered channel: a slow
// consumer stalls the reader instead of dropping events.
const CHANNEL_CAPACITY: usize = 1;

const NETWORK_BACKOFF_STEP: Duration = Duration::from_millis(250);
const NETWORK_BACKOFF_MAX: Duration = Duration::from_secs(16);
const HTTP_BACKOFF_START: Duration = Duration::from_secs(5);
const HTTP_BACKOFF_MAX: Duration = Duration::from_secs(320);
const RATE_LIMIT_BACKOFF_START: Duration = Duration::from_secs(60);
const RATE_LIMIT_BACKOFF_MAX: Duration = Duration::from_secs(960);

/// One item of account activity delivered by the user stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    DirectMessage(DirectMessage),
    Tweet(Value),
    /// Named activity such as `favorite`, `follow` or `list_member_added`.
    Event { name: String, payload: Value },
    FriendsList(Vec<i64>),
    Delete(Value),
    Limit { track: i64 },
    Disconnect { code: i64, reason: String },
    Warning { code: String, message: String },
    Unknown(Value),
}

impl StreamEvent {
    pub fn from_value(value: Value) -> Self {
        let Some(object) = value.as_object() else {
            return StreamEvent::Unknown(value);
        };

        if let Some(dm) = object.get("direct_message") {
            return match serde_json::from_value::<DirectMessage>(dm.clone()) {
                Ok(dm) => StreamEvent::DirectMessage(dm),
                Err(_) => StreamEvent::Unknown(value),
            };
        }
        if let Some(friends) = object.get("friends").and_then(Value::as_array) {
            return StreamEvent::FriendsList(friends.iter().filter_map(Value::as_i64).collect());
        }
        if let Some(name) = object.get("event").and_then(Value::as_str) {
            return StreamEvent::Event {
                name: name.to_string(),
                payload: value.clone(),
            };
        }
        if let Some(delete) = object.get("delete") {
            return StreamEvent::Delete(delete.clone());
        }
        if let Some(limit) = object.get("limit") {
            return StreamEvent::Limit {
                track: limit.get("track").and_then(Value::as_i64).unwrap_or(0),
            };
        }
        if let Some(disconnect) = object.get("disconnect") {
            return StreamEvent::Disconnect {
                code: disconnect.get("code").and_then(Value::as_i64).unwrap_or(0),
                reason: string_field(disconnect, "reason"),
            };
        }
        if let Some(warning) = object.get("warning") {
            return StreamEvent::Warning {
                code: string_field(warning, "code"),
                message: string_field(warning, "message"),
            };
        }
        if object.contains_key("text") && object.contains_key("user") {
            return StreamEvent::Tweet(value);
        }
        StreamEvent::Unknown(value)
    }
}

fn string_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Decodes one stream line. Keep-alive blank lines and non-JSON lines yield `None`.
pub fn decode_line(line: &str) -> Option<StreamEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(line) {
        Ok(value) => Some(StreamEvent::from_value(value)),
        Err(error) => {
            debug!(%error, "dropping undecodable stream line");
            None
        }
    }
}

/// Splits a chunked body into complete lines.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line);
            let text = text.trim_end_matches(['\r', '\n']);
            if !text.trim().is_empty() {
                lines.push(text.to_string());
            }
        }
        lines
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    Network,
    Http,
    RateLimited,
    Unauthorized,
}

impl Failure {
    fn from_error(error: &ApiError) -> Self {
        match error {
            ApiError::Authentication(_) => Failure::Unauthorized,
            ApiError::Status(420) | ApiError::Status(429) => Failure::RateLimited,
            ApiError::Http(_) => Failure::Network,
            _ => Failure::Http,
        }
    }
}

#[derive(Debug, Default)]
struct Backoff {
    network: u32,
    http: u32,
    rate_limited: u32,
}

impl Backoff {
    /// Delay before the next reconnect, or `None` when reconnecting is pointless.
    fn next_delay(&mut self, failure: Failure) -> Option<Duration> {
        match failure {
            Failure::Network => {
                self.network = self.network.saturating_add(1);
                Some((NETWORK_BACKOFF_STEP * self.network).min(NETWORK_BACKOFF_MAX))
            }
            Failure::Http => {
                self.http = self.http.saturating_add(1);
                Some(exponential(HTTP_BACKOFF_START, self.http, HTTP_BACKOFF_MAX))
            }
            Failure::RateLimited => {
                self.rate_limited = self.rate_limited.saturating_add(1);
                Some(exponential(RATE_LIMIT_BACKOFF_START, self.rate_limited, RATE_LIMIT_BACKOFF_MAX))
            }
            Failure::Unauthorized => None,
        }
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

fn exponential(start: Duration, attempt: u32, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    start.saturating_mul(factor).min(max)
}

enum ReadOutcome {
    ReceiverClosed,
    Failed(Failure),
}

/// A live user stream: a reader task feeding decoded events into a channel.
pub struct UserStream {
    events: Option<mpsc::Receiver<StreamEvent>>,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
}

impl UserStream {
    pub fn open(api: ApiClient) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let reader = tokio::spawn(run_reader(api, tx, cancel.clone()));
        Self {
            events: Some(rx),
            cancel,
            reader,
        }
    }

    /// Hands out the raw event receiver. Only the first call gets it.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<StreamEvent>> {
        self.events.take()
    }

    /// Stops the connection and waits for the reader to exit, which closes
    /// the event channel.
    pub async fn close(self) {
        self.cancel.cancel();
        if let Err(error) = self.reader.await {
            warn!(%error, "stream reader ended abnormally");
        }
    }
}

async fn run_reader(api: ApiClient, tx: mpsc::Sender<StreamEvent>, cancel: CancellationToken) {
    let mut backoff = Backoff::default();
    loop {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return,
            outcome = read_connection(&api, &tx, &mut backoff) => outcome,
        };

        let failure = match outcome {
            ReadOutcome::ReceiverClosed => return,
            ReadOutcome::Failed(failure) => failure,
        };
        let Some(delay) = backoff.next_delay(failure) else {
            error!("user stream rejected credentials; not reconnecting");
            return;
        };
        warn!(?failure, delay_ms = delay.as_millis() as u64, "user stream dropped; reconnecting");

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn read_connection(
    api: &ApiClient,
    tx: &mpsc::Sender<StreamEvent>,
    backoff: &mut Backoff,
) -> ReadOutcome {
    let response = match api.connect_stream().await {
        Ok(response) => response,
        Err(error) => {
            warn!(%error, "user stream connect failed");
            return ReadOutcome::Failed(Failure::from_error(&error));
        }
    };
    info!("user stream connected");
    backoff.reset();

    let mut body = response.bytes_stream();
    let mut lines = LineBuffer::default();
    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(error) => {
                warn!(%error, "user stream read failed");
                return ReadOutcome::Failed(Failure::Network);
            }
        };
        for line in lines.push(&chunk) {
            let Some(event) = decode_line(&line) else {
                continue;
            };
            if tx.send(event).await.is_err() {
                return ReadOutcome::ReceiverClosed;
            }
        }
    }
    ReadOutcome::Failed(Failure::Network)
}

/// Forwards only direct messages from `events`, in arrival order.
///
/// The task ends when the source channel closes or the returned receiver is
/// dropped.
pub fn filter_direct_messages(
    mut events: mpsc::Receiver<StreamEvent>,
) -> (mpsc::Receiver<DirectMessage>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let handle = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                StreamEvent::DirectMessage(dm) => {
                    if tx.send(dm).await.is_err() {
                        break;
                    }
                }
                StreamEvent::Disconnect { code, reason } => {
                    warn!(code, %reason, "user stream disconnect notice");
                }
                StreamEvent::Warning { code, message } => {
                    warn!(%code, %message, "user stream warning");
                }
                StreamEvent::Limit { track } => debug!(track, "user stream limit notice"),
                StreamEvent::Event { name, payload } => debug!(%name, ?payload, "skipping account event"),
                StreamEvent::FriendsList(ids) => debug!(friends = ids.len(), "skipping friends list"),
                StreamEvent::Tweet(payload) | StreamEvent::Delete(payload) | StreamEvent::Unknown(payload) => {
                    debug!(?payload, "skipping stream payload");
                }
            }
        }
    });
    (rx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dm_json(id: i64, text: &str) -> Value {
        json!({
            "direct_message": {
                "id": id,
                "sender_id": 10,
                "sender_screen_name": "alice",
                "recipient_id": 20,
                "recipient_screen_name": "bob",
                "text": text
            }
        })
    }

    fn dm_texts(events: Vec<StreamEvent>) -> Vec<String> {
        events
            .into_iter()
            .filter_map(|event| match event {
                StreamEvent::DirectMessage(dm) => Some(dm.text),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn classifies_stream_payloads() {
        let dm = StreamEvent::from_value(dm_json(1, "hi"));
        assert!(matches!(dm, StreamEvent::DirectMessage(ref message) if message.text == "hi"));

        let friends = StreamEvent::from_value(json!({"friends": [1, 2, 3]}));
        assert_eq!(friends, StreamEvent::FriendsList(vec![1, 2, 3]));

        let favorite = StreamEvent::from_value(json!({"event": "favorite", "source": {}}));
        assert!(matches!(favorite, StreamEvent::Event { ref name, .. } if name == "favorite"));

        let tweet = StreamEvent::from_value(json!({"id": 9, "text": "tweet", "user": {"id": 1}}));
        assert!(matches!(tweet, StreamEvent::Tweet(_)));

        let delete = StreamEvent::from_value(json!({"delete": {"status": {"id": 9}}}));
        assert!(matches!(delete, StreamEvent::Delete(_)));

        let limit = StreamEvent::from_value(json!({"limit": {"track": 12}}));
        assert_eq!(limit, StreamEvent::Limit { track: 12 });

        let disconnect = StreamEvent::from_value(json!({"disconnect": {"code": 4, "reason": "stall"}}));
        assert_eq!(
            disconnect,
            StreamEvent::Disconnect {
                code: 4,
                reason: "stall".to_string()
            }
        );

        let unknown = StreamEvent::from_value(json!({"scrub_geo": {}}));
        assert!(matches!(unknown, StreamEvent::Unknown(_)));
    }

    #[test]
    fn malformed_direct_message_is_not_a_direct_message() {
        let event = StreamEvent::from_value(json!({"direct_message": {"id": "nope"}}));
        assert!(matches!(event, StreamEvent::Unknown(_)));
    }

    #[test]
    fn decode_line_skips_keepalives_and_garbage() {
        assert!(decode_line("").is_none());
        assert!(decode_line("\r").is_none());
        assert!(decode_line("{not json").is_none());
        assert!(decode_line(r#"{"friends":[]}"#).is_some());
    }

    #[test]
    fn line_buffer_joins_split_chunks() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(b"{\"friends\":").is_empty());
        let lines = buffer.push(b"[1]}\r\n\r\n{\"limit\"");
        assert_eq!(lines, vec!["{\"friends\":[1]}".to_string()]);
        let lines = buffer.push(b":{}}\n");
        assert_eq!(lines, vec!["{\"limit\":{}}".to_string()]);
    }

    #[test]
    fn backoff_grows_and_caps_per_failure_kind() {
        let mut backoff = Backoff::default();
        assert_eq!(backoff.next_delay(Failure::Network), Some(Duration::from_millis(250)));
        assert_eq!(backoff.next_delay(Failure::Network), Some(Duration::from_millis(500)));
        for _ in 0..100 {
            backoff.next_delay(Failure::Network);
        }
        assert_eq!(backoff.next_delay(Failure::Network), Some(NETWORK_BACKOFF_MAX));

        assert_eq!(backoff.next_delay(Failure::Http), Some(Duration::from_secs(5)));
        assert_eq!(backoff.next_delay(Failure::Http), Some(Duration::from_secs(10)));
        assert_eq!(backoff.next_delay(Failure::Http), Some(Duration::from_secs(20)));
        for _ in 0..40 {
            backoff.next_delay(Failure::Http);
        }
        assert_eq!(backoff.next_delay(Failure::Http), Some(HTTP_BACKOFF_MAX));

        assert_eq!(backoff.next_delay(Failure::RateLimited), Some(Duration::from_secs(60)));
        assert_eq!(backoff.next_delay(Failure::RateLimited), Some(Duration::from_secs(120)));

        assert_eq!(backoff.next_delay(Failure::Unauthorized), None);

        backoff.reset();
        assert_eq!(backoff.next_delay(Failure::Http), Some(Duration::from_secs(5)));
    }

    #[test]
    fn failures_classify_api_errors() {
        assert_eq!(
            Failure::from_error(&ApiError::Authentication("no".to_string())),
            Failure::Unauthorized
        );
        assert_eq!(Failure::from_error(&ApiError::Status(420)), Failure::RateLimited);
        assert_eq!(Failure::from_error(&ApiError::Status(503)), Failure::Http);
    }

    #[tokio::test]
    async fn filter_forwards_only_direct_messages_in_order() {
        let (tx, rx) = mpsc::channel(8);
        let source = vec![
            StreamEvent::from_value(json!({"friends": [1]})),
            StreamEvent::from_value(dm_json(1, "first")),
            StreamEvent::from_value(json!({"event": "follow"})),
            StreamEvent::from_value(dm_json(2, "second")),
            StreamEvent::from_value(json!({"text": "tweet", "user": {}})),
        ];
        for event in source {
            tx.send(event).await.expect("send");
        }
        drop(tx);

        let (mut dms, handle) = filter_direct_messages(rx);
        let mut received = Vec::new();
        while let Some(dm) = dms.recv().await {
            received.push(StreamEvent::DirectMessage(dm));
        }
        handle.await.expect("filter task");

        assert_eq!(dm_texts(received), vec!["first".to_string(), "second".to_string()]);
    }

    #[tokio::test]
    async fn filter_stops_when_consumer_goes_away() {
        let (tx, rx) = mpsc::channel(8);
        let (dms, handle) = filter_direct_messages(rx);
        drop(dms);
        tx.send(StreamEvent::from_value(dm_json(1, "late"))).await.expect("send");
        handle.await.expect("filter task");
    }
}
