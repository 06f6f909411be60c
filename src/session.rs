use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::{ApiClient, ApiError, DirectMessage, DmApi, DmParams, User};
use crate::config::Config;
use crate::output;
use crate::realtime::{self, UserStream};
use crate::state::{ConversationIndex, Direction};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("no open stream")]
    NoOpenStream,
    #[error("stream events are already being consumed")]
    StreamConsumed,
}

/// The authenticated account: API client, conversation index and, once
/// opened, the live stream with its consumer task.
pub struct Session {
    api: ApiClient,
    user: User,
    index: Arc<ConversationIndex>,
    stream: Option<UserStream>,
    consumer: Option<Consumer>,
}

struct Consumer {
    filter: JoinHandle<()>,
    task: JoinHandle<()>,
    finished: CancellationToken,
}

impl Session {
    /// Builds the client and verifies the credentials. Rejected credentials
    /// surface as [`ApiError::Authentication`].
    pub async fn connect(config: &Config) -> Result<Self, SessionError> {
        let missing = config.credentials.missing();
        if !missing.is_empty() {
            warn!(?missing, "credentials are incomplete");
        }

        let api = ApiClient::new(&config.api_base_url, &config.stream_url, config.credentials.clone())?;
        let user = api.verify_credentials().await?;
        info!(user = %user.screen_name, id = user.id, "authenticated");
        Ok(Self::from_parts(api, user))
    }

    fn from_parts(api: ApiClient, user: User) -> Self {
        let index = Arc::new(ConversationIndex::new(user.clone()));
        Self {
            api,
            user,
            index,
            stream: None,
            consumer: None,
        }
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn index(&self) -> &Arc<ConversationIndex> {
        &self.index
    }

    pub async fn bootstrap(&self, count: u32) -> usize {
        bootstrap(&self.api, &self.index, count).await
    }

    pub fn open_stream(&mut self) {
        if self.stream.is_none() {
            self.stream = Some(self.api.open_stream());
        }
    }

    /// Typed direct-message channel fed by the open stream, plus the filter task.
    pub fn dm_stream(&mut self) -> Result<(mpsc::Receiver<DirectMessage>, JoinHandle<()>), SessionError> {
        let stream = self.stream.as_mut().ok_or(SessionError::NoOpenStream)?;
        let events = stream.take_events().ok_or(SessionError::StreamConsumed)?;
        Ok(realtime::filter_direct_messages(events))
    }

    /// Starts the background task that adds each streamed message to the
    /// index and re-renders the report.
    pub fn start_consumer(&mut self) -> Result<(), SessionError> {
        let (dms, filter) = self.dm_stream()?;
        let finished = CancellationToken::new();
        let task = spawn_consumer(Arc::clone(&self.index), dms, finished.clone());
        self.consumer = Some(Consumer { filter, task, finished });
        Ok(())
    }

    /// Resolves once the consumer has stopped, i.e. the stream will deliver
    /// nothing more. Never resolves without a running consumer. The future
    /// does not borrow the session, so it can be moved into another task.
    pub fn stream_ended(&self) -> BoxFuture<'static, ()> {
        let finished = self.consumer.as_ref().map(|consumer| consumer.finished.clone());
        async move {
            match finished {
                Some(finished) => finished.cancelled().await,
                None => std::future::pending().await,
            }
        }
        .boxed()
    }

    /// Stops the stream and joins the filter and consumer tasks.
    pub async fn close_stream(&mut self) -> Result<(), SessionError> {
        let stream = self.stream.take().ok_or(SessionError::NoOpenStream)?;
        stream.close().await;

        if let Some(consumer) = self.consumer.take() {
            if let Err(error) = consumer.filter.await {
                warn!(%error, "stream filter ended abnormally");
            }
            if let Err(error) = consumer.task.await {
                warn!(%error, "stream consumer ended abnormally");
            }
        }
        info!("user stream closed");
        Ok(())
    }
}

/// Feeds up to `count` received and `count` sent messages into `index`.
/// Fetch failures are logged; whatever was fetched is kept.
pub async fn bootstrap(api: &dyn DmApi, index: &ConversationIndex, count: u32) -> usize {
    let params = DmParams::with_count(count);
    let mut added = 0;

    match api.fetch_received(params).await {
        Ok(messages) => {
            for dm in messages {
                index.add_message(dm).await;
                added += 1;
            }
        }
        Err(error) => warn!(%error, "failed fetching received messages"),
    }

    match api.fetch_sent(params).await {
        Ok(messages) => {
            for dm in messages {
                index.add_message(dm).await;
                added += 1;
            }
        }
        Err(error) => warn!(%error, "failed fetching sent messages"),
    }

    added
}

/// Cancels `finished` when the DM channel closes.
pub fn spawn_consumer(
    index: Arc<ConversationIndex>,
    mut dms: mpsc::Receiver<DirectMessage>,
    finished: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let _finished = finished.drop_guard();
        while let Some(dm) = dms.recv().await {
            let id = dm.id;
            let (sender_id, recipient_id) = (dm.sender_id, dm.recipient_id);
            let direction = index.add_message(dm).await;
            let counterpart_id = match direction {
                Direction::Sent => recipient_id,
                Direction::Received => sender_id,
            };
            match index.conversation(counterpart_id).await {
                Some(chat) => info!(
                    id,
                    ?direction,
                    chatter = %chat.screen_name,
                    sent = chat.sent.len(),
                    received = chat.received.len(),
                    "direct message"
                ),
                None => info!(id, ?direction, "direct message"),
            }
            output::render(&index).await;
        }
    })
}
