//! MTProto ingress with automatic reconnection.
//!
//! Connects to Telegram as the receiving account, watches for new incoming
//! messages, and turns every message that carries a video (or a generic
//! document) into an [`IncomingVideo`] whose content is downloaded lazily
//! while it is being uploaded.

use crate::config::TelegramConfig;
use crate::error::{IntakeError, Result};
use crate::health::ServiceHealth;
use crate::transfer::VideoStream;
use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use grammers_client::types::{Chat, Downloadable, Media, Message};
use grammers_client::{Client, Config as ClientConfig, InitParams, Update};
use grammers_mtsender::InvocationError;
use grammers_session::Session;
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// State of the MTProto connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// The account the session is signed in as
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionIdentity {
    pub name: String,
    pub username: Option<String>,
    pub phone: Option<String>,
}

/// Point-in-time view of the session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    pub identity: Option<SessionIdentity>,
    pub last_error: Option<String>,
    pub reconnect_count: u32,
    pub connected_since: Option<DateTime<Utc>>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            identity: None,
            last_error: None,
            reconnect_count: 0,
            connected_since: None,
        }
    }
}

/// Live session state shared between the ingress loop and the API
#[derive(Debug, Clone, Default)]
pub struct SessionStatus {
    inner: Arc<RwLock<SessionSnapshot>>,
}

impl SessionStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.read().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.read().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn set_state(&self, state: ConnectionState) {
        let mut inner = self.inner.write();
        if state != ConnectionState::Connected {
            inner.connected_since = None;
        }
        if state == ConnectionState::Reconnecting {
            inner.reconnect_count += 1;
        }
        inner.state = state;
    }

    pub fn set_connected(&self, identity: SessionIdentity) {
        let mut inner = self.inner.write();
        inner.state = ConnectionState::Connected;
        inner.identity = Some(identity);
        inner.connected_since = Some(Utc::now());
    }

    pub fn record_error(&self, error: impl fmt::Display) {
        self.inner.write().last_error = Some(error.to_string());
    }

    /// Health probe: healthy only while connected
    pub fn check(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Connected => Ok(()),
            state => Err(IntakeError::Connection(format!("session is {}", state))),
        }
    }
}

/// Kind of media attached to a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    None,
    Document,
    Other,
}

/// The parts of a message that decide whether it is a submission
#[derive(Debug, Clone, PartialEq)]
pub struct MessageFacts {
    pub message_id: i32,
    pub media: MediaKind,
    pub document_id: Option<i64>,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub size: Option<i64>,
}

/// File descriptor of an accepted message
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFile {
    pub telegram_file_id: String,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub size: Option<i64>,
}

/// Decide whether a message is a video submission.
///
/// Documents whose MIME type mentions `video` or `application` are accepted.
pub fn classify(facts: &MessageFacts) -> Result<VideoFile> {
    match facts.media {
        MediaKind::None => Err(IntakeError::NoContent("message has no media".to_string())),
        MediaKind::Other => Err(IntakeError::NoContent(
            "media is not a document".to_string(),
        )),
        MediaKind::Document => {
            let mime = facts.mime_type.as_deref().unwrap_or_default().to_ascii_lowercase();
            if !mime.contains("video") && !mime.contains("application") {
                return Err(IntakeError::NoContent(format!(
                    "unsupported document type: {}",
                    if mime.is_empty() { "unknown" } else { &mime }
                )));
            }

            let telegram_file_id = match facts.document_id {
                Some(id) => id.to_string(),
                None => format!("msg_{}", facts.message_id),
            };

            Ok(VideoFile {
                telegram_file_id,
                file_name: facts.file_name.clone().filter(|n| !n.is_empty()),
                mime_type: facts.mime_type.clone(),
                size: facts.size.filter(|s| *s > 0),
            })
        }
    }
}

/// Metadata of an accepted message
#[derive(Debug, Clone, PartialEq)]
pub struct VideoMessage {
    pub sender_id: i64,
    pub sender_name: Option<String>,
    pub sender_username: Option<String>,
    pub sender_phone: Option<String>,
    pub chat_id: i64,
    pub chat_title: Option<String>,
    pub message_id: i32,
    pub date: DateTime<Utc>,
    pub telegram_file_id: String,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub declared_size: Option<i64>,
}

/// An accepted message plus its content
pub struct IncomingVideo {
    pub message: VideoMessage,
    pub content: VideoStream,
}

impl fmt::Debug for IncomingVideo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingVideo")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// Receives accepted videos from the ingress loop
#[async_trait]
pub trait VideoHandler: Send + Sync {
    /// Take ownership of a video; may wait for capacity
    async fn accept(&self, video: IncomingVideo);
}

/// Connected MTProto client for the receiving account
pub struct MtProtoSession {
    client: Client,
    config: TelegramConfig,
    status: SessionStatus,
    health: Arc<ServiceHealth>,
}

impl MtProtoSession {
    /// Load the session file, connect and check authorization.
    ///
    /// Transport failures are retried with backoff; an unauthorized session
    /// fails at once. Returns `None` when shutdown arrives first.
    pub async fn connect(
        config: &TelegramConfig,
        status: SessionStatus,
        health: Arc<ServiceHealth>,
        shutdown: &CancellationToken,
    ) -> Result<Option<Self>> {
        status.set_state(ConnectionState::Connecting);

        let client =
            connect_with_backoff(config, &status, &health, shutdown, || open_client(config))
                .await?;

        Ok(client.map(|client| Self {
            client,
            config: config.clone(),
            status,
            health,
        }))
    }

    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    /// Watch for incoming messages until shutdown or an unrecoverable error
    pub async fn run(
        mut self,
        handler: Arc<dyn VideoHandler>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        info!("Listening for incoming videos");

        loop {
            let polled = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    self.save_session();
                    self.status.set_state(ConnectionState::Disconnected);
                    info!("Ingress stopped");
                    return Ok(());
                }
                polled = self.client.next_update() => polled,
            };

            match update_step(polled) {
                UpdateStep::Update(Update::NewMessage(message)) if !message.outgoing() => {
                    self.handle_message(message, handler.as_ref()).await;
                }
                UpdateStep::Update(_) => {}
                UpdateStep::Disconnected(e) => {
                    warn!(error = %e, "Lost connection to Telegram");
                    self.status.record_error(&e);
                    self.health.record_failure(&e);
                    self.reconnect(&shutdown).await?;
                }
            }
        }
    }

    #[instrument(skip(self, message, handler), fields(message_id = message.id()))]
    async fn handle_message(&self, message: Message, handler: &dyn VideoHandler) {
        let facts = message_facts(&message);
        let file = match classify(&facts) {
            Ok(file) => file,
            Err(e) => {
                debug!(reason = %e, "Skipping message");
                return;
            }
        };
        let Some(media) = message.media() else {
            return;
        };

        let chat = message.chat();
        let sender = message.sender();
        let (sender_id, sender_name, sender_username, sender_phone) = match &sender {
            Some(Chat::User(user)) => (
                user.id(),
                Some(user.full_name()).filter(|n| !n.trim().is_empty()),
                user.username().map(String::from),
                user.phone().map(String::from),
            ),
            Some(other) => (
                other.id(),
                Some(other.name().to_string()),
                other.username().map(String::from),
                None,
            ),
            None => (chat.id(), None, None, None),
        };

        info!(
            sender_id,
            telegram_file_id = %file.telegram_file_id,
            file_name = file.file_name.as_deref().unwrap_or("-"),
            size_bytes = file.size.unwrap_or(0),
            "Video message received"
        );
        metrics::counter!("intake.submissions.received").increment(1);

        let video = IncomingVideo {
            message: VideoMessage {
                sender_id,
                sender_name,
                sender_username,
                sender_phone,
                chat_id: chat.id(),
                chat_title: Some(chat.name().to_string()).filter(|n| !n.is_empty()),
                message_id: message.id(),
                date: message.date(),
                telegram_file_id: file.telegram_file_id,
                file_name: file.file_name,
                mime_type: file.mime_type,
                declared_size: file.size,
            },
            content: download_stream(&self.client, &media, self.config.download_chunk_size),
        };

        handler.accept(video).await;
    }

    /// Replace the client after a lost connection
    async fn reconnect(&mut self, shutdown: &CancellationToken) -> Result<()> {
        self.status.set_state(ConnectionState::Reconnecting);

        let config = &self.config;
        let client =
            connect_with_backoff(config, &self.status, &self.health, shutdown, || {
                open_client(config)
            })
            .await?;

        if let Some(client) = client {
            self.client = client;
        }
        Ok(())
    }

    fn save_session(&self) {
        if let Err(e) = save_session(&self.client, &self.config.session_path) {
            warn!(error = %e, "Failed to save session");
        }
    }
}

/// Outcome of one poll of the update stream
#[derive(Debug)]
enum UpdateStep<U> {
    Update(U),
    Disconnected(IntakeError),
}

/// `Ok(None)` from `next_update` is a graceful disconnect, not an idle tick
fn update_step<U>(polled: std::result::Result<Option<U>, InvocationError>) -> UpdateStep<U> {
    match polled {
        Ok(Some(update)) => UpdateStep::Update(update),
        Ok(None) => UpdateStep::Disconnected(IntakeError::Connection(
            "server closed the connection".to_string(),
        )),
        Err(e) => UpdateStep::Disconnected(invocation_error("update stream failed", e)),
    }
}

/// Open a client, retrying transport failures with exponential backoff.
///
/// Authentication failures and an exhausted attempt budget leave the status
/// `Failed`. Returns `None` if shutdown is requested while waiting.
async fn connect_with_backoff<T, F, Fut>(
    config: &TelegramConfig,
    status: &SessionStatus,
    health: &ServiceHealth,
    shutdown: &CancellationToken,
    mut open: F,
) -> Result<Option<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(T, SessionIdentity)>>,
{
    let mut backoff = ExponentialBackoff {
        initial_interval: config.reconnect_base_delay(),
        max_interval: config.reconnect_max_delay(),
        max_elapsed_time: None,
        ..Default::default()
    };

    let mut attempts = 0u32;
    let max_attempts = config.max_reconnect_attempts;

    loop {
        if shutdown.is_cancelled() {
            return Ok(None);
        }

        match open().await {
            Ok((client, identity)) => {
                info!(account = %identity.name, attempts, "Connected to Telegram");
                status.set_connected(identity);
                return Ok(Some(client));
            }
            Err(e @ IntakeError::Authentication(_)) => {
                error!(error = %e, "Session is not authorized");
                status.record_error(&e);
                status.set_state(ConnectionState::Failed);
                health.record_failure(&e);
                return Err(e);
            }
            Err(e) => {
                attempts += 1;
                status.record_error(&e);
                health.record_failure(&e);

                if max_attempts > 0 && attempts >= max_attempts {
                    status.set_state(ConnectionState::Failed);
                    error!(attempts, error = %e, "Max reconnection attempts exceeded");
                    return Err(IntakeError::Connection(format!(
                        "gave up after {} attempts: {}",
                        attempts, e
                    )));
                }
                status.set_state(ConnectionState::Reconnecting);

                let delay = match backoff.next_backoff() {
                    Some(delay) => delay,
                    None => {
                        backoff.reset();
                        config.reconnect_base_delay()
                    }
                };
                warn!(
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Connect failed, retrying"
                );
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(None),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Digits-only comparison, so `+1 (555) 010` matches `1555010`
fn same_phone(a: &str, b: &str) -> bool {
    let digits = |s: &str| s.chars().filter(|c| c.is_ascii_digit()).collect::<String>();
    digits(a) == digits(b)
}

fn message_facts(message: &Message) -> MessageFacts {
    let mut facts = MessageFacts {
        message_id: message.id(),
        media: MediaKind::None,
        document_id: None,
        file_name: None,
        mime_type: None,
        size: None,
    };

    match message.media() {
        Some(Media::Document(doc)) => {
            facts.media = MediaKind::Document;
            facts.document_id = Some(doc.id());
            facts.file_name = Some(doc.name().to_string());
            facts.mime_type = doc.mime_type().map(String::from);
            facts.size = Some(doc.size());
        }
        Some(_) => facts.media = MediaKind::Other,
        None => {}
    }
    facts
}

/// Content of `media`, fetched chunk by chunk as the consumer polls
fn download_stream(client: &Client, media: &Media, chunk_size: i32) -> VideoStream {
    let download = client
        .iter_download(&Downloadable::Media(media.clone()))
        .chunk_size(chunk_size);

    futures::stream::try_unfold(download, |mut download| async move {
        match download.next().await {
            Ok(Some(chunk)) => Ok(Some((Bytes::from(chunk), download))),
            Ok(None) => Ok(None),
            Err(e) => Err(invocation_error("download interrupted", e)),
        }
    })
    .boxed()
}

async fn open_client(config: &TelegramConfig) -> Result<(Client, SessionIdentity)> {
    let session = load_session(&config.session_path)?;

    let client = Client::connect(ClientConfig {
        session,
        api_id: config.api_id,
        api_hash: config.api_hash.clone(),
        params: InitParams {
            device_model: "Video Intake Service".to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            catch_up: false,
            ..Default::default()
        },
    })
    .await
    .map_err(|e| IntakeError::Connection(format!("failed to connect: {}", e)))?;

    let authorized = client
        .is_authorized()
        .await
        .map_err(|e| invocation_error("authorization check failed", e))?;

    if !authorized {
        let Some(token) = config.bot_sign_in_token.as_deref() else {
            return Err(IntakeError::Authentication(format!(
                "session {} is not signed in",
                config.session_path.display()
            )));
        };
        info!("Session not authorized, signing in as bot");
        client
            .bot_sign_in(token)
            .await
            .map_err(|e| IntakeError::Authentication(e.to_string()))?;
        save_session(&client, &config.session_path)
            .map_err(|e| IntakeError::Connection(format!("failed to save session: {}", e)))?;
    }

    let me = client
        .get_me()
        .await
        .map_err(|e| invocation_error("get_me failed", e))?;
    let identity = SessionIdentity {
        name: me.full_name(),
        username: me.username().map(String::from),
        phone: me.phone().map(String::from),
    };

    if let (Some(expected), Some(actual)) = (config.phone.as_deref(), identity.phone.as_deref()) {
        if !same_phone(expected, actual) {
            warn!(
                expected,
                actual,
                session = %config.session_path.display(),
                "Session is signed in as a different account than configured"
            );
        }
    }

    Ok((client, identity))
}

fn invocation_error(context: &str, err: InvocationError) -> IntakeError {
    match err {
        InvocationError::Rpc(rpc) if rpc.code == 401 => {
            IntakeError::Authentication(format!("{}: {}", context, rpc))
        }
        other => IntakeError::Connection(format!("{}: {}", context, other)),
    }
}

fn load_session(path: &Path) -> Result<Session> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| {
                IntakeError::Connection(format!("failed to create session directory: {}", e))
            })?;
        }
    }

    if path.exists() {
        debug!(path = %path.display(), "Loading session");
        Session::load_file(path)
            .map_err(|e| IntakeError::Authentication(format!("failed to load session: {}", e)))
    } else {
        debug!(path = %path.display(), "Creating new session");
        Ok(Session::new())
    }
}

fn save_session(client: &Client, path: &Path) -> std::io::Result<()> {
    // save_to_file writes into an existing file
    if !path.exists() {
        std::fs::File::create(path)?;
    }
    client.session().save_to_file(path)
}
