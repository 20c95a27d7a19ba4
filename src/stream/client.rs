//! Notification socket controller.
//!
//! [`NotificationStream`] owns one websocket at a time. It logs in, reads
//! frames until something terminal happens, runs a message sync for every
//! `!` frame and reconnects in a loop on `R` frames. Lifecycle changes are
//! published on a `watch` channel as [`StreamState`] values.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::message::Message;
use crate::retry::{retry_async, ReconnectPolicy};
use crate::session::{DeviceCredentials, SessionError};
use crate::stream::proto::{interpret, login_line, FrameAction};
use crate::sync::{MessageSync, SyncError};

/// Production websocket endpoint for notifications.
pub const NOTIFICATION_ENDPOINT: &str = "wss://client.pushover.net/push";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamDefaults;

impl StreamDefaults {
    /// The service sends keep-alives well within this window.
    pub const READ_TIMEOUT: Duration = Duration::from_secs(60);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
}

#[derive(Clone, Debug)]
pub struct StreamOptions {
    pub endpoint: String,
    /// Silence longer than this counts as a dead connection. `None` waits
    /// forever.
    pub read_timeout: Option<Duration>,
    pub connect_timeout: Duration,
    /// Applied to reconnects after a reload request. The initial connect is
    /// always a single attempt.
    pub reconnect: ReconnectPolicy,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            endpoint: NOTIFICATION_ENDPOINT.to_string(),
            read_timeout: Some(StreamDefaults::READ_TIMEOUT),
            connect_timeout: StreamDefaults::CONNECT_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl StreamOptions {
    /// Sets an explicit websocket endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end().to_string();
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Option<Duration>) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn with_reconnect_policy(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }
}

/// Lifecycle of the notification stream.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamState {
    Idle,
    Connecting,
    /// Connected; the login line is being written.
    Authenticating,
    Listening,
    Reconnecting,
    /// Final. Start the stream again to leave this state.
    Terminated(TerminationReason),
}

/// Coarse classification of why a stream ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TerminationReason {
    NotAuthenticated,
    NotRegistered,
    AlreadyListening,
    Connect,
    Transport,
    Protocol,
    Permanent,
    Sync,
}

/// Terminal outcome of a notification stream.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("a notification stream is already running for this client")]
    AlreadyListening,

    #[error("websocket connect failed: {0}")]
    Connect(#[source] WsError),

    #[error("websocket connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("sending login line failed: {0}")]
    Login(#[source] WsError),

    #[error("websocket read failed: {0}")]
    Transport(#[source] WsError),

    #[error("no frame received for {0:?}")]
    InactivityTimeout(Duration),

    #[error("connection closed by server")]
    ConnectionClosed,

    #[error("connection closed by client")]
    Closed,

    #[error("unrecognized frame payload {0:?}")]
    Protocol(Vec<u8>),

    #[error("service reported a permanent error; log in again or re-enable the device")]
    Permanent,

    #[error("message sync failed: {0}")]
    Sync(#[from] SyncError),
}

impl StreamError {
    pub fn reason(&self) -> TerminationReason {
        match self {
            Self::Session(SessionError::NotRegistered) => TerminationReason::NotRegistered,
            Self::Session(_) => TerminationReason::NotAuthenticated,
            Self::AlreadyListening => TerminationReason::AlreadyListening,
            Self::Connect(_) | Self::ConnectTimeout(_) | Self::Login(_) => {
                TerminationReason::Connect
            }
            Self::Transport(_)
            | Self::InactivityTimeout(_)
            | Self::ConnectionClosed
            | Self::Closed => TerminationReason::Transport,
            Self::Protocol(_) => TerminationReason::Protocol,
            Self::Permanent => TerminationReason::Permanent,
            Self::Sync(_) => TerminationReason::Sync,
        }
    }

    /// Network-level failures, including a local [`close`](crate::client::Client::close).
    pub fn is_transport(&self) -> bool {
        matches!(
            self.reason(),
            TerminationReason::Connect | TerminationReason::Transport
        )
    }

    /// Whether starting the stream again may help without new credentials.
    ///
    /// Permanent service errors need a fresh login or device registration;
    /// protocol and precondition errors will not go away on their own.
    pub fn is_retryable(&self) -> bool {
        self.is_transport() || matches!(self, Self::Sync(_))
    }

    fn is_connect_failure(&self) -> bool {
        matches!(
            self,
            Self::Connect(_) | Self::ConnectTimeout(_) | Self::Login(_)
        )
    }
}

/// Drives one notification stream until it terminates.
pub struct NotificationStream {
    options: StreamOptions,
    device: DeviceCredentials,
    sync: MessageSync,
    deliveries: mpsc::Sender<Message>,
    state: Arc<watch::Sender<StreamState>>,
    cancel: CancellationToken,
}

impl NotificationStream {
    pub fn new(
        options: StreamOptions,
        device: DeviceCredentials,
        sync: MessageSync,
        deliveries: mpsc::Sender<Message>,
        state: Arc<watch::Sender<StreamState>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            options,
            device,
            sync,
            deliveries,
            state,
            cancel,
        }
    }

    /// Runs until a terminal condition and returns it.
    pub async fn run(self) -> StreamError {
        let error = self.run_until_terminated().await;
        let reason = error.reason();
        if matches!(error, StreamError::Closed) {
            info!(event = "stream_closed");
        } else {
            warn!(event = "stream_terminated", ?reason, error = %error);
        }
        self.set_state(StreamState::Terminated(reason));
        error
    }

    async fn run_until_terminated(&self) -> StreamError {
        let mut socket = match self.open(&ReconnectPolicy::single_attempt()).await {
            Ok(socket) => socket,
            Err(err) => return err,
        };

        loop {
            let outcome = self.read_until_reload(&mut socket).await;
            close_socket(&mut socket, self.options.connect_timeout).await;
            if let Err(err) = outcome {
                return err;
            }

            self.set_state(StreamState::Reconnecting);
            socket = match self.open(&self.options.reconnect).await {
                Ok(socket) => socket,
                Err(err) => return err,
            };
        }
    }

    async fn open(&self, policy: &ReconnectPolicy) -> Result<WsStream, StreamError> {
        let max_attempts = policy.max_attempts.max(1);
        let attempts = retry_async(
            policy,
            move |attempt| async move {
                let result = self.connect_and_login(attempt).await;
                if result.is_err() && attempt < max_attempts {
                    // Backing off before the next attempt.
                    self.set_state(StreamState::Reconnecting);
                }
                result
            },
            StreamError::is_connect_failure,
        );

        tokio::select! {
            _ = self.cancel.cancelled() => Err(StreamError::Closed),
            result = attempts => result,
        }
    }

    async fn connect_and_login(&self, attempt: usize) -> Result<WsStream, StreamError> {
        self.set_state(StreamState::Connecting);
        debug!(event = "stream_connecting", endpoint = %self.options.endpoint, attempt);

        let connect = connect_async(self.options.endpoint.as_str());
        let (mut socket, _) = tokio::time::timeout(self.options.connect_timeout, connect)
            .await
            .map_err(|_| StreamError::ConnectTimeout(self.options.connect_timeout))?
            .map_err(StreamError::Connect)?;

        self.set_state(StreamState::Authenticating);
        socket
            .send(WsMessage::Text(login_line(&self.device)))
            .await
            .map_err(StreamError::Login)?;

        self.set_state(StreamState::Listening);
        info!(event = "stream_listening", device_id = %self.device.device_id, attempt);
        Ok(socket)
    }

    /// Processes frames in arrival order. Returns `Ok(())` when the server
    /// asks for a reload.
    async fn read_until_reload(&self, socket: &mut WsStream) -> Result<(), StreamError> {
        loop {
            let message = tokio::select! {
                _ = self.cancel.cancelled() => return Err(StreamError::Closed),
                next = self.next_frame(socket) => next?,
            };

            match interpret(&message) {
                FrameAction::Ignore => trace!(event = "frame_ignored"),
                FrameAction::KeepAlive => trace!(event = "keep_alive"),
                FrameAction::Sync => {
                    // A full queue parks us here until the consumer drains it.
                    let delivered = tokio::select! {
                        _ = self.cancel.cancelled() => return Err(StreamError::Closed),
                        result = self.sync.deliver(&self.deliveries) => result?,
                    };
                    debug!(event = "new_messages_delivered", delivered);
                }
                FrameAction::Reconnect => {
                    info!(event = "reload_requested");
                    return Ok(());
                }
                FrameAction::PermanentError => return Err(StreamError::Permanent),
                FrameAction::ProtocolViolation(payload) => {
                    return Err(StreamError::Protocol(payload))
                }
            }
        }
    }

    async fn next_frame(&self, socket: &mut WsStream) -> Result<WsMessage, StreamError> {
        let next = match self.options.read_timeout {
            Some(limit) => tokio::time::timeout(limit, socket.next())
                .await
                .map_err(|_| StreamError::InactivityTimeout(limit))?,
            None => socket.next().await,
        };

        match next {
            Some(Ok(message)) => Ok(message),
            Some(Err(err)) => Err(StreamError::Transport(err)),
            None => Err(StreamError::ConnectionClosed),
        }
    }

    fn set_state(&self, state: StreamState) {
        trace!(event = "stream_state", ?state);
        self.state.send_replace(state);
    }
}

/// Sends a close frame, giving up after `limit` if the peer stopped reading.
async fn close_socket<S>(socket: &mut WebSocketStream<S>, limit: Duration)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if tokio::time::timeout(limit, socket.close(None)).await.is_err() {
        debug!(
            event = "socket_close_timed_out",
            timeout_ms = limit.as_millis() as u64
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::WebSocketStream;

    use super::{
        close_socket, StreamError, StreamOptions, StreamState, TerminationReason,
        NOTIFICATION_ENDPOINT,
    };
    use crate::session::SessionError;
    use crate::sync::SyncError;

    #[test]
    fn stream_uses_production_endpoint_by_default() {
        let options = StreamOptions::default();
        assert_eq!(options.endpoint, NOTIFICATION_ENDPOINT);
        assert_eq!(options.read_timeout, Some(Duration::from_secs(60)));
    }

    #[test]
    fn endpoint_override_is_trimmed() {
        let options = StreamOptions::default().with_endpoint("ws://127.0.0.1:9000/push  \n");
        assert_eq!(options.endpoint, "ws://127.0.0.1:9000/push");
    }

    #[test]
    fn errors_classify_into_reasons() {
        assert_eq!(
            StreamError::Session(SessionError::NotRegistered).reason(),
            TerminationReason::NotRegistered
        );
        assert_eq!(
            StreamError::Session(SessionError::NotAuthenticated).reason(),
            TerminationReason::NotAuthenticated
        );
        assert_eq!(StreamError::Permanent.reason(), TerminationReason::Permanent);
        assert_eq!(
            StreamError::Protocol(b"X".to_vec()).reason(),
            TerminationReason::Protocol
        );
        assert_eq!(StreamError::Closed.reason(), TerminationReason::Transport);
        assert_eq!(
            StreamError::InactivityTimeout(Duration::from_secs(60)).reason(),
            TerminationReason::Transport
        );
        assert_eq!(
            StreamError::ConnectTimeout(Duration::from_secs(1)).reason(),
            TerminationReason::Connect
        );
    }

    #[test]
    fn permanent_and_protocol_errors_are_not_retryable() {
        assert!(!StreamError::Permanent.is_retryable());
        assert!(!StreamError::Protocol(Vec::new()).is_retryable());
        assert!(!StreamError::Session(SessionError::NotAuthenticated).is_retryable());
        assert!(StreamError::ConnectionClosed.is_retryable());
        assert!(StreamError::Sync(SyncError::QueueClosed).is_retryable());
        assert!(StreamError::Closed.is_transport());
        assert!(!StreamError::Permanent.is_transport());
    }

    #[test]
    fn terminated_state_carries_reason() {
        let state = StreamState::Terminated(StreamError::Permanent.reason());
        assert_eq!(state, StreamState::Terminated(TerminationReason::Permanent));
        assert_ne!(state, StreamState::Idle);
    }

    #[tokio::test]
    async fn close_gives_up_when_peer_stops_reading() {
        // A one-byte pipe nobody drains: the close frame can never be flushed.
        let (client_io, server_io) = tokio::io::duplex(1);
        let mut socket = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;

        tokio::time::timeout(
            Duration::from_secs(2),
            close_socket(&mut socket, Duration::from_millis(50)),
        )
        .await
        .expect("close should stop waiting after its limit");
        drop(server_io);
    }
}
