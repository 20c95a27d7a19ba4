//! Consumer-facing client.
//!
//! [`Client`] bundles the session, the HTTP API, the bounded delivery queue
//! and the notification stream. Methods that change credentials take
//! `&mut self`; [`Client::listen`] takes `&self` and snapshots the session
//! when it starts, so credentials cannot change under a running stream.

use std::sync::{Arc, Mutex, PoisonError};

use secrecy::SecretString;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::{ApiClient, ApiClientOptions, ApiError, FetchError};
use crate::message::Message;
use crate::session::{validate_device_name, Session, SessionError};
use crate::stream::client::{NotificationStream, StreamError, StreamOptions, StreamState};
use crate::sync::{HighWaterMark, MessageStore, MessageSync};

/// Capacity of the delivery queue unless configured otherwise.
pub const DEFAULT_DELIVERY_CAPACITY: usize = 32;

#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub api: ApiClientOptions,
    pub stream: StreamOptions,
    /// Messages buffered for the consumer before the stream stalls.
    pub delivery_capacity: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            api: ApiClientOptions::default(),
            stream: StreamOptions::default(),
            delivery_capacity: DEFAULT_DELIVERY_CAPACITY,
        }
    }
}

/// Consumer end of the delivery queue.
///
/// Cloning shares the same queue; each message is handed out once.
#[derive(Clone, Debug)]
pub struct Deliveries {
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Message>>>,
}

impl Deliveries {
    /// Waits for the next delivered message.
    pub async fn recv(&self) -> Option<Message> {
        self.rx.lock().await.recv().await
    }

    /// Takes the next message if one is queued, without waiting.
    pub fn try_recv(&self) -> Option<Message> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }
}

pub struct Client {
    api: ApiClient,
    store: Arc<dyn MessageStore>,
    session: Session,
    acknowledged: HighWaterMark,
    stream_options: StreamOptions,
    delivery_tx: mpsc::Sender<Message>,
    deliveries: Deliveries,
    state: Arc<watch::Sender<StreamState>>,
    active: Mutex<Option<CancellationToken>>,
}

impl Client {
    pub fn new() -> Result<Self, ApiError> {
        Self::with_options(ClientOptions::default())
    }

    pub fn with_options(options: ClientOptions) -> Result<Self, ApiError> {
        let api = ApiClient::with_options(options.api.clone())?;
        Ok(Self::from_parts(api, options))
    }

    /// Builds a client around an existing API client.
    pub fn from_parts(api: ApiClient, options: ClientOptions) -> Self {
        let (delivery_tx, delivery_rx) = mpsc::channel(options.delivery_capacity.max(1));
        let (state, _) = watch::channel(StreamState::Idle);
        let store: Arc<dyn MessageStore> = Arc::new(api.clone());

        Self {
            api,
            store,
            session: Session::new(),
            acknowledged: HighWaterMark::new(),
            stream_options: options.stream,
            delivery_tx,
            deliveries: Deliveries {
                rx: Arc::new(tokio::sync::Mutex::new(delivery_rx)),
            },
            state: Arc::new(state),
            active: Mutex::new(None),
        }
    }

    /// Replaces the message store used for fetch and acknowledge.
    pub fn with_message_store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.store = store;
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn status(&self) -> (bool, bool) {
        self.session.status()
    }

    pub fn restore_login(&mut self, secret: SecretString, user_id: impl Into<String>) {
        self.session.restore_login(secret, user_id);
    }

    pub fn restore_device(&mut self, device_id: impl Into<String>) {
        self.session.restore_device(device_id);
        self.acknowledged = HighWaterMark::new();
    }

    /// Logs in interactively. Store [`Session::user`] afterwards to skip
    /// this step next time.
    pub async fn login(&mut self, email: &str, password: &SecretString) -> Result<(), ApiError> {
        if self.session.status().0 {
            return Err(SessionError::AlreadyAuthenticated.into());
        }

        let grant = self.api.login(email, password).await?;
        self.session.set_login(grant.user_id, grant.secret);
        self.acknowledged = HighWaterMark::new();
        info!(event = "logged_in");
        Ok(())
    }

    /// Registers this client as a device named `name` (at most 25
    /// characters). Store [`Session::device_id`] afterwards.
    pub async fn register_device(&mut self, name: &str) -> Result<(), ApiError> {
        let secret = self.session.require_login()?.clone();
        if self.session.status().1 {
            return Err(SessionError::AlreadyRegistered.into());
        }
        validate_device_name(name)?;

        let device_id = self.api.register_device(&secret, name).await?;
        self.session.set_device(device_id);
        self.acknowledged = HighWaterMark::new();
        info!(event = "device_registered", name);
        Ok(())
    }

    /// Downloads pending messages without acknowledging them.
    pub async fn fetch_messages(&self) -> Result<Vec<Message>, FetchError> {
        self.message_sync()?.fetch().await
    }

    /// Deletes, server-side, every message up to the highest relative id in
    /// `messages`. Returns the mark sent, or `None` if nothing new was
    /// acknowledged.
    pub async fn acknowledge_through(
        &self,
        messages: &[Message],
    ) -> Result<Option<u64>, ApiError> {
        self.message_sync()?.acknowledge_through(messages).await
    }

    /// Deletes, server-side, every message up to `highest_id`.
    pub async fn acknowledge_up_to(&self, highest_id: u64) -> Result<Option<u64>, ApiError> {
        self.message_sync()?.acknowledge_up_to(highest_id).await
    }

    /// Handle for draining messages delivered by the stream.
    pub fn deliveries(&self) -> Deliveries {
        self.deliveries.clone()
    }

    pub fn stream_state(&self) -> watch::Receiver<StreamState> {
        self.state.subscribe()
    }

    /// Streams notifications until a terminal condition and returns it.
    ///
    /// Every new-message frame fetches the pending batch, pushes it onto the
    /// delivery queue and then acknowledges it. When the queue is full the
    /// stream waits for the consumer. A reload request reconnects; anything
    /// else ends the stream and the caller decides whether to start again.
    pub async fn listen(&self) -> StreamError {
        let sync = match self.message_sync() {
            Ok(sync) => sync,
            Err(err) => return self.refuse(err.into()),
        };
        // The running stream keeps publishing its own state.
        let Some(cancel) = self.begin_stream() else {
            return StreamError::AlreadyListening;
        };

        let stream = NotificationStream::new(
            self.stream_options.clone(),
            sync.device().clone(),
            sync,
            self.delivery_tx.clone(),
            Arc::clone(&self.state),
            cancel.clone(),
        );
        let error = stream.run().await;
        self.end_stream(&cancel);
        error
    }

    /// Runs [`Client::listen`] on a background task.
    pub fn spawn_listener(self: &Arc<Self>) -> JoinHandle<StreamError> {
        let client = Arc::clone(self);
        tokio::spawn(async move { client.listen().await })
    }

    /// Closes the running stream, if any. Its pending read fails at once
    /// and [`Client::listen`] returns [`StreamError::Closed`].
    pub fn close(&self) {
        let active = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(cancel) = active {
            debug!(event = "stream_close_requested");
            cancel.cancel();
        }
    }

    fn message_sync(&self) -> Result<MessageSync, SessionError> {
        let device = self.session.device_credentials()?;
        Ok(MessageSync::new(
            Arc::clone(&self.store),
            device,
            self.acknowledged.clone(),
        ))
    }

    fn begin_stream(&self) -> Option<CancellationToken> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.is_some() {
            return None;
        }
        let cancel = CancellationToken::new();
        *active = Some(cancel.clone());
        Some(cancel)
    }

    fn end_stream(&self, cancel: &CancellationToken) {
        // A cancelled token was already taken by close(); the slot may belong
        // to a newer stream by now.
        if cancel.is_cancelled() {
            return;
        }
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn refuse(&self, error: StreamError) -> StreamError {
        self.state.send_replace(StreamState::Terminated(error.reason()));
        error
    }
}
