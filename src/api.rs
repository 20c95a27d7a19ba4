use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::message::Message;
use crate::session::{DeviceCredentials, SessionError};
use crate::sync::MessageStore;

const ERROR_BODY_SNIPPET_LEN: usize = 220;
/// Operating system code sent on registration; `O` marks an open client.
const DEVICE_OS: &str = "O";
pub const API_BASE_URL: &str = "https://api.pushover.net";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ApiDefaults;

impl ApiDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
}

#[derive(Clone, Debug)]
pub struct ApiClientOptions {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Ignore `HTTP_PROXY`/`HTTPS_PROXY` and connect directly.
    pub no_proxy: bool,
}

impl Default for ApiClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: ApiDefaults::CONNECT_TIMEOUT,
            request_timeout: ApiDefaults::REQUEST_TIMEOUT,
            no_proxy: false,
        }
    }
}

/// Result of a successful interactive login.
#[derive(Clone, Debug)]
pub struct LoginGrant {
    pub user_id: String,
    pub secret: SecretString,
}

#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    request_timeout: Duration,
}

impl ApiClient {
    pub fn new() -> Result<Self, ApiError> {
        Self::with_options(ApiClientOptions::default())
    }

    pub fn with_options(options: ApiClientOptions) -> Result<Self, ApiError> {
        let mut builder = Client::builder().connect_timeout(options.connect_timeout);
        if options.no_proxy {
            builder = builder.no_proxy();
        }
        let http = builder.build().map_err(ApiError::transport)?;

        Ok(Self {
            http,
            base_url: API_BASE_URL.to_string(),
            request_timeout: options.request_timeout,
        })
    }

    /// Points the client at another API host, e.g. a local mock.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Exchanges account credentials for a user id and secret.
    pub async fn login(
        &self,
        email: &str,
        password: &SecretString,
    ) -> Result<LoginGrant, ApiError> {
        let request = self
            .http
            .post(self.endpoint("/1/users/login.json"))
            .form(&[("email", email), ("password", password.expose_secret().as_str())]);
        let reply: LoginReply = self.send(request).await?;

        if reply.status != 1 {
            return Err(ApiError::rejected(&reply.errors));
        }

        debug!(event = "login_succeeded", user_id = %reply.id);
        Ok(LoginGrant {
            user_id: reply.id,
            secret: SecretString::new(reply.secret),
        })
    }

    /// Registers a named device for the logged-in user and returns its id.
    pub async fn register_device(
        &self,
        secret: &SecretString,
        name: &str,
    ) -> Result<String, ApiError> {
        let request = self.http.post(self.endpoint("/1/devices.json")).form(&[
            ("secret", secret.expose_secret().as_str()),
            ("name", name),
            ("os", DEVICE_OS),
        ]);
        let reply: DeviceReply = self.send(request).await?;

        if reply.status != 1 {
            return Err(ApiError::rejected(&reply.errors));
        }

        debug!(event = "device_registered", device_id = %reply.id);
        Ok(reply.id)
    }

    /// Downloads every pending message for the device.
    ///
    /// A failure status still hands back whatever messages the reply
    /// carried, through [`FetchError::messages`].
    pub async fn fetch_messages(
        &self,
        device: &DeviceCredentials,
    ) -> Result<Vec<Message>, FetchError> {
        let request = self
            .http
            .get(self.endpoint("/1/messages.json"))
            .query(&[
                ("secret", device.secret.expose_secret().as_str()),
                ("device_id", device.device_id.as_str()),
            ]);
        let reply: MessagesReply = self.send(request).await.map_err(FetchError::from)?;

        let mut messages = reply.messages;
        for message in &mut messages {
            message.resolve_date();
        }

        if reply.status != 1 {
            return Err(FetchError {
                messages,
                error: ApiError::rejected(&reply.errors),
            });
        }

        debug!(event = "messages_fetched", count = messages.len());
        Ok(messages)
    }

    /// Deletes every message with a relative id at or below `highest_id`.
    pub async fn acknowledge(
        &self,
        device: &DeviceCredentials,
        highest_id: u64,
    ) -> Result<(), ApiError> {
        let path = format!(
            "/1/devices/{}/update_highest_message.json",
            device.device_id
        );
        let highest = highest_id.to_string();
        let request = self.http.post(self.endpoint(&path)).form(&[
            ("secret", device.secret.expose_secret().as_str()),
            ("message", highest.as_str()),
        ]);
        let reply: StatusReply = self.send(request).await?;

        if reply.status != 1 {
            return Err(ApiError::rejected(&reply.errors));
        }

        debug!(event = "messages_acknowledged", highest_id);
        Ok(())
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ApiError> {
        let response = request
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(ApiError::transport)?;
        let status = response.status();
        let body = response.text().await.map_err(ApiError::transport)?;

        // Failure replies usually still carry the JSON envelope with the
        // service's own error list, so decode before looking at the status.
        match serde_json::from_str::<T>(&body) {
            Ok(reply) => Ok(reply),
            Err(_) if !status.is_success() => Err(ApiError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            }),
            Err(err) => Err(ApiError::Parse(err.to_string())),
        }
    }
}

#[async_trait]
impl MessageStore for ApiClient {
    async fn fetch_messages(
        &self,
        device: &DeviceCredentials,
    ) -> Result<Vec<Message>, FetchError> {
        ApiClient::fetch_messages(self, device).await
    }

    async fn acknowledge(
        &self,
        device: &DeviceCredentials,
        highest_id: u64,
    ) -> Result<(), ApiError> {
        ApiClient::acknowledge(self, device, highest_id).await
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("rejected by service: {detail}")]
    Rejected { detail: String },

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl ApiError {
    // Query strings carry the secret, so URLs never end up in error text.
    fn transport(err: reqwest::Error) -> Self {
        Self::Transport(err.without_url())
    }

    fn rejected(errors: &Value) -> Self {
        Self::Rejected {
            detail: describe_errors(errors),
        }
    }
}

/// Fetch failure that keeps any messages parsed before the failure.
#[derive(Debug, Error)]
#[error("fetching messages failed: {error}")]
pub struct FetchError {
    pub messages: Vec<Message>,
    #[source]
    pub error: ApiError,
}

impl From<ApiError> for FetchError {
    fn from(error: ApiError) -> Self {
        Self {
            messages: Vec::new(),
            error,
        }
    }
}

impl From<SessionError> for FetchError {
    fn from(error: SessionError) -> Self {
        ApiError::Session(error).into()
    }
}

#[derive(Debug, Deserialize)]
struct LoginReply {
    status: i64,
    #[serde(default)]
    id: String,
    #[serde(default)]
    secret: String,
    #[serde(default)]
    errors: Value,
}

#[derive(Debug, Deserialize)]
struct DeviceReply {
    status: i64,
    #[serde(default)]
    id: String,
    #[serde(default)]
    errors: Value,
}

#[derive(Debug, Deserialize)]
struct MessagesReply {
    status: i64,
    #[serde(default)]
    messages: Vec<Message>,
    #[serde(default)]
    errors: Value,
}

#[derive(Debug, Deserialize)]
struct StatusReply {
    status: i64,
    #[serde(default)]
    errors: Value,
}

/// Flattens the service's error list into one line.
///
/// Most endpoints send a list of strings; device registration sends a map
/// of field name to messages.
fn describe_errors(errors: &Value) -> String {
    let mut parts = Vec::new();
    match errors {
        Value::Array(items) => {
            parts.extend(items.iter().map(value_text));
        }
        Value::Object(fields) => {
            for (field, messages) in fields {
                match messages {
                    Value::Array(items) => {
                        parts.extend(
                            items
                                .iter()
                                .map(|msg| format!("{field} {}", value_text(msg))),
                        );
                    }
                    other => parts.push(format!("{field} {}", value_text(other))),
                }
            }
        }
        Value::Null => {}
        other => parts.push(value_text(other)),
    }

    if parts.is_empty() {
        return "unknown failure".to_string();
    }
    parts.join(", ")
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        errors: Value,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if !parsed.errors.is_null() {
            return describe_errors(&parsed.errors);
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}
