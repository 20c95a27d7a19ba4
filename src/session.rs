//! Login and device registration state.
//!
//! A [`Session`] is populated either by the interactive login/registration
//! calls on [`crate::client::Client`] or by restoring values saved from an
//! earlier run. Operations that talk to the message store take an owned
//! [`DeviceCredentials`] snapshot, so a running stream never observes later
//! mutations.

use secrecy::SecretString;
use thiserror::Error;

/// Longest device name accepted by the device registry.
pub const MAX_DEVICE_NAME_LEN: usize = 25;

/// Local precondition failures. These never reach the network.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SessionError {
    #[error("not logged in")]
    NotAuthenticated,

    #[error("device not registered")]
    NotRegistered,

    #[error("already logged in")]
    AlreadyAuthenticated,

    #[error("device already registered")]
    AlreadyRegistered,

    #[error("device name is {len} characters long, at most {max} allowed")]
    NameTooLong { len: usize, max: usize },
}

/// Authentication and registration state for one client.
#[derive(Debug, Default)]
pub struct Session {
    authenticated: bool,
    device_registered: bool,
    user_id: String,
    secret: Option<SecretString>,
    device_id: String,
}

/// Owned snapshot of everything needed to talk to the message store.
#[derive(Clone, Debug)]
pub struct DeviceCredentials {
    pub device_id: String,
    pub secret: SecretString,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores a previous login without contacting the service.
    pub fn restore_login(&mut self, secret: SecretString, user_id: impl Into<String>) {
        self.secret = Some(secret);
        self.user_id = user_id.into();
        self.authenticated = true;
    }

    /// Restores a previous device registration without contacting the
    /// service.
    pub fn restore_device(&mut self, device_id: impl Into<String>) {
        self.device_id = device_id.into();
        self.device_registered = true;
    }

    /// Returns `(authenticated, device_registered)`.
    pub fn status(&self) -> (bool, bool) {
        (self.authenticated, self.device_registered)
    }

    /// Returns the user id and secret, if logged in.
    pub fn user(&self) -> Option<(&str, &SecretString)> {
        if !self.authenticated {
            return None;
        }
        self.secret
            .as_ref()
            .map(|secret| (self.user_id.as_str(), secret))
    }

    /// Returns the registered device id, if any.
    pub fn device_id(&self) -> Option<&str> {
        self.device_registered.then_some(self.device_id.as_str())
    }

    /// Secret for calls that only need a login (device registration).
    pub fn require_login(&self) -> Result<&SecretString, SessionError> {
        if !self.authenticated {
            return Err(SessionError::NotAuthenticated);
        }
        self.secret.as_ref().ok_or(SessionError::NotAuthenticated)
    }

    /// Snapshot for calls that need both a login and a device.
    ///
    /// Both flags are checked on their own: a restored session may carry a
    /// device id without a login.
    pub fn device_credentials(&self) -> Result<DeviceCredentials, SessionError> {
        let secret = self.require_login()?.clone();
        if !self.device_registered {
            return Err(SessionError::NotRegistered);
        }
        Ok(DeviceCredentials {
            device_id: self.device_id.clone(),
            secret,
        })
    }

    /// Records a fresh interactive login. Any previous device registration
    /// belonged to the old login and is cleared.
    pub(crate) fn set_login(&mut self, user_id: String, secret: SecretString) {
        self.user_id = user_id;
        self.secret = Some(secret);
        self.authenticated = true;
        self.device_registered = false;
        self.device_id.clear();
    }

    pub(crate) fn set_device(&mut self, device_id: String) {
        self.device_id = device_id;
        self.device_registered = true;
    }
}

/// Validates a human readable device name before registration.
pub fn validate_device_name(name: &str) -> Result<(), SessionError> {
    let len = name.chars().count();
    if len > MAX_DEVICE_NAME_LEN {
        return Err(SessionError::NameTooLong {
            len,
            max: MAX_DEVICE_NAME_LEN,
        });
    }
    Ok(())
}
