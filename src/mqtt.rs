//! MQTT topic layout and payloads for publishing a session.

use std::time::Duration;

use bytes::Bytes;
use rumqttc::{LastWill, MqttOptions, QoS};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

use crate::session::SessionStatus;


#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topics {
    /// Retained JSON snapshot of the device state.
    pub state: String,

    /// Retained `true`/`false`. Also the last will.
    pub connected: String,

    /// JSON object of field → value changes.
    pub set: String,
}

impl Topics {
    pub fn new(prefix: &str) -> Self {
        let prefix = prefix.trim_end_matches('/');

        Self {
            state: format!("{prefix}/state"),
            connected: format!("{prefix}/connected"),
            set: format!("{prefix}/set"),
        }
    }
}


#[derive(Clone, Debug)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
}

impl MqttConfig {
    pub fn options(&self, topics: &Topics) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);

        options
            .set_keep_alive(self.keep_alive)
            .set_last_will(LastWill::new(&topics.connected, connected_payload(false), QoS::AtLeastOnce, true));

        if let Some(username) = &self.username {
            options.set_credentials(username, self.password.clone().unwrap_or_default());
        }

        options
    }
}


#[derive(Error, Debug)]
pub enum SetPayloadError {
    #[error("set payload is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("set payload must be a json object")]
    NotAnObject,
    #[error("value for {0:?} must be a string or a number")]
    BadValue(String),
}

/// Field/value pairs from a `set` message, e.g. `{"power": "ON", "temp": 21.5}`.
pub fn parse_set_payload(payload: &[u8]) -> Result<Vec<(String, String)>, SetPayloadError> {
    let Value::Object(fields) = serde_json::from_slice(payload)? else {
        return Err(SetPayloadError::NotAnObject)
    };

    fields.into_iter()
        .map(|(field, value)| match value {
            Value::String(value) => Ok((field, value)),
            Value::Number(value) => Ok((field, value.to_string())),
            _ => Err(SetPayloadError::BadValue(field)),
        })
        .collect()
}

/// `None` until the device state is valid.
pub fn state_payload(status: &SessionStatus) -> Option<Vec<u8>> {
    let snapshot = status.device.snapshot()?;

    // a snapshot is plain strings and numbers
    serde_json::to_vec(&snapshot).ok()
}

pub fn connected_payload(connected: bool) -> &'static str {
    if connected { "true" } else { "false" }
}


/// Hand a `set` message to the gateway without blocking the MQTT event loop.
///
/// Messages are dropped while the queue is full. Returns false once the
/// receiving side is gone.
pub fn forward_set(set_send: &mpsc::Sender<Bytes>, payload: Bytes) -> bool {
    match set_send.try_send(payload) {
        Ok(()) => true,
        Err(TrySendError::Full(payload)) => {
            warn!(payload = ?payload, "set queue full, dropping message");
            true
        },
        Err(TrySendError::Closed(_)) => false,
    }
}

/// Drop queued `set` messages, e.g. while there's no session to apply them.
pub fn discard_sets(set_recv: &mut mpsc::Receiver<Bytes>) -> usize {
    let mut discarded = 0;

    while let Ok(payload) = set_recv.try_recv() {
        warn!(payload = ?payload, "no session, dropping set message");
        discarded += 1;
    }

    discarded
}
