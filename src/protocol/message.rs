//! Typed wire messages.
//!
//! Decrypted frames carry UTF-8 JSON objects with a mandatory `type` tag.
//! Each direction parses once at the boundary into a closed sum type;
//! unrecognized tags land in [`PeerMessage::Unknown`] so forward-compatible
//! payloads stay observable instead of vanishing silently.
//!
//! Dates on the wire use a fixed ISO-8601-like UTC format with a trailing
//! `Z` (see [`DATE_FORMAT`]).

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Wire date format: UTC, second precision, literal trailing `Z`.
pub const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Errors from message parsing
#[derive(Debug, Error)]
pub enum MessageError {
    /// Payload was not valid JSON
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Payload parsed but was not a JSON object
    #[error("Message is not a JSON object")]
    NotAnObject,

    /// Missing or empty `type` property
    #[error("Missing 'type' property")]
    MissingType,

    /// Known `type` with an ill-shaped payload
    #[error("Invalid '{msg_type}' payload: {source}")]
    InvalidPayload {
        /// The message tag whose payload failed to parse
        msg_type: String,
        /// Underlying deserialization error
        #[source]
        source: serde_json::Error,
    },

    /// Decrypted frame was not UTF-8
    #[error("Frame is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// Date string did not match [`DATE_FORMAT`]
    #[error("Invalid date: {0}")]
    InvalidDate(String),
}

/// Feature bitset advertised by the peer during handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    /// Peer can relay notifications
    #[serde(default)]
    pub notifications: bool,
    /// Peer can list and send SMS
    #[serde(default)]
    pub sms: bool,
}

/// Application-level handshake sent by the peer after key exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Companion app version
    pub app_version: String,
    /// Human-readable device name
    pub device_name: String,
    /// Peer operating system type
    pub os_type: String,
    /// Peer operating system version
    pub os_version: String,
    /// Advertised features
    #[serde(default)]
    pub features: FeatureFlags,
}

/// One notification as reported by the peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// Stable key identifying the notification on the device
    pub key: String,
    /// Originating application name
    pub app_name: String,
    /// Notification title
    pub title: String,
    /// Body text, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Whether the notification cannot be dismissed remotely
    #[serde(default)]
    pub persistent: bool,
}

/// SMS direction relative to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmsDirection {
    /// Received by the device
    In,
    /// Sent from the device
    Out,
}

/// A full SMS entry with correspondent details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sms {
    /// Direction
    #[serde(rename = "type")]
    pub direction: SmsDirection,
    /// Timestamp in [`DATE_FORMAT`]
    pub date: String,
    /// Message body
    pub body: String,
    /// Correspondent phone number
    pub number: String,
    /// Resolved contact name, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A compact SMS entry inside a per-correspondent thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShortSms {
    /// Direction
    #[serde(rename = "type")]
    pub direction: SmsDirection,
    /// Timestamp in [`DATE_FORMAT`]
    pub date: String,
    /// Message body
    pub body: String,
}

/// Messages sent by the host to the peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    /// Handshake verdict
    Handshake {
        /// Whether the peer was accepted
        success: bool,
    },
    /// Request the current notification list
    ListNotifications,
    /// Request the SMS conversation list
    ListSms,
    /// Request a single SMS thread
    ListSmsFrom {
        /// Correspondent phone number
        number: String,
        /// Optional page index
        #[serde(default, skip_serializing_if = "Option::is_none")]
        page: Option<u32>,
    },
    /// Send an SMS from the device
    SendSms {
        /// Destination phone number
        destination: String,
        /// Message body
        body: String,
    },
    /// Dismiss a notification on the device
    DismissNotification {
        /// Notification key
        key: String,
    },
}

/// Messages received from the peer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    /// Application-level handshake with device metadata
    Handshake(HandshakeRequest),
    /// A new notification arrived on the device
    NotificationReceived {
        /// The notification
        notification: Notification,
    },
    /// A notification was removed on the device
    NotificationRemoved {
        /// The notification
        notification: Notification,
    },
    /// Full notification list
    NotificationList {
        /// Current notifications
        list: Vec<Notification>,
    },
    /// SMS conversation list
    SmsList {
        /// Most recent message per conversation
        list: Vec<Sms>,
    },
    /// One SMS thread
    SmsFromList {
        /// Correspondent phone number
        number: String,
        /// Resolved contact name, if known
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        /// Thread messages
        list: Vec<ShortSms>,
    },
    /// Result of a send_sms request
    SmsSent {
        /// Destination phone number
        number: String,
        /// Whether the send succeeded
        success: bool,
        /// Echo of the sent message
        sms: ShortSms,
    },
    /// Forward-compatible escape hatch for unrecognized tags
    #[serde(skip)]
    Unknown {
        /// The unrecognized tag
        msg_type: String,
        /// The raw message object
        payload: Value,
    },
}

impl PeerMessage {
    /// Parse a decrypted frame payload into a typed message.
    ///
    /// A missing or empty `type` is an error (the sender is not speaking
    /// the protocol); an unrecognized `type` is not (it maps to
    /// [`PeerMessage::Unknown`]).
    pub fn from_json(raw: &str) -> Result<Self, MessageError> {
        let value: Value = serde_json::from_str(raw)?;

        let map = value.as_object().ok_or(MessageError::NotAnObject)?;
        let msg_type = map
            .get("type")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or(MessageError::MissingType)?
            .to_string();

        let invalid = |source| MessageError::InvalidPayload {
            msg_type: msg_type.clone(),
            source,
        };

        Ok(match msg_type.as_str() {
            "handshake" => Self::Handshake(from_value(&value).map_err(invalid)?),
            "notification_received" => {
                let NotificationEnvelope { notification } =
                    from_value(&value).map_err(invalid)?;
                Self::NotificationReceived { notification }
            }
            "notification_removed" => {
                let NotificationEnvelope { notification } =
                    from_value(&value).map_err(invalid)?;
                Self::NotificationRemoved { notification }
            }
            "notification_list" => {
                let ListEnvelope { list } = from_value(&value).map_err(invalid)?;
                Self::NotificationList { list }
            }
            "sms_list" => {
                let ListEnvelope { list } = from_value(&value).map_err(invalid)?;
                Self::SmsList { list }
            }
            "sms_from_list" => {
                let SmsThreadEnvelope { number, name, list } =
                    from_value(&value).map_err(invalid)?;
                Self::SmsFromList { number, name, list }
            }
            "sms_sent" => {
                let SmsSentEnvelope {
                    number,
                    success,
                    sms,
                } = from_value(&value).map_err(invalid)?;
                Self::SmsSent {
                    number,
                    success,
                    sms,
                }
            }
            _ => Self::Unknown {
                msg_type,
                payload: value,
            },
        })
    }

    /// The wire tag of this message.
    pub fn msg_type(&self) -> &str {
        match self {
            Self::Handshake(_) => "handshake",
            Self::NotificationReceived { .. } => "notification_received",
            Self::NotificationRemoved { .. } => "notification_removed",
            Self::NotificationList { .. } => "notification_list",
            Self::SmsList { .. } => "sms_list",
            Self::SmsFromList { .. } => "sms_from_list",
            Self::SmsSent { .. } => "sms_sent",
            Self::Unknown { msg_type, .. } => msg_type,
        }
    }
}

fn from_value<T: serde::de::DeserializeOwned>(value: &Value) -> Result<T, serde_json::Error> {
    T::deserialize(value)
}

#[derive(Deserialize)]
struct NotificationEnvelope {
    notification: Notification,
}

#[derive(Deserialize)]
struct ListEnvelope<T> {
    list: Vec<T>,
}

#[derive(Deserialize)]
struct SmsThreadEnvelope {
    number: String,
    #[serde(default)]
    name: Option<String>,
    list: Vec<ShortSms>,
}

#[derive(Deserialize)]
struct SmsSentEnvelope {
    number: String,
    success: bool,
    sms: ShortSms,
}

/// Format a timestamp in the fixed wire date format.
pub fn format_date(date: DateTime<Utc>) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Parse a wire date string.
pub fn parse_date(text: &str) -> Result<DateTime<Utc>, MessageError> {
    NaiveDateTime::parse_from_str(text, DATE_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| MessageError::InvalidDate(text.to_string()))
}
