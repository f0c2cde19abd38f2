//! CloudEvents v1.0 event model.
//!
//! [`CloudEvent`] is the inbound event handed to the adapter and the reply
//! event handed back. The JSON event format (structured content mode) is
//! implemented here; the HTTP protocol binding lives in [`http`].

use std::collections::BTreeMap;

use base64::Engine;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

pub mod http;

/// The only CloudEvents spec version accepted and produced.
pub const SPEC_VERSION: &str = "1.0";

/// Content type used for JSON payloads.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Content type assumed for text payloads without a declared type.
const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// Content type assumed for binary payloads without a declared type.
const BINARY_CONTENT_TYPE: &str = "application/octet-stream";

/// Attribute names that are part of the CloudEvents context, not extensions.
const CONTEXT_ATTRIBUTES: &[&str] = &[
    "id",
    "source",
    "type",
    "specversion",
    "time",
    "subject",
    "datacontenttype",
    "dataschema",
    "data",
    "data_base64",
];

/// Errors raised while decoding or encoding a CloudEvent.
#[derive(Debug, Error)]
pub enum BindingError {
    /// A required context attribute is absent or empty.
    #[error("missing required attribute: {0}")]
    MissingAttribute(&'static str),
    /// The event declares a spec version other than 1.0.
    #[error("unsupported specversion: {0}")]
    UnsupportedSpecVersion(String),
    /// The `time` attribute is not an RFC 3339 timestamp.
    #[error("invalid time attribute: {0}")]
    InvalidTime(String),
    /// An attribute has a type or encoding the binding cannot represent.
    #[error("invalid attribute {name}: {reason}")]
    InvalidAttribute {
        /// Attribute name.
        name: String,
        /// What was wrong with it.
        reason: String,
    },
    /// The request uses a content mode this receiver does not handle.
    #[error("unsupported content mode: {0}")]
    UnsupportedContentMode(String),
    /// JSON body could not be parsed or produced.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Event payload as received.
///
/// Bytes are kept as they arrived so an echoed event is byte-identical to
/// the inbound one. Conversion to JSON only happens for the broadcast.
#[derive(Debug, Clone, PartialEq)]
pub enum EventData {
    /// Parsed JSON payload.
    Json(Value),
    /// UTF-8 payload that is not (valid) JSON.
    Text(String),
    /// Payload that is not UTF-8.
    Binary(Vec<u8>),
}

impl EventData {
    /// Classify a raw body. JSON-typed bodies that fail to parse are kept
    /// as text or bytes.
    pub fn from_bytes(content_type: Option<&str>, body: &[u8]) -> Self {
        if content_type.map_or(true, is_json_media_type) {
            if let Ok(value) = serde_json::from_slice(body) {
                return Self::Json(value);
            }
        }
        match std::str::from_utf8(body) {
            Ok(text) => Self::Text(text.to_owned()),
            Err(_) => Self::Binary(body.to_vec()),
        }
    }

    /// JSON rendering used in broadcast envelopes. Binary payloads become a
    /// base64 string.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Json(value) => value.clone(),
            Self::Text(text) => Value::String(text.clone()),
            Self::Binary(bytes) => {
                Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
            }
        }
    }

    /// Wire bytes of the payload.
    ///
    /// # Errors
    ///
    /// Returns [`BindingError::Json`] if a JSON payload cannot be serialized.
    pub fn to_bytes(&self) -> Result<Vec<u8>, BindingError> {
        match self {
            Self::Json(value) => Ok(serde_json::to_vec(value)?),
            Self::Text(text) => Ok(text.as_bytes().to_vec()),
            Self::Binary(bytes) => Ok(bytes.clone()),
        }
    }

    /// Content type to declare when the event carries none.
    pub fn default_content_type(&self) -> &'static str {
        match self {
            Self::Json(_) => JSON_CONTENT_TYPE,
            Self::Text(_) => TEXT_CONTENT_TYPE,
            Self::Binary(_) => BINARY_CONTENT_TYPE,
        }
    }
}

/// A CloudEvents v1.0 event.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudEvent {
    /// Event identifier, unique per source.
    pub id: String,
    /// Context in which the event happened (URI-reference).
    pub source: String,
    /// Event type, e.g. `order.created`.
    pub event_type: String,
    /// Spec version, always [`SPEC_VERSION`].
    pub specversion: String,
    /// Occurrence timestamp.
    pub time: Option<DateTime<Utc>>,
    /// Subject of the event within the source.
    pub subject: Option<String>,
    /// Media type of `data`.
    pub datacontenttype: Option<String>,
    /// Schema that `data` adheres to.
    pub dataschema: Option<String>,
    /// Extension attributes, rendered as strings.
    pub extensions: BTreeMap<String, String>,
    /// Event payload.
    pub data: Option<EventData>,
}

impl CloudEvent {
    /// Create an event with the required attributes and nothing else.
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        event_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            event_type: event_type.into(),
            specversion: SPEC_VERSION.to_owned(),
            time: None,
            subject: None,
            datacontenttype: None,
            dataschema: None,
            extensions: BTreeMap::new(),
            data: None,
        }
    }

    /// Attach a JSON payload, setting `datacontenttype` to `application/json`.
    pub fn with_json_data(mut self, data: Value) -> Self {
        self.datacontenttype = Some(JSON_CONTENT_TYPE.to_owned());
        self.data = Some(EventData::Json(data));
        self
    }

    /// Set the occurrence time.
    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    /// Set an extension attribute.
    pub fn with_extension(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extensions.insert(name.into(), value.into());
        self
    }

    /// Look up an extension attribute.
    pub fn extension(&self, name: &str) -> Option<&str> {
        self.extensions.get(name).map(String::as_str)
    }

    /// Parse an event from the JSON event format.
    ///
    /// # Errors
    ///
    /// Returns [`BindingError`] when the body is not a JSON object, a
    /// required attribute is missing, or an attribute is malformed.
    pub fn from_json_slice(body: &[u8]) -> Result<Self, BindingError> {
        let value: Value = serde_json::from_slice(body)?;
        let Value::Object(mut map) = value else {
            return Err(BindingError::InvalidAttribute {
                name: "event".to_owned(),
                reason: "structured event must be a JSON object".to_owned(),
            });
        };

        let id = take_required(&mut map, "id")?;
        let source = take_required(&mut map, "source")?;
        let event_type = take_required(&mut map, "type")?;
        let specversion = take_required(&mut map, "specversion")?;
        check_spec_version(&specversion)?;

        let time = take_optional(&mut map, "time")?
            .map(|raw| parse_time(&raw))
            .transpose()?;
        let subject = take_optional(&mut map, "subject")?;
        let datacontenttype = take_optional(&mut map, "datacontenttype")?;
        let dataschema = take_optional(&mut map, "dataschema")?;

        let data = match (map.remove("data"), map.remove("data_base64")) {
            (Some(Value::String(text)), _)
                if !datacontenttype.as_deref().map_or(true, is_json_media_type) =>
            {
                Some(EventData::Text(text))
            }
            (Some(data), _) => Some(EventData::Json(data)),
            (None, Some(Value::String(encoded))) => Some(EventData::Binary(
                base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|e| BindingError::InvalidAttribute {
                        name: "data_base64".to_owned(),
                        reason: e.to_string(),
                    })?,
            )),
            (None, Some(_)) => {
                return Err(BindingError::InvalidAttribute {
                    name: "data_base64".to_owned(),
                    reason: "must be a string".to_owned(),
                })
            }
            (None, None) => None,
        };

        let mut extensions = BTreeMap::new();
        for (name, value) in map {
            extensions.insert(name.clone(), extension_to_string(&name, value)?);
        }

        Ok(Self {
            id,
            source,
            event_type,
            specversion,
            time,
            subject,
            datacontenttype,
            dataschema,
            extensions,
            data,
        })
    }

    /// Render the event in the JSON event format.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert("specversion".to_owned(), Value::from(self.specversion.as_str()));
        map.insert("id".to_owned(), Value::from(self.id.as_str()));
        map.insert("source".to_owned(), Value::from(self.source.as_str()));
        map.insert("type".to_owned(), Value::from(self.event_type.as_str()));
        if let Some(time) = &self.time {
            map.insert("time".to_owned(), Value::from(time.to_rfc3339()));
        }
        for (name, value) in [
            ("subject", &self.subject),
            ("datacontenttype", &self.datacontenttype),
            ("dataschema", &self.dataschema),
        ] {
            if let Some(value) = value {
                map.insert(name.to_owned(), Value::from(value.as_str()));
            }
        }
        for (name, value) in &self.extensions {
            map.insert(name.clone(), Value::from(value.as_str()));
        }
        match &self.data {
            Some(EventData::Binary(bytes)) => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
                map.insert("data_base64".to_owned(), Value::String(encoded));
            }
            Some(data) => {
                map.insert("data".to_owned(), data.to_value());
            }
            None => {}
        }
        Value::Object(map)
    }
}

pub(crate) fn check_spec_version(specversion: &str) -> Result<(), BindingError> {
    if specversion != SPEC_VERSION {
        return Err(BindingError::UnsupportedSpecVersion(specversion.to_owned()));
    }
    Ok(())
}

pub(crate) fn parse_time(raw: &str) -> Result<DateTime<Utc>, BindingError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| BindingError::InvalidTime(format!("{raw}: {e}")))
}

/// Lowercased media type without parameters.
pub(crate) fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

pub(crate) fn is_json_media_type(content_type: &str) -> bool {
    let media = media_type(content_type);
    media == "application/json" || media == "text/json" || media.ends_with("+json")
}

/// Whether `name` is a context attribute rather than an extension.
pub(crate) fn is_context_attribute(name: &str) -> bool {
    CONTEXT_ATTRIBUTES.contains(&name)
}

fn take_required(map: &mut Map<String, Value>, name: &'static str) -> Result<String, BindingError> {
    match take_optional(map, name)? {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(BindingError::MissingAttribute(name)),
    }
}

fn take_optional(
    map: &mut Map<String, Value>,
    name: &'static str,
) -> Result<Option<String>, BindingError> {
    match map.remove(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(BindingError::InvalidAttribute {
            name: name.to_owned(),
            reason: "must be a string".to_owned(),
        }),
    }
}

fn extension_to_string(name: &str, value: Value) -> Result<String, BindingError> {
    match value {
        Value::String(s) => Ok(s),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(BindingError::InvalidAttribute {
            name: name.to_owned(),
            reason: "extension values must be scalars".to_owned(),
        }),
    }
}
