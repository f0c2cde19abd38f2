//! CloudEvents HTTP protocol binding.
//!
//! Decodes requests in binary (`ce-*` headers) or structured
//! (`application/cloudevents+json`) content mode, and encodes events in
//! binary mode for replies and sink delivery.

use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use super::{
    check_spec_version, is_context_attribute, media_type, parse_time, BindingError, CloudEvent,
    EventData,
};

/// Header prefix for binary-mode attributes.
const HEADER_PREFIX: &str = "ce-";

/// Media type of the structured JSON event format.
pub const STRUCTURED_CONTENT_TYPE: &str = "application/cloudevents+json";

/// Media type of the batched JSON event format.
const BATCH_CONTENT_TYPE: &str = "application/cloudevents-batch+json";

/// Decode an HTTP request into a [`CloudEvent`].
///
/// # Errors
///
/// Returns [`BindingError`] for batched requests, missing required
/// attributes, or malformed attribute values.
pub fn decode_request(headers: &HeaderMap, body: &[u8]) -> Result<CloudEvent, BindingError> {
    let content_type = header_str(headers, CONTENT_TYPE.as_str())?;
    match content_type.as_deref().map(media_type) {
        Some(ct) if ct == STRUCTURED_CONTENT_TYPE => CloudEvent::from_json_slice(body),
        Some(ct) if ct == BATCH_CONTENT_TYPE => Err(BindingError::UnsupportedContentMode(ct)),
        _ => decode_binary(headers, content_type, body),
    }
}

fn decode_binary(
    headers: &HeaderMap,
    content_type: Option<String>,
    body: &[u8],
) -> Result<CloudEvent, BindingError> {
    let required = |name: &'static str| -> Result<String, BindingError> {
        match header_str(headers, &format!("{HEADER_PREFIX}{name}"))? {
            Some(v) if !v.is_empty() => Ok(v),
            _ => Err(BindingError::MissingAttribute(name)),
        }
    };

    let specversion = required("specversion")?;
    check_spec_version(&specversion)?;
    let mut event = CloudEvent::new(required("id")?, required("source")?, required("type")?);

    event.time = header_str(headers, "ce-time")?
        .map(|raw| parse_time(&raw))
        .transpose()?;
    event.subject = header_str(headers, "ce-subject")?;
    event.dataschema = header_str(headers, "ce-dataschema")?;

    for (name, value) in headers {
        let Some(attribute) = name.as_str().strip_prefix(HEADER_PREFIX) else {
            continue;
        };
        if is_context_attribute(attribute) {
            continue;
        }
        let value = value.to_str().map_err(|e| BindingError::InvalidAttribute {
            name: attribute.to_owned(),
            reason: e.to_string(),
        })?;
        event.extensions.insert(attribute.to_owned(), value.to_owned());
    }

    if !body.is_empty() {
        event.data = Some(EventData::from_bytes(content_type.as_deref(), body));
    }
    event.datacontenttype = content_type;
    Ok(event)
}

/// Encode an event in binary content mode.
///
/// # Errors
///
/// Returns [`BindingError::InvalidAttribute`] when an attribute cannot be
/// carried in an HTTP header, or [`BindingError::Json`] if the payload
/// cannot be serialized.
pub fn encode_binary(event: &CloudEvent) -> Result<(HeaderMap, Vec<u8>), BindingError> {
    let mut headers = HeaderMap::new();
    insert_header(&mut headers, "ce-specversion", &event.specversion)?;
    insert_header(&mut headers, "ce-id", &event.id)?;
    insert_header(&mut headers, "ce-source", &event.source)?;
    insert_header(&mut headers, "ce-type", &event.event_type)?;
    if let Some(time) = &event.time {
        insert_header(&mut headers, "ce-time", &time.to_rfc3339())?;
    }
    if let Some(subject) = &event.subject {
        insert_header(&mut headers, "ce-subject", subject)?;
    }
    if let Some(schema) = &event.dataschema {
        insert_header(&mut headers, "ce-dataschema", schema)?;
    }
    for (name, value) in &event.extensions {
        insert_header(&mut headers, &format!("{HEADER_PREFIX}{name}"), value)?;
    }

    let Some(data) = &event.data else {
        return Ok((headers, Vec::new()));
    };

    let content_type = event
        .datacontenttype
        .as_deref()
        .unwrap_or_else(|| data.default_content_type());
    let body = data.to_bytes()?;
    insert_header(&mut headers, CONTENT_TYPE.as_str(), content_type)?;
    Ok((headers, body))
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) -> Result<(), BindingError> {
    let invalid = |reason: String| BindingError::InvalidAttribute {
        name: name.to_owned(),
        reason,
    };
    let header_name = HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes())
        .map_err(|e| invalid(e.to_string()))?;
    let header_value = HeaderValue::from_str(value).map_err(|e| invalid(e.to_string()))?;
    headers.insert(header_name, header_value);
    Ok(())
}

fn header_str(headers: &HeaderMap, name: &str) -> Result<Option<String>, BindingError> {
    headers
        .get(name)
        .map(|v| {
            v.to_str()
                .map(str::to_owned)
                .map_err(|e| BindingError::InvalidAttribute {
                    name: name.to_owned(),
                    reason: e.to_string(),
                })
        })
        .transpose()
}
