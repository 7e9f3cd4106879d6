//! Decoding of storage-arrival notifications.
//!
//! Three shapes are accepted:
//!
//! 1. An S3 event notification: `{"Records": [{"eventTime": ..., "s3": {...}}]}`.
//! 2. An SQS envelope around (1): `{"Records": [{"body": "<json>"}]}`.
//! 3. A plain arrival document:
//!    `{"object_key": ..., "object_version": ..., "event_time": ...}`.
//!
//! S3 test events (`{"Event": "s3:TestEvent"}`) decode to no records.

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::models::FileDescriptor;

/// Version token used for objects that carry neither a version id nor an
/// entity tag.
pub const UNVERSIONED: &str = "null";

/// Prefix marking a version token derived from an entity tag.
pub const ETAG_VERSION_PREFIX: &str = "etag:";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("notification is not valid JSON: {0}")]
    Json(String),
    #[error("unrecognised notification shape: {0}")]
    Shape(String),
    #[error("object key is not valid percent-encoding: {0}")]
    Key(String),
}

/// One object arrival extracted from a notification.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrivalRecord {
    pub object_key: String,
    pub object_version: String,
    pub event_time: Option<DateTime<Utc>>,
    pub bucket: Option<String>,
    pub size: Option<u64>,
    pub checksum_sha256: Option<String>,
}

impl ArrivalRecord {
    /// Build the descriptor, falling back to `received_at` when the event
    /// carries no timestamp.
    pub fn into_descriptor(self, received_at: DateTime<Utc>) -> FileDescriptor {
        let mut descriptor = FileDescriptor::new(
            self.object_key,
            self.object_version,
            self.event_time.unwrap_or(received_at),
        );
        descriptor.size = self.size;
        descriptor.checksum_sha256 = self.checksum_sha256;
        descriptor
    }
}

/// Decode a raw buffered message into its arrival records.
pub fn decode_notification(raw: &str) -> Result<Vec<ArrivalRecord>, DecodeError> {
    let value: Value = serde_json::from_str(raw).map_err(|e| DecodeError::Json(e.to_string()))?;
    decode_value(&value, 0)
}

fn decode_value(value: &Value, depth: usize) -> Result<Vec<ArrivalRecord>, DecodeError> {
    if depth > 2 {
        return Err(DecodeError::Shape("notification nested too deeply".into()));
    }

    let object = value
        .as_object()
        .ok_or_else(|| DecodeError::Shape("expected a JSON object".into()))?;

    if object.get("Event").and_then(Value::as_str) == Some("s3:TestEvent") {
        return Ok(Vec::new());
    }

    if object.contains_key("object_key") {
        return decode_plain(value).map(|r| vec![r]);
    }

    if let Some(body) = object.get("body").and_then(Value::as_str) {
        return decode_body(body, depth);
    }

    let records = object
        .get("Records")
        .and_then(Value::as_array)
        .ok_or_else(|| DecodeError::Shape("missing 'Records' array".into()))?;

    let mut out = Vec::new();
    for record in records {
        if let Some(body) = record.get("body").and_then(Value::as_str) {
            out.extend(decode_body(body, depth)?);
        } else if record.get("s3").is_some() {
            out.push(decode_s3_record(record)?);
        } else {
            return Err(DecodeError::Shape(
                "record has neither 's3' nor 'body'".into(),
            ));
        }
    }
    Ok(out)
}

fn decode_body(body: &str, depth: usize) -> Result<Vec<ArrivalRecord>, DecodeError> {
    let inner: Value = serde_json::from_str(body).map_err(|e| DecodeError::Json(e.to_string()))?;
    decode_value(&inner, depth + 1)
}

fn decode_s3_record(record: &Value) -> Result<ArrivalRecord, DecodeError> {
    let s3 = &record["s3"];
    let object = &s3["object"];
    let raw_key = object["key"]
        .as_str()
        .ok_or_else(|| DecodeError::Shape("s3.object.key missing".into()))?;
    let object_key = url_decode(raw_key)?;

    let version_id = object["versionId"].as_str().filter(|v| !v.is_empty());
    let etag = object["eTag"].as_str().filter(|v| !v.is_empty());
    let object_version = match (version_id, etag) {
        (Some(v), _) => v.to_string(),
        (None, Some(tag)) => format!("{}{}", ETAG_VERSION_PREFIX, tag.trim_matches('"')),
        (None, None) => UNVERSIONED.to_string(),
    };

    Ok(ArrivalRecord {
        object_key,
        object_version,
        event_time: parse_time(record.get("eventTime")),
        bucket: s3["bucket"]["name"].as_str().map(str::to_string),
        size: object["size"].as_u64(),
        checksum_sha256: None,
    })
}

fn decode_plain(value: &Value) -> Result<ArrivalRecord, DecodeError> {
    let object_key = value["object_key"]
        .as_str()
        .filter(|k| !k.is_empty())
        .ok_or_else(|| DecodeError::Shape("object_key must be a non-empty string".into()))?
        .to_string();
    let object_version = value["object_version"]
        .as_str()
        .filter(|v| !v.is_empty())
        .unwrap_or(UNVERSIONED)
        .to_string();

    Ok(ArrivalRecord {
        object_key,
        object_version,
        event_time: parse_time(value.get("event_time")),
        bucket: value["bucket"].as_str().map(str::to_string),
        size: value["size"].as_u64(),
        checksum_sha256: value["checksum_sha256"]
            .as_str()
            .map(|s| s.to_ascii_lowercase()),
    })
}

fn parse_time(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Decode an S3 event key: `+` is a space and `%XX` an escaped byte.
/// Escapes that do not decode to UTF-8 are rejected.
pub fn url_decode(raw: &str) -> Result<String, DecodeError> {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|key| key.into_owned())
        .map_err(|_| DecodeError::Key(raw.to_string()))
}

/// Encode a key the way S3 event notifications do: `/` is kept, spaces
/// become `+` and everything outside the unreserved set is percent-escaped.
pub fn url_encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).replace("%20", "+"))
        .collect::<Vec<_>>()
        .join("/")
}

/// Render a minimal S3 event notification for one object. Used when
/// re-announcing objects that are already in storage.
pub fn synthetic_s3_event(bucket: &str, key: &str, etag: Option<&str>, size: u64) -> Value {
    let mut object = serde_json::json!({
        "key": url_encode_key(key),
        "size": size,
    });
    if let Some(tag) = etag {
        object["eTag"] = Value::String(tag.to_string());
    }
    serde_json::json!({
        "Records": [{
            "eventSource": "aws:s3",
            "eventName": "ObjectCreated:Put",
            "eventTime": Utc::now().to_rfc3339(),
            "s3": {
                "bucket": { "name": bucket },
                "object": object,
            }
        }]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FileKind, FileType};

    const S3_EVENT: &str = r#"{
        "Records": [{
            "eventTime": "2024-01-01T12:00:00.000Z",
            "s3": {
                "bucket": {"name": "odin-l0"},
                "object": {"key": "ac1/0ce/0ce86a42.ac1", "size": 1234, "versionId": "3HL4kqtJlcpXroDTDmJ", "eTag": "abc"}
            }
        }]
    }"#;

    #[test]
    fn test_decode_s3_event() {
        let records = decode_notification(S3_EVENT).unwrap();
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.object_key, "ac1/0ce/0ce86a42.ac1");
        assert_eq!(r.object_version, "3HL4kqtJlcpXroDTDmJ");
        assert_eq!(r.size, Some(1234));
        assert_eq!(r.bucket.as_deref(), Some("odin-l0"));
        assert!(r.event_time.is_some());
        let d = r.clone().into_descriptor(Utc::now());
        assert_eq!(d.file_type, FileKind::Known(FileType::Ac1));
    }

    #[test]
    fn test_decode_sqs_envelope() {
        let envelope = serde_json::json!({
            "Records": [{ "messageId": "m1", "body": S3_EVENT }]
        })
        .to_string();
        let records = decode_notification(&envelope).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].object_key, "ac1/0ce/0ce86a42.ac1");
    }

    #[test]
    fn test_version_falls_back_to_etag_then_null() {
        let with_etag = r#"{"Records":[{"s3":{"object":{"key":"a.att","eTag":"\"d41d8\""}}}]}"#;
        assert_eq!(
            decode_notification(with_etag).unwrap()[0].object_version,
            "etag:d41d8"
        );
        let bare = r#"{"Records":[{"s3":{"object":{"key":"a.att"}}}]}"#;
        assert_eq!(decode_notification(bare).unwrap()[0].object_version, "null");
    }

    #[test]
    fn test_key_is_url_decoded() {
        assert_eq!(url_decode("L0/some+dir/a%2Bb.shk").unwrap(), "L0/some dir/a+b.shk");
        assert_eq!(url_decode("L0/%E5%A4%A7.att").unwrap(), "L0/\u{5927}.att");
        assert!(url_decode("bad%FF%FE").is_err());
        assert_eq!(url_encode_key("L0/a b/c+d.ac1"), "L0/a+b/c%2Bd.ac1");
        let key = "L0/odd name/a+b%.ac1";
        assert_eq!(url_decode(&url_encode_key(key)).unwrap(), key);
    }

    #[test]
    fn test_plain_arrival_document() {
        let raw = r#"{"object_key":"L0/2024-01-01/0ce86a42.ac1","object_version":"v7","checksum_sha256":"ABCD"}"#;
        let r = &decode_notification(raw).unwrap()[0];
        assert_eq!(r.object_version, "v7");
        assert_eq!(r.checksum_sha256.as_deref(), Some("abcd"));
    }

    #[test]
    fn test_multi_record_event() {
        let raw = r#"{"Records":[
            {"s3":{"object":{"key":"a.ac1","versionId":"1"}}},
            {"s3":{"object":{"key":"b.ac2","versionId":"1"}}}
        ]}"#;
        assert_eq!(decode_notification(raw).unwrap().len(), 2);
    }

    #[test]
    fn test_undecodable_messages() {
        assert!(matches!(
            decode_notification("not json"),
            Err(DecodeError::Json(_))
        ));
        assert!(matches!(
            decode_notification(r#"{"hello":1}"#),
            Err(DecodeError::Shape(_))
        ));
        assert!(decode_notification(r#"{"Event":"s3:TestEvent"}"#)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_synthetic_event_decodes() {
        let raw = synthetic_s3_event("odin", "shk/0ce/0ce86a42.shk", Some("\"e1\""), 42).to_string();
        let r = &decode_notification(&raw).unwrap()[0];
        assert_eq!(r.object_key, "shk/0ce/0ce86a42.shk");
        assert_eq!(r.object_version, "etag:e1");
        assert_eq!(r.size, Some(42));
    }
}
