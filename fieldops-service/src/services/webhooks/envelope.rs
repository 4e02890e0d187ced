//! Provider-neutral view of a webhook payload.

use rust_decimal::Decimal;
use serde_json::Value;
use service_core::utils::signature::payload_digest;
use std::str::FromStr;
use uuid::Uuid;

/// Event type recorded when a payload names none.
pub const UNKNOWN_EVENT_TYPE: &str = "unknown";

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub event_id: Option<String>,
    pub event_type: Option<String>,
    pub org_id: Option<Uuid>,
    pub data: Value,
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn first_string(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| value.get(*key).and_then(scalar_string))
}

impl Envelope {
    /// Parse a raw body. Identifier is `id` or `event_id`; type is `type`, `event` or `event_type`.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(raw)?;
        let data = value.get("data").cloned().unwrap_or(Value::Null);
        let org_id = data
            .get("org_id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok());

        Ok(Self {
            event_id: first_string(&value, &["id", "event_id"]),
            event_type: first_string(&value, &["type", "event", "event_type"]),
            org_id,
            data,
        })
    }

    pub fn event_type_or_unknown(&self) -> String {
        self.event_type
            .clone()
            .unwrap_or_else(|| UNKNOWN_EVENT_TYPE.to_string())
    }

    /// First non-empty string or number under `keys` in `data`.
    pub fn data_string(&self, keys: &[&str]) -> Option<String> {
        first_string(&self.data, keys)
    }

    pub fn data_uuid(&self, key: &str) -> Result<Uuid, String> {
        let raw = self
            .data_string(&[key])
            .ok_or_else(|| format!("Payload data has no {}", key))?;
        Uuid::parse_str(&raw).map_err(|_| format!("Payload {} '{}' is not a UUID", key, raw))
    }

    /// Decimal from a string or JSON number.
    pub fn data_decimal(&self, key: &str) -> Result<Decimal, String> {
        let raw = self
            .data_string(&[key])
            .ok_or_else(|| format!("Payload data has no {}", key))?;
        Decimal::from_str(&raw)
            .or_else(|_| Decimal::from_scientific(&raw))
            .map_err(|_| format!("Payload {} '{}' is not a decimal amount", key, raw))
    }
}

/// Deduplication key for a payload without a usable identifier.
pub fn digest_key(raw: &str) -> String {
    format!("sha256:{}", payload_digest(raw.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_identifier_type_and_org() {
        let org_id = Uuid::new_v4();
        let raw = format!(
            r#"{{"id":"evt_123","type":"payment.succeeded","data":{{"org_id":"{}","amount":"25.00"}}}}"#,
            org_id
        );
        let envelope = Envelope::parse(&raw).unwrap();

        assert_eq!(envelope.event_id.as_deref(), Some("evt_123"));
        assert_eq!(envelope.event_type.as_deref(), Some("payment.succeeded"));
        assert_eq!(envelope.org_id, Some(org_id));
        assert_eq!(envelope.data_decimal("amount").unwrap(), Decimal::new(2500, 2));
    }

    #[test]
    fn accepts_alternate_field_names() {
        let envelope =
            Envelope::parse(r#"{"event_id":42,"event":"payment.failed","data":{"amount":12.5}}"#)
                .unwrap();

        assert_eq!(envelope.event_id.as_deref(), Some("42"));
        assert_eq!(envelope.event_type.as_deref(), Some("payment.failed"));
        assert_eq!(envelope.org_id, None);
        assert_eq!(envelope.data_decimal("amount").unwrap(), Decimal::new(125, 1));
    }

    #[test]
    fn missing_fields_are_none() {
        let envelope = Envelope::parse(r#"{"hello":"world"}"#).unwrap();
        assert!(envelope.event_id.is_none());
        assert_eq!(envelope.event_type_or_unknown(), UNKNOWN_EVENT_TYPE);
        assert!(envelope.data_uuid("invoice_id").is_err());
    }

    #[test]
    fn digest_key_is_stable_per_body() {
        assert_eq!(digest_key("not json"), digest_key("not json"));
        assert_ne!(digest_key("not json"), digest_key("not json!"));
        assert!(digest_key("x").starts_with("sha256:"));
        assert!(Envelope::parse("not json").is_err());
    }
}
