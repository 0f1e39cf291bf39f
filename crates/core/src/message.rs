use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DecodeError, RoutingError};

/// Tenant assigned to envelopes constructed without one.
pub const DEFAULT_TENANT: &str = "default_tenant";

/// Textual format of `metadata.timestamp` (UTC, microsecond precision).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

pub type Fields = Map<String, Value>;

/// The raw field set of an envelope, before identity stamping.
///
/// This is the only way to build a [`UniversalMessage`]: fill in the parts and
/// call [`MessageParts::build`] (or `UniversalMessage::new`). Decoding goes
/// through the same constructor.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MessageParts {
    #[serde(default)]
    pub metadata: Fields,
    #[serde(default)]
    pub routing: Fields,
    #[serde(default)]
    pub payload: Fields,
    #[serde(default)]
    pub context: Fields,
    #[serde(default)]
    pub security: Fields,
    #[serde(default)]
    pub tenant_id: Option<String>,
}

impl MessageParts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a `scheme:destination` address to `routing.targets`.
    pub fn target(mut self, address: impl Into<String>) -> Self {
        let entry = self
            .routing
            .entry("targets")
            .or_insert_with(|| Value::Array(Vec::new()));
        if !entry.is_array() {
            *entry = Value::Array(Vec::new());
        }
        if let Value::Array(targets) = entry {
            targets.push(Value::String(address.into()));
        }
        self
    }

    pub fn payload(mut self, payload: Fields) -> Self {
        self.payload = payload;
        self
    }

    pub fn metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn context(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }

    pub fn security(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.security.insert(key.to_string(), value.into());
        self
    }

    /// Opaque credential, forwarded untouched in `metadata.token`.
    pub fn token(self, token: impl Into<String>) -> Self {
        self.metadata("token", token.into())
    }

    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn build(self) -> UniversalMessage {
        UniversalMessage::new(self)
    }
}

/// The canonical envelope exchanged by every component.
///
/// Immutable once built: `metadata.id` and `metadata.timestamp` are assigned
/// by the constructor if absent and never change afterwards. To derive a new
/// envelope from an existing one, go through [`UniversalMessage::into_parts`];
/// the identity fields carry over because they are already present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "MessageParts")]
pub struct UniversalMessage {
    metadata: Fields,
    routing: Fields,
    payload: Fields,
    context: Fields,
    security: Fields,
    tenant_id: String,
}

impl From<MessageParts> for UniversalMessage {
    fn from(parts: MessageParts) -> Self {
        Self::new(parts)
    }
}

impl UniversalMessage {
    pub fn new(parts: MessageParts) -> Self {
        let MessageParts {
            mut metadata,
            routing,
            payload,
            context,
            security,
            tenant_id,
        } = parts;

        stamp_if_absent(&mut metadata, "id", || uuid::Uuid::new_v4().to_string());
        stamp_if_absent(&mut metadata, "timestamp", || {
            chrono::Utc::now().format(TIMESTAMP_FORMAT).to_string()
        });

        let tenant_id = tenant_id
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_TENANT.to_string());

        Self {
            metadata,
            routing,
            payload,
            context,
            security,
            tenant_id,
        }
    }

    pub fn builder() -> MessageParts {
        MessageParts::new()
    }

    pub fn id(&self) -> &str {
        self.metadata
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn timestamp(&self) -> &str {
        self.metadata
            .get("timestamp")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn token(&self) -> Option<&str> {
        self.metadata.get("token").and_then(Value::as_str)
    }

    pub fn message_type(&self) -> Option<&str> {
        self.metadata.get("type").and_then(Value::as_str)
    }

    pub fn metadata(&self) -> &Fields {
        &self.metadata
    }

    pub fn routing(&self) -> &Fields {
        &self.routing
    }

    pub fn payload(&self) -> &Fields {
        &self.payload
    }

    pub fn context(&self) -> &Fields {
        &self.context
    }

    pub fn security(&self) -> &Fields {
        &self.security
    }

    /// The ordered `routing.targets` addresses. A missing key is an empty list;
    /// anything that is not an array of strings is a malformed address.
    pub fn targets(&self) -> std::result::Result<Vec<String>, RoutingError> {
        match self.routing.get("targets") {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.clone()),
                    other => Err(RoutingError::MalformedAddress(other.to_string())),
                })
                .collect(),
            Some(other) => Err(RoutingError::MalformedAddress(other.to_string())),
        }
    }

    pub fn into_parts(self) -> MessageParts {
        MessageParts {
            metadata: self.metadata,
            routing: self.routing,
            payload: self.payload,
            context: self.context,
            security: self.security,
            tenant_id: Some(self.tenant_id),
        }
    }

    /// Canonical JSON encoding of all six fields.
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, DecodeError> {
        serde_json::from_slice(bytes).map_err(|e| DecodeError(e.to_string()))
    }
}

/// Strings are kept as-is, scalar ids are kept in their textual form, and
/// anything else (missing, null, empty, nested) gets a fresh value.
fn stamp_if_absent(metadata: &mut Fields, key: &str, fresh: impl FnOnce() -> String) {
    let existing = match metadata.get(key) {
        Some(Value::String(s)) if !s.is_empty() => return,
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    };
    let value = existing.unwrap_or_else(fresh);
    metadata.insert(key.to_string(), Value::String(value));
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_new_stamps_identity() {
        let msg = UniversalMessage::builder().build();
        assert!(!msg.id().is_empty());
        assert!(msg.timestamp().ends_with('Z'));
        assert_eq!(msg.tenant_id(), DEFAULT_TENANT);
        assert!(msg.targets().unwrap().is_empty());
    }

    #[test]
    fn test_stamping_is_idempotent() {
        let parts = MessageParts::new()
            .metadata("id", "m-1")
            .metadata("timestamp", "2024-01-01T00:00:00.000000Z")
            .tenant("acme");
        let a = parts.clone().build();
        let b = parts.build();
        assert_eq!(a.id(), "m-1");
        assert_eq!(a.id(), b.id());
        assert_eq!(a.timestamp(), b.timestamp());
        assert_eq!(a, b);
    }

    #[test]
    fn test_fresh_envelopes_get_distinct_ids() {
        let a = UniversalMessage::builder().build();
        let b = UniversalMessage::builder().build();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_empty_or_null_id_is_replaced() {
        let a = MessageParts::new().metadata("id", "").build();
        assert!(!a.id().is_empty());
        let b = MessageParts::new().metadata("id", Value::Null).build();
        assert!(!b.id().is_empty());
    }

    #[test]
    fn test_numeric_id_is_kept_as_text() {
        let msg = MessageParts::new().metadata("id", 42).build();
        assert_eq!(msg.id(), "42");
    }

    #[test]
    fn test_round_trip() {
        let msg = MessageParts::new()
            .target("nats:orders.created")
            .target("queue:orders")
            .payload(fields(json!({
                "order": {"id": 7, "lines": [{"sku": "a", "qty": 2.5}], "note": "héllo ✓"},
                "ratio": 0.1,
                "flag": true,
                "none": null
            })))
            .context("trace_id", "t-9")
            .security("classification", json!({"level": [1, 2, {"deep": "x"}]}))
            .token("opaque.jwt.value")
            .tenant("tenant-7")
            .build();

        let bytes = msg.to_bytes().unwrap();
        let decoded = UniversalMessage::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.token(), Some("opaque.jwt.value"));
        assert_eq!(decoded.tenant_id(), "tenant-7");
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::from),
            (-1e12f64..1e12).prop_map(Value::from),
            "[a-z0-9 é✓\"\\\\]{0,8}".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 32, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z_]{1,6}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    fn arb_fields() -> impl Strategy<Value = Fields> {
        prop::collection::btree_map("[a-z_]{1,6}", arb_value(), 0..5)
            .prop_map(|m| m.into_iter().collect())
    }

    prop_compose! {
        fn arb_parts()(
            metadata in arb_fields(),
            routing in arb_fields(),
            payload in arb_fields(),
            context in arb_fields(),
            security in arb_fields(),
            id in prop::option::of("[a-z0-9-]{0,12}"),
            timestamp in prop::option::of("2024-0[1-9]-1[0-9]T0[0-9]:00:00\\.000000Z"),
            tenant in prop::option::of("[a-z-]{0,8}"),
        ) -> MessageParts {
            let mut parts = MessageParts {
                metadata,
                routing,
                payload,
                context,
                security,
                tenant_id: tenant,
            };
            if let Some(id) = id {
                parts.metadata.insert("id".into(), Value::String(id));
            }
            if let Some(ts) = timestamp {
                parts.metadata.insert("timestamp".into(), Value::String(ts));
            }
            parts
        }
    }

    proptest! {
        #[test]
        fn prop_bytes_round_trip(parts in arb_parts()) {
            let msg = parts.build();
            let decoded = UniversalMessage::from_bytes(&msg.to_bytes().unwrap()).unwrap();
            prop_assert_eq!(decoded, msg);
        }

        #[test]
        fn prop_stamping_is_idempotent(parts in arb_parts()) {
            let msg = parts.build();
            prop_assert!(!msg.id().is_empty());
            prop_assert!(!msg.timestamp().is_empty());
            prop_assert!(!msg.tenant_id().is_empty());
            let restamped = UniversalMessage::new(msg.clone().into_parts());
            prop_assert_eq!(restamped, msg);
        }

        #[test]
        fn prop_caller_identity_is_kept(id in "[a-z0-9]{1,12}", tenant in "[a-z]{1,8}") {
            let msg = MessageParts::new().metadata("id", id.as_str()).tenant(tenant.as_str()).build();
            prop_assert_eq!(msg.id(), id.as_str());
            prop_assert_eq!(msg.tenant_id(), tenant.as_str());
        }
    }

    #[test]
    fn test_into_parts_preserves_identity() {
        let msg = MessageParts::new().target("a:b").build();
        let rebuilt = msg.clone().into_parts().context("hop", 2).build();
        assert_eq!(rebuilt.id(), msg.id());
        assert_eq!(rebuilt.timestamp(), msg.timestamp());
        assert_ne!(rebuilt, msg);
    }

    #[test]
    fn test_decode_missing_fields_defaults() {
        let msg = UniversalMessage::from_bytes(br#"{"payload": {"k": 1}}"#).unwrap();
        assert_eq!(msg.payload().get("k"), Some(&json!(1)));
        assert_eq!(msg.tenant_id(), DEFAULT_TENANT);
        assert!(!msg.id().is_empty());
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(UniversalMessage::from_bytes(b"not json").is_err());
        assert!(UniversalMessage::from_bytes(b"[1,2,3]").is_err());
        assert!(UniversalMessage::from_bytes(br#"{"payload": 5}"#).is_err());
        assert!(UniversalMessage::from_bytes(br#"{"unexpected": {}}"#).is_err());
    }

    #[test]
    fn test_targets_must_be_strings() {
        let mut parts = MessageParts::new();
        parts.routing.insert("targets".into(), json!(["a:b", 3]));
        let err = parts.build().targets().unwrap_err();
        assert!(matches!(err, RoutingError::MalformedAddress(ref s) if s == "3"));

        let mut parts = MessageParts::new();
        parts.routing.insert("targets".into(), json!("a:b"));
        assert!(parts.build().targets().is_err());
    }
}
