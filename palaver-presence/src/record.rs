//! Records exchanged with the session store.
//!
//! The store speaks `serde_json::Value`; these types are the typed views
//! the engine and the UI boundary work with.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Key of the server-value placeholder object.
pub const SERVER_VALUE_KEY: &str = ".sv";
/// The only server value the store understands.
pub const SERVER_VALUE_TIMESTAMP: &str = "timestamp";

/// Authenticated identity supplied by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub id: String,
    pub email: String,
}

impl SessionIdentity {
    pub fn new(id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
        }
    }
}

/// Advisory liveness of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    Online,
    Offline,
}

/// Placeholder the store replaces with its own clock at execution time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerValue {
    #[serde(rename = ".sv")]
    pub sv: String,
}

/// Timestamp assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerTimestamp {
    /// Milliseconds since the Unix epoch, as resolved by the store.
    Resolved(u64),
    /// Not yet resolved; sent by clients.
    Pending(ServerValue),
}

impl ServerTimestamp {
    /// The placeholder clients send.
    pub fn now() -> Self {
        ServerTimestamp::Pending(ServerValue {
            sv: SERVER_VALUE_TIMESTAMP.to_string(),
        })
    }

    pub fn millis(&self) -> Option<u64> {
        match self {
            ServerTimestamp::Resolved(ms) => Some(*ms),
            ServerTimestamp::Pending(_) => None,
        }
    }
}

/// Whether `value` is the `{".sv": "timestamp"}` placeholder.
pub fn is_timestamp_placeholder(value: &Value) -> bool {
    match value {
        Value::Object(map) => {
            map.len() == 1
                && map.get(SERVER_VALUE_KEY).and_then(Value::as_str) == Some(SERVER_VALUE_TIMESTAMP)
        }
        _ => false,
    }
}

/// Replace every timestamp placeholder inside `value` with `now_ms`.
pub fn resolve_server_values(value: &mut Value, now_ms: u64) {
    if is_timestamp_placeholder(value) {
        *value = Value::from(now_ms);
        return;
    }
    match value {
        Value::Object(map) => map.values_mut().for_each(|v| resolve_server_values(v, now_ms)),
        Value::Array(items) => items.iter_mut().for_each(|v| resolve_server_values(v, now_ms)),
        _ => {}
    }
}

/// Presence record stored at `/status/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub state: Liveness,
    pub last_changed: ServerTimestamp,
}

impl PresenceRecord {
    pub fn online() -> Self {
        Self {
            state: Liveness::Online,
            last_changed: ServerTimestamp::now(),
        }
    }

    pub fn offline() -> Self {
        Self {
            state: Liveness::Offline,
            last_changed: ServerTimestamp::now(),
        }
    }

    pub fn is_online(&self) -> bool {
        self.state == Liveness::Online
    }

    pub fn to_value(&self) -> Value {
        // Plain enums and strings only; serialization cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(value)
    }
}

/// Durable profile stored at `/profiles/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileRecord {
    pub name: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub created_at: Option<ServerTimestamp>,
}

/// Profile as exposed to UI consumers: the record plus identity fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Profile {
    pub uid: String,
    pub email: String,
    pub name: String,
    pub avatar: Option<String>,
    pub created_at: Option<u64>,
}

impl Profile {
    pub fn from_record(identity: &SessionIdentity, record: ProfileRecord) -> Self {
        Self {
            uid: identity.id.clone(),
            email: identity.email.clone(),
            name: record.name,
            avatar: record.avatar,
            created_at: record.created_at.as_ref().and_then(ServerTimestamp::millis),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_presence_record_wire_shape() {
        let v = PresenceRecord::offline().to_value();
        assert_eq!(v, json!({"state": "offline", "last_changed": {".sv": "timestamp"}}));
    }

    #[test]
    fn test_resolved_record_parses() {
        let rec = PresenceRecord::from_value(&json!({"state": "online", "last_changed": 1700})).unwrap();
        assert!(rec.is_online());
        assert_eq!(rec.last_changed.millis(), Some(1700));
    }

    #[test]
    fn test_resolve_server_values_nested() {
        let mut v = json!({
            "a": {".sv": "timestamp"},
            "b": [{"c": {".sv": "timestamp"}}],
            "d": {".sv": "increment"},
            "e": 3
        });
        resolve_server_values(&mut v, 42);
        assert_eq!(v["a"], json!(42));
        assert_eq!(v["b"][0]["c"], json!(42));
        assert_eq!(v["d"], json!({".sv": "increment"}));
        assert_eq!(v["e"], json!(3));
    }

    #[test]
    fn test_profile_from_record() {
        let identity = SessionIdentity::new("u1", "a@example.com");
        let record: ProfileRecord = serde_json::from_value(json!({
            "name": "Ada",
            "createdAt": 10
        }))
        .unwrap();
        let profile = Profile::from_record(&identity, record);
        assert_eq!(profile.uid, "u1");
        assert_eq!(profile.email, "a@example.com");
        assert_eq!(profile.avatar, None);
        assert_eq!(profile.created_at, Some(10));

        let record: ProfileRecord = serde_json::from_value(json!({"name": "Ada"})).unwrap();
        assert_eq!(Profile::from_record(&identity, record).created_at, None);
    }
}
