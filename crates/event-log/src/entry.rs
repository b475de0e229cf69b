use serde::{Deserialize, Serialize};

/// A single security event emitted by the proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: uuid::Uuid,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub kind: SecurityEventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    pub details: serde_json::Value,
}

impl SecurityEvent {
    /// Create a new `SecurityEvent` with an auto-generated UUID v4 and the
    /// current UTC timestamp. `details` must already be scrubbed: violation
    /// tags, rule names, placeholders, and method names are fine; raw secret
    /// material is never allowed in here.
    pub fn new(kind: SecurityEventKind, details: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            kind,
            connection_id: None,
            details,
        }
    }

    /// Attach the originating connection id, consuming and returning `self`
    /// for builder-style usage.
    pub fn with_connection(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }
}

/// The category of security event being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventKind {
    RateLimitExceeded,
    SanitizationBlocked,
    SecretSubstituted,
    UnauthorizedVaultAccess,
    PatternMatch,
    ConnectionOpened,
    ConnectionClosed,
    ConnectionRejected,
    ProxyStarted,
    ProxyStopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&SecurityEventKind::UnauthorizedVaultAccess).unwrap();
        assert_eq!(json, "\"unauthorized_vault_access\"");
    }

    #[test]
    fn connection_id_omitted_when_absent() {
        let event = SecurityEvent::new(
            SecurityEventKind::ProxyStarted,
            serde_json::json!({"version": "test"}),
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("connection_id"));
    }

    #[test]
    fn with_connection_round_trips() {
        let event = SecurityEvent::new(
            SecurityEventKind::RateLimitExceeded,
            serde_json::json!({"scope": "client_minute"}),
        )
        .with_connection("conn-7");

        let json = serde_json::to_string(&event).unwrap();
        let back: SecurityEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.connection_id.as_deref(), Some("conn-7"));
        assert_eq!(back.kind, SecurityEventKind::RateLimitExceeded);
    }
}
