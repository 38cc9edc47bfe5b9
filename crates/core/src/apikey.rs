use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Strict role ordering: admin > write > read. A required role is satisfied
/// only by itself or a strictly higher role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyRole {
    Read,
    Write,
    Admin,
}

impl ApiKeyRole {
    fn rank(&self) -> u8 {
        match self {
            ApiKeyRole::Read => 0,
            ApiKeyRole::Write => 1,
            ApiKeyRole::Admin => 2,
        }
    }

    pub fn satisfies(&self, required: ApiKeyRole) -> bool {
        self.rank() >= required.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApiKeyRole::Read => "read",
            ApiKeyRole::Write => "write",
            ApiKeyRole::Admin => "admin",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "read" => Some(ApiKeyRole::Read),
            "write" => Some(ApiKeyRole::Write),
            "admin" => Some(ApiKeyRole::Admin),
            _ => None,
        }
    }
}

/// Stored credential. Only the SHA-256 hex of the plaintext is kept; the
/// plaintext leaves the process exactly once, at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub role: ApiKeyRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revocation_reason: Option<String>,
}

impl ApiKey {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    /// Invariant: a revoked key is never active.
    pub fn is_consistent(&self) -> bool {
        self.revoked_at.is_none() || !self.is_active
    }
}

/// Display-safe rendering of a plaintext key: first 8 and last 4 characters
/// with an ellipsis between. Anything shorter than 13 characters masks fully.
pub fn mask_key(plain: &str) -> String {
    if plain.len() < 13 {
        "****".to_string()
    } else {
        format!("{}...{}", &plain[..8], &plain[plain.len() - 4..])
    }
}
