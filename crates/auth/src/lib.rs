use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;
use wagate_core::apikey::{mask_key, ApiKey, ApiKeyRole};
use wagate_core::audit::{ApiKeyUsageEvent, AuditKind, AuditRecord, AuditSink};
use wagate_core::context::RequestContext;
use wagate_core::error::{Error, ErrorKind, Result};
use wagate_core::repos::ApiKeyRepository;

/// SHA-256 hex of a plaintext key. Only this form is ever stored.
pub fn hash_key(plain: &str) -> String {
    let digest = Sha256::digest(plain.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// 32 cryptographically-random bytes, base64url without padding: 43 chars.
pub fn generate_key() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// 32 random bytes, hex-encoded. Used for webhook secrets.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Resolved caller identity for one request.
#[derive(Debug, Clone)]
pub struct AuthenticatedKey {
    pub id: String,
    pub role: ApiKeyRole,
}

/// Result of key creation. The plaintext leaves this struct exactly once;
/// list/detail responses only ever see the masked form.
#[derive(Debug)]
pub struct CreatedKey {
    pub key: ApiKey,
    pub plaintext: String,
}

pub struct AuthService {
    keys: Arc<dyn ApiKeyRepository>,
    audit: Arc<dyn AuditSink>,
    enabled: bool,
}

impl AuthService {
    pub fn new(keys: Arc<dyn ApiKeyRepository>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            keys,
            audit,
            enabled: true,
        }
    }

    /// Disabling authentication grants every caller admin. Deployment
    /// convenience for local setups only.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Verify a presented plaintext key and emit a usage audit record. The
    /// caller extracts the key from its transport (header or bearer token).
    pub async fn authenticate(
        &self,
        presented: Option<&str>,
        ctx: &RequestContext,
        endpoint: &str,
        method: &str,
        ip: &str,
    ) -> Result<AuthenticatedKey> {
        if !self.enabled {
            return Ok(AuthenticatedKey {
                id: "anonymous".into(),
                role: ApiKeyRole::Admin,
            });
        }

        let plain = presented.unwrap_or("").trim();
        if plain.is_empty() {
            return Err(Error::new(ErrorKind::MissingApiKey, "API key is required"));
        }

        let key = match self.keys.get_by_hash(&hash_key(plain)).await {
            Ok(key) => key,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(request_id = %ctx.request_id, endpoint, "unknown API key presented");
                return Err(Error::new(ErrorKind::InvalidApiKey, "API key is not valid"));
            }
            Err(e) => return Err(e),
        };

        if !key.is_active || key.is_revoked() {
            return Err(Error::new(
                ErrorKind::RevokedApiKey,
                "API key has been revoked",
            ));
        }

        // Best effort; a failed touch must not block the request.
        let mut touched = key.clone();
        touched.last_used_at = Some(Utc::now());
        if let Err(e) = self.keys.update(&touched).await {
            warn!(api_key_id = %key.id, error = %e, "last_used_at update failed");
        }

        self.audit
            .record(AuditRecord::new(
                AuditKind::ApiKeyUsage,
                &key.id,
                &ApiKeyUsageEvent {
                    api_key_id: key.id.clone(),
                    endpoint: endpoint.to_string(),
                    method: method.to_string(),
                    ip: ip.to_string(),
                },
            ))
            .await;

        Ok(AuthenticatedKey {
            id: key.id,
            role: key.role,
        })
    }

    /// Role gate. Strict hierarchy: admin > write > read.
    pub fn authorize(&self, call: &AuthenticatedKey, required: ApiKeyRole) -> Result<()> {
        if call.role.satisfies(required) {
            Ok(())
        } else {
            Err(Error::new(
                ErrorKind::Forbidden,
                format!("requires {} role", required.as_str()),
            ))
        }
    }

    pub async fn create_key(
        &self,
        role: ApiKeyRole,
        description: Option<String>,
        actor: &str,
    ) -> Result<CreatedKey> {
        let plaintext = generate_key();
        let key = ApiKey {
            id: Uuid::new_v4().to_string(),
            key_hash: hash_key(&plaintext),
            role,
            description,
            created_at: Utc::now(),
            last_used_at: None,
            is_active: true,
            revoked_at: None,
            revoked_by: None,
            revocation_reason: None,
        };
        self.keys.create(&key).await?;

        self.audit
            .record(AuditRecord::new(
                AuditKind::ApiKeyCreated,
                actor,
                &serde_json::json!({
                    "api_key_id": key.id,
                    "role": key.role.as_str(),
                    "masked": mask_key(&plaintext),
                }),
            ))
            .await;

        Ok(CreatedKey { key, plaintext })
    }

    /// Revocation is terminal; a second revoke fails with VALIDATION_FAILED.
    pub async fn revoke_key(
        &self,
        id: &str,
        actor: &str,
        reason: Option<String>,
    ) -> Result<ApiKey> {
        let mut key = self.keys.get(id).await?;
        if key.is_revoked() {
            return Err(Error::validation("API key is already revoked"));
        }
        key.is_active = false;
        key.revoked_at = Some(Utc::now());
        key.revoked_by = Some(actor.to_string());
        key.revocation_reason = reason.clone();
        self.keys.update(&key).await?;

        self.audit
            .record(AuditRecord::new(
                AuditKind::ApiKeyRevoked,
                actor,
                &serde_json::json!({
                    "api_key_id": key.id,
                    "reason": reason,
                }),
            ))
            .await;

        Ok(key)
    }

    pub async fn list(&self, page: i64, limit: i64) -> Result<Vec<ApiKey>> {
        let limit = limit.clamp(1, 100);
        let offset = (page.max(1) - 1) * limit;
        self.keys.list(limit, offset).await
    }

    pub async fn details(&self, id: &str) -> Result<ApiKey> {
        self.keys.get(id).await
    }
}
