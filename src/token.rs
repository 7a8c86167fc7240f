use crate::config::TokenBackendConfig;
use crate::error::{Code, Error};
use crate::store::CounterStore;
use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// What a token resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    pub user_id: String,
}

/// Persistence seam behind the per-request token handle. `get` fails
/// closed: any signature, format, or expiry mismatch reads as absent.
#[async_trait]
pub trait TokenStorage: Send + Sync {
    /// Persist a payload for `max_age` and return the token value handed
    /// to the client.
    async fn set(&self, payload: &AuthPayload, max_age: Duration) -> Result<String, Error>;
    async fn get(&self, value: &str) -> Result<Option<AuthPayload>, Error>;
    /// Revoke a previously issued value where the backend supports it.
    async fn delete(&self, value: &str) -> Result<(), Error>;
}

pub fn storage_from_config(
    config: &TokenBackendConfig,
    store: &Arc<dyn CounterStore>,
) -> Arc<dyn TokenStorage> {
    match config {
        TokenBackendConfig::Signed { secret } => Arc::new(SignedStorage::new(secret)),
        TokenBackendConfig::Reference => Arc::new(ReferenceStorage::new(store.clone())),
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SignedClaims {
    exp: i64,
    #[serde(rename = "userId")]
    user_id: String,
}

/// Self-contained backend: the payload travels inside an HS256-signed blob
/// with an absolute expiry. No store round-trip, and no revocation before
/// expiry short of rotating the secret.
pub struct SignedStorage {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl SignedStorage {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

#[async_trait]
impl TokenStorage for SignedStorage {
    async fn set(&self, payload: &AuthPayload, max_age: Duration) -> Result<String, Error> {
        let claims = SignedClaims {
            exp: chrono::Utc::now().timestamp() + max_age.as_secs() as i64,
            user_id: payload.user_id.clone(),
        };

        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|err| Error::with_message(Code::InternalError, err.to_string()))
    }

    async fn get(&self, value: &str) -> Result<Option<AuthPayload>, Error> {
        match jsonwebtoken::decode::<SignedClaims>(value, &self.decoding_key, &self.validation) {
            Ok(token) => Ok(Some(AuthPayload {
                user_id: token.claims.user_id,
            })),
            Err(_) => Ok(None),
        }
    }

    async fn delete(&self, _value: &str) -> Result<(), Error> {
        // Signed tokens stay valid until their absolute expiry; only the
        // transport cookie can be cleared.
        Ok(())
    }
}

const REFERENCE_ID_LEN: usize = 12;

/// Reference backend: a short random opaque id keys the payload in the
/// shared store with a TTL equal to the session lifetime. Deletion is
/// immediate revocation.
pub struct ReferenceStorage {
    store: Arc<dyn CounterStore>,
}

impl ReferenceStorage {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    fn random_id() -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(REFERENCE_ID_LEN)
            .map(char::from)
            .collect()
    }
}

#[async_trait]
impl TokenStorage for ReferenceStorage {
    async fn set(&self, payload: &AuthPayload, max_age: Duration) -> Result<String, Error> {
        let key = Self::random_id();
        let raw = serde_json::to_vec(payload)
            .map_err(|err| Error::with_message(Code::InternalError, err.to_string()))?;

        self.store
            .set(&key, raw, Some(max_age))
            .await
            .map_err(|err| Error::with_message(Code::ThirdPartyError, err.to_string()))?;

        Ok(key)
    }

    async fn get(&self, value: &str) -> Result<Option<AuthPayload>, Error> {
        let raw = self
            .store
            .get(value)
            .await
            .map_err(|err| Error::with_message(Code::ThirdPartyError, err.to_string()))?;
        let Some(raw) = raw else {
            return Ok(None);
        };

        // A payload whose window is already gone must not be trusted.
        let ttl = self
            .store
            .ttl(value)
            .await
            .map_err(|err| Error::with_message(Code::ThirdPartyError, err.to_string()))?;
        match ttl {
            Some(ttl) if !ttl.is_zero() => {}
            _ => return Ok(None),
        }

        Ok(serde_json::from_slice(&raw).ok())
    }

    async fn delete(&self, value: &str) -> Result<(), Error> {
        self.store
            .del(value)
            .await
            .map_err(|err| Error::with_message(Code::ThirdPartyError, err.to_string()))?;
        Ok(())
    }
}
