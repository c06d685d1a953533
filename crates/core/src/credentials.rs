use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use altec_common::AltecError;

/// A short-lived client-facing credential, minted fresh on each refresh — §4.6's
/// "server-side refresh field on the polling response" replacement for a front-end
/// timer.
#[derive(Clone, Debug, Serialize)]
pub struct Credential {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
    iat: i64,
}

/// Mints and inspects session credentials. Object-safe via a hand-boxed future isn't
/// needed here — both operations are synchronous HMAC work, unlike the I/O-bound
/// seams elsewhere in this crate.
pub trait CredentialIssuer: Send + Sync {
    fn issue(&self, subject: &str) -> Result<Credential, AltecError>;

    fn decode_expiry(&self, token: &str) -> Option<DateTime<Utc>>;
}

/// HS256 JWT issuer, grounded on the HMAC-secret JWT idiom used for task authorization
/// elsewhere in the broader example pack (`jsonwebtoken::encode`/`decode` with a
/// base64 HMAC secret) — the teacher itself never mints tokens, so this is imported
/// from the wider corpus rather than generalized from a teacher pattern.
pub struct JwtCredentialIssuer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    ttl: Duration,
}

impl JwtCredentialIssuer {
    pub fn new(hmac_secret: &[u8], ttl: Duration) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(hmac_secret),
            decoding_key: DecodingKey::from_secret(hmac_secret),
            ttl,
        }
    }
}

impl CredentialIssuer for JwtCredentialIssuer {
    fn issue(&self, subject: &str) -> Result<Credential, AltecError> {
        let now = Utc::now();
        let expires_at = now + self.ttl;
        let claims = Claims {
            sub: subject.to_string(),
            exp: expires_at.timestamp(),
            iat: now.timestamp(),
        };
        let token = encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| AltecError::Internal(format!("failed to mint credential: {e}")))?;
        Ok(Credential { token, expires_at })
    }

    fn decode_expiry(&self, token: &str) -> Option<DateTime<Utc>> {
        let data = decode::<Claims>(token, &self.decoding_key, &Validation::default()).ok()?;
        DateTime::from_timestamp(data.claims.exp, 0)
    }
}

/// Decides whether a poll response should carry a refreshed credential: the incoming
/// token expires within two refresh intervals of the Task's `client_refresh_interval`,
/// per §4.6. `Off` policies (class S) never refresh.
pub fn needs_refresh(
    refresh_policy: altec_common::model::RefreshPolicy,
    incoming_expiry: Option<DateTime<Utc>>,
) -> bool {
    let altec_common::model::RefreshPolicy::Every(interval_secs) = refresh_policy else {
        return false;
    };
    let Some(expiry) = incoming_expiry else {
        return true;
    };
    let window = Duration::seconds(interval_secs as i64 * 2);
    expiry - Utc::now() <= window
}

#[cfg(test)]
mod tests {
    use super::*;
    use altec_common::model::RefreshPolicy;

    #[test]
    fn issued_credential_round_trips_expiry() {
        let issuer = JwtCredentialIssuer::new(b"test-secret-key-material", Duration::minutes(30));
        let credential = issuer.issue("task:video-deep:7").unwrap();
        let decoded = issuer.decode_expiry(&credential.token).unwrap();
        assert_eq!(decoded.timestamp(), credential.expires_at.timestamp());
    }

    #[test]
    fn off_policy_never_needs_refresh() {
        assert!(!needs_refresh(RefreshPolicy::Off, None));
    }

    #[test]
    fn missing_incoming_token_always_refreshes_when_policy_is_active() {
        assert!(needs_refresh(RefreshPolicy::Every(600), None));
    }

    #[test]
    fn near_expiry_token_triggers_refresh_within_two_intervals() {
        let soon = Utc::now() + Duration::minutes(15);
        assert!(needs_refresh(RefreshPolicy::Every(600), Some(soon)));

        let far = Utc::now() + Duration::hours(2);
        assert!(!needs_refresh(RefreshPolicy::Every(600), Some(far)));
    }
}
