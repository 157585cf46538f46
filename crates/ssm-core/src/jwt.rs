//! Compact RS256 tokens signed inside the token with the issuance key.

use crate::{
    error::{SsmError, SsmResult},
    session::Session,
    signing::{SigningKeys, SigningPurpose},
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use rsa::traits::PublicKeyParts;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_ISSUER: &str = "ssm";
pub const DEFAULT_TTL: Duration = Duration::hours(24);

const HEADER: &str = r#"{"alg":"RS256","typ":"JWT"}"#;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    pub iat: i64,
    pub jti: String,
}

impl Claims {
    /// Claims for `subject` issued now, valid for a day.
    pub fn new(subject: impl Into<String>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            iss: DEFAULT_ISSUER.to_string(),
            sub: subject.into(),
            aud: None,
            exp: (now + DEFAULT_TTL).unix_timestamp(),
            nbf: None,
            iat: now.unix_timestamp(),
            jti: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.iss = issuer.into();
        self
    }

    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.aud = Some(audience.into());
        self
    }

    pub fn expires_in(mut self, ttl: Duration) -> Self {
        self.exp = self.iat + ttl.whole_seconds();
        self
    }

    pub fn not_before(mut self, at: OffsetDateTime) -> Self {
        self.nbf = Some(at.unix_timestamp());
        self
    }
}

/// Serialize, encode and sign `claims` into `header.payload.signature`.
pub fn sign_jwt(session: &Session, keys: &SigningKeys, claims: &Claims) -> SsmResult<String> {
    let payload = serde_json::to_vec(claims).map_err(SsmError::unexpected)?;
    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(HEADER),
        URL_SAFE_NO_PAD.encode(payload)
    );
    let signature = keys.sign(session, SigningPurpose::TokenIssuance, signing_input.as_bytes())?;
    debug!(sub = %claims.sub, jti = %claims.jti, "token issued");
    Ok(format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(signature)))
}

/// Check signature, `exp` and `nbf` against the cached public key. Fails closed.
pub fn verify_jwt(keys: &SigningKeys, token: &str) -> SsmResult<Claims> {
    let public = keys.public_key(SigningPurpose::TokenIssuance);
    let decoding_key = DecodingKey::from_rsa_components(
        &URL_SAFE_NO_PAD.encode(public.n().to_bytes_be()),
        &URL_SAFE_NO_PAD.encode(public.e().to_bytes_be()),
    )
    .map_err(SsmError::unexpected)?;

    let mut validation = Validation::new(Algorithm::RS256);
    validation.leeway = 0;
    validation.validate_exp = true;
    validation.validate_nbf = true;
    validation.validate_aud = false;
    validation.set_required_spec_claims(&["exp"]);

    decode::<Claims>(token, &decoding_key, &validation)
        .map(|data| data.claims)
        .map_err(|err| match err.kind() {
            ErrorKind::ExpiredSignature => SsmError::JwtExpired,
            ErrorKind::ImmatureSignature => SsmError::JwtNotYetValid,
            _ => {
                warn!(error = %err, "token rejected");
                SsmError::JwtInvalid(err.to_string())
            }
        })
}
