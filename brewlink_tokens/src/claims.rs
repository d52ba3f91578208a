//! Reading the unverified claims of a JWT
//!
//! The client never validates signatures; the backend does that. The claims
//! are only read to learn when a token expires and whom it identifies.

use aliri_base64::Base64Url;
use brewlink_clock::UnixTime;
use serde::Deserialize;
use thiserror::Error;

/// The subset of JWT claims the client cares about
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct UnverifiedClaims {
    /// Expiration time (`exp`)
    #[serde(default)]
    pub exp: Option<UnixTime>,

    /// Subject (`sub`)
    #[serde(default)]
    pub sub: Option<String>,
}

/// The token is not a well-formed JWT
#[derive(Debug, Error)]
#[error("malformed JWT: {reason}")]
pub struct MalformedJwt {
    reason: &'static str,
}

impl UnverifiedClaims {
    /// Decodes the payload segment of a compact-serialized JWT
    pub fn decode(token: &str) -> Result<Self, MalformedJwt> {
        let mut segments = token.split('.');
        let payload = match (segments.next(), segments.next(), segments.next(), segments.next()) {
            (Some(_), Some(payload), Some(_), None) => payload,
            _ => {
                return Err(MalformedJwt {
                    reason: "expected three segments",
                })
            }
        };

        let raw = Base64Url::from_encoded(payload.trim_end_matches('=')).map_err(|_| {
            MalformedJwt {
                reason: "payload is not base64url",
            }
        })?;

        serde_json::from_slice(raw.as_slice()).map_err(|_| MalformedJwt {
            reason: "payload is not a JSON claims object",
        })
    }
}
