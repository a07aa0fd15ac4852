use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

/// Normalized identity fields, derived from the identity provider's state.
/// Read-only to the rest of the system; recomputed whenever the provider
/// state changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthInfo {
    pub is_authenticated: bool,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub email: Option<String>,
}

impl AuthInfo {
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Guest flow: a throwaway identity that can provision an instance
    /// without going through the identity provider.
    pub fn guest() -> Self {
        Self {
            is_authenticated: true,
            user_id: Some(format!("guest-{}", Uuid::new_v4())),
            session_id: Some(Uuid::new_v4().to_string()),
            email: None,
        }
    }

    /// Adapt a bearer token issued by the identity provider. The payload is
    /// decoded without signature verification: the token was already
    /// validated by the provider redirect, and every backend call re-checks
    /// it server-side. This adapter only normalizes the claims.
    pub fn from_bearer_token(token: &str) -> Result<Self, AuthError> {
        let payload = token
            .split('.')
            .nth(1)
            .ok_or_else(|| AuthError::MalformedToken("missing payload segment".into()))?;
        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim())
            .map_err(|err| AuthError::MalformedToken(err.to_string()))?;
        let claims: IdentityClaims = serde_json::from_slice(&bytes)
            .map_err(|err| AuthError::MalformedToken(err.to_string()))?;
        Ok(claims.into())
    }

    /// Error out unless this identity can drive provisioning.
    pub fn require_authenticated(&self) -> Result<(&str, &str), AuthError> {
        if !self.is_authenticated {
            return Err(AuthError::NotAuthenticated);
        }
        match (self.user_id.as_deref(), self.session_id.as_deref()) {
            (Some(user), Some(session)) => Ok((user, session)),
            _ => Err(AuthError::NotAuthenticated),
        }
    }
}

/// OIDC-style claims this app cares about.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityClaims {
    pub sub: String,
    #[serde(default)]
    pub sid: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

impl From<IdentityClaims> for AuthInfo {
    fn from(claims: IdentityClaims) -> Self {
        Self {
            is_authenticated: true,
            user_id: Some(claims.sub),
            // Tokens minted before session tracking shipped carry no sid.
            session_id: Some(claims.sid.unwrap_or_else(|| Uuid::new_v4().to_string())),
            email: claims.email,
        }
    }
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("malformed identity token: {0}")]
    MalformedToken(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn token_with_payload(payload: serde_json::Value) -> String {
        let body = URL_SAFE_NO_PAD.encode(payload.to_string());
        format!("eyJhbGciOiJub25lIn0.{body}.sig")
    }

    #[test]
    fn guest_identities_are_authenticated_and_unique() {
        let a = AuthInfo::guest();
        let b = AuthInfo::guest();
        assert!(a.is_authenticated);
        assert!(a.user_id.as_deref().unwrap().starts_with("guest-"));
        assert_ne!(a.user_id, b.user_id);
        assert!(a.require_authenticated().is_ok());
    }

    #[test]
    fn anonymous_identity_is_blocked() {
        let info = AuthInfo::anonymous();
        assert!(matches!(
            info.require_authenticated(),
            Err(AuthError::NotAuthenticated)
        ));
    }

    #[test]
    fn bearer_token_claims_are_normalized() {
        let token = token_with_payload(json!({
            "sub": "user-42",
            "sid": "sess-7",
            "email": "a@example.com",
        }));
        let info = AuthInfo::from_bearer_token(&token).unwrap();
        assert!(info.is_authenticated);
        assert_eq!(info.user_id.as_deref(), Some("user-42"));
        assert_eq!(info.session_id.as_deref(), Some("sess-7"));
        assert_eq!(info.email.as_deref(), Some("a@example.com"));
    }

    #[test]
    fn missing_sid_is_backfilled() {
        let token = token_with_payload(json!({ "sub": "user-42" }));
        let info = AuthInfo::from_bearer_token(&token).unwrap();
        assert!(info.session_id.is_some());
        assert!(info.email.is_none());
    }

    #[test]
    fn garbage_tokens_are_rejected() {
        assert!(AuthInfo::from_bearer_token("nodots").is_err());
        assert!(AuthInfo::from_bearer_token("a.!!!.c").is_err());
        let not_json = format!("h.{}.s", URL_SAFE_NO_PAD.encode("not json"));
        assert!(AuthInfo::from_bearer_token(&not_json).is_err());
    }
}
