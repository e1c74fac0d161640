//! Access-token introspection
//!
//! Tokens are JWTs; the connector only needs the `user_id` and token `type`
//! claims, read without signature verification (the control plane is the
//! verifier).

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;

use crate::ApiError;

#[derive(Deserialize)]
struct TokenClaims {
    #[serde(default)]
    user_id: String,
    #[serde(default, rename = "type")]
    token_type: String,
}

fn claims_from_token(access_token: &str) -> Result<TokenClaims, ApiError> {
    let payload = access_token
        .split('.')
        .nth(1)
        .ok_or(ApiError::InvalidToken)?;

    let decoded = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|_| ApiError::InvalidToken)?;

    let claims: TokenClaims =
        serde_json::from_slice(&decoded).map_err(|_| ApiError::InvalidToken)?;

    if claims.user_id.is_empty() {
        return Err(ApiError::InvalidToken);
    }

    Ok(claims)
}

/// Extract the `user_id` claim from an access token.
pub fn user_id_from_token(access_token: &str) -> Result<String, ApiError> {
    Ok(claims_from_token(access_token)?.user_id)
}

/// Derive the principal string recorded in `managed_by` tags:
/// `token:<id>` for service tokens, `user:<id>` otherwise.
pub fn principal_from_token(access_token: &str) -> Result<String, ApiError> {
    let claims = claims_from_token(access_token)?;

    let kind = if claims.token_type == "token" {
        "token"
    } else {
        "user"
    };

    Ok(format!("{}:{}", kind, claims.user_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_token(claims: &str) -> String {
        let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims);
        format!("{header}.{payload}.sig")
    }

    #[test]
    fn reads_user_id_claim() {
        let token = make_token(r#"{"user_id":"u-123","type":"user"}"#);
        assert_eq!(user_id_from_token(&token).unwrap(), "u-123");
        assert_eq!(principal_from_token(&token).unwrap(), "user:u-123");
    }

    #[test]
    fn service_tokens_use_token_prefix() {
        let token = make_token(r#"{"user_id":"t-9","type":"token"}"#);
        assert_eq!(principal_from_token(&token).unwrap(), "token:t-9");
    }

    #[test]
    fn rejects_malformed_tokens() {
        assert!(user_id_from_token("not-a-jwt").is_err());
        assert!(user_id_from_token(&make_token(r#"{"other":1}"#)).is_err());
    }
}
