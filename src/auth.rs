// src/auth.rs
use crate::error::GatewayError;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: usize,
}

/// Extracts the platform user id from a bearer token.
pub fn verify_token(token: &str, secret: &str) -> Result<String, GatewayError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_ref()),
        &Validation::default(),
    )
    .map_err(|e| GatewayError::Unauthorized(e.to_string()))?;
    if data.claims.sub.is_empty() {
        return Err(GatewayError::Unauthorized("token has no subject".to_string()));
    }
    Ok(data.claims.sub)
}

/// Accepts `Bearer <token>` (scheme is case-insensitive).
pub fn user_from_header(header: &str, secret: &str) -> Result<String, GatewayError> {
    let token = header
        .split_once(' ')
        .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
        .map(|(_, token)| token.trim())
        .filter(|token| !token.is_empty())
        .ok_or_else(|| GatewayError::Unauthorized("expected a bearer token".to_string()))?;
    verify_token(token, secret)
}

#[cfg(test)]
pub fn create_token(user_id: &str, secret: &str, exp: usize) -> String {
    use jsonwebtoken::{encode, EncodingKey, Header};

    let claims = Claims {
        sub: user_id.to_string(),
        exp,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_ref()),
    )
    .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret";
    const FAR_FUTURE: usize = 10_000_000_000;

    #[test]
    fn bearer_header_yields_user_id() {
        let token = create_token("user-42", SECRET, FAR_FUTURE);
        let header = format!("Bearer {}", token);
        assert_eq!(user_from_header(&header, SECRET).unwrap(), "user-42");
    }

    #[test]
    fn rejects_wrong_secret_expired_and_malformed_headers() {
        let token = create_token("user-42", SECRET, FAR_FUTURE);
        assert!(verify_token(&token, "other").is_err());

        let expired = create_token("user-42", SECRET, 1);
        assert!(matches!(
            verify_token(&expired, SECRET),
            Err(GatewayError::Unauthorized(_))
        ));

        assert!(user_from_header(&token, SECRET).is_err());
        assert!(user_from_header("Basic abc", SECRET).is_err());
        assert!(user_from_header("Bearer ", SECRET).is_err());
    }
}
