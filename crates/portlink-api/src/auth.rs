//! Admin token validation
//!
//! Admin observers and the management API authenticate with a signed JWT;
//! issuing those tokens (login, user management) lives outside this crate.

use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminClaims {
    pub sub: String,
    pub exp: usize,
}

#[derive(Clone)]
pub struct JwtValidator {
    key: DecodingKey,
}

impl JwtValidator {
    pub fn new(secret: &str) -> Self {
        JwtValidator {
            key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn validate(&self, token: &str) -> Result<AdminClaims, jsonwebtoken::errors::Error> {
        let data = decode::<AdminClaims>(token, &self.key, &Validation::default())?;
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn mint(secret: &str, exp: usize) -> String {
        encode(
            &Header::default(),
            &AdminClaims {
                sub: "admin".to_string(),
                exp,
            },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn valid_token_round_trips() {
        let validator = JwtValidator::new("s3cret");
        let token = mint("s3cret", (chrono::Utc::now().timestamp() + 3600) as usize);
        let claims = validator.validate(&token).unwrap();
        assert_eq!(claims.sub, "admin");
    }

    #[test]
    fn wrong_secret_and_expired_tokens_fail() {
        let validator = JwtValidator::new("s3cret");
        let wrong = mint("other", (chrono::Utc::now().timestamp() + 3600) as usize);
        assert!(validator.validate(&wrong).is_err());

        let expired = mint("s3cret", (chrono::Utc::now().timestamp() - 3600) as usize);
        assert!(validator.validate(&expired).is_err());
    }
}
