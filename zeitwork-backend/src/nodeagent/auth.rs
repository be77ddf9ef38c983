use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// Claims carried by tokens the operator mints for node-agent access.
///
/// Tokens are HS256-signed with the node's `NODE_JWT` secret and expire;
/// the signature check inside jsonwebtoken is constant-time, so no secret
/// material is ever compared with `==`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeClaims {
    /// Caller identity, e.g. `operator` or a reconciler holder id
    pub sub: String,
    /// Expiry as a unix timestamp
    pub exp: i64,
}

/// Validate a bearer token against the node's signing secret
pub fn validate_token(
    token: &str,
    secret: &str,
) -> Result<NodeClaims, jsonwebtoken::errors::Error> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_required_spec_claims(&["exp"]);

    let data = decode::<NodeClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )?;
    Ok(data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn mint(secret: &str, exp_offset_secs: i64) -> String {
        let claims = NodeClaims {
            sub: "operator".to_string(),
            exp: chrono::Utc::now().timestamp() + exp_offset_secs,
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_valid_token_round_trips_claims() {
        let token = mint("node-secret", 3600);
        let claims = validate_token(&token, "node-secret").unwrap();
        assert_eq!(claims.sub, "operator");
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let token = mint("node-secret", 3600);
        assert!(validate_token(&token, "other-secret").is_err());
    }

    #[test]
    fn test_expired_token_is_rejected() {
        // Past the default validation leeway.
        let token = mint("node-secret", -300);
        assert!(validate_token(&token, "node-secret").is_err());
    }

    #[test]
    fn test_garbage_token_is_rejected() {
        assert!(validate_token("not-a-jwt", "node-secret").is_err());
        assert!(validate_token("", "node-secret").is_err());
    }
}
