#![forbid(unsafe_code)]

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use parley_domain::UserId;
use parley_util::secret::SecretString;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::util::time::unix_secs_now;

const JWT_ALG: &str = "HS256";

#[derive(Debug, Error)]
pub enum AuthError {
	#[error("missing token")]
	MissingToken,
	#[error("token signing is not configured")]
	NotConfigured,
	#[error("malformed token: {0}")]
	Malformed(&'static str),
	#[error("unsupported token algorithm: {0}")]
	UnsupportedAlgorithm(String),
	#[error("invalid token signature")]
	BadSignature,
	#[error("token expired")]
	Expired,
	#[error("invalid token subject: {0:?}")]
	InvalidSubject(String),
}

/// Resolves a bearer token to the principal it was issued for.
pub trait TokenVerifier: Send + Sync {
	fn verify(&self, token: &str) -> Result<UserId, AuthError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClaims {
	pub sub: String,
	pub exp: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct JwtHeader {
	alg: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	typ: Option<String>,
}

/// Issues and verifies HS256 JWT access tokens (`sub` = decimal user id).
#[derive(Debug, Clone)]
pub struct JwtAuthority {
	secret: Option<SecretString>,
	ttl: Duration,
}

impl JwtAuthority {
	/// Without a secret every token is rejected and nothing can be issued.
	pub fn new(secret: Option<SecretString>, ttl: Duration) -> Self {
		Self { secret, ttl }
	}

	pub fn is_configured(&self) -> bool {
		self.secret.is_some()
	}

	pub fn ttl(&self) -> Duration {
		self.ttl
	}

	/// Issue an access token for `user` expiring after the configured TTL.
	pub fn issue(&self, user: UserId) -> Result<String, AuthError> {
		let exp = unix_secs_now().saturating_add(self.ttl.as_secs());
		self.issue_with_expiry(user, exp)
	}

	/// Issue an access token with an explicit `exp` (unix seconds).
	pub fn issue_with_expiry(&self, user: UserId, exp: u64) -> Result<String, AuthError> {
		let secret = self.secret.as_ref().ok_or(AuthError::NotConfigured)?;

		let header = JwtHeader {
			alg: JWT_ALG.to_string(),
			typ: Some("JWT".to_string()),
		};
		let claims = AuthClaims {
			sub: user.to_string(),
			exp,
		};

		let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).map_err(|_| AuthError::Malformed("header"))?);
		let claims_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).map_err(|_| AuthError::Malformed("claims"))?);
		let signing_input = format!("{header_b64}.{claims_b64}");

		let sig = sign(signing_input.as_bytes(), secret.expose().as_bytes())?;
		Ok(format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(sig)))
	}

	/// Check signature, algorithm and expiry, returning the claims.
	pub fn decode(&self, token: &str) -> Result<AuthClaims, AuthError> {
		let secret = self.secret.as_ref().ok_or(AuthError::NotConfigured)?;

		let token = token.trim();
		if token.is_empty() {
			return Err(AuthError::MissingToken);
		}

		let parts = token.split('.').collect::<Vec<_>>();
		if parts.len() != 3 {
			return Err(AuthError::Malformed("expected three segments"));
		}
		let (header_b64, claims_b64, sig_b64) = (parts[0], parts[1], parts[2]);

		let header_raw = URL_SAFE_NO_PAD
			.decode(header_b64)
			.map_err(|_| AuthError::Malformed("header encoding"))?;
		let header: JwtHeader = serde_json::from_slice(&header_raw).map_err(|_| AuthError::Malformed("header json"))?;
		if header.alg != JWT_ALG {
			return Err(AuthError::UnsupportedAlgorithm(header.alg));
		}

		let provided_sig = URL_SAFE_NO_PAD
			.decode(sig_b64)
			.map_err(|_| AuthError::Malformed("signature encoding"))?;
		let signing_input = &token[..header_b64.len() + 1 + claims_b64.len()];
		let mut mac = new_mac(secret.expose().as_bytes())?;
		mac.update(signing_input.as_bytes());
		mac.verify_slice(&provided_sig).map_err(|_| AuthError::BadSignature)?;

		let claims_raw = URL_SAFE_NO_PAD
			.decode(claims_b64)
			.map_err(|_| AuthError::Malformed("claims encoding"))?;
		let claims: AuthClaims = serde_json::from_slice(&claims_raw).map_err(|_| AuthError::Malformed("claims json"))?;

		if claims.exp <= unix_secs_now() {
			return Err(AuthError::Expired);
		}

		Ok(claims)
	}
}

impl TokenVerifier for JwtAuthority {
	fn verify(&self, token: &str) -> Result<UserId, AuthError> {
		let claims = self.decode(token)?;
		claims
			.sub
			.parse::<UserId>()
			.map_err(|_| AuthError::InvalidSubject(claims.sub.clone()))
	}
}

fn new_mac(secret: &[u8]) -> Result<Hmac<Sha256>, AuthError> {
	Hmac::<Sha256>::new_from_slice(secret).map_err(|_| AuthError::NotConfigured)
}

fn sign(signing_input: &[u8], secret: &[u8]) -> Result<Vec<u8>, AuthError> {
	let mut mac = new_mac(secret)?;
	mac.update(signing_input);
	Ok(mac.finalize().into_bytes().to_vec())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn authority(secret: &str) -> JwtAuthority {
		JwtAuthority::new(Some(SecretString::new(secret)), Duration::from_secs(3600))
	}

	#[test]
	fn issued_token_verifies_to_its_subject() {
		let auth = authority("s3cret");
		let token = auth.issue(UserId::new(42)).unwrap();
		assert_eq!(token.split('.').count(), 3);
		assert_eq!(auth.verify(&token).unwrap(), UserId::new(42));
	}

	#[test]
	fn rejects_token_signed_with_another_secret() {
		let token = authority("one").issue(UserId::new(1)).unwrap();
		assert!(matches!(authority("two").verify(&token), Err(AuthError::BadSignature)));
	}

	#[test]
	fn rejects_expired_token() {
		let auth = authority("s3cret");
		let token = auth.issue_with_expiry(UserId::new(1), unix_secs_now() - 10).unwrap();
		assert!(matches!(auth.verify(&token), Err(AuthError::Expired)));
	}

	#[test]
	fn rejects_tampered_claims() {
		let auth = authority("s3cret");
		let token = auth.issue(UserId::new(1)).unwrap();
		let parts: Vec<&str> = token.split('.').collect();
		let forged_claims = URL_SAFE_NO_PAD.encode(br#"{"sub":"2","exp":99999999999}"#);
		let forged = format!("{}.{}.{}", parts[0], forged_claims, parts[2]);
		assert!(matches!(auth.verify(&forged), Err(AuthError::BadSignature)));
	}

	#[test]
	fn rejects_non_hs256_header() {
		let auth = authority("s3cret");
		let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
		let claims = URL_SAFE_NO_PAD.encode(br#"{"sub":"1","exp":99999999999}"#);
		let token = format!("{header}.{claims}.");
		assert!(matches!(auth.verify(&token), Err(AuthError::UnsupportedAlgorithm(_))));
	}

	#[test]
	fn rejects_non_numeric_subject() {
		let auth = authority("s3cret");
		let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
		let claims = URL_SAFE_NO_PAD.encode(br#"{"sub":"alice","exp":99999999999}"#);
		let input = format!("{header}.{claims}");
		let sig = URL_SAFE_NO_PAD.encode(sign(input.as_bytes(), b"s3cret").unwrap());
		let token = format!("{input}.{sig}");
		assert!(matches!(auth.verify(&token), Err(AuthError::InvalidSubject(_))));
	}

	#[test]
	fn garbage_and_empty_tokens_are_rejected() {
		let auth = authority("s3cret");
		assert!(matches!(auth.verify(""), Err(AuthError::MissingToken)));
		assert!(matches!(auth.verify("abc"), Err(AuthError::Malformed(_))));
		assert!(matches!(auth.verify("a.b.c"), Err(AuthError::Malformed(_))));
	}

	#[test]
	fn unconfigured_authority_rejects_everything() {
		let auth = JwtAuthority::new(None, Duration::from_secs(60));
		assert!(!auth.is_configured());
		assert!(matches!(auth.issue(UserId::new(1)), Err(AuthError::NotConfigured)));
		assert!(matches!(auth.verify("a.b.c"), Err(AuthError::NotConfigured)));
	}
}
