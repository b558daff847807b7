#![forbid(unsafe_code)]

use thiserror::Error;

/// bcrypt only looks at the first 72 bytes of its input.
pub const BCRYPT_MAX_PASSWORD_BYTES: usize = 72;

#[derive(Debug, Error)]
pub enum PasswordError {
	#[error("password must not be empty")]
	Empty,
	#[error("bcrypt: {0}")]
	Bcrypt(#[from] bcrypt::BcryptError),
}

/// Result of checking a password against a stored credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordCheck {
	Valid,
	/// Matched a legacy plain-text credential; caller should store a fresh hash.
	ValidNeedsUpgrade,
	Invalid,
}

impl PasswordCheck {
	pub fn is_valid(self) -> bool {
		!matches!(self, PasswordCheck::Invalid)
	}
}

#[derive(Debug, Clone, Copy)]
pub struct PasswordHasher {
	cost: u32,
}

impl Default for PasswordHasher {
	fn default() -> Self {
		Self {
			cost: bcrypt::DEFAULT_COST,
		}
	}
}

impl PasswordHasher {
	pub fn new(cost: u32) -> Self {
		Self { cost }
	}

	pub fn cost(&self) -> u32 {
		self.cost
	}

	pub fn hash(&self, password: &str) -> Result<String, PasswordError> {
		if password.is_empty() {
			return Err(PasswordError::Empty);
		}
		Ok(bcrypt::hash(truncate_password(password), self.cost)?)
	}

	/// Verify `password` against `stored`, which is either a bcrypt hash or a
	/// legacy plain-text value written before hashing was introduced.
	pub fn verify(&self, password: &str, stored: &str) -> Result<PasswordCheck, PasswordError> {
		let password = truncate_password(password);

		if is_bcrypt_hash(stored) {
			return Ok(if bcrypt::verify(password, stored)? {
				PasswordCheck::Valid
			} else {
				PasswordCheck::Invalid
			});
		}

		if !stored.is_empty() && constant_time_eq(password.as_bytes(), stored.as_bytes()) {
			Ok(PasswordCheck::ValidNeedsUpgrade)
		} else {
			Ok(PasswordCheck::Invalid)
		}
	}
}

/// Cut `password` to at most [`BCRYPT_MAX_PASSWORD_BYTES`] without splitting a char.
pub fn truncate_password(password: &str) -> &str {
	if password.len() <= BCRYPT_MAX_PASSWORD_BYTES {
		return password;
	}
	let mut end = BCRYPT_MAX_PASSWORD_BYTES;
	while !password.is_char_boundary(end) {
		end -= 1;
	}
	&password[..end]
}

pub fn is_bcrypt_hash(stored: &str) -> bool {
	["$2a$", "$2b$", "$2x$", "$2y$"].iter().any(|p| stored.starts_with(p))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}
	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}
	diff == 0
}

#[cfg(test)]
mod tests {
	use super::*;

	fn hasher() -> PasswordHasher {
		PasswordHasher::new(4)
	}

	#[test]
	fn hash_then_verify() {
		let h = hasher();
		let stored = h.hash("correct horse").unwrap();
		assert!(is_bcrypt_hash(&stored));
		assert_eq!(h.verify("correct horse", &stored).unwrap(), PasswordCheck::Valid);
		assert_eq!(h.verify("wrong", &stored).unwrap(), PasswordCheck::Invalid);
	}

	#[test]
	fn legacy_plaintext_matches_and_asks_for_upgrade() {
		let h = hasher();
		assert_eq!(h.verify("plain", "plain").unwrap(), PasswordCheck::ValidNeedsUpgrade);
		assert_eq!(h.verify("plain", "other").unwrap(), PasswordCheck::Invalid);
		assert_eq!(h.verify("", "").unwrap(), PasswordCheck::Invalid);
	}

	#[test]
	fn long_passwords_compare_on_first_72_bytes() {
		let h = hasher();
		let base = "a".repeat(72);
		let stored = h.hash(&format!("{base}tail-one")).unwrap();
		assert!(h.verify(&format!("{base}tail-two"), &stored).unwrap().is_valid());
	}

	#[test]
	fn truncation_respects_char_boundaries() {
		let s = format!("{}é", "a".repeat(71));
		assert_eq!(s.len(), 73);
		let t = truncate_password(&s);
		assert_eq!(t.len(), 71);
		assert!(t.chars().all(|c| c == 'a'));
		assert_eq!(truncate_password("short"), "short");
	}

	#[test]
	fn empty_password_is_rejected_for_hashing() {
		assert!(matches!(hasher().hash(""), Err(PasswordError::Empty)));
	}
}
