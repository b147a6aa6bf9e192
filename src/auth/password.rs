//! Password hashing and registration input rules
//!
//! Hashes are Argon2id PHC strings with a random salt per password.

use argon2::password_hash::{rand_core::OsRng, PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use thiserror::Error;

/// Minimum password length
const MIN_PASSWORD_LENGTH: usize = 8;

/// Password hashing errors
#[derive(Error, Debug)]
pub enum PasswordError {
    #[error("Hashing failed: {0}")]
    HashingFailed(String),

    #[error("Invalid password hash: {0}")]
    InvalidHash(String),
}

/// Hash a password with Argon2 and a random salt
pub fn hash_password(password: &str) -> Result<String, PasswordError> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| PasswordError::HashingFailed(e.to_string()))?;
    Ok(hash.to_string())
}

/// Verify a password against a stored PHC string
pub fn verify_password(password: &str, phc: &str) -> Result<bool, PasswordError> {
    let parsed = PasswordHash::new(phc).map_err(|e| PasswordError::InvalidHash(e.to_string()))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

/// Check that a stored hash is a parseable PHC string
pub fn is_valid_hash(phc: &str) -> bool {
    PasswordHash::new(phc).is_ok()
}

/// Validate password strength, returning every rule that failed
pub fn check_password_rules(password: &str) -> Result<(), Vec<String>> {
    let mut problems = Vec::new();

    if password.is_empty() {
        problems.push("Password is required.".to_string());
    }
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        problems.push(format!(
            "Password must be at least {} characters long.",
            MIN_PASSWORD_LENGTH
        ));
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        problems.push("Password must contain at least one uppercase letter.".to_string());
    }
    if !password.chars().any(|c| c.is_ascii_lowercase()) {
        problems.push("Password must contain at least one lowercase letter.".to_string());
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        problems.push("Password must contain at least one digit.".to_string());
    }
    if password.chars().all(|c| c.is_ascii_alphanumeric()) {
        problems.push("Password must contain at least one special character.".to_string());
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(problems)
    }
}

/// Minimal structural email check: `local@domain.tld`, no whitespace
pub fn check_email(email: &str) -> Result<(), String> {
    let email = email.trim();
    if email.is_empty() {
        return Err("Email is required.".to_string());
    }
    if email.chars().any(char::is_whitespace) {
        return Err("Email must not contain whitespace.".to_string());
    }

    match email.split_once('@') {
        Some((local, domain))
            if !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.') =>
        {
            Ok(())
        }
        _ => Err("Email is not a valid email address.".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let hash = hash_password("Str0ng!pass").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("Str0ng!pass", &hash).unwrap());
        assert!(!verify_password("wrong", &hash).unwrap());
    }

    #[test]
    fn test_hashes_are_salted() {
        let a = hash_password("Str0ng!pass").unwrap();
        let b = hash_password("Str0ng!pass").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_invalid_hash() {
        assert!(verify_password("x", "not-a-phc-string").is_err());
        assert!(!is_valid_hash("plain"));
    }

    #[test]
    fn test_password_rules() {
        assert!(check_password_rules("Str0ng!pass").is_ok());

        let problems = check_password_rules("short").unwrap_err();
        assert!(problems.iter().any(|p| p.contains("8 characters")));
        assert!(problems.iter().any(|p| p.contains("uppercase")));
        assert!(problems.iter().any(|p| p.contains("digit")));
        assert!(problems.iter().any(|p| p.contains("special")));

        let problems = check_password_rules("ALLUPPER1!").unwrap_err();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("lowercase"));
    }

    #[test]
    fn test_email_check() {
        assert!(check_email("ada@example.com").is_ok());
        assert!(check_email("").is_err());
        assert!(check_email("ada").is_err());
        assert!(check_email("ada@localhost").is_err());
        assert!(check_email("a b@example.com").is_err());
        assert!(check_email("@example.com").is_err());
        assert!(check_email("a@b@example.com").is_err());
    }
}
