use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::AppError;
use crate::models::TerminalIdentity;

type HmacSha256 = Hmac<Sha256>;

/// Authenticates a terminal during the connection handshake.
pub trait CredentialVerifier: Send + Sync {
    fn verify(
        &self,
        terminal_id: &str,
        organization_id: &str,
        token: &str,
    ) -> Result<TerminalIdentity, AppError>;
}

/// Per-terminal tokens derived from one shared secret.
///
/// `token = hex(HMAC-SHA256(secret, "{organization_id}:{terminal_id}"))`, so
/// provisioning needs no per-terminal state on the server.
pub struct HmacCredentialVerifier {
    secret: Vec<u8>,
}

impl HmacCredentialVerifier {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Hex-encoded token a correctly provisioned terminal presents.
    pub fn issue_token(&self, terminal_id: &str, organization_id: &str) -> Result<String, AppError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| AppError::Internal(format!("Failed to create HMAC: {}", e)))?;
        mac.update(organization_id.as_bytes());
        mac.update(b":");
        mac.update(terminal_id.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

impl CredentialVerifier for HmacCredentialVerifier {
    fn verify(
        &self,
        terminal_id: &str,
        organization_id: &str,
        token: &str,
    ) -> Result<TerminalIdentity, AppError> {
        if terminal_id.is_empty() || organization_id.is_empty() {
            return Err(AppError::Unauthorized(
                "terminalId and organizationId are required".to_string(),
            ));
        }

        let expected = self.issue_token(terminal_id, organization_id)?;
        if !constant_time_equal(&expected, &token.to_ascii_lowercase()) {
            return Err(AppError::Unauthorized("invalid terminal token".to_string()));
        }

        Ok(TerminalIdentity {
            terminal_id: terminal_id.to_string(),
            organization_id: organization_id.to_string(),
        })
    }
}

/// Compares two strings in constant time to prevent timing attacks
pub fn constant_time_equal(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issued_token_verifies() {
        let verifier = HmacCredentialVerifier::new("secret");
        let token = verifier.issue_token("T1", "org-1").unwrap();
        assert_eq!(token.len(), 64);

        let identity = verifier.verify("T1", "org-1", &token).unwrap();
        assert_eq!(identity.terminal_id, "T1");
        assert_eq!(identity.organization_id, "org-1");

        // Hex case is not significant.
        assert!(verifier.verify("T1", "org-1", &token.to_uppercase()).is_ok());
    }

    #[test]
    fn test_token_is_bound_to_terminal_and_organization() {
        let verifier = HmacCredentialVerifier::new("secret");
        let token = verifier.issue_token("T1", "org-1").unwrap();

        assert!(matches!(
            verifier.verify("T2", "org-1", &token),
            Err(AppError::Unauthorized(_))
        ));
        assert!(matches!(
            verifier.verify("T1", "org-2", &token),
            Err(AppError::Unauthorized(_))
        ));
        assert!(HmacCredentialVerifier::new("other")
            .verify("T1", "org-1", &token)
            .is_err());
    }

    #[test]
    fn test_missing_identity_is_rejected() {
        let verifier = HmacCredentialVerifier::new("secret");
        assert!(verifier.verify("", "org-1", "whatever").is_err());
    }

    #[test]
    fn test_constant_time_equal() {
        assert!(constant_time_equal("abc", "abc"));
        assert!(!constant_time_equal("abc", "abd"));
        assert!(!constant_time_equal("abc", "abcd"));
    }
}
