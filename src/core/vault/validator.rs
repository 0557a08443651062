use crate::core::error::{RuntimeError, RuntimeResult};

/// Provider-specific check run before a credential is encrypted and stored.
/// Error messages must not echo the value.
pub trait CredentialValidator: Send + Sync {
    fn validate(&self, provider: &str, value: &str) -> RuntimeResult<()>;
}

pub struct NonEmptyValidator;

impl CredentialValidator for NonEmptyValidator {
    fn validate(&self, provider: &str, value: &str) -> RuntimeResult<()> {
        if value.trim().is_empty() {
            return Err(RuntimeError::Validation(format!(
                "credential for '{}' must not be empty",
                provider
            )));
        }
        Ok(())
    }
}

pub struct PrefixValidator {
    prefix: String,
}

impl PrefixValidator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl CredentialValidator for PrefixValidator {
    fn validate(&self, provider: &str, value: &str) -> RuntimeResult<()> {
        if !value.starts_with(&self.prefix) {
            return Err(RuntimeError::Validation(format!(
                "credential for '{}' must start with '{}'",
                provider, self.prefix
            )));
        }
        Ok(())
    }
}
