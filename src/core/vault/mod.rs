pub mod inject;
mod validator;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use hmac::Mac;
use sha2::Sha256;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::core::error::{RuntimeError, RuntimeResult};
use crate::core::store::Store;
use crate::core::store::types::{CredentialStatus, RequiredCredential};

pub use validator::{CredentialValidator, NonEmptyValidator, PrefixValidator};

type HmacSha256 = hmac::Hmac<Sha256>;

pub const VAULT_KEY_ENV: &str = "HOOKWORK_VAULT_KEY";
const NONCE_LEN: usize = 12;

/// A decrypted credential. Debug output never shows the value.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue([REDACTED])")
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedCredential {
    pub requirement: RequiredCredential,
    pub secret: SecretValue,
}

/// Credentials decrypted for a single dispatch. Dropped once the call ends.
#[derive(Debug, Clone, Default)]
pub struct ResolvedCredentials {
    entries: Vec<ResolvedCredential>,
}

impl ResolvedCredentials {
    pub fn new(entries: Vec<ResolvedCredential>) -> Self {
        Self { entries }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResolvedCredential> {
        self.entries.iter()
    }

    pub fn providers(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|e| e.requirement.provider.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every form a secret can take in output: raw, rendered through its
    /// template, and both of those as they appear inside a JSON string.
    /// Longest first so a rendered value is not left half-replaced.
    fn needles(&self) -> Vec<String> {
        let mut needles: Vec<String> = Vec::new();
        for entry in &self.entries {
            let raw = entry.secret.expose();
            if raw.is_empty() {
                continue;
            }
            let rendered = inject::render_template(&entry.requirement.format_template, raw);
            for form in [rendered, raw.to_string()] {
                if let Ok(quoted) = serde_json::to_string(&form) {
                    let escaped = &quoted[1..quoted.len() - 1];
                    if escaped != form {
                        needles.push(escaped.to_string());
                    }
                }
                needles.push(form);
            }
        }
        needles.retain(|n| !n.is_empty());
        needles.sort_by_key(|n| std::cmp::Reverse(n.len()));
        needles
    }

    /// Length in bytes of the longest form a secret can take in output.
    pub fn longest_needle(&self) -> usize {
        self.needles().first().map(String::len).unwrap_or(0)
    }

    /// Replace every secret, raw or rendered through its template, with a
    /// placeholder.
    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for needle in self.needles() {
            if out.contains(&needle) {
                out = out.replace(&needle, "[REDACTED]");
            }
        }
        out
    }

    /// Scrub every string leaf and object key. Works on the decoded tree so
    /// secrets with JSON-escaped characters are still matched.
    pub fn redact_value(&self, value: serde_json::Value) -> serde_json::Value {
        use serde_json::Value;
        if self.entries.is_empty() {
            return value;
        }
        match value {
            Value::String(text) => Value::String(self.redact(&text)),
            Value::Array(items) => {
                Value::Array(items.into_iter().map(|v| self.redact_value(v)).collect())
            }
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (self.redact(&k), self.redact_value(v)))
                    .collect(),
            ),
            other => other,
        }
    }
}

/// Outcome of resolving an agent's requirements for one user.
#[derive(Debug, Default)]
pub struct Resolution {
    pub resolved: ResolvedCredentials,
    pub missing: Vec<String>,
}

/// Derive a 256-bit key from machine identifiers: HMAC-SHA256 over hostname
/// and user name, keyed with a fixed label. Stable across restarts on one
/// machine and account.
fn derive_machine_key() -> RuntimeResult<[u8; 32]> {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown-host".to_string());
    let username = whoami::username();
    let input = format!("{}{}", hostname, username);

    let mut mac = <HmacSha256 as Mac>::new_from_slice(b"hookwork-vault-v1")
        .map_err(|e| anyhow::anyhow!("HMAC key setup failed: {}", e))?;
    mac.update(input.as_bytes());
    let bytes = mac.finalize().into_bytes();

    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

fn decode_key(encoded: &str) -> RuntimeResult<[u8; 32]> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| RuntimeError::Validation(format!("{} is not base64: {}", VAULT_KEY_ENV, e)))?;
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| {
        RuntimeError::Validation(format!(
            "{} must decode to 32 bytes (got {})",
            VAULT_KEY_ENV,
            bytes.len()
        ))
    })
}

/// Fresh random key, base64 encoded, for `hookwork keygen`.
pub fn generate_key() -> String {
    let key: [u8; 32] = rand::random();
    base64::engine::general_purpose::STANDARD.encode(key)
}

/// Process-wide credential vault over the `credentials` table.
pub struct CredentialVault {
    store: Store,
    cipher: Aes256Gcm,
    validators: HashMap<String, Vec<Arc<dyn CredentialValidator>>>,
    default_validator: Arc<dyn CredentialValidator>,
}

impl CredentialVault {
    pub fn new(store: Store, key: [u8; 32]) -> Self {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        Self {
            store,
            cipher,
            validators: HashMap::new(),
            default_validator: Arc::new(NonEmptyValidator),
        }
    }

    /// Key from `HOOKWORK_VAULT_KEY` when set, else the machine-bound key.
    pub fn from_env(store: Store) -> RuntimeResult<Self> {
        let key = match std::env::var(VAULT_KEY_ENV) {
            Ok(encoded) if !encoded.trim().is_empty() => decode_key(&encoded)?,
            _ => {
                debug!("{} not set, deriving machine-bound vault key", VAULT_KEY_ENV);
                derive_machine_key()?
            }
        };
        Ok(Self::new(store, key))
    }

    pub fn register_validator(
        &mut self,
        provider: impl Into<String>,
        validator: Arc<dyn CredentialValidator>,
    ) {
        self.validators
            .entry(provider.into())
            .or_default()
            .push(validator);
    }

    pub fn with_prefix_rules(mut self, prefixes: &HashMap<String, String>) -> Self {
        for (provider, prefix) in prefixes {
            self.register_validator(provider.clone(), Arc::new(PrefixValidator::new(prefix)));
        }
        self
    }

    /// Encrypt a plaintext value. Returns base64(nonce || ciphertext).
    pub fn encrypt(&self, plaintext: &str) -> RuntimeResult<String> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| anyhow::anyhow!("credential encryption failed"))?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(base64::engine::general_purpose::STANDARD.encode(&combined))
    }

    /// Decrypt a base64(nonce || ciphertext) blob.
    pub fn decrypt(&self, encoded: &str) -> RuntimeResult<SecretValue> {
        let combined = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| RuntimeError::CredentialCorrupt("blob is not valid base64".into()))?;

        if combined.len() <= NONCE_LEN {
            return Err(RuntimeError::CredentialCorrupt("blob is too short".into()));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self.cipher.decrypt(nonce, ciphertext).map_err(|_| {
            RuntimeError::CredentialCorrupt("authentication failed (wrong key or tampered blob)".into())
        })?;

        String::from_utf8(plaintext)
            .map(SecretValue)
            .map_err(|_| RuntimeError::CredentialCorrupt("plaintext is not UTF-8".into()))
    }

    pub fn validate(&self, provider: &str, plaintext: &str) -> RuntimeResult<()> {
        self.default_validator.validate(provider, plaintext)?;
        if let Some(rules) = self.validators.get(provider) {
            for rule in rules {
                rule.validate(provider, plaintext)?;
            }
        }
        Ok(())
    }

    pub async fn store_credential(
        &self,
        user_id: &str,
        provider: &str,
        plaintext: &str,
    ) -> RuntimeResult<()> {
        if user_id.trim().is_empty() || provider.trim().is_empty() {
            return Err(RuntimeError::Validation(
                "user and provider must not be empty".into(),
            ));
        }
        self.validate(provider, plaintext)?;
        let blob = self.encrypt(plaintext)?;
        self.store.put_credential(user_id, provider, &blob).await
    }

    /// Required providers the user has no active credential for. Does not
    /// decrypt anything.
    pub async fn missing_providers(
        &self,
        user_id: &str,
        requirements: &[RequiredCredential],
    ) -> RuntimeResult<Vec<String>> {
        let active = self.store.active_providers(user_id).await?;
        Ok(requirements
            .iter()
            .filter(|r| r.required && !active.contains(&r.provider))
            .map(|r| r.provider.clone())
            .collect())
    }

    /// Decrypt every credential the requirements name. Required providers
    /// without an active credential are reported in `missing`; optional ones
    /// are skipped silently.
    pub async fn resolve(
        &self,
        user_id: &str,
        requirements: &[RequiredCredential],
    ) -> RuntimeResult<Resolution> {
        let mut resolution = Resolution::default();
        let mut entries = Vec::new();
        for requirement in requirements {
            let record = self
                .store
                .get_credential(user_id, &requirement.provider)
                .await?;
            match record {
                Some(record) if record.status == CredentialStatus::Active => {
                    let secret = self.decrypt(&record.encrypted_blob).map_err(|e| match e {
                        RuntimeError::CredentialCorrupt(reason) => RuntimeError::CredentialCorrupt(
                            format!("provider '{}': {}", requirement.provider, reason),
                        ),
                        other => other,
                    })?;
                    entries.push(ResolvedCredential {
                        requirement: requirement.clone(),
                        secret,
                    });
                }
                _ if requirement.required => resolution.missing.push(requirement.provider.clone()),
                _ => {}
            }
        }
        resolution.resolved = ResolvedCredentials::new(entries);
        Ok(resolution)
    }
}

#[cfg(test)]
pub fn test_vault(store: Store) -> CredentialVault {
    CredentialVault::new(store, [7u8; 32])
}

#[cfg(test)]
pub fn required(provider: &str, template: &str) -> RequiredCredential {
    RequiredCredential {
        provider: provider.to_string(),
        required: true,
        injection_method: crate::core::store::types::InjectionMethod::Header,
        key: None,
        format_template: template.to_string(),
    }
}
