//! License session snapshot shared read-only with a run.

use chrono::{DateTime, SecondsFormat, Utc};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{ReconcileError, Result};

pub const HEADER_LICENSE_NUMBER: &str = "X-License-Number";
pub const HEADER_LICENSE_EMAIL: &str = "X-License-Email";
pub const HEADER_APP_VERSION: &str = "X-App-Version";
pub const HEADER_TIMESTAMP: &str = "X-Timestamp";

const INTEGRITY_KEY_SUFFIX: &[u8] = b":integrity";

/// License identity and the secret protecting rate envelopes.
///
/// Owned by the external license subsystem. The pipeline only ever holds an
/// `Arc` to a snapshot and never writes it anywhere.
pub struct SessionContext {
    license_number: String,
    contact: String,
    client_version: String,
    secret: Option<SecretString>,
}

impl SessionContext {
    pub fn new(license_number: impl Into<String>, contact: impl Into<String>) -> Self {
        Self {
            license_number: license_number.into(),
            contact: contact.into(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            secret: None,
        }
    }

    pub fn with_secret(mut self, secret: SecretString) -> Self {
        self.secret = Some(secret);
        self
    }

    pub fn with_client_version(mut self, version: impl Into<String>) -> Self {
        self.client_version = version.into();
        self
    }

    pub fn license_number(&self) -> &str {
        &self.license_number
    }

    pub fn contact(&self) -> &str {
        &self.contact
    }

    pub fn client_version(&self) -> &str {
        &self.client_version
    }

    /// License number safe for logs: first four characters only.
    pub fn masked_license(&self) -> String {
        let prefix: String = self.license_number.chars().take(4).collect();
        format!("{}****", prefix)
    }

    /// Check the identity fields the remote side requires.
    pub fn validate(&self) -> Result<()> {
        if self.license_number.trim().is_empty() {
            return Err(ReconcileError::InvalidSession(
                "license number is empty".to_string(),
            ));
        }
        if self.contact.trim().is_empty() {
            return Err(ReconcileError::InvalidSession(
                "contact is empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Headers identifying the license on every outbound request.
    pub fn identity_headers(&self, now: DateTime<Utc>) -> Vec<(String, String)> {
        vec![
            (
                "User-Agent".to_string(),
                format!("ratesync/{}", self.client_version),
            ),
            (HEADER_LICENSE_NUMBER.to_string(), self.license_number.clone()),
            (HEADER_LICENSE_EMAIL.to_string(), self.contact.clone()),
            (HEADER_APP_VERSION.to_string(), self.client_version.clone()),
            (
                HEADER_TIMESTAMP.to_string(),
                now.to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
        ]
    }

    /// Derive the envelope keys, or `None` if no secret was provisioned.
    pub fn key_material(&self) -> Option<KeyMaterial> {
        let secret = self.secret.as_ref()?;
        let secret = secret.expose_secret().as_bytes();
        if secret.is_empty() {
            return None;
        }

        let mut encryption = Zeroizing::new([0u8; 32]);
        encryption.copy_from_slice(&Sha256::digest(secret));

        let mut hasher = Sha256::new();
        hasher.update(secret);
        hasher.update(INTEGRITY_KEY_SUFFIX);
        let mut integrity = Zeroizing::new([0u8; 32]);
        integrity.copy_from_slice(&hasher.finalize());

        Some(KeyMaterial {
            encryption,
            integrity,
        })
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("license_number", &self.masked_license())
            .field("contact", &self.contact)
            .field("client_version", &self.client_version)
            .field("has_secret", &self.secret.is_some())
            .finish()
    }
}

/// Keys derived from the session secret. Wiped on drop.
pub struct KeyMaterial {
    encryption: Zeroizing<[u8; 32]>,
    integrity: Zeroizing<[u8; 32]>,
}

impl KeyMaterial {
    /// AES-256 key: SHA-256 of the secret.
    pub fn encryption_key(&self) -> &[u8; 32] {
        &self.encryption
    }

    /// HMAC-SHA256 key: SHA-256 of the secret followed by `:integrity`.
    pub fn integrity_key(&self) -> &[u8; 32] {
        &self.integrity
    }
}
