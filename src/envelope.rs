//! Encrypted rate envelopes and their decryption.
//!
//! The rates endpoint answers with one or more items, each an AES-256-CBC
//! ciphertext with its IV and an HMAC-SHA256 tag over `iv || ciphertext`.
//! Items arrive either bare or wrapped in the workflow engine's
//! `{"json": {...}}` item shape, and as a JSON array or a single object.
//!
//! The tag is verified in constant time before any decryption happens, so
//! a tampered item never yields plaintext.

use aes::Aes256;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{ReconcileError, Result};
use crate::session::{KeyMaterial, SessionContext};

type Aes256CbcDec = cbc::Decryptor<Aes256>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Format tag carried by items sealed with [`seal`].
pub const ENVELOPE_FORMAT: &str = "aes-256-cbc+hmac-sha256";

const IV_LEN: usize = 16;

/// One encrypted item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeItem {
    /// Base64 IV, 16 bytes decoded
    pub iv: String,
    /// Base64 ciphertext
    pub encrypted: String,
    /// Base64 HMAC-SHA256 over `iv || ciphertext`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireItem {
    Wrapped { json: EnvelopeItem },
    Bare(EnvelopeItem),
}

impl From<WireItem> for EnvelopeItem {
    fn from(item: WireItem) -> Self {
        match item {
            WireItem::Wrapped { json } => json,
            WireItem::Bare(item) => item,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireBody {
    Many(Vec<WireItem>),
    One(WireItem),
}

/// The encrypted payload returned by a data source. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct EncryptedEnvelope {
    items: Vec<EnvelopeItem>,
}

impl EncryptedEnvelope {
    pub fn from_items(items: Vec<EnvelopeItem>) -> std::result::Result<Self, String> {
        if items.is_empty() {
            return Err("envelope contains no items".to_string());
        }
        Ok(Self { items })
    }

    /// Parse a response body in any of the accepted shapes.
    pub fn parse(body: &str) -> std::result::Result<Self, String> {
        let wire: WireBody =
            serde_json::from_str(body).map_err(|e| format!("unrecognized envelope: {}", e))?;
        let items = match wire {
            WireBody::Many(items) => items.into_iter().map(EnvelopeItem::from).collect(),
            WireBody::One(item) => vec![item.into()],
        };
        Self::from_items(items)
    }

    pub fn items(&self) -> &[EnvelopeItem] {
        &self.items
    }

    /// Serialize as a JSON array of bare items.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.items)?)
    }
}

/// Cleartext SQL recovered from an envelope. Not yet safe to execute.
#[derive(Clone, PartialEq, Eq)]
pub struct DecryptedScript(String);

impl DecryptedScript {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for DecryptedScript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DecryptedScript({} bytes)", self.0.len())
    }
}

/// Turns an envelope into cleartext using the session secret.
pub trait PayloadDecryptor: Send + Sync {
    fn decrypt(
        &self,
        envelope: &EncryptedEnvelope,
        session: &SessionContext,
    ) -> Result<DecryptedScript>;
}

/// AES-256-CBC + HMAC-SHA256 decryptor.
#[derive(Debug, Clone, Copy, Default)]
pub struct AesCbcDecryptor;

fn failed(msg: impl Into<String>) -> ReconcileError {
    ReconcileError::DecryptionFailed(msg.into())
}

fn integrity_tag(keys: &KeyMaterial, iv: &[u8], ciphertext: &[u8]) -> Result<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(keys.integrity_key())
        .map_err(|e| failed(format!("integrity key rejected: {}", e)))?;
    mac.update(iv);
    mac.update(ciphertext);
    Ok(mac)
}

impl AesCbcDecryptor {
    fn decrypt_item(&self, index: usize, item: &EnvelopeItem, keys: &KeyMaterial) -> Result<String> {
        if let Some(format) = &item.format
            && format != ENVELOPE_FORMAT
        {
            return Err(failed(format!(
                "item {}: unsupported envelope format '{}'",
                index, format
            )));
        }

        let iv = BASE64
            .decode(&item.iv)
            .map_err(|e| failed(format!("item {}: invalid IV encoding: {}", index, e)))?;
        if iv.len() != IV_LEN {
            return Err(failed(format!(
                "item {}: IV must be {} bytes, got {}",
                index,
                IV_LEN,
                iv.len()
            )));
        }

        let ciphertext = BASE64
            .decode(&item.encrypted)
            .map_err(|e| failed(format!("item {}: invalid ciphertext encoding: {}", index, e)))?;
        if ciphertext.is_empty() || ciphertext.len() % IV_LEN != 0 {
            return Err(failed(format!(
                "item {}: ciphertext length {} is not a whole number of blocks",
                index,
                ciphertext.len()
            )));
        }

        let tag = item
            .mac
            .as_deref()
            .ok_or_else(|| failed(format!("item {}: missing integrity tag", index)))?;
        let tag = BASE64
            .decode(tag)
            .map_err(|e| failed(format!("item {}: invalid integrity tag encoding: {}", index, e)))?;
        integrity_tag(keys, &iv, &ciphertext)?
            .verify_slice(&tag)
            .map_err(|_| failed(format!("item {}: integrity check failed", index)))?;

        let plaintext = Aes256CbcDec::new_from_slices(keys.encryption_key(), &iv)
            .map_err(|e| failed(format!("item {}: cipher init failed: {}", index, e)))?
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|_| failed(format!("item {}: invalid padding", index)))?;

        String::from_utf8(plaintext)
            .map_err(|_| failed(format!("item {}: plaintext is not valid UTF-8", index)))
    }
}

impl PayloadDecryptor for AesCbcDecryptor {
    #[tracing::instrument(skip_all, fields(items = envelope.items().len()))]
    fn decrypt(
        &self,
        envelope: &EncryptedEnvelope,
        session: &SessionContext,
    ) -> Result<DecryptedScript> {
        let keys = session
            .key_material()
            .ok_or_else(|| failed("session carries no decryption secret"))?;

        let mut script = String::new();
        for (index, item) in envelope.items().iter().enumerate() {
            let part = self.decrypt_item(index, item, &keys).map_err(|e| {
                tracing::warn!(index, error = %e, "Envelope item rejected");
                e
            })?;
            script.push_str(&part);
        }

        tracing::debug!(script_len = script.len(), "Envelope decrypted");
        Ok(DecryptedScript(script))
    }
}

/// Encrypt and tag `plaintext` with the session secret.
///
/// The counterpart of [`AesCbcDecryptor`], used to author demo datasets.
pub fn seal(plaintext: &str, session: &SessionContext, iv: [u8; IV_LEN]) -> Result<EnvelopeItem> {
    let keys = session
        .key_material()
        .ok_or_else(|| failed("session carries no encryption secret"))?;

    let ciphertext = Aes256CbcEnc::new_from_slices(keys.encryption_key(), &iv)
        .map_err(|e| failed(format!("cipher init failed: {}", e)))?
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
    let tag = integrity_tag(&keys, &iv, &ciphertext)?.finalize().into_bytes();

    Ok(EnvelopeItem {
        iv: BASE64.encode(iv),
        encrypted: BASE64.encode(&ciphertext),
        mac: Some(BASE64.encode(tag)),
        format: Some(ENVELOPE_FORMAT.to_string()),
    })
}

/// A fresh IV from a v4 UUID (122 random bits).
pub fn random_iv() -> [u8; IV_LEN] {
    *uuid::Uuid::new_v4().as_bytes()
}
