//! Envelope encryption for per-order env maps.
//!
//! The env map is serialised to JSON and encrypted to an age x25519
//! recipient. When the job supplies no recipient of its own, an ephemeral
//! identity is generated per order: the public half encrypts, the private
//! half goes into the key store under `keys/<run_id>/<order_num>` and the
//! order record keeps the reference.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::str::FromStr;
use std::time::Duration;

use age::secrecy::ExposeSecret;
use age::x25519::{Identity, Recipient};
use age::{Decryptor, Encryptor};

use ordo_kernel::KernelError;

use crate::keystore::{key_path, KeyStore};

/// Lifetime hint for ephemeral identities in the key store.
const EPHEMERAL_KEY_TTL: Duration = Duration::from_secs(2 * 3600);

/// Ciphertext plus the reference needed to open it again.
#[derive(Clone, Debug)]
pub struct SealedEnvelope {
    pub ciphertext: Vec<u8>,
    /// Key-store path of the ephemeral identity, or the caller-supplied
    /// recipient reference when one was provided.
    pub key_ref: String,
}

/// Encrypt `env` for one order.
///
/// `recipient_ref` is the job's pre-existing recipient (an age public key
/// string); when `None` a fresh identity is generated and stored.
pub async fn seal_env(
    env: &BTreeMap<String, String>,
    recipient_ref: Option<&str>,
    keys: &dyn KeyStore,
    run_id: &str,
    order_num: &str,
) -> Result<SealedEnvelope, KernelError> {
    let plaintext = serde_json::to_vec(env)
        .map_err(|e| KernelError::Crypto(format!("serialise env map: {e}")))?;

    let (recipient, key_ref) = match recipient_ref {
        Some(reference) => {
            let recipient = Recipient::from_str(reference)
                .map_err(|e| KernelError::Crypto(format!("invalid recipient reference: {e}")))?;
            (recipient, reference.to_string())
        }
        None => {
            let identity = Identity::generate();
            let path = key_path(run_id, order_num);
            keys.put(
                &path,
                identity.to_string().expose_secret(),
                EPHEMERAL_KEY_TTL,
            )
            .await?;
            (identity.to_public(), path)
        }
    };

    let encryptor = Encryptor::with_recipients(vec![Box::new(recipient)])
        .ok_or_else(|| KernelError::Crypto("encrypt env map: no recipients".to_string()))?;
    let mut ciphertext = Vec::new();
    let mut writer = encryptor
        .wrap_output(&mut ciphertext)
        .map_err(|e| KernelError::Crypto(format!("encrypt env map: {e}")))?;
    writer
        .write_all(&plaintext)
        .map_err(|e| KernelError::Crypto(format!("encrypt env map: {e}")))?;
    writer
        .finish()
        .map_err(|e| KernelError::Crypto(format!("encrypt env map: {e}")))?;

    Ok(SealedEnvelope {
        ciphertext,
        key_ref,
    })
}

/// Decrypt an envelope with the private identity string (the worker-side
/// half of [`seal_env`]).
pub fn open_env(
    ciphertext: &[u8],
    identity_str: &str,
) -> Result<BTreeMap<String, String>, KernelError> {
    let identity = Identity::from_str(identity_str)
        .map_err(|e| KernelError::Crypto(format!("invalid identity: {e}")))?;
    let decryptor = Decryptor::new(ciphertext)
        .map_err(|e| KernelError::Crypto(format!("decrypt env map: {e}")))?;
    let decryptor = match decryptor {
        Decryptor::Recipients(d) => d,
        Decryptor::Passphrase(_) => {
            return Err(KernelError::Crypto(
                "decrypt env map: unexpected passphrase-encrypted envelope".to_string(),
            ))
        }
    };
    let mut reader = decryptor
        .decrypt(std::iter::once(&identity as &dyn age::Identity))
        .map_err(|e| KernelError::Crypto(format!("decrypt env map: {e}")))?;
    let mut plaintext = Vec::new();
    reader
        .read_to_end(&mut plaintext)
        .map_err(|e| KernelError::Crypto(format!("decrypt env map: {e}")))?;
    serde_json::from_slice(&plaintext)
        .map_err(|e| KernelError::Crypto(format!("decode env map: {e}")))
}
