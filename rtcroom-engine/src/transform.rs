//! Pluggable payload transforms
//!
//! Outbound payloads pass through the room's [`EncryptionDelegate`] before
//! they reach the transport, inbound payloads through the
//! [`DecryptionDelegate`] before delivery. A transform that returns `false`
//! drops that single frame.

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng, Payload},
    Aes256Gcm, Key, Nonce,
};

use crate::error::{EngineError, EngineResult};
use crate::types::{RoomRef, StreamType, UserId};

/// AES-256-GCM nonce size (96 bits / 12 bytes)
const NONCE_SIZE: usize = 12;

/// Identifies whose media a transform is applied to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformContext {
    pub room: RoomRef,
    /// Sender of the media: the local user outbound, the remote user inbound
    pub user_id: UserId,
    pub stream_type: StreamType,
}

pub trait EncryptionDelegate: Send + Sync {
    /// Write the transformed `src` into `dst`; return `false` to drop the frame
    fn encrypt(&self, ctx: &TransformContext, src: &[u8], dst: &mut Vec<u8>) -> bool;
}

pub trait DecryptionDelegate: Send + Sync {
    /// Write the restored `src` into `dst`; return `false` to drop the frame
    fn decrypt(&self, ctx: &TransformContext, src: &[u8], dst: &mut Vec<u8>) -> bool;
}

/// Ready-made symmetric transform
///
/// Layout of a transformed payload is `nonce || ciphertext`. The sender
/// context is bound as associated data so a payload replayed under another
/// user or stream type fails to decrypt.
#[derive(Clone)]
pub struct AesGcmTransform {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for AesGcmTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmTransform")
            .field("cipher", &"[REDACTED]")
            .finish()
    }
}

impl AesGcmTransform {
    /// Create from a 32-byte key
    pub fn new(key_bytes: &[u8]) -> EngineResult<Self> {
        if key_bytes.len() != 32 {
            return Err(EngineError::invalid_parameter(format!(
                "transform key must be exactly 32 bytes, got {}",
                key_bytes.len()
            )));
        }
        let key = Key::<Aes256Gcm>::from_slice(key_bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Create from a 64-character hex string
    pub fn from_hex_key(hex_key: &str) -> EngineResult<Self> {
        let key_bytes = hex::decode(hex_key)
            .map_err(|e| EngineError::invalid_parameter(format!("invalid hex key: {e}")))?;
        Self::new(&key_bytes)
    }

    fn aad(ctx: &TransformContext) -> Vec<u8> {
        format!("{}/{}/{}", ctx.room, ctx.user_id, ctx.stream_type.code()).into_bytes()
    }
}

impl EncryptionDelegate for AesGcmTransform {
    fn encrypt(&self, ctx: &TransformContext, src: &[u8], dst: &mut Vec<u8>) -> bool {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let aad = Self::aad(ctx);
        let payload = Payload { msg: src, aad: &aad };

        match self.cipher.encrypt(Nonce::from_slice(&nonce_bytes), payload) {
            Ok(ciphertext) => {
                dst.clear();
                dst.reserve(NONCE_SIZE + ciphertext.len());
                dst.extend_from_slice(&nonce_bytes);
                dst.extend_from_slice(&ciphertext);
                true
            }
            Err(_) => false,
        }
    }
}

impl DecryptionDelegate for AesGcmTransform {
    fn decrypt(&self, ctx: &TransformContext, src: &[u8], dst: &mut Vec<u8>) -> bool {
        if src.len() <= NONCE_SIZE {
            return false;
        }
        let (nonce_bytes, ciphertext) = src.split_at(NONCE_SIZE);
        let aad = Self::aad(ctx);
        let payload = Payload {
            msg: ciphertext,
            aad: &aad,
        };

        match self.cipher.decrypt(Nonce::from_slice(nonce_bytes), payload) {
            Ok(plaintext) => {
                *dst = plaintext;
                true
            }
            Err(_) => false,
        }
    }
}
