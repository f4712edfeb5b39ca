//! Cryptographic primitives backing association and reconnection: HMAC-SHA256
//! challenge/response, CSPRNG salts and keys, and AES-GCM sealing of the
//! out-of-band verification payload.
//!
//! The truncate-then-compare idiom here mirrors the infrastructure HMAC tag
//! in the teacher broadcaster (`compute_tag::<N>` / `verify_infra`), generalized
//! from a fixed 8-byte infra tag to the 3-byte reconnection tag this protocol
//! uses.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Nonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::error::{CoreError, CoreResult};

type HmacSha256 = Hmac<Sha256>;

/// Fills `buf` with cryptographically secure random bytes.
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}

pub fn random_array<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}

/// Computes HMAC-SHA256(key, data), returning the full 32-byte tag.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    let result = mac.finalize().into_bytes();
    let mut out = [0u8; 32];
    out.copy_from_slice(&result);
    out
}

/// Truncates a tag to its first `N` bytes.
pub fn truncate<const N: usize>(tag: &[u8; 32]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&tag[..N]);
    out
}

/// Computes HMAC-SHA256(key, data) and truncates it to `N` bytes in one step,
/// matching the teacher's `compute_tag::<N>` helper.
pub fn compute_tag<const N: usize>(key: &[u8], data: &[u8]) -> [u8; N] {
    truncate::<N>(&hmac_sha256(key, data))
}

/// Verifies an HMAC-SHA256 tag in constant time.
pub fn verify_tag(key: &[u8], data: &[u8], tag: &[u8]) -> bool {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.verify_slice(tag).is_ok()
}

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Seals `plaintext` with AES-128-GCM under `key`/`nonce`, returning
/// ciphertext with the 16-byte authentication tag appended. `nonce` must be
/// exactly 12 bytes.
pub fn aes_gcm_seal(key: &[u8; 16], nonce: &[u8], plaintext: &[u8]) -> CoreResult<Vec<u8>> {
    if nonce.len() != NONCE_LEN {
        return Err(CoreError::InvalidNonce { len: nonce.len() });
    }
    let cipher = Aes128Gcm::new_from_slice(key).map_err(|_| CoreError::VerificationCodeFailed)?;
    let nonce = Nonce::from_slice(nonce);
    cipher
        .encrypt(nonce, Payload { msg: plaintext, aad: &[] })
        .map_err(CoreError::from)
}

/// Opens a ciphertext produced by [`aes_gcm_seal`]. Fails with
/// `InvalidNonce` if `nonce` is not 12 bytes, `InvalidDataSize` if
/// `ciphertext` is shorter than the authentication tag, or
/// `AuthenticationFailed` if the tag does not verify.
pub fn aes_gcm_open(key: &[u8; 16], nonce: &[u8], ciphertext: &[u8]) -> CoreResult<Vec<u8>> {
    if nonce.len() != NONCE_LEN {
        return Err(CoreError::InvalidNonce { len: nonce.len() });
    }
    if ciphertext.len() < TAG_LEN {
        return Err(CoreError::InvalidDataSize);
    }
    let cipher = Aes128Gcm::new_from_slice(key).map_err(|_| CoreError::VerificationCodeFailed)?;
    let nonce = Nonce::from_slice(nonce);
    cipher
        .decrypt(nonce, Payload { msg: ciphertext, aad: &[] })
        .map_err(CoreError::from)
}
