//! V380 cryptographic primitives: session key derivation, the two-layer
//! password obfuscation used at login, and selective AES-ECB stream
//! decryption.
//!
//! The camera encrypts only part of the media stream — enough to force use
//! of the vendor client without paying for full-bandwidth crypto. Video uses
//! the 64-on/16-off pattern of [`decrypt_video_64_80`]; audio is plain
//! full-block ECB. All operations are stateless over a 16-byte key.

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Block};
use base64::Engine;

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// Session key bytes 4..12, little-endian.
const KEY_MAGIC_A: u64 = 0x618123462C14795C;

/// Session key bytes 12..16, little-endian.
const KEY_MAGIC_B: u32 = 0x82800DF0;

/// Fixed vendor key for the inner password-obfuscation layer.
const PASSWORD_KEY: &[u8; 16] = b"macrovideo+*#!^@";

/// Derive the per-session AES key from the server-assigned handle.
///
/// Two sessions granted the same handle always derive the same key.
pub fn derive_key(handle: u32) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[0..4].copy_from_slice(&handle.to_le_bytes());
    key[4..12].copy_from_slice(&KEY_MAGIC_A.to_le_bytes());
    key[12..16].copy_from_slice(&KEY_MAGIC_B.to_le_bytes());
    key
}

/// Generate the 16-char alphanumeric random key for password obfuscation.
///
/// Rejection-sampled from the OS CSPRNG so every character is uniform.
pub fn generate_random_key() -> [u8; 16] {
    const CHARS: &[u8; 62] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    // Largest multiple of 62 that fits in a byte; values above it would bias the pick.
    const LIMIT: u8 = 248;

    let mut key = [0u8; 16];
    let mut filled = 0;
    while filled < key.len() {
        let mut buf = [0u8; 32];
        getrandom::getrandom(&mut buf).expect("OS CSPRNG failed");
        for b in buf {
            if b < LIMIT && filled < key.len() {
                key[filled] = CHARS[(b % 62) as usize];
                filled += 1;
            }
        }
    }
    key
}

/// Obfuscate the device password for the login request.
///
/// Two AES-ECB layers with PKCS#7 padding: the inner layer under the fixed
/// vendor key, the outer under the per-login random key. Returns base64.
pub fn encrypt_password(password: &str, random_key: &[u8; 16]) -> String {
    let inner = ecb_encrypt_padded(PASSWORD_KEY, password.as_bytes());
    let outer = ecb_encrypt_padded(random_key, &inner);
    base64::engine::general_purpose::STANDARD.encode(outer)
}

/// PKCS#7-pad `data` to a block multiple and encrypt it under `key`.
fn ecb_encrypt_padded(key: &[u8; 16], data: &[u8]) -> Vec<u8> {
    let cipher = Aes128::new(key.into());
    let pad = BLOCK_SIZE - data.len() % BLOCK_SIZE;
    let mut buf = Vec::with_capacity(data.len() + pad);
    buf.extend_from_slice(data);
    buf.resize(data.len() + pad, pad as u8);
    for block in buf.chunks_exact_mut(BLOCK_SIZE) {
        cipher.encrypt_block(Block::from_mut_slice(block));
    }
    buf
}

/// Decrypt a video access unit in place using the 64-on/16-off pattern.
///
/// Every 80-byte window: the first four AES blocks are ciphertext, the next
/// 16 bytes are plaintext. A final window shorter than 64 bytes passes
/// through unchanged, as does the 0-16 byte tail after a decrypted run. The
/// pass-through bytes keep start codes scannable without the key.
pub fn decrypt_video_64_80(key: &[u8; 16], data: &mut [u8]) {
    let cipher = Aes128::new(key.into());
    let mut pos = 0;
    while pos + 64 <= data.len() {
        for block in data[pos..pos + 64].chunks_exact_mut(BLOCK_SIZE) {
            cipher.decrypt_block(Block::from_mut_slice(block));
        }
        // 16 bytes stay in the clear after each decrypted run
        pos += 64 + BLOCK_SIZE;
    }
}

/// Decrypt an audio payload in place: every complete AES block, with the
/// `len % 16` tail passing through unchanged.
pub fn decrypt_audio(key: &[u8; 16], data: &mut [u8]) {
    let cipher = Aes128::new(key.into());
    for block in data.chunks_exact_mut(BLOCK_SIZE) {
        cipher.decrypt_block(Block::from_mut_slice(block));
    }
}
