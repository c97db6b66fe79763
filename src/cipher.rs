//! Symmetric encryption of the transferred file
//!
//! The payload is encrypted with AES-128 in ECB mode with PKCS#7 padding
//! and the ciphertext is Base64-encoded once, as a whole. The chunked
//! transport then slices that Base64 text, so the frames on the wire are
//! always printable ASCII.
//!
//! ## Known weakness
//!
//! ECB uses no IV and carries no authentication tag: identical plaintext
//! blocks produce identical ciphertext blocks, and a tampered ciphertext
//! is only caught if it happens to break the padding. This matches the
//! peers this protocol talks to and is kept on purpose; both functions
//! are stateless and take the key explicitly, so concurrent sessions
//! never share cipher state.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit};
use aes::Aes128;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::CryptoError;

/// AES-128 key length in bytes
pub const KEY_LEN: usize = 16;

type Aes128EcbEnc = ecb::Encryptor<Aes128>;
type Aes128EcbDec = ecb::Decryptor<Aes128>;

fn check_key(key: &[u8]) -> Result<(), CryptoError> {
    if key.len() != KEY_LEN {
        return Err(CryptoError::InvalidKeyLength {
            expected: KEY_LEN,
            got: key.len(),
        });
    }
    Ok(())
}

/// Encrypt `plaintext` under a 16-byte key and return Base64 text
pub fn encrypt(plaintext: &[u8], key: &[u8]) -> Result<String, CryptoError> {
    check_key(key)?;
    let cipher =
        Aes128EcbEnc::new_from_slice(key).map_err(|e| CryptoError::CipherInit(e.to_string()))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);
    Ok(STANDARD.encode(ciphertext))
}

/// Decode Base64 text and decrypt it under a 16-byte key
pub fn decrypt(ciphertext: &str, key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    check_key(key)?;
    let raw = STANDARD
        .decode(ciphertext)
        .map_err(|e| CryptoError::MalformedCiphertext(e.to_string()))?;

    if raw.is_empty() || raw.len() % 16 != 0 {
        return Err(CryptoError::MalformedCiphertext(format!(
            "{} bytes is not a whole number of blocks",
            raw.len()
        )));
    }

    let cipher =
        Aes128EcbDec::new_from_slice(key).map_err(|e| CryptoError::CipherInit(e.to_string()))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(&raw)
        .map_err(|_| CryptoError::Decryption)
}
