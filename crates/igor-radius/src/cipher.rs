use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use rand::Rng;

use igor_core::{IgorError, Result};

type HmacMd5 = Hmac<Md5>;

/// RFC 2865 User-Password cipher. The plaintext is padded with zeros to a
/// 16 byte boundary; each block is XORed with MD5(secret ∥ previous),
/// where previous is the request authenticator, the optional salt, or the
/// preceding ciphertext block.
pub fn encrypt(
    plaintext: &[u8],
    authenticator: &[u8; 16],
    secret: &str,
    salt: Option<&[u8]>,
) -> Vec<u8> {
    let mut padded = plaintext.to_vec();
    while padded.len() % 16 != 0 || padded.is_empty() {
        padded.push(0);
    }

    let mut out = Vec::with_capacity(padded.len());
    let mut previous: Vec<u8> = {
        let mut seed = authenticator.to_vec();
        if let Some(salt) = salt {
            seed.extend_from_slice(salt);
        }
        seed
    };

    for block in padded.chunks(16) {
        let mut hasher = Md5::new();
        hasher.update(secret.as_bytes());
        hasher.update(&previous);
        let key = hasher.finalize();

        let cipher_block: Vec<u8> = block.iter().zip(key.iter()).map(|(p, k)| p ^ k).collect();
        out.extend_from_slice(&cipher_block);
        previous = cipher_block;
    }

    out
}

/// Inverse of [`encrypt`]. The plaintext keeps its zero padding.
pub fn decrypt(
    ciphertext: &[u8],
    authenticator: &[u8; 16],
    secret: &str,
    salt: Option<&[u8]>,
) -> Result<Vec<u8>> {
    if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
        return Err(IgorError::Decode(format!(
            "ciphertext length {} is not a multiple of 16",
            ciphertext.len()
        )));
    }

    let mut out = Vec::with_capacity(ciphertext.len());
    let mut previous: Vec<u8> = {
        let mut seed = authenticator.to_vec();
        if let Some(salt) = salt {
            seed.extend_from_slice(salt);
        }
        seed
    };

    for block in ciphertext.chunks(16) {
        let mut hasher = Md5::new();
        hasher.update(secret.as_bytes());
        hasher.update(&previous);
        let key = hasher.finalize();

        out.extend(block.iter().zip(key.iter()).map(|(c, k)| c ^ k));
        previous = block.to_vec();
    }

    Ok(out)
}

/// Salted cipher used by vendor attributes such as the MPPE keys. The two
/// byte salt has the high bit of the first byte set. When `withlen`, the
/// first plaintext byte carries the content length.
pub fn encrypt_salted(
    plaintext: &[u8],
    authenticator: &[u8; 16],
    secret: &str,
    withlen: bool,
) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let salt = [rng.gen::<u8>() | 0x80, rng.gen::<u8>()];

    let payload = if withlen {
        let mut payload = Vec::with_capacity(plaintext.len() + 1);
        payload.push(plaintext.len() as u8);
        payload.extend_from_slice(plaintext);
        payload
    } else {
        plaintext.to_vec()
    };

    let mut out = salt.to_vec();
    out.extend_from_slice(&encrypt(&payload, authenticator, secret, Some(&salt)));
    out
}

/// Inverse of [`encrypt_salted`]
pub fn decrypt_salted(
    data: &[u8],
    authenticator: &[u8; 16],
    secret: &str,
    withlen: bool,
) -> Result<Vec<u8>> {
    if data.len() < 2 {
        return Err(IgorError::Decode("salted value too short".to_string()));
    }
    let (salt, ciphertext) = data.split_at(2);
    let payload = decrypt(ciphertext, authenticator, secret, Some(salt))?;

    if withlen {
        let length = *payload
            .first()
            .ok_or_else(|| IgorError::Decode("empty salted value".to_string()))?
            as usize;
        if payload.len() < 1 + length {
            return Err(IgorError::Decode(format!(
                "salted value length byte {} exceeds payload",
                length
            )));
        }
        Ok(payload[1..1 + length].to_vec())
    } else {
        Ok(payload)
    }
}

/// HMAC-MD5 of the full packet keyed by the secret, used by the
/// Message-Authenticator attribute. The attribute value itself must be
/// zeroed in `packet_bytes` before calling.
pub fn message_authenticator(packet_bytes: &[u8], secret: &str) -> [u8; 16] {
    let mut mac = HmacMd5::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(packet_bytes);
    mac.finalize().into_bytes().into()
}

/// MD5 of the packet followed by the secret, as used by the request and
/// response authenticators
pub fn packet_authenticator(packet_bytes: &[u8], secret: &str) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(packet_bytes);
    hasher.update(secret.as_bytes());
    hasher.finalize().into()
}

/// Random request authenticator for Access-Request packets
pub fn random_authenticator() -> [u8; 16] {
    rand::random()
}

#[cfg(test)]
mod tests {
    use super::*;

    const AUTHENTICATOR: [u8; 16] = [
        0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d,
        0x0e, 0x0f,
    ];

    fn trim_zeros(data: &[u8]) -> &[u8] {
        let end = data.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
        &data[..end]
    }

    #[test]
    fn test_password_cipher_inverse() {
        let password = "__! $? this is the long password '            7887";

        let ciphertext = encrypt(password.as_bytes(), &AUTHENTICATOR, "mysecret", None);
        assert_eq!(ciphertext.len() % 16, 0);
        assert_ne!(trim_zeros(&ciphertext), password.as_bytes());

        let cleartext = decrypt(&ciphertext, &AUTHENTICATOR, "mysecret", None).unwrap();
        assert_eq!(trim_zeros(&cleartext), password.as_bytes());
    }

    #[test]
    fn test_password_cipher_all_lengths() {
        for length in 1..=128 {
            let plaintext: Vec<u8> = (0..length).map(|i| (i % 251) as u8 + 1).collect();
            let ciphertext = encrypt(&plaintext, &AUTHENTICATOR, "s", None);
            let cleartext = decrypt(&ciphertext, &AUTHENTICATOR, "s", None).unwrap();
            assert_eq!(trim_zeros(&cleartext), plaintext.as_slice());
        }
    }

    #[test]
    fn test_salted_cipher_inverse() {
        let value = b"this is a salted attribute! and a very long one indeed!";

        let data = encrypt_salted(value, &AUTHENTICATOR, "mysecret", false);
        assert!(data[0] & 0x80 != 0);

        let recovered = decrypt_salted(&data, &AUTHENTICATOR, "mysecret", false).unwrap();
        assert_eq!(trim_zeros(&recovered), value.as_slice());
    }

    #[test]
    fn test_salted_cipher_withlen_is_exact() {
        let value = b"0123456789abcdef0"; // 17 bytes, forces padding

        let data = encrypt_salted(value, &AUTHENTICATOR, "mysecret", true);
        let recovered = decrypt_salted(&data, &AUTHENTICATOR, "mysecret", true).unwrap();
        // The embedded length removes the padding exactly
        assert_eq!(recovered, value.to_vec());
    }

    #[test]
    fn test_bad_ciphertext_length() {
        assert!(decrypt(&[1, 2, 3], &AUTHENTICATOR, "s", None).is_err());
        assert!(decrypt_salted(&[1], &AUTHENTICATOR, "s", false).is_err());
    }
}
