use byteorder::{LittleEndian, WriteBytesExt};
use libsodium_sys;

pub const MAC_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_ABYTES as usize;
pub const KEY_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_KEYBYTES as usize;
pub const NONCE_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_NPUBBYTES as usize;

pub const HASH_SIZE: usize = libsodium_sys::crypto_hash_sha256_BYTES as usize;
pub const SIGN_PUBKEY_SIZE: usize = libsodium_sys::crypto_sign_PUBLICKEYBYTES as usize;
pub const SIGN_PRIVKEY_SIZE: usize = libsodium_sys::crypto_sign_SECRETKEYBYTES as usize;
pub const SIGNATURE_SIZE: usize = libsodium_sys::crypto_sign_BYTES as usize;
pub const SIGN_SEED_SIZE: usize = libsodium_sys::crypto_sign_SEEDBYTES as usize;
pub const EXCHANGE_SIZE: usize = libsodium_sys::crypto_scalarmult_BYTES as usize;

const NONCE_OFFSET: usize = NONCE_SIZE - 8;

/// Initialize the sodium infrastructure. Must be called once before any
/// other function in this module.
pub fn init() {
    unsafe {
        if libsodium_sys::sodium_init() < 0 {
            panic!("Cryptography initialization failed")
        }
    }
}

#[inline]
fn nonce_to_bytes(nonce: u64) -> [u8; NONCE_SIZE] {
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    (&mut nonce_bytes[NONCE_OFFSET..])
        .write_u64::<LittleEndian>(nonce)
        .expect("Error creating nonce");
    nonce_bytes
}

/// Encrypts the provided plain text into the cipher buffer. The encrypted message size will be the
/// plain text size plus the MAC size. The function panics if the cipher slice size does not match.
///
/// The additional data, nonce and key must match those used during decryption, the decryption will
/// fail otherwise.
#[inline]
pub fn encrypt(
    cipher: &mut [u8],
    plain: &[u8],
    additional_data: &[u8],
    nonce: u64,
    key: &[u8; KEY_SIZE],
) -> bool {
    let nonce_bytes = nonce_to_bytes(nonce);

    if cipher.len() != plain.len() + MAC_SIZE {
        panic!(
            "Encryption: cipher data length ({}) must be plain data length ({}) + MAC size ({})",
            cipher.len(),
            plain.len(),
            MAC_SIZE
        )
    }

    unsafe {
        let result = libsodium_sys::crypto_aead_chacha20poly1305_ietf_encrypt(
            cipher.as_mut_ptr(),
            ::std::ptr::null_mut(),
            plain.as_ptr(),
            plain.len() as u64,
            additional_data.as_ptr(),
            additional_data.len() as u64,
            ::std::ptr::null(),
            nonce_bytes.as_ptr(),
            key.as_ptr(),
        );

        result >= 0
    }
}

/// Decrypts the provided ciphertext into the plain buffer. The decoded message size is equal to
/// the cipher text length minus the MAC size. The function panics if the sizes do not match.
#[inline]
pub fn decrypt(
    plain: &mut [u8],
    cipher: &[u8],
    additional_data: &[u8],
    nonce: u64,
    key: &[u8; KEY_SIZE],
) -> bool {
    let nonce_bytes = nonce_to_bytes(nonce);

    if cipher.len() != plain.len() + MAC_SIZE {
        panic!(
            "Decryption: cipher data length ({}) must be plain data length ({}) + MAC size ({})",
            cipher.len(),
            plain.len(),
            MAC_SIZE
        )
    }

    unsafe {
        let result = libsodium_sys::crypto_aead_chacha20poly1305_ietf_decrypt(
            plain.as_mut_ptr(),
            ::std::ptr::null_mut(),
            ::std::ptr::null_mut(),
            cipher.as_ptr(),
            cipher.len() as u64,
            additional_data.as_ptr(),
            additional_data.len() as u64,
            nonce_bytes.as_ptr(),
            key.as_ptr(),
        );

        result >= 0
    }
}

/// Fills the provided buffer with cryptographically secure random bytes.
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    unsafe {
        libsodium_sys::randombytes_buf(out.as_mut_ptr() as *mut ::std::ffi::c_void, out.len());
    }
}

/// SHA-256 digest of the supplied data.
#[inline]
pub fn sha256(data: &[u8]) -> [u8; HASH_SIZE] {
    let mut hash = [0u8; HASH_SIZE];
    unsafe {
        libsodium_sys::crypto_hash_sha256(hash.as_mut_ptr(), data.as_ptr(), data.len() as u64);
    }
    hash
}

/// Derives an Ed25519 signing keypair from a 32-byte seed.
#[inline]
pub fn sign_keypair(seed: &[u8; SIGN_SEED_SIZE]) -> ([u8; SIGN_PUBKEY_SIZE], [u8; SIGN_PRIVKEY_SIZE]) {
    let mut pubkey = [0u8; SIGN_PUBKEY_SIZE];
    let mut privkey = [0u8; SIGN_PRIVKEY_SIZE];
    unsafe {
        libsodium_sys::crypto_sign_seed_keypair(
            pubkey.as_mut_ptr(),
            privkey.as_mut_ptr(),
            seed.as_ptr(),
        );
    }
    (pubkey, privkey)
}

/// Produces a detached Ed25519 signature over the message.
#[inline]
pub fn sign(message: &[u8], privkey: &[u8; SIGN_PRIVKEY_SIZE]) -> [u8; SIGNATURE_SIZE] {
    let mut signature = [0u8; SIGNATURE_SIZE];
    unsafe {
        libsodium_sys::crypto_sign_detached(
            signature.as_mut_ptr(),
            ::std::ptr::null_mut(),
            message.as_ptr(),
            message.len() as u64,
            privkey.as_ptr(),
        );
    }
    signature
}

/// Verifies a detached Ed25519 signature over the message.
#[inline]
pub fn verify(signature: &[u8], message: &[u8], pubkey: &[u8; SIGN_PUBKEY_SIZE]) -> bool {
    if signature.len() != SIGNATURE_SIZE {
        return false;
    }

    unsafe {
        libsodium_sys::crypto_sign_verify_detached(
            signature.as_ptr(),
            message.as_ptr(),
            message.len() as u64,
            pubkey.as_ptr(),
        ) == 0
    }
}

/// Generates an ephemeral X25519 keypair for the wire key exchange.
#[inline]
pub fn exchange_keypair() -> ([u8; EXCHANGE_SIZE], [u8; EXCHANGE_SIZE]) {
    let mut secret = [0u8; EXCHANGE_SIZE];
    let mut public = [0u8; EXCHANGE_SIZE];
    random_bytes(&mut secret);
    unsafe {
        libsodium_sys::crypto_scalarmult_base(public.as_mut_ptr(), secret.as_ptr());
    }
    (secret, public)
}

/// Computes the X25519 shared secret. Returns None for degenerate public keys.
#[inline]
pub fn exchange(secret: &[u8; EXCHANGE_SIZE], public: &[u8; EXCHANGE_SIZE]) -> Option<[u8; EXCHANGE_SIZE]> {
    let mut shared = [0u8; EXCHANGE_SIZE];
    let result = unsafe {
        libsodium_sys::crypto_scalarmult(shared.as_mut_ptr(), secret.as_ptr(), public.as_ptr())
    };

    if result == 0 {
        Some(shared)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() {
        init();
    }

    #[test]
    fn test_sha256_known_vector() {
        setup();

        let hash = sha256(b"");

        assert_eq!(
            &hash[..4],
            &[0xe3, 0xb0, 0xc4, 0x42],
            "SHA-256 of the empty string must start with e3b0c442"
        );
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        setup();

        let seed = [7u8; SIGN_SEED_SIZE];
        let (pubkey, privkey) = sign_keypair(&seed);

        let signature = sign(b"payload", &privkey);

        assert!(verify(&signature, b"payload", &pubkey));
        assert!(!verify(&signature, b"payloae", &pubkey));

        let mut tampered = signature;
        tampered[0] ^= 1;
        assert!(!verify(&tampered, b"payload", &pubkey));
    }

    #[test]
    fn test_exchange_agreement() {
        setup();

        let (a_secret, a_public) = exchange_keypair();
        let (b_secret, b_public) = exchange_keypair();

        let ab = exchange(&a_secret, &b_public).unwrap();
        let ba = exchange(&b_secret, &a_public).unwrap();

        assert_eq!(ab, ba);
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        setup();

        let key = [3u8; KEY_SIZE];
        let plain = b"a secret message";
        let mut cipher = vec![0u8; plain.len() + MAC_SIZE];

        assert!(encrypt(&mut cipher, plain, b"ad", 7, &key));

        let mut decrypted = vec![0u8; plain.len()];
        assert!(decrypt(&mut decrypted, &cipher, b"ad", 7, &key));
        assert_eq!(&decrypted[..], &plain[..]);

        // Wrong nonce, additional data or key must all fail.
        assert!(!decrypt(&mut decrypted, &cipher, b"ad", 8, &key));
        assert!(!decrypt(&mut decrypted, &cipher, b"da", 7, &key));
        assert!(!decrypt(&mut decrypted, &cipher, b"ad", 7, &[4u8; KEY_SIZE]));
    }
}
