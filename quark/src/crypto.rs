use byteorder::{LittleEndian, WriteBytesExt};
use ctor::ctor;
use libsodium_sys;
use std::mem::MaybeUninit;

pub const MAC_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_ABYTES as usize;
pub const KEY_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_KEYBYTES as usize;
pub const NONCE_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_NPUBBYTES as usize;
pub const HASH_SIZE: usize = libsodium_sys::crypto_hash_sha256_BYTES as usize;
pub const EXCHANGE_KEY_SIZE: usize = libsodium_sys::crypto_scalarmult_BYTES as usize;
pub const SIGN_KEY_SIZE: usize = libsodium_sys::crypto_sign_PUBLICKEYBYTES as usize;
pub const SIGN_SECRET_KEY_SIZE: usize = libsodium_sys::crypto_sign_SECRETKEYBYTES as usize;
pub const SIGNATURE_SIZE: usize = libsodium_sys::crypto_sign_BYTES as usize;

const NONCE_OFFSET: usize = NONCE_SIZE - 8;

/// Initialize the sodium infrastructure
#[ctor(unsafe)]
fn INIT_SODIUM() {
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

/// Encrypts the provided plain text into the cipher buffer. The encrypted message size will be
/// the plain text size plus the MAC size. The function will fail if the cipher slice is not
/// exactly that large.
///
/// The additional data, nonce and key must match those used during decryption, the decryption
/// will fail otherwise.
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
/// the cipher text length minus the MAC size. The function will fail if the sizes do not match
/// or the message fails authentication.
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

/// Fills the provided buffer with cryptographically secure random bytes
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    unsafe {
        libsodium_sys::randombytes_buf(out.as_mut_ptr() as *mut ::std::ffi::c_void, out.len());
    }
}

/// Returns a uniformly distributed random 32 bit value
#[inline]
pub fn random_u32() -> u32 {
    unsafe { libsodium_sys::randombytes_random() }
}

/// Incremental SHA-256 state. Multiple buffers can be folded into a single digest, which is
/// how handshake tokens and puzzle solutions are hashed.
pub struct Sha256 {
    state: libsodium_sys::crypto_hash_sha256_state,
}

impl Sha256 {
    #[inline]
    pub fn new() -> Sha256 {
        unsafe {
            let mut state = MaybeUninit::<libsodium_sys::crypto_hash_sha256_state>::uninit();
            libsodium_sys::crypto_hash_sha256_init(state.as_mut_ptr());
            Sha256 {
                state: state.assume_init(),
            }
        }
    }

    #[inline]
    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        unsafe {
            libsodium_sys::crypto_hash_sha256_update(
                &mut self.state,
                data.as_ptr(),
                data.len() as u64,
            );
        }
        self
    }

    /// Consumes the state and produces the digest. Takes `&mut self` so it can chain
    /// off `update`; reusing the state afterwards is a logic error.
    #[inline]
    pub fn finish(&mut self) -> [u8; HASH_SIZE] {
        let mut hash = [0u8; HASH_SIZE];
        unsafe {
            libsodium_sys::crypto_hash_sha256_final(&mut self.state, hash.as_mut_ptr());
        }
        hash
    }
}

/// One-shot SHA-256 of a single buffer.
#[inline]
pub fn sha256(data: &[u8]) -> [u8; HASH_SIZE] {
    let mut hash = [0u8; HASH_SIZE];
    unsafe {
        libsodium_sys::crypto_hash_sha256(hash.as_mut_ptr(), data.as_ptr(), data.len() as u64);
    }
    hash
}

/// Generates an X25519 key pair, returned as (secret, public).
#[inline]
pub fn exchange_keypair() -> ([u8; EXCHANGE_KEY_SIZE], [u8; EXCHANGE_KEY_SIZE]) {
    let mut secret = [0u8; EXCHANGE_KEY_SIZE];
    let mut public = [0u8; EXCHANGE_KEY_SIZE];
    random_bytes(&mut secret);
    unsafe {
        libsodium_sys::crypto_scalarmult_base(public.as_mut_ptr(), secret.as_ptr());
    }
    (secret, public)
}

/// Computes the X25519 shared secret between a local secret key and a remote public key. The
/// raw scalar multiplication output is hashed before use as key material.
#[inline]
pub fn exchange_shared_secret(
    secret: &[u8; EXCHANGE_KEY_SIZE],
    peer_public: &[u8; EXCHANGE_KEY_SIZE],
) -> Option<[u8; HASH_SIZE]> {
    let mut raw = [0u8; EXCHANGE_KEY_SIZE];
    let result = unsafe {
        libsodium_sys::crypto_scalarmult(raw.as_mut_ptr(), secret.as_ptr(), peer_public.as_ptr())
    };
    if result != 0 {
        return None;
    }
    Some(sha256(&raw))
}

/// Generates an Ed25519 signing key pair, returned as (secret, public).
#[inline]
pub fn sign_keypair() -> ([u8; SIGN_SECRET_KEY_SIZE], [u8; SIGN_KEY_SIZE]) {
    let mut secret = [0u8; SIGN_SECRET_KEY_SIZE];
    let mut public = [0u8; SIGN_KEY_SIZE];
    unsafe {
        libsodium_sys::crypto_sign_keypair(public.as_mut_ptr(), secret.as_mut_ptr());
    }
    (secret, public)
}

/// Produces a detached Ed25519 signature over the supplied message.
#[inline]
pub fn sign_detached(message: &[u8], secret: &[u8; SIGN_SECRET_KEY_SIZE]) -> [u8; SIGNATURE_SIZE] {
    let mut signature = [0u8; SIGNATURE_SIZE];
    unsafe {
        libsodium_sys::crypto_sign_detached(
            signature.as_mut_ptr(),
            ::std::ptr::null_mut(),
            message.as_ptr(),
            message.len() as u64,
            secret.as_ptr(),
        );
    }
    signature
}

/// Verifies a detached Ed25519 signature against the supplied message and public key.
#[inline]
pub fn sign_verify(
    signature: &[u8; SIGNATURE_SIZE],
    message: &[u8],
    public: &[u8; SIGN_KEY_SIZE],
) -> bool {
    unsafe {
        libsodium_sys::crypto_sign_verify_detached(
            signature.as_ptr(),
            message.as_ptr(),
            message.len() as u64,
            public.as_ptr(),
        ) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let mut key = [0u8; KEY_SIZE];
        random_bytes(&mut key);

        let plain = b"notify protocol payload";
        let mut cipher = vec![0u8; plain.len() + MAC_SIZE];
        let mut decrypted = vec![0u8; plain.len()];

        assert!(encrypt(&mut cipher, &plain[..], b"ad", 42, &key));
        assert!(decrypt(&mut decrypted, &cipher, b"ad", 42, &key));
        assert_eq!(&decrypted[..], &plain[..]);
    }

    #[test]
    fn test_decrypt_rejects_wrong_nonce() {
        let mut key = [0u8; KEY_SIZE];
        random_bytes(&mut key);

        let plain = b"sequence bound";
        let mut cipher = vec![0u8; plain.len() + MAC_SIZE];
        let mut decrypted = vec![0u8; plain.len()];

        assert!(encrypt(&mut cipher, &plain[..], b"", 1, &key));
        assert!(!decrypt(&mut decrypted, &cipher, b"", 2, &key));
    }

    #[test]
    fn test_decrypt_rejects_tampered_additional_data() {
        let mut key = [0u8; KEY_SIZE];
        random_bytes(&mut key);

        let plain = b"header bytes";
        let mut cipher = vec![0u8; plain.len() + MAC_SIZE];
        let mut decrypted = vec![0u8; plain.len()];

        assert!(encrypt(&mut cipher, &plain[..], &[0x80, 0x01], 9, &key));
        assert!(!decrypt(&mut decrypted, &cipher, &[0x80, 0x02], 9, &key));
    }

    #[test]
    fn test_sha256_incremental_matches_oneshot() {
        let digest = Sha256::new().update(b"client").update(b"nonce").finish();
        assert_eq!(digest, sha256(b"clientnonce"));
    }

    #[test]
    fn test_exchange_shared_secret_agreement() {
        let (secret_a, public_a) = exchange_keypair();
        let (secret_b, public_b) = exchange_keypair();

        let shared_ab = exchange_shared_secret(&secret_a, &public_b).unwrap();
        let shared_ba = exchange_shared_secret(&secret_b, &public_a).unwrap();
        assert_eq!(shared_ab, shared_ba);
    }

    #[test]
    fn test_sign_verify() {
        let (secret, public) = sign_keypair();
        let signature = sign_detached(b"host certificate", &secret);
        assert!(sign_verify(&signature, b"host certificate", &public));
        assert!(!sign_verify(&signature, b"host certificate!", &public));
    }
}
