//! MEGA cryptographic primitives.
//!
//! MEGA manipulates all key material as sequences of big-endian 32-bit
//! words; `bytes_to_a32`/`a32_to_bytes` are the bijection the rest of the
//! crate leans on. On top of the AES-128 block primitive sit the two
//! domain-specific constructions (`password_key`, `stringhash`) and the
//! RSA session-challenge decryption used once at login.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use num_bigint::BigUint;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::Error;

// AES-128 mode type aliases shared by the attribute codec and the
// transfer engine.
pub(crate) type Aes128CbcEnc = cbc::Encryptor<Aes128>;
pub(crate) type Aes128CbcDec = cbc::Decryptor<Aes128>;
pub(crate) type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// Initial state of the password-key stretch, as four big-endian words.
const PASSWORD_KEY_SEED: [u32; 4] = [0x93C4_67E3, 0x7DB0_C7A4, 0xD1BE_3F81, 0x0152_CB56];

// ─── Word/byte bijection ────────────────────────────────────────────────────

/// Zero-pad `b` up to a multiple of `q` bytes. Aligned input is returned
/// unchanged.
pub(crate) fn pad_null(mut b: Vec<u8>, q: usize) -> Vec<u8> {
    let rem = b.len() % q;
    if rem != 0 {
        b.resize(b.len() + q - rem, 0);
    }
    b
}

/// Convert bytes to big-endian 32-bit words, zero-padding to a 4-byte
/// boundary first.
pub fn bytes_to_a32(b: &[u8]) -> Vec<u32> {
    pad_null(b.to_vec(), 4)
        .chunks_exact(4)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Convert big-endian 32-bit words back to bytes.
pub fn a32_to_bytes(a: &[u32]) -> Vec<u8> {
    a.iter().flat_map(|w| w.to_be_bytes()).collect()
}

// ─── Base64url ──────────────────────────────────────────────────────────────

/// Encode with the url-safe alphabet, no padding.
pub fn base64url_encode(b: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(b)
}

/// Decode url-safe base64, tolerating `=` padding the encoder never emits.
pub fn base64url_decode(s: &str) -> Result<Vec<u8>, Error> {
    URL_SAFE_NO_PAD
        .decode(s.trim_end_matches('='))
        .map_err(|e| Error::BadResp(format!("base64 decode failed: {}", e)))
}

// ─── AES-128 block helpers ──────────────────────────────────────────────────

/// Build an AES-128 block cipher from a 16-byte key slice.
pub(crate) fn aes128(key: &[u8]) -> Result<Aes128, Error> {
    Aes128::new_from_slice(key)
        .map_err(|_| Error::BadResp(format!("AES key must be 16 bytes, got {}", key.len())))
}

/// Encrypt `data` in place, one independent 16-byte block at a time.
/// A trailing partial block is left untouched.
pub(crate) fn block_encrypt(cipher: &Aes128, data: &mut [u8]) {
    for block in data.chunks_exact_mut(16) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }
}

/// Decrypt `data` in place, one independent 16-byte block at a time.
pub(crate) fn block_decrypt(cipher: &Aes128, data: &mut [u8]) {
    for block in data.chunks_exact_mut(16) {
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
    }
}

// ─── Domain constructions ───────────────────────────────────────────────────

/// Stretch a password into the 128-bit password key.
///
/// The password is chunked into zero-padded 16-byte AES keys; the seed
/// state is encrypted under each chunk in turn for 65,536 rounds.
pub fn password_key(password: &str) -> [u8; 16] {
    let padded = pad_null(password.as_bytes().to_vec(), 16);
    let ciphers: Vec<Aes128> = padded
        .chunks_exact(16)
        .map(|c| Aes128::new(GenericArray::from_slice(c)))
        .collect();

    let mut key = [0u8; 16];
    key.copy_from_slice(&a32_to_bytes(&PASSWORD_KEY_SEED));
    for _ in 0..0x10000 {
        for cipher in &ciphers {
            cipher.encrypt_block(GenericArray::from_mut_slice(&mut key));
        }
    }
    key
}

/// Hash a string under a key into an 8-byte handle, base64url-encoded.
///
/// XOR-folds the padded UTF-8 bytes into four words, encrypts the fold
/// 16,384 times, and emits words 0 and 2 of the result.
pub fn stringhash(s: &str, key: &[u8; 16]) -> String {
    let words = bytes_to_a32(&pad_null(s.as_bytes().to_vec(), 16));
    let mut fold = [0u32; 4];
    for (i, w) in words.iter().enumerate() {
        fold[i & 3] ^= w;
    }

    let mut buf = [0u8; 16];
    buf.copy_from_slice(&a32_to_bytes(&fold));
    let cipher = Aes128::new(GenericArray::from_slice(key));
    for _ in 0..0x4000 {
        cipher.encrypt_block(GenericArray::from_mut_slice(&mut buf));
    }

    let out = bytes_to_a32(&buf);
    base64url_encode(&a32_to_bytes(&[out[0], out[2]]))
}

// ─── RSA session challenge ──────────────────────────────────────────────────

/// Parse one MPI (two-byte big-endian bit length, then the magnitude
/// bytes) and return it with the remaining input.
fn parse_mpi(b: &[u8]) -> Result<(BigUint, &[u8]), Error> {
    if b.len() < 2 {
        return Err(Error::BadResp("MPI truncated before length".into()));
    }
    let bits = u16::from_be_bytes([b[0], b[1]]) as usize;
    let len = (bits + 7) / 8;
    if b.len() < 2 + len {
        return Err(Error::BadResp(format!(
            "MPI truncated: need {} magnitude bytes, have {}",
            len,
            b.len() - 2
        )));
    }
    Ok((BigUint::from_bytes_be(&b[2..2 + len]), &b[2 + len..]))
}

/// Recover the 43-byte session id from the wrapped RSA private key and
/// the session challenge.
///
/// `privk` decrypts blockwise under the master key into the MPIs
/// `p`, `q`, `d` (a trailing CRT coefficient is ignored); the challenge
/// is decrypted as `m^d mod p*q`.
pub(crate) fn decrypt_session_id(
    privk: &str,
    csid: &str,
    master_key: &[u8; 16],
) -> Result<Vec<u8>, Error> {
    let master_aes = aes128(master_key)?;
    let mut pk = base64url_decode(privk)?;
    block_decrypt(&master_aes, &mut pk);

    let challenge = base64url_decode(csid)?;
    let (m, _) = parse_mpi(&challenge)?;

    let (p, rest) = parse_mpi(&pk)?;
    let (q, rest) = parse_mpi(rest)?;
    let (d, _) = parse_mpi(rest)?;

    let n = &p * &q;
    let r = m.modpow(&d, &n);
    let bytes = r.to_bytes_be();
    if bytes.len() < 43 {
        return Err(Error::BadResp(format!(
            "decrypted session blob too short: {} bytes",
            bytes.len()
        )));
    }
    Ok(bytes[..43].to_vec())
}

// ─── Randomness ─────────────────────────────────────────────────────────────

/// Fill a buffer with OS-entropy random bytes.
pub(crate) fn random_bytes(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

/// 32 random bits from OS entropy, used to seed the request sequence
/// number.
pub(crate) fn random_u32() -> u32 {
    OsRng.next_u32()
}

/// Random alphanumeric string for request idempotency nonces.
pub(crate) fn rand_string(len: usize) -> String {
    use rand::distributions::Alphanumeric;
    use rand::Rng;
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
