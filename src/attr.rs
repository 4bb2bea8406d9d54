//! Node attribute codec.
//!
//! Attributes travel as `"MEGA" || json`, zero-padded to the AES block
//! size and CBC-encrypted under the node key with a zero IV, then
//! base64url-encoded.

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::cipher::generic_array::GenericArray;
use serde::{Deserialize, Serialize};

use crate::crypto::{base64url_decode, base64url_encode, pad_null, Aes128CbcDec, Aes128CbcEnc};
use crate::error::Error;

const ATTR_MAGIC: &[u8; 4] = b"MEGA";
const ZERO_IV: [u8; 16] = [0u8; 16];

/// Decrypted node attributes. The display name is the only field the
/// client reads or writes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileAttr {
    #[serde(rename = "n")]
    pub name: String,
}

/// Encrypt an attribute record under a node key.
pub fn encrypt_attr(key: &[u8], attr: &FileAttr) -> Result<String, Error> {
    let json = serde_json::to_string(attr)
        .map_err(|e| Error::BadArgs(format!("attribute serialization failed: {}", e)))?;

    let mut data = ATTR_MAGIC.to_vec();
    data.extend_from_slice(json.as_bytes());
    let mut data = pad_null(data, 16);

    let mut enc = Aes128CbcEnc::new_from_slices(key, &ZERO_IV)
        .map_err(|_| Error::BadArgs(format!("attribute key must be 16 bytes, got {}", key.len())))?;
    for block in data.chunks_exact_mut(16) {
        enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
    }

    Ok(base64url_encode(&data))
}

/// Decrypt an attribute blob under a node key.
///
/// Fails with [`Error::BadAttr`] when the magic prefix is absent after
/// decryption, which is how a wrong key shows up.
pub fn decrypt_attr(key: &[u8], data: &str) -> Result<FileAttr, Error> {
    let mut buf = base64url_decode(data)?;

    let mut dec = Aes128CbcDec::new_from_slices(key, &ZERO_IV)
        .map_err(|_| Error::BadAttr)?;
    for block in buf.chunks_exact_mut(16) {
        dec.decrypt_block_mut(GenericArray::from_mut_slice(block));
    }

    if buf.len() < 4 || &buf[..4] != ATTR_MAGIC {
        return Err(Error::BadAttr);
    }

    let json_end = buf.iter().rposition(|&b| b != 0).map_or(4, |p| p + 1);
    serde_json::from_slice(&buf[4..json_end]).map_err(|_| Error::BadAttr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_roundtrip() {
        let key = [0x11u8; 16];
        let attr = FileAttr {
            name: "quarterly report.pdf".to_string(),
        };
        let blob = encrypt_attr(&key, &attr).unwrap();
        assert_eq!(decrypt_attr(&key, &blob).unwrap(), attr);
    }

    #[test]
    fn test_attr_roundtrip_multibyte_name() {
        let key = [0x42u8; 16];
        let attr = FileAttr {
            name: "übersicht 報告.txt".to_string(),
        };
        let blob = encrypt_attr(&key, &attr).unwrap();
        assert_eq!(decrypt_attr(&key, &blob).unwrap(), attr);
    }

    #[test]
    fn test_attr_wrong_key_fails() {
        let attr = FileAttr {
            name: "secret".to_string(),
        };
        let blob = encrypt_attr(&[0x11u8; 16], &attr).unwrap();
        assert!(matches!(
            decrypt_attr(&[0x22u8; 16], &blob),
            Err(Error::BadAttr)
        ));
    }

    #[test]
    fn test_attr_missing_magic_fails() {
        // A valid base64 blob that decrypts to garbage.
        let blob = base64url_encode(&[0u8; 16]);
        assert!(matches!(
            decrypt_attr(&[0x11u8; 16], &blob),
            Err(Error::BadAttr)
        ));
    }

    #[test]
    fn test_attr_blob_is_block_aligned() {
        let blob = encrypt_attr(&[0u8; 16], &FileAttr { name: "x".into() }).unwrap();
        assert_eq!(base64url_decode(&blob).unwrap().len() % 16, 0);
    }
}
