//! AES-128-CBC segment decryption.
//!
//! Each segment is an independent CBC message with a PKCS#7 pad, and the pad
//! is stripped on every segment so the output is exactly the plaintext
//! concatenation. Large payloads decrypt on the blocking pool so segment I/O
//! keeps making progress.

use bytes::Bytes;

use aes::cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7};

use crate::error::DownloadError;

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// IV for a segment with no explicit IV: the 16-byte big-endian encoding of
/// its absolute index.
pub fn derive_iv(absolute_index: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[8..].copy_from_slice(&absolute_index.to_be_bytes());
    iv
}

pub fn decrypt_sync(data: Bytes, key: &[u8; 16], iv: &[u8; 16]) -> Result<Bytes, DownloadError> {
    let mut buffer = data.to_vec();
    let cipher = Aes128CbcDec::new_from_slices(key, iv)
        .map_err(|e| DownloadError::decrypt(format!("cannot initialize cipher: {e}")))?;
    let plaintext_len = cipher
        .decrypt_padded_mut::<Pkcs7>(&mut buffer)
        .map_err(|e| DownloadError::decrypt(format!("invalid ciphertext or padding: {e}")))?
        .len();
    buffer.truncate(plaintext_len);
    Ok(Bytes::from(buffer))
}

/// Decrypt one segment, moving to the blocking pool at or above
/// `offload_threshold` bytes.
pub async fn decrypt(
    data: Bytes,
    key: [u8; 16],
    iv: [u8; 16],
    offload_threshold: usize,
) -> Result<Bytes, DownloadError> {
    if data.len() >= offload_threshold {
        tokio::task::spawn_blocking(move || decrypt_sync(data, &key, &iv))
            .await
            .map_err(|e| DownloadError::decrypt(format!("decryption task failed: {e}")))?
    } else {
        decrypt_sync(data, &key, &iv)
    }
}

#[cfg(test)]
mod tests {
    use aes::cipher::BlockEncryptMut;

    use super::*;

    type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

    pub(crate) fn encrypt(plaintext: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
        let cipher = Aes128CbcEnc::new_from_slices(key, iv).unwrap();
        let mut buffer = vec![0u8; plaintext.len() + 16];
        buffer[..plaintext.len()].copy_from_slice(plaintext);
        cipher
            .encrypt_padded_mut::<Pkcs7>(&mut buffer, plaintext.len())
            .unwrap()
            .to_vec()
    }

    #[test]
    fn derive_iv_is_big_endian_in_the_low_bytes() {
        assert_eq!(derive_iv(0), [0u8; 16]);

        let iv = derive_iv(0x0102);
        let mut expected = [0u8; 16];
        expected[14] = 0x01;
        expected[15] = 0x02;
        assert_eq!(iv, expected);
    }

    #[test]
    fn decrypt_recovers_plaintext() {
        let key = [0x42u8; 16];
        let iv = derive_iv(7);
        let plaintext = b"not block aligned payload".as_slice();

        let ciphertext = encrypt(plaintext, &key, &iv);
        let decrypted = decrypt_sync(Bytes::from(ciphertext), &key, &iv).unwrap();
        assert_eq!(decrypted.as_ref(), plaintext);
    }

    #[test]
    fn concatenated_segments_decrypt_to_concatenated_plaintexts() {
        let key = [0x11u8; 16];
        let plaintexts: Vec<Vec<u8>> = (0u8..4).map(|i| vec![i; 20 + i as usize]).collect();

        let mut expected = Vec::new();
        let mut produced = Vec::new();
        for (i, plain) in plaintexts.iter().enumerate() {
            let iv = derive_iv(i as u64);
            let ciphertext = encrypt(plain, &key, &iv);
            let decrypted = decrypt_sync(Bytes::from(ciphertext), &key, &iv).unwrap();
            expected.extend_from_slice(plain);
            produced.extend_from_slice(&decrypted);
        }
        assert_eq!(produced, expected);
    }

    #[test]
    fn invalid_padding_is_a_decrypt_error() {
        use aes::cipher::block_padding::NoPadding;

        let key = [0x01u8; 16];
        let iv = [0x02u8; 16];
        // A block whose plaintext ends in 0x00 can never carry a valid
        // PKCS#7 pad. Encrypt it without padding to get such a ciphertext.
        let mut block = [0u8; 16];
        let cipher = Aes128CbcEnc::new_from_slices(&key, &iv).unwrap();
        let ciphertext = cipher
            .encrypt_padded_mut::<NoPadding>(&mut block, 16)
            .unwrap()
            .to_vec();

        assert!(matches!(
            decrypt_sync(Bytes::from(ciphertext), &key, &iv),
            Err(DownloadError::Decrypt { .. })
        ));
    }

    #[test]
    fn non_block_sized_input_is_a_decrypt_error() {
        let key = [0x01u8; 16];
        let iv = [0x02u8; 16];
        let short = Bytes::from(vec![0u8; 15]);
        assert!(matches!(
            decrypt_sync(short, &key, &iv),
            Err(DownloadError::Decrypt { .. })
        ));
    }

    #[tokio::test]
    async fn offloaded_and_inline_paths_agree() {
        let key = [0x33u8; 16];
        let iv = derive_iv(3);
        let plaintext = vec![0x5Au8; 4096];
        let ciphertext = Bytes::from(encrypt(&plaintext, &key, &iv));

        let inline = decrypt(ciphertext.clone(), key, iv, usize::MAX).await.unwrap();
        let offloaded = decrypt(ciphertext, key, iv, 0).await.unwrap();
        assert_eq!(inline, offloaded);
        assert_eq!(inline.as_ref(), plaintext.as_slice());
    }
}
