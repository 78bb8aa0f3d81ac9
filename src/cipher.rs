//! Outer ciphers protecting the database payload

use std::fmt;

use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use generic_array::GenericArray;
use openssl::symm::{decrypt, encrypt, Cipher};
use twofish::Twofish;
use uuid::{uuid, Uuid};

use crate::error::{Error, Result};

pub const CIPHER_ID_AES256_CBC: Uuid = uuid!("31c1f2e6-bf71-4350-be58-05216afc5aff");
pub const CIPHER_ID_TWOFISH_CBC: Uuid = uuid!("ad68f29f-576f-4bb9-a36a-d47af965346c");
pub const CIPHER_ID_CHACHA20: Uuid = uuid!("d6038a2b-8b6f-4cb5-a524-339a31dbb59a");

type TwofishCbcEnc = cbc::Encryptor<Twofish>;
type TwofishCbcDec = cbc::Decryptor<Twofish>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CipherId {
    Aes256Cbc,
    TwofishCbc,
    ChaCha20,
}

impl Default for CipherId {
    fn default() -> Self {
        CipherId::Aes256Cbc
    }
}

impl fmt::Display for CipherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CipherId::Aes256Cbc => "AES-256-CBC",
            CipherId::TwofishCbc => "Twofish-CBC",
            CipherId::ChaCha20 => "ChaCha20",
        })
    }
}

impl CipherId {
    pub fn from_uuid(uuid: Uuid) -> Result<Self> {
        match uuid {
            x if x == CIPHER_ID_AES256_CBC => Ok(CipherId::Aes256Cbc),
            x if x == CIPHER_ID_TWOFISH_CBC => Ok(CipherId::TwofishCbc),
            x if x == CIPHER_ID_CHACHA20 => Ok(CipherId::ChaCha20),
            x => Err(Error::UnsupportedCipher(x)),
        }
    }

    pub fn uuid(&self) -> Uuid {
        match self {
            CipherId::Aes256Cbc => CIPHER_ID_AES256_CBC,
            CipherId::TwofishCbc => CIPHER_ID_TWOFISH_CBC,
            CipherId::ChaCha20 => CIPHER_ID_CHACHA20,
        }
    }

    pub fn iv_size(&self) -> usize {
        match self {
            CipherId::Aes256Cbc | CipherId::TwofishCbc => 16,
            CipherId::ChaCha20 => 12,
        }
    }

    pub(crate) fn encrypt(&self, key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        self.check_lengths(key, iv)?;
        match self {
            CipherId::Aes256Cbc => Ok(encrypt(Cipher::aes_256_cbc(), key, Some(iv), data)?),
            CipherId::TwofishCbc => Ok(TwofishCbcEnc::new_from_slices(key, iv)
                .map_err(|e| Error::Crypto(e.to_string()))?
                .encrypt_padded_vec_mut::<Pkcs7>(data)),
            CipherId::ChaCha20 => Ok(apply_chacha20(key, iv, data)),
        }
    }

    /// Padding failures mean the key was wrong, so they map to `InvalidCredentials`
    pub(crate) fn decrypt(&self, key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        self.check_lengths(key, iv)?;
        match self {
            CipherId::Aes256Cbc => {
                decrypt(Cipher::aes_256_cbc(), key, Some(iv), data).map_err(|_| Error::InvalidCredentials)
            }
            CipherId::TwofishCbc => TwofishCbcDec::new_from_slices(key, iv)
                .map_err(|e| Error::Crypto(e.to_string()))?
                .decrypt_padded_vec_mut::<Pkcs7>(data)
                .map_err(|_| Error::InvalidCredentials),
            CipherId::ChaCha20 => Ok(apply_chacha20(key, iv, data)),
        }
    }

    fn check_lengths(&self, key: &[u8], iv: &[u8]) -> Result<()> {
        if key.len() != 32 {
            return Err(Error::Crypto(format!("{} needs a 32 byte key", self)));
        }
        if iv.len() != self.iv_size() {
            return Err(Error::InvalidHeaderField {
                field: "EncryptionIV",
                length: iv.len(),
            });
        }
        Ok(())
    }
}

fn apply_chacha20(key: &[u8], iv: &[u8], data: &[u8]) -> Vec<u8> {
    let mut output = data.to_vec();
    let mut cipher = ChaCha20::new(GenericArray::from_slice(key), GenericArray::from_slice(iv));
    cipher.apply_keystream(&mut output);
    output
}
