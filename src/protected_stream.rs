//! Inner random stream protecting values inside the XML payload

use std::fmt;

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;

use hex_literal::hex;

use ring::digest::{Context, SHA256, SHA512};
use salsa20::cipher::{KeyIvInit, StreamCipher};
use salsa20::Key as Salsa20_Key;
use salsa20::Salsa20;

use chacha20::ChaCha20;
use generic_array::GenericArray;

use crate::error::{Error, Result};

mod arc4variant;

use arc4variant::ArcFourVariant;

const SALSA20_NONCE: [u8; 8] = hex!("E830094B97205D2A");

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum InnerStreamId {
    None = 0,
    ArcFourVariant = 1,
    Salsa20 = 2,
    ChaCha20 = 3,
}

impl InnerStreamId {
    pub fn from_id(id: u32) -> Result<Self> {
        Self::from_u32(id).ok_or(Error::UnsupportedInnerStream(id))
    }

    /// Size of the random key generated when saving
    pub(crate) fn key_size(&self) -> usize {
        match self {
            Self::ChaCha20 => 64,
            _ => 32,
        }
    }
}

pub enum CipherValue {
    Null,
    ArcFour(ArcFourVariant),
    Salsa20(Salsa20),
    ChaCha20(ChaCha20),
}

impl Default for CipherValue {
    fn default() -> Self {
        Self::Null
    }
}

impl fmt::Debug for CipherValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Null => "Null",
            Self::ArcFour(_) => "ArcFourVariant",
            Self::Salsa20(_) => "Salsa20",
            Self::ChaCha20(_) => "ChaCha20",
        })
    }
}

impl CipherValue {
    pub fn apply_keystream(&mut self, buf: &mut [u8]) {
        match self {
            Self::Null => (),
            Self::ArcFour(c) => c.gen(buf),
            Self::Salsa20(c) => c.apply_keystream(buf),
            Self::ChaCha20(c) => c.apply_keystream(buf),
        }
    }
}

pub fn new_stream(cipher: u32, key: &[u8]) -> Result<CipherValue> {
    open_stream(InnerStreamId::from_id(cipher)?, key)
}

pub fn open_stream(id: InnerStreamId, key: &[u8]) -> Result<CipherValue> {
    Ok(match id {
        InnerStreamId::None => CipherValue::Null,
        InnerStreamId::ArcFourVariant => {
            if key.is_empty() {
                return Err(Error::InvalidHeaderField {
                    field: "ProtectedStreamKey",
                    length: 0,
                });
            }
            CipherValue::ArcFour(ArcFourVariant::new(key))
        }
        InnerStreamId::Salsa20 => {
            let mut context = Context::new(&SHA256);
            context.update(key);
            let p2_key = context.finish().as_ref().to_owned();
            let key = Salsa20_Key::from_slice(&p2_key[0..32]);
            CipherValue::Salsa20(Salsa20::new(key, &SALSA20_NONCE.into()))
        }
        InnerStreamId::ChaCha20 => {
            let mut context = Context::new(&SHA512);
            context.update(key);
            let p2_key = context.finish().as_ref().to_owned();
            let key = GenericArray::from_slice(&p2_key[0..32]);
            let nonce = GenericArray::from_slice(&p2_key[32..32 + 12]);
            CipherValue::ChaCha20(ChaCha20::new(key, nonce))
        }
    })
}
