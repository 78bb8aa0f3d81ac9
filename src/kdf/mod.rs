use std::convert::TryInto;

use log::{debug, info};
use openssl::symm::{Cipher, Crypter, Mode};
use rand::RngCore;
use ring::digest::{digest, Context, SHA256, SHA512};
use uuid::{uuid, Uuid};

use crate::error::{Error, Result};
use crate::variant_map::{MapValue, VariantMap};

#[cfg(feature = "argon2")]
mod argon2;
#[cfg(feature = "argon2")]
pub use self::argon2::*;


pub const KDF_AES_KDBX3: Uuid = uuid!("c9d9f39a-628a-4460-bf74-0d08c18a4fea");
pub const KDF_AES_KDBX4: Uuid = uuid!("7c02bb82-79a7-4ac0-927d-114a00648238");
pub const KDF_ARGON2_D: Uuid = uuid!("ef636ddf-8c29-444b-91f7-a9a403e30a0c");
pub const KDF_ARGON2_ID: Uuid = uuid!("9e298b19-56db-4773-b23d-fc3ec6f0a1e6");

pub const KDF_PARAM_UUID: &str = "$UUID"; // UUID, KDF used to derive master key
pub const KDF_PARAM_SALT: &str = "S"; // Byte[], Generates 32 bytes, required
pub const KDF_PARAM_ROUNDS: &str = "R"; // UInt64, AES-KDF only, required
pub const KDF_PARAM_PARALLELISM: &str = "P"; // UInt32, Default, required
pub const KDF_PARAM_MEMORY: &str = "M"; // UInt64, Default, required
pub const KDF_PARAM_ITERATIONS: &str = "I"; // UInt64, Default, required
pub const KDF_PARAM_VERSION: &str = "V"; // UInt32, Min/Max, Default Max, required
pub const KDF_PARAM_SECRET_KEY: &str = "K"; // Byte[]
pub const KDF_PARAM_ASSOC_DATA: &str = "A"; // Byte[]

/// Key derivation function turning the composite key into the transformed key
pub trait Kdf {
    fn uuid(&self) -> Uuid;
    /// Pick a fresh salt
    fn randomize(&mut self);
    fn transform_key(&self, composite_key: &[u8]) -> Result<Vec<u8>>;
    fn save(&self, parameters: &mut VariantMap);
}

/// Build the KDF named by the `$UUID` parameter
pub fn load_kdf(parameters: &VariantMap) -> Result<Box<dyn Kdf>> {
    let uuid = parameters
        .get_bytes(KDF_PARAM_UUID)
        .and_then(|b| Uuid::from_slice(b).ok())
        .ok_or_else(|| Error::InvalidKdfParameters("missing KDF UUID".to_string()))?;
    match uuid {
        KDF_AES_KDBX3 | KDF_AES_KDBX4 => Ok(Box::new(AesKdf::load(parameters)?)),
        #[cfg(feature = "argon2")]
        KDF_ARGON2_D | KDF_ARGON2_ID => Ok(Box::new(Argon2Kdf::load(parameters)?)),
        other => Err(Error::UnsupportedKdf(other.to_string())),
    }
}

/// Store the KDF parameters, including `$UUID`, into a fresh variant map
pub fn save_kdf(kdf: &dyn Kdf) -> VariantMap {
    let mut parameters = VariantMap::new();
    parameters.insert(KDF_PARAM_UUID, MapValue::ByteArray(kdf.uuid().as_bytes().to_vec()));
    kdf.save(&mut parameters);
    parameters
}

/// Outer cipher key and HMAC base key derived from the transformed key
pub(crate) fn master_keys(master_seed: &[u8], transformed_key: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut context = Context::new(&SHA256);
    let mut hmac_context = Context::new(&SHA512);
    context.update(master_seed);
    context.update(transformed_key);
    hmac_context.update(master_seed);
    hmac_context.update(transformed_key);
    hmac_context.update(&[1u8]);
    (
        context.finish().as_ref().to_owned(),
        hmac_context.finish().as_ref().to_owned(),
    )
}

pub(crate) fn salt_param(parameters: &VariantMap) -> Result<&[u8]> {
    parameters
        .get_bytes(KDF_PARAM_SALT)
        .ok_or_else(|| Error::InvalidKdfParameters("salt missing".to_string()))
}

/// AES-KDF: the composite key is encrypted `rounds` times with AES-256-ECB
#[derive(Clone, Debug, PartialEq)]
pub struct AesKdf {
    uuid: Uuid,
    salt: [u8; 32],
    rounds: u64,
}

impl AesKdf {
    pub const DEFAULT_ROUNDS: u64 = 60000;

    pub fn new(rounds: u64) -> Self {
        let mut kdf = Self {
            rounds,
            ..Self::default()
        };
        kdf.randomize();
        kdf
    }

    /// Use the KDBX 4 identifier instead of the KDBX 3 one
    pub fn kdbx4(mut self) -> Self {
        self.uuid = KDF_AES_KDBX4;
        self
    }

    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    pub fn load(parameters: &VariantMap) -> Result<Self> {
        let salt: [u8; 32] = salt_param(parameters)?
            .try_into()
            .map_err(|_| Error::InvalidKdfParameters("AES-KDF salt must be 32 bytes".to_string()))?;
        let rounds = parameters
            .get_u64(KDF_PARAM_ROUNDS)
            .ok_or_else(|| Error::InvalidKdfParameters("AES-KDF rounds missing".to_string()))?;
        let uuid = parameters
            .get_bytes(KDF_PARAM_UUID)
            .and_then(|b| Uuid::from_slice(b).ok())
            .unwrap_or(KDF_AES_KDBX3);
        Ok(AesKdf { uuid, salt, rounds })
    }

    fn transform(&self, composite_key: &[u8]) -> std::result::Result<Vec<u8>, openssl::error::ErrorStack> {
        let cipher = Cipher::aes_256_ecb();
        let mut c = Crypter::new(cipher, Mode::Encrypt, &self.salt, None)?;
        c.pad(false);
        let mut transform_key = composite_key.to_owned();
        transform_key.resize(32 + cipher.block_size(), 0);
        let mut out = vec![0; 32 + cipher.block_size()];
        for _ in 0..self.rounds {
            c.update(&transform_key[0..32], &mut out)?;
            std::mem::swap(&mut transform_key, &mut out);
        }
        transform_key.truncate(32);
        Ok(digest(&SHA256, &transform_key).as_ref().to_owned())
    }
}

impl Kdf for AesKdf {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn randomize(&mut self) {
        rand::thread_rng().fill_bytes(&mut self.salt);
    }

    fn save(&self, parameters: &mut VariantMap) {
        parameters.insert(KDF_PARAM_ROUNDS, MapValue::UInt64(self.rounds));
        parameters.insert(KDF_PARAM_SALT, MapValue::ByteArray(self.salt.to_vec()));
    }

    fn transform_key(&self, composite_key: &[u8]) -> Result<Vec<u8>> {
        info!("Calculating transformed key ({} rounds)", self.rounds);
        if composite_key.len() != 32 {
            return Err(Error::KeyDerivation("composite key must be 32 bytes".to_string()));
        }
        let key = self
            .transform(composite_key)
            .map_err(|e| Error::KeyDerivation(e.to_string()))?;
        debug!("AES-KDF complete");
        Ok(key)
    }
}

impl Default for AesKdf {
    fn default() -> Self {
        Self {
            uuid: KDF_AES_KDBX3,
            salt: [0; 32],
            rounds: Self::DEFAULT_ROUNDS,
        }
    }
}
