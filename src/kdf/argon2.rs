use std::convert::TryFrom;

use ::argon2::{Algorithm, Argon2, AssociatedData, ParamsBuilder, Version};
use log::{debug, info};

use super::*;

const DEFAULT_ITERATIONS: u64 = 2;
const DEFAULT_MEMORY: u64 = 1024 * 1024;
const DEFAULT_PARALLELISM: u32 = 2;
const DEFAULT_VERSION: u32 = 0x13;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Argon2Variant {
    Argon2d,
    Argon2id,
}

/// Argon2d / Argon2id key derivation as used by KDBX 4
#[derive(Clone, Debug, PartialEq)]
pub struct Argon2Kdf {
    variant: Argon2Variant,
    salt: Vec<u8>,
    iterations: u64,
    /// Memory in bytes
    memory: u64,
    parallelism: u32,
    version: u32,
    secret: Option<Vec<u8>>,
    associated_data: Option<Vec<u8>>,
}

impl Default for Argon2Kdf {
    fn default() -> Self {
        Self {
            variant: Argon2Variant::Argon2d,
            salt: vec![0; 32],
            iterations: DEFAULT_ITERATIONS,
            memory: DEFAULT_MEMORY,
            parallelism: DEFAULT_PARALLELISM,
            version: DEFAULT_VERSION,
            secret: None,
            associated_data: None,
        }
    }
}

fn invalid(message: &str) -> Error {
    Error::InvalidKdfParameters(message.to_string())
}

impl Argon2Kdf {
    pub fn new(variant: Argon2Variant) -> Self {
        let mut kdf = Self {
            variant,
            ..Self::default()
        };
        kdf.randomize();
        kdf
    }

    pub fn variant(&self) -> Argon2Variant {
        self.variant
    }

    pub fn with_iterations(mut self, iterations: u64) -> Self {
        self.iterations = iterations;
        self
    }

    /// Memory cost in bytes
    pub fn with_memory(mut self, memory: u64) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_parallelism(mut self, parallelism: u32) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn load(parameters: &VariantMap) -> Result<Self> {
        info!("Found Argon2 KDF");
        let variant = match parameters
            .get_bytes(KDF_PARAM_UUID)
            .and_then(|b| Uuid::from_slice(b).ok())
        {
            Some(KDF_ARGON2_ID) => Argon2Variant::Argon2id,
            _ => Argon2Variant::Argon2d,
        };
        let version = parameters
            .get_u32(KDF_PARAM_VERSION)
            .ok_or_else(|| invalid("Argon2 version missing"))?;
        if version != 0x10 && version != 0x13 {
            return Err(Error::InvalidKdfParameters(format!(
                "unsupported Argon2 version {:#x}",
                version
            )));
        }
        Ok(Self {
            variant,
            salt: salt_param(parameters)?.to_vec(),
            iterations: parameters
                .get_u64(KDF_PARAM_ITERATIONS)
                .ok_or_else(|| invalid("Argon2 iterations missing"))?,
            memory: parameters
                .get_u64(KDF_PARAM_MEMORY)
                .ok_or_else(|| invalid("Argon2 memory missing"))?,
            parallelism: parameters
                .get_u32(KDF_PARAM_PARALLELISM)
                .ok_or_else(|| invalid("Argon2 parallelism missing"))?,
            version,
            secret: parameters.get_bytes(KDF_PARAM_SECRET_KEY).map(|v| v.to_vec()),
            associated_data: parameters.get_bytes(KDF_PARAM_ASSOC_DATA).map(|v| v.to_vec()),
        })
    }

    fn hasher(&self) -> Result<Argon2<'_>> {
        let algorithm = match self.variant {
            Argon2Variant::Argon2d => Algorithm::Argon2d,
            Argon2Variant::Argon2id => Algorithm::Argon2id,
        };
        let version = match self.version {
            0x10 => Version::V0x10,
            _ => Version::V0x13,
        };
        let memory_kib = u32::try_from(self.memory / 1024).map_err(|_| invalid("Argon2 memory too large"))?;
        let iterations = u32::try_from(self.iterations).map_err(|_| invalid("Argon2 iterations too large"))?;

        let mut builder = ParamsBuilder::new();
        builder
            .m_cost(memory_kib)
            .t_cost(iterations)
            .p_cost(self.parallelism)
            .output_len(32);
        if let Some(ad) = &self.associated_data {
            builder.data(AssociatedData::new(ad).map_err(|e| Error::InvalidKdfParameters(e.to_string()))?);
        }
        let params = builder
            .build()
            .map_err(|e| Error::InvalidKdfParameters(e.to_string()))?;
        match &self.secret {
            Some(secret) => Argon2::new_with_secret(secret, algorithm, version, params)
                .map_err(|e| Error::InvalidKdfParameters(e.to_string())),
            None => Ok(Argon2::new(algorithm, version, params)),
        }
    }
}

impl Kdf for Argon2Kdf {
    fn uuid(&self) -> Uuid {
        match self.variant {
            Argon2Variant::Argon2d => KDF_ARGON2_D,
            Argon2Variant::Argon2id => KDF_ARGON2_ID,
        }
    }

    fn randomize(&mut self) {
        self.salt = vec![0; 32];
        rand::thread_rng().fill_bytes(&mut self.salt);
    }

    fn save(&self, parameters: &mut VariantMap) {
        parameters.insert(KDF_PARAM_SALT, MapValue::ByteArray(self.salt.clone()));
        parameters.insert(KDF_PARAM_ITERATIONS, MapValue::UInt64(self.iterations));
        parameters.insert(KDF_PARAM_MEMORY, MapValue::UInt64(self.memory));
        parameters.insert(KDF_PARAM_PARALLELISM, MapValue::UInt32(self.parallelism));
        parameters.insert(KDF_PARAM_VERSION, MapValue::UInt32(self.version));
        if let Some(secret) = &self.secret {
            parameters.insert(KDF_PARAM_SECRET_KEY, MapValue::ByteArray(secret.clone()));
        }
        if let Some(ad) = &self.associated_data {
            parameters.insert(KDF_PARAM_ASSOC_DATA, MapValue::ByteArray(ad.clone()));
        }
    }

    fn transform_key(&self, composite_key: &[u8]) -> Result<Vec<u8>> {
        debug!(
            "{:?}: {} iterations, {} KiB, {} lanes, version {:#x}",
            self.variant,
            self.iterations,
            self.memory / 1024,
            self.parallelism,
            self.version
        );
        let hasher = self.hasher()?;
        let mut output = vec![0; 32];
        hasher
            .hash_password_into(composite_key, &self.salt, &mut output)
            .map_err(|e| Error::KeyDerivation(e.to_string()))?;
        Ok(output)
    }
}
