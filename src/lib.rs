//! Read, modify and write KeePass 2.x databases
//!
//! Both the KDBX 3.1 and KDBX 4.x containers are supported. A database is
//! opened into a [`KeePassDoc`], which pairs the XML document tree with the
//! [`DatabaseSettings`] it was stored with so it can be written back the
//! same way.
//!
//! ```no_run
//! use kdbx_codec::{KeePassDoc, Key};
//!
//! let key = Key::with_password("secret");
//! let doc = KeePassDoc::load_file("passwords.kdbx", &key)?;
//! for entry in doc.file.root_group().all_entries() {
//!     println!("{}", entry.title());
//! }
//! doc.save_file("copy.kdbx", &key)?;
//! # Ok::<(), kdbx_codec::Error>(())
//! ```
//!
//! The [`i18n`] module loads Qt Linguist translation catalogs.

use std::fs::File;
use std::io::prelude::*;
use std::io::{BufReader, BufWriter};
use std::path::Path;

mod block_stream;
pub mod cipher;
mod document;
pub mod error;
pub mod header;
pub mod i18n;
pub mod kdf;
mod key;
pub mod protected_stream;
mod reader;
pub mod variant_map;
mod writer;
mod xml_codec;

pub use crate::block_stream::{BlockReader, BlockWriter, HashedBlockReader, HashedBlockWriter};
pub use crate::cipher::CipherId;
pub use crate::document::*;
pub use crate::error::{Error, Result};
pub use crate::header::Compression;
pub use crate::i18n::Catalog;
pub use crate::kdf::{load_kdf, save_kdf, AesKdf, Kdf};
#[cfg(feature = "argon2")]
pub use crate::kdf::{Argon2Kdf, Argon2Variant};
pub use crate::key::Key;
pub use crate::protected_stream::InnerStreamId;
pub use crate::variant_map::{MapValue, VariantMap};

#[cfg(test)]
mod tests;

/// How a database is stored on disk
#[derive(Clone, Debug, PartialEq)]
pub struct DatabaseSettings {
    pub major_version: u16,
    pub minor_version: u16,
    pub cipher: CipherId,
    pub compression: Compression,
    /// KDF parameters including `$UUID`; a fresh salt is picked on every save
    pub kdf_parameters: VariantMap,
    pub inner_stream: InnerStreamId,
    pub public_custom_data: Option<VariantMap>,
    pub comment: Option<Vec<u8>>,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        #[cfg(feature = "argon2")]
        let kdf_parameters = save_kdf(&Argon2Kdf::new(Argon2Variant::Argon2d));
        #[cfg(not(feature = "argon2"))]
        let kdf_parameters = save_kdf(&AesKdf::new(AesKdf::DEFAULT_ROUNDS).kdbx4());
        DatabaseSettings {
            major_version: 4,
            minor_version: 0,
            cipher: CipherId::Aes256Cbc,
            compression: Compression::Gzip,
            kdf_parameters,
            inner_stream: InnerStreamId::ChaCha20,
            public_custom_data: None,
            comment: None,
        }
    }
}

impl DatabaseSettings {
    /// KDBX 3.1 with AES-KDF and a Salsa20 inner stream
    pub fn kdbx3() -> Self {
        DatabaseSettings {
            major_version: 3,
            minor_version: 1,
            kdf_parameters: save_kdf(&AesKdf::new(AesKdf::DEFAULT_ROUNDS)),
            inner_stream: InnerStreamId::Salsa20,
            ..Self::default()
        }
    }

    pub fn from_header(header: &header::Header, inner_stream: InnerStreamId) -> Self {
        DatabaseSettings {
            major_version: header.major_version,
            minor_version: header.minor_version,
            cipher: header.cipher,
            compression: header.compression,
            kdf_parameters: header.kdf_parameters.clone(),
            inner_stream,
            public_custom_data: header.public_custom_data.clone(),
            comment: header.comment.clone(),
        }
    }

    pub fn is_kdbx4(&self) -> bool {
        self.major_version >= 4
    }

    pub fn set_kdf(&mut self, kdf: &dyn Kdf) {
        self.kdf_parameters = save_kdf(kdf);
    }
}

/// An opened database and the settings it is saved with
#[derive(Clone, Debug, PartialEq)]
pub struct KeePassDoc {
    pub file: KeePassFile,
    pub settings: DatabaseSettings,
}

impl KeePassDoc {
    pub fn new(file: KeePassFile, settings: DatabaseSettings) -> Self {
        KeePassDoc { file, settings }
    }

    pub fn load<R: Read>(input: &mut R, key: &Key) -> Result<Self> {
        let (file, settings) = reader::read_database(input, key)?;
        Ok(KeePassDoc { file, settings })
    }

    pub fn load_file<P: AsRef<Path>>(path: P, key: &Key) -> Result<Self> {
        let mut input = BufReader::new(File::open(path)?);
        Self::load(&mut input, key)
    }

    pub fn save<W: Write>(&self, output: &mut W, key: &Key) -> Result<()> {
        writer::write_database(output, &self.file, &self.settings, key)
    }

    pub fn save_file<P: AsRef<Path>>(&self, path: P, key: &Key) -> Result<()> {
        let mut output = BufWriter::new(File::create(path)?);
        self.save(&mut output, key)?;
        output.flush()?;
        Ok(())
    }
}
