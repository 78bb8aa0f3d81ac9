//! Error types for kdbx-codec

use std::io;

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for kdbx-codec operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while reading or writing a database or a translation catalog
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(io::Error),

    /// Not a KeePass file at all
    #[error("Not a KeePass database")]
    InvalidSignature,

    #[error("Unsupported KeePass database: {0}")]
    UnsupportedVersion(String),

    #[error("Unsupported cipher: {0}")]
    UnsupportedCipher(Uuid),

    #[error("Unsupported compression algorithm: {0}")]
    UnsupportedCompression(u32),

    #[error("Unknown key derivation function: {0}")]
    UnsupportedKdf(String),

    #[error("Invalid inner random stream cipher: {0}")]
    UnsupportedInnerStream(u32),

    #[error("Invalid header id size")]
    InvalidHeaderId,

    /// A header field has the wrong length for its type
    #[error("Invalid header field length: {field} ({length} bytes)")]
    InvalidHeaderField { field: &'static str, length: usize },

    #[error("Missing database header field: {0}")]
    MissingHeaderField(&'static str),

    #[error("Unsupported KeePass variant map version: {major}.{minor}")]
    UnsupportedVariantMapVersion { major: u8, minor: u8 },

    #[error("Invalid variant map entry: {0}")]
    InvalidVariantMap(String),

    #[error("Invalid KDF parameters: {0}")]
    InvalidKdfParameters(String),

    #[error("Unable to calculate database key: {0}")]
    KeyDerivation(String),

    #[error("Unable to open key file: {0}")]
    InvalidKeyFile(String),

    #[error("Unable to read password: {0}")]
    InvalidPassword(String),

    #[error("Key has no password or key file")]
    EmptyKey,

    /// Wrong password or key file
    #[error("Invalid credentials were provided, please try again. If this reoccurs, then your database file may be corrupt.")]
    InvalidCredentials,

    #[error("Header SHA256 mismatch")]
    HeaderHashMismatch,

    #[error("HMAC mismatch in block {index}")]
    BlockHmacMismatch { index: u64 },

    #[error("Hash mismatch in block {index}")]
    BlockHashMismatch { index: u64 },

    #[error("Cipher error: {0}")]
    Crypto(String),

    #[error("XML error: {0}")]
    Xml(String),

    #[error("Invalid translation file: {0}")]
    Translation(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::from_io(err)
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(err: openssl::error::ErrorStack) -> Self {
        Error::Crypto(err.to_string())
    }
}

impl Error {
    /// Wrap this error for transport through an `io::Read`/`io::Write` adapter
    pub(crate) fn into_io(self) -> io::Error {
        match self {
            Error::Io(err) => err,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }

    /// Recover an error tunnelled through `into_io`
    pub(crate) fn from_io(err: io::Error) -> Self {
        let tunnelled = err
            .get_ref()
            .map_or(false, |inner| inner.is::<Error>());
        if !tunnelled {
            return Error::Io(err);
        }
        match err.into_inner().map(|inner| inner.downcast::<Error>()) {
            Some(Ok(inner)) => *inner,
            Some(Err(other)) => Error::Io(io::Error::new(io::ErrorKind::InvalidData, other)),
            None => Error::Io(io::ErrorKind::InvalidData.into()),
        }
    }
}
