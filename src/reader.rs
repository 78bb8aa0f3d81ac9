//! Decoding a complete KDBX 3 or KDBX 4 container

use std::convert::TryInto;
use std::io::prelude::*;
use std::io::Cursor;

use log::{debug, info};
use ring::digest::{digest, SHA256};
use ring::hmac;

use crate::block_stream::{block_hmac_key, BlockReader, HashedBlockReader};
use crate::document::KeePassFile;
use crate::error::{Error, Result};
use crate::header::{Header, InnerHeader};
use crate::kdf::{load_kdf, master_keys};
use crate::key::Key;
use crate::protected_stream::open_stream;
use crate::xml_codec::{parse_document, KdbxContext};
use crate::DatabaseSettings;

fn transformed_key(header: &Header, key: &Key) -> Result<Vec<u8>> {
    let composite_key = key.composite_key()?;
    let kdf = load_kdf(&header.kdf_parameters)?;
    debug!("Deriving key with KDF {}", kdf.uuid());
    kdf.transform_key(&composite_key)
}

pub(crate) fn read_database<R: Read>(input: &mut R, key: &Key) -> Result<(KeePassFile, DatabaseSettings)> {
    let (header, raw_header) = Header::read(input)?;
    info!(
        "Opening KDBX {}.{} database ({}, {:?} compression)",
        header.major_version, header.minor_version, header.cipher, header.compression
    );
    let header_hash = digest(&SHA256, &raw_header);
    if header.is_kdbx4() {
        read_kdbx4(input, key, header, &raw_header, header_hash.as_ref())
    } else {
        read_kdbx3(input, key, header, header_hash.as_ref())
    }
}

fn read_kdbx4<R: Read>(
    input: &mut R,
    key: &Key,
    header: Header,
    raw_header: &[u8],
    header_hash: &[u8],
) -> Result<(KeePassFile, DatabaseSettings)> {
    let mut stored_hash = [0u8; 32];
    input.read_exact(&mut stored_hash)?;
    if stored_hash[..] != *header_hash {
        return Err(Error::HeaderHashMismatch);
    }
    let mut stored_hmac = [0u8; 32];
    input.read_exact(&mut stored_hmac)?;

    let transformed_key = transformed_key(&header, key)?;
    let (cipher_key, hmac_key_base) = master_keys(&header.master_seed, &transformed_key);
    hmac::verify(&block_hmac_key(u64::MAX, &hmac_key_base), raw_header, &stored_hmac)
        .map_err(|_| Error::InvalidCredentials)?;

    let mut ciphertext = Vec::new();
    BlockReader::new(&hmac_key_base, &mut *input)
        .read_to_end(&mut ciphertext)
        .map_err(Error::from_io)?;
    debug!("Read {} bytes of encrypted payload", ciphertext.len());
    let plaintext = header
        .cipher
        .decrypt(&cipher_key, &header.encryption_iv, &ciphertext)?;
    let payload = header.compression.decompress(plaintext)?;

    let mut cursor = Cursor::new(&payload[..]);
    let inner_header = InnerHeader::read(&mut cursor)?;
    let xml = &payload[cursor.position() as usize..];
    let inner_cipher = open_stream(inner_header.inner_stream, &inner_header.inner_stream_key)?;
    let mut context = KdbxContext::new(header.major_version, inner_cipher);
    context.binaries = inner_header.binaries;
    let file: KeePassFile = parse_document(xml, "KeePassFile", &mut context).map_err(Error::Xml)?;

    let settings = DatabaseSettings::from_header(&header, inner_header.inner_stream);
    Ok((file, settings))
}

fn read_kdbx3<R: Read>(
    input: &mut R,
    key: &Key,
    header: Header,
    header_hash: &[u8],
) -> Result<(KeePassFile, DatabaseSettings)> {
    let transformed_key = transformed_key(&header, key)?;
    let (cipher_key, _) = master_keys(&header.master_seed, &transformed_key);

    let mut ciphertext = Vec::new();
    input.read_to_end(&mut ciphertext)?;
    let plaintext = header
        .cipher
        .decrypt(&cipher_key, &header.encryption_iv, &ciphertext)?;
    let start_len = header.stream_start_bytes.len();
    if plaintext.len() < start_len || plaintext[..start_len] != header.stream_start_bytes[..] {
        return Err(Error::InvalidCredentials);
    }

    let mut blocks = Vec::new();
    HashedBlockReader::new(&plaintext[start_len..])
        .read_to_end(&mut blocks)
        .map_err(Error::from_io)?;
    let xml = header.compression.decompress(blocks)?;

    let inner_cipher = open_stream(header.inner_stream, &header.protected_stream_key)?;
    let mut context = KdbxContext::new(header.major_version, inner_cipher);
    let mut file: KeePassFile = parse_document(&xml, "KeePassFile", &mut context).map_err(Error::Xml)?;

    if let Some(stored_hash) = file.meta().header_hash() {
        let expected: &[u8; 32] = header_hash.try_into().map_err(|_| Error::HeaderHashMismatch)?;
        if stored_hash != expected {
            return Err(Error::HeaderHashMismatch);
        }
    }
    // Both are regenerated on save
    file.meta_mut().set_header_hash(None);
    file.meta_mut().set_binaries(None);

    let settings = DatabaseSettings::from_header(&header, header.inner_stream);
    Ok((file, settings))
}

