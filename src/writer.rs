//! Encoding a database into a KDBX 3 or KDBX 4 container

use std::convert::TryInto;
use std::io::prelude::*;

use log::{debug, info, warn};
use rand::RngCore;
use ring::digest::{digest, SHA256};
use ring::hmac;

use crate::block_stream::{block_hmac_key, BlockWriter, HashedBlockWriter};
use crate::document::{Binary, KeePassFile};
use crate::error::{Error, Result};
use crate::header::{Compression, Header, InnerHeader};
use crate::kdf::{load_kdf, master_keys, save_kdf};
use crate::key::Key;
use crate::protected_stream::{open_stream, InnerStreamId};
use crate::xml_codec::{write_document, KdbxContext};
use crate::DatabaseSettings;

fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

pub(crate) fn write_database<W: Write>(
    output: &mut W,
    file: &KeePassFile,
    settings: &DatabaseSettings,
    key: &Key,
) -> Result<()> {
    let composite_key = key.composite_key()?;
    let mut kdf = load_kdf(&settings.kdf_parameters)?;
    kdf.randomize();

    let inner_stream = match settings.inner_stream {
        InnerStreamId::ArcFourVariant => {
            warn!("ArcFour inner stream is read only, saving with Salsa20");
            InnerStreamId::Salsa20
        }
        other => other,
    };
    let header = Header {
        major_version: settings.major_version,
        minor_version: settings.minor_version,
        cipher: settings.cipher,
        compression: settings.compression,
        master_seed: random_bytes(32),
        encryption_iv: random_bytes(settings.cipher.iv_size()),
        kdf_parameters: save_kdf(kdf.as_ref()),
        comment: settings.comment.clone(),
        public_custom_data: settings.public_custom_data.clone(),
        protected_stream_key: random_bytes(inner_stream.key_size()),
        stream_start_bytes: random_bytes(32),
        inner_stream,
    };
    // Fails early on a KDF this format version cannot store
    let raw_header = header.write()?;
    info!(
        "Saving KDBX {}.{} database ({}, {:?} compression)",
        header.major_version, header.minor_version, header.cipher, header.compression
    );

    let transformed_key = kdf.transform_key(&composite_key)?;
    let (cipher_key, hmac_key_base) = master_keys(&header.master_seed, &transformed_key);
    if header.is_kdbx4() {
        write_kdbx4(output, file, &header, &raw_header, &cipher_key, &hmac_key_base)
    } else {
        write_kdbx3(output, file, &header, &raw_header, &cipher_key)
    }
}

fn write_kdbx4<W: Write>(
    output: &mut W,
    file: &KeePassFile,
    header: &Header,
    raw_header: &[u8],
    cipher_key: &[u8],
    hmac_key_base: &[u8],
) -> Result<()> {
    let inner_header = InnerHeader {
        inner_stream: header.inner_stream,
        inner_stream_key: header.protected_stream_key.clone(),
        binaries: file.collect_binaries(),
    };
    let mut payload = Vec::new();
    inner_header.write(&mut payload)?;

    let inner_cipher = open_stream(inner_header.inner_stream, &inner_header.inner_stream_key)?;
    let mut context = KdbxContext::new(header.major_version, inner_cipher);
    context.binaries = inner_header.binaries;
    payload.extend(write_document(file.clone(), "KeePassFile", &mut context).map_err(Error::Xml)?);

    let plaintext = header.compression.compress(payload)?;
    let ciphertext = header
        .cipher
        .encrypt(cipher_key, &header.encryption_iv, &plaintext)?;

    output.write_all(raw_header)?;
    output.write_all(digest(&SHA256, raw_header).as_ref())?;
    let header_hmac = hmac::sign(&block_hmac_key(u64::MAX, hmac_key_base), raw_header);
    output.write_all(header_hmac.as_ref())?;
    let mut blocks = BlockWriter::new(hmac_key_base, &mut *output);
    blocks.write_all(&ciphertext)?;
    blocks.finish()?.flush()?;
    debug!("Wrote {} bytes of encrypted payload", ciphertext.len());
    Ok(())
}

fn write_kdbx3<W: Write>(
    output: &mut W,
    file: &KeePassFile,
    header: &Header,
    raw_header: &[u8],
    cipher_key: &[u8],
) -> Result<()> {
    let pool = file.collect_binaries();
    let mut file = file.clone();
    let header_hash: [u8; 32] = digest(&SHA256, raw_header)
        .as_ref()
        .try_into()
        .map_err(|_| Error::HeaderHashMismatch)?;
    file.meta_mut().set_header_hash(Some(header_hash));
    if pool.is_empty() {
        file.meta_mut().set_binaries(None);
    } else {
        let binaries = pool
            .iter()
            .enumerate()
            .map(|(id, binary)| Binary::new(id, binary.clone()))
            .collect();
        file.meta_mut().set_binaries(Some(binaries));
    }

    let inner_cipher = open_stream(header.inner_stream, &header.protected_stream_key)?;
    let mut context = KdbxContext::new(header.major_version, inner_cipher);
    context.binaries = pool;
    context.compress_binaries = header.compression == Compression::Gzip;
    let xml = write_document(file, "KeePassFile", &mut context).map_err(Error::Xml)?;
    let compressed = header.compression.compress(xml)?;

    let mut plaintext = header.stream_start_bytes.clone();
    let mut blocks = HashedBlockWriter::new(&mut plaintext);
    blocks.write_all(&compressed)?;
    blocks.finish()?;
    let ciphertext = header
        .cipher
        .encrypt(cipher_key, &header.encryption_iv, &plaintext)?;

    output.write_all(raw_header)?;
    output.write_all(&ciphertext)?;
    output.flush()?;
    debug!("Wrote {} bytes of encrypted payload", ciphertext.len());
    Ok(())
}
