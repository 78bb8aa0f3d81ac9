//! Outer and inner KDBX headers

use std::collections::BTreeMap;
use std::io::prelude::*;
use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use log::{debug, warn};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};
use uuid::Uuid;

use crate::block_stream::read_len;
use crate::cipher::CipherId;
use crate::error::{Error, Result};
use crate::kdf::{KDF_AES_KDBX3, KDF_AES_KDBX4, KDF_PARAM_ROUNDS, KDF_PARAM_SALT, KDF_PARAM_UUID};
use crate::protected_stream::InnerStreamId;
use crate::variant_map::{MapValue, VariantMap};

pub const KDBX_MAGIC: u32 = 0x9AA2D903;

const KDBX1_MAGIC_TYPE: u32 = 0xB54BFB65;
const KDBX2_BETA_MAGIC_TYPE: u32 = 0xB54BFB66;
const KDBX2_MAGIC_TYPE: u32 = 0xB54BFB67;

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum Compression {
    None = 0,
    Gzip = 1,
}

impl Default for Compression {
    fn default() -> Self {
        Compression::Gzip
    }
}

impl Compression {
    pub fn compress(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(data),
            Compression::Gzip => {
                let mut gz = GzEncoder::new(Vec::new(), flate2::Compression::default());
                gz.write_all(&data)?;
                Ok(gz.finish()?)
            }
        }
    }

    pub fn decompress(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(data),
            Compression::Gzip => {
                let mut output = Vec::new();
                GzDecoder::new(&data[..]).read_to_end(&mut output)?;
                Ok(output)
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
enum TlvType {
    End = 0,
    Comment = 1,
    CipherId = 2,
    CompressionFlags = 3,
    MasterSeed = 4,
    TransformSeed = 5,
    TransformRounds = 6,
    EncryptionIv = 7,
    ProtectedStreamKey = 8,
    StreamStartBytes = 9,
    InnerRandomStreamId = 10,
    KdfParameters = 11,
    PublicCustomData = 12,
}

impl TlvType {
    fn name(id: u8) -> &'static str {
        match Self::from_u8(id) {
            Some(TlvType::End) => "EndOfHeader",
            Some(TlvType::Comment) => "Comment",
            Some(TlvType::CipherId) => "CipherID",
            Some(TlvType::CompressionFlags) => "CompressionFlags",
            Some(TlvType::MasterSeed) => "MasterSeed",
            Some(TlvType::TransformSeed) => "TransformSeed",
            Some(TlvType::TransformRounds) => "TransformRounds",
            Some(TlvType::EncryptionIv) => "EncryptionIV",
            Some(TlvType::ProtectedStreamKey) => "ProtectedStreamKey",
            Some(TlvType::StreamStartBytes) => "StreamStartBytes",
            Some(TlvType::InnerRandomStreamId) => "InnerRandomStreamID",
            Some(TlvType::KdfParameters) => "KdfParameters",
            Some(TlvType::PublicCustomData) => "PublicCustomData",
            None => "Unknown",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
enum InnerTlvType {
    End = 0,
    InnerRandomStreamId = 1,
    InnerRandomStreamKey = 2,
    Binary = 3,
}

type Tlvs = BTreeMap<u8, Vec<Vec<u8>>>;

/// Read TLVs up to the end marker, returning them and their raw bytes
fn load_tlvs<R: Read>(input: &mut R, major_version: u16) -> Result<(Tlvs, Vec<u8>)> {
    let mut tlvs = Tlvs::new();
    let mut header_blob = Vec::new();
    loop {
        let mut tlv_header = if major_version <= 3 {
            vec![0; 3]
        } else {
            vec![0; 5]
        };
        input.read_exact(&mut tlv_header)?;
        header_blob.extend(&tlv_header);
        let mut header_cursor = Cursor::new(tlv_header);
        let tlv_type = header_cursor.read_u8()?;
        let tlv_len = if major_version <= 3 {
            header_cursor.read_u16::<LittleEndian>()? as u32
        } else {
            header_cursor.read_u32::<LittleEndian>()?
        };
        let tlv_data = read_len(input, tlv_len)?;
        header_blob.extend(&tlv_data);
        debug!("TLV({}, {})", TlvType::name(tlv_type), tlv_len);
        if tlv_type == 0 {
            break;
        }
        tlvs.entry(tlv_type).or_insert_with(Vec::new).push(tlv_data);
    }
    Ok((tlvs, header_blob))
}

fn save_tlvs(tlvs: &[(u8, Vec<u8>)], major_version: u16, end: &[u8]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let term = (TlvType::End as u8, end.to_vec());
    for (key, value) in tlvs.iter().chain(std::iter::once(&term)) {
        buf.write_u8(*key)?;
        if major_version <= 3 {
            if value.len() > u16::MAX as usize {
                return Err(Error::InvalidHeaderField {
                    field: TlvType::name(*key),
                    length: value.len(),
                });
            }
            buf.write_u16::<LittleEndian>(value.len() as u16)?;
        } else {
            buf.write_u32::<LittleEndian>(value.len() as u32)?;
        }
        buf.write_all(value)?;
    }
    Ok(buf)
}

fn first<'a>(tlvs: &'a Tlvs, id: TlvType) -> Option<&'a [u8]> {
    tlvs.get(&(id as u8)).and_then(|v| v.first()).map(|v| v.as_slice())
}

fn required<'a>(tlvs: &'a Tlvs, id: TlvType) -> Result<&'a [u8]> {
    first(tlvs, id).ok_or_else(|| Error::MissingHeaderField(TlvType::name(id as u8)))
}

fn sized<'a>(tlvs: &'a Tlvs, id: TlvType, size: usize) -> Result<&'a [u8]> {
    let value = required(tlvs, id)?;
    if value.len() != size {
        return Err(Error::InvalidHeaderField {
            field: TlvType::name(id as u8),
            length: value.len(),
        });
    }
    Ok(value)
}

fn read_u32_field(tlvs: &Tlvs, id: TlvType) -> Result<u32> {
    let mut c = Cursor::new(sized(tlvs, id, 4)?);
    Ok(c.read_u32::<LittleEndian>()?)
}

/// Outer database header
///
/// KDBX 3 transform seed and rounds are kept in `kdf_parameters` as an
/// AES-KDF parameter set so both versions derive keys the same way.
#[derive(Clone, Debug, PartialEq)]
pub struct Header {
    pub major_version: u16,
    pub minor_version: u16,
    pub cipher: CipherId,
    pub compression: Compression,
    pub master_seed: Vec<u8>,
    pub encryption_iv: Vec<u8>,
    pub kdf_parameters: VariantMap,
    pub comment: Option<Vec<u8>>,
    pub public_custom_data: Option<VariantMap>,
    pub protected_stream_key: Vec<u8>,
    pub stream_start_bytes: Vec<u8>,
    pub inner_stream: InnerStreamId,
}

impl Header {
    pub fn is_kdbx4(&self) -> bool {
        self.major_version >= 4
    }

    /// Parse the signatures, version and header fields
    ///
    /// Returns the header and every byte consumed, which the caller hashes.
    pub fn read<R: Read>(input: &mut R) -> Result<(Header, Vec<u8>)> {
        let mut prefix = [0u8; 12];
        input.read_exact(&mut prefix)?;
        let mut c = Cursor::new(&prefix[..]);
        let magic = c.read_u32::<LittleEndian>()?;
        let magic_type = c.read_u32::<LittleEndian>()?;
        let minor_version = c.read_u16::<LittleEndian>()?;
        let major_version = c.read_u16::<LittleEndian>()?;

        if magic != KDBX_MAGIC {
            return Err(Error::InvalidSignature);
        }
        match magic_type {
            KDBX1_MAGIC_TYPE => {
                return Err(Error::UnsupportedVersion("KeePass 1.x".to_string()));
            }
            KDBX2_BETA_MAGIC_TYPE => warn!("Opening KeePass 2.x pre-release database"),
            KDBX2_MAGIC_TYPE => (),
            _ => return Err(Error::InvalidSignature),
        }
        if !(2..=4).contains(&major_version) {
            return Err(Error::UnsupportedVersion(format!(
                "KDBX {}.{}",
                major_version, minor_version
            )));
        }
        debug!("KDBX version {}.{}", major_version, minor_version);

        let (tlvs, blob) = load_tlvs(input, major_version)?;
        let mut raw = prefix.to_vec();
        raw.extend(blob);

        let cipher_id = Uuid::from_slice(sized(&tlvs, TlvType::CipherId, 16)?)
            .map_err(|_| Error::InvalidHeaderField {
                field: "CipherID",
                length: 16,
            })?;
        let cipher = CipherId::from_uuid(cipher_id)?;

        let compression = match first(&tlvs, TlvType::CompressionFlags) {
            Some(_) => {
                let flags = read_u32_field(&tlvs, TlvType::CompressionFlags)?;
                Compression::from_u32(flags).ok_or(Error::UnsupportedCompression(flags))?
            }
            None => Compression::None,
        };

        let master_seed = sized(&tlvs, TlvType::MasterSeed, 32)?.to_vec();
        let encryption_iv = sized(&tlvs, TlvType::EncryptionIv, cipher.iv_size())?.to_vec();
        let comment = first(&tlvs, TlvType::Comment).map(|c| c.to_vec());

        let mut header = Header {
            major_version,
            minor_version,
            cipher,
            compression,
            master_seed,
            encryption_iv,
            kdf_parameters: VariantMap::new(),
            comment,
            public_custom_data: None,
            protected_stream_key: Vec::new(),
            stream_start_bytes: Vec::new(),
            inner_stream: InnerStreamId::None,
        };

        if header.is_kdbx4() {
            header.kdf_parameters = VariantMap::load(required(&tlvs, TlvType::KdfParameters)?)?;
            header.public_custom_data = first(&tlvs, TlvType::PublicCustomData)
                .map(VariantMap::load)
                .transpose()?;
        } else {
            let transform_seed = sized(&tlvs, TlvType::TransformSeed, 32)?;
            let mut c = Cursor::new(sized(&tlvs, TlvType::TransformRounds, 8)?);
            let transform_rounds = c.read_u64::<LittleEndian>()?;
            header.kdf_parameters.insert(
                KDF_PARAM_UUID,
                MapValue::ByteArray(KDF_AES_KDBX3.as_bytes().to_vec()),
            );
            header
                .kdf_parameters
                .insert(KDF_PARAM_SALT, MapValue::ByteArray(transform_seed.to_vec()));
            header
                .kdf_parameters
                .insert(KDF_PARAM_ROUNDS, MapValue::UInt64(transform_rounds));
            header.protected_stream_key = required(&tlvs, TlvType::ProtectedStreamKey)?.to_vec();
            header.stream_start_bytes = sized(&tlvs, TlvType::StreamStartBytes, 32)?.to_vec();
            header.inner_stream =
                InnerStreamId::from_id(read_u32_field(&tlvs, TlvType::InnerRandomStreamId)?)?;
        }

        Ok((header, raw))
    }

    /// Serialize the complete header including signatures and end marker
    pub fn write(&self) -> Result<Vec<u8>> {
        let mut output = Vec::new();
        output.write_u32::<LittleEndian>(KDBX_MAGIC)?;
        output.write_u32::<LittleEndian>(KDBX2_MAGIC_TYPE)?;
        output.write_u16::<LittleEndian>(self.minor_version)?;
        output.write_u16::<LittleEndian>(self.major_version)?;

        let mut tlvs = Vec::new();
        if let Some(comment) = &self.comment {
            tlvs.push((TlvType::Comment as u8, comment.clone()));
        }
        tlvs.push((TlvType::CipherId as u8, self.cipher.uuid().as_bytes().to_vec()));
        let compression = self.compression.to_u32().unwrap_or(0);
        tlvs.push((TlvType::CompressionFlags as u8, compression.to_le_bytes().to_vec()));
        tlvs.push((TlvType::MasterSeed as u8, self.master_seed.clone()));

        if self.is_kdbx4() {
            tlvs.push((TlvType::EncryptionIv as u8, self.encryption_iv.clone()));
            tlvs.push((TlvType::KdfParameters as u8, self.kdf_parameters.save()));
            if let Some(custom_data) = &self.public_custom_data {
                tlvs.push((TlvType::PublicCustomData as u8, custom_data.save()));
            }
        } else {
            let kdf_uuid = self
                .kdf_parameters
                .get_bytes(KDF_PARAM_UUID)
                .and_then(|b| Uuid::from_slice(b).ok());
            if kdf_uuid != Some(KDF_AES_KDBX3) && kdf_uuid != Some(KDF_AES_KDBX4) {
                return Err(Error::UnsupportedKdf(format!(
                    "KDBX {} requires AES-KDF",
                    self.major_version
                )));
            }
            let salt = self
                .kdf_parameters
                .get_bytes(KDF_PARAM_SALT)
                .ok_or(Error::MissingHeaderField("TransformSeed"))?;
            let rounds = self
                .kdf_parameters
                .get_u64(KDF_PARAM_ROUNDS)
                .ok_or(Error::MissingHeaderField("TransformRounds"))?;
            tlvs.push((TlvType::TransformSeed as u8, salt.to_vec()));
            tlvs.push((TlvType::TransformRounds as u8, rounds.to_le_bytes().to_vec()));
            tlvs.push((TlvType::EncryptionIv as u8, self.encryption_iv.clone()));
            tlvs.push((TlvType::ProtectedStreamKey as u8, self.protected_stream_key.clone()));
            tlvs.push((TlvType::StreamStartBytes as u8, self.stream_start_bytes.clone()));
            let stream_id = self.inner_stream.to_u32().unwrap_or(0);
            tlvs.push((TlvType::InnerRandomStreamId as u8, stream_id.to_le_bytes().to_vec()));
        }

        output.extend(save_tlvs(&tlvs, self.major_version, b"\r\n\r\n")?);
        Ok(output)
    }
}

const BINARY_FLAG_PROTECTED: u8 = 0x01;

/// Attachment in the binary pool
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolBinary {
    /// Kept in protected memory by KeePass
    pub protected: bool,
    pub data: Vec<u8>,
}

impl PoolBinary {
    pub fn new(data: Vec<u8>, protected: bool) -> Self {
        PoolBinary { protected, data }
    }
}

/// KDBX 4 inner header found at the start of the decrypted payload
#[derive(Clone, Debug, PartialEq)]
pub struct InnerHeader {
    pub inner_stream: InnerStreamId,
    pub inner_stream_key: Vec<u8>,
    pub binaries: Vec<PoolBinary>,
}

impl InnerHeader {
    pub fn read<R: Read>(input: &mut R) -> Result<Self> {
        let (tlvs, _) = load_tlvs(input, 4)?;
        let stream_id = match tlvs
            .get(&(InnerTlvType::InnerRandomStreamId as u8))
            .and_then(|v| v.first())
        {
            Some(value) if value.len() == 4 => {
                Cursor::new(value).read_u32::<LittleEndian>()?
            }
            Some(value) => {
                return Err(Error::InvalidHeaderField {
                    field: "InnerRandomStreamID",
                    length: value.len(),
                })
            }
            None => return Err(Error::MissingHeaderField("InnerRandomStreamID")),
        };
        let inner_stream_key = tlvs
            .get(&(InnerTlvType::InnerRandomStreamKey as u8))
            .and_then(|v| v.first())
            .cloned()
            .ok_or(Error::MissingHeaderField("InnerRandomStreamKey"))?;
        let mut binaries = Vec::new();
        for binary in tlvs.get(&(InnerTlvType::Binary as u8)).into_iter().flatten() {
            match binary.split_first() {
                Some((flags, data)) => binaries.push(PoolBinary::new(
                    data.to_vec(),
                    flags & BINARY_FLAG_PROTECTED != 0,
                )),
                None => {
                    return Err(Error::InvalidHeaderField {
                        field: "Binary",
                        length: 0,
                    })
                }
            }
        }
        debug!("Inner header with {} binaries", binaries.len());
        Ok(Self {
            inner_stream: InnerStreamId::from_id(stream_id)?,
            inner_stream_key,
            binaries,
        })
    }

    pub fn write<W: Write>(&self, output: &mut W) -> Result<()> {
        let mut tlvs = vec![
            (
                InnerTlvType::InnerRandomStreamId as u8,
                self.inner_stream.to_u32().unwrap_or(0).to_le_bytes().to_vec(),
            ),
            (InnerTlvType::InnerRandomStreamKey as u8, self.inner_stream_key.clone()),
        ];
        for binary in &self.binaries {
            let mut value = Vec::with_capacity(binary.data.len() + 1);
            value.push(if binary.protected { BINARY_FLAG_PROTECTED } else { 0 });
            value.extend(&binary.data);
            tlvs.push((InnerTlvType::Binary as u8, value));
        }
        output.write_all(&save_tlvs(&tlvs, 4, &[])?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kdbx4_header() -> Header {
        let mut kdf_parameters = VariantMap::new();
        kdf_parameters.insert(
            KDF_PARAM_UUID,
            MapValue::ByteArray(KDF_AES_KDBX4.as_bytes().to_vec()),
        );
        kdf_parameters.insert(KDF_PARAM_SALT, MapValue::ByteArray(vec![7; 32]));
        kdf_parameters.insert(KDF_PARAM_ROUNDS, MapValue::UInt64(1000));
        Header {
            major_version: 4,
            minor_version: 1,
            cipher: CipherId::ChaCha20,
            compression: Compression::Gzip,
            master_seed: vec![1; 32],
            encryption_iv: vec![2; 12],
            kdf_parameters,
            comment: None,
            public_custom_data: None,
            protected_stream_key: Vec::new(),
            stream_start_bytes: Vec::new(),
            inner_stream: InnerStreamId::None,
        }
    }

    #[test]
    fn test_kdbx4_header() {
        let header = kdbx4_header();
        let bytes = header.write().unwrap();
        let (loaded, raw) = Header::read(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(raw, bytes);
        assert_eq!(loaded, header);
    }

    #[test]
    fn test_kdbx3_header() {
        let mut header = kdbx4_header();
        header.major_version = 3;
        header.minor_version = 1;
        header.cipher = CipherId::Aes256Cbc;
        header.encryption_iv = vec![3; 16];
        header.protected_stream_key = vec![4; 32];
        header.stream_start_bytes = vec![5; 32];
        header.inner_stream = InnerStreamId::Salsa20;
        header.comment = Some(b"note".to_vec());
        let bytes = header.write().unwrap();
        let (loaded, _) = Header::read(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(loaded.inner_stream, InnerStreamId::Salsa20);
        assert_eq!(loaded.kdf_parameters.get_u64(KDF_PARAM_ROUNDS), Some(1000));
        assert_eq!(loaded.kdf_parameters.get_bytes(KDF_PARAM_SALT), Some(&[7u8; 32][..]));
        assert_eq!(loaded.comment, Some(b"note".to_vec()));
        assert_eq!(loaded.stream_start_bytes, vec![5; 32]);
    }

    #[test]
    fn test_kdbx3_needs_aes_kdf() {
        let mut header = kdbx4_header();
        header.major_version = 3;
        header.kdf_parameters.insert(
            KDF_PARAM_UUID,
            MapValue::ByteArray(crate::kdf::KDF_ARGON2_D.as_bytes().to_vec()),
        );
        assert!(matches!(header.write(), Err(Error::UnsupportedKdf(_))));
    }

    #[test]
    fn test_signatures() {
        let mut bytes = kdbx4_header().write().unwrap();
        bytes[0] ^= 1;
        assert!(matches!(
            Header::read(&mut Cursor::new(&bytes)),
            Err(Error::InvalidSignature)
        ));

        let mut bytes = kdbx4_header().write().unwrap();
        bytes[4..8].copy_from_slice(&KDBX1_MAGIC_TYPE.to_le_bytes());
        assert!(matches!(
            Header::read(&mut Cursor::new(&bytes)),
            Err(Error::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn test_future_version() {
        let mut header = kdbx4_header();
        header.major_version = 5;
        let bytes = header.write().unwrap();
        assert!(matches!(
            Header::read(&mut Cursor::new(&bytes)),
            Err(Error::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn test_bad_seed_length() {
        let mut header = kdbx4_header();
        header.master_seed = vec![1; 31];
        let bytes = header.write().unwrap();
        match Header::read(&mut Cursor::new(&bytes)) {
            Err(Error::InvalidHeaderField { field, length }) => {
                assert_eq!(field, "MasterSeed");
                assert_eq!(length, 31);
            }
            other => panic!("Unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_oversized_field_length() {
        let mut bytes = kdbx4_header().write().unwrap();
        bytes.truncate(12);
        // Comment claiming nearly 4 GiB
        bytes.push(TlvType::Comment as u8);
        bytes.extend(&0xFFFF_FFF0u32.to_le_bytes());
        bytes.extend(b"short");
        match Header::read(&mut Cursor::new(&bytes)) {
            Err(Error::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("Unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_kdbx3_field_overflow() {
        let tlvs = vec![(TlvType::Comment as u8, vec![0; 70000])];
        assert!(matches!(
            save_tlvs(&tlvs, 3, &[]),
            Err(Error::InvalidHeaderField { field: "Comment", .. })
        ));
        assert!(save_tlvs(&tlvs, 4, &[]).is_ok());
    }

    #[test]
    fn test_gzip() {
        let data = b"<KeePassFile></KeePassFile>".repeat(20);
        let packed = Compression::Gzip.compress(data.clone()).unwrap();
        assert_eq!(&packed[..2], &[0x1f, 0x8b]);
        assert!(packed.len() < data.len());
        assert_eq!(Compression::Gzip.decompress(packed).unwrap(), data);
        assert_eq!(Compression::None.compress(data.clone()).unwrap(), data);
        assert!(Compression::Gzip.decompress(data).is_err());
    }

    #[test]
    fn test_inner_header() {
        let inner = InnerHeader {
            inner_stream: InnerStreamId::ChaCha20,
            inner_stream_key: vec![9; 64],
            binaries: vec![
                PoolBinary::new(b"first".to_vec(), false),
                PoolBinary::new(Vec::new(), false),
                PoolBinary::new(b"third".to_vec(), true),
            ],
        };
        let mut bytes = Vec::new();
        inner.write(&mut bytes).unwrap();
        // Binary TLVs: type 3, length, then the flag byte
        assert_eq!(&bytes[bytes.len() - 16..bytes.len() - 10], &[3, 6, 0, 0, 0, 1]);
        bytes.extend(b"<?xml");
        let mut c = Cursor::new(&bytes);
        assert_eq!(InnerHeader::read(&mut c).unwrap(), inner);
        let mut rest = Vec::new();
        c.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"<?xml");
    }
}
