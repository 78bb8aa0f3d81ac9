//! Self-describing typed dictionary used by KDBX 4 headers

use std::collections::BTreeMap;
use std::convert::TryInto;
use std::io::prelude::*;
use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::debug;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};

use crate::error::{Error, Result};

const VARIANT_MAP_MAJOR: u8 = 1;
const VARIANT_MAP_MINOR: u8 = 0;

#[derive(PartialEq, Eq, Debug, FromPrimitive, ToPrimitive)]
enum MapType {
    None = 0,
    UInt32 = 0x04,
    UInt64 = 0x05,
    Bool = 0x08,
    Int32 = 0x0C,
    Int64 = 0x0D,
    String = 0x18,
    ByteArray = 0x42,
}

#[derive(PartialEq, Eq, Debug, Clone)]
pub enum MapValue {
    UInt32(u32),
    UInt64(u64),
    Bool(bool),
    Int32(i32),
    Int64(i64),
    String(String),
    ByteArray(Vec<u8>),
}

impl From<&MapValue> for MapType {
    fn from(value: &MapValue) -> Self {
        match value {
            MapValue::Bool(_) => MapType::Bool,
            MapValue::Int32(_) => MapType::Int32,
            MapValue::Int64(_) => MapType::Int64,
            MapValue::UInt32(_) => MapType::UInt32,
            MapValue::UInt64(_) => MapType::UInt64,
            MapValue::String(_) => MapType::String,
            MapValue::ByteArray(_) => MapType::ByteArray,
        }
    }
}

fn fixed<const N: usize>(key: &str, value: Vec<u8>) -> Result<[u8; N]> {
    value.try_into().map_err(|v: Vec<u8>| {
        Error::InvalidVariantMap(format!("{} has {} bytes, expected {}", key, v.len(), N))
    })
}

/// Ordered map of typed values, serialized with sorted keys
#[derive(PartialEq, Eq, Debug, Clone, Default)]
pub struct VariantMap {
    items: BTreeMap<String, MapValue>,
}

impl VariantMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<K: Into<String>>(&mut self, key: K, value: MapValue) -> Option<MapValue> {
        self.items.insert(key.into(), value)
    }

    pub fn get(&self, key: &str) -> Option<&MapValue> {
        self.items.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<MapValue> {
        self.items.remove(key)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MapValue)> {
        self.items.iter()
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        match self.items.get(key) {
            Some(MapValue::UInt32(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.items.get(key) {
            Some(MapValue::UInt64(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_bytes(&self, key: &str) -> Option<&[u8]> {
        match self.items.get(key) {
            Some(MapValue::ByteArray(v)) => Some(v),
            _ => None,
        }
    }

    pub fn load(data: &[u8]) -> Result<Self> {
        // Lengths are checked against what is left before allocating
        fn read_item(c: &mut Cursor<&[u8]>, what: &str) -> Result<Vec<u8>> {
            let len = c.read_u32::<LittleEndian>()? as usize;
            let remaining = c.get_ref().len().saturating_sub(c.position() as usize);
            if len > remaining {
                return Err(Error::InvalidVariantMap(format!(
                    "{} of {} bytes with {} bytes left",
                    what, len, remaining
                )));
            }
            let mut item = vec![0; len];
            c.read_exact(&mut item)?;
            Ok(item)
        }

        let mut map = Self::new();
        let mut c = Cursor::new(data);
        let variant_minor = c.read_u8()?;
        let variant_major = c.read_u8()?;
        if variant_major != VARIANT_MAP_MAJOR {
            return Err(Error::UnsupportedVariantMapVersion {
                major: variant_major,
                minor: variant_minor,
            });
        }

        loop {
            let raw_type = c.read_u8()?;
            let item_type = MapType::from_u8(raw_type)
                .ok_or_else(|| Error::InvalidVariantMap(format!("unknown type {:#04x}", raw_type)))?;
            if item_type == MapType::None {
                break;
            }
            let item_key = read_item(&mut c, "key")?;
            let item_key = String::from_utf8(item_key)
                .map_err(|_| Error::InvalidVariantMap("key is not UTF-8".to_string()))?;
            let item_value = read_item(&mut c, "value")?;
            debug!("Variant {} ({:?}, {} bytes)", item_key, item_type, item_value.len());
            let item_value = match item_type {
                MapType::Bool => {
                    if item_value.len() != 1 {
                        return Err(Error::InvalidVariantMap(format!(
                            "{} is not a valid bool",
                            item_key
                        )));
                    }
                    MapValue::Bool(item_value[0] != 0)
                }
                MapType::Int32 => MapValue::Int32(i32::from_le_bytes(fixed(&item_key, item_value)?)),
                MapType::Int64 => MapValue::Int64(i64::from_le_bytes(fixed(&item_key, item_value)?)),
                MapType::UInt32 => MapValue::UInt32(u32::from_le_bytes(fixed(&item_key, item_value)?)),
                MapType::UInt64 => MapValue::UInt64(u64::from_le_bytes(fixed(&item_key, item_value)?)),
                MapType::String => MapValue::String(String::from_utf8(item_value).map_err(|_| {
                    Error::InvalidVariantMap(format!("{} is not valid UTF-8", item_key))
                })?),
                MapType::ByteArray => MapValue::ByteArray(item_value),
                MapType::None => unreachable!("terminator handled above"),
            };
            map.items.insert(item_key, item_value);
        }
        Ok(map)
    }

    pub fn save(&self) -> Vec<u8> {
        let mut output = Vec::new();
        output.push(VARIANT_MAP_MINOR);
        output.push(VARIANT_MAP_MAJOR);
        for (k, v) in &self.items {
            let item_value = match v {
                MapValue::Bool(v) => vec![u8::from(*v)],
                MapValue::Int32(v) => v.to_le_bytes().to_vec(),
                MapValue::Int64(v) => v.to_le_bytes().to_vec(),
                MapValue::UInt32(v) => v.to_le_bytes().to_vec(),
                MapValue::UInt64(v) => v.to_le_bytes().to_vec(),
                MapValue::String(v) => v.as_bytes().to_vec(),
                MapValue::ByteArray(v) => v.clone(),
            };
            // Writes into a Vec cannot fail
            let _ = output.write_u8(MapType::from(v).to_u8().unwrap_or(0));
            let _ = output.write_u32::<LittleEndian>(k.len() as u32);
            output.extend_from_slice(k.as_bytes());
            let _ = output.write_u32::<LittleEndian>(item_value.len() as u32);
            output.extend_from_slice(&item_value);
        }
        output.push(0); // End of dictionary
        output
    }
}
