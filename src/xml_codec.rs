//! Mapping between the XML payload and Rust values
//!
//! Parsing and serializing go through the `KdbxParse` / `KdbxSerialize`
//! traits, implemented here for the primitive encodings KeePass uses and
//! derived for the document structs by `kdbx-codec-derive`.

use std::convert::TryInto;
use std::io::prelude::*;
use std::io::Cursor;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::prelude::*;
use uuid::Uuid;
use xml::attribute::OwnedAttribute;
use xml::common::XmlVersion;
use xml::name::OwnedName;
use xml::reader::{EventReader, ParserConfig, XmlEvent};
use xml::writer::{EmitterConfig, EventWriter};

use crate::header::PoolBinary;
use crate::protected_stream::CipherValue;

/// Seconds between 0001-01-01 and the Unix epoch
pub(crate) const KDBX4_TIME_OFFSET: i64 = 62135596800;

const KDBX3_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

pub trait KdbxParse<C>: Sized + Default {
    fn parse<R: Read>(
        reader: &mut EventReader<R>,
        name: OwnedName,
        attributes: Vec<OwnedAttribute>,
        context: &mut C,
    ) -> Result<Option<Self>, String>;
}

pub trait KdbxSerialize<C>: Sized {
    /// Attributes written on the element holding this value
    fn attributes(_value: &Self, _context: &mut C) -> Vec<(&'static str, String)> {
        Vec::new()
    }

    fn serialize<W: Write>(
        writer: &mut EventWriter<W>,
        value: Self,
        context: &mut C,
    ) -> Result<(), String>;
}

/// State shared across one document parse or serialization
#[derive(Debug)]
pub struct KdbxContext {
    pub major_version: u16,
    /// Inner random stream, consumed in document order
    pub inner_cipher: CipherValue,
    /// Attachment pool referenced by `<Value Ref="n"/>`
    pub binaries: Vec<PoolBinary>,
    /// Gzip attachments stored in `Meta/Binaries` (KDBX 3)
    pub compress_binaries: bool,
}

impl Default for KdbxContext {
    fn default() -> Self {
        KdbxContext {
            major_version: 4,
            inner_cipher: CipherValue::Null,
            binaries: vec![],
            compress_binaries: false,
        }
    }
}

impl KdbxContext {
    pub fn new(major_version: u16, inner_cipher: CipherValue) -> Self {
        Self {
            major_version,
            inner_cipher,
            ..Self::default()
        }
    }

    /// Pool index of an attachment, adding it if it is not there yet
    ///
    /// A pool item is protected when any attachment sharing it is.
    pub fn binary_index(&mut self, data: &[u8], protected: bool) -> usize {
        match self.binaries.iter().position(|b| b.data == data) {
            Some(index) => {
                self.binaries[index].protected |= protected;
                index
            }
            None => {
                self.binaries.push(PoolBinary::new(data.to_vec(), protected));
                self.binaries.len() - 1
            }
        }
    }
}

pub enum ElementEvent {
    StartElement {
        name: OwnedName,
        attributes: Vec<OwnedAttribute>,
    },
    EndElement {
        name: OwnedName,
    },
}

fn next_event<R: Read>(reader: &mut EventReader<R>) -> Result<XmlEvent, String> {
    reader
        .next()
        .map_err(|e| format!("Malformed XML document: {}", e))
}

pub fn find_next_element<R: Read>(reader: &mut EventReader<R>) -> Result<ElementEvent, String> {
    loop {
        match next_event(reader)? {
            XmlEvent::StartDocument { .. } | XmlEvent::EndDocument => {
                return Err("Malformed XML document".to_string());
            }
            XmlEvent::StartElement {
                name, attributes, ..
            } => {
                return Ok(ElementEvent::StartElement { name, attributes });
            }
            XmlEvent::EndElement { name, .. } => {
                return Ok(ElementEvent::EndElement { name });
            }
            _ => {
                // Text, comments and processing instructions between elements
            }
        };
    }
}

/// Skip the rest of an element whose start tag was already read
pub fn consume_element<R: Read>(reader: &mut EventReader<R>) -> Result<(), String> {
    reader
        .skip()
        .map_err(|e| format!("Malformed XML document: {}", e))
}

pub fn attribute<'a>(attributes: &'a [OwnedAttribute], name: &str) -> Option<&'a str> {
    attributes
        .iter()
        .find(|a| a.name.local_name == name)
        .map(|a| a.value.as_str())
}

/// Collect the text directly inside the current element
pub fn decode_optional_string<R: Read>(
    reader: &mut EventReader<R>,
    name: OwnedName,
) -> Result<Option<String>, String> {
    let mut elements = vec![name];
    let mut string = String::new();

    loop {
        match next_event(reader)? {
            XmlEvent::StartDocument { .. } | XmlEvent::EndDocument => {
                return Err("Malformed XML document".to_string());
            }
            XmlEvent::StartElement { name, .. } => {
                elements.push(name);
            }
            XmlEvent::Characters(k) | XmlEvent::Whitespace(k) | XmlEvent::CData(k) => {
                if elements.len() == 1 {
                    string.push_str(&k);
                }
            }
            XmlEvent::EndElement { name, .. } => {
                let start_tag = elements
                    .pop()
                    .ok_or_else(|| format!("Unexpected end tag </{}>", name))?;
                if start_tag != name {
                    return Err(format!(
                        "Start tag <{}> mismatches end tag </{}>",
                        start_tag, name
                    ));
                }
            }
            _ => {}
        };
        if elements.is_empty() {
            return Ok(if string.is_empty() { None } else { Some(string) });
        }
    }
}

pub fn encode_string<W: Write>(writer: &mut EventWriter<W>, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Ok(());
    }
    writer
        .write(xml::writer::XmlEvent::characters(value))
        .map_err(|e| e.to_string())
}

pub fn decode_base64(value: &str) -> Result<Vec<u8>, String> {
    BASE64
        .decode(value.trim())
        .map_err(|e| format!("Invalid base64 value: {}", e))
}

pub fn encode_base64<W: Write, T: AsRef<[u8]>>(
    writer: &mut EventWriter<W>,
    value: T,
) -> Result<(), String> {
    encode_string(writer, &BASE64.encode(value.as_ref()))
}

pub fn start_element<W: Write>(
    writer: &mut EventWriter<W>,
    name: &str,
    attributes: &[(&str, String)],
) -> Result<(), String> {
    let mut event = xml::writer::XmlEvent::start_element(name);
    for (key, value) in attributes {
        event = event.attr(*key, value.as_str());
    }
    writer.write(event).map_err(|e| e.to_string())
}

pub fn end_element<W: Write>(writer: &mut EventWriter<W>) -> Result<(), String> {
    writer
        .write(xml::writer::XmlEvent::end_element())
        .map_err(|e| e.to_string())
}

/// Write `value` wrapped in an element called `name`
pub fn write_field<W: Write, T: KdbxSerialize<KdbxContext>>(
    writer: &mut EventWriter<W>,
    name: &str,
    value: T,
    context: &mut KdbxContext,
) -> Result<(), String> {
    let attributes = T::attributes(&value, context);
    start_element(writer, name, &attributes)?;
    T::serialize(writer, value, context)?;
    end_element(writer)
}

/// Parse `<Wrapper><Item/><Item/></Wrapper>`, skipping unknown children
pub fn parse_list<R: Read, T: KdbxParse<KdbxContext>>(
    reader: &mut EventReader<R>,
    wrapper: OwnedName,
    item_name: &str,
    context: &mut KdbxContext,
) -> Result<Vec<T>, String> {
    let mut items = Vec::new();
    loop {
        match find_next_element(reader)? {
            ElementEvent::StartElement { name, attributes } if name.local_name == item_name => {
                items.push(T::parse(reader, name, attributes, context)?.unwrap_or_default());
            }
            ElementEvent::StartElement { .. } => {
                consume_element(reader)?;
            }
            ElementEvent::EndElement { name } if name == wrapper => {
                return Ok(items);
            }
            ElementEvent::EndElement { name } => {
                return Err(format!(
                    "Start tag <{}> mismatches end tag </{}>",
                    wrapper, name
                ));
            }
        }
    }
}

/// Parse a complete document whose root element is `root`
pub fn parse_document<T: KdbxParse<KdbxContext>>(
    data: &[u8],
    root: &str,
    context: &mut KdbxContext,
) -> Result<T, String> {
    let data = data.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(data);
    let config = ParserConfig::new().cdata_to_characters(true);
    let mut reader = EventReader::new_with_config(Cursor::new(data), config);
    loop {
        match next_event(&mut reader)? {
            XmlEvent::StartElement {
                name, attributes, ..
            } => {
                if name.local_name != root {
                    return Err(format!("Expected <{}> but found <{}>", root, name));
                }
                return Ok(T::parse(&mut reader, name, attributes, context)?.unwrap_or_default());
            }
            XmlEvent::EndDocument => {
                return Err(format!("Missing <{}> element", root));
            }
            _ => {}
        }
    }
}

pub fn write_document<T: KdbxSerialize<KdbxContext>>(
    value: T,
    root: &str,
    context: &mut KdbxContext,
) -> Result<Vec<u8>, String> {
    let mut writer = EmitterConfig::new()
        .perform_indent(true)
        .indent_string("\t")
        .create_writer(Vec::new());
    writer
        .write(xml::writer::XmlEvent::StartDocument {
            version: XmlVersion::Version10,
            encoding: Some("utf-8"),
            standalone: Some(true),
        })
        .map_err(|e| e.to_string())?;
    write_field(&mut writer, root, value, context)?;
    Ok(writer.into_inner())
}

impl<C> KdbxParse<C> for String {
    fn parse<R: Read>(
        reader: &mut EventReader<R>,
        name: OwnedName,
        _attributes: Vec<OwnedAttribute>,
        _context: &mut C,
    ) -> Result<Option<Self>, String> {
        decode_optional_string(reader, name)
    }
}

impl<C> KdbxSerialize<C> for String {
    fn serialize<W: Write>(
        writer: &mut EventWriter<W>,
        value: Self,
        _context: &mut C,
    ) -> Result<(), String> {
        encode_string(writer, &value)
    }
}

impl<C> KdbxParse<C> for bool {
    fn parse<R: Read>(
        reader: &mut EventReader<R>,
        name: OwnedName,
        _attributes: Vec<OwnedAttribute>,
        _context: &mut C,
    ) -> Result<Option<Self>, String> {
        // "null" marks an inherited value
        Ok(decode_optional_string(reader, name)?
            .filter(|v| !v.trim().eq_ignore_ascii_case("null"))
            .map(|v| v.trim().eq_ignore_ascii_case("true")))
    }
}

impl<C> KdbxSerialize<C> for bool {
    fn serialize<W: Write>(
        writer: &mut EventWriter<W>,
        value: Self,
        _context: &mut C,
    ) -> Result<(), String> {
        encode_string(writer, if value { "True" } else { "False" })
    }
}

fn decode_integer<R: Read, T: std::str::FromStr>(
    reader: &mut EventReader<R>,
    name: OwnedName,
) -> Result<Option<T>, String> {
    let element = name.local_name.clone();
    decode_optional_string(reader, name)?
        .map(|v| {
            v.trim()
                .parse()
                .map_err(|_| format!("Invalid number in <{}>: {}", element, v))
        })
        .transpose()
}

macro_rules! integer_codec {
    ($($t:ty),*) => {
        $(
            impl<C> KdbxParse<C> for $t {
                fn parse<R: Read>(
                    reader: &mut EventReader<R>,
                    name: OwnedName,
                    _attributes: Vec<OwnedAttribute>,
                    _context: &mut C,
                ) -> Result<Option<Self>, String> {
                    decode_integer(reader, name)
                }
            }

            impl<C> KdbxSerialize<C> for $t {
                fn serialize<W: Write>(
                    writer: &mut EventWriter<W>,
                    value: Self,
                    _context: &mut C,
                ) -> Result<(), String> {
                    encode_string(writer, &value.to_string())
                }
            }
        )*
    };
}

integer_codec!(i32, i64, u32);

impl<C> KdbxParse<C> for Uuid {
    fn parse<R: Read>(
        reader: &mut EventReader<R>,
        name: OwnedName,
        _attributes: Vec<OwnedAttribute>,
        _context: &mut C,
    ) -> Result<Option<Self>, String> {
        decode_optional_string(reader, name)?
            .map(|v| {
                Uuid::from_slice(&decode_base64(&v)?).map_err(|_| format!("Invalid UUID: {}", v))
            })
            .transpose()
    }
}

impl<C> KdbxSerialize<C> for Uuid {
    fn serialize<W: Write>(
        writer: &mut EventWriter<W>,
        value: Self,
        _context: &mut C,
    ) -> Result<(), String> {
        encode_base64(writer, value.as_bytes())
    }
}

impl<C> KdbxParse<C> for Vec<u8> {
    fn parse<R: Read>(
        reader: &mut EventReader<R>,
        name: OwnedName,
        _attributes: Vec<OwnedAttribute>,
        _context: &mut C,
    ) -> Result<Option<Self>, String> {
        decode_optional_string(reader, name)?
            .map(|v| decode_base64(&v))
            .transpose()
    }
}

impl<C> KdbxSerialize<C> for Vec<u8> {
    fn serialize<W: Write>(
        writer: &mut EventWriter<W>,
        value: Self,
        _context: &mut C,
    ) -> Result<(), String> {
        encode_base64(writer, value)
    }
}

impl<C> KdbxParse<C> for [u8; 32] {
    fn parse<R: Read>(
        reader: &mut EventReader<R>,
        name: OwnedName,
        _attributes: Vec<OwnedAttribute>,
        _context: &mut C,
    ) -> Result<Option<Self>, String> {
        decode_optional_string(reader, name)?
            .map(|v| {
                decode_base64(&v)?
                    .try_into()
                    .map_err(|_| "Expected 32 bytes of base64 data".to_string())
            })
            .transpose()
    }
}

impl<C> KdbxSerialize<C> for [u8; 32] {
    fn serialize<W: Write>(
        writer: &mut EventWriter<W>,
        value: Self,
        _context: &mut C,
    ) -> Result<(), String> {
        encode_base64(writer, value)
    }
}

/// Decode either time encoding
///
/// KDBX 4 stores base64 seconds since year 1, KDBX 3 stores ISO 8601. A
/// value without a zone suffix is taken as UTC.
pub fn decode_datetime(value: &str) -> Result<DateTime<Utc>, String> {
    let value = value.trim();
    if value.contains('-') || value.contains(':') {
        if let Ok(time) = DateTime::parse_from_rfc3339(value) {
            return Ok(time.with_timezone(&Utc));
        }
        return NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S")
            .map(|t| Utc.from_utc_datetime(&t))
            .map_err(|_| format!("Invalid timestamp: {}", value));
    }
    let bytes: [u8; 8] = decode_base64(value)?
        .try_into()
        .map_err(|_| format!("Invalid timestamp: {}", value))?;
    let seconds = i64::from_le_bytes(bytes)
        .checked_sub(KDBX4_TIME_OFFSET)
        .ok_or_else(|| format!("Timestamp out of range: {}", value))?;
    Utc.timestamp_opt(seconds, 0)
        .single()
        .ok_or_else(|| format!("Timestamp out of range: {}", value))
}

pub fn encode_datetime(value: &DateTime<Utc>, major_version: u16) -> String {
    if major_version >= 4 {
        BASE64.encode((value.timestamp() + KDBX4_TIME_OFFSET).to_le_bytes())
    } else {
        value.format(KDBX3_TIME_FORMAT).to_string()
    }
}

impl KdbxParse<KdbxContext> for DateTime<Utc> {
    fn parse<R: Read>(
        reader: &mut EventReader<R>,
        name: OwnedName,
        _attributes: Vec<OwnedAttribute>,
        _context: &mut KdbxContext,
    ) -> Result<Option<Self>, String> {
        decode_optional_string(reader, name)?
            .map(|v| decode_datetime(&v))
            .transpose()
    }
}

impl KdbxSerialize<KdbxContext> for DateTime<Utc> {
    fn serialize<W: Write>(
        writer: &mut EventWriter<W>,
        value: Self,
        context: &mut KdbxContext,
    ) -> Result<(), String> {
        encode_string(writer, &encode_datetime(&value, context.major_version))
    }
}
