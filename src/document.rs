//! The decrypted database document

use std::io::prelude::*;
use std::slice::Iter;

use chrono::prelude::*;
use derive_getters::Getters;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use log::warn;
use uuid::Uuid;
use xml::attribute::OwnedAttribute;
use xml::name::OwnedName;
use xml::reader::EventReader;
use xml::writer::EventWriter;

use kdbx_codec_derive::{KdbxParse, KdbxSerialize};

use crate::header::PoolBinary;
use crate::xml_codec::{
    attribute, decode_base64, decode_optional_string, encode_base64, encode_string, KdbxContext,
    KdbxParse, KdbxSerialize,
};

const GENERATOR: &str = "kdbx-codec";

/// Highest `Meta/Binaries` ID accepted, guarding the pool allocation
const MAX_BINARY_ID: usize = 1 << 16;

fn now() -> DateTime<Utc> {
    Utc.timestamp_opt(Utc::now().timestamp(), 0)
        .single()
        .unwrap_or_default()
}

#[derive(Clone, Debug, PartialEq, KdbxParse, KdbxSerialize, Getters)]
pub struct MemoryProtection {
    protect_title: bool,
    protect_user_name: bool,
    protect_password: bool,
    #[kdbx(element = "ProtectURL")]
    protect_url: bool,
    protect_notes: bool,
}

impl Default for MemoryProtection {
    fn default() -> Self {
        Self {
            protect_title: false,
            protect_user_name: false,
            protect_password: true,
            protect_url: false,
            protect_notes: false,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, KdbxParse, KdbxSerialize, Getters)]
pub struct Icon {
    #[kdbx(element = "UUID")]
    uuid: Uuid,
    data: Vec<u8>,
    name: Option<String>,
    last_modification_time: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, PartialEq, KdbxParse, KdbxSerialize, Getters)]
pub struct Item {
    key: String,
    value: String,
    // Only written for KDBX 4.1 meta data
    last_modification_time: Option<DateTime<Utc>>,
}

impl Item {
    pub fn new<K: Into<String>, V: Into<String>>(key: K, value: V) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            last_modification_time: None,
        }
    }
}

/// Attachment kept in `Meta/Binaries` by KDBX 3 files
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Binary {
    id: usize,
    data: Vec<u8>,
    protected: bool,
}

impl Binary {
    pub(crate) fn new(id: usize, binary: PoolBinary) -> Self {
        Self {
            id,
            data: binary.data,
            protected: binary.protected,
        }
    }
}

fn is_true(attributes: &[OwnedAttribute], name: &str) -> bool {
    attribute(attributes, name).map_or(false, |v| v.eq_ignore_ascii_case("true"))
}

impl KdbxParse<KdbxContext> for Binary {
    fn parse<R: Read>(
        reader: &mut EventReader<R>,
        name: OwnedName,
        attributes: Vec<OwnedAttribute>,
        context: &mut KdbxContext,
    ) -> Result<Option<Self>, String> {
        let id = attribute(&attributes, "ID")
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|id| *id <= MAX_BINARY_ID)
            .ok_or_else(|| "Invalid binary ID".to_string())?;
        let mut data = match decode_optional_string(reader, name)? {
            Some(v) => decode_base64(&v)?,
            None => Vec::new(),
        };
        let protected = is_true(&attributes, "Protected");
        if protected {
            context.inner_cipher.apply_keystream(&mut data);
        }
        if is_true(&attributes, "Compressed") {
            let mut inflated = Vec::new();
            GzDecoder::new(&data[..])
                .read_to_end(&mut inflated)
                .map_err(|e| format!("Invalid compressed binary {}: {}", id, e))?;
            data = inflated;
        }
        if context.binaries.len() <= id {
            context.binaries.resize(id + 1, PoolBinary::default());
        }
        context.binaries[id] = PoolBinary::new(data.clone(), protected);
        Ok(Some(Self { id, data, protected }))
    }
}

impl KdbxSerialize<KdbxContext> for Binary {
    fn attributes(value: &Self, context: &mut KdbxContext) -> Vec<(&'static str, String)> {
        let mut attributes = vec![("ID", value.id.to_string())];
        if context.compress_binaries {
            attributes.push(("Compressed", "True".to_string()));
        }
        if value.protected {
            attributes.push(("Protected", "True".to_string()));
        }
        attributes
    }

    fn serialize<W: Write>(
        writer: &mut EventWriter<W>,
        value: Self,
        context: &mut KdbxContext,
    ) -> Result<(), String> {
        let mut data = if context.compress_binaries {
            let mut gz = GzEncoder::new(Vec::new(), flate2::Compression::default());
            gz.write_all(&value.data).map_err(|e| e.to_string())?;
            gz.finish().map_err(|e| e.to_string())?
        } else {
            value.data
        };
        if value.protected {
            context.inner_cipher.apply_keystream(&mut data);
        }
        encode_base64(writer, data)
    }
}

#[derive(Clone, Debug, Default, PartialEq, KdbxParse, KdbxSerialize, Getters)]
pub struct Meta {
    generator: String,
    #[getter(skip)]
    header_hash: Option<[u8; 32]>,
    settings_changed: Option<DateTime<Utc>>,
    database_name: String,
    database_name_changed: Option<DateTime<Utc>>,
    database_description: String,
    database_description_changed: Option<DateTime<Utc>>,
    default_user_name: String,
    default_user_name_changed: Option<DateTime<Utc>>,
    maintenance_history_days: u32,
    color: String,
    master_key_changed: Option<DateTime<Utc>>,
    master_key_change_rec: i64,
    master_key_change_force: i64,
    master_key_change_force_once: Option<bool>,
    memory_protection: MemoryProtection,
    custom_icons: Vec<Icon>,
    recycle_bin_enabled: bool,
    #[kdbx(element = "RecycleBinUUID")]
    recycle_bin_uuid: Option<Uuid>,
    recycle_bin_changed: Option<DateTime<Utc>>,
    entry_templates_group: Option<Uuid>,
    entry_templates_group_changed: Option<DateTime<Utc>>,
    /// -1 = unlimited
    history_max_items: i32,
    /// -1 = unlimited
    history_max_size: i64,
    last_selected_group: Option<Uuid>,
    last_top_visible_group: Option<Uuid>,
    #[getter(skip)]
    binaries: Option<Vec<Binary>>,
    custom_data: Vec<Item>,
}

impl Meta {
    pub fn set_database_name<T: Into<String>>(&mut self, name: T) {
        self.database_name = name.into();
        self.database_name_changed = Some(now());
    }

    pub fn set_database_description<T: Into<String>>(&mut self, description: T) {
        self.database_description = description.into();
        self.database_description_changed = Some(now());
    }

    pub fn set_default_user_name<T: Into<String>>(&mut self, user_name: T) {
        self.default_user_name = user_name.into();
        self.default_user_name_changed = Some(now());
    }

    pub fn custom_data_mut(&mut self) -> &mut Vec<Item> {
        &mut self.custom_data
    }

    pub(crate) fn header_hash(&self) -> Option<&[u8; 32]> {
        self.header_hash.as_ref()
    }

    pub(crate) fn set_header_hash(&mut self, hash: Option<[u8; 32]>) {
        self.header_hash = hash;
    }

    pub(crate) fn set_binaries(&mut self, binaries: Option<Vec<Binary>>) {
        self.binaries = binaries;
    }
}

#[derive(Clone, Debug, Default, PartialEq, KdbxParse, KdbxSerialize, Getters)]
pub struct Times {
    creation_time: DateTime<Utc>,
    last_modification_time: DateTime<Utc>,
    last_access_time: DateTime<Utc>,
    expiry_time: DateTime<Utc>,
    expires: bool,
    usage_count: i32,
    location_changed: DateTime<Utc>,
}

impl Times {
    pub fn now() -> Self {
        let now = now();
        Self {
            creation_time: now,
            last_modification_time: now,
            last_access_time: now,
            expiry_time: now,
            expires: false,
            usage_count: 0,
            location_changed: now,
        }
    }

    pub fn set_expiry(&mut self, expiry: Option<DateTime<Utc>>) {
        match expiry {
            Some(time) => {
                self.expires = true;
                self.expiry_time = time;
            }
            None => self.expires = false,
        }
    }
}

/// String field value; protected values are kept as plain text in memory
/// and encrypted with the inner random stream only inside the file
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProtectedValue {
    Unprotected(String),
    Protected(String),
}

impl ProtectedValue {
    pub fn value(&self) -> &str {
        match self {
            Self::Unprotected(v) | Self::Protected(v) => v,
        }
    }

    pub fn is_protected(&self) -> bool {
        matches!(self, Self::Protected(_))
    }
}

impl Default for ProtectedValue {
    fn default() -> Self {
        Self::Unprotected(String::new())
    }
}

impl KdbxParse<KdbxContext> for ProtectedValue {
    fn parse<R: Read>(
        reader: &mut EventReader<R>,
        name: OwnedName,
        attributes: Vec<OwnedAttribute>,
        context: &mut KdbxContext,
    ) -> Result<Option<Self>, String> {
        let text = decode_optional_string(reader, name)?;
        if !is_true(&attributes, "Protected") {
            return Ok(text.map(Self::Unprotected));
        }
        let mut value = match text {
            Some(v) => decode_base64(&v)?,
            None => Vec::new(),
        };
        context.inner_cipher.apply_keystream(&mut value);
        String::from_utf8(value)
            .map(|v| Some(Self::Protected(v)))
            .map_err(|_| "Protected value is not valid UTF-8".to_string())
    }
}

impl KdbxSerialize<KdbxContext> for ProtectedValue {
    fn attributes(value: &Self, _context: &mut KdbxContext) -> Vec<(&'static str, String)> {
        match value {
            Self::Protected(_) => vec![("Protected", "True".to_string())],
            Self::Unprotected(_) => Vec::new(),
        }
    }

    fn serialize<W: Write>(
        writer: &mut EventWriter<W>,
        value: Self,
        context: &mut KdbxContext,
    ) -> Result<(), String> {
        match value {
            Self::Unprotected(v) => encode_string(writer, &v),
            Self::Protected(v) => {
                let mut bytes = v.into_bytes();
                context.inner_cipher.apply_keystream(&mut bytes);
                encode_base64(writer, bytes)
            }
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, KdbxParse, KdbxSerialize)]
struct ProtectedString {
    key: String,
    value: ProtectedValue,
}

#[derive(Clone, Debug, Default, PartialEq, KdbxParse, KdbxSerialize)]
struct ProtectedBinary {
    key: String,
    value: BinaryRef,
}

/// Attachment contents resolved from the binary pool
#[derive(Clone, Debug, Default, PartialEq)]
struct BinaryRef {
    data: Vec<u8>,
    protected: bool,
}

impl KdbxParse<KdbxContext> for BinaryRef {
    fn parse<R: Read>(
        reader: &mut EventReader<R>,
        name: OwnedName,
        attributes: Vec<OwnedAttribute>,
        context: &mut KdbxContext,
    ) -> Result<Option<Self>, String> {
        let text = decode_optional_string(reader, name)?;
        match attribute(&attributes, "Ref") {
            Some(id) => {
                let binary = id
                    .parse::<usize>()
                    .ok()
                    .and_then(|id| context.binaries.get(id))
                    .cloned();
                if binary.is_none() {
                    warn!("Attachment references missing binary {}", id);
                }
                let binary = binary.unwrap_or_default();
                Ok(Some(Self {
                    data: binary.data,
                    protected: binary.protected,
                }))
            }
            // Some early KDBX 3 files store attachments inline
            None => Ok(Some(Self {
                data: match text {
                    Some(v) => decode_base64(&v)?,
                    None => Vec::new(),
                },
                protected: false,
            })),
        }
    }
}

impl KdbxSerialize<KdbxContext> for BinaryRef {
    fn attributes(value: &Self, context: &mut KdbxContext) -> Vec<(&'static str, String)> {
        vec![("Ref", context.binary_index(&value.data, value.protected).to_string())]
    }

    fn serialize<W: Write>(
        _writer: &mut EventWriter<W>,
        _value: Self,
        _context: &mut KdbxContext,
    ) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, KdbxParse, KdbxSerialize, Getters)]
pub struct Group {
    #[kdbx(element = "UUID")]
    uuid: Uuid,
    name: String,
    notes: String,
    #[kdbx(element = "IconID")]
    icon_id: u32,
    #[kdbx(element = "CustomIconUUID")]
    custom_icon_uuid: Option<Uuid>,
    times: Times,
    is_expanded: bool,
    default_auto_type_sequence: String,
    enable_auto_type: Option<bool>,
    enable_searching: Option<bool>,
    last_top_visible_entry: Option<Uuid>,
    previous_parent_group: Option<Uuid>,
    tags: Option<String>,
    custom_data: Vec<Item>,
    #[kdbx(flatten)]
    #[getter(rename = "entries")]
    entry: Vec<Entry>,
    #[kdbx(flatten)]
    #[getter(rename = "groups")]
    group: Vec<Group>,
}

impl Group {
    pub fn new<T: Into<String>>(name: T) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: name.into(),
            icon_id: 48,
            times: Times::now(),
            is_expanded: true,
            ..Self::default()
        }
    }

    pub fn set_name<T: Into<String>>(&mut self, name: T) {
        self.name = name.into();
    }

    pub fn set_notes<T: Into<String>>(&mut self, notes: T) {
        self.notes = notes.into();
    }

    pub fn add_entry(&mut self, entry: Entry) {
        self.entry.push(entry);
    }

    pub fn add_group(&mut self, group: Group) {
        self.group.push(group);
    }

    pub fn entries_mut(&mut self) -> &mut Vec<Entry> {
        &mut self.entry
    }

    pub fn groups_mut(&mut self) -> &mut Vec<Group> {
        &mut self.group
    }

    /// This group followed by all of its descendants, depth first
    pub fn all_groups(&self) -> GroupIter<'_> {
        GroupIter { stack: vec![self] }
    }

    pub fn all_entries(&self) -> EntryIter<'_> {
        EntryIter {
            entries: None,
            groups: self.all_groups(),
        }
    }
}

pub struct GroupIter<'a> {
    stack: Vec<&'a Group>,
}

impl<'a> Iterator for GroupIter<'a> {
    type Item = &'a Group;

    fn next(&mut self) -> Option<Self::Item> {
        let group = self.stack.pop()?;
        self.stack.extend(group.group.iter().rev());
        Some(group)
    }
}

pub struct EntryIter<'a> {
    entries: Option<Iter<'a, Entry>>,
    groups: GroupIter<'a>,
}

impl<'a> Iterator for EntryIter<'a> {
    type Item = &'a Entry;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(e) = self.entries.as_mut().and_then(|d| d.next()) {
                return Some(e);
            }
            self.entries = Some(self.groups.next()?.entry.iter());
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, KdbxParse, KdbxSerialize, Getters)]
pub struct Association {
    window: String,
    keystroke_sequence: String,
}

#[derive(Clone, Debug, Default, PartialEq, KdbxParse, KdbxSerialize, Getters)]
pub struct AutoType {
    enabled: bool,
    data_transfer_obfuscation: i64,
    default_sequence: Option<String>,
    #[kdbx(flatten)]
    #[getter(rename = "associations")]
    association: Vec<Association>,
}

#[derive(Clone, Debug, Default, PartialEq, KdbxParse, KdbxSerialize, Getters)]
pub struct Entry {
    #[kdbx(element = "UUID")]
    uuid: Uuid,
    #[kdbx(element = "IconID")]
    icon_id: u32,
    #[kdbx(element = "CustomIconUUID")]
    custom_icon_uuid: Option<Uuid>,
    foreground_color: String,
    background_color: String,
    #[kdbx(element = "OverrideURL")]
    override_url: String,
    quality_check: Option<bool>,
    tags: String,
    previous_parent_group: Option<Uuid>,
    times: Times,
    custom_data: Vec<Item>,
    #[kdbx(flatten)]
    #[getter(skip)]
    string: Vec<ProtectedString>,
    #[kdbx(flatten)]
    #[getter(skip)]
    binary: Vec<ProtectedBinary>,
    auto_type: AutoType,
    history: Option<Vec<Entry>>,
}

const TITLE_FIELD: &str = "Title";
const USER_NAME_FIELD: &str = "UserName";
const PASSWORD_FIELD: &str = "Password";
const URL_FIELD: &str = "URL";
const NOTES_FIELD: &str = "Notes";

impl Entry {
    pub fn new() -> Self {
        Self {
            uuid: Uuid::new_v4(),
            times: Times::now(),
            auto_type: AutoType {
                enabled: true,
                ..AutoType::default()
            },
            ..Self::default()
        }
    }

    pub fn get(&self, key: &str) -> Option<&ProtectedValue> {
        self.string.iter().find(|p| p.key == key).map(|p| &p.value)
    }

    fn get_str(&self, key: &str) -> &str {
        self.get(key).map_or("", ProtectedValue::value)
    }

    pub fn title(&self) -> &str {
        self.get_str(TITLE_FIELD)
    }

    pub fn username(&self) -> &str {
        self.get_str(USER_NAME_FIELD)
    }

    pub fn password(&self) -> &str {
        self.get_str(PASSWORD_FIELD)
    }

    pub fn url(&self) -> &str {
        self.get_str(URL_FIELD)
    }

    pub fn notes(&self) -> &str {
        self.get_str(NOTES_FIELD)
    }

    /// Names of all string fields in file order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.string.iter().map(|p| p.key.as_str())
    }

    /// Set a string field, replacing any existing value with the same key
    pub fn set_string<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V, protected: bool) {
        let key = key.into();
        let value = if protected {
            ProtectedValue::Protected(value.into())
        } else {
            ProtectedValue::Unprotected(value.into())
        };
        match self.string.iter_mut().find(|p| p.key == key) {
            Some(field) => field.value = value,
            None => self.string.push(ProtectedString { key, value }),
        }
    }

    pub fn set_title<T: Into<String>>(&mut self, title: T) {
        self.set_string(TITLE_FIELD, title, false);
    }

    pub fn set_username<T: Into<String>>(&mut self, username: T) {
        self.set_string(USER_NAME_FIELD, username, false);
    }

    pub fn set_password<T: Into<String>>(&mut self, password: T) {
        self.set_string(PASSWORD_FIELD, password, true);
    }

    pub fn set_url<T: Into<String>>(&mut self, url: T) {
        self.set_string(URL_FIELD, url, false);
    }

    pub fn set_notes<T: Into<String>>(&mut self, notes: T) {
        self.set_string(NOTES_FIELD, notes, false);
    }

    pub fn set_tags<T: Into<String>>(&mut self, tags: T) {
        self.tags = tags.into();
    }

    pub fn times_mut(&mut self) -> &mut Times {
        &mut self.times
    }

    pub fn add_binary<K: Into<String>>(&mut self, key: K, data: Vec<u8>) {
        self.binary.push(ProtectedBinary {
            key: key.into(),
            value: BinaryRef {
                data,
                protected: false,
            },
        });
    }

    /// Attach a file that KeePass keeps in protected memory
    pub fn add_protected_binary<K: Into<String>>(&mut self, key: K, data: Vec<u8>) {
        self.binary.push(ProtectedBinary {
            key: key.into(),
            value: BinaryRef {
                data,
                protected: true,
            },
        });
    }

    pub fn binary_count(&self) -> usize {
        self.binary.len()
    }

    pub fn get_binary(&self, index: usize) -> Option<(&str, &[u8])> {
        self.binary
            .get(index)
            .map(|b| (b.key.as_str(), b.value.data.as_slice()))
    }

    pub fn is_binary_protected(&self, index: usize) -> bool {
        self.binary.get(index).map_or(false, |b| b.value.protected)
    }

    pub fn binaries(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.binary
            .iter()
            .map(|b| (b.key.as_str(), b.value.data.as_slice()))
    }

    /// Store a copy of the entry as it is now in its history
    pub fn snapshot(&mut self) {
        let mut copy = self.clone();
        copy.history = None;
        self.history.get_or_insert_with(Vec::new).push(copy);
    }

    /// Attachment data of this entry and its history, in document order
    pub(crate) fn all_binary_data(&self) -> Vec<(&[u8], bool)> {
        let mut data: Vec<(&[u8], bool)> = self
            .binary
            .iter()
            .map(|b| (b.value.data.as_slice(), b.value.protected))
            .collect();
        for old in self.history.iter().flatten() {
            data.extend(old.all_binary_data());
        }
        data
    }
}

#[derive(Clone, Debug, Default, PartialEq, KdbxParse, KdbxSerialize, Getters)]
pub struct DeletedObject {
    #[kdbx(element = "UUID")]
    uuid: Uuid,
    deletion_time: DateTime<Utc>,
}

impl DeletedObject {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            deletion_time: now(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, KdbxParse, KdbxSerialize, Getters)]
pub struct Root {
    group: Group,
    deleted_objects: Vec<DeletedObject>,
}

#[derive(Clone, Debug, Default, PartialEq, KdbxParse, KdbxSerialize, Getters)]
pub struct KeePassFile {
    meta: Meta,
    root: Root,
}

impl KeePassFile {
    /// Empty database with a root group named after the database
    pub fn new<T: Into<String>>(database_name: T) -> Self {
        let database_name = database_name.into();
        let mut meta = Meta {
            generator: GENERATOR.to_string(),
            settings_changed: Some(now()),
            maintenance_history_days: 365,
            master_key_change_rec: -1,
            master_key_change_force: -1,
            recycle_bin_enabled: true,
            history_max_items: 10,
            history_max_size: 6 * 1024 * 1024,
            ..Meta::default()
        };
        meta.set_database_name(database_name.clone());
        Self {
            meta,
            root: Root {
                group: Group::new(database_name),
                deleted_objects: Vec::new(),
            },
        }
    }

    pub fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }

    pub fn root_group(&self) -> &Group {
        &self.root.group
    }

    pub fn root_group_mut(&mut self) -> &mut Group {
        &mut self.root.group
    }

    /// Remove an entry anywhere in the tree, recording its deletion
    pub fn delete_entry(&mut self, uuid: Uuid) -> Option<Entry> {
        fn remove(group: &mut Group, uuid: Uuid) -> Option<Entry> {
            if let Some(index) = group.entry.iter().position(|e| e.uuid == uuid) {
                return Some(group.entry.remove(index));
            }
            group.group.iter_mut().find_map(|child| remove(child, uuid))
        }
        let entry = remove(&mut self.root.group, uuid)?;
        self.root.deleted_objects.push(DeletedObject::new(uuid));
        Some(entry)
    }

    /// Attachment pool in the order references appear in the document
    pub(crate) fn collect_binaries(&self) -> Vec<PoolBinary> {
        let mut context = KdbxContext::default();
        for entry in self.root.group.all_entries() {
            for (data, protected) in entry.all_binary_data() {
                context.binary_index(data, protected);
            }
        }
        context.binaries
    }
}
