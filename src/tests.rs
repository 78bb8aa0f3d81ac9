use std::io::Cursor;

use chrono::prelude::*;
use hex_literal::hex;
use uuid::uuid;
use xml::name::OwnedName;
use xml::reader::{EventReader, ParserConfig, XmlEvent};

use super::*;
use crate::header::PoolBinary;
use crate::protected_stream::{open_stream, CipherValue};
use crate::xml_codec::*;

const STREAM_KEY: [u8; 32] = hex!("000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f");

fn start_document(contents: &str, root: &str) -> EventReader<Cursor<Vec<u8>>> {
    let mut reader = ParserConfig::new()
        .cdata_to_characters(true)
        .create_reader(Cursor::new(contents.as_bytes().to_vec()));
    match reader.next().unwrap() {
        XmlEvent::StartDocument { .. } => {}
        _ => panic!("Missing document start"),
    }
    match find_next_element(&mut reader).expect("Valid element") {
        ElementEvent::StartElement { name, .. } => assert_eq!(name.local_name, root),
        _ => panic!("Missing root element start"),
    }
    reader
}

fn end_document<R: std::io::Read>(mut reader: EventReader<R>) {
    loop {
        match reader.next().unwrap() {
            XmlEvent::EndDocument => return,
            XmlEvent::Whitespace(_) => {}
            other => panic!("Expected end of document, found {:?}", other),
        }
    }
}

fn salsa20_context(major_version: u16) -> KdbxContext {
    let cipher = open_stream(InnerStreamId::Salsa20, &STREAM_KEY).unwrap();
    KdbxContext::new(major_version, cipher)
}

fn xml_string(data: Vec<u8>) -> String {
    String::from_utf8(data).expect("UTF-8 output")
}

#[test]
fn test_decoding_empty_document() {
    let mut reader = ParserConfig::new().create_reader(Cursor::new(""));
    assert!(reader.next().is_err());
}

#[test]
fn test_consume_nested_document() {
    let content = "<root>  <consumed>   <child1>  <!-- Comment --> <grandchild/>Test</child1> <child2>More</child2></consumed> <kept/></root>";
    let mut reader = start_document(content, "root");
    match find_next_element(&mut reader).unwrap() {
        ElementEvent::StartElement { name, .. } => assert_eq!(name.local_name, "consumed"),
        _ => panic!("Missing consumed element start"),
    }
    consume_element(&mut reader).expect("Failed to consume");
    match find_next_element(&mut reader).unwrap() {
        ElementEvent::StartElement { name, .. } => assert_eq!(name.local_name, "kept"),
        _ => panic!("Missing kept element start"),
    }
    match find_next_element(&mut reader).unwrap() {
        ElementEvent::EndElement { name } => assert_eq!(name.local_name, "kept"),
        _ => panic!("Missing kept element end"),
    }
    match find_next_element(&mut reader).unwrap() {
        ElementEvent::EndElement { name } => assert_eq!(name.local_name, "root"),
        _ => panic!("Missing root element end"),
    }
    end_document(reader);
}

#[test]
fn test_decoding_optional_strings() {
    let cases = [
        ("<root/>", None),
        ("<root>Test</root>", Some("Test")),
        ("<root>  </root>", Some("  ")),
        ("<root><![CDATA[a < b]]></root>", Some("a < b")),
        ("<root>  This is <b>ignored</b> Test <!-- x --> of it 4   </root>", Some("  This is  Test  of it 4   ")),
    ];
    for (content, expected) in cases.iter() {
        let mut reader = start_document(content, "root");
        let actual = decode_optional_string(&mut reader, OwnedName::local("root")).expect("No error");
        assert_eq!(actual.as_deref(), *expected, "Decoding {}", content);
        end_document(reader);
    }
}

#[test]
fn test_mismatched_end_tag() {
    let mut reader = ParserConfig::new().create_reader(Cursor::new("<root><a></a></root>"));
    reader.next().unwrap();
    reader.next().unwrap();
    assert!(decode_optional_string(&mut reader, OwnedName::local("other")).is_err());
}

#[test]
fn test_decode_memory_protection() {
    let mut context = KdbxContext::default();
    let mp: MemoryProtection = parse_document(
        br#"<MemoryProtection>
    <ProtectTitle>False</ProtectTitle>
    <ProtectUserName>False</ProtectUserName>
    <ProtectPassword>True</ProtectPassword>
    <ProtectURL>true</ProtectURL>
    <ProtectNotes>False</ProtectNotes>
</MemoryProtection>"#,
        "MemoryProtection",
        &mut context,
    )
    .expect("No error");
    assert!(!*mp.protect_title());
    assert!(!*mp.protect_user_name());
    assert!(*mp.protect_password());
    assert!(*mp.protect_url());
    assert!(!*mp.protect_notes());
}

#[test]
fn test_decode_meta_filled() {
    let mut context = KdbxContext::default();
    let meta: Meta = parse_document(
        br#"
    <Meta>
    <Generator>KeePassXC</Generator>
    <DatabaseName>Dummy</DatabaseName>
    <DatabaseNameChanged>3BmO1Q4AAAA=</DatabaseNameChanged>
    <DatabaseDescription>Empty KDBX 4.x Database</DatabaseDescription>
    <DatabaseDescriptionChanged>2021-07-30T21:33:09Z</DatabaseDescriptionChanged>
    <DefaultUserName>someone</DefaultUserName>
    <DefaultUserNameChanged>I6fN1Q4AAAA=</DefaultUserNameChanged>
    <MaintenanceHistoryDays>365</MaintenanceHistoryDays>
    <Color/>
    <MasterKeyChangeRec>-1</MasterKeyChangeRec>
    <MasterKeyChangeForce>-1</MasterKeyChangeForce>
    <MemoryProtection>
        <ProtectPassword>True</ProtectPassword>
    </MemoryProtection>
    <RecycleBinEnabled>true</RecycleBinEnabled>
    <RecycleBinUUID>g9fGIDnSR8WvjPBJ/L4juA==</RecycleBinUUID>
    <HistoryMaxItems>10</HistoryMaxItems>
    <HistoryMaxSize>6291456</HistoryMaxSize>
    <SomethingNew><Nested>ignored</Nested></SomethingNew>
    <CustomData>
        <Item><Key>KPXC_DECRYPTION_TIME_PREFERENCE</Key><Value>100</Value></Item>
        <Item><Key>FDO_SECRETS_EXPOSED_GROUP</Key><Value>{00000000-0000-0000-0000-000000000000}</Value></Item>
    </CustomData>
    </Meta>"#,
        "Meta",
        &mut context,
    )
    .expect("No error");
    assert_eq!(meta.generator(), "KeePassXC");
    assert_eq!(meta.database_name(), "Dummy");
    assert_eq!(
        *meta.database_name_changed(),
        Some(Utc.with_ymd_and_hms(2019, 12, 20, 1, 24, 44).unwrap())
    );
    assert_eq!(
        *meta.database_description_changed(),
        Some(Utc.with_ymd_and_hms(2021, 7, 30, 21, 33, 9).unwrap())
    );
    assert_eq!(meta.default_user_name(), "someone");
    assert_eq!(*meta.maintenance_history_days(), 365);
    assert_eq!(*meta.master_key_change_rec(), -1);
    assert!(*meta.memory_protection().protect_password());
    assert!(!*meta.memory_protection().protect_title());
    assert!(*meta.recycle_bin_enabled());
    assert_eq!(
        *meta.recycle_bin_uuid(),
        Some(uuid!("83d7c620-39d2-47c5-af8c-f049fcbe23b8"))
    );
    assert_eq!(*meta.history_max_size(), 6 * 1024 * 1024);
    assert_eq!(meta.custom_data().len(), 2, "Correct number of custom data fields");
    assert_eq!(meta.custom_data()[0].key(), "KPXC_DECRYPTION_TIME_PREFERENCE");
    assert_eq!(meta.custom_data()[0].value(), "100");
}

#[test]
fn test_invalid_number() {
    let mut context = KdbxContext::default();
    let result: std::result::Result<Meta, String> = parse_document(
        b"<Meta><HistoryMaxItems>ten</HistoryMaxItems></Meta>",
        "Meta",
        &mut context,
    );
    assert!(result.is_err());
}

#[test]
fn test_wrong_root() {
    let mut context = KdbxContext::default();
    let result: std::result::Result<KeePassFile, String> =
        parse_document(b"<TS language=\"ja\"/>", "KeePassFile", &mut context);
    assert!(result.is_err());
}

#[test]
fn test_time_encodings() {
    let time = Utc.with_ymd_and_hms(2021, 7, 30, 21, 33, 9).unwrap();
    assert_eq!(encode_datetime(&time, 4), "FWeW2A4AAAA=");
    assert_eq!(encode_datetime(&time, 3), "2021-07-30T21:33:09Z");
    assert_eq!(decode_datetime("FWeW2A4AAAA=").unwrap(), time);
    assert_eq!(decode_datetime("2021-07-30T21:33:09Z").unwrap(), time);
    assert_eq!(decode_datetime("2021-07-30T23:33:09+02:00").unwrap(), time);
    assert_eq!(decode_datetime("2021-07-30T21:33:09").unwrap(), time);
    assert!(decode_datetime("yesterday").is_err());
    assert!(decode_datetime("AAAA").is_err());
}

#[test]
fn test_time_out_of_range() {
    // i64::MIN seconds, below the year 1 offset
    assert!(decode_datetime("AAAAAAAAAIA=").is_err());
    assert!(decode_datetime("/////////38=").is_err());
    let mut context = KdbxContext::default();
    let result: std::result::Result<Times, String> = parse_document(
        b"<Times><CreationTime>AAAAAAAAAIA=</CreationTime></Times>",
        "Times",
        &mut context,
    );
    assert!(result.is_err());
}

#[test]
fn test_times_follow_format_version() {
    let mut times = Times::now();
    times.set_expiry(Some(Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap()));

    let mut context = KdbxContext::new(3, CipherValue::Null);
    let xml = xml_string(write_document(times.clone(), "Times", &mut context).unwrap());
    assert!(xml.contains("<ExpiryTime>2030-01-01T00:00:00Z</ExpiryTime>"), "{}", xml);
    assert!(xml.contains("<Expires>True</Expires>"));
    let parsed: Times = parse_document(xml.as_bytes(), "Times", &mut context).unwrap();
    assert_eq!(parsed, times);

    let mut context = KdbxContext::new(4, CipherValue::Null);
    let xml = xml_string(write_document(times.clone(), "Times", &mut context).unwrap());
    assert!(!xml.contains("2030-01-01"));
    let parsed: Times = parse_document(xml.as_bytes(), "Times", &mut context).unwrap();
    assert_eq!(parsed, times);
}

#[test]
fn test_inherited_booleans() {
    let mut context = KdbxContext::default();
    let group: Group = parse_document(
        b"<Group><Name>Web</Name><EnableAutoType>null</EnableAutoType><EnableSearching>False</EnableSearching></Group>",
        "Group",
        &mut context,
    )
    .unwrap();
    assert_eq!(group.name(), "Web");
    assert_eq!(*group.enable_auto_type(), None);
    assert_eq!(*group.enable_searching(), Some(false));
}

#[test]
fn test_protected_values_use_stream_in_order() {
    let mut entry = Entry::new();
    entry.set_title("Bank");
    entry.set_username("alice");
    entry.set_password("hunter2");
    entry.set_string("PIN", "1234", true);
    entry.set_string("Empty", "", true);

    let mut context = salsa20_context(4);
    let xml = xml_string(write_document(entry.clone(), "Entry", &mut context).unwrap());
    assert!(!xml.contains("hunter2"));
    assert!(!xml.contains("1234"));
    assert!(xml.contains("<Value>alice</Value>"));
    assert!(xml.contains("<Value Protected=\"True\">"));

    let mut context = salsa20_context(4);
    let parsed: Entry = parse_document(xml.as_bytes(), "Entry", &mut context).unwrap();
    assert_eq!(parsed, entry);
    assert_eq!(parsed.password(), "hunter2");
    assert!(parsed.get("PIN").unwrap().is_protected());
    assert_eq!(parsed.get("Empty"), Some(&ProtectedValue::Protected(String::new())));
    assert!(!parsed.get("UserName").unwrap().is_protected());
}

#[test]
fn test_protected_value_wrong_stream() {
    let mut entry = Entry::new();
    entry.set_password("correct horse battery staple");
    let mut context = salsa20_context(4);
    let xml = write_document(entry, "Entry", &mut context).unwrap();
    let mut context = KdbxContext::new(4, open_stream(InnerStreamId::Salsa20, &[9u8; 32]).unwrap());
    match parse_document::<Entry>(&xml, "Entry", &mut context) {
        Ok(parsed) => assert_ne!(parsed.password(), "correct horse battery staple"),
        Err(e) => assert!(e.contains("UTF-8")),
    }
}

#[test]
fn test_binary_refs_share_pool() {
    let mut file = KeePassFile::new("Attachments");
    let mut first = Entry::new();
    first.add_binary("a.txt", b"same".to_vec());
    first.add_binary("b.bin", vec![0, 1, 2, 3]);
    let mut second = Entry::new();
    second.add_binary("copy.txt", b"same".to_vec());
    file.root_group_mut().add_entry(first);
    file.root_group_mut().add_entry(second);

    let pool = file.collect_binaries();
    assert_eq!(
        pool,
        vec![
            PoolBinary::new(b"same".to_vec(), false),
            PoolBinary::new(vec![0, 1, 2, 3], false),
        ]
    );

    let mut context = KdbxContext::new(4, CipherValue::Null);
    context.binaries = pool.clone();
    let xml = xml_string(write_document(file.clone(), "KeePassFile", &mut context).unwrap());
    assert_eq!(xml.matches("Ref=\"0\"").count(), 2);
    assert_eq!(xml.matches("Ref=\"1\"").count(), 1);
    assert_eq!(context.binaries.len(), 2);

    let mut context = KdbxContext::new(4, CipherValue::Null);
    context.binaries = pool;
    let parsed: KeePassFile = parse_document(xml.as_bytes(), "KeePassFile", &mut context).unwrap();
    assert_eq!(parsed, file);
    let entries: Vec<&Entry> = parsed.root_group().all_entries().collect();
    assert_eq!(entries[1].get_binary(0), Some(("copy.txt", &b"same"[..])));
}

#[test]
fn test_protected_binary_flag() {
    let mut file = KeePassFile::new("Attachments");
    let mut first = Entry::new();
    first.add_binary("plain.txt", b"plain".to_vec());
    first.add_binary("shared.txt", b"shared".to_vec());
    let mut second = Entry::new();
    second.add_protected_binary("secret.key", b"shared".to_vec());
    file.root_group_mut().add_entry(first);
    file.root_group_mut().add_entry(second);

    let pool = file.collect_binaries();
    assert_eq!(
        pool,
        vec![
            PoolBinary::new(b"plain".to_vec(), false),
            PoolBinary::new(b"shared".to_vec(), true),
        ]
    );

    let mut context = KdbxContext::new(4, CipherValue::Null);
    context.binaries = pool.clone();
    let xml = write_document(file, "KeePassFile", &mut context).unwrap();
    let mut context = KdbxContext::new(4, CipherValue::Null);
    context.binaries = pool;
    let parsed: KeePassFile = parse_document(&xml, "KeePassFile", &mut context).unwrap();
    let entries: Vec<&Entry> = parsed.root_group().all_entries().collect();
    assert!(!entries[0].is_binary_protected(0));
    assert!(entries[0].is_binary_protected(1));
    assert!(entries[1].is_binary_protected(0));
}

#[test]
fn test_kdbx3_protected_meta_binary() {
    let mut file = KeePassFile::new("Attachments");
    let mut entry = Entry::new();
    entry.add_protected_binary("secret.key", b"top secret".to_vec());
    entry.add_binary("notes.txt", b"nothing to see".to_vec());
    file.root_group_mut().add_entry(entry);
    let pool = file.collect_binaries();
    let binaries = pool
        .iter()
        .enumerate()
        .map(|(id, binary)| Binary::new(id, binary.clone()))
        .collect();
    file.meta_mut().set_binaries(Some(binaries));

    let mut context = salsa20_context(3);
    context.binaries = pool;
    let xml = xml_string(write_document(file, "KeePassFile", &mut context).unwrap());
    assert_eq!(xml.matches("Protected=\"True\"").count(), 1);
    assert!(!xml.contains(&base64::Engine::encode(
        &base64::engine::general_purpose::STANDARD,
        b"top secret"
    )));

    let mut context = salsa20_context(3);
    let parsed: KeePassFile = parse_document(xml.as_bytes(), "KeePassFile", &mut context).unwrap();
    let entry = parsed.root_group().all_entries().next().unwrap();
    assert_eq!(entry.get_binary(0), Some(("secret.key", &b"top secret"[..])));
    assert!(entry.is_binary_protected(0));
    assert!(!entry.is_binary_protected(1));
}

#[test]
fn test_missing_binary_ref_is_empty() {
    let mut context = KdbxContext::default();
    let entry: Entry = parse_document(
        b"<Entry><Binary><Key>gone.txt</Key><Value Ref=\"7\"/></Binary></Entry>",
        "Entry",
        &mut context,
    )
    .unwrap();
    assert_eq!(entry.binary_count(), 1);
    assert_eq!(entry.get_binary(0), Some(("gone.txt", &[][..])));
}

#[test]
fn test_kdbx3_meta_binaries() {
    // "hello" gzipped, then a plain and a protected attachment
    let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    std::io::Write::write_all(&mut gz, b"hello").unwrap();
    let compressed = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, gz.finish().unwrap());
    let mut secret = b"secret".to_vec();
    salsa20_context(3).inner_cipher.apply_keystream(&mut secret);
    let protected = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, secret);
    let document = format!(
        r#"<KeePassFile><Meta><Binaries>
<Binary ID="0" Compressed="True">{}</Binary>
<Binary ID="1" Protected="True">{}</Binary>
<Binary ID="2">AAEC</Binary>
</Binaries></Meta><Root><Group><Entry>
<Binary><Key>greeting.txt</Key><Value Ref="0"/></Binary>
<Binary><Key>key.bin</Key><Value Ref="1"/></Binary>
<Binary><Key>raw.bin</Key><Value Ref="2"/></Binary>
<Binary><Key>inline.bin</Key><Value>AwQ=</Value></Binary>
</Entry></Group></Root></KeePassFile>"#,
        compressed, protected
    );
    let mut context = salsa20_context(3);
    let file: KeePassFile = parse_document(document.as_bytes(), "KeePassFile", &mut context).unwrap();
    let entry = file.root_group().all_entries().next().unwrap();
    let binaries: Vec<(&str, &[u8])> = entry.binaries().collect();
    assert_eq!(
        binaries,
        vec![
            ("greeting.txt", &b"hello"[..]),
            ("key.bin", &b"secret"[..]),
            ("raw.bin", &[0, 1, 2][..]),
            ("inline.bin", &[3, 4][..]),
        ]
    );
    assert!(!entry.is_binary_protected(0));
    assert!(entry.is_binary_protected(1));
}

#[test]
fn test_binary_id_limit() {
    let mut context = KdbxContext::default();
    let result: std::result::Result<KeePassFile, String> = parse_document(
        b"<KeePassFile><Meta><Binaries><Binary ID=\"99999999\">AA==</Binary></Binaries></Meta></KeePassFile>",
        "KeePassFile",
        &mut context,
    );
    assert!(result.is_err());
}

#[test]
fn test_group_iteration_order() {
    let mut root = Group::new("Root");
    let mut web = Group::new("Web");
    let mut mail = Group::new("Mail");
    let mut entry = Entry::new();
    entry.set_title("Inbox");
    mail.add_entry(entry);
    web.add_group(mail);
    let mut entry = Entry::new();
    entry.set_title("Forum");
    web.add_entry(entry);
    root.add_group(web);
    root.add_group(Group::new("Empty"));
    let mut entry = Entry::new();
    entry.set_title("Top");
    root.add_entry(entry);

    let names: Vec<&str> = root.all_groups().map(|g| g.name().as_str()).collect();
    assert_eq!(names, vec!["Root", "Web", "Mail", "Empty"]);
    let titles: Vec<&str> = root.all_entries().map(|e| e.title()).collect();
    assert_eq!(titles, vec!["Top", "Forum", "Inbox"]);
}

#[test]
fn test_delete_entry_records_deleted_object() {
    let mut file = KeePassFile::new("Deletions");
    let entry = Entry::new();
    let uuid = *entry.uuid();
    file.root_group_mut().add_entry(entry);
    assert!(file.delete_entry(uuid).is_some());
    assert!(file.delete_entry(uuid).is_none());
    assert_eq!(file.root_group().entries().len(), 0);
    assert_eq!(file.root().deleted_objects().len(), 1);
    assert_eq!(*file.root().deleted_objects()[0].uuid(), uuid);
}

#[test]
fn test_history_snapshot() {
    let mut entry = Entry::new();
    entry.set_password("old");
    entry.snapshot();
    entry.set_password("new");
    entry.add_binary("note.txt", b"v2".to_vec());
    let history = entry.history().as_ref().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].password(), "old");
    assert!(history[0].history().is_none());
    assert_eq!(entry.password(), "new");
}

#[test]
fn test_document_roundtrip_kdbx3_format() {
    let mut file = KeePassFile::new("Round trip");
    file.meta_mut().set_default_user_name("someone");
    file.meta_mut().custom_data_mut().push(Item::new("KPXC", "1"));
    let mut entry = Entry::new();
    entry.set_title("Example");
    entry.set_url("https://example.com");
    entry.set_notes("Line one\nLine two & <three>");
    entry.set_password("p4ss");
    entry.set_tags("web;test");
    file.root_group_mut().add_entry(entry);

    let mut context = salsa20_context(3);
    let xml = write_document(file.clone(), "KeePassFile", &mut context).unwrap();
    assert!(xml.starts_with(b"<?xml version=\"1.0\" encoding=\"utf-8\" standalone=\"yes\"?>"));
    let mut context = salsa20_context(3);
    let parsed: KeePassFile = parse_document(&xml, "KeePassFile", &mut context).unwrap();
    assert_eq!(parsed, file);
}

#[test]
fn test_byte_order_mark() {
    let mut context = KdbxContext::default();
    let parsed: Group = parse_document(b"\xEF\xBB\xBF<Group><Name>BOM</Name></Group>", "Group", &mut context).unwrap();
    assert_eq!(parsed.name(), "BOM");
}

#[test]
fn test_default_settings() {
    let settings = DatabaseSettings::default();
    assert!(settings.is_kdbx4());
    assert_eq!(settings.cipher, CipherId::Aes256Cbc);
    assert_eq!(settings.compression, Compression::Gzip);
    assert_eq!(settings.inner_stream, InnerStreamId::ChaCha20);
    assert!(load_kdf(&settings.kdf_parameters).is_ok());

    let settings = DatabaseSettings::kdbx3();
    assert!(!settings.is_kdbx4());
    assert_eq!(settings.minor_version, 1);
    assert_eq!(
        load_kdf(&settings.kdf_parameters).unwrap().uuid(),
        crate::kdf::KDF_AES_KDBX3
    );
}
