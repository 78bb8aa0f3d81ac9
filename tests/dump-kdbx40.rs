#![cfg(feature = "argon2")]

use std::io::Cursor;
use std::path::PathBuf;
use std::process::Command;

use chrono::{TimeZone, Utc};
use kdbx_codec::kdf::{KDF_ARGON2_ID, KDF_PARAM_ITERATIONS, KDF_PARAM_MEMORY, KDF_PARAM_UUID};
use kdbx_codec::{CipherId, Compression, InnerStreamId, KeePassDoc, Key};
use uuid::uuid;

fn fixture() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("testdata")
        .join("demo-kdbx40.kdbx")
}

fn open() -> KeePassDoc {
    KeePassDoc::load_file(fixture(), &Key::with_password("demo")).expect("Failed to open fixture")
}

#[test]
fn main() {
    let output = Command::new(env!("CARGO_BIN_EXE_kdbx-codec"))
        .env("KDBX_PASSWORD", "demo")
        .arg(fixture())
        .output()
        .expect("failed to execute process");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Demo Vault (KDBX 4.0, ChaCha20)"), "{}", stdout);
    assert!(stdout.contains("file: statement.txt (43 bytes)"), "{}", stdout);
    assert!(!stdout.contains("correct horse"));
}

#[test]
fn header_settings() {
    let doc = open();
    assert_eq!(doc.settings.major_version, 4);
    assert_eq!(doc.settings.minor_version, 0);
    assert_eq!(doc.settings.cipher, CipherId::ChaCha20);
    assert_eq!(doc.settings.compression, Compression::Gzip);
    assert_eq!(doc.settings.inner_stream, InnerStreamId::ChaCha20);
    let kdf = &doc.settings.kdf_parameters;
    assert_eq!(kdf.get_bytes(KDF_PARAM_UUID), Some(&KDF_ARGON2_ID.as_bytes()[..]));
    assert_eq!(kdf.get_u64(KDF_PARAM_MEMORY), Some(1024 * 1024));
    assert_eq!(kdf.get_u64(KDF_PARAM_ITERATIONS), Some(2));
}

#[test]
fn document_contents() {
    let doc = open();
    let meta = doc.file.meta();
    assert_eq!(meta.generator(), "kdbx-testdata");
    assert_eq!(meta.database_name(), "Demo Vault");
    assert_eq!(meta.default_user_name(), "alice");
    assert!(*meta.memory_protection().protect_password());
    assert_eq!(meta.custom_data()[0].key(), "KPXC_DECRYPTION_TIME_PREFERENCE");

    let root = doc.file.root_group();
    assert_eq!(root.name(), "Root");
    assert_eq!(*root.enable_auto_type(), None);

    let bank = &root.entries()[0];
    assert_eq!(*bank.uuid(), uuid!("3b1e4a3c-7f70-4a4e-a9b5-0e4c1b2d3e4f"));
    assert_eq!(bank.title(), "Bank");
    assert_eq!(bank.username(), "alice");
    assert_eq!(bank.password(), "correct horse battery staple");
    assert_eq!(bank.notes(), "Branch & account <1234>");
    assert_eq!(bank.tags(), "finance");
    let pin = bank.get("PIN").expect("PIN field");
    assert!(pin.is_protected());
    assert_eq!(pin.value(), "0000");
    assert!(!bank.get("URL").expect("URL field").is_protected());
    assert_eq!(
        *bank.times().creation_time(),
        Utc.with_ymd_and_hms(2023, 3, 14, 15, 9, 26).unwrap()
    );
    assert_eq!(*bank.times().usage_count(), 3);
    assert_eq!(bank.auto_type().associations()[0].window(), "Bank - Firefox");

    assert_eq!(
        bank.get_binary(0),
        Some(("statement.txt", &b"Statement for March 2023\nBalance: 1,234.56\n"[..]))
    );
    assert!(bank.is_binary_protected(0));

    let history = bank.history().as_ref().expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].password(), "hunter2");

    let mail = &root.groups()[0].entries()[0];
    assert_eq!(root.groups()[0].name(), "Email");
    assert_eq!(mail.password(), "pässwörd ✓");
    assert_eq!(mail.username(), "alice@example.com");

    let deleted = doc.file.root().deleted_objects();
    assert_eq!(*deleted[0].uuid(), uuid!("77777777-8888-4999-aaaa-bbbbbbbbbbbb"));
}

#[test]
fn resave_keeps_contents() {
    let doc = open();
    let key = Key::with_password("demo");
    let mut output = Vec::new();
    doc.save(&mut output, &key).expect("save");
    let reloaded = KeePassDoc::load(&mut Cursor::new(output), &key).expect("reload");
    assert_eq!(reloaded.file, doc.file);
    assert_eq!(reloaded.settings.cipher, CipherId::ChaCha20);
    assert!(reloaded.file.root_group().entries()[0].is_binary_protected(0));
}

#[test]
fn wrong_password() {
    let result = KeePassDoc::load_file(fixture(), &Key::with_password("Demo"));
    assert!(matches!(result, Err(kdbx_codec::Error::InvalidCredentials)));
}
