use std::env;
use std::fs;
use std::process::ExitCode;

use clap::{Arg, ArgAction, ArgMatches, Command};
use log::{debug, error};
use rpassword::prompt_password;

use kdbx_codec::{CipherId, DatabaseSettings, Error, Group, KeePassDoc, Key, Result};

fn options() -> Command {
    Command::new("kdbx-codec")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Loren M. Lang <lorenl@north-winds.org>")
        .about("Dump and convert KeePass KDBX databases")
        .arg(
            Arg::new("key")
                .short('k')
                .long("key-file")
                .value_name("KEYFILE")
                .help("Key file for unlocking database"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("FILE")
                .help("Save the database again under this name"),
        )
        .arg(
            Arg::new("kdbx3")
                .long("kdbx3")
                .action(ArgAction::SetTrue)
                .requires("output")
                .help("Save as KDBX 3.1 instead of the original format"),
        )
        .arg(
            Arg::new("file")
                .help("Password database")
                .required(true)
                .index(1),
        )
}

fn read_key(options: &ArgMatches) -> Result<Key> {
    let user_password = match env::var("KDBX_PASSWORD") {
        Ok(password) => password,
        Err(env::VarError::NotPresent) => prompt_password("Password: ")?,
        Err(env::VarError::NotUnicode(_)) => {
            return Err(Error::InvalidPassword("KDBX_PASSWORD is not valid UTF-8".to_string()))
        }
    };
    let keyfile = options.get_one::<String>("key");
    let mut key = Key::new();
    // An empty password only counts when there is no key file
    if !user_password.is_empty() || keyfile.is_none() {
        key.set_user_password(user_password);
    }
    if let Some(filename) = keyfile {
        key.set_keyfile(fs::read(filename)?)?;
    }
    Ok(key)
}

fn dump_group(group: &Group, depth: usize) {
    let indent = "  ".repeat(depth);
    println!("{}[{}]", indent, group.name());
    for entry in group.entries() {
        println!("{}  {}", indent, entry.title());
        if !entry.username().is_empty() {
            println!("{}    user: {}", indent, entry.username());
        }
        if !entry.url().is_empty() {
            println!("{}    url:  {}", indent, entry.url());
        }
        for (name, data) in entry.binaries() {
            println!("{}    file: {} ({} bytes)", indent, name, data.len());
        }
    }
    for child in group.groups() {
        dump_group(child, depth + 1);
    }
}

fn run(options: &ArgMatches) -> Result<()> {
    let filename = options
        .get_one::<String>("file")
        .ok_or_else(|| Error::Io(std::io::ErrorKind::InvalidInput.into()))?;
    let key = read_key(options)?;
    let mut doc = KeePassDoc::load_file(filename, &key)?;
    debug!("Loaded settings: {:?}", doc.settings);

    println!(
        "{} (KDBX {}.{}, {})",
        doc.file.meta().database_name(),
        doc.settings.major_version,
        doc.settings.minor_version,
        doc.settings.cipher
    );
    dump_group(doc.file.root_group(), 0);

    if let Some(output) = options.get_one::<String>("output") {
        if options.get_flag("kdbx3") {
            let cipher = match doc.settings.cipher {
                CipherId::ChaCha20 => CipherId::Aes256Cbc,
                other => other,
            };
            doc.settings = DatabaseSettings {
                cipher,
                compression: doc.settings.compression,
                ..DatabaseSettings::kdbx3()
            };
        }
        doc.save_file(output, &key)?;
        println!("Saved {}", output);
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();

    let options = options().get_matches();
    match run(&options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:?}", e);
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}
