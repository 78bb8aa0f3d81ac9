use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::debug;
use ring::digest::{digest, Context, SHA256};
use sxd_document::parser;
use sxd_xpath::evaluate_xpath;

use crate::error::{Error, Result};

/// Composite key protecting the password database
///
/// This key is composed of a password and/or a key file which
/// must be provided when opening a KeePass password database
/// ```
/// use kdbx_codec::Key;
/// let mut key = Key::new();
/// key.set_user_password("secret");
/// ```
#[derive(Clone, Default)]
pub struct Key {
    user_password: Option<Vec<u8>>,
    keyfile: Option<Vec<u8>>,
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Key")
            .field("user_password", &self.user_password.is_some())
            .field("keyfile", &self.keyfile.is_some())
            .finish()
    }
}

impl Key {
    /// Create a new composite key
    /// ```
    /// # use kdbx_codec::Key;
    /// let mut key = Key::new();
    /// ```
    pub fn new() -> Key {
        Key::default()
    }

    /// Shorthand for a password-only key
    pub fn with_password<T: AsRef<[u8]>>(user_password: T) -> Key {
        let mut key = Key::new();
        key.set_user_password(user_password);
        key
    }

    /// Set the password for the composite key
    /// ```
    /// # use kdbx_codec::Key;
    /// # let mut key = Key::new();
    /// key.set_user_password("secret");
    /// ```
    pub fn set_user_password<T>(&mut self, user_password: T)
    where
        T: AsRef<[u8]>,
    {
        self.user_password = Some(digest(&SHA256, user_password.as_ref()).as_ref().to_owned());
    }

    /// Load the contents of a key file for the composite key
    ///
    /// XML key files (version 1.0 and 2.0), 32 byte binary keys and 64
    /// character hex keys are used as-is; any other file is hashed.
    /// ```
    /// # use kdbx_codec::Key;
    /// # let mut key = Key::new();
    /// key.set_keyfile(b"any file works as a key file").unwrap();
    /// ```
    pub fn set_keyfile<T>(&mut self, keyfile: T) -> Result<()>
    where
        T: AsRef<[u8]>,
    {
        self.keyfile = Some(load_keyfile(keyfile.as_ref())?);
        Ok(())
    }

    pub(crate) fn composite_key(&self) -> Result<Vec<u8>> {
        if self.user_password.is_none() && self.keyfile.is_none() {
            return Err(Error::EmptyKey);
        }

        let mut context = Context::new(&SHA256);

        if let Some(key) = &self.user_password {
            context.update(key);
        }

        if let Some(key) = &self.keyfile {
            context.update(key);
        }

        Ok(context.finish().as_ref().to_owned())
    }
}

fn load_keyfile(data: &[u8]) -> Result<Vec<u8>> {
    if let Some(key) = load_xml_keyfile(data)? {
        debug!("Using XML key file");
        return Ok(key);
    }
    if data.len() == 32 {
        debug!("Using binary key file");
        return Ok(data.to_vec());
    }
    if data.len() == 64 && data.iter().all(u8::is_ascii_hexdigit) {
        if let Ok(key) = hex::decode(data) {
            debug!("Using hex key file");
            return Ok(key);
        }
    }
    debug!("Using hashed key file");
    Ok(digest(&SHA256, data).as_ref().to_owned())
}

fn xpath_string(document: &sxd_document::dom::Document, xpath: &str) -> Result<String> {
    evaluate_xpath(document, xpath)
        .map(|value| value.string())
        .map_err(|e| Error::InvalidKeyFile(e.to_string()))
}

/// Returns `None` when the data is not a KeePass XML key file
fn load_xml_keyfile(data: &[u8]) -> Result<Option<Vec<u8>>> {
    let contents = match std::str::from_utf8(data) {
        Ok(contents) => contents.trim_start_matches('\u{feff}'),
        Err(_) => return Ok(None),
    };
    let package = match parser::parse(contents) {
        Ok(package) => package,
        Err(_) => return Ok(None),
    };
    let document = package.as_document();
    let is_keyfile = evaluate_xpath(&document, "boolean(/KeyFile)")
        .map(|value| value.boolean())
        .unwrap_or(false);
    if !is_keyfile {
        return Ok(None);
    }

    let version = xpath_string(&document, "/KeyFile/Meta/Version/text()")?;
    let key_data = xpath_string(&document, "/KeyFile/Key/Data/text()")?;
    match version.trim() {
        v if v.starts_with("1.") => {
            let key = BASE64
                .decode(key_data.trim())
                .map_err(|e| Error::InvalidKeyFile(e.to_string()))?;
            Ok(Some(key))
        }
        v if v.starts_with("2.") => {
            let stripped: String = key_data.chars().filter(|c| !c.is_whitespace()).collect();
            let key = hex::decode(&stripped).map_err(|e| Error::InvalidKeyFile(e.to_string()))?;
            let hash = xpath_string(&document, "string(/KeyFile/Key/Data/@Hash)")?;
            if !hash.is_empty() {
                let actual = digest(&SHA256, &key);
                if !hash.eq_ignore_ascii_case(&hex::encode(&actual.as_ref()[..4])) {
                    return Err(Error::InvalidKeyFile("key file hash mismatch".to_string()));
                }
            }
            Ok(Some(key))
        }
        v => Err(Error::InvalidKeyFile(format!("unsupported key file version {:?}", v))),
    }
}
