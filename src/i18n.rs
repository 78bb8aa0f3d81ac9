//! Qt Linguist translation catalogs (`.ts` files)
//!
//! A catalog maps `(context, source, disambiguation)` to translated text.
//! Numerus messages carry one form per plural class of the catalog's
//! language and are selected with [`PluralRule`].

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::prelude::*;
use std::io::BufReader;
use std::path::Path;

use log::{debug, warn};
use xml::attribute::OwnedAttribute;
use xml::reader::{EventReader, ParserConfig, XmlEvent};

use crate::error::{Error, Result};

fn invalid<T: fmt::Display>(message: T) -> Error {
    Error::Translation(message.to_string())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TranslationState {
    Finished,
    Unfinished,
    Vanished,
    Obsolete,
}

impl TranslationState {
    fn from_type(value: Option<&str>) -> Self {
        match value {
            None | Some("") => TranslationState::Finished,
            Some("unfinished") => TranslationState::Unfinished,
            Some("vanished") => TranslationState::Vanished,
            Some("obsolete") => TranslationState::Obsolete,
            Some(other) => {
                warn!("Unknown translation type {:?}", other);
                TranslationState::Finished
            }
        }
    }

    /// Vanished and obsolete messages are kept only for translators
    pub fn is_live(&self) -> bool {
        matches!(self, TranslationState::Finished | TranslationState::Unfinished)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Translation {
    Text(String),
    Forms(Vec<String>),
}

impl Default for Translation {
    fn default() -> Self {
        Translation::Text(String::new())
    }
}

impl Translation {
    pub fn is_empty(&self) -> bool {
        match self {
            Translation::Text(text) => text.is_empty(),
            Translation::Forms(forms) => forms.iter().all(|f| f.is_empty()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub context: String,
    pub source: String,
    /// Disambiguation shown to translators as `<comment>`
    pub comment: Option<String>,
    pub numerus: bool,
    pub state: TranslationState,
    pub translation: Translation,
}

impl Message {
    fn key(&self) -> (String, String, String) {
        (
            self.context.clone(),
            self.source.clone(),
            self.comment.clone().unwrap_or_default(),
        )
    }

    fn answers(&self) -> bool {
        self.state.is_live() && !self.translation.is_empty()
    }
}

/// Plural classes following Qt's numerus rules
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PluralRule {
    /// A single form for every count (Japanese, Chinese, Turkish, ...)
    OneForm,
    /// `n == 1`
    English,
    /// `n <= 1`
    French,
    /// `n % 10 == 1 && n % 100 != 11`, `n != 0`, zero
    Latvian,
    /// `n % 10 == 1 && n % 100 != 11`
    Icelandic,
    /// 1, 2, other
    Irish,
    /// Czech and Slovak: 1, 2-4, other
    Czech,
    /// `n % 10 == 1`, `n % 10 == 2`, other
    Macedonian,
    Lithuanian,
    /// Russian style: one, few, many
    Slavic,
    Polish,
    /// 1, 0 or `n % 100` in 1-19, other
    Romanian,
    /// `n % 100` of 1, 2, 3-4, other
    Slovenian,
    Maltese,
    /// 0, 1, 2-5, 6, other
    Welsh,
    /// 0, 1, 2, `n % 100` in 3-10, `n % 100` of 11 and up, other
    Arabic,
}

fn is_few(n: u64) -> bool {
    (2..=4).contains(&(n % 10)) && !(10..=19).contains(&(n % 100))
}

impl PluralRule {
    /// Rule for a language tag such as `ja_JP`, `pt-BR` or `ru`
    pub fn for_language(language: &str) -> Self {
        let language = language.replace('-', "_").to_ascii_lowercase();
        let primary = language.split('_').next().unwrap_or("");
        match (primary, language.as_str()) {
            (_, "pt_br") => PluralRule::French,
            (
                "bi" | "bo" | "dz" | "fa" | "fj" | "gn" | "hu" | "id" | "ja" | "jv" | "km" | "ko"
                | "lo" | "ms" | "my" | "na" | "om" | "su" | "th" | "tr" | "tt" | "vi" | "yo"
                | "za" | "zh",
                _,
            ) => PluralRule::OneForm,
            ("br" | "fil" | "fr" | "hy" | "ln" | "oc" | "ti" | "tl" | "wa", _) => PluralRule::French,
            ("lv", _) => PluralRule::Latvian,
            ("is", _) => PluralRule::Icelandic,
            ("dv" | "ga" | "gv" | "ik" | "iu" | "mi" | "sa" | "se" | "sm", _) => PluralRule::Irish,
            ("cs" | "sk", _) => PluralRule::Czech,
            ("mk", _) => PluralRule::Macedonian,
            ("lt", _) => PluralRule::Lithuanian,
            ("be" | "bs" | "hr" | "ru" | "sh" | "sr" | "uk", _) => PluralRule::Slavic,
            ("pl", _) => PluralRule::Polish,
            ("mo" | "ro", _) => PluralRule::Romanian,
            ("sl", _) => PluralRule::Slovenian,
            ("mt", _) => PluralRule::Maltese,
            ("cy", _) => PluralRule::Welsh,
            ("ar", _) => PluralRule::Arabic,
            _ => PluralRule::English,
        }
    }

    pub fn form_count(&self) -> usize {
        match self {
            PluralRule::OneForm => 1,
            PluralRule::English | PluralRule::French | PluralRule::Icelandic => 2,
            PluralRule::Latvian
            | PluralRule::Irish
            | PluralRule::Czech
            | PluralRule::Macedonian
            | PluralRule::Lithuanian
            | PluralRule::Slavic
            | PluralRule::Polish
            | PluralRule::Romanian => 3,
            PluralRule::Slovenian | PluralRule::Maltese => 4,
            PluralRule::Welsh => 5,
            PluralRule::Arabic => 6,
        }
    }

    /// Index of the numerus form used for `n`
    pub fn form_index(&self, n: u64) -> usize {
        let (n10, n100) = (n % 10, n % 100);
        match self {
            PluralRule::OneForm => 0,
            PluralRule::English => usize::from(n != 1),
            PluralRule::French => usize::from(n > 1),
            PluralRule::Latvian => {
                if n10 == 1 && n100 != 11 {
                    0
                } else if n != 0 {
                    1
                } else {
                    2
                }
            }
            PluralRule::Icelandic => usize::from(!(n10 == 1 && n100 != 11)),
            PluralRule::Irish => match n {
                1 => 0,
                2 => 1,
                _ => 2,
            },
            PluralRule::Czech => match n {
                1 => 0,
                2..=4 => 1,
                _ => 2,
            },
            PluralRule::Macedonian => match n10 {
                1 => 0,
                2 => 1,
                _ => 2,
            },
            PluralRule::Lithuanian => {
                if n10 == 1 && n100 != 11 {
                    0
                } else if n10 != 0 && !(10..=19).contains(&n100) {
                    1
                } else {
                    2
                }
            }
            PluralRule::Slavic => {
                if n10 == 1 && n100 != 11 {
                    0
                } else if is_few(n) {
                    1
                } else {
                    2
                }
            }
            PluralRule::Polish => {
                if n == 1 {
                    0
                } else if is_few(n) {
                    1
                } else {
                    2
                }
            }
            PluralRule::Romanian => {
                if n == 1 {
                    0
                } else if n == 0 || (1..=19).contains(&n100) {
                    1
                } else {
                    2
                }
            }
            PluralRule::Slovenian => match n100 {
                1 => 0,
                2 => 1,
                3 | 4 => 2,
                _ => 3,
            },
            PluralRule::Maltese => {
                if n == 1 {
                    0
                } else if n == 0 || (1..=10).contains(&n100) {
                    1
                } else if (11..=19).contains(&n100) {
                    2
                } else {
                    3
                }
            }
            PluralRule::Welsh => match n {
                0 => 0,
                1 => 1,
                2..=5 => 2,
                6 => 3,
                _ => 4,
            },
            PluralRule::Arabic => match (n, n100) {
                (0, _) => 0,
                (1, _) => 1,
                (2, _) => 2,
                (_, 3..=10) => 3,
                (_, 11..=99) => 4,
                _ => 5,
            },
        }
    }
}

/// Problem found by [`Catalog::validate`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CatalogIssue {
    Untranslated {
        context: String,
        source: String,
    },
    NumerusMismatch {
        context: String,
        source: String,
        expected: usize,
        found: usize,
    },
    Duplicate {
        context: String,
        source: String,
    },
}

impl fmt::Display for CatalogIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatalogIssue::Untranslated { context, source } => {
                write!(f, "{}: {:?} has no translation", context, source)
            }
            CatalogIssue::NumerusMismatch {
                context,
                source,
                expected,
                found,
            } => write!(
                f,
                "{}: {:?} has {} numerus forms, expected {}",
                context, source, found, expected
            ),
            CatalogIssue::Duplicate { context, source } => {
                write!(f, "{}: {:?} is defined more than once", context, source)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Catalog {
    language: String,
    rule: PluralRule,
    messages: Vec<Message>,
    index: HashMap<(String, String, String), usize>,
}

impl Catalog {
    pub fn from_reader<R: Read>(input: R) -> Result<Self> {
        let config = ParserConfig::new().cdata_to_characters(true);
        let mut reader = EventReader::new_with_config(input, config);
        loop {
            match next_event(&mut reader)? {
                XmlEvent::StartElement {
                    name, attributes, ..
                } => {
                    if name.local_name != "TS" {
                        return Err(invalid(format!("Expected <TS> but found <{}>", name.local_name)));
                    }
                    let language = attribute(&attributes, "language").unwrap_or("").to_string();
                    let messages = parse_ts(&mut reader)?;
                    return Ok(Self::new(language, messages));
                }
                XmlEvent::EndDocument => return Err(invalid("Missing <TS> element")),
                _ => {}
            }
        }
    }

    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_reader(BufReader::new(File::open(path)?))
    }

    fn new(language: String, messages: Vec<Message>) -> Self {
        let mut index = HashMap::new();
        for (i, message) in messages.iter().enumerate() {
            index.entry(message.key()).or_insert(i);
        }
        debug!("Loaded {} messages for language {:?}", messages.len(), language);
        Catalog {
            rule: PluralRule::for_language(&language),
            language,
            messages,
            index,
        }
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn plural_rule(&self) -> PluralRule {
        self.rule
    }

    /// Number of numerus forms each plural message should carry
    pub fn plural_count(&self) -> usize {
        self.rule.form_count()
    }

    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn find(&self, context: &str, source: &str, disambiguation: Option<&str>) -> Option<&Message> {
        let key = (
            context.to_string(),
            source.to_string(),
            disambiguation.unwrap_or("").to_string(),
        );
        self.index
            .get(&key)
            .map(|i| &self.messages[*i])
            .filter(|m| m.answers())
    }

    pub fn translate(&self, context: &str, source: &str, disambiguation: Option<&str>) -> Option<&str> {
        match &self.find(context, source, disambiguation)?.translation {
            Translation::Text(text) => Some(text),
            Translation::Forms(forms) => forms.iter().find(|f| !f.is_empty()).map(String::as_str),
        }
    }

    /// Translation or, failing that, the source text
    pub fn tr<'a>(&'a self, context: &str, source: &'a str, disambiguation: Option<&str>) -> &'a str {
        self.translate(context, source, disambiguation).unwrap_or(source)
    }

    /// Numerus form for `n` with `%n` replaced
    pub fn translate_plural(
        &self,
        context: &str,
        source: &str,
        disambiguation: Option<&str>,
        n: u64,
    ) -> Option<String> {
        let text = match &self.find(context, source, disambiguation)?.translation {
            Translation::Text(text) => text.as_str(),
            Translation::Forms(forms) => {
                let form = forms.get(self.rule.form_index(n)).or_else(|| forms.last())?;
                if form.is_empty() {
                    return None;
                }
                form.as_str()
            }
        };
        Some(text.replace("%n", &n.to_string()))
    }

    pub fn tr_n(&self, context: &str, source: &str, disambiguation: Option<&str>, n: u64) -> String {
        self.translate_plural(context, source, disambiguation, n)
            .unwrap_or_else(|| source.replace("%n", &n.to_string()))
    }

    pub fn validate(&self) -> Vec<CatalogIssue> {
        let mut issues = Vec::new();
        for (i, message) in self.messages.iter().enumerate() {
            if !message.state.is_live() {
                continue;
            }
            if self.index.get(&message.key()) != Some(&i) {
                issues.push(CatalogIssue::Duplicate {
                    context: message.context.clone(),
                    source: message.source.clone(),
                });
            }
            if message.state == TranslationState::Finished && message.translation.is_empty() {
                issues.push(CatalogIssue::Untranslated {
                    context: message.context.clone(),
                    source: message.source.clone(),
                });
            }
            if let (true, Translation::Forms(forms)) = (message.numerus, &message.translation) {
                if forms.len() != self.plural_count() {
                    issues.push(CatalogIssue::NumerusMismatch {
                        context: message.context.clone(),
                        source: message.source.clone(),
                        expected: self.plural_count(),
                        found: forms.len(),
                    });
                }
            }
        }
        issues
    }
}

fn attribute<'a>(attributes: &'a [OwnedAttribute], name: &str) -> Option<&'a str> {
    attributes
        .iter()
        .find(|a| a.name.local_name == name)
        .map(|a| a.value.as_str())
}

fn next_event<R: Read>(reader: &mut EventReader<R>) -> Result<XmlEvent> {
    reader.next().map_err(invalid)
}

/// Text content of the current element, skipping any child elements
fn read_text<R: Read>(reader: &mut EventReader<R>) -> Result<String> {
    let mut text = String::new();
    loop {
        match next_event(reader)? {
            XmlEvent::Characters(s) | XmlEvent::Whitespace(s) => text.push_str(&s),
            XmlEvent::StartElement { .. } => reader.skip().map_err(invalid)?,
            XmlEvent::EndElement { .. } => return Ok(text),
            XmlEvent::EndDocument => return Err(invalid("Unexpected end of document")),
            _ => {}
        }
    }
}

fn parse_ts<R: Read>(reader: &mut EventReader<R>) -> Result<Vec<Message>> {
    let mut messages = Vec::new();
    loop {
        match next_event(reader)? {
            XmlEvent::StartElement { name, .. } if name.local_name == "context" => {
                parse_context(reader, &mut messages)?;
            }
            XmlEvent::StartElement { .. } => reader.skip().map_err(invalid)?,
            XmlEvent::EndElement { .. } => return Ok(messages),
            XmlEvent::EndDocument => return Err(invalid("Unexpected end of document")),
            _ => {}
        }
    }
}

fn parse_context<R: Read>(reader: &mut EventReader<R>, messages: &mut Vec<Message>) -> Result<()> {
    let mut context = String::new();
    let first = messages.len();
    loop {
        match next_event(reader)? {
            XmlEvent::StartElement {
                name, attributes, ..
            } => match name.local_name.as_str() {
                "name" => context = read_text(reader)?,
                "message" => {
                    let numerus = attribute(&attributes, "numerus") == Some("yes");
                    messages.push(parse_message(reader, numerus)?);
                }
                _ => reader.skip().map_err(invalid)?,
            },
            XmlEvent::EndElement { .. } => break,
            XmlEvent::EndDocument => return Err(invalid("Unexpected end of document")),
            _ => {}
        }
    }
    // <name> normally comes first but is not required to
    for message in &mut messages[first..] {
        message.context = context.clone();
    }
    Ok(())
}

fn parse_message<R: Read>(reader: &mut EventReader<R>, numerus: bool) -> Result<Message> {
    let mut message = Message {
        context: String::new(),
        source: String::new(),
        comment: None,
        numerus,
        state: TranslationState::Finished,
        translation: Translation::default(),
    };
    let mut has_source = false;
    loop {
        match next_event(reader)? {
            XmlEvent::StartElement {
                name, attributes, ..
            } => match name.local_name.as_str() {
                "source" => {
                    message.source = read_text(reader)?;
                    has_source = true;
                }
                "comment" => message.comment = Some(read_text(reader)?).filter(|c| !c.is_empty()),
                "translation" => {
                    message.state = TranslationState::from_type(attribute(&attributes, "type"));
                    message.translation = parse_translation(reader, numerus)?;
                }
                _ => reader.skip().map_err(invalid)?,
            },
            XmlEvent::EndElement { .. } => break,
            XmlEvent::EndDocument => return Err(invalid("Unexpected end of document")),
            _ => {}
        }
    }
    if !has_source {
        return Err(invalid("Message without <source>"));
    }
    Ok(message)
}

fn parse_translation<R: Read>(reader: &mut EventReader<R>, numerus: bool) -> Result<Translation> {
    let mut text = String::new();
    let mut forms = Vec::new();
    loop {
        match next_event(reader)? {
            XmlEvent::Characters(s) | XmlEvent::Whitespace(s) => text.push_str(&s),
            XmlEvent::StartElement { name, .. } if name.local_name == "numerusform" => {
                forms.push(read_text(reader)?);
            }
            XmlEvent::StartElement { .. } => reader.skip().map_err(invalid)?,
            XmlEvent::EndElement { .. } => break,
            XmlEvent::EndDocument => return Err(invalid("Unexpected end of document")),
            _ => {}
        }
    }
    if numerus || !forms.is_empty() {
        Ok(Translation::Forms(forms))
    } else {
        Ok(Translation::Text(text))
    }
}
