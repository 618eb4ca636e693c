//! Distinguished name parsing and matching.
//!
//! Allowed names are written by operators as RFC 4514-style strings
//! (`CN=ops-controller,OU=platform,O=Example`) and parsed into a
//! fixed-schema [`DistinguishedName`]. The same record is built from a peer
//! certificate's subject so both sides compare field by field.
//!
//! # Attribute policy
//!
//! | Key | Field | Repeats |
//! |-----|-------|---------|
//! | `CN` | `common_name` | last wins |
//! | `SERIALNUMBER` | `serial_number` | last wins |
//! | `C` | `country` | accumulate |
//! | `O` | `organization` | accumulate |
//! | `OU` | `organizational_unit` | accumulate |
//! | `L` | `locality` | accumulate |
//! | `ST` | `province` | accumulate |
//! | `STREET` | `street_address` | accumulate |
//! | `POSTALCODE` | `postal_code` | accumulate |
//!
//! Any other key is a parse error: an unknown key would otherwise be
//! silently dropped and widen the allowlist.

use std::fmt;

use thiserror::Error;
use x509_parser::x509::X509Name;

/// Errors produced while parsing a distinguished name string.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DnParseError {
    /// The input is empty or whitespace only.
    #[error("distinguished name is empty")]
    Empty,

    /// Two separators with nothing between them, or a trailing separator.
    #[error("empty RDN component")]
    EmptyComponent,

    /// A component has no `=`.
    #[error("RDN component '{0}' is missing '='")]
    MissingEquals(String),

    /// The key is not one of the supported attribute types.
    #[error("unknown attribute type '{0}'")]
    UnknownAttribute(String),

    /// `KEY=` with nothing after it.
    #[error("attribute '{0}' has an empty value")]
    EmptyValue(String),

    /// A backslash escape that is truncated or not valid UTF-8.
    #[error("invalid escape sequence")]
    InvalidEscape,

    /// A double-quoted value that never closes.
    #[error("unterminated quoted value")]
    UnterminatedQuote,
}

/// Attribute types understood by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attribute {
    CommonName,
    SerialNumber,
    Country,
    Organization,
    OrganizationalUnit,
    Locality,
    Province,
    StreetAddress,
    PostalCode,
}

impl Attribute {
    fn from_key(key: &str) -> Option<Self> {
        let attr = match key.to_ascii_uppercase().as_str() {
            "CN" => Self::CommonName,
            "SERIALNUMBER" => Self::SerialNumber,
            "C" => Self::Country,
            "O" => Self::Organization,
            "OU" => Self::OrganizationalUnit,
            "L" => Self::Locality,
            "ST" => Self::Province,
            "STREET" => Self::StreetAddress,
            "POSTALCODE" => Self::PostalCode,
            _ => return None,
        };
        Some(attr)
    }

    /// Map an X.520 attribute OID (dotted form) to an attribute.
    fn from_oid(oid: &str) -> Option<Self> {
        let attr = match oid {
            "2.5.4.3" => Self::CommonName,
            "2.5.4.5" => Self::SerialNumber,
            "2.5.4.6" => Self::Country,
            "2.5.4.7" => Self::Locality,
            "2.5.4.8" => Self::Province,
            "2.5.4.9" => Self::StreetAddress,
            "2.5.4.10" => Self::Organization,
            "2.5.4.11" => Self::OrganizationalUnit,
            "2.5.4.17" => Self::PostalCode,
            _ => return None,
        };
        Some(attr)
    }
}

/// A parsed distinguished name.
///
/// Every field is optional. A field that is `None` (or empty, for the
/// multi-valued ones) acts as a wildcard when this value is used as an
/// allowlist pattern; see [`DistinguishedName::matches`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DistinguishedName {
    /// Common Name (CN).
    pub common_name: Option<String>,
    /// Serial number attribute (SERIALNUMBER), not the certificate serial.
    pub serial_number: Option<String>,
    /// Country (C).
    pub country: Vec<String>,
    /// Organization (O).
    pub organization: Vec<String>,
    /// Organizational Unit (OU).
    pub organizational_unit: Vec<String>,
    /// Locality (L).
    pub locality: Vec<String>,
    /// State or province (ST).
    pub province: Vec<String>,
    /// Street address (STREET).
    pub street_address: Vec<String>,
    /// Postal code (POSTALCODE).
    pub postal_code: Vec<String>,
}

impl DistinguishedName {
    /// Parse a comma-separated `KEY=value` string.
    ///
    /// # Errors
    ///
    /// Returns [`DnParseError`] for empty input, components without `=`,
    /// unknown keys, empty values, and malformed escapes or quotes.
    pub fn parse(input: &str) -> Result<Self, DnParseError> {
        if input.trim().is_empty() {
            return Err(DnParseError::Empty);
        }

        let mut dn = Self::default();
        for (key, value) in split_components(input)? {
            let attr = Attribute::from_key(&key).ok_or(DnParseError::UnknownAttribute(key))?;
            dn.set(attr, value);
        }
        Ok(dn)
    }

    /// Build a record from a certificate subject.
    ///
    /// Attributes outside the supported schema (e.g. `emailAddress`) and
    /// values that are not strings are skipped.
    #[must_use]
    pub fn from_x509_name(name: &X509Name<'_>) -> Self {
        let mut dn = Self::default();
        for attr in name.iter_attributes() {
            let Some(kind) = Attribute::from_oid(&attr.attr_type().to_id_string()) else {
                continue;
            };
            if let Ok(value) = attr.as_str() {
                dn.set(kind, value.to_owned());
            }
        }
        dn
    }

    /// Wildcard-field equality: `true` when every field set on `self`
    /// equals the same field on `subject`.
    ///
    /// Multi-valued fields compare as multisets, so `OU=a,OU=b` matches a
    /// subject whose OUs are encoded in the opposite order.
    #[must_use]
    pub fn matches(&self, subject: &Self) -> bool {
        single_matches(self.common_name.as_ref(), subject.common_name.as_ref())
            && single_matches(self.serial_number.as_ref(), subject.serial_number.as_ref())
            && multi_matches(&self.country, &subject.country)
            && multi_matches(&self.organization, &subject.organization)
            && multi_matches(&self.organizational_unit, &subject.organizational_unit)
            && multi_matches(&self.locality, &subject.locality)
            && multi_matches(&self.province, &subject.province)
            && multi_matches(&self.street_address, &subject.street_address)
            && multi_matches(&self.postal_code, &subject.postal_code)
    }

    /// `true` when no field is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn set(&mut self, attr: Attribute, value: String) {
        match attr {
            Attribute::CommonName => self.common_name = Some(value),
            Attribute::SerialNumber => self.serial_number = Some(value),
            Attribute::Country => self.country.push(value),
            Attribute::Organization => self.organization.push(value),
            Attribute::OrganizationalUnit => self.organizational_unit.push(value),
            Attribute::Locality => self.locality.push(value),
            Attribute::Province => self.province.push(value),
            Attribute::StreetAddress => self.street_address.push(value),
            Attribute::PostalCode => self.postal_code.push(value),
        }
    }
}

impl std::str::FromStr for DistinguishedName {
    type Err = DnParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for DistinguishedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let singles = [
            ("CN", self.common_name.as_slice()),
            ("SERIALNUMBER", self.serial_number.as_slice()),
        ];
        let multis = [
            ("OU", self.organizational_unit.as_slice()),
            ("O", self.organization.as_slice()),
            ("STREET", self.street_address.as_slice()),
            ("L", self.locality.as_slice()),
            ("ST", self.province.as_slice()),
            ("POSTALCODE", self.postal_code.as_slice()),
            ("C", self.country.as_slice()),
        ];

        let mut first = true;
        for (key, values) in singles.into_iter().chain(multis) {
            for value in values {
                if !first {
                    f.write_str(",")?;
                }
                first = false;
                write!(f, "{key}={}", escape_value(value))?;
            }
        }
        if first {
            f.write_str("<empty>")?;
        }
        Ok(())
    }
}

fn single_matches(pattern: Option<&String>, subject: Option<&String>) -> bool {
    pattern.is_none_or(|p| subject == Some(p))
}

fn multi_matches(pattern: &[String], subject: &[String]) -> bool {
    if pattern.is_empty() {
        return true;
    }
    if pattern.len() != subject.len() {
        return false;
    }
    let mut expected: Vec<&String> = pattern.iter().collect();
    let mut actual: Vec<&String> = subject.iter().collect();
    expected.sort_unstable();
    actual.sort_unstable();
    expected == actual
}

fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let last = value.chars().count().saturating_sub(1);
    for (i, c) in value.chars().enumerate() {
        let edge_space = c == ' ' && (i == 0 || i == last);
        if edge_space || matches!(c, ',' | '+' | '=' | '\\' | '"' | ';' | '<' | '>') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// Tokenizer
// ─────────────────────────────────────────────────────────────────────────────

/// One `KEY=value` pair while it is being read. Raw bytes so `\XX` hex
/// escapes can spell multi-byte UTF-8.
///
/// `value_start..value_end` spans the value from its first to its last
/// significant byte. Quoted and escaped bytes are always significant, so
/// only bare surrounding whitespace is trimmed.
#[derive(Default)]
struct Pending {
    key: Vec<u8>,
    value: Vec<u8>,
    in_value: bool,
    value_start: Option<usize>,
    value_end: usize,
}

impl Pending {
    fn push(&mut self, c: char, protected: bool) {
        let mut buf = [0u8; 4];
        let encoded = c.encode_utf8(&mut buf).as_bytes();
        self.extend(encoded, protected || !c.is_whitespace());
    }

    fn push_byte(&mut self, b: u8) {
        self.extend(&[b], true);
    }

    fn extend(&mut self, bytes: &[u8], significant: bool) {
        if !self.in_value {
            self.key.extend_from_slice(bytes);
            return;
        }
        if significant && self.value_start.is_none() {
            self.value_start = Some(self.value.len());
        }
        self.value.extend_from_slice(bytes);
        if significant {
            self.value_end = self.value.len();
        }
    }

    fn finish(self) -> Result<(String, String), DnParseError> {
        let key = String::from_utf8(self.key).map_err(|_| DnParseError::InvalidEscape)?;
        let key = key.trim().to_owned();

        if !self.in_value {
            return Err(if key.is_empty() {
                DnParseError::EmptyComponent
            } else {
                DnParseError::MissingEquals(key)
            });
        }
        if key.is_empty() {
            return Err(DnParseError::EmptyComponent);
        }

        let significant: &[u8] = match self.value_start {
            Some(start) => &self.value[start..self.value_end],
            None => &[],
        };
        let value =
            String::from_utf8(significant.to_vec()).map_err(|_| DnParseError::InvalidEscape)?;
        if value.is_empty() {
            return Err(DnParseError::EmptyValue(key));
        }
        Ok((key, value))
    }
}

/// Split on unescaped, unquoted `,` `+` or `;`, then on the first `=`.
fn split_components(input: &str) -> Result<Vec<(String, String)>, DnParseError> {
    let mut components = Vec::new();
    let mut pending = Pending::default();
    let mut quoted = false;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                let escaped = chars.next().ok_or(DnParseError::InvalidEscape)?;
                if let Some(high) = escaped.to_digit(16) {
                    let low = chars
                        .next()
                        .and_then(|l| l.to_digit(16))
                        .ok_or(DnParseError::InvalidEscape)?;
                    let byte = u8::try_from(high * 16 + low)
                        .map_err(|_| DnParseError::InvalidEscape)?;
                    pending.push_byte(byte);
                } else {
                    pending.push(escaped, true);
                }
            }
            '"' if pending.in_value => quoted = !quoted,
            ',' | '+' | ';' if !quoted => {
                components.push(std::mem::take(&mut pending).finish()?);
            }
            '=' if !pending.in_value => pending.in_value = true,
            _ => pending.push(c, quoted),
        }
    }

    if quoted {
        return Err(DnParseError::UnterminatedQuote);
    }
    components.push(pending.finish()?);
    Ok(components)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
