use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use nanoid::nanoid;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::MigrateError;

/// Canonical alphabet for generated document identifiers (no ambiguous glyphs).
const DOCUMENT_ID_ALPHABET: &[char] = &[
    'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'J', 'K', 'L', 'M', 'N', 'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y',
    'Z', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'j', 'm', 'n', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
];
/// Default document id length.
const DOCUMENT_ID_LENGTH: usize = 20;

/// Generates a new document identifier using the configured alphabet and length.
pub fn generate_document_id() -> String {
    nanoid!(DOCUMENT_ID_LENGTH, DOCUMENT_ID_ALPHABET)
}

/// Generates a unique lock-holder token for the given owner label.
pub fn generate_holder(owner: &str) -> String {
    format!("{owner}:{}", nanoid!(10, DOCUMENT_ID_ALPHABET))
}

/// Identifier of a migration unit: `<digits>-<slug>`.
///
/// The digit prefix is a UTC timestamp (`%Y%m%d%H%M%S`), so the natural
/// lexicographic order of ids is also their chronological order. Ids are
/// immutable once authored and totally ordered.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitId(String);

impl UnitId {
    /// Parse and validate an id string.
    pub fn parse(input: &str) -> Result<Self, MigrateError> {
        let invalid = |reason| MigrateError::InvalidId {
            input: input.to_string(),
            reason,
        };

        let (stamp, slug) = input
            .split_once('-')
            .ok_or_else(|| invalid("expected '<digits>-<slug>'"))?;

        if stamp.is_empty() || !stamp.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("ordering prefix must be decimal digits"));
        }
        if slug.is_empty() {
            return Err(invalid("slug must not be empty"));
        }
        if !slug
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
        {
            return Err(invalid("slug may only contain [a-z0-9_-]"));
        }

        Ok(Self(input.to_string()))
    }

    /// Mint a new id for `slug` stamped with the current UTC time.
    pub fn mint(slug: &str) -> Result<Self, MigrateError> {
        let stamp = Utc::now().format("%Y%m%d%H%M%S");
        Self::parse(&format!("{stamp}-{slug}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for UnitId {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for UnitId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for UnitId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        UnitId::parse(&raw).map_err(serde::de::Error::custom)
    }
}
