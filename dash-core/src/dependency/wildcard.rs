//! Pattern-matching wildcards for dict-form component ids.

use std::fmt;

use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};

/// Placeholder value inside a dict-form component id.
///
/// On the wire a wildcard is a one-element array holding its name, so
/// `MATCH` travels as `["MATCH"]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Wildcard {
    /// Every component whose other keys match.
    All,
    /// The component whose value for this key equals the triggering one.
    Match,
    /// Every component whose value for this key is smaller than the
    /// triggering one. Only valid in inputs and state.
    AllSmaller,
}

pub const ALL: Wildcard = Wildcard::All;
pub const MATCH: Wildcard = Wildcard::Match;
pub const ALLSMALLER: Wildcard = Wildcard::AllSmaller;

impl Wildcard {
    pub const fn name(self) -> &'static str {
        match self {
            Self::All => "ALL",
            Self::Match => "MATCH",
            Self::AllSmaller => "ALLSMALLER",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ALL" => Some(Self::All),
            "MATCH" => Some(Self::Match),
            "ALLSMALLER" => Some(Self::AllSmaller),
            _ => None,
        }
    }

    /// Compact JSON form, as embedded in stringified ids.
    pub fn to_json(self) -> String {
        format!("[\"{}\"]", self.name())
    }
}

impl fmt::Display for Wildcard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for Wildcard {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(1))?;
        seq.serialize_element(self.name())?;
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Wildcard {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct WildcardVisitor;

        impl<'de> Visitor<'de> for WildcardVisitor {
            type Value = Wildcard;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a one-element array naming a wildcard")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Wildcard, A::Error> {
                let name: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                if seq.next_element::<de::IgnoredAny>()?.is_some() {
                    return Err(de::Error::invalid_length(2, &self));
                }
                Wildcard::from_name(&name)
                    .ok_or_else(|| de::Error::unknown_variant(&name, &["ALL", "MATCH", "ALLSMALLER"]))
            }
        }

        deserializer.deserialize_seq(WildcardVisitor)
    }
}
