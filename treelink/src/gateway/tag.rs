//! Correlation tags that carry a subscriber's identity through an
//! identity-blind upstream.
//!
//! ```text
//!   "_7_:req1"      TaggedRequest { id: 7, tag: "req1" }
//!   "_allow_:1,4"   AllowPing::Restrict({1, 4})
//!   "_allow_:"      AllowPing::Clear
//! ```

use std::collections::BTreeSet;
use std::fmt;

use super::types::RegistrationId;

pub const ALLOW_PREFIX: &str = "_allow_:";

/// A caller's tag prefixed with the registration that issued it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaggedRequest {
    pub id: RegistrationId,
    pub tag: String,
}

impl TaggedRequest {
    #[must_use]
    pub fn new(id: RegistrationId, tag: &str) -> Self {
        Self {
            id,
            tag: tag.to_owned(),
        }
    }

    #[must_use]
    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// `None` if `wire` carries no registration prefix.
    #[must_use]
    pub fn parse(wire: &str) -> Option<Self> {
        let rest = wire.strip_prefix('_')?;
        let (digits, tag) = rest.split_once("_:")?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let id = digits.parse().ok()?;
        Some(Self {
            id: RegistrationId(id),
            tag: tag.to_owned(),
        })
    }
}

impl fmt::Display for TaggedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "_{}_:{}", self.id.0, self.tag)
    }
}

/// Reserved pings bracketing a reply batch meant for a subset of subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowPing {
    Restrict(BTreeSet<RegistrationId>),
    Clear,
}

impl AllowPing {
    #[must_use]
    pub fn only(id: RegistrationId) -> Self {
        Self::Restrict(BTreeSet::from([id]))
    }

    #[must_use]
    pub fn encode(&self) -> String {
        let mut out = String::from(ALLOW_PREFIX);
        if let Self::Restrict(ids) = self {
            let list: Vec<String> = ids.iter().map(|id| id.0.to_string()).collect();
            out.push_str(&list.join(","));
        }
        out
    }

    /// `None` if `wire` is not an allow ping. Malformed id lists are also
    /// `None`.
    #[must_use]
    pub fn parse(wire: &str) -> Option<Self> {
        let list = wire.strip_prefix(ALLOW_PREFIX)?;
        if list.is_empty() {
            return Some(Self::Clear);
        }
        list.split(',')
            .map(|s| s.parse().ok().map(RegistrationId))
            .collect::<Option<BTreeSet<_>>>()
            .map(Self::Restrict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_prefix() {
        let req = TaggedRequest::new(RegistrationId(7), "req1");
        assert_eq!(req.encode(), "_7_:req1");
        assert_eq!(TaggedRequest::parse("_7_:req1"), Some(req));
        // The caller's tag may itself look tagged.
        assert_eq!(
            TaggedRequest::parse("_3_:_9_:x").map(|r| (r.id, r.tag)),
            Some((RegistrationId(3), "_9_:x".to_owned()))
        );
        assert_eq!(TaggedRequest::parse("_3_:").map(|r| r.tag), Some(String::new()));
    }

    #[test]
    fn untagged_strings_are_rejected() {
        for wire in ["req1", "__:x", "_a_:x", "_7:x", "7_:x", "_allow_:1"] {
            assert_eq!(TaggedRequest::parse(wire), None, "{wire}");
        }
    }

    #[test]
    fn allow_ping_encoding() {
        let ping = AllowPing::Restrict(BTreeSet::from([RegistrationId(4), RegistrationId(1)]));
        assert_eq!(ping.encode(), "_allow_:1,4");
        assert_eq!(AllowPing::parse("_allow_:1,4"), Some(ping));
        assert_eq!(AllowPing::Clear.encode(), "_allow_:");
        assert_eq!(AllowPing::parse("_allow_:"), Some(AllowPing::Clear));
        assert_eq!(AllowPing::parse("_allow_:1,x"), None);
        assert_eq!(AllowPing::parse("_1_:x"), None);
    }
}
