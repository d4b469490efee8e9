//! Query filters evaluated against [`Message`] payloads.
//!
//! Filters travel upstream with subscriptions and narrow discovery replies.
//! [`QueryFilter::or_all`] builds the consolidated filter the gateway
//! multiplexer sends for a path shared by several subscribers.

use serde::{Deserialize, Serialize};

use crate::message::{Field, Message};
use crate::path::WildcardPattern;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueryFilter {
    /// The named field is present.
    Exists(String),
    /// The named field is present and equal to the value.
    Equals(String, Field),
    /// The named string field matches a wildcard pattern.
    Matches(String, String),
    And(Vec<QueryFilter>),
    Or(Vec<QueryFilter>),
    Not(Box<QueryFilter>),
}

impl QueryFilter {
    #[must_use]
    pub fn matches(&self, msg: &Message) -> bool {
        match self {
            Self::Exists(name) => msg.has_field(name),
            Self::Equals(name, value) => msg.get(name) == Some(value),
            Self::Matches(name, pattern) => msg
                .get_str(name)
                .is_some_and(|s| WildcardPattern::new(pattern).matches(s)),
            Self::And(parts) => parts.iter().all(|f| f.matches(msg)),
            Self::Or(parts) => parts.iter().any(|f| f.matches(msg)),
            Self::Not(inner) => !inner.matches(msg),
        }
    }

    /// Conjunction of two optional filters; `None` means "accept everything".
    #[must_use]
    pub fn and_opt(a: Option<Self>, b: Option<Self>) -> Option<Self> {
        match (a, b) {
            (None, None) => None,
            (Some(f), None) | (None, Some(f)) => Some(f),
            (Some(a), Some(b)) => Some(Self::And(vec![a, b])),
        }
    }

    /// OR-composition of optional filters.
    ///
    /// Any `None` absorbs the rest (anything OR everything = everything), so the
    /// result is `None`. Structurally identical filters are kept once; a single
    /// survivor is returned bare rather than wrapped in `Or`. An empty input
    /// also yields `None`.
    #[must_use]
    pub fn or_all<'a>(filters: impl IntoIterator<Item = Option<&'a Self>>) -> Option<Self> {
        let mut distinct: Vec<&Self> = Vec::new();
        for filter in filters {
            let filter = filter?;
            if !distinct.contains(&filter) {
                distinct.push(filter);
            }
        }
        match distinct.len() {
            0 => None,
            1 => Some(distinct[0].clone()),
            _ => Some(Self::Or(distinct.into_iter().cloned().collect())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eq(name: &str, v: &str) -> QueryFilter {
        QueryFilter::Equals(name.into(), Field::from(v))
    }

    #[test]
    fn evaluates_combinators() {
        let msg = Message::new(0).with("a", "x").with("b", 3i64);
        assert!(QueryFilter::Exists("a".into()).matches(&msg));
        assert!(eq("a", "x").matches(&msg));
        assert!(!eq("a", "y").matches(&msg));
        assert!(QueryFilter::Matches("a".into(), "?".into()).matches(&msg));
        assert!(QueryFilter::Or(vec![eq("a", "y"), eq("a", "x")]).matches(&msg));
        assert!(!QueryFilter::And(vec![eq("a", "y"), eq("a", "x")]).matches(&msg));
        assert!(QueryFilter::Not(Box::new(eq("a", "y"))).matches(&msg));
    }

    #[test]
    fn or_all_absent_filter_absorbs() {
        let f = eq("a", "x");
        assert_eq!(QueryFilter::or_all([Some(&f), None]), None);
    }

    #[test]
    fn or_all_composes_and_dedups() {
        let f1 = eq("a", "x");
        let f2 = eq("a", "y");
        assert_eq!(QueryFilter::or_all([Some(&f1)]), Some(f1.clone()));
        assert_eq!(
            QueryFilter::or_all([Some(&f1), Some(&f1.clone())]),
            Some(f1.clone())
        );
        assert_eq!(
            QueryFilter::or_all([Some(&f1), Some(&f2)]),
            Some(QueryFilter::Or(vec![f1, f2]))
        );
    }

    #[test]
    fn and_opt_keeps_present_side() {
        let f = eq("a", "x");
        assert_eq!(QueryFilter::and_opt(None, Some(f.clone())), Some(f.clone()));
        assert_eq!(QueryFilter::and_opt(None, None), None);
        assert!(matches!(
            QueryFilter::and_opt(Some(f.clone()), Some(f)),
            Some(QueryFilter::And(_))
        ));
    }
}
