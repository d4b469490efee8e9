//! Per-path consolidation of local subscriptions into one upstream one.

use crate::filter::QueryFilter;

use super::types::{GatewayFlags, RegistrationId};

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateEntry {
    pub id: RegistrationId,
    pub filter: Option<QueryFilter>,
    pub flags: GatewayFlags,
}

/// Every local subscription to one exact path string, in subscription order.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionAggregate {
    entries: Vec<AggregateEntry>,
}

impl SubscriptionAggregate {
    /// Adds or replaces `entry.id`'s subscription. Returns the entry it
    /// replaced.
    pub fn upsert(&mut self, entry: AggregateEntry) -> Option<AggregateEntry> {
        match self.entries.iter_mut().find(|e| e.id == entry.id) {
            Some(slot) => Some(std::mem::replace(slot, entry)),
            None => {
                self.entries.push(entry);
                None
            }
        }
    }

    pub fn remove(&mut self, id: RegistrationId) -> Option<AggregateEntry> {
        let pos = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(pos))
    }

    #[must_use]
    pub fn get(&self, id: RegistrationId) -> Option<&AggregateEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> impl Iterator<Item = &AggregateEntry> {
        self.entries.iter()
    }

    /// `None` if any entry is unfiltered, otherwise the OR of the distinct
    /// entry filters.
    #[must_use]
    pub fn upstream_filter(&self) -> Option<QueryFilter> {
        QueryFilter::or_all(self.entries.iter().map(|e| e.filter.as_ref()))
    }

    /// `INDEXED` if any entry wants it; `NO_REPLY` only if every entry does.
    #[must_use]
    pub fn upstream_flags(&self) -> GatewayFlags {
        let mut flags = GatewayFlags::NONE;
        if self.entries.iter().any(|e| e.flags.contains(GatewayFlags::INDEXED)) {
            flags |= GatewayFlags::INDEXED;
        }
        if self.all_no_reply() {
            flags |= GatewayFlags::NO_REPLY;
        }
        flags
    }

    /// True when no member wants the current state re-sent.
    #[must_use]
    pub fn all_no_reply(&self) -> bool {
        !self.entries.is_empty()
            && self
                .entries
                .iter()
                .all(|e| e.flags.contains(GatewayFlags::NO_REPLY))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Field;

    fn entry(id: u32, filter: Option<QueryFilter>, flags: GatewayFlags) -> AggregateEntry {
        AggregateEntry {
            id: RegistrationId(id),
            filter,
            flags,
        }
    }

    fn f(v: i64) -> QueryFilter {
        QueryFilter::Equals("v".into(), Field::Int(v))
    }

    #[test]
    fn unfiltered_entry_absorbs() {
        let mut agg = SubscriptionAggregate::default();
        agg.upsert(entry(1, Some(f(1)), GatewayFlags::NONE));
        assert_eq!(agg.upstream_filter(), Some(f(1)));
        agg.upsert(entry(2, None, GatewayFlags::NONE));
        assert_eq!(agg.upstream_filter(), None);
        agg.remove(RegistrationId(2));
        assert_eq!(agg.upstream_filter(), Some(f(1)));
    }

    #[test]
    fn filters_are_ored_and_deduplicated() {
        let mut agg = SubscriptionAggregate::default();
        agg.upsert(entry(1, Some(f(1)), GatewayFlags::NONE));
        agg.upsert(entry(2, Some(f(2)), GatewayFlags::NONE));
        agg.upsert(entry(3, Some(f(1)), GatewayFlags::NONE));
        assert_eq!(agg.upstream_filter(), Some(QueryFilter::Or(vec![f(1), f(2)])));
    }

    #[test]
    fn upsert_replaces_in_place() {
        let mut agg = SubscriptionAggregate::default();
        assert_eq!(agg.upsert(entry(1, None, GatewayFlags::NONE)), None);
        let old = agg.upsert(entry(1, Some(f(3)), GatewayFlags::NO_REPLY));
        assert_eq!(old, Some(entry(1, None, GatewayFlags::NONE)));
        assert_eq!(agg.len(), 1);
    }

    #[test]
    fn flag_consolidation() {
        let mut agg = SubscriptionAggregate::default();
        agg.upsert(entry(1, None, GatewayFlags::NO_REPLY));
        assert!(agg.all_no_reply());
        agg.upsert(entry(2, None, GatewayFlags::INDEXED));
        assert!(!agg.all_no_reply());
        assert_eq!(agg.upstream_flags(), GatewayFlags::INDEXED);
    }
}
