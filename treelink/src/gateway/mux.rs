//! Fan-in/fan-out of one upstream gateway across many local subscribers.
//!
//! ```text
//!   subscriber A ── GatewayProxy(0) ─┐
//!   subscriber B ── GatewayProxy(1) ─┼──▶ TreeGatewayMux ──▶ upstream TreeGateway
//!   subscriber C ── GatewayProxy(2) ─┘          ▲                    │
//!                                               └── GatewayEvent ◀───┘
//! ```
//!
//! Upstream sees one subscription per distinct path string and correlation
//! tags prefixed with the issuing registration. Replies are routed back by
//! path (node and index events) or by tag (pongs, subtree results, peer
//! messages).
//!
//! All of this lives on the owner thread. No `RefCell` borrow is held while a
//! subscriber or the upstream gateway is called, so both may call back in.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::{Rc, Weak};

use crate::filter::QueryFilter;
use crate::message::Message;
use crate::path::PathMatcher;
use crate::trace::{debug, trace, warn};

use super::aggregate::{AggregateEntry, SubscriptionAggregate};
use super::proxy::GatewayProxy;
use super::tag::{AllowPing, TaggedRequest};
use super::types::{
    GatewayError, GatewayEvent, GatewayFlags, RegistrationId, TreeGateway, TreeGatewaySubscriber,
    TreeNode, check_path,
};

struct Registration {
    subscriber: Weak<dyn TreeGatewaySubscriber>,
    /// Union of this subscriber's own subscriptions.
    matcher: PathMatcher,
    /// Paths delivered with a payload and not yet reported removed.
    held: BTreeSet<String>,
}

#[derive(Default)]
struct MuxState {
    registrations: BTreeMap<RegistrationId, Registration>,
    aggregates: BTreeMap<String, SubscriptionAggregate>,
    /// Outstanding subtree requests; a tag reused before its reply arrives
    /// counts twice.
    pending: BTreeMap<TaggedRequest, usize>,
    /// Set between a pair of allow pings: only these subscribers receive
    /// path-routed events, and their matchers are not consulted.
    allowed: Option<BTreeSet<RegistrationId>>,
    connected: bool,
    shut_down: bool,
}

impl MuxState {
    fn registration(&mut self, id: RegistrationId) -> Result<&mut Registration, GatewayError> {
        if self.shut_down {
            return Err(GatewayError::ShutDown);
        }
        self.registrations
            .get_mut(&id)
            .ok_or(GatewayError::UnknownRegistration(id))
    }

    fn add_pending(&mut self, request: TaggedRequest) {
        *self.pending.entry(request).or_insert(0) += 1;
    }

    /// Consumes one outstanding instance of `request`.
    fn take_pending(&mut self, request: &TaggedRequest) -> bool {
        let Some(count) = self.pending.get_mut(request) else {
            return false;
        };
        *count -= 1;
        if *count == 0 {
            self.pending.remove(request);
        }
        true
    }

    fn lowest_free_id(&self) -> RegistrationId {
        let mut next = 0;
        for id in self.registrations.keys() {
            if id.0 != next {
                break;
            }
            next += 1;
        }
        RegistrationId(next)
    }
}

type Target = (RegistrationId, Rc<dyn TreeGatewaySubscriber>);

/// Subscribers that received at least one callback in the current pass.
#[derive(Default)]
struct CallbackBatch {
    open: Vec<Target>,
}

impl CallbackBatch {
    fn deliver(&mut self, (id, sub): &Target, f: impl FnOnce(&dyn TreeGatewaySubscriber)) {
        if !self.open.iter().any(|(open, _)| open == id) {
            sub.begin_callback_batch();
            self.open.push((*id, Rc::clone(sub)));
        }
        f(&**sub);
    }

    fn finish(self) {
        for (_, sub) in self.open {
            sub.end_callback_batch();
        }
    }
}

/// Who a path-routed event is for.
#[derive(Clone, Copy)]
enum Audience {
    /// Upstream traffic: honours an active allow set.
    Upstream,
    /// A local echo of `origin`'s own write: everyone else, by matcher.
    EchoOf(RegistrationId),
}

enum UpstreamChange {
    Unsubscribe,
    Resubscribe(Option<QueryFilter>, GatewayFlags),
}

pub struct TreeGatewayMux {
    upstream: Rc<dyn TreeGateway>,
    state: RefCell<MuxState>,
}

impl TreeGatewayMux {
    #[must_use]
    pub fn new(upstream: Rc<dyn TreeGateway>) -> Rc<Self> {
        let connected = upstream.is_connected();
        Rc::new(Self {
            upstream,
            state: RefCell::new(MuxState {
                connected,
                ..MuxState::default()
            }),
        })
    }

    /// Attaches a subscriber and returns its private channel. Dropping the
    /// proxy detaches it.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ShutDown`] after [`shutdown`](Self::shutdown).
    pub fn register(
        self: &Rc<Self>,
        subscriber: Weak<dyn TreeGatewaySubscriber>,
    ) -> Result<GatewayProxy, GatewayError> {
        let mut st = self.state.borrow_mut();
        if st.shut_down {
            return Err(GatewayError::ShutDown);
        }
        let id = st.lowest_free_id();
        st.registrations.insert(
            id,
            Registration {
                subscriber,
                matcher: PathMatcher::new(),
                held: BTreeSet::new(),
            },
        );
        debug!(%id, "subscriber registered");
        Ok(GatewayProxy::new(Rc::downgrade(self), id))
    }

    /// Detaches `id`, withdrawing its subscriptions and abandoning its
    /// pending requests.
    pub(super) fn unregister(&self, id: RegistrationId) {
        let (changes, connected) = {
            let mut guard = self.state.borrow_mut();
            let st = &mut *guard;
            if st.registrations.remove(&id).is_none() {
                return;
            }
            st.pending.retain(|req, _| req.id != id);
            if let Some(allowed) = st.allowed.as_mut() {
                allowed.remove(&id);
            }
            let mut changes = Vec::new();
            st.aggregates.retain(|path, agg| {
                if agg.remove(id).is_none() {
                    return true;
                }
                if agg.is_empty() {
                    changes.push((path.clone(), UpstreamChange::Unsubscribe));
                    false
                } else {
                    changes.push((
                        path.clone(),
                        UpstreamChange::Resubscribe(agg.upstream_filter(), agg.upstream_flags()),
                    ));
                    true
                }
            });
            (changes, st.connected)
        };
        debug!(%id, "subscriber unregistered");
        if !connected {
            return;
        }
        for (path, change) in changes {
            if let Err(_e) = self.apply_upstream(&path, change) {
                warn!(%path, error = %_e, "upstream update after unregister failed");
            }
        }
    }

    fn apply_upstream(&self, path: &str, change: UpstreamChange) -> Result<(), GatewayError> {
        match change {
            UpstreamChange::Unsubscribe => self.upstream.remove_subscription(path),
            UpstreamChange::Resubscribe(filter, flags) => {
                self.upstream
                    .add_subscription(path, filter.as_ref(), flags | GatewayFlags::QUIET)
            }
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.borrow().connected
    }

    #[must_use]
    pub fn registration_count(&self) -> usize {
        self.state.borrow().registrations.len()
    }

    /// Distinct paths currently subscribed upstream (or to be, on connect).
    #[must_use]
    pub fn subscribed_paths(&self) -> Vec<String> {
        self.state.borrow().aggregates.keys().cloned().collect()
    }

    /// Paths delivered to `id` whose removal it would still be told about.
    #[must_use]
    pub fn held_paths(&self, id: RegistrationId) -> Vec<String> {
        self.state
            .borrow()
            .registrations
            .get(&id)
            .map(|reg| reg.held.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Filter and flags the aggregate for `path` currently asks upstream for.
    #[must_use]
    pub fn upstream_subscription(&self, path: &str) -> Option<(Option<QueryFilter>, GatewayFlags)> {
        self.state
            .borrow()
            .aggregates
            .get(path)
            .map(|agg| (agg.upstream_filter(), agg.upstream_flags()))
    }

    #[must_use]
    pub fn pending_request_count(&self) -> usize {
        self.state.borrow().pending.values().sum()
    }

    /// Runs `op` between allow pings so the replies it triggers reach only
    /// `id`. The closing ping is sent even if `op` fails.
    fn for_requester_only(
        &self,
        id: RegistrationId,
        op: impl FnOnce() -> Result<(), GatewayError>,
    ) -> Result<(), GatewayError> {
        self.upstream.ping_local_peer(&AllowPing::only(id).encode())?;
        let result = op();
        let reopened = self.upstream.ping_local_peer(&AllowPing::Clear.encode());
        result.and(reopened)
    }

    pub(super) fn add_subscription(
        &self,
        id: RegistrationId,
        path: &str,
        filter: Option<&QueryFilter>,
        flags: GatewayFlags,
    ) -> Result<(), GatewayError> {
        check_path(path)?;
        let (upstream_filter, upstream_flags, connected, previous) = {
            let mut guard = self.state.borrow_mut();
            let st = &mut *guard;
            st.registration(id)?.matcher.add(path, filter.cloned());
            let agg = st.aggregates.entry(path.to_owned()).or_default();
            let previous = agg.upsert(AggregateEntry {
                id,
                filter: filter.cloned(),
                flags,
            });
            (agg.upstream_filter(), agg.upstream_flags(), st.connected, previous)
        };
        trace!(%id, %path, "subscribe");
        if !connected {
            return Ok(());
        }

        let result = if flags.contains(GatewayFlags::QUIET) {
            self.upstream
                .add_subscription(path, upstream_filter.as_ref(), upstream_flags | GatewayFlags::QUIET)
        } else {
            self.for_requester_only(id, || {
                self.upstream
                    .add_subscription(path, upstream_filter.as_ref(), upstream_flags)
            })
        };
        if result.is_err() {
            self.rollback_add(id, path, previous);
        }
        result
    }

    fn rollback_add(&self, id: RegistrationId, path: &str, previous: Option<AggregateEntry>) {
        let mut guard = self.state.borrow_mut();
        let st = &mut *guard;
        let Some(reg) = st.registrations.get_mut(&id) else {
            return;
        };
        match previous {
            Some(prev) => {
                reg.matcher.add(path, prev.filter.clone());
                if let Some(agg) = st.aggregates.get_mut(path) {
                    agg.upsert(prev);
                }
            }
            None => {
                reg.matcher.remove(path);
                if let Some(agg) = st.aggregates.get_mut(path) {
                    agg.remove(id);
                    if agg.is_empty() {
                        st.aggregates.remove(path);
                    }
                }
            }
        }
    }

    pub(super) fn remove_subscription(&self, id: RegistrationId, path: &str) -> Result<(), GatewayError> {
        let (change, removed, connected) = {
            let mut guard = self.state.borrow_mut();
            let st = &mut *guard;
            let reg = st.registration(id)?;
            if !reg.matcher.remove(path) {
                return Err(GatewayError::NotSubscribed(path.to_owned()));
            }
            let Some(agg) = st.aggregates.get_mut(path) else {
                return Err(GatewayError::NotSubscribed(path.to_owned()));
            };
            let removed = agg.remove(id);
            let change = if agg.is_empty() {
                st.aggregates.remove(path);
                UpstreamChange::Unsubscribe
            } else {
                UpstreamChange::Resubscribe(agg.upstream_filter(), agg.upstream_flags())
            };
            (change, removed, st.connected)
        };
        trace!(%id, %path, "unsubscribe");

        if connected && let Err(e) = self.apply_upstream(path, change) {
            let mut guard = self.state.borrow_mut();
            let st = &mut *guard;
            if let (Some(reg), Some(entry)) = (st.registrations.get_mut(&id), removed) {
                reg.matcher.add(path, entry.filter.clone());
                st.aggregates.entry(path.to_owned()).or_default().upsert(entry);
            }
            return Err(e);
        }

        // Nothing held outside the remaining subscriptions will be reported.
        if let Some(reg) = self.state.borrow_mut().registrations.get_mut(&id) {
            let Registration { matcher, held, .. } = reg;
            held.retain(|p| matcher.matches(p, None));
        }
        Ok(())
    }

    fn ensure_connected(&self, id: RegistrationId) -> Result<(), GatewayError> {
        let mut st = self.state.borrow_mut();
        st.registration(id)?;
        if st.connected {
            Ok(())
        } else {
            Err(GatewayError::NotConnected)
        }
    }

    fn ensure_registered(&self, id: RegistrationId) -> Result<(), GatewayError> {
        self.state.borrow_mut().registration(id).map(|_| ())
    }

    pub(super) fn request_node_values(
        &self,
        id: RegistrationId,
        paths: &[String],
        filter: Option<&QueryFilter>,
    ) -> Result<(), GatewayError> {
        paths.iter().try_for_each(|p| check_path(p))?;
        self.ensure_connected(id)?;
        self.for_requester_only(id, || self.upstream.request_node_values(paths, filter))
    }

    pub(super) fn request_subtrees(
        &self,
        id: RegistrationId,
        paths: &[String],
        filter: Option<&QueryFilter>,
        tag: &str,
        max_depth: Option<u32>,
    ) -> Result<(), GatewayError> {
        paths.iter().try_for_each(|p| check_path(p))?;
        self.ensure_connected(id)?;
        let request = TaggedRequest::new(id, tag);
        let wire = request.encode();
        self.state.borrow_mut().add_pending(request.clone());
        let result = self.upstream.request_subtrees(paths, filter, &wire, max_depth);
        if result.is_err() {
            self.state.borrow_mut().take_pending(&request);
        }
        result
    }

    pub(super) fn upload_node_value(
        &self,
        id: RegistrationId,
        path: &str,
        payload: &Message,
        flags: GatewayFlags,
    ) -> Result<(), GatewayError> {
        check_path(path)?;
        self.ensure_registered(id)?;
        self.upstream.upload_node_value(path, payload, flags)?;
        if flags.contains(GatewayFlags::NO_REPLY) {
            // No echo will come back; the other subscribers hear it from us.
            self.echo_locally(id, &[(path.to_owned(), payload)]);
        }
        Ok(())
    }

    pub(super) fn upload_subtree(
        &self,
        id: RegistrationId,
        base_path: &str,
        nodes: &[TreeNode],
        flags: GatewayFlags,
    ) -> Result<(), GatewayError> {
        check_path(base_path)?;
        self.ensure_registered(id)?;
        self.upstream.upload_subtree(base_path, nodes, flags)?;
        if flags.contains(GatewayFlags::NO_REPLY) {
            let base = base_path.trim_end_matches('/');
            let updates: Vec<(String, &Message)> = nodes
                .iter()
                .map(|n| (format!("{base}/{}", n.path.trim_start_matches('/')), &n.payload))
                .collect();
            self.echo_locally(id, &updates);
        }
        Ok(())
    }

    fn echo_locally(&self, origin: RegistrationId, updates: &[(String, &Message)]) {
        let mut batch = CallbackBatch::default();
        for (path, payload) in updates {
            let payload: &Message = payload;
            let targets = self.route_node(path, Some(payload), Audience::EchoOf(origin));
            for target in &targets {
                batch.deliver(target, |s| s.tree_node_updated(path, Some(payload)));
            }
        }
        batch.finish();
    }

    pub(super) fn delete_nodes(
        &self,
        id: RegistrationId,
        paths: &[String],
        filter: Option<&QueryFilter>,
        flags: GatewayFlags,
    ) -> Result<(), GatewayError> {
        paths.iter().try_for_each(|p| check_path(p))?;
        self.ensure_registered(id)?;
        self.upstream.delete_nodes(paths, filter, flags)
    }

    pub(super) fn move_index_entry(
        &self,
        id: RegistrationId,
        path: &str,
        from: u32,
        to: u32,
        flags: GatewayFlags,
    ) -> Result<(), GatewayError> {
        check_path(path)?;
        self.ensure_registered(id)?;
        self.upstream.move_index_entry(path, from, to, flags)
    }

    pub(super) fn ping_local_peer(&self, id: RegistrationId, tag: &str) -> Result<(), GatewayError> {
        self.ensure_registered(id)?;
        self.upstream.ping_local_peer(&TaggedRequest::new(id, tag).encode())
    }

    pub(super) fn ping_senior_peer(&self, id: RegistrationId, tag: &str) -> Result<(), GatewayError> {
        self.ensure_registered(id)?;
        self.upstream.ping_senior_peer(&TaggedRequest::new(id, tag).encode())
    }

    pub(super) fn message_to_senior_peer(
        &self,
        id: RegistrationId,
        message: &Message,
        reply_tag: &str,
    ) -> Result<(), GatewayError> {
        self.ensure_registered(id)?;
        self.upstream
            .message_to_senior_peer(message, &TaggedRequest::new(id, reply_tag).encode())
    }

    pub(super) fn message_to_subscriber(
        &self,
        id: RegistrationId,
        message: &Message,
        subscriber_tag: &str,
    ) -> Result<(), GatewayError> {
        self.ensure_registered(id)?;
        self.upstream.message_to_subscriber(message, subscriber_tag)
    }

    /// Notifies every subscriber, forgets them, then shuts the upstream
    /// gateway down. Later calls do nothing.
    pub fn shutdown(&self) {
        if let Some(subscribers) = self.close() {
            debug!(count = subscribers.len(), "gateway mux shutting down");
            for sub in subscribers {
                sub.tree_gateway_shutting_down();
            }
            self.upstream.shutdown();
        }
    }

    fn close(&self) -> Option<Vec<Rc<dyn TreeGatewaySubscriber>>> {
        let mut st = self.state.borrow_mut();
        if st.shut_down {
            return None;
        }
        st.shut_down = true;
        st.aggregates.clear();
        st.pending.clear();
        st.allowed = None;
        let registrations = std::mem::take(&mut st.registrations);
        Some(
            registrations
                .into_values()
                .filter_map(|reg| reg.subscriber.upgrade())
                .collect(),
        )
    }

    pub fn handle_upstream_event(&self, event: GatewayEvent) {
        self.handle_upstream_events(std::iter::once(event));
    }

    /// Delivers `events` as one callback batch: each subscriber touched gets
    /// one `begin_callback_batch` before its first callback and one
    /// `end_callback_batch` after the last event.
    pub fn handle_upstream_events(&self, events: impl IntoIterator<Item = GatewayEvent>) {
        let mut batch = CallbackBatch::default();
        for event in events {
            if self.state.borrow().shut_down {
                break;
            }
            self.dispatch(event, &mut batch);
        }
        batch.finish();
    }

    fn dispatch(&self, event: GatewayEvent, batch: &mut CallbackBatch) {
        match event {
            GatewayEvent::ConnectionStateChanged(connected) => {
                self.on_connection_changed(connected, batch);
            }
            GatewayEvent::NodeUpdated { path, payload } => {
                for target in &self.route_node(&path, payload.as_ref(), Audience::Upstream) {
                    batch.deliver(target, |s| s.tree_node_updated(&path, payload.as_ref()));
                }
            }
            GatewayEvent::IndexCleared { path } => {
                for target in &self.route_index(&path) {
                    batch.deliver(target, |s| s.tree_index_cleared(&path));
                }
            }
            GatewayEvent::IndexEntryInserted { path, index, child } => {
                for target in &self.route_index(&path) {
                    batch.deliver(target, |s| s.tree_index_entry_inserted(&path, index, &child));
                }
            }
            GatewayEvent::IndexEntryRemoved { path, index } => {
                for target in &self.route_index(&path) {
                    batch.deliver(target, |s| s.tree_index_entry_removed(&path, index));
                }
            }
            GatewayEvent::SubtreeResult { tag, nodes } => {
                let Some(request) = TaggedRequest::parse(&tag) else {
                    warn!(%tag, "subtree result without registration tag");
                    return;
                };
                if !self.state.borrow_mut().take_pending(&request) {
                    debug!(%tag, "subtree result for abandoned request");
                    return;
                }
                if let Some(target) = self.route_tagged(&request) {
                    batch.deliver(&target, |s| s.subtree_request_result(&request.tag, &nodes));
                }
            }
            GatewayEvent::Pong { tag } => {
                if let Some(allow) = AllowPing::parse(&tag) {
                    self.state.borrow_mut().allowed = match allow {
                        AllowPing::Restrict(ids) => Some(ids),
                        AllowPing::Clear => None,
                    };
                    return;
                }
                let Some(request) = TaggedRequest::parse(&tag) else {
                    warn!(%tag, "pong without registration tag");
                    return;
                };
                if let Some(target) = self.route_tagged(&request) {
                    batch.deliver(&target, |s| s.tree_pong(&request.tag));
                }
            }
            GatewayEvent::MessageForSubscriber { tag, message } => {
                let Some(request) = TaggedRequest::parse(&tag) else {
                    warn!(%tag, "peer message without registration tag");
                    return;
                };
                if let Some(target) = self.route_tagged(&request) {
                    batch.deliver(&target, |s| s.message_from_peer(&request.tag, &message));
                }
            }
            GatewayEvent::ShuttingDown => {
                if let Some(subscribers) = self.close() {
                    debug!("upstream gateway shutting down");
                    for sub in subscribers {
                        sub.tree_gateway_shutting_down();
                    }
                }
            }
        }
    }

    fn on_connection_changed(&self, connected: bool, batch: &mut CallbackBatch) {
        let replay: Vec<(String, Option<QueryFilter>, GatewayFlags)> = {
            let mut guard = self.state.borrow_mut();
            let st = &mut *guard;
            if st.connected == connected {
                return;
            }
            st.connected = connected;
            if connected {
                st.aggregates
                    .iter()
                    .map(|(path, agg)| {
                        let mut flags = agg.upstream_flags();
                        if agg.all_no_reply() {
                            flags |= GatewayFlags::QUIET;
                        }
                        (path.clone(), agg.upstream_filter(), flags)
                    })
                    .collect()
            } else {
                if !st.pending.is_empty() {
                    debug!(count = st.pending.values().sum::<usize>(), "abandoning pending subtree requests");
                }
                st.pending.clear();
                st.allowed = None;
                Vec::new()
            }
        };
        debug!(connected, paths = replay.len(), "upstream connection changed");

        for (path, filter, flags) in replay {
            if let Err(_e) = self.upstream.add_subscription(&path, filter.as_ref(), flags) {
                warn!(%path, error = %_e, "subscription replay failed");
            }
        }
        for target in &self.live_targets() {
            batch.deliver(target, |s| s.tree_gateway_connection_changed(connected));
        }
    }

    fn live_targets(&self) -> Vec<Target> {
        self.state
            .borrow()
            .registrations
            .iter()
            .filter_map(|(id, reg)| reg.subscriber.upgrade().map(|s| (*id, s)))
            .collect()
    }

    fn route_tagged(&self, request: &TaggedRequest) -> Option<Target> {
        let st = self.state.borrow();
        let Some(reg) = st.registrations.get(&request.id) else {
            debug!(id = %request.id, "reply for unknown registration dropped");
            return None;
        };
        reg.subscriber.upgrade().map(|s| (request.id, s))
    }

    fn route_node(&self, path: &str, payload: Option<&Message>, audience: Audience) -> Vec<Target> {
        let mut guard = self.state.borrow_mut();
        let st = &mut *guard;
        let mut targets = Vec::new();
        for (id, reg) in &mut st.registrations {
            let (selected, by_allow) = match (audience, st.allowed.as_ref()) {
                (Audience::EchoOf(origin), _) if origin == *id => (false, false),
                (Audience::Upstream, Some(allowed)) => (allowed.contains(id), true),
                _ => (reg.matcher.matches(path, payload), false),
            };
            if !selected {
                continue;
            }
            let deliver = match payload {
                Some(_) => {
                    // Removals are routed by the matcher, so only track paths
                    // it would route back here.
                    if !by_allow || reg.matcher.matches(path, None) {
                        reg.held.insert(path.to_owned());
                    }
                    true
                }
                // Never report removal of something never delivered.
                None => reg.held.remove(path),
            };
            if deliver && let Some(sub) = reg.subscriber.upgrade() {
                targets.push((*id, sub));
            }
        }
        targets
    }

    fn route_index(&self, path: &str) -> Vec<Target> {
        let st = self.state.borrow();
        st.registrations
            .iter()
            .filter(|(id, reg)| match st.allowed.as_ref() {
                Some(allowed) => allowed.contains(*id),
                None => reg.matcher.matches(path, None),
            })
            .filter_map(|(id, reg)| reg.subscriber.upgrade().map(|s| (*id, s)))
            .collect()
    }
}
