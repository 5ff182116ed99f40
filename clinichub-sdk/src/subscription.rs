//! Group membership tracking with replay after reconnect.
//!
//! The local membership set is the source of truth. Wire joins and leaves
//! are sent only while the channel is `Connected`; anything recorded while
//! disconnected is flushed by the replay the channel runs after every
//! successful handshake, before it reports `Connected`. Replayed joins go
//! out together and each one is bounded by the channel's handshake timeout,
//! so a group the hub never answers cannot hold up the others.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use futures::future::{self, BoxFuture};
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::json;

use crate::channel::{EventChannel, LifecycleObserver, ReadyLink};
use crate::error::{HubError, Result};
use crate::event::procedures;
use crate::message::ConversationId;

/// Kind of server-side broadcast scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GroupKind {
    /// One conversation's message stream.
    ConversationRoom,
    /// Tenant-wide broadcasts (payment notifications).
    TenantBroadcast,
}

/// A group the client wants to be in, keyed by `(kind, group_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupMembership {
    pub kind: GroupKind,
    pub group_id: String,
}

impl GroupMembership {
    pub fn new(kind: GroupKind, group_id: impl Into<String>) -> Self {
        Self {
            kind,
            group_id: group_id.into(),
        }
    }

    pub fn conversation(id: ConversationId) -> Self {
        Self::new(GroupKind::ConversationRoom, id.to_string())
    }

    pub fn tenant(tenant_id: impl Into<String>) -> Self {
        Self::new(GroupKind::TenantBroadcast, tenant_id)
    }

    /// Name of the group on the hub, e.g. `conversation:42` or `tenant:acme`.
    pub fn wire_name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for GroupMembership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.kind {
            GroupKind::ConversationRoom => "conversation",
            GroupKind::TenantBroadcast => "tenant",
        };
        write!(f, "{prefix}:{}", self.group_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinState {
    /// Not sent on the current connection yet.
    Pending,
    Joined,
    /// Sent on the current connection and rejected or unanswered.
    Failed,
}

struct Inner {
    channel: EventChannel,
    groups: Mutex<BTreeMap<GroupMembership, JoinState>>,
}

/// Tracks which groups the client asked to join on one channel.
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<Inner>,
}

impl SubscriptionManager {
    /// Create a manager and attach it to `channel` so it replays on every reconnect.
    pub fn new(channel: EventChannel) -> Self {
        let inner = Arc::new(Inner {
            channel: channel.clone(),
            groups: Mutex::new(BTreeMap::new()),
        });
        let observer: Weak<dyn LifecycleObserver> = Arc::downgrade(&inner) as Weak<dyn LifecycleObserver>;
        channel.observe(observer);
        Self { inner }
    }

    /// Record `group` and join it on the hub if connected; otherwise the join
    /// is deferred until the next successful connect.
    pub async fn join(&self, group: GroupMembership) -> Result<()> {
        {
            let mut groups = self.inner.groups.lock();
            let state = groups.entry(group.clone()).or_insert(JoinState::Pending);
            if *state == JoinState::Joined {
                return Ok(());
            }
            *state = JoinState::Pending;
        }
        if !self.inner.channel.is_connected() {
            tracing::debug!(%group, "join deferred until connected");
            return Ok(());
        }
        match self.send(None, procedures::JOIN_GROUP, &group).await {
            Ok(()) => {
                self.mark(&group, JoinState::Joined);
                Ok(())
            }
            // lost the race with a disconnect; replay will send it
            Err(HubError::NotConnected { .. }) => Ok(()),
            Err(e) => {
                self.mark(&group, JoinState::Failed);
                Err(e)
            }
        }
    }

    /// Forget `group` and leave it on the hub if connected.
    pub async fn leave(&self, group: &GroupMembership) -> Result<()> {
        if self.inner.groups.lock().remove(group).is_none() {
            return Ok(());
        }
        if !self.inner.channel.is_connected() {
            // the hub dropped our membership with the socket
            return Ok(());
        }
        match self.send(None, procedures::LEAVE_GROUP, group).await {
            Ok(()) | Err(HubError::NotConnected { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Send a join for every recorded group. Failures are logged and skipped.
    /// Returns how many joins succeeded.
    pub async fn replay_all(&self) -> usize {
        self.replay(None).await
    }

    async fn replay(&self, link: Option<&ReadyLink>) -> usize {
        let all: Vec<GroupMembership> = {
            let mut groups = self.inner.groups.lock();
            groups.values_mut().for_each(|state| *state = JoinState::Pending);
            groups.keys().cloned().collect()
        };
        if all.is_empty() {
            return 0;
        }
        let joined = self.send_joins(link, &all).await;
        tracing::info!(
            channel = %self.inner.channel.name(),
            joined,
            total = all.len(),
            "replayed group memberships"
        );
        joined
    }

    /// Join groups recorded while the replay was running.
    async fn flush_pending(&self) {
        let pending: Vec<GroupMembership> = self
            .inner
            .groups
            .lock()
            .iter()
            .filter(|(_, state)| **state == JoinState::Pending)
            .map(|(group, _)| group.clone())
            .collect();
        if !pending.is_empty() {
            self.send_joins(None, &pending).await;
        }
    }

    async fn send_joins(&self, link: Option<&ReadyLink>, groups: &[GroupMembership]) -> usize {
        let timeout = self.inner.channel.options().handshake_timeout;
        let sends = groups.iter().map(|group| async move {
            let send = self.send(link, procedures::JOIN_GROUP, group);
            let result = match tokio::time::timeout(timeout, send).await {
                Ok(result) => result,
                Err(_) => Err(HubError::Transport(format!("no answer to join within {timeout:?}"))),
            };
            (group, result)
        });
        let results = future::join_all(sends).await;

        let mut joined = 0;
        let mut abandoned = Vec::new();
        for (group, result) in results {
            match result {
                Ok(()) => {
                    joined += 1;
                    if !self.mark(group, JoinState::Joined) {
                        abandoned.push(group);
                    }
                }
                Err(e) => {
                    tracing::warn!(%group, error = %e, "group join failed");
                    self.mark(group, JoinState::Failed);
                }
            }
        }
        // left while its join was in flight
        for group in abandoned {
            if let Err(e) = self.send(link, procedures::LEAVE_GROUP, group).await {
                tracing::debug!(%group, error = %e, "leave after replay failed");
            }
        }
        joined
    }

    /// Update the state of a still recorded group. Returns false if it was removed.
    fn mark(&self, group: &GroupMembership, state: JoinState) -> bool {
        match self.inner.groups.lock().get_mut(group) {
            Some(current) => {
                *current = state;
                true
            }
            None => false,
        }
    }

    pub fn is_member(&self, group: &GroupMembership) -> bool {
        self.inner.groups.lock().contains_key(group)
    }

    /// Recorded groups in `(kind, group_id)` order.
    pub fn groups(&self) -> Vec<GroupMembership> {
        self.inner.groups.lock().keys().cloned().collect()
    }

    pub fn clear(&self) {
        self.inner.groups.lock().clear();
    }

    async fn send(&self, link: Option<&ReadyLink>, procedure: &str, group: &GroupMembership) -> Result<()> {
        let args = vec![json!(group.wire_name())];
        let result = match link {
            Some(link) => link.invoke(procedure, args).await,
            None => self.inner.channel.invoke(procedure, args).await,
        };
        result.map(|_| ())
    }
}

impl LifecycleObserver for Inner {
    fn on_ready(self: Arc<Self>, link: ReadyLink) -> BoxFuture<'static, ()> {
        let manager = SubscriptionManager { inner: self };
        async move {
            manager.replay(Some(&link)).await;
        }
        .boxed()
    }

    fn on_connected(self: Arc<Self>) -> BoxFuture<'static, ()> {
        let manager = SubscriptionManager { inner: self };
        async move { manager.flush_pending().await }.boxed()
    }

    fn on_teardown(&self) {
        self.groups.lock().clear();
    }
}
