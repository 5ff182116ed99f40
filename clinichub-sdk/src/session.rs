//! ChatSession: the chat feature controller.
//!
//! Ties one [`EventChannel`] to a [`SubscriptionManager`] and a
//! [`MessageStore`]. Push events from the channel are queued and applied by
//! a single dispatch task, so the store only ever has one writer for hub
//! traffic. History paging and sends go through the [`MessageApi`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::api::MessageApi;
use crate::channel::{ConnectionState, EventChannel};
use crate::error::{HubError, Result};
use crate::event::{events, procedures, HubEvent, ReadReceipt, TypingUpdate};
use crate::message::{Attachment, ConversationId, Message};
use crate::ownership::OwnershipResolver;
use crate::store::MessageStore;
use crate::subscription::{GroupMembership, SubscriptionManager};

pub type MessageCallback = Arc<dyn Fn(&Message, bool) + Send + Sync>;
pub type ReadCallback = Arc<dyn Fn(&ReadReceipt) + Send + Sync>;
pub type GroupUpdatedCallback = Arc<dyn Fn(ConversationId) + Send + Sync>;
pub type TypingCallback = Arc<dyn Fn(&TypingUpdate) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    message: Option<MessageCallback>,
    read: Option<ReadCallback>,
    group_updated: Option<GroupUpdatedCallback>,
    typing: Option<TypingCallback>,
}

struct SessionInner {
    channel: EventChannel,
    subscriptions: SubscriptionManager,
    api: Arc<dyn MessageApi>,
    resolver: OwnershipResolver,
    page_size: u32,
    store: Mutex<MessageStore>,
    // bumped on every open_conversation; stale page results are discarded
    epoch: AtomicU64,
    loading_older: AtomicBool,
    callbacks: Mutex<Callbacks>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

/// One conversation view over a shared hub connection.
#[derive(Clone)]
pub struct ChatSession {
    inner: Arc<SessionInner>,
}

impl ChatSession {
    /// Attach to `channel` and start the dispatch task. Must be called inside a tokio runtime.
    pub fn new(
        channel: EventChannel,
        api: Arc<dyn MessageApi>,
        resolver: OwnershipResolver,
        page_size: u32,
    ) -> Self {
        let inner = Arc::new(SessionInner {
            subscriptions: SubscriptionManager::new(channel.clone()),
            channel,
            api,
            resolver,
            page_size: page_size.max(1),
            store: Mutex::new(MessageStore::new()),
            epoch: AtomicU64::new(0),
            loading_older: AtomicBool::new(false),
            callbacks: Mutex::new(Callbacks::default()),
            dispatch: Mutex::new(None),
        });

        let (tx, rx) = mpsc::unbounded_channel::<(String, Vec<Value>)>();
        for event in events::CHAT {
            let tx = tx.clone();
            inner.channel.on(event, move |args| {
                let _ = tx.send((event.to_string(), args));
            });
        }
        let task = tokio::spawn(dispatch_loop(Arc::downgrade(&inner), rx));
        *inner.dispatch.lock() = Some(task);

        Self { inner }
    }

    pub fn channel(&self) -> &EventChannel {
        &self.inner.channel
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.inner.subscriptions
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.channel.state()
    }

    pub fn conversation_id(&self) -> Option<ConversationId> {
        self.inner.store.lock().conversation_id()
    }

    /// Called for every message that entered the store from the hub,
    /// with whether the viewer wrote it.
    pub fn on_message<F>(&self, f: F)
    where
        F: Fn(&Message, bool) + Send + Sync + 'static,
    {
        self.inner.callbacks.lock().message = Some(Arc::new(f));
    }

    pub fn on_read<F>(&self, f: F)
    where
        F: Fn(&ReadReceipt) + Send + Sync + 'static,
    {
        self.inner.callbacks.lock().read = Some(Arc::new(f));
    }

    pub fn on_group_updated<F>(&self, f: F)
    where
        F: Fn(ConversationId) + Send + Sync + 'static,
    {
        self.inner.callbacks.lock().group_updated = Some(Arc::new(f));
    }

    pub fn on_typing<F>(&self, f: F)
    where
        F: Fn(&TypingUpdate) + Send + Sync + 'static,
    {
        self.inner.callbacks.lock().typing = Some(Arc::new(f));
    }

    /// Switch the view to `conversation_id`.
    ///
    /// Leaves the previous conversation group, joins the new one (deferred
    /// if disconnected), loads the most recent page and marks it read.
    /// Arrivals that land while the first page is in flight are kept.
    pub async fn open_conversation(&self, conversation_id: ConversationId) -> Result<()> {
        let previous = self.conversation_id();
        if let Some(previous) = previous.filter(|p| *p != conversation_id) {
            if let Err(e) = self
                .inner
                .subscriptions
                .leave(&GroupMembership::conversation(previous))
                .await
            {
                tracing::warn!(conversation_id = previous, error = %e, "leaving conversation group failed");
            }
        }

        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        *self.inner.store.lock() = MessageStore::for_conversation(conversation_id);
        self.inner.loading_older.store(false, Ordering::SeqCst);

        self.inner
            .subscriptions
            .join(GroupMembership::conversation(conversation_id))
            .await?;

        let page = self
            .inner
            .api
            .fetch_history_page(conversation_id, 1, self.inner.page_size)
            .await?;

        {
            let mut store = self.inner.store.lock();
            if self.inner.epoch.load(Ordering::SeqCst) != epoch {
                tracing::debug!(conversation_id, "conversation switched during load, page dropped");
                return Ok(());
            }
            let arrived = store.snapshot().to_vec();
            store.initialize(page);
            for message in arrived {
                store.append_arrival(message);
            }
        }
        tracing::info!(conversation_id, "conversation opened");
        self.mark_read();
        Ok(())
    }

    /// Fetch the next older page. Returns how many messages were added;
    /// 0 when history is exhausted, the first page has not landed yet, or a
    /// load is already running.
    pub async fn load_older(&self) -> Result<usize> {
        let (conversation_id, page_number) = {
            let store = self.inner.store.lock();
            let Some(id) = store.conversation_id() else {
                return Err(HubError::NoConversation);
            };
            if !store.has_more() || store.next_page() < 2 {
                return Ok(0);
            }
            (id, store.next_page())
        };
        if self.inner.loading_older.swap(true, Ordering::SeqCst) {
            return Ok(0);
        }
        let epoch = self.inner.epoch.load(Ordering::SeqCst);

        let result = self
            .inner
            .api
            .fetch_history_page(conversation_id, page_number, self.inner.page_size)
            .await;

        if self.inner.epoch.load(Ordering::SeqCst) != epoch {
            return Ok(0);
        }
        self.inner.loading_older.store(false, Ordering::SeqCst);
        let page = result?;
        let added = self.inner.store.lock().prepend_older(page);
        tracing::debug!(conversation_id, page = page_number, added, "older history loaded");
        Ok(added)
    }

    /// Send a message to the open conversation. Not retried on failure.
    pub async fn send(&self, content: Option<String>, attachment: Option<Attachment>) -> Result<Message> {
        let conversation_id = self.conversation_id().ok_or(HubError::NoConversation)?;
        let message = self
            .inner
            .api
            .send_message(conversation_id, content, attachment)
            .await?;
        self.inner.store.lock().append_sent(message.clone());
        tracing::debug!(conversation_id, message_id = message.id, "message sent");
        Ok(message)
    }

    /// Mark the open conversation read in the background. Failures are only logged.
    pub fn mark_read(&self) {
        let Some(conversation_id) = self.conversation_id() else {
            return;
        };
        let request = self.inner.api.mark_read(conversation_id);
        tokio::spawn(async move {
            if let Err(e) = request.await {
                tracing::warn!(conversation_id, error = %e, "mark read failed");
            }
        });
    }

    /// Tell the other participants whether we are typing. Skipped while disconnected.
    pub async fn set_typing(&self, is_typing: bool) -> Result<()> {
        let conversation_id = self.conversation_id().ok_or(HubError::NoConversation)?;
        if !self.inner.channel.is_connected() {
            tracing::debug!(conversation_id, "typing indicator skipped while disconnected");
            return Ok(());
        }
        self.inner
            .channel
            .invoke(procedures::SEND_TYPING, vec![json!(conversation_id), json!(is_typing)])
            .await
            .map(|_| ())
    }

    /// Current messages in display order.
    pub fn snapshot(&self) -> Vec<Message> {
        self.inner.store.lock().snapshot().to_vec()
    }

    pub fn has_more(&self) -> bool {
        self.inner.store.lock().has_more()
    }

    pub fn is_own(&self, message: &Message) -> bool {
        self.inner.resolver.is_own(message)
    }

    /// Stop dispatching, drop the chat handlers and disconnect the channel.
    pub async fn close(&self) {
        for event in events::CHAT {
            self.inner.channel.off(event);
        }
        if let Some(task) = self.inner.dispatch.lock().take() {
            task.abort();
        }
        self.inner.channel.disconnect().await;
    }
}

async fn dispatch_loop(session: Weak<SessionInner>, mut rx: mpsc::UnboundedReceiver<(String, Vec<Value>)>) {
    while let Some((name, args)) = rx.recv().await {
        let Some(session) = session.upgrade() else { return };
        match HubEvent::parse(&name, &args) {
            Ok(event) => session.apply(event),
            Err(e) => tracing::warn!(event = %name, error = %e, "undecodable hub event"),
        }
    }
}

impl SessionInner {
    fn apply(&self, event: HubEvent) {
        match event {
            HubEvent::MessageArrived(message) => {
                let added = self.store.lock().append_arrival(message.clone());
                if !added {
                    tracing::debug!(message_id = message.id, "arrival ignored");
                    return;
                }
                let callback = self.callbacks.lock().message.clone();
                if let Some(callback) = callback {
                    callback(&message, self.resolver.is_own(&message));
                }
            }
            HubEvent::MessagesRead(receipt) => {
                let callback = self.callbacks.lock().read.clone();
                if let Some(callback) = callback {
                    callback(&receipt);
                }
            }
            HubEvent::GroupUpdated { conversation_id } => {
                let callback = self.callbacks.lock().group_updated.clone();
                if let Some(callback) = callback {
                    callback(conversation_id);
                }
            }
            HubEvent::TypingChanged(update) => {
                let callback = self.callbacks.lock().typing.clone();
                if let Some(callback) = callback {
                    callback(&update);
                }
            }
            HubEvent::PaymentUpdated(_) => {
                tracing::debug!("payment event on chat channel ignored");
            }
        }
    }
}
