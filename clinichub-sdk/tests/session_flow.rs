//! ChatSession end to end: history paging, echo reconciliation, dispatch
//! of push events, typing and read receipts.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::json;

use clinichub_sdk::api::MessageApi;
use clinichub_sdk::event::{events, procedures};
use clinichub_sdk::ownership::OwnershipResolver;
use clinichub_sdk::transport::memory::MemoryHub;
use clinichub_sdk::{
    Attachment, ChatSession, ConversationId, HubError, Message, MessageId, MessagePage, Result, SenderKind,
};

use common::{channel, eventually};

const VIEWER: i64 = 7;

fn msg(conversation_id: ConversationId, id: MessageId, secs: Option<i64>, sender_id: i64) -> Message {
    Message {
        id,
        conversation_id,
        sender_kind: SenderKind::User,
        sender_id,
        sent_at: secs.map(|s| Utc.timestamp_opt(s, 0).unwrap()),
        content: Some(format!("message {id}")),
        attachment: None,
        is_own: None,
    }
}

#[derive(Default)]
struct FakeApi {
    pages: Mutex<HashMap<(ConversationId, u32), MessagePage>>,
    fetches: AtomicUsize,
    fetch_delay: Mutex<Duration>,
    reads: Mutex<Vec<ConversationId>>,
    next_id: AtomicI64,
    fail_send: AtomicBool,
}

impl FakeApi {
    fn new() -> Arc<Self> {
        let api = Self::default();
        api.next_id.store(1_000, Ordering::SeqCst);
        Arc::new(api)
    }

    fn page(&self, conversation_id: ConversationId, number: u32, page: MessagePage) {
        self.pages.lock().insert((conversation_id, number), page);
    }
}

impl MessageApi for FakeApi {
    fn fetch_history_page(
        &self,
        conversation_id: ConversationId,
        page: u32,
        _page_size: u32,
    ) -> BoxFuture<'static, Result<MessagePage>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let result = self
            .pages
            .lock()
            .get(&(conversation_id, page))
            .cloned()
            .unwrap_or_default();
        let delay = *self.fetch_delay.lock();
        async move {
            tokio::time::sleep(delay).await;
            Ok(result)
        }
        .boxed()
    }

    fn send_message(
        &self,
        conversation_id: ConversationId,
        content: Option<String>,
        attachment: Option<Attachment>,
    ) -> BoxFuture<'static, Result<Message>> {
        if self.fail_send.load(Ordering::SeqCst) {
            return futures::future::ready(Err(HubError::Api {
                status: 503,
                message: "unavailable".into(),
            }))
            .boxed();
        }
        let message = Message {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            conversation_id,
            sender_kind: SenderKind::User,
            sender_id: VIEWER,
            sent_at: None,
            content,
            attachment,
            is_own: Some(true),
        };
        futures::future::ready(Ok(message)).boxed()
    }

    fn mark_read(&self, conversation_id: ConversationId) -> BoxFuture<'static, Result<()>> {
        self.reads.lock().push(conversation_id);
        futures::future::ready(Ok(())).boxed()
    }
}

async fn connected_session(hub: &MemoryHub, api: Arc<FakeApi>) -> ChatSession {
    let ch = channel(hub);
    let session = ChatSession::new(ch, api, OwnershipResolver::new(SenderKind::User, Some(VIEWER)), 20);
    session.channel().connect("tok").await.unwrap();
    session
}

fn ids(session: &ChatSession) -> Vec<MessageId> {
    session.snapshot().iter().map(|m| m.id).collect()
}

#[tokio::test(start_paused = true)]
async fn open_conversation_joins_loads_and_marks_read() {
    let hub = MemoryHub::new();
    let api = FakeApi::new();
    api.page(42, 1, MessagePage::new(vec![msg(42, 1, Some(10), 3), msg(42, 2, Some(20), 3)], true));
    let session = connected_session(&hub, api.clone()).await;

    session.open_conversation(42).await.unwrap();

    assert_eq!(hub.calls_to(procedures::JOIN_GROUP), vec![vec![json!("conversation:42")]]);
    assert_eq!(ids(&session), vec![1, 2]);
    assert!(session.has_more());
    eventually(|| *api.reads.lock() == vec![42]).await;
}

#[tokio::test(start_paused = true)]
async fn older_pages_stop_when_history_is_exhausted() {
    let hub = MemoryHub::new();
    let api = FakeApi::new();
    api.page(42, 1, MessagePage::new(vec![msg(42, 1, Some(100), 3)], true));
    api.page(42, 2, MessagePage::new(vec![msg(42, 0, Some(50), 3)], false));
    let session = connected_session(&hub, api.clone()).await;
    session.open_conversation(42).await.unwrap();

    assert_eq!(session.load_older().await.unwrap(), 1);
    assert!(!session.has_more());
    assert_eq!(session.load_older().await.unwrap(), 0);
    assert_eq!(api.fetches.load(Ordering::SeqCst), 2);

    hub.push(events::MESSAGE_ARRIVED, vec![json!(msg(42, 2, Some(200), 3))]).await;
    eventually(|| session.snapshot().len() == 3).await;
    assert_eq!(ids(&session), vec![0, 1, 2]);
}

#[tokio::test(start_paused = true)]
async fn own_message_echo_is_reconciled() {
    let hub = MemoryHub::new();
    let api = FakeApi::new();
    api.page(42, 1, MessagePage::new(vec![msg(42, 1, Some(10), 3)], false));
    let session = connected_session(&hub, api.clone()).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    session.on_message(move |m, own| sink.lock().push((m.id, own)));
    session.open_conversation(42).await.unwrap();

    let sent = session.send(Some("running late".into()), None).await.unwrap();
    assert_eq!(ids(&session), vec![1, sent.id]);
    assert!(session.snapshot()[1].sent_at.is_none());

    let mut echo = sent.clone();
    echo.sent_at = Some(Utc.timestamp_opt(30, 0).unwrap());
    echo.is_own = None;
    hub.push(events::MESSAGE_ARRIVED, vec![json!(echo)]).await;
    hub.push(events::MESSAGE_ARRIVED, vec![json!(echo)]).await;

    eventually(|| session.snapshot()[1].sent_at.is_some()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(ids(&session), vec![1, sent.id]);
    assert_eq!(session.snapshot()[1], echo);
    // resolved from the sender fields once the server copy wins
    assert_eq!(*seen.lock(), vec![(sent.id, true)]);
}

#[tokio::test(start_paused = true)]
async fn arrivals_during_first_page_load_are_kept() {
    let hub = MemoryHub::new();
    let api = FakeApi::new();
    api.page(42, 1, MessagePage::new(vec![msg(42, 1, Some(10), 3)], false));
    *api.fetch_delay.lock() = Duration::from_millis(200);
    let session = connected_session(&hub, api.clone()).await;

    let opening = tokio::spawn({
        let session = session.clone();
        async move { session.open_conversation(42).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    hub.push(events::MESSAGE_ARRIVED, vec![json!(msg(42, 5, Some(60), 3))]).await;
    opening.await.unwrap().unwrap();

    assert_eq!(ids(&session), vec![1, 5]);
}

#[tokio::test(start_paused = true)]
async fn has_more_only_turns_off_across_an_open() {
    let hub = MemoryHub::new();
    let api = FakeApi::new();
    api.page(42, 1, MessagePage::new(vec![msg(42, 1, Some(10), 3)], false));
    *api.fetch_delay.lock() = Duration::from_millis(200);
    let session = connected_session(&hub, api.clone()).await;
    assert!(session.has_more());

    let opening = tokio::spawn({
        let session = session.clone();
        async move { session.open_conversation(42).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(session.has_more());
    // nothing to page behind until the first page lands
    assert_eq!(session.load_older().await.unwrap(), 0);

    opening.await.unwrap().unwrap();
    assert!(!session.has_more());
    assert_eq!(api.fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn switching_conversations_leaves_the_previous_group() {
    let hub = MemoryHub::new();
    let api = FakeApi::new();
    let session = connected_session(&hub, api).await;

    session.open_conversation(1).await.unwrap();
    session.open_conversation(2).await.unwrap();

    assert_eq!(hub.calls_to(procedures::LEAVE_GROUP), vec![vec![json!("conversation:1")]]);
    assert_eq!(session.conversation_id(), Some(2));

    // pushes for the old conversation no longer land in the view
    hub.push(events::MESSAGE_ARRIVED, vec![json!(msg(1, 9, Some(5), 3))]).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(session.snapshot().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_send_is_surfaced_and_not_stored() {
    let hub = MemoryHub::new();
    let api = FakeApi::new();
    let session = connected_session(&hub, api.clone()).await;
    session.open_conversation(42).await.unwrap();

    api.fail_send.store(true, Ordering::SeqCst);
    let err = session.send(Some("hello".into()), None).await.unwrap_err();
    assert!(matches!(err, HubError::Api { status: 503, .. }));
    assert!(session.snapshot().is_empty());
}

#[tokio::test(start_paused = true)]
async fn operations_need_an_open_conversation() {
    let hub = MemoryHub::new();
    let session = connected_session(&hub, FakeApi::new()).await;
    assert!(matches!(session.send(Some("x".into()), None).await, Err(HubError::NoConversation)));
    assert!(matches!(session.load_older().await, Err(HubError::NoConversation)));
}

#[tokio::test(start_paused = true)]
async fn typing_indicator_is_skipped_while_disconnected() {
    let hub = MemoryHub::new();
    let session = connected_session(&hub, FakeApi::new()).await;
    session.open_conversation(42).await.unwrap();

    session.set_typing(true).await.unwrap();
    assert_eq!(hub.calls_to(procedures::SEND_TYPING), vec![vec![json!(42), json!(true)]]);

    session.channel().disconnect().await;
    session.set_typing(false).await.unwrap();
    assert_eq!(hub.calls_to(procedures::SEND_TYPING).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn read_typing_and_group_events_reach_callbacks() {
    let hub = MemoryHub::new();
    let session = connected_session(&hub, FakeApi::new()).await;
    let log = Arc::new(Mutex::new(Vec::<String>::new()));

    let l = log.clone();
    session.on_read(move |r| l.lock().push(format!("read {} by {}", r.conversation_id, r.reader_id)));
    let l = log.clone();
    session.on_typing(move |t| l.lock().push(format!("typing {} {}", t.sender_id, t.is_typing)));
    let l = log.clone();
    session.on_group_updated(move |id| l.lock().push(format!("updated {id}")));

    hub.push(
        events::MESSAGES_READ,
        vec![json!({"conversationId": 42, "readerKind": "patient", "readerId": 3})],
    )
    .await;
    hub.push(
        events::TYPING_CHANGED,
        vec![json!({"conversationId": 42, "senderKind": "patient", "senderId": 3, "isTyping": true})],
    )
    .await;
    hub.push(events::GROUP_UPDATED, vec![json!(42)]).await;

    eventually(|| log.lock().len() == 3).await;
    assert_eq!(*log.lock(), vec!["read 42 by 3", "typing 3 true", "updated 42"]);
}

#[tokio::test(start_paused = true)]
async fn close_disconnects_and_drops_handlers() {
    let hub = MemoryHub::new();
    let session = connected_session(&hub, FakeApi::new()).await;
    session.open_conversation(42).await.unwrap();

    session.close().await;
    assert!(!session.channel().is_connected());
    assert!(!session.channel().has_handler(events::MESSAGE_ARRIVED));
    assert!(session.subscriptions().groups().is_empty());
    assert!(!hub.is_linked());
}
