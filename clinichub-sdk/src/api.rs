//! REST collaborators: history paging, sending and read receipts.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;

use crate::error::{HubError, Result};
use crate::message::{Attachment, ConversationId, Message, MessagePage};

/// The request/response side of the messaging backend.
///
/// History is paged by increasing page number (1 = most recent).
pub trait MessageApi: Send + Sync + 'static {
    fn fetch_history_page(
        &self,
        conversation_id: ConversationId,
        page: u32,
        page_size: u32,
    ) -> BoxFuture<'static, Result<MessagePage>>;

    fn send_message(
        &self,
        conversation_id: ConversationId,
        content: Option<String>,
        attachment: Option<Attachment>,
    ) -> BoxFuture<'static, Result<Message>>;

    fn mark_read(&self, conversation_id: ConversationId) -> BoxFuture<'static, Result<()>>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SendBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    attachment: Option<Attachment>,
}

/// JSON-over-HTTP implementation of [`MessageApi`].
#[derive(Clone)]
pub struct HttpMessageApi {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl HttpMessageApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
            http: reqwest::Client::new(),
        }
    }

    /// Send `Authorization: Bearer <token>` with every request.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn messages_url(&self, conversation_id: ConversationId) -> String {
        format!("{}/conversations/{conversation_id}/messages", self.base_url)
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().await.unwrap_or_default();
    Err(HubError::Api {
        status: status.as_u16(),
        message,
    })
}

impl MessageApi for HttpMessageApi {
    fn fetch_history_page(
        &self,
        conversation_id: ConversationId,
        page: u32,
        page_size: u32,
    ) -> BoxFuture<'static, Result<MessagePage>> {
        let req = self
            .authorized(self.http.get(self.messages_url(conversation_id)))
            .query(&[("pageNumber", page), ("pageSize", page_size)]);
        async move {
            tracing::debug!(conversation_id, page, page_size, "fetching history page");
            let resp = check(req.send().await?).await?;
            Ok(resp.json::<MessagePage>().await?)
        }
        .boxed()
    }

    fn send_message(
        &self,
        conversation_id: ConversationId,
        content: Option<String>,
        attachment: Option<Attachment>,
    ) -> BoxFuture<'static, Result<Message>> {
        let req = self
            .authorized(self.http.post(self.messages_url(conversation_id)))
            .json(&SendBody { content, attachment });
        async move {
            let resp = check(req.send().await?).await?;
            Ok(resp.json::<Message>().await?)
        }
        .boxed()
    }

    fn mark_read(&self, conversation_id: ConversationId) -> BoxFuture<'static, Result<()>> {
        let url = format!("{}/conversations/{conversation_id}/read", self.base_url);
        let req = self.authorized(self.http.post(url));
        async move {
            check(req.send().await?).await?;
            Ok(())
        }
        .boxed()
    }
}
