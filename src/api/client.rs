use crate::api::models::{ConversationRow, MessageRow, Session, TokenResponse};
use crate::app::AppState;
use crate::chat::gateway::ChatGateway;
use crate::error::{ChatError, Result};
use crate::utils::normalize_url;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use reqwest::{Client as HttpClient, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::json;

const CONVERSATIONS: &str = "conversations";
const MESSAGES: &str = "messages";

pub struct ApiClient {
    http: HttpClient,
    base_url: String,
    api_key: String,
    access_token: Option<String>,
}

impl ApiClient {
    pub fn new(state: &AppState) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(state.request_timeout())
            .build()?;
        Ok(Self {
            http,
            base_url: normalize_url(&state.base_url),
            api_key: state.api_key.clone(),
            access_token: state.session.as_ref().map(|s| s.access_token.clone()),
        })
    }

    pub fn with_session(mut self, session: &Session) -> Self {
        self.access_token = Some(session.access_token.clone());
        self
    }

    pub fn is_authenticated(&self) -> bool {
        self.access_token.is_some()
    }

    fn rest(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn auth_token_endpoint(&self) -> String {
        format!("{}/auth/v1/token", self.base_url)
    }

    fn with_auth(&self, req: RequestBuilder) -> Result<RequestBuilder> {
        let token = self.access_token.as_deref().ok_or(ChatError::NotAuthenticated)?;
        Ok(req
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", token)))
    }

    async fn check(resp: Response) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(ChatError::Http {
            status: status.as_u16(),
            body,
        })
    }

    async fn read_json<T: DeserializeOwned>(resp: Response) -> Result<T> {
        let bytes = Self::check(resp).await?.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Password grant against the auth service.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session> {
        let resp = self
            .http
            .post(self.auth_token_endpoint())
            .query(&[("grant_type", "password")])
            .header("apikey", &self.api_key)
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await?;
        let token: TokenResponse = Self::read_json(resp).await?;
        let session = token.into_session(Utc::now());
        info!("Signed in as {}", session.user_id);
        Ok(session)
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<Session> {
        let resp = self
            .http
            .post(self.auth_token_endpoint())
            .query(&[("grant_type", "refresh_token")])
            .header("apikey", &self.api_key)
            .json(&json!({ "refresh_token": refresh_token }))
            .send()
            .await?;
        let token: TokenResponse = Self::read_json(resp).await?;
        debug!("Refreshed session");
        Ok(token.into_session(Utc::now()))
    }

    async fn insert_returning<T>(&self, table: &str, row: &T) -> Result<T>
    where
        T: serde::Serialize + DeserializeOwned + Clone,
    {
        let req = self
            .http
            .post(self.rest(table))
            .header("Prefer", "return=representation")
            .json(row);
        let resp = self.with_auth(req)?.send().await?;
        let rows: Vec<T> = Self::read_json(resp).await?;
        Ok(representation_or(table, rows, row))
    }
}

/// First returned row, or the row we sent when the backend echoed nothing.
pub(crate) fn representation_or<T: Clone>(table: &str, mut rows: Vec<T>, sent: &T) -> T {
    if rows.is_empty() {
        // Row-level security can hide the inserted row from the caller.
        debug!("Insert into {} returned no representation, keeping the local row", table);
        return sent.clone();
    }
    rows.swap_remove(0)
}

/// PostgREST value, quoted so reserved characters survive inside `or=(...)`.
fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

pub(crate) fn pair_filter(a: &str, b: &str) -> String {
    let (a, b) = (quote(a), quote(b));
    format!(
        "(and(dog1_id.eq.{a},dog2_id.eq.{b}),and(dog1_id.eq.{b},dog2_id.eq.{a}))"
    )
}

pub(crate) fn participants_filter(ids: &[String]) -> String {
    let list = ids.iter().map(|id| quote(id)).collect::<Vec<_>>().join(",");
    format!("(dog1_id.in.({list}),dog2_id.in.({list}))")
}

#[async_trait]
impl ChatGateway for ApiClient {
    async fn find_conversation(&self, a: &str, b: &str) -> Result<Option<ConversationRow>> {
        let filter = pair_filter(a, b);
        let req = self
            .http
            .get(self.rest(CONVERSATIONS))
            .query(&[("select", "*"), ("or", filter.as_str()), ("limit", "1")]);
        let resp = self.with_auth(req)?.send().await?;
        let mut rows: Vec<ConversationRow> = Self::read_json(resp).await?;
        Ok(rows.pop())
    }

    async fn list_conversations(&self, participant_ids: &[String]) -> Result<Vec<ConversationRow>> {
        if participant_ids.is_empty() {
            return Ok(Vec::new());
        }
        let filter = participants_filter(participant_ids);
        let req = self.http.get(self.rest(CONVERSATIONS)).query(&[
            ("select", "*"),
            ("or", filter.as_str()),
            ("order", "last_message_at.desc.nullslast"),
        ]);
        let resp = self.with_auth(req)?.send().await?;
        let rows: Vec<ConversationRow> = Self::read_json(resp).await?;
        debug!("Fetched {} conversations", rows.len());
        Ok(rows)
    }

    async fn create_conversation(&self, row: &ConversationRow) -> Result<ConversationRow> {
        self.insert_returning(CONVERSATIONS, row).await
    }

    async fn delete_conversation(&self, conversation_id: &str) -> Result<()> {
        let id = format!("eq.{}", conversation_id);
        let req = self
            .http
            .delete(self.rest(CONVERSATIONS))
            .query(&[("id", id.as_str())]);
        let resp = self.with_auth(req)?.send().await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn touch_conversation(&self, conversation_id: &str, at: DateTime<Utc>) -> Result<()> {
        let id = format!("eq.{}", conversation_id);
        let req = self
            .http
            .patch(self.rest(CONVERSATIONS))
            .query(&[("id", id.as_str())])
            .json(&json!({ "last_message_at": at }));
        let resp = self.with_auth(req)?.send().await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<MessageRow>> {
        let id = format!("eq.{}", conversation_id);
        let req = self.http.get(self.rest(MESSAGES)).query(&[
            ("select", "*"),
            ("conversation_id", id.as_str()),
            ("order", "created_at.asc"),
        ]);
        let resp = self.with_auth(req)?.send().await?;
        Self::read_json(resp).await
    }

    async fn insert_message(&self, row: &MessageRow) -> Result<MessageRow> {
        self.insert_returning(MESSAGES, row).await
    }
}
