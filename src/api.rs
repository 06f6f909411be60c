use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::auth::{AuthError, Credentials, OAuthSigner, encode_pairs};
use crate::realtime::UserStream;

pub const MAX_MESSAGE_CHARS: usize = 10_000;
const FRIENDS_PAGE_SIZE: u32 = 200;
const CONNECT_TIMEOUT_SECS: u64 = 10;

// Vendor error codes that mean the credentials were rejected.
const AUTH_ERROR_CODES: [i32; 3] = [32, 89, 215];
const NOT_FOUND_ERROR_CODE: i32 = 34;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("signing error: {0}")]
    Signing(#[from] AuthError),
    #[error("unexpected status: {0}")]
    Status(u16),
    #[error("api error: {message} (code {code})")]
    Api { code: i32, message: String },
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub screen_name: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectMessage {
    pub id: i64,
    pub sender_id: i64,
    pub sender_screen_name: String,
    pub recipient_id: i64,
    pub recipient_screen_name: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

/// Paging bounds for DM listings. Only positive values are sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DmParams {
    pub since_id: Option<i64>,
    pub max_id: Option<i64>,
    pub count: Option<u32>,
}

impl DmParams {
    pub fn with_count(count: u32) -> Self {
        Self {
            count: Some(count),
            ..Self::default()
        }
    }

    pub fn since_id(mut self, id: i64) -> Self {
        self.since_id = Some(id);
        self
    }

    pub fn max_id(mut self, id: i64) -> Self {
        self.max_id = Some(id);
        self
    }

    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(since_id) = self.since_id.filter(|id| *id > 0) {
            pairs.push(("since_id", since_id.to_string()));
        }
        if let Some(max_id) = self.max_id.filter(|id| *id > 0) {
            pairs.push(("max_id", max_id.to_string()));
        }
        if let Some(count) = self.count.filter(|count| *count > 0) {
            pairs.push(("count", count.to_string()));
        }
        pairs
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DmTarget {
    ScreenName(String),
    UserId(i64),
}

impl DmTarget {
    fn to_pair(&self) -> (&'static str, String) {
        match self {
            DmTarget::ScreenName(name) => ("screen_name", name.trim_start_matches('@').to_string()),
            DmTarget::UserId(id) => ("user_id", id.to_string()),
        }
    }
}

/// Rejects text the vendor would refuse, before any request is made.
pub fn validate_text(text: &str) -> Result<(), ApiError> {
    if text.trim().is_empty() {
        return Err(ApiError::InvalidMessage("message text is empty".to_string()));
    }
    let chars = text.chars().count();
    if chars > MAX_MESSAGE_CHARS {
        return Err(ApiError::InvalidMessage(format!(
            "message text is {chars} characters (limit {MAX_MESSAGE_CHARS})"
        )));
    }
    Ok(())
}

/// Direct-message operations of the vendor API.
#[async_trait]
pub trait DmApi: Send + Sync {
    async fn verify_credentials(&self) -> Result<User, ApiError>;
    async fn fetch_received(&self, params: DmParams) -> Result<Vec<DirectMessage>, ApiError>;
    async fn fetch_sent(&self, params: DmParams) -> Result<Vec<DirectMessage>, ApiError>;
    async fn fetch_by_id(&self, id: i64) -> Result<DirectMessage, ApiError>;
    async fn send(&self, text: &str, target: &DmTarget) -> Result<DirectMessage, ApiError>;
    async fn delete(&self, id: i64) -> Result<DirectMessage, ApiError>;
    async fn list_friends(&self) -> Result<Vec<User>, ApiError>;
}

#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    stream_url: String,
    http: Client,
    signer: Arc<OAuthSigner>,
}

impl ApiClient {
    pub fn new(base_url: &str, stream_url: &str, credentials: Credentials) -> Result<Self, ApiError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            stream_url: stream_url.to_string(),
            http,
            signer: Arc::new(OAuthSigner::new(credentials)),
        })
    }

    pub fn open_stream(&self) -> UserStream {
        UserStream::open(self.clone())
    }

    /// Connects to the user stream and returns the live response body.
    pub(crate) async fn connect_stream(&self) -> Result<reqwest::Response, ApiError> {
        let params = vec![("with", "user".to_string())];
        let response = self.send_signed(Method::GET, &self.stream_url, &params).await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(ApiError::Authentication("stream rejected credentials".to_string()));
        }
        if !status.is_success() {
            return Err(ApiError::Status(status.as_u16()));
        }
        Ok(response)
    }

    async fn get<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ApiError> {
        let url = self.endpoint(path);
        let response = self.send_signed(Method::GET, &url, params).await?;
        read_response(response).await
    }

    async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ApiError> {
        let url = self.endpoint(path);
        let response = self.send_signed(Method::POST, &url, params).await?;
        read_response(response).await
    }

    async fn send_signed(
        &self,
        method: Method,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<reqwest::Response, ApiError> {
        let authorization = self.signer.authorization(method.as_str(), url, params)?;
        let encoded = encode_pairs(params);
        debug!(%method, url, "vendor request");

        let request = if method == Method::GET {
            let url = if encoded.is_empty() {
                url.to_string()
            } else {
                format!("{url}?{encoded}")
            };
            self.http.get(url)
        } else {
            self.http
                .request(method, url)
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(encoded)
        };

        Ok(request.header(AUTHORIZATION, authorization).send().await?)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

#[async_trait]
impl DmApi for ApiClient {
    async fn verify_credentials(&self) -> Result<User, ApiError> {
        let params = vec![
            ("include_entities", "false".to_string()),
            ("skip_status", "true".to_string()),
        ];
        self.get("account/verify_credentials.json", &params).await
    }

    async fn fetch_received(&self, params: DmParams) -> Result<Vec<DirectMessage>, ApiError> {
        self.get("direct_messages.json", &params.to_pairs()).await
    }

    async fn fetch_sent(&self, params: DmParams) -> Result<Vec<DirectMessage>, ApiError> {
        self.get("direct_messages/sent.json", &params.to_pairs()).await
    }

    async fn fetch_by_id(&self, id: i64) -> Result<DirectMessage, ApiError> {
        let params = vec![("id", id.to_string())];
        let shown: ShowResponse = self.get("direct_messages/show.json", &params).await?;
        single_message(id, shown.into_vec())
    }

    async fn send(&self, text: &str, target: &DmTarget) -> Result<DirectMessage, ApiError> {
        validate_text(text)?;
        let params = vec![target.to_pair(), ("text", text.to_string())];
        self.post("direct_messages/new.json", &params).await
    }

    async fn delete(&self, id: i64) -> Result<DirectMessage, ApiError> {
        let params = vec![
            ("id", id.to_string()),
            ("include_entities", "false".to_string()),
        ];
        self.post("direct_messages/destroy.json", &params).await
    }

    async fn list_friends(&self) -> Result<Vec<User>, ApiError> {
        collect_friends(|cursor| async move {
            let params = vec![
                ("cursor", cursor.to_string()),
                ("count", FRIENDS_PAGE_SIZE.to_string()),
                ("skip_status", "true".to_string()),
                ("include_user_entities", "false".to_string()),
            ];
            self.get::<FriendsPage>("friends/list.json", &params).await
        })
        .await
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ShowResponse {
    Many(Vec<DirectMessage>),
    One(DirectMessage),
}

impl ShowResponse {
    fn into_vec(self) -> Vec<DirectMessage> {
        match self {
            ShowResponse::Many(messages) => messages,
            ShowResponse::One(message) => vec![message],
        }
    }
}

fn single_message(id: i64, mut messages: Vec<DirectMessage>) -> Result<DirectMessage, ApiError> {
    if messages.len() != 1 {
        return Err(ApiError::NotFound(format!(
            "direct message {id} ({} results)",
            messages.len()
        )));
    }
    Ok(messages.remove(0))
}

#[derive(Debug, Deserialize)]
struct FriendsPage {
    #[serde(default)]
    users: Vec<User>,
    #[serde(default)]
    next_cursor: i64,
}

/// Walks cursor pages starting at -1 until the vendor returns cursor 0.
async fn collect_friends<F, Fut>(mut fetch_page: F) -> Result<Vec<User>, ApiError>
where
    F: FnMut(i64) -> Fut,
    Fut: Future<Output = Result<FriendsPage, ApiError>>,
{
    let mut friends = Vec::new();
    let mut cursor = -1;
    loop {
        let page = fetch_page(cursor).await?;
        friends.extend(page.users);
        if page.next_cursor == 0 || page.next_cursor == cursor {
            break;
        }
        cursor = page.next_cursor;
    }
    Ok(friends)
}

#[derive(Debug, Deserialize)]
struct VendorErrors {
    errors: Vec<VendorError>,
}

#[derive(Debug, Deserialize)]
struct VendorError {
    code: i32,
    message: String,
}

async fn read_response<T: for<'de> Deserialize<'de>>(response: reqwest::Response) -> Result<T, ApiError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(error_from_response(status.as_u16(), &body));
    }
    Ok(serde_json::from_str(&body)?)
}

fn error_from_response(status: u16, body: &str) -> ApiError {
    let first = serde_json::from_str::<VendorErrors>(body)
        .ok()
        .and_then(|errors| errors.errors.into_iter().next());

    match first {
        Some(error) if status == 401 || AUTH_ERROR_CODES.contains(&error.code) => {
            ApiError::Authentication(error.message)
        }
        Some(error) if status == 404 || error.code == NOT_FOUND_ERROR_CODE => ApiError::NotFound(error.message),
        Some(error) => ApiError::Api {
            code: error.code,
            message: error.message,
        },
        None if status == 401 => ApiError::Authentication(format!("server status {status}")),
        None if status == 404 => ApiError::NotFound(format!("server status {status}")),
        None => ApiError::Status(status),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn user(id: i64, screen_name: &str) -> User {
        User {
            id,
            screen_name: screen_name.to_string(),
            name: String::new(),
        }
    }

    fn dm(id: i64) -> DirectMessage {
        DirectMessage {
            id,
            sender_id: 1,
            sender_screen_name: "me".to_string(),
            recipient_id: 2,
            recipient_screen_name: "you".to_string(),
            text: format!("message {id}"),
            created_at: None,
        }
    }

    #[test]
    fn count_only_params_send_only_count() {
        let params = DmParams::with_count(50);
        assert_eq!(encode_pairs(&params.to_pairs()), "count=50");
    }

    #[test]
    fn all_params_are_sent() {
        let params = DmParams::with_count(20).since_id(100).max_id(900);
        let query = encode_pairs(&params.to_pairs());
        assert!(query.contains("since_id=100"));
        assert!(query.contains("max_id=900"));
        assert!(query.contains("count=20"));
    }

    #[test]
    fn zero_params_are_not_sent() {
        let params = DmParams {
            since_id: Some(0),
            max_id: Some(-5),
            count: Some(0),
        };
        assert!(params.to_pairs().is_empty());
        assert_eq!(encode_pairs(&DmParams::default().to_pairs()), "");
    }

    #[test]
    fn single_message_requires_exactly_one_result() {
        assert!(matches!(single_message(7, vec![]), Err(ApiError::NotFound(_))));
        assert!(matches!(single_message(7, vec![dm(7), dm(8)]), Err(ApiError::NotFound(_))));
        assert_eq!(single_message(7, vec![dm(7)]).expect("one").id, 7);
    }

    #[test]
    fn show_response_accepts_object_or_array() {
        let object = r#"{"id":5,"sender_id":1,"sender_screen_name":"a","recipient_id":2,"recipient_screen_name":"b","text":"hi"}"#;
        let shown: ShowResponse = serde_json::from_str(object).expect("object");
        assert_eq!(shown.into_vec().len(), 1);

        let array = format!("[{object},{object}]");
        let shown: ShowResponse = serde_json::from_str(&array).expect("array");
        assert_eq!(shown.into_vec().len(), 2);
    }

    #[test]
    fn direct_message_ignores_extra_vendor_fields() {
        let payload = r#"{
            "id": 240136858829479936,
            "id_str": "240136858829479936",
            "created_at": "Mon Aug 27 17:21:03 +0000 2012",
            "sender_id": 14,
            "sender_screen_name": "alice",
            "sender": {"id": 14, "screen_name": "alice"},
            "recipient_id": 15,
            "recipient_screen_name": "bob",
            "text": "booyakasha",
            "entities": {}
        }"#;
        let message: DirectMessage = serde_json::from_str(payload).expect("dm");
        assert_eq!(message.sender_screen_name, "alice");
        assert_eq!(message.created_at.as_deref(), Some("Mon Aug 27 17:21:03 +0000 2012"));
    }

    #[test]
    fn vendor_errors_map_to_taxonomy() {
        let auth = error_from_response(401, r#"{"errors":[{"code":32,"message":"Could not authenticate you."}]}"#);
        assert!(matches!(auth, ApiError::Authentication(message) if message == "Could not authenticate you."));

        let bad_token = error_from_response(400, r#"{"errors":[{"code":215,"message":"Bad Authentication data."}]}"#);
        assert!(matches!(bad_token, ApiError::Authentication(_)));

        let missing = error_from_response(404, r#"{"errors":[{"code":34,"message":"Sorry, that page does not exist"}]}"#);
        assert!(matches!(missing, ApiError::NotFound(_)));

        let rate = error_from_response(429, r#"{"errors":[{"code":88,"message":"Rate limit exceeded"}]}"#);
        assert!(matches!(rate, ApiError::Api { code: 88, .. }));

        assert!(matches!(error_from_response(502, "<html>"), ApiError::Status(502)));
        assert!(matches!(error_from_response(401, ""), ApiError::Authentication(_)));
    }

    #[test]
    fn blank_or_oversized_text_is_rejected() {
        assert!(matches!(validate_text("  \n"), Err(ApiError::InvalidMessage(_))));
        let long = "a".repeat(MAX_MESSAGE_CHARS + 1);
        assert!(matches!(validate_text(&long), Err(ApiError::InvalidMessage(_))));
        assert!(validate_text("hello").is_ok());
    }

    #[test]
    fn target_strips_leading_at() {
        assert_eq!(
            DmTarget::ScreenName("@alice".to_string()).to_pair(),
            ("screen_name", "alice".to_string())
        );
        assert_eq!(DmTarget::UserId(42).to_pair(), ("user_id", "42".to_string()));
    }

    #[tokio::test]
    async fn friends_pages_accumulate_without_placeholder() {
        let cursors = RefCell::new(Vec::new());
        let friends = collect_friends(|cursor| {
            cursors.borrow_mut().push(cursor);
            let page = match cursor {
                -1 => FriendsPage {
                    users: vec![user(1, "a"), user(2, "b")],
                    next_cursor: 55,
                },
                55 => FriendsPage {
                    users: vec![user(3, "c")],
                    next_cursor: 0,
                },
                other => panic!("unexpected cursor {other}"),
            };
            async move { Ok(page) }
        })
        .await
        .expect("friends");

        assert_eq!(*cursors.borrow(), vec![-1, 55]);
        let names: Vec<_> = friends.iter().map(|user| user.screen_name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn friends_page_error_propagates() {
        let result = collect_friends(|_| async { Err(ApiError::Status(503)) }).await;
        assert!(matches!(result, Err(ApiError::Status(503))));
    }
}
