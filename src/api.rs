//! REST side of the Gotify server: message paging, application directory,
//! deletes and a connectivity check.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Duration,
};

use base64::Engine as _;
use tracing::{debug, warn};

use crate::{
    consts::{
        APP_ICON_MAX_BYTES, AUTH_HEADER, MAX_API_PAGE_LIMIT, PREVIEW_REQUEST_TIMEOUT_SECS,
        REST_REQUEST_TIMEOUT_SECS,
    },
    error::{Error, Result},
    model::{
        ApplicationMeta, GotifyApplicationWire, GotifyMessageListWire, GotifyMessageWire, Message,
    },
    settings::normalize_base_url,
    util::{read_limited_body, truncate_message},
};

const ICON_MAX_REDIRECTS: usize = 5;

/// Application names and icons by app id, shared between the sync and the stream.
#[derive(Debug, Clone, Default)]
pub struct AppDirectory {
    inner: Arc<RwLock<HashMap<i64, ApplicationMeta>>>,
}

impl AppDirectory {
    pub fn replace(&self, next: HashMap<i64, ApplicationMeta>) {
        match self.inner.write() {
            Ok(mut map) => *map = next,
            Err(_) => warn!("application map lock poisoned, directory not updated"),
        }
    }

    pub fn get(&self, app_id: i64) -> Option<ApplicationMeta> {
        self.inner
            .read()
            .ok()
            .and_then(|map| map.get(&app_id).cloned())
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn convert(&self, wire: GotifyMessageWire) -> Message {
        let meta = self.get(wire.appid);
        wire.into_message(meta.as_ref())
    }

    /// Decodes one stream frame into a cached-message shape.
    pub fn parse_stream_message(&self, text: &str) -> Result<Message> {
        serde_json::from_str::<GotifyMessageWire>(text)
            .map(|wire| self.convert(wire))
            .map_err(|error| {
                Error::Protocol(format!(
                    "stream decode failed: {error} payload={}",
                    truncate_message(text, 140)
                ))
            })
    }
}

#[derive(Debug, Clone)]
pub struct GotifyClient {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

impl GotifyClient {
    pub fn new(base_url: &str, token: &str) -> Result<Self> {
        let token = token.trim();
        if token.is_empty() {
            return Err(Error::Credential(
                "No token found. Save token in settings first.".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REST_REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|error| Error::Transport(format!("Failed to build HTTP client: {error}")))?;
        Ok(Self {
            base_url: normalize_base_url(base_url)?,
            token: token.to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Newest-first page walk, at most `limit` messages in total.
    pub async fn fetch_recent_messages(
        &self,
        limit: usize,
        directory: &AppDirectory,
    ) -> Result<Vec<Message>> {
        let mut fresh = Vec::new();
        let mut since: Option<i64> = None;

        while fresh.len() < limit {
            let page_limit = limit.saturating_sub(fresh.len()).min(MAX_API_PAGE_LIMIT);
            if page_limit == 0 {
                break;
            }

            let mut endpoint = format!("{}/message?limit={page_limit}", self.base_url);
            if let Some(cursor) = since {
                endpoint.push_str(&format!("&since={cursor}"));
            }

            let response = self
                .http
                .get(endpoint)
                .header(AUTH_HEADER, &self.token)
                .send()
                .await
                .map_err(|error| {
                    Error::Transport(format!("Failed to fetch recent messages: {error}"))
                })?;
            let response = check_status(response).await?;
            let page = response
                .json::<GotifyMessageListWire>()
                .await
                .map_err(|error| {
                    Error::Protocol(format!("Failed to decode recent messages: {error}"))
                })?;

            if page.messages.is_empty() {
                break;
            }

            let mut min_id_in_page: Option<i64> = None;
            let mut page_count = 0usize;
            for item in page.messages {
                min_id_in_page = Some(min_id_in_page.map_or(item.id, |min_id| min_id.min(item.id)));
                fresh.push(directory.convert(item));
                page_count = page_count.saturating_add(1);
                if fresh.len() >= limit {
                    break;
                }
            }

            match min_id_in_page {
                Some(min_id) if since != Some(min_id) => since = Some(min_id),
                _ => break,
            }
            if page_count < page_limit {
                break;
            }
        }

        debug!(count = fresh.len(), "recent messages fetched");
        Ok(fresh)
    }

    pub async fn fetch_applications(&self) -> Result<HashMap<i64, ApplicationMeta>> {
        let endpoint = format!("{}/application", self.base_url);
        let response = self
            .http
            .get(endpoint)
            .header(AUTH_HEADER, &self.token)
            .send()
            .await
            .map_err(|error| Error::Transport(format!("Failed to fetch applications: {error}")))?;
        let response = check_status(response).await?;
        let apps = response
            .json::<Vec<GotifyApplicationWire>>()
            .await
            .map_err(|error| Error::Protocol(format!("Failed to decode applications: {error}")))?;

        // icons may carry the token, so redirects never leave the origin
        let icon_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(PREVIEW_REQUEST_TIMEOUT_SECS))
            .redirect(reqwest::redirect::Policy::custom(|attempt| {
                let same_origin = attempt
                    .previous()
                    .first()
                    .is_some_and(|first| first.origin() == attempt.url().origin());
                if same_origin && attempt.previous().len() <= ICON_MAX_REDIRECTS {
                    attempt.follow()
                } else {
                    attempt.stop()
                }
            }))
            .build()
            .map_err(|error| {
                Error::Transport(format!("Failed to build icon HTTP client: {error}"))
            })?;

        let mut directory = HashMap::with_capacity(apps.len());
        for app in apps {
            let icon_url = match self.application_icon_data_url(&icon_client, &app.image).await {
                Ok(icon_url) => icon_url,
                Err(error) => {
                    debug!(
                        app_id = app.id,
                        name = %truncate_message(&app.name, 48),
                        %error,
                        "failed to fetch application icon"
                    );
                    String::new()
                }
            };
            directory.insert(
                app.id,
                ApplicationMeta {
                    name: app.name,
                    icon_url,
                },
            );
        }
        Ok(directory)
    }

    /// 2xx and 404 both count as "gone on the server".
    pub async fn delete_message(&self, message_id: i64) -> Result<()> {
        if message_id <= 0 {
            return Err(Error::Config("Invalid message id".to_string()));
        }
        let endpoint = format!("{}/message/{message_id}", self.base_url);
        let url = reqwest::Url::parse(&endpoint)
            .map_err(|error| Error::Config(format!("Invalid delete URL: {error}")))?;
        let response = self
            .http
            .delete(url)
            .header(AUTH_HEADER, &self.token)
            .send()
            .await
            .map_err(|error| {
                Error::Transport(format!("Failed to delete message {message_id}: {error}"))
            })?;

        let status = response.status().as_u16();
        debug!(message_id, status, "delete_message response");
        if status == 404 {
            return Ok(());
        }
        check_status(response).await.map(|_| ())
    }

    pub async fn test_connection(&self) -> Result<String> {
        let endpoint = format!("{}/application", self.base_url);
        let response = self
            .http
            .get(&endpoint)
            .header(AUTH_HEADER, &self.token)
            .send()
            .await
            .map_err(|error| Error::Transport(format!("Connection request failed: {error}")))?;
        check_status(response).await?;
        Ok("Connection successful".to_string())
    }

    async fn application_icon_data_url(
        &self,
        client: &reqwest::Client,
        image_path: &str,
    ) -> Result<String> {
        let image_url = resolve_application_image_url(&self.base_url, image_path)?;
        if image_url.is_empty() {
            return Ok(String::new());
        }

        let image_url = reqwest::Url::parse(&image_url)
            .map_err(|error| Error::Config(format!("Invalid application image URL: {error}")))?;
        let mut request = client.get(image_url.clone());
        if same_origin(&self.base_url, &image_url) {
            request = request.header(AUTH_HEADER, &self.token);
        } else {
            debug!(
                host = image_url.host_str().unwrap_or(""),
                "icon on another origin, fetching without token"
            );
        }
        let response = request
            .send()
            .await
            .map_err(|error| Error::Transport(format!("Application icon request failed: {error}")))?;
        if !response.status().is_success() {
            return Err(Error::Http {
                status: response.status().as_u16(),
                body: "application icon".to_string(),
            });
        }

        if let Some(content_length) = response.content_length() {
            if content_length > APP_ICON_MAX_BYTES as u64 {
                return Err(Error::Policy(format!(
                    "Application icon too large ({content_length} bytes > {APP_ICON_MAX_BYTES})"
                )));
            }
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("image/png")
            .to_ascii_lowercase();
        if !content_type.starts_with("image/") {
            return Err(Error::Protocol(format!(
                "Application icon response is not an image ({content_type})"
            )));
        }

        let bytes = read_limited_body(response, APP_ICON_MAX_BYTES, "Application icon").await?;
        if bytes.is_empty() {
            return Ok(String::new());
        }

        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        Ok(format!("data:{content_type};base64,{encoded}"))
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let code = status.as_u16();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<unable to read response body>".to_string());
    let body = truncate_message(&body, 200);
    if code == 401 || code == 403 {
        return Err(Error::Credential(format!(
            "Server rejected the token (HTTP {code}): {body}"
        )));
    }
    Err(Error::Http { status: code, body })
}

fn same_origin(base_url: &str, target: &reqwest::Url) -> bool {
    reqwest::Url::parse(base_url).is_ok_and(|base| base.origin() == target.origin())
}

pub fn resolve_application_image_url(base_url: &str, image_path: &str) -> Result<String> {
    if image_path.trim().is_empty() {
        return Ok(String::new());
    }

    // Url::join replaces the last path segment unless the base ends with '/'
    let base = reqwest::Url::parse(&format!("{}/", base_url.trim_end_matches('/')))
        .map_err(|error| Error::Config(format!("Invalid server URL: {error}")))?;
    let joined = base.join(image_path.trim_start_matches('/')).map_err(|error| {
        Error::Config(format!("Failed to resolve application image path: {error}"))
    })?;
    Ok(joined.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{
        matchers::{header, method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    fn wire(id: i64) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "appid": 1,
            "message": format!("body {id}"),
            "title": format!("title {id}"),
            "priority": 5,
            "date": "2026-01-01T00:00:00Z",
        })
    }

    #[test]
    fn image_url_resolution_keeps_sub_path() {
        assert_eq!(
            resolve_application_image_url("https://push.example.com/gotify", "image/app.png")
                .unwrap(),
            "https://push.example.com/gotify/image/app.png"
        );
        assert_eq!(
            resolve_application_image_url("https://push.example.com", "").unwrap(),
            ""
        );
    }

    #[test]
    fn client_requires_token() {
        assert!(matches!(
            GotifyClient::new("https://push.example.com", "  "),
            Err(Error::Credential(_))
        ));
    }

    #[test]
    fn malformed_stream_frame_is_a_protocol_error() {
        let directory = AppDirectory::default();
        assert!(matches!(
            directory.parse_stream_message("{\"hello\":1}"),
            Err(Error::Protocol(_))
        ));
        let message = directory
            .parse_stream_message(&wire(4).to_string())
            .unwrap();
        assert_eq!(message.id, 4);
        assert_eq!(message.app_name, "app:1");
    }

    #[tokio::test]
    async fn pages_with_since_cursor_until_short_page() {
        let server = MockServer::start().await;
        let first_page: Vec<serde_json::Value> = (101..=300).rev().map(wire).collect();
        Mock::given(method("GET"))
            .and(path("/message"))
            .and(query_param("limit", "200"))
            .and(header(AUTH_HEADER, "tok"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "messages": first_page })),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/message"))
            .and(query_param("limit", "50"))
            .and(query_param("since", "101"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "messages": [wire(100), wire(99)]
            })))
            .mount(&server)
            .await;

        let client = GotifyClient::new(&server.uri(), "tok").unwrap();
        let messages = client
            .fetch_recent_messages(250, &AppDirectory::default())
            .await
            .unwrap();
        assert_eq!(messages.len(), 202);
        assert_eq!(messages.first().map(|m| m.id), Some(300));
        assert_eq!(messages.last().map(|m| m.id), Some(99));
    }

    #[tokio::test]
    async fn fetch_stops_at_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/message"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "messages": [wire(3), wire(2), wire(1)]
            })))
            .mount(&server)
            .await;

        let client = GotifyClient::new(&server.uri(), "tok").unwrap();
        let messages = client
            .fetch_recent_messages(2, &AppDirectory::default())
            .await
            .unwrap();
        let ids: Vec<i64> = messages.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![3, 2]);
    }

    #[tokio::test]
    async fn unauthorized_is_a_credential_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/application"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad token"))
            .mount(&server)
            .await;

        let client = GotifyClient::new(&server.uri(), "tok").unwrap();
        assert!(matches!(
            client.test_connection().await,
            Err(Error::Credential(_))
        ));
    }

    #[tokio::test]
    async fn delete_treats_missing_as_done() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/message/5"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/message/6"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let client = GotifyClient::new(&server.uri(), "tok").unwrap();
        client.delete_message(5).await.unwrap();
        match client.delete_message(6).await {
            Err(Error::Http { status, body }) => {
                assert_eq!(status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(matches!(client.delete_message(0).await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn applications_inline_icons() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/application"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"id": 1, "name": "Backups", "image": "image/one.png"},
                {"id": 2, "name": "Alerts", "image": ""}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/image/one.png"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/png")
                    .set_body_bytes(vec![1u8, 2, 3]),
            )
            .mount(&server)
            .await;

        let client = GotifyClient::new(&server.uri(), "tok").unwrap();
        let apps = client.fetch_applications().await.unwrap();
        assert_eq!(apps[&1].name, "Backups");
        assert_eq!(apps[&1].icon_url, "data:image/png;base64,AQID");
        assert_eq!(apps[&2].icon_url, "");

        let directory = AppDirectory::default();
        directory.replace(apps);
        let message = directory.parse_stream_message(&wire(3).to_string()).unwrap();
        assert_eq!(message.app_name, "Backups");
        assert!(message.app_icon_url.is_some());
    }

    #[tokio::test]
    async fn icon_on_another_origin_gets_no_token() {
        let server = MockServer::start().await;
        let elsewhere = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/application"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"id": 1, "name": "Mirror", "image": format!("{}/logo.png", elsewhere.uri())}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/logo.png"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/png")
                    .set_body_bytes(vec![9u8]),
            )
            .mount(&elsewhere)
            .await;

        let client = GotifyClient::new(&server.uri(), "tok").unwrap();
        let apps = client.fetch_applications().await.unwrap();
        assert_eq!(apps[&1].icon_url, "data:image/png;base64,CQ==");

        let requests = elsewhere.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert!(!requests[0]
            .headers
            .contains_key(AUTH_HEADER.to_ascii_lowercase().as_str()));
    }

    #[tokio::test]
    async fn oversized_icon_is_dropped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/application"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"id": 1, "name": "Huge", "image": "image/huge.png"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/image/huge.png"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/png")
                    .set_body_bytes(vec![0u8; APP_ICON_MAX_BYTES + 1]),
            )
            .mount(&server)
            .await;

        let client = GotifyClient::new(&server.uri(), "tok").unwrap();
        let apps = client.fetch_applications().await.unwrap();
        assert_eq!(apps[&1].name, "Huge");
        assert_eq!(apps[&1].icon_url, "");
    }

    #[test]
    fn origin_check_compares_scheme_host_and_port() {
        let base = "https://push.example.com";
        let check = |url: &str| same_origin(base, &reqwest::Url::parse(url).unwrap());
        assert!(check("https://push.example.com/image/a.png"));
        assert!(!check("https://cdn.example.com/a.png"));
        assert!(!check("http://push.example.com/a.png"));
        assert!(!check("https://push.example.com:8443/a.png"));
    }
}
