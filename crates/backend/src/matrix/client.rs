use std::time::{Duration, Instant};

use async_trait::async_trait;
use mxindex_core::MatrixConfig;
use reqwest::{Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, error, info, trace, warn};

use super::{HistoryPage, MessageSource, SourceError, SyncBatch, parse_joined_rooms, parse_messages, parse_sync};

/// Slack added on top of the sync long-poll before the HTTP request is abandoned
const SYNC_TIMEOUT_SLACK: Duration = Duration::from_secs(15);

/// Timeout for ordinary (non long-poll) requests
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Matrix error codes that mean the credentials are no good
const AUTH_ERRCODES: &[&str] = &["M_UNKNOWN_TOKEN", "M_MISSING_TOKEN", "M_FORBIDDEN", "M_USER_DEACTIVATED"];

#[derive(Debug, Deserialize)]
struct LoginResponse {
  access_token: String,
  user_id: String,
  device_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WhoAmIResponse {
  user_id: String,
}

#[derive(Debug, Deserialize, Default)]
struct MatrixErrorBody {
  #[serde(default)]
  errcode: String,
  #[serde(default)]
  error: String,
}

/// Whether a failed request speaks for the whole account or just itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
  Account,
  Request,
}

/// Authenticated Matrix client-server API client
#[derive(Debug, Clone)]
pub struct MatrixClient {
  http: reqwest::Client,
  homeserver: Url,
  access_token: String,
  user_id: String,
}

impl MatrixClient {
  /// Authenticate against the homeserver.
  ///
  /// A configured access token is validated with `whoami`; otherwise a
  /// password login is performed. Rejected credentials return
  /// [`SourceError::Auth`].
  pub async fn connect(config: &MatrixConfig) -> Result<Self, SourceError> {
    let homeserver = Url::parse(&config.homeserver)
      .map_err(|e| SourceError::Auth(format!("invalid homeserver URL {:?}: {}", config.homeserver, e)))?;
    let http = reqwest::Client::new();

    let mut client = Self {
      http,
      homeserver,
      access_token: String::new(),
      user_id: config.user_id.clone(),
    };

    if let Some(token) = config.access_token.as_deref().filter(|t| !t.is_empty()) {
      client.access_token = token.to_string();
      let url = client.endpoint(&["account", "whoami"])?;
      let body = client.send(Method::GET, url, None, REQUEST_TIMEOUT, Scope::Account).await?;
      let whoami: WhoAmIResponse =
        serde_json::from_value(body).map_err(|e| SourceError::Protocol(format!("whoami response: {}", e)))?;
      client.user_id = whoami.user_id;
      info!(user_id = %client.user_id, "Authenticated with access token");
      return Ok(client);
    }

    let Some(password) = config.password.as_deref() else {
      return Err(SourceError::Auth("no password or access token configured".into()));
    };

    let request = json!({
      "type": "m.login.password",
      "identifier": { "type": "m.id.user", "user": config.user_id },
      "password": password,
      "device_id": config.device_id,
      "initial_device_display_name": config.device_name,
    });
    let url = client.endpoint(&["login"])?;
    let body = client
      .send(Method::POST, url, Some(request), REQUEST_TIMEOUT, Scope::Account)
      .await?;
    let login: LoginResponse =
      serde_json::from_value(body).map_err(|e| SourceError::Protocol(format!("login response: {}", e)))?;

    client.access_token = login.access_token;
    client.user_id = login.user_id;
    info!(
      user_id = %client.user_id,
      device_id = login.device_id.as_deref().unwrap_or(""),
      "Logged in"
    );
    Ok(client)
  }

  pub fn user_id(&self) -> &str {
    &self.user_id
  }

  /// `{homeserver}/_matrix/client/v3/{segments...}` with each segment percent-encoded
  fn endpoint(&self, segments: &[&str]) -> Result<Url, SourceError> {
    let mut url = self.homeserver.clone();
    url
      .path_segments_mut()
      .map_err(|_| SourceError::Protocol(format!("homeserver URL cannot be a base: {}", self.homeserver)))?
      .pop_if_empty()
      .extend(["_matrix", "client", "v3"])
      .extend(segments);
    Ok(url)
  }

  async fn send(
    &self,
    method: Method,
    url: Url,
    body: Option<Value>,
    timeout: Duration,
    scope: Scope,
  ) -> Result<Value, SourceError> {
    let start = Instant::now();
    let path = url.path().to_string();

    let mut request = self.http.request(method, url).timeout(timeout);
    if !self.access_token.is_empty() {
      request = request.bearer_auth(&self.access_token);
    }
    if let Some(body) = body {
      request = request.json(&body);
    }

    let response = match request.send().await {
      Ok(resp) => resp,
      Err(e) => {
        if e.is_timeout() {
          debug!(path = %path, "Request timed out");
          return Err(SourceError::Timeout);
        }
        warn!(path = %path, err = %e, "Network error");
        return Err(SourceError::Network(e.to_string()));
      }
    };

    let status = response.status();
    trace!(
      path = %path,
      status = %status,
      elapsed_ms = start.elapsed().as_millis() as u64,
      "Received response"
    );

    if !status.is_success() {
      let text = response.text().await.unwrap_or_default();
      let err_body: MatrixErrorBody = serde_json::from_str(&text).unwrap_or_default();
      return Err(classify(status, &err_body, scope));
    }

    response
      .json::<Value>()
      .await
      .map_err(|e| SourceError::Protocol(format!("undecodable body from {}: {}", path, e)))
  }
}

fn classify(status: StatusCode, body: &MatrixErrorBody, scope: Scope) -> SourceError {
  let message = if body.error.is_empty() {
    status.to_string()
  } else {
    format!("{}: {}", body.errcode, body.error)
  };

  let code = status.as_u16();
  let auth_errcode = AUTH_ERRCODES.contains(&body.errcode.as_str());

  if code == 401 || (scope == Scope::Account && (code == 403 || auth_errcode)) {
    error!(status = code, errcode = %body.errcode, "Homeserver rejected credentials");
    return SourceError::Auth(message);
  }
  if code == 429 || code >= 500 {
    return SourceError::Server { status: code, message };
  }
  SourceError::Rejected(message)
}

#[async_trait]
impl MessageSource for MatrixClient {
  async fn next_batch(&self, since: Option<&str>, timeout: Duration) -> Result<SyncBatch, SourceError> {
    let mut url = self.endpoint(&["sync"])?;
    {
      let mut query = url.query_pairs_mut();
      query.append_pair("timeout", &timeout.as_millis().to_string());
      if let Some(since) = since {
        query.append_pair("since", since);
      }
    }

    let body = self
      .send(Method::GET, url, None, timeout + SYNC_TIMEOUT_SLACK, Scope::Account)
      .await?;
    let batch = parse_sync(body)?;
    trace!(
      since = since.unwrap_or(""),
      next = %batch.next_token,
      sources = batch.sources.len(),
      events = batch.event_count(),
      "Sync response"
    );
    Ok(batch)
  }

  async fn history(&self, source_id: &str, before: Option<&str>, limit: usize) -> Result<HistoryPage, SourceError> {
    let mut url = self.endpoint(&["rooms", source_id, "messages"])?;
    {
      let mut query = url.query_pairs_mut();
      query.append_pair("dir", "b");
      query.append_pair("limit", &limit.to_string());
      if let Some(before) = before {
        query.append_pair("from", before);
      }
    }

    let body = self
      .send(Method::GET, url, None, REQUEST_TIMEOUT, Scope::Request)
      .await?;
    parse_messages(body)
  }

  async fn joined_sources(&self) -> Result<Vec<String>, SourceError> {
    let url = self.endpoint(&["joined_rooms"])?;
    let body = self.send(Method::GET, url, None, REQUEST_TIMEOUT, Scope::Account).await?;
    parse_joined_rooms(body)
  }
}
