//! [`StorageRef`] over the Firebase Realtime Database REST API.
//!
//! The document store is natively hierarchical, so no strategy chain is
//! involved: every path maps to one URL,
//! `{base_url}/{jobId}/<segments>.json?auth=<secret>`.
//!
//! | Operation | HTTP |
//! |-----------|------|
//! | `push` | `POST` (the store assigns a child key) |
//! | `set` | `PUT` |
//! | `update` | `PATCH` for objects, `PUT` for scalars |
//! | `get` / `get_hash` | `GET` |
//! | `children` | `GET ?shallow=true` |
//! | `remove` | `DELETE` |
//!
//! Authentication is a one-time handshake owned by [`FirebaseClient`]. Every
//! reference under a root shares the client, so opening several tasks on one
//! client authenticates once.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use tokio::sync::OnceCell;
use url::Url;

use crate::store::backend::StorageError;
use crate::store::{extend_path, StorageRef, WatchCallback, WatchRegistry, WriteReceipt};

/// Shared HTTP client for one Firebase database.
#[derive(Debug)]
pub struct FirebaseClient {
    http: reqwest::Client,
    base_url: Url,
    secret: String,
    authenticated: OnceCell<()>,
}

impl FirebaseClient {
    /// Creates a client for the database at `base_url`.
    ///
    /// # Errors
    ///
    /// [`StorageError::Backend`] if `base_url` is not an absolute http(s) URL.
    pub fn new(base_url: &str, secret: impl Into<String>) -> Result<Arc<Self>, StorageError> {
        Self::with_http(reqwest::Client::new(), base_url, secret)
    }

    /// Creates a client reusing an existing [`reqwest::Client`].
    ///
    /// # Errors
    ///
    /// [`StorageError::Backend`] if `base_url` is not an absolute http(s) URL.
    pub fn with_http(
        http: reqwest::Client,
        base_url: &str,
        secret: impl Into<String>,
    ) -> Result<Arc<Self>, StorageError> {
        let base_url = Url::parse(base_url).map_err(|e| StorageError::Backend {
            message: format!("invalid firebase url {base_url}: {e}"),
            source: Some(Box::new(e)),
        })?;
        if base_url.cannot_be_a_base() || !matches!(base_url.scheme(), "http" | "https") {
            return Err(StorageError::Backend {
                message: format!("firebase url must be http(s): {base_url}"),
                source: None,
            });
        }
        Ok(Arc::new(Self {
            http,
            base_url,
            secret: secret.into(),
            authenticated: OnceCell::new(),
        }))
    }

    /// Base URL of the database.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Whether the handshake has completed.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.initialized()
    }

    /// Performs the authentication handshake once; later calls return
    /// immediately. A failed handshake is retried on the next call.
    ///
    /// # Errors
    ///
    /// [`StorageError::Auth`] when the database rejects the secret.
    pub async fn authenticate(&self) -> Result<(), StorageError> {
        self.authenticated
            .get_or_try_init(|| async {
                let url = self.url(&[], &[("shallow", "true")])?;
                self.send(self.http.get(url.clone()), &url).await?;
                tracing::info!(url = %self.base_url, "authenticated to firebase");
                Ok::<(), StorageError>(())
            })
            .await
            .map(|_| ())
    }

    /// Builds the REST URL of `segments`, with the secret and `extra` query
    /// pairs.
    fn url(&self, segments: &[String], extra: &[(&str, &str)]) -> Result<Url, StorageError> {
        let mut url = self.base_url.clone();
        {
            let mut path = url.path_segments_mut().map_err(|()| StorageError::Backend {
                message: format!("firebase url cannot carry a path: {}", self.base_url),
                source: None,
            })?;
            path.pop_if_empty();
            match segments.split_last() {
                Some((last, parents)) => {
                    path.extend(parents);
                    path.push(&format!("{last}.json"));
                },
                None => {
                    path.push(".json");
                },
            }
        }
        {
            let mut query = url.query_pairs_mut();
            for (name, value) in extra {
                query.append_pair(name, value);
            }
            query.append_pair("auth", &self.secret);
        }
        Ok(url)
    }

    /// Opaque reference of `segments`: the resource URL without extension or
    /// credentials.
    fn reference(&self, segments: &[String]) -> String {
        let base = self.base_url.as_str().trim_end_matches('/');
        if segments.is_empty() {
            return format!("{base}/");
        }
        format!("{base}/{}", segments.join("/"))
    }

    async fn send(&self, request: RequestBuilder, url: &Url) -> Result<Response, StorageError> {
        let response = request.send().await.map_err(|e| map_http_error(e, url))?;
        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(StorageError::Auth {
                message: format!("firebase rejected credentials for {}", redact(url)),
            }),
            StatusCode::NOT_FOUND => Err(StorageError::NotFound {
                key: redact(url),
            }),
            status => Err(StorageError::Backend {
                message: format!("firebase returned {status} for {}", redact(url)),
                source: None,
            }),
        }
    }

    async fn request(
        &self,
        method: Method,
        segments: &[String],
        extra: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<Value, StorageError> {
        self.authenticate().await?;
        let url = self.url(segments, extra)?;
        let mut request = self.http.request(method.clone(), url.clone());
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = self.send(request, &url).await?;
        let text = response.text().await.map_err(|e| map_http_error(e, &url))?;
        tracing::debug!(%method, url = %redact(&url), "firebase request");
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }
}

/// URL without its query string, safe to log.
fn redact(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}

fn map_http_error(err: reqwest::Error, url: &Url) -> StorageError {
    StorageError::Backend {
        message: format!("firebase request to {} failed: {err}", redact(url)),
        source: Some(Box::new(err)),
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug)]
struct DocumentContext {
    client: Arc<FirebaseClient>,
    watchers: WatchRegistry,
}

/// A path-scoped reference into one job's document tree.
#[derive(Debug, Clone)]
pub struct DocumentRef {
    ctx: Arc<DocumentContext>,
    job_id: String,
    path: Vec<String>,
}

impl DocumentRef {
    /// Root reference of job `job_id`.
    pub fn root(client: Arc<FirebaseClient>, job_id: impl Into<String>) -> Self {
        Self {
            ctx: Arc::new(DocumentContext {
                client,
                watchers: WatchRegistry::new(),
            }),
            job_id: job_id.into(),
            path: Vec::new(),
        }
    }

    /// The shared client.
    pub fn client(&self) -> &Arc<FirebaseClient> {
        &self.ctx.client
    }

    fn segments(&self) -> Vec<String> {
        let mut segments = Vec::with_capacity(self.path.len() + 1);
        segments.push(self.job_id.clone());
        segments.extend_from_slice(&self.path);
        segments
    }

    async fn write(&self, method: Method, value: Value) -> Result<WriteReceipt, StorageError> {
        self.ctx
            .client
            .request(method, &self.segments(), &[], Some(&value))
            .await?;
        let slot = self.slot();
        self.ctx.watchers.notify(&slot, &value).await;
        Ok(WriteReceipt::unsequenced(slot))
    }
}

impl std::fmt::Display for DocumentRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reference())
    }
}

#[async_trait]
impl StorageRef for DocumentRef {
    fn child(&self, name: &str) -> Arc<dyn StorageRef> {
        Arc::new(Self {
            ctx: Arc::clone(&self.ctx),
            job_id: self.job_id.clone(),
            path: extend_path(&self.path, name),
        })
    }

    fn path(&self) -> &[String] {
        &self.path
    }

    async fn push(&self, value: Value) -> Result<WriteReceipt, StorageError> {
        let created = self
            .ctx
            .client
            .request(Method::POST, &self.segments(), &[], Some(&value))
            .await?;
        if let Some(name) = created.get("name").and_then(Value::as_str) {
            tracing::debug!(slot = %self.slot(), key = name, "pushed document child");
        }
        let slot = self.slot();
        self.ctx.watchers.notify(&slot, &value).await;
        Ok(WriteReceipt::unsequenced(slot))
    }

    async fn set(&self, value: Value) -> Result<WriteReceipt, StorageError> {
        self.write(Method::PUT, value).await
    }

    async fn update(&self, value: Value) -> Result<WriteReceipt, StorageError> {
        let method = if value.is_object() {
            Method::PATCH
        } else {
            Method::PUT
        };
        self.write(method, value).await
    }

    fn watch(&self, callback: WatchCallback) {
        self.ctx.watchers.register(self.slot(), callback);
    }

    fn unwatch(&self) {
        self.ctx.watchers.clear(&self.slot());
    }

    fn reference(&self) -> String {
        self.ctx.client.reference(&self.segments())
    }

    async fn get_hash(&self) -> Result<HashMap<String, String>, StorageError> {
        match self.get().await? {
            Some(Value::Object(map)) => Ok(map
                .iter()
                .map(|(field, value)| (field.clone(), stringify(value)))
                .collect()),
            _ => Ok(HashMap::new()),
        }
    }

    async fn children(&self) -> Result<Vec<Arc<dyn StorageRef>>, StorageError> {
        let shallow = self
            .ctx
            .client
            .request(Method::GET, &self.segments(), &[("shallow", "true")], None)
            .await?;
        let Value::Object(keys) = shallow else {
            return Ok(Vec::new());
        };
        let mut names: Vec<&String> = keys.keys().collect();
        names.sort();
        Ok(names.into_iter().map(|name| self.child(name)).collect())
    }

    async fn get(&self) -> Result<Option<Value>, StorageError> {
        let value = self
            .ctx
            .client
            .request(Method::GET, &self.segments(), &[], None)
            .await?;
        Ok((!value.is_null()).then_some(value))
    }

    async fn remove(&self) -> Result<(), StorageError> {
        self.ctx
            .client
            .request(Method::DELETE, &self.segments(), &[], None)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn urls_carry_job_path_and_secret() {
        let client = FirebaseClient::new("https://db.example.com/", "s3cret").unwrap();
        let segments = vec!["J".to_string(), "steps".to_string(), "build".to_string()];
        let url = client.url(&segments, &[("shallow", "true")]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://db.example.com/J/steps/build.json?shallow=true&auth=s3cret"
        );
        assert_eq!(
            client.url(&[], &[]).unwrap().as_str(),
            "https://db.example.com/.json?auth=s3cret"
        );
    }

    #[test]
    fn reference_omits_credentials() {
        let client = FirebaseClient::new("https://db.example.com/logs/", "s3cret").unwrap();
        let step = DocumentRef::root(client, "J").child("steps").child("build");
        assert_eq!(step.reference(), "https://db.example.com/logs/J/steps/build");
    }

    #[test]
    fn rejects_non_http_urls() {
        assert!(FirebaseClient::new("mailto:someone@example.com", "s").is_err());
        assert!(FirebaseClient::new("not a url", "s").is_err());
    }
}
