//! # Registry Push Plumbing
//!
//! Image reference parsing, the credential and transport seams the
//! exporter pushes through, and a default HTTP transport speaking the
//! distribution v2 protocol.
//!
//! ## Pluggability
//!
//! The engine never constructs its network stack internally: the
//! exporter takes any [`RegistryTransport`], and [`HttpTransport`] is
//! only the batteries-included implementation. Credentials come from a
//! caller-supplied [`CredentialSource`] keyed by registry host.
//!
//! ## Retry Classification
//!
//! Transport failures are split into [`TransportError::Transient`]
//! (connection-level failures, HTTP 5xx) and
//! [`TransportError::Fatal`] (everything else). Only transient
//! failures are retried, a bounded number of times with exponential
//! backoff; see [`with_retry`].

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::storage::Digest;

// =============================================================================
// Image References
// =============================================================================

/// A parsed image reference: `registry/repository[:tag]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// Registry host (and optional port).
    pub registry: String,
    /// Repository path within the registry.
    pub repository: String,
    /// Tag; defaults to `latest`.
    pub tag: String,
}

impl Reference {
    /// Parses an image reference.
    ///
    /// The first path segment must name a registry host (contain a `.`,
    /// a `:`, or be `localhost`); the engine pushes to explicit
    /// registries only and does not apply default-registry rules.
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::InvalidReference {
                reference: s.to_string(),
                reason: "empty reference".to_string(),
            });
        }
        if !s.chars().all(|c| {
            c.is_ascii_alphanumeric()
                || c == '/'
                || c == ':'
                || c == '.'
                || c == '-'
                || c == '_'
        }) {
            return Err(Error::InvalidReference {
                reference: s.to_string(),
                reason: "contains invalid characters".to_string(),
            });
        }

        let (registry, rest) = s.split_once('/').ok_or_else(|| Error::InvalidReference {
            reference: s.to_string(),
            reason: "missing registry host".to_string(),
        })?;
        if !registry.contains('.') && !registry.contains(':') && registry != "localhost" {
            return Err(Error::InvalidReference {
                reference: s.to_string(),
                reason: format!("'{}' does not look like a registry host", registry),
            });
        }

        let (repository, tag) = match rest.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') => (repo.to_string(), tag.to_string()),
            _ => (rest.to_string(), "latest".to_string()),
        };
        if repository.is_empty() {
            return Err(Error::InvalidReference {
                reference: s.to_string(),
                reason: "empty repository".to_string(),
            });
        }

        Ok(Self {
            registry: registry.to_string(),
            repository,
            tag,
        })
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.repository, self.tag)
    }
}

// =============================================================================
// Credentials
// =============================================================================

/// Basic-auth credentials for one registry.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Supplies credentials per registry host.
///
/// Implemented by the caller (e.g. backed by a keychain or a docker
/// config file); `None` means push anonymously.
pub trait CredentialSource: Send + Sync {
    /// Returns credentials for `registry`, if any.
    fn credentials(&self, registry: &str) -> Option<Credentials>;
}

/// A source that always pushes anonymously.
pub struct Anonymous;

impl CredentialSource for Anonymous {
    fn credentials(&self, _registry: &str) -> Option<Credentials> {
        None
    }
}

/// A fixed set of per-registry credentials.
#[derive(Default)]
pub struct StaticCredentials {
    entries: Vec<(String, Credentials)>,
}

impl StaticCredentials {
    /// Creates an empty credential set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers credentials for a registry host.
    pub fn insert(&mut self, registry: impl Into<String>, credentials: Credentials) {
        self.entries.push((registry.into(), credentials));
    }
}

impl CredentialSource for StaticCredentials {
    fn credentials(&self, registry: &str) -> Option<Credentials> {
        self.entries
            .iter()
            .find(|(host, _)| host == registry)
            .map(|(_, c)| c.clone())
    }
}

// =============================================================================
// Transport
// =============================================================================

/// A transport failure, classified for retry purposes.
#[derive(Debug, Clone)]
pub enum TransportError {
    /// Connection-level or server-side (5xx) failure; retryable.
    Transient(String),
    /// Client-side or protocol failure; never retried.
    Fatal(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Transient(reason) => write!(f, "transient: {}", reason),
            TransportError::Fatal(reason) => write!(f, "{}", reason),
        }
    }
}

/// The pluggable wire seam the exporter pushes through.
#[async_trait]
pub trait RegistryTransport: Send + Sync {
    /// Checks whether the registry already has a blob.
    async fn blob_exists(
        &self,
        reference: &Reference,
        digest: &Digest,
    ) -> std::result::Result<bool, TransportError>;

    /// Uploads one blob.
    async fn upload_blob(
        &self,
        reference: &Reference,
        digest: &Digest,
        content: &[u8],
    ) -> std::result::Result<(), TransportError>;

    /// Uploads a manifest or index document under `target` (a tag or a
    /// digest string).
    async fn put_manifest(
        &self,
        reference: &Reference,
        target: &str,
        media_type: &str,
        content: &[u8],
    ) -> std::result::Result<(), TransportError>;
}

/// Retries `op` on transient failures with exponential backoff.
///
/// The delay doubles per attempt starting from `base_delay`. Fatal
/// errors surface immediately.
pub async fn with_retry<T, F, Fut>(
    mut op: F,
    attempts: u32,
    base_delay: Duration,
) -> std::result::Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, TransportError>>,
{
    let mut delay = base_delay;
    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(TransportError::Fatal(reason)) => return Err(TransportError::Fatal(reason)),
            Err(TransportError::Transient(reason)) => {
                if attempt == attempts {
                    return Err(TransportError::Transient(reason));
                }
                warn!(
                    "transient push failure (attempt {}/{}): {}",
                    attempt, attempts, reason
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
    }
    unreachable!("retry loop always returns")
}

// =============================================================================
// HTTP Transport (distribution v2)
// =============================================================================

/// Default [`RegistryTransport`] over HTTPS.
pub struct HttpTransport {
    client: reqwest::Client,
    credentials: Box<dyn CredentialSource>,
}

impl HttpTransport {
    /// Creates a transport using `credentials` for every request.
    pub fn new(credentials: Box<dyn CredentialSource>) -> Self {
        Self {
            client: reqwest::Client::new(),
            credentials,
        }
    }

    /// Creates a transport over a caller-configured client (custom TLS,
    /// proxies, dialer).
    pub fn with_client(client: reqwest::Client, credentials: Box<dyn CredentialSource>) -> Self {
        Self {
            client,
            credentials,
        }
    }

    fn base_url(&self, reference: &Reference) -> String {
        format!("https://{}/v2/{}", reference.registry, reference.repository)
    }

    fn authorize(&self, request: reqwest::RequestBuilder, registry: &str) -> reqwest::RequestBuilder {
        match self.credentials.credentials(registry) {
            Some(c) => request.basic_auth(c.username, Some(c.password)),
            None => request,
        }
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
    ) -> std::result::Result<reqwest::Response, TransportError> {
        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(TransportError::Transient(format!("registry returned {}", status)));
        }
        Ok(response)
    }
}

#[async_trait]
impl RegistryTransport for HttpTransport {
    async fn blob_exists(
        &self,
        reference: &Reference,
        digest: &Digest,
    ) -> std::result::Result<bool, TransportError> {
        let url = format!("{}/blobs/{}", self.base_url(reference), digest);
        let request = self.authorize(self.client.head(&url), &reference.registry);
        let response = self.send(request).await?;

        match response.status().as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            other => Err(TransportError::Fatal(format!(
                "HEAD {} returned {}",
                url, other
            ))),
        }
    }

    async fn upload_blob(
        &self,
        reference: &Reference,
        digest: &Digest,
        content: &[u8],
    ) -> std::result::Result<(), TransportError> {
        // Two-step monolithic upload: POST to open a session, PUT the
        // content against the returned location.
        let start_url = format!("{}/blobs/uploads/", self.base_url(reference));
        let request = self.authorize(self.client.post(&start_url), &reference.registry);
        let response = self.send(request).await?;

        if response.status().as_u16() != 202 {
            return Err(TransportError::Fatal(format!(
                "POST {} returned {}",
                start_url,
                response.status()
            )));
        }

        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                TransportError::Fatal("upload session response missing Location".to_string())
            })?;
        let location = if location.starts_with("http") {
            location.to_string()
        } else {
            format!("https://{}{}", reference.registry, location)
        };
        let separator = if location.contains('?') { '&' } else { '?' };
        let put_url = format!("{}{}digest={}", location, separator, digest);

        debug!("uploading blob {} ({} bytes)", digest, content.len());
        let request = self
            .authorize(self.client.put(&put_url), &reference.registry)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(content.to_vec());
        let response = self.send(request).await?;

        if response.status().as_u16() != 201 {
            return Err(TransportError::Fatal(format!(
                "blob upload for {} returned {}",
                digest,
                response.status()
            )));
        }
        Ok(())
    }

    async fn put_manifest(
        &self,
        reference: &Reference,
        target: &str,
        media_type: &str,
        content: &[u8],
    ) -> std::result::Result<(), TransportError> {
        let url = format!("{}/manifests/{}", self.base_url(reference), target);
        debug!("uploading manifest to {}", url);

        let request = self
            .authorize(self.client.put(&url), &reference.registry)
            .header(reqwest::header::CONTENT_TYPE, media_type)
            .body(content.to_vec());
        let response = self.send(request).await?;

        match response.status().as_u16() {
            200 | 201 => Ok(()),
            other => Err(TransportError::Fatal(format!(
                "PUT {} returned {}",
                url, other
            ))),
        }
    }
}
