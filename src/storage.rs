//! Object storage for uploaded source files.
//!
//! | Provider | Type | Notes |
//! |----------|------|-------|
//! | `disk` | [`DiskStorage`] | files under `[storage].root`; `file://` "presigned" URLs |
//! | `s3` | [`S3Storage`] | S3 REST API with AWS Signature V4 |
//!
//! Uploads are content-addressed: see [`content_key`].
//!
//! # S3 credentials
//!
//! - `AWS_ACCESS_KEY_ID` (required)
//! - `AWS_SECRET_ACCESS_KEY` (required)
//! - `AWS_SESSION_TOKEN` (optional)
//!
//! Requests are signed with `hmac` + `sha2` only. With `endpoint_url` set
//! (MinIO, LocalStack) objects are addressed path-style as
//! `{endpoint}/{bucket}/{key}`; otherwise virtual-host style on
//! `{bucket}.s3.{region}.amazonaws.com`.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::StorageConfig;
use crate::error::{ensure_valid, CxError};

type HmacSha256 = Hmac<Sha256>;

#[async_trait]
pub trait StorageService: Send + Sync {
    fn provider(&self) -> &str;
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;
    /// A URL a client can use for `method` on `key` without credentials.
    fn presigned_url(&self, key: &str, method: &str, expires_in: Duration) -> Result<String>;
}

/// `<sha256-of-content>.<lowercase extension>`, or just the hash when the
/// file name has no extension.
pub fn content_key(bytes: &[u8], file_name: &str) -> String {
    let hash = hex_sha256(bytes);
    match file_extension(file_name) {
        Some(ext) => format!("{}.{}", hash, ext),
        None => hash,
    }
}

pub fn file_extension(file_name: &str) -> Option<String> {
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
        .map(|e| e.to_ascii_lowercase())
}

/// MIME type by extension; `application/octet-stream` when unknown.
pub fn content_type_for(file_name: &str) -> &'static str {
    match file_extension(file_name).as_deref() {
        Some("pdf") => "application/pdf",
        Some("docx") => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        Some("txt") => "text/plain",
        Some("md") | Some("markdown") => "text/markdown",
        Some("html") | Some("htm") => "text/html",
        Some("json") => "application/json",
        Some("csv") => "text/csv",
        _ => "application/octet-stream",
    }
}

/// Keys are relative, `/`-separated, and may not escape the storage root.
fn validate_key(key: &str) -> Result<()> {
    ensure_valid(!key.is_empty(), "storage key must not be empty")?;
    ensure_valid(
        !key.starts_with('/') && !key.contains('\\'),
        format!("storage key '{}' must be a relative path", key),
    )?;
    ensure_valid(
        Path::new(key)
            .components()
            .all(|c| matches!(c, Component::Normal(_))),
        format!("storage key '{}' must not contain '.' or '..' segments", key),
    )
}

pub fn create_storage(config: &StorageConfig) -> Result<Arc<dyn StorageService>> {
    match config.provider.as_str() {
        "disk" => Ok(Arc::new(DiskStorage::new(&config.root))),
        "s3" => Ok(Arc::new(S3Storage::new(config, AwsCredentials::from_env()?)?)),
        other => bail!("Unknown storage provider: {}", other),
    }
}

// ============ Disk ============

pub struct DiskStorage {
    root: PathBuf,
}

impl DiskStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl StorageService for DiskStorage {
    fn provider(&self) -> &str {
        "disk"
    }

    async fn put(&self, key: &str, bytes: &[u8], _content_type: &str) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        debug!(key, bytes = bytes.len(), "stored file");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CxError::not_found("StoredObject", key).into())
            }
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}", path.display())),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    fn presigned_url(&self, key: &str, _method: &str, _expires_in: Duration) -> Result<String> {
        let path = self.path_for(key)?;
        let absolute = if path.is_absolute() {
            path
        } else {
            std::env::current_dir()?.join(path)
        };
        Ok(format!("file://{}", absolute.display()))
    }
}

// ============ S3 ============

pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl AwsCredentials {
    pub fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

/// Where requests go and what gets signed.
struct S3Endpoint {
    scheme: String,
    host: String,
    /// `/{bucket}` for path-style endpoints, empty for virtual-host style.
    path_prefix: String,
}

impl S3Endpoint {
    fn from_config(config: &StorageConfig, bucket: &str) -> Self {
        match &config.endpoint_url {
            Some(endpoint) => {
                let scheme = if endpoint.starts_with("http://") {
                    "http"
                } else {
                    "https"
                };
                let host = endpoint
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .trim_end_matches('/')
                    .to_string();
                Self {
                    scheme: scheme.to_string(),
                    host,
                    path_prefix: format!("/{}", uri_encode(bucket)),
                }
            }
            None => Self {
                scheme: "https".to_string(),
                host: format!("{}.s3.{}.amazonaws.com", bucket, config.region),
                path_prefix: String::new(),
            },
        }
    }

    fn canonical_uri(&self, key: &str) -> String {
        let encoded_key = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        format!("{}/{}", self.path_prefix, encoded_key)
    }
}

pub struct S3Storage {
    bucket: String,
    region: String,
    endpoint: S3Endpoint,
    creds: AwsCredentials,
    client: reqwest::Client,
}

impl S3Storage {
    pub fn new(config: &StorageConfig, creds: AwsCredentials) -> Result<Self> {
        let bucket = config
            .bucket
            .clone()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| anyhow::anyhow!("storage.bucket required for S3 provider"))?;
        Ok(Self {
            endpoint: S3Endpoint::from_config(config, &bucket),
            bucket,
            region: config.region.clone(),
            creds,
            client: reqwest::Client::new(),
        })
    }

    /// Sends a header-signed request; returns the raw response.
    async fn send(
        &self,
        method: reqwest::Method,
        key: &str,
        body: Option<(&[u8], &str)>,
    ) -> Result<reqwest::Response> {
        validate_key(key)?;
        let canonical_uri = self.endpoint.canonical_uri(key);
        let url = format!(
            "{}://{}{}",
            self.endpoint.scheme, self.endpoint.host, canonical_uri
        );

        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = hex_sha256(body.map(|(b, _)| b).unwrap_or(b""));

        let mut headers = vec![
            ("host".to_string(), self.endpoint.host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n\n{}\n{}\n{}",
            method.as_str(),
            canonical_uri,
            canonical_headers,
            signed_headers,
            payload_hash
        );
        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );
        let signing_key =
            derive_signing_key(&self.creds.secret_access_key, &date_stamp, &self.region, "s3")?;
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes())?;

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.creds.access_key_id, credential_scope, signed_headers, signature
        );

        let mut req = self
            .client
            .request(method.clone(), &url)
            .header("Authorization", &authorization)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &amz_date);
        if let Some(ref token) = self.creds.session_token {
            req = req.header("x-amz-security-token", token);
        }
        if let Some((bytes, content_type)) = body {
            req = req
                .header("Content-Type", content_type)
                .body(bytes.to_vec());
        }

        req.send().await.map_err(|e| {
            anyhow::anyhow!("S3 {} s3://{}/{} failed: {}", method, self.bucket, key, e)
        })
    }

    fn presign_at(
        &self,
        key: &str,
        method: &str,
        expires_in: Duration,
        now: DateTime<Utc>,
    ) -> Result<String> {
        validate_key(key)?;
        presign(
            &PresignParams {
                scheme: &self.endpoint.scheme,
                host: &self.endpoint.host,
                canonical_uri: &self.endpoint.canonical_uri(key),
                region: &self.region,
                method,
                expires_secs: expires_in.as_secs(),
            },
            &self.creds,
            now,
        )
    }
}

async fn s3_failure(resp: reqwest::Response, op: &str, key: &str) -> anyhow::Error {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    anyhow::anyhow!(
        "S3 {} failed (HTTP {}) for key '{}': {}",
        op,
        status,
        key,
        body.chars().take(500).collect::<String>()
    )
}

#[async_trait]
impl StorageService for S3Storage {
    fn provider(&self) -> &str {
        "s3"
    }

    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<()> {
        let resp = self
            .send(reqwest::Method::PUT, key, Some((bytes, content_type)))
            .await?;
        if !resp.status().is_success() {
            return Err(s3_failure(resp, "PutObject", key).await);
        }
        debug!(bucket = %self.bucket, key, bytes = bytes.len(), "stored object");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let resp = self.send(reqwest::Method::GET, key, None).await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CxError::not_found("StoredObject", key).into());
        }
        if !resp.status().is_success() {
            return Err(s3_failure(resp, "GetObject", key).await);
        }
        Ok(resp.bytes().await?.to_vec())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let resp = self.send(reqwest::Method::DELETE, key, None).await?;
        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(s3_failure(resp, "DeleteObject", key).await);
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let resp = self.send(reqwest::Method::HEAD, key, None).await?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            _ => Err(s3_failure(resp, "HeadObject", key).await),
        }
    }

    fn presigned_url(&self, key: &str, method: &str, expires_in: Duration) -> Result<String> {
        self.presign_at(key, method, expires_in, Utc::now())
    }
}

// ============ AWS SigV4 ============

struct PresignParams<'a> {
    scheme: &'a str,
    host: &'a str,
    canonical_uri: &'a str,
    region: &'a str,
    method: &'a str,
    expires_secs: u64,
}

/// Query-string SigV4 signing with an unsigned payload.
fn presign(p: &PresignParams<'_>, creds: &AwsCredentials, now: DateTime<Utc>) -> Result<String> {
    let method = p.method.to_ascii_uppercase();
    let date_stamp = now.format("%Y%m%d").to_string();
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, p.region);

    let mut params = vec![
        ("X-Amz-Algorithm".to_string(), "AWS4-HMAC-SHA256".to_string()),
        (
            "X-Amz-Credential".to_string(),
            format!("{}/{}", creds.access_key_id, credential_scope),
        ),
        ("X-Amz-Date".to_string(), amz_date.clone()),
        ("X-Amz-Expires".to_string(), p.expires_secs.to_string()),
        ("X-Amz-SignedHeaders".to_string(), "host".to_string()),
    ];
    if let Some(ref token) = creds.session_token {
        params.push(("X-Amz-Security-Token".to_string(), token.clone()));
    }
    params.sort_by(|a, b| a.0.cmp(&b.0));
    let canonical_querystring: String = params
        .iter()
        .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    let canonical_request = format!(
        "{}\n{}\n{}\nhost:{}\n\nhost\nUNSIGNED-PAYLOAD",
        method, p.canonical_uri, canonical_querystring, p.host
    );
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        credential_scope,
        hex_sha256(canonical_request.as_bytes())
    );
    let signing_key = derive_signing_key(&creds.secret_access_key, &date_stamp, p.region, "s3")?;
    let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes())?;

    Ok(format!(
        "{}://{}{}?{}&X-Amz-Signature={}",
        p.scheme, p.host, p.canonical_uri, canonical_querystring, signature
    ))
}

fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| anyhow::anyhow!("invalid HMAC key: {}", e))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn hex_hmac_sha256(key: &[u8], data: &[u8]) -> Result<String> {
    Ok(hex::encode(hmac_sha256(key, data)?))
}

/// kSigning = HMAC(HMAC(HMAC(HMAC("AWS4" + secret, date), region), service), "aws4_request")
fn derive_signing_key(
    secret_key: &str,
    date_stamp: &str,
    region: &str,
    service: &str,
) -> Result<Vec<u8>> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    )?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding; only `A-Z a-z 0-9 - _ . ~` pass through.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => result.push_str(&format!("%{:02X}", byte)),
        }
    }
    result
}
