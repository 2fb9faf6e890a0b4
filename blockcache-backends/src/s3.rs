use std::env;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::Client;
use rusty_s3::{Bucket, Credentials, S3Action, UrlStyle};
use tokio::{runtime, task};

use blockcache::{Backend, CacheError, Result};

use crate::region::Region;

/// Runs an async future to completion from a synchronous `Backend` method,
/// the same `block_in_place` + `block_on` idiom the teacher's own S3
/// backend uses to bridge its `tokio`-based HTTP stack into a synchronous
/// call site.
fn block_on<O>(fut: impl std::future::Future<Output = O>) -> O {
    task::block_in_place(move || runtime::Handle::current().block_on(fut))
}

/// S3-compatible object store backend. One `S3` instance is meant to be
/// leased out of a `BackendPool`; concurrency across leases, not inside
/// one instance, is what drives throughput.
#[derive(Clone)]
pub struct S3 {
    base_path: String,
    client: Client,
    bucket: Arc<Bucket>,
    credentials: Arc<Credentials>,
}

impl S3 {
    pub fn new(region: Region, bucket: impl AsRef<str>) -> anyhow::Result<Self> {
        let access_key = env::var("AWS_ACCESS_KEY_ID").context("missing AWS_ACCESS_KEY_ID")?;
        let secret_key =
            env::var("AWS_SECRET_ACCESS_KEY").context("missing AWS_SECRET_ACCESS_KEY")?;
        let creds = Credentials::new(access_key, secret_key);
        Self::with_credentials(region, bucket, creds)
    }

    pub fn with_credentials(
        region: Region,
        bucket: impl AsRef<str>,
        creds: Credentials,
    ) -> anyhow::Result<Self> {
        let (bucket_name, base_path) = match bucket.as_ref().split_once('/') {
            Some((bucket, "")) => (bucket.to_string(), String::new()),
            Some((bucket, path)) => (bucket.to_string(), format!("{path}/")),
            None => (bucket.as_ref().to_string(), String::new()),
        };

        let bucket = Bucket::new(
            region.endpoint().parse().context("invalid endpoint URL")?,
            match region {
                Region::Custom { .. } => UrlStyle::Path,
                _ => UrlStyle::VirtualHost,
            },
            bucket_name,
            region.to_string(),
        )
        .context("failed to construct S3 bucket handle")?;

        Ok(S3 {
            bucket: Arc::new(bucket),
            base_path,
            client: reqwest::Client::new(),
            credentials: Arc::new(creds),
        })
    }

    fn object_path(&self, key: &str) -> String {
        format!("{}{}", self.base_path, key)
    }
}

impl Backend for S3 {
    fn write(
        &mut self,
        key: &str,
        writer_fn: &mut dyn FnMut(&mut dyn Write) -> std::io::Result<()>,
    ) -> Result<u64> {
        let mut body = Vec::new();
        writer_fn(&mut body).map_err(|e| CacheError::io(key, e))?;
        let size = body.len() as u64;
        let path = self.object_path(key);

        block_on(async {
            let url = self
                .bucket
                .put_object(Some(&self.credentials), &path)
                .sign(Duration::from_secs(30));

            let resp = self
                .client
                .put(url)
                .body(body)
                .send()
                .await
                .map_err(|e| CacheError::TempFailure {
                    key: key.to_string(),
                    message: e.to_string(),
                })?;

            let status = resp.status();
            if status.is_success() {
                Ok(size)
            } else {
                let body = resp.text().await.unwrap_or_default();
                Err(CacheError::Backend(anyhow::anyhow!(
                    "S3 PUT {key} failed with {status}: {body}"
                )))
            }
        })
    }

    fn read(
        &mut self,
        key: &str,
        reader_fn: &mut dyn FnMut(&mut dyn Read) -> std::io::Result<()>,
    ) -> Result<()> {
        let path = self.object_path(key);
        let body = block_on(async {
            let url = self
                .bucket
                .get_object(Some(&self.credentials), &path)
                .sign(Duration::from_secs(30));

            let resp = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| CacheError::TempFailure {
                    key: key.to_string(),
                    message: e.to_string(),
                })?;

            let status = resp.status();
            if status.as_u16() == 404 {
                return Err(CacheError::NotFound {
                    key: key.to_string(),
                });
            }
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                return Err(CacheError::Backend(anyhow::anyhow!(
                    "S3 GET {key} failed with {status}: {text}"
                )));
            }
            resp.bytes()
                .await
                .map(|b| b.to_vec())
                .map_err(|e| CacheError::io(key, std::io::Error::new(std::io::ErrorKind::Other, e)))
        })?;

        let mut cursor = std::io::Cursor::new(body);
        reader_fn(&mut cursor).map_err(|e| CacheError::io(key, e))
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        let path = self.object_path(key);
        block_on(async {
            let url = self
                .bucket
                .delete_object(Some(&self.credentials), &path)
                .sign(Duration::from_secs(30));

            let resp = self
                .client
                .delete(url)
                .send()
                .await
                .map_err(|e| CacheError::TempFailure {
                    key: key.to_string(),
                    message: e.to_string(),
                })?;

            let status = resp.status();
            if status.as_u16() == 404 {
                Err(CacheError::NotFound {
                    key: key.to_string(),
                })
            } else if status.is_success() {
                Ok(())
            } else {
                Err(CacheError::Backend(anyhow::anyhow!(
                    "S3 DELETE {key} failed with {status}"
                )))
            }
        })
    }

    fn delete_multi(&mut self, keys: &mut Vec<String>) -> Result<()> {
        // S3's batch-delete API needs request-body XML support this crate
        // doesn't add; fall back to the capability report so the cache
        // uses one-at-a-time removal workers instead.
        let mut remaining = Vec::new();
        let mut first_error = None;
        for key in keys.drain(..) {
            if let Err(e) = self.delete(&key) {
                if first_error.is_none() {
                    first_error = Some(e);
                }
                remaining.push(key);
            }
        }
        *keys = remaining;
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn has_delete_multi(&self) -> bool {
        false
    }
}
