//! Primitive get/put/list/delete over an S3-compatible object store (spec
//! §4.2). No transactional guarantees beyond per-object atomicity.

use async_trait::async_trait;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use cd_common::error::{Error, ErrorKind};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use tracing::warn;

#[derive(Clone, Debug)]
pub struct ObjectMeta {
    pub key: String,
    pub size: i64,
}

#[derive(Clone, Debug)]
pub struct DeletePrefixReport {
    pub deleted: usize,
    pub errors: Vec<(String, String)>,
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put(&self, path: &str, bytes: Bytes) -> cd_common::Result<()>;
    async fn get(&self, path: &str) -> cd_common::Result<ByteStream>;
    async fn get_tail(&self, path: &str, max_bytes: u64) -> cd_common::Result<Bytes>;
    async fn exists(&self, path: &str) -> cd_common::Result<bool>;
    fn list(&self, prefix: &str) -> BoxStream<'_, cd_common::Result<ObjectMeta>>;
    async fn delete_prefix(&self, prefix: &str) -> cd_common::Result<DeletePrefixReport>;
}

#[derive(Clone)]
pub struct S3ArtifactStore {
    client: Client,
    bucket: String,
}

impl S3ArtifactStore {
    pub async fn connect(
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
        bucket: &str,
        tls: bool,
    ) -> cd_common::Result<Self> {
        let scheme = if tls { "https" } else { "http" };
        let endpoint_url = if endpoint.starts_with("http") {
            endpoint.to_string()
        } else {
            format!("{scheme}://{endpoint}")
        };

        let credentials = Credentials::new(access_key, secret_key, None, None, "cd-asg");
        let config = aws_sdk_s3::Config::builder()
            .region(Region::new("us-east-1"))
            .endpoint_url(endpoint_url)
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Ok(Self {
            client: Client::from_conf(config),
            bucket: bucket.to_string(),
        })
    }
}

fn backend_err<E: std::error::Error + Send + Sync + 'static>(err: E) -> Error {
    Error::source(ErrorKind::StoreUnavailable, err)
}

#[async_trait]
impl ArtifactStore for S3ArtifactStore {
    async fn put(&self, path: &str, bytes: Bytes) -> cd_common::Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(path)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn get(&self, path: &str) -> cd_common::Result<ByteStream> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
            .map_err(|err| {
                if is_not_found(&err) {
                    Error::from_kind(ErrorKind::NotFound)
                } else {
                    backend_err(err)
                }
            })?;
        Ok(output.body)
    }

    async fn get_tail(&self, path: &str, max_bytes: u64) -> cd_common::Result<Bytes> {
        // Suffix byte ranges naturally satisfy "returns last max_bytes; if
        // smaller, returns the whole object" (spec §4.2).
        let range = format!("bytes=-{max_bytes}");
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(path)
            .range(range)
            .send()
            .await
            .map_err(|err| {
                if is_not_found(&err) {
                    Error::from_kind(ErrorKind::NotFound)
                } else {
                    backend_err(err)
                }
            })?;
        output
            .body
            .collect()
            .await
            .map(|data| data.into_bytes())
            .map_err(backend_err)
    }

    async fn exists(&self, path: &str) -> cd_common::Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if is_not_found(&err) => Ok(false),
            Err(err) => Err(backend_err(err)),
        }
    }

    fn list(&self, prefix: &str) -> BoxStream<'_, cd_common::Result<ObjectMeta>> {
        let paginator = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        paginator
            .map_err(backend_err)
            .map_ok(|page| {
                stream::iter(page.contents.unwrap_or_default().into_iter().map(|o| {
                    Ok(ObjectMeta {
                        key: o.key.unwrap_or_default(),
                        size: o.size.unwrap_or(0),
                    })
                }))
            })
            .try_flatten()
            .boxed()
    }

    async fn delete_prefix(&self, prefix: &str) -> cd_common::Result<DeletePrefixReport> {
        let mut report = DeletePrefixReport {
            deleted: 0,
            errors: Vec::new(),
        };

        let mut keys = self.list(prefix);
        while let Some(item) = keys.next().await {
            match item {
                Ok(meta) => match self
                    .client
                    .delete_object()
                    .bucket(&self.bucket)
                    .key(&meta.key)
                    .send()
                    .await
                {
                    Ok(_) => report.deleted += 1,
                    Err(err) => {
                        warn!(key = %meta.key, error = %err, "failed to delete object");
                        report.errors.push((meta.key, err.to_string()));
                    }
                },
                Err(err) => {
                    report.errors.push((prefix.to_string(), err.to_string()));
                }
            }
        }

        Ok(report)
    }
}

fn is_not_found<E>(err: &aws_sdk_s3::error::SdkError<E>) -> bool {
    matches!(
        err,
        aws_sdk_s3::error::SdkError::ServiceError(service_err)
            if service_err.raw().status().as_u16() == 404
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_meta_carries_key_and_size() {
        let meta = ObjectMeta {
            key: "builds/proj/build.log".into(),
            size: 1024,
        };
        assert_eq!(meta.key, "builds/proj/build.log");
        assert_eq!(meta.size, 1024);
    }
}
