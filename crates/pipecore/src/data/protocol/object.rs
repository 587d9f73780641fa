use super::{RawStat, ReadStream, Readable, Writable, WriteStream};
use crate::DataError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use reqwest::{Client, StatusCode};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

/// Object storage over plain HTTP verbs against `{endpoint}/{bucket}/{key}`.
///
/// One implementation serves several URI schemes (`s3://`, `gs://`); each
/// scheme is its own registered instance. Objects are never overwritten:
/// `create` on an existing key fails and the caller must `delete` first.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    scheme: String,
    endpoint: String,
    client: Client,
}

impl ObjectStore {
    pub fn new(scheme: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    pub fn s3(endpoint: impl Into<String>) -> Self {
        Self::new("s3", endpoint)
    }

    pub fn gs(endpoint: impl Into<String>) -> Self {
        Self::new("gs", endpoint)
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// HTTP location of an object reference.
    pub fn object_url(&self, reference: &str) -> Result<String, DataError> {
        let prefix = format!("{}://", self.scheme);
        let path = reference.strip_prefix(&prefix).ok_or_else(|| {
            DataError::transport(reference, format!("expected a {} reference", prefix))
        })?;
        match path.split_once('/') {
            Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
                Ok(format!("{}/{}/{}", self.endpoint, bucket, key))
            }
            _ => Err(DataError::transport(
                reference,
                "object references look like scheme://bucket/key",
            )),
        }
    }

    async fn head(&self, reference: &str) -> Result<Option<reqwest::Response>, DataError> {
        let url = self.object_url(reference)?;
        let response = self
            .client
            .head(&url)
            .send()
            .await
            .map_err(|e| DataError::transport(reference, e.to_string()))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response)),
            status => Err(DataError::transport(reference, format!("HEAD returned {}", status))),
        }
    }
}

#[async_trait]
impl Readable for ObjectStore {
    async fn exists(&self, reference: &str) -> Result<bool, DataError> {
        Ok(self.head(reference).await?.is_some())
    }

    async fn open(&self, reference: &str) -> Result<ReadStream, DataError> {
        let url = self.object_url(reference)?;
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| DataError::transport(reference, e.to_string()))?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(DataError::NotFound(reference.to_string())),
            status if status.is_success() => {
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| DataError::transport(reference, e.to_string()))?;
                Ok(Box::new(io::Cursor::new(body.to_vec())))
            }
            status => Err(DataError::transport(reference, format!("GET returned {}", status))),
        }
    }

    async fn stat(&self, reference: &str) -> Result<RawStat, DataError> {
        let response = self
            .head(reference)
            .await?
            .ok_or_else(|| DataError::NotFound(reference.to_string()))?;
        let headers = response.headers();
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

        Ok(RawStat {
            content_length: header("content-length").and_then(|v| v.parse().ok()),
            last_modified: header("last-modified")
                .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
                .map(|t| t.with_timezone(&Utc)),
            content_hash: header("etag").map(|v| v.trim_matches('"').to_string()),
        })
    }
}

#[async_trait]
impl Writable for ObjectStore {
    async fn create(&self, reference: &str) -> Result<WriteStream, DataError> {
        if self.exists(reference).await? {
            return Err(DataError::Io {
                reference: reference.to_string(),
                source: io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "object exists; delete it before creating it again",
                ),
            });
        }
        Ok(Box::new(Upload {
            client: self.client.clone(),
            url: self.object_url(reference)?,
            buffer: Vec::new(),
            request: None,
            done: false,
        }))
    }

    async fn delete(&self, reference: &str) -> Result<(), DataError> {
        let url = self.object_url(reference)?;
        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| DataError::transport(reference, e.to_string()))?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(DataError::NotFound(reference.to_string())),
            status if status.is_success() => Ok(()),
            status => Err(DataError::transport(reference, format!("DELETE returned {}", status))),
        }
    }
}

/// Buffers written bytes and uploads them with a single PUT on shutdown.
struct Upload {
    client: Client,
    url: String,
    buffer: Vec<u8>,
    request: Option<BoxFuture<'static, io::Result<()>>>,
    done: bool,
}

impl tokio::io::AsyncWrite for Upload {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.done || self.request.is_some() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write after shutdown",
            )));
        }
        self.buffer.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.done {
            return Poll::Ready(Ok(()));
        }
        if self.request.is_none() {
            let body = std::mem::take(&mut self.buffer);
            let request = self.client.put(&self.url).body(body);
            self.request = Some(Box::pin(async move {
                let response = request
                    .send()
                    .await
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
                if response.status().is_success() {
                    Ok(())
                } else {
                    Err(io::Error::new(
                        io::ErrorKind::Other,
                        format!("PUT returned {}", response.status()),
                    ))
                }
            }));
        }
        if let Some(request) = self.request.as_mut() {
            let outcome = ready!(request.as_mut().poll(cx));
            self.request = None;
            self.done = true;
            return Poll::Ready(outcome);
        }
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_url() {
        let store = ObjectStore::s3("http://localhost:9000/");
        assert_eq!(
            store.object_url("s3://bucket/path/to/reads.fq").unwrap(),
            "http://localhost:9000/bucket/path/to/reads.fq"
        );
        assert!(store.object_url("s3://bucket").is_err());
        assert!(store.object_url("gs://bucket/key").is_err());
    }

    #[test]
    fn test_schemes_share_implementation() {
        let gs = ObjectStore::gs("http://storage.local");
        assert_eq!(gs.scheme(), "gs");
        assert_eq!(
            gs.object_url("gs://b/k.bam").unwrap(),
            "http://storage.local/b/k.bam"
        );
    }
}
