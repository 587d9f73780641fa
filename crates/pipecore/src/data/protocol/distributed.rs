use super::{RawStat, ReadStream, Readable, Writable, WriteStream};
use crate::DataError;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::future::BoxFuture;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

pub(super) const SCHEME: &str = "hdfs";

/// Distributed filesystem reached through an `hdfs dfs` compatible command.
/// References are handed to the command unchanged; `create` overwrites.
#[derive(Debug, Clone)]
pub struct DistributedProtocol {
    command: PathBuf,
    timeout: Duration,
}

impl DistributedProtocol {
    pub fn new(command: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }

    fn dfs(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.arg("dfs").args(args).kill_on_drop(true);
        cmd
    }

    /// A missing command is a transport failure, not a missing file.
    fn spawn_failed(&self, reference: &str, error: io::Error) -> DataError {
        DataError::transport(
            reference,
            format!("failed to run {}: {}", self.command.display(), error),
        )
    }

    /// Run a short dfs sub-command to completion, bounded by the timeout.
    async fn run(&self, reference: &str, args: &[&str]) -> Result<std::process::Output, DataError> {
        let mut cmd = self.dfs(args);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(output) => output.map_err(|e| self.spawn_failed(reference, e)),
            Err(_) => Err(DataError::transport(
                reference,
                format!(
                    "{} dfs {} timed out after {:?}",
                    self.command.display(),
                    args.first().copied().unwrap_or_default(),
                    self.timeout
                ),
            )),
        }
    }
}

#[async_trait]
impl Readable for DistributedProtocol {
    async fn exists(&self, reference: &str) -> Result<bool, DataError> {
        let output = self.run(reference, &["-test", "-e", reference]).await?;
        Ok(output.status.success())
    }

    async fn open(&self, reference: &str) -> Result<ReadStream, DataError> {
        if !self.exists(reference).await? {
            return Err(DataError::NotFound(reference.to_string()));
        }
        let mut child = self
            .dfs(&["-cat", reference])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| self.spawn_failed(reference, e))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DataError::transport(reference, "no stdout from dfs -cat"))?;
        Ok(Box::new(ChildReader {
            child: Some(child),
            stdout,
            wait: None,
        }))
    }

    async fn stat(&self, reference: &str) -> Result<RawStat, DataError> {
        let output = self.run(reference, &["-stat", "%b:%Y", reference]).await?;
        if !output.status.success() {
            return Err(DataError::NotFound(reference.to_string()));
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let (size, millis) = text
            .trim()
            .split_once(':')
            .ok_or_else(|| DataError::transport(reference, format!("unexpected stat output '{}'", text.trim())))?;

        Ok(RawStat {
            content_length: size.trim().parse().ok(),
            last_modified: millis
                .trim()
                .parse::<i64>()
                .ok()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            content_hash: None,
        })
    }
}

#[async_trait]
impl Writable for DistributedProtocol {
    async fn create(&self, reference: &str) -> Result<WriteStream, DataError> {
        let mut child = self
            .dfs(&["-put", "-f", "-", reference])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| self.spawn_failed(reference, e))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DataError::transport(reference, "no stdin for dfs -put"))?;
        Ok(Box::new(ChildWriter {
            child: Some(child),
            stdin: Some(stdin),
            wait: None,
        }))
    }

    async fn delete(&self, reference: &str) -> Result<(), DataError> {
        let output = self.run(reference, &["-rm", reference]).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(DataError::NotFound(reference.to_string()))
        }
    }
}

/// Stdout of a `dfs -cat` process; the process is killed when dropped.
/// End of output is only reported once the command has exited cleanly, so
/// a transfer that dies midway surfaces as an error instead of a short read.
struct ChildReader {
    child: Option<Child>,
    stdout: ChildStdout,
    wait: Option<BoxFuture<'static, io::Result<ExitStatus>>>,
}

impl AsyncRead for ChildReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.wait.is_none() {
            let before = buf.filled().len();
            ready!(Pin::new(&mut self.stdout).poll_read(cx, buf))?;
            if buf.filled().len() > before || buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }
            match self.child.take() {
                Some(mut child) => {
                    self.wait = Some(Box::pin(async move { child.wait().await }));
                }
                None => return Poll::Ready(Ok(())),
            }
        }
        if let Some(wait) = self.wait.as_mut() {
            let status = ready!(wait.as_mut().poll(cx))?;
            self.wait = None;
            if !status.success() {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("dfs -cat exited with {}", status),
                )));
            }
        }
        Poll::Ready(Ok(()))
    }
}

/// Stdin of a `dfs -put` process. Shutdown closes stdin and waits for the
/// upload to finish, failing if the command did.
struct ChildWriter {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    wait: Option<BoxFuture<'static, io::Result<ExitStatus>>>,
}

impl AsyncWrite for ChildWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.stdin.as_mut() {
            Some(stdin) => Pin::new(stdin).poll_write(cx, buf),
            None => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write after shutdown",
            ))),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.stdin.as_mut() {
            Some(stdin) => Pin::new(stdin).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Some(stdin) = self.stdin.as_mut() {
            ready!(Pin::new(stdin).poll_shutdown(cx))?;
            self.stdin = None;
        }
        if self.wait.is_none() {
            match self.child.take() {
                Some(mut child) => {
                    self.wait = Some(Box::pin(async move { child.wait().await }));
                }
                None => return Poll::Ready(Ok(())),
            }
        }
        if let Some(wait) = self.wait.as_mut() {
            let status = ready!(wait.as_mut().poll(cx))?;
            self.wait = None;
            if !status.success() {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("dfs -put exited with {}", status),
                )));
            }
        }
        Poll::Ready(Ok(()))
    }
}
