//! Remote manager over a Unix domain socket.
//!
//! The wire protocol is newline-delimited JSON. Each request opens a fresh
//! connection: a single request object goes out, and for `submit`/`list` a
//! single response object comes back. A `watch` request instead keeps the
//! connection open and streams one event object per line until the log ends.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::jobspec::Jobspec;

use super::{
    EventWatch, InstanceConnector, JobEvent, JobId, JobManager, JobRecord, ListFilter,
    SubmitOptions,
};

/// Environment variable naming the manager's listening socket.
pub const SOCKET_ENV: &str = "MINIJOB_SOCKET";

pub struct RemoteManager {
    socket: PathBuf,
}

impl RemoteManager {
    pub fn new(socket: impl Into<PathBuf>) -> RemoteManager {
        RemoteManager {
            socket: socket.into(),
        }
    }

    /// Connect to the manager named by `$MINIJOB_SOCKET`.
    pub fn from_env() -> Result<RemoteManager> {
        match std::env::var(SOCKET_ENV) {
            Ok(path) if !path.is_empty() => Ok(RemoteManager::new(path)),
            _ => Err(Error::RemoteUnreachable(format!(
                "{SOCKET_ENV} is not set; no manager to connect to"
            ))),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    async fn connect(&self) -> Result<UnixStream> {
        UnixStream::connect(&self.socket).await.map_err(|e| {
            Error::RemoteUnreachable(format!("{}: {e}", self.socket.display()))
        })
    }

    /// One request, one response.
    async fn request(&self, request: Value) -> Result<Value> {
        let stream = self.connect().await?;
        let mut reader = BufReader::new(stream);

        let mut frame = serde_json::to_string(&request)?;
        frame.push('\n');
        reader.get_mut().write_all(frame.as_bytes()).await?;

        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(Error::RemoteUnreachable(format!(
                "{}: connection closed before response",
                self.socket.display()
            )));
        }
        let response: Value = serde_json::from_str(line.trim_end())?;
        if response.get("ok").and_then(Value::as_bool) == Some(false) {
            let msg = response
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("request failed");
            return Err(Error::Submission(msg.to_string()));
        }
        Ok(response)
    }
}

#[async_trait]
impl JobManager for RemoteManager {
    async fn submit(&self, spec: &Jobspec, options: SubmitOptions) -> Result<JobId> {
        let mut flags = Vec::new();
        if options.debug {
            flags.push("debug");
        }
        if options.waitable {
            flags.push("waitable");
        }
        let response = self
            .request(json!({
                "op": "submit",
                "jobspec": spec,
                "urgency": options.urgency,
                "flags": flags,
            }))
            .await?;
        let id = response
            .get("id")
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::Submission("manager response is missing a job id".into()))?;
        debug!(id, "job submitted");
        Ok(JobId(id))
    }

    async fn watch(&self, id: JobId, eventlog: &str) -> Result<EventWatch> {
        let stream = self.connect().await?;
        let mut reader = BufReader::new(stream);

        let mut frame = serde_json::to_string(&json!({
            "op": "watch",
            "id": id,
            "eventlog": eventlog,
        }))?;
        frame.push('\n');
        reader.get_mut().write_all(frame.as_bytes()).await?;

        let (tx, watch) = EventWatch::channel(64);
        let handle = watch.handle();
        tokio::spawn(async move {
            let mut line = String::new();
            loop {
                line.clear();
                tokio::select! {
                    _ = handle.cancelled() => break,
                    read = reader.read_line(&mut line) => match read {
                        Ok(0) => break,
                        Ok(_) => {
                            let event: JobEvent = match serde_json::from_str(line.trim_end()) {
                                Ok(event) => event,
                                Err(e) => {
                                    warn!(%id, error = %e, "discarding malformed event");
                                    continue;
                                }
                            };
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(%id, error = %e, "event stream read failed");
                            break;
                        }
                    },
                }
            }
        });
        Ok(watch)
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<JobRecord>> {
        let response = self
            .request(json!({
                "op": "list",
                "states": filter.states,
                "user": filter.user,
                "count": filter.count,
            }))
            .await?;
        let jobs = response
            .get("jobs")
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new()));
        Ok(serde_json::from_value(jobs)?)
    }
}

/// Connects to nested instances by socket uri.
pub struct RemoteConnector;

#[async_trait]
impl InstanceConnector for RemoteConnector {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn JobManager>> {
        let path = uri.strip_prefix("local://").unwrap_or(uri);
        Ok(Arc::new(RemoteManager::new(path)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tempfile::TempDir;
    use tokio::net::UnixListener;

    async fn serve_one(listener: UnixListener, responses: Vec<Value>) {
        let (stream, _) = listener.accept().await.unwrap();
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        for response in responses {
            let mut frame = serde_json::to_string(&response).unwrap();
            frame.push('\n');
            reader.get_mut().write_all(frame.as_bytes()).await.unwrap();
        }
    }

    fn bind(dir: &TempDir) -> (UnixListener, RemoteManager) {
        let path = dir.path().join("manager.sock");
        let listener = UnixListener::bind(&path).unwrap();
        (listener, RemoteManager::new(path))
    }

    #[tokio::test]
    async fn test_submit_round_trip() {
        let dir = TempDir::new().unwrap();
        let (listener, manager) = bind(&dir);
        let server = tokio::spawn(serve_one(listener, vec![json!({"ok": true, "id": 42})]));

        let spec = Jobspec::from_command(vec!["true".to_string()], 1, 1, None, None);
        let id = manager.submit(&spec, SubmitOptions::default()).await.unwrap();
        assert_eq!(id, JobId(42));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_rejection_is_submission_error() {
        let dir = TempDir::new().unwrap();
        let (listener, manager) = bind(&dir);
        let server = tokio::spawn(serve_one(
            listener,
            vec![json!({"ok": false, "error": "urgency out of range"})],
        ));

        let spec = Jobspec::from_command(vec!["true".to_string()], 1, 1, None, None);
        let err = manager
            .submit(&spec, SubmitOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Submission(msg) if msg.contains("urgency")));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_watch_streams_events_until_eof() {
        let dir = TempDir::new().unwrap();
        let (listener, manager) = bind(&dir);
        let server = tokio::spawn(serve_one(
            listener,
            vec![
                json!({"name": "submit", "context": {}}),
                json!({"name": "start", "context": {}}),
                json!({"name": "finish", "context": {"status": 0}}),
            ],
        ));

        let mut watch = manager.watch(JobId(1), super::super::MAIN_EVENTLOG).await.unwrap();
        let names: Vec<String> = {
            let mut names = Vec::new();
            while let Some(event) = watch.next().await {
                names.push(event.name);
            }
            names
        };
        assert_eq!(names, vec!["submit", "start", "finish"]);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_socket_is_unreachable() {
        let manager = RemoteManager::new("/nonexistent/manager.sock");
        let err = manager.list(&ListFilter::default()).await.unwrap_err();
        assert!(matches!(err, Error::RemoteUnreachable(_)));
    }
}
