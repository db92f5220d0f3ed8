//! Newline-delimited JSON over stdin/stdout.
//!
//! Each input line is one [`Request`]:
//!
//! ```text
//! {"id":1,"command":"connect","chat_id":"c1","user_id":"u1","stream_id":"s1","url":"sqlite:app.db"}
//! {"id":2,"command":"execute","chat_id":"c1","stream_id":"s1","query":"SELECT 1"}
//! ```
//!
//! Every request gets exactly one `{"type":"response",...}` line. Stream
//! events are interleaved as their own lines, tagged `db_event` or
//! `schema_change`. Requests run concurrently, so responses may come back
//! out of order; match them by `id`.

use crate::error::{DbError, DbResult};
use crate::manager::Manager;
use crate::models::{ConnectionConfig, ExecuteQueryRequest, QueryError, QueryExecutionResult};
use crate::stream::{BroadcastStreamHandler, StreamMessage};
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
pub struct Request {
    /// Echoed back on the response
    #[serde(default)]
    pub id: Option<JsonValue>,
    #[serde(flatten)]
    pub command: Command,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Either `url` or a structured `config` names the backend.
    Connect {
        chat_id: String,
        user_id: String,
        stream_id: String,
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        config: Option<ConnectionConfig>,
    },
    Disconnect {
        chat_id: String,
        user_id: String,
        #[serde(default)]
        delete_schema: bool,
    },
    Execute(ExecuteQueryRequest),
    Cancel {
        stream_id: String,
    },
    Subscribe {
        chat_id: String,
        stream_id: String,
    },
    Unsubscribe {
        chat_id: String,
        stream_id: String,
    },
    Status {
        chat_id: String,
    },
    List,
}

#[derive(Debug, Serialize)]
pub struct Response {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<JsonValue>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<QueryError>,
}

impl Response {
    fn success(id: Option<JsonValue>, result: JsonValue) -> Self {
        Self {
            kind: "response",
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    fn failure(id: Option<JsonValue>, err: &DbError) -> Self {
        Self {
            kind: "response",
            id,
            ok: false,
            result: None,
            error: Some(QueryError::from(err)),
        }
    }

    fn from_result<T: Serialize>(id: Option<JsonValue>, result: DbResult<T>) -> Self {
        match result.and_then(|value| {
            serde_json::to_value(value)
                .map_err(|e| DbError::internal(format!("Failed to serialize response: {}", e)))
        }) {
            Ok(value) => Self::success(id, value),
            Err(err) => Self::failure(id, &err),
        }
    }
}

/// Run one command against the manager.
pub async fn dispatch(manager: &Manager, request: Request) -> Response {
    let id = request.id;
    match request.command {
        Command::Connect {
            chat_id,
            user_id,
            stream_id,
            url,
            config,
        } => {
            let config = match (config, url) {
                (Some(config), _) => Ok(config),
                (None, Some(url)) => ConnectionConfig::from_url(&url).map_err(DbError::from),
                (None, None) => Err(DbError::invalid_input(
                    "connect needs either 'url' or 'config'",
                )),
            };
            let result = match config {
                Ok(config) => manager.connect(&chat_id, &user_id, &stream_id, config).await,
                Err(err) => Err(err),
            };
            Response::from_result(id, result)
        }
        Command::Disconnect {
            chat_id,
            user_id,
            delete_schema,
        } => {
            let result = manager
                .disconnect(&chat_id, &user_id, delete_schema)
                .await
                .map(|()| json!({ "chat_id": chat_id, "disconnected": true }));
            Response::from_result(id, result)
        }
        Command::Execute(request) => {
            let started = Instant::now();
            match manager.execute_query(request).await {
                Ok(outcome) => Response {
                    ok: outcome.is_success(),
                    ..Response::from_result(id, Ok(outcome))
                },
                Err(err) => {
                    let elapsed = started.elapsed().as_millis() as u64;
                    Response {
                        result: serde_json::to_value(QueryExecutionResult::failure(&err, elapsed))
                            .ok(),
                        ..Response::failure(id, &err)
                    }
                }
            }
        }
        Command::Cancel { stream_id } => {
            manager.cancel_query_execution(&stream_id);
            Response::success(id, json!({ "stream_id": stream_id, "cancel_requested": true }))
        }
        Command::Subscribe { chat_id, stream_id } => {
            let result = manager
                .subscribe(&chat_id, &stream_id)
                .await
                .map(|()| json!({ "chat_id": chat_id, "stream_id": stream_id }));
            Response::from_result(id, result)
        }
        Command::Unsubscribe { chat_id, stream_id } => {
            manager.unsubscribe(&chat_id, &stream_id).await;
            Response::success(id, json!({ "chat_id": chat_id, "stream_id": stream_id }))
        }
        Command::Status { chat_id } => {
            let connected = manager.is_connected(&chat_id).await;
            let status = manager.session_status(&chat_id).await;
            let subscribers = manager.subscribers(&chat_id).await;
            Response::success(
                id,
                json!({
                    "chat_id": chat_id,
                    "connected": connected,
                    "status": status,
                    "subscribers": subscribers,
                }),
            )
        }
        Command::List => {
            let sessions = manager.list_sessions().await;
            let pools = manager.pool_count().await;
            Response::success(
                id,
                json!({
                    "sessions": sessions,
                    "executions": manager.active_executions(),
                    "pools": pools,
                }),
            )
        }
    }
}

fn push_line<T: Serialize>(out: &mpsc::UnboundedSender<String>, message: &T) {
    match serde_json::to_string(message) {
        Ok(line) => {
            if out.send(line).is_err() {
                debug!("Output closed, dropping line");
            }
        }
        Err(e) => warn!(error = %e, "Failed to serialize output line"),
    }
}

/// Serve NDJSON requests from `reader` until EOF, writing responses and
/// forwarded stream events to `writer`.
pub async fn serve<R, W>(
    manager: Manager,
    events: Option<broadcast::Receiver<StreamMessage>>,
    reader: R,
    writer: W,
) -> DbResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(line) = out_rx.recv().await {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }
        Ok::<(), std::io::Error>(())
    });

    let forwarder = events.map(|mut rx| {
        let out = out_tx.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => push_line(&out, &message),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Stream events dropped, client too slow");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    });

    let mut lines = BufReader::new(reader).lines();
    let mut requests = JoinSet::new();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read request line");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<Request>(line) {
            Ok(request) => {
                let manager = manager.clone();
                let out = out_tx.clone();
                requests.spawn(async move {
                    let response = dispatch(&manager, request).await;
                    push_line(&out, &response);
                });
            }
            Err(e) => {
                let err = DbError::invalid_input(format!("Malformed request: {}", e));
                push_line(&out_tx, &Response::failure(None, &err));
            }
        }
        while requests.try_join_next().is_some() {}
    }

    debug!(pending = requests.len(), "Input closed, draining requests");
    while requests.join_next().await.is_some() {}
    if let Some(forwarder) = forwarder {
        forwarder.abort();
    }
    drop(out_tx);

    match writer_task.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(DbError::internal(format!("Failed to write output: {}", e))),
        Err(e) => Err(DbError::internal(format!("Output task failed: {}", e))),
    }
}

/// NDJSON transport on the process's stdin and stdout.
pub struct StdioTransport {
    manager: Manager,
    stream: Arc<BroadcastStreamHandler>,
}

impl StdioTransport {
    pub fn new(manager: Manager, stream: Arc<BroadcastStreamHandler>) -> Self {
        Self { manager, stream }
    }
}

impl Transport for StdioTransport {
    async fn run(&self) -> DbResult<()> {
        info!("Serving NDJSON on stdio");

        let service = serve(
            self.manager.clone(),
            Some(self.stream.subscribe()),
            tokio::io::stdin(),
            tokio::io::stdout(),
        );

        let (result, signalled) = tokio::select! {
            result = service => {
                info!("Input closed");
                (result, false)
            }
            _ = wait_for_signal() => {
                info!("Shutdown signal received (send again to force exit)");
                (Ok(()), true)
            }
        };

        if signalled {
            tokio::spawn(async {
                wait_for_signal().await;
                warn!("Received second signal, forcing immediate exit");
                std::process::exit(1);
            });
        }

        self.manager.stop().await;

        if signalled {
            // stdin reads block a runtime thread that select! cannot interrupt
            info!("Exiting process");
            std::process::exit(0);
        }
        result
    }

    fn name(&self) -> &'static str {
        "stdio"
    }
}

/// Resolves on SIGINT or SIGTERM. A handler that cannot be installed never
/// resolves.
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
