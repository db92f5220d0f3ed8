//! NDJSON transport tests over in-memory pipes.

mod common;

use chat_db_orchestrator::error::DbResult;
use chat_db_orchestrator::transport::serve;
use common::Harness;
use serde_json::{Value, json};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(5);

struct Client {
    input: Option<DuplexStream>,
    output: Lines<BufReader<DuplexStream>>,
    events: Vec<Value>,
    /// Responses read while waiting for a different id
    pending: Vec<Value>,
    server: JoinHandle<DbResult<()>>,
}

impl Client {
    fn start(h: &Harness) -> Self {
        let (input, server_in) = tokio::io::duplex(64 * 1024);
        let (server_out, output) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(serve(
            h.manager.clone(),
            Some(h.events()),
            server_in,
            server_out,
        ));
        Self {
            input: Some(input),
            output: BufReader::new(output).lines(),
            events: Vec::new(),
            pending: Vec::new(),
            server,
        }
    }

    async fn send_raw(&mut self, line: &str) {
        let input = self.input.as_mut().unwrap();
        input.write_all(line.as_bytes()).await.unwrap();
        input.write_all(b"\n").await.unwrap();
    }

    async fn next_line(&mut self) -> Value {
        let line = tokio::time::timeout(WAIT, self.output.next_line())
            .await
            .expect("no output line")
            .unwrap()
            .expect("output closed");
        serde_json::from_str(&line).unwrap()
    }

    /// Next response line, stashing interleaved events.
    async fn next_response(&mut self) -> Value {
        loop {
            let value = self.next_line().await;
            if value["type"] == "response" {
                return value;
            }
            self.events.push(value);
        }
    }

    async fn response_for(&mut self, id: &Value) -> Value {
        if let Some(pos) = self.pending.iter().position(|r| &r["id"] == id) {
            return self.pending.remove(pos);
        }
        loop {
            let response = self.next_response().await;
            if &response["id"] == id {
                return response;
            }
            self.pending.push(response);
        }
    }

    async fn call(&mut self, request: Value) -> Value {
        let id = request["id"].clone();
        self.send_raw(&request.to_string()).await;
        self.response_for(&id).await
    }

    async fn wait_for_event<F>(&mut self, pred: F) -> Value
    where
        F: Fn(&Value) -> bool,
    {
        if let Some(found) = self.events.iter().find(|e| pred(e)) {
            return found.clone();
        }
        loop {
            let value = self.next_line().await;
            if pred(&value) {
                return value;
            }
            self.events.push(value);
        }
    }
}

fn pg_connect(id: u64, chat: &str, stream: &str) -> Value {
    json!({
        "id": id,
        "command": "connect",
        "chat_id": chat,
        "user_id": "u",
        "stream_id": stream,
        "config": {
            "db_type": "postgresql",
            "host": "db.internal",
            "database": "app",
            "username": "app",
            "password": "secret"
        }
    })
}

#[tokio::test]
async fn test_full_session_over_stdio() {
    let h = Harness::quiet();
    let mut client = Client::start(&h);

    let subscribed = client
        .call(json!({"id": 1, "command": "subscribe", "chat_id": "chat", "stream_id": "watcher"}))
        .await;
    assert_eq!(subscribed["ok"], true);

    let connected = client.call(pg_connect(2, "chat", "owner")).await;
    assert_eq!(connected["ok"], true);
    assert_eq!(connected["result"]["subscribers"], json!(["owner", "watcher"]));
    assert!(!connected["result"]["target"].as_str().unwrap().contains("secret"));

    let event = client
        .wait_for_event(|e| {
            e["type"] == "db_event"
                && e["stream_id"] == "watcher"
                && e["event"]["status"] == "connected"
        })
        .await;
    assert_eq!(event["chat_id"], "chat");

    let executed = client
        .call(json!({
            "id": 3,
            "command": "execute",
            "chat_id": "chat",
            "stream_id": "owner",
            "query": "SELECT 1",
            "query_id": "q1"
        }))
        .await;
    assert_eq!(executed["ok"], true);
    assert_eq!(executed["result"]["result"]["rows"][0]["value"], 1);

    let failed = client
        .call(json!({
            "id": 4,
            "command": "execute",
            "chat_id": "chat",
            "stream_id": "owner",
            "query": "FAIL here"
        }))
        .await;
    assert_eq!(failed["ok"], false);
    assert_eq!(failed["result"]["error"]["code"], "EXECUTION_ERROR");

    let status = client
        .call(json!({"id": 5, "command": "status", "chat_id": "chat"}))
        .await;
    assert_eq!(status["result"]["connected"], true);
    assert_eq!(status["result"]["status"], "connected");

    let listed = client.call(json!({"id": 6, "command": "list"})).await;
    assert_eq!(listed["result"]["pools"], 1);
    assert_eq!(listed["result"]["sessions"][0]["chat_id"], "chat");

    let disconnected = client
        .call(json!({"id": 7, "command": "disconnect", "chat_id": "chat", "user_id": "u"}))
        .await;
    assert_eq!(disconnected["ok"], true);

    let status = client
        .call(json!({"id": 8, "command": "status", "chat_id": "chat"}))
        .await;
    assert_eq!(status["result"]["connected"], false);
    assert_eq!(status["result"]["status"], "disconnected");
}

#[tokio::test]
async fn test_errors_carry_codes() {
    let h = Harness::quiet();
    let mut client = Client::start(&h);

    client.call(pg_connect(1, "chat", "s")).await;
    let duplicate = client.call(pg_connect(2, "chat", "s")).await;
    assert_eq!(duplicate["ok"], false);
    assert_eq!(duplicate["error"]["code"], "CONNECTION_EXISTS");

    let forbidden = client
        .call(json!({"id": 3, "command": "disconnect", "chat_id": "chat", "user_id": "other"}))
        .await;
    assert_eq!(forbidden["error"]["code"], "PERMISSION_DENIED");

    let missing = client
        .call(json!({"id": 4, "command": "connect", "chat_id": "c", "user_id": "u", "stream_id": "s"}))
        .await;
    assert_eq!(missing["error"]["code"], "INVALID_INPUT");

    let timed_out = client
        .call(json!({
            "id": 5,
            "command": "execute",
            "chat_id": "chat",
            "stream_id": "s",
            "query": "SLEEP",
            "timeout_ms": 30
        }))
        .await;
    assert_eq!(timed_out["ok"], false);
    assert_eq!(timed_out["error"]["code"], "QUERY_EXECUTION_TIMED_OUT");
    assert_eq!(timed_out["result"]["error"]["code"], "QUERY_EXECUTION_TIMED_OUT");
}

#[tokio::test]
async fn test_cancel_over_stdio() {
    let h = Harness::quiet();
    let mut client = Client::start(&h);
    client.call(pg_connect(1, "chat", "s")).await;

    client
        .send_raw(
            &json!({"id": 2, "command": "execute", "chat_id": "chat", "stream_id": "s", "query": "SLEEP"})
                .to_string(),
        )
        .await;
    tokio::time::timeout(WAIT, async {
        while !h.manager.is_executing("s") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let cancel = client
        .call(json!({"id": 3, "command": "cancel", "stream_id": "s"}))
        .await;
    assert_eq!(cancel["ok"], true);

    let cancelled = client.response_for(&json!(2)).await;
    assert_eq!(cancelled["ok"], false);
    assert_eq!(cancelled["error"]["code"], "QUERY_EXECUTION_CANCELLED");
}

#[tokio::test]
async fn test_malformed_line_gets_error_without_id() {
    let h = Harness::quiet();
    let mut client = Client::start(&h);

    client.send_raw("{not json").await;
    let response = client.next_response().await;
    assert_eq!(response["ok"], false);
    assert!(response.get("id").is_none());
    assert_eq!(response["error"]["code"], "INVALID_INPUT");

    client.send_raw(r#"{"id": 9, "command": "fly"}"#).await;
    let response = client.next_response().await;
    assert_eq!(response["error"]["code"], "INVALID_INPUT");

    let listed = client.call(json!({"id": 10, "command": "list"})).await;
    assert_eq!(listed["ok"], true);
}

#[tokio::test]
async fn test_eof_ends_serve() {
    let h = Harness::quiet();
    let mut client = Client::start(&h);

    client.call(json!({"id": 1, "command": "list"})).await;
    client.input.take();

    let finished = tokio::time::timeout(WAIT, &mut client.server).await;
    assert!(matches!(finished, Ok(Ok(Ok(())))));
}
