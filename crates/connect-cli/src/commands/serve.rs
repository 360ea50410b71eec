use anyhow::{Context, Result, anyhow};
use connect_core::{CallRequest, Core, Notification, UiResponse};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// One line read from stdin.
#[derive(Debug, PartialEq)]
pub enum Incoming {
    Call(CallRequest),
    Ui(UiResponse),
    Cancel(Option<String>),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UiEnvelope {
    ui_response: UiResponse,
}

#[derive(Deserialize)]
struct CancelEnvelope {
    cancel: Option<String>,
}

/// One line written to stdout.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
enum Outgoing {
    Response(connect_core::CallResponse),
    Event(Notification),
    Error(String),
}

pub fn parse_line(line: &str) -> Result<Incoming> {
    let value: Value = serde_json::from_str(line).context("invalid JSON")?;
    let object = value
        .as_object()
        .ok_or_else(|| anyhow!("expected a JSON object"))?;

    if object.contains_key("uiResponse") {
        let envelope: UiEnvelope = serde_json::from_value(value).context("invalid uiResponse")?;
        return Ok(Incoming::Ui(envelope.ui_response));
    }
    if object.contains_key("cancel") {
        let envelope: CancelEnvelope = serde_json::from_value(value).context("invalid cancel")?;
        return Ok(Incoming::Cancel(envelope.cancel));
    }
    let request: CallRequest = serde_json::from_value(value).context("invalid call request")?;
    Ok(Incoming::Call(request))
}

async fn write_lines(mut rx: mpsc::UnboundedReceiver<Outgoing>) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(line) = rx.recv().await {
        let mut bytes = serde_json::to_vec(&line)?;
        bytes.push(b'\n');
        stdout.write_all(&bytes).await?;
        stdout.flush().await?;
    }
    Ok(())
}

pub async fn run(core: &Core) -> Result<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_lines(rx));

    let mut events = core.subscribe();
    let event_tx = tx.clone();
    let forwarder = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(notification) => {
                    if event_tx.send(Outgoing::Event(notification)).is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut calls = JoinSet::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(&line) {
            Ok(Incoming::Call(request)) => {
                debug!(method = %request.method, id = ?request.id, "serve call");
                let core = core.clone();
                let tx = tx.clone();
                calls.spawn(async move {
                    let response = core.call(request).await;
                    let _ = tx.send(Outgoing::Response(response));
                });
            }
            Ok(Incoming::Ui(response)) => {
                if !core.handle_ui_response(response) {
                    let _ = tx.send(Outgoing::Error("no prompt is waiting".into()));
                }
            }
            Ok(Incoming::Cancel(connect_id)) => core.cancel(connect_id.as_deref()).await,
            Err(err) => {
                let _ = tx.send(Outgoing::Error(format!("{err:#}")));
            }
        }
    }

    while calls.join_next().await.is_some() {}
    forwarder.abort();
    drop(tx);
    writer.await.context("stdout writer panicked")?
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_call_envelope() {
        let incoming =
            parse_line(r#"{"id": 7, "method": "getFeatures", "payload": {"connectId": "emu-0"}}"#)
                .unwrap();
        let Incoming::Call(request) = incoming else {
            panic!("expected call");
        };
        assert_eq!(request.id, Some(7));
        assert_eq!(request.method, "getFeatures");
        assert_eq!(request.payload, json!({ "connectId": "emu-0" }));
    }

    #[test]
    fn parses_ui_response() {
        let incoming = parse_line(
            r#"{"uiResponse": {"type": "receivePin", "connectId": "emu-0", "pin": "1234"}}"#,
        )
        .unwrap();
        assert_eq!(
            incoming,
            Incoming::Ui(UiResponse::ReceivePin {
                connect_id: Some("emu-0".into()),
                pin: "1234".into(),
            })
        );
    }

    #[test]
    fn parses_cancel_with_and_without_target() {
        assert_eq!(
            parse_line(r#"{"cancel": "emu-0"}"#).unwrap(),
            Incoming::Cancel(Some("emu-0".into()))
        );
        assert_eq!(
            parse_line(r#"{"cancel": null}"#).unwrap(),
            Incoming::Cancel(None)
        );
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(parse_line("not json").is_err());
        assert!(parse_line("[1]").is_err());
        assert!(parse_line(r#"{"payload": {}}"#).is_err());
    }

    #[test]
    fn outgoing_lines_are_tagged() {
        let line = serde_json::to_value(Outgoing::Error("bad".into())).unwrap();
        assert_eq!(line, json!({ "error": "bad" }));
    }
}
