//! Control loop: executes protocol requests against a job registry and
//! forwards job events to the client as they happen

use crate::error::{Error, Result};
use crate::events::EventStream;
use crate::protocol::{Command, EventMessage, Greeting, Request, Response};
use crate::registry::JobRegistry;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Serves the control protocol for one client
#[derive(Debug, Clone)]
pub struct Monitor {
    registry: JobRegistry,
    greeting: bool,
}

impl Monitor {
    /// Create a monitor over `registry`
    pub fn new(registry: JobRegistry) -> Self {
        Self {
            registry,
            greeting: true,
        }
    }

    /// Whether to send a greeting banner before the first request
    pub fn greeting(mut self, greeting: bool) -> Self {
        self.greeting = greeting;
        self
    }

    /// The registry commands are executed against
    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Execute one decoded command
    pub fn execute(&self, command: Command) -> Result<Value> {
        tracing::debug!(?command, "Executing command");
        match command {
            Command::QmpCapabilities => Ok(json!({})),
            Command::BlockStream(args) => {
                self.registry
                    .start(&args.device, args.base.as_deref(), args.speed)?;
                Ok(json!({}))
            }
            Command::BlockJobCancel(args) => {
                self.registry.cancel(&args.device)?;
                Ok(json!({}))
            }
            Command::BlockJobSetSpeed(args) => {
                self.registry.set_speed(&args.device, args.speed)?;
                Ok(json!({}))
            }
            Command::QueryBlockJobs => serde_json::to_value(self.registry.list())
                .map_err(|e| Error::Protocol(e.to_string())),
        }
    }

    /// Handle one request line and build its response
    pub fn handle_line(&self, line: &str) -> Response {
        let request = match Request::parse(line) {
            Ok(request) => request,
            Err(e) => return Response::error(&e, None),
        };
        let id = request.id.clone();
        let result = Command::from_request(&request).and_then(|command| self.execute(command));
        if let Err(e) = &result {
            tracing::debug!("Command {} failed: {}", request.execute, e);
        }
        Response::from_result(result, id)
    }

    /// Serve requests from `reader` until it reaches EOF, writing responses
    /// and events to `writer` one JSON object per line
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut events = self.registry.subscribe();
        let mut lines = reader.lines();

        if self.greeting {
            write_message(&mut writer, &Greeting::new()).await?;
        }

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        break;
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    let response = self.handle_line(&line);
                    write_message(&mut writer, &response).await?;
                }
                Some(event) = events.recv() => {
                    write_message(&mut writer, &EventMessage::from(&event)).await?;
                }
            }
        }

        flush_events(&mut events, &mut writer).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Write events that were already delivered but not yet sent
async fn flush_events<W>(events: &mut EventStream, writer: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(event) = events.try_recv() {
        write_message(writer, &EventMessage::from(&event)).await?;
    }
    Ok(())
}

async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(message).map_err(|e| Error::Protocol(e.to_string()))?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use crate::device::{Device, DeviceMap, ImageChain};
    use crate::events::EventNotifier;
    use crate::layer::{ImageLayer, MemoryLayer};
    use std::sync::Arc;
    use tokio::io::BufReader;

    fn monitor() -> Monitor {
        let devices = DeviceMap::new();
        let chain = ImageChain::new(vec![
            Arc::new(MemoryLayer::new("top.img", 64 * 1024)) as Arc<dyn ImageLayer>,
            Arc::new(MemoryLayer::with_data("base.img", vec![1u8; 64 * 1024])),
        ])
        .unwrap();
        devices.insert(Device::new("drive0", chain)).unwrap();
        let registry = JobRegistry::new(
            Arc::new(devices),
            Arc::new(EventNotifier::new()),
            StreamConfig::default(),
        );
        Monitor::new(registry)
    }

    #[tokio::test]
    async fn test_handle_query_empty() {
        let response = monitor().handle_line(r#"{"execute": "query-block-jobs", "id": "q1"}"#);
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({"return": [], "id": "q1"})
        );
    }

    #[tokio::test]
    async fn test_handle_unknown_device() {
        let response = monitor()
            .handle_line(r#"{"execute": "block-stream", "arguments": {"device": "nope"}}"#);
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["error"]["class"], "DeviceNotFound");
    }

    #[tokio::test]
    async fn test_handle_malformed() {
        let response = monitor().handle_line("{{{");
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["error"]["class"], "GenericError");
    }

    #[tokio::test]
    async fn test_handle_unknown_command() {
        let response = monitor().handle_line(r#"{"execute": "system_reset"}"#);
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["error"]["class"], "CommandNotFound");
    }

    #[tokio::test]
    async fn test_handle_cancel_without_job() {
        let response = monitor()
            .handle_line(r#"{"execute": "block-job-cancel", "arguments": {"device": "drive0"}}"#);
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["error"]["class"], "GenericError");
    }

    #[tokio::test]
    async fn test_serve_streams_and_reports() {
        let monitor = monitor().greeting(false);
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let serve = tokio::spawn({
            let monitor = monitor.clone();
            async move {
                monitor
                    .serve(BufReader::new(server_read), server_write)
                    .await
            }
        });

        let (client_read, mut client_write) = tokio::io::split(client);
        let mut replies = BufReader::new(client_read).lines();

        client_write
            .write_all(b"{\"execute\": \"block-stream\", \"arguments\": {\"device\": \"drive0\"}}\n")
            .await
            .unwrap();

        let mut saw_return = false;
        let mut saw_event = false;
        while !(saw_return && saw_event) {
            let line = replies.next_line().await.unwrap().unwrap();
            let value: Value = serde_json::from_str(&line).unwrap();
            if value.get("return").is_some() {
                saw_return = true;
            } else if value["event"] == "BLOCK_JOB_COMPLETED" {
                assert_eq!(value["data"]["offset"], 64 * 1024);
                assert_eq!(value["data"]["len"], 64 * 1024);
                saw_event = true;
            }
        }

        client_write.shutdown().await.unwrap();
        serve.await.unwrap().unwrap();
    }
}
