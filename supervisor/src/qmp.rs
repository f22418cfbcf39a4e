//! QMP management-protocol client.
//!
//! Line-framed JSON over the hypervisor's local control socket. The
//! protocol opens with one unsolicited greeting, then a capabilities
//! negotiation; afterwards every command is a single `{"execute": ...}`
//! object answered by exactly one `return` or `error` object. Asynchronous
//! event lines may arrive at any point and are skipped.
//!
//! The client is not concurrency-safe; it has one owner at a time.

use crate::error::SupervisorError;
use serde_json::{Value, json};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};

#[cfg(unix)]
type ControlStream = tokio::net::UnixStream;
#[cfg(windows)]
type ControlStream = tokio::net::windows::named_pipe::NamedPipeClient;

pub struct QmpClient {
    reader: BufReader<ReadHalf<ControlStream>>,
    writer: WriteHalf<ControlStream>,
}

impl QmpClient {
    /// Connect, consume the greeting, and negotiate capabilities.
    pub async fn connect(path: &Path) -> Result<Self, SupervisorError> {
        let stream = connect_stream(path).await?;
        let (read, write) = tokio::io::split(stream);
        let mut client = Self {
            reader: BufReader::new(read),
            writer: write,
        };

        let greeting = client.read_message().await?;
        if greeting.get("QMP").is_none() {
            return Err(SupervisorError::ControlChannel {
                class: "GreetingError".to_string(),
                desc: format!("unexpected greeting: {greeting}"),
            });
        }
        client.execute("qmp_capabilities").await?;
        Ok(client)
    }

    /// Send one command and return the contents of its `return` member.
    pub async fn execute(&mut self, command: &str) -> Result<Value, SupervisorError> {
        let mut line = serde_json::to_string(&json!({ "execute": command }))?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;

        loop {
            let message = self.read_message().await?;
            if let Some(ret) = message.get("return") {
                return Ok(ret.clone());
            }
            if let Some(err) = message.get("error") {
                return Err(SupervisorError::ControlChannel {
                    class: err
                        .get("class")
                        .and_then(Value::as_str)
                        .unwrap_or("Unknown")
                        .to_string(),
                    desc: err
                        .get("desc")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                });
            }
            // Anything else is an asynchronous event; keep reading.
        }
    }

    pub async fn query_status(&mut self) -> Result<(String, bool), SupervisorError> {
        let ret = self.execute("query-status").await?;
        let status = ret
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let running = ret.get("running").and_then(Value::as_bool).unwrap_or(false);
        Ok((status, running))
    }

    async fn read_message(&mut self) -> Result<Value, SupervisorError> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(SupervisorError::ControlChannel {
                class: "Disconnected".to_string(),
                desc: "control socket closed".to_string(),
            });
        }
        serde_json::from_str(&line).map_err(|e| SupervisorError::ControlChannel {
            class: "FrameError".to_string(),
            desc: e.to_string(),
        })
    }
}

#[cfg(unix)]
async fn connect_stream(path: &Path) -> Result<ControlStream, SupervisorError> {
    Ok(tokio::net::UnixStream::connect(path).await?)
}

#[cfg(windows)]
async fn connect_stream(path: &Path) -> Result<ControlStream, SupervisorError> {
    use tokio::net::windows::named_pipe::ClientOptions;
    Ok(ClientOptions::new().open(path)?)
}
