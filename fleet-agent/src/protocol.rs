//! Newline-delimited JSON over TCP between agents and the CLI.
//!
//! One request per line, one response line per request:
//!
//! ```text
//! {"cmd":"heartbeat","cluster":"edge-1","timestamp":"2024-05-01T10:00:00Z"}
//! {"cmd":"status"}
//! {"cmd":"stop"}
//! ```

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::thread::sleep;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use fleet_core::{ClusterName, Heartbeat};

use crate::error::{io_err, AgentError};

const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// JSON newline-delimited request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum AgentRequest {
    Heartbeat {
        cluster: ClusterName,
        timestamp: DateTime<Utc>,
    },
    Status,
    Stop,
}

impl From<&Heartbeat> for AgentRequest {
    fn from(heartbeat: &Heartbeat) -> Self {
        AgentRequest::Heartbeat {
            cluster: heartbeat.cluster.clone(),
            timestamp: heartbeat.timestamp,
        }
    }
}

/// JSON newline-delimited response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Send one JSON request to the agent at `addr` and return one response.
pub fn send_request(addr: &str, request: &AgentRequest) -> Result<AgentResponse, AgentError> {
    let stream = TcpStream::connect(addr).map_err(|err| {
        if matches!(
            err.kind(),
            std::io::ErrorKind::NotFound
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
        ) {
            AgentError::AgentNotRunning {
                addr: addr.to_string(),
            }
        } else {
            io_err(addr, err)
        }
    })?;
    stream
        .set_read_timeout(Some(IO_TIMEOUT))
        .map_err(|e| io_err(addr, e))?;

    let mut writer = &stream;
    let payload = serde_json::to_string(request)?;
    writer
        .write_all(payload.as_bytes())
        .map_err(|e| io_err(addr, e))?;
    writer.write_all(b"\n").map_err(|e| io_err(addr, e))?;
    writer.flush().map_err(|e| io_err(addr, e))?;

    let mut reader = BufReader::new(&stream);
    let mut line = String::new();
    let read = reader.read_line(&mut line).map_err(|e| io_err(addr, e))?;
    if read == 0 {
        return Err(AgentError::Protocol(
            "agent closed connection before responding".to_string(),
        ));
    }

    let response: AgentResponse = serde_json::from_str(line.trim_end())?;
    Ok(response)
}

/// Report one heartbeat to the pivot agent.
pub fn send_heartbeat(addr: &str, heartbeat: &Heartbeat) -> Result<(), AgentError> {
    let response = send_request(addr, &AgentRequest::from(heartbeat))?;
    response_into_data(response).map(|_| ())
}

/// Status payload of the agent at `addr`, retrying briefly while it starts.
pub fn request_status(addr: &str) -> Result<Value, AgentError> {
    let mut last_not_running: Option<AgentError> = None;
    for attempt in 0..5 {
        match send_request(addr, &AgentRequest::Status) {
            Ok(response) => return response_into_data(response),
            Err(err @ AgentError::AgentNotRunning { .. }) => {
                last_not_running = Some(err);
                if attempt < 4 {
                    sleep(Duration::from_millis(100));
                    continue;
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_not_running.unwrap_or_else(|| {
        AgentError::Protocol("agent status retry loop exited unexpectedly".to_string())
    }))
}

pub fn request_stop(addr: &str) -> Result<(), AgentError> {
    let response = send_request(addr, &AgentRequest::Stop)?;
    response_into_data(response).map(|_| ())
}

fn response_into_data(response: AgentResponse) -> Result<Value, AgentError> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(AgentError::Protocol(
            response
                .error
                .unwrap_or_else(|| "unknown agent error".to_string()),
        ))
    }
}
