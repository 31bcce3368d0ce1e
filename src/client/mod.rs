// src/client/mod.rs

//! Client for the controller's admin protocol.

use std::time::Duration;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::timeout;
use crate::common::error::{ControllerError, Result};
use crate::server::{AdminRequest, ServerResponse};

/// Options for connecting to an admin server
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub connect_timeout: Duration,
    /// Covers sending a request and reading its response, including any
    /// server-side wait for version acknowledgements.
    pub operation_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(60),
        }
    }
}

/// A connection to a controller's admin server
pub struct AdminClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    address: String,
    options: ConnectionOptions,
}

impl AdminClient {
    pub async fn connect<A: ToSocketAddrs + std::fmt::Debug>(address: A, options: ConnectionOptions) -> Result<Self> {
        let address_str = format!("{:?}", address);

        let stream = match timeout(options.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(ControllerError::Internal(format!("Failed to connect to {}: {}", address_str, e)));
            }
            Err(_) => {
                return Err(ControllerError::Timeout(format!(
                    "Connecting to {} took longer than {:?}",
                    address_str, options.connect_timeout
                )));
            }
        };
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            address: address_str,
            options,
        })
    }

    pub fn server_address(&self) -> &str {
        &self.address
    }

    /// Send one request and read its response line
    pub async fn send(&mut self, request: &AdminRequest) -> Result<ServerResponse> {
        let json = serde_json::to_string(request)?;
        let operation_timeout = self.options.operation_timeout;
        let exchange = async {
            self.writer.write_all(json.as_bytes()).await?;
            self.writer.write_all(b"\n").await?;
            self.writer.flush().await?;

            let mut line = String::new();
            if self.reader.read_line(&mut line).await? == 0 {
                return Err(ControllerError::Internal("Connection closed by server".to_string()));
            }
            Ok::<_, ControllerError>(serde_json::from_str::<ServerResponse>(&line)?)
        };
        match timeout(operation_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(ControllerError::Timeout(format!(
                "No response from {} within {:?}",
                self.address, operation_timeout
            ))),
        }
    }

    /// Send a request and turn an error response into an error
    pub async fn call(&mut self, request: &AdminRequest) -> Result<Value> {
        let response = self.send(request).await?;
        Self::handle_response(response)
    }

    fn handle_response(response: ServerResponse) -> Result<Value> {
        match response.status.as_str() {
            "ok" => Ok(response.data.unwrap_or(Value::Null)),
            "error" => {
                let data = response.data.unwrap_or(Value::Null);
                let message = data["message"].as_str().unwrap_or("Unknown server error").to_string();
                Err(match data["kind"].as_str() {
                    Some("not_found") => ControllerError::NotFound(message),
                    Some("invalid_input") => ControllerError::InvalidInput(message),
                    Some("not_master") => ControllerError::NotMaster(message),
                    Some("timeout") => ControllerError::Timeout(message),
                    // Keep the server-side kind visible, e.g. a partial bulk failure
                    Some(kind) if kind != "internal" => ControllerError::Internal(format!("{}: {}", kind, message)),
                    _ => ControllerError::Internal(message),
                })
            }
            other => Err(ControllerError::Internal(format!("Unknown response status: {}", other))),
        }
    }
}
