//! Newline-delimited message framing.
//!
//! [`MessageBuilder`] turns a partial byte stream into complete UTF-8 lines.
//! Bytes read past a delimiter are kept and served before the socket is
//! touched again. [`IpcConnection`] pairs a builder with a transport and a
//! [`Pipe`] so both peers can exchange JSON-RPC messages.

use super::protocol::{JsonRpcRequest, JsonRpcResponse};
use super::socket::{IpcTransport, Pipe};
use crate::config::IpcConfig;
use crate::error::{IpcError, Result};

pub const MESSAGE_DELIMITER: u8 = b'\n';

/// Reassembles delimited messages from a byte stream.
#[derive(Debug)]
pub struct MessageBuilder {
    buffer: Box<[u8]>,
    /// Index just past the last valid byte.
    write_cursor: usize,
    /// Delimiter already present in the retained bytes.
    next_delimiter: Option<usize>,
}

impl Default for MessageBuilder {
    fn default() -> Self {
        Self::new(IpcConfig::MESSAGE_CAPACITY)
    }
}

impl MessageBuilder {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: vec![0u8; capacity].into_boxed_slice(),
            write_cursor: 0,
            next_delimiter: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes received but not yet returned as part of a message.
    pub fn buffered(&self) -> usize {
        self.write_cursor
    }

    /// Read the next complete message, without its delimiter.
    pub async fn read_next_message<T>(&mut self, transport: &mut T, pipe: &mut Pipe) -> Result<String>
    where
        T: IpcTransport + ?Sized,
    {
        let boundary = match self.next_delimiter.take() {
            Some(boundary) => boundary,
            None => {
                let found = pipe
                    .read_until(
                        transport,
                        &mut self.buffer,
                        MESSAGE_DELIMITER,
                        self.write_cursor,
                    )
                    .await?;
                self.write_cursor = found.before + 1 + found.after;
                found.before
            }
        };

        let message = std::str::from_utf8(&self.buffer[..boundary])
            .map_err(|_| IpcError::InvalidUtf8)?
            .to_string();

        let remainder = boundary + 1;
        self.buffer.copy_within(remainder..self.write_cursor, 0);
        self.write_cursor -= remainder;
        self.next_delimiter = self.buffer[..self.write_cursor]
            .iter()
            .position(|b| *b == MESSAGE_DELIMITER);

        Ok(message)
    }
}

/// One end of an IPC stream: transport plus framing state.
pub struct IpcConnection<T> {
    transport: T,
    pipe: Pipe,
    builder: MessageBuilder,
}

impl<T: IpcTransport> IpcConnection<T> {
    pub fn new(transport: T, message_capacity: usize) -> Self {
        Self {
            transport,
            pipe: Pipe::default(),
            builder: MessageBuilder::new(message_capacity),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub async fn read_message(&mut self) -> Result<String> {
        self.builder
            .read_next_message(&mut self.transport, &mut self.pipe)
            .await
    }

    pub async fn write_message(&mut self, message: &str) -> Result<()> {
        let mut frame = Vec::with_capacity(message.len() + 1);
        frame.extend_from_slice(message.as_bytes());
        frame.push(MESSAGE_DELIMITER);
        self.pipe.send_fully(&mut self.transport, &frame).await
    }

    pub async fn read_request(&mut self) -> Result<JsonRpcRequest> {
        let message = self.read_message().await?;
        Ok(serde_json::from_str(&message)?)
    }

    pub async fn write_request(&mut self, request: &JsonRpcRequest) -> Result<()> {
        let message = serde_json::to_string(request)?;
        self.write_message(&message).await
    }

    pub async fn read_response(&mut self) -> Result<JsonRpcResponse> {
        let message = self.read_message().await?;
        Ok(serde_json::from_str(&message)?)
    }

    pub async fn write_response(&mut self, response: &JsonRpcResponse) -> Result<()> {
        let message = serde_json::to_string(response)?;
        self.write_message(&message).await
    }
}
