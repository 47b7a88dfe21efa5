//! Newline-delimited JSON messages exchanged with the extractor.
//!
//! Only `RECORD` messages carry rows. `SCHEMA` and `STATE` messages are accepted and ignored
//! by the loader, as is any other message type. Rejected rows are written back as `RECORD`
//! messages of the same stream whose record holds a single `error` field.

use std::future::Future;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, Lines};

use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;
use crate::loader::RowRejection;

/// One line of the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum Message {
    Record {
        stream: String,
        record: Map<String, Value>,
    },
    Schema {
        stream: String,
        #[serde(default)]
        schema: Value,
        #[serde(default)]
        key_properties: Vec<String>,
    },
    State {
        #[serde(default)]
        value: Value,
    },
    /// Any message type the loader does not act upon.
    #[serde(other)]
    Other,
}

impl Message {
    /// Builds the error record reporting a rejected row of `stream`.
    pub fn error_record(stream: impl Into<String>, message: impl Into<String>) -> Message {
        let mut record = Map::new();
        record.insert("error".to_string(), Value::String(message.into()));

        Message::Record {
            stream: stream.into(),
            record,
        }
    }

    /// Renders the message as a single JSON line, without the trailing newline.
    pub fn encode(&self) -> EtlResult<String> {
        serde_json::to_string(self).map_err(|err| {
            etl_error!(
                ErrorKind::SerializationError,
                "Message serialization failed",
                source: err
            )
        })
    }
}

/// Parses one transport line. Blank lines yield [`None`].
pub fn parse_line(line: &str) -> EtlResult<Option<Message>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let message = serde_json::from_str(line).map_err(|err| {
        etl_error!(
            ErrorKind::DeserializationError,
            "Malformed transport message",
            format!("{err}: {}", truncate(line, 200)),
            source: err
        )
    })?;

    Ok(Some(message))
}

fn truncate(line: &str, max_chars: usize) -> &str {
    match line.char_indices().nth(max_chars) {
        Some((index, _)) => &line[..index],
        None => line,
    }
}

/// Reads messages from an async line source.
#[derive(Debug)]
pub struct MessageReader<R> {
    lines: Lines<R>,
    line_number: usize,
}

impl<R> MessageReader<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(reader: R) -> MessageReader<R> {
        Self {
            lines: reader.lines(),
            line_number: 0,
        }
    }

    /// Returns the next message, [`None`] at end of input.
    ///
    /// Malformed lines fail with [`ErrorKind::DeserializationError`] naming the line number.
    pub async fn next_message(&mut self) -> EtlResult<Option<Message>> {
        while let Some(line) = self.lines.next_line().await? {
            self.line_number += 1;

            match parse_line(&line) {
                Ok(Some(message)) => return Ok(Some(message)),
                Ok(None) => continue,
                Err(err) => {
                    return Err(etl_error!(
                        ErrorKind::DeserializationError,
                        "Malformed transport message",
                        format!(
                            "line {}: {}",
                            self.line_number,
                            err.detail().unwrap_or_default()
                        ),
                        source: err
                    ));
                }
            }
        }

        Ok(None)
    }
}

/// Receiver of rows that did not make it into the warehouse.
pub trait RejectionSink {
    fn emit(&mut self, rejection: &RowRejection) -> impl Future<Output = EtlResult<()>> + Send;
}

impl RejectionSink for Vec<RowRejection> {
    async fn emit(&mut self, rejection: &RowRejection) -> EtlResult<()> {
        self.push(rejection.clone());
        Ok(())
    }
}

impl<S> RejectionSink for &mut S
where
    S: RejectionSink + Send,
{
    fn emit(&mut self, rejection: &RowRejection) -> impl Future<Output = EtlResult<()>> + Send {
        (**self).emit(rejection)
    }
}

/// Writes each rejection as an error record line.
#[derive(Debug)]
pub struct ErrorRecordWriter<W> {
    writer: W,
}

impl<W> ErrorRecordWriter<W> {
    pub fn new(writer: W) -> ErrorRecordWriter<W> {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W> RejectionSink for ErrorRecordWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn emit(&mut self, rejection: &RowRejection) -> EtlResult<()> {
        let mut line =
            Message::error_record(rejection.stream.as_str(), rejection.message.as_str()).encode()?;
        line.push('\n');

        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;

        Ok(())
    }
}
