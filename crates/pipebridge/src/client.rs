//! Client side of the bridge protocol.
//!
//! Sends a single statement and reads back one framed response, the way the
//! bundled driver scripts talk to the bridge.

use std::io;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::FramedRead;

use crate::framer::{Marker, ResponseCodec};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect: {0}")]
    Connect(#[source] io::Error),
    #[error("failed to send statement: {0}")]
    Send(#[source] io::Error),
    #[error("failed to read response: {0}")]
    Receive(#[source] io::Error),
    #[error("bridge closed the connection without a response")]
    Closed,
    #[error("no response within {0:?}")]
    Timeout(Duration),
}

/// Send `statement` and return the response, marker included.
///
/// A trailing newline is added when missing since the worker reads
/// statements line by line.
pub async fn query<A: ToSocketAddrs>(
    addr: A,
    statement: &str,
    marker: &Marker,
    timeout: Option<Duration>,
) -> Result<Bytes, ClientError> {
    let exchange = async {
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(ClientError::Connect)?;

        let mut request = statement.as_bytes().to_vec();
        if !request.ends_with(b"\n") {
            request.push(b'\n');
        }
        tracing::debug!(bytes = request.len(), "Sending statement");
        stream
            .write_all(&request)
            .await
            .map_err(ClientError::Send)?;

        let mut responses = FramedRead::new(stream, ResponseCodec::new(marker.clone()));
        match responses.next().await {
            Some(Ok(response)) => Ok(response),
            Some(Err(e)) => Err(ClientError::Receive(e)),
            None => Err(ClientError::Closed),
        }
    };

    match timeout {
        Some(limit) => tokio::time::timeout(limit, exchange)
            .await
            .map_err(|_| ClientError::Timeout(limit))?,
        None => exchange.await,
    }
}

/// Pull the data rows out of a tabular response.
///
/// Rows are the lines after the first separator line (one containing `--`)
/// up to the next blank line.
pub fn extract_rows(response: &str) -> Vec<String> {
    response
        .lines()
        .skip_while(|line| !line.contains("--"))
        .skip(1)
        .take_while(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect()
}
