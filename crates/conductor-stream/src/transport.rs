//! Transport seam for the stream client.
//!
//! A [`Transport`] opens one connection and hands back its byte chunks. The
//! reconnect loop never looks inside a transport, so tests can script
//! connections in memory while production uses [`HttpTransport`].

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::header::ACCEPT;
use tracing::debug;

use crate::error::StreamError;

/// Response header carrying the server's per-process stream epoch.
pub const EPOCH_HEADER: &str = "x-conductor-epoch";

/// One open stream connection.
pub struct Connection {
    /// Server stream epoch, if advertised.
    pub epoch: Option<String>,
    /// Raw body chunks. Ends when the server closes the stream.
    pub chunks: BoxStream<'static, Result<Bytes, StreamError>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

/// Opens connections to the event stream.
pub trait Transport: Send + Sync + 'static {
    /// Connect, asking the server to replay envelopes after `since`.
    fn connect(
        &self,
        since: Option<u64>,
    ) -> impl Future<Output = Result<Connection, StreamError>> + Send;
}

/// Streams NDJSON over plain HTTP with `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpTransport {
    /// Build a transport for the given stream URL.
    ///
    /// Only the connect phase has a timeout; the body is long-lived.
    pub fn new(url: impl Into<String>) -> Result<Self, StreamError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| StreamError::Connect(e.to_string()))?;
        Ok(Self::with_client(client, url))
    }

    /// Use an existing client.
    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

impl Transport for HttpTransport {
    async fn connect(&self, since: Option<u64>) -> Result<Connection, StreamError> {
        let mut request = self
            .client
            .get(&self.url)
            .header(ACCEPT, "application/x-ndjson");
        if let Some(since) = since {
            request = request.query(&[("since", since)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| StreamError::Connect(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StreamError::Status(status.as_u16()));
        }

        let epoch = response
            .headers()
            .get(EPOCH_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        debug!(url = %self.url, ?since, ?epoch, "stream connected");

        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| StreamError::TransportClosed(e.to_string())))
            .boxed();
        Ok(Connection { epoch, chunks })
    }
}
