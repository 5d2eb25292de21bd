use async_trait::async_trait;
use futures::stream;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client};
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::protocol::UploadFile;

/// Sink for fractional progress in [0, 1] as bytes go out on the wire.
pub type ProgressSink = mpsc::UnboundedSender<f64>;

/// The transfer primitive: send the whole file as one request, narrating
/// progress into the sink. No retries here; responsibility for recovering
/// from a failed attempt belongs to the protocol, not the transport.
#[async_trait]
pub trait UploadTransport: Send + Sync {
    async fn upload(&self, file: &UploadFile, progress: ProgressSink) -> Result<(), TransportError>;
}

const CHUNK_SIZE: usize = 64 * 1024;

/// Single multipart POST with one `file` field. Any non-error response is
/// success; no client-side timeout is imposed on the transfer.
pub struct HttpTransport {
    client: Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl UploadTransport for HttpTransport {
    async fn upload(&self, file: &UploadFile, progress: ProgressSink) -> Result<(), TransportError> {
        let total = file.bytes.len().max(1) as f64;
        let chunks: Vec<Vec<u8>> = file.bytes.chunks(CHUNK_SIZE).map(<[u8]>::to_vec).collect();

        // progress is observed as hyper pulls chunks off the body stream
        let mut sent = 0usize;
        let body = Body::wrap_stream(stream::iter(chunks.into_iter().map(move |chunk| {
            sent += chunk.len();
            let _ = progress.send(sent as f64 / total);
            Ok::<Vec<u8>, std::io::Error>(chunk)
        })));

        let part = Part::stream_with_length(body, file.bytes.len() as u64)
            .file_name(file.name.clone());
        let form = Form::new().part("file", part);

        let resp = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await?;
        resp.error_for_status()?;
        Ok(())
    }
}
