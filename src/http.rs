// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// A streaming response body, one item per network chunk
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/// Status line, advertised length and body of an audio request
pub struct HttpResponse {
    pub status: u16,
    /// Content-Length header value, if the server advertised one
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

impl HttpResponse {
    /// Non-success responses abandon the transfer
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Source of audio bytes for the download manager
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get_stream(&self, url: &str) -> Result<HttpResponse, reqwest::Error>;
}

/// reqwest-backed client used outside of tests
#[derive(Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    /// Client with the crate user agent and a bounded connect timeout.
    ///
    /// No overall timeout is set: long audio transfers are expected.
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get_stream(&self, url: &str) -> Result<HttpResponse, reqwest::Error> {
        let response = self.client.get(url).send().await?;
        let status = response.status().as_u16();
        let content_length = response.content_length();

        let body: ByteStream = Box::pin(response.bytes_stream());

        Ok(HttpResponse {
            status,
            content_length,
            body,
        })
    }
}

/// Scripted clients shared by the download and CLI tests
#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// A reqwest error without touching the network (the URL never parses)
    pub fn transport_error() -> reqwest::Error {
        reqwest::Client::new()
            .get("not a url")
            .build()
            .unwrap_err()
    }

    /// Serves `body` in fixed-size chunks.
    ///
    /// `gate`, when set, is awaited before every chunk after the first so tests
    /// can act between chunks. `fail_after` injects a stream error once that
    /// many chunks were delivered.
    #[derive(Clone)]
    pub struct ChunkedClient {
        pub body: Vec<u8>,
        pub chunk_size: usize,
        pub status: u16,
        pub advertise_length: bool,
        pub fail_after: Option<usize>,
        pub gate: Option<Arc<Notify>>,
        pub requests: Arc<AtomicUsize>,
    }

    impl ChunkedClient {
        pub fn new(body: Vec<u8>, chunk_size: usize) -> Self {
            Self {
                body,
                chunk_size,
                status: 200,
                advertise_length: true,
                fail_after: None,
                gate: None,
                requests: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub fn request_count(&self) -> usize {
            self.requests.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HttpClient for ChunkedClient {
        async fn get_stream(&self, _url: &str) -> Result<HttpResponse, reqwest::Error> {
            self.requests.fetch_add(1, Ordering::SeqCst);

            let chunks: Vec<Bytes> = self
                .body
                .chunks(self.chunk_size.max(1))
                .map(Bytes::copy_from_slice)
                .collect();
            let fail_after = self.fail_after;
            let gate = self.gate.clone();
            let content_length = self.advertise_length.then_some(self.body.len() as u64);

            let body = futures::stream::unfold(0usize, move |index| {
                let chunks = chunks.clone();
                let gate = gate.clone();
                async move {
                    if index > 0
                        && let Some(gate) = &gate
                    {
                        gate.notified().await;
                    }
                    if fail_after == Some(index) {
                        return Some((Err(transport_error()), usize::MAX));
                    }
                    let chunk = chunks.get(index)?.clone();
                    Some((Ok(chunk), index + 1))
                }
            });

            Ok(HttpResponse {
                status: self.status,
                content_length,
                body: Box::pin(body),
            })
        }
    }
}
