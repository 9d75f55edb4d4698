use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Empty;
use hyper::{Request, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::trace;
use uuid::Uuid;

use crate::channel::stream_guard::BoxReader;
use crate::dispatcher::dispatcher::{CHANNEL_ID_PARAM, DISPATCHER_ID_HEADER};
use crate::http::body::BodyReader;

/// Sends probes to the rendezvous address. The load balancer behind the address forwards each
///  probe to some dispatcher, whose response becomes an in-channel.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProbeClient: Send + Sync {
    /// Returns the response body if the receiving dispatcher opened a channel for this probe,
    ///  or `None` for responses without a channel (self probes, filtered probes, status).
    async fn probe(&self, from: &str, channel_id: Uuid) -> anyhow::Result<Option<BoxReader>>;
}

pub struct HttpProbeClient {
    function_address: Uri,
    client: Client<HttpConnector, Empty<Bytes>>,
}

impl HttpProbeClient {
    pub fn new(function_address: Uri) -> HttpProbeClient {
        HttpProbeClient {
            function_address,
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    fn probe_uri(&self, channel_id: Uuid) -> anyhow::Result<Uri> {
        let address = self.function_address.to_string();
        let separator = if address.contains('?') { '&' } else { '?' };
        Ok(format!("{}{}{}={}", address, separator, CHANNEL_ID_PARAM, channel_id).parse()?)
    }
}

#[async_trait]
impl ProbeClient for HttpProbeClient {
    async fn probe(&self, from: &str, channel_id: Uuid) -> anyhow::Result<Option<BoxReader>> {
        let request = Request::get(self.probe_uri(channel_id)?)
            .header(DISPATCHER_ID_HEADER, from)
            .body(Empty::new())?;

        let response = self.client.request(request).await?;
        trace!(%channel_id, status = %response.status(), "probe response");

        match response.status() {
            StatusCode::ACCEPTED => Ok(Some(Box::pin(BodyReader::new(response.into_body())))),
            StatusCode::OK | StatusCode::NO_CONTENT | StatusCode::SERVICE_UNAVAILABLE => Ok(None),
            status => bail!("unexpected probe response status {}", status),
        }
    }
}
