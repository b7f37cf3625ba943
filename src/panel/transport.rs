use std::{error::Error, fmt, io, time::Duration};

use anyhow::anyhow;
use http::{HeaderValue, Method, StatusCode, header::AUTHORIZATION};
use tokio::time::timeout;
use tracing::trace;
use url::Url;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Scheme {
    Https,
    Http,
}

impl Scheme {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Scheme::Https => "https",
            Scheme::Http => "http",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum RequestBody {
    Empty,
    Form(Vec<(String, String)>),
    Json(serde_json::Value),
}

#[derive(Clone, Debug)]
pub(crate) struct PanelRequest {
    pub(crate) method: Method,
    pub(crate) url: Url,
    pub(crate) bearer: Option<String>,
    pub(crate) body: RequestBody,
    pub(crate) timeout: Duration,
}

#[derive(Clone, Debug)]
pub(crate) struct PanelResponse {
    pub(crate) status: StatusCode,
    pub(crate) body: String,
}

/// Transport-level failure of a single request.
#[derive(Debug)]
pub(crate) enum TransportError {
    /// TLS handshake or certificate failure, worth retrying over plain HTTP.
    Tls(anyhow::Error),
    /// Anything else: refused connection, DNS, timeout, malformed body.
    Other(anyhow::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransportError::Tls(err) => write!(f, "TLS failure: {err:#}"),
            TransportError::Other(err) => write!(f, "{err:#}"),
        }
    }
}

impl Error for TransportError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TransportError::Tls(err) | TransportError::Other(err) => Some(err.as_ref()),
        }
    }
}

pub(crate) trait PanelTransport {
    fn send(
        &self,
        request: PanelRequest,
    ) -> impl Future<Output = Result<PanelResponse, TransportError>> + Send;
}

/// Production transport on top of `reqwest`.
///
/// Certificate validation is disabled: panels are routinely deployed with
/// self-signed certificates on bare IP addresses.
#[derive(Clone, Debug)]
pub(crate) struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub(crate) fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|err| anyhow!(err).context("Failed to build panel HTTP client"))?;

        Ok(Self { client })
    }
}

impl PanelTransport for ReqwestTransport {
    async fn send(&self, request: PanelRequest) -> Result<PanelResponse, TransportError> {
        let PanelRequest {
            method,
            url,
            bearer,
            body,
            timeout: request_timeout,
        } = request;

        trace!(%method, %url, "Sending panel request");

        let mut builder = self.client.request(method, url.clone());

        if let Some(token) = bearer {
            let mut header_value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|err| TransportError::Other(anyhow!(err)))?;
            header_value.set_sensitive(true);
            builder = builder.header(AUTHORIZATION, header_value);
        }

        builder = match body {
            RequestBody::Empty => builder,
            RequestBody::Form(fields) => builder.form(&fields),
            RequestBody::Json(value) => builder.json(&value),
        };

        let response = match timeout(request_timeout, builder.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => return Err(classify(err)),
            Err(_) => {
                return Err(TransportError::Other(anyhow!(
                    "Request to {url} timed out ({request_timeout:?})"
                )));
            }
        };

        let status = response.status();

        let body = match timeout(request_timeout, response.text()).await {
            Ok(Ok(body)) => body,
            Ok(Err(err)) => return Err(classify(err)),
            Err(_) => {
                return Err(TransportError::Other(anyhow!(
                    "Timed out while receiving response body from {url}"
                )));
            }
        };

        Ok(PanelResponse { status, body })
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if is_tls_failure(&err) {
        TransportError::Tls(anyhow!(err))
    } else {
        TransportError::Other(anyhow!(err))
    }
}

/// Walk the source chain looking for a rustls error. `io::Error` hides its
/// payload from `source()`, so custom I/O errors are unwrapped explicitly.
fn is_tls_failure(err: &(dyn Error + 'static)) -> bool {
    let mut current = Some(err);

    while let Some(err) = current {
        if err.is::<rustls::Error>() {
            return true;
        }

        if let Some(io_err) = err.downcast_ref::<io::Error>()
            && let Some(inner) = io_err.get_ref()
            && is_tls_failure(inner)
        {
            return true;
        }

        current = err.source();
    }

    false
}
