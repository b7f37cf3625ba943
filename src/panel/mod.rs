//! Client for the proxy panel's admin HTTP API.
//!
//! Every operation shares one [`RetryPolicy`]: each attempt walks the
//! configured schemes (HTTPS first, then plain HTTP) and operations that need
//! authentication fetch a fresh bearer token at the start of every attempt.
//! Panel connectivity problems are mirrored to the [`Notifier`] as they
//! happen so operators do not need to read logs to notice them.

pub(crate) mod retry;
pub(crate) mod transport;

use std::{error::Error, fmt, time::Duration};

use anyhow::Context as _;
use http::{Method, StatusCode};
use serde::Deserialize;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::{
    config::Config,
    notify::{Notifier, escape_html},
};
pub(crate) use retry::RetryPolicy;
use transport::{
    PanelRequest, PanelResponse, PanelTransport, ReqwestTransport, RequestBody, Scheme,
    TransportError,
};

const AUTH_TIMEOUT: Duration = Duration::from_secs(5);
const TOGGLE_TIMEOUT: Duration = Duration::from_secs(5);
const LIST_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound on one operation including all of its retries.
const OPERATION_DEADLINE: Duration = Duration::from_secs(30 * 60);

#[derive(Clone)]
pub(crate) struct Credentials {
    pub(crate) username: String,
    pub(crate) password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Short-lived bearer credential. Not cached between operations.
#[derive(Clone)]
pub(crate) struct PanelToken {
    value: String,
}

impl fmt::Debug for PanelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PanelToken(<redacted>)")
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct PanelUser {
    pub(crate) name: String,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(crate) struct PanelNode {
    pub(crate) id: i64,
    pub(crate) name: String,
    pub(crate) address: String,
    pub(crate) status: String,
    #[serde(default)]
    pub(crate) message: Option<String>,
}

#[derive(Debug)]
pub(crate) enum PanelError {
    /// Every attempt over every scheme failed.
    Unreachable { operation: String, attempts: u32 },
    /// The operation's overall deadline passed before it completed.
    DeadlineExceeded {
        operation: String,
        deadline: Duration,
    },
}

impl fmt::Display for PanelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PanelError::Unreachable {
                operation,
                attempts,
            } => write!(
                f,
                "Failed to {operation} after {attempts} attempts. Make sure the panel is \
                 running and the username and password are correct."
            ),
            PanelError::DeadlineExceeded {
                operation,
                deadline,
            } => write!(f, "Gave up trying to {operation} after {deadline:?}"),
        }
    }
}

impl Error for PanelError {}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct ItemsResponse<T> {
    items: Vec<T>,
}

#[derive(Deserialize)]
struct UserItem {
    username: String,
}

/// One logical panel request, independent of scheme and token.
struct Call {
    operation: String,
    method: Method,
    segments: Vec<String>,
    query: Vec<(&'static str, String)>,
    authenticated: bool,
    body: RequestBody,
    timeout: Duration,
    /// Treat `409 Conflict` as success.
    conflict_ok: bool,
}

#[derive(Debug)]
pub(crate) struct PanelClient<T> {
    transport: T,
    domain: String,
    credentials: Credentials,
    policy: RetryPolicy,
    notifier: Notifier,
}

impl PanelClient<ReqwestTransport> {
    /// Client for the panel named in `config`, over HTTPS with HTTP fallback.
    pub(crate) fn connect(config: &Config, notifier: Notifier) -> anyhow::Result<Self> {
        Ok(Self::new(
            ReqwestTransport::new()?,
            config.panel_domain.trim(),
            config.credentials(),
            RetryPolicy {
                overall_deadline: Some(OPERATION_DEADLINE),
                ..RetryPolicy::default()
            },
            notifier,
        ))
    }
}

impl<T: PanelTransport> PanelClient<T> {
    pub(crate) fn new(
        transport: T,
        domain: impl Into<String>,
        credentials: Credentials,
        policy: RetryPolicy,
        notifier: Notifier,
    ) -> Self {
        Self {
            transport,
            domain: domain.into(),
            credentials,
            policy,
            notifier,
        }
    }

    #[cfg(test)]
    pub(crate) fn transport(&self) -> &T {
        &self.transport
    }

    #[instrument(skip(self))]
    pub(crate) async fn acquire_token(&self) -> Result<PanelToken, PanelError> {
        let call = self.token_call();
        self.with_deadline(&call, self.fetch_token()).await
    }

    /// Users visible to the admin, optionally restricted to one owner.
    #[instrument(skip(self))]
    pub(crate) async fn list_users(
        &self,
        owner: Option<&str>,
    ) -> Result<Vec<PanelUser>, PanelError> {
        let call = Call {
            operation: "get users".to_owned(),
            method: Method::GET,
            segments: vec!["api".to_owned(), "users".to_owned()],
            query: owner
                .map(|owner| vec![("owner_username", owner.to_owned())])
                .unwrap_or_default(),
            authenticated: true,
            body: RequestBody::Empty,
            timeout: LIST_TIMEOUT,
            conflict_ok: false,
        };

        let users = self
            .execute(&call, |response| {
                let items: ItemsResponse<UserItem> = serde_json::from_str(&response.body)
                    .context("Failed to parse user list")?;
                Ok(items
                    .items
                    .into_iter()
                    .map(|user| PanelUser {
                        name: user.username,
                    })
                    .collect::<Vec<_>>())
            })
            .await?;

        debug!(count = users.len(), "Fetched panel users");
        Ok(users)
    }

    #[instrument(skip(self))]
    pub(crate) async fn list_nodes(&self) -> Result<Vec<PanelNode>, PanelError> {
        let call = Call {
            operation: "get nodes".to_owned(),
            method: Method::GET,
            segments: vec!["api".to_owned(), "nodes".to_owned()],
            query: Vec::new(),
            authenticated: true,
            body: RequestBody::Empty,
            timeout: LIST_TIMEOUT,
            conflict_ok: false,
        };

        self.execute(&call, |response| {
            let items: ItemsResponse<PanelNode> =
                serde_json::from_str(&response.body).context("Failed to parse node list")?;
            Ok(items.items)
        })
        .await
    }

    /// Enable or disable a user. Enabling an already enabled user succeeds.
    #[instrument(skip(self))]
    pub(crate) async fn set_user_enabled(
        &self,
        name: &str,
        enabled: bool,
    ) -> Result<(), PanelError> {
        let action = if enabled { "enable" } else { "disable" };

        let call = Call {
            operation: format!("{action} user: {name}"),
            method: Method::POST,
            segments: vec![
                "api".to_owned(),
                "users".to_owned(),
                name.to_owned(),
                action.to_owned(),
            ],
            query: Vec::new(),
            authenticated: true,
            body: RequestBody::Json(serde_json::json!({})),
            timeout: TOGGLE_TIMEOUT,
            conflict_ok: enabled,
        };

        let changed = self
            .execute(&call, |response| Ok(response.status != StatusCode::CONFLICT))
            .await?;

        if !changed {
            debug!(user = name, "User was already enabled");
        } else if enabled {
            info!("Enabled user: {name}");
            self.notifier.log(format!("Enabled user: {}", escape_html(name)));
        } else {
            info!("Disabled user: {name}");
            self.notifier.ban(format!("Disabled user: {}", escape_html(name)));
        }

        Ok(())
    }

    fn token_call(&self) -> Call {
        Call {
            operation: "get token".to_owned(),
            method: Method::POST,
            segments: vec!["api".to_owned(), "admins".to_owned(), "token".to_owned()],
            query: Vec::new(),
            authenticated: false,
            body: RequestBody::Form(vec![
                ("username".to_owned(), self.credentials.username.clone()),
                ("password".to_owned(), self.credentials.password.clone()),
            ]),
            timeout: AUTH_TIMEOUT,
            conflict_ok: false,
        }
    }

    async fn fetch_token(&self) -> Result<PanelToken, PanelError> {
        let call = self.token_call();
        self.retry(
            &call,
            || std::future::ready(Ok(None)),
            &|response: PanelResponse| {
                let token: TokenResponse =
                    serde_json::from_str(&response.body).context("Failed to parse token response")?;
                Ok(PanelToken {
                    value: token.access_token,
                })
            },
        )
        .await
    }

    async fn execute<R, F>(&self, call: &Call, parse: F) -> Result<R, PanelError>
    where
        F: Fn(PanelResponse) -> anyhow::Result<R>,
    {
        let authenticated = call.authenticated;
        let attempts = self.retry(
            call,
            move || async move {
                if authenticated {
                    self.fetch_token().await.map(Some)
                } else {
                    Ok(None)
                }
            },
            &parse,
        );

        self.with_deadline(call, attempts).await
    }

    async fn with_deadline<R>(
        &self,
        call: &Call,
        operation: impl Future<Output = Result<R, PanelError>>,
    ) -> Result<R, PanelError> {
        let Some(deadline) = self.policy.overall_deadline else {
            return operation.await;
        };

        if let Ok(result) = timeout(deadline, operation).await {
            result
        } else {
            let err = PanelError::DeadlineExceeded {
                operation: call.operation.clone(),
                deadline,
            };
            error!("{err}");
            self.notifier.log(escape_html(&err.to_string()));
            Err(err)
        }
    }

    /// The attempt loop. `prepare` runs at the start of each attempt and may
    /// supply a bearer token; its failure aborts the whole operation.
    async fn retry<R, P, PFut, F>(
        &self,
        call: &Call,
        mut prepare: P,
        parse: &F,
    ) -> Result<R, PanelError>
    where
        P: FnMut() -> PFut,
        PFut: Future<Output = Result<Option<PanelToken>, PanelError>>,
        F: Fn(PanelResponse) -> anyhow::Result<R>,
    {
        for attempt in 0..self.policy.max_attempts {
            let token = prepare().await?;

            if let Some(value) = self.try_schemes(call, token.as_ref(), attempt, parse).await {
                return Ok(value);
            }

            let delay = self.policy.delay_after(attempt, &mut rand::rng());
            if let Some(delay) = delay {
                debug!(attempt, ?delay, operation = %call.operation, "Attempt failed, backing off");
                sleep(delay).await;
            }
        }

        let err = PanelError::Unreachable {
            operation: call.operation.clone(),
            attempts: self.policy.max_attempts,
        };
        error!("{err}");
        self.notifier.log(escape_html(&err.to_string()));
        Err(err)
    }

    async fn try_schemes<R, F>(
        &self,
        call: &Call,
        token: Option<&PanelToken>,
        attempt: u32,
        parse: &F,
    ) -> Option<R>
    where
        F: Fn(PanelResponse) -> anyhow::Result<R>,
    {
        for &scheme in &self.policy.schemes {
            let url = match self.url(scheme, call) {
                Ok(url) => url,
                Err(err) => {
                    self.unexpected(scheme, &err);
                    continue;
                }
            };

            let request = PanelRequest {
                method: call.method.clone(),
                url,
                bearer: token.map(|token| token.value.clone()),
                body: call.body.clone(),
                timeout: call.timeout,
            };

            match self.transport.send(request).await {
                Ok(response)
                    if response.status.is_success()
                        || (call.conflict_ok && response.status == StatusCode::CONFLICT) =>
                {
                    match parse(response) {
                        Ok(value) => return Some(value),
                        Err(err) => self.unexpected(scheme, &err),
                    }
                }
                Ok(response) => {
                    let message = format!("[{}] {}", response.status.as_u16(), response.body);
                    error!(%scheme, attempt, operation = %call.operation, "{message}");
                    self.notifier.log(escape_html(&message));
                }
                Err(TransportError::Tls(err)) => {
                    debug!(%scheme, attempt, operation = %call.operation, "TLS failure: {err:#}");
                }
                Err(TransportError::Other(err)) => self.unexpected(scheme, &err),
            }
        }

        None
    }

    /// Unclassified failures on the secure scheme just fall through to the
    /// next scheme; on the insecure one they are reported.
    fn unexpected(&self, scheme: Scheme, err: &anyhow::Error) {
        if scheme == Scheme::Https {
            debug!(%scheme, "Request failed, trying next scheme: {err:#}");
            return;
        }

        let message = format!("Unexpected error: {err:#}");
        warn!(%scheme, "{message}");
        self.notifier.log(escape_html(&message));
    }

    fn url(&self, scheme: Scheme, call: &Call) -> anyhow::Result<Url> {
        let mut url = Url::parse(&format!("{scheme}://{}", self.domain))
            .with_context(|| format!("Invalid panel domain {:?}", self.domain))?;

        url.path_segments_mut()
            .map_err(|()| anyhow::anyhow!("Panel domain {:?} cannot be a base URL", self.domain))?
            .clear()
            .extend(&call.segments);

        if !call.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &call.query {
                pairs.append_pair(key, value);
            }
        }

        Ok(url)
    }
}
