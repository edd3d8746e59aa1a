use secrecy::{ExposeSecret as _, SecretString};
use serde::Deserialize;
use url::Url;
use uuid::Uuid;

use crate::Result;
use crate::error::Error;

/// Relay started locally by `mix phx.server`.
pub const LOCAL_ENDPOINT: &str = "ws://localhost:4000";
/// Public relay.
pub const REMOTE_ENDPOINT: &str = "ws://newnode.tallostudios.com:42490";

const SOCKET_PATH: &str = "/socket/websocket";
const SESSION_KEY_PARAM: &str = "sessionkey";
const REDACTED: &str = "REDACTED";

/// Which relay to connect to.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Endpoint {
    Local,
    #[default]
    Remote,
    /// Any other relay. The socket path is appended when the URL has none.
    Custom(Url),
}

impl Endpoint {
    /// Local or remote relay, the way the host's `local` setting selects it.
    #[must_use]
    pub fn from_local_flag(local: bool) -> Self {
        if local { Self::Local } else { Self::Remote }
    }

    /// Parse a custom relay address.
    pub fn custom(url: &str) -> Result<Self> {
        Ok(Self::Custom(Url::parse(url)?))
    }

    fn base_url(&self) -> Result<Url> {
        let url = match self {
            Self::Local => Url::parse(LOCAL_ENDPOINT)?,
            Self::Remote => Url::parse(REMOTE_ENDPOINT)?,
            Self::Custom(url) => url.clone(),
        };

        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::validation(format!(
                "relay endpoint must use ws or wss, got {}",
                url.scheme()
            )));
        }

        Ok(url)
    }
}

/// Game-account credentials presented to the relay.
///
/// The session key is kept in a [`SecretString`] so it is redacted from `Debug` output.
#[derive(Clone, Debug, Deserialize)]
pub struct Credentials {
    #[serde(alias = "playeruid")]
    pub(crate) player_uid: String,
    #[serde(alias = "sessionkey")]
    pub(crate) session_key: SecretString,
}

impl Credentials {
    #[must_use]
    pub fn new<S: Into<String>>(player_uid: S, session_key: String) -> Self {
        Self {
            player_uid: player_uid.into(),
            session_key: SecretString::from(session_key),
        }
    }

    #[must_use]
    pub fn player_uid(&self) -> &str {
        &self.player_uid
    }

    #[must_use]
    pub fn session_key(&self) -> &SecretString {
        &self.session_key
    }
}

/// Build the socket URL: `{endpoint}/socket/websocket?uid=..&sessionkey=..&auth_token=..&module=..`.
///
/// Every value is form-urlencoded, so a space goes out as `+` rather than `%20` and the
/// relay has to decode the query as a form. The result contains the session key; log it through
/// [`redact_endpoint`].
pub fn connection_url(
    endpoint: &Endpoint,
    credentials: &Credentials,
    token: Uuid,
    module: &str,
) -> Result<Url> {
    if module.is_empty() {
        return Err(Error::validation("connection module must not be empty"));
    }

    let mut url = endpoint.base_url()?;
    if url.path().is_empty() || url.path() == "/" {
        url.set_path(SOCKET_PATH);
    }

    url.query_pairs_mut()
        .clear()
        .append_pair("uid", &credentials.player_uid)
        .append_pair(SESSION_KEY_PARAM, credentials.session_key.expose_secret())
        .append_pair("auth_token", &token.to_string())
        .append_pair("module", module);

    Ok(url)
}

/// Render `url` for logs with the session key replaced by `REDACTED`.
#[must_use]
pub fn redact_endpoint(url: &Url) -> String {
    if !url.query_pairs().any(|(key, _)| key == SESSION_KEY_PARAM) {
        return url.to_string();
    }

    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(key, value)| {
            let value = if key == SESSION_KEY_PARAM {
                REDACTED.to_owned()
            } else {
                value.into_owned()
            };
            (key.into_owned(), value)
        })
        .collect();

    let mut redacted = url.clone();
    redacted.query_pairs_mut().clear().extend_pairs(pairs);
    redacted.to_string()
}
