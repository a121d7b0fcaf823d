//! Thin typed wrapper that issues HTTP calls and opens WebSockets against
//! Upstream. Does not interpret payloads beyond the transaction message
//! envelope; the default exchange format is Upstream's versioned JSON API
//! ("v2").

use reqwest::Method;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio_tungstenite::connect_async;
use tracing::{instrument, trace};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::errors::GatewayError;
use crate::model_uri::ModelUri;
use crate::transaction::actor::UpstreamSocket;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct TransactionOpenRequest {
    data: Uuid,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct TransactionOpenResponse {
    data: TransactionOpenResponseData,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct TransactionOpenResponseData {
    uri: String,
}

pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: url::Url,
}

impl UpstreamClient {
    pub fn new(config: &AppConfig) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_millis(
                config.upstream_connect_timeout_ms,
            ))
            .build()
            .map_err(GatewayError::Reqwest)?;

        let base_url = config.upstream_base_url().map_err(|err| {
            GatewayError::GatewayForwardError(format!("invalid upstream base url: {err}").into())
        })?;

        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &url::Url {
        &self.base_url
    }

    /// `POST {base}/transaction?modeluri=<uri>` → `{data: {uri: "..."}}`.
    #[instrument(level = "debug", skip(self))]
    pub async fn create_transaction(
        &self,
        model_uri: &ModelUri,
        client_id: Uuid,
    ) -> Result<String, GatewayError> {
        let url = self.join_with_modeluri("transaction", model_uri)?;

        let response = self
            .http
            .post(url)
            .json(&TransactionOpenRequest { data: client_id })
            .send()
            .await
            .map_err(GatewayError::Reqwest)?;

        self.expect_success(&response).await?;

        let body: TransactionOpenResponse = response.json().await.map_err(GatewayError::Reqwest)?;
        Ok(body.data.uri)
    }

    /// Dials a WebSocket at `transaction_uri`, translating its scheme from
    /// `http(s)` to `ws(s)` if needed.
    #[instrument(level = "debug", skip(self))]
    pub async fn dial_transaction_socket(
        &self,
        transaction_uri: &str,
    ) -> Result<UpstreamSocket, GatewayError> {
        let ws_url = Self::to_ws_url(transaction_uri)?;
        trace!(%ws_url, "dialing upstream transaction socket");
        let (socket, _response) = connect_async(ws_url.as_str())
            .await
            .map_err(GatewayError::WebSocket)?;
        Ok(socket)
    }

    /// Dials Upstream's WebSocket for an arbitrary backstopped path, for the
    /// gateway's generic WS bridge (as opposed to `dial_transaction_socket`,
    /// which expects the transaction protocol's UUID-first-frame handshake).
    #[instrument(level = "debug", skip(self))]
    pub async fn dial_upstream_ws(
        &self,
        path_and_query: &str,
    ) -> Result<UpstreamSocket, GatewayError> {
        let url = self
            .base_url
            .join(path_and_query.trim_start_matches('/'))
            .map_err(|err| {
                GatewayError::GatewayForwardError(format!("bad forward path: {err}").into())
            })?;
        let ws_url = Self::to_ws_url(url.as_str())?;
        trace!(%ws_url, "dialing upstream websocket");
        let (socket, _response) = connect_async(ws_url.as_str())
            .await
            .map_err(GatewayError::WebSocket)?;
        Ok(socket)
    }

    /// Forwards an arbitrary request verbatim (method, path+query, body) and
    /// returns the deserialized body. Used by the gateway's reverse-proxy
    /// path for requests that aren't websocket upgrades.
    pub async fn forward(
        &self,
        method: Method,
        path_and_query: &str,
        headers: reqwest::header::HeaderMap,
        body: Vec<u8>,
    ) -> Result<reqwest::Response, GatewayError> {
        let url = self
            .base_url
            .join(path_and_query.trim_start_matches('/'))
            .map_err(|err| {
                GatewayError::GatewayForwardError(format!("bad forward path: {err}").into())
            })?;

        self.http
            .request(method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(GatewayError::Reqwest)
    }

    fn join_with_modeluri(
        &self,
        path: &str,
        model_uri: &ModelUri,
    ) -> Result<url::Url, GatewayError> {
        let mut url = self.base_url.join(path).map_err(|err| {
            GatewayError::GatewayForwardError(format!("bad upstream path {path}: {err}").into())
        })?;
        url.query_pairs_mut()
            .append_pair("modeluri", model_uri.as_str());
        Ok(url)
    }

    async fn expect_success(&self, response: &reqwest::Response) -> Result<(), GatewayError> {
        if response.status().is_success() {
            return Ok(());
        }
        Err(GatewayError::UpstreamError {
            status: response.status(),
            body: format!("request to {} failed", response.url()),
        })
    }

    /// Pure translation of an `http(s)://` transaction URI to `ws(s)://`.
    pub fn to_ws_url(uri: &str) -> Result<url::Url, GatewayError> {
        let mut url = url::Url::parse(uri).map_err(|err| {
            GatewayError::GatewayForwardError(format!("invalid transaction uri: {err}").into())
        })?;
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => other,
        };
        url.set_scheme(scheme).map_err(|_| {
            GatewayError::GatewayForwardError("could not set websocket scheme".into())
        })?;
        Ok(url)
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        model_uri: Option<&ModelUri>,
    ) -> Result<T, GatewayError> {
        let url = match model_uri {
            Some(uri) => self.join_with_modeluri(path, uri)?,
            None => self.base_url.join(path).map_err(|err| {
                GatewayError::GatewayForwardError(format!("bad upstream path {path}: {err}").into())
            })?,
        };
        let response = self.http.get(url).send().await.map_err(GatewayError::Reqwest)?;
        self.expect_success(&response).await?;
        response.json().await.map_err(GatewayError::Reqwest)
    }

    pub async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        model_uri: Option<&ModelUri>,
        body: &B,
    ) -> Result<T, GatewayError> {
        let url = match model_uri {
            Some(uri) => self.join_with_modeluri(path, uri)?,
            None => self.base_url.join(path).map_err(|err| {
                GatewayError::GatewayForwardError(format!("bad upstream path {path}: {err}").into())
            })?,
        };
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(GatewayError::Reqwest)?;
        self.expect_success(&response).await?;
        response.json().await.map_err(GatewayError::Reqwest)
    }
}
