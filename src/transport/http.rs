//! HTTP transport variant.

use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::ClientError;
use crate::trust::TrustedAssetsStore;

use super::{client_assertion, Response, Transport};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
/// Extra transport allowance on top of the server-side long-poll window.
const LONG_POLL_OFFSET: Duration = Duration::from_millis(100);

pub struct HttpConnection {
    store: Arc<dyn TrustedAssetsStore>,
    agent: ureq::Agent,
    authorization: Mutex<Option<String>>,
}

impl HttpConnection {
    pub fn new(store: Arc<dyn TrustedAssetsStore>) -> HttpConnection {
        let connector =
            Arc::new(native_tls::TlsConnector::new().expect("Unable to build TLS connector"));
        let agent = ureq::AgentBuilder::new().tls_connector(connector).build();

        HttpConnection {
            store,
            agent,
            authorization: Mutex::new(None),
        }
    }

    fn base_url(&self) -> String {
        format!(
            "https://{}:{}",
            self.store.server_host(),
            self.store.server_port()
        )
    }

    fn authorization(&self) -> Result<String, ClientError> {
        let mut guard = self.authorization.lock().expect("authorization lock");
        if let Some(value) = guard.as_ref() {
            return Ok(value.clone());
        }
        let value = self.build_authorization()?;
        *guard = Some(value.clone());
        Ok(value)
    }

    fn refresh_authorization(&self) -> Result<String, ClientError> {
        let value = self.build_authorization()?;
        *self.authorization.lock().expect("authorization lock") = Some(value.clone());
        Ok(value)
    }

    fn build_authorization(&self) -> Result<String, ClientError> {
        // Prefer the private key once activation generated one.
        let use_private_key = self.store.is_activated();
        Ok(format!(
            "Bearer {}",
            client_assertion(self.store.as_ref(), use_private_key)?
        ))
    }

    fn send(
        &self,
        method: &str,
        rest_api: &str,
        payload: Option<&[u8]>,
        timeout: Option<Duration>,
    ) -> Result<Response, ClientError> {
        let long_poll = is_long_poll(rest_api);
        let timeout = timeout.unwrap_or_else(|| {
            long_poll_timeout(rest_api)
                .map(|t| t + LONG_POLL_OFFSET)
                .unwrap_or(DEFAULT_TIMEOUT)
        });

        let authorization = self.authorization()?;
        let response = self.send_once(method, rest_api, payload, timeout, &authorization);

        match response {
            Ok(response) if response.status == 401 || response.status == 403 => {
                // Stale credentials: refresh and retry exactly once.
                log::debug!(
                    "Request to {rest_api} was rejected with status {}, refreshing credentials",
                    response.status
                );
                let authorization = self.refresh_authorization()?;
                self.send_once(method, rest_api, payload, timeout, &authorization)
            }
            Err(ClientError::Timeout) if long_poll => {
                // The server closed its half of the long poll on purpose.
                log::trace!("Long poll ended without data");
                Ok(Response::new(200, Vec::new()))
            }
            other => other,
        }
    }

    fn send_once(
        &self,
        method: &str,
        rest_api: &str,
        payload: Option<&[u8]>,
        timeout: Duration,
        authorization: &str,
    ) -> Result<Response, ClientError> {
        let url = format!("{}{}", self.base_url(), rest_api);
        log::trace!("{method} {url}");

        let mut request = self
            .agent
            .request(method, &url)
            .timeout(timeout)
            .set("Content-Type", "application/json")
            .set("Authorization", authorization);

        if let Some(endpoint_id) = self.store.endpoint_id() {
            request = request.set("X-EndpointId", &endpoint_id);
        } else {
            request = request.set("X-EndpointId", &self.store.client_id());
        }

        let result = match payload {
            Some(payload) => request.send_bytes(payload),
            None => request.call(),
        };

        match result {
            Ok(response) => Ok(read_response(response)),
            Err(ureq::Error::Status(status, response)) => {
                log::debug!("Request to {url} failed with status code {status}");
                let mut response = read_response(response);
                response.status = status;
                Ok(response)
            }
            Err(ureq::Error::Transport(transport)) => {
                log::debug!("Request to {url} failed with transport error: {transport}");
                // DNS and connect failures have their own kinds; what is
                // left on an established socket is read/write trouble,
                // dominated by the configured timeout.
                if transport.kind() == ureq::ErrorKind::Io {
                    Err(ClientError::Timeout)
                } else {
                    Err(ClientError::Network(transport.to_string()))
                }
            }
        }
    }
}

impl Transport for HttpConnection {
    fn get(&self, rest_api: &str) -> Result<Response, ClientError> {
        self.send("GET", rest_api, None, None)
    }

    fn post(
        &self,
        rest_api: &str,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Response, ClientError> {
        self.send("POST", rest_api, Some(payload), timeout)
    }

    fn supports_long_polling(&self) -> bool {
        true
    }

    fn refresh_credentials(&self) {
        // Drop the cached assertion; the next request rebuilds it.
        *self.authorization.lock().expect("authorization lock") = None;
    }
}

fn read_response(response: ureq::Response) -> Response {
    let status = response.status();
    let headers = response
        .headers_names()
        .into_iter()
        .filter_map(|name| {
            response
                .header(&name)
                .map(|value| (name.clone(), value.to_owned()))
        })
        .collect();

    let mut data = Vec::new();
    if let Err(e) = response.into_reader().read_to_end(&mut data) {
        log::warn!("Unable to read response body: {e}");
    }

    Response {
        status,
        data,
        headers,
    }
}

fn is_long_poll(rest_api: &str) -> bool {
    rest_api.contains("iot.sync")
}

/// Server-side wait advertised in the query, in seconds.
fn long_poll_timeout(rest_api: &str) -> Option<Duration> {
    let (_, query) = rest_api.split_once('?')?;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key == "iot.timeout" {
            value.parse::<u64>().ok().map(Duration::from_secs)
        } else {
            None
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn long_poll_query_is_recognized() {
        assert!(is_long_poll("/messages?acceptBytes=1024&iot.sync&iot.timeout=20"));
        assert!(!is_long_poll("/messages?acceptBytes=1024"));
    }

    #[test]
    fn long_poll_timeout_is_parsed_from_query() {
        assert_eq!(
            long_poll_timeout("/messages?acceptBytes=1024&iot.sync&iot.timeout=20"),
            Some(Duration::from_secs(20))
        );
        assert_eq!(long_poll_timeout("/messages?iot.sync"), None);
        assert_eq!(long_poll_timeout("/messages"), None);
    }
}
