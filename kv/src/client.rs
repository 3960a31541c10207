// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP client for the Consul-shaped KV API.
//!
//! Only the handful of primitives the rest of the system needs: get,
//! put, compare-and-swap keyed on ModifyIndex, delete, session-bound
//! acquire/release, and a list that blocks server-side until something
//! under the prefix changes past a wait index.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;

use crate::error::KvError;

/// Timeout for ordinary (non-blocking) KV operations.
const OP_TIMEOUT: Duration = Duration::from_secs(15);

/// Slack added to a blocking list's wait duration before the client
/// gives up on the response.
const LIST_TIMEOUT_SLACK: Duration = Duration::from_secs(15);

#[derive(Clone, Debug)]
pub struct KvConfig {
    /// Address of the KV server, e.g. `127.0.0.1:8500`.
    pub address: String,
    /// ACL token sent with every request, if any.
    pub token: Option<String>,
}

/// One decoded KV entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
    pub modify_index: u64,
    pub session: Option<String>,
}

/// Wire form of a KV entry as the server returns it.
#[derive(Debug, Deserialize)]
struct RawKvPair {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value")]
    value: Option<String>,
    #[serde(rename = "ModifyIndex")]
    modify_index: u64,
    #[serde(rename = "Session")]
    session: Option<String>,
}

impl RawKvPair {
    fn decode(self, verb: &'static str) -> Result<KvPair, KvError> {
        let value = match &self.value {
            None => Vec::new(),
            Some(encoded) => BASE64.decode(encoded).map_err(|err| {
                KvError::UnexpectedResponse {
                    verb,
                    key: self.key.clone(),
                    detail: format!("bad base64 value: {err}"),
                }
            })?,
        };
        Ok(KvPair {
            key: self.key,
            value,
            modify_index: self.modify_index,
            session: self.session,
        })
    }
}

#[derive(Clone, Debug)]
pub struct KvClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl KvClient {
    pub fn new(config: &KvConfig) -> KvClient {
        KvClient {
            client: reqwest::ClientBuilder::new()
                .connect_timeout(OP_TIMEOUT)
                .build()
                .unwrap(),
            base_url: format!("http://{}", config.address),
            token: config.token.clone(),
        }
    }

    pub(crate) fn base_url(&self) -> &str {
        &self.base_url
    }

    fn kv_url(&self, key: &str) -> String {
        format!("{}/v1/kv/{}", self.base_url, key)
    }

    pub(crate) fn request(
        &self,
        method: reqwest::Method,
        url: String,
    ) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, url);
        if let Some(token) = &self.token {
            builder = builder.header("X-Consul-Token", token);
        }
        builder
    }

    /// Fetch one key. `Ok(None)` means the key does not exist.
    pub async fn get(
        &self,
        key: &str,
    ) -> Result<Option<(Vec<u8>, u64)>, KvError> {
        let resp = self
            .request(reqwest::Method::GET, self.kv_url(key))
            .timeout(OP_TIMEOUT)
            .send()
            .await
            .map_err(|err| KvError::Transport {
                verb: "get",
                key: key.to_string(),
                err,
            })?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = check_status("get", key, resp)?;
        let raw: Vec<RawKvPair> =
            resp.json().await.map_err(|err| KvError::Transport {
                verb: "get",
                key: key.to_string(),
                err,
            })?;
        match raw.into_iter().next() {
            None => Ok(None),
            Some(pair) => {
                let pair = pair.decode("get")?;
                Ok(Some((pair.value, pair.modify_index)))
            }
        }
    }

    /// Unconditional put; replacement-by-overwrite semantics.
    pub async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), KvError> {
        let resp = self
            .request(reqwest::Method::PUT, self.kv_url(key))
            .timeout(OP_TIMEOUT)
            .body(value)
            .send()
            .await
            .map_err(|err| KvError::Transport {
                verb: "put",
                key: key.to_string(),
                err,
            })?;
        let resp = check_status("put", key, resp)?;
        let ok = parse_bool("put", key, resp).await?;
        if !ok {
            return Err(KvError::UnexpectedResponse {
                verb: "put",
                key: key.to_string(),
                detail: "server refused unconditional put".to_string(),
            });
        }
        Ok(())
    }

    /// Put only if the key's current ModifyIndex equals
    /// `expected_index`. An `expected_index` of zero means the key must
    /// not exist.
    pub async fn cas(
        &self,
        key: &str,
        value: Vec<u8>,
        expected_index: u64,
    ) -> Result<(), KvError> {
        let resp = self
            .request(reqwest::Method::PUT, self.kv_url(key))
            .query(&[("cas", expected_index.to_string())])
            .timeout(OP_TIMEOUT)
            .body(value)
            .send()
            .await
            .map_err(|err| KvError::Transport {
                verb: "cas",
                key: key.to_string(),
                err,
            })?;
        let resp = check_status("cas", key, resp)?;
        let ok = parse_bool("cas", key, resp).await?;
        if !ok {
            return Err(KvError::Conflict { key: key.to_string() });
        }
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<(), KvError> {
        let resp = self
            .request(reqwest::Method::DELETE, self.kv_url(key))
            .timeout(OP_TIMEOUT)
            .send()
            .await
            .map_err(|err| KvError::Transport {
                verb: "delete",
                key: key.to_string(),
                err,
            })?;
        check_status("delete", key, resp)?;
        Ok(())
    }

    /// Write `value` and bind the key to `session` in one atomic step.
    /// Returns false when another session holds the key; that is a
    /// caller-visible outcome, not an error.
    pub async fn acquire(
        &self,
        key: &str,
        value: Vec<u8>,
        session: &str,
    ) -> Result<bool, KvError> {
        let resp = self
            .request(reqwest::Method::PUT, self.kv_url(key))
            .query(&[("acquire", session)])
            .timeout(OP_TIMEOUT)
            .body(value)
            .send()
            .await
            .map_err(|err| KvError::Transport {
                verb: "acquire",
                key: key.to_string(),
                err,
            })?;
        let resp = check_status("acquire", key, resp)?;
        parse_bool("acquire", key, resp).await
    }

    /// Release a session's hold on a key without deleting it.
    pub async fn release(
        &self,
        key: &str,
        session: &str,
    ) -> Result<(), KvError> {
        let resp = self
            .request(reqwest::Method::PUT, self.kv_url(key))
            .query(&[("release", session)])
            .timeout(OP_TIMEOUT)
            .send()
            .await
            .map_err(|err| KvError::Transport {
                verb: "release",
                key: key.to_string(),
                err,
            })?;
        check_status("release", key, resp)?;
        Ok(())
    }

    /// List every key under `prefix`, blocking server-side for up to
    /// `wait` until some entry's ModifyIndex exceeds `wait_index`.
    /// Returns the full current set and the new index to wait on. A
    /// prefix with no keys is an empty set, not an error.
    pub async fn list(
        &self,
        prefix: &str,
        wait_index: u64,
        wait: Duration,
    ) -> Result<(Vec<KvPair>, u64), KvError> {
        let resp = self
            .request(reqwest::Method::GET, self.kv_url(prefix))
            .query(&[
                ("recurse", "true".to_string()),
                ("index", wait_index.to_string()),
                ("wait", format!("{}s", wait.as_secs())),
            ])
            .timeout(wait + LIST_TIMEOUT_SLACK)
            .send()
            .await
            .map_err(|err| KvError::Transport {
                verb: "list",
                key: prefix.to_string(),
                err,
            })?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            let index = consul_index(prefix, &resp).unwrap_or(wait_index);
            return Ok((Vec::new(), index));
        }
        let resp = check_status("list", prefix, resp)?;
        let index = consul_index(prefix, &resp)?;
        let raw: Vec<RawKvPair> =
            resp.json().await.map_err(|err| KvError::Transport {
                verb: "list",
                key: prefix.to_string(),
                err,
            })?;
        let pairs = raw
            .into_iter()
            .map(|pair| pair.decode("list"))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((pairs, index))
    }
}

fn check_status(
    verb: &'static str,
    key: &str,
    resp: reqwest::Response,
) -> Result<reqwest::Response, KvError> {
    let status = resp.status();
    if status.is_server_error() {
        return Err(KvError::ServerError {
            verb,
            key: key.to_string(),
            status: status.as_u16(),
        });
    }
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(KvError::NotFound { key: key.to_string() });
    }
    if !status.is_success() {
        return Err(KvError::UnexpectedStatus {
            verb,
            key: key.to_string(),
            status: status.as_u16(),
        });
    }
    Ok(resp)
}

async fn parse_bool(
    verb: &'static str,
    key: &str,
    resp: reqwest::Response,
) -> Result<bool, KvError> {
    resp.json::<bool>().await.map_err(|err| KvError::Transport {
        verb,
        key: key.to_string(),
        err,
    })
}

fn consul_index(
    prefix: &str,
    resp: &reqwest::Response,
) -> Result<u64, KvError> {
    let header = resp.headers().get("X-Consul-Index").ok_or_else(|| {
        KvError::UnexpectedResponse {
            verb: "list",
            key: prefix.to_string(),
            detail: "missing X-Consul-Index header".to_string(),
        }
    })?;
    header
        .to_str()
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .ok_or_else(|| KvError::UnexpectedResponse {
            verb: "list",
            key: prefix.to_string(),
            detail: "unparseable X-Consul-Index header".to_string(),
        })
}

#[cfg(test)]
mod test {
    use super::*;
    use httptest::Expectation;
    use httptest::matchers::request;
    use httptest::responders::{json_encoded, status_code};

    fn client_for(server: &httptest::Server) -> KvClient {
        let config = KvConfig {
            address: server.addr().to_string(),
            token: None,
        };
        KvClient::new(&config)
    }

    #[tokio::test]
    async fn test_get_decodes_value_and_index() {
        let server = httptest::Server::run();
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                "/v1/kv/intent/n1/web",
            ))
            .respond_with(json_encoded(serde_json::json!([{
                "Key": "intent/n1/web",
                "Value": BASE64.encode("id: web\n"),
                "ModifyIndex": 42,
                "Session": null,
            }]))),
        );

        let client = client_for(&server);
        let (value, index) =
            client.get("intent/n1/web").await.unwrap().unwrap();
        assert_eq!(value, b"id: web\n");
        assert_eq!(index, 42);
    }

    #[tokio::test]
    async fn test_get_missing_key_is_none() {
        let server = httptest::Server::run();
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                "/v1/kv/intent/n1/gone",
            ))
            .respond_with(status_code(404)),
        );

        let client = client_for(&server);
        assert!(client.get("intent/n1/gone").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cas_refusal_is_conflict() {
        let server = httptest::Server::run();
        server.expect(
            Expectation::matching(request::method_path(
                "PUT",
                "/v1/kv/rcs/rc-new",
            ))
            .respond_with(json_encoded(false)),
        );

        let client = client_for(&server);
        let err =
            client.cas("rcs/rc-new", b"{}".to_vec(), 7).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_server_error_classifies_transient() {
        let server = httptest::Server::run();
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                "/v1/kv/intent/n1/web",
            ))
            .respond_with(status_code(503)),
        );

        let client = client_for(&server);
        let err = client.get("intent/n1/web").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_list_returns_set_and_header_index() {
        let server = httptest::Server::run();
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                "/v1/kv/intent/n1",
            ))
            .respond_with(
                status_code(200)
                    .append_header("X-Consul-Index", "99")
                    .append_header("Content-Type", "application/json")
                    .body(
                        serde_json::json!([{
                            "Key": "intent/n1/web",
                            "Value": BASE64.encode("id: web\n"),
                            "ModifyIndex": 99,
                            "Session": null,
                        }])
                        .to_string(),
                    ),
            ),
        );

        let client = client_for(&server);
        let (pairs, index) = client
            .list("intent/n1", 0, Duration::from_secs(0))
            .await
            .unwrap();
        assert_eq!(index, 99);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].key, "intent/n1/web");
        assert_eq!(pairs[0].value, b"id: web\n");
    }

    #[tokio::test]
    async fn test_list_empty_prefix_is_empty_set() {
        let server = httptest::Server::run();
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                "/v1/kv/rolls",
            ))
            .respond_with(
                status_code(404).append_header("X-Consul-Index", "12"),
            ),
        );

        let client = client_for(&server);
        let (pairs, index) =
            client.list("rolls", 0, Duration::from_secs(0)).await.unwrap();
        assert!(pairs.is_empty());
        assert_eq!(index, 12);
    }

    #[tokio::test]
    async fn test_acquire_reports_contention() {
        let server = httptest::Server::run();
        server.expect(
            Expectation::matching(request::method_path(
                "PUT",
                "/v1/kv/locks/rcs/rc-new",
            ))
            .respond_with(json_encoded(false)),
        );

        let client = client_for(&server);
        let acquired = client
            .acquire("locks/rcs/rc-new", b"owner".to_vec(), "sess-1")
            .await
            .unwrap();
        assert!(!acquired);
    }
}
