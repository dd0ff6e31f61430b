// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client for the phpIPAM REST API.

use super::AddressId;
use super::AddressManager;
use super::AddressPayload;
use super::AddressQuery;
use super::AddressRecord;
use super::SubnetId;
use super::SubnetInfo;
use crate::backoff::retry_notify;
use crate::backoff::retry_policy_attempts;
use crate::backoff::BackoffError;
use crate::config::IpamConfig;
use crate::error::AddressError;
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use reqwest::Method;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Deserializer;
use slog::debug;
use slog::o;
use slog::warn;
use slog::Logger;
use std::net::IpAddr;
use std::time::Duration;

/// Response envelope wrapping every phpIPAM answer.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
    message: Option<String>,
    #[serde(default, deserialize_with = "optional_numeric")]
    id: Option<u64>,
}

/// phpIPAM sends most integers as strings, but not all of them.
#[derive(Deserialize)]
#[serde(untagged)]
enum Numeric {
    Number(u64),
    Text(String),
}

impl Numeric {
    fn value<E: serde::de::Error>(self) -> Result<u64, E> {
        match self {
            Numeric::Number(n) => Ok(n),
            Numeric::Text(s) => s.trim().parse().map_err(E::custom),
        }
    }
}

fn numeric<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    Numeric::deserialize(d)?.value()
}

fn optional_numeric<'de, D: Deserializer<'de>>(
    d: D,
) -> Result<Option<u64>, D::Error> {
    Option::<Numeric>::deserialize(d)?.map(Numeric::value).transpose()
}

#[derive(Debug, Deserialize)]
struct WireGateway {
    ip_addr: IpAddr,
}

#[derive(Debug, Deserialize)]
struct WireSubnet {
    #[serde(deserialize_with = "numeric")]
    id: u64,
    subnet: IpAddr,
    #[serde(deserialize_with = "numeric")]
    mask: u64,
    gateway: Option<WireGateway>,
}

impl WireSubnet {
    fn into_info(self) -> Result<SubnetInfo, AddressError> {
        let prefix = u8::try_from(self.mask).map_err(|_| {
            AddressError::Http {
                status: 200,
                message: format!("bad mask for subnet {}", self.id),
            }
        })?;
        let network =
            IpNetwork::new(self.subnet, prefix).map_err(|e| {
                AddressError::Http {
                    status: 200,
                    message: format!("bad subnet {}: {e}", self.id),
                }
            })?;
        Ok(SubnetInfo {
            id: SubnetId(self.id),
            network,
            gateway: self.gateway.map(|g| g.ip_addr),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireAddress {
    #[serde(deserialize_with = "numeric")]
    id: u64,
    #[serde(deserialize_with = "numeric")]
    subnet_id: u64,
    ip: IpAddr,
    hostname: Option<String>,
}

impl From<WireAddress> for AddressRecord {
    fn from(wire: WireAddress) -> AddressRecord {
        AddressRecord {
            id: AddressId(wire.id),
            subnet_id: SubnetId(wire.subnet_id),
            address: wire.ip,
            hostname: wire.hostname.filter(|h| !h.is_empty()),
        }
    }
}

#[derive(Deserialize)]
struct WireToken {
    token: String,
}

/// A phpIPAM session. The API token is obtained once, when connecting.
pub struct IpamClient {
    log: Logger,
    client: reqwest::Client,
    base_url: String,
    token: String,
    reserve_retries: u32,
}

impl IpamClient {
    pub async fn connect(
        log: &Logger,
        config: &IpamConfig,
    ) -> Result<IpamClient, AddressError> {
        let log = log.new(o!("component" => "IpamClient"));
        let client = reqwest::ClientBuilder::new()
            .connect_timeout(config.request_timeout())
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| AddressError::ServiceUnavailable(e.to_string()))?;
        let base_url = format!(
            "{}/api/{}",
            config.endpoint.trim_end_matches('/'),
            config.app_id
        );

        let response = client
            .post(format!("{base_url}/user/"))
            .basic_auth(&config.user, Some(&config.password))
            .send()
            .await
            .map_err(transport_error)?;
        let token = decode::<WireToken>(response)
            .await?
            .data
            .ok_or_else(|| AddressError::Http {
                status: 200,
                message: String::from("no token in login response"),
            })?
            .token;
        debug!(log, "obtained API token"; "base_url" => &base_url);

        Ok(IpamClient {
            log,
            client,
            base_url,
            token,
            reserve_retries: config.reserve_retries,
        })
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Envelope<T>, AddressError> {
        let url = format!("{}/{}", self.base_url, path);
        debug!(self.log, "request"; "method" => %method, "url" => &url);
        let mut request =
            self.client.request(method, &url).header("token", &self.token);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await.map_err(transport_error)?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<Envelope<T>, AddressError> {
    let status = response.status();
    let body = response.text().await.map_err(transport_error)?;
    if !status.is_success() {
        let message = serde_json::from_str::<Envelope<serde_json::Value>>(
            &body,
        )
        .ok()
        .and_then(|e| e.message)
        .unwrap_or(body);
        return Err(status_error(status, message));
    }
    serde_json::from_str(&body).map_err(|e| AddressError::Http {
        status: status.as_u16(),
        message: format!("unexpected response body: {e}"),
    })
}

fn transport_error(err: reqwest::Error) -> AddressError {
    match err.status() {
        Some(status) => status_error(status, err.to_string()),
        None => AddressError::ServiceUnavailable(err.to_string()),
    }
}

fn status_error(status: StatusCode, message: String) -> AddressError {
    match status {
        StatusCode::NOT_FOUND => AddressError::NotFound(message),
        s if s.is_server_error() => AddressError::ServiceUnavailable(message),
        s => AddressError::Http { status: s.as_u16(), message },
    }
}

#[async_trait]
impl AddressManager for IpamClient {
    async fn reserve_first_free(
        &self,
        subnet: SubnetId,
    ) -> Result<IpAddr, AddressError> {
        let path = format!("addresses/first_free/{subnet}/");
        let reserve = || async {
            let envelope = self
                .request::<IpAddr>(Method::POST, &path, None)
                .await
                .map_err(|e| match e {
                    AddressError::ServiceUnavailable(_) => {
                        BackoffError::transient(e)
                    }
                    e => BackoffError::permanent(e),
                })?;
            envelope.data.ok_or_else(|| {
                BackoffError::permanent(AddressError::NotFound(format!(
                    "no free address in subnet {subnet}"
                )))
            })
        };
        let log_failure = |error: AddressError, delay: Duration| {
            warn!(self.log, "failed to reserve address, retrying";
                "subnet" => %subnet,
                "error" => %error,
                "retry_after" => ?delay);
        };
        retry_notify(
            retry_policy_attempts(self.reserve_retries),
            reserve,
            log_failure,
        )
        .await
    }

    async fn release_address(
        &self,
        address: IpAddr,
        subnet: SubnetId,
    ) -> Result<(), AddressError> {
        let path = format!("addresses/{address}/{subnet}/");
        self.request::<serde_json::Value>(Method::DELETE, &path, None).await?;
        Ok(())
    }

    async fn search(
        &self,
        query: &AddressQuery,
    ) -> Result<Vec<AddressRecord>, AddressError> {
        let path = match query {
            AddressQuery::Address(address) => {
                format!("addresses/search/{address}/")
            }
            AddressQuery::Hostname(hostname) => {
                format!("addresses/search_hostname/{hostname}/")
            }
        };
        match self.request::<Vec<WireAddress>>(Method::GET, &path, None).await
        {
            Ok(envelope) => Ok(envelope
                .data
                .unwrap_or_default()
                .into_iter()
                .map(AddressRecord::from)
                .collect()),
            Err(AddressError::NotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn create_address(
        &self,
        subnet: SubnetId,
        payload: &AddressPayload,
    ) -> Result<AddressId, AddressError> {
        let mut body = serde_json::to_value(payload).map_err(|e| {
            AddressError::Http { status: 0, message: e.to_string() }
        })?;
        if let Some(fields) = body.as_object_mut() {
            fields.insert(String::from("subnetId"), subnet.0.into());
        }
        let envelope = self
            .request::<serde_json::Value>(Method::POST, "addresses/", Some(body))
            .await?;
        envelope.id.map(AddressId).ok_or_else(|| AddressError::Http {
            status: 201,
            message: String::from("created address has no id"),
        })
    }

    async fn update_address(
        &self,
        id: AddressId,
        payload: &AddressPayload,
    ) -> Result<(), AddressError> {
        let body = serde_json::to_value(payload).map_err(|e| {
            AddressError::Http { status: 0, message: e.to_string() }
        })?;
        let path = format!("addresses/{id}/");
        self.request::<serde_json::Value>(Method::PATCH, &path, Some(body))
            .await?;
        Ok(())
    }

    async fn find_subnet_by_cidr(
        &self,
        cidr: IpNetwork,
    ) -> Result<SubnetInfo, AddressError> {
        let path = format!("subnets/cidr/{cidr}/");
        self.request::<Vec<WireSubnet>>(Method::GET, &path, None)
            .await?
            .data
            .and_then(|subnets| subnets.into_iter().next())
            .ok_or_else(|| AddressError::NotFound(format!("subnet {cidr}")))?
            .into_info()
    }

    async fn get_subnet(
        &self,
        id: SubnetId,
    ) -> Result<SubnetInfo, AddressError> {
        let path = format!("subnets/{id}/");
        self.request::<WireSubnet>(Method::GET, &path, None)
            .await?
            .data
            .ok_or_else(|| AddressError::NotFound(format!("subnet {id}")))?
            .into_info()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::test_setup_log;
    use assert_matches::assert_matches;
    use httptest::all_of;
    use httptest::cycle;
    use httptest::matchers::*;
    use httptest::responders::*;
    use httptest::Expectation;
    use httptest::Server;
    use serde_json::json;

    const TOKEN: &str = "s3cr3t";

    fn config(server: &Server) -> IpamConfig {
        IpamConfig {
            endpoint: server.url_str(""),
            app_id: String::from("prov"),
            user: String::from("user"),
            password: String::from("pass"),
            reserve_retries: 3,
            request_timeout_secs: 5,
        }
    }

    async fn connect(log: &Logger, server: &Server) -> IpamClient {
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/api/prov/user/"),
                // base64 of "user:pass"
                request::headers(contains((
                    "authorization",
                    "Basic dXNlcjpwYXNz"
                ))),
            ])
            .respond_with(json_encoded(json!({
                "code": 200,
                "success": true,
                "data": { "token": TOKEN, "expires": "2030-01-01 00:00:00" }
            }))),
        );
        IpamClient::connect(log, &config(server)).await.unwrap()
    }

    #[tokio::test]
    async fn test_reserve_first_free_retries_server_errors() {
        let log = test_setup_log("test_reserve_first_free_retries");
        let server = Server::run();
        let client = connect(&log, &server).await;

        let reserve = || {
            all_of![
                request::method_path("POST", "/api/prov/addresses/first_free/7/"),
                request::headers(contains(("token", TOKEN))),
            ]
        };
        server.expect(
            Expectation::matching(reserve())
                .times(2)
                .respond_with(cycle![
                    status_code(500),
                    json_encoded(json!({
                        "code": 201,
                        "success": true,
                        "message": "Address created",
                        "id": "42",
                        "data": "10.0.0.5"
                    })),
                ]),
        );

        let address = client.reserve_first_free(SubnetId(7)).await.unwrap();
        assert_eq!(address, "10.0.0.5".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_reserve_gives_up_after_retries() {
        let log = test_setup_log("test_reserve_gives_up_after_retries");
        let server = Server::run();
        let client = connect(&log, &server).await;
        server.expect(
            Expectation::matching(request::method_path(
                "POST",
                "/api/prov/addresses/first_free/7/",
            ))
            .times(3)
            .respond_with(status_code(500)),
        );

        assert_matches!(
            client.reserve_first_free(SubnetId(7)).await,
            Err(AddressError::ServiceUnavailable(_))
        );
    }

    #[tokio::test]
    async fn test_search_parses_records() {
        let log = test_setup_log("test_search_parses_records");
        let server = Server::run();
        let client = connect(&log, &server).await;
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                "/api/prov/addresses/search/10.0.0.5/",
            ))
            .respond_with(json_encoded(json!({
                "code": 200,
                "success": true,
                "data": [
                    {
                        "id": "42",
                        "subnetId": "7",
                        "ip": "10.0.0.5",
                        "hostname": "web-1"
                    },
                    { "id": 43, "subnetId": 9, "ip": "10.0.0.5", "hostname": "" }
                ]
            }))),
        );
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                "/api/prov/addresses/search_hostname/ghost/",
            ))
            .respond_with(status_code(404).body(
                r#"{"code":404,"success":false,"message":"Address not found"}"#,
            )),
        );

        let address = "10.0.0.5".parse().unwrap();
        let records =
            client.search(&AddressQuery::Address(address)).await.unwrap();
        assert_eq!(
            records,
            vec![
                AddressRecord {
                    id: AddressId(42),
                    subnet_id: SubnetId(7),
                    address,
                    hostname: Some(String::from("web-1")),
                },
                AddressRecord {
                    id: AddressId(43),
                    subnet_id: SubnetId(9),
                    address,
                    hostname: None,
                },
            ]
        );

        let records = client
            .search(&AddressQuery::Hostname(String::from("ghost")))
            .await
            .unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_create_and_update_address() {
        let log = test_setup_log("test_create_and_update_address");
        let server = Server::run();
        let client = connect(&log, &server).await;
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/api/prov/addresses/"),
                request::body(json_decoded(eq(json!({
                    "ip": "10.0.0.9",
                    "hostname": "web-2",
                    "description":
                        "This address is managed by instance-provisioner.",
                    "note": "Do not modify this address directly.",
                    "subnetId": 7
                })))),
            ])
            .respond_with(json_encoded(json!({
                "code": 201,
                "success": true,
                "id": "77"
            }))),
        );
        server.expect(
            Expectation::matching(all_of![
                request::method_path("PATCH", "/api/prov/addresses/77/"),
                request::body(json_decoded(eq(json!({
                    "hostname": "web-3",
                    "description":
                        "This address is managed by instance-provisioner.",
                    "note": "Do not modify this address directly."
                })))),
            ])
            .respond_with(json_encoded(json!({
                "code": 200,
                "success": true
            }))),
        );

        let payload = AddressPayload::managed(
            "web-2",
            Some("10.0.0.9".parse().unwrap()),
        );
        let id = client.create_address(SubnetId(7), &payload).await.unwrap();
        assert_eq!(id, AddressId(77));

        let payload = AddressPayload::managed("web-3", None);
        client.update_address(id, &payload).await.unwrap();
    }

    #[tokio::test]
    async fn test_subnet_lookup() {
        let log = test_setup_log("test_subnet_lookup");
        let server = Server::run();
        let client = connect(&log, &server).await;
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                "/api/prov/subnets/cidr/10.0.0.0/24/",
            ))
            .respond_with(json_encoded(json!({
                "code": 200,
                "success": true,
                "data": [{
                    "id": "7",
                    "subnet": "10.0.0.0",
                    "mask": "24",
                    "gateway": { "ip_addr": "10.0.0.1", "id": "3" }
                }]
            }))),
        );
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                "/api/prov/subnets/cidr/10.1.0.0/24/",
            ))
            .respond_with(json_encoded(json!({
                "code": 200,
                "success": true,
                "data": []
            }))),
        );

        let subnet = client
            .find_subnet_by_cidr("10.0.0.0/24".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(subnet.id, SubnetId(7));
        assert_eq!(subnet.gateway, Some("10.0.0.1".parse().unwrap()));
        assert_eq!(subnet.network, "10.0.0.0/24".parse().unwrap());

        assert_matches!(
            client.find_subnet_by_cidr("10.1.0.0/24".parse().unwrap()).await,
            Err(AddressError::NotFound(_))
        );
    }

    #[tokio::test]
    async fn test_release_maps_errors() {
        let log = test_setup_log("test_release_maps_errors");
        let server = Server::run();
        let client = connect(&log, &server).await;
        server.expect(
            Expectation::matching(request::method_path(
                "DELETE",
                "/api/prov/addresses/10.0.0.5/7/",
            ))
            .respond_with(json_encoded(json!({
                "code": 200,
                "success": true
            }))),
        );
        server.expect(
            Expectation::matching(request::method_path(
                "DELETE",
                "/api/prov/addresses/10.0.0.6/7/",
            ))
            .respond_with(status_code(403).body(
                r#"{"code":403,"success":false,"message":"Forbidden"}"#,
            )),
        );

        client
            .release_address("10.0.0.5".parse().unwrap(), SubnetId(7))
            .await
            .unwrap();
        assert_matches!(
            client
                .release_address("10.0.0.6".parse().unwrap(), SubnetId(7))
                .await,
            Err(AddressError::Http { status: 403, ref message })
                if message == "Forbidden"
        );
    }
}
