//! Upstream broker HTTP client: ticket resolution and end-of-session notify.

use std::net::IpAddr;

use reqwest::Client;
use serde::Deserialize;

use crate::config::Config;
use crate::error::UpstreamError;
use crate::ticket::Ticket;

#[derive(Debug, Clone, Deserialize)]
pub struct Resolution {
    pub host: String,
    pub port: u16,
    pub notify: String,
}

pub struct BrokerClient {
    client: Client,
    uds_server: String,
    uds_token: String,
}

impl BrokerClient {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        let client = Client::builder()
            .use_rustls_tls()
            .timeout(cfg.uds_timeout)
            .danger_accept_invalid_certs(!cfg.uds_verify_ssl)
            .build()?;

        Ok(BrokerClient {
            client,
            uds_server: cfg.uds_server.trim_end_matches('/').to_string(),
            uds_token: cfg.uds_token.clone(),
        })
    }

    /// `GET {uds_server}/{ticket}/{client_ip}/{uds_token}`. Any non-2xx
    /// status, timeout, TLS failure, or JSON-shape error becomes an
    /// `UpstreamError` — never reinterpreted based on the response body.
    pub async fn resolve(&self, ticket: &Ticket, client_ip: IpAddr) -> Result<Resolution, UpstreamError> {
        let url = format!(
            "{}/{}/{}/{}",
            self.uds_server,
            ticket.as_str(),
            client_ip,
            self.uds_token
        );

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<Resolution>()
            .await
            .map_err(|e| UpstreamError::MalformedResponse(e.to_string()))
    }

    /// `GET {uds_server}/{notify}/stop/{uds_token}?sent=<n>&recv=<n>`.
    /// Best-effort: the caller logs and swallows failures, the session is
    /// already closed.
    pub async fn notify(&self, notify_token: &str, sent: u64, recv: u64) -> Result<(), UpstreamError> {
        let url = format!(
            "{}/{}/stop/{}?sent={}&recv={}",
            self.uds_server, notify_token, self.uds_token, sent, recv
        );

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn base_config(uds_server: String) -> Config {
        Config {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 7777,
            ipv6: false,
            tls_cert_path: None,
            tls_key_path: None,
            tls_ciphers: None,
            backend_tls_ca: None,
            uds_server,
            uds_token: "tok".to_string(),
            uds_timeout: Duration::from_secs(2),
            uds_verify_ssl: true,
            allow: HashSet::new(),
            secret: "s".to_string(),
            workers: 8,
            log_level: "INFO".to_string(),
            log_file: "-".to_string(),
            allowed_fails: 5,
            fail_window: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn resolve_against_nonexistent_server_is_upstream_error() {
        let cfg = base_config("http://127.0.0.1:1".to_string());
        let client = BrokerClient::new(&cfg).unwrap();
        let ticket = Ticket::parse(&[b'A'; 48]).unwrap();
        let result = client
            .resolve(&ticket, IpAddr::V4(Ipv4Addr::LOCALHOST))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn resolve_with_missing_field_is_upstream_error() {
        let mut server = mockito::Server::new_async().await;
        let ticket = Ticket::parse(&[b'A'; 48]).unwrap();
        let _mock = server
            .mock(
                "GET",
                format!("/{}/127.0.0.1/tok", ticket.as_str()).as_str(),
            )
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"host":"127.0.0.1"}"#)
            .create_async()
            .await;

        let cfg = base_config(server.url());
        let client = BrokerClient::new(&cfg).unwrap();
        let result = client
            .resolve(&ticket, IpAddr::V4(Ipv4Addr::LOCALHOST))
            .await;
        match result {
            Err(UpstreamError::MalformedResponse(_)) => {}
            other => panic!("expected MalformedResponse, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn resolve_non_2xx_is_upstream_error_regardless_of_body() {
        let mut server = mockito::Server::new_async().await;
        let ticket = Ticket::parse(&[b'A'; 48]).unwrap();
        let _mock = server
            .mock(
                "GET",
                format!("/{}/127.0.0.1/tok", ticket.as_str()).as_str(),
            )
            .with_status(404)
            .with_body("no such ticket")
            .create_async()
            .await;

        let cfg = base_config(server.url());
        let client = BrokerClient::new(&cfg).unwrap();
        let result = client
            .resolve(&ticket, IpAddr::V4(Ipv4Addr::LOCALHOST))
            .await;
        match result {
            Err(UpstreamError::Status { status: 404, .. }) => {}
            other => panic!("expected Status(404), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn notify_reports_non_2xx_as_upstream_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/N1/stop/tok")
            .match_query(mockito::Matcher::Any)
            .with_status(500)
            .with_body("broker unavailable")
            .create_async()
            .await;

        let cfg = base_config(server.url());
        let client = BrokerClient::new(&cfg).unwrap();
        let result = client.notify("N1", 5, 5).await;
        match result {
            Err(UpstreamError::Status { status: 500, .. }) => {}
            other => panic!("expected Status(500), got {other:?}"),
        }
    }
}
