//! HTTP client for a fabhost engine, used as the relay's active machine.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;

use crate::error::CollaboratorError;
use crate::machine::{JobPayload, JobReceipt};
use crate::relay::{MachineAddress, RelayMachine};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct Envelope {
    status: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    message: Option<String>,
}

pub struct HttpMachineClient {
    address: MachineAddress,
    http: reqwest::Client,
    /// Session cookie for the engine. Never included in relay replies.
    session: Option<SecretString>,
}

impl HttpMachineClient {
    pub fn new(ip: IpAddr, port: u16) -> Result<Self, CollaboratorError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CollaboratorError::call_failed("engine", "connect", e.to_string()))?;
        Ok(Self {
            address: MachineAddress { ip, port },
            http,
            session: None,
        })
    }

    pub fn with_session(mut self, cookie: impl Into<String>) -> Self {
        self.session = Some(SecretString::from(cookie.into()));
        self
    }

    fn url(&self, path: &str) -> String {
        match self.address.ip {
            IpAddr::V4(ip) => format!("http://{}:{}{}", ip, self.address.port, path),
            IpAddr::V6(ip) => format!("http://[{}]:{}{}", ip, self.address.port, path),
        }
    }
}

#[async_trait]
impl RelayMachine for HttpMachineClient {
    fn address(&self) -> MachineAddress {
        self.address
    }

    async fn submit_job(&self, job: JobPayload) -> Result<JobReceipt, CollaboratorError> {
        let failed = |reason: String| CollaboratorError::call_failed("engine", "submit_job", reason);

        let mut request = self
            .http
            .post(self.url("/job"))
            .header("X-Requested-With", "XMLHttpRequest")
            .json(&job);
        if let Some(session) = &self.session {
            request = request.header(header::COOKIE, session.expose_secret());
        }

        let response = request.send().await.map_err(|e| failed(e.to_string()))?;
        let status = response.status();
        let envelope: Envelope = response
            .json()
            .await
            .map_err(|e| failed(format!("unreadable response ({status}): {e}")))?;

        if envelope.status != "success" {
            let reason = envelope
                .message
                .unwrap_or_else(|| format!("engine answered {status}"));
            return Err(CollaboratorError::Rejected {
                collaborator: "engine",
                reason,
            });
        }
        serde_json::from_value(envelope.data).map_err(|e| failed(format!("bad job receipt: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_brackets_ipv6() {
        let client = HttpMachineClient::new("::1".parse().unwrap(), 9876).unwrap();
        assert_eq!(client.url("/job"), "http://[::1]:9876/job");
        let client = HttpMachineClient::new("10.0.0.2".parse().unwrap(), 80).unwrap();
        assert_eq!(client.url("/job"), "http://10.0.0.2:80/job");
    }

    #[test]
    fn address_exposes_only_ip_and_port() {
        let client = HttpMachineClient::new("10.0.0.2".parse().unwrap(), 80)
            .unwrap()
            .with_session("fabhost-session=secret.value");
        let reply = serde_json::to_value(client.address()).unwrap();
        assert_eq!(reply, serde_json::json!({ "ip": "10.0.0.2", "port": 80 }));
        assert!(!reply.to_string().contains("secret"));
    }
}
