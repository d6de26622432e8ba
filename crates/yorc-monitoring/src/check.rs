//! A monitoring probe (§3 "Check", §4.7): TCP or HTTP liveness check
//! against a node instance's endpoint, run on a fixed interval.

use std::collections::HashMap;
use std::time::Duration;

pub use yorc_topology::{CheckStatus, CheckType};

/// Where a check probes. TCP dials `address:port`; HTTP issues a `GET`
/// against `<scheme>://address:port/<path>`.
#[derive(Debug, Clone)]
pub enum CheckTarget {
    Tcp {
        address: String,
        port: u16,
    },
    Http {
        address: String,
        port: u16,
        scheme: String,
        path: String,
        headers: HashMap<String, String>,
    },
}

/// Everything needed to run one check, independent of any runtime
/// state (§3 "Check"). `interval` also drives the TCP/HTTP timeout,
/// fixed at `interval / 2` (§4.7).
#[derive(Debug, Clone)]
pub struct CheckSpec {
    pub deployment_id: String,
    pub node: String,
    pub instance: String,
    pub check_type: CheckType,
    pub interval: Duration,
    pub target: CheckTarget,
}

impl CheckSpec {
    pub fn check_id(&self) -> String {
        yorc_kv::paths::check_id(&self.deployment_id, &self.node, &self.instance)
    }

    pub fn timeout(&self) -> Duration {
        self.interval / 2
    }
}

const DEFAULT_ACCEPT: &str = "text/plain, text/*, */*";

/// Runs one tick of the probe described by `spec` and returns the
/// resulting status. Never returns `Err`: every transport/timeout
/// failure maps to [`CheckStatus::Critical`] (§4.7).
pub async fn probe(spec: &CheckSpec, http_client: &reqwest::Client) -> CheckStatus {
    match &spec.target {
        CheckTarget::Tcp { address, port } => probe_tcp(address, *port, spec.timeout()).await,
        CheckTarget::Http {
            address,
            port,
            scheme,
            path,
            headers,
        } => probe_http(http_client, scheme, address, *port, path, headers, spec.timeout()).await,
    }
}

async fn probe_tcp(address: &str, port: u16, timeout: Duration) -> CheckStatus {
    match tokio::time::timeout(timeout, tokio::net::TcpStream::connect((address, port))).await {
        Ok(Ok(_stream)) => CheckStatus::Passing,
        _ => CheckStatus::Critical,
    }
}

async fn probe_http(
    client: &reqwest::Client,
    scheme: &str,
    address: &str,
    port: u16,
    path: &str,
    headers: &HashMap<String, String>,
    timeout: Duration,
) -> CheckStatus {
    let url = format!("{scheme}://{address}:{port}/{}", path.trim_start_matches('/'));
    let mut request = client.get(&url).timeout(timeout);
    let mut has_accept = false;
    for (k, v) in headers {
        if k.eq_ignore_ascii_case("accept") {
            has_accept = true;
        }
        request = request.header(k, v);
    }
    if !has_accept {
        request = request.header("Accept", DEFAULT_ACCEPT);
    }

    match request.send().await {
        Ok(resp) if resp.status().is_success() => CheckStatus::Passing,
        Ok(resp) if resp.status().as_u16() == 429 => CheckStatus::Warning,
        Ok(_) => CheckStatus::Critical,
        Err(_) => CheckStatus::Critical,
    }
}
