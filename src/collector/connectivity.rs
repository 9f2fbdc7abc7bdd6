//! Built-in SSH connectivity collector.
//!
//! Checks every SSH host named in the settings store and raises an alert for
//! each host that does not accept a key-based, non-interactive login.

use super::{Collector, DEFAULT_CHECK_BUDGET, fan_out};
use crate::error::Result;
use crate::settings::ConfigStore;
use crate::shell::{RemoteShell, short_host};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Settings keys ending in this suffix name an SSH target.
const SSH_HOST_SUFFIX: &str = "_ssh_host";
/// Matching port key suffix.
const SSH_PORT_SUFFIX: &str = "_ssh_port";
/// Settings key listing Docker servers
/// (`[{ "host": ..., "user": ..., "port": ..., "name": ... }]`).
pub const DOCKER_SERVERS_KEY: &str = "docker_servers";

/// One entry of the `docker_servers` setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerServer {
    /// Display name; falls back to the bare host.
    pub name: String,
    /// ssh target, `user@host` when a user is configured.
    pub target: String,
    pub port: Option<u16>,
}

/// Docker servers from the settings store. Entries without a host are
/// skipped.
pub fn docker_servers(settings: &dyn ConfigStore) -> Vec<DockerServer> {
    let Some(Value::Array(servers)) = settings.get(DOCKER_SERVERS_KEY) else {
        return Vec::new();
    };
    servers
        .iter()
        .filter_map(|server| {
            let text = |key: &str| {
                server
                    .get(key)
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
            };
            let host = text("host")?;
            let target = match text("user") {
                Some(user) => format!("{user}@{host}"),
                None => host.to_owned(),
            };
            Some(DockerServer {
                name: text("name").unwrap_or(host).to_owned(),
                target,
                port: server.get("port").and_then(parse_port),
            })
        })
        .collect()
}

/// Tests SSH reachability of all configured hosts.
///
/// Hosts are checked concurrently and the whole pass is bounded by a budget,
/// so a stalled host never costs more than the budget.
pub struct ConnectivityCollector {
    settings: Arc<dyn ConfigStore>,
    shell: Arc<dyn RemoteShell>,
    host_timeout: Duration,
    budget: Duration,
}

impl ConnectivityCollector {
    /// Create a collector checking hosts through `shell`.
    pub fn new(settings: Arc<dyn ConfigStore>, shell: Arc<dyn RemoteShell>) -> Self {
        Self {
            settings,
            shell,
            host_timeout: Duration::from_secs(5),
            budget: DEFAULT_CHECK_BUDGET,
        }
    }

    /// Override the per-host ssh timeout.
    pub fn with_host_timeout(mut self, timeout: Duration) -> Self {
        self.host_timeout = timeout;
        self
    }

    /// Cap the wall-clock time of one `alerts()` pass. Keep it below the
    /// aggregator's collector timeout.
    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    /// Distinct `(host, port)` targets, in settings-key order followed by
    /// Docker servers.
    pub fn hosts(&self) -> Vec<(String, Option<u16>)> {
        let mut hosts: Vec<(String, Option<u16>)> = Vec::new();
        let mut push = |host: &str, port: Option<u16>| {
            let host = host.trim();
            if host.is_empty() || hosts.iter().any(|(h, _)| h == host) {
                return;
            }
            hosts.push((host.to_owned(), port));
        };

        if let Value::Object(map) = self.settings.export() {
            for (key, value) in &map {
                let Some(prefix) = key.strip_suffix(SSH_HOST_SUFFIX) else {
                    continue;
                };
                let Value::String(host) = value else {
                    continue;
                };
                let port = map
                    .get(&format!("{prefix}{SSH_PORT_SUFFIX}"))
                    .and_then(parse_port);
                push(host, port);
            }
        }

        for server in docker_servers(self.settings.as_ref()) {
            push(&server.target, server.port);
        }

        hosts
    }
}

/// Parse a port stored either as a number or a numeric string.
pub(crate) fn parse_port(value: &Value) -> Option<u16> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|p| *p != 0)
}

/// Alert text for a host that did not accept the login.
pub fn unreachable_alert(host: &str) -> String {
    format!("SSH: {} unreachable (run: ssh-copy-id {host})", short_host(host))
}

impl Collector for ConnectivityCollector {
    fn name(&self) -> &str {
        "connectivity"
    }

    fn is_configured(&self) -> bool {
        true
    }

    fn alerts(&self) -> Result<Vec<String>> {
        let hosts = self.hosts();
        let deadline = Instant::now() + self.budget;
        let timeout = self.host_timeout.min(self.budget);
        let shell = Arc::clone(&self.shell);

        let reachable = fan_out(hosts.clone(), deadline, move |(host, port)| {
            match shell.run(&host, port, "true", timeout) {
                Ok(out) => out.success(),
                Err(e) => {
                    debug!(host = %host, "ssh login failed: {e}");
                    false
                }
            }
        });

        Ok(hosts
            .iter()
            .zip(reachable)
            .filter(|(_, ok)| *ok != Some(true))
            .map(|((host, _), _)| unreachable_alert(host))
            .collect())
    }
}
