//! Container image update check across every Docker host.
//!
//! For each host the handler lists running containers over ssh, then runs a
//! second remote script that pulls each image and compares the pulled digest
//! with the local image id.

use super::handlers::TaskHandler;
use super::tasks::ScheduledTask;
use crate::collector::connectivity::parse_port;
use crate::collector::{DockerServer, docker_servers};
use crate::error::{OrchestratorError, Result};
use crate::settings::ConfigStore;
use crate::shell::RemoteShell;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lists running containers as `name<TAB>image<TAB>id`.
pub const LIST_CONTAINERS_COMMAND: &str =
    "docker ps --format '{{.Names}}\\t{{.Image}}\\t{{.ID}}' 2>/dev/null";

/// Characters of the image id and registry digest compared (`sha256:` plus
/// twelve hex digits).
const DIGEST_PREFIX_LEN: usize = 19;

/// Settings keys of the storage host, which also runs Docker.
const UNRAID_HOST_KEY: &str = "unraid_ssh_host";
const UNRAID_PORT_KEY: &str = "unraid_ssh_port";

/// A running container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub name: String,
    pub image: String,
}

/// Result of checking one host, as container names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostUpdates {
    pub updates: Vec<String>,
    pub current: Vec<String>,
    /// Images the registry could not be asked about (local builds, auth).
    pub skipped: Vec<String>,
}

/// Checks running containers on every Docker host for newer images.
pub struct UpdateCheckHandler {
    settings: Arc<dyn ConfigStore>,
    shell: Arc<dyn RemoteShell>,
    list_timeout: Duration,
    check_timeout: Duration,
}

impl UpdateCheckHandler {
    pub fn new(settings: Arc<dyn ConfigStore>, shell: Arc<dyn RemoteShell>) -> Self {
        Self {
            settings,
            shell,
            list_timeout: Duration::from_secs(15),
            check_timeout: Duration::from_secs(300),
        }
    }

    /// Override the ssh timeouts for the container listing and the pull
    /// comparison.
    pub fn with_timeouts(mut self, list: Duration, check: Duration) -> Self {
        self.list_timeout = list;
        self.check_timeout = check;
        self
    }

    /// The storage host first, then the `docker_servers` entries.
    pub fn docker_hosts(&self) -> Vec<DockerServer> {
        let mut hosts = Vec::new();
        if let Some(host) = self.settings.get_str(UNRAID_HOST_KEY) {
            hosts.push(DockerServer {
                name: "Unraid".to_owned(),
                target: host,
                port: self
                    .settings
                    .get(UNRAID_PORT_KEY)
                    .as_ref()
                    .and_then(parse_port),
            });
        }
        hosts.extend(docker_servers(self.settings.as_ref()));
        hosts
    }

    fn check_host(&self, host: &DockerServer) -> Result<HostUpdates> {
        let listing = self.shell.run(
            &host.target,
            host.port,
            LIST_CONTAINERS_COMMAND,
            self.list_timeout,
        )?;
        if !listing.success() {
            return Err(OrchestratorError::Handler(format!(
                "{}: docker ps exited with {:?}",
                host.name, listing.code
            )));
        }
        let containers = parse_container_list(&listing.stdout);
        if containers.is_empty() {
            return Ok(HostUpdates::default());
        }

        let report = self.shell.run(
            &host.target,
            host.port,
            &update_check_script(&containers),
            self.check_timeout,
        )?;
        Ok(parse_update_report(&report.stdout, &containers))
    }
}

impl TaskHandler for UpdateCheckHandler {
    fn run(&self, _task: &ScheduledTask) -> Result<String> {
        let hosts = self.docker_hosts();
        if hosts.is_empty() {
            return Err(OrchestratorError::Handler(
                "no Docker hosts configured".to_owned(),
            ));
        }

        let mut total = HostUpdates::default();
        let mut unreachable = Vec::new();
        for host in &hosts {
            match self.check_host(host) {
                Ok(found) => {
                    debug!(
                        host = %host.name,
                        updates = found.updates.len(),
                        current = found.current.len(),
                        skipped = found.skipped.len(),
                        "host checked"
                    );
                    let qualify = |names: Vec<String>| {
                        names
                            .into_iter()
                            .map(|n| format!("{}/{n}", host.name))
                            .collect::<Vec<_>>()
                    };
                    total.updates.extend(qualify(found.updates));
                    total.current.extend(qualify(found.current));
                    total.skipped.extend(qualify(found.skipped));
                }
                Err(e) => {
                    warn!(host = %host.name, "update check failed: {e}");
                    unreachable.push(host.name.clone());
                }
            }
        }

        if unreachable.len() == hosts.len() {
            return Err(OrchestratorError::Handler(format!(
                "no Docker host answered: {}",
                unreachable.join(", ")
            )));
        }

        total.updates.sort();
        let mut summary = if total.updates.is_empty() {
            "0 updates".to_owned()
        } else {
            format!(
                "{} updates ({})",
                total.updates.len(),
                total.updates.join(", ")
            )
        };
        summary.push_str(&format!(
            ", {} current, {} skipped",
            total.current.len(),
            total.skipped.len()
        ));
        if !unreachable.is_empty() {
            summary.push_str(&format!("; unreachable: {}", unreachable.join(", ")));
        }
        info!(updates = total.updates.len(), "container update check finished");
        Ok(summary)
    }
}

/// Parse [`LIST_CONTAINERS_COMMAND`] output. Malformed lines are skipped.
pub fn parse_container_list(stdout: &str) -> Vec<Container> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.trim_end().split('\t');
            let name = parts.next()?.trim();
            let image = parts.next()?.trim();
            parts.next()?;
            (!name.is_empty() && !image.is_empty()).then(|| Container {
                name: name.to_owned(),
                image: image.to_owned(),
            })
        })
        .collect()
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Remote script printing `image<TAB>UPDATE|OK|SKIP` for each distinct image.
pub fn update_check_script(containers: &[Container]) -> String {
    let mut images: Vec<&str> = Vec::new();
    for c in containers {
        if !images.contains(&c.image.as_str()) {
            images.push(&c.image);
        }
    }
    let list: Vec<String> = images.iter().map(|i| shell_quote(i)).collect();
    format!(
        "for img in {list}; do \
local=$(docker image inspect \"$img\" --format '{{{{.Id}}}}' 2>/dev/null | cut -c1-{n}); \
remote=$(docker pull \"$img\" 2>/dev/null | grep 'Digest:' | awk '{{print $2}}' | cut -c1-{n}); \
if [ -z \"$remote\" ]; then printf '%s\\tSKIP\\n' \"$img\"; \
elif [ \"$local\" != \"$remote\" ]; then printf '%s\\tUPDATE\\n' \"$img\"; \
else printf '%s\\tOK\\n' \"$img\"; fi; \
done",
        list = list.join(" "),
        n = DIGEST_PREFIX_LEN,
    )
}

/// Map the script's per-image verdicts back onto container names. Every
/// container using a reported image gets that image's verdict; unknown
/// verdicts count as skipped.
pub fn parse_update_report(stdout: &str, containers: &[Container]) -> HostUpdates {
    let mut result = HostUpdates::default();
    for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
        let mut parts = line.trim_end().split('\t');
        let image = parts.next().unwrap_or_default().trim();
        let verdict = parts.next().unwrap_or_default().trim();

        let mut names: Vec<String> = containers
            .iter()
            .filter(|c| c.image == image)
            .map(|c| c.name.clone())
            .collect();
        if names.is_empty() {
            names.push(image.to_owned());
        }
        let bucket = match verdict {
            "UPDATE" => &mut result.updates,
            "OK" => &mut result.current,
            _ => &mut result.skipped,
        };
        bucket.extend(names);
    }
    result
}
