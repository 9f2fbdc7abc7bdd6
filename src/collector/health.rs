//! Built-in consolidated health-check collector.
//!
//! Combines three checks into one collector:
//! - a single SSH round-trip to the storage host that reports unhealthy
//!   containers, array disk usage, and CPU-hungry containers;
//! - reachability of every configured service URL;
//! - certificate expiry of every HTTPS service URL.
//!
//! All checks run concurrently and share one budget. Sub-check failures are
//! absorbed here: a storage host that fails or stalls contributes no host
//! alerts, a certificate that cannot be read is skipped, and the remaining
//! alerts still reach the dashboard.

use super::connectivity::parse_port;
use super::tls::{CertInspector, TlsCertInspector, expiry_alert, insecure_tls_config};
use super::{Collector, DEFAULT_CHECK_BUDGET, fan_out};
use crate::error::{OrchestratorError, Result};
use crate::settings::ConfigStore;
use crate::shell::RemoteShell;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Section separator emitted by [`HOST_HEALTH_COMMAND`].
const SECTION_SEP: &str = "---SEP---";

/// Remote command producing three sections: unhealthy container names, the
/// `df -h` line for the array, and `name<TAB>cpu%` per container.
pub const HOST_HEALTH_COMMAND: &str = "docker ps --filter health=unhealthy --format '{{.Names}}' 2>/dev/null;\
echo '---SEP---';\
df -h /mnt/user 2>/dev/null | tail -1;\
echo '---SEP---';\
docker stats --no-stream --format '{{.Name}}\\t{{.CPUPerc}}' 2>/dev/null";

/// Settings key naming the storage host checked over SSH.
const HEALTH_HOST_KEY: &str = "unraid_ssh_host";
/// Matching port key.
const HEALTH_PORT_KEY: &str = "unraid_ssh_port";

/// Disk usage (percent) above which a warning is raised.
const DISK_WARN_PCT: u32 = 80;
/// Disk usage (percent) above which the alert is critical.
const DISK_CRIT_PCT: u32 = 90;
/// Per-container CPU usage (percent) considered high.
const HIGH_CPU_PCT: f64 = 50.0;
/// Names listed in one alert before collapsing to "+N more".
const MAX_NAMES: usize = 3;

/// Service URL settings keys and their display labels.
pub const SERVICE_URL_KEYS: &[(&str, &str)] = &[
    ("homeassistant_url", "Home Assistant"),
    ("proxmox_url", "Proxmox"),
    ("forgejo_url", "Forgejo"),
    ("unifi_url", "UniFi"),
    ("opnsense_url", "OPNsense"),
    ("uptimekuma_url", "Uptime Kuma"),
    ("npm_url", "Nginx Proxy Manager"),
    ("immich_url", "Immich"),
    ("syncthing_url", "Syncthing"),
    ("plex_url", "Plex"),
    ("jellyfin_url", "Jellyfin"),
    ("sonarr_url", "Sonarr"),
    ("radarr_url", "Radarr"),
    ("lidarr_url", "Lidarr"),
    ("sabnzbd_url", "SABnzbd"),
    ("deluge_url", "Deluge"),
];

/// Checks whether a URL answers at all.
pub trait HttpProbe: Send + Sync {
    /// Returns `Ok(())` when the server produced any HTTP response.
    ///
    /// # Errors
    ///
    /// Returns an error when no HTTP response was received (DNS, connect,
    /// TLS, or timeout failure).
    fn probe(&self, url: &str) -> Result<()>;
}

/// [`HttpProbe`] issuing a `HEAD` request via `ureq`.
///
/// Certificates are not verified, so self-signed services count as up.
pub struct UreqProbe {
    agent: ureq::Agent,
}

impl UreqProbe {
    /// Create a probe with the given request timeout.
    pub fn new(timeout: Duration) -> Self {
        let builder = ureq::AgentBuilder::new().timeout(timeout);
        let builder = match insecure_tls_config() {
            Ok(config) => builder.tls_config(config),
            Err(e) => {
                warn!("falling back to verified TLS: {e}");
                builder
            }
        };
        Self {
            agent: builder.build(),
        }
    }
}

impl Default for UreqProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl HttpProbe for UreqProbe {
    fn probe(&self, url: &str) -> Result<()> {
        match self.agent.head(url).call() {
            Ok(_) | Err(ureq::Error::Status(_, _)) => Ok(()),
            Err(ureq::Error::Transport(t)) => Err(OrchestratorError::Collector(format!(
                "{url} unreachable: {t}"
            ))),
        }
    }
}

/// Certificate inspector that never succeeds, used when TLS cannot be set up.
struct NoCerts;

impl CertInspector for NoCerts {
    fn not_after(&self, url: &str) -> Result<chrono::DateTime<Utc>> {
        Err(OrchestratorError::Collector(format!("{url}: TLS unavailable")))
    }
}

#[derive(Debug, Clone)]
enum Check {
    Host { host: String, port: Option<u16> },
    Service { label: &'static str, url: String },
    Cert { label: &'static str, url: String },
}

/// Consolidated health-check collector.
pub struct HealthCheckCollector {
    settings: Arc<dyn ConfigStore>,
    shell: Arc<dyn RemoteShell>,
    http: Arc<dyn HttpProbe>,
    certs: Arc<dyn CertInspector>,
    host_timeout: Duration,
    budget: Duration,
}

impl HealthCheckCollector {
    /// Create a collector over the given collaborators.
    ///
    /// Certificate expiry is read with a [`TlsCertInspector`]; replace it with
    /// [`Self::with_cert_inspector`].
    pub fn new(
        settings: Arc<dyn ConfigStore>,
        shell: Arc<dyn RemoteShell>,
        http: Arc<dyn HttpProbe>,
    ) -> Self {
        let certs: Arc<dyn CertInspector> = match TlsCertInspector::new(Duration::from_secs(5)) {
            Ok(inspector) => Arc::new(inspector),
            Err(e) => {
                warn!("certificate expiry checks disabled: {e}");
                Arc::new(NoCerts)
            }
        };
        Self {
            settings,
            shell,
            http,
            certs,
            host_timeout: Duration::from_secs(15),
            budget: DEFAULT_CHECK_BUDGET,
        }
    }

    pub fn with_cert_inspector(mut self, certs: Arc<dyn CertInspector>) -> Self {
        self.certs = certs;
        self
    }

    /// Cap the wall-clock time of one `alerts()` pass. Keep it below the
    /// aggregator's collector timeout.
    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    fn checks(&self) -> Vec<Check> {
        let mut checks = Vec::new();
        if let Some(host) = self.settings.get_str(HEALTH_HOST_KEY) {
            let port = self
                .settings
                .get(HEALTH_PORT_KEY)
                .as_ref()
                .and_then(parse_port);
            checks.push(Check::Host { host, port });
        }

        let urls: Vec<(&'static str, String)> = SERVICE_URL_KEYS
            .iter()
            .filter_map(|(key, label)| Some((*label, self.settings.get_str(key)?)))
            .collect();
        for (label, url) in &urls {
            checks.push(Check::Service {
                label: *label,
                url: url.clone(),
            });
        }
        for (label, url) in urls {
            if url.trim_start().to_ascii_lowercase().starts_with("https://") {
                checks.push(Check::Cert { label, url });
            }
        }
        checks
    }
}

fn host_alerts(
    shell: &dyn RemoteShell,
    host: &str,
    port: Option<u16>,
    timeout: Duration,
) -> Vec<String> {
    match shell.run(host, port, HOST_HEALTH_COMMAND, timeout) {
        Ok(out) if out.success() => parse_host_health(&out.stdout),
        Ok(out) => {
            debug!(host = %host, code = ?out.code, "host health command failed");
            Vec::new()
        }
        Err(e) => {
            warn!(host = %host, "host health check failed: {e}");
            Vec::new()
        }
    }
}

impl Collector for HealthCheckCollector {
    fn name(&self) -> &str {
        "health"
    }

    fn is_configured(&self) -> bool {
        true
    }

    fn alerts(&self) -> Result<Vec<String>> {
        let checks = self.checks();
        let deadline = Instant::now() + self.budget;
        let host_timeout = self.host_timeout.min(self.budget);
        let shell = Arc::clone(&self.shell);
        let http = Arc::clone(&self.http);
        let certs = Arc::clone(&self.certs);

        let results = fan_out(checks.clone(), deadline, move |check| match check {
            Check::Host { host, port } => host_alerts(shell.as_ref(), &host, port, host_timeout),
            Check::Service { label, url } => match http.probe(&url) {
                Ok(()) => Vec::new(),
                Err(e) => {
                    debug!("{e}");
                    vec![format!("{label} unreachable")]
                }
            },
            Check::Cert { label, url } => match certs.not_after(&url) {
                Ok(not_after) => expiry_alert(label, not_after, Utc::now())
                    .into_iter()
                    .collect(),
                Err(e) => {
                    debug!("certificate check skipped: {e}");
                    Vec::new()
                }
            },
        });

        let mut alerts = Vec::new();
        for (check, result) in checks.into_iter().zip(results) {
            match (check, result) {
                (_, Some(found)) => alerts.extend(found),
                (Check::Service { label, .. }, None) => alerts.push(format!("{label} unreachable")),
                (Check::Host { host, .. }, None) => {
                    warn!(host = %host, "host health check ran out of time");
                }
                (Check::Cert { label, .. }, None) => {
                    debug!(service = label, "certificate check ran out of time");
                }
            }
        }
        Ok(alerts)
    }
}

/// Parse the output of [`HOST_HEALTH_COMMAND`] into alert strings.
///
/// Output without all three sections yields no alerts.
pub fn parse_host_health(stdout: &str) -> Vec<String> {
    let sections: Vec<&str> = stdout.split(SECTION_SEP).collect();
    if sections.len() < 3 {
        return Vec::new();
    }

    let mut alerts = Vec::new();

    let unhealthy: Vec<&str> = sections[0]
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    if !unhealthy.is_empty() {
        alerts.push(format!("Unhealthy: {}", summarize_names(&unhealthy)));
    }

    if let Some(alert) = disk_alert(sections[1].trim()) {
        alerts.push(alert);
    }

    let high_cpu: Vec<String> = sections[2]
        .lines()
        .filter_map(|line| {
            let (name, cpu) = line.trim().split_once('\t')?;
            let cpu: f64 = cpu.trim().trim_end_matches('%').parse().ok()?;
            (cpu > HIGH_CPU_PCT).then(|| format!("{name} ({cpu:.0}%)"))
        })
        .collect();
    if !high_cpu.is_empty() {
        let names: Vec<&str> = high_cpu.iter().map(String::as_str).take(MAX_NAMES).collect();
        alerts.push(format!("High CPU: {}", names.join(", ")));
    }

    alerts
}

fn summarize_names(names: &[&str]) -> String {
    let shown = names
        .iter()
        .take(MAX_NAMES)
        .copied()
        .collect::<Vec<_>>()
        .join(", ");
    if names.len() > MAX_NAMES {
        format!("{shown} +{} more", names.len() - MAX_NAMES)
    } else {
        shown
    }
}

/// `df -h` columns: filesystem, size, used, avail, use%, mount.
fn disk_alert(df_line: &str) -> Option<String> {
    let cols: Vec<&str> = df_line.split_whitespace().collect();
    if cols.len() < 5 {
        return None;
    }
    let pct: u32 = cols[4].trim_end_matches('%').parse().ok()?;
    let free = cols[3];
    if pct > DISK_CRIT_PCT {
        Some(format!("Disk critical: {pct}% full ({free} free)"))
    } else if pct > DISK_WARN_PCT {
        Some(format!("Disk warning: {pct}% full ({free} free)"))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::settings::MemoryStore;
    use crate::shell::CommandOutput;
    use chrono::{DateTime, TimeDelta};
    use serde_json::json;
    use std::sync::Mutex;

    const SAMPLE: &str = "sonarr\nradarr\nlidarr\nplex\n---SEP---\n\
/dev/md1  10T  9.3T  700G  93% /mnt/user\n---SEP---\n\
plex\t75.20%\nsonarr\t1.00%\nimmich\t51%\n";

    struct CannedShell {
        output: Result<CommandOutput>,
        hosts: Mutex<Vec<(String, Option<u16>)>>,
    }

    impl RemoteShell for CannedShell {
        fn run(
            &self,
            host: &str,
            port: Option<u16>,
            _command: &str,
            _timeout: Duration,
        ) -> Result<CommandOutput> {
            self.hosts.lock().unwrap().push((host.to_owned(), port));
            if host == "root@dead" {
                std::thread::sleep(Duration::from_secs(5));
            }
            match &self.output {
                Ok(out) => Ok(out.clone()),
                Err(e) => Err(OrchestratorError::Shell(e.to_string())),
            }
        }
    }

    struct DownProbe(Vec<&'static str>);

    impl HttpProbe for DownProbe {
        fn probe(&self, url: &str) -> Result<()> {
            if url.contains("stalled") {
                std::thread::sleep(Duration::from_secs(5));
            }
            if self.0.contains(&url) {
                Err(OrchestratorError::Collector("refused".to_owned()))
            } else {
                Ok(())
            }
        }
    }

    /// Certificates expiring a fixed number of days from now, keyed by URL.
    struct CannedCerts {
        expiry_days: Vec<(&'static str, i64)>,
        asked: Mutex<Vec<String>>,
    }

    impl CertInspector for CannedCerts {
        fn not_after(&self, url: &str) -> Result<DateTime<Utc>> {
            self.asked.lock().unwrap().push(url.to_owned());
            self.expiry_days
                .iter()
                .find(|(u, _)| *u == url)
                .map(|(_, days)| Utc::now() + TimeDelta::days(*days) + TimeDelta::hours(1))
                .ok_or_else(|| OrchestratorError::Collector("handshake failed".to_owned()))
        }
    }

    fn quiet_shell() -> Arc<CannedShell> {
        Arc::new(CannedShell {
            output: Ok(CommandOutput {
                code: Some(0),
                stdout: "\n---SEP---\n\n---SEP---\n".to_owned(),
                stderr: String::new(),
            }),
            hosts: Mutex::new(Vec::new()),
        })
    }

    #[test]
    fn parses_all_three_sections() {
        let alerts = parse_host_health(SAMPLE);
        assert_eq!(
            alerts,
            vec![
                "Unhealthy: sonarr, radarr, lidarr +1 more".to_owned(),
                "Disk critical: 93% full (700G free)".to_owned(),
                "High CPU: plex (75%), immich (51%)".to_owned(),
            ]
        );
    }

    #[test]
    fn disk_thresholds() {
        assert_eq!(disk_alert("/dev/md1 10T 5T 5T 50% /mnt/user"), None);
        assert_eq!(
            disk_alert("/dev/md1 10T 8.5T 1.5T 85% /mnt/user").as_deref(),
            Some("Disk warning: 85% full (1.5T free)")
        );
        assert_eq!(disk_alert("garbage"), None);
        assert_eq!(disk_alert("/dev/md1 10T 5T 5T n/a /mnt/user"), None);
    }

    #[test]
    fn healthy_host_produces_nothing() {
        let out = "\n---SEP---\n/dev/md1 10T 1T 9T 10% /mnt/user\n---SEP---\nplex\t2%\n";
        assert!(parse_host_health(out).is_empty());
    }

    #[test]
    fn truncated_output_is_ignored() {
        assert!(parse_host_health("sonarr\n---SEP---\n").is_empty());
    }

    #[test]
    fn collector_combines_host_and_service_alerts() {
        let settings = Arc::new(MemoryStore::from_value(json!({
            "unraid_ssh_host": "root@tower",
            "unraid_ssh_port": 2200,
            "plex_url": "http://plex:32400",
            "sonarr_url": "http://sonarr:8989",
        })));
        let shell = Arc::new(CannedShell {
            output: Ok(CommandOutput {
                code: Some(0),
                stdout: "sonarr\n---SEP---\n\n---SEP---\n".to_owned(),
                stderr: String::new(),
            }),
            hosts: Mutex::new(Vec::new()),
        });
        let collector = HealthCheckCollector::new(
            settings,
            shell.clone(),
            Arc::new(DownProbe(vec!["http://plex:32400"])),
        );

        let alerts = collector.alerts().unwrap();
        assert_eq!(alerts, ["Unhealthy: sonarr", "Plex unreachable"]);
        assert_eq!(
            shell.hosts.lock().unwrap().as_slice(),
            [("root@tower".to_owned(), Some(2200))]
        );
    }

    #[test]
    fn shell_failure_is_absorbed() {
        let settings = Arc::new(MemoryStore::from_value(json!({
            "unraid_ssh_host": "root@tower",
            "jellyfin_url": "http://jf:8096",
        })));
        let shell = Arc::new(CannedShell {
            output: Err(OrchestratorError::Shell("timed out".to_owned())),
            hosts: Mutex::new(Vec::new()),
        });
        let collector = HealthCheckCollector::new(
            settings,
            shell,
            Arc::new(DownProbe(vec!["http://jf:8096"])),
        );

        assert_eq!(collector.alerts().unwrap(), ["Jellyfin unreachable"]);
    }

    #[test]
    fn without_host_no_ssh_call_is_made() {
        let shell = Arc::new(CannedShell {
            output: Ok(CommandOutput::default()),
            hosts: Mutex::new(Vec::new()),
        });
        let collector = HealthCheckCollector::new(
            Arc::new(MemoryStore::new()),
            shell.clone(),
            Arc::new(DownProbe(Vec::new())),
        );
        assert!(collector.alerts().unwrap().is_empty());
        assert!(shell.hosts.lock().unwrap().is_empty());
    }

    #[test]
    fn https_services_report_certificate_expiry() {
        let settings = Arc::new(MemoryStore::from_value(json!({
            "proxmox_url": "https://pve:8006",
            "immich_url": "HTTPS://immich.lan",
            "unifi_url": "https://unifi:8443",
            "forgejo_url": "https://git.lan",
            "plex_url": "http://plex:32400",
        })));
        let certs = Arc::new(CannedCerts {
            expiry_days: vec![
                ("https://pve:8006", -3),
                ("HTTPS://immich.lan", 10),
                ("https://unifi:8443", 200),
            ],
            asked: Mutex::new(Vec::new()),
        });
        let collector =
            HealthCheckCollector::new(settings, quiet_shell(), Arc::new(DownProbe(Vec::new())))
                .with_cert_inspector(certs.clone());

        // forgejo's handshake fails and is skipped; plex is plain http.
        assert_eq!(
            collector.alerts().unwrap(),
            ["Proxmox SSL expired", "Immich SSL expires in 10d"]
        );
        let mut asked = certs.asked.lock().unwrap().clone();
        asked.sort();
        assert_eq!(
            asked,
            [
                "HTTPS://immich.lan",
                "https://git.lan",
                "https://pve:8006",
                "https://unifi:8443"
            ]
        );
    }

    #[test]
    fn stalled_checks_stay_within_the_budget() {
        let settings = Arc::new(MemoryStore::from_value(json!({
            "unraid_ssh_host": "root@dead",
            "plex_url": "http://stalled:32400",
            "sonarr_url": "http://sonarr:8989",
            "radarr_url": "http://radarr:7878",
        })));
        let shell = quiet_shell();
        let collector = HealthCheckCollector::new(
            settings,
            shell.clone(),
            Arc::new(DownProbe(vec!["http://sonarr:8989"])),
        )
        .with_cert_inspector(Arc::new(CannedCerts {
            expiry_days: Vec::new(),
            asked: Mutex::new(Vec::new()),
        }))
        .with_budget(Duration::from_millis(300));

        let started = Instant::now();
        let alerts = collector.alerts().unwrap();
        assert!(started.elapsed() < Duration::from_millis(800));
        assert_eq!(alerts, ["Plex unreachable", "Sonarr unreachable"]);
        assert_eq!(shell.hosts.lock().unwrap().len(), 1);
    }
}
