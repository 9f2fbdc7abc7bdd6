//! Best-effort notifications (desktop and Discord webhook).
//!
//! Callers treat every [`Notifier`] as fire-and-forget: a returned error is
//! logged and counted by the caller, never propagated further.

use crate::config::NotificationConfig;
use crate::error::{OrchestratorError, Result};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Timeout for a single webhook POST.
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Notification collaborator.
pub trait Notifier: Send + Sync {
    /// Deliver a notification.
    ///
    /// # Errors
    ///
    /// Returns an error if delivery failed. Callers are expected to ignore it.
    fn notify(&self, title: &str, message: &str) -> Result<()>;
}

/// Notifier that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _title: &str, _message: &str) -> Result<()> {
        Ok(())
    }
}

/// Platform desktop notifications via `notify-send` (Linux) or `osascript`
/// (macOS). Other platforms are a silent no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct DesktopNotifier;

impl Notifier for DesktopNotifier {
    fn notify(&self, title: &str, message: &str) -> Result<()> {
        let Some(mut command) = desktop_command(title, message) else {
            return Ok(());
        };

        let status = command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| OrchestratorError::Notify(format!("cannot spawn notifier: {e}")))?;

        if status.success() {
            Ok(())
        } else {
            Err(OrchestratorError::Notify(format!(
                "desktop notifier exited with {status}"
            )))
        }
    }
}

fn desktop_command(title: &str, message: &str) -> Option<Command> {
    if cfg!(target_os = "macos") {
        let script = format!(
            "display notification \"{}\" with title \"{}\"",
            escape_applescript(message),
            escape_applescript(title)
        );
        let mut cmd = Command::new("osascript");
        cmd.arg("-e").arg(script);
        Some(cmd)
    } else if cfg!(target_os = "linux") {
        let mut cmd = Command::new("notify-send");
        cmd.arg(title).arg(message);
        Some(cmd)
    } else {
        None
    }
}

fn escape_applescript(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Posts notifications to a Discord webhook.
pub struct DiscordNotifier {
    webhook_url: String,
    agent: ureq::Agent,
}

impl DiscordNotifier {
    /// Create a notifier for the given webhook URL.
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            webhook_url: webhook_url.into(),
            agent: ureq::AgentBuilder::new().timeout(WEBHOOK_TIMEOUT).build(),
        }
    }
}

/// Build the JSON body Discord expects for a webhook message.
pub fn discord_payload(title: &str, message: &str) -> serde_json::Value {
    serde_json::json!({ "content": format!("**{title}**: {message}") })
}

impl Notifier for DiscordNotifier {
    fn notify(&self, title: &str, message: &str) -> Result<()> {
        let body = serde_json::to_string(&discord_payload(title, message))?;
        self.agent
            .post(&self.webhook_url)
            .set("Content-Type", "application/json")
            .set("User-Agent", "Homelab")
            .send_string(&body)
            .map_err(|e| OrchestratorError::Notify(format!("discord webhook failed: {e}")))?;
        Ok(())
    }
}

/// Fans a notification out to several notifiers, honouring the global
/// enable switch.
///
/// Every target is attempted. The first error, if any, is returned.
pub struct MultiNotifier {
    enabled: bool,
    targets: Vec<Arc<dyn Notifier>>,
}

impl MultiNotifier {
    /// Create a fan-out notifier.
    pub fn new(enabled: bool, targets: Vec<Arc<dyn Notifier>>) -> Self {
        Self { enabled, targets }
    }

    /// Desktop notifications plus Discord when a webhook URL is configured.
    pub fn from_config(config: &NotificationConfig) -> Self {
        let mut targets: Vec<Arc<dyn Notifier>> = vec![Arc::new(DesktopNotifier)];
        if !config.discord_webhook_url.trim().is_empty() {
            targets.push(Arc::new(DiscordNotifier::new(
                config.discord_webhook_url.trim(),
            )));
        }
        Self::new(config.enabled, targets)
    }
}

impl Notifier for MultiNotifier {
    fn notify(&self, title: &str, message: &str) -> Result<()> {
        if !self.enabled {
            debug!("notifications disabled, dropping: {title}");
            return Ok(());
        }

        let mut first_err = None;
        for target in &self.targets {
            if let Err(e) = target.notify(title, message) {
                debug!("notification target failed: {e}");
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
