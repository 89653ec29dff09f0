//! Channel plugin processes.
//!
//! Channels (e-mail, chat, ...) are separate executables discovered in
//! the configured channels directory. The daemon launches one child per
//! channel type and speaks line-delimited JSON over the child's
//! stdin/stdout: the child advertises itself with an `info` line on
//! startup, then answers one response line per notification request. A
//! child that died is relaunched on next use.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::core::Event;
use crate::incident::Incident;
use crate::object::Object;
use crate::recipient::Contact;

/// How long a freshly started plugin may take to send its info line.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// How long one notification round trip may take.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("cannot start plugin '{}': {source}", path.display())]
    Spawn {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("plugin I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("plugin closed its stream")]
    Closed,

    #[error("plugin protocol error: {0}")]
    Protocol(String),

    #[error("plugin timed out")]
    Timeout,

    #[error("notification rejected: {0}")]
    Rejected(String),
}

/// First line a plugin writes after startup.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginInfo {
    /// Channel type tag, e.g. `email`. Must match the configured
    /// channel and the executable name.
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    /// Schema of the channel configuration this plugin accepts.
    #[serde(default)]
    pub config_schema: serde_json::Value,
}

/// One notification handed to a plugin.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationRequest {
    /// Correlation id, unique per request.
    pub id: uuid::Uuid,
    pub contact: ContactPayload,
    pub object: Object,
    pub incident: Incident,
    pub event: Event,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incident_url: Option<String>,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub channel_config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContactPayload {
    pub full_name: String,
    /// Address for the selected channel, if the contact has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl ContactPayload {
    pub fn for_channel(contact: &Contact, channel: &str) -> Self {
        Self {
            full_name: contact.full_name.clone(),
            address: contact.addresses.get(channel).cloned(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PluginResponse {
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

/// A running plugin child.
struct ChannelPlugin {
    info: PluginInfo,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    _child: Child,
}

impl ChannelPlugin {
    async fn start(path: &Path) -> Result<Self, PluginError> {
        let mut child = Command::new(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PluginError::Spawn {
                path: path.to_path_buf(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(PluginError::Closed)?;
        let stdout = child.stdout.take().ok_or(PluginError::Closed)?;
        let mut stdout = BufReader::new(stdout).lines();

        let line = tokio::time::timeout(STARTUP_TIMEOUT, stdout.next_line())
            .await
            .map_err(|_| PluginError::Timeout)??
            .ok_or(PluginError::Closed)?;
        let info: PluginInfo = serde_json::from_str(&line)
            .map_err(|err| PluginError::Protocol(format!("bad info line: {err}")))?;
        debug!(plugin = %info.name, version = ?info.version, "plugin started");

        Ok(Self {
            info,
            stdin,
            stdout,
            _child: child,
        })
    }

    async fn notify(&mut self, request: &NotificationRequest) -> Result<(), PluginError> {
        let mut line = serde_json::to_string(request)
            .map_err(|err| PluginError::Protocol(format!("cannot encode request: {err}")))?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;

        let response = tokio::time::timeout(REQUEST_TIMEOUT, self.stdout.next_line())
            .await
            .map_err(|_| PluginError::Timeout)??
            .ok_or(PluginError::Closed)?;
        let response: PluginResponse = serde_json::from_str(&response)
            .map_err(|err| PluginError::Protocol(format!("bad response line: {err}")))?;
        if response.success {
            Ok(())
        } else {
            Err(PluginError::Rejected(
                response.error.unwrap_or_else(|| "unspecified error".to_string()),
            ))
        }
    }
}

/// Keeps one running plugin per channel type, started on demand from
/// the channels directory.
pub struct PluginRegistry {
    channels_dir: PathBuf,
    plugins: Mutex<HashMap<String, ChannelPlugin>>,
}

impl PluginRegistry {
    pub fn new(channels_dir: PathBuf) -> Self {
        Self {
            channels_dir,
            plugins: Mutex::new(HashMap::new()),
        }
    }

    /// Starts every executable in the channels directory and registers
    /// it under its advertised name. Returns the discovered types.
    pub async fn discover(&self) -> Vec<String> {
        let mut found = Vec::new();
        let entries = match std::fs::read_dir(&self.channels_dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %self.channels_dir.display(), %err, "cannot read channels directory");
                return found;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            match ChannelPlugin::start(&path).await {
                Ok(plugin) => {
                    info!(plugin = %plugin.info.name, path = %path.display(), "channel plugin registered");
                    found.push(plugin.info.name.clone());
                    self.plugins.lock().await.insert(plugin.info.name.clone(), plugin);
                }
                Err(err) => {
                    warn!(path = %path.display(), %err, "skipping channel plugin");
                }
            }
        }
        found
    }

    /// Sends one notification through the plugin for `channel`,
    /// starting or restarting the child if necessary.
    pub async fn notify(
        &self,
        channel: &str,
        request: &NotificationRequest,
    ) -> Result<(), PluginError> {
        let mut plugins = self.plugins.lock().await;
        if !plugins.contains_key(channel) {
            let path = self.channels_dir.join(channel);
            let plugin = ChannelPlugin::start(&path).await?;
            if plugin.info.name != channel {
                return Err(PluginError::Protocol(format!(
                    "plugin at '{}' advertises type '{}'",
                    path.display(),
                    plugin.info.name
                )));
            }
            plugins.insert(channel.to_string(), plugin);
        }

        let plugin = plugins.get_mut(channel).ok_or(PluginError::Closed)?;
        let result = plugin.notify(request).await;
        if matches!(
            result,
            Err(PluginError::Io(_) | PluginError::Closed | PluginError::Timeout)
        ) {
            // Drop the broken child; the next notification relaunches it.
            plugins.remove(channel);
        }
        result
    }
}
