//! Completion notifications.
//!
//! After a run commits its terminal state the dispatcher sends one message
//! per configured channel whose trigger matches. Deliveries run concurrently
//! and each failure becomes a warning string; nothing here can change a
//! run's outcome.

use futures_util::future::join_all;
use simrun_core::{
    Config, NotificationChannel, NotificationPreference, RunRecord, RunState, TriggerPolicy,
};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Output lines quoted at the end of a message.
const MESSAGE_TAIL_LINES: usize = 10;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with status {status}: {stderr}")]
    Command {
        program: String,
        status: i32,
        stderr: String,
    },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to read notification preferences {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid notification preferences: {0}")]
    InvalidPreference(String),
}

pub type Result<T> = std::result::Result<T, NotifyError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub body: String,
}

pub type DeliveryFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// A way to deliver a message to a destination (address or topic).
pub trait Transport: Send + Sync + std::fmt::Debug {
    fn deliver<'a>(&'a self, destination: &'a str, message: &'a Message) -> DeliveryFuture<'a>;
}

/// Pipes the body into the system `mail` command: `mail -s <subject> <address>`.
#[derive(Debug, Clone)]
pub struct MailCommandTransport {
    command: Vec<String>,
}

impl MailCommandTransport {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    fn program(&self) -> &str {
        self.command.first().map_or("mail", String::as_str)
    }

    async fn send(&self, address: &str, message: &Message) -> Result<()> {
        let program = self.program().to_string();
        let mut child = Command::new(&program)
            .args(self.command.iter().skip(1))
            .arg("-s")
            .arg(&message.subject)
            .arg(address)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| NotifyError::Spawn {
                program: program.clone(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            // The exit status below is the real verdict if the command quit early.
            if let Err(err) = stdin.write_all(message.body.as_bytes()).await {
                debug!(program = %program, error = %err, "mail command closed stdin early");
            }
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(NotifyError::Command {
                program,
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

impl Transport for MailCommandTransport {
    fn deliver<'a>(&'a self, destination: &'a str, message: &'a Message) -> DeliveryFuture<'a> {
        Box::pin(self.send(destination, message))
    }
}

/// Publishes to an ntfy-style topic: `POST <server>/<topic>` with the body
/// as text and the subject in the `Title` header.
#[derive(Debug, Clone)]
pub struct NtfyTransport {
    client: reqwest::Client,
    server: String,
}

impl NtfyTransport {
    pub fn new(server: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            server: server.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn topic_url(&self, topic: &str) -> String {
        format!("{}/{topic}", self.server)
    }

    async fn send(&self, topic: &str, message: &Message) -> Result<()> {
        self.client
            .post(self.topic_url(topic))
            .header("Title", &message.subject)
            .body(message.body.clone())
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

impl Transport for NtfyTransport {
    fn deliver<'a>(&'a self, destination: &'a str, message: &'a Message) -> DeliveryFuture<'a> {
        Box::pin(self.send(destination, message))
    }
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    email: Arc<dyn Transport>,
    topic: Arc<dyn Transport>,
    subject: String,
    delivery_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        email: Arc<dyn Transport>,
        topic: Arc<dyn Transport>,
        subject: impl Into<String>,
        delivery_timeout: Duration,
    ) -> Self {
        Self {
            email,
            topic,
            subject: subject.into(),
            delivery_timeout,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let delivery_timeout = Duration::from_secs(config.notify_timeout_sec.max(1));
        Ok(Self::new(
            Arc::new(MailCommandTransport::new(config.mail_command.clone())),
            Arc::new(NtfyTransport::new(config.ntfy_server.clone(), delivery_timeout)?),
            config.notify_subject.clone(),
            delivery_timeout,
        ))
    }

    /// Subject and body for a finished run.
    pub fn compose(&self, record: &RunRecord) -> Message {
        let label = record.descriptor.display_label();
        let subject = format!("{}: {label} {}", self.subject, record.state);

        let elapsed = record
            .started_at
            .zip(record.ended_at)
            .map(|(start, end)| end - start)
            .unwrap_or_else(chrono::Duration::zero);
        let total_minutes = elapsed.num_minutes().max(0);
        let mut body = format!(
            "{label} has finished! It took {} hours and {} minutes to run.\n",
            total_minutes / 60,
            total_minutes % 60
        );

        body.push_str(&format!("Final state: {}\n", record.state));
        if let Some(code) = record.exit_code {
            body.push_str(&format!("Exit code: {code}\n"));
        }
        if let Some(reason) = &record.failure_reason {
            body.push_str(&format!("Cause: {reason}\n"));
        }
        body.push_str(&format!("Target: {}\n", record.descriptor.target.summary()));
        body.push_str(&format!(
            "Command: {}\n",
            record.descriptor.executable.display_command()
        ));
        if !record.marker_hits.is_empty() {
            body.push_str(&format!(
                "Error markers matched {} line(s):\n",
                record.marker_hits.len()
            ));
            for line in record.marker_hits.last_text(MESSAGE_TAIL_LINES) {
                body.push_str(&format!("  {line}\n"));
            }
        }
        let tail = record.output_tail.last_text(MESSAGE_TAIL_LINES);
        if !tail.is_empty() {
            body.push_str("Last output:\n");
            for line in tail {
                body.push_str(&format!("  {line}\n"));
            }
        }

        Message { subject, body }
    }

    /// Notify every matching channel. Returns one warning per failed delivery.
    pub async fn dispatch(&self, record: &RunRecord) -> Vec<String> {
        let preference = &record.descriptor.notification;
        if !should_notify(preference, record.state) {
            return Vec::new();
        }

        let message = self.compose(record);
        let deliveries = preference
            .channels
            .iter()
            .map(|channel| self.deliver(channel, &message));
        let results = join_all(deliveries).await;

        let mut warnings = Vec::new();
        for (channel, result) in preference.channels.iter().zip(results) {
            match result {
                Ok(()) => info!(run_id = %record.id, channel = %channel, "notification sent"),
                Err(err) => {
                    warn!(run_id = %record.id, channel = %channel, error = %err, "notification failed");
                    warnings.push(format!("{} notification to {} failed: {err}", channel.kind(), channel.destination()));
                }
            }
        }
        warnings
    }

    async fn deliver(&self, channel: &NotificationChannel, message: &Message) -> Result<()> {
        let (transport, destination) = match channel {
            NotificationChannel::Email(address) => (&self.email, address.as_str()),
            NotificationChannel::Topic(topic) => (&self.topic, topic.as_str()),
        };
        debug!(channel = %channel, "delivering notification");
        match timeout(self.delivery_timeout, transport.deliver(destination, message)).await {
            Ok(result) => result,
            Err(_) => Err(NotifyError::Timeout(self.delivery_timeout)),
        }
    }
}

/// Read a saved preference file: the method (`email` or `ntfy`) on the first
/// line, the address or topic on the second. A missing file means no saved
/// preference.
pub fn load_preference(path: &Path) -> Result<Option<NotificationPreference>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(NotifyError::Read {
                path: path.display().to_string(),
                source,
            })
        }
    };
    let mut lines = content.lines().map(str::trim).filter(|l| !l.is_empty());
    let (Some(method), Some(destination)) = (lines.next(), lines.next()) else {
        return Err(NotifyError::InvalidPreference(
            "expected a method line and a destination line".to_string(),
        ));
    };
    let channel = match method {
        "email" => NotificationChannel::Email(destination.to_string()),
        "ntfy" | "topic" => NotificationChannel::Topic(destination.to_string()),
        other => {
            return Err(NotifyError::InvalidPreference(format!(
                "unknown method '{other}', expected 'email' or 'ntfy'"
            )))
        }
    };
    Ok(Some(NotificationPreference {
        channels: vec![channel],
        trigger: TriggerPolicy::Always,
    }))
}

/// Whether a run that ended in `state` would notify under `preference`.
pub fn should_notify(preference: &NotificationPreference, state: RunState) -> bool {
    !preference.is_empty() && preference.trigger.matches(state)
}
