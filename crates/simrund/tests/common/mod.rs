//! Shared fixtures for simrund integration tests.

#![allow(dead_code)]

use simrun_core::{Config, RunEvent, RunState};
use simrund::controller::{ExecutionContext, Subscription};
use simrund::notify::{DeliveryFuture, Dispatcher, Message, NotifyError, Transport};
use simrund::registry::RunRegistry;
use simrund::ssh::SshManager;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Fake OpenSSH client: masters create their control path and sleep, control
/// checks pass while the path exists, sessions run the remote command locally.
pub fn fake_ssh(dir: &Path) -> PathBuf {
    let script = r#"#!/bin/sh
ctl=""
prev=""
control=""
master=""
for arg in "$@"; do
  if [ "$prev" = "-S" ]; then ctl="$arg"; fi
  case "$arg" in
    -O) control=1 ;;
    -N) master=1 ;;
  esac
  prev="$arg"
done
if [ -n "$control" ]; then
  [ -e "$ctl" ] && exit 0
  exit 255
fi
if [ -n "$master" ]; then
  : > "$ctl"
  exec sleep 600
fi
for last in "$@"; do :; done
exec sh -c "$last"
"#;
    let path = dir.join("fake_ssh.sh");
    std::fs::write(&path, script).unwrap();
    path
}

/// Fake client whose masters take `delay_sec` before the control socket
/// appears, like a host that is slow to authenticate.
pub fn slow_ssh(dir: &Path, delay_sec: u32) -> PathBuf {
    let fast = std::fs::read_to_string(fake_ssh(dir)).unwrap();
    let script = fast.replace(
        "  : > \"$ctl\"\n",
        &format!("  sleep {delay_sec}\n  : > \"$ctl\"\n"),
    );
    let path = dir.join("slow_ssh.sh");
    std::fs::write(&path, script).unwrap();
    path
}

/// Fake client whose every connection attempt fails like an unreachable host.
pub fn unreachable_ssh(dir: &Path) -> PathBuf {
    let path = dir.join("unreachable_ssh.sh");
    std::fs::write(
        &path,
        "#!/bin/sh\necho 'ssh: connect to host nowhere.invalid port 22: No route to host' >&2\nexit 255\n",
    )
    .unwrap();
    path
}

pub fn config(dir: &Path, ssh_script: &Path) -> Config {
    let mut config = Config::default();
    config.ssh_command = vec!["sh".to_string(), ssh_script.display().to_string()];
    config.ssh_control_dir = dir.join("ctl");
    config.ssh_connect_timeout_sec = 2;
    config.ssh_connect_retries = 0;
    config.cancel_grace_ms = 500;
    config
}

/// Records every delivery.
#[derive(Debug, Default)]
pub struct Recorder {
    pub sent: Mutex<Vec<(String, Message)>>,
}

impl Recorder {
    pub fn destinations(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(d, _)| d.clone()).collect()
    }
}

impl Transport for Recorder {
    fn deliver<'a>(&'a self, destination: &'a str, message: &'a Message) -> DeliveryFuture<'a> {
        self.sent
            .lock()
            .unwrap()
            .push((destination.to_string(), message.clone()));
        Box::pin(async { Ok(()) })
    }
}

/// Rejects every delivery.
#[derive(Debug)]
pub struct Refusing;

impl Transport for Refusing {
    fn deliver<'a>(&'a self, _destination: &'a str, _message: &'a Message) -> DeliveryFuture<'a> {
        Box::pin(async {
            Err(NotifyError::Command {
                program: "mail".to_string(),
                status: 1,
                stderr: "relay unavailable".to_string(),
            })
        })
    }
}

pub fn registry_with(config: &Config, email: Arc<dyn Transport>, topic: Arc<dyn Transport>) -> RunRegistry {
    let ssh = Arc::new(SshManager::from_config(config));
    let dispatcher = Dispatcher::new(email, topic, "Simulation run notification", Duration::from_secs(2));
    let ctx = ExecutionContext::new(config, ssh, dispatcher);
    RunRegistry::new(Arc::new(ctx), config.retention())
}

pub fn registry(config: &Config) -> RunRegistry {
    let recorder = Arc::new(Recorder::default());
    registry_with(config, Arc::clone(&recorder) as Arc<dyn Transport>, recorder)
}

pub async fn collect(mut subscription: Subscription) -> Vec<RunEvent> {
    let mut events = Vec::new();
    while let Some(event) = subscription.next().await {
        events.push(event);
    }
    events
}

/// Wait until the subscription reports `state`.
pub async fn wait_for_state(subscription: &mut Subscription, state: RunState) {
    while let Some(event) = subscription.next().await {
        if event.state() == Some(state) {
            return;
        }
    }
    panic!("run never reached {state}");
}
