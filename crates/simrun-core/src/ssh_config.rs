//! Minimal OpenSSH client config reader.
//!
//! Resolves a host alias to a [`RemoteTarget`] using `Host` blocks from
//! `~/.ssh/config`. Only the options needed to build a target are read:
//! `HostName`, `User`, `Port`, and `IdentityFile`. The first value found for
//! an option wins, as in `ssh_config(5)`.

use crate::config::expand_home;
use crate::descriptor::{RemoteTarget, DEFAULT_SSH_PORT};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SshConfigError {
    #[error("failed to read ssh config: {0}")]
    Read(#[from] std::io::Error),
    #[error("invalid port for host {alias}: {value}")]
    InvalidPort { alias: String, value: String },
    #[error("no user configured for host {0}; add a User entry or use user@host")]
    MissingUser(String),
}

#[derive(Debug, Clone)]
struct HostBlock {
    patterns: Vec<String>,
    options: Vec<(String, String)>,
}

impl HostBlock {
    fn matches(&self, alias: &str) -> bool {
        let mut matched = false;
        for pattern in &self.patterns {
            if let Some(negated) = pattern.strip_prefix('!') {
                if glob_match(negated, alias) {
                    return false;
                }
            } else if glob_match(pattern, alias) {
                matched = true;
            }
        }
        matched
    }
}

/// Options collected for one alias.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostEntry {
    pub hostname: Option<String>,
    pub user: Option<String>,
    pub port: Option<String>,
    pub identity_files: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SshConfig {
    blocks: Vec<HostBlock>,
}

impl SshConfig {
    /// Read a config file. A missing file yields an empty config.
    pub fn load(path: &Path) -> Result<Self, SshConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(Self::parse(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn parse(content: &str) -> Self {
        let mut blocks = Vec::new();
        // Options before the first Host line apply to every host.
        let mut current = HostBlock {
            patterns: vec!["*".to_string()],
            options: Vec::new(),
        };

        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some((key, value)) = split_option(trimmed) else {
                continue;
            };
            let key = key.to_ascii_lowercase();
            match key.as_str() {
                "host" => {
                    blocks.push(current);
                    current = HostBlock {
                        patterns: value.split_whitespace().map(str::to_string).collect(),
                        options: Vec::new(),
                    };
                }
                // Match blocks need runtime evaluation; their options are skipped.
                "match" => {
                    blocks.push(current);
                    current = HostBlock {
                        patterns: Vec::new(),
                        options: Vec::new(),
                    };
                }
                _ => current.options.push((key, unquote(value).to_string())),
            }
        }
        blocks.push(current);
        Self { blocks }
    }

    pub fn lookup(&self, alias: &str) -> HostEntry {
        let mut entry = HostEntry::default();
        for block in self.blocks.iter().filter(|b| b.matches(alias)) {
            for (key, value) in &block.options {
                match key.as_str() {
                    "hostname" if entry.hostname.is_none() => entry.hostname = Some(value.clone()),
                    "user" if entry.user.is_none() => entry.user = Some(value.clone()),
                    "port" if entry.port.is_none() => entry.port = Some(value.clone()),
                    "identityfile" => entry.identity_files.push(value.clone()),
                    _ => {}
                }
            }
        }
        entry
    }

    /// Resolve `alias` (or `user@alias`) into a connection triple.
    pub fn resolve(&self, alias: &str) -> Result<RemoteTarget, SshConfigError> {
        let (explicit_user, alias) = match alias.split_once('@') {
            Some((user, host)) => (Some(user.to_string()), host),
            None => (None, alias),
        };
        let entry = self.lookup(alias);

        let host = entry
            .hostname
            .map_or_else(|| alias.to_string(), |h| h.replace("%h", alias));
        let user = explicit_user
            .or(entry.user)
            .ok_or_else(|| SshConfigError::MissingUser(alias.to_string()))?;
        let port = match entry.port {
            Some(value) => value.parse().map_err(|_| SshConfigError::InvalidPort {
                alias: alias.to_string(),
                value,
            })?,
            None => DEFAULT_SSH_PORT,
        };
        let key_reference = entry.identity_files.first().map(|f| expand_home(f));

        Ok(RemoteTarget {
            host,
            user,
            key_reference,
            port,
        })
    }
}

/// Split `Key value` or `Key=value`.
fn split_option(line: &str) -> Option<(&str, &str)> {
    let idx = line.find(|c: char| c.is_whitespace() || c == '=')?;
    let (key, rest) = line.split_at(idx);
    let value = rest
        .trim_start()
        .strip_prefix('=')
        .unwrap_or(rest)
        .trim();
    if key.is_empty() || value.is_empty() {
        return None;
    }
    Some((key, value))
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

/// `*` matches any run of characters, `?` matches exactly one.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}
