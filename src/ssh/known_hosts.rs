//! Bastion host key verification against an OpenSSH known_hosts file.
//!
//! The file location is supplied by the caller (defaulting to
//! `~/.ssh/known_hosts`). Hashed hostnames, `*`/`?` globs, `!` negation,
//! `[host]:port` labels and `@revoked` markers are understood.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use hmac::{Hmac, Mac};
use sha1::Sha1;
use ssh_key::known_hosts::{HostPatterns, KnownHosts, Marker};

use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;

use crate::config::HostKeyPolicy;
use crate::models::error::{Result, TunnelError};

/// What the known_hosts file says about a presented key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyStatus {
    Matched,
    /// No entry for this host
    Unknown { key_type: String, fingerprint: String },
    /// Entries exist for this host but none carries the presented key
    Mismatch { expected: String, actual: String },
    Revoked,
}

/// Outcome of applying a `HostKeyPolicy`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyVerdict {
    Accept,
    /// Accepted, and the caller should record the key
    AcceptAndRecord,
    Reject(String),
}

/// Map a lookup result onto a policy
pub fn judge(policy: HostKeyPolicy, status: &HostKeyStatus) -> HostKeyVerdict {
    match (policy, status) {
        (HostKeyPolicy::AcceptAny, _) | (_, HostKeyStatus::Matched) => HostKeyVerdict::Accept,
        (HostKeyPolicy::AcceptNew, HostKeyStatus::Unknown { .. }) => {
            HostKeyVerdict::AcceptAndRecord
        }
        (HostKeyPolicy::Strict, HostKeyStatus::Unknown { fingerprint, .. }) => {
            HostKeyVerdict::Reject(format!(
                "Host is not present in known_hosts (presented {})",
                fingerprint
            ))
        }
        (_, HostKeyStatus::Mismatch { expected, actual }) => HostKeyVerdict::Reject(format!(
            "Host key has changed! Expected {}, received {}",
            expected, actual
        )),
        (_, HostKeyStatus::Revoked) => {
            HostKeyVerdict::Reject("Host key has been revoked".to_string())
        }
    }
}

/// A known_hosts file on disk
#[derive(Debug, Clone)]
pub struct KnownHostsFile {
    path: PathBuf,
}

impl KnownHostsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `~/.ssh/known_hosts`, or the override when one is given
    pub fn resolve(path_override: Option<&Path>) -> Result<Self> {
        if let Some(path) = path_override {
            return Ok(Self::new(path));
        }
        dirs::home_dir()
            .map(|home| Self::new(home.join(".ssh").join("known_hosts")))
            .ok_or_else(|| TunnelError::HostKeyRejected {
                hostname: "<unknown>".to_string(),
                reason: "Could not determine home directory".to_string(),
            })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look the key up. A missing file means every host is unknown.
    pub fn lookup(&self, hostname: &str, port: u16, key: &PublicKey) -> Result<HostKeyStatus> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(lookup_in_content(hostname, port, key, &content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HostKeyStatus::Unknown {
                key_type: key.name().to_string(),
                fingerprint: key.fingerprint(),
            }),
            Err(e) => Err(TunnelError::HostKeyRejected {
                hostname: hostname.to_string(),
                reason: format!("Failed to read {}: {}", self.path.display(), e),
            }),
        }
    }

    /// Append an entry for the host, creating the file if needed.
    pub fn record(&self, hostname: &str, port: u16, key: &PublicKey) -> Result<()> {
        let io_err = |what: &str, e: std::io::Error| TunnelError::HostKeyRejected {
            hostname: hostname.to_string(),
            reason: format!("Failed to {} {}: {}", what, self.path.display(), e),
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err("create directory for", e))?;
        }

        let label = host_label(hostname, port);
        let line = format!("{} {} {}\n", label, key.name(), key.public_key_base64());

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| io_err("open", e))?;
        file.write_all(line.as_bytes())
            .map_err(|e| io_err("write", e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = fs::set_permissions(&self.path, fs::Permissions::from_mode(0o644)) {
                tracing::warn!("Failed to set known_hosts permissions: {}", e);
            }
        }

        tracing::info!("Recorded {} host key for {}", key.name(), label);
        Ok(())
    }
}

/// `host` for port 22, `[host]:port` otherwise
fn host_label(hostname: &str, port: u16) -> String {
    if port == 22 {
        hostname.to_string()
    } else {
        format!("[{}]:{}", hostname, port)
    }
}

fn lookup_in_content(hostname: &str, port: u16, key: &PublicKey, content: &str) -> HostKeyStatus {
    let presented = key.public_key_bytes();
    let label = host_label(hostname, port);
    let mut expected: Option<String> = None;

    // Malformed lines are skipped
    for entry in KnownHosts::new(content).flatten() {
        if !host_matches(entry.host_patterns(), hostname, &label) {
            continue;
        }

        let same_key = keys_equal(&presented, entry.public_key());
        if entry.marker() == Some(&Marker::Revoked) {
            if same_key {
                return HostKeyStatus::Revoked;
            }
            continue;
        }

        if same_key {
            return HostKeyStatus::Matched;
        }
        expected.get_or_insert_with(|| fingerprint_of(entry.public_key()));
    }

    match expected {
        Some(expected) => HostKeyStatus::Mismatch {
            expected,
            actual: key.fingerprint(),
        },
        None => HostKeyStatus::Unknown {
            key_type: key.name().to_string(),
            fingerprint: key.fingerprint(),
        },
    }
}

fn host_matches(patterns: &HostPatterns, hostname: &str, label: &str) -> bool {
    match patterns {
        HostPatterns::Patterns(pats) => {
            let mut matched = false;
            for pat in pats {
                if let Some(negated) = pat.strip_prefix('!') {
                    if glob_match(negated, label) || glob_match(negated, hostname) {
                        return false;
                    }
                } else if glob_match(pat, label) || glob_match(pat, hostname) {
                    matched = true;
                }
            }
            matched
        }
        HostPatterns::HashedName { salt, hash } => {
            hash_matches(salt, hash, label) || hash_matches(salt, hash, hostname)
        }
    }
}

/// HMAC-SHA1(salt, name) == hash
fn hash_matches(salt: &[u8], expected: &[u8; 20], name: &str) -> bool {
    let Ok(mut mac) = Hmac::<Sha1>::new_from_slice(salt) else {
        return false;
    };
    mac.update(name.as_bytes());
    mac.finalize().into_bytes().as_slice() == expected
}

/// `*` and `?` wildcards only
fn glob_match(pattern: &str, text: &str) -> bool {
    fn inner(p: &[char], t: &[char]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (Some('*'), _) => inner(&p[1..], t) || (!t.is_empty() && inner(p, &t[1..])),
            (Some('?'), Some(_)) => inner(&p[1..], &t[1..]),
            (Some(a), Some(b)) if a == b => inner(&p[1..], &t[1..]),
            _ => false,
        }
    }
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    inner(&p, &t)
}

fn keys_equal(presented: &[u8], stored: &ssh_key::PublicKey) -> bool {
    ssh_key::PublicKey::from_bytes(presented)
        .map(|parsed| parsed.key_data() == stored.key_data())
        .unwrap_or(false)
}

/// SHA256:base64 fingerprint
fn fingerprint_of(key: &ssh_key::PublicKey) -> String {
    use sha2::{Digest, Sha256};
    use ssh_encoding::Encode;

    let mut bytes = Vec::new();
    match key.key_data().encode(&mut bytes) {
        Ok(()) => format!(
            "SHA256:{}",
            data_encoding::BASE64_NOPAD.encode(&Sha256::digest(&bytes))
        ),
        Err(_) => "unknown".to_string(),
    }
}
