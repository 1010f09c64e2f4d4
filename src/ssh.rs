// file: src/ssh.rs
// version: 2.0.0
// guid: t0u1v2w3-x4y5-6789-0123-456789tuvwxy

//! SSH session shared by the remote cache, node clients and the BMC executor
//!
//! `ssh2` is blocking, so every call runs on the blocking pool with the
//! session behind a mutex. Session-level timeouts bound each call, which keeps
//! abandoned blocking work from running forever after a cancellation.

use crate::config::{HostKeyPolicy, SshEndpoint};
use crate::error::{ProvisionError, Result};
use ssh2::{CheckResult, KnownHostFileKind, Session};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Output of one remote command
#[derive(Debug, Clone)]
pub struct RemoteOutput {
    pub exit_status: i32,
    /// stdout followed by stderr
    pub combined: Vec<u8>,
}

/// Authenticated SSH session
pub struct SshSession {
    endpoint: SshEndpoint,
    session: Arc<Mutex<Session>>,
}

impl SshSession {
    /// Connect, verify the host key and authenticate
    pub async fn connect(endpoint: &SshEndpoint) -> Result<Self> {
        let endpoint = endpoint.clone();
        info!("Connecting to {} as {}", endpoint.address(), endpoint.user);

        let target = endpoint.clone();
        let session = tokio::task::spawn_blocking(move || open_session(&target))
            .await
            .map_err(|e| ProvisionError::transport(format!("SSH connect task failed: {}", e)))?
            .map_err(|e| e.wrap("ssh connect", endpoint.address()))?;

        info!("SSH connection established to {}", endpoint.address());
        Ok(Self {
            endpoint,
            session: Arc::new(Mutex::new(session)),
        })
    }

    pub fn endpoint(&self) -> &SshEndpoint {
        &self.endpoint
    }

    /// Run a closure against the raw session on the blocking pool
    pub async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Session) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let session = Arc::clone(&self.session);
        tokio::task::spawn_blocking(move || {
            let guard = session
                .lock()
                .map_err(|_| ProvisionError::transport("SSH session lock poisoned"))?;
            f(&guard)
        })
        .await
        .map_err(|e| ProvisionError::transport(format!("SSH task failed: {}", e)))?
    }

    /// Like [`Self::blocking`] but returns early when the token fires
    pub async fn blocking_cancellable<F, T>(&self, cancel: &CancellationToken, f: F) -> Result<T>
    where
        F: FnOnce(&Session) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        tokio::select! {
            _ = cancel.cancelled() => Err(ProvisionError::cancelled(format!(
                "SSH call to {} cancelled",
                self.endpoint.host
            ))),
            result = self.blocking(f) => result,
        }
    }

    /// Execute a shell command line, optionally feeding stdin
    pub async fn exec(
        &self,
        cancel: &CancellationToken,
        command: &str,
        input: Option<Vec<u8>>,
    ) -> Result<RemoteOutput> {
        debug!("Executing remote command on {}: {}", self.endpoint.host, command);
        let command = command.to_string();
        self.blocking_cancellable(cancel, move |session| {
            exec_blocking(session, &command, input.as_deref())
        })
        .await
    }

    /// Upload a local file through SFTP
    pub async fn upload_file(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        info!(
            "Uploading {} to {}:{}",
            local_path.display(),
            self.endpoint.host,
            remote_path
        );
        let local = local_path.to_path_buf();
        let remote = PathBuf::from(remote_path);
        self.blocking(move |session| {
            let sftp = session.sftp()?;
            let mut source = std::fs::File::open(&local)?;
            let mut target = sftp.create(&remote)?;
            std::io::copy(&mut source, &mut target)?;
            Ok(())
        })
        .await
        .map_err(|e| e.wrap("upload", remote_path))
    }

    /// Close the session
    pub async fn disconnect(&self) {
        let result = self
            .blocking(|session| {
                session.disconnect(None, "closing", None)?;
                Ok(())
            })
            .await;
        match result {
            Ok(()) => info!("SSH session to {} disconnected", self.endpoint.host),
            Err(e) => debug!("SSH disconnect from {}: {}", self.endpoint.host, e),
        }
    }
}

fn open_session(endpoint: &SshEndpoint) -> Result<Session> {
    let timeout = Duration::from_secs(endpoint.connect_timeout_secs.max(1));
    let addr = endpoint
        .address()
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| ProvisionError::not_found(format!("No address for {}", endpoint.host)))?;

    let tcp = TcpStream::connect_timeout(&addr, timeout)
        .map_err(|e| ProvisionError::transport(format!("Failed to connect to {}: {}", addr, e)))?;

    let mut session = Session::new()?;
    session.set_tcp_stream(tcp);
    session.set_timeout(timeout.as_millis() as u32 * 30);
    session.handshake()?;

    verify_host_key(&session, endpoint)?;
    authenticate(&session, endpoint)?;

    if !session.authenticated() {
        return Err(ProvisionError::transport("SSH authentication failed"));
    }
    Ok(session)
}

fn known_hosts_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".ssh").join("known_hosts"))
}

fn known_hosts_entry(endpoint: &SshEndpoint) -> String {
    if endpoint.port == 22 {
        endpoint.host.clone()
    } else {
        format!("[{}]:{}", endpoint.host, endpoint.port)
    }
}

fn verify_host_key(session: &Session, endpoint: &SshEndpoint) -> Result<()> {
    let (key, key_type) = session
        .host_key()
        .ok_or_else(|| ProvisionError::transport("Server presented no host key"))?;

    let mut known_hosts = session.known_hosts()?;
    let path = known_hosts_path();
    if let Some(path) = path.as_ref().filter(|p| p.exists()) {
        known_hosts.read_file(path, KnownHostFileKind::OpenSSH)?;
    }

    match known_hosts.check_port(&endpoint.host, endpoint.port, key) {
        CheckResult::Match => Ok(()),
        CheckResult::Mismatch => Err(ProvisionError::integrity(format!(
            "Host key for {} does not match known_hosts",
            endpoint.host
        ))),
        CheckResult::NotFound => match endpoint.host_key_policy {
            HostKeyPolicy::Strict => Err(ProvisionError::precondition(format!(
                "Host {} is not in known_hosts",
                endpoint.host
            ))),
            HostKeyPolicy::AcceptNew => {
                warn!("Recording new host key for {}", endpoint.host);
                known_hosts.add(
                    &known_hosts_entry(endpoint),
                    key,
                    "added by turingpi-provisioner",
                    key_type.into(),
                )?;
                if let Some(path) = path {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    known_hosts.write_file(&path, KnownHostFileKind::OpenSSH)?;
                }
                Ok(())
            }
        },
        CheckResult::Failure => Err(ProvisionError::transport(format!(
            "Host key check failed for {}",
            endpoint.host
        ))),
    }
}

fn authenticate(session: &Session, endpoint: &SshEndpoint) -> Result<()> {
    if let Some(key_file) = &endpoint.key_file {
        session.userauth_pubkey_file(&endpoint.user, None, key_file, None)?;
        return Ok(());
    }
    if let Some(password) = &endpoint.password {
        session.userauth_password(&endpoint.user, password)?;
        return Ok(());
    }
    session.userauth_agent(&endpoint.user).map_err(|e| {
        ProvisionError::transport(format!(
            "SSH authentication failed - no valid key found: {}",
            e
        ))
    })
}

fn exec_blocking(session: &Session, command: &str, input: Option<&[u8]>) -> Result<RemoteOutput> {
    let mut channel = session.channel_session()?;
    channel.exec(command)?;

    if let Some(input) = input {
        channel.write_all(input)?;
    }
    channel.send_eof()?;

    let mut combined = Vec::new();
    channel.read_to_end(&mut combined)?;
    channel.stderr().read_to_end(&mut combined)?;

    channel.wait_close()?;
    let exit_status = channel.exit_status()?;

    Ok(RemoteOutput {
        exit_status,
        combined,
    })
}

/// Quote one word for a POSIX shell
pub fn shell_quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@,+".contains(c))
    {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', "'\"'\"'"))
}

/// Join a program and its arguments into a quoted command line
pub fn command_line(name: &str, args: &[&str]) -> String {
    std::iter::once(name)
        .chain(args.iter().copied())
        .map(shell_quote)
        .collect::<Vec<_>>()
        .join(" ")
}
