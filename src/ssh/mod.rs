//! SSH transport for running one command on a remote node.

use async_trait::async_trait;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::ops::Deref;
use std::time::Duration;
use thiserror::Error;

use crate::credentials::Credential;

/// Errors raised before a command produced an exit status
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("TCP connection to {host} failed: {reason}")]
    Connect { host: String, reason: String },

    #[error("SSH handshake with {host} failed: {reason}")]
    Handshake { host: String, reason: String },

    #[error("SSH authentication as {user}@{host} failed: all methods exhausted")]
    Authentication { host: String, user: String },

    #[error("SSH channel error on {host}: {reason}")]
    Channel { host: String, reason: String },

    #[error("Timed out after {secs}s waiting for {host}")]
    Timeout { host: String, secs: u64 },

    #[error("Task join error: {0}")]
    Join(String),
}

/// Output captured from a remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

/// A remote command as a program plus arguments. Arguments are quoted when
/// rendered, so values never get interpreted by the remote shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    pub program: String,
    pub args: Vec<String>,
    pub elevate: bool,
}

impl RemoteCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            elevate: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Run through `sudo -S`, with the secret fed on stdin
    pub fn elevated(mut self) -> Self {
        self.elevate = true;
        self
    }

    /// Render the command line sent over the SSH channel
    pub fn render(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 5);
        if self.elevate {
            parts.extend(["sudo", "-S", "-p", "''", "--"].map(String::from));
        }
        parts.push(shell_quote(&self.program));
        parts.extend(self.args.iter().map(|a| shell_quote(a)));
        parts.join(" ")
    }
}

/// Quote a word for a POSIX shell. Plain words are left as-is.
pub fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@+%".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// RemoteExecutor runs one command on one host with the run's credential
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute(
        &self,
        host: &str,
        credential: &Credential,
        command: &RemoteCommand,
    ) -> Result<CommandOutput, RemoteError>;
}

/// Keyboard-interactive prompt handler that always responds with the password
struct PasswordPrompt {
    password: String,
}

impl ssh2::KeyboardInteractivePrompt for PasswordPrompt {
    fn prompt<'a>(
        &mut self,
        _username: &str,
        _instructions: &str,
        prompts: &[ssh2::Prompt<'a>],
    ) -> Vec<String> {
        prompts.iter().map(|_| self.password.clone()).collect()
    }
}

/// Authenticated session that is disconnected when dropped, on every path
struct SessionGuard {
    session: ssh2::Session,
    host: String,
}

impl Deref for SessionGuard {
    type Target = ssh2::Session;

    fn deref(&self) -> &ssh2::Session {
        &self.session
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Err(e) = self.session.disconnect(None, "teardown complete", None) {
            tracing::debug!("SSH disconnect from {} failed: {}", self.host, e);
        }
    }
}

/// Shortest per-command deadline accepted
pub const MIN_TIMEOUT: Duration = Duration::from_secs(1);

/// End-of-input on a pty in canonical mode
const PTY_EOF: char = '\x04';

/// Bytes written to an elevated command's pty: the secret line, then
/// end-of-input so a rejected password makes `sudo -S` give up at once
/// instead of waiting for another attempt
fn elevation_input(secret: &str) -> String {
    format!("{}\n{}", secret, PTY_EOF)
}

/// Executes commands over a fresh SSH connection per call
#[derive(Debug, Clone)]
pub struct SshExecutor {
    port: u16,
    timeout: Duration,
}

impl SshExecutor {
    /// A zero timeout means "wait forever" to libssh2, so it is raised to
    /// [`MIN_TIMEOUT`]
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self {
            port,
            timeout: timeout.max(MIN_TIMEOUT),
        }
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn execute(
        &self,
        host: &str,
        credential: &Credential,
        command: &RemoteCommand,
    ) -> Result<CommandOutput, RemoteError> {
        let port = self.port;
        let timeout = self.timeout;
        let host_owned = host.to_string();
        let credential = credential.clone();
        let command = command.clone();

        // libssh2 is blocking. The session timeout bounds the blocking thread,
        // the outer timeout bounds the caller.
        let work = tokio::task::spawn_blocking(move || {
            let session = ssh_connect(&host_owned, port, &credential, timeout)?;
            ssh_run_command(&session, &credential, &command)
        });

        match tokio::time::timeout(timeout, work).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(RemoteError::Join(e.to_string())),
            Err(_) => Err(RemoteError::Timeout {
                host: host.to_string(),
                secs: timeout.as_secs(),
            }),
        }
    }
}

/// Create an SSH session and authenticate with password + keyboard-interactive.
/// This is blocking, so call from a spawn_blocking context.
fn ssh_connect(
    host: &str,
    port: u16,
    credential: &Credential,
    timeout: Duration,
) -> Result<SessionGuard, RemoteError> {
    let connect_err = |reason: String| RemoteError::Connect {
        host: host.to_string(),
        reason,
    };

    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|e| connect_err(format!("Invalid address {}:{}: {}", host, port, e)))?
        .next()
        .ok_or_else(|| connect_err(format!("No address for {}:{}", host, port)))?;

    let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(|e| connect_err(e.to_string()))?;
    tcp.set_read_timeout(Some(timeout)).ok();
    tcp.set_write_timeout(Some(timeout)).ok();

    let handshake_err = |e: ssh2::Error| RemoteError::Handshake {
        host: host.to_string(),
        reason: e.to_string(),
    };

    let mut session = ssh2::Session::new().map_err(handshake_err)?;
    session.set_tcp_stream(tcp);
    session.set_timeout(u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));
    session.handshake().map_err(handshake_err)?;

    let session = SessionGuard {
        session,
        host: host.to_string(),
    };

    // Try password auth first
    match session.userauth_password(&credential.username, credential.secret()) {
        Ok(_) if session.authenticated() => return Ok(session),
        _ => {}
    }

    // Fall back to keyboard-interactive
    let mut prompter = PasswordPrompt {
        password: credential.secret().to_string(),
    };
    let _ = session.userauth_keyboard_interactive(&credential.username, &mut prompter);

    if session.authenticated() {
        Ok(session)
    } else {
        Err(RemoteError::Authentication {
            host: host.to_string(),
            user: credential.username.clone(),
        })
    }
}

/// Run a single command on an authenticated session.
/// Elevated commands get a pseudo-terminal and the secret written to stdin.
fn ssh_run_command(
    session: &SessionGuard,
    credential: &Credential,
    command: &RemoteCommand,
) -> Result<CommandOutput, RemoteError> {
    let channel_err = |what: &str, e: &dyn std::fmt::Display| RemoteError::Channel {
        host: session.host.clone(),
        reason: format!("{}: {}", what, e),
    };

    let mut channel = session
        .channel_session()
        .map_err(|e| channel_err("Failed to open channel", &e))?;

    if command.elevate {
        channel
            .request_pty("xterm", None, None)
            .map_err(|e| channel_err("Failed to allocate pty", &e))?;
    }

    let line = command.render();
    tracing::debug!("{}: exec {}", session.host, line);
    channel
        .exec(&line)
        .map_err(|e| channel_err("Failed to execute command", &e))?;

    if command.elevate {
        channel
            .write_all(elevation_input(credential.secret()).as_bytes())
            .and_then(|_| channel.flush())
            .map_err(|e| channel_err("Failed to send secret", &e))?;
    }

    let mut stdout = Vec::new();
    channel
        .read_to_end(&mut stdout)
        .map_err(|e| channel_err("Failed to read output", &e))?;

    let mut stderr = Vec::new();
    channel
        .stderr()
        .read_to_end(&mut stderr)
        .map_err(|e| channel_err("Failed to read error output", &e))?;

    channel
        .wait_close()
        .map_err(|e| channel_err("Failed to close channel", &e))?;
    let exit_status = channel
        .exit_status()
        .map_err(|e| channel_err("Failed to read exit status", &e))?;

    Ok(CommandOutput {
        stdout: credential.redact(&String::from_utf8_lossy(&stdout)),
        stderr: credential.redact(&String::from_utf8_lossy(&stderr)),
        exit_status,
    })
}
