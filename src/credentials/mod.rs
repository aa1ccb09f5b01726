use anyhow::{Context, Result};
use nix::sys::termios::{self, LocalFlags, SetArg};
use nix::unistd::{getuid, User};
use std::fmt;
use std::io::{self, BufRead, Write};

/// Credential is the single username/secret pair used for every node.
/// The secret only lives in memory for the duration of the run.
#[derive(Clone)]
pub struct Credential {
    pub username: String,
    secret: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Replace every occurrence of the secret in captured remote output
    pub fn redact(&self, text: &str) -> String {
        if self.secret.is_empty() {
            return text.to_string();
        }
        text.replace(&self.secret, "********")
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("secret", &"********")
            .finish()
    }
}

/// Username of the invoking user: password database entry for the real
/// uid, falling back to $USER
pub fn current_username() -> Result<String> {
    if let Ok(Some(user)) = User::from_uid(getuid()) {
        return Ok(user.name);
    }
    std::env::var("USER").context("Could not determine the invoking user")
}

/// Prompt for the sudo secret on the terminal with echo disabled.
/// When stdin is not a terminal the line is read as-is.
pub fn prompt_secret(prompt: &str) -> Result<String> {
    let stdin = io::stdin();
    let mut stderr = io::stderr();
    write!(stderr, "{}", prompt)?;
    stderr.flush()?;

    let original = termios::tcgetattr(&stdin).ok();
    if let Some(ref original) = original {
        let mut silent = original.clone();
        silent.local_flags.remove(LocalFlags::ECHO);
        silent.local_flags.insert(LocalFlags::ECHONL);
        termios::tcsetattr(&stdin, SetArg::TCSANOW, &silent)
            .context("Failed to disable terminal echo")?;
    }

    let mut line = String::new();
    let read = stdin.lock().read_line(&mut line);

    // Restore echo before looking at the read result
    if let Some(ref original) = original {
        if let Err(e) = termios::tcsetattr(&stdin, SetArg::TCSANOW, original) {
            tracing::warn!("Failed to restore terminal echo: {}", e);
        }
    }

    read.context("Failed to read secret")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}
