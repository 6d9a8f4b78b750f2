//! PTY session management
//!
//! One pseudo-terminal and shell process per relay session, via portable-pty.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize, PtySystem};

use tr_protocol::{SessionId, TerminalSize};

/// Shell names accepted when they live in one of [`SHELL_DIRS`]
const KNOWN_SHELLS: &[&str] = &["sh", "bash", "zsh", "fish", "dash", "ksh", "tcsh", "csh"];

const SHELL_DIRS: &[&str] = &[
    "/bin",
    "/usr/bin",
    "/usr/local/bin",
    "/opt/homebrew/bin",
];

const WINDOWS_SHELLS: &[&str] = &["cmd.exe", "powershell.exe", "pwsh.exe"];

/// Check a shell path against the allow-list.
///
/// Unix shells must be a known shell in a standard directory, or be listed
/// in `/etc/shells`, and must exist on disk.
pub fn validate_shell(shell: &str) -> Result<String> {
    if cfg!(windows) {
        let name = shell.rsplit(['\\', '/']).next().unwrap_or(shell).to_lowercase();
        if WINDOWS_SHELLS.contains(&name.as_str()) {
            return Ok(shell.to_string());
        }
        anyhow::bail!("Shell '{}' is not allowed", shell);
    }

    let path = Path::new(shell);
    if !path.is_absolute() {
        anyhow::bail!("Shell '{}' must be an absolute path", shell);
    }

    let in_standard_dir = match (path.parent(), path.file_name().and_then(|n| n.to_str())) {
        (Some(dir), Some(name)) => {
            KNOWN_SHELLS.contains(&name) && SHELL_DIRS.iter().any(|d| Path::new(d) == dir)
        }
        _ => false,
    };

    if !in_standard_dir && !listed_in_etc_shells(shell) {
        anyhow::bail!(
            "Shell '{}' is not allowed. Known shells: {:?} under {:?}, or any entry of /etc/shells",
            shell,
            KNOWN_SHELLS,
            SHELL_DIRS
        );
    }

    if !path.exists() {
        anyhow::bail!("Shell '{}' does not exist", shell);
    }

    Ok(shell.to_string())
}

fn listed_in_etc_shells(shell: &str) -> bool {
    std::fs::read_to_string("/etc/shells")
        .map(|shells| {
            shells
                .lines()
                .map(str::trim)
                .any(|line| !line.starts_with('#') && line == shell)
        })
        .unwrap_or(false)
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// A live shell attached to a PTY
struct PtySession {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    writer: Box<dyn Write + Send>,
}

/// Manages PTY sessions on the local machine
pub struct PtyManager {
    pty_system: Box<dyn PtySystem + Send>,
    sessions: HashMap<SessionId, PtySession>,
    default_shell: Option<String>,
    default_env: Vec<(String, String)>,
}

impl PtyManager {
    /// Create a manager with the given shell and environment defaults
    pub fn new(default_shell: Option<String>, default_env: Vec<(String, String)>) -> Self {
        Self {
            pty_system: native_pty_system(),
            sessions: HashMap::new(),
            default_shell,
            default_env,
        }
    }

    /// Shell to spawn: configured default, then `$SHELL`, then the platform shell
    pub fn resolve_shell(&self) -> String {
        self.default_shell
            .clone()
            .or_else(|| std::env::var("SHELL").ok())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| {
                if cfg!(windows) {
                    "cmd.exe".to_string()
                } else {
                    "/bin/sh".to_string()
                }
            })
    }

    /// Spawn a shell for a session.
    ///
    /// Returns the reader for the PTY's output, which the caller drains on a
    /// blocking thread.
    pub fn spawn(
        &mut self,
        session_id: SessionId,
        size: TerminalSize,
    ) -> Result<Box<dyn Read + Send>> {
        if self.sessions.contains_key(&session_id) {
            anyhow::bail!("Session {} already has a shell", session_id);
        }

        let requested = self.resolve_shell();
        let shell = validate_shell(&requested)
            .with_context(|| format!("Invalid shell requested: {}", requested))?;

        tracing::info!(
            "Spawning {} for session {} at {}x{}",
            shell,
            session_id,
            size.cols,
            size.rows
        );

        let pair = self
            .pty_system
            .openpty(pty_size(size))
            .context("Failed to open PTY")?;

        let mut cmd = CommandBuilder::new(&shell);
        for (key, value) in &self.default_env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("Failed to spawn shell: {}", shell))?;
        // Only the child keeps the slave side open, so EOF on the reader
        // tracks the shell's exit.
        drop(pair.slave);

        tracing::debug!("Shell for session {} has pid {:?}", session_id, child.process_id());

        let reader = pair
            .master
            .try_clone_reader()
            .context("Failed to clone PTY reader")?;
        let writer = pair.master.take_writer().context("Failed to take PTY writer")?;

        self.sessions.insert(
            session_id,
            PtySession {
                master: pair.master,
                child,
                writer,
            },
        );

        Ok(reader)
    }

    /// Write operator input to a session's PTY
    pub fn write(&mut self, session_id: &SessionId, data: &[u8]) -> Result<()> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| anyhow::anyhow!("Session not found: {}", session_id))?;

        session.writer.write_all(data).context("Failed to write to PTY")?;
        session.writer.flush().context("Failed to flush PTY")?;
        Ok(())
    }

    /// Resize a session's PTY
    pub fn resize(&mut self, session_id: &SessionId, size: TerminalSize) -> Result<()> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| anyhow::anyhow!("Session not found: {}", session_id))?;

        tracing::debug!("Resizing session {} to {}x{}", session_id, size.cols, size.rows);
        session
            .master
            .resize(pty_size(size))
            .context("Failed to resize PTY")?;
        Ok(())
    }

    /// Kill a session's shell and forget it.
    ///
    /// Returns the exit code, or `None` if the session was unknown.
    pub fn close(&mut self, session_id: &SessionId) -> Option<u32> {
        let mut session = self.sessions.remove(session_id)?;
        tracing::info!("Closing PTY session {}", session_id);

        if let Err(e) = session.child.kill() {
            tracing::debug!("Kill for session {} failed: {}", session_id, e);
        }
        session.child.wait().ok().map(|status| status.exit_code())
    }

    /// Whether a session has a live shell
    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// All session ids
    pub fn list_sessions(&self) -> Vec<SessionId> {
        self.sessions.keys().cloned().collect()
    }

    /// Kill every shell
    pub fn close_all(&mut self) -> usize {
        let ids = self.list_sessions();
        for id in &ids {
            self.close(id);
        }
        ids.len()
    }

    /// Number of active sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for PtyManager {
    fn default() -> Self {
        Self::new(
            None,
            vec![("TERM".to_string(), "xterm-256color".to_string())],
        )
    }
}
