//! tmux adapter. All operations shell out to the tmux binary with
//! argv-vector arguments (never interpolated strings), target sessions by
//! exact name using tmux's `=name` match syntax, and run under a hard
//! wall-clock timeout so a hung tmux server cannot stall connection tasks.

use std::path::Path;
use std::process::Output;
use std::time::Duration;

use tokio::process::Command;

/// Wall-clock cap for one tmux invocation.
const MUX_TIMEOUT: Duration = Duration::from_secs(3);

/// Scrollback lines returned by `capture`.
const CAPTURE_LINES: u32 = 1000;

#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("session not found")]
    Absent,
    #[error("tmux call timed out")]
    Timeout,
    #[error("tmux failed: {0}")]
    Failed(String),
}

/// Exact-name target: `=name` forbids tmux's default prefix matching, so
/// `webmux-abc` can never resolve to `webmux-abc-other`.
fn exact(name: &str) -> String {
    format!("={name}")
}

/// Arguments for session creation. Configuration sub-commands (status bar
/// off, mouse off) are coalesced into the same invocation with `;`
/// separators so creation is one round trip.
fn create_args(name: &str, cols: u16, rows: u16, cwd: &Path) -> Vec<String> {
    vec![
        "new-session".into(),
        "-d".into(),
        "-s".into(),
        name.into(),
        "-x".into(),
        cols.to_string(),
        "-y".into(),
        rows.to_string(),
        "-c".into(),
        cwd.to_string_lossy().into_owned(),
        ";".into(),
        "set-option".into(),
        "-t".into(),
        exact(name),
        "status".into(),
        "off".into(),
        ";".into(),
        "set-option".into(),
        "-t".into(),
        exact(name),
        "mouse".into(),
        "off".into(),
    ]
}

/// One tmux session as seen by `list_all_with_activity`.
#[derive(Debug, Clone)]
pub struct MuxSession {
    pub name: String,
    /// Unix seconds of session creation (tmux `session_created`).
    pub created: i64,
    /// Unix seconds of the session's last activity (tmux `session_activity`).
    pub activity: i64,
}

/// Adapter over the external tmux binary. Stateless; cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct MuxAdapter;

impl MuxAdapter {
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, args: &[String]) -> Result<Output, MuxError> {
        let fut = Command::new("tmux").args(args).kill_on_drop(true).output();
        let output = tokio::time::timeout(MUX_TIMEOUT, fut)
            .await
            .map_err(|_| MuxError::Timeout)?
            .map_err(|e| MuxError::Failed(e.to_string()))?;
        Ok(output)
    }

    /// Run and require a zero exit status; non-zero maps to `Absent` when
    /// tmux reports a missing session or server, `Failed` otherwise.
    async fn run_ok(&self, args: &[String]) -> Result<Output, MuxError> {
        let output = self.run(args).await?;
        if output.status.success() {
            return Ok(output);
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("can't find session")
            || stderr.contains("no server running")
            || stderr.contains("no current session")
        {
            return Err(MuxError::Absent);
        }
        Err(MuxError::Failed(stderr))
    }

    /// tmux version string; the startup availability probe. A failure here
    /// is fatal before the gateway accepts any traffic.
    pub async fn server_version(&self) -> Result<String, MuxError> {
        let args = vec!["-V".to_string()];
        let output = self.run_ok(&args).await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub async fn has(&self, name: &str) -> Result<bool, MuxError> {
        let args = vec!["has-session".into(), "-t".into(), exact(name)];
        let output = self.run(&args).await?;
        Ok(output.status.success())
    }

    /// Create a detached session sized `cols`x`rows` rooted at `cwd`, with
    /// the status bar and mouse modes disabled.
    pub async fn create(
        &self,
        name: &str,
        cols: u16,
        rows: u16,
        cwd: &Path,
    ) -> Result<(), MuxError> {
        self.run_ok(&create_args(name, cols, rows, cwd)).await?;
        Ok(())
    }

    /// Re-apply session configuration (status bar and mouse off) on an
    /// existing session, e.g. one created by an earlier server run or by
    /// hand. One invocation, coalesced like `create`.
    pub async fn configure(&self, name: &str) -> Result<(), MuxError> {
        let args = vec![
            "set-option".into(),
            "-t".into(),
            exact(name),
            "status".into(),
            "off".into(),
            ";".into(),
            "set-option".into(),
            "-t".into(),
            exact(name),
            "mouse".into(),
            "off".into(),
        ];
        self.run_ok(&args).await?;
        Ok(())
    }

    /// Resize the session's window. Idempotent; tmux treats an unchanged
    /// size as a no-op.
    pub async fn resize(&self, name: &str, cols: u16, rows: u16) -> Result<(), MuxError> {
        let args = vec![
            "resize-window".into(),
            "-t".into(),
            exact(name),
            "-x".into(),
            cols.to_string(),
            "-y".into(),
            rows.to_string(),
        ];
        self.run_ok(&args).await?;
        Ok(())
    }

    /// Last `CAPTURE_LINES` lines of the session's scroll buffer, escape
    /// sequences preserved.
    pub async fn capture(&self, name: &str) -> Result<Vec<u8>, MuxError> {
        let args = vec![
            "capture-pane".into(),
            "-p".into(),
            "-e".into(),
            "-S".into(),
            format!("-{CAPTURE_LINES}"),
            "-t".into(),
            exact(name),
        ];
        let output = self.run_ok(&args).await?;
        Ok(output.stdout)
    }

    /// Absolute path of the session's current working directory.
    pub async fn get_cwd(&self, name: &str) -> Result<std::path::PathBuf, MuxError> {
        let args = vec![
            "display-message".into(),
            "-p".into(),
            "-t".into(),
            exact(name),
            "#{pane_current_path}".into(),
        ];
        let output = self.run_ok(&args).await?;
        let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if path.is_empty() {
            return Err(MuxError::Failed("empty pane_current_path".into()));
        }
        Ok(std::path::PathBuf::from(path))
    }

    /// Kill a session. Idempotent: a missing session is success.
    pub async fn kill(&self, name: &str) -> Result<(), MuxError> {
        let args = vec!["kill-session".into(), "-t".into(), exact(name)];
        match self.run_ok(&args).await {
            Ok(_) | Err(MuxError::Absent) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// All session names the tmux server knows. An absent server means no
    /// sessions.
    pub async fn list_all(&self) -> Result<Vec<String>, MuxError> {
        let args = vec![
            "list-sessions".into(),
            "-F".into(),
            "#{session_name}".into(),
        ];
        match self.run_ok(&args).await {
            Ok(output) => Ok(String::from_utf8_lossy(&output.stdout)
                .lines()
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()),
            Err(MuxError::Absent) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Session names with creation and last-activity timestamps, for the
    /// stale-session reaper and the session-list endpoint.
    pub async fn list_all_with_activity(&self) -> Result<Vec<MuxSession>, MuxError> {
        let args = vec![
            "list-sessions".into(),
            "-F".into(),
            "#{session_name} #{session_created} #{session_activity}".into(),
        ];
        match self.run_ok(&args).await {
            Ok(output) => Ok(String::from_utf8_lossy(&output.stdout)
                .lines()
                .filter_map(parse_activity_line)
                .collect()),
            Err(MuxError::Absent) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}

fn parse_activity_line(line: &str) -> Option<MuxSession> {
    let (rest, activity) = line.rsplit_once(' ')?;
    let (name, created) = rest.rsplit_once(' ')?;
    if name.is_empty() {
        return None;
    }
    Some(MuxSession {
        name: name.to_string(),
        created: created.parse().ok()?,
        activity: activity.parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_target_forbids_prefix_match() {
        assert_eq!(exact("webmux-abc"), "=webmux-abc");
    }

    #[test]
    fn create_coalesces_configuration() {
        let args = create_args("webmux-x", 120, 40, Path::new("/home/u"));
        assert_eq!(args[0], "new-session");
        assert!(args.contains(&"-d".to_string()));
        assert!(args.contains(&"120".to_string()));
        assert!(args.contains(&"40".to_string()));
        assert!(args.contains(&"/home/u".to_string()));
        // One invocation, two trailing set-option groups.
        assert_eq!(args.iter().filter(|a| *a == ";").count(), 2);
        assert!(args.contains(&"status".to_string()));
        assert!(args.contains(&"mouse".to_string()));
    }

    #[test]
    fn activity_lines_parse() {
        let s = parse_activity_line("webmux-abc-dev 1712340000 1712345678").unwrap();
        assert_eq!(s.name, "webmux-abc-dev");
        assert_eq!(s.created, 1712340000);
        assert_eq!(s.activity, 1712345678);

        // Session names may contain spaces only if the server allowed them;
        // the timestamps are always the last two fields.
        let s = parse_activity_line("odd name 11 99").unwrap();
        assert_eq!(s.name, "odd name");
        assert_eq!(s.created, 11);
        assert_eq!(s.activity, 99);

        assert!(parse_activity_line("").is_none());
        assert!(parse_activity_line("nospace").is_none());
        assert!(parse_activity_line("name 12").is_none());
        assert!(parse_activity_line("name notanum 12").is_none());
    }
}
