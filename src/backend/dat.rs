use super::{describe, run, Backend, BackendError, BackendResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info};

const SHARE_LINK_PREFIX: &str = "Share Link: ";

/// Drives the `dat` CLI. There is no daemon: each published directory is shared by its
/// own child process until the next `pre_publish`.
pub struct DatBackend {
    program: String,
    /// Arguments placed before the per-call arguments
    base_args: Vec<String>,
    sharing: Mutex<HashMap<PathBuf, Child>>,
}

impl Default for DatBackend {
    fn default() -> Self {
        Self::new("dat", Vec::new())
    }
}

impl DatBackend {
    pub fn new(program: impl Into<String>, base_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            base_args,
            sharing: Mutex::new(HashMap::new()),
        }
    }

    fn args<'a>(&'a self, extra: &[&'a str]) -> Vec<&'a str> {
        self.base_args
            .iter()
            .map(String::as_str)
            .chain(extra.iter().copied())
            .collect()
    }

    /// Number of directories currently being shared
    pub fn sharing_count(&self) -> usize {
        self.sharing.lock().len()
    }
}

/// Extract the key from a `Share Link: <key>` line
pub fn parse_share_link(line: &str) -> Option<String> {
    let rest = line.trim().strip_prefix(SHARE_LINK_PREFIX)?;
    let key: String = rest
        .chars()
        .take_while(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        .collect();
    (!key.is_empty()).then_some(key)
}

#[async_trait::async_trait]
impl Backend for DatBackend {
    fn name(&self) -> &'static str {
        "dat"
    }

    fn is_daemon(&self) -> bool {
        false
    }

    async fn start_daemon(&self, _log_dir: &Path) -> BackendResult<()> {
        Ok(())
    }

    async fn stop_daemon(&self) -> BackendResult<()> {
        Ok(())
    }

    async fn running_process(&self) -> Option<u32> {
        None
    }

    async fn own_address(&self) -> BackendResult<String> {
        Ok(String::new())
    }

    async fn connect(&self, _address: &str) -> BackendResult<()> {
        Ok(())
    }

    async fn publish(&self, path: &Path) -> BackendResult<String> {
        let dir = path.parent().unwrap_or(path);
        let dir_arg = dir.to_string_lossy();
        let args = self.args(&[dir_arg.as_ref()]);
        let command = describe(&self.program, &args);

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let stdout = child.stdout.take().ok_or_else(|| BackendError::UnexpectedOutput {
            command: command.clone(),
            output: "no stdout".to_string(),
        })?;

        let mut lines = BufReader::new(stdout).lines();
        let mut seen = Vec::new();
        while let Some(line) = lines.next_line().await? {
            if let Some(key) = parse_share_link(&line) {
                info!("Sharing {} as {}", dir.display(), key);
                // The child keeps sharing; it must be able to write past the link line
                tokio::spawn(async move { while let Ok(Some(_)) = lines.next_line().await {} });
                self.sharing.lock().insert(path.to_path_buf(), child);
                return Ok(key);
            }
            seen.push(line);
        }

        // Sharing process ended without announcing a link
        if let Err(e) = child.start_kill() {
            debug!("Sharing process for {} already ended: {}", dir.display(), e);
        }
        Err(BackendError::UnexpectedOutput {
            command,
            output: seen.join("\n"),
        })
    }

    async fn pre_publish(&self) -> BackendResult<()> {
        let children: Vec<(PathBuf, Child)> = self.sharing.lock().drain().collect();
        for (path, mut child) in children {
            debug!("Stopping share of {}", path.display());
            if let Err(e) = child.kill().await {
                debug!("Share of {} already ended: {}", path.display(), e);
            }
        }
        Ok(())
    }

    async fn fetch(&self, hash: &str, output_dir: &Path) -> BackendResult<()> {
        tokio::fs::create_dir_all(output_dir).await?;
        let output_dir = output_dir.to_string_lossy();
        let args = self.args(&[hash, output_dir.as_ref(), "--exit"]);
        run(&self.program, &args).await?;
        Ok(())
    }

    async fn set_log_level(&self) -> BackendResult<()> {
        Ok(())
    }

    async fn peers(&self) -> BackendResult<Vec<String>> {
        Ok(Vec::new())
    }
}
