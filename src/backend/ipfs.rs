use super::{run, run_stdout, Backend, BackendError, BackendResult};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const DEFAULT_WARM_UP: Duration = Duration::from_secs(5);

/// Drives a local `ipfs` installation through its CLI
pub struct IpfsBackend {
    program: String,
    warm_up: Duration,
    daemon: Mutex<Option<Child>>,
}

impl Default for IpfsBackend {
    fn default() -> Self {
        Self::new("ipfs")
    }
}

impl IpfsBackend {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            warm_up: DEFAULT_WARM_UP,
            daemon: Mutex::new(None),
        }
    }

    /// How long to wait after spawning the daemon before using it
    pub fn with_warm_up(mut self, warm_up: Duration) -> Self {
        self.warm_up = warm_up;
        self
    }

    fn process_name(&self) -> &str {
        Path::new(&self.program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.program)
    }
}

/// `added <hash> <name>` -> `<hash>`
pub fn parse_add_output(output: &str) -> Option<String> {
    let cleaned = output.trim().replace('"', "");
    let tokens: Vec<&str> = cleaned.split_whitespace().collect();
    if tokens.len() < 2 {
        return None;
    }
    Some(tokens[tokens.len() - 2].to_string())
}

fn parse_id_output(output: &str) -> Option<String> {
    let id = output.replace('"', "");
    let id = id.trim();
    (!id.is_empty()).then(|| id.to_string())
}

fn parse_pid(output: &str) -> Option<u32> {
    output.lines().find_map(|line| line.trim().parse().ok())
}

#[async_trait::async_trait]
impl Backend for IpfsBackend {
    fn name(&self) -> &'static str {
        "ipfs"
    }

    fn is_daemon(&self) -> bool {
        true
    }

    async fn start_daemon(&self, log_dir: &Path) -> BackendResult<()> {
        let log_path = log_dir.join(format!(
            "daemon_{}.log",
            chrono::Utc::now().timestamp_millis()
        ));
        let log_file = std::fs::File::create(&log_path)?;
        let stderr = log_file.try_clone()?;

        let mut child = Command::new(&self.program)
            .arg("daemon")
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()?;
        info!(
            "Started {} daemon (pid {:?}), logging to {}",
            self.program,
            child.id(),
            log_path.display()
        );

        tokio::time::sleep(self.warm_up).await;
        if let Some(status) = child.try_wait()? {
            return Err(BackendError::CommandFailed {
                command: format!("{} daemon", self.program),
                status: status.to_string(),
            });
        }
        *self.daemon.lock().await = Some(child);
        Ok(())
    }

    async fn stop_daemon(&self) -> BackendResult<()> {
        match self.daemon.lock().await.take() {
            Some(mut child) => {
                info!("Stopping {} daemon (pid {:?})", self.program, child.id());
                child.kill().await?;
            }
            None => debug!("No owned {} daemon to stop", self.program),
        }
        Ok(())
    }

    async fn running_process(&self) -> Option<u32> {
        {
            let mut daemon = self.daemon.lock().await;
            if let Some(child) = daemon.as_mut() {
                if matches!(child.try_wait(), Ok(None)) {
                    return child.id();
                }
            }
        }
        match run_stdout("pgrep", &["-x", self.process_name()]).await {
            Ok(out) => parse_pid(&out),
            Err(e) => {
                debug!("No running {} process: {}", self.process_name(), e);
                None
            }
        }
    }

    async fn own_address(&self) -> BackendResult<String> {
        let out = run_stdout(&self.program, &["id", "-f=\"<id>\""]).await?;
        parse_id_output(&out).ok_or_else(|| BackendError::UnexpectedOutput {
            command: format!("{} id", self.program),
            output: out,
        })
    }

    async fn connect(&self, address: &str) -> BackendResult<()> {
        run(&self.program, &["swarm", "connect", address]).await?;
        Ok(())
    }

    async fn publish(&self, path: &Path) -> BackendResult<String> {
        let path = path.to_string_lossy();
        let out = run_stdout(&self.program, &["add", path.as_ref()]).await?;
        parse_add_output(&out).ok_or_else(|| BackendError::UnexpectedOutput {
            command: format!("{} add {}", self.program, path),
            output: out,
        })
    }

    async fn pre_publish(&self) -> BackendResult<()> {
        Ok(())
    }

    async fn fetch(&self, hash: &str, output_dir: &Path) -> BackendResult<()> {
        tokio::fs::create_dir_all(output_dir).await?;
        let target = format!("/ipfs/{}", hash);
        let output_dir = output_dir.to_string_lossy();
        run(&self.program, &["get", target.as_str(), "-o", output_dir.as_ref()]).await?;
        Ok(())
    }

    async fn set_log_level(&self) -> BackendResult<()> {
        run(&self.program, &["log", "level", "all", "debug"]).await?;
        run(&self.program, &["log", "level", "dht", "warning"]).await?;
        Ok(())
    }

    async fn peers(&self) -> BackendResult<Vec<String>> {
        let out = run_stdout(&self.program, &["swarm", "peers"]).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}

impl Drop for IpfsBackend {
    fn drop(&mut self) {
        if let Ok(daemon) = self.daemon.try_lock() {
            if daemon.is_some() {
                warn!("{} daemon still owned at shutdown, killing it", self.program);
            }
        }
    }
}
