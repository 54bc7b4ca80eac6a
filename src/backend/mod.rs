pub mod dat;
pub mod ipfs;
pub mod resource;

pub use dat::DatBackend;
pub use ipfs::IpfsBackend;
pub use resource::{generate_file, OneShotResourceCreator};

use std::net::IpAddr;
use std::path::Path;
use std::process::Output;
use thiserror::Error;
use tokio::process::Command;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Command `{command}` failed: {status}")]
    CommandFailed { command: String, status: String },
    #[error("Unexpected output from `{command}`: {output}")]
    UnexpectedOutput { command: String, output: String },
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Capabilities of a content distribution system under test
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the backend needs a long-running daemon
    fn is_daemon(&self) -> bool;

    async fn start_daemon(&self, log_dir: &Path) -> BackendResult<()>;

    async fn stop_daemon(&self) -> BackendResult<()>;

    /// Pid of a running daemon, whether we own it or not
    async fn running_process(&self) -> Option<u32>;

    /// Token other peers use to reach this node
    async fn own_address(&self) -> BackendResult<String>;

    async fn connect(&self, address: &str) -> BackendResult<()>;

    /// Make `path` available and return its content hash
    async fn publish(&self, path: &Path) -> BackendResult<String>;

    /// Called before every batch of publishes
    async fn pre_publish(&self) -> BackendResult<()>;

    async fn fetch(&self, hash: &str, output_dir: &Path) -> BackendResult<()>;

    async fn set_log_level(&self) -> BackendResult<()>;

    async fn peers(&self) -> BackendResult<Vec<String>>;
}

/// Turns a peer's advertised token into something `Backend::connect` accepts
pub trait AddressBuilder: Send + Sync {
    fn build_connect_address(&self, own_ip: IpAddr, token: &str) -> String;
}

/// `/ip4|ip6/<ip>/tcp/4001/ipfs/<token>`
#[derive(Debug, Clone, Copy, Default)]
pub struct MultiaddrBuilder;

impl AddressBuilder for MultiaddrBuilder {
    fn build_connect_address(&self, own_ip: IpAddr, token: &str) -> String {
        let family = if own_ip.is_ipv4() { "ip4" } else { "ip6" };
        format!("/{}/{}/tcp/4001/ipfs/{}", family, own_ip, token)
    }
}

/// Uses the token as is
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThroughBuilder;

impl AddressBuilder for PassThroughBuilder {
    fn build_connect_address(&self, _own_ip: IpAddr, token: &str) -> String {
        token.to_string()
    }
}

pub(crate) fn describe(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Run a command to completion, failing on a non-zero exit status
pub(crate) async fn run(program: &str, args: &[&str]) -> BackendResult<Output> {
    let command = describe(program, args);
    tracing::debug!("Running `{}`", command);
    let output = Command::new(program).args(args).output().await?;
    if !output.status.success() {
        return Err(BackendError::CommandFailed {
            command,
            status: output.status.to_string(),
        });
    }
    Ok(output)
}

/// Run a command and return its stdout as text
pub(crate) async fn run_stdout(program: &str, args: &[&str]) -> BackendResult<String> {
    let output = run(program, args).await?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
