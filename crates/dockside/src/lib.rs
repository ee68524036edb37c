//! Minimal Docker CLI wrapper for tests.
//!
//! Shells out to the `docker` binary; the container is force-removed when the
//! [`Container`] is dropped.
//!
//! ```ignore
//! use dockside::{Container, containers};
//! use std::time::Duration;
//!
//! let container = Container::run(containers::postgres("16-alpine", "test"))?;
//! container.wait_for_log("database system is ready to accept connections", Duration::from_secs(30))?;
//! let port = container.wait_for_port(5432, Duration::from_secs(10))?;
//! ```

use std::fmt;
use std::net::{SocketAddr, TcpStream};
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug)]
pub enum Error {
    /// The docker binary could not be spawned.
    Spawn(std::io::Error),
    /// A docker command exited unsuccessfully.
    Command { args: String, stderr: String },
    /// A wait ran out of time.
    Timeout(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Spawn(e) => write!(f, "failed to run docker: {e}"),
            Error::Command { args, stderr } => {
                write!(f, "`docker {args}` failed: {}", stderr.trim())
            }
            Error::Timeout(what) => write!(f, "timed out waiting for {what}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Spawn(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub env: Vec<(String, String)>,
    /// Container ports to publish on a random loopback port.
    pub ports: Vec<u16>,
}

impl ContainerSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            env: Vec::new(),
            ports: Vec::new(),
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.ports.push(port);
        self
    }

    fn run_args(&self) -> Vec<String> {
        let mut args = vec!["run".to_string(), "-d".to_string()];
        for (key, value) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        for port in &self.ports {
            args.push("-p".to_string());
            args.push(format!("127.0.0.1::{port}"));
        }
        args.push(self.image.clone());
        args
    }
}

/// Ready-made specs.
pub mod containers {
    use super::ContainerSpec;

    /// `postgres:<tag>` with the given superuser password, port 5432 published.
    pub fn postgres(tag: &str, password: &str) -> ContainerSpec {
        ContainerSpec::new(format!("postgres:{tag}"))
            .env("POSTGRES_PASSWORD", password)
            .port(5432)
    }
}

/// Whether a docker daemon is reachable.
pub fn is_available() -> bool {
    Command::new("docker")
        .arg("info")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// A running container, removed on drop.
#[derive(Debug)]
pub struct Container {
    id: String,
}

impl Container {
    /// Start a detached container.
    pub fn run(spec: ContainerSpec) -> Result<Self> {
        let output = docker(&spec.run_args())?;
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(Self { id })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Combined stdout and stderr of the container so far.
    pub fn logs(&self) -> Result<String> {
        let output = docker(&["logs".to_string(), self.id.clone()])?;
        let mut logs = String::from_utf8_lossy(&output.stdout).into_owned();
        logs.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(logs)
    }

    /// Block until `needle` shows up in the logs.
    pub fn wait_for_log(&self, needle: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.logs()?.contains(needle) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!("log line {needle:?}")));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Host port that `container_port` is published on, without waiting.
    pub fn host_port(&self, container_port: u16) -> Result<u16> {
        let output = docker(&[
            "port".to_string(),
            self.id.clone(),
            format!("{container_port}/tcp"),
        ])?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_port_output(&stdout).ok_or_else(|| Error::Command {
            args: format!("port {} {container_port}/tcp", self.id),
            stderr: format!("unexpected output: {stdout}"),
        })
    }

    /// Block until the published port accepts TCP connections; returns the host port.
    pub fn wait_for_port(&self, container_port: u16, timeout: Duration) -> Result<u16> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(port) = self.host_port(container_port) {
                let addr = SocketAddr::from(([127, 0, 0, 1], port));
                if TcpStream::connect_timeout(&addr, POLL_INTERVAL).is_ok() {
                    return Ok(port);
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!("port {container_port}")));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        let _ = Command::new("docker")
            .args(["rm", "-f", "-v", &self.id])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
}

fn docker(args: &[String]) -> Result<Output> {
    let output = Command::new("docker")
        .args(args)
        .output()
        .map_err(Error::Spawn)?;
    if !output.status.success() {
        return Err(Error::Command {
            args: args.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(output)
}

/// `docker port` prints one `host:port` mapping per line, e.g. `127.0.0.1:49153`.
fn parse_port_output(output: &str) -> Option<u16> {
    output
        .lines()
        .filter_map(|line| line.trim().rsplit_once(':'))
        .find_map(|(_, port)| port.parse().ok())
}
