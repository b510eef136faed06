//! Guest access over SSH.
//!
//! Readiness is a raw TCP probe that waits for the server's identification
//! banner; everything else shells out to the `ssh` binary.

use crate::config::SshSettings;
use crate::error::{Error, Result};
use std::io::Read;
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

/// How long a single readiness probe may block.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// `ssh -o ConnectTimeout`, in seconds.
const CONNECT_TIMEOUT_SECS: u32 = 5;

/// `ssh -o ServerAliveInterval`, in seconds.
const SERVER_ALIVE_SECS: u32 = 5;

/// Default bound on a shutdown request.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How often a bounded ssh call is polled.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Channel into a running guest.
pub trait GuestChannel: Send + Sync {
    /// Whether the guest answers with an SSH banner.
    fn probe(&self, ip: Ipv4Addr) -> bool;

    /// Run a command and return its stdout.
    fn run(&self, ip: Ipv4Addr, command: &str) -> Result<String>;

    /// Ask the guest to shut itself down.
    ///
    /// Returns once the request was delivered; the caller waits for the
    /// hypervisor to exit.
    fn shutdown(&self, ip: Ipv4Addr) -> Result<()>;

    /// Attach the terminal to a shell (or `command`) in the guest. Returns the exit code.
    fn interactive(&self, ip: Ipv4Addr, command: &[String]) -> Result<i32>;
}

/// [`GuestChannel`] backed by the system `ssh` client.
#[derive(Debug, Clone)]
pub struct SshChannel {
    user: String,
    port: u16,
    identity: Option<PathBuf>,
    shutdown_command: String,
    request_timeout: Duration,
}

impl SshChannel {
    /// Build a channel from the SSH settings, resolving the key against `home`.
    pub fn new(settings: &SshSettings, home: Option<&std::path::Path>) -> Self {
        Self {
            user: settings.user.clone(),
            port: settings.port,
            identity: settings.identity(home),
            shutdown_command: settings.shutdown_command.clone(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Bound how long a shutdown request may keep the ssh client alive.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// `ssh` with every option set; the remote command follows the destination.
    fn command(&self, ip: Ipv4Addr, tty: bool) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(["-o", "BatchMode=yes"])
            .args(["-o", "StrictHostKeyChecking=no"])
            .args(["-o", "UserKnownHostsFile=/dev/null"])
            .args(["-o", "LogLevel=ERROR"])
            .args(["-o", &format!("ConnectTimeout={}", CONNECT_TIMEOUT_SECS)])
            .args(["-o", &format!("ServerAliveInterval={}", SERVER_ALIVE_SECS)])
            .args(["-o", "ServerAliveCountMax=2"])
            .args(["-p", &self.port.to_string()]);
        if let Some(key) = &self.identity {
            cmd.arg("-i").arg(key);
        }
        if tty {
            cmd.arg("-t");
        }
        cmd.arg(format!("{}@{}", self.user, ip));
        cmd
    }
}

impl GuestChannel for SshChannel {
    fn probe(&self, ip: Ipv4Addr) -> bool {
        probe_banner(SocketAddr::from((ip, self.port)), PROBE_TIMEOUT)
    }

    fn run(&self, ip: Ipv4Addr, command: &str) -> Result<String> {
        let output = self
            .command(ip, false)
            .arg(command)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::command_failed("ssh", e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::command_failed(
                format!("ssh {}@{} {}", self.user, ip, command),
                format!("{}: {}", output.status, stderr.trim()),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn shutdown(&self, ip: Ipv4Addr) -> Result<()> {
        if !self.probe(ip) {
            return Err(Error::command_failed(
                format!("ssh {}@{}", self.user, ip),
                "guest is not answering on SSH",
            ));
        }
        tracing::debug!(ip = %ip, command = %self.shutdown_command, "requesting guest shutdown");

        // The connection usually drops mid-command, so the exit status says nothing.
        let mut cmd = self.command(ip, false);
        cmd.arg(&self.shutdown_command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        match status_within(&mut cmd, self.request_timeout)? {
            Some(status) => tracing::trace!(status = %status, "shutdown request finished"),
            None => tracing::warn!(
                ip = %ip,
                timeout = ?self.request_timeout,
                "shutdown request did not return, killed ssh"
            ),
        }
        Ok(())
    }

    fn interactive(&self, ip: Ipv4Addr, command: &[String]) -> Result<i32> {
        let mut cmd = self.command(ip, command.is_empty());
        cmd.args(command);
        let status = cmd
            .status()
            .map_err(|e| Error::command_failed("ssh", e.to_string()))?;
        Ok(status.code().unwrap_or(1))
    }
}

/// Run `cmd` to completion or until `timeout`, killing it on expiry.
///
/// `None` means the deadline passed.
fn status_within(cmd: &mut Command, timeout: Duration) -> Result<Option<ExitStatus>> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    let mut child = cmd
        .spawn()
        .map_err(|e| Error::command_failed(&program, e.to_string()))?;
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            break;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    if let Err(e) = child.kill() {
        tracing::debug!(program = %program, error = %e, "kill after timeout failed");
    }
    child.wait()?;
    Ok(None)
}

/// Connect to `addr` and check that the server greets with `SSH-`.
pub fn probe_banner(addr: SocketAddr, timeout: Duration) -> bool {
    let Ok(mut stream) = TcpStream::connect_timeout(&addr, timeout) else {
        return false;
    };
    if stream.set_read_timeout(Some(timeout)).is_err() {
        return false;
    }
    let mut banner = [0u8; 4];
    match stream.read_exact(&mut banner) {
        Ok(()) => &banner == b"SSH-",
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;

    fn serve_once(greeting: &'static [u8]) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            if let Ok((mut conn, _)) = listener.accept() {
                let _ = conn.write_all(greeting);
            }
        });
        addr
    }

    #[test]
    fn test_probe_accepts_ssh_banner() {
        let addr = serve_once(b"SSH-2.0-OpenSSH_9.6\r\n");
        assert!(probe_banner(addr, Duration::from_secs(2)));
    }

    #[test]
    fn test_probe_rejects_other_services() {
        let addr = serve_once(b"HTTP/1.1 400 Bad Request\r\n");
        assert!(!probe_banner(addr, Duration::from_secs(2)));
    }

    #[test]
    fn test_probe_refused_port() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(!probe_banner(addr, Duration::from_millis(200)));
    }

    #[test]
    fn test_command_arguments() {
        let settings = SshSettings {
            user: "ops".into(),
            key: Some(PathBuf::from("/keys/vm")),
            port: 2222,
            ..Default::default()
        };
        let channel = SshChannel::new(&settings, None);
        let cmd = channel.command(Ipv4Addr::new(172, 16, 0, 2), false);
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.windows(2).any(|w| w == ["-p", "2222"]));
        assert!(args.windows(2).any(|w| w == ["-i", "/keys/vm"]));
        assert!(args.contains(&"ConnectTimeout=5".to_string()));
        assert!(args.contains(&"ServerAliveInterval=5".to_string()));
        assert!(!args.contains(&"-t".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("ops@172.16.0.2"));
    }

    #[test]
    fn test_bounded_call_is_killed_at_deadline() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let started = Instant::now();
        let status = status_within(&mut cmd, Duration::from_millis(200)).unwrap();
        assert!(status.is_none());
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_bounded_call_returns_exit_status() {
        let mut cmd = Command::new("true");
        let status = status_within(&mut cmd, Duration::from_secs(5)).unwrap();
        assert!(status.map_or(false, |s| s.success()));
    }
}
