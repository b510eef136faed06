//! Hypervisor process supervision.
//!
//! The supervisor launches one hypervisor process per VM, records its PID
//! before doing anything else, waits for the guest to answer on SSH and stops
//! it with an escalating sequence: guest shutdown, SIGTERM, SIGKILL.

pub mod ssh;

use crate::config::{HypervisorSettings, Timeouts};
use crate::error::{Error, Result};
use crate::hypervisor;
use crate::state::{self, StateStore, VmRecord};
use std::fs::OpenOptions;
use std::net::Ipv4Addr;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub use ssh::{GuestChannel, SshChannel};

/// Poll interval while waiting for a process to exit.
const EXIT_POLL: Duration = Duration::from_millis(100);

/// Check whether a process exists.
///
/// An exited child of this process is reaped first, so a zombie does not
/// read as alive.
pub fn is_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }

    let mut status: libc::c_int = 0;
    if unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) } == pid {
        return false;
    }

    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    // EPERM: the process exists but belongs to someone else.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Send a signal, ignoring processes that are already gone.
fn signal(pid: u32, sig: libc::c_int) {
    if let Ok(pid) = libc::pid_t::try_from(pid) {
        unsafe {
            libc::kill(pid, sig);
        }
    }
}

/// Poll until the process is gone or `timeout` elapses. Returns whether it exited.
pub fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let start = Instant::now();
    loop {
        if !is_alive(pid) {
            return true;
        }
        if start.elapsed() >= timeout {
            return false;
        }
        std::thread::sleep(EXIT_POLL.min(timeout));
    }
}

/// What a recorded PID currently refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidState {
    /// No such process.
    Dead,
    /// A hypervisor process.
    Hypervisor,
    /// Some other program reusing the PID.
    Foreign,
    /// Alive, but its command line could not be read.
    Unknown,
}

/// Classify `pid` against the hypervisor program name.
pub fn probe_pid(pid: u32, program: &str) -> PidState {
    if !is_alive(pid) {
        return PidState::Dead;
    }
    match read_cmdline(pid) {
        Some(argv) if !argv.is_empty() => {
            if program_matches(&argv[0], program) {
                PidState::Hypervisor
            } else {
                PidState::Foreign
            }
        }
        _ => PidState::Unknown,
    }
}

/// A running hypervisor found in the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HypervisorProcess {
    /// Process id.
    pub pid: u32,
    /// `--api-sock` argument.
    pub api_socket: Option<PathBuf>,
}

/// Scan `/proc` for processes running `program`.
pub fn list_hypervisor_processes(program: &str) -> Result<Vec<HypervisorProcess>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir("/proc")? {
        let Ok(entry) = entry else { continue };
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let Some(argv) = read_cmdline(pid) else { continue };
        if argv.first().map_or(false, |a| program_matches(a, program)) {
            let api_socket = argv
                .iter()
                .position(|a| a == "--api-sock")
                .and_then(|i| argv.get(i + 1))
                .map(PathBuf::from);
            found.push(HypervisorProcess { pid, api_socket });
        }
    }
    found.sort_by_key(|p| p.pid);
    Ok(found)
}

fn read_cmdline(pid: u32) -> Option<Vec<String>> {
    let raw = std::fs::read(format!("/proc/{}/cmdline", pid)).ok()?;
    Some(
        raw.split(|b| *b == 0)
            .filter(|part| !part.is_empty())
            .map(|part| String::from_utf8_lossy(part).into_owned())
            .collect(),
    )
}

fn program_matches(argv0: &str, program: &str) -> bool {
    Path::new(argv0)
        .file_name()
        .map_or(false, |name| name.to_string_lossy() == program)
}

/// Starts hypervisor processes.
pub trait Launcher: Send + Sync {
    /// Executable name of launched processes, used to recognize them later.
    fn program(&self) -> String;

    /// Spawn detached in a new session, output appended to `console_log`.
    fn spawn(&self, machine_file: &Path, socket: &Path, console_log: &Path) -> Result<u32>;

    /// Run with the terminal attached until the process exits.
    ///
    /// `on_spawn` receives the PID right after launch.
    fn run_attached(
        &self,
        machine_file: &Path,
        socket: &Path,
        on_spawn: &mut dyn FnMut(u32) -> Result<()>,
    ) -> Result<i32>;
}

/// Launches the Firecracker binary.
#[derive(Debug, Clone)]
pub struct FirecrackerLauncher {
    settings: HypervisorSettings,
}

impl FirecrackerLauncher {
    /// Launcher for the configured binary.
    pub fn new(settings: HypervisorSettings) -> Self {
        Self { settings }
    }

    fn command(&self, machine_file: &Path, socket: &Path) -> Command {
        let mut cmd = Command::new(&self.settings.binary);
        cmd.arg("--api-sock")
            .arg(socket)
            .arg("--config-file")
            .arg(machine_file);
        cmd
    }
}

impl Launcher for FirecrackerLauncher {
    fn program(&self) -> String {
        self.settings.binary_name()
    }

    fn spawn(&self, machine_file: &Path, socket: &Path, console_log: &Path) -> Result<u32> {
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(console_log)?;
        let log_err = log.try_clone()?;

        let mut cmd = self.command(machine_file, socket);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        // SAFETY: setsid is async-signal-safe.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd
            .spawn()
            .map_err(|e| Error::command_failed(self.settings.binary.display().to_string(), e.to_string()))?;
        Ok(child.id())
    }

    fn run_attached(
        &self,
        machine_file: &Path,
        socket: &Path,
        on_spawn: &mut dyn FnMut(u32) -> Result<()>,
    ) -> Result<i32> {
        let mut child = self
            .command(machine_file, socket)
            .spawn()
            .map_err(|e| Error::command_failed(self.settings.binary.display().to_string(), e.to_string()))?;

        if let Err(e) = on_spawn(child.id()) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(e);
        }
        let status = child.wait()?;
        Ok(status.code().unwrap_or(1))
    }
}

/// How a stop request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// No live hypervisor was recorded; stale state was cleared.
    NotRunning,
    /// The guest shut down on request.
    Graceful,
    /// The process exited after SIGTERM.
    Terminated,
    /// The process had to be killed.
    Killed,
}

impl std::fmt::Display for StopOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StopOutcome::NotRunning => "not running",
            StopOutcome::Graceful => "shut down",
            StopOutcome::Terminated => "terminated",
            StopOutcome::Killed => "killed",
        };
        f.write_str(s)
    }
}

/// Starts and stops hypervisor processes and keeps their PIDs on record.
pub struct Supervisor {
    store: StateStore,
    launcher: Arc<dyn Launcher>,
    guest: Arc<dyn GuestChannel>,
    hypervisor: HypervisorSettings,
    timeouts: Timeouts,
    first_boot_script: Option<String>,
}

impl Supervisor {
    /// Create a supervisor.
    pub fn new(
        store: StateStore,
        launcher: Arc<dyn Launcher>,
        guest: Arc<dyn GuestChannel>,
        hypervisor: HypervisorSettings,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            store,
            launcher,
            guest,
            hypervisor,
            timeouts,
            first_boot_script: None,
        }
    }

    /// Guest script to run once after the first successful boot.
    pub fn with_first_boot_script(mut self, script: Option<String>) -> Self {
        self.first_boot_script = script;
        self
    }

    /// Whether `pid` is a live hypervisor (or an unidentifiable live process).
    pub fn is_running(&self, pid: u32) -> bool {
        matches!(
            probe_pid(pid, &self.launcher.program()),
            PidState::Hypervisor | PidState::Unknown
        )
    }

    /// Write the machine description and clear a stale control socket.
    fn prepare(&self, record: &VmRecord) -> Result<(PathBuf, PathBuf)> {
        let description = hypervisor::describe(record, &self.hypervisor)?;
        let machine_file = self.store.machine_file(&record.name);
        state::write_atomic(&machine_file, description.to_json()?.as_bytes())?;

        let socket = self.store.socket_path(&record.name)?;
        match std::fs::remove_file(&socket) {
            Ok(()) => tracing::debug!(socket = %socket.display(), "removed stale control socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(socket = %socket.display(), error = %e, "failed to remove stale socket"),
        }
        Ok((machine_file, socket))
    }

    fn ensure_not_running(&self, record: &VmRecord) -> Result<()> {
        match record.pid {
            Some(pid) if self.is_running(pid) => Err(Error::invalid_state(
                "stopped",
                format!("running (pid {})", pid),
            )),
            _ => Ok(()),
        }
    }

    /// Launch the VM in the background and wait until the guest answers on SSH.
    ///
    /// The PID is recorded before the readiness poll. If the guest does not
    /// come up within the boot budget the process is killed and its PID cleared.
    pub fn start(&self, record: &VmRecord) -> Result<u32> {
        self.ensure_not_running(record)?;
        let ip = record.guest_ip.ok_or_else(|| {
            Error::invalid_state("network assigned", "no guest address recorded")
        })?;

        let (machine_file, socket) = self.prepare(record)?;
        let console_log = self.store.console_log(&record.name);
        let pid = self.launcher.spawn(&machine_file, &socket, &console_log)?;
        tracing::info!(vm = %record.name, pid, "hypervisor started");

        if let Err(e) = self.store.write_pid(&record.name, pid, &socket) {
            signal(pid, libc::SIGKILL);
            wait_for_exit(pid, self.timeouts.kill);
            return Err(e);
        }

        self.wait_for_guest(&record.name, pid, ip, &console_log)?;

        if record.first_boot_pending {
            self.run_first_boot(&record.name, ip);
        }
        Ok(pid)
    }

    fn wait_for_guest(&self, name: &str, pid: u32, ip: Ipv4Addr, console_log: &Path) -> Result<()> {
        tracing::debug!(vm = %name, ip = %ip, attempts = self.timeouts.boot_attempts, "waiting for guest SSH");
        for attempt in 1..=self.timeouts.boot_attempts {
            if !is_alive(pid) {
                self.clear(name)?;
                return Err(Error::command_failed(
                    self.launcher.program(),
                    format!("exited during boot; see {}", console_log.display()),
                ));
            }
            if self.guest.probe(ip) {
                tracing::info!(vm = %name, attempt, "guest is reachable");
                return Ok(());
            }
            std::thread::sleep(self.timeouts.boot_interval);
        }

        tracing::warn!(vm = %name, pid, "guest did not come up, killing hypervisor");
        signal(pid, libc::SIGKILL);
        wait_for_exit(pid, self.timeouts.kill);
        self.clear(name)?;
        Err(Error::timeout(
            format!("SSH on {}", ip),
            self.timeouts.boot_budget(),
        ))
    }

    fn run_first_boot(&self, name: &str, ip: Ipv4Addr) {
        let Some(script) = &self.first_boot_script else {
            let _ = self.store.update(name, |r| r.first_boot_pending = false);
            return;
        };
        let command = format!("sh {script} && rm -f {script}", script = script);
        match self.guest.run(ip, &command) {
            Ok(_) => {
                tracing::info!(vm = %name, script = %script, "first-boot script completed");
                if let Err(e) = self.store.update(name, |r| r.first_boot_pending = false) {
                    tracing::warn!(vm = %name, error = %e, "failed to clear first-boot flag");
                }
            }
            Err(e) => {
                tracing::warn!(vm = %name, error = %e, "first-boot script failed; it will run again on next start");
            }
        }
    }

    /// Run the VM with the serial console attached to the terminal.
    ///
    /// Blocks until the hypervisor exits, then clears the PID. Returns its exit code.
    pub fn start_attached(&self, record: &VmRecord) -> Result<i32> {
        self.ensure_not_running(record)?;
        let (machine_file, socket) = self.prepare(record)?;

        let store = &self.store;
        let name = record.name.as_str();
        let socket_for_record = socket.clone();
        let code = self.launcher.run_attached(&machine_file, &socket, &mut |pid| {
            tracing::info!(vm = %name, pid, "hypervisor started with console attached");
            store.write_pid(name, pid, &socket_for_record)
        });

        self.clear(name)?;
        code
    }

    /// Stop the VM's hypervisor.
    ///
    /// With `graceful`, the guest is asked to shut down first. Each later tier
    /// runs only if the process is still alive. Calling this on a VM that is
    /// not running clears any stale PID and succeeds.
    pub fn stop(&self, record: &VmRecord, graceful: bool) -> Result<StopOutcome> {
        let Some(pid) = record.pid else {
            self.clear(&record.name)?;
            return Ok(StopOutcome::NotRunning);
        };

        match probe_pid(pid, &self.launcher.program()) {
            PidState::Dead => {
                tracing::debug!(vm = %record.name, pid, "recorded process already exited");
                self.clear(&record.name)?;
                return Ok(StopOutcome::NotRunning);
            }
            PidState::Foreign => {
                tracing::warn!(vm = %record.name, pid, "recorded pid now belongs to another program, not signaling it");
                self.clear(&record.name)?;
                return Ok(StopOutcome::NotRunning);
            }
            PidState::Hypervisor | PidState::Unknown => {}
        }

        let outcome = self.escalate(record, pid, graceful)?;
        self.clear(&record.name)?;
        tracing::info!(vm = %record.name, pid, outcome = %outcome, "hypervisor stopped");
        Ok(outcome)
    }

    fn escalate(&self, record: &VmRecord, pid: u32, graceful: bool) -> Result<StopOutcome> {
        if graceful {
            if let Some(ip) = record.guest_ip {
                match self.guest.shutdown(ip) {
                    Ok(()) => {
                        if wait_for_exit(pid, self.timeouts.graceful_shutdown) {
                            return Ok(StopOutcome::Graceful);
                        }
                        tracing::debug!(vm = %record.name, "guest shutdown timed out");
                    }
                    Err(e) => tracing::debug!(vm = %record.name, error = %e, "guest shutdown request failed"),
                }
            }
        }

        signal(pid, libc::SIGTERM);
        if wait_for_exit(pid, self.timeouts.terminate) {
            return Ok(StopOutcome::Terminated);
        }

        tracing::warn!(vm = %record.name, pid, "hypervisor ignored SIGTERM, killing");
        signal(pid, libc::SIGKILL);
        if wait_for_exit(pid, self.timeouts.kill) {
            return Ok(StopOutcome::Killed);
        }
        Err(Error::timeout(format!("pid {} to exit after SIGKILL", pid), self.timeouts.kill))
    }

    /// Forget the process and remove its control socket.
    fn clear(&self, name: &str) -> Result<()> {
        if let Ok(socket) = self.store.socket_path(name) {
            let _ = std::fs::remove_file(socket);
        }
        self.store.clear_pid(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{DiskArtifacts, ROOTFS_FILE};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Spawns `sleep` in place of the hypervisor.
    struct SleepLauncher {
        ignore_term: bool,
    }

    impl Launcher for SleepLauncher {
        fn program(&self) -> String {
            if self.ignore_term { "sh".into() } else { "sleep".into() }
        }

        fn spawn(&self, _machine: &Path, _socket: &Path, _log: &Path) -> Result<u32> {
            let child = if self.ignore_term {
                Command::new("sh")
                    .args(["-c", "trap '' TERM; while true; do sleep 1; done"])
                    .spawn()?
            } else {
                Command::new("sleep").arg("30").spawn()?
            };
            Ok(child.id())
        }

        fn run_attached(
            &self,
            _machine: &Path,
            _socket: &Path,
            on_spawn: &mut dyn FnMut(u32) -> Result<()>,
        ) -> Result<i32> {
            let mut child = Command::new("true").spawn()?;
            on_spawn(child.id())?;
            Ok(child.wait()?.code().unwrap_or(1))
        }
    }

    /// Guest whose reachability is fixed; shutdown kills the recorded victim.
    #[derive(Default)]
    struct FakeGuest {
        reachable: bool,
        victim: Mutex<Option<u32>>,
        commands: Mutex<Vec<String>>,
        fail_run: AtomicBool,
    }

    impl GuestChannel for FakeGuest {
        fn probe(&self, _ip: Ipv4Addr) -> bool {
            self.reachable
        }

        fn run(&self, _ip: Ipv4Addr, command: &str) -> Result<String> {
            self.commands.lock().unwrap().push(command.to_string());
            if self.fail_run.load(Ordering::SeqCst) {
                return Err(Error::command_failed("ssh", "exit status 1"));
            }
            Ok(String::new())
        }

        fn shutdown(&self, _ip: Ipv4Addr) -> Result<()> {
            match *self.victim.lock().unwrap() {
                Some(pid) if self.reachable => {
                    signal(pid, libc::SIGKILL);
                    Ok(())
                }
                _ => Err(Error::command_failed("ssh", "unreachable")),
            }
        }

        fn interactive(&self, _ip: Ipv4Addr, _command: &[String]) -> Result<i32> {
            Ok(0)
        }
    }

    fn fast_timeouts() -> Timeouts {
        Timeouts {
            boot_attempts: 3,
            boot_interval: Duration::from_millis(20),
            graceful_shutdown: Duration::from_secs(2),
            terminate: Duration::from_millis(500),
            kill: Duration::from_secs(2),
        }
    }

    fn built_vm(store: &StateStore, name: &str) -> VmRecord {
        store.create(&VmRecord::new(name)).unwrap();
        let assignment = crate::network::NetworkAssignment {
            guest_ip: Ipv4Addr::new(172, 16, 0, 2),
            gateway_ip: Ipv4Addr::new(172, 16, 0, 1),
            subnet_index: Some(0),
            prefix_len: 24,
        };
        store.write_network(name, &assignment, "tap-a", "eth0").unwrap();
        let artifacts = DiskArtifacts {
            rootfs: store.vm_dir(name).join(ROOTFS_FILE),
            volume: None,
        };
        store.mark_built(name, &artifacts, false).unwrap();
        store.load(name).unwrap()
    }

    fn supervisor(store: &StateStore, launcher: SleepLauncher, guest: Arc<FakeGuest>) -> Supervisor {
        Supervisor::new(
            store.clone(),
            Arc::new(launcher),
            guest,
            HypervisorSettings::default(),
            fast_timeouts(),
        )
    }

    fn store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path().join("vms")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_is_alive_reaps_exited_child() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        // Give it time to exit and become a zombie.
        std::thread::sleep(Duration::from_millis(200));
        assert!(!is_alive(pid));
        let _ = child.try_wait();
    }

    #[test]
    fn test_is_alive_for_running_process() {
        let mut child = Command::new("sleep").arg("5").spawn().unwrap();
        assert!(is_alive(child.id()));
        child.kill().unwrap();
        child.wait().unwrap();
        assert!(!is_alive(child.id()));
    }

    #[test]
    fn test_is_alive_rejects_invalid_pids() {
        assert!(!is_alive(0));
        assert!(!is_alive(u32::MAX));
    }

    #[test]
    fn test_probe_pid_classifies_processes() {
        let mut child = Command::new("sleep").arg("5").spawn().unwrap();
        let pid = child.id();
        assert_eq!(probe_pid(pid, "sleep"), PidState::Hypervisor);
        assert_eq!(probe_pid(pid, "firecracker"), PidState::Foreign);
        child.kill().unwrap();
        child.wait().unwrap();
        assert_eq!(probe_pid(pid, "sleep"), PidState::Dead);
    }

    #[test]
    fn test_list_hypervisor_processes_finds_program() {
        let mut child = Command::new("sleep").arg("5").spawn().unwrap();
        let found = list_hypervisor_processes("sleep").unwrap();
        assert!(found.iter().any(|p| p.pid == child.id()));
        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn test_start_records_pid_when_guest_answers() {
        let (_dir, store) = store();
        let record = built_vm(&store, "a");
        let guest = Arc::new(FakeGuest {
            reachable: true,
            ..Default::default()
        });
        let sup = supervisor(&store, SleepLauncher { ignore_term: false }, guest);

        let pid = sup.start(&record).unwrap();
        let saved = store.load("a").unwrap();
        assert_eq!(saved.pid, Some(pid));
        assert!(saved.started_at.is_some());
        assert!(store.machine_file("a").exists());

        let outcome = sup.stop(&saved, false).unwrap();
        assert_eq!(outcome, StopOutcome::Terminated);
        assert_eq!(store.read_pid("a").unwrap(), None);
    }

    #[test]
    fn test_start_times_out_and_kills_when_guest_unreachable() {
        let (_dir, store) = store();
        let record = built_vm(&store, "a");
        let sup = supervisor(
            &store,
            SleepLauncher { ignore_term: false },
            Arc::new(FakeGuest::default()),
        );

        match sup.start(&record) {
            Err(Error::Timeout { .. }) => {}
            other => panic!("expected timeout, got {:?}", other),
        }
        let saved = store.load("a").unwrap();
        assert_eq!(saved.pid, None);
        assert_eq!(saved.socket_path, None);
    }

    #[test]
    fn test_start_refuses_running_vm() {
        let (_dir, store) = store();
        let record = built_vm(&store, "a");
        let guest = Arc::new(FakeGuest {
            reachable: true,
            ..Default::default()
        });
        let sup = supervisor(&store, SleepLauncher { ignore_term: false }, guest);
        sup.start(&record).unwrap();

        let running = store.load("a").unwrap();
        assert!(matches!(sup.start(&running), Err(Error::InvalidState { .. })));
        sup.stop(&running, false).unwrap();
    }

    #[test]
    fn test_graceful_stop_uses_guest_shutdown() {
        let (_dir, store) = store();
        let record = built_vm(&store, "a");
        let guest = Arc::new(FakeGuest {
            reachable: true,
            ..Default::default()
        });
        let sup = supervisor(&store, SleepLauncher { ignore_term: false }, guest.clone());

        let pid = sup.start(&record).unwrap();
        *guest.victim.lock().unwrap() = Some(pid);
        let outcome = sup.stop(&store.load("a").unwrap(), true).unwrap();
        assert_eq!(outcome, StopOutcome::Graceful);
    }

    #[test]
    fn test_stop_escalates_to_sigkill() {
        let (_dir, store) = store();
        let record = built_vm(&store, "a");
        let guest = Arc::new(FakeGuest {
            reachable: true,
            ..Default::default()
        });
        let sup = supervisor(&store, SleepLauncher { ignore_term: true }, guest);

        sup.start(&record).unwrap();
        // Let the shell install its trap.
        std::thread::sleep(Duration::from_millis(200));
        let outcome = sup.stop(&store.load("a").unwrap(), true).unwrap();
        assert_eq!(outcome, StopOutcome::Killed);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (_dir, store) = store();
        let record = built_vm(&store, "a");
        let guest = Arc::new(FakeGuest {
            reachable: true,
            ..Default::default()
        });
        let sup = supervisor(&store, SleepLauncher { ignore_term: false }, guest);
        sup.start(&record).unwrap();

        let first = sup.stop(&store.load("a").unwrap(), false).unwrap();
        assert_ne!(first, StopOutcome::NotRunning);
        let second = sup.stop(&store.load("a").unwrap(), false).unwrap();
        assert_eq!(second, StopOutcome::NotRunning);
        assert_eq!(store.read_pid("a").unwrap(), None);
    }

    #[test]
    fn test_stop_clears_pid_of_exited_process() {
        let (_dir, store) = store();
        built_vm(&store, "a");
        let mut child = Command::new("true").spawn().unwrap();
        let dead = child.id();
        child.wait().unwrap();
        store.write_pid("a", dead, Path::new("/tmp/none.sock")).unwrap();

        let sup = supervisor(
            &store,
            SleepLauncher { ignore_term: false },
            Arc::new(FakeGuest::default()),
        );
        let outcome = sup.stop(&store.load("a").unwrap(), true).unwrap();
        assert_eq!(outcome, StopOutcome::NotRunning);
        assert_eq!(store.read_pid("a").unwrap(), None);
    }

    #[test]
    fn test_stop_never_signals_foreign_process() {
        let (_dir, store) = store();
        built_vm(&store, "a");
        let mut other = Command::new("sleep").arg("5").spawn().unwrap();
        store
            .write_pid("a", other.id(), Path::new("/tmp/none.sock"))
            .unwrap();

        let sup = Supervisor::new(
            store.clone(),
            Arc::new(FirecrackerLauncher::new(HypervisorSettings::default())),
            Arc::new(FakeGuest::default()),
            HypervisorSettings::default(),
            fast_timeouts(),
        );
        let outcome = sup.stop(&store.load("a").unwrap(), false).unwrap();
        assert_eq!(outcome, StopOutcome::NotRunning);
        assert!(is_alive(other.id()));
        other.kill().unwrap();
        other.wait().unwrap();
    }

    #[test]
    fn test_first_boot_script_runs_once() {
        let (_dir, store) = store();
        built_vm(&store, "a");
        store.update("a", |r| r.first_boot_pending = true).unwrap();
        let guest = Arc::new(FakeGuest {
            reachable: true,
            ..Default::default()
        });
        let sup = supervisor(&store, SleepLauncher { ignore_term: false }, guest.clone())
            .with_first_boot_script(Some("/root/firstboot.sh".into()));

        sup.start(&store.load("a").unwrap()).unwrap();
        let saved = store.load("a").unwrap();
        assert!(!saved.first_boot_pending);
        assert_eq!(
            guest.commands.lock().unwrap().as_slice(),
            ["sh /root/firstboot.sh && rm -f /root/firstboot.sh"]
        );
        sup.stop(&saved, false).unwrap();
    }

    #[test]
    fn test_failed_first_boot_script_stays_pending() {
        let (_dir, store) = store();
        built_vm(&store, "a");
        store.update("a", |r| r.first_boot_pending = true).unwrap();
        let guest = Arc::new(FakeGuest {
            reachable: true,
            fail_run: AtomicBool::new(true),
            ..Default::default()
        });
        let sup = supervisor(&store, SleepLauncher { ignore_term: false }, guest)
            .with_first_boot_script(Some("/root/firstboot.sh".into()));

        sup.start(&store.load("a").unwrap()).unwrap();
        let saved = store.load("a").unwrap();
        assert!(saved.first_boot_pending);
        sup.stop(&saved, false).unwrap();
    }

    #[test]
    fn test_start_attached_clears_pid_after_exit() {
        let (_dir, store) = store();
        let record = built_vm(&store, "a");
        let sup = supervisor(
            &store,
            SleepLauncher { ignore_term: false },
            Arc::new(FakeGuest::default()),
        );
        let code = sup.start_attached(&record).unwrap();
        assert_eq!(code, 0);
        let saved = store.load("a").unwrap();
        assert_eq!(saved.pid, None);
        assert!(saved.stopped_at.is_some());
    }
}
