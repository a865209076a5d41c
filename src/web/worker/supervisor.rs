//! Cross-platform process primitives: detached spawn with log redirection,
//! PID liveness, and process-tree teardown.
//!
//! Tree kills prefer process-table introspection (terminate children, wait,
//! force-kill survivors, then the root). When the process table has no entry
//! to work from, OS commands take over: `taskkill /T` on Windows, `pkill -P`
//! plus a direct SIGKILL on Unix.

use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, Signal, System};
use thiserror::Error;

use crate::web::constants::PROCESS_WAIT_TIMEOUT;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("worker entrypoint is not configured")]
    EntrypointNotConfigured,
    #[error("worker entrypoint not found: {0}")]
    MissingEntrypoint(PathBuf),
    #[error("failed to open worker log {path}: {source}")]
    LogFile {
        path: PathBuf,
        source: io::Error,
    },
    #[error("failed to spawn worker process: {0}")]
    Spawn(#[from] io::Error),
}

/// Everything needed to start one detached worker process.
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    /// Open handle to the worker's log; stdout and stderr both land here.
    pub log_sink: File,
}

/// Spawn a detached child process.
///
/// The child gets its own session on Unix (so it survives the master's
/// terminal and can be torn down as a group) and the no-window creation flag
/// on Windows. It never attaches to the parent's controlling terminal.
pub fn start(spec: LaunchSpec) -> Result<Child, LaunchError> {
    if !spec.program.exists() {
        return Err(LaunchError::MissingEntrypoint(spec.program));
    }

    let stdout = spec
        .log_sink
        .try_clone()
        .map_err(LaunchError::Spawn)?;

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(spec.log_sink));

    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Detach into a new session so the worker is not tied to our terminal.
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
    }

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.spawn().map_err(LaunchError::Spawn)
}

/// True iff a process with this PID exists and is not a zombie.
pub fn is_alive(pid: u32) -> bool {
    let target = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
    match sys.process(target) {
        Some(proc_) => proc_.status() != ProcessStatus::Zombie,
        None => false,
    }
}

/// Kill a process and all of its descendants.
///
/// Returns true once the root process is confirmed dead.
pub fn kill_tree(pid: u32) -> bool {
    let root = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);

    if sys.process(root).is_none() {
        crate::log_debug!("Process {} not in process table, using OS commands", pid);
        return kill_tree_with_commands(pid);
    }

    let descendants = collect_descendants(&sys, root);
    for &child in &descendants {
        if let Some(proc_) = sys.process(child) {
            crate::log_debug!(
                "Terminating child {} ({})",
                child.as_u32(),
                proc_.name().to_string_lossy()
            );
            terminate(proc_);
        }
    }
    wait_for_exit(&descendants, PROCESS_WAIT_TIMEOUT);

    // Force-kill any survivors before touching the root.
    sys.refresh_processes(ProcessesToUpdate::All, true);
    for &child in &descendants {
        if let Some(proc_) = sys.process(child) {
            crate::log_debug!("Force killing child {}", child.as_u32());
            proc_.kill();
        }
    }

    sys.refresh_processes(ProcessesToUpdate::Some(&[root]), true);
    if let Some(proc_) = sys.process(root) {
        terminate(proc_);
        if !wait_for_exit(&[root], PROCESS_WAIT_TIMEOUT) {
            crate::log_debug!("Force killing root {}", pid);
            sys.refresh_processes(ProcessesToUpdate::Some(&[root]), true);
            if let Some(proc_) = sys.process(root) {
                proc_.kill();
            }
        }
    }

    if is_alive(pid) {
        // Introspection left the root standing; let the OS tools finish.
        return kill_tree_with_commands(pid);
    }
    true
}

/// Graceful terminate with a bounded wait, force kill on expiry. Used as the
/// stop fallback when the tree kill reports failure and we still own the
/// child handle.
pub fn terminate_with_timeout(child: &mut Child, timeout: Duration) -> bool {
    let pid = Pid::from_u32(child.id());
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    if let Some(proc_) = sys.process(pid) {
        terminate(proc_);
    }

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return true,
            Ok(None) => {}
            Err(_) => return false,
        }
        if Instant::now() >= deadline {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    let _ = child.kill();
    child.wait().is_ok()
}

fn terminate(proc_: &sysinfo::Process) {
    // Term where the platform supports it, hard kill otherwise.
    if proc_.kill_with(Signal::Term).is_none() {
        proc_.kill();
    }
}

/// All transitive children of `root`, parents before their own children.
fn collect_descendants(sys: &System, root: Pid) -> Vec<Pid> {
    let mut out = Vec::new();
    let mut frontier = vec![root];
    while let Some(parent) = frontier.pop() {
        for (pid, proc_) in sys.processes() {
            if proc_.parent() == Some(parent) {
                out.push(*pid);
                frontier.push(*pid);
            }
        }
    }
    out
}

/// Poll until every PID has left the process table (or turned zombie).
/// Returns false if any survived the timeout.
fn wait_for_exit(pids: &[Pid], timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::Some(pids), true);
        let survivor = pids
            .iter()
            .any(|pid| matches!(sys.process(*pid), Some(p) if p.status() != ProcessStatus::Zombie));
        if !survivor {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

/// OS-command fallback: enumerate children by parent PID and force-kill by
/// PID, finishing with a direct signal to the root.
fn kill_tree_with_commands(pid: u32) -> bool {
    #[cfg(windows)]
    {
        let result = Command::new("taskkill")
            .args(["/F", "/T", "/PID", &pid.to_string()])
            .output();
        match result {
            Ok(output) => output.status.success() || !is_alive(pid),
            Err(_) => !is_alive(pid),
        }
    }

    #[cfg(not(windows))]
    {
        let pid_arg = pid.to_string();
        let _ = Command::new("pkill").args(["-TERM", "-P", &pid_arg]).status();
        std::thread::sleep(Duration::from_millis(500));
        let _ = Command::new("pkill").args(["-KILL", "-P", &pid_arg]).status();
        unsafe {
            libc::kill(pid as i32, libc::SIGKILL);
        }
        // Give the kernel a moment to reap before the liveness check.
        std::thread::sleep(Duration::from_millis(100));
        !is_alive(pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_process_is_alive() {
        assert!(is_alive(std::process::id()));
    }

    #[test]
    fn test_bogus_pid_is_dead() {
        // PIDs this large are outside any real pid_max.
        assert!(!is_alive(0x3FFF_FFFF));
    }

    #[cfg(unix)]
    #[test]
    fn test_kill_tree_takes_down_spawned_process() {
        let child = Command::new("sleep")
            .arg("30")
            .stdout(Stdio::null())
            .spawn()
            .expect("spawn sleep");
        let pid = child.id();
        assert!(is_alive(pid));

        assert!(kill_tree(pid));
        assert!(!is_alive(pid));
    }

    #[cfg(unix)]
    #[test]
    fn test_kill_tree_takes_down_children() {
        // A shell that spawns its own sleep; killing the tree must get both.
        let child = Command::new("sh")
            .args(["-c", "sleep 30 & wait"])
            .stdout(Stdio::null())
            .spawn()
            .expect("spawn shell");
        let pid = child.id();
        std::thread::sleep(Duration::from_millis(200));
        assert!(is_alive(pid));

        assert!(kill_tree(pid));
        assert!(!is_alive(pid));
    }

    #[cfg(unix)]
    #[test]
    fn test_start_refuses_missing_program() {
        let log = File::create(std::env::temp_dir().join(format!(
            "shardpool_supervisor_test_{}.log",
            std::process::id()
        )))
        .unwrap();
        let spec = LaunchSpec {
            program: PathBuf::from("/nonexistent/shardpool-worker"),
            args: vec![],
            env: vec![],
            cwd: None,
            log_sink: log,
        };
        match start(spec) {
            Err(LaunchError::MissingEntrypoint(path)) => {
                assert_eq!(path, PathBuf::from("/nonexistent/shardpool-worker"));
            }
            other => panic!("expected MissingEntrypoint, got {:?}", other.map(|_| ())),
        }
    }
}
