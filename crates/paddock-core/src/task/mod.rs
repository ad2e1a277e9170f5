//! Task launcher: the privileged spawn of one process inside a container.
//!
//! The container assembles a frozen [`TaskEnv`] from its properties; the
//! spawn protocol in [`spawn`] crosses the privilege and namespace boundary
//! and leaves behind a [`Task`] handle the supervisor can signal and reap.

pub mod child;
pub mod spawn;

use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};

use nix::sched::CloneFlags;
use nix::sys::resource::Resource;
use nix::unistd::Pid;
use prost::Message;

use crate::error::{Error, Result};
use crate::net::{IpSpec, NetCfg};
use crate::Cred;

/// One bind mount, applied in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    /// Host-side source.
    pub source: PathBuf,
    /// Destination inside the container root.
    pub dest: PathBuf,
    /// Remount read-only after binding.
    pub read_only: bool,
}

/// Open namespace files of a running ancestor, entered before the task
/// namespaces are decided.
#[derive(Debug, Default)]
pub struct NamespaceSnapshot {
    fds: Vec<(CloneFlags, OwnedFd)>,
}

impl NamespaceSnapshot {
    const KINDS: [(&'static str, CloneFlags); 6] = [
        ("user", CloneFlags::CLONE_NEWUSER),
        ("ipc", CloneFlags::CLONE_NEWIPC),
        ("uts", CloneFlags::CLONE_NEWUTS),
        ("net", CloneFlags::CLONE_NEWNET),
        ("pid", CloneFlags::CLONE_NEWPID),
        ("mnt", CloneFlags::CLONE_NEWNS),
    ];

    /// Open the namespaces of `pid`, restricted to `only` when non-empty.
    ///
    /// # Errors
    ///
    /// Returns an error if a namespace file cannot be opened.
    pub fn open(pid: Pid, only: &[&str]) -> Result<Self> {
        let mut fds = Vec::new();
        for (name, flag) in Self::KINDS {
            if !only.is_empty() && !only.contains(&name) {
                continue;
            }
            let path = format!("/proc/{pid}/ns/{name}");
            let file = std::fs::File::open(&path)
                .map_err(|e| Error::unknown(format!("cannot open {path}: {e}")))?;
            fds.push((flag, file.into()));
        }
        Ok(Self { fds })
    }

    /// Whether any namespace was captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Whether the snapshot carries a pid namespace.
    #[must_use]
    pub fn has_pid(&self) -> bool {
        self.fds.iter().any(|(f, _)| f.contains(CloneFlags::CLONE_NEWPID))
    }

    /// Enter every captured namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if a `setns` fails.
    pub fn enter(&self) -> Result<()> {
        for (flag, fd) in &self.fds {
            nix::sched::setns(fd, *flag)?;
        }
        Ok(())
    }
}

/// Frozen input of one spawn.
#[derive(Debug)]
pub struct TaskEnv {
    /// Full container name, for diagnostics.
    pub container: String,
    /// Command line, run through `/bin/sh -c`.
    pub command: String,
    /// Working directory inside the container root.
    pub cwd: PathBuf,
    /// Root directory, already resolved to a directory path.
    pub root: PathBuf,
    /// Remount the root read-only after setup.
    pub root_rdonly: bool,
    /// `KEY=VALUE` environment entries.
    pub env: Vec<String>,
    /// Whether new namespaces are created.
    pub isolate: bool,
    /// Standard input path.
    pub stdin_path: PathBuf,
    /// Standard output path.
    pub stdout_path: PathBuf,
    /// Standard error path.
    pub stderr_path: PathBuf,
    /// Hostname, set when a uts namespace was created.
    pub hostname: String,
    /// Bind /etc/hosts and /etc/resolv.conf from the host.
    pub bind_dns: bool,
    /// Bind mounts, in declaration order.
    pub bind_mounts: Vec<BindMount>,
    /// Network configuration.
    pub net: NetCfg,
    /// Address assignments applied after provisioning.
    pub ip: Vec<IpSpec>,
    /// Default gateway, when one is configured.
    pub default_gw: Option<std::net::IpAddr>,
    /// Bounding capability set of the task.
    pub cap_limit: Vec<caps::Capability>,
    /// Ambient capability set of the task.
    pub cap_ambient: Vec<caps::Capability>,
    /// Resource limits: (resource, soft, hard).
    pub rlimits: Vec<(Resource, u64, u64)>,
    /// Leaf cgroup directories the task is attached to before exec.
    pub cgroup_paths: Vec<PathBuf>,
    /// Effective credentials of the task.
    pub cred: Cred,
    /// Loop device backing the root image, or -1.
    pub loop_dev: i32,
    /// Namespaces of the running ancestor, for non-isolated starts.
    pub parent_ns: NamespaceSnapshot,
    /// Whether a new mount namespace is required.
    pub new_mount_ns: bool,
}

impl Default for TaskEnv {
    fn default() -> Self {
        Self {
            container: String::new(),
            command: String::new(),
            cwd: PathBuf::new(),
            root: PathBuf::from("/"),
            root_rdonly: false,
            env: Vec::new(),
            isolate: true,
            stdin_path: PathBuf::from("/dev/null"),
            stdout_path: PathBuf::from("/dev/null"),
            stderr_path: PathBuf::from("/dev/null"),
            hostname: String::new(),
            bind_dns: false,
            bind_mounts: Vec::new(),
            net: NetCfg::host_shared(),
            ip: Vec::new(),
            default_gw: None,
            cap_limit: Vec::new(),
            cap_ambient: Vec::new(),
            rlimits: Vec::new(),
            cgroup_paths: Vec::new(),
            cred: Cred::root(),
            loop_dev: -1,
            parent_ns: NamespaceSnapshot::default(),
            new_mount_ns: false,
        }
    }
}

impl TaskEnv {
    /// Whether the spawn must quadro-fork: entering a pre-existing pid
    /// namespace, the intermediate has to die inside it.
    #[must_use]
    pub fn quadro_fork(&self) -> bool {
        !self.isolate && self.parent_ns.has_pid()
    }
}

/// Stages of the child setup, reported over the spawn socket in execution
/// order. Stdio opens first, while host paths are still reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Stage {
    /// Stdio descriptors wired.
    Stdio = 1,
    /// Resource limits applied.
    Limits = 2,
    /// Hostname set.
    Hostname = 3,
    /// Root filesystem mounted and pivoted.
    RootFs = 4,
    /// tmpfs mounted on /run.
    Run = 5,
    /// Bind mounts applied.
    Binds = 6,
    /// DNS files bound from the host.
    Dns = 7,
    /// Root remounted read-only.
    RootRo = 8,
    /// Mount propagation isolated.
    IsolateFs = 9,
    /// Attached to every cgroup.
    Cgroups = 10,
    /// Parent finished network configuration.
    Autoconf = 11,
    /// Capabilities applied.
    Capabilities = 12,
    /// Credentials dropped.
    Credentials = 13,
}

/// Error record the child sends before `_exit` when a stage fails.
#[derive(Clone, PartialEq, Message)]
pub struct SpawnError {
    /// Stage number that failed.
    #[prost(uint32, tag = "1")]
    pub stage: u32,
    /// Raw errno, when one exists.
    #[prost(int32, tag = "2")]
    pub errno: i32,
    /// Description.
    #[prost(string, tag = "3")]
    pub message: String,
}

/// A supervised process.
#[derive(Debug)]
pub struct Task {
    pid: Pid,
    vpid: Pid,
    wpid: Pid,
    running: bool,
    exit_status: i32,
}

impl Task {
    pub(crate) fn started(pid: Pid, vpid: Pid, wpid: Pid) -> Self {
        Self {
            pid,
            vpid,
            wpid,
            running: true,
            exit_status: 0,
        }
    }

    /// Re-attach to a process recorded in the kv store at daemon restart.
    #[must_use]
    pub fn restore(pid: Pid) -> Self {
        Self {
            pid,
            vpid: pid,
            wpid: pid,
            running: pid_alive(pid),
            exit_status: 0,
        }
    }

    /// Root pid as seen by the supervisor.
    #[must_use]
    pub const fn pid(&self) -> Pid {
        self.pid
    }

    /// Root pid as seen inside the task's pid namespace.
    #[must_use]
    pub const fn vpid(&self) -> Pid {
        self.vpid
    }

    /// Pid whose exit the supervisor waits on.
    #[must_use]
    pub const fn wpid(&self) -> Pid {
        self.wpid
    }

    /// Whether the task has not delivered an exit status yet.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running
    }

    /// The recorded exit status.
    #[must_use]
    pub const fn exit_status(&self) -> i32 {
        self.exit_status
    }

    /// Record the task's exit.
    pub fn deliver_exit(&mut self, status: i32) {
        self.running = false;
        self.exit_status = status;
    }

    /// Signal the root process.
    ///
    /// # Errors
    ///
    /// Returns an error if the task already exited or the kill fails.
    pub fn kill(&self, signal: nix::sys::signal::Signal) -> Result<()> {
        if !self.running {
            return Err(Error::invalid_state("task is not running"));
        }
        nix::sys::signal::kill(self.pid, signal)?;
        Ok(())
    }

    /// Whether the process is a zombie waiting to be reaped.
    #[must_use]
    pub fn is_zombie(&self) -> bool {
        proc_status_field(self.pid, "State:").is_some_and(|s| s.starts_with('Z'))
    }

    /// Whether the process is still parented to this daemon.
    #[must_use]
    pub fn has_correct_parent(&self) -> bool {
        proc_status_field(self.wpid, "PPid:")
            .and_then(|s| s.parse::<i32>().ok())
            .is_some_and(|ppid| ppid == std::process::id() as i32)
    }
}

fn pid_alive(pid: Pid) -> bool {
    nix::sys::signal::kill(pid, None::<nix::sys::signal::Signal>).is_ok()
}

fn proc_status_field(pid: Pid, field: &str) -> Option<String> {
    let text = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    text.lines()
        .find(|line| line.starts_with(field))
        .map(|line| line[field.len()..].trim().to_string())
}

/// Remove a default stdio file, keeping device nodes alone.
pub(crate) fn remove_stdio_file(path: &Path) {
    use std::os::unix::fs::FileTypeExt;
    let Ok(meta) = std::fs::metadata(path) else {
        return;
    };
    let ft = meta.file_type();
    if ft.is_char_device() || ft.is_block_device() {
        return;
    }
    if let Err(e) = std::fs::remove_file(path) {
        tracing::warn!(path = %path.display(), error = %e, "cannot remove stdio file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_exit_bookkeeping() {
        let mut task = Task::started(Pid::from_raw(100), Pid::from_raw(1), Pid::from_raw(100));
        assert!(task.is_running());
        task.deliver_exit(0x0100);
        assert!(!task.is_running());
        assert_eq!(task.exit_status(), 0x0100);
        assert!(task.kill(nix::sys::signal::Signal::SIGTERM).is_err());
    }

    #[test]
    fn test_quadro_fork_requires_parent_pid_ns() {
        let env = TaskEnv {
            isolate: false,
            ..TaskEnv::default()
        };
        // No parent namespace snapshot: plain triple fork.
        assert!(!env.quadro_fork());

        let env = TaskEnv {
            isolate: true,
            ..TaskEnv::default()
        };
        assert!(!env.quadro_fork());
    }

    #[test]
    fn test_spawn_error_round_trip() {
        let err = SpawnError {
            stage: Stage::RootFs as u32,
            errno: libc::ENOENT,
            message: "mount failed".to_string(),
        };
        let bytes = err.encode_length_delimited_to_vec();
        let back = SpawnError::decode_length_delimited(bytes.as_slice()).unwrap();
        assert_eq!(back, err);
    }
}
