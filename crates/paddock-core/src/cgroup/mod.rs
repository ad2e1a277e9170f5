//! Cgroup v1 controller layer.
//!
//! Controllers are discovered from `/proc/self/mounts` at startup; each one
//! exposes a tree of handles rooted at `<mount>/<segment>`. Knob
//! availability differs between kernels, so feature probes go through
//! [`Cgroup::has_knob`] and missing knobs surface as `NotSupported`.

use std::collections::HashMap;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::sys::eventfd::{EfdFlags, EventFd};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::error::{Error, ErrorKind, Result};

/// Controller subsystems the supervisor uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Controller {
    /// CPU scheduling policy and bandwidth.
    Cpu,
    /// CPU usage accounting.
    Cpuacct,
    /// Memory limits and accounting.
    Memory,
    /// Freezer, used for pause and escape-free kill.
    Freezer,
    /// Block IO weights.
    Blkio,
    /// Network classifier, carries the tclass handle.
    NetCls,
    /// Device access control.
    Devices,
}

impl Controller {
    /// All controllers, in attach order.
    pub const ALL: [Controller; 7] = [
        Controller::Cpu,
        Controller::Cpuacct,
        Controller::Memory,
        Controller::Freezer,
        Controller::Blkio,
        Controller::NetCls,
        Controller::Devices,
    ];

    /// The mount-option name of the controller.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Cpuacct => "cpuacct",
            Self::Memory => "memory",
            Self::Freezer => "freezer",
            Self::Blkio => "blkio",
            Self::NetCls => "net_cls",
            Self::Devices => "devices",
        }
    }
}

impl std::fmt::Display for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A handle to one cgroup directory under one controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cgroup {
    controller: Controller,
    path: PathBuf,
}

impl Cgroup {
    /// The controller this handle belongs to.
    #[must_use]
    pub const fn controller(&self) -> Controller {
        self.controller
    }

    /// Absolute path of the cgroup directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Handle to a child cgroup. Does not create it.
    #[must_use]
    pub fn child(&self, name: &str) -> Cgroup {
        Cgroup {
            controller: self.controller,
            path: self.path.join(name),
        }
    }

    /// Whether the cgroup directory exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.is_dir()
    }

    /// Create the cgroup directory, including missing ancestors.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn create(&self) -> Result<()> {
        if !self.exists() {
            debug!(cgroup = %self.path.display(), "create");
            std::fs::create_dir_all(&self.path)?;
        }
        Ok(())
    }

    /// Remove the cgroup directory. Fails while the cgroup holds tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the cgroup is non-empty or the rmdir fails.
    pub fn remove(&self) -> Result<()> {
        if !self.exists() {
            return Ok(());
        }
        if !self.is_empty()? {
            return Err(Error::new(
                ErrorKind::Unknown,
                format!("cgroup {} is not empty", self.path.display()),
            ));
        }
        debug!(cgroup = %self.path.display(), "remove");
        std::fs::remove_dir(&self.path)?;
        Ok(())
    }

    /// Whether the controller exposes a knob with this name.
    #[must_use]
    pub fn has_knob(&self, name: &str) -> bool {
        self.path.join(name).exists()
    }

    /// Read a knob value, trimmed.
    ///
    /// # Errors
    ///
    /// Returns `NotSupported` if the knob does not exist.
    pub fn get_knob(&self, name: &str) -> Result<String> {
        if !self.has_knob(name) {
            return Err(Error::not_supported(format!("no {name} in {}", self.path.display())));
        }
        let raw = std::fs::read_to_string(self.path.join(name))?;
        Ok(raw.trim().to_string())
    }

    /// Write a knob value, optionally into every descendant first.
    ///
    /// Recursive writes go deepest-first so limits shrink from the leaves up.
    ///
    /// # Errors
    ///
    /// Returns `NotSupported` if the knob does not exist, or the write error.
    pub fn set_knob(&self, name: &str, value: &str, recursive: bool) -> Result<()> {
        if !self.has_knob(name) {
            return Err(Error::not_supported(format!("no {name} in {}", self.path.display())));
        }
        if recursive {
            for child in self.children()? {
                child.set_knob(name, value, true)?;
            }
        }
        std::fs::write(self.path.join(name), value)?;
        Ok(())
    }

    /// Immediate child cgroups.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub fn children(&self) -> Result<Vec<Cgroup>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                out.push(Cgroup {
                    controller: self.controller,
                    path: entry.path(),
                });
            }
        }
        Ok(out)
    }

    /// Move a process into this cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if the write to `cgroup.procs` fails.
    pub fn attach(&self, pid: Pid) -> Result<()> {
        std::fs::write(self.path.join("cgroup.procs"), pid.as_raw().to_string())?;
        Ok(())
    }

    /// Thread ids currently in the cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if `tasks` cannot be read.
    pub fn tasks(&self) -> Result<Vec<Pid>> {
        self.read_pid_list("tasks")
    }

    /// Process ids currently in the cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if `cgroup.procs` cannot be read.
    pub fn processes(&self) -> Result<Vec<Pid>> {
        self.read_pid_list("cgroup.procs")
    }

    fn read_pid_list(&self, knob: &str) -> Result<Vec<Pid>> {
        let raw = std::fs::read_to_string(self.path.join(knob))?;
        let mut pids = Vec::new();
        for line in raw.lines() {
            if let Ok(pid) = line.trim().parse::<i32>() {
                pids.push(Pid::from_raw(pid));
            }
        }
        Ok(pids)
    }

    /// Whether the cgroup holds no tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the task list cannot be read.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.tasks()?.is_empty())
    }

    /// Signal every process in the cgroup.
    ///
    /// Processes that exit between enumeration and delivery are skipped.
    /// Callers freeze first when no task may escape delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the process list cannot be read.
    pub fn kill(&self, signal: Signal) -> Result<()> {
        for pid in self.processes()? {
            match nix::sys::signal::kill(pid, signal) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
                Err(e) => warn!(%pid, signal = %signal, error = %e, "kill failed"),
            }
        }
        Ok(())
    }
}

/// One mounted controller.
#[derive(Debug, Clone)]
pub struct Subsystem {
    controller: Controller,
    mount: PathBuf,
    segment: String,
}

impl Subsystem {
    /// The controller this subsystem drives.
    #[must_use]
    pub const fn controller(&self) -> Controller {
        self.controller
    }

    /// The controller mountpoint (the host root cgroup).
    #[must_use]
    pub fn host_root(&self) -> Cgroup {
        Cgroup {
            controller: self.controller,
            path: self.mount.clone(),
        }
    }

    /// The supervisor's own subtree root, `<mount>/<segment>`.
    #[must_use]
    pub fn root(&self) -> Cgroup {
        Cgroup {
            controller: self.controller,
            path: self.mount.join(&self.segment),
        }
    }
}

/// The set of controllers found on this host.
#[derive(Debug, Default)]
pub struct CgroupLayer {
    subsystems: HashMap<Controller, Subsystem>,
}

impl CgroupLayer {
    /// A layer with no controllers. Tests and disabled probes.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Discover mounted v1 controllers and create the supervisor subtrees.
    ///
    /// Missing controllers are tolerated; their features surface as
    /// `NotSupported` on use.
    ///
    /// # Errors
    ///
    /// Returns an error if the mount table cannot be read or a subtree
    /// cannot be created.
    pub fn probe(segment: &str) -> Result<Self> {
        let mounts = std::fs::read_to_string("/proc/self/mounts")?;
        let mut layer = Self::default();

        for line in mounts.lines() {
            let mut fields = line.split_whitespace();
            let (Some(_), Some(mountpoint), Some(fstype), Some(options)) =
                (fields.next(), fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            if fstype != "cgroup" {
                continue;
            }
            for controller in Controller::ALL {
                if options.split(',').any(|o| o == controller.as_str()) {
                    layer.subsystems.entry(controller).or_insert_with(|| Subsystem {
                        controller,
                        mount: PathBuf::from(mountpoint),
                        segment: segment.to_string(),
                    });
                }
            }
        }

        for subsystem in layer.subsystems.values() {
            subsystem.root().create()?;
        }
        debug!(count = layer.subsystems.len(), "probed cgroup controllers");
        Ok(layer)
    }

    /// The subsystem for a controller, if mounted.
    #[must_use]
    pub fn get(&self, controller: Controller) -> Option<&Subsystem> {
        self.subsystems.get(&controller)
    }

    /// The subsystem for a controller, or `NotSupported`.
    ///
    /// # Errors
    ///
    /// Returns `NotSupported` when the controller is not mounted.
    pub fn require(&self, controller: Controller) -> Result<&Subsystem> {
        self.get(controller)
            .ok_or_else(|| Error::not_supported(format!("{controller} cgroup is not mounted")))
    }

    /// Mounted subsystems, no particular order.
    pub fn subsystems(&self) -> impl Iterator<Item = &Subsystem> {
        self.subsystems.values()
    }
}

/// How long freezer state changes are polled before giving up.
const FREEZER_TIMEOUT: Duration = Duration::from_secs(5);

/// Freeze a cgroup and wait until every task is frozen.
///
/// # Errors
///
/// Returns an error if the state write fails or the cgroup does not reach
/// the frozen state in time.
pub fn freeze(cg: &Cgroup) -> Result<()> {
    cg.set_knob("freezer.state", "FROZEN", false)?;
    let deadline = Instant::now() + FREEZER_TIMEOUT;
    while !is_frozen(cg)? {
        if Instant::now() > deadline {
            return Err(Error::unknown(format!(
                "cgroup {} did not freeze in time",
                cg.path().display()
            )));
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    Ok(())
}

/// Thaw a frozen cgroup.
///
/// # Errors
///
/// Returns an error if the state write fails.
pub fn unfreeze(cg: &Cgroup) -> Result<()> {
    cg.set_knob("freezer.state", "THAWED", false)
}

/// Whether the cgroup is currently frozen.
///
/// # Errors
///
/// Returns an error if the state knob cannot be read.
pub fn is_frozen(cg: &Cgroup) -> Result<bool> {
    Ok(cg.get_knob("freezer.state")?.starts_with("FROZEN"))
}

/// Knob carrying the memory guarantee. Vendor kernels only; mainline
/// kernels surface `NotSupported` here.
pub const MEMORY_GUARANTEE_KNOB: &str = "memory.low_limit_in_bytes";

/// Memory-controller helpers.
pub mod memory {
    use super::{Cgroup, Error, Result, MEMORY_GUARANTEE_KNOB};

    /// Set the hard limit; 0 means unlimited.
    ///
    /// # Errors
    ///
    /// Returns the knob write error; `EBUSY` means usage already exceeds
    /// the requested limit.
    pub fn set_limit(cg: &Cgroup, bytes: u64) -> Result<()> {
        let value = if bytes == 0 { "-1".to_string() } else { bytes.to_string() };
        cg.set_knob("memory.limit_in_bytes", &value, false)
    }

    /// Set the guarantee.
    ///
    /// # Errors
    ///
    /// Returns `NotSupported` on kernels without the guarantee knob.
    pub fn set_guarantee(cg: &Cgroup, bytes: u64) -> Result<()> {
        cg.set_knob(MEMORY_GUARANTEE_KNOB, &bytes.to_string(), false)
    }

    /// Set the soft limit.
    ///
    /// # Errors
    ///
    /// Returns the knob write error.
    pub fn set_soft_limit(cg: &Cgroup, bytes: u64) -> Result<()> {
        cg.set_knob("memory.soft_limit_in_bytes", &bytes.to_string(), false)
    }

    /// Read the soft limit.
    ///
    /// # Errors
    ///
    /// Returns the knob read or parse error.
    pub fn soft_limit(cg: &Cgroup) -> Result<u64> {
        let raw = cg.get_knob("memory.soft_limit_in_bytes")?;
        raw.parse()
            .map_err(|_| Error::unknown(format!("bad soft limit value: {raw}")))
    }

    /// Set the filesystem bandwidth limit, when the kernel has one.
    ///
    /// # Errors
    ///
    /// Returns `NotSupported` on kernels without the knob.
    pub fn set_io_limit(cg: &Cgroup, bytes_per_sec: u64) -> Result<()> {
        cg.set_knob("memory.fs_bps_limit", &bytes_per_sec.to_string(), false)
    }

    /// Toggle page recharging on fault, when the kernel has it.
    ///
    /// # Errors
    ///
    /// Returns `NotSupported` on kernels without the knob.
    pub fn set_recharge_on_pgfault(cg: &Cgroup, on: bool) -> Result<()> {
        cg.set_knob("memory.recharge_on_pgfault", if on { "1" } else { "0" }, false)
    }

    /// Enable hierarchical accounting on a fresh leaf.
    ///
    /// # Errors
    ///
    /// Returns the knob write error.
    pub fn set_use_hierarchy(cg: &Cgroup, on: bool) -> Result<()> {
        cg.set_knob("memory.use_hierarchy", if on { "1" } else { "0" }, false)
    }

    /// Current usage in bytes.
    ///
    /// # Errors
    ///
    /// Returns the knob read or parse error.
    pub fn usage(cg: &Cgroup) -> Result<u64> {
        let raw = cg.get_knob("memory.usage_in_bytes")?;
        raw.parse()
            .map_err(|_| Error::unknown(format!("bad memory usage value: {raw}")))
    }
}

/// CPU-controller helpers.
pub mod cpu {
    use super::{Cgroup, Error, Result};

    /// Apply the scheduling policy. `rt` requires the vendor `cpu.smart`
    /// knob.
    ///
    /// # Errors
    ///
    /// Returns `NotSupported` when an `rt` policy is requested on a kernel
    /// without `cpu.smart`.
    pub fn set_policy(cg: &Cgroup, policy: &str) -> Result<()> {
        match policy {
            "rt" => cg.set_knob("cpu.smart", "1", false),
            _ => {
                if cg.has_knob("cpu.smart") {
                    cg.set_knob("cpu.smart", "0", false)?;
                }
                Ok(())
            }
        }
    }

    /// Map a guarantee in percent of one host to `cpu.shares`.
    ///
    /// # Errors
    ///
    /// Returns the knob write error.
    pub fn set_guarantee(cg: &Cgroup, percent: u64) -> Result<()> {
        let shares = 2 + percent * 1024 / 100;
        cg.set_knob("cpu.shares", &shares.to_string(), false)
    }

    /// Map a limit in percent of one host to a cfs quota; 0 is unlimited.
    ///
    /// # Errors
    ///
    /// Returns the knob read/write or parse error.
    pub fn set_limit(cg: &Cgroup, percent: u64) -> Result<()> {
        if percent == 0 {
            return cg.set_knob("cpu.cfs_quota_us", "-1", false);
        }
        let raw = cg.get_knob("cpu.cfs_period_us")?;
        let period: u64 = raw
            .parse()
            .map_err(|_| Error::unknown(format!("bad cfs period: {raw}")))?;
        let quota = (period * percent / 100).max(1000);
        cg.set_knob("cpu.cfs_quota_us", &quota.to_string(), false)
    }
}

/// CPU accounting helpers.
pub mod cpuacct {
    use super::{Cgroup, Error, Result};

    /// Total CPU time consumed, in nanoseconds.
    ///
    /// # Errors
    ///
    /// Returns the knob read or parse error.
    pub fn usage(cg: &Cgroup) -> Result<u64> {
        let raw = cg.get_knob("cpuacct.usage")?;
        raw.parse()
            .map_err(|_| Error::unknown(format!("bad cpuacct usage value: {raw}")))
    }
}

/// Block-IO helpers.
pub mod blkio {
    use super::{Cgroup, Result};

    /// Weight applied to batch-policy containers.
    const BATCH_WEIGHT: u64 = 10;
    /// Weight applied to normal-policy containers.
    const NORMAL_WEIGHT: u64 = 500;

    /// Apply the IO policy when the kernel supports weights.
    ///
    /// # Errors
    ///
    /// Returns the knob write error.
    pub fn set_policy(cg: &Cgroup, batch: bool) -> Result<()> {
        if !cg.has_knob("blkio.weight") {
            return Ok(());
        }
        let weight = if batch { BATCH_WEIGHT } else { NORMAL_WEIGHT };
        cg.set_knob("blkio.weight", &weight.to_string(), false)
    }
}

/// Device-access helpers.
pub mod devices {
    use super::{Cgroup, Result};

    /// Replace the device whitelist with the given `type major:minor acc`
    /// lines.
    ///
    /// # Errors
    ///
    /// Returns the knob write error.
    pub fn apply(cg: &Cgroup, lines: &[String]) -> Result<()> {
        cg.set_knob("devices.deny", "a", false)?;
        for line in lines {
            cg.set_knob("devices.allow", line, false)?;
        }
        Ok(())
    }
}

/// Net-classifier helpers.
pub mod net_cls {
    use super::{Cgroup, Result};

    /// Stamp the tclass handle packets from this cgroup are classified by.
    ///
    /// # Errors
    ///
    /// Returns the knob write error.
    pub fn set_classid(cg: &Cgroup, handle: u32) -> Result<()> {
        cg.set_knob("net_cls.classid", &handle.to_string(), false)
    }
}

/// An armed OOM notification: an eventfd registered with the kernel for a
/// memory cgroup.
#[derive(Debug)]
pub struct OomMonitor {
    efd: EventFd,
}

impl OomMonitor {
    /// Arm OOM notification on a memory leaf cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if the eventfd, the `memory.oom_control` open, or
    /// the `cgroup.event_control` registration fails.
    pub fn arm(memcg: &Cgroup) -> Result<Self> {
        let efd = EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)?;
        let control = std::fs::File::open(memcg.path().join("memory.oom_control"))?;
        let registration = format!("{} {}", efd.as_fd().as_raw_fd(), control.as_raw_fd());
        std::fs::write(memcg.path().join("cgroup.event_control"), registration)?;
        Ok(Self { efd })
    }

    /// The raw descriptor number, used as the event-loop key.
    #[must_use]
    pub fn raw_fd(&self) -> i32 {
        self.efd.as_fd().as_raw_fd()
    }

    /// Borrow the eventfd.
    #[must_use]
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.efd.as_fd()
    }

    /// Drain the counter; true when at least one OOM event fired.
    #[must_use]
    pub fn triggered(&self) -> bool {
        let mut buf = [0u8; 8];
        matches!(nix::unistd::read(self.efd.as_fd().as_raw_fd(), &mut buf), Ok(8))
    }
}

/// Total host RAM in bytes, from `/proc/meminfo`.
///
/// # Errors
///
/// Returns an error if meminfo cannot be read or parsed.
pub fn total_memory() -> Result<u64> {
    let text = std::fs::read_to_string("/proc/meminfo")?;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let kib: u64 = rest
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse()
                .map_err(|_| Error::unknown("bad MemTotal line in /proc/meminfo"))?;
            return Ok(kib * 1024);
        }
    }
    Err(Error::unknown("no MemTotal in /proc/meminfo"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(dir: &Path) -> Cgroup {
        Cgroup {
            controller: Controller::Memory,
            path: dir.to_path_buf(),
        }
    }

    #[test]
    fn test_knob_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cg = leaf(dir.path());
        std::fs::write(dir.path().join("memory.soft_limit_in_bytes"), "0\n").unwrap();

        memory::set_soft_limit(&cg, 1 << 20).unwrap();
        assert_eq!(memory::soft_limit(&cg).unwrap(), 1 << 20);
    }

    #[test]
    fn test_missing_knob_is_not_supported() {
        let dir = tempfile::tempdir().unwrap();
        let cg = leaf(dir.path());

        let err = cg.get_knob("memory.low_limit_in_bytes").unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotSupported);
        assert!(!cg.has_knob("memory.low_limit_in_bytes"));
    }

    #[test]
    fn test_tasks_parse_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cg = leaf(dir.path());
        std::fs::write(dir.path().join("tasks"), "12\n34\n").unwrap();

        let tasks = cg.tasks().unwrap();
        assert_eq!(tasks, vec![Pid::from_raw(12), Pid::from_raw(34)]);
        assert!(!cg.is_empty().unwrap());

        std::fs::write(dir.path().join("tasks"), "").unwrap();
        assert!(cg.is_empty().unwrap());
    }

    #[test]
    fn test_remove_refuses_non_empty() {
        let dir = tempfile::tempdir().unwrap();
        let parent = leaf(dir.path());
        let child = parent.child("sub");
        child.create().unwrap();
        std::fs::write(child.path().join("tasks"), "99\n").unwrap();

        let err = child.remove().unwrap_err();
        assert!(err.message.contains("not empty"));
        assert!(child.exists());

        // Removing a cgroup that is already gone is fine.
        assert!(parent.child("never-created").remove().is_ok());
    }

    #[test]
    fn test_require_missing_controller() {
        let layer = CgroupLayer::empty();
        let err = layer.require(Controller::Memory).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotSupported);
    }

    #[test]
    fn test_cpu_limit_zero_is_unlimited() {
        let dir = tempfile::tempdir().unwrap();
        let cg = Cgroup {
            controller: Controller::Cpu,
            path: dir.path().to_path_buf(),
        };
        std::fs::write(dir.path().join("cpu.cfs_quota_us"), "50000\n").unwrap();
        std::fs::write(dir.path().join("cpu.cfs_period_us"), "100000\n").unwrap();

        cpu::set_limit(&cg, 0).unwrap();
        assert_eq!(cg.get_knob("cpu.cfs_quota_us").unwrap(), "-1");

        cpu::set_limit(&cg, 50).unwrap();
        assert_eq!(cg.get_knob("cpu.cfs_quota_us").unwrap(), "50000");
    }
}
