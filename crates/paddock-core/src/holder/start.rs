//! Start: resource acquisition, task-environment assembly and the spawn.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::cgroup::{self, Controller, OomMonitor};
use crate::container::State;
use crate::error::{Error, Result};
use crate::event::EventLoop;
use crate::net::shaper::{tc_handle, ROOT_TC_MAJOR};
use crate::net::{NetCfg, Tclass};
use crate::property::defs::{self, names, VIRT_MODE_OS};
use crate::property::{PropCtx, PropFlags};
use crate::task::{spawn, NamespaceSnapshot, Task, TaskEnv};
use crate::{ContainerId, Cred, PADDOCK_ROOT_ID, ROOT_ID};

use super::Holder;

impl Holder {
    /// Start a container: meta when its effective command is empty, running
    /// otherwise.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` outside `Stopped`, `InvalidValue` for
    /// configuration contradictions, or the spawn error. All resources are
    /// unwound on failure.
    pub fn start(&mut self, name: &str, events: Option<&EventLoop>) -> Result<()> {
        let id = self.find(name)?;
        self.check_not_lost(id)?;
        if id == ROOT_ID || id == PADDOCK_ROOT_ID {
            return Err(Error::invalid_state("permanent containers are always running"));
        }
        self.acquire(id)?;
        let result = self.start_acquired(id, events, false);
        self.release(id);

        if let Err(e) = &result {
            let errno = e.errno();
            if let Ok(container) = self.require_mut(id) {
                container.start_errno = errno;
            }
            self.persist_marker(id, "start_errno", &errno.to_string());
        }
        result
    }

    fn start_acquired(
        &mut self,
        id: ContainerId,
        events: Option<&EventLoop>,
        force_meta: bool,
    ) -> Result<()> {
        let state = self.state_of(id)?;
        if state != State::Stopped {
            return Err(Error::invalid_state(format!("invalid container state {state}")));
        }

        self.start_stopped_ancestors(id, events)?;

        // OS-mode containers of unprivileged owners fall back to the
        // canned defaults for the sensitive properties.
        if self.effective_value(id, names::VIRT_MODE).as_str() == VIRT_MODE_OS
            && self.owner_uid(id) != 0
        {
            let os_props: Vec<&'static str> = self
                .registry()
                .props()
                .iter()
                .filter(|p| p.has_flags(PropFlags::OS_MODE))
                .map(|p| p.name)
                .collect();
            for prop in os_props {
                self.require_mut(id)?.props.reset(prop);
            }
        }

        let command = self.effective_value(id, names::COMMAND).as_str().to_string();
        let meta = force_meta || command.is_empty();

        let root = self.effective_value(id, names::ROOT).as_str().to_string();
        if root == "/" && self.effective_value(id, names::ROOT_RDONLY).as_bool() {
            return Err(Error::invalid_value("can't make / read-only"));
        }

        // Re-validate every explicit value now that the full property
        // picture exists; set order must not hide a violation.
        let explicit: Vec<(&'static str, crate::property::Value)> = self
            .require(id)?
            .props
            .iter()
            .map(|(name, value)| (name, value.clone()))
            .collect();
        for (prop, value) in &explicit {
            if let Some(check) = self.registry().require(prop)?.check {
                let ctx = PropCtx::internal(self, id);
                check(&ctx, value)?;
            }
        }

        info!(container = %self.name_of(id), %id, meta, "start");

        {
            let container = self.require_mut(id)?;
            container.respawn_count = 0;
            container.exit_status = -1;
            container.oom_killed = false;
            container.start_time_ms = crate::current_time_ms();
        }
        self.persist_marker(id, "respawn_count", "0");
        self.persist_marker(id, "exit_status", "-1");
        self.persist_marker(id, "oom_killed", "false");
        self.persist_marker(id, "raw_start_time", &crate::current_time_ms().to_string());

        self.prepare_resources(id, events)?;

        if !meta {
            if let Err(e) = self.spawn_task(id) {
                error!(container = %self.name_of(id), error = %e, "can't start task");
                self.free_resources(id);
                return Err(e);
            }
        }

        self.set_state(id, if meta { State::Meta } else { State::Running });
        self.persist_marker(id, "start_errno", "-1");
        if let Ok(container) = self.require_mut(id) {
            container.start_errno = -1;
        }
        Ok(())
    }

    /// Bring every stopped ancestor up as a meta container, topmost first.
    fn start_stopped_ancestors(
        &mut self,
        id: ContainerId,
        events: Option<&EventLoop>,
    ) -> Result<()> {
        let mut chain = Vec::new();
        let mut cursor = self.require(id)?.parent;
        while let Some(parent) = cursor {
            let container = self.require(parent)?;
            if container.is_root() || container.is_paddock_root() {
                break;
            }
            if container.state == State::Stopped {
                chain.push(parent);
            }
            cursor = container.parent;
        }
        for parent in chain.into_iter().rev() {
            info!(container = %self.name_of(parent), "starting parent as meta");
            self.start_acquired(parent, events, true)?;
        }
        Ok(())
    }

    fn prepare_resources(&mut self, id: ContainerId, events: Option<&EventLoop>) -> Result<()> {
        if let Err(e) = self.prepare_network(id) {
            error!(container = %self.name_of(id), error = %e, "can't prepare network");
            self.free_resources(id);
            return Err(e);
        }
        if let Err(e) = self.prepare_cgroups(id, events) {
            error!(container = %self.name_of(id), error = %e, "can't prepare cgroups");
            self.free_resources(id);
            return Err(e);
        }
        Ok(())
    }

    /// Create (or share) the traffic class.
    fn prepare_network(&mut self, id: ContainerId) -> Result<()> {
        if !self.network_enabled() {
            return Ok(());
        }

        if self.use_parent_namespace(id) {
            let parent = self.require(id)?.parent.unwrap_or(PADDOCK_ROOT_ID);
            let shared = self.require(parent)?.tclass.clone();
            self.require_mut(id)?.tclass = shared;
            return Ok(());
        }

        let parent = self.require(id)?.parent.unwrap_or(PADDOCK_ROOT_ID);
        let parent_handle = self
            .require(parent)?
            .tclass
            .as_ref()
            .map_or(tc_handle(ROOT_TC_MAJOR, PADDOCK_ROOT_ID.0), |t| t.handle());

        let tclass = Tclass::new(
            parent_handle,
            tc_handle(ROOT_TC_MAJOR, id.0),
            self.effective_value(id, names::NET_PRIORITY).as_uint_map(),
            self.effective_value(id, names::NET_GUARANTEE).as_uint_map(),
            self.effective_value(id, names::NET_LIMIT).as_uint_map(),
        );
        self.with_net(|net| tclass.create(net))
            .transpose()
            .map_err(|e| {
                error!(error = %e, "can't create tclass");
                e
            })?;
        self.require_mut(id)?.tclass = Some(Arc::new(tclass));
        Ok(())
    }

    fn prepare_cgroups(&mut self, id: ContainerId, events: Option<&EventLoop>) -> Result<()> {
        for controller in Controller::ALL {
            if self.cgroups().get(controller).is_none() {
                continue;
            }
            self.leaf_cgroup(id, controller)?.create()?;
        }

        if self.network_enabled() && self.cgroups().get(Controller::NetCls).is_some() {
            if let Some(handle) = self.require(id)?.tclass.as_ref().map(|t| t.handle()) {
                let cg = self.leaf_cgroup(id, Controller::NetCls)?;
                cgroup::net_cls::set_classid(&cg, handle)?;
            }
        }

        if id != ROOT_ID {
            self.apply_dynamic_properties(id)?;
        }

        if id != ROOT_ID && id != PADDOCK_ROOT_ID {
            if self.cgroups().get(Controller::Memory).is_some() {
                let memcg = self.leaf_cgroup(id, Controller::Memory)?;
                let monitor = OomMonitor::arm(&memcg)?;
                if let Some(events) = events {
                    events.add_oom(monitor.fd())?;
                }
                self.require_mut(id)?.oom = Some(monitor);
            }
            if self.cgroups().get(Controller::Devices).is_some() {
                let devcg = self.leaf_cgroup(id, Controller::Devices)?;
                let allowed = self.effective_value(id, names::ALLOWED_DEVICES);
                cgroup::devices::apply(&devcg, allowed.as_list())?;
            }
        }
        Ok(())
    }

    /// Push the dynamic (runtime-changeable) properties into the kernel.
    pub(crate) fn apply_dynamic_properties(&mut self, id: ContainerId) -> Result<()> {
        if let Some(_memory) = self.cgroups().get(Controller::Memory) {
            let cg = self.leaf_cgroup(id, Controller::Memory)?;
            if cg.exists() {
                if let Err(e) = cgroup::memory::set_use_hierarchy(&cg, true) {
                    // Tolerated: flips only on stale kernels with children
                    // already attached.
                    warn!(error = %e, "can't set memory.use_hierarchy");
                }
                if cg.has_knob(cgroup::MEMORY_GUARANTEE_KNOB) {
                    let guarantee = self.effective_value(id, names::MEMORY_GUARANTEE).as_uint();
                    cgroup::memory::set_guarantee(&cg, guarantee)?;
                }
                let limit = self.effective_value(id, names::MEMORY_LIMIT).as_uint();
                if let Err(e) = cgroup::memory::set_limit(&cg, limit) {
                    if e.errno() == libc::EBUSY {
                        return Err(Error::invalid_value("memory_limit is too low"));
                    }
                    return Err(e);
                }
                if cg.has_knob("memory.recharge_on_pgfault") {
                    let on = self
                        .effective_value(id, names::RECHARGE_ON_PGFAULT)
                        .as_bool();
                    cgroup::memory::set_recharge_on_pgfault(&cg, on)?;
                }
                if cg.has_knob("memory.fs_bps_limit") {
                    let io = self.effective_value(id, names::IO_LIMIT).as_uint();
                    cgroup::memory::set_io_limit(&cg, io)?;
                }
            }
        }

        if self.cgroups().get(Controller::Cpu).is_some() {
            let cg = self.leaf_cgroup(id, Controller::Cpu)?;
            if cg.exists() {
                let policy = self.effective_value(id, names::CPU_POLICY).as_str().to_string();
                cgroup::cpu::set_policy(&cg, &policy)?;
                if policy == "normal" {
                    let limit = self.effective_value(id, names::CPU_LIMIT).as_uint();
                    cgroup::cpu::set_limit(&cg, limit)?;
                    let guarantee = self.effective_value(id, names::CPU_GUARANTEE).as_uint();
                    cgroup::cpu::set_guarantee(&cg, guarantee)?;
                }
            }
        }

        if self.cgroups().get(Controller::Blkio).is_some() {
            let cg = self.leaf_cgroup(id, Controller::Blkio)?;
            if cg.exists() {
                let batch = self.effective_value(id, names::IO_POLICY).as_str() == "batch";
                cgroup::blkio::set_policy(&cg, batch)?;
            }
        }
        Ok(())
    }

    fn spawn_task(&mut self, id: ContainerId) -> Result<()> {
        // Image-backed roots take a loop device first.
        let root = PathBuf::from(self.effective_value(id, names::ROOT).as_str());
        if root.is_file() {
            let loop_dev = crate::loopdev::acquire(&root)?;
            self.require_mut(id)?.loop_dev = loop_dev;
            self.persist_marker(id, "raw_loop_dev", &loop_dev.to_string());
        }

        let env = self.prepare_task_env(id)?;
        let task = match &self.net {
            Some(net) => {
                let net = net.lock().expect("network lock poisoned");
                spawn::start(&env, Some(&*net))?
            }
            None => spawn::start(&env, None)?,
        };

        info!(container = %self.name_of(id), pid = %task.pid(), "started");
        self.persist_marker(id, "raw_root_pid", &task.pid().as_raw().to_string());
        self.require_mut(id)?.task = Some(task);
        Ok(())
    }

    /// Freeze the property picture into a `TaskEnv`.
    pub(crate) fn prepare_task_env(&mut self, id: ContainerId) -> Result<TaskEnv> {
        let isolate = self.effective_value(id, names::ISOLATE).as_bool();
        if !isolate {
            for def in self.registry().props() {
                if def.has_flags(PropFlags::PARENT_RO) && self.has_explicit_value(id, def.name) {
                    return Err(Error::invalid_value(format!(
                        "Can't use custom {} with isolate == false",
                        def.name
                    )));
                }
            }
        }

        let full_name = self.name_of(id);
        let os_mode = self.effective_value(id, names::VIRT_MODE).as_str() == VIRT_MODE_OS;
        let owner = self.require(id)?.owner.clone();

        let cred = if os_mode {
            Cred::root()
        } else {
            let user = self.effective_value(id, names::USER).as_str().to_string();
            let group = self.effective_value(id, names::GROUP).as_str().to_string();
            Cred {
                uid: defs::resolve_user(&user)?,
                gid: defs::resolve_group(&group)?,
                groups: owner.groups.clone(),
            }
        };

        let root_prop = PathBuf::from(self.effective_value(id, names::ROOT).as_str());
        let loop_dev = self.require(id)?.loop_dev;
        let root = if loop_dev >= 0 {
            self.container_tmp_dir(&full_name)
        } else {
            root_prop.clone()
        };

        let cwd = PathBuf::from(self.effective_value(id, names::CWD).as_str());
        // Containers on the host root get their scratch cwd made for them.
        if !self.has_explicit_value(id, names::ROOT)
            && !self.has_explicit_value(id, names::CWD)
            && !self.use_parent_namespace(id)
        {
            std::fs::create_dir_all(&cwd)?;
            let _ = nix::unistd::chown(
                &cwd,
                Some(nix::unistd::Uid::from_raw(cred.uid)),
                Some(nix::unistd::Gid::from_raw(cred.gid)),
            );
        }

        let mut env_vars = self.effective_value(id, names::ENV).as_list().to_vec();
        let user_name = self.effective_value(id, names::USER).as_str().to_string();
        let defaults = [
            (
                "PATH",
                "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
            ),
            ("container", "paddock".to_string()),
            ("PADDOCK_NAME", full_name.clone()),
            (
                "PADDOCK_HOST",
                nix::unistd::gethostname()
                    .map(|h| h.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            ),
            ("HOME", cwd.to_string_lossy().into_owned()),
            ("USER", user_name),
        ];
        for (key, value) in defaults {
            if !env_vars.iter().any(|e| e.starts_with(&format!("{key}="))) {
                env_vars.push(format!("{key}={value}"));
            }
        }

        let stdin_path = PathBuf::from(self.effective_value(id, names::STDIN_PATH).as_str());
        let stdout_path = PathBuf::from(self.effective_value(id, names::STDOUT_PATH).as_str());
        let stderr_path = PathBuf::from(self.effective_value(id, names::STDERR_PATH).as_str());
        for path in [&stdout_path, &stderr_path] {
            prepare_stdio_file(path, &cred)?;
        }

        let binds =
            defs::parse_binds(self.effective_value(id, names::BIND).as_list())?;

        let cap_names = self.effective_value(id, names::CAPABILITIES);
        let mut cap_limit = Vec::new();
        for cap in cap_names.as_list() {
            let cap: caps::Capability = format!("CAP_{cap}")
                .parse()
                .map_err(|_| Error::invalid_value(format!("Unsupported capability {cap}")))?;
            cap_limit.push(cap);
        }
        let cap_ambient = cap_limit.clone();

        let rlimits = defs::parse_ulimits(self.effective_value(id, names::ULIMIT).as_list())?;

        let net = if self.network_enabled() {
            defs::parse_net_cfg(
                self.effective_value(id, names::NET).as_list(),
                &self.link_names(),
                id.0,
            )?
        } else {
            NetCfg::host_shared()
        };
        let ip = defs::parse_ip_specs(self.effective_value(id, names::IP).as_list())?;
        let default_gw = self
            .effective_value(id, names::DEFAULT_GW)
            .as_str()
            .parse()
            .ok();

        let mut cgroup_paths = Vec::new();
        for controller in Controller::ALL {
            if self.cgroups().get(controller).is_some() {
                cgroup_paths.push(self.leaf_cgroup(id, controller)?.path().to_path_buf());
            }
        }

        let parent_ns = if !isolate {
            match self.find_running_parent(id) {
                Some(parent) => {
                    let pid = self
                        .require(parent)?
                        .task
                        .as_ref()
                        .map(Task::pid)
                        .ok_or_else(|| Error::invalid_state("running parent has no task"))?;
                    NamespaceSnapshot::open(pid, &[])?
                }
                None => NamespaceSnapshot::default(),
            }
        } else {
            NamespaceSnapshot::default()
        };

        let root_rdonly = self.effective_value(id, names::ROOT_RDONLY).as_bool();
        let new_mount_ns = isolate || root_rdonly || !binds.is_empty() || loop_dev >= 0;

        Ok(TaskEnv {
            container: full_name,
            command: self.effective_value(id, names::COMMAND).as_str().to_string(),
            cwd,
            root,
            root_rdonly,
            env: env_vars,
            isolate,
            stdin_path,
            stdout_path,
            stderr_path,
            hostname: self.effective_value(id, names::HOSTNAME).as_str().to_string(),
            bind_dns: self.effective_value(id, names::BIND_DNS).as_bool(),
            bind_mounts: binds,
            net,
            ip,
            default_gw,
            cap_limit,
            cap_ambient,
            rlimits,
            cgroup_paths,
            cred,
            loop_dev,
            parent_ns,
            new_mount_ns,
        })
    }

    fn container_tmp_dir(&self, full_name: &str) -> PathBuf {
        self.config()
            .container
            .tmp_dir
            .join(full_name.replace('/', "_"))
    }
}

/// Create a stdio file owned by the task credentials, leaving device nodes
/// alone.
fn prepare_stdio_file(path: &Path, cred: &Cred) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::File::create(path)?;
    let _ = nix::unistd::chown(
        path,
        Some(nix::unistd::Uid::from_raw(cred.uid)),
        Some(nix::unistd::Gid::from_raw(cred.gid)),
    );
    Ok(())
}
