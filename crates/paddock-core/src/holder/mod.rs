//! Holder: the container table and every operation that spans the tree.
//!
//! The holder owns a dense table indexed by numeric id; containers store
//! their parent id and children are derived from a secondary index, so the
//! object graph has no reference cycles. The daemon serializes mutating
//! operations behind the mutex wrapping the holder; the per-container
//! `acquired` flag additionally excludes concurrent structural changes to
//! a subtree, and the network lock lives inside. Lock order is holder,
//! then container, then network, never reversed.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{mpsc, Arc, Mutex};

use nix::sys::signal::Signal;
use tracing::{error, info, warn};

use crate::cgroup::{self, Cgroup, CgroupLayer, Controller, OomMonitor};
use crate::config::DaemonConfig;
use crate::container::{Container, State, WaitEvent};
use crate::error::{Error, ErrorKind, Result};
use crate::event::{Event, EventLoop};
use crate::kv::{pair, KvStore};
use crate::net::shaper::{tc_handle, ROOT_TC_MAJOR};
use crate::net::{Network, Tclass, TclassStat};
use crate::property::defs::names;
use crate::property::{
    self, alias_value_in, alias_value_out, parse_indexed_name, resolve_alias, PropCtx, PropFlags,
    Registry, Value,
};
use crate::task::{self, Task};
use crate::{ContainerId, Cred, PADDOCK_ROOT_ID, ROOT_ID};

mod restore;
mod start;

/// The container table and its indexes.
pub struct Holder {
    config: DaemonConfig,
    registry: Registry,
    cgroups: CgroupLayer,
    kv: KvStore,
    net: Option<Mutex<Network>>,
    slots: Vec<Option<Container>>,
    names: HashMap<String, ContainerId>,
    children: HashMap<ContainerId, Vec<ContainerId>>,
}

impl Holder {
    /// Build a holder with the two permanent containers in place.
    ///
    /// # Errors
    ///
    /// Returns an error only from index bookkeeping; the permanent
    /// containers cannot conflict.
    pub fn new(
        config: DaemonConfig,
        cgroups: CgroupLayer,
        kv: KvStore,
        net: Option<Network>,
    ) -> Result<Self> {
        let mut holder = Self {
            config,
            registry: Registry::standard(),
            cgroups,
            kv,
            net: net.map(Mutex::new),
            slots: Vec::new(),
            names: HashMap::new(),
            children: HashMap::new(),
        };

        let mut root = Container::new(ROOT_ID, "/".to_string(), None, Cred::root());
        root.state = State::Meta;
        let mut paddock_root = Container::new(
            PADDOCK_ROOT_ID,
            "/paddock".to_string(),
            Some(ROOT_ID),
            Cred::root(),
        );
        paddock_root.state = State::Meta;

        if holder.net.is_some() {
            root.tclass = Some(Arc::new(Tclass::new(
                tc_handle(ROOT_TC_MAJOR, 0),
                tc_handle(ROOT_TC_MAJOR, ROOT_ID.0),
                Default::default(),
                Default::default(),
                Default::default(),
            )));
            paddock_root.tclass = Some(Arc::new(Tclass::new(
                tc_handle(ROOT_TC_MAJOR, ROOT_ID.0),
                tc_handle(ROOT_TC_MAJOR, PADDOCK_ROOT_ID.0),
                Default::default(),
                Default::default(),
                Default::default(),
            )));
        }

        holder.insert(root)?;
        holder.insert(paddock_root)?;
        Ok(holder)
    }

    // Accessors shared with the property layer.

    /// The daemon configuration.
    #[must_use]
    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// The property and data registry.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The cgroup layer.
    #[must_use]
    pub fn cgroups(&self) -> &CgroupLayer {
        &self.cgroups
    }

    /// Whether the shaper is connected.
    #[must_use]
    pub fn network_enabled(&self) -> bool {
        self.net.is_some()
    }

    /// Names of the currently shaped links.
    #[must_use]
    pub fn link_names(&self) -> Vec<String> {
        self.net.as_ref().map_or_else(Vec::new, |net| {
            net.lock()
                .expect("network lock poisoned")
                .links()
                .iter()
                .map(|l| l.name.clone())
                .collect()
        })
    }

    fn with_net<T>(&self, f: impl FnOnce(&mut Network) -> T) -> Option<T> {
        self.net
            .as_ref()
            .map(|net| f(&mut net.lock().expect("network lock poisoned")))
    }

    // Table plumbing.

    fn insert(&mut self, container: Container) -> Result<()> {
        let id = container.id;
        let full = self.compose_name(&container);
        if self.names.contains_key(&full) {
            return Err(Error::new(
                ErrorKind::ContainerAlreadyExists,
                format!("container {full} already exists"),
            ));
        }
        let index = id.index();
        if self.slots.len() <= index {
            self.slots.resize_with(index + 1, || None);
        }
        if let Some(parent) = container.parent {
            self.children.entry(parent).or_default().push(id);
        }
        self.names.insert(full, id);
        self.slots[index] = Some(container);
        Ok(())
    }

    fn compose_name(&self, container: &Container) -> String {
        match container.parent {
            None => container.name.clone(),
            Some(parent) if parent == PADDOCK_ROOT_ID => container.name.clone(),
            Some(parent) => format!("{}/{}", self.name_of(parent), container.name),
        }
    }

    fn alloc_id(&self) -> ContainerId {
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.is_none() && index >= 2 {
                return ContainerId(index as u16 + 1);
            }
        }
        ContainerId(self.slots.len() as u16 + 1)
    }

    /// The container behind `id`.
    ///
    /// # Errors
    ///
    /// Returns `ContainerDoesNotExist` for a free slot.
    pub fn require(&self, id: ContainerId) -> Result<&Container> {
        self.slots
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::new(ErrorKind::ContainerDoesNotExist, format!("no container {id}")))
    }

    fn require_mut(&mut self, id: ContainerId) -> Result<&mut Container> {
        self.slots
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or_else(|| Error::new(ErrorKind::ContainerDoesNotExist, format!("no container {id}")))
    }

    /// Resolve a full name to an id.
    ///
    /// # Errors
    ///
    /// Returns `ContainerDoesNotExist` for unknown names.
    pub fn find(&self, name: &str) -> Result<ContainerId> {
        self.names.get(name).copied().ok_or_else(|| {
            Error::new(
                ErrorKind::ContainerDoesNotExist,
                format!("container {name} doesn't exist"),
            )
        })
    }

    /// Full (slash-separated) name of `id`.
    #[must_use]
    pub fn name_of(&self, id: ContainerId) -> String {
        match self.slots.get(id.index()).and_then(Option::as_ref) {
            Some(container) => self.compose_name(container),
            None => String::new(),
        }
    }

    /// Owner uid of `id`, 0 for free slots.
    #[must_use]
    pub fn owner_uid(&self, id: ContainerId) -> u32 {
        self.require(id).map_or(0, |c| c.owner.uid)
    }

    /// Owner gid of `id`, 0 for free slots.
    #[must_use]
    pub fn owner_gid(&self, id: ContainerId) -> u32 {
        self.require(id).map_or(0, |c| c.owner.gid)
    }

    /// State of `id`.
    ///
    /// # Errors
    ///
    /// Returns `ContainerDoesNotExist` for a free slot.
    pub fn state_of(&self, id: ContainerId) -> Result<State> {
        Ok(self.require(id)?.state)
    }

    /// Child ids of `id`, in creation order.
    #[must_use]
    pub fn children_of(&self, id: ContainerId) -> Vec<ContainerId> {
        self.children.get(&id).cloned().unwrap_or_default()
    }

    /// All user containers, sorted by full name.
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .names
            .keys()
            .filter(|n| n.as_str() != "/" && n.as_str() != "/paddock")
            .cloned()
            .collect();
        names.sort();
        names
    }

    // Property resolution.

    /// Whether the container has an explicit value for `name`.
    #[must_use]
    pub fn has_explicit_value(&self, id: ContainerId, name: &str) -> bool {
        self.require(id).map_or(false, |c| c.props.has_value(name))
    }

    /// Effective value of a property: explicit, parent-delegated, or the
    /// declared default.
    #[must_use]
    pub fn effective_value(&self, id: ContainerId, name: &str) -> Value {
        let Some(def) = self.registry.find(name) else {
            return Value::Str(String::new());
        };
        if let Ok(container) = self.require(id) {
            if let Some(value) = container.props.get(name) {
                return value.clone();
            }
            if def.has_flags(PropFlags::PARENT_DEF) && self.use_parent_namespace(id) {
                if let Some(parent) = container.parent {
                    return self.effective_value(parent, name);
                }
            }
        }
        let ctx = PropCtx::internal(self, id);
        (def.default)(&ctx)
    }

    /// Whether the container shares its running ancestor's namespaces.
    #[must_use]
    pub fn use_parent_namespace(&self, id: ContainerId) -> bool {
        if self.effective_value(id, names::ISOLATE).as_bool() {
            return false;
        }
        self.find_running_parent(id).is_some()
    }

    fn find_running_parent(&self, id: ContainerId) -> Option<ContainerId> {
        let mut cursor = self.require(id).ok()?.parent;
        while let Some(pid) = cursor {
            let parent = self.require(pid).ok()?;
            if parent.task.as_ref().is_some_and(Task::is_running) {
                return Some(pid);
            }
            cursor = parent.parent;
        }
        None
    }

    /// Sum of a hierarchical property over the children of `id`. A child
    /// without its own value contributes the sum of its own children.
    #[must_use]
    pub fn children_sum(
        &self,
        id: ContainerId,
        prop: &str,
        except: Option<ContainerId>,
        except_value: u64,
    ) -> u64 {
        let mut total = 0;
        for child in self.children_of(id) {
            if Some(child) == except {
                total += except_value;
                continue;
            }
            let value = self.effective_value(child, prop).as_uint();
            if value > 0 {
                total += value;
            } else {
                total += self.children_sum(child, prop, except, except_value);
            }
        }
        total
    }

    /// Sum of guarantees over the whole tree with `except`'s candidate
    /// value substituted.
    #[must_use]
    pub fn guarantee_sum(&self, prop: &str, except: ContainerId, except_value: u64) -> u64 {
        self.children_sum(ROOT_ID, prop, Some(except), except_value)
    }

    /// The hierarchical invariant: children fit below, ancestors bound
    /// above, and siblings plus the candidate fit into the parent.
    #[must_use]
    pub fn valid_hierarchical(&self, id: ContainerId, prop: &str, value: u64) -> bool {
        let children = self.children_sum(id, prop, None, 0);
        if children > 0 && value < children {
            return false;
        }

        let mut cursor = self.require(id).ok().and_then(|c| c.parent);
        while let Some(parent) = cursor {
            let bound = self.effective_value(parent, prop).as_uint();
            if bound > 0 && value > bound {
                return false;
            }
            cursor = self.require(parent).ok().and_then(|c| c.parent);
        }

        if let Some(parent) = self.require(id).ok().and_then(|c| c.parent) {
            let bound = self.effective_value(parent, prop).as_uint();
            let siblings = self.children_sum(parent, prop, Some(id), value);
            if bound > 0 && siblings > bound {
                return false;
            }
        }
        true
    }

    // Cgroup plumbing.

    /// Leaf cgroup of `id` under `controller`.
    ///
    /// # Errors
    ///
    /// Returns `NotSupported` when the controller is not mounted.
    pub fn leaf_cgroup(&self, id: ContainerId, controller: Controller) -> Result<Cgroup> {
        let subsystem = self.cgroups.require(controller)?;
        if id == ROOT_ID {
            return Ok(subsystem.host_root());
        }
        if id == PADDOCK_ROOT_ID {
            return Ok(subsystem.root());
        }
        let container = self.require(id)?;
        let parent = container.parent.unwrap_or(PADDOCK_ROOT_ID);
        Ok(self.leaf_cgroup(parent, controller)?.child(&container.name))
    }

    /// Read one traffic counter for `id` on every link.
    ///
    /// # Errors
    ///
    /// Returns `NotSupported` without a network, `InvalidState` without a
    /// class.
    pub fn tclass_stats(
        &self,
        id: ContainerId,
        stat: TclassStat,
    ) -> Result<std::collections::BTreeMap<String, u64>> {
        let tclass = self
            .require(id)?
            .tclass
            .clone()
            .ok_or_else(|| Error::invalid_state("container has no traffic class"))?;
        self.with_net(|net| tclass.stats(net, stat))
            .ok_or_else(|| Error::not_supported("network is disabled"))?
    }

    // Acquisition (recursive over ancestors).

    fn is_acquired(&self, id: ContainerId) -> bool {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            match self.require(current) {
                Ok(container) => {
                    if container.acquired {
                        return true;
                    }
                    cursor = container.parent;
                }
                Err(_) => return false,
            }
        }
        false
    }

    fn acquire(&mut self, id: ContainerId) -> Result<()> {
        if self.is_acquired(id) {
            return Err(Error::invalid_state(format!(
                "container {} is busy",
                self.name_of(id)
            )));
        }
        self.require_mut(id)?.acquired = true;
        Ok(())
    }

    fn release(&mut self, id: ContainerId) {
        if let Ok(container) = self.require_mut(id) {
            container.acquired = false;
        }
    }

    // State bookkeeping.

    fn update_running_children(&mut self, id: ContainerId, diff: i64) {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let Ok(container) = self.require_mut(current) else {
                break;
            };
            container.running_children =
                (container.running_children as i64 + diff).max(0) as usize;
            cursor = container.parent;
        }
    }

    pub(crate) fn set_state(&mut self, id: ContainerId, new_state: State) {
        let Ok(container) = self.require(id) else {
            return;
        };
        let old = container.state;
        if old == new_state {
            return;
        }
        if !old.can_transition(new_state) {
            warn!(container = %self.name_of(id), %old, %new_state, "unexpected state transition");
        }
        info!(container = %self.name_of(id), %old, %new_state, "state change");

        if new_state == State::Running {
            self.update_running_children(id, 1);
        } else if old == State::Running {
            self.update_running_children(id, -1);
        }

        let full_name = self.name_of(id);
        if let Ok(container) = self.require_mut(id) {
            container.state = new_state;
            container.notify_waiters(&full_name);
        }
        self.persist_marker(id, "state", &new_state.to_string());

        if let Err(e) = self.update_soft_limit(id) {
            warn!(container = %full_name, error = %e, "cannot update meta soft limit");
        }
    }

    /// Adjust memory soft limits of Meta ancestors: the kernel default
    /// while the subtree has running containers, 1 MiB once it idles.
    fn update_soft_limit(&mut self, id: ContainerId) -> Result<()> {
        let Some(memory) = self.cgroups.get(Controller::Memory) else {
            return Ok(());
        };
        let default_limit = cgroup::memory::soft_limit(&memory.host_root())?;

        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let container = self.require(current)?;
            cursor = container.parent;
            if container.is_root() || container.is_paddock_root() {
                continue;
            }
            if container.state != State::Meta {
                continue;
            }
            let limit = if container.running_children > 0 {
                default_limit
            } else {
                1 << 20
            };
            let cg = self.leaf_cgroup(current, Controller::Memory)?;
            if cg.exists() && cgroup::memory::soft_limit(&cg)? != limit {
                cgroup::memory::set_soft_limit(&cg, limit)?;
            }
        }
        Ok(())
    }

    // Persistence.

    fn persist_marker(&self, id: ContainerId, key: &str, value: &str) {
        if id == ROOT_ID || id == PADDOCK_ROOT_ID {
            return;
        }
        if let Err(e) = self.kv.append(id, vec![pair(key, value)]) {
            error!(%id, key, error = %e, "cannot persist marker");
        }
    }

    // Create / destroy.

    /// Create a stopped container.
    ///
    /// # Errors
    ///
    /// Returns `InvalidValue` for bad names, `ContainerAlreadyExists` for
    /// duplicates and `ContainerDoesNotExist` for a missing parent.
    pub fn create(&mut self, name: &str, owner: Cred) -> Result<ContainerId> {
        validate_name(name)?;
        if self.names.contains_key(name) {
            return Err(Error::new(
                ErrorKind::ContainerAlreadyExists,
                format!("container {name} already exists"),
            ));
        }

        let (parent, leaf) = match name.rsplit_once('/') {
            Some((parent_name, leaf)) => (self.find(parent_name)?, leaf.to_string()),
            None => (PADDOCK_ROOT_ID, name.to_string()),
        };

        let id = self.alloc_id();
        info!(container = name, %id, uid = owner.uid, gid = owner.gid, "create");

        let container = Container::new(id, leaf, Some(parent), owner.clone());
        self.insert(container)?;

        self.kv.remove(id).ok();
        self.persist_marker(id, "raw_name", name);
        self.persist_marker(id, "owner_uid", &owner.uid.to_string());
        self.persist_marker(id, "owner_gid", &owner.gid.to_string());
        self.persist_marker(id, "state", &State::Stopped.to_string());
        Ok(id)
    }

    /// Destroy a container and its subtree, children first.
    ///
    /// # Errors
    ///
    /// Returns `ContainerDoesNotExist` for unknown names, `Permission` for
    /// the permanent containers, or the first teardown error.
    pub fn destroy(&mut self, name: &str) -> Result<()> {
        let id = self.find(name)?;
        if id == ROOT_ID || id == PADDOCK_ROOT_ID {
            return Err(Error::permission(format!("can't destroy container {name}")));
        }
        self.acquire(id)?;
        let result = self.destroy_subtree(id);
        if result.is_err() {
            self.release(id);
        }
        result
    }

    fn destroy_subtree(&mut self, id: ContainerId) -> Result<()> {
        for child in self.children_of(id) {
            self.destroy_subtree(child)?;
        }
        info!(container = %self.name_of(id), %id, "destroy");

        if self.state_of(id)? == State::Paused {
            self.resume_subtree(id)?;
        }
        if self.require(id)?.task.as_ref().is_some_and(Task::is_running) {
            let _ = self.kill_all(id);
        }
        if self.state_of(id)? != State::Stopped {
            self.stop_one(id)?;
        }

        if let Err(e) = self.kv.remove(id) {
            warn!(%id, error = %e, "cannot remove kv node");
        }
        if let Some(tclass) = self.require_mut(id)?.tclass.take() {
            if let Ok(tclass) = Arc::try_unwrap(tclass) {
                self.with_net(|net| tclass.remove(net));
            }
        }

        let full = self.name_of(id);
        self.names.remove(&full);
        if let Some(parent) = self.require(id)?.parent {
            if let Some(kids) = self.children.get_mut(&parent) {
                kids.retain(|k| *k != id);
            }
        }
        self.children.remove(&id);
        self.slots[id.index()] = None;
        Ok(())
    }

    // Stop / pause / resume / kill.

    /// Stop a container and its descendants.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` when already stopped, or the stop error.
    pub fn stop(&mut self, name: &str) -> Result<()> {
        let id = self.find(name)?;
        self.check_not_lost(id)?;
        if self.state_of(id)? == State::Stopped {
            return Err(Error::invalid_state("invalid container state stopped"));
        }
        self.stop_children(id);
        self.stop_one(id)
    }

    fn stop_children(&mut self, id: ContainerId) {
        for child in self.children_of(id) {
            self.stop_children(child);
            if self.state_of(child).map_or(false, |s| s != State::Stopped) {
                if let Err(e) = self.stop_one(child) {
                    error!(container = %self.name_of(child), error = %e, "can't stop child");
                }
            }
        }
    }

    fn stop_one(&mut self, id: ContainerId) -> Result<()> {
        let state = self.state_of(id)?;
        if state == State::Stopped {
            return Ok(());
        }
        info!(container = %self.name_of(id), %id, "stop");

        if state == State::Paused {
            if let Ok(cg) = self.leaf_cgroup(id, Controller::Freezer) {
                let _ = cgroup::unfreeze(&cg);
            }
        }

        self.require_mut(id)?.oom = None;

        if self.require(id)?.task.as_ref().is_some_and(Task::is_running) {
            self.kill_all(id)?;

            let cg = self.leaf_cgroup(id, Controller::Freezer).ok();
            let pid = self.require(id)?.task.as_ref().map(Task::pid);
            let timeout = self.config.container.stop_timeout;
            let stuck = crate::sleep_while(timeout, || {
                if let Some(cg) = &cg {
                    if cg.is_empty().unwrap_or(true) {
                        return false;
                    }
                }
                pid.is_some_and(|p| nix::sys::signal::kill(p, None::<Signal>).is_ok())
            });
            if stuck {
                error!(container = %self.name_of(id), "can't wait for container to stop");
                return Err(Error::unknown(format!(
                    "Container didn't stop in {}ms",
                    timeout.as_millis()
                )));
            }
            if let Some(task) = &mut self.require_mut(id)?.task {
                task.deliver_exit(-1);
            }
        }

        let permanent = id == ROOT_ID || id == PADDOCK_ROOT_ID;
        if !permanent {
            self.set_state(id, State::Stopped);
            self.free_resources(id);
        }
        Ok(())
    }

    /// SIGTERM, a bounded grace period, then a frozen SIGKILL.
    fn kill_all(&mut self, id: ContainerId) -> Result<()> {
        let cg = self.leaf_cgroup(id, Controller::Freezer)?;
        info!(container = %self.name_of(id), "kill all");

        if cg.kill(Signal::SIGTERM).is_ok() {
            let timeout = self.config.container.kill_timeout;
            let expired = crate::sleep_while(timeout, || !cg.is_empty().unwrap_or(true));
            if expired {
                info!(container = %self.name_of(id), "didn't exit via SIGTERM, sending SIGKILL");
            }
        }

        // Freeze so nothing escapes the final sweep.
        if let Err(e) = cgroup::freeze(&cg) {
            warn!(error = %e, "can't freeze container");
        }
        let result = cg.kill(Signal::SIGKILL);
        if let Err(e) = cgroup::unfreeze(&cg) {
            warn!(error = %e, "can't unfreeze container");
        }
        result
    }

    /// Freeze a running container and its subtree.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the container is running.
    pub fn pause(&mut self, name: &str) -> Result<()> {
        let id = self.find(name)?;
        self.check_not_lost(id)?;
        let state = self.state_of(id)?;
        if state != State::Running && state != State::Meta {
            return Err(Error::invalid_state(format!("invalid container state {state}")));
        }

        let cg = self.leaf_cgroup(id, Controller::Freezer)?;
        cgroup::freeze(&cg)?;
        self.pause_subtree(id);
        Ok(())
    }

    fn pause_subtree(&mut self, id: ContainerId) {
        for child in self.children_of(id) {
            self.pause_subtree(child);
        }
        if matches!(self.state_of(id), Ok(State::Running | State::Meta)) {
            self.set_state(id, State::Paused);
        }
    }

    /// Thaw a paused container and its subtree.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless paused, or when an ancestor is still
    /// paused.
    pub fn resume(&mut self, name: &str) -> Result<()> {
        let id = self.find(name)?;
        self.check_not_lost(id)?;
        if self.state_of(id)? != State::Paused {
            return Err(Error::invalid_state(format!(
                "invalid container state {}",
                self.state_of(id)?
            )));
        }
        let mut cursor = self.require(id)?.parent;
        while let Some(parent) = cursor {
            if self.state_of(parent)? == State::Paused {
                return Err(Error::invalid_state(format!(
                    "parent {} is paused",
                    self.name_of(parent)
                )));
            }
            cursor = self.require(parent)?.parent;
        }

        let cg = self.leaf_cgroup(id, Controller::Freezer)?;
        cgroup::unfreeze(&cg)?;
        self.resume_subtree(id)?;
        Ok(())
    }

    fn resume_subtree(&mut self, id: ContainerId) -> Result<()> {
        if self.state_of(id)? == State::Paused {
            let has_task = self.require(id)?.task.is_some();
            self.set_state(id, if has_task { State::Running } else { State::Meta });
        }
        for child in self.children_of(id) {
            self.resume_subtree(child)?;
        }
        Ok(())
    }

    /// Signal the root process of a running container.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless running.
    pub fn kill(&mut self, name: &str, signal: Signal) -> Result<()> {
        let id = self.find(name)?;
        self.check_not_lost(id)?;
        info!(container = name, %id, %signal, "kill");
        if self.state_of(id)? != State::Running {
            return Err(Error::invalid_state(format!(
                "invalid container state {}",
                self.state_of(id)?
            )));
        }
        self.require(id)?
            .task
            .as_ref()
            .ok_or_else(|| Error::invalid_state("container has no task"))?
            .kill(signal)
    }

    fn check_not_lost(&self, id: ContainerId) -> Result<()> {
        if self.require(id)?.lost_and_restored {
            return Err(Error::invalid_state(
                "container was lost at restore; only destroy is permitted",
            ));
        }
        Ok(())
    }

    // Property & data access.

    /// Set a property.
    ///
    /// # Errors
    ///
    /// Permission checks, state checks, parsing and per-property
    /// validation each surface their own error kind.
    pub fn set_property(
        &mut self,
        name: &str,
        key: &str,
        raw_value: &str,
        client: &Cred,
        client_root: Option<&Path>,
    ) -> Result<()> {
        let id = self.find(name)?;
        if id == ROOT_ID || id == PADDOCK_ROOT_ID {
            return Err(Error::invalid_value(format!(
                "Can't set property for container {name}"
            )));
        }

        let (base, index) = parse_indexed_name(key);
        let (base, mut value) = match resolve_alias(base) {
            Some(canonical) => (canonical, alias_value_in(key, raw_value.trim())),
            None => (base, raw_value.trim().to_string()),
        };
        let def = self.registry.require(base)?;
        let def_name = def.name;
        let def_kind = def.kind;
        let def_flags = def.flags;
        let superuser = client.is_privileged();

        if def_flags.contains(PropFlags::SUPERUSER) && !superuser {
            let current = self.effective_value(id, def_name).to_wire();
            if current != value {
                return Err(Error::permission("Only root can change this property"));
            }
        }
        if def_flags.contains(PropFlags::RESTROOT) && !superuser && self.owner_uid(id) != 0 {
            return Err(Error::permission(
                "Only privileged or root-owned containers can change this property",
            ));
        }
        if def_flags.contains(PropFlags::PATH) {
            if let Some(root) = client_root {
                value = root
                    .join(value.trim_start_matches('/'))
                    .to_string_lossy()
                    .into_owned();
            }
        }

        let state = self.state_of(id)?;
        if !self.registry.require(base)?.settable_in(state) {
            return Err(Error::invalid_state(format!(
                "Can't set dynamic property {base} in state {state}"
            )));
        }
        if self.use_parent_namespace(id) && def_flags.contains(PropFlags::PARENT_RO) {
            return Err(Error::not_supported(format!(
                "Can't set {base} for child container"
            )));
        }

        let unit = def_flags.contains(PropFlags::UNIT_SUFFIX);
        let parsed = if let Some(index) = index {
            let mut map = self.effective_value(id, base).as_uint_map();
            if !map.contains_key(index) {
                return Err(Error::invalid_value(format!("invalid index {index}")));
            }
            let entry = property::parse_uint(&value, unit)?;
            map.insert(index.to_string(), entry);
            Value::UintMap(map)
        } else {
            Value::from_wire(def_kind, &value, unit)?
        };

        if let Some(check) = self.registry.require(base)?.check {
            let ctx = PropCtx {
                holder: self,
                id,
                client_privileged: superuser,
            };
            check(&ctx, &parsed)?;
        }

        let wire = parsed.to_wire();
        self.require_mut(id)?.props.set(def_name, parsed);
        if def_flags.contains(PropFlags::PERSISTENT) {
            self.persist_marker(id, def_name, &wire);
        }

        if self.should_apply_live(id, base) {
            self.apply_dynamic_properties(id)?;
        }
        Ok(())
    }

    /// Forget a property's explicit value; it resolves through its default
    /// again.
    ///
    /// # Errors
    ///
    /// Returns `InvalidProperty` for unknown keys and `InvalidState`
    /// outside the property's settable states.
    pub fn reset_property(&mut self, name: &str, key: &str, client: &Cred) -> Result<()> {
        let id = self.find(name)?;
        let def = self.registry.require(key)?;
        let def_name = def.name;
        let def_flags = def.flags;

        if def_flags.contains(PropFlags::SUPERUSER) && !client.is_privileged() {
            return Err(Error::permission("Only root can change this property"));
        }
        let state = self.state_of(id)?;
        if !self.registry.require(key)?.settable_in(state) {
            return Err(Error::invalid_state(format!(
                "Can't reset property {key} in state {state}"
            )));
        }

        self.require_mut(id)?.props.reset(def_name);
        if def_flags.contains(PropFlags::PERSISTENT) {
            // Rewrite the node without the key; append semantics cannot
            // express a deletion.
            let keep: Vec<crate::kv::KvPair> = self
                .kv
                .load(id)
                .unwrap_or_default()
                .into_iter()
                .filter(|p| p.key != def_name)
                .collect();
            if let Err(e) = self.kv.save(id, keep) {
                error!(%id, key, error = %e, "cannot persist property reset");
            }
        }
        Ok(())
    }

    fn should_apply_live(&self, id: ContainerId, prop: &str) -> bool {
        let Ok(def) = self.registry.require(prop) else {
            return false;
        };
        if !def.settable_in(State::Running) {
            return false;
        }
        matches!(
            self.state_of(id),
            Ok(State::Running | State::Paused | State::Meta)
        )
    }

    /// Get a property in its wire encoding.
    ///
    /// # Errors
    ///
    /// Returns `InvalidProperty` for unknown keys and `InvalidValue` for a
    /// bad index.
    pub fn get_property(
        &self,
        name: &str,
        key: &str,
        client_root: Option<&Path>,
    ) -> Result<String> {
        let id = self.find(name)?;
        if id == ROOT_ID || id == PADDOCK_ROOT_ID {
            return Err(Error::new(
                ErrorKind::InvalidProperty,
                format!("no properties for container {name}"),
            ));
        }

        let (base, index) = parse_indexed_name(key);
        let base = resolve_alias(base).unwrap_or(base);
        let def = self.registry.require(base)?;

        let value = self.effective_value(id, base);
        let mut text = match index {
            Some(index) => {
                let map = value.as_uint_map();
                map.get(index)
                    .map(ToString::to_string)
                    .ok_or_else(|| Error::invalid_value(format!("invalid index {index}")))?
            }
            None => value.to_wire(),
        };
        text = alias_value_out(key, &text);

        if def.has_flags(PropFlags::PATH) {
            if let Some(root) = client_root {
                if let Ok(stripped) = Path::new(&text).strip_prefix(root) {
                    text = format!("/{}", stripped.to_string_lossy());
                }
            }
        }
        Ok(text)
    }

    /// Read a data item in its wire encoding.
    ///
    /// # Errors
    ///
    /// Returns `InvalidData` for unknown keys, `InvalidState` outside the
    /// data's states.
    pub fn get_data(&self, name: &str, key: &str) -> Result<String> {
        let id = self.find(name)?;
        let (base, index) = parse_indexed_name(key);
        let def = self.registry.require_data(base)?;

        if !def.readable_in(self.state_of(id)?) {
            return Err(Error::invalid_state("invalid container state"));
        }
        let ctx = PropCtx::internal(self, id);
        let value = (def.get)(&ctx)?;
        match index {
            Some(index) => {
                let map = value.as_uint_map();
                map.get(index)
                    .map(ToString::to_string)
                    .ok_or_else(|| Error::invalid_value(format!("invalid index {index}")))
            }
            None => Ok(value.to_wire()),
        }
    }

    /// Register a waiter; fires immediately unless the container is
    /// running.
    ///
    /// # Errors
    ///
    /// Returns `ContainerDoesNotExist` for unknown names.
    pub fn add_waiter(&mut self, name: &str, sender: mpsc::Sender<WaitEvent>) -> Result<()> {
        let id = self.find(name)?;
        let full_name = self.name_of(id);
        let container = self.require_mut(id)?;
        if container.state == State::Running {
            container.waiters.push(sender);
        } else {
            let _ = sender.send(WaitEvent {
                name: full_name,
                state: container.state,
            });
        }
        Ok(())
    }

    // Event delivery.

    /// Dispatch one event from the loop.
    pub fn handle_event(&mut self, event: Event, events: &EventLoop) {
        match event {
            Event::Exit { pid, status } => {
                if let Some(id) = self.find_by_pid(pid) {
                    self.deliver_exit(id, status);
                    self.schedule_respawn(id, events);
                }
            }
            Event::Oom { fd } => {
                if let Some(id) = self.find_by_oom_fd(fd) {
                    self.deliver_oom(id);
                    self.schedule_respawn(id, events);
                }
            }
            Event::RotateLogs => self.rotate_sweep(),
            Event::Respawn(id) => {
                if let Err(e) = self.try_respawn(id, events) {
                    error!(%id, error = %e, "can't respawn container");
                }
            }
            Event::Shutdown => {}
        }
    }

    fn find_by_pid(&self, pid: nix::unistd::Pid) -> Option<ContainerId> {
        self.slots.iter().flatten().find_map(|c| {
            let task = c.task.as_ref()?;
            (task.pid() == pid || task.wpid() == pid).then_some(c.id)
        })
    }

    fn find_by_oom_fd(&self, fd: i32) -> Option<ContainerId> {
        self.slots.iter().flatten().find_map(|c| {
            c.oom.as_ref().filter(|m| m.raw_fd() == fd).map(|_| c.id)
        })
    }

    fn deliver_exit(&mut self, id: ContainerId, status: i32) {
        if self.state_of(id).map_or(true, |s| s == State::Dead) {
            return;
        }
        let oom_killed = self
            .require(id)
            .ok()
            .and_then(|c| c.oom.as_ref().map(OomMonitor::triggered))
            .unwrap_or(false);
        self.exit(id, status, oom_killed, false);
    }

    fn deliver_oom(&mut self, id: ContainerId) {
        if self.state_of(id).map_or(true, |s| s == State::Dead) {
            return;
        }
        self.exit(id, Signal::SIGKILL as i32, true, false);
    }

    /// Move a container (and its running subtree) to the dead state.
    pub(crate) fn exit(&mut self, id: ContainerId, status: i32, oom_killed: bool, force: bool) {
        let name = self.name_of(id);
        info!(container = %name, status, oom_killed, "exit");

        let isolate = self.effective_value(id, names::ISOLATE).as_bool();
        if !force && !oom_killed && isolate {
            // A process may have re-parented inside; ignore bogus exits
            // while the freezer still holds tasks.
            if let Ok(cg) = self.leaf_cgroup(id, Controller::Freezer) {
                if cg.exists() && !cg.is_empty().unwrap_or(true) {
                    warn!(container = %name, "skipped bogus exit event, tasks still alive");
                    return;
                }
            }
        }

        let death_time = crate::current_time_ms();
        if let Ok(container) = self.require_mut(id) {
            container.oom = None;
            container.exit_status = status;
            container.death_time_ms = death_time;
            container.oom_killed = oom_killed;
        }
        self.persist_marker(id, "exit_status", &status.to_string());
        self.persist_marker(id, "oom_killed", &oom_killed.to_string());
        self.persist_marker(id, "raw_death_time", &death_time.to_string());
        self.persist_marker(id, "raw_root_pid", "0");

        if oom_killed || !isolate {
            if let Err(e) = self.kill_all(id) {
                warn!(container = %name, error = %e, "can't kill all tasks");
            }
        }

        // Children die with the container.
        for child in self.children_of(id) {
            if matches!(self.state_of(child), Ok(State::Running | State::Meta)) {
                if let Err(e) = self.kill_all(child) {
                    warn!(container = %self.name_of(child), error = %e, "child can't be killed");
                }
                self.exit(child, status, oom_killed, true);
            }
        }

        if let Ok(container) = self.require_mut(id) {
            if let Some(task) = &mut container.task {
                task.deliver_exit(status);
            }
        }
        self.set_state(id, State::Dead);
    }

    fn rotate_sweep(&mut self) {
        let max_size = self.config.container.max_log_size;
        let aging_defaults: Vec<(ContainerId, State)> = self
            .slots
            .iter()
            .flatten()
            .map(|c| (c.id, c.state))
            .collect();

        for (id, state) in aging_defaults {
            if state == State::Running {
                for prop in [names::STDOUT_PATH, names::STDERR_PATH] {
                    let path = self.effective_value(id, prop);
                    rotate_log(Path::new(path.as_str()), max_size);
                }
            }
            if state == State::Dead {
                let aging = self.effective_value(id, names::AGING_TIME).as_uint();
                let removable = self
                    .require(id)
                    .map_or(false, |c| c.can_remove_dead(aging, crate::current_time_ms()));
                if removable {
                    let name = self.name_of(id);
                    info!(container = %name, "collecting aged dead container");
                    if let Err(e) = self.destroy(&name) {
                        warn!(container = %name, error = %e, "cannot collect dead container");
                    }
                }
            }
        }
    }

    /// Schedule a respawn when the policy allows one.
    pub(crate) fn schedule_respawn(&self, id: ContainerId, events: &EventLoop) {
        let respawn = self.effective_value(id, names::RESPAWN).as_bool();
        let max = self.effective_value(id, names::MAX_RESPAWNS).as_int();
        let allowed = self
            .require(id)
            .map_or(false, |c| c.may_respawn(respawn, max));
        if allowed {
            events.defer(self.config.container.respawn_delay, Event::Respawn(id));
        }
    }

    fn try_respawn(&mut self, id: ContainerId, events: &EventLoop) -> Result<()> {
        let respawn = self.effective_value(id, names::RESPAWN).as_bool();
        let max = self.effective_value(id, names::MAX_RESPAWNS).as_int();
        if !self.require(id)?.may_respawn(respawn, max) {
            return Ok(());
        }
        let name = self.name_of(id);
        let count = self.require(id)?.respawn_count;

        self.stop_one(id)?;
        let result = self.start(&name, Some(events));
        if let Ok(container) = self.require_mut(id) {
            container.respawn_count = count + 1;
        }
        self.persist_marker(id, "respawn_count", &(count + 1).to_string());
        result?;
        info!(container = %name, count = count + 1, "respawned");
        Ok(())
    }

    /// Release everything a failed or finished start holds.
    pub(crate) fn free_resources(&mut self, id: ContainerId) {
        // Leaf cgroups go children-first; non-empty leaves stay behind and
        // are reported.
        for subsystem in self.cgroups.subsystems() {
            if let Ok(cg) = self.leaf_cgroup(id, subsystem.controller()) {
                if cg.exists() {
                    if let Err(e) = cg.remove() {
                        warn!(cgroup = %cg.path().display(), error = %e, "cannot remove cgroup");
                    }
                }
            }
        }

        if let Some(tclass) = self.require_mut(id).ok().and_then(|c| c.tclass.take()) {
            // Shared classes stay with the running ancestor; only the last
            // owner tears the kernel state down.
            if let Ok(tclass) = Arc::try_unwrap(tclass) {
                self.with_net(|net| tclass.remove(net));
            }
        }

        if let Ok(container) = self.require_mut(id) {
            container.task = None;
            container.oom = None;
        }

        for prop in [names::STDOUT_PATH, names::STDERR_PATH] {
            if !self.has_explicit_value(id, prop) {
                let path = self.effective_value(id, prop);
                task::remove_stdio_file(Path::new(path.as_str()));
            }
        }

        let loop_dev = self.require(id).map_or(-1, |c| c.loop_dev);
        if loop_dev >= 0 {
            if let Err(e) = crate::loopdev::release(loop_dev) {
                error!(loop_dev, error = %e, "can't put loop device");
            }
            if let Ok(container) = self.require_mut(id) {
                container.loop_dev = -1;
            }
            self.persist_marker(id, "raw_loop_dev", "-1");
        }
    }
}

/// Truncate a regular log file once it outgrows `max_size`.
fn rotate_log(path: &Path, max_size: u64) {
    let Ok(meta) = std::fs::metadata(path) else {
        return;
    };
    if !meta.is_file() || meta.len() <= max_size {
        return;
    }
    if let Err(e) = std::fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)
    {
        warn!(path = %path.display(), error = %e, "cannot rotate log");
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 128 {
        return Err(Error::invalid_value(format!("invalid container name {name}")));
    }
    if name == "/" || name == "/paddock" || name == "." {
        return Err(Error::invalid_value(format!("invalid container name {name}")));
    }
    for segment in name.split('/') {
        if segment.is_empty() {
            return Err(Error::invalid_value(format!("invalid container name {name}")));
        }
        if !segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '@'))
        {
            return Err(Error::invalid_value(format!("invalid container name {name}")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests;
