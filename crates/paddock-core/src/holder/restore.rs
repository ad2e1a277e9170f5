//! Daemon-startup reconstruction of containers from the kv store.

use std::collections::HashMap;

use tracing::{error, info, warn};

use crate::cgroup::{self, Controller, OomMonitor};
use crate::container::{Container, State};
use crate::error::{Error, Result};
use crate::event::EventLoop;
use crate::task::Task;
use crate::{ContainerId, Cred};

use super::Holder;

impl Holder {
    /// Restore every recorded container, parents before children.
    ///
    /// # Errors
    ///
    /// Record corruption is fatal and aborts startup; per-container
    /// restore failures degrade that container to the lost state instead.
    pub fn restore_all(&mut self, events: &EventLoop) -> Result<()> {
        let mut records: Vec<(ContainerId, HashMap<String, String>)> = Vec::new();
        for id in self.kv().list()? {
            info!(%id, "restoring kv node");
            let pairs = self.kv().load(id)?;
            let map = pairs.into_iter().map(|p| (p.key, p.val)).collect();
            records.push((id, map));
        }

        // Parents first: sort by name depth, then id for stable ordering.
        records.sort_by_key(|(id, map)| {
            let depth = map
                .get("raw_name")
                .map_or(usize::MAX, |n| n.matches('/').count());
            (depth, *id)
        });

        for (id, map) in records {
            if let Err(e) = self.restore_one(id, &map, events) {
                error!(%id, error = %e, "cannot restore container");
                if let Ok(container) = self.require_mut(id) {
                    container.lost_and_restored = true;
                } else {
                    // Never inserted; drop the record so the id can be
                    // reused.
                    let _ = self.kv().remove(id);
                }
            }
        }
        Ok(())
    }

    fn restore_one(
        &mut self,
        id: ContainerId,
        map: &HashMap<String, String>,
        events: &EventLoop,
    ) -> Result<()> {
        let full_name = map
            .get("raw_name")
            .ok_or_else(|| Error::unknown("record has no container name"))?
            .clone();
        info!(container = %full_name, %id, "restore");

        let (parent, leaf) = match full_name.rsplit_once('/') {
            Some((parent_name, leaf)) => (self.find(parent_name)?, leaf.to_string()),
            None => (crate::PADDOCK_ROOT_ID, full_name.clone()),
        };

        let owner = Cred {
            uid: map.get("owner_uid").and_then(|v| v.parse().ok()).unwrap_or(0),
            gid: map.get("owner_gid").and_then(|v| v.parse().ok()).unwrap_or(0),
            groups: Vec::new(),
        };
        let mut container = Container::new(id, leaf, Some(parent), owner);

        container.respawn_count = marker(map, "respawn_count").unwrap_or(0);
        container.exit_status = marker(map, "exit_status").unwrap_or(-1);
        container.oom_killed = map.get("oom_killed").map(String::as_str) == Some("true");
        container.start_time_ms = marker(map, "raw_start_time").unwrap_or(0);
        container.death_time_ms = marker(map, "raw_death_time").unwrap_or(0);
        container.loop_dev = marker(map, "raw_loop_dev").unwrap_or(-1);
        self.insert(container)?;

        // Replay persisted properties. A value that no longer parses is a
        // record corruption, not a validation failure.
        for (key, value) in map {
            let Some(def) = self.registry().find(key) else {
                continue;
            };
            if !def.has_flags(crate::property::PropFlags::PERSISTENT) {
                continue;
            }
            let unit = def.has_flags(crate::property::PropFlags::UNIT_SUFFIX);
            let parsed = crate::property::Value::from_wire(def.kind, value, unit)?;
            let def_name = def.name;
            self.require_mut(id)?.props.set(def_name, parsed);
        }

        let recorded = map
            .get("state")
            .and_then(|s| State::parse(s))
            .ok_or_else(|| Error::unknown("record has no state"))?;
        let root_pid = marker::<i32>(map, "raw_root_pid").unwrap_or(0);

        match recorded {
            State::Running | State::Meta | State::Paused if root_pid > 0 => {
                self.reattach(id, root_pid, recorded, events);
            }
            State::Dead => {
                self.assume_state(id, State::Dead);
                if container_respawns(self, id) {
                    self.schedule_respawn(id, events);
                }
            }
            State::Meta => {
                // A meta without a recorded pid is just its cgroups.
                self.assume_state(id, State::Meta);
            }
            _ => {
                // Never reported as started; make sure nothing is running.
                if let Ok(cg) = self.leaf_cgroup(id, Controller::Freezer) {
                    if cg.exists() && !cg.is_empty().unwrap_or(true) {
                        let _ = self.kill_all(id);
                    }
                }
                self.assume_state(id, State::Stopped);
            }
        }
        Ok(())
    }

    /// Reconnect a recorded task, deciding between live, dead and lost.
    fn reattach(&mut self, id: ContainerId, root_pid: i32, recorded: State, events: &EventLoop) {
        let pid = nix::unistd::Pid::from_raw(root_pid);
        let task = Task::restore(pid);
        let alive = task.is_running() && !task.is_zombie();
        let in_freezer = self.pid_in_freezer(id, pid);

        if alive && in_freezer {
            info!(container = %self.name_of(id), %pid, "task is running and belongs to us");
            if let Ok(container) = self.require_mut(id) {
                container.task = Some(task);
            }

            let state = match self.leaf_cgroup(id, Controller::Freezer) {
                Ok(cg) if cgroup::is_frozen(&cg).unwrap_or(false) => State::Paused,
                _ => recorded,
            };
            self.assume_state(id, state);
            self.rearm_oom(id, events);
        } else if alive {
            warn!(container = %self.name_of(id), %pid, "task is running outside our freezer");
            if let Ok(container) = self.require_mut(id) {
                container.task = Some(task);
                container.lost_and_restored = true;
            }
            self.assume_state(id, recorded);
        } else {
            info!(container = %self.name_of(id), %pid, "task is gone, marking dead");
            self.assume_state(id, State::Dead);
            if let Ok(container) = self.require_mut(id) {
                container.death_time_ms = crate::current_time_ms();
            }
            if container_respawns(self, id) {
                self.schedule_respawn(id, events);
            }
        }
    }

    fn pid_in_freezer(&self, id: ContainerId, pid: nix::unistd::Pid) -> bool {
        match self.leaf_cgroup(id, Controller::Freezer) {
            Ok(cg) if cg.exists() => cg.tasks().map_or(false, |tasks| tasks.contains(&pid)),
            // Without a freezer controller there is nothing to check
            // against; trust the pid.
            Ok(_) | Err(_) => true,
        }
    }

    fn rearm_oom(&mut self, id: ContainerId, events: &EventLoop) {
        if self.cgroups().get(Controller::Memory).is_none() {
            return;
        }
        let Ok(memcg) = self.leaf_cgroup(id, Controller::Memory) else {
            return;
        };
        if !memcg.exists() {
            return;
        }
        match OomMonitor::arm(&memcg) {
            Ok(monitor) => {
                if let Err(e) = events.add_oom(monitor.fd()) {
                    warn!(container = %self.name_of(id), error = %e, "cannot watch OOM eventfd");
                }
                if let Ok(container) = self.require_mut(id) {
                    container.oom = Some(monitor);
                }
            }
            Err(e) => warn!(container = %self.name_of(id), error = %e, "cannot re-arm OOM monitor"),
        }
    }

    /// Set a restored state directly; restore may land in states the
    /// transition table cannot reach from `Stopped`.
    fn assume_state(&mut self, id: ContainerId, state: State) {
        if state == State::Running {
            self.update_running_children(id, 1);
        }
        if let Ok(container) = self.require_mut(id) {
            container.state = state;
        }
    }

    pub(super) fn kv(&self) -> &crate::kv::KvStore {
        &self.kv
    }
}

fn marker<T: std::str::FromStr>(map: &HashMap<String, String>, key: &str) -> Option<T> {
    map.get(key).and_then(|v| v.parse().ok())
}

fn container_respawns(holder: &Holder, id: ContainerId) -> bool {
    let respawn = holder
        .effective_value(id, crate::property::defs::names::RESPAWN)
        .as_bool();
    let max = holder
        .effective_value(id, crate::property::defs::names::MAX_RESPAWNS)
        .as_int();
    holder.require(id).map_or(false, |c| c.may_respawn(respawn, max))
}
