//! Container: the per-container state and the state machine rules.
//!
//! Containers are owned by the holder in a dense table; this module keeps
//! the single-container invariants (state transitions, respawn policy,
//! aging) while the holder drives everything that spans the tree.

use std::sync::mpsc;
use std::sync::Arc;

use crate::cgroup::OomMonitor;
use crate::net::Tclass;
use crate::property::PropertyMap;
use crate::task::Task;
use crate::{ContainerId, Cred};

/// Container lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// No task, no resources.
    Stopped,
    /// A live task runs inside.
    Running,
    /// Frozen via the freezer cgroup.
    Paused,
    /// Running container with no command of its own, a pure cgroup group.
    Meta,
    /// The task exited; resources are still attached for inspection.
    Dead,
}

impl State {
    /// Whether `self -> to` appears in the transition table.
    #[must_use]
    pub fn can_transition(self, to: State) -> bool {
        matches!(
            (self, to),
            (State::Stopped, State::Running | State::Meta)
                | (State::Running, State::Paused | State::Dead | State::Stopped)
                | (State::Meta, State::Dead | State::Stopped | State::Paused)
                | (State::Paused, State::Running | State::Meta | State::Stopped)
                | (State::Dead, State::Running | State::Stopped)
        )
    }

    /// Parse a state name as stored in the kv record.
    #[must_use]
    pub fn parse(text: &str) -> Option<State> {
        match text {
            "stopped" => Some(State::Stopped),
            "running" => Some(State::Running),
            "paused" => Some(State::Paused),
            "meta" => Some(State::Meta),
            "dead" => Some(State::Dead),
            _ => None,
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Meta => "meta",
            Self::Dead => "dead",
        };
        f.write_str(name)
    }
}

/// Notification sent to waiters when a container leaves the running state.
#[derive(Debug, Clone)]
pub struct WaitEvent {
    /// Full container name.
    pub name: String,
    /// State the container moved to.
    pub state: State,
}

/// One container.
#[derive(Debug)]
pub struct Container {
    /// Stable numeric id; doubles as the traffic-class minor.
    pub id: ContainerId,
    /// Leaf name, without the parent path.
    pub name: String,
    /// Parent container, `None` only for the host root.
    pub parent: Option<ContainerId>,
    /// Current state.
    pub state: State,
    /// Credentials of the owner.
    pub owner: Cred,
    /// Explicitly set properties.
    pub props: PropertyMap,
    /// The supervised process, at most one.
    pub task: Option<Task>,
    /// Traffic class; shared with the running ancestor when the container
    /// uses its namespace.
    pub tclass: Option<Arc<Tclass>>,
    /// Armed OOM notification while running.
    pub oom: Option<OomMonitor>,
    /// Pending waiters, notified in registration order.
    pub waiters: Vec<mpsc::Sender<WaitEvent>>,
    /// Exclusion marker for structural operations.
    pub acquired: bool,
    /// How many times the container respawned since the last start.
    pub respawn_count: u64,
    /// Exit status of the last task.
    pub exit_status: i32,
    /// Errno of the last failed start, -1 when the start succeeded.
    pub start_errno: i32,
    /// Whether the last death was an OOM kill.
    pub oom_killed: bool,
    /// Start timestamp, milliseconds.
    pub start_time_ms: u64,
    /// Death timestamp, milliseconds.
    pub death_time_ms: u64,
    /// Loop device backing the root image, or -1.
    pub loop_dev: i32,
    /// Running containers in the subtree below this one.
    pub running_children: usize,
    /// Restored from disk without finding the expected task; only destroy
    /// is permitted.
    pub lost_and_restored: bool,
}

impl Container {
    /// A fresh container in the stopped state.
    #[must_use]
    pub fn new(id: ContainerId, name: String, parent: Option<ContainerId>, owner: Cred) -> Self {
        Self {
            id,
            name,
            parent,
            state: State::Stopped,
            owner,
            props: PropertyMap::new(),
            task: None,
            tclass: None,
            oom: None,
            waiters: Vec::new(),
            acquired: false,
            respawn_count: 0,
            exit_status: -1,
            start_errno: -1,
            oom_killed: false,
            start_time_ms: 0,
            death_time_ms: 0,
            loop_dev: -1,
            running_children: 0,
            lost_and_restored: false,
        }
    }

    /// Whether this is the permanent host root.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.id == crate::ROOT_ID
    }

    /// Whether this is the permanent supervisor subtree root.
    #[must_use]
    pub fn is_paddock_root(&self) -> bool {
        self.id == crate::PADDOCK_ROOT_ID
    }

    /// Whether the container may respawn under the given policy.
    #[must_use]
    pub fn may_respawn(&self, respawn: bool, max_respawns: i64) -> bool {
        if self.state != State::Dead || !respawn {
            return false;
        }
        max_respawns < 0 || self.respawn_count < max_respawns as u64
    }

    /// Whether a dead container outlived its aging time and may be
    /// collected.
    #[must_use]
    pub fn can_remove_dead(&self, aging_time_secs: u64, now_ms: u64) -> bool {
        self.state == State::Dead
            && self.death_time_ms / 1000 + aging_time_secs <= now_ms / 1000
    }

    /// Notify and drop waiters once the container is no longer running.
    pub fn notify_waiters(&mut self, full_name: &str) {
        if self.state == State::Running {
            return;
        }
        let event = WaitEvent {
            name: full_name.to_string(),
            state: self.state,
        };
        // Senders whose receiver is gone drop out of the list here.
        self.waiters.retain(|w| w.send(event.clone()).is_ok());
        self.waiters.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        assert!(State::Stopped.can_transition(State::Running));
        assert!(State::Stopped.can_transition(State::Meta));
        assert!(State::Running.can_transition(State::Paused));
        assert!(State::Running.can_transition(State::Dead));
        assert!(State::Paused.can_transition(State::Running));
        assert!(State::Dead.can_transition(State::Running));
        assert!(State::Meta.can_transition(State::Dead));

        assert!(!State::Stopped.can_transition(State::Paused));
        assert!(!State::Stopped.can_transition(State::Dead));
        assert!(!State::Paused.can_transition(State::Dead));
        assert!(!State::Dead.can_transition(State::Paused));
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            State::Stopped,
            State::Running,
            State::Paused,
            State::Meta,
            State::Dead,
        ] {
            assert_eq!(State::parse(&state.to_string()), Some(state));
        }
        assert_eq!(State::parse("zombie"), None);
    }

    #[test]
    fn test_may_respawn_policy() {
        let mut c = Container::new(
            ContainerId(3),
            "r".to_string(),
            Some(crate::PADDOCK_ROOT_ID),
            Cred::root(),
        );
        c.state = State::Dead;

        assert!(c.may_respawn(true, -1));
        assert!(c.may_respawn(true, 1));
        c.respawn_count = 1;
        assert!(!c.may_respawn(true, 1));
        assert!(c.may_respawn(true, -1));
        assert!(!c.may_respawn(false, -1));

        c.state = State::Running;
        assert!(!c.may_respawn(true, -1));
    }

    #[test]
    fn test_can_remove_dead() {
        let mut c = Container::new(
            ContainerId(3),
            "d".to_string(),
            Some(crate::PADDOCK_ROOT_ID),
            Cred::root(),
        );
        c.state = State::Dead;
        c.death_time_ms = 10_000;
        assert!(!c.can_remove_dead(60, 20_000));
        assert!(c.can_remove_dead(60, 70_000));
        c.state = State::Stopped;
        assert!(!c.can_remove_dead(60, 70_000));
    }

    #[test]
    fn test_waiters_notified_once() {
        let mut c = Container::new(
            ContainerId(3),
            "w".to_string(),
            Some(crate::PADDOCK_ROOT_ID),
            Cred::root(),
        );
        let (tx, rx) = mpsc::channel();
        c.waiters.push(tx);

        c.state = State::Running;
        c.notify_waiters("w");
        assert!(rx.try_recv().is_err());

        c.state = State::Dead;
        c.notify_waiters("w");
        let event = rx.try_recv().unwrap();
        assert_eq!(event.name, "w");
        assert_eq!(event.state, State::Dead);
        assert!(c.waiters.is_empty());
    }
}
