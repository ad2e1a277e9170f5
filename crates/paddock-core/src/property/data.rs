//! Read-only runtime data items.
//!
//! Data shares the shape of properties but is produced by the daemon and
//! never set by clients. A few raw markers (exit status, oom flag, respawn
//! count, timestamps) are persisted by the holder so restart recovery can
//! rebuild them; everything else is observed live.

use std::io::{Read, Seek, SeekFrom};

use super::{names, PropCtx, Value, ANY_STATE};
use crate::cgroup::{self, Controller};
use crate::container::State;
use crate::error::{Error, ErrorKind, Result};
use crate::net::TclassStat;

/// One data declaration.
pub struct DataDef {
    /// Data name.
    pub name: &'static str,
    /// Human-readable description.
    pub desc: &'static str,
    /// States in which the data may be read.
    pub states: &'static [State],
    /// Getter.
    pub get: fn(&PropCtx<'_>) -> Result<Value>,
}

impl DataDef {
    /// Whether the data may be read in `state`.
    #[must_use]
    pub fn readable_in(&self, state: State) -> bool {
        self.states.contains(&state)
    }
}

const RUN_STATES: &[State] = &[State::Running, State::Paused, State::Meta, State::Dead];
const DEAD_ONLY: &[State] = &[State::Dead];
const STD_STATES: &[State] = &[State::Running, State::Paused, State::Dead];

/// All data declarations.
#[must_use]
pub fn declarations() -> Vec<DataDef> {
    vec![
        DataDef {
            name: "state",
            desc: "Container state",
            states: ANY_STATE,
            get: |ctx| Ok(Value::Str(ctx.holder.state_of(ctx.id)?.to_string())),
        },
        DataDef {
            name: "exit_status",
            desc: "Container exit status",
            states: DEAD_ONLY,
            get: |ctx| Ok(Value::Int(i64::from(ctx.holder.require(ctx.id)?.exit_status))),
        },
        DataDef {
            name: "start_errno",
            desc: "Errno of the last failed start",
            states: &[State::Stopped],
            get: |ctx| Ok(Value::Int(i64::from(ctx.holder.require(ctx.id)?.start_errno))),
        },
        DataDef {
            name: "oom_killed",
            desc: "Whether the container was killed by the OOM killer",
            states: DEAD_ONLY,
            get: |ctx| Ok(Value::Bool(ctx.holder.require(ctx.id)?.oom_killed)),
        },
        DataDef {
            name: "respawn_count",
            desc: "How many times the container was respawned",
            states: &[State::Running, State::Dead],
            get: |ctx| Ok(Value::Uint(ctx.holder.require(ctx.id)?.respawn_count)),
        },
        DataDef {
            name: "root_pid",
            desc: "Root process id",
            states: &[State::Running, State::Meta, State::Paused],
            get: |ctx| {
                let container = ctx.holder.require(ctx.id)?;
                let pid = container.task.as_ref().map_or(0, |t| t.pid().as_raw());
                Ok(Value::Int(i64::from(pid)))
            },
        },
        DataDef {
            name: "stdout",
            desc: "Tail of the standard output file",
            states: STD_STATES,
            get: |ctx| read_std_file(ctx, names::STDOUT_PATH),
        },
        DataDef {
            name: "stderr",
            desc: "Tail of the standard error file",
            states: STD_STATES,
            get: |ctx| read_std_file(ctx, names::STDERR_PATH),
        },
        DataDef {
            name: "cpu_usage",
            desc: "Consumed CPU time [nanoseconds]",
            states: RUN_STATES,
            get: |ctx| {
                let cg = ctx.holder.leaf_cgroup(ctx.id, Controller::Cpuacct)?;
                Ok(Value::Uint(cgroup::cpuacct::usage(&cg)?))
            },
        },
        DataDef {
            name: "memory_usage",
            desc: "Consumed memory [bytes]",
            states: RUN_STATES,
            get: |ctx| {
                let cg = ctx.holder.leaf_cgroup(ctx.id, Controller::Memory)?;
                Ok(Value::Uint(cgroup::memory::usage(&cg)?))
            },
        },
        DataDef {
            name: "minor_faults",
            desc: "Minor page faults",
            states: RUN_STATES,
            get: |ctx| {
                let (minor, _) = page_faults(ctx)?;
                Ok(Value::Uint(minor))
            },
        },
        DataDef {
            name: "major_faults",
            desc: "Major page faults",
            states: RUN_STATES,
            get: |ctx| {
                let (_, major) = page_faults(ctx)?;
                Ok(Value::Uint(major))
            },
        },
        DataDef {
            name: "net_bytes",
            desc: "Bytes sent per interface",
            states: RUN_STATES,
            get: |ctx| net_stat(ctx, TclassStat::Bytes),
        },
        DataDef {
            name: "net_packets",
            desc: "Packets sent per interface",
            states: RUN_STATES,
            get: |ctx| net_stat(ctx, TclassStat::Packets),
        },
        DataDef {
            name: "net_drops",
            desc: "Dropped packets per interface",
            states: RUN_STATES,
            get: |ctx| net_stat(ctx, TclassStat::Drops),
        },
        DataDef {
            name: "net_overlimits",
            desc: "Over-limit events per interface",
            states: RUN_STATES,
            get: |ctx| net_stat(ctx, TclassStat::Overlimits),
        },
        DataDef {
            name: "time",
            desc: "Container uptime [seconds]",
            states: RUN_STATES,
            get: |ctx| {
                let container = ctx.holder.require(ctx.id)?;
                let end = if container.state == State::Dead {
                    container.death_time_ms
                } else {
                    crate::current_time_ms()
                };
                Ok(Value::Uint(end.saturating_sub(container.start_time_ms) / 1000))
            },
        },
        DataDef {
            name: "parent",
            desc: "Parent container name",
            states: ANY_STATE,
            get: |ctx| {
                let container = ctx.holder.require(ctx.id)?;
                let name = container
                    .parent
                    .map(|id| ctx.holder.name_of(id))
                    .unwrap_or_default();
                Ok(Value::Str(name))
            },
        },
        DataDef {
            name: "children",
            desc: "Child container names",
            states: ANY_STATE,
            get: |ctx| {
                let names = ctx
                    .holder
                    .children_of(ctx.id)
                    .into_iter()
                    .map(|id| ctx.holder.name_of(id))
                    .collect();
                Ok(Value::List(names))
            },
        },
    ]
}

fn read_std_file(ctx: &PropCtx<'_>, path_prop: &str) -> Result<Value> {
    let path = ctx.get(path_prop).as_str().to_string();
    let limit = ctx.get(names::STDOUT_LIMIT).as_uint();

    let mut file = match std::fs::File::open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Value::Str(String::new()));
        }
        Err(e) => return Err(e.into()),
    };
    let len = file.metadata()?.len();
    if len > limit {
        file.seek(SeekFrom::Start(len - limit))?;
    }
    let mut out = String::new();
    file.take(limit).read_to_string(&mut out).map_err(|_| {
        Error::new(ErrorKind::InvalidData, format!("{path} is not valid text"))
    })?;
    Ok(Value::Str(out))
}

fn page_faults(ctx: &PropCtx<'_>) -> Result<(u64, u64)> {
    let cg = ctx.holder.leaf_cgroup(ctx.id, Controller::Memory)?;
    let stat = cg.get_knob("memory.stat")?;
    let mut total = 0u64;
    let mut major = 0u64;
    for line in stat.lines() {
        if let Some(value) = line.strip_prefix("total_pgfault ") {
            total = value.trim().parse().unwrap_or(0);
        } else if let Some(value) = line.strip_prefix("total_pgmajfault ") {
            major = value.trim().parse().unwrap_or(0);
        }
    }
    Ok((total.saturating_sub(major), major))
}

fn net_stat(ctx: &PropCtx<'_>, stat: TclassStat) -> Result<Value> {
    let map = ctx.holder.tclass_stats(ctx.id, stat)?;
    Ok(Value::UintMap(map))
}
