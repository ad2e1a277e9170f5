//! Property declarations and the parsers their validators share with the
//! task launcher.

use std::collections::BTreeMap;

use nix::sys::resource::Resource;

use super::{
    PropCtx, PropDef, PropFlags, Value, ValueKind, DYNAMIC_PROPERTY, STATIC_PROPERTY,
};
use crate::cgroup::{self, Controller};
use crate::error::{Error, ErrorKind, Result};
use crate::net::{self, IpSpec, MacVlanCfg, NetCfg, VethCfg};
use crate::task::BindMount;

/// Property names.
pub mod names {
    /// Command executed upon container start.
    pub const COMMAND: &str = "command";
    /// Start command with the given user.
    pub const USER: &str = "user";
    /// Start command with the given group.
    pub const GROUP: &str = "group";
    /// Container environment variables.
    pub const ENV: &str = "env";
    /// Container root directory.
    pub const ROOT: &str = "root";
    /// Mount the root read-only.
    pub const ROOT_RDONLY: &str = "root_readonly";
    /// Container working directory.
    pub const CWD: &str = "cwd";
    /// Container standard input path.
    pub const STDIN_PATH: &str = "stdin_path";
    /// Container standard output path.
    pub const STDOUT_PATH: &str = "stdout_path";
    /// Container standard error path.
    pub const STDERR_PATH: &str = "stderr_path";
    /// Byte cap on returned stdout/stderr data.
    pub const STDOUT_LIMIT: &str = "stdout_limit";
    /// Guaranteed amount of memory.
    pub const MEMORY_GUARANTEE: &str = "memory_guarantee";
    /// Memory hard limit.
    pub const MEMORY_LIMIT: &str = "memory_limit";
    /// Recharge memory on page fault.
    pub const RECHARGE_ON_PGFAULT: &str = "recharge_on_pgfault";
    /// CPU policy: normal, rt or idle.
    pub const CPU_POLICY: &str = "cpu_policy";
    /// CPU priority, 0-99.
    pub const CPU_PRIORITY: &str = "cpu_priority";
    /// Guaranteed CPU share, percent.
    pub const CPU_GUARANTEE: &str = "cpu_guarantee";
    /// CPU usage limit, percent.
    pub const CPU_LIMIT: &str = "cpu_limit";
    /// IO policy: normal or batch.
    pub const IO_POLICY: &str = "io_policy";
    /// Filesystem bandwidth limit, bytes/s.
    pub const IO_LIMIT: &str = "io_limit";
    /// Guaranteed network bandwidth per interface, bytes/s.
    pub const NET_GUARANTEE: &str = "net_guarantee";
    /// Maximum network bandwidth per interface, bytes/s.
    pub const NET_LIMIT: &str = "net_limit";
    /// Network priority per interface, 0-7.
    pub const NET_PRIORITY: &str = "net_priority";
    /// Automatically restart a dead container.
    pub const RESPAWN: &str = "respawn";
    /// Respawn count limit; negative means unlimited.
    pub const MAX_RESPAWNS: &str = "max_respawns";
    /// Isolate the container from its parent.
    pub const ISOLATE: &str = "isolate";
    /// Free-form user data.
    pub const PRIVATE: &str = "private";
    /// Resource limits applied to the task.
    pub const ULIMIT: &str = "ulimit";
    /// Container hostname.
    pub const HOSTNAME: &str = "hostname";
    /// Bind /etc/resolv.conf and /etc/hosts from the host.
    pub const BIND_DNS: &str = "bind_dns";
    /// Host directories shared with the container.
    pub const BIND: &str = "bind";
    /// Network configuration.
    pub const NET: &str = "net";
    /// Devices the container may use.
    pub const ALLOWED_DEVICES: &str = "allowed_devices";
    /// Capability limit of the task.
    pub const CAPABILITIES: &str = "capabilities";
    /// Address assignments per interface.
    pub const IP: &str = "ip";
    /// Default gateway.
    pub const DEFAULT_GW: &str = "default_gw";
    /// Virtualization mode: app or os.
    pub const VIRT_MODE: &str = "virt_mode";
    /// How long a dead container is kept before collection, seconds.
    pub const AGING_TIME: &str = "aging_time";
}

/// Value of `virt_mode` for plain applications.
pub const VIRT_MODE_APP: &str = "app";
/// Value of `virt_mode` for OS-like containers.
pub const VIRT_MODE_OS: &str = "os";

/// Supported capability names and whether OS-mode containers keep them.
pub const SUPPORTED_CAPS: &[(&str, bool)] = &[
    ("AUDIT_CONTROL", false),
    ("AUDIT_WRITE", false),
    ("BLOCK_SUSPEND", false),
    ("CHOWN", true),
    ("DAC_OVERRIDE", true),
    ("DAC_READ_SEARCH", false),
    ("FOWNER", true),
    ("FSETID", true),
    ("IPC_LOCK", true),
    ("IPC_OWNER", false),
    ("KILL", true),
    ("LEASE", false),
    ("LINUX_IMMUTABLE", false),
    ("MAC_ADMIN", false),
    ("MAC_OVERRIDE", false),
    ("MKNOD", false),
    ("NET_ADMIN", true),
    ("NET_BIND_SERVICE", true),
    ("NET_BROADCAST", false),
    ("NET_RAW", true),
    ("SETFCAP", false),
    ("SETGID", true),
    ("SETPCAP", false),
    ("SETUID", true),
    ("SYS_ADMIN", false),
    ("SYS_BOOT", false),
    ("SYS_CHROOT", true),
    ("SYS_MODULE", false),
    ("SYS_NICE", false),
    ("SYS_PACCT", false),
    ("SYS_PTRACE", false),
    ("SYS_RAWIO", false),
    ("SYS_RESOURCE", true),
    ("SYS_TIME", false),
    ("SYS_TTY_CONFIG", false),
    ("SYSLOG", false),
    ("WAKE_ALARM", false),
];

/// All property declarations, in client-listing order.
#[must_use]
#[allow(clippy::too_many_lines)]
pub fn declarations() -> Vec<PropDef> {
    vec![
        PropDef {
            name: names::COMMAND,
            desc: "Command executed upon container start",
            kind: ValueKind::Str,
            flags: PropFlags::PERSISTENT | PropFlags::OS_MODE,
            states: STATIC_PROPERTY,
            default: default_command,
            check: None,
        },
        PropDef {
            name: names::USER,
            desc: "Start command with given user",
            kind: ValueKind::Str,
            flags: PropFlags::SUPERUSER | PropFlags::PARENT_DEF | PropFlags::PERSISTENT,
            states: STATIC_PROPERTY,
            default: default_owner_user,
            check: Some(check_user),
        },
        PropDef {
            name: names::GROUP,
            desc: "Start command with given group",
            kind: ValueKind::Str,
            flags: PropFlags::SUPERUSER | PropFlags::PARENT_DEF | PropFlags::PERSISTENT,
            states: STATIC_PROPERTY,
            default: default_owner_group,
            check: Some(check_group),
        },
        PropDef {
            name: names::ENV,
            desc: "Container environment variables",
            kind: ValueKind::List,
            flags: PropFlags::PARENT_DEF | PropFlags::PERSISTENT,
            states: STATIC_PROPERTY,
            default: default_empty_list,
            check: None,
        },
        PropDef {
            name: names::ROOT,
            desc: "Container root directory",
            kind: ValueKind::Str,
            flags: PropFlags::PARENT_RO | PropFlags::PERSISTENT | PropFlags::PATH,
            states: STATIC_PROPERTY,
            default: |_| Value::Str("/".to_string()),
            check: Some(check_abs_path),
        },
        PropDef {
            name: names::ROOT_RDONLY,
            desc: "Mount root directory in read-only mode",
            kind: ValueKind::Bool,
            flags: PropFlags::PARENT_RO | PropFlags::PERSISTENT,
            states: STATIC_PROPERTY,
            default: default_false,
            check: None,
        },
        PropDef {
            name: names::CWD,
            desc: "Container working directory",
            kind: ValueKind::Str,
            flags: PropFlags::PARENT_DEF | PropFlags::PERSISTENT | PropFlags::OS_MODE,
            states: STATIC_PROPERTY,
            default: default_cwd,
            check: Some(check_abs_path),
        },
        PropDef {
            name: names::STDIN_PATH,
            desc: "Container standard input path",
            kind: ValueKind::Str,
            flags: PropFlags::PERSISTENT | PropFlags::OS_MODE | PropFlags::PATH,
            states: STATIC_PROPERTY,
            default: |_| Value::Str("/dev/null".to_string()),
            check: Some(check_existing_file),
        },
        PropDef {
            name: names::STDOUT_PATH,
            desc: "Container standard output path",
            kind: ValueKind::Str,
            flags: PropFlags::PERSISTENT | PropFlags::OS_MODE | PropFlags::PATH,
            states: STATIC_PROPERTY,
            default: |ctx| default_std_file(ctx, "stdout"),
            check: Some(check_abs_path),
        },
        PropDef {
            name: names::STDERR_PATH,
            desc: "Container standard error path",
            kind: ValueKind::Str,
            flags: PropFlags::PERSISTENT | PropFlags::OS_MODE | PropFlags::PATH,
            states: STATIC_PROPERTY,
            default: |ctx| default_std_file(ctx, "stderr"),
            check: Some(check_abs_path),
        },
        PropDef {
            name: names::STDOUT_LIMIT,
            desc: "Return no more than given number of bytes from stdout/stderr",
            kind: ValueKind::Uint,
            flags: PropFlags::PERSISTENT,
            states: STATIC_PROPERTY,
            default: |ctx| Value::Uint(ctx.holder.config().container.stdout_limit),
            check: Some(check_stdout_limit),
        },
        PropDef {
            name: names::MEMORY_GUARANTEE,
            desc: "Guaranteed amount of memory",
            kind: ValueKind::Uint,
            flags: PropFlags::PARENT_RO | PropFlags::PERSISTENT | PropFlags::UNIT_SUFFIX,
            states: DYNAMIC_PROPERTY,
            default: default_zero,
            check: Some(check_memory_guarantee),
        },
        PropDef {
            name: names::MEMORY_LIMIT,
            desc: "Memory hard limit",
            kind: ValueKind::Uint,
            flags: PropFlags::PERSISTENT | PropFlags::UNIT_SUFFIX,
            states: DYNAMIC_PROPERTY,
            default: default_zero,
            check: Some(check_memory_limit),
        },
        PropDef {
            name: names::RECHARGE_ON_PGFAULT,
            desc: "Recharge memory on page fault",
            kind: ValueKind::Bool,
            flags: PropFlags::PARENT_RO | PropFlags::PERSISTENT,
            states: DYNAMIC_PROPERTY,
            default: default_false,
            check: Some(check_recharge_on_pgfault),
        },
        PropDef {
            name: names::CPU_POLICY,
            desc: "CPU policy: rt, normal, idle",
            kind: ValueKind::Str,
            flags: PropFlags::PARENT_RO | PropFlags::PERSISTENT,
            states: DYNAMIC_PROPERTY,
            default: |_| Value::Str("normal".to_string()),
            check: Some(check_cpu_policy),
        },
        PropDef {
            name: names::CPU_PRIORITY,
            desc: "CPU priority: 0-99",
            kind: ValueKind::Uint,
            flags: PropFlags::PARENT_RO | PropFlags::PERSISTENT,
            states: DYNAMIC_PROPERTY,
            default: |ctx| Value::Uint(ctx.holder.config().container.default_cpu_prio),
            check: Some(check_cpu_priority),
        },
        PropDef {
            name: names::CPU_GUARANTEE,
            desc: "Guaranteed CPU share: 0-100%",
            kind: ValueKind::Uint,
            flags: PropFlags::PARENT_RO | PropFlags::PERSISTENT,
            states: DYNAMIC_PROPERTY,
            default: default_zero,
            check: Some(check_cpu_guarantee),
        },
        PropDef {
            name: names::CPU_LIMIT,
            desc: "CPU usage limit: 0-100%",
            kind: ValueKind::Uint,
            flags: PropFlags::PERSISTENT,
            states: DYNAMIC_PROPERTY,
            default: default_zero,
            check: Some(check_cpu_limit),
        },
        PropDef {
            name: names::IO_POLICY,
            desc: "IO policy: normal, batch",
            kind: ValueKind::Str,
            flags: PropFlags::PARENT_RO | PropFlags::PERSISTENT,
            states: DYNAMIC_PROPERTY,
            default: |_| Value::Str("normal".to_string()),
            check: Some(check_io_policy),
        },
        PropDef {
            name: names::IO_LIMIT,
            desc: "Filesystem bandwidth limit [bytes/s]",
            kind: ValueKind::Uint,
            flags: PropFlags::PERSISTENT | PropFlags::UNIT_SUFFIX,
            states: DYNAMIC_PROPERTY,
            default: default_zero,
            check: Some(check_io_limit),
        },
        PropDef {
            name: names::NET_GUARANTEE,
            desc: "Guaranteed container network bandwidth [bytes/s]",
            kind: ValueKind::UintMap,
            flags: PropFlags::PARENT_RO | PropFlags::PERSISTENT | PropFlags::UNIT_SUFFIX,
            states: STATIC_PROPERTY,
            default: |ctx| default_net_map(ctx, false),
            check: Some(check_net_map_keys),
        },
        PropDef {
            name: names::NET_LIMIT,
            desc: "Maximum container network bandwidth [bytes/s]",
            kind: ValueKind::UintMap,
            flags: PropFlags::PARENT_RO | PropFlags::PERSISTENT | PropFlags::UNIT_SUFFIX,
            states: STATIC_PROPERTY,
            default: |ctx| default_net_map(ctx, true),
            check: Some(check_net_map_keys),
        },
        PropDef {
            name: names::NET_PRIORITY,
            desc: "Container network priority: 0-7",
            kind: ValueKind::UintMap,
            flags: PropFlags::PARENT_RO | PropFlags::PERSISTENT,
            states: STATIC_PROPERTY,
            default: default_net_prio_map,
            check: Some(check_net_priority),
        },
        PropDef {
            name: names::RESPAWN,
            desc: "Automatically respawn dead container",
            kind: ValueKind::Bool,
            flags: PropFlags::PERSISTENT,
            states: STATIC_PROPERTY,
            default: default_false,
            check: None,
        },
        PropDef {
            name: names::MAX_RESPAWNS,
            desc: "Limit respawn count for specific container",
            kind: ValueKind::Int,
            flags: PropFlags::PERSISTENT,
            states: STATIC_PROPERTY,
            default: |_| Value::Int(-1),
            check: None,
        },
        PropDef {
            name: names::ISOLATE,
            desc: "Isolate container from parent",
            kind: ValueKind::Bool,
            flags: PropFlags::PERSISTENT | PropFlags::OS_MODE,
            states: STATIC_PROPERTY,
            default: |_| Value::Bool(true),
            check: None,
        },
        PropDef {
            name: names::PRIVATE,
            desc: "User-defined property",
            kind: ValueKind::Str,
            flags: PropFlags::PERSISTENT,
            states: DYNAMIC_PROPERTY,
            default: default_empty_str,
            check: Some(check_private_len),
        },
        PropDef {
            name: names::ULIMIT,
            desc: "Container resource limits",
            kind: ValueKind::List,
            flags: PropFlags::PARENT_DEF | PropFlags::PERSISTENT,
            states: STATIC_PROPERTY,
            default: default_empty_list,
            check: Some(check_ulimit),
        },
        PropDef {
            name: names::HOSTNAME,
            desc: "Container hostname",
            kind: ValueKind::Str,
            flags: PropFlags::PARENT_RO | PropFlags::PERSISTENT,
            states: STATIC_PROPERTY,
            default: default_empty_str,
            check: None,
        },
        PropDef {
            name: names::BIND_DNS,
            desc: "Bind /etc/resolv.conf and /etc/hosts of host to container",
            kind: ValueKind::Bool,
            flags: PropFlags::PARENT_RO | PropFlags::PERSISTENT | PropFlags::OS_MODE,
            states: STATIC_PROPERTY,
            default: default_bind_dns,
            check: None,
        },
        PropDef {
            name: names::BIND,
            desc: "Share host directories with container",
            kind: ValueKind::List,
            flags: PropFlags::PARENT_RO | PropFlags::PERSISTENT | PropFlags::OS_MODE,
            states: STATIC_PROPERTY,
            default: default_empty_list,
            check: Some(check_bind),
        },
        PropDef {
            name: names::NET,
            desc: "Container network settings",
            kind: ValueKind::List,
            flags: PropFlags::PARENT_RO | PropFlags::PERSISTENT,
            states: STATIC_PROPERTY,
            default: |_| Value::List(vec!["host".to_string()]),
            check: Some(check_net),
        },
        PropDef {
            name: names::ALLOWED_DEVICES,
            desc: "Devices that container can create/read/write",
            kind: ValueKind::List,
            flags: PropFlags::PARENT_RO | PropFlags::PERSISTENT | PropFlags::OS_MODE,
            states: STATIC_PROPERTY,
            default: default_allowed_devices,
            check: Some(check_devices),
        },
        PropDef {
            name: names::CAPABILITIES,
            desc: "Limit container capabilities",
            kind: ValueKind::List,
            flags: PropFlags::PERSISTENT | PropFlags::OS_MODE | PropFlags::SUPERUSER,
            states: STATIC_PROPERTY,
            default: default_capabilities,
            check: Some(check_capabilities),
        },
        PropDef {
            name: names::IP,
            desc: "IP configuration",
            kind: ValueKind::List,
            flags: PropFlags::PARENT_RO | PropFlags::PERSISTENT | PropFlags::HIDDEN,
            states: STATIC_PROPERTY,
            default: default_empty_list,
            check: Some(check_ip),
        },
        PropDef {
            name: names::DEFAULT_GW,
            desc: "Default gateway",
            kind: ValueKind::Str,
            flags: PropFlags::PARENT_RO | PropFlags::PERSISTENT | PropFlags::HIDDEN,
            states: STATIC_PROPERTY,
            default: |_| Value::Str("0.0.0.0".to_string()),
            check: Some(check_gateway),
        },
        PropDef {
            name: names::VIRT_MODE,
            desc: "Virtualization mode: os or app",
            kind: ValueKind::Str,
            flags: PropFlags::PERSISTENT | PropFlags::RESTROOT,
            states: STATIC_PROPERTY,
            default: |_| Value::Str(VIRT_MODE_APP.to_string()),
            check: Some(check_virt_mode),
        },
        PropDef {
            name: names::AGING_TIME,
            desc: "After given number of seconds dead container is ready for removal",
            kind: ValueKind::Uint,
            flags: PropFlags::PERSISTENT,
            states: DYNAMIC_PROPERTY,
            default: |ctx| Value::Uint(ctx.holder.config().container.aging_time.as_secs()),
            check: None,
        },
    ]
}

// Defaults.

fn default_empty_str(_: &PropCtx<'_>) -> Value {
    Value::Str(String::new())
}

fn default_empty_list(_: &PropCtx<'_>) -> Value {
    Value::List(Vec::new())
}

fn default_false(_: &PropCtx<'_>) -> Value {
    Value::Bool(false)
}

fn default_zero(_: &PropCtx<'_>) -> Value {
    Value::Uint(0)
}

fn default_command(ctx: &PropCtx<'_>) -> Value {
    if ctx.get(names::VIRT_MODE).as_str() == VIRT_MODE_OS {
        Value::Str("/sbin/init".to_string())
    } else {
        Value::Str(String::new())
    }
}

fn default_owner_user(ctx: &PropCtx<'_>) -> Value {
    let uid = ctx.holder.owner_uid(ctx.id);
    let name = nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
        .ok()
        .flatten()
        .map_or_else(|| uid.to_string(), |u| u.name);
    Value::Str(name)
}

fn default_owner_group(ctx: &PropCtx<'_>) -> Value {
    let gid = ctx.holder.owner_gid(ctx.id);
    let name = nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(gid))
        .ok()
        .flatten()
        .map_or_else(|| gid.to_string(), |g| g.name);
    Value::Str(name)
}

fn default_cwd(ctx: &PropCtx<'_>) -> Value {
    if ctx.get(names::VIRT_MODE).as_str() == VIRT_MODE_OS {
        return Value::Str("/".to_string());
    }
    if !ctx.is_default(names::ROOT) {
        return Value::Str("/".to_string());
    }
    let tmp = &ctx.holder.config().container.tmp_dir;
    let name = ctx.holder.name_of(ctx.id).replace('/', "_");
    Value::Str(tmp.join(name).to_string_lossy().into_owned())
}

fn default_std_file(ctx: &PropCtx<'_>, stream: &str) -> Value {
    if ctx.get(names::VIRT_MODE).as_str() == VIRT_MODE_OS {
        return Value::Str("/dev/null".to_string());
    }
    let root = ctx.get(names::ROOT).as_str().to_string();
    let path = if root == "/" {
        let name = ctx.holder.name_of(ctx.id).replace('/', "_");
        ctx.holder
            .config()
            .container
            .tmp_dir
            .join(format!("{name}.{stream}"))
    } else {
        let cwd = ctx.get(names::CWD).as_str().trim_start_matches('/').to_string();
        std::path::Path::new(&root).join(cwd).join(stream)
    };
    Value::Str(path.to_string_lossy().into_owned())
}

fn default_bind_dns(ctx: &PropCtx<'_>) -> Value {
    if ctx.get(names::VIRT_MODE).as_str() == VIRT_MODE_OS {
        return Value::Bool(false);
    }
    if !ctx.get(names::ISOLATE).as_bool() {
        return Value::Bool(false);
    }
    if ctx.is_default(names::ROOT) {
        return Value::Bool(false);
    }
    Value::Bool(true)
}

fn default_net_map(ctx: &PropCtx<'_>, limit: bool) -> Value {
    let config = &ctx.holder.config().network;
    let per_link = if ctx.id == crate::ROOT_ID {
        config.default_max_guarantee
    } else if limit {
        config.default_limit
    } else {
        config.default_guarantee
    };
    let mut map = BTreeMap::new();
    for link in ctx.link_names() {
        map.insert(link, per_link);
    }
    Value::UintMap(map)
}

fn default_net_prio_map(ctx: &PropCtx<'_>) -> Value {
    let prio = ctx.holder.config().network.default_prio;
    let mut map = BTreeMap::new();
    for link in ctx.link_names() {
        map.insert(link, prio);
    }
    Value::UintMap(map)
}

fn default_allowed_devices(ctx: &PropCtx<'_>) -> Value {
    if ctx.get(names::VIRT_MODE).as_str() == VIRT_MODE_OS {
        let os_devices = [
            "c 1:3 rwm", "c 1:5 rwm", "c 1:7 rwm", "c 1:8 rwm", "c 1:9 rwm", "c 5:2 rwm",
            "c 10:237 rmw", "c 136:* rw", "c 254:0 rm", "b 7:* rmw",
        ];
        Value::List(os_devices.iter().map(ToString::to_string).collect())
    } else {
        Value::List(vec!["a *:* rwm".to_string()])
    }
}

fn default_capabilities(ctx: &PropCtx<'_>) -> Value {
    let root_owner = ctx.holder.owner_uid(ctx.id) == 0;
    let os_mode = ctx.get(names::VIRT_MODE).as_str() == VIRT_MODE_OS;
    let caps = SUPPORTED_CAPS
        .iter()
        .filter(|(_, restricted)| root_owner || (os_mode && *restricted))
        .map(|(name, _)| (*name).to_string())
        .collect();
    Value::List(caps)
}

// Validators.

fn check_abs_path(_: &PropCtx<'_>, value: &Value) -> Result<()> {
    let path = value.as_str();
    if path.is_empty() || !path.starts_with('/') {
        return Err(Error::invalid_value("invalid directory"));
    }
    Ok(())
}

fn check_existing_file(_: &PropCtx<'_>, value: &Value) -> Result<()> {
    if !std::path::Path::new(value.as_str()).exists() {
        return Err(Error::invalid_value("file doesn't exist"));
    }
    Ok(())
}

fn check_user(_: &PropCtx<'_>, value: &Value) -> Result<()> {
    resolve_user(value.as_str()).map(|_| ())
}

fn check_group(_: &PropCtx<'_>, value: &Value) -> Result<()> {
    resolve_group(value.as_str()).map(|_| ())
}

fn check_stdout_limit(ctx: &PropCtx<'_>, value: &Value) -> Result<()> {
    let max = ctx.holder.config().container.stdout_limit;
    if value.as_uint() > max {
        return Err(Error::invalid_value(format!("Maximum number of bytes: {max}")));
    }
    Ok(())
}

fn check_memory_limit(ctx: &PropCtx<'_>, value: &Value) -> Result<()> {
    if !ctx
        .holder
        .valid_hierarchical(ctx.id, names::MEMORY_LIMIT, value.as_uint())
    {
        return Err(Error::invalid_value("invalid hierarchical value"));
    }
    Ok(())
}

fn check_memory_guarantee(ctx: &PropCtx<'_>, value: &Value) -> Result<()> {
    if let Some(memory) = ctx.holder.cgroups().get(Controller::Memory) {
        if !memory.host_root().has_knob(cgroup::MEMORY_GUARANTEE_KNOB) {
            return Err(Error::not_supported("invalid kernel"));
        }
    }
    if !ctx
        .holder
        .valid_hierarchical(ctx.id, names::MEMORY_GUARANTEE, value.as_uint())
    {
        return Err(Error::invalid_value("invalid hierarchical value"));
    }

    let total = ctx
        .holder
        .guarantee_sum(names::MEMORY_GUARANTEE, ctx.id, value.as_uint());
    let reserve = ctx.holder.config().daemon.memory_guarantee_reserve;
    if total.saturating_add(reserve) > cgroup::total_memory()? {
        return Err(Error::new(
            ErrorKind::ResourceNotAvailable,
            "can't guarantee all available memory",
        ));
    }
    Ok(())
}

fn check_recharge_on_pgfault(ctx: &PropCtx<'_>, _: &Value) -> Result<()> {
    if let Some(memory) = ctx.holder.cgroups().get(Controller::Memory) {
        if !memory.host_root().has_knob("memory.recharge_on_pgfault") {
            return Err(Error::not_supported("invalid kernel"));
        }
    }
    Ok(())
}

fn check_cpu_policy(ctx: &PropCtx<'_>, value: &Value) -> Result<()> {
    match value.as_str() {
        "normal" => Ok(()),
        "rt" => {
            if let Some(cpu) = ctx.holder.cgroups().get(Controller::Cpu) {
                if !cpu.host_root().has_knob("cpu.smart") {
                    return Err(Error::not_supported("invalid kernel"));
                }
            }
            Ok(())
        }
        "idle" => Err(Error::not_supported("not implemented")),
        _ => Err(Error::invalid_value("invalid policy")),
    }
}

fn check_cpu_priority(_: &PropCtx<'_>, value: &Value) -> Result<()> {
    if value.as_uint() > 99 {
        return Err(Error::invalid_value("invalid value"));
    }
    Ok(())
}

fn check_cpu_guarantee(ctx: &PropCtx<'_>, value: &Value) -> Result<()> {
    check_cpu_share(ctx, names::CPU_GUARANTEE, value)
}

fn check_cpu_limit(ctx: &PropCtx<'_>, value: &Value) -> Result<()> {
    check_cpu_share(ctx, names::CPU_LIMIT, value)
}

fn check_cpu_share(ctx: &PropCtx<'_>, name: &str, value: &Value) -> Result<()> {
    if value.as_uint() > 100 {
        return Err(Error::invalid_value("invalid value"));
    }
    if !ctx.holder.valid_hierarchical(ctx.id, name, value.as_uint()) {
        return Err(Error::invalid_value("invalid hierarchical value"));
    }
    Ok(())
}

fn check_io_policy(_: &PropCtx<'_>, value: &Value) -> Result<()> {
    match value.as_str() {
        "normal" | "batch" => Ok(()),
        _ => Err(Error::invalid_value("invalid policy")),
    }
}

fn check_io_limit(ctx: &PropCtx<'_>, _: &Value) -> Result<()> {
    if let Some(memory) = ctx.holder.cgroups().get(Controller::Memory) {
        if !memory.host_root().has_knob("memory.fs_bps_limit") {
            return Err(Error::not_supported("invalid kernel"));
        }
    }
    Ok(())
}

fn check_net_map_keys(ctx: &PropCtx<'_>, value: &Value) -> Result<()> {
    let links = ctx.link_names();
    for key in value.as_uint_map().keys() {
        if key != "default" && !links.contains(key) {
            return Err(Error::invalid_value(format!("invalid interface {key}")));
        }
    }
    Ok(())
}

fn check_net_priority(ctx: &PropCtx<'_>, value: &Value) -> Result<()> {
    check_net_map_keys(ctx, value)?;
    for prio in value.as_uint_map().values() {
        if *prio > 7 {
            return Err(Error::invalid_value("invalid value"));
        }
    }
    Ok(())
}

fn check_private_len(ctx: &PropCtx<'_>, value: &Value) -> Result<()> {
    let max = ctx.holder.config().container.private_max;
    if value.as_str().len() as u64 > max {
        return Err(Error::invalid_value("Value is too long"));
    }
    Ok(())
}

fn check_ulimit(_: &PropCtx<'_>, value: &Value) -> Result<()> {
    parse_ulimits(value.as_list()).map(|_| ())
}

fn check_bind(_: &PropCtx<'_>, value: &Value) -> Result<()> {
    parse_binds(value.as_list()).map(|_| ())
}

fn check_net(ctx: &PropCtx<'_>, value: &Value) -> Result<()> {
    if !ctx.holder.network_enabled() {
        return Err(Error::unknown("Network support is disabled"));
    }
    parse_net_cfg(value.as_list(), &ctx.link_names(), ctx.id.0).map(|_| ())
}

fn check_devices(_: &PropCtx<'_>, value: &Value) -> Result<()> {
    for line in value.as_list() {
        parse_device_line(line)?;
    }
    Ok(())
}

fn check_capabilities(_: &PropCtx<'_>, value: &Value) -> Result<()> {
    for name in value.as_list() {
        if !SUPPORTED_CAPS.iter().any(|(cap, _)| cap == name) {
            return Err(Error::invalid_value(format!("Unsupported capability {name}")));
        }
    }
    Ok(())
}

fn check_ip(_: &PropCtx<'_>, value: &Value) -> Result<()> {
    parse_ip_specs(value.as_list()).map(|_| ())
}

fn check_gateway(_: &PropCtx<'_>, value: &Value) -> Result<()> {
    value
        .as_str()
        .parse::<std::net::IpAddr>()
        .map(|_| ())
        .map_err(|_| Error::invalid_value(format!("invalid address {}", value.as_str())))
}

fn check_virt_mode(_: &PropCtx<'_>, value: &Value) -> Result<()> {
    match value.as_str() {
        VIRT_MODE_APP | VIRT_MODE_OS => Ok(()),
        other => Err(Error::invalid_value(format!("Unsupported virt_mode: {other}"))),
    }
}

// Shared parsers.

/// Resolve a user name or numeric uid.
///
/// # Errors
///
/// Returns `InvalidValue` for unknown users.
pub fn resolve_user(name: &str) -> Result<u32> {
    if let Ok(uid) = name.parse::<u32>() {
        return Ok(uid);
    }
    nix::unistd::User::from_name(name)
        .map_err(Error::from)?
        .map(|u| u.uid.as_raw())
        .ok_or_else(|| Error::invalid_value(format!("invalid user {name}")))
}

/// Resolve a group name or numeric gid.
///
/// # Errors
///
/// Returns `InvalidValue` for unknown groups.
pub fn resolve_group(name: &str) -> Result<u32> {
    if let Ok(gid) = name.parse::<u32>() {
        return Ok(gid);
    }
    nix::unistd::Group::from_name(name)
        .map_err(Error::from)?
        .map(|g| g.gid.as_raw())
        .ok_or_else(|| Error::invalid_value(format!("invalid group {name}")))
}

/// Parse `name: soft hard` ulimit lines.
///
/// # Errors
///
/// Returns `InvalidValue` for unknown names or malformed numbers.
pub fn parse_ulimits(lines: &[String]) -> Result<Vec<(Resource, u64, u64)>> {
    let mut out = Vec::new();
    for line in lines {
        let (name, rest) = line
            .split_once(':')
            .ok_or_else(|| Error::invalid_value("Invalid limits format"))?;
        let name = name.trim();
        let resource = resource_by_name(name)
            .ok_or_else(|| Error::invalid_value(format!("Invalid limit {name}")))?;

        let parts: Vec<&str> = rest.split_whitespace().collect();
        if parts.len() != 2 {
            return Err(Error::invalid_value(format!("Invalid limits number for {name}")));
        }
        let soft = parse_rlim(parts[0])
            .ok_or_else(|| Error::invalid_value(format!("Invalid soft limit for {name}")))?;
        let hard = parse_rlim(parts[1])
            .ok_or_else(|| Error::invalid_value(format!("Invalid hard limit for {name}")))?;
        out.push((resource, soft, hard));
    }
    Ok(out)
}

fn parse_rlim(text: &str) -> Option<u64> {
    if text == "unlim" || text == "unlimited" {
        return Some(libc::RLIM_INFINITY);
    }
    text.parse().ok()
}

fn resource_by_name(name: &str) -> Option<Resource> {
    let resource = match name {
        "as" => Resource::RLIMIT_AS,
        "core" => Resource::RLIMIT_CORE,
        "cpu" => Resource::RLIMIT_CPU,
        "data" => Resource::RLIMIT_DATA,
        "fsize" => Resource::RLIMIT_FSIZE,
        "locks" => Resource::RLIMIT_LOCKS,
        "memlock" => Resource::RLIMIT_MEMLOCK,
        "msgqueue" => Resource::RLIMIT_MSGQUEUE,
        "nice" => Resource::RLIMIT_NICE,
        "nofile" => Resource::RLIMIT_NOFILE,
        "nproc" => Resource::RLIMIT_NPROC,
        "rss" => Resource::RLIMIT_RSS,
        "rtprio" => Resource::RLIMIT_RTPRIO,
        "rttime" => Resource::RLIMIT_RTTIME,
        "sigpending" => Resource::RLIMIT_SIGPENDING,
        "stack" => Resource::RLIMIT_STACK,
        _ => return None,
    };
    Some(resource)
}

/// Parse `source dest [ro|rw]` bind lines. Always clears and rebuilds.
///
/// # Errors
///
/// Returns `InvalidValue` for malformed lines or missing sources.
pub fn parse_binds(lines: &[String]) -> Result<Vec<BindMount>> {
    let mut out = Vec::new();
    for line in lines {
        let tok: Vec<&str> = line.split_whitespace().collect();
        if tok.len() != 2 && tok.len() != 3 {
            return Err(Error::invalid_value(format!("Invalid bind in: {line}")));
        }
        let read_only = match tok.get(2) {
            None | Some(&"rw") => false,
            Some(&"ro") => true,
            Some(_) => {
                return Err(Error::invalid_value(format!("Invalid bind type in: {line}")));
            }
        };
        let source = std::path::PathBuf::from(tok[0]);
        if !source.exists() {
            return Err(Error::invalid_value(format!(
                "Source bind {} doesn't exist",
                source.display()
            )));
        }
        out.push(BindMount {
            source,
            dest: std::path::PathBuf::from(tok[1]),
            read_only,
        });
    }
    Ok(out)
}

/// Parse the `net` property lines into a [`NetCfg`].
///
/// # Errors
///
/// Returns `InvalidValue` for malformed or conflicting configurations.
#[allow(clippy::too_many_lines)]
pub fn parse_net_cfg(lines: &[String], links: &[String], id: u16) -> Result<NetCfg> {
    if lines.is_empty() {
        return Err(Error::invalid_value("Configuration is not specified"));
    }

    let mut cfg = NetCfg::default();
    let mut veth_index = 0u32;

    for line in lines {
        if cfg.none {
            return Err(Error::invalid_value("none can't be mixed with other types"));
        }
        if cfg.share_host {
            return Err(Error::invalid_value("host can't be mixed with other settings"));
        }

        let tok: Vec<&str> = line.split_whitespace().collect();
        let Some(&kind) = tok.first() else {
            return Err(Error::invalid_value(format!("Invalid net in: {line}")));
        };

        match kind {
            "none" => cfg.none = true,
            "host" => match tok.len() {
                1 => cfg.share_host = true,
                2 => {
                    let dev = tok[1].to_string();
                    if !links.contains(&dev) {
                        return Err(Error::invalid_value(format!("Invalid host interface {dev}")));
                    }
                    cfg.host.push(dev);
                }
                _ => return Err(Error::invalid_value(format!("Invalid net in: {line}"))),
            },
            "macvlan" => {
                // macvlan <master> <name> [type] [mtu] [hw]
                if tok.len() < 3 {
                    return Err(Error::invalid_value(format!("Invalid macvlan in: {line}")));
                }
                let master = tok[1].to_string();
                if !links.contains(&master) {
                    return Err(Error::invalid_value(format!("Invalid macvlan master {master}")));
                }
                let mode = tok.get(3).map_or("bridge", |m| *m).to_string();
                if !net::valid_macvlan_mode(&mode) {
                    return Err(Error::invalid_value(format!("Invalid macvlan type {mode}")));
                }
                let mtu = match tok.get(4) {
                    Some(raw) => Some(raw.parse().map_err(|_| {
                        Error::invalid_value(format!("Invalid macvlan mtu {raw}"))
                    })?),
                    None => None,
                };
                let hw = match tok.get(5) {
                    Some(raw) => Some(net::parse_mac(raw)?),
                    None => None,
                };
                cfg.macvlan.push(MacVlanCfg {
                    master,
                    name: tok[2].to_string(),
                    mode,
                    mtu,
                    hw,
                });
            }
            "veth" => {
                // veth <name> <bridge> [mtu] [hw]
                if tok.len() < 3 {
                    return Err(Error::invalid_value(format!("Invalid veth in: {line}")));
                }
                let mtu = match tok.get(3) {
                    Some(raw) => Some(raw.parse().map_err(|_| {
                        Error::invalid_value(format!("Invalid veth mtu {raw}"))
                    })?),
                    None => None,
                };
                let hw = match tok.get(4) {
                    Some(raw) => Some(net::parse_mac(raw)?),
                    None => None,
                };
                cfg.veth.push(VethCfg {
                    name: tok[1].to_string(),
                    bridge: tok[2].to_string(),
                    peer: format!("pdve-{id}-{veth_index}"),
                    mtu,
                    hw,
                });
                veth_index += 1;
            }
            _ => return Err(Error::invalid_value("Configuration is not specified")),
        }
    }
    Ok(cfg)
}

/// Parse `iface addr/prefix` lines from the `ip` property.
///
/// # Errors
///
/// Returns `InvalidValue` for malformed lines.
pub fn parse_ip_specs(lines: &[String]) -> Result<Vec<IpSpec>> {
    let mut out = Vec::new();
    for line in lines {
        let tok: Vec<&str> = line.split_whitespace().collect();
        if tok.len() != 2 {
            return Err(Error::invalid_value(format!("Invalid address/prefix in: {line}")));
        }
        let (addr, prefix) = net::parse_ip_prefix(tok[1])?;
        out.push(IpSpec {
            iface: tok[0].to_string(),
            addr,
            prefix,
        });
    }
    Ok(out)
}

/// Validate a `type major:minor access` device line.
///
/// # Errors
///
/// Returns `InvalidValue` for malformed lines.
pub fn parse_device_line(line: &str) -> Result<()> {
    let tok: Vec<&str> = line.split_whitespace().collect();
    if tok.len() != 3 {
        return Err(Error::invalid_value(format!("Invalid device specification: {line}")));
    }
    if !matches!(tok[0], "a" | "b" | "c") {
        return Err(Error::invalid_value(format!("Invalid device type in: {line}")));
    }
    let ok_number = |t: &str| t == "*" || t.parse::<u32>().is_ok();
    match tok[1].split_once(':') {
        Some((major, minor)) if ok_number(major) && ok_number(minor) => {}
        _ => return Err(Error::invalid_value(format!("Invalid device numbers in: {line}"))),
    }
    if tok[2].is_empty() || !tok[2].chars().all(|c| matches!(c, 'r' | 'w' | 'm')) {
        return Err(Error::invalid_value(format!("Invalid device access in: {line}")));
    }
    Ok(())
}

/// Capabilities kept by OS-mode containers of unprivileged owners.
#[must_use]
pub fn restricted_caps() -> Vec<String> {
    SUPPORTED_CAPS
        .iter()
        .filter(|(_, restricted)| *restricted)
        .map(|(name, _)| (*name).to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ulimits() {
        let lines = vec![
            "nofile: 1024 4096".to_string(),
            "core: unlim unlimited".to_string(),
        ];
        let limits = parse_ulimits(&lines).unwrap();
        assert_eq!(limits.len(), 2);
        assert_eq!(limits[0].0, Resource::RLIMIT_NOFILE);
        assert_eq!(limits[0].1, 1024);
        assert_eq!(limits[1].1, libc::RLIM_INFINITY);

        assert!(parse_ulimits(&["bogus: 1 2".to_string()]).is_err());
        assert!(parse_ulimits(&["nofile: 1".to_string()]).is_err());
        assert!(parse_ulimits(&["nofile 1 2".to_string()]).is_err());
    }

    #[test]
    fn test_parse_binds() {
        let lines = vec!["/tmp /mnt ro".to_string(), "/tmp /data".to_string()];
        let binds = parse_binds(&lines).unwrap();
        assert!(binds[0].read_only);
        assert!(!binds[1].read_only);

        assert!(parse_binds(&["/tmp".to_string()]).is_err());
        assert!(parse_binds(&["/tmp /mnt rx".to_string()]).is_err());
        assert!(parse_binds(&["/nonexistent-path-xyz /mnt".to_string()]).is_err());
    }

    #[test]
    fn test_parse_net_cfg() {
        let links = vec!["eth0".to_string()];

        let cfg = parse_net_cfg(&["host".to_string()], &links, 3).unwrap();
        assert!(cfg.share_host);

        let cfg = parse_net_cfg(
            &["macvlan eth0 eth0 bridge 1500 aa:bb:cc:dd:ee:ff".to_string()],
            &links,
            3,
        )
        .unwrap();
        assert_eq!(cfg.macvlan.len(), 1);
        assert_eq!(cfg.macvlan[0].mtu, Some(1500));

        let cfg = parse_net_cfg(&["veth eth0 br0".to_string()], &links, 7).unwrap();
        assert_eq!(cfg.veth[0].peer, "pdve-7-0");

        assert!(parse_net_cfg(&[], &links, 3).is_err());
        assert!(parse_net_cfg(&["macvlan missing eth0".to_string()], &links, 3).is_err());
        assert!(parse_net_cfg(
            &["host".to_string(), "none".to_string()],
            &links,
            3
        )
        .is_err());
        assert!(parse_net_cfg(
            &["none".to_string(), "veth eth0 br0".to_string()],
            &links,
            3
        )
        .is_err());
    }

    #[test]
    fn test_parse_ip_specs() {
        let specs = parse_ip_specs(&["eth0 10.0.0.2/24".to_string()]).unwrap();
        assert_eq!(specs[0].iface, "eth0");
        assert_eq!(specs[0].prefix, 24);
        assert!(parse_ip_specs(&["eth0".to_string()]).is_err());
    }

    #[test]
    fn test_parse_device_line() {
        parse_device_line("c 1:3 rwm").unwrap();
        parse_device_line("a *:* rwm").unwrap();
        assert!(parse_device_line("x 1:3 rwm").is_err());
        assert!(parse_device_line("c 1-3 rwm").is_err());
        assert!(parse_device_line("c 1:3 rwx").is_err());
    }

    #[test]
    fn test_restricted_caps_subset() {
        let restricted = restricted_caps();
        assert!(restricted.contains(&"SETUID".to_string()));
        assert!(!restricted.contains(&"SYS_ADMIN".to_string()));
        assert!(restricted.len() < SUPPORTED_CAPS.len());
    }
}
