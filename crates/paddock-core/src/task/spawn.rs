//! The multi-fork spawn protocol.
//!
//! The supervisor must end up able to wait on the task without owning its
//! pid namespace. The daemon is a child subreaper, so the common case is a
//! triple fork: the middle process arranges namespaces, forks the task and
//! exits; the task re-parents to the daemon. Entering a pre-existing pid
//! namespace takes a quadro fork so the intermediate dies inside that
//! namespace and the task re-parents to its init.
//!
//! Two socket pairs connect the sides: the report socket carries the task
//! pid (with kernel-translated credentials), stage bytes and the error
//! record; the autoconf socket holds the task until the supervisor finished
//! provisioning its network.

use std::io::{IoSlice, IoSliceMut, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;

use nix::sys::socket::{
    recvmsg, sendmsg, setsockopt, sockopt, ControlMessage, ControlMessageOwned, MsgFlags,
    UnixAddr, UnixCredentials,
};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, ForkResult, Pid};
use prost::Message;
use tracing::{debug, warn};

use super::{child, SpawnError, Task, TaskEnv};
use crate::error::{Error, ErrorKind, Result};
use crate::net::{shaper, Network};

/// `EX_SOFTWARE`, the child's exit code on any setup failure.
const EX_SOFTWARE: i32 = 70;

/// Marker byte that precedes an error record on the report socket.
const ERROR_MARKER: u8 = 0xff;

/// Spawn the task described by `env`.
///
/// `net` carries the shaper when the supervisor must provision interfaces;
/// the caller holds the network lock for the duration.
///
/// # Errors
///
/// Returns the child's error record as the start error; the container
/// stays stopped and the caller unwinds resources.
pub fn start(env: &TaskEnv, net: Option<&Network>) -> Result<Task> {
    let (master, child_sock) = UnixStream::pair()?;
    let (master2, child_sock2) = UnixStream::pair()?;
    setsockopt(&master, sockopt::PassCred, &true)?;

    // SAFETY: the child half only runs async-signal-safe setup before its
    // exec or _exit; the supervisor side continues normally.
    let middle = match unsafe { fork() }? {
        ForkResult::Child => {
            drop(master);
            drop(master2);
            middle_main(env, child_sock, child_sock2);
        }
        ForkResult::Parent { child } => child,
    };
    drop(child_sock);
    drop(child_sock2);

    let spawn_result = supervise_spawn(env, net, &master, &master2);

    // The middle process exits as soon as the task is forked.
    match waitpid(middle, None) {
        Ok(status) => debug!(?status, "middle process reaped"),
        Err(e) => warn!(error = %e, "cannot reap middle process"),
    }

    spawn_result
}

fn supervise_spawn(
    env: &TaskEnv,
    net: Option<&Network>,
    master: &UnixStream,
    master2: &UnixStream,
) -> Result<Task> {
    let (vpid, pid) = recv_pid(master)?;
    debug!(%pid, %vpid, container = %env.container, "task forked");

    if let Some(net) = net {
        provision_network(net, env, pid)?;
    }
    // Release the task from its autoconf fence.
    let mut autoconf = master2;
    autoconf.write_all(&[1u8])?;

    read_child_outcome(master)?;
    Ok(Task::started(pid, vpid, pid))
}

/// Drain stage bytes until the socket closes (exec reached, success) or an
/// error record arrives.
fn read_child_outcome(master: &UnixStream) -> Result<()> {
    let mut sock = master;
    let mut byte = [0u8; 1];
    loop {
        match sock.read(&mut byte) {
            Ok(0) => return Ok(()),
            Ok(_) if byte[0] == ERROR_MARKER => {
                let mut raw = Vec::new();
                sock.read_to_end(&mut raw)?;
                let record = SpawnError::decode_length_delimited(raw.as_slice())?;
                return Err(Error::with_errno(
                    ErrorKind::Unknown,
                    record.errno,
                    format!("task setup stage {} failed: {}", record.stage, record.message),
                ));
            }
            Ok(_) => debug!(stage = byte[0], "child stage complete"),
            Err(e) => return Err(e.into()),
        }
    }
}

fn middle_main(env: &TaskEnv, sock: UnixStream, sock2: UnixStream) -> ! {
    let quadro = env.quadro_fork();

    if !env.isolate && !env.parent_ns.is_empty() {
        if env.parent_ns.enter().is_err() {
            std::process::exit(EX_SOFTWARE);
        }
    } else if env.isolate {
        let mut flags = nix::sched::CloneFlags::CLONE_NEWPID
            | nix::sched::CloneFlags::CLONE_NEWIPC
            | nix::sched::CloneFlags::CLONE_NEWUTS;
        if env.new_mount_ns {
            flags |= nix::sched::CloneFlags::CLONE_NEWNS;
        }
        if env.net.new_namespace() {
            flags |= nix::sched::CloneFlags::CLONE_NEWNET;
        }
        if nix::sched::unshare(flags).is_err() {
            std::process::exit(EX_SOFTWARE);
        }
    }

    // SAFETY: both sides either exec, _exit, or fall through to task_main.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => {}
        Err(_) => std::process::exit(EX_SOFTWARE),
    }

    if quadro {
        // Die inside the entered pid namespace; the grandchild re-parents
        // to that namespace's init.
        match unsafe { fork() } {
            Ok(ForkResult::Parent { .. }) => std::process::exit(0),
            Ok(ForkResult::Child) => {}
            Err(_) => std::process::exit(EX_SOFTWARE),
        }
    }

    task_main(env, sock, sock2);
}

fn task_main(env: &TaskEnv, mut sock: UnixStream, mut sock2: UnixStream) -> ! {
    if report_pid(&sock).is_err() {
        std::process::exit(EX_SOFTWARE);
    }

    let (stage, error) = child::run(env, &mut sock, &mut sock2);
    let record = SpawnError {
        stage: stage as u32,
        errno: error.errno(),
        message: error.message,
    };
    let _ = sock.write_all(&[ERROR_MARKER]);
    let _ = sock.write_all(&record.encode_length_delimited_to_vec());
    std::process::exit(EX_SOFTWARE);
}

/// Send our pid over the report socket. The payload carries the pid as
/// this process sees it; the attached credentials carry the same pid
/// translated into the supervisor's namespace.
fn report_pid(sock: &UnixStream) -> Result<()> {
    let vpid = Pid::this().as_raw();
    let payload = vpid.to_ne_bytes();
    let creds = UnixCredentials::new();
    let cmsg = [ControlMessage::ScmCredentials(&creds)];
    sendmsg::<UnixAddr>(
        sock.as_raw_fd(),
        &[IoSlice::new(&payload)],
        &cmsg,
        MsgFlags::empty(),
        None,
    )?;
    Ok(())
}

/// Receive `(vpid, pid)` from the report socket.
fn recv_pid(sock: &UnixStream) -> Result<(Pid, Pid)> {
    let mut payload = [0u8; 4];
    let mut iov = [IoSliceMut::new(&mut payload)];
    let mut cmsg_buffer = nix::cmsg_space!(UnixCredentials);

    let msg = recvmsg::<UnixAddr>(
        sock.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buffer),
        MsgFlags::empty(),
    )?;
    if msg.bytes == 0 {
        return Err(Error::unknown("task died before reporting its pid"));
    }

    let mut pid = None;
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmCredentials(creds) = cmsg {
            pid = Some(Pid::from_raw(creds.pid()));
        }
    }
    let pid = pid.ok_or_else(|| Error::unknown("no credentials on pid report"))?;
    let vpid = Pid::from_raw(i32::from_ne_bytes(payload));
    Ok((vpid, pid))
}

/// Create and move the container's interfaces, then configure addresses
/// from inside its network namespace.
fn provision_network(net: &Network, env: &TaskEnv, pid: Pid) -> Result<()> {
    let cfg = &env.net;
    if cfg.share_host || (cfg.none && env.ip.is_empty()) {
        return Ok(());
    }
    let ns_pid = pid.as_raw() as u32;

    for iface in &cfg.host {
        let index = shaper::link_index(net.socket(), iface)?;
        shaper::move_link(net.socket(), index, ns_pid)?;
    }
    for mv in &cfg.macvlan {
        let master = shaper::link_index(net.socket(), &mv.master)?;
        shaper::create_macvlan(net.socket(), mv, master, ns_pid)?;
    }
    for veth in &cfg.veth {
        let bridge = shaper::link_index(net.socket(), &veth.bridge)?;
        shaper::create_veth(net.socket(), veth, bridge, ns_pid)?;
    }

    configure_task_namespace(env, pid)
}

/// Fork a helper into the task's network namespace to bring links up and
/// assign addresses; `setns` moves the helper, never the supervisor.
fn configure_task_namespace(env: &TaskEnv, pid: Pid) -> Result<()> {
    // SAFETY: the helper only runs namespace and netlink calls, then exits.
    match unsafe { fork() }? {
        ForkResult::Child => {
            let code = match configure_inside(env, pid) {
                Ok(()) => 0,
                Err(_) => EX_SOFTWARE,
            };
            std::process::exit(code);
        }
        ForkResult::Parent { child } => {
            let status = waitpid(child, None)?;
            match status {
                nix::sys::wait::WaitStatus::Exited(_, 0) => Ok(()),
                other => Err(Error::unknown(format!(
                    "network configuration helper failed: {other:?}"
                ))),
            }
        }
    }
}

fn configure_inside(env: &TaskEnv, pid: Pid) -> Result<()> {
    let ns = std::fs::File::open(format!("/proc/{pid}/ns/net"))?;
    nix::sched::setns(&ns, nix::sched::CloneFlags::CLONE_NEWNET)?;

    let sock = crate::net::netlink::NetlinkSocket::connect()?;
    if let Ok(lo) = shaper::link_index(&sock, "lo") {
        let _ = shaper::set_link_up(&sock, lo);
    }
    for ip in &env.ip {
        let index = shaper::link_index(&sock, &ip.iface)?;
        shaper::add_address(&sock, index, ip)?;
        shaper::set_link_up(&sock, index)?;
    }
    if let Some(gw) = env.default_gw {
        if !gw.is_unspecified() {
            shaper::add_default_gateway(&sock, gw)?;
        }
    }
    Ok(())
}
