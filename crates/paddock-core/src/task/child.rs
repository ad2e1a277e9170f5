//! Child-side setup: everything between the final fork and `execve`.
//!
//! Runs in the freshly forked task process, inside whatever namespaces the
//! middle process arranged. Every stage reports completion over the spawn
//! socket; the first failure is returned to the caller, which serializes it
//! back to the supervisor and exits.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::unistd::Pid;

use super::{Stage, TaskEnv};
use crate::error::{Error, Result};

/// Where the old root stays mounted until the isolation stage.
const OLD_ROOT: &str = ".paddock.old";

/// Run every setup stage and exec the command. Only returns on failure.
pub(super) fn run(env: &TaskEnv, sock: &mut UnixStream, sock2: &mut UnixStream) -> (Stage, Error) {
    macro_rules! stage {
        ($stage:expr, $body:expr) => {
            if let Err(e) = $body {
                return ($stage, e);
            }
            report_stage(sock, $stage);
        };
    }

    stage!(Stage::Stdio, setup_stdio(env));
    stage!(Stage::Limits, apply_limits(env));
    stage!(Stage::Hostname, set_hostname(env));
    stage!(Stage::RootFs, mount_root_fs(env));
    stage!(Stage::Run, mount_run(env));
    stage!(Stage::Binds, mount_binds(env));
    stage!(Stage::Dns, bind_dns(env));
    stage!(Stage::RootRo, remount_root_ro(env));
    stage!(Stage::IsolateFs, isolate_fs(env));
    stage!(Stage::Cgroups, attach_cgroups(env));
    stage!(Stage::Autoconf, wait_autoconf(sock2));
    stage!(Stage::Capabilities, apply_capabilities(env));
    stage!(Stage::Credentials, apply_credentials(env));

    (Stage::Credentials, exec_command(env))
}

fn report_stage(sock: &mut UnixStream, stage: Stage) {
    let _ = sock.write_all(&[stage as u8]);
}

fn setup_stdio(env: &TaskEnv) -> Result<()> {
    let stdin = OpenOptions::new().read(true).open(&env.stdin_path)?;
    let stdout = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&env.stdout_path)?;
    let stderr = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&env.stderr_path)?;

    nix::unistd::dup2(stdin.as_raw_fd(), libc::STDIN_FILENO)?;
    nix::unistd::dup2(stdout.as_raw_fd(), libc::STDOUT_FILENO)?;
    nix::unistd::dup2(stderr.as_raw_fd(), libc::STDERR_FILENO)?;
    Ok(())
}

fn apply_limits(env: &TaskEnv) -> Result<()> {
    for (resource, soft, hard) in &env.rlimits {
        nix::sys::resource::setrlimit(*resource, *soft, *hard)?;
    }
    Ok(())
}

fn set_hostname(env: &TaskEnv) -> Result<()> {
    if env.isolate && !env.hostname.is_empty() {
        nix::unistd::sethostname(&env.hostname)?;
    }
    Ok(())
}

fn pivoted(env: &TaskEnv) -> bool {
    env.new_mount_ns && env.root != Path::new("/")
}

fn mount_root_fs(env: &TaskEnv) -> Result<()> {
    if env.loop_dev >= 0 {
        let device = crate::loopdev::device_path(env.loop_dev);
        mount_image(&device, &env.root)?;
    }

    if env.root == Path::new("/") {
        return Ok(());
    }

    if env.new_mount_ns {
        // Bind the root onto itself so pivot_root accepts it, keep the old
        // root mounted for the bind and dns stages.
        mount(
            Some(&env.root),
            &env.root,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )?;
        std::fs::create_dir_all(env.root.join(OLD_ROOT))?;
        nix::unistd::chdir(&env.root)?;
        nix::unistd::pivot_root(".", OLD_ROOT)?;
        nix::unistd::chdir("/")?;
    } else {
        nix::unistd::chroot(&env.root)?;
        nix::unistd::chdir("/")?;
    }
    Ok(())
}

fn mount_image(device: &Path, target: &Path) -> Result<()> {
    std::fs::create_dir_all(target)?;
    let mut last = Error::unknown("no filesystem type fits the image");
    for fstype in ["ext4", "squashfs"] {
        match mount(
            Some(device),
            target,
            Some(fstype),
            MsFlags::empty(),
            None::<&str>,
        ) {
            Ok(()) => return Ok(()),
            Err(e) => last = e.into(),
        }
    }
    Err(last)
}

fn mount_run(env: &TaskEnv) -> Result<()> {
    if !env.new_mount_ns {
        return Ok(());
    }
    let run = Path::new("/run");
    if !run.exists() {
        std::fs::create_dir_all(run)?;
    }
    mount(
        Some("tmpfs"),
        run,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some("mode=755"),
    )?;
    Ok(())
}

/// Translate a host path so it stays reachable after the pivot.
fn host_view(env: &TaskEnv, path: &Path) -> PathBuf {
    if pivoted(env) {
        Path::new("/")
            .join(OLD_ROOT)
            .join(path.strip_prefix("/").unwrap_or(path))
    } else {
        path.to_path_buf()
    }
}

fn mount_binds(env: &TaskEnv) -> Result<()> {
    for bind in &env.bind_mounts {
        let source = host_view(env, &bind.source);
        let dest = &bind.dest;

        if source.is_dir() {
            std::fs::create_dir_all(dest)?;
        } else {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            if !dest.exists() {
                std::fs::File::create(dest)?;
            }
        }
        mount(
            Some(&source),
            dest,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )?;
        if bind.read_only {
            mount(
                None::<&str>,
                dest,
                None::<&str>,
                MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY,
                None::<&str>,
            )?;
        }
    }
    Ok(())
}

fn bind_dns(env: &TaskEnv) -> Result<()> {
    if !env.bind_dns || !pivoted(env) {
        return Ok(());
    }
    for file in ["/etc/hosts", "/etc/resolv.conf"] {
        let source = host_view(env, Path::new(file));
        let dest = Path::new(file);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !dest.exists() {
            std::fs::File::create(dest)?;
        }
        mount(
            Some(&source),
            dest,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )?;
    }
    Ok(())
}

fn remount_root_ro(env: &TaskEnv) -> Result<()> {
    if !env.root_rdonly {
        return Ok(());
    }
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY,
        None::<&str>,
    )?;
    Ok(())
}

fn isolate_fs(env: &TaskEnv) -> Result<()> {
    if !env.new_mount_ns {
        return Ok(());
    }
    if pivoted(env) {
        let old = Path::new("/").join(OLD_ROOT);
        umount2(&old, MntFlags::MNT_DETACH)?;
        let _ = std::fs::remove_dir(&old);
    }
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )?;
    Ok(())
}

fn attach_cgroups(env: &TaskEnv) -> Result<()> {
    let pid = Pid::this();
    for path in &env.cgroup_paths {
        std::fs::write(path.join("cgroup.procs"), pid.as_raw().to_string())?;
    }
    Ok(())
}

fn wait_autoconf(sock2: &mut UnixStream) -> Result<()> {
    use std::io::Read;
    let mut byte = [0u8; 1];
    sock2
        .read_exact(&mut byte)
        .map_err(|e| Error::unknown(format!("network configuration was not signaled: {e}")))?;
    Ok(())
}

fn apply_capabilities(env: &TaskEnv) -> Result<()> {
    let map_err = |e: caps::errors::CapsError| Error::unknown(e.to_string());

    for cap in caps::all() {
        if !env.cap_limit.contains(&cap) {
            caps::drop(None, caps::CapSet::Bounding, cap).map_err(map_err)?;
        }
    }
    for cap in &env.cap_ambient {
        caps::raise(None, caps::CapSet::Inheritable, *cap).map_err(map_err)?;
        caps::raise(None, caps::CapSet::Ambient, *cap).map_err(map_err)?;
    }

    // The uid change in the next stage clears the permitted set, and the
    // ambient set with it, unless the kernel is told to keep them.
    if !env.cap_ambient.is_empty() {
        nix::sys::prctl::set_keepcaps(true)?;
    }
    Ok(())
}

fn apply_credentials(env: &TaskEnv) -> Result<()> {
    let uid = nix::unistd::Uid::from_raw(env.cred.uid);
    let gid = nix::unistd::Gid::from_raw(env.cred.gid);
    let groups: Vec<nix::unistd::Gid> = env
        .cred
        .groups
        .iter()
        .map(|g| nix::unistd::Gid::from_raw(*g))
        .collect();

    nix::unistd::setgroups(&groups)?;
    nix::unistd::setresgid(gid, gid, gid)?;
    nix::unistd::setresuid(uid, uid, uid)?;
    if !env.cap_ambient.is_empty() {
        nix::sys::prctl::set_keepcaps(false)?;
    }
    Ok(())
}

fn exec_command(env: &TaskEnv) -> Error {
    let cwd = if env.cwd.as_os_str().is_empty() {
        Path::new("/")
    } else {
        env.cwd.as_path()
    };
    if let Err(e) = nix::unistd::chdir(cwd) {
        return Error::with_errno(
            crate::error::ErrorKind::Unknown,
            e as i32,
            format!("cannot chdir to {}: {e}", cwd.display()),
        );
    }

    let to_cstr = |s: &str| std::ffi::CString::new(s.as_bytes());
    let Ok(shell) = to_cstr("/bin/sh") else {
        return Error::unknown("bad shell path");
    };
    let argv = match ["/bin/sh", "-c", env.command.as_str()]
        .iter()
        .map(|s| to_cstr(s))
        .collect::<std::result::Result<Vec<_>, _>>()
    {
        Ok(argv) => argv,
        Err(_) => return Error::invalid_value("command contains a NUL byte"),
    };
    let envp = match env
        .env
        .iter()
        .map(|s| to_cstr(s))
        .collect::<std::result::Result<Vec<_>, _>>()
    {
        Ok(envp) => envp,
        Err(_) => return Error::invalid_value("environment contains a NUL byte"),
    };

    match nix::unistd::execve(&shell, &argv, &envp) {
        Ok(infallible) => match infallible {},
        Err(e) => Error::with_errno(
            crate::error::ErrorKind::Unknown,
            e as i32,
            format!("execve failed: {e}"),
        ),
    }
}
