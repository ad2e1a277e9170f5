//! Client-visible lifecycle scenarios, driven through the public holder
//! API only. Nothing here needs root or mounted controllers: containers
//! without a command run as metas.

use std::time::Duration;

use paddock_core::cgroup::CgroupLayer;
use paddock_core::config::DaemonConfig;
use paddock_core::event::EventLoop;
use paddock_core::kv::KvStore;
use paddock_core::{Cred, ErrorKind, Holder, State};

fn holder_at(dir: &std::path::Path) -> Holder {
    let kv_dir = dir.join("kv");
    std::fs::create_dir_all(&kv_dir).unwrap();
    let mut config = DaemonConfig::default();
    config.container.tmp_dir = dir.join("place");
    config.daemon.memory_guarantee_reserve = 1 << 20;
    Holder::new(config, CgroupLayer::empty(), KvStore::open(kv_dir), None).unwrap()
}

#[test]
fn meta_lifecycle_and_cascading_stop() {
    let dir = tempfile::tempdir().unwrap();
    let mut holder = holder_at(dir.path());

    holder.create("app", Cred::root()).unwrap();
    holder.create("app/db", Cred::root()).unwrap();

    // Starting the leaf brings the stopped parent up as a meta first.
    holder.start("app/db", None).unwrap();
    assert_eq!(holder.get_data("app", "state").unwrap(), "meta");
    assert_eq!(holder.get_data("app/db", "state").unwrap(), "meta");

    // Stop cascades over descendants before the parent itself.
    holder.stop("app").unwrap();
    assert_eq!(holder.get_data("app", "state").unwrap(), "stopped");
    assert_eq!(holder.get_data("app/db", "state").unwrap(), "stopped");

    // Stopping an already stopped container is a state error.
    let err = holder.stop("app").unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidState);

    holder.destroy("app").unwrap();
    let err = holder.destroy("app").unwrap_err();
    assert_eq!(err.kind, ErrorKind::ContainerDoesNotExist);
    assert!(holder.list().is_empty());
}

#[test]
fn hierarchical_limit_rejection() {
    let dir = tempfile::tempdir().unwrap();
    let mut holder = holder_at(dir.path());

    holder.create("p", Cred::root()).unwrap();
    holder
        .set_property("p", "memory_limit", "100M", &Cred::root(), None)
        .unwrap();
    holder.create("p/c", Cred::root()).unwrap();

    let err = holder
        .set_property("p/c", "memory_limit", "200M", &Cred::root(), None)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidValue);
    assert!(err.message.contains("invalid hierarchical value"));
}

#[test]
fn persistent_properties_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let events = EventLoop::new(Duration::from_secs(60)).unwrap();

    {
        let mut holder = holder_at(dir.path());
        holder.create("svc", Cred::root()).unwrap();
        holder
            .set_property("svc", "command", "/usr/bin/env true", &Cred::root(), None)
            .unwrap();
        holder
            .set_property("svc", "respawn", "true", &Cred::root(), None)
            .unwrap();
        holder
            .set_property("svc", "env", "A=1; B=two", &Cred::root(), None)
            .unwrap();
    }

    let mut holder = holder_at(dir.path());
    holder.restore_all(&events).unwrap();

    assert_eq!(
        holder.get_property("svc", "command", None).unwrap(),
        "/usr/bin/env true"
    );
    assert_eq!(holder.get_property("svc", "respawn", None).unwrap(), "true");
    assert_eq!(holder.get_property("svc", "env", None).unwrap(), "A=1; B=two");
    assert_eq!(holder.get_data("svc", "state").unwrap(), "stopped");
}

#[test]
fn wait_returns_for_non_running_containers() {
    let dir = tempfile::tempdir().unwrap();
    let mut holder = holder_at(dir.path());
    holder.create("w", Cred::root()).unwrap();

    let (tx, rx) = std::sync::mpsc::channel();
    holder.add_waiter("w", tx).unwrap();
    let event = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(event.name, "w");
    assert_eq!(event.state, State::Stopped);
}

#[test]
fn pause_requires_kernel_support() {
    let dir = tempfile::tempdir().unwrap();
    let mut holder = holder_at(dir.path());
    holder.create("m", Cred::root()).unwrap();
    holder.start("m", None).unwrap();

    // Without a freezer controller the pause surfaces NotSupported rather
    // than faking a state change.
    let err = holder.pause("m").unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotSupported);
    assert_eq!(holder.get_data("m", "state").unwrap(), "meta");
}

#[test]
fn kill_demands_a_running_task() {
    let dir = tempfile::tempdir().unwrap();
    let mut holder = holder_at(dir.path());
    holder.create("k", Cred::root()).unwrap();

    let err = holder
        .kill("k", nix::sys::signal::Signal::SIGTERM)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidState);
}
