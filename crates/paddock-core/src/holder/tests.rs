use std::sync::mpsc;

use super::*;
use crate::cgroup::CgroupLayer;
use crate::config::DaemonConfig;
use crate::kv::KvStore;

fn test_holder() -> (tempfile::TempDir, Holder) {
    let dir = tempfile::tempdir().unwrap();
    let kv_dir = dir.path().join("kv");
    std::fs::create_dir_all(&kv_dir).unwrap();

    let mut config = DaemonConfig::default();
    config.container.tmp_dir = dir.path().join("place");
    // Keep guarantee validation meaningful on small test hosts.
    config.daemon.memory_guarantee_reserve = 1 << 20;

    let holder = Holder::new(config, CgroupLayer::empty(), KvStore::open(kv_dir), None).unwrap();
    (dir, holder)
}

fn unprivileged() -> Cred {
    Cred {
        uid: 1000,
        gid: 1000,
        groups: vec![1000],
    }
}

#[test]
fn test_permanent_containers() {
    let (_dir, holder) = test_holder();
    assert_eq!(holder.find("/").unwrap(), ROOT_ID);
    assert_eq!(holder.find("/paddock").unwrap(), PADDOCK_ROOT_ID);
    assert_eq!(holder.state_of(ROOT_ID).unwrap(), State::Meta);
    assert!(holder.list().is_empty());
}

#[test]
fn test_create_and_lookup() {
    let (_dir, mut holder) = test_holder();
    let id = holder.create("a", Cred::root()).unwrap();
    assert_eq!(id, ContainerId(3));
    assert_eq!(holder.find("a").unwrap(), id);
    assert_eq!(holder.state_of(id).unwrap(), State::Stopped);
    assert_eq!(holder.name_of(id), "a");

    let child = holder.create("a/b", Cred::root()).unwrap();
    assert_eq!(holder.name_of(child), "a/b");
    assert_eq!(holder.require(child).unwrap().parent, Some(id));
    assert_eq!(holder.children_of(id), vec![child]);

    assert_eq!(holder.get_data("a", "children").unwrap(), "a/b");
    assert_eq!(holder.get_data("a/b", "children").unwrap(), "");
    assert_eq!(holder.get_data("a/b", "parent").unwrap(), "a");

    assert_eq!(holder.list(), vec!["a".to_string(), "a/b".to_string()]);
}

#[test]
fn test_create_duplicate_and_missing_parent() {
    let (_dir, mut holder) = test_holder();
    holder.create("a", Cred::root()).unwrap();

    let err = holder.create("a", Cred::root()).unwrap_err();
    assert_eq!(err.kind, ErrorKind::ContainerAlreadyExists);

    let err = holder.create("missing/b", Cred::root()).unwrap_err();
    assert_eq!(err.kind, ErrorKind::ContainerDoesNotExist);
}

#[test]
fn test_name_validation() {
    let (_dir, mut holder) = test_holder();
    for bad in ["", "/", "/paddock", ".", "a//b", "a b", "a\tb", "/abs"] {
        let err = holder.create(bad, Cred::root()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidValue, "name {bad:?}");
    }
    holder.create("ok-name_1.x@y", Cred::root()).unwrap();
}

#[test]
fn test_destroy_and_does_not_exist() {
    let (_dir, mut holder) = test_holder();
    holder.create("a", Cred::root()).unwrap();
    holder.create("a/b", Cred::root()).unwrap();

    holder.destroy("a").unwrap();
    assert!(holder.find("a").is_err());
    assert!(holder.find("a/b").is_err());

    let err = holder.destroy("a").unwrap_err();
    assert_eq!(err.kind, ErrorKind::ContainerDoesNotExist);

    let err = holder.destroy("/").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Permission);
}

#[test]
fn test_id_reuse_after_destroy() {
    let (_dir, mut holder) = test_holder();
    let first = holder.create("a", Cred::root()).unwrap();
    holder.create("b", Cred::root()).unwrap();
    holder.destroy("a").unwrap();

    let reused = holder.create("c", Cred::root()).unwrap();
    assert_eq!(first, reused);
}

#[test]
fn test_set_get_property_round_trip() {
    let (_dir, mut holder) = test_holder();
    holder.create("a", Cred::root()).unwrap();

    holder
        .set_property("a", "command", "/bin/true", &Cred::root(), None)
        .unwrap();
    assert_eq!(holder.get_property("a", "command", None).unwrap(), "/bin/true");

    // Unset values resolve through their defaults.
    assert_eq!(holder.get_property("a", "root", None).unwrap(), "/");
    assert_eq!(holder.get_property("a", "isolate", None).unwrap(), "true");

    let err = holder.get_property("a", "bogus", None).unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidProperty);

    let err = holder
        .set_property("/", "command", "/bin/true", &Cred::root(), None)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidValue);
}

#[test]
fn test_unit_suffix_and_validation() {
    let (_dir, mut holder) = test_holder();
    holder.create("a", Cred::root()).unwrap();

    holder
        .set_property("a", "memory_limit", "100M", &Cred::root(), None)
        .unwrap();
    assert_eq!(
        holder.get_property("a", "memory_limit", None).unwrap(),
        (100u64 << 20).to_string()
    );

    let err = holder
        .set_property("a", "cpu_priority", "200", &Cred::root(), None)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidValue);

    let err = holder
        .set_property("a", "virt_mode", "vm", &Cred::root(), None)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidValue);
}

#[test]
fn test_hierarchical_limit_rejection() {
    let (_dir, mut holder) = test_holder();
    holder.create("p", Cred::root()).unwrap();
    holder.create("p/c", Cred::root()).unwrap();

    holder
        .set_property("p", "memory_limit", "100M", &Cred::root(), None)
        .unwrap();

    let err = holder
        .set_property("p/c", "memory_limit", "200M", &Cred::root(), None)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidValue);
    assert!(err.message.contains("invalid hierarchical value"));

    holder
        .set_property("p/c", "memory_limit", "50M", &Cred::root(), None)
        .unwrap();

    // Tightening the parent below the children's sum is rejected too.
    let err = holder
        .set_property("p", "memory_limit", "10M", &Cred::root(), None)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidValue);
}

#[test]
fn test_sibling_sum_rejection() {
    let (_dir, mut holder) = test_holder();
    holder.create("p", Cred::root()).unwrap();
    holder.create("p/a", Cred::root()).unwrap();
    holder.create("p/b", Cred::root()).unwrap();

    holder
        .set_property("p", "memory_limit", "100M", &Cred::root(), None)
        .unwrap();
    holder
        .set_property("p/a", "memory_limit", "70M", &Cred::root(), None)
        .unwrap();

    let err = holder
        .set_property("p/b", "memory_limit", "60M", &Cred::root(), None)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidValue);

    holder
        .set_property("p/b", "memory_limit", "30M", &Cred::root(), None)
        .unwrap();
}

#[test]
fn test_memory_guarantee_exhaustion() {
    let (_dir, mut holder) = test_holder();
    holder.create("a", Cred::root()).unwrap();

    // Guaranteeing more than the host holds must fail with
    // ResourceNotAvailable, not InvalidValue.
    let err = holder
        .set_property("a", "memory_guarantee", "1024T", &Cred::root(), None)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ResourceNotAvailable);

    holder
        .set_property("a", "memory_guarantee", "1M", &Cred::root(), None)
        .unwrap();
}

#[test]
fn test_superuser_property_permission() {
    let (_dir, mut holder) = test_holder();
    holder.create("a", unprivileged()).unwrap();

    let err = holder
        .set_property("a", "user", "root", &unprivileged(), None)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Permission);

    holder
        .set_property("a", "user", "root", &Cred::root(), None)
        .unwrap();
}

#[test]
fn test_restroot_property_permission() {
    let (_dir, mut holder) = test_holder();
    holder.create("a", unprivileged()).unwrap();

    let err = holder
        .set_property("a", "virt_mode", "os", &unprivileged(), None)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Permission);

    holder
        .set_property("a", "virt_mode", "os", &Cred::root(), None)
        .unwrap();
    // OS mode flips the command default.
    assert_eq!(holder.get_property("a", "command", None).unwrap(), "/sbin/init");
}

#[test]
fn test_static_property_rejected_while_running() {
    let (_dir, mut holder) = test_holder();
    let id = holder.create("m", Cred::root()).unwrap();
    holder.start("m", None).unwrap();
    assert_eq!(holder.state_of(id).unwrap(), State::Meta);

    let err = holder
        .set_property("m", "command", "/bin/true", &Cred::root(), None)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidState);

    // Dynamic properties stay settable.
    holder
        .set_property("m", "memory_limit", "100M", &Cred::root(), None)
        .unwrap();
}

#[test]
fn test_meta_start_stop_cascade() {
    let (_dir, mut holder) = test_holder();
    let parent = holder.create("p", Cred::root()).unwrap();
    let child = holder.create("p/c", Cred::root()).unwrap();

    holder.start("p/c", None).unwrap();
    // The stopped parent came up as meta first.
    assert_eq!(holder.state_of(parent).unwrap(), State::Meta);
    assert_eq!(holder.state_of(child).unwrap(), State::Meta);

    let err = holder.start("p/c", None).unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidState);

    holder.stop("p").unwrap();
    assert_eq!(holder.state_of(parent).unwrap(), State::Stopped);
    assert_eq!(holder.state_of(child).unwrap(), State::Stopped);

    let err = holder.stop("p").unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidState);
}

#[test]
fn test_exit_marks_subtree_dead() {
    let (_dir, mut holder) = test_holder();
    let parent = holder.create("p", Cred::root()).unwrap();
    let child = holder.create("p/c", Cred::root()).unwrap();
    holder.start("p/c", None).unwrap();

    holder.exit(parent, 0, false, true);
    assert_eq!(holder.state_of(parent).unwrap(), State::Dead);
    assert_eq!(holder.state_of(child).unwrap(), State::Dead);
    assert_eq!(holder.require(parent).unwrap().exit_status, 0);
    assert!(holder.require(parent).unwrap().death_time_ms > 0);
}

#[test]
fn test_exit_status_data_gating() {
    let (_dir, mut holder) = test_holder();
    let id = holder.create("a", Cred::root()).unwrap();

    assert_eq!(holder.get_data("a", "state").unwrap(), "stopped");

    // exit_status is meaningless before death.
    let err = holder.get_data("a", "exit_status").unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidState);

    holder.start("a", None).unwrap();
    holder.exit(id, 256, false, true);
    assert_eq!(holder.get_data("a", "exit_status").unwrap(), "256");
    assert_eq!(holder.get_data("a", "oom_killed").unwrap(), "false");

    let err = holder.get_data("a", "bogus").unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidData);
}

#[test]
fn test_acquired_excludes_subtree_operations() {
    let (_dir, mut holder) = test_holder();
    let parent = holder.create("p", Cred::root()).unwrap();
    holder.create("p/c", Cred::root()).unwrap();

    holder.require_mut(parent).unwrap().acquired = true;
    let err = holder.start("p/c", None).unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidState);
    assert!(err.message.contains("busy"));

    holder.require_mut(parent).unwrap().acquired = false;
    holder.start("p/c", None).unwrap();
}

#[test]
fn test_waiter_fires_immediately_when_not_running() {
    let (_dir, mut holder) = test_holder();
    holder.create("a", Cred::root()).unwrap();

    let (tx, rx) = mpsc::channel();
    holder.add_waiter("a", tx).unwrap();
    let event = rx.try_recv().unwrap();
    assert_eq!(event.name, "a");
    assert_eq!(event.state, State::Stopped);
}

#[test]
fn test_persistence_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let kv_dir = dir.path().join("kv");
    std::fs::create_dir_all(&kv_dir).unwrap();
    let mut config = DaemonConfig::default();
    config.container.tmp_dir = dir.path().join("place");

    let events = EventLoop::new(std::time::Duration::from_secs(60)).unwrap();

    {
        let mut holder = Holder::new(
            config.clone(),
            CgroupLayer::empty(),
            KvStore::open(&kv_dir),
            None,
        )
        .unwrap();
        holder.create("p", Cred::root()).unwrap();
        holder.create("p/c", unprivileged()).unwrap();
        holder
            .set_property("p/c", "command", "/bin/sleep 1", &Cred::root(), None)
            .unwrap();
        holder
            .set_property("p/c", "memory_limit", "64M", &Cred::root(), None)
            .unwrap();
    }

    let mut restored = Holder::new(
        config,
        CgroupLayer::empty(),
        KvStore::open(&kv_dir),
        None,
    )
    .unwrap();
    restored.restore_all(&events).unwrap();

    assert_eq!(
        restored.get_property("p/c", "command", None).unwrap(),
        "/bin/sleep 1"
    );
    assert_eq!(
        restored.get_property("p/c", "memory_limit", None).unwrap(),
        (64u64 << 20).to_string()
    );
    assert_eq!(restored.state_of(restored.find("p/c").unwrap()).unwrap(), State::Stopped);
    assert_eq!(restored.owner_uid(restored.find("p/c").unwrap()), 1000);
    // Parent/child relationship survives the restart.
    let parent = restored.find("p").unwrap();
    assert_eq!(restored.children_of(parent).len(), 1);
}

#[test]
fn test_destroy_removes_kv_record() {
    let (_dir, mut holder) = test_holder();
    let id = holder.create("a", Cred::root()).unwrap();
    assert!(holder.kv().exists(id));

    holder.destroy("a").unwrap();
    assert!(!holder.kv().exists(id));
}

#[test]
fn test_parent_ro_rejected_for_non_isolated_child() {
    let (_dir, mut holder) = test_holder();
    holder.create("p", Cred::root()).unwrap();
    holder
        .set_property("p", "command", "/bin/sleep 60", &Cred::root(), None)
        .unwrap();
    holder.create("p/c", Cred::root()).unwrap();
    holder
        .set_property("p/c", "isolate", "false", &Cred::root(), None)
        .unwrap();

    // Without a running parent the child is still isolated in effect, so
    // the hostname set goes through.
    holder
        .set_property("p/c", "hostname", "inner", &Cred::root(), None)
        .unwrap();
}

#[test]
fn test_indexed_get_rejects_unknown_index() {
    let (_dir, mut holder) = test_holder();
    holder.create("a", Cred::root()).unwrap();

    let err = holder
        .get_property("a", "net_guarantee[eth99]", None)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidValue);
}

#[test]
fn test_path_property_translation() {
    let (_dir, mut holder) = test_holder();
    holder.create("a", Cred::root()).unwrap();

    let client_root = Path::new("/clients/jail");
    holder
        .set_property("a", "root", "/data", &Cred::root(), Some(client_root))
        .unwrap();
    // Stored host-side under the client root; surfaced back relative.
    assert_eq!(
        holder.get_property("a", "root", None).unwrap(),
        "/clients/jail/data"
    );
    assert_eq!(
        holder.get_property("a", "root", Some(client_root)).unwrap(),
        "/data"
    );
}

#[test]
fn test_reset_property_returns_to_default() {
    let (_dir, mut holder) = test_holder();
    holder.create("a", Cred::root()).unwrap();

    holder
        .set_property("a", "command", "/bin/true", &Cred::root(), None)
        .unwrap();
    holder.reset_property("a", "command", &Cred::root()).unwrap();
    assert_eq!(holder.get_property("a", "command", None).unwrap(), "");

    // The reset is durable: a rewritten node no longer carries the key.
    let id = holder.find("a").unwrap();
    let pairs = holder.kv().load(id).unwrap();
    assert!(pairs.iter().all(|p| p.key != "command"));
    assert!(pairs.iter().any(|p| p.key == "raw_name"));

    let err = holder
        .reset_property("a", "user", &unprivileged())
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Permission);
}

#[test]
fn test_respawn_scheduling_gate() {
    let (_dir, mut holder) = test_holder();
    let id = holder.create("r", Cred::root()).unwrap();
    holder
        .set_property("r", "respawn", "true", &Cred::root(), None)
        .unwrap();
    holder
        .set_property("r", "max_respawns", "2", &Cred::root(), None)
        .unwrap();

    holder.start("r", None).unwrap();
    holder.exit(id, 256, false, true);

    let respawn = holder.effective_value(id, names::RESPAWN).as_bool();
    let max = holder.effective_value(id, names::MAX_RESPAWNS).as_int();
    assert!(holder.require(id).unwrap().may_respawn(respawn, max));

    holder.require_mut(id).unwrap().respawn_count = 2;
    assert!(!holder.require(id).unwrap().may_respawn(respawn, max));
}
