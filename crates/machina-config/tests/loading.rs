use machina_config::load_machines;
use machina_domain::{OperatingSystem, ProviderKind};
use std::path::Path;

#[test]
fn load_valid_fixture() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/machines.yaml");
    let machines = load_machines(&path).expect("should load without error");
    assert_eq!(machines.len(), 2);

    let worker = &machines[0];
    assert_eq!(worker.machine.name, "worker-0");
    assert_eq!(worker.machine.namespace, "default");
    assert_eq!(worker.machine.spec.provider, ProviderKind::Openstack);
    assert_eq!(
        worker.machine.spec.operating_system,
        OperatingSystem::Ubuntu
    );
    assert_eq!(worker.machine.spec.provider_spec["flavor"], "m1.tiny");
    assert_eq!(worker.ssh_user.as_deref(), Some("ubuntu"));
    assert!(!worker.bastion);

    let bastion = &machines[1];
    assert!(bastion.bastion);
    assert!(bastion.ssh_user.is_none());
}

#[test]
fn uids_are_assigned_at_parse_time() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/machines.yaml");
    let machines = load_machines(&path).unwrap();
    assert!(!machines[0].machine.uid.as_str().is_empty());
    assert_ne!(machines[0].machine.uid, machines[1].machine.uid);
}

#[test]
fn missing_file_returns_error() {
    let path = Path::new("/nonexistent/machines.yaml");
    assert!(load_machines(path).is_err());
}

#[test]
fn unknown_provider_is_a_conversion_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("machines.yaml");
    std::fs::write(
        &path,
        "- name: w0\n  provider: vsphere\n  operatingSystem: ubuntu\n",
    )
    .unwrap();
    let err = load_machines(&path).unwrap_err();
    assert!(err.to_string().contains("unknown provider"), "{err}");
}

#[test]
fn invalid_name_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("machines.yaml");
    std::fs::write(
        &path,
        "- name: Not_A_Valid_Name\n  provider: fake\n  operatingSystem: ubuntu\n",
    )
    .unwrap();
    assert!(load_machines(&path).is_err());
}
