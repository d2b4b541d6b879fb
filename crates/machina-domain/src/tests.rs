use crate::error::validate_machine_name;
use crate::types::*;
use serde_json::json;

#[test]
fn finalizer_set_preserves_declaration_order() {
    let mut f = FinalizerSet::new();
    assert!(f.add("machina.dev/release-openstack-floating-ip"));
    assert!(f.add("machina.dev/delete-cloud-init-secret"));
    assert_eq!(
        f.list(),
        &[
            "machina.dev/release-openstack-floating-ip".to_string(),
            "machina.dev/delete-cloud-init-secret".to_string(),
        ]
    );
}

#[test]
fn finalizer_set_rejects_duplicates() {
    let mut f = FinalizerSet::new();
    assert!(f.add("a"));
    assert!(!f.add("a"));
    assert_eq!(f.list().len(), 1);
}

#[test]
fn finalizer_set_remove_reports_presence() {
    let mut f = FinalizerSet::new();
    f.add("a");
    assert!(f.remove("a"));
    assert!(!f.remove("a"));
    assert!(f.is_empty());
}

#[test]
fn fingerprint_ignores_key_order() {
    let a = json!({ "flavor": "m1.tiny", "image": "ubuntu", "network": "public" });
    let b = json!({ "network": "public", "image": "ubuntu", "flavor": "m1.tiny" });
    assert_eq!(spec_fingerprint(&a), spec_fingerprint(&b));
}

#[test]
fn fingerprint_changes_on_any_field() {
    let a = json!({ "flavor": "m1.tiny", "image": "ubuntu" });
    let b = json!({ "flavor": "m1.small", "image": "ubuntu" });
    assert_ne!(spec_fingerprint(&a), spec_fingerprint(&b));
}

#[test]
fn fingerprint_descends_into_nested_maps() {
    let a = json!({ "net": { "a": 1, "b": 2 } });
    let b = json!({ "net": { "b": 2, "a": 1 } });
    assert_eq!(spec_fingerprint(&a), spec_fingerprint(&b));
}

#[test]
fn provider_kind_round_trips_through_str() {
    for kind in ["openstack", "kubevirt", "baremetal", "fake"] {
        let parsed: ProviderKind = kind.parse().unwrap();
        assert_eq!(parsed.to_string(), kind);
    }
    assert!("vsphere".parse::<ProviderKind>().is_err());
}

#[test]
fn operating_system_rejects_unknown() {
    assert!("ubuntu".parse::<OperatingSystem>().is_ok());
    assert!("windows".parse::<OperatingSystem>().is_err());
}

#[test]
fn address_of_finds_role() {
    let mut addresses = std::collections::HashMap::new();
    addresses.insert("10.0.0.4".to_string(), AddressRole::InternalIp);
    addresses.insert("203.0.113.9".to_string(), AddressRole::ExternalIp);
    let inst = Instance {
        id: "abc".into(),
        name: "test".into(),
        status: InstanceStatus::Running,
        addresses,
        provider_uri: "openstack:///abc".into(),
    };
    assert_eq!(inst.address_of(AddressRole::ExternalIp), Some("203.0.113.9"));
    assert_eq!(inst.address_of(AddressRole::Hostname), None);
}

#[test]
fn address_role_serializes_with_upstream_casing() {
    assert_eq!(
        serde_json::to_string(&AddressRole::InternalIp).unwrap(),
        "\"InternalIP\""
    );
    assert_eq!(
        serde_json::to_string(&AddressRole::InternalDns).unwrap(),
        "\"InternalDNS\""
    );
}

#[test]
fn machine_name_validation() {
    assert!(validate_machine_name("worker-0").is_ok());
    assert!(validate_machine_name("bm-1").is_ok());
    assert!(validate_machine_name("").is_err());
    assert!(validate_machine_name("-leading").is_err());
    assert!(validate_machine_name("UPPER").is_err());
    assert!(validate_machine_name(&"a".repeat(64)).is_err());
}

#[test]
fn machine_deletion_state() {
    let mut m = Machine {
        name: "test".into(),
        namespace: "default".into(),
        uid: Uid::new("u1"),
        spec: MachineSpec {
            provider: ProviderKind::Fake,
            provider_spec: json!({}),
            operating_system: OperatingSystem::Ubuntu,
            versions: MachineVersions::default(),
        },
        annotations: Default::default(),
        finalizers: FinalizerSet::new(),
        deletion_timestamp: None,
        status: MachineStatus::default(),
        resource_version: 0,
    };
    assert!(!m.is_deleting());
    m.deletion_timestamp = Some(chrono::Utc::now());
    assert!(m.is_deleting());
    assert_eq!(m.key(), "default/test");
}
