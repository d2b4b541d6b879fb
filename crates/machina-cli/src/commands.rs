use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use machina_config::Resolver;
use machina_domain::{Machine, ProviderKind};
use machina_engine::{Engine, EngineError, UserdataSource};
use machina_provider::{
    BaremetalProvider, FakeProvider, KubevirtProvider, OpenstackConfig, OpenstackProvider,
    ProviderRegistry, ReleaseFloatingIp,
};
use machina_store::{InMemoryStore, MachineStore};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::output;

/// Worker-pool cap: at most this many machines provision concurrently.
const DEFAULT_WORKERS: usize = 10;

/// Upper bound on reconcile passes per machine before giving up.
const MAX_PASSES: u32 = 120;

/// One-shot mode has no renderer; userdata comes straight from the manifest,
/// keyed by machine.
struct ManifestUserdata(HashMap<String, String>);

impl UserdataSource for ManifestUserdata {
    fn render(&self, machine: &Machine) -> Result<String, EngineError> {
        Ok(self.0.get(&machine.key()).cloned().unwrap_or_default())
    }
}

pub async fn create(machine_config: PathBuf) -> Result<()> {
    create_with_output(machine_config, PathBuf::from("machines.json")).await
}

pub(crate) async fn create_with_output(
    machine_config: PathBuf,
    output_path: PathBuf,
) -> Result<()> {
    let parsed = machina_config::load_machines(&machine_config)
        .with_context(|| format!("loading {}", machine_config.display()))?;
    if parsed.is_empty() {
        bail!("no machines in {}", machine_config.display());
    }
    info!(count = parsed.len(), "loaded machine manifests");

    // SecretRef values are unavailable in one-shot mode; specs use literals
    // and env references.
    let resolver = Resolver::without_secrets();
    let store = Arc::new(InMemoryStore::new());

    let userdata: HashMap<String, String> = parsed
        .iter()
        .map(|p| (p.machine.key(), p.userdata.clone()))
        .collect();

    let (registry, openstack) = build_registry(&resolver);
    let mut engine = Engine::new(
        Arc::new(registry),
        store.clone(),
        Arc::new(ManifestUserdata(userdata)),
    );
    if let Some(openstack) = openstack {
        engine.register_finalizer(Arc::new(ReleaseFloatingIp::new(openstack)));
    }
    let engine = Arc::new(engine);

    for p in &parsed {
        store
            .insert(&p.machine)
            .await
            .with_context(|| format!("seeding {}", p.machine.key()))?;
    }

    let semaphore = Arc::new(Semaphore::new(DEFAULT_WORKERS));
    let mut handles = Vec::new();
    for p in &parsed {
        let engine = engine.clone();
        let store = store.clone();
        let semaphore = semaphore.clone();
        let namespace = p.machine.namespace.clone();
        let name = p.machine.name.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .context("worker pool closed")?;
            drive(&engine, &store, &namespace, &name).await
        }));
    }

    let mut converged = Vec::new();
    let mut failures = Vec::new();
    for (p, handle) in parsed.iter().zip(handles) {
        match handle.await.context("worker panicked")? {
            Ok(machine) => converged.push((p, machine)),
            Err(e) => {
                warn!(machine = %p.machine.key(), error = %e, "provisioning failed");
                failures.push(format!("{}: {}", p.machine.key(), e));
            }
        }
    }
    if !failures.is_empty() {
        bail!(
            "{} of {} machines failed: {}",
            failures.len(),
            parsed.len(),
            failures.join("; ")
        );
    }

    let records = converged
        .iter()
        .map(|(p, m)| output::record_from(m, p.ssh_user.clone(), p.bastion))
        .collect();
    output::write_machines_json(&output_path, records)
        .with_context(|| format!("writing {}", output_path.display()))?;
    info!(path = %output_path.display(), machines = converged.len(), "wrote machine inventory");
    Ok(())
}

/// Reconcile one machine until it converges, honoring the engine's requeue
/// hints. A halt without convergence means the machine went terminal.
async fn drive(
    engine: &Engine,
    store: &Arc<InMemoryStore>,
    namespace: &str,
    name: &str,
) -> Result<Machine> {
    for _ in 0..MAX_PASSES {
        let machine = store.get(namespace, name).await?;
        let result = engine.reconcile(&machine).await?;
        if result.done {
            return Ok(store.get(namespace, name).await?);
        }
        match result.requeue_after {
            Some(delay) => tokio::time::sleep(delay.min(Duration::from_secs(10))).await,
            None => {
                let failed = store.get(namespace, name).await?;
                bail!(
                    "{}: {}",
                    failed
                        .status
                        .error_reason
                        .map(|r| r.to_string())
                        .unwrap_or_else(|| "Unknown".into()),
                    failed
                        .status
                        .error_message
                        .as_deref()
                        .unwrap_or("unknown error"),
                );
            }
        }
    }
    bail!("did not converge after {} passes", MAX_PASSES)
}

/// Register every backend the environment can support. OpenStack needs
/// operator-level service endpoints; without them the kind stays
/// unregistered and machines targeting it fail as misconfigured.
fn build_registry(resolver: &Resolver) -> (ProviderRegistry, Option<Arc<OpenstackProvider>>) {
    let mut registry = ProviderRegistry::new();
    registry.register(ProviderKind::Fake, Arc::new(FakeProvider::new()));
    registry.register(
        ProviderKind::Kubevirt,
        Arc::new(KubevirtProvider::new(resolver.clone())),
    );
    registry.register(
        ProviderKind::Baremetal,
        Arc::new(BaremetalProvider::new(resolver.clone())),
    );

    let openstack = match (
        std::env::var("OS_COMPUTE_ENDPOINT"),
        std::env::var("OS_NETWORK_ENDPOINT"),
    ) {
        (Ok(compute), Ok(network)) => {
            let config = OpenstackConfig {
                cluster_name: std::env::var("MACHINA_CLUSTER_NAME")
                    .unwrap_or_else(|_| "machina".into()),
                compute_endpoint: compute,
                network_endpoint: network,
            };
            let provider = Arc::new(OpenstackProvider::new(config, resolver.clone()));
            registry.register(ProviderKind::Openstack, provider.clone());
            Some(provider)
        }
        _ => None,
    };

    (registry, openstack)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_manifest(dir: &tempfile::TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("machines.yaml");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test]
    async fn create_provisions_manifest_and_writes_inventory() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_manifest(
            &dir,
            concat!(
                "- name: w0\n",
                "  provider: fake\n",
                "  operatingSystem: ubuntu\n",
                "  sshUser: core\n",
                "  userdata: \"#cloud-config\"\n",
                "- name: bastion-0\n",
                "  provider: fake\n",
                "  operatingSystem: flatcar\n",
                "  bastion: true\n",
            ),
        );
        let out = dir.path().join("machines.json");

        create_with_output(manifest, out.clone()).await.unwrap();

        let inventory: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        let machines = inventory["machines"].as_array().unwrap();
        assert_eq!(machines.len(), 2);

        assert_eq!(machines[0]["ssh_user"], "core");
        assert_eq!(machines[0]["private_address"], "192.0.2.1");
        assert_eq!(machines[0]["hostname"], "w0.fake.local");
        assert!(machines[0].get("public_address").is_none());
        assert!(machines[0].get("bastion").is_none());

        assert_eq!(machines[1]["bastion"], true);
        assert!(machines[1].get("ssh_user").is_none());
    }

    #[tokio::test]
    async fn create_fails_when_a_machine_goes_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_manifest(
            &dir,
            concat!(
                "- name: w0\n",
                "  provider: fake\n",
                "  operatingSystem: ubuntu\n",
                "  providerSpec:\n",
                "    failValidation: terminal\n",
            ),
        );
        let out = dir.path().join("machines.json");

        let err = create_with_output(manifest, out.clone())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("1 of 1 machines failed"), "{err}");
        assert!(!out.exists(), "no inventory on failure");
    }

    #[tokio::test]
    async fn create_rejects_empty_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_manifest(&dir, "[]\n");
        let err = create_with_output(manifest, dir.path().join("machines.json"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no machines"), "{err}");
    }
}
