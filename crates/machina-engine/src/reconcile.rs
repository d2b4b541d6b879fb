use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use machina_domain::{spec_fingerprint, Instance, InstanceStatus, Machine, MachinePhase, Uid};
use machina_provider::{
    CloudProvider, FinalizerHook, ProviderData, ProviderError, ProviderRegistry, ValidationCache,
    Verdict,
};
use machina_store::MachineStore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backoff::Backoff;
use crate::error::EngineError;
use crate::finalizer::FinalizerManager;
use crate::userdata::UserdataSource;

/// Annotation carrying the fingerprint of the spec that produced the current
/// Failed phase. While it matches, reconcile passes are no-ops: retrying a
/// terminally failed spec cannot help, and skipping early keeps the upstream
/// quiet until the user edits the machine.
pub const FAILED_FINGERPRINT_ANNOTATION: &str = "machina.dev/failed-spec-fingerprint";

/// Requeue interval while an instance is still coming up or going away.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Outcome of one reconcile pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    /// When set, the surrounding loop should run another pass after this
    /// delay.
    pub requeue_after: Option<Duration>,
    /// True once the machine has converged for this pass: Running with
    /// addresses, or fully deleted.
    pub done: bool,
}

impl Reconciled {
    fn done() -> Self {
        Self {
            requeue_after: None,
            done: true,
        }
    }

    fn requeue(after: Duration) -> Self {
        Self {
            requeue_after: Some(after),
            done: false,
        }
    }

    fn halt() -> Self {
        Self {
            requeue_after: None,
            done: false,
        }
    }
}

/// The reconcile engine: drives one machine at a time toward its declared
/// state. The surrounding loop guarantees single-flight per machine key;
/// across machines the engine is freely concurrent.
pub struct Engine {
    registry: Arc<ProviderRegistry>,
    store: Arc<dyn MachineStore>,
    userdata: Arc<dyn UserdataSource>,
    cache: ValidationCache,
    finalizers: FinalizerManager,
    backoff: Backoff,
    /// Consecutive transient-failure counts per machine key; reset on any
    /// successful pass. The engine's only mutable state besides the cache.
    attempts: Mutex<HashMap<String, u32>>,
}

impl Engine {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        store: Arc<dyn MachineStore>,
        userdata: Arc<dyn UserdataSource>,
    ) -> Self {
        Self {
            registry,
            store,
            userdata,
            cache: ValidationCache::default(),
            finalizers: FinalizerManager::new(),
            backoff: Backoff::default(),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_validation_ttl(mut self, ttl: Duration) -> Self {
        self.cache = ValidationCache::new(ttl);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn register_finalizer(&mut self, hook: Arc<dyn FinalizerHook>) -> &mut Self {
        self.finalizers.register(hook);
        self
    }

    /// Periodically drop expired validation verdicts. The janitor runs for
    /// the life of the process; callers keep the handle only to abort it in
    /// tests.
    pub fn spawn_cache_janitor(engine: Arc<Engine>) -> tokio::task::JoinHandle<()> {
        let interval = engine.cache.sweep_interval();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                engine.cache.sweep();
            }
        })
    }

    // ── Reconcile ─────────────────────────────────────────────────────────────

    /// Run one pass for `machine`. Idempotent: repeated passes with an
    /// unchanged spec converge to `done`.
    pub async fn reconcile(&self, machine: &Machine) -> Result<Reconciled, EngineError> {
        let pass = Uuid::new_v4();
        debug!(machine = %machine.key(), %pass, phase = %machine.status.phase, "reconcile pass");

        // Deletion preempts everything, including Failed.
        if machine.is_deleting() {
            return self.reconcile_deletion(machine).await;
        }

        // Terminal short-circuit: a Failed machine with an unchanged spec
        // issues no upstream calls at all.
        if machine.status.phase == MachinePhase::Failed {
            let fp = spec_fingerprint(&machine.spec.provider_spec);
            if machine.annotation(FAILED_FINGERPRINT_ANNOTATION) == Some(fp.as_str()) {
                debug!(machine = %machine.key(), "failed with unchanged spec, skipping");
                return Ok(Reconciled::halt());
            }
        }

        let provider = match self.registry.for_machine(machine) {
            Ok(p) => p,
            Err(e) => return self.fail_or_requeue(machine, e.into()).await,
        };

        // Validate, consulting the fingerprint cache first. Verdicts —
        // including clean ones — are memoized for the TTL window.
        let fingerprint = spec_fingerprint(&machine.spec.provider_spec);
        let verdict = match self.cache.lookup(&fingerprint) {
            Some(v) => {
                debug!(machine = %machine.key(), "validation cache hit");
                v
            }
            None => {
                let result = provider.validate(&machine.spec.provider_spec).await;
                let v = Verdict::from_result(&result);
                self.cache.insert(fingerprint.clone(), v.clone());
                v
            }
        };
        if let Err(e) = verdict.into_result() {
            return self.fail_or_requeue(machine, e.into()).await;
        }

        // Apply and persist defaults. The defaulter is a fixed point, so the
        // write happens at most once per spec shape.
        let defaulted = match provider.add_defaults(machine.spec.provider_spec.clone()) {
            Ok(s) => s,
            Err(e) => return self.fail_or_requeue(machine, e.into()).await,
        };
        let mut machine = machine.clone();
        if defaulted != machine.spec.provider_spec {
            debug!(machine = %machine.key(), "persisting defaulted spec");
            let spec = defaulted.clone();
            self.store
                .update(&machine.namespace, &machine.name, &move |m| {
                    m.spec.provider_spec = spec.clone();
                })
                .await?;
            machine.spec.provider_spec = defaulted;
        }

        let data = ProviderData {
            store: self.store.clone(),
        };

        match provider.get(&machine).await {
            Ok(instance) => self.surface(&machine, instance).await,
            Err(ProviderError::InstanceNotFound) => {
                let userdata = match self.userdata.render(&machine) {
                    Ok(u) => u,
                    Err(e) => return self.fail_or_requeue(&machine, e).await,
                };
                info!(machine = %machine.key(), "no instance bound, creating");
                match provider.create(&machine, &userdata, &data).await {
                    Ok(instance) => self.surface(&machine, instance).await,
                    Err(e) => self.fail_or_requeue(&machine, e.into()).await,
                }
            }
            Err(e) => self.fail_or_requeue(&machine, e.into()).await,
        }
    }

    // ── Delete ────────────────────────────────────────────────────────────────

    /// Cleanup plus finalizers. Returns true only when the backend resource
    /// is fully gone AND every finalizer has run; the surrounding loop then
    /// removes the machine from the store.
    pub async fn delete(&self, machine: &Machine) -> Result<bool, EngineError> {
        let provider = self.registry.for_machine(machine)?;

        if machine.status.phase != MachinePhase::Deleting {
            self.store
                .update(&machine.namespace, &machine.name, &|m| {
                    m.status.phase = MachinePhase::Deleting;
                    m.status.last_updated = Some(Utc::now());
                })
                .await?;
        }

        let data = ProviderData {
            store: self.store.clone(),
        };
        let done = provider.cleanup(machine, &data).await?;
        if !done {
            debug!(machine = %machine.key(), "backend deletion in progress");
            return Ok(false);
        }

        // Backend gone; release out-of-band allocations. Work from a fresh
        // snapshot — earlier passes may have added annotations.
        let current = match self.store.get(&machine.namespace, &machine.name).await {
            Ok(m) => m,
            Err(e) if e.is_not_found() => return Ok(true),
            Err(e) => return Err(e.into()),
        };
        self.finalizers.run_all(&current, &self.store).await?;

        let after = match self.store.get(&machine.namespace, &machine.name).await {
            Ok(m) => m,
            Err(e) if e.is_not_found() => return Ok(true),
            Err(e) => return Err(e.into()),
        };
        Ok(after.finalizers.is_empty())
    }

    async fn reconcile_deletion(&self, machine: &Machine) -> Result<Reconciled, EngineError> {
        match self.delete(machine).await {
            Ok(true) => {
                info!(machine = %machine.key(), "deletion complete");
                self.clear_attempts(machine);
                Ok(Reconciled::done())
            }
            Ok(false) => Ok(Reconciled::requeue(POLL_INTERVAL)),
            Err(e) => {
                // Cleanup errors never transition to Failed: stay in
                // Deleting and retry, terminal or not.
                let attempt = self.bump_attempts(machine);
                warn!(machine = %machine.key(), error = %e, attempt, "cleanup failed, retrying");
                Ok(Reconciled::requeue(self.backoff.delay(attempt)))
            }
        }
    }

    // ── Identity ──────────────────────────────────────────────────────────────

    /// Relabel the backend resource for a store-initiated UID rewrite, then
    /// record the new UID on the machine.
    pub async fn migrate_uid(&self, machine: &Machine, new_uid: &Uid) -> Result<(), EngineError> {
        let provider = self.registry.for_machine(machine)?;
        provider.migrate_uid(machine, new_uid).await?;

        let uid = new_uid.clone();
        self.store
            .update(&machine.namespace, &machine.name, &move |m| {
                m.uid = uid.clone();
            })
            .await?;
        info!(machine = %machine.key(), new_uid = %new_uid, "uid migrated");
        Ok(())
    }

    // ── Outcome handling ──────────────────────────────────────────────────────

    /// Write the observed instance into status and decide the pass outcome.
    async fn surface(
        &self,
        machine: &Machine,
        instance: Instance,
    ) -> Result<Reconciled, EngineError> {
        let running = instance.status == InstanceStatus::Running && !instance.addresses.is_empty();
        let phase = if running {
            MachinePhase::Running
        } else {
            MachinePhase::Provisioning
        };

        let inst = instance.clone();
        self.store
            .update(&machine.namespace, &machine.name, &move |m| {
                m.status.phase = phase;
                m.status.instance_id = Some(inst.id.clone());
                m.status.provider_uri = Some(inst.provider_uri.clone());
                m.status.addresses = inst.addresses.clone();
                m.status.error_reason = None;
                m.status.error_message = None;
                m.status.last_updated = Some(Utc::now());
                m.remove_annotation(FAILED_FINGERPRINT_ANNOTATION);
            })
            .await?;
        self.clear_attempts(machine);

        if running {
            debug!(machine = %machine.key(), instance = %instance.id, "running");
            Ok(Reconciled::done())
        } else {
            debug!(machine = %machine.key(), instance = %instance.id,
                   status = ?instance.status, "not running yet");
            Ok(Reconciled::requeue(POLL_INTERVAL))
        }
    }

    /// Terminal errors mark the machine Failed (once, with the offending
    /// fingerprint pinned); transient errors schedule a jittered backoff and
    /// deliberately write no status to avoid thrash.
    async fn fail_or_requeue(
        &self,
        machine: &Machine,
        err: EngineError,
    ) -> Result<Reconciled, EngineError> {
        if err.is_terminal() {
            let (reason, message) = err.status_reason();
            warn!(machine = %machine.key(), %reason, %message, "terminal error, marking failed");
            let fp = spec_fingerprint(&machine.spec.provider_spec);
            self.store
                .update(&machine.namespace, &machine.name, &move |m| {
                    m.status.phase = MachinePhase::Failed;
                    m.status.error_reason = Some(reason);
                    m.status.error_message = Some(message.clone());
                    m.status.last_updated = Some(Utc::now());
                    m.set_annotation(FAILED_FINGERPRINT_ANNOTATION, fp.clone());
                })
                .await?;
            self.clear_attempts(machine);
            Ok(Reconciled::halt())
        } else {
            let attempt = self.bump_attempts(machine);
            let delay = self.backoff.delay(attempt);
            warn!(machine = %machine.key(), error = %err, attempt, ?delay,
                  "transient error, requeueing");
            Ok(Reconciled::requeue(delay))
        }
    }

    fn bump_attempts(&self, machine: &Machine) -> u32 {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        let entry = attempts.entry(machine.key()).or_insert(0);
        let current = *entry;
        *entry += 1;
        current
    }

    fn clear_attempts(&self, machine: &Machine) {
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&machine.key());
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
