use machina_domain::Machine;

use crate::error::EngineError;

/// Renders the boot userdata for a machine. The per-OS renderers are an
/// external collaborator; the engine only needs the finished text to hand to
/// the provider.
pub trait UserdataSource: Send + Sync + 'static {
    fn render(&self, machine: &Machine) -> Result<String, EngineError>;
}

/// Fixed userdata for every machine. Used by tests and the one-shot CLI,
/// whose manifests carry pre-rendered userdata.
pub struct StaticUserdata(pub String);

impl UserdataSource for StaticUserdata {
    fn render(&self, _machine: &Machine) -> Result<String, EngineError> {
        Ok(self.0.clone())
    }
}
