pub mod backoff;
pub mod error;
pub mod finalizer;
pub mod reconcile;
pub mod userdata;

pub use backoff::Backoff;
pub use error::EngineError;
pub use finalizer::FinalizerManager;
pub use reconcile::{Engine, Reconciled, FAILED_FINGERPRINT_ANNOTATION};
pub use userdata::{StaticUserdata, UserdataSource};
