mod loader;
mod raw;
pub mod error;
pub mod resolve;

pub use error::ConfigError;
pub use loader::{load_machines, ParsedMachine};
pub use resolve::{DeclaredValue, MapSecrets, NoSecrets, Resolver, SecretKeyRef, SecretSource};
