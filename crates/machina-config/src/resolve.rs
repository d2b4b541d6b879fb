use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ── Declared values ───────────────────────────────────────────────────────────

/// Reference into a secret object held by the external store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretKeyRef {
    pub namespace: String,
    pub name: String,
    pub key: String,
}

/// A value in a provider spec that may be given inline, pulled from the
/// process environment, or read from a secret. The variant is always
/// explicit — an empty literal never means "look elsewhere".
///
/// YAML forms:
/// ```text
/// password: "hunter2"                                      # Literal
/// password: { env: OS_PASSWORD }                           # EnvRef
/// password: { secretRef: { namespace: kube-system,         # SecretRef
///                          name: os-credentials, key: password } }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeclaredValue {
    Literal(String),
    EnvRef {
        env: String,
    },
    SecretRef {
        #[serde(rename = "secretRef")]
        secret_ref: SecretKeyRef,
    },
}

impl DeclaredValue {
    pub fn literal(s: impl Into<String>) -> Self {
        DeclaredValue::Literal(s.into())
    }

    pub fn env(name: impl Into<String>) -> Self {
        DeclaredValue::EnvRef { env: name.into() }
    }
}

// ── Secret sources ────────────────────────────────────────────────────────────

/// Where `SecretRef` values come from. The production source (backed by the
/// external store) is injected by the operator binary; tests use [`MapSecrets`].
#[async_trait]
pub trait SecretSource: Send + Sync + 'static {
    async fn fetch(&self, namespace: &str, name: &str, key: &str) -> Result<String, ConfigError>;
}

/// A source with no secrets. Every `SecretRef` resolution fails.
#[derive(Debug, Default)]
pub struct NoSecrets;

#[async_trait]
impl SecretSource for NoSecrets {
    async fn fetch(&self, namespace: &str, name: &str, key: &str) -> Result<String, ConfigError> {
        Err(ConfigError::SecretUnavailable {
            namespace: namespace.to_string(),
            name: name.to_string(),
            key: key.to_string(),
            message: "no secret source configured".to_string(),
        })
    }
}

/// In-memory secret source keyed by `namespace/name/key`.
#[derive(Debug, Default)]
pub struct MapSecrets {
    entries: HashMap<String, String>,
}

impl MapSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        namespace: impl Into<String>,
        name: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) {
        let k = format!("{}/{}/{}", namespace.into(), name.into(), key.into());
        self.entries.insert(k, value.into());
    }
}

#[async_trait]
impl SecretSource for MapSecrets {
    async fn fetch(&self, namespace: &str, name: &str, key: &str) -> Result<String, ConfigError> {
        self.entries
            .get(&format!("{}/{}/{}", namespace, name, key))
            .cloned()
            .ok_or_else(|| ConfigError::SecretUnavailable {
                namespace: namespace.to_string(),
                name: name.to_string(),
                key: key.to_string(),
                message: "not found".to_string(),
            })
    }
}

// ── Resolver ──────────────────────────────────────────────────────────────────

/// Resolves [`DeclaredValue`]s into concrete strings, booleans, and
/// durations. One resolver is shared by every provider when parsing its raw
/// spec.
#[derive(Clone)]
pub struct Resolver {
    secrets: Arc<dyn SecretSource>,
}

impl Resolver {
    pub fn new(secrets: Arc<dyn SecretSource>) -> Self {
        Self { secrets }
    }

    /// A resolver that can handle literals and env refs but no secrets.
    pub fn without_secrets() -> Self {
        Self::new(Arc::new(NoSecrets))
    }

    pub async fn resolve(&self, value: &DeclaredValue) -> Result<String, ConfigError> {
        match value {
            DeclaredValue::Literal(s) => Ok(s.clone()),
            DeclaredValue::EnvRef { env } => {
                std::env::var(env).map_err(|_| ConfigError::MissingEnv { name: env.clone() })
            }
            DeclaredValue::SecretRef { secret_ref } => {
                self.secrets
                    .fetch(&secret_ref.namespace, &secret_ref.name, &secret_ref.key)
                    .await
            }
        }
    }

    pub async fn resolve_opt(
        &self,
        value: Option<&DeclaredValue>,
    ) -> Result<Option<String>, ConfigError> {
        match value {
            Some(v) => Ok(Some(self.resolve(v).await?)),
            None => Ok(None),
        }
    }

    pub async fn resolve_bool(&self, value: &DeclaredValue) -> Result<bool, ConfigError> {
        let s = self.resolve(value).await?;
        match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::InvalidBool { value: s }),
        }
    }

    pub async fn resolve_duration(&self, value: &DeclaredValue) -> Result<Duration, ConfigError> {
        let s = self.resolve(value).await?;
        humantime::parse_duration(s.trim()).map_err(|source| ConfigError::InvalidDuration {
            value: s,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_literal() {
        let r = Resolver::without_secrets();
        let v = DeclaredValue::literal("m1.tiny");
        assert_eq!(r.resolve(&v).await.unwrap(), "m1.tiny");
    }

    #[tokio::test]
    async fn resolves_env_ref() {
        std::env::set_var("MACHINA_TEST_FLAVOR", "m1.small");
        let r = Resolver::without_secrets();
        let v = DeclaredValue::env("MACHINA_TEST_FLAVOR");
        assert_eq!(r.resolve(&v).await.unwrap(), "m1.small");
    }

    #[tokio::test]
    async fn missing_env_is_an_error() {
        let r = Resolver::without_secrets();
        let v = DeclaredValue::env("MACHINA_TEST_DOES_NOT_EXIST");
        assert!(matches!(
            r.resolve(&v).await,
            Err(ConfigError::MissingEnv { .. })
        ));
    }

    #[tokio::test]
    async fn resolves_secret_ref() {
        let mut secrets = MapSecrets::new();
        secrets.insert("kube-system", "os-credentials", "password", "hunter2");
        let r = Resolver::new(Arc::new(secrets));
        let v = DeclaredValue::SecretRef {
            secret_ref: SecretKeyRef {
                namespace: "kube-system".into(),
                name: "os-credentials".into(),
                key: "password".into(),
            },
        };
        assert_eq!(r.resolve(&v).await.unwrap(), "hunter2");
    }

    #[tokio::test]
    async fn secret_ref_without_source_fails() {
        let r = Resolver::without_secrets();
        let v = DeclaredValue::SecretRef {
            secret_ref: SecretKeyRef {
                namespace: "ns".into(),
                name: "n".into(),
                key: "k".into(),
            },
        };
        assert!(matches!(
            r.resolve(&v).await,
            Err(ConfigError::SecretUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn resolves_bools() {
        let r = Resolver::without_secrets();
        assert!(r.resolve_bool(&DeclaredValue::literal("true")).await.unwrap());
        assert!(r.resolve_bool(&DeclaredValue::literal("1")).await.unwrap());
        assert!(!r.resolve_bool(&DeclaredValue::literal("False")).await.unwrap());
        assert!(r.resolve_bool(&DeclaredValue::literal("maybe")).await.is_err());
    }

    #[tokio::test]
    async fn resolves_durations() {
        let r = Resolver::without_secrets();
        let d = r
            .resolve_duration(&DeclaredValue::literal("5s"))
            .await
            .unwrap();
        assert_eq!(d, Duration::from_secs(5));
        assert!(r
            .resolve_duration(&DeclaredValue::literal("not-a-duration"))
            .await
            .is_err());
    }

    #[test]
    fn declared_value_yaml_forms() {
        let lit: DeclaredValue = serde_yaml::from_str("\"m1.tiny\"").unwrap();
        assert_eq!(lit, DeclaredValue::literal("m1.tiny"));

        let env: DeclaredValue = serde_yaml::from_str("{ env: OS_PASSWORD }").unwrap();
        assert_eq!(env, DeclaredValue::env("OS_PASSWORD"));

        let sec: DeclaredValue = serde_yaml::from_str(
            "{ secretRef: { namespace: kube-system, name: creds, key: password } }",
        )
        .unwrap();
        assert!(matches!(sec, DeclaredValue::SecretRef { .. }));
    }
}
