use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("yaml parse error in {path}: {source}")]
    YamlParse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("conversion error in {path}: {message}")]
    Conversion { path: String, message: String },

    #[error("environment variable {name} is not set")]
    MissingEnv { name: String },

    #[error("secret {namespace}/{name} key {key} is unavailable: {message}")]
    SecretUnavailable {
        namespace: String,
        name: String,
        key: String,
        message: String,
    },

    #[error("value {value:?} is not a boolean")]
    InvalidBool { value: String },

    #[error("value {value:?} is not a duration: {source}")]
    InvalidDuration {
        value: String,
        #[source]
        source: humantime::DurationError,
    },

    #[error("domain error: {0}")]
    Domain(#[from] machina_domain::DomainError),
}
