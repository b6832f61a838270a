//! Errors shared by configuration loading

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Environment variable {var} is not set")]
    MissingEnv { var: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let err = Error::Config("pool ceiling must be greater than 0".into());
        assert_eq!(
            err.to_string(),
            "Configuration error: pool ceiling must be greater than 0"
        );
    }

    #[test]
    fn missing_env_names_variable() {
        let err = Error::MissingEnv {
            var: "GEONAMES_USER_PRIMARY".into(),
        };
        assert!(err.to_string().contains("GEONAMES_USER_PRIMARY"), "got: {err}");
    }

    #[test]
    fn io_error_converts() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(err.to_string().starts_with("I/O error:"), "got: {err}");
    }
}
