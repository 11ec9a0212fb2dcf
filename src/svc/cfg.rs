//! # Configuration module
//!
//! This module provide utilities and helpers to interact with the process
//! configuration

use std::{
    convert::TryFrom,
    env::{self, VarError},
    path::PathBuf,
};

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::warn;

// -----------------------------------------------------------------------------
// Constants

pub const OPERATOR_LISTEN: &str = "0.0.0.0:8000";
pub const DOCUMENT_PATH: &str = "/etc/cluster-adapter/adapter.yaml";

// -----------------------------------------------------------------------------
// Operator structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Operator {
    #[serde(rename = "listen")]
    pub listen: String,
}

// -----------------------------------------------------------------------------
// ConfigurationError enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to load configuration, {0}")]
    Build(ConfigError),
    #[error("failed to deserialize configuration, {0}")]
    Deserialize(ConfigError),
    #[error("failed to set default for key '{0}', {1}")]
    Default(String, ConfigError),
    #[error("failed to retrieve environment variable '{0}', {1}")]
    EnvironmentVariable(&'static str, VarError),
}

// -----------------------------------------------------------------------------
// Configuration structures

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Configuration {
    #[serde(rename = "operator")]
    pub operator: Operator,
    /// path of the adapter document describing the pipeline
    #[serde(rename = "document")]
    pub document: PathBuf,
}

impl TryFrom<PathBuf> for Configuration {
    type Error = Error;

    fn try_from(path: PathBuf) -> Result<Self, Self::Error> {
        defaults()?
            .add_source(Environment::with_prefix(
                &env!("CARGO_PKG_NAME").replace('-', "_"),
            ))
            .add_source(File::from(path).required(true))
            .build()
            .map_err(Error::Build)?
            .try_deserialize()
            .map_err(Error::Deserialize)
    }
}

impl Configuration {
    pub fn try_default() -> Result<Self, Error> {
        defaults()?
            .add_source(Environment::with_prefix(
                &env!("CARGO_PKG_NAME").replace('-', "_"),
            ))
            .add_source(
                File::from(PathBuf::from(format!(
                    "/usr/share/{}/config",
                    env!("CARGO_PKG_NAME")
                )))
                .required(false),
            )
            .add_source(
                File::from(PathBuf::from(format!(
                    "/etc/{}/config",
                    env!("CARGO_PKG_NAME")
                )))
                .required(false),
            )
            .add_source(
                File::from(PathBuf::from(format!(
                    "{}/.config/{}/config",
                    env::var("HOME").map_err(|err| Error::EnvironmentVariable("HOME", err))?,
                    env!("CARGO_PKG_NAME")
                )))
                .required(false),
            )
            .add_source(File::from(PathBuf::from("config")).required(false))
            .build()
            .map_err(Error::Build)?
            .try_deserialize()
            .map_err(Error::Deserialize)
    }

    /// Prints a message about suspicious configuration values
    pub fn help(&self) {
        #[cfg(feature = "metrics")]
        tracing::info!("Build with 'metrics' feature flag");

        if !self.document.exists() {
            warn!(
                document = self.document.display().to_string(),
                "Configuration key 'document' points to a file that does not exist yet",
            );
        }
    }
}

// -----------------------------------------------------------------------------
// Helper functions

fn defaults() -> Result<config::builder::ConfigBuilder<config::builder::DefaultState>, Error> {
    Config::builder()
        .set_default("operator.listen", OPERATOR_LISTEN)
        .map_err(|err| Error::Default("operator.listen".into(), err))?
        .set_default("document", DOCUMENT_PATH)
        .map_err(|err| Error::Default("document".into(), err))
}

#[cfg(test)]
mod tests {
    use std::{convert::TryFrom, io::Write, path::PathBuf};

    use super::Configuration;

    #[test]
    fn file_values_override_the_defaults() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();

        writeln!(file, "document = \"/tmp/adapter.yaml\"").unwrap();
        file.flush().unwrap();

        let config = Configuration::try_from(file.path().to_path_buf()).unwrap();

        assert_eq!(config.operator.listen, super::OPERATOR_LISTEN);
        assert_eq!(config.document, PathBuf::from("/tmp/adapter.yaml"));
    }
}
