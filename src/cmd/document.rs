//! # Document command module
//!
//! This module provides the command printing back the validated, normalized
//! adapter document so drift between the file and its interpretation is
//! visible

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use clap::Parser;

use crate::{
    cmd::Executor,
    svc::{adapter, cfg::Configuration},
};

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to load adapter document, {0}")]
    Document(adapter::Error),
    #[error("failed to serialize adapter document, {0}")]
    Serialize(adapter::Error),
}

// -----------------------------------------------------------------------------
// Validate command

#[derive(Parser, Clone, Debug)]
pub struct Validate {
    /// Location of the adapter document, defaults to the configured one
    #[clap(short = 'f', long = "file")]
    pub file: Option<PathBuf>,
}

#[async_trait]
impl Executor for Validate {
    type Error = Error;

    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error> {
        let path = self
            .file
            .to_owned()
            .unwrap_or_else(|| config.document.to_owned());

        let document = adapter::Document::try_from(path).map_err(Error::Document)?;

        print!("{}", document.to_yaml().map_err(Error::Serialize)?);
        Ok(())
    }
}
