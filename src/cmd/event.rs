//! # Event command module
//!
//! This module provides the command running the pipeline once over an event
//! read from a json file, the same path the broker handler takes

use std::{fs, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use crate::{
    cmd::Executor,
    svc::{
        adapter,
        api,
        cfg::Configuration,
        event::Event,
        k8s::{client, kubernetes::KubernetesTransport},
        pipeline::{self, Pipeline},
    },
};

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to read event file '{0}', {1}")]
    Read(String, std::io::Error),
    #[error("failed to parse event, {0}")]
    Parse(serde_json::Error),
    #[error("failed to load adapter document, {0}")]
    Document(adapter::Error),
    #[error("failed to create kubernetes client, {0}")]
    Client(client::Error),
    #[error("failed to create api client, {0}")]
    Api(api::Error),
    #[error("failed to build pipeline, {0}")]
    Pipeline(pipeline::Error),
    #[error("failed to serialize execution record, {0}")]
    Serialize(serde_json::Error),
}

// -----------------------------------------------------------------------------
// Process command

#[derive(Parser, Clone, Debug)]
pub struct Process {
    /// Location of the CloudEvent json file
    pub file: PathBuf,
    /// Location of the adapter document, defaults to the configured one
    #[clap(short = 'f', long = "document")]
    pub document: Option<PathBuf>,
    /// Specify location of kubeconfig
    #[clap(short = 'k', long = "kubeconfig")]
    pub kubeconfig: Option<PathBuf>,
}

#[async_trait]
impl Executor for Process {
    type Error = Error;

    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error> {
        let buf = fs::read_to_string(&self.file)
            .map_err(|err| Error::Read(self.file.display().to_string(), err))?;

        let event: Event = serde_json::from_str(&buf).map_err(Error::Parse)?;

        let path = self
            .document
            .to_owned()
            .unwrap_or_else(|| config.document.to_owned());

        let document =
            Arc::new(adapter::Document::try_from(path).map_err(Error::Document)?);

        let kubeconfig = self
            .kubeconfig
            .to_owned()
            .or_else(|| document.spec.clients.kubernetes.kubeconfig.to_owned());

        let kube_client = client::try_new(kubeconfig).await.map_err(Error::Client)?;
        let api_client =
            api::Client::try_new(document.spec.clients.api.to_owned()).map_err(Error::Api)?;

        let pipeline = Pipeline::builder()
            .document(document)
            .executor(Arc::new(api_client))
            .transport(Arc::new(KubernetesTransport::new(kube_client)))
            .build()
            .map_err(Error::Pipeline)?;

        let record = pipeline.handle(&CancellationToken::new(), &event).await;

        println!(
            "{}",
            serde_json::to_string_pretty(&record).map_err(Error::Serialize)?
        );

        Ok(())
    }
}
