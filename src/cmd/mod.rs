//! # Command module
//!
//! This module provide command line interface structures and helpers

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use clap::{ArgAction, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::svc::{
    adapter::Document,
    api,
    cfg::Configuration,
    http::server::{self, Ingress},
    k8s::{client, kubernetes::KubernetesTransport},
    pipeline::{self, Pipeline},
};

pub mod document;
pub mod event;

// -----------------------------------------------------------------------------
// Executor trait

#[async_trait]
pub trait Executor {
    type Error;

    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error>;
}

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to execute command '{0}', {1}")]
    Execution(String, Arc<Error>),
    #[error("failed to interact with adapter document, {0}")]
    Document(document::Error),
    #[error("failed to process event, {0}")]
    Event(event::Error),
    #[error("failed to run daemon, {0}")]
    Daemon(DaemonError),
}

// -----------------------------------------------------------------------------
// Command enum

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Validate the adapter document and print its normalized form
    #[clap(name = "validate")]
    Validate(document::Validate),
    /// Process a single event read from a json file, without a broker
    #[clap(name = "process")]
    Process(event::Process),
}

#[async_trait]
impl Executor for Command {
    type Error = Error;

    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error> {
        match self {
            Self::Validate(cmd) => cmd
                .execute(config)
                .await
                .map_err(Error::Document)
                .map_err(|err| Error::Execution("validate".into(), Arc::new(err))),
            Self::Process(cmd) => cmd
                .execute(config)
                .await
                .map_err(Error::Event)
                .map_err(|err| Error::Execution("process".into(), Arc::new(err))),
        }
    }
}

// -----------------------------------------------------------------------------
// Args struct

#[derive(Parser, Clone, Debug)]
#[clap(about = env!("CARGO_PKG_DESCRIPTION"), version)]
pub struct Args {
    /// Increase log verbosity
    #[clap(short = 'v', global = true, action = ArgAction::Count)]
    pub verbosity: u8,
    /// Specify location of kubeconfig
    #[clap(short = 'k', long = "kubeconfig", global = true)]
    pub kubeconfig: Option<PathBuf>,
    /// Specify location of configuration
    #[clap(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,
    /// Check if configuration is healthy
    #[clap(short = 't', long = "check", global = true)]
    pub check: bool,
    #[clap(subcommand)]
    pub command: Option<Command>,
}

// -----------------------------------------------------------------------------
// DaemonError enum

#[derive(thiserror::Error, Debug)]
pub enum DaemonError {
    #[error("failed to load adapter document, {0}")]
    Document(crate::svc::adapter::Error),
    #[error("failed to create kubernetes client, {0}")]
    Client(client::Error),
    #[error("failed to create api client, {0}")]
    Api(api::Error),
    #[error("failed to build pipeline, {0}")]
    Pipeline(pipeline::Error),
    #[error("failed to serve http, {0}")]
    Server(server::Error),
}

// -----------------------------------------------------------------------------
// daemon function

pub async fn daemon(
    kubeconfig: Option<PathBuf>,
    config: Arc<Configuration>,
) -> Result<(), DaemonError> {
    // -------------------------------------------------------------------------
    // Load the adapter document describing the pipeline
    let document = Arc::new(
        Document::try_from(config.document.to_owned()).map_err(DaemonError::Document)?,
    );

    info!(
        adapter = &document.metadata.name,
        params = document.spec.params.len(),
        preconditions = document.spec.preconditions.len(),
        resources = document.spec.resources.len(),
        "Loaded adapter document",
    );

    // -------------------------------------------------------------------------
    // Create the kubernetes client, the command line flag wins over the
    // document configuration
    let kubeconfig = kubeconfig.or_else(|| document.spec.clients.kubernetes.kubeconfig.to_owned());
    let kube_client = client::try_new(kubeconfig)
        .await
        .map_err(DaemonError::Client)?;

    // -------------------------------------------------------------------------
    // Create the outbound api client
    let api_client =
        api::Client::try_new(document.spec.clients.api.to_owned()).map_err(DaemonError::Api)?;

    // -------------------------------------------------------------------------
    // Build the pipeline
    let pipeline = Arc::new(
        Pipeline::builder()
            .document(document)
            .executor(Arc::new(api_client))
            .transport(Arc::new(KubernetesTransport::new(kube_client)))
            .build()
            .map_err(DaemonError::Pipeline)?,
    );

    // -------------------------------------------------------------------------
    // Serve http until the termination signal
    let token = CancellationToken::new();

    let signal = token.to_owned();
    let handle = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received termination signal, shutting down");
            signal.cancel();
        }
    });

    let result = server::serve(config, Ingress::new(pipeline, token.to_owned()))
        .await
        .map_err(DaemonError::Server);

    token.cancel();
    handle.abort();

    result
}
