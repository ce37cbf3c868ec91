//! wsdeploy-core: dependency-ordered publishing of workspace items
//!
//! Re-exports the item model, resolver, registry, orchestrator and the
//! deployment entry point.

pub mod catalog;
pub mod config;
pub mod deploy;
pub mod discovery;
pub mod error;
pub mod graph;
pub mod item;
pub mod items_api;
pub mod obs;
pub mod orchestrator;
pub mod outcome;
pub mod parallel;
pub mod publisher;
pub mod reconcile;
pub mod registry;
pub mod telemetry;

pub use config::{DeployConfig, PerEnvironment};
pub use deploy::{deploy_with_config, Deployer, DeploymentSummary};
pub use discovery::{ItemDiscovery, PlatformFileDiscovery};
pub use error::{DeployError, DeployResult, ItemFailure, PublishError};
pub use graph::{DependencyGraph, DependencyResolver, PublishPlan, Stage, TypeDependencies};
pub use item::{Item, ItemFile, ItemKey, ItemType};
pub use items_api::ItemsApiPublisher;
pub use obs::{NoopReporter, RunReporter, TracingReporter};
pub use orchestrator::PublishOrchestrator;
pub use outcome::{
    ItemAttempt, Operation, OutcomeLog, PublishOutcome, RunReport, RunState, RunSummary,
};
pub use parallel::{run_bounded, HaltFlag, JobStatus, ParallelConfig};
pub use publisher::{PublishMode, PublishResult, Publisher};
pub use reconcile::{apply_remote_guids, deployed_items, find_orphans, OrphanFilter};
pub use registry::{CatalogSettings, PublisherRegistry};
pub use telemetry::init_tracing;

pub use wsdeploy_client;
