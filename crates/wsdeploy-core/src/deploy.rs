//! End-to-end deployment of a repository to one workspace.
//!
//! Wires the client stack (transport, token manager, invoker, items API) to
//! the catalog registry and orchestrator, then runs the publish pass
//! followed by the orphan unpublish pass.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use wsdeploy_client::{
    CredentialSource, HttpTransport, RequestInvoker, ReqwestTransport, TokenManager, WorkspaceApi,
};

use crate::catalog;
use crate::config::DeployConfig;
use crate::discovery::{ItemDiscovery, PlatformFileDiscovery};
use crate::error::{DeployError, DeployResult};
use crate::graph::DependencyResolver;
use crate::item::Item;
use crate::obs::{RunReporter, TracingReporter};
use crate::orchestrator::PublishOrchestrator;
use crate::outcome::RunReport;
use crate::publisher::Publisher;
use crate::reconcile::{apply_remote_guids, deployed_items};
use crate::registry::PublisherRegistry;

/// Result of [`deploy_with_config`]. A skipped pass has no report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentSummary {
    pub environment: Option<String>,
    pub workspace_id: String,
    pub publish: Option<RunReport>,
    pub unpublish: Option<RunReport>,
    pub succeeded: bool,
}

/// Configured deployment with swappable collaborators.
pub struct Deployer {
    config: DeployConfig,
    environment: Option<String>,
    transport: Option<Arc<dyn HttpTransport>>,
    discovery: Arc<dyn ItemDiscovery>,
    reporter: Arc<dyn RunReporter>,
    extra_publishers: Vec<Arc<dyn Publisher>>,
}

impl Deployer {
    pub fn new(config: DeployConfig, environment: Option<&str>) -> Self {
        Deployer {
            config,
            environment: environment.map(str::to_string),
            transport: None,
            discovery: Arc::new(PlatformFileDiscovery),
            reporter: Arc::new(TracingReporter),
            extra_publishers: Vec::new(),
        }
    }

    /// Use `transport` instead of a reqwest client.
    pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_discovery(mut self, discovery: Arc<dyn ItemDiscovery>) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn RunReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Register a publisher on top of the catalog, replacing any built-in
    /// one for the same type.
    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.extra_publishers.push(publisher);
        self
    }

    pub fn config(&self) -> &DeployConfig {
        &self.config
    }

    #[instrument(skip(self, credential), fields(environment = ?self.environment))]
    pub async fn deploy(&self, credential: Arc<dyn CredentialSource>) -> DeployResult<DeploymentSummary> {
        let environment = self.environment.as_deref();
        let workspace_id = self.config.workspace_id(environment)?;
        let policy = self.config.retry_policy()?;

        let transport: Arc<dyn HttpTransport> = match &self.transport {
            Some(transport) => Arc::clone(transport),
            None => Arc::new(
                ReqwestTransport::new(self.config.request_timeout())
                    .map_err(|err| DeployError::Config(format!("cannot build HTTP client: {err}")))?,
            ),
        };
        let tokens = Arc::new(
            TokenManager::new(credential, self.config.token.scope.clone())
                .with_refresh_margin(self.config.refresh_margin()),
        );
        let invoker = Arc::new(RequestInvoker::new(transport, tokens, policy));
        let api = Arc::new(WorkspaceApi::new(
            invoker,
            &self.config.workspace.api_root,
            &workspace_id,
        ));

        let mut registry = PublisherRegistry::with_catalog(Arc::clone(&api), &self.config.catalog_settings()?);
        for publisher in &self.extra_publishers {
            registry.register(Arc::clone(publisher));
        }
        let registry = Arc::new(registry);
        let orchestrator = PublishOrchestrator::new(
            Arc::clone(&registry),
            DependencyResolver::new(catalog::type_dependencies()),
            self.config.parallel,
            Arc::clone(&self.reporter),
        );

        let mut items = self.scoped_items(&registry)?;
        let deployed = deployed_items(api.list_items().await?);
        apply_remote_guids(&mut items, &deployed);
        info!(
            workspace_id = %workspace_id,
            repository_items = items.len(),
            deployed_items = deployed.len(),
            "Starting deployment"
        );

        let publish = if self.config.publish_skipped(environment) {
            info!("Publish skipped by configuration");
            None
        } else {
            Some(orchestrator.publish(items.clone()).await?)
        };

        let unpublish = if self.config.unpublish_skipped(environment) {
            info!("Unpublish skipped by configuration");
            None
        } else {
            let filter = self.config.orphan_filter()?;
            Some(orchestrator.unpublish_orphans(&items, deployed, &filter).await?)
        };

        let succeeded = [&publish, &unpublish]
            .into_iter()
            .flatten()
            .all(|report| report.run_succeeded);
        if !succeeded {
            warn!(workspace_id = %workspace_id, "Deployment finished with failures");
        }

        Ok(DeploymentSummary {
            environment: self.environment.clone(),
            workspace_id,
            publish,
            unpublish,
            succeeded,
        })
    }

    /// Repository items of the configured scope. Without an explicit scope,
    /// items of types nothing can publish are dropped with a warning.
    fn scoped_items(&self, registry: &PublisherRegistry) -> DeployResult<Vec<Item>> {
        let scope = self.config.item_types_in_scope();
        let items = self.discovery.discover(&self.config.workspace.repository_directory)?;
        Ok(items
            .into_iter()
            .filter(|item| match &scope {
                Some(scope) => scope.contains(item.item_type()),
                None => {
                    let known = registry.contains(item.item_type());
                    if !known {
                        warn!(item_type = %item.item_type(), item_name = item.name(), "Ignoring item of unsupported type");
                    }
                    known
                }
            })
            .collect())
    }
}

/// Deploy with the default filesystem discovery and reqwest transport.
pub async fn deploy_with_config(
    config: DeployConfig,
    environment: Option<&str>,
    credential: Arc<dyn CredentialSource>,
) -> DeployResult<DeploymentSummary> {
    Deployer::new(config, environment).deploy(credential).await
}
