use crate::conditions::{ConditionReason, ConditionType};
use crate::crd::{ImageFormat, ImageRequest, ImageStatus, SecretStatus};
use crate::imagehandler::ImageRegistry;
use crate::retry;
use crate::secret_bytes::SecretBytes;
use crate::secrets::{NetworkDataSecret, SECRET_OWNED_LABEL, SecretError, SecretKey, SecretSource};
use crate::state::ControllerContext;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Api, Client, Resource, ResourceExt};
use serde_json::{Value, json};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

static FIELD_MANAGER: &str = "image-customization-controller";
static MISSING_NETWORK_DATA_MESSAGE: &str = "NetworkData secret not found";

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("ImageRequest {0} has no namespace")]
    MissingNamespace(String),
    #[error("failed to update status of ImageRequest {name}: {source}")]
    StatusUpdate {
        name: String,
        #[source]
        source: kube::Error,
    },
}

/// Result of one evaluation of an ImageRequest.
#[derive(Debug)]
pub struct StatusUpdate {
    /// The new status snapshot
    pub status: ImageStatus,
    /// Whether `status` differs from the status the request was observed with
    pub changed: bool,
    /// Set only when the network data Secret does not exist
    pub error: Option<SecretError>,
}

/// Computes the status of ImageRequests, registering their images as a side effect.
pub struct ReconcileEngine<S> {
    secrets: S,
    registry: Arc<ImageRegistry>,
}

impl<S: SecretSource> ReconcileEngine<S> {
    pub fn new(secrets: S, registry: Arc<ImageRegistry>) -> Self {
        Self { secrets, registry }
    }

    pub async fn update(&self, request: &ImageRequest, now: DateTime<Utc>) -> StatusUpdate {
        let name = request.name_any();
        let generation = request.meta().generation.unwrap_or_default();
        let previous = request.status.clone().unwrap_or_default();

        let (status, error) = match self.network_data_secret(request).await {
            Ok(secret) => {
                let status = self.publish_image(request, secret, &previous, generation, now);
                (status, None)
            }
            Err(err @ SecretError::NotFound(_)) => {
                info!("Network data secret for {} does not exist: {}", name, err);
                let status = previous.mark_error(
                    ConditionReason::MissingNetworkData,
                    MISSING_NETWORK_DATA_MESSAGE,
                    generation,
                    now,
                );
                (status, Some(err))
            }
            Err(err) => {
                warn!("Failed to get network data for {}: {}", name, err);
                let status = previous.mark_error(
                    ConditionReason::ConfigurationError,
                    err.to_string(),
                    generation,
                    now,
                );
                (status, None)
            }
        };

        StatusUpdate {
            changed: status != previous,
            status,
            error,
        }
    }

    /// `Ok(None)` when the request does not reference any network data.
    async fn network_data_secret(
        &self,
        request: &ImageRequest,
    ) -> Result<Option<NetworkDataSecret>, SecretError> {
        let secret_name = &request.spec.network_data_name;
        if secret_name.is_empty() {
            return Ok(None);
        }
        let key = SecretKey {
            namespace: request.namespace().unwrap_or_default(),
            name: secret_name.clone(),
        };
        self.secrets.fetch(&key, request).await.map(Some)
    }

    fn publish_image(
        &self,
        request: &ImageRequest,
        secret: Option<NetworkDataSecret>,
        previous: &ImageStatus,
        generation: i64,
        now: DateTime<Utc>,
    ) -> ImageStatus {
        let image_name = format!("{}.qcow", request.name_any());
        let network_data = secret
            .as_ref()
            .map(NetworkDataSecret::network_data)
            .unwrap_or_else(SecretBytes::default);
        if network_data.is_empty() {
            debug!("Registering {} without network data", image_name);
        }

        let url = match self.registry.register(&image_name, network_data) {
            Ok(url) => url,
            Err(err) => {
                info!("No image URL available for {}: {}", image_name, err);
                return previous.mark_error(
                    ConditionReason::ConfigurationError,
                    err.to_string(),
                    generation,
                    now,
                );
            }
        };

        let format = ImageFormat::Iso;
        debug!("Image URL {} available in format {:?}", url, format);
        let secret_status = secret
            .map(|secret| SecretStatus {
                name: secret.name,
                version: secret.version,
            })
            .unwrap_or_default();

        previous.mark_success(
            url,
            format,
            secret_status,
            request.spec.architecture.clone(),
            generation,
            now,
        )
    }
}

pub async fn create_client() -> anyhow::Result<Client> {
    info!("Initializing K8s client");
    let client = Client::try_default().await?;
    let api_server_info = client.apiserver_version().await?;
    info!(
        "Connected to Kubernetes API server with version {}.{}",
        api_server_info.major, api_server_info.minor
    );
    Ok(client)
}

pub async fn reconcile(
    request: Arc<ImageRequest>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ReconcileError> {
    let name = request.name_any();
    let namespace = request
        .namespace()
        .ok_or_else(|| ReconcileError::MissingNamespace(name.clone()))?;
    debug!("Reconciling ImageRequest {}/{}", namespace, name);

    let now = Utc::now();
    let update = ctx.engine.update(&request, now).await;

    let action = next_action(&update, now);
    if action != Action::await_change() {
        info!(
            "Requeuing ImageRequest {}/{} to check for its secret: {:?}",
            namespace, name, action
        );
    }

    if update.changed {
        info!(
            "Updating status of ImageRequest {}/{} (ready: {})",
            namespace,
            name,
            update.status.conditions.is_true(ConditionType::Ready)
        );
        let api: Api<ImageRequest> = Api::namespaced(ctx.kube_client.clone(), &namespace);
        let patch = status_patch(&request, &update.status);
        api.patch_status(
            &name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await
        .map_err(|source| ReconcileError::StatusUpdate {
            name: name.clone(),
            source,
        })?;
    }

    Ok(action)
}

/// Only a missing Secret is retried on a timer; everything else waits for a watch event.
fn next_action(update: &StatusUpdate, now: DateTime<Utc>) -> Action {
    match update.error {
        Some(_) => Action::requeue(retry::delay_for(&update.status, now)),
        None => Action::await_change(),
    }
}

/// Merge patch replacing the status. The resourceVersion makes it a conditional update.
fn status_patch(request: &ImageRequest, status: &ImageStatus) -> Value {
    json!({
        "metadata": { "resourceVersion": request.resource_version() },
        "status": status,
    })
}

pub fn error_policy(
    request: Arc<ImageRequest>,
    error: &ReconcileError,
    _ctx: Arc<ControllerContext>,
) -> Action {
    warn!(
        "Failed to reconcile ImageRequest {}: {}",
        request.name_any(),
        error
    );
    Action::requeue(retry::MIN_RETRY_DELAY)
}

/// Secrets are only watched once they carry the ownership label.
fn owned_secrets_config() -> watcher::Config {
    watcher::Config::default().labels(&format!("{}=true", SECRET_OWNED_LABEL))
}

/// Runs the controller until `shutdown` is cancelled.
pub async fn run(ctx: ControllerContext, namespace: Option<String>, shutdown: CancellationToken) {
    let client = ctx.kube_client.clone();
    let (requests, secrets): (Api<ImageRequest>, Api<Secret>) = match &namespace {
        Some(namespace) => (
            Api::namespaced(client.clone(), namespace),
            Api::namespaced(client, namespace),
        ),
        None => (Api::all(client.clone()), Api::all(client)),
    };
    info!(
        "Watching ImageRequests in {}",
        namespace.as_deref().unwrap_or("all namespaces")
    );

    Controller::new(requests, watcher::Config::default())
        .owns(secrets, owned_secrets_config())
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(reconcile, error_policy, Arc::new(ctx))
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!("Reconciled {}", object),
                Err(err) => warn!("Reconcile failed: {}", err),
            }
        })
        .await;
    info!("Controller stopped");
}
