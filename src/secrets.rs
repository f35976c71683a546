use crate::crd::ImageRequest;
use crate::secret_bytes::SecretBytes;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, Resource};
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tracing::debug;

/// Data field of the Secret holding the network data
pub static NETWORK_DATA_KEY: &str = "network";
pub static SECRET_OWNED_LABEL: &str = "imagecustomization.metal3.io/owned";
static FIELD_MANAGER: &str = "image-customization-controller";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretKey {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret {0} not found")]
    NotFound(SecretKey),
    #[error("cannot take ownership of secret {0}: owner has no uid")]
    OwnerWithoutUid(SecretKey),
    #[error("failed to fetch secret {key}: {source}")]
    Api {
        key: SecretKey,
        #[source]
        source: kube::Error,
    },
}

/// The parts of a Secret the reconciler cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkDataSecret {
    pub name: String,
    pub version: String,
    pub data: BTreeMap<String, SecretBytes>,
}

impl NetworkDataSecret {
    /// The network data field, empty when the Secret does not have one.
    pub fn network_data(&self) -> SecretBytes {
        self.data.get(NETWORK_DATA_KEY).cloned().unwrap_or_default()
    }
}

impl From<Secret> for NetworkDataSecret {
    fn from(secret: Secret) -> Self {
        NetworkDataSecret {
            name: secret.metadata.name.unwrap_or_default(),
            version: secret.metadata.resource_version.unwrap_or_default(),
            data: secret
                .data
                .unwrap_or_default()
                .into_iter()
                .map(|(key, value)| (key, SecretBytes::from(value.0)))
                .collect(),
        }
    }
}

/// Fetches network data Secrets, marking them as owned by the requesting image so that changes
/// to the Secret trigger a new reconciliation.
pub trait SecretSource: Send + Sync {
    fn fetch(
        &self,
        key: &SecretKey,
        owner: &ImageRequest,
    ) -> impl Future<Output = Result<NetworkDataSecret, SecretError>> + Send;
}

#[derive(Clone)]
pub struct KubeSecretSource {
    client: Client,
}

impl KubeSecretSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl SecretSource for KubeSecretSource {
    async fn fetch(
        &self,
        key: &SecretKey,
        owner: &ImageRequest,
    ) -> Result<NetworkDataSecret, SecretError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &key.namespace);
        let api_error = |source| SecretError::Api {
            key: key.clone(),
            source,
        };

        let secret = api
            .get_opt(&key.name)
            .await
            .map_err(api_error)?
            .ok_or_else(|| SecretError::NotFound(key.clone()))?;

        let mut owner_reference = owner
            .controller_owner_ref(&())
            .ok_or_else(|| SecretError::OwnerWithoutUid(key.clone()))?;
        owner_reference.controller = Some(false);

        let secret = match ownership_patch(&secret, owner_reference) {
            None => secret,
            Some(patch) => {
                debug!("Taking ownership of secret {} with patch {}", key, patch);
                api.patch(
                    &key.name,
                    &PatchParams::apply(FIELD_MANAGER),
                    &Patch::Merge(&patch),
                )
                .await
                .map_err(api_error)?
            }
        };

        Ok(NetworkDataSecret::from(secret))
    }
}

/// Merge patch adding `owner` and the owned label to `secret`, or `None` if both are present.
fn ownership_patch(secret: &Secret, owner: OwnerReference) -> Option<serde_json::Value> {
    let mut owner_references = secret.metadata.owner_references.clone().unwrap_or_default();
    let owned = owner_references.iter().any(|r| r.uid == owner.uid);
    let labelled = secret
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(SECRET_OWNED_LABEL))
        .is_some_and(|value| value == "true");

    if owned && labelled {
        return None;
    }
    if !owned {
        owner_references.push(owner);
    }

    Some(json!({
        "metadata": {
            "resourceVersion": secret.metadata.resource_version,
            "labels": { SECRET_OWNED_LABEL: "true" },
            "ownerReferences": owner_references,
        }
    }))
}
