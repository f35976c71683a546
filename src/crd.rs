use crate::conditions::{Condition, ConditionSet};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Desired customized boot image for a single host.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "metal3.io",
    version = "v1alpha1",
    kind = "ImageRequest",
    namespaced,
    status = "ImageStatus",
    shortname = "imgreq",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].reason"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ImageRequestSpec {
    /// Name of the Secret in the same namespace holding the network data. Empty means none.
    #[serde(default)]
    pub network_data_name: String,

    /// Target CPU architecture of the image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Iso,
    Initrd,
}

/// The Secret version that was used to build the image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretStatus {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageStatus {
    // Optional fields serialize as null so a merge patch clears them.
    /// URL the customized image is served from
    #[serde(default)]
    pub image_url: Option<String>,

    #[serde(default)]
    pub format: Option<ImageFormat>,

    #[serde(default)]
    pub checksum: Option<String>,

    #[serde(default)]
    pub checksum_type: Option<String>,

    #[serde(default)]
    pub architecture: Option<String>,

    #[serde(default)]
    pub network_data: Option<SecretStatus>,

    #[serde(default)]
    #[schemars(with = "Vec<Condition>")]
    pub conditions: ConditionSet,
}
