use crate::crd::{ImageFormat, ImageStatus, SecretStatus};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

pub const READY_MESSAGE: &str = "Set default image";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
pub enum ConditionType {
    /// The image is available at `status.imageUrl`
    Ready,
    /// The image could not be produced
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionReason {
    ImageSuccess,
    ConfigurationError,
    MissingNetworkData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub r#type: ConditionType,
    #[serde(with = "condition_status")]
    #[schemars(with = "String")]
    pub status: bool,
    pub reason: ConditionReason,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
    #[serde(default)]
    pub observed_generation: i64,
}

/// Conditions keyed by type, serialized as a list ordered by type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConditionSet(BTreeMap<ConditionType, Condition>);

impl ConditionSet {
    pub fn get(&self, condition_type: ConditionType) -> Option<&Condition> {
        self.0.get(&condition_type)
    }

    pub fn is_true(&self, condition_type: ConditionType) -> bool {
        self.get(condition_type).is_some_and(|c| c.status)
    }

    /// Upserts the condition of the given type. The transition time only moves when the
    /// status flips.
    pub fn set_condition(
        &mut self,
        condition_type: ConditionType,
        status: bool,
        reason: ConditionReason,
        message: impl Into<String>,
        generation: i64,
        now: DateTime<Utc>,
    ) {
        let last_transition_time = match self.0.get(&condition_type) {
            Some(existing) if existing.status == status => existing.last_transition_time,
            _ => now,
        };
        self.0.insert(
            condition_type,
            Condition {
                r#type: condition_type,
                status,
                reason,
                message: message.into(),
                last_transition_time,
                observed_generation: generation,
            },
        );
    }
}

impl Serialize for ConditionSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.values())
    }
}

impl<'de> Deserialize<'de> for ConditionSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let conditions = Vec::<Condition>::deserialize(deserializer)?;
        Ok(ConditionSet(
            conditions.into_iter().map(|c| (c.r#type, c)).collect(),
        ))
    }
}

impl ImageStatus {
    /// Snapshot with the image published: Ready=true, Error=false.
    pub fn mark_success(
        &self,
        url: String,
        format: ImageFormat,
        network_data: SecretStatus,
        architecture: Option<String>,
        generation: i64,
        now: DateTime<Utc>,
    ) -> ImageStatus {
        let mut status = self.clone();
        status.image_url = Some(url);
        status.format = Some(format);
        status.checksum = None;
        status.checksum_type = None;
        status.architecture = architecture;
        status.network_data = Some(network_data);

        let reason = ConditionReason::ImageSuccess;
        status.conditions.set_condition(
            ConditionType::Ready,
            true,
            reason,
            READY_MESSAGE,
            generation,
            now,
        );
        status
            .conditions
            .set_condition(ConditionType::Error, false, reason, "", generation, now);
        status
    }

    /// Snapshot with the image withdrawn: Ready=false, Error=true.
    pub fn mark_error(
        &self,
        reason: ConditionReason,
        message: impl Into<String>,
        generation: i64,
        now: DateTime<Utc>,
    ) -> ImageStatus {
        let mut status = self.clone();
        status.image_url = None;
        status.checksum = None;
        status.checksum_type = None;

        status
            .conditions
            .set_condition(ConditionType::Ready, false, reason, "", generation, now);
        status
            .conditions
            .set_condition(ConditionType::Error, true, reason, message, generation, now);
        status
    }
}

#[cfg(test)]
impl ConditionSet {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

mod condition_status {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(status: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(if *status { "True" } else { "False" })
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        match String::deserialize(deserializer)?.as_str() {
            "True" => Ok(true),
            "False" | "Unknown" => Ok(false),
            other => Err(D::Error::custom(format!(
                "invalid condition status {}",
                other
            ))),
        }
    }
}
