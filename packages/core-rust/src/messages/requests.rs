//! Request bodies for each plugin verb.
//!
//! Business fields the service does not act on (datasource details, tokens, policy)
//! are still modelled so they round-trip, but only the fields documented on each
//! struct drive behavior.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::base::{Datasource, DatasourceAccessToken, DatasourceSet};
use crate::loopback::LoopbackContext;
use crate::pit::{BackupType, PolicyInfo, RetentionTagInfo};

/// Key of the recovery-point id inside `rpCatalogInitializeParams`.
pub const RECOVERY_POINT_ID_KEY: &str = "RecoveryPointId";

/// Key of the datastore id inside `datastoreInitializeParams`.
pub const DATASTORE_ID_KEY: &str = "DatastoreId";

fn non_empty<'a>(params: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .map(String::as_str)
        .filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateForProtectionRequest {
    pub datasource: Datasource,
    #[serde(default)]
    pub datasource_set: Option<DatasourceSet>,
    #[serde(default)]
    pub datasource_access_token: Option<DatasourceAccessToken>,
    #[serde(default)]
    pub policy_info: Option<PolicyInfo>,
}

/// Body of `StartProtection` and `StopProtection`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtectionRequest {
    pub datasource: Datasource,
    #[serde(default)]
    pub datasource_set: Option<DatasourceSet>,
    #[serde(default)]
    pub datasource_access_token: Option<DatasourceAccessToken>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateForBackupRequest {
    pub datasource: Datasource,
    #[serde(default)]
    pub datasource_set: Option<DatasourceSet>,
    #[serde(default)]
    pub datasource_access_token: Option<DatasourceAccessToken>,
    #[serde(default)]
    pub backup_type: BackupType,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRequest {
    pub datasource: Datasource,
    #[serde(default)]
    pub datasource_set: Option<DatasourceSet>,
    #[serde(default)]
    pub datasource_access_token: Option<DatasourceAccessToken>,
    /// Context returned by `ValidateForBackup`.
    #[serde(default)]
    pub loop_back_context: Option<LoopbackContext>,
    #[serde(default)]
    pub backup_type: BackupType,
    /// Must carry [`RECOVERY_POINT_ID_KEY`].
    #[serde(default)]
    pub rp_catalog_initialize_params: BTreeMap<String, String>,
    /// Selects the datastore via [`DATASTORE_ID_KEY`].
    #[serde(default)]
    pub datastore_initialize_params: BTreeMap<String, String>,
    #[serde(default)]
    pub tag_info: Option<RetentionTagInfo>,
    #[serde(default)]
    pub policy_info: Option<PolicyInfo>,
}

impl BackupRequest {
    #[must_use]
    pub fn recovery_point_id(&self) -> Option<&str> {
        non_empty(&self.rp_catalog_initialize_params, RECOVERY_POINT_ID_KEY)
    }

    #[must_use]
    pub fn datastore_id(&self) -> Option<&str> {
        non_empty(&self.datastore_initialize_params, DATASTORE_ID_KEY)
    }
}

/// Body of `CommitOrRollbackBackup` and `CommitOrRollbackRestore`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitOrRollbackRequest {
    #[serde(default)]
    pub datasource: Option<Datasource>,
    /// Context returned by the preceding phase. A non-empty `errorCode` inside it
    /// selects the rollback branch.
    #[serde(default)]
    pub loop_back_context: Option<LoopbackContext>,
    #[serde(default)]
    pub rp_catalog_initialize_params: BTreeMap<String, String>,
    #[serde(default)]
    pub datastore_initialize_params: BTreeMap<String, String>,
}

impl CommitOrRollbackRequest {
    #[must_use]
    pub fn recovery_point_id(&self) -> Option<&str> {
        non_empty(&self.rp_catalog_initialize_params, RECOVERY_POINT_ID_KEY)
    }

    #[must_use]
    pub fn datastore_id(&self) -> Option<&str> {
        non_empty(&self.datastore_initialize_params, DATASTORE_ID_KEY)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateForRestoreRequest {
    #[serde(default)]
    pub source_datasource: Option<Datasource>,
    pub target_datasource: Datasource,
    #[serde(default)]
    pub target_datasource_set: Option<DatasourceSet>,
    #[serde(default)]
    pub datasource_access_token: Option<DatasourceAccessToken>,
    #[serde(default, rename = "restoreToRPId")]
    pub restore_to_rp_id: Option<String>,
    #[serde(default)]
    pub datastore_initialize_params: BTreeMap<String, String>,
}

impl ValidateForRestoreRequest {
    #[must_use]
    pub fn datastore_id(&self) -> Option<&str> {
        non_empty(&self.datastore_initialize_params, DATASTORE_ID_KEY)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreRequest {
    #[serde(default)]
    pub source_datasource: Option<Datasource>,
    #[serde(default)]
    pub source_datasource_set: Option<DatasourceSet>,
    pub target_datasource: Datasource,
    #[serde(default)]
    pub target_datasource_set: Option<DatasourceSet>,
    #[serde(default)]
    pub datasource_access_token: Option<DatasourceAccessToken>,
    /// Context returned by `ValidateForRestore`.
    #[serde(default)]
    pub loop_back_context: Option<LoopbackContext>,
    /// Recovery point to read back.
    #[serde(default, rename = "restoreToRPId")]
    pub restore_to_rp_id: String,
    #[serde(default)]
    pub rp_catalog_initialize_params: BTreeMap<String, String>,
    #[serde(default)]
    pub datastore_initialize_params: BTreeMap<String, String>,
}

impl RestoreRequest {
    #[must_use]
    pub fn datastore_id(&self) -> Option<&str> {
        non_empty(&self.datastore_initialize_params, DATASTORE_ID_KEY)
    }
}
