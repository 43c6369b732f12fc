//! LFS Batch and Locking API wire types.
//!
//! See: https://github.com/git-lfs/git-lfs/blob/main/docs/api/batch.md
//! and https://github.com/git-lfs/git-lfs/blob/main/docs/api/locking.md

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lock::Lock;
use crate::Pointer;

/// Media type of every LFS API request and response.
pub const MEDIA_TYPE: &str = "application/vnd.git-lfs+json";

/// Operation type for batch requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Download objects from the server.
    Download,
    /// Upload objects to the server.
    Upload,
}

/// A batch request from an LFS client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    pub operation: Operation,
    /// Transfer adapters the client supports; `basic` when absent.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transfers: Vec<String>,
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<RefInfo>,
    pub objects: Vec<Pointer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_algo: Option<String>,
}

/// Reference information for a batch request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefInfo {
    /// The reference name (e.g., "refs/heads/main").
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResponse {
    #[serde(default = "default_transfer")]
    pub transfer: String,
    pub objects: Vec<ObjectResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_algo: Option<String>,
}

fn default_transfer() -> String {
    "basic".to_string()
}

impl BatchResponse {
    pub fn new(objects: Vec<ObjectResponse>) -> Self {
        BatchResponse {
            transfer: default_transfer(),
            objects,
            hash_algo: Some("sha256".into()),
        }
    }
}

/// One object of a batch response: either actions or an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectResponse {
    #[serde(flatten)]
    pub pointer: Pointer,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authenticated: Option<bool>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub actions: BTreeMap<String, Link>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ObjectError>,
}

impl ObjectResponse {
    pub fn with_error(pointer: Pointer, code: u16, message: impl Into<String>) -> Self {
        ObjectResponse {
            pointer,
            authenticated: None,
            actions: BTreeMap::new(),
            error: Some(ObjectError {
                code,
                message: message.into(),
            }),
        }
    }

    pub fn download_action(&self) -> Option<&Link> {
        self.actions.get("download")
    }

    pub fn upload_action(&self) -> Option<&Link> {
        self.actions.get("upload")
    }

    pub fn verify_action(&self) -> Option<&Link> {
        self.actions.get("verify")
    }
}

/// An action (upload/download URL) for an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub href: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub header: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Error information for a batch object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectError {
    /// HTTP status code.
    pub code: u16,
    pub message: String,
}

/// Body of a non-2xx LFS API response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOwner {
    pub name: String,
}

/// A lock as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockJson {
    pub id: String,
    pub path: String,
    pub locked_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<LockOwner>,
}

impl From<&Lock> for LockJson {
    fn from(lock: &Lock) -> Self {
        LockJson {
            id: lock.id.to_string(),
            path: lock.path.clone(),
            locked_at: lock.locked_at,
            owner: Some(LockOwner {
                name: lock.owner_name.clone(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockCreateRequest {
    pub path: String,
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<RefInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockResponse {
    pub lock: LockJson,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Query string of `GET …/locks`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockListQuery {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub refspec: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockList {
    pub locks: Vec<LockJson>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockVerifyRequest {
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default, rename = "ref")]
    pub reference: Option<RefInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockVerifyList {
    pub ours: Vec<LockJson>,
    pub theirs: Vec<LockJson>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnlockRequest {
    #[serde(default)]
    pub force: bool,
    #[serde(default, rename = "ref")]
    pub reference: Option<RefInfo>,
}
