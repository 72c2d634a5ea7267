//! The request/response envelope and per-request payload shapes.
//!
//! Every request is a JSON envelope `{Version, Type, Data}`; the daemon
//! replies `{Version, Status, Data}` where status 1 is success and 2 is an
//! error wrapping `{ErrorMessage}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::apps::Setup;

/// The wire API version. Client and daemon versions have to match.
pub const VERSION: &str = "0.1";

pub const STATUS_SUCCESS: i64 = 1;
pub const STATUS_ERROR: i64 = 2;

/// The envelope of each request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Request {
    #[serde(default)]
    pub version: String,
    #[serde(rename = "Type", default)]
    pub request_type: String,
    #[serde(default)]
    pub data: Value,
}

/// The envelope of each response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Response {
    pub version: String,
    pub status: i64,
    pub data: Value,
}

impl Response {
    pub fn success(data: Value) -> Self {
        Self {
            version: VERSION.to_string(),
            status: STATUS_SUCCESS,
            data,
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            version: VERSION.to_string(),
            status: STATUS_ERROR,
            data: serde_json::json!({ "ErrorMessage": message }),
        }
    }
}

//
// Request payloads.
//

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RequestAdd {
    pub name: String,
    #[serde(rename = "SourceURL")]
    pub source_url: String,
    pub branch: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RequestApp {
    pub name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RequestRemove {
    pub name: String,
    /// Whether all backups should be removed as well.
    pub remove_backups: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RequestSetupSet {
    pub name: String,
    pub setup: Setup,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RequestBackupRef {
    pub name: String,
    /// Backup unix timestamp.
    pub unix: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RequestAddHostFingerprint {
    pub fingerprint: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RequestHostFingerprintInfo {
    pub host: String,
}

//
// Response payloads.
//

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResponseInfo {
    pub name: String,
    pub turtlefile: String,
    pub maintainer: String,
    pub state: String,
    #[serde(rename = "SourceURL")]
    pub source_url: String,
    pub branch: String,
    pub setup: Setup,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResponseList {
    pub apps: Vec<ResponseListApp>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResponseListApp {
    pub name: String,
    pub turtlefile: String,
    pub state: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResponseListBackups {
    pub backups: Vec<ResponseListBackup>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResponseListBackup {
    pub date: String,
    pub unix: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResponseErrorMsg {
    pub name: String,
    pub error_message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResponseHostFingerprintInfo {
    pub host: String,
    pub trusted: bool,
    pub fingerprint: String,
}
