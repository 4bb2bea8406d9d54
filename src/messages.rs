//! Wire-format structs for the MEGA command protocol.
//!
//! Every request body is a one-element JSON array of a command object
//! whose `a` field names the command; responses mirror that shape.
//! Field names follow the wire exactly.

use serde::{Deserialize, Serialize};

/// `us`: open a session.
#[derive(Debug, Serialize)]
pub(crate) struct LoginMsg {
    #[serde(rename = "a")]
    pub cmd: &'static str,
    pub user: String,
    #[serde(rename = "uh")]
    pub handle: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LoginResp {
    #[serde(rename = "csid", default)]
    pub csid: String,
    #[serde(rename = "privk", default)]
    pub privk: String,
    #[serde(rename = "k", default)]
    pub key: String,
}

/// `ug`: user information.
#[derive(Debug, Serialize)]
pub(crate) struct UserMsg {
    #[serde(rename = "a")]
    pub cmd: &'static str,
}

/// Account information returned by `ug`.
#[derive(Debug, Clone, Deserialize)]
pub struct UserInfo {
    /// User id handle.
    #[serde(rename = "u", default)]
    pub user: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub name: String,
}

/// `f`: fetch the filesystem manifest.
#[derive(Debug, Serialize)]
pub(crate) struct FilesMsg {
    #[serde(rename = "a")]
    pub cmd: &'static str,
    pub c: i32,
}

/// One manifest node record.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct FsNodeRecord {
    #[serde(rename = "h", default)]
    pub hash: String,
    #[serde(rename = "p", default)]
    pub parent: String,
    #[serde(rename = "u", default)]
    pub user: String,
    #[serde(rename = "t")]
    pub t: i32,
    #[serde(rename = "a", default)]
    pub attr: String,
    #[serde(rename = "k", default)]
    pub key: String,
    #[serde(rename = "ts", default)]
    pub ts: i64,
    #[serde(rename = "su", default)]
    pub shared_user: String,
    #[serde(rename = "sk", default)]
    pub shared_key: String,
    #[serde(rename = "s", default)]
    pub size: u64,
}

/// Wrapped share key advertised in the manifest `ok` section.
#[derive(Debug, Deserialize)]
pub(crate) struct ShareKeyRecord {
    #[serde(rename = "h", default)]
    pub hash: String,
    #[serde(rename = "k", default)]
    pub key: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FilesResp {
    #[serde(rename = "f", default)]
    pub nodes: Vec<FsNodeRecord>,
    #[serde(rename = "ok", default)]
    pub share_keys: Vec<ShareKeyRecord>,
}

/// `g`: resolve a download url.
#[derive(Debug, Serialize)]
pub(crate) struct DownloadMsg {
    #[serde(rename = "a")]
    pub cmd: &'static str,
    pub g: i32,
    pub n: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DownloadResp {
    #[serde(rename = "g", default)]
    pub url: String,
    #[serde(rename = "s", default)]
    pub size: u64,
}

/// `u`: reserve an upload slot.
#[derive(Debug, Serialize)]
pub(crate) struct UploadMsg {
    #[serde(rename = "a")]
    pub cmd: &'static str,
    pub s: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct UploadResp {
    #[serde(rename = "p", default)]
    pub url: String,
}

/// New-node payload inside a `p` command.
#[derive(Debug, Serialize)]
pub(crate) struct NewNode {
    #[serde(rename = "h")]
    pub handle: String,
    #[serde(rename = "t")]
    pub t: i32,
    #[serde(rename = "a")]
    pub attr: String,
    #[serde(rename = "k")]
    pub key: String,
}

/// `p`: finalize an upload or create a folder.
#[derive(Debug, Serialize)]
pub(crate) struct PutNodesMsg {
    #[serde(rename = "a")]
    pub cmd: &'static str,
    #[serde(rename = "t")]
    pub target: String,
    #[serde(rename = "n")]
    pub nodes: Vec<NewNode>,
    #[serde(rename = "i", skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PutNodesResp {
    #[serde(rename = "f", default)]
    pub nodes: Vec<FsNodeRecord>,
}

/// `a`: set node attributes (rename).
#[derive(Debug, Serialize)]
pub(crate) struct SetAttrMsg {
    #[serde(rename = "a")]
    pub cmd: &'static str,
    #[serde(rename = "attr")]
    pub attr: String,
    #[serde(rename = "key")]
    pub key: String,
    pub n: String,
    pub i: String,
}

/// `m`: move a node under a new parent.
#[derive(Debug, Serialize)]
pub(crate) struct MoveMsg {
    #[serde(rename = "a")]
    pub cmd: &'static str,
    pub n: String,
    #[serde(rename = "t")]
    pub target: String,
    pub i: String,
}

/// `d`: delete a node.
#[derive(Debug, Serialize)]
pub(crate) struct DeleteMsg {
    #[serde(rename = "a")]
    pub cmd: &'static str,
    pub n: String,
    pub i: String,
}
