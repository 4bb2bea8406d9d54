//! The `Mega` client: session establishment, the filesystem mirror, and
//! the operations callers drive.

use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::api::{ApiClient, HttpTransport, Transport};
use crate::attr::{decrypt_attr, encrypt_attr, FileAttr};
use crate::config::Config;
use crate::crypto::{
    a32_to_bytes, aes128, base64url_decode, base64url_encode, block_decrypt, block_encrypt,
    bytes_to_a32, decrypt_session_id, password_key, rand_string, random_bytes, stringhash,
};
use crate::error::Error;
use crate::fs::{FileSystem, Node, NodeKind, NodeMeta};
use crate::messages::{
    DeleteMsg, DownloadMsg, DownloadResp, FilesMsg, FilesResp, FsNodeRecord, LoginMsg, LoginResp,
    MoveMsg, NewNode, PutNodesMsg, PutNodesResp, SetAttrMsg, UploadMsg, UploadResp, UserInfo,
    UserMsg,
};
use crate::transfer::{self, DownloadParams};

/// Placeholder name for nodes whose attribute blob failed to decrypt.
const UNKNOWN_NAME: &str = "UNKNOWN";

/// MEGA client session.
///
/// A client is used from a single caller; transfer operations fan out
/// internally. All cryptographic state stays on this side of the wire:
/// the server only ever sees wrapped keys and ciphertext.
pub struct Mega {
    config: Config,
    api: ApiClient,
    transport: Arc<dyn Transport>,
    master_key: Option<[u8; 16]>,
    session_id: Option<Vec<u8>>,
    user_handle: Option<String>,
    fs: FileSystem,
}

impl Mega {
    /// Client with the default configuration and HTTPS transport.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(config.timeout));
        Self::with_transport(config, transport)
    }

    /// Client over a caller-supplied transport. This is the seam tests
    /// and alternative HTTP stacks plug into.
    pub fn with_transport(config: Config, transport: Arc<dyn Transport>) -> Self {
        let api = ApiClient::new(transport.clone(), config.base_url.clone(), config.retries);
        Self {
            config,
            api,
            transport,
            master_key: None,
            session_id: None,
            user_handle: None,
            fs: FileSystem::new(),
        }
    }

    /// The local filesystem mirror.
    pub fn fs(&self) -> &FileSystem {
        &self.fs
    }

    /// Raw session id bytes, present after a successful login.
    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    /// The base64url handle derived from the login email.
    pub fn user_handle(&self) -> Option<&str> {
        self.user_handle.as_deref()
    }

    // ─── Session ───────────────────────────────────────────────────────

    /// Authenticate and open a session.
    pub async fn login(&mut self, email: &str, password: &str) -> Result<(), Error> {
        if email.is_empty() || password.is_empty() {
            return Err(Error::BadArgs("email and password are required".into()));
        }

        let passkey = password_key(password);
        let handle = stringhash(email, &passkey);
        self.user_handle = Some(handle.clone());

        let msg = LoginMsg {
            cmd: "us",
            user: email.to_string(),
            handle,
        };
        let resp: LoginResp = self.api.request(&msg).await.map_err(|e| match e {
            Error::ServerCode(c) => Error::BadAuth(format!("server rejected credentials (code {})", c)),
            other => other,
        })?;

        let mut wrapped = base64url_decode(&resp.key)?;
        block_decrypt(&aes128(&passkey)?, &mut wrapped);
        if wrapped.len() < 16 {
            return Err(Error::BadResp(format!(
                "master key too short: {} bytes",
                wrapped.len()
            )));
        }
        let mut master = [0u8; 16];
        master.copy_from_slice(&wrapped[..16]);

        let sid = decrypt_session_id(&resp.privk, &resp.csid, &master)?;
        self.api.set_session(base64url_encode(&sid));
        self.master_key = Some(master);
        self.session_id = Some(sid);

        info!(target: "mega", "session established for {}", email);
        Ok(())
    }

    /// Fetch account information.
    pub async fn get_user(&mut self) -> Result<UserInfo, Error> {
        self.api.request(&UserMsg { cmd: "ug" }).await
    }

    // ─── Filesystem ────────────────────────────────────────────────────

    /// Fetch the full manifest and rebuild the local mirror.
    pub async fn get_filesystem(&mut self) -> Result<(), Error> {
        let resp: FilesResp = self.api.request(&FilesMsg { cmd: "f", c: 1 }).await?;

        for sk in &resp.share_keys {
            self.fs.skmap.insert(sk.hash.clone(), sk.key.clone());
        }
        for rec in &resp.nodes {
            if let Err(e) = self.add_fs_node(rec) {
                debug!(target: "mega::fs", "skipping manifest record {}: {}", rec.hash, e);
            }
        }
        Ok(())
    }

    /// Unwrap one manifest record's node key. Returns the composite key
    /// words, or `None` when no unwrap strategy applies.
    fn unwrap_node_key(&mut self, item: &FsNodeRecord) -> Result<Option<Vec<u32>>, Error> {
        let master = match self.master_key {
            Some(k) => k,
            None => return Ok(None),
        };
        let master_aes = aes128(&master)?;

        let pairs: Vec<(&str, &str)> = item
            .key
            .split('/')
            .filter_map(|p| p.split_once(':'))
            .collect();

        // Owned by this account: the holder is our own user id.
        if !item.user.is_empty() {
            if let Some((_, wrapped)) = pairs.iter().find(|(h, _)| *h == item.user) {
                let mut buf = base64url_decode(wrapped)?;
                block_decrypt(&master_aes, &mut buf);
                return Ok(Some(bytes_to_a32(&buf)));
            }
        }

        // Root of an incoming share: unwrap its share key first and
        // remember the wrapped form for descendants.
        if !item.shared_user.is_empty() && !item.shared_key.is_empty() {
            let mut sk = base64url_decode(&item.shared_key)?;
            block_decrypt(&master_aes, &mut sk);
            let sk_aes = aes128(&sk)?;
            self.fs
                .skmap
                .insert(item.hash.clone(), item.shared_key.clone());

            let pair = pairs
                .iter()
                .find(|(h, _)| *h == item.hash)
                .or_else(|| pairs.first());
            if let Some((_, wrapped)) = pair {
                let mut buf = base64url_decode(wrapped)?;
                block_decrypt(&sk_aes, &mut buf);
                return Ok(Some(bytes_to_a32(&buf)));
            }
            return Ok(None);
        }

        // Descendant of a share: some holder resolves through the
        // share-key map.
        for (holder, wrapped) in &pairs {
            if let Some(wrapped_sk) = self.fs.skmap.get(*holder) {
                let mut sk = base64url_decode(wrapped_sk)?;
                block_decrypt(&master_aes, &mut sk);
                let holder_aes = aes128(&sk)?;
                let mut buf = base64url_decode(wrapped)?;
                block_decrypt(&holder_aes, &mut buf);
                return Ok(Some(bytes_to_a32(&buf)));
            }
        }

        Ok(None)
    }

    /// Insert one manifest record into the mirror, upgrading a stub in
    /// place when the record was forward-declared as somebody's parent.
    pub(crate) fn add_fs_node(&mut self, item: &FsNodeRecord) -> Result<String, Error> {
        if item.hash.is_empty() {
            return Err(Error::BadResp("node record without handle".into()));
        }
        let kind = NodeKind::from_wire(item.t)
            .ok_or_else(|| Error::BadResp(format!("unknown node kind {}", item.t)))?;

        let mut node_key: Vec<u8> = Vec::new();
        let mut meta: Option<NodeMeta> = None;
        let mut name = UNKNOWN_NAME.to_string();

        if matches!(kind, NodeKind::File | NodeKind::Folder) && !item.key.is_empty() {
            let words = self.unwrap_node_key(item)?;
            match (kind, words) {
                (NodeKind::File, Some(w)) if w.len() >= 8 => {
                    let key_words = [w[0] ^ w[4], w[1] ^ w[5], w[2] ^ w[6], w[3] ^ w[7]];
                    node_key = a32_to_bytes(&key_words);

                    let mut key = [0u8; 16];
                    key.copy_from_slice(&node_key);
                    let mut iv = [0u8; 16];
                    iv.copy_from_slice(&a32_to_bytes(&[w[4], w[5], 0, 0]));
                    let mut mac = [0u8; 8];
                    mac.copy_from_slice(&a32_to_bytes(&[w[6], w[7]]));
                    let mut compkey = [0u8; 32];
                    compkey.copy_from_slice(&a32_to_bytes(&w[..8]));
                    meta = Some(NodeMeta {
                        key,
                        iv,
                        mac,
                        compkey,
                    });
                }
                (NodeKind::Folder, Some(w)) if w.len() >= 4 => {
                    node_key = a32_to_bytes(&w[..4]);
                }
                _ => {
                    debug!(target: "mega::fs", "no usable key for node {}", item.hash);
                }
            }

            if !node_key.is_empty() && !item.attr.is_empty() {
                match decrypt_attr(&node_key, &item.attr) {
                    Ok(attr) => name = attr.name,
                    Err(_) => {
                        debug!(target: "mega::fs", "attribute decode failed for {}", item.hash);
                    }
                }
            }
        }

        let handle = item.hash.clone();
        let node = self
            .fs
            .nodes
            .entry(handle.clone())
            .or_insert_with(|| Node::stub(handle.clone()));
        node.kind = kind;
        node.size = item.size;
        node.ts = item.ts;
        node.key = node_key;
        node.meta = meta;
        node.name = match kind {
            NodeKind::Root => "Cloud Drive".to_string(),
            NodeKind::Inbox => "InBox".to_string(),
            NodeKind::Trash => "Trash".to_string(),
            _ => name,
        };

        match kind {
            NodeKind::Root => self.fs.root = Some(handle.clone()),
            NodeKind::Inbox => self.fs.inbox = Some(handle.clone()),
            NodeKind::Trash => self.fs.trash = Some(handle.clone()),
            _ => {}
        }

        if !item.parent.is_empty() {
            self.fs
                .nodes
                .entry(item.parent.clone())
                .or_insert_with(|| Node::stub(item.parent.clone()));
            self.fs.link(&item.parent, &handle);
        }

        if !item.shared_user.is_empty()
            && !item.shared_key.is_empty()
            && !self.fs.sroots.iter().any(|h| *h == handle)
        {
            self.fs.sroots.push(handle.clone());
        }

        Ok(handle)
    }

    // ─── Transfers ─────────────────────────────────────────────────────

    /// Download a file node into `dst`, verifying the content MAC.
    pub async fn download_file(&mut self, handle: &str, dst: impl AsRef<Path>) -> Result<(), Error> {
        let node = self
            .fs
            .lookup(handle)
            .ok_or_else(|| Error::BadArgs(format!("unknown node {}", handle)))?;
        let meta = node
            .meta()
            .ok_or_else(|| Error::BadArgs(format!("node {} has no content meta", handle)))?
            .clone();

        let msg = DownloadMsg {
            cmd: "g",
            g: 1,
            n: handle.to_string(),
        };
        let resp: DownloadResp = self.api.request(&msg).await?;
        if resp.url.is_empty() {
            return Err(Error::BadResp("download url missing".into()));
        }

        info!(target: "mega", "downloading {} ({} bytes)", handle, resp.size);
        transfer::download_file(
            self.transport.clone(),
            DownloadParams {
                url: resp.url,
                size: resp.size,
                key: meta.key,
                iv: meta.iv,
                expected_mac: meta.mac,
            },
            dst.as_ref(),
            self.config.dl_workers,
            self.config.retries,
        )
        .await
    }

    /// Upload a local file under `parent`, returning the new node's
    /// handle. `name` overrides the source file name.
    pub async fn upload_file(
        &mut self,
        src: impl AsRef<Path>,
        parent: &str,
        name: Option<&str>,
    ) -> Result<String, Error> {
        let src = src.as_ref();
        let master = self
            .master_key
            .ok_or_else(|| Error::BadAuth("not logged in".into()))?;
        let parent_node = self
            .fs
            .lookup(parent)
            .ok_or_else(|| Error::BadArgs(format!("unknown parent {}", parent)))?;
        if !parent_node.is_dir() {
            return Err(Error::BadArgs(format!("parent {} is not a folder", parent)));
        }
        let filename = match name {
            Some(n) => n.to_string(),
            None => src
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| Error::BadArgs("source path has no file name".into()))?,
        };

        let size = tokio::fs::metadata(src).await?.len();
        let resp: UploadResp = self.api.request(&UploadMsg { cmd: "u", s: size }).await?;
        if resp.url.is_empty() {
            return Err(Error::BadResp("upload url missing".into()));
        }

        // Fresh 192 bits of key material: content key plus nonce prefix.
        let mut ukey_bytes = [0u8; 24];
        random_bytes(&mut ukey_bytes);
        let ukey = bytes_to_a32(&ukey_bytes);
        let mut key = [0u8; 16];
        key.copy_from_slice(&a32_to_bytes(&ukey[..4]));
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&a32_to_bytes(&[ukey[4], ukey[5], 0, 0]));

        info!(target: "mega", "uploading {} ({} bytes)", filename, size);
        let outcome = transfer::upload_file(
            self.transport.clone(),
            resp.url,
            src,
            size,
            key,
            iv,
            self.config.ul_workers,
        )
        .await?;
        if outcome.completion_handle.is_empty() {
            return Err(Error::BadResp("upload produced no completion handle".into()));
        }

        let mm = outcome.meta_mac;
        let composite = [
            ukey[0] ^ ukey[4],
            ukey[1] ^ ukey[5],
            ukey[2] ^ mm[0],
            ukey[3] ^ mm[1],
            ukey[4],
            ukey[5],
            mm[0],
            mm[1],
        ];
        let mut wrapped = a32_to_bytes(&composite);
        block_encrypt(&aes128(&master)?, &mut wrapped);

        let attr = encrypt_attr(&key, &FileAttr { name: filename })?;
        let msg = PutNodesMsg {
            cmd: "p",
            target: parent.to_string(),
            nodes: vec![NewNode {
                handle: outcome.completion_handle,
                t: NodeKind::File.to_wire(),
                attr,
                key: base64url_encode(&wrapped),
            }],
            nonce: None,
        };
        let resp: PutNodesResp = self.api.request(&msg).await?;
        let rec = resp
            .nodes
            .first()
            .ok_or_else(|| Error::BadResp("completion response carried no node".into()))?;
        self.add_fs_node(rec)
    }

    // ─── Mutations ─────────────────────────────────────────────────────

    /// Create a folder under `parent`, returning its handle.
    pub async fn create_dir(&mut self, name: &str, parent: &str) -> Result<String, Error> {
        if name.is_empty() {
            return Err(Error::BadArgs("folder name is required".into()));
        }
        let master = self
            .master_key
            .ok_or_else(|| Error::BadAuth("not logged in".into()))?;
        let parent_node = self
            .fs
            .lookup(parent)
            .ok_or_else(|| Error::BadArgs(format!("unknown parent {}", parent)))?;
        if !parent_node.is_dir() {
            return Err(Error::BadArgs(format!("parent {} is not a folder", parent)));
        }

        let mut key = [0u8; 16];
        random_bytes(&mut key);
        let attr = encrypt_attr(&key, &FileAttr { name: name.to_string() })?;
        let mut wrapped = key.to_vec();
        block_encrypt(&aes128(&master)?, &mut wrapped);

        let msg = PutNodesMsg {
            cmd: "p",
            target: parent.to_string(),
            nodes: vec![NewNode {
                handle: "xxxxxxxx".to_string(),
                t: NodeKind::Folder.to_wire(),
                attr,
                key: base64url_encode(&wrapped),
            }],
            nonce: Some(rand_string(10)),
        };
        let resp: PutNodesResp = self.api.request(&msg).await?;
        let rec = resp
            .nodes
            .first()
            .ok_or_else(|| Error::BadResp("folder response carried no node".into()))?;
        self.add_fs_node(rec)
    }

    /// Rename a node: the attribute blob is re-encrypted under the node
    /// key and the node's key material re-wrapped under the master key.
    pub async fn rename(&mut self, handle: &str, name: &str) -> Result<(), Error> {
        if name.is_empty() {
            return Err(Error::BadArgs("name is required".into()));
        }
        let master = self
            .master_key
            .ok_or_else(|| Error::BadAuth("not logged in".into()))?;
        let node = self
            .fs
            .lookup(handle)
            .ok_or_else(|| Error::BadArgs(format!("unknown node {}", handle)))?;
        if node.key.is_empty() {
            return Err(Error::BadArgs(format!("node {} has no key", handle)));
        }

        let attr = encrypt_attr(&node.key, &FileAttr { name: name.to_string() })?;
        let mut wrapped = match node.meta() {
            Some(meta) => meta.compkey.to_vec(),
            None => node.key.clone(),
        };
        block_encrypt(&aes128(&master)?, &mut wrapped);

        let msg = SetAttrMsg {
            cmd: "a",
            attr,
            key: base64url_encode(&wrapped),
            n: handle.to_string(),
            i: rand_string(10),
        };
        let _: i64 = self.api.request(&msg).await?;

        if let Some(node) = self.fs.nodes.get_mut(handle) {
            node.name = name.to_string();
        }
        Ok(())
    }

    /// Move a node under a new parent.
    pub async fn move_node(&mut self, handle: &str, new_parent: &str) -> Result<(), Error> {
        if self.fs.lookup(handle).is_none() {
            return Err(Error::BadArgs(format!("unknown node {}", handle)));
        }
        let parent_node = self
            .fs
            .lookup(new_parent)
            .ok_or_else(|| Error::BadArgs(format!("unknown parent {}", new_parent)))?;
        if !parent_node.is_dir() {
            return Err(Error::BadArgs(format!("target {} is not a folder", new_parent)));
        }

        let msg = MoveMsg {
            cmd: "m",
            n: handle.to_string(),
            target: new_parent.to_string(),
            i: rand_string(10),
        };
        let _: i64 = self.api.request(&msg).await?;

        self.fs.link(new_parent, handle);
        Ok(())
    }

    /// Delete a node. `destroy = false` moves it into the trash; `true`
    /// removes it from the server and the local mirror.
    pub async fn delete(&mut self, handle: &str, destroy: bool) -> Result<(), Error> {
        if self.fs.lookup(handle).is_none() {
            return Err(Error::BadArgs(format!("unknown node {}", handle)));
        }

        if !destroy {
            let trash = self
                .fs
                .trash
                .clone()
                .ok_or_else(|| Error::BadArgs("trash not present in mirror".into()))?;
            return self.move_node(handle, &trash).await;
        }

        let msg = DeleteMsg {
            cmd: "d",
            n: handle.to_string(),
            i: rand_string(10),
        };
        let _: i64 = self.api.request(&msg).await?;

        self.fs.remove(handle);
        Ok(())
    }
}

impl Default for Mega {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use num_bigint::BigUint;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Mutex;

    const OWNER: &str = "me12345";
    const MASTER_KEY: [u8; 16] = [
        0x0F, 0x1E, 0x2D, 0x3C, 0x4B, 0x5A, 0x69, 0x78, 0x87, 0x96, 0xA5, 0xB4, 0xC3, 0xD2, 0xE1,
        0xF0,
    ];

    fn ecb_wrap(key: &[u8; 16], plain: &[u8]) -> String {
        let mut buf = plain.to_vec();
        block_encrypt(&aes128(key).unwrap(), &mut buf);
        base64url_encode(&buf)
    }

    fn encode_mpi(v: &BigUint) -> Vec<u8> {
        let mut out = (v.bits() as u16).to_be_bytes().to_vec();
        out.extend_from_slice(&v.to_bytes_be());
        out
    }

    /// Login response material: wrapped master key, encrypted RSA private
    /// key, and a session challenge whose decryption is predictable.
    fn login_fixture() -> (String, String, String, Vec<u8>) {
        let passkey = password_key("password");
        let k = ecb_wrap(&passkey, &MASTER_KEY);

        let p = (BigUint::from(1u8) << 255) - BigUint::from(19u8);
        let q = (BigUint::from(1u8) << 127) - BigUint::from(1u8);
        let d = BigUint::from(65537u32);

        let mut privk_plain = encode_mpi(&p);
        privk_plain.extend_from_slice(&encode_mpi(&q));
        privk_plain.extend_from_slice(&encode_mpi(&d));
        privk_plain.extend_from_slice(&encode_mpi(&BigUint::from(1u8)));
        let privk = ecb_wrap(&MASTER_KEY, &crate::crypto::pad_null(privk_plain, 16));

        let m = BigUint::from_bytes_be(&[0x42; 40]);
        let csid = base64url_encode(&encode_mpi(&m));
        let sid = m.modpow(&d, &(&p * &q)).to_bytes_be()[..43].to_vec();

        (k, privk, csid, sid)
    }

    /// Scripted MEGA server: answers commands from a mutable manifest and
    /// stores upload chunks in memory.
    struct MockServer {
        state: Mutex<ServerState>,
        reject_login: bool,
    }

    struct ServerState {
        manifest: serde_json::Value,
        chunks: HashMap<u64, Vec<u8>>,
        put_count: u32,
    }

    impl MockServer {
        fn new(manifest: serde_json::Value) -> Self {
            Self {
                state: Mutex::new(ServerState {
                    manifest,
                    chunks: HashMap::new(),
                    put_count: 0,
                }),
                reject_login: false,
            }
        }

        fn handle(&self, cmd: &serde_json::Value) -> serde_json::Value {
            let mut state = self.state.lock().unwrap();
            match cmd["a"].as_str().unwrap_or_default() {
                "us" => {
                    if self.reject_login {
                        return serde_json::json!([-9]);
                    }
                    let (k, privk, csid, _) = login_fixture();
                    serde_json::json!([{ "k": k, "privk": privk, "csid": csid }])
                }
                "ug" => serde_json::json!([{
                    "u": OWNER, "email": "user@example.com", "name": "Test User"
                }]),
                "f" => serde_json::json!([state.manifest.clone()]),
                "g" => {
                    let size: u64 = state.chunks.values().map(|c| c.len() as u64).sum();
                    serde_json::json!([{ "g": "https://dl.mock/res", "s": size }])
                }
                "u" => serde_json::json!([{ "p": "https://ul.mock/slot" }]),
                "p" => {
                    state.put_count += 1;
                    let new = &cmd["n"][0];
                    let handle = format!("node{:04}", state.put_count);
                    let rec = serde_json::json!({
                        "h": handle,
                        "p": cmd["t"],
                        "u": OWNER,
                        "t": new["t"],
                        "a": new["a"],
                        "k": format!("{}:{}", OWNER, new["k"].as_str().unwrap()),
                        "ts": 1_700_000_000u64,
                        "s": 0u64,
                    });
                    state.manifest["f"].as_array_mut().unwrap().push(rec.clone());
                    serde_json::json!([{ "f": [rec] }])
                }
                "a" => {
                    let handle = cmd["n"].as_str().unwrap();
                    for rec in state.manifest["f"].as_array_mut().unwrap() {
                        if rec["h"] == handle {
                            rec["a"] = cmd["attr"].clone();
                        }
                    }
                    serde_json::json!([0])
                }
                "m" => {
                    let handle = cmd["n"].as_str().unwrap();
                    for rec in state.manifest["f"].as_array_mut().unwrap() {
                        if rec["h"] == handle {
                            rec["p"] = cmd["t"].clone();
                        }
                    }
                    serde_json::json!([0])
                }
                "d" => {
                    let handle = cmd["n"].as_str().unwrap().to_string();
                    let nodes = state.manifest["f"].as_array_mut().unwrap();
                    nodes.retain(|rec| rec["h"] != handle.as_str());
                    serde_json::json!([0])
                }
                other => {
                    panic!("mock server got unexpected command {:?}", other);
                }
            }
        }
    }

    #[async_trait]
    impl Transport for MockServer {
        async fn post_json(&self, _url: &str, body: &[u8]) -> Result<Vec<u8>, Error> {
            let cmds: Vec<serde_json::Value> = serde_json::from_slice(body).unwrap();
            let resp = self.handle(&cmds[0]);
            Ok(serde_json::to_vec(&resp).unwrap())
        }

        async fn get_chunk(&self, url: &str) -> Result<Vec<u8>, Error> {
            let tail = url.rsplit('/').next().unwrap();
            let start: u64 = tail.split('-').next().unwrap().parse().unwrap();
            self.state
                .lock()
                .unwrap()
                .chunks
                .get(&start)
                .cloned()
                .ok_or_else(|| Error::Network(format!("no chunk at {}", start)))
        }

        async fn post_chunk(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, Error> {
            let start: u64 = url.rsplit('/').next().unwrap().parse().unwrap();
            let mut state = self.state.lock().unwrap();
            state.chunks.insert(start, body);
            Ok(b"COMPHANDLE01".to_vec())
        }
    }

    // ─── Manifest fixtures ─────────────────────────────────────────────

    fn owned_key(plain: &[u8]) -> String {
        format!("{}:{}", OWNER, ecb_wrap(&MASTER_KEY, plain))
    }

    fn file_compkey(seed: u8) -> [u32; 8] {
        let mut w = [0u32; 8];
        for (i, word) in w.iter_mut().enumerate() {
            *word = u32::from_be_bytes([seed, i as u8, seed.wrapping_mul(3), 0x5A]);
        }
        w
    }

    fn effective_key(compkey: &[u32; 8]) -> [u8; 16] {
        let mut key = [0u8; 16];
        key.copy_from_slice(&a32_to_bytes(&[
            compkey[0] ^ compkey[4],
            compkey[1] ^ compkey[5],
            compkey[2] ^ compkey[6],
            compkey[3] ^ compkey[7],
        ]));
        key
    }

    /// Base manifest: root/inbox/trash, a folder, a file inside it, and
    /// an incoming share with one descendant file. The file record comes
    /// before its parent folder to exercise stub upgrading.
    fn base_manifest() -> serde_json::Value {
        let folder_key = [0xA1u8; 16];
        let folder_attr = encrypt_attr(&folder_key, &FileAttr { name: "docs".into() }).unwrap();

        let compkey = file_compkey(7);
        let file_attr =
            encrypt_attr(&effective_key(&compkey), &FileAttr { name: "notes.txt".into() }).unwrap();

        let share_key = [0xB2u8; 16];
        let share_key_wrapped = ecb_wrap(&MASTER_KEY, &share_key);
        let shfolder_key = [0xC3u8; 16];
        let shfolder_attr =
            encrypt_attr(&shfolder_key, &FileAttr { name: "from bob".into() }).unwrap();
        let sh_compkey = file_compkey(9);
        let sh_file_attr =
            encrypt_attr(&effective_key(&sh_compkey), &FileAttr { name: "shared.bin".into() })
                .unwrap();

        serde_json::json!({
            "f": [
                { "h": "root0001", "t": 2, "u": OWNER },
                { "h": "inbox001", "t": 3, "u": OWNER },
                { "h": "trash001", "t": 4, "u": OWNER },
                // Child listed before its parent folder.
                {
                    "h": "file0001", "p": "fold0001", "u": OWNER, "t": 0,
                    "a": file_attr, "k": owned_key(&a32_to_bytes(&compkey)),
                    "ts": 1_699_000_001u64, "s": 204_800u64
                },
                {
                    "h": "fold0001", "p": "root0001", "u": OWNER, "t": 1,
                    "a": folder_attr, "k": owned_key(&[0xA1u8; 16]),
                    "ts": 1_699_000_000u64
                },
                {
                    "h": "shro0001", "p": "", "u": "bob99999", "t": 1,
                    "a": shfolder_attr,
                    "k": format!("shro0001:{}", ecb_wrap(&share_key, &shfolder_key)),
                    "su": "bob99999", "sk": share_key_wrapped,
                    "ts": 1_699_000_002u64
                },
                {
                    "h": "shfi0001", "p": "shro0001", "u": "bob99999", "t": 0,
                    "a": sh_file_attr,
                    "k": format!("shro0001:{}", ecb_wrap(&share_key, &a32_to_bytes(&sh_compkey))),
                    "ts": 1_699_000_003u64, "s": 512u64
                }
            ],
            "ok": [
                { "h": "shro0001", "k": share_key_wrapped }
            ]
        })
    }

    async fn logged_in_client(server: Arc<MockServer>) -> Mega {
        let mut mega = Mega::with_transport(Config::default(), server);
        mega.login("user@example.com", "password").await.unwrap();
        mega
    }

    fn tmp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("aeromega_client_{}_{}", tag, rand_string(8)))
    }

    #[tokio::test]
    async fn test_login_establishes_session() {
        let server = Arc::new(MockServer::new(base_manifest()));
        let mega = logged_in_client(server).await;

        let (_, _, _, expected_sid) = login_fixture();
        assert_eq!(mega.session_id().unwrap().len(), 43);
        assert_eq!(mega.session_id().unwrap(), expected_sid.as_slice());
        assert_eq!(mega.master_key, Some(MASTER_KEY));
        // The user handle is the stringhash of the email under the
        // password key: 8 bytes, base64url.
        assert_eq!(mega.user_handle().unwrap().len(), 11);
    }

    #[tokio::test]
    async fn test_login_rejection_is_bad_auth() {
        let mut server = MockServer::new(base_manifest());
        server.reject_login = true;
        let mut mega = Mega::with_transport(Config::default(), Arc::new(server));
        let res = mega.login("user@example.com", "wrong").await;
        assert!(matches!(res, Err(Error::BadAuth(_))));
    }

    #[tokio::test]
    async fn test_login_requires_arguments() {
        let server = Arc::new(MockServer::new(base_manifest()));
        let mut mega = Mega::with_transport(Config::default(), server);
        assert!(matches!(
            mega.login("", "password").await,
            Err(Error::BadArgs(_))
        ));
    }

    #[tokio::test]
    async fn test_get_user() {
        let server = Arc::new(MockServer::new(base_manifest()));
        let mut mega = logged_in_client(server).await;
        let user = mega.get_user().await.unwrap();
        assert_eq!(user.user, OWNER);
        assert_eq!(user.email, "user@example.com");
    }

    #[tokio::test]
    async fn test_manifest_builds_tree_with_stub_upgrade() {
        let server = Arc::new(MockServer::new(base_manifest()));
        let mut mega = logged_in_client(server).await;
        mega.get_filesystem().await.unwrap();

        let fs = mega.fs();
        assert_eq!(fs.root().unwrap().name(), "Cloud Drive");
        assert_eq!(fs.trash().unwrap().name(), "Trash");
        assert_eq!(fs.inbox().unwrap().name(), "InBox");

        // The folder arrived after its child and was upgraded in place.
        let folder = fs.lookup("fold0001").unwrap();
        assert_eq!(folder.name(), "docs");
        assert_eq!(folder.kind(), NodeKind::Folder);
        assert_eq!(folder.parent_handle(), Some("root0001"));
        assert!(folder.children().contains(&"file0001".to_string()));

        let file = fs.lookup("file0001").unwrap();
        assert_eq!(file.name(), "notes.txt");
        assert_eq!(file.size(), 204_800);
        let meta = file.meta().unwrap();
        assert_eq!(meta.key, effective_key(&file_compkey(7)));
        assert_eq!(meta.compkey.to_vec(), a32_to_bytes(&file_compkey(7)));

        // Parent/child links are mutually consistent.
        for node in fs.nodes.values() {
            if let Some(parent) = node.parent_handle() {
                assert!(fs.lookup(parent).unwrap().children().contains(&node.handle().to_string()));
            }
            for child in node.children() {
                assert_eq!(fs.lookup(child).unwrap().parent_handle(), Some(node.handle()));
            }
        }
    }

    #[tokio::test]
    async fn test_manifest_shared_root_and_descendant() {
        let server = Arc::new(MockServer::new(base_manifest()));
        let mut mega = logged_in_client(server).await;
        mega.get_filesystem().await.unwrap();

        let fs = mega.fs();
        let sroots = fs.shared_roots();
        assert_eq!(sroots.len(), 1);
        assert_eq!(sroots[0].handle(), "shro0001");
        assert_eq!(sroots[0].name(), "from bob");

        // The descendant's key went through the share-key indirection and
        // its attributes decrypt cleanly.
        let shared = fs.lookup("shfi0001").unwrap();
        assert_eq!(shared.name(), "shared.bin");
        assert_eq!(shared.meta().unwrap().key, effective_key(&file_compkey(9)));
        assert_eq!(shared.parent_handle(), Some("shro0001"));
    }

    #[tokio::test]
    async fn test_path_lookup_through_manifest() {
        let server = Arc::new(MockServer::new(base_manifest()));
        let mut mega = logged_in_client(server).await;
        mega.get_filesystem().await.unwrap();

        let root = mega.fs().root().unwrap().handle().to_string();
        let path = mega.fs().path_lookup(&root, &["docs", "notes.txt"]).unwrap();
        assert_eq!(path, vec!["fold0001".to_string(), "file0001".to_string()]);

        assert!(matches!(
            mega.fs().path_lookup(&root, &["docs", "nope.txt"]),
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_upload_then_download_through_protocol() {
        let server = Arc::new(MockServer::new(base_manifest()));
        let mut mega = logged_in_client(server.clone()).await;
        mega.get_filesystem().await.unwrap();

        let data: Vec<u8> = (0..300_000usize).map(|i| (i % 251) as u8).collect();
        let src = tmp_path("ul");
        tokio::fs::write(&src, &data).await.unwrap();

        let handle = mega
            .upload_file(&src, "fold0001", Some("blob.bin"))
            .await
            .unwrap();

        let node = mega.fs().lookup(&handle).unwrap();
        assert_eq!(node.name(), "blob.bin");
        assert_eq!(node.kind(), NodeKind::File);
        assert_eq!(node.parent_handle(), Some("fold0001"));
        assert!(node.meta().is_some());

        let dst = tmp_path("dl");
        mega.download_file(&handle, &dst).await.unwrap();
        let roundtripped = tokio::fs::read(&dst).await.unwrap();
        assert_eq!(roundtripped, data);

        let _ = tokio::fs::remove_file(&src).await;
        let _ = tokio::fs::remove_file(&dst).await;
    }

    #[tokio::test]
    async fn test_create_dir() {
        let server = Arc::new(MockServer::new(base_manifest()));
        let mut mega = logged_in_client(server).await;
        mega.get_filesystem().await.unwrap();

        let handle = mega.create_dir("projects", "root0001").await.unwrap();
        let node = mega.fs().lookup(&handle).unwrap();
        assert_eq!(node.name(), "projects");
        assert_eq!(node.kind(), NodeKind::Folder);
        assert_eq!(node.parent_handle(), Some("root0001"));
        assert_eq!(node.key.len(), 16);
    }

    #[tokio::test]
    async fn test_soft_delete_moves_to_trash() {
        let server = Arc::new(MockServer::new(base_manifest()));
        let mut mega = logged_in_client(server).await;
        mega.get_filesystem().await.unwrap();

        mega.delete("file0001", false).await.unwrap();
        let node = mega.fs().lookup("file0001").unwrap();
        assert_eq!(node.parent_handle(), Some("trash001"));
        assert!(mega
            .fs()
            .trash()
            .unwrap()
            .children()
            .contains(&"file0001".to_string()));
        assert!(!mega
            .fs()
            .lookup("fold0001")
            .unwrap()
            .children()
            .contains(&"file0001".to_string()));
    }

    #[tokio::test]
    async fn test_destroy_removes_node() {
        let server = Arc::new(MockServer::new(base_manifest()));
        let mut mega = logged_in_client(server).await;
        mega.get_filesystem().await.unwrap();

        mega.delete("file0001", true).await.unwrap();
        assert!(mega.fs().lookup("file0001").is_none());
        assert!(!mega
            .fs()
            .lookup("fold0001")
            .unwrap()
            .children()
            .contains(&"file0001".to_string()));
    }

    #[tokio::test]
    async fn test_move_relinks_parents() {
        let server = Arc::new(MockServer::new(base_manifest()));
        let mut mega = logged_in_client(server).await;
        mega.get_filesystem().await.unwrap();

        mega.move_node("file0001", "root0001").await.unwrap();
        assert_eq!(
            mega.fs().lookup("file0001").unwrap().parent_handle(),
            Some("root0001")
        );
        assert!(!mega
            .fs()
            .lookup("fold0001")
            .unwrap()
            .children()
            .contains(&"file0001".to_string()));
    }

    #[tokio::test]
    async fn test_rename_preserves_content_key() {
        let server = Arc::new(MockServer::new(base_manifest()));
        let mut mega = logged_in_client(server).await;
        mega.get_filesystem().await.unwrap();

        let key_before = mega.fs().lookup("file0001").unwrap().meta().unwrap().key;
        mega.rename("file0001", "renamed.txt").await.unwrap();

        // Re-ingest the manifest: the server stored the new attribute
        // blob, which must decrypt under the unchanged content key.
        mega.get_filesystem().await.unwrap();
        let node = mega.fs().lookup("file0001").unwrap();
        assert_eq!(node.name(), "renamed.txt");
        assert_eq!(node.meta().unwrap().key, key_before);
    }

    #[tokio::test]
    async fn test_download_unknown_node_is_bad_args() {
        let server = Arc::new(MockServer::new(base_manifest()));
        let mut mega = logged_in_client(server).await;
        let res = mega.download_file("missing1", tmp_path("none")).await;
        assert!(matches!(res, Err(Error::BadArgs(_))));
    }
}
