//! Native MEGA.nz protocol client with client-side encryption.
//!
//! The service stores only ciphertext: the master key is derived from
//! the account password, every node key is wrapped on the client, and
//! file contents are AES-CTR streamed with a chained CBC-MAC verified
//! locally. This crate covers the session, the encrypted filesystem
//! mirror, parallel chunked transfers, and the mutation commands.
//!
//! ```no_run
//! use aeromega::{Config, Mega};
//!
//! # async fn demo() -> Result<(), aeromega::Error> {
//! let mut mega = Mega::with_config(Config::default());
//! mega.login("user@example.com", "correct horse").await?;
//! mega.get_filesystem().await?;
//!
//! let root = mega.fs().root().unwrap().handle().to_string();
//! let handle = mega.upload_file("report.pdf", &root, None).await?;
//! mega.download_file(&handle, "report-copy.pdf").await?;
//! # Ok(())
//! # }
//! ```

mod api;
mod attr;
mod client;
mod config;
mod crypto;
mod error;
mod fs;
mod messages;
mod transfer;

pub use api::{HttpTransport, Transport};
pub use attr::{decrypt_attr, encrypt_attr, FileAttr};
pub use client::Mega;
pub use config::{
    Config, API_URL, DOWNLOAD_WORKERS, MAX_DOWNLOAD_WORKERS, MAX_UPLOAD_WORKERS, RETRIES, TIMEOUT,
    UPLOAD_WORKERS,
};
pub use crypto::{a32_to_bytes, base64url_decode, base64url_encode, bytes_to_a32, password_key, stringhash};
pub use error::Error;
pub use fs::{FileSystem, Node, NodeKind, NodeMeta};
pub use messages::UserInfo;
pub use transfer::{chunk_schedule, Chunk};
