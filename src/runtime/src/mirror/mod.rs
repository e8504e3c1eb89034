//! Image copy and existence checks.

mod oci;

pub use oci::{OciMirror, RegistryAuth};

use a3s_mirror_core::error::Result;
use a3s_mirror_core::{MultiArch, RunOptions};
use async_trait::async_trait;

/// Per-call transfer settings derived from the run options.
#[derive(Debug, Clone)]
pub struct CopyOptions {
    pub src_tls_verify: bool,
    pub dest_tls_verify: bool,
    pub multi_arch: MultiArch,
    /// `localhost:<port>` of the local cache registry, always plain HTTP
    pub local_storage_fqdn: String,
}

impl CopyOptions {
    pub fn from_run(opts: &RunOptions) -> Self {
        Self {
            src_tls_verify: opts.global.src_tls_verify,
            dest_tls_verify: opts.global.dest_tls_verify,
            multi_arch: opts.multi_arch,
            local_storage_fqdn: opts.local_storage_fqdn.clone(),
        }
    }

    /// Whether `registry` is the local cache registry.
    pub fn is_local(&self, registry: &str) -> bool {
        registry == self.local_storage_fqdn
            || registry.starts_with("localhost:")
            || registry.starts_with("127.0.0.1:")
    }
}

/// Copies images between registries and checks for their presence.
#[async_trait]
pub trait Mirror: Send + Sync {
    /// Copy `source` to `destination`, both `docker://` references.
    async fn copy(&self, source: &str, destination: &str, opts: &CopyOptions) -> Result<()>;

    /// Whether `image` exists in its registry.
    async fn check(&self, image: &str, opts: &CopyOptions) -> Result<bool>;
}
