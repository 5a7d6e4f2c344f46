//! nbstack - notebook platform stack deployment
//!
//! nbstack provisions a multi-component notebook-serving stack (hub, NFS
//! fileserver, TLS-terminating nginx proxy, optional log shipping and image
//! prepulling) on Google Kubernetes Engine, and publishes a Route 53 A record
//! pointing at the resulting ingress. It can also reverse the whole thing.
//!
//! The tool assumes `gcloud`, `kubectl`, and `aws` are installed and already
//! authenticated; manifests are rendered from a cloned template repository and
//! applied in dependency order with `kubectl`.
//!
//! # Modules
//!
//! - [`params`] - parameter validation, defaulting, and normalization
//! - [`config`] - parameter file / environment input and audit snapshots
//! - [`render`] - manifest template rendering with secret encoding
//! - [`orchestrator`] - ordered create/destroy sequencing over the components
//! - [`components`] - the static component list
//! - [`runner`] - external process invocation
//! - [`kubecontext`] - ambient kubectl context save/switch/restore
//! - [`wait`] - bounded polling for cluster-assigned state
//! - [`dns`] - Route 53 record management
//! - [`repo`] - manifest template repository checkout
//! - [`error`] - error types

#![deny(missing_docs)]

pub mod components;
pub mod config;
pub mod dns;
pub mod error;
pub mod kubecontext;
pub mod orchestrator;
pub mod params;
pub mod render;
pub mod repo;
pub mod runner;
pub mod wait;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Git repository holding the manifest templates for all components
pub const TEMPLATE_REPO_URL: &str = "https://github.com/nbstack/nbstack-manifests.git";

/// External tools required for every run
pub const REQUIRED_EXECUTABLES: &[&str] = &["gcloud", "kubectl", "aws"];

/// Default GKE zone when none is supplied
pub const DEFAULT_GKE_ZONE: &str = "us-central1-a";

/// Default GKE machine type when none is supplied
pub const DEFAULT_GKE_MACHINE_TYPE: &str = "n1-standard-2";

/// Default GKE node count when none is supplied
pub const DEFAULT_GKE_NODE_COUNT: i64 = 2;

/// Default shared volume size in GiB when none is supplied
pub const DEFAULT_VOLUME_SIZE_GB: i64 = 20;
