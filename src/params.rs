//! Parameter validation, defaulting, and normalization
//!
//! User-supplied parameters arrive as a flat key/value map with a fixed,
//! enumerable vocabulary. Resolution turns that raw map into the canonical
//! form the rest of the system consumes: required keys verified, defaults
//! filled in, sizing and URLs derived, and optional feature groups forced to
//! an all-or-nothing state. After resolution every key consumed by template
//! rendering is present, even if empty.

use std::collections::BTreeMap;
use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Error;
use crate::runner::{argv, CommandRunner, RunOpts};
use crate::Result;

// =============================================================================
// Parameter key vocabulary
// =============================================================================

/// Target cluster name
pub const KUBERNETES_CLUSTER_NAME: &str = "kubernetes_cluster_name";
/// Cluster namespace for every namespaced resource
pub const KUBERNETES_CLUSTER_NAMESPACE: &str = "kubernetes_cluster_namespace";
/// External FQDN of the deployed stack
pub const HOSTNAME: &str = "hostname";
/// GitHub OAuth application client id
pub const GITHUB_CLIENT_ID: &str = "github_client_id";
/// GitHub OAuth application client secret
pub const GITHUB_CLIENT_SECRET: &str = "github_client_secret";
/// GitHub organizations whose members may log in
pub const GITHUB_ORGANIZATION_WHITELIST: &str = "github_organization_whitelist";
/// Path to the TLS certificate file
pub const TLS_CERT: &str = "tls_cert";
/// Path to the TLS key file
pub const TLS_KEY: &str = "tls_key";
/// Path to the TLS root chain file
pub const TLS_ROOT_CHAIN: &str = "tls_root_chain";
/// Path to a pre-generated DH parameter file
pub const TLS_DHPARAM: &str = "tls_dhparam";
/// Bit size for generated DH parameters
pub const DHPARAM_BITS: &str = "dhparam_bits";
/// GKE zone
pub const GKE_ZONE: &str = "gke_zone";
/// GKE node count
pub const GKE_NODE_COUNT: &str = "gke_node_count";
/// GKE machine type
pub const GKE_MACHINE_TYPE: &str = "gke_machine_type";
/// Shared volume size in GiB
pub const VOLUME_SIZE_GIGABYTES: &str = "volume_size_gigabytes";
/// Hub session database URL
pub const SESSION_DB_URL: &str = "session_db_url";
/// Log shipper instance name (logging group)
pub const LOG_SHIPPER_NAME: &str = "log_shipper_name";
/// RabbitMQ credential for the log pipeline (logging group)
pub const RABBITMQ_PAN_PASSWORD: &str = "rabbitmq_pan_password";
/// RabbitMQ host receiving shipped logs (logging group)
pub const RABBITMQ_TARGET_HOST: &str = "rabbitmq_target_host";
/// RabbitMQ vhost receiving shipped logs (logging group)
pub const RABBITMQ_TARGET_VHOST: &str = "rabbitmq_target_vhost";
/// Path to the beats client certificate (logging group)
pub const BEATS_CERT: &str = "beats_cert";
/// Path to the beats client key (logging group)
pub const BEATS_KEY: &str = "beats_key";
/// Path to the beats certificate authority (logging group)
pub const BEATS_CA: &str = "beats_ca";
/// Firefly admin password (firefly group)
pub const FIREFLY_ADMIN_PASSWORD: &str = "firefly_admin_password";

/// Derived: shared volume size as a Kubernetes quantity
pub const VOLUME_SIZE: &str = "volume_size";
/// Derived: NFS export size as a Kubernetes quantity
pub const NFS_VOLUME_SIZE: &str = "nfs_volume_size";
/// Derived: OAuth callback URL for the hub
pub const GITHUB_CALLBACK_URL: &str = "github_callback_url";
/// Derived: symmetric key material for hub auth-state encryption
pub const CRYPTO_KEY: &str = "crypto_key";
/// Derived: PEM text of the DH parameter block
pub const DHPARAMS: &str = "dhparams";

/// Keys required for teardown
pub const REQUIRED_TEARDOWN_KEYS: &[&str] = &[KUBERNETES_CLUSTER_NAME, HOSTNAME];

/// Keys additionally required for deployment
pub const REQUIRED_DEPLOY_KEYS: &[&str] = &[
    GITHUB_CLIENT_ID,
    GITHUB_CLIENT_SECRET,
    GITHUB_ORGANIZATION_WHITELIST,
    TLS_CERT,
    TLS_KEY,
    TLS_ROOT_CHAIN,
];

/// The logging feature group: enabled only when every member is non-empty
pub const LOGGING_GROUP: &[&str] = &[
    RABBITMQ_PAN_PASSWORD,
    RABBITMQ_TARGET_HOST,
    RABBITMQ_TARGET_VHOST,
    LOG_SHIPPER_NAME,
    BEATS_KEY,
    BEATS_CA,
    BEATS_CERT,
];

/// The complete recognized input vocabulary; anything else warns
pub const PARAMETER_NAMES: &[&str] = &[
    KUBERNETES_CLUSTER_NAME,
    KUBERNETES_CLUSTER_NAMESPACE,
    HOSTNAME,
    GITHUB_CLIENT_ID,
    GITHUB_CLIENT_SECRET,
    GITHUB_ORGANIZATION_WHITELIST,
    TLS_CERT,
    TLS_KEY,
    TLS_ROOT_CHAIN,
    TLS_DHPARAM,
    DHPARAM_BITS,
    GKE_ZONE,
    GKE_NODE_COUNT,
    GKE_MACHINE_TYPE,
    VOLUME_SIZE_GIGABYTES,
    SESSION_DB_URL,
    LOG_SHIPPER_NAME,
    RABBITMQ_PAN_PASSWORD,
    RABBITMQ_TARGET_HOST,
    RABBITMQ_TARGET_VHOST,
    BEATS_CERT,
    BEATS_KEY,
    BEATS_CA,
    FIREFLY_ADMIN_PASSWORD,
];

/// Default session database used when none is supplied
const DEFAULT_SESSION_DB_URL: &str = "sqlite:////home/jupyter/jupyterhub.sqlite";

/// Default DH parameter size in bits
const DEFAULT_DHPARAM_BITS: i64 = 2048;

// =============================================================================
// Parameter values
// =============================================================================

/// A scalar or list parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// Integer scalar
    Int(i64),
    /// String scalar
    Str(String),
    /// List of strings (the organization allow-list)
    List(Vec<String>),
}

impl ParamValue {
    fn is_empty(&self) -> bool {
        match self {
            ParamValue::Int(_) => false,
            ParamValue::Str(s) => s.is_empty(),
            ParamValue::List(l) => l.is_empty(),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Str(s) => write!(f, "{s}"),
            ParamValue::List(l) => write!(f, "{}", l.join(",")),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::Str(s.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        ParamValue::Str(s)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

/// The flat parameter map, one per invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSet {
    values: BTreeMap<String, ParamValue>,
}

impl ParameterSet {
    /// Create an empty parameter set
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a raw key/value map
    pub fn from_map(values: BTreeMap<String, ParamValue>) -> Self {
        Self { values }
    }

    /// Look up a raw value
    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.values.get(key)
    }

    /// String form of a value; empty string when absent.
    ///
    /// Template substitution never faces a missing key because resolution
    /// stores an empty-string sentinel for every unset optional.
    pub fn get_str(&self, key: &str) -> String {
        self.values.get(key).map(|v| v.to_string()).unwrap_or_default()
    }

    /// Integer form of a value, parsing string scalars
    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.values.get(key)? {
            ParamValue::Int(v) => Some(*v),
            ParamValue::Str(s) => s.parse().ok(),
            ParamValue::List(_) => None,
        }
    }

    /// Set a value
    pub fn set(&mut self, key: &str, value: impl Into<ParamValue>) {
        self.values.insert(key.to_string(), value.into());
    }

    /// Whether a key is missing or holds an empty value
    pub fn is_empty(&self, key: &str) -> bool {
        self.values.get(key).map(ParamValue::is_empty).unwrap_or(true)
    }

    /// Iterate over all entries
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.values.iter()
    }

    /// Warn about keys outside the recognized vocabulary. Unknown keys are
    /// kept, not rejected.
    pub fn warn_unknown_keys(&self) {
        for key in self.values.keys() {
            if !PARAMETER_NAMES.contains(&key.as_str()) {
                warn!(key = %key, "unknown parameter");
            }
        }
    }
}

// =============================================================================
// Resolution
// =============================================================================

/// Feature flags derived from which optional groups are fully populated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureFlags {
    /// Firefly manifests get real credentials
    pub enable_firefly: bool,
    /// Logging components are deployed
    pub enable_logging: bool,
}

/// Validate and default the cluster-identity subset shared by deploy and
/// teardown: cluster name (derivable from the hostname), namespace, zone.
fn resolve_cluster_info(params: &mut ParameterSet) -> Result<()> {
    if params.is_empty(KUBERNETES_CLUSTER_NAME) {
        if params.is_empty(HOSTNAME) {
            return Err(Error::validation(
                "'kubernetes_cluster_name' must be set, either explicitly or from 'hostname'",
            ));
        }
        let derived = params.get_str(HOSTNAME).replace('.', "-");
        warn!(cluster = %derived, "using cluster name derived from hostname");
        params.set(KUBERNETES_CLUSTER_NAME, derived);
    }
    if params.is_empty(KUBERNETES_CLUSTER_NAMESPACE) {
        info!("using default cluster namespace 'default'");
        params.set(KUBERNETES_CLUSTER_NAMESPACE, "default");
    }
    if params.is_empty(GKE_ZONE) {
        info!(zone = crate::DEFAULT_GKE_ZONE, "using default gke_zone");
        params.set(GKE_ZONE, crate::DEFAULT_GKE_ZONE);
    }
    Ok(())
}

/// Resolve the validation subset teardown consumes
pub fn resolve_teardown(params: &mut ParameterSet) -> Result<()> {
    resolve_cluster_info(params)?;
    for key in REQUIRED_TEARDOWN_KEYS {
        if params.is_empty(key) {
            return Err(Error::validation(format!(
                "required parameter '{key}' is missing or empty"
            )));
        }
    }
    Ok(())
}

/// Resolve the full deployment parameter set.
///
/// Fails with a [`Error::Validation`] naming the first missing required key.
/// On success the set carries every derived field and an empty-string
/// sentinel for every unset optional, and the returned flags say which
/// optional component groups are live.
pub fn resolve_deploy(
    params: &mut ParameterSet,
    runner: &dyn CommandRunner,
) -> Result<FeatureFlags> {
    resolve_teardown(params)?;

    for key in REQUIRED_DEPLOY_KEYS {
        if params.is_empty(key) {
            return Err(Error::validation(format!(
                "required deployment parameter '{key}' is missing or empty"
            )));
        }
    }

    if params.is_empty(VOLUME_SIZE_GIGABYTES) {
        warn!(
            gigabytes = crate::DEFAULT_VOLUME_SIZE_GB,
            "using default shared volume size"
        );
        params.set(VOLUME_SIZE_GIGABYTES, crate::DEFAULT_VOLUME_SIZE_GB);
    }
    let size = params.get_int(VOLUME_SIZE_GIGABYTES).ok_or_else(|| {
        Error::validation("'volume_size_gigabytes' must be an integer")
    })?;
    if size < 1 {
        return Err(Error::validation("shared volume must be at least 1 GiB"));
    }
    if params.is_empty(GKE_MACHINE_TYPE) {
        params.set(GKE_MACHINE_TYPE, crate::DEFAULT_GKE_MACHINE_TYPE);
    }
    if params.is_empty(GKE_NODE_COUNT) {
        params.set(GKE_NODE_COUNT, crate::DEFAULT_GKE_NODE_COUNT);
    }

    normalize(params, size)?;
    let flags = apply_feature_groups(params);

    if params.is_empty(CRYPTO_KEY) {
        params.set(CRYPTO_KEY, generate_crypto_key());
    }
    resolve_dhparams(params, runner)?;

    Ok(flags)
}

/// Derived sizing and URL fields.
///
/// The NFS export is sized at 95% of the physical volume (filesystem
/// overhead) but floors at a fixed 950Mi for a 1 GiB volume; the asymmetry
/// between the percentage and the fixed small constant is deliberate.
fn normalize(params: &mut ParameterSet, size: i64) -> Result<()> {
    params.set(VOLUME_SIZE, format!("{size}Gi"));
    let nfs = if size > 1 {
        format!("{}Gi", (0.95 * size as f64) as i64)
    } else {
        "950Mi".to_string()
    };
    params.set(NFS_VOLUME_SIZE, nfs);

    let hostname = params.get_str(HOSTNAME);
    params.set(
        GITHUB_CALLBACK_URL,
        format!("https://{hostname}/hub/oauth_callback"),
    );

    // The allow-list travels as one delimited string from here on
    if let Some(ParamValue::List(orgs)) = params.get(GITHUB_ORGANIZATION_WHITELIST) {
        let joined = orgs.join(",");
        params.set(GITHUB_ORGANIZATION_WHITELIST, joined);
    }
    Ok(())
}

/// Force each optional group to an all-or-nothing state.
///
/// Downstream templates assume full-group consistency: a partially populated
/// group is reset to all-empty rather than rendered half-configured, and the
/// group's feature flag stays off.
fn apply_feature_groups(params: &mut ParameterSet) -> FeatureFlags {
    let mut flags = FeatureFlags::default();

    if params.is_empty(FIREFLY_ADMIN_PASSWORD) {
        params.set(FIREFLY_ADMIN_PASSWORD, "");
    } else {
        flags.enable_firefly = true;
    }

    if LOGGING_GROUP.iter().any(|key| params.is_empty(key)) {
        for key in LOGGING_GROUP {
            params.set(key, "");
        }
    } else {
        flags.enable_logging = true;
    }

    if params.is_empty(SESSION_DB_URL) {
        params.set(SESSION_DB_URL, DEFAULT_SESSION_DB_URL);
    }

    flags
}

/// Fresh symmetric key material: two 16-byte hex halves joined with ';'
fn generate_crypto_key() -> String {
    let mut rng = rand::thread_rng();
    let mut a = [0u8; 16];
    let mut b = [0u8; 16];
    rng.fill_bytes(&mut a);
    rng.fill_bytes(&mut b);
    format!("{};{}", hex(&a), hex(&b))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// External tools a deployment will invoke, given these parameters.
///
/// `openssl` is needed only when no pre-generated DH parameter material is
/// supplied; including it here keeps that failure ahead of any cluster work
/// instead of surfacing as a spawn error mid-resolution.
pub fn required_tools(params: &ParameterSet) -> Vec<&'static str> {
    let mut tools = vec!["gcloud", "kubectl", "aws", "git"];
    if params.is_empty(TLS_DHPARAM) && params.is_empty(DHPARAMS) {
        tools.push("openssl");
    }
    tools
}

/// Resolve the DH parameter block: read the user-supplied file when given,
/// otherwise invoke the external generator. Cached in the set for the run.
fn resolve_dhparams(params: &mut ParameterSet, runner: &dyn CommandRunner) -> Result<()> {
    if !params.is_empty(DHPARAMS) {
        return Ok(());
    }
    let pem = if params.is_empty(TLS_DHPARAM) {
        let bits = params.get_int(DHPARAM_BITS).unwrap_or(DEFAULT_DHPARAM_BITS);
        info!(bits, "generating DH parameters (this can take a while)");
        let out = runner.run(
            &argv(&["openssl", "dhparam", &bits.to_string()]),
            &RunOpts::checked().capture(),
        )?;
        out.stdout
    } else {
        std::fs::read_to_string(params.get_str(TLS_DHPARAM))?
    };
    params.set(DHPARAMS, pem);
    Ok(())
}
