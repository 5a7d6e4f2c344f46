//! Parameter input and audit snapshots
//!
//! Parameters arrive as a flat YAML document or as `NBSTACK_*` environment
//! variables; a certificate-directory shorthand expands to the individual
//! TLS path keys. After a successful render, a timestamped snapshot of the
//! resolved set (secrets and derived sizing excluded) is written for audit
//! and reuse.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::info;

use crate::params::{self, ParamValue, ParameterSet};
use crate::Result;

/// Environment variable prefix for parameter overrides
pub const ENV_PREFIX: &str = "NBSTACK_";

/// Environment variable naming a directory of conventionally-named TLS files
pub const ENV_CERTIFICATE_DIRECTORY: &str = "NBSTACK_CERTIFICATE_DIRECTORY";

/// Keys never written to the audit snapshot: secret material and fields
/// derived from `volume_size_gigabytes` that would drift if edited by hand.
const SNAPSHOT_EXCLUDED_KEYS: &[&str] = &[
    params::GITHUB_CLIENT_SECRET,
    params::RABBITMQ_PAN_PASSWORD,
    params::CRYPTO_KEY,
    params::DHPARAMS,
    params::VOLUME_SIZE,
    params::NFS_VOLUME_SIZE,
];

/// Load a parameter file. Unknown keys are logged as warnings, not rejected.
pub fn load_parameter_file(path: &Path) -> Result<ParameterSet> {
    let text = std::fs::read_to_string(path)?;
    let set: ParameterSet = serde_yaml::from_str(&text)?;
    set.warn_unknown_keys();
    Ok(set)
}

/// Collect parameters from `NBSTACK_*` environment variables.
///
/// The organization allow-list splits on commas; integer-valued keys parse
/// to integers so later validation sees the same shape as file input. When
/// no TLS certificate is given, `NBSTACK_CERTIFICATE_DIRECTORY` supplies the
/// conventional `cert.pem`/`key.pem`/`chain.pem` layout (plus optional
/// `dhparam.pem` and `beats_*.pem`).
pub fn params_from_env() -> ParameterSet {
    let mut set = ParameterSet::new();
    for name in params::PARAMETER_NAMES {
        let var = format!("{ENV_PREFIX}{}", name.to_uppercase());
        let Ok(value) = std::env::var(&var) else {
            continue;
        };
        if value.is_empty() {
            continue;
        }
        let parsed = match *name {
            params::GITHUB_ORGANIZATION_WHITELIST => {
                ParamValue::List(value.split(',').map(str::to_string).collect())
            }
            params::GKE_NODE_COUNT | params::VOLUME_SIZE_GIGABYTES | params::DHPARAM_BITS => {
                match value.parse::<i64>() {
                    Ok(n) => ParamValue::Int(n),
                    Err(_) => ParamValue::Str(value),
                }
            }
            _ => ParamValue::Str(value),
        };
        set.set(name, parsed);
    }

    if set.is_empty(params::TLS_CERT) {
        if let Ok(dir) = std::env::var(ENV_CERTIFICATE_DIRECTORY) {
            apply_certificate_directory(&mut set, Path::new(&dir));
        }
    }
    set
}

/// Map a certificate directory's conventional file names onto the path keys
pub fn apply_certificate_directory(set: &mut ParameterSet, dir: &Path) {
    let path_str = |p: PathBuf| p.to_string_lossy().to_string();
    set.set(params::TLS_CERT, path_str(dir.join("cert.pem")));
    set.set(params::TLS_KEY, path_str(dir.join("key.pem")));
    set.set(params::TLS_ROOT_CHAIN, path_str(dir.join("chain.pem")));
    let dhparam = dir.join("dhparam.pem");
    if dhparam.exists() {
        set.set(params::TLS_DHPARAM, path_str(dhparam));
    }
    let beats_cert = dir.join("beats_cert.pem");
    if set.is_empty(params::BEATS_CERT) && beats_cert.exists() {
        set.set(params::BEATS_CERT, path_str(beats_cert));
        set.set(params::BEATS_CA, path_str(dir.join("beats_ca.pem")));
        set.set(params::BEATS_KEY, path_str(dir.join("beats_key.pem")));
    }
}

/// Overlay `overrides` onto `base`, returning the merged set
pub fn merge(base: ParameterSet, overrides: &ParameterSet) -> ParameterSet {
    let mut merged = base;
    for (key, value) in overrides.iter() {
        merged.set(key, value.clone());
    }
    merged
}

/// Write the timestamped audit snapshot of the resolved parameter set.
///
/// Empty values and [`SNAPSHOT_EXCLUDED_KEYS`] are dropped; what remains is
/// a reusable parameter file describing this deployment.
pub fn save_snapshot(dir: &Path, params: &ParameterSet) -> Result<PathBuf> {
    let stamp = Utc::now().format("%Y-%m-%d-%H-%M-%S-%f-UTC");
    let path = dir.join(format!("deploy.{stamp}.yml"));

    let mut clean: BTreeMap<&str, &ParamValue> = BTreeMap::new();
    for (key, value) in params.iter() {
        if params.is_empty(key) || SNAPSHOT_EXCLUDED_KEYS.contains(&key.as_str()) {
            continue;
        }
        clean.insert(key, value);
    }

    let mut text = String::from("# nbstack deployment snapshot\n");
    text.push_str(&format!("# created at {stamp}\n"));
    text.push_str(&serde_yaml::to_string(&clean)?);
    std::fs::write(&path, text)?;
    info!(path = %path.display(), "wrote deployment snapshot");
    Ok(path)
}
