//! Manifest template rendering with secret encoding
//!
//! Each component's subtree in the working directory holds Jinja-style
//! `*.template.yml` manifests. Rendering substitutes the fixed placeholder
//! vocabulary (secrets base64-encoded for Kubernetes secret objects), writes
//! the finished manifest under the template's base name, and deletes the
//! template: render consumes its source, and re-running it against an
//! already-rendered directory is unsupported.
//!
//! One placeholder is deliberately left unresolved: the in-cluster
//! fileserver address is not known until the service exists, so the
//! fileserver PV manifest re-emits the literal token and is renamed back to
//! a template for a later, narrower pass.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use minijinja::{Environment, UndefinedBehavior};
use tracing::debug;

use crate::components::Component;
use crate::error::Error;
use crate::params::{self, ParameterSet};
use crate::Result;

/// Suffix marking an unrendered manifest
pub const TEMPLATE_SUFFIX: &str = ".template.yml";

/// Base name of the fileserver PV manifest carrying the deferred address
pub const FILESERVER_PV_BASE: &str = "nb-fileserver-pv";

/// The deferred placeholder re-emitted literally during the main pass
const NFS_ADDRESS_TOKEN: &str = "{{NFS_SERVER_IP_ADDRESS}}";

// =============================================================================
// Secret cache
// =============================================================================

/// Memoized base64 encodings, scoped to a single run.
///
/// Scalar values are keyed by parameter key; file contents are keyed by
/// `{path}_contents` so the same certificate referenced from several
/// templates is read and encoded once.
#[derive(Debug, Default)]
pub struct SecretCache {
    encoded: HashMap<String, String>,
}

impl SecretCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Base64 of a scalar value, computed at most once per key
    pub fn encode_value(&mut self, key: &str, value: &str) -> String {
        self.encoded
            .entry(key.to_string())
            .or_insert_with(|| STANDARD.encode(value.as_bytes()))
            .clone()
    }

    /// Base64 of a file's contents, computed at most once per path.
    ///
    /// A missing or unreadable file caches the empty string: optional secret
    /// groups (e.g. logging certs) render as empty without aborting the
    /// whole render when the feature is disabled.
    pub fn encode_file(&mut self, path: &str) -> String {
        self.encode_file_with(path, |p| std::fs::read(p))
    }

    /// [`SecretCache::encode_file`] with an injectable reader, so tests can
    /// count underlying reads.
    pub fn encode_file_with<F>(&mut self, path: &str, read: F) -> String
    where
        F: FnOnce(&Path) -> std::io::Result<Vec<u8>>,
    {
        let cache_key = format!("{path}_contents");
        if let Some(hit) = self.encoded.get(&cache_key) {
            return hit.clone();
        }
        let encoded = match read(Path::new(path)) {
            Ok(bytes) => STANDARD.encode(&bytes),
            Err(_) => String::new(),
        };
        self.encoded.insert(cache_key, encoded.clone());
        encoded
    }
}

// =============================================================================
// Renderer
// =============================================================================

/// Renders every component's manifest templates against a parameter set
pub struct TemplateRenderer<'a> {
    params: &'a ParameterSet,
    cache: SecretCache,
    env: Environment<'static>,
}

impl<'a> TemplateRenderer<'a> {
    /// Create a renderer over a fully resolved parameter set
    pub fn new(params: &'a ParameterSet) -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);
        Self {
            params,
            cache: SecretCache::new(),
            env,
        }
    }

    /// Render every `*.template.yml` under each component's subtree of
    /// `deployment_dir`, in the fixed component order, consuming the
    /// templates.
    pub fn render_all(&mut self, deployment_dir: &Path) -> Result<()> {
        let ctx = self.substitution_context();
        for component in Component::ALL {
            let dir = deployment_dir.join(component.dir());
            if !dir.is_dir() {
                continue;
            }
            for template in collect_templates(&dir)? {
                self.render_file(&template, &ctx)?;
            }
        }
        Ok(())
    }

    /// Render one template file and delete it
    fn render_file(&mut self, template: &Path, ctx: &BTreeMap<&'static str, String>) -> Result<()> {
        let text = std::fs::read_to_string(template)?;
        let rendered = self.env.render_str(&text, ctx)?;
        let destination = rendered_name(template)?;
        debug!(template = %template.display(), "rendering manifest");
        std::fs::write(&destination, rendered)?;
        std::fs::remove_file(template)?;
        Ok(())
    }

    /// The fixed placeholder vocabulary.
    ///
    /// Secret and credential fields are base64-encoded from their text form;
    /// certificate and key files are read as bytes and encoded; sizing and
    /// identity fields pass through plain. The fileserver address is not yet
    /// known and is re-emitted as a literal token.
    fn substitution_context(&mut self) -> BTreeMap<&'static str, String> {
        let p = self.params;
        let mut ctx = BTreeMap::new();

        ctx.insert("CLUSTERNAME", p.get_str(params::KUBERNETES_CLUSTER_NAME));
        ctx.insert(
            "CLUSTER_IDENTIFIER",
            p.get_str(params::KUBERNETES_CLUSTER_NAMESPACE),
        );
        ctx.insert("HOSTNAME", p.get_str(params::HOSTNAME));
        ctx.insert("SHARED_VOLUME_SIZE", p.get_str(params::NFS_VOLUME_SIZE));
        ctx.insert(
            "PHYSICAL_SHARED_VOLUME_SIZE",
            p.get_str(params::VOLUME_SIZE),
        );
        ctx.insert("SHIPPER_NAME", p.get_str(params::LOG_SHIPPER_NAME));
        ctx.insert(
            "RABBITMQ_TARGET_HOST",
            p.get_str(params::RABBITMQ_TARGET_HOST),
        );
        ctx.insert(
            "RABBITMQ_TARGET_VHOST",
            p.get_str(params::RABBITMQ_TARGET_VHOST),
        );

        for (placeholder, key) in [
            ("GITHUB_CLIENT_ID", params::GITHUB_CLIENT_ID),
            ("GITHUB_SECRET", params::GITHUB_CLIENT_SECRET),
            ("GITHUB_OAUTH_CALLBACK_URL", params::GITHUB_CALLBACK_URL),
            (
                "GITHUB_ORGANIZATION_WHITELIST",
                params::GITHUB_ORGANIZATION_WHITELIST,
            ),
            ("SESSION_DB_URL", params::SESSION_DB_URL),
            ("JUPYTERHUB_CRYPTO_KEY", params::CRYPTO_KEY),
            ("DHPARAM_PEM", params::DHPARAMS),
            ("FIREFLY_ADMIN_PASSWORD", params::FIREFLY_ADMIN_PASSWORD),
            ("RABBITMQ_PAN_PASSWORD", params::RABBITMQ_PAN_PASSWORD),
        ] {
            let value = p.get_str(key);
            ctx.insert(placeholder, self.cache.encode_value(key, &value));
        }

        for (placeholder, key) in [
            ("TLS_CRT", params::TLS_CERT),
            ("TLS_KEY", params::TLS_KEY),
            ("ROOT_CHAIN_PEM", params::TLS_ROOT_CHAIN),
            ("CA_CERTIFICATE", params::BEATS_CA),
            ("BEATS_CERTIFICATE", params::BEATS_CERT),
            ("BEATS_KEY", params::BEATS_KEY),
        ] {
            let path = p.get_str(key);
            ctx.insert(placeholder, self.cache.encode_file(&path));
        }

        ctx.insert("NFS_SERVER_IP_ADDRESS", NFS_ADDRESS_TOKEN.to_string());
        ctx
    }
}

/// Rename the fileserver PV manifest back to a template.
///
/// The main pass re-emitted its address placeholder literally; restoring the
/// template suffix marks it for the narrow pass that runs once the
/// fileserver's address is discovered.
pub fn rename_fileserver_template(deployment_dir: &Path) -> Result<()> {
    let dir = deployment_dir.join(Component::Fileserver.dir());
    std::fs::rename(
        dir.join(format!("{FILESERVER_PV_BASE}.yml")),
        dir.join(format!("{FILESERVER_PV_BASE}{TEMPLATE_SUFFIX}")),
    )?;
    Ok(())
}

/// The narrow second pass: fill in the discovered fileserver address and
/// write the namespace-qualified PV manifest. The template is retained.
pub fn render_fileserver_pv(deployment_dir: &Path, ip: &str, namespace: &str) -> Result<PathBuf> {
    let dir = deployment_dir.join(Component::Fileserver.dir());
    let template = dir.join(format!("{FILESERVER_PV_BASE}{TEMPLATE_SUFFIX}"));
    let text = std::fs::read_to_string(&template)?;

    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_keep_trailing_newline(true);
    let mut ctx = BTreeMap::new();
    ctx.insert("NFS_SERVER_IP_ADDRESS", ip.to_string());
    let rendered = env.render_str(&text, &ctx)?;

    let destination = dir.join(format!("{FILESERVER_PV_BASE}-{namespace}.yml"));
    std::fs::write(&destination, rendered)?;
    Ok(destination)
}

/// All template files under `dir`, recursively, in a stable order
fn collect_templates(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    walk(dir, &mut found)?;
    found.sort();
    Ok(found)
}

fn walk(dir: &Path, found: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            walk(&path, found)?;
        } else if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(TEMPLATE_SUFFIX))
        {
            found.push(path);
        }
    }
    Ok(())
}

/// `foo.template.yml` → `foo.yml`
fn rendered_name(template: &Path) -> Result<PathBuf> {
    let name = template
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_suffix(TEMPLATE_SUFFIX))
        .ok_or_else(|| {
            Error::invalid_config(format!(
                "not a template file name: {}",
                template.display()
            ))
        })?;
    Ok(template.with_file_name(format!("{name}.yml")))
}
