//! Template repository checkout
//!
//! The manifest templates live in a git repository, one directory per
//! component with the Kubernetes material under a `kubernetes/` subdirectory.
//! Fetching clones the repository into the working directory, copies each
//! component's `kubernetes/` subtree into `deployment/<component>/`, and
//! removes the clone. Only `deployment/` is consumed afterwards.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::components::Component;
use crate::error::Error;
use crate::runner::{argv, CommandRunner, RunOpts};
use crate::Result;

/// Name of the assembled manifest directory under the working directory
pub const DEPLOYMENT_DIR: &str = "deployment";

/// Clone `repo_url` and assemble `workdir/deployment/` from it.
///
/// Returns the path of the assembled deployment directory.
pub fn fetch(workdir: &Path, runner: &dyn CommandRunner, repo_url: &str) -> Result<PathBuf> {
    info!(repo = %repo_url, "fetching manifest templates");
    runner.run(
        &argv(&["git", "clone", repo_url]),
        &RunOpts::checked().in_dir(workdir),
    )?;
    let clone = workdir.join(clone_dir_name(repo_url)?);

    let deployment = workdir.join(DEPLOYMENT_DIR);
    std::fs::create_dir_all(&deployment)?;
    for component in Component::ALL {
        let source = clone.join(component.dir()).join("kubernetes");
        if !source.is_dir() {
            return Err(Error::invalid_config(format!(
                "template repository has no '{}/kubernetes' directory",
                component.dir()
            )));
        }
        debug!(component = component.dir(), "copying manifest templates");
        copy_tree(&source, &deployment.join(component.dir()))?;
    }

    std::fs::remove_dir_all(&clone)?;
    Ok(deployment)
}

/// Directory name `git clone` will create for a repository URL
fn clone_dir_name(repo_url: &str) -> Result<&str> {
    repo_url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .map(|last| last.strip_suffix(".git").unwrap_or(last))
        .filter(|name| !name.is_empty())
        .ok_or_else(|| Error::invalid_config(format!("unusable repository url '{repo_url}'")))
}

fn copy_tree(source: &Path, destination: &Path) -> Result<()> {
    std::fs::create_dir_all(destination)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let target = destination.join(entry.file_name());
        if entry.path().is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
