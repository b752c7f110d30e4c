//! Writing kubeconfig files back to disk

use std::path::Path;

use tracing::{debug, info};

use super::{CustomObject, HEADLAMP_INFO_EXTENSION, Kubeconfig, NamedExtension, load_bytes};
use crate::{Error, Result};

/// Write `config` to `path`, creating parent directories; mode 0600 on unix
pub fn save(config: &Kubeconfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut out = config.clone();
    if out.api_version.is_none() {
        out.api_version = Some("v1".to_string());
    }
    if out.kind.is_none() {
        out.kind = Some("Config".to_string());
    }
    let yaml = serde_yaml::to_string(&out)?;
    std::fs::write(path, yaml)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    debug!(path = %path.display(), "Kubeconfig written");
    Ok(())
}

/// Read `path`, or an empty config when it does not exist yet
fn load_or_default(path: &Path) -> Result<Kubeconfig> {
    match std::fs::read(path) {
        Ok(bytes) => load_bytes(&bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Kubeconfig::default()),
        Err(e) => Err(Error::Kubeconfig(format!("reading {}: {e}", path.display()))),
    }
}

/// Merge the clusters, users and contexts of `config` into the file at `path`
///
/// Entries with the same name are replaced.
pub fn write_merged(config: &Kubeconfig, path: &Path) -> Result<()> {
    let mut existing = load_or_default(path)?;

    for cluster in &config.clusters {
        existing.clusters.retain(|c| c.name != cluster.name);
        existing.clusters.push(cluster.clone());
    }
    for user in &config.users {
        existing.users.retain(|u| u.name != user.name);
        existing.users.push(user.clone());
    }
    for context in &config.contexts {
        existing.contexts.retain(|c| c.name != context.name);
        existing.contexts.push(context.clone());
    }
    if existing.current_context.is_empty() {
        existing.current_context.clone_from(&config.current_context);
    }

    save(&existing, path)?;
    info!(
        path = %path.display(),
        contexts = config.contexts.len(),
        "Merged kubeconfig into file"
    );
    Ok(())
}

/// Remove context `name` from the file at `path`
///
/// Clusters and users no other context references are dropped with it.
pub fn remove_context(name: &str, path: &Path) -> Result<()> {
    let mut config = load_or_default(path)?;

    let before = config.contexts.len();
    config.contexts.retain(|c| c.name != name);
    if config.contexts.len() == before {
        return Err(Error::Kubeconfig(format!(
            "context {name} not found in {}",
            path.display()
        )));
    }

    let contexts = config.contexts.clone();
    config
        .clusters
        .retain(|c| contexts.iter().any(|ctx| ctx.context.cluster == c.name));
    config
        .users
        .retain(|u| contexts.iter().any(|ctx| ctx.context.user == u.name));
    if config.current_context == name {
        config.current_context.clear();
    }

    save(&config, path)?;
    info!(context = %name, path = %path.display(), "Removed context from kubeconfig");
    Ok(())
}

/// Store `new_name` as the custom display name of `context_name` and write
/// the config to `path`
pub fn set_custom_name(
    config: &mut Kubeconfig,
    context_name: &str,
    new_name: &str,
    path: &Path,
) -> Result<()> {
    let named = config
        .contexts
        .iter_mut()
        .find(|c| c.name == context_name)
        .ok_or_else(|| {
            Error::Kubeconfig(format!("context {context_name} not found in kubeconfig"))
        })?;

    let extension = serde_json::to_value(CustomObject {
        custom_name: new_name.to_string(),
    })?;
    named
        .context
        .extensions
        .retain(|e| e.name != HEADLAMP_INFO_EXTENSION);
    named.context.extensions.push(NamedExtension {
        name: HEADLAMP_INFO_EXTENSION.to_string(),
        extension,
    });

    save(config, path)
}

/// Whether `new_name` is free among every context name and custom name
pub fn check_unique_name(config: &Kubeconfig, new_name: &str) -> bool {
    !config.contexts.iter().any(|c| {
        c.name == new_name || c.context.custom_name().is_some_and(|n| n == new_name)
    })
}

/// Context key whose custom name is `cluster_name`, else `cluster_name` itself
pub fn find_matching_context_name(config: &Kubeconfig, cluster_name: &str) -> String {
    config
        .contexts
        .iter()
        .find(|c| c.context.custom_name().is_some_and(|n| n == cluster_name))
        .map_or_else(|| cluster_name.to_string(), |c| c.name.clone())
}
