//! Scoped access to one host directory.
//!
//! Guest paths are always relative to the configured root. Absolute paths,
//! traversal out of the root and symlinks resolving outside it are refused.
//! The module reserves its byte quota with the Core at install time and keeps
//! the directory's total size under that quota on every write.

use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Deserialize;
use tracing::{debug, warn};

use super::{str_arg, Binding, BindingError, InstallContext, InstallError};
use crate::engine::Value;
use crate::ledger::QuotaError;
use crate::types::ResourceKind;

const MODULE: &str = "filesystem";

/// Options for the filesystem module.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FilesystemOptions {
    /// Host directory exposed to the guest.
    pub root: PathBuf,
    /// Maximum bytes stored under the root.
    #[serde(default = "default_quota_bytes")]
    pub quota_bytes: u64,
    /// Expose only read operations.
    #[serde(default)]
    pub read_only: bool,
}

fn default_quota_bytes() -> u64 {
    1_048_576
}

/// Resolve a guest path below `root`, refusing anything that escapes it.
///
/// # Errors
///
/// Returns [`BindingError::Denied`] for absolute paths, traversal past the
/// root, and symlinks that point outside it or dangle.
#[doc(hidden)]
pub fn resolve_guest_path(root: &Path, requested: &str) -> Result<PathBuf, BindingError> {
    let requested_path = Path::new(requested);
    if requested_path.is_absolute() {
        return Err(BindingError::Denied(format!(
            "absolute path '{requested}' is not allowed"
        )));
    }

    let mut depth: usize = 0;
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in requested_path.components() {
        match component {
            Component::Normal(part) => {
                parts.push(part);
                depth = depth.saturating_add(1);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return Err(BindingError::Denied(format!(
                        "path '{requested}' escapes the sandbox root"
                    )));
                }
                parts.pop();
                depth = depth.saturating_sub(1);
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(BindingError::Denied(format!(
                    "path '{requested}' is not relative"
                )));
            }
        }
    }

    // Symlinks can still point outside. Walk the existing prefix without
    // following links; a link must resolve, and resolve inside the root.
    let canonical_root = root.canonicalize()?;
    let mut resolved = root.to_path_buf();
    let mut existing = true;
    for part in parts {
        resolved.push(part);
        if !existing {
            continue;
        }
        match std::fs::symlink_metadata(&resolved) {
            Ok(meta) if meta.file_type().is_symlink() => match resolved.canonicalize() {
                Ok(target) if target.starts_with(&canonical_root) => {}
                _ => {
                    return Err(BindingError::Denied(format!(
                        "path '{requested}' resolves outside the sandbox root"
                    )))
                }
            },
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => existing = false,
            Err(e) => return Err(e.into()),
        }
    }

    Ok(resolved)
}

fn lock_usage(usage: &Mutex<u64>) -> MutexGuard<'_, u64> {
    // The counter is a single integer; a panic elsewhere cannot tear it.
    usage.lock().unwrap_or_else(|poisoned| {
        warn!("filesystem usage lock poisoned, recovering");
        poisoned.into_inner()
    })
}

/// Total size in bytes of regular files below `path`.
fn dir_size(path: &Path) -> std::io::Result<u64> {
    let mut total: u64 = 0;
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_dir() {
            total = total.saturating_add(dir_size(&entry.path())?);
        } else if meta.is_file() {
            total = total.saturating_add(meta.len());
        }
    }
    Ok(total)
}

fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path)
        .ok()
        .filter(|m| m.is_file())
        .map_or(0, |m| m.len())
}

/// Install the filesystem bindings.
///
/// # Errors
///
/// Returns [`InstallError::MissingResource`] if the root is not a directory,
/// [`InstallError::Incompatible`] if it already holds more than the quota, and
/// [`InstallError::Quota`] if the Core refuses the byte reservation.
pub fn install(
    ctx: &mut InstallContext<'_>,
    opts: &FilesystemOptions,
) -> Result<Vec<Binding>, InstallError> {
    if !opts.root.is_dir() {
        return Err(InstallError::MissingResource(format!(
            "filesystem root {} is not a directory",
            opts.root.display()
        )));
    }
    let existing = dir_size(&opts.root).map_err(|e| {
        InstallError::MissingResource(format!("cannot scan {}: {e}", opts.root.display()))
    })?;
    if existing > opts.quota_bytes {
        return Err(InstallError::Incompatible(format!(
            "{} already holds {existing} bytes, quota is {}",
            opts.root.display(),
            opts.quota_bytes
        )));
    }
    ctx.reserve(ResourceKind::StorageBytes, opts.quota_bytes)?;
    debug!(kernel = %ctx.kernel_id(), root = %opts.root.display(), existing, "filesystem installed");

    let root = Arc::new(opts.root.clone());
    let usage = Arc::new(Mutex::new(existing));
    let quota = opts.quota_bytes;

    let mut bindings = Vec::new();

    let r = Arc::clone(&root);
    bindings.push(Binding::function(MODULE, "fs.read", move |args| {
        let path = resolve_guest_path(&r, str_arg(args, 0, "path")?)?;
        Ok(Value::String(std::fs::read_to_string(path)?))
    }));

    let r = Arc::clone(&root);
    bindings.push(Binding::function(MODULE, "fs.exists", move |args| {
        let path = resolve_guest_path(&r, str_arg(args, 0, "path")?)?;
        Ok(Value::Bool(path.exists()))
    }));

    let r = Arc::clone(&root);
    bindings.push(Binding::function(MODULE, "fs.list", move |args| {
        let dir = match args.first().and_then(Value::as_str) {
            Some(p) => resolve_guest_path(&r, p)?,
            None => r.as_ref().clone(),
        };
        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(Value::from(names))
    }));

    if opts.read_only {
        return Ok(bindings);
    }

    let r = Arc::clone(&root);
    let u = Arc::clone(&usage);
    bindings.push(Binding::function(MODULE, "fs.write", move |args| {
        let path = resolve_guest_path(&r, str_arg(args, 0, "path")?)?;
        let contents = str_arg(args, 1, "contents")?;
        let new_len = u64::try_from(contents.len()).unwrap_or(u64::MAX);
        let mut used = lock_usage(&u);
        let without_old = used.saturating_sub(file_len(&path));
        let projected = without_old.saturating_add(new_len);
        if projected > quota {
            return Err(BindingError::Quota(QuotaError::Exceeded {
                kind: ResourceKind::StorageBytes,
                requested: new_len,
                available: quota.saturating_sub(without_old),
            }));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, contents)?;
        *used = projected;
        Ok(Value::from(new_len))
    }));

    let r = Arc::clone(&root);
    let u = Arc::clone(&usage);
    bindings.push(Binding::function(MODULE, "fs.remove", move |args| {
        let path = resolve_guest_path(&r, str_arg(args, 0, "path")?)?;
        if !path.is_file() {
            return Ok(Value::Bool(false));
        }
        let len = file_len(&path);
        std::fs::remove_file(&path)?;
        let mut used = lock_usage(&u);
        *used = used.saturating_sub(len);
        Ok(Value::Bool(true))
    }));

    Ok(bindings)
}
