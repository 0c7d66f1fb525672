use std::os::unix::prelude::{MetadataExt, PermissionsExt};
use std::path::Path;

use crate::OpsgateError;

fn maybe_apply_permissions<P: AsRef<Path>>(
    path: P,
    permissions: std::fs::Permissions,
) -> std::io::Result<()> {
    let current = std::fs::metadata(&path)?.permissions();
    if (current.mode() & 0o777) != permissions.mode() {
        std::fs::set_permissions(path, permissions)?;
    }
    Ok(())
}

pub fn secure_directory<P: AsRef<Path>>(path: P) -> std::io::Result<()> {
    maybe_apply_permissions(path.as_ref(), std::fs::Permissions::from_mode(0o700))
}

pub fn secure_file<P: AsRef<Path>>(path: P) -> std::io::Result<()> {
    maybe_apply_permissions(path.as_ref(), std::fs::Permissions::from_mode(0o600))
}

/// Checks that a trust-anchor file is safe to load: mode 0400, owned by
/// root:root, inside a root-owned directory.
pub fn validate_trust_anchor<P: AsRef<Path>>(path: P) -> Result<(), OpsgateError> {
    let path = path.as_ref();
    let meta = std::fs::metadata(path)?;

    let insecure = |reason: &str| OpsgateError::InsecureFile {
        path: path.to_owned(),
        reason: reason.to_owned(),
    };

    if (meta.permissions().mode() & 0o777) != 0o400 {
        return Err(insecure("mode must be 0400"));
    }
    if meta.uid() != 0 || meta.gid() != 0 {
        return Err(insecure("must be owned by root:root"));
    }

    if let Some(parent) = path.parent() {
        let parent_meta = std::fs::metadata(parent)?;
        if parent_meta.uid() != 0 || parent_meta.gid() != 0 {
            return Err(insecure("parent directory must be owned by root:root"));
        }
    }

    Ok(())
}
