//! Locating the transport binary

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Architecture subdirectory for the running target, if one is shipped
pub fn current_arch() -> Option<&'static str> {
    match std::env::consts::ARCH {
        "x86_64" => Some("x86_64"),
        "x86" => Some("x86"),
        "aarch64" => Some("aarch64"),
        "arm" => Some("arm"),
        _ => None,
    }
}

/// Find an executable transport binary
///
/// `<bin_dir>/<arch>/<name>` is preferred; `<bin_dir>/<name>` is the
/// fallback. `arch` overrides the detected architecture.
pub fn resolve_binary(bin_dir: &Path, name: &str, arch: Option<&str>) -> Result<PathBuf> {
    let arch = match arch {
        Some(arch) => Some(arch),
        None => current_arch(),
    };

    let mut candidates = Vec::with_capacity(2);
    if let Some(arch) = arch {
        candidates.push(bin_dir.join(arch).join(name));
    }
    candidates.push(bin_dir.join(name));

    for candidate in &candidates {
        match std::fs::metadata(candidate) {
            Ok(meta) if meta.is_file() => {
                if is_executable(&meta) {
                    log::debug!("Using transport binary {}", candidate.display());
                    return Ok(candidate.clone());
                }
                return Err(Error::TransportInstallFailed(format!(
                    "{} is not executable",
                    candidate.display()
                )));
            }
            _ => continue,
        }
    }

    let searched: Vec<String> = candidates.iter().map(|p| p.display().to_string()).collect();
    match arch {
        Some(_) => Err(Error::TransportInstallFailed(format!(
            "{} not found (searched {})",
            name,
            searched.join(", ")
        ))),
        None => Err(Error::TransportInstallFailed(format!(
            "no {} build for architecture {} and none at {}",
            name,
            std::env::consts::ARCH,
            searched.join(", ")
        ))),
    }
}

#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &std::fs::Metadata) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn install(path: &Path, mode: u32) {
        use std::os::unix::fs::PermissionsExt;
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).unwrap();
    }

    #[test]
    fn test_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_binary(dir.path(), "piedispatcher", Some("arm")).unwrap_err();
        assert!(matches!(err, Error::TransportInstallFailed(_)));
    }

    #[test]
    #[cfg(unix)]
    fn test_arch_directory_preferred() {
        let dir = tempfile::tempdir().unwrap();
        install(&dir.path().join("piedispatcher"), 0o755);
        install(&dir.path().join("arm").join("piedispatcher"), 0o755);

        let path = resolve_binary(dir.path(), "piedispatcher", Some("arm")).unwrap();
        assert_eq!(path, dir.path().join("arm").join("piedispatcher"));

        let path = resolve_binary(dir.path(), "piedispatcher", Some("x86")).unwrap();
        assert_eq!(path, dir.path().join("piedispatcher"));
    }

    #[test]
    #[cfg(unix)]
    fn test_arch_from_configuration_string() {
        let dir = tempfile::tempdir().unwrap();
        install(&dir.path().join("aarch64").join("piedispatcher"), 0o755);

        let configured = String::from("aarch64");
        let path = resolve_binary(dir.path(), "piedispatcher", Some(configured.as_str())).unwrap();
        assert_eq!(path, dir.path().join("aarch64").join("piedispatcher"));
    }

    #[test]
    #[cfg(unix)]
    fn test_not_executable() {
        let dir = tempfile::tempdir().unwrap();
        install(&dir.path().join("piedispatcher"), 0o644);

        let err = resolve_binary(dir.path(), "piedispatcher", None).unwrap_err();
        assert!(err.to_string().contains("not executable"));
    }
}
