use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use system_utils::path::{find_executable, is_executable};

/// Finds the agent executable. An explicit override wins when it points at
/// an executable; otherwise the well-known locations are tried in order and
/// the first hit is used.
pub(crate) fn locate_binary(
    override_path: Option<&Path>,
    binary_name: &str,
    home: Option<&Path>,
    search_path: Option<&OsStr>,
) -> Option<PathBuf> {
    if let Some(path) = override_path {
        if is_executable(path) {
            return Some(path.to_path_buf());
        }
        tracing::warn!(
            path = %path.display(),
            "configured agent binary is not executable, searching defaults"
        );
    }
    candidate_paths(binary_name, home)
        .into_iter()
        .find_map(|candidate| find_executable(&candidate, search_path))
}

pub(crate) fn candidate_paths(binary_name: &str, home: Option<&Path>) -> Vec<PathBuf> {
    let mut candidates = vec![PathBuf::from(binary_name)];
    if let Some(home) = home {
        candidates.push(home.join(".local").join("bin").join(binary_name));
        candidates.push(home.join(binary_name).join("app").join(binary_name));
    }
    if cfg!(target_os = "linux") {
        for dir in ["/usr/local/bin", "/usr/bin", "/snap/bin"] {
            candidates.push(Path::new(dir).join(binary_name));
        }
    } else if cfg!(target_os = "macos") {
        for dir in ["/usr/local/bin", "/opt/homebrew/bin"] {
            candidates.push(Path::new(dir).join(binary_name));
        }
    } else if cfg!(windows) {
        candidates.push(
            Path::new(r"C:\Program Files")
                .join(binary_name)
                .join(format!("{binary_name}.exe")),
        );
        if let Some(home) = home {
            candidates.push(
                home.join("AppData")
                    .join("Roaming")
                    .join("npm")
                    .join(format!("{binary_name}.cmd")),
            );
        }
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_lookup_comes_before_home_locations() {
        let home = Path::new("/home/claw");
        let candidates = candidate_paths("openclaw", Some(home));
        assert_eq!(candidates[0], PathBuf::from("openclaw"));
        assert_eq!(candidates[1], home.join(".local/bin/openclaw"));
        assert_eq!(candidates[2], home.join("openclaw/app/openclaw"));
        #[cfg(target_os = "linux")]
        assert_eq!(
            &candidates[3..],
            &[
                PathBuf::from("/usr/local/bin/openclaw"),
                PathBuf::from("/usr/bin/openclaw"),
                PathBuf::from("/snap/bin/openclaw"),
            ]
        );
    }

    #[test]
    fn missing_everywhere_yields_none() {
        let found = locate_binary(
            Some(Path::new("/nonexistent/clawpanel/agent")),
            "clawpanel-test-missing-agent",
            None,
            Some(OsStr::new("/nonexistent/bin")),
        );
        assert!(found.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn home_location_is_found_when_not_on_path() {
        use std::os::unix::fs::PermissionsExt;
        let home = crate::test_utils::temp_dir("clawpanel-locate");
        let bin_dir = home.join(".local/bin");
        std::fs::create_dir_all(&bin_dir).expect("dir");
        let bin = bin_dir.join("agent-x");
        std::fs::write(&bin, "#!/bin/sh\n").expect("write");
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).expect("chmod");

        let found = locate_binary(None, "agent-x", Some(&home), Some(OsStr::new("")));
        assert_eq!(found, Some(bin.clone()));
        let found = locate_binary(Some(&bin), "other", None, None);
        assert_eq!(found, Some(bin));
        std::fs::remove_dir_all(&home).ok();
    }
}
