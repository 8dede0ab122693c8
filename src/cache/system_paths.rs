//! System-path predicate (spec §4.4): the configurable set of prefix globs
//! whose contents are assumed immutable for the life of a session and are
//! therefore eligible for persistent metadata caching.

use std::path::Path;

/// Defaults from spec §4.4: `/bin`, `/sbin`, `/lib`, `/lib64`, `/usr`,
/// `/opt`, `/etc/ld.so.*`.
pub fn default_prefixes() -> Vec<String> {
    vec![
        "/bin".to_string(),
        "/sbin".to_string(),
        "/lib".to_string(),
        "/lib64".to_string(),
        "/usr".to_string(),
        "/opt".to_string(),
        "/etc/ld.so.".to_string(),
    ]
}

/// Evaluates the configured prefix list against an L-absolute path.
///
/// A "prefix glob" here is a plain path prefix, except that an entry ending
/// in `.` (the `/etc/ld.so.` default, standing in for `/etc/ld.so.conf` and
/// `/etc/ld.so.cache`) matches anything starting with that literal string,
/// not just a path-component boundary.
pub struct SystemPaths {
    prefixes: Vec<String>,
}

impl SystemPaths {
    pub fn new(prefixes: Vec<String>) -> Self {
        SystemPaths { prefixes }
    }

    pub fn is_system_path(&self, path: &Path) -> bool {
        let s = path.to_string_lossy();
        self.prefixes.iter().any(|prefix| {
            if prefix.ends_with('.') {
                s.starts_with(prefix.as_str())
            } else {
                s.as_ref() == prefix.as_str() || s.starts_with(&format!("{prefix}/"))
            }
        })
    }
}

impl Default for SystemPaths {
    fn default() -> Self {
        SystemPaths::new(default_prefixes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn matches_conventional_defaults() {
        let sp = SystemPaths::default();
        assert!(sp.is_system_path(&PathBuf::from("/usr/bin/ffmpeg")));
        assert!(sp.is_system_path(&PathBuf::from("/lib64/ld-linux-x86-64.so.2")));
        assert!(sp.is_system_path(&PathBuf::from("/etc/ld.so.conf")));
        assert!(sp.is_system_path(&PathBuf::from("/etc/ld.so.cache")));
        assert!(!sp.is_system_path(&PathBuf::from("/home/user/videos/input.mp4")));
        assert!(!sp.is_system_path(&PathBuf::from("/etc/passwd")));
    }

    #[test]
    fn does_not_match_unrelated_prefix_overlap() {
        let sp = SystemPaths::default();
        // /libexec is not /lib, even though it shares a string prefix.
        assert!(!sp.is_system_path(&PathBuf::from("/libexec/foo")));
    }
}
