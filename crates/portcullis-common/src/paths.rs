//! Standard filesystem paths for portcullis.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default root directory for portcullis state.
pub static PORTCULLIS_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("PORTCULLIS_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/portcullis"))
});

/// Directory where named network namespaces live.
pub const NETNS_DIR: &str = "/var/run/netns";

/// Per-namespace configuration overlaid by `ip netns exec`.
pub const NETNS_CONFIG_DIR: &str = "/etc/netns";

/// Standard paths used by portcullis.
#[derive(Debug, Clone)]
pub struct PortcullisPaths {
    /// Root state directory (default: /var/lib/portcullis).
    pub root: PathBuf,
    /// Named network namespace directory (default: /var/run/netns).
    pub netns: PathBuf,
    /// Per-namespace configuration directory (default: /etc/netns).
    pub netns_config: PathBuf,
}

impl PortcullisPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            netns: PathBuf::from(NETNS_DIR),
            netns_config: PathBuf::from(NETNS_CONFIG_DIR),
        }
    }

    /// Use a different network namespace directory.
    #[must_use]
    pub fn with_netns_dir(mut self, netns: impl Into<PathBuf>) -> Self {
        self.netns = netns.into();
        self
    }

    /// Use a different per-namespace configuration directory.
    #[must_use]
    pub fn with_netns_config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.netns_config = dir.into();
        self
    }

    /// Host port allocation state.
    #[must_use]
    pub fn port_pool(&self) -> PathBuf {
        self.root.join("ports.json")
    }

    /// Endpoint records kept by the host control plane.
    #[must_use]
    pub fn endpoints(&self) -> PathBuf {
        self.root.join("endpoints.json")
    }

    /// Named network namespace of a container.
    #[must_use]
    pub fn container_netns(&self, id: &str) -> PathBuf {
        self.netns.join(id)
    }

    /// Resolver configuration seen by commands run in a container's namespace.
    #[must_use]
    pub fn container_resolv_conf(&self, id: &str) -> PathBuf {
        self.netns_config.join(id).join("resolv.conf")
    }

    /// Ensure the state root exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)
    }
}

impl Default for PortcullisPaths {
    fn default() -> Self {
        Self::with_root(PORTCULLIS_ROOT.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_files_live_under_root() {
        let paths = PortcullisPaths::with_root("/tmp/pcl");
        assert_eq!(paths.port_pool(), PathBuf::from("/tmp/pcl/ports.json"));
        assert_eq!(paths.endpoints(), PathBuf::from("/tmp/pcl/endpoints.json"));
    }

    #[test]
    fn container_netns_path() {
        let paths = PortcullisPaths::with_root("/tmp/pcl").with_netns_dir("/tmp/netns");
        assert_eq!(
            paths.container_netns("abc"),
            PathBuf::from("/tmp/netns/abc")
        );
        assert_eq!(
            paths.container_resolv_conf("abc"),
            PathBuf::from("/etc/netns/abc/resolv.conf")
        );
    }
}
