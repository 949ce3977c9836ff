//! Content-store socket discovery.

use std::path::{Path, PathBuf};
use std::time::Duration;

use flarewrap_common::{FlarewrapError, FlarewrapResult};
use tokio::net::UnixStream;

/// Environment variable that overrides the well-known socket paths.
pub const ADDRESS_ENV: &str = "CONTAINERD_ADDRESS";

/// Well-known containerd socket paths, most common first.
pub const WELL_KNOWN_SOCKETS: &[&str] = &[
    "/run/containerd/containerd.sock",
    "/var/run/containerd/containerd.sock",
    "/tmp/containerd.sock",
];

/// Default connect timeout for a probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Candidate socket paths in the order they are tried.
///
/// A configured address comes first, then [`ADDRESS_ENV`], then the
/// well-known paths.
#[must_use]
pub fn candidates(configured: Option<&Path>, env: Option<&str>) -> Vec<PathBuf> {
    let mut paths = Vec::with_capacity(WELL_KNOWN_SOCKETS.len() + 2);
    if let Some(path) = configured {
        paths.push(path.to_path_buf());
    }
    if let Some(env) = env.filter(|e| !e.is_empty()) {
        paths.push(PathBuf::from(env.strip_prefix("unix://").unwrap_or(env)));
    }
    for path in WELL_KNOWN_SOCKETS {
        let path = PathBuf::from(path);
        if !paths.contains(&path) {
            paths.push(path);
        }
    }
    paths
}

/// Check that something accepts connections on `path` within `timeout`.
///
/// # Errors
///
/// Returns [`FlarewrapError::Connection`] if the socket is missing,
/// refuses the connection, or does not answer in time.
pub async fn probe_socket(path: &Path, timeout: Duration) -> FlarewrapResult<()> {
    let failed = |message: String| FlarewrapError::Connection {
        address: path.display().to_string(),
        message,
    };

    if !path.exists() {
        return Err(failed("socket file does not exist".to_string()));
    }

    match tokio::time::timeout(timeout, UnixStream::connect(path)).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(e)) => Err(failed(e.to_string())),
        Err(_) => Err(failed(format!("no answer within {timeout:?}"))),
    }
}

/// Find a reachable content-store socket.
///
/// # Errors
///
/// Returns [`FlarewrapError::Precondition`] naming every path tried.
pub async fn discover_socket(configured: Option<&Path>, timeout: Duration) -> FlarewrapResult<PathBuf> {
    let env = std::env::var(ADDRESS_ENV).ok();
    let mut tried = Vec::new();

    for path in candidates(configured, env.as_deref()) {
        match probe_socket(&path, timeout).await {
            Ok(()) => {
                tracing::debug!(socket = %path.display(), "Found content store socket");
                return Ok(path);
            }
            Err(e) => {
                tracing::debug!(socket = %path.display(), error = %e, "Socket probe failed");
                tried.push(path.display().to_string());
            }
        }
    }

    Err(FlarewrapError::Precondition {
        what: "containerd socket".to_string(),
        message: format!("none reachable, tried {}", tried.join(", ")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    #[test]
    fn candidate_order() {
        let paths = candidates(
            Some(Path::new("/cfg.sock")),
            Some("unix:///env.sock"),
        );
        assert_eq!(paths[0], PathBuf::from("/cfg.sock"));
        assert_eq!(paths[1], PathBuf::from("/env.sock"));
        assert_eq!(paths[2], PathBuf::from(WELL_KNOWN_SOCKETS[0]));
        assert_eq!(paths.len(), 5);
    }

    #[test]
    fn well_known_paths_are_not_repeated() {
        let paths = candidates(None, Some(WELL_KNOWN_SOCKETS[1]));
        assert_eq!(paths.len(), WELL_KNOWN_SOCKETS.len());
        assert_eq!(paths[0], PathBuf::from(WELL_KNOWN_SOCKETS[1]));
    }

    #[tokio::test]
    async fn probe_accepts_listening_socket() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("cs.sock");
        let _listener = UnixListener::bind(&path).unwrap();

        probe_socket(&path, DEFAULT_PROBE_TIMEOUT).await.unwrap();
        let found = discover_socket(Some(&path), DEFAULT_PROBE_TIMEOUT).await.unwrap();
        assert_eq!(found, path);
    }

    #[tokio::test]
    async fn probe_rejects_missing_and_stale_sockets() {
        let temp = tempfile::tempdir().unwrap();
        let missing = temp.path().join("missing.sock");
        assert!(matches!(
            probe_socket(&missing, DEFAULT_PROBE_TIMEOUT).await,
            Err(FlarewrapError::Connection { .. })
        ));

        let stale = temp.path().join("stale.sock");
        drop(UnixListener::bind(&stale).unwrap());
        assert!(probe_socket(&stale, DEFAULT_PROBE_TIMEOUT).await.is_err());
    }
}
