//! CA bundle discovery for TLS peer verification.

use std::path::{Path, PathBuf};

/// Well-known CA bundle locations, probed in order. The bare file name
/// covers deployments that ship a bundle next to the binary.
const CA_BUNDLE_CANDIDATES: &[&str] = &[
    "ca-bundle.crt",
    "/etc/ssl/certs/ca-certificates.crt",
    "/etc/pki/tls/certs/ca-bundle.crt",
    "/etc/ssl/ca-bundle.pem",
    "/etc/ssl/cert.pem",
];

/// Resolve the CA bundle to verify peers against.
///
/// An explicit override wins when it exists on disk; otherwise the
/// well-known locations are probed. Returns `None` when nothing is found,
/// in which case the transfer library falls back to its build-time default.
pub(crate) fn discover_ca_bundle(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Some(path.to_path_buf());
        }
        tracing::warn!(path = %path.display(), "configured CA bundle not found, probing defaults");
    }
    CA_BUNDLE_CANDIDATES
        .iter()
        .map(Path::new)
        .find(|path| path.is_file())
        .map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn explicit_override_wins_when_present() {
        let dir = std::env::temp_dir().join("tidepool-ca-test");
        std::fs::create_dir_all(&dir).unwrap();
        let bundle = dir.join("bundle.crt");
        let mut file = std::fs::File::create(&bundle).unwrap();
        file.write_all(b"-----BEGIN CERTIFICATE-----\n").unwrap();

        assert_eq!(discover_ca_bundle(Some(&bundle)), Some(bundle.clone()));
        std::fs::remove_file(&bundle).unwrap();
    }

    #[test]
    fn missing_override_falls_back_to_probe() {
        let ghost = Path::new("/nonexistent/tidepool/bundle.crt");
        let probed = discover_ca_bundle(Some(ghost));
        // Whatever the host has (or not), the ghost path must not be it.
        assert_ne!(probed.as_deref(), Some(ghost));
    }
}
