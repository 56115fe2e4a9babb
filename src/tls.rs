//! Self-signed certificates for apps that have none yet

use crate::proxy::ProxyConfigError;
use crate::settings;
use rcgen::{generate_simple_self_signed, CertifiedKey};
use std::path::{Path, PathBuf};
use tracing::info;

/// Certificate and key locations for an app under the nginx root
pub fn certificate_paths(nginx_root: &Path, app: &str) -> (PathBuf, PathBuf) {
    (
        nginx_root.join(format!("{}.crt", app)),
        nginx_root.join(format!("{}.key", app)),
    )
}

/// Host names a generated certificate was issued for. Certificates without
/// this file were installed by the operator.
pub fn issued_names_path(nginx_root: &Path, app: &str) -> PathBuf {
    nginx_root.join(format!("{}.names", app))
}

/// Write a self-signed certificate for `server_names` unless the app already
/// has one for them. Returns true if a certificate was generated.
pub fn ensure_self_signed(
    nginx_root: &Path,
    app: &str,
    server_names: &[String],
) -> Result<bool, ProxyConfigError> {
    let (cert_path, key_path) = certificate_paths(nginx_root, app);
    let names_path = issued_names_path(nginx_root, app);
    let wanted = render_names(server_names);
    if cert_path.exists() && key_path.exists() {
        match std::fs::read_to_string(&names_path) {
            Ok(issued) if issued != wanted => {
                info!(app = %app, "Server names changed, regenerating self-signed certificate");
            }
            _ => return Ok(false),
        }
    }

    let names: Vec<String> = server_names
        .iter()
        .flat_map(|name| match name.strip_prefix("*.") {
            Some(bare) => vec![name.clone(), bare.to_string()],
            None => vec![name.clone()],
        })
        .collect();

    let CertifiedKey { cert, key_pair } = generate_simple_self_signed(names)
        .map_err(|e| ProxyConfigError::Certificate(e.to_string()))?;

    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| ProxyConfigError::Io { path, source }
    };
    settings::write_atomic(&cert_path, cert.pem().as_bytes()).map_err(io_err(&cert_path))?;
    settings::write_atomic(&key_path, key_pair.serialize_pem().as_bytes())
        .map_err(io_err(&key_path))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))
            .map_err(io_err(&key_path))?;
    }

    settings::write_atomic(&names_path, wanted.as_bytes()).map_err(io_err(&names_path))?;

    info!(app = %app, path = %cert_path.display(), "Generated self-signed certificate");
    Ok(true)
}

fn render_names(server_names: &[String]) -> String {
    server_names.iter().map(|name| format!("{}\n", name)).collect()
}
