//! Self-signed TLS material for the HTTPS surface.
//!
//! Every node mints its own certificate on first start (CN `*`, SANs
//! covering localhost and the wildcard, 100-year validity). Peers
//! accept these unconditionally; confidentiality comes from the
//! per-message envelope, not the transport.

use std::path::{Path, PathBuf};

use anyhow::Context;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use tracing::info;

pub const CERT_FILE: &str = "cert.pem";
pub const KEY_FILE: &str = "key.pem";

/// Load-or-generate `cert.pem`/`key.pem` under the data directory and
/// return their paths.
pub fn ensure_certificates(data_dir: &Path) -> anyhow::Result<(PathBuf, PathBuf)> {
    let cert_path = data_dir.join(CERT_FILE);
    let key_path = data_dir.join(KEY_FILE);

    if cert_path.exists() && key_path.exists() {
        return Ok((cert_path, key_path));
    }

    info!(dir = %data_dir.display(), "generating self-signed certificate");

    let mut params = CertificateParams::new(vec![
        "*".to_string(),
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "0.0.0.0".to_string(),
    ])
    .context("certificate parameters")?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "CyberChat");
    dn.push(DnType::CommonName, "*");
    params.distinguished_name = dn;
    params.not_after = rcgen::date_time_ymd(2125, 1, 1);

    let key_pair = KeyPair::generate().context("certificate keypair")?;
    let cert = params
        .self_signed(&key_pair)
        .context("certificate signing")?;

    std::fs::write(&cert_path, cert.pem()).context("writing cert.pem")?;
    std::fs::write(&key_path, key_pair.serialize_pem()).context("writing key.pem")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        for path in [&cert_path, &key_path] {
            let mut perms = std::fs::metadata(path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(path, perms)?;
        }
    }

    Ok((cert_path, key_path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_and_reuse() {
        let dir = tempfile::tempdir().unwrap();

        let (cert, key) = ensure_certificates(dir.path()).unwrap();
        let cert_pem = std::fs::read_to_string(&cert).unwrap();
        assert!(cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(std::fs::read_to_string(&key)
            .unwrap()
            .contains("PRIVATE KEY"));

        // Second call must reuse, not regenerate.
        let (cert2, _) = ensure_certificates(dir.path()).unwrap();
        assert_eq!(cert, cert2);
        assert_eq!(std::fs::read_to_string(&cert2).unwrap(), cert_pem);
    }
}
