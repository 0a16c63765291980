// TLS listener configuration loaded from PEM files.
// Bad material is a startup error, never retried.
use anyhow::{Context, Result, bail};
use rustls::ServerConfig;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

pub fn load_server_config(cert_path: &str, key_path: &str) -> Result<Arc<ServerConfig>> {
    let certs = CertificateDer::pem_file_iter(cert_path)
        .with_context(|| format!("read TLS certificate: {cert_path}"))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("parse TLS certificate: {cert_path}"))?;
    if certs.is_empty() {
        bail!("no certificates found in {cert_path}");
    }
    let key = PrivateKeyDer::from_pem_file(key_path)
        .with_context(|| format!("read TLS private key: {key_path}"))?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("build TLS server config")?;
    Ok(Arc::new(config))
}

pub fn acceptor(config: Arc<ServerConfig>) -> TlsAcceptor {
    TlsAcceptor::from(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(contents.as_bytes()).expect("write");
        file
    }

    #[test]
    fn loads_self_signed_material() -> Result<()> {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()])?;
        let cert_file = write_temp(&cert.serialize_pem()?);
        let key_file = write_temp(&cert.get_key_pair().serialize_pem());

        let config = load_server_config(
            &cert_file.path().to_string_lossy(),
            &key_file.path().to_string_lossy(),
        )?;
        let _acceptor = acceptor(config);
        Ok(())
    }

    #[test]
    fn missing_cert_file_is_an_error() {
        let err = load_server_config("/nonexistent/server.crt", "/nonexistent/server.key")
            .expect_err("missing file");
        assert!(err.to_string().contains("/nonexistent/server.crt"));
    }

    #[test]
    fn malformed_material_is_an_error() {
        let cert_file = write_temp("not a certificate");
        let key_file = write_temp("not a key");
        assert!(
            load_server_config(
                &cert_file.path().to_string_lossy(),
                &key_file.path().to_string_lossy(),
            )
            .is_err()
        );
    }
}
