//! TLS 1.3 configuration for both endpoints: certificate loading, mutual
//! authentication, session resumption, and the (off by default) verification
//! bypass used behind trusted network paths.

use std::{
    fs::File,
    io::{self, BufReader, Error, ErrorKind},
    path::Path,
    sync::Arc,
};

use rustls::{
    client::Resumption,
    pki_types::{CertificateDer, PrivateKeyDer, ServerName},
    server::WebPkiClientVerifier,
    ClientConfig, RootCertStore, ServerConfig,
};

/// Client TLS session tickets cached per configuration.
pub const SESSION_CACHE_SIZE: usize = 1024;

fn load_certs(path: &Path) -> io::Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::certs(&mut reader).collect()
}

fn load_key(path: &Path) -> io::Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    match rustls_pemfile::private_key(&mut reader)? {
        Some(key) => Ok(key),
        None => Err(Error::new(
            ErrorKind::InvalidData,
            format!("no private key found in {}", path.display()),
        )),
    }
}

/// A root store from the given PEM bundle, or the system trust store when
/// no bundle is configured.
fn root_store(root_ca: Option<&Path>) -> io::Result<RootCertStore> {
    let mut roots = RootCertStore::empty();

    match root_ca {
        Some(path) => {
            for cert in load_certs(path)? {
                roots
                    .add(cert)
                    .map_err(|e| Error::new(ErrorKind::InvalidData, format!("bad root certificate: {e}")))?;
            }
        }
        None => {
            let native = rustls_native_certs::load_native_certs();
            for cert in native.certs {
                let _ = roots.add(cert);
            }
        }
    }

    if roots.is_empty() {
        return Err(Error::new(ErrorKind::InvalidData, "no usable root certificates"));
    }

    Ok(roots)
}

fn invalid(error: rustls::Error) -> Error {
    Error::new(ErrorKind::InvalidData, error)
}

/// The forwarder-side configuration: TLS 1.3 only, mandatory client
/// certificate, SNI pinned to `server_host`, and an in-memory session cache.
/// `insecure` disables server certificate verification; it is a deployment
/// toggle, never a default.
pub fn client_config(
    root_ca: Option<&Path>,
    client_cert: &Path,
    client_key: &Path,
    server_host: &str,
    insecure: bool,
) -> io::Result<(Arc<ClientConfig>, ServerName<'static>)> {
    let server_name = ServerName::try_from(server_host.to_string())
        .map_err(|_| Error::new(ErrorKind::InvalidInput, format!("invalid server name {server_host:?}")))?;

    let certs = load_certs(client_cert)?;
    let key = load_key(client_key)?;
    let roots = root_store(root_ca)?;

    let mut config = ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .map_err(invalid)?;

    config.resumption = Resumption::in_memory_sessions(SESSION_CACHE_SIZE);

    if insecure {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(danger::NoVerification::new()));
    }

    Ok((Arc::new(config), server_name))
}

/// The server-side configuration: TLS 1.3 only. A configured root CA turns
/// on mandatory client certificate verification; without one, any client
/// may connect.
pub fn server_config(server_cert: &Path, server_key: &Path, root_ca: Option<&Path>) -> io::Result<Arc<ServerConfig>> {
    let certs = load_certs(server_cert)?;
    let key = load_key(server_key)?;

    let builder = ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13]);

    let config = match root_ca {
        Some(path) => {
            let verifier = WebPkiClientVerifier::builder(Arc::new(root_store(Some(path))?))
                .build()
                .map_err(|e| Error::new(ErrorKind::InvalidData, format!("client verifier: {e}")))?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    }
    .with_single_cert(certs, key)
    .map_err(invalid)?;

    Ok(Arc::new(config))
}

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::DigitallySignedStruct;

    /// Accepts any server certificate. Signatures are still checked so a
    /// handshake with a broken key fails.
    #[derive(Debug)]
    pub(super) struct NoVerification(CryptoProvider);

    impl NoVerification {
        pub(super) fn new() -> NoVerification {
            NoVerification(rustls::crypto::ring::default_provider())
        }
    }

    impl ServerCertVerifier for NoVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}
