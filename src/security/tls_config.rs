//! TLS listener support.
//!
//! A listening port owns one long-lived rustls server context built from
//! the configured PEM credentials; accepted sessions keep a reference to
//! the context they were built from, so a certificate refresh swaps the
//! context atomically and affects new sessions only. With client
//! authentication enabled, the peer certificate's subject common name is
//! resolved to an identity before the first command runs (the `tls_init`
//! connection state drives that).

#[cfg(feature = "tls")]
use std::fs::File;
#[cfg(feature = "tls")]
use std::io::BufReader;
#[cfg(feature = "tls")]
use std::sync::Arc;

#[cfg(feature = "tls")]
use parking_lot::RwLock;

#[cfg(feature = "tls")]
use rustls_pemfile::Item;
#[cfg(feature = "tls")]
use tokio_rustls::rustls::{
    pki_types::{CertificateDer, PrivateKeyDer},
    server::danger::ClientCertVerifier,
    server::WebPkiClientVerifier,
    RootCertStore, ServerConfig,
};

/// TLS configuration options.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    /// Enable the TLS listener
    pub enabled: bool,
    /// TLS port
    pub port: u16,
    /// Path to server certificate file (PEM format)
    pub cert_file: Option<String>,
    /// Path to server private key file (PEM format)
    pub key_file: Option<String>,
    /// Path to CA certificate file for client verification (mTLS)
    pub ca_cert_file: Option<String>,
    /// Client certificate requirements
    pub auth_clients: TlsAuthClients,
    /// User a verified client certificate authenticates as, when the
    /// certificate subject cannot be mapped
    pub cert_user: Option<String>,
}

/// Client authentication mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsAuthClients {
    /// No client certificate required
    #[default]
    No,
    /// Client certificate optional
    Optional,
    /// Client certificate required (mTLS)
    Required,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 11207,
            cert_file: None,
            key_file: None,
            ca_cert_file: None,
            auth_clients: TlsAuthClients::No,
            cert_user: None,
        }
    }
}

/// TLS-related errors.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    /// A required setting is absent
    #[error("tls setting `{0}` is required")]
    MissingSetting(&'static str),
    /// A PEM file could not be read or did not hold the expected material
    #[error("{path}: {detail}")]
    BadPem {
        /// Offending file
        path: String,
        /// What went wrong
        detail: String,
    },
    /// rustls rejected the assembled configuration
    #[error("tls configuration rejected: {0}")]
    Rejected(String),
}

#[cfg(feature = "tls")]
fn bad_pem(path: &str, detail: impl std::fmt::Display) -> TlsError {
    TlsError::BadPem {
        path: path.to_string(),
        detail: detail.to_string(),
    }
}

/// Every PEM item in `path`, in file order.
#[cfg(feature = "tls")]
fn pem_items(path: &str) -> Result<Vec<Item>, TlsError> {
    let file = File::open(path).map_err(|e| bad_pem(path, e))?;
    rustls_pemfile::read_all(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| bad_pem(path, e))
}

/// The server's certificate chain and private key, loaded together so a
/// refresh can never observe a half-rotated pair.
#[cfg(feature = "tls")]
struct PemCredentials {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

#[cfg(feature = "tls")]
impl PemCredentials {
    fn load(cert_path: &str, key_path: &str) -> Result<Self, TlsError> {
        let chain: Vec<CertificateDer<'static>> = pem_items(cert_path)?
            .into_iter()
            .filter_map(|item| match item {
                Item::X509Certificate(cert) => Some(cert),
                _ => None,
            })
            .collect();
        if chain.is_empty() {
            return Err(bad_pem(cert_path, "no certificates found"));
        }

        let key = pem_items(key_path)?
            .into_iter()
            .find_map(|item| match item {
                Item::Pkcs8Key(key) => Some(PrivateKeyDer::Pkcs8(key)),
                Item::Pkcs1Key(key) => Some(PrivateKeyDer::Pkcs1(key)),
                Item::Sec1Key(key) => Some(PrivateKeyDer::Sec1(key)),
                _ => None,
            })
            .ok_or_else(|| bad_pem(key_path, "no private key found"))?;

        Ok(Self { chain, key })
    }
}

#[cfg(feature = "tls")]
impl TlsSettings {
    fn required<'a>(
        &self,
        name: &'static str,
        value: &'a Option<String>,
    ) -> Result<&'a str, TlsError> {
        value.as_deref().ok_or(TlsError::MissingSetting(name))
    }

    /// The client-certificate verifier implied by `auth_clients`, or
    /// `None` when clients are anonymous.
    fn client_verifier(&self) -> Result<Option<Arc<dyn ClientCertVerifier>>, TlsError> {
        if self.auth_clients == TlsAuthClients::No {
            return Ok(None);
        }
        let ca_path = self.required("ca_cert_file", &self.ca_cert_file)?;

        let mut anchors = RootCertStore::empty();
        for item in pem_items(ca_path)? {
            if let Item::X509Certificate(cert) = item {
                anchors.add(cert).map_err(|e| bad_pem(ca_path, e))?;
            }
        }
        if anchors.is_empty() {
            return Err(bad_pem(ca_path, "no CA certificates found"));
        }

        let mut builder = WebPkiClientVerifier::builder(Arc::new(anchors));
        if self.auth_clients == TlsAuthClients::Optional {
            builder = builder.allow_unauthenticated();
        }
        builder
            .build()
            .map(Some)
            .map_err(|e| TlsError::Rejected(e.to_string()))
    }

    /// Build a rustls `ServerConfig` from this configuration.
    ///
    /// # Errors
    ///
    /// Returns an error when paths are missing, the PEM material cannot
    /// be loaded, or rustls rejects the combination.
    pub fn build_server_config(&self) -> Result<ServerConfig, TlsError> {
        let credentials = PemCredentials::load(
            self.required("cert_file", &self.cert_file)?,
            self.required("key_file", &self.key_file)?,
        )?;

        let builder = match self.client_verifier()? {
            Some(verifier) => ServerConfig::builder().with_client_cert_verifier(verifier),
            None => ServerConfig::builder().with_no_client_auth(),
        };
        builder
            .with_single_cert(credentials.chain, credentials.key)
            .map_err(|e| TlsError::Rejected(e.to_string()))
    }
}

/// Holder for the per-listener server context, replaced atomically on
/// certificate refresh.
#[cfg(feature = "tls")]
pub struct TlsContextHolder {
    settings: TlsSettings,
    current: RwLock<Arc<ServerConfig>>,
}

#[cfg(feature = "tls")]
impl TlsContextHolder {
    /// Build the initial context from `settings`.
    pub fn new(settings: TlsSettings) -> Result<Self, TlsError> {
        let config = settings.build_server_config()?;
        Ok(Self {
            settings,
            current: RwLock::new(Arc::new(config)),
        })
    }

    /// The context new sessions should be built from.
    pub fn current(&self) -> Arc<ServerConfig> {
        self.current.read().clone()
    }

    /// Reload certificates from disk and swap the context. Sessions
    /// accepted from the old context are unaffected.
    pub fn refresh(&self) -> Result<(), TlsError> {
        let config = self.settings.build_server_config()?;
        *self.current.write() = Arc::new(config);
        Ok(())
    }
}

#[cfg(feature = "tls")]
impl std::fmt::Debug for TlsContextHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContextHolder")
            .field("port", &self.settings.port)
            .finish()
    }
}

/// Best-effort extraction of the subject common name from a DER-encoded
/// certificate: scans for the CN attribute type (OID 2.5.4.3) and decodes
/// the string that follows it.
pub fn subject_common_name(der: &[u8]) -> Option<String> {
    const CN_OID: [u8; 5] = [0x06, 0x03, 0x55, 0x04, 0x03];
    let mut offset = 0;
    while offset + CN_OID.len() + 2 <= der.len() {
        if der[offset..offset + CN_OID.len()] == CN_OID {
            let tag = der[offset + CN_OID.len()];
            // UTF8String, PrintableString or IA5String
            if matches!(tag, 0x0c | 0x13 | 0x16) {
                let len = usize::from(der[offset + CN_OID.len() + 1]);
                let start = offset + CN_OID.len() + 2;
                if len < 0x80 && start + len <= der.len() {
                    return String::from_utf8(der[start..start + len].to_vec()).ok();
                }
            }
        }
        offset += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings() {
        let settings = TlsSettings::default();
        assert!(!settings.enabled);
        assert_eq!(settings.port, 11207);
        assert_eq!(settings.auth_clients, TlsAuthClients::No);
    }

    #[cfg(feature = "tls")]
    #[test]
    fn missing_paths_are_reported_by_name() {
        let err = TlsSettings::default().build_server_config().unwrap_err();
        assert!(matches!(err, TlsError::MissingSetting("cert_file")));

        let err = TlsSettings {
            cert_file: Some("/nonexistent/server.pem".to_string()),
            ..TlsSettings::default()
        }
        .build_server_config()
        .unwrap_err();
        assert!(matches!(err, TlsError::MissingSetting("key_file")));
    }

    #[cfg(feature = "tls")]
    #[test]
    fn mtls_requires_a_ca_bundle() {
        let err = TlsSettings {
            cert_file: Some("/nonexistent/server.pem".to_string()),
            key_file: Some("/nonexistent/server.key".to_string()),
            auth_clients: TlsAuthClients::Required,
            ..TlsSettings::default()
        }
        .build_server_config()
        .unwrap_err();
        // The credential load fails before the verifier is considered.
        assert!(matches!(err, TlsError::BadPem { .. }));
    }

    #[test]
    fn common_name_extraction() {
        // Fragment of a subject RDN: OID 2.5.4.3, UTF8String "internal"
        let der = [
            0x30, 0x0f, 0x06, 0x03, 0x55, 0x04, 0x03, 0x0c, 0x08, b'i', b'n', b't', b'e', b'r',
            b'n', b'a', b'l',
        ];
        assert_eq!(subject_common_name(&der).as_deref(), Some("internal"));
        assert!(subject_common_name(&[0x00, 0x01]).is_none());
    }
}
