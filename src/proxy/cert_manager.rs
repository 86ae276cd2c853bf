use anyhow::{anyhow, Context};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::ServerConfig;
use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use time::{Duration, OffsetDateTime};

use super::crypto_provider;

/// File name of the exported root certificate inside the output directory
pub const CA_CERT_FILE: &str = "ca.crt";

const ROOT_SERIAL: u64 = 1;
const ROOT_VALIDITY_DAYS: i64 = 365;
const LEAF_VALIDITY_DAYS: i64 = 30;

/// A host certificate signed by the proxy root, ready for a TLS handshake.
pub struct LeafCertificate {
    pub host: String,
    pub cert_der: CertificateDer<'static>,
    server_config: Arc<ServerConfig>,
}

impl LeafCertificate {
    /// Server-side TLS configuration presenting this certificate (and the root) to clients
    pub fn server_config(&self) -> Arc<ServerConfig> {
        self.server_config.clone()
    }
}

pub struct CertificateAuthority {
    ca_cert: Certificate,
    ca_key: KeyPair,
    ca_path: PathBuf,
    leaves: RwLock<HashMap<String, Arc<LeafCertificate>>>,
    last_serial: AtomicU64,
}

impl CertificateAuthority {
    /// Generate a fresh root CA and export it as `ca.crt` under `output_dir`.
    ///
    /// The root lives only as long as this value; nothing is loaded from disk.
    pub fn generate_root(output_dir: &Path) -> anyhow::Result<Self> {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "GQL Proxy Root CA");
        dn.push(DnType::OrganizationName, "GQL Proxy CA");

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.serial_number = Some(SerialNumber::from(ROOT_SERIAL));
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + Duration::days(ROOT_VALIDITY_DAYS);

        let ca_key = KeyPair::generate().context("Failed to generate CA key")?;
        let ca_cert = params
            .self_signed(&ca_key)
            .context("Failed to self-sign CA certificate")?;

        if !output_dir.exists() {
            fs::create_dir_all(output_dir).context("Failed to create output directory")?;
        }
        let ca_path = output_dir.join(CA_CERT_FILE);
        fs::write(&ca_path, ca_cert.pem()).context("Failed to write CA certificate")?;

        Ok(Self {
            ca_cert,
            ca_key,
            ca_path,
            leaves: RwLock::new(HashMap::new()),
            last_serial: AtomicU64::new(0),
        })
    }

    pub fn ca_path(&self) -> &Path {
        &self.ca_path
    }

    pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
        self.ca_cert.der()
    }

    /// Return the cached leaf for `host`, issuing and caching a new one on first use.
    ///
    /// Two tasks racing on the same uncached host may both sign a certificate;
    /// the later insert wins and both results are valid.
    pub fn issue_leaf(&self, host: &str) -> anyhow::Result<Arc<LeafCertificate>> {
        let cache_key = host.to_ascii_lowercase();
        {
            let cache = self
                .leaves
                .read()
                .map_err(|_| anyhow!("leaf certificate cache poisoned"))?;
            if let Some(leaf) = cache.get(&cache_key) {
                return Ok(leaf.clone());
            }
        }

        let leaf = Arc::new(self.sign_leaf(&cache_key)?);
        let mut cache = self
            .leaves
            .write()
            .map_err(|_| anyhow!("leaf certificate cache poisoned"))?;
        cache.insert(cache_key, leaf.clone());
        Ok(leaf)
    }

    pub fn cached_leaf_count(&self) -> usize {
        self.leaves.read().map(|cache| cache.len()).unwrap_or(0)
    }

    fn sign_leaf(&self, host: &str) -> anyhow::Result<LeafCertificate> {
        let mut params = CertificateParams::default();

        if let Ok(ip) = IpAddr::from_str(host) {
            params.subject_alt_names = vec![SanType::IpAddress(ip)];
        } else {
            params.subject_alt_names = vec![SanType::DnsName(
                Ia5String::try_from(host)
                    .map_err(|_| anyhow!("Invalid hostname for certificate: {host}"))?,
            )];
        }

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        dn.push(DnType::OrganizationName, "GQL Proxy");
        params.distinguished_name = dn;
        params.serial_number = Some(SerialNumber::from(self.next_serial()));
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

        let key_pair = KeyPair::generate().context("Failed to generate leaf key")?;
        let cert = params
            .signed_by(&key_pair, &self.ca_cert, &self.ca_key)
            .context("Failed to sign leaf certificate")?;

        let cert_der = cert.der().clone();
        let chain = vec![cert_der.clone(), self.ca_cert.der().clone()];
        let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

        let mut config = ServerConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .context("Failed to select TLS protocol versions")?
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .context("Failed to build TLS server config")?;
        // Only HTTP/1.x is decoded inside the tunnel
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(LeafCertificate {
            host: host.to_string(),
            cert_der,
            server_config: Arc::new(config),
        })
    }

    /// Nanosecond wall clock, bumped so consecutive serials never repeat.
    fn next_serial(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let mut last = self.last_serial.load(Ordering::SeqCst);
        loop {
            let next = now.max(last + 1);
            match self
                .last_serial
                .compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(current) => last = current,
            }
        }
    }
}
