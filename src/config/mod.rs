//! Instance configuration, and assembly of the TLS client and server
//! machinery from it.

use std::fs::File;
use std::io::BufReader;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use rustls::internal::pemfile;
use rustls::{
    AllowAnyAuthenticatedClient,
    Certificate,
    ClientConfig,
    PrivateKey,
    RootCertStore,
    ServerConfig,
};

use crate::error::*;

/// The default port instances listen on.
pub const DEFAULT_PORT: u16 = 7011;

/// The default interval between re-sends of unacknowledged deliveries.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// The default path of the ledger database file.
pub const DEFAULT_LEDGER_PATH: &str = "./tolliver.sqlite";

/// Everything needed to bootstrap an [`Instance`](crate::Instance).
///
/// The CA pool and the instance certificate are required; every other
/// field has a default.
pub struct InstanceConfig {
    /// Trust anchors remotes must chain to, as DER certificates.
    pub ca_certs: Vec<Certificate>,
    /// The certificate chain this instance presents to remotes.
    pub cert_chain: Vec<Certificate>,
    /// The private key matching `cert_chain`.
    pub private_key: PrivateKey,
    /// The address to accept peer connections on. `None` makes the
    /// instance client-only.
    pub listen: Option<SocketAddr>,
    /// Where the delivery ledger lives on disk.
    pub ledger_path: PathBuf,
    /// How long the retry loop sleeps between sweeps over
    /// unacknowledged deliveries.
    pub retry_interval: Duration,
    /// Remotes to dial on startup, as (address, TLS server name) pairs.
    pub peers: Vec<(SocketAddr, String)>,
}

impl InstanceConfig {
    /// A configuration with the given credentials and every optional
    /// field at its default.
    pub fn new(
        ca_certs: Vec<Certificate>,
        cert_chain: Vec<Certificate>,
        private_key: PrivateKey,
    ) -> Self {
        InstanceConfig {
            ca_certs,
            cert_chain,
            private_key,
            listen: Some((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT).into()),
            ledger_path: PathBuf::from(DEFAULT_LEDGER_PATH),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            peers: Vec::new(),
        }
    }

    /// Builds the rustls configurations used to dial and to accept.
    /// Both sides verify the remote against the CA pool, and both
    /// present the instance certificate.
    pub(crate) fn tls_configs(&self) -> Result<(ClientConfig, ServerConfig)> {
        if self.ca_certs.is_empty() || self.cert_chain.is_empty() {
            return Err(Error::wrapped(
                ErrorKind::Config,
                "a CA pool and an instance certificate are required",
            ));
        }

        let mut client = ClientConfig::new();
        for cert in &self.ca_certs {
            client
                .root_store
                .add(cert)
                .simple_msg(ErrorKind::Config, "invalid trust anchor certificate")?;
        }
        client
            .set_single_client_cert(self.cert_chain.clone(), self.private_key.clone())
            .simple_msg(ErrorKind::Config, "invalid instance certificate or key")?;

        let mut roots = RootCertStore::empty();
        for cert in &self.ca_certs {
            roots
                .add(cert)
                .simple_msg(ErrorKind::Config, "invalid trust anchor certificate")?;
        }
        let mut server = ServerConfig::new(AllowAnyAuthenticatedClient::new(roots));
        server
            .set_single_cert(self.cert_chain.clone(), self.private_key.clone())
            .simple_msg(ErrorKind::Config, "invalid instance certificate or key")?;

        Ok((client, server))
    }
}

/// Reads every PEM certificate in the file at `path`.
pub fn load_certs(path: &Path) -> Result<Vec<Certificate>> {
    let certs = pemfile::certs(&mut open(path)?)
        .simple_msg(ErrorKind::Config, "malformed certificate file")?;
    if certs.is_empty() {
        return Err(Error::wrapped(
            ErrorKind::Config,
            format!("no certificates found in {}", path.display()),
        ));
    }
    Ok(certs)
}

/// Reads the first PEM private key in the file at `path`, accepting
/// PKCS#8 or RSA encodings.
pub fn load_private_key(path: &Path) -> Result<PrivateKey> {
    let keys = pemfile::pkcs8_private_keys(&mut open(path)?)
        .simple_msg(ErrorKind::Config, "malformed private key file")?;
    if let Some(key) = keys.into_iter().next() {
        return Ok(key);
    }
    let keys = pemfile::rsa_private_keys(&mut open(path)?)
        .simple_msg(ErrorKind::Config, "malformed private key file")?;
    keys.into_iter().next().ok_or_else(|| {
        Error::wrapped(
            ErrorKind::Config,
            format!("no private key found in {}", path.display()),
        )
    })
}

fn open(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .wrapped_msg(ErrorKind::Config, &format!("opening {}", path.display()))
        .map(BufReader::new)
}
