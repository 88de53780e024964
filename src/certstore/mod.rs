//! Certificate store: one CA per store, plus the leaf pairs it has issued.
//!
//! # Layout
//!
//! ```text
//! <root>/<ca-name>/ca.crt        CA certificate
//! <root>/<ca-name>/ca.key        CA private key (0600)
//! <root>/<ca-name>/<label>.crt   leaf certificate
//! <root>/<ca-name>/<label>.key   leaf private key (0600)
//! ```
//!
//! A store is bound to a root directory at construction and to a CA by
//! exactly one of [`CertStore::init_ca`] (load or create) or
//! [`CertStore::load_ca`] (load only).  Several stores may share one root;
//! each is scoped to its own CA directory.
//!
//! # Modules
//!
//! - [`authority`] - `rcgen`-backed CA generation and leaf issuance
//! - [`fs`] - the storage seam (`CertFs`) with OS and in-memory backends
//! - [`pem`] - PEM decoding for certificates and keys

pub mod authority;
pub mod fs;
pub mod pem;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub use authority::{AltNames, CertKeyPair, CertRole, CertificateAuthority};
pub use fs::{CertFs, FileMode, MemFs, OsFs};

use crate::{Error, Result};

/// Label reserved for the CA's own certificate and key.
pub const CA_LABEL: &str = "ca";

/// Default storage root, relative to the working directory.
pub const DEFAULT_CERT_DIR: &str = "certs";

/// What [`CertStore::write`] does when the label already holds a pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WritePolicy {
    /// Replace the existing pair (last write wins).
    #[default]
    Overwrite,
    /// Fail with `Error::Validation` instead of replacing.
    RejectExisting,
}

/// PEM certificate store bound to one storage root and one CA.
pub struct CertStore {
    fs: Arc<dyn CertFs>,
    root: PathBuf,
    policy: WritePolicy,
    ca: Option<CertificateAuthority>,
}

impl std::fmt::Debug for CertStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertStore")
            .field("root", &self.root)
            .field("policy", &self.policy)
            .field("ca", &self.ca.as_ref().map(CertificateAuthority::name))
            .finish_non_exhaustive()
    }
}

impl CertStore {
    /// Bind a new store to `root` on `fs`.  No storage is touched yet.
    pub fn new(fs: Arc<dyn CertFs>, root: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            root: root.into(),
            policy: WritePolicy::default(),
            ca: None,
        }
    }

    /// Set the overwrite policy for [`CertStore::write`].
    #[must_use]
    pub fn with_write_policy(mut self, policy: WritePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Storage root this store is bound to.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// What [`write`](Self::write) does with an existing label.
    #[must_use]
    pub fn write_policy(&self) -> WritePolicy {
        self.policy
    }

    /// The established CA, if any.
    #[must_use]
    pub fn ca(&self) -> Option<&CertificateAuthority> {
        self.ca.as_ref()
    }

    // ── CA lifecycle ─────────────────────────────────────────────────────────

    /// Load CA `name` from the root, generating and persisting it if absent.
    ///
    /// Repeated calls against the same root return the same CA.
    ///
    /// # Errors
    ///
    /// `Error::Storage` if the root is unreadable or unwritable,
    /// `Error::Crypto` if generation fails or persisted material is corrupt.
    pub fn init_ca(&mut self, name: &str) -> Result<()> {
        validate_name("CA name", name)?;
        let (cert_path, key_path) = self.ca_paths(name);

        if self.fs.exists(&cert_path) && self.fs.exists(&key_path) {
            return self.load_ca(name);
        }

        let ca = CertificateAuthority::generate(name)?;
        self.persist(&cert_path, &key_path, ca.pem())?;
        info!(ca = %name, root = %self.root.display(), "Generated certificate authority");
        self.ca = Some(ca);
        Ok(())
    }

    /// Load existing CA `name`; never generates.
    ///
    /// # Errors
    ///
    /// `Error::NotFound` if the CA certificate or key is absent.
    pub fn load_ca(&mut self, name: &str) -> Result<()> {
        validate_name("CA name", name)?;
        let (cert_path, key_path) = self.ca_paths(name);

        if !self.fs.exists(&cert_path) || !self.fs.exists(&key_path) {
            return Err(Error::NotFound(format!(
                "certificate authority '{name}' under '{}'",
                self.root.display()
            )));
        }

        let cert_pem = self.read_string(&cert_path)?;
        let key_pem = self.read_string(&key_path)?;
        let ca = CertificateAuthority::from_pem(name, &cert_pem, &key_pem)?;
        debug!(ca = %name, root = %self.root.display(), "Loaded certificate authority");
        self.ca = Some(ca);
        Ok(())
    }

    // ── Issuance ─────────────────────────────────────────────────────────────

    /// Issue a server-role leaf signed by this store's CA.
    ///
    /// # Errors
    ///
    /// `Error::NotFound` without an established CA, `Error::Validation` for
    /// empty or malformed alt names, `Error::Crypto` if signing fails.
    pub fn new_server_cert_pair(&self, alt_names: &AltNames) -> Result<CertKeyPair> {
        self.require_ca()?.issue(CertRole::Server, alt_names)
    }

    /// Issue a client-role leaf signed by this store's CA.
    pub fn new_client_cert_pair(&self, alt_names: &AltNames) -> Result<CertKeyPair> {
        self.require_ca()?.issue(CertRole::Client, alt_names)
    }

    // ── Persistence ──────────────────────────────────────────────────────────

    /// Persist `pair` as PEM under `label`.
    ///
    /// # Errors
    ///
    /// `Error::Validation` for the reserved CA label or, under
    /// [`WritePolicy::RejectExisting`], for a label that already exists.
    pub fn write(&self, label: &str, pair: &CertKeyPair) -> Result<()> {
        validate_name("label", label)?;
        if label == CA_LABEL {
            return Err(Error::Validation(format!(
                "label '{CA_LABEL}' is reserved for the CA"
            )));
        }

        let cert_path = self.cert_file(label)?;
        let key_path = self.key_file(label)?;

        if self.policy == WritePolicy::RejectExisting
            && (self.fs.exists(&cert_path) || self.fs.exists(&key_path))
        {
            return Err(Error::Validation(format!(
                "label '{label}' already exists under '{}'",
                cert_path.display()
            )));
        }

        self.persist(&cert_path, &key_path, pair)?;
        debug!(label = %label, cert = %cert_path.display(), "Wrote certificate pair");
        Ok(())
    }

    /// Read back the pair persisted under `label`.
    ///
    /// # Errors
    ///
    /// `Error::NotFound` if either file is missing.
    pub fn load_pair(&self, label: &str) -> Result<CertKeyPair> {
        let cert_path = self.cert_file(label)?;
        let key_path = self.key_file(label)?;
        if !self.fs.exists(&cert_path) || !self.fs.exists(&key_path) {
            return Err(Error::NotFound(format!(
                "certificate pair '{label}' under '{}'",
                cert_path.parent().unwrap_or(&self.root).display()
            )));
        }
        Ok(CertKeyPair {
            cert_pem: self.read_string(&cert_path)?,
            key_pem: self.read_string(&key_path)?,
        })
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    /// Path of the certificate stored under `label`.
    ///
    /// # Errors
    ///
    /// `Error::NotFound` if no CA has been established.
    pub fn cert_file(&self, label: &str) -> Result<PathBuf> {
        Ok(self.ca_dir()?.join(format!("{label}.crt")))
    }

    /// Path of the private key stored under `label`.
    pub fn key_file(&self, label: &str) -> Result<PathBuf> {
        Ok(self.ca_dir()?.join(format!("{label}.key")))
    }

    /// The CA certificate as PEM bytes.
    pub fn ca_cert_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.require_ca()?.cert_pem().as_bytes().to_vec())
    }

    // ── Private helpers ──────────────────────────────────────────────────────

    fn require_ca(&self) -> Result<&CertificateAuthority> {
        self.ca.as_ref().ok_or_else(|| {
            Error::NotFound(format!(
                "no certificate authority established in '{}'",
                self.root.display()
            ))
        })
    }

    fn ca_dir(&self) -> Result<PathBuf> {
        Ok(self.root.join(self.require_ca()?.name()))
    }

    fn ca_paths(&self, name: &str) -> (PathBuf, PathBuf) {
        let dir = self.root.join(name);
        (
            dir.join(format!("{CA_LABEL}.crt")),
            dir.join(format!("{CA_LABEL}.key")),
        )
    }

    fn persist(&self, cert_path: &Path, key_path: &Path, pair: &CertKeyPair) -> Result<()> {
        self.fs
            .write(cert_path, pair.cert_pem.as_bytes(), FileMode::Public)
            .map_err(|e| Error::storage(cert_path, e))?;
        self.fs
            .write(key_path, pair.key_pem.as_bytes(), FileMode::Private)
            .map_err(|e| Error::storage(key_path, e))
    }

    fn read_string(&self, path: &Path) -> Result<String> {
        let bytes = self.fs.read(path).map_err(|e| Error::storage(path, e))?;
        String::from_utf8(bytes)
            .map_err(|e| Error::Crypto(format!("'{}' is not PEM text: {e}", path.display())))
    }
}

/// Names become path components; keep them to a single plain segment.
fn validate_name(kind: &str, name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(Error::Validation(format!("invalid {kind} '{name}'")))
    }
}
