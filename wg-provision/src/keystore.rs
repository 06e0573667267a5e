// Idempotent key material store

//! Key material lifecycle
//!
//! The [`KeyStore`] owns a local materials directory holding one private key,
//! one public key and (for clients) one preshared key per identity, each as a
//! single line of text with owner-only permissions:
//!
//! ```text
//! server.key  server.pub
//! alice.key   alice.pub   alice.psk
//! ```
//!
//! Existing material is never overwritten. An identity is created only when
//! its private key is absent, and the private key is the last part moved into
//! place, so an interrupted creation never leaves a usable-looking identity
//! behind.
//!
//! The store assumes a single writer: concurrent provisioning runs against
//! the same directory are unsupported and may race on identity creation.

use crate::error::ProvisionError;
use crate::types::Identity;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Name of the server identity inside the store
pub const SERVER_IDENTITY: &str = "server";

const PRIVATE_EXT: &str = "key";
const PUBLIC_EXT: &str = "pub";
const PRESHARED_EXT: &str = "psk";

/// Key-generation primitive
///
/// Implementations return base64 text; the store treats it as opaque.
pub trait KeyGenerator {
    /// Create a new private key
    fn generate_private(&self) -> Result<String, String>;
    /// Derive the public key belonging to `private_key`
    fn derive_public(&self, private_key: &str) -> Result<String, String>;
    /// Create a new preshared key
    fn generate_preshared(&self) -> Result<String, String>;
}

impl<G: KeyGenerator + ?Sized> KeyGenerator for Box<G> {
    fn generate_private(&self) -> Result<String, String> {
        (**self).generate_private()
    }

    fn derive_public(&self, private_key: &str) -> Result<String, String> {
        (**self).derive_public(private_key)
    }

    fn generate_preshared(&self) -> Result<String, String> {
        (**self).generate_preshared()
    }
}

/// In-process Curve25519 key generation
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeKeyGenerator;

impl KeyGenerator for NativeKeyGenerator {
    fn generate_private(&self) -> Result<String, String> {
        Ok(wireguard_control::Key::generate_private().to_base64())
    }

    fn derive_public(&self, private_key: &str) -> Result<String, String> {
        let key = wireguard_control::Key::from_base64(private_key)
            .map_err(|_| "private key is not valid base64 key material".to_string())?;
        Ok(key.get_public().to_base64())
    }

    fn generate_preshared(&self) -> Result<String, String> {
        Ok(wireguard_control::Key::generate_preshared().to_base64())
    }
}

/// What the materials directory holds for one identity
#[derive(Debug)]
enum StoredIdentity {
    /// Every part present
    Complete(Identity),
    /// No private key; stale leftovers (if any) may be replaced
    Absent,
    /// Private key present, public key missing and re-derivable
    Recoverable {
        private_key: String,
        preshared_key: Option<String>,
    },
}

/// Idempotent store of server and client key material
pub struct KeyStore<G> {
    dir: PathBuf,
    generator: G,
    cache: HashMap<String, Identity>,
}

impl<G: KeyGenerator> KeyStore<G> {
    /// Open (and create if needed) the materials directory
    pub fn open(dir: impl Into<PathBuf>, generator: G) -> Result<Self, ProvisionError> {
        let dir = dir.into();
        create_private_dir(&dir)?;
        Ok(Self {
            dir,
            generator,
            cache: HashMap::new(),
        })
    }

    /// Materials directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the server's private key file
    pub fn server_private_key_path(&self) -> PathBuf {
        self.part_path(SERVER_IDENTITY, PRIVATE_EXT)
    }

    /// Return the server identity, creating it on first use
    pub fn ensure_server_identity(&mut self) -> Result<Identity, ProvisionError> {
        self.ensure(SERVER_IDENTITY, false)
    }

    /// Return a client identity, creating it on first use
    pub fn ensure_client_identity(&mut self, name: &str) -> Result<Identity, ProvisionError> {
        if name == SERVER_IDENTITY {
            return Err(ProvisionError::KeyGeneration {
                identity: name.to_string(),
                reason: "client name collides with the server identity".to_string(),
            });
        }
        self.ensure(name, true)
    }

    /// Read an identity without creating anything
    pub fn load(&self, name: &str) -> Result<Option<Identity>, ProvisionError> {
        let with_psk = name != SERVER_IDENTITY;
        match self.inspect(name, with_psk)? {
            StoredIdentity::Complete(identity) => Ok(Some(identity)),
            _ => Ok(None),
        }
    }

    fn ensure(&mut self, name: &str, with_psk: bool) -> Result<Identity, ProvisionError> {
        if let Some(identity) = self.cache.get(name) {
            return Ok(identity.clone());
        }

        let identity = match self.inspect(name, with_psk)? {
            StoredIdentity::Complete(identity) => {
                log::debug!("Reusing existing key material for {}", name);
                identity
            }
            StoredIdentity::Recoverable {
                private_key,
                preshared_key,
            } => {
                log::info!("Re-deriving missing public key for {}", name);
                let public_key = self
                    .generator
                    .derive_public(&private_key)
                    .map_err(|reason| key_error(name, reason))
                    .and_then(|key| checked_key(name, "public key", key))?;
                let path = self.part_path(name, PUBLIC_EXT);
                write_atomic(&path, &public_key)?;
                Identity {
                    private_key,
                    public_key,
                    preshared_key,
                }
            }
            StoredIdentity::Absent => {
                log::info!("Generating key material for {}", name);
                self.create(name, with_psk)?
            }
        };

        self.cache.insert(name.to_string(), identity.clone());
        Ok(identity)
    }

    fn inspect(&self, name: &str, with_psk: bool) -> Result<StoredIdentity, ProvisionError> {
        let Some(private_key) = read_part(&self.part_path(name, PRIVATE_EXT))? else {
            return Ok(StoredIdentity::Absent);
        };

        let preshared_key = if with_psk {
            match read_part(&self.part_path(name, PRESHARED_EXT))? {
                Some(psk) => Some(psk),
                None => {
                    return Err(ProvisionError::IncompleteIdentity {
                        identity: name.to_string(),
                        missing: file_name(name, PRESHARED_EXT),
                    })
                }
            }
        } else {
            None
        };

        match read_part(&self.part_path(name, PUBLIC_EXT))? {
            Some(public_key) => Ok(StoredIdentity::Complete(Identity {
                private_key,
                public_key,
                preshared_key,
            })),
            None => Ok(StoredIdentity::Recoverable {
                private_key,
                preshared_key,
            }),
        }
    }

    fn create(&self, name: &str, with_psk: bool) -> Result<Identity, ProvisionError> {
        let generator = &self.generator;
        let private_key = generator
            .generate_private()
            .map_err(|reason| key_error(name, reason))
            .and_then(|key| checked_key(name, "private key", key))?;
        let public_key = generator
            .derive_public(&private_key)
            .map_err(|reason| key_error(name, reason))
            .and_then(|key| checked_key(name, "public key", key))?;
        let preshared_key = if with_psk {
            let psk = generator
                .generate_preshared()
                .map_err(|reason| key_error(name, reason))
                .and_then(|key| checked_key(name, "preshared key", key))?;
            Some(psk)
        } else {
            None
        };

        // Private key goes last: its presence marks the identity as existing
        let mut parts = vec![(self.part_path(name, PUBLIC_EXT), public_key.as_str())];
        if let Some(psk) = &preshared_key {
            parts.push((self.part_path(name, PRESHARED_EXT), psk.as_str()));
        }
        parts.push((self.part_path(name, PRIVATE_EXT), private_key.as_str()));

        let mut written: Vec<&Path> = Vec::new();
        for (path, contents) in &parts {
            if let Err(err) = write_atomic(path, contents) {
                for done in written {
                    let _ = fs::remove_file(done);
                }
                return Err(err);
            }
            written.push(path.as_path());
        }

        Ok(Identity {
            private_key,
            public_key,
            preshared_key,
        })
    }

    fn part_path(&self, name: &str, ext: &str) -> PathBuf {
        self.dir.join(file_name(name, ext))
    }
}

fn file_name(name: &str, ext: &str) -> String {
    format!("{}.{}", name, ext)
}

fn key_error(identity: &str, reason: String) -> ProvisionError {
    ProvisionError::KeyGeneration {
        identity: identity.to_string(),
        reason,
    }
}

/// Reject empty or multi-line generator output
fn checked_key(identity: &str, what: &str, key: String) -> Result<String, ProvisionError> {
    let trimmed = key.trim();
    if trimmed.is_empty() || trimmed.contains(char::is_whitespace) {
        return Err(key_error(identity, format!("generator returned a malformed {}", what)));
    }
    Ok(trimmed.to_string())
}

/// Read one key file; a missing or empty file counts as absent
fn read_part(path: &Path) -> Result<Option<String>, ProvisionError> {
    match fs::read_to_string(path) {
        Ok(contents) => {
            let trimmed = contents.trim();
            Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(ProvisionError::persistence(path, err)),
    }
}

/// Create `dir` (and parents) accessible to the owner only
pub(crate) fn create_private_dir(dir: &Path) -> Result<(), ProvisionError> {
    if dir.is_dir() {
        return Ok(());
    }
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder
        .create(dir)
        .map_err(|err| ProvisionError::persistence(dir, err))
}

/// Write a single-line owner-only file via a temporary sibling and rename
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<(), ProvisionError> {
    replace_owner_only(path, contents.as_bytes(), true)
}

/// Atomically replace `path` with an owner-only file holding `contents`
pub(crate) fn replace_owner_only(
    path: &Path,
    contents: &[u8],
    newline: bool,
) -> Result<(), ProvisionError> {
    let tmp = tmp_path(path);
    let _ = fs::remove_file(&tmp);

    let result = write_owner_only(&tmp, contents, newline).and_then(|()| fs::rename(&tmp, path));
    if let Err(err) = result {
        let _ = fs::remove_file(&tmp);
        return Err(ProvisionError::persistence(path, err));
    }
    Ok(())
}

/// Create `path` with mode 0600 and write `contents` (plus a newline if asked)
fn write_owner_only(path: &Path, contents: &[u8], newline: bool) -> io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    if newline {
        file.write_all(b"\n")?;
    }
    file.sync_all()
}

fn tmp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.tmp", name))
}
