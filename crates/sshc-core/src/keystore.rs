//! Key Store
//!
//! Generates, persists, loads, and fingerprints the process-wide Ed25519
//! key pair used to authenticate to every agent. Generation is idempotent:
//! if both key files exist on boot they are loaded verbatim; otherwise a
//! fresh pair is generated and written atomically (create-new + rename) so
//! a crash mid-write can never leave a torn file behind.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ssh_key::{HashAlg, LineEnding, PrivateKey};
use zeroize::Zeroizing;

use crate::error::KeyError;

const PRIVATE_KEY_FILE: &str = "ssh_key";
const PUBLIC_KEY_FILE: &str = "ssh_key.pub";
const LOCK_FILE: &str = "ssh_key.lock";
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);
const LOCK_RETRY_ATTEMPTS: u32 = 50;

/// A stable fingerprint string of the form `SHA256:<base64-no-padding>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn of(public_key: &ssh_key::PublicKey) -> Self {
        Self(public_key.fingerprint(HashAlg::Sha256).to_string())
    }

    /// Fingerprint a raw public-key wire encoding. Fails with `BadKey` if the
    /// bytes do not parse as a valid SSH public key.
    pub fn from_wire_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let public_key = ssh_key::PublicKey::from_bytes(bytes)
            .map_err(|_| KeyError::BadKey(PathBuf::from("<wire bytes>")))?;
        Ok(Self::of(&public_key))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The process-wide Ed25519 signing identity used against every agent.
pub struct KeyStore {
    private_pem: Zeroizing<String>,
    public_line: String,
    fingerprint: Fingerprint,
}

impl KeyStore {
    /// Load the key pair from `dir` if present, otherwise generate and
    /// persist a new one. Concurrent callers against the same directory
    /// serialize on an exclusive lock file rather than racing the
    /// create-new writes.
    pub fn ensure(dir: &Path) -> Result<Self, KeyError> {
        fs::create_dir_all(dir).map_err(|source| KeyError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let private_path = dir.join(PRIVATE_KEY_FILE);
        let public_path = dir.join(PUBLIC_KEY_FILE);

        if private_path.exists() && public_path.exists() {
            return Self::load(&private_path, &public_path);
        }

        let _lock = DirLock::acquire(dir)?;

        // Another process may have generated the pair while we waited for the lock.
        if private_path.exists() && public_path.exists() {
            return Self::load(&private_path, &public_path);
        }

        Self::generate_and_persist(&private_path, &public_path)
    }

    fn load(private_path: &Path, public_path: &Path) -> Result<Self, KeyError> {
        let private_pem = fs::read_to_string(private_path).map_err(|source| KeyError::Io {
            path: private_path.to_path_buf(),
            source,
        })?;
        let private_key = PrivateKey::from_openssh(private_pem.as_bytes())
            .map_err(|_| KeyError::BadKey(private_path.to_path_buf()))?;

        let public_line = fs::read_to_string(public_path)
            .map_err(|source| KeyError::Io {
                path: public_path.to_path_buf(),
                source,
            })?
            .trim_end()
            .to_string();
        // Parsing validates the on-disk public key matches what we expect to hand out.
        ssh_key::PublicKey::from_openssh(&public_line)
            .map_err(|_| KeyError::BadKey(public_path.to_path_buf()))?;

        let fingerprint = Fingerprint::of(private_key.public_key());

        Ok(Self {
            private_pem: Zeroizing::new(private_pem),
            public_line,
            fingerprint,
        })
    }

    fn generate_and_persist(private_path: &Path, public_path: &Path) -> Result<Self, KeyError> {
        let private_key = PrivateKey::random(&mut rand_core::OsRng, ssh_key::Algorithm::Ed25519)
            .map_err(|_| KeyError::GenerationFailed)?;

        let private_pem = private_key
            .to_openssh(LineEnding::LF)
            .map_err(|_| KeyError::GenerationFailed)?;
        let public_line = private_key
            .public_key()
            .to_openssh()
            .map_err(|_| KeyError::GenerationFailed)?;

        write_atomic(private_path, private_pem.as_bytes(), 0o600)?;
        write_atomic(public_path, format!("{public_line}\n").as_bytes(), 0o644)?;

        let fingerprint = Fingerprint::of(private_key.public_key());

        Ok(Self {
            private_pem: Zeroizing::new(private_pem.to_string()),
            public_line,
            fingerprint,
        })
    }

    /// The private key, PEM-encoded OpenSSH form, suitable for
    /// `russh_keys::decode_secret_key`.
    pub fn private_pem(&self) -> &str {
        &self.private_pem
    }

    /// The public key in single-line `authorized_keys` format (no trailing newline).
    pub fn public_key_authorized_format(&self) -> &str {
        &self.public_line
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}

/// Write `contents` to `path` via create-new-then-rename so a crash never
/// leaves a torn file in place of an existing key.
fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> Result<(), KeyError> {
    let tmp_path = path.with_extension(format!("tmp-{}", std::process::id()));

    let write_result = (|| -> std::io::Result<()> {
        {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&tmp_path)?;
            use std::io::Write;
            file.write_all(contents)?;
            file.sync_all()?;
            set_mode(&file, mode)?;
        }
        fs::rename(&tmp_path, path)?;
        Ok(())
    })();

    write_result.map_err(|source| {
        let _ = fs::remove_file(&tmp_path);
        KeyError::Io {
            path: path.to_path_buf(),
            source,
        }
    })
}

#[cfg(unix)]
fn set_mode(file: &fs::File, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_file: &fs::File, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

/// Advisory exclusive lock over a key directory, held for the duration of
/// a generate-and-persist section.
struct DirLock {
    path: PathBuf,
}

impl DirLock {
    fn acquire(dir: &Path) -> Result<Self, KeyError> {
        let path = dir.join(LOCK_FILE);
        for _ in 0..LOCK_RETRY_ATTEMPTS {
            match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    std::thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(source) => {
                    return Err(KeyError::Io {
                        path: path.clone(),
                        source,
                    })
                }
            }
        }
        Err(KeyError::LockUnavailable(path))
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_then_loads_idempotently() {
        let dir = tempfile::tempdir().unwrap();

        let first = KeyStore::ensure(dir.path()).unwrap();
        let second = KeyStore::ensure(dir.path()).unwrap();

        assert_eq!(first.private_pem(), second.private_pem());
        assert_eq!(
            first.public_key_authorized_format(),
            second.public_key_authorized_format()
        );
        assert_eq!(first.fingerprint(), second.fingerprint());
    }

    #[test]
    fn files_have_expected_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let _store = KeyStore::ensure(dir.path()).unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let private_mode = fs::metadata(dir.path().join(PRIVATE_KEY_FILE))
                .unwrap()
                .permissions()
                .mode()
                & 0o777;
            let public_mode = fs::metadata(dir.path().join(PUBLIC_KEY_FILE))
                .unwrap()
                .permissions()
                .mode()
                & 0o777;
            assert_eq!(private_mode, 0o600);
            assert_eq!(public_mode, 0o644);
        }
    }

    #[test]
    fn fingerprint_has_expected_shape() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::ensure(dir.path()).unwrap();
        assert!(store.fingerprint().as_str().starts_with("SHA256:"));
    }

    #[test]
    fn distinct_directories_yield_distinct_fingerprints() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();

        let a = KeyStore::ensure(dir_a.path()).unwrap();
        let b = KeyStore::ensure(dir_b.path()).unwrap();

        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn corrupt_private_key_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(PRIVATE_KEY_FILE), b"not a key").unwrap();
        fs::write(dir.path().join(PUBLIC_KEY_FILE), b"not a key either\n").unwrap();

        let result = KeyStore::ensure(dir.path());
        assert!(matches!(result, Err(KeyError::BadKey(_))));
    }
}
