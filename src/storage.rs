//! Request/Artifact Store
//!
//! The authority exchanges every artifact (requests, certificates, CRLs, key
//! material, configuration) through named drop folders. [`ArtifactStore`]
//! abstracts those folders so the engine runs unchanged against the
//! filesystem ([`FsArtifactStore`]) or memory ([`MemoryArtifactStore`]).
//!
//! # Archive contract
//!
//! Superseded artifacts are never overwritten in place. `archive` moves them
//! to the folder's `.old` sub-folder under a `YYYY-MM-DD_HH-MM-SS_` UTC
//! prefix. Archiving an artifact that does not exist is a no-op.
//!
//! # Filesystem layout
//! ```text
//! <store>/config.json            Authority
//! <store>/private/               PrivateKey
//! <store>/revoked/               Revoked
//! <store>/issued/                CertificateStore
//! <store>/crl/                   Crl
//! <work>/requests[/<profile>]/   Requests(profile)
//! <work>/requests/ca/            CaRequestOut
//! <work>/revoke/                 Revoke
//! <work>/certificates/           Issued
//! <work>/certificates/ca/        CaCertificateIn
//! <work>/publish/                Publish
//! ```

use crate::error::{AuthorityError, Result};
use crate::profiles::Profile;
use chrono::Utc;
use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

const ARCHIVE_DIR: &str = ".old";
const ARCHIVE_PREFIX_FORMAT: &str = "%Y-%m-%d_%H-%M-%S_";

/// Drop-folder roles used by the authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Folder {
    /// Authority configuration (`config.json`).
    Authority,
    /// Encrypted key and nonce.
    PrivateKey,
    /// Durable revoked-set.
    Revoked,
    /// Canonical CA certificate and every issued certificate.
    CertificateStore,
    /// Generated CRLs, `<number>.crl`.
    Crl,
    /// Pending request inbox for a profile.
    Requests(Profile),
    /// Revocation request inbox.
    Revoke,
    /// Issued certificate outbox.
    Issued,
    /// AIA/CDP-facing publish outbox.
    Publish,
    /// Outbound subordinate CA request.
    CaRequestOut,
    /// Parent-issued certificate hand-off inbox.
    CaCertificateIn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Area {
    Store,
    Work,
}

impl Folder {
    /// Every folder role, request inboxes included.
    pub fn all() -> Vec<Folder> {
        let mut folders = vec![
            Folder::Authority,
            Folder::PrivateKey,
            Folder::Revoked,
            Folder::CertificateStore,
            Folder::Crl,
            Folder::Revoke,
            Folder::Issued,
            Folder::Publish,
            Folder::CaRequestOut,
            Folder::CaCertificateIn,
        ];
        folders.extend(Profile::ALL.iter().map(|p| Folder::Requests(*p)));
        folders
    }

    fn location(&self) -> (Area, PathBuf) {
        match self {
            Folder::Authority => (Area::Store, PathBuf::new()),
            Folder::PrivateKey => (Area::Store, PathBuf::from("private")),
            Folder::Revoked => (Area::Store, PathBuf::from("revoked")),
            Folder::CertificateStore => (Area::Store, PathBuf::from("issued")),
            Folder::Crl => (Area::Store, PathBuf::from("crl")),
            Folder::Requests(profile) => match profile.folder_name() {
                Some(name) => (Area::Work, Path::new("requests").join(name)),
                None => (Area::Work, PathBuf::from("requests")),
            },
            Folder::Revoke => (Area::Work, PathBuf::from("revoke")),
            Folder::Issued => (Area::Work, PathBuf::from("certificates")),
            Folder::Publish => (Area::Work, PathBuf::from("publish")),
            Folder::CaRequestOut => (Area::Work, Path::new("requests").join("ca")),
            Folder::CaCertificateIn => (Area::Work, Path::new("certificates").join("ca")),
        }
    }
}

/// A named artifact read from a folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub name: String,
    pub data: Vec<u8>,
}

pub trait ArtifactStore {
    /// Regular artifacts of a folder, sorted by name. Artifacts that cannot
    /// be read are left out.
    fn list(&self, folder: Folder) -> Result<Vec<Artifact>>;

    fn read(&self, folder: Folder, name: &str) -> Result<Option<Vec<u8>>>;

    /// Replace (or create) an artifact. Either the full content lands or the
    /// previous artifact is left intact.
    fn write(&self, folder: Folder, name: &str, data: &[u8]) -> Result<()>;

    /// Move an artifact to the folder archive with a timestamp prefix.
    fn archive(&self, folder: Folder, name: &str) -> Result<()>;

    fn delete(&self, folder: Folder, name: &str) -> Result<()>;

    /// Human readable location of a folder, for operator messages.
    fn describe(&self, folder: Folder) -> String;

    fn exists(&self, folder: Folder, name: &str) -> Result<bool> {
        Ok(self.read(folder, name)?.is_some())
    }

    /// Publish to the AIA/CDP outbox, archiving the previous version.
    fn publish(&self, name: &str, data: &[u8]) -> Result<()> {
        self.archive(Folder::Publish, name)?;
        self.write(Folder::Publish, name, data)
    }
}

fn validate_name(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if invalid {
        return Err(AuthorityError::io(
            name,
            std::io::Error::new(ErrorKind::InvalidInput, "invalid artifact name"),
        ));
    }
    Ok(())
}

fn archive_prefix() -> String {
    Utc::now().format(ARCHIVE_PREFIX_FORMAT).to_string()
}

// ================= Filesystem store =================

/// Drop folders on the local filesystem.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    store_path: PathBuf,
    work_path: PathBuf,
}

impl FsArtifactStore {
    pub fn new(store_path: impl Into<PathBuf>, work_path: impl Into<PathBuf>) -> Self {
        Self {
            store_path: store_path.into(),
            work_path: work_path.into(),
        }
    }

    /// `<root>/store` and `<root>/work`.
    pub fn from_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self::new(root.join("store"), root.join("work"))
    }

    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    pub fn work_path(&self) -> &Path {
        &self.work_path
    }

    pub fn folder_path(&self, folder: Folder) -> PathBuf {
        let (area, relative) = folder.location();
        match area {
            Area::Store => self.store_path.join(relative),
            Area::Work => self.work_path.join(relative),
        }
    }

    /// Create every drop folder. Store folders are private to the owner,
    /// work folders are group writable.
    pub fn setup_folders(&self) -> Result<()> {
        for folder in Folder::all() {
            let path = self.folder_path(folder);
            fs::create_dir_all(&path).map_err(|e| AuthorityError::io(path.display().to_string(), e))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mode = match folder.location().0 {
                    Area::Store => 0o700,
                    Area::Work => 0o775,
                };
                fs::set_permissions(&path, fs::Permissions::from_mode(mode))
                    .map_err(|e| AuthorityError::io(path.display().to_string(), e))?;
            }
            debug!("Created {:?} directory at {}", folder, path.display());
        }
        Ok(())
    }

    fn artifact_path(&self, folder: Folder, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.folder_path(folder).join(name))
    }
}

impl ArtifactStore for FsArtifactStore {
    fn list(&self, folder: Folder) -> Result<Vec<Artifact>> {
        let dir = self.folder_path(folder);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AuthorityError::io(dir.display().to_string(), e)),
        };

        let mut artifacts = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| AuthorityError::io(dir.display().to_string(), e))?;
            let path = entry.path();
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') || !path.is_file() {
                continue;
            }
            match fs::read(&path) {
                Ok(data) => artifacts.push(Artifact { name, data }),
                Err(e) => warn!("Skipped unreadable file {}: {}", path.display(), e),
            }
        }
        artifacts.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(artifacts)
    }

    fn read(&self, folder: Folder, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.artifact_path(folder, name)?;
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AuthorityError::io(path.display().to_string(), e)),
        }
    }

    fn write(&self, folder: Folder, name: &str, data: &[u8]) -> Result<()> {
        let path = self.artifact_path(folder, name)?;
        let dir = self.folder_path(folder);
        let io_err = |e: std::io::Error| AuthorityError::io(path.display().to_string(), e);

        fs::create_dir_all(&dir).map_err(io_err)?;
        let mut tmp = NamedTempFile::new_in(&dir).map_err(io_err)?;
        tmp.write_all(data).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = match folder.location().0 {
                Area::Store => 0o600,
                Area::Work => 0o644,
            };
            tmp.as_file()
                .set_permissions(fs::Permissions::from_mode(mode))
                .map_err(io_err)?;
        }
        tmp.persist(&path).map_err(|e| io_err(e.error))?;
        debug!("Wrote {} bytes to {}", data.len(), path.display());
        Ok(())
    }

    fn archive(&self, folder: Folder, name: &str) -> Result<()> {
        let src = self.artifact_path(folder, name)?;
        if !src.exists() {
            return Ok(());
        }
        let archive_dir = self.folder_path(folder).join(ARCHIVE_DIR);
        fs::create_dir_all(&archive_dir)
            .map_err(|e| AuthorityError::io(archive_dir.display().to_string(), e))?;

        let prefix = archive_prefix();
        let mut target = archive_dir.join(format!("{}{}", prefix, name));
        let mut attempt = 1;
        while target.exists() {
            target = archive_dir.join(format!("{}{}_{}", prefix, attempt, name));
            attempt += 1;
        }
        fs::rename(&src, &target).map_err(|e| AuthorityError::io(src.display().to_string(), e))?;
        debug!("Moved file to {}", target.display());
        Ok(())
    }

    fn delete(&self, folder: Folder, name: &str) -> Result<()> {
        let path = self.artifact_path(folder, name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AuthorityError::io(path.display().to_string(), e)),
        }
    }

    fn describe(&self, folder: Folder) -> String {
        self.folder_path(folder).display().to_string()
    }
}

// ================= In-memory store =================

#[derive(Debug, Default)]
struct MemoryState {
    live: BTreeMap<(Folder, String), Vec<u8>>,
    archived: BTreeMap<(Folder, String), Vec<u8>>,
    read_only: Vec<Folder>,
}

/// In-memory drop folders. Clones share the same state, so a test can keep
/// a handle while the authority owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryArtifactStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Names of archived artifacts in a folder (with their timestamp prefix).
    pub fn archived(&self, folder: Folder) -> Vec<String> {
        self.state()
            .archived
            .keys()
            .filter(|(f, _)| *f == folder)
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Make writes to a folder fail, to simulate storage faults.
    pub fn set_read_only(&self, folder: Folder, read_only: bool) {
        let mut state = self.state();
        state.read_only.retain(|f| *f != folder);
        if read_only {
            state.read_only.push(folder);
        }
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn list(&self, folder: Folder) -> Result<Vec<Artifact>> {
        Ok(self
            .state()
            .live
            .iter()
            .filter(|((f, _), _)| *f == folder)
            .map(|((_, name), data)| Artifact {
                name: name.clone(),
                data: data.clone(),
            })
            .collect())
    }

    fn read(&self, folder: Folder, name: &str) -> Result<Option<Vec<u8>>> {
        validate_name(name)?;
        Ok(self.state().live.get(&(folder, name.to_string())).cloned())
    }

    fn write(&self, folder: Folder, name: &str, data: &[u8]) -> Result<()> {
        validate_name(name)?;
        let mut state = self.state();
        if state.read_only.contains(&folder) {
            return Err(AuthorityError::io(
                format!("{:?}/{}", folder, name),
                std::io::Error::new(ErrorKind::PermissionDenied, "folder is read-only"),
            ));
        }
        state.live.insert((folder, name.to_string()), data.to_vec());
        Ok(())
    }

    fn archive(&self, folder: Folder, name: &str) -> Result<()> {
        validate_name(name)?;
        let mut state = self.state();
        if let Some(data) = state.live.remove(&(folder, name.to_string())) {
            let prefix = archive_prefix();
            let mut archived_name = format!("{}{}", prefix, name);
            let mut attempt = 1;
            while state.archived.contains_key(&(folder, archived_name.clone())) {
                archived_name = format!("{}{}_{}", prefix, attempt, name);
                attempt += 1;
            }
            state.archived.insert((folder, archived_name), data);
        }
        Ok(())
    }

    fn delete(&self, folder: Folder, name: &str) -> Result<()> {
        validate_name(name)?;
        self.state().live.remove(&(folder, name.to_string()));
        Ok(())
    }

    fn describe(&self, folder: Folder) -> String {
        format!("memory:{:?}", folder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise_store(store: &impl ArtifactStore) {
        let inbox = Folder::Requests(Profile::WebServer);
        store.write(inbox, "b.csr", b"second").unwrap();
        store.write(inbox, "a.csr", b"first").unwrap();

        let names: Vec<String> = store
            .list(inbox)
            .unwrap()
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(names, vec!["a.csr", "b.csr"]);

        store.archive(inbox, "a.csr").unwrap();
        assert!(!store.exists(inbox, "a.csr").unwrap());
        assert_eq!(store.list(inbox).unwrap().len(), 1);

        // archiving something missing is a no-op
        store.archive(inbox, "missing.csr").unwrap();

        store.delete(inbox, "b.csr").unwrap();
        store.delete(inbox, "b.csr").unwrap();
        assert!(store.list(inbox).unwrap().is_empty());

        store.publish("Test CA.crl", b"v1").unwrap();
        store.publish("Test CA.crl", b"v2").unwrap();
        assert_eq!(
            store.read(Folder::Publish, "Test CA.crl").unwrap(),
            Some(b"v2".to_vec())
        );
    }

    #[test]
    fn test_memory_store_contract() {
        let store = MemoryArtifactStore::new();
        exercise_store(&store);
        let archived = store.archived(Folder::Requests(Profile::WebServer));
        assert_eq!(archived.len(), 1);
        assert!(archived[0].ends_with("_a.csr"));
        assert_eq!(store.archived(Folder::Publish).len(), 1);
    }

    #[test]
    fn test_fs_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::from_root(dir.path());
        store.setup_folders().unwrap();
        exercise_store(&store);

        let archive_dir = store
            .folder_path(Folder::Requests(Profile::WebServer))
            .join(ARCHIVE_DIR);
        let archived: Vec<_> = fs::read_dir(archive_dir).unwrap().collect();
        assert_eq!(archived.len(), 1);
    }

    #[test]
    fn test_fs_list_skips_subfolders() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::from_root(dir.path());
        store.setup_folders().unwrap();
        store
            .write(Folder::Requests(Profile::Generic), "plain.csr", b"x")
            .unwrap();
        store
            .write(Folder::Requests(Profile::Client), "client.csr", b"y")
            .unwrap();

        let generic = store.list(Folder::Requests(Profile::Generic)).unwrap();
        assert_eq!(generic.len(), 1);
        assert_eq!(generic[0].name, "plain.csr");
    }

    #[test]
    fn test_rejects_path_traversal() {
        let store = MemoryArtifactStore::new();
        assert!(store.write(Folder::Issued, "../escape.cer", b"x").is_err());
        assert!(store.write(Folder::Issued, "..", b"x").is_err());
        assert!(store.read(Folder::Issued, "").is_err());
    }

    #[test]
    fn test_read_only_folder() {
        let store = MemoryArtifactStore::new();
        store.set_read_only(Folder::Authority, true);
        assert!(store.write(Folder::Authority, "config.json", b"{}").is_err());
        store.set_read_only(Folder::Authority, false);
        assert!(store.write(Folder::Authority, "config.json", b"{}").is_ok());
    }

    #[test]
    fn test_fs_missing_folder_lists_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::from_root(dir.path());
        assert!(store.list(Folder::Revoke).unwrap().is_empty());
        assert_eq!(store.read(Folder::Crl, "1.crl").unwrap(), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_fs_list_skips_unreadable_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::from_root(dir.path());
        store.setup_folders().unwrap();
        let inbox = Folder::Requests(Profile::Server);
        store.write(inbox, "a.csr", b"first").unwrap();
        store.write(inbox, "c.csr", b"third").unwrap();
        // a regular file whose read fails with EIO, regardless of privileges
        std::os::unix::fs::symlink("/proc/self/mem", store.folder_path(inbox).join("b.csr")).unwrap();

        let names: Vec<String> = store.list(inbox).unwrap().into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["a.csr", "c.csr"]);
    }
}
