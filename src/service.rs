//! LFS operations shared by the HTTP API and the SSH transfer protocol.
//!
//! All methods are blocking; the HTTP layer runs them on the blocking pool.

use std::collections::BTreeMap;
use std::io::{self, Read};
use std::sync::Arc;

use chrono::Utc;

use crate::batch::{BatchResponse, Link, ObjectError, ObjectResponse, Operation};
use crate::chunks::{ChunkStore, MergeOutcome};
use crate::content_store::ContentStore;
use crate::lock::{LockBackend, LockStore};
use crate::meta::{MetaObject, MetaStore};
use crate::oid::HashingReader;
use crate::range::{ByteRange, ContentRange};
use crate::repo::{AccessControl, AccessMode, Principal, Repository, RepositoryStore};
use crate::storage::{Object, UrlParams};
use crate::token::{Scope, TokenSigner};
use crate::{Error, Pointer, Result};

/// Tunables of the LFS service.
#[derive(Debug, Clone)]
pub struct LfsOptions {
    /// Public base URL, ending in `/`.
    pub app_url: String,
    /// Largest accepted object; 0 for no limit.
    pub max_file_size: i64,
    /// Hand out backend URLs for downloads when the backend supports them.
    pub serve_direct: bool,
    pub locking: bool,
    pub locks_paging_num: usize,
}

impl Default for LfsOptions {
    fn default() -> Self {
        LfsOptions {
            app_url: "http://localhost:3000/".into(),
            max_file_size: 0,
            serve_direct: false,
            locking: true,
            locks_paging_num: 50,
        }
    }
}

/// How a request presented itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Anonymous,
    Basic { username: String, password: String },
    Bearer(String),
    /// Already authenticated by the transport (SSH).
    Principal(Principal),
}

/// A repository together with the principal acting on it.
#[derive(Debug, Clone)]
pub struct Access {
    pub repo: Repository,
    pub principal: Option<Principal>,
}

/// Result of negotiating one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItem {
    pub pointer: Pointer,
    /// The object is stored and linked to the repository.
    pub present: bool,
    /// Extra `key=value` arguments echoed back on the SSH transport.
    pub args: BTreeMap<String, String>,
    pub error: Option<ObjectError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    Stored,
    /// A resumable upload still misses bytes from `received` on.
    Partial { received: i64 },
}

/// An opened object, positioned at `from`.
pub struct Download {
    pub pointer: Pointer,
    pub object: Box<dyn Object>,
    pub from: i64,
    /// Inclusive.
    pub to: i64,
    pub partial: bool,
}

impl Download {
    pub fn len(&self) -> i64 {
        self.to - self.from + 1
    }

    pub fn is_empty(&self) -> bool {
        self.to < self.from
    }
}

#[derive(Clone)]
pub struct LfsService {
    content: ContentStore,
    chunks: ChunkStore,
    meta: Arc<dyn MetaStore>,
    repos: Arc<dyn RepositoryStore>,
    access: Arc<dyn AccessControl>,
    locks: Arc<dyn LockStore>,
    tokens: TokenSigner,
    options: LfsOptions,
}

impl LfsService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        content: ContentStore,
        meta: Arc<dyn MetaStore>,
        repos: Arc<dyn RepositoryStore>,
        access: Arc<dyn AccessControl>,
        locks: Arc<dyn LockStore>,
        tokens: TokenSigner,
        mut options: LfsOptions,
    ) -> Self {
        if !options.app_url.ends_with('/') {
            options.app_url.push('/');
        }
        LfsService {
            chunks: ChunkStore::new(content.storage().clone()),
            content,
            meta,
            repos,
            access,
            locks,
            tokens,
            options,
        }
    }

    pub fn options(&self) -> &LfsOptions {
        &self.options
    }

    pub fn content(&self) -> &ContentStore {
        &self.content
    }

    /// Resolve the repository and check that the caller may perform `op`.
    ///
    /// The caller's own permissions are checked first; a bearer token is only
    /// consulted when they are not sufficient. Read operations accept a token
    /// of any scope, writes need an upload token, verification accepts an
    /// upload or verify token.
    pub fn authorize(
        &self,
        owner: &str,
        name: &str,
        credentials: &Credentials,
        op: Scope,
    ) -> Result<Access> {
        let repo = self.repos.by_owner_and_name(owner, name)?;
        let mode = match op {
            Scope::Download => AccessMode::Read,
            Scope::Upload | Scope::Verify => AccessMode::Write,
        };

        let principal = match credentials {
            Credentials::Anonymous | Credentials::Bearer(_) => None,
            Credentials::Basic { username, password } => Some(
                self.access
                    .authenticate_basic(username, password)
                    .ok_or_else(|| Error::Unauthorized("invalid credentials".into()))?,
            ),
            Credentials::Principal(p) => Some(p.clone()),
        };
        if self.access.can_access(principal.as_ref(), &repo, mode) {
            return Ok(Access { repo, principal });
        }

        let Credentials::Bearer(token) = credentials else {
            return Err(match principal {
                Some(p) => Error::PermissionDenied(format!(
                    "{} may not access {}",
                    p.name,
                    repo.full_name()
                )),
                None => Error::Unauthorized("authentication required".into()),
            });
        };

        let claims = self.tokens.verify(token)?;
        if claims.repo_id != repo.id {
            return Err(Error::PermissionDenied("token is for another repository".into()));
        }
        let scope_ok = match op {
            Scope::Download => true,
            Scope::Upload => claims.op == Scope::Upload,
            Scope::Verify => matches!(claims.op, Scope::Upload | Scope::Verify),
        };
        if !scope_ok {
            return Err(Error::PermissionDenied(format!(
                "token does not grant {:?}",
                op
            )));
        }
        let principal = self
            .access
            .principal_by_id(claims.user_id)
            .ok_or_else(|| Error::Unauthorized("token user no longer exists".into()))?;
        Ok(Access {
            repo,
            principal: Some(principal),
        })
    }

    /// Whether `principal` can read some repository other than `except`
    /// holding `oid`.
    fn accessible_elsewhere(
        &self,
        principal: Option<&Principal>,
        oid: &str,
        except: &Repository,
    ) -> Result<bool> {
        for repo_id in self.meta.repositories_with(oid)? {
            if repo_id == except.id {
                continue;
            }
            let repo = match self.repos.by_id(repo_id) {
                Ok(repo) => repo,
                Err(Error::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if self.access.can_access(principal, &repo, AccessMode::Read) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Decide per object whether it must be transferred.
    pub fn negotiate(
        &self,
        access: &Access,
        operation: Operation,
        pointers: &[Pointer],
    ) -> Result<Vec<BatchItem>> {
        let mut items = Vec::with_capacity(pointers.len());
        for pointer in pointers {
            items.push(self.negotiate_one(access, operation, pointer)?);
        }
        Ok(items)
    }

    fn negotiate_one(
        &self,
        access: &Access,
        operation: Operation,
        pointer: &Pointer,
    ) -> Result<BatchItem> {
        let item = |present: bool, error: Option<ObjectError>| BatchItem {
            pointer: pointer.clone(),
            present,
            args: BTreeMap::new(),
            error,
        };
        let object_error = |code: u16, message: String| Some(ObjectError { code, message });

        if !pointer.is_valid() {
            return Ok(item(
                false,
                object_error(422, "Oid or size are invalid".into()),
            ));
        }

        let exists = self.content.exists(pointer)?;
        let meta = self.meta.get(access.repo.id, &pointer.oid)?;
        if let Some(meta) = &meta {
            if meta.pointer.size != pointer.size {
                return Ok(item(
                    false,
                    object_error(
                        422,
                        format!("Object {} is not {} bytes", pointer.oid, pointer.size),
                    ),
                ));
            }
        }

        let principal = access.principal.as_ref();
        let mut linked = meta.is_some();
        match operation {
            Operation::Upload => {
                if exists
                    && !linked
                    && self.accessible_elsewhere(principal, &pointer.oid, &access.repo)?
                {
                    self.meta.create(access.repo.id, pointer)?;
                    linked = true;
                }
                let present = exists && linked;
                let max = self.options.max_file_size;
                if !present && max > 0 && pointer.size > max {
                    return Ok(item(
                        false,
                        object_error(
                            422,
                            format!("Size must be less than or equal to {}", max),
                        ),
                    ));
                }
                Ok(item(present, None))
            }
            Operation::Download => {
                if exists
                    && !linked
                    && self.accessible_elsewhere(principal, &pointer.oid, &access.repo)?
                    && self.content.verify(pointer)?
                {
                    self.meta.create(access.repo.id, pointer)?;
                    linked = true;
                }
                if exists && linked {
                    Ok(item(true, None))
                } else {
                    Ok(item(false, object_error(404, "Not Found".into())))
                }
            }
        }
    }

    fn repo_url(&self, repo: &Repository) -> String {
        format!(
            "{}{}/{}.git/info/lfs/",
            self.options.app_url, repo.owner, repo.name
        )
    }

    fn token_link(&self, access: &Access, href: String, scope: Scope) -> Result<Link> {
        let mut header = BTreeMap::new();
        let mut expires_at = None;
        if let Some(principal) = &access.principal {
            let token = self.tokens.issue(access.repo.id, scope, principal.id)?;
            header.insert("Authorization".to_string(), format!("Bearer {}", token));
            expires_at = Some(Utc::now() + chrono::Duration::seconds(self.tokens.ttl().as_secs() as i64));
        }
        Ok(Link {
            href,
            header,
            expires_at,
        })
    }

    fn download_link(&self, access: &Access, pointer: &Pointer) -> Result<Link> {
        if self.options.serve_direct {
            let params = UrlParams {
                expires_in: self.tokens.ttl(),
            };
            match self
                .content
                .storage()
                .url(&pointer.relative_path(), &pointer.oid, &params)
            {
                Ok(url) => {
                    return Ok(Link {
                        href: url.to_string(),
                        header: BTreeMap::new(),
                        expires_at: Some(
                            Utc::now() + chrono::Duration::seconds(params.expires_in.as_secs() as i64),
                        ),
                    })
                }
                Err(Error::UrlNotSupported) => {}
                Err(e) => {
                    tracing::warn!(oid = %pointer.oid, error = %e, "direct URL failed, proxying");
                }
            }
        }
        let href = format!("{}objects/{}", self.repo_url(&access.repo), pointer.oid);
        self.token_link(access, href, Scope::Download)
    }

    /// Build the HTTP batch response for negotiated items.
    pub fn batch_response(
        &self,
        access: &Access,
        operation: Operation,
        items: Vec<BatchItem>,
    ) -> Result<BatchResponse> {
        let mut objects = Vec::with_capacity(items.len());
        for item in items {
            if let Some(error) = item.error {
                objects.push(ObjectResponse::with_error(item.pointer, error.code, error.message));
                continue;
            }
            let mut actions = BTreeMap::new();
            match operation {
                Operation::Download => {
                    actions.insert("download".to_string(), self.download_link(access, &item.pointer)?);
                }
                Operation::Upload if !item.present => {
                    let base = self.repo_url(&access.repo);
                    let upload = format!("{}objects/{}/{}", base, item.pointer.oid, item.pointer.size);
                    actions.insert("upload".to_string(), self.token_link(access, upload, Scope::Upload)?);
                    let verify = format!("{}verify", base);
                    actions.insert("verify".to_string(), self.token_link(access, verify, Scope::Verify)?);
                }
                Operation::Upload => {}
            }
            objects.push(ObjectResponse {
                pointer: item.pointer,
                authenticated: access.principal.as_ref().map(|_| true),
                actions,
                error: None,
            });
        }
        Ok(BatchResponse::new(objects))
    }

    /// Receive object content.
    ///
    /// With `range`, the body is one chunk of a resumable upload; the object
    /// is assembled and verified once every chunk has arrived.
    pub fn upload(
        &self,
        access: &Access,
        pointer: &Pointer,
        reader: &mut dyn Read,
        range: Option<&ContentRange>,
    ) -> Result<UploadStatus> {
        pointer.validate()?;
        let repo = &access.repo;

        if let Some(meta) = self.meta.get(repo.id, &pointer.oid)? {
            if meta.pointer.size != pointer.size {
                return Err(Error::SizeMismatch {
                    expected: meta.pointer.size,
                    actual: pointer.size,
                });
            }
            if self.content.exists(pointer)? {
                return Ok(UploadStatus::Stored);
            }
        }

        // An object stored for some other repository the caller cannot read
        // is only linked once the caller has sent matching bytes.
        let stored = self.content.exists(pointer)?;
        let prove = stored
            && !self.accessible_elsewhere(access.principal.as_ref(), &pointer.oid, repo)?;
        if stored && !prove {
            self.meta.create(repo.id, pointer)?;
            tracing::info!(repo = %repo.full_name(), oid = %pointer.oid, "existing object linked");
            return Ok(UploadStatus::Stored);
        }

        let max = self.options.max_file_size;
        if !stored && max > 0 && pointer.size > max {
            return Err(Error::TooLarge {
                size: pointer.size,
                max,
            });
        }

        let receive = |r: &mut dyn Read| -> Result<i64> {
            if prove {
                prove_possession(pointer, r)
            } else {
                self.content.put(pointer, r).map(|()| pointer.size)
            }
        };

        match range {
            None => {
                receive(reader)?;
            }
            Some(range) => {
                if range.total != pointer.size {
                    return Err(Error::InvalidRange(format!(
                        "{} does not match object size {}",
                        range, pointer.size
                    )));
                }
                self.chunks.save_chunk(&pointer.oid, range, reader, None)?;
                match self.chunks.merge(&pointer.oid, pointer.size, receive) {
                    Ok(MergeOutcome::Merged { .. }) => {}
                    Ok(MergeOutcome::Incomplete { received }) => {
                        return Ok(UploadStatus::Partial { received })
                    }
                    Err(err @ Error::HashMismatch { .. }) => {
                        // The assembled bytes are wrong; start over.
                        self.chunks.discard(&pointer.oid)?;
                        return Err(err);
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        self.meta.create(repo.id, pointer)?;
        tracing::info!(repo = %repo.full_name(), oid = %pointer.oid, size = pointer.size, "object uploaded");
        Ok(UploadStatus::Stored)
    }

    fn linked_meta(&self, access: &Access, oid: &str) -> Result<MetaObject> {
        if !Pointer::new(oid, 0).is_valid() {
            return Err(Error::InvalidPointer(format!("oid {:?}", oid)));
        }
        self.meta
            .get(access.repo.id, oid)?
            .ok_or_else(|| Error::NotFound(format!("object {}", oid)))
    }

    /// Open a linked object for download, honouring an optional range.
    pub fn download(
        &self,
        access: &Access,
        oid: &str,
        range: Option<ByteRange>,
    ) -> Result<Download> {
        let meta = self.linked_meta(access, oid)?;
        let size = meta.pointer.size;
        let (from, to, partial) = match range {
            Some(range) => {
                let (from, to) = range.resolve(size)?;
                (from, to, true)
            }
            None => (0, size - 1, false),
        };
        let object = self.content.get(&meta.pointer, from).map_err(|e| {
            if e.is_not_exist() {
                Error::NotFound(format!("object {}", oid))
            } else {
                e
            }
        })?;
        Ok(Download {
            pointer: meta.pointer,
            object,
            from,
            to,
            partial,
        })
    }

    /// The object is linked and stored with the right size.
    pub fn verify(&self, access: &Access, pointer: &Pointer) -> Result<()> {
        pointer.validate()?;
        let meta = self.linked_meta(access, &pointer.oid)?;
        if meta.pointer.size != pointer.size || !self.content.verify(pointer)? {
            return Err(Error::NotFound(format!("object {}", pointer.oid)));
        }
        Ok(())
    }

    /// Like [`verify`](Self::verify), re-hashing the stored content.
    pub fn verify_content(&self, access: &Access, pointer: &Pointer) -> Result<bool> {
        pointer.validate()?;
        match self.meta.get(access.repo.id, &pointer.oid)? {
            Some(meta) if meta.pointer.size == pointer.size => {
                self.content.verify_content(pointer)
            }
            _ => Ok(false),
        }
    }

    /// Lock operations for the caller. Locking needs a known principal.
    pub fn lock_backend(&self, access: &Access) -> Result<LockBackend> {
        if !self.options.locking {
            return Err(Error::NotFound("locking is disabled".into()));
        }
        let principal = access
            .principal
            .clone()
            .ok_or_else(|| Error::Unauthorized("locking requires authentication".into()))?;
        Ok(LockBackend::new(
            self.locks.clone(),
            access.repo.clone(),
            principal,
        ))
    }

    pub fn tokens(&self) -> &TokenSigner {
        &self.tokens
    }
}

/// Hash the client's bytes without storing them; they must match `pointer`.
fn prove_possession(pointer: &Pointer, reader: &mut dyn Read) -> Result<i64> {
    let mut hashing = HashingReader::new(reader);
    io::copy(&mut hashing, &mut io::sink()).map_err(Error::from_io)?;
    let (oid, count) = hashing.finish();
    if count as i64 != pointer.size {
        return Err(Error::SizeMismatch {
            expected: pointer.size,
            actual: count as i64,
        });
    }
    if oid.to_hex() != pointer.oid {
        return Err(Error::HashMismatch {
            expected: pointer.oid.clone(),
            actual: oid.to_hex(),
        });
    }
    Ok(pointer.size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::MemoryLockStore;
    use crate::meta::MemoryMetaStore;
    use crate::repo::{RepositoryConfig, StaticDirectory, UserConfig};
    use crate::storage::MemoryStorage;
    use std::time::Duration;

    struct Fixture {
        service: LfsService,
        meta: Arc<MemoryMetaStore>,
    }

    fn fixture(max_file_size: i64) -> Fixture {
        let users = vec![
            UserConfig {
                name: "alice".into(),
                password: "pw".into(),
                is_admin: false,
            },
            UserConfig {
                name: "bob".into(),
                password: "pw".into(),
                is_admin: false,
            },
        ];
        let repo = |owner: &str, name: &str| RepositoryConfig {
            owner: owner.into(),
            name: name.into(),
            public: false,
            readers: vec![],
            writers: vec![],
        };
        let dir = Arc::new(
            StaticDirectory::new(
                &users,
                &[repo("alice", "one"), repo("alice", "two"), repo("bob", "three")],
            )
            .unwrap(),
        );
        let meta = Arc::new(MemoryMetaStore::new());
        let service = LfsService::new(
            ContentStore::new(Arc::new(MemoryStorage::new())),
            meta.clone(),
            dir.clone(),
            dir,
            Arc::new(MemoryLockStore::new()),
            TokenSigner::new("secret", Duration::from_secs(60)).unwrap(),
            LfsOptions {
                max_file_size,
                ..LfsOptions::default()
            },
        );
        Fixture { service, meta }
    }

    fn basic(user: &str) -> Credentials {
        Credentials::Basic {
            username: user.into(),
            password: "pw".into(),
        }
    }

    fn access(f: &Fixture, user: &str, owner: &str, name: &str) -> Access {
        f.service
            .authorize(owner, name, &basic(user), Scope::Upload)
            .unwrap()
    }

    #[test]
    fn test_authorize() {
        let f = fixture(0);
        assert!(matches!(
            f.service.authorize("alice", "one", &Credentials::Anonymous, Scope::Download),
            Err(Error::Unauthorized(_))
        ));
        assert!(matches!(
            f.service.authorize("alice", "one", &basic("bob"), Scope::Download),
            Err(Error::PermissionDenied(_))
        ));
        assert!(matches!(
            f.service.authorize("alice", "nope", &basic("alice"), Scope::Download),
            Err(Error::NotFound(_))
        ));
        let bad = Credentials::Basic {
            username: "alice".into(),
            password: "wrong".into(),
        };
        assert!(matches!(
            f.service.authorize("alice", "one", &bad, Scope::Download),
            Err(Error::Unauthorized(_))
        ));
    }

    #[test]
    fn test_authorize_with_token() {
        let f = fixture(0);
        let a = access(&f, "alice", "alice", "one");
        let token = f.service.tokens.issue(a.repo.id, Scope::Download, 1).unwrap();
        let creds = Credentials::Bearer(token);

        let got = f
            .service
            .authorize("alice", "one", &creds, Scope::Download)
            .unwrap();
        assert_eq!(got.principal.unwrap().name, "alice");
        assert!(matches!(
            f.service.authorize("alice", "one", &creds, Scope::Upload),
            Err(Error::PermissionDenied(_))
        ));
        assert!(matches!(
            f.service.authorize("alice", "two", &creds, Scope::Download),
            Err(Error::PermissionDenied(_))
        ));
        assert!(matches!(
            f.service.authorize(
                "alice",
                "one",
                &Credentials::Bearer("junk".into()),
                Scope::Download
            ),
            Err(Error::Unauthorized(_))
        ));

        let verify = Credentials::Bearer(f.service.tokens.issue(a.repo.id, Scope::Verify, 1).unwrap());
        assert!(f.service.authorize("alice", "one", &verify, Scope::Verify).is_ok());
        assert!(f.service.authorize("alice", "one", &verify, Scope::Upload).is_err());
    }

    #[test]
    fn test_upload_then_download() {
        let f = fixture(0);
        let a = access(&f, "alice", "alice", "one");
        let p = Pointer::from_content(b"0123456789");

        let items = f.service.negotiate(&a, Operation::Upload, &[p.clone()]).unwrap();
        assert!(!items[0].present);
        let response = f.service.batch_response(&a, Operation::Upload, items).unwrap();
        let upload = response.objects[0].upload_action().unwrap();
        assert!(upload.href.ends_with(&format!(
            "alice/one.git/info/lfs/objects/{}/10",
            p.oid
        )));
        assert!(upload.header["Authorization"].starts_with("Bearer "));
        assert!(response.objects[0].verify_action().is_some());

        let status = f
            .service
            .upload(&a, &p, &mut &b"0123456789"[..], None)
            .unwrap();
        assert_eq!(status, UploadStatus::Stored);
        f.service.verify(&a, &p).unwrap();

        let items = f.service.negotiate(&a, Operation::Upload, &[p.clone()]).unwrap();
        assert!(items[0].present);
        let response = f.service.batch_response(&a, Operation::Upload, items).unwrap();
        assert!(response.objects[0].actions.is_empty());

        let mut d = f
            .service
            .download(&a, &p.oid, ByteRange::parse("bytes=5-"))
            .unwrap();
        assert_eq!((d.from, d.to, d.partial), (5, 9, true));
        let mut out = String::new();
        d.object.read_to_string(&mut out).unwrap();
        assert_eq!(out, "56789");
    }

    #[test]
    fn test_negotiate_errors() {
        let f = fixture(5);
        let a = access(&f, "alice", "alice", "one");
        let small = Pointer::from_content(b"abc");
        f.service.upload(&a, &small, &mut &b"abc"[..], None).unwrap();

        let items = f
            .service
            .negotiate(
                &a,
                Operation::Upload,
                &[
                    Pointer::new("bad", 1),
                    Pointer::new(small.oid.clone(), 4),
                    Pointer::from_content(b"0123456789"),
                ],
            )
            .unwrap();
        let codes: Vec<_> = items.iter().map(|i| i.error.as_ref().map(|e| e.code)).collect();
        assert_eq!(codes, vec![Some(422), Some(422), Some(422)]);

        let items = f
            .service
            .negotiate(&a, Operation::Download, &[Pointer::from_content(b"missing")])
            .unwrap();
        assert_eq!(items[0].error.as_ref().unwrap().code, 404);
    }

    #[test]
    fn test_too_large_upload_rejected() {
        let f = fixture(5);
        let a = access(&f, "alice", "alice", "one");
        let p = Pointer::from_content(b"0123456789");
        assert!(matches!(
            f.service.upload(&a, &p, &mut &b"0123456789"[..], None),
            Err(Error::TooLarge { size: 10, max: 5 })
        ));
    }

    #[test]
    fn test_cross_repository_link_rules() {
        let f = fixture(0);
        let one = access(&f, "alice", "alice", "one");
        let two = access(&f, "alice", "alice", "two");
        let three = access(&f, "bob", "bob", "three");
        let p = Pointer::from_content(b"shared");
        f.service.upload(&one, &p, &mut &b"shared"[..], None).unwrap();

        // Alice can read "one", so the object is linked into "two".
        let items = f.service.negotiate(&two, Operation::Download, &[p.clone()]).unwrap();
        assert!(items[0].present);
        assert!(f.meta.get(two.repo.id, &p.oid).unwrap().is_some());

        // Bob cannot: download is refused and upload must send the bytes.
        let items = f.service.negotiate(&three, Operation::Download, &[p.clone()]).unwrap();
        assert_eq!(items[0].error.as_ref().unwrap().code, 404);
        let items = f.service.negotiate(&three, Operation::Upload, &[p.clone()]).unwrap();
        assert!(!items[0].present);
        assert!(f.meta.get(three.repo.id, &p.oid).unwrap().is_none());

        assert!(matches!(
            f.service.upload(&three, &p, &mut &b"sharex"[..], None),
            Err(Error::HashMismatch { .. })
        ));
        assert!(f.meta.get(three.repo.id, &p.oid).unwrap().is_none());
        f.service.upload(&three, &p, &mut &b"shared"[..], None).unwrap();
        assert!(f.meta.get(three.repo.id, &p.oid).unwrap().is_some());
    }

    #[test]
    fn test_negotiation_is_idempotent() {
        let f = fixture(0);
        let one = access(&f, "alice", "alice", "one");
        let two = access(&f, "alice", "alice", "two");
        let stored = Pointer::from_content(b"stored");
        f.service.upload(&one, &stored, &mut &b"stored"[..], None).unwrap();
        let pointers = [
            stored.clone(),
            Pointer::from_content(b"missing"),
            Pointer::new("not-an-oid", 1),
        ];

        // Actions without their tokens, which carry a timestamp.
        let hrefs = |items: Vec<BatchItem>, op: Operation| {
            let response = f.service.batch_response(&two, op, items).unwrap();
            response
                .objects
                .into_iter()
                .map(|o| {
                    let actions: Vec<_> =
                        o.actions.into_iter().map(|(name, link)| (name, link.href)).collect();
                    (o.pointer, actions, o.error.map(|e| e.code))
                })
                .collect::<Vec<_>>()
        };

        for op in [Operation::Download, Operation::Upload] {
            let first = f.service.negotiate(&two, op, &pointers).unwrap();
            let second = f.service.negotiate(&two, op, &pointers).unwrap();
            assert_eq!(first, second, "{op:?}");
            assert_eq!(hrefs(first, op), hrefs(second, op), "{op:?}");
        }

        // The first download negotiation linked the object into "two".
        assert!(f.meta.get(two.repo.id, &stored.oid).unwrap().is_some());
        let items = f.service.negotiate(&two, Operation::Upload, &pointers).unwrap();
        assert!(items[0].present);
        assert!(!items[1].present);
        assert_eq!(items[2].error.as_ref().unwrap().code, 422);
    }

    #[test]
    fn test_resumable_upload() {
        let f = fixture(0);
        let a = access(&f, "alice", "alice", "one");
        let p = Pointer::from_content(b"0123456789");

        let second = ContentRange::parse("bytes 5-9/10").unwrap();
        let status = f
            .service
            .upload(&a, &p, &mut &b"56789"[..], Some(&second))
            .unwrap();
        assert_eq!(status, UploadStatus::Partial { received: 0 });

        let first = ContentRange::parse("bytes 0-4/10").unwrap();
        let status = f
            .service
            .upload(&a, &p, &mut &b"01234"[..], Some(&first))
            .unwrap();
        assert_eq!(status, UploadStatus::Stored);
        assert!(f.service.content().verify_content(&p).unwrap());

        let short = ContentRange::parse("bytes 0-9/10").unwrap();
        let q = Pointer::from_content(b"abcdefghij");
        assert!(f
            .service
            .upload(&a, &q, &mut &b"abcdefgh"[..], Some(&short))
            .is_err());
        assert!(!f.service.content().exists(&q).unwrap());
    }

    #[test]
    fn test_resumable_upload_of_object_stored_elsewhere() {
        let f = fixture(0);
        let one = access(&f, "alice", "alice", "one");
        let three = access(&f, "bob", "bob", "three");
        let p = Pointer::from_content(b"0123456789");
        f.service.upload(&one, &p, &mut &b"0123456789"[..], None).unwrap();

        // Bob cannot read "one" and must send every byte, here in chunks.
        let first = ContentRange::parse("bytes 0-4/10").unwrap();
        let status = f
            .service
            .upload(&three, &p, &mut &b"01234"[..], Some(&first))
            .unwrap();
        assert_eq!(status, UploadStatus::Partial { received: 5 });
        assert!(f.meta.get(three.repo.id, &p.oid).unwrap().is_none());

        let second = ContentRange::parse("bytes 5-9/10").unwrap();
        let status = f
            .service
            .upload(&three, &p, &mut &b"56789"[..], Some(&second))
            .unwrap();
        assert_eq!(status, UploadStatus::Stored);
        assert!(f.meta.get(three.repo.id, &p.oid).unwrap().is_some());

        // Wrong bytes assembled from chunks are not linked.
        let q = Pointer::from_content(b"abcdefghij");
        f.service.upload(&one, &q, &mut &b"abcdefghij"[..], None).unwrap();
        let whole = ContentRange::parse("bytes 0-9/10").unwrap();
        assert!(matches!(
            f.service.upload(&three, &q, &mut &b"abcdefghiX"[..], Some(&whole)),
            Err(Error::HashMismatch { .. })
        ));
        assert!(f.meta.get(three.repo.id, &q.oid).unwrap().is_none());
        assert!(f.service.content().verify_content(&q).unwrap());
    }

    #[test]
    fn test_locks_need_principal() {
        let f = fixture(0);
        let a = access(&f, "alice", "alice", "one");
        let backend = f.service.lock_backend(&a).unwrap();
        backend.create("a.bin", None).unwrap();
        let anon = Access {
            repo: a.repo.clone(),
            principal: None,
        };
        assert!(matches!(f.service.lock_backend(&anon), Err(Error::Unauthorized(_))));
    }
}
