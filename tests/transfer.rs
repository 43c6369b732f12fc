//! `git-lfs-transfer` sessions over in-memory streams.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use lfs_server::batch::Operation;
use lfs_server::content_store::ContentStore;
use lfs_server::lock::MemoryLockStore;
use lfs_server::meta::MemoryMetaStore;
use lfs_server::repo::{AccessControl, RepositoryConfig, StaticDirectory, UserConfig};
use lfs_server::service::{Credentials, LfsOptions, LfsService};
use lfs_server::storage::MemoryStorage;
use lfs_server::token::{Scope, TokenSigner};
use lfs_server::transfer::{Packet, PktReader, PktWriter, Session};
use lfs_server::{Error, Pointer};

struct Fixture {
    service: LfsService,
    directory: Arc<StaticDirectory>,
}

fn fixture() -> Fixture {
    let users = ["alice", "bob"].map(|name| UserConfig {
        name: name.into(),
        password: "pw".into(),
        is_admin: false,
    });
    let repos = [RepositoryConfig {
        owner: "alice".into(),
        name: "assets".into(),
        public: false,
        readers: vec!["bob".into()],
        writers: vec![],
    }];
    let directory = Arc::new(StaticDirectory::new(&users, &repos).unwrap());
    let service = LfsService::new(
        ContentStore::new(Arc::new(MemoryStorage::new())),
        Arc::new(MemoryMetaStore::new()),
        directory.clone(),
        directory.clone(),
        Arc::new(MemoryLockStore::new()),
        TokenSigner::new("ssh", Duration::from_secs(60)).unwrap(),
        LfsOptions::default(),
    );
    Fixture { service, directory }
}

/// Builds the client side of a session.
struct Script(PktWriter<Vec<u8>>);

impl Script {
    fn new() -> Self {
        Script(PktWriter::new(Vec::new()))
    }

    fn command(mut self, line: &str, args: &[&str]) -> Self {
        self.0.write_line(line).unwrap();
        for arg in args {
            self.0.write_line(arg).unwrap();
        }
        self.0.write_flush().unwrap();
        self
    }

    fn command_with_data(mut self, line: &str, args: &[&str], data: &[&[u8]]) -> Self {
        self.0.write_line(line).unwrap();
        for arg in args {
            self.0.write_line(arg).unwrap();
        }
        self.0.write_delim().unwrap();
        for chunk in data {
            self.0.write_data(chunk).unwrap();
        }
        self.0.write_flush().unwrap();
        self
    }

    fn finish(self) -> Vec<u8> {
        self.0.into_inner()
    }
}

/// Run a session as `user` and split the output into responses. Each
/// response lists its packets as text, with `--` for a delimiter.
fn run(
    fixture: &Fixture,
    user: &str,
    operation: Operation,
    input: Vec<u8>,
) -> (Result<(), Error>, Vec<Vec<String>>) {
    let principal = fixture.directory.principal_by_name(user).unwrap();
    let scope = match operation {
        Operation::Upload => Scope::Upload,
        Operation::Download => Scope::Download,
    };
    let access = fixture
        .service
        .authorize("alice", "assets", &Credentials::Principal(principal), scope)
        .unwrap();

    let mut output = Vec::new();
    let result = Session::new(&fixture.service, access, operation, Cursor::new(input), &mut output)
        .run();

    let mut reader = PktReader::new(Cursor::new(output));
    let mut responses = Vec::new();
    let mut current = Vec::new();
    while let Some(packet) = reader.read_packet().unwrap() {
        match packet {
            Packet::Flush => responses.push(std::mem::take(&mut current)),
            Packet::Delim => current.push("--".to_string()),
            packet => current.push(packet.text().unwrap_or_default()),
        }
    }
    assert!(current.is_empty(), "unterminated response {current:?}");
    (result, responses)
}

#[test]
fn test_upload_then_download() {
    let fixture = fixture();
    let content = b"hello over ssh";
    let pointer = Pointer::from_content(content);
    let object_line = format!("{} {}", pointer.oid, pointer.size);
    let size_arg = format!("size={}", pointer.size);

    let input = Script::new()
        .command("version 1", &[])
        .command_with_data("batch", &["hash-algo=sha256"], &[object_line.as_bytes()])
        .command_with_data(
            &format!("put-object {}", pointer.oid),
            &[&size_arg],
            &[&content[..5], &content[5..]],
        )
        .command(&format!("verify-object {}", pointer.oid), &[&size_arg])
        .command_with_data("batch", &[], &[format!("{object_line} checked=yes").as_bytes()])
        .command("quit", &[])
        .finish();
    let (result, responses) = run(&fixture, "alice", Operation::Upload, input);
    result.unwrap();

    assert_eq!(responses[0], vec!["version=1", "locking"]);
    assert_eq!(responses[1], vec!["status 200"]);
    assert_eq!(
        responses[2],
        vec![
            "status 200".to_string(),
            "transfer=basic".to_string(),
            "--".to_string(),
            format!("{} upload", object_line),
        ]
    );
    assert_eq!(responses[3], vec!["status 200"]);
    assert_eq!(responses[4], vec!["status 200"]);
    assert_eq!(responses[5][3], format!("{} noop checked=yes", object_line));
    assert_eq!(responses[6], vec!["status 200"]);
    assert_eq!(responses.len(), 7);

    // bob may read the repository.
    let input = Script::new()
        .command_with_data("batch", &[], &[object_line.as_bytes()])
        .command(&format!("get-object {}", pointer.oid), &[])
        .finish();
    let (result, responses) = run(&fixture, "bob", Operation::Download, input);
    result.unwrap();
    assert_eq!(responses[1][3], format!("{} download", object_line));
    assert_eq!(
        responses[2],
        vec![
            "status 200".to_string(),
            format!("size={}", pointer.size),
            "--".to_string(),
            "hello over ssh".to_string(),
        ]
    );
}

#[test]
fn test_command_errors_keep_the_session_alive() {
    let fixture = fixture();
    let pointer = Pointer::from_content(b"expected");
    let missing = Pointer::from_content(b"never uploaded");

    let input = Script::new()
        .command("frobnicate", &[])
        .command_with_data(
            &format!("put-object {}", pointer.oid),
            &["size=8"],
            &[b"tampered".as_slice()],
        )
        .command_with_data("batch", &["hash-algo=sha1"], &[b"x 1".as_slice()])
        .command_with_data("batch", &[], &[b"not-an-oid 1".as_slice()])
        .command(&format!("get-object {}", missing.oid), &[])
        .command(&format!("verify-object {}", missing.oid), &["size=14"])
        .finish();
    let (result, responses) = run(&fixture, "alice", Operation::Upload, input);
    result.unwrap();

    assert_eq!(responses[1][0], "status 400");
    assert_eq!(responses[2], vec!["status 422", "--", "corrupt data"]);
    assert_eq!(responses[3][0], "status 400");
    assert_eq!(responses[4][0], "status 400");
    assert_eq!(responses[5], vec!["status 404", "--", "not found"]);
    assert_eq!(responses[6][0], "status 404");
}

#[test]
fn test_download_session_is_read_only() {
    let fixture = fixture();
    let pointer = Pointer::from_content(b"data");
    let input = Script::new()
        .command_with_data(
            &format!("put-object {}", pointer.oid),
            &["size=4"],
            &[b"data".as_slice()],
        )
        .command("lock", &["path=a.bin"])
        .command("version 1", &[])
        .finish();
    let (result, responses) = run(&fixture, "bob", Operation::Download, input);
    result.unwrap();
    assert_eq!(responses[1][0], "status 403");
    assert_eq!(responses[2][0], "status 403");
    assert_eq!(responses[3], vec!["status 200"]);
}

#[test]
fn test_locks() {
    let fixture = fixture();
    let input = Script::new()
        .command("lock", &["path=art/a.psd", "refname=refs/heads/main"])
        .command("lock", &["path=art/a.psd"])
        .command("list-lock", &["limit=10"])
        .command("unlock 1", &[])
        .command("list-lock", &[])
        .finish();
    let (result, responses) = run(&fixture, "alice", Operation::Upload, input);
    result.unwrap();

    let created = &responses[1];
    assert_eq!(created[0], "status 201");
    assert_eq!(created[1], "id=1");
    assert_eq!(created[2], "path=art/a.psd");
    assert!(created[3].starts_with("locked-at="));
    assert_eq!(created[4], "ownername=alice");

    assert_eq!(responses[2][0], "status 409");
    assert_eq!(responses[2][1], "id=1");

    let listed = &responses[3];
    assert_eq!(listed[0], "status 200");
    assert_eq!(listed[1], "--");
    assert_eq!(listed[2], "lock 1");
    assert_eq!(listed[3], "path 1 art/a.psd");
    assert_eq!(listed[6], "owner 1 ours");

    assert_eq!(responses[4][0], "status 200");
    assert_eq!(responses[5], vec!["status 200", "--"]);
}

#[test]
fn test_framing_error_ends_the_session() {
    let fixture = fixture();
    let mut input = Script::new().command("version 1", &[]).finish();
    input.extend_from_slice(b"0003");
    let (result, responses) = run(&fixture, "alice", Operation::Upload, input);
    assert!(matches!(result, Err(Error::Protocol(_))));
    assert_eq!(responses.len(), 2);
}
