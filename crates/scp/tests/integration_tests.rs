use std::path::{Path, PathBuf};
use std::sync::Arc;

use lattice_model::{mime, UserRecord};
use lattice_scp::{ScpCommand, ScpHandler, ScpSession};
use lattice_store::{FileStore, ProjectResolver, ProjectStore, SqliteStore, Stores};
use md5::{Digest, Md5};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

struct Fixture {
    _tmp: TempDir,
    fs_root: PathBuf,
    store: Arc<SqliteStore>,
    stores: Stores,
    alice: UserRecord,
}

fn fixture() -> Fixture {
    let tmp = TempDir::new().expect("tempdir");
    let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
    let alice = store.create_user("alice", "Alice", "hash").expect("user");
    let bob = store.create_user("bob", "Bob", "hash").expect("user");
    store
        .create_project("Alloy 42", "alloy-42", alice.id)
        .expect("project");
    store
        .create_project("Bob Private", "bob-private", bob.id)
        .expect("project");
    let stores = Stores::from_backend(store.clone());
    Fixture {
        fs_root: tmp.path().to_path_buf(),
        _tmp: tmp,
        store,
        stores,
        alice,
    }
}

fn handler(fx: &Fixture) -> ScpHandler {
    let resolver = Arc::new(ProjectResolver::new(
        fx.alice.id,
        fx.stores.projects.clone(),
    ));
    ScpHandler::new(
        fx.alice.clone(),
        fx.stores.clone(),
        resolver,
        fx.fs_root.clone(),
    )
}

fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn count_physical_files(dir: &Path) -> usize {
    let mut n = 0;
    for entry in std::fs::read_dir(dir).expect("read_dir") {
        let entry = entry.expect("entry");
        if entry.file_type().expect("file_type").is_dir() {
            n += count_physical_files(&entry.path());
        } else {
            n += 1;
        }
    }
    n
}

/// Commit a file straight through the store, physical bytes included.
async fn seed_file(fx: &Fixture, project_id: i64, dir_path: &str, name: &str, data: &[u8]) {
    let dir = fx
        .store
        .get_or_create_dir_path(project_id, fx.alice.id, dir_path)
        .await
        .expect("dir");
    let file = fx
        .store
        .create_file(name, project_id, dir.id, fx.alice.id, &mime::mime_type(name))
        .await
        .expect("file row");
    std::fs::create_dir_all(file.underlying_dir_path(&fx.fs_root)).expect("fan-out dirs");
    std::fs::write(file.underlying_file_path(&fx.fs_root), data).expect("physical bytes");
    fx.store
        .done_writing_to_file(&file, &md5_hex(data), data.len() as u64, &*fx.store)
        .await
        .expect("commit");
}

async fn read_ack(client: &mut DuplexStream) {
    let mut byte = [0u8; 1];
    client.read_exact(&mut byte).await.expect("ack byte");
    assert_eq!(byte[0], 0, "expected \\0 ack, got {}", byte[0]);
}

async fn read_status_byte(client: &mut DuplexStream) -> u8 {
    let mut byte = [0u8; 1];
    client.read_exact(&mut byte).await.expect("status byte");
    byte[0]
}

async fn read_line(client: &mut DuplexStream) -> String {
    let mut out = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        client.read_exact(&mut byte).await.expect("line byte");
        if byte[0] == b'\n' {
            break;
        }
        out.push(byte[0]);
    }
    String::from_utf8(out).expect("utf8 line")
}

fn spawn_session(
    fx: &Fixture,
    command: &str,
) -> (DuplexStream, tokio::task::JoinHandle<lattice_scp::Result<()>>) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let session = ScpSession::new(server, handler(fx));
    let cmd = ScpCommand::parse(command).expect("command");
    let task = tokio::spawn(session.run(cmd));
    (client, task)
}

#[tokio::test]
async fn single_file_upload_creates_directories_and_commits() {
    let fx = fixture();
    let (mut client, task) = spawn_session(&fx, "scp -t /alloy-42/dir1/local.txt");

    read_ack(&mut client).await;
    client
        .write_all(b"C0644 12 local.txt\n")
        .await
        .expect("header");
    read_ack(&mut client).await;
    client.write_all(b"hello world!").await.expect("data");
    client.write_all(&[0]).await.expect("trailer");
    read_ack(&mut client).await;
    drop(client);
    task.await.expect("join").expect("session");

    let project = fx.store.get_project_by_slug("alloy-42").await.unwrap();
    // The directory was auto-created even though no Mkdir record came in.
    let dir = fx.store.get_dir_by_path(project.id, "/dir1").await.unwrap();
    assert!(dir.is_dir());

    let file = fx
        .store
        .get_file_by_path(project.id, "/dir1/local.txt")
        .await
        .unwrap();
    assert!(file.current);
    assert_eq!(file.size, 12);
    assert_eq!(file.checksum, md5_hex(b"hello world!"));
    let bytes = std::fs::read(file.underlying_file_path(&fx.fs_root)).unwrap();
    assert_eq!(bytes, b"hello world!");
}

#[tokio::test]
async fn recursive_upload_deduplicates_identical_files() {
    let fx = fixture();
    let (mut client, task) = spawn_session(&fx, "scp -r -t /alloy-42/");

    read_ack(&mut client).await;
    client.write_all(b"D0755 0 dup\n").await.unwrap();
    read_ack(&mut client).await;

    for name in ["a.bin", "b.bin"] {
        let header = format!("C0644 9 {name}\n");
        client.write_all(header.as_bytes()).await.unwrap();
        read_ack(&mut client).await;
        client.write_all(b"same same").await.unwrap();
        client.write_all(&[0]).await.unwrap();
        read_ack(&mut client).await;
    }

    client.write_all(b"E\n").await.unwrap();
    read_ack(&mut client).await;
    drop(client);
    task.await.expect("join").expect("session");

    let project = fx.store.get_project_by_slug("alloy-42").await.unwrap();
    let a = fx.store.get_file_by_path(project.id, "/dup/a.bin").await.unwrap();
    let b = fx.store.get_file_by_path(project.id, "/dup/b.bin").await.unwrap();
    assert_ne!(a.id, b.id);
    assert_eq!(a.uuid, b.uuid);
    assert_eq!(count_physical_files(&fx.fs_root), 1);
}

#[tokio::test]
async fn timestamps_records_are_acknowledged() {
    let fx = fixture();
    let (mut client, task) = spawn_session(&fx, "scp -p -t /alloy-42/stamped.txt");

    read_ack(&mut client).await;
    client
        .write_all(b"T1700000000 0 1700000000 0\n")
        .await
        .unwrap();
    read_ack(&mut client).await;
    client.write_all(b"C0644 4 stamped.txt\n").await.unwrap();
    read_ack(&mut client).await;
    client.write_all(b"data").await.unwrap();
    client.write_all(&[0]).await.unwrap();
    read_ack(&mut client).await;
    drop(client);
    task.await.expect("join").expect("session");

    let project = fx.store.get_project_by_slug("alloy-42").await.unwrap();
    assert!(fx
        .store
        .get_file_by_path(project.id, "/stamped.txt")
        .await
        .is_ok());
}

#[tokio::test]
async fn single_file_download_streams_stored_bytes() {
    let fx = fixture();
    let project = fx.store.get_project_by_slug("alloy-42").await.unwrap();
    seed_file(&fx, project.id, "/data", "run.csv", b"a,b\n1,2\n").await;

    let (mut client, task) = spawn_session(&fx, "scp -f /alloy-42/data/run.csv");

    client.write_all(&[0]).await.unwrap();
    let header = read_line(&mut client).await;
    assert_eq!(header, "C0777 8 run.csv");
    client.write_all(&[0]).await.unwrap();

    let mut data = vec![0u8; 8];
    client.read_exact(&mut data).await.unwrap();
    assert_eq!(data, b"a,b\n1,2\n");
    read_ack(&mut client).await;
    client.write_all(&[0]).await.unwrap();

    task.await.expect("join").expect("session");
}

#[tokio::test]
async fn recursive_download_walks_the_tree() {
    let fx = fixture();
    let project = fx.store.get_project_by_slug("alloy-42").await.unwrap();
    seed_file(&fx, project.id, "/dup", "a.bin", b"same same").await;
    seed_file(&fx, project.id, "/dup", "b.bin", b"same same").await;

    let (mut client, task) = spawn_session(&fx, "scp -r -f /alloy-42/dup");

    client.write_all(&[0]).await.unwrap();
    let dir_header = read_line(&mut client).await;
    assert_eq!(dir_header, "D0777 0 dup");
    client.write_all(&[0]).await.unwrap();

    for name in ["a.bin", "b.bin"] {
        let header = read_line(&mut client).await;
        assert_eq!(header, format!("C0777 9 {name}"));
        client.write_all(&[0]).await.unwrap();
        let mut data = vec![0u8; 9];
        client.read_exact(&mut data).await.unwrap();
        assert_eq!(data, b"same same");
        read_ack(&mut client).await;
        client.write_all(&[0]).await.unwrap();
    }

    let end = read_line(&mut client).await;
    assert_eq!(end, "E");
    client.write_all(&[0]).await.unwrap();

    task.await.expect("join").expect("session");
}

#[tokio::test]
async fn recursive_download_with_preserve_sends_times() {
    let fx = fixture();
    let project = fx.store.get_project_by_slug("alloy-42").await.unwrap();
    seed_file(&fx, project.id, "/t", "x.txt", b"x").await;

    let (mut client, task) = spawn_session(&fx, "scp -r -p -f /alloy-42/t");

    client.write_all(&[0]).await.unwrap();
    let times = read_line(&mut client).await;
    assert!(times.starts_with('T'), "expected T record, got {times}");
    client.write_all(&[0]).await.unwrap();
    let dir_header = read_line(&mut client).await;
    assert_eq!(dir_header, "D0777 0 t");
    client.write_all(&[0]).await.unwrap();

    let times = read_line(&mut client).await;
    assert!(times.starts_with('T'));
    client.write_all(&[0]).await.unwrap();
    let header = read_line(&mut client).await;
    assert_eq!(header, "C0777 1 x.txt");
    client.write_all(&[0]).await.unwrap();
    let mut data = [0u8; 1];
    client.read_exact(&mut data).await.unwrap();
    read_ack(&mut client).await;
    client.write_all(&[0]).await.unwrap();

    let end = read_line(&mut client).await;
    assert_eq!(end, "E");
    client.write_all(&[0]).await.unwrap();

    task.await.expect("join").expect("session");
}

#[tokio::test]
async fn upload_into_a_foreign_project_warns_and_mutates_nothing() {
    let fx = fixture();
    let (mut client, task) = spawn_session(&fx, "scp -t /bob-private/steal.txt");

    read_ack(&mut client).await;
    client.write_all(b"C0644 5 steal.txt\n").await.unwrap();
    read_ack(&mut client).await;
    client.write_all(b"nope!").await.unwrap();
    client.write_all(&[0]).await.unwrap();

    // The server answers with a warning, not an ack.
    let status = read_status_byte(&mut client).await;
    assert_eq!(status, 1);
    let detail = read_line(&mut client).await;
    assert!(detail.contains("does not exist"), "got: {detail}");
    drop(client);
    task.await.expect("join").expect("session");

    assert_eq!(count_physical_files(&fx.fs_root), 0);
}

#[tokio::test]
async fn download_of_a_missing_file_fails_the_session() {
    let fx = fixture();
    let (mut client, task) = spawn_session(&fx, "scp -f /alloy-42/never.txt");

    client.write_all(&[0]).await.unwrap();
    let status = read_status_byte(&mut client).await;
    assert_eq!(status, 2, "missing source is fatal");
    let detail = read_line(&mut client).await;
    assert!(detail.contains("does not exist"), "got: {detail}");

    assert!(task.await.expect("join").is_err());
}
