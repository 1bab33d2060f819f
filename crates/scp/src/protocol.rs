//! The SCP wire protocol over an exec channel.
//!
//! The driver is generic over the transport so the whole session can be
//! exercised against an in-memory duplex stream. It parses the command
//! line the client sent with its `exec` request, then runs either the
//! sink loop (receiving `C`/`D`/`E`/`T` records) or the source loop
//! (emitting them), delegating every repository decision to the
//! [`ScpHandler`] callbacks.

use async_trait::async_trait;
use futures::future::BoxFuture;
use lattice_model::{vpath, FileRecord};
use lattice_store::StoreError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, warn};

use crate::entry::{DirEntry, Entry, FileEntry};
use crate::error::{Result, ScpError};
use crate::handler::{ScpHandler, WalkFlow, WalkVisitor};

const MAX_RECORD_LEN: usize = 4096;

/// Parsed `scp` server invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScpCommand {
    /// `-t`: receive files from the client (upload).
    pub sink: bool,
    /// `-f`: send files to the client (download).
    pub source: bool,
    /// `-r`: recursive transfer.
    pub recursive: bool,
    /// `-p`: preserve times; the driver emits `T` records when sending.
    pub preserve: bool,
    /// `-d`: the target names a directory.
    pub target_is_dir: bool,
    /// Raw target path as the client sent it.
    pub target: String,
}

impl ScpCommand {
    pub fn parse(line: &str) -> Result<ScpCommand> {
        let line = line.trim_matches(char::from(0)).trim();
        let mut parts = line.split_whitespace();
        if parts.next() != Some("scp") {
            return Err(ScpError::Protocol(format!("not an scp command: {line}")));
        }

        let mut cmd = ScpCommand {
            sink: false,
            source: false,
            recursive: false,
            preserve: false,
            target_is_dir: false,
            target: String::new(),
        };
        let mut target_parts: Vec<&str> = Vec::new();
        for token in parts {
            if target_parts.is_empty() && token.len() > 1 && token.starts_with('-') {
                for flag in token[1..].chars() {
                    match flag {
                        't' => cmd.sink = true,
                        'f' => cmd.source = true,
                        'r' => cmd.recursive = true,
                        'p' => cmd.preserve = true,
                        'd' => cmd.target_is_dir = true,
                        'v' | 'q' => {}
                        other => {
                            return Err(ScpError::Protocol(format!(
                                "unsupported scp flag '-{other}'"
                            )))
                        }
                    }
                }
            } else {
                target_parts.push(token);
            }
        }

        let target = target_parts
            .join(" ")
            .trim_matches(|c| c == '"' || c == '\'')
            .to_string();
        if target.is_empty() {
            return Err(ScpError::Protocol("missing scp target".to_string()));
        }
        if cmd.sink == cmd.source {
            return Err(ScpError::Protocol(
                "scp needs exactly one of -t and -f".to_string(),
            ));
        }
        cmd.target = target;
        Ok(cmd)
    }
}

/// One SCP transfer over `stream`, driving `handler`.
pub struct ScpSession<S> {
    stream: S,
    handler: ScpHandler,
}

impl<S> ScpSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, handler: ScpHandler) -> Self {
        ScpSession { stream, handler }
    }

    pub async fn run(mut self, cmd: ScpCommand) -> Result<()> {
        let result = if cmd.sink {
            self.run_sink(&cmd).await
        } else {
            self.run_source(&cmd).await
        };

        if let Err(err) = &result {
            error!(%err, "scp session failed");
            let _ = self.send_fatal(&err.to_string()).await;
        }
        result
    }

    // ---- sink: client uploads to the repository ----

    async fn run_sink(&mut self, cmd: &ScpCommand) -> Result<()> {
        self.send_ok().await?;

        // Directory names announced by D records, innermost last.
        let mut dirs: Vec<String> = Vec::new();
        loop {
            let Some(record) = self.read_record().await? else {
                break;
            };
            if record.is_empty() {
                continue;
            }

            let kind = record.as_bytes()[0];
            let body = &record[1..];
            match kind {
                b'T' => {
                    // Times are acknowledged but not applied; the
                    // repository tracks its own timestamps.
                    self.send_ok().await?;
                }
                b'D' => {
                    let (_mode, _size, name) = parse_file_record(body)?;
                    let dest = sink_dest(cmd, &dirs, &name);
                    match self.handler.mkdir(&dest).await {
                        Ok(_) => {
                            dirs.push(name);
                            self.send_ok().await?;
                        }
                        Err(err @ ScpError::Fatal(_)) => return Err(err),
                        Err(err) => {
                            error!(%dest, %err, "mkdir failed");
                            dirs.push(name);
                            self.send_warning(&err.to_string()).await?;
                        }
                    }
                }
                b'E' => {
                    dirs.pop();
                    self.send_ok().await?;
                }
                b'C' => {
                    let (_mode, size, name) = parse_file_record(body)?;
                    let dest = sink_dest(cmd, &dirs, &name);
                    self.send_ok().await?;

                    let outcome = {
                        let mut limited = (&mut self.stream).take(size);
                        let outcome = self.handler.write(&dest, &mut limited).await;
                        // Keep the stream aligned even if the handler
                        // bailed out mid-file.
                        let _ = tokio::io::copy(&mut limited, &mut tokio::io::sink()).await;
                        outcome
                    };

                    let trailer = self.stream.read_u8().await?;
                    if trailer != 0 {
                        warn!(trailer, "unexpected byte after file data");
                    }

                    match outcome {
                        Ok(written) => {
                            debug!(%dest, written, "file received");
                            self.send_ok().await?;
                        }
                        Err(err @ ScpError::Fatal(_)) => return Err(err),
                        Err(err) => {
                            error!(%dest, %err, "write failed");
                            self.send_warning(&err.to_string()).await?;
                        }
                    }
                }
                other => {
                    return Err(ScpError::Protocol(format!(
                        "unexpected record type '{}'",
                        other as char
                    )));
                }
            }
        }
        Ok(())
    }

    // ---- source: client downloads from the repository ----

    async fn run_source(&mut self, cmd: &ScpCommand) -> Result<()> {
        self.await_ack().await?;

        for pattern in self.handler.glob(&cmd.target) {
            if cmd.recursive {
                let tree = self.build_tree(&pattern).await?;
                self.send_entry(tree, cmd.preserve).await?;
            } else {
                let entry = self.handler.new_file_entry(&pattern).await?;
                self.send_file(entry, cmd.preserve).await?;
            }
        }
        Ok(())
    }

    /// Walk the tree under `path` and assemble the entries to send. A
    /// recursive copy of a plain file degenerates to that single file.
    async fn build_tree(&mut self, path: &str) -> Result<Entry> {
        if let Ok(file) = self.handler.new_file_entry(path).await {
            return Ok(Entry::File(file));
        }

        let mut collector = Collector { items: Vec::new() };
        self.handler.walk_dir(path, &mut collector).await?;

        let mut stack: Vec<DirEntry> = Vec::new();
        let mut root: Option<Entry> = None;
        for (item_path, is_dir) in collector.items {
            while stack
                .last()
                .is_some_and(|top| !is_within(&top.path, &item_path))
            {
                if let Some(done) = stack.pop() {
                    attach(&mut stack, &mut root, Entry::Dir(done));
                }
            }

            if is_dir {
                stack.push(self.handler.new_dir_entry(&item_path).await?);
            } else {
                let file = self.handler.new_file_entry(&item_path).await?;
                attach(&mut stack, &mut root, Entry::File(file));
            }
        }
        while let Some(done) = stack.pop() {
            attach(&mut stack, &mut root, Entry::Dir(done));
        }

        root.ok_or_else(|| ScpError::Protocol(format!("nothing to send for {path}")))
    }

    fn send_entry<'a>(&'a mut self, entry: Entry, preserve: bool) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match entry {
                Entry::File(file) => self.send_file(file, preserve).await,
                Entry::Dir(dir) => {
                    if preserve {
                        self.send_times(dir.mtime, dir.atime).await?;
                    }
                    let header = format!("D{:04o} 0 {}\n", dir.mode, dir.name);
                    self.stream.write_all(header.as_bytes()).await?;
                    self.stream.flush().await?;
                    self.await_ack().await?;

                    for child in dir.children {
                        self.send_entry(child, preserve).await?;
                    }

                    self.stream.write_all(b"E\n").await?;
                    self.stream.flush().await?;
                    self.await_ack().await?;
                    Ok(())
                }
            }
        })
    }

    async fn send_file(&mut self, mut file: FileEntry, preserve: bool) -> Result<()> {
        if preserve {
            self.send_times(file.mtime, file.atime).await?;
        }
        let header = format!("C{:04o} {} {}\n", file.mode, file.size, file.name);
        self.stream.write_all(header.as_bytes()).await?;
        self.stream.flush().await?;
        self.await_ack().await?;

        let mut limited = (&mut file.reader).take(file.size);
        let copied = tokio::io::copy(&mut limited, &mut self.stream).await?;
        if copied < file.size {
            return Err(ScpError::Protocol(format!(
                "physical file for {} is shorter than its recorded size",
                file.path
            )));
        }

        self.send_ok().await?;
        self.await_ack().await?;
        Ok(())
    }

    async fn send_times(&mut self, mtime: i64, atime: i64) -> Result<()> {
        let record = format!("T{mtime} 0 {atime} 0\n");
        self.stream.write_all(record.as_bytes()).await?;
        self.stream.flush().await?;
        self.await_ack().await
    }

    // ---- framing primitives ----

    async fn send_ok(&mut self) -> Result<()> {
        self.stream.write_all(&[0]).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn send_warning(&mut self, msg: &str) -> Result<()> {
        self.send_status(1, msg).await
    }

    async fn send_fatal(&mut self, msg: &str) -> Result<()> {
        self.send_status(2, msg).await
    }

    async fn send_status(&mut self, code: u8, msg: &str) -> Result<()> {
        let msg = msg.replace('\n', " ");
        self.stream.write_all(&[code]).await?;
        self.stream.write_all(b"scp: ").await?;
        self.stream.write_all(msg.as_bytes()).await?;
        self.stream.write_all(b"\n").await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn await_ack(&mut self) -> Result<()> {
        match self.stream.read_u8().await? {
            0 => Ok(()),
            code @ (1 | 2) => {
                let detail = self.read_line().await.unwrap_or_default();
                Err(ScpError::Protocol(format!(
                    "client reported error {code}: {detail}"
                )))
            }
            other => Err(ScpError::Protocol(format!(
                "unexpected ack byte {other}"
            ))),
        }
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = Vec::new();
        loop {
            let byte = self.stream.read_u8().await?;
            if byte == b'\n' {
                break;
            }
            line.push(byte);
            if line.len() > MAX_RECORD_LEN {
                return Err(ScpError::Protocol("oversized protocol record".to_string()));
            }
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    /// Next protocol record, or `None` once the client closes its side.
    async fn read_record(&mut self) -> Result<Option<String>> {
        let first = match self.stream.read_u8().await {
            Ok(byte) => byte,
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if first == b'\n' {
            return Ok(Some(String::new()));
        }
        let mut line = vec![first];
        loop {
            let byte = self.stream.read_u8().await?;
            if byte == b'\n' {
                break;
            }
            line.push(byte);
            if line.len() > MAX_RECORD_LEN {
                return Err(ScpError::Protocol("oversized protocol record".to_string()));
            }
        }
        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }
}

/// Collects walk output as `(in-project path, is-dir)` pairs in visit
/// order; the tree is assembled afterwards so entry construction can go
/// back through the handler.
struct Collector {
    items: Vec<(String, bool)>,
}

#[async_trait]
impl WalkVisitor for Collector {
    async fn visit(
        &mut self,
        path: &str,
        entry: Option<&FileRecord>,
        err: Option<&StoreError>,
    ) -> Result<WalkFlow> {
        if let Some(err) = err {
            return Err(ScpError::Protocol(format!("walk failed at {path}: {err}")));
        }
        let is_dir = entry.map(|e| e.is_dir()).unwrap_or(false);
        self.items.push((path.to_string(), is_dir));
        Ok(WalkFlow::Continue)
    }
}

fn attach(stack: &mut Vec<DirEntry>, root: &mut Option<Entry>, entry: Entry) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(entry),
        None => *root = Some(entry),
    }
}

fn is_within(parent: &str, child: &str) -> bool {
    if parent == "/" {
        return child != "/";
    }
    child.len() > parent.len() && child.starts_with(parent) && child.as_bytes()[parent.len()] == b'/'
}

/// Destination virtual path for an incoming record. A plain single-file
/// upload writes straight to the named target; everything else nests
/// under it.
fn sink_dest(cmd: &ScpCommand, dirs: &[String], name: &str) -> String {
    let single_file = dirs.is_empty()
        && !cmd.recursive
        && !cmd.target_is_dir
        && !cmd.target.ends_with('/');
    if single_file {
        return vpath::canonicalize(&cmd.target);
    }

    let mut dest = vpath::canonicalize(&cmd.target);
    for dir in dirs {
        dest = vpath::join(&dest, dir);
    }
    vpath::join(&dest, name)
}

/// Parse the `<mode> <size> <name>` body shared by `C` and `D` records.
fn parse_file_record(body: &str) -> Result<(u32, u64, String)> {
    let mut parts = body.splitn(3, ' ');
    let mode = parts
        .next()
        .and_then(|m| u32::from_str_radix(m, 8).ok())
        .ok_or_else(|| ScpError::Protocol(format!("bad mode in record: {body}")))?;
    let size = parts
        .next()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| ScpError::Protocol(format!("bad size in record: {body}")))?;
    let name = parts
        .next()
        .unwrap_or("")
        .trim()
        .to_string();
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(ScpError::Protocol(format!("illegal name in record: {body}")));
    }
    Ok((mode, size, name))
}
