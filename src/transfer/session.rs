//! One `git-lfs-transfer` session: greeting, then a strictly sequential
//! command loop until `quit` or end of input.

use std::io::{Read, Write};

use super::command::{parse_object_line, Command, Request};
use super::pktline::{DataReader, Packet, PktReader, PktWriter};
use super::status::{lock_lines, message, status_code, Status};
use crate::batch::Operation;
use crate::lock::Lock;
use crate::service::{Access, Download, LfsService};
use crate::{Error, Pointer, Result};

enum Reply {
    Status(Status),
    Object(Download),
}

impl From<Status> for Reply {
    fn from(status: Status) -> Self {
        Reply::Status(status)
    }
}

pub struct Session<'a, R, W> {
    service: &'a LfsService,
    access: Access,
    operation: Operation,
    reader: PktReader<R>,
    writer: PktWriter<W>,
}

impl<'a, R: Read, W: Write> Session<'a, R, W> {
    pub fn new(
        service: &'a LfsService,
        access: Access,
        operation: Operation,
        input: R,
        output: W,
    ) -> Self {
        Session {
            service,
            access,
            operation,
            reader: PktReader::new(input),
            writer: PktWriter::new(output),
        }
    }

    /// Serve the session. Returns an error only for stream and framing
    /// failures; command failures are reported to the client.
    pub fn run(mut self) -> Result<()> {
        tracing::info!(
            repo = %self.access.repo.full_name(),
            operation = ?self.operation,
            user = self.access.principal.as_ref().map(|p| p.name.as_str()).unwrap_or_default(),
            "transfer session started"
        );
        self.greet()?;

        while let Some(request) = Request::read(&mut self.reader)? {
            let command = match Command::parse(&request) {
                Ok(command) => command,
                Err(err) => {
                    if request.has_data {
                        self.drain()?;
                    }
                    self.reply_error(&err)?;
                    continue;
                }
            };
            tracing::debug!(command = command.name(), "transfer command");

            if command.is_write() && self.operation != Operation::Upload {
                if request.has_data {
                    self.drain()?;
                }
                Status::error(403, "write commands need an upload session").write(&mut self.writer)?;
                continue;
            }

            let quit = command == Command::Quit;
            let reply = self.dispatch(command, request.has_data);
            match reply {
                Ok(Reply::Status(status)) => status.write(&mut self.writer)?,
                Ok(Reply::Object(mut download)) => {
                    self.writer.write_line("status 200")?;
                    self.writer
                        .write_line(&format!("size={}", download.pointer.size))?;
                    self.writer.write_delim()?;
                    self.writer.copy_from(&mut download.object)?;
                    self.writer.write_flush()?;
                }
                Err(err) => self.reply_error(&err)?,
            }
            if quit {
                break;
            }
        }

        tracing::info!(repo = %self.access.repo.full_name(), "transfer session finished");
        Ok(())
    }

    fn greet(&mut self) -> Result<()> {
        self.writer.write_line("version=1")?;
        if self.service.options().locking {
            self.writer.write_line("locking")?;
        }
        self.writer.write_flush()
    }

    fn drain(&mut self) -> Result<()> {
        let mut data = DataReader::new(&mut self.reader);
        data.drain()?;
        match data.take_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Report a command failure, or give up on framing errors.
    fn reply_error(&mut self, err: &Error) -> Result<()> {
        let Some(code) = status_code(err) else {
            return Err(Error::Protocol(err.to_string()));
        };
        if code >= 500 {
            tracing::error!(error = %err, "transfer command failed");
        } else {
            tracing::debug!(code, error = %err, "transfer command rejected");
        }
        Status::error(code, message(err)).write(&mut self.writer)
    }

    fn dispatch(&mut self, command: Command, has_data: bool) -> Result<Reply> {
        // Only batch and put-object consume a data section.
        if has_data && !matches!(command, Command::Batch { .. } | Command::PutObject(_)) {
            self.drain()?;
        }
        match command {
            Command::Version(version) => Ok(self.version(&version).into()),
            Command::Batch { hash_algo, .. } => {
                self.batch(has_data, hash_algo.as_deref()).map(Into::into)
            }
            Command::PutObject(pointer) => self.put_object(&pointer, has_data).map(Into::into),
            Command::VerifyObject(pointer) => self.verify_object(&pointer).map(Into::into),
            Command::GetObject(oid) => self.get_object(&oid),
            Command::Lock { path, refname } => self.lock(&path, refname.as_deref()).map(Into::into),
            Command::ListLock {
                cursor,
                limit,
                path,
                id,
                ..
            } => self
                .list_lock(&cursor, limit, path.as_deref(), id.as_deref())
                .map(Into::into),
            Command::Unlock { id, force, .. } => self.unlock(id, force).map(Into::into),
            Command::Quit => Ok(Status::ok().into()),
        }
    }

    fn version(&self, version: &str) -> Status {
        if version == "1" {
            Status::ok()
        } else {
            Status::error(400, format!("unsupported version {}", version))
        }
    }

    fn read_lines(&mut self) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        loop {
            match self.reader.expect_packet()? {
                packet @ Packet::Data(_) => lines.push(packet.text().unwrap_or_default()),
                Packet::Flush => return Ok(lines),
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected {:?} in batch data",
                        other
                    )))
                }
            }
        }
    }

    fn batch(&mut self, has_data: bool, hash_algo: Option<&str>) -> Result<Status> {
        let lines = if has_data { self.read_lines()? } else { Vec::new() };
        if let Some(algo) = hash_algo {
            if algo != "sha256" {
                return Err(Error::InvalidArgument(format!("unsupported hash algorithm {}", algo)));
            }
        }
        let mut pointers = Vec::with_capacity(lines.len());
        let mut args = Vec::with_capacity(lines.len());
        for line in &lines {
            let (pointer, extra) = parse_object_line(line)?;
            pointer.validate()?;
            pointers.push(pointer);
            args.push(extra);
        }

        let items = self.service.negotiate(&self.access, self.operation, &pointers)?;
        let mut out = Vec::with_capacity(items.len());
        for (mut item, extra) in items.into_iter().zip(args) {
            item.args.extend(extra);
            let action = match &item.error {
                Some(error) if error.code == 404 => "noop",
                Some(error) => return Ok(Status::error(error.code, error.message.clone())),
                None => match self.operation {
                    Operation::Upload if item.present => "noop",
                    Operation::Upload => "upload",
                    Operation::Download => "download",
                },
            };
            let mut line = format!("{} {} {}", item.pointer.oid, item.pointer.size, action);
            for (key, value) in &item.args {
                line.push_str(&format!(" {}={}", key, value));
            }
            out.push(line);
        }
        Ok(Status::ok().arg("transfer=basic").lines(out))
    }

    fn put_object(&mut self, pointer: &Pointer, has_data: bool) -> Result<Status> {
        if !has_data {
            return Err(Error::InvalidArgument("put-object needs a data section".into()));
        }
        let mut data = DataReader::new(&mut self.reader);
        let result = self.service.upload(&self.access, pointer, &mut data, None);
        data.drain()?;
        if let Some(err) = data.take_error() {
            return Err(err);
        }
        result?;
        Ok(Status::ok())
    }

    fn verify_object(&self, pointer: &Pointer) -> Result<Status> {
        if self.service.verify_content(&self.access, pointer)? {
            Ok(Status::ok())
        } else {
            Ok(Status::error(404, "not found"))
        }
    }

    fn get_object(&self, oid: &str) -> Result<Reply> {
        let download = self.service.download(&self.access, oid, None)?;
        Ok(Reply::Object(download))
    }

    fn lock(&self, path: &str, refname: Option<&str>) -> Result<Status> {
        let backend = self.service.lock_backend(&self.access)?;
        match backend.create(path, refname) {
            Ok(lock) => Ok(Status::lock(201, &lock)),
            Err(Error::LockConflict(existing)) => {
                Ok(Status::lock(409, &existing).lines(vec!["lock already exists".into()]))
            }
            Err(err) => Err(err),
        }
    }

    fn list_lock(
        &self,
        cursor: &str,
        limit: Option<usize>,
        path: Option<&str>,
        id: Option<&str>,
    ) -> Result<Status> {
        let backend = self.service.lock_backend(&self.access)?;
        let paging = self.service.options().locks_paging_num.max(1);
        let limit = limit.unwrap_or(paging).clamp(1, paging);

        let mut locks: Vec<Lock> = Vec::new();
        let mut next = None;
        if let Some(id) = id {
            let id = id
                .parse()
                .map_err(|_| Error::InvalidArgument(format!("invalid lock id {:?}", id)))?;
            locks.extend(backend.from_id(id)?);
        } else if let Some(path) = path {
            locks.extend(backend.from_path(path)?);
        } else {
            next = backend.range(cursor, limit, &mut |lock| {
                locks.push(lock.clone());
                Ok(())
            })?;
        }

        let lines = locks
            .iter()
            .flat_map(|lock| lock_lines(lock, backend.is_ours(lock)))
            .collect();
        let mut status = Status::ok();
        if let Some(next) = next {
            status = status.arg(format!("next-cursor={}", next));
        }
        Ok(status.lines(lines))
    }

    fn unlock(&self, id: i64, force: bool) -> Result<Status> {
        let backend = self.service.lock_backend(&self.access)?;
        let lock = backend.unlock(id, force)?;
        Ok(Status::lock(200, &lock))
    }
}
