//! Requests of the transfer protocol.

use std::collections::BTreeMap;
use std::io::Read;

use super::pktline::{Packet, PktReader};
use crate::{Error, Pointer, Result};

/// A command line with its arguments, as read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub line: String,
    pub args: BTreeMap<String, String>,
    /// Arguments ended with a delimiter; a data section follows.
    pub has_data: bool,
}

impl Request {
    /// Read the next request. `None` when the client closed the stream.
    pub fn read<R: Read>(packets: &mut PktReader<R>) -> Result<Option<Request>> {
        let line = match packets.read_packet()? {
            None => return Ok(None),
            Some(packet @ Packet::Data(_)) => packet.text().unwrap_or_default(),
            Some(other) => {
                return Err(Error::Protocol(format!("expected a command, got {:?}", other)))
            }
        };
        let mut args = BTreeMap::new();
        loop {
            match packets.expect_packet()? {
                packet @ Packet::Data(_) => {
                    let arg = packet.text().unwrap_or_default();
                    let (key, value) = arg.split_once('=').unwrap_or((arg.as_str(), ""));
                    args.insert(key.to_string(), value.to_string());
                }
                Packet::Delim => {
                    return Ok(Some(Request {
                        line,
                        args,
                        has_data: true,
                    }))
                }
                Packet::Flush => {
                    return Ok(Some(Request {
                        line,
                        args,
                        has_data: false,
                    }))
                }
                Packet::ResponseEnd => {
                    return Err(Error::Protocol("unexpected response-end in request".into()))
                }
            }
        }
    }

    fn arg(&self, key: &str) -> Option<&str> {
        self.args.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    fn size(&self) -> Result<i64> {
        self.arg("size")
            .and_then(|s| s.parse::<i64>().ok())
            .filter(|s| *s >= 0)
            .ok_or_else(|| Error::InvalidArgument("missing or invalid size".into()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Version(String),
    Batch {
        transfer: Option<String>,
        refname: Option<String>,
        hash_algo: Option<String>,
    },
    PutObject(Pointer),
    VerifyObject(Pointer),
    GetObject(String),
    Lock {
        path: String,
        refname: Option<String>,
    },
    ListLock {
        cursor: String,
        limit: Option<usize>,
        path: Option<String>,
        id: Option<String>,
        refname: Option<String>,
    },
    Unlock {
        id: i64,
        force: bool,
        refname: Option<String>,
    },
    Quit,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Version(_) => "version",
            Command::Batch { .. } => "batch",
            Command::PutObject(_) => "put-object",
            Command::VerifyObject(_) => "verify-object",
            Command::GetObject(_) => "get-object",
            Command::Lock { .. } => "lock",
            Command::ListLock { .. } => "list-lock",
            Command::Unlock { .. } => "unlock",
            Command::Quit => "quit",
        }
    }

    /// Commands that modify the repository.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Command::PutObject(_) | Command::Lock { .. } | Command::Unlock { .. }
        )
    }

    pub fn parse(request: &Request) -> Result<Command> {
        let (name, rest) = match request.line.split_once(' ') {
            Some((name, rest)) => (name, Some(rest.trim())),
            None => (request.line.as_str(), None),
        };
        let operand = || {
            rest.filter(|r| !r.is_empty() && !r.contains(' '))
                .map(str::to_string)
                .ok_or_else(|| Error::InvalidArgument(format!("{} needs one operand", name)))
        };
        let refname = request.arg("refname").map(str::to_string);

        let command = match name {
            "version" => Command::Version(operand()?),
            "batch" => Command::Batch {
                transfer: request.arg("transfer").map(str::to_string),
                refname,
                hash_algo: request.arg("hash-algo").map(str::to_string),
            },
            "put-object" => Command::PutObject(Pointer::new(operand()?, request.size()?)),
            "verify-object" => Command::VerifyObject(Pointer::new(operand()?, request.size()?)),
            "get-object" => Command::GetObject(operand()?),
            "lock" => Command::Lock {
                path: request
                    .arg("path")
                    .map(str::to_string)
                    .ok_or_else(|| Error::InvalidArgument("lock needs a path".into()))?,
                refname,
            },
            "list-lock" => Command::ListLock {
                cursor: request.arg("cursor").unwrap_or_default().to_string(),
                limit: match request.arg("limit") {
                    Some(limit) => Some(limit.parse().map_err(|_| {
                        Error::InvalidArgument(format!("invalid limit {:?}", limit))
                    })?),
                    None => None,
                },
                path: request.arg("path").map(str::to_string),
                id: request.arg("id").map(str::to_string),
                refname,
            },
            "unlock" => {
                let id = operand()?;
                Command::Unlock {
                    id: id
                        .parse()
                        .map_err(|_| Error::InvalidArgument(format!("invalid lock id {:?}", id)))?,
                    force: request.arg("force") == Some("true"),
                    refname,
                }
            }
            "quit" => Command::Quit,
            other => {
                return Err(Error::InvalidArgument(format!("unknown command {:?}", other)))
            }
        };
        Ok(command)
    }
}

/// Parse a batch data line `<oid> <size> [key=value…]`.
pub fn parse_object_line(line: &str) -> Result<(Pointer, BTreeMap<String, String>)> {
    let mut parts = line.split(' ').filter(|p| !p.is_empty());
    let (Some(oid), Some(size)) = (parts.next(), parts.next()) else {
        return Err(Error::InvalidArgument(format!("invalid object line {:?}", line)));
    };
    let size = size
        .parse::<i64>()
        .map_err(|_| Error::InvalidArgument(format!("invalid size in {:?}", line)))?;
    let mut args = BTreeMap::new();
    for part in parts {
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| Error::InvalidArgument(format!("invalid argument {:?}", part)))?;
        args.insert(key.to_string(), value.to_string());
    }
    Ok((Pointer::new(oid, size), args))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::pktline::PktWriter;
    use std::io::Cursor;

    fn request(lines: &[&str], data: bool) -> PktReader<Cursor<Vec<u8>>> {
        let mut w = PktWriter::new(Vec::new());
        for line in lines {
            w.write_line(line).unwrap();
        }
        if data {
            w.write_delim().unwrap();
        }
        w.write_flush().unwrap();
        PktReader::new(Cursor::new(w.into_inner()))
    }

    #[test]
    fn test_read_request() {
        let mut r = request(&["put-object abc", "size=10"], true);
        let req = Request::read(&mut r).unwrap().unwrap();
        assert_eq!(req.line, "put-object abc");
        assert_eq!(req.args["size"], "10");
        assert!(req.has_data);
        assert_eq!(
            Command::parse(&req).unwrap(),
            Command::PutObject(Pointer::new("abc", 10))
        );
    }

    #[test]
    fn test_parse_commands() {
        let parse = |lines: &[&str]| {
            let mut r = request(lines, false);
            Command::parse(&Request::read(&mut r).unwrap().unwrap())
        };
        assert_eq!(parse(&["version 1"]).unwrap(), Command::Version("1".into()));
        assert_eq!(parse(&["quit"]).unwrap(), Command::Quit);
        assert_eq!(
            parse(&["unlock 7", "force=true"]).unwrap(),
            Command::Unlock {
                id: 7,
                force: true,
                refname: None
            }
        );
        assert!(matches!(
            parse(&["list-lock", "limit=5", "cursor=3"]).unwrap(),
            Command::ListLock { limit: Some(5), ref cursor, .. } if cursor == "3"
        ));
        assert!(parse(&["unlock x"]).is_err());
        assert!(parse(&["put-object abc"]).is_err());
        assert!(parse(&["lock"]).is_err());
        assert!(parse(&["frobnicate"]).is_err());
        assert!(parse(&["get-object"]).is_err());
    }

    #[test]
    fn test_parse_object_line() {
        let (pointer, args) = parse_object_line("abc 12 extra=1").unwrap();
        assert_eq!(pointer, Pointer::new("abc", 12));
        assert_eq!(args["extra"], "1");
        assert!(parse_object_line("abc 12 junk").is_err());
        assert!(parse_object_line("abc").is_err());
        assert!(parse_object_line("abc x").is_err());
    }
}
