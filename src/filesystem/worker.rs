//! The filesystem's background worker: chunked reads, writes and directory
//! listings that feed or drain streams.

use super::{DescriptorType, DirectoryEntry, ErrorCode, FsError, FsResult};
use crate::dispatch::{Dispatch, Operation, Router, Service};
use crate::runtime::spawn_blocking;
use crate::stream::{StreamReader, StreamWriter};
use bytes::{Bytes, BytesMut};
use std::io;
use std::sync::{Arc, LazyLock};
use system_interface::fs::FileIoExt;

/// Size of the buffer each read iteration fills.
pub(crate) const CHUNK_SIZE: usize = 64 * 1024;

pub(crate) static ROUTER: LazyLock<Router<FsWorker>> = LazyLock::new(|| Router::new(|| FsWorker));

pub(crate) enum FsRequest {
    Read {
        file: Arc<cap_std::fs::File>,
        offset: u64,
        stream: StreamWriter<Bytes>,
    },
    Write {
        file: Arc<cap_std::fs::File>,
        offset: u64,
        stream: StreamReader<Bytes>,
    },
    Append {
        file: Arc<cap_std::fs::File>,
        stream: StreamReader<Bytes>,
    },
    ReadDir {
        dir: Arc<cap_std::fs::Dir>,
        stream: StreamWriter<DirectoryEntry>,
    },
}

impl Operation for FsRequest {
    fn name(&self) -> &'static str {
        match self {
            FsRequest::Read { .. } => "read",
            FsRequest::Write { .. } => "write",
            FsRequest::Append { .. } => "append",
            FsRequest::ReadDir { .. } => "readDir",
        }
    }
}

pub(crate) struct FsWorker;

impl Service for FsWorker {
    type Request = FsRequest;
    type Response = ();
    type Error = FsError;
    const NAME: &'static str = "filesystem";

    fn call(&mut self, request: FsRequest) -> Dispatch<(), FsError> {
        match request {
            FsRequest::Read {
                file,
                offset,
                stream,
            } => Dispatch::pending(read(file, offset, stream)),
            FsRequest::Write {
                file,
                offset,
                stream,
            } => Dispatch::pending(write(file, Some(offset), stream)),
            FsRequest::Append { file, stream } => Dispatch::pending(write(file, None, stream)),
            FsRequest::ReadDir { dir, stream } => Dispatch::pending(read_dir(dir, stream)),
        }
    }
}

async fn read(
    file: Arc<cap_std::fs::File>,
    mut offset: u64,
    mut stream: StreamWriter<Bytes>,
) -> FsResult<()> {
    let mut buf = BytesMut::with_capacity(CHUNK_SIZE);
    loop {
        buf.resize(CHUNK_SIZE, 0);
        let f = Arc::clone(&file);
        let (res, mut filled) = spawn_blocking(move || {
            let res = f.read_at(&mut buf, offset);
            (res, buf)
        })
        .await;
        let n = match res {
            Ok(0) => {
                stream.close();
                return Ok(());
            }
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                buf = filled;
                continue;
            }
            Err(e) => {
                let err = FsError::from(e);
                stream.abort(err.clone());
                return Err(err);
            }
        };
        filled.truncate(n);
        let chunk = filled.split().freeze();
        buf = filled;
        offset = match u64::try_from(n).ok().and_then(|n| offset.checked_add(n)) {
            Some(offset) => offset,
            None => {
                let err = FsError::from(ErrorCode::Overflow);
                stream.abort(err.clone());
                return Err(err);
            }
        };
        if stream.write(chunk).await.is_err() {
            // Reader went away; nothing left to do.
            return Ok(());
        }
    }
}

/// Drains `stream` into `file`, either at explicit offsets or appending.
async fn write(
    file: Arc<cap_std::fs::File>,
    mut offset: Option<u64>,
    mut stream: StreamReader<Bytes>,
) -> FsResult<()> {
    loop {
        let chunk = match stream.read().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => return Ok(()),
            Err(e) => {
                if let Some(err) = e.downcast_ref::<FsError>() {
                    return Err(err.clone());
                }
                return Err(FsError::with_detail(ErrorCode::Io, e.to_string()));
            }
        };
        if chunk.is_empty() {
            continue;
        }
        let f = Arc::clone(&file);
        offset = spawn_blocking(move || write_chunk(&f, offset, &chunk)).await?;
    }
}

fn write_chunk(
    file: &cap_std::fs::File,
    offset: Option<u64>,
    buf: &[u8],
) -> FsResult<Option<u64>> {
    write_fully(buf, offset, |buf, offset| match offset {
        Some(offset) => file.write_at(buf, offset),
        None => file.append(buf),
    })
}

/// Calls `write` until all of `buf` is written, advancing `offset` when
/// writing positionally. A write that accepts nothing is an error.
fn write_fully(
    mut buf: &[u8],
    mut offset: Option<u64>,
    mut write: impl FnMut(&[u8], Option<u64>) -> io::Result<usize>,
) -> FsResult<Option<u64>> {
    while !buf.is_empty() {
        let n = write(buf, offset)?;
        if n == 0 {
            return Err(io::Error::from(io::ErrorKind::WriteZero).into());
        }
        buf = &buf[n..];
        if let Some(pos) = offset.as_mut() {
            *pos = pos
                .checked_add(u64::try_from(n)?)
                .ok_or(ErrorCode::Overflow)?;
        }
    }
    Ok(offset)
}

async fn read_dir(
    dir: Arc<cap_std::fs::Dir>,
    mut stream: StreamWriter<DirectoryEntry>,
) -> FsResult<()> {
    let res = list_entries(dir, &mut stream).await;
    match &res {
        Ok(()) => stream.close(),
        Err(err) => stream.abort(err.clone()),
    }
    res
}

async fn list_entries(
    dir: Arc<cap_std::fs::Dir>,
    stream: &mut StreamWriter<DirectoryEntry>,
) -> FsResult<()> {
    let mut entries = spawn_blocking(move || dir.entries()).await?;
    loop {
        let (next, rest) = spawn_blocking(move || {
            let next = entries.next().map(|entry| {
                let entry = entry?;
                let type_ = DescriptorType::from(entry.file_type()?);
                let name = entry
                    .file_name()
                    .into_string()
                    .map_err(|_| FsError::from(ErrorCode::IllegalByteSequence))?;
                FsResult::Ok(DirectoryEntry { type_, name })
            });
            (next, entries)
        })
        .await;
        entries = rest;
        let entry = match next {
            Some(entry) => entry?,
            None => return Ok(()),
        };
        if entry.name == "." || entry.name == ".." {
            continue;
        }
        if stream.write(entry).await.is_err() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_writes_are_resumed_at_the_next_offset() {
        let mut calls = Vec::new();
        let end = write_fully(b"abcdef", Some(10), |buf, offset| {
            calls.push((buf.len(), offset));
            Ok(buf.len().min(4))
        })
        .unwrap();
        assert_eq!(end, Some(16));
        assert_eq!(calls, vec![(6, Some(10)), (2, Some(14))]);
    }

    #[test]
    fn a_write_accepting_nothing_fails() {
        let mut calls = 0;
        let err = write_fully(b"abc", None, |_, _| {
            calls += 1;
            Ok(0)
        })
        .unwrap_err();
        assert_eq!(*err.code(), ErrorCode::Io);
        assert_eq!(calls, 1);
    }

    #[test]
    fn offsets_past_u64_max_overflow() {
        let err = write_fully(b"ab", Some(u64::MAX - 1), |buf, _| Ok(buf.len())).unwrap_err();
        assert_eq!(*err.code(), ErrorCode::Overflow);
    }
}
