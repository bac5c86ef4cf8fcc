//! Record file replay
//!
//! Synthesizes the recorded HTTP response out of a `.http` file so tests can
//! run against deterministic fixtures without a live upstream. The recorded
//! request is deliberately ignored: the caller pairs the right file with the
//! right call.

use crate::error::{Result, TraceLabError};
use crate::record::{decode_header_block, HEADER_LEN};
use http::{HeaderName, HeaderValue, Response, StatusCode};
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Stateless round-tripper over one record file.
///
/// Each [`round_trip`](Transport::round_trip) opens a fresh handle, parses
/// the header slot, seeks to the recorded response, and hands back a
/// response whose body streams the rest of the file.
pub struct Transport {
    path: PathBuf,
}

/// Body of a replayed response. Reads to end-of-file; dropping it releases
/// the underlying file handle.
#[derive(Debug)]
pub struct ReplayBody {
    reader: BufReader<File>,
}

impl Read for ReplayBody {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

impl ReplayBody {
    /// Drain the remaining body into memory.
    pub fn bytes(mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.reader.read_to_end(&mut out)?;
        Ok(out)
    }
}

impl Transport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replay the recorded response.
    ///
    /// Fails when the file is missing, the header slot is malformed, or the
    /// recorded response head does not parse.
    pub fn round_trip(&self) -> Result<Response<ReplayBody>> {
        let mut file = File::open(&self.path).map_err(|e| {
            TraceLabError::Replay(format!("failed to open {}: {}", self.path.display(), e))
        })?;

        let mut slot = vec![0u8; HEADER_LEN];
        file.read_exact(&mut slot).map_err(|e| {
            TraceLabError::Replay(format!("failed to read header slot: {}", e))
        })?;
        let header = decode_header_block(&slot)
            .map_err(|e| TraceLabError::Replay(format!("invalid header slot: {}", e)))?;

        file.seek(SeekFrom::Start(header.response_offset()))
            .map_err(|e| TraceLabError::Replay(format!("seek failed: {}", e)))?;

        let mut reader = BufReader::new(file);
        let (status, headers) = read_response_head(&mut reader)?;

        let mut builder = Response::builder().status(status);
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        builder
            .body(ReplayBody { reader })
            .map_err(|e| TraceLabError::Replay(e.to_string()))
    }
}

/// Parse the dumped status line and headers, leaving the reader positioned
/// at the first body byte.
fn read_response_head(
    reader: &mut BufReader<File>,
) -> Result<(StatusCode, Vec<(HeaderName, HeaderValue)>)> {
    let mut status_line = String::new();
    reader
        .read_line(&mut status_line)
        .map_err(|e| TraceLabError::Replay(format!("failed to read status line: {}", e)))?;

    let mut parts = status_line.split_whitespace();
    let proto = parts.next().unwrap_or("");
    if !proto.starts_with("HTTP/") {
        return Err(TraceLabError::Replay(format!(
            "malformed status line: {:?}",
            status_line.trim_end()
        )));
    }
    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| {
            TraceLabError::Replay(format!("invalid status code in {:?}", status_line.trim_end()))
        })?;

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .map_err(|e| TraceLabError::Replay(format!("failed to read header line: {}", e)))?;
        if n == 0 {
            return Err(TraceLabError::Replay(
                "unexpected end of file in response head".to_string(),
            ));
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let Ok(name) = name.trim().parse::<HeaderName>() else {
            continue;
        };
        let Ok(value) = HeaderValue::from_str(value.trim()) else {
            continue;
        };
        headers.push((name, value));
    }

    Ok((status, headers))
}
