//! The file-protocol message codec.
//!
//! Requests and responses are compact little-endian messages:
//! `size[4] type[1] tag[2] body`, with `size` counting the whole message.
//! Strings are `len[2]` followed by UTF-8 bytes. The multiplexer never looks
//! inside a message; only the client and the servers encode/decode.

use std::io::{Cursor, Read};

use super::MAX_MSG;

/// Protocol version string negotiated at mount time.
pub const VERSION: &str = "remux.1";

/// Largest read/write payload a peer should request, leaving headroom for
/// message framing inside [`MAX_MSG`].
pub const IOUNIT: u32 = (MAX_MSG - 64) as u32;

/// Directory bit in [`Stat::mode`] and [`Qid::ty`].
pub const QID_DIR: u8 = 0x80;
/// Append-only bit in [`Qid::ty`].
pub const QID_APPEND: u8 = 0x40;
/// Directory bit in a stat mode word.
pub const MODE_DIR: u32 = 0x8000_0000;

/// Errors produced while encoding or decoding messages.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    /// Input ended before the declared message did.
    #[error("truncated message")]
    Truncated,
    /// Unknown message type byte.
    #[error("unsupported message type {0}")]
    Unsupported(u8),
    /// A string field held invalid UTF-8.
    #[error("invalid utf8 in string field")]
    InvalidUtf8,
    /// Declared size disagrees with the buffer handed in.
    #[error("length mismatch: declared {declared} actual {actual}")]
    LengthMismatch {
        /// Size declared in the message header.
        declared: u32,
        /// Actual byte length observed.
        actual: usize,
    },
    /// A walk element was empty or contained a NUL byte.
    #[error("invalid path component")]
    InvalidPath,
    /// Payload would not fit in [`MAX_MSG`].
    #[error("message too big")]
    TooBig,
}

/// Server-assigned identity of one file node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Qid {
    /// Type bits ([`QID_DIR`], [`QID_APPEND`]).
    pub ty: u8,
    /// Version counter, unused by remux but carried for protocol fit.
    pub version: u32,
    /// Unique path number within one service.
    pub path: u64,
}

impl Qid {
    /// Whether the node is a directory.
    pub fn is_dir(&self) -> bool {
        self.ty & QID_DIR != 0
    }
}

/// Open access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read only.
    Read,
    /// Write only.
    Write,
    /// Read and write.
    ReadWrite,
}

impl OpenMode {
    /// Wire representation.
    pub fn raw(self) -> u8 {
        match self {
            OpenMode::Read => 0,
            OpenMode::Write => 1,
            OpenMode::ReadWrite => 2,
        }
    }

    fn from_bits(value: u8) -> Result<Self, CodecError> {
        match value & 0x03 {
            0 => Ok(OpenMode::Read),
            1 => Ok(OpenMode::Write),
            2 => Ok(OpenMode::ReadWrite),
            _ => Err(CodecError::Unsupported(value)),
        }
    }

    /// Whether the mode permits reading.
    pub fn allows_read(self) -> bool {
        matches!(self, OpenMode::Read | OpenMode::ReadWrite)
    }

    /// Whether the mode permits writing.
    pub fn allows_write(self) -> bool {
        matches!(self, OpenMode::Write | OpenMode::ReadWrite)
    }
}

/// File metadata as carried by `Rstat` and directory reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    /// Final path element ("/" for a service root).
    pub name: String,
    /// Permission word; [`MODE_DIR`] set for directories.
    pub mode: u32,
    /// Byte length (0 for synthetic files).
    pub length: u64,
    /// Node identity.
    pub qid: Qid,
}

impl Stat {
    /// Append the record to `out` in its wire form (`size[2]` + fields), as
    /// used for directory reads: a directory's contents are a back-to-back
    /// run of these records.
    pub fn encode(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.extend_from_slice(&0u16.to_le_bytes());
        put_qid(out, &self.qid);
        out.extend_from_slice(&self.mode.to_le_bytes());
        out.extend_from_slice(&self.length.to_le_bytes());
        put_string(out, &self.name);
        let size = (out.len() - start - 2) as u16;
        out[start..start + 2].copy_from_slice(&size.to_le_bytes());
    }

    /// Decode one record from the cursor.
    pub fn decode(cursor: &mut Cursor<&[u8]>) -> Result<Stat, CodecError> {
        let _size = read_u16(cursor)?;
        let qid = read_qid(cursor)?;
        let mode = read_u32(cursor)?;
        let length = read_u64(cursor)?;
        let name = read_string(cursor)?;
        Ok(Stat {
            name,
            mode,
            length,
            qid,
        })
    }

    /// Decode a whole directory-read payload into records.
    pub fn decode_all(data: &[u8]) -> Result<Vec<Stat>, CodecError> {
        let mut cursor = Cursor::new(data);
        let mut out = Vec::new();
        while (cursor.position() as usize) < data.len() {
            out.push(Stat::decode(&mut cursor)?);
        }
        Ok(out)
    }
}

/// Request envelope: tag plus body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Echoed back by the matching response.
    pub tag: u16,
    /// Concrete request payload.
    pub body: RequestBody,
}

/// Response envelope: tag plus body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Mirrors the request tag.
    pub tag: u16,
    /// Concrete response payload.
    pub body: ResponseBody,
}

/// Request variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    /// Negotiate message size and version.
    Version {
        /// Requested maximum message size.
        msize: u32,
        /// Client's protocol version string.
        version: String,
    },
    /// Bind a fid to the service root.
    Attach {
        /// Fid to associate with the root.
        fid: u32,
    },
    /// Derive `newfid` from `fid` by walking path elements (possibly none).
    Walk {
        /// Source fid.
        fid: u32,
        /// Destination fid.
        newfid: u32,
        /// Elements to traverse; `".."` walks up.
        wnames: Vec<String>,
    },
    /// Open a walked fid for I/O.
    Open {
        /// Fid to open.
        fid: u32,
        /// Requested access.
        mode: OpenMode,
    },
    /// Create and open a new file under a directory fid.
    Create {
        /// Directory fid; rebinds to the created file.
        fid: u32,
        /// Name of the new file.
        name: String,
        /// Access after creation.
        mode: OpenMode,
        /// Permission word.
        perm: u32,
    },
    /// Read from an open fid.
    Read {
        /// Fid to read.
        fid: u32,
        /// Byte offset.
        offset: u64,
        /// Bytes requested; capped at [`IOUNIT`].
        count: u32,
    },
    /// Write to an open fid.
    Write {
        /// Fid to write.
        fid: u32,
        /// Byte offset (ignored by stream-like files).
        offset: u64,
        /// Payload.
        data: Vec<u8>,
    },
    /// Fetch metadata for a fid.
    Stat {
        /// Fid to stat.
        fid: u32,
    },
    /// Release a fid.
    Clunk {
        /// Fid to release.
        fid: u32,
    },
}

/// Response variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    /// Negotiated parameters.
    Version {
        /// Accepted maximum message size.
        msize: u32,
        /// Accepted version string.
        version: String,
    },
    /// Root qid for an attach.
    Attach {
        /// Qid of the service root.
        qid: Qid,
    },
    /// Qids for each traversed element.
    Walk {
        /// One qid per walked element.
        qids: Vec<Qid>,
    },
    /// Open confirmation.
    Open {
        /// Qid of the opened node.
        qid: Qid,
        /// Preferred transfer size.
        iounit: u32,
    },
    /// Create confirmation.
    Create {
        /// Qid of the created node.
        qid: Qid,
        /// Preferred transfer size.
        iounit: u32,
    },
    /// Read payload.
    Read {
        /// Bytes read (empty means end of file).
        data: Vec<u8>,
    },
    /// Write acknowledgement.
    Write {
        /// Bytes accepted.
        count: u32,
    },
    /// Metadata.
    Stat {
        /// The record.
        stat: Stat,
    },
    /// Fid released.
    Clunk,
    /// Operation failed.
    Error {
        /// Human-readable cause.
        message: String,
    },
}

// Message type bytes. T-messages are even, the matching R-message is +1.
const TVERSION: u8 = 100;
const RVERSION: u8 = 101;
const TATTACH: u8 = 102;
const RATTACH: u8 = 103;
const TWALK: u8 = 104;
const RWALK: u8 = 105;
const TOPEN: u8 = 106;
const ROPEN: u8 = 107;
const TCREATE: u8 = 108;
const RCREATE: u8 = 109;
const TREAD: u8 = 110;
const RREAD: u8 = 111;
const TWRITE: u8 = 112;
const RWRITE: u8 = 113;
const TSTAT: u8 = 114;
const RSTAT: u8 = 115;
const TCLUNK: u8 = 116;
const RCLUNK: u8 = 117;
const RERROR: u8 = 119;

/// Encode a request into its wire form.
pub fn encode_request(request: &Request) -> Result<Vec<u8>, CodecError> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&request.tag.to_le_bytes());
    let ty = match &request.body {
        RequestBody::Version { msize, version } => {
            payload.extend_from_slice(&msize.to_le_bytes());
            put_string(&mut payload, version);
            TVERSION
        }
        RequestBody::Attach { fid } => {
            payload.extend_from_slice(&fid.to_le_bytes());
            TATTACH
        }
        RequestBody::Walk {
            fid,
            newfid,
            wnames,
        } => {
            payload.extend_from_slice(&fid.to_le_bytes());
            payload.extend_from_slice(&newfid.to_le_bytes());
            let count: u16 = wnames.len().try_into().map_err(|_| CodecError::InvalidPath)?;
            payload.extend_from_slice(&count.to_le_bytes());
            for name in wnames {
                validate_component(name)?;
                put_string(&mut payload, name);
            }
            TWALK
        }
        RequestBody::Open { fid, mode } => {
            payload.extend_from_slice(&fid.to_le_bytes());
            payload.push(mode.raw());
            TOPEN
        }
        RequestBody::Create {
            fid,
            name,
            mode,
            perm,
        } => {
            payload.extend_from_slice(&fid.to_le_bytes());
            put_string(&mut payload, name);
            payload.push(mode.raw());
            payload.extend_from_slice(&perm.to_le_bytes());
            TCREATE
        }
        RequestBody::Read { fid, offset, count } => {
            payload.extend_from_slice(&fid.to_le_bytes());
            payload.extend_from_slice(&offset.to_le_bytes());
            payload.extend_from_slice(&count.to_le_bytes());
            TREAD
        }
        RequestBody::Write { fid, offset, data } => {
            payload.extend_from_slice(&fid.to_le_bytes());
            payload.extend_from_slice(&offset.to_le_bytes());
            let count = data.len() as u32;
            payload.extend_from_slice(&count.to_le_bytes());
            payload.extend_from_slice(data);
            TWRITE
        }
        RequestBody::Stat { fid } => {
            payload.extend_from_slice(&fid.to_le_bytes());
            TSTAT
        }
        RequestBody::Clunk { fid } => {
            payload.extend_from_slice(&fid.to_le_bytes());
            TCLUNK
        }
    };
    finish(ty, &payload)
}

/// Encode a response into its wire form.
pub fn encode_response(response: &Response) -> Result<Vec<u8>, CodecError> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&response.tag.to_le_bytes());
    let ty = match &response.body {
        ResponseBody::Version { msize, version } => {
            payload.extend_from_slice(&msize.to_le_bytes());
            put_string(&mut payload, version);
            RVERSION
        }
        ResponseBody::Attach { qid } => {
            put_qid(&mut payload, qid);
            RATTACH
        }
        ResponseBody::Walk { qids } => {
            let count: u16 = qids.len().try_into().map_err(|_| CodecError::InvalidPath)?;
            payload.extend_from_slice(&count.to_le_bytes());
            for qid in qids {
                put_qid(&mut payload, qid);
            }
            RWALK
        }
        ResponseBody::Open { qid, iounit } => {
            put_qid(&mut payload, qid);
            payload.extend_from_slice(&iounit.to_le_bytes());
            ROPEN
        }
        ResponseBody::Create { qid, iounit } => {
            put_qid(&mut payload, qid);
            payload.extend_from_slice(&iounit.to_le_bytes());
            RCREATE
        }
        ResponseBody::Read { data } => {
            let count = data.len() as u32;
            payload.extend_from_slice(&count.to_le_bytes());
            payload.extend_from_slice(data);
            RREAD
        }
        ResponseBody::Write { count } => {
            payload.extend_from_slice(&count.to_le_bytes());
            RWRITE
        }
        ResponseBody::Stat { stat } => {
            stat.encode(&mut payload);
            RSTAT
        }
        ResponseBody::Clunk => RCLUNK,
        ResponseBody::Error { message } => {
            put_string(&mut payload, message);
            RERROR
        }
    };
    finish(ty, &payload)
}

/// Decode a request from one complete message.
pub fn decode_request(bytes: &[u8]) -> Result<Request, CodecError> {
    let (ty, payload) = decode_message(bytes)?;
    let mut cursor = Cursor::new(payload);
    let tag = read_u16(&mut cursor)?;
    let body = match ty {
        TVERSION => {
            let msize = read_u32(&mut cursor)?;
            let version = read_string(&mut cursor)?;
            RequestBody::Version { msize, version }
        }
        TATTACH => RequestBody::Attach {
            fid: read_u32(&mut cursor)?,
        },
        TWALK => {
            let fid = read_u32(&mut cursor)?;
            let newfid = read_u32(&mut cursor)?;
            let nwname = read_u16(&mut cursor)? as usize;
            let mut wnames = Vec::with_capacity(nwname.min(16));
            for _ in 0..nwname {
                let name = read_string(&mut cursor)?;
                validate_component(&name)?;
                wnames.push(name);
            }
            RequestBody::Walk {
                fid,
                newfid,
                wnames,
            }
        }
        TOPEN => {
            let fid = read_u32(&mut cursor)?;
            let mode = OpenMode::from_bits(read_u8(&mut cursor)?)?;
            RequestBody::Open { fid, mode }
        }
        TCREATE => {
            let fid = read_u32(&mut cursor)?;
            let name = read_string(&mut cursor)?;
            let mode = OpenMode::from_bits(read_u8(&mut cursor)?)?;
            let perm = read_u32(&mut cursor)?;
            RequestBody::Create {
                fid,
                name,
                mode,
                perm,
            }
        }
        TREAD => {
            let fid = read_u32(&mut cursor)?;
            let offset = read_u64(&mut cursor)?;
            let count = read_u32(&mut cursor)?;
            RequestBody::Read { fid, offset, count }
        }
        TWRITE => {
            let fid = read_u32(&mut cursor)?;
            let offset = read_u64(&mut cursor)?;
            let count = read_u32(&mut cursor)? as usize;
            let mut data = vec![0u8; count];
            cursor.read_exact(&mut data).map_err(|_| CodecError::Truncated)?;
            RequestBody::Write { fid, offset, data }
        }
        TSTAT => RequestBody::Stat {
            fid: read_u32(&mut cursor)?,
        },
        TCLUNK => RequestBody::Clunk {
            fid: read_u32(&mut cursor)?,
        },
        other => return Err(CodecError::Unsupported(other)),
    };
    Ok(Request { tag, body })
}

/// Decode a response from one complete message.
pub fn decode_response(bytes: &[u8]) -> Result<Response, CodecError> {
    let (ty, payload) = decode_message(bytes)?;
    let mut cursor = Cursor::new(payload);
    let tag = read_u16(&mut cursor)?;
    let body = match ty {
        RVERSION => {
            let msize = read_u32(&mut cursor)?;
            let version = read_string(&mut cursor)?;
            ResponseBody::Version { msize, version }
        }
        RATTACH => ResponseBody::Attach {
            qid: read_qid(&mut cursor)?,
        },
        RWALK => {
            let count = read_u16(&mut cursor)? as usize;
            let mut qids = Vec::with_capacity(count.min(16));
            for _ in 0..count {
                qids.push(read_qid(&mut cursor)?);
            }
            ResponseBody::Walk { qids }
        }
        ROPEN => {
            let qid = read_qid(&mut cursor)?;
            let iounit = read_u32(&mut cursor)?;
            ResponseBody::Open { qid, iounit }
        }
        RCREATE => {
            let qid = read_qid(&mut cursor)?;
            let iounit = read_u32(&mut cursor)?;
            ResponseBody::Create { qid, iounit }
        }
        RREAD => {
            let count = read_u32(&mut cursor)? as usize;
            let mut data = vec![0u8; count];
            cursor.read_exact(&mut data).map_err(|_| CodecError::Truncated)?;
            ResponseBody::Read { data }
        }
        RWRITE => ResponseBody::Write {
            count: read_u32(&mut cursor)?,
        },
        RSTAT => ResponseBody::Stat {
            stat: Stat::decode(&mut cursor)?,
        },
        RCLUNK => ResponseBody::Clunk,
        RERROR => ResponseBody::Error {
            message: read_string(&mut cursor)?,
        },
        other => return Err(CodecError::Unsupported(other)),
    };
    Ok(Response { tag, body })
}

fn finish(ty: u8, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    let size = payload.len() + 5;
    if size > MAX_MSG {
        return Err(CodecError::TooBig);
    }
    let mut buffer = Vec::with_capacity(size);
    buffer.extend_from_slice(&(size as u32).to_le_bytes());
    buffer.push(ty);
    buffer.extend_from_slice(payload);
    Ok(buffer)
}

fn decode_message(bytes: &[u8]) -> Result<(u8, &[u8]), CodecError> {
    if bytes.len() < 5 {
        return Err(CodecError::Truncated);
    }
    let declared = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    if declared as usize != bytes.len() {
        return Err(CodecError::LengthMismatch {
            declared,
            actual: bytes.len(),
        });
    }
    Ok((bytes[4], &bytes[5..]))
}

fn put_string(buffer: &mut Vec<u8>, value: &str) {
    let len = value.len() as u16;
    buffer.extend_from_slice(&len.to_le_bytes());
    buffer.extend_from_slice(value.as_bytes());
}

fn put_qid(buffer: &mut Vec<u8>, qid: &Qid) {
    buffer.push(qid.ty);
    buffer.extend_from_slice(&qid.version.to_le_bytes());
    buffer.extend_from_slice(&qid.path.to_le_bytes());
}

fn read_u8(cursor: &mut Cursor<&[u8]>) -> Result<u8, CodecError> {
    let mut buf = [0u8; 1];
    cursor.read_exact(&mut buf).map_err(|_| CodecError::Truncated)?;
    Ok(buf[0])
}

fn read_u16(cursor: &mut Cursor<&[u8]>) -> Result<u16, CodecError> {
    let mut buf = [0u8; 2];
    cursor.read_exact(&mut buf).map_err(|_| CodecError::Truncated)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32, CodecError> {
    let mut buf = [0u8; 4];
    cursor.read_exact(&mut buf).map_err(|_| CodecError::Truncated)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(cursor: &mut Cursor<&[u8]>) -> Result<u64, CodecError> {
    let mut buf = [0u8; 8];
    cursor.read_exact(&mut buf).map_err(|_| CodecError::Truncated)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_string(cursor: &mut Cursor<&[u8]>) -> Result<String, CodecError> {
    let len = read_u16(cursor)? as usize;
    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf).map_err(|_| CodecError::Truncated)?;
    String::from_utf8(buf).map_err(|_| CodecError::InvalidUtf8)
}

fn read_qid(cursor: &mut Cursor<&[u8]>) -> Result<Qid, CodecError> {
    let ty = read_u8(cursor)?;
    let version = read_u32(cursor)?;
    let path = read_u64(cursor)?;
    Ok(Qid { ty, version, path })
}

// Walk elements may be ".." (walk up) but never empty or NUL-bearing.
fn validate_component(component: &str) -> Result<(), CodecError> {
    if component.is_empty() || component.as_bytes().contains(&0) {
        return Err(CodecError::InvalidPath);
    }
    Ok(())
}
