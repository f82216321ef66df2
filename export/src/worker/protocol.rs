//! Frame codec spoken with inference workers over stdin/stdout.
//!
//! Frame format (lengths are big-endian u32):
//!
//! ```text
//! header_len | header (JSON) | payload_len | payload
//! ```
//!
//! A request carries `{"op":"call","inputs":[spec]}` and the waveform as
//! little-endian payload. A response carries `{"outputs":[spec, ...]}`
//! with every output's little-endian data concatenated in order, or
//! `{"error":"..."}` with an empty payload.

use std::io::{ErrorKind, Read, Write};

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{ExportError, Result};
use crate::signature::WAVEFORM_INPUT;
use crate::tensor::{Tensor, TensorSpec, byte_len};

/// Upper bound on a header or payload section.
pub const MAX_SECTION_BYTES: usize = 256 << 20;

pub const OP_CALL: &str = "call";

/// JSON header of a frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Header {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<TensorSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<TensorSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One protocol frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Frame {
    /// A call request for one waveform.
    pub fn call(waveform: &Tensor) -> Self {
        Self {
            header: Header {
                op: Some(OP_CALL.to_string()),
                inputs: vec![TensorSpec::of(WAVEFORM_INPUT, waveform)],
                ..Default::default()
            },
            payload: waveform.to_le_bytes(),
        }
    }

    /// A successful response carrying `outputs`.
    pub fn reply(outputs: &[Tensor]) -> Self {
        let mut payload = Vec::new();
        let mut specs = Vec::with_capacity(outputs.len());
        for (i, t) in outputs.iter().enumerate() {
            specs.push(TensorSpec::of(format!("output_{i}"), t));
            payload.extend_from_slice(&t.to_le_bytes());
        }
        Self {
            header: Header {
                outputs: specs,
                ..Default::default()
            },
            payload,
        }
    }

    /// An error response.
    pub fn failure(msg: impl Into<String>) -> Self {
        Self {
            header: Header {
                error: Some(msg.into()),
                ..Default::default()
            },
            payload: Vec::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let header = serde_json::to_vec(&self.header)
            .map_err(|e| ExportError::Protocol(format!("encode header: {e}")))?;
        check_len("header", header.len())?;
        check_len("payload", self.payload.len())?;

        let mut buf = BytesMut::with_capacity(8 + header.len() + self.payload.len());
        buf.put_u32(header.len() as u32);
        buf.put_slice(&header);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        Ok(buf.to_vec())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        let header = take_section(&mut buf, "header")?;
        let payload = take_section(&mut buf, "payload")?;
        if buf.has_remaining() {
            return Err(ExportError::Protocol(format!(
                "{} trailing bytes after frame",
                buf.remaining()
            )));
        }
        Ok(Self {
            header: parse_header(header)?,
            payload: payload.to_vec(),
        })
    }

    /// Splits a response into tensors, in header order.
    ///
    /// An `error` header becomes [`ExportError::Model`]. Every output
    /// spec must be fully defined and the payload must hold exactly the
    /// bytes those specs describe.
    pub fn into_outputs(self) -> Result<Vec<Tensor>> {
        if let Some(msg) = self.header.error {
            return Err(ExportError::Model(msg));
        }

        let mut rest = self.payload.as_slice();
        let mut outputs = Vec::with_capacity(self.header.outputs.len());
        for spec in &self.header.outputs {
            let shape = spec.fixed_shape().ok_or_else(|| {
                ExportError::Protocol(format!("output {:?} has undefined shape", spec.name))
            })?;
            let n = byte_len(&shape, spec.dtype).ok_or_else(|| {
                ExportError::Protocol(format!(
                    "output {:?} shape {spec} overflows the address space",
                    spec.name
                ))
            })?;
            if rest.len() < n {
                return Err(ExportError::Protocol(format!(
                    "output {:?} needs {n} bytes, {} left",
                    spec.name,
                    rest.len()
                )));
            }
            let (data, tail) = rest.split_at(n);
            outputs.push(Tensor::from_le_bytes(&shape, spec.dtype, data)?);
            rest = tail;
        }
        if !rest.is_empty() {
            return Err(ExportError::Protocol(format!(
                "{} payload bytes not described by outputs",
                rest.len()
            )));
        }
        Ok(outputs)
    }
}

/// Writes one frame and flushes.
pub fn write_frame<W: Write>(w: &mut W, frame: &Frame) -> Result<()> {
    w.write_all(&frame.encode()?)?;
    w.flush()?;
    Ok(())
}

/// Reads one frame. End of stream before a full frame is a protocol error.
pub fn read_frame<R: Read>(r: &mut R) -> Result<Frame> {
    let header = read_section(r, "header")?;
    let payload = read_section(r, "payload")?;
    Ok(Frame {
        header: parse_header(&header)?,
        payload,
    })
}

fn read_section<R: Read>(r: &mut R, what: &str) -> Result<Vec<u8>> {
    let mut len = [0u8; 4];
    read_exact(r, &mut len, what)?;
    let len = u32::from_be_bytes(len) as usize;
    check_len(what, len)?;
    let mut data = vec![0u8; len];
    read_exact(r, &mut data, what)?;
    Ok(data)
}

fn read_exact<R: Read>(r: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    r.read_exact(buf).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => {
            ExportError::Protocol(format!("worker closed the stream while sending {what}"))
        }
        _ => ExportError::Io(e),
    })
}

fn take_section<'a>(buf: &mut &'a [u8], what: &str) -> Result<&'a [u8]> {
    if buf.remaining() < 4 {
        return Err(ExportError::Protocol(format!("{what} length truncated")));
    }
    let len = buf.get_u32() as usize;
    check_len(what, len)?;
    if buf.remaining() < len {
        return Err(ExportError::Protocol(format!(
            "{what} truncated: want {len} bytes, have {}",
            buf.remaining()
        )));
    }
    let data: &'a [u8] = *buf;
    let (section, rest) = data.split_at(len);
    *buf = rest;
    Ok(section)
}

fn parse_header(data: &[u8]) -> Result<Header> {
    serde_json::from_slice(data).map_err(|e| ExportError::Protocol(format!("decode header: {e}")))
}

fn check_len(what: &str, len: usize) -> Result<()> {
    if len > MAX_SECTION_BYTES {
        return Err(ExportError::Protocol(format!(
            "{what} of {len} bytes exceeds limit of {MAX_SECTION_BYTES}"
        )));
    }
    Ok(())
}
