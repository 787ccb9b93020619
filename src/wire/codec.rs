use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use super::{Op, ERR_STATUS, HEADER_SIZE, TENSOR_HDR_SIZE};
use crate::error::{EngineError, EngineResult};
use crate::ids::{ChunkDescriptor, Direction};
use crate::tensor::TENSOR_NAME_LEN;

/// Request header: `{op: u32, field1..4: u32}`, `HEADER_SIZE` bytes total.
/// `field1` carries the op-specific count (number of tensor names for PULL,
/// number of tensors for PUSH); `field2..4` are reserved for future use and
/// always zero today.
#[derive(Debug, Clone, Copy)]
pub struct RequestHeader {
    pub op: Op,
    pub field1: u32,
    pub field2: u32,
    pub field3: u32,
    pub field4: u32,
}

impl RequestHeader {
    pub fn new(op: Op, field1: u32) -> Self {
        Self { op, field1, field2: 0, field3: 0, field4: 0 }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.write_u32::<LittleEndian>(self.op as u32).unwrap();
        buf.write_u32::<LittleEndian>(self.field1).unwrap();
        buf.write_u32::<LittleEndian>(self.field2).unwrap();
        buf.write_u32::<LittleEndian>(self.field3).unwrap();
        buf.write_u32::<LittleEndian>(self.field4).unwrap();
        buf
    }

    pub fn decode(bytes: &[u8]) -> EngineResult<Self> {
        if bytes.len() != HEADER_SIZE {
            return Err(EngineError::ProtocolViolation {
                reason: format!("request header size {} != {}", bytes.len(), HEADER_SIZE),
            });
        }
        let mut cur = Cursor::new(bytes);
        let op_raw = cur.read_u32::<LittleEndian>()?;
        let op = Op::from_u32(op_raw)
            .ok_or_else(|| EngineError::ProtocolViolation { reason: format!("unknown op {op_raw}") })?;
        Ok(Self {
            op,
            field1: cur.read_u32::<LittleEndian>()?,
            field2: cur.read_u32::<LittleEndian>()?,
            field3: cur.read_u32::<LittleEndian>()?,
            field4: cur.read_u32::<LittleEndian>()?,
        })
    }
}

/// Tensor header: `{status: u32, name[8], rows: u32, cols: u32}`, padded to
/// `TENSOR_HDR_SIZE` (24) bytes with 4 reserved bytes, per §6.
#[derive(Debug, Clone, Copy)]
pub struct TensorHeader {
    pub status: u32,
    pub name: [u8; TENSOR_NAME_LEN],
    pub rows: u32,
    pub cols: u32,
}

impl TensorHeader {
    pub fn ok(name: &str, rows: u32, cols: u32) -> Self {
        let mut buf = [0u8; TENSOR_NAME_LEN];
        let n = name.len().min(TENSOR_NAME_LEN);
        buf[..n].copy_from_slice(&name.as_bytes()[..n]);
        Self { status: 0, name: buf, rows, cols }
    }

    pub fn error(name: &str) -> Self {
        let mut hdr = Self::ok(name, 0, 0);
        hdr.status = ERR_STATUS;
        hdr
    }

    pub fn is_error(&self) -> bool {
        self.status == ERR_STATUS
    }

    pub fn name_str(&self) -> String {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(TENSOR_NAME_LEN);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(TENSOR_HDR_SIZE);
        buf.write_u32::<LittleEndian>(self.status).unwrap();
        buf.extend_from_slice(&self.name);
        buf.write_u32::<LittleEndian>(self.rows).unwrap();
        buf.write_u32::<LittleEndian>(self.cols).unwrap();
        buf.write_u32::<LittleEndian>(0).unwrap(); // padding to constant width
        buf
    }

    pub fn decode(bytes: &[u8]) -> EngineResult<Self> {
        if bytes.len() != TENSOR_HDR_SIZE {
            return Err(EngineError::ProtocolViolation {
                reason: format!("tensor header size {} != {}", bytes.len(), TENSOR_HDR_SIZE),
            });
        }
        let mut cur = Cursor::new(bytes);
        let status = cur.read_u32::<LittleEndian>()?;
        let mut name = [0u8; TENSOR_NAME_LEN];
        std::io::Read::read_exact(&mut cur, &mut name)?;
        let rows = cur.read_u32::<LittleEndian>()?;
        let cols = cur.read_u32::<LittleEndian>()?;
        Ok(Self { status, name, rows, cols })
    }
}

/// Fixed-width wire encoding of a `ChunkDescriptor`, carried as a dedicated
/// frame on every RPC so the receiver can authenticate the request against
/// the timeout table before looking at anything else.
pub struct ChunkWire;

impl ChunkWire {
    pub const SIZE: usize = 4 + 8 + 4 + 4 + 4 + 4 + 4 + 4;

    pub fn encode(chunk: &ChunkDescriptor) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.write_u32::<LittleEndian>(chunk.local_id).unwrap();
        buf.write_u64::<LittleEndian>(chunk.global_id).unwrap();
        buf.write_u32::<LittleEndian>(chunk.low_bound).unwrap();
        buf.write_u32::<LittleEndian>(chunk.up_bound).unwrap();
        buf.write_u32::<LittleEndian>(chunk.layer).unwrap();
        buf.write_u32::<LittleEndian>(if chunk.direction == Direction::Forward { 0 } else { 1 }).unwrap();
        buf.write_u32::<LittleEndian>(chunk.epoch).unwrap();
        buf.write_u32::<LittleEndian>(if chunk.vertex { 1 } else { 0 }).unwrap();
        buf
    }

    pub fn decode(bytes: &[u8]) -> EngineResult<ChunkDescriptor> {
        if bytes.len() != Self::SIZE {
            return Err(EngineError::ProtocolViolation {
                reason: format!("chunk frame size {} != {}", bytes.len(), Self::SIZE),
            });
        }
        let mut cur = Cursor::new(bytes);
        let local_id = cur.read_u32::<LittleEndian>()?;
        let global_id = cur.read_u64::<LittleEndian>()?;
        let low_bound = cur.read_u32::<LittleEndian>()?;
        let up_bound = cur.read_u32::<LittleEndian>()?;
        let layer = cur.read_u32::<LittleEndian>()?;
        let direction = if cur.read_u32::<LittleEndian>()? == 0 { Direction::Forward } else { Direction::Backward };
        let epoch = cur.read_u32::<LittleEndian>()?;
        let vertex = cur.read_u32::<LittleEndian>()? != 0;
        Ok(ChunkDescriptor { local_id, global_id, low_bound, up_bound, layer, direction, epoch, vertex })
    }
}
