use super::{CHECKSUM_SIZE, CodecError, Result, seal, unseal};

const RESERVED_SIZE: usize = 8;
const STORE_STAT_SIZE: usize = CHECKSUM_SIZE + 16;

/// 用户数据，借用自解码所用的缓冲区。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Object<'a> {
    pub data: &'a [u8],
}

/// 租户记录：预留字节数以及所属的 label。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Namespace<'a> {
    pub reserved: u64,
    pub label: &'a [u8],
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStat {
    pub available: u64,
    pub used: u64,
}

/// `crc(4) || data`
pub fn encode_object(obj: Object<'_>) -> Result<Vec<u8>> {
    if obj.data.is_empty() {
        return Err(CodecError::NoPayload("data"));
    }
    let mut buf = Vec::with_capacity(CHECKSUM_SIZE + obj.data.len());
    buf.extend_from_slice(&[0; CHECKSUM_SIZE]);
    buf.extend_from_slice(obj.data);
    seal(&mut buf);
    Ok(buf)
}

/// 零拷贝解码对象，返回的数据借用 `buf`。
pub fn decode_object(buf: &[u8]) -> Result<Object<'_>> {
    if buf.len() < CHECKSUM_SIZE + 1 {
        return Err(CodecError::InvalidData);
    }
    let data = unseal(buf)?;
    Ok(Object { data })
}

/// `crc(4) || reserved(u64 LE) || label`
pub fn encode_namespace(ns: Namespace<'_>) -> Result<Vec<u8>> {
    if ns.label.is_empty() {
        return Err(CodecError::NoPayload("label"));
    }
    let mut buf = Vec::with_capacity(CHECKSUM_SIZE + RESERVED_SIZE + ns.label.len());
    buf.extend_from_slice(&[0; CHECKSUM_SIZE]);
    buf.extend_from_slice(&ns.reserved.to_le_bytes());
    buf.extend_from_slice(ns.label);
    seal(&mut buf);
    Ok(buf)
}

pub fn decode_namespace(buf: &[u8]) -> Result<Namespace<'_>> {
    if buf.len() < CHECKSUM_SIZE + RESERVED_SIZE + 1 {
        return Err(CodecError::InvalidData);
    }
    let blob = unseal(buf)?;
    let (reserved, label) = blob.split_at(RESERVED_SIZE);
    Ok(Namespace {
        reserved: read_u64(reserved),
        label,
    })
}

/// `crc(4) || available(u64 LE) || used(u64 LE)`，固定 20 字节。
pub fn encode_store_stat(stat: StoreStat) -> Vec<u8> {
    let mut buf = Vec::with_capacity(STORE_STAT_SIZE);
    buf.extend_from_slice(&[0; CHECKSUM_SIZE]);
    buf.extend_from_slice(&stat.available.to_le_bytes());
    buf.extend_from_slice(&stat.used.to_le_bytes());
    seal(&mut buf);
    buf
}

pub fn decode_store_stat(buf: &[u8]) -> Result<StoreStat> {
    if buf.len() != STORE_STAT_SIZE {
        return Err(CodecError::InvalidData);
    }
    let blob = unseal(buf)?;
    Ok(StoreStat {
        available: read_u64(&blob[..8]),
        used: read_u64(&blob[8..16]),
    })
}

/// 只校验记录外层的 checksum，不解码内容。
pub fn validate_data(buf: &[u8]) -> Result<()> {
    if buf.len() < CHECKSUM_SIZE + 1 {
        return Err(CodecError::InvalidData);
    }
    unseal(buf).map(|_| ())
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(raw)
}
