//! 带长度前缀的引用列表：`crc(4) || [len(u8) || id]*`。
//!
//! 列表长度由缓冲区末尾隐式决定。追加和删除直接作用于编码后的数据，
//! 调用方无需展开整个列表。

use super::{CHECKSUM_SIZE, CodecError, Result, seal, unseal};

pub const MAX_IDENTIFIER_LEN: usize = u8::MAX as usize;

pub fn encode_reference_list<I, T>(ids: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    let mut buf = vec![0u8; CHECKSUM_SIZE];
    push_entries(&mut buf, ids)?;
    seal(&mut buf);
    Ok(buf)
}

pub fn decode_reference_list(buf: &[u8]) -> Result<Vec<&[u8]>> {
    if buf.len() < CHECKSUM_SIZE {
        return Err(CodecError::InvalidData);
    }
    let mut body = unseal(buf)?;
    let mut ids = Vec::new();
    while !body.is_empty() {
        let (id, rest) = split_entry(body)?;
        ids.push(id);
        body = rest;
    }
    Ok(ids)
}

/// 在 `existing` 已有条目之后追加 `extra`，重复项保留。
pub fn append_encoded<I, T>(existing: &[u8], extra: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    if existing.len() < CHECKSUM_SIZE {
        return Err(CodecError::InvalidData);
    }
    unseal(existing)?;
    let mut buf = existing.to_vec();
    push_entries(&mut buf, extra)?;
    seal(&mut buf);
    Ok(buf)
}

/// 删除所有与 `to_remove` 中任一项相等的条目。
pub fn remove_encoded<T: AsRef<[u8]>>(existing: &[u8], to_remove: &[T]) -> Result<Vec<u8>> {
    if existing.len() < CHECKSUM_SIZE {
        return Err(CodecError::InvalidData);
    }
    let mut body = unseal(existing)?;
    let mut buf = Vec::with_capacity(existing.len());
    buf.extend_from_slice(&[0; CHECKSUM_SIZE]);
    while !body.is_empty() {
        let entry_len = 1 + body[0] as usize;
        let (id, rest) = split_entry(body)?;
        if !to_remove.iter().any(|r| r.as_ref() == id) {
            buf.extend_from_slice(&body[..entry_len]);
        }
        body = rest;
    }
    seal(&mut buf);
    Ok(buf)
}

fn push_entries<I, T>(buf: &mut Vec<u8>, ids: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    for id in ids {
        let id = id.as_ref();
        if id.is_empty() {
            return Err(CodecError::NoPayload("identifier"));
        }
        if id.len() > MAX_IDENTIFIER_LEN {
            return Err(CodecError::IdentifierTooLong(id.len()));
        }
        buf.push(id.len() as u8);
        buf.extend_from_slice(id);
    }
    Ok(())
}

fn split_entry(body: &[u8]) -> Result<(&[u8], &[u8])> {
    let len = body[0] as usize;
    if len == 0 || body.len() < 1 + len {
        return Err(CodecError::InvalidData);
    }
    Ok((&body[1..1 + len], &body[1 + len..]))
}
