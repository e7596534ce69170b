//! 存储引擎中持久化的二进制记录格式。
//!
//! 每个持久化的值都以其后续字节的小端 CRC32 开头。多项式为反转表示
//!（LSB 优先）的 `0xD5828281`，因此这里算出的 checksum 只能与同一张表
//! 产生的 checksum 比较。

mod record;
mod reflist;

use crc::{Algorithm, Crc};
use thiserror::Error;

pub use record::{
    Namespace, Object, StoreStat, decode_namespace, decode_object, decode_store_stat,
    encode_namespace, encode_object, encode_store_stat, validate_data,
};
pub use reflist::{
    MAX_IDENTIFIER_LEN, append_encoded, decode_reference_list, encode_reference_list,
    remove_encoded,
};

/// 每条记录前缀 checksum 的字节数。
pub const CHECKSUM_SIZE: usize = 4;

/// 反射 CRC-32，反转多项式为 `0xD5828281`
///（常规表示为 `0x814141AB`）。
const CRC_32_OSTOR: Algorithm<u32> = Algorithm {
    width: 32,
    poly: 0x8141_41ab,
    init: 0xffff_ffff,
    refin: true,
    refout: true,
    xorout: 0xffff_ffff,
    check: 0xa9cc_8179,
    residue: 0x4ac2_a509,
};

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_OSTOR);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid data slice cannot be decoded")]
    InvalidData,
    #[error("decoded data had wrong checksum")]
    InvalidChecksum,
    #[error("no {0} given to encode")]
    NoPayload(&'static str),
    #[error("identifier of {0} bytes exceeds the maximum of 255")]
    IdentifierTooLong(usize),
}

pub type Result<T> = std::result::Result<T, CodecError>;

pub fn checksum(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// 将 `buf[CHECKSUM_SIZE..]` 的 checksum 写入前四个字节。
fn seal(buf: &mut [u8]) {
    let crc = checksum(&buf[CHECKSUM_SIZE..]);
    buf[..CHECKSUM_SIZE].copy_from_slice(&crc.to_le_bytes());
}

/// 校验前缀 checksum，并返回其后的数据。
///
/// 调用方保证 `buf.len() >= CHECKSUM_SIZE`。
fn unseal(buf: &[u8]) -> Result<&[u8]> {
    let (head, blob) = buf.split_at(CHECKSUM_SIZE);
    let stored = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
    if stored != checksum(blob) {
        return Err(CodecError::InvalidChecksum);
    }
    Ok(blob)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_matches_reference_table() {
        assert_eq!(checksum(b"123456789"), 0xa9cc_8179);
        assert_eq!(checksum(b"ping"), 0x61ff_2673);
        assert_eq!(checksum(b""), 0);
    }

    #[test]
    fn seal_then_unseal() {
        let mut buf = vec![0u8; CHECKSUM_SIZE];
        buf.extend_from_slice(b"payload");
        seal(&mut buf);
        assert_eq!(unseal(&buf).unwrap(), b"payload");

        buf[CHECKSUM_SIZE] ^= 0x01;
        assert_eq!(unseal(&buf), Err(CodecError::InvalidChecksum));
    }
}
