//! Decoder for the engine's record format (serial types).

use godwit_result::{Error, Result};
use rusqlite::types::Value;

/// Decode one variable-length integer starting at `pos`.
///
/// Seven payload bits per byte, big-endian, at most nine bytes; the ninth
/// byte contributes all eight bits.
pub(crate) fn read_varint(buf: &[u8], mut pos: usize) -> Result<(i64, usize)> {
    let mut value: i64 = 0;
    for i in 0..9 {
        let Some(&byte) = buf.get(pos) else {
            return Err(Error::corrupt("truncated varint"));
        };
        pos += 1;
        if i == 8 {
            value = (value << 8) | byte as i64;
            return Ok((value, pos));
        }
        value = (value << 7) | (byte & 0x7f) as i64;
        if byte & 0x80 == 0 {
            return Ok((value, pos));
        }
    }
    Err(Error::corrupt("overlong varint"))
}

/// Decode a full record payload into column values.
pub fn decode_record(payload: &[u8]) -> Result<Vec<Value>> {
    let (header_len, mut type_pos) = read_varint(payload, 0)?;
    let header_len = usize::try_from(header_len)
        .ok()
        .filter(|len| *len <= payload.len() && *len >= type_pos)
        .ok_or_else(|| Error::corrupt("record header length out of range"))?;

    let mut body_pos = header_len;
    let mut values = Vec::new();
    while type_pos < header_len {
        let (serial, next) = read_varint(payload, type_pos)?;
        type_pos = next;
        let (value, size) = decode_value(serial, payload, body_pos)?;
        body_pos += size;
        values.push(value);
    }
    Ok(values)
}

fn decode_value(serial: i64, payload: &[u8], pos: usize) -> Result<(Value, usize)> {
    let take = |len: usize| -> Result<&[u8]> {
        payload
            .get(pos..pos + len)
            .ok_or_else(|| Error::corrupt("record body truncated"))
    };
    match serial {
        0 => Ok((Value::Null, 0)),
        1 => Ok((Value::Integer(read_int(take(1)?)), 1)),
        2 => Ok((Value::Integer(read_int(take(2)?)), 2)),
        3 => Ok((Value::Integer(read_int(take(3)?)), 3)),
        4 => Ok((Value::Integer(read_int(take(4)?)), 4)),
        5 => Ok((Value::Integer(read_int(take(6)?)), 6)),
        6 => Ok((Value::Integer(read_int(take(8)?)), 8)),
        7 => {
            let bytes: [u8; 8] = take(8)?
                .try_into()
                .map_err(|_| Error::corrupt("bad float width"))?;
            Ok((Value::Real(f64::from_be_bytes(bytes)), 8))
        }
        8 => Ok((Value::Integer(0), 0)),
        9 => Ok((Value::Integer(1), 0)),
        10 | 11 => Err(Error::corrupt("reserved serial type in record")),
        n if n >= 12 && n % 2 == 0 => {
            let len = ((n - 12) / 2) as usize;
            Ok((Value::Blob(take(len)?.to_vec()), len))
        }
        n if n >= 13 => {
            let len = ((n - 13) / 2) as usize;
            let text = String::from_utf8_lossy(take(len)?).into_owned();
            Ok((Value::Text(text), len))
        }
        _ => Err(Error::corrupt("negative serial type in record")),
    }
}

/// Big-endian two's-complement integer of 1..=8 bytes.
fn read_int(bytes: &[u8]) -> i64 {
    let mut value = bytes[0] as i8 as i64;
    for &byte in &bytes[1..] {
        value = (value << 8) | byte as i64;
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_single_and_multi_byte() {
        assert_eq!(read_varint(&[0x07], 0).unwrap(), (7, 1));
        assert_eq!(read_varint(&[0x81, 0x00], 0).unwrap(), (128, 2));
        // Nine-byte varint: all 64 bits present.
        let all_ones = [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff];
        assert_eq!(read_varint(&all_ones, 0).unwrap(), (-1, 9));
        assert!(read_varint(&[0x80], 0).is_err());
    }

    #[test]
    fn negative_integers_are_sign_extended() {
        assert_eq!(read_int(&[0xff]), -1);
        assert_eq!(read_int(&[0xfe, 0x00]), -512);
        assert_eq!(read_int(&[0x01, 0x00]), 256);
    }

    #[test]
    fn record_round_trip_against_engine() {
        // Build a record with the engine itself, then decode the raw page.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("record.db");
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch(
            "PRAGMA journal_mode = DELETE;
             CREATE TABLE t (a INTEGER, b TEXT, c REAL, d BLOB, e INTEGER);
             INSERT INTO t VALUES (-513, 'hello', 1.5, x'0102', NULL);",
        )
        .unwrap();
        drop(conn);

        let mut pager = crate::pager::FilePager::open(&path).unwrap();
        let leaves = crate::btree::collect_leaves(&mut pager, 2, true).unwrap();
        let rows = crate::btree::decode_leaf(&mut pager, leaves[0]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows[0].values,
            vec![
                Value::Integer(-513),
                Value::Text("hello".to_string()),
                Value::Real(1.5),
                Value::Blob(vec![1, 2]),
                Value::Null,
            ]
        );
    }
}
