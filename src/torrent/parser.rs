//! Metainfo file parser
//!
//! Hand-rolled bencode reader. The recursive-descent walk keeps byte
//! offsets so the exact span of the `info` dictionary can be hashed,
//! which a decode/re-encode cycle cannot guarantee.

use anyhow::Result;
use tracing::{debug, info, trace, warn};

use crate::error::ShareError;

/// Parser for .torrent metainfo files
pub struct MetainfoParser;

impl MetainfoParser {
    /// Parse a bencoded document, returning the root value and the byte
    /// span of the top-level `info` dictionary
    pub fn parse_document(data: &[u8]) -> Result<(BencodeValue, Option<(usize, usize)>)> {
        info!("Parsing metainfo document from {} bytes", data.len());
        trace!("Metainfo data (first 100 bytes): {:?}", &data[..data.len().min(100)]);

        let mut idx = 0;
        let mut info_span = None;
        let value = Self::parse_root(data, &mut idx, &mut info_span)?;

        if idx != data.len() {
            warn!("Parsed {}/{} bytes, trailing data ignored", idx, data.len());
        }

        Ok((value, info_span))
    }

    /// Parse the root dictionary, recording where the `info` value starts
    /// and ends in the source buffer
    fn parse_root(
        data: &[u8],
        idx: &mut usize,
        info_span: &mut Option<(usize, usize)>,
    ) -> Result<BencodeValue> {
        if data.first() != Some(&b'd') {
            return Err(ShareError::parse_error("Metainfo root must be a dictionary").into());
        }

        *idx += 1;
        let mut dict = std::collections::BTreeMap::new();
        while *idx < data.len() && data[*idx] != b'e' {
            let key = match Self::parse_value(data, idx)? {
                BencodeValue::Bytes(b) => b,
                _ => return Err(ShareError::parse_error("Dictionary key must be bytes").into()),
            };
            let value_start = *idx;
            let value = Self::parse_value(data, idx)?;
            if key.as_slice() == b"info" {
                *info_span = Some((value_start, *idx));
            }
            dict.insert(key, value);
        }
        if *idx >= data.len() {
            return Err(ShareError::parse_error("Unterminated root dictionary").into());
        }
        *idx += 1; // skip 'e'

        debug!("Parsed root dictionary with {} keys", dict.len());
        Ok(BencodeValue::Dict(dict))
    }

    pub(crate) fn parse_value(data: &[u8], idx: &mut usize) -> Result<BencodeValue> {
        if *idx >= data.len() {
            return Err(ShareError::parse_error("Unexpected end of data").into());
        }

        let byte = data[*idx];

        match byte {
            b'i' => {
                // Integer
                *idx += 1;
                let end = data[*idx..].iter().position(|&b| b == b'e')
                    .ok_or_else(|| ShareError::parse_error("Unterminated integer"))? + *idx;
                let num_str = std::str::from_utf8(&data[*idx..end])
                    .map_err(|e| ShareError::parse_error_with_source("Non-UTF8 integer", e.to_string()))?;
                let value: i64 = num_str.parse()
                    .map_err(|e: std::num::ParseIntError| {
                        ShareError::parse_error_with_source("Invalid integer", e.to_string())
                    })?;
                *idx = end + 1;
                Ok(BencodeValue::Int(value))
            }
            b'l' => {
                // List
                *idx += 1;
                let mut list = Vec::new();
                while *idx < data.len() && data[*idx] != b'e' {
                    list.push(Self::parse_value(data, idx)?);
                }
                if *idx >= data.len() {
                    return Err(ShareError::parse_error("Unterminated list").into());
                }
                *idx += 1; // skip 'e'
                Ok(BencodeValue::List(list))
            }
            b'd' => {
                // Dictionary
                *idx += 1;
                let mut dict = std::collections::BTreeMap::new();
                while *idx < data.len() && data[*idx] != b'e' {
                    let key = match Self::parse_value(data, idx)? {
                        BencodeValue::Bytes(b) => b,
                        _ => return Err(ShareError::parse_error("Dictionary key must be bytes").into()),
                    };
                    let value = Self::parse_value(data, idx)?;
                    dict.insert(key, value);
                }
                if *idx >= data.len() {
                    return Err(ShareError::parse_error("Unterminated dictionary").into());
                }
                *idx += 1; // skip 'e'
                Ok(BencodeValue::Dict(dict))
            }
            b'0'..=b'9' => {
                // Byte string
                let colon = data[*idx..].iter().position(|&b| b == b':')
                    .ok_or_else(|| ShareError::parse_error("Unterminated string length"))? + *idx;
                let len_str = std::str::from_utf8(&data[*idx..colon])
                    .map_err(|e| ShareError::parse_error_with_source("Non-UTF8 string length", e.to_string()))?;
                let length: usize = len_str.parse()
                    .map_err(|e: std::num::ParseIntError| {
                        ShareError::parse_error_with_source("Invalid string length", e.to_string())
                    })?;
                *idx = colon + 1;
                let start = *idx;
                if start + length > data.len() {
                    return Err(ShareError::parse_error("String extends past end of data").into());
                }
                *idx += length;
                Ok(BencodeValue::Bytes(data[start..*idx].to_vec()))
            }
            _ => Err(ShareError::parse_error(format!("Unknown bencode type: {}", byte)).into()),
        }
    }
}

/// Bencode value
#[derive(Debug, Clone)]
pub enum BencodeValue {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<BencodeValue>),
    Dict(std::collections::BTreeMap<Vec<u8>, BencodeValue>),
}

impl BencodeValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            BencodeValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&std::collections::BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            BencodeValue::Dict(d) => Some(d),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bencode_int() {
        let data = b"i42e";
        let mut idx = 0;
        let value = MetainfoParser::parse_value(data, &mut idx).unwrap();
        assert_eq!(value.as_int(), Some(42));
    }

    #[test]
    fn test_parse_bencode_string() {
        let data = b"4:test";
        let mut idx = 0;
        let value = MetainfoParser::parse_value(data, &mut idx).unwrap();
        assert_eq!(value.as_bytes(), Some(b"test".as_ref()));
    }

    #[test]
    fn test_parse_bencode_dict() {
        let data = b"d4:testi42ee";
        let mut idx = 0;
        let value = MetainfoParser::parse_value(data, &mut idx).unwrap();
        assert!(value.as_dict().is_some());
    }

    #[test]
    fn test_parse_truncated_string_fails() {
        let data = b"10:short";
        let mut idx = 0;
        assert!(MetainfoParser::parse_value(data, &mut idx).is_err());
    }

    #[test]
    fn test_info_span_covers_exact_dict() {
        let data = b"d8:announce3:url4:infod4:name1:a6:lengthi1eee";
        let (_, span) = MetainfoParser::parse_document(data).unwrap();
        let (start, end) = span.unwrap();
        assert_eq!(&data[start..start + 1], b"d");
        assert_eq!(&data[end - 1..end], b"e");
        assert_eq!(&data[start..end], b"d4:name1:a6:lengthi1ee".as_ref());
    }

    #[test]
    fn test_non_dict_root_fails() {
        let data = b"l4:teste";
        assert!(MetainfoParser::parse_document(data).is_err());
    }
}
