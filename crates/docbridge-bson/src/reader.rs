//! BSON 流式读取模块
//!
//! [`DocumentReader`] 从一个缓冲区中依次读出长度前缀的文档，
//! [`ElementIter`] 逐个读出单个文档的元素。嵌套文档只校验外层框架，
//! 内部元素由下一层解码器自行读取。

use crate::spec::*;
use crate::{DecodeError, DecodeResult};

/// 一个已校验框架（长度前缀与结束符）的文档字节区间
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawDocument<'a> {
    bytes: &'a [u8],
}

impl<'a> RawDocument<'a> {
    /// 校验文档框架
    ///
    /// # Brief
    /// 长度前缀必须与切片长度一致、不小于 5 字节，并以 0x00 结尾
    ///
    /// # Arguments
    /// * `bytes` - 完整文档字节（含长度前缀与结束符）
    ///
    /// # Returns
    /// 成功返回 RawDocument，框架错误返回 `CorruptDocument`
    pub fn from_bytes(bytes: &'a [u8]) -> DecodeResult<Self> {
        if bytes.len() < MIN_DOCUMENT_SIZE {
            return Err(corrupt(format!(
                "document needs at least {} bytes, have {}",
                MIN_DOCUMENT_SIZE,
                bytes.len()
            )));
        }
        let declared = read_length(bytes)?;
        if declared != bytes.len() {
            return Err(corrupt(format!(
                "declared length {} does not match {} available bytes",
                declared,
                bytes.len()
            )));
        }
        if bytes[bytes.len() - 1] != 0 {
            return Err(corrupt("document is not null-terminated"));
        }
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.len() == MIN_DOCUMENT_SIZE
    }

    pub fn iter(&self) -> ElementIter<'a> {
        ElementIter {
            data: self.bytes,
            pos: 4,
            done: false,
        }
    }
}

impl<'a> IntoIterator for RawDocument<'a> {
    type Item = DecodeResult<(&'a str, RawElement<'a>)>;
    type IntoIter = ElementIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// 读取器产生的单个元素
#[derive(Debug, Clone, PartialEq)]
pub enum RawElement<'a> {
    Double(f64),
    String(&'a str),
    Document(RawDocument<'a>),
    Array(RawDocument<'a>),
    Binary { subtype: u8, bytes: &'a [u8] },
    ObjectId([u8; 12]),
    Boolean(bool),
    DateTime(i64),
    Null,
    Regex { pattern: &'a str, flags: &'a str },
    JavaScriptCode(&'a str),
    JavaScriptCodeWithScope { code: &'a str, scope: RawDocument<'a> },
    Int32(i32),
    Timestamp { seconds: u32, increment: u32 },
    Int64(i64),
    MaxKey,
    MinKey,
    /// 已废弃或不支持的类型，载荷已被越过
    Skipped(ElementType),
}

/// 按顺序读出缓冲区中拼接的多个文档
///
/// 遇到损坏的文档后停止，不再尝试后续文档。
pub struct DocumentReader<'a> {
    data: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> DocumentReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            failed: false,
        }
    }
}

impl<'a> Iterator for DocumentReader<'a> {
    type Item = DecodeResult<RawDocument<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.data.len() {
            return None;
        }
        let rest = &self.data[self.pos..];
        let result = read_length(rest).and_then(|len| {
            if len > rest.len() {
                return Err(corrupt(format!(
                    "document length {} exceeds remaining {} bytes",
                    len,
                    rest.len()
                )));
            }
            RawDocument::from_bytes(&rest[..len])
        });
        match result {
            Ok(doc) => {
                self.pos += doc.bytes.len();
                Some(Ok(doc))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// 单个文档的元素迭代器
pub struct ElementIter<'a> {
    data: &'a [u8],
    pos: usize,
    done: bool,
}

impl<'a> Iterator for ElementIter<'a> {
    type Item = DecodeResult<(&'a str, RawElement<'a>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        // 最后一个字节是已校验过的结束符
        if self.pos >= self.data.len() - 1 {
            self.done = true;
            return None;
        }
        let result = self.read_element();
        if result.is_err() {
            self.done = true;
        }
        Some(result)
    }
}

impl<'a> ElementIter<'a> {
    /// 元素载荷不得越过文档结束符
    fn end(&self) -> usize {
        self.data.len() - 1
    }

    fn read_element(&mut self) -> DecodeResult<(&'a str, RawElement<'a>)> {
        let tag = self.read_u8()?;
        let element_type = ElementType::from_u8(tag)
            .ok_or_else(|| corrupt(format!("invalid element type 0x{:02x}", tag)))?;
        let key = self.read_cstring()?;

        let element = match element_type {
            ElementType::Double => RawElement::Double(f64::from_le_bytes(self.read_array()?)),
            ElementType::String => RawElement::String(self.read_string()?),
            ElementType::EmbeddedDocument => RawElement::Document(self.read_document()?),
            ElementType::Array => RawElement::Array(self.read_document()?),
            ElementType::Binary => self.read_binary()?,
            ElementType::ObjectId => RawElement::ObjectId(self.read_array()?),
            ElementType::Boolean => match self.read_u8()? {
                0 => RawElement::Boolean(false),
                1 => RawElement::Boolean(true),
                other => return Err(corrupt(format!("invalid boolean byte 0x{:02x}", other))),
            },
            ElementType::DateTime => RawElement::DateTime(i64::from_le_bytes(self.read_array()?)),
            ElementType::Null => RawElement::Null,
            ElementType::RegularExpression => {
                let pattern = self.read_cstring()?;
                let flags = self.read_cstring()?;
                RawElement::Regex { pattern, flags }
            }
            ElementType::JavaScriptCode => RawElement::JavaScriptCode(self.read_string()?),
            ElementType::JavaScriptCodeWithScope => self.read_code_with_scope()?,
            ElementType::Int32 => RawElement::Int32(i32::from_le_bytes(self.read_array()?)),
            ElementType::Timestamp => {
                let increment = u32::from_le_bytes(self.read_array()?);
                let seconds = u32::from_le_bytes(self.read_array()?);
                RawElement::Timestamp { seconds, increment }
            }
            ElementType::Int64 => RawElement::Int64(i64::from_le_bytes(self.read_array()?)),
            ElementType::MaxKey => RawElement::MaxKey,
            ElementType::MinKey => RawElement::MinKey,
            ElementType::Undefined => RawElement::Skipped(element_type),
            ElementType::DbPointer => {
                self.read_string()?;
                self.read_array::<12>()?;
                RawElement::Skipped(element_type)
            }
            ElementType::Symbol => {
                self.read_string()?;
                RawElement::Skipped(element_type)
            }
            ElementType::Decimal128 => {
                self.read_array::<16>()?;
                RawElement::Skipped(element_type)
            }
        };
        Ok((key, element))
    }

    fn read_binary(&mut self) -> DecodeResult<RawElement<'a>> {
        let len = self.read_i32()?;
        if len < 0 {
            return Err(corrupt(format!("negative binary length {}", len)));
        }
        let subtype = self.read_u8()?;
        let bytes = self.read_bytes(len as usize)?;
        if subtype == BINARY_SUBTYPE_BINARY_OLD {
            // 旧式子类型在载荷内还有一层长度前缀
            if bytes.len() < 4 {
                return Err(corrupt("old binary subtype missing inner length"));
            }
            let inner = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            if inner < 0 || inner as usize != bytes.len() - 4 {
                return Err(corrupt("old binary subtype inner length mismatch"));
            }
            return Ok(RawElement::Binary {
                subtype,
                bytes: &bytes[4..],
            });
        }
        Ok(RawElement::Binary { subtype, bytes })
    }

    fn read_code_with_scope(&mut self) -> DecodeResult<RawElement<'a>> {
        let start = self.pos;
        let total = self.read_i32()?;
        // 4 字节总长 + 最短字符串 5 字节 + 最短文档 5 字节
        if total < 14 {
            return Err(corrupt(format!("code with scope length {} too small", total)));
        }
        let code = self.read_string()?;
        let scope = self.read_document()?;
        if self.pos - start != total as usize {
            return Err(corrupt(format!(
                "code with scope length {} does not match content {}",
                total,
                self.pos - start
            )));
        }
        Ok(RawElement::JavaScriptCodeWithScope { code, scope })
    }

    fn read_document(&mut self) -> DecodeResult<RawDocument<'a>> {
        let len = read_length(&self.data[self.pos..self.end()])?;
        let bytes = self.read_bytes(len)?;
        RawDocument::from_bytes(bytes)
    }

    fn read_u8(&mut self) -> DecodeResult<u8> {
        if self.pos >= self.end() {
            return Err(unexpected_end());
        }
        let b = self.data[self.pos];
        self.pos += 1;
        Ok(b)
    }

    fn read_i32(&mut self) -> DecodeResult<i32> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    fn read_array<const N: usize>(&mut self) -> DecodeResult<[u8; N]> {
        let bytes = self.read_bytes(N)?;
        let mut buf = [0u8; N];
        buf.copy_from_slice(bytes);
        Ok(buf)
    }

    fn read_bytes(&mut self, len: usize) -> DecodeResult<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or_else(unexpected_end)?;
        if end > self.end() {
            return Err(unexpected_end());
        }
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    /// 以 0x00 结尾的键名或正则字符串
    fn read_cstring(&mut self) -> DecodeResult<&'a str> {
        let window = &self.data[self.pos..self.end()];
        let nul = window
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| corrupt("unterminated cstring"))?;
        let s = std::str::from_utf8(&window[..nul])
            .map_err(|e| corrupt(format!("invalid UTF-8 in cstring: {}", e)))?;
        self.pos += nul + 1;
        Ok(s)
    }

    /// 带长度前缀的字符串，允许内嵌 NUL
    fn read_string(&mut self) -> DecodeResult<&'a str> {
        let len = self.read_i32()?;
        if len < 1 {
            return Err(corrupt(format!("invalid string length {}", len)));
        }
        let bytes = self.read_bytes(len as usize)?;
        let (body, terminator) = bytes.split_at(bytes.len() - 1);
        if terminator[0] != 0 {
            return Err(corrupt("string is not null-terminated"));
        }
        std::str::from_utf8(body).map_err(|e| corrupt(format!("invalid UTF-8 in string: {}", e)))
    }
}

fn read_length(bytes: &[u8]) -> DecodeResult<usize> {
    if bytes.len() < 4 {
        return Err(unexpected_end());
    }
    let len = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if len < MIN_DOCUMENT_SIZE as i32 {
        return Err(corrupt(format!("invalid document length {}", len)));
    }
    Ok(len as usize)
}

fn corrupt(message: impl Into<String>) -> DecodeError {
    DecodeError::CorruptDocument(message.into())
}

fn unexpected_end() -> DecodeError {
    corrupt("unexpected end of document")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(body: &[u8]) -> Vec<u8> {
        let mut out = ((body.len() + 5) as i32).to_le_bytes().to_vec();
        out.extend_from_slice(body);
        out.push(0);
        out
    }

    #[test]
    fn test_empty_document() {
        let bytes = doc(&[]);
        let raw = RawDocument::from_bytes(&bytes).unwrap();
        assert!(raw.is_empty());
        assert_eq!(raw.iter().count(), 0);
    }

    #[test]
    fn test_reads_scalars() {
        let mut body = vec![0x10, b'a', 0];
        body.extend_from_slice(&7i32.to_le_bytes());
        body.extend_from_slice(&[0x08, b'b', 0, 1]);
        body.extend_from_slice(&[0x02, b's', 0]);
        body.extend_from_slice(&4i32.to_le_bytes());
        body.extend_from_slice(b"a\0b\0");
        let bytes = doc(&body);

        let elements: Vec<_> = RawDocument::from_bytes(&bytes)
            .unwrap()
            .iter()
            .collect::<DecodeResult<_>>()
            .unwrap();
        assert_eq!(
            elements,
            vec![
                ("a", RawElement::Int32(7)),
                ("b", RawElement::Boolean(true)),
                ("s", RawElement::String("a\0b")),
            ]
        );
    }

    #[test]
    fn test_skips_deprecated_types() {
        let mut body = vec![0x06, b'u', 0];
        body.extend_from_slice(&[0x0E, b's', 0]);
        body.extend_from_slice(&2i32.to_le_bytes());
        body.extend_from_slice(b"x\0");
        body.extend_from_slice(&[0x0A, b'n', 0]);
        let bytes = doc(&body);

        let elements: Vec<_> = RawDocument::from_bytes(&bytes)
            .unwrap()
            .iter()
            .collect::<DecodeResult<_>>()
            .unwrap();
        assert_eq!(
            elements,
            vec![
                ("u", RawElement::Skipped(ElementType::Undefined)),
                ("s", RawElement::Skipped(ElementType::Symbol)),
                ("n", RawElement::Null),
            ]
        );
    }

    #[test]
    fn test_invalid_tag_is_corrupt() {
        let bytes = doc(&[0x42, b'k', 0]);
        let mut iter = RawDocument::from_bytes(&bytes).unwrap().iter();
        assert!(matches!(iter.next(), Some(Err(DecodeError::CorruptDocument(_)))));
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_invalid_boolean_is_corrupt() {
        let bytes = doc(&[0x08, b'b', 0, 2]);
        let mut iter = RawDocument::from_bytes(&bytes).unwrap().iter();
        assert!(matches!(iter.next(), Some(Err(DecodeError::CorruptDocument(_)))));
    }

    #[test]
    fn test_string_overrunning_document_is_corrupt() {
        let mut body = vec![0x02, b's', 0];
        body.extend_from_slice(&100i32.to_le_bytes());
        body.extend_from_slice(b"ab\0");
        let bytes = doc(&body);
        let mut iter = RawDocument::from_bytes(&bytes).unwrap().iter();
        assert!(matches!(iter.next(), Some(Err(DecodeError::CorruptDocument(_)))));
    }

    #[test]
    fn test_frame_validation() {
        assert!(RawDocument::from_bytes(&[5, 0, 0]).is_err());
        assert!(RawDocument::from_bytes(&[6, 0, 0, 0, 0]).is_err());
        assert!(RawDocument::from_bytes(&[5, 0, 0, 0, 1]).is_err());
        assert!(RawDocument::from_bytes(&[5, 0, 0, 0, 0]).is_ok());
    }

    #[test]
    fn test_document_reader_sequence() {
        let mut data = doc(&[0x0A, b'a', 0]);
        data.extend(doc(&[0x0A, b'b', 0]));
        let docs: Vec<_> = DocumentReader::new(&data)
            .collect::<DecodeResult<_>>()
            .unwrap();
        assert_eq!(docs.len(), 2);

        data.extend_from_slice(&[9, 0, 0, 0, 0]);
        let results: Vec<_> = DocumentReader::new(&data).collect();
        assert_eq!(results.len(), 3);
        assert!(results[2].is_err());
    }

    #[test]
    fn test_old_binary_strips_inner_length() {
        let mut body = vec![0x05, b'b', 0];
        body.extend_from_slice(&6i32.to_le_bytes());
        body.push(BINARY_SUBTYPE_BINARY_OLD);
        body.extend_from_slice(&2i32.to_le_bytes());
        body.extend_from_slice(&[0xAA, 0xBB]);
        let bytes = doc(&body);
        let (_, element) = RawDocument::from_bytes(&bytes)
            .unwrap()
            .iter()
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(
            element,
            RawElement::Binary {
                subtype: BINARY_SUBTYPE_BINARY_OLD,
                bytes: &[0xAA, 0xBB]
            }
        );
    }
}
