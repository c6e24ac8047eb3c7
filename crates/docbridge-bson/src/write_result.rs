//! 写入确认结果
//!
//! 服务端的写入确认中带有若干原始 BSON 子文档（upserted id、写错误、
//! 写关注错误）。这里用解码器把它们转换为可检查的结构。

use crate::decoder::decode;
use crate::options::ConversionOptions;
use crate::spec::{ID_FIELD, MIN_DOCUMENT_SIZE};

const EMPTY_DOCUMENT: [u8; MIN_DOCUMENT_SIZE] = [MIN_DOCUMENT_SIZE as u8, 0, 0, 0, 0];
use crate::value::HostValue;
use crate::DecodeResult;
use indexmap::IndexMap;
use thiserror::Error;
use tracing::debug;

/// 一次批量写入的原始确认
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteReply<'a> {
    pub n_inserted: i64,
    pub n_matched: i64,
    pub n_modified: i64,
    pub n_removed: i64,
    pub n_upserted: i64,
    /// 服务端不支持 nModified 计数
    pub omit_n_modified: bool,
    /// `[{index, _id}, ...]` 形式的 BSON 数组文档
    pub upserted: &'a [u8],
    pub write_errors: &'a [u8],
    pub write_concern_errors: &'a [u8],
    /// 没有写错误时的底层错误
    pub error_code: i64,
    pub error_message: Option<&'a str>,
}

/// 单条写错误
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WriteError {
    pub message: String,
    pub code: i64,
    /// 出错操作在批次中的位置
    pub index: i64,
    pub info: Option<HostValue>,
}

/// 写关注错误
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WriteConcernError {
    pub message: String,
    pub code: i64,
    pub info: Option<HostValue>,
}

/// 解码后的写入结果
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WriteResult {
    pub inserted_count: i64,
    pub matched_count: i64,
    /// 服务端未提供时为 `None`
    pub modified_count: Option<i64>,
    pub deleted_count: i64,
    pub upserted_count: i64,
    /// 批次位置 → upsert 生成的 `_id`
    pub upserted_ids: IndexMap<i64, HostValue>,
    pub write_errors: Vec<WriteError>,
    pub write_concern_error: Option<WriteConcernError>,
    error_documents: bool,
    error_code: i64,
    error_message: Option<String>,
}

/// 写入失败
#[derive(Debug, Error)]
pub enum WriteFailure {
    #[error("Write concern error {code}: {message}")]
    WriteConcern {
        message: String,
        code: i64,
        result: Box<WriteResult>,
    },

    #[error("Write error {code}: {message}")]
    Write {
        message: String,
        code: i64,
        result: Box<WriteResult>,
    },

    #[error("BulkWrite error")]
    BulkWrite { result: Box<WriteResult> },

    /// 确认中没有任何错误文档，只有底层错误
    #[error("Server error {code}: {message}")]
    Server { message: String, code: i64 },
}

impl WriteFailure {
    /// 失败时附带的写入结果
    pub fn write_result(&self) -> Option<&WriteResult> {
        match self {
            Self::WriteConcern { result, .. }
            | Self::Write { result, .. }
            | Self::BulkWrite { result } => Some(result),
            Self::Server { .. } => None,
        }
    }
}

impl WriteResult {
    /// 解码写入确认
    ///
    /// 子文档以对象形态解码，数组保持为序列。任一子文档损坏时返回错误。
    pub fn from_reply(reply: &WriteReply<'_>) -> DecodeResult<Self> {
        let mut result = Self {
            inserted_count: reply.n_inserted,
            matched_count: reply.n_matched,
            modified_count: (!reply.omit_n_modified).then_some(reply.n_modified),
            deleted_count: reply.n_removed,
            upserted_count: reply.n_upserted,
            error_documents: !is_empty_document(reply.write_errors)
                || !is_empty_document(reply.write_concern_errors),
            error_code: reply.error_code,
            error_message: reply.error_message.map(str::to_string),
            ..Self::default()
        };

        for entry in decode_entries(reply.upserted)? {
            if let (Some(index), Some(id)) = (
                entry.get("index").and_then(HostValue::as_i64),
                entry.get(ID_FIELD),
            ) {
                result.upserted_ids.insert(index, id.clone());
            }
        }

        result.write_errors = decode_entries(reply.write_errors)?
            .iter()
            .filter(|entry| is_document(entry))
            .map(|entry| WriteError {
                message: read_message(entry),
                code: read_code(entry),
                index: entry.get("index").and_then(HostValue::as_i64).unwrap_or(0),
                info: read_info(entry),
            })
            .collect();

        result.write_concern_error = decode_entries(reply.write_concern_errors)?
            .first()
            .filter(|entry| is_document(entry))
            .map(|entry| WriteConcernError {
                message: read_message(entry),
                code: read_code(entry),
                info: read_info(entry),
            });

        debug!(
            inserted = result.inserted_count,
            upserted = result.upserted_ids.len(),
            write_errors = result.write_errors.len(),
            write_concern_error = result.write_concern_error.is_some(),
            "decoded write result"
        );
        Ok(result)
    }

    pub fn has_errors(&self) -> bool {
        !self.write_errors.is_empty() || self.write_concern_error.is_some()
    }

    /// 根据服务端的成功标志给出最终结果
    ///
    /// 失败时优先报告写关注错误，其次是第一条写错误，否则为通用的批量写入错误。
    /// 没有任何错误文档时报告底层错误。
    pub fn into_outcome(self, success: bool) -> Result<Self, WriteFailure> {
        if success {
            return Ok(self);
        }
        if !self.error_documents {
            return Err(WriteFailure::Server {
                message: self.error_message.unwrap_or_default(),
                code: self.error_code,
            });
        }
        if let Some(wce) = self.write_concern_error.clone() {
            return Err(WriteFailure::WriteConcern {
                message: wce.message,
                code: wce.code,
                result: Box::new(self),
            });
        }
        if let Some(first) = self.write_errors.first().cloned() {
            return Err(WriteFailure::Write {
                message: first.message,
                code: first.code,
                result: Box::new(self),
            });
        }
        Err(WriteFailure::BulkWrite {
            result: Box::new(self),
        })
    }
}

/// 未设置的缓冲区或恰好是空文档；其余内容（包括截断的字节）都交给解码器
fn is_empty_document(bytes: &[u8]) -> bool {
    bytes.is_empty() || bytes == EMPTY_DOCUMENT
}

fn is_document(entry: &HostValue) -> bool {
    matches!(entry, HostValue::Object(_) | HostValue::Map(_))
}

/// 解码数组文档，返回其中各元素
fn decode_entries(bytes: &[u8]) -> DecodeResult<Vec<HostValue>> {
    if is_empty_document(bytes) {
        return Ok(Vec::new());
    }
    Ok(match decode(bytes, &ConversionOptions::debug())? {
        HostValue::Object(obj) => obj.properties.into_values().collect(),
        HostValue::Map(map) => map.into_values().collect(),
        HostValue::Sequence(items) => items,
        _ => Vec::new(),
    })
}

fn read_message(entry: &HostValue) -> String {
    entry
        .get("errmsg")
        .and_then(HostValue::as_str)
        .unwrap_or_default()
        .to_string()
}

fn read_code(entry: &HostValue) -> i64 {
    entry.get("code").and_then(HostValue::as_i64).unwrap_or(0)
}

fn read_info(entry: &HostValue) -> Option<HostValue> {
    entry.get("info").or_else(|| entry.get("errInfo")).cloned()
}
