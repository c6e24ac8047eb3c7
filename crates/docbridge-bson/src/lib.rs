//! # docbridge-bson
//!
//! 动态宿主值（map/array/scalar 组成的值图）与 BSON 二进制文档之间的双向转换器。
//!
//! - **编码**：递归遍历 [`HostValue`]，按运行时类型输出规范的 BSON 字节，
//!   支持 ObjectId、Regex、Timestamp、UTC 日期时间、JavaScript 代码（可带 scope）、
//!   Binary、MinKey/MaxKey 等扩展类型
//! - **解码**：基于流式读取器逐个元素分派，重建同样的扩展类型
//! - **策略**：数组/文档判定、自动生成 `_id`、文档与数组的类型映射
//!
//! ## 快速开始
//!
//! ```rust,ignore
//! use docbridge_bson::{host, decode, encode, ConversionOptions};
//!
//! let value = host!({ "name": "docbridge", "tags": ["a", "b"] });
//! let encoded = encode(&value, &ConversionOptions::for_insert()).unwrap();
//! let id = encoded.generated_id.unwrap();
//!
//! let decoded = decode(&encoded.bytes, &ConversionOptions::default()).unwrap();
//! assert_eq!(decoded.get("name").and_then(|v| v.as_str()), Some("docbridge"));
//! ```

pub mod decoder;
pub mod encoder;
pub mod options;
pub mod reader;
pub mod spec;
pub mod value;
pub mod write_result;

pub use decoder::{decode, decode_all};
pub use encoder::{encode, encode_to_vec, EncodedDocument};
pub use options::{ArrayType, ConversionOptions, DocumentType};
pub use value::{
    Binary, BsonSerializable, ExtendedType, HostMap, HostObject, HostValue, JavaScriptCode, Key,
    PropertyMap, Regex, Serializable, Timestamp, UtcDateTime,
};
pub use write_result::{WriteConcernError, WriteError, WriteFailure, WriteReply, WriteResult};

pub use docbridge_common::ObjectId;

use thiserror::Error;

/// 编码过程的错误类型
///
/// 任何一种错误都会使整个编码调用失败，不会产生部分文档
#[derive(Error, Debug)]
pub enum EncodeError {
    /// 宿主值没有对应的 BSON 表示（包括非法字段名）
    #[error("Unsupported type: {0}")]
    UnsupportedType(String),

    /// Serializable 回调返回了非文档值，或回调自身失败
    #[error("Callback error in {type_name}: {message}")]
    Callback { type_name: String, message: String },

    /// 嵌套层级过深
    #[error("Nesting too deep: max {0}")]
    NestingTooDeep(usize),

    /// 文档体积超出长度前缀可表示的范围
    #[error("Document too large: max {0} bytes")]
    DocumentTooLarge(usize),
}

/// 解码过程的错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// 字节流不是格式正确的 BSON 文档序列
    #[error("Corrupt document: {0}")]
    CorruptDocument(String),

    /// 嵌套层级过深
    #[error("Nesting too deep: max {0}")]
    NestingTooDeep(usize),
}

/// 编码 Result 类型别名
pub type EncodeResult<T> = Result<T, EncodeError>;

/// 解码 Result 类型别名
pub type DecodeResult<T> = Result<T, DecodeError>;
