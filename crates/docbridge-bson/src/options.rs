//! 转换选项
//!
//! 编码时控制 `_id` 的自动生成，解码时控制文档与数组在宿主侧的形态。

use serde::{Deserialize, Serialize};

/// 解码后的文档形态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    /// 有序 map
    #[default]
    OrderedMap,
    /// 对象形态的值
    Object,
}

/// 解码后的数组形态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArrayType {
    /// 值序列
    #[default]
    Sequence,
    /// 以 "0", "1", ... 为属性名的对象
    Object,
}

/// 一次编码或解码调用的配置快照
///
/// `root_document_type` 与 `root_array_type` 作用于所有嵌套层级，不只是根。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionOptions {
    /// 根文档缺少 `_id` 时追加新生成的 ObjectId
    pub add_missing_id: bool,
    /// 把生成的 `_id` 返回给调用方
    pub return_generated_id: bool,
    pub root_document_type: DocumentType,
    pub root_array_type: ArrayType,
}

impl ConversionOptions {
    /// 插入文档时使用的选项：补全并返回 `_id`
    pub fn for_insert() -> Self {
        Self {
            add_missing_id: true,
            return_generated_id: true,
            ..Self::default()
        }
    }

    /// 文档解码为对象、数组解码为序列
    pub fn debug() -> Self {
        Self {
            root_document_type: DocumentType::Object,
            root_array_type: ArrayType::Sequence,
            ..Self::default()
        }
    }

    pub fn with_document_type(mut self, document_type: DocumentType) -> Self {
        self.root_document_type = document_type;
        self
    }

    pub fn with_array_type(mut self, array_type: ArrayType) -> Self {
        self.root_array_type = array_type;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ConversionOptions::default();
        assert!(!options.add_missing_id);
        assert!(!options.return_generated_id);
        assert_eq!(options.root_document_type, DocumentType::OrderedMap);
        assert_eq!(options.root_array_type, ArrayType::Sequence);
    }

    #[test]
    fn test_from_json_with_missing_fields() {
        let options: ConversionOptions =
            serde_json::from_str(r#"{"add_missing_id": true, "root_document_type": "object"}"#)
                .unwrap();
        assert!(options.add_missing_id);
        assert!(!options.return_generated_id);
        assert_eq!(options.root_document_type, DocumentType::Object);
        assert_eq!(options.root_array_type, ArrayType::Sequence);
    }

    #[test]
    fn test_presets() {
        let insert = ConversionOptions::for_insert();
        assert!(insert.add_missing_id && insert.return_generated_id);

        let debug = ConversionOptions::debug().with_array_type(ArrayType::Object);
        assert_eq!(debug.root_document_type, DocumentType::Object);
        assert_eq!(debug.root_array_type, ArrayType::Object);
    }
}
