//! 错误类型定义模块
//!
//! 定义公共类型使用的错误类型 CommonError 和 Result 别名。

use thiserror::Error;

/// 公共错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommonError {
    /// ObjectId 无效
    #[error("Invalid ObjectId: {0}")]
    InvalidObjectId(String),
}

/// Result 类型别名
pub type CommonResult<T> = Result<T, CommonError>;
