//! # 统一错误处理模块
//!
//! 定义 ezfit 的所有错误类型，使用 `thiserror` 派生。
//!
//! ## 错误分类
//! - 配置错误：未知形状函数、非法约束区间、缺失配置段
//! - 输入缺失：结构文件或数据文件不存在（建模前即检查）
//! - 约束冲突：位置参数已被空间群对称性固定（注册时局部跳过）
//! - 比例换算错误：缺失 f1 能量表或结构元数据（致命）
//!
//! ## 依赖关系
//! - 被所有其他模块使用
//! - 无外部模块依赖

use thiserror::Error;

/// ezfit 统一错误类型
#[derive(Error, Debug)]
pub enum EzfitError {
    // ─────────────────────────────────────────────────────────────
    // I/O 错误
    // ─────────────────────────────────────────────────────────────
    #[error("Failed to read file: {path}")]
    FileReadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file: {path}")]
    FileWriteError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Input not found: {path}")]
    InputNotFound { path: String },

    // ─────────────────────────────────────────────────────────────
    // 解析错误
    // ─────────────────────────────────────────────────────────────
    #[error("Failed to parse {format} file: {path}\nReason: {reason}")]
    ParseError {
        format: String,
        path: String,
        reason: String,
    },

    // ─────────────────────────────────────────────────────────────
    // 配置错误
    // ─────────────────────────────────────────────────────────────
    #[error("Configuration error [{key}]: {reason}")]
    Configuration { key: String, reason: String },

    // ─────────────────────────────────────────────────────────────
    // 参数与约束错误
    // ─────────────────────────────────────────────────────────────
    #[error("Parameter '{name}' is constrained: {reason}")]
    ConstraintConflict { name: String, reason: String },

    #[error("Unknown parameter: {0}")]
    UnknownParameter(String),

    #[error("Duplicate parameter name: {0}")]
    DuplicateParameter(String),

    // ─────────────────────────────────────────────────────────────
    // 数值错误
    // ─────────────────────────────────────────────────────────────
    #[error("Refinement failed: {0}")]
    Solver(String),

    #[error("Scale computation failed for phase '{phase}': {reason}")]
    ScaleComputation { phase: String, reason: String },

    // ─────────────────────────────────────────────────────────────
    // CSV 错误
    // ─────────────────────────────────────────────────────────────
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    // ─────────────────────────────────────────────────────────────
    // 其他
    // ─────────────────────────────────────────────────────────────
    #[error("{0}")]
    Other(String),
}

impl EzfitError {
    /// 构造配置错误
    pub fn config(key: impl Into<String>, reason: impl Into<String>) -> Self {
        EzfitError::Configuration {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// 构造比例换算错误
    pub fn scale(phase: impl Into<String>, reason: impl Into<String>) -> Self {
        EzfitError::ScaleComputation {
            phase: phase.into(),
            reason: reason.into(),
        }
    }
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, EzfitError>;
