//! # ezfit
//!
//! 晶体结构对实测原子对分布函数 (PDF) 的分阶段多相精修。
//!
//! ```text
//! assemble ─▶ register ─▶ constrain ─▶ refine ─▶ resolve-scale
//! ```
//!
//! ## 模块
//! - `fit`: 精修流水线（组装、参数注册、约束、分阶段优化、相分数换算、结果输出）
//! - `pdf`: 单相 PDF 生成器、形状函数、元素散射数据
//! - `models`: 晶体结构、对称操作、实测曲线
//! - `parsers`: CIF 与 G(r) 文件读取
//! - `config`: TOML 配置
//! - `utils`: 终端输出、进度条、日志
//!
//! ## 依赖关系
//! - 被 `main.rs` 的命令层使用

pub mod config;
pub mod error;
pub mod fit;
pub mod models;
pub mod parsers;
pub mod pdf;
pub mod utils;

pub use error::{EzfitError, Result};
pub use fit::{FitOutcome, FitPdf};
