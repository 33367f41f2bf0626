//! # 解析器模块
//!
//! 提供结构文件 (CIF) 与实测 PDF 数据 (G(r)) 的解析器。
//!
//! ## 依赖关系
//! - 被 `fit/` 与 `commands/` 模块使用
//! - 使用 `models/` 数据模型
//! - 子模块: cif, gr

pub mod cif;
pub mod gr;

pub use cif::{parse_cif_content, parse_cif_file, to_cif_string};
pub use gr::{parse_gr_content, parse_gr_file};
