//! # 数据模型模块
//!
//! 定义晶体结构、对称操作与实测 PDF 曲线的数据模型。
//!
//! ## 依赖关系
//! - 被 `parsers/`、`pdf/` 和 `fit/` 使用
//! - 子模块: structure, symmetry, profile

pub mod profile;
pub mod structure;
pub mod symmetry;

pub use profile::Profile;
pub use structure::{Crystal, Lattice, Site};
pub use symmetry::{CoordTie, LatticeTie, SymOp};
