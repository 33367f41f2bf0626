//! # PDF 计算模块
//!
//! 单相 PDF 的物理计算：原子对求和生成器、纳米颗粒形状函数、元素散射数据。
//!
//! ## 依赖关系
//! - 被 `fit/` 模块使用
//! - 使用 `models/` 数据模型
//! - 子模块: generator, shape, scattering

pub mod generator;
pub mod scattering;
pub mod shape;

pub use generator::{GeneratorParam, PairSumGenerator, PhaseValues, ProfileGenerator, StructureLayout};
pub use shape::ShapeFunction;
