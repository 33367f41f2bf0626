//! # 晶体结构数据模型
//!
//! 定义精修使用的晶体结构表示：晶格、不对称单元中的原子位点以及对称操作。
//!
//! ## 依赖关系
//! - 被 `parsers/cif.rs`、`pdf/generator.rs` 和 `fit/` 使用
//! - 使用 `models/symmetry.rs` 的 SymOp

use crate::models::symmetry::SymOp;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// 晶格参数名称，顺序与 `Lattice::parameters` 一致
pub const LATTICE_PARAMETER_NAMES: [&str; 6] = ["a", "b", "c", "alpha", "beta", "gamma"];

/// 分数坐标去重时保留的小数位数
pub const POSITION_DECIMALS: i32 = 4;

/// 晶格参数表示
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lattice {
    /// 晶格向量矩阵 (3x3)，行向量表示 a, b, c
    /// [[a1, a2, a3], [b1, b2, b3], [c1, c2, c3]]
    pub matrix: [[f64; 3]; 3],
}

impl Lattice {
    /// 从晶格参数 (a, b, c, alpha, beta, gamma) 创建晶格
    /// 角度单位：度
    pub fn from_parameters(a: f64, b: f64, c: f64, alpha: f64, beta: f64, gamma: f64) -> Self {
        let cos_alpha = alpha.to_radians().cos();
        let cos_beta = beta.to_radians().cos();
        let cos_gamma = gamma.to_radians().cos();
        let sin_gamma = gamma.to_radians().sin();

        let a_vec = [a, 0.0, 0.0];
        let b_vec = [b * cos_gamma, b * sin_gamma, 0.0];

        let c1 = c * cos_beta;
        let c2 = c * (cos_alpha - cos_beta * cos_gamma) / sin_gamma;
        let c3 = (c * c - c1 * c1 - c2 * c2).max(0.0).sqrt();

        Lattice {
            matrix: [a_vec, b_vec, [c1, c2, c3]],
        }
    }

    /// 从参数数组创建
    pub fn from_array(p: [f64; 6]) -> Self {
        Self::from_parameters(p[0], p[1], p[2], p[3], p[4], p[5])
    }

    /// 获取晶格参数 (a, b, c, alpha, beta, gamma)
    pub fn parameters(&self) -> [f64; 6] {
        let [a_vec, b_vec, c_vec] = self.matrix;

        let a = norm(&a_vec);
        let b = norm(&b_vec);
        let c = norm(&c_vec);

        let alpha = (dot(&b_vec, &c_vec) / (b * c)).acos().to_degrees();
        let beta = (dot(&a_vec, &c_vec) / (a * c)).acos().to_degrees();
        let gamma = (dot(&a_vec, &b_vec) / (a * b)).acos().to_degrees();

        [a, b, c, alpha, beta, gamma]
    }

    /// 计算晶格体积 (Å³)
    pub fn volume(&self) -> f64 {
        let [a, b, c] = self.matrix;
        dot(&a, &cross(&b, &c)).abs()
    }

    /// 分数坐标转笛卡尔坐标
    pub fn to_cartesian(&self, frac: &[f64; 3]) -> [f64; 3] {
        let m = &self.matrix;
        [
            frac[0] * m[0][0] + frac[1] * m[1][0] + frac[2] * m[2][0],
            frac[0] * m[0][1] + frac[1] * m[1][1] + frac[2] * m[2][1],
            frac[0] * m[0][2] + frac[1] * m[1][2] + frac[2] * m[2][2],
        ]
    }

    /// 三组晶面间距 d(100), d(010), d(001)
    pub fn plane_spacings(&self) -> [f64; 3] {
        let [a, b, c] = self.matrix;
        let v = self.volume();
        [
            v / norm(&cross(&b, &c)),
            v / norm(&cross(&c, &a)),
            v / norm(&cross(&a, &b)),
        ]
    }
}

/// 不对称单元中的原子位点
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    /// 位点标签（如 "Ni1"）
    pub label: String,

    /// 元素符号
    pub element: String,

    /// 分数坐标 [x, y, z]
    pub position: [f64; 3],

    /// 占有率
    pub occupancy: f64,

    /// 各向同性位移参数 Biso (Å²)
    pub biso: f64,
}

impl Site {
    pub fn new(label: impl Into<String>, element: impl Into<String>, position: [f64; 3]) -> Self {
        Site {
            label: label.into(),
            element: element.into(),
            position,
            occupancy: 1.0,
            biso: 1.0,
        }
    }

    pub fn with_occupancy(mut self, occupancy: f64) -> Self {
        self.occupancy = occupancy;
        self
    }

    pub fn with_biso(mut self, biso: f64) -> Self {
        self.biso = biso;
        self
    }
}

/// 晶体结构
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Crystal {
    /// 结构名称（CIF 的 data_ 块名或文件名）
    pub name: String,

    /// 晶格
    pub lattice: Lattice,

    /// 不对称单元位点
    pub sites: Vec<Site>,

    /// 文件中声明的对称操作，为空表示未声明
    pub symops: Vec<SymOp>,

    /// 文件中声明的晶胞体积 (Å³)
    pub cell_volume: Option<f64>,

    /// 化学式
    pub formula: Option<String>,

    /// 空间群
    pub space_group: Option<String>,
}

impl Crystal {
    pub fn new(name: impl Into<String>, lattice: Lattice, sites: Vec<Site>) -> Self {
        Crystal {
            name: name.into(),
            lattice,
            sites,
            symops: Vec::new(),
            cell_volume: None,
            formula: None,
            space_group: None,
        }
    }

    pub fn with_symops(mut self, symops: Vec<SymOp>) -> Self {
        self.symops = symops;
        self
    }

    /// 有效对称操作：未声明时退化为恒等操作
    pub fn effective_symops(&self) -> Vec<SymOp> {
        if self.symops.is_empty() {
            vec![SymOp::identity()]
        } else {
            self.symops.clone()
        }
    }

    /// 按标签统计等效位置数乘以占有率
    pub fn multiplicities(&self) -> BTreeMap<String, f64> {
        let ops = self.effective_symops();
        let mut mult = BTreeMap::new();
        for site in &self.sites {
            let count = expand_with(&ops, &site.position).len() as f64;
            mult.insert(site.label.clone(), count * site.occupancy);
        }
        mult
    }

    /// 计算化学式（按元素统计晶胞内原子数）
    pub fn formula(&self) -> String {
        if let Some(f) = &self.formula {
            return f.clone();
        }
        let ops = self.effective_symops();
        let mut counts: BTreeMap<&str, f64> = BTreeMap::new();
        for site in &self.sites {
            let n = expand_with(&ops, &site.position).len() as f64 * site.occupancy;
            *counts.entry(site.element.as_str()).or_insert(0.0) += n;
        }

        counts
            .into_iter()
            .map(|(el, count)| {
                if (count - 1.0).abs() < 1e-9 {
                    el.to_string()
                } else if (count - count.round()).abs() < 1e-9 {
                    format!("{}{}", el, count.round() as i64)
                } else {
                    format!("{}{:.3}", el, count)
                }
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// 晶胞体积：优先使用文件声明值
    pub fn volume(&self) -> f64 {
        self.cell_volume.unwrap_or_else(|| self.lattice.volume())
    }
}

/// 将分数坐标对 1 取模并按固定精度取整，得到可比较的整数键
pub fn position_key(position: &[f64; 3]) -> [i64; 3] {
    let scale = 10f64.powi(POSITION_DECIMALS);
    let modulus = scale as i64;
    let mut key = [0i64; 3];
    for (k, x) in position.iter().enumerate() {
        let v = (x.rem_euclid(1.0) * scale).round() as i64;
        key[k] = v.rem_euclid(modulus);
    }
    key
}

/// 对称展开并去重（对 1 取模，保留 4 位小数）
pub fn expand_with(ops: &[SymOp], position: &[f64; 3]) -> Vec<[f64; 3]> {
    let scale = 10f64.powi(POSITION_DECIMALS);
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for op in ops {
        let p = op.apply(position);
        let key = position_key(&p);
        if seen.insert(key) {
            out.push([
                key[0] as f64 / scale,
                key[1] as f64 / scale,
                key[2] as f64 / scale,
            ]);
        }
    }
    out
}

fn dot(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn cross(a: &[f64; 3], b: &[f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn norm(a: &[f64; 3]) -> f64 {
    dot(a, a).sqrt()
}
