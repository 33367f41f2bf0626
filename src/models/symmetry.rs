//! # 对称操作与对称性约束
//!
//! 解析 CIF 中形如 `-x+1/2, y, z` 的对称操作，并据此推导：
//! - 晶格参数之间的等同关系（由旋转部分保持度规张量不变得出）
//! - 特殊位置上分数坐标的固定/线性关系（位点对称性）
//!
//! 结构表示本身携带这些冗余关系，因此注册时只有独立参数能成为拟合变量。
//!
//! ## 依赖关系
//! - 被 `models/structure.rs`、`parsers/cif.rs`、`pdf/generator.rs` 使用
//! - 无外部模块依赖

use crate::error::{EzfitError, Result};

use serde::{Deserialize, Serialize};

/// 判断两个坐标在模 1 意义下重合的容差
const SITE_TOLERANCE: f64 = 1e-3;

/// 行化简时视为零的阈值
const PIVOT_TOLERANCE: f64 = 1e-8;

/// 对称操作：x' = R x + t
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymOp {
    pub rotation: [[f64; 3]; 3],
    pub translation: [f64; 3],
}

impl SymOp {
    pub fn identity() -> Self {
        SymOp {
            rotation: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            translation: [0.0; 3],
        }
    }

    /// 解析 `x,y+1/2,-z` 形式的对称操作
    pub fn parse(text: &str) -> Result<Self> {
        let cleaned: String = text
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '\'' && *c != '"')
            .collect();
        let parts: Vec<&str> = cleaned.split(',').collect();
        if parts.len() != 3 {
            return Err(EzfitError::Other(format!(
                "Invalid symmetry operation '{}': expected 3 components",
                text
            )));
        }

        let mut op = SymOp {
            rotation: [[0.0; 3]; 3],
            translation: [0.0; 3],
        };
        for (row, part) in parts.iter().enumerate() {
            let (coeffs, shift) = parse_component(part).ok_or_else(|| {
                EzfitError::Other(format!("Invalid symmetry operation '{}'", text))
            })?;
            op.rotation[row] = coeffs;
            op.translation[row] = shift;
        }
        Ok(op)
    }

    /// 作用于分数坐标
    pub fn apply(&self, p: &[f64; 3]) -> [f64; 3] {
        let r = &self.rotation;
        let t = &self.translation;
        [
            r[0][0] * p[0] + r[0][1] * p[1] + r[0][2] * p[2] + t[0],
            r[1][0] * p[0] + r[1][1] * p[1] + r[1][2] * p[2] + t[1],
            r[2][0] * p[0] + r[2][1] * p[1] + r[2][2] * p[2] + t[2],
        ]
    }

    /// 输出为 `x,y+1/2,-z` 形式
    pub fn to_xyz_string(&self) -> String {
        (0..3)
            .map(|row| format_component(&self.rotation[row], self.translation[row]))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// 解析单个分量，返回 (x/y/z 系数, 平移)
fn parse_component(s: &str) -> Option<([f64; 3], f64)> {
    let chars: Vec<char> = s.chars().collect();
    let mut coeffs = [0.0; 3];
    let mut shift = 0.0;
    let mut i = 0;

    if chars.is_empty() {
        return None;
    }

    while i < chars.len() {
        let mut sign = 1.0;
        if chars[i] == '+' || chars[i] == '-' {
            if chars[i] == '-' {
                sign = -1.0;
            }
            i += 1;
        }

        // 数字部分（可选）
        let start = i;
        while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.' || chars[i] == '/')
        {
            i += 1;
        }
        let number = if i > start {
            Some(parse_number(&chars[start..i].iter().collect::<String>())?)
        } else {
            None
        };

        if i < chars.len() && chars[i] == '*' {
            i += 1;
        }

        // 变量部分（可选）
        let axis = if i < chars.len() {
            match chars[i].to_ascii_lowercase() {
                'x' => Some(0),
                'y' => Some(1),
                'z' => Some(2),
                _ => None,
            }
        } else {
            None
        };

        match (number, axis) {
            (n, Some(k)) => {
                coeffs[k] += sign * n.unwrap_or(1.0);
                i += 1;
            }
            (Some(n), None) => shift += sign * n,
            (None, None) => return None,
        }
    }

    Some((coeffs, shift))
}

fn parse_number(s: &str) -> Option<f64> {
    match s.split_once('/') {
        Some((num, den)) => {
            let n: f64 = num.parse().ok()?;
            let d: f64 = den.parse().ok()?;
            if d == 0.0 {
                None
            } else {
                Some(n / d)
            }
        }
        None => s.parse().ok(),
    }
}

fn format_component(coeffs: &[f64; 3], shift: f64) -> String {
    let mut out = String::new();
    for (k, name) in ["x", "y", "z"].iter().enumerate() {
        let c = coeffs[k];
        if c.abs() < PIVOT_TOLERANCE {
            continue;
        }
        if c < 0.0 {
            out.push('-');
        } else if !out.is_empty() {
            out.push('+');
        }
        if (c.abs() - 1.0).abs() > PIVOT_TOLERANCE {
            out.push_str(&format_fraction(c.abs()));
            out.push('*');
        }
        out.push_str(name);
    }
    if shift.abs() > PIVOT_TOLERANCE {
        out.push(if shift < 0.0 { '-' } else { '+' });
        out.push_str(&format_fraction(shift.abs()));
    }
    if out.is_empty() {
        out.push('0');
    }
    out
}

fn format_fraction(v: f64) -> String {
    for den in [1, 2, 3, 4, 6, 8, 12] {
        let num = v * den as f64;
        if (num - num.round()).abs() < 1e-6 {
            let num = num.round() as i64;
            return if den == 1 {
                num.to_string()
            } else {
                format!("{}/{}", num, den)
            };
        }
    }
    format!("{}", v)
}

// ─────────────────────────────────────────────────────────────
// 晶格参数约束
// ─────────────────────────────────────────────────────────────

/// 晶格参数的约束关系
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatticeTie {
    /// 独立参数
    Free,
    /// 与第 i 个晶格参数相等
    Same(usize),
    /// 由晶系固定（如立方晶系的 90°）
    Fixed,
}

/// 度规张量分量 (g11, g22, g33, g23, g13, g12) 在对称矩阵中的位置
const METRIC_INDEX: [[usize; 3]; 3] = [[0, 5, 4], [5, 1, 3], [4, 3, 2]];

/// 由对称操作的旋转部分推导 (a, b, c, alpha, beta, gamma) 的约束
///
/// 度规张量 G 须满足 RᵀGR = G。对全部旋转堆叠该线性条件并行化简，
/// 再检查晶格参数间的等式是否落在约束的行空间内。数值上恰好相等的参数
/// 不会因此被绑定，只有对称操作强制的关系才算数。
pub fn lattice_ties(ops: &[SymOp]) -> [LatticeTie; 6] {
    use LatticeTie::{Fixed, Free, Same};

    let mut rows: Vec<[f64; 6]> = Vec::new();
    for op in ops {
        let r = &op.rotation;
        for p in 0..3 {
            for q in p..3 {
                let mut row = [0.0; 6];
                for i in 0..3 {
                    for j in 0..3 {
                        row[METRIC_INDEX[i][j]] += r[i][p] * r[j][q];
                    }
                }
                row[METRIC_INDEX[p][q]] -= 1.0;
                if row.iter().any(|v| v.abs() > PIVOT_TOLERANCE) {
                    rows.push(row);
                }
            }
        }
    }
    let (rref, pivots) = row_reduce(rows);
    let implied = |terms: &[(usize, f64)]| {
        let mut v = [0.0; 6];
        for &(k, c) in terms {
            v[k] += c;
        }
        in_row_space(&rref, &pivots, v)
    };

    let mut ties = [Free; 6];
    if implied(&[(1, 1.0), (0, -1.0)]) {
        ties[1] = Same(0);
    }
    if implied(&[(2, 1.0), (0, -1.0)]) {
        ties[2] = Same(0);
    } else if implied(&[(2, 1.0), (1, -1.0)]) {
        ties[2] = Same(1);
    }

    // 角度 k 对应的度规分量及其两条边
    for (k, i, j) in [(3, 1, 2), (4, 0, 2), (5, 0, 1)] {
        let right = implied(&[(k, 1.0)]);
        // 等长两边夹 120° 时 g_ij = -g_ii/2
        let hexagonal = implied(&[(k, 1.0), (i, 0.5)]) && implied(&[(k, 1.0), (j, 0.5)]);
        if right || hexagonal {
            ties[k] = Fixed;
        }
    }
    // 菱面体设置下三个角相等
    if ties[4] == Free && ties[1] == Same(0) && implied(&[(4, 1.0), (3, -1.0)]) {
        ties[4] = Same(3);
    }
    if ties[5] == Free && ties[2] == Same(0) && implied(&[(5, 1.0), (3, -1.0)]) {
        ties[5] = Same(3);
    }
    ties
}

/// v 是否为行化简结果中各行的线性组合
fn in_row_space<const N: usize>(rref: &[[f64; N]], pivots: &[usize], mut v: [f64; N]) -> bool {
    for (row, &pivot) in rref.iter().zip(pivots) {
        let f = v[pivot];
        if f != 0.0 {
            for c in 0..N {
                v[c] -= f * row[c];
            }
        }
    }
    v.iter().all(|x| x.abs() < PIVOT_TOLERANCE)
}

// ─────────────────────────────────────────────────────────────
// 位点对称性约束
// ─────────────────────────────────────────────────────────────

/// 分数坐标的约束关系
#[derive(Debug, Clone, PartialEq)]
pub enum CoordTie {
    /// 独立坐标
    Free,
    /// 被位点对称性固定
    Fixed,
    /// Δx_k = Σ coef·Δx_j，j 为独立坐标
    Linear(Vec<(usize, f64)>),
}

impl CoordTie {
    pub fn is_free(&self) -> bool {
        matches!(self, CoordTie::Free)
    }
}

/// 计算位点对称群允许的位移子空间，并给出每个坐标的约束
///
/// 位点对称群由把该位置映射回自身（模 1）的操作组成；允许的位移 d 满足
/// (R - I) d = 0。对堆叠后的矩阵做行化简，主元列为从属坐标，自由列为独立坐标。
pub fn coordinate_ties(position: &[f64; 3], ops: &[SymOp]) -> [CoordTie; 3] {
    let mut rows: Vec<[f64; 3]> = Vec::new();
    for op in ops {
        let image = op.apply(position);
        let coincident = (0..3).all(|k| {
            let d = image[k] - position[k];
            (d - d.round()).abs() < SITE_TOLERANCE
        });
        if !coincident {
            continue;
        }
        for i in 0..3 {
            let mut row = op.rotation[i];
            row[i] -= 1.0;
            if row.iter().any(|v| v.abs() > PIVOT_TOLERANCE) {
                rows.push(row);
            }
        }
    }

    let (rref, pivots) = row_reduce(rows);

    let mut ties = [CoordTie::Free, CoordTie::Free, CoordTie::Free];
    for (row, &pivot) in rref.iter().zip(pivots.iter()) {
        let terms: Vec<(usize, f64)> = (0..3)
            .filter(|j| !pivots.contains(j))
            .filter(|&j| row[j].abs() > PIVOT_TOLERANCE)
            .map(|j| (j, -row[j]))
            .collect();
        ties[pivot] = if terms.is_empty() {
            CoordTie::Fixed
        } else {
            CoordTie::Linear(terms)
        };
    }
    ties
}

/// 简化行阶梯形，返回非零行及其主元列
fn row_reduce<const N: usize>(mut m: Vec<[f64; N]>) -> (Vec<[f64; N]>, Vec<usize>) {
    let mut pivots = Vec::new();
    let mut lead = 0;
    for col in 0..N {
        if lead >= m.len() {
            break;
        }
        let best = (lead..m.len()).max_by(|&a, &b| m[a][col].abs().total_cmp(&m[b][col].abs()));
        let Some(best) = best else { break };
        if m[best][col].abs() < PIVOT_TOLERANCE {
            continue;
        }
        m.swap(lead, best);
        let p = m[lead][col];
        for v in m[lead].iter_mut() {
            *v /= p;
        }
        for r in 0..m.len() {
            if r != lead {
                let f = m[r][col];
                if f.abs() > 0.0 {
                    for c in 0..N {
                        m[r][c] -= f * m[lead][c];
                    }
                }
            }
        }
        pivots.push(col);
        lead += 1;
    }
    m.truncate(pivots.len());
    (m, pivots)
}
