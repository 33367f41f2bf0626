//! # 纳米颗粒形状函数
//!
//! 有限尺寸颗粒的特征函数 γ₀(r)，与晶体 PDF 相乘以描述随 r 增大的衰减。
//!
//! | 标识 | 参数 |
//! |---|---|
//! | `sphericalCF` | psize（直径） |
//! | `spheroidalCF` | erad（赤道半径）, prad（极半径） |
//! | `spheroidalCF2` | psize（赤道直径）, axrat（轴比） |
//! | `lognormalSphericalCF` | psize（平均直径）, psig（对数正态宽度） |
//! | `sheetCF` | sthick（片层厚度） |
//! | `shellCF` | radius（内半径）, thickness |
//! | `shellCF2` | a（平均半径）, delta（厚度） |
//! | `bulkCF` | 无 |
//!
//! ## 依赖关系
//! - 被 `fit/assembly.rs` 使用（形状标识与参数列表）
//! - 被 `fit/recipe.rs` 使用（求值）
//! - 使用 `statrs` 的 erfc

use crate::error::{EzfitError, Result};
use statrs::function::erf::erfc;
use std::f64::consts::{PI, SQRT_2};
use std::fmt;
use std::str::FromStr;

/// 形状函数种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShapeFunction {
    Spherical,
    Spheroidal,
    Spheroidal2,
    LognormalSpherical,
    Sheet,
    Shell,
    Shell2,
    Bulk,
}

impl ShapeFunction {
    /// 全部已注册的形状函数
    pub const ALL: [ShapeFunction; 8] = [
        ShapeFunction::Spherical,
        ShapeFunction::Spheroidal,
        ShapeFunction::Spheroidal2,
        ShapeFunction::LognormalSpherical,
        ShapeFunction::Sheet,
        ShapeFunction::Shell,
        ShapeFunction::Shell2,
        ShapeFunction::Bulk,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            ShapeFunction::Spherical => "sphericalCF",
            ShapeFunction::Spheroidal => "spheroidalCF",
            ShapeFunction::Spheroidal2 => "spheroidalCF2",
            ShapeFunction::LognormalSpherical => "lognormalSphericalCF",
            ShapeFunction::Sheet => "sheetCF",
            ShapeFunction::Shell => "shellCF",
            ShapeFunction::Shell2 => "shellCF2",
            ShapeFunction::Bulk => "bulkCF",
        }
    }

    /// 除 r 以外的参数名后缀（按调用顺序）
    pub fn parameter_suffixes(&self) -> &'static [&'static str] {
        match self {
            ShapeFunction::Spherical => &["psize"],
            ShapeFunction::Spheroidal => &["erad", "prad"],
            ShapeFunction::Spheroidal2 => &["psize", "axrat"],
            ShapeFunction::LognormalSpherical => &["psize", "psig"],
            ShapeFunction::Sheet => &["sthick"],
            ShapeFunction::Shell => &["radius", "thickness"],
            ShapeFunction::Shell2 => &["a", "delta"],
            ShapeFunction::Bulk => &[],
        }
    }

    /// 在 r 处求值，`args` 长度必须等于参数个数
    pub fn evaluate(&self, r: f64, args: &[f64]) -> f64 {
        let arg = |k: usize| args.get(k).copied().unwrap_or(0.0);
        match self {
            ShapeFunction::Spherical => spherical(r, arg(0)),
            ShapeFunction::Spheroidal => spheroidal2(r, 2.0 * arg(0), safe_ratio(arg(1), arg(0))),
            ShapeFunction::Spheroidal2 => spheroidal2(r, arg(0), arg(1)),
            ShapeFunction::LognormalSpherical => lognormal_spherical(r, arg(0), arg(1)),
            ShapeFunction::Sheet => sheet(r, arg(0)),
            ShapeFunction::Shell => {
                let inner = arg(0);
                shell(r, inner, inner + arg(1))
            }
            ShapeFunction::Shell2 => {
                let (a, delta) = (arg(0), arg(1));
                shell(r, a - delta / 2.0, a + delta / 2.0)
            }
            ShapeFunction::Bulk => 1.0,
        }
    }
}

impl fmt::Display for ShapeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

impl FromStr for ShapeFunction {
    type Err = EzfitError;

    fn from_str(s: &str) -> Result<Self> {
        ShapeFunction::ALL
            .iter()
            .copied()
            .find(|shape| shape.id() == s)
            .ok_or_else(|| {
                EzfitError::config(
                    "shape",
                    format!(
                        "unknown shape function '{}' (known: {})",
                        s,
                        ShapeFunction::ALL.map(|f| f.id()).join(", ")
                    ),
                )
            })
    }
}

fn safe_ratio(num: f64, den: f64) -> f64 {
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

/// 球形颗粒，psize 为直径
pub fn spherical(r: f64, psize: f64) -> f64 {
    if psize <= 0.0 {
        return 0.0;
    }
    let x = r / psize;
    if x > 1.0 {
        0.0
    } else {
        1.0 - 1.5 * x + 0.5 * x * x * x
    }
}

/// 旋转椭球颗粒，psize 为赤道直径，axrat 为极轴与赤道轴之比
pub fn spheroidal2(r: f64, psize: f64, axrat: f64) -> f64 {
    let v = axrat;
    let d = psize;
    if d <= 0.0 || v <= 0.0 {
        return 0.0;
    }
    if (v - 1.0).abs() < 1e-12 {
        return spherical(r, psize);
    }
    let d2 = d * d;
    let v2 = v * v;
    let r2 = r * r;
    let common = 1.0 - 3.0 * r / (4.0 * d * v) * (1.0 - r2 / (4.0 * d2) * (1.0 + 2.0 / (3.0 * v2)));
    let envelope = 3.0 * r / (4.0 * d) * (1.0 - r2 / (4.0 * d2));

    if v < 1.0 {
        let k = v / (1.0 - v2).sqrt();
        if r <= v * d {
            common - envelope * k * (1.0 - v2).sqrt().atanh()
        } else if r <= d {
            let s = (1.0 - r2 / d2).sqrt();
            (3.0 * d / (8.0 * r) * (1.0 + r2 / (2.0 * d2)) * s - envelope * s.atanh()) * k
        } else {
            0.0
        }
    } else {
        let k = v / (v2 - 1.0).sqrt();
        let at = (v2 - 1.0).sqrt().atan();
        if r <= d {
            common - envelope * k * at
        } else if r <= v * d {
            common
                - 3.0 / 8.0 * (1.0 + r2 / (2.0 * d2)) * (1.0 - d2 / r2).sqrt() * k
                - envelope * k * (at - (r2 / d2 - 1.0).sqrt().atan())
        } else {
            0.0
        }
    }
}

/// 对数正态尺寸分布的球形颗粒
pub fn lognormal_spherical(r: f64, psize: f64, psig: f64) -> f64 {
    if psize <= 0.0 {
        return 0.0;
    }
    if psig <= 0.0 {
        return spherical(r, psize);
    }
    if r <= 0.0 {
        return 1.0;
    }
    let s = (psig * psig / (psize * psize) + 1.0).ln().sqrt();
    let mu = psize.ln() - s * s / 2.0;
    if mu < 0.0 {
        return 0.0;
    }
    let lr = r.ln();
    let w = SQRT_2 * s;
    0.5 * erfc((lr - mu - 3.0 * s * s) / w)
        - 0.75 * r * erfc((lr - mu - 2.0 * s * s) / w) * (-mu - 2.5 * s * s).exp()
        + 0.25 * r * r * r * erfc((lr - mu) / w) * (-3.0 * mu - 4.5 * s * s).exp()
}

/// 无限大片层，sthick 为厚度
pub fn sheet(r: f64, sthick: f64) -> f64 {
    if sthick <= 0.0 {
        return 0.0;
    }
    if r <= sthick {
        1.0 - r / (2.0 * sthick)
    } else {
        0.5 * sthick / r
    }
}

/// 球壳：壳层与其平移像的重叠体积除以壳层体积
pub fn shell(r: f64, inner: f64, outer: f64) -> f64 {
    let inner = inner.max(0.0);
    if outer <= inner {
        return 0.0;
    }
    let shell_volume = 4.0 / 3.0 * PI * (outer.powi(3) - inner.powi(3));
    let overlap = lens_volume(outer, outer, r) - 2.0 * lens_volume(outer, inner, r)
        + lens_volume(inner, inner, r);
    (overlap / shell_volume).max(0.0)
}

/// 半径 R、ρ，球心距 d 的两球交集体积
fn lens_volume(big: f64, small: f64, d: f64) -> f64 {
    let d = d.abs();
    if big <= 0.0 || small <= 0.0 || d >= big + small {
        return 0.0;
    }
    if d <= (big - small).abs() {
        let m = big.min(small);
        return 4.0 / 3.0 * PI * m * m * m;
    }
    let sum = big + small - d;
    let diff = big - small;
    PI * sum * sum * (d * d + 2.0 * d * (big + small) - 3.0 * diff * diff) / (12.0 * d)
}
