//! # 实测 PDF 数据
//!
//! 保存实测的 (r, G(r), dG) 三元组，以及精修时使用的计算区间。
//!
//! ## 依赖关系
//! - 被 `parsers/gr.rs` 创建
//! - 被 `fit/recipe.rs` 和 `fit/results.rs` 使用

use crate::error::{EzfitError, Result};

/// 实测 PDF 曲线及其计算区间
#[derive(Debug, Clone)]
pub struct Profile {
    /// 实测 r (Å)
    pub r_obs: Vec<f64>,
    /// 实测 G(r)
    pub g_obs: Vec<f64>,
    /// 实测不确定度
    pub dg_obs: Vec<f64>,

    /// 计算网格上的 r
    pub x: Vec<f64>,
    /// 计算网格上的 G(r)
    pub y: Vec<f64>,
    /// 计算网格上的不确定度
    pub dy: Vec<f64>,
}

impl Profile {
    /// 创建新的曲线，计算区间默认为全部数据
    pub fn new(r: Vec<f64>, g: Vec<f64>, dg: Vec<f64>) -> Result<Self> {
        if r.len() != g.len() || r.len() != dg.len() {
            return Err(EzfitError::Other(format!(
                "Profile arrays differ in length: r={}, G={}, dG={}",
                r.len(),
                g.len(),
                dg.len()
            )));
        }
        if r.len() < 2 {
            return Err(EzfitError::Other(
                "Profile needs at least two data points".to_string(),
            ));
        }
        Ok(Profile {
            x: r.clone(),
            y: g.clone(),
            dy: dg.clone(),
            r_obs: r,
            g_obs: g,
            dg_obs: dg,
        })
    }

    /// 设定计算区间 [rmin, rmax]，步长 rstep；通过线性插值重采样实测数据
    pub fn set_calculation_range(&mut self, rmin: f64, rmax: f64, rstep: f64) -> Result<()> {
        if !(rstep > 0.0) {
            return Err(EzfitError::config(
                "range.rstep",
                format!("step must be positive, got {}", rstep),
            ));
        }
        let lo = rmin.max(self.r_obs[0]);
        let hi = rmax.min(self.r_obs[self.r_obs.len() - 1]);
        if !(lo < hi) {
            return Err(EzfitError::config(
                "range",
                format!(
                    "calculation range [{}, {}] does not overlap the data [{}, {}]",
                    rmin,
                    rmax,
                    self.r_obs[0],
                    self.r_obs[self.r_obs.len() - 1]
                ),
            ));
        }

        let n = ((hi - lo) / rstep + 1e-9).floor() as usize + 1;
        let x: Vec<f64> = (0..n).map(|i| lo + i as f64 * rstep).collect();
        self.y = x.iter().map(|&r| interp(r, &self.r_obs, &self.g_obs)).collect();
        self.dy = x.iter().map(|&r| interp(r, &self.r_obs, &self.dg_obs)).collect();
        self.x = x;
        Ok(())
    }

    /// 计算网格点数
    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }
}

/// 线性插值，超出范围时取端点值
pub fn interp(x: f64, xs: &[f64], ys: &[f64]) -> f64 {
    if xs.is_empty() {
        return f64::NAN;
    }
    if x <= xs[0] {
        return ys[0];
    }
    let last = xs.len() - 1;
    if x >= xs[last] {
        return ys[last];
    }
    let i = xs.partition_point(|&v| v <= x);
    let (x0, x1) = (xs[i - 1], xs[i]);
    let (y0, y1) = (ys[i - 1], ys[i]);
    if x1 == x0 {
        return y0;
    }
    y0 + (y1 - y0) * (x - x0) / (x1 - x0)
}
