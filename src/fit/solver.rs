//! # 有界非线性最小二乘
//!
//! 由 `levenberg-marquardt` crate 完成迭代。盒约束通过参数变换实现，求解器只看到无界的内部坐标 u：
//! - 双边界: x = lo + (hi − lo)·(sin u + 1)/2
//! - 仅下界: x = lo − 1 + √(u² + 1)
//! - 仅上界: x = hi + 1 − √(u² + 1)
//!
//! 起点落在边界上时向内移动一个极小量，否则变换的导数为零。
//! Jacobian 在内部坐标上前向差分。非有限残差被替换为大数，使该步被拒绝。
//!
//! `max_nfev` 限制求解器计数的残差计算次数（不含差分 Jacobian 的计算）。
//! 标准误差在结束点由外部坐标的差分 Jacobian 估计。
//!
//! ## 依赖关系
//! - 被 `fit/optimizer.rs` 使用
//! - 使用 `levenberg-marquardt`、`nalgebra`

use crate::error::{EzfitError, Result};
use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::storage::Owned;
use nalgebra::{DMatrix, DVector, Dyn};
use std::cell::RefCell;

/// 起点离边界的最小相对距离
const INTERIOR: f64 = 1e-6;

/// 非有限残差的替代值
const REJECTED_RESIDUAL: f64 = 1e100;

/// 残差函数
pub trait Residuals {
    fn residuals(&mut self, x: &[f64]) -> Result<Vec<f64>>;
}

impl<F> Residuals for F
where
    F: FnMut(&[f64]) -> Result<Vec<f64>>,
{
    fn residuals(&mut self, x: &[f64]) -> Result<Vec<f64>> {
        self(x)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SolverOptions {
    pub ftol: f64,
    pub max_nfev: usize,
}

impl Default for SolverOptions {
    fn default() -> Self {
        SolverOptions {
            ftol: 1e-5,
            max_nfev: 200,
        }
    }
}

/// 求解结果
#[derive(Debug, Clone)]
pub struct SolverReport {
    pub x: Vec<f64>,
    /// ½ Σ r²
    pub cost: f64,
    pub nfev: usize,
    pub converged: bool,
    /// 由结束点的 Jacobian 估计的标准误差
    pub std_errors: Vec<f64>,
}

/// 单个参数在内部坐标与外部值之间的变换
#[derive(Debug, Clone, Copy, PartialEq)]
enum BoundMap {
    Free,
    Lower(f64),
    Upper(f64),
    Both(f64, f64),
}

impl BoundMap {
    fn new((lower, upper): (f64, f64)) -> Self {
        match (lower.is_finite(), upper.is_finite()) {
            (true, true) => BoundMap::Both(lower, upper),
            (true, false) => BoundMap::Lower(lower),
            (false, true) => BoundMap::Upper(upper),
            (false, false) => BoundMap::Free,
        }
    }

    fn to_external(self, u: f64) -> f64 {
        match self {
            BoundMap::Free => u,
            BoundMap::Lower(lo) => lo - 1.0 + (u * u + 1.0).sqrt(),
            BoundMap::Upper(hi) => hi + 1.0 - (u * u + 1.0).sqrt(),
            BoundMap::Both(lo, hi) => lo + (hi - lo) * (u.sin() + 1.0) / 2.0,
        }
    }

    /// 外部值先投影进边界内部，再求内部坐标
    fn to_internal(self, x: f64) -> f64 {
        match self {
            BoundMap::Free => x,
            BoundMap::Lower(lo) => {
                let x = x.max(lo + INTERIOR * lo.abs().max(1.0));
                ((x - lo + 1.0).powi(2) - 1.0).sqrt()
            }
            BoundMap::Upper(hi) => {
                let x = x.min(hi - INTERIOR * hi.abs().max(1.0));
                ((hi - x + 1.0).powi(2) - 1.0).sqrt()
            }
            BoundMap::Both(lo, hi) => {
                let width = hi - lo;
                if !(width > 0.0) {
                    return 0.0;
                }
                let t = (2.0 * (x - lo) / width - 1.0).clamp(-1.0 + INTERIOR, 1.0 - INTERIOR);
                t.asin()
            }
        }
    }
}

fn half_sum_sq(r: &[f64]) -> f64 {
    0.5 * r.iter().map(|v| v * v).sum::<f64>()
}

/// 内部坐标上的最小二乘问题
struct BoundedProblem<'a, P: Residuals> {
    function: RefCell<&'a mut P>,
    maps: Vec<BoundMap>,
    u: DVector<f64>,
    m: usize,
    /// 最近一次计算 (u, r)
    last: RefCell<Option<(DVector<f64>, DVector<f64>)>>,
    /// 目前代价最低的点 (代价, u)
    best: RefCell<(f64, DVector<f64>)>,
    error: RefCell<Option<EzfitError>>,
}

impl<'a, P: Residuals> BoundedProblem<'a, P> {
    fn external(&self, u: &DVector<f64>) -> Vec<f64> {
        self.maps.iter().zip(u.iter()).map(|(m, v)| m.to_external(*v)).collect()
    }

    fn evaluate(&self, u: &DVector<f64>) -> Option<DVector<f64>> {
        if self.error.borrow().is_some() {
            return None;
        }
        if let Some((cached_u, r)) = self.last.borrow().as_ref() {
            if cached_u == u {
                return Some(r.clone());
            }
        }

        let x = self.external(u);
        let r = match P::residuals(&mut **self.function.borrow_mut(), &x) {
            Ok(r) => r,
            Err(e) => {
                *self.error.borrow_mut() = Some(e);
                return None;
            }
        };
        if r.len() != self.m {
            *self.error.borrow_mut() = Some(EzfitError::Solver(format!(
                "residual length changed from {} to {}",
                self.m,
                r.len()
            )));
            return None;
        }

        let finite = r.iter().all(|v| v.is_finite());
        let r = DVector::from_iterator(
            self.m,
            r.into_iter()
                .map(|v| if v.is_finite() { v } else { REJECTED_RESIDUAL }),
        );
        if finite {
            let cost = 0.5 * r.norm_squared();
            let mut best = self.best.borrow_mut();
            if cost < best.0 {
                *best = (cost, u.clone());
            }
        }
        *self.last.borrow_mut() = Some((u.clone(), r.clone()));
        Some(r)
    }
}

impl<'a, P: Residuals> LeastSquaresProblem<f64, Dyn, Dyn> for BoundedProblem<'a, P> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, u: &DVector<f64>) {
        self.u.copy_from(u);
    }

    fn params(&self) -> DVector<f64> {
        self.u.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        self.evaluate(&self.u)
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let r0 = self.evaluate(&self.u)?;
        let n = self.u.len();
        let eps = f64::EPSILON.sqrt();
        let mut jac = DMatrix::<f64>::zeros(self.m, n);
        let mut shifted = self.u.clone();
        for j in 0..n {
            let h = eps * self.u[j].abs().max(1.0);
            shifted[j] = self.u[j] + h;
            let r = self.evaluate(&shifted)?;
            shifted[j] = self.u[j];
            jac.set_column(j, &((r - &r0) / h));
        }
        Some(jac)
    }
}

/// 外部坐标上的前向差分 Jacobian；靠近上界时改为后向差分
fn external_jacobian<P: Residuals>(
    function: &mut P,
    x: &[f64],
    r0: &[f64],
    bounds: &[(f64, f64)],
) -> Result<DMatrix<f64>> {
    let m = r0.len();
    let n = x.len();
    let mut jac = DMatrix::<f64>::zeros(m, n);
    let eps = f64::EPSILON.sqrt();

    let mut xp = x.to_vec();
    for j in 0..n {
        let mut h = eps * x[j].abs().max(1.0);
        if x[j] + h > bounds[j].1 {
            h = -h;
        }
        xp[j] = x[j] + h;
        let r = P::residuals(function, &xp)?;
        xp[j] = x[j];
        if r.len() != m {
            return Err(EzfitError::Solver(format!(
                "residual length changed from {} to {}",
                m,
                r.len()
            )));
        }
        for i in 0..m {
            jac[(i, j)] = (r[i] - r0[i]) / h;
        }
    }
    Ok(jac)
}

fn standard_errors(jac: &DMatrix<f64>, cost: f64) -> Vec<f64> {
    let (m, n) = jac.shape();
    let dof = m.saturating_sub(n).max(1) as f64;
    let variance = 2.0 * cost / dof;
    let jtj = jac.transpose() * jac;
    match jtj.pseudo_inverse(1e-12) {
        Ok(inv) => (0..n)
            .map(|k| {
                let v = inv[(k, k)];
                if v.is_finite() {
                    (v.max(0.0) * variance).sqrt()
                } else {
                    f64::NAN
                }
            })
            .collect(),
        Err(_) => vec![f64::NAN; n],
    }
}

/// 在盒约束内最小化 ½‖r(x)‖²
pub fn least_squares<P: Residuals>(
    function: &mut P,
    x0: &[f64],
    bounds: &[(f64, f64)],
    options: &SolverOptions,
) -> Result<SolverReport> {
    if x0.len() != bounds.len() {
        return Err(EzfitError::Solver(format!(
            "{} start values but {} bounds",
            x0.len(),
            bounds.len()
        )));
    }
    let n = x0.len();
    let maps: Vec<BoundMap> = bounds.iter().copied().map(BoundMap::new).collect();
    let u0 = DVector::from_iterator(n, maps.iter().zip(x0).map(|(m, x)| m.to_internal(*x)));
    let start: Vec<f64> = maps.iter().zip(u0.iter()).map(|(m, u)| m.to_external(*u)).collect();

    let r0 = P::residuals(function, &start)?;
    if !r0.iter().all(|v| v.is_finite()) {
        return Err(EzfitError::Solver(
            "residuals are not finite at the start point".to_string(),
        ));
    }
    let start_cost = half_sum_sq(&r0);
    if n == 0 {
        return Ok(SolverReport {
            x: start,
            cost: start_cost,
            nfev: 1,
            converged: true,
            std_errors: Vec::new(),
        });
    }

    let m = r0.len();
    let problem = BoundedProblem {
        function: RefCell::new(&mut *function),
        maps,
        u: u0.clone(),
        m,
        last: RefCell::new(Some((u0.clone(), DVector::from_vec(r0)))),
        best: RefCell::new((start_cost, u0)),
        error: RefCell::new(None),
    };

    // 求解器的计算上限为 patience·(n + 1)
    let patience = (options.max_nfev / (n + 1)).max(1);
    let (maps, best, error, report) = {
        let (problem, report) = LevenbergMarquardt::new()
            .with_ftol(options.ftol)
            .with_patience(patience)
            .minimize(problem);
        (
            problem.maps,
            problem.best.into_inner(),
            problem.error.into_inner(),
            report,
        )
    };

    if let Some(e) = error {
        return Err(e);
    }
    let (cost, u) = best;
    let x: Vec<f64> = maps
        .iter()
        .zip(u.iter())
        .map(|(m, v)| m.to_external(*v))
        .collect();

    let converged = report.termination.was_successful();
    if !converged {
        tracing::warn!(
            nfev = report.number_of_evaluations,
            cost,
            reason = ?report.termination,
            "solver stopped before convergence"
        );
    }

    let r = P::residuals(function, &x)?;
    let jac = external_jacobian(function, &x, &r, bounds)?;
    Ok(SolverReport {
        std_errors: standard_errors(&jac, cost),
        x,
        cost,
        nfev: report.number_of_evaluations,
        converged,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bound_maps_round_trip_inside() {
        let maps = [
            BoundMap::new((f64::NEG_INFINITY, f64::INFINITY)),
            BoundMap::new((0.0, f64::INFINITY)),
            BoundMap::new((f64::NEG_INFINITY, 2.0)),
            BoundMap::new((1.0, 5.0)),
        ];
        for (map, x) in maps.iter().zip([-3.5, 0.7, 1.2, 3.3]) {
            let back = map.to_external(map.to_internal(x));
            assert!((back - x).abs() < 1e-9, "{:?}: {} -> {}", map, x, back);
        }
    }

    #[test]
    fn test_bound_maps_stay_in_bounds() {
        let both = BoundMap::new((1.0, 5.0));
        let lower = BoundMap::new((0.0, f64::INFINITY));
        for u in [-100.0, -1.0, 0.0, 0.3, 7.0, 1e6] {
            let x = both.to_external(u);
            assert!((1.0..=5.0).contains(&x));
            assert!(lower.to_external(u) >= 0.0);
        }
        // 边界上的起点被移入内部
        let x = both.to_external(both.to_internal(5.0));
        assert!(x < 5.0 && x > 4.99);
        assert_eq!(BoundMap::new((2.0, 2.0)).to_external(0.4), 2.0);
    }

    #[test]
    fn test_linear_fit() {
        let xs: Vec<f64> = (0..20).map(|i| i as f64 * 0.5).collect();
        let ys: Vec<f64> = xs.iter().map(|x| 2.0 + 3.0 * x).collect();
        let mut f = |p: &[f64]| -> Result<Vec<f64>> {
            Ok(xs.iter().zip(&ys).map(|(x, y)| y - (p[0] + p[1] * x)).collect())
        };
        let bounds = [(f64::NEG_INFINITY, f64::INFINITY); 2];
        let report = least_squares(&mut f, &[0.0, 0.0], &bounds, &SolverOptions::default()).unwrap();
        assert!((report.x[0] - 2.0).abs() < 1e-4);
        assert!((report.x[1] - 3.0).abs() < 1e-4);
        assert!(report.cost < 1e-6);
        assert!(report.converged);
    }

    #[test]
    fn test_exponential_decay() {
        let ts: Vec<f64> = (0..30).map(|i| i as f64 * 0.2).collect();
        let ys: Vec<f64> = ts.iter().map(|t| 5.0 * (-0.7 * t).exp()).collect();
        let mut f = |p: &[f64]| -> Result<Vec<f64>> {
            Ok(ts.iter().zip(&ys).map(|(t, y)| y - p[0] * (-p[1] * t).exp()).collect())
        };
        let bounds = [(0.0, 100.0), (0.0, 10.0)];
        let options = SolverOptions {
            ftol: 1e-12,
            max_nfev: 500,
        };
        let report = least_squares(&mut f, &[1.0, 0.1], &bounds, &options).unwrap();
        assert!((report.x[0] - 5.0).abs() < 1e-3);
        assert!((report.x[1] - 0.7).abs() < 1e-3);
    }

    #[test]
    fn test_active_bound() {
        let mut f = |p: &[f64]| -> Result<Vec<f64>> { Ok(vec![p[0] - 3.0]) };
        let report =
            least_squares(&mut f, &[0.5], &[(0.0, 2.0)], &SolverOptions::default()).unwrap();
        assert!(report.x[0] <= 2.0);
        assert!((report.x[0] - 2.0).abs() < 1e-3);
    }

    #[test]
    fn test_start_point_projected() {
        let mut f = |p: &[f64]| -> Result<Vec<f64>> { Ok(vec![p[0] - 1.0]) };
        let report =
            least_squares(&mut f, &[10.0], &[(0.0, 5.0)], &SolverOptions::default()).unwrap();
        assert!(report.x[0] <= 5.0);
        assert!((report.x[0] - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_evaluation_limit() {
        let mut f = |p: &[f64]| -> Result<Vec<f64>> { Ok(vec![(p[0] - 1.0).powi(3), p[1] - 2.0]) };
        let options = SolverOptions {
            ftol: 1e-15,
            max_nfev: 10,
        };
        let bounds = [(f64::NEG_INFINITY, f64::INFINITY); 2];
        let report = least_squares(&mut f, &[5.0, 5.0], &bounds, &options).unwrap();
        assert!(report.nfev <= 10);
        assert!(!report.converged);
        // 未收敛时仍返回代价最低的点
        assert!(report.x[0] < 5.0);
    }

    #[test]
    fn test_callback_error_propagates() {
        let mut calls = 0;
        let mut f = |p: &[f64]| -> Result<Vec<f64>> {
            calls += 1;
            if calls > 3 {
                return Err(EzfitError::Other("model failed".to_string()));
            }
            Ok(vec![p[0] - 1.0, p[0] + 1.0])
        };
        let bounds = [(f64::NEG_INFINITY, f64::INFINITY)];
        let err = least_squares(&mut f, &[4.0], &bounds, &SolverOptions::default()).unwrap_err();
        assert!(matches!(err, EzfitError::Other(_)));
    }

    #[test]
    fn test_non_finite_start_is_error() {
        let mut f = |_: &[f64]| -> Result<Vec<f64>> { Ok(vec![f64::NAN]) };
        let err = least_squares(&mut f, &[1.0], &[(0.0, 2.0)], &SolverOptions::default());
        assert!(matches!(err, Err(EzfitError::Solver(_))));
    }

    #[test]
    fn test_no_free_parameters() {
        let mut f = |_: &[f64]| -> Result<Vec<f64>> { Ok(vec![1.0, 1.0]) };
        let report = least_squares(&mut f, &[], &[], &SolverOptions::default()).unwrap();
        assert_eq!(report.nfev, 1);
        assert_eq!(report.cost, 1.0);
    }
}
