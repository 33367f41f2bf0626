//! # 单相 PDF 生成器
//!
//! 定义 `ProfileGenerator` trait：由晶体结构与一组参数值计算该相的 G(r)。
//! 内置 `PairSumGenerator` 为实空间原子对求和实现。
//!
//! ## 公式
//! - R(r) = (1/N) Σᵢ Σⱼ (bᵢ bⱼ / ⟨b⟩²) · Gauss(r − rᵢⱼ, σᵢⱼ)
//! - σᵢⱼ² = (uᵢ + uⱼ) · (1 − δ₂/rᵢⱼ² + Qbroad² rᵢⱼ²)，u = Biso / 8π²
//! - G(r) = scale · exp(−(Qdamp r)²/2) · (R(r)/r − 4πρ₀ r)
//!
//! X 射线权重取原子序数 Z。
//!
//! ## 依赖关系
//! - 被 `fit/recipe.rs` 使用
//! - 使用 `models/`、`pdf/scattering.rs`
//! - 使用 `rayon` 在线程池内并行遍历原子

use crate::error::{EzfitError, Result};
use crate::models::structure::{expand_with, LATTICE_PARAMETER_NAMES};
use crate::models::symmetry::{coordinate_ties, lattice_ties};
use crate::models::{CoordTie, Crystal, Lattice, LatticeTie};
use crate::pdf::scattering::atomic_number;
use rayon::prelude::*;
use std::f64::consts::PI;
use std::fmt;
use std::sync::Arc;

/// 坐标轴名称
pub const AXES: [&str; 3] = ["x", "y", "z"];

/// 峰宽下限 (Å)
const MIN_SIGMA: f64 = 1e-3;

/// 高斯峰截断（σ 的倍数）
const PEAK_CUTOFF: f64 = 5.0;

/// 生成器暴露的可精修参数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeneratorParam {
    Scale,
    Delta2,
    Qdamp,
    Qbroad,
    Lattice(usize),
    Coord { site: usize, axis: usize },
    Biso(usize),
    Occ(usize),
}

impl GeneratorParam {
    /// 生成器内部名称，坐标以位点序号表示（如 `x_0`）
    pub fn local_name(&self) -> String {
        match self {
            GeneratorParam::Scale => "scale".to_string(),
            GeneratorParam::Delta2 => "delta2".to_string(),
            GeneratorParam::Qdamp => "qdamp".to_string(),
            GeneratorParam::Qbroad => "qbroad".to_string(),
            GeneratorParam::Lattice(k) => LATTICE_PARAMETER_NAMES[*k].to_string(),
            GeneratorParam::Coord { site, axis } => format!("{}_{}", AXES[*axis], site),
            GeneratorParam::Biso(i) => format!("Biso_{}", i),
            GeneratorParam::Occ(i) => format!("occ_{}", i),
        }
    }
}

/// 由对称性导出的参数依赖关系
#[derive(Debug, Clone)]
pub struct StructureLayout {
    pub lattice_ties: [LatticeTie; 6],
    pub coord_ties: Vec<[CoordTie; 3]>,
}

impl StructureLayout {
    pub fn from_crystal(crystal: &Crystal) -> Self {
        let ops = crystal.effective_symops();
        StructureLayout {
            lattice_ties: lattice_ties(&ops),
            coord_ties: crystal
                .sites
                .iter()
                .map(|s| coordinate_ties(&s.position, &ops))
                .collect(),
        }
    }

    /// 参数是否为独立变量
    pub fn is_independent(&self, param: GeneratorParam) -> bool {
        match param {
            GeneratorParam::Lattice(k) => matches!(self.lattice_ties[k], LatticeTie::Free),
            GeneratorParam::Coord { site, axis } => self
                .coord_ties
                .get(site)
                .map(|t| t[axis].is_free())
                .unwrap_or(false),
            _ => true,
        }
    }
}

/// 单相的全部参数值
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseValues {
    pub scale: f64,
    pub delta2: f64,
    pub qdamp: f64,
    pub qbroad: f64,
    pub lattice: [f64; 6],
    pub positions: Vec<[f64; 3]>,
    pub biso: Vec<f64>,
    pub occupancy: Vec<f64>,
}

impl PhaseValues {
    pub fn from_crystal(crystal: &Crystal) -> Self {
        PhaseValues {
            scale: 1.0,
            delta2: 0.0,
            qdamp: 0.0,
            qbroad: 0.0,
            lattice: crystal.lattice.parameters(),
            positions: crystal.sites.iter().map(|s| s.position).collect(),
            biso: crystal.sites.iter().map(|s| s.biso).collect(),
            occupancy: crystal.sites.iter().map(|s| s.occupancy).collect(),
        }
    }

    pub fn get(&self, param: GeneratorParam) -> f64 {
        match param {
            GeneratorParam::Scale => self.scale,
            GeneratorParam::Delta2 => self.delta2,
            GeneratorParam::Qdamp => self.qdamp,
            GeneratorParam::Qbroad => self.qbroad,
            GeneratorParam::Lattice(k) => self.lattice[k],
            GeneratorParam::Coord { site, axis } => self.positions[site][axis],
            GeneratorParam::Biso(i) => self.biso[i],
            GeneratorParam::Occ(i) => self.occupancy[i],
        }
    }

    pub fn set(&mut self, param: GeneratorParam, value: f64) {
        match param {
            GeneratorParam::Scale => self.scale = value,
            GeneratorParam::Delta2 => self.delta2 = value,
            GeneratorParam::Qdamp => self.qdamp = value,
            GeneratorParam::Qbroad => self.qbroad = value,
            GeneratorParam::Lattice(k) => self.lattice[k] = value,
            GeneratorParam::Coord { site, axis } => self.positions[site][axis] = value,
            GeneratorParam::Biso(i) => self.biso[i] = value,
            GeneratorParam::Occ(i) => self.occupancy[i] = value,
        }
    }

    /// 按对称约束传播独立变量到从属变量；`reference` 为结构初值
    pub fn apply_ties(&mut self, layout: &StructureLayout, reference: &PhaseValues) {
        let lattice = self.lattice;
        for (k, tie) in layout.lattice_ties.iter().enumerate() {
            match tie {
                LatticeTie::Free => {}
                LatticeTie::Same(j) => self.lattice[k] = lattice[*j],
                LatticeTie::Fixed => self.lattice[k] = reference.lattice[k],
            }
        }

        for (i, ties) in layout.coord_ties.iter().enumerate() {
            let current = self.positions[i];
            let initial = reference.positions[i];
            for (axis, tie) in ties.iter().enumerate() {
                match tie {
                    CoordTie::Free => {}
                    CoordTie::Fixed => self.positions[i][axis] = initial[axis],
                    CoordTie::Linear(terms) => {
                        self.positions[i][axis] = initial[axis]
                            + terms
                                .iter()
                                .map(|(j, c)| c * (current[*j] - initial[*j]))
                                .sum::<f64>();
                    }
                }
            }
        }
    }
}

/// 单相 PDF 生成器接口
pub trait ProfileGenerator: Send + Sync + fmt::Debug {
    /// 相名称
    fn name(&self) -> &str;

    /// 初始结构
    fn crystal(&self) -> &Crystal;

    fn layout(&self) -> &StructureLayout;

    /// 未绑定参数时使用的取值
    fn defaults(&self) -> &PhaseValues;

    fn defaults_mut(&mut self) -> &mut PhaseValues;

    /// 在给定 r 网格上计算该相的 G(r)
    fn generate(&self, r: &[f64], values: &PhaseValues) -> Result<Vec<f64>>;

    /// 以当前参数值重建结构（用于导出 CIF）
    fn refined_crystal(&self, values: &PhaseValues) -> Crystal {
        let mut crystal = self.crystal().clone();
        crystal.name = self.name().to_string();
        crystal.lattice = Lattice::from_array(values.lattice);
        crystal.cell_volume = None;
        for (i, site) in crystal.sites.iter_mut().enumerate() {
            site.position = values.positions[i];
            site.biso = values.biso[i];
            site.occupancy = values.occupancy[i];
        }
        crystal
    }
}

/// 晶胞内展开后的原子
#[derive(Debug, Clone, Copy)]
struct CellAtom {
    cart: [f64; 3],
    /// Z · occ
    weight: f64,
    occupancy: f64,
    /// 均方位移 u = Biso / 8π²
    msd: f64,
}

/// 实空间原子对求和生成器
#[derive(Debug, Clone)]
pub struct PairSumGenerator {
    name: String,
    crystal: Crystal,
    layout: StructureLayout,
    defaults: PhaseValues,
    pool: Arc<rayon::ThreadPool>,
}

impl PairSumGenerator {
    /// 创建生成器；`workers` 为 0 时使用全部 CPU
    pub fn new(name: impl Into<String>, crystal: Crystal, workers: usize) -> Result<Self> {
        let workers = if workers == 0 { num_cpus::get() } else { workers };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| EzfitError::Other(format!("Failed to build thread pool: {}", e)))?;

        for site in &crystal.sites {
            if atomic_number(&site.element).is_none() {
                return Err(EzfitError::ParseError {
                    format: "cif".to_string(),
                    path: crystal.name.clone(),
                    reason: format!("Unknown element '{}' at site {}", site.element, site.label),
                });
            }
        }

        Ok(PairSumGenerator {
            name: name.into(),
            layout: StructureLayout::from_crystal(&crystal),
            defaults: PhaseValues::from_crystal(&crystal),
            crystal,
            pool: Arc::new(pool),
        })
    }

    fn cell_atoms(&self, lattice: &Lattice, values: &PhaseValues) -> Vec<CellAtom> {
        let ops = self.crystal.effective_symops();
        let mut atoms = Vec::new();
        for (i, site) in self.crystal.sites.iter().enumerate() {
            let z = atomic_number(&site.element).unwrap_or(0) as f64;
            let occ = values.occupancy[i];
            let msd = values.biso[i].max(0.0) / (8.0 * PI * PI);
            for frac in expand_with(&ops, &values.positions[i]) {
                atoms.push(CellAtom {
                    cart: lattice.to_cartesian(&frac),
                    weight: z * occ,
                    occupancy: occ,
                    msd,
                });
            }
        }
        atoms
    }
}

impl ProfileGenerator for PairSumGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    fn crystal(&self) -> &Crystal {
        &self.crystal
    }

    fn layout(&self) -> &StructureLayout {
        &self.layout
    }

    fn defaults(&self) -> &PhaseValues {
        &self.defaults
    }

    fn defaults_mut(&mut self) -> &mut PhaseValues {
        &mut self.defaults
    }

    fn generate(&self, r: &[f64], values: &PhaseValues) -> Result<Vec<f64>> {
        if r.is_empty() {
            return Ok(Vec::new());
        }
        let lattice = Lattice::from_array(values.lattice);
        let volume = lattice.volume();
        if !(volume.is_finite() && volume > 0.0) {
            return Err(EzfitError::Solver(format!(
                "phase '{}' has a degenerate cell (lattice {:?})",
                self.name, values.lattice
            )));
        }

        let atoms = self.cell_atoms(&lattice, values);
        let n_total: f64 = atoms.iter().map(|a| a.occupancy).sum();
        let b_sum: f64 = atoms.iter().map(|a| a.weight).sum();
        if n_total <= 0.0 || b_sum <= 0.0 {
            return Ok(vec![0.0; r.len()]);
        }
        let b_avg = b_sum / n_total;
        let rho0 = n_total / volume;

        let max_msd = atoms.iter().map(|a| a.msd).fold(0.0, f64::max);
        let r_hi = r[r.len() - 1];
        let width_hi = (2.0 * max_msd * (1.0 + values.qbroad * values.qbroad * r_hi * r_hi))
            .sqrt()
            .max(MIN_SIGMA);
        let reach = r_hi + PEAK_CUTOFF * width_hi + 0.5;
        let spacings = lattice.plane_spacings();
        let n: Vec<i64> = spacings
            .iter()
            .map(|d| (reach / d).ceil() as i64 + 1)
            .collect();
        let vectors = lattice.matrix;

        let norm = 1.0 / (n_total * b_avg * b_avg);
        let delta2 = values.delta2;
        let qbroad2 = values.qbroad * values.qbroad;

        let rdf: Vec<f64> = self.pool.install(|| {
            atoms
                .par_iter()
                .map(|ai| {
                    let mut partial = vec![0.0; r.len()];
                    for aj in &atoms {
                        let pair_weight = ai.weight * aj.weight * norm;
                        let msd = ai.msd + aj.msd;
                        for n1 in -n[0]..=n[0] {
                            for n2 in -n[1]..=n[1] {
                                for n3 in -n[2]..=n[2] {
                                    let mut d2 = 0.0;
                                    for k in 0..3 {
                                        let t = n1 as f64 * vectors[0][k]
                                            + n2 as f64 * vectors[1][k]
                                            + n3 as f64 * vectors[2][k];
                                        let dk = aj.cart[k] + t - ai.cart[k];
                                        d2 += dk * dk;
                                    }
                                    if d2 < 1e-12 || d2 > reach * reach {
                                        continue;
                                    }
                                    let d = d2.sqrt();
                                    let corr = 1.0 - delta2 / d2 + qbroad2 * d2;
                                    let sigma = (msd * corr.max(0.0)).sqrt().max(MIN_SIGMA);
                                    add_gaussian(&mut partial, r, d, sigma, pair_weight);
                                }
                            }
                        }
                    }
                    partial
                })
                .reduce(
                    || vec![0.0; r.len()],
                    |mut acc, part| {
                        for (a, p) in acc.iter_mut().zip(part) {
                            *a += p;
                        }
                        acc
                    },
                )
        });

        let g = r
            .iter()
            .zip(rdf)
            .map(|(&x, rr)| {
                if x <= 0.0 {
                    return 0.0;
                }
                let damp = (-(values.qdamp * x).powi(2) / 2.0).exp();
                values.scale * damp * (rr / x - 4.0 * PI * rho0 * x)
            })
            .collect();
        Ok(g)
    }
}

/// 在网格上叠加一个归一化高斯峰
fn add_gaussian(out: &mut [f64], r: &[f64], center: f64, sigma: f64, weight: f64) {
    let lo = r.partition_point(|&x| x < center - PEAK_CUTOFF * sigma);
    let hi = r.partition_point(|&x| x <= center + PEAK_CUTOFF * sigma);
    let pre = weight / (sigma * (2.0 * PI).sqrt());
    for k in lo..hi {
        let t = (r[k] - center) / sigma;
        out[k] += pre * (-0.5 * t * t).exp();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Site, SymOp};

    fn nio() -> Crystal {
        let ops = ["x,y,z", "-x,-y,-z", "x,y+1/2,z+1/2", "x+1/2,y,z+1/2", "x+1/2,y+1/2,z"]
            .iter()
            .map(|s| SymOp::parse(s).unwrap())
            .collect();
        Crystal::new(
            "NiO",
            Lattice::from_parameters(4.1771, 4.1771, 4.1771, 90.0, 90.0, 90.0),
            vec![
                Site::new("Ni1", "Ni", [0.0, 0.0, 0.0]).with_biso(0.5),
                Site::new("O1", "O", [0.5, 0.5, 0.5]).with_biso(0.6),
            ],
        )
        .with_symops(ops)
    }

    fn grid(lo: f64, hi: f64, step: f64) -> Vec<f64> {
        let n = ((hi - lo) / step).round() as usize + 1;
        (0..n).map(|i| lo + i as f64 * step).collect()
    }

    #[test]
    fn test_layout_cubic_ties() {
        let gen = PairSumGenerator::new("NiO", nio(), 1).unwrap();
        let layout = gen.layout();
        assert!(layout.is_independent(GeneratorParam::Lattice(0)));
        assert!(!layout.is_independent(GeneratorParam::Lattice(1)));
        assert!(!layout.is_independent(GeneratorParam::Coord { site: 0, axis: 0 }));
        assert!(layout.is_independent(GeneratorParam::Scale));
    }

    #[test]
    fn test_apply_ties_propagates_cubic_lattice() {
        let gen = PairSumGenerator::new("NiO", nio(), 1).unwrap();
        let mut values = gen.defaults().clone();
        values.lattice[0] = 4.2;
        values.lattice[3] = 91.0;
        values.apply_ties(gen.layout(), gen.defaults());
        assert_eq!(values.lattice[1], 4.2);
        assert_eq!(values.lattice[2], 4.2);
        assert_eq!(values.lattice[3], 90.0);
    }

    #[test]
    fn test_nearest_neighbour_peak() {
        let gen = PairSumGenerator::new("NiO", nio(), 2).unwrap();
        let r = grid(1.0, 4.0, 0.01);
        let g = gen.generate(&r, gen.defaults()).unwrap();

        // 权重最大的 Ni-Ni 峰位于 a/√2
        let (imax, _) = g
            .iter()
            .enumerate()
            .fold((0, f64::MIN), |acc, (i, &v)| if v > acc.1 { (i, v) } else { acc });
        assert!((r[imax] - 4.1771 / 2f64.sqrt()).abs() < 0.02, "peak at {}", r[imax]);

        // 无原子对的低 r 区间只剩 −4πρ₀r 基线
        let rho0 = 8.0 / 4.1771f64.powi(3);
        assert!((g[0] + 4.0 * PI * rho0 * 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_scale_and_damping() {
        let gen = PairSumGenerator::new("NiO", nio(), 1).unwrap();
        let r = grid(1.5, 3.5, 0.05);
        let base = gen.generate(&r, gen.defaults()).unwrap();

        let mut values = gen.defaults().clone();
        values.scale = 0.5;
        values.qdamp = 0.1;
        let damped = gen.generate(&r, &values).unwrap();
        for ((x, b), d) in r.iter().zip(&base).zip(&damped) {
            let expected = 0.5 * b * (-(0.1 * x).powi(2) / 2.0).exp();
            assert!((d - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn test_worker_count_does_not_change_result() {
        let one = PairSumGenerator::new("NiO", nio(), 1).unwrap();
        let four = PairSumGenerator::new("NiO", nio(), 4).unwrap();
        let r = grid(1.0, 5.0, 0.05);
        let a = one.generate(&r, one.defaults()).unwrap();
        let b = four.generate(&r, four.defaults()).unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-9);
        }
    }

    #[test]
    fn test_unknown_element_rejected() {
        let crystal = Crystal::new(
            "bad",
            Lattice::from_parameters(3.0, 3.0, 3.0, 90.0, 90.0, 90.0),
            vec![Site::new("Q1", "Qq", [0.0, 0.0, 0.0])],
        );
        assert!(PairSumGenerator::new("bad", crystal, 1).is_err());
    }

    #[test]
    fn test_refined_crystal_uses_values() {
        let gen = PairSumGenerator::new("NiO", nio(), 1).unwrap();
        let mut values = gen.defaults().clone();
        values.lattice = [4.2, 4.2, 4.2, 90.0, 90.0, 90.0];
        values.biso[1] = 0.9;
        let crystal = gen.refined_crystal(&values);
        assert!((crystal.lattice.parameters()[0] - 4.2).abs() < 1e-9);
        assert_eq!(crystal.sites[1].biso, 0.9);
    }
}
