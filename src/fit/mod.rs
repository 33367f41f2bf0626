//! # 分阶段多相精修
//!
//! 精修流水线，每一步消费上一步的输出：
//!
//! ```text
//! FitPdf::new ── build_model ──▶ ModelStage ── apply_restraints ──▶ ConstrainedStage
//!                                                                        │ run_fit
//!                                                                        ▼
//!                                                                   FitOutcome
//! ```
//!
//! - `new`: 组装模型并检查数据文件、结构文件与 X 射线能量（建模前失败）
//! - `build_model`: 读取结构与数据，构建配方并注册参数
//! - `apply_restraints`: 占有率之和约束与软约束表
//! - `run_fit`: 分阶段精修，随后换算相分数
//!
//! ## 子模块
//! - `assembly`: 相命名与模型方程
//! - `recipe`: 配方与模型计算
//! - `registry`: 参数注册表
//! - `registrar`: 参数注册
//! - `constraints`: 约束引擎
//! - `solver`: 有界最小二乘
//! - `optimizer`: 分阶段优化器
//! - `scale`: 比例因子换算
//! - `results`: 结果与输出文件
//! - `plot`: 拟合图
//!
//! ## 依赖关系
//! - 被 `commands/` 调用
//! - 使用 `config.rs`、`parsers/`、`pdf/`

pub mod assembly;
pub mod constraints;
pub mod optimizer;
pub mod plot;
pub mod recipe;
pub mod registrar;
pub mod registry;
pub mod results;
pub mod scale;
pub mod solver;

pub use assembly::{assemble, ModelAssembly, Phase, PhaseSpec};
pub use constraints::{ConstraintEngine, SiteClass};
pub use optimizer::{OptimizerState, Refinable, StageReport, StagedOptimizer};
pub use recipe::Recipe;
pub use registry::ParameterRegistry;
pub use results::FitResult;
pub use scale::{PhaseScale, ScaleInput, ScaleResolver};

use crate::config::FitConfig;
use crate::error::{EzfitError, Result};
use crate::fit::recipe::{build_recipe, cif_path, load_crystals};
use crate::fit::results::{with_suffix, write_structures};
use crate::fit::solver::SolverOptions;
use crate::models::Crystal;
use crate::parsers::gr::parse_gr_file;
use crate::pdf::scattering::find_f1_file;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// 精修会话的入口
#[derive(Debug, Clone)]
pub struct FitPdf {
    config: FitConfig,
    data: PathBuf,
    model: ModelAssembly,
    kev: f64,
}

impl FitPdf {
    /// 读取配置文件后创建会话；`data` 为空时使用配置中的数据文件
    pub fn new(data: Option<&Path>, specs: &[PhaseSpec], config_location: Option<&Path>) -> Result<Self> {
        let config = FitConfig::load(config_location)?;
        Self::with_config(data, specs, config)
    }

    /// 以已解析的配置创建会话
    pub fn with_config(data: Option<&Path>, specs: &[PhaseSpec], config: FitConfig) -> Result<Self> {
        let data = match data {
            Some(p) => p.to_path_buf(),
            None => config
                .data_file()
                .ok_or_else(|| EzfitError::config("files.data", "no data file given"))?,
        };
        if !data.is_file() {
            return Err(EzfitError::InputNotFound {
                path: data.display().to_string(),
            });
        }

        let model = assemble(specs)?;
        let cif_dir = config.cif_dir();
        for phase in &model.phases {
            let path = cif_path(&cif_dir, phase);
            if !path.is_file() {
                return Err(EzfitError::InputNotFound {
                    path: path.display().to_string(),
                });
            }
        }

        let kev = config
            .measurement
            .kev
            .ok_or_else(|| EzfitError::config("measurement.kev", "X-ray energy is required"))?;

        tracing::info!(
            data = %data.display(),
            phases = model.phases.len(),
            "fit session created"
        );
        Ok(FitPdf {
            config,
            data,
            model,
            kev,
        })
    }

    pub fn config(&self) -> &FitConfig {
        &self.config
    }

    pub fn phases(&self) -> &[Phase] {
        &self.model.phases
    }

    pub fn equation(&self) -> &str {
        &self.model.equation
    }

    /// 读取结构与数据，构建配方并注册参数
    pub fn build_model(self) -> Result<ModelStage> {
        let crystals = load_crystals(&self.model.phases, &self.config.cif_dir())?;

        // f1 表缺失在精修前报告
        let f1_dir = self.config.f1_dir();
        for phase in &self.model.phases {
            if let Some(crystal) = crystals.get(&phase.id) {
                let elements: BTreeSet<&str> = crystal.sites.iter().map(|s| s.element.as_str()).collect();
                for element in elements {
                    if find_f1_file(&f1_dir, element).is_none() {
                        return Err(EzfitError::scale(
                            &phase.id,
                            format!("no f1 table for {} in {}", element, f1_dir.display()),
                        ));
                    }
                }
            }
        }

        let profile = parse_gr_file(&self.data)?;
        let (mut recipe, _handles) = build_recipe(
            &self.model.phases,
            &crystals,
            &self.model.equation,
            &self.model.functions,
            profile,
            self.config.solver.workers,
        )?;
        let instrument = registrar::register_all(&mut recipe, &self.config.metadata)?;

        Ok(ModelStage {
            session: self,
            recipe,
            instrument,
        })
    }
}

/// 已注册参数的模型
#[derive(Debug)]
pub struct ModelStage {
    session: FitPdf,
    recipe: Recipe,
    /// 自动注册的 qdamp/qbroad
    instrument: Vec<String>,
}

impl ModelStage {
    pub fn recipe(&self) -> &Recipe {
        &self.recipe
    }

    pub fn instrument_parameters(&self) -> &[String] {
        &self.instrument
    }

    /// 令相中以 `prefix` 开头的位点共享某类参数
    pub fn constrain_shared(&mut self, phase: &str, prefix: &str, class: SiteClass) -> Result<Vec<String>> {
        let handle = self
            .recipe
            .handle(phase)
            .ok_or_else(|| EzfitError::UnknownParameter(phase.to_string()))?;
        let crystal = self.recipe.generator(handle).crystal().clone();
        ConstraintEngine::new(&mut self.recipe.registry).shared_param(phase, &crystal, prefix, class)
    }

    /// 占有率之和约束与配置中的软约束
    pub fn apply_restraints(mut self) -> Result<ConstrainedStage> {
        let phases: Vec<(String, Crystal)> = self
            .recipe
            .phases()
            .iter()
            .filter_map(|p| {
                self.recipe
                    .handle(&p.id)
                    .map(|h| (p.id.clone(), self.recipe.generator(h).crystal().clone()))
            })
            .collect();

        let mut engine = ConstraintEngine::new(&mut self.recipe.registry);
        for (phase, crystal) in &phases {
            engine.occupancy_sums(phase, crystal)?;
        }
        engine.apply_restraints(&self.session.config.restraints)?;

        Ok(ConstrainedStage {
            session: self.session,
            recipe: self.recipe,
            instrument: self.instrument,
        })
    }
}

/// 已施加约束、等待精修的模型
#[derive(Debug)]
pub struct ConstrainedStage {
    session: FitPdf,
    recipe: Recipe,
    instrument: Vec<String>,
}

impl ConstrainedStage {
    pub fn recipe(&self) -> &Recipe {
        &self.recipe
    }

    /// 分阶段精修并换算相分数
    pub fn run_fit(mut self) -> Result<FitOutcome> {
        let config = &self.session.config;
        let options = SolverOptions {
            ftol: config.solver.ftol,
            max_nfev: config.solver.max_nfev,
        };
        let mut optimizer = StagedOptimizer::new(config.param_order.clone(), config.range.clone(), options)
            .verbose(config.verbose.step);
        optimizer.append_to_last_stage(&self.instrument);
        let stages = optimizer.run(&mut self.recipe)?;

        let fitted = self
            .session
            .model
            .phases
            .iter()
            .map(|p| Ok((p.id.clone(), self.recipe.registry.value(&format!("{}_scale", p.id))?)))
            .collect::<Result<Vec<(String, f64)>>>()?;
        let scales = resolve_scales(config, &self.session.model.phases, &fitted, self.session.kev)?;

        let result = FitResult::from_recipe(&self.recipe, stages, scales)?;
        if config.verbose.results {
            result.print_tables();
        }
        Ok(FitOutcome {
            session: self.session,
            recipe: self.recipe,
            result,
        })
    }
}

/// 精修完成后的模型与结果
#[derive(Debug)]
pub struct FitOutcome {
    session: FitPdf,
    recipe: Recipe,
    pub result: FitResult,
}

impl FitOutcome {
    pub fn recipe(&self) -> &Recipe {
        &self.recipe
    }

    pub fn phases(&self) -> &[Phase] {
        self.session.phases()
    }

    /// 相标识 → 摩尔分数
    pub fn molar_fractions(&self) -> Vec<(String, f64)> {
        self.result
            .scales
            .iter()
            .map(|p| (p.phase.clone(), p.molar_fraction))
            .collect()
    }

    /// 相标识 → 质量分数
    pub fn weight_fractions(&self) -> Vec<(String, f64)> {
        self.result
            .scales
            .iter()
            .map(|p| (p.phase.clone(), p.weight_fraction))
            .collect()
    }

    /// 写出 `.res`、`.fgr`，可选写出各相 CIF；返回写出的文件
    pub fn save_results(&self, stem: &Path, footer: &str, structures: bool) -> Result<Vec<PathBuf>> {
        let res = with_suffix(stem, ".res");
        self.result.write_res(&res, footer)?;
        let fgr = with_suffix(stem, ".fgr");
        self.result.write_fgr(&fgr)?;

        let mut written = vec![res, fgr];
        if structures {
            written.extend(write_structures(&self.recipe, stem)?);
        }
        for path in &written {
            tracing::debug!(path = %path.display(), "result written");
        }
        Ok(written)
    }

    /// 绘制拟合图，标题为各相标识
    pub fn plot(&self, path: &Path, width: u32, height: u32) -> Result<()> {
        let title = self
            .phases()
            .iter()
            .map(|p| p.id.as_str())
            .collect::<Vec<_>>()
            .join(" + ");
        plot::plot_fit(&self.result, path, &title, width, height)
    }
}

/// 以拟合比例因子换算相分数，结构文件取自配置的 CIF 目录
pub fn resolve_scales(
    config: &FitConfig,
    phases: &[Phase],
    fitted: &[(String, f64)],
    kev: f64,
) -> Result<Vec<PhaseScale>> {
    let cif_dir = config.cif_dir();
    let mut inputs = Vec::with_capacity(phases.len());
    for phase in phases {
        let scale = fitted
            .iter()
            .find(|(id, _)| id == &phase.id)
            .map(|(_, s)| *s)
            .ok_or_else(|| EzfitError::scale(&phase.id, "no fitted scale for phase"))?;
        inputs.push(ScaleInput {
            phase: phase.id.clone(),
            scale,
            structure: cif_path(&cif_dir, phase),
            formula: phase.formula.clone(),
        });
    }
    ScaleResolver::new(config.f1_dir(), kev).resolve(&inputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fit::results::read_fgr;
    use crate::fit::scale::tests::{write_f1_tables, NIO_CIF};
    use crate::parsers::cif::parse_cif_content;
    use crate::pdf::{PairSumGenerator, ProfileGenerator};
    use std::fs;

    const AL2O3_CIF: &str = "data_Al2O3
_cell_length_a 4.759
_cell_length_b 4.759
_cell_length_c 12.99
_cell_angle_alpha 90
_cell_angle_beta 90
_cell_angle_gamma 120
_cell_volume 254.8
_chemical_formula_sum 'Al2 O6'
loop_
_symmetry_equiv_pos_as_xyz
'x, y, z'
'-y, x-y, z'
'-x+y, -x, z'
'-x, -y, -z'
'y, -x+y, -z'
'x-y, x, -z'
loop_
_atom_site_label
_atom_site_type_symbol
_atom_site_fract_x
_atom_site_fract_y
_atom_site_fract_z
_atom_site_occupancy
_atom_site_B_iso_or_equiv
Al1 Al 0 0 0.352 1 0.3
O1 O 0.306 0 0.25 1 0.4
";

    /// 由内置生成器合成的 G(r)
    fn synthetic_gr(cifs: &[(&str, &str, f64)]) -> String {
        let r: Vec<f64> = (0..=140).map(|i| 1.0 + i as f64 * 0.05).collect();
        let mut g = vec![0.0; r.len()];
        for (name, content, scale) in cifs {
            let crystal = parse_cif_content(content, name).unwrap();
            let generator = PairSumGenerator::new(*name, crystal, 1).unwrap();
            let mut values = generator.defaults().clone();
            values.scale = *scale;
            values.qdamp = 0.02;
            values.delta2 = 2.0;
            for (t, v) in g.iter_mut().zip(generator.generate(&r, &values).unwrap()) {
                *t += v;
            }
        }
        r.iter()
            .zip(&g)
            .map(|(x, y)| format!("{:.4} {:.8} 0.05\n", x, y))
            .collect()
    }

    fn workspace(cifs: &[(&str, &str, f64)], config: &str) -> (tempfile::TempDir, FitConfig) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("CIFS")).unwrap();
        fs::create_dir_all(root.join("rsc")).unwrap();
        for (name, content, _) in cifs {
            fs::write(root.join("CIFS").join(format!("{}.cif", name)), content).unwrap();
        }
        write_f1_tables(&root.join("rsc"), &[("Ni", 27.5), ("O", 8.0), ("Al", 13.0)]);
        fs::write(root.join("sample.gr"), synthetic_gr(cifs)).unwrap();

        let mut config = FitConfig::from_toml_str(config).unwrap();
        config.base_dir = root.to_path_buf();
        (dir, config)
    }

    const SINGLE_PHASE_CONFIG: &str = r#"
[files]
data = "sample.gr"

[metadata]

[measurement]
kev = 60.0

[verbose]
step = false
results = false

[range]
rmin = 1.5
rmax = 6.0
rstep = 0.05

[solver]
max_nfev = 30
workers = 1

[[param_order]]
free = ["lat", "scale"]

[[param_order]]
free = ["adp", "delta2"]
"#;

    #[test]
    fn test_single_phase_bulk_fit() {
        let (dir, config) = workspace(&[("NiO", NIO_CIF, 0.8)], SINGLE_PHASE_CONFIG);
        let session = FitPdf::with_config(None, &[PhaseSpec::new("NiO", "bulkCF", "NiO")], config).unwrap();
        let model = session.build_model().unwrap();
        assert_eq!(model.instrument_parameters(), ["NiO_qdamp", "NiO_qbroad"]);

        let outcome = model.apply_restraints().unwrap().run_fit().unwrap();
        let registry = &outcome.recipe().registry;
        assert!(registry.contains("NiO_qdamp"));
        assert!(registry.contains("NiO_qbroad"));

        let last = outcome.result.stages.last().unwrap();
        assert!(last.free.contains(&"NiO_qdamp".to_string()));
        assert!(last.free.contains(&"NiO_qbroad".to_string()));

        let molar = outcome.molar_fractions();
        let weight = outcome.weight_fractions();
        assert_eq!(molar.len(), 1);
        assert!((molar[0].1 - 1.0).abs() < 1e-12);
        assert!((weight[0].1 - 1.0).abs() < 1e-12);
        assert!(outcome.result.goodness.rw.is_finite());

        // 计算区间只裁剪一次
        assert_eq!(outcome.result.r.len(), 91);

        // 输出目录尚不存在
        let stem = dir.path().join("results").join("NiO_fit");
        let written = outcome.save_results(&stem, "NiO test", true).unwrap();
        assert_eq!(written.len(), 3);
        let table = read_fgr(&with_suffix(&stem, ".fgr")).unwrap();
        assert_eq!(table.headers.last().map(String::as_str), Some("NiO"));
        let obs = table.column("g(r)").unwrap();
        let calc = table.column("g(r)_calc").unwrap();
        let diff = table.column("g(r)_diff").unwrap();
        for i in 0..obs.len() {
            assert_eq!(obs[i] - calc[i], diff[i]);
        }
        assert!(with_suffix(&stem, "_NiO.cif").is_file());
    }

    const TWO_PHASE_CONFIG: &str = r#"
[files]
data = "sample.gr"

[metadata]
qdamp = 0.02
qbroad = 0.0

[measurement]
keV = 60.0

[verbose]
step = false
results = false

[range]
rmin = 1.5
rmax = 5.5
rstep = 0.05

[solver]
max_nfev = 20
workers = 2

[[param_order]]
free = ["lat", "scale"]

[[param_order]]
free = ["cfs"]

[[param_order]]
free = ["adp", "delta2"]
"#;

    #[test]
    fn test_two_phase_three_stage_fit() {
        let (_dir, config) = workspace(
            &[("Al2O3", AL2O3_CIF, 0.4), ("NiO", NIO_CIF, 0.6)],
            TWO_PHASE_CONFIG,
        );
        let specs = [
            PhaseSpec::new("Al2O3", "sphericalCF", "Al2O3"),
            PhaseSpec::new("NiO", "bulkCF", "NiO"),
        ];
        let session = FitPdf::with_config(None, &specs, config).unwrap();
        let model = session.build_model().unwrap();
        assert!(model.instrument_parameters().is_empty());

        let outcome = model.apply_restraints().unwrap().run_fit().unwrap();
        assert_eq!(outcome.result.stages.len(), 3);
        assert_eq!(outcome.result.stages[1].free, vec!["Al2O3_psize"]);

        let names = outcome.recipe().registry.names();
        let unique: BTreeSet<&String> = names.iter().collect();
        assert_eq!(unique.len(), names.len());
        for name in &names {
            assert!(
                outcome.phases().iter().any(|p| name.contains(&p.id)),
                "{} has no phase id",
                name
            );
        }

        let molar: f64 = outcome.molar_fractions().iter().map(|(_, x)| x).sum();
        let weight: f64 = outcome.weight_fractions().iter().map(|(_, x)| x).sum();
        assert!((molar - 1.0).abs() < 1e-9);
        assert!((weight - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_duplicate_phase_shares_structure_file() {
        let (_dir, config) = workspace(&[("NiO", NIO_CIF, 1.0)], TWO_PHASE_CONFIG);
        let specs = [
            PhaseSpec::new("NiO", "sphericalCF", "NiO"),
            PhaseSpec::new("NiO", "bulkCF", "NiO"),
        ];
        let session = FitPdf::with_config(None, &specs, config).unwrap();
        let ids: Vec<&str> = session.phases().iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, ["NiO", "NiO1"]);
        assert_eq!(session.equation(), "NiO * NiOsphericalCF + NiO1 * NiO1bulkCF");

        let model = session.build_model().unwrap();
        assert!(model.recipe().registry.contains("NiO1_scale"));
    }

    #[test]
    fn test_missing_inputs_fail_before_modeling() {
        let (dir, config) = workspace(&[("NiO", NIO_CIF, 1.0)], SINGLE_PHASE_CONFIG);

        let err = FitPdf::with_config(None, &[PhaseSpec::new("CeO2", "bulkCF", "CeO2")], config.clone())
            .unwrap_err();
        assert!(matches!(err, EzfitError::InputNotFound { .. }));

        let missing = dir.path().join("nope.gr");
        let err = FitPdf::with_config(Some(&missing), &[PhaseSpec::new("NiO", "bulkCF", "NiO")], config.clone())
            .unwrap_err();
        assert!(matches!(err, EzfitError::InputNotFound { .. }));

        let err = FitPdf::with_config(None, &[PhaseSpec::new("NiO", "cubeCF", "NiO")], config).unwrap_err();
        assert!(matches!(err, EzfitError::Configuration { .. }));
    }

    #[test]
    fn test_missing_f1_table_fails_before_refinement() {
        let (dir, config) = workspace(&[("NiO", NIO_CIF, 1.0)], SINGLE_PHASE_CONFIG);
        fs::remove_file(dir.path().join("rsc").join("f1_Ni.csv")).unwrap();
        let session = FitPdf::with_config(None, &[PhaseSpec::new("NiO", "bulkCF", "NiO")], config).unwrap();
        let err = session.build_model().unwrap_err();
        assert!(matches!(err, EzfitError::ScaleComputation { .. }));
    }

    #[test]
    fn test_constrain_shared_unknown_phase() {
        let (_dir, config) = workspace(&[("NiO", NIO_CIF, 1.0)], SINGLE_PHASE_CONFIG);
        let session = FitPdf::with_config(None, &[PhaseSpec::new("NiO", "bulkCF", "NiO")], config).unwrap();
        let mut model = session.build_model().unwrap();
        assert!(model.constrain_shared("CeO2", "O", SiteClass::Biso).is_err());
        assert!(model
            .constrain_shared("NiO", "O", SiteClass::Biso)
            .unwrap()
            .is_empty());
    }
}
