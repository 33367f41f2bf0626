//! # 精修配方
//!
//! 将各相的晶体结构与生成器挂接到同一个拟合贡献 (`FitContribution`)，
//! 注册形状函数、设置模型方程并绑定实测数据。参数名与生成器参数之间的绑定只在此处建立。
//!
//! ## 依赖关系
//! - 被 `fit/registrar.rs`、`fit/optimizer.rs`、`fit/results.rs` 使用
//! - 使用 `fit/assembly.rs`、`fit/registry.rs`、`pdf/`

use crate::error::{EzfitError, Result};
use crate::fit::assembly::{parse_equation, FunctionEntry, Phase, Term};
use crate::fit::registry::ParameterRegistry;
use crate::models::{Crystal, Profile};
use crate::parsers::cif::parse_cif_file;
use crate::pdf::{GeneratorParam, PairSumGenerator, PhaseValues, ProfileGenerator};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// 拟合贡献的默认名称
pub const CONTRIBUTION_NAME: &str = "PDF";

/// 生成器句柄（在拟合贡献中的位置）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GeneratorHandle(usize);

/// 单相：生成器及其参数绑定
#[derive(Debug)]
struct PhaseModel {
    phase: Phase,
    generator: Box<dyn ProfileGenerator>,
    bindings: Vec<(GeneratorParam, String)>,
}

/// 拟合贡献：实测曲线、模型方程、形状函数与各相生成器
#[derive(Debug)]
pub struct FitContribution {
    pub name: String,
    pub profile: Profile,
    equation: String,
    terms: Vec<Term>,
    functions: BTreeMap<String, FunctionEntry>,
    phases: Vec<PhaseModel>,
}

impl FitContribution {
    pub fn new(name: impl Into<String>, profile: Profile) -> Self {
        FitContribution {
            name: name.into(),
            profile,
            equation: String::new(),
            terms: Vec::new(),
            functions: BTreeMap::new(),
            phases: Vec::new(),
        }
    }

    /// 挂接一个相的生成器
    pub fn add_profile_generator(&mut self, phase: Phase, generator: Box<dyn ProfileGenerator>) -> GeneratorHandle {
        self.phases.push(PhaseModel {
            phase,
            generator,
            bindings: Vec::new(),
        });
        GeneratorHandle(self.phases.len() - 1)
    }

    pub fn register_function(&mut self, key: impl Into<String>, entry: FunctionEntry) {
        self.functions.insert(key.into(), entry);
    }

    /// 设置模型方程；每一项的相与函数都必须已注册
    pub fn set_equation(&mut self, equation: &str) -> Result<()> {
        let terms = parse_equation(equation)?;
        for term in &terms {
            if !self.phases.iter().any(|p| p.phase.id == term.phase) {
                return Err(EzfitError::config(
                    "equation",
                    format!("no profile generator named '{}'", term.phase),
                ));
            }
            if !self.functions.contains_key(&term.function) {
                return Err(EzfitError::config(
                    "equation",
                    format!("function '{}' is not registered", term.function),
                ));
            }
        }
        self.equation = equation.to_string();
        self.terms = terms;
        Ok(())
    }

    pub fn equation(&self) -> &str {
        &self.equation
    }

    pub fn functions(&self) -> &BTreeMap<String, FunctionEntry> {
        &self.functions
    }
}

/// 精修配方：参数注册表与拟合贡献
#[derive(Debug)]
pub struct Recipe {
    pub registry: ParameterRegistry,
    pub contribution: FitContribution,
}

impl Recipe {
    pub fn new(contribution: FitContribution) -> Self {
        Recipe {
            registry: ParameterRegistry::new(),
            contribution,
        }
    }

    /// 全部相（方程顺序）
    pub fn phases(&self) -> Vec<&Phase> {
        self.contribution.phases.iter().map(|p| &p.phase).collect()
    }

    pub fn handle(&self, phase: &str) -> Option<GeneratorHandle> {
        self.contribution
            .phases
            .iter()
            .position(|p| p.phase.id == phase)
            .map(GeneratorHandle)
    }

    pub fn generator(&self, handle: GeneratorHandle) -> &dyn ProfileGenerator {
        self.contribution.phases[handle.0].generator.as_ref()
    }

    pub fn generator_mut(&mut self, handle: GeneratorHandle) -> &mut dyn ProfileGenerator {
        self.contribution.phases[handle.0].generator.as_mut()
    }

    pub fn phase(&self, handle: GeneratorHandle) -> &Phase {
        &self.contribution.phases[handle.0].phase
    }

    /// 将生成器参数注册为精修变量
    ///
    /// 被对称性约束的晶格参数或坐标、以及已绑定的参数返回 `ConstraintConflict`。
    pub fn add_var(
        &mut self,
        handle: GeneratorHandle,
        param: GeneratorParam,
        name: &str,
        tags: Vec<String>,
    ) -> Result<()> {
        let model = &self.contribution.phases[handle.0];
        if !model.generator.layout().is_independent(param) {
            return Err(EzfitError::ConstraintConflict {
                name: name.to_string(),
                reason: format!(
                    "{} of phase '{}' is fixed by symmetry",
                    param.local_name(),
                    model.phase.id
                ),
            });
        }
        if let Some((_, bound)) = model.bindings.iter().find(|(p, _)| *p == param) {
            return Err(EzfitError::ConstraintConflict {
                name: name.to_string(),
                reason: format!("{} is already bound to '{}'", param.local_name(), bound),
            });
        }

        let value = model.generator.defaults().get(param);
        self.registry.add(name, value, tags)?;
        self.contribution.phases[handle.0]
            .bindings
            .push((param, name.to_string()));
        Ok(())
    }

    /// 某相绑定的参数（生成器参数, 变量名）
    pub fn bindings(&self, handle: GeneratorHandle) -> &[(GeneratorParam, String)] {
        &self.contribution.phases[handle.0].bindings
    }

    /// 由注册表当前值求出某相的全部参数值
    pub fn phase_values(&self, handle: GeneratorHandle) -> Result<PhaseValues> {
        let model = &self.contribution.phases[handle.0];
        let defaults = model.generator.defaults();
        let mut values = defaults.clone();
        for (param, name) in &model.bindings {
            values.set(*param, self.registry.value(name)?);
        }
        values.apply_ties(model.generator.layout(), defaults);
        Ok(values)
    }

    fn shape_values(&self, function: &str, r: &[f64]) -> Result<Vec<f64>> {
        let entry = self.contribution.functions.get(function).ok_or_else(|| {
            EzfitError::config("equation", format!("function '{}' is not registered", function))
        })?;
        let args = entry.argnames[1..]
            .iter()
            .map(|name| self.registry.value(name))
            .collect::<Result<Vec<f64>>>()?;
        Ok(r.iter().map(|&x| entry.shape.evaluate(x, &args)).collect())
    }

    /// 各项贡献 (相标识, 曲线)，按方程顺序
    pub fn evaluate_components(&self) -> Result<Vec<(String, Vec<f64>)>> {
        let r = &self.contribution.profile.x;
        let mut out = Vec::with_capacity(self.contribution.terms.len());
        for term in &self.contribution.terms {
            let handle = self.handle(&term.phase).ok_or_else(|| {
                EzfitError::config("equation", format!("no profile generator named '{}'", term.phase))
            })?;
            let values = self.phase_values(handle)?;
            let g = self.generator(handle).generate(r, &values)?;
            let shape = self.shape_values(&term.function, r)?;
            let component = g.iter().zip(&shape).map(|(a, b)| a * b).collect();
            out.push((term.phase.clone(), component));
        }
        Ok(out)
    }

    /// 模型曲线
    pub fn evaluate(&self) -> Result<Vec<f64>> {
        let mut total = vec![0.0; self.contribution.profile.len()];
        for (_, component) in self.evaluate_components()? {
            for (t, c) in total.iter_mut().zip(component) {
                *t += c;
            }
        }
        Ok(total)
    }

    /// 加权残差 (Gobs − Gcalc)/dG，后接软约束残差
    pub fn residual(&self) -> Result<Vec<f64>> {
        let calc = self.evaluate()?;
        let p = &self.contribution.profile;
        let mut res: Vec<f64> = p
            .y
            .iter()
            .zip(&p.dy)
            .zip(&calc)
            .map(|((y, dy), c)| (y - c) / dy)
            .collect();
        res.extend(self.registry.penalties()?);
        Ok(res)
    }

    /// 以当前参数值重建各相结构
    pub fn refined_crystals(&self) -> Result<Vec<(String, Crystal)>> {
        let mut out = Vec::new();
        for (i, model) in self.contribution.phases.iter().enumerate() {
            let values = self.phase_values(GeneratorHandle(i))?;
            out.push((model.phase.id.clone(), model.generator.refined_crystal(&values)));
        }
        Ok(out)
    }
}

/// CIF 文件路径：`<cif_dir>/<原始标识>.cif`
pub fn cif_path(cif_dir: &Path, phase: &Phase) -> PathBuf {
    cif_dir.join(format!("{}.cif", phase.source))
}

/// 读取所有相的结构文件；缺失时返回 `InputNotFound`
pub fn load_crystals(phases: &[Phase], cif_dir: &Path) -> Result<BTreeMap<String, Crystal>> {
    let mut crystals = BTreeMap::new();
    for phase in phases {
        let path = cif_path(cif_dir, phase);
        if !path.is_file() {
            return Err(EzfitError::InputNotFound {
                path: path.display().to_string(),
            });
        }
        crystals.insert(phase.id.clone(), parse_cif_file(&path)?);
    }
    Ok(crystals)
}

/// 构建配方：每相一个生成器，注册形状函数，设置方程并绑定实测数据
pub fn build_recipe(
    phases: &[Phase],
    crystals: &BTreeMap<String, Crystal>,
    equation: &str,
    functions: &BTreeMap<String, FunctionEntry>,
    profile: Profile,
    workers: usize,
) -> Result<(Recipe, BTreeMap<String, GeneratorHandle>)> {
    let mut contribution = FitContribution::new(CONTRIBUTION_NAME, profile);
    let mut handles = BTreeMap::new();

    for phase in phases {
        let crystal = crystals.get(&phase.id).ok_or_else(|| EzfitError::InputNotFound {
            path: format!("structure for phase '{}'", phase.id),
        })?;
        let generator = PairSumGenerator::new(phase.id.clone(), crystal.clone(), workers)?;
        let handle = contribution.add_profile_generator(phase.clone(), Box::new(generator));
        handles.insert(phase.id.clone(), handle);
    }

    for (key, entry) in functions {
        contribution.register_function(key.clone(), entry.clone());
    }
    contribution.set_equation(equation)?;
    tracing::info!(
        phases = phases.len(),
        points = contribution.profile.len(),
        "recipe assembled"
    );

    Ok((Recipe::new(contribution), handles))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::fit::assembly::{assemble, PhaseSpec};
    use crate::models::{Lattice, Site, SymOp};

    pub(crate) fn nio_crystal() -> Crystal {
        let ops = [
            "x,y,z",
            "-x,-y,-z",
            "z,x,y",
            "y,x,z",
            "-x,y,z",
            "x,y+1/2,z+1/2",
            "x+1/2,y,z+1/2",
            "x+1/2,y+1/2,z",
        ]
        .iter()
        .map(|s| SymOp::parse(s).unwrap())
        .collect();
        let mut crystal = Crystal::new(
            "NiO",
            Lattice::from_parameters(4.1771, 4.1771, 4.1771, 90.0, 90.0, 90.0),
            vec![
                Site::new("Ni1", "Ni", [0.0, 0.0, 0.0]).with_biso(0.5),
                Site::new("O1", "O", [0.5, 0.5, 0.5]).with_biso(0.6),
            ],
        )
        .with_symops(ops);
        crystal.cell_volume = Some(4.1771f64.powi(3));
        crystal.formula = Some("Ni4 O4".to_string());
        crystal
    }

    pub(crate) fn flat_profile() -> Profile {
        let r: Vec<f64> = (0..=200).map(|i| i as f64 * 0.05).collect();
        let n = r.len();
        Profile::new(r, vec![0.0; n], vec![1.0; n]).unwrap()
    }

    fn nio_recipe(shape: &str) -> Recipe {
        let model = assemble(&[PhaseSpec::new("NiO", shape, "NiO")]).unwrap();
        let mut crystals = BTreeMap::new();
        crystals.insert("NiO".to_string(), nio_crystal());
        let (recipe, handles) = build_recipe(
            &model.phases,
            &crystals,
            &model.equation,
            &model.functions,
            flat_profile(),
            1,
        )
        .unwrap();
        assert_eq!(handles["NiO"], recipe.handle("NiO").unwrap());
        recipe
    }

    #[test]
    fn test_add_var_rejects_symmetry_fixed() {
        let mut recipe = nio_recipe("bulkCF");
        let h = recipe.handle("NiO").unwrap();
        recipe
            .add_var(h, GeneratorParam::Lattice(0), "NiO_a", vec!["lat".into()])
            .unwrap();
        let err = recipe
            .add_var(h, GeneratorParam::Lattice(1), "NiO_b", vec!["lat".into()])
            .unwrap_err();
        assert!(matches!(err, EzfitError::ConstraintConflict { .. }));
        let err = recipe
            .add_var(h, GeneratorParam::Coord { site: 0, axis: 0 }, "NiO_Ni1_x", vec![])
            .unwrap_err();
        assert!(matches!(err, EzfitError::ConstraintConflict { .. }));
        // 同一参数不能绑定两次
        assert!(recipe
            .add_var(h, GeneratorParam::Lattice(0), "NiO_a2", vec![])
            .is_err());
    }

    #[test]
    fn test_bound_lattice_flows_into_values() {
        let mut recipe = nio_recipe("bulkCF");
        let h = recipe.handle("NiO").unwrap();
        recipe
            .add_var(h, GeneratorParam::Lattice(0), "NiO_a", vec!["lat".into()])
            .unwrap();
        recipe.registry.set_value("NiO_a", 4.3).unwrap();
        let values = recipe.phase_values(h).unwrap();
        assert_eq!(values.lattice[..3], [4.3, 4.3, 4.3]);
    }

    #[test]
    fn test_shape_function_multiplies_phase() {
        let mut bulk = nio_recipe("bulkCF");
        bulk.contribution.profile.set_calculation_range(1.0, 6.0, 0.05).unwrap();
        let base = bulk.evaluate().unwrap();

        let mut sphere = nio_recipe("sphericalCF");
        sphere.contribution.profile.set_calculation_range(1.0, 6.0, 0.05).unwrap();
        sphere.registry.add("NiO_psize", 20.0, ["cfs"]).unwrap();
        let damped = sphere.evaluate().unwrap();

        let r = &sphere.contribution.profile.x;
        for k in 0..r.len() {
            let expected = base[k] * crate::pdf::shape::spherical(r[k], 20.0);
            assert!((damped[k] - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn test_missing_shape_parameter_is_error() {
        let recipe = nio_recipe("sphericalCF");
        assert!(matches!(recipe.evaluate(), Err(EzfitError::UnknownParameter(_))));
    }

    #[test]
    fn test_load_crystals_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let model = assemble(&[PhaseSpec::new("NiO", "bulkCF", "NiO")]).unwrap();
        let err = load_crystals(&model.phases, dir.path()).unwrap_err();
        assert!(matches!(err, EzfitError::InputNotFound { .. }));
    }

    #[test]
    fn test_set_equation_validates_terms() {
        let mut contribution = FitContribution::new(CONTRIBUTION_NAME, flat_profile());
        assert!(contribution.set_equation("X * XbulkCF").is_err());
    }
}
