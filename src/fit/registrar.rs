//! # 参数注册
//!
//! 遍历每个相的生成器，将比例因子、δ₂、独立晶格参数、位移参数、独立坐标与占有率
//! 注册为精修变量。所有变量初始为固定状态，并带有分类标签：
//! `<类别>`、`<相>`、`<相>_<类别>`；占有率另带 `occ_<元素>`。
//!
//! 被空间群对称性固定的坐标在注册时跳过并记录日志。
//!
//! ## 依赖关系
//! - 被 `fit/mod.rs` 调用
//! - 使用 `fit/recipe.rs`、`fit/registry.rs`

use crate::config::Metadata;
use crate::error::{EzfitError, Result};
use crate::fit::recipe::{GeneratorHandle, Recipe};
use crate::models::structure::LATTICE_PARAMETER_NAMES;
use crate::pdf::generator::AXES;
use crate::pdf::GeneratorParam;

/// 形状函数参数的标签
pub const CUSTOM_FUNCTION_TAG: &str = "cfs";

/// 形状函数参数初值
pub const CUSTOM_FUNCTION_INITIAL: f64 = 10.0;

/// 自动注册的仪器参数初值
pub const DEFAULT_QDAMP: f64 = 1.07e-2;
pub const DEFAULT_QBROAD: f64 = 1.59e-2;

/// 参数的标准标签集合
pub fn tags(phase: &str, class: &str) -> Vec<String> {
    vec![class.to_string(), phase.to_string(), format!("{}_{}", phase, class)]
}

/// 变量名 `<相>_<部分>...`
pub fn var_name(parts: &[&str]) -> String {
    parts.join("_")
}

/// 将含数字位点序号的名称改写为位点标签，如 `x_0` → `Ni1_x`
pub fn rename_indexed(name: &str, labels: &[String]) -> String {
    let mut parts: Vec<String> = name.split('_').map(String::from).collect();
    if parts.len() > 1 {
        if let Ok(i) = parts[1].parse::<usize>() {
            if i < labels.len() {
                parts[1] = labels[i].clone();
                parts.reverse();
            }
        }
    }
    parts.join("_")
}

/// 注册形状函数参数，标签为 (函数键, `cfs`, 相)
pub fn register_custom_parameters(recipe: &mut Recipe) -> Result<()> {
    let functions: Vec<(String, Vec<String>, String)> = recipe
        .contribution
        .functions()
        .iter()
        .map(|(key, f)| (key.clone(), f.argnames[1..].to_vec(), f.phase.clone()))
        .collect();

    for (key, argnames, phase) in functions {
        for name in argnames {
            recipe.registry.add(
                &name,
                CUSTOM_FUNCTION_INITIAL,
                [key.clone(), CUSTOM_FUNCTION_TAG.to_string(), phase.clone()],
            )?;
        }
    }
    Ok(())
}

/// 注册单个相的结构参数
pub fn register_phase(recipe: &mut Recipe, handle: GeneratorHandle) -> Result<()> {
    let phase = recipe.phase(handle).id.clone();
    let crystal = recipe.generator(handle).crystal().clone();
    let labels: Vec<String> = crystal.sites.iter().map(|s| s.label.clone()).collect();

    let add_bounded = |recipe: &mut Recipe, param: GeneratorParam, name: String, tags: Vec<String>| -> Result<()> {
        recipe.add_var(handle, param, &name, tags)?;
        recipe.registry.bound_range(&name, 0.0, f64::INFINITY)
    };

    add_bounded(recipe, GeneratorParam::Scale, var_name(&[&phase, "scale"]), tags(&phase, "scale"))?;
    add_bounded(recipe, GeneratorParam::Delta2, var_name(&[&phase, "delta2"]), tags(&phase, "delta2"))?;

    for (k, lat) in LATTICE_PARAMETER_NAMES.iter().enumerate() {
        let param = GeneratorParam::Lattice(k);
        if recipe.generator(handle).layout().is_independent(param) {
            add_bounded(recipe, param, var_name(&[&phase, lat]), tags(&phase, "lat"))?;
        }
    }

    for (i, site) in crystal.sites.iter().enumerate() {
        add_bounded(
            recipe,
            GeneratorParam::Biso(i),
            var_name(&[&phase, &site.label, "Biso"]),
            tags(&phase, "adp"),
        )?;
    }

    for site in 0..crystal.sites.len() {
        for axis in 0..AXES.len() {
            let param = GeneratorParam::Coord { site, axis };
            let name = var_name(&[&phase, &rename_indexed(&param.local_name(), &labels)]);
            match recipe.add_var(handle, param, &name, tags(&phase, "xyz")) {
                Ok(()) => {}
                Err(EzfitError::ConstraintConflict { name, reason }) => {
                    tracing::info!(phase = %phase, param = %name, %reason, "{} is constrained", name);
                }
                Err(e) => return Err(e),
            }
        }
    }

    for (i, site) in crystal.sites.iter().enumerate() {
        let mut occ_tags = tags(&phase, "occ");
        occ_tags.push(format!("occ_{}", site.element));
        add_bounded(
            recipe,
            GeneratorParam::Occ(i),
            var_name(&[&phase, &site.label, "occ"]),
            occ_tags,
        )?;
    }

    Ok(())
}

/// 按仪器元数据设置阻尼参数；元数据为空且只有一个相时将其注册为精修变量
///
/// 返回新注册的参数名，调用方将其追加到最后一个精修阶段。
pub fn register_instrument(recipe: &mut Recipe, metadata: &Metadata) -> Result<Vec<String>> {
    let phases: Vec<String> = recipe.phases().iter().map(|p| p.id.clone()).collect();

    if !metadata.is_empty() {
        for phase in &phases {
            if let Some(handle) = recipe.handle(phase) {
                let defaults = recipe.generator_mut(handle).defaults_mut();
                defaults.qdamp = metadata.qdamp.unwrap_or(0.0);
                defaults.qbroad = metadata.qbroad.unwrap_or(0.0);
            }
        }
        return Ok(Vec::new());
    }

    if phases.len() != 1 {
        tracing::warn!(
            phases = phases.len(),
            "no instrument metadata for a multi-phase fit, qdamp and qbroad stay at zero"
        );
        return Ok(Vec::new());
    }

    let phase = &phases[0];
    tracing::info!(phase = %phase, "no instrument metadata found, refining qdamp and qbroad");
    let handle = recipe
        .handle(phase)
        .ok_or_else(|| EzfitError::UnknownParameter(phase.clone()))?;

    let mut names = Vec::new();
    for (param, initial) in [
        (GeneratorParam::Qdamp, DEFAULT_QDAMP),
        (GeneratorParam::Qbroad, DEFAULT_QBROAD),
    ] {
        let class = param.local_name();
        let name = var_name(&[phase, &class]);
        recipe.add_var(handle, param, &name, tags(phase, &class))?;
        recipe.registry.set_value(&name, initial)?;
        recipe.registry.bound_range(&name, 0.0, f64::INFINITY)?;
        names.push(name);
    }
    Ok(names)
}

/// 注册全部参数，返回自动注册的仪器参数名
pub fn register_all(recipe: &mut Recipe, metadata: &Metadata) -> Result<Vec<String>> {
    register_custom_parameters(recipe)?;
    let handles: Vec<GeneratorHandle> = recipe
        .phases()
        .iter()
        .filter_map(|p| recipe.handle(&p.id))
        .collect();
    for handle in handles {
        register_phase(recipe, handle)?;
    }
    let instrument = register_instrument(recipe, metadata)?;
    recipe.registry.fix_all();
    tracing::info!(parameters = recipe.registry.len(), "parameters registered");
    Ok(instrument)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fit::assembly::{assemble, PhaseSpec};
    use crate::fit::recipe::build_recipe;
    use crate::fit::recipe::tests::{flat_profile, nio_crystal};
    use crate::models::{Crystal, Lattice, Site, SymOp};
    use std::collections::BTreeMap;

    fn hexagonal() -> Crystal {
        let ops = ["x,y,z", "-y,x-y,z", "-x+y,-x,z", "-x,-y,-z", "y,-x+y,-z", "x-y,x,-z"]
            .iter()
            .map(|s| SymOp::parse(s).unwrap())
            .collect();
        Crystal::new(
            "Al2O3",
            Lattice::from_parameters(4.759, 4.759, 12.99, 90.0, 90.0, 120.0),
            vec![
                Site::new("Al1", "Al", [0.0, 0.0, 0.352]),
                Site::new("O1", "O", [0.306, 0.0, 0.25]),
            ],
        )
        .with_symops(ops)
    }

    fn recipe_for(specs: &[PhaseSpec], crystals: Vec<(&str, Crystal)>) -> Recipe {
        let model = assemble(specs).unwrap();
        let mut map = BTreeMap::new();
        for phase in &model.phases {
            let crystal = crystals
                .iter()
                .find(|(id, _)| *id == phase.source)
                .map(|(_, c)| c.clone())
                .unwrap();
            map.insert(phase.id.clone(), crystal);
        }
        build_recipe(&model.phases, &map, &model.equation, &model.functions, flat_profile(), 1)
            .unwrap()
            .0
    }

    #[test]
    fn test_rename_indexed() {
        let labels = vec!["Ni1".to_string(), "O1".to_string()];
        assert_eq!(rename_indexed("x_0", &labels), "Ni1_x");
        assert_eq!(rename_indexed("z_1", &labels), "O1_z");
        assert_eq!(rename_indexed("z_7", &labels), "z_7");
        assert_eq!(rename_indexed("scale", &labels), "scale");
    }

    #[test]
    fn test_nio_registration() {
        let mut recipe = recipe_for(
            &[PhaseSpec::new("NiO", "sphericalCF", "NiO")],
            vec![("NiO", nio_crystal())],
        );
        let instrument = register_all(&mut recipe, &Metadata::default()).unwrap();
        let reg = &recipe.registry;

        assert_eq!(instrument, vec!["NiO_qdamp", "NiO_qbroad"]);
        for name in [
            "NiO_psize",
            "NiO_scale",
            "NiO_delta2",
            "NiO_a",
            "NiO_Ni1_Biso",
            "NiO_O1_Biso",
            "NiO_Ni1_occ",
            "NiO_O1_occ",
            "NiO_qdamp",
            "NiO_qbroad",
        ] {
            assert!(reg.contains(name), "missing {}", name);
        }
        // 立方晶系只有 a 独立，特殊位置无自由坐标
        assert!(!reg.contains("NiO_b"));
        assert!(reg.members("xyz").is_empty());

        assert!(reg.free_names().is_empty());
        assert_eq!(reg.get("NiO_psize").unwrap().value, CUSTOM_FUNCTION_INITIAL);
        assert_eq!(reg.get("NiO_scale").unwrap().lower, 0.0);
        assert_eq!(reg.members("occ_Ni"), vec!["NiO_Ni1_occ"]);
        assert_eq!(reg.members("NiO_qdamp"), vec!["NiO_qdamp"]);
        assert_eq!(reg.expand("qdamp").unwrap(), vec!["NiO_qdamp"]);
        assert_eq!(reg.expand("qbroad").unwrap(), vec!["NiO_qbroad"]);
        assert!(reg.members("NiO").contains(&"NiO_qbroad".to_string()));
        assert_eq!(reg.members("cfs"), vec!["NiO_psize"]);
        assert!(reg.get("NiO_psize").unwrap().tags.contains("NiOsphericalCF"));
    }

    #[test]
    fn test_constrained_coordinates_are_skipped() {
        let mut recipe = recipe_for(
            &[PhaseSpec::new("Al2O3", "bulkCF", "Al2O3")],
            vec![("Al2O3", hexagonal())],
        );
        register_all(&mut recipe, &Metadata::default()).unwrap();
        let reg = &recipe.registry;

        // Al 位于三重轴: 只有 z 独立
        assert!(reg.contains("Al2O3_Al1_z"));
        assert!(!reg.contains("Al2O3_Al1_x"));
        assert!(!reg.contains("Al2O3_Al1_y"));
        assert!(reg.contains("Al2O3_O1_x"));
        assert!(reg.contains("Al2O3_a"));
        assert!(reg.contains("Al2O3_c"));
        assert!(!reg.contains("Al2O3_b"));
        assert!(!reg.contains("Al2O3_gamma"));
    }

    #[test]
    fn test_metadata_sets_generator_defaults() {
        let mut recipe = recipe_for(
            &[PhaseSpec::new("NiO", "bulkCF", "NiO")],
            vec![("NiO", nio_crystal())],
        );
        let metadata = Metadata {
            qdamp: Some(0.02),
            qbroad: Some(0.01),
        };
        let instrument = register_all(&mut recipe, &metadata).unwrap();
        assert!(instrument.is_empty());
        assert!(!recipe.registry.contains("NiO_qdamp"));

        let h = recipe.handle("NiO").unwrap();
        let values = recipe.phase_values(h).unwrap();
        assert_eq!(values.qdamp, 0.02);
        assert_eq!(values.qbroad, 0.01);
    }

    #[test]
    fn test_two_phases_unique_names() {
        let mut recipe = recipe_for(
            &[
                PhaseSpec::new("NiO", "sphericalCF", "NiO"),
                PhaseSpec::new("NiO", "bulkCF", "NiO"),
            ],
            vec![("NiO", nio_crystal())],
        );
        let instrument = register_all(&mut recipe, &Metadata::default()).unwrap();
        assert!(instrument.is_empty());

        let names = recipe.registry.names();
        let unique: std::collections::BTreeSet<_> = names.iter().collect();
        assert_eq!(unique.len(), names.len());
        assert!(names.contains(&"NiO1_scale".to_string()));
        assert_eq!(recipe.registry.members("NiO1").len(), 7);
    }
}
