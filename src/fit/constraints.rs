//! # 约束引擎
//!
//! 作用于共享参数注册表的三类操作：
//! - 共享参数：同一相中标签以某元素前缀开头的位点共用一个位移参数或占有率
//! - 占有率之和：坐标相同的位点组引入派生参数 `Σ occ`，软约束到 [0, 1]
//! - 软约束：按配置的参数类别解析区间并施加到每个成员
//!
//! ## 依赖关系
//! - 被 `fit/mod.rs` 调用
//! - 使用 `fit/registry.rs`、`config.rs`、`models/structure.rs`

use crate::config::RestraintSpec;
use crate::error::{EzfitError, Result};
use crate::fit::registrar::{tags, var_name};
use crate::fit::registry::ParameterRegistry;
use crate::models::structure::position_key;
use crate::models::Crystal;
use std::collections::BTreeMap;
use std::fmt;

/// 软约束紧度
pub const RESTRAINT_SIG: f64 = 1e-3;

/// 占有率之和的标签
pub const OCCSUM_TAG: &str = "occsum";

/// 可在位点之间共享的参数类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteClass {
    Biso,
    Occ,
}

impl SiteClass {
    pub fn suffix(&self) -> &'static str {
        match self {
            SiteClass::Biso => "Biso",
            SiteClass::Occ => "occ",
        }
    }
}

impl fmt::Display for SiteClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.suffix())
    }
}

/// 约束引擎
pub struct ConstraintEngine<'a> {
    registry: &'a mut ParameterRegistry,
}

impl<'a> ConstraintEngine<'a> {
    pub fn new(registry: &'a mut ParameterRegistry) -> Self {
        ConstraintEngine { registry }
    }

    /// 令相中标签以 `prefix` 开头的位点共用第一个位点的参数
    ///
    /// 返回被约束的参数名；少于两个匹配时不做任何事。
    pub fn shared_param(
        &mut self,
        phase: &str,
        crystal: &Crystal,
        prefix: &str,
        class: SiteClass,
    ) -> Result<Vec<String>> {
        let names: Vec<String> = crystal
            .sites
            .iter()
            .filter(|s| s.label.starts_with(prefix))
            .map(|s| var_name(&[phase, &s.label, class.suffix()]))
            .filter(|n| self.registry.contains(n))
            .collect();

        let Some((first, rest)) = names.split_first() else {
            return Ok(Vec::new());
        };
        for name in rest {
            self.registry.constrain(name, vec![(first.clone(), 1.0)])?;
            tracing::debug!(phase, param = %name, source = %first, "shared {}", class);
        }
        Ok(rest.to_vec())
    }

    /// 为坐标相同的位点组引入占有率之和并约束到 [0, 1]
    ///
    /// 派生参数名为 `<相>_occsum_<排序后的标签>`。
    pub fn occupancy_sums(&mut self, phase: &str, crystal: &Crystal) -> Result<Vec<String>> {
        let mut groups: BTreeMap<[i64; 3], Vec<String>> = BTreeMap::new();
        for site in &crystal.sites {
            groups
                .entry(position_key(&site.position))
                .or_default()
                .push(site.label.clone());
        }

        let mut created = Vec::new();
        for mut labels in groups.into_values() {
            if labels.len() < 2 {
                continue;
            }
            labels.sort();
            let terms: Vec<(String, f64)> = labels
                .iter()
                .map(|l| var_name(&[phase, l, SiteClass::Occ.suffix()]))
                .filter(|n| self.registry.contains(n))
                .map(|n| (n, 1.0))
                .collect();
            if terms.len() < 2 {
                continue;
            }

            let name = format!("{}_{}_{}", phase, OCCSUM_TAG, labels.join("_"));
            self.registry.add_derived(&name, terms, tags(phase, OCCSUM_TAG))?;
            self.registry.restrain(&name, 0.0, 1.0, RESTRAINT_SIG)?;
            tracing::info!(phase, param = %name, "occupancy sum restrained to [0, 1]");
            created.push(name);
        }
        Ok(created)
    }

    /// 施加软约束表；键须为参数类别或参数名，没有成员的类别跳过
    pub fn apply_restraints(&mut self, restraints: &BTreeMap<String, RestraintSpec>) -> Result<()> {
        for (token, spec) in restraints {
            let names = self.registry.expand(token).map_err(|_| {
                EzfitError::config(
                    format!("restraints.{}", token),
                    "not a parameter class or parameter name",
                )
            })?;
            for name in names {
                self.restrain_one(&name, spec)?;
            }
        }
        self.registry.fix_all();
        Ok(())
    }

    /// 单独释放一个参数，按其当前值解析区间
    fn restrain_one(&mut self, name: &str, spec: &RestraintSpec) -> Result<()> {
        if self.registry.is_constrained(name) {
            tracing::debug!(param = %name, "constrained parameter is not restrained");
            return Ok(());
        }
        self.registry.fix_all();
        self.registry.free(&[name])?;

        let current = self.registry.value(name)?;
        let (lower, upper) = spec.resolve(current);
        self.registry.restrain(name, lower, upper, RESTRAINT_SIG)?;
        if let Some(initial) = spec.initial() {
            self.registry.set_value(name, initial)?;
        }
        tracing::debug!(param = %name, lower, upper, "restraint applied");

        self.registry.fix_all();
        Ok(())
    }
}
