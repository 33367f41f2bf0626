//! # 分阶段优化器
//!
//! 按配置的顺序逐阶段精修。每个阶段：
//! 1. 固定其他阶段计划释放的参数
//! 2. 应用本阶段的固定列表
//! 3. 应用本阶段的释放列表（同时出现在两个列表中的参数最终为自由）
//! 4. 以当前值为起点、以硬边界与软约束区间的交集为盒约束，执行一次有界最小二乘
//!
//! 计算区间在第一个阶段之前裁剪一次，所有阶段共用。阶段间不重复迭代。
//!
//! ## 依赖关系
//! - 被 `fit/mod.rs` 调用
//! - 使用 `fit/solver.rs`、`fit/registry.rs`、`utils/`

use crate::config::{RangeConfig, Stage};
use crate::error::Result;
use crate::fit::recipe::Recipe;
use crate::fit::registry::ParameterRegistry;
use crate::fit::solver::{least_squares, SolverOptions};
use crate::utils::output::print_stage;
use crate::utils::progress::create_progress_bar;
use std::collections::BTreeSet;

/// 可被分阶段精修的模型
pub trait Refinable {
    fn registry(&self) -> &ParameterRegistry;
    fn registry_mut(&mut self) -> &mut ParameterRegistry;
    /// 裁剪计算区间
    fn clip_range(&mut self, range: &RangeConfig) -> Result<()>;
    /// 当前参数值下的加权残差
    fn residual(&self) -> Result<Vec<f64>>;
}

impl Refinable for Recipe {
    fn registry(&self) -> &ParameterRegistry {
        &self.registry
    }

    fn registry_mut(&mut self) -> &mut ParameterRegistry {
        &mut self.registry
    }

    fn clip_range(&mut self, range: &RangeConfig) -> Result<()> {
        self.contribution
            .profile
            .set_calculation_range(range.rmin, range.rmax, range.rstep)
    }

    fn residual(&self) -> Result<Vec<f64>> {
        Recipe::residual(self)
    }
}

/// 优化器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerState {
    Idle,
    StageActive(usize),
    ConvergedStage(usize),
    Complete,
}

/// 单个阶段的结果
#[derive(Debug, Clone)]
pub struct StageReport {
    /// 从 1 开始
    pub index: usize,
    pub free: Vec<String>,
    pub cost: f64,
    pub nfev: usize,
    pub converged: bool,
    /// 与 `free` 一一对应的标准误差
    pub std_errors: Vec<f64>,
}

/// 分阶段优化器
#[derive(Debug)]
pub struct StagedOptimizer {
    stages: Vec<Stage>,
    range: RangeConfig,
    options: SolverOptions,
    verbose: bool,
    state: OptimizerState,
}

impl StagedOptimizer {
    pub fn new(stages: Vec<Stage>, range: RangeConfig, options: SolverOptions) -> Self {
        StagedOptimizer {
            stages,
            range,
            options,
            verbose: false,
            state: OptimizerState::Idle,
        }
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn state(&self) -> OptimizerState {
        self.state
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// 将参数名追加到最后一个阶段的释放列表
    pub fn append_to_last_stage(&mut self, names: &[String]) {
        if let Some(last) = self.stages.last_mut() {
            last.free.extend(names.iter().cloned());
        }
    }

    /// 除第 `index` 个阶段之外所有阶段的释放标记
    fn scheduled_elsewhere(&self, index: usize) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.stages
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != index)
            .flat_map(|(_, s)| s.free.iter())
            .filter(|t| seen.insert(t.as_str()))
            .cloned()
            .collect()
    }

    /// 按顺序执行全部阶段
    pub fn run<M: Refinable>(&mut self, model: &mut M) -> Result<Vec<StageReport>> {
        model.clip_range(&self.range)?;
        let total = self.stages.len();
        tracing::info!(stages = total, "starting staged refinement");

        let bar = self.verbose.then(|| create_progress_bar(total as u64, "refining"));
        let mut reports = Vec::with_capacity(total);
        for index in 0..total {
            let report = self.run_stage(model, index)?;
            if let Some(bar) = &bar {
                bar.set_message(format!("cost {:.4e}", report.cost));
                bar.inc(1);
            }
            reports.push(report);
        }
        if let Some(bar) = bar {
            bar.finish_and_clear();
        }

        self.state = OptimizerState::Complete;
        Ok(reports)
    }

    fn run_stage<M: Refinable>(&mut self, model: &mut M, index: usize) -> Result<StageReport> {
        self.state = OptimizerState::StageActive(index);
        let stage = self.stages[index].clone();

        let registry = model.registry_mut();
        registry.fix(&self.scheduled_elsewhere(index))?;
        registry.fix(&stage.fix)?;
        registry.free(&stage.free)?;

        let names = registry.free_names();
        let total = self.stages.len();
        if self.verbose {
            print_stage(index + 1, total, &names);
        }
        tracing::info!(stage = index + 1, free = names.len(), "stage started");

        if names.is_empty() {
            tracing::warn!(stage = index + 1, "no free parameters, stage skipped");
            self.state = OptimizerState::ConvergedStage(index);
            return Ok(StageReport {
                index: index + 1,
                free: names,
                cost: 0.5 * model.residual()?.iter().map(|v| v * v).sum::<f64>(),
                nfev: 0,
                converged: true,
                std_errors: Vec::new(),
            });
        }

        let registry = model.registry();
        let x0 = names
            .iter()
            .map(|n| registry.value(n))
            .collect::<Result<Vec<f64>>>()?;
        let bounds = names
            .iter()
            .map(|n| registry.box_bounds(n))
            .collect::<Result<Vec<(f64, f64)>>>()?;

        let mut problem = |x: &[f64]| -> Result<Vec<f64>> {
            let registry = model.registry_mut();
            for (name, value) in names.iter().zip(x) {
                registry.set_value(name, *value)?;
            }
            model.residual()
        };
        let report = least_squares(&mut problem, &x0, &bounds, &self.options)?;

        let registry = model.registry_mut();
        for (name, value) in names.iter().zip(&report.x) {
            registry.set_value(name, *value)?;
        }
        registry.refresh()?;

        tracing::info!(
            stage = index + 1,
            cost = report.cost,
            nfev = report.nfev,
            converged = report.converged,
            "stage finished"
        );
        self.state = OptimizerState::ConvergedStage(index);
        Ok(StageReport {
            index: index + 1,
            free: names,
            cost: report.cost,
            nfev: report.nfev,
            converged: report.converged,
            std_errors: report.std_errors,
        })
    }
}
