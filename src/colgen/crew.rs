use super::Side;
use crate::block::Block;
use crate::config::Config;
use crate::constants::*;
use crate::crew::{CrewDuty, DutyType, RegulationTerms};
use crate::pricing::CrewDuals;
use crate::Result;
use grb::prelude::*;
use std::sync::Arc;
use tracing::{info, warn};

/// The four crew regulations, each a `Σ y·t ≤ 0` row over the duties' regulation terms.
#[derive(Debug, Copy, Clone)]
struct RegulationRows {
  avg_length: Constr,
  long: Constr,
  broken: Constr,
  between: Constr,
}

impl RegulationRows {
  fn coefficients(&self, t: &RegulationTerms) -> [(Constr, f64); 4] {
    [
      (self.avg_length, t.avg_length),
      (self.long, t.long),
      (self.broken, t.broken),
      (self.between, t.between),
    ]
  }
}

/// Block cover rows, the duty ceiling and the regulation rows.  Block cover right-hand sides
/// are the number of vehicles driving each block.
pub struct CrewSide<'a> {
  cfg: &'a Config,
  blocks: Arc<Vec<Block>>,
  counts: Vec<u32>,
  block_rows: Vec<Constr>,
  max_duties: Option<Constr>,
  regulation: Option<RegulationRows>,
}

impl<'a> CrewSide<'a> {
  pub fn new(cfg: &'a Config, blocks: Vec<(Block, u32)>) -> Self {
    let (blocks, counts): (Vec<_>, Vec<_>) = blocks.into_iter().unzip();
    debug_assert!(blocks.iter().enumerate().all(|(i, b)| b.index == i));
    CrewSide {
      cfg,
      blocks: Arc::new(blocks),
      counts,
      block_rows: Vec::new(),
      max_duties: None,
      regulation: None,
    }
  }

  pub fn blocks(&self) -> &Arc<Vec<Block>> {
    &self.blocks
  }
}

impl<'a> Side for CrewSide<'a> {
  type Column = CrewDuty;
  type Duals = CrewDuals;

  const NAME: &'static str = "csp";
  const INTEGRAL_TYPE: VarType = Integer;

  fn max_iterations(&self) -> usize { self.cfg.csp_max_col_gen_its }

  fn non_improving_limit(&self) -> usize { self.cfg.csp_opt_it_threshold }

  fn time_limit(&self) -> f64 { self.cfg.csp_solver_timeout_sec }

  fn add_rows(&mut self, model: &mut Model, columns: &[CrewDuty], vars: &[Var]) -> Result<()> {
    let mut covering = vec![Vec::new(); self.blocks.len()];
    for (duty, &y) in columns.iter().zip(vars) {
      for b in duty.block_cover.iter() {
        covering[b].push(y);
      }
    }

    self.block_rows = Vec::with_capacity(covering.len());
    for (b, ys) in covering.into_iter().enumerate() {
      let name = format!("{}[{}]", CSTR_BLOCK_COVER, b);
      let lhs = ys.into_iter().grb_sum();
      let rhs = self.counts[b] as f64;
      let row = if self.cfg.csp_allow_overcover {
        model.add_constr(&name, c!(lhs >= rhs))?
      } else {
        model.add_constr(&name, c!(lhs == rhs))?
      };
      self.block_rows.push(row);
    }

    let slack = model.add_var("csp_over_max", Continuous, self.cfg.cr_over_max_cost, 0.0, INFINITY, std::iter::empty())?;
    let n = vars.iter().copied().grb_sum();
    self.max_duties = Some(model.add_constr(CSTR_MAX_DUTIES, c!(n - slack <= self.cfg.max_duties as f64))?);

    let terms: Vec<_> = columns.iter().map(|d| d.regulation_terms()).collect();
    let mut row = |name: &str, term: fn(&RegulationTerms) -> f64| -> Result<Constr> {
      let s = model.add_var(&format!("{}_slack", name), Continuous, CR_HARD_CONSTR_PENALTY, 0.0, INFINITY, std::iter::empty())?;
      let lhs = terms.iter().zip(vars).map(|(t, &y)| term(t) * y).grb_sum();
      Ok(model.add_constr(name, c!(lhs - s <= 0.0))?)
    };
    self.regulation = Some(RegulationRows {
      avg_length: row(CSTR_CR_AVG_TIME, |t| t.avg_length)?,
      long: row(CSTR_CR_LONG_DUTIES, |t| t.long)?,
      broken: row(CSTR_CR_BROKEN_DUTIES, |t| t.broken)?,
      between: row(CSTR_CR_BETWEEN_DUTIES, |t| t.between)?,
    });
    Ok(())
  }

  fn coefficients(&self, duty: &CrewDuty) -> Vec<(Constr, f64)> {
    let mut coeffs: Vec<_> = duty.block_cover.iter().map(|b| (self.block_rows[b], 1.0)).collect();
    if let Some(row) = self.max_duties {
      coeffs.push((row, 1.0));
    }
    if let Some(rows) = &self.regulation {
      coeffs.extend_from_slice(&rows.coefficients(&duty.regulation_terms()));
    }
    coeffs
  }

  fn duals(&self, model: &Model) -> Result<CrewDuals> {
    let block_duals = model.get_obj_attr_batch(attr::Pi, self.block_rows.iter().copied())?;
    let mut duals = CrewDuals::new(self.blocks.clone(), block_duals);
    duals.block_counts = self.counts.clone();
    if let Some(row) = &self.max_duties {
      duals.max_duties = model.get_obj_attr(attr::Pi, row)?;
    }
    // regulation rows are `<=`, so their duals are non-positive
    if let Some(rows) = &self.regulation {
      duals.avg_length = -model.get_obj_attr(attr::Pi, &rows.avg_length)?;
      duals.long_duties = -model.get_obj_attr(attr::Pi, &rows.long)?;
      duals.broken_duties = -model.get_obj_attr(attr::Pi, &rows.broken)?;
      duals.between_duties = -model.get_obj_attr(attr::Pi, &rows.between)?;
    }
    Ok(duals)
  }

  fn report_cover(&self, columns: &[CrewDuty], selection: &[(usize, u32)]) {
    let mut count = vec![0u32; self.blocks.len()];
    let mut singles = 0;
    for &(i, n) in selection {
      let duty = &columns[i];
      if duty.duty_type == DutyType::Single {
        singles += n;
      }
      for b in duty.block_cover.iter() {
        count[b] += n;
      }
    }
    let under = count.iter().zip(&self.counts).filter(|(c, n)| c < n).count();
    let over = count.iter().zip(&self.counts).filter(|(c, n)| c > n).count();
    if under > 0 {
      warn!(blocks = under, "blocks are under-covered by crew");
    }
    let duties: u32 = selection.iter().map(|&(_, n)| n).sum();
    info!(duties, single_duties = singles, overcovered_blocks = over, "crew cover");
  }
}
