//! Parameter bookkeeping, AdamW with serializable state, dynamic loss
//! scaling and the exponential learning-rate schedule.
//!
//! Gradients are collected into a [`Gradients`] buffer instead of being
//! applied straight from a `GradStore`, so several backward passes can be
//! accumulated before one optimizer step and the buffer can be unscaled and
//! checked for overflow in between.

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use candle_nn::{ParamsAdamW, VarMap};
use serde::{Deserialize, Serialize};

use crate::model::layers::scalar;
use crate::{Error, Result};

// ---------------------------------------------------------------------------
// Parameters and gradients
// ---------------------------------------------------------------------------

/// Named trainable variables in a stable (sorted) order.
#[derive(Debug, Clone, Default)]
pub struct ParamSet {
    names: Vec<String>,
    vars: Vec<Var>,
}

impl ParamSet {
    pub fn from_varmap(varmap: &VarMap) -> Self {
        Self::from_groups(&[("", varmap)])
    }

    /// Merge several var maps; names are prefixed with `<group>.` unless the
    /// group is empty.
    pub fn from_groups(groups: &[(&str, &VarMap)]) -> Self {
        let mut entries: Vec<(String, Var)> = Vec::new();
        for (group, varmap) in groups {
            let data = varmap.data().lock().unwrap_or_else(|e| e.into_inner());
            for (name, var) in data.iter() {
                let name = if group.is_empty() {
                    name.clone()
                } else {
                    format!("{group}.{name}")
                };
                entries.push((name, var.clone()));
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let (names, vars) = entries.into_iter().unzip();
        Self { names, vars }
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn vars(&self) -> &[Var] {
        &self.vars
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Var)> {
        self.names.iter().map(String::as_str).zip(&self.vars)
    }

    /// Total number of scalar parameters.
    pub fn num_elements(&self) -> usize {
        self.vars.iter().map(|v| v.elem_count()).sum()
    }
}

/// Gradient buffer aligned with a [`ParamSet`].
#[derive(Debug, Clone)]
pub struct Gradients {
    grads: Vec<Option<Tensor>>,
}

impl Gradients {
    pub fn new(params: &ParamSet) -> Self {
        Self {
            grads: vec![None; params.len()],
        }
    }

    /// Add the gradients of one backward pass.
    pub fn accumulate(&mut self, params: &ParamSet, store: &GradStore) -> Result<()> {
        for (slot, var) in self.grads.iter_mut().zip(params.vars()) {
            let Some(g) = store.get(var.as_tensor()) else {
                continue;
            };
            let g = g.detach();
            *slot = Some(match slot.take() {
                Some(acc) => (acc + g)?,
                None => g,
            });
        }
        Ok(())
    }

    pub fn get(&self, index: usize) -> Option<&Tensor> {
        self.grads.get(index).and_then(Option::as_ref)
    }

    pub fn is_empty(&self) -> bool {
        self.grads.iter().all(Option::is_none)
    }

    pub fn scale(&mut self, factor: f64) -> Result<()> {
        for g in self.grads.iter_mut().flatten() {
            *g = (&*g * factor)?;
        }
        Ok(())
    }

    /// `false` as soon as any entry is NaN or infinite.
    pub fn all_finite(&self) -> Result<bool> {
        for g in self.grads.iter().flatten() {
            let sum_sq = g.to_dtype(DType::F32)?.sqr()?.sum_all()?;
            if !scalar(&sum_sq)?.is_finite() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn clear(&mut self) {
        self.grads.iter_mut().for_each(|g| *g = None);
    }
}

// ---------------------------------------------------------------------------
// AdamW
// ---------------------------------------------------------------------------

/// Decoupled-weight-decay Adam whose moments can be saved and restored.
#[derive(Debug, Clone)]
pub struct AdamW {
    params: ParamsAdamW,
    first_moment: Vec<Tensor>,
    second_moment: Vec<Tensor>,
    step_t: usize,
}

impl AdamW {
    pub fn new(params: &ParamSet, config: ParamsAdamW) -> Result<Self> {
        let zeros = |v: &Var| Tensor::zeros(v.shape(), v.dtype(), v.device());
        Ok(Self {
            params: config,
            first_moment: params.vars().iter().map(zeros).collect::<candle_core::Result<_>>()?,
            second_moment: params.vars().iter().map(zeros).collect::<candle_core::Result<_>>()?,
            step_t: 0,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }

    pub fn step_count(&self) -> usize {
        self.step_t
    }

    /// Apply one update. Parameters without a gradient are left untouched.
    pub fn step(&mut self, params: &ParamSet, grads: &Gradients) -> Result<()> {
        if params.len() != self.first_moment.len() {
            return Err(Error::Shape(format!(
                "optimizer built for {} parameters, stepped with {}",
                self.first_moment.len(),
                params.len()
            )));
        }
        self.step_t += 1;
        let ParamsAdamW {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.params.clone();
        let scale_m = 1f64 / (1f64 - beta1.powi(self.step_t as i32));
        let scale_v = 1f64 / (1f64 - beta2.powi(self.step_t as i32));

        for (i, theta) in params.vars().iter().enumerate() {
            let Some(g) = grads.get(i) else {
                continue;
            };
            let next_m = ((&self.first_moment[i] * beta1)? + (g * (1.0 - beta1))?)?;
            let next_v = ((&self.second_moment[i] * beta2)? + (g.sqr()? * (1.0 - beta2))?)?;
            let m_hat = (&next_m * scale_m)?;
            let v_hat = (&next_v * scale_v)?;
            let next_theta = (theta.as_tensor() * (1f64 - lr * weight_decay))?;
            let adjusted = (m_hat / (v_hat.sqrt()? + eps)?)?;
            theta.set(&(next_theta - (adjusted * lr)?)?)?;
            self.first_moment[i] = next_m;
            self.second_moment[i] = next_v;
        }
        Ok(())
    }

    /// Moments keyed as `m.<param>` / `v.<param>`.
    pub fn state_tensors(&self, params: &ParamSet) -> HashMap<String, Tensor> {
        let mut out = HashMap::with_capacity(2 * params.len());
        for (i, name) in params.names().iter().enumerate() {
            out.insert(format!("m.{name}"), self.first_moment[i].clone());
            out.insert(format!("v.{name}"), self.second_moment[i].clone());
        }
        out
    }

    /// Restore moments written by [`Self::state_tensors`]. Every moment is
    /// validated before any is replaced.
    pub fn load_state(
        &mut self,
        params: &ParamSet,
        tensors: &HashMap<String, Tensor>,
        step_t: usize,
    ) -> Result<()> {
        let mut first = Vec::with_capacity(params.len());
        let mut second = Vec::with_capacity(params.len());
        for (name, var) in params.iter() {
            for (prefix, dst) in [("m", &mut first), ("v", &mut second)] {
                let key = format!("{prefix}.{name}");
                let t = tensors
                    .get(&key)
                    .ok_or_else(|| Error::Checkpoint(format!("optimizer state missing `{key}`")))?;
                if t.dims() != var.dims() {
                    return Err(Error::Checkpoint(format!(
                        "optimizer state `{key}` has shape {:?}, parameter has {:?}",
                        t.dims(),
                        var.dims()
                    )));
                }
                dst.push(t.to_device(var.device())?.to_dtype(var.dtype())?);
            }
        }
        self.first_moment = first;
        self.second_moment = second;
        self.step_t = step_t;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Loss scaling
// ---------------------------------------------------------------------------

/// Serializable part of [`GradScaler`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GradScalerState {
    pub scale: f64,
    pub growth_tracker: usize,
}

/// Dynamic loss scaling for reduced-precision training.
///
/// The loss is multiplied by `scale` before backward; gradients are divided
/// by it before the optimizer step. A step whose gradients overflow is
/// skipped and the scale is halved; after `growth_interval` clean steps the
/// scale doubles. A disabled scaler passes everything through unchanged.
#[derive(Debug, Clone)]
pub struct GradScaler {
    enabled: bool,
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: usize,
    growth_tracker: usize,
}

impl GradScaler {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            growth_tracker: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn scale_value(&self) -> f64 {
        if self.enabled { self.scale } else { 1.0 }
    }

    pub fn scale_loss(&self, loss: &Tensor) -> Result<Tensor> {
        if !self.enabled {
            return Ok(loss.clone());
        }
        Ok((loss * self.scale)?)
    }

    /// Unscale `grads`, step `optimizer` when they are finite and update the
    /// scale. Returns whether the optimizer actually stepped.
    pub fn step(
        &mut self,
        optimizer: &mut AdamW,
        params: &ParamSet,
        grads: &mut Gradients,
    ) -> Result<bool> {
        if !self.enabled {
            optimizer.step(params, grads)?;
            return Ok(true);
        }
        grads.scale(1.0 / self.scale)?;
        if !grads.all_finite()? {
            self.scale *= self.backoff_factor;
            self.growth_tracker = 0;
            tracing::warn!(scale = self.scale, "non-finite gradients, skipping step");
            return Ok(false);
        }
        optimizer.step(params, grads)?;
        self.growth_tracker += 1;
        if self.growth_tracker == self.growth_interval {
            self.scale *= self.growth_factor;
            self.growth_tracker = 0;
        }
        Ok(true)
    }

    pub fn state(&self) -> GradScalerState {
        GradScalerState {
            scale: self.scale,
            growth_tracker: self.growth_tracker,
        }
    }

    pub fn load_state(&mut self, state: GradScalerState) {
        self.scale = state.scale;
        self.growth_tracker = state.growth_tracker;
    }
}

// ---------------------------------------------------------------------------
// LR schedule
// ---------------------------------------------------------------------------

/// `lr = base_lr · γ^epoch`, stepped once per epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExponentialLr {
    pub base_lr: f64,
    pub gamma: f64,
    pub last_epoch: usize,
}

impl ExponentialLr {
    pub fn new(base_lr: f64, gamma: f64) -> Self {
        Self {
            base_lr,
            gamma,
            last_epoch: 0,
        }
    }

    pub fn current_lr(&self) -> f64 {
        self.base_lr * self.gamma.powi(self.last_epoch as i32)
    }

    /// Advance one epoch and push the new rate into `optimizer`.
    pub fn step(&mut self, optimizer: &mut AdamW) {
        self.last_epoch += 1;
        optimizer.set_learning_rate(self.current_lr());
    }
}
