//! Exponential moving average of model weights.

use std::collections::HashMap;

use candle_core::Tensor;

use super::optim::ParamSet;
use crate::{Error, Result};

/// `shadow ← decay · shadow + (1 − decay) · param`, one shadow per parameter.
#[derive(Debug, Clone)]
pub struct Ema {
    decay: f64,
    shadow: Vec<Tensor>,
}

impl Ema {
    /// Start from a copy of the current weights.
    pub fn new(params: &ParamSet, decay: f64) -> Result<Self> {
        // `Var::set` overwrites storage in place, so the shadow must own a copy.
        let shadow = params
            .vars()
            .iter()
            .map(|v| v.as_tensor().copy())
            .collect::<candle_core::Result<_>>()?;
        Ok(Self { decay, shadow })
    }

    pub fn decay(&self) -> f64 {
        self.decay
    }

    pub fn update(&mut self, params: &ParamSet) -> Result<()> {
        for (shadow, var) in self.shadow.iter_mut().zip(params.vars()) {
            let blended = ((&*shadow * self.decay)? + (var.as_tensor().detach() * (1.0 - self.decay))?)?;
            *shadow = blended;
        }
        Ok(())
    }

    /// Shadow weights keyed by parameter name.
    pub fn tensors(&self, params: &ParamSet) -> HashMap<String, Tensor> {
        params
            .names()
            .iter()
            .cloned()
            .zip(self.shadow.iter().cloned())
            .collect()
    }

    /// Replace the shadow with saved weights. Nothing changes unless every
    /// parameter has a tensor of the right shape.
    pub fn load(&mut self, params: &ParamSet, tensors: &HashMap<String, Tensor>) -> Result<()> {
        let mut shadow = Vec::with_capacity(params.len());
        for (name, var) in params.iter() {
            let t = tensors
                .get(name)
                .ok_or_else(|| Error::Checkpoint(format!("EMA weights missing `{name}`")))?;
            if t.dims() != var.dims() {
                return Err(Error::Checkpoint(format!(
                    "EMA weight `{name}` has shape {:?}, parameter has {:?}",
                    t.dims(),
                    var.dims()
                )));
            }
            shadow.push(t.to_device(var.device())?.to_dtype(var.dtype())?);
        }
        self.shadow = shadow;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{Init, VarBuilder, VarMap};

    #[test]
    fn ema_tracks_slowly() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let w = vb.get_with_hints(2, "w", Init::Const(0.0)).unwrap();
        let params = ParamSet::from_varmap(&varmap);
        let mut ema = Ema::new(&params, 0.9).unwrap();

        params.vars()[0].set(&w.ones_like().unwrap()).unwrap();
        ema.update(&params).unwrap();
        let shadow: Vec<f32> = ema.tensors(&params)["w"].to_vec1().unwrap();
        assert!((shadow[0] - 0.1).abs() < 1e-6);

        ema.update(&params).unwrap();
        let shadow: Vec<f32> = ema.tensors(&params)["w"].to_vec1().unwrap();
        assert!((shadow[0] - 0.19).abs() < 1e-6);
    }

    #[test]
    fn shadow_is_not_aliased_to_the_parameter() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.get_with_hints(3, "w", Init::Const(1.0)).unwrap();
        let params = ParamSet::from_varmap(&varmap);
        let ema = Ema::new(&params, 0.5).unwrap();
        let var = &params.vars()[0];
        var.set(&var.as_tensor().affine(0.0, 5.0).unwrap()).unwrap();
        let shadow: Vec<f32> = ema.tensors(&params)["w"].to_vec1().unwrap();
        assert_eq!(shadow, vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn load_replaces_shadow_and_checks_shapes() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.get_with_hints(2, "w", Init::Const(0.0)).unwrap();
        let params = ParamSet::from_varmap(&varmap);
        let mut ema = Ema::new(&params, 0.9).unwrap();

        let saved = HashMap::from([("w".to_string(), Tensor::new(&[3f32, 4.], &Device::Cpu).unwrap())]);
        ema.load(&params, &saved).unwrap();
        let shadow: Vec<f32> = ema.tensors(&params)["w"].to_vec1().unwrap();
        assert_eq!(shadow, vec![3.0, 4.0]);

        let wrong = HashMap::from([("w".to_string(), Tensor::zeros(3, DType::F32, &Device::Cpu).unwrap())]);
        assert!(matches!(ema.load(&params, &wrong), Err(Error::Checkpoint(_))));
        assert!(matches!(ema.load(&params, &HashMap::new()), Err(Error::Checkpoint(_))));
        let shadow: Vec<f32> = ema.tensors(&params)["w"].to_vec1().unwrap();
        assert_eq!(shadow, vec![3.0, 4.0]);
    }
}
