//! Merge strategies for writing tensors into live parameters
//!
//! Two policies coexist:
//!
//! - [`overlay`]: style checkpoints are partial overlays over a larger
//!   frozen base. Known keys overwrite, unknown keys are skipped, everything
//!   the checkpoint does not name keeps its current value.
//! - [`strict_additive`]: motion checkpoints are a closed set of weights the
//!   backbone must already declare. Any surplus key rejects the whole merge.
//!
//! Both validate every key and shape before the first write, so a failed
//! merge leaves the target untouched.

use candle_core::{DType, Tensor, Var};
use candle_nn::VarMap;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::loader::StateDict;

/// Outcome of a successful merge
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Parameters written
    pub applied: usize,
    /// Incoming keys the target does not declare (overlay only)
    pub skipped: Vec<String>,
}

/// Validated writes that have not touched the target yet
#[derive(Debug)]
pub struct OverlayPlan {
    writes: Vec<(Var, Tensor)>,
    skipped: Vec<String>,
}

impl OverlayPlan {
    /// Check every incoming tensor against `target` without writing
    pub fn prepare(target: &VarMap, incoming: &StateDict) -> Result<Self> {
        let vars = target.data().lock().map_err(|_| Error::Poisoned)?;

        let mut keys: Vec<&String> = incoming.keys().collect();
        keys.sort();

        let mut writes = Vec::with_capacity(keys.len());
        let mut skipped = Vec::new();
        for key in keys {
            match vars.get(key.as_str()) {
                Some(var) => writes.push((var.clone(), conform(key, var, &incoming[key])?)),
                None => skipped.push(key.clone()),
            }
        }

        Ok(Self { writes, skipped })
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Write the validated tensors
    pub fn commit(self) -> Result<MergeReport> {
        for (var, value) in &self.writes {
            var.set(value)?;
        }
        if !self.skipped.is_empty() {
            warn!(count = self.skipped.len(), "overlay skipped keys the target does not declare");
        }
        Ok(MergeReport {
            applied: self.writes.len(),
            skipped: self.skipped,
        })
    }
}

/// Overwrite every parameter named in `incoming`; leave the rest untouched
pub fn overlay(target: &VarMap, incoming: &StateDict) -> Result<MergeReport> {
    OverlayPlan::prepare(target, incoming)?.commit()
}

/// Write `incoming` into `target`, failing if any key is not already a
/// parameter of `target`
pub fn strict_additive(
    target: &VarMap,
    incoming: &StateDict,
    checkpoint: &str,
) -> Result<MergeReport> {
    let writes = {
        let vars = target.data().lock().map_err(|_| Error::Poisoned)?;

        let mut keys: Vec<&String> = incoming.keys().collect();
        keys.sort();

        let unexpected: Vec<String> = keys
            .iter()
            .filter(|key| !vars.contains_key(key.as_str()))
            .map(|key| key.to_string())
            .collect();
        if !unexpected.is_empty() {
            return Err(Error::UnexpectedKeys {
                checkpoint: checkpoint.to_string(),
                keys: unexpected,
            });
        }

        keys.into_iter()
            .map(|key| {
                let var = &vars[key.as_str()];
                Ok((var.clone(), conform(key, var, &incoming[key])?))
            })
            .collect::<Result<Vec<_>>>()?
    };

    for (var, value) in &writes {
        var.set(value)?;
    }
    debug!(checkpoint, applied = writes.len(), "strict additive merge");
    Ok(MergeReport {
        applied: writes.len(),
        skipped: Vec::new(),
    })
}

/// Parameter updated by a diffusers attention-processor low-rank pair
///
/// `…attn1.processor.to_out_lora.down.weight` → `…attn1.to_out.0.weight`
pub fn lora_target_name(down_key: &str) -> String {
    down_key
        .replace("processor.", "")
        .replace("_lora", "")
        .replace("down.", "")
        .replace("up.", "")
        .replace("to_out.", "to_out.0.")
}

/// Add `alpha * up @ down` to each parameter targeted by a low-rank pair
pub fn add_lora_deltas(target: &VarMap, lora: &StateDict, alpha: f64) -> Result<usize> {
    let writes = {
        let vars = target.data().lock().map_err(|_| Error::Poisoned)?;

        let mut down_keys: Vec<&String> = lora.keys().filter(|k| k.contains(".down.")).collect();
        down_keys.sort();

        let mut unknown = Vec::new();
        let mut writes = Vec::with_capacity(down_keys.len());
        for down_key in down_keys {
            let up_key = down_key.replace(".down.", ".up.");
            let up = lora.get(&up_key).ok_or_else(|| Error::Conversion {
                key: down_key.clone(),
                detail: format!("missing matching up projection '{up_key}'"),
            })?;

            let name = lora_target_name(down_key);
            let Some(var) = vars.get(&name) else {
                unknown.push(name);
                continue;
            };

            let delta = up
                .to_dtype(DType::F32)?
                .matmul(&lora[down_key].to_dtype(DType::F32)?)?
                .affine(alpha, 0.0)?;
            if delta.dims() != var.dims() {
                return Err(Error::shape_mismatch(&name, var.dims(), delta.dims()));
            }
            let delta = delta.to_dtype(var.dtype())?.to_device(var.device())?;
            writes.push((var.clone(), var.as_tensor().add(&delta)?));
        }

        if !unknown.is_empty() {
            return Err(Error::UnexpectedKeys {
                checkpoint: "low-rank adapter".to_string(),
                keys: unknown,
            });
        }
        writes
    };

    for (var, value) in &writes {
        var.set(value)?;
    }
    Ok(writes.len())
}

/// Check the shape of `value` against `var` and match its dtype and device
fn conform(key: &str, var: &Var, value: &Tensor) -> Result<Tensor> {
    if var.dims() != value.dims() {
        return Err(Error::shape_mismatch(key, var.dims(), value.dims()));
    }
    Ok(value.to_dtype(var.dtype())?.to_device(var.device())?)
}
