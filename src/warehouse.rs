//! The data-warehouse contract the scheduler executes against, plus an
//! in-memory implementation.
//!
//! The warehouse is the only state shared across tasks. The scheduler's sole
//! discipline over it is the dependency graph itself: a variable is never
//! read before its producer has completed, enforced by dependency counts,
//! not by locks. Payloads are opaque contiguous byte buffers ([`Bytes`]);
//! scalar helpers cast through [`bytemuck`] for the common f64 case.
//!
//! The cooperative abort/restart protocol also lives here: a task body (or a
//! stability check inside one) flags `abort_timestep()`, the execution loop
//! observes it after each completed task, and the caller re-runs the
//! timestep once every rank has seen `restart_timestep()`.

use crate::grid::{MaterialId, PatchId};
use crate::sched_error::SchedError;
use crate::task::VarLabel;
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

/// Versioned variable store contract (one instance per generation).
pub trait DataWarehouse: Send + Sync {
    /// Store a per-patch variable.
    fn put(
        &self,
        label: &VarLabel,
        patch: PatchId,
        material: MaterialId,
        data: Bytes,
    ) -> Result<(), SchedError>;

    /// Fetch a per-patch variable.
    fn get(&self, label: &VarLabel, patch: PatchId, material: MaterialId)
    -> Result<Bytes, SchedError>;

    /// Store a global (per-rank, patch-less) variable, as reduction
    /// contributions are.
    fn put_global(
        &self,
        label: &VarLabel,
        material: MaterialId,
        data: Bytes,
    ) -> Result<(), SchedError>;

    /// Fetch a global variable.
    fn get_global(&self, label: &VarLabel, material: MaterialId) -> Result<Bytes, SchedError>;

    fn exists(&self, label: &VarLabel, patch: Option<PatchId>, material: MaterialId) -> bool;

    /// Copy a label's values for the given patch/material subsets from
    /// another warehouse generation into this one.
    fn transfer_from(
        &self,
        other: &dyn DataWarehouse,
        label: &VarLabel,
        patches: &[PatchId],
        materials: &[MaterialId],
    ) -> Result<(), SchedError>;

    /// Raised by a task body when the timestep must be discarded.
    fn abort_timestep(&self);
    fn timestep_aborted(&self) -> bool;

    /// Mark the timestep for re-execution. Set cooperatively on every rank
    /// by the scheduler's end-of-execute all-reduce.
    fn restart_timestep(&self);
    fn timestep_restarted(&self) -> bool;

    /// Scalar convenience: store an f64 slice as bytes.
    fn put_scalars(
        &self,
        label: &VarLabel,
        patch: PatchId,
        material: MaterialId,
        vals: &[f64],
    ) -> Result<(), SchedError> {
        self.put(label, patch, material, scalars_to_bytes(vals))
    }

    /// Scalar convenience: fetch a per-patch variable as f64s.
    fn get_scalars(
        &self,
        label: &VarLabel,
        patch: PatchId,
        material: MaterialId,
    ) -> Result<Vec<f64>, SchedError> {
        Ok(bytes_to_scalars(&self.get(label, patch, material)?))
    }
}

/// Encode an f64 slice as an owned byte payload.
pub fn scalars_to_bytes(vals: &[f64]) -> Bytes {
    Bytes::from(bytemuck::cast_slice::<f64, u8>(vals).to_vec())
}

/// Decode a byte payload as f64s. Copies, so source alignment is irrelevant.
pub fn bytes_to_scalars(data: &Bytes) -> Vec<f64> {
    bytemuck::pod_collect_to_vec::<u8, f64>(data)
}

type StoreKey = (VarLabel, Option<PatchId>, MaterialId);

/// In-memory warehouse backing tests, examples, and single-process runs.
#[derive(Default)]
pub struct InMemoryWarehouse {
    store: RwLock<hashbrown::HashMap<StoreKey, Bytes>>,
    aborted: AtomicBool,
    restarted: AtomicBool,
}

impl InMemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored variables, all scopes included.
    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.read().is_empty()
    }
}

impl DataWarehouse for InMemoryWarehouse {
    fn put(
        &self,
        label: &VarLabel,
        patch: PatchId,
        material: MaterialId,
        data: Bytes,
    ) -> Result<(), SchedError> {
        self.store
            .write()
            .insert((label.clone(), Some(patch), material), data);
        Ok(())
    }

    fn get(
        &self,
        label: &VarLabel,
        patch: PatchId,
        material: MaterialId,
    ) -> Result<Bytes, SchedError> {
        self.store
            .read()
            .get(&(label.clone(), Some(patch), material))
            .cloned()
            .ok_or_else(|| SchedError::VarNotFound {
                label: label.name().to_owned(),
                patch: Some(patch),
                material,
            })
    }

    fn put_global(
        &self,
        label: &VarLabel,
        material: MaterialId,
        data: Bytes,
    ) -> Result<(), SchedError> {
        self.store
            .write()
            .insert((label.clone(), None, material), data);
        Ok(())
    }

    fn get_global(&self, label: &VarLabel, material: MaterialId) -> Result<Bytes, SchedError> {
        self.store
            .read()
            .get(&(label.clone(), None, material))
            .cloned()
            .ok_or_else(|| SchedError::VarNotFound {
                label: label.name().to_owned(),
                patch: None,
                material,
            })
    }

    fn exists(&self, label: &VarLabel, patch: Option<PatchId>, material: MaterialId) -> bool {
        self.store
            .read()
            .contains_key(&(label.clone(), patch, material))
    }

    fn transfer_from(
        &self,
        other: &dyn DataWarehouse,
        label: &VarLabel,
        patches: &[PatchId],
        materials: &[MaterialId],
    ) -> Result<(), SchedError> {
        for &p in patches {
            for &m in materials {
                let data = other.get(label, p, m)?;
                self.put(label, p, m, data)?;
            }
        }
        Ok(())
    }

    fn abort_timestep(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    fn timestep_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    fn restart_timestep(&self) {
        self.restarted.store(true, Ordering::SeqCst);
    }

    fn timestep_restarted(&self) -> bool {
        self.restarted.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lbl(s: &str) -> VarLabel {
        VarLabel::new(s)
    }

    fn pid(i: u32) -> PatchId {
        PatchId::new(i).unwrap()
    }

    #[test]
    fn put_get_roundtrip() {
        let dw = InMemoryWarehouse::new();
        dw.put_scalars(&lbl("rho"), pid(1), MaterialId(0), &[1.0, 2.0])
            .unwrap();
        let vals = dw.get_scalars(&lbl("rho"), pid(1), MaterialId(0)).unwrap();
        assert_eq!(vals, vec![1.0, 2.0]);
        assert!(dw.exists(&lbl("rho"), Some(pid(1)), MaterialId(0)));
        assert!(!dw.exists(&lbl("rho"), Some(pid(2)), MaterialId(0)));
    }

    #[test]
    fn missing_var_is_an_error() {
        let dw = InMemoryWarehouse::new();
        let err = dw.get(&lbl("rho"), pid(1), MaterialId(0)).unwrap_err();
        assert!(matches!(err, SchedError::VarNotFound { .. }));
    }

    #[test]
    fn global_store_is_separate_from_patches() {
        let dw = InMemoryWarehouse::new();
        dw.put_global(&lbl("flux"), MaterialId(0), scalars_to_bytes(&[3.5]))
            .unwrap();
        assert!(dw.exists(&lbl("flux"), None, MaterialId(0)));
        assert!(!dw.exists(&lbl("flux"), Some(pid(1)), MaterialId(0)));
        let v = bytes_to_scalars(&dw.get_global(&lbl("flux"), MaterialId(0)).unwrap());
        assert_eq!(v, vec![3.5]);
    }

    #[test]
    fn transfer_from_copies_subset() {
        let old = InMemoryWarehouse::new();
        let new = InMemoryWarehouse::new();
        old.put_scalars(&lbl("u"), pid(1), MaterialId(0), &[4.0])
            .unwrap();
        old.put_scalars(&lbl("u"), pid(2), MaterialId(0), &[5.0])
            .unwrap();
        new.transfer_from(&old, &lbl("u"), &[pid(2)], &[MaterialId(0)])
            .unwrap();
        assert!(!new.exists(&lbl("u"), Some(pid(1)), MaterialId(0)));
        assert_eq!(
            new.get_scalars(&lbl("u"), pid(2), MaterialId(0)).unwrap(),
            vec![5.0]
        );
    }

    #[test]
    fn abort_and_restart_flags() {
        let dw = InMemoryWarehouse::new();
        assert!(!dw.timestep_aborted());
        dw.abort_timestep();
        assert!(dw.timestep_aborted());
        assert!(!dw.timestep_restarted());
        dw.restart_timestep();
        assert!(dw.timestep_restarted());
    }

    #[test]
    fn unaligned_payload_decodes() {
        // Bytes sliced at an odd offset must still decode; the helper copies.
        let mut raw = vec![0u8; 1];
        raw.extend_from_slice(bytemuck::cast_slice::<f64, u8>(&[7.25]));
        let b = Bytes::from(raw).slice(1..);
        assert_eq!(bytes_to_scalars(&b), vec![7.25]);
    }
}
