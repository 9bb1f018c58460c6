//! Library-owned variable storage
//!
//! Each registered variable gets a `TunableCell`: a typed storage slot owned
//! by the library and handed to the application as a cloneable handle. The
//! cell carries its own lock, so an application read can never observe a
//! half-written value while the session applies a server batch.

use std::sync::Arc;

use parking_lot::Mutex;

use super::value::{TunableType, TunableValue};
use crate::utils::error::{ProtocolError, Result};

struct CellInner {
    bundle: String,
    name: String,
    ty: TunableType,
    value: Mutex<TunableValue>,
}

/// Handle to the storage of one tunable variable
///
/// Cloning the handle does not clone the storage; all clones read and write
/// the same slot.
#[derive(Clone)]
pub struct TunableCell {
    inner: Arc<CellInner>,
}

impl TunableCell {
    pub(crate) fn new(bundle: &str, name: &str, ty: TunableType) -> Self {
        Self {
            inner: Arc::new(CellInner {
                bundle: bundle.to_string(),
                name: name.to_string(),
                ty,
                value: Mutex::new(TunableValue::zero(ty)),
            }),
        }
    }

    pub fn bundle(&self) -> &str {
        &self.inner.bundle
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn tunable_type(&self) -> TunableType {
        self.inner.ty
    }

    /// Snapshot of the current value
    pub fn value(&self) -> TunableValue {
        self.inner.value.lock().clone()
    }

    /// Write a new value. Fails with a type mismatch if the value's type does
    /// not match the declared type; the cell is left unchanged.
    pub fn set(&self, value: TunableValue) -> Result<()> {
        if value.tunable_type() != self.inner.ty {
            return Err(ProtocolError::TypeMismatch {
                variable: self.inner.name.clone(),
                expected: self.inner.ty,
                actual: value.tunable_type(),
            }
            .into());
        }
        *self.inner.value.lock() = value;
        Ok(())
    }

    pub fn get_i64(&self) -> Option<i64> {
        self.inner.value.lock().as_i64()
    }

    pub fn get_f64(&self) -> Option<f64> {
        self.inner.value.lock().as_f64()
    }

    pub fn get_string(&self) -> Option<String> {
        self.inner.value.lock().as_str().map(str::to_string)
    }

    pub fn get_blob(&self) -> Option<Vec<u8>> {
        self.inner.value.lock().as_bytes().map(<[u8]>::to_vec)
    }

    pub fn set_i64(&self, v: i64) -> Result<()> {
        self.set(TunableValue::Int(v))
    }

    pub fn set_f64(&self, v: f64) -> Result<()> {
        self.set(TunableValue::Double(v))
    }

    pub fn set_string(&self, v: impl Into<String>) -> Result<()> {
        self.set(TunableValue::Str(v.into()))
    }

    pub fn set_blob(&self, v: Vec<u8>) -> Result<()> {
        self.set(TunableValue::Blob(v))
    }

    /// Apply path for server-chosen values; the caller has already checked
    /// the type against the registered binding.
    pub(crate) fn store(&self, value: TunableValue) {
        *self.inner.value.lock() = value;
    }

    /// Identity comparison for handle lookup
    pub(crate) fn is_same_cell(&self, other: &TunableCell) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for TunableCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunableCell")
            .field("bundle", &self.inner.bundle)
            .field("name", &self.inner.name)
            .field("type", &self.inner.ty)
            .field("value", &*self.inner.value.lock())
            .finish()
    }
}
