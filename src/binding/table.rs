//! Per-session binding table
//!
//! Registration order is preserved so batched pushes produce deterministic
//! wire traffic. Server pushes carry bare variable names; resolution scans
//! in registration order and the first match wins.

use std::collections::HashMap;

use tracing::debug;

use super::storage::TunableCell;
use super::value::{TunableType, TunableValue};
use crate::utils::error::{ProtocolError, Result, UsageError};

pub(crate) struct VariableBinding {
    cell: TunableCell,
    last_sent: Option<TunableValue>,
    last_received: Option<TunableValue>,
}

impl VariableBinding {
    pub fn name(&self) -> &str {
        self.cell.name()
    }

    pub fn cell(&self) -> &TunableCell {
        &self.cell
    }
}

#[derive(Default)]
pub(crate) struct BindingTable {
    bindings: Vec<VariableBinding>,
    index: HashMap<(String, String), usize>,
    sealed: bool,
}

impl BindingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-registration check, run before the REGISTER_VAR exchange so a
    /// rejected key never reaches the server.
    pub fn check_can_register(&self, bundle: &str, name: &str) -> Result<()> {
        if self.sealed {
            return Err(UsageError::BindingsSealed.into());
        }
        if self
            .index
            .contains_key(&(bundle.to_string(), name.to_string()))
        {
            return Err(UsageError::DuplicateVariable {
                bundle: bundle.to_string(),
                name: name.to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Allocate storage and record the binding. The caller has already run
    /// `check_can_register` and completed the server exchange.
    pub fn register(&mut self, bundle: &str, name: &str, ty: TunableType) -> TunableCell {
        let cell = TunableCell::new(bundle, name, ty);
        self.index
            .insert((bundle.to_string(), name.to_string()), self.bindings.len());
        self.bindings.push(VariableBinding {
            cell: cell.clone(),
            last_sent: None,
            last_received: None,
        });
        cell
    }

    /// Close the binding set; first barrier or performance report does this.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VariableBinding> {
        self.bindings.iter()
    }

    /// Find the binding backing an application-held cell handle.
    pub fn find_cell(&mut self, cell: &TunableCell) -> Option<&mut VariableBinding> {
        self.bindings
            .iter_mut()
            .find(|b| b.cell.is_same_cell(cell))
    }

    /// Current value of every binding, in registration order.
    pub fn all_values(&self) -> Vec<(String, TunableValue)> {
        self.bindings
            .iter()
            .map(|b| (b.cell.name().to_string(), b.cell.value()))
            .collect()
    }

    /// Bindings whose current value differs from the last one sent, in
    /// registration order. A never-sent binding is always dirty.
    pub fn dirty_values(&self) -> Vec<(String, TunableValue)> {
        self.bindings
            .iter()
            .filter(|b| b.last_sent.as_ref() != Some(&b.cell.value()))
            .map(|b| (b.cell.name().to_string(), b.cell.value()))
            .collect()
    }

    /// Record that `value` was pushed to the server for `name`.
    pub fn mark_sent(&mut self, name: &str, value: &TunableValue) {
        if let Some(b) = self.bindings.iter_mut().find(|b| b.cell.name() == name) {
            b.last_sent = Some(value.clone());
        }
    }

    /// Apply one server-chosen value. Returns false when the name is not
    /// registered here (ignored for forward compatibility). A value of the
    /// wrong type is a protocol error and leaves the binding untouched.
    pub fn apply(&mut self, name: &str, value: TunableValue) -> Result<bool> {
        let binding = match self.bindings.iter_mut().find(|b| b.cell.name() == name) {
            Some(b) => b,
            None => return Ok(false),
        };
        if value.tunable_type() != binding.cell.tunable_type() {
            return Err(ProtocolError::TypeMismatch {
                variable: name.to_string(),
                expected: binding.cell.tunable_type(),
                actual: value.tunable_type(),
            }
            .into());
        }
        if binding.last_received.as_ref() == Some(&value) {
            debug!("server repeated its previous value for {}", name);
        }
        binding.cell.store(value.clone());
        // The server-chosen value is now current on both sides; without this
        // the next barrier would re-push every applied value as dirty.
        binding.last_sent = Some(value.clone());
        binding.last_received = Some(value);
        Ok(true)
    }
}
