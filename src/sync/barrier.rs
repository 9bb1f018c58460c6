//! Request-all synchronization barrier
//!
//! The central synchronization primitive: push local state, ask for a fresh
//! assignment, and block until the server has supplied a value for every
//! registered variable or the session fails. No variable is readable with a
//! stale value after a successful return, and no partial application is
//! observable to the caller.

use std::collections::HashSet;

use tracing::debug;

use crate::client::session::Session;
use crate::sync::dispatcher;
use crate::utils::error::{Result, TuningError};
use crate::utils::wire::Message;

pub(crate) fn request_all(session: &mut Session) -> Result<()> {
    session.ensure_active()?;
    // First barrier closes the binding set
    session.bindings.seal();

    // Apply staged asynchronous batches first, so the delta push below
    // reflects values the server already chose.
    dispatcher::apply_staged(session)?;

    // Step 1: delta push. The server's search state must see the latest
    // locally-measured configuration before being asked for a new one.
    let dirty = session.bindings.dirty_values();
    if !dirty.is_empty() {
        debug!("barrier: delta push of {} variables", dirty.len());
        session.send(&Message::SetAll {
            values: dirty.clone(),
        })?;
        for (name, value) in &dirty {
            session.bindings.mark_sent(name, value);
        }
    }

    // Step 2/3: request, then block for the reply batch.
    session.send(&Message::RequestAll)?;
    let batch = session.await_value_push()?;

    // Step 4: apply, resolving by name against our own table. Names the
    // server knows but we never registered are skipped.
    let mut covered: HashSet<String> = HashSet::with_capacity(batch.len());
    for (name, value) in batch {
        let applied = session.bindings.apply(&name, value);
        match applied {
            Ok(true) => {
                covered.insert(name);
            }
            Ok(false) => debug!("barrier: ignoring unregistered variable {}", name),
            Err(e) => return session.check_fatal(Err(e)),
        }
    }

    // Step 5: a reply that skipped registered variables is reported, but
    // what did arrive stays applied and the omitted bindings keep their
    // prior values.
    let missing: Vec<String> = session
        .bindings
        .iter()
        .map(|b| b.name().to_string())
        .filter(|name| !covered.contains(name))
        .collect();
    if !missing.is_empty() {
        return Err(TuningError::IncompleteUpdate { missing });
    }

    debug!(
        "barrier: applied {} of {} variables",
        covered.len(),
        session.bindings.len()
    );
    Ok(())
}
