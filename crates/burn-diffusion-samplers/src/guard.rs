//! Cancellation and NaN guarding for sampling runs

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use burn::prelude::*;
use tracing::span::EnteredSpan;

use crate::error::NetworkError;
use crate::lifecycle::CancelHook;

// ============================================================================
// Preview cadence
// ============================================================================

/// Whether step `i` hands a decoded preview to the feedback callback
///
/// Previews are sparse early in the run and continuous in the second half.
pub fn should_preview(i: usize, start_step: usize, steps: usize) -> bool {
    i > start_step.max(steps / 2) || i % 2 == 1
}

/// Whether the preview of step `i` is scanned for NaN
pub fn should_scan_preview(i: usize) -> bool {
    i % 5 == 4
}

// ============================================================================
// NaN scan
// ============================================================================

/// Non-finite value counts of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FiniteScan {
    pub nan: usize,
    pub inf: usize,
    pub total: usize,
}

impl FiniteScan {
    pub fn has_nan(&self) -> bool {
        self.nan > 0
    }
}

/// Read a tensor back and count NaN / Inf values
pub fn scan_tensor<B: Backend, const D: usize>(
    tensor: &Tensor<B, D>,
) -> Result<FiniteScan, NetworkError> {
    let floats = tensor
        .clone()
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| NetworkError::Readback(format!("{:?}", err)))?;
    Ok(FiniteScan {
        nan: floats.iter().filter(|x| x.is_nan()).count(),
        inf: floats.iter().filter(|x| x.is_infinite()).count(),
        total: floats.len(),
    })
}

/// True if any element is NaN; logs the counts when it is
pub fn contains_nan<B: Backend, const D: usize>(
    tensor: &Tensor<B, D>,
    name: &str,
) -> Result<bool, NetworkError> {
    let scan = scan_tensor(tensor)?;
    if scan.has_nan() {
        tracing::warn!(
            name,
            nan = scan.nan,
            inf = scan.inf,
            total = scan.total,
            "NaN check failed"
        );
    }
    Ok(scan.has_nan())
}

// ============================================================================
// Cancellation
// ============================================================================

#[derive(Default)]
struct TokenState {
    cancelled: AtomicBool,
    hook: Mutex<Option<CancelHook>>,
}

/// Cross-thread cancellation of a sampling run
///
/// Cancelling marks the token and interrupts the hot network through its
/// registered cancel hook. The run notices before its next step.
#[derive(Clone, Default)]
pub struct CancellationToken {
    state: Arc<TokenState>,
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
        let hook = self.state.hook.lock().ok().and_then(|hook| hook.clone());
        if let Some(hook) = hook {
            hook();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    fn register(&self, hook: Option<CancelHook>) {
        if let Ok(mut slot) = self.state.hook.lock() {
            *slot = hook;
        }
    }
}

/// Scope of one sampling run
///
/// Holds the run's tracing span and the cancel hook registration; both are
/// released when the guard drops, whichever way the run exits.
pub struct RunGuard {
    token: Option<CancellationToken>,
    _span: EnteredSpan,
}

impl RunGuard {
    pub fn new(
        sampler: &'static str,
        steps: usize,
        token: Option<&CancellationToken>,
        hook: Option<CancelHook>,
    ) -> Self {
        let span = tracing::info_span!("sample", sampler, steps).entered();
        let token = token.cloned();
        if let Some(token) = &token {
            token.register(hook);
        }
        Self { token, _span: span }
    }

    /// Point cancellation at a different network (after a refiner switch)
    pub fn rebind(&self, hook: Option<CancelHook>) {
        if let Some(token) = &self.token {
            token.register(hook);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.as_ref().is_some_and(CancellationToken::is_cancelled)
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if let Some(token) = &self.token {
            token.register(None);
        }
    }
}
