//! Hot reload of the running script
//!
//! Between top-level steps the interpreter asks the watcher whether the
//! script changed. A changed script is re-read and spliced in: steps before
//! the current index stay as executed, everything from the current index on
//! comes from the new document.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use sw_loader::{ScriptDocument, ScriptLoader, Step};
use tracing::{debug, info, trace, warn};

/// Forces a reload at the next step boundary
#[derive(Debug, Clone, Default)]
pub struct ReloadHandle {
    forced: Arc<AtomicBool>,
}

impl ReloadHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a reload even if the fingerprint is unchanged
    pub fn request(&self) {
        self.forced.store(true, Ordering::SeqCst);
    }

    fn take(&self) -> bool {
        self.forced.swap(false, Ordering::SeqCst)
    }
}

/// Tracks the fingerprint of the script a run executes
#[derive(Debug)]
pub struct HotReloadWatcher {
    loader: ScriptLoader,
    reference: String,
    fingerprint: String,
    /// Fingerprint of content that failed to parse
    rejected: Option<String>,
    /// Compare fingerprints, not just honour forced reloads
    polling: bool,
    handle: ReloadHandle,
}

impl HotReloadWatcher {
    pub fn new(
        loader: ScriptLoader,
        reference: impl Into<String>,
        fingerprint: impl Into<String>,
        handle: ReloadHandle,
    ) -> Self {
        Self {
            loader,
            reference: reference.into(),
            fingerprint: fingerprint.into(),
            rejected: None,
            polling: true,
            handle,
        }
    }

    /// Compare fingerprints at each check; when off, only requests made
    /// through the [`ReloadHandle`] trigger a reload
    pub fn polling(mut self, polling: bool) -> Self {
        self.polling = polling;
        self
    }

    /// Fingerprint of the document currently executing
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Whether the script should be re-read
    pub fn check(&mut self) -> bool {
        if self.handle.take() {
            debug!(script = %self.reference, "Reload requested");
            return true;
        }
        if !self.polling {
            return false;
        }
        match self.loader.fingerprint(&self.reference) {
            Ok(current) => {
                current != self.fingerprint && self.rejected.as_deref() != Some(current.as_str())
            }
            Err(e) => {
                trace!(script = %self.reference, error = %e, "Fingerprint unavailable");
                false
            }
        }
    }

    /// Re-read the script
    ///
    /// Returns `None` when the new content cannot be parsed; the run keeps
    /// its current steps and the same content is not tried again.
    pub async fn reload(&mut self) -> Option<ScriptDocument> {
        match self.loader.load_tolerant(&self.reference).await {
            Ok(document) => {
                info!(
                    script = %self.reference,
                    steps = document.steps.len(),
                    "Reloaded script"
                );
                self.fingerprint = document.fingerprint.clone();
                self.rejected = None;
                Some(document)
            }
            Err(e) => {
                warn!(script = %self.reference, error = %e, "Ignoring unparseable script edit");
                self.rejected = self.loader.fingerprint(&self.reference).ok();
                None
            }
        }
    }
}

/// Replace `steps[index..]` with `replacement[index..]`
pub fn splice_from(steps: &mut Vec<Step>, index: usize, replacement: Vec<Step>) {
    steps.truncate(index);
    steps.extend(replacement.into_iter().skip(index));
}
