//! Script loading and resolution
//!
//! Resolution rules:
//! - `extends`: each parent is resolved recursively; parent steps come before
//!   the document's own steps (plain concatenation, no merging of individual
//!   steps). `setup` is parent-first, `teardown` child-first. `params` and
//!   `variables` merge with the child's keys winning.
//! - top-level `include`: each reference becomes a composed step placed after
//!   the inherited steps and before the document's own steps.
//! - step-level `include`/`compose`: loaded recursively and inlined at the
//!   call site as a composed step.

use crate::document::{IncludeRef, RawDocument, ScriptDocument};
use crate::error::{LoaderError, LoaderResult};
use crate::parse::{ComposeResolver, StepParser};
use crate::source::{fingerprint_of, ScriptSource};
use crate::step::{Composition, Section, Step, StepKind, StepOrigin};
use dashmap::DashSet;
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Default number of reads before a parse failure is reported
pub const DEFAULT_READ_ATTEMPTS: u32 = 3;

/// Default delay between reads
pub const DEFAULT_READ_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Loads scripts from a [`ScriptSource`] and resolves composition
#[derive(Clone)]
pub struct ScriptLoader {
    source: Arc<dyn ScriptSource>,
    /// References read successfully at least once
    seen: Arc<DashSet<String>>,
    read_attempts: u32,
    read_retry_delay: Duration,
}

impl std::fmt::Debug for ScriptLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptLoader")
            .field("read_attempts", &self.read_attempts)
            .field("read_retry_delay", &self.read_retry_delay)
            .field("seen", &self.seen.len())
            .finish_non_exhaustive()
    }
}

impl ScriptLoader {
    /// Create a loader over a source
    pub fn new(source: Arc<dyn ScriptSource>) -> Self {
        Self {
            source,
            seen: Arc::new(DashSet::new()),
            read_attempts: DEFAULT_READ_ATTEMPTS,
            read_retry_delay: DEFAULT_READ_RETRY_DELAY,
        }
    }

    /// Configure how often [`load_tolerant`](Self::load_tolerant) re-reads
    pub fn with_read_retries(mut self, attempts: u32, delay: Duration) -> Self {
        self.read_attempts = attempts.max(1);
        self.read_retry_delay = delay;
        self
    }

    /// The underlying source
    pub fn source(&self) -> &Arc<dyn ScriptSource> {
        &self.source
    }

    /// Check if a script exists
    pub fn exists(&self, reference: &str) -> bool {
        self.source.exists(reference)
    }

    /// Current fingerprint of a script
    pub fn fingerprint(&self, reference: &str) -> LoaderResult<String> {
        self.source.fingerprint(reference)
    }

    /// Load and fully resolve a script
    #[instrument(skip(self))]
    pub fn load(&self, reference: &str) -> LoaderResult<ScriptDocument> {
        let document = Resolution::new(self).document(reference)?;
        debug!(
            script = %reference,
            steps = document.steps.len(),
            setup = document.setup.len(),
            teardown = document.teardown.len(),
            "Loaded script"
        );
        Ok(document)
    }

    /// Load a script, re-reading on transient failures
    ///
    /// A script that is being rewritten may be observed half-written, or
    /// briefly missing while an editor replaces the file. Such reads are
    /// retried after a short delay before the error is reported.
    pub async fn load_tolerant(&self, reference: &str) -> LoaderResult<ScriptDocument> {
        let mut attempt = 1;
        loop {
            match self.load(reference) {
                Ok(document) => return Ok(document),
                Err(e) if self.may_recover(&e) && attempt < self.read_attempts => {
                    warn!(
                        script = %reference,
                        attempt,
                        error = %e,
                        "Script unreadable, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(self.read_retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Whether another read may succeed where this one failed
    ///
    /// A missing script counts only when it was read before; a reference that
    /// never existed is reported at once.
    fn may_recover(&self, err: &LoaderError) -> bool {
        match err {
            LoaderError::NotFound { reference } => self.seen.contains(reference),
            other => other.is_transient(),
        }
    }

    /// Build a composed step invoking a script by name
    ///
    /// Used when an action identifier names a script rather than a built-in.
    #[instrument(skip(self, params))]
    pub fn resolve_composition(
        &self,
        script: &str,
        params: Map<String, Value>,
    ) -> LoaderResult<Composition> {
        Resolution::new(self).compose(&IncludeRef {
            script: script.to_string(),
            params,
        })
    }
}

/// State of one resolution pass
struct Resolution<'a> {
    loader: &'a ScriptLoader,
    /// Documents currently being resolved, for cycle detection
    stack: RefCell<Vec<String>>,
}

impl<'a> Resolution<'a> {
    fn new(loader: &'a ScriptLoader) -> Self {
        Self {
            loader,
            stack: RefCell::new(Vec::new()),
        }
    }

    fn document(&self, reference: &str) -> LoaderResult<ScriptDocument> {
        {
            let mut stack = self.stack.borrow_mut();
            if stack.iter().any(|r| r == reference) {
                let mut chain = stack.clone();
                chain.push(reference.to_string());
                return Err(LoaderError::CircularReference {
                    chain: chain.join(" -> "),
                });
            }
            stack.push(reference.to_string());
        }

        let result = self.resolve(reference);
        self.stack.borrow_mut().pop();
        result
    }

    fn resolve(&self, reference: &str) -> LoaderResult<ScriptDocument> {
        let content = self.loader.source.load(reference)?;
        self.loader.seen.insert(reference.to_string());
        let fingerprint = fingerprint_of(&content);
        let raw = RawDocument::parse(reference, &content)?;
        let parser = StepParser::new(reference, self);

        let mut params = indexmap::IndexMap::new();
        let mut variables = indexmap::IndexMap::new();
        let mut setup = Vec::new();
        let mut steps = Vec::new();
        let mut inherited_teardown = Vec::new();

        for parent in &raw.extends {
            debug!(script = %reference, parent = %parent, "Resolving parent script");
            let parent = self.document(parent)?;
            params.extend(parent.params);
            variables.extend(parent.variables);
            setup.extend(parent.setup);
            steps.extend(parent.steps);
            inherited_teardown.push(parent.teardown);
        }
        params.extend(raw.params);
        variables.extend(raw.variables);

        setup.extend(with_origin(
            parser.parse_list("setup", &raw.setup)?,
            reference,
            Section::Setup,
        ));

        for (i, include) in raw.include.iter().enumerate() {
            let include = IncludeRef::from_value(include).ok_or_else(|| {
                LoaderError::step(reference, &format!("include[{}]", i), "must name a script")
            })?;
            steps.push(Step::new(StepKind::Compose(self.compose(&include)?)));
        }

        steps.extend(with_origin(
            parser.parse_list("steps", &raw.steps)?,
            reference,
            Section::Steps,
        ));

        let mut teardown = with_origin(
            parser.parse_list("teardown", &raw.teardown)?,
            reference,
            Section::Teardown,
        );
        teardown.extend(inherited_teardown.into_iter().flatten());

        Ok(ScriptDocument {
            reference: reference.to_string(),
            name: raw.name.unwrap_or_else(|| reference.to_string()),
            description: raw.description,
            params,
            variables,
            setup,
            steps,
            teardown,
            extends: raw.extends,
            fingerprint,
        })
    }
}

impl ComposeResolver for Resolution<'_> {
    fn compose(&self, include: &IncludeRef) -> LoaderResult<Composition> {
        let document = self.document(&include.script)?;

        if let Some(missing) = document
            .required_params()
            .find(|name| !include.params.contains_key(*name))
        {
            return Err(LoaderError::MissingParameter {
                reference: include.script.clone(),
                param: missing.to_string(),
            });
        }

        let defaults: Map<String, Value> = document
            .params
            .into_iter()
            .filter(|(_, v)| !v.is_null())
            .chain(document.variables)
            .collect();

        let mut steps = document.setup;
        steps.extend(document.steps);

        Ok(Composition {
            script: include.script.clone(),
            params: include.params.clone(),
            defaults,
            steps,
            teardown: document.teardown,
        })
    }
}

fn with_origin(steps: Vec<Step>, reference: &str, section: Section) -> Vec<Step> {
    steps
        .into_iter()
        .enumerate()
        .map(|(index, mut step)| {
            step.origin = Some(StepOrigin {
                script: reference.to_string(),
                section,
                index,
            });
            step
        })
        .collect()
}
