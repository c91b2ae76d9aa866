use std::collections::{HashMap, VecDeque};
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::record::ChunkId;

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Transient,
    Permanent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectedFailure {
    pub class: FailureClass,
    pub message: String,
}

/// Hook for injecting failures into item processing.
///
/// The pipeline consults the injector before running the real processor for each attempt,
/// which keeps chaos-style tests deterministic.
pub trait FailureInjector: Send + Sync + fmt::Debug {
    fn inject(&self, id: ChunkId, attempt: u32) -> Option<InjectedFailure>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoFailures;

impl FailureInjector for NoFailures {
    fn inject(&self, _id: ChunkId, _attempt: u32) -> Option<InjectedFailure> {
        None
    }
}

#[derive(Debug, Clone)]
enum Script {
    Sequence(VecDeque<FailureClass>),
    Always(FailureClass),
}

/// Per-item failure scripts, consumed one entry per attempt.
#[derive(Debug, Default)]
pub struct ScriptedFailures {
    scripts: Mutex<HashMap<ChunkId, Script>>,
}

impl ScriptedFailures {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next attempts on `id` with the given classes, in order, then succeed.
    pub fn fail(self, id: ChunkId, classes: impl IntoIterator<Item = FailureClass>) -> Self {
        self.scripts
            .lock()
            .insert(id, Script::Sequence(classes.into_iter().collect()));
        self
    }

    /// Fail every attempt on `id`.
    pub fn always(self, id: ChunkId, class: FailureClass) -> Self {
        self.scripts.lock().insert(id, Script::Always(class));
        self
    }
}

impl FailureInjector for ScriptedFailures {
    fn inject(&self, id: ChunkId, attempt: u32) -> Option<InjectedFailure> {
        let mut scripts = self.scripts.lock();
        let class = match scripts.get_mut(&id)? {
            Script::Sequence(queue) => queue.pop_front()?,
            Script::Always(class) => *class,
        };
        Some(InjectedFailure {
            class,
            message: format!("injected {class:?} failure for {id} on attempt {attempt}"),
        })
    }
}
