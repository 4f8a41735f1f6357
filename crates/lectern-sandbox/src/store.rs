// src/store.rs
use crate::error::{SandboxError, SandboxResult};
use crate::model::{Lesson, Submission};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Where the verifier reads submissions and lessons and writes results back.
/// Implementations provide their own concurrency control.
pub trait RecordStore: Send + Sync {
    fn load_submission(&self, id: u64) -> SandboxResult<Submission>;
    fn save_submission(&self, submission: &Submission) -> SandboxResult<()>;
    fn load_lesson(&self, id: u64) -> SandboxResult<Lesson>;
}

/// Records kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    submissions: Mutex<HashMap<u64, Submission>>,
    lessons: Mutex<HashMap<u64, Lesson>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_lesson(&self, lesson: Lesson) {
        lock(&self.lessons).insert(lesson.id, lesson);
    }

    pub fn insert_submission(&self, submission: Submission) {
        lock(&self.submissions).insert(submission.id, submission);
    }

    pub fn submission(&self, id: u64) -> Option<Submission> {
        lock(&self.submissions).get(&id).cloned()
    }
}

impl RecordStore for MemoryStore {
    fn load_submission(&self, id: u64) -> SandboxResult<Submission> {
        self.submission(id)
            .ok_or_else(|| SandboxError::Store(format!("submission {id} not found")))
    }

    fn save_submission(&self, submission: &Submission) -> SandboxResult<()> {
        self.insert_submission(submission.clone());
        Ok(())
    }

    fn load_lesson(&self, id: u64) -> SandboxResult<Lesson> {
        lock(&self.lessons)
            .get(&id)
            .cloned()
            .ok_or_else(|| SandboxError::Store(format!("lesson {id} not found")))
    }
}
