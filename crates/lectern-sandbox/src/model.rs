// src/model.rs
//! Lessons, submissions and their scores, as stored by the record store.

use serde::{Deserialize, Serialize};

/// One (input, expected output) pair of a programming step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Check {
    pub input: String,
    pub output: String,
}

impl Check {
    pub fn new(input: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub text: String,
    pub answers: Vec<String>,
    /// Indices into `answers`.
    pub correct: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestStep {
    pub name: String,
    pub questions: Vec<Question>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgrammingStep {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Shown to the student and run when validating a draft.
    pub examples: Vec<Check>,
    /// Hidden; these produce the score.
    pub tests: Vec<Check>,
}

/// Which check set a verification run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckSet {
    /// Stops at the first failing case.
    Examples,
    /// Runs every case.
    Tests,
}

impl ProgrammingStep {
    pub fn checks(&self, set: CheckSet) -> &[Check] {
        match set {
            CheckSet::Examples => &self.examples,
            CheckSet::Tests => &self.tests,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Step {
    Test(TestStep),
    Programming(ProgrammingStep),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lesson {
    pub id: u64,
    pub name: String,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Pending,
    InProgress,
    Done,
}

/// Per-case scores (0 or 1) and messages ("" on success).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResults {
    pub scores: Vec<u32>,
    pub messages: Vec<String>,
}

impl CheckResults {
    /// `n` failing entries with empty messages.
    pub fn pending(n: usize) -> Self {
        Self {
            scores: vec![0; n],
            messages: vec![String::new(); n],
        }
    }

    pub fn pass(&mut self, i: usize) {
        self.scores[i] = 1;
        self.messages[i].clear();
    }

    pub fn fail(&mut self, i: usize, message: impl Into<String>) {
        self.scores[i] = 0;
        self.messages[i] = message.into();
    }

    /// Fail every entry with the same message.
    pub fn fail_all(&mut self, message: &str) {
        for i in 0..self.scores.len() {
            self.fail(i, message);
        }
    }

    pub fn total(&self) -> u32 {
        self.scores.iter().sum()
    }

    pub fn all_passed(&self) -> bool {
        self.scores.iter().all(|s| *s == 1)
    }

    pub fn clear(&mut self) {
        self.scores.clear();
        self.messages.clear();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedTest {
    /// Selected answer indices, one list per question.
    pub answers: Vec<Vec<usize>>,
    #[serde(default)]
    pub scores: Vec<u32>,
}

impl SubmittedTest {
    /// Score each question: 1 when the selection equals the correct set.
    pub fn grade(&mut self, step: &TestStep) {
        self.scores = step
            .questions
            .iter()
            .enumerate()
            .map(|(i, q)| match self.answers.get(i) {
                Some(selected) => u32::from(same_set(selected, &q.correct)),
                None => 0,
            })
            .collect();
    }

    pub fn score(&self) -> u32 {
        self.scores.iter().sum()
    }
}

/// Order-independent comparison; sizes must match.
fn same_set(a: &[usize], b: &[usize]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort_unstable();
    b.sort_unstable();
    a == b
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedProgram {
    pub language: String,
    pub solution: String,
    #[serde(default)]
    pub examples: CheckResults,
    #[serde(default)]
    pub tests: CheckResults,
    /// Set when a whole stage failed (sandbox setup, compilation).
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub status: Status,
}

impl SubmittedProgram {
    pub fn new(language: impl Into<String>, solution: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            solution: solution.into(),
            ..Self::default()
        }
    }

    pub fn results(&self, set: CheckSet) -> &CheckResults {
        match set {
            CheckSet::Examples => &self.examples,
            CheckSet::Tests => &self.tests,
        }
    }

    pub fn results_mut(&mut self, set: CheckSet) -> &mut CheckResults {
        match set {
            CheckSet::Examples => &mut self.examples,
            CheckSet::Tests => &mut self.tests,
        }
    }

    pub fn score(&self) -> u32 {
        self.tests.total()
    }

    fn reset(&mut self) {
        self.examples.clear();
        self.tests.clear();
        self.error.clear();
        self.status = Status::Pending;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SubmittedKind {
    Test(SubmittedTest),
    Programming(SubmittedProgram),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFlags {
    pub skipped: bool,
    pub draft: bool,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedStep {
    #[serde(default)]
    pub flags: StepFlags,
    #[serde(flatten)]
    pub kind: SubmittedKind,
}

impl SubmittedStep {
    pub fn test(answers: Vec<Vec<usize>>) -> Self {
        Self {
            flags: StepFlags::default(),
            kind: SubmittedKind::Test(SubmittedTest {
                answers,
                scores: Vec::new(),
            }),
        }
    }

    pub fn programming(language: impl Into<String>, solution: impl Into<String>) -> Self {
        Self {
            flags: StepFlags::default(),
            kind: SubmittedKind::Programming(SubmittedProgram::new(language, solution)),
        }
    }

    pub fn skipped(mut self) -> Self {
        self.flags.skipped = true;
        self
    }

    /// Skipped steps count for nothing.
    pub fn score(&self) -> u32 {
        if self.flags.skipped {
            return 0;
        }
        match &self.kind {
            SubmittedKind::Test(t) => t.score(),
            SubmittedKind::Programming(p) => p.score(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub id: u64,
    pub user_id: u64,
    pub lesson_id: u64,
    #[serde(default)]
    pub status: Status,
    pub steps: Vec<SubmittedStep>,
}

impl Submission {
    pub fn score(&self) -> u32 {
        self.steps.iter().map(SubmittedStep::score).sum()
    }

    /// Drop every previous result so the whole pipeline runs again.
    pub fn reset_for_recheck(&mut self) {
        self.status = Status::Pending;
        for step in &mut self.steps {
            step.flags.passed = false;
            match &mut step.kind {
                SubmittedKind::Test(t) => t.scores.clear(),
                SubmittedKind::Programming(p) => p.reset(),
            }
        }
    }
}
