// src/verify.rs
use crate::config::{Backend, SandboxConfig};
use crate::error::{SandboxError, SandboxResult};
use crate::exec::{self, Execution};
use crate::jail::Jail;
use crate::language::{Language, Registry};
use crate::model::{
    CheckResults, CheckSet, Lesson, ProgrammingStep, Status, Step, Submission, SubmittedKind,
    SubmittedProgram,
};
use crate::system::{HostJails, JailSystem};
use std::fs;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// CRLF to LF, surrounding whitespace trimmed. Applied to inputs, expected
/// outputs and captured outputs alike.
pub fn normalize(text: &str) -> String {
    text.replace("\r\n", "\n").trim().to_string()
}

/// Compiles and runs programming steps in throwaway jails and scores them.
pub struct Verifier {
    system: Arc<dyn JailSystem>,
    config: SandboxConfig,
    registry: Registry,
}

impl Verifier {
    /// Fails if the configuration is invalid or, for a confining backend, if
    /// the jail template is missing.
    pub fn new(system: Arc<dyn JailSystem>, config: SandboxConfig, registry: Registry) -> SandboxResult<Self> {
        config.validate()?;
        if system.isolates() && !config.template.is_dir() {
            return Err(SandboxError::Template(config.template.clone()));
        }
        fs::create_dir_all(config.containers_dir())?;
        fs::create_dir_all(config.envs_dir())?;
        info!(
            "Verifier using {} backend under {} ({} languages)",
            system.name(),
            config.root.display(),
            registry.available().count()
        );
        Ok(Self {
            system,
            config,
            registry,
        })
    }

    /// Pick the backend and registry named by `config`.
    pub fn from_config(config: SandboxConfig) -> SandboxResult<Self> {
        let registry = match &config.languages {
            Some(path) => Registry::load(path)?,
            None => Registry::defaults(),
        };
        let system: Arc<dyn JailSystem> = match config.backend {
            Backend::Host => Arc::new(HostJails::new()),
            #[cfg(target_os = "freebsd")]
            Backend::Jail => Arc::new(crate::system::FreeBsdJails::new()),
            #[cfg(not(target_os = "freebsd"))]
            Backend::Jail => {
                return Err(SandboxError::InvalidConfig(
                    "the jail backend is only available on FreeBSD".into(),
                ));
            }
        };
        Self::new(system, config, registry)
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Run the EXAMPLES set, stopping at the first failure. Returns whether
    /// every example passed.
    pub fn validate_draft(&self, program: &mut SubmittedProgram, step: &ProgrammingStep) -> bool {
        self.verify_program(program, step, CheckSet::Examples);
        program.error.is_empty() && program.examples.all_passed()
    }

    /// Score every step of `submission` against `lesson`. Programming steps
    /// run the TESTS set; skipped ones are left unscored.
    pub fn verify_submission(&self, submission: &mut Submission, lesson: &Lesson) -> SandboxResult<()> {
        if submission.steps.len() != lesson.steps.len() {
            return Err(SandboxError::Mismatch(format!(
                "{} steps submitted, lesson {} has {}",
                submission.steps.len(),
                lesson.id,
                lesson.steps.len()
            )));
        }
        for (i, (submitted, step)) in submission.steps.iter().zip(&lesson.steps).enumerate() {
            let same_kind = matches!(
                (&submitted.kind, step),
                (SubmittedKind::Test(_), Step::Test(_)) | (SubmittedKind::Programming(_), Step::Programming(_))
            );
            if !same_kind {
                return Err(SandboxError::Mismatch(format!("step {i} has the wrong type")));
            }
        }

        info!("Verifying submission {} (lesson {})", submission.id, lesson.id);
        submission.status = Status::InProgress;
        for (submitted, step) in submission.steps.iter_mut().zip(&lesson.steps) {
            match (&mut submitted.kind, step) {
                (SubmittedKind::Test(test), Step::Test(step)) => {
                    test.grade(step);
                    submitted.flags.passed = test.score() as usize == step.questions.len();
                }
                (SubmittedKind::Programming(program), Step::Programming(step)) => {
                    if submitted.flags.skipped {
                        program.status = Status::Done;
                        continue;
                    }
                    self.verify_program(program, step, CheckSet::Tests);
                    submitted.flags.passed = program.error.is_empty() && program.tests.all_passed();
                }
                _ => {}
            }
        }
        submission.status = Status::Done;
        info!("Submission {} scored {}", submission.id, submission.score());
        Ok(())
    }

    /// Compile and run `program` against one check set of `step`, recording
    /// per-case results. Always finishes with the program DONE; failures end
    /// up in the messages and `error`, never as an `Err`.
    pub fn verify_program(&self, program: &mut SubmittedProgram, step: &ProgrammingStep, set: CheckSet) {
        let checks = step.checks(set);
        program.status = Status::InProgress;
        program.error.clear();
        *program.results_mut(set) = CheckResults::pending(checks.len());

        let outcome = self
            .registry
            .get(&program.language)
            .map_err(|e| e.to_string())
            .and_then(|lang| self.run_in_jail(lang, program, step, set));
        if let Err(message) = outcome {
            debug!("step {:?} failed: {}", step.name, message);
            program.results_mut(set).fail_all(&message);
            program.error = message;
        }
        program.status = Status::Done;
    }

    fn run_in_jail(
        &self,
        lang: &Language,
        program: &mut SubmittedProgram,
        step: &ProgrammingStep,
        set: CheckSet,
    ) -> Result<(), String> {
        let mut jail = Jail::create(
            self.system.clone(),
            &self.config.root,
            &self.config.template,
            &self.config.limits,
        )
        .map_err(|e| format!("failed to prepare sandbox: {e}"))?;

        let outcome = self.evaluate(&mut jail, lang, program, step, set);
        let failures = jail.destroy();
        if !failures.is_empty() {
            warn!("{} cleanup step(s) failed after {:?}", failures.len(), step.name);
        }
        outcome
    }

    fn evaluate(
        &self,
        jail: &mut Jail,
        lang: &Language,
        program: &mut SubmittedProgram,
        step: &ProgrammingStep,
        set: CheckSet,
    ) -> Result<(), String> {
        jail.place(&lang.source_file, program.solution.as_bytes())
            .map_err(|e| format!("failed to prepare sandbox: {e}"))?;
        if let Some(executable) = lang.artifacts().get(1) {
            jail.track(executable);
        }

        if lang.compiles() {
            self.compile(jail, lang)?;
        }
        jail.protect().map_err(|e| format!("failed to run program: {e}"))?;

        let run = lang.run_command();
        let results = program.results_mut(set);
        for (i, check) in step.checks(set).iter().enumerate() {
            match self.run_case(jail, &run, &check.input) {
                Ok(actual) => {
                    let expected = normalize(&check.output);
                    if actual == expected {
                        results.pass(i);
                    } else {
                        results.fail(i, format!("expected {expected}, got {actual}"));
                    }
                }
                Err(message) => results.fail(i, message),
            }
            if set == CheckSet::Examples && results.scores[i] == 0 {
                break;
            }
        }
        Ok(())
    }

    fn compile(&self, jail: &Jail, lang: &Language) -> Result<(), String> {
        let command = jail
            .command(&lang.compile_command())
            .map_err(|e| format!("failed to compile program: {e}"))?;
        let run = exec::run(command, None, self.config.compile_timeout(), self.config.output_limit)
            .map_err(|e| format!("failed to compile program: {e}"))?;
        if run.timed_out {
            return Err(format!(
                "failed to compile program: exceeded compilation timeout of {} seconds",
                self.config.compile_timeout_secs
            ));
        }
        if !run.status.success() {
            return Err(format!("failed to compile program: {}", failure_detail(&run)));
        }
        Ok(())
    }

    /// Normalized output of one successful run, or the failure message.
    fn run_case(&self, jail: &Jail, argv: &[String], input: &str) -> Result<String, String> {
        let mut stdin = normalize(input);
        if !stdin.is_empty() {
            stdin.push('\n');
        }
        let command = jail
            .command(argv)
            .map_err(|e| format!("failed to run program: {e}"))?;
        let run = exec::run(command, Some(stdin.as_bytes()), self.config.run_timeout(), self.config.output_limit)
            .map_err(|e| format!("failed to run program: {e}"))?;
        if run.timed_out {
            return Err(format!(
                "failed to run program: exceeded timeout of {} seconds",
                self.config.run_timeout_secs
            ));
        }
        if !run.status.success() {
            return Err(format!("failed to run program: {}", failure_detail(&run)));
        }
        Ok(normalize(&run.output_text()))
    }
}

/// The captured output, or the exit status when there was none.
fn failure_detail(run: &Execution) -> String {
    let output = normalize(&run.output_text());
    if output.is_empty() {
        run.status.to_string()
    } else {
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_crlf_and_whitespace() {
        assert_eq!(normalize("  bbb\r\n"), "bbb");
        assert_eq!(normalize("a\r\nb\r\n\r\n"), "a\nb");
        assert_eq!(normalize("\n\t"), "");
    }

    #[test]
    fn missing_template_is_fatal_for_confining_backends() {
        struct Confining;
        impl JailSystem for Confining {
            fn name(&self) -> &'static str {
                "confining"
            }
            fn isolates(&self) -> bool {
                true
            }
            fn mount(&self, _: &std::path::Path, _: &std::path::Path, _: bool) -> std::io::Result<()> {
                Ok(())
            }
            fn unmount(&self, _: &std::path::Path) -> std::io::Result<()> {
                Ok(())
            }
            fn create_jail(&self, _: &str, _: &std::path::Path) -> std::io::Result<i32> {
                Ok(1)
            }
            fn remove_jail(&self, _: i32) -> std::io::Result<()> {
                Ok(())
            }
            fn add_rule(&self, _: &str) -> std::io::Result<()> {
                Ok(())
            }
            fn remove_rules(&self, _: &str) -> std::io::Result<()> {
                Ok(())
            }
            fn protect(&self, _: i32) -> std::io::Result<()> {
                Ok(())
            }
            fn confine(&self, _: i32, _: &std::path::Path, _: &mut std::process::Command) {}
        }

        let root = tempfile::tempdir().unwrap();
        let config = SandboxConfig::default().root(root.path());
        let err = Verifier::new(Arc::new(Confining), config.clone(), Registry::defaults()).err();
        assert!(matches!(err, Some(SandboxError::Template(_))));

        fs::create_dir_all(&config.template).unwrap();
        assert!(Verifier::new(Arc::new(Confining), config, Registry::defaults()).is_ok());
    }

    #[cfg(not(target_os = "freebsd"))]
    #[test]
    fn jail_backend_needs_freebsd() {
        let root = tempfile::tempdir().unwrap();
        let config = SandboxConfig::default().root(root.path()).backend(Backend::Jail);
        assert!(matches!(Verifier::from_config(config), Err(SandboxError::InvalidConfig(_))));
    }
}
