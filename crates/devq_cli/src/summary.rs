//! Emitters of a finished run: a terminal summary and a JSON verdict file.

use std::{
    fs,
    io::{self, Write},
    path::PathBuf,
};

use devq_scheduler::{
    report::{EmitError, ReportEmitter},
    result::{LostReason, LostTest, RunResult, Verdict},
};
use termcolor::{Color, ColorSpec, WriteColor};

pub struct SummaryEmitter<W> {
    writer: W,
}

impl<W: WriteColor + Send> SummaryEmitter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: WriteColor + Send> ReportEmitter for SummaryEmitter<W> {
    fn emit(&mut self, result: &RunResult) -> Result<(), EmitError> {
        write_summary(&mut self.writer, result)?;
        self.writer.flush()?;
        Ok(())
    }
}

fn plural(n: u32) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or_default()
}

fn describe_lost(test: &LostTest) -> String {
    let reason = match &test.reason {
        LostReason::NeverReported => "never reported".to_owned(),
        LostReason::RetriesExhausted => "retries exhausted".to_owned(),
        LostReason::DispatchFailed { detail } => format!("retry not dispatched: {detail}"),
    };
    match &test.last_outcome {
        Some(outcome) => format!("{reason}; last attempt {outcome}"),
        None => reason,
    }
}

fn write_summary(w: &mut impl WriteColor, result: &RunResult) -> io::Result<()> {
    writeln!(w, "--- [devq] run {} ---", result.run_id)?;

    with_color_spec(w, &bold_spec(), |w| {
        write!(w, "{} tests", result.num_tests())
    })?;
    write!(w, ", ")?;
    with_color_spec(w, &colored_bold_spec(Color::Green), |w| {
        write!(w, "{} passed", result.passed.len())
    })?;
    write!(w, ", ")?;
    with_color_spec(w, &count_spec(result.failed.len(), Color::Red), |w| {
        write!(w, "{} failed", result.failed.len())
    })?;
    write!(w, ", ")?;
    with_color_spec(w, &count_spec(result.lost.len(), Color::Yellow), |w| {
        write!(w, "{} lost", result.lost.len())
    })?;
    writeln!(w)?;

    let flaky: Vec<_> = result.flaky().collect();
    if !flaky.is_empty() {
        writeln!(w)?;
        with_color_spec(w, &colored_bold_spec(Color::Yellow), |w| {
            writeln!(w, "Passed on retry:")
        })?;
        for test in flaky {
            let n = test.attempts;
            writeln!(w, "  {} ({n} attempt{})", test.test_case, plural(n))?;
        }
    }

    if !result.failed.is_empty() {
        writeln!(w)?;
        with_color_spec(w, &colored_bold_spec(Color::Red), |w| writeln!(w, "Failed:"))?;
        for test in &result.failed {
            let n = test.attempts;
            writeln!(
                w,
                "  {} ({n} attempt{}): {}",
                test.test_case,
                plural(n),
                first_line(&test.detail)
            )?;
        }
    }

    if !result.lost.is_empty() {
        writeln!(w)?;
        with_color_spec(w, &colored_bold_spec(Color::Yellow), |w| {
            writeln!(w, "Lost, no trustworthy result (infrastructure):")
        })?;
        for test in &result.lost {
            let n = test.attempts;
            writeln!(
                w,
                "  {} ({n} attempt{}): {}",
                test.test_case,
                plural(n),
                describe_lost(test)
            )?;
        }
    }

    if result.timed_out {
        writeln!(w)?;
        writeln!(w, "The run timed out before every test was resolved.")?;
    }
    if result.cancelled {
        writeln!(w)?;
        writeln!(w, "The run was cancelled before every test was resolved.")?;
    }

    writeln!(w)?;
    let (verdict, color) = match result.verdict {
        Verdict::Success => ("SUCCESS", Color::Green),
        Verdict::Failure => ("FAILURE", Color::Red),
    };
    write!(w, "Verdict: ")?;
    with_color_spec(w, &colored_bold_spec(color), |w| writeln!(w, "{verdict}"))
}

/// Writes the run result as JSON.
pub struct VerdictFileEmitter {
    path: PathBuf,
}

impl VerdictFileEmitter {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl ReportEmitter for VerdictFileEmitter {
    fn emit(&mut self, result: &RunResult) -> Result<(), EmitError> {
        if let Some(dir) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(result)
            .map_err(|e| EmitError::FailedToFormat(e.to_string()))?;
        fs::write(&self.path, json)?;
        tracing::info!(path = %self.path.display(), "wrote verdict file");
        Ok(())
    }
}

#[inline]
fn bold_spec() -> ColorSpec {
    let mut spec = ColorSpec::new();
    spec.set_bold(true);
    spec
}

#[inline]
fn colored_bold_spec(color: Color) -> ColorSpec {
    let mut spec = ColorSpec::new();
    spec.set_fg(Some(color)).set_bold(true);
    spec
}

/// Colored only when there is something to count.
#[inline]
fn count_spec(count: usize, color: Color) -> ColorSpec {
    let mut spec = ColorSpec::new();
    if count > 0 {
        spec.set_fg(Some(color)).set_bold(true);
    }
    spec
}

#[inline]
fn with_color_spec<W>(
    writer: &mut W,
    color_spec: &ColorSpec,
    f: impl FnOnce(&mut W) -> io::Result<()>,
) -> io::Result<()>
where
    W: WriteColor,
{
    writer.set_color(color_spec)?;
    f(writer)?;
    writer.reset()
}

#[cfg(test)]
mod test {
    use devq_scheduler::{
        report::ReportEmitter,
        result::{FailedTest, LostReason, LostTest, PassedTest, RunResult},
    };
    use devq_test_utils::tc;
    use devq_utils::protocol::{Outcome, RunId};
    use indoc::indoc;
    use termcolor::NoColor;

    use super::{SummaryEmitter, VerdictFileEmitter};

    fn mixed_result() -> RunResult {
        RunResult::new(
            RunId("run-7".to_owned()),
            vec![
                PassedTest {
                    test_case: tc("LoginTest#valid"),
                    attempts: 1,
                    flaky: false,
                },
                PassedTest {
                    test_case: tc("LoginTest#slow"),
                    attempts: 3,
                    flaky: true,
                },
            ],
            vec![FailedTest {
                test_case: tc("CartTest#total"),
                attempts: 1,
                detail: "expected 3 but was 4\n\tat CartTest.total".to_owned(),
            }],
            vec![LostTest {
                test_case: tc("MapTest#render"),
                attempts: 3,
                reason: LostReason::RetriesExhausted,
                last_outcome: Some(Outcome::DeviceUnavailable {
                    reason: "adb offline".to_owned(),
                }),
            }],
            false,
        )
    }

    fn render(result: &RunResult) -> String {
        let mut emitter = SummaryEmitter::new(NoColor::new(Vec::new()));
        emitter.emit(result).unwrap();
        String::from_utf8(emitter.into_inner().into_inner()).unwrap()
    }

    #[test]
    fn summary_separates_failures_from_lost_tests() {
        let summary = render(&mixed_result());
        assert_eq!(
            summary,
            indoc! {"
                --- [devq] run run-7 ---
                4 tests, 2 passed, 1 failed, 1 lost

                Passed on retry:
                  app::LoginTest#slow (3 attempts)

                Failed:
                  app::CartTest#total (1 attempt): expected 3 but was 4

                Lost, no trustworthy result (infrastructure):
                  app::MapTest#render (3 attempts): retries exhausted; last attempt device unavailable: adb offline

                Verdict: FAILURE
            "}
        );
    }

    #[test]
    fn summary_of_clean_run() {
        let result = RunResult::new(
            RunId("run-8".to_owned()),
            vec![PassedTest {
                test_case: tc("a"),
                attempts: 1,
                flaky: false,
            }],
            vec![],
            vec![],
            false,
        );
        assert_eq!(
            render(&result),
            indoc! {"
                --- [devq] run run-8 ---
                1 tests, 1 passed, 0 failed, 0 lost

                Verdict: SUCCESS
            "}
        );
    }

    #[test]
    fn verdict_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("verdict.json");
        let result = mixed_result();

        VerdictFileEmitter::new(path.clone()).emit(&result).unwrap();

        let written: RunResult =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(written, result);
    }

    #[test]
    fn summary_notes_a_cancelled_run() {
        let mut result = RunResult::new(
            RunId("run-9".to_owned()),
            vec![],
            vec![],
            vec![LostTest {
                test_case: tc("a"),
                attempts: 0,
                reason: LostReason::NeverReported,
                last_outcome: None,
            }],
            false,
        );
        result.cancelled = true;
        assert_eq!(
            render(&result),
            indoc! {"
                --- [devq] run run-9 ---
                1 tests, 0 passed, 0 failed, 1 lost

                Lost, no trustworthy result (infrastructure):
                  app::a (0 attempts): never reported

                The run was cancelled before every test was resolved.

                Verdict: FAILURE
            "}
        );
    }
}
