//! Test Runner (Section 4.H): orchestrates the suite/test/revert
//! lifecycle, selection by regex and skip-flags, JUnit aggregation.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::errors::{RunnerError, RunnerResult};

bitflags! {
    /// Skip flags as bits on each test case and on the run (Section 4.H).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SkipFlags: u32 {
        const VIRTUAL_SWITCH  = 1 << 0;
        const NO_EXTERNALS    = 1 << 1;
        const EXTENDED_ONLY   = 1 << 2;
        const ROCE            = 1 << 3;
        const SUB_INTERFACES  = 1 << 4;
        const NO_FABRIC_LINK  = 1 << 5;
        const NO_MESH_LINK    = 1 << 6;
        const NO_GATEWAY      = 1 << 7;
        const NO_LOKI         = 1 << 8;
        const NO_PROM         = 1 << 9;
        const NO_SERVERS      = 1 << 10;
    }
}

pub type RevertFuture = Pin<Box<dyn Future<Output = RunnerResult<()>> + Send>>;
/// Idempotent revert action; executed in LIFO order regardless of
/// pass/fail (Section 3, "Revert chains").
pub type RevertFn = Box<dyn Fn(CancellationToken) -> RevertFuture + Send + Sync>;

pub type TestBodyFuture = Pin<Box<dyn Future<Output = TestStatus> + Send>>;
pub type TestBody = Box<dyn Fn(CancellationToken) -> TestBodyFuture + Send + Sync>;

pub type SetupFuture = Pin<Box<dyn Future<Output = RunnerResult<()>> + Send>>;
pub type SetupFn = Box<dyn Fn(bool, CancellationToken) -> SetupFuture + Send + Sync>;

/// What a test body resolved to, before reverts run.
pub enum TestStatus {
    Passed(Vec<RevertFn>),
    Failed(RunnerError, Vec<RevertFn>),
    /// `(skipped=true, err=reason)` in the spec's vocabulary.
    Skipped(String),
}

pub struct TestCase {
    pub name: String,
    pub skip_flags: SkipFlags,
    pub body: TestBody,
}

pub struct Suite {
    pub name: String,
    pub test_cases: Vec<TestCase>,
}

#[derive(Debug, Clone)]
pub enum Outcome {
    Passed,
    Failed { message: String },
    Skipped { reason: String },
}

#[derive(Debug, Clone)]
pub struct TestResult {
    pub classname: String,
    pub name: String,
    pub time: Duration,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Default)]
pub struct SuiteReport {
    pub name: String,
    pub results: Vec<TestResult>,
}

impl SuiteReport {
    pub fn tests(&self) -> usize {
        self.results.len()
    }
    pub fn failures(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, Outcome::Failed { .. }))
            .count()
    }
    pub fn skipped(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, Outcome::Skipped { .. }))
            .count()
    }
    pub fn total_time(&self) -> Duration {
        self.results.iter().map(|r| r.time).sum()
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Capabilities missing from this lab; any test whose flags intersect
    /// this set is skipped.
    pub capability_missing: SkipFlags,
    pub regexes: Vec<Regex>,
    pub invert_regex: bool,
    pub extended: bool,
    pub fail_fast: bool,
    pub wipe_between_tests: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            capability_missing: SkipFlags::empty(),
            regexes: Vec::new(),
            invert_regex: false,
            extended: false,
            fail_fast: false,
            wipe_between_tests: true,
        }
    }
}

/// `extended-only` tests do not run unless `extended=true` (Section 8,
/// property 7); folded into the run's capability-missing set up front.
fn effective_capability_missing(cfg: &RunConfig) -> SkipFlags {
    let mut missing = cfg.capability_missing;
    if !cfg.extended {
        missing |= SkipFlags::EXTENDED_ONLY;
    }
    missing
}

fn regex_selected(name: &str, cfg: &RunConfig) -> bool {
    if cfg.regexes.is_empty() {
        return true;
    }
    let any_match = cfg.regexes.iter().any(|r| r.is_match(name));
    any_match != cfg.invert_regex
}

pub struct Runner {
    pub setup: SetupFn,
}

impl Runner {
    pub async fn run_suite(
        &self,
        mut suite: Suite,
        cfg: &RunConfig,
        cancel: &CancellationToken,
    ) -> SuiteReport {
        let missing = effective_capability_missing(cfg);
        let mut results = Vec::with_capacity(suite.test_cases.len());

        // Resolve skip status for every test up front (skip-flags and regex).
        let mut skip_reason: Vec<Option<String>> = Vec::with_capacity(suite.test_cases.len());
        for tc in &suite.test_cases {
            if tc.skip_flags.intersects(missing) {
                skip_reason.push(Some("Skip-flag dominance".to_string()));
            } else if !regex_selected(&tc.name, cfg) {
                skip_reason.push(Some("Regex selection".to_string()));
            } else {
                skip_reason.push(None);
            }
        }

        if let Err(e) = (self.setup)(true, cancel.clone()).await {
            error!(suite = suite.name, error = %e, "baseline setup failed");
            for (i, tc) in suite.test_cases.iter().enumerate() {
                if skip_reason[i].is_some() {
                    continue;
                }
                results.push(TestResult {
                    classname: suite.name.clone(),
                    name: tc.name.clone(),
                    time: Duration::ZERO,
                    outcome: Outcome::Failed {
                        message: RunnerError::SetupFailed(e.to_string()).to_string(),
                    },
                });
            }
            return SuiteReport {
                name: suite.name,
                results,
            };
        }

        let mut ran_any = false;
        let mut prev_reverts_failed = false;

        for (i, tc) in suite.test_cases.drain(..).enumerate() {
            if let Some(reason) = skip_reason[i].take() {
                results.push(TestResult {
                    classname: suite.name.clone(),
                    name: tc.name,
                    time: Duration::ZERO,
                    outcome: Outcome::Skipped { reason },
                });
                continue;
            }

            if (ran_any && cfg.wipe_between_tests) || prev_reverts_failed {
                if let Err(e) = (self.setup)(false, cancel.clone()).await {
                    results.push(TestResult {
                        classname: suite.name.clone(),
                        name: tc.name,
                        time: Duration::ZERO,
                        outcome: Outcome::Failed {
                            message: RunnerError::SetupFailed(e.to_string()).to_string(),
                        },
                    });
                    if cfg.fail_fast {
                        break;
                    }
                    continue;
                }
            }

            let t0 = Instant::now();
            let status = (tc.body)(cancel.clone()).await;
            let elapsed = t0.elapsed();
            ran_any = true;
            prev_reverts_failed = false;

            let (mut body_err, reverts, skipped_reason) = match status {
                TestStatus::Passed(reverts) => (None, reverts, None),
                TestStatus::Failed(e, reverts) => (Some(e), reverts, None),
                TestStatus::Skipped(reason) => (None, Vec::new(), Some(reason)),
            };

            if let Some(reason) = skipped_reason {
                results.push(TestResult {
                    classname: suite.name.clone(),
                    name: tc.name,
                    time: elapsed,
                    outcome: Outcome::Skipped { reason },
                });
                continue;
            }

            // Reverts run in LIFO order; stop at first revert failure.
            for revert in reverts.into_iter().rev() {
                if let Err(revert_err) = revert(cancel.clone()).await {
                    body_err = Some(match body_err {
                        None => {
                            warn!(test = tc.name, "revert failed on a passing test, promoting to failed");
                            revert_err
                        }
                        Some(existing) => RunnerError::join(existing, revert_err),
                    });
                    prev_reverts_failed = true;
                    break;
                }
            }

            let outcome = match body_err {
                None => Outcome::Passed,
                Some(e) => Outcome::Failed {
                    message: e.to_string(),
                },
            };
            let is_failure = matches!(outcome, Outcome::Failed { .. });
            results.push(TestResult {
                classname: suite.name.clone(),
                name: tc.name,
                time: elapsed,
                outcome,
            });

            if is_failure && cfg.fail_fast {
                break;
            }
        }

        info!(
            suite = suite.name,
            tests = results.len(),
            failures = results
                .iter()
                .filter(|r| matches!(r.outcome, Outcome::Failed { .. }))
                .count(),
            "suite complete"
        );

        SuiteReport {
            name: suite.name,
            results,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passing_body() -> TestBody {
        Box::new(|_cancel| Box::pin(async { TestStatus::Passed(Vec::new()) }))
    }

    fn skip_setup() -> SetupFn {
        Box::new(|_first, _cancel| Box::pin(async { Ok(()) }))
    }

    #[tokio::test]
    async fn regex_selection_picks_matching_names_only() {
        let names = [
            "No restrictions",
            "Single VPC with restrictions",
            "DNS/NTP/MTU",
            "Static External",
            "MCLAG",
            "ESLAG",
        ];
        let cfg = RunConfig {
            regexes: vec![Regex::new("LAG$").unwrap()],
            ..Default::default()
        };
        let selected: Vec<bool> = names.iter().map(|n| regex_selected(n, &cfg)).collect();
        assert_eq!(selected, vec![false, false, false, false, true, true]);

        let cfg_inverted = RunConfig {
            invert_regex: true,
            ..cfg
        };
        let selected: Vec<bool> = names
            .iter()
            .map(|n| regex_selected(n, &cfg_inverted))
            .collect();
        assert_eq!(selected, vec![true, true, true, true, false, false]);
    }

    #[tokio::test]
    async fn revert_order_is_lifo_and_stops_at_first_failure() {
        use std::sync::{Arc, Mutex};
        let order = Arc::new(Mutex::new(Vec::new()));

        let make_revert = |label: &'static str, fail: bool, order: Arc<Mutex<Vec<&'static str>>>| -> RevertFn {
            Box::new(move |_cancel| {
                let order = order.clone();
                Box::pin(async move {
                    order.lock().unwrap().push(label);
                    if fail {
                        Err(RunnerError::Other(format!("{label} failed")))
                    } else {
                        Ok(())
                    }
                })
            })
        };

        let r1 = make_revert("r1", false, order.clone());
        let r2 = make_revert("r2", true, order.clone());
        let r3 = make_revert("r3", false, order.clone());

        let body: TestBody = Box::new(move |_cancel| {
            Box::pin(async { TestStatus::Passed(Vec::new()) })
        });
        let _ = body; // body is unused directly; we drive the revert loop below like the runner does.

        let reverts = vec![r1, r2, r3];
        let mut executed = Vec::new();
        let mut failed = false;
        for revert in reverts.into_iter().rev() {
            let result = revert(CancellationToken::new()).await;
            executed.push(result.is_ok());
            if result.is_err() {
                failed = true;
                break;
            }
        }
        assert_eq!(*order.lock().unwrap(), vec!["r3", "r2"]);
        assert!(failed);
    }

    #[tokio::test]
    async fn setup_failure_fails_every_non_skipped_test() {
        let runner = Runner {
            setup: Box::new(|_first, _cancel| {
                Box::pin(async { Err(RunnerError::Other("cluster unreachable".into())) })
            }),
        };
        let suite = Suite {
            name: "s".into(),
            test_cases: vec![TestCase {
                name: "t1".into(),
                skip_flags: SkipFlags::empty(),
                body: passing_body(),
            }],
        };
        let cancel = CancellationToken::new();
        let report = runner.run_suite(suite, &RunConfig::default(), &cancel).await;
        assert_eq!(report.failures(), 1);
    }

    #[tokio::test]
    async fn extended_only_tests_skip_without_extended_flag() {
        let runner = Runner { setup: skip_setup() };
        let suite = Suite {
            name: "s".into(),
            test_cases: vec![TestCase {
                name: "extended test".into(),
                skip_flags: SkipFlags::EXTENDED_ONLY,
                body: passing_body(),
            }],
        };
        let cancel = CancellationToken::new();
        let report = runner
            .run_suite(suite, &RunConfig::default(), &cancel)
            .await;
        assert_eq!(report.skipped(), 1);
    }

    #[tokio::test]
    async fn revert_failure_on_passing_test_promotes_to_failed() {
        let runner = Runner { setup: skip_setup() };
        let body: TestBody = Box::new(|_cancel| {
            Box::pin(async {
                let bad_revert: RevertFn = Box::new(|_cancel| {
                    Box::pin(async { Err(RunnerError::Other("port still down".into())) })
                });
                TestStatus::Passed(vec![bad_revert])
            })
        });
        let suite = Suite {
            name: "s".into(),
            test_cases: vec![TestCase {
                name: "t1".into(),
                skip_flags: SkipFlags::empty(),
                body,
            }],
        };
        let cancel = CancellationToken::new();
        let report = runner
            .run_suite(suite, &RunConfig::default(), &cancel)
            .await;
        assert_eq!(report.failures(), 1);
    }
}
