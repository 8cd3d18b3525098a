//! Versioned exit-code table for the test runner.
//!
//! Classification is a single lookup; nothing here looks at the runner's
//! output text.

use std::fmt;

use serde::Serialize;
use warden_types::TestCategory;

pub const CURRENT_TABLE_VERSION: u32 = 1;

/// Explicit mapping from runner exit codes to categories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExitCodeTable {
    pub version: u32,
    pub pass: Vec<i32>,
    pub tests_failed: Vec<i32>,
    /// Codes meaning the generated tests could not even be collected or run.
    pub malformed: Vec<i32>,
}

impl ExitCodeTable {
    /// Version 1: `0` pass, `1` tests failed, `2`/`4`/`5` malformed
    /// (interrupted or collection error, usage error, no tests collected).
    pub fn v1() -> Self {
        Self {
            version: 1,
            pass: vec![0],
            tests_failed: vec![1],
            malformed: vec![2, 4, 5],
        }
    }

    /// Total over every possible outcome. Signal termination (`None`) and
    /// any unlisted code are internal errors.
    pub fn classify(&self, exit_code: Option<i32>, timed_out: bool) -> TestCategory {
        if timed_out {
            return TestCategory::Timeout;
        }
        match exit_code {
            None => TestCategory::InternalError,
            Some(code) if self.pass.contains(&code) => TestCategory::Pass,
            Some(code) if self.tests_failed.contains(&code) => TestCategory::ExpectedFail,
            Some(code) if self.malformed.contains(&code) => TestCategory::Malformed,
            Some(_) => TestCategory::InternalError,
        }
    }
}

impl Default for ExitCodeTable {
    fn default() -> Self {
        Self::v1()
    }
}

/// What a test node requires of the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestPhase {
    /// Red phase: tests must exist and fail.
    MustFailFirst,
    /// Green phase: tests must pass.
    MustPass,
}

impl fmt::Display for TestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestPhase::MustFailFirst => f.write_str("must-fail-first"),
            TestPhase::MustPass => f.write_str("must-pass"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum GateDecision {
    /// The phase's requirement was met.
    Advance,
    /// Tests passed before any implementation existed.
    InvalidTddEntry,
    /// Generated tests are broken; go back to authoring them.
    AuthoringRetry,
    /// Tests failed in the green phase; go back to implementing.
    ImplementationRetry,
    /// Anything the table cannot vouch for goes to a human.
    Escalate,
}

impl fmt::Display for GateDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GateDecision::Advance => "advance",
            GateDecision::InvalidTddEntry => "invalid-tdd-entry",
            GateDecision::AuthoringRetry => "authoring-retry",
            GateDecision::ImplementationRetry => "implementation-retry",
            GateDecision::Escalate => "escalate",
        };
        f.write_str(s)
    }
}

/// Routing decision for a category within a phase.
pub fn decide(phase: TestPhase, category: TestCategory) -> GateDecision {
    match (phase, category) {
        (TestPhase::MustFailFirst, TestCategory::ExpectedFail) => GateDecision::Advance,
        (TestPhase::MustFailFirst, TestCategory::Pass) => GateDecision::InvalidTddEntry,
        (TestPhase::MustPass, TestCategory::Pass) => GateDecision::Advance,
        (TestPhase::MustPass, TestCategory::ExpectedFail) => GateDecision::ImplementationRetry,
        (_, TestCategory::Malformed) => GateDecision::AuthoringRetry,
        (_, TestCategory::InternalError | TestCategory::Timeout) => GateDecision::Escalate,
    }
}

/// One printable row of the table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableRow {
    pub codes: String,
    pub category: TestCategory,
    pub red_phase: GateDecision,
    pub green_phase: GateDecision,
}

/// The table as rows, for `warden exit-codes`.
pub fn rows(table: &ExitCodeTable) -> Vec<TableRow> {
    let join = |codes: &[i32]| {
        codes
            .iter()
            .map(i32::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    };
    let row = |codes: String, category| TableRow {
        codes,
        category,
        red_phase: decide(TestPhase::MustFailFirst, category),
        green_phase: decide(TestPhase::MustPass, category),
    };
    vec![
        row(join(&table.pass), TestCategory::Pass),
        row(join(&table.tests_failed), TestCategory::ExpectedFail),
        row(join(&table.malformed), TestCategory::Malformed),
        row("timeout".into(), TestCategory::Timeout),
        row("signal, any other".into(), TestCategory::InternalError),
    ]
}
