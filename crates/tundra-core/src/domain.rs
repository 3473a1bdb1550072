// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory contest state, rebuilt by replaying the event log.
//!
//! [`Contest::apply`] is the only mutation path: one event, one transition.
//! Handlers are pure over (state, timestamp, fields) except that they may
//! return follow-up scheduler jobs, which the engine runs on its trampoline.
//! Because the same events replay at startup, restarting the process from
//! the log files reconstructs identical state, including the jobs that
//! were in flight, since compile/test jobs skip work whose outcome is
//! already recorded.
//!
//! The two `*_use_source` mutators are the deliberate exception: for
//! interpreted languages there is no compile step and no event; the
//! "binary" is the source itself, re-derived on every replay by the
//! re-enqueued compile job.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tundra_protocol::Status;

use crate::error::{CoreError, Result};
use crate::event::Event;
use crate::scheduler::Job;

/// A registered compiler. `binary`/`compile` both null means an interpreted
/// language with no compile step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compiler {
    /// Compiler id.
    pub id: String,
    /// Template for the judge-visible binary name, over `$name`.
    pub binary: Option<String>,
    /// Compile command template, over `$name` and `$binary`.
    pub compile: Option<String>,
    /// Run command template, over `$name` and `$binary`.
    pub run: Option<String>,
}

impl Compiler {
    /// Whether this compiler has no compile step.
    pub fn is_interpreter(&self) -> bool {
        self.binary.is_none() && self.compile.is_none()
    }
}

/// A team account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Team {
    /// Unique login.
    pub login: String,
    /// Display name.
    pub name: String,
    /// Password.
    pub password: String,
}

/// A content blob: immutable bytes in the store, addressed by hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Content {
    /// Hex MD5 of the bytes.
    pub hash: String,
    /// Original filename.
    pub name: String,
    /// Start offset in the content store.
    pub offset: u64,
    /// Length in bytes.
    pub length: u64,
    /// Creation timestamp, unix seconds.
    pub created: i64,
}

/// Compilation state of a checker binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckerBinary {
    /// Not compiled yet.
    Unset,
    /// A compile call is outstanding on some judge. Not durable: replay
    /// resets this to `Unset` and the re-enqueued job compiles again.
    Compiling,
    /// Compiled; the content hash of the binary.
    Ready(String),
}

/// A problem's output checker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checker {
    /// Content hash of the checker source.
    pub source: String,
    /// Compiler id used to build it.
    pub compiler: String,
    /// Compilation state.
    pub binary: CheckerBinary,
}

/// One test case: content hashes of input and expected answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    /// Test input.
    pub test: String,
    /// Expected answer.
    pub answer: String,
}

/// A contest problem. Tests are appended, never reordered or removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Problem {
    /// Short name.
    pub name: String,
    /// Full statement.
    pub full: String,
    /// Input stream name presented to solutions; empty means stdin.
    pub input: String,
    /// Output stream name collected from solutions; empty means stdout.
    pub output: String,
    /// Time limit, milliseconds.
    pub time_limit_ms: u64,
    /// Memory limit, bytes.
    pub memory_limit_bytes: u64,
    /// Ordered test list.
    pub tests: Vec<TestCase>,
    /// Output checker, if attached.
    pub checker: Option<Checker>,
}

impl Problem {
    fn new(name: String, full: String) -> Self {
        Self {
            name,
            full,
            input: String::new(),
            output: String::new(),
            time_limit_ms: DEFAULT_TIME_LIMIT_MS,
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
            tests: Vec::new(),
            checker: None,
        }
    }
}

/// Limits for problems created before `problem.limits.set` arrives.
pub const DEFAULT_TIME_LIMIT_MS: u64 = 1000;
/// See [`DEFAULT_TIME_LIMIT_MS`].
pub const DEFAULT_MEMORY_LIMIT_BYTES: u64 = 256 * 1024 * 1024;

/// One judged test of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestRun {
    /// Verdict.
    pub status: Status,
    /// Peak run time, milliseconds.
    pub time_ms: u64,
    /// Peak memory, bytes.
    pub memory_bytes: u64,
}

/// Final outcome of a submission. `status == Ok` with no failed test is
/// an accepted solution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmissionResult {
    /// Verdict of the deciding test, or `Ok` when all passed.
    pub status: Status,
    /// Index of the failing test; `None` when accepted (or compile error).
    pub failed_test: Option<usize>,
}

impl SubmissionResult {
    /// Whether the submission passed every test.
    pub fn accepted(&self) -> bool {
        self.status == Status::Ok && self.failed_test.is_none()
    }
}

/// A submitted solution and its judging state.
///
/// Lifecycle: Waiting (no binary) → Compiling → Testing (binary set,
/// in-flight test indices non-empty) → Resolved (`result` set). No
/// transition leaves Resolved. Tests run strictly one at a time: the
/// in-flight set starts at `{0}` and advances only when the previous
/// verdict is OK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    /// Target problem.
    pub problem: usize,
    /// Submitting team, for archive submissions.
    pub team: Option<String>,
    /// Content hash of the source.
    pub source: String,
    /// Compiler id.
    pub compiler: String,
    /// Snapshot of the problem's tests at submission time. Tests added to
    /// the problem afterwards do not affect this submission.
    pub tests: Vec<TestCase>,
    /// Per-test verdicts, parallel to `tests`.
    pub runs: Vec<Option<TestRun>>,
    /// Test indices currently being judged.
    pub in_flight: BTreeSet<usize>,
    /// Content hash of the compiled binary (the source itself for
    /// interpreted languages); `None` while waiting or compiling.
    pub binary: Option<String>,
    /// Content hash of the compiler output.
    pub compiler_output: Option<String>,
    /// Final outcome; `None` while judging.
    pub result: Option<SubmissionResult>,
    /// Submission timestamp, unix seconds.
    pub created: i64,
}

/// The open-practice catalogue: a subset of problems and compilers plus
/// submission indices for paginated history queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Archive {
    /// Problems currently exposed.
    pub problems: BTreeSet<usize>,
    /// Exposure order; `archive.remove` deletes by position here.
    pub problem_list: Vec<usize>,
    /// Exposed compilers and their display names.
    pub compilers: BTreeMap<String, String>,
    /// All archive submissions, oldest first.
    pub submits_all: Vec<u64>,
    /// Archive submissions per team.
    pub submits_team: HashMap<String, Vec<u64>>,
    /// Archive submissions per problem.
    pub submits_problem: HashMap<usize, Vec<u64>>,
    /// Archive submissions per (team, problem).
    pub submits_pair: HashMap<(String, usize), Vec<u64>>,
}

/// The whole in-memory contest state.
#[derive(Debug, Default, PartialEq)]
pub struct Contest {
    compilers: BTreeMap<String, Compiler>,
    teams: BTreeMap<String, Team>,
    contents: HashMap<String, Content>,
    problems: Vec<Problem>,
    submissions: Vec<Submission>,
    archive: Archive,
}

impl Contest {
    /// Create an empty contest.
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Look up a compiler.
    pub fn compiler_get(&self, id: &str) -> Option<&Compiler> {
        self.compilers.get(id)
    }

    /// All compiler ids, sorted.
    pub fn compiler_list(&self) -> Vec<&str> {
        self.compilers.keys().map(String::as_str).collect()
    }

    /// Look up a team by login.
    pub fn team_get(&self, login: &str) -> Option<&Team> {
        self.teams.get(login)
    }

    /// Look up a content blob by hash.
    pub fn content_get(&self, hash: &str) -> Option<&Content> {
        self.contents.get(hash)
    }

    /// Look up a problem.
    pub fn problem_get(&self, id: usize) -> Option<&Problem> {
        self.problems.get(id)
    }

    /// Number of problems.
    pub fn problem_count(&self) -> usize {
        self.problems.len()
    }

    /// Look up a submission.
    pub fn submission_get(&self, id: u64) -> Option<&Submission> {
        self.submissions.get(id as usize)
    }

    /// Number of submissions; also the id the next submission will get.
    pub fn submission_count(&self) -> u64 {
        self.submissions.len() as u64
    }

    /// The archive catalogue.
    pub fn archive(&self) -> &Archive {
        &self.archive
    }

    // ========================================================================
    // Non-durable mutators
    // ========================================================================

    /// Mark a checker as having an outstanding compile call.
    pub fn checker_mark_compiling(&mut self, problem: usize) {
        if let Some(checker) = self
            .problems
            .get_mut(problem)
            .and_then(|p| p.checker.as_mut())
        {
            checker.binary = CheckerBinary::Compiling;
        }
    }

    /// Clear a checker's compiling marker after a failed compile so a later
    /// `problem.checker.recompile` can retry.
    pub fn checker_reset(&mut self, problem: usize) {
        if let Some(checker) = self
            .problems
            .get_mut(problem)
            .and_then(|p| p.checker.as_mut())
        {
            checker.binary = CheckerBinary::Unset;
        }
    }

    /// Interpreted checker: the "binary" is the source itself.
    pub fn checker_use_source(&mut self, problem: usize) {
        if let Some(checker) = self
            .problems
            .get_mut(problem)
            .and_then(|p| p.checker.as_mut())
        {
            checker.binary = CheckerBinary::Ready(checker.source.clone());
        }
    }

    /// Interpreted submission: skip the compile step and start testing.
    pub fn submission_use_source(&mut self, id: u64) -> Vec<Job> {
        let Some(sub) = self.submissions.get_mut(id as usize) else {
            return Vec::new();
        };
        if sub.binary.is_some() || sub.result.is_some() {
            return Vec::new();
        }
        sub.binary = Some(sub.source.clone());
        sub.compiler_output = None;
        start_testing(sub, id)
    }

    // ========================================================================
    // Replay
    // ========================================================================

    /// Apply one event, returning the follow-up jobs it triggers.
    pub fn apply(&mut self, timestamp: i64, event: Event) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        match event {
            Event::Content {
                hash,
                name,
                offset,
                length,
            } => {
                self.contents.insert(
                    hash.clone(),
                    Content {
                        hash,
                        name,
                        offset,
                        length,
                        created: timestamp,
                    },
                );
            }
            Event::CompilerAdd {
                id,
                binary,
                compile,
                run,
            }
            | Event::CompilerModify {
                id,
                binary,
                compile,
                run,
            } => {
                self.compilers.insert(
                    id.clone(),
                    Compiler {
                        id,
                        binary,
                        compile,
                        run,
                    },
                );
            }
            Event::CompilerRemove { id } => {
                if self.compilers.remove(&id).is_none() {
                    return Err(CoreError::Inconsistent(format!(
                        "removing unknown compiler {id}"
                    )));
                }
            }
            Event::TeamAdd {
                login,
                name,
                password,
            } => {
                self.teams.insert(
                    login.clone(),
                    Team {
                        login,
                        name,
                        password,
                    },
                );
            }
            Event::ProblemCreate { id, name, full } => {
                if id != self.problems.len() {
                    return Err(CoreError::Inconsistent(format!(
                        "problem id {id} does not match problem count {}",
                        self.problems.len()
                    )));
                }
                self.problems.push(Problem::new(name, full));
            }
            Event::ProblemModify { id, name, full } => {
                let problem = self.problem_mut(id)?;
                problem.name = name;
                problem.full = full;
            }
            Event::ProblemFilesSet { id, input, output } => {
                let problem = self.problem_mut(id)?;
                problem.input = input;
                problem.output = output;
            }
            Event::ProblemLimitsSet {
                id,
                time_ms,
                memory_bytes,
            } => {
                let problem = self.problem_mut(id)?;
                problem.time_limit_ms = time_ms;
                problem.memory_limit_bytes = memory_bytes;
            }
            Event::ProblemTestAdd { id, test, answer } => {
                self.problem_mut(id)?.tests.push(TestCase { test, answer });
            }
            Event::CheckerSet {
                id,
                source,
                compiler,
            } => {
                self.problem_mut(id)?.checker = Some(Checker {
                    source,
                    compiler,
                    binary: CheckerBinary::Unset,
                });
                jobs.push(Job::CompileChecker { problem: id });
            }
            Event::CheckerRecompile { id } => {
                // The checker may be absent; the compile job reports that
                // to the operator queue instead of failing replay.
                self.problem_mut(id)?;
                self.checker_reset(id);
                jobs.push(Job::CompileChecker { problem: id });
            }
            Event::CheckerCompiled { id, binary, .. } => {
                let problem = self.problem_mut(id)?;
                let Some(checker) = problem.checker.as_mut() else {
                    return Err(CoreError::Inconsistent(format!(
                        "checker compiled for problem #{id} which has none"
                    )));
                };
                checker.binary = CheckerBinary::Ready(binary);
            }
            Event::Submit {
                id,
                problem,
                source,
                compiler,
            } => {
                jobs.extend(self.add_submission(
                    timestamp, id, None, problem, source, compiler,
                )?);
            }
            Event::ArchiveSubmit {
                id,
                team,
                problem,
                source,
                compiler,
            } => {
                jobs.extend(self.add_submission(
                    timestamp,
                    id,
                    Some(team.clone()),
                    problem,
                    source,
                    compiler,
                )?);
                self.archive.submits_all.push(id);
                self.archive
                    .submits_team
                    .entry(team.clone())
                    .or_default()
                    .push(id);
                self.archive
                    .submits_problem
                    .entry(problem)
                    .or_default()
                    .push(id);
                self.archive
                    .submits_pair
                    .entry((team, problem))
                    .or_default()
                    .push(id);
            }
            Event::SubmitCompiled { id, binary, output } => {
                let sub = self.submission_mut(id)?;
                if sub.result.is_some() {
                    return Ok(jobs);
                }
                sub.compiler_output = Some(output);
                if binary.is_empty() {
                    sub.result = Some(SubmissionResult {
                        status: Status::CompileError,
                        failed_test: None,
                    });
                } else {
                    sub.binary = Some(binary);
                    jobs.extend(start_testing(sub, id));
                }
            }
            Event::SubmitTest {
                id,
                test,
                status,
                time_ms,
                memory_bytes,
            } => {
                let sub = self.submission_mut(id)?;
                if sub.result.is_some() {
                    return Ok(jobs);
                }
                if test >= sub.tests.len() {
                    return Err(CoreError::Inconsistent(format!(
                        "verdict for test #{test} of submit #{id} which has {} tests",
                        sub.tests.len()
                    )));
                }
                sub.runs[test] = Some(TestRun {
                    status,
                    time_ms,
                    memory_bytes,
                });
                sub.in_flight.remove(&test);
                if !sub.in_flight.is_empty() {
                    return Ok(jobs);
                }
                if status == Status::Ok {
                    let next = test + 1;
                    if next < sub.tests.len() {
                        sub.in_flight.insert(next);
                        jobs.push(Job::RunTest { id, test: next });
                    } else {
                        sub.result = Some(SubmissionResult {
                            status: Status::Ok,
                            failed_test: None,
                        });
                    }
                } else {
                    sub.result = Some(SubmissionResult {
                        status,
                        failed_test: Some(test),
                    });
                }
            }
            Event::ArchiveAdd { problem } => {
                self.archive.problem_list.push(problem);
                self.archive.problems.insert(problem);
            }
            Event::ArchiveRemove { index } => {
                if index >= self.archive.problem_list.len() {
                    return Err(CoreError::Inconsistent(format!(
                        "archive remove at {index} beyond list of {}",
                        self.archive.problem_list.len()
                    )));
                }
                let problem = self.archive.problem_list.remove(index);
                self.archive.problems.remove(&problem);
            }
            Event::ArchiveCompilerAdd { id, name } => {
                self.archive.compilers.insert(id, name);
            }
            Event::ArchiveCompilerRemove { id } => {
                self.archive.compilers.remove(&id);
            }
        }
        Ok(jobs)
    }

    fn problem_mut(&mut self, id: usize) -> Result<&mut Problem> {
        let count = self.problems.len();
        self.problems.get_mut(id).ok_or_else(|| {
            CoreError::Inconsistent(format!("unknown problem #{id} (of {count})"))
        })
    }

    fn submission_mut(&mut self, id: u64) -> Result<&mut Submission> {
        let count = self.submissions.len();
        self.submissions.get_mut(id as usize).ok_or_else(|| {
            CoreError::Inconsistent(format!("unknown submit #{id} (of {count})"))
        })
    }

    fn add_submission(
        &mut self,
        timestamp: i64,
        id: u64,
        team: Option<String>,
        problem: usize,
        source: String,
        compiler: String,
    ) -> Result<Vec<Job>> {
        if id != self.submissions.len() as u64 {
            return Err(CoreError::Inconsistent(format!(
                "submit id {id} does not match submit count {}",
                self.submissions.len()
            )));
        }
        let tests = self
            .problem_get(problem)
            .ok_or_else(|| {
                CoreError::Inconsistent(format!("submit #{id} for unknown problem #{problem}"))
            })?
            .tests
            .clone();
        let runs = vec![None; tests.len()];
        self.submissions.push(Submission {
            problem,
            team,
            source,
            compiler,
            tests,
            runs,
            in_flight: BTreeSet::new(),
            binary: None,
            compiler_output: None,
            result: None,
            created: timestamp,
        });
        Ok(vec![Job::CompileSubmission { id }])
    }
}

/// Move a freshly compiled submission into the testing phase.
fn start_testing(sub: &mut Submission, id: u64) -> Vec<Job> {
    if sub.tests.is_empty() {
        // Nothing to run; a problem with no tests accepts anything that
        // compiles.
        sub.result = Some(SubmissionResult {
            status: Status::Ok,
            failed_test: None,
        });
        return Vec::new();
    }
    sub.in_flight.insert(0);
    vec![Job::RunTest { id, test: 0 }]
}
