// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The engine: single owner of all mutable state.
//!
//! One engine instance owns the ledger, the contest state, the scheduler,
//! and every judge session. It runs on a single task; connection tasks feed
//! it [`EngineMsg`] values and it never blocks. Handlers push follow-up
//! work onto an explicit action queue which is drained after every
//! message; the trampoline keeps the stack flat no matter how long a
//! compile/test chain gets.
//!
//! Every state change goes through [`Engine::commit`]: the event is
//! appended and flushed to the ledger first, then applied to the contest
//! state, so the durable log can never lag what callers observed.

use std::collections::HashMap;

use bytes::Bytes;
use chrono::Utc;
use md5::{Digest, Md5};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use tundra_protocol::{FileRef, Packet};

use crate::domain::{CheckerBinary, Contest};
use crate::error::Result;
use crate::event::Event;
use crate::queue::Fifo;
use crate::scheduler::{Job, JudgeId, Scheduler};
use crate::session::{
    CompileRequest, Purpose, SessionEvent, TestRequest, WorkerReply, WorkerSession,
};
use crate::store::Ledger;
use crate::template;

/// Messages the connection tasks feed to the engine task.
#[derive(Debug)]
pub enum EngineMsg {
    /// A judge connection opened; `tx` carries outbound wire bytes.
    JudgeConnected {
        /// Connection id.
        conn: JudgeId,
        /// Outbound byte channel to the connection's writer task.
        tx: mpsc::UnboundedSender<Bytes>,
    },
    /// A decoded packet arrived from a judge.
    JudgePacket {
        /// Connection id.
        conn: JudgeId,
        /// The packet.
        packet: Packet,
    },
    /// A judge connection closed.
    JudgeClosed {
        /// Connection id.
        conn: JudgeId,
    },
    /// A control-channel request wanting a JSON reply.
    Control {
        /// The decoded request object.
        request: serde_json::Value,
        /// Where to deliver the JSON result.
        reply: oneshot::Sender<serde_json::Value>,
    },
}

enum Prep<T> {
    /// The job's outcome is already recorded; nothing to do.
    Skip,
    /// Interpreted language: no judge involved.
    UseSource,
    /// Infrastructure problem for the operator queue.
    Report(String),
    /// Ready to go to a judge.
    Call(T),
}

struct PreparedCompile {
    source: String,
    binary_name: String,
    command: String,
}

struct PreparedTest {
    binary: String,
    run: Option<String>,
    test: String,
    answer: String,
    input: String,
    output: String,
    time_limit_ms: u64,
    memory_limit_bytes: u64,
    checker: String,
    checker_run: Option<String>,
}

/// The single-task core of the system.
#[derive(Debug)]
pub struct Engine {
    ledger: Ledger,
    contest: Contest,
    scheduler: Scheduler,
    actions: Fifo<Job>,
    sessions: HashMap<JudgeId, WorkerSession>,
    outbound: HashMap<JudgeId, mpsc::UnboundedSender<Bytes>>,
    reports: Fifo<String>,
    judge_key: Option<String>,
}

impl Engine {
    /// Open the ledger at `data_prefix`, replay the full event history, and
    /// return the reconstructed engine. Any job the history leaves pending
    /// (an unfinished compile, a half-judged submission) is re-enqueued.
    pub fn open(data_prefix: &str, judge_key: Option<String>) -> Result<Self> {
        let (ledger, records) = Ledger::open(data_prefix)?;
        let mut contest = Contest::new();
        let mut actions = Fifo::new();
        let count = records.len();
        for record in records {
            let event = Event::from_record(&record.name, &record.fields)?;
            debug!(event = %record.name, "replaying log event");
            for job in contest.apply(record.timestamp, event)? {
                actions.push(job);
            }
        }
        info!(
            events = count,
            problems = contest.problem_count(),
            submissions = contest.submission_count(),
            "contest state replayed"
        );

        let mut engine = Self {
            ledger,
            contest,
            scheduler: Scheduler::new(),
            actions,
            sessions: HashMap::new(),
            outbound: HashMap::new(),
            reports: Fifo::new(),
            judge_key,
        };
        // With no judges connected yet, everything pending parks.
        engine.run_actions();
        Ok(engine)
    }

    /// The contest state, for queries.
    pub fn contest(&self) -> &Contest {
        &self.contest
    }

    /// Drain the operator-facing problem reports collected so far.
    pub fn take_reports(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(report) = self.reports.pop() {
            out.push(report);
        }
        out
    }

    /// Process one message, then drain the action queue.
    pub fn handle(&mut self, msg: EngineMsg) -> Result<()> {
        match msg {
            EngineMsg::JudgeConnected { conn, tx } => {
                debug!(conn, "judge channel open");
                self.sessions
                    .insert(conn, WorkerSession::new(self.judge_key.clone()));
                self.outbound.insert(conn, tx);
            }
            EngineMsg::JudgePacket { conn, packet } => self.judge_packet(conn, packet)?,
            EngineMsg::JudgeClosed { conn } => self.remove_judge(conn),
            EngineMsg::Control { request, reply } => {
                let result = self.dispatch(&request)?;
                // The requester may have gone away; that is its problem.
                let _ = reply.send(result);
            }
        }
        self.run_actions();
        Ok(())
    }

    fn judge_packet(&mut self, conn: JudgeId, packet: Packet) -> Result<()> {
        let Some(session) = self.sessions.get_mut(&conn) else {
            warn!(conn, "packet from unknown judge connection; dropped");
            return Ok(());
        };
        match session.receive(packet) {
            SessionEvent::Registered { name } => {
                debug!(conn, judge = %name, "judge idle");
                self.judge_ready(conn);
            }
            SessionEvent::Resend(packet) => self.send(conn, &packet),
            SessionEvent::Completed { purpose, reply } => {
                self.judge_ready(conn);
                self.complete_call(purpose, reply)?;
            }
            SessionEvent::Disconnect => self.remove_judge(conn),
            SessionEvent::Ignored => {}
        }
        Ok(())
    }

    /// Return a judge to the idle pool and wake parked jobs, one per idle
    /// judge, in arrival order.
    fn judge_ready(&mut self, conn: JudgeId) {
        self.scheduler.judge_ready(conn);
        for _ in 0..self.scheduler.idle_count() {
            match self.scheduler.unpark() {
                Some(job) => self.actions.push(job),
                None => break,
            }
        }
    }

    /// Forget a judge connection. A call outstanding on it is requeued;
    /// compile and test jobs skip work whose outcome is already logged, so
    /// re-running the job on another judge is safe.
    fn remove_judge(&mut self, conn: JudgeId) {
        self.outbound.remove(&conn);
        self.scheduler.forget_judge(conn);
        if let Some(mut session) = self.sessions.remove(&conn) {
            if let Some(purpose) = session.take_outstanding() {
                let job = purpose.job();
                warn!(conn, judge = ?session.name(), %job, "judge disconnected mid-call; requeueing");
                self.actions.push(job);
            } else {
                info!(conn, judge = ?session.name(), "judge disconnected");
            }
        }
    }

    // ========================================================================
    // Durability
    // ========================================================================

    /// Append an event and synchronously apply it. Does not return until
    /// the record is flushed and the state transition has happened.
    pub(crate) fn commit(&mut self, event: Event) -> Result<()> {
        let timestamp = Utc::now().timestamp();
        debug!(event = event.name(), "commit");
        self.ledger
            .append(timestamp, event.name(), &event.fields())?;
        for job in self.contest.apply(timestamp, event)? {
            self.actions.push(job);
        }
        Ok(())
    }

    /// Store a blob, log the `content` event, and return the content hash.
    /// Saving identical bytes twice yields the same hash.
    pub(crate) fn save_content(&mut self, data: &[u8], name: Option<&str>) -> Result<String> {
        let digest = Md5::digest(data);
        let hash: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        let name = name.unwrap_or(&hash).to_string();
        let (offset, length) = self.ledger.save_blob(data)?;
        self.commit(Event::Content {
            hash: hash.clone(),
            name,
            offset,
            length,
        })?;
        Ok(hash)
    }

    /// Load a registered blob's bytes for the control channel. Missing or
    /// unreadable content reads as `None`; the caller reports failure to
    /// the requester, not to the operator queue.
    pub(crate) fn load_content(&mut self, hash: &str) -> Option<Vec<u8>> {
        let content = self.contest.content_get(hash)?.clone();
        match self.ledger.load(content.offset, content.length) {
            Ok(data) => Some(data),
            Err(e) => {
                error!(hash, error = %e, "failed to load content");
                None
            }
        }
    }

    /// Load a registered blob into a wire file reference.
    fn file_ref(&mut self, hash: &str) -> std::result::Result<FileRef, String> {
        let Some(content) = self.contest.content_get(hash) else {
            return Err(format!("content {hash} is not registered"));
        };
        let content = content.clone();
        let data = self
            .ledger
            .load(content.offset, content.length)
            .map_err(|e| format!("failed to load content {hash}: {e}"))?;
        Ok(FileRef {
            hash: content.hash,
            name: content.name,
            created: content.created,
            data: Bytes::from(data),
        })
    }

    // ========================================================================
    // Job execution
    // ========================================================================

    fn run_actions(&mut self) {
        while let Some(job) = self.actions.pop() {
            self.run_job(job);
        }
    }

    fn run_job(&mut self, job: Job) {
        match job {
            Job::CompileChecker { problem } => self.run_compile_checker(problem, job),
            Job::CompileSubmission { id } => self.run_compile_submission(id, job),
            Job::RunTest { id, test } => self.run_submission_test(id, test, job),
        }
    }

    /// Push a message onto the operator-facing problem queue. These are
    /// infrastructure troubles, not request failures: the enclosing
    /// operation has already succeeded and been logged.
    fn report(&mut self, message: String) {
        error!("{message}");
        self.reports.push(message);
    }

    fn take_idle_judge(&mut self) -> Option<JudgeId> {
        // The idle pool may hold ids whose connection died; skip those.
        while let Some(judge) = self.scheduler.take_judge() {
            if self.sessions.contains_key(&judge) {
                return Some(judge);
            }
        }
        None
    }

    fn run_compile_checker(&mut self, problem: usize, job: Job) {
        match self.prepare_compile_checker(problem) {
            Prep::Skip => {}
            Prep::UseSource => self.contest.checker_use_source(problem),
            Prep::Report(message) => self.report(message),
            Prep::Call(prep) => {
                let source = match self.file_ref(&prep.source) {
                    Ok(source) => source,
                    Err(message) => return self.report(message),
                };
                let Some(judge) = self.take_idle_judge() else {
                    self.scheduler.park(job);
                    return;
                };
                info!(
                    problem,
                    source = %source.name,
                    binary = %prep.binary_name,
                    "[re]compiling checker"
                );
                self.contest.checker_mark_compiling(problem);
                let Some(session) = self.sessions.get_mut(&judge) else {
                    return;
                };
                let packet = session.compile(
                    Purpose::CheckerCompile { problem },
                    CompileRequest {
                        command: prep.command,
                        binary_name: prep.binary_name,
                        source,
                    },
                );
                self.send(judge, &packet);
            }
        }
    }

    fn prepare_compile_checker(&self, problem: usize) -> Prep<PreparedCompile> {
        let Some(p) = self.contest.problem_get(problem) else {
            return Prep::Report(format!("checker compile for unknown problem #{problem}"));
        };
        let Some(checker) = &p.checker else {
            return Prep::Report(format!(
                "tried to compile undefined checker for problem #{problem}"
            ));
        };
        if checker.binary != CheckerBinary::Unset {
            return Prep::Skip;
        }
        let Some(compiler) = self.contest.compiler_get(&checker.compiler) else {
            return Prep::Report(format!(
                "compiler {} doesn't exist, needed for checker in problem #{problem}",
                checker.compiler
            ));
        };
        if compiler.is_interpreter() {
            return Prep::UseSource;
        }
        self.prepare_compile(&checker.source, compiler)
    }

    fn run_compile_submission(&mut self, id: u64, job: Job) {
        match self.prepare_compile_submission(id) {
            Prep::Skip => {}
            Prep::UseSource => {
                for job in self.contest.submission_use_source(id) {
                    self.actions.push(job);
                }
            }
            Prep::Report(message) => self.report(message),
            Prep::Call(prep) => {
                let source = match self.file_ref(&prep.source) {
                    Ok(source) => source,
                    Err(message) => return self.report(message),
                };
                let Some(judge) = self.take_idle_judge() else {
                    self.scheduler.park(job);
                    return;
                };
                info!(submit = id, binary = %prep.binary_name, "compiling submit");
                let Some(session) = self.sessions.get_mut(&judge) else {
                    return;
                };
                let packet = session.compile(
                    Purpose::SubmissionCompile { id },
                    CompileRequest {
                        command: prep.command,
                        binary_name: prep.binary_name,
                        source,
                    },
                );
                self.send(judge, &packet);
            }
        }
    }

    fn prepare_compile_submission(&self, id: u64) -> Prep<PreparedCompile> {
        let Some(sub) = self.contest.submission_get(id) else {
            return Prep::Report(format!("compile for unknown submit #{id}"));
        };
        if sub.binary.is_some() || sub.result.is_some() {
            return Prep::Skip;
        }
        let problem_ready = self
            .contest
            .problem_get(sub.problem)
            .is_some_and(|p| p.checker.is_some());
        if !problem_ready {
            return Prep::Report(format!(
                "failed to test submit #{id}: problem #{} doesn't exist or isn't ready",
                sub.problem
            ));
        }
        let Some(compiler) = self.contest.compiler_get(&sub.compiler) else {
            return Prep::Report(format!(
                "failed to compile submit #{id}: compiler not exists: {}",
                sub.compiler
            ));
        };
        if compiler.is_interpreter() {
            return Prep::UseSource;
        }
        self.prepare_compile(&sub.source, compiler)
    }

    /// Render the binary name and compile command for a source blob.
    fn prepare_compile(
        &self,
        source_hash: &str,
        compiler: &crate::domain::Compiler,
    ) -> Prep<PreparedCompile> {
        let (Some(binary_tpl), Some(compile_tpl)) = (&compiler.binary, &compiler.compile) else {
            return Prep::Report(format!(
                "compiler {} defines only one of binary/compile",
                compiler.id
            ));
        };
        let Some(source) = self.contest.content_get(source_hash) else {
            return Prep::Report(format!("content {source_hash} is not registered"));
        };
        let vars = HashMap::from([("name", source.name.as_str())]);
        let binary_name = match template::render(binary_tpl, &vars) {
            Ok(name) => name,
            Err(e) => return Prep::Report(format!("compiler {}: bad binary template: {e}", compiler.id)),
        };
        let vars = HashMap::from([
            ("name", source.name.as_str()),
            ("binary", binary_name.as_str()),
        ]);
        let command = match template::render(compile_tpl, &vars) {
            Ok(command) => command,
            Err(e) => {
                return Prep::Report(format!(
                    "compiler {}: bad compile template: {e}",
                    compiler.id
                ));
            }
        };
        Prep::Call(PreparedCompile {
            source: source_hash.to_string(),
            binary_name,
            command,
        })
    }

    fn run_submission_test(&mut self, id: u64, test: usize, job: Job) {
        match self.prepare_submission_test(id, test) {
            Prep::Skip => {}
            Prep::UseSource => {}
            Prep::Report(message) => self.report(message),
            Prep::Call(prep) => {
                let loaded = (|| {
                    Ok::<_, String>((
                        self.file_ref(&prep.binary)?,
                        self.file_ref(&prep.test)?,
                        self.file_ref(&prep.answer)?,
                        self.file_ref(&prep.checker)?,
                    ))
                })();
                let (binary, test_file, answer, checker) = match loaded {
                    Ok(files) => files,
                    Err(message) => return self.report(message),
                };
                let Some(judge) = self.take_idle_judge() else {
                    self.scheduler.park(job);
                    return;
                };
                debug!(submit = id, test, "dispatching test");
                let Some(session) = self.sessions.get_mut(&judge) else {
                    return;
                };
                let packet = session.test(
                    Purpose::SubmissionTest { id, test },
                    TestRequest {
                        binary,
                        run: prep.run,
                        test: test_file,
                        answer,
                        input: prep.input,
                        output: prep.output,
                        time_limit_ms: prep.time_limit_ms,
                        memory_limit_bytes: prep.memory_limit_bytes,
                        checker,
                        checker_run: prep.checker_run,
                    },
                );
                self.send(judge, &packet);
            }
        }
    }

    fn prepare_submission_test(&self, id: u64, test: usize) -> Prep<PreparedTest> {
        let Some(sub) = self.contest.submission_get(id) else {
            return Prep::Report(format!("test for unknown submit #{id}"));
        };
        if sub.result.is_some() || sub.runs.get(test).is_none_or(|r| r.is_some()) {
            return Prep::Skip;
        }
        let Some(problem) = self.contest.problem_get(sub.problem) else {
            return Prep::Report(format!(
                "failed to test submit #{id}: problem #{} doesn't exist",
                sub.problem
            ));
        };
        let not_ready = || {
            Prep::Report(format!(
                "failed to test submit #{id}: problem #{} isn't ready",
                sub.problem
            ))
        };
        let Some(checker) = problem.checker.as_ref() else {
            return not_ready();
        };
        let CheckerBinary::Ready(checker_binary) = &checker.binary else {
            return not_ready();
        };
        let checker_binary = checker_binary.clone();
        let Some(sub_compiler) = self.contest.compiler_get(&sub.compiler) else {
            return Prep::Report(format!(
                "failed to test submit #{id}: compiler not exists: {}",
                sub.compiler
            ));
        };
        let Some(chk_compiler) = self.contest.compiler_get(&checker.compiler) else {
            return Prep::Report(format!(
                "failed to test submit #{id}: compiler not exists: {}",
                checker.compiler
            ));
        };
        let Some(binary) = sub.binary.clone() else {
            return Prep::Report(format!("test for uncompiled submit #{id}"));
        };
        let Some(case) = sub.tests.get(test) else {
            return Prep::Skip;
        };

        let run = match self.render_run(sub_compiler, &sub.source, &binary) {
            Ok(run) => run,
            Err(message) => return Prep::Report(message),
        };
        let checker_run = match self.render_run(chk_compiler, &checker.source, &checker_binary) {
            Ok(run) => run,
            Err(message) => return Prep::Report(message),
        };

        Prep::Call(PreparedTest {
            binary,
            run,
            test: case.test.clone(),
            answer: case.answer.clone(),
            input: problem.input.clone(),
            output: problem.output.clone(),
            time_limit_ms: problem.time_limit_ms,
            memory_limit_bytes: problem.memory_limit_bytes,
            checker: checker_binary,
            checker_run,
        })
    }

    /// Render a compiler's run command over the source and binary names.
    /// A missing run template, or the legacy literal `$binary`, means the
    /// binary is executed directly.
    fn render_run(
        &self,
        compiler: &crate::domain::Compiler,
        source_hash: &str,
        binary_hash: &str,
    ) -> std::result::Result<Option<String>, String> {
        let Some(run_tpl) = &compiler.run else {
            return Ok(None);
        };
        if run_tpl == "$binary" {
            warn!(compiler = %compiler.id, "compiler has deprecated run string");
            return Ok(None);
        }
        let source_name = self
            .contest
            .content_get(source_hash)
            .map(|c| c.name.clone())
            .ok_or_else(|| format!("content {source_hash} is not registered"))?;
        let binary_name = self
            .contest
            .content_get(binary_hash)
            .map(|c| c.name.clone())
            .ok_or_else(|| format!("content {binary_hash} is not registered"))?;
        let vars = HashMap::from([
            ("name", source_name.as_str()),
            ("binary", binary_name.as_str()),
        ]);
        template::render(run_tpl, &vars)
            .map(Some)
            .map_err(|e| format!("compiler {}: bad run template: {e}", compiler.id))
    }

    // ========================================================================
    // Call completion
    // ========================================================================

    fn complete_call(&mut self, purpose: Purpose, reply: WorkerReply) -> Result<()> {
        match (purpose, reply) {
            (
                Purpose::CheckerCompile { problem },
                WorkerReply::Compiled {
                    binary,
                    name,
                    output,
                },
            ) => {
                info!(
                    problem,
                    size = binary.len(),
                    "checker compiled:\n{}",
                    String::from_utf8_lossy(&output)
                );
                let binary = self.save_content(&binary, Some(&name))?;
                let output = self.save_content(&output, None)?;
                self.commit(Event::CheckerCompiled {
                    id: problem,
                    binary,
                    output,
                })?;
            }
            (Purpose::CheckerCompile { problem }, WorkerReply::CompileFailed { output }) => {
                self.contest.checker_reset(problem);
                self.report(format!(
                    "failed to compile checker for problem #{problem}:\n{}",
                    String::from_utf8_lossy(&output)
                ));
            }
            (Purpose::CheckerCompile { problem }, _) => {
                self.report(format!("failed to compile checker for problem #{problem}"));
            }
            (
                Purpose::SubmissionCompile { id },
                WorkerReply::Compiled {
                    binary,
                    name,
                    output,
                },
            ) => {
                info!(
                    submit = id,
                    size = binary.len(),
                    "submit compiled:\n{}",
                    String::from_utf8_lossy(&output)
                );
                let binary = self.save_content(&binary, Some(&name))?;
                let output = self.save_content(&output, None)?;
                self.commit(Event::SubmitCompiled { id, binary, output })?;
            }
            (Purpose::SubmissionCompile { id }, WorkerReply::CompileFailed { output }) => {
                info!(
                    submit = id,
                    "compilation error:\n{}",
                    String::from_utf8_lossy(&output)
                );
                let output = self.save_content(&output, None)?;
                self.commit(Event::SubmitCompiled {
                    id,
                    binary: String::new(),
                    output,
                })?;
            }
            (Purpose::SubmissionCompile { id }, _) => {
                self.report(format!("failed to compile submit #{id}"));
            }
            (
                Purpose::SubmissionTest { id, test },
                WorkerReply::Tested {
                    status,
                    time_ms,
                    memory_bytes,
                },
            ) => {
                info!(submit = id, test, %status, "test verdict");
                self.commit(Event::SubmitTest {
                    id,
                    test,
                    status,
                    time_ms,
                    memory_bytes,
                })?;
            }
            (Purpose::SubmissionTest { id, test }, _) => {
                self.report(format!(
                    "judge answered test #{test} of submit #{id} with a compile reply"
                ));
            }
        }
        Ok(())
    }

    fn send(&mut self, judge: JudgeId, packet: &Packet) {
        if let Some(tx) = self.outbound.get(&judge) {
            if tx.send(packet.encode()).is_err() {
                warn!(judge, "judge writer is gone; packet dropped");
            }
        } else {
            warn!(judge, "no outbound channel for judge; packet dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_engine(dir: &tempfile::TempDir) -> Engine {
        let prefix = dir.path().join("contest").to_string_lossy().into_owned();
        Engine::open(&prefix, None).unwrap()
    }

    #[test]
    fn test_content_addressing_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = open_engine(&dir);

        let a = engine.save_content(b"same bytes", Some("a.txt")).unwrap();
        let b = engine.save_content(b"same bytes", Some("b.txt")).unwrap();
        assert_eq!(a, b);
        let other = engine.save_content(b"other bytes", None).unwrap();
        assert_ne!(a, other);

        assert_eq!(engine.load_content(&a).as_deref(), Some(&b"same bytes"[..]));
        assert_eq!(engine.load_content(&other).as_deref(), Some(&b"other bytes"[..]));
    }

    #[test]
    fn test_content_hash_is_md5() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = open_engine(&dir);
        let hash = engine.save_content(b"", None).unwrap();
        assert_eq!(hash, "d41d8cd98f00b204e9800998ecf8427e");
        // With no name given, the blob is named after its hash.
        assert_eq!(engine.contest().content_get(&hash).unwrap().name, hash);
    }

    #[test]
    fn test_unknown_event_in_log_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("contest").to_string_lossy().into_owned();
        std::fs::write(format!("{prefix}.log"), "100\tproblem.rename\t\"x\"\n").unwrap();

        let err = Engine::open(&prefix, None).unwrap_err();
        assert!(matches!(err, crate::error::CoreError::UnknownEvent(name) if name == "problem.rename"));
    }
}
