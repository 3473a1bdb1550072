// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The domain event vocabulary.
//!
//! Every durable state change is one of these events. The log stores them
//! as `(name, ordered fields)` records; [`Event::from_record`] is the only
//! place a record becomes typed, and an unrecognized name there is fatal:
//! the store refuses to guess what an unknown event would have done.
//! Matching on the enum is exhaustive, so adding a variant forces every
//! replay site to handle it.

use tundra_protocol::Status;

use crate::error::CoreError;

/// A durable state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A blob was appended to the content store.
    Content {
        /// Hex MD5 of the blob bytes.
        hash: String,
        /// Original filename.
        name: String,
        /// Start offset in the content store.
        offset: u64,
        /// Blob length in bytes.
        length: u64,
    },
    /// A compiler was registered. Null binary/compile templates mark an
    /// interpreted language with no compile step.
    CompilerAdd {
        /// Compiler id, e.g. `g++-13`.
        id: String,
        /// Binary name template over `$name`.
        binary: Option<String>,
        /// Compile command template over `$name`/`$binary`.
        compile: Option<String>,
        /// Run command template over `$name`/`$binary`.
        run: Option<String>,
    },
    /// A compiler's templates were replaced.
    CompilerModify {
        /// Compiler id.
        id: String,
        /// New binary name template.
        binary: Option<String>,
        /// New compile command template.
        compile: Option<String>,
        /// New run command template.
        run: Option<String>,
    },
    /// A compiler was removed.
    CompilerRemove {
        /// Compiler id.
        id: String,
    },
    /// A team account was created.
    TeamAdd {
        /// Unique login.
        login: String,
        /// Display name.
        name: String,
        /// Password.
        password: String,
    },
    /// A problem was created. Ids are dense: the embedded id must equal
    /// the problem table's current length.
    ProblemCreate {
        /// Problem id.
        id: usize,
        /// Short name.
        name: String,
        /// Full statement.
        full: String,
    },
    /// A problem's name/statement were replaced.
    ProblemModify {
        /// Problem id.
        id: usize,
        /// New short name.
        name: String,
        /// New full statement.
        full: String,
    },
    /// A problem's I/O stream names were set.
    ProblemFilesSet {
        /// Problem id.
        id: usize,
        /// Input stream name.
        input: String,
        /// Output stream name.
        output: String,
    },
    /// A problem's execution limits were set.
    ProblemLimitsSet {
        /// Problem id.
        id: usize,
        /// Time limit, milliseconds.
        time_ms: u64,
        /// Memory limit, bytes.
        memory_bytes: u64,
    },
    /// A test case was appended to a problem.
    ProblemTestAdd {
        /// Problem id.
        id: usize,
        /// Content hash of the test input.
        test: String,
        /// Content hash of the expected answer.
        answer: String,
    },
    /// A checker was attached to a problem.
    CheckerSet {
        /// Problem id.
        id: usize,
        /// Content hash of the checker source.
        source: String,
        /// Compiler id for the checker.
        compiler: String,
    },
    /// The checker binary was invalidated for recompilation.
    CheckerRecompile {
        /// Problem id.
        id: usize,
    },
    /// A checker compile finished on a judge.
    CheckerCompiled {
        /// Problem id.
        id: usize,
        /// Content hash of the checker binary.
        binary: String,
        /// Content hash of the compiler output.
        output: String,
    },
    /// A solution was submitted. Ids are dense like problem ids.
    Submit {
        /// Submission id.
        id: u64,
        /// Target problem.
        problem: usize,
        /// Content hash of the source.
        source: String,
        /// Compiler id.
        compiler: String,
    },
    /// A solution was submitted through the open archive.
    ArchiveSubmit {
        /// Submission id.
        id: u64,
        /// Submitting team login.
        team: String,
        /// Target problem.
        problem: usize,
        /// Content hash of the source.
        source: String,
        /// Compiler id.
        compiler: String,
    },
    /// A submission compile finished. An empty binary hash means the
    /// compilation failed and the submission resolves to CE.
    SubmitCompiled {
        /// Submission id.
        id: u64,
        /// Content hash of the binary, or empty on compile error.
        binary: String,
        /// Content hash of the compiler output.
        output: String,
    },
    /// One test verdict arrived for a submission.
    SubmitTest {
        /// Submission id.
        id: u64,
        /// Test index within the submission's snapshot.
        test: usize,
        /// Verdict.
        status: Status,
        /// Peak run time, milliseconds.
        time_ms: u64,
        /// Peak memory, bytes.
        memory_bytes: u64,
    },
    /// A problem was exposed in the archive.
    ArchiveAdd {
        /// Problem id.
        problem: usize,
    },
    /// An archive entry was removed by position.
    ArchiveRemove {
        /// Index into the archive's problem list.
        index: usize,
    },
    /// A compiler was exposed in the archive under a display name.
    ArchiveCompilerAdd {
        /// Compiler id.
        id: String,
        /// Display name.
        name: String,
    },
    /// A compiler was withdrawn from the archive.
    ArchiveCompilerRemove {
        /// Compiler id.
        id: String,
    },
}

impl Event {
    /// The log name of this event.
    pub fn name(&self) -> &'static str {
        match self {
            Event::Content { .. } => "content",
            Event::CompilerAdd { .. } => "compiler.add",
            Event::CompilerModify { .. } => "compiler.modify",
            Event::CompilerRemove { .. } => "compiler.remove",
            Event::TeamAdd { .. } => "team.add",
            Event::ProblemCreate { .. } => "problem.create",
            Event::ProblemModify { .. } => "problem.modify",
            Event::ProblemFilesSet { .. } => "problem.files.set",
            Event::ProblemLimitsSet { .. } => "problem.limits.set",
            Event::ProblemTestAdd { .. } => "problem.test.add",
            Event::CheckerSet { .. } => "problem.checker.set",
            Event::CheckerRecompile { .. } => "problem.checker.recompile",
            Event::CheckerCompiled { .. } => "problem.checker.compiled",
            Event::Submit { .. } => "submit",
            Event::ArchiveSubmit { .. } => "archive.submit",
            Event::SubmitCompiled { .. } => "submit.compiled",
            Event::SubmitTest { .. } => "submit.test",
            Event::ArchiveAdd { .. } => "archive.add",
            Event::ArchiveRemove { .. } => "archive.remove",
            Event::ArchiveCompilerAdd { .. } => "archive.compiler.add",
            Event::ArchiveCompilerRemove { .. } => "archive.compiler.remove",
        }
    }

    /// The ordered field list as written to the log.
    pub fn fields(&self) -> Vec<Option<String>> {
        fn s(v: impl ToString) -> Option<String> {
            Some(v.to_string())
        }
        match self {
            Event::Content {
                hash,
                name,
                offset,
                length,
            } => vec![s(hash), s(name), s(offset), s(length)],
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
            } => vec![s(id), binary.clone(), compile.clone(), run.clone()],
            Event::CompilerRemove { id } => vec![s(id)],
            Event::TeamAdd {
                login,
                name,
                password,
            } => vec![s(login), s(name), s(password)],
            Event::ProblemCreate { id, name, full }
            | Event::ProblemModify { id, name, full } => vec![s(id), s(name), s(full)],
            Event::ProblemFilesSet { id, input, output } => vec![s(id), s(input), s(output)],
            Event::ProblemLimitsSet {
                id,
                time_ms,
                memory_bytes,
            } => vec![s(id), s(time_ms), s(memory_bytes)],
            Event::ProblemTestAdd { id, test, answer } => vec![s(id), s(test), s(answer)],
            Event::CheckerSet {
                id,
                source,
                compiler,
            } => vec![s(id), s(source), s(compiler)],
            Event::CheckerRecompile { id } => vec![s(id)],
            Event::CheckerCompiled { id, binary, output } => vec![s(id), s(binary), s(output)],
            Event::Submit {
                id,
                problem,
                source,
                compiler,
            } => vec![s(id), s(problem), s(source), s(compiler)],
            Event::ArchiveSubmit {
                id,
                team,
                problem,
                source,
                compiler,
            } => vec![s(id), s(team), s(problem), s(source), s(compiler)],
            Event::SubmitCompiled { id, binary, output } => vec![s(id), s(binary), s(output)],
            Event::SubmitTest {
                id,
                test,
                status,
                time_ms,
                memory_bytes,
            } => vec![s(id), s(test), s(status), s(time_ms), s(memory_bytes)],
            Event::ArchiveAdd { problem } => vec![s(problem)],
            Event::ArchiveRemove { index } => vec![s(index)],
            Event::ArchiveCompilerAdd { id, name } => vec![s(id), s(name)],
            Event::ArchiveCompilerRemove { id } => vec![s(id)],
        }
    }

    /// Reconstruct an event from a log record.
    pub fn from_record(name: &str, fields: &[Option<String>]) -> Result<Event, CoreError> {
        let mut f = Fields::new(name, fields);
        let event = match name {
            "content" => Event::Content {
                hash: f.string()?,
                name: f.string()?,
                offset: f.number()?,
                length: f.number()?,
            },
            "compiler.add" => Event::CompilerAdd {
                id: f.string()?,
                binary: f.optional()?,
                compile: f.optional()?,
                run: f.optional()?,
            },
            "compiler.modify" => Event::CompilerModify {
                id: f.string()?,
                binary: f.optional()?,
                compile: f.optional()?,
                run: f.optional()?,
            },
            "compiler.remove" => Event::CompilerRemove { id: f.string()? },
            "team.add" => Event::TeamAdd {
                login: f.string()?,
                name: f.string()?,
                password: f.string()?,
            },
            "problem.create" => Event::ProblemCreate {
                id: f.number()?,
                name: f.string()?,
                full: f.string()?,
            },
            "problem.modify" => Event::ProblemModify {
                id: f.number()?,
                name: f.string()?,
                full: f.string()?,
            },
            "problem.files.set" => Event::ProblemFilesSet {
                id: f.number()?,
                input: f.string()?,
                output: f.string()?,
            },
            "problem.limits.set" => Event::ProblemLimitsSet {
                id: f.number()?,
                time_ms: f.number()?,
                memory_bytes: f.number()?,
            },
            "problem.test.add" => Event::ProblemTestAdd {
                id: f.number()?,
                test: f.string()?,
                answer: f.string()?,
            },
            "problem.checker.set" => Event::CheckerSet {
                id: f.number()?,
                source: f.string()?,
                compiler: f.string()?,
            },
            "problem.checker.recompile" => Event::CheckerRecompile { id: f.number()? },
            "problem.checker.compiled" => Event::CheckerCompiled {
                id: f.number()?,
                binary: f.string()?,
                output: f.string()?,
            },
            "submit" => Event::Submit {
                id: f.number()?,
                problem: f.number()?,
                source: f.string()?,
                compiler: f.string()?,
            },
            "archive.submit" => Event::ArchiveSubmit {
                id: f.number()?,
                team: f.string()?,
                problem: f.number()?,
                source: f.string()?,
                compiler: f.string()?,
            },
            "submit.compiled" => Event::SubmitCompiled {
                id: f.number()?,
                binary: f.string()?,
                output: f.string()?,
            },
            "submit.test" => Event::SubmitTest {
                id: f.number()?,
                test: f.number()?,
                status: f.status()?,
                time_ms: f.number()?,
                memory_bytes: f.number()?,
            },
            "archive.add" => Event::ArchiveAdd {
                problem: f.number()?,
            },
            "archive.remove" => Event::ArchiveRemove { index: f.number()? },
            "archive.compiler.add" => Event::ArchiveCompilerAdd {
                id: f.string()?,
                name: f.string()?,
            },
            "archive.compiler.remove" => Event::ArchiveCompilerRemove { id: f.string()? },
            other => return Err(CoreError::UnknownEvent(other.to_string())),
        };
        f.finish()?;
        Ok(event)
    }
}

/// Positional field cursor for [`Event::from_record`].
struct Fields<'a> {
    name: &'a str,
    fields: &'a [Option<String>],
    at: usize,
}

impl<'a> Fields<'a> {
    fn new(name: &'a str, fields: &'a [Option<String>]) -> Self {
        Self {
            name,
            fields,
            at: 0,
        }
    }

    fn malformed(&self, reason: impl Into<String>) -> CoreError {
        CoreError::Malformed {
            name: self.name.to_string(),
            reason: reason.into(),
        }
    }

    fn optional(&mut self) -> Result<Option<String>, CoreError> {
        let field = self
            .fields
            .get(self.at)
            .ok_or_else(|| self.malformed(format!("missing field {}", self.at)))?;
        self.at += 1;
        Ok(field.clone())
    }

    fn string(&mut self) -> Result<String, CoreError> {
        let at = self.at;
        self.optional()?
            .ok_or_else(|| self.malformed(format!("field {at} must not be null")))
    }

    fn number<N: std::str::FromStr>(&mut self) -> Result<N, CoreError> {
        let raw = self.string()?;
        raw.parse()
            .map_err(|_| self.malformed(format!("invalid number: {raw:?}")))
    }

    fn status(&mut self) -> Result<Status, CoreError> {
        let raw = self.string()?;
        Status::from_wire(raw.as_bytes())
            .ok_or_else(|| self.malformed(format!("invalid status: {raw:?}")))
    }

    fn finish(&self) -> Result<(), CoreError> {
        if self.at == self.fields.len() {
            Ok(())
        } else {
            Err(self.malformed(format!(
                "expected {} fields, got {}",
                self.at,
                self.fields.len()
            )))
        }
    }
}
