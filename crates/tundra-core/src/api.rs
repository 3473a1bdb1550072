// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control-channel actions.
//!
//! Requests arrive as flat JSON objects with an `action` name; the reply is
//! the action's result, or `false` for anything malformed, unknown, or
//! invalid. Validation failures change no state and append no event. File
//! payloads cross this boundary base64-encoded.
//!
//! These actions are the only entry points into the domain model from
//! outside; everything they change goes through [`Engine::commit`].

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Map, Value, json};
use tracing::warn;

use crate::engine::Engine;
use crate::error::Result;
use crate::event::Event;

const FALSE: Value = Value::Bool(false);

type Args = Map<String, Value>;

fn str_arg<'a>(data: &'a Args, key: &str) -> Option<&'a str> {
    data.get(key)?.as_str()
}

/// A value that must be present but may be JSON null (interpreters have
/// null compile templates).
fn nullable_str_arg(data: &Args, key: &str) -> Option<Option<String>> {
    match data.get(key)? {
        Value::Null => Some(None),
        Value::String(s) => Some(Some(s.clone())),
        _ => None,
    }
}

fn uint_arg(data: &Args, key: &str) -> Option<u64> {
    data.get(key)?.as_u64()
}

fn int_arg(data: &Args, key: &str) -> Option<i64> {
    data.get(key)?.as_i64()
}

fn b64_arg(data: &Args, key: &str) -> Option<Vec<u8>> {
    BASE64.decode(str_arg(data, key)?).ok()
}

fn b64_string(data: &[u8]) -> String {
    BASE64.encode(data)
}

impl Engine {
    /// Execute one control action and produce its JSON reply.
    pub fn dispatch(&mut self, request: &Value) -> Result<Value> {
        let Some(data) = request.as_object() else {
            return Ok(FALSE);
        };
        let Some(action) = data.get("action").and_then(Value::as_str) else {
            return Ok(FALSE);
        };
        match action {
            "ping" => Ok(json!(true)),

            "compiler.add" => self.compiler_add(data),
            "compiler.info" => Ok(self.compiler_info(data)),
            "compiler.list" => Ok(json!(self.contest().compiler_list())),
            "compiler.modify" => self.compiler_modify(data),
            "compiler.remove" => self.compiler_remove(data),

            "team.add" => self.team_add(data),
            "team.info" => Ok(self.team_info(data)),
            "team.login" => Ok(self.team_login(data)),

            "problem.create" => self.problem_create(data),
            "problem.info" => Ok(self.problem_info(data)),
            "problem.modify" => self.problem_modify(data),
            "problem.files.set" => self.problem_files_set(data),
            "problem.limits.set" => self.problem_limits_set(data),
            "problem.test.add" => self.problem_test_add(data),
            "problem.test.count" => Ok(self.problem_test_count(data)),
            "problem.checker.set" => self.problem_checker_set(data),
            "problem.checker.source" => Ok(self.problem_checker_source(data)),
            "problem.checker.recompile" => self.problem_checker_recompile(data),

            "submit" => self.submit(data),
            "submit.info" => Ok(self.submit_info(data)),
            "submit.report" => Ok(self.submit_report(data)),
            "submit.source" => Ok(self.submit_source(data)),

            "archive.add" => self.archive_add(data),
            "archive.remove" => self.archive_remove(data),
            "archive.count" => Ok(json!(self.contest().archive().problem_list.len())),
            "archive.list" => Ok(self.archive_list(data)),
            "archive.compiler.add" => self.archive_compiler_add(data),
            "archive.compiler.list" => Ok(self.archive_compiler_list()),
            "archive.compiler.remove" => self.archive_compiler_remove(data),
            "archive.submit" => self.archive_submit(data),
            "archive.submits" => Ok(self.archive_submits(data)),

            other => {
                warn!(action = other, "unknown control action");
                Ok(FALSE)
            }
        }
    }

    // ========================================================================
    // Compilers
    // ========================================================================

    fn compiler_add(&mut self, data: &Args) -> Result<Value> {
        let (Some(id), Some(binary), Some(compile), Some(run)) = (
            str_arg(data, "id"),
            nullable_str_arg(data, "binary"),
            nullable_str_arg(data, "compile"),
            nullable_str_arg(data, "run"),
        ) else {
            return Ok(FALSE);
        };
        if self.contest().compiler_get(id).is_some() {
            return Ok(FALSE);
        }
        self.commit(Event::CompilerAdd {
            id: id.to_string(),
            binary,
            compile,
            run,
        })?;
        Ok(json!(true))
    }

    fn compiler_info(&self, data: &Args) -> Value {
        let Some(id) = data.get("id") else {
            return FALSE;
        };
        self.compiler_info_value(id)
    }

    fn compiler_info_value(&self, id: &Value) -> Value {
        if let Some(list) = id.as_array() {
            return Value::Array(list.iter().map(|x| self.compiler_info_value(x)).collect());
        }
        let Some(compiler) = id.as_str().and_then(|id| self.contest().compiler_get(id)) else {
            return FALSE;
        };
        json!({
            "id": compiler.id,
            "binary": compiler.binary,
            "compile": compiler.compile,
            "run": compiler.run,
        })
    }

    fn compiler_modify(&mut self, data: &Args) -> Result<Value> {
        let (Some(id), Some(binary), Some(compile), Some(run)) = (
            str_arg(data, "id"),
            nullable_str_arg(data, "binary"),
            nullable_str_arg(data, "compile"),
            nullable_str_arg(data, "run"),
        ) else {
            return Ok(FALSE);
        };
        if self.contest().compiler_get(id).is_none() {
            return Ok(FALSE);
        }
        self.commit(Event::CompilerModify {
            id: id.to_string(),
            binary,
            compile,
            run,
        })?;
        Ok(json!(true))
    }

    fn compiler_remove(&mut self, data: &Args) -> Result<Value> {
        let Some(id) = str_arg(data, "id") else {
            return Ok(FALSE);
        };
        if self.contest().compiler_get(id).is_none() {
            return Ok(FALSE);
        }
        self.commit(Event::CompilerRemove { id: id.to_string() })?;
        Ok(json!(true))
    }

    // ========================================================================
    // Teams
    // ========================================================================

    fn team_add(&mut self, data: &Args) -> Result<Value> {
        let (Some(login), Some(name), Some(password)) = (
            str_arg(data, "login"),
            str_arg(data, "name"),
            str_arg(data, "password"),
        ) else {
            return Ok(FALSE);
        };
        if self.contest().team_get(login).is_some() {
            return Ok(FALSE);
        }
        self.commit(Event::TeamAdd {
            login: login.to_string(),
            name: name.to_string(),
            password: password.to_string(),
        })?;
        Ok(json!(true))
    }

    fn team_info(&self, data: &Args) -> Value {
        let Some(login) = data.get("login") else {
            return FALSE;
        };
        self.team_info_value(login)
    }

    fn team_info_value(&self, login: &Value) -> Value {
        if let Some(list) = login.as_array() {
            return Value::Array(list.iter().map(|x| self.team_info_value(x)).collect());
        }
        let Some(team) = login.as_str().and_then(|l| self.contest().team_get(l)) else {
            return FALSE;
        };
        json!({ "login": team.login, "name": team.name })
    }

    fn team_login(&self, data: &Args) -> Value {
        let (Some(login), Some(password)) =
            (str_arg(data, "login"), str_arg(data, "password"))
        else {
            return FALSE;
        };
        let ok = self
            .contest()
            .team_get(login)
            .is_some_and(|team| team.password == password);
        json!(ok)
    }

    // ========================================================================
    // Problems
    // ========================================================================

    fn problem_create(&mut self, data: &Args) -> Result<Value> {
        let (Some(name), Some(full)) = (str_arg(data, "name"), str_arg(data, "full")) else {
            return Ok(FALSE);
        };
        let id = self.contest().problem_count();
        self.commit(Event::ProblemCreate {
            id,
            name: name.to_string(),
            full: full.to_string(),
        })?;
        Ok(json!(id))
    }

    fn problem_info(&self, data: &Args) -> Value {
        let Some(id) = data.get("id") else {
            return FALSE;
        };
        self.problem_info_value(id)
    }

    fn problem_info_value(&self, id: &Value) -> Value {
        if let Some(list) = id.as_array() {
            return Value::Array(list.iter().map(|x| self.problem_info_value(x)).collect());
        }
        let Some(problem) = id
            .as_u64()
            .and_then(|id| self.contest().problem_get(id as usize))
        else {
            return FALSE;
        };
        json!({
            "name": problem.name,
            "full": problem.full,
            "input": problem.input,
            "output": problem.output,
            "time_limit": problem.time_limit_ms,
            "memory_limit": problem.memory_limit_bytes,
            "tests": problem.tests.len(),
        })
    }

    fn problem_modify(&mut self, data: &Args) -> Result<Value> {
        let (Some(id), Some(name), Some(full)) = (
            uint_arg(data, "id"),
            str_arg(data, "name"),
            str_arg(data, "full"),
        ) else {
            return Ok(FALSE);
        };
        let id = id as usize;
        if self.contest().problem_get(id).is_none() {
            return Ok(FALSE);
        }
        self.commit(Event::ProblemModify {
            id,
            name: name.to_string(),
            full: full.to_string(),
        })?;
        Ok(json!(true))
    }

    fn problem_files_set(&mut self, data: &Args) -> Result<Value> {
        let (Some(id), Some(input), Some(output)) = (
            uint_arg(data, "id"),
            str_arg(data, "input"),
            str_arg(data, "output"),
        ) else {
            return Ok(FALSE);
        };
        let id = id as usize;
        if self.contest().problem_get(id).is_none() {
            return Ok(FALSE);
        }
        self.commit(Event::ProblemFilesSet {
            id,
            input: input.to_string(),
            output: output.to_string(),
        })?;
        Ok(json!(true))
    }

    fn problem_limits_set(&mut self, data: &Args) -> Result<Value> {
        let (Some(id), Some(time), Some(memory)) = (
            uint_arg(data, "id"),
            uint_arg(data, "time"),
            uint_arg(data, "memory"),
        ) else {
            return Ok(FALSE);
        };
        let id = id as usize;
        if self.contest().problem_get(id).is_none() {
            return Ok(FALSE);
        }
        self.commit(Event::ProblemLimitsSet {
            id,
            time_ms: time,
            memory_bytes: memory,
        })?;
        Ok(json!(true))
    }

    fn problem_test_add(&mut self, data: &Args) -> Result<Value> {
        let (Some(id), Some(test), Some(answer)) = (
            uint_arg(data, "id"),
            b64_arg(data, "test"),
            b64_arg(data, "answer"),
        ) else {
            return Ok(FALSE);
        };
        let id = id as usize;
        if self.contest().problem_get(id).is_none() {
            return Ok(FALSE);
        }
        let test = self.save_content(&test, None)?;
        let answer = self.save_content(&answer, None)?;
        self.commit(Event::ProblemTestAdd { id, test, answer })?;
        Ok(json!(true))
    }

    fn problem_test_count(&self, data: &Args) -> Value {
        let Some(problem) = uint_arg(data, "id")
            .and_then(|id| self.contest().problem_get(id as usize))
        else {
            return FALSE;
        };
        json!(problem.tests.len())
    }

    fn problem_checker_set(&mut self, data: &Args) -> Result<Value> {
        let (Some(id), Some(name), Some(source), Some(compiler)) = (
            uint_arg(data, "id"),
            str_arg(data, "name"),
            b64_arg(data, "source"),
            str_arg(data, "compiler"),
        ) else {
            return Ok(FALSE);
        };
        let id = id as usize;
        if self.contest().problem_get(id).is_none()
            || self.contest().compiler_get(compiler).is_none()
        {
            return Ok(FALSE);
        }
        let compiler = compiler.to_string();
        let source = self.save_content(&source, Some(name))?;
        self.commit(Event::CheckerSet {
            id,
            source,
            compiler,
        })?;
        Ok(json!(true))
    }

    fn problem_checker_source(&mut self, data: &Args) -> Value {
        let Some(problem) = uint_arg(data, "id")
            .and_then(|id| self.contest().problem_get(id as usize))
        else {
            return FALSE;
        };
        let Some(checker) = &problem.checker else {
            return Value::Null;
        };
        let source = checker.source.clone();
        match self.load_content(&source) {
            Some(bytes) => json!(b64_string(&bytes)),
            None => FALSE,
        }
    }

    fn problem_checker_recompile(&mut self, data: &Args) -> Result<Value> {
        let Some(id) = uint_arg(data, "id") else {
            return Ok(FALSE);
        };
        let id = id as usize;
        if self.contest().problem_get(id).is_none() {
            return Ok(FALSE);
        }
        self.commit(Event::CheckerRecompile { id })?;
        Ok(json!(true))
    }

    // ========================================================================
    // Submissions
    // ========================================================================

    fn submit(&mut self, data: &Args) -> Result<Value> {
        let (Some(problem), Some(name), Some(source), Some(compiler)) = (
            uint_arg(data, "problem"),
            str_arg(data, "name"),
            b64_arg(data, "source"),
            str_arg(data, "compiler"),
        ) else {
            return Ok(FALSE);
        };
        let problem = problem as usize;
        if self.contest().problem_get(problem).is_none()
            || self.contest().compiler_get(compiler).is_none()
        {
            return Ok(FALSE);
        }
        let compiler = compiler.to_string();
        let source = self.save_content(&source, Some(name))?;
        let id = self.contest().submission_count();
        self.commit(Event::Submit {
            id,
            problem,
            source,
            compiler,
        })?;
        Ok(json!(id))
    }

    fn submit_info(&self, data: &Args) -> Value {
        let Some(id) = data.get("id") else {
            return FALSE;
        };
        self.submit_info_value(id)
    }

    fn submit_info_value(&self, id: &Value) -> Value {
        if let Some(list) = id.as_array() {
            return Value::Array(list.iter().map(|x| self.submit_info_value(x)).collect());
        }
        let Some(id) = id.as_u64() else {
            return FALSE;
        };
        let Some(sub) = self.contest().submission_get(id) else {
            return FALSE;
        };
        let mut info = json!({
            "id": id,
            "problem": sub.problem,
            "status": "Waiting",
            "time": sub.created,
        });
        if sub.binary.is_some() {
            info["status"] = json!("Running");
        }
        if let Some(result) = sub.result {
            info["status"] = json!("Result");
            info["result"] = if result.accepted() {
                json!("AC")
            } else {
                json!(result.status.as_wire())
            };
            info["test"] = json!(result.failed_test);
        }
        info
    }

    fn submit_report(&mut self, data: &Args) -> Value {
        let Some(id) = data.get("id") else {
            return FALSE;
        };
        self.submit_report_value(id)
    }

    fn submit_report_value(&mut self, id: &Value) -> Value {
        if let Some(list) = id.as_array() {
            return Value::Array(
                list.iter().map(|x| self.submit_report_value(x)).collect(),
            );
        }
        let Some(id) = id.as_u64() else {
            return FALSE;
        };
        let Some(sub) = self.contest().submission_get(id) else {
            return FALSE;
        };
        if sub.binary.is_none() {
            return FALSE;
        }
        let output = match sub.compiler_output.clone() {
            Some(hash) => match self.load_content(&hash) {
                Some(bytes) => bytes,
                None => return FALSE,
            },
            None => Vec::new(),
        };
        json!({ "compiler_output": b64_string(&output) })
    }

    fn submit_source(&mut self, data: &Args) -> Value {
        let Some(id) = data.get("id") else {
            return FALSE;
        };
        self.submit_source_value(id)
    }

    fn submit_source_value(&mut self, id: &Value) -> Value {
        if let Some(list) = id.as_array() {
            return Value::Array(
                list.iter().map(|x| self.submit_source_value(x)).collect(),
            );
        }
        let Some(source) = id
            .as_u64()
            .and_then(|id| self.contest().submission_get(id))
            .map(|sub| sub.source.clone())
        else {
            return FALSE;
        };
        match self.load_content(&source) {
            Some(bytes) => json!(b64_string(&bytes)),
            None => FALSE,
        }
    }

    // ========================================================================
    // Archive
    // ========================================================================

    fn archive_add(&mut self, data: &Args) -> Result<Value> {
        let Some(problem) = uint_arg(data, "problem") else {
            return Ok(FALSE);
        };
        let problem = problem as usize;
        if problem >= self.contest().problem_count()
            || self.contest().archive().problems.contains(&problem)
        {
            return Ok(FALSE);
        }
        let number = self.contest().archive().problem_list.len();
        self.commit(Event::ArchiveAdd { problem })?;
        Ok(json!(number))
    }

    fn archive_remove(&mut self, data: &Args) -> Result<Value> {
        let Some(index) = uint_arg(data, "id") else {
            return Ok(FALSE);
        };
        let index = index as usize;
        if index >= self.contest().archive().problem_list.len() {
            return Ok(FALSE);
        }
        self.commit(Event::ArchiveRemove { index })?;
        Ok(json!(true))
    }

    fn archive_list(&self, data: &Args) -> Value {
        let (Some(start), Some(limit)) = (uint_arg(data, "start"), uint_arg(data, "limit"))
        else {
            return FALSE;
        };
        let list = &self.contest().archive().problem_list;
        let start = (start as usize).min(list.len());
        let end = start.saturating_add(limit as usize).min(list.len());
        json!(list[start..end])
    }

    fn archive_compiler_add(&mut self, data: &Args) -> Result<Value> {
        let (Some(id), Some(name)) = (str_arg(data, "id"), str_arg(data, "name")) else {
            return Ok(FALSE);
        };
        if self.contest().archive().compilers.contains_key(id)
            || self.contest().compiler_get(id).is_none()
        {
            return Ok(FALSE);
        }
        self.commit(Event::ArchiveCompilerAdd {
            id: id.to_string(),
            name: name.to_string(),
        })?;
        Ok(json!(true))
    }

    fn archive_compiler_list(&self) -> Value {
        let compilers: Vec<Value> = self
            .contest()
            .archive()
            .compilers
            .iter()
            .map(|(id, name)| json!({ "id": id, "name": name }))
            .collect();
        Value::Array(compilers)
    }

    fn archive_compiler_remove(&mut self, data: &Args) -> Result<Value> {
        let Some(id) = str_arg(data, "id") else {
            return Ok(FALSE);
        };
        if !self.contest().archive().compilers.contains_key(id) {
            return Ok(FALSE);
        }
        self.commit(Event::ArchiveCompilerRemove { id: id.to_string() })?;
        Ok(json!(true))
    }

    fn archive_submit(&mut self, data: &Args) -> Result<Value> {
        let (Some(team), Some(problem), Some(name), Some(source), Some(compiler)) = (
            str_arg(data, "team"),
            uint_arg(data, "problem"),
            str_arg(data, "name"),
            b64_arg(data, "source"),
            str_arg(data, "compiler"),
        ) else {
            return Ok(FALSE);
        };
        let problem = problem as usize;
        let archive = self.contest().archive();
        let valid = self.contest().problem_get(problem).is_some()
            && self.contest().compiler_get(compiler).is_some()
            && self.contest().team_get(team).is_some()
            && archive.problems.contains(&problem)
            && archive.compilers.contains_key(compiler);
        if !valid {
            return Ok(FALSE);
        }
        let team = team.to_string();
        let compiler = compiler.to_string();
        let source = self.save_content(&source, Some(name))?;
        let id = self.contest().submission_count();
        self.commit(Event::ArchiveSubmit {
            id,
            team,
            problem,
            source,
            compiler,
        })?;
        Ok(json!(id))
    }

    fn archive_submits(&self, data: &Args) -> Value {
        let team = match data.get("team") {
            None | Some(Value::Null) => None,
            Some(Value::String(team)) => Some(team.clone()),
            Some(_) => return FALSE,
        };
        let problem = match data.get("problem") {
            None | Some(Value::Null) => None,
            Some(value) => match value.as_u64() {
                Some(problem) => Some(problem as usize),
                None => return FALSE,
            },
        };
        let (Some(mut start), Some(mut limit)) =
            (int_arg(data, "start"), int_arg(data, "limit"))
        else {
            return FALSE;
        };

        static EMPTY: Vec<u64> = Vec::new();
        let archive = self.contest().archive();
        let submits: &Vec<u64> = match (&team, problem) {
            (None, None) => &archive.submits_all,
            (None, Some(p)) => archive.submits_problem.get(&p).unwrap_or(&EMPTY),
            (Some(t), None) => archive.submits_team.get(t).unwrap_or(&EMPTY),
            (Some(t), Some(p)) => archive
                .submits_pair
                .get(&(t.clone(), p))
                .unwrap_or(&EMPTY),
        };

        let len = submits.len() as i64;
        if start < 0 {
            limit = limit.saturating_add(start);
            start = 0;
        }
        if start >= len {
            start = 0;
            limit = 0;
        }
        if start.saturating_add(limit) > len {
            limit = len - start;
        }
        let newest_first: Vec<u64> = if limit <= 0 {
            Vec::new()
        } else {
            let hi = (len - start) as usize;
            let lo = hi - limit as usize;
            submits[lo..hi].iter().rev().copied().collect()
        };
        json!({ "count": submits.len(), "list": newest_first })
    }
}
