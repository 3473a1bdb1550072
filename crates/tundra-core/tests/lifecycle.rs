// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end engine tests: control actions in, judge packets out, verdicts
//! back, and identical state after a restart.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tundra_core::engine::{Engine, EngineMsg};
use tundra_protocol::message::field;
use tundra_protocol::{DecodedFile, Packet, PacketParser};

fn control(engine: &mut Engine, request: Value) -> Value {
    let (reply_tx, mut reply_rx) = oneshot::channel();
    engine
        .handle(EngineMsg::Control {
            request,
            reply: reply_tx,
        })
        .unwrap();
    reply_rx.try_recv().expect("control reply")
}

fn b64(data: &[u8]) -> String {
    BASE64.encode(data)
}

/// A judge on the other end of the wire: an outbound byte channel plus a
/// packet parser, driven synchronously through the engine.
struct FakeJudge {
    conn: u64,
    rx: mpsc::UnboundedReceiver<Bytes>,
    parser: PacketParser,
}

impl FakeJudge {
    fn connect(engine: &mut Engine, conn: u64) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        engine.handle(EngineMsg::JudgeConnected { conn, tx }).unwrap();
        let mut judge = Self {
            conn,
            rx,
            parser: PacketParser::new(),
        };
        let mut registration = Packet::new();
        registration.insert(field::NAME, format!("judge-{conn}"));
        registration.insert(field::PASSWORD, "pw");
        judge.send(engine, registration);
        judge
    }

    fn send(&mut self, engine: &mut Engine, packet: Packet) {
        engine
            .handle(EngineMsg::JudgePacket {
                conn: self.conn,
                packet,
            })
            .unwrap();
    }

    fn recv(&mut self) -> Packet {
        while let Ok(chunk) = self.rx.try_recv() {
            self.parser.feed(&chunk);
        }
        let mut packets = self.parser.drain();
        assert_eq!(packets.len(), 1, "expected exactly one outbound packet");
        packets.pop().unwrap()
    }

    fn try_recv(&mut self) -> Option<Packet> {
        while let Ok(chunk) = self.rx.try_recv() {
            self.parser.feed(&chunk);
        }
        self.parser.drain().pop()
    }
}

fn text(packet: &Packet, key: &[u8]) -> String {
    String::from_utf8_lossy(packet.get(key).expect("field present")).into_owned()
}

/// Registers compilers, a team, and a three-test problem with an
/// interpreted checker. Returns the submitted source bytes.
fn seed_contest(engine: &mut Engine) -> Vec<u8> {
    assert_eq!(
        control(
            engine,
            json!({
                "action": "compiler.add",
                "id": "g++",
                "binary": "${name%.cpp}",
                "compile": "g++ -O2 -o $binary $name",
                "run": null,
            }),
        ),
        json!(true)
    );
    assert_eq!(
        control(
            engine,
            json!({
                "action": "compiler.add",
                "id": "python3",
                "binary": null,
                "compile": null,
                "run": "python3 $name",
            }),
        ),
        json!(true)
    );
    assert_eq!(
        control(
            engine,
            json!({
                "action": "team.add",
                "login": "red_panda",
                "name": "Red Panda",
                "password": "pw",
            }),
        ),
        json!(true)
    );
    assert_eq!(
        control(engine, json!({ "action": "problem.create", "name": "A+B", "full": "Add." })),
        json!(0)
    );
    assert_eq!(
        control(
            engine,
            json!({ "action": "problem.limits.set", "id": 0, "time": 2000, "memory": 1 << 26 }),
        ),
        json!(true)
    );
    for i in 0..3 {
        assert_eq!(
            control(
                engine,
                json!({
                    "action": "problem.test.add",
                    "id": 0,
                    "test": b64(format!("input {i}\n").as_bytes()),
                    "answer": b64(format!("answer {i}\n").as_bytes()),
                }),
            ),
            json!(true)
        );
    }
    assert_eq!(
        control(
            engine,
            json!({
                "action": "problem.checker.set",
                "id": 0,
                "name": "check.py",
                "source": b64(b"print('ok')\n"),
                "compiler": "python3",
            }),
        ),
        json!(true)
    );

    let source = b"int main() { return 0; }\n".to_vec();
    assert_eq!(
        control(
            engine,
            json!({
                "action": "submit",
                "problem": 0,
                "name": "sol.cpp",
                "source": b64(&source),
                "compiler": "g++",
            }),
        ),
        json!(0)
    );
    source
}

fn verdict_packet(correlation: &str, status: &str, time_us: u64, memory: u64) -> Packet {
    let mut packet = Packet::new();
    packet.insert(field::ID, correlation);
    packet.insert(field::STATUS, status);
    packet.insert(field::TIME, time_us.to_string());
    packet.insert(field::MEMORY, memory.to_string());
    packet
}

#[test]
fn test_full_submission_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("contest").to_string_lossy().into_owned();

    let mut engine = Engine::open(&prefix, None).unwrap();
    let source = seed_contest(&mut engine);

    assert_eq!(
        control(&mut engine, json!({ "action": "submit.info", "id": 0 }))["status"],
        json!("Waiting")
    );

    // A judge connects; the parked compile job goes to it immediately.
    let mut judge = FakeJudge::connect(&mut engine, 1);
    let compile = judge.recv();
    assert_eq!(text(&compile, field::COMMAND), "compile");
    assert_eq!(text(&compile, field::COMPILER), "g++ -O2 -o sol sol.cpp");
    assert_eq!(text(&compile, field::BINARY), "sol");
    let correlation = text(&compile, field::ID);
    let sent_source = DecodedFile::decode(compile.get(field::SOURCE).unwrap()).unwrap();
    assert_eq!(sent_source.name, "sol.cpp");
    assert_eq!(sent_source.data.as_deref(), Some(&source[..]));

    // Cache negotiation: claim we miss the source; it comes back inlined.
    let mut freq = Packet::new();
    freq.insert(field::ID, correlation.as_bytes());
    freq.insert(field::STATUS, "FREQ");
    freq.insert(
        field::FILES,
        format!("{}\\{}\r\n", sent_source.hash, sent_source.name),
    );
    judge.send(&mut engine, freq);
    let resent = judge.recv();
    let resent_source = DecodedFile::decode(resent.get(field::SOURCE).unwrap()).unwrap();
    assert!(resent_source.data.is_some());

    // Compile succeeds; the first test call follows at once.
    let mut ok = Packet::new();
    ok.insert(field::ID, correlation.as_bytes());
    ok.insert(field::STATUS, "OK");
    ok.insert(
        field::EXE_FILE,
        tundra_protocol::FileRef {
            hash: String::new(),
            name: "sol".to_string(),
            created: 0,
            data: Bytes::from_static(b"\x7fELF compiled"),
        }
        .encode(true),
    );
    ok.insert(field::UTILITY_OUTPUT, "0 warnings");
    judge.send(&mut engine, ok);

    assert_eq!(
        control(&mut engine, json!({ "action": "submit.info", "id": 0 }))["status"],
        json!("Running")
    );
    assert_eq!(
        control(&mut engine, json!({ "action": "submit.report", "id": 0 })),
        json!({ "compiler_output": b64(b"0 warnings") })
    );

    let test0 = judge.recv();
    assert_eq!(text(&test0, field::COMMAND), "test");
    assert_eq!(text(&test0, field::TIME_LIMIT), "2000");
    assert_eq!(text(&test0, field::MEMORY_LIMIT), (1u64 << 26).to_string());
    assert_eq!(text(&test0, field::CHECKER_RUN), "python3 check.py");
    assert!(!test0.contains(field::RUN));
    let exe = DecodedFile::decode(test0.get(field::EXE_FILE).unwrap()).unwrap();
    assert_eq!(exe.data.as_deref(), Some(&b"\x7fELF compiled"[..]));
    let test_input = DecodedFile::decode(test0.get(field::TEST_PATH).unwrap()).unwrap();
    assert_eq!(test_input.data.as_deref(), Some(&b"input 0\n"[..]));

    // OK, OK, then WA on the third test.
    judge.send(
        &mut engine,
        verdict_packet(&text(&test0, field::ID), "OK", 500_000, 1 << 20),
    );
    let test1 = judge.recv();
    judge.send(
        &mut engine,
        verdict_packet(&text(&test1, field::ID), "OK", 600_000, 1 << 20),
    );
    let test2 = judge.recv();
    let answer2 = DecodedFile::decode(test2.get(field::ANSWER_PATH).unwrap()).unwrap();
    assert_eq!(answer2.data.as_deref(), Some(&b"answer 2\n"[..]));
    judge.send(
        &mut engine,
        verdict_packet(&text(&test2, field::ID), "WA", 700_000, 1 << 21),
    );
    assert!(judge.try_recv().is_none(), "judging must stop after WA");

    let info = control(&mut engine, json!({ "action": "submit.info", "id": 0 }));
    assert_eq!(info["status"], json!("Result"));
    assert_eq!(info["result"], json!("WA"));
    assert_eq!(info["test"], json!(2));

    assert_eq!(
        control(&mut engine, json!({ "action": "submit.source", "id": 0 })),
        json!(b64(&source))
    );

    // Restarting from the two files reconstructs the same observable state.
    drop(engine);
    let mut engine = Engine::open(&prefix, None).unwrap();
    let info = control(&mut engine, json!({ "action": "submit.info", "id": 0 }));
    assert_eq!(info["status"], json!("Result"));
    assert_eq!(info["result"], json!("WA"));
    assert_eq!(info["test"], json!(2));
    assert_eq!(
        control(&mut engine, json!({ "action": "submit.source", "id": 0 })),
        json!(b64(&source))
    );
    assert_eq!(
        control(&mut engine, json!({ "action": "problem.test.count", "id": 0 })),
        json!(3)
    );
}

#[test]
fn test_accepted_run_and_compile_error() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("contest").to_string_lossy().into_owned();

    let mut engine = Engine::open(&prefix, None).unwrap();
    seed_contest(&mut engine);
    let mut judge = FakeJudge::connect(&mut engine, 1);

    // First submission: all three tests pass.
    let compile = judge.recv();
    let mut ok = Packet::new();
    ok.insert(field::ID, text(&compile, field::ID));
    ok.insert(field::STATUS, "OK");
    ok.insert(
        field::EXE_FILE,
        tundra_protocol::FileRef {
            hash: String::new(),
            name: "sol".to_string(),
            created: 0,
            data: Bytes::from_static(b"bin"),
        }
        .encode(true),
    );
    judge.send(&mut engine, ok);
    for _ in 0..3 {
        let test = judge.recv();
        judge.send(
            &mut engine,
            verdict_packet(&text(&test, field::ID), "OK", 1000, 1),
        );
    }
    let info = control(&mut engine, json!({ "action": "submit.info", "id": 0 }));
    assert_eq!(info["result"], json!("AC"));
    assert_eq!(info["test"], json!(null));

    // Second submission fails to compile: resolved without any test call.
    assert_eq!(
        control(
            &mut engine,
            json!({
                "action": "submit",
                "problem": 0,
                "name": "bad.cpp",
                "source": b64(b"int main( {"),
                "compiler": "g++",
            }),
        ),
        json!(1)
    );
    let compile = judge.recv();
    let mut ce = Packet::new();
    ce.insert(field::ID, text(&compile, field::ID));
    ce.insert(field::STATUS, "CE");
    ce.insert(field::UTILITY_OUTPUT, "bad.cpp:1: expected ')'");
    judge.send(&mut engine, ce);

    assert!(judge.try_recv().is_none(), "CE must not reach testing");
    let info = control(&mut engine, json!({ "action": "submit.info", "id": 1 }));
    assert_eq!(info["status"], json!("Result"));
    assert_eq!(info["result"], json!("CE"));
    assert_eq!(info["test"], json!(null));
    // The report is only available once a binary exists; a CE submission
    // never gets one.
    assert_eq!(
        control(&mut engine, json!({ "action": "submit.report", "id": 1 })),
        json!(false)
    );
}

#[test]
fn test_judge_disconnect_requeues_job() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("contest").to_string_lossy().into_owned();

    let mut engine = Engine::open(&prefix, None).unwrap();
    seed_contest(&mut engine);

    let mut first = FakeJudge::connect(&mut engine, 1);
    let compile = first.recv();
    assert_eq!(text(&compile, field::COMMAND), "compile");

    // The judge dies mid-call; the job must reach a replacement judge.
    engine.handle(EngineMsg::JudgeClosed { conn: 1 }).unwrap();

    let mut second = FakeJudge::connect(&mut engine, 2);
    let retried = second.recv();
    assert_eq!(text(&retried, field::COMMAND), "compile");
    assert_eq!(
        text(&retried, field::COMPILER),
        text(&compile, field::COMPILER)
    );
}

#[test]
fn test_archive_flow_and_pagination() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("contest").to_string_lossy().into_owned();

    let mut engine = Engine::open(&prefix, None).unwrap();
    seed_contest(&mut engine);

    assert_eq!(
        control(&mut engine, json!({ "action": "archive.add", "problem": 0 })),
        json!(0)
    );
    // Double exposure is rejected.
    assert_eq!(
        control(&mut engine, json!({ "action": "archive.add", "problem": 0 })),
        json!(false)
    );
    assert_eq!(
        control(
            &mut engine,
            json!({ "action": "archive.compiler.add", "id": "g++", "name": "GNU C++" }),
        ),
        json!(true)
    );
    assert_eq!(
        control(&mut engine, json!({ "action": "archive.compiler.list" })),
        json!([{ "id": "g++", "name": "GNU C++" }])
    );
    assert_eq!(
        control(&mut engine, json!({ "action": "archive.count" })),
        json!(1)
    );
    assert_eq!(
        control(&mut engine, json!({ "action": "archive.list", "start": 0, "limit": 10 })),
        json!([0])
    );

    // Submissions through the archive are indexed for history queries.
    // (Submission id 0 is the seeded direct submit.)
    for i in 0..4 {
        assert_eq!(
            control(
                &mut engine,
                json!({
                    "action": "archive.submit",
                    "team": "red_panda",
                    "problem": 0,
                    "name": format!("try{i}.cpp"),
                    "source": b64(format!("// attempt {i}\n").as_bytes()),
                    "compiler": "g++",
                }),
            ),
            json!(i + 1)
        );
    }
    // Unknown team is rejected.
    assert_eq!(
        control(
            &mut engine,
            json!({
                "action": "archive.submit",
                "team": "ghost",
                "problem": 0,
                "name": "x.cpp",
                "source": b64(b"x"),
                "compiler": "g++",
            }),
        ),
        json!(false)
    );

    // Newest first, windowed.
    let page = control(
        &mut engine,
        json!({ "action": "archive.submits", "team": "red_panda", "problem": 0, "start": 0, "limit": 2 }),
    );
    assert_eq!(page, json!({ "count": 4, "list": [4, 3] }));

    let page = control(
        &mut engine,
        json!({ "action": "archive.submits", "team": "red_panda", "problem": 0, "start": 2, "limit": 10 }),
    );
    assert_eq!(page, json!({ "count": 4, "list": [2, 1] }));

    let page = control(
        &mut engine,
        json!({ "action": "archive.submits", "start": 0, "limit": 100 }),
    );
    assert_eq!(page, json!({ "count": 4, "list": [4, 3, 2, 1] }));

    // Beyond the end: empty window, count preserved.
    let page = control(
        &mut engine,
        json!({ "action": "archive.submits", "team": "red_panda", "problem": 0, "start": 9, "limit": 5 }),
    );
    assert_eq!(page, json!({ "count": 4, "list": [] }));
}
