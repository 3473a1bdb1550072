// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-connection judge session state machine.
//!
//! `Connecting → Ready → AwaitingResponse(correlation) → Ready → …`
//!
//! A judge registers with `Name` + `Password`; anything else on a fresh
//! connection is a protocol violation and drops it. One call (compile or
//! test) is outstanding at a time, tagged with a sequential correlation id.
//! Every blob a call references is inlined on the first send; a `FREQ`
//! response lists the hashes the judge is missing from its local cache, and
//! the session re-sends the same call with only those inlined. Responses
//! with an unknown status or a stale correlation id are logged and dropped
//! without disturbing the session.
//!
//! The session is sans-I/O: it consumes decoded packets and produces
//! packets to send; the engine owns the sockets.

use std::collections::HashSet;

use bytes::Bytes;
use tracing::{info, warn};
use tundra_protocol::message::{STATUS_FREQ, field};
use tundra_protocol::{DecodedFile, FileRef, Packet, Status, correlation_id, parse_file_request};

use crate::scheduler::Job;

/// What an outstanding call was for; routes the reply in the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    /// Compiling a problem's checker.
    CheckerCompile {
        /// Problem id.
        problem: usize,
    },
    /// Compiling a submission.
    SubmissionCompile {
        /// Submission id.
        id: u64,
    },
    /// Running one test of a submission.
    SubmissionTest {
        /// Submission id.
        id: u64,
        /// Test index.
        test: usize,
    },
}

impl Purpose {
    /// The job that would re-do this call, for requeueing after a judge
    /// disconnects mid-call.
    pub fn job(&self) -> Job {
        match *self {
            Purpose::CheckerCompile { problem } => Job::CompileChecker { problem },
            Purpose::SubmissionCompile { id } => Job::CompileSubmission { id },
            Purpose::SubmissionTest { id, test } => Job::RunTest { id, test },
        }
    }
}

/// A compile call.
#[derive(Debug, Clone)]
pub struct CompileRequest {
    /// Rendered compiler command line.
    pub command: String,
    /// Judge-visible name for the produced binary.
    pub binary_name: String,
    /// The source blob.
    pub source: FileRef,
}

/// A test call.
#[derive(Debug, Clone)]
pub struct TestRequest {
    /// The solution binary.
    pub binary: FileRef,
    /// Rendered run command; `None` for natively executable binaries.
    pub run: Option<String>,
    /// Test input blob.
    pub test: FileRef,
    /// Expected answer blob.
    pub answer: FileRef,
    /// Input stream name.
    pub input: String,
    /// Output stream name.
    pub output: String,
    /// Time limit, milliseconds.
    pub time_limit_ms: u64,
    /// Memory limit, bytes.
    pub memory_limit_bytes: u64,
    /// The checker binary.
    pub checker: FileRef,
    /// Rendered checker run command, if the checker is interpreted.
    pub checker_run: Option<String>,
}

#[derive(Debug, Clone)]
enum Call {
    Compile(CompileRequest),
    Test(TestRequest),
}

#[derive(Debug)]
struct Outstanding {
    correlation: String,
    call: Call,
    purpose: Purpose,
}

/// Session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the registration packet.
    Connecting,
    /// Registered and idle.
    Ready,
    /// A call is outstanding.
    Awaiting,
}

/// What the judge answered; produced by [`WorkerSession::receive`].
#[derive(Debug)]
pub enum SessionEvent {
    /// Registration succeeded; the judge is idle now.
    Registered {
        /// The judge's self-reported name.
        name: String,
    },
    /// Re-send this packet (cache negotiation).
    Resend(Packet),
    /// The outstanding call finished; the judge is idle again.
    Completed {
        /// What the call was for.
        purpose: Purpose,
        /// The decoded reply.
        reply: WorkerReply,
    },
    /// Protocol violation; drop the connection.
    Disconnect,
    /// Packet logged and dropped; session state unchanged.
    Ignored,
}

/// Decoded reply payload of a completed call.
#[derive(Debug)]
pub enum WorkerReply {
    /// Compile succeeded.
    Compiled {
        /// Bytes of the produced executable.
        binary: Bytes,
        /// The binary name the call asked for; becomes the content name.
        name: String,
        /// Compiler diagnostics.
        output: Bytes,
    },
    /// Compile failed; the source is at fault.
    CompileFailed {
        /// Compiler diagnostics.
        output: Bytes,
    },
    /// A compile call ended with a non-compile verdict (judge-side
    /// infrastructure trouble).
    CompileBroken {
        /// The verdict the judge reported.
        status: Status,
    },
    /// A test call finished with a verdict.
    Tested {
        /// Verdict.
        status: Status,
        /// Peak run time, milliseconds.
        time_ms: u64,
        /// Peak memory, bytes.
        memory_bytes: u64,
    },
}

/// One judge connection's protocol state.
#[derive(Debug)]
pub struct WorkerSession {
    state: SessionState,
    name: Option<String>,
    expected_key: Option<String>,
    next_message: u64,
    outstanding: Option<Outstanding>,
}

impl WorkerSession {
    /// Create a session for a fresh connection. When `expected_key` is
    /// set, registration must present exactly that password.
    pub fn new(expected_key: Option<String>) -> Self {
        Self {
            state: SessionState::Connecting,
            name: None,
            expected_key,
            next_message: 0,
            outstanding: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The judge's registered name.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Take the outstanding call's purpose, e.g. to requeue it after a
    /// disconnect. Leaves the session unusable for further calls.
    pub fn take_outstanding(&mut self) -> Option<Purpose> {
        self.outstanding.take().map(|o| o.purpose)
    }

    /// Process one packet from the judge.
    pub fn receive(&mut self, packet: Packet) -> SessionEvent {
        match self.state {
            SessionState::Connecting => self.receive_registration(packet),
            SessionState::Ready => {
                warn!(judge = ?self.name, "unexpected packet from idle judge");
                SessionEvent::Ignored
            }
            SessionState::Awaiting => self.receive_response(packet),
        }
    }

    fn receive_registration(&mut self, packet: Packet) -> SessionEvent {
        let (Some(name), Some(password)) =
            (packet.get(field::NAME), packet.get(field::PASSWORD))
        else {
            warn!("judge sent a non-registration packet first; disconnecting");
            return SessionEvent::Disconnect;
        };
        if let Some(expected) = &self.expected_key {
            if password != expected.as_bytes() {
                warn!("judge presented a wrong password; disconnecting");
                return SessionEvent::Disconnect;
            }
        }
        let name = String::from_utf8_lossy(name).into_owned();
        info!(judge = %name, "new judge registered in system");
        self.name = Some(name.clone());
        self.state = SessionState::Ready;
        SessionEvent::Registered { name }
    }

    fn receive_response(&mut self, packet: Packet) -> SessionEvent {
        let Some(outstanding) = &self.outstanding else {
            warn!(judge = ?self.name, "response without an outstanding call");
            return SessionEvent::Ignored;
        };
        match packet.get(field::ID) {
            Some(id) if id == outstanding.correlation.as_bytes() => {}
            other => {
                warn!(
                    judge = ?self.name,
                    got = ?other.map(String::from_utf8_lossy),
                    expected = %outstanding.correlation,
                    "out-of-order correlation id; packet dropped"
                );
                return SessionEvent::Ignored;
            }
        }
        let Some(status) = packet.get(field::STATUS) else {
            warn!(judge = ?self.name, "response without a status; packet dropped");
            return SessionEvent::Ignored;
        };

        if status == STATUS_FREQ {
            let missing: HashSet<String> = packet
                .get(field::FILES)
                .map(parse_file_request)
                .unwrap_or_default()
                .into_iter()
                .map(|(hash, _)| hash)
                .collect();
            info!(
                judge = ?self.name,
                missing = missing.len(),
                "judge cache negotiation; re-sending with missing files inlined"
            );
            return SessionEvent::Resend(self.build_packet(Some(&missing)));
        }

        let Some(status) = Status::from_wire(status) else {
            warn!(
                judge = ?self.name,
                status = %String::from_utf8_lossy(status),
                "unrecognized status; packet dropped"
            );
            return SessionEvent::Ignored;
        };

        let reply = match (&outstanding.call, status) {
            (Call::Compile(request), Status::Ok) => {
                let Some(exe) = packet.get(field::EXE_FILE) else {
                    warn!(judge = ?self.name, "OK compile reply without ExeFile; dropped");
                    return SessionEvent::Ignored;
                };
                let binary = match DecodedFile::decode(exe) {
                    Ok(DecodedFile {
                        data: Some(data), ..
                    }) => data,
                    Ok(_) => {
                        warn!(judge = ?self.name, "compile reply referenced the executable instead of inlining it; dropped");
                        return SessionEvent::Ignored;
                    }
                    Err(e) => {
                        warn!(judge = ?self.name, error = %e, "malformed ExeFile; dropped");
                        return SessionEvent::Ignored;
                    }
                };
                WorkerReply::Compiled {
                    binary,
                    name: request.binary_name.clone(),
                    output: bytes_field(&packet, field::UTILITY_OUTPUT),
                }
            }
            (Call::Compile(_), Status::CompileError) => WorkerReply::CompileFailed {
                output: bytes_field(&packet, field::UTILITY_OUTPUT),
            },
            (Call::Compile(_), status) => WorkerReply::CompileBroken { status },
            (Call::Test(_), status) => WorkerReply::Tested {
                status,
                time_ms: microseconds_to_ms(number_field(&packet, field::TIME)),
                memory_bytes: number_field(&packet, field::MEMORY),
            },
        };

        let Some(outstanding) = self.outstanding.take() else {
            return SessionEvent::Ignored;
        };
        self.state = SessionState::Ready;
        SessionEvent::Completed {
            purpose: outstanding.purpose,
            reply,
        }
    }

    /// Issue a compile call. The session must be idle; it becomes busy
    /// until the matching response arrives.
    pub fn compile(&mut self, purpose: Purpose, request: CompileRequest) -> Packet {
        self.issue(purpose, Call::Compile(request))
    }

    /// Issue a test call. Same discipline as [`compile`](Self::compile).
    pub fn test(&mut self, purpose: Purpose, request: TestRequest) -> Packet {
        self.issue(purpose, Call::Test(request))
    }

    fn issue(&mut self, purpose: Purpose, call: Call) -> Packet {
        debug_assert_eq!(self.state, SessionState::Ready);
        let correlation = correlation_id(self.next_message);
        self.next_message += 1;
        self.outstanding = Some(Outstanding {
            correlation,
            call,
            purpose,
        });
        self.state = SessionState::Awaiting;
        self.build_packet(None)
    }

    /// Encode the outstanding call. `inline_only` restricts which blobs are
    /// inlined (cache negotiation); `None` inlines everything.
    fn build_packet(&self, inline_only: Option<&HashSet<String>>) -> Packet {
        let Some(outstanding) = &self.outstanding else {
            return Packet::new();
        };
        let inline = |file: &FileRef| -> Vec<u8> {
            let inlined = inline_only.is_none_or(|missing| missing.contains(&file.hash));
            file.encode(inlined)
        };
        let mut packet = Packet::new();
        packet.insert(field::ID, outstanding.correlation.as_bytes());
        match &outstanding.call {
            Call::Compile(request) => {
                packet.insert(field::COMMAND, "compile");
                packet.insert(field::COMPILER, request.command.as_bytes());
                packet.insert(field::BINARY, request.binary_name.as_bytes());
                packet.insert(field::SOURCE, inline(&request.source));
            }
            Call::Test(request) => {
                packet.insert(field::COMMAND, "test");
                packet.insert(field::EXE_FILE, inline(&request.binary));
                packet.insert(field::TEST_PATH, inline(&request.test));
                packet.insert(field::ANSWER_PATH, inline(&request.answer));
                packet.insert(field::INPUT_FILE, request.input.as_bytes());
                packet.insert(field::OUTPUT_FILE, request.output.as_bytes());
                packet.insert(field::TIME_LIMIT, request.time_limit_ms.to_string());
                packet.insert(field::MEMORY_LIMIT, request.memory_limit_bytes.to_string());
                packet.insert(field::CHECKER, inline(&request.checker));
                if let Some(run) = &request.run {
                    packet.insert(field::RUN, run.as_bytes());
                }
                if let Some(run) = &request.checker_run {
                    packet.insert(field::CHECKER_RUN, run.as_bytes());
                }
            }
        }
        packet
    }
}

fn bytes_field(packet: &Packet, key: &[u8]) -> Bytes {
    packet
        .get(key)
        .map(Bytes::copy_from_slice)
        .unwrap_or_default()
}

fn number_field(packet: &Packet, key: &[u8]) -> u64 {
    let Some(raw) = packet.get(key) else {
        return 0;
    };
    match std::str::from_utf8(raw).ok().and_then(|s| s.parse().ok()) {
        Some(value) => value,
        None => {
            warn!(
                field = %String::from_utf8_lossy(key),
                value = %String::from_utf8_lossy(raw),
                "non-numeric field in judge reply; using 0"
            );
            0
        }
    }
}

/// Judges report times in their native microseconds; the event log stores
/// milliseconds, rounded up so a nonzero run never reads as zero.
fn microseconds_to_ms(us: u64) -> u64 {
    us.div_ceil(1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(hash: &str, data: &'static [u8]) -> FileRef {
        FileRef {
            hash: hash.to_string(),
            name: format!("{hash}.dat"),
            created: 1_700_000_000,
            data: Bytes::from_static(data),
        }
    }

    fn registered_session() -> WorkerSession {
        let mut session = WorkerSession::new(None);
        let mut packet = Packet::new();
        packet.insert(field::NAME, "judge-1");
        packet.insert(field::PASSWORD, "anything");
        assert!(matches!(
            session.receive(packet),
            SessionEvent::Registered { name } if name == "judge-1"
        ));
        session
    }

    fn compile_request() -> CompileRequest {
        CompileRequest {
            command: "g++ -O2 -o sol sol.cpp".to_string(),
            binary_name: "sol".to_string(),
            source: file("srchash", b"int main() {}"),
        }
    }

    fn test_request() -> TestRequest {
        TestRequest {
            binary: file("binhash", b"\x7fELF"),
            run: None,
            test: file("testhash", b"1 2\n"),
            answer: file("answerhash", b"3\n"),
            input: String::new(),
            output: String::new(),
            time_limit_ms: 1000,
            memory_limit_bytes: 256 * 1024 * 1024,
            checker: file("chkhash", b"\x7fELF"),
            checker_run: None,
        }
    }

    // ========== Registration ==========

    #[test]
    fn test_registration_requires_name_and_password() {
        let mut session = WorkerSession::new(None);
        let mut packet = Packet::new();
        packet.insert(field::NAME, "judge-1");
        assert!(matches!(session.receive(packet), SessionEvent::Disconnect));
    }

    #[test]
    fn test_registration_checks_shared_key() {
        let mut session = WorkerSession::new(Some("secret".to_string()));
        let mut packet = Packet::new();
        packet.insert(field::NAME, "judge-1");
        packet.insert(field::PASSWORD, "wrong");
        assert!(matches!(session.receive(packet), SessionEvent::Disconnect));

        let mut session = WorkerSession::new(Some("secret".to_string()));
        let mut packet = Packet::new();
        packet.insert(field::NAME, "judge-1");
        packet.insert(field::PASSWORD, "secret");
        assert!(matches!(
            session.receive(packet),
            SessionEvent::Registered { .. }
        ));
        assert_eq!(session.name(), Some("judge-1"));
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn test_idle_packet_is_ignored() {
        let mut session = registered_session();
        let mut packet = Packet::new();
        packet.insert(field::STATUS, "OK");
        assert!(matches!(session.receive(packet), SessionEvent::Ignored));
        assert_eq!(session.state(), SessionState::Ready);
    }

    // ========== Compile calls ==========

    #[test]
    fn test_compile_call_round_trip() {
        let mut session = registered_session();
        let request = session.compile(
            Purpose::SubmissionCompile { id: 7 },
            compile_request(),
        );
        assert_eq!(session.state(), SessionState::Awaiting);
        assert_eq!(request.get(field::ID), Some(&b"id_00000000"[..]));
        assert_eq!(request.get(field::COMMAND), Some(&b"compile"[..]));
        // The source is inlined on first send.
        let source = request.get(field::SOURCE).unwrap();
        assert!(source.windows(2).any(|w| w == b"|\r"));

        let mut reply = Packet::new();
        reply.insert(field::ID, "id_00000000");
        reply.insert(field::STATUS, "OK");
        reply.insert(
            field::EXE_FILE,
            file("exehash", b"\x7fELF binary").encode(true),
        );
        reply.insert(field::UTILITY_OUTPUT, "2 warnings");
        match session.receive(reply) {
            SessionEvent::Completed {
                purpose: Purpose::SubmissionCompile { id: 7 },
                reply: WorkerReply::Compiled {
                    binary,
                    name,
                    output,
                },
            } => {
                assert_eq!(&binary[..], b"\x7fELF binary");
                assert_eq!(name, "sol");
                assert_eq!(&output[..], b"2 warnings");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn test_compile_error_reply() {
        let mut session = registered_session();
        session.compile(Purpose::CheckerCompile { problem: 0 }, compile_request());

        let mut reply = Packet::new();
        reply.insert(field::ID, "id_00000000");
        reply.insert(field::STATUS, "CE");
        reply.insert(field::UTILITY_OUTPUT, "sol.cpp:1: error");
        match session.receive(reply) {
            SessionEvent::Completed {
                reply: WorkerReply::CompileFailed { output },
                ..
            } => assert_eq!(&output[..], b"sol.cpp:1: error"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_stale_correlation_is_dropped() {
        let mut session = registered_session();
        session.compile(Purpose::SubmissionCompile { id: 0 }, compile_request());

        let mut reply = Packet::new();
        reply.insert(field::ID, "id_99999999");
        reply.insert(field::STATUS, "OK");
        assert!(matches!(session.receive(reply), SessionEvent::Ignored));
        assert_eq!(session.state(), SessionState::Awaiting);
    }

    #[test]
    fn test_unknown_status_is_dropped() {
        let mut session = registered_session();
        session.compile(Purpose::SubmissionCompile { id: 0 }, compile_request());

        let mut reply = Packet::new();
        reply.insert(field::ID, "id_00000000");
        reply.insert(field::STATUS, "BANANA");
        assert!(matches!(session.receive(reply), SessionEvent::Ignored));
        assert_eq!(session.state(), SessionState::Awaiting);
    }

    #[test]
    fn test_correlation_ids_are_sequential() {
        let mut session = registered_session();
        let first = session.compile(Purpose::SubmissionCompile { id: 0 }, compile_request());
        assert_eq!(first.get(field::ID), Some(&b"id_00000000"[..]));

        let mut reply = Packet::new();
        reply.insert(field::ID, "id_00000000");
        reply.insert(field::STATUS, "CE");
        session.receive(reply);

        let second = session.compile(Purpose::SubmissionCompile { id: 1 }, compile_request());
        assert_eq!(second.get(field::ID), Some(&b"id_00000001"[..]));
    }

    // ========== FREQ negotiation ==========

    #[test]
    fn test_freq_resends_only_missing_files() {
        let mut session = registered_session();
        let first = session.test(
            Purpose::SubmissionTest { id: 0, test: 0 },
            test_request(),
        );
        for key in [field::EXE_FILE, field::TEST_PATH, field::ANSWER_PATH, field::CHECKER] {
            assert!(
                first.get(key).unwrap().windows(2).any(|w| w == b"|\r"),
                "first send must inline everything"
            );
        }

        let mut freq = Packet::new();
        freq.insert(field::ID, "id_00000000");
        freq.insert(field::STATUS, "FREQ");
        freq.insert(field::FILES, "testhash\\testhash.dat\r\n");
        let resent = match session.receive(freq) {
            SessionEvent::Resend(packet) => packet,
            other => panic!("unexpected event: {other:?}"),
        };
        assert_eq!(session.state(), SessionState::Awaiting);
        assert_eq!(resent.get(field::ID), Some(&b"id_00000000"[..]));

        let inlined = |key: &[u8]| {
            resent
                .get(key)
                .unwrap()
                .windows(2)
                .any(|w| w == b"|\r")
        };
        assert!(inlined(field::TEST_PATH));
        assert!(!inlined(field::EXE_FILE));
        assert!(!inlined(field::ANSWER_PATH));
        assert!(!inlined(field::CHECKER));

        // The verdict still completes the renegotiated call.
        let mut reply = Packet::new();
        reply.insert(field::ID, "id_00000000");
        reply.insert(field::STATUS, "WA");
        reply.insert(field::TIME, "1500");
        reply.insert(field::MEMORY, "65536");
        match session.receive(reply) {
            SessionEvent::Completed {
                purpose: Purpose::SubmissionTest { id: 0, test: 0 },
                reply:
                    WorkerReply::Tested {
                        status: Status::WrongAnswer,
                        time_ms: 2,
                        memory_bytes: 65536,
                    },
            } => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }

    // ========== Test calls ==========

    #[test]
    fn test_test_call_fields() {
        let mut session = registered_session();
        let mut request = test_request();
        request.run = Some("python3 sol.py".to_string());
        request.input = "input.txt".to_string();
        request.output = "output.txt".to_string();
        let packet = session.test(Purpose::SubmissionTest { id: 3, test: 1 }, request);

        assert_eq!(packet.get(field::COMMAND), Some(&b"test"[..]));
        assert_eq!(packet.get(field::TIME_LIMIT), Some(&b"1000"[..]));
        assert_eq!(packet.get(field::MEMORY_LIMIT), Some(&b"268435456"[..]));
        assert_eq!(packet.get(field::RUN), Some(&b"python3 sol.py"[..]));
        assert_eq!(packet.get(field::INPUT_FILE), Some(&b"input.txt"[..]));
        assert_eq!(packet.get(field::OUTPUT_FILE), Some(&b"output.txt"[..]));
        assert!(!packet.contains(field::CHECKER_RUN));
    }

    #[test]
    fn test_time_is_converted_to_milliseconds() {
        assert_eq!(microseconds_to_ms(0), 0);
        assert_eq!(microseconds_to_ms(1), 1);
        assert_eq!(microseconds_to_ms(1000), 1);
        assert_eq!(microseconds_to_ms(1001), 2);
        assert_eq!(microseconds_to_ms(2_500_000), 2500);
    }

    #[test]
    fn test_disconnect_requeues_purpose() {
        let mut session = registered_session();
        session.test(Purpose::SubmissionTest { id: 5, test: 2 }, test_request());
        let purpose = session.take_outstanding().unwrap();
        assert_eq!(purpose.job(), Job::RunTest { id: 5, test: 2 });
        assert!(session.take_outstanding().is_none());
    }
}
