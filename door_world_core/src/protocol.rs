use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tracing::debug;

use crate::{
    action_map::ButtonToken,
    memory::TurnAnnotation,
    observation::Correction,
    oracle::{OracleClient, OracleError, OracleRequest},
};

/// Fields every reply must carry.
pub const REQUIRED_FIELDS: [&str; 4] = ["choice", "prev_reasoning", "next_reasoning", "action_map_guess"];

/// Category of a refused reply, as reported back to the oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectionKind {
    #[serde(rename = "transport_error")]
    Transport,
    #[serde(rename = "parse_error")]
    Parse,
    #[serde(rename = "schema_error")]
    Schema,
    #[serde(rename = "choice_error")]
    Choice,
}

/// Why a reply could not be used.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplyError {
    #[error("oracle call failed: {0}")]
    Transport(#[from] OracleError),
    #[error("reply is not valid JSON: {message}")]
    Parse { message: String },
    #[error("reply field `{field}` is missing or not {expected}")]
    Schema {
        field: &'static str,
        expected: &'static str,
    },
    #[error("choice `{choice}` is not one of the valid buttons ({valid})")]
    Choice { choice: String, valid: String },
}

impl ReplyError {
    pub fn kind(&self) -> RejectionKind {
        match self {
            ReplyError::Transport(_) => RejectionKind::Transport,
            ReplyError::Parse { .. } => RejectionKind::Parse,
            ReplyError::Schema { .. } => RejectionKind::Schema,
            ReplyError::Choice { .. } => RejectionKind::Choice,
        }
    }
}

/// A refused reply together with the text that caused it (absent for transport failures).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub error: ReplyError,
    pub raw_reply: Option<String>,
}

impl Rejection {
    pub fn kind(&self) -> RejectionKind {
        self.error.kind()
    }

    /// The corrective context sent with the retried request.
    pub fn correction(&self) -> Correction {
        Correction {
            reason: self.kind(),
            message: self.error.to_string(),
            rejected_reply: self.raw_reply.clone(),
        }
    }
}

/// A reply that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub choice: ButtonToken,
    pub prev_reasoning: String,
    pub next_reasoning: String,
    pub action_map_guess: Value,
    /// The reply text as received.
    pub raw_reply: String,
    /// The parsed reply object.
    pub reply: Value,
}

impl Decision {
    /// The fields back-filled into memory for the turn this decision acted on.
    pub fn annotation(&self) -> TurnAnnotation {
        TurnAnnotation {
            action_taken: self.choice.clone(),
            prev_reasoning: self.prev_reasoning.clone(),
            next_reasoning: self.next_reasoning.clone(),
            action_map_guess: self.action_map_guess.clone(),
        }
    }
}

/// Removes markdown code fences (with or without a `json` tag) and surrounding whitespace.
pub fn strip_code_fences(raw: &str) -> String {
    raw.replace("```json", "")
        .replace("```JSON", "")
        .replace("```", "")
        .trim()
        .to_string()
}

/// The outermost `{ ... }` span, for replies with chatter around the object.
fn extract_json_block(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end < start {
        return None;
    }
    raw.get(start..=end)
}

fn parse_reply(raw: &str) -> Result<Value, ReplyError> {
    let text = strip_code_fences(raw);
    match serde_json::from_str::<Value>(&text) {
        Ok(value) => Ok(value),
        Err(err) => extract_json_block(&text)
            .and_then(|block| serde_json::from_str::<Value>(block).ok())
            .ok_or_else(|| ReplyError::Parse {
                message: err.to_string(),
            }),
    }
}

fn required_str(reply: &Value, field: &'static str) -> Result<String, ReplyError> {
    reply
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(ReplyError::Schema {
            field,
            expected: "a string",
        })
}

/// Parses `raw` and checks it against the reply schema and the currently valid buttons.
pub fn validate_reply(raw: &str, valid: &[ButtonToken]) -> Result<Decision, ReplyError> {
    let reply = parse_reply(raw)?;
    if !reply.is_object() {
        return Err(ReplyError::Schema {
            field: REQUIRED_FIELDS[0],
            expected: "present in a JSON object",
        });
    }

    let choice = required_str(&reply, "choice")?;
    let prev_reasoning = required_str(&reply, "prev_reasoning")?;
    let next_reasoning = required_str(&reply, "next_reasoning")?;
    let action_map_guess = match reply.get("action_map_guess") {
        Some(value) if !value.is_null() => value.clone(),
        _ => {
            return Err(ReplyError::Schema {
                field: "action_map_guess",
                expected: "present",
            });
        }
    };

    let choice = choice.trim();
    let Some(token) = valid.iter().find(|token| token.as_str() == choice) else {
        let names: Vec<&str> = valid.iter().map(ButtonToken::as_str).collect();
        return Err(ReplyError::Choice {
            choice: choice.to_string(),
            valid: names.join(", "),
        });
    };

    Ok(Decision {
        choice: token.clone(),
        prev_reasoning,
        next_reasoning,
        action_map_guess,
        raw_reply: raw.to_string(),
        reply,
    })
}

/// Externally visible protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolPhase {
    Idle,
    RequestInFlight,
    ResponseReady,
    ResponseInvalid,
}

impl fmt::Display for ProtocolPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProtocolPhase::Idle => "idle",
            ProtocolPhase::RequestInFlight => "waiting for oracle",
            ProtocolPhase::ResponseReady => "reply received",
            ProtocolPhase::ResponseInvalid => "reply rejected",
        };
        f.write_str(label)
    }
}

#[derive(Debug)]
enum State {
    Idle,
    InFlight(oneshot::Receiver<Result<String, OracleError>>),
    Ready(String),
    Invalid(Rejection),
}

/// Drives one oracle request at a time without blocking the caller.
pub struct DecisionProtocol {
    client: Arc<dyn OracleClient>,
    runtime: Handle,
    state: State,
    requests_issued: u64,
}

impl DecisionProtocol {
    /// `runtime` hosts the blocking oracle calls and must outlive the protocol.
    pub fn new(client: Arc<dyn OracleClient>, runtime: Handle) -> Self {
        Self {
            client,
            runtime,
            state: State::Idle,
            requests_issued: 0,
        }
    }

    pub fn phase(&self) -> ProtocolPhase {
        match self.state {
            State::Idle => ProtocolPhase::Idle,
            State::InFlight(_) => ProtocolPhase::RequestInFlight,
            State::Ready(_) => ProtocolPhase::ResponseReady,
            State::Invalid(_) => ProtocolPhase::ResponseInvalid,
        }
    }

    pub fn requests_issued(&self) -> u64 {
        self.requests_issued
    }

    /// Dispatches `request` to the oracle and returns immediately.
    ///
    /// # Panics
    ///
    /// Panics unless the protocol is idle.
    pub fn issue_request(&mut self, request: OracleRequest) {
        assert!(
            matches!(self.state, State::Idle),
            "decision request issued while protocol is {}",
            self.phase()
        );

        let (tx, rx) = oneshot::channel();
        let client = Arc::clone(&self.client);
        self.runtime.spawn_blocking(move || {
            let reply = client.complete(&request);
            // The receiver is gone only if the protocol was dropped mid-request.
            let _ = tx.send(reply);
        });

        self.requests_issued += 1;
        debug!(request = self.requests_issued, "decision request dispatched");
        self.state = State::InFlight(rx);
    }

    /// Checks the result slot once and returns the resulting phase.
    pub fn poll(&mut self) -> ProtocolPhase {
        if let State::InFlight(rx) = &mut self.state {
            let next = match rx.try_recv() {
                Ok(Ok(raw)) => Some(State::Ready(raw)),
                Ok(Err(err)) => Some(State::Invalid(Rejection {
                    error: ReplyError::Transport(err),
                    raw_reply: None,
                })),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Closed) => Some(State::Invalid(Rejection {
                    error: ReplyError::Transport(OracleError::TaskLost),
                    raw_reply: None,
                })),
            };
            if let Some(next) = next {
                self.state = next;
            }
        }
        self.phase()
    }

    /// Consumes a finished exchange, validating a ready reply against `valid`, and returns
    /// to idle. Returns `None` while idle or still waiting.
    pub fn take_outcome(&mut self, valid: &[ButtonToken]) -> Option<Result<Decision, Rejection>> {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Ready(raw) => {
                let validated = validate_reply(&raw, valid);
                Some(validated.map_err(|error| Rejection {
                    error,
                    raw_reply: Some(raw),
                }))
            }
            State::Invalid(rejection) => Some(Err(rejection)),
            waiting => {
                self.state = waiting;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    fn tokens(count: usize) -> Vec<ButtonToken> {
        (1..=count).map(ButtonToken::numbered).collect()
    }

    fn reply(choice: &str) -> String {
        format!(
            r#"{{"choice": "{choice}", "prev_reasoning": "p", "next_reasoning": "n", "action_map_guess": {{"btn1": "up"}}}}"#
        )
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .build()
            .unwrap()
    }

    fn request() -> OracleRequest {
        OracleRequest {
            preamble: "p".to_string(),
            observation: "{}".to_string(),
        }
    }

    fn settle(protocol: &mut DecisionProtocol) -> ProtocolPhase {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let phase = protocol.poll();
            if phase != ProtocolPhase::RequestInFlight || Instant::now() > deadline {
                return phase;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    struct Fixed(Result<String, OracleError>);

    impl OracleClient for Fixed {
        fn complete(&self, _request: &OracleRequest) -> Result<String, OracleError> {
            self.0.clone()
        }
    }

    /// Blocks until the test releases it.
    struct Gated(Mutex<mpsc::Receiver<String>>);

    impl OracleClient for Gated {
        fn complete(&self, _request: &OracleRequest) -> Result<String, OracleError> {
            let gate = self.0.lock().unwrap();
            gate.recv().map_err(|_| OracleError::TaskLost)
        }
    }

    struct Panics;

    impl OracleClient for Panics {
        fn complete(&self, _request: &OracleRequest) -> Result<String, OracleError> {
            panic!("oracle exploded");
        }
    }

    #[test]
    fn accepts_well_formed_reply() {
        let decision = validate_reply(&reply("btn2"), &tokens(4)).unwrap();
        assert_eq!(decision.choice, ButtonToken::numbered(2));
        assert_eq!(decision.prev_reasoning, "p");
        assert_eq!(decision.action_map_guess["btn1"], "up");
    }

    #[test]
    fn accepts_fenced_reply() {
        let raw = format!("```json\n{}\n```", reply("btn1"));
        assert!(validate_reply(&raw, &tokens(4)).is_ok());
    }

    #[test]
    fn accepts_reply_with_chatter() {
        let raw = format!("Sure! Here is my answer:\n{}\nGood luck.", reply("btn3"));
        assert_eq!(
            validate_reply(&raw, &tokens(4)).unwrap().choice,
            ButtonToken::numbered(3)
        );
    }

    #[test]
    fn fenced_garbage_is_a_parse_error() {
        let err = validate_reply("```json\nnot json at all\n```", &tokens(4)).unwrap_err();
        assert_eq!(err.kind(), RejectionKind::Parse);
    }

    #[test]
    fn missing_choice_is_a_schema_error() {
        let raw = r#"{"prev_reasoning": "p", "next_reasoning": "n", "action_map_guess": {}}"#;
        let err = validate_reply(raw, &tokens(4)).unwrap_err();
        assert_eq!(
            err,
            ReplyError::Schema {
                field: "choice",
                expected: "a string"
            }
        );
    }

    #[test]
    fn missing_guess_is_a_schema_error() {
        let raw = r#"{"choice": "btn1", "prev_reasoning": "p", "next_reasoning": "n"}"#;
        let err = validate_reply(raw, &tokens(4)).unwrap_err();
        assert_eq!(err.kind(), RejectionKind::Schema);
        assert!(err.to_string().contains("action_map_guess"));
    }

    #[test]
    fn non_object_is_a_schema_error() {
        let err = validate_reply("[1, 2, 3]", &tokens(4)).unwrap_err();
        assert_eq!(err.kind(), RejectionKind::Schema);
    }

    #[test]
    fn unknown_button_is_a_choice_error() {
        let err = validate_reply(&reply("btn9"), &tokens(4)).unwrap_err();
        assert_eq!(err.kind(), RejectionKind::Choice);
        assert_eq!(
            err.to_string(),
            "choice `btn9` is not one of the valid buttons (btn1, btn2, btn3, btn4)"
        );
    }

    #[test]
    fn rejection_correction_carries_reason_and_text() {
        let rejection = Rejection {
            error: validate_reply("oops", &tokens(4)).unwrap_err(),
            raw_reply: Some("oops".to_string()),
        };
        let correction = rejection.correction();
        assert_eq!(correction.reason, RejectionKind::Parse);
        assert_eq!(correction.rejected_reply.as_deref(), Some("oops"));
    }

    #[test]
    fn request_does_not_block_the_caller() {
        let rt = runtime();
        let (release, gate) = mpsc::channel();
        let mut protocol =
            DecisionProtocol::new(Arc::new(Gated(Mutex::new(gate))), rt.handle().clone());

        assert_eq!(protocol.phase(), ProtocolPhase::Idle);
        protocol.issue_request(request());
        for _ in 0..10 {
            assert_eq!(protocol.poll(), ProtocolPhase::RequestInFlight);
            assert!(protocol.take_outcome(&tokens(4)).is_none());
        }

        release.send(reply("btn4")).unwrap();
        assert_eq!(settle(&mut protocol), ProtocolPhase::ResponseReady);
        let decision = protocol.take_outcome(&tokens(4)).unwrap().unwrap();
        assert_eq!(decision.choice, ButtonToken::numbered(4));
        assert_eq!(protocol.phase(), ProtocolPhase::Idle);
        assert_eq!(protocol.requests_issued(), 1);
    }

    #[test]
    fn invalid_reply_returns_to_idle_with_raw_text() {
        let rt = runtime();
        let mut protocol =
            DecisionProtocol::new(Arc::new(Fixed(Ok(reply("btn7")))), rt.handle().clone());
        protocol.issue_request(request());
        assert_eq!(settle(&mut protocol), ProtocolPhase::ResponseReady);

        let rejection = protocol.take_outcome(&tokens(6)).unwrap().unwrap_err();
        assert_eq!(rejection.kind(), RejectionKind::Choice);
        assert_eq!(rejection.raw_reply, Some(reply("btn7")));
        assert_eq!(protocol.phase(), ProtocolPhase::Idle);
    }

    #[test]
    fn transport_failure_is_invalid() {
        let rt = runtime();
        let failure = OracleError::HttpStatus {
            code: 503,
            message: "busy".to_string(),
        };
        let mut protocol =
            DecisionProtocol::new(Arc::new(Fixed(Err(failure.clone()))), rt.handle().clone());
        protocol.issue_request(request());
        assert_eq!(settle(&mut protocol), ProtocolPhase::ResponseInvalid);

        let rejection = protocol.take_outcome(&tokens(4)).unwrap().unwrap_err();
        assert_eq!(rejection.error, ReplyError::Transport(failure));
        assert_eq!(rejection.raw_reply, None);
    }

    #[test]
    fn panicking_oracle_is_a_lost_task() {
        let rt = runtime();
        let mut protocol = DecisionProtocol::new(Arc::new(Panics), rt.handle().clone());
        protocol.issue_request(request());
        assert_eq!(settle(&mut protocol), ProtocolPhase::ResponseInvalid);
        let rejection = protocol.take_outcome(&tokens(4)).unwrap().unwrap_err();
        assert_eq!(rejection.error, ReplyError::Transport(OracleError::TaskLost));
    }

    #[test]
    #[should_panic(expected = "decision request issued while protocol is waiting for oracle")]
    fn second_request_in_flight_is_rejected() {
        let rt = runtime();
        let (_release, gate) = mpsc::channel::<String>();
        let mut protocol =
            DecisionProtocol::new(Arc::new(Gated(Mutex::new(gate))), rt.handle().clone());
        protocol.issue_request(request());
        protocol.issue_request(request());
    }
}
