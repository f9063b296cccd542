use std::result::Result as StdResult;

use crate::matcher::Matcher;
use crate::message::Request;

/// Errors raised by the mock server and its test-facing API.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The wire frame or an opcode body could not be parsed.
    #[error("malformed wire message: {0}")]
    WireParse(String),

    /// The opcode isn't one this server knows how to unpack.
    #[error("unsupported opcode {0}")]
    UnsupportedOpcode(i32),

    /// `receives(spec)` popped a request that didn't match the spec.
    #[error("expected to receive {expected:?}, got {actual:?}")]
    UnexpectedRequest {
        expected: Box<Matcher>,
        actual: Box<Request>,
    },

    /// A blocking wait (`receives`, `got`, `wait_until`, a `go` future)
    /// exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// A reply or request spec could not be interpreted.
    #[error("bad spec: {0}")]
    BadSpec(String),

    /// The operation can't proceed because the server has been stopped.
    #[error("server is stopped")]
    ServerStopped,

    /// A responder callable raised an error; that connection is torn down
    /// and the error is surfaced to the test on its next API call.
    #[error("responder error: {0}")]
    UserResponderError(String),
}

pub type Result<T> = StdResult<T, Error>;
