//! Status code classification.
//!
//! Every transport failure is mapped to a handling policy before either
//! path acts on it. The mapping depends on which path saw the failure:
//!
//! | Code                                     | Send              | Receive           |
//! |------------------------------------------|-------------------|-------------------|
//! | `Cancelled`                              | `Cancelled`       | `Cancelled`       |
//! | `Aborted`, `Internal`, `Unknown`, `DataLoss` | `Recoverable` | `Continue`        |
//! | `Unavailable`, `DeadlineExceeded`, `FailedPrecondition` | `Recoverable` | `Recoverable` |
//! | `Ok`, `NotFound`, `InvalidArgument`, ... | `FatalUnexpected` | `FatalUnexpected` |
//!
//! Lookups that miss the table fall through to `FatalUnexpected`. Only
//! [`classify_raw`] can miss: tonic folds numeric codes it does not know
//! into `Code::Unknown` before a session sees them, so the send and
//! receive paths always hit the table. `classify_raw` is for callers that
//! hold a bare `grpc-status` number from elsewhere, such as a proxy log.

use std::fmt;

use tonic::{Code, Status};

/// Which side of the duplex call reported a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Writing a stimulus onto the request side.
    Send,
    /// Reading the next state from the response side.
    Receive,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Send => write!(f, "send"),
            Self::Receive => write!(f, "receive"),
        }
    }
}

/// Handling policy for a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// This read failed but the stream is still usable; read again.
    Continue,
    /// Cooperative shutdown. Never surfaced as an error.
    Cancelled,
    /// Transient condition. Logged and absorbed.
    Recoverable,
    /// Impossible under the protocol contract. Always escalated.
    FatalUnexpected,
}

/// Classification table for the outbound path.
pub const SEND_TABLE: &[(Code, Outcome)] = &[
    (Code::Cancelled, Outcome::Cancelled),
    (Code::Unavailable, Outcome::Recoverable),
    (Code::FailedPrecondition, Outcome::Recoverable),
    (Code::DataLoss, Outcome::Recoverable),
    (Code::DeadlineExceeded, Outcome::Recoverable),
    (Code::Aborted, Outcome::Recoverable),
    (Code::Internal, Outcome::Recoverable),
    (Code::Unknown, Outcome::Recoverable),
    (Code::Ok, Outcome::FatalUnexpected),
    (Code::NotFound, Outcome::FatalUnexpected),
    (Code::InvalidArgument, Outcome::FatalUnexpected),
    (Code::Unimplemented, Outcome::FatalUnexpected),
    (Code::AlreadyExists, Outcome::FatalUnexpected),
    (Code::PermissionDenied, Outcome::FatalUnexpected),
    (Code::ResourceExhausted, Outcome::FatalUnexpected),
    (Code::OutOfRange, Outcome::FatalUnexpected),
    (Code::Unauthenticated, Outcome::FatalUnexpected),
];

/// Classification table for the inbound loop.
pub const RECEIVE_TABLE: &[(Code, Outcome)] = &[
    (Code::Cancelled, Outcome::Cancelled),
    (Code::Aborted, Outcome::Continue),
    (Code::Internal, Outcome::Continue),
    (Code::Unknown, Outcome::Continue),
    (Code::DataLoss, Outcome::Continue),
    (Code::Unavailable, Outcome::Recoverable),
    (Code::DeadlineExceeded, Outcome::Recoverable),
    (Code::FailedPrecondition, Outcome::Recoverable),
    (Code::Ok, Outcome::FatalUnexpected),
    (Code::NotFound, Outcome::FatalUnexpected),
    (Code::InvalidArgument, Outcome::FatalUnexpected),
    (Code::Unimplemented, Outcome::FatalUnexpected),
    (Code::AlreadyExists, Outcome::FatalUnexpected),
    (Code::PermissionDenied, Outcome::FatalUnexpected),
    (Code::ResourceExhausted, Outcome::FatalUnexpected),
    (Code::OutOfRange, Outcome::FatalUnexpected),
    (Code::Unauthenticated, Outcome::FatalUnexpected),
];

/// Table consulted for the given operation.
#[inline]
pub fn table(operation: Operation) -> &'static [(Code, Outcome)] {
    match operation {
        Operation::Send => SEND_TABLE,
        Operation::Receive => RECEIVE_TABLE,
    }
}

/// Classify a status code observed on `operation`.
pub fn classify(operation: Operation, code: Code) -> Outcome {
    table(operation)
        .iter()
        .find(|(known, _)| *known == code)
        .map(|&(_, outcome)| outcome)
        .unwrap_or(Outcome::FatalUnexpected)
}

/// Classify a raw numeric status code.
///
/// Unlike [`Code::from_i32`], which folds unrecognised values into
/// `Unknown`, a value outside the table is `FatalUnexpected`.
pub fn classify_raw(operation: Operation, raw: i32) -> Outcome {
    table(operation)
        .iter()
        .find(|(known, _)| *known as i32 == raw)
        .map(|&(_, outcome)| outcome)
        .unwrap_or(Outcome::FatalUnexpected)
}

/// Classify a transport status.
#[inline]
pub fn classify_status(operation: Operation, status: &Status) -> Outcome {
    classify(operation, status.code())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTRACT_BREAKS: [Code; 9] = [
        Code::Ok,
        Code::NotFound,
        Code::InvalidArgument,
        Code::Unimplemented,
        Code::AlreadyExists,
        Code::PermissionDenied,
        Code::ResourceExhausted,
        Code::OutOfRange,
        Code::Unauthenticated,
    ];

    #[test]
    fn test_tables_cover_every_code_once() {
        for op in [Operation::Send, Operation::Receive] {
            let t = table(op);
            assert_eq!(t.len(), 17);
            for raw in 0..=16 {
                let hits = t.iter().filter(|(c, _)| *c as i32 == raw).count();
                assert_eq!(hits, 1, "{op}: code {raw} listed {hits} times");
            }
        }
    }

    #[test]
    fn test_cancelled_on_both_paths() {
        assert_eq!(classify(Operation::Send, Code::Cancelled), Outcome::Cancelled);
        assert_eq!(
            classify(Operation::Receive, Code::Cancelled),
            Outcome::Cancelled
        );
    }

    #[test]
    fn test_send_never_continues() {
        assert!(SEND_TABLE.iter().all(|(_, o)| *o != Outcome::Continue));
    }

    #[test]
    fn test_transient_codes_recoverable_on_send() {
        for code in [
            Code::Unavailable,
            Code::FailedPrecondition,
            Code::DataLoss,
            Code::DeadlineExceeded,
            Code::Aborted,
            Code::Internal,
            Code::Unknown,
        ] {
            assert_eq!(classify(Operation::Send, code), Outcome::Recoverable);
        }
    }

    #[test]
    fn test_receive_splits_transient_codes() {
        for code in [Code::Aborted, Code::Internal, Code::Unknown, Code::DataLoss] {
            assert_eq!(classify(Operation::Receive, code), Outcome::Continue);
        }
        for code in [
            Code::Unavailable,
            Code::DeadlineExceeded,
            Code::FailedPrecondition,
        ] {
            assert_eq!(classify(Operation::Receive, code), Outcome::Recoverable);
        }
    }

    #[test]
    fn test_contract_breaks_fatal_on_both_paths() {
        for code in CONTRACT_BREAKS {
            assert_eq!(classify(Operation::Send, code), Outcome::FatalUnexpected);
            assert_eq!(
                classify(Operation::Receive, code),
                Outcome::FatalUnexpected
            );
        }
    }

    #[test]
    fn test_unknown_raw_code_fails_closed() {
        assert_eq!(classify_raw(Operation::Send, 17), Outcome::FatalUnexpected);
        assert_eq!(classify_raw(Operation::Receive, -1), Outcome::FatalUnexpected);
        assert_eq!(classify_raw(Operation::Receive, 99), Outcome::FatalUnexpected);
        // In-range values agree with the typed lookup.
        assert_eq!(classify_raw(Operation::Receive, 13), Outcome::Continue);
        assert_eq!(classify_raw(Operation::Send, 1), Outcome::Cancelled);
    }

    #[test]
    fn test_transport_folds_unknown_numbers() {
        let folded = Code::from_i32(99);
        assert_eq!(folded, Code::Unknown);
        assert_eq!(classify(Operation::Receive, folded), Outcome::Continue);
        assert_eq!(classify(Operation::Send, folded), Outcome::Recoverable);
    }

    #[test]
    fn test_classify_status() {
        let status = Status::unavailable("connection reset");
        assert_eq!(
            classify_status(Operation::Receive, &status),
            Outcome::Recoverable
        );
        assert_eq!(classify_status(Operation::Send, &status), Outcome::Recoverable);
    }
}
