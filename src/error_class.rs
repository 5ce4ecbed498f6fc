//! Classification of settlement failures.
//!
//! Chain clients report failures as free text. [`ErrorClassifier`] maps that text onto a
//! small, stable set of [`ErrorKind`]s, each with a fixed remediation hint. Matching is by
//! pattern over the message and follows the phrasing of go-ethereum style JSON-RPC nodes
//! and the FiatToken (USDC) contract; other clients may word the same failure differently
//! and end up as [`ErrorKind::Unknown`]. Unknown failures keep the raw message verbatim.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InsufficientGas,
    InsufficientFunds,
    TransactionReverted,
    NonceConflict,
    Unknown,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::InsufficientGas => "INSUFFICIENT_GAS",
            ErrorKind::InsufficientFunds => "INSUFFICIENT_FUNDS",
            ErrorKind::TransactionReverted => "TRANSACTION_REVERTED",
            ErrorKind::NonceConflict => "NONCE_CONFLICT",
            ErrorKind::Unknown => "UNKNOWN",
        }
    }

    pub fn hint(&self) -> &'static str {
        match self {
            ErrorKind::InsufficientGas => {
                "The facilitator account cannot pay for gas. Top up its native balance and retry with a new authorization."
            }
            ErrorKind::InsufficientFunds => {
                "The payer's token balance is below the requested amount. Fund the payer wallet and sign a new authorization."
            }
            ErrorKind::TransactionReverted => {
                "The token contract rejected the transfer. Check the authorization window, amount and signature, then sign a new authorization."
            }
            ErrorKind::NonceConflict => {
                "This authorization was already used or its nonce collides. Request a new challenge and sign with a fresh nonce."
            }
            ErrorKind::Unknown => {
                "Settlement failed for an unrecognized reason. Inspect the error message and retry with a new authorization."
            }
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        [
            ErrorKind::InsufficientGas,
            ErrorKind::InsufficientFunds,
            ErrorKind::TransactionReverted,
            ErrorKind::NonceConflict,
            ErrorKind::Unknown,
        ]
        .into_iter()
        .find(|kind| kind.code() == code)
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// A failure with its kind, the raw message and the hint for its kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub message: String,
    pub hint: &'static str,
}

impl ClassifiedError {
    pub fn new<M: Into<String>>(kind: ErrorKind, message: M) -> Self {
        Self {
            kind,
            message: message.into(),
            hint: kind.hint(),
        }
    }
}

impl Display for ClassifiedError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

// First match wins. Gas comes before funds: "insufficient funds for gas" is a gas problem.
static RULES: LazyLock<Vec<(ErrorKind, Regex)>> = LazyLock::new(|| {
    [
        (
            ErrorKind::InsufficientGas,
            r"(?i)intrinsic gas too low|out of gas|gas required exceeds|insufficient funds for gas",
        ),
        (
            ErrorKind::NonceConflict,
            r"(?i)nonce too low|nonce too high|already known|replacement transaction underpriced|authorization is used|nonce (has )?already (been )?used",
        ),
        (
            ErrorKind::InsufficientFunds,
            r"(?i)insufficient funds|insufficient balance|transfer amount exceeds balance",
        ),
        (ErrorKind::TransactionReverted, r"(?i)revert"),
    ]
    .into_iter()
    .map(|(kind, pattern)| (kind, Regex::new(pattern).expect("valid classifier pattern")))
    .collect()
});

/// Maps failure text onto an [`ErrorKind`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn classify<M: Into<String>>(message: M) -> ClassifiedError {
        let message = message.into();
        let kind = RULES
            .iter()
            .find(|(_, pattern)| pattern.is_match(&message))
            .map(|(kind, _)| *kind)
            .unwrap_or(ErrorKind::Unknown);
        ClassifiedError::new(kind, message)
    }

    /// Classifies `error` together with its `source()` chain.
    pub fn classify_error<E: std::error::Error>(error: &E) -> ClassifiedError {
        let mut message = error.to_string();
        let mut source = error.source();
        while let Some(cause) = source {
            let cause_text = cause.to_string();
            if !message.contains(&cause_text) {
                message.push_str(": ");
                message.push_str(&cause_text);
            }
            source = cause.source();
        }
        Self::classify(message)
    }
}
