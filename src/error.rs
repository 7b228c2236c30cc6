// src/error.rs
use crate::order::OrderStatus;
use std::fmt;

#[derive(Debug)]
pub enum CoinError {
    InvalidAmount,
    Validation(String),
    InsufficientBalance { required: u64, available: u64 },
    SuspiciousActivity(String),
    WalletNotFound,
    OrderNotFound,
    RecordNotFound,
    ReservationNotFound,
    DuplicateReservation(uuid::Uuid),
    InvalidState(String),
    IllegalTransition { from: OrderStatus, to: OrderStatus },
    Conflict(String),
    Storage(String),
}

impl CoinError {
    /// Stable machine code for transport layers. Several variants share a
    /// code on purpose: the variant carries the detail, the code carries
    /// the class.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidAmount | Self::Validation(_) => "VALIDATION_ERROR",
            Self::InsufficientBalance { .. } => "INSUFFICIENT_COINS",
            Self::SuspiciousActivity(_) => "SUSPICIOUS_ACTIVITY",
            Self::WalletNotFound
            | Self::OrderNotFound
            | Self::RecordNotFound
            | Self::ReservationNotFound => "NOT_FOUND",
            Self::DuplicateReservation(_)
            | Self::InvalidState(_)
            | Self::IllegalTransition { .. }
            | Self::Conflict(_) => "CONFLICT",
            Self::Storage(_) => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for CoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidAmount => write!(f, "Invalid amount"),
            Self::Validation(msg) => write!(f, "Validation failed: {}", msg),
            Self::InsufficientBalance {
                required,
                available,
            } => write!(
                f,
                "Insufficient balance: required {}, available {}",
                required, available
            ),
            Self::SuspiciousActivity(reason) => {
                write!(f, "Suspicious activity: {}", reason)
            }
            Self::WalletNotFound => write!(f, "Wallet not found"),
            Self::OrderNotFound => write!(f, "Order not found"),
            Self::RecordNotFound => write!(f, "Step record not found"),
            Self::ReservationNotFound => write!(f, "Reservation not found"),
            Self::DuplicateReservation(id) => {
                write!(f, "Duplicate reservation for reference: {}", id)
            }
            Self::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Self::IllegalTransition { from, to } => {
                write!(f, "Illegal order transition: {} -> {}", from, to)
            }
            Self::Conflict(msg) => write!(f, "Conflict: {}", msg),
            Self::Storage(msg) => write!(f, "Storage error: {}", msg),
        }
    }
}

impl std::error::Error for CoinError {}
