use crate::errors::Phase;
use serde::Serialize;

/// Observable progress of a run. Control flow never depends on who listens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    PhaseEntered {
        phase: Phase,
        subject: String,
    },
    PhaseCompleted {
        phase: Phase,
        subject: String,
        detail: String,
    },
    PhaseFailed {
        phase: Phase,
        subject: String,
        code: &'static str,
        message: String,
    },
    BalanceObserved {
        token: String,
        balance: String,
    },
    Warning {
        phase: Phase,
        message: String,
    },
}

pub trait EventSink {
    fn emit(&self, event: &RunEvent);
}

/// Forwards events to `tracing`, so they land in the JSON log stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &RunEvent) {
        match event {
            RunEvent::PhaseEntered { phase, subject } => {
                tracing::info!(phase = %phase, subject = %subject, "phase entered");
            }
            RunEvent::PhaseCompleted {
                phase,
                subject,
                detail,
            } => {
                tracing::info!(phase = %phase, subject = %subject, detail = %detail, "phase completed");
            }
            RunEvent::PhaseFailed {
                phase,
                subject,
                code,
                message,
            } => {
                tracing::error!(
                    phase = %phase,
                    subject = %subject,
                    code = %code,
                    error = %message,
                    "phase failed"
                );
            }
            RunEvent::BalanceObserved { token, balance } => {
                tracing::info!(token = %token, balance = %balance, "balance");
            }
            RunEvent::Warning { phase, message } => {
                tracing::warn!(phase = %phase, "{message}");
            }
        }
    }
}
