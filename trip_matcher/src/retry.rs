//! The retry policy as a pure decision function. The HTTP loop feeds each
//! response in as an event and acts on the verdict, which keeps the policy
//! testable without a provider.

use std::time::Duration;

use crate::MatchError;

/// What the provider did on one attempt.
#[derive(Clone, Debug)]
pub enum ApiEvent {
    Ok,
    RateLimited { retry_after: Option<f64> },
    ServerError(u16),
    ClientError { status: u16, message: String },
    Transport(String),
}

/// What the caller should do next.
#[derive(Debug)]
pub enum Action {
    Accept,
    RetryAfter(Duration),
    /// 4xx complaining about invalid coordinates: drop the bad points and
    /// try again (once, enforced by the chunk matcher).
    Refilter,
    Fail(MatchError),
}

pub const MAX_ATTEMPTS: u32 = 5;
const MIN_BACKOFF: Duration = Duration::from_secs(2);

fn backoff(attempt: u32) -> Duration {
    MIN_BACKOFF * 2u32.saturating_pow(attempt.saturating_sub(1))
}

pub fn next_action(event: ApiEvent, attempt: u32, max_attempts: u32) -> Action {
    match event {
        ApiEvent::Ok => Action::Accept,
        ApiEvent::RateLimited { retry_after } => {
            if attempt >= max_attempts {
                return Action::Fail(MatchError::RateLimitExceeded(max_attempts));
            }
            // Honor the provider's Retry-After when present.
            let wait = retry_after
                .map(Duration::from_secs_f64)
                .unwrap_or_else(|| backoff(attempt));
            Action::RetryAfter(wait)
        }
        ApiEvent::ServerError(status) => {
            if attempt >= max_attempts {
                return Action::Fail(MatchError::ProviderUnavailable(format!(
                    "server error {status} after {max_attempts} attempts"
                )));
            }
            Action::RetryAfter(backoff(attempt))
        }
        ApiEvent::Transport(message) => {
            if attempt >= max_attempts {
                return Action::Fail(MatchError::ProviderUnavailable(format!(
                    "{message} after {max_attempts} attempts"
                )));
            }
            Action::RetryAfter(backoff(attempt))
        }
        ApiEvent::ClientError { status, message } => {
            if message.to_lowercase().contains("invalid coordinates") {
                Action::Refilter
            } else {
                Action::Fail(MatchError::ClientError(format!("{status}: {message}")))
            }
        }
    }
}
