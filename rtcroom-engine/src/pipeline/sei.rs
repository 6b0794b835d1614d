use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use std::num::NonZeroU32;

use crate::error::{EngineError, EngineResult};
use crate::frame::{SeiMessage, SEI_MAX_PAYLOAD};

pub const SEI_MAX_MESSAGES_PER_SEC: u32 = 30;
pub const SEI_MAX_BYTES_PER_SEC: u32 = 8000;

/// Token-bucket SEI budget of one send channel
///
/// Messages and payload bytes are metered by separate GCRA limiters, each
/// allowing a full second's worth as a burst. The message cell is spent
/// before the byte cells, so a message refused for its size still counts
/// against the message rate.
pub struct SeiBudget {
    messages: DefaultDirectRateLimiter,
    bytes: DefaultDirectRateLimiter,
}

impl std::fmt::Debug for SeiBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeiBudget").finish_non_exhaustive()
    }
}

impl Default for SeiBudget {
    fn default() -> Self {
        Self::new()
    }
}

impl SeiBudget {
    #[must_use]
    pub fn new() -> Self {
        Self {
            messages: RateLimiter::direct(Quota::per_second(nonzero!(30u32))),
            bytes: RateLimiter::direct(Quota::per_second(nonzero!(8000u32))),
        }
    }

    /// Charge one message against the budget
    pub fn try_consume(&self, message: &SeiMessage) -> EngineResult<()> {
        let len = message.payload.len();
        if len > SEI_MAX_PAYLOAD {
            return Err(EngineError::invalid_parameter(format!(
                "SEI payload of {len} bytes exceeds {SEI_MAX_PAYLOAD}"
            )));
        }

        if self.messages.check().is_err() {
            return Err(EngineError::invalid_parameter(format!(
                "SEI rate exceeds {SEI_MAX_MESSAGES_PER_SEC} messages per second"
            )));
        }
        let Some(cells) = u32::try_from(len).ok().and_then(NonZeroU32::new) else {
            return Ok(());
        };
        match self.bytes.check_n(cells) {
            Ok(Ok(())) => Ok(()),
            _ => Err(EngineError::invalid_parameter(format!(
                "SEI rate exceeds {SEI_MAX_BYTES_PER_SEC} bytes per second"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    fn sei(len: usize) -> SeiMessage {
        SeiMessage {
            message_type: 242,
            payload: Bytes::from(vec![7u8; len]),
        }
    }

    #[test]
    fn test_31st_message_in_one_second_fails() {
        let budget = SeiBudget::new();
        for i in 0..30 {
            assert!(budget.try_consume(&sei(1)).is_ok(), "message {i}");
        }
        let err = budget.try_consume(&sei(1)).unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::InvalidParameter);
    }

    #[test]
    fn test_budget_refills_over_time() {
        let budget = SeiBudget::new();
        for _ in 0..30 {
            budget.try_consume(&sei(1)).unwrap();
        }
        assert!(budget.try_consume(&sei(1)).is_err());
        // one message cell comes back every 1/30 s
        std::thread::sleep(Duration::from_millis(80));
        assert!(budget.try_consume(&sei(1)).is_ok());
    }

    #[test]
    fn test_oversized_message_fails_with_full_budget() {
        let budget = SeiBudget::new();
        assert!(budget.try_consume(&sei(1001)).is_err());
        for _ in 0..30 {
            budget.try_consume(&sei(1)).unwrap();
        }
    }

    #[test]
    fn test_byte_budget() {
        let budget = SeiBudget::new();
        for _ in 0..8 {
            budget.try_consume(&sei(1000)).unwrap();
        }
        assert!(budget.try_consume(&sei(1000)).is_err());
    }
}
