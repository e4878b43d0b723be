use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Build a slot's time window, rejecting empty/inverted and out-of-range spans.
pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::InvalidSpan { start, end });
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if end - start > MAX_SLOT_DURATION_MS {
        return Err(EngineError::LimitExceeded("slot too long"));
    }
    Ok(Span::new(start, end))
}

pub(crate) fn validate_title(title: &str) -> Result<(), EngineError> {
    if title.len() > MAX_TITLE_LEN {
        return Err(EngineError::LimitExceeded("title too long"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: Ms = 1_767_225_600_000; // 2026-01-01

    #[test]
    fn inverted_and_empty_spans_rejected() {
        assert!(matches!(validate_span(T0, T0), Err(EngineError::InvalidSpan { .. })));
        assert!(matches!(validate_span(T0 + 1, T0), Err(EngineError::InvalidSpan { .. })));
        assert_eq!(validate_span(T0, T0 + 1).unwrap(), Span::new(T0, T0 + 1));
    }

    #[test]
    fn out_of_range_rejected() {
        assert!(matches!(validate_span(0, 1000), Err(EngineError::LimitExceeded(_))));
        assert!(matches!(
            validate_span(T0, T0 + MAX_SLOT_DURATION_MS + 1),
            Err(EngineError::LimitExceeded("slot too long"))
        ));
    }

    #[test]
    fn title_length() {
        assert!(validate_title(&"x".repeat(MAX_TITLE_LEN)).is_ok());
        assert!(validate_title(&"x".repeat(MAX_TITLE_LEN + 1)).is_err());
    }
}
