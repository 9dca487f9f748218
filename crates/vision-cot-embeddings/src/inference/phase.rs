//! Decoding phases and the events that move between them.
//!
//! ```text
//!            SoftStep                Token
//!           ┌───────┐              ┌───────┐
//!           v       │   EndMarker  v       │    Eos | AnswerCap
//!         Soft ─────┴────────────> Discrete ┴──────────────────> Done
//! ```
//!
//! There is no edge back into `Soft`. The engine asks the phase before
//! every projection, so an embedding projection in `Discrete` or a
//! vocabulary projection in `Soft` is an error rather than a silent mix.

use std::fmt;

use crate::error::{VisionCotError, VisionCotResult};

/// Current decoding phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodePhase {
    /// Emitting continuous embeddings.
    Soft,
    /// Emitting vocabulary tokens after the end marker.
    Discrete,
    /// Finished.
    Done,
}

/// Something that happened during decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    /// One predicted embedding was appended.
    SoftStep,
    /// The end marker was appended.
    EndMarker,
    /// One discrete token was appended.
    Token,
    /// End-of-sequence was sampled.
    Eos,
    /// The answer token cap was reached.
    AnswerCap,
}

impl DecodePhase {
    /// Apply `event`, rejecting transitions the diagram does not contain.
    pub fn on(self, event: PhaseEvent) -> VisionCotResult<Self> {
        use DecodePhase::*;
        use PhaseEvent::*;

        match (self, event) {
            (Soft, SoftStep) => Ok(Soft),
            (Soft, EndMarker) => Ok(Discrete),
            (Discrete, Token) => Ok(Discrete),
            (Discrete, Eos | AnswerCap) => Ok(Done),
            (phase, event) => Err(VisionCotError::InvalidInput(format!(
                "Illegal decode transition: {:?} in phase {}",
                event, phase
            ))),
        }
    }

    /// Fail unless the phase is `expected`.
    pub fn require(self, expected: DecodePhase) -> VisionCotResult<()> {
        if self == expected {
            Ok(())
        } else {
            Err(VisionCotError::InvalidInput(format!(
                "Operation requires phase {}, decoder is in {}",
                expected, self
            )))
        }
    }
}

impl fmt::Display for DecodePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DecodePhase::Soft => "soft",
            DecodePhase::Discrete => "discrete",
            DecodePhase::Done => "done",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_path() {
        let phase = DecodePhase::Soft
            .on(PhaseEvent::SoftStep)
            .and_then(|p| p.on(PhaseEvent::EndMarker))
            .and_then(|p| p.on(PhaseEvent::Token))
            .and_then(|p| p.on(PhaseEvent::Eos))
            .unwrap();
        assert_eq!(phase, DecodePhase::Done);
    }

    #[test]
    fn test_no_reentry_into_soft() {
        assert!(DecodePhase::Discrete.on(PhaseEvent::SoftStep).is_err());
        assert!(DecodePhase::Discrete.on(PhaseEvent::EndMarker).is_err());
    }

    #[test]
    fn test_soft_cannot_emit_tokens() {
        assert!(DecodePhase::Soft.on(PhaseEvent::Token).is_err());
        assert!(DecodePhase::Soft.on(PhaseEvent::Eos).is_err());
    }

    #[test]
    fn test_done_is_terminal() {
        for event in [
            PhaseEvent::SoftStep,
            PhaseEvent::EndMarker,
            PhaseEvent::Token,
            PhaseEvent::Eos,
            PhaseEvent::AnswerCap,
        ] {
            assert!(DecodePhase::Done.on(event).is_err());
        }
    }

    #[test]
    fn test_require() {
        assert!(DecodePhase::Soft.require(DecodePhase::Soft).is_ok());
        assert!(DecodePhase::Soft.require(DecodePhase::Discrete).is_err());
    }
}
