//! Per-rule facts the optimizer may learn from the grammar.
//!
//! The grammar analysis that produces these runs elsewhere; the optimizer
//! only consumes the signum-encoded "always matches / never matches /
//! unknown" verdict per rule.

/// Static match verdict for one grammar rule.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum MatchHint {
    /// The rule never matches; calling it always yields the failure sentinel.
    Never,
    #[default]
    Unknown,
    /// The rule always matches; calling it never yields the failure sentinel.
    Always,
}

/// Match hints for every rule of a grammar, indexed by rule id.
#[derive(Clone, Debug, Default)]
pub struct RuleHints {
    hints: Vec<MatchHint>,
}

impl RuleHints {
    pub fn new(hints: Vec<MatchHint>) -> RuleHints {
        RuleHints { hints }
    }

    /// Builds hints from the signum encoding used at the interface boundary
    /// (`match < 0` never, `match > 0` always, `0` unknown).
    pub fn from_signums(signums: &[i8]) -> RuleHints {
        RuleHints {
            hints: signums
                .iter()
                .map(|&s| match s {
                    s if s < 0 => MatchHint::Never,
                    0 => MatchHint::Unknown,
                    _ => MatchHint::Always,
                })
                .collect(),
        }
    }

    /// Missing hints are uniformly unknown.
    pub fn hint(&self, rule: usize) -> MatchHint {
        self.hints.get(rule).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signum_encoding() {
        let hints = RuleHints::from_signums(&[-1, 0, 1]);
        assert_eq!(hints.hint(0), MatchHint::Never);
        assert_eq!(hints.hint(1), MatchHint::Unknown);
        assert_eq!(hints.hint(2), MatchHint::Always);
        // out of range falls back to unknown
        assert_eq!(hints.hint(7), MatchHint::Unknown);
    }
}
