//! Per-role session state machines.
//!
//! A session is the totality of messages sharing one id, from
//! `quote-request` to `inference-response`. Each side advances through
//! a fixed path; any observed state sequence must be a prefix of that
//! path. Invalid transitions drop the session — there is no rollback.
//!
//! ```text
//! customer: Discovering → Quoted → Accepted → ContractSignedSent → Paid
//! provider: QuoteOffered → ContractCreatedSent → Inferring → Responded
//! ```

use std::fmt;

// ---------------------------------------------------------------------------
// Customer path
// ---------------------------------------------------------------------------

/// Customer-initiator session states.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CustomerState {
    /// Quote request published, auction window open.
    Discovering,
    /// At least one bid was observed.
    Quoted,
    /// The winning bid was accepted and sent to the provider.
    Accepted,
    /// Escrow funded, `contract-signed` sent, awaiting inference.
    ContractSignedSent,
    /// Payment settled; terminal.
    Paid,
}

impl CustomerState {
    /// The fixed customer path, in order.
    pub const PATH: [CustomerState; 5] = [
        Self::Discovering,
        Self::Quoted,
        Self::Accepted,
        Self::ContractSignedSent,
        Self::Paid,
    ];

    /// Whether `next` is the immediate successor of `self`.
    pub fn can_advance_to(self, next: Self) -> bool {
        let pos = Self::PATH.iter().position(|s| *s == self);
        let next_pos = Self::PATH.iter().position(|s| *s == next);
        matches!((pos, next_pos), (Some(a), Some(b)) if b == a + 1)
    }

    /// Whether this state ends the session.
    pub fn is_terminal(self) -> bool {
        self == Self::Paid
    }
}

impl fmt::Display for CustomerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Discovering => "discovering",
            Self::Quoted => "quoted",
            Self::Accepted => "accepted",
            Self::ContractSignedSent => "contract-signed-sent",
            Self::Paid => "paid",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Provider path
// ---------------------------------------------------------------------------

/// Provider-responder session states.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ProviderState {
    /// A quote was offered in response to a quote request.
    QuoteOffered,
    /// Escrow slot created, `contract-created` sent.
    ContractCreatedSent,
    /// Funding verified, inference running.
    Inferring,
    /// Completion sent; terminal.
    Responded,
}

impl ProviderState {
    /// The fixed provider path, in order.
    pub const PATH: [ProviderState; 4] = [
        Self::QuoteOffered,
        Self::ContractCreatedSent,
        Self::Inferring,
        Self::Responded,
    ];

    /// Whether `next` is the immediate successor of `self`.
    pub fn can_advance_to(self, next: Self) -> bool {
        let pos = Self::PATH.iter().position(|s| *s == self);
        let next_pos = Self::PATH.iter().position(|s| *s == next);
        matches!((pos, next_pos), (Some(a), Some(b)) if b == a + 1)
    }

    /// Whether this state ends the session.
    pub fn is_terminal(self) -> bool {
        self == Self::Responded
    }
}

impl fmt::Display for ProviderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::QuoteOffered => "quote-offered",
            Self::ContractCreatedSent => "contract-created-sent",
            Self::Inferring => "inferring",
            Self::Responded => "responded",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn customer_path_advances_stepwise() {
        for pair in CustomerState::PATH.windows(2) {
            assert!(pair[0].can_advance_to(pair[1]));
        }
    }

    #[test]
    fn customer_path_rejects_skips_and_regressions() {
        assert!(!CustomerState::Discovering.can_advance_to(CustomerState::Accepted));
        assert!(!CustomerState::Paid.can_advance_to(CustomerState::Discovering));
        assert!(!CustomerState::Accepted.can_advance_to(CustomerState::Quoted));
        assert!(!CustomerState::Quoted.can_advance_to(CustomerState::Quoted));
    }

    #[test]
    fn provider_path_advances_stepwise() {
        for pair in ProviderState::PATH.windows(2) {
            assert!(pair[0].can_advance_to(pair[1]));
        }
    }

    #[test]
    fn provider_path_rejects_skips_and_regressions() {
        assert!(!ProviderState::QuoteOffered.can_advance_to(ProviderState::Inferring));
        assert!(!ProviderState::Responded.can_advance_to(ProviderState::QuoteOffered));
        assert!(!ProviderState::Inferring.can_advance_to(ProviderState::ContractCreatedSent));
    }

    #[test]
    fn terminal_states() {
        assert!(CustomerState::Paid.is_terminal());
        assert!(!CustomerState::Accepted.is_terminal());
        assert!(ProviderState::Responded.is_terminal());
        assert!(!ProviderState::Inferring.is_terminal());
    }
}
