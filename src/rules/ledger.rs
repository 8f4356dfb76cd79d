use super::{Intent, Layer, Verdict};

/// How an intent fared when applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// Failed but the failure was tolerated
    Absorbed(String),
    Failed(String),
}

impl Outcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Outcome::Applied)
    }
}

#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub seq: u64,
    pub intent: Intent,
    pub outcome: Outcome,
}

/// Ordered log of every intent handed to the executor.
///
/// Entries are never removed. Questions about the resulting filter state are
/// answered by replaying the applied entries in order.
#[derive(Debug, Default)]
pub struct RuleLedger {
    entries: Vec<LedgerEntry>,
    next_seq: u64,
}

impl RuleLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, intent: Intent, outcome: Outcome) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(LedgerEntry {
            seq,
            intent,
            outcome,
        });
        seq
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn applied(&self) -> impl DoubleEndedIterator<Item = &Intent> {
        self.entries
            .iter()
            .filter(|e| e.outcome.is_applied())
            .map(|e| &e.intent)
    }

    /// OUTPUT chain policy at `layer`. Kernel default is ACCEPT.
    pub fn effective_policy(&self, layer: Layer) -> Verdict {
        self.applied()
            .rev()
            .find_map(|intent| match intent {
                Intent::SetOutputPolicy { layer: l, verdict } if *l == layer => Some(*verdict),
                _ => None,
            })
            .unwrap_or(Verdict::Accept)
    }

    /// Whether locally generated traffic may leave through `iface` at `layer`.
    ///
    /// An allow rule only counts if no flush of the layer's filter table came
    /// after it.
    pub fn permits_output(&self, layer: Layer, iface: &str) -> bool {
        if self.effective_policy(layer) == Verdict::Accept {
            return true;
        }
        for intent in self.applied().rev() {
            match intent {
                Intent::Flush { layer: l, table } if *l == layer && flushes_filter(*table) => {
                    return false;
                }
                Intent::AllowOutput { layer: l, iface: i } if *l == layer && i == iface => {
                    return true;
                }
                _ => {}
            }
        }
        false
    }
}

fn flushes_filter(table: Option<&str>) -> bool {
    matches!(table, None | Some("filter"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(layer: Layer, verdict: Verdict) -> Intent {
        Intent::SetOutputPolicy { layer, verdict }
    }

    fn allow(layer: Layer, iface: &str) -> Intent {
        Intent::AllowOutput {
            layer,
            iface: iface.into(),
        }
    }

    #[test]
    fn test_default_policy_is_accept() {
        let ledger = RuleLedger::new();
        for layer in Layer::ALL {
            assert_eq!(ledger.effective_policy(layer), Verdict::Accept);
            assert!(ledger.permits_output(layer, "eth0"));
        }
    }

    #[test]
    fn test_drop_policy_with_allow() {
        let mut ledger = RuleLedger::new();
        ledger.record(policy(Layer::Ip, Verdict::Drop), Outcome::Applied);
        ledger.record(allow(Layer::Ip, "wan"), Outcome::Applied);

        assert_eq!(ledger.effective_policy(Layer::Ip), Verdict::Drop);
        assert!(ledger.permits_output(Layer::Ip, "wan"));
        assert!(!ledger.permits_output(Layer::Ip, "lan0"));
        assert!(ledger.permits_output(Layer::Frame, "lan0"));
    }

    #[test]
    fn test_flush_clears_allows_but_not_policy() {
        let mut ledger = RuleLedger::new();
        ledger.record(policy(Layer::Arp, Verdict::Drop), Outcome::Applied);
        ledger.record(allow(Layer::Arp, "wan"), Outcome::Applied);
        ledger.record(
            Intent::Flush {
                layer: Layer::Arp,
                table: None,
            },
            Outcome::Applied,
        );

        assert_eq!(ledger.effective_policy(Layer::Arp), Verdict::Drop);
        assert!(!ledger.permits_output(Layer::Arp, "wan"));

        ledger.record(policy(Layer::Arp, Verdict::Accept), Outcome::Applied);
        assert!(ledger.permits_output(Layer::Arp, "wan"));
        assert!(ledger.permits_output(Layer::Arp, "lan0"));
    }

    #[test]
    fn test_nat_flush_keeps_filter_allows() {
        let mut ledger = RuleLedger::new();
        ledger.record(policy(Layer::Ip, Verdict::Drop), Outcome::Applied);
        ledger.record(allow(Layer::Ip, "wan"), Outcome::Applied);
        ledger.record(
            Intent::Flush {
                layer: Layer::Ip,
                table: Some("nat"),
            },
            Outcome::Applied,
        );
        assert!(ledger.permits_output(Layer::Ip, "wan"));
    }

    #[test]
    fn test_failed_intents_are_ignored() {
        let mut ledger = RuleLedger::new();
        ledger.record(
            policy(Layer::Frame, Verdict::Drop),
            Outcome::Failed("ebtables missing".into()),
        );
        assert_eq!(ledger.effective_policy(Layer::Frame), Verdict::Accept);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_sequence_numbers() {
        let mut ledger = RuleLedger::new();
        assert_eq!(ledger.record(allow(Layer::Ip, "a"), Outcome::Applied), 0);
        assert_eq!(
            ledger.record(allow(Layer::Ip, "b"), Outcome::Absorbed("x".into())),
            1
        );
        assert_eq!(ledger.entries()[1].seq, 1);
        assert!(ledger.entries()[0].outcome.is_applied());
        assert!(!ledger.entries()[1].outcome.is_applied());
    }
}
