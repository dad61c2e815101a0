use crate::amount::Amount;
use serde::{Deserialize, Serialize};

//------------------------------------        Channel balances        ----------------------------------------------//

/// The off-ledger balance sheet of a channel. At every commit,
/// `host + guest + pending` never exceeds the funded amount.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelBalances {
    pub host: Amount,
    pub guest: Amount,
    /// Value of the payment in flight, if any.
    pub pending: Amount,
}

impl ChannelBalances {
    pub fn new(host: Amount, guest: Amount) -> Self {
        ChannelBalances { host, guest, pending: Amount::ZERO }
    }

    pub fn total(&self) -> Amount {
        self.host + self.guest + self.pending
    }

    /// Move `pending` out of the payer's balance. Returns `None` if the payer cannot cover it.
    pub fn hold(&self, sender_is_host: bool, amount: Amount) -> Option<Self> {
        let mut next = *self;
        if sender_is_host {
            next.host = next.host.checked_sub(amount)?;
        } else {
            next.guest = next.guest.checked_sub(amount)?;
        }
        next.pending = next.pending.checked_add(amount)?;
        Some(next)
    }

    /// Release the held amount to the recipient, completing a round.
    pub fn settle(&self, sender_is_host: bool) -> Self {
        let mut next = *self;
        if sender_is_host {
            next.guest += next.pending;
        } else {
            next.host += next.pending;
        }
        next.pending = Amount::ZERO;
        next
    }

    /// Return the held amount to the payer without completing the round.
    pub fn release(&self, sender_is_host: bool) -> Self {
        let mut next = *self;
        if sender_is_host {
            next.host += next.pending;
        } else {
            next.guest += next.pending;
        }
        next.pending = Amount::ZERO;
        next
    }
}

#[cfg(test)]
mod test {
    use crate::amount::Amount;
    use crate::balance::ChannelBalances;

    fn lumens(s: &str) -> Amount {
        Amount::from_lumens(s).unwrap()
    }

    fn default_balances() -> ChannelBalances {
        ChannelBalances::new(lumens("100"), lumens("0"))
    }

    #[test]
    fn hold_and_settle() {
        let balances = default_balances();
        let held = balances.hold(true, lumens("5")).unwrap();
        assert_eq!(held.host, lumens("95"));
        assert_eq!(held.pending, lumens("5"));
        assert_eq!(held.total(), lumens("100"));

        let settled = held.settle(true);
        assert_eq!(settled.host, lumens("95"));
        assert_eq!(settled.guest, lumens("5"));
        assert_eq!(settled.pending, Amount::ZERO);
        assert_eq!(settled.total(), lumens("100"));
    }

    #[test]
    fn hold_insufficient() {
        let balances = default_balances();
        assert!(balances.hold(true, lumens("100.0000001")).is_none());
        // The guest holds nothing at all.
        assert!(balances.hold(false, lumens("0.0000001")).is_none());
    }

    #[test]
    fn release_returns_funds() {
        let balances = default_balances();
        let held = balances.hold(true, lumens("10")).unwrap();
        let released = held.release(true);
        assert_eq!(released, balances);
    }
}
