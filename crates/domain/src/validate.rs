//! Balance/invariant engine.
//!
//! Given a candidate transaction, produce the full list of invariant
//! violations. Checks run independently and are never short-circuited, so a
//! caller sees every violation in one response. Validation has no hidden
//! state: calling it twice yields identical results.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::account::Account;
use crate::currency::CurrencyCode;
use crate::entry::{Entry, EntryAmount};
use crate::transaction::Transaction;

/// An accounting invariant violation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Violation {
    #[error("transaction must have at least 2 entries")]
    NotEnoughEntries,

    #[error("transaction entries must all use the same currency")]
    UnmatchedCurrencies,

    #[error("transaction entries must balance to zero: {currency} is off by {sum}")]
    OutOfBalance { currency: CurrencyCode, sum: Decimal },
}

/// Signed sum of entry amounts per currency, in first-appearance order.
fn currency_sums(entries: &[Entry]) -> Vec<(CurrencyCode, Decimal)> {
    let mut sums: Vec<(CurrencyCode, Decimal)> = Vec::new();
    for entry in entries {
        match sums.iter_mut().find(|(curr, _)| *curr == entry.currency) {
            Some((_, sum)) => *sum += entry.amount(),
            None => sums.push((entry.currency.clone(), entry.amount())),
        }
    }
    sums
}

/// Validate a candidate transaction, returning every violation found.
///
/// A transaction may span multiple currencies provided each currency's
/// subtotal is independently zero. A transaction with fewer than two entries
/// can never balance (a nonzero single entry cannot sum to zero), so
/// `NotEnoughEntries` and `OutOfBalance` frequently co-occur.
pub fn validate(tx: &Transaction) -> Vec<Violation> {
    let mut violations = Vec::new();

    if tx.entries.len() < 2 {
        violations.push(Violation::NotEnoughEntries);
    }

    for (currency, sum) in currency_sums(&tx.entries) {
        if sum != Decimal::ZERO {
            violations.push(Violation::OutOfBalance { currency, sum });
        }
    }

    violations
}

/// Synthesize the single entry that would balance `tx`, against `account`.
///
/// Returns `Ok(None)` when the transaction already balances. Only defined
/// when exactly one currency is in play: an unbalanced multi-currency
/// transaction has no single balancing entry, which surfaces as
/// [`Violation::UnmatchedCurrencies`]. Convenience for auto-balancing UIs;
/// the posting engine never calls this.
pub fn generate_missing_entry(
    tx: &Transaction,
    account: &Account,
) -> Result<Option<Entry>, Violation> {
    let sums = currency_sums(&tx.entries);
    let unbalanced: Vec<_> = sums
        .iter()
        .filter(|(_, sum)| *sum != Decimal::ZERO)
        .collect();

    if unbalanced.is_empty() {
        return Ok(None);
    }
    if sums.len() > 1 {
        return Err(Violation::UnmatchedCurrencies);
    }

    let (currency, sum) = unbalanced[0];
    // A net-debit imbalance is offset by a credit, and vice versa. The
    // constructors cannot fail here: sum is nonzero so abs() is positive.
    let amount = if *sum > Decimal::ZERO {
        EntryAmount::cr(sum.abs())
    } else {
        EntryAmount::dr(sum.abs())
    }
    .map_err(|_| Violation::OutOfBalance {
        currency: currency.clone(),
        sum: *sum,
    })?;

    Ok(Some(Entry::new(account.id, amount, currency.clone())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{AccountName, Normal};
    use proptest::prelude::*;
    use rust_decimal_macros::dec;
    use tally_core::AccountId;

    fn usd() -> CurrencyCode {
        CurrencyCode::parse("USD").unwrap()
    }

    fn cad() -> CurrencyCode {
        CurrencyCode::parse("CAD").unwrap()
    }

    fn dr(magnitude: Decimal, currency: CurrencyCode) -> Entry {
        Entry::new(
            AccountId::new(),
            EntryAmount::dr(magnitude).unwrap(),
            currency,
        )
    }

    fn cr(magnitude: Decimal, currency: CurrencyCode) -> Entry {
        Entry::new(
            AccountId::new(),
            EntryAmount::cr(magnitude).unwrap(),
            currency,
        )
    }

    #[test]
    fn balanced_transaction_validates_clean() {
        let tx = Transaction::new(vec![dr(dec!(1000), usd()), cr(dec!(1000), usd())]);
        assert!(validate(&tx).is_empty());
    }

    #[test]
    fn multi_currency_is_fine_when_each_subtotal_is_zero() {
        let tx = Transaction::new(vec![
            dr(dec!(100), usd()),
            cr(dec!(100), usd()),
            dr(dec!(48), cad()),
            cr(dec!(48), cad()),
        ]);
        assert!(validate(&tx).is_empty());
    }

    #[test]
    fn too_few_entries() {
        let tx = Transaction::new(vec![dr(dec!(5), usd())]);
        let violations = validate(&tx);
        assert!(violations.contains(&Violation::NotEnoughEntries));
        assert!(violations.contains(&Violation::OutOfBalance {
            currency: usd(),
            sum: dec!(5),
        }));
    }

    #[test]
    fn empty_transaction_has_only_the_count_violation() {
        let tx = Transaction::new(vec![]);
        assert_eq!(validate(&tx), vec![Violation::NotEnoughEntries]);
    }

    #[test]
    fn each_unbalanced_currency_is_reported() {
        let tx = Transaction::new(vec![
            dr(dec!(100), usd()),
            cr(dec!(90), usd()),
            dr(dec!(7), cad()),
        ]);
        let violations = validate(&tx);
        assert_eq!(
            violations,
            vec![
                Violation::OutOfBalance {
                    currency: usd(),
                    sum: dec!(10),
                },
                Violation::OutOfBalance {
                    currency: cad(),
                    sum: dec!(7),
                },
            ]
        );
    }

    #[test]
    fn validation_is_idempotent() {
        let tx = Transaction::new(vec![dr(dec!(100), usd()), cr(dec!(90), usd())]);
        assert_eq!(validate(&tx), validate(&tx));
    }

    #[test]
    fn missing_entry_offsets_a_net_debit_with_a_credit() {
        let equity = Account::new(AccountName::parse("Equity").unwrap(), Normal::Cr);
        let tx = Transaction::new(vec![dr(dec!(100), usd()), cr(dec!(40), usd())]);

        let entry = generate_missing_entry(&tx, &equity).unwrap().unwrap();
        assert_eq!(entry.account, equity.id);
        assert_eq!(entry.currency, usd());
        assert_eq!(entry.amount, EntryAmount::cr(dec!(60)).unwrap());
    }

    #[test]
    fn missing_entry_offsets_a_net_credit_with_a_debit() {
        let equity = Account::new(AccountName::parse("Equity").unwrap(), Normal::Cr);
        let tx = Transaction::new(vec![cr(dec!(25), usd())]);

        let entry = generate_missing_entry(&tx, &equity).unwrap().unwrap();
        assert_eq!(entry.amount, EntryAmount::dr(dec!(25)).unwrap());
    }

    #[test]
    fn missing_entry_is_none_when_balanced() {
        let equity = Account::new(AccountName::parse("Equity").unwrap(), Normal::Cr);
        let tx = Transaction::new(vec![dr(dec!(10), usd()), cr(dec!(10), usd())]);
        assert_eq!(generate_missing_entry(&tx, &equity).unwrap(), None);
    }

    #[test]
    fn missing_entry_refuses_mixed_currencies() {
        let equity = Account::new(AccountName::parse("Equity").unwrap(), Normal::Cr);
        let tx = Transaction::new(vec![dr(dec!(10), usd()), cr(dec!(3), cad())]);
        assert_eq!(
            generate_missing_entry(&tx, &equity),
            Err(Violation::UnmatchedCurrencies)
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: any set of dr/cr pairs with matching magnitudes (per
        /// currency) validates with no violations.
        #[test]
        fn paired_entries_always_balance(
            amounts in prop::collection::vec(1i64..1_000_000i64, 1..10)
        ) {
            let mut entries = Vec::new();
            for (i, cents) in amounts.iter().enumerate() {
                let magnitude = Decimal::new(*cents, 2);
                let currency = if i % 2 == 0 { usd() } else { cad() };
                entries.push(dr(magnitude, currency.clone()));
                entries.push(cr(magnitude, currency));
            }
            let tx = Transaction::new(entries);
            prop_assert!(validate(&tx).is_empty());
        }

        /// Property: perturbing one side of a balanced pair is always
        /// reported as OutOfBalance for that currency.
        #[test]
        fn perturbed_entries_never_balance(
            cents in 1i64..1_000_000i64,
            skew in 1i64..1_000i64,
        ) {
            let magnitude = Decimal::new(cents, 2);
            let skewed = magnitude + Decimal::new(skew, 2);
            let tx = Transaction::new(vec![dr(skewed, usd()), cr(magnitude, usd())]);

            let violations = validate(&tx);
            prop_assert_eq!(violations, vec![Violation::OutOfBalance {
                currency: usd(),
                sum: Decimal::new(skew, 2),
            }]);
        }
    }
}
