//! End-to-end ledger behavior against the in-memory backend: posting,
//! optimistic locking, version chaining, search, and balance aggregation.

use rust_decimal_macros::dec;

use tally_core::AccountId;
use tally_domain::{
    validate, Account, AccountName, CurrencyCode, Entry, EntryAmount, Normal, Transaction,
};
use tally_store::{
    AccountFilter, InMemoryLedgerStore, LedgerStore, PgConfig, PgLedgerStore, SearchParams,
    StoreError, TransactionFilter,
};

fn usd() -> CurrencyCode {
    CurrencyCode::parse("USD").unwrap()
}

fn cad() -> CurrencyCode {
    CurrencyCode::parse("CAD").unwrap()
}

fn account(name: &str, normal: Normal) -> Account {
    Account::new(AccountName::parse(name).unwrap(), normal)
}

async fn store_with_accounts() -> (InMemoryLedgerStore, Account, Account) {
    let store = InMemoryLedgerStore::new();
    store.create_currency(&usd()).await.unwrap();
    store.create_currency(&cad()).await.unwrap();

    let asset = store
        .upsert_account(&account("Asset", Normal::Dr))
        .await
        .unwrap();
    let income = store
        .upsert_account(&account("Income", Normal::Cr))
        .await
        .unwrap();
    (store, asset, income)
}

fn simple_tx(asset: &Account, income: &Account, magnitude: rust_decimal::Decimal) -> Transaction {
    Transaction::new(vec![
        Entry::new(asset.id, EntryAmount::dr(magnitude).unwrap(), usd()),
        Entry::new(income.id, EntryAmount::cr(magnitude).unwrap(), usd()),
    ])
}

#[tokio::test]
async fn round_trip_preserves_entries_and_order() {
    let (store, asset, income) = store_with_accounts().await;

    let candidate = simple_tx(&asset, &income, dec!(1000)).with_memo("first tx");
    assert!(validate(&candidate).is_empty());

    let posted = store.post_transaction(candidate).await.unwrap();
    assert!(posted.id.is_some());
    assert!(posted.posted.is_some());
    assert_eq!(posted.entries.len(), 2);
    for entry in &posted.entries {
        assert!(entry.id.is_some());
        assert_eq!(entry.transaction, posted.id);
    }
    assert_eq!(posted.entries[0].account, asset.id);
    assert_eq!(posted.entries[1].account, income.id);

    let found = store
        .find_transactions(
            &TransactionFilter::by_ids([posted.id.unwrap()]),
            &SearchParams::default(),
        )
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].entries, posted.entries);
}

#[tokio::test]
async fn optimistic_lock_accepts_the_current_version() {
    let (store, asset, income) = store_with_accounts().await;

    let first = store
        .post_transaction(simple_tx(&asset, &income, dec!(1000)))
        .await
        .unwrap();
    let asset_version = first.entries[0].id.unwrap();
    let income_version = first.entries[1].id.unwrap();

    // Second posting supplies the versions produced by the first.
    let second = Transaction::new(vec![
        Entry::new(asset.id, EntryAmount::dr(dec!(1500)).unwrap(), usd())
            .with_expected_version(asset_version),
        Entry::new(income.id, EntryAmount::cr(dec!(1500)).unwrap(), usd())
            .with_expected_version(income_version),
    ]);
    store.post_transaction(second).await.unwrap();
}

#[tokio::test]
async fn optimistic_lock_rejects_a_stale_version() {
    let (store, asset, income) = store_with_accounts().await;

    let first = store
        .post_transaction(simple_tx(&asset, &income, dec!(1000)))
        .await
        .unwrap();
    let current = first.entries[0].id.unwrap();

    // A version that was never the account's version.
    let stale = tally_core::EntryId::new();
    let conflicting = Transaction::new(vec![
        Entry::new(asset.id, EntryAmount::dr(dec!(10)).unwrap(), usd())
            .with_expected_version(stale),
        Entry::new(income.id, EntryAmount::cr(dec!(10)).unwrap(), usd()),
    ]);
    let err = store.post_transaction(conflicting).await.unwrap_err();
    match err {
        StoreError::OptimisticLockConflict {
            account,
            expected,
            found,
        } => {
            assert_eq!(account, asset.id);
            assert_eq!(expected, stale);
            assert_eq!(found, Some(current));
        }
        other => panic!("expected OptimisticLockConflict, got {other:?}"),
    }

    // The failed posting must have left no trace: the account version is
    // still the first entry's id.
    let accounts = store
        .find_accounts(&AccountFilter::by_ids([asset.id]), &SearchParams::default())
        .await
        .unwrap();
    assert_eq!(accounts[0].version, Some(current));
}

#[tokio::test]
async fn entries_in_one_transaction_chain_against_each_other() {
    let (store, asset, income) = store_with_accounts().await;

    // Two entries on the same account in one transaction; the second leaves
    // expected_version unset.
    let tx = Transaction::new(vec![
        Entry::new(asset.id, EntryAmount::dr(dec!(600)).unwrap(), usd()),
        Entry::new(asset.id, EntryAmount::dr(dec!(400)).unwrap(), usd()),
        Entry::new(income.id, EntryAmount::cr(dec!(1000)).unwrap(), usd()),
    ]);
    let posted = store.post_transaction(tx).await.unwrap();
    let second_entry_id = posted.entries[1].id.unwrap();

    let accounts = store
        .find_accounts(&AccountFilter::by_ids([asset.id]), &SearchParams::default())
        .await
        .unwrap();
    // The final version is the second entry's id, not the first's.
    assert_eq!(accounts[0].version, Some(second_entry_id));
}

#[tokio::test]
async fn chained_expected_versions_within_one_transaction() {
    let (store, asset, income) = store_with_accounts().await;

    let first = store
        .post_transaction(simple_tx(&asset, &income, dec!(100)))
        .await
        .unwrap();
    let asset_version = first.entries[0].id.unwrap();

    // The second entry's expected version is checked against the version the
    // first entry of this same transaction produced, which cannot be known in
    // advance. Supplying the pre-transaction version must therefore conflict.
    let tx = Transaction::new(vec![
        Entry::new(asset.id, EntryAmount::dr(dec!(10)).unwrap(), usd())
            .with_expected_version(asset_version),
        Entry::new(asset.id, EntryAmount::dr(dec!(5)).unwrap(), usd())
            .with_expected_version(asset_version),
        Entry::new(income.id, EntryAmount::cr(dec!(15)).unwrap(), usd()),
    ]);
    assert!(matches!(
        store.post_transaction(tx).await,
        Err(StoreError::OptimisticLockConflict { .. })
    ));
}

#[tokio::test]
async fn posting_to_an_unknown_account_leaves_nothing_behind() {
    let (store, _asset, income) = store_with_accounts().await;

    let ghost = AccountId::new();
    let tx = Transaction::new(vec![
        Entry::new(ghost, EntryAmount::dr(dec!(1000)).unwrap(), usd()),
        Entry::new(income.id, EntryAmount::cr(dec!(1000)).unwrap(), usd()),
    ])
    .with_memo("tx with unknown debit account");

    let err = store.post_transaction(tx).await.unwrap_err();
    assert!(matches!(err, StoreError::AccountNotFound(id) if id == ghost));

    // No orphan header: searching by the attempted memo finds nothing.
    let found = store
        .find_transactions(
            &TransactionFilter::by_memo("unknown debit"),
            &SearchParams::default(),
        )
        .await
        .unwrap();
    assert!(found.is_empty());
}

#[tokio::test]
async fn balances_render_positive_on_the_normal_side() {
    let (store, asset, income) = store_with_accounts().await;

    store
        .post_transaction(simple_tx(&asset, &income, dec!(1000)))
        .await
        .unwrap();
    store
        .post_transaction(simple_tx(&asset, &income, dec!(1500)))
        .await
        .unwrap();

    let balances = store
        .account_balances(
            &AccountFilter::default(),
            &SearchParams::default().order_by("name").unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(balances.len(), 2);

    let asset_balances = &balances[0];
    assert_eq!(asset_balances.account.id, asset.id);
    assert_eq!(asset_balances.balances[&usd()], dec!(2500));

    // Income is CR-normal: its net credit renders positive.
    let income_balances = &balances[1];
    assert_eq!(income_balances.account.id, income.id);
    assert_eq!(income_balances.balances[&usd()], dec!(2500));

    // Decimals serialize as strings.
    let json = serde_json::to_value(&balances[0].balances).unwrap();
    assert_eq!(json, serde_json::json!({"USD": "2500"}));
}

#[tokio::test]
async fn balances_omit_accounts_without_entries() {
    let (store, asset, income) = store_with_accounts().await;
    store
        .upsert_account(&account("Equity", Normal::Cr))
        .await
        .unwrap();

    store
        .post_transaction(simple_tx(&asset, &income, dec!(10)))
        .await
        .unwrap();

    let balances = store
        .account_balances(&AccountFilter::default(), &SearchParams::default())
        .await
        .unwrap();
    assert_eq!(balances.len(), 2);
    assert!(balances.iter().all(|b| b.account.name.as_str() != "Equity"));
}

#[tokio::test]
async fn multi_currency_transactions_aggregate_per_currency() {
    let (store, asset, income) = store_with_accounts().await;

    let tx = Transaction::new(vec![
        Entry::new(asset.id, EntryAmount::dr(dec!(100)).unwrap(), usd()),
        Entry::new(income.id, EntryAmount::cr(dec!(100)).unwrap(), usd()),
        Entry::new(asset.id, EntryAmount::dr(dec!(48)).unwrap(), cad()),
        Entry::new(income.id, EntryAmount::cr(dec!(48)).unwrap(), cad()),
    ]);
    assert!(validate(&tx).is_empty());
    store.post_transaction(tx).await.unwrap();

    let balances = store
        .account_balances(
            &AccountFilter::by_ids([asset.id]),
            &SearchParams::default(),
        )
        .await
        .unwrap();
    assert_eq!(balances[0].balances[&usd()], dec!(100));
    assert_eq!(balances[0].balances[&cad()], dec!(48));
}

#[tokio::test]
async fn transaction_search_orders_and_paginates() {
    let (store, asset, income) = store_with_accounts().await;

    // Explicit ids: ids generated in the same instant are not ordered.
    for (n, memo) in ["client1", "client2", "lunch", "dinner"].iter().enumerate() {
        let mut tx = simple_tx(&asset, &income, dec!(10)).with_memo(*memo);
        tx.id = Some(tally_core::TransactionId::from_uuid(
            uuid::Uuid::from_u128(n as u128 + 1),
        ));
        store.post_transaction(tx).await.unwrap();
    }

    let memos = |txs: &[Transaction]| -> Vec<String> {
        txs.iter().filter_map(|t| t.memo.clone()).collect()
    };

    let by_id = store
        .find_transactions(
            &TransactionFilter::default(),
            &SearchParams::default().order_by("id").unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(memos(&by_id), vec!["client1", "client2", "lunch", "dinner"]);

    let by_memo_desc = store
        .find_transactions(
            &TransactionFilter::default(),
            &SearchParams::default().order_by("-memo").unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(
        memos(&by_memo_desc),
        vec!["lunch", "dinner", "client2", "client1"]
    );

    let page = store
        .find_transactions(
            &TransactionFilter::default(),
            &SearchParams::default().order_by("id").unwrap().limit(1),
        )
        .await
        .unwrap();
    assert_eq!(memos(&page), vec!["client1"]);

    let rest = store
        .find_transactions(
            &TransactionFilter::default(),
            &SearchParams::default().order_by("id").unwrap().offset(1),
        )
        .await
        .unwrap();
    assert_eq!(memos(&rest), vec!["client2", "lunch", "dinner"]);
}

#[tokio::test]
async fn transaction_search_filters_on_entry_attributes() {
    let (store, asset, income) = store_with_accounts().await;

    store
        .post_transaction(simple_tx(&asset, &income, dec!(10)).with_memo("usd tx"))
        .await
        .unwrap();
    let cad_tx = Transaction::new(vec![
        Entry::new(asset.id, EntryAmount::dr(dec!(48)).unwrap(), cad()),
        Entry::new(income.id, EntryAmount::cr(dec!(48)).unwrap(), cad()),
    ])
    .with_memo("cad tx");
    store.post_transaction(cad_tx).await.unwrap();

    let cad_only = store
        .find_transactions(
            &TransactionFilter {
                currency: Some(cad()),
                ..TransactionFilter::default()
            },
            &SearchParams::default(),
        )
        .await
        .unwrap();
    assert_eq!(cad_only.len(), 1);
    assert_eq!(cad_only[0].memo.as_deref(), Some("cad tx"));
    // The currency filter selects the transaction; all entries come back.
    assert_eq!(cad_only[0].entries.len(), 2);
}

/// Postgres smoke test; runs only when DATABASE_URL points at a reachable
/// database, otherwise it is a no-op.
#[tokio::test]
async fn postgres_round_trip_when_database_is_available() {
    let Ok(config) = PgConfig::from_env() else {
        return;
    };
    let Ok(store) = PgLedgerStore::connect(&config).await else {
        return;
    };
    store.migrate().await.unwrap();
    // Currencies persist across runs; a duplicate registration is fine here.
    let _ = store.create_currency(&usd()).await;

    let asset = store
        .upsert_account(&account("Asset", Normal::Dr))
        .await
        .unwrap();
    let income = store
        .upsert_account(&account("Income", Normal::Cr))
        .await
        .unwrap();

    let posted = store
        .post_transaction(simple_tx(&asset, &income, dec!(1000)))
        .await
        .unwrap();
    assert_eq!(posted.entries.len(), 2);

    let found = store
        .find_transactions(
            &TransactionFilter::by_ids([posted.id.unwrap()]),
            &SearchParams::default(),
        )
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].entries, posted.entries);

    let balances = store
        .account_balances(&AccountFilter::by_ids([asset.id]), &SearchParams::default())
        .await
        .unwrap();
    assert_eq!(balances[0].balances[&usd()], dec!(1000));
}

/// Two concurrent postings guarding the same account with the same expected
/// version: exactly one commits, the other observes the advanced version and
/// conflicts. Runs only when DATABASE_URL points at a reachable database.
#[tokio::test]
async fn postgres_concurrent_guarded_postings_admit_exactly_one() {
    let Ok(config) = PgConfig::from_env() else {
        return;
    };
    let Ok(store) = PgLedgerStore::connect(&config).await else {
        return;
    };
    store.migrate().await.unwrap();
    let _ = store.create_currency(&usd()).await;

    let asset = store
        .upsert_account(&account("Asset", Normal::Dr))
        .await
        .unwrap();
    let income = store
        .upsert_account(&account("Income", Normal::Cr))
        .await
        .unwrap();

    let seeded = store
        .post_transaction(simple_tx(&asset, &income, dec!(100)))
        .await
        .unwrap();
    let version = seeded.entries[0].id.unwrap();

    let guarded = |magnitude| {
        Transaction::new(vec![
            Entry::new(asset.id, EntryAmount::dr(magnitude).unwrap(), usd())
                .with_expected_version(version),
            Entry::new(income.id, EntryAmount::cr(magnitude).unwrap(), usd()),
        ])
    };
    let (first, second) = tokio::join!(
        store.post_transaction(guarded(dec!(10))),
        store.post_transaction(guarded(dec!(20))),
    );

    let outcomes = [first, second];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    let conflict = outcomes.into_iter().find_map(Result::err).unwrap();
    assert!(matches!(
        conflict,
        StoreError::OptimisticLockConflict { account, .. } if account == asset.id
    ));
}
