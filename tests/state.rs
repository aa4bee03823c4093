use qstate::common::{Addr, Bytes, U256};
use qstate::error::ErrorKind;
use qstate::state::{
    CommitBehaviour, OrderKind, State, StateConfig, BALLOT_PRICE,
};

fn addr(n: u64) -> Addr {
    Addr::from(U256::from(n))
}

fn fresh() -> State {
    State::in_memory(StateConfig::with_start_nonce(U256::zero()))
}

/// Create an account carrying `ballot` spendable votes.
fn voter(state: &mut State, a: &Addr, ballot: u64) {
    state.add_balance(a, &U256::zero()).unwrap();
    if ballot > 0 {
        state.add_ballot(a, &ballot.into()).unwrap();
    }
}

#[test]
fn test_rollback_restores_balance_and_nonce() {
    let mut s = fresh();
    s.add_balance(&addr(1), &1000.into()).unwrap();
    s.commit(CommitBehaviour::KeepEmptyAccounts);

    let sp = s.savepoint();
    s.add_balance(&addr(1), &500.into()).unwrap();
    s.set_nonce(&addr(1), &7.into()).unwrap();
    assert_eq!(s.balance(&addr(1)), U256::from(1500));
    assert_eq!(s.nonce(&addr(1)), U256::from(7));
    s.rollback(sp);
    assert_eq!(s.balance(&addr(1)), U256::from(1000));
    assert_eq!(s.nonce(&addr(1)), U256::zero());
}

#[test]
fn test_subtract_below_zero_fails_fast() {
    let mut s = fresh();
    s.add_balance(&addr(1), &10.into()).unwrap();
    let e = s.sub_balance(&addr(1), &11.into()).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::InsufficientFunds);
    assert_eq!(s.balance(&addr(1)), U256::from(10));

    s.add_brc(&addr(1), &5.into()).unwrap();
    assert_eq!(
        s.sub_brc(&addr(1), &6.into()).unwrap_err().kind(),
        ErrorKind::InsufficientFunds
    );
    assert_eq!(s.brc(&addr(1)), U256::from(5));

    // zero-amount subtractions are no-ops even on missing accounts
    s.sub_balance(&addr(99), &U256::zero()).unwrap();
    assert!(!s.account_in_use(&addr(99)));
}

#[test]
fn test_set_balance_routes_through_journal() {
    let mut s = fresh();
    s.add_balance(&addr(1), &100.into()).unwrap();
    let sp = s.savepoint();
    s.set_balance(&addr(1), &40.into()).unwrap();
    assert_eq!(s.balance(&addr(1)), U256::from(40));
    s.set_balance(&addr(1), &70.into()).unwrap();
    assert_eq!(s.balance(&addr(1)), U256::from(70));
    s.rollback(sp);
    assert_eq!(s.balance(&addr(1)), U256::from(100));
}

#[test]
fn test_vote_round_trip() {
    let mut s = fresh();
    let v = addr(1);
    let r = addr(2);
    voter(&mut s, &v, 100);
    voter(&mut s, &r, 0);

    s.add_vote(&v, &r, &40.into()).unwrap();
    assert_eq!(s.ballot(&v), U256::from(60));
    assert_eq!(s.poll(&r), U256::from(40));
    assert_eq!(s.vote_for(&v, &r), U256::from(40));
    assert_eq!(s.vote_all(&v), U256::from(40));

    s.sub_vote(&v, &r, &40.into()).unwrap();
    assert_eq!(s.ballot(&v), U256::from(100));
    assert_eq!(s.poll(&r), U256::zero());
    assert_eq!(s.vote_for(&v, &r), U256::zero());
    assert_eq!(s.vote_all(&v), U256::zero());
}

#[test]
fn test_vote_preconditions() {
    let mut s = fresh();
    let v = addr(1);
    let r = addr(2);
    voter(&mut s, &v, 10);

    // receiver does not exist
    assert_eq!(
        s.add_vote(&v, &r, &5.into()).unwrap_err().kind(),
        ErrorKind::InvalidAddress
    );
    voter(&mut s, &r, 0);

    assert_eq!(
        s.add_vote(&v, &r, &11.into()).unwrap_err().kind(),
        ErrorKind::InsufficientBallot
    );
    s.add_vote(&v, &r, &10.into()).unwrap();
    assert_eq!(
        s.sub_vote(&v, &r, &11.into()).unwrap_err().kind(),
        ErrorKind::InsufficientVoteLog
    );
}

#[test]
fn test_sub_vote_clamps_poll_only() {
    let mut s = fresh();
    let v = addr(1);
    let r = addr(2);
    voter(&mut s, &v, 100);
    voter(&mut s, &r, 0);
    s.add_vote(&v, &r, &40.into()).unwrap();

    // the receiver's poll shrinks out-of-band
    s.sub_poll(&r, &30.into()).unwrap();
    assert_eq!(s.poll(&r), U256::from(10));

    // the ledger and ballots move by the full 40; the poll decrement is
    // clamped to the 10 that are left
    s.sub_vote(&v, &r, &40.into()).unwrap();
    assert_eq!(s.vote_for(&v, &r), U256::zero());
    assert_eq!(s.ballot(&v), U256::from(100));
    assert_eq!(s.poll(&r), U256::zero());
}

#[test]
fn test_vote_rollback() {
    let mut s = fresh();
    let v = addr(1);
    let r = addr(2);
    voter(&mut s, &v, 100);
    voter(&mut s, &r, 0);

    let sp = s.savepoint();
    s.add_vote(&v, &r, &25.into()).unwrap();
    s.sub_vote(&v, &r, &10.into()).unwrap();
    s.rollback(sp);
    assert_eq!(s.ballot(&v), U256::from(100));
    assert_eq!(s.poll(&r), U256::zero());
    assert_eq!(s.vote_for(&v, &r), U256::zero());
}

#[test]
fn test_sys_vote_roster() {
    let mut s = fresh();
    let sys = addr(100);
    let m = addr(1);

    // member must exist before enrollment
    assert_eq!(
        s.add_sys_vote_data(&sys, &m).unwrap_err().kind(),
        ErrorKind::InvalidAddress
    );
    voter(&mut s, &m, 0);

    // the system account auto-creates on first enrollment
    let sp = s.savepoint();
    s.add_sys_vote_data(&sys, &m).unwrap();
    assert!(s.account_in_use(&sys));
    s.rollback(sp);
    assert!(!s.account_in_use(&sys));

    s.add_sys_vote_data(&sys, &m).unwrap();
    s.sub_sys_vote_data(&sys, &m).unwrap();

    // removal from a missing system account is its own failure class
    assert_eq!(
        s.sub_sys_vote_data(&addr(101), &m).unwrap_err().kind(),
        ErrorKind::InvalidSystemAddress
    );
}

#[test]
fn test_ballot_transfer() {
    let mut s = fresh();
    let buyer = addr(1);
    let seller = addr(2);
    let price: U256 = BALLOT_PRICE.into();
    s.add_brc(&buyer, &(price * U256::from(5))).unwrap();
    s.add_balance(&seller, &U256::zero()).unwrap();

    s.transfer_ballot_buy(&buyer, &seller, &3.into()).unwrap();
    assert_eq!(s.brc(&buyer), price * U256::from(2));
    assert_eq!(s.brc(&seller), price * U256::from(3));
    assert_eq!(s.ballot(&buyer), U256::from(3));

    s.transfer_ballot_sell(&buyer, &seller, &2.into()).unwrap();
    assert_eq!(s.ballot(&buyer), U256::from(1));
    assert_eq!(s.brc(&buyer), price * U256::from(4));
    assert_eq!(s.brc(&seller), price * U256::from(1));

    assert_eq!(
        s.transfer_ballot_sell(&buyer, &seller, &2.into())
            .unwrap_err()
            .kind(),
        ErrorKind::InsufficientBallot
    );
}

#[test]
fn test_orders_freeze_and_cancel() {
    // each kind separately: placement moves the normal pool into the
    // frozen one, cancellation reverses it exactly
    let cases = [
        (OrderKind::BuyBrc, 2u64, 10u64),
        (OrderKind::SellBrc, 7, 1),
        (OrderKind::BuyFuel, 3, 4),
        (OrderKind::SellFuel, 20, 1),
    ];
    for (kind, qty, price) in cases {
        let mut s = fresh();
        let a = addr(1);
        s.add_balance(&a, &100.into()).unwrap();
        s.add_brc(&a, &100.into()).unwrap();

        s.place_order(&a, kind, &qty.into(), &price.into()).unwrap();
        let frozen = U256::from(match kind {
            OrderKind::BuyBrc | OrderKind::BuyFuel => qty * price,
            OrderKind::SellBrc | OrderKind::SellFuel => qty,
        });
        match kind {
            OrderKind::BuyBrc | OrderKind::SellFuel => {
                assert_eq!(s.balance(&a), U256::from(100) - frozen);
                assert_eq!(s.fbalance(&a), frozen);
                assert_eq!(s.brc(&a), U256::from(100));
            }
            OrderKind::SellBrc | OrderKind::BuyFuel => {
                assert_eq!(s.brc(&a), U256::from(100) - frozen);
                assert_eq!(s.fbrc(&a), frozen);
                assert_eq!(s.balance(&a), U256::from(100));
            }
        }

        s.cancel_order(&a, kind, &qty.into(), &price.into()).unwrap();
        assert_eq!(s.balance(&a), U256::from(100));
        assert_eq!(s.brc(&a), U256::from(100));
        assert_eq!(s.fbalance(&a), U256::zero());
        assert_eq!(s.fbrc(&a), U256::zero());
    }
}

#[test]
fn test_frozen_add_requires_existing_account() {
    let mut s = fresh();
    // silently skipped: no account, no journal entry, no error
    s.add_fbrc(&addr(5), &10.into());
    s.add_fbalance(&addr(5), &10.into());
    assert!(!s.account_in_use(&addr(5)));
    assert_eq!(s.fbrc(&addr(5)), U256::zero());

    // with the account present the frozen pools move normally
    s.add_balance(&addr(5), &U256::zero()).unwrap();
    let sp = s.savepoint();
    s.add_fbrc(&addr(5), &10.into());
    s.add_fbalance(&addr(5), &4.into());
    assert_eq!(s.fbrc(&addr(5)), U256::from(10));
    assert_eq!(s.fbalance(&addr(5)), U256::from(4));
    s.sub_fbrc(&addr(5), &3.into()).unwrap();
    assert_eq!(s.fbrc(&addr(5)), U256::from(7));
    s.rollback(sp);
    assert_eq!(s.fbrc(&addr(5)), U256::zero());
    assert_eq!(s.fbalance(&addr(5)), U256::zero());
}

#[test]
fn test_contract_lifecycle_rollback() {
    let mut s = fresh();
    let c = addr(10);
    s.create_contract(&c).unwrap();
    s.set_code(&c, Bytes::from(b"\x60\x60\x00".as_slice())).unwrap();
    s.set_storage(&c, 1.into(), 11.into()).unwrap();
    s.set_storage(&c, 2.into(), 22.into()).unwrap();
    s.commit(CommitBehaviour::KeepEmptyAccounts);

    let code_hash = s.code_hash(&c);
    let sp = s.savepoint();
    s.set_code(&c, Bytes::from(b"\xfe".as_slice())).unwrap();
    s.set_storage(&c, 1.into(), 33.into()).unwrap();
    s.set_storage(&c, 3.into(), 44.into()).unwrap();
    assert_eq!(s.storage(&c, &1.into()), U256::from(33));
    assert_eq!(s.original_storage(&c, &1.into()), U256::from(11));
    s.clear_storage(&c);
    assert_eq!(s.storage(&c, &2.into()), U256::zero());

    s.rollback(sp);
    assert_eq!(s.code_hash(&c), code_hash);
    assert_eq!(s.code(&c), Bytes::from(b"\x60\x60\x00".as_slice()));
    assert_eq!(s.storage(&c, &1.into()), U256::from(11));
    assert_eq!(s.storage(&c, &2.into()), U256::from(22));
    assert_eq!(s.storage(&c, &3.into()), U256::zero());
    assert!(s.address_has_code(&c));
}

#[test]
fn test_rollback_is_exact_over_mixed_mutations() {
    let mut s = fresh();
    let a = addr(1);
    let b = addr(2);
    voter(&mut s, &a, 50);
    voter(&mut s, &b, 0);
    s.add_balance(&a, &1000.into()).unwrap();
    s.add_brc(&a, &500.into()).unwrap();
    s.commit(CommitBehaviour::KeepEmptyAccounts);

    let observe = |s: &State| {
        (
            s.balance(&a),
            s.brc(&a),
            s.fbrc(&a),
            s.fbalance(&a),
            s.ballot(&a),
            s.poll(&b),
            s.nonce(&a),
            s.vote_for(&a, &b),
            s.code_hash(&a),
            s.storage(&a, &9.into()),
        )
    };
    let before = observe(&s);

    let sp = s.savepoint();
    s.inc_nonce(&a).unwrap();
    s.add_vote(&a, &b, &20.into()).unwrap();
    s.place_order(&a, OrderKind::BuyBrc, &3.into(), &10.into()).unwrap();
    s.place_order(&a, OrderKind::SellBrc, &40.into(), &1.into()).unwrap();
    s.set_storage(&a, 9.into(), 99.into()).unwrap();
    s.sub_vote(&a, &b, &5.into()).unwrap();
    s.transfer_ballot_sell(&a, &b, &2.into()).unwrap_err();
    s.kill(&addr(3));
    s.rollback(sp);

    assert_eq!(observe(&s), before);
}

#[test]
fn test_kill_account() {
    let mut s = fresh();
    s.add_balance(&addr(1), &100.into()).unwrap();
    s.commit(CommitBehaviour::KeepEmptyAccounts);

    s.kill(&addr(1));
    assert_eq!(s.balance(&addr(1)), U256::zero());
    s.commit(CommitBehaviour::KeepEmptyAccounts);
    assert!(!s.account_in_use(&addr(1)));

    // killing what was never there changes nothing
    s.kill(&addr(2));
    assert!(!s.account_in_use(&addr(2)));
}

#[test]
fn test_account_json() {
    let mut s = fresh();
    let a = addr(1);
    let b = addr(2);
    voter(&mut s, &a, 30);
    voter(&mut s, &b, 0);
    s.add_balance(&a, &0x1234.into()).unwrap();
    s.add_vote(&a, &b, &12.into()).unwrap();

    let j = s.account_json(&a).unwrap();
    assert_eq!(j["balance"], "0x1234");
    assert_eq!(j["ballot"], "0x12");
    assert_eq!(j["vote"][0]["votes"], "0xc");
    assert!(s.account_json(&addr(50)).is_none());
}

#[test]
fn test_nonempty_accounting() {
    let mut s = fresh();
    s.add_balance(&addr(1), &U256::zero()).unwrap();
    assert!(s.account_in_use(&addr(1)));
    assert!(!s.account_exists_nonempty(&addr(1)));
    s.add_balance(&addr(1), &1.into()).unwrap();
    assert!(s.account_exists_nonempty(&addr(1)));
    assert!(!s.account_exists_nonempty(&addr(2)));
}
