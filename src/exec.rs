//! Boundary between the state view and an execution runtime. The runtime
//! itself (a VM, a native transition function, a test harness) lives
//! outside this crate and is plugged in through [Vm]; this module owns the
//! savepoint/rollback discipline around one transaction and the shape of
//! the resulting receipt.

use log::trace;

use crate::common::{Addr, Bytes, Gas, Hash, U256};
use crate::state::{CommitBehaviour, State};

/// What happens to the view's uncommitted data once a transaction has
/// run to completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Permanence {
    /// Drop everything, as if the transaction never ran (dry-run calls).
    Reverted,
    /// Keep the mutations in the cache; the caller commits later.
    Uncommitted,
    /// Commit immediately.
    Committed,
}

/// External facts a runtime needs about the enclosing block.
#[derive(Clone, Debug, Default)]
pub struct EnvInfo {
    pub number: U256,
    pub author: Addr,
    pub timestamp: u64,
    pub gas_limit: Gas,
    /// Gas already burned by earlier transactions in the block.
    pub gas_used: Gas,
}

/// Named fork heights consulted by the adapter. These arrive from the
/// seal/chain configuration; nothing in this crate hardcodes them.
#[derive(Clone, Debug, Default)]
pub struct SealConfig {
    /// From this block on, commit garbage-collects empty accounts.
    pub empty_removal_fork: U256,
    /// From this block on, receipts carry a status bit instead of the
    /// post-state root.
    pub status_receipt_fork: U256,
}

#[derive(Clone, Debug)]
pub struct LogEntry {
    pub address: Addr,
    pub topics: Vec<Hash>,
    pub data: Bytes,
}

/// What the runtime reports back for a normally terminated transaction.
#[derive(Clone, Debug)]
pub struct Executed {
    pub status: bool,
    pub gas_used: Gas,
    pub logs: Vec<LogEntry>,
    pub output: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReceiptOutcome {
    /// Pre-status-fork: the root fingerprinting the state after this
    /// transaction.
    StateRoot(Hash),
    /// Post-fork: did the transaction succeed.
    Status(bool),
}

#[derive(Clone, Debug)]
pub struct Receipt {
    pub outcome: ReceiptOutcome,
    pub cumulative_gas_used: Gas,
    pub logs: Vec<LogEntry>,
}

/// One transaction worth of execution against a [State]. Implementations
/// read and mutate accounts through the view they are handed; they never
/// commit or roll back themselves; that is the adapter's job.
pub trait Vm {
    type Tx;
    type Error;

    fn run(
        &mut self, state: &mut State, env: &EnvInfo, tx: &Self::Tx,
    ) -> Result<Executed, Self::Error>;
}

impl State {
    /// Run one transaction and settle its effects according to
    /// `permanence`. A runtime error unwinds every mutation the
    /// transaction made and is handed back to the caller; the view stays
    /// usable for the next transaction either way.
    pub fn execute<V: Vm>(
        &mut self, env: &EnvInfo, seal: &SealConfig, vm: &mut V,
        tx: &V::Tx, permanence: Permanence,
    ) -> Result<(Executed, Receipt), V::Error> {
        let savept = self.savepoint();
        let executed = match vm.run(self, env, tx) {
            Ok(x) => x,
            Err(e) => {
                trace!(target: "state", "execution failed, unwinding");
                self.rollback(savept);
                return Err(e)
            }
        };
        match permanence {
            Permanence::Reverted => self.clear_cache(),
            Permanence::Uncommitted => (),
            Permanence::Committed => {
                let behaviour = if env.number >= seal.empty_removal_fork {
                    CommitBehaviour::RemoveEmptyAccounts
                } else {
                    CommitBehaviour::KeepEmptyAccounts
                };
                self.commit(behaviour);
            }
        }
        let receipt = Receipt {
            outcome: if env.number >= seal.status_receipt_fork {
                ReceiptOutcome::Status(executed.status)
            } else {
                ReceiptOutcome::StateRoot(self.root_hash())
            },
            cumulative_gas_used: env.gas_used + executed.gas_used,
            logs: executed.logs.clone(),
        };
        Ok((executed, receipt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateConfig;

    /// Minimal runtime: moves `amount` from `from` to `to`, or aborts.
    struct Transfer;

    struct TransferTx {
        from: Addr,
        to: Addr,
        amount: U256,
        abort: bool,
    }

    impl Vm for Transfer {
        type Tx = TransferTx;
        type Error = crate::error::Error;

        fn run(
            &mut self, state: &mut State, _env: &EnvInfo, tx: &Self::Tx,
        ) -> Result<Executed, Self::Error> {
            state.inc_nonce(&tx.from)?;
            state.sub_balance(&tx.from, &tx.amount)?;
            state.add_balance(&tx.to, &tx.amount)?;
            if tx.abort {
                return Err(crate::error::Error::new(
                    crate::error::ErrorKind::InvalidAddress,
                    "Transfer::run",
                ))
            }
            Ok(Executed {
                status: true,
                gas_used: 21000,
                logs: Vec::new(),
                output: Bytes::empty(),
            })
        }
    }

    fn addr(n: u64) -> Addr {
        Addr::from(U256::from(n))
    }

    fn funded_state() -> State {
        let mut s =
            State::in_memory(StateConfig::with_start_nonce(U256::zero()));
        s.add_balance(&addr(1), &1000.into()).unwrap();
        s.commit(CommitBehaviour::KeepEmptyAccounts);
        s
    }

    #[test]
    fn test_execute_commits() {
        let mut s = funded_state();
        let env = EnvInfo {
            number: 10.into(),
            gas_used: 5000,
            ..Default::default()
        };
        let seal = SealConfig::default();
        let tx = TransferTx {
            from: addr(1),
            to: addr(2),
            amount: 300.into(),
            abort: false,
        };
        let (executed, receipt) = s
            .execute(&env, &seal, &mut Transfer, &tx, Permanence::Committed)
            .unwrap();
        assert!(executed.status);
        assert_eq!(receipt.cumulative_gas_used, 26000);
        assert_eq!(receipt.outcome, ReceiptOutcome::Status(true));
        assert_eq!(s.balance(&addr(1)), U256::from(700));
        assert_eq!(s.balance(&addr(2)), U256::from(300));
        assert_eq!(s.nonce(&addr(1)), U256::from(1));
    }

    #[test]
    fn test_execute_rolls_back_on_vm_error() {
        let mut s = funded_state();
        let env = EnvInfo::default();
        let seal = SealConfig::default();
        let tx = TransferTx {
            from: addr(1),
            to: addr(2),
            amount: 300.into(),
            abort: true,
        };
        let before = s.root_hash();
        s.execute(&env, &seal, &mut Transfer, &tx, Permanence::Committed)
            .unwrap_err();
        assert_eq!(s.balance(&addr(1)), U256::from(1000));
        assert_eq!(s.balance(&addr(2)), U256::zero());
        assert_eq!(s.nonce(&addr(1)), U256::zero());
        assert_eq!(s.commit(CommitBehaviour::KeepEmptyAccounts), before);
    }

    #[test]
    fn test_pre_fork_receipt_carries_root() {
        let mut s = funded_state();
        let env = EnvInfo {
            number: 3.into(),
            ..Default::default()
        };
        let seal = SealConfig {
            empty_removal_fork: 100.into(),
            status_receipt_fork: 100.into(),
        };
        let tx = TransferTx {
            from: addr(1),
            to: addr(2),
            amount: 1.into(),
            abort: false,
        };
        let (_, receipt) = s
            .execute(&env, &seal, &mut Transfer, &tx, Permanence::Committed)
            .unwrap();
        assert_eq!(receipt.outcome, ReceiptOutcome::StateRoot(s.root_hash()));
    }

    #[test]
    fn test_reverted_permanence_discards() {
        let mut s = funded_state();
        let env = EnvInfo::default();
        let seal = SealConfig::default();
        let tx = TransferTx {
            from: addr(1),
            to: addr(2),
            amount: 250.into(),
            abort: false,
        };
        s.execute(&env, &seal, &mut Transfer, &tx, Permanence::Reverted)
            .unwrap();
        // everything uncommitted was dropped with the cache
        assert_eq!(s.balance(&addr(1)), U256::from(1000));
        assert_eq!(s.balance(&addr(2)), U256::zero());
    }
}
