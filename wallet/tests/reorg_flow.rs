//! End-to-end: fund, spend, reorg the spend away, converge again.

use std::sync::Arc;

use umb_account_keys::AccountKeys;
use umb_transaction_core::{Currency, TransactionBuilder};
use umbra_wallet::test_utils::MockNode;
use umbra_wallet::{TransferDestination, TransferParams, Wallet, WalletTransactionState};

fn test_currency() -> Currency {
    Currency {
        minimum_fee: 1,
        default_dust_threshold: 1,
        ..Currency::default()
    }
}

fn pay_to(address: &str, amounts: &[u64]) -> umb_transaction_core::Transaction {
    let address = umb_account_keys::Address::from_string(address).unwrap();
    let mut builder = TransactionBuilder::new(&mut rand_core::OsRng);
    builder.add_base_input(0);
    for &amount in amounts {
        builder.add_key_output(amount, &address);
    }
    builder.build().unwrap()
}

#[tokio::test]
async fn reorg_restores_spent_outputs_and_replay_converges() {
    let node = Arc::new(MockNode::new());
    let wallet = Wallet::new(test_currency(), node.clone(), 0);
    wallet.initialize("pw").unwrap();
    let address = wallet.create_address().unwrap();

    // Block 0 funds the wallet with 10.
    node.add_block(vec![pay_to(&address, &[10])]);
    wallet.synchronize().await;
    assert_eq!(wallet.actual_balance().unwrap(), 10);

    // Spend 6 (+1 fee); the spend is mined into block 1.
    let destination = AccountKeys::random(&mut rand_core::OsRng)
        .address()
        .to_string();
    let id = wallet
        .transfer(TransferParams {
            source_address: None,
            destinations: vec![TransferDestination {
                address: destination,
                amount: 6,
            }],
            fee: 1,
            mixin: 0,
            extra: Vec::new(),
            unlock_time: 0,
        })
        .await
        .unwrap();
    let spend = node.relayed_transactions()[0].clone();
    node.add_block(vec![spend.clone()]);
    wallet.synchronize().await;
    assert_eq!(wallet.actual_balance().unwrap(), 3);
    assert_eq!(wallet.get_transaction(id).unwrap().block_height, 1);

    // The chain reorganizes below block 1: the spend is detached and the
    // original output becomes spendable again.
    wallet.on_chain_switched(1);
    assert_eq!(wallet.actual_balance().unwrap(), 10);
    assert_eq!(
        wallet.get_transaction(id).unwrap().state,
        WalletTransactionState::Cancelled
    );

    // Replaying the same block converges back to the post-spend state.
    wallet.synchronize().await;
    assert_eq!(wallet.actual_balance().unwrap(), 3);
    let record = wallet.get_transaction(id).unwrap();
    assert_eq!(record.state, WalletTransactionState::Succeeded);
    assert_eq!(record.block_height, 1);
}
