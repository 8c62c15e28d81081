//! Concurrent bank transfers over transactional variables.

use std::sync::Arc;
use std::thread;

use petek::{atomic, atomic_read, thread_init, TrVar};

const ACCOUNTS: usize = 8;
const THREADS: usize = 4;
const TRANSFERS: usize = 10_000;
const INITIAL_BALANCE: u64 = 1_000;

fn main() {
    let accounts: Arc<Vec<TrVar<u64>>> =
        Arc::new((0..ACCOUNTS).map(|_| TrVar::new(INITIAL_BALANCE)).collect());

    let mut handles = vec![];
    for t in 0..THREADS {
        let accounts = accounts.clone();
        handles.push(thread::spawn(move || {
            thread_init();

            for i in 0..TRANSFERS {
                let from = (t + i) % ACCOUNTS;
                let to = (t + i + 1) % ACCOUNTS;

                atomic(|| {
                    let balance = accounts[from].get()?;
                    if balance >= 1 {
                        let target = accounts[to].get()?;
                        accounts[from].set(balance - 1)?;
                        accounts[to].set(target + 1)?;
                    }
                    Ok(())
                })
                .unwrap();
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }

    thread_init();
    let balances: Vec<u64> = atomic_read(|| {
        accounts.iter().map(|account| account.get()).collect()
    })
    .unwrap();

    let total: u64 = balances.iter().sum();
    println!("balances: {:?}", balances);
    println!("total:    {} (expected {})", total, ACCOUNTS as u64 * INITIAL_BALANCE);
    assert_eq!(total, ACCOUNTS as u64 * INITIAL_BALANCE);
}
