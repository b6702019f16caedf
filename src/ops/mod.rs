//! store operations: snapshot, materialize, transfer

mod checkout;
mod commit;
mod pull;

pub use checkout::{checkout, CheckoutOptions};
pub use commit::{commit, CommitOptions};
pub use pull::{pull_commit, PullStats};
