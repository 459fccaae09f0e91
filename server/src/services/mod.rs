//! Engine services: the sync loop, the action dispatchers and the
//! supporting seams (transition tables, wallet locking, signing, core API).

pub mod api;
pub mod dispatchers;
pub mod observe;
pub mod signer;
pub mod sync;
pub mod transitions;
pub mod wallet_locker;

pub use api::CoreApi;
pub use dispatchers::DispatcherContext;
pub use signer::{Ed25519Signer, WalletSigner};
pub use sync::SyncService;
