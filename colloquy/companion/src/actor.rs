//! Shared plumbing for the [Tokio actor] pattern used by the diff registry
//! and the editor bridge: each actor owns its state, is driven by a channel,
//! and is reached through a cloneable handle.
//!
//! [Tokio actor]: https://ryhl.io/blog/actors-with-tokio/

use std::future::Future;

pub trait Actor: Sized + Send + 'static {
    /// Drive the actor until its channels close.
    fn run(self) -> impl Future<Output = ()> + Send;

    /// Spawn the actor onto the current runtime.
    fn spawn(self) {
        tokio::spawn(self.run());
    }
}
