//! The kernel firewall the daemon writes redirect rules into.
//!
//! The daemon never edits single rules. Each synchronization opens a transaction with
//! [`Firewall::begin`], adds one redirect per live mapping and replaces the whole ruleset
//! with [`Firewall::commit`], see [`crate::rules::rebuild_rules`].

use std::{fmt, future::Future, net::SocketAddrV4, pin::Pin};

use natpmpd_proto::nat_pmp::MapProtocol;
use nested_enum_utils::common_fields;
use snafu::{Backtrace, Snafu};

mod nft;

pub use self::nft::NftFirewall;

/// Redirect of traffic for an external endpoint to an internal one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Redirect {
    /// Protocol of the redirected traffic.
    pub proto: MapProtocol,
    /// Endpoint on the private network the traffic is sent to.
    pub internal: SocketAddrV4,
    /// Endpoint on the external address the traffic arrives at.
    pub external: SocketAddrV4,
}

impl fmt::Display for Redirect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.proto, self.external, self.internal)
    }
}

/// Errors reported by a [`Firewall`].
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum FirewallError {
    /// The ruleset is locked by someone else, retrying shortly may succeed.
    #[snafu(display("firewall is busy"))]
    Busy {},
    #[snafu(display("no transaction in progress"))]
    NoTransaction {},
    #[snafu(display("failed to run the firewall tool"))]
    Io { source: std::io::Error },
    #[snafu(display("firewall rejected the ruleset: {message}"))]
    Rejected { message: String },
}

/// A boxed future borrowing the firewall.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Transactional access to the redirect rules of the kernel firewall.
///
/// Talking to the kernel may take a while, so [`Firewall::init`] and [`Firewall::commit`]
/// are async. Building up a transaction is not.
pub trait Firewall: fmt::Debug + Send + 'static {
    /// Prepare the firewall for use, removing any rules left over when `reset` is set.
    fn init(&mut self, reset: bool) -> BoxFuture<'_, Result<(), FirewallError>>;

    /// Start a transaction replacing all redirect rules.
    fn begin(&mut self) -> Result<(), FirewallError>;

    /// Add a redirect to the open transaction.
    fn add_redirect(
        &mut self,
        proto: MapProtocol,
        internal: SocketAddrV4,
        external: SocketAddrV4,
    ) -> Result<(), FirewallError>;

    /// Atomically replace the active rules with those of the open transaction.
    ///
    /// On [`FirewallError::Busy`] the transaction stays open so the commit can be retried.
    fn commit(&mut self) -> BoxFuture<'_, Result<(), FirewallError>>;

    /// Abandon the open transaction, the active rules are left untouched.
    fn rollback(&mut self);
}

#[cfg(test)]
pub(crate) use self::memory::{CommitFailure, MemoryFirewall};

#[cfg(test)]
mod memory {
    use std::{
        collections::VecDeque,
        net::SocketAddrV4,
        sync::{Arc, Mutex},
    };

    use natpmpd_proto::nat_pmp::MapProtocol;

    use super::*;

    /// Scripted outcome of a commit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum CommitFailure {
        Busy,
        Rejected,
    }

    #[derive(Debug, Default)]
    struct State {
        initialized: bool,
        fail_begin: bool,
        pending: Option<Vec<Redirect>>,
        active: Vec<Redirect>,
        commits: usize,
        rollbacks: usize,
        failures: VecDeque<CommitFailure>,
    }

    /// A [`Firewall`] keeping its rules in memory.
    ///
    /// Clones share their state, so a test can inspect a firewall owned by the daemon.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct MemoryFirewall {
        state: Arc<Mutex<State>>,
    }

    impl MemoryFirewall {
        /// Make the next commits fail, in order.
        pub(crate) fn fail_commits(&self, failures: impl IntoIterator<Item = CommitFailure>) {
            self.state.lock().unwrap().failures.extend(failures);
        }

        /// Make the next [`Firewall::begin`] fail.
        pub(crate) fn fail_begin(&self) {
            self.state.lock().unwrap().fail_begin = true;
        }

        /// The currently active rules.
        pub(crate) fn active(&self) -> Vec<Redirect> {
            let mut active = self.state.lock().unwrap().active.clone();
            active.sort();
            active
        }

        pub(crate) fn commits(&self) -> usize {
            self.state.lock().unwrap().commits
        }

        pub(crate) fn rollbacks(&self) -> usize {
            self.state.lock().unwrap().rollbacks
        }

        pub(crate) fn is_initialized(&self) -> bool {
            self.state.lock().unwrap().initialized
        }

        pub(crate) fn in_transaction(&self) -> bool {
            self.state.lock().unwrap().pending.is_some()
        }
    }

    impl MemoryFirewall {
        fn commit_now(&self) -> Result<(), FirewallError> {
            let mut state = self.state.lock().unwrap();
            if state.pending.is_none() {
                return Err(NoTransactionSnafu.build());
            }
            match state.failures.pop_front() {
                Some(CommitFailure::Busy) => return Err(BusySnafu.build()),
                Some(CommitFailure::Rejected) => {
                    return Err(RejectedSnafu {
                        message: "scripted failure",
                    }
                    .build());
                }
                None => {}
            }
            state.active = state.pending.take().unwrap_or_default();
            state.commits += 1;
            Ok(())
        }
    }

    impl Firewall for MemoryFirewall {
        fn init(&mut self, reset: bool) -> BoxFuture<'_, Result<(), FirewallError>> {
            let mut state = self.state.lock().unwrap();
            state.initialized = true;
            if reset {
                state.active.clear();
            }
            Box::pin(async { Ok(()) })
        }

        fn begin(&mut self) -> Result<(), FirewallError> {
            let mut state = self.state.lock().unwrap();
            if std::mem::take(&mut state.fail_begin) {
                return Err(RejectedSnafu {
                    message: "scripted begin failure",
                }
                .build());
            }
            state.pending = Some(Vec::new());
            Ok(())
        }

        fn add_redirect(
            &mut self,
            proto: MapProtocol,
            internal: SocketAddrV4,
            external: SocketAddrV4,
        ) -> Result<(), FirewallError> {
            let mut state = self.state.lock().unwrap();
            let Some(pending) = state.pending.as_mut() else {
                return Err(NoTransactionSnafu.build());
            };
            pending.push(Redirect {
                proto,
                internal,
                external,
            });
            Ok(())
        }

        fn commit(&mut self) -> BoxFuture<'_, Result<(), FirewallError>> {
            let res = self.commit_now();
            Box::pin(async move { res })
        }

        fn rollback(&mut self) {
            let mut state = self.state.lock().unwrap();
            state.pending = None;
            state.rollbacks += 1;
        }
    }
}
