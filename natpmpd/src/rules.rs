//! Synchronization of the firewall with the mapping set.

use nested_enum_utils::common_fields;
use snafu::{Backtrace, ResultExt, Snafu};
use tracing::{debug, warn};

use crate::{
    defaults::timeouts::COMMIT_RETRY_DELAY,
    firewall::{Firewall, FirewallError, Redirect},
};

/// Failure to bring the firewall in line with the mappings.
///
/// The open transaction has been rolled back, the previously active rules are still in
/// place.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum SyncError {
    #[snafu(display("failed to start transaction"))]
    Begin { source: FirewallError },
    #[snafu(display("failed to add redirect {redirect}"))]
    AddRedirect {
        source: FirewallError,
        redirect: Redirect,
    },
    #[snafu(display("failed to commit ruleset"))]
    Commit { source: FirewallError },
}

/// Replace all redirect rules of the firewall with `redirects`.
///
/// A commit failing with [`FirewallError::Busy`] is retried once after a short pause, any
/// other failure rolls back the transaction.
pub async fn rebuild_rules(
    firewall: &mut dyn Firewall,
    redirects: &[Redirect],
) -> Result<(), SyncError> {
    if let Err(err) = firewall.begin() {
        firewall.rollback();
        return Err(err).context(BeginSnafu);
    }
    for redirect in redirects {
        let res = firewall.add_redirect(redirect.proto, redirect.internal, redirect.external);
        if let Err(err) = res {
            firewall.rollback();
            return Err(err).context(AddRedirectSnafu {
                redirect: *redirect,
            });
        }
    }

    let res = match firewall.commit().await {
        Err(FirewallError::Busy { .. }) => {
            debug!("firewall busy, retrying commit");
            tokio::time::sleep(COMMIT_RETRY_DELAY).await;
            firewall.commit().await
        }
        res => res,
    };
    if let Err(err) = res {
        warn!("rolling back ruleset: {err}");
        firewall.rollback();
        return Err(err).context(CommitSnafu);
    }
    debug!(count = redirects.len(), "ruleset rebuilt");
    Ok(())
}
