//! Redirect rules in an nftables chain, applied with `nft -f -`.
//!
//! The daemon owns one nat chain. A commit flushes it and re-adds every redirect in a single
//! batch, which nftables applies atomically.

use std::{net::SocketAddrV4, path::Path, process::Stdio};

use natpmpd_proto::nat_pmp::MapProtocol;
use snafu::ResultExt;
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::{debug, trace};

use super::{
    BoxFuture, BusySnafu, Firewall, FirewallError, IoSnafu, NoTransactionSnafu, Redirect,
    RejectedSnafu,
};
use crate::config::FirewallConfig;

/// Marker nft prints when the ruleset is locked by a concurrent writer.
const BUSY_MESSAGE: &str = "Device or resource busy";

/// A [`Firewall`] driving the `nft` command line tool.
#[derive(Debug)]
pub struct NftFirewall {
    config: FirewallConfig,
    pending: Option<Vec<Redirect>>,
}

impl NftFirewall {
    /// Create a firewall writing into the configured table and chain.
    pub fn new(config: FirewallConfig) -> Self {
        Self {
            config,
            pending: None,
        }
    }

    fn chain_path(&self) -> String {
        format!(
            "{} {} {}",
            self.config.family, self.config.table, self.config.chain
        )
    }

    fn render_init(&self, reset: bool) -> String {
        let chain = self.chain_path();
        let mut script = format!("add table {} {}\n", self.config.family, self.config.table);
        script.push_str(&format!(
            "add chain {chain} {{ type nat hook prerouting priority -100; policy accept; }}\n"
        ));
        if reset {
            script.push_str(&format!("flush chain {chain}\n"));
        }
        script
    }

    fn render_commit(&self, redirects: &[Redirect]) -> String {
        let chain = self.chain_path();
        // the inet family needs to be told which address family the target is
        let dnat = match self.config.family.as_str() {
            "inet" => "dnat ip to",
            _ => "dnat to",
        };
        let mut script = format!("flush chain {chain}\n");
        for redirect in redirects {
            let proto = match redirect.proto {
                MapProtocol::Udp => "udp",
                MapProtocol::Tcp => "tcp",
            };
            script.push_str(&format!(
                "add rule {chain} ip daddr {} {proto} dport {} {dnat} {}\n",
                redirect.external.ip(),
                redirect.external.port(),
                redirect.internal,
            ));
        }
        script
    }
}

/// Feed `script` to `nft -f -`.
///
/// The child is always waited for, also when writing the script fails.
async fn run(nft_path: &Path, script: String) -> Result<(), FirewallError> {
    trace!(%script, "running nft");
    let mut child = Command::new(nft_path)
        .args(["-f", "-"])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .context(IoSnafu)?;
    // stdin is closed when dropped at the end of the match
    let written = match child.stdin.take() {
        Some(mut stdin) => stdin.write_all(script.as_bytes()).await,
        None => Ok(()),
    };
    let output = child.wait_with_output().await.context(IoSnafu)?;
    if !output.status.success() {
        return Err(failure(&String::from_utf8_lossy(&output.stderr)));
    }
    written.context(IoSnafu)
}

fn failure(stderr: &str) -> FirewallError {
    if stderr.contains(BUSY_MESSAGE) {
        BusySnafu.build()
    } else {
        RejectedSnafu {
            message: stderr.trim(),
        }
        .build()
    }
}

impl Firewall for NftFirewall {
    fn init(&mut self, reset: bool) -> BoxFuture<'_, Result<(), FirewallError>> {
        debug!(chain = %self.chain_path(), reset, "initializing nftables chain");
        let script = self.render_init(reset);
        Box::pin(run(&self.config.nft_path, script))
    }

    fn begin(&mut self) -> Result<(), FirewallError> {
        self.pending = Some(Vec::new());
        Ok(())
    }

    fn add_redirect(
        &mut self,
        proto: MapProtocol,
        internal: SocketAddrV4,
        external: SocketAddrV4,
    ) -> Result<(), FirewallError> {
        let Some(pending) = self.pending.as_mut() else {
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
        Box::pin(async move {
            let Some(pending) = self.pending.as_ref() else {
                return Err(NoTransactionSnafu.build());
            };
            let script = self.render_commit(pending);
            run(&self.config.nft_path, script).await?;
            self.pending = None;
            Ok(())
        })
    }

    fn rollback(&mut self) {
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use std::{net::Ipv4Addr, path::PathBuf};

    use super::*;

    fn redirect(proto: MapProtocol, internal: u16, external: u16) -> Redirect {
        Redirect {
            proto,
            internal: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), internal),
            external: SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), external),
        }
    }

    #[test]
    fn test_render_init() {
        let fw = NftFirewall::new(FirewallConfig::default());
        assert_eq!(
            fw.render_init(true),
            "add table ip natpmpd\n\
             add chain ip natpmpd prerouting { type nat hook prerouting priority -100; policy accept; }\n\
             flush chain ip natpmpd prerouting\n"
        );
        assert!(!fw.render_init(false).contains("flush"));
    }

    #[test]
    fn test_render_commit() {
        let fw = NftFirewall::new(FirewallConfig::default());
        let script = fw.render_commit(&[
            redirect(MapProtocol::Udp, 5000, 6000),
            redirect(MapProtocol::Tcp, 22, 50022),
        ]);
        assert_eq!(
            script,
            "flush chain ip natpmpd prerouting\n\
             add rule ip natpmpd prerouting ip daddr 192.0.2.1 udp dport 6000 dnat to 10.0.0.5:5000\n\
             add rule ip natpmpd prerouting ip daddr 192.0.2.1 tcp dport 50022 dnat to 10.0.0.5:22\n"
        );

        // an empty set still flushes
        assert_eq!(fw.render_commit(&[]), "flush chain ip natpmpd prerouting\n");
    }

    #[test]
    fn test_render_inet() {
        let fw = NftFirewall::new(FirewallConfig {
            family: "inet".to_string(),
            ..Default::default()
        });
        let script = fw.render_commit(&[redirect(MapProtocol::Udp, 1, 2)]);
        assert!(script.ends_with("udp dport 2 dnat ip to 10.0.0.5:1\n"));
    }

    #[test]
    fn test_failure_classification() {
        let err = failure("Error: Could not process rule: Device or resource busy\n");
        assert!(matches!(err, FirewallError::Busy { .. }));

        let err = failure("Error: syntax error, unexpected newline\n");
        match err {
            FirewallError::Rejected { message, .. } => {
                assert_eq!(message, "Error: syntax error, unexpected newline")
            }
            err => panic!("unexpected {err:?}"),
        }
    }

    #[tokio::test]
    async fn test_transaction_state() {
        let mut fw = NftFirewall::new(FirewallConfig {
            nft_path: PathBuf::from("/nonexistent/nft"),
            ..Default::default()
        });
        let r = redirect(MapProtocol::Udp, 5000, 6000);
        assert!(matches!(
            fw.add_redirect(r.proto, r.internal, r.external),
            Err(FirewallError::NoTransaction { .. })
        ));
        assert!(matches!(
            fw.commit().await,
            Err(FirewallError::NoTransaction { .. })
        ));

        fw.begin().unwrap();
        fw.add_redirect(r.proto, r.internal, r.external).unwrap();
        // the tool is missing, the transaction stays open
        assert!(matches!(fw.commit().await, Err(FirewallError::Io { .. })));
        assert_eq!(fw.pending.as_deref(), Some(&[r][..]));
        fw.rollback();
        assert!(fw.pending.is_none());
    }

    #[tokio::test]
    async fn test_failing_tool_is_reaped_and_rejected() {
        // `cat` does not know `-f`, exits with an error and may close stdin before the
        // script is written
        let mut fw = NftFirewall::new(FirewallConfig {
            nft_path: PathBuf::from("cat"),
            ..Default::default()
        });
        let r = redirect(MapProtocol::Tcp, 22, 2222);
        fw.begin().unwrap();
        fw.add_redirect(r.proto, r.internal, r.external).unwrap();
        match fw.commit().await {
            Err(FirewallError::Rejected { message, .. }) => assert!(!message.is_empty()),
            res => panic!("unexpected {res:?}"),
        }
        assert!(fw.pending.is_some());

        assert!(matches!(
            fw.init(true).await,
            Err(FirewallError::Rejected { .. })
        ));
    }
}
