//! Two-phase primary handover.
//!
//! Phase I (prepare) informs every node of the designated primary; any
//! rejection aborts the handover with no state change. Phase II (commit)
//! installs the new primary locally (silencing keepalives for the duration),
//! revokes this metasyncer, and broadcasts the commit. A commit failure on
//! the *new primary* is fatal for the handover; other nodes reconcile via
//! subsequent metasync.

use crate::error::{MembershipError, Result};
use crate::meta::{Modifier, Smap};
use crate::membership::controller::MembershipController;
use crate::network::bcast::bcast_collect;
use crate::network::msg::ControlMsg;
use crate::types::{Action, NodeId, Snode};
use std::sync::atomic::Ordering;
use tracing::{error, info, warn};

fn all_nodes_but(smap: &Smap, id: &str) -> Vec<Snode> {
    smap.pmap
        .values()
        .chain(smap.tmap.values())
        .filter(|n| n.id != id)
        .cloned()
        .collect()
}

impl MembershipController {
    /// Designate `new_id` as the primary proxy (the `set-primary` action).
    pub async fn set_primary(&self, new_id: &NodeId) -> Result<()> {
        if !self.is_primary() {
            let msg = ControlMsg::Act(Action::SetPrimary { id: new_id.clone() });
            return self
                .forward_to_primary(msg, "set-primary")
                .await
                .and_then(|reply| reply.expect_ok("primary"));
        }
        let smap = self.owner.smap.get();
        let psi = smap
            .get_proxy(new_id)
            .cloned()
            .ok_or_else(|| MembershipError::NodeNotFound(new_id.clone()))?;
        if *new_id == self.si.id {
            warn!(node = %self.si, "request to set primary to self, nothing to do");
            return Ok(());
        }
        if smap.present_in_maint(new_id) {
            return Err(MembershipError::JoinFailed(format!(
                "cannot set new primary: {} is under maintenance",
                psi.name()
            ))
            .into());
        }
        let peers = all_nodes_but(&smap, &self.si.id);
        drop(smap);

        // (I) prepare
        let results = bcast_collect(
            self.transport.clone(),
            peers.clone(),
            ControlMsg::SetPrimary {
                id: new_id.clone(),
                prepare: true,
            },
            self.config.cplane_operation,
            self.config.max_bcast_parallel,
        )
        .await;
        for (node, res) in &results {
            let failed = match res {
                Err(e) => Some(e.to_string()),
                Ok(reply) => match reply {
                    ControlMsg::Ok => None,
                    ControlMsg::Err { message, .. } => Some(message.clone()),
                    _ => Some("unexpected reply".to_string()),
                },
            };
            if let Some(details) = failed {
                return Err(MembershipError::HandoverRejected {
                    id: new_id.clone(),
                    peer: node.name(),
                    phase: "prepare".to_string(),
                    details,
                }
                .into());
            }
        }

        // (II) commit: local changes first
        self.in_primary_transition.store(true, Ordering::SeqCst);
        let install = self.owner.smap.modify(Modifier::new(|clone: &mut Smap| {
            clone.primary_id = new_id.clone();
            clone.staff_ic();
            Ok(())
        }));
        self.msyncer.become_non_primary();
        self.in_primary_transition.store(false, Ordering::SeqCst);
        install?;

        let results = bcast_collect(
            self.transport.clone(),
            peers,
            ControlMsg::SetPrimary {
                id: new_id.clone(),
                prepare: false,
            },
            self.config.cplane_operation,
            self.config.max_bcast_parallel,
        )
        .await;
        for (node, res) in &results {
            let failure = match res {
                Err(e) => Some(e.to_string()),
                Ok(ControlMsg::Err { message, .. }) => Some(message.clone()),
                Ok(_) => None,
            };
            if let Some(details) = failure {
                if node.id == *new_id {
                    error!(node = %self.si, new_primary = %node, %details,
                        "commit phase failure on the new primary");
                    return Err(MembershipError::HandoverRejected {
                        id: new_id.clone(),
                        peer: node.name(),
                        phase: "commit".to_string(),
                        details,
                    }
                    .into());
                }
                // others reconcile via subsequent metasync
                warn!(node = %self.si, peer = %node, %details, "commit phase failure, ignoring");
            }
        }
        info!(node = %self.si, new_primary = %new_id, "primary handover committed");
        Ok(())
    }

    /// Handle an incoming handover phase (any node).
    pub fn handle_set_primary(&self, new_id: &NodeId, prepare: bool) -> Result<()> {
        let smap = self.owner.smap.get();
        if smap.get_proxy(new_id).is_none() {
            return Err(MembershipError::NodeNotFound(new_id.clone()).into());
        }
        if prepare {
            // validation only; the prepare phase changes no state
            return Ok(());
        }
        drop(smap);
        let installed = self.owner.smap.modify(Modifier::new(|clone: &mut Smap| {
            clone.primary_id = new_id.clone();
            clone.staff_ic();
            Ok(())
        }))?;
        if *new_id == self.si.id {
            info!(node = %self.si, smap = %installed.string_ex(), "assuming primaryship");
            self.msyncer.become_primary();
        } else {
            self.msyncer.become_non_primary();
        }
        Ok(())
    }
}
