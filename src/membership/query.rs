//! Read-only cluster queries (`what=...`): aggregation across nodes.

use crate::error::{Error, NetworkError, Result};
use crate::membership::controller::MembershipController;
use crate::network::bcast::bcast_collect;
use crate::network::msg::ControlMsg;
use crate::types::{Snode, WhatQuery};
use rand::seq::SliceRandom;
use serde_json::{json, Map, Value};
use tracing::debug;

impl MembershipController {
    /// Serve `GET ?what=...`. Mutating nothing, any proxy can answer.
    pub async fn cluster_query(&self, what: WhatQuery) -> Result<Value> {
        match what {
            WhatQuery::TargetIps => Ok(self.target_ips()),
            WhatQuery::Status => Ok(json!(self.notifs.ownership_table())),
            WhatQuery::Stats => {
                let targets = self.query_nodes(self.targets(), what).await?;
                Ok(json!({
                    "proxy": self.metrics.snapshot(),
                    "target": targets,
                }))
            }
            WhatQuery::Sysinfo => {
                let proxies = self.query_nodes(self.proxies(), what).await?;
                let targets = self.query_nodes(self.targets(), what).await?;
                Ok(json!({ "proxy": proxies, "target": targets }))
            }
            WhatQuery::Mountpaths | WhatQuery::Xaction => {
                let targets = self.query_nodes(self.targets(), what).await?;
                if targets.is_empty() {
                    return Err(Error::Membership(
                        crate::error::MembershipError::NodeNotFound("<any target>".to_string()),
                    ));
                }
                Ok(Value::Object(targets))
            }
            WhatQuery::RemoteCluster => {
                let targets: Vec<Snode> = self.targets();
                let target = targets
                    .choose(&mut rand::thread_rng())
                    .cloned()
                    .ok_or_else(|| {
                        Error::Membership(crate::error::MembershipError::NodeNotFound(
                            "<any target>".to_string(),
                        ))
                    })?;
                let reply = self
                    .transport
                    .call(
                        &target,
                        ControlMsg::DaemonQuery { what },
                        self.config.cplane_operation,
                    )
                    .await?;
                match reply {
                    ControlMsg::Blob { value } => Ok(value),
                    other => other.reject(&target.name()).map(|_| Value::Null),
                }
            }
        }
    }

    /// Comma-separated hostnames of every target endpoint, public first.
    fn target_ips(&self) -> Value {
        let smap = self.owner.smap.get();
        let mut out = String::new();
        for t in smap.tmap.values() {
            for host in [
                &t.public_net.hostname,
                &t.control_net.hostname,
                &t.data_net.hostname,
            ] {
                if !out.is_empty() {
                    out.push(',');
                }
                out.push_str(host);
            }
        }
        Value::String(out)
    }

    fn targets(&self) -> Vec<Snode> {
        self.owner.smap.get().tmap.values().cloned().collect()
    }

    fn proxies(&self) -> Vec<Snode> {
        let smap = self.owner.smap.get();
        smap.pmap
            .values()
            .filter(|p| p.id != self.si.id)
            .cloned()
            .collect()
    }

    /// Broadcast a daemon query and merge per-node JSON blobs into a map
    /// keyed by node ID. 404s are skipped; the first hard error aborts the
    /// aggregation.
    async fn query_nodes(&self, nodes: Vec<Snode>, what: WhatQuery) -> Result<Map<String, Value>> {
        let results = bcast_collect(
            self.transport.clone(),
            nodes,
            ControlMsg::DaemonQuery { what },
            self.config.max_keepalive,
            self.config.max_bcast_parallel,
        )
        .await;
        let mut merged = Map::new();
        for (node, res) in results {
            match res {
                Ok(ControlMsg::Blob { value }) => {
                    merged.insert(node.id.clone(), value);
                }
                Ok(ControlMsg::Err { code: 404, .. }) => {
                    debug!(node = %node, ?what, "nothing to report");
                }
                Ok(ControlMsg::Err { code, message }) => {
                    self.keepalive
                        .on_err(&node.id, &Error::Network(NetworkError::PeerError {
                            peer: node.name(),
                            code,
                            message: message.clone(),
                        }));
                    return Err(Error::Network(NetworkError::PeerError {
                        peer: node.name(),
                        code,
                        message,
                    }));
                }
                Ok(_) => {
                    return Err(Error::Network(NetworkError::UnexpectedResponse(
                        node.name(),
                    )))
                }
                Err(e) => {
                    self.keepalive.on_err(&node.id, &e);
                    return Err(e);
                }
            }
        }
        Ok(merged)
    }
}
