//! Cluster topology discovery replies
//!
//! `CLUSTER SLOTS` is an array of
//! `[start, end, [host, port, id?, ...], replica...]` entries.
//! `CLUSTER SHARDS` is an array of shards, each a flattened map with a `slots`
//! list of start/end pairs and a `nodes` list of flattened node maps.
//!
//! An empty or unknown host (`""`, `?`, nil) stands for the node that answered.

use crate::slot_map::SlotMap;
use redis_conduit_core::{
    config::DiscoveryCommand,
    error::{RedisError, RedisResult},
    types::{NodeInfo, SlotRange},
    value::RespValue,
};

/// Command (identifier and arguments) used to fetch the topology
pub fn discovery_args(discovery: DiscoveryCommand) -> (&'static str, &'static str) {
    match discovery {
        DiscoveryCommand::Slots => ("CLUSTER", "SLOTS"),
        DiscoveryCommand::Shards => ("CLUSTER", "SHARDS"),
    }
}

/// Parse a discovery reply of the given kind
pub fn parse(
    discovery: DiscoveryCommand,
    reply: &RespValue,
    answering_host: &str,
) -> RedisResult<Vec<NodeInfo>> {
    match discovery {
        DiscoveryCommand::Slots => parse_cluster_slots(reply, answering_host),
        DiscoveryCommand::Shards => parse_cluster_shards(reply, answering_host),
    }
}

/// Parse a `CLUSTER SLOTS` reply into masters (with slots) and replicas
pub fn parse_cluster_slots(reply: &RespValue, answering_host: &str) -> RedisResult<Vec<NodeInfo>> {
    let mut nodes: Vec<NodeInfo> = Vec::new();

    for entry in reply.as_array().map_err(malformed)? {
        let fields = entry.as_array().map_err(malformed)?;
        if fields.len() < 3 {
            return Err(RedisError::Cluster(format!(
                "CLUSTER SLOTS entry has {} fields, expected at least 3",
                fields.len()
            )));
        }
        let range = slot_range(&fields[0], &fields[1])?;

        let (host, port, id) = endpoint(&fields[2], answering_host)?;
        let master = upsert(&mut nodes, host, port, id, true);
        master.slots.push(range);

        for replica in &fields[3..] {
            let (host, port, id) = endpoint(replica, answering_host)?;
            upsert(&mut nodes, host, port, id, false);
        }
    }

    Ok(nodes)
}

/// Parse a `CLUSTER SHARDS` reply into masters (with slots) and replicas
///
/// Nodes reported with `health` other than `online` are skipped.
pub fn parse_cluster_shards(reply: &RespValue, answering_host: &str) -> RedisResult<Vec<NodeInfo>> {
    let mut nodes: Vec<NodeInfo> = Vec::new();

    for shard in reply.as_array().map_err(malformed)? {
        let shard = shard.as_array().map_err(malformed)?;
        let slots = field(shard, "slots")
            .ok_or_else(|| RedisError::Cluster("shard without slots".to_string()))?
            .as_array()
            .map_err(malformed)?;
        let members = field(shard, "nodes")
            .ok_or_else(|| RedisError::Cluster("shard without nodes".to_string()))?
            .as_array()
            .map_err(malformed)?;

        if slots.len() % 2 != 0 {
            return Err(RedisError::Cluster(
                "shard slots must be start/end pairs".to_string(),
            ));
        }
        let mut ranges = Vec::with_capacity(slots.len() / 2);
        for pair in slots.chunks_exact(2) {
            ranges.push(slot_range(&pair[0], &pair[1])?);
        }

        for member in members {
            let member = member.as_array().map_err(malformed)?;
            if let Some(health) = text_field(member, "health") {
                if health != "online" {
                    continue;
                }
            }
            let is_master = text_field(member, "role").as_deref() == Some("master");

            let host = text_field(member, "endpoint")
                .filter(|h| is_known_host(h))
                .or_else(|| text_field(member, "ip"))
                .filter(|h| is_known_host(h))
                .unwrap_or_else(|| answering_host.to_string());
            let port = field(member, "port")
                .or_else(|| field(member, "tls-port"))
                .ok_or_else(|| RedisError::Cluster("shard node without port".to_string()))
                .and_then(port_of)?;
            let id = text_field(member, "id");

            let node = upsert(&mut nodes, host, port, id, is_master);
            if is_master {
                node.slots.extend(ranges.iter().copied());
            }
        }
    }

    Ok(nodes)
}

/// Build a fresh slot map from parsed masters
pub fn build_slot_map(nodes: &[NodeInfo]) -> RedisResult<SlotMap> {
    let mut map = SlotMap::new();
    for node in nodes.iter().filter(|n| n.is_master) {
        let address = node.address();
        for range in &node.slots {
            map.set_slots(range.start, range.end, &address)?;
        }
    }
    Ok(map)
}

fn malformed(e: RedisError) -> RedisError {
    RedisError::Cluster(format!("malformed topology reply: {e}"))
}

fn slot_range(start: &RespValue, end: &RespValue) -> RedisResult<SlotRange> {
    let start = start.as_int().map_err(malformed)?;
    let end = end.as_int().map_err(malformed)?;
    let range = match (u16::try_from(start), u16::try_from(end)) {
        (Ok(s), Ok(e)) => SlotRange::new(s, e),
        _ => {
            return Err(RedisError::Cluster(format!(
                "slot range {start}-{end} out of bounds"
            )))
        }
    };
    if !range.is_valid() {
        return Err(RedisError::Cluster(format!(
            "invalid slot range {start}-{end}"
        )));
    }
    Ok(range)
}

fn port_of(value: &RespValue) -> RedisResult<u16> {
    let port = value.as_int().map_err(malformed)?;
    u16::try_from(port).map_err(|_| RedisError::Cluster(format!("invalid port {port}")))
}

fn is_known_host(host: &str) -> bool {
    !host.is_empty() && host != "?"
}

/// `[host, port, id?, ...]` from `CLUSTER SLOTS`
fn endpoint(value: &RespValue, answering_host: &str) -> RedisResult<(String, u16, Option<String>)> {
    let parts = value.as_array().map_err(malformed)?;
    if parts.len() < 2 {
        return Err(RedisError::Cluster(
            "node entry needs host and port".to_string(),
        ));
    }
    let host = match &parts[0] {
        RespValue::Null => answering_host.to_string(),
        other => {
            let host = other.as_string().map_err(malformed)?;
            if is_known_host(&host) {
                host
            } else {
                answering_host.to_string()
            }
        }
    };
    let port = port_of(&parts[1])?;
    let id = parts.get(2).and_then(|v| v.as_string().ok());
    Ok((host, port, id))
}

fn field<'a>(map: &'a [RespValue], name: &str) -> Option<&'a RespValue> {
    map.chunks_exact(2)
        .find(|pair| {
            pair[0]
                .as_string()
                .map(|key| key.eq_ignore_ascii_case(name))
                .unwrap_or(false)
        })
        .map(|pair| &pair[1])
}

fn text_field(map: &[RespValue], name: &str) -> Option<String> {
    field(map, name).and_then(|v| v.as_string().ok())
}

fn upsert(
    nodes: &mut Vec<NodeInfo>,
    host: String,
    port: u16,
    id: Option<String>,
    is_master: bool,
) -> &mut NodeInfo {
    let idx = match nodes.iter().position(|n| n.host == host && n.port == port) {
        Some(idx) => idx,
        None => {
            nodes.push(NodeInfo {
                id: None,
                host,
                port,
                slots: Vec::new(),
                is_master,
            });
            nodes.len() - 1
        }
    };
    let node = &mut nodes[idx];
    node.is_master |= is_master;
    if node.id.is_none() {
        node.id = id;
    }
    node
}
