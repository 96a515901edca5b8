//! Guest network configuration, matched by MAC address rather than kernel
//! enumeration order (spec §4.4 step 8).
//!
//! Renaming happens in two strict phases so no phase-2 name can collide
//! with a still-live original name: every non-loopback interface is first
//! renamed to a unique temporary name, then, in a second pass, each is
//! looked up by MAC and renamed to its descriptor-requested name.

use runq_core::descriptor::Network;
use runq_core::{Result, RunqError};

/// One interface as discovered from the kernel, before any renaming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredInterface {
    pub index: u32,
    pub name: String,
    pub mac_address: String,
}

/// The two-phase rename plan: interim names (phase 1) and final per-index
/// names matched against the descriptor by MAC (phase 2). Pure so it's
/// testable without touching netlink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenamePlan {
    pub interim: Vec<(u32, String)>,
    pub final_names: Vec<(u32, String)>,
}

/// Builds the rename plan for a set of discovered interfaces against the
/// descriptor's network list, matched by MAC.
pub fn plan_renames(discovered: &[DiscoveredInterface], networks: &[Network]) -> Result<RenamePlan> {
    let interim: Vec<(u32, String)> = discovered
        .iter()
        .map(|i| (i.index, format!("tmp{}", i.index)))
        .collect();

    let mut final_names = Vec::with_capacity(discovered.len());
    for iface in discovered {
        let net = networks
            .iter()
            .find(|n| n.mac_address.eq_ignore_ascii_case(&iface.mac_address))
            .ok_or_else(|| {
                RunqError::Boot(format!(
                    "no descriptor network matches MAC {}",
                    iface.mac_address
                ))
            })?;
        final_names.push((iface.index, net.name.clone()));
    }

    Ok(RenamePlan { interim, final_names })
}

/// Applies the discovered-interface set against the descriptor over
/// rtnetlink: two-phase rename, address assignment (label stripped), MTU,
/// link up, default route, then a best-effort ARP-priming datagram toward
/// the gateway.
pub async fn configure_network(data: &runq_core::descriptor::Data) -> Result<()> {
    if data.networks.is_empty() {
        return Ok(());
    }

    let (connection, handle, _) =
        rtnetlink::new_connection().map_err(|e| RunqError::Boot(format!("rtnetlink connect failed: {e}")))?;
    tokio::spawn(connection);

    let discovered = discover_interfaces(&handle).await?;
    let plan = plan_renames(&discovered, &data.networks)?;

    for (index, interim_name) in &plan.interim {
        rename_link(&handle, *index, interim_name).await?;
    }
    for (index, final_name) in &plan.final_names {
        rename_link(&handle, *index, final_name).await?;
    }

    for net in &data.networks {
        apply_interface_config(&handle, net).await?;
    }

    Ok(())
}

async fn discover_interfaces(handle: &rtnetlink::Handle) -> Result<Vec<DiscoveredInterface>> {
    use futures::TryStreamExt;
    let mut links = handle.link().get().execute();
    let mut discovered = Vec::new();
    while let Some(msg) = links
        .try_next()
        .await
        .map_err(|e| RunqError::Boot(format!("link list failed: {e}")))?
    {
        let index = msg.header.index;
        let mut name = String::new();
        let mut mac_address = String::new();
        for attr in &msg.attributes {
            use netlink_packet_route::link::LinkAttribute;
            match attr {
                LinkAttribute::IfName(n) => name = n.clone(),
                LinkAttribute::Address(addr) => {
                    mac_address = addr
                        .iter()
                        .map(|b| format!("{b:02x}"))
                        .collect::<Vec<_>>()
                        .join(":");
                }
                _ => {}
            }
        }
        if name != "lo" {
            discovered.push(DiscoveredInterface { index, name, mac_address });
        }
    }
    Ok(discovered)
}

async fn rename_link(handle: &rtnetlink::Handle, index: u32, name: &str) -> Result<()> {
    handle
        .link()
        .set(index)
        .name(name.to_string())
        .execute()
        .await
        .map_err(|e| RunqError::Boot(format!("rename link {index} to {name} failed: {e}")))
}

async fn apply_interface_config(handle: &rtnetlink::Handle, net: &Network) -> Result<()> {
    use futures::TryStreamExt;
    let mut links = handle.link().get().match_name(net.name.clone()).execute();
    let link = links
        .try_next()
        .await
        .map_err(|e| RunqError::Boot(format!("lookup {} failed: {e}", net.name)))?
        .ok_or_else(|| RunqError::Boot(format!("interface {} vanished after rename", net.name)))?;
    let index = link.header.index;

    for addr in &net.addrs {
        let (ip, prefix) = split_cidr(addr)?;
        handle
            .address()
            .add(index, ip.parse().map_err(|_| RunqError::Boot(format!("bad addr {addr}")))?, prefix)
            .execute()
            .await
            .map_err(|e| RunqError::Boot(format!("add addr {addr} to {} failed: {e}", net.name)))?;
    }

    handle
        .link()
        .set(index)
        .mtu(net.mtu)
        .up()
        .execute()
        .await
        .map_err(|e| RunqError::Boot(format!("bring up {} failed: {e}", net.name)))?;

    if let Some(gateway) = &net.gateway {
        let gw_addr = gateway
            .parse()
            .map_err(|_| RunqError::Boot(format!("bad gateway {gateway}")))?;
        let route = handle.route().add().v4();
        route
            .gateway(gw_addr)
            .execute()
            .await
            .map_err(|e| RunqError::Boot(format!("default route via {gateway} failed: {e}")))?;

        prime_arp(gateway);
    }

    Ok(())
}

fn split_cidr(addr: &str) -> Result<(&str, u8)> {
    let (ip, prefix) = addr
        .split_once('/')
        .ok_or_else(|| RunqError::Boot(format!("address {addr} missing prefix length")))?;
    let prefix = prefix
        .parse()
        .map_err(|_| RunqError::Boot(format!("invalid prefix length in {addr}")))?;
    Ok((ip, prefix))
}

/// Sends one best-effort UDP datagram toward the gateway to prime the
/// bridge's ARP/FDB table; failure here is never fatal to boot.
fn prime_arp(gateway: &str) {
    if let Ok(socket) = std::net::UdpSocket::bind("0.0.0.0:0") {
        let _ = socket.send_to(&[0u8], format!("{gateway}:9"));
    }
}
