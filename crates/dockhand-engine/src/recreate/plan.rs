//! Derivation of a recreation plan from a container snapshot.
//!
//! The plan is transient: computed for one recreation, discarded when the
//! operation commits or rolls back.

use std::collections::BTreeMap;

use crate::client::models::{ContainerInspect, CreateContainerBody, EndpointSettings, NetworkingConfig};

/// Network modes that share another namespace and therefore forbid
/// independent network attachment and networking-only config fields.
pub fn is_shared_namespace(network_mode: &str) -> bool {
    network_mode == "host" || network_mode == "none" || network_mode.starts_with("container:")
}

#[derive(Debug, Clone)]
pub struct RecreationPlan {
    /// Original container name, without the leading slash.
    pub name: String,
    pub was_running: bool,
    pub shared_namespace: bool,
    pub create_body: CreateContainerBody,
    /// Networks beyond the primary, reconnected right after creation with
    /// their full original endpoint settings.
    pub reconnect: Vec<(String, EndpointSettings)>,
    /// Every network of the old container, for rollback reconnection.
    pub original_networks: Vec<(String, EndpointSettings)>,
}

impl RecreationPlan {
    /// Builds the plan. `network_mode_container_name` must be supplied when
    /// the snapshot's network mode references another container: the mode is
    /// rewritten to that container's current name, since ids go stale across
    /// recreations while names persist.
    pub fn build(
        snapshot: &ContainerInspect,
        target_image: &str,
        network_mode_container_name: Option<&str>,
    ) -> Self {
        let network_mode = snapshot
            .host_config
            .network_mode
            .clone()
            .unwrap_or_else(|| "bridge".to_string());
        let shared_namespace = is_shared_namespace(&network_mode);

        let mut config = snapshot.config.clone();
        config.image = target_image.to_string();

        let mut host_config = snapshot.host_config.clone();
        host_config.binds = Some(synthesize_binds(snapshot));

        if shared_namespace {
            // The runtime rejects networking-only fields when the namespace
            // is shared with another container or the host.
            config.hostname = None;
            config.domainname = None;
            config.exposed_ports = None;
            config.mac_address = None;
            host_config.extra_hosts = None;
            host_config.dns = None;
            host_config.dns_options = None;
            host_config.dns_search = None;
            host_config.port_bindings = None;

            if network_mode.starts_with("container:") {
                if let Some(name) = network_mode_container_name {
                    host_config.network_mode = Some(format!("container:{name}"));
                }
            }
        }

        // Deterministic ordering so the primary pick is stable.
        let mut networks: BTreeMap<String, EndpointSettings> = BTreeMap::new();
        if !shared_namespace {
            for (name, endpoint) in &snapshot.network_settings.networks {
                networks.insert(name.clone(), sanitize_endpoint(endpoint, snapshot.short_id()));
            }
        }
        let original_networks: Vec<(String, EndpointSettings)> =
            networks.iter().map(|(n, e)| (n.clone(), e.clone())).collect();

        // Creation accepts exactly one endpoint; prefer the one matching the
        // network mode, otherwise the first. The rest reconnect afterwards.
        let primary = if networks.contains_key(&network_mode) {
            Some(network_mode.clone())
        } else {
            networks.keys().next().cloned()
        };

        let mut networking_config = None;
        let mut reconnect = Vec::new();
        if let Some(primary_name) = primary {
            for (name, endpoint) in &networks {
                if *name == primary_name {
                    networking_config = Some(NetworkingConfig {
                        endpoints_config: std::collections::HashMap::from([(
                            name.clone(),
                            endpoint.clone(),
                        )]),
                    });
                } else {
                    reconnect.push((name.clone(), endpoint.clone()));
                }
            }
        }

        Self {
            name: snapshot.plain_name().to_string(),
            was_running: snapshot.state.running,
            shared_namespace,
            create_body: CreateContainerBody {
                config,
                host_config,
                networking_config,
            },
            reconnect,
            original_networks,
        }
    }
}

/// Original binds plus a synthesized entry for every anonymous volume that
/// the snapshot mounts but no bind covers; without this, recreation would
/// silently detach the data.
fn synthesize_binds(snapshot: &ContainerInspect) -> Vec<String> {
    let mut binds = snapshot.host_config.binds.clone().unwrap_or_default();

    for mount in &snapshot.mounts {
        if mount.mount_type != "volume" {
            continue;
        }
        let Some(volume_name) = mount.name.as_deref() else {
            continue;
        };
        let covered = binds
            .iter()
            .any(|bind| bind_destination(bind) == Some(mount.destination.as_str()));
        if covered {
            continue;
        }
        let mut entry = format!("{volume_name}:{}", mount.destination);
        if !mount.rw {
            entry.push_str(":ro");
        }
        binds.push(entry);
    }

    binds
}

fn bind_destination(bind: &str) -> Option<&str> {
    bind.split(':').nth(1)
}

/// Strips runtime-assigned endpoint state so the settings can be replayed
/// against a fresh container. Static addressing, aliases, links, driver
/// options and gateway priority survive.
fn sanitize_endpoint(endpoint: &EndpointSettings, old_short_id: &str) -> EndpointSettings {
    let mut out = endpoint.clone();
    out.endpoint_id = None;
    out.ip_address = None;
    out.gateway = None;
    out.mac_address = None;
    out.dns_names = None;
    for key in [
        "GlobalIPv6Address",
        "GlobalIPv6PrefixLen",
        "IPPrefixLen",
        "IPv6Gateway",
    ] {
        out.extra.remove(key);
    }

    // The runtime injects the container's short id as an implicit alias;
    // replaying it would pin the old id onto the new container.
    if let Some(aliases) = out.aliases.take() {
        let kept: Vec<String> = aliases.into_iter().filter(|a| a != old_short_id).collect();
        if !kept.is_empty() {
            out.aliases = Some(kept);
        }
    }

    if out
        .ipam_config
        .as_ref()
        .is_some_and(|c| c.is_effectively_empty())
    {
        out.ipam_config = None;
    }

    out
}
