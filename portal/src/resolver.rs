//! Derives the set of resources a client may see and turns store events into
//! the deltas pushed over its socket.
//!
//! Resources live in the store's flat table; per session we only keep the
//! rendered views, keyed by id, and diff against a freshly derived target set
//! whenever a subscription event fires.

use portal_messages::client;
use portal_model::{ResourceId, legacy_dns_address, supports_full_globs};
use portal_store::{Resource, ResourceKind, Store};
use semver::Version;
use std::collections::BTreeMap;
use std::net::IpAddr;

/// Renders one resource for a client of the given version.
///
/// Returns `None` when the client cannot represent the resource, e.g. a
/// legacy client and a non-leading glob; such resources are omitted entirely.
pub fn render_resource(
    store: &Store,
    resource: &Resource,
    client_version: &Version,
) -> Option<client::ResourceDescription> {
    let gateway_groups = store.sites_for_resource(resource);

    let description = match resource.kind {
        ResourceKind::Dns => {
            let address = if supports_full_globs(client_version) {
                resource.address.clone()
            } else {
                legacy_dns_address(&resource.address)?
            };

            client::ResourceDescription::Dns(client::ResourceDescriptionDns {
                id: resource.id,
                address,
                name: resource.name.clone(),
                address_description: resource.address_description.clone(),
                gateway_groups,
                filters: resource.filters.clone(),
            })
        }
        ResourceKind::Cidr => {
            let address = resource.address.parse().ok()?;

            client::ResourceDescription::Cidr(client::ResourceDescriptionCidr {
                id: resource.id,
                address,
                name: resource.name.clone(),
                address_description: resource.address_description.clone(),
                gateway_groups,
                filters: resource.filters.clone(),
            })
        }
        ResourceKind::Ip => {
            let address = match resource.address.parse::<IpAddr>().ok()? {
                IpAddr::V4(ip) => {
                    ip_network::IpNetwork::V4(ip_network::Ipv4Network::new(ip, 32).ok()?)
                }
                IpAddr::V6(ip) => {
                    ip_network::IpNetwork::V6(ip_network::Ipv6Network::new(ip, 128).ok()?)
                }
            };

            client::ResourceDescription::Cidr(client::ResourceDescriptionCidr {
                id: resource.id,
                address,
                name: resource.name.clone(),
                address_description: resource.address_description.clone(),
                gateway_groups,
                filters: resource.filters.clone(),
            })
        }
    };

    Some(description)
}

/// Derives the full target view set for an actor: memberships → policies →
/// resources, deduplicated, rendered for the client's version.
pub fn derive_views(
    store: &Store,
    actor_id: portal_model::ActorId,
    client_version: &Version,
) -> BTreeMap<ResourceId, client::ResourceDescription> {
    store
        .visible_resources(actor_id)
        .iter()
        .filter_map(|resource| {
            render_resource(store, resource, client_version).map(|view| (resource.id, view))
        })
        .collect()
}

/// The per-session view state.
pub struct Resolver {
    visible: BTreeMap<ResourceId, client::ResourceDescription>,
}

impl Resolver {
    pub fn new(initial: BTreeMap<ResourceId, client::ResourceDescription>) -> Self {
        Self { visible: initial }
    }

    /// The current views, for the `init` push.
    pub fn views(&self) -> Vec<client::ResourceDescription> {
        self.visible.values().cloned().collect()
    }

    /// Replaces the view set with `target` and returns the deltas to push.
    ///
    /// `refresh` forces a `resource_deleted` + `resource_created_or_updated`
    /// pair for a resource that stayed visible: used when a granting policy
    /// went away but another one still grants the resource, so the client
    /// re-learns it.
    pub fn apply(
        &mut self,
        target: BTreeMap<ResourceId, client::ResourceDescription>,
        refresh: Option<ResourceId>,
    ) -> Vec<client::EgressMessages> {
        let mut deltas = Vec::new();

        for id in self.visible.keys() {
            if !target.contains_key(id) {
                deltas.push(client::EgressMessages::ResourceDeleted(*id));
            }
        }

        for (id, view) in &target {
            let forced = refresh == Some(*id);

            match self.visible.get(id) {
                Some(existing) if existing == view && !forced => {}
                Some(_) if forced => {
                    deltas.push(client::EgressMessages::ResourceDeleted(*id));
                    deltas.push(client::EgressMessages::ResourceCreatedOrUpdated(
                        view.clone(),
                    ));
                }
                _ => {
                    deltas.push(client::EgressMessages::ResourceCreatedOrUpdated(
                        view.clone(),
                    ));
                }
            }
        }

        self.visible = target;

        deltas
    }
}
