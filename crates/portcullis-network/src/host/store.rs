//! Endpoint records and address leases.
//!
//! Every operation takes the state file lock on the blocking thread pool.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use portcullis_common::{PortcullisError, PortcullisResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::platform::{Endpoint, EndpointRequest, Subnet, endpoint_not_found};
use crate::statefile::{LockedFile, blocking};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Records {
    #[serde(default)]
    endpoints: BTreeMap<String, Endpoint>,
}

/// Endpoints known to the host, keyed by id, in a locked JSON file.
#[derive(Debug, Clone)]
pub struct EndpointStore {
    path: PathBuf,
}

impl EndpointStore {
    /// Store backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Record a new endpoint, leasing it the lowest free address in `subnet`.
    ///
    /// # Errors
    ///
    /// Fails if an endpoint with the same name exists or the subnet is full.
    pub async fn create(
        &self,
        request: &EndpointRequest,
        subnet: Subnet,
    ) -> PortcullisResult<Endpoint> {
        let path = self.path.clone();
        let request = request.clone();
        blocking(move || record(&path, &request, subnet)).await
    }

    /// Look an endpoint up by id.
    ///
    /// # Errors
    ///
    /// Returns `Endpoint <id> not found` if there is no such endpoint.
    pub async fn by_id(&self, id: &str) -> PortcullisResult<Endpoint> {
        let records = self.load().await?;
        records
            .endpoints
            .get(id)
            .cloned()
            .ok_or_else(|| endpoint_not_found(id))
    }

    /// Look an endpoint up by name.
    ///
    /// # Errors
    ///
    /// Returns `Endpoint <name> not found` if there is no such endpoint.
    pub async fn by_name(&self, name: &str) -> PortcullisResult<Endpoint> {
        let records = self.load().await?;
        records
            .endpoints
            .values()
            .find(|e| e.name == name)
            .cloned()
            .ok_or_else(|| endpoint_not_found(name))
    }

    /// Replace a stored endpoint.
    ///
    /// # Errors
    ///
    /// Returns `Endpoint <id> not found` if it was never recorded.
    pub async fn update(&self, endpoint: &Endpoint) -> PortcullisResult<()> {
        let path = self.path.clone();
        let endpoint = endpoint.clone();
        blocking(move || {
            let mut file = LockedFile::open(&path)?;
            let mut records: Records = file.load()?;

            let stored = records
                .endpoints
                .get_mut(&endpoint.id)
                .ok_or_else(|| endpoint_not_found(&endpoint.id))?;
            *stored = endpoint;
            file.store(&records)
        })
        .await
    }

    /// Forget an endpoint; forgetting an unknown one is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the state file cannot be written.
    pub async fn remove(&self, id: &str) -> PortcullisResult<()> {
        let path = self.path.clone();
        let id = id.to_string();
        blocking(move || {
            let mut file = LockedFile::open(&path)?;
            let mut records: Records = file.load()?;

            if records.endpoints.remove(&id).is_some() {
                file.store(&records)?;
            }
            Ok(())
        })
        .await
    }

    async fn load(&self) -> PortcullisResult<Records> {
        let path = self.path.clone();
        blocking(move || LockedFile::open(&path)?.load()).await
    }
}

fn record(path: &Path, request: &EndpointRequest, subnet: Subnet) -> PortcullisResult<Endpoint> {
    let mut file = LockedFile::open(path)?;
    let mut records: Records = file.load()?;

    if records.endpoints.values().any(|e| e.name == request.name) {
        return Err(PortcullisError::platform(format!(
            "Endpoint {} already exists",
            request.name
        )));
    }

    let ip_address = lease(&records, &request.virtual_network, subnet)?;
    let endpoint = Endpoint {
        id: Uuid::new_v4().to_string(),
        name: request.name.clone(),
        virtual_network: request.virtual_network.clone(),
        ip_address: Some(ip_address),
        policies: request.policies.clone(),
        dns_servers: request.dns_servers.clone(),
    };

    records
        .endpoints
        .insert(endpoint.id.clone(), endpoint.clone());
    file.store(&records)?;

    tracing::debug!(endpoint_id = %endpoint.id, ip = %ip_address, "Recorded endpoint");
    Ok(endpoint)
}

fn lease(records: &Records, network: &str, subnet: Subnet) -> PortcullisResult<Ipv4Addr> {
    let taken: Vec<Ipv4Addr> = records
        .endpoints
        .values()
        .filter(|e| e.virtual_network == network)
        .filter_map(|e| e.ip_address)
        .collect();

    subnet
        .address_prefix
        .hosts()
        .find(|addr| *addr != subnet.gateway_address && !taken.contains(addr))
        .ok_or_else(|| {
            PortcullisError::platform(format!(
                "no free address left in {}",
                subnet.address_prefix
            ))
        })
}
