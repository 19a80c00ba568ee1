use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::model::{Coordinate, Entity, LocationRecord};
use crate::source::{DeviceFilter, HistoryRequest, RemoteSource, Session};

/// On-disk shape of a dataset file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetDocument {
    #[serde(default)]
    pub devices: Vec<Entity>,
    #[serde(default)]
    pub log_records: Vec<LocationRecord>,
    #[serde(default)]
    pub addresses: HashMap<String, Coordinate>,
}

/// In-memory remote source backed by a JSON dataset.
pub struct DatasetSource {
    devices: Vec<Entity>,
    history: HashMap<String, Vec<LocationRecord>>,
    addresses: HashMap<String, Coordinate>,
}

impl DatasetSource {
    pub async fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read dataset {}", path.display()))?;
        let document: DatasetDocument =
            serde_json::from_slice(&bytes).context("Failed to parse dataset")?;
        let source = Self::from_document(document);
        tracing::info!(
            "Loaded dataset {}: {} devices, {} entities with history",
            path.display(),
            source.devices.len(),
            source.history.len()
        );
        Ok(source)
    }

    pub fn from_document(document: DatasetDocument) -> Self {
        let mut history: HashMap<String, Vec<LocationRecord>> = HashMap::new();
        for record in document.log_records {
            history.entry(record.entity_id.clone()).or_default().push(record);
        }
        for records in history.values_mut() {
            records.sort_by_key(|r| r.date_time);
        }
        let addresses = document
            .addresses
            .into_iter()
            .map(|(address, coordinate)| (normalize_address(&address), coordinate))
            .collect();
        Self {
            devices: document.devices,
            history,
            addresses,
        }
    }

    fn history_for(&self, request: &HistoryRequest) -> Vec<LocationRecord> {
        let window = request.window();
        self.history
            .get(&request.entity_id)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| window.contains(&r.date_time))
                    .take(request.results_limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}

#[async_trait]
impl RemoteSource for DatasetSource {
    async fn fetch_location_history(
        &self,
        requests: &[HistoryRequest],
        _session: &Session,
    ) -> Result<Vec<Vec<LocationRecord>>> {
        Ok(requests.iter().map(|request| self.history_for(request)).collect())
    }

    async fn fetch_devices(&self, filter: &DeviceFilter, _session: &Session) -> Result<Vec<Entity>> {
        Ok(self
            .devices
            .iter()
            .filter(|device| filter.matches(device))
            .cloned()
            .collect())
    }

    async fn geocode(&self, address: &str, _session: &Session) -> Result<Option<Coordinate>> {
        Ok(self.addresses.get(&normalize_address(address)).copied())
    }
}
