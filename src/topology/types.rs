use serde::{Deserialize, Serialize};

/// Best-known position of a client.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoCoordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoCoordinates {
    /// Returns `None` unless latitude is within [-90, 90] and longitude within [-180, 180].
    pub fn new(latitude: f64, longitude: f64) -> Option<Self> {
        let coordinates = Self {
            latitude,
            longitude,
        };
        coordinates.is_valid().then_some(coordinates)
    }

    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.latitude) && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// An edge node: where its gateway is reachable and how to reach its store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub location_id: String,
    /// Base URL of the node's gateway, e.g. `http://10.0.0.7:8080`.
    pub gateway: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_password: Option<String>,
}

impl Node {
    /// Absolute URL of `path` on this node's gateway.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.gateway.trim_end_matches('/'), path)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Area {
    pub area_name: String,
    pub main_location: Node,
    #[serde(default)]
    pub areas: Vec<Area>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Infrastructure {
    /// Area type per depth, outermost first (e.g. `["country", "region", "city"]`).
    pub area_types_identifiers: Vec<String>,
    pub hierarchy: Vec<Area>,
}
