use std::net::IpAddr;

use async_trait::async_trait;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Great-circle distance in kilometres.
    pub fn distance_km(&self, other: &Coordinates) -> f64 {
        let (lat1, lat2) = (self.latitude.to_radians(), other.latitude.to_radians());
        let dlat = lat2 - lat1;
        let dlon = (other.longitude - self.longitude).to_radians();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
    }
}

/// Resolves an IP address to a location.
#[async_trait]
pub trait GeoLocator: Send + Sync {
    async fn locate(&self, ip: IpAddr) -> Option<Coordinates>;
}

/// Lookup table of networks to coordinates; the most specific match wins.
#[derive(Debug, Clone, Default)]
pub struct StaticGeoLocator {
    entries: Vec<(IpNet, Coordinates)>,
}

impl StaticGeoLocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(mut self, net: IpNet, coordinates: Coordinates) -> Self {
        self.entries.push((net, coordinates));
        self
    }
}

#[async_trait]
impl GeoLocator for StaticGeoLocator {
    async fn locate(&self, ip: IpAddr) -> Option<Coordinates> {
        self.entries
            .iter()
            .filter(|(net, _)| net.contains(&ip))
            .max_by_key(|(net, _)| net.prefix_len())
            .map(|(_, coords)| *coords)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_between_known_cities() {
        let paris = Coordinates::new(48.8566, 2.3522);
        let london = Coordinates::new(51.5074, -0.1278);
        let d = paris.distance_km(&london);
        assert!((d - 344.0).abs() < 5.0, "got {d}");
        assert_eq!(paris.distance_km(&paris), 0.0);
    }

    #[tokio::test]
    async fn test_static_locator_prefers_most_specific_network() {
        let locator = StaticGeoLocator::new()
            .with_entry("10.0.0.0/8".parse().unwrap(), Coordinates::new(1.0, 1.0))
            .with_entry("10.1.0.0/16".parse().unwrap(), Coordinates::new(2.0, 2.0));
        assert_eq!(
            locator.locate("10.1.2.3".parse().unwrap()).await,
            Some(Coordinates::new(2.0, 2.0))
        );
        assert_eq!(
            locator.locate("10.9.2.3".parse().unwrap()).await,
            Some(Coordinates::new(1.0, 1.0))
        );
        assert_eq!(locator.locate("192.0.2.1".parse().unwrap()).await, None);
    }
}
