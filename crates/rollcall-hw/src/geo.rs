//! Geolocation providers for machines without a positioning service.

use rollcall_core::{GeoError, GeoOptions, GeoPosition, GeolocationProvider};

/// Reports a configured position, e.g. the lecture hall a kiosk is bolted into.
#[derive(Debug, Clone, Copy)]
pub struct FixedLocation {
    position: GeoPosition,
}

impl FixedLocation {
    pub fn new(latitude: f64, longitude: f64, accuracy: f64) -> Self {
        Self {
            position: GeoPosition {
                latitude,
                longitude,
                accuracy,
            },
        }
    }
}

impl GeolocationProvider for FixedLocation {
    fn current_position(&self, _options: &GeoOptions) -> Result<GeoPosition, GeoError> {
        Ok(self.position)
    }
}

/// Always fails with the given error.
#[derive(Debug, Clone, Copy)]
pub struct NoLocation(pub GeoError);

impl Default for NoLocation {
    fn default() -> Self {
        Self(GeoError::Unavailable)
    }
}

impl GeolocationProvider for NoLocation {
    fn current_position(&self, _options: &GeoOptions) -> Result<GeoPosition, GeoError> {
        Err(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_location() {
        let provider = FixedLocation::new(6.52, 3.37, 25.0);
        let pos = provider.current_position(&GeoOptions::default()).unwrap();
        assert_eq!(pos.latitude, 6.52);
        assert_eq!(pos.longitude, 3.37);
        assert_eq!(pos.accuracy, 25.0);
    }

    #[test]
    fn test_no_location() {
        let options = GeoOptions::default();
        assert_eq!(
            NoLocation::default().current_position(&options),
            Err(GeoError::Unavailable)
        );
        assert_eq!(
            NoLocation(GeoError::PermissionDenied).current_position(&options),
            Err(GeoError::PermissionDenied)
        );
    }
}
