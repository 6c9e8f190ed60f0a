use std::collections::HashMap;
use std::sync::Arc;

use log::warn;

use crate::protocol::astm::{AstmMessage, MessageType};
use crate::protocol::Result;

/// A record codec variant.
///
/// Instruments name a driver key in configuration; the registry maps the
/// key to one of a closed set of codecs. Variants tune how messages are
/// parsed and emitted for a vendor without touching the link layer.
pub trait RecordDriver: Send + Sync {
    /// Stable registry key
    fn name(&self) -> &'static str;

    /// Sender identification emitted in generated headers (keep-alives)
    fn sender_id(&self) -> &str;

    /// Decode one complete transmission into the record aggregate
    fn parse(&self, content: &[u8], instrument_name: &str) -> Result<AstmMessage>;

    /// Encode a message for transmission, renumbering record sequences
    fn build(&self, message: &AstmMessage) -> Vec<u8>;

    /// Cheap classification used for the audit row written before parsing
    fn quick_classify(&self, content: &[u8]) -> MessageType {
        crate::protocol::astm::quick_classify(content)
    }
}

/// The standard LIS2-A codec
pub struct Lis2aDriver {
    sender_id: String,
}

impl Lis2aDriver {
    pub fn new() -> Self {
        Self {
            sender_id: "LIS^ASTM-INTERFACE^1.0".to_string(),
        }
    }
}

impl Default for Lis2aDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordDriver for Lis2aDriver {
    fn name(&self) -> &'static str {
        "lis2a"
    }

    fn sender_id(&self) -> &str {
        &self.sender_id
    }

    fn parse(&self, content: &[u8], instrument_name: &str) -> Result<AstmMessage> {
        AstmMessage::parse(content, instrument_name)
    }

    fn build(&self, message: &AstmMessage) -> Vec<u8> {
        let mut message = message.clone();
        message.renumber_for_send();
        message.serialize()
    }
}

/// Codec variant for Ortho Vision blood-grouping analyzers. The record
/// layer is plain LIS2-A; only the announced sender identification differs.
pub struct OrthoVisionDriver {
    inner: Lis2aDriver,
    sender_id: String,
}

impl OrthoVisionDriver {
    pub fn new() -> Self {
        Self {
            inner: Lis2aDriver::new(),
            sender_id: "OCD^VISION^LIS^1.0".to_string(),
        }
    }
}

impl Default for OrthoVisionDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordDriver for OrthoVisionDriver {
    fn name(&self) -> &'static str {
        "ortho-vision"
    }

    fn sender_id(&self) -> &str {
        &self.sender_id
    }

    fn parse(&self, content: &[u8], instrument_name: &str) -> Result<AstmMessage> {
        self.inner.parse(content, instrument_name)
    }

    fn build(&self, message: &AstmMessage) -> Vec<u8> {
        self.inner.build(message)
    }
}

/// Closed set of codec variants, registered at startup and selected by the
/// configuration's driver key
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn RecordDriver>>,
    default_key: String,
}

impl DriverRegistry {
    /// Registry holding the built-in drivers
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            drivers: HashMap::new(),
            default_key: "lis2a".to_string(),
        };
        registry.register(Arc::new(Lis2aDriver::new()));
        registry.register(Arc::new(OrthoVisionDriver::new()));
        registry
    }

    pub fn register(&mut self, driver: Arc<dyn RecordDriver>) {
        self.drivers.insert(driver.name().to_string(), driver);
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn RecordDriver>> {
        self.drivers.get(key).cloned()
    }

    /// Look up a driver, falling back to the default codec for unknown keys
    pub fn resolve(&self, key: &str) -> Arc<dyn RecordDriver> {
        if let Some(driver) = self.get(key) {
            return driver;
        }
        warn!(
            "Unknown driver key {:?}, falling back to {}",
            key, self.default_key
        );
        self.drivers
            .get(&self.default_key)
            .cloned()
            .expect("default driver is always registered")
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_resolves_known_keys() {
        let registry = DriverRegistry::with_defaults();
        assert_eq!(registry.resolve("lis2a").name(), "lis2a");
        assert_eq!(registry.resolve("ortho-vision").name(), "ortho-vision");
    }

    #[test]
    fn test_unknown_key_falls_back_to_default() {
        let registry = DriverRegistry::with_defaults();
        assert_eq!(
            registry.resolve("com.vendor.SomeDriverClass").name(),
            "lis2a"
        );
        assert!(registry.get("com.vendor.SomeDriverClass").is_none());
    }

    #[test]
    fn test_build_renumbers_sequences() {
        let driver = Lis2aDriver::new();
        let content = b"H|\\^&\rO|7|S1||ABO|N\rL|1|N\r";
        let message = driver.parse(content, "vision-1").unwrap();
        let rebuilt = driver.build(&message);
        let text = String::from_utf8(rebuilt).unwrap();
        assert!(text.contains("O|1|S1||ABO|N"));
    }
}
