//! Virtual file server for customized host images.
//!
//! Images are never written to disk. The registry only remembers the network data for each
//! logical image name; the bytes are produced by a [`StreamFactory`] every time a file is opened.

mod filesystem;
mod stream;

pub use filesystem::{Entry, ImageFile, ImageFileSystem, OpenError, RootDirectory};
pub use stream::{EmbeddedPayloadFactory, PayloadError, StreamFactory};

#[cfg(test)]
pub(crate) use stream::testing;

use crate::secret_bytes::SecretBytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid image name {0:?}")]
    InvalidName(String),
    #[error(transparent)]
    InvalidPayload(#[from] PayloadError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredImage {
    pub name: String,
    pub network_data: SecretBytes,
}

#[derive(Default)]
struct Images {
    index: HashMap<String, usize>,
    entries: Vec<RegisteredImage>,
}

/// Process-wide mapping from image name to network data, shared by the reconciler and the
/// HTTP server.
pub struct ImageRegistry {
    base_url: String,
    factory: Arc<dyn StreamFactory>,
    images: Mutex<Images>,
}

impl ImageRegistry {
    pub fn new(base_url: impl Into<String>, factory: Arc<dyn StreamFactory>) -> Self {
        Self {
            base_url: base_url.into(),
            factory,
            images: Mutex::new(Images::default()),
        }
    }

    /// Registers (or replaces) the network data served under `name` and returns its public URL.
    pub fn register(&self, name: &str, network_data: SecretBytes) -> Result<String, RegistryError> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(RegistryError::InvalidName(name.to_string()));
        }
        self.factory.validate(network_data.expose_secret())?;

        let replaced = {
            let mut images = self.lock();
            let images = &mut *images;
            match images.index.get(name) {
                Some(&position) => {
                    images.entries[position].network_data = network_data;
                    true
                }
                None => {
                    images.index.insert(name.to_string(), images.entries.len());
                    images.entries.push(RegisteredImage {
                        name: name.to_string(),
                        network_data,
                    });
                    false
                }
            }
        };

        let url = self.url_for(name);
        if replaced {
            debug!("Updated network data of image {}", name);
        } else {
            info!("Registered image {} at {}", name, url);
        }
        Ok(url)
    }

    pub fn lookup(&self, name: &str) -> Option<RegisteredImage> {
        let images = self.lock();
        images
            .index
            .get(name)
            .map(|&position| images.entries[position].clone())
    }

    /// All images in the order their names were first registered.
    pub fn list(&self) -> Vec<RegisteredImage> {
        self.lock().entries.clone()
    }

    pub fn url_for(&self, name: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), name)
    }

    // The map is never left half-updated, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, Images> {
        self.images.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::PrefixFactory;
    use super::*;
    use std::thread;

    fn registry() -> ImageRegistry {
        ImageRegistry::new(
            "http://localhost:8080",
            Arc::new(PrefixFactory::new(b"base:")),
        )
    }

    #[test]
    fn test_register_returns_url() {
        let url = registry()
            .register(
                "host-xyz-45.qcow",
                SecretBytes::from(b"asietonarst".as_slice()),
            )
            .expect("Should register");
        assert_eq!(url, "http://localhost:8080/host-xyz-45.qcow");
    }

    #[test]
    fn test_url_ignores_trailing_slash() {
        let registry =
            ImageRegistry::new("http://images.example/", Arc::new(PrefixFactory::new(b"")));
        assert_eq!(registry.url_for("a.qcow"), "http://images.example/a.qcow");
    }

    #[test]
    fn test_register_is_upsert() {
        let registry = registry();
        registry
            .register("first.qcow", SecretBytes::from(b"one".as_slice()))
            .unwrap();
        registry
            .register("second.qcow", SecretBytes::from(b"two".as_slice()))
            .unwrap();
        registry
            .register("first.qcow", SecretBytes::from(b"three".as_slice()))
            .unwrap();

        let names: Vec<_> = registry.list().into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["first.qcow", "second.qcow"]);
        assert_eq!(
            registry.lookup("first.qcow").unwrap().network_data.expose_secret(),
            b"three"
        );
    }

    #[test]
    fn test_lookup_miss() {
        assert_eq!(registry().lookup("missing.qcow"), None);
    }

    #[test]
    fn test_invalid_names_are_rejected() {
        let registry = registry();
        for name in ["", ".", "..", "a/b.qcow"] {
            let err = registry.register(name, SecretBytes::default()).unwrap_err();
            assert!(matches!(err, RegistryError::InvalidName(_)), "{}", name);
        }
        assert!(registry.list().is_empty());
    }

    #[test]
    fn test_payload_rejected_by_factory() {
        let registry = registry();
        let err = registry
            .register("big.qcow", SecretBytes::from(vec![0u8; 2048]))
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidPayload(_)));
        assert_eq!(registry.lookup("big.qcow"), None);
    }

    #[test]
    fn test_concurrent_registrations() {
        let registry = Arc::new(registry());
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let registry = registry.clone();
                thread::spawn(move || {
                    for round in 0..50 {
                        let payload = format!("{}-{}", worker, round).into_bytes();
                        registry
                            .register(&format!("host-{}.qcow", worker), SecretBytes::from(payload))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.list().len(), 8);
        for worker in 0..8 {
            let image = registry.lookup(&format!("host-{}.qcow", worker)).unwrap();
            assert_eq!(
                image.network_data.expose_secret(),
                format!("{}-49", worker).as_bytes()
            );
        }
    }
}
