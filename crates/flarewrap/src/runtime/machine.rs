//! Machine model.

use flarewrap_common::{FlarewrapError, FlarewrapResult, Name};
use flarewrap_image::Image;
use serde::{Deserialize, Serialize};

/// Storage backend of a machine's root drive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// Block image or mounted directory, per configured strategy.
    #[default]
    Default,
}

/// Resource envelope of a microVM and the image to boot it from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    /// Virtual CPUs.
    pub cpu_cores: u32,
    /// Memory in megabytes.
    pub memory_mb: u64,
    /// Root drive size in megabytes.
    pub storage_mb: u64,
    /// Root drive backend.
    pub storage_type: StorageType,
    /// Machine name.
    pub name: Name,
    /// Logical image name or image reference.
    pub image: String,
}

impl Machine {
    /// Describe a machine booting `image`.
    ///
    /// # Errors
    ///
    /// Returns [`FlarewrapError::Config`] for zero sizes or an empty
    /// image, and [`FlarewrapError::InvalidName`] for an unsafe name.
    pub fn new(
        cpu_cores: u32,
        memory_mb: u64,
        storage_mb: u64,
        name: &str,
        image: impl Into<String>,
    ) -> FlarewrapResult<Self> {
        let name = Name::new(name)?;
        let image = image.into();

        for (field, value) in [
            ("cpu_cores", u64::from(cpu_cores)),
            ("memory_mb", memory_mb),
            ("storage_mb", storage_mb),
        ] {
            if value == 0 {
                return Err(FlarewrapError::Config {
                    message: format!("machine {name}: {field} must be positive"),
                });
            }
        }
        if image.trim().is_empty() {
            return Err(FlarewrapError::Config {
                message: format!("machine {name}: image must not be empty"),
            });
        }

        Ok(Self {
            cpu_cores,
            memory_mb,
            storage_mb,
            storage_type: StorageType::Default,
            name,
            image,
        })
    }

    /// Describe a machine booting a known image, by its logical name.
    ///
    /// # Errors
    ///
    /// See [`Self::new`].
    pub fn for_image(
        cpu_cores: u32,
        memory_mb: u64,
        storage_mb: u64,
        name: &str,
        image: &Image,
    ) -> FlarewrapResult<Self> {
        Self::new(cpu_cores, memory_mb, storage_mb, name, image.logical_name().as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_uses_logical_name() {
        let image = Image::new("alpine:latest", "alpine").unwrap();
        let machine = Machine::for_image(1, 512, 5120, "default", &image).unwrap();
        assert_eq!(machine.image, "alpine");
        assert_eq!(machine.storage_type, StorageType::Default);
    }

    #[test]
    fn zero_sizes_and_bad_names_are_rejected() {
        assert!(matches!(
            Machine::new(0, 512, 1024, "vm", "alpine"),
            Err(FlarewrapError::Config { .. })
        ));
        assert!(Machine::new(1, 512, 0, "vm", "alpine").is_err());
        assert!(Machine::new(1, 512, 1024, "vm", " ").is_err());
        assert!(matches!(
            Machine::new(1, 512, 1024, "../vm", "alpine"),
            Err(FlarewrapError::InvalidName { .. })
        ));
    }

    #[test]
    fn json_field_names() {
        let machine = Machine::new(2, 1024, 2048, "web", "nginx:1.27").unwrap();
        let json = serde_json::to_value(&machine).unwrap();
        assert_eq!(json["cpu_cores"], 2);
        assert_eq!(json["storage_type"], "default");
        assert_eq!(json["image"], "nginx:1.27");
    }
}
