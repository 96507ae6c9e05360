use std::{collections::HashMap, path::Path, path::PathBuf};

use serde::{de, Deserialize, Deserializer};
use snafu::{ResultExt, Snafu};

use crate::fw_upload::{ImageType, UploadPlan, DEFAULT_MAX_CHUNK_BYTES};

// Error returned when loading node configuration files
#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("IO error loading {path}: {source:?}"))]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("Error parsing TOML: {source}"))]
    TomlDeserialization { source: toml::de::Error },
}

/// Represents a store command to write a value to an object
#[derive(Clone, Debug, PartialEq)]
pub struct Store {
    /// Index of the object to be written
    pub index: u16,
    /// Sub index to be written
    pub sub: u8,
    /// The value to be written to the sub object
    pub value: StoreValue,
}

impl Store {
    /// Get the value as bytes
    pub fn raw_value(&self) -> Vec<u8> {
        self.value.raw()
    }
}

/// Value to be stored by a [Store] command
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub enum StoreValue {
    U32(u32),
    U16(u16),
    U8(u8),
    I32(i32),
    I16(i16),
    I8(i8),
    F32(f32),
    String(String),
}

impl StoreValue {
    pub fn raw(&self) -> Vec<u8> {
        match self {
            StoreValue::U32(v) => v.to_le_bytes().to_vec(),
            StoreValue::U16(v) => v.to_le_bytes().to_vec(),
            StoreValue::U8(v) => vec![*v],
            StoreValue::I32(v) => v.to_le_bytes().to_vec(),
            StoreValue::I16(v) => v.to_le_bytes().to_vec(),
            StoreValue::I8(v) => vec![*v as u8],
            StoreValue::F32(v) => v.to_le_bytes().to_vec(),
            StoreValue::String(ref s) => s.as_bytes().to_vec(),
        }
    }
}

/// A node configuration
///
/// Represents a runtime configuration which can be loaded into a node
///
/// It describes the configuration of PDOs, and other arbitrary objects on the node
#[derive(Debug, Clone)]
pub struct NodeConfig(NodeConfigSerializer);

impl NodeConfig {
    /// Read a configuration from a file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<NodeConfig, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).context(IoSnafu {
            path: path.to_string_lossy(),
        })?;
        Self::load_from_str(&content)
    }

    /// Read a configuration from a string
    pub fn load_from_str(s: &str) -> Result<NodeConfig, ConfigError> {
        let raw_config: NodeConfigSerializer =
            toml::from_str(s).context(TomlDeserializationSnafu)?;

        Ok(NodeConfig(raw_config))
    }

    /// Get the transmit PDO configurations
    pub fn tpdos(&self) -> &HashMap<usize, PdoConfig> {
        &self.0.tpdo
    }

    /// Get the receive PDO configurations
    pub fn rpdos(&self) -> &HashMap<usize, PdoConfig> {
        &self.0.rpdo
    }

    /// Get the object configurations
    ///
    /// Each store represents a value to be written to a specific sub object during configuration
    pub fn stores(&self) -> &[Store] {
        &self.0.store
    }
}

/// A manifest describing one or more firmware uploads, loaded from a TOML file
///
/// Lets an operator drive firmware upload to several nodes from a single file instead of
/// passing image path, bank and version on the command line for each node in turn.
#[derive(Debug, Clone)]
pub struct FirmwarePlan(Vec<FirmwarePlanEntry>);

impl FirmwarePlan {
    /// Read a firmware upload plan from a file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<FirmwarePlan, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).context(IoSnafu {
            path: path.to_string_lossy(),
        })?;
        Self::load_from_str(&content)
    }

    /// Read a firmware upload plan from a string
    pub fn load_from_str(s: &str) -> Result<FirmwarePlan, ConfigError> {
        let raw: FirmwarePlanSerializer = toml::from_str(s).context(TomlDeserializationSnafu)?;
        Ok(FirmwarePlan(raw.upload))
    }

    /// The individual upload entries, in manifest order
    pub fn entries(&self) -> &[FirmwarePlanEntry] {
        &self.0
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FirmwarePlanSerializer {
    #[serde(default)]
    upload: Vec<FirmwarePlanEntry>,
}

/// One node's entry in a [FirmwarePlan]
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FirmwarePlanEntry {
    /// The CANopen node ID to upload the image to
    pub node_id: u8,
    /// Path to the firmware image on disk, relative to the manifest unless absolute
    pub image: PathBuf,
    /// Which image slot this upload targets
    #[serde(default)]
    pub image_type: FirmwarePlanImageType,
    /// Flash bank to write the image to, for nodes with multiple banks
    #[serde(default)]
    pub target_bank: u8,
    /// Version number recorded alongside the image, compared against the node's reported
    /// version to decide whether the upload can be skipped
    pub firmware_version: u16,
    /// Override the chunk size used for SDO segmented transfer of this image
    pub max_chunk_bytes: Option<usize>,
    /// CRC the node is expected to already be running, if known in advance
    ///
    /// When set, this overrides the CRC computed from the image on disk, so a manifest can pin a
    /// known-good checksum instead of trusting a recompute of the file at upload time.
    pub expected_crc: Option<u16>,
}

impl FirmwarePlanEntry {
    /// Build an [UploadPlan] for this entry
    pub fn to_upload_plan(&self) -> UploadPlan {
        UploadPlan {
            firmware_path: self.image.clone(),
            node_id: self.node_id,
            image_type: self.image_type.into(),
            target_bank: self.target_bank,
            max_chunk_bytes: self.max_chunk_bytes.unwrap_or(DEFAULT_MAX_CHUNK_BYTES),
            firmware_version: self.firmware_version,
            expected_crc: self.expected_crc,
        }
    }
}

/// Which image slot a [FirmwarePlanEntry] targets
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FirmwarePlanImageType {
    #[default]
    Main,
    Bootloader,
    Config,
}

impl From<FirmwarePlanImageType> for ImageType {
    fn from(value: FirmwarePlanImageType) -> Self {
        match value {
            FirmwarePlanImageType::Main => ImageType::Main,
            FirmwarePlanImageType::Bootloader => ImageType::Bootloader,
            FirmwarePlanImageType::Config => ImageType::Config,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NodeConfigSerializer {
    #[serde(deserialize_with = "deserialize_pdo_map", default)]
    pub tpdo: HashMap<usize, PdoConfig>,
    #[serde(deserialize_with = "deserialize_pdo_map", default)]
    pub rpdo: HashMap<usize, PdoConfig>,
    #[serde(default, deserialize_with = "deserialize_store")]
    pub store: Vec<Store>,
}

/// Represents the configuration parameters for a single PDO
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PdoConfig {
    /// The COB ID this PDO will use to send/receive
    pub cob: u32,
    /// The PDO is active
    pub enabled: bool,
    /// List of mapping specifying what sub objects are mapped to this PDO
    pub mappings: Vec<PdoMapping>,
    /// Specifies when a PDO is sent or latched
    ///
    /// - 0: Sent in response to sync, but only after an application specific event (e.g. it may be
    ///   sent when the value changes, but not when it has not)
    /// - 1 - 240: Sent in response to every Nth sync
    /// - 254: Event driven (application to send it whenever it wants)
    pub transmission_type: u8,
}

/// Represents a PDO mapping
///
/// Each mapping specifies one sub-object to be included in the PDO.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PdoMapping {
    /// The object index
    pub index: u16,
    /// The object sub index
    pub sub: u8,
    /// The size of the object to map, in **bits**
    pub size: u8,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum StoreType {
    U32,
    U16,
    U8,
    I32,
    I16,
    I8,
    F32,
    String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StoreSerializer {
    pub index: u16,
    pub sub: u8,
    pub value: toml::Value,
    #[serde(rename = "type")]
    pub ty: StoreType,
}

fn deserialize_store<'de, D>(deserializer: D) -> Result<Vec<Store>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw_store = Vec::<StoreSerializer>::deserialize(deserializer)?;

    let store = raw_store
        .into_iter()
        .map(|raw| {
            let value = match raw.ty {
                StoreType::U32 => {
                    let value = raw.value.as_integer().ok_or(de::Error::invalid_type(
                        de::Unexpected::Str(&raw.value.to_string()),
                        &"an integer",
                    ))?;
                    Ok(StoreValue::U32(value.try_into().map_err(|_| {
                        de::Error::invalid_value(
                            de::Unexpected::Signed(value),
                            &"an integer in range [0..2^32]",
                        )
                    })?))
                }
                StoreType::U16 => {
                    let value = raw.value.as_integer().ok_or(de::Error::invalid_type(
                        de::Unexpected::Str(&raw.value.to_string()),
                        &"an integer",
                    ))?;
                    Ok(StoreValue::U16(value.try_into().map_err(|_| {
                        de::Error::invalid_value(
                            de::Unexpected::Signed(value),
                            &"an integer in range [0..65536]",
                        )
                    })?))
                }
                StoreType::U8 => {
                    let value = raw.value.as_integer().ok_or(de::Error::invalid_type(
                        de::Unexpected::Str(&raw.value.to_string()),
                        &"an integer",
                    ))?;
                    Ok(StoreValue::U8(value.try_into().map_err(|_| {
                        de::Error::invalid_value(
                            de::Unexpected::Signed(value),
                            &"an integer in range [0..256]",
                        )
                    })?))
                }
                StoreType::I32 => {
                    let value = raw.value.as_integer().ok_or(de::Error::invalid_type(
                        de::Unexpected::Str(&raw.value.to_string()),
                        &"an integer",
                    ))?;
                    Ok(StoreValue::I32(value.try_into().map_err(|_| {
                        de::Error::invalid_value(
                            de::Unexpected::Signed(value),
                            &"an integer in range [-2^31..2^31]",
                        )
                    })?))
                }
                StoreType::I16 => {
                    let value = raw.value.as_integer().ok_or(de::Error::invalid_type(
                        de::Unexpected::Str(&raw.value.to_string()),
                        &"an integer",
                    ))?;
                    Ok(StoreValue::I16(value.try_into().map_err(|_| {
                        de::Error::invalid_value(
                            de::Unexpected::Signed(value),
                            &"an integer in range [-32767..32768]",
                        )
                    })?))
                }
                StoreType::I8 => {
                    let value = raw.value.as_integer().ok_or(de::Error::invalid_type(
                        de::Unexpected::Str(&raw.value.to_string()),
                        &"an integer",
                    ))?;
                    Ok(StoreValue::I8(value.try_into().map_err(|_| {
                        de::Error::invalid_value(
                            de::Unexpected::Signed(value),
                            &"an integer in range [-127..128]",
                        )
                    })?))
                }
                StoreType::F32 => {
                    let value = raw.value.as_float().ok_or(de::Error::invalid_type(
                        de::Unexpected::Str(&raw.value.to_string()),
                        &"a float",
                    ))?;
                    Ok(StoreValue::F32(value as f32))
                }
                StoreType::String => {
                    let value = raw.value.as_str().ok_or(de::Error::invalid_type(
                        de::Unexpected::Str(&raw.value.to_string()),
                        &"a string",
                    ))?;
                    Ok(StoreValue::String(value.to_string()))
                }
            }?;
            Ok(Store {
                index: raw.index,
                sub: raw.sub,
                value,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(store)
}

fn deserialize_pdo_map<'de, D>(deserializer: D) -> Result<HashMap<usize, PdoConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    let str_map = HashMap::<String, PdoConfig>::deserialize(deserializer)?;
    let original_len = str_map.len();
    let data = {
        str_map
            .into_iter()
            .map(|(str_key, value)| match str_key.parse() {
                Ok(int_key) => Ok((int_key, value)),
                Err(_) => Err({
                    de::Error::invalid_value(
                        de::Unexpected::Str(&str_key),
                        &"a non-negative integer",
                    )
                }),
            })
            .collect::<Result<HashMap<_, _>, _>>()?
    };
    // multiple strings could parse to the same int, e.g "0" and "00"
    if data.len() < original_len {
        return Err(de::Error::custom("detected duplicate integer key"));
    }
    Ok(data)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_node_config_parse() {
        let str = r#"
        [tpdo.0]
        enabled = true
        cob = 0x810
        transmission_type = 254
        mappings = [
            { index=0x1000, sub=1, size=8 },
            { index=0x1000, sub=2, size=16 },
        ]

        [[store]]
        type = "u32"
        value = 12
        index = 0x1000
        sub = 0
        "#;

        let config = match NodeConfig::load_from_str(str) {
            Ok(config) => config,
            Err(e) => {
                println!("{}", e);
                panic!("Failed to parse config");
            }
        };

        println!("{config:?}");
        assert_eq!(1, config.tpdos().len());
        assert_eq!(1, config.stores().len());
    }

    #[test]
    fn test_firmware_plan_parse() {
        let str = r#"
        [[upload]]
        node_id = 0x10
        image = "images/main.bin"
        firmware_version = 3

        [[upload]]
        node_id = 0x11
        image = "images/bootloader.bin"
        image_type = "bootloader"
        target_bank = 1
        firmware_version = 1
        max_chunk_bytes = 128
        expected_crc = 0x29B1
        "#;

        let plan = FirmwarePlan::load_from_str(str).expect("plan should parse");
        let entries = plan.entries();
        assert_eq!(2, entries.len());

        assert_eq!(0x10, entries[0].node_id);
        assert_eq!(FirmwarePlanImageType::Main, entries[0].image_type);
        assert_eq!(0, entries[0].target_bank);
        let upload_plan = entries[0].to_upload_plan();
        assert_eq!(DEFAULT_MAX_CHUNK_BYTES, upload_plan.max_chunk_bytes);
        assert_eq!(None, entries[0].expected_crc);

        assert_eq!(0x11, entries[1].node_id);
        assert_eq!(FirmwarePlanImageType::Bootloader, entries[1].image_type);
        assert_eq!(1, entries[1].target_bank);
        assert_eq!(Some(128), entries[1].max_chunk_bytes);
        assert_eq!(Some(0x29B1), entries[1].expected_crc);
        assert_eq!(Some(0x29B1), entries[1].to_upload_plan().expected_crc);
    }

    #[test]
    fn test_out_of_range_integer() {
        let str = r#"
        [[store]]
        type = "u8"
        value = 256
        index = 0x1000
        sub = 0
        "#;

        let result = NodeConfig::load_from_str(str);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("expected an integer in range [0..256]"));
    }
}
