//! Firmware upload orchestration
//!
//! A firmware image is pushed to a node's bootloader through four manufacturer-specific SDO
//! objects: metadata (0x1F57), a start token (0x1F51), a stream of data chunks (0x1F50), and a
//! finalize request carrying the expected CRC (0x1F5A). Before transferring anything, the master
//! reads back the node's currently stored CRC and firmware version (0x1F5B, 0x1F5C) and skips the
//! upload entirely if both already match, so that re-running commissioning on an already-updated
//! fleet does not re-flash every node.

use snafu::{ResultExt, Snafu};

use crate::sdo_client::{SdoClient, SdoClientError};
use canmaster_common::constants::object_ids::{
    FW_DATA as OBJ_FW_DATA, FW_FINALIZE as OBJ_FW_FINALIZE, FW_METADATA as OBJ_FW_METADATA,
    FW_REMOTE_CRC as OBJ_FW_REMOTE_CRC, FW_REMOTE_VERSION as OBJ_FW_REMOTE_VERSION,
    FW_START as OBJ_FW_START,
};
use canmaster_common::traits::{AsyncCanReceiver, AsyncCanSender};

/// The token written to [`OBJ_FW_START`] to begin a transfer session
const START_TOKEN: [u8; 3] = [0x01, 0x00, 0x00];

/// Default chunk size used for [`OBJ_FW_DATA`] writes when a plan does not override it
pub const DEFAULT_MAX_CHUNK_BYTES: usize = 256;

/// Identifies which image on the node a firmware upload targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ImageType {
    /// The main application image
    Main = 0,
    /// The bootloader image
    Bootloader = 1,
    /// A configuration blob, not executable firmware
    Config = 2,
}

/// Describes a single firmware upload to be performed on a node
#[derive(Debug, Clone)]
pub struct UploadPlan {
    /// Path to the firmware image on disk
    pub firmware_path: std::path::PathBuf,
    /// The node ID to upload to
    pub node_id: u8,
    /// Which image slot this upload targets
    pub image_type: ImageType,
    /// The flash bank the image should be written to
    pub target_bank: u8,
    /// Maximum number of bytes sent per [`OBJ_FW_DATA`] write
    pub max_chunk_bytes: usize,
    /// The version number to record alongside the image
    pub firmware_version: u16,
    /// CRC the node is expected to already be running, if known
    ///
    /// When set, this value is used directly instead of being recomputed from the image
    /// contents, mirroring a manifest-supplied override of the on-disk image's checksum.
    pub expected_crc: Option<u16>,
}

impl UploadPlan {
    /// Create a plan using the default chunk size and no CRC override
    pub fn new(
        firmware_path: impl Into<std::path::PathBuf>,
        node_id: u8,
        image_type: ImageType,
        target_bank: u8,
        firmware_version: u16,
    ) -> Self {
        Self {
            firmware_path: firmware_path.into(),
            node_id,
            image_type,
            target_bank,
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
            firmware_version,
            expected_crc: None,
        }
    }
}

/// Error returned by [`upload_firmware`] or a [`FirmwareTransport`] implementation
#[derive(Debug, Snafu)]
pub enum FwUploadError {
    /// The underlying SDO transfer failed
    #[snafu(display("SDO error writing {object:#06x} during firmware upload: {source}"))]
    Sdo {
        /// The object index being accessed when the error occurred
        object: u16,
        /// The underlying SDO error
        source: SdoClientError,
    },
    /// The firmware image was empty
    EmptyImage,
}

/// Abstracts the SDO calls used to push a firmware image to a node
///
/// The production implementation, [`SdoFirmwareTransport`], talks to a real node over SDO. Tests
/// can substitute a mock to assert the exact sequence and contents of the calls made, without a
/// live bus.
pub trait FirmwareTransport {
    /// Write the upload metadata: size, CRC, image type, target bank, and version
    fn send_metadata(
        &mut self,
        size: u32,
        crc: u16,
        image_type: ImageType,
        target_bank: u8,
        version: u16,
    ) -> impl core::future::Future<Output = Result<(), FwUploadError>>;

    /// Signal the node to begin accepting data chunks
    fn send_start_command(&mut self) -> impl core::future::Future<Output = Result<(), FwUploadError>>;

    /// Send one chunk of firmware data
    fn send_chunk(&mut self, data: &[u8]) -> impl core::future::Future<Output = Result<(), FwUploadError>>;

    /// Finalize the transfer, providing the CRC of the complete image
    fn send_finalize_request(&mut self, crc: u16) -> impl core::future::Future<Output = Result<(), FwUploadError>>;

    /// Read back the CRC of the firmware currently stored on the node
    fn query_remote_crc(&mut self) -> impl core::future::Future<Output = Result<u16, FwUploadError>>;

    /// Read back the version of the firmware currently stored on the node
    fn query_remote_version(&mut self) -> impl core::future::Future<Output = Result<u16, FwUploadError>>;
}

/// A [`FirmwareTransport`] backed by a live [`SdoClient`]
#[derive(Debug)]
pub struct SdoFirmwareTransport<C> {
    client: C,
}

impl<C> SdoFirmwareTransport<C> {
    /// Wrap an SDO client (or a guard that derefs to one) for use as a firmware transport
    pub fn new(client: C) -> Self {
        Self { client }
    }
}

impl<C, S, R> FirmwareTransport for SdoFirmwareTransport<C>
where
    C: core::ops::DerefMut<Target = SdoClient<S, R>> + Send,
    S: AsyncCanSender,
    R: AsyncCanReceiver,
{
    async fn send_metadata(
        &mut self,
        size: u32,
        crc: u16,
        image_type: ImageType,
        target_bank: u8,
        version: u16,
    ) -> Result<(), FwUploadError> {
        let mut payload = [0u8; 10];
        payload[0..4].copy_from_slice(&size.to_le_bytes());
        payload[4..6].copy_from_slice(&crc.to_le_bytes());
        payload[6] = image_type as u8;
        payload[7] = target_bank;
        payload[8..10].copy_from_slice(&version.to_le_bytes());

        self.client
            .download(OBJ_FW_METADATA, 0, &payload)
            .await
            .context(SdoSnafu {
                object: OBJ_FW_METADATA,
            })
    }

    async fn send_start_command(&mut self) -> Result<(), FwUploadError> {
        self.client
            .download(OBJ_FW_START, 0, &START_TOKEN)
            .await
            .context(SdoSnafu {
                object: OBJ_FW_START,
            })
    }

    async fn send_chunk(&mut self, data: &[u8]) -> Result<(), FwUploadError> {
        self.client
            .download(OBJ_FW_DATA, 0, data)
            .await
            .context(SdoSnafu {
                object: OBJ_FW_DATA,
            })
    }

    async fn send_finalize_request(&mut self, crc: u16) -> Result<(), FwUploadError> {
        self.client
            .download(OBJ_FW_FINALIZE, 0, &crc.to_le_bytes())
            .await
            .context(SdoSnafu {
                object: OBJ_FW_FINALIZE,
            })
    }

    async fn query_remote_crc(&mut self) -> Result<u16, FwUploadError> {
        self.client
            .upload_u16(OBJ_FW_REMOTE_CRC, 1)
            .await
            .context(SdoSnafu {
                object: OBJ_FW_REMOTE_CRC,
            })
    }

    async fn query_remote_version(&mut self) -> Result<u16, FwUploadError> {
        self.client
            .upload_u16(OBJ_FW_REMOTE_VERSION, 1)
            .await
            .context(SdoSnafu {
                object: OBJ_FW_REMOTE_VERSION,
            })
    }
}

/// CRC-16/CCITT-FALSE (poly 0x1021, init 0xFFFF, no final XOR)
///
/// This is the checksum the firmware's bootloader validates images against. It is distinct from
/// the XMODEM variant (init 0x0000) used elsewhere in the SDO block transfer protocol.
#[derive(Debug, Clone, Copy)]
pub struct Crc16Ccitt {
    crc: u16,
}

impl Default for Crc16Ccitt {
    fn default() -> Self {
        Self { crc: 0xFFFF }
    }
}

impl Crc16Ccitt {
    /// Start a new running CRC
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold additional bytes into the running CRC
    pub fn update(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.crc ^= (byte as u16) << 8;
            for _ in 0..8 {
                if self.crc & 0x8000 != 0 {
                    self.crc = (self.crc << 1) ^ 0x1021;
                } else {
                    self.crc <<= 1;
                }
            }
        }
    }

    /// Finish and return the CRC value
    pub fn finalize(self) -> u16 {
        self.crc
    }

    /// Compute the CRC of a complete buffer in one call
    pub fn of(data: &[u8]) -> u16 {
        let mut crc = Self::new();
        crc.update(data);
        crc.finalize()
    }
}

/// Run a full firmware upload session against `transport`
///
/// Splits `data` into `plan.max_chunk_bytes`-sized chunks and sends metadata, a start token, each
/// chunk in order, and a final CRC, in that order. The CRC is taken from `plan.expected_crc` when
/// present and non-zero; otherwise it is computed from `data`. The caller is responsible for the
/// pre-check that decides whether an upload is needed at all; see [`needs_upload`].
pub async fn upload_firmware<T: FirmwareTransport>(
    transport: &mut T,
    plan: &UploadPlan,
    data: &[u8],
) -> Result<(), FwUploadError> {
    if data.is_empty() {
        return EmptyImageSnafu.fail();
    }

    let crc = match plan.expected_crc {
        Some(crc) if crc != 0 => crc,
        _ => Crc16Ccitt::of(data),
    };

    transport
        .send_metadata(
            data.len() as u32,
            crc,
            plan.image_type,
            plan.target_bank,
            plan.firmware_version,
        )
        .await?;
    transport.send_start_command().await?;

    for chunk in data.chunks(plan.max_chunk_bytes.max(1)) {
        transport.send_chunk(chunk).await?;
    }

    transport.send_finalize_request(crc).await?;

    Ok(())
}

/// Decide whether a node already has the target firmware installed
///
/// Returns `false` (no upload needed) only when both the remote CRC and remote version match the
/// expected values; otherwise logs which check failed and returns `true`.
pub async fn needs_upload<T: FirmwareTransport>(
    transport: &mut T,
    node_id: u8,
    expected_crc: u16,
    expected_version: u16,
) -> bool {
    let remote_crc = transport.query_remote_crc().await;
    let remote_version = transport.query_remote_version().await;

    match (remote_crc, remote_version) {
        (Ok(crc), Ok(version)) if crc == expected_crc && version == expected_version => {
            log::info!("Node {node_id} already running firmware version {version} (crc {crc:#06x}); skipping upload");
            false
        }
        (Ok(crc), Ok(version)) => {
            log::info!(
                "Node {node_id} firmware mismatch (crc {crc:#06x} != {expected_crc:#06x}, version {version} != {expected_version}); upload required"
            );
            true
        }
        _ => {
            log::info!("Node {node_id} did not report current firmware state; upload required");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_ccitt_false_empty_is_init_value() {
        assert_eq!(0xFFFF, Crc16Ccitt::of(&[]));
    }

    #[test]
    fn crc16_ccitt_false_known_vector() {
        // "123456789" is the standard CRC-16/CCITT-FALSE check string, expected result 0x29B1
        assert_eq!(0x29B1, Crc16Ccitt::of(b"123456789"));
    }

    #[test]
    fn crc16_incremental_matches_one_shot() {
        let data = b"the quick brown fox jumps over the lazy dog, 1234567890";
        let one_shot = Crc16Ccitt::of(data);

        let mut incremental = Crc16Ccitt::new();
        for chunk in data.chunks(7) {
            incremental.update(chunk);
        }
        assert_eq!(one_shot, incremental.finalize());
    }

    struct MockTransport {
        calls: Vec<String>,
        chunk_sizes: Vec<usize>,
        remote_crc: u16,
        remote_version: u16,
    }

    impl FirmwareTransport for MockTransport {
        async fn send_metadata(
            &mut self,
            _size: u32,
            _crc: u16,
            _image_type: ImageType,
            _target_bank: u8,
            _version: u16,
        ) -> Result<(), FwUploadError> {
            self.calls.push("metadata".into());
            Ok(())
        }

        async fn send_start_command(&mut self) -> Result<(), FwUploadError> {
            self.calls.push("start".into());
            Ok(())
        }

        async fn send_chunk(&mut self, data: &[u8]) -> Result<(), FwUploadError> {
            self.calls.push("chunk".into());
            self.chunk_sizes.push(data.len());
            Ok(())
        }

        async fn send_finalize_request(&mut self, _crc: u16) -> Result<(), FwUploadError> {
            self.calls.push("finalize".into());
            Ok(())
        }

        async fn query_remote_crc(&mut self) -> Result<u16, FwUploadError> {
            Ok(self.remote_crc)
        }

        async fn query_remote_version(&mut self) -> Result<u16, FwUploadError> {
            Ok(self.remote_version)
        }
    }

    #[tokio::test]
    async fn chunking_matches_expected_sizes() {
        let data = vec![0xAAu8; 3172];
        let plan = UploadPlan::new("fw.bin", 5, ImageType::Main, 1, 1);
        let mut transport = MockTransport {
            calls: Vec::new(),
            chunk_sizes: Vec::new(),
            remote_crc: 0,
            remote_version: 0,
        };

        upload_firmware(&mut transport, &plan, &data).await.unwrap();

        let mut expected = vec![256usize; 12];
        expected.push(100);
        assert_eq!(expected, transport.chunk_sizes);
        assert_eq!(
            vec!["metadata", "start", "chunk", "chunk", "chunk", "chunk", "chunk", "chunk",
                 "chunk", "chunk", "chunk", "chunk", "chunk", "chunk", "finalize"],
            transport.calls
        );
    }

    #[tokio::test]
    async fn matching_crc_and_version_skips_upload() {
        let mut transport = MockTransport {
            calls: Vec::new(),
            chunk_sizes: Vec::new(),
            remote_crc: 0x29B1,
            remote_version: 7,
        };

        assert!(!needs_upload(&mut transport, 5, 0x29B1, 7).await);
    }

    #[tokio::test]
    async fn mismatched_version_forces_upload() {
        let mut transport = MockTransport {
            calls: Vec::new(),
            chunk_sizes: Vec::new(),
            remote_crc: 0x29B1,
            remote_version: 6,
        };

        assert!(needs_upload(&mut transport, 5, 0x29B1, 7).await);
    }
}
