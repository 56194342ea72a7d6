//! Collaborator traits at the edges of the protocol engine

use crate::PlatformResult;

/// Common interface of every external collaborator
///
/// Collaborators are owned by the engine for the lifetime of a session.
pub trait Collaborator: Send + Sync {
    /// Unique collaborator identifier
    fn id(&self) -> &'static str;

    /// Human readable description
    fn description(&self) -> &'static str;

    /// Prepare the collaborator before first use
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying resource cannot be opened
    fn init(&mut self) -> PlatformResult<()> {
        Ok(())
    }

    /// Release the collaborator
    ///
    /// # Errors
    ///
    /// Returns an error if shutdown fails
    fn shutdown(&mut self) -> PlatformResult<()> {
        Ok(())
    }
}

/// Result of running an AKA challenge against a credential source
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum VectorResponse {
    /// Challenge accepted
    Success {
        /// RES (4 to 16 bytes)
        res: Vec<u8>,
        /// Cipher key CK (16 bytes)
        ck: Vec<u8>,
        /// Integrity key IK (16 bytes)
        ik: Vec<u8>,
    },
    /// Sequence number out of range, network must resynchronise
    SyncFailure {
        /// AUTS (14 bytes)
        auts: Vec<u8>,
    },
}

impl VectorResponse {
    /// Returns `true` for a resynchronisation answer
    pub fn is_sync_failure(&self) -> bool {
        matches!(self, VectorResponse::SyncFailure { .. })
    }
}

/// Source of authentication vectors (SIM, smartcard, remote server, Milenage)
#[async_trait::async_trait]
pub trait AuthVectorProvider: Collaborator {
    /// Run the AKA algorithm for a challenge
    ///
    /// # Arguments
    ///
    /// * `rand` - Network challenge RAND
    /// * `autn` - Network authentication token AUTN
    ///
    /// # Errors
    ///
    /// Returns an error if the credential source failed or rejected AUTN
    async fn resolve(&self, rand: &[u8; 16], autn: &[u8; 16]) -> PlatformResult<VectorResponse>;

    /// Permanent subscriber identity (IMSI digits), if the source knows it
    async fn imsi(&self) -> PlatformResult<String> {
        Err(crate::PlatformError::NotImplemented(
            "identity query".to_string(),
        ))
    }
}

/// Local packet device (TUN interface or an in-memory stand-in)
#[async_trait::async_trait]
pub trait PacketDevice: Collaborator {
    /// Read one IP packet into `buf`, returning its length
    ///
    /// # Errors
    ///
    /// Returns an error if the device is closed
    async fn read_packet(&self, buf: &mut [u8]) -> PlatformResult<usize>;

    /// Write one IP packet to the device
    ///
    /// # Errors
    ///
    /// Returns an error if the device is closed
    async fn write_packet(&self, packet: &[u8]) -> PlatformResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProvider;

    impl Collaborator for FixedProvider {
        fn id(&self) -> &'static str {
            "fixed"
        }

        fn description(&self) -> &'static str {
            "Fixed vector provider"
        }
    }

    #[async_trait::async_trait]
    impl AuthVectorProvider for FixedProvider {
        async fn resolve(
            &self,
            rand: &[u8; 16],
            _autn: &[u8; 16],
        ) -> PlatformResult<VectorResponse> {
            if rand[0] == 0xff {
                return Ok(VectorResponse::SyncFailure { auts: vec![0; 14] });
            }
            Ok(VectorResponse::Success {
                res: rand[..8].to_vec(),
                ck: vec![1; 16],
                ik: vec![2; 16],
            })
        }
    }

    #[test]
    fn test_collaborator_defaults() {
        let mut provider = FixedProvider;
        assert_eq!(provider.id(), "fixed");
        assert!(provider.init().is_ok());
        assert!(provider.shutdown().is_ok());
    }

    #[tokio::test]
    async fn test_provider_resolve() {
        let provider = FixedProvider;
        let resp = provider.resolve(&[7; 16], &[0; 16]).await.unwrap();
        assert_eq!(
            resp,
            VectorResponse::Success {
                res: vec![7; 8],
                ck: vec![1; 16],
                ik: vec![2; 16],
            }
        );

        let resp = provider.resolve(&[0xff; 16], &[0; 16]).await.unwrap();
        assert!(resp.is_sync_failure());
    }

    #[tokio::test]
    async fn test_default_imsi_not_implemented() {
        let provider = FixedProvider;
        assert!(provider.imsi().await.is_err());
    }
}
