//! Host collaborators a session needs: channel construction, interface
//! provisioning, socket protection and the trust anchor

use crate::channel::{ChannelFactory, NoProtection, SocketProtector};
use crate::config::Config;
use crate::crypto::TrustAnchor;
use crate::error::Result;
use crate::tunnel::InterfaceProvisioner;
use std::sync::Arc;

#[derive(Clone)]
pub struct Platform {
    pub channels: Arc<dyn ChannelFactory>,
    pub provisioner: Arc<dyn InterfaceProvisioner>,
    pub protector: Arc<dyn SocketProtector>,
    pub trust: Arc<TrustAnchor>,
}

impl Platform {
    /// Unprotected sockets, webpki roots
    pub fn new(
        channels: Arc<dyn ChannelFactory>,
        provisioner: Arc<dyn InterfaceProvisioner>,
    ) -> Self {
        Self {
            channels,
            provisioner,
            protector: Arc::new(NoProtection),
            trust: Arc::new(TrustAnchor::webpki_roots()),
        }
    }

    pub fn with_protector(mut self, protector: Arc<dyn SocketProtector>) -> Self {
        self.protector = protector;
        self
    }

    pub fn with_trust(mut self, trust: TrustAnchor) -> Self {
        self.trust = Arc::new(trust);
        self
    }

    /// Trust anchor and socket protection as configured
    ///
    /// Loads `gateway.ca_cert_path` when set; on Linux a `network.fwmark`
    /// selects [`FwMarkProtector`](crate::channel::transport::FwMarkProtector).
    ///
    /// # Errors
    ///
    /// Fails when `config` does not validate or the trust anchor cannot be
    /// loaded.
    pub fn from_config(
        config: &Config,
        channels: Arc<dyn ChannelFactory>,
        provisioner: Arc<dyn InterfaceProvisioner>,
    ) -> Result<Self> {
        config.validate()?;
        let mut platform = Self::new(channels, provisioner);

        if let Some(path) = &config.gateway.ca_cert_path {
            let trust = TrustAnchor::from_file(path)?;
            log::info!("Loaded {} trust anchor certificate(s) from {path}", trust.len());
            platform = platform.with_trust(trust);
        }

        #[cfg(target_os = "linux")]
        {
            if let Some(mark) = config.network.fwmark {
                log::debug!("Protecting tunnel sockets with fwmark {mark:#x}");
                platform = platform.with_protector(Arc::new(
                    crate::channel::transport::FwMarkProtector::new(mark),
                ));
            }
        }

        #[cfg(not(target_os = "linux"))]
        {
            if config.network.fwmark.is_some() {
                log::warn!("fwmark protection is only available on Linux; ignoring");
            }
        }

        Ok(platform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ScriptedFactory;
    use crate::tunnel::MemoryProvisioner;

    #[test]
    fn test_from_config_loads_trust_anchor() {
        let (factory, _gateways) = ScriptedFactory::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ca.pem");
        std::fs::write(&path, crate::crypto::tls::tests::TEST_ROOT_PEM).unwrap();

        let mut config = Config::for_gateway("127.0.0.1", 4433);
        config.gateway.ca_cert_path = Some(path.to_string_lossy().into_owned());

        let platform = Platform::from_config(
            &config,
            Arc::new(factory),
            Arc::new(MemoryProvisioner::new()),
        )
        .unwrap();
        assert_eq!(platform.trust.len(), 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let (factory, _gateways) = ScriptedFactory::new();
        let mut config = Config::for_gateway("127.0.0.1", 4433);
        config.tunnel.idle_interval_ms = 0;

        let result = Platform::from_config(
            &config,
            Arc::new(factory),
            Arc::new(MemoryProvisioner::new()),
        );
        assert!(matches!(result, Err(crate::VpnError::Config(_))));
    }

    #[test]
    fn test_missing_trust_anchor_fails() {
        let (factory, _gateways) = ScriptedFactory::new();
        let mut config = Config::for_gateway("127.0.0.1", 4433);
        config.gateway.ca_cert_path = Some("/nonexistent/ca.pem".into());

        let result = Platform::from_config(
            &config,
            Arc::new(factory),
            Arc::new(MemoryProvisioner::new()),
        );
        assert!(result.is_err());
    }
}
