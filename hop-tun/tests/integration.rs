//! Integration tests for hop-tun

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Mutex;

use async_trait::async_trait;
use hop_tun::{Error, InterfaceConfig, InterfaceConfigurator, Result, Route, TunnelInterface};

/// Keeps the interfaces it was asked to create
#[derive(Default)]
struct MemoryConfigurator {
    active: Mutex<Option<TunnelInterface>>,
    fail: bool,
}

#[async_trait]
impl InterfaceConfigurator for MemoryConfigurator {
    async fn establish(&self, config: &InterfaceConfig) -> Result<TunnelInterface> {
        if self.fail {
            return Err(Error::Setup("no tun device available".into()));
        }
        let iface = TunnelInterface::new(None, config.clone());
        // replaces any previous interface
        *self.active.lock().unwrap() = Some(iface.clone());
        Ok(iface)
    }

    async fn release(&self, interface: &TunnelInterface) -> Result<()> {
        let mut active = self.active.lock().unwrap();
        if active.as_ref() == Some(interface) {
            *active = None;
        }
        Ok(())
    }
}

fn sample_config(session: &str) -> InterfaceConfig {
    InterfaceConfig::builder()
        .session(session)
        .ipv4_netmask(Ipv4Addr::new(10, 41, 0, 6), Ipv4Addr::new(255, 255, 248, 0))
        .mtu(1500)
        .route(Route::from_netmask(Ipv4Addr::new(0, 0, 0, 0), Ipv4Addr::new(128, 0, 0, 0)).unwrap())
        .route(Route::from_netmask(Ipv4Addr::new(128, 0, 0, 0), Ipv4Addr::new(128, 0, 0, 0)).unwrap())
        .dns(IpAddr::V4(Ipv4Addr::new(10, 41, 0, 1)))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_establish_and_release() {
    let configurator = MemoryConfigurator::default();
    let iface = configurator.establish(&sample_config("gw1")).await.unwrap();

    assert_eq!(iface.name, "tun-gw1");
    assert_eq!(iface.address.to_string(), "10.41.0.6/21");
    assert_eq!(iface.config.routes.len(), 2);

    configurator.release(&iface).await.unwrap();
    assert!(configurator.active.lock().unwrap().is_none());
}

#[tokio::test]
async fn test_establish_replaces_previous_interface() {
    let configurator = MemoryConfigurator::default();
    let first = configurator.establish(&sample_config("gw1")).await.unwrap();
    let second = configurator.establish(&sample_config("gw2")).await.unwrap();

    // releasing the stale handle leaves the current one alone
    configurator.release(&first).await.unwrap();
    assert_eq!(configurator.active.lock().unwrap().as_ref(), Some(&second));
}

#[tokio::test]
async fn test_establish_failure_is_reported() {
    let configurator = MemoryConfigurator {
        fail: true,
        ..Default::default()
    };
    let err = configurator.establish(&sample_config("gw1")).await.unwrap_err();
    assert!(matches!(err, Error::Setup(_)));
}

#[test]
fn test_requested_name_is_kept() {
    let mut config = sample_config("gw1");
    config.name = Some("gatehop0".into());
    assert_eq!(TunnelInterface::new(None, config.clone()).name, "gatehop0");
    assert_eq!(TunnelInterface::new(Some("utun7".into()), config).name, "utun7");
}
