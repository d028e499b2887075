//! The local virtual network interface.
//!
//! One [InterfaceBridge] exists per daemon. The TUN device behind it is
//! created on first use, under a lock, and kept for the life of the process.

use std::{net::Ipv4Addr, pin::Pin};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{watch, Mutex, OnceCell},
};
use tracing::info;

use crate::daemon::error::DaemonError;

/// Packet size the interface is configured for.
pub const DEFAULT_MTU: u16 = 1420;

pub type DeviceReader = Pin<Box<dyn AsyncRead + Send>>;
pub type DeviceWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Creates the device backing a bridge.
pub type DeviceFactory =
    Box<dyn Fn(&InterfaceConfig) -> Result<InterfaceHandle, DaemonError> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    pub name: String,
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub mtu: u16,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            name: "skypier0".to_string(),
            address: Ipv4Addr::new(10, 1, 1, 1),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            destination: Ipv4Addr::new(10, 1, 1, 2),
            mtu: DEFAULT_MTU,
        }
    }
}

/// An open device, split so that reads and writes never wait on each other.
pub struct InterfaceHandle {
    reader: Mutex<DeviceReader>,
    writer: Mutex<DeviceWriter>,
}

impl InterfaceHandle {
    pub fn new<D>(device: D) -> Self
    where
        D: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(device);
        Self {
            reader: Mutex::new(Box::pin(reader)),
            writer: Mutex::new(Box::pin(writer)),
        }
    }
}

/// Opens a TUN device as described by `config`.
pub fn create_tun(config: &InterfaceConfig) -> Result<InterfaceHandle, DaemonError> {
    let mut tun_config = tun::configure();
    tun_config
        .name(&config.name)
        .address(config.address)
        .netmask(config.netmask)
        .destination(config.destination)
        .mtu(config.mtu.into())
        .up();

    #[cfg(target_os = "linux")]
    tun_config.platform(|platform_config| {
        platform_config.packet_information(false);
    });

    let device = tun::create_as_async(&tun_config)?;
    info!(name = %config.name, address = %config.address, mtu = config.mtu, "created TUN device");
    Ok(InterfaceHandle::new(device))
}

pub struct InterfaceBridge {
    config: InterfaceConfig,
    factory: DeviceFactory,
    handle: OnceCell<InterfaceHandle>,
    ready: watch::Sender<bool>,
}

impl InterfaceBridge {
    /// A bridge backed by a real TUN device.
    pub fn new(config: InterfaceConfig) -> Self {
        Self::with_factory(config, Box::new(create_tun))
    }

    pub fn with_factory(config: InterfaceConfig, factory: DeviceFactory) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            config,
            factory,
            handle: OnceCell::new(),
            ready,
        }
    }

    pub fn mtu(&self) -> usize {
        self.config.mtu as usize
    }

    pub fn is_created(&self) -> bool {
        self.handle.initialized()
    }

    /// Returns the device, creating it if this is the first call. Concurrent
    /// callers wait for the one creation in flight.
    pub async fn create(&self) -> Result<&InterfaceHandle, DaemonError> {
        let handle = self
            .handle
            .get_or_try_init(|| async { (self.factory)(&self.config) })
            .await?;
        self.ready.send_replace(true);
        Ok(handle)
    }

    /// Waits until some caller has created the device.
    pub async fn created(&self) -> &InterfaceHandle {
        let mut ready = self.ready.subscribe();
        loop {
            if let Some(handle) = self.handle.get() {
                return handle;
            }
            // The sender lives in `self`, so the channel cannot close here.
            if ready.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Reads one packet. Blocks until the device exists and has a packet.
    pub async fn read(&self, buffer: &mut [u8]) -> Result<usize, DaemonError> {
        let handle = self.created().await;
        let mut reader = handle.reader.lock().await;
        Ok(reader.read(buffer).await?)
    }

    /// Injects one complete packet, creating the device if needed.
    pub async fn write(&self, packet: &[u8]) -> Result<usize, DaemonError> {
        let handle = self.create().await?;
        let mut writer = handle.writer.lock().await;
        let written = writer.write(packet).await?;
        writer.flush().await?;
        Ok(written)
    }
}
